use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Request, State,
    },
    http::{header::HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use opsdeck_core::envelope::Envelope;
use opsdeck_core::ids::new_id;

use crate::client::{SessionClient, DEFAULT_CLIENT_QUEUE};
use crate::error::ConsoleError;
use crate::manager::SessionManager;
use crate::metrics::Metrics;
use crate::session::{CloseReason, Session, SpawnRequest};
use crate::workspace::{Tab, ToolbarMode, WorkspaceEvent, WorkspaceStore};

const WS_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const BINARY_INPUT_MARKER: u8 = 0x01;

pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub workspace: Arc<WorkspaceStore>,
    pub metrics: Arc<Metrics>,
    pub expect_proxy: bool,
}

impl IntoResponse for ConsoleError {
    fn into_response(self) -> Response {
        let status = match &self {
            ConsoleError::Validation(_) => StatusCode::BAD_REQUEST,
            ConsoleError::NotFound(_) => StatusCode::NOT_FOUND,
            ConsoleError::Conflict(_) => StatusCode::CONFLICT,
            ConsoleError::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
            ConsoleError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "message": self.to_string() }))).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route(
            "/api/v1/workspace",
            get(get_workspace).put(put_workspace).patch(patch_workspace),
        )
        .route("/api/v1/workspace/stream", get(workspace_stream))
        .route("/api/v1/workspace/tabs", post(add_tab))
        .route(
            "/api/v1/workspace/tabs/:id",
            delete(remove_tab).patch(update_tab),
        )
        .route(
            "/api/v1/sessions",
            post(create_session).get(list_sessions).delete(close_all),
        )
        .route(
            "/api/v1/sessions/:id",
            get(get_session).delete(close_session),
        )
        .route("/api/v1/sessions/:id/panic", post(panic_session))
        .route("/api/v1/sessions/:id/stream", get(session_stream))
        .layer(middleware::from_fn_with_state(state.clone(), proxy_guard))
        .with_state(state)
}

/// Reject requests that did not arrive through the fronting proxy.
/// Liveness and metrics bypass so probes keep working.
async fn proxy_guard(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    if state.expect_proxy && path != "/healthz" && path != "/metrics" {
        let headers = request.headers();
        if !headers.contains_key("x-forwarded-for") || !headers.contains_key("x-forwarded-proto")
        {
            warn!(event = "proxy_guard_reject", path = path);
            return (
                StatusCode::FORBIDDEN,
                Json(json!({ "message": "direct access is not allowed" })),
            )
                .into_response();
        }
    }
    next.run(request).await
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        [(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        state.metrics.render(),
    )
        .into_response()
}

// ---- workspace ----

async fn get_workspace(State(state): State<Arc<AppState>>) -> Response {
    Json(state.workspace.get_state()).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReplaceWorkspaceBody {
    #[serde(default)]
    active_tab_id: String,
    #[serde(default)]
    tabs: Vec<Tab>,
}

async fn put_workspace(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReplaceWorkspaceBody>,
) -> Result<Response, ConsoleError> {
    let next = state
        .workspace
        .replace_state(body.active_tab_id, body.tabs)?;
    Ok(Json(next).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PatchWorkspaceBody {
    keyboard_toolbar_mode: Option<String>,
    idle_timeout_seconds: Option<u64>,
}

async fn patch_workspace(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PatchWorkspaceBody>,
) -> Result<Response, ConsoleError> {
    if let Some(mode) = body.keyboard_toolbar_mode {
        let mode = parse_toolbar_mode(&mode)?;
        state.workspace.set_toolbar_mode(mode)?;
    }
    if let Some(seconds) = body.idle_timeout_seconds {
        state.workspace.set_idle_timeout_seconds(seconds)?;
    }
    Ok(Json(state.workspace.get_state()).into_response())
}

fn parse_toolbar_mode(raw: &str) -> Result<ToolbarMode, ConsoleError> {
    match raw {
        "disabled" => Ok(ToolbarMode::Disabled),
        "floating" => Ok(ToolbarMode::Floating),
        "top" => Ok(ToolbarMode::Top),
        other => Err(ConsoleError::validation(format!(
            "unknown keyboard toolbar mode {other}"
        ))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddTabBody {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(default)]
    color_id: String,
    session_id: Option<String>,
}

async fn add_tab(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddTabBody>,
) -> Result<Response, ConsoleError> {
    let tab = state.workspace.add_tab(body.id, body.label, body.color_id)?;
    if let Some(session_id) = body.session_id {
        state.workspace.attach_session(&tab.id, session_id)?;
    }
    Ok((StatusCode::CREATED, Json(tab)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTabBody {
    label: Option<String>,
    color_id: Option<String>,
}

async fn update_tab(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateTabBody>,
) -> Result<Response, ConsoleError> {
    let tab = state.workspace.update_tab(&id, body.label, body.color_id)?;
    Ok(Json(tab).into_response())
}

async fn remove_tab(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ConsoleError> {
    let next = state.workspace.remove_tab(&id)?;
    Ok(Json(next).into_response())
}

async fn workspace_stream(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_workspace_socket(socket, state))
}

async fn handle_workspace_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (subscriber_id, mut events) = state.workspace.subscribe();

    let snapshot = WorkspaceEvent::FullUpdate(state.workspace.get_state());
    let initial = Envelope::new(snapshot.kind(), snapshot.payload()).to_json();
    if send_text(&mut sender, initial).await.is_err() {
        state.workspace.unsubscribe(subscriber_id);
        return;
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let text = Envelope::new(event.kind(), event.payload()).to_json();
                if send_text(&mut sender, text).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                let text = Envelope::new("heartbeat", json!({})).to_json();
                if send_text(&mut sender, text).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    state.workspace.unsubscribe(subscriber_id);
}

// ---- sessions ----

#[derive(Debug, Deserialize, Default)]
struct CreateSessionBody {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    operator: Option<String>,
    reason: Option<String>,
    metadata: Option<Value>,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Response, ConsoleError> {
    let summary = state
        .manager
        .create_session(SpawnRequest {
            command: body.command,
            args: body.args,
            operator: body.operator,
            reason: body.reason,
            metadata: body.metadata,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(summary)).into_response())
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Response {
    let summaries = state.manager.list_summaries().await;
    let mut response = Json(summaries).into_response();
    if let Ok(value) = HeaderValue::from_str(&state.manager.capacity().to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-session-capacity"), value);
    }
    response
}

async fn close_all(State(state): State<Arc<AppState>>) -> Response {
    let terminated = state.manager.close_all().await;
    Json(json!({ "terminated": terminated })).into_response()
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ConsoleError> {
    let summary = state
        .manager
        .summary(&id)
        .await
        .ok_or_else(|| ConsoleError::not_found(format!("session {id} not found")))?;
    Ok(Json(summary).into_response())
}

async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ConsoleError> {
    state
        .manager
        .close_session(&id, CloseReason::ClientRequested)
        .await?;
    Ok(Json(json!({ "message": "session closing" })).into_response())
}

async fn panic_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ConsoleError> {
    state
        .manager
        .close_session(&id, CloseReason::PanicStop)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "panic stop initiated" })),
    )
        .into_response())
}

async fn session_stream(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let Some(session) = state.manager.get(&id).await else {
        return ConsoleError::not_found(format!("session {id} not found")).into_response();
    };
    ws.on_upgrade(move |socket| handle_session_socket(socket, session, state))
}

async fn handle_session_socket(socket: WebSocket, session: Arc<Session>, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let client = SessionClient::new(new_id(), DEFAULT_CLIENT_QUEUE);

    // Replay strictly precedes live traffic: the snapshot is queued
    // before the client joins the broadcast set.
    let snapshot = session.replay.snapshot();
    client.enqueue(
        Envelope::new(
            "output_replay",
            json!({ "chunks": snapshot.chunks, "truncated": snapshot.truncated }),
        )
        .to_json(),
    );
    if !session.clients.attach(client.clone()) {
        let text = Envelope::new(
            "status",
            json!({ "message": format!(
                "closed:{}",
                session
                    .close_reason()
                    .map(|r| r.as_str())
                    .unwrap_or("client_requested")
            )}),
        )
        .to_json();
        let _ = send_text(&mut sender, text).await;
        return;
    }
    state
        .metrics
        .ws_clients_connected
        .fetch_add(1, Ordering::Relaxed);
    debug!(event = "client_attached", session_id = %session.id, client_id = %client.id);

    let writer_client = client.clone();
    let write_task = tokio::spawn(async move {
        while let Some(text) = writer_client.next().await {
            if send_text(&mut sender, text).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let heartbeat_client = client.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let text = Envelope::new("heartbeat", json!({})).to_json();
            if !heartbeat_client.enqueue(text) {
                break;
            }
        }
    });

    while let Some(incoming) = receiver.next().await {
        let message = match incoming {
            Ok(message) => message,
            Err(err) => {
                debug!(event = "client_read_error", client_id = %client.id, error = %err);
                break;
            }
        };
        match message {
            Message::Text(text) => handle_client_text(&session, &text),
            Message::Binary(bytes) => handle_client_binary(&session, &bytes),
            Message::Ping(_) | Message::Pong(_) => session.touch(),
            Message::Close(_) => break,
        }
        if client.is_closed() {
            break;
        }
    }

    session.clients.detach(&client.id);
    client.close();
    heartbeat_task.abort();
    let _ = write_task.await;
    let _ = state
        .metrics
        .ws_clients_connected
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        });
    debug!(event = "client_detached", session_id = %session.id, client_id = %client.id);
}

#[derive(Debug, Deserialize)]
struct InputPayload {
    #[serde(default)]
    data: String,
    #[serde(default = "default_encoding")]
    encoding: String,
    #[serde(default)]
    seq: u64,
    #[serde(default)]
    source: String,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

#[derive(Debug, Deserialize)]
struct ResizePayload {
    cols: u16,
    rows: u16,
}

fn handle_client_text(session: &Arc<Session>, text: &str) {
    let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
        return;
    };
    match envelope.kind.as_str() {
        "input" => {
            let Ok(payload) = serde_json::from_value::<InputPayload>(envelope.payload) else {
                return;
            };
            let bytes = match payload.encoding.as_str() {
                "base64" => match BASE64.decode(payload.data.as_bytes()) {
                    Ok(bytes) => bytes,
                    Err(_) => return,
                },
                _ => payload.data.into_bytes(),
            };
            session.handle_input(&bytes, payload.seq, &payload.source);
        }
        "resize" => {
            if let Ok(payload) = serde_json::from_value::<ResizePayload>(envelope.payload) {
                if let Err(err) = session.resize(payload.cols, payload.rows) {
                    debug!(event = "resize_rejected", session_id = %session.id, error = %err);
                }
            }
        }
        "heartbeat" => session.touch(),
        _ => {}
    }
}

/// Binary input frame: 0x01, 8-byte big-endian sequence, 2-byte
/// big-endian source length, source bytes, payload. Anything else is
/// ignored.
fn handle_client_binary(session: &Arc<Session>, bytes: &[u8]) {
    if bytes.first() != Some(&BINARY_INPUT_MARKER) || bytes.len() < 11 {
        return;
    }
    let seq = u64::from_be_bytes(bytes[1..9].try_into().expect("8 bytes"));
    let source_len = u16::from_be_bytes(bytes[9..11].try_into().expect("2 bytes")) as usize;
    if bytes.len() < 11 + source_len {
        return;
    }
    let Ok(source) = std::str::from_utf8(&bytes[11..11 + source_len]) else {
        return;
    };
    let payload = &bytes[11 + source_len..];
    session.handle_input(payload, seq, source);
}

async fn send_text(
    sender: &mut SplitSink<WebSocket, Message>,
    text: String,
) -> Result<(), ()> {
    match tokio::time::timeout(WS_WRITE_TIMEOUT, sender.send(Message::Text(text))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_frame_layout_parses() {
        let mut frame = vec![BINARY_INPUT_MARKER];
        frame.extend_from_slice(&42u64.to_be_bytes());
        let source = b"tab-1";
        frame.extend_from_slice(&(source.len() as u16).to_be_bytes());
        frame.extend_from_slice(source);
        frame.extend_from_slice(b"ls\n");

        assert_eq!(frame[0], 0x01);
        let seq = u64::from_be_bytes(frame[1..9].try_into().expect("seq"));
        assert_eq!(seq, 42);
        let len = u16::from_be_bytes(frame[9..11].try_into().expect("len")) as usize;
        assert_eq!(&frame[11..11 + len], source);
        assert_eq!(&frame[11 + len..], b"ls\n");
    }

    #[test]
    fn toolbar_mode_parser_covers_the_closed_set() {
        assert_eq!(
            parse_toolbar_mode("disabled").expect("disabled"),
            ToolbarMode::Disabled
        );
        assert_eq!(
            parse_toolbar_mode("floating").expect("floating"),
            ToolbarMode::Floating
        );
        assert_eq!(parse_toolbar_mode("top").expect("top"), ToolbarMode::Top);
        assert!(parse_toolbar_mode("sideways").is_err());
    }

    #[test]
    fn input_payload_defaults_to_utf8() {
        let payload: InputPayload =
            serde_json::from_str(r#"{"data":"ls","seq":1,"source":"tab-1"}"#).expect("parse");
        assert_eq!(payload.encoding, "utf-8");
        assert_eq!(payload.data, "ls");
    }
}
