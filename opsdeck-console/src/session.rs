use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use opsdeck_core::envelope::{Direction, Envelope};
use opsdeck_core::time::now_rfc3339_millis;

use crate::client::ClientRegistry;
use crate::error::ConsoleError;
use crate::metrics::Metrics;
use crate::replay::{OutputChunk, ReplayBuffer, DEFAULT_MAX_BYTES, DEFAULT_MAX_CHUNKS};
use crate::transcript::{TranscriptEntry, TranscriptWriter};

const CPR_QUERY: &[u8] = b"\x1b[6n";
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

/// Why a session ended. Rendered into the final transcript entry and
/// the closing status envelope as `closed:<reason>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientRequested,
    IdleTimeout,
    TtlExpired,
    PanicStop,
    InternalError,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientRequested => "client_requested",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::TtlExpired => "ttl_expired",
            CloseReason::PanicStop => "panic_stop",
            CloseReason::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sent to the manager when a session finishes closing.
#[derive(Debug, Clone)]
pub struct ClosedNotice {
    pub session_id: String,
    pub reason: CloseReason,
}

/// Per-session knobs resolved from the service configuration.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub ttl: Duration,
    pub panic_grace: Duration,
    pub read_buffer_bytes: usize,
    pub tty_rows: u16,
    pub tty_cols: u16,
    pub transcript_path: PathBuf,
    pub working_dir: Option<PathBuf>,
}

/// Creation request as accepted over HTTP.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub operator: Option<String>,
    pub reason: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub created_at: String,
    pub expires_at: String,
    pub last_activity: String,
    pub command: String,
    pub args: Vec<String>,
    pub state: String,
}

/// One child process attached to a PTY. Owns the transcript, the
/// replay buffer and the attached clients; three background
/// activities (PTY pump, exit waiter, transcript flusher) plus the
/// TTL timer are tied to one close-once guard.
pub struct Session {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    dims: StdMutex<(u16, u16)>,
    master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    writer: StdMutex<Option<Box<dyn Write + Send>>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    child_exited: Arc<AtomicBool>,
    transcript: Arc<TranscriptWriter>,
    pub replay: Arc<ReplayBuffer>,
    pub clients: Arc<ClientRegistry>,
    input_seqs: StdMutex<HashMap<String, u64>>,
    close_once: AtomicBool,
    close_reason: StdMutex<Option<CloseReason>>,
    done: Notify,
    panic_grace: Duration,
    metrics: Arc<Metrics>,
    closed_tx: mpsc::UnboundedSender<ClosedNotice>,
}

impl Session {
    /// Spawn the child on a fresh PTY and start the background
    /// activities. Construction failure releases everything already
    /// allocated; the caller only has to release its slot.
    pub fn spawn(
        id: String,
        request: SpawnRequest,
        settings: SessionSettings,
        metrics: Arc<Metrics>,
        closed_tx: mpsc::UnboundedSender<ClosedNotice>,
    ) -> Result<Arc<Self>, ConsoleError> {
        if request.command.trim().is_empty() {
            return Err(ConsoleError::validation("command must not be empty"));
        }

        let transcript = Arc::new(TranscriptWriter::open(
            &settings.transcript_path,
            metrics.clone(),
        )?);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: settings.tty_rows,
                cols: settings.tty_cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| {
                transcript.close();
                ConsoleError::internal(format!("openpty: {err}"))
            })?;

        let command_line = render_command_line(&request.command, &request.args);
        let mut builder = CommandBuilder::new(&request.command);
        builder.args(&request.args);
        builder.env("OPSDECK_SESSION_ID", &id);
        builder.env("OPSDECK_COMMAND", &command_line);
        if std::env::var("TERM").is_err() {
            builder.env("TERM", "xterm-256color");
        }
        if let Some(dir) = settings.working_dir.as_ref() {
            builder.cwd(dir);
        }

        let child = pair.slave.spawn_command(builder).map_err(|err| {
            transcript.close();
            ConsoleError::internal(format!("spawn {}: {err}", request.command))
        })?;
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(|err| {
            transcript.close();
            ConsoleError::internal(format!("clone pty reader: {err}"))
        })?;
        let writer = pair.master.take_writer().map_err(|err| {
            transcript.close();
            ConsoleError::internal(format!("take pty writer: {err}"))
        })?;
        let killer = child.clone_killer();

        let now = Utc::now();
        let session = Arc::new(Self {
            id: id.clone(),
            command: request.command.clone(),
            args: request.args.clone(),
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(settings.ttl)
                    .unwrap_or_else(|_| chrono::Duration::hours(4)),
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            dims: StdMutex::new((settings.tty_rows, settings.tty_cols)),
            master: StdMutex::new(Some(pair.master)),
            writer: StdMutex::new(Some(writer)),
            killer: StdMutex::new(killer),
            child_exited: Arc::new(AtomicBool::new(false)),
            transcript,
            replay: Arc::new(ReplayBuffer::new(DEFAULT_MAX_CHUNKS, DEFAULT_MAX_BYTES)),
            clients: Arc::new(ClientRegistry::new()),
            input_seqs: StdMutex::new(HashMap::new()),
            close_once: AtomicBool::new(false),
            close_reason: StdMutex::new(None),
            done: Notify::new(),
            panic_grace: settings.panic_grace,
            metrics,
            closed_tx,
        });

        let metadata = request
            .metadata
            .as_ref()
            .map(|value| value.to_string())
            .unwrap_or_else(|| "-".to_string());
        session.transcript.append(&TranscriptEntry::status(format!(
            "session_started command={command_line} operator={} reason={} metadata={metadata}",
            request.operator.as_deref().unwrap_or("-"),
            request.reason.as_deref().unwrap_or("-"),
        )));
        session.metrics.session_created();

        let pump = session.start_pump(reader, settings.read_buffer_bytes.max(512));
        session.start_exit_waiter(child, command_line, pump);
        session.start_flusher();
        session.start_ttl_timer(settings.ttl);

        info!(event = "session_created", session_id = %id, command = %session.command);
        Ok(session)
    }

    pub fn is_closed(&self) -> bool {
        self.close_once.load(Ordering::SeqCst)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock().expect("close reason lock")
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::SeqCst);
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }

    /// Record activity now. The idle sweeper reads this on its next
    /// scan.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at.to_rfc3339(),
            expires_at: self.expires_at.to_rfc3339(),
            last_activity: self.last_activity().to_rfc3339(),
            command: self.command.clone(),
            args: self.args.clone(),
            state: "active".to_string(),
        }
    }

    /// Write client keystrokes to the PTY unless the per-source
    /// sequence number shows a duplicate delivery. Returns whether the
    /// bytes reached the PTY.
    pub fn handle_input(&self, bytes: &[u8], seq: u64, source: &str) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut seqs = self.input_seqs.lock().expect("input seq lock");
            if let Some(&last) = seqs.get(source) {
                if seq <= last {
                    debug!(event = "input_replayed", session_id = %self.id, source = source, seq = seq);
                    return false;
                }
            }
            seqs.insert(source.to_string(), seq);
        }
        if !self.write_pty(bytes) {
            return false;
        }
        self.touch();
        self.transcript.append(&TranscriptEntry::bytes(
            Direction::Stdin,
            BASE64.encode(bytes),
        ));
        true
    }

    /// Update the PTY window size and remember it for cursor-position
    /// report replies.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), ConsoleError> {
        if cols == 0 || rows == 0 {
            return Err(ConsoleError::validation("resize values must be positive"));
        }
        let master = self.master.lock().expect("master lock");
        let Some(master) = master.as_ref() else {
            return Err(ConsoleError::Conflict("session is closed".to_string()));
        };
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| ConsoleError::internal(format!("resize: {err}")))?;
        *self.dims.lock().expect("dims lock") = (rows, cols);
        self.touch();
        Ok(())
    }

    /// Idempotent teardown. The first caller wins; every later call is
    /// a no-op. Exactly one `closed:<reason>` entry is written.
    pub fn close(&self, reason: CloseReason) {
        if self.close_once.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.close_reason.lock().expect("close reason lock") = Some(reason);
        self.done.notify_waiters();

        // Interrupt the foreground group, then close the PTY so the
        // pump exits on EOF.
        self.write_pty_raw(&[0x03]);
        {
            let mut writer = self.writer.lock().expect("writer lock");
            *writer = None;
        }
        {
            let mut master = self.master.lock().expect("master lock");
            *master = None;
        }

        // Escalate to SIGKILL after the grace period if the child is
        // still alive.
        let exited = self.child_exited.clone();
        let grace = self.panic_grace;
        let session_id = self.id.clone();
        let killer = {
            let guard = self.killer.lock().expect("killer lock");
            guard.clone_killer()
        };
        std::thread::spawn(move || {
            std::thread::sleep(grace);
            if !exited.load(Ordering::SeqCst) {
                let mut killer = killer;
                warn!(event = "session_force_kill", session_id = %session_id);
                let _ = killer.kill();
            }
        });

        // Durable transcript close before the closed status reaches
        // any client.
        let status = format!("closed:{reason}");
        self.transcript.append(&TranscriptEntry::status(status.clone()));
        self.transcript.close();

        self.clients.broadcast(&Envelope::new(
            "status",
            json!({ "message": status, "ts": now_rfc3339_millis() }),
        ));
        self.clients.close_all();

        self.metrics.session_closed();
        let _ = self.closed_tx.send(ClosedNotice {
            session_id: self.id.clone(),
            reason,
        });
        info!(event = "session_closed", session_id = %self.id, reason = %reason);
    }

    fn write_pty(&self, bytes: &[u8]) -> bool {
        self.write_pty_raw(bytes)
    }

    fn write_pty_raw(&self, bytes: &[u8]) -> bool {
        let mut writer = self.writer.lock().expect("writer lock");
        let Some(writer) = writer.as_mut() else {
            return false;
        };
        if writer.write_all(bytes).is_err() {
            return false;
        }
        let _ = writer.flush();
        true
    }

    fn start_pump(
        self: &Arc<Self>,
        mut reader: Box<dyn Read + Send>,
        buffer_size: usize,
    ) -> tokio::task::JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; buffer_size];
            loop {
                let read = match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(count) => count,
                    Err(err) => {
                        debug!(event = "pty_read_error", session_id = %session.id, error = %err);
                        break;
                    }
                };
                session.pump_chunk(&buffer[..read]);
            }
            session.close(CloseReason::ClientRequested);
        })
    }

    fn pump_chunk(&self, raw: &[u8]) {
        if raw
            .windows(CPR_QUERY.len())
            .any(|window| window == CPR_QUERY)
        {
            let (rows, cols) = *self.dims.lock().expect("dims lock");
            let reply = format!("\x1b[{rows};{cols}R");
            self.write_pty_raw(reply.as_bytes());
        }

        let encoded = BASE64.encode(raw);
        let ts = now_rfc3339_millis();
        self.transcript
            .append(&TranscriptEntry::bytes(Direction::Stdout, encoded.clone()));
        let chunk = OutputChunk {
            data: encoded,
            encoding: "base64".to_string(),
            dir: Direction::Stdout.as_str().to_string(),
            ts,
        };
        self.replay.append(chunk.clone(), raw.len());
        self.clients.broadcast(&Envelope::new(
            "output",
            serde_json::to_value(&chunk).unwrap_or_default(),
        ));
    }

    fn start_exit_waiter(
        self: &Arc<Self>,
        mut child: Box<dyn portable_pty::Child + Send + Sync>,
        command_line: String,
        pump: tokio::task::JoinHandle<()>,
    ) {
        let (exit_tx, exit_rx) = oneshot::channel::<i32>();
        let exited = self.child_exited.clone();
        std::thread::spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(_) => -1,
            };
            exited.store(true, Ordering::SeqCst);
            let _ = exit_tx.send(code);
        });

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let code = exit_rx.await.unwrap_or(-1);
            if code != 0 {
                session.transcript.append(&TranscriptEntry::status(format!(
                    "command_exit_error code={code} command={command_line}"
                )));
            }
            // Give the pump a bounded chance to drain the PTY to EOF
            // before the close drops the master side.
            let _ = tokio::time::timeout(Duration::from_millis(500), pump).await;
            session.close(CloseReason::ClientRequested);
        });
    }

    fn start_flusher(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                let notified = session.done.notified();
                if session.is_closed() {
                    return;
                }
                tokio::select! {
                    _ = notified => return,
                    _ = ticker.tick() => session.transcript.flush(false),
                }
            }
        });
    }

    fn start_ttl_timer(self: &Arc<Self>, ttl: Duration) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let notified = session.done.notified();
            if session.is_closed() {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(ttl) => session.close(CloseReason::TtlExpired),
            }
        });
    }
}

pub fn render_command_line(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", args.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn settings(dir: &tempfile::TempDir, id: &str) -> SessionSettings {
        SessionSettings {
            ttl: Duration::from_secs(60),
            panic_grace: Duration::from_millis(600),
            read_buffer_bytes: 4096,
            tty_rows: 24,
            tty_cols: 80,
            transcript_path: dir.path().join(format!("{id}.ndjson")),
            working_dir: None,
        }
    }

    fn spawn_echo(
        dir: &tempfile::TempDir,
        closed_tx: mpsc::UnboundedSender<ClosedNotice>,
    ) -> Arc<Session> {
        Session::spawn(
            "sess-echo".to_string(),
            SpawnRequest {
                command: "/bin/echo".to_string(),
                args: vec!["hello".to_string()],
                ..Default::default()
            },
            settings(dir, "sess-echo"),
            Arc::new(Metrics::new()),
            closed_tx,
        )
        .expect("spawn echo")
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[test]
    fn empty_command_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = Session::spawn(
            "sess-0".to_string(),
            SpawnRequest::default(),
            settings(&dir, "sess-0"),
            Arc::new(Metrics::new()),
            tx,
        )
        .err()
        .expect("must fail");
        assert!(matches!(err, ConsoleError::Validation(_)));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echo_output_reaches_replay_and_session_self_closes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = spawn_echo(&dir, tx);

        let replay = session.replay.clone();
        let seen = wait_until(Duration::from_secs(2), move || {
            replay.snapshot().chunks.iter().any(|chunk| {
                BASE64
                    .decode(&chunk.data)
                    .map(|raw| String::from_utf8_lossy(&raw).contains("hello"))
                    .unwrap_or(false)
            })
        })
        .await;
        assert!(seen, "echo output never reached the replay buffer");

        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("close notice timeout")
            .expect("close notice");
        assert_eq!(notice.session_id, "sess-echo");
        assert_eq!(notice.reason, CloseReason::ClientRequested);

        let transcript =
            std::fs::read_to_string(dir.path().join("sess-echo.ndjson")).expect("transcript");
        let last = transcript.lines().last().expect("non-empty transcript");
        assert!(last.contains("closed:client_requested"));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_is_idempotent_and_escalates_on_stubborn_child() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Session::spawn(
            "sess-sleep".to_string(),
            SpawnRequest {
                command: "/bin/sleep".to_string(),
                args: vec!["60".to_string()],
                ..Default::default()
            },
            settings(&dir, "sess-sleep"),
            Arc::new(Metrics::new()),
            tx,
        )
        .expect("spawn sleep");

        session.close(CloseReason::PanicStop);
        session.close(CloseReason::TtlExpired);
        assert_eq!(session.close_reason(), Some(CloseReason::PanicStop));

        // First notice carries the winning reason; the child exit path
        // must not produce a second one.
        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("close notice timeout")
            .expect("close notice");
        assert_eq!(notice.reason, CloseReason::PanicStop);
        assert!(
            tokio::time::timeout(Duration::from_millis(300), rx.recv())
                .await
                .is_err(),
            "close must notify exactly once"
        );

        let transcript =
            std::fs::read_to_string(dir.path().join("sess-sleep.ndjson")).expect("transcript");
        assert_eq!(transcript.matches("closed:").count(), 1);
        assert!(transcript.contains("closed:panic_stop"));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn input_sequence_dedup_drops_non_increasing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::spawn(
            "sess-cat".to_string(),
            SpawnRequest {
                command: "/bin/cat".to_string(),
                args: vec![],
                ..Default::default()
            },
            settings(&dir, "sess-cat"),
            Arc::new(Metrics::new()),
            tx,
        )
        .expect("spawn cat");

        assert!(session.handle_input(b"a", 1, "tab-1"));
        assert!(session.handle_input(b"b", 2, "tab-1"));
        assert!(!session.handle_input(b"b", 2, "tab-1"));
        assert!(!session.handle_input(b"a", 1, "tab-1"));
        // Independent source keeps its own counter.
        assert!(session.handle_input(b"c", 1, "tab-2"));
        assert!(session.handle_input(b"d", 9, "tab-1"));

        session.close(CloseReason::ClientRequested);
        assert!(!session.handle_input(b"e", 10, "tab-1"));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resize_validates_dimensions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::spawn(
            "sess-resize".to_string(),
            SpawnRequest {
                command: "/bin/sleep".to_string(),
                args: vec!["5".to_string()],
                ..Default::default()
            },
            settings(&dir, "sess-resize"),
            Arc::new(Metrics::new()),
            tx,
        )
        .expect("spawn sleep");

        assert!(session.resize(0, 24).is_err());
        assert!(session.resize(80, 0).is_err());
        session.resize(132, 43).expect("resize");
        assert_eq!(*session.dims.lock().expect("dims"), (43, 132));
        session.close(CloseReason::ClientRequested);
    }
}
