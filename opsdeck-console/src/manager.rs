use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

use opsdeck_core::ids::new_id;

use crate::config::Config;
use crate::error::ConsoleError;
use crate::metrics::Metrics;
use crate::session::{
    ClosedNotice, CloseReason, Session, SessionSettings, SessionSummary, SpawnRequest,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Counted semaphore over a bounded channel: a queued unit is a held
/// slot. Acquisition is non-blocking; a full channel is a capacity
/// error.
struct SlotPool {
    tx: mpsc::Sender<()>,
    rx: Mutex<mpsc::Receiver<()>>,
}

impl SlotPool {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn try_acquire(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }

    async fn release(&self) {
        let mut rx = self.rx.lock().await;
        let _ = rx.try_recv();
    }
}

/// Hook the manager calls when a session disappears, so any workspace
/// tab bound to it gets detached without the session layer knowing
/// about tabs.
pub trait DetachHook: Send + Sync {
    fn session_closed(&self, session_id: &str);
}

/// Global session registry, concurrency slots and the idle sweeper.
pub struct SessionManager {
    config: Config,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    slots: SlotPool,
    metrics: Arc<Metrics>,
    closed_tx: mpsc::UnboundedSender<ClosedNotice>,
    idle_timeout_seconds: Arc<AtomicU64>,
    detach_hook: RwLock<Option<Arc<dyn DetachHook>>>,
}

impl SessionManager {
    /// Build the manager and start its close-notice loop. The returned
    /// `idle_timeout_seconds` handle is shared with the workspace
    /// store, which mutates it at runtime.
    pub fn new(config: Config, metrics: Arc<Metrics>) -> Arc<Self> {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let idle_timeout_seconds =
            Arc::new(AtomicU64::new(config.idle_timeout.as_secs().max(1)));
        let manager = Arc::new(Self {
            slots: SlotPool::new(config.max_concurrent),
            sessions: RwLock::new(HashMap::new()),
            metrics,
            closed_tx,
            idle_timeout_seconds,
            detach_hook: RwLock::new(None),
            config,
        });
        manager.clone().start_closed_loop(closed_rx);
        manager.clone().start_idle_sweeper();
        manager
    }

    pub fn idle_timeout_handle(&self) -> Arc<AtomicU64> {
        self.idle_timeout_seconds.clone()
    }

    pub async fn set_detach_hook(&self, hook: Arc<dyn DetachHook>) {
        *self.detach_hook.write().await = Some(hook);
    }

    pub fn capacity(&self) -> usize {
        self.config.max_concurrent
    }

    /// Create a session, holding one concurrency slot for its
    /// lifetime. Construction failure releases the slot.
    pub async fn create_session(
        &self,
        mut request: SpawnRequest,
    ) -> Result<SessionSummary, ConsoleError> {
        if request.command.trim().is_empty() {
            request.command = self.config.default_command.clone();
            request.args = self.config.default_args.clone();
        }
        if !self.slots.try_acquire() {
            return Err(ConsoleError::capacity(format!(
                "session capacity reached ({} concurrent)",
                self.config.max_concurrent
            )));
        }

        let id = new_id();
        let settings = SessionSettings {
            ttl: self.config.session_ttl,
            panic_grace: self.config.panic_grace,
            read_buffer_bytes: self.config.read_buffer_bytes,
            tty_rows: self.config.tty_rows,
            tty_cols: self.config.tty_cols,
            transcript_path: self.transcript_path(&id),
            working_dir: self.config.working_dir.clone(),
        };

        let session = match Session::spawn(
            id.clone(),
            request,
            settings,
            self.metrics.clone(),
            self.closed_tx.clone(),
        ) {
            Ok(session) => session,
            Err(err) => {
                self.slots.release().await;
                return Err(err);
            }
        };

        let summary = session.summary();
        self.sessions.write().await.insert(id, session);
        Ok(summary)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn summary(&self, session_id: &str) -> Option<SessionSummary> {
        self.get(session_id).await.map(|session| session.summary())
    }

    pub async fn list_summaries(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<_> = sessions.values().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub async fn close_session(
        &self,
        session_id: &str,
        reason: CloseReason,
    ) -> Result<(), ConsoleError> {
        let session = self
            .get(session_id)
            .await
            .ok_or_else(|| ConsoleError::not_found(format!("session {session_id} not found")))?;
        session.close(reason);
        Ok(())
    }

    /// Close every live session with `client_requested`; returns the
    /// number of sessions terminated.
    pub async fn close_all(&self) -> usize {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let count = sessions.len();
        for session in sessions {
            session.close(CloseReason::ClientRequested);
        }
        count
    }

    fn transcript_path(&self, session_id: &str) -> PathBuf {
        self.config
            .storage_path
            .join("transcripts")
            .join(format!("{session_id}.ndjson"))
    }

    fn start_closed_loop(self: Arc<Self>, mut closed_rx: mpsc::UnboundedReceiver<ClosedNotice>) {
        tokio::spawn(async move {
            while let Some(notice) = closed_rx.recv().await {
                self.sessions.write().await.remove(&notice.session_id);
                self.slots.release().await;
                let hook = self.detach_hook.read().await.clone();
                if let Some(hook) = hook {
                    hook.session_closed(&notice.session_id);
                }
                info!(
                    event = "session_reaped",
                    session_id = %notice.session_id,
                    reason = %notice.reason
                );
            }
        });
    }

    fn start_idle_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let idle_after = Duration::from_secs(
                    self.idle_timeout_seconds.load(Ordering::SeqCst).max(1),
                );
                let now = Utc::now();
                let sessions: Vec<_> =
                    self.sessions.read().await.values().cloned().collect();
                for session in sessions {
                    let idle_for = now
                        .signed_duration_since(session.last_activity())
                        .to_std()
                        .unwrap_or_default();
                    if idle_for > idle_after {
                        warn!(
                            event = "session_idle_close",
                            session_id = %session.id,
                            idle_seconds = idle_for.as_secs()
                        );
                        session.close(CloseReason::IdleTimeout);
                    }
                }
            }
        });
    }
}
