use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::info;

use crate::model::RunningProcess;

/// How long a cancellation stays observable after the entry is gone,
/// so the run routine can still see it between child exit and effect
/// application.
const CANCEL_STICKY_TTL: Duration = Duration::from_secs(60);

/// Cooperative cancellation handle shared between the registry and a
/// running investigation.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

struct RunningEntry {
    agent_id: String,
    started_at: DateTime<Utc>,
    targets: Vec<String>,
    cancel: CancelHandle,
    cancel_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CancellationInfo {
    pub reason: Option<String>,
}

struct StickyCancellation {
    reason: Option<String>,
    at: Instant,
}

/// Per-issue single-flight registry. A key already present rejects a
/// new trigger; cancellations leave a sticky marker that briefly
/// outlives unregistration.
pub struct ProcessRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    running: HashMap<String, RunningEntry>,
    cancelled: HashMap<String, StickyCancellation>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                running: HashMap::new(),
                cancelled: HashMap::new(),
            }),
        }
    }

    /// Claim the issue for one run. Fails when a run is already
    /// registered under the same id.
    pub fn register(
        &self,
        issue_id: &str,
        agent_id: &str,
        started_at: DateTime<Utc>,
        targets: Vec<String>,
        cancel: CancelHandle,
    ) -> bool {
        let mut inner = self.inner.lock().expect("registry lock");
        if inner.running.contains_key(issue_id) {
            return false;
        }
        inner.cancelled.remove(issue_id);
        inner.running.insert(
            issue_id.to_string(),
            RunningEntry {
                agent_id: agent_id.to_string(),
                started_at,
                targets,
                cancel,
                cancel_reason: None,
            },
        );
        true
    }

    pub fn unregister(&self, issue_id: &str) {
        let mut inner = self.inner.lock().expect("registry lock");
        inner.running.remove(issue_id);
        Self::sweep_sticky(&mut inner);
    }

    /// Cancel a live run. Returns whether a live entry existed. The
    /// sticky marker is set either way a live entry was found.
    pub fn cancel(&self, issue_id: &str, reason: &str) -> bool {
        let mut inner = self.inner.lock().expect("registry lock");
        let Some(entry) = inner.running.get_mut(issue_id) else {
            return false;
        };
        entry.cancel_reason = Some(reason.to_string());
        entry.cancel.cancel();
        inner.cancelled.insert(
            issue_id.to_string(),
            StickyCancellation {
                reason: Some(reason.to_string()),
                at: Instant::now(),
            },
        );
        info!(event = "run_cancelled", issue_id = issue_id, reason = reason);
        true
    }

    pub fn is_running(&self, issue_id: &str) -> bool {
        self.inner
            .lock()
            .expect("registry lock")
            .running
            .contains_key(issue_id)
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().expect("registry lock").running.len()
    }

    pub fn running_processes(&self) -> Vec<RunningProcess> {
        let inner = self.inner.lock().expect("registry lock");
        let mut processes: Vec<_> = inner
            .running
            .iter()
            .map(|(issue_id, entry)| RunningProcess {
                issue_id: issue_id.clone(),
                agent_id: entry.agent_id.clone(),
                started_at: entry.started_at.to_rfc3339(),
                targets: entry.targets.clone(),
                status: if entry.cancel.is_cancelled() {
                    "cancelling".to_string()
                } else {
                    "running".to_string()
                },
            })
            .collect();
        processes.sort_by(|a, b| a.issue_id.cmp(&b.issue_id));
        processes
    }

    /// Observable cancellation state: a live entry's reason, or the
    /// sticky marker if the entry is already gone.
    pub fn cancellation_info(&self, issue_id: &str) -> Option<CancellationInfo> {
        let mut inner = self.inner.lock().expect("registry lock");
        if let Some(entry) = inner.running.get(issue_id) {
            if entry.cancel.is_cancelled() {
                return Some(CancellationInfo {
                    reason: entry.cancel_reason.clone(),
                });
            }
        }
        Self::sweep_sticky(&mut inner);
        inner.cancelled.get(issue_id).map(|sticky| CancellationInfo {
            reason: sticky.reason.clone(),
        })
    }

    fn sweep_sticky(inner: &mut RegistryInner) {
        inner
            .cancelled
            .retain(|_, sticky| sticky.at.elapsed() < CANCEL_STICKY_TTL);
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(registry: &ProcessRegistry, issue_id: &str) -> CancelHandle {
        let cancel = CancelHandle::new();
        assert!(registry.register(issue_id, "claude-code", Utc::now(), vec![], cancel.clone()));
        cancel
    }

    #[test]
    fn second_register_for_same_issue_is_rejected() {
        let registry = ProcessRegistry::new();
        register(&registry, "iss-1");
        let other = CancelHandle::new();
        assert!(!registry.register("iss-1", "codex", Utc::now(), vec![], other));
        assert!(registry.is_running("iss-1"));
        assert_eq!(registry.running_count(), 1);

        registry.unregister("iss-1");
        assert!(!registry.is_running("iss-1"));
        let again = CancelHandle::new();
        assert!(registry.register("iss-1", "codex", Utc::now(), vec![], again));
    }

    #[test]
    fn cancel_signals_handle_and_reports_liveness() {
        let registry = ProcessRegistry::new();
        let cancel = register(&registry, "iss-1");
        assert!(!cancel.is_cancelled());

        assert!(registry.cancel("iss-1", "user_stop"));
        assert!(cancel.is_cancelled());
        assert!(!registry.cancel("iss-ghost", "user_stop"));

        let info = registry.cancellation_info("iss-1").expect("info");
        assert_eq!(info.reason.as_deref(), Some("user_stop"));
    }

    #[test]
    fn cancellation_stays_observable_after_unregister() {
        let registry = ProcessRegistry::new();
        register(&registry, "iss-1");
        registry.cancel("iss-1", "user_stop");
        registry.unregister("iss-1");

        let info = registry
            .cancellation_info("iss-1")
            .expect("sticky marker survives unregister");
        assert_eq!(info.reason.as_deref(), Some("user_stop"));
    }

    #[test]
    fn reregister_clears_old_sticky_marker() {
        let registry = ProcessRegistry::new();
        register(&registry, "iss-1");
        registry.cancel("iss-1", "user_stop");
        registry.unregister("iss-1");
        register(&registry, "iss-1");
        assert!(registry.cancellation_info("iss-1").is_none());
    }

    #[tokio::test]
    async fn cancelled_future_resolves() {
        let cancel = CancelHandle::new();
        let waiter = cancel.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("cancelled future must resolve")
            .expect("join");
    }

    #[test]
    fn running_snapshot_reflects_cancelling_state() {
        let registry = ProcessRegistry::new();
        register(&registry, "iss-2");
        register(&registry, "iss-1");
        registry.cancel("iss-2", "user_stop");

        let snapshot = registry.running_processes();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].issue_id, "iss-1");
        assert_eq!(snapshot[0].status, "running");
        assert_eq!(snapshot[1].issue_id, "iss-2");
        assert_eq!(snapshot[1].status, "cancelling");
    }
}
