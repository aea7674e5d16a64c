use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::TriageError;
use crate::model::ProcessorState;
use crate::service::{InvestigationService, TriggerRequest};

const MIN_SLOTS: usize = 1;
const MAX_SLOTS: usize = 20;
const MIN_REFRESH_SECONDS: u64 = 10;
const MAX_REFRESH_SECONDS: u64 = 600;

/// Partial update for `/api/v1/automation/processor`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessorPatch {
    pub active: Option<bool>,
    pub concurrent_slots: Option<usize>,
    pub refresh_interval_seconds: Option<u64>,
    pub max_issues: Option<u64>,
    pub max_issues_disabled: Option<bool>,
}

/// Background automation: every refresh interval, sweep rate limits
/// and feed the next eligible open issue into the investigation
/// service while capacity allows.
pub struct Processor {
    state: Arc<StdMutex<ProcessorState>>,
    service: Arc<InvestigationService>,
}

impl Processor {
    pub fn new(state: Arc<StdMutex<ProcessorState>>, service: Arc<InvestigationService>) -> Self {
        Self { state, service }
    }

    pub fn state(&self) -> ProcessorState {
        self.state.lock().expect("processor state").clone()
    }

    /// Validate and apply a runtime configuration update.
    pub fn update(&self, patch: ProcessorPatch) -> Result<ProcessorState, TriageError> {
        if let Some(slots) = patch.concurrent_slots {
            if !(MIN_SLOTS..=MAX_SLOTS).contains(&slots) {
                return Err(TriageError::validation(format!(
                    "concurrent_slots must be within {MIN_SLOTS}..{MAX_SLOTS}"
                )));
            }
        }
        if let Some(interval) = patch.refresh_interval_seconds {
            if !(MIN_REFRESH_SECONDS..=MAX_REFRESH_SECONDS).contains(&interval) {
                return Err(TriageError::validation(format!(
                    "refresh_interval_seconds must be within {MIN_REFRESH_SECONDS}..{MAX_REFRESH_SECONDS}"
                )));
            }
        }

        let mut state = self.state.lock().expect("processor state");
        if let Some(active) = patch.active {
            state.active = active;
        }
        if let Some(slots) = patch.concurrent_slots {
            state.concurrent_slots = slots;
        }
        if let Some(interval) = patch.refresh_interval_seconds {
            state.refresh_interval_seconds = interval;
        }
        if let Some(max_issues) = patch.max_issues {
            state.max_issues = max_issues;
        }
        if let Some(disabled) = patch.max_issues_disabled {
            state.max_issues_disabled = disabled;
        }
        info!(
            event = "processor_updated",
            active = state.active,
            concurrent_slots = state.concurrent_slots,
            refresh_interval_seconds = state.refresh_interval_seconds
        );
        Ok(state.clone())
    }

    pub fn reset_counter(&self) -> ProcessorState {
        let mut state = self.state.lock().expect("processor state");
        state.processed = 0;
        info!(event = "processor_counter_reset");
        state.clone()
    }

    /// One scheduling pass; factored out of the loop for testing.
    /// Returns whether an investigation was triggered.
    pub fn tick(&self) -> bool {
        if let Err(err) = self.service.ratelimit.sweep() {
            warn!(event = "rate_limit_sweep_failed", error = %err);
        }

        let snapshot = self.state();
        if !snapshot.active {
            return false;
        }
        if self.service.registry.running_count() >= snapshot.concurrent_slots {
            return false;
        }
        if !snapshot.max_issues_disabled && snapshot.processed >= snapshot.max_issues {
            debug!(event = "processor_cap_reached", processed = snapshot.processed);
            return false;
        }

        let eligible = match self.service.ratelimit.eligible_open_issues() {
            Ok(issues) => issues,
            Err(err) => {
                warn!(event = "eligible_scan_failed", error = %err);
                return false;
            }
        };
        let Some(issue) = eligible
            .into_iter()
            .find(|issue| !self.service.registry.is_running(&issue.id))
        else {
            return false;
        };

        match self.service.trigger(TriggerRequest {
            issue_id: issue.id.clone(),
            ..Default::default()
        }) {
            Ok(()) => {
                info!(event = "processor_triggered", issue_id = %issue.id);
                true
            }
            Err(err) => {
                debug!(event = "processor_trigger_skipped", issue_id = %issue.id, error = %err);
                false
            }
        }
    }

    /// Run forever; the interval is re-read every pass so runtime
    /// updates take effect on the next tick.
    pub async fn run_loop(self: Arc<Self>) {
        loop {
            let interval = self.state().refresh_interval_seconds.max(1);
            tokio::time::sleep(Duration::from_secs(interval)).await;
            self.tick();
        }
    }
}
