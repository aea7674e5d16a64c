use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use opsdeck_core::time::now_rfc3339;

use crate::config::Config;
use crate::error::TriageError;
use crate::events::{EventHub, EventKind};
use crate::model::{
    extras, AgentRunResult, Issue, IssuePriority, IssueStatus, ProcessorState, RunOutcome,
};
use crate::prompt;
use crate::ratelimit::RateLimitManager;
use crate::registry::{CancelHandle, ProcessRegistry};
use crate::runner::{self, RunSpec};
use crate::settings::SettingsManager;
use crate::store::{IssueStore, NewIssue};

pub const CANCEL_REASON_USER_STOP: &str = "user_stop";

/// Trigger request as accepted over HTTP.
#[derive(Debug, Clone, Default)]
pub struct TriggerRequest {
    pub issue_id: String,
    pub agent_id: Option<String>,
    pub auto_resolve: Option<bool>,
    pub force: bool,
}

/// Manual issue update. A status change is rejected while a run is
/// active.
#[derive(Debug, Clone, Default)]
pub struct IssuePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub issue_type: Option<String>,
    pub priority: Option<IssuePriority>,
    pub app_id: Option<String>,
    pub status: Option<IssueStatus>,
    pub tags: Option<Vec<String>>,
    pub report: Option<String>,
}

/// One parsed transcript record for the conversation view.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    pub kind: String,
    pub text: String,
}

/// Orchestrates status transitions and metadata mutation around one
/// agent run per issue.
pub struct InvestigationService {
    pub store: Arc<IssueStore>,
    pub registry: Arc<ProcessRegistry>,
    pub events: Arc<EventHub>,
    pub settings: Arc<SettingsManager>,
    pub ratelimit: Arc<RateLimitManager>,
    pub processor_state: Arc<StdMutex<ProcessorState>>,
    pub config: Config,
}

impl InvestigationService {
    pub fn new(
        store: Arc<IssueStore>,
        registry: Arc<ProcessRegistry>,
        events: Arc<EventHub>,
        settings: Arc<SettingsManager>,
        ratelimit: Arc<RateLimitManager>,
        processor_state: Arc<StdMutex<ProcessorState>>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            events,
            settings,
            ratelimit,
            processor_state,
            config,
        })
    }

    // ---- issue CRUD with events ----

    pub fn create_issue(&self, new: NewIssue) -> Result<Issue, TriageError> {
        let issue = self.store.create(new)?;
        self.events.publish(
            EventKind::IssueCreated,
            &issue.id,
            json!({ "title": issue.title, "status": issue.status }),
        );
        Ok(issue)
    }

    pub fn update_issue(&self, issue_id: &str, patch: IssuePatch) -> Result<Issue, TriageError> {
        let mut issue = self.store.load(issue_id)?;
        let status_change = patch.status.filter(|next| *next != issue.status);
        if status_change.is_some() && self.registry.is_running(issue_id) {
            return Err(TriageError::conflict(
                "status cannot change while an investigation is running",
            ));
        }

        if let Some(title) = patch.title {
            if title.trim().is_empty() {
                return Err(TriageError::validation("title must not be empty"));
            }
            issue.title = title;
        }
        if let Some(description) = patch.description {
            issue.description = description;
        }
        if let Some(issue_type) = patch.issue_type {
            issue.issue_type = issue_type;
        }
        if let Some(priority) = patch.priority {
            issue.priority = priority;
        }
        if let Some(app_id) = patch.app_id {
            issue.app_id = app_id;
        }
        if let Some(tags) = patch.tags {
            issue.metadata.tags = tags;
        }
        if let Some(report) = patch.report {
            issue.investigation.report = Some(report);
        }
        // resolved_at is non-empty exactly when the issue sits in
        // completed/.
        match status_change {
            Some(IssueStatus::Completed) => {
                if issue.metadata.resolved_at.is_none() {
                    issue.metadata.resolved_at = Some(now_rfc3339());
                }
            }
            Some(_) => issue.metadata.resolved_at = None,
            None => {}
        }
        self.store.save(&mut issue)?;

        if let Some(next) = status_change {
            let previous = issue.status;
            issue = self.store.move_status(issue_id, next)?;
            self.events.publish(
                EventKind::IssueStatusChanged,
                issue_id,
                json!({ "from": previous, "to": next }),
            );
        }
        self.events.publish(
            EventKind::IssueUpdated,
            issue_id,
            json!({ "status": issue.status }),
        );
        Ok(issue)
    }

    pub fn delete_issue(&self, issue_id: &str) -> Result<(), TriageError> {
        if self.registry.is_running(issue_id) {
            return Err(TriageError::conflict(
                "issue cannot be deleted while an investigation is running",
            ));
        }
        self.store.delete(issue_id)?;
        self.events
            .publish(EventKind::IssueDeleted, issue_id, json!({}));
        Ok(())
    }

    // ---- investigation lifecycle ----

    /// Compose the prompt without executing anything.
    pub fn preview_prompt(
        &self,
        issue_id: &str,
        agent_id: Option<&str>,
    ) -> Result<String, TriageError> {
        let issue = self.store.load(issue_id)?;
        let agent_id = agent_id
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.default_agent_id());
        Ok(prompt::compose(
            &self.config.prompt_template_path,
            &issue,
            &agent_id,
            &self.config.scenario_root,
        ))
    }

    /// Start an investigation: at most one per issue, bounded by the
    /// processor's slot count unless forced.
    pub fn trigger(self: &Arc<Self>, request: TriggerRequest) -> Result<(), TriageError> {
        let issue_id = request.issue_id.clone();
        let mut issue = self.store.load(&issue_id)?;

        if self.registry.is_running(&issue_id) {
            return Err(TriageError::conflict(format!(
                "investigation already running for issue {issue_id}"
            )));
        }
        let slots = self
            .processor_state
            .lock()
            .expect("processor state")
            .concurrent_slots;
        if !request.force && self.registry.running_count() >= slots {
            return Err(TriageError::slot_limit(format!(
                "slot limit reached ({slots} concurrent investigations)"
            )));
        }

        let agent_id = request
            .agent_id
            .clone()
            .unwrap_or_else(|| self.settings.default_agent_id());
        let started_at = Utc::now();

        issue.investigation.agent_id = Some(agent_id.clone());
        issue.investigation.started_at = Some(started_at.to_rfc3339());
        issue.metadata.resolved_at = None;
        issue.set_extra(extras::AGENT_STATUS, "running");
        issue.clear_extra(extras::AGENT_LAST_ERROR);
        issue.clear_extra(extras::AGENT_CANCEL_REASON);
        issue.clear_extra(extras::AGENT_TRANSCRIPT_PATH);
        issue.clear_extra(extras::AGENT_LAST_MESSAGE_PATH);
        self.store.save(&mut issue)?;

        if issue.status != IssueStatus::Active {
            let previous = issue.status;
            self.store.move_status(&issue_id, IssueStatus::Active)?;
            self.events.publish(
                EventKind::IssueStatusChanged,
                &issue_id,
                json!({ "from": previous, "to": IssueStatus::Active }),
            );
        }

        let cancel = CancelHandle::new();
        if !self.registry.register(
            &issue_id,
            &agent_id,
            started_at,
            vec![issue.app_id.clone()],
            cancel.clone(),
        ) {
            return Err(TriageError::conflict(format!(
                "investigation already running for issue {issue_id}"
            )));
        }

        self.events.publish(
            EventKind::AgentStarted,
            &issue_id,
            json!({ "agent_id": agent_id }),
        );
        info!(event = "investigation_triggered", issue_id = %issue_id, agent_id = %agent_id, force = request.force);

        let service = Arc::clone(self);
        let issue_for_run = self.store.load(&issue_id)?;
        tokio::spawn(async move {
            service
                .run_investigation(issue_for_run, agent_id, cancel)
                .await;
        });
        Ok(())
    }

    async fn run_investigation(
        self: &Arc<Self>,
        issue: Issue,
        agent_id: String,
        cancel: CancelHandle,
    ) {
        let issue_id = issue.id.clone();
        let profile = self.settings.profile(&agent_id);
        let text = prompt::compose(
            &self.config.prompt_template_path,
            &issue,
            &agent_id,
            &self.config.scenario_root,
        );
        let (command, args) = profile.build_invocation(&text);
        let (transcript_path, last_message_path) =
            runner::artifact_paths(&self.config.scenario_root, &agent_id);
        let timeout = Duration::from_secs(profile.runner.timeout_seconds.max(1))
            .min(self.config.agent_timeout.max(Duration::from_secs(1)));

        let result = runner::run(RunSpec {
            issue_id: issue_id.clone(),
            agent_id: agent_id.clone(),
            command,
            args,
            prompt: text,
            timeout,
            cancel,
            transcript_path,
            last_message_path,
        })
        .await;

        if let Err(err) = self.finalize(&issue_id, &agent_id, result) {
            error!(event = "finalize_failed", issue_id = %issue_id, error = %err);
        }
        self.registry.unregister(&issue_id);
    }

    /// Apply a finished run's effects. Always consults the
    /// cancellation registry first so a cancellation observed between
    /// child exit and this point wins over the classified outcome.
    fn finalize(
        &self,
        issue_id: &str,
        agent_id: &str,
        result: AgentRunResult,
    ) -> Result<(), TriageError> {
        let cancellation = self.registry.cancellation_info(issue_id);
        let outcome = if cancellation.is_some() {
            RunOutcome::Cancelled
        } else {
            result.outcome
        };

        let mut issue = self.store.load(issue_id)?;
        let now = now_rfc3339();
        issue.investigation.completed_at = Some(now.clone());
        issue.investigation.duration_minutes =
            Some((result.duration.as_secs_f64() / 60.0 * 100.0).round() / 100.0);
        issue.set_extra(extras::AGENT_STATUS_TS, now.clone());
        issue.set_extra(
            extras::AGENT_TRANSCRIPT_PATH,
            result.transcript_path.display().to_string(),
        );
        issue.set_extra(
            extras::AGENT_LAST_MESSAGE_PATH,
            result.last_message_path.display().to_string(),
        );

        let (target, event) = match outcome {
            RunOutcome::Success | RunOutcome::SuccessWithDirtyExit => {
                issue.set_extra(extras::AGENT_STATUS, "completed");
                issue.investigation.report = Some(result.last_message.trim().to_string());
                issue.metadata.resolved_at = Some(now.clone());
                (IssueStatus::Completed, EventKind::AgentCompleted)
            }
            RunOutcome::Failure | RunOutcome::Timeout => {
                issue.set_extra(extras::AGENT_STATUS, "failed");
                issue.set_extra(
                    extras::AGENT_LAST_ERROR,
                    result.error.clone().unwrap_or_else(|| "agent failed".into()),
                );
                (IssueStatus::Failed, EventKind::AgentFailed)
            }
            RunOutcome::MaxTurnsExceeded => {
                issue.set_extra(extras::AGENT_STATUS, "failed");
                issue.set_extra(
                    extras::AGENT_LAST_ERROR,
                    result.error.clone().unwrap_or_else(|| "agent failed".into()),
                );
                issue.set_extra(extras::MAX_TURNS_EXCEEDED, "true");
                (IssueStatus::Failed, EventKind::AgentFailed)
            }
            RunOutcome::RateLimited => {
                issue.set_extra(extras::AGENT_STATUS, "failed");
                issue.set_extra(
                    extras::AGENT_LAST_ERROR,
                    result.error.clone().unwrap_or_else(|| "rate limited".into()),
                );
                self.ratelimit
                    .note_rate_limit(&mut issue, agent_id, &result.output);
                (IssueStatus::Failed, EventKind::AgentFailed)
            }
            RunOutcome::Cancelled => {
                issue.set_extra(extras::AGENT_STATUS, "cancelled");
                if let Some(reason) = cancellation.as_ref().and_then(|c| c.reason.clone()) {
                    issue.set_extra(extras::AGENT_CANCEL_REASON, reason);
                }
                (IssueStatus::Open, EventKind::AgentFailed)
            }
        };

        self.store.save(&mut issue)?;
        let previous = issue.status;
        if previous != target {
            self.store.move_status(issue_id, target)?;
            self.events.publish(
                EventKind::IssueStatusChanged,
                issue_id,
                json!({ "from": previous, "to": target }),
            );
        }
        self.ratelimit.invalidate();

        if outcome.is_success() {
            let mut state = self.processor_state.lock().expect("processor state");
            state.processed += 1;
        }

        self.events.publish(
            event,
            issue_id,
            json!({
                "agent_id": agent_id,
                "outcome": outcome,
                "success": result.success(),
                "rate_limited": result.rate_limited(),
                "timeout": result.timed_out(),
                "max_turns_exceeded": result.max_turns_exceeded(),
                "exit_code": result.exit_code,
                "duration_seconds": result.duration.as_secs(),
                "transcript_sha256": result.transcript_sha256,
            }),
        );
        info!(event = "investigation_finished", issue_id = %issue_id, outcome = ?outcome);
        Ok(())
    }

    /// Cancel a live run with reason `user_stop`. Returns whether a
    /// live run existed.
    pub fn stop_running_process(&self, issue_id: &str) -> bool {
        self.registry.cancel(issue_id, CANCEL_REASON_USER_STOP)
    }

    /// Parsed transcript view built from the recorded transcript
    /// file, covering both the streamed and the fallback shapes.
    pub fn conversation(&self, issue_id: &str) -> Result<Vec<ConversationEntry>, TriageError> {
        let issue = self.store.load(issue_id)?;
        let Some(path) = issue.extra(extras::AGENT_TRANSCRIPT_PATH) else {
            return Ok(Vec::new());
        };
        let path = PathBuf::from(path);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "transcript_unreadable", issue_id = %issue_id, error = %err);
                return Ok(Vec::new());
            }
        };
        let mut entries = Vec::new();
        for line in text.lines() {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            let ts = value
                .get("ts")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let kind = value
                .get("stream")
                .or_else(|| value.get("type"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let text = value
                .get("line")
                .or_else(|| value.get("content"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            entries.push(ConversationEntry { ts, kind, text });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunningProcess;
    use std::time::Instant;

    fn stub_agent_script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("stub-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut permissions = std::fs::metadata(&path).expect("meta").permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).expect("chmod");
        path
    }

    fn harness(dir: &tempfile::TempDir, script_body: &str) -> Arc<InvestigationService> {
        let script = stub_agent_script(dir, script_body);
        let settings_path = dir.path().join("agents.yaml");
        std::fs::write(
            &settings_path,
            format!(
                "default_agent: stub\nagents:\n  - id: stub\n    command: {}\n",
                script.display()
            ),
        )
        .expect("write settings");

        let config = Config {
            bind_addr: "127.0.0.1:0".to_string(),
            scenario_root: dir.path().to_path_buf(),
            issues_dir: dir.path().join("issues"),
            agent_settings_path: settings_path.clone(),
            prompt_template_path: dir.path().join("missing-template.md"),
            agent_timeout: Duration::from_secs(20),
            log_dir: String::new(),
        };
        let store = Arc::new(IssueStore::open(config.issues_dir.clone()).expect("store"));
        let ratelimit = Arc::new(RateLimitManager::new(store.clone()));
        InvestigationService::new(
            store,
            Arc::new(ProcessRegistry::new()),
            Arc::new(EventHub::new()),
            Arc::new(SettingsManager::load(settings_path)),
            ratelimit,
            Arc::new(StdMutex::new(ProcessorState::default())),
            config,
        )
    }

    fn seed(service: &InvestigationService, title: &str) -> Issue {
        service
            .create_issue(NewIssue {
                title: title.to_string(),
                description: "broken".to_string(),
                issue_type: "bug".to_string(),
                priority: IssuePriority::High,
                app_id: "app-1".to_string(),
                reporter_name: "ops".to_string(),
                ..Default::default()
            })
            .expect("create issue")
    }

    async fn wait_for_status(
        service: &InvestigationService,
        issue_id: &str,
        status: IssueStatus,
    ) -> Issue {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let issue = service.store.load(issue_id).expect("load");
            if issue.status == status {
                return issue;
            }
            assert!(
                Instant::now() < deadline,
                "issue {issue_id} never reached {status}, still {}",
                issue.status
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn successful_investigation_completes_the_issue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = harness(&dir, "echo 'Investigation Summary: cache misconfigured'");
        let issue = seed(&service, "prod crash");
        let mut events = service.events.subscribe();

        service
            .trigger(TriggerRequest {
                issue_id: issue.id.clone(),
                ..Default::default()
            })
            .expect("trigger");

        let done = wait_for_status(&service, &issue.id, IssueStatus::Completed).await;
        assert_eq!(
            done.investigation.report.as_deref(),
            Some("Investigation Summary: cache misconfigured")
        );
        assert_eq!(done.extra(extras::AGENT_STATUS), Some("completed"));
        let resolved = done.metadata.resolved_at.clone().expect("resolved_at");
        let parsed = opsdeck_core::time::parse_rfc3339_lenient(&resolved).expect("rfc3339");
        assert!((Utc::now() - parsed).num_seconds().abs() < 5);
        assert!(done.extra(extras::AGENT_TRANSCRIPT_PATH).is_some());

        // Exactly one agent.completed among the published events.
        let mut completed = 0;
        while let Ok(event) = events.try_recv() {
            if event.kind == EventKind::AgentCompleted {
                completed += 1;
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(
            service.processor_state.lock().expect("state").processed,
            1
        );
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rate_limited_run_parks_the_issue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = harness(
            &dir,
            "echo 'HTTP 429 rate limit reached; retry after 2035-01-02T03:04:05Z'; exit 2",
        );
        let issue = seed(&service, "limited");

        service
            .trigger(TriggerRequest {
                issue_id: issue.id.clone(),
                ..Default::default()
            })
            .expect("trigger");

        let failed = wait_for_status(&service, &issue.id, IssueStatus::Failed).await;
        assert_eq!(
            failed.extra(extras::RATE_LIMIT_UNTIL),
            Some("2035-01-02T03:04:05Z")
        );
        assert_eq!(failed.extra(extras::RATE_LIMIT_AGENT), Some("stub"));

        let status = service.ratelimit.status().expect("status");
        assert!(status.rate_limited);
        assert_eq!(status.count, 1);
        assert_eq!(status.reset_time.as_deref(), Some("2035-01-02T03:04:05Z"));
        assert!(status.seconds_until_reset.expect("seconds") >= 0);
        assert_eq!(
            service.processor_state.lock().expect("state").processed,
            0
        );
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_trigger_conflicts_while_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = harness(&dir, "sleep 10");
        let issue = seed(&service, "slow");

        service
            .trigger(TriggerRequest {
                issue_id: issue.id.clone(),
                force: true,
                ..Default::default()
            })
            .expect("first trigger");

        let err = service
            .trigger(TriggerRequest {
                issue_id: issue.id.clone(),
                force: true,
                ..Default::default()
            })
            .err()
            .expect("second trigger must conflict");
        assert!(matches!(err, TriageError::Conflict(_)));
        assert!(err.to_string().contains("already running"));

        service.stop_running_process(&issue.id);
        wait_for_status(&service, &issue.id, IssueStatus::Open).await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slot_limit_applies_unless_forced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = harness(&dir, "sleep 10");
        service
            .processor_state
            .lock()
            .expect("state")
            .concurrent_slots = 1;
        let first = seed(&service, "one");
        let second = seed(&service, "two");

        service
            .trigger(TriggerRequest {
                issue_id: first.id.clone(),
                ..Default::default()
            })
            .expect("first trigger");

        let err = service
            .trigger(TriggerRequest {
                issue_id: second.id.clone(),
                ..Default::default()
            })
            .err()
            .expect("must hit slot limit");
        assert!(matches!(err, TriageError::SlotLimit(_)));
        assert!(err.to_string().contains("slot limit"));

        service
            .trigger(TriggerRequest {
                issue_id: second.id.clone(),
                force: true,
                ..Default::default()
            })
            .expect("forced trigger bypasses slots");

        service.stop_running_process(&first.id);
        service.stop_running_process(&second.id);
        wait_for_status(&service, &first.id, IssueStatus::Open).await;
        wait_for_status(&service, &second.id, IssueStatus::Open).await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancellation_returns_issue_to_open_with_reason() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = harness(&dir, "sleep 10");
        let issue = seed(&service, "cancel me");

        service
            .trigger(TriggerRequest {
                issue_id: issue.id.clone(),
                ..Default::default()
            })
            .expect("trigger");
        let running: Vec<RunningProcess> = service.registry.running_processes();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].issue_id, issue.id);

        assert!(service.stop_running_process(&issue.id));
        let reopened = wait_for_status(&service, &issue.id, IssueStatus::Open).await;
        assert_eq!(reopened.extra(extras::AGENT_STATUS), Some("cancelled"));
        assert_eq!(
            reopened.extra(extras::AGENT_CANCEL_REASON),
            Some(CANCEL_REASON_USER_STOP)
        );
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_change_and_delete_conflict_while_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = harness(&dir, "sleep 10");
        let issue = seed(&service, "busy");

        service
            .trigger(TriggerRequest {
                issue_id: issue.id.clone(),
                ..Default::default()
            })
            .expect("trigger");

        let err = service
            .update_issue(
                &issue.id,
                IssuePatch {
                    status: Some(IssueStatus::Completed),
                    ..Default::default()
                },
            )
            .err()
            .expect("status change must conflict");
        assert!(matches!(err, TriageError::Conflict(_)));

        // Non-status fields stay editable mid-run.
        let updated = service
            .update_issue(
                &issue.id,
                IssuePatch {
                    description: Some("new details".into()),
                    ..Default::default()
                },
            )
            .expect("field update");
        assert_eq!(updated.description, "new details");

        let err = service
            .delete_issue(&issue.id)
            .err()
            .expect("delete must conflict");
        assert!(matches!(err, TriageError::Conflict(_)));

        service.stop_running_process(&issue.id);
        wait_for_status(&service, &issue.id, IssueStatus::Open).await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn manual_status_update_moves_the_folder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = harness(&dir, "true");
        let issue = seed(&service, "manual");

        let moved = service
            .update_issue(
                &issue.id,
                IssuePatch {
                    status: Some(IssueStatus::Failed),
                    ..Default::default()
                },
            )
            .expect("manual move");
        assert_eq!(moved.status, IssueStatus::Failed);
        assert_eq!(
            service.store.load(&issue.id).expect("reload").status,
            IssueStatus::Failed
        );
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn preview_composes_without_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = harness(&dir, "true");
        let issue = seed(&service, "preview me");

        let text = service
            .preview_prompt(&issue.id, None)
            .expect("preview");
        assert!(text.contains("preview me"));
        assert!(!service.registry.is_running(&issue.id));
        assert_eq!(
            service.store.load(&issue.id).expect("load").status,
            IssueStatus::Open
        );
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn conversation_view_parses_streamed_transcript() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = harness(&dir, "echo 'Investigation Summary: done'");
        let issue = seed(&service, "talkative");

        service
            .trigger(TriggerRequest {
                issue_id: issue.id.clone(),
                ..Default::default()
            })
            .expect("trigger");
        wait_for_status(&service, &issue.id, IssueStatus::Completed).await;

        let entries = service.conversation(&issue.id).expect("conversation");
        assert!(!entries.is_empty());
        assert_eq!(entries[0].kind, "stdout");
        assert!(entries
            .iter()
            .any(|entry| entry.text.contains("Investigation Summary")));
    }
}
