use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Known keys inside `metadata.extra`, used for agent-run bookkeeping.
pub mod extras {
    pub const AGENT_STATUS: &str = "agent_status";
    pub const AGENT_STATUS_TS: &str = "agent_status_ts";
    pub const AGENT_LAST_ERROR: &str = "agent_last_error";
    pub const AGENT_CANCEL_REASON: &str = "agent_cancel_reason";
    pub const AGENT_TRANSCRIPT_PATH: &str = "agent_transcript_path";
    pub const AGENT_LAST_MESSAGE_PATH: &str = "agent_last_message_path";
    pub const RATE_LIMIT_UNTIL: &str = "rate_limit_until";
    pub const RATE_LIMIT_AGENT: &str = "rate_limit_agent";
    pub const MAX_TURNS_EXCEEDED: &str = "max_turns_exceeded";
    pub const ERROR_MESSAGE: &str = "error_message";
    pub const STACK_TRACE: &str = "stack_trace";
    pub const AFFECTED_FILES: &str = "affected_files";
}

/// Issue status; always equal to the name of the containing folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    #[default]
    Open,
    Active,
    Completed,
    Failed,
}

impl IssueStatus {
    pub const ALL: [IssueStatus; 4] = [
        IssueStatus::Open,
        IssueStatus::Active,
        IssueStatus::Completed,
        IssueStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Open => "open",
            IssueStatus::Active => "active",
            IssueStatus::Completed => "completed",
            IssueStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "open" => Ok(IssueStatus::Open),
            "active" => Ok(IssueStatus::Active),
            "completed" => Ok(IssueStatus::Completed),
            "failed" => Ok(IssueStatus::Failed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IssuePriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl IssuePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssuePriority::Low => "low",
            IssuePriority::Medium => "medium",
            IssuePriority::High => "high",
            IssuePriority::Critical => "critical",
        }
    }
}

impl fmt::Display for IssuePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssuePriority {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "low" => Ok(IssuePriority::Low),
            "medium" => Ok(IssuePriority::Medium),
            "high" => Ok(IssuePriority::High),
            "critical" => Ok(IssuePriority::Critical),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Reporter {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    /// Relative path under the issue's `artifacts/` folder.
    pub path: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Investigation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IssueMetadata {
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// The full metadata document persisted as `metadata.yaml`. `status`
/// is derived from the containing folder on load; the stored copy is
/// reconciled on every save so the two can never drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub issue_type: String,
    #[serde(default)]
    pub priority: IssuePriority,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub status: IssueStatus,
    #[serde(default)]
    pub reporter: Reporter,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub investigation: Investigation,
    #[serde(default)]
    pub metadata: IssueMetadata,
}

impl Issue {
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.metadata.extra.get(key).map(String::as_str)
    }

    pub fn set_extra(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.extra.insert(key.to_string(), value.into());
    }

    pub fn clear_extra(&mut self, key: &str) {
        self.metadata.extra.remove(key);
    }
}

/// How one agent run ended, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Timeout,
    MaxTurnsExceeded,
    RateLimited,
    SuccessWithDirtyExit,
    Failure,
    Success,
    Cancelled,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success | RunOutcome::SuccessWithDirtyExit)
    }
}

/// Everything the investigation service needs to apply a run's
/// effects.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    pub outcome: RunOutcome,
    pub output: String,
    pub last_message: String,
    pub error: Option<String>,
    pub transcript_path: PathBuf,
    pub last_message_path: PathBuf,
    pub transcript_sha256: Option<String>,
    pub exit_code: i32,
    pub duration: Duration,
}

impl AgentRunResult {
    pub fn success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn rate_limited(&self) -> bool {
        self.outcome == RunOutcome::RateLimited
    }

    pub fn timed_out(&self) -> bool {
        self.outcome == RunOutcome::Timeout
    }

    pub fn max_turns_exceeded(&self) -> bool {
        self.outcome == RunOutcome::MaxTurnsExceeded
    }
}

/// Runtime-mutable automation knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorState {
    pub active: bool,
    pub concurrent_slots: usize,
    pub refresh_interval_seconds: u64,
    pub max_issues: u64,
    pub max_issues_disabled: bool,
    pub processed: u64,
}

impl Default for ProcessorState {
    fn default() -> Self {
        Self {
            active: false,
            concurrent_slots: crate::config::DEFAULT_CONCURRENT_SLOTS,
            refresh_interval_seconds: crate::config::DEFAULT_REFRESH_INTERVAL_SECONDS,
            max_issues: 0,
            max_issues_disabled: true,
            processed: 0,
        }
    }
}

/// Snapshot row for `/api/v1/processes/running`.
#[derive(Debug, Clone, Serialize)]
pub struct RunningProcess {
    pub issue_id: String,
    pub agent_id: String,
    pub started_at: String,
    pub targets: Vec<String>,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in IssueStatus::ALL {
            let parsed: IssueStatus = status.as_str().parse().expect("parse");
            assert_eq!(parsed, status);
        }
        assert!("archived".parse::<IssueStatus>().is_err());
    }

    #[test]
    fn issue_yaml_round_trip_preserves_extras() {
        let mut issue = Issue {
            id: "iss-1".into(),
            title: "Crash on startup".into(),
            description: "stack trace attached".into(),
            issue_type: "bug".into(),
            priority: IssuePriority::High,
            app_id: "app-7".into(),
            status: IssueStatus::Open,
            reporter: Reporter {
                name: "ops".into(),
                contact: Some("ops@example.com".into()),
            },
            attachments: vec![Attachment {
                name: "crash.log".into(),
                path: "crash.log".into(),
                mime_type: "text/plain".into(),
                category: Some("logs".into()),
            }],
            investigation: Investigation::default(),
            metadata: IssueMetadata {
                created_at: "2026-08-01T00:00:00Z".into(),
                updated_at: "2026-08-01T00:00:00Z".into(),
                ..Default::default()
            },
        };
        issue.set_extra(extras::AGENT_STATUS, "running");

        let yaml = serde_yaml::to_string(&issue).expect("encode");
        assert!(yaml.contains("type: bug"));
        let back: Issue = serde_yaml::from_str(&yaml).expect("decode");
        assert_eq!(back.extra(extras::AGENT_STATUS), Some("running"));
        assert_eq!(back.priority, IssuePriority::High);
        assert_eq!(back.attachments.len(), 1);
    }

    #[test]
    fn minimal_yaml_fills_defaults() {
        let issue: Issue =
            serde_yaml::from_str("id: iss-2\ntitle: Sparse\n").expect("decode minimal");
        assert_eq!(issue.status, IssueStatus::Open);
        assert_eq!(issue.priority, IssuePriority::Medium);
        assert!(issue.attachments.is_empty());
        assert!(issue.investigation.agent_id.is_none());
    }
}
