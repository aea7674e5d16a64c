use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use opsdeck_core::time::now_rfc3339_millis;

const HUB_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    #[serde(rename = "issue.created")]
    IssueCreated,
    #[serde(rename = "issue.updated")]
    IssueUpdated,
    #[serde(rename = "issue.deleted")]
    IssueDeleted,
    #[serde(rename = "issue.status_changed")]
    IssueStatusChanged,
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.completed")]
    AgentCompleted,
    #[serde(rename = "agent.failed")]
    AgentFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::IssueCreated => "issue.created",
            EventKind::IssueUpdated => "issue.updated",
            EventKind::IssueDeleted => "issue.deleted",
            EventKind::IssueStatusChanged => "issue.status_changed",
            EventKind::AgentStarted => "agent.started",
            EventKind::AgentCompleted => "agent.completed",
            EventKind::AgentFailed => "agent.failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub issue_id: String,
    pub ts: String,
    pub payload: Value,
}

/// In-process pub/sub for lifecycle events. Lagging subscribers lose
/// the oldest events rather than slowing publishers.
pub struct EventHub {
    tx: broadcast::Sender<Event>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, kind: EventKind, issue_id: &str, payload: Value) {
        let event = Event {
            kind,
            issue_id: issue_id.to_string(),
            ts: now_rfc3339_millis(),
            payload,
        };
        debug!(event = "event_published", kind = kind.as_str(), issue_id = issue_id);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_see_published_events_in_order() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        hub.publish(EventKind::IssueCreated, "iss-1", json!({}));
        hub.publish(
            EventKind::AgentStarted,
            "iss-1",
            json!({"agent_id": "claude-code"}),
        );

        let first = rx.recv().await.expect("first");
        assert_eq!(first.kind, EventKind::IssueCreated);
        let second = rx.recv().await.expect("second");
        assert_eq!(second.kind, EventKind::AgentStarted);
        assert_eq!(second.payload["agent_id"], "claude-code");
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let hub = EventHub::new();
        hub.publish(EventKind::IssueDeleted, "iss-9", json!({}));
    }

    #[test]
    fn kinds_serialize_with_dotted_names() {
        assert_eq!(
            serde_json::to_string(&EventKind::AgentCompleted).expect("ser"),
            "\"agent.completed\""
        );
        assert_eq!(EventKind::IssueStatusChanged.as_str(), "issue.status_changed");
    }
}
