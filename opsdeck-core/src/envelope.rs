use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Wire envelope for every WebSocket message: `{ "type": ..., "payload": ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"invalid\"}".to_string())
    }
}

/// Direction of a recorded byte stream chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Stdout,
    Stdin,
    Status,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Stdout => "stdout",
            Direction::Stdin => "stdin",
            Direction::Status => "status",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trip_keeps_type_field_name() {
        let env = Envelope::new("output", json!({"data": "aGk="}));
        let text = env.to_json();
        assert!(text.contains("\"type\":\"output\""));
        let back: Envelope = serde_json::from_str(&text).expect("parse");
        assert_eq!(back.kind, "output");
        assert_eq!(back.payload["data"], "aGk=");
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let back: Envelope = serde_json::from_str("{\"type\":\"heartbeat\"}").expect("parse");
        assert_eq!(back.kind, "heartbeat");
        assert!(back.payload.is_null());
    }

    #[test]
    fn direction_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Direction::Stdout).expect("ser"),
            "\"stdout\""
        );
        assert_eq!(Direction::Status.to_string(), "status");
    }
}
