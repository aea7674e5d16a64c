use thiserror::Error;

/// Error kinds surfaced by the triage service, mapped to HTTP status
/// codes at the edge. Agent failures are never errors here; they are
/// classified run outcomes.
#[derive(Debug, Error)]
pub enum TriageError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    SlotLimit(String),
    #[error("{0}")]
    Internal(String),
}

impl TriageError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn slot_limit(msg: impl Into<String>) -> Self {
        Self::SlotLimit(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<std::io::Error> for TriageError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_yaml::Error> for TriageError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Internal(format!("yaml: {err}"))
    }
}
