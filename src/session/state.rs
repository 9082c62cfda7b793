//! Session lifecycle states and outcomes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `Created → Forwarding → {Streaming | Buffering} → Completing → {Completed, Failed}`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Created,
    Forwarding,
    Streaming,
    Buffering,
    Completing,
    Completed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Forwarding => "forwarding",
            Self::Streaming => "streaming",
            Self::Buffering => "buffering",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Upstream reached its natural end of stream.
    Success,
    /// The read ended because the client went away; everything read so far is kept.
    PartialSuccess,
    Failure,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "partial_success" => Some(Self::PartialSuccess),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }

    pub fn terminal_state(&self) -> SessionState {
        match self {
            Self::Success | Self::PartialSuccess => SessionState::Completed,
            Self::Failure => SessionState::Failed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    UpstreamUnreachable { message: String },
    ProtocolError { status: Option<u16>, message: String },
    Timeout,
}

impl FailureReason {
    pub fn into_error(self, deadline: std::time::Duration) -> crate::Error {
        match self {
            Self::UpstreamUnreachable { message } => crate::Error::UpstreamUnreachable(message),
            Self::ProtocolError { status, message } => {
                crate::Error::UpstreamProtocol { status, message }
            }
            Self::Timeout => crate::Error::Timeout(deadline),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpstreamUnreachable { message } => write!(f, "upstream unreachable: {message}"),
            Self::ProtocolError {
                status: Some(status),
                message,
            } => write!(f, "upstream protocol error ({status}): {message}"),
            Self::ProtocolError { status: None, message } => {
                write!(f, "upstream protocol error: {message}")
            }
            Self::Timeout => f.write_str("session deadline exceeded"),
        }
    }
}

/// Final summary published once a session is terminal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub state: SessionState,
    pub outcome: SessionOutcome,
    pub failure: Option<FailureReason>,
    pub upstream_status: Option<u16>,
    pub bytes: usize,
    pub raw_tokens: u64,
    /// `true` when the provider reported usage, `false` when it was estimated.
    pub usage_reported: bool,
    pub persisted: bool,
    pub accounting_enqueued: bool,
    pub duration_ms: u64,
}
