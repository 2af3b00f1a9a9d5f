//! Error taxonomy for action execution.
//!
//! Every failure — validation, store access, provider HTTP — is converted
//! into one of these kinds at its origin and crosses the dispatcher as a
//! structured `Error` envelope. Raw provider payloads and stack traces
//! never reach the calling agent.

use serde::Serialize;
use thiserror::Error;

use crate::providers::ProviderKind;

/// Wire-level error kind, serialized into the result envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Unauthorized,
    NotConnected,
    RefreshFailed,
    NotFound,
    ProviderCallFailed,
    InvalidState,
    UnknownAction,
}

/// A failure during action dispatch or execution.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("no valid caller session")]
    Unauthorized,

    #[error("{provider} is not connected for this user")]
    NotConnected { provider: ProviderKind },

    #[error("{provider} authorization expired and could not be renewed: {reason}")]
    RefreshFailed { provider: ProviderKind, reason: String },

    #[error("{0}")]
    NotFound(String),

    #[error("{provider} API call failed (HTTP {status})")]
    ProviderCallFailed {
        provider: ProviderKind,
        /// 0 when the request never produced a response (timeout, connect).
        status: u16,
        /// Truncated response body or transport error, kept for diagnosis.
        detail: String,
    },

    #[error("{0}")]
    InvalidState(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::InvalidInput(_) => ErrorKind::InvalidInput,
            ActionError::Unauthorized => ErrorKind::Unauthorized,
            ActionError::NotConnected { .. } => ErrorKind::NotConnected,
            ActionError::RefreshFailed { .. } => ErrorKind::RefreshFailed,
            ActionError::NotFound(_) => ErrorKind::NotFound,
            ActionError::ProviderCallFailed { .. } => ErrorKind::ProviderCallFailed,
            ActionError::InvalidState(_) => ErrorKind::InvalidState,
            ActionError::UnknownAction(_) => ErrorKind::UnknownAction,
        }
    }

    /// Extra diagnostic payload, where one exists.
    pub fn detail(&self) -> Option<String> {
        match self {
            ActionError::ProviderCallFailed { detail, .. } if !detail.is_empty() => {
                Some(detail.clone())
            }
            _ => None,
        }
    }
}

/// Store failures surface as `NotFound` when a referenced row is absent and
/// `InvalidState` otherwise — the durable store could not accept or produce
/// the requested state.
impl From<crate::db::DbError> for ActionError {
    fn from(err: crate::db::DbError) -> Self {
        match err {
            crate::db::DbError::RowNotFound(what) => ActionError::NotFound(what),
            other => ActionError::InvalidState(format!("store: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            ActionError::InvalidInput("bad".into()).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            ActionError::UnknownAction("nope".into()).kind(),
            ErrorKind::UnknownAction
        );
        assert_eq!(
            ActionError::NotConnected {
                provider: ProviderKind::Gmail
            }
            .kind(),
            ErrorKind::NotConnected
        );
    }

    #[test]
    fn test_provider_detail_preserved() {
        let err = ActionError::ProviderCallFailed {
            provider: ProviderKind::GoogleCalendar,
            status: 403,
            detail: "rate limit exceeded".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ProviderCallFailed);
        assert_eq!(err.detail().as_deref(), Some("rate limit exceeded"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_value(ErrorKind::ProviderCallFailed).unwrap();
        assert_eq!(json, "provider_call_failed");
    }
}
