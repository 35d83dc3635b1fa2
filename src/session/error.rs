//! Error types at the controller boundary.

use thiserror::Error;

use super::{CallState, LineGroup, SessionId};

/// Errors returned to callers of `ControllerHandle`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("{line} already has a call in progress ({existing})")]
    LineBusy { line: LineGroup, existing: SessionId },

    #[error("{line} is not configured (line groups: {configured})")]
    InvalidLine { line: LineGroup, configured: u8 },

    #[error("no call or invite with id {0}")]
    UnknownSession(SessionId),

    #[error("call {id} is {state}, cannot {action}")]
    InvalidState {
        id: SessionId,
        state: CallState,
        action: &'static str,
    },

    #[error("session controller is not running")]
    Closed,
}

/// Failure reported synchronously by the calling SDK.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SdkError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("accept failed: {0}")]
    Accept(String),
}

/// The telephony UI refused to register a call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TelephonyError {
    #[error("incoming call blocked by the system (do-not-disturb or block list)")]
    Blocked,
}
