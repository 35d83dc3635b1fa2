//! Call session state: the data model shared by the controller and its callers.
//!
//! A call attempt is either a `PendingInvite` (incoming, not yet answered) or a
//! `CallSession`. Both live in the `Registry`, keyed by a locally generated
//! `SessionId`, and are mutated only by the `SessionController` task.

pub mod collaborators;
pub mod controller;
pub mod error;
pub mod event;
pub mod registry;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use controller::{ControllerHandle, ControllerSettings, SessionController};
pub use error::{ControllerError, SdkError, TelephonyError};
pub use event::{AudioEvent, PushEvent, SdkEvent, UiAction};
pub use registry::{Registry, RegistrySnapshot};

/// Locally generated identifier for one call attempt.
///
/// Allocated by the controller before any SDK interaction and shared with the
/// telephony UI, so it is the key every subsystem uses except push cancels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Logical slot limiting concurrent calls. Line 0 always exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LineGroup(pub u8);

impl fmt::Display for LineGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Call lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    InviteReceived,
    Connecting,
    Ringing,
    Connected,
    Reconnecting,
    OnHold,
    Disconnecting,
    Disconnected,
    Failed,
}

impl CallState {
    /// `Disconnected` and `Failed` are terminal: nothing leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Disconnected | CallState::Failed)
    }

    /// States that occupy a line and block a second outgoing request on it.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            CallState::Connecting
                | CallState::Ringing
                | CallState::Connected
                | CallState::Reconnecting
        )
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            // Any live state may end, with or without an error.
            Disconnected | Failed => true,
            Disconnecting => true,
            Connecting => self == InviteReceived,
            Ringing => self == Connecting,
            Connected => matches!(self, Connecting | Ringing | Reconnecting | OnHold),
            Reconnecting => matches!(self, Connected | OnHold),
            // A held call that drops and recovers goes back on hold.
            OnHold => matches!(self, Connected | Reconnecting),
            InviteReceived => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::InviteReceived => "invite-received",
            CallState::Connecting => "connecting",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Reconnecting => "reconnecting",
            CallState::OnHold => "on-hold",
            CallState::Disconnecting => "disconnecting",
            CallState::Disconnected => "disconnected",
            CallState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a call ended, as reported to the telephony UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    RemoteEnded,
    LocalEnded,
    Failed,
    Cancelled,
    /// Outgoing call abandoned at the microphone prompt.
    PermissionDenied,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::RemoteEnded => "remote ended",
            EndReason::LocalEnded => "local ended",
            EndReason::Failed => "failed",
            EndReason::Cancelled => "cancelled",
            EndReason::PermissionDenied => "permission denied",
        };
        f.write_str(s)
    }
}

/// Who asked for a local hangup.
///
/// A telephony-UI originated end is already known to that subsystem and must
/// not be reported back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndOrigin {
    App,
    Telephony,
}

impl fmt::Display for EndOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndOrigin::App => f.write_str("app"),
            EndOrigin::Telephony => f.write_str("telephony-ui"),
        }
    }
}

/// Call quality warnings raised by the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityWarning {
    HighRtt,
    HighJitter,
    HighPacketLoss,
    LowMos,
    ConstantAudioInputLevel,
}

impl fmt::Display for QualityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QualityWarning::HighRtt => "high-rtt",
            QualityWarning::HighJitter => "high-jitter",
            QualityWarning::HighPacketLoss => "high-packet-loss",
            QualityWarning::LowMos => "low-mos",
            QualityWarning::ConstantAudioInputLevel => "constant-audio-input-level",
        };
        f.write_str(s)
    }
}

/// Result of comparing two quality warning sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarningDiff {
    pub raised: BTreeSet<QualityWarning>,
    pub cleared: BTreeSet<QualityWarning>,
}

impl WarningDiff {
    /// Newly raised = current - (current ∩ previous),
    /// newly cleared = previous - (current ∩ previous).
    pub fn between(
        current: &BTreeSet<QualityWarning>,
        previous: &BTreeSet<QualityWarning>,
    ) -> Self {
        let intersection: BTreeSet<_> = current.intersection(previous).copied().collect();
        Self {
            raised: current.difference(&intersection).copied().collect(),
            cleared: previous.difference(&intersection).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raised.is_empty() && self.cleared.is_empty()
    }
}

/// An incoming call offer that has not been answered, rejected or cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInvite {
    pub id: SessionId,
    /// Correlation id assigned by the signaling side (call SID). Cancels
    /// arrive keyed by this, not by `id`.
    pub network_id: String,
    pub remote_handle: String,
    pub received_at: DateTime<Utc>,
    pub line: LineGroup,
}

/// One active or in-progress call attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: SessionId,
    pub direction: CallDirection,
    pub remote_handle: String,
    pub state: CallState,
    pub line: LineGroup,
    pub muted: bool,
    pub network_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    /// Set when a local hangup is in flight; scoped to this session only.
    pub local_end: Option<EndOrigin>,
    pub active_warnings: BTreeSet<QualityWarning>,
    /// Whether the SDK has reported warnings for this call before. Until it
    /// has, `active_warnings` says nothing about what is inactive.
    #[serde(default)]
    pub warnings_seen: bool,
    /// State to return to when a reconnect completes.
    #[serde(default)]
    pub resume_state: Option<CallState>,
}

impl CallSession {
    /// New outgoing session, created before any network exchange.
    pub fn outgoing(id: SessionId, destination: &str, line: LineGroup) -> Self {
        Self {
            id,
            direction: CallDirection::Outgoing,
            remote_handle: destination.to_string(),
            state: CallState::Connecting,
            line,
            muted: false,
            network_id: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            end_reason: None,
            local_end: None,
            active_warnings: BTreeSet::new(),
            warnings_seen: false,
            resume_state: None,
        }
    }

    /// Promote an accepted invite. The session starts in `InviteReceived` and
    /// moves to `Connecting` once the SDK accept is issued.
    pub fn from_invite(invite: PendingInvite) -> Self {
        Self {
            id: invite.id,
            direction: CallDirection::Incoming,
            remote_handle: invite.remote_handle,
            state: CallState::InviteReceived,
            line: invite.line,
            muted: false,
            network_id: Some(invite.network_id),
            created_at: invite.received_at,
            started_at: None,
            ended_at: None,
            end_reason: None,
            local_end: None,
            active_warnings: BTreeSet::new(),
            warnings_seen: false,
            resume_state: None,
        }
    }

    /// Apply a state change if the state machine allows it.
    ///
    /// Returns `false` (and leaves the session untouched) for illegal moves,
    /// which includes every move out of a terminal state.
    pub fn transition(&mut self, next: CallState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        if next == CallState::Connected && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next == CallState::Reconnecting {
            self.resume_state = Some(self.state);
        } else if self.state == CallState::Reconnecting {
            self.resume_state = None;
        }
        self.state = next;
        true
    }

    /// Move into a terminal state, recording the reason. Only the first call
    /// has any effect.
    pub fn terminate(&mut self, reason: EndReason) -> bool {
        let next = match reason {
            EndReason::Failed | EndReason::PermissionDenied => CallState::Failed,
            _ => CallState::Disconnected,
        };
        if !self.transition(next) {
            return false;
        }
        self.ended_at = Some(Utc::now());
        self.end_reason = Some(reason);
        true
    }

    /// Connected time, if the call ever connected.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        Some(end - start)
    }
}
