//! The single event type every source is funnelled through.

use std::collections::BTreeSet;

use tokio::sync::oneshot;

use super::collaborators::PermissionChoice;
use super::{ControllerError, LineGroup, QualityWarning, RegistrySnapshot, SessionId};

/// Fulfil (`true`) or fail (`false`) a pending action.
pub type ActionReply = oneshot::Sender<bool>;

/// Actions requested by the telephony UI. Each must be answered.
#[derive(Debug)]
pub enum UiAction {
    /// The system UI wants to place a call it created (recents, voice assistant).
    Start {
        id: SessionId,
        handle: String,
        reply: ActionReply,
    },
    Answer {
        id: SessionId,
        reply: ActionReply,
    },
    End {
        id: SessionId,
        reply: ActionReply,
    },
    SetHeld {
        id: SessionId,
        on_hold: bool,
        reply: ActionReply,
    },
    SetMuted {
        id: SessionId,
        muted: bool,
        reply: ActionReply,
    },
    PlayDigits {
        id: SessionId,
        digits: String,
        reply: ActionReply,
    },
    /// The system dropped every call it knew about.
    Reset,
}

/// Asynchronous call-state callbacks from the SDK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkEvent {
    Ringing {
        id: SessionId,
    },
    Connected {
        id: SessionId,
    },
    FailedToConnect {
        id: SessionId,
        error: String,
    },
    Reconnecting {
        id: SessionId,
        error: String,
    },
    Reconnected {
        id: SessionId,
    },
    Disconnected {
        id: SessionId,
        error: Option<String>,
    },
    QualityWarnings {
        id: SessionId,
        current: BTreeSet<QualityWarning>,
        previous: BTreeSet<QualityWarning>,
    },
}

impl SdkEvent {
    pub fn id(&self) -> SessionId {
        match self {
            SdkEvent::Ringing { id }
            | SdkEvent::Connected { id }
            | SdkEvent::FailedToConnect { id, .. }
            | SdkEvent::Reconnecting { id, .. }
            | SdkEvent::Reconnected { id }
            | SdkEvent::Disconnected { id, .. }
            | SdkEvent::QualityWarnings { id, .. } => *id,
        }
    }
}

/// Decoded push notifications. Keyed by the signaling correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    Invite {
        network_id: String,
        from: String,
    },
    Cancelled {
        network_id: String,
    },
}

/// Audio session activation callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEvent {
    Activated,
    Deactivated,
}

/// Requests issued by the application itself (buttons, CLI).
#[derive(Debug)]
pub enum AppRequest {
    StartCall {
        destination: String,
        line: LineGroup,
        reply: oneshot::Sender<Result<SessionId, ControllerError>>,
    },
    /// Resolves once the call connects (`true`) or fails (`false`).
    WatchOutcome {
        id: SessionId,
        reply: oneshot::Sender<Result<oneshot::Receiver<bool>, ControllerError>>,
    },
    EndCall {
        id: SessionId,
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    /// Decline an invite. Succeeds even when the invite is already gone.
    RejectInvite {
        id: SessionId,
        reply: oneshot::Sender<()>,
    },
    SetMuted {
        id: SessionId,
        muted: bool,
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    SetHeld {
        id: SessionId,
        held: bool,
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    Snapshot {
        reply: oneshot::Sender<RegistrySnapshot>,
    },
    Shutdown,
}

/// Results of work the controller spawned off its own task.
#[derive(Debug)]
pub enum Internal {
    PermissionResolved { id: SessionId, granted: bool },
    PermissionChoice { id: SessionId, choice: PermissionChoice },
    DisconnectTimeout { id: SessionId },
}

/// Tagged union of everything the controller task consumes.
#[derive(Debug)]
pub enum ControllerEvent {
    Ui(UiAction),
    Sdk(SdkEvent),
    Push(PushEvent),
    Audio(AudioEvent),
    App(AppRequest),
    Internal(Internal),
}

