//! Seams to the subsystems the controller drives but does not own.
//!
//! Everything here is called from the controller task, so implementations must
//! return quickly. Outcomes that take time (connect, accept, disconnect) come
//! back later as `SdkEvent`s rather than as return values.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::{
    CallSession, EndReason, PendingInvite, QualityWarning, RegistrySnapshot, SdkError, SessionId,
    TelephonyError,
};

/// Native telephony UI (the OS call sheet / dialer integration).
pub trait Telephony: Send + Sync {
    /// Register an incoming call so the system UI appears.
    fn report_incoming_call(&self, id: SessionId, handle: &str) -> Result<(), TelephonyError>;

    fn report_outgoing_call_started(&self, id: SessionId, handle: &str);

    fn report_outgoing_call_connected(&self, id: SessionId);

    fn report_call_ended(&self, id: SessionId, reason: EndReason);
}

/// Parameters forwarded to the SDK when placing a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub to: String,
    pub identity: Option<String>,
}

/// The calling SDK. `id` is passed so the SDK tags its events with it.
pub trait CallingSdk: Send + Sync {
    fn connect(&self, id: SessionId, params: &ConnectParams) -> Result<(), SdkError>;

    fn accept(&self, invite: &PendingInvite) -> Result<(), SdkError>;

    fn reject(&self, invite: &PendingInvite);

    fn disconnect(&self, id: SessionId);

    fn set_muted(&self, id: SessionId, muted: bool);

    fn set_held(&self, id: SessionId, held: bool);

    fn send_digits(&self, id: SessionId, digits: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
    Undetermined,
}

/// User's answer to the "microphone permission not granted" prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionChoice {
    ContinueWithoutMicrophone,
    OpenSettings,
    Cancel,
}

/// Microphone permission and the prompt shown when it is denied.
#[async_trait::async_trait]
pub trait MediaPermissions: Send + Sync {
    fn check_microphone_permission(&self) -> PermissionStatus;

    /// Ask the user for permission. Only called when undetermined.
    async fn request_permission(&self) -> bool;

    /// Offer continue / settings / cancel for a call whose permission was denied.
    async fn prompt_permission_denied(&self, id: SessionId) -> PermissionChoice;
}

/// Local audio side effects.
pub trait AudioRouter: Send + Sync {
    fn override_audio_route(&self, to_speaker: bool);

    /// Enable or disable the audio device. Called only on edges.
    fn set_audio_enabled(&self, enabled: bool);

    fn play_ringback(&self);

    fn stop_ringback(&self);
}

/// UI layer notifications.
pub trait CallObserver: Send + Sync {
    fn registry_changed(&self, snapshot: &RegistrySnapshot);

    /// A session reached its terminal state and is about to leave the registry.
    fn call_ended(&self, session: &CallSession);

    fn quality_warnings_changed(
        &self,
        id: SessionId,
        warnings: &BTreeSet<QualityWarning>,
        cleared: bool,
    );
}

/// Every collaborator the controller needs, bundled for `SessionController::spawn`.
#[derive(Clone)]
pub struct Collaborators {
    pub telephony: Arc<dyn Telephony>,
    pub sdk: Arc<dyn CallingSdk>,
    pub permissions: Arc<dyn MediaPermissions>,
    pub audio: Arc<dyn AudioRouter>,
    pub observer: Arc<dyn CallObserver>,
}
