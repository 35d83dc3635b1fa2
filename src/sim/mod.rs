//! Simulated platform: telephony UI, calling SDK, permissions and audio.
//!
//! Stands in for the real collaborators so the controller can be driven from
//! the command line. SDK callbacks are produced by spawned tasks after short
//! delays and posted back through the controller handle, the same way a real
//! SDK delivers them on its own thread.

pub mod scenario;

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::session::collaborators::{
    AudioRouter, CallObserver, CallingSdk, Collaborators, ConnectParams, MediaPermissions,
    PermissionChoice, PermissionStatus, Telephony,
};
use crate::session::{
    AudioEvent, CallSession, ControllerHandle, EndReason, PendingInvite, QualityWarning,
    RegistrySnapshot, SdkError, SdkEvent, SessionId, TelephonyError,
};

/// Behaviour knobs for the simulated platform.
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub deny_microphone: bool,
    pub prompt_choice: PermissionChoice,
    pub fail_connect: bool,
    /// Raise then clear a quality warning while connected
    pub degrade: bool,
    pub ring_delay: Duration,
    pub answer_delay: Duration,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            deny_microphone: false,
            prompt_choice: PermissionChoice::Cancel,
            fail_connect: false,
            degrade: false,
            ring_delay: Duration::from_millis(300),
            answer_delay: Duration::from_secs(1),
        }
    }
}

pub struct SimulatedDevice {
    opts: SimOptions,
    handle: OnceLock<ControllerHandle>,
    ended_tx: mpsc::UnboundedSender<CallSession>,
}

impl SimulatedDevice {
    /// Create the device and the stream of sessions it sees end.
    pub fn new(opts: SimOptions) -> (Arc<Self>, mpsc::UnboundedReceiver<CallSession>) {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let device = Arc::new(Self {
            opts,
            handle: OnceLock::new(),
            ended_tx,
        });
        (device, ended_rx)
    }

    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            telephony: self.clone(),
            sdk: self.clone(),
            permissions: self.clone(),
            audio: self.clone(),
            observer: self.clone(),
        }
    }

    /// Give the device the handle its callbacks are posted through.
    pub fn attach(&self, handle: ControllerHandle) {
        if self.handle.set(handle).is_err() {
            tracing::warn!("Simulated device already attached");
        }
    }

    /// The far end hangs up.
    pub fn remote_hangup(&self, id: SessionId) {
        self.emit_after(Duration::ZERO, SdkEvent::Disconnected { id, error: None });
    }

    fn emit_after(&self, delay: Duration, event: SdkEvent) {
        let Some(handle) = self.handle.get().cloned() else {
            tracing::warn!("Simulated device not attached, dropping {:?}", event);
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handle.sdk_event(event);
        });
    }

    fn activate_audio(&self) {
        if let Some(handle) = self.handle.get() {
            handle.audio_event(AudioEvent::Activated);
        }
    }

    fn schedule_degradation(&self, id: SessionId, after: Duration) {
        let raised: BTreeSet<QualityWarning> =
            [QualityWarning::HighRtt, QualityWarning::HighJitter].into();
        self.emit_after(
            after + Duration::from_secs(1),
            SdkEvent::QualityWarnings {
                id,
                current: raised.clone(),
                previous: BTreeSet::new(),
            },
        );
        self.emit_after(
            after + Duration::from_secs(3),
            SdkEvent::QualityWarnings {
                id,
                current: BTreeSet::new(),
                previous: raised,
            },
        );
    }
}

impl Telephony for SimulatedDevice {
    fn report_incoming_call(&self, id: SessionId, handle: &str) -> Result<(), TelephonyError> {
        tracing::info!("[telephony] Incoming call {} from {}", id, handle);
        Ok(())
    }

    fn report_outgoing_call_started(&self, id: SessionId, handle: &str) {
        tracing::info!("[telephony] Outgoing call {} to {} started", id, handle);
        self.activate_audio();
    }

    fn report_outgoing_call_connected(&self, id: SessionId) {
        tracing::info!("[telephony] Outgoing call {} connected", id);
    }

    fn report_call_ended(&self, id: SessionId, reason: EndReason) {
        tracing::info!("[telephony] Call {} ended: {}", id, reason);
    }
}

impl CallingSdk for SimulatedDevice {
    fn connect(&self, id: SessionId, params: &ConnectParams) -> Result<(), SdkError> {
        tracing::info!(
            "[sdk] Connecting {} to {} as {}",
            id,
            params.to,
            params.identity.as_deref().unwrap_or("anonymous")
        );
        let ring = self.opts.ring_delay;
        let answer = ring + self.opts.answer_delay;
        self.emit_after(ring, SdkEvent::Ringing { id });
        if self.opts.fail_connect {
            self.emit_after(
                answer,
                SdkEvent::FailedToConnect {
                    id,
                    error: "31480: temporarily unavailable".to_string(),
                },
            );
        } else {
            self.emit_after(answer, SdkEvent::Connected { id });
            if self.opts.degrade {
                self.schedule_degradation(id, answer);
            }
        }
        Ok(())
    }

    fn accept(&self, invite: &PendingInvite) -> Result<(), SdkError> {
        tracing::info!("[sdk] Accepting {} ({})", invite.id, invite.network_id);
        self.activate_audio();
        let delay = Duration::from_millis(200);
        self.emit_after(delay, SdkEvent::Connected { id: invite.id });
        if self.opts.degrade {
            self.schedule_degradation(invite.id, delay);
        }
        Ok(())
    }

    fn reject(&self, invite: &PendingInvite) {
        tracing::info!("[sdk] Rejecting {} ({})", invite.id, invite.network_id);
    }

    fn disconnect(&self, id: SessionId) {
        tracing::info!("[sdk] Disconnecting {}", id);
        self.emit_after(
            Duration::from_millis(100),
            SdkEvent::Disconnected { id, error: None },
        );
    }

    fn set_muted(&self, id: SessionId, muted: bool) {
        tracing::info!("[sdk] {} muted={}", id, muted);
    }

    fn set_held(&self, id: SessionId, held: bool) {
        tracing::info!("[sdk] {} held={}", id, held);
    }

    fn send_digits(&self, id: SessionId, digits: &str) {
        tracing::info!("[sdk] {} digits={}", id, digits);
    }
}

#[async_trait::async_trait]
impl MediaPermissions for SimulatedDevice {
    fn check_microphone_permission(&self) -> PermissionStatus {
        if self.opts.deny_microphone {
            PermissionStatus::Denied
        } else {
            PermissionStatus::Granted
        }
    }

    async fn request_permission(&self) -> bool {
        !self.opts.deny_microphone
    }

    async fn prompt_permission_denied(&self, id: SessionId) -> PermissionChoice {
        tracing::warn!(
            "[permissions] Microphone access denied for {}, user chose {:?}",
            id,
            self.opts.prompt_choice
        );
        self.opts.prompt_choice
    }
}

impl AudioRouter for SimulatedDevice {
    fn override_audio_route(&self, to_speaker: bool) {
        tracing::debug!(
            "[audio] Route -> {}",
            if to_speaker { "speaker" } else { "receiver" }
        );
    }

    fn set_audio_enabled(&self, enabled: bool) {
        tracing::debug!("[audio] Enabled={}", enabled);
    }

    fn play_ringback(&self) {
        tracing::info!("[audio] Ringback on");
    }

    fn stop_ringback(&self) {
        tracing::info!("[audio] Ringback off");
    }
}

impl CallObserver for SimulatedDevice {
    fn registry_changed(&self, snapshot: &RegistrySnapshot) {
        for session in &snapshot.sessions {
            tracing::debug!(
                "[ui] {} {} {} ({})",
                session.id,
                session.line,
                session.remote_handle,
                session.state
            );
        }
    }

    fn call_ended(&self, session: &CallSession) {
        // Receiver gone means the scenario already finished.
        let _ = self.ended_tx.send(session.clone());
    }

    fn quality_warnings_changed(
        &self,
        id: SessionId,
        warnings: &BTreeSet<QualityWarning>,
        cleared: bool,
    ) {
        let names: Vec<String> = warnings.iter().map(|w| w.to_string()).collect();
        if cleared {
            tracing::info!("[ui] {} quality recovered: {}", id, names.join(", "));
        } else {
            tracing::warn!("[ui] {} poor call quality: {}", id, names.join(", "));
        }
    }
}
