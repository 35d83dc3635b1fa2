//! Session controller: the single owner of call state.
//!
//! Telephony-UI actions, push invites, SDK callbacks and audio callbacks all
//! arrive on independent contexts. They are posted as `ControllerEvent`s into
//! one unbounded mpsc channel and handled one at a time by a background tokio
//! task, so no two handlers ever interleave on the registry. Callers talk to
//! the task through a cloneable `ControllerHandle`.
//!
//! Slow work (permission prompts, the hangup watchdog) runs in spawned tasks
//! that post their result back as an `Internal` event.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::collaborators::{
    Collaborators, ConnectParams, PermissionChoice, PermissionStatus,
};
use super::event::{
    ActionReply, AppRequest, AudioEvent, ControllerEvent, Internal, PushEvent, SdkEvent,
    UiAction,
};
use super::{
    CallDirection, CallSession, CallState, ControllerError, EndOrigin, EndReason, LineGroup,
    PendingInvite, QualityWarning, Registry, RegistrySnapshot, SessionId, WarningDiff,
};

/// Unmatched cancels remembered so a late invite can be reported then ended.
const EARLY_CANCEL_MEMORY: usize = 32;

/// Tunables for the controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Number of line groups (1 or 2 in practice).
    pub line_groups: u8,
    /// Play a local ringback tone between "ringing" and "connected".
    pub play_custom_ringback: bool,
    /// Route audio to the speaker when a call connects.
    pub speaker_on_connect: bool,
    /// How long to wait for the SDK to confirm a local hangup.
    pub disconnect_timeout: Duration,
    /// Identity passed to the SDK on connect.
    pub identity: Option<String>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            line_groups: 1,
            play_custom_ringback: false,
            speaker_on_connect: true,
            disconnect_timeout: Duration::from_secs(10),
            identity: None,
        }
    }
}

/// Handle for posting events to the controller task.
#[derive(Clone, Debug)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<ControllerEvent>,
}

impl ControllerHandle {
    fn post(&self, event: ControllerEvent) -> bool {
        if self.tx.send(event).is_err() {
            tracing::error!("Session controller channel closed -- event dropped");
            return false;
        }
        true
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> AppRequest,
    ) -> Result<T, ControllerError> {
        let (reply, rx) = oneshot::channel();
        if !self.post(ControllerEvent::App(make(reply))) {
            return Err(ControllerError::Closed);
        }
        rx.await.map_err(|_| ControllerError::Closed)
    }

    /// Post a telephony-UI action. The action's reply carries fulfil/fail.
    pub fn ui_action(&self, action: UiAction) {
        self.post(ControllerEvent::Ui(action));
    }

    pub fn sdk_event(&self, event: SdkEvent) {
        self.post(ControllerEvent::Sdk(event));
    }

    pub fn push_event(&self, event: PushEvent) {
        self.post(ControllerEvent::Push(event));
    }

    pub fn audio_event(&self, event: AudioEvent) {
        self.post(ControllerEvent::Audio(event));
    }

    /// Place a call on line 0.
    pub async fn request_outgoing_call(
        &self,
        destination: &str,
    ) -> Result<SessionId, ControllerError> {
        self.request_outgoing_call_on(destination, LineGroup(0))
            .await
    }

    pub async fn request_outgoing_call_on(
        &self,
        destination: &str,
        line: LineGroup,
    ) -> Result<SessionId, ControllerError> {
        let destination = destination.to_string();
        self.request(|reply| AppRequest::StartCall {
            destination,
            line,
            reply,
        })
        .await?
    }

    /// Resolves `true` once the call connects, `false` if it fails or ends first.
    pub async fn outcome(&self, id: SessionId) -> Result<oneshot::Receiver<bool>, ControllerError> {
        self.request(|reply| AppRequest::WatchOutcome { id, reply })
            .await?
    }

    /// Answer an invite. Resolves `true` on connect, `false` otherwise
    /// (including when the invite was already cancelled).
    pub fn accept_invite(&self, id: SessionId) -> oneshot::Receiver<bool> {
        let (reply, rx) = oneshot::channel();
        self.ui_action(UiAction::Answer { id, reply });
        rx
    }

    pub async fn reject_invite(&self, id: SessionId) -> Result<(), ControllerError> {
        self.request(|reply| AppRequest::RejectInvite { id, reply })
            .await
    }

    /// Hang up from the app. Rejects an invite, disconnects a session.
    pub async fn request_end_call(&self, id: SessionId) -> Result<(), ControllerError> {
        self.request(|reply| AppRequest::EndCall { id, reply })
            .await?
    }

    pub async fn set_muted(&self, id: SessionId, muted: bool) -> Result<(), ControllerError> {
        self.request(|reply| AppRequest::SetMuted { id, muted, reply })
            .await?
    }

    pub async fn set_held(&self, id: SessionId, held: bool) -> Result<(), ControllerError> {
        self.request(|reply| AppRequest::SetHeld { id, held, reply })
            .await?
    }

    pub async fn snapshot(&self) -> Result<RegistrySnapshot, ControllerError> {
        self.request(|reply| AppRequest::Snapshot { reply }).await
    }

    pub fn shutdown(&self) {
        self.post(ControllerEvent::App(AppRequest::Shutdown));
    }
}

pub struct SessionController {
    settings: ControllerSettings,
    collab: Collaborators,
    registry: Registry,
    /// Weak so spawned work does not keep the task alive after all handles drop.
    tx: mpsc::WeakUnboundedSender<ControllerEvent>,
    /// Pending start/accept results, resolved once on connect or end.
    outcomes: HashMap<SessionId, Vec<oneshot::Sender<bool>>>,
    /// Sessions the telephony UI has been told about.
    announced: HashSet<SessionId>,
    /// Outgoing sessions still waiting on microphone permission.
    awaiting_permission: HashSet<SessionId>,
    early_cancels: VecDeque<String>,
    audio_enabled: bool,
    audio_session_active: bool,
    ringback_for: Option<SessionId>,
}

impl SessionController {
    /// Start the controller task and return a handle to it.
    pub fn spawn(settings: ControllerSettings, collab: Collaborators) -> ControllerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = Self::new(settings, collab, tx.downgrade());
        tokio::spawn(controller.run(rx));
        ControllerHandle { tx }
    }

    fn new(
        settings: ControllerSettings,
        collab: Collaborators,
        tx: mpsc::WeakUnboundedSender<ControllerEvent>,
    ) -> Self {
        Self {
            settings,
            collab,
            registry: Registry::new(),
            tx,
            outcomes: HashMap::new(),
            announced: HashSet::new(),
            awaiting_permission: HashSet::new(),
            early_cancels: VecDeque::new(),
            audio_enabled: true,
            audio_session_active: false,
            ringback_for: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ControllerEvent>) {
        tracing::debug!(
            "Session controller started ({} line group(s))",
            self.settings.line_groups
        );
        while let Some(event) = rx.recv().await {
            if matches!(event, ControllerEvent::App(AppRequest::Shutdown)) {
                break;
            }
            self.handle(event);
        }
        tracing::debug!("Session controller stopped");
    }

    fn handle(&mut self, event: ControllerEvent) {
        tracing::trace!("Controller event: {:?}", event);
        match event {
            ControllerEvent::App(AppRequest::Snapshot { reply }) => {
                let _ = reply.send(self.registry.snapshot());
                return;
            }
            ControllerEvent::App(request) => self.on_app_request(request),
            ControllerEvent::Ui(action) => self.on_ui_action(action),
            ControllerEvent::Sdk(event) => self.on_sdk_event(event),
            ControllerEvent::Push(event) => self.on_push_event(event),
            ControllerEvent::Audio(event) => self.on_audio_event(event),
            ControllerEvent::Internal(event) => self.on_internal(event),
        }
        self.collab
            .observer
            .registry_changed(&self.registry.snapshot());
    }

    // --- Event sources ---

    fn on_app_request(&mut self, request: AppRequest) {
        match request {
            AppRequest::StartCall {
                destination,
                line,
                reply,
            } => {
                let result = self.start_outgoing(SessionId::new(), &destination, line, None);
                let _ = reply.send(result);
            }
            AppRequest::WatchOutcome { id, reply } => {
                let _ = reply.send(self.watch_outcome(id));
            }
            AppRequest::EndCall { id, reply } => {
                let _ = reply.send(self.end_call(id, EndOrigin::App));
            }
            AppRequest::RejectInvite { id, reply } => {
                if self.registry.invite(id).is_some() {
                    let _ = self.end_call(id, EndOrigin::App);
                } else {
                    tracing::debug!("Reject for {}: invite already resolved", id);
                }
                let _ = reply.send(());
            }
            AppRequest::SetMuted { id, muted, reply } => {
                let _ = reply.send(self.set_muted(id, muted));
            }
            AppRequest::SetHeld { id, held, reply } => {
                let _ = reply.send(self.set_held(id, held));
            }
            AppRequest::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            AppRequest::Shutdown => {}
        }
    }

    fn on_ui_action(&mut self, action: UiAction) {
        match action {
            UiAction::Start { id, handle, reply } => {
                let Some(line) = self.free_line_for_outgoing() else {
                    tracing::warn!("Start action for {}: every line is busy", id);
                    let _ = reply.send(false);
                    return;
                };
                // Fulfilled when the SDK reports connected.
                if let Err(e) = self.start_outgoing(id, &handle, line, Some(reply)) {
                    tracing::warn!("Start action for {} failed: {}", id, e);
                }
            }
            UiAction::Answer { id, reply } => self.answer(id, reply),
            UiAction::End { id, reply } => {
                let ok = match self.end_call(id, EndOrigin::Telephony) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("End action: {}", e);
                        false
                    }
                };
                let _ = reply.send(ok);
            }
            UiAction::SetHeld { id, on_hold, reply } => {
                let result = self.set_held(id, on_hold);
                if let Err(ref e) = result {
                    tracing::warn!("Hold action: {}", e);
                }
                let _ = reply.send(result.is_ok());
            }
            UiAction::SetMuted { id, muted, reply } => {
                let result = self.set_muted(id, muted);
                if let Err(ref e) = result {
                    tracing::warn!("Mute action: {}", e);
                }
                let _ = reply.send(result.is_ok());
            }
            UiAction::PlayDigits { id, digits, reply } => {
                let ok = match self.registry.session(id) {
                    Some(s) if s.state == CallState::Connected => {
                        self.collab.sdk.send_digits(id, &digits);
                        true
                    }
                    Some(s) => {
                        tracing::warn!("Digits for {} ignored: call is {}", id, s.state);
                        false
                    }
                    None => {
                        tracing::warn!("Digits for unknown call {}", id);
                        false
                    }
                };
                let _ = reply.send(ok);
            }
            UiAction::Reset => self.reset(),
        }
    }

    fn on_sdk_event(&mut self, event: SdkEvent) {
        let id = event.id();
        let Some(session) = self.registry.session(id) else {
            // Covers duplicate disconnects and callbacks for calls already torn down.
            tracing::debug!("SDK event for unknown call {}, ignoring: {:?}", id, event);
            return;
        };
        let state = session.state;
        let local_end = session.local_end;
        let resume_state = session.resume_state;

        match event {
            SdkEvent::Ringing { .. } => {
                if self.transition(id, CallState::Ringing) {
                    tracing::info!("Call {} ringing", id);
                    if self.settings.play_custom_ringback {
                        self.start_ringback(id);
                    }
                }
            }
            SdkEvent::Connected { .. } => {
                if local_end.is_some() {
                    tracing::info!("Call {} connected after local hangup, ignoring", id);
                    return;
                }
                if state == CallState::Reconnecting {
                    self.on_reconnected(id, resume_state);
                } else {
                    self.on_connected(id);
                }
            }
            SdkEvent::FailedToConnect { error, .. } => {
                tracing::warn!("Call {} failed to connect: {}", id, error);
                self.finish_session(id, EndReason::Failed);
            }
            SdkEvent::Reconnecting { error, .. } => {
                if self.transition(id, CallState::Reconnecting) {
                    tracing::warn!("Call {} reconnecting: {}", id, error);
                }
            }
            SdkEvent::Reconnected { .. } => {
                if state == CallState::Reconnecting {
                    self.on_reconnected(id, resume_state);
                }
            }
            SdkEvent::Disconnected { error, .. } => {
                let reason = match (local_end, error) {
                    (Some(_), _) => EndReason::LocalEnded,
                    (None, Some(error)) => {
                        tracing::warn!("Call {} failed: {}", id, error);
                        EndReason::Failed
                    }
                    (None, None) => EndReason::RemoteEnded,
                };
                self.finish_session(id, reason);
            }
            SdkEvent::QualityWarnings {
                current, previous, ..
            } => self.on_quality_warnings(id, current, previous),
        }
    }

    fn on_push_event(&mut self, event: PushEvent) {
        match event {
            PushEvent::Invite { network_id, from } => self.on_invite(network_id, from),
            PushEvent::Cancelled { network_id } => self.on_invite_cancelled(&network_id),
        }
    }

    fn on_audio_event(&mut self, event: AudioEvent) {
        let active = event == AudioEvent::Activated;
        if active == self.audio_session_active {
            tracing::debug!("Audio session already {:?}, ignoring", event);
            return;
        }
        self.audio_session_active = active;
        tracing::debug!("Audio session {:?}", event);
        if active {
            self.set_audio_enabled(true);
        }
    }

    fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::PermissionResolved { id, granted } => {
                if !self.awaiting_permission.contains(&id) {
                    tracing::debug!("Permission result for {} arrived after the call ended", id);
                    return;
                }
                if granted {
                    self.place_call(id);
                } else {
                    self.prompt_permission_denied(id);
                }
            }
            Internal::PermissionChoice { id, choice } => {
                if !self.awaiting_permission.contains(&id) {
                    tracing::debug!("Permission choice for {} arrived after the call ended", id);
                    return;
                }
                match choice {
                    PermissionChoice::ContinueWithoutMicrophone => {
                        tracing::info!("Continuing call {} without microphone", id);
                        self.place_call(id);
                    }
                    PermissionChoice::OpenSettings | PermissionChoice::Cancel => {
                        tracing::info!("Call {} abandoned at permission prompt ({:?})", id, choice);
                        self.finish_session(id, EndReason::PermissionDenied);
                    }
                }
            }
            Internal::DisconnectTimeout { id } => {
                let disconnecting = self
                    .registry
                    .session(id)
                    .is_some_and(|s| s.state == CallState::Disconnecting);
                if disconnecting {
                    tracing::warn!(
                        "SDK did not confirm hangup of {} within {:?}, finishing locally",
                        id,
                        self.settings.disconnect_timeout
                    );
                    self.finish_session(id, EndReason::LocalEnded);
                }
            }
        }
    }

    // --- Outgoing calls ---

    /// Create an outgoing session and start the permission check.
    ///
    /// `ui_reply` is set when the telephony UI itself asked for the call: it
    /// already knows the call, and expects fulfil/fail once it connects or
    /// fails. On error the reply is failed immediately.
    fn start_outgoing(
        &mut self,
        id: SessionId,
        destination: &str,
        line: LineGroup,
        ui_reply: Option<ActionReply>,
    ) -> Result<SessionId, ControllerError> {
        let refused = if line.0 >= self.settings.line_groups {
            Some(ControllerError::InvalidLine {
                line,
                configured: self.settings.line_groups,
            })
        } else if let Some(existing) = self.registry.busy_session_on(line) {
            Some(ControllerError::LineBusy {
                line,
                existing: existing.id,
            })
        } else if self.registry.contains(id) {
            Some(ControllerError::InvalidState {
                id,
                state: CallState::Connecting,
                action: "start a call with a duplicate id",
            })
        } else {
            None
        };
        if let Some(e) = refused {
            if let Some(reply) = ui_reply {
                let _ = reply.send(false);
            }
            return Err(e);
        }

        self.registry
            .insert_session(CallSession::outgoing(id, destination, line));
        if let Some(reply) = ui_reply {
            self.announced.insert(id);
            self.outcomes.entry(id).or_default().push(reply);
        }
        tracing::info!("Outgoing call {} to {} on {}", id, destination, line);

        self.awaiting_permission.insert(id);
        match self.collab.permissions.check_microphone_permission() {
            PermissionStatus::Granted => self.place_call(id),
            PermissionStatus::Denied => self.prompt_permission_denied(id),
            PermissionStatus::Undetermined => {
                let permissions = Arc::clone(&self.collab.permissions);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let granted = permissions.request_permission().await;
                    post_internal(&tx, Internal::PermissionResolved { id, granted });
                });
            }
        }
        Ok(id)
    }

    fn prompt_permission_denied(&mut self, id: SessionId) {
        tracing::warn!("Microphone permission not granted for call {}", id);
        let permissions = Arc::clone(&self.collab.permissions);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let choice = permissions.prompt_permission_denied(id).await;
            post_internal(&tx, Internal::PermissionChoice { id, choice });
        });
    }

    /// Permission settled: tell the telephony UI and the SDK.
    fn place_call(&mut self, id: SessionId) {
        self.awaiting_permission.remove(&id);
        let Some(session) = self.registry.session(id) else {
            return;
        };
        if session.state != CallState::Connecting || session.local_end.is_some() {
            return;
        }
        let handle = session.remote_handle.clone();

        self.set_audio_enabled(false);
        if self.announced.insert(id) {
            self.collab
                .telephony
                .report_outgoing_call_started(id, &handle);
        }

        let params = ConnectParams {
            to: handle,
            identity: self.settings.identity.clone(),
        };
        if let Err(e) = self.collab.sdk.connect(id, &params) {
            tracing::warn!("Call {}: {}", id, e);
            self.finish_session(id, EndReason::Failed);
        }
    }

    fn watch_outcome(&mut self, id: SessionId) -> Result<oneshot::Receiver<bool>, ControllerError> {
        let session = self
            .registry
            .session(id)
            .ok_or(ControllerError::UnknownSession(id))?;
        let (tx, rx) = oneshot::channel();
        match session.state {
            CallState::InviteReceived | CallState::Connecting | CallState::Ringing => {
                self.outcomes.entry(id).or_default().push(tx);
            }
            CallState::Connected | CallState::OnHold | CallState::Reconnecting => {
                let _ = tx.send(true);
            }
            CallState::Disconnecting | CallState::Disconnected | CallState::Failed => {
                let _ = tx.send(false);
            }
        }
        Ok(rx)
    }

    // --- Incoming calls ---

    fn on_invite(&mut self, network_id: String, from: String) {
        if self.registry.invite_by_network_id(&network_id).is_some()
            || self.session_for_network_id(&network_id).is_some()
        {
            tracing::debug!("Duplicate invite {} from {}, ignoring", network_id, from);
            return;
        }

        let line = self.free_line_for_invite();
        let invite = PendingInvite {
            id: SessionId::new(),
            network_id,
            remote_handle: from,
            received_at: chrono::Utc::now(),
            line,
        };
        let id = invite.id;
        self.registry.insert_invite(invite.clone());

        // The system requires the report before anything else happens with the push.
        if let Err(e) = self
            .collab
            .telephony
            .report_incoming_call(id, &invite.remote_handle)
        {
            tracing::warn!("Telephony UI refused incoming call {}: {}", id, e);
            self.registry.remove_invite(id);
            self.collab.sdk.reject(&invite);
            return;
        }
        tracing::info!(
            "Incoming call {} from {} ({})",
            id,
            invite.remote_handle,
            invite.network_id
        );

        if let Some(pos) = self
            .early_cancels
            .iter()
            .position(|n| *n == invite.network_id)
        {
            self.early_cancels.remove(pos);
            tracing::info!("Invite {} was cancelled before it arrived, ending", id);
            self.registry.remove_invite(id);
            self.collab
                .telephony
                .report_call_ended(id, EndReason::Cancelled);
        }
    }

    fn on_invite_cancelled(&mut self, network_id: &str) {
        let Some(id) = self.registry.invite_by_network_id(network_id).map(|i| i.id) else {
            if self.session_for_network_id(network_id).is_none() {
                tracing::debug!("Cancel for unknown invite {}, remembering", network_id);
                if self.early_cancels.len() == EARLY_CANCEL_MEMORY {
                    self.early_cancels.pop_front();
                }
                self.early_cancels.push_back(network_id.to_string());
            } else {
                tracing::debug!("Cancel for {} arrived after answer, ignoring", network_id);
            }
            return;
        };
        tracing::info!("Invite {} cancelled by caller", id);
        self.registry.remove_invite(id);
        self.collab
            .telephony
            .report_call_ended(id, EndReason::Cancelled);
    }

    fn answer(&mut self, id: SessionId, reply: ActionReply) {
        let Some(invite) = self.registry.invite(id).cloned() else {
            tracing::warn!("Answer for unknown invite {} (cancelled or already resolved)", id);
            let _ = reply.send(false);
            return;
        };

        // Other calls on the line are held once this one connects.
        if let Some(session) = self.registry.promote_invite(id) {
            session.transition(CallState::Connecting);
        }
        self.announced.insert(id);
        self.outcomes.entry(id).or_default().push(reply);
        self.set_audio_enabled(false);
        tracing::info!("Answering call {} from {}", id, invite.remote_handle);

        if let Err(e) = self.collab.sdk.accept(&invite) {
            tracing::warn!("Call {}: {}", id, e);
            self.finish_session(id, EndReason::Failed);
        }
    }

    // --- Shared lifecycle ---

    fn on_connected(&mut self, id: SessionId) {
        // Reconnects and resumes have their own paths.
        let can_connect = self
            .registry
            .session(id)
            .is_some_and(|s| matches!(s.state, CallState::Connecting | CallState::Ringing));
        if !can_connect {
            tracing::debug!("Call {}: ignoring connected callback", id);
            return;
        }
        self.hold_others(id);
        self.transition(id, CallState::Connected);
        tracing::info!("Call {} connected", id);
        self.stop_ringback(id);
        self.resolve_outcome(id, true);

        let outgoing = self
            .registry
            .session(id)
            .is_some_and(|s| s.direction == CallDirection::Outgoing);
        if outgoing {
            self.collab.telephony.report_outgoing_call_connected(id);
        }
        if self.settings.speaker_on_connect {
            self.collab.audio.override_audio_route(true);
        }
    }

    /// Network recovered: go back to where the call was before it dropped.
    fn on_reconnected(&mut self, id: SessionId, resume_state: Option<CallState>) {
        let resume = resume_state.unwrap_or(CallState::Connected);
        if resume == CallState::Connected {
            self.hold_others(id);
        }
        if self.transition(id, resume) {
            tracing::info!("Call {} reconnected ({})", id, resume);
        }
    }

    /// Hang up locally. Invites are rejected, sessions disconnected.
    fn end_call(&mut self, id: SessionId, origin: EndOrigin) -> Result<(), ControllerError> {
        if let Some(invite) = self.registry.remove_invite(id) {
            tracing::info!("Rejecting invite {} ({})", id, origin);
            self.collab.sdk.reject(&invite);
            if origin == EndOrigin::App {
                self.collab
                    .telephony
                    .report_call_ended(id, EndReason::LocalEnded);
            }
            return Ok(());
        }

        let Some(session) = self.registry.session_mut(id) else {
            tracing::warn!("End for unknown call {}", id);
            return Err(ControllerError::UnknownSession(id));
        };
        if session.local_end.is_some() {
            return Ok(());
        }
        session.local_end = Some(origin);
        tracing::info!("Ending call {} ({})", id, origin);

        if self.awaiting_permission.contains(&id) {
            // Nothing was sent to the SDK yet.
            self.finish_session(id, EndReason::LocalEnded);
            return Ok(());
        }

        self.transition(id, CallState::Disconnecting);
        self.stop_ringback(id);
        self.collab.sdk.disconnect(id);

        let timeout = self.settings.disconnect_timeout;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            post_internal(&tx, Internal::DisconnectTimeout { id });
        });
        Ok(())
    }

    /// Terminal handling. Runs at most once per session: the session is
    /// removed from the registry before returning.
    fn finish_session(&mut self, id: SessionId, reason: EndReason) {
        let Some(session) = self.registry.session_mut(id) else {
            return;
        };
        let local_end = session.local_end;
        if !session.terminate(reason) {
            return;
        }
        let ended = session.clone();
        tracing::info!("Call {} ended: {} ({})", id, ended.state, reason);

        self.awaiting_permission.remove(&id);
        self.resolve_outcome(id, false);
        self.stop_ringback(id);

        // The telephony UI already knows about ends it asked for.
        if self.announced.remove(&id) && local_end != Some(EndOrigin::Telephony) {
            self.collab.telephony.report_call_ended(id, reason);
        }

        self.collab.observer.call_ended(&ended);
        self.registry.remove_session(id);
        if self.registry.session_ids().is_empty() {
            self.set_audio_enabled(true);
        }
    }

    fn reset(&mut self) {
        tracing::warn!("Telephony UI reset, dropping all calls");
        for id in self.registry.invite_ids() {
            if let Some(invite) = self.registry.remove_invite(id) {
                self.collab.sdk.reject(&invite);
            }
        }
        for id in self.registry.session_ids() {
            let needs_disconnect = !self.awaiting_permission.contains(&id);
            if let Some(session) = self.registry.session_mut(id) {
                session.local_end = Some(EndOrigin::Telephony);
            }
            if needs_disconnect {
                self.collab.sdk.disconnect(id);
            }
            self.finish_session(id, EndReason::LocalEnded);
        }
        self.set_audio_enabled(true);
    }

    fn set_muted(&mut self, id: SessionId, muted: bool) -> Result<(), ControllerError> {
        let session = self
            .registry
            .session_mut(id)
            .ok_or(ControllerError::UnknownSession(id))?;
        if session.state.is_terminal() || session.state == CallState::Disconnecting {
            return Err(ControllerError::InvalidState {
                id,
                state: session.state,
                action: "change mute",
            });
        }
        session.muted = muted;
        self.collab.sdk.set_muted(id, muted);
        Ok(())
    }

    fn set_held(&mut self, id: SessionId, held: bool) -> Result<(), ControllerError> {
        let state = self
            .registry
            .session(id)
            .ok_or(ControllerError::UnknownSession(id))?
            .state;
        let (from, to, action) = if held {
            (CallState::Connected, CallState::OnHold, "hold")
        } else {
            (CallState::OnHold, CallState::Connected, "resume")
        };
        if state != from {
            return Err(ControllerError::InvalidState { id, state, action });
        }
        if !held {
            self.hold_others(id);
        }
        self.transition(id, to);
        self.collab.sdk.set_held(id, held);
        tracing::info!("Call {} {}", id, if held { "on hold" } else { "resumed" });
        Ok(())
    }

    /// Keep at most one connected call per line: hold the others.
    fn hold_others(&mut self, id: SessionId) {
        if let Some(line) = self.registry.session(id).map(|s| s.line) {
            self.hold_others_on(line, id);
        }
    }

    fn hold_others_on(&mut self, line: LineGroup, except: SessionId) {
        for other in self.registry.connected_on(line, except) {
            tracing::info!("Holding call {} on {}", other, line);
            self.collab.sdk.set_held(other, true);
            self.transition(other, CallState::OnHold);
        }
        // A call that dropped while active must come back held.
        for other in self.registry.reconnecting_active_on(line, except) {
            tracing::info!("Holding reconnecting call {} on {}", other, line);
            self.collab.sdk.set_held(other, true);
            if let Some(session) = self.registry.session_mut(other) {
                session.resume_state = Some(CallState::OnHold);
            }
        }
    }

    fn on_quality_warnings(
        &mut self,
        id: SessionId,
        current: BTreeSet<QualityWarning>,
        previous: BTreeSet<QualityWarning>,
    ) {
        let Some(session) = self.registry.session_mut(id) else {
            return;
        };
        let mut diff = WarningDiff::between(&current, &previous);
        diff.raised.retain(|w| !session.active_warnings.contains(w));
        // Once tracking, only warnings we hold as active can clear.
        if session.warnings_seen {
            diff.cleared.retain(|w| session.active_warnings.contains(w));
        }
        session.active_warnings = current;
        session.warnings_seen = true;

        if !diff.raised.is_empty() {
            tracing::warn!("Call {} quality warnings raised: {:?}", id, diff.raised);
            self.collab
                .observer
                .quality_warnings_changed(id, &diff.raised, false);
        }
        if !diff.cleared.is_empty() {
            tracing::info!("Call {} quality warnings cleared: {:?}", id, diff.cleared);
            self.collab
                .observer
                .quality_warnings_changed(id, &diff.cleared, true);
        }
    }

    // --- Helpers ---

    fn transition(&mut self, id: SessionId, next: CallState) -> bool {
        let Some(session) = self.registry.session_mut(id) else {
            return false;
        };
        let from = session.state;
        if session.transition(next) {
            tracing::debug!("Call {}: {} -> {}", id, from, next);
            true
        } else {
            tracing::debug!("Call {}: ignoring {} -> {}", id, from, next);
            false
        }
    }

    fn resolve_outcome(&mut self, id: SessionId, success: bool) {
        for reply in self.outcomes.remove(&id).unwrap_or_default() {
            let _ = reply.send(success);
        }
    }

    fn set_audio_enabled(&mut self, enabled: bool) {
        if self.audio_enabled != enabled {
            self.audio_enabled = enabled;
            self.collab.audio.set_audio_enabled(enabled);
        }
    }

    fn start_ringback(&mut self, id: SessionId) {
        if self.ringback_for.is_none() {
            self.ringback_for = Some(id);
            self.collab.audio.play_ringback();
        }
    }

    fn stop_ringback(&mut self, id: SessionId) {
        if self.ringback_for == Some(id) {
            self.ringback_for = None;
            self.collab.audio.stop_ringback();
        }
    }

    fn session_for_network_id(&self, network_id: &str) -> Option<SessionId> {
        self.registry
            .session_ids()
            .into_iter()
            .find(|id| {
                self.registry
                    .session(*id)
                    .and_then(|s| s.network_id.as_deref())
                    == Some(network_id)
            })
    }

    fn lines(&self) -> impl Iterator<Item = LineGroup> {
        (0..self.settings.line_groups.max(1)).map(LineGroup)
    }

    fn free_line_for_outgoing(&self) -> Option<LineGroup> {
        self.lines()
            .find(|line| self.registry.busy_session_on(*line).is_none())
    }

    fn free_line_for_invite(&self) -> LineGroup {
        self.lines()
            .find(|line| self.registry.line_is_free(*line))
            .unwrap_or_default()
    }
}

fn post_internal(tx: &mpsc::WeakUnboundedSender<ControllerEvent>, event: Internal) {
    match tx.upgrade() {
        Some(tx) => {
            let _ = tx.send(ControllerEvent::Internal(event));
        }
        None => tracing::debug!("Controller gone, dropping {:?}", event),
    }
}
