//! Recording fakes for the collaborator traits.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::collaborators::{
    AudioRouter, CallObserver, CallingSdk, Collaborators, ConnectParams, MediaPermissions,
    PermissionChoice, PermissionStatus, Telephony,
};
use super::{
    CallSession, CallState, ControllerHandle, EndReason, PendingInvite, QualityWarning,
    RegistrySnapshot, SdkError, SdkEvent, SessionId, TelephonyError,
};

/// Everything the controller asked a collaborator to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    ReportIncoming(SessionId, String),
    ReportStarted(SessionId),
    ReportConnected(SessionId),
    ReportEnded(SessionId, EndReason),
    Connect(SessionId, String),
    Accept(SessionId),
    Reject(SessionId),
    Disconnect(SessionId),
    SetMuted(SessionId, bool),
    SetHeld(SessionId, bool),
    Digits(SessionId, String),
    SpeakerRoute(bool),
    AudioEnabled(bool),
    RingbackStart,
    RingbackStop,
    Warnings {
        id: SessionId,
        warnings: BTreeSet<QualityWarning>,
        cleared: bool,
    },
    Ended {
        id: SessionId,
        state: CallState,
        reason: Option<EndReason>,
    },
}

pub struct Fake {
    records: Mutex<Vec<Record>>,
    permission: Mutex<PermissionStatus>,
    grant_on_request: AtomicBool,
    prompt_choice: Mutex<PermissionChoice>,
    pub fail_connect: AtomicBool,
    pub fail_accept: AtomicBool,
    pub refuse_incoming: AtomicBool,
    /// When set, `disconnect` immediately echoes a `Disconnected` event.
    echo: Mutex<Option<ControllerHandle>>,
}

impl Fake {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            permission: Mutex::new(PermissionStatus::Granted),
            grant_on_request: AtomicBool::new(true),
            prompt_choice: Mutex::new(PermissionChoice::Cancel),
            fail_connect: AtomicBool::new(false),
            fail_accept: AtomicBool::new(false),
            refuse_incoming: AtomicBool::new(false),
            echo: Mutex::new(None),
        })
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

    pub fn set_permission(&self, status: PermissionStatus, grant_on_request: bool) {
        *self.permission.lock().unwrap() = status;
        self.grant_on_request
            .store(grant_on_request, Ordering::SeqCst);
    }

    pub fn set_prompt_choice(&self, choice: PermissionChoice) {
        *self.prompt_choice.lock().unwrap() = choice;
    }

    pub fn echo_disconnects(&self, handle: ControllerHandle) {
        *self.echo.lock().unwrap() = Some(handle);
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Record) -> bool) -> usize {
        self.records().iter().filter(|r| pred(r)).count()
    }

    pub fn ended_reports(&self, id: SessionId) -> Vec<EndReason> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                Record::ReportEnded(rid, reason) if rid == id => Some(reason),
                _ => None,
            })
            .collect()
    }

    fn push(&self, record: Record) {
        self.records.lock().unwrap().push(record);
    }
}

impl Telephony for Fake {
    fn report_incoming_call(&self, id: SessionId, handle: &str) -> Result<(), TelephonyError> {
        if self.refuse_incoming.load(Ordering::SeqCst) {
            return Err(TelephonyError::Blocked);
        }
        self.push(Record::ReportIncoming(id, handle.to_string()));
        Ok(())
    }

    fn report_outgoing_call_started(&self, id: SessionId, _handle: &str) {
        self.push(Record::ReportStarted(id));
    }

    fn report_outgoing_call_connected(&self, id: SessionId) {
        self.push(Record::ReportConnected(id));
    }

    fn report_call_ended(&self, id: SessionId, reason: EndReason) {
        self.push(Record::ReportEnded(id, reason));
    }
}

impl CallingSdk for Fake {
    fn connect(&self, id: SessionId, params: &ConnectParams) -> Result<(), SdkError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SdkError::Connect("no access token".to_string()));
        }
        self.push(Record::Connect(id, params.to.clone()));
        Ok(())
    }

    fn accept(&self, invite: &PendingInvite) -> Result<(), SdkError> {
        if self.fail_accept.load(Ordering::SeqCst) {
            return Err(SdkError::Accept("invite expired".to_string()));
        }
        self.push(Record::Accept(invite.id));
        Ok(())
    }

    fn reject(&self, invite: &PendingInvite) {
        self.push(Record::Reject(invite.id));
    }

    fn disconnect(&self, id: SessionId) {
        self.push(Record::Disconnect(id));
        if let Some(handle) = self.echo.lock().unwrap().as_ref() {
            handle.sdk_event(SdkEvent::Disconnected { id, error: None });
        }
    }

    fn set_muted(&self, id: SessionId, muted: bool) {
        self.push(Record::SetMuted(id, muted));
    }

    fn set_held(&self, id: SessionId, held: bool) {
        self.push(Record::SetHeld(id, held));
    }

    fn send_digits(&self, id: SessionId, digits: &str) {
        self.push(Record::Digits(id, digits.to_string()));
    }
}

#[async_trait::async_trait]
impl MediaPermissions for Fake {
    fn check_microphone_permission(&self) -> PermissionStatus {
        *self.permission.lock().unwrap()
    }

    async fn request_permission(&self) -> bool {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.grant_on_request.load(Ordering::SeqCst)
    }

    async fn prompt_permission_denied(&self, _id: SessionId) -> PermissionChoice {
        *self.prompt_choice.lock().unwrap()
    }
}

impl AudioRouter for Fake {
    fn override_audio_route(&self, to_speaker: bool) {
        self.push(Record::SpeakerRoute(to_speaker));
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.push(Record::AudioEnabled(enabled));
    }

    fn play_ringback(&self) {
        self.push(Record::RingbackStart);
    }

    fn stop_ringback(&self) {
        self.push(Record::RingbackStop);
    }
}

impl CallObserver for Fake {
    fn registry_changed(&self, _snapshot: &RegistrySnapshot) {}

    fn call_ended(&self, session: &CallSession) {
        self.push(Record::Ended {
            id: session.id,
            state: session.state,
            reason: session.end_reason,
        });
    }

    fn quality_warnings_changed(
        &self,
        id: SessionId,
        warnings: &BTreeSet<QualityWarning>,
        cleared: bool,
    ) {
        self.push(Record::Warnings {
            id,
            warnings: warnings.clone(),
            cleared,
        });
    }
}

/// Poll snapshots until `pred` holds, for flows that go through spawned tasks.
pub async fn wait_for(
    handle: &ControllerHandle,
    pred: impl Fn(&RegistrySnapshot) -> bool,
) -> RegistrySnapshot {
    for _ in 0..200 {
        let snapshot = handle.snapshot().await.unwrap();
        if pred(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}
