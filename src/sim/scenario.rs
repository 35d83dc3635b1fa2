//! Command-line call scenarios against the simulated platform.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use super::{SimOptions, SimulatedDevice};
use crate::push::payload::{call_payload, cancel_payload};
use crate::push::parse_push_payload;
use crate::session::{
    CallSession, ControllerError, ControllerHandle, ControllerSettings, LineGroup,
    RegistrySnapshot, SessionController, SessionId, UiAction,
};

/// How long to wait for the controller to settle after a hangup.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(15);

/// What to do with a simulated incoming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingAction {
    Answer,
    Decline,
    /// The caller gives up before we answer.
    Cancel,
}

/// In-call actions for an outgoing call once it connects.
#[derive(Debug, Clone, Default)]
pub struct InCall {
    pub mute: bool,
    pub digits: Option<String>,
}

/// Place an outgoing call, hold it for `duration` and hang up from the app.
pub async fn run_outgoing(
    settings: ControllerSettings,
    destination: &str,
    line: u8,
    duration: Duration,
    in_call: InCall,
    opts: SimOptions,
) -> Result<()> {
    let (device, mut ended_rx) = SimulatedDevice::new(opts);
    let handle = SessionController::spawn(settings, device.collaborators());
    device.attach(handle.clone());

    println!();
    println!("=== Outgoing Call ===");
    println!("To:       {}", destination);
    println!("Line:     {}", LineGroup(line));
    println!("Duration: {}s", duration.as_secs());
    println!();

    let id = handle
        .request_outgoing_call_on(destination, LineGroup(line))
        .await
        .context("Call request refused")?;
    println!("session_id={}", id);

    let connected = match handle.outcome(id).await {
        Ok(rx) => rx.await.unwrap_or(false),
        // Already gone, e.g. abandoned at the microphone prompt
        Err(ControllerError::UnknownSession(_)) => false,
        Err(e) => return Err(e.into()),
    };
    println!("call_connected={}", connected);

    let mut finished = None;
    if connected {
        perform_in_call(&handle, id, &in_call).await?;
        finished = hold_call(&mut ended_rx, id, duration).await;
        if finished.is_none() {
            match handle.request_end_call(id).await {
                Ok(()) | Err(ControllerError::UnknownSession(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    let session = match finished {
        Some(session) => session,
        None => wait_ended(&mut ended_rx, id).await?,
    };
    print_summary(&session);
    handle.shutdown();
    Ok(())
}

/// Deliver an invite push from `from` and answer, decline or cancel it.
pub async fn run_incoming(
    settings: ControllerSettings,
    from: &str,
    action: IncomingAction,
    duration: Duration,
    opts: SimOptions,
) -> Result<()> {
    let (device, mut ended_rx) = SimulatedDevice::new(opts);
    let handle = SessionController::spawn(settings, device.collaborators());
    device.attach(handle.clone());

    let network_id = format!("CA{}", uuid::Uuid::new_v4().simple());
    let caller = if from.starts_with('+') {
        from.to_string()
    } else {
        format!("client:{}", from)
    };

    println!();
    println!("=== Incoming Call ===");
    println!("From:     {}", from);
    println!("Call SID: {}", network_id);
    println!();

    let invite = parse_push_payload(&call_payload(&network_id, &caller, "client:me"))
        .context("Invite payload did not decode")?;
    handle.push_event(invite);

    let id = wait_for_invite(&handle, &network_id).await?;
    println!("session_id={}", id);

    match action {
        IncomingAction::Cancel => {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let cancel = parse_push_payload(&cancel_payload(&network_id))
                .context("Cancel payload did not decode")?;
            handle.push_event(cancel);
            wait_idle(&handle).await?;
            println!("invite_cancelled=true");
        }
        IncomingAction::Decline => {
            handle.reject_invite(id).await?;
            wait_idle(&handle).await?;
            println!("invite_declined=true");
        }
        IncomingAction::Answer => {
            let connected = handle.accept_invite(id).await.unwrap_or(false);
            println!("call_connected={}", connected);
            if !connected {
                bail!("Call {} did not connect", id);
            }

            let finished = match hold_call(&mut ended_rx, id, duration).await {
                Some(session) => session,
                None => {
                    device.remote_hangup(id);
                    wait_ended(&mut ended_rx, id).await?
                }
            };
            print_summary(&finished);
        }
    }

    handle.shutdown();
    Ok(())
}

async fn perform_in_call(handle: &ControllerHandle, id: SessionId, in_call: &InCall) -> Result<()> {
    if in_call.mute {
        handle.set_muted(id, true).await?;
        println!("muted=true");
    }
    if let Some(digits) = &in_call.digits {
        // Keypad presses arrive from the telephony UI
        let (reply, rx) = tokio::sync::oneshot::channel();
        handle.ui_action(UiAction::PlayDigits {
            id,
            digits: digits.clone(),
            reply,
        });
        println!("digits_sent={}", rx.await.unwrap_or(false));
    }
    Ok(())
}

/// Keep the call up for `duration` or until interrupted. Returns the session
/// if it ended on its own in the meantime.
async fn hold_call(
    ended_rx: &mut mpsc::UnboundedReceiver<CallSession>,
    id: SessionId,
    duration: Duration,
) -> Option<CallSession> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => None,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, hanging up");
            None
        }
        session = recv_session(ended_rx, id) => session,
    }
}

async fn recv_session(
    ended_rx: &mut mpsc::UnboundedReceiver<CallSession>,
    id: SessionId,
) -> Option<CallSession> {
    while let Some(session) = ended_rx.recv().await {
        if session.id == id {
            return Some(session);
        }
    }
    None
}

async fn wait_ended(
    ended_rx: &mut mpsc::UnboundedReceiver<CallSession>,
    id: SessionId,
) -> Result<CallSession> {
    tokio::time::timeout(SETTLE_TIMEOUT, recv_session(ended_rx, id))
        .await
        .context("Timed out waiting for the call to end")?
        .context("Controller stopped before the call ended")
}

async fn poll_until<T>(
    handle: &ControllerHandle,
    what: &str,
    check: impl Fn(&RegistrySnapshot) -> Option<T>,
) -> Result<T> {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        let snapshot = handle.snapshot().await?;
        if let Some(found) = check(&snapshot) {
            return Ok(found);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_invite(handle: &ControllerHandle, network_id: &str) -> Result<SessionId> {
    poll_until(handle, "the invite", |snapshot| {
        snapshot
            .invites
            .iter()
            .find(|i| i.network_id == network_id)
            .map(|i| i.id)
    })
    .await
}

async fn wait_idle(handle: &ControllerHandle) -> Result<()> {
    poll_until(handle, "the registry to empty", |snapshot| {
        snapshot.is_empty().then_some(())
    })
    .await
}

fn print_summary(session: &CallSession) {
    println!();
    println!("final_state={}", session.state);
    match session.end_reason {
        Some(reason) => println!("end_reason={}", reason),
        None => println!("end_reason=none"),
    }
    if let Some(duration) = session.duration() {
        println!("duration_secs={}", duration.num_seconds());
    }
}
