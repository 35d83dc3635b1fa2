//! Decoding of VoIP push payloads into controller events.

use serde::Deserialize;

use crate::session::PushEvent;

const MESSAGE_TYPE_CALL: &str = "twilio.voice.call";
const MESSAGE_TYPE_CANCEL: &str = "twilio.voice.cancel";

/// Fields of a voice push we care about.
#[derive(Debug, Clone, Deserialize)]
pub struct VoicePush {
    #[serde(rename = "twi_message_type")]
    pub message_type: String,
    #[serde(rename = "twi_call_sid")]
    pub call_sid: Option<String>,
    #[serde(rename = "twi_from")]
    pub from: Option<String>,
    #[serde(rename = "twi_to")]
    pub to: Option<String>,
}

/// Strip the `client:` scheme used for app-to-app calls.
fn display_handle(from: &str) -> String {
    from.strip_prefix("client:").unwrap_or(from).to_string()
}

/// Try to decode a push payload (JSON dictionary) into a `PushEvent`.
///
/// Returns `None` for payloads that are not voice pushes or lack a call SID.
pub fn parse_push_payload(json_str: &str) -> Option<PushEvent> {
    let v: serde_json::Value = serde_json::from_str(json_str).ok()?;

    if v.get("twi_message_type").is_none() {
        // Some relays wrap the dictionary under "data", either inline or as a string.
        let data = v.get("data")?;
        if let Some(data_str) = data.as_str() {
            return parse_push_payload(data_str);
        }
        return decode(serde_json::from_value(data.clone()).ok()?);
    }

    decode(serde_json::from_value(v).ok()?)
}

fn decode(push: VoicePush) -> Option<PushEvent> {
    let network_id = push.call_sid?;
    tracing::debug!(
        "Voice push {} for {}",
        network_id,
        push.to.as_deref().unwrap_or("(unknown)")
    );
    match push.message_type.as_str() {
        MESSAGE_TYPE_CALL => Some(PushEvent::Invite {
            network_id,
            from: push
                .from
                .as_deref()
                .map(display_handle)
                .unwrap_or_else(|| "Unknown".to_string()),
        }),
        MESSAGE_TYPE_CANCEL => Some(PushEvent::Cancelled { network_id }),
        other => {
            tracing::debug!("Ignoring push of type {}", other);
            None
        }
    }
}

/// Build a call payload, as the push service would deliver it.
pub fn call_payload(call_sid: &str, from: &str, to: &str) -> String {
    serde_json::json!({
        "twi_message_type": MESSAGE_TYPE_CALL,
        "twi_call_sid": call_sid,
        "twi_from": from,
        "twi_to": to,
    })
    .to_string()
}

/// Build a cancel payload for `call_sid`.
pub fn cancel_payload(call_sid: &str) -> String {
    serde_json::json!({
        "twi_message_type": MESSAGE_TYPE_CANCEL,
        "twi_call_sid": call_sid,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call_push() {
        let payload = call_payload("CA123", "client:alice", "client:bob");
        assert_eq!(
            parse_push_payload(&payload),
            Some(PushEvent::Invite {
                network_id: "CA123".to_string(),
                from: "alice".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_cancel_push() {
        assert_eq!(
            parse_push_payload(&cancel_payload("CA123")),
            Some(PushEvent::Cancelled {
                network_id: "CA123".to_string()
            })
        );
    }

    #[test]
    fn test_parse_wrapped_string_payload() {
        let inner = call_payload("CA9", "+15551234", "client:bob");
        let wrapped = serde_json::json!({ "data": inner }).to_string();
        assert!(matches!(
            parse_push_payload(&wrapped),
            Some(PushEvent::Invite { from, .. }) if from == "+15551234"
        ));
    }

    #[test]
    fn test_missing_call_sid_ignored() {
        let payload = r#"{"twi_message_type": "twilio.voice.call", "twi_from": "client:alice"}"#;
        assert!(parse_push_payload(payload).is_none());
    }

    #[test]
    fn test_other_payloads_ignored() {
        assert!(parse_push_payload(r#"{"aps": {"alert": "hi"}}"#).is_none());
        assert!(parse_push_payload(r#"{"twi_message_type": "other", "twi_call_sid": "CA1"}"#).is_none());
        assert!(parse_push_payload("not json").is_none());
    }
}
