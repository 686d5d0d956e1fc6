//! Client ↔ session wire protocol.
//!
//! Text frames carry a JSON envelope:
//!
//! ```json
//! { "type": "...", "data": {...}, "sessionId": "...",
//!   "sequence": 0, "timestamp": "..." }
//! ```
//!
//! Client→server types: `init`, `text`, `audio`, `listening_control`.
//! Server→client: `response` (text deltas and events), `error`,
//! `listening_state`, and the `init` ack. Binary server→client audio
//! chunks are preceded by a flat `audio_meta` JSON message.
//!
//! Binary client→server frames on the combined endpoint start with an
//! 8-byte header `[sampleRate:u32 LE][channels:u16 LE][_:2]`; the
//! audio-only endpoint accepts bare PCM.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use chorus_domain::{Error, Result};

pub const TYPE_INIT: &str = "init";
pub const TYPE_TEXT: &str = "text";
pub const TYPE_AUDIO: &str = "audio";
pub const TYPE_LISTENING_CONTROL: &str = "listening_control";

/// Length of the PCM framing header on the combined endpoint.
pub const PCM_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Validation(format!("bad envelope: {e}")))
    }
}

// ── Server→client builders ─────────────────────────────────────────

pub fn init_ack(session_id: &str, user_id: &str) -> String {
    envelope_json(
        "init",
        serde_json::json!({
            "status": "connected",
            "sessionId": session_id,
            "userId": user_id,
        }),
        Some(session_id),
        None,
    )
}

pub fn text_delta(session_id: &str, sequence: u64, content: &str) -> String {
    envelope_json(
        "response",
        serde_json::json!({
            "content": content,
            "type": "text_delta",
            "timestamp": Utc::now().to_rfc3339(),
        }),
        Some(session_id),
        Some(sequence),
    )
}

pub fn event(session_id: &str, name: &str, payload: serde_json::Value) -> String {
    envelope_json(
        "response",
        serde_json::json!({
            "content": payload,
            "type": "event",
            "event": name,
            "timestamp": Utc::now().to_rfc3339(),
        }),
        Some(session_id),
        None,
    )
}

pub fn listening_state(session_id: &str, mode: &str) -> String {
    envelope_json(
        "listening_state",
        serde_json::json!({
            "mode": mode,
            "timestamp": Utc::now().to_rfc3339(),
        }),
        Some(session_id),
        None,
    )
}

pub fn error_msg(session_id: Option<&str>, code: &str, message: &str) -> String {
    envelope_json(
        "error",
        serde_json::json!({ "code": code, "message": message }),
        session_id,
        None,
    )
}

/// Flat metadata message preceding each binary audio chunk.
pub fn audio_meta(session_id: &str, index: u64, size: usize) -> String {
    serde_json::json!({
        "type": "audio_meta",
        "index": index,
        "sessionId": session_id,
        "size": size,
    })
    .to_string()
}

fn envelope_json(
    kind: &str,
    data: serde_json::Value,
    session_id: Option<&str>,
    sequence: Option<u64>,
) -> String {
    let env = Envelope {
        kind: kind.to_string(),
        data,
        session_id: session_id.map(str::to_string),
        sequence,
        timestamp: Some(Utc::now().to_rfc3339()),
    };
    serde_json::to_string(&env).unwrap_or_else(|e| {
        tracing::error!(error = %e, "envelope serialization failed");
        String::from("{\"type\":\"error\"}")
    })
}

// ── Binary audio framing ───────────────────────────────────────────

/// Parse a combined-endpoint binary frame: header + PCM samples.
pub fn parse_framed_pcm(bytes: &[u8]) -> Result<(u32, u16, &[u8])> {
    if bytes.len() < PCM_HEADER_LEN {
        return Err(Error::Validation(format!(
            "binary frame too short: {} bytes",
            bytes.len()
        )));
    }
    let mut rate = [0u8; 4];
    rate.copy_from_slice(&bytes[0..4]);
    let sample_rate = u32::from_le_bytes(rate);
    let mut chans = [0u8; 2];
    chans.copy_from_slice(&bytes[4..6]);
    let channels = u16::from_le_bytes(chans);
    if sample_rate == 0 || channels == 0 {
        return Err(Error::Validation(format!(
            "bad audio framing: rate={sample_rate} channels={channels}"
        )));
    }
    Ok((sample_rate, channels, &bytes[PCM_HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let env = Envelope::parse(
            r#"{"type":"text","data":{"content":"hi"},"sessionId":"s1","sequence":3,"timestamp":"2026-08-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(env.kind, "text");
        assert_eq!(env.data["content"], "hi");
        assert_eq!(env.session_id.as_deref(), Some("s1"));
        assert_eq!(env.sequence, Some(3));
    }

    #[test]
    fn envelope_with_only_type_parses() {
        let env = Envelope::parse(r#"{"type":"init"}"#).unwrap();
        assert_eq!(env.kind, "init");
        assert!(env.data.is_null());
    }

    #[test]
    fn malformed_envelope_is_validation_error() {
        assert!(matches!(
            Envelope::parse("not json"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn framed_pcm_parses_header() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&16_000u32.to_le_bytes());
        frame.extend_from_slice(&1u16.to_le_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&[9, 9, 9]);

        let (rate, channels, pcm) = parse_framed_pcm(&frame).unwrap();
        assert_eq!(rate, 16_000);
        assert_eq!(channels, 1);
        assert_eq!(pcm, &[9, 9, 9]);
    }

    #[test]
    fn short_or_zeroed_frames_rejected() {
        assert!(parse_framed_pcm(&[1, 2, 3]).is_err());
        let zeroed = [0u8; 12];
        assert!(parse_framed_pcm(&zeroed).is_err());
    }

    #[test]
    fn text_delta_carries_sequence_and_kind() {
        let json = text_delta("s1", 7, "hello");
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "response");
        assert_eq!(v["sequence"], 7);
        assert_eq!(v["data"]["type"], "text_delta");
        assert_eq!(v["data"]["content"], "hello");
    }

    #[test]
    fn audio_meta_is_flat() {
        let v: serde_json::Value =
            serde_json::from_str(&audio_meta("s1", 4, 4096)).unwrap();
        assert_eq!(v["type"], "audio_meta");
        assert_eq!(v["index"], 4);
        assert_eq!(v["size"], 4096);
        assert_eq!(v["sessionId"], "s1");
    }
}
