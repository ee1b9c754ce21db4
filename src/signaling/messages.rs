//! Message Types für das Control-Plane-Protokoll
//!
//! Ausgehende Nachrichten sind `{action, seq, data}`-Envelopes, eingehende
//! `{event, seq, data}`. Aktionen des Call-Plugins tragen einen festen
//! Namespace-Präfix. Payload-schwere Nachrichten (SDP) können als kompaktes
//! Binärformat (bincode) statt JSON-Text gesendet werden.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

// ============================================================================
// ACTION / EVENT NAMES
// ============================================================================

/// Namespace-Präfix für alle Plugin-Aktionen und -Events
pub const ACTION_PREFIX: &str = "custom_chorus";

// Unpräfixte Basis-Aktionen des Control-Channels
pub const ACTION_PING: &str = "ping";
pub const ACTION_AUTH_CHALLENGE: &str = "authentication_challenge";

// Präfixte Plugin-Aktionen
pub const ACTION_JOIN: &str = "custom_chorus_join";
pub const ACTION_LEAVE: &str = "custom_chorus_leave";
pub const ACTION_SDP: &str = "custom_chorus_sdp";
pub const ACTION_ICE: &str = "custom_chorus_ice";
pub const ACTION_MUTE: &str = "custom_chorus_mute";
pub const ACTION_UNMUTE: &str = "custom_chorus_unmute";
pub const ACTION_VOICE_ON: &str = "custom_chorus_voice_on";
pub const ACTION_VOICE_OFF: &str = "custom_chorus_voice_off";
pub const ACTION_SCREEN_ON: &str = "custom_chorus_screen_on";
pub const ACTION_SCREEN_OFF: &str = "custom_chorus_screen_off";

// Server-Events
pub const EVENT_HELLO: &str = "hello";
pub const EVENT_JOIN: &str = "custom_chorus_join";
pub const EVENT_ERROR: &str = "custom_chorus_error";
pub const EVENT_SIGNAL: &str = "custom_chorus_signal";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to encode message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to encode binary message: {0}")]
    Binary(#[from] bincode::Error),
}

// ============================================================================
// OUTBOUND ENVELOPE
// ============================================================================

/// Ausgehender Envelope: `{action, seq, data}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundEnvelope {
    pub action: String,
    pub seq: i64,
    #[serde(default)]
    pub data: Value,
}

impl OutboundEnvelope {
    pub fn new(action: impl Into<String>, seq: i64, data: Value) -> Self {
        Self {
            action: action.into(),
            seq,
            data,
        }
    }

    /// Kodiert den Envelope als WebSocket-Nachricht.
    ///
    /// `binary = true` wählt die kompakte bincode-Kodierung (für SDP),
    /// sonst JSON-Text.
    pub fn encode(&self, binary: bool) -> Result<Message, CodecError> {
        if binary {
            Ok(Message::Binary(bincode::serialize(self)?))
        } else {
            Ok(Message::Text(serde_json::to_string(self)?))
        }
    }
}

// ============================================================================
// INBOUND ENVELOPE
// ============================================================================

/// Eingehender Envelope: `{event, seq, seq_reply, data}`
///
/// `seq_reply` ist nur bei direkten Antworten (Pong) gesetzt; `seq` ist die
/// fortlaufende Server-Sequenznummer, die für die Resumption gemerkt wird.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InboundEnvelope {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub seq: i64,
    #[serde(default)]
    pub seq_reply: Option<i64>,
    #[serde(default)]
    pub data: Value,
}

impl InboundEnvelope {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Liest die im Envelope eingebettete Connection-ID (falls vorhanden)
    pub fn connection_id(&self) -> Option<&str> {
        self.data.get("connection_id").and_then(Value::as_str)
    }
}

// ============================================================================
// PEER SIGNALING
// ============================================================================

/// Geschlossene Union aller Peer-Signaling-Payloads.
///
/// Jeder andere `type` ist eine Protokollverletzung und schlägt beim
/// Dekodieren fehl statt still ignoriert zu werden.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMsg {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: Value },
}

impl SignalMsg {
    pub fn parse(raw: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(raw.clone())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_envelope_json_shape() {
        let env = OutboundEnvelope::new(ACTION_JOIN, 1, json!({"channel_id": "abc"}));
        let msg = env.encode(false).unwrap();
        let Message::Text(text) = msg else {
            panic!("expected text frame");
        };
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["action"], "custom_chorus_join");
        assert_eq!(v["seq"], 1);
        assert_eq!(v["data"]["channel_id"], "abc");
    }

    #[test]
    fn test_outbound_envelope_binary_is_compact() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".repeat(20);
        let env = OutboundEnvelope::new(ACTION_SDP, 7, json!({ "data": sdp }));
        let Message::Binary(bytes) = env.encode(true).unwrap() else {
            panic!("expected binary frame");
        };
        let Message::Text(text) = env.encode(false).unwrap() else {
            panic!("expected text frame");
        };
        assert!(!bytes.is_empty());
        assert!(bytes.len() < text.len());
    }

    #[test]
    fn test_inbound_envelope_defaults() {
        let env = InboundEnvelope::parse(r#"{"event":"hello","seq":3}"#).unwrap();
        assert_eq!(env.event, EVENT_HELLO);
        assert_eq!(env.seq, 3);
        assert_eq!(env.seq_reply, None);
        assert!(env.data.is_null());
    }

    #[test]
    fn test_signal_msg_rejects_unknown_type() {
        let ok = SignalMsg::parse(&json!({"type": "offer", "sdp": "v=0"})).unwrap();
        assert_eq!(
            ok,
            SignalMsg::Offer {
                sdp: "v=0".to_string()
            }
        );

        // Unbekannter Typ ist eine Protokollverletzung
        assert!(SignalMsg::parse(&json!({"type": "renegotiate"})).is_err());
    }
}
