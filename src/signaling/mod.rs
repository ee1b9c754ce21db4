//! Signaling Module - Control-Channel zum Call-Server
//!
//! Dieses Modul verwaltet den resumierbaren WebSocket-Control-Channel:
//! - Envelope-Framing (JSON oder kompaktes Binärformat)
//! - Keepalive und Sequenznummern
//! - Reconnection mit Backoff

pub mod messages;
pub mod transport;

pub use messages::{InboundEnvelope, OutboundEnvelope, SignalMsg};
pub use transport::{SignalingTransport, TransportConfig, TransportError, TransportEvent};
