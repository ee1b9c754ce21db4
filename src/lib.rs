//! Chorus - Echtzeit-Call-Runtime für einen Group-Calling-Client
//!
//! Baut und hält einen Call: resumierbarer WebSocket-Control-Channel zum
//! Call-Server, WebRTC Peer Connection mit Offer/Answer/Candidate-
//! Austausch, lokale Sprachaktivitätserkennung und kontinuierliche
//! Qualitätsschätzung (MOS). UI und REST-Anbindung sind bewusst außen
//! vor; diese Crate emittiert Events und konsumiert einfache Kontrakte.

pub mod audio;
pub mod config;
pub mod peer;
pub mod quality;
pub mod session;
pub mod signaling;
pub mod storage;
pub mod vad;

pub use config::{CallsConfig, ConfigError};
pub use session::{CallSession, SessionError, SessionEvent};
pub use signaling::{SignalingTransport, TransportError, TransportEvent};
pub use storage::{DevicePreference, PreferencesStore};

/// Initialisiert das Logging für Embedder ohne eigenes Subscriber-Setup
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chorus=debug".parse().unwrap())
                .add_directive("webrtc=warn".parse().unwrap()),
        )
        .init();
}
