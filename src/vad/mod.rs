//! VAD Module - Sprachaktivitätserkennung
//!
//! Band-limitierte Amplitudenanalyse mit Noise-Floor-Kalibrierung und
//! Zähler-Hysterese.

pub mod detector;

pub use detector::{VadConfig, VadEvent, VoiceActivityDetector};
