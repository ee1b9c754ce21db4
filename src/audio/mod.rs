//! Audio Module - Capture, Playback und Opus-Encoding
//!
//! cpal-basiertes Audio I/O mit Ring-Buffern plus Opus-Feed für den
//! ausgehenden WebRTC-Track.

pub mod capture;
pub mod encoder;

pub use capture::{AudioError, AudioHandler, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
pub use encoder::{TrackFeeder, VoiceEncoder};
