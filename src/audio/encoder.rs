//! Voice Encoder - Opus-Encoding für den ausgehenden Audio-Track
//!
//! Encodiert 20ms-PCM-Frames zu Opus-Paketen und schreibt sie als
//! Media-Samples auf den lokalen WebRTC-Track.

use crate::audio::capture::{AudioError, FRAME_SIZE, SAMPLE_RATE};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Obergrenze für ein encodiertes Opus-Paket
const MAX_PACKET_SIZE: usize = 1500;

/// Dauer eines Frames (960 Samples @ 48kHz)
const FRAME_DURATION: Duration = Duration::from_millis(20);

// ============================================================================
// VOICE ENCODER
// ============================================================================

/// Opus-Encoder für mono 48kHz Voice-Frames
pub struct VoiceEncoder {
    encoder: opus::Encoder,
}

impl VoiceEncoder {
    pub fn new() -> Result<Self, AudioError> {
        let encoder = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
            .map_err(|e| AudioError::Encoder(e.to_string()))?;
        Ok(Self { encoder })
    }

    /// Encodiert genau einen 20ms-Frame
    pub fn encode(&mut self, frame: &[f32]) -> Result<Vec<u8>, AudioError> {
        if frame.len() != FRAME_SIZE {
            return Err(AudioError::InvalidFrameLength(frame.len()));
        }
        self.encoder
            .encode_vec_float(frame, MAX_PACKET_SIZE)
            .map_err(|e| AudioError::Encoder(e.to_string()))
    }
}

impl std::fmt::Debug for VoiceEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceEncoder").finish()
    }
}

// ============================================================================
// TRACK FEEDER
// ============================================================================

/// Verbindet den Capture-Pfad mit dem lokalen WebRTC-Track
pub struct TrackFeeder {
    encoder: VoiceEncoder,
    track: Arc<TrackLocalStaticSample>,
}

impl TrackFeeder {
    pub fn new(track: Arc<TrackLocalStaticSample>) -> Result<Self, AudioError> {
        Ok(Self {
            encoder: VoiceEncoder::new()?,
            track,
        })
    }

    /// Encodiert einen PCM-Frame und schreibt ihn auf den Track
    pub async fn feed(&mut self, frame: &[f32]) -> Result<(), AudioError> {
        let payload = self.encoder.encode(frame)?;

        self.track
            .write_sample(&Sample {
                data: Bytes::from(payload),
                duration: FRAME_DURATION,
                ..Default::default()
            })
            .await
            .map_err(|e| AudioError::SampleWrite(e.to_string()))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_frame(freq: f32, amplitude: f32) -> Vec<f32> {
        (0..FRAME_SIZE)
            .map(|i| {
                amplitude
                    * (2.0 * std::f32::consts::PI * freq * i as f32 / SAMPLE_RATE as f32).sin()
            })
            .collect()
    }

    #[test]
    fn test_encode_produces_compact_packet() {
        let mut encoder = VoiceEncoder::new().unwrap();
        let frame = sine_frame(220.0, 0.4);

        let packet = encoder.encode(&frame).unwrap();
        assert!(!packet.is_empty());
        // Opus komprimiert deutlich unter die rohe PCM-Größe
        assert!(packet.len() < FRAME_SIZE * 4);
    }

    #[test]
    fn test_encode_rejects_wrong_frame_length() {
        let mut encoder = VoiceEncoder::new().unwrap();
        let short = vec![0.0f32; FRAME_SIZE / 2];

        assert!(matches!(
            encoder.encode(&short),
            Err(AudioError::InvalidFrameLength(_))
        ));
    }
}
