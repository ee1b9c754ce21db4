//! Voice Activity Detector
//!
//! Klassifiziert den lokalen Mikrofon-Track in sprechend/still anhand der
//! Amplitude des stimmrelevanten Frequenzbands (80-400 Hz) über kurze
//! Frames. Das erste Fenster dient ausschließlich der Kalibrierung des
//! Noise-Floors; danach verhindert eine Zähler-Hysterese, dass transienter
//! Lärm schnelles start/stop-Geflacker auslöst.

use crate::config::CallsConfig;
use tokio::sync::broadcast;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Untergrenze des ausgewerteten Frequenzbands (Hz)
const BAND_LOW_HZ: f32 = 80.0;

/// Obergrenze des ausgewerteten Frequenzbands (Hz)
const BAND_HIGH_HZ: f32 = 400.0;

/// Abstand der Goertzel-Stützstellen im Band (Hz)
const BAND_STEP_HZ: f32 = 40.0;

// ============================================================================
// EVENTS
// ============================================================================

/// Events die vom VoiceActivityDetector ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VadEvent {
    /// Kalibrierung abgeschlossen (feuert genau einmal)
    Ready,
    /// Sprachaktivität beginnt
    Start,
    /// Sprachaktivität endet
    Stop,
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Kalibrierungs-Fenster in Millisekunden
    pub calibration_ms: u64,
    /// Schwellwert = noise_floor * multiplier
    pub threshold_multiplier: f32,
    /// Zähler-Schwelle für start/stop
    pub activity_threshold: u32,
    /// Obergrenze des Zählers
    pub activity_counter_max: u32,
}

impl VadConfig {
    pub fn from_calls_config(cfg: &CallsConfig) -> Self {
        Self {
            calibration_ms: cfg.vad_calibration_ms,
            threshold_multiplier: cfg.vad_threshold_multiplier,
            activity_threshold: cfg.vad_activity_threshold,
            activity_counter_max: cfg.vad_activity_counter_max,
        }
    }
}

impl Default for VadConfig {
    fn default() -> Self {
        Self::from_calls_config(&CallsConfig::default())
    }
}

// ============================================================================
// BAND AMPLITUDE
// ============================================================================

/// Goertzel-Magnitude einer einzelnen Frequenz, normiert auf die Framelänge
fn goertzel(frame: &[f32], sample_rate: f32, freq: f32) -> f32 {
    let n = frame.len() as f32;
    let k = (0.5 + n * freq / sample_rate).floor();
    let w = 2.0 * std::f32::consts::PI * k / n;
    let coeff = 2.0 * w.cos();

    let mut s1 = 0.0f32;
    let mut s2 = 0.0f32;
    for &x in frame {
        let s0 = x + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }

    let power = s1 * s1 + s2 * s2 - coeff * s1 * s2;
    power.max(0.0).sqrt() * 2.0 / n
}

/// Mittlere Amplitude des 80-400 Hz Bands eines Frames
pub(crate) fn band_amplitude(frame: &[f32], sample_rate: u32) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }

    let mut sum = 0.0f32;
    let mut bins = 0u32;
    let mut freq = BAND_LOW_HZ;
    while freq <= BAND_HIGH_HZ {
        sum += goertzel(frame, sample_rate as f32, freq);
        bins += 1;
        freq += BAND_STEP_HZ;
    }
    sum / bins as f32
}

// ============================================================================
// VOICE ACTIVITY DETECTOR
// ============================================================================

/// Pro lokalem Audio-Track eine Instanz; beim Gerätewechsel wird sie
/// verworfen und auf dem neuen Track neu kalibriert.
pub struct VoiceActivityDetector {
    config: VadConfig,
    sample_rate: u32,
    /// Frames bis die Kalibrierung abgeschlossen ist
    calibration_frames: u32,
    seen_frames: u32,
    noise_accum: f32,
    noise_floor: Option<f32>,
    counter: u32,
    active: bool,
    running: bool,
    event_tx: broadcast::Sender<VadEvent>,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig, sample_rate: u32, frame_size: usize) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        let frame_ms = 1_000.0 * frame_size as f64 / sample_rate as f64;
        let calibration_frames = (config.calibration_ms as f64 / frame_ms).ceil() as u32;

        Self {
            config,
            sample_rate,
            calibration_frames: calibration_frames.max(1),
            seen_frames: 0,
            noise_accum: 0.0,
            noise_floor: None,
            counter: 0,
            active: false,
            running: false,
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<VadEvent> {
        self.event_tx.subscribe()
    }

    /// Ob gerade Sprachaktivität erkannt wird
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Ob die Kalibrierung abgeschlossen ist
    pub fn is_ready(&self) -> bool {
        self.noise_floor.is_some()
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Beendet die Erkennung und verwirft den gesamten Zustand.
    pub fn destroy(&mut self) {
        self.running = false;
        self.seen_frames = 0;
        self.noise_accum = 0.0;
        self.noise_floor = None;
        self.counter = 0;
        self.active = false;
    }

    /// Verarbeitet einen PCM-Frame (mono, f32).
    ///
    /// Frames im Kalibrierungs-Fenster werden nur gemittelt und lösen nie
    /// Aktivität aus.
    pub fn process_frame(&mut self, frame: &[f32]) {
        if !self.running {
            return;
        }

        let amplitude = band_amplitude(frame, self.sample_rate);

        let Some(noise_floor) = self.noise_floor else {
            self.noise_accum += amplitude;
            self.seen_frames += 1;
            if self.seen_frames >= self.calibration_frames {
                let floor = self.noise_accum / self.seen_frames as f32;
                self.noise_floor = Some(floor);
                tracing::debug!("VAD calibrated (noise floor: {:.6})", floor);
                let _ = self.event_tx.send(VadEvent::Ready);
            }
            return;
        };

        let threshold = noise_floor * self.config.threshold_multiplier;
        if amplitude > threshold {
            self.counter = (self.counter + 1).min(self.config.activity_counter_max);
        } else {
            self.counter = self.counter.saturating_sub(1);
        }

        if !self.active && self.counter >= self.config.activity_threshold {
            self.active = true;
            let _ = self.event_tx.send(VadEvent::Start);
        } else if self.active && self.counter < self.config.activity_threshold {
            self.active = false;
            let _ = self.event_tx.send(VadEvent::Stop);
        }
    }
}

impl std::fmt::Debug for VoiceActivityDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceActivityDetector")
            .field("running", &self.running)
            .field("active", &self.active)
            .field("noise_floor", &self.noise_floor)
            .field("counter", &self.counter)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{FRAME_SIZE, SAMPLE_RATE};

    fn sine_frame(freq: f32, amplitude: f32) -> Vec<f32> {
        (0..FRAME_SIZE)
            .map(|i| {
                amplitude
                    * (2.0 * std::f32::consts::PI * freq * i as f32 / SAMPLE_RATE as f32).sin()
            })
            .collect()
    }

    fn drain(rx: &mut broadcast::Receiver<VadEvent>) -> Vec<VadEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn calibrated_detector() -> (VoiceActivityDetector, broadcast::Receiver<VadEvent>) {
        let mut vad = VoiceActivityDetector::new(VadConfig::default(), SAMPLE_RATE, FRAME_SIZE);
        let mut rx = vad.subscribe();
        vad.start();

        // 500ms / 20ms-Frames => 25 Kalibrierungs-Frames
        let quiet = sine_frame(200.0, 0.01);
        for _ in 0..25 {
            vad.process_frame(&quiet);
        }
        assert_eq!(drain(&mut rx), vec![VadEvent::Ready]);
        (vad, rx)
    }

    #[test]
    fn test_band_amplitude_ignores_out_of_band_tones() {
        let in_band = band_amplitude(&sine_frame(200.0, 0.5), SAMPLE_RATE);
        let out_of_band = band_amplitude(&sine_frame(4000.0, 0.5), SAMPLE_RATE);
        assert!(in_band > out_of_band * 5.0);
    }

    #[test]
    fn test_calibration_window_never_triggers_activity() {
        let mut vad = VoiceActivityDetector::new(VadConfig::default(), SAMPLE_RATE, FRAME_SIZE);
        let mut rx = vad.subscribe();
        vad.start();

        let loud = sine_frame(200.0, 0.5);
        for _ in 0..24 {
            vad.process_frame(&loud);
        }
        assert!(drain(&mut rx).is_empty());
        assert!(!vad.is_ready());

        vad.process_frame(&loud);
        assert_eq!(drain(&mut rx), vec![VadEvent::Ready]);
    }

    #[test]
    fn test_hysteresis_start_after_threshold_frames() {
        let (mut vad, mut rx) = calibrated_detector();

        let loud = sine_frame(200.0, 0.5);
        for _ in 0..3 {
            vad.process_frame(&loud);
        }
        assert!(drain(&mut rx).is_empty());

        // Vierter lauter Frame überschreitet die Schwelle (threshold = 4)
        vad.process_frame(&loud);
        assert_eq!(drain(&mut rx), vec![VadEvent::Start]);
        assert!(vad.is_active());
    }

    #[test]
    fn test_counter_capped_at_max() {
        let (mut vad, mut rx) = calibrated_detector();

        // Viele laute Frames; Zähler bleibt bei counter_max = 10 gedeckelt
        let loud = sine_frame(200.0, 0.5);
        for _ in 0..50 {
            vad.process_frame(&loud);
        }
        assert_eq!(drain(&mut rx), vec![VadEvent::Start]);

        // Von 10 runter unter 4 braucht genau 7 leise Frames
        let quiet = sine_frame(200.0, 0.01);
        for _ in 0..6 {
            vad.process_frame(&quiet);
        }
        assert!(drain(&mut rx).is_empty());
        vad.process_frame(&quiet);
        assert_eq!(drain(&mut rx), vec![VadEvent::Stop]);
    }

    #[test]
    fn test_stopped_detector_ignores_frames() {
        let (mut vad, mut rx) = calibrated_detector();
        vad.stop();

        let loud = sine_frame(200.0, 0.5);
        for _ in 0..20 {
            vad.process_frame(&loud);
        }
        assert!(drain(&mut rx).is_empty());
        assert!(!vad.is_active());
    }
}
