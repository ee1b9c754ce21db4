//! Laufzeit-Konfiguration
//!
//! Bündelt alle Protokoll-Konstanten (Keepalive, Reconnect-Backoff,
//! Qualitäts-Sampling, VAD-Parameter) an einer Stelle. Kann optional
//! aus einer TOML-Datei geladen werden.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

// ============================================================================
// ICE SERVER
// ============================================================================

/// STUN/TURN Server-Beschreibung, wie sie die ICE-Konfigurationsabfrage
/// liefert (oder die lokale Konfiguration als Fallback).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl From<IceServerConfig> for RTCIceServer {
    fn from(cfg: IceServerConfig) -> Self {
        RTCIceServer {
            urls: cfg.urls,
            username: cfg.username,
            credential: cfg.credential,
            ..Default::default()
        }
    }
}

/// Standard STUN-Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        username: String::new(),
        credential: String::new(),
    }]
}

// ============================================================================
// CALLS CONFIG
// ============================================================================

/// Konfiguration der gesamten Call-Runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallsConfig {
    /// Basis-URL des Signaling-Servers (ws:// oder wss://)
    pub server_url: String,

    /// Optionales Auth-Token, wird direkt nach dem Socket-Open als
    /// `authentication_challenge` gesendet
    pub auth_token: Option<String>,

    /// Fallback-ICE-Server falls keine Abfrage konfiguriert ist
    pub ice_servers: Vec<IceServerConfig>,

    /// Keepalive-Intervall für Ping/Pong (Millisekunden)
    pub ping_interval_ms: u64,

    /// Reconnect-Backoff: Startwert (Millisekunden)
    pub reconnect_floor_ms: u64,

    /// Reconnect-Backoff: Inkrement pro fehlgeschlagenem Versuch
    pub reconnect_increment_ms: u64,

    /// Harte Obergrenze der Outage-Dauer, danach ReconnectTimeout
    pub reconnect_ceiling_ms: u64,

    /// Sampling-Intervall des Quality-Monitors (Millisekunden)
    pub mos_interval_ms: u64,

    /// Kalibrierungs-Fenster des VAD (Millisekunden)
    pub vad_calibration_ms: u64,

    /// Schwellwert-Multiplikator über dem Noise-Floor
    pub vad_threshold_multiplier: f32,

    /// Hysterese: Zähler-Schwelle für start/stop
    pub vad_activity_threshold: u32,

    /// Hysterese: Obergrenze des Zählers
    pub vad_activity_counter_max: u32,

    /// Video-Bandbreiten-Deckel für SDP-Rewriting (kbps)
    pub video_bandwidth_kbps: u32,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            server_url: "wss://localhost:8045".to_string(),
            auth_token: None,
            ice_servers: default_ice_servers(),
            ping_interval_ms: 5_000,
            reconnect_floor_ms: 1_000,
            reconnect_increment_ms: 500,
            reconnect_ceiling_ms: 30_000,
            mos_interval_ms: 4_000,
            vad_calibration_ms: 500,
            vad_threshold_multiplier: 2.0,
            vad_activity_threshold: 4,
            vad_activity_counter_max: 10,
            video_bandwidth_kbps: 1_000,
        }
    }
}

impl CallsConfig {
    /// Lädt die Konfiguration aus einer TOML-Datei
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn mos_interval(&self) -> Duration {
        Duration::from_millis(self.mos_interval_ms)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_constants() {
        let cfg = CallsConfig::default();
        assert_eq!(cfg.ping_interval_ms, 5_000);
        assert_eq!(cfg.reconnect_floor_ms, 1_000);
        assert_eq!(cfg.reconnect_increment_ms, 500);
        assert_eq!(cfg.reconnect_ceiling_ms, 30_000);
        assert_eq!(cfg.vad_activity_threshold, 4);
        assert_eq!(cfg.vad_activity_counter_max, 10);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let cfg: CallsConfig = toml::from_str(
            r#"
            server_url = "wss://calls.example.com"
            ping_interval_ms = 2500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server_url, "wss://calls.example.com");
        assert_eq!(cfg.ping_interval_ms, 2_500);
        // Rest bleibt Default
        assert_eq!(cfg.reconnect_ceiling_ms, 30_000);
    }
}
