//! StatsCodec - Normalisierung roher Transport-/Media-Statistiken
//!
//! Die Peer-Connection liefert ihre Statistiken als W3C-förmiges
//! JSON-Objekt (Report-ID -> Report mit `type`-Feld). Dieser Codec zieht
//! daraus die für die Qualitätsbewertung relevanten, typisierten Samples:
//! das nominierte Candidate-Pair sowie per-SSRC local-inbound- und
//! remote-inbound-Audio-Reports.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

// ============================================================================
// TYPED SAMPLES
// ============================================================================

/// Das aktuell genutzte ICE-Candidate-Pair
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePairSample {
    #[serde(default)]
    pub nominated: bool,
    #[serde(default)]
    pub priority: u64,
    #[serde(default)]
    pub state: String,
    /// Aktuelle Round-Trip-Time in Sekunden
    #[serde(default)]
    pub current_round_trip_time: Option<f64>,
}

/// Per-SSRC Empfangs-Statistik (local inbound)
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalInboundSample {
    pub ssrc: u32,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub packets_received: u64,
    #[serde(default)]
    pub packets_lost: i64,
    /// Jitter in Sekunden
    #[serde(default)]
    pub jitter: f64,
}

/// Per-SSRC Sende-Statistik aus Sicht der Gegenseite (remote inbound)
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInboundSample {
    pub ssrc: u32,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub timestamp: f64,
    /// Round-Trip-Time in Sekunden
    #[serde(default)]
    pub round_trip_time: Option<f64>,
    /// Jitter in Sekunden
    #[serde(default)]
    pub jitter: f64,
    /// Verlustanteil 0..1
    #[serde(default)]
    pub fraction_lost: f64,
}

/// Ein vollständig normalisierter Stats-Schnappschuss
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSample {
    pub candidate_pair: Option<CandidatePairSample>,
    pub local_inbound: HashMap<u32, LocalInboundSample>,
    pub remote_inbound: HashMap<u32, RemoteInboundSample>,
}

// ============================================================================
// DECODING
// ============================================================================

fn is_audio(kind: &Option<String>) -> bool {
    match kind {
        Some(k) => k == "audio",
        // Reports ohne kind-Feld werden nicht verworfen
        None => true,
    }
}

/// Dekodiert einen rohen Stats-Dump in typisierte Samples.
///
/// Unbekannte Report-Typen und nicht dekodierbare Reports werden
/// übersprungen; bei mehreren nominierten Candidate-Pairs gewinnt das mit
/// der höchsten Priorität.
pub fn decode(raw: &Value) -> StatsSample {
    let mut sample = StatsSample::default();

    let Some(reports) = raw.as_object() else {
        return sample;
    };

    for report in reports.values() {
        let Some(kind) = report.get("type").and_then(Value::as_str) else {
            continue;
        };

        match kind {
            "candidate-pair" => {
                let Ok(pair) = serde_json::from_value::<CandidatePairSample>(report.clone())
                else {
                    continue;
                };
                if !pair.nominated {
                    continue;
                }
                let better = match &sample.candidate_pair {
                    Some(current) => pair.priority > current.priority,
                    None => true,
                };
                if better {
                    sample.candidate_pair = Some(pair);
                }
            }

            "inbound-rtp" => {
                if let Ok(inbound) = serde_json::from_value::<LocalInboundSample>(report.clone())
                {
                    if is_audio(&inbound.kind) {
                        sample.local_inbound.insert(inbound.ssrc, inbound);
                    }
                }
            }

            "remote-inbound-rtp" => {
                if let Ok(remote) =
                    serde_json::from_value::<RemoteInboundSample>(report.clone())
                {
                    if is_audio(&remote.kind) {
                        sample.remote_inbound.insert(remote.ssrc, remote);
                    }
                }
            }

            _ => {}
        }
    }

    sample
}

// ============================================================================
// TESTS
// ============================================================================
