//! Call Quality Monitor - periodisches Stats-Sampling und MOS-Schätzung
//!
//! Zieht in festem Intervall rohe Statistiken von der Peer-Connection,
//! bildet per-SSRC Deltas gegen den vorherigen Schnappschuss und leitet
//! daraus eine Mean-Opinion-Score-Schätzung (1..4.5) ab.

use super::codec::{self, LocalInboundSample, RemoteInboundSample, StatsSample};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum QualityError {
    #[error("Failed to retrieve stats: {0}")]
    StatsUnavailable(String),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die vom CallQualityMonitor ausgelöst werden
#[derive(Debug, Clone)]
pub enum QualityEvent {
    /// Aktuelle MOS-Schätzung (1.0 .. 4.5)
    Mos(f64),
}

// ============================================================================
// STATS SOURCE
// ============================================================================

/// Lieferant roher Statistiken (implementiert von der Peer-Connection)
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn poll_stats(&self) -> Result<Value, QualityError>;
}

// ============================================================================
// MOS
// ============================================================================

/// Schätzt den Mean Opinion Score aus Latenz (ms), Jitter (ms) und
/// Verlustrate (0..1) über das R-Faktor-Modell.
pub fn calculate_mos(latency_ms: f64, jitter_ms: f64, loss_rate: f64) -> f64 {
    let effective_latency = latency_ms + 2.0 * jitter_ms + 10.0;

    let mut r = if effective_latency < 160.0 {
        93.2 - effective_latency / 40.0
    } else {
        93.2 - (effective_latency - 120.0) / 10.0
    };
    r -= 2.5 * (loss_rate * 100.0);

    if r > 100.0 {
        4.5
    } else if r < 0.0 {
        1.0
    } else {
        1.0 + 0.035 * r + 0.000007 * r * (r - 60.0) * (100.0 - r)
    }
}

// ============================================================================
// QUALITY TRACKER
// ============================================================================

/// Laufender Mittelwert
#[derive(Debug, Default, Clone)]
struct RunningAvg {
    sum: f64,
    count: u64,
}

impl RunningAvg {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn get(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Hält zwei Generationen von Samples (previous, current) und die laufenden
/// Mittelwerte beider Richtungen.
#[derive(Debug, Default)]
pub(crate) struct QualityTracker {
    prev_local: HashMap<u32, LocalInboundSample>,
    prev_remote: HashMap<u32, RemoteInboundSample>,
    recv_jitter: RunningAvg,
    recv_loss: RunningAvg,
    send_jitter: RunningAvg,
    send_loss: RunningAvg,
    send_latency: RunningAvg,
}

impl QualityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verarbeitet einen Schnappschuss und liefert die MOS-Schätzung.
    ///
    /// Ein Delta wird nur gebildet wenn der neue Timestamp strikt neuer ist
    /// und die Paketzähler vorangekommen sind (Schutz gegen doppelte oder
    /// eingefrorene Reports). Liefert `None` wenn der Zyklus keinerlei
    /// verwertbare Daten beigetragen hat.
    pub fn ingest(&mut self, sample: StatsSample) -> Option<f64> {
        let mut usable = false;

        for (ssrc, cur) in &sample.local_inbound {
            if let Some(prev) = self.prev_local.get(ssrc) {
                let advanced = cur.timestamp > prev.timestamp
                    && cur.packets_received > prev.packets_received;
                if advanced {
                    let received = cur.packets_received - prev.packets_received;
                    let lost = (cur.packets_lost - prev.packets_lost).max(0) as u64;
                    self.recv_loss
                        .push(lost as f64 / (received + lost) as f64);
                    self.recv_jitter.push(cur.jitter * 1000.0);
                    usable = true;
                }
            }
        }

        for (ssrc, cur) in &sample.remote_inbound {
            let fresh = match self.prev_remote.get(ssrc) {
                Some(prev) => cur.timestamp > prev.timestamp,
                None => true,
            };
            if fresh {
                self.send_jitter.push(cur.jitter * 1000.0);
                self.send_loss.push(cur.fraction_lost);
                if let Some(rtt) = cur.round_trip_time {
                    self.send_latency.push(rtt * 1000.0);
                }
                usable = true;
            }
        }

        // Transport-Latenz: bevorzugt die aktuelle RTT des nominierten Pairs
        let pair_latency = sample
            .candidate_pair
            .as_ref()
            .and_then(|p| p.current_round_trip_time)
            .map(|rtt| rtt * 1000.0);
        if pair_latency.is_some() {
            usable = true;
        }

        self.prev_local = sample.local_inbound;
        self.prev_remote = sample.remote_inbound;

        if !usable {
            return None;
        }

        let latency = pair_latency.or_else(|| self.send_latency.get());
        let jitter = match (self.recv_jitter.get(), self.send_jitter.get()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let loss = match (self.recv_loss.get(), self.send_loss.get()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        // Ohne jegliche Latenz-, Jitter- oder Verlustdaten keine Schätzung
        if latency.is_none() && jitter.is_none() && loss.is_none() {
            return None;
        }

        Some(calculate_mos(
            latency.unwrap_or(0.0),
            jitter.unwrap_or(0.0),
            loss.unwrap_or(0.0),
        ))
    }
}

// ============================================================================
// CALL QUALITY MONITOR
// ============================================================================

/// Periodischer Sampler über einer [`StatsSource`]
pub struct CallQualityMonitor {
    source: Arc<dyn StatsSource>,
    interval: Duration,
    event_tx: broadcast::Sender<QualityEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CallQualityMonitor {
    pub fn new(source: Arc<dyn StatsSource>, interval: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        Self {
            source,
            interval,
            event_tx,
            task: Mutex::new(None),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<QualityEvent> {
        self.event_tx.subscribe()
    }

    /// Startet das periodische Sampling
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let source = Arc::clone(&self.source);
        let event_tx = self.event_tx.clone();
        let interval = self.interval;

        *task = Some(tokio::spawn(async move {
            let mut tracker = QualityTracker::new();
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;

            loop {
                timer.tick().await;

                let raw = match source.poll_stats().await {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::debug!("Stats poll failed: {}", e);
                        continue;
                    }
                };

                if let Some(mos) = tracker.ingest(codec::decode(&raw)) {
                    tracing::debug!("MOS estimate: {:.2}", mos);
                    let _ = event_tx.send(QualityEvent::Mos(mos));
                }
            }
        }));
    }

    /// Stoppt das Sampling
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for CallQualityMonitor {
    fn drop(&mut self) {
        self.stop();
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
    fn test_mos_baseline() {
        // latency=0, jitter=0, loss=0 => effectiveLatency=10, R ~ 92.95
        let mos = calculate_mos(0.0, 0.0, 0.0);
        assert!((mos - 4.41).abs() < 0.01, "mos = {mos}");
    }

    #[test]
    fn test_mos_clamps() {
        // Negative Latenz treibt R über 100 => Deckel bei 4.5
        assert_eq!(calculate_mos(-500.0, 0.0, 0.0), 4.5);
        // Totalverlust drückt R unter 0 => Boden bei 1.0
        assert_eq!(calculate_mos(0.0, 0.0, 1.0), 1.0);
    }

    #[test]
    fn test_mos_degrades_with_latency() {
        let good = calculate_mos(20.0, 2.0, 0.0);
        let bad = calculate_mos(400.0, 2.0, 0.0);
        assert!(good > bad);
    }

    fn local(ssrc: u32, ts: f64, received: u64, lost: i64) -> serde_json::Value {
        json!({
            "type": "inbound-rtp",
            "ssrc": ssrc,
            "kind": "audio",
            "timestamp": ts,
            "packetsReceived": received,
            "packetsLost": lost,
            "jitter": 0.005
        })
    }

    #[test]
    fn test_tracker_requires_advancing_counters() {
        let mut tracker = QualityTracker::new();

        // Erster Schnappschuss: keine Vorgänger-Generation, kein Score
        let first = codec::decode(&json!({ "a": local(1, 1000.0, 100, 0) }));
        assert_eq!(tracker.ingest(first), None);

        // Identischer Timestamp => Duplikat, kein Score
        let dup = codec::decode(&json!({ "a": local(1, 1000.0, 100, 0) }));
        assert_eq!(tracker.ingest(dup), None);

        // Neuer Timestamp, aber eingefrorene Zähler => kein Score
        let frozen = codec::decode(&json!({ "a": local(1, 2000.0, 100, 0) }));
        assert_eq!(tracker.ingest(frozen), None);

        // Echtes Delta => Score
        let fresh = codec::decode(&json!({ "a": local(1, 3000.0, 200, 5) }));
        let mos = tracker.ingest(fresh).expect("expected a score");
        assert!(mos > 1.0 && mos <= 4.5);
    }

    #[test]
    fn test_tracker_prefers_candidate_pair_latency() {
        let mut tracker = QualityTracker::new();

        let raw = json!({
            "pair": {
                "type": "candidate-pair",
                "nominated": true,
                "priority": 1u64,
                "state": "succeeded",
                "currentRoundTripTime": 0.4
            },
            "rin": {
                "type": "remote-inbound-rtp",
                "ssrc": 9u32,
                "kind": "audio",
                "timestamp": 1000.0,
                "roundTripTime": 0.01,
                "jitter": 0.0,
                "fractionLost": 0.0
            }
        });
        let with_pair = tracker.ingest(codec::decode(&raw)).unwrap();

        // 400ms Pair-RTT muss deutlich schlechter bewerten als 10ms
        let reference = calculate_mos(10.0, 0.0, 0.0);
        assert!(with_pair < reference);
    }

    #[tokio::test]
    async fn test_monitor_emits_mos_events() {
        struct FakeSource {
            calls: Mutex<u64>,
        }

        #[async_trait]
        impl StatsSource for FakeSource {
            async fn poll_stats(&self) -> Result<Value, QualityError> {
                let mut calls = self.calls.lock();
                *calls += 1;
                let n = *calls;
                Ok(json!({
                    "a": {
                        "type": "inbound-rtp",
                        "ssrc": 1u32,
                        "kind": "audio",
                        "timestamp": 1000.0 * n as f64,
                        "packetsReceived": 100u64 * n,
                        "packetsLost": 0i64,
                        "jitter": 0.002
                    }
                }))
            }
        }

        let monitor = CallQualityMonitor::new(
            Arc::new(FakeSource {
                calls: Mutex::new(0),
            }),
            Duration::from_millis(10),
        );
        let mut rx = monitor.subscribe();
        monitor.start();

        let ev = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for mos")
            .expect("channel closed");
        let QualityEvent::Mos(mos) = ev;
        assert!(mos > 1.0 && mos <= 4.5);

        monitor.stop();
    }
}
