//! Peer Connection Manager
//!
//! Wrapped die WebRTC Peer Connection einer Call-Session: Offer/Answer,
//! Candidate-Austausch, Track-Lifecycle und Stats-Abfrage. Ein Data
//! Channel wird direkt beim Aufbau erstellt, damit die Negotiation ohne
//! Media-Track anläuft und die Verbindung schon vor dem ersten Unmute
//! steht.

use crate::quality::{QualityError, StatsSource};
use crate::signaling::SignalMsg;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Unknown track: {0}")]
    UnknownTrack(String),

    #[error("Peer connection already destroyed")]
    Destroyed,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die vom PeerConnectionManager ausgelöst werden
#[derive(Clone)]
pub enum PeerEvent {
    /// Lokales Offer, muss über das Signaling zum Server
    Offer(String),
    /// Lokales Answer auf ein empfangenes Offer
    Answer(String),
    /// Lokaler ICE-Candidate
    Candidate(Value),
    /// Peer Connection ist verbunden
    Connect,
    /// Peer Connection geschlossen
    Close,
    /// Eingehender Remote-Track
    Track(Arc<TrackRemote>),
    /// Verbindungsfehler (z.B. failed-State)
    Error(String),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::Offer(_) => write!(f, "Offer"),
            PeerEvent::Answer(_) => write!(f, "Answer"),
            PeerEvent::Candidate(_) => write!(f, "Candidate"),
            PeerEvent::Connect => write!(f, "Connect"),
            PeerEvent::Close => write!(f, "Close"),
            PeerEvent::Track(t) => write!(f, "Track({})", t.id()),
            PeerEvent::Error(e) => write!(f, "Error({})", e),
        }
    }
}

// ============================================================================
// SENDER MAP
// ============================================================================

/// Schlüsselt einen Map-Eintrag atomar um (alter Key raus, neuer rein).
///
/// Ohne dieses Umschlüsseln würde nach einem Track-Replace der Sender
/// unter der alten Track-ID hängen bleiben und der nächste Mute-Toggle
/// ins Leere greifen.
fn rekey_entry<V>(map: &mut HashMap<String, V>, old_key: &str, new_key: &str) -> bool {
    if old_key == new_key {
        return map.contains_key(old_key);
    }
    match map.remove(old_key) {
        Some(value) => {
            map.insert(new_key.to_string(), value);
            true
        }
        None => false,
    }
}

// ============================================================================
// PEER CONNECTION MANAGER
// ============================================================================

pub struct PeerConnectionManager {
    pc: Arc<RTCPeerConnection>,
    event_tx: broadcast::Sender<PeerEvent>,

    /// Track-ID -> RTP-Sender des aktuell gesendeten Tracks
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,

    /// FIFO-Queue für Candidates die vor der Remote Description ankamen
    pending_candidates: Mutex<Vec<Value>>,
    remote_description_set: AtomicBool,

    making_offer: Arc<AtomicBool>,
    destroyed: AtomicBool,

    /// Hält den Negotiation-Kickstart-Channel am Leben
    _control_channel: Arc<RTCDataChannel>,
}

impl PeerConnectionManager {
    /// Baut die Peer Connection samt Handlern und Control-Data-Channel
    pub async fn new(ice_servers: Vec<RTCIceServer>) -> Result<Arc<Self>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PeerError::WebRTC(e.to_string()))?,
        );

        // Data Channel erzwingt den Negotiation-Start ohne Media-Track
        let control_channel = pc
            .create_data_channel("control", None)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        let (event_tx, _) = broadcast::channel(100);
        let making_offer = Arc::new(AtomicBool::new(false));

        let manager = Arc::new(Self {
            pc: Arc::clone(&pc),
            event_tx,
            senders: Mutex::new(HashMap::new()),
            pending_candidates: Mutex::new(Vec::new()),
            remote_description_set: AtomicBool::new(false),
            making_offer: Arc::clone(&making_offer),
            destroyed: AtomicBool::new(false),
            _control_channel: control_channel,
        });

        manager.setup_handlers();
        Ok(manager)
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.event_tx.subscribe()
    }

    /// Registriert die Peer-Connection-Handler
    fn setup_handlers(self: &Arc<Self>) {
        // Negotiation Needed: Offer erstellen und emittieren
        let weak = Arc::downgrade(self);
        self.pc.on_negotiation_needed(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                if manager.making_offer.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = manager.make_offer().await {
                    tracing::warn!("Failed to create offer: {}", e);
                    let _ = manager.event_tx.send(PeerEvent::Error(e.to_string()));
                }
                manager.making_offer.store(false, Ordering::SeqCst);
            })
        }));

        // Connection State
        let event_tx = self.event_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);
                match s {
                    RTCPeerConnectionState::Connected => {
                        let _ = event_tx.send(PeerEvent::Connect);
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = event_tx.send(PeerEvent::Error(
                            "peer connection entered failed state".to_string(),
                        ));
                        let _ = event_tx.send(PeerEvent::Close);
                    }
                    RTCPeerConnectionState::Closed => {
                        let _ = event_tx.send(PeerEvent::Close);
                    }
                    _ => {}
                }
                Box::pin(async {})
            }));

        // Lokale ICE Candidates
        let event_tx = self.event_tx.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                if let Ok(init) = c.to_json() {
                    if let Ok(value) = serde_json::to_value(&init) {
                        let _ = event_tx.send(PeerEvent::Candidate(value));
                    }
                }
            }
            Box::pin(async {})
        }));

        // Remote Tracks
        let event_tx = self.event_tx.clone();
        self.pc.on_track(Box::new(move |track, _, _| {
            tracing::info!(
                "Remote track: id={} stream={} kind={}",
                track.id(),
                track.stream_id(),
                track.kind()
            );
            let _ = event_tx.send(PeerEvent::Track(track));
            Box::pin(async {})
        }));
    }

    async fn make_offer(&self) -> Result<(), PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        let _ = self.event_tx.send(PeerEvent::Offer(offer.sdp));
        Ok(())
    }

    /// Verarbeitet eine eingehende Signaling-Nachricht
    pub async fn signal(&self, msg: SignalMsg) -> Result<(), PeerError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(PeerError::Destroyed);
        }

        match msg {
            SignalMsg::Candidate { candidate } => {
                if self.remote_description_set.load(Ordering::SeqCst) {
                    self.apply_candidate(candidate).await?;
                } else {
                    tracing::debug!("Buffering early ICE candidate");
                    self.pending_candidates.lock().push(candidate);
                }
            }
            SignalMsg::Offer { sdp } => {
                let offer = RTCSessionDescription::offer(sdp)
                    .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
                self.pc
                    .set_remote_description(offer)
                    .await
                    .map_err(|e| PeerError::WebRTC(e.to_string()))?;
                self.remote_description_set.store(true, Ordering::SeqCst);
                self.flush_candidates().await?;

                let answer = self
                    .pc
                    .create_answer(None)
                    .await
                    .map_err(|e| PeerError::WebRTC(e.to_string()))?;
                self.pc
                    .set_local_description(answer.clone())
                    .await
                    .map_err(|e| PeerError::WebRTC(e.to_string()))?;

                let _ = self.event_tx.send(PeerEvent::Answer(answer.sdp));
            }
            SignalMsg::Answer { sdp } => {
                let answer = RTCSessionDescription::answer(sdp)
                    .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
                self.pc
                    .set_remote_description(answer)
                    .await
                    .map_err(|e| PeerError::WebRTC(e.to_string()))?;
                self.remote_description_set.store(true, Ordering::SeqCst);
                self.flush_candidates().await?;
            }
        }
        Ok(())
    }

    async fn apply_candidate(&self, candidate: Value) -> Result<(), PeerError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)
            .map_err(|e| PeerError::InvalidCandidate(e.to_string()))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))
    }

    /// Wendet gepufferte Candidates in Ankunftsreihenfolge genau einmal an
    async fn flush_candidates(&self) -> Result<(), PeerError> {
        let queued: Vec<Value> = std::mem::take(&mut *self.pending_candidates.lock());
        if !queued.is_empty() {
            tracing::debug!("Flushing {} buffered ICE candidate(s)", queued.len());
        }
        for candidate in queued {
            self.apply_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Fügt einen lokalen Track hinzu und merkt sich den Sender
    pub async fn add_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), PeerError> {
        let track_id = track.id().to_string();
        let sender = self
            .pc
            .add_track(track)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        self.senders.lock().insert(track_id, sender);
        Ok(())
    }

    /// Tauscht den gesendeten Track aus, ohne neu zu verhandeln.
    ///
    /// Der Sender wird über die *alte* Track-ID aufgelöst und danach unter
    /// der neuen ID geführt.
    pub async fn replace_track(
        &self,
        old_track_id: &str,
        new_track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<(), PeerError> {
        let sender = self
            .senders
            .lock()
            .get(old_track_id)
            .cloned()
            .ok_or_else(|| PeerError::UnknownTrack(old_track_id.to_string()))?;

        let new_id = new_track.id().to_string();
        sender
            .replace_track(Some(new_track))
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))?;

        rekey_entry(&mut self.senders.lock(), old_track_id, &new_id);
        Ok(())
    }

    /// Entfernt einen gesendeten Track
    pub async fn remove_track(&self, track_id: &str) -> Result<(), PeerError> {
        let sender = self
            .senders
            .lock()
            .remove(track_id)
            .ok_or_else(|| PeerError::UnknownTrack(track_id.to_string()))?;

        self.pc
            .remove_track(&sender)
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))
    }

    /// Ob ein Sender unter dieser Track-ID geführt wird
    pub fn has_sender(&self, track_id: &str) -> bool {
        self.senders.lock().contains_key(track_id)
    }

    /// Rohe Statistiken der Peer Connection als JSON
    pub async fn get_stats(&self) -> Result<Value, PeerError> {
        let report = self.pc.get_stats().await;
        serde_json::to_value(&report.reports).map_err(|e| PeerError::WebRTC(e.to_string()))
    }

    /// Schließt die Peer Connection und verwirft allen Zustand
    pub async fn destroy(&self) -> Result<(), PeerError> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.senders.lock().clear();
        self.pending_candidates.lock().clear();

        self.pc
            .close()
            .await
            .map_err(|e| PeerError::WebRTC(e.to_string()))
    }

    #[cfg(test)]
    fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn emit_event(&self, event: PeerEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[async_trait]
impl StatsSource for PeerConnectionManager {
    async fn poll_stats(&self) -> Result<Value, QualityError> {
        self.get_stats()
            .await
            .map_err(|e| QualityError::StatsUnavailable(e.to_string()))
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("senders", &self.senders.lock().len())
            .field(
                "pending_candidates",
                &self.pending_candidates.lock().len(),
            )
            .field(
                "remote_description_set",
                &self.remote_description_set.load(Ordering::SeqCst),
            )
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_rekey_entry_moves_value_to_new_key() {
        let mut map = HashMap::new();
        map.insert("old".to_string(), 7u32);

        assert!(rekey_entry(&mut map, "old", "new"));
        assert!(!map.contains_key("old"));
        assert_eq!(map.get("new"), Some(&7));
    }

    #[test]
    fn test_rekey_entry_missing_old_key() {
        let mut map: HashMap<String, u32> = HashMap::new();
        assert!(!rekey_entry(&mut map, "old", "new"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_rekey_entry_same_key_is_noop() {
        let mut map = HashMap::new();
        map.insert("id".to_string(), 1u32);
        assert!(rekey_entry(&mut map, "id", "id"));
        assert_eq!(map.get("id"), Some(&1));
    }

    /// Baut ein Offer über eine zweite, rohe Peer Connection
    async fn make_remote_offer() -> String {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media_engine).build();
        let pc = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        pc.create_data_channel("control", None).await.unwrap();

        let offer = pc.create_offer(None).await.unwrap();
        pc.set_local_description(offer.clone()).await.unwrap();
        offer.sdp
    }

    fn host_candidate() -> Value {
        json!({
            "candidate": "candidate:1 1 UDP 2122252543 127.0.0.1 34567 typ host",
            "sdpMLineIndex": 0,
            "sdpMid": "0"
        })
    }

    #[tokio::test]
    async fn test_candidates_buffer_until_remote_description() {
        let manager = PeerConnectionManager::new(Vec::new()).await.unwrap();

        manager
            .signal(SignalMsg::Candidate {
                candidate: host_candidate(),
            })
            .await
            .unwrap();
        manager
            .signal(SignalMsg::Candidate {
                candidate: host_candidate(),
            })
            .await
            .unwrap();
        assert_eq!(manager.pending_candidate_count(), 2);

        let mut rx = manager.subscribe();
        let offer = make_remote_offer().await;
        manager.signal(SignalMsg::Offer { sdp: offer }).await.unwrap();

        // Queue ist nach der Remote Description geleert
        assert_eq!(manager.pending_candidate_count(), 0);

        // Auf das Offer folgt ein Answer-Event
        let event = timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await.unwrap() {
                    PeerEvent::Answer(sdp) => break sdp,
                    _ => continue,
                }
            }
        })
        .await
        .expect("no answer emitted");
        assert!(event.contains("v=0"));

        manager.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_sdp_is_rejected() {
        let manager = PeerConnectionManager::new(Vec::new()).await.unwrap();

        let result = manager
            .signal(SignalMsg::Offer {
                sdp: "not an sdp".to_string(),
            })
            .await;
        assert!(matches!(result, Err(PeerError::InvalidSdp(_))));

        manager.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_signal_after_destroy_fails() {
        let manager = PeerConnectionManager::new(Vec::new()).await.unwrap();
        manager.destroy().await.unwrap();

        let result = manager
            .signal(SignalMsg::Candidate {
                candidate: host_candidate(),
            })
            .await;
        assert!(matches!(result, Err(PeerError::Destroyed)));
    }

    #[tokio::test]
    async fn test_replace_track_unknown_id() {
        use webrtc::api::media_engine::MIME_TYPE_OPUS;
        use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
        use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

        let manager = PeerConnectionManager::new(Vec::new()).await.unwrap();
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 1,
                ..Default::default()
            },
            "mic".to_string(),
            "voice".to_string(),
        ));

        let result = manager.replace_track("missing", track).await;
        assert!(matches!(result, Err(PeerError::UnknownTrack(_))));

        manager.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_sender_map_rekeyed_after_replace() {
        use webrtc::api::media_engine::MIME_TYPE_OPUS;
        use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
        use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

        fn opus_track(id: &str) -> Arc<TrackLocalStaticSample> {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: 48000,
                    channels: 1,
                    ..Default::default()
                },
                id.to_string(),
                "voice".to_string(),
            ))
        }

        let manager = PeerConnectionManager::new(Vec::new()).await.unwrap();
        manager.add_track(opus_track("mic-a")).await.unwrap();
        assert!(manager.has_sender("mic-a"));

        manager
            .replace_track("mic-a", opus_track("mic-b"))
            .await
            .unwrap();

        // Nach dem Replace löst nur noch die neue ID den Sender auf
        assert!(!manager.has_sender("mic-a"));
        assert!(manager.has_sender("mic-b"));

        manager.destroy().await.unwrap();
    }
}
