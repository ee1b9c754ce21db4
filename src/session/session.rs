//! Call Session
//!
//! Orchestriert einen kompletten Call-Lebenszyklus (join -> connected ->
//! leave): öffnet den Signaling-Transport, baut nach dem Handshake die
//! Peer Connection, verdrahtet Signaling in beide Richtungen, besitzt
//! Geräteauswahl, Mute-Zustand und Screen-Share-Status und räumt beim
//! `destroy()` deterministisch auf.

use crate::audio::{AudioHandler, TrackFeeder, FRAME_SIZE, SAMPLE_RATE};
use crate::config::CallsConfig;
use crate::peer::{PeerConnectionManager, PeerError, PeerEvent};
use crate::quality::{CallQualityMonitor, QualityEvent, StatsSource};
use crate::session::devices::{self, AudioDeviceInfo, DeviceKind};
use crate::session::ice::{IceConfigFetcher, IceError, StaticIceConfig};
use crate::session::sdp::{set_video_bandwidth, BandwidthFormat};
use crate::signaling::{
    SignalMsg, SignalingTransport, TransportConfig, TransportError, TransportEvent,
};
use crate::storage::{
    DevicePreference, PreferencesStore, StorageError, KEY_AUDIO_INPUT, KEY_AUDIO_OUTPUT,
};
use crate::vad::{VadConfig, VadEvent, VoiceActivityDetector};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::capture::AudioError;
use crate::signaling::messages::{
    ACTION_ICE, ACTION_JOIN, ACTION_LEAVE, ACTION_MUTE, ACTION_SCREEN_OFF, ACTION_SCREEN_ON,
    ACTION_SDP, ACTION_UNMUTE, ACTION_VOICE_OFF, ACTION_VOICE_ON,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Peer connection error: {0}")]
    Peer(#[from] PeerError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("ICE configuration error: {0}")]
    Ice(#[from] IceError),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Screen share already active")]
    ScreenShareActive,

    #[error("No screen share active")]
    NoScreenShare,

    #[error("Session already initialized")]
    AlreadyInitialized,

    #[error("Session destroyed")]
    Destroyed,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die von der CallSession ausgelöst werden
#[derive(Clone)]
pub enum SessionEvent {
    /// Peer Connection steht, der Call ist nutzbar
    Connect,
    /// Call beendet (regulär oder durch Fehler)
    Close,
    /// Eingehender Remote-Voice-Track
    RemoteVoiceTrack(Arc<TrackRemote>),
    /// Eingehender Remote-Screen-Track
    RemoteScreenTrack(Arc<TrackRemote>),
    /// Aktives Gerät gewechselt
    DeviceChange { kind: DeviceKind, device_id: String },
    /// Lokale Audio-Pipeline (Capture/Playback) ist initialisiert
    InitAudio,
    /// Aktuelle MOS-Schätzung
    Mos(f64),
    /// Nicht-behebbarer Fehler
    Error(String),
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Connect => write!(f, "Connect"),
            SessionEvent::Close => write!(f, "Close"),
            SessionEvent::RemoteVoiceTrack(t) => write!(f, "RemoteVoiceTrack({})", t.id()),
            SessionEvent::RemoteScreenTrack(t) => write!(f, "RemoteScreenTrack({})", t.id()),
            SessionEvent::DeviceChange { kind, device_id } => {
                write!(f, "DeviceChange({:?}, {})", kind, device_id)
            }
            SessionEvent::InitAudio => write!(f, "InitAudio"),
            SessionEvent::Mos(m) => write!(f, "Mos({})", m),
            SessionEvent::Error(e) => write!(f, "Error({})", e),
        }
    }
}

// ============================================================================
// SIGNAL PAYLOAD HELPERS
// ============================================================================

/// Payload für ausgehendes SDP-Signaling
fn sdp_payload(msg: &SignalMsg) -> Result<Value, SessionError> {
    let inner = serde_json::to_value(msg)
        .map_err(|e| SessionError::Protocol(format!("failed to encode signal: {}", e)))?;
    Ok(json!({ "data": inner }))
}

/// Payload für einen ausgehenden ICE-Candidate
fn ice_payload(candidate: &Value) -> Value {
    json!({ "data": { "type": "candidate", "candidate": candidate } })
}

/// Screen-Tracks kommen in einem eigenen Stream, dessen ID das
/// Signaling mit "screen" markiert
fn is_screen_stream(stream_id: &str) -> bool {
    stream_id.contains("screen")
}

// ============================================================================
// CALL SESSION
// ============================================================================

pub struct CallSession {
    config: CallsConfig,
    channel_id: Mutex<String>,

    store: Arc<PreferencesStore>,
    ice_fetcher: Arc<dyn IceConfigFetcher>,
    transport: Arc<SignalingTransport>,
    peer: Mutex<Option<Arc<PeerConnectionManager>>>,
    monitor: Mutex<Option<CallQualityMonitor>>,

    audio: Arc<Mutex<Option<AudioHandler>>>,
    vad: Arc<Mutex<VoiceActivityDetector>>,
    voice_track: Mutex<Option<Arc<TrackLocalStaticSample>>>,
    screen_track_id: Mutex<Option<String>>,

    /// Aktive Geräte (Laufzeit-Zustand, nie persistiert)
    active_input: Mutex<Option<String>>,
    active_output: Mutex<Option<String>>,

    muted: AtomicBool,
    initialized: AtomicBool,
    destroyed: AtomicBool,

    event_tx: broadcast::Sender<SessionEvent>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CallSession {
    pub fn new(config: CallsConfig, store: Arc<PreferencesStore>) -> Arc<Self> {
        let fetcher = Arc::new(StaticIceConfig::new(config.ice_servers.clone()));
        Self::with_ice_fetcher(config, store, fetcher)
    }

    /// Konstruktor mit eigenem ICE-Fetcher (z.B. Server-Abfrage)
    pub fn with_ice_fetcher(
        config: CallsConfig,
        store: Arc<PreferencesStore>,
        ice_fetcher: Arc<dyn IceConfigFetcher>,
    ) -> Arc<Self> {
        let transport = Arc::new(SignalingTransport::new(TransportConfig::from_calls_config(
            &config,
        )));
        let vad = VoiceActivityDetector::new(
            VadConfig::from_calls_config(&config),
            SAMPLE_RATE,
            FRAME_SIZE,
        );
        let (event_tx, _) = broadcast::channel(100);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            channel_id: Mutex::new(String::new()),
            store,
            ice_fetcher,
            transport,
            peer: Mutex::new(None),
            monitor: Mutex::new(None),
            audio: Arc::new(Mutex::new(None)),
            vad: Arc::new(Mutex::new(vad)),
            voice_track: Mutex::new(None),
            screen_track_id: Mutex::new(None),
            active_input: Mutex::new(None),
            active_output: Mutex::new(None),
            muted: AtomicBool::new(true),
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            event_tx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Aktive Geräte-IDs (input, output)
    pub fn active_devices(&self) -> (Option<String>, Option<String>) {
        (
            self.active_input.lock().clone(),
            self.active_output.lock().clone(),
        )
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Startet die Session für einen Channel.
    ///
    /// Ablauf: Geräte auflösen, Audio-Pipeline starten (gemutet), VAD an
    /// den Capture-Pfad binden, Transport öffnen; die Peer Connection
    /// entsteht erst nach dem `open` des Transports.
    pub async fn init(self: &Arc<Self>, channel_id: &str) -> Result<(), SessionError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SessionError::Destroyed);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyInitialized);
        }

        tracing::info!("Initializing call session for channel {}", channel_id);
        *self.channel_id.lock() = channel_id.to_string();

        self.setup_audio().await?;
        self.spawn_audio_pump();
        self.spawn_vad_forwarder();
        self.spawn_transport_loop(channel_id.to_string());

        self.transport.connect()?;
        Ok(())
    }

    /// Löst Geräte auf und startet Capture/Playback (gemutet)
    async fn setup_audio(self: &Arc<Self>) -> Result<(), SessionError> {
        let input_pref = self.store.preferred_device(KEY_AUDIO_INPUT)?;
        let output_pref = self.store.preferred_device(KEY_AUDIO_OUTPUT)?;

        let input_list = devices::enumerate(DeviceKind::Input)?;
        let output_list = devices::enumerate(DeviceKind::Output)?;

        let input_info = devices::resolve_preferred(&input_list, input_pref.as_ref()).cloned();
        let output_info = devices::resolve_preferred(&output_list, output_pref.as_ref()).cloned();

        let input_device = match &input_info {
            Some(info) => devices::find_device(DeviceKind::Input, &info.id)?,
            None => devices::default_device(DeviceKind::Input),
        };
        let output_device = match &output_info {
            Some(info) => devices::find_device(DeviceKind::Output, &info.id)?,
            None => devices::default_device(DeviceKind::Output),
        };

        let mut handler = AudioHandler::new(input_device, output_device);
        handler.start_capture()?;
        handler.start_playback()?;
        // Lokaler Track startet gemutet
        handler.set_muted(true);
        self.muted.store(true, Ordering::SeqCst);

        *self.active_input.lock() = handler.input_device_name();
        *self.active_output.lock() = handler.output_device_name();
        *self.audio.lock() = Some(handler);

        // Nach der Akquise einmal neu enumerieren: manche Plattformen
        // liefern erst jetzt die vollständige Liste
        if let Ok(fresh) = devices::enumerate(DeviceKind::Input) {
            let active = self.active_input.lock().clone();
            if let Some(active) = active {
                if let Some(target) =
                    devices::fallback_switch(&fresh, &active, input_pref.as_ref())
                {
                    let target = target.clone();
                    self.switch_input_device(&target).await?;
                }
            }
        }
        if let Ok(fresh) = devices::enumerate(DeviceKind::Output) {
            let active = self.active_output.lock().clone();
            if let Some(active) = active {
                if let Some(target) =
                    devices::fallback_switch(&fresh, &active, output_pref.as_ref())
                {
                    let target = target.clone();
                    self.switch_output_device(&target)?;
                }
            }
        }

        {
            let mut vad = self.vad.lock();
            vad.start();
        }

        let _ = self.event_tx.send(SessionEvent::InitAudio);
        Ok(())
    }

    /// Beendet den Call: leave senden, Peer und Transport abbauen
    pub async fn disconnect(self: &Arc<Self>) -> Result<(), SessionError> {
        tracing::info!("Disconnecting call session");

        if self.transport.is_connected() {
            let _ = self.transport.send(ACTION_LEAVE, Value::Null, false);
        }
        self.teardown().await;
        let _ = self.event_tx.send(SessionEvent::Close);
        Ok(())
    }

    /// Verwirft die Session vollständig.
    ///
    /// Bricht alle eigenen Tasks ab, schließt Peer und Transport und gibt
    /// die Audio-Geräte frei. Danach ist die Session nicht mehr nutzbar.
    pub async fn destroy(self: &Arc<Self>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Destroying call session");

        if self.transport.is_connected() {
            let _ = self.transport.send(ACTION_LEAVE, Value::Null, false);
        }
        self.teardown().await;
        let _ = self.event_tx.send(SessionEvent::Close);
    }

    async fn teardown(self: &Arc<Self>) {
        let _ = self.shutdown_tx.send(true);

        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop();
        }

        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            if let Err(e) = peer.destroy().await {
                tracing::warn!("Peer teardown failed: {}", e);
            }
        }

        self.transport.close();

        if let Some(mut audio) = self.audio.lock().take() {
            audio.stop();
        }
        self.vad.lock().destroy();
        *self.voice_track.lock() = None;
        *self.screen_track_id.lock() = None;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
    }

    // ========================================================================
    // MUTE / VOICE
    // ========================================================================

    /// Mutet das Mikrofon und meldet es dem Server
    pub fn mute(&self) -> Result<(), SessionError> {
        if let Some(audio) = self.audio.lock().as_ref() {
            audio.set_muted(true);
        }
        self.muted.store(true, Ordering::SeqCst);
        self.transport.send(ACTION_MUTE, Value::Null, false)?;
        Ok(())
    }

    /// Hebt das Mute auf und meldet es dem Server
    pub fn unmute(&self) -> Result<(), SessionError> {
        if let Some(audio) = self.audio.lock().as_ref() {
            audio.set_muted(false);
        }
        self.muted.store(false, Ordering::SeqCst);
        self.transport.send(ACTION_UNMUTE, Value::Null, false)?;
        Ok(())
    }

    // ========================================================================
    // SCREEN SHARE
    // ========================================================================

    /// Startet einen Screen-Share mit dem vom Aufrufer erfassten Track.
    ///
    /// Ein zweiter gleichzeitiger Share wird abgelehnt.
    pub async fn share_screen(
        self: &Arc<Self>,
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<(), SessionError> {
        if self.screen_track_id.lock().is_some() {
            return Err(SessionError::ScreenShareActive);
        }

        let peer = self
            .peer
            .lock()
            .clone()
            .ok_or(SessionError::Transport(TransportError::NotConnected))?;

        let track_id = track.id().to_string();
        peer.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        *self.screen_track_id.lock() = Some(track_id);
        self.transport.send(ACTION_SCREEN_ON, Value::Null, false)?;
        Ok(())
    }

    /// Beendet den aktiven Screen-Share
    pub async fn unshare_screen(self: &Arc<Self>) -> Result<(), SessionError> {
        let track_id = self
            .screen_track_id
            .lock()
            .take()
            .ok_or(SessionError::NoScreenShare)?;

        let peer = self.peer.lock().clone();
        if let Some(peer) = peer {
            if let Err(e) = peer.remove_track(&track_id).await {
                tracing::warn!("Failed to remove screen track: {}", e);
            }
        }

        self.transport.send(ACTION_SCREEN_OFF, Value::Null, false)?;
        Ok(())
    }

    /// Meldepfad für einen außerhalb der App beendeten Share (OS-seitiges
    /// Stop): signalisiert "screen off" und räumt den lokalen Zustand
    pub fn notify_screen_ended(&self) {
        if self.screen_track_id.lock().take().is_some() {
            tracing::info!("Screen share ended externally");
            let _ = self.transport.send(ACTION_SCREEN_OFF, Value::Null, false);
        }
    }

    // ========================================================================
    // DEVICE HANDLING
    // ========================================================================

    /// Setzt das bevorzugte Eingabegerät (persistiert) und wechselt darauf
    pub async fn set_audio_input_device(
        self: &Arc<Self>,
        pref: DevicePreference,
    ) -> Result<(), SessionError> {
        self.store.set_preferred_device(KEY_AUDIO_INPUT, &pref)?;

        let list = devices::enumerate(DeviceKind::Input)?;
        if let Some(info) = devices::resolve_preferred(&list, Some(&pref)) {
            let info = info.clone();
            self.switch_input_device(&info).await?;
        }
        Ok(())
    }

    /// Setzt das bevorzugte Ausgabegerät (persistiert) und wechselt darauf
    pub async fn set_audio_output_device(
        self: &Arc<Self>,
        pref: DevicePreference,
    ) -> Result<(), SessionError> {
        self.store.set_preferred_device(KEY_AUDIO_OUTPUT, &pref)?;

        let list = devices::enumerate(DeviceKind::Output)?;
        if let Some(info) = devices::resolve_preferred(&list, Some(&pref)) {
            let info = info.clone();
            self.switch_output_device(&info)?;
        }
        Ok(())
    }

    /// Reagiert auf eine Änderung der Plattform-Geräteliste.
    ///
    /// Für Input und Output unabhängig: verschwundenes aktives Gerät =>
    /// Default; neu verfügbare Präferenz => Präferenz. Die persistierte
    /// Präferenz wird nie verändert.
    pub async fn handle_device_change(self: &Arc<Self>) -> Result<(), SessionError> {
        let input_pref = self.store.preferred_device(KEY_AUDIO_INPUT)?;
        let active_input = self.active_input.lock().clone();
        if let Some(active) = active_input {
            let list = devices::enumerate(DeviceKind::Input)?;
            if let Some(target) = devices::fallback_switch(&list, &active, input_pref.as_ref()) {
                let target = target.clone();
                self.switch_input_device(&target).await?;
            }
        }

        let output_pref = self.store.preferred_device(KEY_AUDIO_OUTPUT)?;
        let active_output = self.active_output.lock().clone();
        if let Some(active) = active_output {
            let list = devices::enumerate(DeviceKind::Output)?;
            if let Some(target) = devices::fallback_switch(&list, &active, output_pref.as_ref()) {
                let target = target.clone();
                self.switch_output_device(&target)?;
            }
        }

        Ok(())
    }

    /// Wechselt das Eingabegerät: Audio-Pipeline neu bauen, Mute-Zustand
    /// erhalten, VAD auf dem neuen Capture-Pfad neu kalibrieren
    async fn switch_input_device(
        self: &Arc<Self>,
        target: &AudioDeviceInfo,
    ) -> Result<(), SessionError> {
        tracing::info!("Switching audio input to {}", target.id);

        let was_muted = self.is_muted();
        let output_id = self.active_output.lock().clone();

        let input_device = devices::find_device(DeviceKind::Input, &target.id)?
            .or_else(|| devices::default_device(DeviceKind::Input));
        let output_device = match &output_id {
            Some(id) => devices::find_device(DeviceKind::Output, id)?,
            None => devices::default_device(DeviceKind::Output),
        };

        {
            let mut slot = self.audio.lock();
            if let Some(mut old) = slot.take() {
                old.stop();
            }
            let mut handler = AudioHandler::new(input_device, output_device);
            handler.start_capture()?;
            handler.start_playback()?;
            handler.set_muted(was_muted);
            *self.active_input.lock() = handler.input_device_name();
            *slot = Some(handler);
        }

        // Neuer Track, neue Kalibrierung
        {
            let mut vad = self.vad.lock();
            vad.destroy();
            vad.start();
        }

        let _ = self.event_tx.send(SessionEvent::DeviceChange {
            kind: DeviceKind::Input,
            device_id: target.id.clone(),
        });
        Ok(())
    }

    fn switch_output_device(self: &Arc<Self>, target: &AudioDeviceInfo) -> Result<(), SessionError> {
        tracing::info!("Switching audio output to {}", target.id);

        let was_muted = self.is_muted();
        let input_id = self.active_input.lock().clone();

        let input_device = match &input_id {
            Some(id) => devices::find_device(DeviceKind::Input, id)?,
            None => devices::default_device(DeviceKind::Input),
        };
        let output_device = devices::find_device(DeviceKind::Output, &target.id)?
            .or_else(|| devices::default_device(DeviceKind::Output));

        {
            let mut slot = self.audio.lock();
            if let Some(mut old) = slot.take() {
                old.stop();
            }
            let mut handler = AudioHandler::new(input_device, output_device);
            handler.start_capture()?;
            handler.start_playback()?;
            handler.set_muted(was_muted);
            *self.active_output.lock() = handler.output_device_name();
            *slot = Some(handler);
        }

        let _ = self.event_tx.send(SessionEvent::DeviceChange {
            kind: DeviceKind::Output,
            device_id: target.id.clone(),
        });
        Ok(())
    }

    // ========================================================================
    // BACKGROUND TASKS
    // ========================================================================

    /// Pumpt Capture-Frames in VAD und Opus-Feeder
    fn spawn_audio_pump(self: &Arc<Self>) {
        let audio = Arc::clone(&self.audio);
        let vad = Arc::clone(&self.vad);
        let session = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            let mut feeder: Option<TrackFeeder> = None;
            let mut ticker = tokio::time::interval(Duration::from_millis(10));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let Some(session) = session.upgrade() else {
                    break;
                };

                // Feeder entsteht, sobald der Voice-Track existiert
                if feeder.is_none() {
                    if let Some(track) = session.voice_track.lock().clone() {
                        match TrackFeeder::new(track) {
                            Ok(f) => feeder = Some(f),
                            Err(e) => {
                                tracing::error!("Failed to create voice encoder: {}", e);
                                let _ = session
                                    .event_tx
                                    .send(SessionEvent::Error(e.to_string()));
                                break;
                            }
                        }
                    }
                }

                loop {
                    let frame = {
                        let guard = audio.lock();
                        guard.as_ref().and_then(|a| a.read_frame())
                    };
                    let Some(frame) = frame else {
                        break;
                    };

                    vad.lock().process_frame(&frame);

                    // Gemutet: VAD beobachtet weiter, nichts geht auf den Track
                    if session.is_muted() {
                        continue;
                    }
                    if let Some(feeder) = feeder.as_mut() {
                        if let Err(e) = feeder.feed(&frame).await {
                            tracing::warn!("Dropping voice frame: {}", e);
                        }
                    }
                }
            }
        });

        self.tasks.lock().push(task);
    }

    /// Übersetzt VAD-Events in voice_on/voice_off-Aktionen.
    ///
    /// Der Detektor läuft auch gemutet weiter (Kalibrierung), gemeldet wird
    /// Sprachaktivität aber nur im ungemuteten Zustand.
    fn spawn_vad_forwarder(self: &Arc<Self>) {
        let mut vad_rx = self.vad.lock().subscribe();
        let session = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = vad_rx.recv() => {
                        let Some(session) = session.upgrade() else {
                            break;
                        };
                        match event {
                            Ok(VadEvent::Start) => {
                                if !session.is_muted() {
                                    let _ = session
                                        .transport
                                        .send(ACTION_VOICE_ON, Value::Null, false);
                                }
                            }
                            Ok(VadEvent::Stop) => {
                                if !session.is_muted() {
                                    let _ = session
                                        .transport
                                        .send(ACTION_VOICE_OFF, Value::Null, false);
                                }
                            }
                            Ok(VadEvent::Ready) => {
                                tracing::debug!("Voice activity detector ready");
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        self.tasks.lock().push(task);
    }

    /// Haupt-Event-Loop über den Transport-Events
    fn spawn_transport_loop(self: &Arc<Self>, channel_id: String) {
        let mut transport_rx = self.transport.subscribe();
        let session = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = transport_rx.recv() => event,
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                let Some(session) = session.upgrade() else {
                    break;
                };

                match event {
                    Ok(TransportEvent::Open { resumed, .. }) => {
                        tracing::info!("Signaling open (resumed: {})", resumed);
                        let _ = session.transport.send(
                            ACTION_JOIN,
                            json!({ "channel_id": channel_id }),
                            false,
                        );
                        if let Err(e) = session.ensure_peer().await {
                            tracing::error!("Failed to set up peer connection: {}", e);
                            let _ = session
                                .event_tx
                                .send(SessionEvent::Error(e.to_string()));
                        }
                    }
                    Ok(TransportEvent::Joined(_)) => {
                        tracing::info!("Join acknowledged by server");
                    }
                    Ok(TransportEvent::JoinError(data)) => {
                        tracing::error!("Join rejected: {}", data);
                        let _ = session
                            .event_tx
                            .send(SessionEvent::Error(format!("join rejected: {}", data)));
                        let _ = session.disconnect().await;
                        break;
                    }
                    Ok(TransportEvent::Message(value)) => {
                        if let Err(e) = session.handle_signal(value).await {
                            tracing::error!("Signaling failure: {}", e);
                            let _ = session
                                .event_tx
                                .send(SessionEvent::Error(e.to_string()));
                            let _ = session.disconnect().await;
                            break;
                        }
                    }
                    Ok(TransportEvent::Error(TransportError::ReconnectTimeout)) => {
                        let _ = session.event_tx.send(SessionEvent::Error(
                            TransportError::ReconnectTimeout.to_string(),
                        ));
                        let _ = session.disconnect().await;
                        break;
                    }
                    Ok(TransportEvent::Error(e)) => {
                        tracing::warn!("Transport error: {}", e);
                    }
                    Ok(TransportEvent::Closed(code)) => {
                        tracing::debug!("Transport closed (code: {:?})", code);
                    }
                    Ok(TransportEvent::Event(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Transport event loop lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.tasks.lock().push(task);
    }

    /// Erstellt Peer Connection, Voice-Track und Quality-Monitor, einmalig
    async fn ensure_peer(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.peer.lock().is_some() {
            return Ok(());
        }

        let ice_servers = self.ice_fetcher.fetch_ice_servers().await?;
        let peer = PeerConnectionManager::new(ice_servers).await?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            format!("voice-{}", uuid::Uuid::new_v4()),
            "voice".to_string(),
        ));
        peer.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        *self.voice_track.lock() = Some(track);

        self.spawn_peer_loop(Arc::clone(&peer));

        let stats_source: Arc<dyn StatsSource> = Arc::clone(&peer) as Arc<dyn StatsSource>;
        let monitor = CallQualityMonitor::new(stats_source, self.config.mos_interval());
        self.spawn_mos_forwarder(&monitor);
        monitor.start();
        *self.monitor.lock() = Some(monitor);

        *self.peer.lock() = Some(peer);
        Ok(())
    }

    /// Leitet Peer-Events weiter (Signaling raus, Session-Events hoch)
    fn spawn_peer_loop(self: &Arc<Self>, peer: Arc<PeerConnectionManager>) {
        let mut peer_rx = peer.subscribe();
        let session = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = peer_rx.recv() => event,
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }
                };

                let Some(session) = session.upgrade() else {
                    break;
                };

                match event {
                    Ok(PeerEvent::Offer(sdp)) => {
                        match sdp_payload(&SignalMsg::Offer { sdp }) {
                            Ok(payload) => {
                                // SDP ist payload-schwer => binär
                                let _ = session.transport.send(ACTION_SDP, payload, true);
                            }
                            Err(e) => tracing::error!("Failed to encode offer: {}", e),
                        }
                    }
                    Ok(PeerEvent::Answer(sdp)) => {
                        match sdp_payload(&SignalMsg::Answer { sdp }) {
                            Ok(payload) => {
                                let _ = session.transport.send(ACTION_SDP, payload, true);
                            }
                            Err(e) => tracing::error!("Failed to encode answer: {}", e),
                        }
                    }
                    Ok(PeerEvent::Candidate(candidate)) => {
                        let _ = session
                            .transport
                            .send(ACTION_ICE, ice_payload(&candidate), false);
                    }
                    Ok(PeerEvent::Connect) => {
                        let _ = session.event_tx.send(SessionEvent::Connect);
                    }
                    Ok(PeerEvent::Close) => {
                        // Failed und Closed enden beide hier: Session komplett
                        // abbauen, sonst bleiben Mikrofon und Transport offen
                        let _ = session.disconnect().await;
                        break;
                    }
                    Ok(PeerEvent::Track(track)) => {
                        let event = if is_screen_stream(&track.stream_id()) {
                            SessionEvent::RemoteScreenTrack(track)
                        } else {
                            SessionEvent::RemoteVoiceTrack(track)
                        };
                        let _ = session.event_tx.send(event);
                    }
                    Ok(PeerEvent::Error(e)) => {
                        let _ = session.event_tx.send(SessionEvent::Error(e));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.tasks.lock().push(task);
    }

    /// Reicht MOS-Events des Quality-Monitors als Session-Events weiter
    fn spawn_mos_forwarder(self: &Arc<Self>, monitor: &CallQualityMonitor) {
        let mut mos_rx = monitor.subscribe();
        let event_tx = self.event_tx.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = mos_rx.recv() => {
                        match event {
                            Ok(QualityEvent::Mos(mos)) => {
                                let _ = event_tx.send(SessionEvent::Mos(mos));
                            }
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        self.tasks.lock().push(task);
    }

    // ========================================================================
    // INBOUND SIGNALING
    // ========================================================================

    /// Dekodiert einen Signal-Payload und reicht ihn an die Peer Connection.
    ///
    /// Offer/Answer laufen vorher durch das Bandbreiten-Rewriting.
    async fn handle_signal(self: &Arc<Self>, value: Value) -> Result<(), SessionError> {
        let raw = value.get("data").unwrap_or(&value);
        let msg = SignalMsg::parse(raw)
            .map_err(|e| SessionError::Protocol(format!("invalid signal payload: {}", e)))?;

        let msg = match msg {
            SignalMsg::Offer { sdp } => SignalMsg::Offer {
                sdp: set_video_bandwidth(
                    &sdp,
                    self.config.video_bandwidth_kbps,
                    BandwidthFormat::As,
                ),
            },
            SignalMsg::Answer { sdp } => SignalMsg::Answer {
                sdp: set_video_bandwidth(
                    &sdp,
                    self.config.video_bandwidth_kbps,
                    BandwidthFormat::As,
                ),
            },
            other => other,
        };

        let peer = self
            .peer
            .lock()
            .clone()
            .ok_or(SessionError::Transport(TransportError::NotConnected))?;
        peer.signal(msg).await?;
        Ok(())
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("channel_id", &*self.channel_id.lock())
            .field("muted", &self.is_muted())
            .field("initialized", &self.initialized.load(Ordering::SeqCst))
            .field("destroyed", &self.destroyed.load(Ordering::SeqCst))
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdp_payload_shape() {
        let payload = sdp_payload(&SignalMsg::Offer {
            sdp: "v=0".to_string(),
        })
        .unwrap();
        assert_eq!(payload["data"]["type"], "offer");
        assert_eq!(payload["data"]["sdp"], "v=0");
    }

    #[test]
    fn test_ice_payload_shape() {
        let candidate = json!({ "candidate": "candidate:1", "sdpMLineIndex": 0 });
        let payload = ice_payload(&candidate);
        assert_eq!(payload["data"]["type"], "candidate");
        assert_eq!(payload["data"]["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_screen_stream_classification() {
        assert!(is_screen_stream("screen-7f3a"));
        assert!(!is_screen_stream("voice"));
    }

    #[tokio::test]
    async fn test_peer_close_tears_down_session() {
        let store = Arc::new(PreferencesStore::open_in_memory().unwrap());
        let session = CallSession::new(CallsConfig::default(), store);
        let peer = PeerConnectionManager::new(Vec::new()).await.unwrap();

        let mut rx = session.subscribe();
        session.spawn_peer_loop(Arc::clone(&peer));

        // Failed/Closed auf der Peer Connection muss die Session beenden,
        // nicht nur ein Event weiterreichen
        peer.emit_event(PeerEvent::Close);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Close) => break,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel closed early: {}", e),
                }
            }
        })
        .await
        .expect("session did not tear down after peer close");

        assert!(!session.transport.is_connected());
        peer.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_vad_calibrates_while_muted() {
        let store = Arc::new(PreferencesStore::open_in_memory().unwrap());
        let session = CallSession::new(CallsConfig::default(), store);

        let handler = AudioHandler::new(None, None);
        handler.set_muted(true);
        *session.audio.lock() = Some(handler);

        let mut vad_rx = {
            let mut vad = session.vad.lock();
            vad.start();
            vad.subscribe()
        };
        session.spawn_audio_pump();

        // Gemutete Session: Frames erreichen den Detektor trotzdem,
        // die Noise-Floor-Kalibrierung läuft durch
        let frame = vec![0.01f32; FRAME_SIZE];
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let guard = session.audio.lock();
                    if let Some(audio) = guard.as_ref() {
                        audio.push_capture_samples(&frame);
                    }
                }
                tokio::select! {
                    event = vad_rx.recv() => {
                        if matches!(event, Ok(VadEvent::Ready)) {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
            }
        })
        .await
        .expect("calibration never completed while muted");

        session.destroy().await;
    }
}
