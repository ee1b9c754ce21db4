//! WebSocket Transport zum Call-Server
//!
//! Verwaltet den resumierbaren Control-Channel:
//! - Verbindungs-URL trägt immer `connection_id` und `sequence_number`,
//!   damit der Server verpasste Nachrichten nachliefern kann
//! - Keepalive Ping/Pong mit hartem Timeout
//! - Automatische Reconnection mit linearem Backoff und Obergrenze

use super::messages::*;
use crate::config::CallsConfig;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use futures::{SinkExt, StreamExt};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to call server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Reconnect window exhausted")]
    ReconnectTimeout,

    #[error("Transport already started")]
    AlreadyStarted,
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Events die vom SignalingTransport ausgelöst werden
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Handshake abgeschlossen (hello empfangen). `resumed` ist nur nach
    /// einem Reconnect-Versuch gesetzt, nie beim ersten Verbinden.
    Open {
        original_id: String,
        current_id: String,
        resumed: bool,
    },

    /// Generische Emission für jede eingehende Nachricht
    Event(InboundEnvelope),

    /// Server hat den Call-Beitritt bestätigt
    Joined(Value),

    /// Server hat den Call-Beitritt abgelehnt
    JoinError(Value),

    /// Peer-Signaling-Payload (SDP/ICE) vom Server
    Message(Value),

    /// Transport-Fehler
    Error(TransportError),

    /// Verbindung geschlossen (Code falls vom Server geliefert)
    Closed(Option<u16>),
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Verbindungsidentität und Keepalive-Zustand.
///
/// Wird über Reconnects hinweg erhalten und nur bei explizitem `close()`
/// zurückgesetzt.
#[derive(Debug, Clone)]
pub(crate) struct ConnState {
    pub connection_id: String,
    pub original_connection_id: String,
    /// Nächste Client-Sequenznummer, beginnt bei 1
    pub seq: i64,
    /// Zuletzt gesehene Server-Sequenznummer (für Resumption)
    pub server_seq: i64,
    pub waiting_for_pong: bool,
    pub expected_pong_seq: i64,
    pub is_connected: bool,
}

impl Default for ConnState {
    fn default() -> Self {
        Self {
            connection_id: String::new(),
            original_connection_id: String::new(),
            seq: 1,
            server_seq: 0,
            waiting_for_pong: false,
            expected_pong_seq: 0,
            is_connected: false,
        }
    }
}

impl ConnState {
    /// Vergibt die nächste Sequenznummer (strikt monoton, nie wiederverwendet)
    pub fn next_seq(&mut self) -> i64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }
}

// ============================================================================
// RECONNECT POLICY
// ============================================================================

/// Linearer Backoff mit harter Obergrenze über die gesamte Outage.
///
/// Die Outage-Uhr startet beim ersten Disconnect und wird bei jedem
/// erfolgreichen Reconnect vollständig zurückgesetzt.
#[derive(Debug)]
pub(crate) struct ReconnectPolicy {
    floor: Duration,
    increment: Duration,
    ceiling: Duration,
    attempts: u32,
    outage_start: Option<Instant>,
}

impl ReconnectPolicy {
    pub fn new(floor: Duration, increment: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            increment,
            ceiling,
            attempts: 0,
            outage_start: None,
        }
    }

    /// Erfolgreicher (Re-)Connect: Backoff und Outage-Uhr zurücksetzen
    pub fn on_connected(&mut self) {
        self.attempts = 0;
        self.outage_start = None;
    }

    /// Nächste Wartezeit, oder `None` wenn die Obergrenze erreicht ist
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        let start = *self.outage_start.get_or_insert(now);
        if now.duration_since(start) >= self.ceiling {
            return None;
        }
        let delay = self.floor + self.increment * self.attempts;
        self.attempts += 1;
        Some(delay)
    }
}

// ============================================================================
// TRANSPORT CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Vollständige WebSocket-URL des Control-Channels
    pub url: String,
    pub auth_token: Option<String>,
    pub ping_interval: Duration,
    pub reconnect_floor: Duration,
    pub reconnect_increment: Duration,
    pub reconnect_ceiling: Duration,
}

impl TransportConfig {
    pub fn from_calls_config(cfg: &CallsConfig) -> Self {
        Self {
            url: cfg.server_url.clone(),
            auth_token: cfg.auth_token.clone(),
            ping_interval: Duration::from_millis(cfg.ping_interval_ms),
            reconnect_floor: Duration::from_millis(cfg.reconnect_floor_ms),
            reconnect_increment: Duration::from_millis(cfg.reconnect_increment_ms),
            reconnect_ceiling: Duration::from_millis(cfg.reconnect_ceiling_ms),
        }
    }
}

// ============================================================================
// SIGNALING TRANSPORT
// ============================================================================

/// Resumierbarer, geordneter Control-Channel zum Call-Server
pub struct SignalingTransport {
    config: TransportConfig,
    state: Arc<RwLock<ConnState>>,
    out_tx: mpsc::Sender<Message>,
    out_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    event_tx: broadcast::Sender<TransportEvent>,
    closed_tx: watch::Sender<bool>,
}

/// Wie eine einzelne Verbindung geendet hat
enum ConnectionEnd {
    /// Expliziter `close()`-Aufruf
    Explicit,
    /// Unerwarteter Abbruch, Reconnect folgt
    Dropped(Option<u16>),
}

impl SignalingTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (out_tx, out_rx) = mpsc::channel(256);
        let (closed_tx, _) = watch::channel(false);

        Self {
            config,
            state: Arc::new(RwLock::new(ConnState::default())),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            event_tx,
            closed_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Aktuelle Connection-ID (leer vor dem ersten hello)
    pub fn connection_id(&self) -> String {
        self.state.read().connection_id.clone()
    }

    /// Stabile Original-Connection-ID (leer vor dem ersten hello)
    pub fn original_connection_id(&self) -> String {
        self.state.read().original_connection_id.clone()
    }

    /// Startet den Verbindungs-Supervisor.
    ///
    /// Verbindet, führt den Handshake aus und hält die Verbindung inklusive
    /// Reconnects am Leben, bis `close()` gerufen wird oder die
    /// Reconnect-Obergrenze überschritten ist.
    pub fn connect(&self) -> Result<(), TransportError> {
        let out_rx = self
            .out_rx
            .lock()
            .take()
            .ok_or(TransportError::AlreadyStarted)?;

        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        let closed_rx = self.closed_tx.subscribe();

        tokio::spawn(async move {
            Self::supervise(config, state, event_tx, out_rx, closed_rx).await;
        });

        Ok(())
    }

    /// Sendet eine Aktion über den Control-Channel (non-blocking).
    ///
    /// `binary = true` wählt die kompakte Kodierung (für SDP-Payloads).
    /// Gibt die vergebene Sequenznummer zurück.
    pub fn send(&self, action: &str, data: Value, binary: bool) -> Result<i64, TransportError> {
        let seq = {
            let mut state = self.state.write();
            if !state.is_connected {
                return Err(TransportError::NotConnected);
            }
            state.next_seq()
        };

        let frame = OutboundEnvelope::new(action, seq, data)
            .encode(binary)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        self.out_tx
            .try_send(frame)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        Ok(seq)
    }

    /// Schließt die Verbindung explizit.
    ///
    /// Setzt die Verbindungsidentität zurück; es findet kein Reconnect statt.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }

    // ========================================================================
    // SUPERVISOR
    // ========================================================================

    async fn supervise(
        config: TransportConfig,
        state: Arc<RwLock<ConnState>>,
        event_tx: broadcast::Sender<TransportEvent>,
        mut out_rx: mpsc::Receiver<Message>,
        mut closed_rx: watch::Receiver<bool>,
    ) {
        let mut policy = ReconnectPolicy::new(
            config.reconnect_floor,
            config.reconnect_increment,
            config.reconnect_ceiling,
        );

        loop {
            if *closed_rx.borrow() {
                break;
            }

            // hello nach einem früheren hello gilt als Resume
            let resumed_candidate = !state.read().original_connection_id.is_empty();

            let url = {
                let st = state.read();
                build_connect_url(&config.url, &st.connection_id, st.server_seq)
            };

            let end = match url {
                Ok(url) => match connect_async(url.as_str()).await {
                    Ok((ws, _)) => {
                        tracing::info!("Connected to call server: {}", config.url);
                        policy.on_connected();
                        Self::drive_connection(
                            ws,
                            &config,
                            &state,
                            &event_tx,
                            &mut out_rx,
                            &mut closed_rx,
                            resumed_candidate,
                        )
                        .await
                    }
                    Err(e) => {
                        tracing::warn!("WebSocket connect failed: {}", e);
                        let _ = event_tx.send(TransportEvent::Error(
                            TransportError::ConnectionFailed(e.to_string()),
                        ));
                        ConnectionEnd::Dropped(None)
                    }
                },
                Err(e) => {
                    let _ = event_tx.send(TransportEvent::Error(e));
                    break;
                }
            };

            state.write().is_connected = false;

            match end {
                ConnectionEnd::Explicit => {
                    tracing::info!("Transport closed");
                    *state.write() = ConnState::default();
                    let _ = event_tx.send(TransportEvent::Closed(None));
                    break;
                }
                ConnectionEnd::Dropped(code) => {
                    let _ = event_tx.send(TransportEvent::Closed(code));
                }
            }

            let Some(delay) = policy.next_delay(Instant::now()) else {
                tracing::error!("Reconnect window exhausted, giving up");
                let _ = event_tx.send(TransportEvent::Error(TransportError::ReconnectTimeout));
                break;
            };

            tracing::info!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = closed_rx.changed() => {}
            }
        }
    }

    /// Treibt eine einzelne Socket-Verbindung bis zu ihrem Ende.
    async fn drive_connection(
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        config: &TransportConfig,
        state: &Arc<RwLock<ConnState>>,
        event_tx: &broadcast::Sender<TransportEvent>,
        out_rx: &mut mpsc::Receiver<Message>,
        closed_rx: &mut watch::Receiver<bool>,
        resumed_candidate: bool,
    ) -> ConnectionEnd {
        let (mut write, mut read) = ws.split();

        {
            let mut st = state.write();
            st.is_connected = true;
            st.waiting_for_pong = false;
        }

        // Auth-Token vor jedem anderen Traffic
        if let Some(token) = &config.auth_token {
            let seq = state.write().next_seq();
            let frame = OutboundEnvelope::new(
                ACTION_AUTH_CHALLENGE,
                seq,
                json!({ "token": token }),
            )
            .encode(false);
            match frame {
                Ok(frame) => {
                    if let Err(e) = write.send(frame).await {
                        tracing::error!("Failed to send auth challenge: {}", e);
                        return ConnectionEnd::Dropped(None);
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to encode auth challenge: {}", e);
                    return ConnectionEnd::Dropped(None);
                }
            }
        }

        let mut ping_timer = tokio::time::interval(config.ping_interval);
        // Erster Tick feuert sofort; der zählt nicht als Keepalive-Runde
        ping_timer.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match InboundEnvelope::parse(&text) {
                                Ok(env) => {
                                    let mut st = state.write();
                                    Self::handle_inbound(&mut st, env, resumed_candidate, event_tx);
                                }
                                Err(e) => {
                                    tracing::warn!("Dropping malformed message: {}", e);
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!("WebSocket closed by server");
                            let code = frame.map(|f| u16::from(f.code));
                            return ConnectionEnd::Dropped(code);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::error!("WebSocket error: {}", e);
                            return ConnectionEnd::Dropped(None);
                        }
                        None => {
                            return ConnectionEnd::Dropped(None);
                        }
                    }
                }

                frame = out_rx.recv() => {
                    let Some(frame) = frame else {
                        return ConnectionEnd::Explicit;
                    };
                    if let Err(e) = write.send(frame).await {
                        tracing::error!("Failed to send WebSocket message: {}", e);
                        return ConnectionEnd::Dropped(None);
                    }
                }

                _ = ping_timer.tick() => {
                    // Noch ausstehender Ping => Timeout, Socket hart schließen
                    let ping = {
                        let mut st = state.write();
                        if st.waiting_for_pong {
                            None
                        } else {
                            let seq = st.next_seq();
                            st.waiting_for_pong = true;
                            st.expected_pong_seq = seq;
                            Some(seq)
                        }
                    };

                    match ping {
                        Some(seq) => {
                            let frame = OutboundEnvelope::new(ACTION_PING, seq, Value::Null)
                                .encode(false);
                            match frame {
                                Ok(frame) => {
                                    if let Err(e) = write.send(frame).await {
                                        tracing::error!("Failed to send ping: {}", e);
                                        return ConnectionEnd::Dropped(None);
                                    }
                                }
                                Err(e) => {
                                    tracing::error!("Failed to encode ping: {}", e);
                                    return ConnectionEnd::Dropped(None);
                                }
                            }
                        }
                        None => {
                            tracing::warn!("Ping timeout, forcing reconnect");
                            let _ = write.send(Message::Close(None)).await;
                            return ConnectionEnd::Dropped(None);
                        }
                    }
                }

                _ = closed_rx.changed() => {
                    if *closed_rx.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return ConnectionEnd::Explicit;
                    }
                }
            }
        }
    }

    // ========================================================================
    // INBOUND HANDLING
    // ========================================================================

    /// Verarbeitet eine eingehende Nachricht.
    ///
    /// Die Server-Sequenznummer wird immer aktualisiert, auch wenn die
    /// Nachricht sonst ignoriert wird, damit ein Reconnect an der richtigen
    /// Stelle fortsetzt.
    fn handle_inbound(
        state: &mut ConnState,
        env: InboundEnvelope,
        resumed_candidate: bool,
        event_tx: &broadcast::Sender<TransportEvent>,
    ) {
        if env.seq != 0 {
            state.server_seq = env.seq;
        }

        // Direkte Antworten (Pong): nur die passende Sequenz löscht das Flag
        if let Some(reply) = env.seq_reply {
            if state.waiting_for_pong && reply == state.expected_pong_seq {
                state.waiting_for_pong = false;
            }
            return;
        }

        match env.event.as_str() {
            EVENT_HELLO => {
                if let Some(id) = env.connection_id() {
                    state.connection_id = id.to_string();
                    if state.original_connection_id.is_empty() {
                        state.original_connection_id = id.to_string();
                    }
                }
                tracing::info!(
                    "Handshake complete (connection_id: {}, resumed: {})",
                    state.connection_id,
                    resumed_candidate
                );
                let _ = event_tx.send(TransportEvent::Open {
                    original_id: state.original_connection_id.clone(),
                    current_id: state.connection_id.clone(),
                    resumed: resumed_candidate,
                });
            }

            EVENT_JOIN | EVENT_ERROR | EVENT_SIGNAL => {
                // Guard gegen Cross-Session-Leakage nach einem Reconnect
                let established = !state.connection_id.is_empty();
                let matches = env
                    .connection_id()
                    .map(|id| {
                        id == state.connection_id || id == state.original_connection_id
                    })
                    .unwrap_or(false);

                if established && matches {
                    let dedicated = match env.event.as_str() {
                        EVENT_JOIN => TransportEvent::Joined(env.data.clone()),
                        EVENT_ERROR => TransportEvent::JoinError(env.data.clone()),
                        _ => TransportEvent::Message(env.data.clone()),
                    };
                    let _ = event_tx.send(dedicated);
                } else {
                    tracing::debug!(
                        "Dropping {} for foreign connection id",
                        env.event
                    );
                }
            }

            _ => {}
        }

        let _ = event_tx.send(TransportEvent::Event(env));
    }
}

impl std::fmt::Debug for SignalingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingTransport")
            .field("url", &self.config.url)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// URL BUILDING
// ============================================================================

/// Baut die Verbindungs-URL mit Resumption-Parametern.
///
/// `connection_id` ist beim ersten Verbinden leer; `sequence_number` ist die
/// zuletzt gesehene Server-Sequenznummer.
fn build_connect_url(
    base: &str,
    connection_id: &str,
    server_seq: i64,
) -> Result<String, TransportError> {
    let mut url = url::Url::parse(base).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("connection_id", connection_id)
        .append_pair("sequence_number", &server_seq.to_string());
    Ok(url.into())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recv_all(rx: &mut broadcast::Receiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_client_seq_strictly_increasing() {
        let mut state = ConnState::default();
        let seqs: Vec<i64> = (0..5).map(|_| state.next_seq()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_connect_url_carries_resume_params() {
        let url = build_connect_url("wss://example.com/plugin/ws", "", 0).unwrap();
        assert!(url.contains("connection_id=&"));
        assert!(url.contains("sequence_number=0"));

        let url = build_connect_url("wss://example.com/plugin/ws", "conn-a", 42).unwrap();
        assert!(url.contains("connection_id=conn-a"));
        assert!(url.contains("sequence_number=42"));
    }

    #[test]
    fn test_pong_mismatch_keeps_waiting_flag() {
        let (tx, _rx) = broadcast::channel(16);
        let mut state = ConnState {
            waiting_for_pong: true,
            expected_pong_seq: 2,
            ..Default::default()
        };

        let mismatched = InboundEnvelope {
            seq_reply: Some(3),
            ..Default::default()
        };
        SignalingTransport::handle_inbound(&mut state, mismatched, false, &tx);
        assert!(state.waiting_for_pong);

        let matching = InboundEnvelope {
            seq_reply: Some(2),
            ..Default::default()
        };
        SignalingTransport::handle_inbound(&mut state, matching, false, &tx);
        assert!(!state.waiting_for_pong);
    }

    #[test]
    fn test_server_seq_updated_even_for_ignored_events() {
        let (tx, _rx) = broadcast::channel(16);
        let mut state = ConnState::default();

        let env = InboundEnvelope {
            event: "posted".to_string(),
            seq: 9,
            ..Default::default()
        };
        SignalingTransport::handle_inbound(&mut state, env, false, &tx);
        assert_eq!(state.server_seq, 9);
    }

    #[test]
    fn test_hello_latches_original_id_and_resume_flag() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut state = ConnState::default();

        let hello = InboundEnvelope {
            event: EVENT_HELLO.to_string(),
            seq: 1,
            data: json!({ "connection_id": "conn-a" }),
            ..Default::default()
        };
        SignalingTransport::handle_inbound(&mut state, hello, false, &tx);
        assert_eq!(state.connection_id, "conn-a");
        assert_eq!(state.original_connection_id, "conn-a");

        let events = recv_all(&mut rx);
        let Some(TransportEvent::Open {
            original_id,
            current_id,
            resumed,
        }) = events.first()
        else {
            panic!("expected open event, got {:?}", events);
        };
        assert_eq!(original_id, "conn-a");
        assert_eq!(current_id, "conn-a");
        assert!(!resumed);

        // Zweites hello nach Reconnect: neue ID, Original bleibt stabil
        let hello = InboundEnvelope {
            event: EVENT_HELLO.to_string(),
            seq: 2,
            data: json!({ "connection_id": "conn-b" }),
            ..Default::default()
        };
        SignalingTransport::handle_inbound(&mut state, hello, true, &tx);
        assert_eq!(state.connection_id, "conn-b");
        assert_eq!(state.original_connection_id, "conn-a");

        let events = recv_all(&mut rx);
        let Some(TransportEvent::Open { resumed, .. }) = events.first() else {
            panic!("expected open event, got {:?}", events);
        };
        assert!(*resumed);
    }

    #[test]
    fn test_signal_requires_matching_connection_id() {
        let (tx, mut rx) = broadcast::channel(16);
        let mut state = ConnState {
            connection_id: "conn-b".to_string(),
            original_connection_id: "conn-a".to_string(),
            ..Default::default()
        };

        // Fremde Connection-ID: nur generisches Event, kein Message
        let foreign = InboundEnvelope {
            event: EVENT_SIGNAL.to_string(),
            seq: 5,
            data: json!({ "connection_id": "conn-x", "data": {"type": "offer"} }),
            ..Default::default()
        };
        SignalingTransport::handle_inbound(&mut state, foreign, false, &tx);
        let events = recv_all(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TransportEvent::Event(_)));

        // Original-ID zählt nach Reconnect weiterhin als eigene
        let own = InboundEnvelope {
            event: EVENT_SIGNAL.to_string(),
            seq: 6,
            data: json!({ "connection_id": "conn-a", "data": {"type": "offer"} }),
            ..Default::default()
        };
        SignalingTransport::handle_inbound(&mut state, own, false, &tx);
        let events = recv_all(&mut rx);
        assert!(matches!(events[0], TransportEvent::Message(_)));
    }

    #[test]
    fn test_backoff_schedule_and_ceiling() {
        let floor = Duration::from_millis(1_000);
        let increment = Duration::from_millis(500);
        let ceiling = Duration::from_millis(30_000);
        let mut policy = ReconnectPolicy::new(floor, increment, ceiling);

        let t0 = Instant::now();
        assert_eq!(policy.next_delay(t0), Some(Duration::from_millis(1_000)));
        assert_eq!(policy.next_delay(t0), Some(Duration::from_millis(1_500)));
        assert_eq!(policy.next_delay(t0), Some(Duration::from_millis(2_000)));

        // Obergrenze: ab 30s Outage keine weiteren Versuche
        let late = t0 + Duration::from_millis(30_000);
        assert_eq!(policy.next_delay(late), None);

        // Erfolgreicher Reconnect setzt Backoff und Outage-Uhr zurück
        policy.on_connected();
        let t1 = late + Duration::from_secs(60);
        assert_eq!(policy.next_delay(t1), Some(Duration::from_millis(1_000)));
    }
}
