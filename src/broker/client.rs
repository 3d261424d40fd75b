//! WebSocket Client für den PeerJS-Broker
//!
//! Verwaltet die Verbindung zum Broker:
//! - Peer ID beim Broker abholen (oder feste ID aus der Konfiguration)
//! - WebSocket öffnen und auf `OPEN` warten
//! - Heartbeats senden
//! - Eingehende Nachrichten parsen und als Events weiterleiten

use super::messages::*;
use crate::config::BrokerConfig;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Maximale Wartezeit auf `OPEN`
const OPEN_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    #[error("Failed to obtain peer id: {0}")]
    IdRequestFailed(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Broker rejected peer id: {0}")]
    Rejected(String),

    #[error("Invalid broker configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// BROKER EVENTS
// ============================================================================

/// Events die vom BrokerClient ausgelöst werden
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// Broker hat unsere Peer ID akzeptiert
    Open { peer_id: String },

    /// Verbindung getrennt
    Disconnected,

    /// Eingehendes Offer (Anruf oder Datenverbindung)
    Offer { src: String, payload: OfferPayload },

    /// Answer auf ein eigenes Offer
    Answer { src: String, payload: AnswerPayload },

    /// ICE Candidate vom Remote Peer
    Candidate {
        src: String,
        payload: CandidatePayload,
    },

    /// Remote Peer hat den Broker verlassen
    Leave { peer_id: String },

    /// Nachricht an Peer konnte nicht zugestellt werden
    Expire { peer_id: String },

    /// Fehler vom Broker
    Error { message: String },
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    is_open: bool,
    peer_id: Option<String>,
}

// ============================================================================
// BROKER CLIENT
// ============================================================================

/// WebSocket Client für die Kommunikation mit dem Broker
pub struct BrokerClient {
    config: BrokerConfig,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<Message>>,
    event_tx: broadcast::Sender<BrokerEvent>,
}

impl BrokerClient {
    /// Erstellt einen neuen BrokerClient
    pub fn new(config: BrokerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            config,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.event_tx.subscribe()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Broker und wartet auf `OPEN`
    ///
    /// Gibt die akzeptierte Peer ID zurück.
    pub async fn connect(&mut self) -> Result<String, BrokerError> {
        let peer_id = match self.config.peer_id.clone() {
            Some(peer_id) => peer_id,
            None => self.fetch_peer_id().await?,
        };

        let ws_url = self
            .config
            .socket_url(&peer_id, &random_token())
            .map_err(|e| BrokerError::InvalidConfig(e.to_string()))?;

        tracing::info!(
            "Connecting to broker {}:{} as {}",
            self.config.host,
            self.config.port,
            peer_id
        );

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<Message>(100);
        self.tx = Some(tx.clone());

        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.is_open = false;
            state.peer_id = Some(peer_id.clone());
        }

        // Channel für die OPEN-Antwort
        let (open_tx, mut open_rx) = mpsc::channel::<Result<String, BrokerError>>(1);

        // Read-Task starten
        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(
                                server_msg,
                                &state_clone,
                                &event_tx,
                                &open_tx,
                            )
                            .await;
                        }
                        Err(e) => {
                            tracing::debug!("Ignoring unknown broker message ({}): {}", e, text);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by broker");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            {
                let mut state = state_clone.write();
                state.is_connected = false;
                state.is_open = false;
            }
            let _ = open_tx.try_send(Err(BrokerError::ConnectionFailed(
                "Connection closed before OPEN".to_string(),
            )));
            let _ = event_tx.send(BrokerEvent::Disconnected);
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        // Heartbeat-Task starten
        let state_clone = Arc::clone(&self.state);
        let interval_secs = self.config.ping_interval_secs.max(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
            // Der erste Tick kommt sofort
            interval.tick().await;
            loop {
                interval.tick().await;
                if !state_clone.read().is_connected {
                    tracing::debug!("Heartbeat: broker disconnected, stopping heartbeat task");
                    break;
                }
                match serde_json::to_string(&ClientMessage::Heartbeat) {
                    Ok(text) => {
                        if tx.try_send(Message::Text(text)).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Failed to encode heartbeat: {}", e),
                }
            }
        });

        tokio::select! {
            result = open_rx.recv() => {
                match result {
                    Some(Ok(peer_id)) => Ok(peer_id),
                    Some(Err(e)) => Err(e),
                    None => Err(BrokerError::ConnectionFailed("No response".to_string())),
                }
            }
            _ = tokio::time::sleep(tokio::time::Duration::from_secs(OPEN_TIMEOUT_SECS)) => {
                Err(BrokerError::ConnectionFailed("Timeout waiting for OPEN".to_string()))
            }
        }
    }

    /// Holt eine neue Peer ID vom Broker
    async fn fetch_peer_id(&self) -> Result<String, BrokerError> {
        let cache_buster = format!(
            "{}{}",
            chrono::Utc::now().timestamp_millis(),
            rand::thread_rng().gen::<u32>()
        );
        let url = self
            .config
            .id_url(&cache_buster)
            .map_err(|e| BrokerError::InvalidConfig(e.to_string()))?;

        tracing::debug!("Requesting peer id from {}", url);

        let response = reqwest::get(url)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BrokerError::IdRequestFailed(e.to_string()))?;

        let peer_id = response
            .text()
            .await
            .map_err(|e| BrokerError::IdRequestFailed(e.to_string()))?
            .trim()
            .to_string();

        if peer_id.is_empty() {
            return Err(BrokerError::IdRequestFailed("Empty peer id".to_string()));
        }

        Ok(peer_id)
    }

    /// Sendet eine Nachricht (blockiert nicht, verwendet try_send)
    pub fn send(&self, message: &ClientMessage) -> Result<(), BrokerError> {
        let tx = self.tx.as_ref().ok_or(BrokerError::NotConnected)?;
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        let text =
            serde_json::to_string(message).map_err(|e| BrokerError::SendFailed(e.to_string()))?;

        tx.try_send(Message::Text(text))
            .map_err(|e| BrokerError::SendFailed(e.to_string()))
    }

    /// Trennt die Verbindung zum Broker
    pub fn disconnect(&self) {
        if let Some(tx) = self.tx.as_ref() {
            let _ = tx.try_send(Message::Close(None));
        }
        let mut state = self.state.write();
        state.is_connected = false;
        state.is_open = false;
    }

    /// Verarbeitet eingehende Broker-Nachrichten
    async fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        event_tx: &broadcast::Sender<BrokerEvent>,
        open_tx: &mpsc::Sender<Result<String, BrokerError>>,
    ) {
        match msg {
            ServerMessage::Open => {
                let peer_id = {
                    let mut s = state.write();
                    s.is_open = true;
                    s.peer_id.clone().unwrap_or_default()
                };
                tracing::info!("Broker accepted peer id {}", peer_id);
                let _ = open_tx.send(Ok(peer_id.clone())).await;
                let _ = event_tx.send(BrokerEvent::Open { peer_id });
            }

            ServerMessage::IdTaken { payload } | ServerMessage::InvalidKey { payload } => {
                tracing::error!("Broker rejected connection: {}", payload.msg);
                let _ = open_tx.try_send(Err(BrokerError::Rejected(payload.msg.clone())));
                let _ = event_tx.send(BrokerEvent::Error {
                    message: payload.msg,
                });
            }

            ServerMessage::Error { payload } => {
                tracing::error!("Broker error: {}", payload.msg);
                if !state.read().is_open {
                    let _ = open_tx.try_send(Err(BrokerError::Rejected(payload.msg.clone())));
                }
                let _ = event_tx.send(BrokerEvent::Error {
                    message: payload.msg,
                });
            }

            ServerMessage::Leave { src } => {
                let _ = event_tx.send(BrokerEvent::Leave { peer_id: src });
            }

            ServerMessage::Expire { src } => {
                let _ = event_tx.send(BrokerEvent::Expire { peer_id: src });
            }

            ServerMessage::Offer { src, payload } => {
                let _ = event_tx.send(BrokerEvent::Offer { src, payload });
            }

            ServerMessage::Answer { src, payload } => {
                let _ = event_tx.send(BrokerEvent::Answer { src, payload });
            }

            ServerMessage::Candidate { src, payload } => {
                let _ = event_tx.send(BrokerEvent::Candidate { src, payload });
            }

            ServerMessage::Heartbeat => {
                // Heartbeat-Echo - nichts zu tun
            }
        }
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("host", &self.config.host)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Zufälliges Token wie im PeerJS-Client (Base36)
pub fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..11)
        .filter_map(|_| std::char::from_digit(rng.gen_range(0..36), 36))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn local_config(port: u16) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port,
            secure: false,
            peer_id: Some("local-peer".to_string()),
            ..Default::default()
        }
    }

    /// Minimaler Broker: akzeptiert eine Verbindung und schickt die
    /// übergebenen Nachrichten, gibt danach alle empfangenen Texte zurück
    async fn spawn_broker(
        replies: Vec<&'static str>,
    ) -> (u16, tokio::sync::mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = tokio::sync::mpsc::channel(16);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for reply in replies {
                ws.send(Message::Text(reply.to_string())).await.unwrap();
            }
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let _ = seen_tx.send(text).await;
                }
            }
        });

        (port, seen_rx)
    }

    #[test]
    fn test_random_token() {
        let token = random_token();
        assert_eq!(token.len(), 11);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn test_connect_waits_for_open() {
        let (port, _seen) = spawn_broker(vec![r#"{"type":"OPEN"}"#]).await;

        let mut client = BrokerClient::new(local_config(port));
        let peer_id = client.connect().await.unwrap();

        assert_eq!(peer_id, "local-peer");
        assert!(client.is_connected());
        assert!(client.state.read().is_open);
    }

    #[tokio::test]
    async fn test_id_taken_fails_connect() {
        let (port, _seen) =
            spawn_broker(vec![r#"{"type":"ID-TAKEN","payload":{"msg":"taken"}}"#]).await;

        let mut client = BrokerClient::new(local_config(port));
        let result = client.connect().await;

        assert!(matches!(result, Err(BrokerError::Rejected(msg)) if msg == "taken"));
        assert!(!client.state.read().is_open);
    }

    #[tokio::test]
    async fn test_offer_is_forwarded_as_event() {
        let (port, _seen) = spawn_broker(vec![
            r#"{"type":"OPEN"}"#,
            r#"{"type":"OFFER","src":"remote","payload":{"sdp":{"type":"offer","sdp":"v=0"},"type":"media","connectionId":"mc_1"}}"#,
        ])
        .await;

        let mut client = BrokerClient::new(local_config(port));
        let mut events = client.subscribe();
        client.connect().await.unwrap();

        loop {
            match events.recv().await.unwrap() {
                BrokerEvent::Offer { src, payload } => {
                    assert_eq!(src, "remote");
                    assert_eq!(payload.connection_id, "mc_1");
                    break;
                }
                BrokerEvent::Open { .. } => continue,
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_send_reaches_broker() {
        let (port, mut seen) = spawn_broker(vec![r#"{"type":"OPEN"}"#]).await;

        let mut client = BrokerClient::new(local_config(port));
        client.connect().await.unwrap();
        client
            .send(&ClientMessage::Leave {
                dst: "remote".to_string(),
            })
            .unwrap();

        let text = seen.recv().await.unwrap();
        assert_eq!(text, r#"{"type":"LEAVE","dst":"remote"}"#);
    }

    #[test]
    fn test_send_without_connection() {
        let client = BrokerClient::new(BrokerConfig::default());
        assert!(matches!(
            client.send(&ClientMessage::Heartbeat),
            Err(BrokerError::NotConnected)
        ));
    }
}
