//! Call Controller
//!
//! Verbindet Broker, CallEngine und Audio zu einer Sitzung:
//! - Initialisierung (Mikrofon, Geräte, Wiedergabe, Broker gleichzeitig)
//! - Anrufen über das Fragment des Verbindungslinks
//! - Eingehende Anrufe annehmen oder ablehnen
//! - Geräte, Mute und Lautstärke

use super::link::connection_link;
use super::state::{admit, Admission, FragmentAction, SessionState};
use crate::broker::{
    AnswerPayload, BrokerClient, BrokerError, BrokerEvent, CandidatePayload, ClientMessage,
    ConnectionKind, OfferPayload,
};
use crate::call_engine::{
    AudioError, AudioHandler, CallEngine, CallEngineError, CallEvent, CallInfo, DeviceList,
};
use crate::config::{AppConfig, ConfigError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use url::Url;

/// Meldung, solange das Fenster wegen eines offenen Anrufs nicht schließen darf
pub const CLOSE_GUARD_MESSAGE: &str = "You're still connected!";

/// Abstand, in dem die Geräteliste neu gelesen wird
const DEVICE_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Engine(#[from] CallEngineError),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Background task failed: {0}")]
    Task(String),
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events für die Oberfläche
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Broker hat unsere Peer ID akzeptiert
    PeerOpen { peer_id: String, link: String },
    /// Text für die Anzeige des Remote Peers
    RemotePeer(String),
    /// Neues Fragment (`#<id>`) nach einem angenommenen Anruf
    FragmentChanged(String),
    DevicesChanged(DeviceList),
    /// Audio vom Remote Peer wird abgespielt
    RemoteStream { peer_id: String },
    CallClosed { peer_id: String },
    BrokerDisconnected,
    Error(String),
}

impl SessionEvent {
    /// Name des Tauri-Events
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::PeerOpen { .. } => "peer:open",
            SessionEvent::RemotePeer(_) => "peer:remote",
            SessionEvent::FragmentChanged(_) => "peer:fragment",
            SessionEvent::DevicesChanged(_) => "devices:changed",
            SessionEvent::RemoteStream { .. } => "call:stream",
            SessionEvent::CallClosed { .. } => "call:closed",
            SessionEvent::BrokerDisconnected => "broker:disconnected",
            SessionEvent::Error(_) => "app:error",
        }
    }

    /// Payload des Tauri-Events
    pub fn payload(&self) -> serde_json::Value {
        match self {
            SessionEvent::PeerOpen { peer_id, link } => {
                serde_json::json!({ "peerId": peer_id, "link": link })
            }
            SessionEvent::RemotePeer(text)
            | SessionEvent::FragmentChanged(text)
            | SessionEvent::Error(text) => serde_json::Value::String(text.clone()),
            SessionEvent::DevicesChanged(devices) => {
                serde_json::to_value(devices).unwrap_or_default()
            }
            SessionEvent::RemoteStream { peer_id } | SessionEvent::CallClosed { peer_id } => {
                serde_json::json!({ "peerId": peer_id })
            }
            SessionEvent::BrokerDisconnected => serde_json::Value::Null,
        }
    }
}

/// Ergebnis der Initialisierung
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalPeerInfo {
    pub peer_id: String,
    pub link: String,
}

// ============================================================================
// CALL CONTROLLER
// ============================================================================

/// Steuert eine Sitzung; Klone teilen sich denselben Zustand
#[derive(Clone)]
pub struct CallController {
    config: Arc<AppConfig>,
    link_base: Url,
    audio: Arc<Mutex<AudioHandler>>,
    engine: Arc<CallEngine>,
    broker: Arc<RwLock<Option<Arc<BrokerClient>>>>,
    state: Arc<RwLock<SessionState>>,
    devices: Arc<RwLock<DeviceList>>,
    event_tx: broadcast::Sender<SessionEvent>,
    initialized: Arc<OnceCell<LocalPeerInfo>>,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CallController {
    pub fn new(config: AppConfig) -> Result<Self, SessionError> {
        let link_base = Url::parse(&config.link_base).map_err(ConfigError::from)?;
        let audio = Arc::new(Mutex::new(AudioHandler::new()));
        let engine = Arc::new(CallEngine::new(
            config.rtc_ice_servers(),
            Arc::clone(&audio),
        ));
        let (event_tx, _) = broadcast::channel(100);

        Ok(Self {
            config: Arc::new(config),
            link_base,
            audio,
            engine,
            broker: Arc::new(RwLock::new(None)),
            state: Arc::new(RwLock::new(SessionState::default())),
            devices: Arc::new(RwLock::new(DeviceList::default())),
            event_tx,
            initialized: Arc::new(OnceCell::new()),
            background: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.read().clone()
    }

    pub fn local_peer_id(&self) -> Option<String> {
        self.state.read().local_peer_id.clone()
    }

    /// Link, den der Remote Peer zum Anrufen braucht
    pub fn connection_link(&self) -> Option<String> {
        self.local_peer_id()
            .map(|id| connection_link(&self.link_base, &id).to_string())
    }

    pub fn devices(&self) -> DeviceList {
        self.devices.read().clone()
    }

    pub fn call_status(&self) -> Option<CallInfo> {
        self.engine.current_call()
    }

    /// Audio-Levels (input, output)
    pub fn audio_levels(&self) -> (f32, f32) {
        self.audio.lock().get_levels()
    }

    /// Verhindert das Schließen, solange ein Anruf offen ist
    pub fn close_guard(&self) -> Option<&'static str> {
        if self.engine.is_call_open() {
            Some(CLOSE_GUARD_MESSAGE)
        } else {
            None
        }
    }

    // ========================================================================
    // INITIALIZATION
    // ========================================================================

    /// Initialisiert die Sitzung (nur einmal) und wählt das Fragment an
    pub async fn initialize(&self, fragment: Option<String>) -> Result<LocalPeerInfo, SessionError> {
        let info = self
            .initialized
            .get_or_try_init(|| self.run_initialize(fragment))
            .await?;
        Ok(info.clone())
    }

    async fn run_initialize(&self, fragment: Option<String>) -> Result<LocalPeerInfo, SessionError> {
        tracing::info!("Initializing session...");

        let (sending, devices, playback, broker) = tokio::join!(
            self.get_and_update_sending_stream(),
            self.populate_audio_devices(),
            self.set_audio_sink(),
            self.connect_broker(),
        );

        // Ohne Audio kann trotzdem gewählt werden
        if let Err(e) = sending {
            self.report("Failed to get sending stream", &e);
        }
        if let Err(e) = devices {
            self.report("Failed to enumerate audio devices", &e);
        }
        if let Err(e) = playback {
            self.report("Failed to start playback", &e);
        }
        let peer_id = broker?;
        self.spawn_engine_loop();

        let link = connection_link(&self.link_base, &peer_id).to_string();
        self.state.write().local_peer_id = Some(peer_id.clone());
        tracing::info!("Connected to broker, local peer id: {}", peer_id);
        self.emit(SessionEvent::PeerOpen {
            peer_id: peer_id.clone(),
            link: link.clone(),
        });

        self.spawn_device_watcher();

        if let Some(fragment) = fragment {
            if let Err(e) = self.connect_to_remote_peer_from_fragment(&fragment).await {
                self.report("Failed to connect to remote peer", &e);
            }
        }

        Ok(LocalPeerInfo { peer_id, link })
    }

    async fn connect_broker(&self) -> Result<String, SessionError> {
        let mut client = BrokerClient::new(self.config.broker.clone());
        let event_rx = client.subscribe();

        let peer_id = client.connect().await.map_err(|e| {
            tracing::error!("Broker connection failed: {}", e);
            e
        })?;

        *self.broker.write() = Some(Arc::new(client));
        self.spawn_broker_loop(event_rx);
        Ok(peer_id)
    }

    // ========================================================================
    // DIALING
    // ========================================================================

    /// Reagiert auf ein neues Fragment des Verbindungslinks
    pub async fn connect_to_remote_peer_from_fragment(
        &self,
        fragment: &str,
    ) -> Result<(), SessionError> {
        let action = self
            .state
            .read()
            .fragment_action(fragment, self.engine.has_call());

        match action {
            FragmentAction::Ignore => Ok(()),
            FragmentAction::Dial {
                remote_peer_id,
                close_current,
            } => {
                if close_current {
                    tracing::info!(
                        "Closing call with {:?} because fragment changed",
                        self.state.read().remote_peer_id
                    );
                    self.engine.close_call();
                }

                self.state.write().remote_peer_id = Some(remote_peer_id.clone());
                tracing::info!(
                    "Connecting to remote peer from fragment, remote peer id: {}",
                    remote_peer_id
                );
                self.connect_to_remote_peer().await
            }
        }
    }

    /// Öffnet Datenverbindung und Anruf zum Remote Peer
    pub async fn connect_to_remote_peer(&self) -> Result<(), SessionError> {
        let remote_peer_id = self.state.read().remote_peer_id.clone();
        let remote_peer_id = match remote_peer_id {
            Some(id) => id,
            None => return Ok(()),
        };

        tracing::info!("Connecting to remote peer {}", remote_peer_id);
        self.emit(SessionEvent::RemotePeer(format!(
            "connecting to {}",
            remote_peer_id
        )));

        let broker = self.broker_client()?;

        let data = self.engine.open_data_connection(&remote_peer_id).await?;
        broker.send(&ClientMessage::Offer {
            dst: remote_peer_id.clone(),
            payload: OfferPayload::data(data.connection_id, data.sdp),
        })?;

        if let Err(e) = self.get_and_update_sending_stream().await {
            self.report("Failed to get sending stream", &e);
        }

        let call = self.engine.start_call(&remote_peer_id).await?;
        broker.send(&ClientMessage::Offer {
            dst: remote_peer_id,
            payload: OfferPayload::media(call.connection_id, call.sdp),
        })?;

        Ok(())
    }

    // ========================================================================
    // AUDIO
    // ========================================================================

    /// Nimmt vom gewählten Eingabegerät auf und ersetzt den Track im Anruf
    pub async fn get_and_update_sending_stream(&self) -> Result<(), SessionError> {
        let (device, muted) = {
            let state = self.state.read();
            (state.input_device.clone(), state.is_sending_muted)
        };
        tracing::info!("Getting sending stream from device id {}", device);

        {
            let mut audio = self.audio.lock();
            audio.set_sending_muted(muted);
            audio.start_capture(Some(&device))?;
        }

        self.engine.replace_sending_track().await?;
        Ok(())
    }

    /// Liest die Geräteliste neu ein
    pub async fn populate_audio_devices(&self) -> Result<DeviceList, SessionError> {
        let devices = tokio::task::spawn_blocking(AudioHandler::list_devices)
            .await
            .map_err(|e| SessionError::Task(e.to_string()))??;

        let changed = {
            let mut current = self.devices.write();
            if *current != devices {
                *current = devices.clone();
                true
            } else {
                false
            }
        };

        if changed {
            tracing::debug!(
                "Audio devices changed: {} inputs, {} outputs",
                devices.inputs.len(),
                devices.outputs.len()
            );
            self.emit(SessionEvent::DevicesChanged(devices.clone()));
        }

        Ok(devices)
    }

    pub async fn select_input_device(&self, device_id: String) -> Result<(), SessionError> {
        self.state.write().input_device = device_id;
        self.get_and_update_sending_stream().await
    }

    /// Gerät für empfangenes Audio und Loopback
    pub async fn select_output_device(&self, device_id: String) -> Result<(), SessionError> {
        self.state.write().output_device = device_id;
        self.set_audio_sink().await
    }

    async fn set_audio_sink(&self) -> Result<(), SessionError> {
        let device = self.state.read().output_device.clone();
        tracing::info!("Setting playback device to device id {}", device);
        self.audio.lock().start_playback(Some(&device))?;
        Ok(())
    }

    pub fn set_loopback_volume(&self, volume: f32) -> Result<(), SessionError> {
        self.audio.lock().set_loopback_volume(volume)?;
        Ok(())
    }

    pub fn set_receiving_volume(&self, volume: f32) -> Result<(), SessionError> {
        self.audio.lock().set_receiving_volume(volume)?;
        Ok(())
    }

    pub async fn set_sending_muted(&self, muted: bool) -> Result<(), SessionError> {
        self.state.write().is_sending_muted = muted;
        self.get_and_update_sending_stream().await
    }

    pub fn set_receiving_muted(&self, muted: bool) {
        self.audio.lock().set_receiving_muted(muted);
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    /// Beendet Anruf, Datenverbindung, Broker und Audio
    pub fn shutdown(&self) {
        tracing::info!("Shutting down session");

        for task in self.background.lock().drain(..) {
            task.abort();
        }

        let broker = self.broker.write().take();
        if let Some(broker) = broker.as_ref() {
            for message in self.leave_messages() {
                if let Err(e) = broker.send(&message) {
                    tracing::debug!("Failed to send leave: {}", e);
                }
            }
        }

        self.engine.close_call();
        self.engine.close_data_connection();

        if let Some(broker) = broker {
            broker.disconnect();
        }

        self.audio.lock().stop();
    }

    /// `LEAVE` an jeden Peer, mit dem noch eine Verbindung besteht
    fn leave_messages(&self) -> Vec<ClientMessage> {
        let mut peers: Vec<String> = self
            .engine
            .current_call()
            .map(|call| call.peer_id)
            .into_iter()
            .chain(self.engine.data_connection_peer())
            .collect();
        peers.dedup();

        peers
            .into_iter()
            .map(|dst| ClientMessage::Leave { dst })
            .collect()
    }

    // ========================================================================
    // EVENT HANDLING
    // ========================================================================

    fn spawn_broker_loop(&self, mut event_rx: broadcast::Receiver<BrokerEvent>) {
        let controller = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = controller.handle_broker_event(event).await {
                            controller.report("Failed to handle broker event", &e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Dropped {} broker events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.background.lock().push(handle);
    }

    fn spawn_engine_loop(&self) {
        let controller = self.clone();
        let mut event_rx = self.engine.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    Ok(event) => controller.handle_call_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Dropped {} call events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        self.background.lock().push(handle);
    }

    fn spawn_device_watcher(&self) {
        let controller = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(DEVICE_POLL_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = controller.populate_audio_devices().await {
                    tracing::debug!("Device poll failed: {}", e);
                }
            }
        });
        self.background.lock().push(handle);
    }

    async fn handle_broker_event(&self, event: BrokerEvent) -> Result<(), SessionError> {
        match event {
            BrokerEvent::Open { .. } => {}

            BrokerEvent::Disconnected => {
                tracing::warn!("Disconnected from broker");
                self.emit(SessionEvent::BrokerDisconnected);
            }

            BrokerEvent::Offer { src, payload } => self.handle_offer(src, payload).await?,

            BrokerEvent::Answer { src, payload } => {
                tracing::debug!("Answer from {} for {}", src, payload.connection_id);
                self.engine
                    .handle_answer(&payload.connection_id, payload.sdp.sdp)
                    .await?;
            }

            BrokerEvent::Candidate { payload, .. } => {
                self.engine
                    .add_ice_candidate(&payload.connection_id, payload.candidate)
                    .await?;
            }

            BrokerEvent::Leave { peer_id } => {
                tracing::info!("Remote peer {} left", peer_id);
                self.engine.close_peer(&peer_id);
            }

            BrokerEvent::Expire { peer_id } => {
                tracing::warn!("Could not reach peer {}", peer_id);
                self.engine.close_peer(&peer_id);
                self.emit(SessionEvent::Error(format!("peer unavailable: {}", peer_id)));
            }

            BrokerEvent::Error { message } => {
                tracing::error!("Broker error: {}", message);
                self.emit(SessionEvent::Error(message));
            }
        }
        Ok(())
    }

    /// Eingehender Anruf oder eingehende Datenverbindung
    async fn handle_offer(&self, src: String, payload: OfferPayload) -> Result<(), SessionError> {
        let admission = admit(self.engine.is_call_open());

        match payload.kind {
            ConnectionKind::Media => {
                tracing::info!("Incoming call from {} ({})", src, payload.connection_id);

                if admission == Admission::Reject {
                    tracing::info!(
                        "Incoming call from {} rejected because a call is already ongoing",
                        src
                    );
                    self.engine.reject(&payload.connection_id);
                    return Ok(());
                }

                if let Err(e) = self.get_and_update_sending_stream().await {
                    self.report("Failed to get sending stream", &e);
                }

                let answer = match self
                    .engine
                    .accept_call(&src, &payload.connection_id, payload.sdp.sdp)
                    .await
                {
                    Ok(answer) => answer,
                    Err(CallEngineError::Superseded(id)) => {
                        tracing::info!("Incoming call {} replaced during setup", id);
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };

                self.state.write().remote_peer_id = Some(src.clone());
                self.emit(SessionEvent::RemotePeer(src.clone()));
                self.emit(SessionEvent::FragmentChanged(format!("#{}", src)));

                self.send(ClientMessage::Answer {
                    dst: src,
                    payload: AnswerPayload::new(
                        ConnectionKind::Media,
                        payload.connection_id,
                        answer,
                    ),
                })
            }

            ConnectionKind::Data => {
                tracing::info!(
                    "Incoming connection from {} ({})",
                    src,
                    payload.connection_id
                );

                if admission == Admission::Reject {
                    tracing::info!(
                        "Incoming connection from {} rejected because a call is already ongoing",
                        src
                    );
                    self.engine.reject(&payload.connection_id);
                    return Ok(());
                }

                let answer = match self
                    .engine
                    .accept_data_connection(&src, &payload.connection_id, payload.sdp.sdp)
                    .await
                {
                    Ok(answer) => answer,
                    Err(CallEngineError::Superseded(id)) => {
                        tracing::info!("Incoming connection {} replaced during setup", id);
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };

                self.send(ClientMessage::Answer {
                    dst: src,
                    payload: AnswerPayload::new(
                        ConnectionKind::Data,
                        payload.connection_id,
                        answer,
                    ),
                })
            }
        }
    }

    fn handle_call_event(&self, event: CallEvent) {
        match event {
            CallEvent::LocalCandidate {
                peer_id,
                connection_id,
                kind,
                candidate,
            } => {
                let result = self.send(ClientMessage::Candidate {
                    dst: peer_id,
                    payload: CandidatePayload {
                        candidate,
                        kind,
                        connection_id,
                    },
                });
                if let Err(e) = result {
                    tracing::warn!("Failed to send ICE candidate: {}", e);
                }
            }

            CallEvent::CallOpened {
                peer_id,
                connection_id,
            } => {
                tracing::info!("Call with {} open ({})", peer_id, connection_id);
            }

            CallEvent::RemoteStream { peer_id, .. } => {
                tracing::info!("Received stream from {}", peer_id);
                let remote = self
                    .state
                    .read()
                    .remote_peer_id
                    .clone()
                    .unwrap_or_else(|| peer_id.clone());
                self.emit(SessionEvent::RemotePeer(remote));
                self.emit(SessionEvent::RemoteStream { peer_id });
            }

            CallEvent::CallClosed { peer_id, .. } => {
                tracing::info!("Call connection with {} closed", peer_id);
                self.emit(SessionEvent::CallClosed { peer_id });
            }

            CallEvent::ConnectionOpened {
                peer_id,
                connection_id,
            } => {
                tracing::debug!("Connection to {} open ({})", peer_id, connection_id);
            }

            CallEvent::ConnectionClosed { peer_id, .. } => {
                tracing::info!("Connection to remote peer {} closed", peer_id);
            }
        }
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn broker_client(&self) -> Result<Arc<BrokerClient>, SessionError> {
        self.broker.read().clone().ok_or(SessionError::NotConnected)
    }

    fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        self.broker_client()?.send(&message)?;
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Loggt einen Fehler und zeigt ihn in der Oberfläche an
    fn report(&self, context: &str, error: &SessionError) {
        tracing::error!("{}: {}", context, error);
        self.emit(SessionEvent::Error(format!("{}: {}", context, error)));
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("state", &*self.state.read())
            .field("engine", &self.engine)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;

    fn controller() -> CallController {
        let config = AppConfig {
            ice_servers: Vec::new(),
            ..Default::default()
        };
        CallController::new(config).unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_invalid_link_base() {
        let config = AppConfig {
            link_base: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            CallController::new(config),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(
            SessionEvent::RemotePeer("x".to_string()).name(),
            "peer:remote"
        );
        assert_eq!(SessionEvent::BrokerDisconnected.name(), "broker:disconnected");
        assert_eq!(
            SessionEvent::CallClosed {
                peer_id: "x".to_string()
            }
            .payload()["peerId"],
            "x"
        );
    }

    #[tokio::test]
    async fn test_fragment_records_remote_peer_without_broker() {
        let controller = controller();
        let mut rx = controller.subscribe();

        let result = controller
            .connect_to_remote_peer_from_fragment("#bob")
            .await;

        assert!(matches!(result, Err(SessionError::NotConnected)));
        assert_eq!(controller.state().remote_peer_id.as_deref(), Some("bob"));
        assert_eq!(
            drain(&mut rx),
            vec![SessionEvent::RemotePeer("connecting to bob".to_string())]
        );
    }

    #[tokio::test]
    async fn test_same_fragment_is_ignored() {
        let controller = controller();
        let _ = controller
            .connect_to_remote_peer_from_fragment("#bob")
            .await;
        let mut rx = controller.subscribe();

        controller
            .connect_to_remote_peer_from_fragment("peercall://call/#bob")
            .await
            .unwrap();
        controller
            .connect_to_remote_peer_from_fragment("")
            .await
            .unwrap();

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_connect_without_remote_peer_is_noop() {
        let controller = controller();
        controller.connect_to_remote_peer().await.unwrap();
        assert!(controller.call_status().is_none());
    }

    #[test]
    fn test_close_guard_without_call() {
        let controller = controller();
        assert_eq!(controller.close_guard(), None);
    }

    #[test]
    fn test_volumes() {
        let controller = controller();
        assert!(matches!(
            controller.set_loopback_volume(1.5),
            Err(SessionError::Audio(AudioError::InvalidVolume(_)))
        ));

        controller.set_receiving_muted(true);
        controller.set_receiving_volume(0.3).unwrap();

        let gain = controller.audio.lock().receiving_gain();
        assert!(!gain.muted);
        assert!((gain.volume - 0.3).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_incoming_call_is_answered() {
        let controller = controller();
        let mut rx = controller.subscribe();

        let caller = CallEngine::new(Vec::new(), Arc::new(Mutex::new(AudioHandler::new())));
        let offer = caller.start_call("callee").await.unwrap();

        let result = controller
            .handle_offer(
                "caller".to_string(),
                OfferPayload::media(offer.connection_id.clone(), offer.sdp),
            )
            .await;

        // Answer kann ohne Broker nicht raus, der Anruf steht trotzdem
        assert!(matches!(result, Err(SessionError::NotConnected)));
        assert_eq!(controller.state().remote_peer_id.as_deref(), Some("caller"));
        assert_eq!(
            controller.call_status().map(|c| c.connection_id),
            Some(offer.connection_id)
        );

        let events = drain(&mut rx);
        assert!(events.contains(&SessionEvent::RemotePeer("caller".to_string())));
        assert!(events.contains(&SessionEvent::FragmentChanged("#caller".to_string())));

        controller.shutdown();
        caller.close_call();
    }

    #[tokio::test]
    async fn test_incoming_data_connection_is_answered() {
        let controller = controller();

        let caller = CallEngine::new(Vec::new(), Arc::new(Mutex::new(AudioHandler::new())));
        let offer = caller.open_data_connection("callee").await.unwrap();

        let result = controller
            .handle_offer(
                "caller".to_string(),
                OfferPayload::data(offer.connection_id, offer.sdp),
            )
            .await;

        assert!(matches!(result, Err(SessionError::NotConnected)));
        assert_eq!(
            controller.engine.data_connection_peer().as_deref(),
            Some("caller")
        );
        // Datenverbindungen ändern den Remote Peer nicht
        assert!(controller.state().remote_peer_id.is_none());

        controller.shutdown();
        caller.close_data_connection();
    }

    fn remote_engine() -> CallEngine {
        CallEngine::new(Vec::new(), Arc::new(Mutex::new(AudioHandler::new())))
    }

    /// Controller mit verbundenem Anruf zu `alice`
    async fn controller_in_call() -> CallController {
        let controller = controller();
        controller.engine.start_call("alice").await.unwrap();
        controller.engine.mark_call_open();
        controller.state.write().remote_peer_id = Some("alice".to_string());
        controller
    }

    #[tokio::test]
    async fn test_incoming_call_rejected_while_call_open() {
        let controller = controller_in_call().await;
        let ongoing = controller.call_status().unwrap();
        let mut rx = controller.subscribe();

        let intruder = remote_engine();
        let offer = intruder.start_call("callee").await.unwrap();

        // Ablehnen braucht keinen Broker
        controller
            .handle_offer(
                "mallory".to_string(),
                OfferPayload::media(offer.connection_id, offer.sdp),
            )
            .await
            .unwrap();

        assert_eq!(controller.call_status(), Some(ongoing));
        assert_eq!(controller.state().remote_peer_id.as_deref(), Some("alice"));
        assert!(drain(&mut rx).is_empty());

        controller.shutdown();
        intruder.close_call();
    }

    #[tokio::test]
    async fn test_incoming_data_connection_rejected_while_call_open() {
        let controller = controller_in_call().await;

        let intruder = remote_engine();
        let offer = intruder.open_data_connection("callee").await.unwrap();

        controller
            .handle_offer(
                "mallory".to_string(),
                OfferPayload::data(offer.connection_id, offer.sdp),
            )
            .await
            .unwrap();

        assert!(controller.engine.data_connection_peer().is_none());
        assert!(controller.close_guard().is_some());

        controller.shutdown();
        intruder.close_data_connection();
    }

    #[tokio::test]
    async fn test_new_fragment_closes_current_call() {
        let controller = controller_in_call().await;
        let mut rx = controller.engine.subscribe();
        let ongoing = controller.call_status().unwrap();

        // Ohne Broker scheitert das Wählen, der alte Anruf ist trotzdem zu
        let result = controller
            .connect_to_remote_peer_from_fragment("#bob")
            .await;

        assert!(matches!(result, Err(SessionError::NotConnected)));
        assert!(controller.call_status().is_none());
        assert_eq!(controller.state().remote_peer_id.as_deref(), Some("bob"));

        let closed = std::iter::from_fn(|| rx.try_recv().ok()).any(|event| {
            matches!(event, CallEvent::CallClosed { ref connection_id, .. }
                if *connection_id == ongoing.connection_id)
        });
        assert!(closed);
    }

    #[tokio::test]
    async fn test_failed_initialize_spawns_no_loops() {
        let config = AppConfig {
            ice_servers: Vec::new(),
            broker: BrokerConfig {
                host: "127.0.0.1".to_string(),
                port: 1,
                secure: false,
                peer_id: Some("local".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let controller = CallController::new(config).unwrap();

        for _ in 0..2 {
            let result = controller.initialize(None).await;
            assert!(matches!(result, Err(SessionError::Broker(_))));
        }

        assert!(controller.background.lock().is_empty());
        assert!(controller.local_peer_id().is_none());
    }

    #[tokio::test]
    async fn test_leave_messages_for_connected_peers() {
        let controller = controller();
        assert!(controller.leave_messages().is_empty());

        controller.engine.start_call("alice").await.unwrap();
        controller.engine.open_data_connection("alice").await.unwrap();
        assert_eq!(
            controller.leave_messages(),
            vec![ClientMessage::Leave {
                dst: "alice".to_string()
            }]
        );

        controller.engine.open_data_connection("bob").await.unwrap();
        assert_eq!(controller.leave_messages().len(), 2);

        controller.shutdown();
    }

    #[tokio::test]
    async fn test_expire_reports_error() {
        let controller = controller();
        let mut rx = controller.subscribe();

        controller
            .handle_broker_event(BrokerEvent::Expire {
                peer_id: "gone".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![SessionEvent::Error("peer unavailable: gone".to_string())]
        );
    }
}
