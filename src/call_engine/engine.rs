//! WebRTC Call Engine
//!
//! Verwaltet die Peer Connections zum Remote Peer:
//! - höchstens einen Anruf (Media Connection, `mc_…`)
//! - höchstens eine Datenverbindung (`dc_…`), dient nur als Präsenz-Kanal
//!
//! Audio läuft als PCMU (G.711 µ-law, 8 kHz), damit Browser-Peers ohne
//! Opus-Bindings erreichbar sind.

use super::audio::{AudioHandler, CHANNELS, SAMPLE_RATE};
use super::codec;
use crate::broker::{random_token, ConnectionKind, IceCandidate};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Dauer eines Audio-Frames
const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Obergrenze an Frames pro Pump-Durchlauf, falls sich Capture-Audio staut
const MAX_FRAMES_PER_TICK: usize = 5;

/// Anzahl verworfener Connection IDs, deren späte Candidates ignoriert werden
const MAX_DISCARDED_IDS: usize = 32;

/// Obergrenze für Connection IDs mit gepufferten Candidates
const MAX_PENDING_CONNECTIONS: usize = 16;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallEngineError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Connection replaced during setup: {0}")]
    Superseded(String),

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),
}

impl From<webrtc::Error> for CallEngineError {
    fn from(e: webrtc::Error) -> Self {
        CallEngineError::WebRTC(e.to_string())
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Lokaler ICE Candidate, muss über den Broker zum Peer
    LocalCandidate {
        peer_id: String,
        connection_id: String,
        kind: ConnectionKind,
        candidate: IceCandidate,
    },
    /// Peer Connection des Anrufs ist verbunden
    CallOpened {
        peer_id: String,
        connection_id: String,
    },
    /// Audio vom Remote Peer kommt an
    RemoteStream {
        peer_id: String,
        connection_id: String,
    },
    CallClosed {
        peer_id: String,
        connection_id: String,
    },
    ConnectionOpened {
        peer_id: String,
        connection_id: String,
    },
    ConnectionClosed {
        peer_id: String,
        connection_id: String,
    },
}

/// Ergebnis einer lokalen Verhandlung (Offer)
#[derive(Debug, Clone)]
pub struct Negotiation {
    pub connection_id: String,
    pub sdp: String,
}

/// Snapshot des aktuellen Anrufs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallInfo {
    pub peer_id: String,
    pub connection_id: String,
    pub open: bool,
}

// ============================================================================
// CONNECTION
// ============================================================================

struct Connection {
    peer_id: String,
    connection_id: String,
    pc: Arc<RTCPeerConnection>,
    open: Arc<AtomicBool>,
    /// Remote Description gesetzt, Candidates dürfen direkt hinzugefügt werden
    remote_set: Arc<AtomicBool>,
    /// Aktueller Sende-Track (nur beim Anruf)
    track: Option<Arc<TrackLocalStaticSample>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        let pc = self.pc;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = pc.close().await;
                });
            }
            Err(_) => tracing::debug!("No runtime, dropping peer connection without close"),
        }
    }
}

type Slot = Arc<Mutex<Option<Connection>>>;

/// Remote Candidates, die vor der Remote Description ankommen
#[derive(Default)]
struct CandidateBuffer {
    pending: HashMap<String, Vec<RTCIceCandidateInit>>,
    /// Abgelehnte oder geschlossene Verbindungen, neueste hinten
    discarded: VecDeque<String>,
}

impl CandidateBuffer {
    fn push(&mut self, connection_id: &str, candidate: RTCIceCandidateInit) {
        if self.discarded.iter().any(|id| id == connection_id) {
            tracing::trace!("Dropping late candidate for {}", connection_id);
            return;
        }
        if !self.pending.contains_key(connection_id)
            && self.pending.len() >= MAX_PENDING_CONNECTIONS
        {
            tracing::warn!(
                "Too many pending connections, dropping candidate for {}",
                connection_id
            );
            return;
        }
        self.pending
            .entry(connection_id.to_string())
            .or_default()
            .push(candidate);
    }

    fn take(&mut self, connection_id: &str) -> Vec<RTCIceCandidateInit> {
        self.pending.remove(connection_id).unwrap_or_default()
    }

    /// Verwirft gepufferte und alle künftigen Candidates der Verbindung
    fn discard(&mut self, connection_id: &str) {
        self.pending.remove(connection_id);
        if self.discarded.iter().any(|id| id == connection_id) {
            return;
        }
        if self.discarded.len() >= MAX_DISCARDED_IDS {
            self.discarded.pop_front();
        }
        self.discarded.push_back(connection_id.to_string());
    }
}

/// Entfernt die Verbindung aus dem Slot, falls sie noch die aktuelle ist
fn take_if_current(slot: &Slot, connection_id: &str) -> Option<Connection> {
    let mut slot = slot.lock();
    if slot
        .as_ref()
        .map(|c| c.connection_id == connection_id)
        .unwrap_or(false)
    {
        slot.take()
    } else {
        None
    }
}

fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: SAMPLE_RATE,
        channels: CHANNELS,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// WebRTC Call Engine
pub struct CallEngine {
    call: Slot,
    data: Slot,
    candidates: Arc<Mutex<CandidateBuffer>>,
    audio: Arc<Mutex<AudioHandler>>,
    event_tx: broadcast::Sender<CallEvent>,
    ice_servers: Vec<RTCIceServer>,
}

impl CallEngine {
    /// Erstellt eine neue CallEngine
    pub fn new(ice_servers: Vec<RTCIceServer>, audio: Arc<Mutex<AudioHandler>>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            call: Arc::new(Mutex::new(None)),
            data: Arc::new(Mutex::new(None)),
            candidates: Arc::new(Mutex::new(CandidateBuffer::default())),
            audio,
            event_tx,
            ice_servers,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt es einen Anruf (auch einen noch nicht verbundenen)?
    pub fn has_call(&self) -> bool {
        self.call.lock().is_some()
    }

    /// Ist der aktuelle Anruf verbunden?
    pub fn is_call_open(&self) -> bool {
        self.call
            .lock()
            .as_ref()
            .map(|c| c.open.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn current_call(&self) -> Option<CallInfo> {
        self.call.lock().as_ref().map(|c| CallInfo {
            peer_id: c.peer_id.clone(),
            connection_id: c.connection_id.clone(),
            open: c.open.load(Ordering::SeqCst),
        })
    }

    /// Remote Peer der aktuellen Datenverbindung
    pub fn data_connection_peer(&self) -> Option<String> {
        self.data.lock().as_ref().map(|c| c.peer_id.clone())
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Ein bestehender Anruf wird vorher geschlossen. Gibt das SDP Offer zurück.
    pub async fn start_call(&self, peer_id: &str) -> Result<Negotiation, CallEngineError> {
        self.close_call();

        let connection_id = format!("mc_{}", random_token());
        let conn = self
            .create_peer_connection(peer_id, &connection_id, ConnectionKind::Media)
            .await?;
        let pc = Arc::clone(&conn.pc);
        self.install(ConnectionKind::Media, conn);

        let result = async {
            self.add_sending_track(&pc, &connection_id).await?;

            let offer = pc.create_offer(None).await?;
            pc.set_local_description(offer.clone()).await?;
            self.ensure_current(&self.call, &connection_id)?;
            Ok::<_, CallEngineError>(offer.sdp)
        }
        .await;

        match result {
            Ok(sdp) => {
                self.start_sender_pump(&connection_id);
                tracing::info!("Calling {} ({})", peer_id, connection_id);
                Ok(Negotiation { connection_id, sdp })
            }
            Err(e) => {
                if let Some(conn) = take_if_current(&self.call, &connection_id) {
                    conn.shutdown();
                }
                Err(e)
            }
        }
    }

    /// Nimmt einen eingehenden Anruf an
    ///
    /// `offer_sdp` ist das SDP Offer vom Anrufer.
    /// Gibt das SDP Answer zurück, das an den Anrufer gesendet werden muss.
    pub async fn accept_call(
        &self,
        peer_id: &str,
        connection_id: &str,
        offer_sdp: String,
    ) -> Result<String, CallEngineError> {
        self.close_call();

        let conn = self
            .create_peer_connection(peer_id, connection_id, ConnectionKind::Media)
            .await?;
        let pc = Arc::clone(&conn.pc);
        let remote_set = Arc::clone(&conn.remote_set);
        self.install(ConnectionKind::Media, conn);

        let result = async {
            let offer = RTCSessionDescription::offer(offer_sdp)
                .map_err(|e| CallEngineError::InvalidSdp(e.to_string()))?;
            pc.set_remote_description(offer).await?;
            self.flush_pending_candidates(&pc, connection_id, &remote_set)
                .await;

            self.add_sending_track(&pc, connection_id).await?;

            let answer = pc.create_answer(None).await?;
            pc.set_local_description(answer.clone()).await?;
            self.ensure_current(&self.call, connection_id)?;
            Ok::<_, CallEngineError>(answer.sdp)
        }
        .await;

        match result {
            Ok(sdp) => {
                self.start_sender_pump(connection_id);
                tracing::info!("Answered call from {} ({})", peer_id, connection_id);
                Ok(sdp)
            }
            Err(e) => {
                if let Some(conn) = take_if_current(&self.call, connection_id) {
                    conn.shutdown();
                }
                Err(e)
            }
        }
    }

    /// Öffnet eine Datenverbindung zum Peer
    ///
    /// Eine bestehende Datenverbindung wird vorher geschlossen.
    pub async fn open_data_connection(
        &self,
        peer_id: &str,
    ) -> Result<Negotiation, CallEngineError> {
        self.close_data_connection();

        let connection_id = format!("dc_{}", random_token());
        let conn = self
            .create_peer_connection(peer_id, &connection_id, ConnectionKind::Data)
            .await?;
        let pc = Arc::clone(&conn.pc);
        let open = Arc::clone(&conn.open);
        self.install(ConnectionKind::Data, conn);

        let result = async {
            // Wer das Offer macht, legt den Kanal an; Label = Connection ID
            let channel = pc
                .create_data_channel(
                    &connection_id,
                    Some(RTCDataChannelInit {
                        ordered: Some(true),
                        ..Default::default()
                    }),
                )
                .await?;
            self.attach_data_channel(&channel, peer_id, &connection_id, open);

            let offer = pc.create_offer(None).await?;
            pc.set_local_description(offer.clone()).await?;
            self.ensure_current(&self.data, &connection_id)?;
            Ok::<_, CallEngineError>(offer.sdp)
        }
        .await;

        match result {
            Ok(sdp) => {
                tracing::info!("Opening data connection to {} ({})", peer_id, connection_id);
                Ok(Negotiation { connection_id, sdp })
            }
            Err(e) => {
                if let Some(conn) = take_if_current(&self.data, &connection_id) {
                    conn.shutdown();
                }
                Err(e)
            }
        }
    }

    /// Nimmt eine eingehende Datenverbindung an, gibt das SDP Answer zurück
    pub async fn accept_data_connection(
        &self,
        peer_id: &str,
        connection_id: &str,
        offer_sdp: String,
    ) -> Result<String, CallEngineError> {
        self.close_data_connection();

        let conn = self
            .create_peer_connection(peer_id, connection_id, ConnectionKind::Data)
            .await?;
        let pc = Arc::clone(&conn.pc);
        let remote_set = Arc::clone(&conn.remote_set);
        let open = Arc::clone(&conn.open);
        self.install(ConnectionKind::Data, conn);

        // Der Kanal wird vom Anrufer angelegt
        let engine = self.handles();
        let peer = peer_id.to_string();
        let id = connection_id.to_string();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            engine.attach_data_channel(&channel, &peer, &id, Arc::clone(&open));
            Box::pin(async {})
        }));

        let result = async {
            let offer = RTCSessionDescription::offer(offer_sdp)
                .map_err(|e| CallEngineError::InvalidSdp(e.to_string()))?;
            pc.set_remote_description(offer).await?;
            self.flush_pending_candidates(&pc, connection_id, &remote_set)
                .await;

            let answer = pc.create_answer(None).await?;
            pc.set_local_description(answer.clone()).await?;
            self.ensure_current(&self.data, connection_id)?;
            Ok::<_, CallEngineError>(answer.sdp)
        }
        .await;

        if result.is_err() {
            if let Some(conn) = take_if_current(&self.data, connection_id) {
                conn.shutdown();
            }
        }
        result
    }

    /// Verwirft ein eingehendes Offer, ohne es zu beantworten
    pub fn reject(&self, connection_id: &str) {
        self.candidates.lock().discard(connection_id);
    }

    /// Verarbeitet das SDP Answer auf ein eigenes Offer
    pub async fn handle_answer(
        &self,
        connection_id: &str,
        answer_sdp: String,
    ) -> Result<(), CallEngineError> {
        let (pc, remote_set) = self
            .find_connection(connection_id)
            .ok_or_else(|| CallEngineError::UnknownConnection(connection_id.to_string()))?;

        let answer = RTCSessionDescription::answer(answer_sdp)
            .map_err(|e| CallEngineError::InvalidSdp(e.to_string()))?;

        pc.set_remote_description(answer).await?;
        self.flush_pending_candidates(&pc, connection_id, &remote_set)
            .await;

        Ok(())
    }

    /// Fügt einen Remote ICE Candidate hinzu
    ///
    /// Solange die Remote Description fehlt (oder die Verbindung noch nicht
    /// existiert), wird der Candidate gepuffert.
    pub async fn add_ice_candidate(
        &self,
        connection_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), CallEngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        let pc = {
            let found = self.find_connection(connection_id);
            let mut candidates = self.candidates.lock();
            match found {
                Some((pc, remote_set)) if remote_set.load(Ordering::SeqCst) => pc,
                _ => {
                    candidates.push(connection_id, init);
                    return Ok(());
                }
            }
        };

        pc.add_ice_candidate(init).await?;
        Ok(())
    }

    /// Ersetzt den Track auf dem ersten Sender des aktuellen Anrufs
    ///
    /// Gibt `true` zurück, wenn ein Anruf vorhanden war.
    pub async fn replace_sending_track(&self) -> Result<bool, CallEngineError> {
        let current = self
            .call
            .lock()
            .as_ref()
            .map(|c| (Arc::clone(&c.pc), c.connection_id.clone()));
        let (pc, connection_id) = match current {
            Some(current) => current,
            None => return Ok(false),
        };

        let senders = pc.get_senders().await;
        let sender = match senders.first() {
            Some(sender) => Arc::clone(sender),
            None => return Ok(false),
        };

        let track = Self::new_sending_track();
        sender
            .replace_track(Some(
                Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>
            ))
            .await?;
        self.set_track(&connection_id, track);

        tracing::debug!("Replaced sending track on current call");
        Ok(true)
    }

    /// Beendet den aktuellen Anruf
    pub fn close_call(&self) {
        let conn = self.call.lock().take();
        if let Some(conn) = conn {
            self.retire(ConnectionKind::Media, conn);
        }
    }

    /// Schließt die aktuelle Datenverbindung
    pub fn close_data_connection(&self) {
        let conn = self.data.lock().take();
        if let Some(conn) = conn {
            self.retire(ConnectionKind::Data, conn);
        }
    }

    /// Schließt alle Verbindungen zu einem Peer
    pub fn close_peer(&self, peer_id: &str) {
        let call_peer = self.call.lock().as_ref().map(|c| c.peer_id == peer_id);
        if call_peer == Some(true) {
            self.close_call();
        }
        let data_peer = self.data.lock().as_ref().map(|c| c.peer_id == peer_id);
        if data_peer == Some(true) {
            self.close_data_connection();
        }
    }

    /// Markiert den aktuellen Anruf als verbunden, ohne ICE abzuwarten
    #[cfg(test)]
    pub(crate) fn mark_call_open(&self) {
        if let Some(conn) = self.call.lock().as_ref() {
            conn.open.store(true, Ordering::SeqCst);
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Leichtgewichtige Kopie der geteilten Teile für Callbacks
    fn handles(&self) -> EngineHandles {
        EngineHandles {
            data: Arc::clone(&self.data),
            event_tx: self.event_tx.clone(),
        }
    }

    fn slot(&self, kind: ConnectionKind) -> &Slot {
        match kind {
            ConnectionKind::Media => &self.call,
            ConnectionKind::Data => &self.data,
        }
    }

    /// Setzt die Verbindung in ihren Slot und schließt die bisherige
    fn install(&self, kind: ConnectionKind, conn: Connection) {
        let previous = std::mem::replace(&mut *self.slot(kind).lock(), Some(conn));
        if let Some(previous) = previous {
            self.retire(kind, previous);
        }
    }

    /// Schließt eine aus dem Slot entfernte Verbindung und meldet das
    fn retire(&self, kind: ConnectionKind, conn: Connection) {
        self.candidates.lock().discard(&conn.connection_id);
        let peer_id = conn.peer_id.clone();
        let connection_id = conn.connection_id.clone();
        let event = match kind {
            ConnectionKind::Media => {
                tracing::info!("Closing call with {} ({})", peer_id, connection_id);
                CallEvent::CallClosed {
                    peer_id,
                    connection_id,
                }
            }
            ConnectionKind::Data => {
                tracing::info!("Closing data connection with {} ({})", peer_id, connection_id);
                CallEvent::ConnectionClosed {
                    peer_id,
                    connection_id,
                }
            }
        };
        conn.shutdown();
        let _ = self.event_tx.send(event);
    }

    /// Fehler, falls die Verbindung inzwischen ersetzt wurde
    fn ensure_current(&self, slot: &Slot, connection_id: &str) -> Result<(), CallEngineError> {
        let current = slot
            .lock()
            .as_ref()
            .map(|c| c.connection_id == connection_id)
            .unwrap_or(false);
        if current {
            Ok(())
        } else {
            Err(CallEngineError::Superseded(connection_id.to_string()))
        }
    }

    fn set_track(&self, connection_id: &str, track: Arc<TrackLocalStaticSample>) {
        let mut slot = self.call.lock();
        if let Some(conn) = slot.as_mut() {
            if conn.connection_id == connection_id {
                conn.track = Some(track);
            }
        }
    }

    fn find_connection(
        &self,
        connection_id: &str,
    ) -> Option<(Arc<RTCPeerConnection>, Arc<AtomicBool>)> {
        for slot in [&self.call, &self.data] {
            let slot = slot.lock();
            if let Some(conn) = slot.as_ref() {
                if conn.connection_id == connection_id {
                    return Some((Arc::clone(&conn.pc), Arc::clone(&conn.remote_set)));
                }
            }
        }
        None
    }

    /// Fügt gepufferte Candidates hinzu, nachdem die Remote Description gesetzt ist
    async fn flush_pending_candidates(
        &self,
        pc: &Arc<RTCPeerConnection>,
        connection_id: &str,
        remote_set: &Arc<AtomicBool>,
    ) {
        let pending = {
            let mut candidates = self.candidates.lock();
            remote_set.store(true, Ordering::SeqCst);
            candidates.take(connection_id)
        };

        for candidate in pending {
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add buffered ICE candidate: {}", e);
            }
        }
    }

    fn new_sending_track() -> Arc<TrackLocalStaticSample> {
        Arc::new(TrackLocalStaticSample::new(
            pcmu_capability(),
            "audio".to_string(),
            "peercall".to_string(),
        ))
    }

    /// Hängt einen neuen Sende-Track an die Peer Connection
    async fn add_sending_track(
        &self,
        pc: &Arc<RTCPeerConnection>,
        connection_id: &str,
    ) -> Result<(), CallEngineError> {
        let track = Self::new_sending_track();
        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        self.set_track(connection_id, track);

        // RTCP lesen, sonst laufen die Interceptors nicht
        let handle = tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        self.attach_task(connection_id, handle);
        Ok(())
    }

    /// Schickt alle 20ms die aufgenommenen Frames auf den aktuellen Track
    fn start_sender_pump(&self, connection_id: &str) {
        let audio = Arc::clone(&self.audio);
        let call = Arc::clone(&self.call);
        let id = connection_id.to_string();
        audio.lock().clear_capture();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(FRAME_DURATION);
            loop {
                interval.tick().await;

                let frames: Vec<Vec<f32>> = {
                    let audio = audio.lock();
                    std::iter::from_fn(|| audio.read_frame())
                        .take(MAX_FRAMES_PER_TICK)
                        .collect()
                };

                let track = call
                    .lock()
                    .as_ref()
                    .filter(|c| c.connection_id == id)
                    .and_then(|c| c.track.clone());
                let track = match track {
                    Some(track) => track,
                    None => continue,
                };

                for frame in frames {
                    let sample = Sample {
                        data: Bytes::from(codec::encode_frame(&frame)),
                        duration: FRAME_DURATION,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        tracing::debug!("Failed to write audio sample: {}", e);
                    }
                }
            }
        });
        self.attach_task(connection_id, handle);
    }

    /// Ordnet einen Task der Verbindung zu, damit er beim Schließen endet
    fn attach_task(&self, connection_id: &str, handle: JoinHandle<()>) {
        for slot in [&self.call, &self.data] {
            let mut slot = slot.lock();
            if let Some(conn) = slot.as_mut() {
                if conn.connection_id == connection_id {
                    conn.tasks.push(handle);
                    return;
                }
            }
        }
        handle.abort();
    }

    fn attach_data_channel(
        &self,
        channel: &Arc<RTCDataChannel>,
        peer_id: &str,
        connection_id: &str,
        open: Arc<AtomicBool>,
    ) {
        self.handles()
            .attach_data_channel(channel, peer_id, connection_id, open);
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(
        &self,
        peer_id: &str,
        connection_id: &str,
        kind: ConnectionKind,
    ) -> Result<Connection, CallEngineError> {
        // Nur PCMU anbieten, damit der Remote Peer nichts anderes wählt
        let mut media_engine = MediaEngine::default();
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: pcmu_capability(),
                payload_type: 0,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        let open = Arc::new(AtomicBool::new(false));

        self.setup_peer_connection_handlers(&pc, peer_id, connection_id, kind, &open);

        Ok(Connection {
            peer_id: peer_id.to_string(),
            connection_id: connection_id.to_string(),
            pc,
            open,
            remote_set: Arc::new(AtomicBool::new(false)),
            track: None,
            tasks: Vec::new(),
        })
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_peer_connection_handlers(
        &self,
        pc: &Arc<RTCPeerConnection>,
        peer_id: &str,
        connection_id: &str,
        kind: ConnectionKind,
        open: &Arc<AtomicBool>,
    ) {
        // ICE Candidate Handler
        let event_tx = self.event_tx.clone();
        let peer = peer_id.to_string();
        let id = connection_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = event_tx.send(CallEvent::LocalCandidate {
                            peer_id: peer.clone(),
                            connection_id: id.clone(),
                            kind,
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            },
                        });
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Connection State Handler
        let slot = Arc::clone(self.slot(kind));
        let candidates = Arc::clone(&self.candidates);
        let event_tx = self.event_tx.clone();
        let open_flag = Arc::clone(open);
        let peer = peer_id.to_string();
        let id = connection_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection {} state: {:?}", id, s);

            match s {
                RTCPeerConnectionState::Connected if kind == ConnectionKind::Media => {
                    open_flag.store(true, Ordering::SeqCst);
                    let _ = event_tx.send(CallEvent::CallOpened {
                        peer_id: peer.clone(),
                        connection_id: id.clone(),
                    });
                }
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                    open_flag.store(false, Ordering::SeqCst);
                    if let Some(conn) = take_if_current(&slot, &id) {
                        candidates.lock().discard(&id);
                        let event = match kind {
                            ConnectionKind::Media => CallEvent::CallClosed {
                                peer_id: peer.clone(),
                                connection_id: id.clone(),
                            },
                            ConnectionKind::Data => CallEvent::ConnectionClosed {
                                peer_id: peer.clone(),
                                connection_id: id.clone(),
                            },
                        };
                        conn.shutdown();
                        let _ = event_tx.send(event);
                    }
                }
                RTCPeerConnectionState::Disconnected => {
                    tracing::warn!("Peer connection {} disconnected", id);
                }
                _ => {}
            }

            Box::pin(async {})
        }));

        if kind != ConnectionKind::Media {
            return;
        }

        // Track Handler (für eingehendes Audio)
        let audio = Arc::clone(&self.audio);
        let event_tx = self.event_tx.clone();
        let peer = peer_id.to_string();
        let id = connection_id.to_string();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            tracing::info!(
                "Received track from {}: {}",
                peer,
                track.codec().capability.mime_type
            );
            let _ = event_tx.send(CallEvent::RemoteStream {
                peer_id: peer.clone(),
                connection_id: id.clone(),
            });

            let audio = Arc::clone(&audio);
            tokio::spawn(async move {
                while let Ok((packet, _)) = track.read_rtp().await {
                    let samples = codec::decode_frame(&packet.payload);
                    audio.lock().write_samples(&samples);
                }
                tracing::debug!("Remote track ended");
            });

            Box::pin(async {})
        }));
    }
}

/// Teile der Engine, die in Callbacks von webrtc gebraucht werden
#[derive(Clone)]
struct EngineHandles {
    data: Slot,
    event_tx: broadcast::Sender<CallEvent>,
}

impl EngineHandles {
    fn attach_data_channel(
        &self,
        channel: &Arc<RTCDataChannel>,
        peer_id: &str,
        connection_id: &str,
        open: Arc<AtomicBool>,
    ) {
        let event_tx = self.event_tx.clone();
        let peer = peer_id.to_string();
        let id = connection_id.to_string();
        channel.on_open(Box::new(move || {
            tracing::info!("Data connection {} to {} open", id, peer);
            open.store(true, Ordering::SeqCst);
            let _ = event_tx.send(CallEvent::ConnectionOpened {
                peer_id: peer.clone(),
                connection_id: id.clone(),
            });
            Box::pin(async {})
        }));

        let slot = Arc::clone(&self.data);
        let event_tx = self.event_tx.clone();
        let peer = peer_id.to_string();
        let id = connection_id.to_string();
        channel.on_close(Box::new(move || {
            tracing::info!("Data connection {} closed", id);
            if let Some(conn) = take_if_current(&slot, &id) {
                conn.shutdown();
                let _ = event_tx.send(CallEvent::ConnectionClosed {
                    peer_id: peer.clone(),
                    connection_id: id.clone(),
                });
            }
            Box::pin(async {})
        }));

        // Die Verbindung trägt keine Nutzdaten
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            tracing::debug!("Ignoring {} bytes on data connection", msg.data.len());
            Box::pin(async {})
        }));
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("call", &self.current_call())
            .field("data_peer", &self.data_connection_peer())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CallEngine {
        CallEngine::new(Vec::new(), Arc::new(Mutex::new(AudioHandler::new())))
    }

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 127.0.0.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_start_call_offers_only_pcmu() {
        let engine = engine();
        let offer = engine.start_call("remote").await.unwrap();

        assert!(offer.connection_id.starts_with("mc_"));
        assert!(offer.sdp.contains("PCMU/8000"));
        assert!(!offer.sdp.to_lowercase().contains("opus"));
        assert!(engine.has_call());
        assert!(!engine.is_call_open());

        engine.close_call();
    }

    #[tokio::test]
    async fn test_data_connection_offer() {
        let engine = engine();
        let offer = engine.open_data_connection("remote").await.unwrap();

        assert!(offer.connection_id.starts_with("dc_"));
        assert!(offer.sdp.contains("webrtc-datachannel"));
        assert_eq!(engine.data_connection_peer().as_deref(), Some("remote"));
        assert!(!engine.has_call());

        engine.close_data_connection();
        assert!(engine.data_connection_peer().is_none());
    }

    #[tokio::test]
    async fn test_second_call_replaces_first() {
        let engine = engine();
        let mut events = engine.subscribe();

        let first = engine.start_call("alice").await.unwrap();
        let second = engine.start_call("bob").await.unwrap();

        let call = engine.current_call().unwrap();
        assert_eq!(call.peer_id, "bob");
        assert_eq!(call.connection_id, second.connection_id);

        // Der erste Anruf wurde geschlossen
        loop {
            if let CallEvent::CallClosed { connection_id, .. } = events.recv().await.unwrap() {
                assert_eq!(connection_id, first.connection_id);
                break;
            }
        }

        engine.close_call();
    }

    #[tokio::test]
    async fn test_offer_answer_between_engines() {
        let caller = engine();
        let callee = engine();

        let offer = caller.start_call("callee").await.unwrap();
        let answer = callee
            .accept_call("caller", &offer.connection_id, offer.sdp)
            .await
            .unwrap();
        assert!(answer.contains("PCMU/8000"));

        caller
            .handle_answer(&offer.connection_id, answer)
            .await
            .unwrap();

        assert_eq!(
            callee.current_call().map(|c| c.connection_id),
            Some(offer.connection_id)
        );

        caller.close_call();
        callee.close_call();
    }

    #[tokio::test]
    async fn test_candidates_for_unknown_connection_are_buffered() {
        let engine = engine();
        engine
            .add_ice_candidate("mc_unknown", candidate())
            .await
            .unwrap();

        assert_eq!(
            engine
                .candidates
                .lock()
                .pending
                .get("mc_unknown")
                .map(Vec::len),
            Some(1)
        );

        engine.reject("mc_unknown");
        assert!(engine.candidates.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn test_late_candidates_after_reject_are_dropped() {
        let engine = engine();
        engine.reject("mc_rejected");

        for _ in 0..3 {
            engine
                .add_ice_candidate("mc_rejected", candidate())
                .await
                .unwrap();
        }

        assert!(engine.candidates.lock().pending.is_empty());
    }

    #[tokio::test]
    async fn test_late_candidates_after_close_are_dropped() {
        let engine = engine();
        let offer = engine.start_call("remote").await.unwrap();
        engine.close_call();

        engine
            .add_ice_candidate(&offer.connection_id, candidate())
            .await
            .unwrap();

        assert!(engine.candidates.lock().pending.is_empty());
    }

    #[test]
    fn test_candidate_buffer_is_bounded() {
        let mut buffer = CandidateBuffer::default();
        for i in 0..MAX_DISCARDED_IDS + 5 {
            buffer.discard(&format!("mc_{}", i));
        }
        assert_eq!(buffer.discarded.len(), MAX_DISCARDED_IDS);
        assert_eq!(buffer.discarded.front().map(String::as_str), Some("mc_5"));

        for i in 0..MAX_PENDING_CONNECTIONS + 3 {
            buffer.push(
                &format!("dc_{}", i),
                RTCIceCandidateInit {
                    candidate: "candidate:1".to_string(),
                    ..Default::default()
                },
            );
        }
        assert_eq!(buffer.pending.len(), MAX_PENDING_CONNECTIONS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_setup_keeps_one_call() {
        let remote = engine();
        let engine = Arc::new(engine());
        let mut events = engine.subscribe();

        let offer = remote.start_call("local").await.unwrap();
        let incoming_id = offer.connection_id.clone();
        let offer_sdp = offer.sdp;

        let outgoing = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.start_call("alice").await })
        };
        let incoming = {
            let engine = Arc::clone(&engine);
            let id = incoming_id.clone();
            tokio::spawn(async move { engine.accept_call("remote", &id, offer_sdp).await })
        };

        let outgoing_id = match outgoing.await.unwrap() {
            Ok(negotiation) => negotiation.connection_id,
            Err(CallEngineError::Superseded(id)) => id,
            Err(e) => panic!("unexpected error: {}", e),
        };
        match incoming.await.unwrap() {
            Ok(_) | Err(CallEngineError::Superseded(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }

        // Genau eine der beiden Verbindungen bleibt übrig
        let current = engine.current_call().unwrap().connection_id;
        let replaced = if current == outgoing_id {
            incoming_id
        } else {
            assert_eq!(current, incoming_id);
            outgoing_id
        };

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let CallEvent::CallClosed { connection_id, .. } = events.recv().await.unwrap() {
                    if connection_id == replaced {
                        break;
                    }
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "no CallClosed for {}", replaced);

        engine.close_call();
        remote.close_call();
    }

    #[tokio::test]
    async fn test_answer_for_unknown_connection() {
        let engine = engine();
        let result = engine.handle_answer("mc_nope", "v=0".to_string()).await;
        assert!(matches!(result, Err(CallEngineError::UnknownConnection(_))));
    }

    #[tokio::test]
    async fn test_replace_track_without_call() {
        let engine = engine();
        assert!(!engine.replace_sending_track().await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_track_on_call() {
        let engine = engine();
        engine.start_call("remote").await.unwrap();
        assert!(engine.replace_sending_track().await.unwrap());
        engine.close_call();
    }

    #[tokio::test]
    async fn test_close_peer_only_closes_matching() {
        let engine = engine();
        engine.start_call("alice").await.unwrap();
        engine.open_data_connection("bob").await.unwrap();

        engine.close_peer("bob");
        assert!(engine.has_call());
        assert!(engine.data_connection_peer().is_none());

        engine.close_peer("alice");
        assert!(!engine.has_call());
    }
}
