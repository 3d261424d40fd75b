//! Message Types für das PeerJS Broker-Protokoll
//!
//! Die Feldnamen folgen dem PeerJS-Server (`connectionId`, `sdpMLineIndex`, ...),
//! damit Browser-Peers mit der PeerJS-Bibliothek direkt erreichbar sind.

use serde::{Deserialize, Serialize};

// ============================================================================
// PAYLOAD TYPES
// ============================================================================

/// Art der Verbindung innerhalb eines Peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Media,
    Data,
}

/// SDP wie `RTCSessionDescriptionInit` im Browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            sdp_type: "offer".to_string(),
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            sdp_type: "answer".to_string(),
            sdp,
        }
    }
}

/// ICE Candidate wie `RTCIceCandidateInit` im Browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPayload {
    pub sdp: SessionDescription,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

impl OfferPayload {
    /// Offer für einen Audio-Anruf
    pub fn media(connection_id: String, sdp: String) -> Self {
        Self {
            sdp: SessionDescription::offer(sdp),
            kind: ConnectionKind::Media,
            connection_id,
            metadata: None,
            label: None,
            reliable: None,
            serialization: None,
            browser: Some(BROWSER_NAME.to_string()),
        }
    }

    /// Offer für eine Datenverbindung, das Label ist die Connection ID
    pub fn data(connection_id: String, sdp: String) -> Self {
        Self {
            sdp: SessionDescription::offer(sdp),
            kind: ConnectionKind::Data,
            label: Some(connection_id.clone()),
            connection_id,
            metadata: None,
            reliable: Some(true),
            serialization: Some("json".to_string()),
            browser: Some(BROWSER_NAME.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub sdp: SessionDescription,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
}

impl AnswerPayload {
    pub fn new(kind: ConnectionKind, connection_id: String, sdp: String) -> Self {
        Self {
            sdp: SessionDescription::answer(sdp),
            kind,
            connection_id,
            browser: Some(BROWSER_NAME.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
}

/// Fehlertext in `ERROR`, `ID-TAKEN` und `INVALID-KEY`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub msg: String,
}

/// Wird als `browser` mitgeschickt
pub const BROWSER_NAME: &str = "peercall";

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Broker-Nachrichten
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Peer ID wurde akzeptiert
    #[serde(rename = "OPEN")]
    Open,

    #[serde(rename = "ERROR")]
    Error {
        #[serde(default)]
        payload: ErrorPayload,
    },

    /// Peer ID ist bereits vergeben
    #[serde(rename = "ID-TAKEN")]
    IdTaken {
        #[serde(default)]
        payload: ErrorPayload,
    },

    #[serde(rename = "INVALID-KEY")]
    InvalidKey {
        #[serde(default)]
        payload: ErrorPayload,
    },

    /// Remote Peer hat den Broker verlassen
    #[serde(rename = "LEAVE")]
    Leave { src: String },

    /// Nachricht konnte nicht zugestellt werden
    #[serde(rename = "EXPIRE")]
    Expire { src: String },

    #[serde(rename = "OFFER")]
    Offer { src: String, payload: OfferPayload },

    #[serde(rename = "ANSWER")]
    Answer { src: String, payload: AnswerPayload },

    #[serde(rename = "CANDIDATE")]
    Candidate {
        src: String,
        payload: CandidatePayload,
    },

    /// Echo auf unseren Heartbeat (nur manche Server)
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,

    #[serde(rename = "OFFER")]
    Offer { dst: String, payload: OfferPayload },

    #[serde(rename = "ANSWER")]
    Answer { dst: String, payload: AnswerPayload },

    #[serde(rename = "CANDIDATE")]
    Candidate {
        dst: String,
        payload: CandidatePayload,
    },

    #[serde(rename = "LEAVE")]
    Leave { dst: String },
}

// ============================================================================
// TESTS
// ============================================================================
