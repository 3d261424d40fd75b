//! Session Module - Steuerung eines Anrufs
//!
//! - `link`: Verbindungslinks mit der Peer ID im Fragment
//! - `state`: Zustand und reine Entscheidungen (annehmen, ablehnen, wählen)
//! - `controller`: führt die Entscheidungen mit Broker, WebRTC und Audio aus

mod controller;
mod link;
mod state;

pub use controller::{
    CallController, LocalPeerInfo, SessionError, SessionEvent, CLOSE_GUARD_MESSAGE,
};
pub use link::{connection_link, peer_id_from_fragment};
pub use state::{admit, Admission, FragmentAction, SessionState};
