//! Broker Module - PeerJS-kompatibles Signaling
//!
//! Der Broker vermittelt nur Offer, Answer und ICE Candidates zwischen
//! Peers. Audio läuft danach direkt über WebRTC.

mod client;
mod messages;

pub use client::{random_token, BrokerClient, BrokerError, BrokerEvent};
pub use messages::*;
