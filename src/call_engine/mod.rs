//! Call Engine Module - WebRTC und Audio
//!
//! Dieses Modul verwaltet:
//! - WebRTC Peer Connections (Anruf und Datenverbindung)
//! - Audio Capture (Mikrofon) und Playback (Lautsprecher)
//! - G.711 µ-law Encoding/Decoding

mod audio;
mod codec;
mod engine;

pub use audio::{
    validate_volume, AudioDevice, AudioError, AudioHandler, ChannelGain, DeviceList,
    DEFAULT_DEVICE_ID, FRAME_SIZE, SAMPLE_RATE,
};
pub use engine::{CallEngine, CallEngineError, CallEvent, CallInfo, Negotiation};
