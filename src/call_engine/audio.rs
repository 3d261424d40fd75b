//! Audio Handler - Mikrofon Capture, Loopback und Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Intern läuft alles mit
//! 8 kHz Mono (PCMU), gemischt und resampled wird in den cpal-Callbacks.

use super::codec::{self, LinearResampler};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate der Pipeline (PCMU)
pub const SAMPLE_RATE: u32 = 8000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 8kHz = 160 samples)
pub const FRAME_SIZE: usize = 160;

/// Bevorzugte Geräte-Rate
const DEVICE_SAMPLE_RATE: u32 = 48000;

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

/// Geräte-ID für das Standardgerät des Hosts
pub const DEFAULT_DEVICE_ID: &str = "default";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to enumerate audio devices: {0}")]
    Enumeration(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Volume must be between 0.0 and 1.0, got {0}")]
    InvalidVolume(f32),
}

// ============================================================================
// DEVICES
// ============================================================================

/// Repräsentiert ein Audio-Gerät
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AudioDevice {
    pub id: String,
    pub label: String,
    pub is_default: bool,
}

/// Alle Ein- und Ausgabegeräte
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceList {
    pub inputs: Vec<AudioDevice>,
    pub outputs: Vec<AudioDevice>,
}

/// Prüft eine Lautstärke wie `HTMLMediaElement.volume`
pub fn validate_volume(volume: f32) -> Result<f32, AudioError> {
    if volume.is_finite() && (0.0..=1.0).contains(&volume) {
        Ok(volume)
    } else {
        Err(AudioError::InvalidVolume(volume))
    }
}

/// Lautstärke und Mute eines Kanals im Mixer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelGain {
    pub volume: f32,
    pub muted: bool,
}

impl ChannelGain {
    fn factor(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }
}

/// Mischt empfangenes Audio und Loopback zu einem Ausgabe-Sample
pub fn mix_sample(
    remote: f32,
    remote_gain: ChannelGain,
    loopback: f32,
    loopback_gain: ChannelGain,
) -> f32 {
    (remote * remote_gain.factor() + loopback * loopback_gain.factor()).clamp(-1.0, 1.0)
}

// ============================================================================
// AUDIO HANDLER
// ============================================================================

/// Handler für Audio Input/Output
///
/// Note: Stream ist nicht Send, daher wrappen wir in Send-fähige Container
pub struct AudioHandler {
    input_device_id: Option<String>,
    output_device_id: Option<String>,
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,

    /// Ring-Buffer für aufgenommenes Audio, geht an den Remote Peer
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Ring-Buffer für das eigene Mikrofon (Loopback)
    loopback_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Ring-Buffer für empfangenes Audio
    playback_buffer: Arc<Mutex<HeapRb<f32>>>,

    is_sending_muted: Arc<Mutex<bool>>,
    receiving: Arc<Mutex<ChannelGain>>,
    loopback: Arc<Mutex<ChannelGain>>,

    /// Audio Level (0.0 - 1.0) für Visualisierung
    input_level: Arc<Mutex<f32>>,
    output_level: Arc<Mutex<f32>>,
}

// AudioHandler ist nicht automatisch Send wegen Stream
// Wir müssen die Streams daher separat verwalten
unsafe impl Send for AudioHandler {}

impl AudioHandler {
    /// Erstellt einen neuen AudioHandler ohne offene Streams
    pub fn new() -> Self {
        tracing::info!(
            "AudioHandler initialized: {}Hz, {} channel(s)",
            SAMPLE_RATE,
            CHANNELS
        );

        Self {
            input_device_id: None,
            output_device_id: None,
            input_stream: None,
            output_stream: None,
            capture_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            loopback_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            playback_buffer: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            is_sending_muted: Arc::new(Mutex::new(false)),
            receiving: Arc::new(Mutex::new(ChannelGain {
                volume: 1.0,
                muted: false,
            })),
            // Loopback ist stumm, bis der Regler bewegt wird
            loopback: Arc::new(Mutex::new(ChannelGain {
                volume: 1.0,
                muted: true,
            })),
            input_level: Arc::new(Mutex::new(0.0)),
            output_level: Arc::new(Mutex::new(0.0)),
        }
    }

    /// Listet alle Ein- und Ausgabegeräte auf
    pub fn list_devices() -> Result<DeviceList, AudioError> {
        let host = cpal::default_host();

        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let inputs = host
            .input_devices()
            .map_err(|e| AudioError::Enumeration(e.to_string()))?
            .filter_map(|d| {
                d.name().ok().map(|name| AudioDevice {
                    is_default: Some(&name) == default_input.as_ref(),
                    id: name.clone(),
                    label: name,
                })
            })
            .collect();

        let outputs = host
            .output_devices()
            .map_err(|e| AudioError::Enumeration(e.to_string()))?
            .filter_map(|d| {
                d.name().ok().map(|name| AudioDevice {
                    is_default: Some(&name) == default_output.as_ref(),
                    id: name.clone(),
                    label: name,
                })
            })
            .collect();

        Ok(DeviceList { inputs, outputs })
    }

    /// Startet Audio Capture (Mikrofon), ein laufender Stream wird ersetzt
    pub fn start_capture(&mut self, device_id: Option<&str>) -> Result<(), AudioError> {
        let host = cpal::default_host();
        let device = Self::find_input_device(&host, device_id)?;

        let config = Self::find_best_input_config(&device)?;

        tracing::info!(
            "Starting audio capture on {:?}: {} Hz, {} channels",
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::clone(&self.capture_buffer);
        let loopback_buffer = Arc::clone(&self.loopback_buffer);
        let is_muted = Arc::clone(&self.is_sending_muted);
        let input_level = Arc::clone(&self.input_level);
        let channels = config.channels as usize;
        let mut resampler = LinearResampler::new(config.sample_rate.0, SAMPLE_RATE);
        let mut mono_8k = Vec::with_capacity(FRAME_SIZE * 4);

        // Alten Stream zuerst schließen, manche Backends erlauben nur einen
        self.input_stream = None;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = codec::downmix(data, channels);
                    *input_level.lock() = codec::rms_level(&mono);

                    // Stumm geschaltet: weder senden noch Loopback
                    if *is_muted.lock() {
                        return;
                    }

                    mono_8k.clear();
                    resampler.push(&mono, |s| mono_8k.push(s));

                    {
                        let mut buffer = capture_buffer.lock();
                        for sample in &mono_8k {
                            let _ = buffer.try_push(*sample);
                        }
                    }
                    let mut buffer = loopback_buffer.lock();
                    for sample in &mono_8k {
                        let _ = buffer.try_push(*sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        self.input_stream = Some(stream);
        self.input_device_id = device_id.map(str::to_string);
        Ok(())
    }

    /// Startet Audio Playback (Lautsprecher), ein laufender Stream wird ersetzt
    ///
    /// Empfangenes Audio und Loopback teilen sich dasselbe Ausgabegerät.
    pub fn start_playback(&mut self, device_id: Option<&str>) -> Result<(), AudioError> {
        let host = cpal::default_host();
        let device = Self::find_output_device(&host, device_id)?;

        let config = Self::find_best_output_config(&device)?;

        tracing::info!(
            "Starting audio playback on {:?}: {} Hz, {} channels",
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            config.channels
        );

        let playback_buffer = Arc::clone(&self.playback_buffer);
        let loopback_buffer = Arc::clone(&self.loopback_buffer);
        let receiving = Arc::clone(&self.receiving);
        let loopback = Arc::clone(&self.loopback);
        let output_level = Arc::clone(&self.output_level);
        let channels = config.channels as usize;
        let mut remote_resampler = LinearResampler::new(SAMPLE_RATE, config.sample_rate.0);
        let mut loopback_resampler = LinearResampler::new(SAMPLE_RATE, config.sample_rate.0);

        self.output_stream = None;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let remote_gain = *receiving.lock();
                    let loopback_gain = *loopback.lock();
                    let mut remote_buffer = playback_buffer.lock();
                    let mut local_buffer = loopback_buffer.lock();
                    let mut level_sum = 0.0f32;
                    let mut sample_count = 0;

                    for frame in data.chunks_mut(channels.max(1)) {
                        let remote =
                            remote_resampler.pull(|| remote_buffer.try_pop().unwrap_or(0.0));
                        let local =
                            loopback_resampler.pull(|| local_buffer.try_pop().unwrap_or(0.0));
                        let sample = mix_sample(remote, remote_gain, local, loopback_gain);

                        level_sum += sample.abs();
                        sample_count += 1;

                        // Auf alle Kanäle verteilen
                        for s in frame.iter_mut() {
                            *s = sample;
                        }
                    }

                    if sample_count > 0 {
                        *output_level.lock() = (level_sum / sample_count as f32).min(1.0);
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        self.output_stream = Some(stream);
        self.output_device_id = device_id.map(str::to_string);
        Ok(())
    }

    /// Stoppt alle Audio-Streams
    pub fn stop(&mut self) {
        self.input_stream = None;
        self.output_stream = None;
        tracing::info!("Audio streams stopped");
    }

    /// Liest einen Frame von aufgenommenem Audio
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() >= FRAME_SIZE {
            let mut frame = Vec::with_capacity(FRAME_SIZE);
            for _ in 0..FRAME_SIZE {
                if let Some(sample) = buffer.try_pop() {
                    frame.push(sample);
                }
            }
            Some(frame)
        } else {
            None
        }
    }

    /// Verwirft aufgelaufenes Capture-Audio (z.B. vor einem neuen Anruf)
    pub fn clear_capture(&self) {
        let mut buffer = self.capture_buffer.lock();
        while buffer.try_pop().is_some() {}
    }

    /// Schreibt empfangene Samples in den Playback-Buffer
    pub fn write_samples(&self, samples: &[f32]) {
        let mut buffer = self.playback_buffer.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    /// Setzt den Mute-Status für das gesendete Audio
    pub fn set_sending_muted(&self, muted: bool) {
        *self.is_sending_muted.lock() = muted;
        tracing::debug!("Sending muted: {}", muted);
    }

    pub fn is_sending_muted(&self) -> bool {
        *self.is_sending_muted.lock()
    }

    pub fn set_receiving_muted(&self, muted: bool) {
        self.receiving.lock().muted = muted;
        tracing::debug!("Receiving muted: {}", muted);
    }

    /// Setzt die Empfangs-Lautstärke und hebt die Stummschaltung auf
    pub fn set_receiving_volume(&self, volume: f32) -> Result<(), AudioError> {
        let volume = validate_volume(volume)?;
        *self.receiving.lock() = ChannelGain {
            volume,
            muted: false,
        };
        Ok(())
    }

    /// Setzt die Loopback-Lautstärke und hebt die Stummschaltung auf
    pub fn set_loopback_volume(&self, volume: f32) -> Result<(), AudioError> {
        let volume = validate_volume(volume)?;
        *self.loopback.lock() = ChannelGain {
            volume,
            muted: false,
        };
        Ok(())
    }

    pub fn receiving_gain(&self) -> ChannelGain {
        *self.receiving.lock()
    }

    pub fn loopback_gain(&self) -> ChannelGain {
        *self.loopback.lock()
    }

    /// Gibt die Audio-Levels zurück (input, output)
    pub fn get_levels(&self) -> (f32, f32) {
        (*self.input_level.lock(), *self.output_level.lock())
    }

    fn find_input_device(host: &Host, device_id: Option<&str>) -> Result<Device, AudioError> {
        match device_id {
            None | Some(DEFAULT_DEVICE_ID) | Some("") => {
                host.default_input_device().ok_or(AudioError::NoInputDevice)
            }
            Some(id) => host
                .input_devices()
                .map_err(|e| AudioError::Enumeration(e.to_string()))?
                .find(|d| d.name().map(|name| name == id).unwrap_or(false))
                .ok_or_else(|| AudioError::DeviceNotFound(id.to_string())),
        }
    }

    fn find_output_device(host: &Host, device_id: Option<&str>) -> Result<Device, AudioError> {
        match device_id {
            None | Some(DEFAULT_DEVICE_ID) | Some("") => {
                host.default_output_device().ok_or(AudioError::NoOutputDevice)
            }
            Some(id) => host
                .output_devices()
                .map_err(|e| AudioError::Enumeration(e.to_string()))?
                .find(|d| d.name().map(|name| name == id).unwrap_or(false))
                .ok_or_else(|| AudioError::DeviceNotFound(id.to_string())),
        }
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

        Self::select_best_config(configs.collect())
    }

    /// Findet die beste Output-Konfiguration
    fn find_best_output_config(device: &Device) -> Result<StreamConfig, AudioError> {
        let configs = device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

        Self::select_best_config(configs.collect())
    }

    /// Wählt die beste Konfiguration aus einer Liste
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, AudioError> {
        // Nur F32, da die Callbacks auf f32 arbeiten; 48kHz bevorzugt
        let target_rate = cpal::SampleRate(DEVICE_SAMPLE_RATE);

        let f32_configs: Vec<SupportedStreamConfigRange> = configs
            .into_iter()
            .filter(|c| c.sample_format() == SampleFormat::F32)
            .collect();

        if let Some(config) = f32_configs
            .iter()
            .find(|c| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate)
            .cloned()
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }

        if let Some(config) = f32_configs.into_iter().next() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(AudioError::UnsupportedConfig(
            "No f32 audio configuration found".to_string(),
        ))
    }
}

impl Default for AudioHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AudioHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioHandler")
            .field("input_device_id", &self.input_device_id)
            .field("output_device_id", &self.output_device_id)
            .field("is_capturing", &self.input_stream.is_some())
            .field("is_playing", &self.output_stream.is_some())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
