//! PeerCall - P2P Voice Call Application
//!
//! Ein Anruf zwischen zwei Peers, adressiert über einen Link:
//! - PeerJS-kompatibler Broker für Offer/Answer/ICE
//! - WebRTC für P2P Audio-Kommunikation
//! - Peer ID im Fragment des Links (`peercall://call/#<id>`)

pub mod broker;
pub mod call_engine;
pub mod config;
pub mod session;

use anyhow::Context;
use call_engine::{CallInfo, DeviceList};
use config::AppConfig;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use session::{CallController, LocalPeerInfo, SessionEvent};
use std::sync::Arc;
use tauri::{AppHandle, Emitter, Manager, State, WindowEvent};
use tokio::sync::broadcast::error::RecvError;

/// Standard-Filter, falls `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "peercall_lib=info,webrtc=warn";

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Globaler Application State
pub struct AppState {
    controller: CallController,
    /// Link aus den Startargumenten, wird beim ersten `initialize` gewählt
    launch_fragment: Mutex<Option<String>>,
}

/// Singleton für den AppState
static APP_STATE: OnceCell<Arc<AppState>> = OnceCell::new();

impl AppState {
    /// Initialisiert den Application State
    pub fn init(launch_fragment: Option<String>) -> anyhow::Result<Arc<Self>> {
        init_logging();

        tracing::info!("Initializing PeerCall v{}...", env!("CARGO_PKG_VERSION"));

        let config = AppConfig::load().context("Failed to load configuration")?;
        tracing::info!(
            "Using broker {}:{}{}",
            config.broker.host,
            config.broker.port,
            config.broker.path
        );

        let controller =
            CallController::new(config).context("Failed to create call controller")?;

        let state = Arc::new(Self {
            controller,
            launch_fragment: Mutex::new(launch_fragment),
        });

        APP_STATE
            .set(Arc::clone(&state))
            .map_err(|_| anyhow::anyhow!("AppState already initialized"))?;

        Ok(state)
    }

    /// Gibt den globalen AppState zurück
    pub fn get() -> Option<Arc<Self>> {
        APP_STATE.get().cloned()
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .try_init();
}

/// Sucht einen Link oder ein Fragment in den Kommandozeilenargumenten
fn fragment_from_args(args: &[String]) -> Option<String> {
    args.iter()
        .skip(1)
        .find(|arg| arg.contains('#') && session::peer_id_from_fragment(arg).is_some())
        .cloned()
}

/// Leitet Session-Events als Tauri-Events an die Oberfläche weiter
fn forward_session_events(app_handle: AppHandle, controller: &CallController) {
    let mut event_rx = controller.subscribe();

    tauri::async_runtime::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    if let SessionEvent::Error(ref message) = event {
                        tracing::debug!("Forwarding error to UI: {}", message);
                    }
                    if let Err(e) = app_handle.emit(event.name(), event.payload()) {
                        tracing::warn!("Failed to emit {}: {}", event.name(), e);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("UI missed {} session events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

// ============================================================================
// TAURI COMMANDS - SESSION
// ============================================================================

/// Startet die Sitzung und wählt das Fragment (oder den Startlink) an
#[tauri::command]
async fn initialize(
    fragment: Option<String>,
    state: State<'_, Arc<AppState>>,
) -> Result<LocalPeerInfo, String> {
    let launch_fragment = state.launch_fragment.lock().take();
    let fragment = fragment.filter(|f| !f.is_empty()).or(launch_fragment);

    state
        .controller
        .initialize(fragment)
        .await
        .map_err(|e| e.to_string())
}

/// Gibt die lokale Peer ID zurück (sobald der Broker sie akzeptiert hat)
#[tauri::command]
async fn get_local_peer_id(state: State<'_, Arc<AppState>>) -> Result<Option<String>, String> {
    Ok(state.controller.local_peer_id())
}

/// Gibt den Link zurück, unter dem wir erreichbar sind
#[tauri::command]
async fn get_connection_link(state: State<'_, Arc<AppState>>) -> Result<Option<String>, String> {
    Ok(state.controller.connection_link())
}

/// Fragment geändert (Eingabe oder eingefügter Link)
#[tauri::command]
async fn set_url_fragment(fragment: String, state: State<'_, Arc<AppState>>) -> Result<(), String> {
    state
        .controller
        .connect_to_remote_peer_from_fragment(&fragment)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn get_call_status(state: State<'_, Arc<AppState>>) -> Result<Option<CallInfo>, String> {
    Ok(state.controller.call_status())
}

/// Beendet die App; ohne `force` nur, wenn kein Anruf offen ist
#[tauri::command]
async fn quit(
    force: Option<bool>,
    state: State<'_, Arc<AppState>>,
    app_handle: AppHandle,
) -> Result<(), String> {
    if !force.unwrap_or(false) {
        if let Some(message) = state.controller.close_guard() {
            return Err(message.to_string());
        }
    }

    state.controller.shutdown();
    app_handle.exit(0);
    Ok(())
}

// ============================================================================
// TAURI COMMANDS - AUDIO
// ============================================================================

#[tauri::command]
async fn get_audio_devices(state: State<'_, Arc<AppState>>) -> Result<DeviceList, String> {
    state
        .controller
        .populate_audio_devices()
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn select_input_device(
    device_id: String,
    state: State<'_, Arc<AppState>>,
) -> Result<(), String> {
    state
        .controller
        .select_input_device(device_id)
        .await
        .map_err(|e| e.to_string())
}

/// Ausgabegerät für empfangenes Audio und Loopback
#[tauri::command]
async fn select_output_device(
    device_id: String,
    state: State<'_, Arc<AppState>>,
) -> Result<(), String> {
    state
        .controller
        .select_output_device(device_id)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn set_loopback_volume(volume: f32, state: State<'_, Arc<AppState>>) -> Result<(), String> {
    state
        .controller
        .set_loopback_volume(volume)
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn set_receiving_volume(volume: f32, state: State<'_, Arc<AppState>>) -> Result<(), String> {
    state
        .controller
        .set_receiving_volume(volume)
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn set_sending_muted(muted: bool, state: State<'_, Arc<AppState>>) -> Result<(), String> {
    state
        .controller
        .set_sending_muted(muted)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn set_receiving_muted(muted: bool, state: State<'_, Arc<AppState>>) -> Result<(), String> {
    state.controller.set_receiving_muted(muted);
    Ok(())
}

/// Gibt Audio-Levels zurück (input, output)
#[tauri::command]
async fn get_audio_levels(state: State<'_, Arc<AppState>>) -> Result<(f32, f32), String> {
    Ok(state.controller.audio_levels())
}

// ============================================================================
// APP ENTRY
// ============================================================================

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    let args: Vec<String> = std::env::args().collect();
    let launch_fragment = fragment_from_args(&args);

    tauri::Builder::default()
        .plugin(tauri_plugin_single_instance::init(|app, args, _cwd| {
            if let Some(window) = app.get_webview_window("main") {
                let _ = window.set_focus();
            }

            // Link an die laufende Instanz weitergeben
            let fragment = match fragment_from_args(&args) {
                Some(fragment) => fragment,
                None => return,
            };
            let state = match AppState::get() {
                Some(state) => state,
                None => return,
            };

            tracing::info!("Received link from second instance: {}", fragment);
            tauri::async_runtime::spawn(async move {
                if let Err(e) = state
                    .controller
                    .connect_to_remote_peer_from_fragment(&fragment)
                    .await
                {
                    tracing::error!("Failed to connect to remote peer: {}", e);
                }
            });
        }))
        .setup(move |app| {
            // App State initialisieren
            let state = AppState::init(launch_fragment.clone())?;

            forward_session_events(app.handle().clone(), &state.controller);

            // State im Tauri-App registrieren
            app.manage(state);

            Ok(())
        })
        .on_window_event(|window, event| {
            if let WindowEvent::CloseRequested { api, .. } = event {
                let state = match window.try_state::<Arc<AppState>>() {
                    Some(state) => state,
                    None => return,
                };

                match state.controller.close_guard() {
                    Some(message) => {
                        tracing::info!("Close blocked: call still open");
                        api.prevent_close();
                        let _ = window.emit("app:close_blocked", message);
                    }
                    None => {
                        let controller = state.controller.clone();
                        tauri::async_runtime::spawn(async move { controller.shutdown() });
                    }
                }
            }
        })
        .invoke_handler(tauri::generate_handler![
            // Session
            initialize,
            get_local_peer_id,
            get_connection_link,
            set_url_fragment,
            get_call_status,
            quit,
            // Audio
            get_audio_devices,
            select_input_device,
            select_output_device,
            set_loopback_volume,
            set_receiving_volume,
            set_sending_muted,
            set_receiving_muted,
            get_audio_levels,
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_fragment_from_link_argument() {
        assert_eq!(
            fragment_from_args(&args(&["peercall", "peercall://call/#abc"])).as_deref(),
            Some("peercall://call/#abc")
        );
        assert_eq!(
            fragment_from_args(&args(&["peercall", "--flag", "#xyz"])).as_deref(),
            Some("#xyz")
        );
    }

    #[test]
    fn test_fragment_ignores_program_name_and_plain_args() {
        assert_eq!(fragment_from_args(&args(&["peercall#abc"])), None);
        assert_eq!(fragment_from_args(&args(&["peercall", "--verbose"])), None);
        assert_eq!(fragment_from_args(&args(&["peercall", "peercall://call/#"])), None);
    }
}
