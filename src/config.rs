//! Konfiguration der Anwendung
//!
//! Reihenfolge der Quellen:
//! 1. Defaults (PeerJS Cloud-Broker, PeerJS STUN/TURN-Server)
//! 2. Optionale `config.json` im Konfigurationsverzeichnis der Plattform
//! 3. Umgebungsvariablen (`PEERCALL_*`)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid broker URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

// ============================================================================
// BROKER CONFIGURATION
// ============================================================================

/// Verbindungsdaten für den PeerJS-kompatiblen Broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub key: String,
    pub secure: bool,
    /// Heartbeat-Intervall in Sekunden
    pub ping_interval_secs: u64,
    /// Feste Peer ID statt einer vom Broker vergebenen
    pub peer_id: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.peerjs.com".to_string(),
            port: 443,
            path: "/".to_string(),
            key: "peerjs".to_string(),
            secure: true,
            ping_interval_secs: 5,
            peer_id: None,
        }
    }
}

impl BrokerConfig {
    /// Basis-URL inklusive Pfad, der Pfad endet immer mit `/`
    fn base_url(&self, scheme: &str) -> Result<Url, ConfigError> {
        let mut path = self.path.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if !path.ends_with('/') {
            path.push('/');
        }
        Ok(Url::parse(&format!(
            "{}://{}:{}{}",
            scheme, self.host, self.port, path
        ))?)
    }

    /// URL zum Abholen einer neuen Peer ID
    pub fn id_url(&self, cache_buster: &str) -> Result<Url, ConfigError> {
        let scheme = if self.secure { "https" } else { "http" };
        let mut url = self
            .base_url(scheme)?
            .join(&format!("{}/id", self.key))?;
        url.query_pairs_mut().append_pair("ts", cache_buster);
        Ok(url)
    }

    /// WebSocket-URL für die Broker-Verbindung
    pub fn socket_url(&self, peer_id: &str, token: &str) -> Result<Url, ConfigError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = self.base_url(scheme)?.join("peerjs")?;
        url.query_pairs_mut()
            .append_pair("key", &self.key)
            .append_pair("id", peer_id)
            .append_pair("token", token);
        Ok(url)
    }
}

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl From<&IceServerConfig> for RTCIceServer {
    fn from(server: &IceServerConfig) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        }
    }
}

/// Standard STUN/TURN Server (dieselben wie im PeerJS-Client)
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: String::new(),
            credential: String::new(),
        },
        IceServerConfig {
            urls: vec![
                "turn:eu-0.turn.peerjs.com:3478".to_string(),
                "turn:us-0.turn.peerjs.com:3478".to_string(),
            ],
            username: "peerjs".to_string(),
            credential: "peerjsp".to_string(),
        },
    ]
}

// ============================================================================
// APP CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub ice_servers: Vec<IceServerConfig>,
    /// Basis des Verbindungslinks, das Fragment wird durch die Peer ID ersetzt
    pub link_base: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            ice_servers: default_ice_servers(),
            link_base: "peercall://call/".to_string(),
        }
    }
}

impl AppConfig {
    /// Lädt die Konfiguration aus Datei und Umgebung
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::get_config_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {:?}", path);
                Self::from_json(&std::fs::read_to_string(&path)?)?
            }
            _ => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Überschreibt Werte aus einer Umgebung (z.B. `std::env::var`)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PEERCALL_BROKER_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("PEERCALL_BROKER_PORT") {
            self.broker.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "PEERCALL_BROKER_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(path) = lookup("PEERCALL_BROKER_PATH") {
            self.broker.path = path;
        }
        if let Some(key) = lookup("PEERCALL_BROKER_KEY") {
            self.broker.key = key;
        }
        if let Some(secure) = lookup("PEERCALL_BROKER_SECURE") {
            self.broker.secure = match secure.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "PEERCALL_BROKER_SECURE".to_string(),
                        value: secure,
                    })
                }
            };
        }
        if let Some(peer_id) = lookup("PEERCALL_PEER_ID") {
            self.broker.peer_id = Some(peer_id).filter(|id| !id.is_empty());
        }
        if let Some(link_base) = lookup("PEERCALL_LINK_BASE") {
            self.link_base = link_base;
        }
        Ok(())
    }

    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers.iter().map(RTCIceServer::from).collect()
    }

    /// Ermittelt den Pfad zur Konfigurationsdatei
    fn get_config_path() -> Option<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "peercall", "peercall")?;
        Some(proj_dirs.config_dir().join("config.json"))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_point_to_peerjs_cloud() {
        let config = AppConfig::default();
        assert_eq!(config.broker.host, "0.peerjs.com");
        assert_eq!(config.broker.port, 443);
        assert!(config.broker.secure);
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn test_socket_url() {
        let broker = BrokerConfig::default();
        let url = broker.socket_url("alice", "tok123").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://0.peerjs.com/peerjs?key=peerjs&id=alice&token=tok123"
        );
    }

    #[test]
    fn test_socket_url_with_custom_path() {
        let broker = BrokerConfig {
            host: "localhost".to_string(),
            port: 9000,
            path: "myapp".to_string(),
            secure: false,
            ..Default::default()
        };
        let url = broker.socket_url("bob", "t").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:9000/myapp/peerjs?key=peerjs&id=bob&token=t"
        );
    }

    #[test]
    fn test_id_url() {
        let broker = BrokerConfig::default();
        let url = broker.id_url("42").unwrap();
        assert_eq!(url.as_str(), "https://0.peerjs.com/peerjs/id?ts=42");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = AppConfig::from_json(r#"{ "broker": { "host": "broker.local" } }"#).unwrap();
        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.key, "peerjs");
        assert_eq!(config.link_base, "peercall://call/");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("PEERCALL_BROKER_PORT", "9000"),
            ("PEERCALL_BROKER_SECURE", "false"),
            ("PEERCALL_PEER_ID", "fixed-id"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.broker.port, 9000);
        assert!(!config.broker.secure);
        assert_eq!(config.broker.peer_id.as_deref(), Some("fixed-id"));
    }

    #[test]
    fn test_invalid_env_port() {
        let mut config = AppConfig::default();
        let result = config.apply_env(|key| {
            (key == "PEERCALL_BROKER_PORT").then(|| "not-a-port".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
