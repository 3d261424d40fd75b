//! Session State und die reinen Entscheidungen darauf
//!
//! Keine I/O hier, damit die Regeln ohne Audio und Netzwerk testbar sind.

use super::link::peer_id_from_fragment;
use crate::call_engine::DEFAULT_DEVICE_ID;
use serde::Serialize;

/// Was der Controller über die laufende Sitzung weiß
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub local_peer_id: Option<String>,
    pub remote_peer_id: Option<String>,
    pub is_sending_muted: bool,
    pub input_device: String,
    pub output_device: String,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            local_peer_id: None,
            remote_peer_id: None,
            is_sending_muted: false,
            input_device: DEFAULT_DEVICE_ID.to_string(),
            output_device: DEFAULT_DEVICE_ID.to_string(),
        }
    }
}

/// Reaktion auf ein geändertes Fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentAction {
    Ignore,
    Dial {
        remote_peer_id: String,
        /// Bestehender Anruf muss vorher geschlossen werden
        close_current: bool,
    },
}

/// Umgang mit eingehenden Anrufen und Datenverbindungen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    Reject,
}

impl SessionState {
    /// Entscheidet, ob ein neues Fragment einen Anruf auslöst
    pub fn fragment_action(&self, fragment: &str, has_call: bool) -> FragmentAction {
        let remote_peer_id = match peer_id_from_fragment(fragment) {
            Some(id) => id,
            None => return FragmentAction::Ignore,
        };

        if self.remote_peer_id.as_deref() == Some(remote_peer_id.as_str()) {
            return FragmentAction::Ignore;
        }

        FragmentAction::Dial {
            remote_peer_id,
            close_current: has_call,
        }
    }
}

/// Eingehendes wird nur angenommen, solange kein Anruf offen ist
pub fn admit(call_open: bool) -> Admission {
    if call_open {
        Admission::Reject
    } else {
        Admission::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_remote(id: &str) -> SessionState {
        SessionState {
            remote_peer_id: Some(id.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_devices() {
        let state = SessionState::default();
        assert_eq!(state.input_device, "default");
        assert_eq!(state.output_device, "default");
        assert!(!state.is_sending_muted);
    }

    #[test]
    fn test_empty_fragment_is_ignored() {
        let state = SessionState::default();
        assert_eq!(state.fragment_action("", false), FragmentAction::Ignore);
        assert_eq!(state.fragment_action("#", true), FragmentAction::Ignore);
    }

    #[test]
    fn test_same_fragment_is_ignored() {
        let state = with_remote("bob");
        assert_eq!(state.fragment_action("#bob", true), FragmentAction::Ignore);
        assert_eq!(
            state.fragment_action("peercall://call/#bob", false),
            FragmentAction::Ignore
        );
    }

    #[test]
    fn test_new_fragment_dials() {
        let state = SessionState::default();
        assert_eq!(
            state.fragment_action("#alice", false),
            FragmentAction::Dial {
                remote_peer_id: "alice".to_string(),
                close_current: false,
            }
        );
    }

    #[test]
    fn test_new_fragment_closes_existing_call() {
        let state = with_remote("bob");
        assert_eq!(
            state.fragment_action("#carol", true),
            FragmentAction::Dial {
                remote_peer_id: "carol".to_string(),
                close_current: true,
            }
        );
    }

    #[test]
    fn test_admission() {
        assert_eq!(admit(true), Admission::Reject);
        assert_eq!(admit(false), Admission::Accept);
    }
}
