//! Verbindungslinks
//!
//! Ein Link trägt die Peer ID im Fragment (`peercall://call/#<id>`), wie
//! die URL der Browser-Seite, die man per Chat weitergibt.

use url::Url;

/// Link, unter dem uns der Remote Peer erreicht
pub fn connection_link(base: &Url, local_peer_id: &str) -> Url {
    let mut link = base.clone();
    link.set_fragment(Some(local_peer_id));
    link
}

/// Liest die Peer ID aus einem Link, einem `#id`-Fragment oder einer nackten ID
pub fn peer_id_from_fragment(input: &str) -> Option<String> {
    let input = input.trim();

    let id = if let Some(fragment) = input.strip_prefix('#') {
        fragment.to_string()
    } else if input.contains("://") {
        let url = Url::parse(input).ok()?;
        url.fragment()?.to_string()
    } else {
        input.to_string()
    };

    let id = id.trim().to_string();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("peercall://call/").unwrap()
    }

    #[test]
    fn test_connection_link_sets_fragment() {
        let link = connection_link(&base(), "abc-123");
        assert_eq!(link.as_str(), "peercall://call/#abc-123");
    }

    #[test]
    fn test_connection_link_replaces_existing_fragment() {
        let base = Url::parse("https://example.org/call#old").unwrap();
        let link = connection_link(&base, "new");
        assert_eq!(link.as_str(), "https://example.org/call#new");
    }

    #[test]
    fn test_peer_id_from_link() {
        assert_eq!(
            peer_id_from_fragment("peercall://call/#abc-123").as_deref(),
            Some("abc-123")
        );
        assert_eq!(
            peer_id_from_fragment("https://example.org/#xyz").as_deref(),
            Some("xyz")
        );
    }

    #[test]
    fn test_peer_id_from_fragment_or_bare_id() {
        assert_eq!(peer_id_from_fragment("#abc").as_deref(), Some("abc"));
        assert_eq!(peer_id_from_fragment("  abc  ").as_deref(), Some("abc"));
    }

    #[test]
    fn test_empty_fragment() {
        assert_eq!(peer_id_from_fragment(""), None);
        assert_eq!(peer_id_from_fragment("#"), None);
        assert_eq!(peer_id_from_fragment("peercall://call/"), None);
        assert_eq!(peer_id_from_fragment("peercall://call/#"), None);
    }
}
