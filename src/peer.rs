use std::hash::{Hash, Hasher};

/// A nearby device. Identity is the opaque id only; the display name is
/// cosmetic and may change between sightings without creating a new peer.
#[derive(Debug, Clone, Eq, serde::Serialize, serde::Deserialize)]
pub struct Peer {
    pub id: String,
    pub display_name: String,
}

impl Peer {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A currently-visible peer plus the friendly name it advertised, if any.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PeerRecord {
    pub peer: Peer,
    pub advertised_name: Option<String>,
}

impl PeerRecord {
    pub fn new(peer: Peer, advertised_name: Option<String>) -> Self {
        Self {
            peer,
            advertised_name,
        }
    }

    /// Name to show in a list: the advertised name, falling back to the
    /// peer's own display name.
    pub fn title(&self) -> &str {
        self.advertised_name
            .as_deref()
            .unwrap_or(&self.peer.display_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_equal_by_id_only() {
        let a = Peer::new("p1", "Living Room iPad");
        let b = Peer::new("p1", "Renamed iPad");
        let c = Peer::new("p2", "Living Room iPad");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn record_title_falls_back_to_display_name() {
        let peer = Peer::new("p1", "Studio Mac");
        let named = PeerRecord::new(peer.clone(), Some("Avi's rig".into()));
        let unnamed = PeerRecord::new(peer, None);
        assert_eq!(named.title(), "Avi's rig");
        assert_eq!(unnamed.title(), "Studio Mac");
    }
}
