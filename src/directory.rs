use std::collections::HashMap;

use tracing::{debug, info};

use crate::events::{EventSender, SyncEvent};
use crate::peer::{Peer, PeerRecord};

/// Live set of discovered peers, keyed by peer id. Independent of any
/// session; it keeps updating while a session is active, and flags when the
/// connected peer is the one that vanished.
pub struct PeerDirectory {
    records: HashMap<String, PeerRecord>,
    connected: Option<String>,
    events: EventSender,
}

impl PeerDirectory {
    pub fn new(events: EventSender) -> Self {
        Self {
            records: HashMap::new(),
            connected: None,
            events,
        }
    }

    /// Which peer id the session is currently bound to, for the lost-peer
    /// cross-check. The session owner updates this on connect/close.
    pub fn set_connected(&mut self, peer_id: Option<String>) {
        self.connected = peer_id;
    }

    /// Inserts or refreshes a record. Idempotent on repeated sightings of
    /// the same id; re-advertisements with changed info just update in place.
    pub fn on_peer_seen(&mut self, peer: Peer, advertised_name: Option<String>) {
        let record = PeerRecord::new(peer, advertised_name);
        let refreshed = self.records.insert(record.peer.id.clone(), record.clone());
        if refreshed.is_none() {
            info!(peer = %record.peer.id, name = record.title(), "peer appeared");
        }
        let _ = self.events.send(SyncEvent::PeersChanged(self.snapshot()));
    }

    /// Removes a record if present; no-op otherwise. Returns true when the
    /// lost peer is the session's connected peer, so the caller can tear the
    /// session down.
    pub fn on_peer_lost(&mut self, peer_id: &str) -> bool {
        if self.records.remove(peer_id).is_none() {
            debug!(peer = peer_id, "lost notification for unknown peer");
            return false;
        }
        info!(peer = peer_id, "peer lost");
        let _ = self.events.send(SyncEvent::PeersChanged(self.snapshot()));
        if self.connected.as_deref() == Some(peer_id) {
            let _ = self
                .events
                .send(SyncEvent::ConnectedPeerLost(peer_id.to_owned()));
            return true;
        }
        false
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.records.get(peer_id)
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.records.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;

    fn directory() -> (PeerDirectory, tokio::sync::broadcast::Receiver<SyncEvent>) {
        let (tx, rx) = events::channel();
        (PeerDirectory::new(tx), rx)
    }

    #[test]
    fn repeated_sightings_are_idempotent() {
        let (mut dir, mut rx) = directory();
        dir.on_peer_seen(Peer::new("p1", "iPad"), None);
        dir.on_peer_seen(Peer::new("p1", "iPad"), Some("Avi's iPad".into()));
        assert_eq!(dir.snapshot().len(), 1);
        assert_eq!(dir.get("p1").unwrap().title(), "Avi's iPad");
        // a full snapshot per sighting
        for _ in 0..2 {
            match rx.try_recv().unwrap() {
                SyncEvent::PeersChanged(peers) => assert_eq!(peers.len(), 1),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn losing_unknown_peer_is_a_noop() {
        let (mut dir, mut rx) = directory();
        assert!(!dir.on_peer_lost("ghost"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn losing_connected_peer_is_flagged() {
        let (mut dir, mut rx) = directory();
        dir.on_peer_seen(Peer::new("p1", "iPad"), None);
        dir.on_peer_seen(Peer::new("p2", "Phone"), None);
        dir.set_connected(Some("p1".into()));

        assert!(!dir.on_peer_lost("p2"));
        assert!(dir.on_peer_lost("p1"));

        let mut saw_lost = false;
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::ConnectedPeerLost(id) = event {
                assert_eq!(id, "p1");
                saw_lost = true;
            }
        }
        assert!(saw_lost);
    }
}
