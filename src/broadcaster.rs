use tracing::debug;

use crate::params::TweakKey;
use crate::session::SyncSession;
use crate::transport::Reliability;

/// Coalesces local value changes into outbound resyncs. Any number of edits
/// noted within one service-loop tick become a single payload carrying the
/// entire current set. Full state rather than deltas, so there are no
/// sequence numbers or acks to track and a lost message is superseded by the
/// next one.
#[derive(Default)]
pub struct ChangeBroadcaster {
    pending: Vec<TweakKey>,
}

impl ChangeBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_change(&mut self, key: TweakKey) {
        self.pending.push(key);
    }

    /// Sends at most one full-state payload covering everything noted since
    /// the last flush. Pending changes are cleared either way: if the session
    /// isn't synced there is nobody to catch up, and the seed will carry
    /// current values anyway.
    pub fn flush(&mut self, session: &SyncSession) {
        if self.pending.is_empty() {
            return;
        }
        let changed = std::mem::take(&mut self.pending);
        debug!(changed = changed.len(), "flushing full-state resync");
        session.send_full_state(Reliability::Unreliable);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::events;
    use crate::params::{Bounds, ParameterSet, TweakDescriptor, TweakKey, TweakValue};
    use crate::peer::Peer;
    use crate::session::SyncSession;
    use crate::transport::{SessionTransport, TransportEvent};

    #[derive(Default)]
    struct CountingTransport {
        sends: Mutex<usize>,
    }

    impl CountingTransport {
        fn sends(&self) -> usize {
            *self.sends.lock().unwrap()
        }
    }

    impl SessionTransport for CountingTransport {
        fn invite(&self, _peer: &Peer, _generation: u64) {}
        fn accept(&self, _peer: &Peer, _generation: u64) {}
        fn send(&self, _peer: &Peer, _payload: Vec<u8>, _reliability: Reliability) {
            *self.sends.lock().unwrap() += 1;
        }
        fn close(&self, _peer: &Peer) {}
    }

    fn demo_set() -> ParameterSet {
        ParameterSet::from_descriptors([TweakDescriptor::new(
            TweakKey::new("UI", "Colors", "bgAlpha"),
            TweakValue::Double(1.0),
            Some(Bounds {
                default: 1.0,
                min: 0.0,
                max: 1.0,
                step: 0.05,
            }),
        )])
        .unwrap()
    }

    fn synced_host() -> (SyncSession, Arc<CountingTransport>) {
        let transport = Arc::new(CountingTransport::default());
        let (tx, _rx) = events::channel();
        let mut session = SyncSession::host(demo_set(), transport.clone(), tx);
        let peer = Peer::new("ctl-1", "iPhone");
        session.accept(peer.clone()).unwrap();
        let generation = session.generation();
        session.handle_transport(TransportEvent::Connected { peer, generation });
        (session, transport)
    }

    #[test]
    fn burst_coalesces_into_one_send() {
        let (session, transport) = synced_host();
        let seed_sends = transport.sends();

        let mut broadcaster = ChangeBroadcaster::new();
        let key = TweakKey::new("UI", "Colors", "bgAlpha");
        broadcaster.note_change(key.clone());
        broadcaster.note_change(key.clone());
        broadcaster.note_change(key);
        broadcaster.flush(&session);

        assert_eq!(transport.sends(), seed_sends + 1);

        // nothing pending, nothing sent
        broadcaster.flush(&session);
        assert_eq!(transport.sends(), seed_sends + 1);
    }

    #[test]
    fn flush_without_session_sends_nothing() {
        let transport = Arc::new(CountingTransport::default());
        let (tx, _rx) = events::channel();
        let session = SyncSession::controller(transport.clone(), tx);

        let mut broadcaster = ChangeBroadcaster::new();
        broadcaster.note_change(TweakKey::new("UI", "Colors", "bgAlpha"));
        broadcaster.flush(&session);
        assert_eq!(transport.sends(), 0);
    }
}
