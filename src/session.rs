use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{SessionError, TweakError};
use crate::events::{EventSender, SyncEvent};
use crate::params::{ParameterSet, TweakKey, TweakValue};
use crate::peer::Peer;
use crate::transport::{Reliability, SessionTransport, TransportEvent};

/// Which side of the protocol this device plays. The host owns the
/// authoritative parameter set and originates the seed; the controller
/// builds its set from the seed and edits remotely. The state machine and
/// merge semantics are shared between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Controller,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    AwaitingSeed,
    Synced,
    Closed,
}

/// The protocol state machine. Owns at most one peer link and, while one is
/// up, the synchronized `ParameterSet`. Pure with respect to the transport:
/// all I/O goes through the `SessionTransport` capability and all inputs
/// arrive as explicit method calls, so the machine tests without a network.
pub struct SyncSession {
    role: Role,
    state: SessionState,
    peer: Option<Peer>,
    params: Option<ParameterSet>,
    /// Bumped whenever a link is opened or torn down. Transport events carry
    /// the generation of the link they belong to; anything stale is dropped,
    /// which is what makes `dismiss` safe against in-flight payloads.
    generation: u64,
    transport: Arc<dyn SessionTransport>,
    events: EventSender,
}

impl SyncSession {
    pub fn host(
        initial: ParameterSet,
        transport: Arc<dyn SessionTransport>,
        events: EventSender,
    ) -> Self {
        Self {
            role: Role::Host,
            state: SessionState::Idle,
            peer: None,
            params: Some(initial),
            generation: 0,
            transport,
            events,
        }
    }

    pub fn controller(transport: Arc<dyn SessionTransport>, events: EventSender) -> Self {
        Self {
            role: Role::Controller,
            state: SessionState::Idle,
            peer: None,
            params: None,
            generation: 0,
            transport,
            events,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> Option<&Peer> {
        self.peer.as_ref()
    }

    pub fn params(&self) -> Option<&ParameterSet> {
        self.params.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn busy(&self) -> bool {
        matches!(
            self.state,
            SessionState::Connecting | SessionState::AwaitingSeed | SessionState::Synced
        )
    }

    /// Controller role: invite a discovered host. Rejected while any session
    /// is in flight; the caller surfaces that, not us.
    pub fn connect(&mut self, peer: Peer) -> Result<(), SessionError> {
        if self.busy() {
            return Err(SessionError::Busy);
        }
        self.generation += 1;
        self.state = SessionState::Connecting;
        self.peer = Some(peer.clone());
        info!(peer = %peer.id, "inviting host");
        self.transport.invite(&peer, self.generation);
        Ok(())
    }

    /// Host role: take an inbound invitation. Same admission rule as
    /// `connect`.
    pub fn accept(&mut self, peer: Peer) -> Result<(), SessionError> {
        if self.busy() {
            return Err(SessionError::Busy);
        }
        self.generation += 1;
        self.state = SessionState::Connecting;
        self.peer = Some(peer.clone());
        info!(peer = %peer.id, "accepting invitation");
        self.transport.accept(&peer, self.generation);
        Ok(())
    }

    /// Explicit teardown. After this returns, no in-flight payload can merge:
    /// the generation has moved on, so anything already queued is dropped
    /// when it surfaces.
    pub fn dismiss(&mut self) {
        if !self.busy() {
            return;
        }
        if let Some(peer) = self.peer.clone() {
            self.transport.close(&peer);
        }
        self.teardown();
    }

    /// Discovery lost a peer; tear down only if it is ours.
    pub fn peer_lost(&mut self, peer_id: &str) {
        if !self.busy() {
            return;
        }
        if self.peer.as_ref().is_some_and(|p| p.id == peer_id) {
            info!(peer = peer_id, "connected peer lost, closing session");
            if let Some(peer) = self.peer.clone() {
                self.transport.close(&peer);
            }
            self.teardown();
        }
    }

    pub fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::InviteReceived { peer } => {
                // admission is the service loop's call, not the machine's
                debug!(peer = %peer.id, "invite event reached session unhandled");
            }
            TransportEvent::Connected { peer, generation } => {
                if generation != self.generation || self.state != SessionState::Connecting {
                    debug!(peer = %peer.id, generation, "stale connected event, dropping");
                    return;
                }
                match self.role {
                    Role::Host => {
                        // We originate the seed, so there is nothing to wait for.
                        if let Some(set) = &self.params {
                            self.transport
                                .send(&peer, set.encode(), Reliability::Reliable);
                        }
                        self.state = SessionState::Synced;
                        info!(peer = %peer.id, "session synced (seed sent)");
                    }
                    Role::Controller => {
                        self.state = SessionState::AwaitingSeed;
                        info!(peer = %peer.id, "connected, awaiting seed");
                    }
                }
            }
            TransportEvent::ConnectFailed {
                peer,
                generation,
                reason,
            } => {
                if generation != self.generation || self.state != SessionState::Connecting {
                    return;
                }
                warn!(peer = %peer.id, reason, "connection failed");
                self.generation += 1;
                self.state = SessionState::Idle;
                self.peer = None;
                let _ = self.events.send(SyncEvent::ConnectionFailed(reason));
            }
            TransportEvent::Received {
                peer,
                generation,
                payload,
            } => {
                if generation != self.generation
                    || self.peer.as_ref() != Some(&peer)
                {
                    debug!(peer = %peer.id, generation, "payload for a stale session, dropping");
                    return;
                }
                self.handle_payload(&payload);
            }
            TransportEvent::Disconnected { peer, generation } => {
                if generation != self.generation {
                    return;
                }
                match self.state {
                    SessionState::Connecting => {
                        self.generation += 1;
                        self.state = SessionState::Idle;
                        self.peer = None;
                        let _ = self
                            .events
                            .send(SyncEvent::ConnectionFailed("disconnected".into()));
                    }
                    SessionState::AwaitingSeed | SessionState::Synced => {
                        info!(peer = %peer.id, "peer disconnected");
                        self.teardown();
                    }
                    _ => {}
                }
            }
        }
    }

    fn handle_payload(&mut self, payload: &[u8]) {
        match self.state {
            SessionState::AwaitingSeed => match ParameterSet::decode(payload) {
                Ok(remote) => {
                    let mut set = ParameterSet::new();
                    set.merge_from(remote);
                    info!(tweaks = set.len(), "seed received");
                    let _ = self.events.send(SyncEvent::SeedReceived(set.clone()));
                    self.params = Some(set);
                    self.state = SessionState::Synced;
                }
                Err(e) => {
                    // stay in AwaitingSeed; the peer may retry
                    warn!("seed payload undecodable: {e}");
                    let _ = self.events.send(SyncEvent::ProtocolError(e.to_string()));
                }
            },
            SessionState::Synced => match ParameterSet::decode(payload) {
                Ok(remote) => {
                    if let Some(set) = self.params.as_mut() {
                        let changed = set.merge_from(remote);
                        if !changed.is_empty() {
                            debug!(changed = changed.len(), "values updated from peer");
                            let _ = self.events.send(SyncEvent::ValuesUpdated(changed));
                        }
                    }
                }
                Err(e) => {
                    warn!("sync payload undecodable: {e}");
                    let _ = self.events.send(SyncEvent::ProtocolError(e.to_string()));
                }
            },
            _ => debug!("payload outside an active session, dropping"),
        }
    }

    /// Local edit. Validation failures reject the edit only; session state
    /// is never touched.
    pub fn set_value(&mut self, key: &TweakKey, value: TweakValue) -> Result<(), TweakError> {
        let Some(set) = self.params.as_mut() else {
            return Err(TweakError::UnknownKey(key.clone()));
        };
        set.set_value(key, value)?;
        let _ = self.events.send(SyncEvent::ValueChanged(key.clone()));
        Ok(())
    }

    /// Full-state resync to the connected peer; the broadcaster calls this.
    /// No-op unless synced; a flush racing against teardown is just skipped.
    pub fn send_full_state(&self, reliability: Reliability) {
        if self.state != SessionState::Synced {
            debug!("resync requested outside a synced session, skipping");
            return;
        }
        if let (Some(peer), Some(set)) = (&self.peer, &self.params) {
            self.transport.send(peer, set.encode(), reliability);
        }
    }

    fn teardown(&mut self) {
        self.generation += 1;
        self.state = SessionState::Closed;
        self.peer = None;
        if self.role == Role::Controller {
            // the seeded copy dies with the session; the host keeps its
            // authoritative set for the next controller
            self.params = None;
        }
        let _ = self.events.send(SyncEvent::Closed);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::events;
    use crate::params::{Bounds, TweakDescriptor};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Invite(String, u64),
        Accept(String, u64),
        Send(String, Vec<u8>, Reliability),
        Close(String),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn last_payload(&self) -> Vec<u8> {
            self.calls()
                .into_iter()
                .rev()
                .find_map(|c| match c {
                    Call::Send(_, payload, _) => Some(payload),
                    _ => None,
                })
                .expect("no send recorded")
        }
    }

    impl SessionTransport for Recorder {
        fn invite(&self, peer: &Peer, generation: u64) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Invite(peer.id.clone(), generation));
        }

        fn accept(&self, peer: &Peer, generation: u64) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Accept(peer.id.clone(), generation));
        }

        fn send(&self, peer: &Peer, payload: Vec<u8>, reliability: Reliability) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Send(peer.id.clone(), payload, reliability));
        }

        fn close(&self, peer: &Peer) {
            self.calls.lock().unwrap().push(Call::Close(peer.id.clone()));
        }
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

    fn controller() -> (SyncSession, Arc<Recorder>, tokio::sync::broadcast::Receiver<SyncEvent>) {
        let transport = Arc::new(Recorder::default());
        let (tx, rx) = events::channel();
        let session = SyncSession::controller(transport.clone(), tx);
        (session, transport, rx)
    }

    fn synced_controller() -> (
        SyncSession,
        Arc<Recorder>,
        tokio::sync::broadcast::Receiver<SyncEvent>,
    ) {
        let (mut session, transport, rx) = controller();
        let host = Peer::new("host-1", "Studio Mac");
        session.connect(host.clone()).unwrap();
        let generation = session.generation();
        session.handle_transport(TransportEvent::Connected {
            peer: host.clone(),
            generation,
        });
        session.handle_transport(TransportEvent::Received {
            peer: host,
            generation,
            payload: demo_set().encode(),
        });
        assert_eq!(session.state(), SessionState::Synced);
        (session, transport, rx)
    }

    #[test]
    fn second_connect_is_rejected_while_busy() {
        let (mut session, _transport, _rx) = controller();
        let first = Peer::new("host-1", "Studio Mac");
        session.connect(first.clone()).unwrap();
        let err = session.connect(Peer::new("host-2", "Other Mac")).unwrap_err();
        assert_eq!(err, SessionError::Busy);
        assert_eq!(session.peer(), Some(&first));
    }

    #[test]
    fn invitation_is_rejected_while_busy() {
        let transport = Arc::new(Recorder::default());
        let (tx, _rx) = events::channel();
        let mut session = SyncSession::host(demo_set(), transport, tx);
        session.accept(Peer::new("ctl-1", "iPhone")).unwrap();
        let err = session.accept(Peer::new("ctl-2", "iPad")).unwrap_err();
        assert_eq!(err, SessionError::Busy);
    }

    #[test]
    fn controller_awaits_seed_then_syncs() {
        let (mut session, _transport, mut rx) = controller();
        let host = Peer::new("host-1", "Studio Mac");
        session.connect(host.clone()).unwrap();
        assert_eq!(session.state(), SessionState::Connecting);

        let generation = session.generation();
        session.handle_transport(TransportEvent::Connected {
            peer: host.clone(),
            generation,
        });
        assert_eq!(session.state(), SessionState::AwaitingSeed);

        session.handle_transport(TransportEvent::Received {
            peer: host,
            generation,
            payload: demo_set().encode(),
        });
        assert_eq!(session.state(), SessionState::Synced);
        assert_eq!(session.params(), Some(&demo_set()));

        let mut saw_seed = false;
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::SeedReceived(set) = event {
                assert_eq!(set, demo_set());
                saw_seed = true;
            }
        }
        assert!(saw_seed);
    }

    #[test]
    fn undecodable_seed_keeps_waiting() {
        let (mut session, _transport, mut rx) = controller();
        let host = Peer::new("host-1", "Studio Mac");
        session.connect(host.clone()).unwrap();
        let generation = session.generation();
        session.handle_transport(TransportEvent::Connected {
            peer: host.clone(),
            generation,
        });
        session.handle_transport(TransportEvent::Received {
            peer: host,
            generation,
            payload: b"not json".to_vec(),
        });
        assert_eq!(session.state(), SessionState::AwaitingSeed);
        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SyncEvent::ProtocolError(_)) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn host_sends_seed_on_connect() {
        let transport = Arc::new(Recorder::default());
        let (tx, _rx) = events::channel();
        let mut session = SyncSession::host(demo_set(), transport.clone(), tx);

        let peer = Peer::new("ctl-1", "iPhone");
        session.accept(peer.clone()).unwrap();
        let generation = session.generation();
        session.handle_transport(TransportEvent::Connected {
            peer,
            generation,
        });

        assert_eq!(session.state(), SessionState::Synced);
        let calls = transport.calls();
        assert_eq!(calls[0], Call::Accept("ctl-1".into(), generation));
        match &calls[1] {
            Call::Send(to, payload, Reliability::Reliable) => {
                assert_eq!(to, "ctl-1");
                assert_eq!(ParameterSet::decode(payload).unwrap(), demo_set());
            }
            other => panic!("expected reliable seed send, got {other:?}"),
        }
    }

    #[test]
    fn peer_loss_tears_down_matching_session_only() {
        let (mut session, _transport, _rx) = synced_controller();

        session.peer_lost("some-other-peer");
        assert_eq!(session.state(), SessionState::Synced);
        assert!(session.params().is_some());

        session.peer_lost("host-1");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.params().is_none());
        assert!(session.peer().is_none());
    }

    #[test]
    fn dismiss_drops_in_flight_payload() {
        let (mut session, _transport, _rx) = synced_controller();
        let host = Peer::new("host-1", "Studio Mac");
        let stale_generation = session.generation();

        session.dismiss();
        assert_eq!(session.state(), SessionState::Closed);

        // a payload that was already queued when dismiss ran
        session.handle_transport(TransportEvent::Received {
            peer: host,
            generation: stale_generation,
            payload: demo_set().encode(),
        });
        assert!(session.params().is_none());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn reconnect_after_close_starts_fresh() {
        let (mut session, _transport, _rx) = synced_controller();
        session.dismiss();
        let next = Peer::new("host-2", "Other Mac");
        session.connect(next.clone()).unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.peer(), Some(&next));
    }

    #[test]
    fn connect_failure_returns_to_idle() {
        let (mut session, _transport, mut rx) = controller();
        let host = Peer::new("host-1", "Studio Mac");
        session.connect(host.clone()).unwrap();
        let generation = session.generation();
        session.handle_transport(TransportEvent::ConnectFailed {
            peer: host,
            generation,
            reason: "invite timed out".into(),
        });
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.peer().is_none());
        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SyncEvent::ConnectionFailed(_)) {
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[test]
    fn set_value_fires_one_change_event() {
        let (mut session, _transport, mut rx) = synced_controller();
        while rx.try_recv().is_ok() {}

        let key = TweakKey::new("UI", "Colors", "bgAlpha");
        session.set_value(&key, TweakValue::Double(0.5)).unwrap();

        let mut changes = 0;
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::ValueChanged(changed) = event {
                assert_eq!(changed, key);
                changes += 1;
            }
        }
        assert_eq!(changes, 1);
    }

    #[test]
    fn remote_merge_emits_values_updated() {
        let (mut session, transport, mut rx) = synced_controller();
        while rx.try_recv().is_ok() {}
        let _ = transport;

        let mut remote = demo_set();
        remote
            .set_value(&TweakKey::new("UI", "Colors", "bgAlpha"), TweakValue::Double(0.25))
            .unwrap();
        let generation = session.generation();
        session.handle_transport(TransportEvent::Received {
            peer: Peer::new("host-1", "Studio Mac"),
            generation,
            payload: remote.encode(),
        });

        match rx.try_recv().unwrap() {
            SyncEvent::ValuesUpdated(keys) => {
                assert_eq!(keys, vec![TweakKey::new("UI", "Colors", "bgAlpha")]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn full_state_send_is_skipped_when_not_synced() {
        let (session, transport, _rx) = controller();
        session.send_full_state(Reliability::Unreliable);
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn full_state_send_covers_entire_set() {
        let (mut session, transport, _rx) = synced_controller();
        let key = TweakKey::new("UI", "Colors", "bgAlpha");
        session.set_value(&key, TweakValue::Double(0.5)).unwrap();
        session.send_full_state(Reliability::Unreliable);

        let decoded = ParameterSet::decode(&transport.last_payload()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(
            decoded.get(&key).unwrap().value,
            TweakValue::Double(0.5)
        );
    }
}
