//! Host and controller state machines wired back-to-back through a
//! recording transport, exercising the whole seed/edit/merge flow without a
//! network.

use std::sync::{Arc, Mutex};

use tweaksync::{
    Bounds, ChangeBroadcaster, ParameterSet, Peer, Reliability, SessionState, SessionTransport,
    SyncSession, TransportEvent, TweakDescriptor, TweakKey, TweakValue,
};

/// Records outbound payloads so the test can hand them to the other side.
#[derive(Default)]
struct Recorder {
    outbox: Mutex<Vec<(String, Vec<u8>, Reliability)>>,
}

impl Recorder {
    fn drain(&self) -> Vec<(String, Vec<u8>, Reliability)> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }
}

impl SessionTransport for Recorder {
    fn invite(&self, _peer: &Peer, _generation: u64) {}
    fn accept(&self, _peer: &Peer, _generation: u64) {}
    fn send(&self, peer: &Peer, payload: Vec<u8>, reliability: Reliability) {
        self.outbox
            .lock()
            .unwrap()
            .push((peer.id.clone(), payload, reliability));
    }
    fn close(&self, _peer: &Peer) {}
}

fn host_tweaks() -> ParameterSet {
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

/// Deliver every recorded payload from one side to the other.
fn pump(from: &Recorder, to: &mut SyncSession, counterpart: &Peer) {
    for (_to_id, payload, _reliability) in from.drain() {
        let generation = to.generation();
        to.handle_transport(TransportEvent::Received {
            peer: counterpart.clone(),
            generation,
            payload,
        });
    }
}

#[test]
fn seed_edit_merge_round_trip() {
    let host_peer = Peer::new("host-1", "Studio Mac");
    let controller_peer = Peer::new("ctl-1", "iPhone");

    let host_transport = Arc::new(Recorder::default());
    let controller_transport = Arc::new(Recorder::default());
    let (host_events, _host_rx) = tokio::sync::broadcast::channel(64);
    let (controller_events, _controller_rx) = tokio::sync::broadcast::channel(64);

    let mut host = SyncSession::host(host_tweaks(), host_transport.clone(), host_events);
    let mut controller =
        SyncSession::controller(controller_transport.clone(), controller_events);

    // admission: controller invites, host accepts, both sides connect
    controller.connect(host_peer.clone()).unwrap();
    host.accept(controller_peer.clone()).unwrap();
    let host_generation = host.generation();
    let controller_generation = controller.generation();
    host.handle_transport(TransportEvent::Connected {
        peer: controller_peer.clone(),
        generation: host_generation,
    });
    controller.handle_transport(TransportEvent::Connected {
        peer: host_peer.clone(),
        generation: controller_generation,
    });

    // host went straight to Synced and sent the seed reliably
    assert_eq!(host.state(), SessionState::Synced);
    assert_eq!(controller.state(), SessionState::AwaitingSeed);
    {
        let outbox = host_transport.drain();
        assert_eq!(outbox.len(), 1);
        let (to, payload, reliability) = &outbox[0];
        assert_eq!(to, "ctl-1");
        assert_eq!(*reliability, Reliability::Reliable);
        let generation = controller.generation();
        controller.handle_transport(TransportEvent::Received {
            peer: host_peer.clone(),
            generation,
            payload: payload.clone(),
        });
    }

    // controller registry now equals the host's
    assert_eq!(controller.state(), SessionState::Synced);
    assert_eq!(controller.params(), Some(&host_tweaks()));

    // controller edits, broadcaster pushes full state, host merges
    let key = TweakKey::new("UI", "Colors", "bgAlpha");
    let mut broadcaster = ChangeBroadcaster::new();
    controller.set_value(&key, TweakValue::Double(0.5)).unwrap();
    broadcaster.note_change(key.clone());
    broadcaster.flush(&controller);

    pump(&controller_transport, &mut host, &controller_peer);

    let merged = host.params().unwrap().get(&key).unwrap();
    assert_eq!(merged.value, TweakValue::Double(0.5));
    // metadata stays authoritative on the host
    let bounds = merged.bounds.unwrap();
    assert_eq!(bounds.min, 0.0);
    assert_eq!(bounds.max, 1.0);
    assert_eq!(bounds.step, 0.05);

    // edits flow the other way too: the host is live-editable
    host.set_value(&key, TweakValue::Double(0.75)).unwrap();
    broadcaster.note_change(key.clone());
    broadcaster.flush(&host);
    pump(&host_transport, &mut controller, &host_peer);
    assert_eq!(
        controller.params().unwrap().get(&key).unwrap().value,
        TweakValue::Double(0.75)
    );

    // dismissal clears the controller's seeded copy but not the host's set
    controller.dismiss();
    assert_eq!(controller.state(), SessionState::Closed);
    assert!(controller.params().is_none());
    host.peer_lost("ctl-1");
    assert_eq!(host.state(), SessionState::Closed);
    assert!(host.params().is_some());
}
