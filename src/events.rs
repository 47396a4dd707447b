use tokio::sync::broadcast;

use crate::params::{ParameterSet, TweakKey};
use crate::peer::PeerRecord;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Everything the core reports to the presentation layer. The core never
/// touches UI; subscribers own all thread-affinity concerns.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Full snapshot of currently-visible peers. Consumers should treat this
    /// as a set keyed by peer id; there is no ordering guarantee.
    PeersChanged(Vec<PeerRecord>),
    /// The peer we were connected to disappeared from discovery.
    ConnectedPeerLost(String),
    /// First payload from the host decoded and adopted.
    SeedReceived(ParameterSet),
    /// Steady-state inbound merge changed these keys.
    ValuesUpdated(Vec<TweakKey>),
    /// A local edit went through.
    ValueChanged(TweakKey),
    ConnectionFailed(String),
    /// Recoverable protocol-level failure (e.g. undecodable payload); the
    /// session stays up.
    ProtocolError(String),
    /// The session is gone; a fresh connect may follow.
    Closed,
}

pub type EventSender = broadcast::Sender<SyncEvent>;

pub fn channel() -> (EventSender, broadcast::Receiver<SyncEvent>) {
    broadcast::channel(EVENT_CHANNEL_SIZE)
}
