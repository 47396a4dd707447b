//! Remote control for live tweak parameters over a LAN.
//!
//! One device (the host) owns a set of named, typed, bounded tweak values;
//! another (the controller) discovers it over mDNS, opens a QUIC session,
//! receives the full set as a seed, and pushes edits back. Every change is
//! resent as full state, so a lost message is simply superseded by the next
//! one.
//!
//! All core state lives on a single service task; discovery callbacks,
//! transport events and UI commands are funneled through it, so the state
//! machine itself is written as plain single-threaded code.

mod broadcaster;
mod directory;
mod discovery;
mod error;
mod events;
mod params;
mod peer;
mod protocol;
mod session;
mod transport;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use mdns_sd::ServiceEvent;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use broadcaster::ChangeBroadcaster;
pub use directory::PeerDirectory;
pub use discovery::{Discovery, ATTR_ID, ATTR_NAME, HOST_SERVICE_TYPE, SPECTATOR_SERVICE_TYPE};
pub use error::{DecodeError, ServiceError, SessionError, TransportError, TweakError};
pub use events::SyncEvent;
pub use params::{Bounds, ParameterSet, TweakDescriptor, TweakKey, TweakKind, TweakValue};
pub use peer::{Peer, PeerRecord};
pub use protocol::{Frame, WireTweak};
pub use session::{Role, SessionState, SyncSession};
pub use transport::{
    LanTransport, Reliability, SessionTransport, TransportEvent, INVITE_TIMEOUT,
};

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Friendly name other devices see; defaults to the system hostname.
    pub display_name: Option<String>,
    /// UDP port for the QUIC endpoint; 0 picks an ephemeral one.
    pub port: u16,
}

enum Command {
    Connect {
        peer_id: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    SetValue {
        key: TweakKey,
        value: TweakValue,
        reply: oneshot::Sender<Result<(), TweakError>>,
    },
    Dismiss,
}

/// Handle to a running tweaksync service. Cheap to clone; all methods just
/// post to the service task.
#[derive(Clone)]
pub struct TweakSync {
    local: Peer,
    commands: mpsc::Sender<Command>,
    events: events::EventSender,
}

impl TweakSync {
    /// Starts a host: advertises on mDNS and waits for a controller to
    /// invite itself. Must be called within a tokio runtime.
    pub fn start_host(config: Config, initial: ParameterSet) -> Result<Self, TransportError> {
        Self::start(Role::Host, config, Some(initial))
    }

    /// Starts a controller: browses for hosts and exposes `connect`.
    pub fn start_controller(config: Config) -> Result<Self, TransportError> {
        Self::start(Role::Controller, config, None)
    }

    fn start(
        role: Role,
        config: Config,
        initial: Option<ParameterSet>,
    ) -> Result<Self, TransportError> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let device_id = format!("tweak-{}", Uuid::new_v4().simple());
        let display_name = config.display_name.unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "Unknown Device".to_string())
        });
        let local = Peer::new(device_id.clone(), display_name.clone());

        let (transport, transport_rx) = LanTransport::start(config.port, local.clone())?;
        let port = transport.local_addr()?.port();
        info!(id = %device_id, port, ?role, "tweaksync starting");

        let mut discovery = Discovery::new()?;
        let browse = match role {
            Role::Host => {
                discovery.register(&device_id, &display_name, port)?;
                None
            }
            Role::Controller => Some(discovery.browse()?),
        };

        let (events, _) = events::channel();
        let (commands, cmd_rx) = mpsc::channel(64);

        let session_transport: Arc<dyn SessionTransport> = transport.clone();
        let session = match initial {
            Some(set) => SyncSession::host(set, session_transport, events.clone()),
            None => SyncSession::controller(session_transport, events.clone()),
        };

        let service = ServiceLoop {
            session,
            directory: PeerDirectory::new(events.clone()),
            broadcaster: ChangeBroadcaster::new(),
            transport,
            transport_rx,
            cmd_rx,
            browse,
            local: local.clone(),
            _discovery: discovery,
        };
        tokio::spawn(service.run());

        Ok(Self {
            local,
            commands,
            events,
        })
    }

    pub fn local_peer(&self) -> &Peer {
        &self.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Invite the given discovered host. Fails with `Busy` while another
    /// session is in flight.
    pub async fn connect(&self, peer_id: impl Into<String>) -> Result<(), ServiceError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Connect {
                peer_id: peer_id.into(),
                reply,
            })
            .await
            .map_err(|_| ServiceError::Stopped)?;
        response.await.map_err(|_| ServiceError::Stopped)??;
        Ok(())
    }

    /// Edit a tweak locally; on success the change is pushed to the
    /// connected peer as a full-state resync.
    pub async fn set_value(&self, key: TweakKey, value: TweakValue) -> Result<(), ServiceError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::SetValue { key, value, reply })
            .await
            .map_err(|_| ServiceError::Stopped)?;
        response.await.map_err(|_| ServiceError::Stopped)??;
        Ok(())
    }

    /// Tear the current session down. No-op when idle.
    pub async fn dismiss(&self) -> Result<(), ServiceError> {
        self.commands
            .send(Command::Dismiss)
            .await
            .map_err(|_| ServiceError::Stopped)
    }
}

/// The single owner of all mutable core state. Every external event source
/// funnels into `run`'s select loop; nothing here blocks.
struct ServiceLoop {
    session: SyncSession,
    directory: PeerDirectory,
    broadcaster: ChangeBroadcaster,
    transport: Arc<LanTransport>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    cmd_rx: mpsc::Receiver<Command>,
    browse: Option<mdns_sd::Receiver<ServiceEvent>>,
    local: Peer,
    // kept alive so the mDNS advertisement is withdrawn on shutdown
    _discovery: Discovery,
}

/// One drained input per loop turn; picked apart outside the select so the
/// handlers can borrow the whole service.
enum Input {
    Command(Option<Command>),
    Transport(TransportEvent),
    Mdns(Option<ServiceEvent>),
}

impl ServiceLoop {
    async fn run(mut self) {
        loop {
            let input = tokio::select! {
                cmd = self.cmd_rx.recv() => Input::Command(cmd),
                Some(event) = self.transport_rx.recv() => Input::Transport(event),
                event = recv_browse(&self.browse) => Input::Mdns(event),
            };
            match input {
                Input::Command(None) => break, // every handle dropped
                Input::Command(Some(cmd)) => self.handle_command(cmd),
                Input::Transport(event) => self.handle_transport(event),
                Input::Mdns(Some(event)) => self.handle_mdns(event),
                Input::Mdns(None) => self.browse = None,
            }
            // one outbound resync at most per processed event
            self.broadcaster.flush(&self.session);
            self.directory
                .set_connected(self.session.peer().map(|p| p.id.clone()));
        }
        debug!("service loop stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { peer_id, reply } => {
                let result = match self.directory.get(&peer_id) {
                    Some(record) => self.session.connect(record.peer.clone()),
                    None => Err(SessionError::UnknownPeer),
                };
                let _ = reply.send(result);
            }
            Command::SetValue { key, value, reply } => {
                let result = self.session.set_value(&key, value);
                if result.is_ok() {
                    self.broadcaster.note_change(key);
                }
                let _ = reply.send(result);
            }
            Command::Dismiss => self.session.dismiss(),
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::InviteReceived { peer } => {
                if self.session.role() != Role::Host {
                    warn!(peer = %peer.id, "ignoring invitation, not a host");
                    return;
                }
                match self.session.accept(peer.clone()) {
                    Ok(()) => {}
                    Err(SessionError::Busy) => {
                        // turn it down explicitly so the inviter stops waiting
                        warn!(peer = %peer.id, "busy, rejecting invitation");
                        self.transport.reject(&peer.id);
                    }
                    Err(e) => {
                        warn!(peer = %peer.id, "invitation rejected: {e}");
                        self.transport.reject(&peer.id);
                    }
                }
            }
            other => self.session.handle_transport(other),
        }
    }

    fn handle_mdns(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let Some(ip) = info.get_addresses().iter().next() else {
                    return;
                };
                let id = info
                    .get_property_val_str(ATTR_ID)
                    .unwrap_or("unknown")
                    .to_string();
                if id == self.local.id {
                    return; // found ourselves
                }
                let advertised_name = info
                    .get_property_val_str(ATTR_NAME)
                    .map(|s| s.to_string());
                let addr = SocketAddr::new(
                    ip.to_string()
                        .parse()
                        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                    info.get_port(),
                );
                self.transport.note_peer_addr(&id, addr);
                let peer = Peer::new(id, info.get_hostname().trim_end_matches('.'));
                self.directory.on_peer_seen(peer, advertised_name);
            }
            ServiceEvent::ServiceRemoved(_ty, fullname) => {
                let id = fullname.split('.').next().unwrap_or("unknown");
                if self.directory.on_peer_lost(id) {
                    self.session.peer_lost(id);
                }
            }
            _ => {}
        }
    }
}

async fn recv_browse(rx: &Option<mdns_sd::Receiver<ServiceEvent>>) -> Option<ServiceEvent> {
    match rx {
        Some(rx) => rx.recv_async().await.ok(),
        None => std::future::pending().await,
    }
}
