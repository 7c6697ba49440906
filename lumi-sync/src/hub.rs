//! Connection registry and event fan-out.
//!
//! Architecture:
//! ```text
//!  HTTP handler ──┐                         ┌──► client queue ──► client socket
//!  PeerManager ───┼──► Command queue ──► HubActor ──► client queue ──► ...
//!  conn tasks ────┘      (mpsc)        (owns maps) └──► peer queue ──► peer socket
//! ```
//!
//! The actor owns the client and peer maps outright. Register, unregister
//! and broadcast requests are processed one at a time in arrival order, so
//! every fan-out sees a consistent membership snapshot and a connection can
//! never be written to after it was removed.
//!
//! Writes never block the loop: each connection has its own bounded queue
//! and a connection whose queue is full or closed is dropped after the
//! fan-out pass that noticed it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;

use crate::connection::{self, ConnectionHandle, ConnectionId, DeliveryError, Frame, Role};
use crate::protocol::{EventKind, Message, NoteSnapshot, ServerIdentity};

/// Hub tuning.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Pending requests the control loop buffers before callers wait
    pub command_capacity: usize,
    /// Frames buffered per connection before it is considered stalled
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_capacity: 256,
            outbound_capacity: 256,
        }
    }
}

/// Snapshot of hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub clients: usize,
    pub peers: usize,
    pub events_broadcast: u64,
    pub frames_delivered: u64,
    pub connections_dropped: u64,
}

/// Which registered connections a broadcast reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    All,
    ClientsOnly,
}

enum Command {
    Register(ConnectionHandle, Role),
    Unregister(ConnectionId, Role),
    Broadcast(Message, Scope),
    Stats(oneshot::Sender<HubStats>),
}

/// Cloneable handle to the hub control loop.
#[derive(Clone)]
pub struct Hub {
    identity: ServerIdentity,
    commands: mpsc::Sender<Command>,
    outbound_capacity: usize,
}

impl Hub {
    /// Start the control loop on the current runtime.
    ///
    /// The loop runs until every `Hub` clone is dropped.
    pub fn spawn(identity: ServerIdentity, config: HubConfig) -> Self {
        let (commands, receiver) = mpsc::channel(config.command_capacity.max(1));
        let actor = HubActor {
            identity: identity.clone(),
            clients: HashMap::new(),
            peers: HashMap::new(),
            stats: HubStats::default(),
            receiver,
        };
        tokio::spawn(actor.run());

        Self {
            identity,
            commands,
            outbound_capacity: config.outbound_capacity,
        }
    }

    /// This server's identity, used to stamp and to recognise own events.
    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn outbound_capacity(&self) -> usize {
        self.outbound_capacity
    }

    /// Add a connection to the registry for its role.
    ///
    /// Register each handle once; ids are unique per handle.
    pub async fn register(&self, conn: ConnectionHandle, role: Role) {
        self.send(Command::Register(conn, role)).await;
    }

    /// Remove and close a connection. Unknown ids are ignored.
    pub async fn unregister(&self, id: ConnectionId, role: Role) {
        self.send(Command::Unregister(id, role)).await;
    }

    /// Announce a local change to every client and every peer.
    pub async fn broadcast_local_event(&self, kind: EventKind, note: Option<NoteSnapshot>) {
        self.broadcast(Message::local(kind, note)).await;
    }

    /// Deliver to every client and every peer, stamping origin if unset.
    pub async fn broadcast(&self, message: Message) {
        self.send(Command::Broadcast(message, Scope::All)).await;
    }

    /// Deliver a forwarded event to local clients only.
    ///
    /// Peers never see it, which stops replication one hop past this server.
    pub async fn broadcast_to_clients_only(&self, message: Message) {
        self.send(Command::Broadcast(message, Scope::ClientsOnly)).await;
    }

    /// Current registry sizes and counters.
    pub async fn stats(&self) -> HubStats {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx)).await;
        rx.await.unwrap_or_default()
    }

    /// Receive loop for a client WebSocket.
    ///
    /// Registers the connection, reads control messages until the socket
    /// errs or closes, then unregisters. Clients receive every event whether
    /// or not they subscribed.
    pub async fn serve_connection<S>(&self, ws: WebSocketStream<S>, label: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        connection::pump(ws, self, Role::Client, label, |msg| async move {
            match msg.kind {
                EventKind::Subscribe => log::info!("Client subscribed"),
                other => log::trace!("Ignoring client message of type {other}"),
            }
        })
        .await;
    }

    async fn send(&self, command: Command) {
        if self.commands.send(command).await.is_err() {
            log::error!("Hub control loop has stopped; request dropped");
        }
    }
}

/// Owner of the registry. Only reachable through [`Command`]s.
struct HubActor {
    identity: ServerIdentity,
    clients: HashMap<ConnectionId, ConnectionHandle>,
    peers: HashMap<ConnectionId, ConnectionHandle>,
    stats: HubStats,
    receiver: mpsc::Receiver<Command>,
}

impl HubActor {
    async fn run(mut self) {
        log::debug!("Hub {} control loop started", self.identity);
        while let Some(command) = self.receiver.recv().await {
            self.handle(command);
        }
        log::debug!("Hub {} control loop stopped", self.identity);
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register(conn, role) => {
                let id = conn.id();
                self.registry(role).insert(id, conn);
                if role == Role::Peer {
                    log::info!("Peer registered (total: {})", self.peers.len());
                } else {
                    log::debug!("Client {id} registered (total: {})", self.clients.len());
                }
            }
            Command::Unregister(id, role) => {
                self.remove(id, role);
            }
            Command::Broadcast(message, scope) => {
                self.deliver(message, scope);
            }
            Command::Stats(reply) => {
                let mut stats = self.stats.clone();
                stats.clients = self.clients.len();
                stats.peers = self.peers.len();
                let _ = reply.send(stats);
            }
        }
    }

    fn registry(&mut self, role: Role) -> &mut HashMap<ConnectionId, ConnectionHandle> {
        match role {
            Role::Client => &mut self.clients,
            Role::Peer => &mut self.peers,
        }
    }

    /// Dropping the handle closes the connection's queue.
    fn remove(&mut self, id: ConnectionId, role: Role) -> bool {
        let removed = self.registry(role).remove(&id).is_some();
        if removed {
            log::debug!("{role} {id} unregistered");
        }
        removed
    }

    fn deliver(&mut self, mut message: Message, scope: Scope) {
        message.stamp(&self.identity);

        let frame: Frame = match message.encode() {
            Ok(text) => Arc::from(text),
            Err(e) => {
                log::error!("Dropping {} event: {e}", message.kind);
                return;
            }
        };

        self.stats.events_broadcast += 1;
        let mut failed = Vec::new();

        fan_out(&self.clients, &frame, Role::Client, &mut failed, &mut self.stats);
        if scope == Scope::All {
            fan_out(&self.peers, &frame, Role::Peer, &mut failed, &mut self.stats);
        }

        for (id, role) in failed {
            if self.remove(id, role) {
                self.stats.connections_dropped += 1;
            }
        }

        log::trace!(
            "Broadcast {} from {} ({:?})",
            message.kind,
            message.origin,
            scope
        );
    }
}

fn fan_out(
    targets: &HashMap<ConnectionId, ConnectionHandle>,
    frame: &Frame,
    role: Role,
    failed: &mut Vec<(ConnectionId, Role)>,
    stats: &mut HubStats,
) {
    for (id, conn) in targets {
        match conn.try_deliver(frame.clone()) {
            Ok(()) => stats.frames_delivered += 1,
            Err(DeliveryError::Full) => {
                log::warn!("{role} {id} is not keeping up; disconnecting");
                failed.push((*id, role));
            }
            Err(DeliveryError::Closed) => {
                log::warn!("{role} {id} write error: connection gone");
                failed.push((*id, role));
            }
        }
    }
}
