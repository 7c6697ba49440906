//! Replication links to other servers.
//!
//! Every configured peer address gets its own supervised session task:
//!
//! ```text
//!   start([addr..]) ──► session(addr) ──► dial ──► register(Peer) ──► read loop
//!                           ▲                                            │
//!                           └──────── sleep(reconnect_delay) ◄── closed ─┘
//! ```
//!
//! Frames read from a peer link, outbound or inbound, go through
//! [`PeerManager::apply_peer_event`], which writes them to note storage and
//! forwards them to local clients only. Forwarded events never reach other
//! peers, so an event travels at most one hop from the server that produced
//! it.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use crate::connection::{self, Role};
use crate::hub::Hub;
use crate::protocol::{EventKind, Message, NoteSnapshot, ServerIdentity};
use crate::storage::{NoteStore, StoreError};

/// Query parameter a dialing server uses to name itself.
pub const SERVER_ID_PARAM: &str = "server_id";

/// Peer session tuning.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Fixed wait between a lost or failed link and the next dial
    pub reconnect_delay: Duration,
    /// Event ids remembered for duplicate suppression
    pub seen_capacity: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            seen_capacity: 4096,
        }
    }
}

/// Link state of one outbound session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the reconnect delay.
    Reconnecting,
    /// Address could not be parsed; the session has ended.
    Invalid,
}

/// Observable status of one outbound session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSession {
    pub address: String,
    pub state: ConnectionState,
    /// Dial attempts so far
    pub attempts: u64,
    pub last_error: Option<String>,
}

/// What [`PeerManager::apply_peer_event`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Storage updated and the event forwarded to local clients.
    Applied,
    /// Produced by this server; dropped.
    SelfEcho,
    /// Already seen over another link; dropped.
    Duplicate,
    /// No note payload; dropped.
    NoPayload,
    /// Not a note event; dropped.
    Ignored,
    /// Update or delete for a note this server does not have; dropped.
    NotFound,
    /// Storage rejected the change; dropped.
    StoreFailed,
}

/// Peer link errors.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("invalid peer address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("failed to connect to peer {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
}

/// Bounded FIFO set of recently applied event ids.
#[derive(Debug)]
struct SeenEvents {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenEvents {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            ids: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Record `id`, evicting the oldest entry when full. Returns false if it
    /// was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string())
    }
}

struct Inner {
    hub: Hub,
    store: Arc<dyn NoteStore>,
    identity: ServerIdentity,
    config: PeerConfig,
    /// Held for the whole replay, so copies arriving over different links
    /// are applied one after another.
    seen: Mutex<SeenEvents>,
    sessions: StdRwLock<Vec<PeerSession>>,
}

/// Outbound peer sessions plus the replay logic shared with inbound links.
#[derive(Clone)]
pub struct PeerManager {
    inner: Arc<Inner>,
}

impl PeerManager {
    /// Manager identified by the hub's identity.
    pub fn new(hub: Hub, store: Arc<dyn NoteStore>, config: PeerConfig) -> Self {
        let identity = hub.identity().clone();
        let seen = SeenEvents::new(config.seen_capacity);
        Self {
            inner: Arc::new(Inner {
                hub,
                store,
                identity,
                config,
                seen: Mutex::new(seen),
                sessions: StdRwLock::new(Vec::new()),
            }),
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.inner.identity
    }

    /// Spawn one session per address on the current runtime and return.
    ///
    /// Sessions retry forever; abort the returned handles to stop them.
    pub fn start<I, A>(&self, addresses: I) -> Vec<JoinHandle<()>>
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        let mut handles = Vec::new();
        for address in addresses {
            let address = address.into();
            let slot = {
                let mut sessions = self.inner.sessions.write().unwrap_or_else(PoisonError::into_inner);
                sessions.push(PeerSession {
                    address: address.clone(),
                    state: ConnectionState::Disconnected,
                    attempts: 0,
                    last_error: None,
                });
                sessions.len() - 1
            };
            let manager = self.clone();
            handles.push(tokio::spawn(async move {
                manager.run_session(slot, address).await;
            }));
        }
        handles
    }

    /// Status of every outbound session, in start order.
    pub fn sessions(&self) -> Vec<PeerSession> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run_session(&self, slot: usize, address: String) {
        let url = match session_url(&address, &self.inner.identity) {
            Ok(url) => url,
            Err(e) => {
                log::error!("{e}; peer will not be contacted");
                self.update(slot, |s| {
                    s.state = ConnectionState::Invalid;
                    s.last_error = Some(e.to_string());
                });
                return;
            }
        };

        let delay = self.inner.config.reconnect_delay;
        loop {
            self.update(slot, |s| {
                s.state = ConnectionState::Connecting;
                s.attempts += 1;
            });

            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _response)) => {
                    log::info!("Connected to peer {address}");
                    self.update(slot, |s| {
                        s.state = ConnectionState::Connected;
                        s.last_error = None;
                    });

                    let on_message = move |msg: Message| async move {
                        self.apply_peer_event(msg).await;
                    };
                    connection::pump(ws, &self.inner.hub, Role::Peer, &address, on_message).await;

                    log::warn!("Peer connection to {address} lost, reconnecting in {delay:?}");
                }
                Err(source) => {
                    let e = PeerError::Connect {
                        address: address.clone(),
                        source,
                    };
                    log::warn!("{e}; retrying in {delay:?}");
                    self.update(slot, |s| s.last_error = Some(e.to_string()));
                }
            }

            self.update(slot, |s| s.state = ConnectionState::Reconnecting);
            tokio::time::sleep(delay).await;
        }
    }

    fn update(&self, slot: usize, f: impl FnOnce(&mut PeerSession)) {
        let mut sessions = self.inner.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.get_mut(slot) {
            f(session);
        }
    }

    /// Read loop for a peer that dialed this server.
    ///
    /// The link is registered as a peer and its frames replayed exactly like
    /// those of an outbound session.
    pub async fn serve_inbound<S>(&self, ws: WebSocketStream<S>, remote: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let label = format!("inbound from {remote}");
        let on_message = move |msg: Message| async move {
            self.apply_peer_event(msg).await;
        };
        connection::pump(ws, &self.inner.hub, Role::Peer, &label, on_message).await;
    }

    /// Replay one event received from a peer.
    ///
    /// Failures are logged and only affect this event. An event id is only
    /// remembered once its change has been applied, so a copy that failed
    /// (say, an update that overtook its create) can still succeed later.
    pub async fn apply_peer_event(&self, message: Message) -> ApplyOutcome {
        if message.origin == self.inner.identity {
            return ApplyOutcome::SelfEcho;
        }
        let Some(note) = message.note.clone() else {
            return ApplyOutcome::NoPayload;
        };
        if !message.kind.is_note_event() {
            log::trace!("Ignoring peer {} event", message.kind);
            return ApplyOutcome::Ignored;
        }

        let mut seen = self.inner.seen.lock().await;
        let tracked = !message.event_id.is_empty();
        if tracked && seen.contains(&message.event_id) {
            log::debug!(
                "Duplicate {} event {} for {}",
                message.kind,
                message.event_id,
                note.id
            );
            return ApplyOutcome::Duplicate;
        }

        let store = self.inner.store.clone();
        let kind = message.kind;
        let id = note.id.clone();
        let result = tokio::task::spawn_blocking(move || replay(store.as_ref(), kind, &note)).await;

        match result {
            Ok(Ok(())) => {
                if tracked {
                    seen.insert(&message.event_id);
                }
                drop(seen);
                log::debug!("Applied peer {kind} for {id} from {}", message.origin);
                self.inner.hub.broadcast_to_clients_only(message).await;
                ApplyOutcome::Applied
            }
            Ok(Err(StoreError::NotFound(missing))) => {
                log::warn!("Peer sync: note {missing} not found locally for {kind}");
                ApplyOutcome::NotFound
            }
            Ok(Err(e)) => {
                log::warn!("Peer sync: {kind} for {id} failed: {e}");
                ApplyOutcome::StoreFailed
            }
            Err(e) => {
                log::error!("Peer sync: {kind} for {id} aborted: {e}");
                ApplyOutcome::StoreFailed
            }
        }
    }
}

/// Write one peer change to storage. Runs on the blocking pool.
fn replay(store: &dyn NoteStore, kind: EventKind, snapshot: &NoteSnapshot) -> Result<(), StoreError> {
    match kind {
        EventKind::NoteCreated => {
            let mut note = store.create_note(store.root(), &snapshot.id, &snapshot.title)?;
            note.content = snapshot.content.clone();
            note.tags = snapshot.tags.clone();
            store.write_note(&note)
        }
        EventKind::NoteUpdated => {
            let path = store.find_note_path(&snapshot.id)?;
            let mut note = store.read_note(&path)?;
            note.title = snapshot.title.clone();
            note.content = snapshot.content.clone();
            note.tags = snapshot.tags.clone();
            note.updated_at = snapshot.updated_at;
            store.write_note(&note)
        }
        EventKind::NoteDeleted => {
            let path = store.find_note_path(&snapshot.id)?;
            store.delete_note(&path)
        }
        _ => Ok(()),
    }
}

/// Dial URL for `address` carrying this server's identity.
pub fn session_url(address: &str, identity: &ServerIdentity) -> Result<Url, PeerError> {
    let invalid = |reason: String| PeerError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    let mut url = Url::parse(address.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != SERVER_ID_PARAM)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(SERVER_ID_PARAM, identity.as_str());
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionHandle, OutboundQueue};
    use crate::hub::HubConfig;
    use crate::storage::FsNoteStore;
    use chrono::{TimeZone, Utc};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<FsNoteStore>,
        hub: Hub,
        manager: PeerManager,
    }

    fn fixture(identity: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsNoteStore::open(dir.path()).unwrap());
        let hub = Hub::spawn(ServerIdentity::from(identity), HubConfig::default());
        let manager = PeerManager::new(hub.clone(), store.clone(), PeerConfig::default());
        Fixture {
            _dir: dir,
            store,
            hub,
            manager,
        }
    }

    async fn attach(hub: &Hub, role: Role) -> OutboundQueue {
        let (handle, rx) = ConnectionHandle::new(16);
        hub.register(handle, role).await;
        rx
    }

    fn event(kind: EventKind, id: &str, title: &str, origin: &str) -> Message {
        Message {
            kind,
            note: Some(NoteSnapshot {
                id: id.into(),
                title: title.into(),
                updated_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
                tags: vec!["synced".into()],
                content: format!("{title} body"),
                ..NoteSnapshot::default()
            }),
            origin: ServerIdentity::from(origin),
            event_id: String::new(),
        }
    }

    /// Forces the hub to drain pending commands.
    async fn settle(hub: &Hub) {
        hub.stats().await;
    }

    #[tokio::test]
    async fn test_update_overwrites_and_forwards_to_clients_only() {
        let fx = fixture("srv-B");
        fx.store.create_note(fx.store.root(), "n1", "Old").unwrap();
        let mut client = attach(&fx.hub, Role::Client).await;
        let mut peer = attach(&fx.hub, Role::Peer).await;

        let msg = event(EventKind::NoteUpdated, "n1", "X", "srv-A");
        assert_eq!(fx.manager.apply_peer_event(msg).await, ApplyOutcome::Applied);

        let path = fx.store.find_note_path("n1").unwrap();
        let note = fx.store.read_note(&path).unwrap();
        assert_eq!(note.title, "X");
        assert_eq!(note.content, "X body");
        assert_eq!(note.tags, vec!["synced".to_string()]);
        assert_eq!(
            note.updated_at,
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
        );

        let frame = timeout(Duration::from_secs(1), client.recv())
            .await
            .unwrap()
            .unwrap();
        let forwarded = Message::decode(&frame).unwrap();
        assert_eq!(forwarded.kind, EventKind::NoteUpdated);
        assert_eq!(forwarded.origin.as_str(), "srv-A");

        settle(&fx.hub).await;
        assert!(peer.try_recv().is_err());
        assert!(client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_self_echo_is_dropped() {
        let fx = fixture("srv-B");
        fx.store.create_note(fx.store.root(), "n1", "Old").unwrap();
        let mut client = attach(&fx.hub, Role::Client).await;

        let msg = event(EventKind::NoteUpdated, "n1", "X", "srv-B");
        assert_eq!(fx.manager.apply_peer_event(msg).await, ApplyOutcome::SelfEcho);

        let path = fx.store.find_note_path("n1").unwrap();
        assert_eq!(fx.store.read_note(&path).unwrap().title, "Old");
        settle(&fx.hub).await;
        assert!(client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_update_for_unknown_note_does_not_create() {
        let fx = fixture("srv-B");
        let mut client = attach(&fx.hub, Role::Client).await;

        let msg = event(EventKind::NoteUpdated, "ghost", "X", "srv-A");
        assert_eq!(fx.manager.apply_peer_event(msg).await, ApplyOutcome::NotFound);

        assert!(fx.store.find_note_path("ghost").is_err());
        settle(&fx.hub).await;
        assert!(client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_create_writes_snapshot_content() {
        let fx = fixture("srv-B");
        let msg = event(EventKind::NoteCreated, "n2", "Fresh", "srv-A");
        assert_eq!(fx.manager.apply_peer_event(msg).await, ApplyOutcome::Applied);

        let note = fx
            .store
            .read_note(&fx.store.root().join("n2.md"))
            .unwrap();
        assert_eq!(note.title, "Fresh");
        assert_eq!(note.content, "Fresh body");
        assert_eq!(note.tags, vec!["synced".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let fx = fixture("srv-B");
        let created = fx.store.create_note(fx.store.root(), "n3", "Gone").unwrap();

        let msg = event(EventKind::NoteDeleted, "n3", "Gone", "srv-A");
        assert_eq!(fx.manager.apply_peer_event(msg).await, ApplyOutcome::Applied);
        assert!(!created.path.exists());

        let again = event(EventKind::NoteDeleted, "n3", "Gone", "srv-A");
        assert_eq!(fx.manager.apply_peer_event(again).await, ApplyOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_missing_payload_and_other_kinds() {
        let fx = fixture("srv-B");
        let bare = Message {
            kind: EventKind::NoteCreated,
            origin: ServerIdentity::from("srv-A"),
            ..Message::default()
        };
        assert_eq!(fx.manager.apply_peer_event(bare).await, ApplyOutcome::NoPayload);

        let folder = event(EventKind::FolderUpdated, "f", "Folder", "srv-A");
        assert_eq!(fx.manager.apply_peer_event(folder).await, ApplyOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_applied_once() {
        let fx = fixture("srv-B");
        let mut client = attach(&fx.hub, Role::Client).await;

        let mut msg = event(EventKind::NoteCreated, "n4", "Twice", "srv-A");
        msg.event_id = "evt-1".into();

        assert_eq!(
            fx.manager.apply_peer_event(msg.clone()).await,
            ApplyOutcome::Applied
        );
        assert_eq!(fx.manager.apply_peer_event(msg).await, ApplyOutcome::Duplicate);

        assert!(timeout(Duration::from_secs(1), client.recv()).await.unwrap().is_some());
        settle(&fx.hub).await;
        assert!(client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_apply_does_not_mark_event_seen() {
        let fx = fixture("srv-B");

        // The update overtakes its create.
        let mut update = event(EventKind::NoteUpdated, "n5", "v2", "srv-A");
        update.event_id = "e2".into();
        let mut create = event(EventKind::NoteCreated, "n5", "v1", "srv-A");
        create.event_id = "e1".into();

        assert_eq!(
            fx.manager.apply_peer_event(update.clone()).await,
            ApplyOutcome::NotFound
        );
        assert_eq!(
            fx.manager.apply_peer_event(create.clone()).await,
            ApplyOutcome::Applied
        );
        // A later copy of the update still applies.
        assert_eq!(fx.manager.apply_peer_event(update).await, ApplyOutcome::Applied);
        assert_eq!(fx.manager.apply_peer_event(create).await, ApplyOutcome::Duplicate);

        let path = fx.store.find_note_path("n5").unwrap();
        let note = fx.store.read_note(&path).unwrap();
        assert_eq!(note.title, "v2");
        assert_eq!(note.content, "v2 body");
    }

    #[test]
    fn test_seen_events_evicts_oldest() {
        let mut seen = SeenEvents::new(2);
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("c"));
        // "a" was evicted by "c".
        assert!(seen.insert("a"));
        assert!(!seen.insert("c"));
    }

    #[test]
    fn test_session_url_appends_identity() {
        let id = ServerIdentity::from("srv-A");
        let url = session_url("ws://peer:8080/ws/peer", &id).unwrap();
        assert_eq!(url.as_str(), "ws://peer:8080/ws/peer?server_id=srv-A");

        let url = session_url("ws://peer/ws/peer?x=1&server_id=old", &id).unwrap();
        assert_eq!(url.as_str(), "ws://peer/ws/peer?x=1&server_id=srv-A");
    }

    #[test]
    fn test_session_url_rejects_bad_addresses() {
        let id = ServerIdentity::from("srv-A");
        assert!(matches!(
            session_url("not a url", &id),
            Err(PeerError::InvalidAddress { .. })
        ));
        assert!(matches!(
            session_url("http://peer/ws/peer", &id),
            Err(PeerError::InvalidAddress { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_address_ends_session() {
        let fx = fixture("srv-A");
        let handles = fx.manager.start(["::bad::"]);
        for handle in handles {
            timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        }

        let sessions = fx.manager.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, ConnectionState::Invalid);
        assert_eq!(sessions[0].attempts, 0);
        assert!(sessions[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_invalid_address_does_not_block_other_peers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            // Keep the link open until the test ends.
            std::future::pending::<()>().await;
            drop(ws);
        });

        let fx = fixture("srv-A");
        let handles = fx
            .manager
            .start(["::bad::".to_string(), format!("ws://{addr}/ws/peer")]);

        timeout(Duration::from_secs(5), async {
            loop {
                if fx.manager.sessions()[1].state == ConnectionState::Connected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let sessions = fx.manager.sessions();
        assert_eq!(sessions[0].address, "::bad::");
        assert_eq!(sessions[0].state, ConnectionState::Invalid);
        assert_eq!(sessions[1].attempts, 1);
        assert!(sessions[1].last_error.is_none());

        for handle in handles {
            handle.abort();
        }
        server.abort();
    }

    #[tokio::test]
    async fn test_failed_dial_is_retried() {
        // Accepts TCP and hangs up without a handshake.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = tokio::spawn(async move {
            let mut count = 0;
            while count < 2 {
                let (socket, _) = listener.accept().await.unwrap();
                drop(socket);
                count += 1;
            }
            count
        });

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsNoteStore::open(dir.path()).unwrap());
        let hub = Hub::spawn(ServerIdentity::from("srv-A"), HubConfig::default());
        let manager = PeerManager::new(
            hub,
            store,
            PeerConfig {
                reconnect_delay: Duration::from_millis(50),
                ..PeerConfig::default()
            },
        );

        let handles = manager.start([format!("ws://{addr}/ws/peer")]);
        assert_eq!(timeout(Duration::from_secs(5), accepts).await.unwrap().unwrap(), 2);

        let session = manager.sessions().remove(0);
        assert!(session.attempts >= 2);
        assert!(session.last_error.is_some());
        assert_ne!(session.state, ConnectionState::Connected);

        for handle in handles {
            handle.abort();
        }
    }
}
