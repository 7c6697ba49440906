//! # lumi-sync - Federated note synchronization
//!
//! Keeps connected editors and a fixed set of peer servers informed about
//! note changes, without a coordinator.
//!
//! ## Architecture
//!
//! ```text
//!  editor ──/ws──┐                                    ┌──► editors
//!                ▼                                    │
//!            ┌────────┐  register / broadcast   ┌─────┴──────┐
//!            │ server │ ──────────────────────► │    Hub     │
//!            └───┬────┘                         │ (actor)    │
//!                │ /ws/peer                     └─────┬──────┘
//!                ▼                                    │ full broadcast
//!  ┌─────────────────────┐  clients-only forward      ▼
//!  │    PeerManager      │ ◄───────────────────── peer links ◄──► other servers
//!  │ replay → NoteStore  │
//!  └─────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - JSON wire envelope and server identities
//! - [`connection`] - per-connection outbound queues and socket pump
//! - [`hub`] - connection registry and fan-out
//! - [`peer`] - outbound peer sessions and replay of peer events
//! - [`storage`] - note files on disk
//! - [`server`] - WebSocket endpoints
//! - [`config`] - environment configuration

pub mod config;
pub mod connection;
pub mod hub;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use config::{ConfigError, ServerConfig};
pub use connection::{ConnectionHandle, ConnectionId, DeliveryError, Role};
pub use hub::{Hub, HubConfig, HubStats};
pub use peer::{ApplyOutcome, ConnectionState, PeerConfig, PeerError, PeerManager, PeerSession};
pub use protocol::{EventKind, Message, NoteSnapshot, ProtocolError, ServerIdentity};
pub use server::{NoteServer, ServerError};
pub use storage::{FsNoteStore, Note, NoteStore, StoreError};
