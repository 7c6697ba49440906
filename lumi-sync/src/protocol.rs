//! Textual wire protocol shared by client and peer connections.
//!
//! Every frame is a single JSON object:
//! ```text
//! {
//!   "type":     "note_created" | "note_updated" | "note_deleted"
//!               | "folder_updated" | "subscribe",
//!   "note":     { id, title, created_at, updated_at, tags[], content },   (optional)
//!   "origin":   "<server identity>",                                       (optional)
//!   "event_id": "<uuid>"                                                   (optional)
//! }
//! ```
//!
//! Decoding is lenient: unknown `type` strings map to [`EventKind::Unknown`],
//! and missing, `null` or empty fields fall back to their defaults so that a
//! sloppy sender never tears down a connection.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Event types carried in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NoteCreated,
    NoteUpdated,
    NoteDeleted,
    FolderUpdated,
    /// Client control message announcing interest in events.
    Subscribe,
    /// Anything this build does not understand.
    #[default]
    #[serde(other)]
    Unknown,
}

impl EventKind {
    /// Whether a peer event of this kind mutates note storage.
    pub fn is_note_event(self) -> bool {
        matches!(
            self,
            Self::NoteCreated | Self::NoteUpdated | Self::NoteDeleted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoteCreated => "note_created",
            Self::NoteUpdated => "note_updated",
            Self::NoteDeleted => "note_deleted",
            Self::FolderUpdated => "folder_updated",
            Self::Subscribe => "subscribe",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a running server instance.
///
/// Only used as a loop-prevention tag; compare it, never interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerIdentity(String);

impl ServerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identity: 16 lowercase hex characters.
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self::new(&hex[..16])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerIdentity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ServerIdentity {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Value copy of a note at the moment an event was produced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NoteSnapshot {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<NoteSnapshot>,
    #[serde(
        default,
        skip_serializing_if = "ServerIdentity::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub origin: ServerIdentity,
    /// Unique per first-generation event; lets receivers drop duplicates
    /// arriving over more than one peer link.
    #[serde(
        default,
        skip_serializing_if = "String::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub event_id: String,
}

impl Message {
    /// A locally produced event. Origin and event id are stamped by the hub.
    pub fn local(kind: EventKind, note: Option<NoteSnapshot>) -> Self {
        Self {
            kind,
            note,
            ..Self::default()
        }
    }

    /// Client subscription request. Carries no payload.
    pub fn subscribe() -> Self {
        Self::local(EventKind::Subscribe, None)
    }

    /// Set origin and event id if the producer left them empty.
    ///
    /// Returns true if this call marked the message as first-generation.
    pub fn stamp(&mut self, identity: &ServerIdentity) -> bool {
        let fresh = self.origin.is_empty();
        if fresh {
            self.origin = identity.clone();
        }
        if self.event_id.is_empty() {
            self.event_id = Uuid::new_v4().to_string();
        }
        fresh
    }

    pub fn note_id(&self) -> Option<&str> {
        self.note.as_ref().map(|n| n.id.as_str())
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// Empty strings and nulls become the Unix epoch.
pub(crate) fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(DateTime::<Utc>::default()),
        Some(s) if s.trim().is_empty() => Ok(DateTime::<Utc>::default()),
        Some(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom),
    }
}
