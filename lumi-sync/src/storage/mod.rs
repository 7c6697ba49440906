//! Note storage collaborator.
//!
//! The sync core never touches files itself; it goes through [`NoteStore`].
//! [`FsNoteStore`] is the flat-file implementation:
//!
//! ```text
//! <root>/
//! ├── n1.md            ---
//! ├── work/            id: "n1"
//! │   └── n2.md        title: "Groceries"
//! └── ...              created_at: "2024-05-01T09:30:00Z"
//!                      updated_at: "2024-05-01T09:30:00Z"
//!                      tags: ["home"]
//!                      ---
//!
//!                      # Groceries
//! ```
//!
//! Concurrent writers to the same note are not coordinated; the last write
//! wins at the filesystem level.

pub mod fs;
pub mod note;

pub use fs::FsNoteStore;
pub use note::Note;

use std::path::{Path, PathBuf};

/// Operations the sync core needs from note storage.
pub trait NoteStore: Send + Sync {
    /// Directory new peer-replicated notes are created in.
    fn root(&self) -> &Path;

    /// Create and persist an empty note `<dir>/<id>.md`.
    fn create_note(&self, dir: &Path, id: &str, title: &str) -> Result<Note, StoreError>;

    fn read_note(&self, path: &Path) -> Result<Note, StoreError>;

    /// Persist `note` at `note.path`, replacing any existing file.
    fn write_note(&self, note: &Note) -> Result<(), StoreError>;

    fn delete_note(&self, path: &Path) -> Result<(), StoreError>;

    /// Recursive scan below the root for a note with this id.
    ///
    /// First match in sorted path order wins.
    fn find_note_path(&self, id: &str) -> Result<PathBuf, StoreError>;

    /// Readable notes directly inside `dir`; unreadable files are skipped.
    fn list_notes(&self, dir: &Path) -> Result<Vec<Note>, StoreError>;
}

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("note not found: {0}")]
    NotFound(String),
    #[error("invalid note header in {path}: {reason}")]
    InvalidHeader { path: PathBuf, reason: String },
    #[error("failed to encode note {id}: {reason}")]
    Encode { id: String, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
