//! Flat-file note store: one `<id>.md` file per note below a root directory.

use std::fs;
use std::path::{Path, PathBuf};

use super::{Note, NoteStore, StoreError};

const NOTE_EXTENSION: &str = "md";

/// Filesystem-backed [`NoteStore`].
#[derive(Debug, Clone)]
pub struct FsNoteStore {
    root: PathBuf,
}

impl FsNoteStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root })
    }

    fn is_note_file(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == NOTE_EXTENSION)
    }

    /// Sorted entries of `dir`.
    fn entries(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let mut paths = fs::read_dir(dir)
            .map_err(|e| StoreError::io(dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect::<Vec<_>>();
        paths.sort();
        Ok(paths)
    }

    fn scan(&self, dir: &Path, id: &str) -> Result<Option<PathBuf>, StoreError> {
        for path in Self::entries(dir)? {
            if path.is_dir() {
                if let Some(found) = self.scan(&path, id)? {
                    return Ok(Some(found));
                }
            } else if Self::is_note_file(&path) {
                match self.read_note(&path) {
                    Ok(note) if note.id == id => return Ok(Some(path)),
                    Ok(_) => {}
                    Err(e) => log::trace!("Skipping {}: {e}", path.display()),
                }
            }
        }
        Ok(None)
    }
}

impl NoteStore for FsNoteStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn create_note(&self, dir: &Path, id: &str, title: &str) -> Result<Note, StoreError> {
        let note = Note::new(dir, id, title);
        self.write_note(&note)?;
        Ok(note)
    }

    fn read_note(&self, path: &Path) -> Result<Note, StoreError> {
        let text = fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;
        Note::parse(path, &text)
    }

    fn write_note(&self, note: &Note) -> Result<(), StoreError> {
        let text = note.render()?;
        fs::write(&note.path, text).map_err(|e| StoreError::io(&note.path, e))
    }

    fn delete_note(&self, path: &Path) -> Result<(), StoreError> {
        fs::remove_file(path).map_err(|e| StoreError::io(path, e))
    }

    fn find_note_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        self.scan(&self.root, id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn list_notes(&self, dir: &Path) -> Result<Vec<Note>, StoreError> {
        Ok(Self::entries(dir)?
            .into_iter()
            .filter(|path| path.is_file() && Self::is_note_file(path))
            .filter_map(|path| self.read_note(&path).ok())
            .collect())
    }
}
