//! Note model and the text header codec.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::protocol::{lenient_timestamp, null_as_default, NoteSnapshot};

const DELIMITER: &str = "---";

/// A note file as loaded from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tags: Vec<String>,
    /// Location on disk. Not part of the header.
    pub path: PathBuf,
    pub content: String,
}

/// YAML header fields, in the order they are written.
#[derive(Debug, Serialize, Deserialize)]
struct Header {
    #[serde(default, deserialize_with = "null_as_default")]
    id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    title: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    updated_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_default")]
    tags: Vec<String>,
}

impl Note {
    /// Fresh note at `<dir>/<id>.md` with a title heading as its body.
    pub fn new(dir: &Path, id: &str, title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            tags: Vec::new(),
            path: dir.join(format!("{id}.md")),
            content: format!("# {title}\n\n"),
        }
    }

    pub fn snapshot(&self) -> NoteSnapshot {
        NoteSnapshot {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }

    /// Render header and body.
    pub fn render(&self) -> Result<String, StoreError> {
        let header = Header {
            id: self.id.clone(),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            tags: self.tags.clone(),
        };
        let yaml = serde_yaml::to_string(&header).map_err(|e| StoreError::Encode {
            id: self.id.clone(),
            reason: e.to_string(),
        })?;

        let mut out = String::with_capacity(self.content.len() + 160);
        out.push_str(DELIMITER);
        out.push('\n');
        out.push_str(&yaml);
        out.push_str(DELIMITER);
        out.push_str("\n\n");
        out.push_str(&self.content);
        Ok(out)
    }

    /// Parse a note file. The body is trimmed of surrounding whitespace.
    pub fn parse(path: &Path, text: &str) -> Result<Self, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidHeader {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let rest = text
            .trim_start()
            .strip_prefix(DELIMITER)
            .ok_or_else(|| invalid("missing opening delimiter"))?;
        let (header, body) = split_header(rest).ok_or_else(|| invalid("missing closing delimiter"))?;

        let header: Header =
            serde_yaml::from_str(header).map_err(|e| invalid(&e.to_string()))?;
        if header.id.is_empty() {
            return Err(invalid("missing id"));
        }

        Ok(Self {
            id: header.id,
            title: header.title,
            created_at: header.created_at,
            updated_at: header.updated_at,
            tags: header.tags,
            path: path.to_path_buf(),
            content: body.trim().to_string(),
        })
    }
}

/// Split after the opening delimiter into (header, body).
fn split_header(rest: &str) -> Option<(&str, &str)> {
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == DELIMITER && offset > 0 {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}
