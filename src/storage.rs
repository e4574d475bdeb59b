//! Durable queue store.
//!
//! A single JSON file holding every entry that has not been acknowledged
//! yet. The whole document is rewritten on each mutation through a
//! temp-file + fsync + rename sequence, so a crash leaves either the old or
//! the new document on disk, never a torn one.

use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{EntryId, QueueEntry, QueueFile};

/// File-backed FIFO of pending entries. In-memory and on-disk state agree
/// after every call that returns `Ok`.
#[derive(Debug)]
pub struct QueueStore {
    path: PathBuf,
    entries: Vec<QueueEntry>,
    /// Top-level keys other than `messages`, written back untouched.
    extra: Map<String, Value>,
}

/// Loose form of the document used on load, so `{}` can be told apart
/// from `{"messages": []}` and normalized.
#[derive(Deserialize)]
struct StoredDocument {
    messages: Option<Vec<QueueEntry>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    messages: &'a [QueueEntry],
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
}

impl QueueStore {
    /// Open the store at `path`, creating an empty document if none exists.
    ///
    /// Existing entries are loaded in their stored order. Any failure to
    /// create, read or parse the document is a `StorageInit` error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| Error::storage_init(&path, e))?;
            }
            let store = Self {
                path,
                entries: Vec::new(),
                extra: Map::new(),
            };
            store
                .persist()
                .map_err(|e| Error::storage_init(&store.path, into_io(e)))?;
            info!(path = %store.path.display(), "created empty queue store");
            return Ok(store);
        }

        let raw = fs::read_to_string(&path).map_err(|e| Error::storage_init(&path, e))?;
        let (entries, extra, normalized) = if raw.trim().is_empty() {
            (Vec::new(), Map::new(), true)
        } else {
            let doc: StoredDocument = serde_json::from_str(&raw)
                .map_err(|e| Error::storage_init(&path, invalid_data(e.to_string())))?;
            match doc.messages {
                Some(messages) => (messages, doc.extra, false),
                None => (Vec::new(), doc.extra, true),
            }
        };

        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert(entry.id.as_str()) {
                return Err(Error::storage_init(
                    &path,
                    invalid_data(format!("duplicate entry id {}", entry.id)),
                ));
            }
        }

        let store = Self {
            path,
            entries,
            extra,
        };
        if normalized {
            store
                .persist()
                .map_err(|e| Error::storage_init(&store.path, into_io(e)))?;
        }

        info!(
            path = %store.path.display(),
            pending = store.entries.len(),
            "loaded queue store"
        );
        Ok(store)
    }

    /// Location of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `content` as JSON and queue it. See [`QueueStore::push_raw`].
    pub fn push<T: Serialize + ?Sized>(&mut self, content: &T) -> Result<EntryId> {
        let content = serde_json::to_string(content)?;
        self.push_raw(content)
    }

    /// Append `content` at the tail and persist.
    ///
    /// Returns only once the document on disk contains the new entry. If
    /// the write fails the entry is dropped from memory too.
    pub fn push_raw(&mut self, content: String) -> Result<EntryId> {
        let id = EntryId::new();
        self.entries.push(QueueEntry {
            id: id.clone(),
            content,
        });

        if let Err(e) = self.persist() {
            self.entries.pop();
            return Err(e);
        }

        debug!(id = %id, pending = self.entries.len(), "entry queued");
        Ok(id)
    }

    /// Delete the entry with `id`. Unknown ids are a no-op.
    pub fn remove(&mut self, id: &EntryId) -> Result<()> {
        let Some(index) = self.entries.iter().position(|e| &e.id == id) else {
            return Ok(());
        };

        let entry = self.entries.remove(index);
        if let Err(e) = self.persist() {
            self.entries.insert(index, entry);
            return Err(e);
        }

        debug!(id = %id, pending = self.entries.len(), "entry removed");
        Ok(())
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The oldest pending entry, without removing it.
    pub fn peek_oldest(&self) -> Option<&QueueEntry> {
        self.entries.first()
    }

    /// All pending entries, oldest first.
    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    /// Snapshot of the current contents as a standalone document.
    pub fn snapshot(&self) -> QueueFile {
        QueueFile {
            messages: self.entries.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn persist(&self) -> Result<()> {
        let body = serde_json::to_vec_pretty(&DocumentRef {
            messages: &self.entries,
            extra: &self.extra,
        })?;
        write_atomic(&self.path, &body)?;
        Ok(())
    }
}

/// Write `body` to a sibling temp file, fsync it, then rename over `path`.
fn write_atomic(path: &Path, body: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| invalid_data(format!("invalid store path {}", path.display())))?;
    let tmp_path = dir.join(format!(".{file_name}.tmp"));

    let result = (|| -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(body)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;

        if let Ok(parent) = fs::File::open(&dir) {
            let _ = parent.sync_all();
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn into_io(err: Error) -> io::Error {
    match err {
        Error::Storage(e) => e,
        other => io::Error::other(other.to_string()),
    }
}
