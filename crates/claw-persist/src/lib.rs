//! JSON file-backed persistence for claw-watch state.
//!
//! A [`JsonStore`] owns one file, `<state_dir>/<name>.json`. Stores keep their
//! working set in memory and call [`JsonStore::save`] after each mutation
//! batch; on startup they call [`JsonStore::load`] (or
//! [`JsonStore::load_existing`] when "nothing persisted yet" must be told
//! apart from "persisted but empty").

#![forbid(unsafe_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

/// A single named JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    /// Create a store for `<state_path>/<name>.json`.
    ///
    /// The directory is created lazily on the first save.
    pub fn new(state_path: &Path, name: &str) -> Self {
        Self {
            path: state_path.join(format!("{name}.json")),
        }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the backing file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the document, falling back to `T::default()` when the file is
    /// missing or unreadable.
    pub fn load<T>(&self) -> T
    where
        T: DeserializeOwned + Default,
    {
        self.load_existing().unwrap_or_default()
    }

    /// Load the document if a readable one exists.
    ///
    /// Returns `None` for a missing file. A corrupt file is logged and also
    /// yields `None`; it is left in place so it can be inspected.
    pub fn load_existing<T>(&self) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted state");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read persisted state");
                return None;
            }
        };

        match serde_json::from_str(&content) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring corrupt persisted state");
                None
            }
        }
    }

    /// Atomically replace the document with `value`.
    ///
    /// Writes to a sibling temp file and renames it over the target, so a
    /// crash mid-write leaves the previous document intact.
    pub fn save<T>(&self, value: &T) -> io::Result<()>
    where
        T: Serialize + ?Sized,
    {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Delete the backing file if present.
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
