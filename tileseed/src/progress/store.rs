//! Persistence of progress identifiers between runs.
//!
//! The on-disk format is a single JSON object mapping task ids to
//! identifiers:
//!
//! ```json
//! { "roads": [[0, 2], [1, 4]] }
//! ```
//!
//! Every save rewrites the whole file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use super::ProgressIdentifier;

/// Errors reading or writing a progress file.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("progress file I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid progress file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Keyed storage of progress identifiers.
pub trait ProgressStore: Send + Sync {
    fn store(&self, task_id: &str, identifier: ProgressIdentifier);

    fn get(&self, task_id: &str) -> Option<ProgressIdentifier>;

    /// Forgets a finished task.
    fn remove(&self, task_id: &str);

    /// Persists all entries.
    fn save(&self) -> Result<(), StoreError>;
}

/// [`ProgressStore`] backed by one JSON file.
#[derive(Debug)]
pub struct JsonProgressStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, ProgressIdentifier>>,
}

impl JsonProgressStore {
    /// Opens the store, loading existing entries. A missing file is empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| StoreError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        debug!(path = %path.display(), entries = entries.len(), "Opened progress store");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Starts empty, ignoring any existing file. The file is replaced on the
    /// first save.
    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl ProgressStore for JsonProgressStore {
    fn store(&self, task_id: &str, identifier: ProgressIdentifier) {
        self.entries.lock().insert(task_id.to_string(), identifier);
    }

    fn get(&self, task_id: &str) -> Option<ProgressIdentifier> {
        self.entries.lock().get(task_id).cloned()
    }

    fn remove(&self, task_id: &str) {
        self.entries.lock().remove(task_id);
    }

    fn save(&self) -> Result<(), StoreError> {
        let json = {
            let entries = self.entries.lock();
            serde_json::to_string_pretty(&*entries).map_err(|source| StoreError::Parse {
                path: self.path.clone(),
                source,
            })?
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| StoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonProgressStore::open(dir.path().join("none.json")).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.get("x"), None);
    }

    #[test]
    fn test_save_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("progress.json");
        let store = JsonProgressStore::open(&path).unwrap();
        store.store("a", ProgressIdentifier::from(vec![(0, 2), (1, 4)]));
        store.store("b", ProgressIdentifier::from(vec![(3, 4)]));
        store.store("a", ProgressIdentifier::from(vec![(1, 2)]));
        store.save().unwrap();

        let reopened = JsonProgressStore::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("a"), Some(ProgressIdentifier::from(vec![(1, 2)])));
        assert_eq!(reopened.get("b"), Some(ProgressIdentifier::from(vec![(3, 4)])));
    }

    #[test]
    fn test_remove_then_save_drops_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        let store = JsonProgressStore::open(&path).unwrap();
        store.store("a", ProgressIdentifier::from(vec![(0, 4)]));
        store.save().unwrap();
        store.remove("a");
        store.save().unwrap();

        assert!(JsonProgressStore::open(&path).unwrap().is_empty());
    }

    #[test]
    fn test_create_ignores_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        fs::write(&path, r#"{"a": [[1, 4]]}"#).unwrap();

        assert_eq!(JsonProgressStore::open(&path).unwrap().len(), 1);
        assert!(JsonProgressStore::create(&path).is_empty());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonProgressStore::open(&path),
            Err(StoreError::Parse { .. })
        ));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_store_round_trip(
                entries in prop::collection::btree_map(
                    "[a-z]{1,8}",
                    prop::collection::vec((0u32..16, 1u32..17), 0..6),
                    1..5,
                ),
            ) {
                let dir = TempDir::new().unwrap();
                let path = dir.path().join("progress.json");
                let store = JsonProgressStore::open(&path).unwrap();
                for (id, steps) in &entries {
                    store.store(id, ProgressIdentifier::from(steps.clone()));
                }
                store.save().unwrap();

                let reopened = JsonProgressStore::open(&path).unwrap();
                for (id, steps) in &entries {
                    prop_assert_eq!(
                        reopened.get(id),
                        Some(ProgressIdentifier::from(steps.clone()))
                    );
                }
            }
        }
    }
}
