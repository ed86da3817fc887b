// =============================================================================
// Persistence — KeyValueStore + AppendLog traits
// =============================================================================
//
// The core names two small storage contracts rather than embedding a
// database. A concrete durable engine is an external collaborator; what
// ships here is an in-memory implementation (used by tests and as a
// dependency-free default) and a JSON-file-backed implementation so the
// binary has something that survives a restart without requiring external
// infrastructure, the same way the teacher's RuntimeConfig::load/save gives
// a working default without prescribing a database.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};

/// A simple string-keyed store for single-value records (strategy state,
/// credentials metadata, entitlements).
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Helpers for storing/loading serde types through a [`KeyValueStore`].
pub trait KeyValueStoreExt: KeyValueStore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).with_context(|| format!("failed to parse {key}"))?,
            )),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value).context("failed to serialize value")?;
        self.put(key, &raw)
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStoreExt for T {}

/// An append-only sequence of JSON records (trade journal, event log).
pub trait AppendLog: Send + Sync {
    fn append(&self, record: &str) -> Result<()>;
    fn read_all(&self) -> Result<Vec<String>>;
}

/// Helpers for appending/reading serde types through an [`AppendLog`].
pub trait AppendLogExt: AppendLog {
    fn append_json<T: Serialize>(&self, record: &T) -> Result<()> {
        let raw = serde_json::to_string(record).context("failed to serialize record")?;
        self.append(&raw)
    }

    fn read_all_json<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.read_all()?
            .into_iter()
            .map(|raw| serde_json::from_str(&raw).context("failed to parse journal record"))
            .collect()
    }
}

impl<T: AppendLog + ?Sized> AppendLogExt for T {}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// In-memory [`KeyValueStore`], used by tests and as a throwaway default.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    inner: RwLock<HashMap<String, String>>,
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.inner.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.write().remove(key);
        Ok(())
    }
}

/// In-memory [`AppendLog`].
#[derive(Default)]
pub struct MemoryAppendLog {
    inner: RwLock<Vec<String>>,
}

impl AppendLog for MemoryAppendLog {
    fn append(&self, record: &str) -> Result<()> {
        self.inner.write().push(record.to_string());
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().clone())
    }
}

// ---------------------------------------------------------------------------
// JSON-file-backed implementations
// ---------------------------------------------------------------------------

/// [`KeyValueStore`] backed by one JSON file on disk, written atomically
/// (tmp + rename) on every mutation, matching the teacher's config-save
/// pattern.
pub struct FileKeyValueStore {
    path: PathBuf,
    cache: RwLock<HashMap<String, String>>,
}

impl FileKeyValueStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read store from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse store from {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self { path, cache: RwLock::new(cache) })
    }

    fn flush(&self, snapshot: &HashMap<String, String>) -> Result<()> {
        let content = serde_json::to_string_pretty(snapshot).context("failed to serialize store")?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp store to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp store to {}", self.path.display()))?;
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        let snapshot = {
            let mut guard = self.cache.write();
            guard.insert(key.to_string(), value.to_string());
            guard.clone()
        };
        self.flush(&snapshot)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let snapshot = {
            let mut guard = self.cache.write();
            guard.remove(key);
            guard.clone()
        };
        self.flush(&snapshot)
    }
}

/// [`AppendLog`] backed by a newline-delimited JSON file, opened in append
/// mode so concurrent writers never truncate each other's records.
pub struct FileAppendLog {
    path: PathBuf,
}

impl FileAppendLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create parent dir for {}", path.display()))?;
        }
        Ok(Self { path })
    }
}

impl AppendLog for FileAppendLog {
    fn append(&self, record: &str) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open append log {}", self.path.display()))?;
        writeln!(file, "{record}").context("failed to write journal record")?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read append log {}", self.path.display()))?;
        Ok(content.lines().filter(|l| !l.is_empty()).map(|l| l.to_string()).collect())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        n: u32,
    }

    #[test]
    fn memory_kv_roundtrips() {
        let store = MemoryKeyValueStore::default();
        store.put_json("k", &Sample { n: 7 }).unwrap();
        let got: Option<Sample> = store.get_json("k").unwrap();
        assert_eq!(got, Some(Sample { n: 7 }));
    }

    #[test]
    fn memory_kv_delete_removes_key() {
        let store = MemoryKeyValueStore::default();
        store.put("k", "v").unwrap();
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn memory_append_log_preserves_order() {
        let log = MemoryAppendLog::default();
        log.append_json(&Sample { n: 1 }).unwrap();
        log.append_json(&Sample { n: 2 }).unwrap();
        let got: Vec<Sample> = log.read_all_json().unwrap();
        assert_eq!(got, vec![Sample { n: 1 }, Sample { n: 2 }]);
    }

    #[test]
    fn file_kv_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("kv_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("store.json");

        {
            let store = FileKeyValueStore::open(&path).unwrap();
            store.put_json("k", &Sample { n: 9 }).unwrap();
        }
        let reopened = FileKeyValueStore::open(&path).unwrap();
        let got: Option<Sample> = reopened.get_json("k").unwrap();
        assert_eq!(got, Some(Sample { n: 9 }));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn file_append_log_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("log_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("journal.ndjson");

        {
            let log = FileAppendLog::open(&path).unwrap();
            log.append_json(&Sample { n: 1 }).unwrap();
            log.append_json(&Sample { n: 2 }).unwrap();
        }
        let reopened = FileAppendLog::open(&path).unwrap();
        let got: Vec<Sample> = reopened.read_all_json().unwrap();
        assert_eq!(got, vec![Sample { n: 1 }, Sample { n: 2 }]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
