//! Key-value byte cache persisted under the cache directory.
//!
//! Entries are plain files named after a sanitized key. A lookup older than
//! its caller-supplied maximum age is a miss and the entry is removed; a miss
//! is never an error. Writes are atomic (tempfile + fsync + rename) so a
//! crash can never leave a half-written entry behind.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("cache I/O error for `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cache entry `{key}` could not be encoded: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fetch an entry's bytes. `max_age` of `None` never expires; an expired
    /// entry is removed and reported as a miss.
    pub fn get(&self, key: &str, max_age: Option<Duration>) -> Option<Vec<u8>> {
        let path = self.entry_path(key);
        let meta = fs::metadata(&path).ok()?;
        if let Some(max_age) = max_age {
            let modified = meta.modified().ok()?;
            let age = SystemTime::now()
                .duration_since(modified)
                .unwrap_or_default();
            if age > max_age {
                trace!(key, "cache entry expired, removing");
                let _ = fs::remove_file(&path);
                return None;
            }
        }
        fs::read(&path).ok()
    }

    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.write_atomic(&self.entry_path(key), bytes)
            .map_err(|source| StoreError::Io {
                key: key.to_string(),
                source,
            })
    }

    pub fn remove(&self, key: &str) {
        let _ = fs::remove_file(self.entry_path(key));
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str, max_age: Option<Duration>) -> Option<T> {
        let bytes = self.get(key, max_age)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(key, %error, "discarding unreadable cache entry");
                self.remove(key);
                None
            }
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
            key: key.to_string(),
            source,
        })?;
        self.put(key, &bytes)
    }

    /// Fetch a JSON entry or compute, persist and return it on a miss.
    /// A failed persist is logged and otherwise ignored; the next call
    /// recomputes.
    pub fn get_or_compute<T, E, F>(&self, key: &str, max_age: Duration, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.get_json(key, Some(max_age)) {
            trace!(key, "cache hit");
            return Ok(value);
        }
        let value = compute()?;
        if let Err(error) = self.put_json(key, &value) {
            warn!(key, %error, "failed to persist cache entry");
        }
        Ok(value)
    }

    /// Location of a derived artifact (e.g. a merged file) under the cache
    /// directory. Artifacts share the store's sanitized naming but carry no
    /// expiry; their validity is governed by fingerprints.
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.root.join(sanitize(name))
    }

    /// Atomically write a derived artifact and return its location.
    pub fn write_artifact(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.artifact_path(name);
        self.write_atomic(&path, bytes)
            .map_err(|source| StoreError::Io {
                key: name.to_string(),
                source,
            })?;
        Ok(path)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.cache", sanitize(key)))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
        temp.write_all(bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Map a key to a safe flat file name: path separators and other hostile
/// characters become `|`.
pub fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '|'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use serde::{Deserialize, Serialize};

    #[test]
    fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        store.put("alpha", b"payload").unwrap();
        assert_eq!(store.get("alpha", None).unwrap(), b"payload");
        assert_eq!(store.get("alpha", Some(Duration::from_secs(60))).unwrap(), b"payload");
    }

    #[test]
    fn missing_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        assert!(store.get("absent", None).is_none());
    }

    #[test]
    fn expired_entry_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        store.put("stale", b"old").unwrap();

        let entry = dir.path().join("stale.cache");
        filetime::set_file_mtime(&entry, FileTime::from_unix_time(1_000_000, 0)).unwrap();

        assert!(store.get("stale", Some(Duration::from_secs(60))).is_none());
        assert!(!entry.exists(), "expired entry should be deleted");
    }

    #[test]
    fn keys_with_path_separators_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        store.put("info_/srv/app/lib.php", b"x").unwrap();
        assert_eq!(store.get("info_/srv/app/lib.php", None).unwrap(), b"x");
        assert!(dir.path().join("info_|srv|app|lib.php.cache").exists());
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Entry {
        name: String,
        count: u32,
    }

    #[test]
    fn json_roundtrip_and_corruption_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let entry = Entry {
            name: "n".to_string(),
            count: 3,
        };
        store.put_json("entry", &entry).unwrap();
        assert_eq!(store.get_json::<Entry>("entry", None).unwrap(), entry);

        store.put("entry", b"not json").unwrap();
        assert!(store.get_json::<Entry>("entry", None).is_none());
        // Corrupt entry was dropped so the next get is a clean miss.
        assert!(store.get("entry", None).is_none());
    }

    #[test]
    fn get_or_compute_caches_the_computation() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let mut calls = 0;
        for _ in 0..2 {
            let value: Vec<String> = store
                .get_or_compute("list", Duration::from_secs(60), || {
                    calls += 1;
                    Ok::<_, std::convert::Infallible>(vec!["a".to_string()])
                })
                .unwrap();
            assert_eq!(value, vec!["a".to_string()]);
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn artifacts_live_unexpiring_next_to_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path());
        let path = store.write_artifact("patched_/srv/a.php", b"<?php").unwrap();
        assert_eq!(path, dir.path().join("patched_|srv|a.php"));
        assert_eq!(fs::read(&path).unwrap(), b"<?php");
    }
}
