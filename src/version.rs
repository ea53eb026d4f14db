//! File version fingerprints and the staleness check built on them.
//!
//! Size plus modification time is the cheap first filter; the content hash is
//! ground truth and is only computed when the modification time drifts. A
//! drift with a matching hash means the recorded fingerprint is stale but the
//! content is intact - callers refresh the record and skip recomputation.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// The committed version of a file at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path: PathBuf,
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub hash: u64,
}

/// Outcome of comparing a file against a recorded fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "ignoring a staleness verdict defeats the cache"]
pub enum FileStatus {
    Unchanged,
    /// Content matches but the recorded metadata is stale. The caller must
    /// re-persist a fresh fingerprint and must not recompute derived state.
    MetadataDrift,
    Changed,
}

impl FileStatus {
    pub fn is_changed(self) -> bool {
        self == FileStatus::Changed
    }

    pub fn needs_refresh(self) -> bool {
        self == FileStatus::MetadataDrift
    }
}

#[derive(Error, Debug)]
pub enum VersionError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Compute the current fingerprint of `path`.
pub fn fingerprint(path: &Path) -> Result<FileFingerprint, VersionError> {
    let meta = fs::metadata(path).map_err(|source| io_error(path, source))?;
    let mtime = filetime::FileTime::from_last_modification_time(&meta);
    Ok(FileFingerprint {
        path: path.to_path_buf(),
        size: meta.len(),
        mtime_secs: mtime.unix_seconds(),
        mtime_nanos: mtime.nanoseconds(),
        hash: hash_file(path)?,
    })
}

/// Compare `path` against a recorded fingerprint.
///
/// A missing file is always `Changed`. With `force_hash` the content hash is
/// verified even when size and modification time both match.
pub fn check(
    path: &Path,
    recorded: &FileFingerprint,
    force_hash: bool,
) -> Result<FileStatus, VersionError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FileStatus::Changed);
        }
        Err(source) => return Err(io_error(path, source)),
    };

    if meta.len() != recorded.size {
        return Ok(FileStatus::Changed);
    }

    let mtime = filetime::FileTime::from_last_modification_time(&meta);
    let mtime_matches =
        mtime.unix_seconds() == recorded.mtime_secs && mtime.nanoseconds() == recorded.mtime_nanos;

    if mtime_matches {
        if force_hash && hash_file(path)? != recorded.hash {
            return Ok(FileStatus::Changed);
        }
        return Ok(FileStatus::Unchanged);
    }

    if hash_file(path)? == recorded.hash {
        Ok(FileStatus::MetadataDrift)
    } else {
        Ok(FileStatus::Changed)
    }
}

fn hash_file(path: &Path) -> Result<u64, VersionError> {
    let bytes = fs::read(path).map_err(|source| io_error(path, source))?;
    Ok(xxh3_64(&bytes))
}

fn io_error(path: &Path, source: std::io::Error) -> VersionError {
    if source.kind() == std::io::ErrorKind::NotFound {
        VersionError::NotFound(path.to_path_buf())
    } else {
        VersionError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
