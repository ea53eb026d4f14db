//! Per-file patch records and the staleness policy that decides, request by
//! request, whether a cached merge may be served.
//!
//! A [`PatchRecord`] is the only state that outlives a single merge. It is
//! replaced wholesale, never mutated in place. The cardinal rule: a stale
//! merge is never served silently - either the fingerprints prove the inputs
//! unchanged, or the merge is recomputed, or the file fails loudly with a
//! drift conflict that names the affected methods.

use crate::compose::{compose, ComposeError, MergeOutput};
use crate::config::{ConfigError, PatcherConfig};
use crate::lex::lex;
use crate::scan::{scan, ScanError};
use crate::store::{sanitize, CacheStore, StoreError};
use crate::version::{self, FileFingerprint, VersionError};
use crate::walk::{self, WalkError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Persisted record of one merged file pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchRecord {
    pub merged_file: PathBuf,
    pub src_version: FileFingerprint,
    pub patch_version: FileFingerprint,
    pub merged_version: FileFingerprint,
    /// Original source text of every overridden method, for upstream diffing.
    pub replaced_functions: BTreeMap<String, String>,
}

/// One file the loader should redirect, with its validated record.
#[derive(Debug, Clone)]
pub struct PatchEntry {
    pub relative: String,
    pub base_file: PathBuf,
    pub record: PatchRecord,
    pub full_replace: bool,
}

/// A method whose upstream text no longer matches the recorded original.
#[derive(Debug, Clone)]
pub struct MethodDrift {
    pub name: String,
    /// Recorded original text; `None` when the method was not previously
    /// among the replaced set.
    pub recorded: Option<String>,
    pub current: String,
}

fn drift_names(methods: &[MethodDrift]) -> String {
    methods
        .iter()
        .map(|m| m.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum PatchError {
    /// Upstream changed a method that the patch overrides. Deliberately
    /// fatal for the file: the patch needs human review, then the stale
    /// version record can be cleared.
    #[error("source file {file} changed inside patched methods: {}", drift_names(.methods))]
    UpstreamDrift {
        file: PathBuf,
        methods: Vec<MethodDrift>,
    },

    #[error("fully replaced source file {file} changed; review the patch, then clear its version record")]
    FullReplacementDrift { file: PathBuf },

    #[error("failed to scan {file}: {source}")]
    Scan {
        file: PathBuf,
        #[source]
        source: ScanError,
    },

    #[error("failed to merge {file}: {source}")]
    Merge {
        file: PathBuf,
        #[source]
        source: ComposeError,
    },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file {file} has an unresolved patch conflict: {reason}")]
    Unresolved { file: PathBuf, reason: String },

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Walk(#[from] WalkError),
}

/// A per-file failure surfaced by [`Patcher::refresh`]. The run continues
/// with the remaining files.
#[derive(Debug)]
pub struct PatchFailure {
    pub relative: String,
    pub error: PatchError,
}

/// The orchestrator: discovers candidate files, owns the record lifecycle,
/// and answers the loader's `is_patchable` / `merged_location_for` queries.
pub struct Patcher {
    config: PatcherConfig,
    store: CacheStore,
    exclude: Vec<Regex>,
    full_replace: Vec<Regex>,
    files_to_patch: BTreeMap<PathBuf, PatchEntry>,
    files_examined: BTreeMap<PathBuf, bool>,
    failed: BTreeMap<PathBuf, String>,
}

impl Patcher {
    /// Validate the configuration and set up the cache store. Configuration
    /// problems are fatal here, before any file is touched.
    pub fn new(mut config: PatcherConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let exclude = walk::compile_patterns(&config.exclude_paths)?;
        let full_replace = walk::compile_patterns(&config.full_replace_patterns)?;
        let store = CacheStore::new(&config.cache_path);
        Ok(Self {
            config,
            store,
            exclude,
            full_replace,
            files_to_patch: BTreeMap::new(),
            files_examined: BTreeMap::new(),
            failed: BTreeMap::new(),
        })
    }

    pub fn config(&self) -> &PatcherConfig {
        &self.config
    }

    /// Scan both trees and build or revalidate the record for every
    /// candidate. Per-file fatal conditions are collected and returned;
    /// they abort that file only.
    pub fn refresh(&mut self) -> Result<Vec<PatchFailure>, PatchError> {
        self.files_to_patch.clear();
        self.failed.clear();

        let candidates = self.scan_paths()?;
        info!(count = candidates.len(), "candidate files present in both trees");

        let mut failures = Vec::new();
        for relative in candidates {
            if let Err(error) = self.build_patch_info(&relative) {
                warn!(file = relative.as_str(), %error, "file left unpatched after fatal per-file error");
                self.failed.insert(
                    self.config.base_path.join(rel_to_path(&relative)),
                    error.to_string(),
                );
                failures.push(PatchFailure { relative, error });
            }
        }
        Ok(failures)
    }

    /// Relative paths present in both trees, from the time-bounded listings.
    pub fn scan_paths(&self) -> Result<Vec<String>, PatchError> {
        let patch_files = walk::cached_tree(
            &self.store,
            &self.config.patch_path,
            &tree_key("tree_patch", &self.config.patch_path),
            self.config.patch_tree_cache(),
            &self.exclude,
        )?;

        let base_path = self.config.base_path.clone();
        let probe = patch_files.clone();
        let base_files: Vec<String> = self.store.get_or_compute(
            &tree_key("tree_base", &base_path),
            self.config.base_tree_cache(),
            || -> Result<Vec<String>, PatchError> {
                Ok(probe
                    .iter()
                    .filter(|rel| base_path.join(rel_to_path(rel)).is_file())
                    .cloned()
                    .collect())
            },
        )?;

        let base_set: BTreeSet<&String> = base_files.iter().collect();
        Ok(patch_files
            .into_iter()
            .filter(|rel| base_set.contains(rel))
            .collect())
    }

    /// Whether the loader should redirect `path`. Every query is recorded in
    /// the examined ledger.
    pub fn is_patchable(&mut self, path: &Path) -> bool {
        let result = self.files_to_patch.contains_key(path);
        self.files_examined.insert(path.to_path_buf(), result);
        result
    }

    /// The location the loader should open instead of `path`, if any.
    pub fn merged_location_for(&self, path: &Path) -> Option<PathBuf> {
        self.files_to_patch
            .get(path)
            .map(|entry| entry.record.merged_file.clone())
    }

    /// Resolve a requested file to the path that should actually be served.
    /// Unrelated files resolve to themselves; a file with an unresolved
    /// conflict is an error, never silently served unpatched.
    pub fn resolve(&mut self, path: &Path) -> Result<PathBuf, PatchError> {
        if let Some(reason) = self.failed.get(path) {
            return Err(PatchError::Unresolved {
                file: path.to_path_buf(),
                reason: reason.clone(),
            });
        }
        if self.is_patchable(path) {
            Ok(self.files_to_patch[path].record.merged_file.clone())
        } else {
            Ok(path.to_path_buf())
        }
    }

    /// The patch-tree counterpart of a base file.
    pub fn patch_file_for_base(&self, base_file: &Path) -> Option<PathBuf> {
        base_file
            .strip_prefix(&self.config.base_path)
            .ok()
            .map(|rel| self.config.patch_path.join(rel))
    }

    /// Whether `path` belongs to the full-replacement category.
    pub fn is_full_replace(&self, path: &Path) -> bool {
        match self.files_to_patch.get(path) {
            Some(entry) => entry.full_replace,
            None => self.matches_full_replace(path),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &PatchEntry> {
        self.files_to_patch.values()
    }

    pub fn examined(&self) -> &BTreeMap<PathBuf, bool> {
        &self.files_examined
    }

    pub fn failures(&self) -> &BTreeMap<PathBuf, String> {
        &self.failed
    }

    // -- record lifecycle -------------------------------------------------

    fn build_patch_info(&mut self, relative: &str) -> Result<(), PatchError> {
        let base_file = self.config.base_path.join(rel_to_path(relative));
        let patch_file = self.config.patch_path.join(rel_to_path(relative));
        let stem = sanitize(&base_file.to_string_lossy());
        let info_key = format!("info_{stem}");
        let version_key = format!("version_{stem}");
        let full_replace = self.matches_full_replace(&base_file);

        // The version record is the authority; validation (and with it,
        // conflict detection) runs whenever one exists. The TTL-bounded info
        // entry is a freshness marker for external readers, refreshed as a
        // side effect of persisting.
        let record = match self.store.get_json::<PatchRecord>(&version_key, None) {
            Some(versions) => self.validate_cached(
                &base_file,
                &patch_file,
                full_replace,
                &info_key,
                &version_key,
                versions,
            )?,
            None => None,
        };

        let record = match record {
            Some(record) => record,
            None => self.recompute(
                &base_file,
                &patch_file,
                &stem,
                full_replace,
                &info_key,
                &version_key,
            )?,
        };

        debug!(
            file = %base_file.display(),
            merged = %record.merged_file.display(),
            full_replace,
            "patch entry ready"
        );
        self.files_to_patch.insert(
            base_file.clone(),
            PatchEntry {
                relative: relative.to_string(),
                base_file,
                record,
                full_replace,
            },
        );
        Ok(())
    }

    /// Decide whether a persisted record is still valid. Returns the record
    /// to reuse (fingerprints possibly refreshed), `None` to force a
    /// recompute, or a drift conflict.
    fn validate_cached(
        &self,
        base_file: &Path,
        patch_file: &Path,
        full_replace: bool,
        info_key: &str,
        version_key: &str,
        mut versions: PatchRecord,
    ) -> Result<Option<PatchRecord>, PatchError> {
        let src_status = version::check(base_file, &versions.src_version, false)?;

        if src_status.is_changed() {
            if full_replace {
                // No method granularity to diff against; conservatively fatal.
                return Err(PatchError::FullReplacementDrift {
                    file: base_file.to_path_buf(),
                });
            }
            // Real content change upstream: re-extract the replaced originals
            // and compare them, method by method, against the record.
            let merge = self.compose_pair(base_file, patch_file)?;
            let mut drifted = Vec::new();
            for (name, current) in &merge.replaced_functions {
                match versions.replaced_functions.get(name) {
                    Some(recorded) if recorded == current => {}
                    recorded => drifted.push(MethodDrift {
                        name: name.clone(),
                        recorded: recorded.cloned(),
                        current: current.clone(),
                    }),
                }
            }
            if !drifted.is_empty() {
                return Err(PatchError::UpstreamDrift {
                    file: base_file.to_path_buf(),
                    methods: drifted,
                });
            }
            // Every patched method is textually intact; the change lives in
            // unpatched code, so a plain recompute picks it up.
            info!(file = %base_file.display(), "upstream changed outside patched methods, re-merging");
            return Ok(None);
        }

        // Source intact (or metadata-only drift); the same drift check
        // applies symmetrically to the patch and merged files.
        let patch_status = version::check(patch_file, &versions.patch_version, false)?;
        let merged_file = versions.merged_file.clone();
        let merged_status = version::check(&merged_file, &versions.merged_version, false)?;

        if patch_status.is_changed() || merged_status.is_changed() {
            debug!(file = %base_file.display(), "patch or merged artifact changed, re-merging");
            return Ok(None);
        }

        if src_status.needs_refresh() || patch_status.needs_refresh() || merged_status.needs_refresh()
        {
            versions.src_version = version::fingerprint(base_file)?;
            versions.patch_version = version::fingerprint(patch_file)?;
            versions.merged_version = version::fingerprint(&merged_file)?;
            self.persist(info_key, version_key, &versions)?;
            info!(file = %base_file.display(), "refreshed stale fingerprints without recomputing merge");
        }

        Ok(Some(versions))
    }

    fn recompute(
        &self,
        base_file: &Path,
        patch_file: &Path,
        stem: &str,
        full_replace: bool,
        info_key: &str,
        version_key: &str,
    ) -> Result<PatchRecord, PatchError> {
        let (merged_file, replaced_functions) = if full_replace {
            info!(file = %base_file.display(), "full replacement, serving patch file verbatim");
            (patch_file.to_path_buf(), BTreeMap::new())
        } else {
            let merge = self.compose_pair(base_file, patch_file)?;
            let merged_file = self
                .store
                .write_artifact(&format!("patched_{stem}"), merge.text.as_bytes())?;
            info!(
                file = %base_file.display(),
                replaced = merge.replaced_functions.len(),
                "composed merged file"
            );
            (merged_file, merge.replaced_functions)
        };

        let record = PatchRecord {
            src_version: version::fingerprint(base_file)?,
            patch_version: version::fingerprint(patch_file)?,
            merged_version: version::fingerprint(&merged_file)?,
            merged_file,
            replaced_functions,
        };
        self.persist(info_key, version_key, &record)?;
        Ok(record)
    }

    fn compose_pair(&self, base_file: &Path, patch_file: &Path) -> Result<MergeOutput, PatchError> {
        let src_text = read_file(base_file)?;
        let patch_text = read_file(patch_file)?;
        let src_scan = scan(lex(&src_text)).map_err(|source| PatchError::Scan {
            file: base_file.to_path_buf(),
            source,
        })?;
        let patch_scan = scan(lex(&patch_text)).map_err(|source| PatchError::Scan {
            file: patch_file.to_path_buf(),
            source,
        })?;
        compose(&src_scan, &patch_scan).map_err(|source| PatchError::Merge {
            file: base_file.to_path_buf(),
            source,
        })
    }

    fn persist(
        &self,
        info_key: &str,
        version_key: &str,
        record: &PatchRecord,
    ) -> Result<(), PatchError> {
        self.store.put_json(version_key, record)?;
        self.store.put_json(info_key, record)?;
        Ok(())
    }

    fn matches_full_replace(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.full_replace.iter().any(|re| re.is_match(&text))
    }
}

fn read_file(path: &Path) -> Result<String, PatchError> {
    fs::read_to_string(path).map_err(|source| PatchError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn rel_to_path(relative: &str) -> PathBuf {
    relative.split('/').collect()
}

fn tree_key(prefix: &str, path: &Path) -> String {
    format!(
        "{prefix}_{:016x}",
        xxh3_64(path.to_string_lossy().as_bytes())
    )
}
