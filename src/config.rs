//! Configuration surface: the three root paths, cache periods, and the
//! pattern sets. Validation happens once, before any file processing -
//! a missing path or an unwritable cache directory aborts the whole run.

use crate::walk::WalkError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatcherConfig {
    /// Root of the original files the loader would normally serve.
    pub base_path: PathBuf,
    /// Root of the patch files; layout and names mirror `base_path`.
    pub patch_path: PathBuf,
    /// Writable directory for merged files, fingerprints and listings.
    pub cache_path: PathBuf,

    /// How long a base-tree listing stays valid.
    pub base_tree_cache_secs: u64,
    /// How long a patch-tree listing stays valid. Kept short: the patch tree
    /// is the one under active edit.
    pub patch_tree_cache_secs: u64,
    /// How long a per-file patch record stays valid without revalidation.
    pub patch_info_cache_secs: u64,

    /// Subtrees matching any of these regexes are skipped during scans.
    pub exclude_paths: Vec<String>,
    /// Files matching any of these regexes are replaced wholesale by the
    /// patch file instead of merged at method granularity.
    pub full_replace_patterns: Vec<String>,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::new(),
            patch_path: PathBuf::new(),
            cache_path: PathBuf::new(),
            base_tree_cache_secs: 600,
            patch_tree_cache_secs: 20,
            patch_info_cache_secs: 1200,
            exclude_paths: Vec::new(),
            full_replace_patterns: vec![r"\.html$".to_string()],
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{role} does not exist: {path}")]
    MissingPath { role: &'static str, path: PathBuf },

    #[error("cache path {path} is not writable: {source}")]
    CacheNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {source}")]
    Toml {
        #[source]
        source: toml_edit::de::Error,
    },

    #[error(transparent)]
    Pattern(#[from] WalkError),
}

impl PatcherConfig {
    pub fn load_from_str(input: &str) -> Result<Self, ConfigError> {
        toml_edit::de::from_str(input).map_err(|source| ConfigError::Toml { source })
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::load_from_str(&contents)
    }

    /// Canonicalize the three roots and prove the cache directory writable.
    /// Fatal on failure; nothing should run against an unvalidated config.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.base_path = canonical_existing("base path", &self.base_path)?;
        self.patch_path = canonical_existing("patch path", &self.patch_path)?;
        self.cache_path = canonical_existing("cache path", &self.cache_path)?;

        let probe = self.cache_path.join(".write-probe");
        fs::write(&probe, b"probe")
            .and_then(|()| fs::remove_file(&probe))
            .map_err(|source| ConfigError::CacheNotWritable {
                path: self.cache_path.clone(),
                source,
            })?;
        Ok(())
    }

    pub fn base_tree_cache(&self) -> Duration {
        Duration::from_secs(self.base_tree_cache_secs)
    }

    pub fn patch_tree_cache(&self) -> Duration {
        Duration::from_secs(self.patch_tree_cache_secs)
    }

    pub fn patch_info_cache(&self) -> Duration {
        Duration::from_secs(self.patch_info_cache_secs)
    }
}

fn canonical_existing(role: &'static str, path: &Path) -> Result<PathBuf, ConfigError> {
    if path.as_os_str().is_empty() || !path.exists() {
        return Err(ConfigError::MissingPath {
            role,
            path: path.to_path_buf(),
        });
    }
    path.canonicalize().map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_periods() {
        let config = PatcherConfig::default();
        assert_eq!(config.base_tree_cache_secs, 600);
        assert_eq!(config.patch_tree_cache_secs, 20);
        assert_eq!(config.patch_info_cache_secs, 1200);
        assert_eq!(config.full_replace_patterns, vec![r"\.html$".to_string()]);
    }

    #[test]
    fn loads_from_toml() {
        let config = PatcherConfig::load_from_str(
            r#"
base_path = "/srv/app"
patch_path = "/srv/patches"
cache_path = "/srv/cache"
patch_tree_cache_secs = 5
exclude_paths = ["wa-data/protected"]
"#,
        )
        .unwrap();
        assert_eq!(config.base_path, PathBuf::from("/srv/app"));
        assert_eq!(config.patch_tree_cache_secs, 5);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.patch_info_cache_secs, 1200);
        assert_eq!(config.exclude_paths, vec!["wa-data/protected".to_string()]);
    }

    #[test]
    fn unknown_toml_keys_are_rejected() {
        let err = PatcherConfig::load_from_str("basepath = \"/srv\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
    }

    #[test]
    fn missing_base_path_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PatcherConfig {
            base_path: dir.path().join("nope"),
            patch_path: dir.path().to_path_buf(),
            cache_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        match err {
            ConfigError::MissingPath { role, .. } => assert_eq!(role, "base path"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn validation_canonicalizes_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("base")).unwrap();
        std::fs::create_dir_all(dir.path().join("patch")).unwrap();
        std::fs::create_dir_all(dir.path().join("cache")).unwrap();

        let mut config = PatcherConfig {
            base_path: dir.path().join("base/../base"),
            patch_path: dir.path().join("patch"),
            cache_path: dir.path().join("cache"),
            ..Default::default()
        };
        config.validate().unwrap();
        assert!(config.base_path.ends_with("base"));
        assert!(!config.base_path.to_string_lossy().contains(".."));
    }
}
