//! Recursive tree enumeration with exclusion patterns, plus the time-bounded
//! cached variant the registry uses for candidate discovery.

use crate::store::CacheStore;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum WalkError {
    #[error("invalid path pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to walk {root}: {source}")]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Compile exclusion / match patterns up front so bad ones fail at startup.
pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, WalkError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| WalkError::Pattern {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}

/// List every file under `root` as a sorted, `/`-separated relative path.
/// A subtree whose full path matches any exclusion pattern is skipped whole.
pub fn list_tree(root: &Path, exclude: &[Regex]) -> Result<Vec<String>, WalkError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
        let path = entry.path().to_string_lossy();
        !exclude.iter().any(|re| re.is_match(&path))
    });
    for entry in walker {
        let entry = entry.map_err(|source| WalkError::Walk {
            root: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walked entries live under the walk root");
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push(relative);
    }
    files.sort();
    debug!(root = %root.display(), count = files.len(), "tree listed");
    Ok(files)
}

/// [`list_tree`] behind a time-bounded cache entry.
pub fn cached_tree(
    store: &CacheStore,
    root: &Path,
    cache_key: &str,
    max_age: Duration,
    exclude: &[Regex],
) -> Result<Vec<String>, WalkError> {
    store.get_or_compute(cache_key, max_age, || list_tree(root, exclude))
}
