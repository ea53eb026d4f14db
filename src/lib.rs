//! Overlay Patcher: method-level patching of PHP source trees.
//!
//! Given an original file and a patch file declaring the same class with a
//! subset of its methods redefined, the compositor produces a merged file in
//! which patched methods override the originals, the originals stay callable
//! under deterministic shadow names, and every untouched token comes through
//! byte-identical. A registry layer decides per requested file whether to
//! serve the merged form or the original, backed by fingerprints that detect
//! staleness without re-parsing.
//!
//! # Architecture
//!
//! All merging compiles down to one primitive: an order-sensitive token-range
//! splice over a lossless token stream. Intelligence lives in range
//! acquisition (the structural scanner) and in the staleness policy, not in
//! the splice itself.
//!
//! # Staleness
//!
//! - Size + mtime is the cheap filter; the content hash is ground truth,
//!   computed only on drift
//! - Metadata-only drift refreshes the stored fingerprint and nothing else
//! - An upstream change inside a patched method is a conflict and fails
//!   loudly; a stale merge is never served silently
//!
//! # Example
//!
//! ```
//! use overlay_patcher::{compose, lex, scan};
//!
//! let source = "<?php class Greeter { function hi(){ return 1; } }";
//! let patch = "<?php class Greeter { function hi(){ return 2; } }";
//!
//! let merged = compose(&scan(lex(source))?, &scan(lex(patch))?)?;
//! assert!(merged.text.contains("old_Greeter_hi_mp"));
//! assert_eq!(merged.replaced_functions["hi"], "function hi(){ return 1; }");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod compose;
pub mod config;
pub mod context;
pub mod lex;
pub mod registry;
pub mod scan;
pub mod store;
pub mod version;
pub mod walk;

// Re-exports
pub use compose::{compose, shadow_name, ComposeError, MergeOutput};
pub use config::{ConfigError, PatcherConfig};
pub use context::{ContextFrame, ContextStack};
pub use lex::{lex, Token, TokenKind};
pub use registry::{MethodDrift, PatchEntry, PatchError, PatchFailure, PatchRecord, Patcher};
pub use scan::{scan, ClassInfo, MethodInfo, ScanError, ScanResult, Visibility};
pub use store::{CacheStore, StoreError};
pub use version::{fingerprint, FileFingerprint, FileStatus, VersionError};
pub use walk::{cached_tree, compile_patterns, list_tree, WalkError};
