//! Cairn - content-addressed index of a directory tree
//!
//! This library identifies content by a short self-describing id, keeps an
//! index of every entry under a root keyed by file identity, path and
//! content id, and persists that index beside the tree so later refreshes
//! only re-read what changed.

#[cfg(not(unix))]
compile_error!("cairn reads POSIX file identity and ownership and only builds on unix");

pub mod builder;
pub mod codec;
pub mod config;
pub mod error;
pub mod expiry;
pub mod format;
pub mod id;
pub mod names;
pub mod record;
pub mod store;
pub mod tracker;
pub mod tree;

pub use builder::{IdBuilder, bytes_to_id, file_to_id, link_to_id};
pub use config::{BLOCK_SIZE, DEFAULT_METADATA, LITERAL_THRESHOLD, MAX_ATTEMPTS, TreeConfig};
pub use error::{CasError, HashError, Result, StoreError};
pub use id::{ContentId, IdError};
pub use names::{NameCache, NameResolver, SystemResolver};
pub use record::{FileId, FileRecord, ObjectType};
pub use store::{MemoryStore, Store};
pub use tracker::{Phase, Progress, ProgressTracker, Sample, TrackerError};
pub use tree::{RefreshOptions, RefreshStats, TreeIndex};
