use std::path::PathBuf;
use std::time::Duration;

/// Content shorter than this many bytes gets a literal identifier.
///
/// At 66 bytes the base64 form of the content reaches the length of a
/// base64-encoded SHA-512 digest, so a literal id is never the longer one.
pub const LITERAL_THRESHOLD: usize = 66;

/// Read size used when hashing regular files.
pub const BLOCK_SIZE: usize = 128 * 1024 * 1024;

/// How many times an entry is re-read when it changes while being hashed.
pub const MAX_ATTEMPTS: u32 = 3;

/// Metadata file name, relative to the tracked root.
pub const DEFAULT_METADATA: &str = ".cas";

#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Metadata location; relative paths are resolved against the root.
    pub metadata: PathBuf,
    pub block_size: usize,
    pub literal_threshold: usize,
    pub max_attempts: u32,
    /// Minimum time between progress log lines during a refresh.
    pub log_interval: Duration,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            metadata: PathBuf::from(DEFAULT_METADATA),
            block_size: BLOCK_SIZE,
            literal_threshold: LITERAL_THRESHOLD,
            max_attempts: MAX_ATTEMPTS,
            log_interval: Duration::from_secs(1),
        }
    }
}
