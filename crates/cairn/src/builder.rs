//! Incremental construction of content identifiers.

use std::{
    fs::{self, File},
    io::{self, Read},
    os::unix::ffi::OsStrExt,
    path::Path,
};

use sha2::{Digest, Sha512};

use crate::config::{BLOCK_SIZE, LITERAL_THRESHOLD};
use crate::error::HashError;
use crate::id::{ContentId, DIGEST_LEN};

/// Running state for computing one [`ContentId`].
///
/// Content may be fed in one call or many; the resulting identifier is the
/// same either way. Only the first `threshold` bytes are ever buffered, so
/// arbitrarily large inputs can be streamed through.
#[derive(Clone)]
pub struct IdBuilder {
    hasher: Sha512,
    count: u64,
    literal: Vec<u8>,
    threshold: usize,
}

impl Default for IdBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IdBuilder {
    pub fn new() -> Self {
        Self::with_threshold(LITERAL_THRESHOLD)
    }

    /// A builder that switches to hash identifiers at `threshold` bytes.
    pub fn with_threshold(threshold: usize) -> Self {
        Self {
            hasher: Sha512::new(),
            count: 0,
            literal: Vec::new(),
            threshold,
        }
    }

    /// Build the identifier of an in-memory buffer.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut builder = Self::new();
        builder.add(bytes);
        builder
    }

    pub fn reset(&mut self) {
        self.hasher = Sha512::new();
        self.count = 0;
        self.literal.clear();
    }

    pub fn add(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.count += bytes.len() as u64;
        if self.count < self.threshold as u64 {
            self.literal.extend_from_slice(bytes);
        } else if !self.literal.is_empty() {
            self.literal = Vec::new();
        }
    }

    /// Number of bytes fed since the last reset.
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// The identifier of everything fed since the last reset.
    pub fn identifier(&self) -> ContentId {
        if self.count == 0 {
            return ContentId::Empty;
        }
        if self.count < self.threshold as u64 {
            return ContentId::Literal(self.literal.clone());
        }

        let out = self.hasher.clone().finalize();
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&out);
        ContentId::Hash(Box::new(digest))
    }

    /// Identify `bytes`, failing if they are not `expected` long.
    pub fn identify_bytes(
        &mut self,
        bytes: &[u8],
        expected: Option<u64>,
    ) -> Result<ContentId, HashError> {
        check_length(expected, bytes.len() as u64)?;
        self.reset();
        self.add(bytes);
        Ok(self.identifier())
    }

    /// Identify a regular file's content, reading at most `block_size`
    /// bytes at a time.
    ///
    /// An `expected` length of zero yields [`ContentId::Empty`] without
    /// opening the file.
    pub fn identify_file(
        &mut self,
        path: &Path,
        expected: Option<u64>,
        block_size: usize,
    ) -> Result<ContentId, HashError> {
        if expected == Some(0) {
            return Ok(ContentId::Empty);
        }

        self.reset();
        let mut file = File::open(path)?;

        // One spare byte lets a file that grew past its stat size show up
        // without a second block read.
        let buf_len = match expected {
            Some(len) => usize::try_from(len.saturating_add(1))
                .unwrap_or(usize::MAX)
                .min(block_size),
            None => block_size,
        };
        let mut buf = vec![0u8; buf_len.max(1)];

        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            self.add(&buf[..n]);

            if let Some(expected) = expected {
                if self.count > expected {
                    return Err(HashError::LengthMismatch {
                        expected,
                        actual: self.count,
                    });
                }
            }
        }

        check_length(expected, self.count)?;
        Ok(self.identifier())
    }

    /// Identify a symlink by the bytes of its target.
    pub fn identify_link(
        &mut self,
        path: &Path,
        expected: Option<u64>,
    ) -> Result<ContentId, HashError> {
        if expected == Some(0) {
            return Ok(ContentId::Empty);
        }
        let target = fs::read_link(path)?;
        self.identify_bytes(target.as_os_str().as_bytes(), expected)
    }
}

fn check_length(expected: Option<u64>, actual: u64) -> Result<(), HashError> {
    match expected {
        Some(expected) if expected != actual => Err(HashError::LengthMismatch { expected, actual }),
        _ => Ok(()),
    }
}

/// Identifier of an in-memory buffer.
pub fn bytes_to_id(bytes: &[u8]) -> ContentId {
    IdBuilder::from_bytes(bytes).identifier()
}

/// Identifier of a regular file, read in [`BLOCK_SIZE`] blocks.
pub fn file_to_id(path: &Path, expected: Option<u64>) -> Result<ContentId, HashError> {
    IdBuilder::new().identify_file(path, expected, BLOCK_SIZE)
}

/// Identifier of a symlink's target.
pub fn link_to_id(path: &Path, expected: Option<u64>) -> Result<ContentId, HashError> {
    IdBuilder::new().identify_link(path, expected)
}
