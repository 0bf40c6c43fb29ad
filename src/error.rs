//! # Storage Error Types
//!
//! Most fallible operations in this crate return `eyre::Result` with context
//! attached at each layer. The variants below cover the cases where callers
//! need to react to the *kind* of failure rather than report it: lenient
//! parsing stops at `Parse`, the registry reallocates on `FileVanished`, and
//! the writer refuses oversized keys with `KeyLength`. They are raised inside
//! `eyre::Report` and recovered with `downcast_ref` where needed.

use std::path::PathBuf;
use thiserror::Error;

/// A typed failure from the mmap storage layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// An on-disk entry could not be decoded at the given byte offset.
    #[error("malformed entry at byte {offset}: {reason}")]
    Parse { offset: usize, reason: &'static str },

    /// The backing file was unlinked or truncated by another process.
    #[error("file '{path}' was unlinked or truncated by another process")]
    FileVanished { path: PathBuf },

    /// Encoded keys must fit in an i32 so the length header can never be
    /// confused with a truncated region.
    #[error("encoded key length {len} exceeds i32::MAX")]
    KeyLength { len: usize },

    /// An offset computation fell outside the mapped region.
    #[error("offset {offset} out of bounds of mapping length {len}")]
    OutOfBounds { offset: usize, len: usize },
}

impl StoreError {
    pub fn parse(offset: usize, reason: &'static str) -> Self {
        StoreError::Parse { offset, reason }
    }

    pub fn vanished(path: impl Into<PathBuf>) -> Self {
        StoreError::FileVanished { path: path.into() }
    }

    pub fn out_of_bounds(offset: usize, len: usize) -> Self {
        StoreError::OutOfBounds { offset, len }
    }
}
