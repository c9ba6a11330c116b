//! The crate-wide error type.
//!
//! `StorageError` is a closed enum: every failure mode the storage engine can
//! produce is a named variant here, never a boxed `dyn Error`. Callers match
//! on kind rather than parse messages.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StorageError>;

/// All failure modes the storage engine can produce.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A read, write, or sync against the underlying file failed.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// The buffer manager could not satisfy a pin request (capacity
    /// exhausted, illegal frame index, or a pin-count invariant violation).
    #[error("buffer manager error: {0}")]
    BufferManagerError(String),

    /// On-disk data failed a structural or checksum check.
    #[error("corruption detected: {0}")]
    CorruptionError(String),

    /// An insert violated a primary-key uniqueness constraint.
    #[error("duplicate key")]
    DuplicateKey,

    /// A lookup found no matching row, page, or table.
    #[error("{0} not found")]
    NotFound(String),

    /// A transaction was used outside its valid lifecycle, or a write/write
    /// conflict was detected at commit time.
    #[error("transaction error: {0}")]
    TransactionError(String),

    /// A checkpoint could not proceed because of a conflicting in-flight
    /// operation within the wait timeout.
    #[error("checkpoint busy")]
    CheckpointBusy,

    /// A long-running or blocking operation was cooperatively cancelled.
    #[error("interrupted")]
    Interrupted,

    /// A configuration value was missing, out of range, or internally
    /// inconsistent.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A hard capacity limit (max database size, max threads, page count)
    /// was exceeded.
    #[error("capacity exceeded: {0}")]
    CapacityError(String),

    /// A value did not match the physical type declared for its column.
    #[error("type error: {0}")]
    TypeError(String),
}
