//! Error and Result types for segment purge operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for purge operations.
pub type Result<T> = std::result::Result<T, PurgeError>;

/// The error type for purge operations.
#[derive(Debug, Error)]
pub enum PurgeError {
    /// Invalid magic bytes in a segment header or footer.
    #[error("Invalid magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported segment file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Block or file checksum does not match the stored value.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Stored CRC32 checksum.
        expected: u32,
        /// Computed CRC32 checksum.
        actual: u32,
    },

    /// Segment content is structurally invalid.
    #[error("Corrupted segment: {0}")]
    Corrupted(String),

    /// A segment writer was used out of order.
    #[error("Invalid writer state: {0}")]
    WriterState(&'static str),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// A segment file sits outside the `<database>/<retention>/...` hierarchy.
    #[error("invalid directory structure for {}", path.display())]
    InvalidLayout {
        /// Offending segment path.
        path: PathBuf,
    },

    /// A segment could not be opened or read.
    #[error("unable to read {}: {source}", path.display())]
    Read {
        /// Segment path.
        path: PathBuf,
        /// Underlying cause.
        #[source]
        source: Box<PurgeError>,
    },

    /// A replacement segment could not be written, finalized or swapped in.
    #[error("unable to write replacement for {}: {source}", path.display())]
    Write {
        /// Segment path being replaced.
        path: PathBuf,
        /// Underlying cause.
        #[source]
        source: Box<PurgeError>,
    },

    /// A block carries a composite key that cannot be split into series and field.
    #[error("malformed key {key:?} in {}: {reason}", path.display())]
    KeyParse {
        /// Segment path holding the block.
        path: PathBuf,
        /// Composite key, lossily decoded for display.
        key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// No series file was configured.
    #[error("a series file is required")]
    MissingSeriesFile,
}

impl PurgeError {
    /// Wraps `self` as a read failure for `path`.
    pub fn reading(self, path: impl Into<PathBuf>) -> Self {
        Self::Read {
            path: path.into(),
            source: Box::new(self),
        }
    }

    /// Wraps `self` as a write failure for `path`.
    pub fn writing(self, path: impl Into<PathBuf>) -> Self {
        Self::Write {
            path: path.into(),
            source: Box::new(self),
        }
    }
}
