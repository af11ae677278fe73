//! Error types for the sequery library.

use std::path::PathBuf;

/// Custom Result type for sequery operations, wrapping the [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the sequery library.
///
/// Build and load errors abort the whole operation with a single top-level
/// failure; query parse errors are a distinct class that never crosses a
/// query boundary.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A required input file is missing
    #[error("required file not found: {0}")]
    MissingFile(PathBuf),

    /// A sequence did not have the expected genome length
    #[error("sequence length mismatch: expected {expected}, found {found}")]
    LengthMismatch { expected: usize, found: usize },

    /// Sequence and metadata streams of one chunk disagree on record count
    #[error("chunk {chunk}: {sequences} sequences but {metadata} metadata rows")]
    CountMismatch {
        chunk: String,
        sequences: u32,
        metadata: u32,
    },

    /// A date field could not be parsed as YYYY-MM-DD
    #[error("invalid date: {0}")]
    BadDate(String),

    /// A sequence contained a byte outside the alphabet
    #[error("invalid sequence character {0:?}")]
    BadSymbol(char),

    /// A descriptor or dictionary text file is malformed
    #[error("malformed descriptor: {0}")]
    BadDescriptor(String),

    /// A snapshot file has a bad magic number or an incompatible version
    #[error("snapshot format error: {0}")]
    SnapshotFormat(String),

    /// The query text could not be parsed
    #[error("query parse error: {0}")]
    QueryParse(String),

    /// Errors raised while ingesting chunk input files
    #[error("build error: {0}")]
    Build(#[from] anyhow::Error),

    /// Standard I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Violation of an internal invariant; a bug, reported instead of a crash
    #[error("internal invariant violated: {0}")]
    Internal(String),
}
