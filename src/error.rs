//! Centralized error handling for the loader.
//!
//! Every failure is surfaced as a [`LoaderError`] through the crate-wide [`Result`] alias.
//! The library never panics on malformed input: truncated streams, bad indices and broken
//! struct tables all come back as values.
//!
//! ## Error Categories
//!
//! - **I/O Errors** ([`LoaderError::Io`]): the byte source could not be opened or read.
//! - **Format Errors** ([`LoaderError::Format`]): the stream is not a document at all
//!   (bad magic, truncated header) or was written by a newer program.
//! - **Corruption Errors** ([`LoaderError::Corrupt`]): the container is recognisable but
//!   damaged (truncated record, impossible length, missing end sentinel).
//! - **Struct Table Errors** ([`LoaderError::Dna`]): the embedded struct descriptor table
//!   cannot be decoded.
//! - **Compression Errors** ([`LoaderError::Compression`]): a compressed source failed to
//!   decode.
//! - **Versioning Errors** ([`LoaderError::Versioning`]): a migration pass flagged the
//!   document as structurally corrupt.
//! - **Internal Errors** ([`LoaderError::Internal`]): broken invariants inside the loader.
//!
//! Only stream-level failures of the *root* document abort a load. Everything that happens
//! inside an external document is recorded in the [`LoadReport`](crate::report::LoadReport)
//! instead, so callers always get a best-effort graph back.
//!
//! ## Usage
//!
//! ```rust
//! use blendloader::{Loader, LoaderError};
//!
//! let loader = Loader::builder().build()?;
//! match loader.load_memory(b"not a document".to_vec()) {
//!     Err(LoaderError::Format(msg)) => println!("rejected: {msg}"),
//!     Err(e) => println!("other failure: {e}"),
//!     Ok(_) => unreachable!(),
//! }
//! # Ok::<(), LoaderError>(())
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;

/// A specialized `Result` type for loader operations.
pub type Result<T> = std::result::Result<T, LoaderError>;

/// The master error enum covering all failure domains of the loader.
///
/// The type is `Clone` so that one failure can be stored both in a document's report entry
/// and returned to the caller. I/O errors are wrapped in `Arc` for that reason.
#[derive(Debug, Clone)]
pub enum LoaderError {
    /// Low-level I/O failure (file not found, permission denied, short read).
    Io(Arc<io::Error>),

    /// The stream is not a valid document.
    ///
    /// Raised for a wrong magic prefix, a truncated file header, unknown pointer or
    /// endianness markers, and files whose minimum reader version is newer than the
    /// configured program version.
    Format(String),

    /// The document is recognisable but corrupt.
    ///
    /// Raised for truncated block records, negative lengths, out-of-range struct indices
    /// and streams that end without the end-of-stream record.
    Corrupt(String),

    /// The struct descriptor table (`DNA1` block) cannot be decoded.
    Dna(String),

    /// A compressed byte source failed to decode.
    Compression(String),

    /// A versioning pass reported structural corruption.
    Versioning(String),

    /// Logic error inside the loader. Should not occur; please report it.
    Internal(String),
}

impl fmt::Display for LoaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O Error: {e}"),
            Self::Format(s) => write!(f, "Format Error: {s}"),
            Self::Corrupt(s) => write!(f, "Corrupt Document: {s}"),
            Self::Dna(s) => write!(f, "Struct Table Error: {s}"),
            Self::Compression(s) => write!(f, "Compression Error: {s}"),
            Self::Versioning(s) => write!(f, "Versioning Error: {s}"),
            Self::Internal(s) => write!(f, "Internal Logic Error: {s}"),
        }
    }
}

impl std::error::Error for LoaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LoaderError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl LoaderError {
    /// Returns true for failures that make the stream unusable (as opposed to a document
    /// flagged invalid by versioning).
    pub fn is_stream_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Format(_) | Self::Corrupt(_) | Self::Dna(_) | Self::Compression(_)
        )
    }
}
