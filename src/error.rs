use std::io;

use thiserror::Error;

/// Errors surfaced by the store. Lookup misses are not errors; they come back
/// as `None` or `false` from the map operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO errors when creating, mapping or flushing the backing files
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Encoding errors when converting keys or values to bytes
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Decoding errors when converting stored bytes back to keys or values
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// A probe walked the whole slot array without finding a free entry
    #[error("unable to locate a free index entry after {probed} probes")]
    IndexFull { probed: usize },

    /// An access past the end of a mapped buffer; callers must grow first
    #[error("position {position} out of bounds for buffer of {capacity} bytes")]
    OutOfBounds { position: u64, capacity: u64 },

    /// The on-disk layout does not decode to a valid store
    #[error("corrupt store file: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Encoding(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Encoding(msg.to_string())
    }
}
