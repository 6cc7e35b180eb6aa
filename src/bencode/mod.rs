//! Bencode reading primitives.
//!
//! Metainfo files are decoded with a cursor over the raw byte buffer rather
//! than through a full parse tree: the SHA-1 info-hash is defined over the
//! exact byte span that encoded the `info` dictionary, so the decoder has to
//! report byte positions and skip unknown values in place. See
//! [`reader::Reader`].
use thiserror::Error;

pub mod reader;

pub use reader::Reader;

/// Custom error type for bencode operations.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("Invalid bencode format:{0}")]
    InvalidFormat(String),

    #[error("Invalid integer format")]
    InvalidInteger,

    #[error("Invalid String length")]
    InvalidStringLength,

    #[error("Unexpected end of input")]
    UnexpectedEOI,
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
