//! Metainfo parsing and error handling logic.
//!
//! This module provides the typed in-memory descriptor for a .torrent file,
//! including decoding, validation, and the info-hash derivation.
use thiserror::Error;

pub mod metainfo;

pub use metainfo::{FileEntry, InfoDict, Metainfo};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("Missing or invalid field: {0}")]
    MissingField(String),

    #[error("Invalid pieces hash length")]
    InvalidPiecesHashLength,

    #[error("Invalid info dictionary span")]
    InvalidInfoSpan,
}

/// Result type for torrent operations derived from `std::result`
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
