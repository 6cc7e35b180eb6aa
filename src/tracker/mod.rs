//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements peer discovery against BitTorrent trackers:
//! - HTTP(S) announce over a GET request with percent-encoded binary fields
//! - UDP announce per BEP 15 (connect / announce transactions)
//! - peer ID generation and URL encoding helpers
//!
//! The transport is selected by the URL scheme. Tracker failures are
//! returned to the caller, which walks the remaining announce URLs; they
//! never abort the process.
use rand::Rng;
use std::net::IpAddr;
use thiserror::Error;
use url::Url;

pub mod http;
pub mod udp;

const CLIENT_TAG: &str = "RT";
const CLIENT_VERSION: &str = "0001";
const PEER_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Default port reported to trackers in announce requests.
pub const DEFAULT_PORT: u16 = 6881;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Url Parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("unsupported tracker scheme: {0}")]
    UnsupportedScheme(String),

    #[error("tracker URL has no host")]
    MissingHost,

    #[error("no IPv4 address found for {0}")]
    NoIpv4Address(String),

    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("tracker responded with status {0}")]
    HttpStatus(u16),

    #[error("Bencode deserialization error: {0}")]
    BencodeDe(#[from] serde_bencode::Error),

    #[error("tracker reported failure: {0}")]
    Failure(String),

    #[error("transaction id mismatch")]
    TransactionMismatch,

    #[error("unexpected action {0} in tracker reply")]
    UnexpectedAction(u32),

    #[error("tracker reply too short: {0} bytes")]
    ShortReply(usize),

    #[error("no reply from tracker after {0} attempts")]
    Unreachable(u32),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// A peer received from the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

/// The parsed result of an announce exchange.
#[derive(Debug)]
pub struct Announce {
    /// Seconds the tracker asks us to wait before reannouncing.
    pub interval: u64,
    pub peers: Vec<Peer>,
}

/// Everything a tracker needs to identify this download.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    /// Total bytes remaining, reported as `left`.
    pub left: i64,
}

/// Sends an announce to `url`, selecting the transport by scheme.
#[tracing::instrument(skip(request), level = "debug")]
pub async fn announce(url: &str, request: &AnnounceRequest) -> TrackerResult<Announce> {
    let parsed = Url::parse(url)?;
    match parsed.scheme() {
        "http" | "https" => http::announce(&parsed, request).await,
        "udp" => udp::announce(&parsed, request).await,
        other => Err(TrackerError::UnsupportedScheme(other.to_string())),
    }
}

/// Generates a unique peer ID for this client.
///
/// The ID follows the Azureus-style convention: `-` + two-character client
/// tag + four-character version, then 13 random alphanumerics for
/// uniqueness, 20 bytes in all.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = format!("-{}{}", CLIENT_TAG, CLIENT_VERSION);
    peer_id[..prefix.len()].copy_from_slice(prefix.as_bytes());
    let mut rng = rand::rng();
    for byte in peer_id[prefix.len()..].iter_mut() {
        *byte = PEER_ID_CHARSET[rng.random_range(0..PEER_ID_CHARSET.len())];
    }
    peer_id
}

/// URL-encodes a byte slice according to RFC 3986.
///
/// Unreserved characters (a-z, A-Z, 0-9, -, ., _, ~) are left as-is, all
/// other bytes become %XX. Used for the raw 20-byte `info_hash` and
/// `peer_id` query fields, which are not valid UTF-8.
pub fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}
