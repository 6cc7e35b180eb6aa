//! This module implements the BitTorrent peer handshake protocol.
//!
//! The handshake is the first message exchanged between two peers. It
//! verifies that both peers are participating in the same torrent (via
//! info_hash) and establishes basic protocol compatibility.
use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/** Represents a BitTorrent handshake message as defined in the BitTorrent protocol.

A handshake is a fixed 68-byte frame containing:
- Protocol identifier length (19) and string ("BitTorrent protocol")
- 8 reserved bytes, all zero
- Info hash identifying the torrent
- Peer ID identifying the client */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    /** Serializes the handshake into a 68-byte array.

    The layout is:
    - 1 byte: protocol string length (19)
    - 19 bytes: protocol string
    - 8 bytes: reserved (all zeros)
    - 20 bytes: info hash
    - 20 bytes: peer ID */
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        // bytes 20..28 stay zero: reserved
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parses a 68-byte frame, validating the protocol length byte and the
    /// protocol string. The peer's info hash and id are returned as-is;
    /// info-hash equality is the caller's check.
    pub fn parse(buf: &[u8; 68]) -> Result<Self> {
        if buf[0] != PROTOCOL.len() as u8 {
            anyhow::bail!("invalid protocol length: {}", buf[0]);
        }
        if &buf[1..20] != PROTOCOL {
            anyhow::bail!("invalid protocol string");
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self { info_hash, peer_id })
    }

    /**
    Performs the full handshake exchange on an established connection.

    # How it works:
    1. Writes our 68-byte handshake.
    2. Reads exactly 68 bytes from the peer and parses them.
    3. Requires the peer's info hash to equal ours; a mismatch means the
       peer is serving a different torrent.
    4. Returns the peer's handshake (its peer id is recorded but not
       required to match anything the tracker advertised).
    */
    #[instrument(level = "trace", skip(self, stream))]
    pub async fn exchange(&self, stream: &mut TcpStream) -> Result<Handshake> {
        stream.write_all(&self.serialize()).await?;

        let mut buf = [0u8; 68];
        stream.read_exact(&mut buf).await?;
        let theirs = Self::parse(&buf)?;

        if theirs.info_hash != self.info_hash {
            anyhow::bail!(
                "info hash mismatch: got {}, expected {}",
                hex::encode(theirs.info_hash),
                hex::encode(self.info_hash)
            );
        }
        Ok(theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_layout() {
        let hs = Handshake::new([1; 20], [2; 20]);
        let buf = hs.serialize();
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0u8; 8]);
        assert_eq!(&buf[28..48], &[1u8; 20]);
        assert_eq!(&buf[48..68], &[2u8; 20]);
    }

    #[test]
    fn parse_round_trip() {
        let hs = Handshake::new([7; 20], [9; 20]);
        let parsed = Handshake::parse(&hs.serialize()).unwrap();
        assert_eq!(parsed, hs);
    }

    #[test]
    fn parse_rejects_wrong_length_byte() {
        let mut buf = Handshake::new([0; 20], [0; 20]).serialize();
        buf[0] = 20;
        assert!(Handshake::parse(&buf).is_err());
    }

    #[test]
    fn parse_rejects_wrong_protocol() {
        let mut buf = Handshake::new([0; 20], [0; 20]).serialize();
        buf[1] = b'b';
        assert!(Handshake::parse(&buf).is_err());
    }
}
