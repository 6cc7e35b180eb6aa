//! Per-peer download session.
//!
//! Each session owns one TCP connection exclusively and walks the state
//! machine: connect, handshake, bitfield exchange, interested/unchoke,
//! then the download loop. Every exit path releases the connection by
//! dropping it, and an in-progress piece claim is released by a drop
//! guard, so a session abandoned at an await point cannot leak its piece.
use crate::download::{next_piece, InFlight, OwnedPieces, PieceStore};
use crate::peer::message::BLOCK_SIZE;
use crate::peer::{Handshake, Message};
use crate::torrent::Metainfo;
use crate::tracker::Peer;

use anyhow::{anyhow, bail, Context};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SessionError {
    /// Piece persistence failed; the engine treats this as fatal.
    #[error("piece store write failed: {0}")]
    Storage(#[source] std::io::Error),

    /// Anything the peer did wrong; the engine moves on to other peers.
    #[error(transparent)]
    Peer(#[from] anyhow::Error),
}

pub struct Session {
    peer: Peer,
    metainfo: Arc<Metainfo>,
    peer_id: [u8; 20],
    owned: Arc<OwnedPieces>,
    in_flight: Arc<InFlight>,
    store: Arc<PieceStore>,
    have_tx: broadcast::Sender<u32>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer: Peer,
        metainfo: Arc<Metainfo>,
        peer_id: [u8; 20],
        owned: Arc<OwnedPieces>,
        in_flight: Arc<InFlight>,
        store: Arc<PieceStore>,
        have_tx: broadcast::Sender<u32>,
    ) -> Self {
        Self {
            peer,
            metainfo,
            peer_id,
            owned,
            in_flight,
            store,
            have_tx,
        }
    }

    /// Runs the session to completion: either the peer has nothing more to
    /// offer (success) or a failure ends it. The connection is closed on
    /// every path when the stream drops.
    #[instrument(skip(self), fields(peer = %self.peer.ip, port = self.peer.port), level = "debug")]
    pub async fn run(self) -> Result<(), SessionError> {
        let mut have_rx = self.have_tx.subscribe();

        let mut stream = timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.peer.ip, self.peer.port)),
        )
        .await
        .map_err(|_| anyhow!("connect to {}:{} timed out", self.peer.ip, self.peer.port))
        .map_err(SessionError::Peer)?
        .context("tcp connect")
        .map_err(SessionError::Peer)?;

        self.drive(&mut stream, &mut have_rx).await
    }

    async fn drive(
        &self,
        stream: &mut TcpStream,
        have_rx: &mut broadcast::Receiver<u32>,
    ) -> Result<(), SessionError> {
        let peer_bits = self
            .setup(stream)
            .await
            .map_err(SessionError::Peer)?;

        let piece_count = self.metainfo.piece_count() as u32;
        loop {
            self.forward_haves(stream, have_rx)
                .await
                .map_err(SessionError::Peer)?;

            let mut snapshot = self.owned.snapshot();
            let Some(index) = next_piece(&peer_bits, &mut snapshot, &self.in_flight, piece_count)
            else {
                debug!("peer has nothing further to offer");
                return Ok(());
            };

            // the add can lose a race with another session that picked the
            // same index off its own snapshot; the loser just re-picks
            if !self.in_flight.add(index) {
                continue;
            }
            self.owned.set(index);
            let claim = Claim {
                owned: &self.owned,
                in_flight: &self.in_flight,
                index,
                settled: false,
            };

            let piece = self
                .fetch_piece(stream, index)
                .await
                .map_err(SessionError::Peer)?;

            claim.settle();
            self.store
                .put(index, &piece)
                .await
                .map_err(SessionError::Storage)?;
            let _ = self.have_tx.send(index);
            info!(
                index,
                owned = self.owned.count(),
                total = piece_count,
                "piece verified and stored"
            );
        }
    }

    /// Handshake through unchoke. Returns the peer's bitfield.
    async fn setup(&self, stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
        let ours = Handshake::new(self.metainfo.info_hash, self.peer_id);
        let theirs = ours.exchange(stream).await?;
        trace!(peer_id = %String::from_utf8_lossy(&theirs.peer_id), "handshake complete");

        // announce what we already hold, but only once there is something
        if self.owned.count() > 0 {
            Message::Bitfield(self.owned.snapshot()).write(stream).await?;
        }

        let peer_bits = match Message::read(stream).await? {
            Message::Bitfield(bits) => bits,
            other => bail!("expected bitfield, peer sent {:?}", other.id()),
        };
        let expected_len = self.metainfo.piece_count().div_ceil(8);
        if peer_bits.len() != expected_len {
            bail!(
                "bitfield length {} does not match {} pieces",
                peer_bits.len(),
                self.metainfo.piece_count()
            );
        }

        Message::Interested.write(stream).await?;
        match Message::read(stream).await? {
            Message::Unchoke => {}
            other => bail!("expected unchoke, peer sent {:?}", other.id()),
        }

        Ok(peer_bits)
    }

    /// Relays piece announcements from other sessions onto this peer's
    /// connection. Connections are never shared; each session writes the
    /// `have` frames itself.
    async fn forward_haves(
        &self,
        stream: &mut TcpStream,
        have_rx: &mut broadcast::Receiver<u32>,
    ) -> anyhow::Result<()> {
        loop {
            match have_rx.try_recv() {
                Ok(index) => Message::Have(index).write(stream).await?,
                Err(TryRecvError::Lagged(skipped)) => {
                    trace!(skipped, "have relay lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Downloads one piece block by block and verifies its digest.
    async fn fetch_piece(&self, stream: &mut TcpStream, index: u32) -> anyhow::Result<Vec<u8>> {
        let length = self.metainfo.piece_size(index as usize) as u32;
        let mut piece = vec![0u8; length as usize];

        let mut begin = 0u32;
        while begin < length {
            let block_len = BLOCK_SIZE.min(length - begin);
            Message::Request {
                index,
                begin,
                length: block_len,
            }
            .write(stream)
            .await?;

            let block = loop {
                match Message::read(stream).await? {
                    Message::Piece {
                        index: got_index,
                        begin: got_begin,
                        block,
                    } => {
                        if got_index != index
                            || got_begin != begin
                            || block.len() != block_len as usize
                        {
                            bail!(
                                "peer sent block {}+{} of {} bytes, wanted {}+{} of {}",
                                got_index,
                                got_begin,
                                block.len(),
                                index,
                                begin,
                                block_len
                            );
                        }
                        break block;
                    }
                    // chatter that can arrive mid-transfer
                    Message::KeepAlive | Message::Have(_) => continue,
                    other => bail!("unexpected message {:?} while awaiting a block", other.id()),
                }
            };

            piece[begin as usize..(begin + block_len) as usize].copy_from_slice(&block);
            begin += block_len;
        }

        let digest: [u8; 20] = Sha1::digest(&piece).into();
        if self.metainfo.piece_hash(index as usize) != digest {
            bail!("piece {} failed hash verification", index);
        }
        trace!(index, length, "piece digest verified");
        Ok(piece)
    }
}

/// Holds the optimistic ownership of one piece. Unless settled, dropping
/// the claim removes the in-flight entry and clears the bit, which also
/// covers a session abandoned at an await point.
struct Claim<'a> {
    owned: &'a OwnedPieces,
    in_flight: &'a InFlight,
    index: u32,
    settled: bool,
}

impl Claim<'_> {
    /// The piece verified: keep the bit, release the in-flight entry.
    fn settle(mut self) {
        self.in_flight.remove(self.index);
        self.settled = true;
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.in_flight.remove(self.index);
            self.owned.clear(self.index);
        }
    }
}
