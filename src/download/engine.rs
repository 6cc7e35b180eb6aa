//! Download orchestration.
//!
//! The engine runs the tracker refresh loop, spawns peer sessions under a
//! bounded concurrency cap, and stops once the owned bitmap is complete.
//! Peer and tracker failures are logged and isolated; only storage writes
//! are fatal.
use crate::download::{InFlight, OwnedPieces, PieceStore};
use crate::peer::session::{Session, SessionError};
use crate::torrent::Metainfo;
use crate::tracker::{self, Announce, AnnounceRequest, Peer, DEFAULT_PORT};

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Knobs for the engine; the defaults match common client behavior.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Port reported to trackers.
    pub port: u16,
    /// Cap on concurrently running peer sessions.
    pub max_sessions: usize,
    /// Upper bound on one session's lifetime; a stuck peer is abandoned
    /// rather than holding its batch open forever.
    pub session_deadline: Duration,
    /// Sleep after an announce round in which every tracker failed.
    pub tracker_retry: Duration,
    /// Sleep after an announce round that returned zero peers.
    pub empty_swarm_retry: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_sessions: 10,
            session_deadline: Duration::from_secs(300),
            tracker_retry: Duration::from_secs(15),
            empty_swarm_retry: Duration::from_secs(30),
        }
    }
}

pub struct Engine {
    metainfo: Arc<Metainfo>,
    config: EngineConfig,
    peer_id: [u8; 20],
    owned: Arc<OwnedPieces>,
    in_flight: Arc<InFlight>,
    store: Arc<PieceStore>,
    have_tx: broadcast::Sender<u32>,
}

impl Engine {
    pub fn new(metainfo: Metainfo, output_dir: &Path, config: EngineConfig) -> Self {
        let store = PieceStore::new(output_dir, &metainfo.info.name);
        let owned = OwnedPieces::new(metainfo.piece_count());
        let (have_tx, _) = broadcast::channel(256);
        Self {
            metainfo: Arc::new(metainfo),
            config,
            peer_id: tracker::generate_peer_id(),
            owned: Arc::new(owned),
            in_flight: Arc::new(InFlight::new()),
            store: Arc::new(store),
            have_tx,
        }
    }

    /**
    Downloads every piece.

    # How it works:
    1. Announces to the primary tracker, falling through the announce list
       on failure. A round where every tracker failed sleeps briefly and
       retries; a round with zero peers sleeps a little longer.
    2. Spawns one session per usable peer. A semaphore permit is acquired
       before the TCP connect and released when the session's task ends,
       bounding concurrency; each session also runs under a deadline.
    3. Waits for the whole batch, then loops back to the tracker until the
       owned count reaches the piece count.
    */
    #[instrument(skip(self), fields(name = %self.metainfo.info.name), level = "info")]
    pub async fn run(&self) -> Result<()> {
        let piece_count = self.metainfo.piece_count();
        info!(
            pieces = piece_count,
            total_bytes = self.metainfo.total_length(),
            info_hash = %hex::encode(self.metainfo.info_hash),
            "starting download"
        );

        while !self.owned.is_complete() {
            let announce = match self.fetch_peers().await {
                Some(announce) => announce,
                None => {
                    warn!("every tracker failed, retrying shortly");
                    tokio::time::sleep(self.config.tracker_retry).await;
                    continue;
                }
            };

            if announce.peers.is_empty() {
                info!("tracker returned an empty swarm, waiting for peers");
                tokio::time::sleep(self.config.empty_swarm_retry).await;
                continue;
            }

            self.run_batch(announce.peers).await?;
            debug!(owned = self.owned.count(), "session batch finished");
        }

        info!("all pieces downloaded");
        Ok(())
    }

    /// Assembles the final files from the persisted pieces.
    pub fn assemble(&self) -> Result<()> {
        self.store.assemble(&self.metainfo, true)
    }

    /// Walks the announce URLs in fallback order until one answers.
    async fn fetch_peers(&self) -> Option<Announce> {
        let request = AnnounceRequest {
            info_hash: self.metainfo.info_hash,
            peer_id: self.peer_id,
            port: self.config.port,
            left: self.metainfo.total_length(),
        };

        for url in self.metainfo.announce_urls() {
            match tracker::announce(url, &request).await {
                Ok(announce) => {
                    info!(url, peers = announce.peers.len(), "announce succeeded");
                    return Some(announce);
                }
                Err(e) => warn!(url, error = %e, "announce failed, trying next tracker"),
            }
        }
        None
    }

    /// Spawns a session per peer under the concurrency cap and awaits all
    /// of them. Storage failures abort the download; everything else is a
    /// per-peer problem.
    async fn run_batch(&self, peers: Vec<Peer>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_sessions));
        let mut sessions = JoinSet::new();

        for peer in peers {
            if peer.ip.is_unspecified() {
                debug!(peer = %peer.ip, "skipping unusable peer address");
                continue;
            }

            let session = Session::new(
                peer.clone(),
                Arc::clone(&self.metainfo),
                self.peer_id,
                Arc::clone(&self.owned),
                Arc::clone(&self.in_flight),
                Arc::clone(&self.store),
                self.have_tx.clone(),
            );
            let semaphore = Arc::clone(&semaphore);
            let deadline = self.config.session_deadline;

            sessions.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (peer, Ok(()));
                };
                let outcome = match timeout(deadline, session.run()).await {
                    Ok(result) => result,
                    Err(_) => Err(SessionError::Peer(anyhow::anyhow!(
                        "session exceeded its deadline"
                    ))),
                };
                (peer, outcome)
            });
        }

        while let Some(joined) = sessions.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((peer, Err(SessionError::Storage(e)))) => {
                    sessions.abort_all();
                    return Err(anyhow::Error::new(e)
                        .context(format!("fatal piece write failure via {}", peer.ip)));
                }
                Ok((peer, Err(SessionError::Peer(e)))) => {
                    debug!(peer = %peer.ip, error = %e, "session ended with a peer error");
                }
                Err(join_err) => warn!(error = %join_err, "session task failed to join"),
            }
        }
        Ok(())
    }
}
