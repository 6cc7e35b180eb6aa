//! HTTP(S) tracker announce.
//!
//! The announce is a GET whose query carries the raw 20-byte info hash and
//! peer id percent-encoded by hand; the query string is assembled already
//! encoded and must not pass through a second encoder. The tracker host is
//! resolved to an IPv4 address explicitly and the request is retargeted at
//! that address, because some trackers misbehave behind default resolver
//! paths.
use super::{url_encode, Announce, AnnounceRequest, Peer, TrackerError, TrackerResult};

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::lookup_host;
use tracing::{debug, warn};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(rename = "failure reason")]
    #[serde(default)]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: u64,
    #[serde(default)]
    peers: Peers,
}

/// Trackers answer with either a compact byte string (6 bytes per peer) or
/// a list of `{ip, port}` dictionaries; both are accepted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(serde_bytes::ByteBuf),
    NonCompact(Vec<PeerDict>),
}

impl Default for Peers {
    fn default() -> Self {
        Peers::NonCompact(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

pub async fn announce(url: &Url, request: &AnnounceRequest) -> TrackerResult<Announce> {
    let mut target = resolve_ipv4(url).await?;

    let query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
        url_encode(&request.info_hash),
        url_encode(&request.peer_id),
        request.port,
        request.left,
    );
    target.set_query(Some(&query));
    debug!(%target, "announcing to HTTP tracker");

    let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

    let mut last_err = None;
    for attempt in 1..=ATTEMPTS {
        match attempt_get(&client, &target).await {
            Ok(bytes) => return parse_response(&bytes),
            Err(e) => {
                warn!(attempt, error = %e, "HTTP tracker request failed");
                last_err = Some(e);
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }
        }
    }
    Err(last_err.unwrap_or(TrackerError::Unreachable(ATTEMPTS)))
}

async fn attempt_get(client: &reqwest::Client, url: &Url) -> TrackerResult<Vec<u8>> {
    let response = client.get(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(TrackerError::HttpStatus(status.as_u16()));
    }
    Ok(response.bytes().await?.to_vec())
}

/// Re-targets `url` at the first IPv4 address its host resolves to.
async fn resolve_ipv4(url: &Url) -> TrackerResult<Url> {
    let host = url.host_str().ok_or(TrackerError::MissingHost)?;
    let port = url.port_or_known_default().unwrap_or(80);

    let ipv4 = lookup_host((host, port))
        .await?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| TrackerError::NoIpv4Address(host.to_string()))?;

    let mut target = url.clone();
    target
        .set_ip_host(IpAddr::V4(ipv4))
        .map_err(|_| TrackerError::NoIpv4Address(host.to_string()))?;
    Ok(target)
}

fn parse_response(bytes: &[u8]) -> TrackerResult<Announce> {
    let response: TrackerResponse = serde_bencode::from_bytes(bytes)?;

    if let Some(reason) = response.failure_reason {
        return Err(TrackerError::Failure(reason));
    }

    let peers = match response.peers {
        Peers::Compact(bytes) => bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                Peer {
                    ip: IpAddr::V4(ip),
                    port,
                }
            })
            .collect(),
        Peers::NonCompact(dicts) => dicts
            .into_iter()
            .filter_map(|dict| {
                dict.ip.parse::<IpAddr>().ok().map(|ip| Peer {
                    ip,
                    port: dict.port,
                })
            })
            .collect(),
    };

    Ok(Announce {
        interval: response.interval,
        peers,
    })
}
