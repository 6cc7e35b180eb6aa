//! UDP tracker announce per BEP 15.
//!
//! Two transactions over one socket: CONNECT obtains a connection id,
//! ANNOUNCE trades it for an interval and a compact peer list. Every reply
//! must echo our random transaction id; an `action` of 3 carries a UTF-8
//! error message from the tracker.
use super::{Announce, AnnounceRequest, Peer, TrackerError, TrackerResult};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use rand::Rng;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

/// magic constant for the UDP tracker protocol, see BEP 15
const PROTOCOL_ID: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

/// `event` field: 2 = started.
const EVENT_STARTED: u32 = 2;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_ATTEMPTS: u32 = 3;
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn announce(url: &Url, request: &AnnounceRequest) -> TrackerResult<Announce> {
    let host = url.host_str().ok_or(TrackerError::MissingHost)?;
    let port = url.port().unwrap_or(6969);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((host, port)).await?;

    let connection_id = connect(&socket).await?;
    debug!(host, connection_id, "UDP tracker connection established");

    announce_with(&socket, connection_id, request).await
}

/// CONNECT transaction: 16-byte request, 16-byte reply carrying the
/// connection id. Retried on timeout with 1s/2s/3s backoff.
async fn connect(socket: &UdpSocket) -> TrackerResult<u64> {
    let transaction_id = rand::rng().random::<u32>();

    let mut packet = Vec::with_capacity(16);
    packet.write_u64::<BigEndian>(PROTOCOL_ID)?;
    packet.write_u32::<BigEndian>(ACTION_CONNECT)?;
    packet.write_u32::<BigEndian>(transaction_id)?;

    for attempt in 1..=CONNECT_ATTEMPTS {
        socket.send(&packet).await?;

        let mut reply = [0u8; 16];
        match timeout(CONNECT_TIMEOUT, socket.recv(&mut reply)).await {
            Ok(Ok(n)) if n >= 16 => {
                let mut cursor = Cursor::new(&reply[..]);
                let action = cursor.read_u32::<BigEndian>()?;
                let echoed = cursor.read_u32::<BigEndian>()?;
                let connection_id = cursor.read_u64::<BigEndian>()?;

                if echoed != transaction_id {
                    return Err(TrackerError::TransactionMismatch);
                }
                if action != ACTION_CONNECT {
                    return Err(TrackerError::UnexpectedAction(action));
                }
                return Ok(connection_id);
            }
            Ok(Ok(n)) => return Err(TrackerError::ShortReply(n)),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!(attempt, "UDP tracker connect timed out");
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }
        }
    }

    Err(TrackerError::Unreachable(CONNECT_ATTEMPTS))
}

/// ANNOUNCE transaction: fixed 98-byte request, a reply of at least 20
/// bytes followed by 6-byte compact IPv4 peer records.
async fn announce_with(
    socket: &UdpSocket,
    connection_id: u64,
    request: &AnnounceRequest,
) -> TrackerResult<Announce> {
    let transaction_id = rand::rng().random::<u32>();

    let mut packet = Vec::with_capacity(98);
    packet.write_u64::<BigEndian>(connection_id)?;
    packet.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
    packet.write_u32::<BigEndian>(transaction_id)?;
    packet.extend_from_slice(&request.info_hash);
    packet.extend_from_slice(&request.peer_id);
    packet.write_u64::<BigEndian>(0)?; // downloaded
    packet.write_u64::<BigEndian>(request.left as u64)?;
    packet.write_u64::<BigEndian>(0)?; // uploaded
    packet.write_u32::<BigEndian>(EVENT_STARTED)?;
    packet.write_u32::<BigEndian>(0)?; // ip: let the tracker use the source
    packet.write_u32::<BigEndian>(rand::rng().random::<u32>())?; // key
    packet.write_u32::<BigEndian>(0xFFFF_FFFF)?; // num_want: tracker default
    packet.write_u16::<BigEndian>(request.port)?;

    socket.send(&packet).await?;

    let mut reply = [0u8; 4096];
    let n = match timeout(ANNOUNCE_TIMEOUT, socket.recv(&mut reply)).await {
        Ok(result) => result?,
        Err(_) => return Err(TrackerError::Unreachable(1)),
    };
    parse_reply(&reply[..n], transaction_id)
}

fn parse_reply(reply: &[u8], transaction_id: u32) -> TrackerResult<Announce> {
    if reply.len() < 8 {
        return Err(TrackerError::ShortReply(reply.len()));
    }

    let mut cursor = Cursor::new(reply);
    let action = cursor.read_u32::<BigEndian>()?;
    let echoed = cursor.read_u32::<BigEndian>()?;

    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&reply[8..]).into_owned();
        return Err(TrackerError::Failure(message));
    }
    if echoed != transaction_id {
        return Err(TrackerError::TransactionMismatch);
    }
    if action != ACTION_ANNOUNCE {
        return Err(TrackerError::UnexpectedAction(action));
    }
    if reply.len() < 20 {
        return Err(TrackerError::ShortReply(reply.len()));
    }

    let interval = cursor.read_u32::<BigEndian>()?;
    let _leechers = cursor.read_u32::<BigEndian>()?;
    let _seeders = cursor.read_u32::<BigEndian>()?;

    let peers = reply[20..]
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            Peer {
                ip: IpAddr::V4(ip),
                port,
            }
        })
        .collect();

    Ok(Announce {
        interval: u64::from(interval),
        peers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn announce_reply(transaction_id: u32, peers: &[(Ipv4Addr, u16)]) -> Vec<u8> {
        let mut reply = Vec::new();
        reply.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
        reply.write_u32::<BigEndian>(transaction_id).unwrap();
        reply.write_u32::<BigEndian>(1800).unwrap();
        reply.write_u32::<BigEndian>(3).unwrap();
        reply.write_u32::<BigEndian>(7).unwrap();
        for (ip, port) in peers {
            reply.extend_from_slice(&ip.octets());
            reply.write_u16::<BigEndian>(*port).unwrap();
        }
        reply
    }

    #[test]
    fn parses_peer_records() {
        let reply = announce_reply(42, &[(Ipv4Addr::new(10, 1, 2, 3), 6881)]);
        let announce = parse_reply(&reply, 42).unwrap();
        assert_eq!(announce.interval, 1800);
        assert_eq!(
            announce.peers,
            vec![Peer {
                ip: "10.1.2.3".parse().unwrap(),
                port: 6881
            }]
        );
    }

    #[test]
    fn rejects_foreign_transaction_id() {
        let reply = announce_reply(42, &[]);
        assert!(matches!(
            parse_reply(&reply, 43),
            Err(TrackerError::TransactionMismatch)
        ));
    }

    #[test]
    fn surfaces_tracker_error_message() {
        let mut reply = Vec::new();
        reply.write_u32::<BigEndian>(ACTION_ERROR).unwrap();
        reply.write_u32::<BigEndian>(42).unwrap();
        reply.extend_from_slice(b"torrent not registered");
        let err = parse_reply(&reply, 42).unwrap_err();
        assert!(matches!(err, TrackerError::Failure(m) if m == "torrent not registered"));
    }

    #[test]
    fn rejects_truncated_header() {
        let mut reply = Vec::new();
        reply.write_u32::<BigEndian>(ACTION_ANNOUNCE).unwrap();
        reply.write_u32::<BigEndian>(42).unwrap();
        reply.write_u32::<BigEndian>(1800).unwrap();
        assert!(matches!(
            parse_reply(&reply, 42),
            Err(TrackerError::ShortReply(12))
        ));
    }
}
