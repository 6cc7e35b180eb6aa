//! Framed peer wire messages.
//!
//! After the handshake every message is `{length: u32 big-endian, id: u8,
//! payload}`, where `length` counts the id byte plus the payload. A
//! zero-length frame is a keep-alive.
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// The fixed request/response granularity within a piece.
pub const BLOCK_SIZE: u32 = 16_384;

/// Ceiling on accepted frame lengths; a block frame is 9 + 16 KiB and a
/// bitfield one byte per eight pieces, so anything past this is a hostile
/// or corrupt length prefix.
const MAX_FRAME_LEN: u32 = 1 << 20;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(u32),

    #[error("unknown message id {0}")]
    UnknownId(u8),

    #[error("malformed {0} message")]
    Malformed(&'static str),
}

pub type WireResult<T> = std::result::Result<T, WireError>;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
        }
    }

    /// Serializes the message into a full frame, length prefix included.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(17);
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(0);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            Message::Have(index) => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(*index);
            }
            Message::Bitfield(bits) => {
                buf.reserve(5 + bits.len());
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(5);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(6);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.reserve(13 + block.len());
                buf.put_u32(9 + block.len() as u32);
                buf.put_u8(7);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
        }
        buf.to_vec()
    }

    /// Parses a frame body (id byte plus payload, the length prefix already
    /// consumed).
    pub fn parse(body: &[u8]) -> WireResult<Message> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = body[0];
        let mut payload = &body[1..];
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if payload.len() != 4 {
                    return Err(WireError::Malformed("have"));
                }
                Message::Have(payload.get_u32())
            }
            5 => Message::Bitfield(payload.to_vec()),
            6 => {
                if payload.len() != 12 {
                    return Err(WireError::Malformed("request"));
                }
                Message::Request {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            7 => {
                if payload.len() < 8 {
                    return Err(WireError::Malformed("piece"));
                }
                Message::Piece {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    block: payload.to_vec(),
                }
            }
            8 => {
                if payload.len() != 12 {
                    return Err(WireError::Malformed("cancel"));
                }
                Message::Cancel {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                }
            }
            other => return Err(WireError::UnknownId(other)),
        };
        Ok(msg)
    }

    /// Reads one framed message off the stream.
    pub async fn read(stream: &mut TcpStream) -> WireResult<Message> {
        let mut prefix = [0u8; 4];
        stream.read_exact(&mut prefix).await?;
        let len = u32::from_be_bytes(prefix);

        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        if len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(len));
        }

        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await?;
        Self::parse(&body)
    }

    /// Writes the message as one frame.
    pub async fn write(&self, stream: &mut TcpStream) -> WireResult<()> {
        stream.write_all(&self.serialize()).await?;
        Ok(())
    }
}
