// SPDX-FileCopyrightText: 2025 The odor Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Peer wire protocol framing: the handshake and the length-prefixed
//! messages exchanged after it. All multi-byte fields are big-endian.

pub mod session;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::PeerError;

pub const PROTOCOL_STR: &[u8] = b"BitTorrent protocol";

/// Largest frame we will accept: one block message with a 1 MiB payload.
pub const MAX_FRAME_LEN: u32 = (1 << 20) + 9;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;
const ID_PORT: u8 = 9;

/// `<pstrlen><pstr><8 reserved><info_hash><peer_id>` — 68 bytes with the
/// standard protocol string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self { info_hash, peer_id }
    }

    pub fn encode(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = PROTOCOL_STR.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STR);
        // reserved bytes 20..28 stay zero
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Read a handshake off the wire: one length byte, then
    /// `pstrlen + 48` more. Anything but the standard protocol string is
    /// refused.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, PeerError>
    where
        R: AsyncRead + Unpin,
    {
        let pstrlen = reader.read_u8().await? as usize;
        if pstrlen == 0 {
            return Err(PeerError::UnknownProtocol);
        }
        let mut rest = vec![0u8; pstrlen + 48];
        reader.read_exact(&mut rest).await?;
        if &rest[..pstrlen] != PROTOCOL_STR {
            return Err(PeerError::UnknownProtocol);
        }
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&rest[pstrlen + 8..pstrlen + 28]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&rest[pstrlen + 28..pstrlen + 48]);
        Ok(Self { info_hash, peer_id })
    }
}

/// One `request`/`cancel` worth of addressing: which block of which piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(BlockInfo),
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel(BlockInfo),
    Port(u16),
}

impl Message {
    /// Serialize with the length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Message::KeepAlive => buf.extend_from_slice(&0u32.to_be_bytes()),
            Message::Choke => encode_bare(&mut buf, ID_CHOKE),
            Message::Unchoke => encode_bare(&mut buf, ID_UNCHOKE),
            Message::Interested => encode_bare(&mut buf, ID_INTERESTED),
            Message::NotInterested => encode_bare(&mut buf, ID_NOT_INTERESTED),
            Message::Have(index) => {
                buf.extend_from_slice(&5u32.to_be_bytes());
                buf.push(ID_HAVE);
                buf.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bits) => {
                buf.extend_from_slice(&(1 + bits.len() as u32).to_be_bytes());
                buf.push(ID_BITFIELD);
                buf.extend_from_slice(bits);
            }
            Message::Request(block) => encode_block_addr(&mut buf, ID_REQUEST, block),
            Message::Piece { index, begin, block } => {
                buf.extend_from_slice(&(9 + block.len() as u32).to_be_bytes());
                buf.push(ID_PIECE);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
            }
            Message::Cancel(block) => encode_block_addr(&mut buf, ID_CANCEL, block),
            Message::Port(port) => {
                buf.extend_from_slice(&3u32.to_be_bytes());
                buf.push(ID_PORT);
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        buf
    }

    /// Decode a frame body (everything after the length prefix). The
    /// caller maps a zero-length frame to `KeepAlive` before coming here.
    pub fn decode(body: &[u8]) -> Result<Message, PeerError> {
        let (&id, payload) = body
            .split_first()
            .ok_or(PeerError::Protocol("empty frame body"))?;
        match id {
            ID_CHOKE => expect_empty(payload, Message::Choke),
            ID_UNCHOKE => expect_empty(payload, Message::Unchoke),
            ID_INTERESTED => expect_empty(payload, Message::Interested),
            ID_NOT_INTERESTED => expect_empty(payload, Message::NotInterested),
            ID_HAVE => {
                if payload.len() != 4 {
                    return Err(PeerError::Protocol("have payload must be 4 bytes"));
                }
                Ok(Message::Have(be_u32(payload, 0)))
            }
            ID_BITFIELD => Ok(Message::Bitfield(payload.to_vec())),
            ID_REQUEST => Ok(Message::Request(decode_block_addr(payload)?)),
            ID_PIECE => {
                if payload.len() < 8 {
                    return Err(PeerError::Protocol("piece payload shorter than 8 bytes"));
                }
                Ok(Message::Piece {
                    index: be_u32(payload, 0),
                    begin: be_u32(payload, 4),
                    block: payload[8..].to_vec(),
                })
            }
            ID_CANCEL => Ok(Message::Cancel(decode_block_addr(payload)?)),
            ID_PORT => {
                if payload.len() != 2 {
                    return Err(PeerError::Protocol("port payload must be 2 bytes"));
                }
                Ok(Message::Port(u16::from_be_bytes([payload[0], payload[1]])))
            }
            _ => Err(PeerError::Protocol("unknown message id")),
        }
    }
}

fn encode_bare(buf: &mut Vec<u8>, id: u8) {
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.push(id);
}

fn encode_block_addr(buf: &mut Vec<u8>, id: u8, block: &BlockInfo) {
    buf.extend_from_slice(&13u32.to_be_bytes());
    buf.push(id);
    buf.extend_from_slice(&block.index.to_be_bytes());
    buf.extend_from_slice(&block.begin.to_be_bytes());
    buf.extend_from_slice(&block.length.to_be_bytes());
}

fn decode_block_addr(payload: &[u8]) -> Result<BlockInfo, PeerError> {
    if payload.len() != 12 {
        return Err(PeerError::Protocol("block address must be 12 bytes"));
    }
    Ok(BlockInfo {
        index: be_u32(payload, 0),
        begin: be_u32(payload, 4),
        length: be_u32(payload, 8),
    })
}

fn expect_empty(payload: &[u8], msg: Message) -> Result<Message, PeerError> {
    if payload.is_empty() {
        Ok(msg)
    } else {
        Err(PeerError::Protocol("unexpected payload on a bare message"))
    }
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(b)
}

/// Read one length-prefixed frame. Zero length is the keep-alive; a
/// length past [`MAX_FRAME_LEN`] tears the connection down.
pub async fn read_frame<R>(reader: &mut R) -> Result<Message, PeerError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len == 0 {
        return Ok(Message::KeepAlive);
    }
    if len > MAX_FRAME_LEN {
        return Err(PeerError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Message::decode(&body)
}

pub async fn write_frame<W>(writer: &mut W, message: &Message) -> Result<(), PeerError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    Ok(())
}
