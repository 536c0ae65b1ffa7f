// SPDX-FileCopyrightText: 2025 The odor Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

/// Decoder-level bencode failures. Every variant carries the byte position
/// at which the decoder gave up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BencodeError {
    #[error("input ended before the value was complete")]
    UnexpectedEnd,

    #[error("syntax error at byte {pos}: {reason}")]
    Syntax { pos: usize, reason: &'static str },

    #[error("integer with a leading zero at byte {0}")]
    LeadingZero(usize),

    #[error("negative zero integer at byte {0}")]
    NegativeZero(usize),

    #[error("dictionary keys out of order at byte {0}")]
    UnsortedKeys(usize),

    #[error("duplicate dictionary key at byte {0}")]
    DuplicateKey(usize),

    #[error("byte string length overflows at byte {0}")]
    StringLengthOverflow(usize),
}

/// Shape violations found while projecting a decoded torrent file into the
/// typed metainfo model.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error(transparent)]
    Bencode(#[from] BencodeError),

    #[error("torrent file is not a bencoded dictionary")]
    NotADictionary,

    #[error("torrent file has trailing data after the root dictionary")]
    TrailingData,

    #[error("missing required key `{0}`")]
    MissingKey(&'static str),

    #[error("key `{0}` has the wrong bencode type")]
    WrongType(&'static str),

    #[error("`pieces` length is not a multiple of 20")]
    MalformedPieces,

    #[error("`pieces` holds {hashes} hashes but the file lengths imply {expected} pieces")]
    PieceCountMismatch { hashes: usize, expected: usize },

    #[error("`piece length` must be positive")]
    BadPieceLength,
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("tracker I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("announce URL `{0}` is not a UDP tracker")]
    UnsupportedScheme(String),

    #[error("announce URL `{0}` could not be parsed")]
    InvalidUrl(String),

    #[error("announce URL `{0}` did not resolve to an IPv4 address")]
    Unresolvable(String),

    #[error("tracker did not answer after the retry budget was exhausted")]
    Timeout,

    #[error("malformed tracker response: {0}")]
    Malformed(&'static str),

    #[error("tracker echoed a foreign transaction id")]
    TransactionMismatch,

    #[error("shutdown requested")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("peer I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer answered the handshake with a different infohash")]
    HandshakeMismatch,

    #[error("peer speaks an unknown protocol")]
    UnknownProtocol,

    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(u32),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("peer idle past the read deadline")]
    IdleTimeout,

    #[error("peer connection timed out")]
    ConnectTimeout,

    #[error("shutdown requested")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("an I/O error occurred")]
    Io(#[from] std::io::Error),

    #[error("write at offset {offset} falls outside the torrent's {total} bytes")]
    OutOfBounds { offset: u64, total: u64 },
}

/// Top-level error surfaced by the orchestrator. Everything the binary can
/// die of funnels through here.
#[derive(Error, Debug)]
pub enum TorrentError {
    #[error("invalid torrent file: {0}")]
    Parse(#[from] ParseError),

    #[error("tracker failure: {0}")]
    Tracker(#[from] TrackerError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece {piece} failed verification on every attempt")]
    HashMismatch { piece: u32 },

    #[error("no usable peers remain in the swarm")]
    NoPeers,

    #[error("interrupted")]
    Cancelled,
}
