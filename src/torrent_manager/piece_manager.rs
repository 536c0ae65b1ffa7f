// SPDX-FileCopyrightText: 2025 The odor Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Block-level download scheduler.
//!
//! Two independent bit-vectors per piece track which blocks have been
//! requested and which have arrived; `requested` always covers
//! `received`. Piece selection is rarest-first over the availability
//! counts reported by peer bitfields, ties broken by lowest index.
//! Every public operation is one critical section — callers hold the
//! mutex only for the call, never across I/O.

use std::collections::HashMap;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tracing::{debug, event, Level};

use crate::bitfield::Bitfield;
use crate::networking::BlockInfo;
use crate::torrent_file::{Metainfo, BLOCK_LEN};

/// Verification failures tolerated per piece before the torrent is
/// declared undownloadable.
pub const MAX_HASH_FAILURES: u8 = 5;

/// Outcome of feeding one `piece` message into the scheduler.
#[derive(Debug, PartialEq, Eq)]
pub enum AcceptResult {
    /// Block stored; the piece is still incomplete.
    Stored,
    /// Final block stored and the piece hash checked out.
    PieceComplete(Vec<u8>),
    /// All blocks arrived but the SHA-1 did not match; the piece has
    /// been rescheduled (unless `fatal`).
    HashMismatch { fatal: bool },
    /// The message addresses bytes outside the torrent's geometry.
    OutOfRange,
    /// The block was already received (or the piece already verified).
    Duplicate,
    /// Nobody asked for this block (or its request was released); the
    /// data is discarded, not stored.
    NotRequested,
}

/// A full piece worth of block requests, handed to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceReservation {
    pub index: u32,
    pub blocks: Vec<BlockInfo>,
}

pub struct PieceManager {
    metainfo: Arc<Metainfo>,
    requested: Vec<Vec<bool>>,
    received: Vec<Vec<bool>>,
    verified: Vec<bool>,
    /// In-progress piece buffers, keyed by piece index.
    assembly: HashMap<u32, Vec<u8>>,
    /// How many connected peers advertise each piece.
    availability: Vec<u32>,
    hash_failures: Vec<u8>,
    pieces_remaining: usize,
}

impl PieceManager {
    pub fn new(metainfo: Arc<Metainfo>) -> Self {
        let piece_count = metainfo.piece_count();
        let requested = (0..piece_count)
            .map(|i| vec![false; metainfo.blocks_in_piece(i) as usize])
            .collect();
        let received = (0..piece_count)
            .map(|i| vec![false; metainfo.blocks_in_piece(i) as usize])
            .collect();
        Self {
            requested,
            received,
            verified: vec![false; piece_count as usize],
            assembly: HashMap::new(),
            availability: vec![0; piece_count as usize],
            hash_failures: vec![0; piece_count as usize],
            pieces_remaining: piece_count as usize,
            metainfo,
        }
    }

    /// Fold a freshly-arrived peer bitfield into the availability counts.
    pub fn register_bitfield(&mut self, field: &Bitfield) {
        for (index, count) in self.availability.iter_mut().enumerate() {
            if field.has(index) {
                *count += 1;
            }
        }
    }

    /// Undo [`register_bitfield`] when a peer goes away.
    pub fn unregister_bitfield(&mut self, field: &Bitfield) {
        for (index, count) in self.availability.iter_mut().enumerate() {
            if field.has(index) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// A `have` landed after the peer's bitfield was registered.
    pub fn peer_has(&mut self, index: u32) {
        if let Some(count) = self.availability.get_mut(index as usize) {
            *count += 1;
        }
    }

    /// Reserve an entire untouched piece for one peer: every block is
    /// marked requested and returned as a request list.
    pub fn enqueue_piece(&mut self, field: &Bitfield) -> Option<PieceReservation> {
        let index = self.pick_piece(field, true)?;
        let blocks: Vec<BlockInfo> = (0..self.metainfo.blocks_in_piece(index))
            .map(|k| BlockInfo {
                index,
                begin: k * BLOCK_LEN,
                length: self.metainfo.block_len(index, k),
            })
            .collect();
        for flag in &mut self.requested[index as usize] {
            *flag = true;
        }
        Some(PieceReservation { index, blocks })
    }

    /// Claim the single next not-yet-requested block this peer can serve.
    /// Picks up stragglers of partially-requested pieces, so it is the
    /// path peers fall back to once no whole piece is left to reserve.
    pub fn take_next_block(&mut self, field: &Bitfield) -> Option<BlockInfo> {
        let index = self.pick_piece(field, false)?;
        let row = &mut self.requested[index as usize];
        let k = row.iter().position(|requested| !requested)?;
        row[k] = true;
        Some(BlockInfo {
            index,
            begin: k as u32 * BLOCK_LEN,
            length: self.metainfo.block_len(index, k as u32),
        })
    }

    /// Return requested-but-unreceived blocks to the pool, so another
    /// peer can claim them. Used on choke, peer loss and request expiry.
    pub fn release_requested<I>(&mut self, outstanding: I)
    where
        I: IntoIterator<Item = BlockInfo>,
    {
        for block in outstanding {
            let (Some(piece), Some(received)) = (
                self.requested.get_mut(block.index as usize),
                self.received.get(block.index as usize),
            ) else {
                continue;
            };
            let k = (block.begin / BLOCK_LEN) as usize;
            if k < piece.len() && !received[k] {
                piece[k] = false;
            }
        }
    }

    /// Validate and store one block: geometry, duplication, and that the
    /// block is actually on request. Completing a piece triggers SHA-1
    /// verification in place.
    pub fn accept_block(&mut self, index: u32, begin: u32, bytes: &[u8]) -> AcceptResult {
        if index >= self.metainfo.piece_count() || begin % BLOCK_LEN != 0 {
            return AcceptResult::OutOfRange;
        }
        let k = (begin / BLOCK_LEN) as usize;
        let blocks_in_piece = self.metainfo.blocks_in_piece(index) as usize;
        if k >= blocks_in_piece
            || bytes.len() != self.metainfo.block_len(index, k as u32) as usize
        {
            return AcceptResult::OutOfRange;
        }
        if self.verified[index as usize] || self.received[index as usize][k] {
            return AcceptResult::Duplicate;
        }
        // A block whose request was released (choke, deadline, peer
        // loss) reads as unsolicited here too; whoever re-claims it
        // re-requests first, so dropping the stale copy is safe.
        if !self.requested[index as usize][k] {
            return AcceptResult::NotRequested;
        }

        let piece_len = self.metainfo.piece_len(index) as usize;
        let buffer = self
            .assembly
            .entry(index)
            .or_insert_with(|| vec![0; piece_len]);
        buffer[begin as usize..begin as usize + bytes.len()].copy_from_slice(bytes);
        self.received[index as usize][k] = true;

        if self.received[index as usize].iter().all(|&r| r) {
            let Some(data) = self.assembly.remove(&index) else {
                return AcceptResult::Stored;
            };
            let digest: [u8; 20] = Sha1::digest(&data).into();
            if digest == self.metainfo.piece_hash(index) {
                self.verified[index as usize] = true;
                self.pieces_remaining -= 1;
                debug!(piece = index, remaining = self.pieces_remaining, "piece verified");
                return AcceptResult::PieceComplete(data);
            }
            let fatal = self.reschedule_failed(index);
            return AcceptResult::HashMismatch { fatal };
        }
        AcceptResult::Stored
    }

    /// A downstream verifier rejected an already-complete piece. Clears
    /// it for re-download; returns true when the failure budget is gone.
    pub fn invalidate_piece(&mut self, index: u32) -> bool {
        if index >= self.metainfo.piece_count() {
            return false;
        }
        if self.verified[index as usize] {
            self.verified[index as usize] = false;
            self.pieces_remaining += 1;
        }
        self.reschedule_failed(index)
    }

    pub fn is_done(&self) -> bool {
        self.pieces_remaining == 0
    }

    pub fn pieces_remaining(&self) -> usize {
        self.pieces_remaining
    }

    fn reschedule_failed(&mut self, index: u32) -> bool {
        self.assembly.remove(&index);
        self.received[index as usize].fill(false);
        self.requested[index as usize].fill(false);
        self.hash_failures[index as usize] =
            self.hash_failures[index as usize].saturating_add(1);
        event!(
            Level::WARN,
            piece = index,
            failures = self.hash_failures[index as usize],
            "piece rescheduled after verification failure"
        );
        self.hash_failures[index as usize] >= MAX_HASH_FAILURES
    }

    /// Rarest-first selection among pieces the peer advertises and we
    /// still need; ties go to the lowest index. With `untouched` the
    /// piece must have no requested block at all (whole-piece
    /// reservation), otherwise one free block suffices.
    fn pick_piece(&self, field: &Bitfield, untouched: bool) -> Option<u32> {
        (0..self.metainfo.piece_count())
            .filter(|&i| field.has(i as usize) && !self.verified[i as usize])
            .filter(|&i| {
                let row = &self.requested[i as usize];
                if untouched {
                    row.iter().all(|&requested| !requested)
                } else {
                    row.iter().any(|&requested| !requested)
                }
            })
            .min_by_key(|&i| (self.availability[i as usize], i))
    }
}
