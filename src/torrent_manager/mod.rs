// SPDX-FileCopyrightText: 2025 The odor Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod manager;
pub mod piece_manager;

use tokio_util::sync::CancellationToken;

use crate::errors::TorrentError;

pub use manager::TorrentManager;

pub struct TorrentParameters {
    pub peer_id: [u8; 20],
    /// Port reported to the tracker. We do not accept inbound
    /// connections, but the announce format wants one.
    pub listen_port: u16,
    /// Cap on concurrently connected peers.
    pub max_peers: usize,
    pub cancel: CancellationToken,
}

/// A fully assembled, scheduler-verified piece on its way to the
/// collector for the authoritative check and the disk write.
#[derive(Debug)]
pub struct CompletedPiece {
    pub index: u32,
    pub data: Vec<u8>,
}

/// Manager-to-session commands.
#[derive(Debug, Clone, Copy)]
pub enum PeerCommand {
    SendHave(u32),
    Shutdown,
}

/// Events flowing back to the manager from sessions and the collector.
#[derive(Debug)]
pub enum TorrentEvent {
    PieceWritten(u32),
    DownloadComplete,
    Fatal(TorrentError),
}
