// SPDX-FileCopyrightText: 2025 The odor Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Drives a torrent end to end: announce, spawn one session per peer,
//! collect verified pieces, write them at their offsets, finish.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{PeerError, TorrentError, TrackerError};
use crate::networking::session::{self, PeerSessionParameters};
use crate::storage::FileLayout;
use crate::torrent_file::Metainfo;
use crate::torrent_manager::piece_manager::PieceManager;
use crate::torrent_manager::{
    CompletedPiece, PeerCommand, TorrentEvent, TorrentParameters,
};
use crate::tracker::client::{AnnounceRequest, UdpTracker};
use crate::tracker::{AnnounceEvent, AnnounceResponse, PeerEndpoint};

/// How long the farewell `completed` announce may hold up process exit.
const COMPLETED_ANNOUNCE_BUDGET: Duration = Duration::from_secs(5);

pub struct TorrentManager {
    metainfo: Arc<Metainfo>,
    layout: Arc<FileLayout>,
    scheduler: Arc<Mutex<PieceManager>>,
    params: TorrentParameters,
}

impl TorrentManager {
    pub fn new(metainfo: Metainfo, output_dir: &Path, params: TorrentParameters) -> Self {
        let metainfo = Arc::new(metainfo);
        let layout = Arc::new(FileLayout::from_metainfo(output_dir, &metainfo));
        let scheduler = Arc::new(Mutex::new(PieceManager::new(metainfo.clone())));
        Self {
            metainfo,
            layout,
            scheduler,
            params,
        }
    }

    pub async fn run(self) -> Result<(), TorrentError> {
        info!(
            name = %self.metainfo.info.name,
            infohash = %hex::encode(self.metainfo.info_hash),
            size = self.metainfo.total_size(),
            pieces = self.metainfo.piece_count(),
            "starting download"
        );
        let cancel = self.params.cancel.clone();

        let (peers, announce_url) = self.discover_peers().await?;
        if peers.is_empty() {
            return Err(TorrentError::NoPeers);
        }

        self.layout.allocate().await?;

        let (event_tx, mut event_rx) = mpsc::channel::<TorrentEvent>(64);
        let (piece_tx, piece_rx) = mpsc::channel::<CompletedPiece>(8);

        let collector = tokio::spawn(collect_pieces(
            self.metainfo.clone(),
            self.layout.clone(),
            self.scheduler.clone(),
            piece_rx,
            event_tx.clone(),
            cancel.clone(),
        ));

        let mut commands: HashMap<PeerEndpoint, mpsc::Sender<PeerCommand>> = HashMap::new();
        let mut workers = JoinSet::new();
        for endpoint in peers.into_iter().take(self.params.max_peers) {
            let (command_tx, command_rx) = mpsc::channel(16);
            commands.insert(endpoint, command_tx);
            let session_params = PeerSessionParameters {
                endpoint,
                info_hash: self.metainfo.info_hash,
                peer_id: self.params.peer_id,
                piece_count: self.metainfo.piece_count(),
                scheduler: self.scheduler.clone(),
                piece_tx: piece_tx.clone(),
                event_tx: event_tx.clone(),
                commands: command_rx,
                cancel: cancel.clone(),
            };
            workers.spawn(async move { (endpoint, session::run(session_params).await) });
        }
        debug!(workers = workers.len(), "peer sessions spawned");
        // Sessions hold the only other clones; dropping ours lets the
        // collector observe a closed channel once every session is gone.
        drop(piece_tx);

        let outcome = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break Err(TorrentError::Cancelled),
                _ = cancel.cancelled() => break Err(TorrentError::Cancelled),
                Some(event) = event_rx.recv() => match event {
                    TorrentEvent::PieceWritten(index) => {
                        let remaining = self.scheduler.lock().await.pieces_remaining();
                        info!(
                            piece = index,
                            remaining,
                            total = self.metainfo.piece_count(),
                            "piece written"
                        );
                        for command_tx in commands.values() {
                            let _ = command_tx.try_send(PeerCommand::SendHave(index));
                        }
                    }
                    TorrentEvent::DownloadComplete => break Ok(()),
                    TorrentEvent::Fatal(error) => break Err(error),
                },
                Some(joined) = workers.join_next() => {
                    match joined {
                        Ok((endpoint, result)) => {
                            commands.remove(&endpoint);
                            match result {
                                Ok(()) | Err(PeerError::Cancelled) => {
                                    debug!(peer = %endpoint, "peer session ended")
                                }
                                Err(error) => {
                                    debug!(peer = %endpoint, %error, "peer session failed")
                                }
                            }
                        }
                        Err(join_error) => warn!(%join_error, "peer task aborted"),
                    }
                    if workers.is_empty() && !self.scheduler.lock().await.is_done() {
                        break Err(TorrentError::NoPeers);
                    }
                }
            }
        };

        // Graceful shutdown: stop every session, then wait for each one
        // to hand its outstanding work back before we return.
        for command_tx in commands.values() {
            let _ = command_tx.try_send(PeerCommand::Shutdown);
        }
        cancel.cancel();
        while workers.join_next().await.is_some() {}
        let _ = collector.await;

        if outcome.is_ok() {
            info!(name = %self.metainfo.info.name, "download complete");
            self.announce_completed(&announce_url).await;
        }
        outcome
    }

    /// Announce `started` against the first tracker that answers,
    /// walking the announce-list before giving up.
    async fn discover_peers(&self) -> Result<(Vec<PeerEndpoint>, String), TorrentError> {
        let request = AnnounceRequest {
            info_hash: self.metainfo.info_hash,
            peer_id: self.params.peer_id,
            downloaded: 0,
            left: self.metainfo.total_size(),
            uploaded: 0,
            event: AnnounceEvent::Started,
            port: self.params.listen_port,
        };

        let mut last_error: Option<TrackerError> = None;
        for url in self.metainfo.announce_urls() {
            match announce_once(&url, &request, self.params.cancel.clone()).await {
                Ok(response) => {
                    info!(
                        tracker = %url,
                        peers = response.peers.len(),
                        seeders = response.seeders,
                        leechers = response.leechers,
                        interval = response.interval,
                        "announce accepted"
                    );
                    return Ok((response.peers, url));
                }
                Err(TrackerError::Cancelled) => return Err(TorrentError::Cancelled),
                Err(error) => {
                    warn!(tracker = %url, %error, "tracker unusable, trying the next one");
                    last_error = Some(error);
                }
            }
        }
        Err(TorrentError::Tracker(
            last_error.unwrap_or(TrackerError::Timeout),
        ))
    }

    /// Best effort: the swarm benefits from knowing we finished, but a
    /// deaf tracker must not hold the exit hostage.
    async fn announce_completed(&self, announce_url: &str) {
        let request = AnnounceRequest {
            info_hash: self.metainfo.info_hash,
            peer_id: self.params.peer_id,
            downloaded: self.metainfo.total_size(),
            left: 0,
            uploaded: 0,
            event: AnnounceEvent::Completed,
            port: self.params.listen_port,
        };
        let attempt = timeout(
            COMPLETED_ANNOUNCE_BUDGET,
            announce_once(announce_url, &request, CancellationToken::new()),
        )
        .await;
        match attempt {
            Ok(Ok(_)) => debug!(tracker = %announce_url, "completed announce sent"),
            Ok(Err(error)) => debug!(%error, "completed announce failed"),
            Err(_) => debug!("completed announce timed out"),
        }
    }
}

async fn announce_once(
    url: &str,
    request: &AnnounceRequest,
    cancel: CancellationToken,
) -> Result<AnnounceResponse, TrackerError> {
    let tracker = UdpTracker::bind(url, cancel).await?;
    let connection_id = tracker.connect().await?;
    tracker.announce(connection_id, request).await
}

/// The collector: authoritative SHA-1 check, then a positional write at
/// the piece's global offset. Runs until the torrent finishes, the piece
/// channel drains, or shutdown.
async fn collect_pieces(
    metainfo: Arc<Metainfo>,
    layout: Arc<FileLayout>,
    scheduler: Arc<Mutex<PieceManager>>,
    mut piece_rx: mpsc::Receiver<CompletedPiece>,
    event_tx: mpsc::Sender<TorrentEvent>,
    cancel: CancellationToken,
) {
    // Completion is judged by what actually reached the disk, not by the
    // scheduler: with several peers racing, the scheduler can already be
    // done while the final piece is still in the channel.
    let mut unwritten = metainfo.piece_count() as usize;

    while unwritten > 0 {
        let piece = tokio::select! {
            _ = cancel.cancelled() => return,
            received = piece_rx.recv() => match received {
                Some(piece) => piece,
                None => return,
            },
        };

        let digest: [u8; 20] = Sha1::digest(&piece.data).into();
        if digest != metainfo.piece_hash(piece.index) {
            warn!(piece = piece.index, "collector rejected piece, rescheduling");
            let fatal = scheduler.lock().await.invalidate_piece(piece.index);
            if fatal {
                let _ = event_tx
                    .send(TorrentEvent::Fatal(TorrentError::HashMismatch {
                        piece: piece.index,
                    }))
                    .await;
                return;
            }
            continue;
        }

        let (start, _) = metainfo.piece_bounds(piece.index);
        if let Err(error) = layout.write_at(start, &piece.data).await {
            let _ = event_tx.send(TorrentEvent::Fatal(error.into())).await;
            return;
        }
        unwritten -= 1;
        debug!(piece = piece.index, offset = start, "piece flushed to disk");
        let _ = event_tx.send(TorrentEvent::PieceWritten(piece.index)).await;
    }

    let _ = event_tx.send(TorrentEvent::DownloadComplete).await;
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, UdpSocket};

    use super::*;
    use crate::bitfield::Bitfield;
    use crate::networking::{read_frame, write_frame, Handshake, Message};
    use crate::torrent_file::parser;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("odor-e2e-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Loopback BEP-15 tracker whose announces hand out `peer`.
    async fn spawn_tracker(peer: std::net::SocketAddr) -> u16 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let mut reply = Vec::new();
                if len == 16 {
                    reply.extend_from_slice(&0u32.to_be_bytes());
                    reply.extend_from_slice(&buf[12..16]);
                    reply.extend_from_slice(&0xfeed_beef_u64.to_be_bytes());
                } else {
                    reply.extend_from_slice(&1u32.to_be_bytes());
                    reply.extend_from_slice(&buf[12..16]);
                    reply.extend_from_slice(&1800u32.to_be_bytes());
                    reply.extend_from_slice(&0u32.to_be_bytes());
                    reply.extend_from_slice(&1u32.to_be_bytes());
                    if let std::net::SocketAddr::V4(v4) = peer {
                        reply.extend_from_slice(&v4.ip().octets());
                        reply.extend_from_slice(&v4.port().to_be_bytes());
                    }
                }
                if socket.send_to(&reply, from).await.is_err() {
                    break;
                }
            }
        });
        port
    }

    /// Loopback seeder holding all of `data`. `choke_between_blocks`
    /// makes it choke and immediately unchoke after every block served,
    /// which forces the client down the release/re-request path.
    async fn spawn_seeder(
        metainfo: Arc<Metainfo>,
        data: Vec<u8>,
        choke_between_blocks: bool,
    ) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let metainfo = metainfo.clone();
                let data = data.clone();
                tokio::spawn(async move {
                    // The serve loop runs until the client hangs up.
                    let _closed: Result<(), crate::errors::PeerError> = async {
                        let (mut rd, mut wr) = stream.split();
                        let theirs = Handshake::read_from(&mut rd).await?;
                        wr.write_all(
                            &Handshake::new(theirs.info_hash, [0x5e; 20]).encode(),
                        )
                        .await?;

                        let piece_count = metainfo.piece_count() as usize;
                        let mut field = Bitfield::new(piece_count);
                        for i in 0..piece_count {
                            field.set(i);
                        }
                        write_frame(&mut wr, &Message::Bitfield(field.as_bytes().to_vec()))
                            .await?;

                        loop {
                            match read_frame(&mut rd).await? {
                                Message::Interested => {
                                    write_frame(&mut wr, &Message::Unchoke).await?;
                                }
                                Message::Request(block) => {
                                    let (start, _) = metainfo.piece_bounds(block.index);
                                    let lo = start as usize + block.begin as usize;
                                    let chunk =
                                        data[lo..lo + block.length as usize].to_vec();
                                    write_frame(
                                        &mut wr,
                                        &Message::Piece {
                                            index: block.index,
                                            begin: block.begin,
                                            block: chunk,
                                        },
                                    )
                                    .await?;
                                    if choke_between_blocks {
                                        write_frame(&mut wr, &Message::Choke).await?;
                                        write_frame(&mut wr, &Message::Unchoke).await?;
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    .await;
                });
            }
        });
        addr
    }

    async fn run_download(
        tag: &str,
        data: Vec<u8>,
        piece_length: u64,
        choke_between_blocks: bool,
    ) -> (PathBuf, Vec<u8>) {
        let torrent =
            parser::tests::build_single_file_torrent("blob.bin", piece_length, &data);
        let mut metainfo = parser::from_bytes(&torrent).unwrap();

        let seeder_addr =
            spawn_seeder(Arc::new(metainfo.clone()), data.clone(), choke_between_blocks)
                .await;
        let tracker_port = spawn_tracker(seeder_addr).await;
        metainfo.announce = format!("udp://127.0.0.1:{tracker_port}");

        let out_dir = scratch_dir(tag);
        let manager = TorrentManager::new(
            metainfo,
            &out_dir,
            TorrentParameters {
                peer_id: *b"-OD0100-e2e0test0000",
                listen_port: 6881,
                max_peers: 30,
                cancel: CancellationToken::new(),
            },
        );
        timeout(Duration::from_secs(30), manager.run())
            .await
            .expect("download deadline")
            .expect("download failed");
        (out_dir, data)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn downloads_a_three_piece_torrent_from_one_seeder() {
        let data: Vec<u8> = (0..65_553u32)
            .map(|i| (i.wrapping_mul(31) % 251) as u8)
            .collect();
        let (out_dir, expected) = run_download("happy", data, 32_768, false).await;

        let written = std::fs::read(out_dir.join("blob.bin")).unwrap();
        assert_eq!(written.len(), 65_553);
        assert_eq!(written, expected);

        // Every piece of the output hashes back to the metainfo.
        for (i, chunk) in written.chunks(32_768).enumerate() {
            let digest: [u8; 20] = Sha1::digest(chunk).into();
            let reference: [u8; 20] =
                Sha1::digest(&expected[i * 32_768..(i * 32_768 + chunk.len())]).into();
            assert_eq!(digest, reference);
        }
        std::fs::remove_dir_all(&out_dir).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn survives_a_peer_that_chokes_between_blocks() {
        let data: Vec<u8> = (0..32_868u32).map(|i| (i % 247) as u8).collect();
        let (out_dir, expected) = run_download("choker", data, 16_384, true).await;

        let written = std::fs::read(out_dir.join("blob.bin")).unwrap();
        assert_eq!(written, expected);
        std::fs::remove_dir_all(&out_dir).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn downloads_a_one_byte_torrent() {
        let (out_dir, expected) = run_download("tiny", vec![0x42], 1, false).await;
        let written = std::fs::read(out_dir.join("blob.bin")).unwrap();
        assert_eq!(written, expected);
        std::fs::remove_dir_all(&out_dir).ok();
    }

    #[tokio::test]
    async fn discover_peers_falls_through_to_a_working_tracker() {
        let data = vec![1u8; 64];
        let torrent = parser::tests::build_single_file_torrent("x", 64, &data);
        let mut metainfo = parser::from_bytes(&torrent).unwrap();

        let tracker_port = spawn_tracker("127.0.0.1:9".parse().unwrap()).await;
        metainfo.announce = "http://not-a-udp-tracker.example/announce".into();
        metainfo.announce_list = Some(vec![vec![format!("udp://127.0.0.1:{tracker_port}")]]);

        let manager = TorrentManager::new(
            metainfo,
            &scratch_dir("failover"),
            TorrentParameters {
                peer_id: [7; 20],
                listen_port: 6881,
                max_peers: 30,
                cancel: CancellationToken::new(),
            },
        );
        let (peers, url) = manager.discover_peers().await.unwrap();
        assert_eq!(url, format!("udp://127.0.0.1:{tracker_port}"));
        assert_eq!(peers.len(), 1);
    }
}
