// SPDX-FileCopyrightText: 2025 The odor Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! One task per peer: dial, handshake, then the active download loop.
//!
//! The session owns both halves of its socket; requests go out from the
//! same task that reads frames, so sends on a connection are totally
//! ordered. Scheduler state is touched only under its mutex and never
//! across an await on the network.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::bitfield::Bitfield;
use crate::errors::{PeerError, TorrentError};
use crate::networking::{read_frame, write_frame, BlockInfo, Handshake, Message};
use crate::torrent_manager::piece_manager::{AcceptResult, PieceManager};
use crate::torrent_manager::{CompletedPiece, PeerCommand, TorrentEvent};
use crate::tracker::PeerEndpoint;

use std::sync::Arc;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const BLOCK_DEADLINE: Duration = Duration::from_secs(30);
const EXPIRY_SWEEP: Duration = Duration::from_secs(5);

/// Outstanding-request window per connection.
const MAX_IN_FLIGHT: usize = 5;

pub struct PeerSessionParameters {
    pub endpoint: PeerEndpoint,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub piece_count: u32,
    pub scheduler: Arc<Mutex<PieceManager>>,
    pub piece_tx: Sender<CompletedPiece>,
    pub event_tx: Sender<TorrentEvent>,
    pub commands: Receiver<PeerCommand>,
    pub cancel: CancellationToken,
}

pub struct PeerSession {
    endpoint: PeerEndpoint,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    piece_count: u32,
    scheduler: Arc<Mutex<PieceManager>>,
    piece_tx: Sender<CompletedPiece>,
    event_tx: Sender<TorrentEvent>,

    am_choked: bool,
    am_interested: bool,
    peer_choked: bool,
    peer_interested: bool,
    remote: Option<Bitfield>,
    bitfield_seen: bool,
    /// Requests on the wire, with their issue times.
    in_flight: HashMap<BlockInfo, Instant>,
    /// Blocks reserved from the scheduler but not yet requested.
    backlog: VecDeque<BlockInfo>,
}

/// Drive one peer to completion. All failures are local to this peer;
/// the scheduler gets its outstanding work back on the way out.
pub async fn run(params: PeerSessionParameters) -> Result<(), PeerError> {
    let PeerSessionParameters {
        endpoint,
        info_hash,
        peer_id,
        piece_count,
        scheduler,
        piece_tx,
        event_tx,
        mut commands,
        cancel,
    } = params;

    let mut session = PeerSession {
        endpoint,
        info_hash,
        peer_id,
        piece_count,
        scheduler,
        piece_tx,
        event_tx,
        am_choked: true,
        am_interested: false,
        peer_choked: true,
        peer_interested: false,
        remote: None,
        bitfield_seen: false,
        in_flight: HashMap::new(),
        backlog: VecDeque::new(),
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(PeerError::Cancelled),
        outcome = session.drive(&mut commands) => outcome,
    };
    session.teardown().await;
    result
}

impl PeerSession {
    async fn drive(&mut self, commands: &mut Receiver<PeerCommand>) -> Result<(), PeerError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(self.endpoint.socket_addr()))
            .await
            .map_err(|_| PeerError::ConnectTimeout)??;
        let (mut rd, mut wr) = stream.into_split();

        let theirs = timeout(HANDSHAKE_TIMEOUT, async {
            wr.write_all(&Handshake::new(self.info_hash, self.peer_id).encode())
                .await?;
            Handshake::read_from(&mut rd).await
        })
        .await
        .map_err(|_| PeerError::ConnectTimeout)??;
        if theirs.info_hash != self.info_hash {
            return Err(PeerError::HandshakeMismatch);
        }
        debug!(peer = %self.endpoint, peer_id = %hex::encode(theirs.peer_id), "handshake done");

        // Most peers lead with their bitfield; a silent peer just starts
        // us from an all-zero view that `have`s fill in.
        match timeout(BITFIELD_TIMEOUT, read_frame(&mut rd)).await {
            Err(_) => trace!(peer = %self.endpoint, "no bitfield within the window"),
            Ok(first) => self.handle_message(first?).await?,
        }

        write_frame(&mut wr, &Message::Unchoke).await?;
        write_frame(&mut wr, &Message::Interested).await?;
        self.peer_choked = false;
        self.am_interested = true;

        let mut expiry = tokio::time::interval(EXPIRY_SWEEP);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.fill_window(&mut wr).await?;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(PeerCommand::SendHave(index)) => {
                        write_frame(&mut wr, &Message::Have(index)).await?;
                    }
                    Some(PeerCommand::Shutdown) | None => return Ok(()),
                },
                _ = expiry.tick() => self.release_expired().await,
                frame = timeout(IDLE_TIMEOUT, read_frame(&mut rd)) => {
                    let message = frame.map_err(|_| PeerError::IdleTimeout)??;
                    self.handle_message(message).await?;
                }
            }
        }
    }

    /// Keep the request pipeline full while the peer lets us download.
    async fn fill_window(&mut self, wr: &mut OwnedWriteHalf) -> Result<(), PeerError> {
        if self.am_choked || !self.am_interested {
            return Ok(());
        }
        while self.in_flight.len() < MAX_IN_FLIGHT {
            let next = match self.backlog.pop_front() {
                Some(block) => block,
                None => {
                    let Some(remote) = &self.remote else { return Ok(()) };
                    let mut scheduler = self.scheduler.lock().await;
                    if let Some(reservation) = scheduler.enqueue_piece(remote) {
                        drop(scheduler);
                        self.backlog.extend(reservation.blocks);
                        match self.backlog.pop_front() {
                            Some(block) => block,
                            None => return Ok(()),
                        }
                    } else if let Some(block) = scheduler.take_next_block(remote) {
                        block
                    } else {
                        return Ok(());
                    }
                }
            };
            write_frame(wr, &Message::Request(next)).await?;
            self.in_flight.insert(next, Instant::now());
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), PeerError> {
        match message {
            // The read itself already reset the idle deadline.
            Message::KeepAlive => {}
            Message::Choke => {
                self.am_choked = true;
                let outstanding: Vec<BlockInfo> = self
                    .in_flight
                    .drain()
                    .map(|(block, _)| block)
                    .chain(self.backlog.drain(..))
                    .collect();
                if !outstanding.is_empty() {
                    self.scheduler.lock().await.release_requested(outstanding);
                }
                debug!(peer = %self.endpoint, "choked");
            }
            Message::Unchoke => {
                self.am_choked = false;
                trace!(peer = %self.endpoint, "unchoked");
            }
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have(index) => {
                if index >= self.piece_count {
                    return Err(PeerError::Protocol("have index out of range"));
                }
                // Peers that never sent a bitfield start from an all-zero
                // view; registering it keeps availability symmetric with
                // the teardown path.
                if self.remote.is_none() {
                    let field = Bitfield::new(self.piece_count as usize);
                    self.scheduler.lock().await.register_bitfield(&field);
                    self.remote = Some(field);
                }
                let mut newly_set = false;
                if let Some(field) = &mut self.remote {
                    if !field.has(index as usize) {
                        field.set(index as usize);
                        newly_set = true;
                    }
                }
                if newly_set {
                    self.scheduler.lock().await.peer_has(index);
                }
            }
            Message::Bitfield(bits) => {
                if self.bitfield_seen {
                    return Err(PeerError::Protocol("second bitfield on one connection"));
                }
                let field = Bitfield::from_bytes(bits, self.piece_count as usize)
                    .ok_or(PeerError::Protocol("bitfield does not match piece count"))?;
                let mut scheduler = self.scheduler.lock().await;
                if let Some(old) = self.remote.take() {
                    scheduler.unregister_bitfield(&old);
                }
                scheduler.register_bitfield(&field);
                drop(scheduler);
                debug!(peer = %self.endpoint, pieces = field.count(), "bitfield received");
                self.remote = Some(field);
                self.bitfield_seen = true;
            }
            // We do not seed: acknowledge by ignoring.
            Message::Request(block) => {
                trace!(peer = %self.endpoint, ?block, "ignoring upload request")
            }
            Message::Cancel(_) | Message::Port(_) => {}
            Message::Piece { index, begin, block } => {
                self.accept_piece(index, begin, block).await?;
            }
        }
        Ok(())
    }

    async fn accept_piece(
        &mut self,
        index: u32,
        begin: u32,
        block: Vec<u8>,
    ) -> Result<(), PeerError> {
        let info = BlockInfo {
            index,
            begin,
            length: block.len() as u32,
        };
        if self.in_flight.remove(&info).is_none() {
            // Late arrival of something we released, or unsolicited data.
            trace!(peer = %self.endpoint, piece = index, begin, "block not in flight");
        }

        let verdict = self
            .scheduler
            .lock()
            .await
            .accept_block(index, begin, &block);
        match verdict {
            AcceptResult::Stored => {}
            AcceptResult::Duplicate => {
                trace!(peer = %self.endpoint, piece = index, begin, "duplicate block")
            }
            AcceptResult::NotRequested => {
                debug!(peer = %self.endpoint, piece = index, begin, "discarded unrequested block")
            }
            AcceptResult::OutOfRange => {
                return Err(PeerError::Protocol("piece message out of range"))
            }
            AcceptResult::HashMismatch { fatal } => {
                warn!(peer = %self.endpoint, piece = index, "assembled piece failed its hash");
                if fatal {
                    let _ = self
                        .event_tx
                        .send(TorrentEvent::Fatal(TorrentError::HashMismatch {
                            piece: index,
                        }))
                        .await;
                }
            }
            AcceptResult::PieceComplete(data) => {
                // Collector gone means shutdown is already under way.
                let _ = self.piece_tx.send(CompletedPiece { index, data }).await;
            }
        }
        Ok(())
    }

    /// Requests older than the per-block deadline go back to the pool.
    async fn release_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<BlockInfo> = self
            .in_flight
            .iter()
            .filter(|(_, issued)| now.duration_since(**issued) >= BLOCK_DEADLINE)
            .map(|(block, _)| *block)
            .collect();
        if expired.is_empty() {
            return;
        }
        for block in &expired {
            self.in_flight.remove(block);
        }
        debug!(peer = %self.endpoint, count = expired.len(), "block deadline expired");
        self.scheduler.lock().await.release_requested(expired);
    }

    /// Hand everything this peer still holds back to the scheduler.
    async fn teardown(&mut self) {
        let outstanding: Vec<BlockInfo> = self
            .in_flight
            .drain()
            .map(|(block, _)| block)
            .chain(self.backlog.drain(..))
            .collect();
        let mut scheduler = self.scheduler.lock().await;
        scheduler.release_requested(outstanding);
        if let Some(field) = &self.remote {
            scheduler.unregister_bitfield(field);
        }
        debug!(
            peer = %self.endpoint,
            was_choking_us = self.am_choked,
            we_choked_them = self.peer_choked,
            they_were_interested = self.peer_interested,
            "session closed"
        );
    }
}
