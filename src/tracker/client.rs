// SPDX-FileCopyrightText: 2025 The odor Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! UDP tracker client (BEP-15).
//!
//! Connect and announce run sequentially over one connected socket. Each
//! exchange is retried with a `15 * 2^n` second read deadline, n = 0..=8,
//! resending the same transaction until the tracker answers or the retry
//! budget runs out.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::errors::TrackerError;
use crate::tracker::{AnnounceEvent, AnnounceResponse, PeerEndpoint};

const PROTOCOL_MAGIC: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const MAX_RETRIES: u32 = 8;
const RETRY_BASE_SECS: u64 = 15;

/// Everything an announce reports about us.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: AnnounceEvent,
    pub port: u16,
}

#[derive(Debug)]
pub struct UdpTracker {
    socket: UdpSocket,
    cancel: CancellationToken,
}

impl UdpTracker {
    /// Resolve a `udp://host:port[/path]` announce URL and connect the
    /// socket to it. Non-UDP schemes are refused here so callers can fall
    /// through to the next tracker in the list.
    pub async fn bind(announce_url: &str, cancel: CancellationToken) -> Result<Self, TrackerError> {
        let url = Url::parse(announce_url)
            .map_err(|_| TrackerError::InvalidUrl(announce_url.to_owned()))?;
        if url.scheme() != "udp" {
            return Err(TrackerError::UnsupportedScheme(announce_url.to_owned()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| TrackerError::InvalidUrl(announce_url.to_owned()))?;
        let port = url
            .port()
            .ok_or_else(|| TrackerError::InvalidUrl(announce_url.to_owned()))?;

        let addr = lookup_host((host, port))
            .await?
            .find(|a| matches!(a, SocketAddr::V4(_)))
            .ok_or_else(|| TrackerError::Unresolvable(announce_url.to_owned()))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        debug!(tracker = %addr, "udp tracker socket connected");
        Ok(Self { socket, cancel })
    }

    /// Obtain a connection id from the tracker.
    pub async fn connect(&self) -> Result<u64, TrackerError> {
        let transaction_id: u32 = rand::thread_rng().gen();

        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());

        let response = self.exchange(&request).await?;
        parse_connect_response(&response, transaction_id)
    }

    /// Announce under `connection_id` and collect the returned peer list.
    pub async fn announce(
        &self,
        connection_id: u64,
        req: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        let transaction_id: u32 = rand::thread_rng().gen();
        let key: u32 = rand::thread_rng().gen();

        let mut request = Vec::with_capacity(98);
        request.extend_from_slice(&connection_id.to_be_bytes());
        request.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());
        request.extend_from_slice(&req.info_hash);
        request.extend_from_slice(&req.peer_id);
        request.extend_from_slice(&req.downloaded.to_be_bytes());
        request.extend_from_slice(&req.left.to_be_bytes());
        request.extend_from_slice(&req.uploaded.to_be_bytes());
        request.extend_from_slice(&(req.event as u32).to_be_bytes());
        request.extend_from_slice(&0u32.to_be_bytes()); // ip: let the tracker use the source
        request.extend_from_slice(&key.to_be_bytes());
        request.extend_from_slice(&(-1i32 as u32).to_be_bytes()); // num_want: default
        request.extend_from_slice(&req.port.to_be_bytes());

        let response = self.exchange(&request).await?;
        parse_announce_response(&response, transaction_id)
    }

    /// Send `request` and wait for a datagram, backing off exponentially.
    /// The same payload (same transaction id) goes out on every retry.
    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, TrackerError> {
        let mut buf = [0u8; 2048];
        for attempt in 0..=MAX_RETRIES {
            self.socket.send(request).await?;
            let deadline = Duration::from_secs(RETRY_BASE_SECS * (1 << attempt));

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TrackerError::Cancelled),
                outcome = timeout(deadline, self.socket.recv(&mut buf)) => match outcome {
                    Ok(Ok(len)) => return Ok(buf[..len].to_vec()),
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => {
                        warn!(attempt, "tracker read deadline expired, resending");
                    }
                },
            }
        }
        Err(TrackerError::Timeout)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(b)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(b)
}

fn parse_connect_response(buf: &[u8], transaction_id: u32) -> Result<u64, TrackerError> {
    if buf.len() < 16 {
        return Err(TrackerError::Malformed("connect response shorter than 16 bytes"));
    }
    if read_u32(buf, 0) != ACTION_CONNECT {
        return Err(TrackerError::Malformed("connect response with wrong action"));
    }
    if read_u32(buf, 4) != transaction_id {
        return Err(TrackerError::TransactionMismatch);
    }
    Ok(read_u64(buf, 8))
}

fn parse_announce_response(
    buf: &[u8],
    transaction_id: u32,
) -> Result<AnnounceResponse, TrackerError> {
    if buf.len() < 20 {
        return Err(TrackerError::Malformed("announce response shorter than 20 bytes"));
    }
    if read_u32(buf, 0) != ACTION_ANNOUNCE {
        return Err(TrackerError::Malformed("announce response with wrong action"));
    }
    if read_u32(buf, 4) != transaction_id {
        return Err(TrackerError::TransactionMismatch);
    }
    let interval = read_u32(buf, 8);
    let leechers = read_u32(buf, 12);
    let seeders = read_u32(buf, 16);

    let peers_raw = &buf[20..];
    if peers_raw.len() % 6 != 0 {
        return Err(TrackerError::Malformed("peer list not a multiple of 6 bytes"));
    }
    let peers = peers_raw
        .chunks_exact(6)
        .map(|chunk| PeerEndpoint {
            ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect();

    Ok(AnnounceResponse {
        interval,
        leechers,
        seeders,
        peers,
    })
}
