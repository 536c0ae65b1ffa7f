// SPDX-FileCopyrightText: 2025 The odor Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod bencode;
mod bitfield;
mod errors;
mod networking;
mod storage;
mod torrent_file;
mod torrent_manager;
mod tracker;

use std::io;
use std::path::{Path, PathBuf};

use clap::Parser;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::errors::TorrentError;
use crate::torrent_manager::{TorrentManager, TorrentParameters};

/// Port reported to trackers; inbound connections are not accepted.
const DEFAULT_PORT: u16 = 6881;
const MAX_PEERS: usize = 30;

#[derive(Parser, Debug)]
#[command(name = "odor", version, about = "Download a torrent from a UDP-tracker swarm")]
struct Cli {
    /// Path to the .torrent file
    torrent: PathBuf,
    /// Directory to download into; defaults to ~/Odor
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        match error {
            TorrentError::Cancelled => eprintln!("odor: interrupted"),
            other => eprintln!("odor: {other}"),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), TorrentError> {
    let output_dir = match cli.output {
        Some(path) => path,
        None => default_output_dir()?,
    };

    let raw = tokio::fs::read(&cli.torrent).await?;
    let metainfo = torrent_file::parser::from_bytes(&raw)?;
    tracing::debug!("parsed torrent file: {metainfo}");
    let name = metainfo.info.name.clone();

    let params = TorrentParameters {
        peer_id: generate_peer_id(),
        listen_port: DEFAULT_PORT,
        max_peers: MAX_PEERS,
        cancel: CancellationToken::new(),
    };
    TorrentManager::new(metainfo, &output_dir, params)
        .run()
        .await?;

    println!("{} saved under {}", name, output_dir.display());
    Ok(())
}

/// `$HOME/Odor`, created private to the user when missing.
fn default_output_dir() -> Result<PathBuf, TorrentError> {
    let home = std::env::var_os("HOME").ok_or_else(|| {
        TorrentError::Io(io::Error::new(io::ErrorKind::NotFound, "HOME is not set"))
    })?;
    let path = PathBuf::from(home).join("Odor");
    create_private_dir(&path)?;
    Ok(path)
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    std::fs::DirBuilder::new().recursive(true).create(path)
}

/// Azureus-style peer id: client prefix plus random alphanumerics,
/// generated once per run.
fn generate_peer_id() -> [u8; 20] {
    const CLIENT_PREFIX: &[u8] = b"-OD0100-";
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let mut id = [0u8; 20];
    id[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in id[CLIENT_PREFIX.len()..].iter_mut() {
        *byte = CHARSET[rng.gen_range(0..CHARSET.len())];
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_ids_carry_the_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-OD0100-");
        assert!(id[8..].iter().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn peer_ids_differ_between_calls() {
        // Twelve random alphanumerics colliding twice in a row would
        // point at a broken generator.
        assert_ne!(generate_peer_id(), generate_peer_id());
    }
}
