// SPDX-FileCopyrightText: 2025 The odor Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Typed view over a parsed torrent file, plus the piece geometry every
//! other subsystem leans on.

pub mod parser;

use std::fmt;

/// Transfer granularity of the peer wire protocol: 2^14 bytes.
pub const BLOCK_LEN: u32 = 16_384;

#[derive(Debug, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub encoding: Option<String>,
    pub info: Info,
    pub info_hash: [u8; 20],
}

#[derive(Debug, Clone)]
pub struct Info {
    pub name: String,
    pub piece_length: u64,
    /// One 20-byte SHA-1 per piece, in piece order.
    pub pieces: Vec<[u8; 20]>,
    pub private: Option<i64>,
    pub mode: FileMode,
}

/// Single-file torrents carry one length; multi-file torrents carry a
/// directory of files laid end to end in declared order.
#[derive(Debug, Clone)]
pub enum FileMode {
    Single {
        length: u64,
        md5sum: Option<String>,
    },
    Multi {
        files: Vec<InfoFile>,
    },
}

#[derive(Debug, Clone)]
pub struct InfoFile {
    pub length: u64,
    pub path: Vec<String>,
    pub md5sum: Option<String>,
}

impl Metainfo {
    /// Announce URL followed by flattened `announce-list` tiers, first
    /// occurrence wins.
    pub fn announce_urls(&self) -> Vec<String> {
        let mut urls = vec![self.announce.clone()];
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    if !urls.contains(url) {
                        urls.push(url.clone());
                    }
                }
            }
        }
        urls
    }

    pub fn total_size(&self) -> u64 {
        match &self.info.mode {
            FileMode::Single { length, .. } => *length,
            FileMode::Multi { files } => files.iter().map(|f| f.length).sum(),
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.info.pieces.len() as u32
    }

    pub fn piece_hash(&self, index: u32) -> [u8; 20] {
        self.info.pieces[index as usize]
    }

    /// Length of piece `index`; only the final piece may run short.
    pub fn piece_len(&self, index: u32) -> u32 {
        let start = u64::from(index) * self.info.piece_length;
        let remaining = self.total_size().saturating_sub(start);
        remaining.min(self.info.piece_length) as u32
    }

    pub fn blocks_in_piece(&self, index: u32) -> u32 {
        self.piece_len(index).div_ceil(BLOCK_LEN)
    }

    /// Length of block `block` within piece `index`; only the final block
    /// of a piece may run short.
    pub fn block_len(&self, index: u32, block: u32) -> u32 {
        let piece_len = self.piece_len(index);
        let start = block * BLOCK_LEN;
        piece_len.saturating_sub(start).min(BLOCK_LEN)
    }

    /// Global byte range `[start, end)` piece `index` occupies.
    pub fn piece_bounds(&self, index: u32) -> (u64, u64) {
        let start = u64::from(index) * self.info.piece_length;
        let end = (start + u64::from(self.piece_len(index))).min(self.total_size());
        (start, end)
    }
}

impl fmt::Display for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} bytes in {} pieces of {}",
            self.info.name,
            self.total_size(),
            self.piece_count(),
            self.info.piece_length
        )?;
        match &self.info.mode {
            FileMode::Single { md5sum: Some(sum), .. } => write!(f, ", md5 {sum}")?,
            FileMode::Single { .. } => {}
            FileMode::Multi { files } => {
                write!(f, ", {} files", files.len())?;
                let with_md5 = files.iter().filter(|file| file.md5sum.is_some()).count();
                if with_md5 > 0 {
                    write!(f, " ({with_md5} with md5)")?;
                }
            }
        }
        if let Some(date) = self.creation_date {
            write!(f, ", created {date}")?;
        }
        if let Some(by) = &self.created_by {
            write!(f, " by {by}")?;
        }
        if let Some(comment) = &self.comment {
            write!(f, ", \"{comment}\"")?;
        }
        if let Some(encoding) = &self.encoding {
            write!(f, ", {encoding}")?;
        }
        if self.info.private == Some(1) {
            write!(f, ", private")?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn metainfo_with(piece_length: u64, total: u64) -> Metainfo {
        let pieces = (0..total.div_ceil(piece_length).max(1))
            .map(|_| [0u8; 20])
            .collect();
        Metainfo {
            announce: "udp://tracker.example:6969".into(),
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
            encoding: None,
            info: Info {
                name: "artifact".into(),
                piece_length,
                pieces,
                private: None,
                mode: FileMode::Single {
                    length: total,
                    md5sum: None,
                },
            },
            info_hash: [0u8; 20],
        }
    }

    #[test]
    fn display_carries_the_optional_metadata() {
        let mut m = metainfo_with(16_384, 16_384);
        m.creation_date = Some(1_700_000_000);
        m.created_by = Some("odor 0.1".into());
        m.comment = Some("hello".into());
        m.info.private = Some(1);
        let rendered = m.to_string();
        assert!(rendered.starts_with("artifact: 16384 bytes in 1 pieces"));
        assert!(rendered.contains("created 1700000000 by odor 0.1"));
        assert!(rendered.contains("\"hello\""));
        assert!(rendered.ends_with("private"));
    }

    #[test]
    fn piece_lengths_sum_to_total_size() {
        for (piece_length, total) in
            [(16_384, 100_000), (32_768, 65_553), (1, 1), (262_144, 262_144)]
        {
            let m = metainfo_with(piece_length, total);
            let sum: u64 = (0..m.piece_count())
                .map(|i| u64::from(m.piece_len(i)))
                .sum();
            assert_eq!(sum, m.total_size(), "pl={piece_length} total={total}");
            let (_, last_end) = m.piece_bounds(m.piece_count() - 1);
            assert_eq!(last_end, m.total_size());
        }
    }

    #[test]
    fn short_last_piece_produces_short_last_block() {
        // 3 pieces: 32768, 32768, 17.
        let m = metainfo_with(32_768, 65_553);
        assert_eq!(m.piece_count(), 3);
        assert_eq!(m.piece_len(0), 32_768);
        assert_eq!(m.piece_len(2), 17);
        assert_eq!(m.blocks_in_piece(0), 2);
        assert_eq!(m.blocks_in_piece(2), 1);
        assert_eq!(m.block_len(0, 0), BLOCK_LEN);
        assert_eq!(m.block_len(2, 0), 17);
    }

    #[test]
    fn exact_multiple_keeps_full_last_piece() {
        let m = metainfo_with(16_384, 49_152);
        assert_eq!(m.piece_count(), 3);
        assert_eq!(m.piece_len(2), 16_384);
        assert_eq!(m.block_len(2, 0), BLOCK_LEN);
    }

    #[test]
    fn one_byte_torrent_geometry() {
        let m = metainfo_with(1, 1);
        assert_eq!(m.piece_count(), 1);
        assert_eq!(m.piece_len(0), 1);
        assert_eq!(m.blocks_in_piece(0), 1);
        assert_eq!(m.block_len(0, 0), 1);
        assert_eq!(m.piece_bounds(0), (0, 1));
    }

    #[test]
    fn announce_urls_flatten_and_dedup() {
        let mut m = metainfo_with(16_384, 16_384);
        m.announce_list = Some(vec![
            vec![m.announce.clone(), "udp://b.example:1".into()],
            vec!["udp://c.example:1".into()],
        ]);
        assert_eq!(
            m.announce_urls(),
            vec![
                "udp://tracker.example:6969".to_string(),
                "udp://b.example:1".to_string(),
                "udp://c.example:1".to_string(),
            ]
        );
    }
}
