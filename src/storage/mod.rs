// SPDX-FileCopyrightText: 2025 The odor Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! On-disk layout of the torrent's byte stream.
//!
//! Single-file torrents map to one file named by the torrent; multi-file
//! torrents map to a directory of files laid end to end in declared
//! order. Writes address the global stream and are split across file
//! boundaries here, so pieces land at the right offsets no matter how
//! the files are carved up.

use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::errors::StorageError;
use crate::torrent_file::{FileMode, Metainfo};

#[derive(Debug, Clone)]
pub struct FileSlice {
    pub path: PathBuf,
    pub length: u64,
    /// Where this file starts within the torrent's complete byte stream.
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct FileLayout {
    files: Vec<FileSlice>,
    total_size: u64,
}

impl FileLayout {
    pub fn from_metainfo(root: &Path, metainfo: &Metainfo) -> Self {
        match &metainfo.info.mode {
            FileMode::Single { length, .. } => Self {
                files: vec![FileSlice {
                    path: root.join(&metainfo.info.name),
                    length: *length,
                    offset: 0,
                }],
                total_size: *length,
            },
            FileMode::Multi { files } => {
                let dir = root.join(&metainfo.info.name);
                let mut slices = Vec::with_capacity(files.len());
                let mut offset = 0;
                for file in files {
                    let mut path = dir.clone();
                    for component in &file.path {
                        path.push(component);
                    }
                    slices.push(FileSlice {
                        path,
                        length: file.length,
                        offset,
                    });
                    offset += file.length;
                }
                Self {
                    files: slices,
                    total_size: offset,
                }
            }
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Create every file with its parent directories and pre-allocate it
    /// to its final length, so later positional writes stay in-bounds.
    pub async fn allocate(&self) -> Result<(), StorageError> {
        for slice in &self.files {
            if let Some(parent) = slice.path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&slice.path)
                .await?;
            file.set_len(slice.length).await?;
        }
        Ok(())
    }

    /// Write `data` at `global_offset` in the torrent stream, splitting
    /// across file boundaries as needed.
    pub async fn write_at(&self, global_offset: u64, data: &[u8]) -> Result<(), StorageError> {
        if global_offset + data.len() as u64 > self.total_size {
            return Err(StorageError::OutOfBounds {
                offset: global_offset,
                total: self.total_size,
            });
        }

        let mut written = 0usize;
        for slice in &self.files {
            if written == data.len() {
                break;
            }
            let write_start = global_offset + written as u64;
            let file_end = slice.offset + slice.length;
            if write_start < slice.offset || write_start >= file_end {
                continue;
            }

            let local_offset = write_start - slice.offset;
            let chunk = ((data.len() - written) as u64)
                .min(slice.length - local_offset) as usize;

            let mut file = OpenOptions::new().write(true).open(&slice.path).await?;
            file.seek(SeekFrom::Start(local_offset)).await?;
            file.write_all(&data[written..written + chunk]).await?;
            file.flush().await?;
            written += chunk;
        }

        if written != data.len() {
            return Err(StorageError::OutOfBounds {
                offset: global_offset,
                total: self.total_size,
            });
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent_file::{Info, InfoFile};

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("odor-storage-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn multi_metainfo() -> Metainfo {
        Metainfo {
            announce: "udp://t:1".into(),
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
            encoding: None,
            info: Info {
                name: "bundle".into(),
                piece_length: 8,
                pieces: vec![[0; 20]; 2],
                private: None,
                mode: FileMode::Multi {
                    files: vec![
                        InfoFile { length: 5, path: vec!["a.bin".into()], md5sum: None },
                        InfoFile {
                            length: 11,
                            path: vec!["sub".into(), "b.bin".into()],
                            md5sum: None,
                        },
                    ],
                },
            },
            info_hash: [0; 20],
        }
    }

    #[tokio::test]
    async fn single_file_write_lands_at_its_offset() {
        let root = scratch_dir("single");
        let metainfo = crate::torrent_file::tests::metainfo_with(8, 24);
        let layout = FileLayout::from_metainfo(&root, &metainfo);
        layout.allocate().await.unwrap();

        layout.write_at(8, b"abcdefgh").await.unwrap();
        layout.write_at(0, b"01234567").await.unwrap();

        let on_disk = std::fs::read(root.join("artifact")).unwrap();
        assert_eq!(on_disk.len(), 24);
        assert_eq!(&on_disk[..16], b"01234567abcdefgh");

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn writes_split_across_file_boundaries() {
        let root = scratch_dir("multi");
        let layout = FileLayout::from_metainfo(&root, &multi_metainfo());
        assert_eq!(layout.total_size(), 16);
        layout.allocate().await.unwrap();

        // One write covering the end of a.bin and the start of sub/b.bin.
        layout.write_at(3, b"XYZQRS").await.unwrap();

        let a = std::fs::read(root.join("bundle").join("a.bin")).unwrap();
        let b = std::fs::read(root.join("bundle").join("sub").join("b.bin")).unwrap();
        assert_eq!(&a[3..5], b"XY");
        assert_eq!(&b[..4], b"ZQRS");

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn out_of_bounds_writes_are_refused() {
        let root = scratch_dir("oob");
        let layout = FileLayout::from_metainfo(&root, &multi_metainfo());
        layout.allocate().await.unwrap();

        assert!(matches!(
            layout.write_at(12, b"toolongbyfar").await.unwrap_err(),
            StorageError::OutOfBounds { .. }
        ));

        std::fs::remove_dir_all(&root).ok();
    }
}
