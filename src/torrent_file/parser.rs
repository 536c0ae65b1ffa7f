// SPDX-FileCopyrightText: 2025 The odor Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Projects a bencoded torrent file into [`Metainfo`].
//!
//! The infohash is the SHA-1 of the `info` dictionary exactly as it sat in
//! the input; the decoder hands back that byte span so no re-encoding is
//! involved.

use sha1::{Digest, Sha1};

use crate::bencode::{decode_root_dict, BencodeValue};
use crate::errors::ParseError;

use super::{FileMode, Info, InfoFile, Metainfo};

pub fn from_bytes(input: &[u8]) -> Result<Metainfo, ParseError> {
    let root = decode_root_dict(input).map_err(|e| match e {
        crate::errors::BencodeError::Syntax { pos: 0, .. } => ParseError::NotADictionary,
        other => ParseError::Bencode(other),
    })?;
    if root.consumed != input.len() {
        return Err(ParseError::TrailingData);
    }

    let info_raw = root
        .raw_value(input, b"info")
        .ok_or(ParseError::MissingKey("info"))?;
    let info_hash: [u8; 20] = Sha1::digest(info_raw).into();

    let announce = require_str(&root.entries, "announce")?;
    let announce_list = root
        .entries
        .get(b"announce-list".as_slice())
        .map(parse_announce_list)
        .transpose()?;

    let info_value = &root.entries[b"info".as_slice()];
    let info_dict = info_value
        .as_dict()
        .ok_or(ParseError::WrongType("info"))?;
    let info = parse_info(info_dict)?;

    let metainfo = Metainfo {
        announce,
        announce_list,
        creation_date: optional_int(&root.entries, b"creation date"),
        comment: optional_str(&root.entries, b"comment"),
        created_by: optional_str(&root.entries, b"created by"),
        encoding: optional_str(&root.entries, b"encoding"),
        info,
        info_hash,
    };

    // ceil(total / piece_length) must agree with the hash count.
    let expected = metainfo
        .total_size()
        .div_ceil(metainfo.info.piece_length) as usize;
    if metainfo.info.pieces.len() != expected {
        return Err(ParseError::PieceCountMismatch {
            hashes: metainfo.info.pieces.len(),
            expected,
        });
    }

    Ok(metainfo)
}

type Dict = std::collections::BTreeMap<Vec<u8>, BencodeValue>;

fn parse_info(dict: &Dict) -> Result<Info, ParseError> {
    let name = require_str(dict, "name")?;
    let piece_length = dict
        .get(b"piece length".as_slice())
        .ok_or(ParseError::MissingKey("piece length"))?
        .as_int()
        .ok_or(ParseError::WrongType("piece length"))?;
    let piece_length = match u64::try_from(piece_length) {
        Ok(len) if len > 0 => len,
        _ => return Err(ParseError::BadPieceLength),
    };

    let pieces_raw = dict
        .get(b"pieces".as_slice())
        .ok_or(ParseError::MissingKey("pieces"))?
        .as_bytes()
        .ok_or(ParseError::WrongType("pieces"))?;
    if pieces_raw.len() % 20 != 0 {
        return Err(ParseError::MalformedPieces);
    }
    let pieces = pieces_raw
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let mode = match (dict.get(b"length".as_slice()), dict.get(b"files".as_slice())) {
        (Some(length), None) => FileMode::Single {
            length: non_negative(length, "length")?,
            md5sum: optional_str(dict, b"md5sum"),
        },
        (None, Some(files)) => FileMode::Multi {
            files: parse_files(files)?,
        },
        (Some(_), Some(_)) => return Err(ParseError::WrongType("length")),
        (None, None) => return Err(ParseError::MissingKey("length")),
    };

    Ok(Info {
        name,
        piece_length,
        pieces,
        private: optional_int(dict, b"private"),
        mode,
    })
}

fn parse_files(value: &BencodeValue) -> Result<Vec<InfoFile>, ParseError> {
    let list = value.as_list().ok_or(ParseError::WrongType("files"))?;
    if list.is_empty() {
        return Err(ParseError::WrongType("files"));
    }
    list.iter()
        .map(|entry| {
            let dict = entry.as_dict().ok_or(ParseError::WrongType("files"))?;
            let length = dict
                .get(b"length".as_slice())
                .ok_or(ParseError::MissingKey("files.length"))?;
            let path = dict
                .get(b"path".as_slice())
                .ok_or(ParseError::MissingKey("files.path"))?
                .as_list()
                .ok_or(ParseError::WrongType("files.path"))?
                .iter()
                .map(|component| {
                    component
                        .as_str()
                        .filter(|c| !c.is_empty())
                        .map(str::to_owned)
                        .ok_or(ParseError::WrongType("files.path"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            if path.is_empty() {
                return Err(ParseError::WrongType("files.path"));
            }
            Ok(InfoFile {
                length: non_negative(length, "files.length")?,
                path,
                md5sum: optional_str(dict, b"md5sum"),
            })
        })
        .collect()
}

fn non_negative(value: &BencodeValue, key: &'static str) -> Result<u64, ParseError> {
    value
        .as_int()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or(ParseError::WrongType(key))
}

fn require_str(dict: &Dict, key: &'static str) -> Result<String, ParseError> {
    dict.get(key.as_bytes())
        .ok_or(ParseError::MissingKey(key))?
        .as_str()
        .map(str::to_owned)
        .ok_or(ParseError::WrongType(key))
}

fn optional_str(dict: &Dict, key: &[u8]) -> Option<String> {
    dict.get(key).and_then(|v| v.as_str()).map(str::to_owned)
}

/// Optional integer fields stay `i64` in the model; a value outside that
/// range is treated as absent rather than failing the whole torrent.
fn optional_int(dict: &Dict, key: &[u8]) -> Option<i64> {
    dict.get(key)
        .and_then(|v| v.as_int())
        .and_then(|i| i64::try_from(i).ok())
}

fn parse_announce_list(value: &BencodeValue) -> Result<Vec<Vec<String>>, ParseError> {
    value
        .as_list()
        .ok_or(ParseError::WrongType("announce-list"))?
        .iter()
        .map(|tier| {
            tier.as_list()
                .ok_or(ParseError::WrongType("announce-list"))?
                .iter()
                .map(|url| {
                    url.as_str()
                        .map(str::to_owned)
                        .ok_or(ParseError::WrongType("announce-list"))
                })
                .collect()
        })
        .collect()
}
