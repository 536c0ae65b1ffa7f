// SPDX-FileCopyrightText: 2025 The odor Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bencode value tree and encoder.
//!
//! The decoder lives in [`decoder`]; this module holds the typed value and
//! the serializer. Dictionary keys are kept in a `BTreeMap` so re-encoding
//! always emits them in ascending byte-lexicographic order, which is what
//! the wire format requires.

pub mod decoder;

use std::collections::BTreeMap;
use std::io;

pub use decoder::{decode, decode_root_dict, RootDict};

/// A single bencoded value.
///
/// Byte strings stay raw; nothing here assumes UTF-8. Integers are kept
/// at 128 bits, well past anything a torrent field can legitimately
/// hold; consumers narrow them where their own domain demands it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i128),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_int(&self) -> Option<i128> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte string viewed as UTF-8, when it happens to be valid.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` for non-dictionaries too.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        self.as_dict().and_then(|d| d.get(key))
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Encode by appending to an existing buffer.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            BencodeValue::Integer(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            BencodeValue::Bytes(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            BencodeValue::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            BencodeValue::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Stream the encoding into any writer, so a digest can be computed
    /// over the encoded bytes without materializing them.
    pub fn write_to<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            BencodeValue::Integer(i) => {
                write!(w, "i{}e", i)
            }
            BencodeValue::Bytes(bytes) => {
                write!(w, "{}:", bytes.len())?;
                w.write_all(bytes)
            }
            BencodeValue::List(items) => {
                w.write_all(b"l")?;
                for item in items {
                    item.write_to(w)?;
                }
                w.write_all(b"e")
            }
            BencodeValue::Dict(entries) => {
                w.write_all(b"d")?;
                for (key, value) in entries {
                    write!(w, "{}:", key.len())?;
                    w.write_all(key)?;
                    value.write_to(w)?;
                }
                w.write_all(b"e")
            }
        }
    }
}

impl From<i64> for BencodeValue {
    fn from(i: i64) -> Self {
        BencodeValue::Integer(i128::from(i))
    }
}

impl From<&str> for BencodeValue {
    fn from(s: &str) -> Self {
        BencodeValue::Bytes(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for BencodeValue {
    fn from(b: Vec<u8>) -> Self {
        BencodeValue::Bytes(b)
    }
}
