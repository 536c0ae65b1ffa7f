// SPDX-FileCopyrightText: 2025 The odor Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Recursive-descent bencode decoder.
//!
//! Works over a cursor into a byte slice. Byte strings are never
//! reinterpreted as text, dictionary keys must arrive in strictly
//! ascending byte order, and every error carries the offset it was
//! detected at. [`decode_root_dict`] additionally records the byte span
//! each top-level value occupied, which is how the infohash gets computed
//! from the `info` dictionary exactly as it appeared on the wire.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::errors::BencodeError;

use super::BencodeValue;

/// A decoded top-level dictionary plus the wire span of each entry value.
#[derive(Debug)]
pub struct RootDict {
    pub entries: BTreeMap<Vec<u8>, BencodeValue>,
    pub value_spans: BTreeMap<Vec<u8>, Range<usize>>,
    pub consumed: usize,
}

impl RootDict {
    /// The exact wire bytes of one entry's value.
    pub fn raw_value<'a>(&self, input: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
        self.value_spans.get(key).map(|span| &input[span.clone()])
    }
}

/// Decode one value from the front of `input`. Returns the value and the
/// number of bytes consumed; trailing bytes are the caller's problem.
pub fn decode(input: &[u8]) -> Result<(BencodeValue, usize), BencodeError> {
    let mut cur = Cursor { input, pos: 0 };
    let value = cur.value()?;
    Ok((value, cur.pos))
}

/// Decode the input as a top-level dictionary, recording the span of each
/// entry's value.
pub fn decode_root_dict(input: &[u8]) -> Result<RootDict, BencodeError> {
    let mut cur = Cursor { input, pos: 0 };
    if cur.peek()? != b'd' {
        return Err(BencodeError::Syntax {
            pos: cur.pos,
            reason: "expected a dictionary",
        });
    }
    cur.pos += 1;

    let mut entries = BTreeMap::new();
    let mut value_spans = BTreeMap::new();
    let mut prev_key: Option<Vec<u8>> = None;
    loop {
        if cur.peek()? == b'e' {
            cur.pos += 1;
            break;
        }
        let key = cur.byte_string()?;
        cur.check_key_order(&prev_key, &key)?;
        let start = cur.pos;
        let value = cur.value()?;
        value_spans.insert(key.clone(), start..cur.pos);
        entries.insert(key.clone(), value);
        prev_key = Some(key);
    }
    Ok(RootDict {
        entries,
        value_spans,
        consumed: cur.pos,
    })
}

/// Nesting bound; keeps adversarial `llll...` inputs from exhausting
/// the stack. Torrent files nest a handful of levels at most.
const MAX_DEPTH: usize = 128;

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEnd)
    }

    fn value(&mut self) -> Result<BencodeValue, BencodeError> {
        self.value_at_depth(0)
    }

    fn value_at_depth(&mut self, depth: usize) -> Result<BencodeValue, BencodeError> {
        if depth >= MAX_DEPTH {
            return Err(BencodeError::Syntax {
                pos: self.pos,
                reason: "nesting too deep",
            });
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => Ok(BencodeValue::Bytes(self.byte_string()?)),
            _ => Err(BencodeError::Syntax {
                pos: self.pos,
                reason: "expected 'i', 'l', 'd' or a digit",
            }),
        }
    }

    fn integer(&mut self) -> Result<BencodeValue, BencodeError> {
        let start = self.pos;
        self.pos += 1; // 'i'

        let negative = if self.peek()? == b'-' {
            self.pos += 1;
            true
        } else {
            false
        };

        let digits_start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        let digits = &self.input[digits_start..self.pos];
        if digits.is_empty() {
            return Err(BencodeError::Syntax {
                pos: self.pos,
                reason: "integer has no digits",
            });
        }
        if self.peek()? != b'e' {
            return Err(BencodeError::Syntax {
                pos: self.pos,
                reason: "integer not terminated by 'e'",
            });
        }
        self.pos += 1; // 'e'

        if digits[0] == b'0' && digits.len() > 1 {
            return Err(BencodeError::LeadingZero(start));
        }
        if negative && digits == b"0" {
            return Err(BencodeError::NegativeZero(start));
        }

        // Parse manually so the error position stays ours. 128 bits give
        // decades of headroom over any field a torrent can carry; the
        // remaining bound is written down where the format is specified.
        let mut magnitude: i128 = 0;
        for &d in digits {
            magnitude = magnitude
                .checked_mul(10)
                .and_then(|m| {
                    if negative {
                        m.checked_sub(i128::from(d - b'0'))
                    } else {
                        m.checked_add(i128::from(d - b'0'))
                    }
                })
                .ok_or(BencodeError::Syntax {
                    pos: start,
                    reason: "integer out of range",
                })?;
        }
        Ok(BencodeValue::Integer(magnitude))
    }

    fn byte_string(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        if !self.peek()?.is_ascii_digit() {
            return Err(BencodeError::Syntax {
                pos: self.pos,
                reason: "expected a byte string length",
            });
        }
        let mut len: usize = 0;
        while self.peek()?.is_ascii_digit() {
            let d = self.input[self.pos] - b'0';
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add(usize::from(d)))
                .ok_or(BencodeError::StringLengthOverflow(start))?;
            self.pos += 1;
        }
        if self.peek()? != b':' {
            return Err(BencodeError::Syntax {
                pos: self.pos,
                reason: "byte string length not followed by ':'",
            });
        }
        self.pos += 1;

        let end = self
            .pos
            .checked_add(len)
            .ok_or(BencodeError::StringLengthOverflow(start))?;
        if end > self.input.len() {
            return Err(BencodeError::UnexpectedEnd);
        }
        let bytes = self.input[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<BencodeValue, BencodeError> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(BencodeValue::List(items));
            }
            items.push(self.value_at_depth(depth + 1)?);
        }
    }

    fn dict(&mut self, depth: usize) -> Result<BencodeValue, BencodeError> {
        self.pos += 1; // 'd'
        let mut entries = BTreeMap::new();
        let mut prev_key: Option<Vec<u8>> = None;
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(BencodeValue::Dict(entries));
            }
            let key_pos = self.pos;
            let key = self.byte_string()?;
            match &prev_key {
                Some(prev) if key == *prev => {
                    return Err(BencodeError::DuplicateKey(key_pos))
                }
                Some(prev) if key < *prev => {
                    return Err(BencodeError::UnsortedKeys(key_pos))
                }
                _ => {}
            }
            let value = self.value_at_depth(depth + 1)?;
            entries.insert(key.clone(), value);
            prev_key = Some(key);
        }
    }

    fn check_key_order(
        &self,
        prev: &Option<Vec<u8>>,
        key: &[u8],
    ) -> Result<(), BencodeError> {
        match prev {
            Some(p) if key == &p[..] => Err(BencodeError::DuplicateKey(self.pos)),
            Some(p) if key < &p[..] => Err(BencodeError::UnsortedKeys(self.pos)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_integers() {
        let (value, consumed) = decode(b"i224e").unwrap();
        assert_eq!(value, BencodeValue::Integer(224));
        assert_eq!(consumed, 5);

        let (value, _) = decode(b"i0e").unwrap();
        assert_eq!(value, BencodeValue::Integer(0));

        let (value, _) = decode(b"i-313e").unwrap();
        assert_eq!(value, BencodeValue::Integer(-313));
    }

    #[test]
    fn decodes_integers_wider_than_64_bits() {
        // A 20-digit value: representable on the wire, too big for i64.
        let (value, _) = decode(b"i99999999999999999999e").unwrap();
        assert_eq!(value, BencodeValue::Integer(99_999_999_999_999_999_999));
        let (value, _) = decode(b"i-99999999999999999999e").unwrap();
        assert_eq!(value, BencodeValue::Integer(-99_999_999_999_999_999_999));
    }

    #[test]
    fn rejects_degenerate_integers() {
        assert_eq!(decode(b"i-0e").unwrap_err(), BencodeError::NegativeZero(0));
        assert_eq!(decode(b"i03e").unwrap_err(), BencodeError::LeadingZero(0));
        assert!(matches!(
            decode(b"ie").unwrap_err(),
            BencodeError::Syntax { .. }
        ));
        assert!(matches!(
            decode(b"i-e").unwrap_err(),
            BencodeError::Syntax { .. }
        ));
        assert!(matches!(
            decode(b"i12").unwrap_err(),
            BencodeError::UnexpectedEnd
        ));
        // Forty digits overrun even the 128-bit representation.
        assert!(matches!(
            decode(b"i9999999999999999999999999999999999999999e").unwrap_err(),
            BencodeError::Syntax { reason: "integer out of range", .. }
        ));
    }

    #[test]
    fn decodes_byte_strings() {
        let (value, consumed) = decode(b"4:spam").unwrap();
        assert_eq!(value, BencodeValue::Bytes(b"spam".to_vec()));
        assert_eq!(consumed, 6);

        let (value, consumed) = decode(b"0:").unwrap();
        assert_eq!(value, BencodeValue::Bytes(vec![]));
        assert_eq!(consumed, 2);
    }

    #[test]
    fn byte_strings_stay_raw() {
        let input = [b'2', b':', 0xc3, 0x28]; // invalid UTF-8 payload
        let (value, _) = decode(&input).unwrap();
        assert_eq!(value.as_bytes(), Some(&[0xc3, 0x28][..]));
        assert_eq!(value.as_str(), None);
    }

    #[test]
    fn rejects_short_and_overflowing_strings() {
        assert_eq!(decode(b"7:spam").unwrap_err(), BencodeError::UnexpectedEnd);
        assert_eq!(
            decode(b"99999999999999999999999:x").unwrap_err(),
            BencodeError::StringLengthOverflow(0)
        );
    }

    #[test]
    fn decodes_nested_lists() {
        let (value, consumed) = decode(b"l4:spami42eli1eee").unwrap();
        assert_eq!(
            value,
            BencodeValue::List(vec![
                BencodeValue::Bytes(b"spam".to_vec()),
                BencodeValue::Integer(42),
                BencodeValue::List(vec![BencodeValue::Integer(1)]),
            ])
        );
        assert_eq!(consumed, 17);
    }

    #[test]
    fn dict_round_trips_byte_for_byte() {
        let input: &[u8] = b"d3:cow3:moo4:spam4:eggse";
        let (value, consumed) = decode(input).unwrap();
        assert_eq!(consumed, input.len());
        assert_eq!(value.encode(), input);
    }

    #[test]
    fn enforces_key_ordering() {
        assert!(matches!(
            decode(b"d4:spam4:eggs3:cow3:mooe").unwrap_err(),
            BencodeError::UnsortedKeys(_)
        ));
        assert!(matches!(
            decode(b"d3:cow3:moo3:cowi1ee").unwrap_err(),
            BencodeError::DuplicateKey(_)
        ));
    }

    #[test]
    fn consumed_count_stops_at_value_end() {
        let (value, consumed) = decode(b"i7etrailing").unwrap();
        assert_eq!(value, BencodeValue::Integer(7));
        assert_eq!(consumed, 3);
    }

    #[test]
    fn truncated_inputs_never_panic() {
        let inputs: &[&[u8]] = &[
            b"", b"i", b"l", b"d", b"lle", b"d3:cow", b"5", b"5:", b"li1e",
            b"d1:a", b"i-", b"l\xffe",
        ];
        for input in inputs {
            assert!(decode(input).is_err(), "input {:?}", input);
        }
    }

    #[test]
    fn pathological_nesting_errors_out_instead_of_overflowing() {
        let bomb = vec![b'l'; 100_000];
        assert!(matches!(
            decode(&bomb).unwrap_err(),
            BencodeError::Syntax { reason: "nesting too deep", .. }
        ));
    }

    #[test]
    fn root_dict_exposes_value_spans() {
        let input: &[u8] = b"d8:announce3:url4:infod3:fooi1eee";
        let root = decode_root_dict(input).unwrap();
        assert_eq!(root.consumed, input.len());
        assert_eq!(
            root.raw_value(input, b"info"),
            Some(&b"d3:fooi1ee"[..])
        );
        assert_eq!(root.raw_value(input, b"announce"), Some(&b"3:url"[..]));
        assert!(root.entries.contains_key(&b"info"[..].to_vec()));
    }

    #[test]
    fn root_dict_rejects_non_dictionaries() {
        assert!(matches!(
            decode_root_dict(b"i1e").unwrap_err(),
            BencodeError::Syntax { .. }
        ));
    }
}
