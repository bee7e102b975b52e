//! Segment bitmap for sparse partial files.
//!
//! The wire form is an ASCII `0`/`1` string of length
//! `ceil(content_length / size)`, bit *i* marking that segment *i* is fully
//! written and fsynced in the partial file. The tail segment may be shorter
//! than `size`.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Result, StateError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentBitmap {
    bits: Vec<bool>,
}

impl SegmentBitmap {
    pub fn new(segment_count: usize) -> Self {
        Self {
            bits: vec![false; segment_count],
        }
    }

    pub fn from_ascii(s: &str) -> Result<Self> {
        let mut bits = Vec::with_capacity(s.len());
        for c in s.chars() {
            match c {
                '0' => bits.push(false),
                '1' => bits.push(true),
                other => {
                    return Err(StateError::InvalidBitmap {
                        reason: format!("unexpected character {other:?}"),
                    });
                }
            }
        }
        Ok(Self { bits })
    }

    pub fn as_ascii(&self) -> String {
        self.bits.iter().map(|b| if *b { '1' } else { '0' }).collect()
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn is_marked(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    pub fn mark(&mut self, index: usize) {
        if let Some(bit) = self.bits.get_mut(index) {
            *bit = true;
        }
    }

    pub fn clear_all(&mut self) {
        self.bits.fill(false);
    }

    pub fn mark_all(&mut self) {
        self.bits.fill(true);
    }

    pub fn marked_count(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    pub fn is_complete(&self) -> bool {
        self.bits.iter().all(|b| *b)
    }

    pub fn first_missing(&self) -> Option<usize> {
        self.bits.iter().position(|b| !*b)
    }

    /// Indices of unmarked segments, ascending.
    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, b)| !**b)
            .map(|(i, _)| i)
    }
}

impl Serialize for SegmentBitmap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_ascii())
    }
}

impl<'de> Deserialize<'de> for SegmentBitmap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SegmentBitmap::from_ascii(&s).map_err(D::Error::custom)
    }
}

/// Segment geometry plus completion bitmap, persisted in the sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentMap {
    /// Segment length in bytes. The tail segment may be shorter.
    pub size: u64,
    pub bitmap: SegmentBitmap,
}

impl SegmentMap {
    /// Build an all-unmarked map covering `content_length` bytes.
    pub fn for_length(content_length: u64, segment_size: u64) -> Self {
        let size = segment_size.max(1);
        let count = content_length.div_ceil(size) as usize;
        Self {
            size,
            bitmap: SegmentBitmap::new(count),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.bitmap.len()
    }

    /// Byte span `[start, end)` of segment `index`, clamped to the tail.
    pub fn span(&self, index: usize, content_length: u64) -> (u64, u64) {
        let start = index as u64 * self.size;
        let end = (start + self.size).min(content_length);
        (start, end)
    }

    /// Index of the segment containing byte offset `offset`.
    pub fn segment_of(&self, offset: u64) -> usize {
        (offset / self.size) as usize
    }

    /// Total bytes covered by marked segments, accounting for a short tail.
    pub fn bytes_covered(&self, content_length: u64) -> u64 {
        let mut total = 0;
        for index in 0..self.bitmap.len() {
            if self.bitmap.is_marked(index) {
                let (start, end) = self.span(index, content_length);
                total += end - start;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_roundtrip() {
        let mut bitmap = SegmentBitmap::new(5);
        bitmap.mark(0);
        bitmap.mark(4);
        assert_eq!(bitmap.as_ascii(), "10001");

        let parsed = SegmentBitmap::from_ascii("10001").unwrap();
        assert_eq!(parsed, bitmap);
        assert_eq!(parsed.marked_count(), 2);
    }

    #[test]
    fn rejects_non_binary_characters() {
        assert!(SegmentBitmap::from_ascii("01x").is_err());
    }

    #[test]
    fn serde_uses_ascii_string() {
        let map = SegmentMap::for_length(10, 4);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"size":4,"bitmap":"000"}"#);

        let back: SegmentMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn geometry_with_short_tail() {
        let map = SegmentMap::for_length(10, 4);
        assert_eq!(map.segment_count(), 3);
        assert_eq!(map.span(0, 10), (0, 4));
        assert_eq!(map.span(2, 10), (8, 10));
        assert_eq!(map.segment_of(9), 2);
    }

    #[test]
    fn bytes_covered_adjusts_for_tail() {
        let mut map = SegmentMap::for_length(10, 4);
        map.bitmap.mark(0);
        map.bitmap.mark(2);
        assert_eq!(map.bytes_covered(10), 4 + 2);

        map.bitmap.mark(1);
        assert_eq!(map.bytes_covered(10), 10);
        assert!(map.bitmap.is_complete());
    }

    #[test]
    fn zero_length_has_no_segments() {
        let map = SegmentMap::for_length(0, 4 * 1024 * 1024);
        assert_eq!(map.segment_count(), 0);
        assert!(map.bitmap.is_complete());
        assert_eq!(map.bytes_covered(0), 0);
    }
}
