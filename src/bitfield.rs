//! Growable presence bitfield: tracks which block indices have verified data on disk.
//!
//! Grounded in the teacher's `bitfield_v10::{FixedBitfield, DynamicBitfield}` (fixed-size
//! `u32` pages addressed by a page map). This version drops the page map (and its `intmap`
//! dependency) in favor of one flat, auto-growing `Vec<u64>`, since `spec.md` §4.10 only asks
//! for a boolean has-map over `0..length` with no requirement that storage be paged.

const BITS_PER_WORD: u64 = 64;

/// A growable bitmap, one bit per block index.
#[derive(Debug, Clone, Default)]
pub struct Bitfield {
    words: Vec<u64>,
}

impl Bitfield {
    /// An empty bitfield.
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Reconstruct a bitfield from its packed little-endian word representation, as persisted
    /// in the `Store::Bitfield` file.
    pub fn from_words(words: Vec<u64>) -> Self {
        Self { words }
    }

    /// The packed word representation, for persistence.
    pub fn as_words(&self) -> &[u64] {
        &self.words
    }

    fn word_index(index: u64) -> (usize, u64) {
        let word = index / BITS_PER_WORD;
        let bit = index % BITS_PER_WORD;
        (word as usize, bit)
    }

    /// Whether `index` is marked present.
    pub fn get(&self, index: u64) -> bool {
        let (word, bit) = Self::word_index(index);
        match self.words.get(word) {
            Some(w) => w & (1 << bit) != 0,
            None => false,
        }
    }

    /// Mark `index` present or absent, growing backing storage as needed. Returns whether the
    /// bit actually changed, mirroring the teacher's `FixedBitfield::set`.
    pub fn set(&mut self, index: u64, value: bool) -> bool {
        let (word, bit) = Self::word_index(index);
        if word >= self.words.len() {
            if !value {
                return false;
            }
            self.words.resize(word + 1, 0);
        }
        let mask = 1 << bit;
        let was_set = self.words[word] & mask != 0;
        if was_set == value {
            return false;
        }
        self.words[word] ^= mask;
        true
    }

    /// Mark every index in `start..end` present, used after a contiguous range of blocks has
    /// been verified (a bulk append or a verified replication range).
    pub fn set_range(&mut self, start: u64, end: u64) {
        for index in start..end {
            self.set(index, true);
        }
    }

    /// Clear every index from `from` onward, used when a log is truncated to a shorter length.
    pub fn clear_from(&mut self, from: u64) {
        let (word, bit) = Self::word_index(from);
        if word >= self.words.len() {
            return;
        }
        self.words[word] &= (1u64 << bit) - 1;
        self.words.truncate(word + 1);
    }

    /// First unset index at or after `start`, bounded by `length`. Used to find the next block
    /// a replicator should request.
    pub fn first_unset(&self, start: u64, length: u64) -> Option<u64> {
        (start..length).find(|&i| !self.get(i))
    }

    /// Whether every index in `start..end` is set, used by `Core::has` range checks.
    pub fn all_set(&self, start: u64, end: u64) -> bool {
        (start..end).all(|i| self.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_round_trip() {
        let mut bits = Bitfield::new();
        assert!(!bits.get(0));
        assert!(bits.set(0, true));
        assert!(bits.get(0));
        assert!(!bits.set(0, true), "setting to the same value reports no change");

        assert!(!bits.get(1000));
        bits.set(1000, true);
        assert!(bits.get(1000));
    }

    #[test]
    fn clear_from_truncates_tail() {
        let mut bits = Bitfield::new();
        bits.set_range(0, 200);
        assert!(bits.all_set(0, 200));

        bits.clear_from(100);
        assert!(bits.all_set(0, 100));
        assert!(!bits.get(150));
    }

    #[test]
    fn first_unset_finds_gap() {
        let mut bits = Bitfield::new();
        bits.set_range(0, 10);
        bits.set(12, true);
        assert_eq!(bits.first_unset(0, 20), Some(10));
    }
}
