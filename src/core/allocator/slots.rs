//! Directory-entry slot bitmap
//!
//! One bit per fixed-size directory entry slot across all directory blocks:
//! - 0 = free slot
//! - 1 = slot holds a file, section or name entry

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotBitmap {
    /// Bitmap words (each word = 64 slots)
    words: Vec<u64>,

    /// Total number of slots tracked
    total: usize,

    /// Number of slots in use
    used: usize,
}

impl SlotBitmap {
    pub fn new(total: usize) -> Self {
        SlotBitmap {
            words: vec![0u64; (total + 63) / 64],
            total,
            used: 0,
        }
    }

    /// Track `additional` more slots, all free.
    pub fn grow(&mut self, additional: usize) {
        self.total += additional;
        self.words.resize((self.total + 63) / 64, 0);
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_set(&self, slot: usize) -> bool {
        if slot >= self.total {
            return false;
        }
        self.words[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    /// Mark a slot used. Returns false if it already was or is out of range.
    pub fn set(&mut self, slot: usize) -> bool {
        if slot >= self.total {
            tracing::warn!("slot {} outside bitmap of {} slots", slot, self.total);
            return false;
        }
        let mask = 1u64 << (slot % 64);
        let word = &mut self.words[slot / 64];
        if *word & mask != 0 {
            tracing::warn!("slot {} marked used twice", slot);
            return false;
        }
        *word |= mask;
        self.used += 1;
        true
    }

    pub fn clear(&mut self, slot: usize) {
        if slot >= self.total {
            return;
        }
        let mask = 1u64 << (slot % 64);
        let word = &mut self.words[slot / 64];
        if *word & mask == 0 {
            // Already free - double free
            tracing::warn!("Double-free detected for slot {}", slot);
            return;
        }
        *word &= !mask;
        self.used -= 1;
    }

    /// Lowest free slot, if any.
    pub fn first_free(&self) -> Option<usize> {
        for (idx, &word) in self.words.iter().enumerate() {
            if word == u64::MAX {
                continue; // All bits set
            }
            let slot = idx * 64 + (!word).trailing_zeros() as usize;
            return (slot < self.total).then_some(slot);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_free_skips_full_words() {
        let mut bm = SlotBitmap::new(130);
        for i in 0..70 {
            assert!(bm.set(i));
        }
        assert_eq!(bm.first_free(), Some(70));
        assert_eq!(bm.used(), 70);
    }

    #[test]
    fn test_full_bitmap_has_no_free_slot() {
        let mut bm = SlotBitmap::new(3);
        bm.set(0);
        bm.set(1);
        bm.set(2);
        assert_eq!(bm.first_free(), None);
        bm.grow(2);
        assert_eq!(bm.first_free(), Some(3));
    }

    #[test]
    fn test_double_set_and_clear() {
        let mut bm = SlotBitmap::new(10);
        assert!(bm.set(4));
        assert!(!bm.set(4));
        bm.clear(4);
        bm.clear(4);
        assert_eq!(bm.used(), 0);
        assert!(!bm.is_set(4));
        assert!(!bm.set(10));
    }
}
