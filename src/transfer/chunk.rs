//! Chunk accounting: received-index bitmap and file checksums.
//!
//! The bitmap is the source of truth for the invariant that a transfer's
//! index set stays within `[0, chunk_count)` and that completion means
//! exactly the full set.

use sha3::{Digest, Sha3_256};

/// Compute the SHA3-256 checksum of a complete file.
pub fn file_checksum(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Bit vector tracking which chunk indices have been received.
#[derive(Debug, Clone)]
pub struct ChunkBitmap {
    chunk_count: u32,
    bits: Vec<u64>,
}

impl ChunkBitmap {
    pub fn new(chunk_count: u32) -> Self {
        let words = (chunk_count as usize).div_ceil(64);
        Self {
            chunk_count,
            bits: vec![0u64; words],
        }
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Mark a chunk as received. Out-of-range indices are ignored.
    pub fn set(&mut self, index: u32) {
        if index < self.chunk_count {
            self.bits[(index / 64) as usize] |= 1u64 << (index % 64);
        }
    }

    pub fn is_set(&self, index: u32) -> bool {
        if index >= self.chunk_count {
            return false;
        }
        (self.bits[(index / 64) as usize] >> (index % 64)) & 1 == 1
    }

    /// Count of received chunks.
    pub fn received_count(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }

    /// True when every index in `[0, chunk_count)` is present.
    pub fn is_complete(&self) -> bool {
        self.received_count() == self.chunk_count
    }

    /// Count of contiguous chunks received from index 0 (the ack watermark:
    /// one past the highest contiguous index, 0 when index 0 is missing).
    pub fn contiguous_watermark(&self) -> u32 {
        for (word_idx, word) in self.bits.iter().enumerate() {
            if *word != u64::MAX {
                let run = word.trailing_ones();
                return (word_idx as u32 * 64 + run).min(self.chunk_count);
            }
        }
        self.chunk_count
    }

    /// Indices not yet received.
    pub fn missing(&self) -> Vec<u32> {
        (0..self.chunk_count).filter(|i| !self.is_set(*i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        let a = file_checksum(b"hello world");
        let b = file_checksum(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, file_checksum(b"hello worlD"));
    }

    #[test]
    fn bitmap_set_and_complete() {
        let mut bm = ChunkBitmap::new(100);
        assert_eq!(bm.received_count(), 0);
        assert!(!bm.is_complete());

        bm.set(0);
        bm.set(50);
        bm.set(99);
        assert_eq!(bm.received_count(), 3);
        assert!(bm.is_set(0));
        assert!(bm.is_set(50));
        assert!(!bm.is_set(1));
        assert_eq!(bm.missing().len(), 97);

        for i in 0..100 {
            bm.set(i);
        }
        assert!(bm.is_complete());
        assert!(bm.missing().is_empty());
    }

    #[test]
    fn out_of_range_index_is_ignored() {
        let mut bm = ChunkBitmap::new(8);
        bm.set(8);
        bm.set(1000);
        assert_eq!(bm.received_count(), 0);
        assert!(!bm.is_set(8));
    }

    #[test]
    fn watermark_tracks_contiguous_prefix() {
        let mut bm = ChunkBitmap::new(200);
        assert_eq!(bm.contiguous_watermark(), 0);

        bm.set(1);
        bm.set(2);
        // Index 0 missing: nothing contiguous.
        assert_eq!(bm.contiguous_watermark(), 0);

        bm.set(0);
        assert_eq!(bm.contiguous_watermark(), 3);

        // Fill the first word plus a bit of the second.
        for i in 0..70 {
            bm.set(i);
        }
        assert_eq!(bm.contiguous_watermark(), 70);

        bm.set(72);
        assert_eq!(bm.contiguous_watermark(), 70);

        for i in 0..200 {
            bm.set(i);
        }
        assert_eq!(bm.contiguous_watermark(), 200);
    }

    #[test]
    fn watermark_capped_at_chunk_count() {
        // 64 chunks fill the word exactly; watermark must not exceed count.
        let mut bm = ChunkBitmap::new(64);
        for i in 0..64 {
            bm.set(i);
        }
        assert_eq!(bm.contiguous_watermark(), 64);

        let mut small = ChunkBitmap::new(3);
        for i in 0..3 {
            small.set(i);
        }
        assert_eq!(small.contiguous_watermark(), 3);
    }
}
