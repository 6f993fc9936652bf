//! Lock-free bitmap allocator over send buffer sections.
//!
//! One bit per section, set while the section belongs to an in-flight send.
//! Bits past `section_count` in the last word are set at construction so a
//! scan can never hand them out.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: u32 = u64::BITS;

/// Send section allocator.
pub struct SendSlotMap {
    words: Box<[AtomicU64]>,
    section_count: u32,
}

impl SendSlotMap {
    /// Map with every section free.
    pub fn new(section_count: u32) -> Self {
        let word_count = section_count.div_ceil(WORD_BITS) as usize;
        let mut words: Vec<AtomicU64> = (0..word_count).map(|_| AtomicU64::new(0)).collect();

        let tail = section_count % WORD_BITS;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last.get_mut() = !0u64 << tail;
            }
        }

        Self { words: words.into_boxed_slice(), section_count }
    }

    pub fn section_count(&self) -> u32 {
        self.section_count
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    /// Reserve the lowest free section.
    ///
    /// Returns `None` when every section is taken. Never blocks.
    pub fn acquire(&self) -> Option<u32> {
        for (i, word) in self.words.iter().enumerate() {
            let mut current = word.load(Ordering::Acquire);
            while current != u64::MAX {
                let bit = (!current).trailing_zeros();
                let mask = 1u64 << bit;
                let prev = word.fetch_or(mask, Ordering::AcqRel);
                if prev & mask == 0 {
                    let index = i as u32 * WORD_BITS + bit;
                    debug_assert!(index < self.section_count);
                    return Some(index);
                }
                // Lost the race for this bit; rescan the same word.
                current = prev | mask;
            }
        }
        None
    }

    /// Return a section to the pool.
    ///
    /// Returns `false` (and logs) if the section was not reserved.
    pub fn release(&self, index: u32) -> bool {
        if index >= self.section_count {
            error!("netvsc: release of send section {} beyond {}", index, self.section_count);
            return false;
        }
        let mask = 1u64 << (index % WORD_BITS);
        let prev = self.words[(index / WORD_BITS) as usize].fetch_and(!mask, Ordering::AcqRel);
        if prev & mask == 0 {
            error!("netvsc: send section {} released twice", index);
            return false;
        }
        true
    }

    /// Whether a section is currently reserved.
    pub fn is_reserved(&self, index: u32) -> bool {
        if index >= self.section_count {
            return false;
        }
        let mask = 1u64 << (index % WORD_BITS);
        self.words[(index / WORD_BITS) as usize].load(Ordering::Acquire) & mask != 0
    }

    /// Number of reserved sections.
    pub fn in_use(&self) -> u32 {
        let set: u32 = self
            .words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones())
            .sum();
        let padding = self.words.len() as u32 * WORD_BITS - self.section_count;
        set - padding
    }
}
