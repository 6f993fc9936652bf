//! Per-queue ring of receive completions waiting to go back to the peer.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::RingFull;

/// One pending receive completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecvCompletion {
    /// Transaction id of the transfer-page packet being completed.
    pub transaction_id: u64,
    /// NVSP status reported back.
    pub status: u32,
}

/// Fixed-size circular buffer with `first`/`next` cursors.
///
/// One entry is always left unused so that `first == next` means empty.
pub struct ReceiveCompletionRing {
    slots: Vec<RecvCompletion>,
    first: usize,
    next: usize,
}

impl ReceiveCompletionRing {
    /// Ring with `size` entries (`size - 1` usable). `size` must be at least 2.
    pub fn new(size: usize) -> Self {
        Self { slots: vec![RecvCompletion::default(); size.max(2)], first: 0, next: 0 }
    }

    /// Usable capacity.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Queued entries.
    pub fn len(&self) -> usize {
        let size = self.slots.len();
        (self.next + size - self.first) % size
    }

    pub fn is_empty(&self) -> bool {
        self.first == self.next
    }

    /// Free entries.
    pub fn available(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Queue a completion at the tail.
    pub fn push(&mut self, entry: RecvCompletion) -> Result<(), RingFull> {
        if self.available() == 0 {
            return Err(RingFull);
        }
        self.slots[self.next] = entry;
        self.next = (self.next + 1) % self.slots.len();
        Ok(())
    }

    /// Oldest queued completion.
    pub fn peek(&self) -> Option<RecvCompletion> {
        if self.is_empty() {
            None
        } else {
            Some(self.slots[self.first])
        }
    }

    /// Drop the oldest queued completion.
    pub fn advance(&mut self) {
        if !self.is_empty() {
            self.first = (self.first + 1) % self.slots.len();
        }
    }

    /// Send queued completions oldest first until `send` fails or the ring
    /// is empty. Returns how many were sent.
    pub fn drain<F>(&mut self, mut send: F) -> usize
    where
        F: FnMut(&RecvCompletion) -> bool,
    {
        let mut sent = 0;
        while let Some(entry) = self.peek() {
            if !send(&entry) {
                break;
            }
            self.advance();
            sent += 1;
        }
        sent
    }
}

/// Whether `outstanding` receive completions exceed `percent` of the
/// peer's sub-allocations.
pub fn over_watermark(outstanding: u32, sub_allocs: u32, percent: u32) -> bool {
    outstanding as u64 > sub_allocs as u64 * percent as u64 / 100
}
