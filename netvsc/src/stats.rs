//! Per-device counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// Event counters updated from the transmit and callback paths.
#[derive(Debug, Default)]
pub struct Stats {
    /// Frames accepted by the transmit path and handed to the peer.
    pub tx_frames: AtomicU64,
    /// Frames copied into an already open section.
    pub tx_coalesced: AtomicU64,
    /// Frames sent with only their header copied.
    pub tx_partial_copies: AtomicU64,
    /// Frames sent from their own pages, without a section.
    pub tx_page_sends: AtomicU64,
    /// No free send section was available.
    pub tx_send_full: AtomicU64,
    /// Sends refused because the ring was full.
    pub tx_busy: AtomicU64,
    /// Frames lost to a hard send failure.
    pub tx_dropped: AtomicU64,
    /// Queue stop requests.
    pub stop_queue: AtomicU64,
    /// Queue resume requests.
    pub wake_queue: AtomicU64,
    /// Frames handed to the network stack.
    pub rx_frames: AtomicU64,
    /// Inbound transfers reported back as failed.
    pub rx_failed: AtomicU64,
    /// Receive completions sent inline because the ring was full.
    pub rx_inline_completions: AtomicU64,
    /// Receive completions that could not be sent at all.
    pub rx_lost_completions: AtomicU64,
}

impl Stats {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            tx_frames: get(&self.tx_frames),
            tx_coalesced: get(&self.tx_coalesced),
            tx_partial_copies: get(&self.tx_partial_copies),
            tx_page_sends: get(&self.tx_page_sends),
            tx_send_full: get(&self.tx_send_full),
            tx_busy: get(&self.tx_busy),
            tx_dropped: get(&self.tx_dropped),
            stop_queue: get(&self.stop_queue),
            wake_queue: get(&self.wake_queue),
            rx_frames: get(&self.rx_frames),
            rx_failed: get(&self.rx_failed),
            rx_inline_completions: get(&self.rx_inline_completions),
            rx_lost_completions: get(&self.rx_lost_completions),
        }
    }
}

/// Copy of [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub tx_frames: u64,
    pub tx_coalesced: u64,
    pub tx_partial_copies: u64,
    pub tx_page_sends: u64,
    pub tx_send_full: u64,
    pub tx_busy: u64,
    pub tx_dropped: u64,
    pub stop_queue: u64,
    pub wake_queue: u64,
    pub rx_frames: u64,
    pub rx_failed: u64,
    pub rx_inline_completions: u64,
    pub rx_lost_completions: u64,
}
