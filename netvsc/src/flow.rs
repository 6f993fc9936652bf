//! Transmit admission control from outbound ring occupancy.
//!
//! A queue is stopped when free ring space drops under the low-water mark
//! and resumed once it climbs past the high-water mark. A queue with nothing
//! in flight is never left stopped: no completion would ever wake it.

/// What the transmit path should do with the queue after a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    /// Leave the queue as is.
    Continue,
    /// Stop the queue; a completion will resume it.
    Stop,
    /// Stop the queue and resume it immediately (nothing in flight).
    StopAndResume,
}

/// Watermark-based stop/resume decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowController {
    /// Stop below this many percent free.
    pub low_water: u32,
    /// Resume above this many percent free.
    pub high_water: u32,
}

impl FlowController {
    pub fn new(low_water: u32, high_water: u32) -> Self {
        Self { low_water, high_water }
    }

    /// Whether to signal the peer for this send.
    ///
    /// More data coming suppresses the signal unless the ring is within one
    /// percent of the low-water mark.
    pub fn should_signal(&self, free_percent: u32, more_coming: bool) -> bool {
        !(more_coming && free_percent >= self.low_water + 1)
    }

    /// Decision after a successful enqueue.
    ///
    /// `free_percent` is the free space read before the send; `queue_sends`
    /// includes the packet just enqueued.
    pub fn after_send(&self, free_percent: u32, queue_sends: u32) -> FlowAction {
        if free_percent >= self.low_water {
            FlowAction::Continue
        } else if queue_sends < 1 {
            FlowAction::StopAndResume
        } else {
            FlowAction::Stop
        }
    }

    /// Decision after the ring reported it is full.
    pub fn after_busy(&self, queue_sends: u32) -> FlowAction {
        if queue_sends < 1 {
            FlowAction::StopAndResume
        } else {
            FlowAction::Stop
        }
    }

    /// Whether a completion should resume a stopped queue.
    pub fn should_resume(
        &self,
        stopped: bool,
        draining: bool,
        free_percent: u32,
        queue_sends: u32,
    ) -> bool {
        stopped && !draining && (free_percent > self.high_water || queue_sends < 1)
    }
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new(
            crate::config::RING_AVAIL_PERCENT_LOWATER,
            crate::config::RING_AVAIL_PERCENT_HIWATER,
        )
    }
}
