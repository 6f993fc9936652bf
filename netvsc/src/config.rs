//! Front-end configuration.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::SetupError;
use crate::protocol::ProtocolVersion;

/// Ethernet header length, added to the MTU announced to the peer.
pub const ETH_HLEN: u32 = 14;

/// Ethernet payload length used to size the receive completion ring.
pub const ETH_DATA_LEN: usize = 1500;

/// Receive buffer size for current protocol versions (16MB).
pub const RECEIVE_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Receive buffer size for V1/V2 peers (15MB).
pub const RECEIVE_BUFFER_SIZE_LEGACY: usize = 15 * 1024 * 1024;

/// Send buffer size (15MB).
pub const SEND_BUFFER_SIZE: usize = 15 * 1024 * 1024;

/// Default ring size in pages.
pub const DEFAULT_RING_PAGES: u32 = 128;

/// Maximum number of queues (primary channel plus sub-channels).
pub const MAX_QUEUES: u16 = 64;

/// Default packet alignment inside a batched send section.
pub const PKT_ALIGN_DEFAULT: u32 = 8;

/// Default cap on frames coalesced into one section.
pub const MAX_BATCH_DEFAULT: u32 = 8;

/// Stop a queue below this many percent of free outbound ring bytes.
pub const RING_AVAIL_PERCENT_LOWATER: u32 = 10;

/// Resume a stopped queue above this many percent of free outbound ring bytes.
pub const RING_AVAIL_PERCENT_HIWATER: u32 = 20;

/// Drain receive completions synchronously above this percentage of the
/// peer's receive sub-allocations.
pub const RECV_COMPLETION_WATERMARK: u32 = 80;

/// Receive completion ring length per queue.
pub const RECV_COMPLETION_SLOTS: usize = RECEIVE_BUFFER_SIZE / ETH_DATA_LEN + 1;

/// Front-end configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetvscConfig {
    /// Interface MTU (without Ethernet header).
    pub mtu: u32,
    /// Number of transmit/receive queues.
    pub queue_count: u16,
    /// Ring size passed to the transport on open, in pages.
    pub ring_pages: u32,
    /// Candidate protocol versions, oldest first. Tried newest first.
    pub protocol_versions: Vec<ProtocolVersion>,
    /// Receive buffer size for V4 and newer.
    pub recv_buffer_size: usize,
    /// Receive buffer size for V2 and older.
    pub recv_buffer_size_legacy: usize,
    /// Send buffer size.
    pub send_buffer_size: usize,
    /// Receive completion ring length per queue (usable capacity is one less).
    pub recv_completion_slots: usize,
    /// Alignment of frames packed into one send section.
    pub pkt_align: u32,
    /// Maximum frames coalesced into one send section.
    pub max_batch: u32,
    /// Low-water mark, percent of free outbound ring bytes.
    pub ring_low_water: u32,
    /// High-water mark, percent of free outbound ring bytes.
    pub ring_high_water: u32,
    /// Receive completion drain watermark, percent of sub-allocations.
    pub recv_drain_watermark: u32,
    /// Poll budget for each setup wait. `None` waits until the peer answers
    /// or the channel closes.
    pub setup_poll_limit: Option<u64>,
    /// Poll budget for the teardown drain. `None` waits for every in-flight
    /// operation to complete.
    pub drain_poll_limit: Option<u64>,
}

impl Default for NetvscConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            queue_count: 1,
            ring_pages: DEFAULT_RING_PAGES,
            protocol_versions: vec![
                ProtocolVersion::V1,
                ProtocolVersion::V2,
                ProtocolVersion::V4,
                ProtocolVersion::V5,
            ],
            recv_buffer_size: RECEIVE_BUFFER_SIZE,
            recv_buffer_size_legacy: RECEIVE_BUFFER_SIZE_LEGACY,
            send_buffer_size: SEND_BUFFER_SIZE,
            recv_completion_slots: RECV_COMPLETION_SLOTS,
            pkt_align: PKT_ALIGN_DEFAULT,
            max_batch: MAX_BATCH_DEFAULT,
            ring_low_water: RING_AVAIL_PERCENT_LOWATER,
            ring_high_water: RING_AVAIL_PERCENT_HIWATER,
            recv_drain_watermark: RECV_COMPLETION_WATERMARK,
            setup_poll_limit: None,
            drain_poll_limit: None,
        }
    }
}

impl NetvscConfig {
    /// Receive buffer size for a negotiated version.
    pub fn recv_buffer_size_for(&self, version: ProtocolVersion) -> usize {
        if version <= ProtocolVersion::V2 {
            self.recv_buffer_size_legacy
        } else {
            self.recv_buffer_size
        }
    }

    /// Check the configuration before bring-up.
    pub fn validate(&self) -> Result<(), SetupError> {
        if self.queue_count == 0 || self.queue_count > MAX_QUEUES {
            return Err(SetupError::InvalidConfig("queue count out of range"));
        }
        if self.protocol_versions.is_empty() {
            return Err(SetupError::InvalidConfig("no protocol versions"));
        }
        if self.recv_buffer_size == 0 || self.recv_buffer_size_legacy == 0 {
            return Err(SetupError::InvalidConfig("empty receive buffer"));
        }
        if self.send_buffer_size == 0 {
            return Err(SetupError::InvalidConfig("empty send buffer"));
        }
        if self.recv_completion_slots < 2 {
            return Err(SetupError::InvalidConfig("receive completion ring too small"));
        }
        if !self.pkt_align.is_power_of_two() {
            return Err(SetupError::InvalidConfig("packet alignment must be a power of two"));
        }
        if self.max_batch == 0 {
            return Err(SetupError::InvalidConfig("batch limit must be non-zero"));
        }
        if self.ring_low_water >= self.ring_high_water || self.ring_high_water > 100 {
            return Err(SetupError::InvalidConfig("ring watermarks out of order"));
        }
        if self.recv_drain_watermark > 100 {
            return Err(SetupError::InvalidConfig("receive watermark above 100%"));
        }
        Ok(())
    }
}
