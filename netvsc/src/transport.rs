//! Shared-memory channel seam.
//!
//! The transport itself (ring buffers, page descriptors, host signalling)
//! lives outside this crate. The front-end only consumes the contract below.

use alloc::vec::Vec;

use crate::error::TransportError;

/// Page size used for scatter-gather descriptors.
pub const PAGE_SIZE: usize = 4096;

const PAGE_SHIFT: u32 = 12;

/// Opaque handle of an exported (pinned) region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionHandle(pub u32);

/// One page fragment of a scatter-gather list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBuffer {
    /// Page frame number.
    pub pfn: u64,
    /// Offset within the page.
    pub offset: u32,
    /// Bytes described by this fragment.
    pub len: u32,
}

impl PageBuffer {
    /// Describe a byte slice as page fragments.
    ///
    /// Addresses are identity mapped, as on the bare-metal targets this
    /// crate runs on.
    pub fn describe(data: &[u8], out: &mut Vec<PageBuffer>) {
        let mut addr = data.as_ptr() as usize;
        let mut remaining = data.len();
        while remaining > 0 {
            let offset = addr & (PAGE_SIZE - 1);
            let len = remaining.min(PAGE_SIZE - offset);
            out.push(PageBuffer {
                pfn: (addr >> PAGE_SHIFT) as u64,
                offset: offset as u32,
                len: len as u32,
            });
            addr += len;
            remaining -= len;
        }
    }

    /// Number of fragments needed to describe `data`.
    pub fn count(data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let start = data.as_ptr() as usize;
        let end = start + data.len() - 1;
        (end >> PAGE_SHIFT) - (start >> PAGE_SHIFT) + 1
    }
}

/// Transport-level packet kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// In-band data carrying a protocol message.
    DataInband,
    /// Completion of a packet the peer sent us.
    Completion,
}

/// Packet handed to the transport.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingPacket<'a> {
    pub kind: PacketKind,
    /// Protocol message bytes.
    pub payload: &'a [u8],
    /// Scatter-gather fragments sent alongside the message.
    pub pages: &'a [PageBuffer],
    /// Opaque tag echoed back in the completion.
    pub request_id: u64,
    /// Ask the peer for a completion.
    pub completion_requested: bool,
    /// Signal the peer. Cleared when more data follows immediately.
    pub signal: bool,
}

/// Range of the receive buffer holding one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRange {
    pub byte_offset: u32,
    pub byte_count: u32,
}

/// Packet pulled from the inbound ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPacket {
    /// Completion of one of our requests.
    Completion { request_id: u64, payload: Vec<u8> },
    /// Frames placed in the receive buffer.
    TransferPages {
        transaction_id: u64,
        pageset_id: u16,
        payload: Vec<u8>,
        ranges: Vec<TransferRange>,
    },
    /// In-band notification from the peer.
    Inband { request_id: u64, payload: Vec<u8> },
    /// Any other transport packet type.
    Other { packet_type: u16, request_id: u64 },
}

/// Bidirectional shared-memory channel, one ring pair per queue.
///
/// Calls may arrive concurrently from the transmit path and the channel
/// callback, so implementations must be internally synchronized.
pub trait ChannelTransport: Send + Sync {
    /// Open all queue channels with `ring_pages` pages per ring.
    fn open(&self, ring_pages: u32) -> Result<(), TransportError>;

    /// Close all queue channels.
    fn close(&self);

    /// Place a packet on a queue's outbound ring.
    ///
    /// # Returns
    /// - `Err(TransportError::WouldBlock)`: ring momentarily full
    fn send(&self, queue: u16, packet: &OutgoingPacket<'_>) -> Result<(), TransportError>;

    /// Pull the next inbound packet for a queue, if any.
    fn receive(&self, queue: u16) -> Option<InboundPacket>;

    /// Free bytes of a queue's outbound ring, in percent (0..=100).
    fn ring_free_percent(&self, queue: u16) -> u32;

    /// Pin and export a region to the peer.
    fn export_region(&self, base: *const u8, len: usize) -> Result<RegionHandle, TransportError>;

    /// Release a previously exported region.
    fn unexport_region(&self, handle: RegionHandle) -> Result<(), TransportError>;

    /// Whether the host rescinded a queue's channel.
    fn is_rescinded(&self, _queue: u16) -> bool {
        false
    }
}
