//! Network virtual service protocol (NVSP): versions, wire messages and
//! version negotiation.

pub mod message;
pub mod negotiate;

pub use message::{
    msg_type, status, DataPath, NdisCapability, NvspMessage, ReceiveSection, SubchannelOp,
    CHANNEL_TYPE_CONTROL, CHANNEL_TYPE_DATA, INVALID_SECTION_INDEX, NVSP_MESSAGE_SIZE,
    RECEIVE_BUFFER_ID, SEND_BUFFER_ID, SEND_TABLE_SIZE,
};
pub use negotiate::{negotiate, send_ndis_version, ControlChannel};

use core::fmt;

/// Protocol version, ordered oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub u32);

impl ProtocolVersion {
    pub const V1: Self = Self(0x0000_0002);
    pub const V2: Self = Self(0x0003_0002);
    pub const V4: Self = Self(0x0004_0000);
    pub const V5: Self = Self(0x0005_0000);

    /// Whether this version takes the one-way NDIS config message.
    pub fn has_ndis_config(self) -> bool {
        self >= Self::V2
    }

    /// Whether SR-IOV and teaming capabilities can be announced.
    pub fn has_sriov(self) -> bool {
        self >= Self::V5
    }

    /// Whether the peer understands sub-channel requests.
    pub fn has_subchannels(self) -> bool {
        self >= Self::V5
    }

    /// NDIS version announced after negotiating this protocol version.
    pub fn ndis_version(self) -> NdisVersion {
        if self <= Self::V4 {
            NdisVersion { major: 6, minor: 1 }
        } else {
            NdisVersion { major: 6, minor: 30 }
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// NDIS version pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdisVersion {
    pub major: u32,
    pub minor: u32,
}

impl NdisVersion {
    /// Packed `major << 16 | minor` form.
    pub fn packed(self) -> u32 {
        (self.major << 16) | (self.minor & 0xFFFF)
    }
}
