//! NVSP wire messages.
//!
//! Every message starts with a little-endian `u32` message type followed by
//! packed little-endian fields. Control messages are zero-padded to
//! [`NVSP_MESSAGE_SIZE`].

use alloc::vec::Vec;

use bitflags::bitflags;

use super::{NdisVersion, ProtocolVersion};
use crate::error::ProtocolError;
use crate::transport::RegionHandle;

/// Fixed size of a control message on the wire.
pub const NVSP_MESSAGE_SIZE: usize = 40;

/// Header size (message type).
pub const NVSP_HEADER_SIZE: usize = 4;

/// Page-set id of the receive buffer.
pub const RECEIVE_BUFFER_ID: u16 = 0xCAFE;

/// Id of the send buffer.
pub const SEND_BUFFER_ID: u16 = 0;

/// Section index meaning "no section, payload in page buffers".
pub const INVALID_SECTION_INDEX: u32 = 0xFFFF_FFFF;

/// RNDIS data channel.
pub const CHANNEL_TYPE_DATA: u32 = 0;

/// RNDIS control channel.
pub const CHANNEL_TYPE_CONTROL: u32 = 1;

/// Entries in the v5 send indirection table.
pub const SEND_TABLE_SIZE: usize = 16;

/// Message type codes.
pub mod msg_type {
    pub const INIT: u32 = 1;
    pub const INIT_COMPLETE: u32 = 2;

    pub const SEND_NDIS_VER: u32 = 100;
    pub const SEND_RECV_BUF: u32 = 101;
    pub const SEND_RECV_BUF_COMPLETE: u32 = 102;
    pub const REVOKE_RECV_BUF: u32 = 103;
    pub const SEND_SEND_BUF: u32 = 104;
    pub const SEND_SEND_BUF_COMPLETE: u32 = 105;
    pub const REVOKE_SEND_BUF: u32 = 106;
    pub const SEND_RNDIS_PKT: u32 = 107;
    pub const SEND_RNDIS_PKT_COMPLETE: u32 = 108;

    pub const SEND_NDIS_CONFIG: u32 = 125;

    pub const SEND_VF_ASSOCIATION: u32 = 128;
    pub const SWITCH_DATA_PATH: u32 = 129;

    pub const SUBCHANNEL: u32 = 133;
    pub const SEND_INDIRECTION_TABLE: u32 = 134;
}

/// Status codes carried in completions.
pub mod status {
    pub const NONE: u32 = 0;
    pub const SUCCESS: u32 = 1;
    pub const FAIL: u32 = 2;
}

bitflags! {
    /// NDIS capabilities announced in the config message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NdisCapability: u64 {
        const VMQ = 1 << 0;
        const CHIMNEY = 1 << 1;
        const SRIOV = 1 << 2;
        const IEEE8021Q = 1 << 3;
        const CORRELATION_ID = 1 << 4;
        const TEAMING = 1 << 5;
    }
}

impl NdisCapability {
    /// Capabilities announced for a negotiated version. VLAN tagging is
    /// always on; teaming is needed to receive link speed updates.
    pub fn for_version(version: ProtocolVersion) -> Self {
        let mut caps = Self::IEEE8021Q;
        if version.has_sriov() {
            caps |= Self::SRIOV | Self::TEAMING;
        }
        caps
    }
}

/// Active data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPath {
    Synthetic,
    Vf,
}

impl DataPath {
    fn to_wire(self) -> u32 {
        match self {
            Self::Synthetic => 0,
            Self::Vf => 1,
        }
    }

    fn from_wire(value: u32) -> Self {
        if value == 1 {
            Self::Vf
        } else {
            Self::Synthetic
        }
    }
}

/// Sub-channel request operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubchannelOp {
    None,
    Allocate,
}

impl SubchannelOp {
    fn to_wire(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Allocate => 1,
        }
    }
}

/// One section of the receive buffer as reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiveSection {
    pub offset: u32,
    pub sub_alloc_size: u32,
    pub num_sub_allocs: u32,
    pub end_offset: u32,
}

const RECEIVE_SECTION_SIZE: usize = 16;

/// Decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NvspMessage {
    Init { min: ProtocolVersion, max: ProtocolVersion },
    InitComplete { negotiated: u32, max_mdl_chain_len: u32, status: u32 },
    SendNdisVersion(NdisVersion),
    SendReceiveBuffer { gpadl: RegionHandle, id: u16 },
    SendReceiveBufferComplete { status: u32, sections: Vec<ReceiveSection> },
    RevokeReceiveBuffer { id: u16 },
    SendSendBuffer { gpadl: RegionHandle, id: u16 },
    SendSendBufferComplete { status: u32, section_size: u32 },
    RevokeSendBuffer { id: u16 },
    SendRndisPacket { channel_type: u32, section_index: u32, section_size: u32 },
    SendRndisPacketComplete { status: u32 },
    SendNdisConfig { mtu: u32, capabilities: NdisCapability },
    VfAssociation { allocated: u32, serial: u32 },
    SwitchDataPath(DataPath),
    SubchannelRequest { op: SubchannelOp, count: u32 },
    SubchannelComplete { status: u32, count: u32 },
    SendIndirectionTable { table: Vec<u32> },
}

impl NvspMessage {
    /// Message type code.
    pub fn msg_type(&self) -> u32 {
        match self {
            Self::Init { .. } => msg_type::INIT,
            Self::InitComplete { .. } => msg_type::INIT_COMPLETE,
            Self::SendNdisVersion(_) => msg_type::SEND_NDIS_VER,
            Self::SendReceiveBuffer { .. } => msg_type::SEND_RECV_BUF,
            Self::SendReceiveBufferComplete { .. } => msg_type::SEND_RECV_BUF_COMPLETE,
            Self::RevokeReceiveBuffer { .. } => msg_type::REVOKE_RECV_BUF,
            Self::SendSendBuffer { .. } => msg_type::SEND_SEND_BUF,
            Self::SendSendBufferComplete { .. } => msg_type::SEND_SEND_BUF_COMPLETE,
            Self::RevokeSendBuffer { .. } => msg_type::REVOKE_SEND_BUF,
            Self::SendRndisPacket { .. } => msg_type::SEND_RNDIS_PKT,
            Self::SendRndisPacketComplete { .. } => msg_type::SEND_RNDIS_PKT_COMPLETE,
            Self::SendNdisConfig { .. } => msg_type::SEND_NDIS_CONFIG,
            Self::VfAssociation { .. } => msg_type::SEND_VF_ASSOCIATION,
            Self::SwitchDataPath(_) => msg_type::SWITCH_DATA_PATH,
            Self::SubchannelRequest { .. } | Self::SubchannelComplete { .. } => msg_type::SUBCHANNEL,
            Self::SendIndirectionTable { .. } => msg_type::SEND_INDIRECTION_TABLE,
        }
    }

    /// Whether this message answers a request parked in the init holder.
    pub fn is_init_response(&self) -> bool {
        matches!(
            self,
            Self::InitComplete { .. }
                | Self::SendReceiveBufferComplete { .. }
                | Self::SendSendBufferComplete { .. }
                | Self::SubchannelComplete { .. }
        )
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NVSP_MESSAGE_SIZE);
        put_u32(&mut out, self.msg_type());

        match self {
            Self::Init { min, max } => {
                put_u32(&mut out, min.0);
                put_u32(&mut out, max.0);
            }
            Self::InitComplete { negotiated, max_mdl_chain_len, status } => {
                put_u32(&mut out, *negotiated);
                put_u32(&mut out, *max_mdl_chain_len);
                put_u32(&mut out, *status);
            }
            Self::SendNdisVersion(ver) => {
                put_u32(&mut out, ver.major);
                put_u32(&mut out, ver.minor);
            }
            Self::SendReceiveBuffer { gpadl, id } | Self::SendSendBuffer { gpadl, id } => {
                put_u32(&mut out, gpadl.0);
                put_u16(&mut out, *id);
            }
            Self::SendReceiveBufferComplete { status, sections } => {
                put_u32(&mut out, *status);
                put_u32(&mut out, sections.len() as u32);
                for s in sections {
                    put_u32(&mut out, s.offset);
                    put_u32(&mut out, s.sub_alloc_size);
                    put_u32(&mut out, s.num_sub_allocs);
                    put_u32(&mut out, s.end_offset);
                }
            }
            Self::RevokeReceiveBuffer { id } | Self::RevokeSendBuffer { id } => {
                put_u16(&mut out, *id);
            }
            Self::SendSendBufferComplete { status, section_size } => {
                put_u32(&mut out, *status);
                put_u32(&mut out, *section_size);
            }
            Self::SendRndisPacket { channel_type, section_index, section_size } => {
                put_u32(&mut out, *channel_type);
                put_u32(&mut out, *section_index);
                put_u32(&mut out, *section_size);
            }
            Self::SendRndisPacketComplete { status } => {
                // Sent as header + status only.
                put_u32(&mut out, *status);
                return out;
            }
            Self::SendNdisConfig { mtu, capabilities } => {
                put_u32(&mut out, *mtu);
                put_u32(&mut out, 0);
                put_u64(&mut out, capabilities.bits());
            }
            Self::VfAssociation { allocated, serial } => {
                put_u32(&mut out, *allocated);
                put_u32(&mut out, *serial);
            }
            Self::SwitchDataPath(path) => {
                put_u32(&mut out, path.to_wire());
            }
            Self::SubchannelRequest { op, count } => {
                put_u32(&mut out, op.to_wire());
                put_u32(&mut out, *count);
            }
            Self::SubchannelComplete { status, count } => {
                put_u32(&mut out, *status);
                put_u32(&mut out, *count);
            }
            Self::SendIndirectionTable { table } => {
                put_u32(&mut out, table.len() as u32);
                // Offset of the table from the start of this body.
                put_u32(&mut out, 8);
                for entry in table {
                    put_u32(&mut out, *entry);
                }
            }
        }

        if out.len() < NVSP_MESSAGE_SIZE {
            out.resize(NVSP_MESSAGE_SIZE, 0);
        }
        out
    }

    /// Decode wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < NVSP_HEADER_SIZE {
            return Err(ProtocolError::Truncated { msg_type: 0, len: bytes.len() });
        }
        let ty = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut r = Reader { buf: bytes, pos: NVSP_HEADER_SIZE, msg_type: ty };

        let msg = match ty {
            msg_type::INIT => Self::Init {
                min: ProtocolVersion(r.u32()?),
                max: ProtocolVersion(r.u32()?),
            },
            msg_type::INIT_COMPLETE => Self::InitComplete {
                negotiated: r.u32()?,
                max_mdl_chain_len: r.u32()?,
                status: r.u32()?,
            },
            msg_type::SEND_NDIS_VER => Self::SendNdisVersion(NdisVersion {
                major: r.u32()?,
                minor: r.u32()?,
            }),
            msg_type::SEND_RECV_BUF => Self::SendReceiveBuffer {
                gpadl: RegionHandle(r.u32()?),
                id: r.u16()?,
            },
            msg_type::SEND_RECV_BUF_COMPLETE => {
                let status = r.u32()?;
                let count = r.u32()?;
                if r.remaining() < count as usize * RECEIVE_SECTION_SIZE {
                    return Err(r.truncated());
                }
                let mut sections = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    sections.push(ReceiveSection {
                        offset: r.u32()?,
                        sub_alloc_size: r.u32()?,
                        num_sub_allocs: r.u32()?,
                        end_offset: r.u32()?,
                    });
                }
                Self::SendReceiveBufferComplete { status, sections }
            }
            msg_type::REVOKE_RECV_BUF => Self::RevokeReceiveBuffer { id: r.u16()? },
            msg_type::SEND_SEND_BUF => Self::SendSendBuffer {
                gpadl: RegionHandle(r.u32()?),
                id: r.u16()?,
            },
            msg_type::SEND_SEND_BUF_COMPLETE => Self::SendSendBufferComplete {
                status: r.u32()?,
                section_size: r.u32()?,
            },
            msg_type::REVOKE_SEND_BUF => Self::RevokeSendBuffer { id: r.u16()? },
            msg_type::SEND_RNDIS_PKT => Self::SendRndisPacket {
                channel_type: r.u32()?,
                section_index: r.u32()?,
                section_size: r.u32()?,
            },
            msg_type::SEND_RNDIS_PKT_COMPLETE => Self::SendRndisPacketComplete { status: r.u32()? },
            msg_type::SEND_NDIS_CONFIG => {
                let mtu = r.u32()?;
                let _reserved = r.u32()?;
                Self::SendNdisConfig {
                    mtu,
                    capabilities: NdisCapability::from_bits_retain(r.u64()?),
                }
            }
            msg_type::SEND_VF_ASSOCIATION => Self::VfAssociation {
                allocated: r.u32()?,
                serial: r.u32()?,
            },
            msg_type::SWITCH_DATA_PATH => Self::SwitchDataPath(DataPath::from_wire(r.u32()?)),
            // Only completions travel towards the guest.
            msg_type::SUBCHANNEL => Self::SubchannelComplete {
                status: r.u32()?,
                count: r.u32()?,
            },
            msg_type::SEND_INDIRECTION_TABLE => {
                let count = r.u32()? as usize;
                let offset = r.u32()? as usize;
                // Both come from the peer.
                let (start, end) = match NVSP_HEADER_SIZE
                    .checked_add(offset)
                    .and_then(|start| Some((start, start.checked_add(count.checked_mul(4)?)?)))
                {
                    Some((start, end)) if end <= bytes.len() => (start, end),
                    _ => return Err(r.truncated()),
                };
                let table = bytes[start..end]
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Self::SendIndirectionTable { table }
            }
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        Ok(msg)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    msg_type: u32,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn truncated(&self) -> ProtocolError {
        ProtocolError::Truncated { msg_type: self.msg_type, len: self.buf.len() }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        if self.remaining() < N {
            return Err(self.truncated());
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.take::<8>().map(u64::from_le_bytes)
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_init_layout() {
        let bytes = NvspMessage::Init {
            min: ProtocolVersion::V5,
            max: ProtocolVersion::V5,
        }
        .encode();
        assert_eq!(bytes.len(), NVSP_MESSAGE_SIZE);
        assert_eq!(&bytes[0..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0x0005_0000u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x0005_0000u32.to_le_bytes());
        assert!(bytes[12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_rndis_packet_layout() {
        let bytes = NvspMessage::SendRndisPacket {
            channel_type: CHANNEL_TYPE_DATA,
            section_index: INVALID_SECTION_INDEX,
            section_size: 0,
        }
        .encode();
        assert_eq!(&bytes[0..4], &107u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &[0xFF; 4]);
        assert_eq!(&bytes[12..16], &0u32.to_le_bytes());
    }

    #[test]
    fn test_receive_completion_is_short() {
        let bytes = NvspMessage::SendRndisPacketComplete { status: status::SUCCESS }.encode();
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
    }

    #[test]
    fn test_ndis_config_capabilities() {
        let msg = NvspMessage::SendNdisConfig {
            mtu: 1514,
            capabilities: NdisCapability::for_version(ProtocolVersion::V5),
        };
        let bytes = msg.encode();
        let caps = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
        assert_eq!(caps, (1 << 2) | (1 << 3) | (1 << 5));
        assert_eq!(NvspMessage::decode(&bytes).unwrap(), msg);

        assert_eq!(
            NdisCapability::for_version(ProtocolVersion::V2),
            NdisCapability::IEEE8021Q
        );
    }

    #[test]
    fn test_receive_buffer_complete_sections() {
        let msg = NvspMessage::SendReceiveBufferComplete {
            status: status::SUCCESS,
            sections: vec![ReceiveSection {
                offset: 0,
                sub_alloc_size: 1728,
                num_sub_allocs: 9709,
                end_offset: 16 * 1024 * 1024,
            }],
        };
        let bytes = msg.encode();
        assert_eq!(NvspMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_indirection_table() {
        let table: Vec<u32> = (0..SEND_TABLE_SIZE as u32).collect();
        let msg = NvspMessage::SendIndirectionTable { table };
        assert_eq!(NvspMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = 105u32.to_le_bytes();
        assert_eq!(
            NvspMessage::decode(&bytes),
            Err(ProtocolError::Truncated { msg_type: 105, len: 4 })
        );
        assert!(NvspMessage::decode(&[1, 0]).is_err());
    }

    #[test]
    fn test_decode_section_count_overflow() {
        let mut bytes = Vec::new();
        put_u32(&mut bytes, msg_type::SEND_RECV_BUF_COMPLETE);
        put_u32(&mut bytes, status::SUCCESS);
        put_u32(&mut bytes, 1000);
        assert!(matches!(
            NvspMessage::decode(&bytes),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_indirection_table_bounds() {
        let table_bytes = |count: u32, offset: u32| {
            let mut bytes = Vec::new();
            put_u32(&mut bytes, msg_type::SEND_INDIRECTION_TABLE);
            put_u32(&mut bytes, count);
            put_u32(&mut bytes, offset);
            bytes.resize(NVSP_MESSAGE_SIZE, 0);
            bytes
        };
        for (count, offset) in [(u32::MAX, 8), (1, u32::MAX), (u32::MAX, u32::MAX), (16, 8)] {
            assert!(matches!(
                NvspMessage::decode(&table_bytes(count, offset)),
                Err(ProtocolError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn test_decode_unknown() {
        let bytes = 9999u32.to_le_bytes();
        assert_eq!(NvspMessage::decode(&bytes), Err(ProtocolError::UnknownMessage(9999)));
    }

    #[test]
    fn test_init_response_kinds() {
        assert!(NvspMessage::SendSendBufferComplete { status: 1, section_size: 6144 }.is_init_response());
        assert!(!NvspMessage::SendRndisPacketComplete { status: 1 }.is_init_response());
    }
}
