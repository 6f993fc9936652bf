//! Error types for the front-end engine.
//!
//! Setup errors abort device bring-up. Send errors are local to a single
//! frame and never take the device down.

use core::fmt;

use crate::transmit::OutboundPacket;

pub type Result<T> = core::result::Result<T, SetupError>;

/// Errors reported by the shared-memory channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Outbound ring momentarily full.
    WouldBlock,
    /// Channel closed or rescinded by the host.
    Closed,
    /// Any other transport failure, with the transport's own code.
    Failed(i32),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "Outbound ring full"),
            Self::Closed => write!(f, "Channel closed"),
            Self::Failed(code) => write!(f, "Transport failure: {}", code),
        }
    }
}

/// Step of the bring-up handshake that the peer refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    ReceiveBuffer,
    SendBuffer,
    Subchannel,
}

impl fmt::Display for SetupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReceiveBuffer => write!(f, "receive buffer"),
            Self::SendBuffer => write!(f, "send buffer"),
            Self::Subchannel => write!(f, "sub-channel"),
        }
    }
}

/// Fatal device bring-up errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupError {
    /// Opening the channel failed.
    Open(TransportError),
    /// Pinning/exporting a shared region failed.
    Export(TransportError),
    /// Sending a handshake message failed.
    Transport(TransportError),
    /// The peer accepted none of the candidate protocol versions.
    NoCommonVersion,
    /// The peer answered a registration with a non-success status.
    Rejected { stage: SetupStage, status: u32 },
    /// Receive buffer layout other than one section at offset zero.
    UnsupportedLayout { sections: u32, offset: u32 },
    /// Send section size of zero or larger than the send buffer.
    InvalidSectionSize(u32),
    /// The peer answered with a message of the wrong kind.
    UnexpectedResponse(u32),
    /// Channel went away while waiting for a completion.
    ChannelClosed,
    /// Setup wait exhausted its poll budget.
    Timeout,
    /// Operation requires a newer negotiated protocol.
    Unsupported,
    /// Configuration rejected before touching the transport.
    InvalidConfig(&'static str),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(e) => write!(f, "Unable to open channel: {}", e),
            Self::Export(e) => write!(f, "Unable to export shared region: {}", e),
            Self::Transport(e) => write!(f, "Handshake send failed: {}", e),
            Self::NoCommonVersion => write!(f, "No common protocol version"),
            Self::Rejected { stage, status } => {
                write!(f, "Peer rejected {} setup with status {}", stage, status)
            }
            Self::UnsupportedLayout { sections, offset } => write!(
                f,
                "Unsupported receive buffer layout: {} sections, first at offset {}",
                sections, offset
            ),
            Self::InvalidSectionSize(size) => write!(f, "Invalid send section size {}", size),
            Self::UnexpectedResponse(ty) => write!(f, "Unexpected response message type {}", ty),
            Self::ChannelClosed => write!(f, "Channel closed during setup"),
            Self::Timeout => write!(f, "Setup wait timed out"),
            Self::Unsupported => write!(f, "Not supported by negotiated protocol"),
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

/// Per-frame send failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Ring momentarily full; retry after the queue resumes.
    WouldBlock,
    /// Definite transport failure; the frame is lost.
    Transport(TransportError),
    /// Device is being removed.
    DeviceGone,
    /// Host rescinded the channel.
    Rescinded,
    /// Queue index beyond the configured queue count.
    InvalidQueue(u16),
    /// Frame larger than the wire format can describe.
    FrameTooLarge,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "Send would block"),
            Self::Transport(e) => write!(f, "Send failed: {}", e),
            Self::DeviceGone => write!(f, "Device is being removed"),
            Self::Rescinded => write!(f, "Channel rescinded"),
            Self::InvalidQueue(q) => write!(f, "Invalid queue {}", q),
            Self::FrameTooLarge => write!(f, "Frame too large"),
        }
    }
}

impl From<TransportError> for SendError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::WouldBlock => Self::WouldBlock,
            other => Self::Transport(other),
        }
    }
}

/// Malformed or unexpected inbound message. Logged and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Message shorter than its type requires.
    Truncated { msg_type: u32, len: usize },
    /// Message type this front-end does not understand.
    UnknownMessage(u32),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { msg_type, len } => {
                write!(f, "Truncated message type {} ({} bytes)", msg_type, len)
            }
            Self::UnknownMessage(ty) => write!(f, "Unknown message type {}", ty),
        }
    }
}

/// Receive completion ring has no free entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

impl fmt::Display for RingFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Receive completion ring full")
    }
}

/// Transmit failure as seen by the upper layer.
///
/// A would-block failure hands the packet back so the caller can retry it
/// once the queue resumes. Any other failure consumed the packet.
pub enum TxError<B> {
    WouldBlock(OutboundPacket<B>),
    Failed(SendError),
}

impl<B> TxError<B> {
    /// Underlying send error.
    pub fn kind(&self) -> SendError {
        match self {
            Self::WouldBlock(_) => SendError::WouldBlock,
            Self::Failed(e) => *e,
        }
    }

    /// Packet handed back for retry, if any.
    pub fn into_packet(self) -> Option<OutboundPacket<B>> {
        match self {
            Self::WouldBlock(packet) => Some(packet),
            Self::Failed(_) => None,
        }
    }
}

impl<B: AsRef<[u8]>> fmt::Debug for TxError<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock(p) => f
                .debug_struct("WouldBlock")
                .field("queue", &p.queue)
                .field("len", &p.len())
                .finish(),
            Self::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

impl<B> fmt::Display for TxError<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind(), f)
    }
}
