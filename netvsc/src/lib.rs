//! MorpheusX NetVSC Front-End
//!
//! Buffer pool and flow control engine for a paravirtualized network
//! adapter that talks NVSP to the host switch over a shared-memory channel.
//!
//! # Layout
//! - [`protocol`]: wire messages and version negotiation
//! - [`buffer`]: receive/send buffers registered with the peer
//! - [`slot`]: lock-free send section allocator
//! - [`batch`], [`flow`], [`recv_ring`]: per-queue transmit batching,
//!   ring-occupancy flow control and receive completions
//! - [`Device`]: ties it together; bring-up and teardown live in
//!   [`lifecycle`]
//!
//! The channel transport and the network stack above are supplied by the
//! embedder through [`ChannelTransport`] and [`NetStack`].

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

#[macro_use]
extern crate log;

pub mod batch;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod flow;
pub mod lifecycle;
pub mod protocol;
pub mod recv_ring;
pub mod slot;
pub mod stack;
pub mod stats;
pub mod transmit;
pub mod transport;

mod receive;

pub use batch::{BatchPlan, BatchPlanner, PendingBatch};
pub use buffer::{register_receive_buffer, register_send_buffer, ReleaseOutcome};
pub use config::NetvscConfig;
pub use device::{Device, VfAssociation};
pub use error::{
    ProtocolError, Result, RingFull, SendError, SetupError, SetupStage, TransportError, TxError,
};
pub use flow::{FlowAction, FlowController};
pub use lifecycle::TeardownReport;
pub use protocol::{negotiate, NvspMessage, ProtocolVersion};
pub use recv_ring::{ReceiveCompletionRing, RecvCompletion};
pub use slot::SendSlotMap;
pub use stack::NetStack;
pub use stats::StatsSnapshot;
pub use transmit::OutboundPacket;
pub use transport::{ChannelTransport, InboundPacket, OutgoingPacket, PacketKind, PageBuffer};
