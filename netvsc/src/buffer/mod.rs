//! Shared buffers registered with the peer.
//!
//! The receive buffer is one section the peer fills with inbound frames.
//! The send buffer is split into equal sections handed out by a
//! [`SendSlotMap`](crate::slot::SendSlotMap).

pub mod region;
pub mod registration;

pub use region::SharedRegion;
pub use registration::{
    register_receive_buffer, register_send_buffer, BufferRole, ReceiveBuffer, ReleaseOutcome,
    SendBuffer,
};
