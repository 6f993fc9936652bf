//! Receive/send buffer registration with the peer.

use super::region::SharedRegion;
use crate::error::{Result, SetupError, SetupStage};
use crate::protocol::{
    status, ControlChannel, NvspMessage, ReceiveSection, RECEIVE_BUFFER_ID, SEND_BUFFER_ID,
};
use crate::slot::SendSlotMap;
use crate::transport::{ChannelTransport, RegionHandle};

/// Which buffer a registration refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    Receive,
    Send,
}

impl BufferRole {
    fn revoke_message(self) -> NvspMessage {
        match self {
            Self::Receive => NvspMessage::RevokeReceiveBuffer { id: RECEIVE_BUFFER_ID },
            Self::Send => NvspMessage::RevokeSendBuffer { id: SEND_BUFFER_ID },
        }
    }

    fn stage(self) -> SetupStage {
        match self {
            Self::Receive => SetupStage::ReceiveBuffer,
            Self::Send => SetupStage::SendBuffer,
        }
    }
}

/// What happened to a region on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Revoked (if needed), unexported and freed.
    Released,
    /// Kept pinned and never freed because the peer may still use it.
    Leaked,
}

/// An exported region plus whether the peer acknowledged it.
struct Registration {
    role: BufferRole,
    region: SharedRegion,
    handle: RegionHandle,
    acknowledged: bool,
}

impl Registration {
    fn export<T: ChannelTransport + ?Sized>(
        transport: &T,
        role: BufferRole,
        size: usize,
    ) -> Result<Self> {
        let region = SharedRegion::zeroed(size);
        let handle = transport
            .export_region(region.as_ptr(), region.len())
            .map_err(|e| {
                error!("netvsc: unable to export {:?} buffer: {}", role, e);
                SetupError::Export(e)
            })?;
        Ok(Self { role, region, handle, acknowledged: false })
    }

    fn release<C, T>(self, chan: &C, transport: &T) -> ReleaseOutcome
    where
        C: ControlChannel + ?Sized,
        T: ChannelTransport + ?Sized,
    {
        // Only revoke what the peer actually took.
        if self.acknowledged {
            if let Err(e) = chan.post(&self.role.revoke_message()) {
                error!(
                    "netvsc: unable to revoke {:?} buffer, keeping it pinned: {}",
                    self.role, e
                );
                self.region.leak();
                return ReleaseOutcome::Leaked;
            }
        }

        if let Err(e) = transport.unexport_region(self.handle) {
            error!("netvsc: unable to unexport {:?} buffer: {}", self.role, e);
            self.region.leak();
            return ReleaseOutcome::Leaked;
        }

        ReleaseOutcome::Released
    }
}

/// Registered receive buffer.
pub struct ReceiveBuffer {
    reg: Registration,
    section: ReceiveSection,
}

impl ReceiveBuffer {
    pub fn handle(&self) -> RegionHandle {
        self.reg.handle
    }

    pub fn len(&self) -> usize {
        self.reg.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reg.region.is_empty()
    }

    /// The single section reported by the peer.
    pub fn section(&self) -> ReceiveSection {
        self.section
    }

    /// Sub-allocations the peer carves the buffer into.
    pub fn sub_alloc_count(&self) -> u32 {
        self.section.num_sub_allocs
    }

    /// Bytes of one inbound frame, or `None` if the range falls outside
    /// the buffer.
    pub fn frame(&self, offset: u32, len: u32) -> Option<&[u8]> {
        // SAFETY: the peer does not reuse a range until we complete the
        // transfer that carried it.
        unsafe { self.reg.region.slice(offset as usize, len as usize) }
    }

    /// Revoke and free the buffer.
    pub fn release<C, T>(self, chan: &C, transport: &T) -> ReleaseOutcome
    where
        C: ControlChannel + ?Sized,
        T: ChannelTransport + ?Sized,
    {
        self.reg.release(chan, transport)
    }
}

/// Registered send buffer and its section allocator.
pub struct SendBuffer {
    reg: Registration,
    section_size: u32,
    slots: SendSlotMap,
}

impl SendBuffer {
    pub fn handle(&self) -> RegionHandle {
        self.reg.handle
    }

    pub fn section_size(&self) -> u32 {
        self.section_size
    }

    pub fn section_count(&self) -> u32 {
        self.slots.section_count()
    }

    pub fn slots(&self) -> &SendSlotMap {
        &self.slots
    }

    /// Copy `data` into section `slot` at `offset`.
    ///
    /// # Safety
    /// The caller must hold `slot` from [`SendSlotMap::acquire`] and must not
    /// have handed it to the peer yet.
    pub unsafe fn copy_to_section(&self, slot: u32, offset: u32, data: &[u8]) {
        debug_assert!(offset as usize + data.len() <= self.section_size as usize);
        let base = slot as usize * self.section_size as usize + offset as usize;
        self.reg.region.write(base, data);
    }

    /// Zero `len` bytes of section `slot` starting at `offset`.
    ///
    /// # Safety
    /// Same rule as [`copy_to_section`](Self::copy_to_section).
    pub unsafe fn zero_in_section(&self, slot: u32, offset: u32, len: u32) {
        let base = slot as usize * self.section_size as usize + offset as usize;
        self.reg.region.fill_zero(base, len as usize);
    }

    /// Revoke and free the buffer. Reserved sections are dropped with it.
    pub fn release<C, T>(self, chan: &C, transport: &T) -> ReleaseOutcome
    where
        C: ControlChannel + ?Sized,
        T: ChannelTransport + ?Sized,
    {
        let busy = self.slots.in_use();
        if busy != 0 {
            warn!("netvsc: releasing send buffer with {} sections reserved", busy);
        }
        self.reg.release(chan, transport)
    }
}

/// Export a receive buffer of `size` bytes and register it with the peer.
///
/// The peer must describe it as exactly one section at offset zero. On any
/// failure the region is torn down before returning.
pub fn register_receive_buffer<C, T>(chan: &C, transport: &T, size: usize) -> Result<ReceiveBuffer>
where
    C: ControlChannel + ?Sized,
    T: ChannelTransport + ?Sized,
{
    let mut reg = Registration::export(transport, BufferRole::Receive, size)?;

    let request = NvspMessage::SendReceiveBuffer { gpadl: reg.handle, id: RECEIVE_BUFFER_ID };
    let layout = match chan.request(&request) {
        Ok(NvspMessage::SendReceiveBufferComplete { status: st, sections }) => {
            if st != status::SUCCESS {
                Err(SetupError::Rejected { stage: reg.role.stage(), status: st })
            } else {
                reg.acknowledged = true;
                match sections.as_slice() {
                    [only] if only.offset == 0 => Ok(*only),
                    _ => Err(SetupError::UnsupportedLayout {
                        sections: sections.len() as u32,
                        offset: sections.first().map_or(0, |s| s.offset),
                    }),
                }
            }
        }
        Ok(other) => Err(SetupError::UnexpectedResponse(other.msg_type())),
        Err(e) => Err(e),
    };

    match layout {
        Ok(section) => {
            info!(
                "netvsc: receive buffer {} bytes, {} sub-allocations of {}",
                size, section.num_sub_allocs, section.sub_alloc_size
            );
            Ok(ReceiveBuffer { reg, section })
        }
        Err(e) => {
            error!("netvsc: receive buffer registration failed: {}", e);
            reg.release(chan, transport);
            Err(e)
        }
    }
}

/// Export a send buffer of `size` bytes, register it, and build the
/// section allocator from the section size the peer picks.
pub fn register_send_buffer<C, T>(chan: &C, transport: &T, size: usize) -> Result<SendBuffer>
where
    C: ControlChannel + ?Sized,
    T: ChannelTransport + ?Sized,
{
    let mut reg = Registration::export(transport, BufferRole::Send, size)?;

    let request = NvspMessage::SendSendBuffer { gpadl: reg.handle, id: SEND_BUFFER_ID };
    let section_size = match chan.request(&request) {
        Ok(NvspMessage::SendSendBufferComplete { status: st, section_size }) => {
            if st != status::SUCCESS {
                Err(SetupError::Rejected { stage: reg.role.stage(), status: st })
            } else {
                reg.acknowledged = true;
                if section_size == 0 || section_size as usize > size {
                    Err(SetupError::InvalidSectionSize(section_size))
                } else {
                    Ok(section_size)
                }
            }
        }
        Ok(other) => Err(SetupError::UnexpectedResponse(other.msg_type())),
        Err(e) => Err(e),
    };

    match section_size {
        Ok(section_size) => {
            let count = (size / section_size as usize) as u32;
            info!("netvsc: send buffer {} sections of {} bytes", count, section_size);
            Ok(SendBuffer { reg, section_size, slots: SendSlotMap::new(count) })
        }
        Err(e) => {
            error!("netvsc: send buffer registration failed: {}", e);
            reg.release(chan, transport);
            Err(e)
        }
    }
}
