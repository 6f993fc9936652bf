//! Device state and the inbound callback path.
//!
//! A [`Device`] owns everything shared with the peer for one adapter: the
//! registered buffers, the per-queue batching and completion state, the
//! in-flight send table and the outstanding counters. The transmit and
//! callback paths borrow it concurrently.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::batch::PendingBatch;
use crate::buffer::{ReceiveBuffer, SendBuffer};
use crate::config::NetvscConfig;
use crate::error::{Result, SetupError, TransportError};
use crate::flow::FlowController;
use crate::protocol::{status, ControlChannel, NvspMessage, ProtocolVersion, SEND_TABLE_SIZE};
use crate::recv_ring::ReceiveCompletionRing;
use crate::stack::NetStack;
use crate::stats::{Stats, StatsSnapshot};
use crate::transport::{ChannelTransport, InboundPacket, OutgoingPacket, PacketKind};

/// VF association reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VfAssociation {
    pub allocated: bool,
    pub serial: u32,
}

/// Send handed to the peer and not completed yet.
pub(crate) struct Inflight<B> {
    pub queue: u16,
    pub slot: Option<u32>,
    /// Protocol header; page buffers may still point into it.
    pub header: Vec<u8>,
    pub owner: Option<B>,
}

/// Per-queue state.
pub(crate) struct Queue<B> {
    pub pending: Mutex<Option<PendingBatch<B>>>,
    pub recv_ring: Mutex<ReceiveCompletionRing>,
    /// Sends on this queue awaiting completion.
    pub sends: AtomicU32,
}

/// Outstanding work counters. Both at zero means the device is drained.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub outstanding_sends: AtomicU32,
    pub outstanding_recvs: AtomicU32,
}

impl Counters {
    pub fn is_drained(&self) -> bool {
        self.outstanding_sends.load(Ordering::Acquire) == 0
            && self.outstanding_recvs.load(Ordering::Acquire) == 0
    }
}

/// One network adapter instance.
///
/// `T` is the shared-memory channel, `S` the network stack above and `B`
/// the stack's frame buffer type. The bytes of a `B` must not move when the
/// value itself moves (as for `Vec<u8>` or `Box<[u8]>`), since page buffers
/// point at them until the peer completes the send.
pub struct Device<T, S, B> {
    pub(crate) transport: T,
    pub(crate) stack: S,
    pub(crate) config: NetvscConfig,
    pub(crate) version: ProtocolVersion,
    pub(crate) flow: FlowController,
    pub(crate) recv_buf: Option<ReceiveBuffer>,
    pub(crate) send_buf: Option<SendBuffer>,
    pub(crate) queues: Vec<Queue<B>>,
    pub(crate) inflight: Mutex<BTreeMap<u64, Inflight<B>>>,
    pub(crate) next_request_id: AtomicU64,
    /// Last setup response; one setup request is outstanding at a time.
    pub(crate) init_response: Mutex<Option<NvspMessage>>,
    pub(crate) counters: Counters,
    pub(crate) stats: Stats,
    pub(crate) draining: AtomicBool,
    pub(crate) vf_datapath: AtomicBool,
    pub(crate) send_table: Mutex<Option<[u32; SEND_TABLE_SIZE]>>,
    pub(crate) vf: Mutex<Option<VfAssociation>>,
}

impl<T, S, B> Device<T, S, B>
where
    T: ChannelTransport,
    S: NetStack,
    B: AsRef<[u8]> + Send,
{
    pub(crate) fn new(transport: T, stack: S, config: NetvscConfig) -> Self {
        let queues = (0..config.queue_count)
            .map(|_| Queue {
                pending: Mutex::new(None),
                recv_ring: Mutex::new(ReceiveCompletionRing::new(config.recv_completion_slots)),
                sends: AtomicU32::new(0),
            })
            .collect();
        let version = config
            .protocol_versions
            .first()
            .copied()
            .unwrap_or(ProtocolVersion::V1);

        Self {
            transport,
            stack,
            flow: FlowController::new(config.ring_low_water, config.ring_high_water),
            config,
            version,
            recv_buf: None,
            send_buf: None,
            queues,
            inflight: Mutex::new(BTreeMap::new()),
            next_request_id: AtomicU64::new(1),
            init_response: Mutex::new(None),
            counters: Counters::default(),
            stats: Stats::default(),
            draining: AtomicBool::new(false),
            vf_datapath: AtomicBool::new(false),
            send_table: Mutex::new(None),
            vf: Mutex::new(None),
        }
    }

    /// Negotiated protocol version.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn config(&self) -> &NetvscConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn stack(&self) -> &S {
        &self.stack
    }

    pub fn queue_count(&self) -> u16 {
        self.queues.len() as u16
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn outstanding_sends(&self) -> u32 {
        self.counters.outstanding_sends.load(Ordering::Acquire)
    }

    pub fn outstanding_recvs(&self) -> u32 {
        self.counters.outstanding_recvs.load(Ordering::Acquire)
    }

    /// Sends on `queue` awaiting completion.
    pub fn queue_sends(&self, queue: u16) -> u32 {
        self.queues
            .get(queue as usize)
            .map_or(0, |q| q.sends.load(Ordering::Acquire))
    }

    /// Receive completions queued on `queue`.
    pub fn pending_recv_completions(&self, queue: u16) -> usize {
        self.queues
            .get(queue as usize)
            .map_or(0, |q| q.recv_ring.lock().len())
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Section size picked by the peer, once the send buffer is registered.
    pub fn send_section_size(&self) -> Option<u32> {
        self.send_buf.as_ref().map(|b| b.section_size())
    }

    /// Send sections currently reserved.
    pub fn send_sections_in_use(&self) -> u32 {
        self.send_buf.as_ref().map_or(0, |b| b.slots().in_use())
    }

    /// Sub-allocations of the receive buffer, once registered.
    pub fn recv_sub_allocs(&self) -> Option<u32> {
        self.recv_buf.as_ref().map(|b| b.sub_alloc_count())
    }

    /// Send indirection table last pushed by the peer.
    pub fn send_table(&self) -> Option<[u32; SEND_TABLE_SIZE]> {
        *self.send_table.lock()
    }

    pub fn vf_association(&self) -> Option<VfAssociation> {
        *self.vf.lock()
    }

    /// Whether traffic is steered to the VF.
    pub fn is_vf_datapath(&self) -> bool {
        self.vf_datapath.load(Ordering::Acquire)
    }

    /// Channel callback for one queue: handle every inbound packet, then
    /// push queued receive completions back to the peer.
    ///
    /// Returns how many packets were handled.
    pub fn poll(&self, queue: u16) -> usize {
        // Once teardown has drained everything the peer has nothing left
        // that we would act on.
        if self.is_draining() && self.counters.is_drained() {
            return 0;
        }

        let mut handled = 0;
        while let Some(packet) = self.transport.receive(queue) {
            handled += 1;
            match packet {
                InboundPacket::Completion { request_id, payload } => {
                    self.on_completion(request_id, &payload)
                }
                InboundPacket::TransferPages { transaction_id, pageset_id, payload, ranges } => {
                    self.on_transfer_pages(queue, transaction_id, pageset_id, &payload, &ranges)
                }
                InboundPacket::Inband { payload, .. } => self.on_inband(&payload),
                InboundPacket::Other { packet_type, request_id } => {
                    warn!(
                        "netvsc: unhandled packet type {} (request {:#x})",
                        packet_type, request_id
                    );
                }
            }
        }

        if let Some(q) = self.queues.get(queue as usize) {
            self.drain_recv_completions(queue, &mut q.recv_ring.lock());
        }
        handled
    }

    /// [`poll`](Self::poll) every queue.
    pub fn poll_all(&self) -> usize {
        (0..self.queue_count()).map(|q| self.poll(q)).sum()
    }

    fn on_completion(&self, request_id: u64, payload: &[u8]) {
        let msg = match NvspMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("netvsc: dropping completion {:#x}: {}", request_id, e);
                return;
            }
        };

        if msg.is_init_response() {
            *self.init_response.lock() = Some(msg);
            return;
        }

        match msg {
            NvspMessage::SendRndisPacketComplete { status: st } => {
                if st != status::SUCCESS {
                    warn!("netvsc: send {:#x} completed with status {}", request_id, st);
                }
                self.on_send_complete(request_id);
            }
            other => warn!(
                "netvsc: unexpected completion type {} (request {:#x})",
                other.msg_type(),
                request_id
            ),
        }
    }

    fn on_send_complete(&self, request_id: u64) {
        let Some(entry) = self.inflight.lock().remove(&request_id) else {
            error!("netvsc: completion for unknown send {:#x}", request_id);
            return;
        };

        if let (Some(slot), Some(buf)) = (entry.slot, self.send_buf.as_ref()) {
            buf.slots().release(slot);
        }
        // Drop the frame buffer now that the peer is done with it.
        drop(entry.owner);

        let left = self.counters.outstanding_sends.fetch_sub(1, Ordering::AcqRel) - 1;
        let Some(queue) = self.queues.get(entry.queue as usize) else {
            return;
        };
        let queue_sends = queue.sends.fetch_sub(1, Ordering::AcqRel) - 1;

        let draining = self.is_draining();
        if draining && left == 0 {
            debug!("netvsc: all sends drained");
        }

        let stopped = self.stack.is_queue_stopped(entry.queue);
        let free = self.transport.ring_free_percent(entry.queue);
        if self.flow.should_resume(stopped, draining, free, queue_sends) {
            debug!("netvsc: resuming queue {} ({}% free)", entry.queue, free);
            self.stack.resume_queue(entry.queue);
            Stats::inc(&self.stats.wake_queue);
        }
    }

    fn on_inband(&self, payload: &[u8]) {
        match NvspMessage::decode(payload) {
            Ok(NvspMessage::SendIndirectionTable { table }) => {
                match <[u32; SEND_TABLE_SIZE]>::try_from(table.as_slice()) {
                    Ok(table) => *self.send_table.lock() = Some(table),
                    Err(_) => warn!(
                        "netvsc: ignoring send table with {} entries, expected {}",
                        table.len(),
                        SEND_TABLE_SIZE
                    ),
                }
            }
            Ok(NvspMessage::VfAssociation { allocated, serial }) => {
                info!("netvsc: VF association allocated={} serial={}", allocated != 0, serial);
                *self.vf.lock() = Some(VfAssociation { allocated: allocated != 0, serial });
            }
            Ok(other) => warn!("netvsc: unhandled in-band message {}", other.msg_type()),
            Err(e) => warn!("netvsc: bad in-band message: {}", e),
        }
    }

    /// Steer data traffic to the VF (`true`) or back to the synthetic path.
    pub fn switch_datapath(&self, vf: bool) -> Result<()> {
        use crate::protocol::DataPath;

        let path = if vf { DataPath::Vf } else { DataPath::Synthetic };
        self.post(&NvspMessage::SwitchDataPath(path))?;
        self.vf_datapath.store(vf, Ordering::Release);
        info!("netvsc: data path switched to {:?}", path);
        Ok(())
    }

    /// Ask the peer for `count` sub-channels. Returns how many it granted.
    pub fn request_subchannels(&self, count: u32) -> Result<u32> {
        use crate::error::SetupStage;
        use crate::protocol::SubchannelOp;

        if !self.version.has_subchannels() {
            return Err(SetupError::Unsupported);
        }
        let request = NvspMessage::SubchannelRequest { op: SubchannelOp::Allocate, count };
        match self.request(&request)? {
            NvspMessage::SubchannelComplete { status: st, count: granted } => {
                if st != status::SUCCESS {
                    return Err(SetupError::Rejected { stage: SetupStage::Subchannel, status: st });
                }
                Ok(granted.min(count))
            }
            other => Err(SetupError::UnexpectedResponse(other.msg_type())),
        }
    }

    fn send_control(&self, msg: &NvspMessage, completion_requested: bool) -> Result<()> {
        let payload = msg.encode();
        let packet = OutgoingPacket {
            kind: PacketKind::DataInband,
            payload: &payload,
            pages: &[],
            request_id: self.next_request_id.fetch_add(1, Ordering::Relaxed),
            completion_requested,
            signal: true,
        };
        self.transport.send(0, &packet).map_err(|e| match e {
            TransportError::Closed => SetupError::ChannelClosed,
            other => SetupError::Transport(other),
        })
    }
}

impl<T, S, B> ControlChannel for Device<T, S, B>
where
    T: ChannelTransport,
    S: NetStack,
    B: AsRef<[u8]> + Send,
{
    fn request(&self, msg: &NvspMessage) -> Result<NvspMessage> {
        *self.init_response.lock() = None;
        self.send_control(msg, true)?;

        let mut polls: u64 = 0;
        loop {
            if let Some(response) = self.init_response.lock().take() {
                return Ok(response);
            }
            if self.transport.is_rescinded(0) {
                return Err(SetupError::ChannelClosed);
            }
            if self.config.setup_poll_limit.map_or(false, |limit| polls >= limit) {
                error!("netvsc: no answer to message type {}", msg.msg_type());
                return Err(SetupError::Timeout);
            }
            if self.poll(0) == 0 {
                core::hint::spin_loop();
            }
            polls += 1;
        }
    }

    fn post(&self, msg: &NvspMessage) -> Result<()> {
        self.send_control(msg, false)
    }
}

impl<T, S, B> Drop for Device<T, S, B> {
    fn drop(&mut self) {
        // Without a proper teardown the peer may still use the buffers.
        if let Some(buf) = self.send_buf.take() {
            error!("netvsc: device dropped without teardown, leaking send buffer");
            core::mem::forget(buf);
        }
        if let Some(buf) = self.recv_buf.take() {
            error!("netvsc: device dropped without teardown, leaking receive buffer");
            core::mem::forget(buf);
        }
    }
}
