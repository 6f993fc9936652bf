//! Mock peer, transport and network stack shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use morpheus_netvsc::protocol::{
    status, NvspMessage, ReceiveSection, CHANNEL_TYPE_DATA, INVALID_SECTION_INDEX,
    RECEIVE_BUFFER_ID,
};
use morpheus_netvsc::transport::TransferRange;
use morpheus_netvsc::{
    ChannelTransport, Device, InboundPacket, NetStack, NetvscConfig, OutgoingPacket, PacketKind,
    PageBuffer, ProtocolVersion, TransportError,
};

pub const SECTION_SIZE: u32 = 4096;
pub const BUFFER_SIZE: usize = 64 * 1024;
pub const SUB_ALLOCS: u32 = 10;

/// Packet the device put on a ring.
#[derive(Debug, Clone)]
pub struct Sent {
    pub queue: u16,
    pub kind: PacketKind,
    pub msg: Option<NvspMessage>,
    pub pages: Vec<PageBuffer>,
    pub request_id: u64,
    pub completion_requested: bool,
    pub signal: bool,
    /// Copy of the referenced send section, taken at send time.
    pub section: Option<Vec<u8>>,
}

impl Sent {
    /// `(channel_type, section_index, section_size)` of an RNDIS send.
    pub fn rndis(&self) -> Option<(u32, u32, u32)> {
        match self.msg {
            Some(NvspMessage::SendRndisPacket { channel_type, section_index, section_size }) => {
                Some((channel_type, section_index, section_size))
            }
            _ => None,
        }
    }

    pub fn page_bytes(&self) -> u32 {
        self.pages.iter().map(|p| p.len).sum()
    }
}

struct Export {
    handle: u32,
    base: usize,
    len: usize,
}

/// Peer behaviour and everything observed on the channel.
pub struct PeerState {
    pub accept_versions: Vec<ProtocolVersion>,
    pub recv_status: u32,
    pub recv_sections: Vec<ReceiveSection>,
    pub send_status: u32,
    pub section_size: u32,
    pub subchannels_granted: u32,
    /// Ignore setup requests.
    pub silent: bool,
    /// Complete data sends as soon as they are queued.
    pub auto_complete: bool,
    pub fail_export: bool,
    pub fail_revoke: bool,
    pub rescinded: bool,
    /// Refuse every receive completion with `WouldBlock`.
    pub block_completions: bool,
    /// Refuse this many more receive completions with `WouldBlock`.
    pub completion_refusals: u32,
    /// Errors returned by the next RNDIS sends, in order.
    pub data_errors: VecDeque<TransportError>,
    pub ring_free: u32,

    pub opened: Option<u32>,
    pub closed: bool,
    pub(crate) exports: Vec<Export>,
    pub export_lens: Vec<usize>,
    pub export_count: u32,
    pub unexport_count: u32,
    pub(crate) recv_handle: Option<u32>,
    pub(crate) send_handle: Option<u32>,
    pub sent: Vec<Sent>,
    pub(crate) completed: HashSet<u64>,
    pub(crate) inbound: Vec<VecDeque<InboundPacket>>,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            accept_versions: vec![
                ProtocolVersion::V1,
                ProtocolVersion::V2,
                ProtocolVersion::V4,
                ProtocolVersion::V5,
            ],
            recv_status: status::SUCCESS,
            recv_sections: vec![ReceiveSection {
                offset: 0,
                sub_alloc_size: 1728,
                num_sub_allocs: SUB_ALLOCS,
                end_offset: BUFFER_SIZE as u32,
            }],
            send_status: status::SUCCESS,
            section_size: SECTION_SIZE,
            subchannels_granted: 0,
            silent: false,
            auto_complete: false,
            fail_export: false,
            fail_revoke: false,
            rescinded: false,
            block_completions: false,
            completion_refusals: 0,
            data_errors: VecDeque::new(),
            ring_free: 100,
            opened: None,
            closed: false,
            exports: Vec::new(),
            export_lens: Vec::new(),
            export_count: 0,
            unexport_count: 0,
            recv_handle: None,
            send_handle: None,
            sent: Vec::new(),
            completed: HashSet::new(),
            inbound: (0..8).map(|_| VecDeque::new()).collect(),
        }
    }
}

impl PeerState {
    fn export_base(&self, handle: Option<u32>) -> Option<&Export> {
        let handle = handle?;
        self.exports.iter().find(|e| e.handle == handle)
    }

    fn respond(&mut self, request_id: u64, msg: NvspMessage) {
        let payload = msg.encode();
        self.inbound[0].push_back(InboundPacket::Completion { request_id, payload });
    }

    fn complete_send(&mut self, queue: u16, request_id: u64) {
        if self.completed.insert(request_id) {
            let payload = NvspMessage::SendRndisPacketComplete { status: status::SUCCESS }.encode();
            self.inbound[queue as usize].push_back(InboundPacket::Completion { request_id, payload });
        }
    }
}

/// Transport backed by an in-memory peer.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<PeerState>>,
}

impl MockTransport {
    pub fn new(state: PeerState) -> Self {
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap()
    }

    /// RNDIS data sends, in order.
    pub fn data_sends(&self) -> Vec<Sent> {
        self.state()
            .sent
            .iter()
            .filter(|s| matches!(s.rndis(), Some((CHANNEL_TYPE_DATA, _, _))))
            .cloned()
            .collect()
    }

    /// All RNDIS sends, data and control.
    pub fn rndis_sends(&self) -> Vec<Sent> {
        self.state().sent.iter().filter(|s| s.rndis().is_some()).cloned().collect()
    }

    /// Control messages other than RNDIS sends.
    pub fn control_messages(&self) -> Vec<NvspMessage> {
        self.state()
            .sent
            .iter()
            .filter(|s| s.kind == PacketKind::DataInband && s.rndis().is_none())
            .filter_map(|s| s.msg.clone())
            .collect()
    }

    /// Receive completions as `(transaction_id, status)`.
    pub fn recv_completions(&self) -> Vec<(u64, u32)> {
        self.state()
            .sent
            .iter()
            .filter(|s| s.kind == PacketKind::Completion)
            .map(|s| match s.msg {
                Some(NvspMessage::SendRndisPacketComplete { status: st }) => (s.request_id, st),
                _ => (s.request_id, u32::MAX),
            })
            .collect()
    }

    /// Queue completions for every RNDIS send not completed yet.
    pub fn complete_sends(&self) {
        let mut st = self.state();
        let pending: Vec<(u16, u64)> = st
            .sent
            .iter()
            .filter(|s| s.rndis().is_some())
            .map(|s| (s.queue, s.request_id))
            .collect();
        for (queue, id) in pending {
            st.complete_send(queue, id);
        }
    }

    pub fn push_inbound(&self, queue: u16, packet: InboundPacket) {
        self.state().inbound[queue as usize].push_back(packet);
    }

    /// Write into the receive buffer as the host would.
    pub fn write_recv(&self, offset: usize, bytes: &[u8]) {
        let st = self.state();
        let export = st.export_base(st.recv_handle).expect("receive buffer not exported");
        assert!(offset + bytes.len() <= export.len);
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (export.base as *mut u8).add(offset),
                bytes.len(),
            );
        }
    }

    /// Hand frames at `ranges` of the receive buffer to the guest.
    pub fn deliver(&self, queue: u16, transaction_id: u64, ranges: &[(u32, u32)]) {
        let payload = NvspMessage::SendRndisPacket {
            channel_type: CHANNEL_TYPE_DATA,
            section_index: INVALID_SECTION_INDEX,
            section_size: 0,
        }
        .encode();
        self.push_inbound(
            queue,
            InboundPacket::TransferPages {
                transaction_id,
                pageset_id: RECEIVE_BUFFER_ID,
                payload,
                ranges: ranges
                    .iter()
                    .map(|&(byte_offset, byte_count)| TransferRange { byte_offset, byte_count })
                    .collect(),
            },
        );
    }
}

impl ChannelTransport for MockTransport {
    fn open(&self, ring_pages: u32) -> Result<(), TransportError> {
        self.state().opened = Some(ring_pages);
        Ok(())
    }

    fn close(&self) {
        self.state().closed = true;
    }

    fn send(&self, queue: u16, packet: &OutgoingPacket<'_>) -> Result<(), TransportError> {
        let mut st = self.state();
        if st.rescinded {
            return Err(TransportError::Closed);
        }
        let msg = NvspMessage::decode(packet.payload).ok();

        if packet.kind == PacketKind::Completion {
            if st.block_completions {
                return Err(TransportError::WouldBlock);
            }
            if st.completion_refusals > 0 {
                st.completion_refusals -= 1;
                return Err(TransportError::WouldBlock);
            }
        }

        let mut section = None;
        match &msg {
            Some(NvspMessage::SendRndisPacket { section_index, section_size, .. }) => {
                if let Some(e) = st.data_errors.pop_front() {
                    return Err(e);
                }
                if *section_index != INVALID_SECTION_INDEX {
                    let export = st.export_base(st.send_handle).expect("send buffer not exported");
                    let start = *section_index as usize * st.section_size as usize;
                    assert!(start + *section_size as usize <= export.len);
                    let bytes = unsafe {
                        std::slice::from_raw_parts(
                            (export.base as *const u8).add(start),
                            *section_size as usize,
                        )
                    };
                    section = Some(bytes.to_vec());
                }
            }
            Some(NvspMessage::RevokeReceiveBuffer { .. })
            | Some(NvspMessage::RevokeSendBuffer { .. })
                if st.fail_revoke =>
            {
                return Err(TransportError::Failed(-5));
            }
            _ => {}
        }

        st.sent.push(Sent {
            queue,
            kind: packet.kind,
            msg: msg.clone(),
            pages: packet.pages.to_vec(),
            request_id: packet.request_id,
            completion_requested: packet.completion_requested,
            signal: packet.signal,
            section,
        });

        if packet.kind == PacketKind::Completion {
            return Ok(());
        }

        let id = packet.request_id;
        match msg {
            Some(NvspMessage::SendRndisPacket { .. }) => {
                if st.auto_complete {
                    st.complete_send(queue, id);
                }
            }
            _ if st.silent => {}
            Some(NvspMessage::Init { min, .. }) => {
                let accepted = st.accept_versions.contains(&min);
                st.respond(
                    id,
                    NvspMessage::InitComplete {
                        negotiated: min.0,
                        max_mdl_chain_len: 34,
                        status: if accepted { status::SUCCESS } else { status::FAIL },
                    },
                );
            }
            Some(NvspMessage::SendReceiveBuffer { gpadl, .. }) => {
                st.recv_handle = Some(gpadl.0);
                let reply = NvspMessage::SendReceiveBufferComplete {
                    status: st.recv_status,
                    sections: st.recv_sections.clone(),
                };
                st.respond(id, reply);
            }
            Some(NvspMessage::SendSendBuffer { gpadl, .. }) => {
                st.send_handle = Some(gpadl.0);
                let reply = NvspMessage::SendSendBufferComplete {
                    status: st.send_status,
                    section_size: st.section_size,
                };
                st.respond(id, reply);
            }
            Some(NvspMessage::SubchannelRequest { count, .. }) => {
                let granted = st.subchannels_granted.min(count);
                st.respond(id, NvspMessage::SubchannelComplete { status: status::SUCCESS, count: granted });
            }
            _ => {}
        }
        Ok(())
    }

    fn receive(&self, queue: u16) -> Option<InboundPacket> {
        self.state().inbound.get_mut(queue as usize)?.pop_front()
    }

    fn ring_free_percent(&self, _queue: u16) -> u32 {
        self.state().ring_free
    }

    fn export_region(
        &self,
        base: *const u8,
        len: usize,
    ) -> Result<morpheus_netvsc::transport::RegionHandle, TransportError> {
        let mut st = self.state();
        if st.fail_export {
            return Err(TransportError::Failed(-12));
        }
        st.export_count += 1;
        let handle = st.export_count;
        st.exports.push(Export { handle, base: base as usize, len });
        st.export_lens.push(len);
        Ok(morpheus_netvsc::transport::RegionHandle(handle))
    }

    fn unexport_region(
        &self,
        handle: morpheus_netvsc::transport::RegionHandle,
    ) -> Result<(), TransportError> {
        let mut st = self.state();
        st.exports.retain(|e| e.handle != handle.0);
        st.unexport_count += 1;
        Ok(())
    }

    fn is_rescinded(&self, _queue: u16) -> bool {
        self.state().rescinded
    }
}

/// Upper layer recording what the device asked of it.
#[derive(Default)]
pub struct StackState {
    pub stopped: HashSet<u16>,
    pub stop_calls: u32,
    pub resume_calls: u32,
    pub delivered: Vec<(u16, Vec<u8>)>,
    pub reject_frames: bool,
    /// Run from `stop_queue`, without the state lock held.
    pub on_stop: Option<Box<dyn FnMut(u16) + Send>>,
}

#[derive(Clone, Default)]
pub struct MockStack {
    state: Arc<Mutex<StackState>>,
}

impl MockStack {
    pub fn state(&self) -> MutexGuard<'_, StackState> {
        self.state.lock().unwrap()
    }
}

impl NetStack for MockStack {
    fn stop_queue(&self, queue: u16) {
        let hook = {
            let mut st = self.state();
            st.stopped.insert(queue);
            st.stop_calls += 1;
            st.on_stop.take()
        };
        // Nested stops while the hook runs skip it.
        if let Some(mut hook) = hook {
            hook(queue);
            self.state().on_stop = Some(hook);
        }
    }

    fn resume_queue(&self, queue: u16) {
        let mut st = self.state();
        st.stopped.remove(&queue);
        st.resume_calls += 1;
    }

    fn is_queue_stopped(&self, queue: u16) -> bool {
        self.state().stopped.contains(&queue)
    }

    fn deliver_frame(&self, queue: u16, frame: &[u8]) -> bool {
        let mut st = self.state();
        if st.reject_frames {
            return false;
        }
        st.delivered.push((queue, frame.to_vec()));
        true
    }
}

/// Frame buffer counting its drops.
#[derive(Debug)]
pub struct TestFrame {
    pub data: Vec<u8>,
    drops: Arc<AtomicUsize>,
}

impl AsRef<[u8]> for TestFrame {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for TestFrame {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Makes frames and counts how many were released.
#[derive(Clone, Default)]
pub struct FrameFactory {
    drops: Arc<AtomicUsize>,
}

impl FrameFactory {
    /// Frame of `len` bytes filled with `fill`.
    pub fn frame(&self, len: usize, fill: u8) -> TestFrame {
        TestFrame { data: vec![fill; len], drops: self.drops.clone() }
    }

    pub fn dropped(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }
}

pub type TestDevice = Device<MockTransport, MockStack, TestFrame>;

pub const HEADER_LEN: usize = 20;

/// RNDIS-like header of `HEADER_LEN` bytes tagged with `tag`.
pub fn header(tag: u8) -> Vec<u8> {
    let mut h = vec![0xA0; HEADER_LEN];
    h[0] = tag;
    h
}

/// Small buffers so tests stay fast.
pub fn test_config() -> NetvscConfig {
    NetvscConfig {
        queue_count: 2,
        recv_buffer_size: BUFFER_SIZE,
        recv_buffer_size_legacy: BUFFER_SIZE / 2,
        send_buffer_size: BUFFER_SIZE,
        recv_completion_slots: 32,
        setup_poll_limit: Some(32),
        drain_poll_limit: Some(32),
        ..NetvscConfig::default()
    }
}

pub fn bring_up_with(
    peer: PeerState,
    config: NetvscConfig,
) -> (TestDevice, MockTransport, MockStack) {
    let transport = MockTransport::new(peer);
    let stack = MockStack::default();
    let device = Device::add(transport.clone(), stack.clone(), config).expect("bring-up failed");
    (device, transport, stack)
}

pub fn bring_up() -> (TestDevice, MockTransport, MockStack) {
    bring_up_with(PeerState::default(), test_config())
}
