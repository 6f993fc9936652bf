//! Receive path: frame delivery and receive completions.

use core::sync::atomic::Ordering;

use crate::device::Device;
use crate::protocol::{msg_type, status, NvspMessage, RECEIVE_BUFFER_ID};
use crate::recv_ring::{over_watermark, ReceiveCompletionRing, RecvCompletion};
use crate::stack::NetStack;
use crate::stats::Stats;
use crate::transport::{ChannelTransport, OutgoingPacket, PacketKind, TransferRange};

impl<T, S, B> Device<T, S, B>
where
    T: ChannelTransport,
    S: NetStack,
    B: AsRef<[u8]> + Send,
{
    pub(crate) fn on_transfer_pages(
        &self,
        queue: u16,
        transaction_id: u64,
        pageset_id: u16,
        payload: &[u8],
        ranges: &[TransferRange],
    ) {
        match NvspMessage::decode(payload) {
            Ok(msg) if msg.msg_type() == msg_type::SEND_RNDIS_PKT => {}
            Ok(msg) => {
                warn!("netvsc: transfer packet carries message type {}", msg.msg_type());
                return;
            }
            Err(e) => {
                warn!("netvsc: bad transfer packet: {}", e);
                return;
            }
        }
        if pageset_id != RECEIVE_BUFFER_ID {
            warn!("netvsc: transfer packet for page set {:#x}", pageset_id);
            return;
        }
        let Some(recv_buf) = self.recv_buf.as_ref() else {
            error!("netvsc: transfer packet before receive buffer setup");
            return;
        };

        let mut st = status::SUCCESS;
        for range in ranges {
            match recv_buf.frame(range.byte_offset, range.byte_count) {
                Some(frame) => {
                    if self.stack.deliver_frame(queue, frame) {
                        Stats::inc(&self.stats.rx_frames);
                    } else {
                        st = status::FAIL;
                    }
                }
                None => {
                    error!(
                        "netvsc: frame at {:#x}+{} outside receive buffer",
                        range.byte_offset, range.byte_count
                    );
                    st = status::FAIL;
                }
            }
        }
        if st != status::SUCCESS {
            Stats::inc(&self.stats.rx_failed);
        }

        self.complete_receive(queue, RecvCompletion { transaction_id, status: st });
    }

    /// Queue a receive completion, sending it inline if the ring is full.
    pub(crate) fn complete_receive(&self, queue: u16, completion: RecvCompletion) {
        let Some(q) = self.queues.get(queue as usize) else {
            return;
        };
        let mut ring = q.recv_ring.lock();

        let sub_allocs = self.recv_buf.as_ref().map_or(0, |b| b.sub_alloc_count());
        let outstanding = self.counters.outstanding_recvs.load(Ordering::Acquire);
        if over_watermark(outstanding, sub_allocs, self.config.recv_drain_watermark) {
            self.drain_recv_completions(queue, &mut ring);
        }

        if ring.push(completion).is_ok() {
            self.counters.outstanding_recvs.fetch_add(1, Ordering::AcqRel);
            return;
        }
        drop(ring);

        Stats::inc(&self.stats.rx_inline_completions);
        if !self.send_recv_completion(queue, &completion) {
            Stats::inc(&self.stats.rx_lost_completions);
            error!(
                "netvsc: lost receive completion {:#x} on queue {}",
                completion.transaction_id, queue
            );
        }
    }

    /// Send queued receive completions until the ring empties or the
    /// transport pushes back.
    pub(crate) fn drain_recv_completions(&self, queue: u16, ring: &mut ReceiveCompletionRing) {
        let sent = ring.drain(|c| self.send_recv_completion(queue, c));
        if sent == 0 {
            return;
        }
        let left = self
            .counters
            .outstanding_recvs
            .fetch_sub(sent as u32, Ordering::AcqRel)
            - sent as u32;
        if left == 0 && self.is_draining() {
            debug!("netvsc: all receive completions drained");
        }
    }

    fn send_recv_completion(&self, queue: u16, completion: &RecvCompletion) -> bool {
        let payload = NvspMessage::SendRndisPacketComplete { status: completion.status }.encode();
        let packet = OutgoingPacket {
            kind: PacketKind::Completion,
            payload: &payload,
            pages: &[],
            request_id: completion.transaction_id,
            completion_requested: false,
            signal: true,
        };
        match self.transport.send(queue, &packet) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    "netvsc: receive completion {:#x} deferred: {}",
                    completion.transaction_id, e
                );
                false
            }
        }
    }
}
