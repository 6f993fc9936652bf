//! Transmit path: section batching, submission and queue flow control.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::batch::{BatchPlan, BatchPlanner, PendingBatch};
use crate::buffer::SendBuffer;
use crate::device::{Device, Inflight};
use crate::error::{SendError, TransportError, TxError};
use crate::flow::FlowAction;
use crate::protocol::{NvspMessage, CHANNEL_TYPE_CONTROL, CHANNEL_TYPE_DATA, INVALID_SECTION_INDEX};
use crate::stack::NetStack;
use crate::stats::Stats;
use crate::transport::{ChannelTransport, OutgoingPacket, PacketKind, PageBuffer};

/// Frame handed down by the network stack.
pub struct OutboundPacket<B> {
    /// Transmit queue.
    pub queue: u16,
    /// Protocol (RNDIS) header preceding the payload on the wire.
    pub header: Vec<u8>,
    /// Payload buffer. `None` for control messages, which are all header.
    pub frame: Option<B>,
    /// The stack has more frames queued right behind this one.
    pub more_coming: bool,
}

impl<B: AsRef<[u8]>> OutboundPacket<B> {
    /// Data frame.
    pub fn data(queue: u16, header: Vec<u8>, frame: B, more_coming: bool) -> Self {
        Self { queue, header, frame: Some(frame), more_coming }
    }

    /// Control message.
    pub fn control(queue: u16, header: Vec<u8>) -> Self {
        Self { queue, header, frame: None, more_coming: false }
    }

    pub fn is_control(&self) -> bool {
        self.frame.is_none()
    }

    /// Header plus payload length.
    pub fn len(&self) -> usize {
        self.header.len() + self.payload().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn payload(&self) -> &[u8] {
        self.frame.as_ref().map_or(&[], |f| f.as_ref())
    }
}

/// Failed submission. The in-flight entry is handed back so the caller can
/// recover the frame.
pub(crate) struct SubmitFailure<B> {
    pub error: SendError,
    pub entry: Option<Inflight<B>>,
    /// Owed to the stack once no queue lock is held.
    pub flow: FlowAction,
}

/// Open section that could not be sent.
enum FlushFailure<B> {
    /// Ring full. The batch is handed back intact.
    Busy(PendingBatch<B>),
    /// The batch is gone; its section and buffer were released.
    Lost(SendError),
}

/// Where the current frame ended up.
enum Placement<B> {
    /// Copied into a send section.
    Section {
        slot: u32,
        /// Write offset inside the section.
        offset: u32,
        /// Frames already in the section.
        count: u32,
        /// Buffer of the previous frame in a reused section.
        prev_owner: Option<B>,
        /// The section was the queue's open batch.
        reused: bool,
        partial: bool,
    },
    /// Described by page buffers.
    Pages,
}

impl<T, S, B> Device<T, S, B>
where
    T: ChannelTransport,
    S: NetStack,
    B: AsRef<[u8]> + Send,
{
    /// Send one frame.
    ///
    /// Small data frames are copied into a send section and, while the stack
    /// reports more frames coming, left open for the next frame. Anything
    /// else goes out right away.
    ///
    /// Queue stop/resume requests reach the [`NetStack`] only after the
    /// queue's lock is dropped, so the stack may call back into `transmit`
    /// or [`flush`](Self::flush) from them.
    ///
    /// # Returns
    /// - `Err(TxError::WouldBlock(packet))`: ring full, retry once the queue
    ///   resumes
    /// - `Err(TxError::Failed(_))`: the frame is lost
    pub fn transmit(&self, packet: OutboundPacket<B>) -> Result<(), TxError<B>> {
        let q = packet.queue;
        let Some(queue) = self.queues.get(q as usize) else {
            return Err(TxError::Failed(SendError::InvalidQueue(q)));
        };
        if self.is_draining() {
            return Err(TxError::Failed(SendError::DeviceGone));
        }
        if packet.len() > u32::MAX as usize {
            Stats::inc(&self.stats.tx_dropped);
            return Err(TxError::Failed(SendError::FrameTooLarge));
        }

        let send_buf = match (&self.send_buf, packet.is_control()) {
            // Control messages never share a section.
            (_, true) => return self.send_from_pages(packet, CHANNEL_TYPE_CONTROL),
            (None, false) => return self.send_from_pages(packet, CHANNEL_TYPE_DATA),
            (Some(buf), false) => buf,
        };

        let planner = BatchPlanner::new(
            send_buf.section_size(),
            self.config.pkt_align,
            self.config.max_batch,
        );

        let mut pending = queue.pending.lock();
        let plan = planner.plan(
            pending.as_ref().map(|p| p.open_section()),
            packet.len(),
            packet.header.len(),
        );

        // Batch to send ahead of this frame.
        let mut flush = None;
        let placement = match plan {
            BatchPlan::Coalesce | BatchPlan::PartialCopy => match pending.take() {
                Some(batch) => Placement::Section {
                    slot: batch.slot,
                    offset: batch.len,
                    count: batch.count,
                    prev_owner: batch.owner,
                    reused: true,
                    partial: plan == BatchPlan::PartialCopy,
                },
                None => Placement::Pages,
            },
            BatchPlan::FreshSection => match send_buf.slots().acquire() {
                Some(slot) => {
                    flush = pending.take();
                    Placement::Section {
                        slot,
                        offset: 0,
                        count: 0,
                        prev_owner: None,
                        reused: false,
                        partial: false,
                    }
                }
                None => {
                    Stats::inc(&self.stats.tx_send_full);
                    flush = pending.take();
                    Placement::Pages
                }
            },
            BatchPlan::Unbatched => {
                flush = pending.take();
                Placement::Pages
            }
        };

        let mut flush_flow = FlowAction::Continue;
        if let Some(batch) = flush {
            // The stack's frame follows right behind. Lost batches are
            // accounted for inside.
            let (flow, result) = self.flush_batch(q, batch, true);
            flush_flow = flow;
            if let Err(FlushFailure::Busy(batch)) = result {
                // The open section must leave before this frame does.
                *pending = Some(batch);
                if let Placement::Section { slot, .. } = placement {
                    send_buf.slots().release(slot);
                }
                drop(pending);
                self.apply_flow(q, flush_flow);
                return Err(TxError::WouldBlock(packet));
            }
        }

        let Placement::Section { slot, offset, count, prev_owner, reused, partial } = placement
        else {
            drop(pending);
            self.apply_flow(q, flush_flow);
            return self.send_from_pages(packet, CHANNEL_TYPE_DATA);
        };

        let copied = if partial { packet.header.len() } else { packet.len() };
        let padding = planner.padding(packet.len(), packet.more_coming, partial);
        // SAFETY: `slot` is reserved and not yet handed to the peer; the
        // pending lock serializes writers of this queue's open section.
        unsafe { copy_frame(send_buf, slot, offset, &packet, partial, padding) };
        let total = offset + copied as u32 + padding;

        if packet.more_coming && !partial {
            // Previous frame is copied; its buffer can go.
            drop(prev_owner);
            *pending = Some(PendingBatch { slot, len: total, count: count + 1, owner: packet.frame });
            drop(pending);
            if reused {
                Stats::inc(&self.stats.tx_coalesced);
            }
            Stats::inc(&self.stats.tx_frames);
            self.apply_flow(q, flush_flow);
            return Ok(());
        }

        let mut pages = Vec::new();
        if partial {
            PageBuffer::describe(packet.payload(), &mut pages);
        }
        let msg = NvspMessage::SendRndisPacket {
            channel_type: CHANNEL_TYPE_DATA,
            section_index: slot,
            section_size: total,
        };
        let more_coming = packet.more_coming;
        let entry = Inflight { queue: q, slot: Some(slot), header: packet.header, owner: packet.frame };

        let (send_flow, result) = match self.submit(q, &msg, &pages, entry, more_coming) {
            Ok(flow) => {
                drop(prev_owner);
                if partial {
                    Stats::inc(&self.stats.tx_partial_copies);
                } else if reused {
                    Stats::inc(&self.stats.tx_coalesced);
                }
                Stats::inc(&self.stats.tx_frames);
                (flow, Ok(()))
            }
            Err(SubmitFailure { error: SendError::WouldBlock, entry, flow }) if reused => {
                // Reopen the section as it was before this frame.
                *pending = Some(PendingBatch { slot, len: offset, count, owner: prev_owner });
                (flow, Err(self.would_block(q, entry, more_coming)))
            }
            Err(SubmitFailure { error, entry, flow }) => {
                send_buf.slots().release(slot);
                drop(prev_owner);
                if error == SendError::WouldBlock {
                    (flow, Err(self.would_block(q, entry, more_coming)))
                } else {
                    drop(entry);
                    Stats::inc(&self.stats.tx_dropped);
                    error!("netvsc: send on queue {} failed: {}", q, error);
                    (flow, Err(TxError::Failed(error)))
                }
            }
        };
        drop(pending);

        self.apply_flow(q, flush_flow);
        self.apply_flow(q, send_flow);
        result
    }

    /// Send the open section of `queue`, if any.
    ///
    /// On `SendError::WouldBlock` the section stays open and a later flush
    /// (or transmit) sends it. Any other error means its frames are lost.
    pub fn flush(&self, queue: u16) -> Result<(), SendError> {
        let q = self
            .queues
            .get(queue as usize)
            .ok_or(SendError::InvalidQueue(queue))?;

        let mut pending = q.pending.lock();
        let Some(batch) = pending.take() else {
            return Ok(());
        };
        let (flow, result) = self.flush_batch(queue, batch, false);
        let result = match result {
            Ok(()) => Ok(()),
            Err(FlushFailure::Busy(batch)) => {
                *pending = Some(batch);
                Err(SendError::WouldBlock)
            }
            Err(FlushFailure::Lost(error)) => Err(error),
        };
        drop(pending);

        self.apply_flow(queue, flow);
        result
    }

    /// Submit an open section.
    ///
    /// A busy ring hands the batch back. On any other failure its section
    /// and buffer are released here.
    fn flush_batch(
        &self,
        queue: u16,
        batch: PendingBatch<B>,
        more_coming: bool,
    ) -> (FlowAction, Result<(), FlushFailure<B>>) {
        let PendingBatch { slot, len, count, owner } = batch;
        let msg = NvspMessage::SendRndisPacket {
            channel_type: CHANNEL_TYPE_DATA,
            section_index: slot,
            section_size: len,
        };
        let entry = Inflight { queue, slot: Some(slot), header: Vec::new(), owner };

        match self.submit(queue, &msg, &[], entry, more_coming) {
            Ok(flow) => (flow, Ok(())),
            Err(SubmitFailure { error: SendError::WouldBlock, entry: Some(entry), flow }) => {
                let batch = PendingBatch { slot, len, count, owner: entry.owner };
                (flow, Err(FlushFailure::Busy(batch)))
            }
            Err(SubmitFailure { error, entry, flow }) => {
                if let Some(buf) = self.send_buf.as_ref() {
                    buf.slots().release(slot);
                }
                drop(entry);
                Stats::inc(&self.stats.tx_dropped);
                error!("netvsc: lost {} batched frames on queue {}: {}", count, queue, error);
                let error = match error {
                    // Nothing left to retry.
                    SendError::WouldBlock => SendError::Transport(TransportError::WouldBlock),
                    other => other,
                };
                (flow, Err(FlushFailure::Lost(error)))
            }
        }
    }

    /// Send a frame straight from its own memory.
    fn send_from_pages(
        &self,
        packet: OutboundPacket<B>,
        channel_type: u32,
    ) -> Result<(), TxError<B>> {
        let q = packet.queue;
        let mut pages = Vec::with_capacity(
            PageBuffer::count(&packet.header) + PageBuffer::count(packet.payload()),
        );
        PageBuffer::describe(&packet.header, &mut pages);
        PageBuffer::describe(packet.payload(), &mut pages);

        let msg = NvspMessage::SendRndisPacket {
            channel_type,
            section_index: INVALID_SECTION_INDEX,
            section_size: 0,
        };
        let more_coming = packet.more_coming;
        let entry = Inflight { queue: q, slot: None, header: packet.header, owner: packet.frame };

        let (flow, result) = match self.submit(q, &msg, &pages, entry, more_coming) {
            Ok(flow) => {
                if channel_type == CHANNEL_TYPE_DATA {
                    Stats::inc(&self.stats.tx_page_sends);
                    Stats::inc(&self.stats.tx_frames);
                }
                (flow, Ok(()))
            }
            Err(SubmitFailure { error: SendError::WouldBlock, entry, flow }) => {
                (flow, Err(self.would_block(q, entry, more_coming)))
            }
            Err(SubmitFailure { error, flow, .. }) => {
                Stats::inc(&self.stats.tx_dropped);
                error!("netvsc: send on queue {} failed: {}", q, error);
                (flow, Err(TxError::Failed(error)))
            }
        };
        self.apply_flow(q, flow);
        result
    }

    fn would_block(&self, queue: u16, entry: Option<Inflight<B>>, more_coming: bool) -> TxError<B> {
        match entry {
            Some(entry) => TxError::WouldBlock(OutboundPacket {
                queue,
                header: entry.header,
                frame: entry.owner,
                more_coming,
            }),
            None => TxError::Failed(SendError::WouldBlock),
        }
    }

    /// Put one packet on the ring and account for it.
    ///
    /// The in-flight entry is published before the send so a completion
    /// racing with this call finds it. The returned flow action is left to
    /// the caller, which applies it once its queue lock is released.
    pub(crate) fn submit(
        &self,
        queue: u16,
        msg: &NvspMessage,
        pages: &[PageBuffer],
        entry: Inflight<B>,
        more_coming: bool,
    ) -> Result<FlowAction, SubmitFailure<B>> {
        if self.transport.is_rescinded(queue) {
            return Err(SubmitFailure {
                error: SendError::Rescinded,
                entry: Some(entry),
                flow: FlowAction::Continue,
            });
        }
        let Some(q) = self.queues.get(queue as usize) else {
            return Err(SubmitFailure {
                error: SendError::InvalidQueue(queue),
                entry: Some(entry),
                flow: FlowAction::Continue,
            });
        };

        let free = self.transport.ring_free_percent(queue);
        let payload = msg.encode();
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let packet = OutgoingPacket {
            kind: PacketKind::DataInband,
            payload: &payload,
            pages,
            request_id,
            completion_requested: true,
            signal: self.flow.should_signal(free, more_coming),
        };

        self.inflight.lock().insert(request_id, entry);
        self.counters.outstanding_sends.fetch_add(1, Ordering::AcqRel);
        q.sends.fetch_add(1, Ordering::AcqRel);

        match self.transport.send(queue, &packet) {
            Ok(()) => {
                let sends = q.sends.load(Ordering::Acquire);
                Ok(self.flow.after_send(free, sends))
            }
            Err(e) => {
                let entry = self.inflight.lock().remove(&request_id);
                self.counters.outstanding_sends.fetch_sub(1, Ordering::AcqRel);
                let sends = q.sends.fetch_sub(1, Ordering::AcqRel) - 1;

                let error = SendError::from(e);
                let flow = if error == SendError::WouldBlock {
                    Stats::inc(&self.stats.tx_busy);
                    self.flow.after_busy(sends)
                } else {
                    FlowAction::Continue
                };
                Err(SubmitFailure { error, entry, flow })
            }
        }
    }

    fn apply_flow(&self, queue: u16, action: FlowAction) {
        match action {
            FlowAction::Continue => {}
            FlowAction::Stop => {
                debug!("netvsc: stopping queue {}", queue);
                self.stack.stop_queue(queue);
                Stats::inc(&self.stats.stop_queue);
            }
            FlowAction::StopAndResume => {
                // Nothing in flight would ever wake the queue.
                self.stack.stop_queue(queue);
                self.stack.resume_queue(queue);
                Stats::inc(&self.stats.stop_queue);
                Stats::inc(&self.stats.wake_queue);
            }
        }
    }
}

/// Copy a frame (or only its header) into a section and zero the padding.
///
/// # Safety
/// The caller must hold `slot` and it must not be visible to the peer.
unsafe fn copy_frame<B: AsRef<[u8]>>(
    buf: &SendBuffer,
    slot: u32,
    offset: u32,
    packet: &OutboundPacket<B>,
    partial: bool,
    padding: u32,
) {
    let mut at = offset;
    buf.copy_to_section(slot, at, &packet.header);
    at += packet.header.len() as u32;
    if !partial {
        let payload = packet.payload();
        buf.copy_to_section(slot, at, payload);
        at += payload.len() as u32;
    }
    if padding != 0 {
        buf.zero_in_section(slot, at, padding);
    }
}
