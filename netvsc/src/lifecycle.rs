//! Device bring-up and teardown.

use core::sync::atomic::Ordering;

use crate::buffer::{register_receive_buffer, register_send_buffer, ReleaseOutcome};
use crate::config::NetvscConfig;
use crate::device::Device;
use crate::error::{Result, SendError, SetupError};
use crate::protocol::{negotiate, send_ndis_version};
use crate::stack::NetStack;
use crate::transport::ChannelTransport;

/// Outcome of [`Device::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    /// Every in-flight operation completed before the buffers were freed.
    pub drained: bool,
    /// Sends still outstanding when teardown went ahead.
    pub outstanding_sends: u32,
    /// Receive completions still outstanding when teardown went ahead.
    pub outstanding_recvs: u32,
    pub send_buffer: Option<ReleaseOutcome>,
    pub receive_buffer: Option<ReleaseOutcome>,
}

impl TeardownReport {
    /// Whether a buffer had to stay pinned.
    pub fn leaked(&self) -> bool {
        self.send_buffer == Some(ReleaseOutcome::Leaked)
            || self.receive_buffer == Some(ReleaseOutcome::Leaked)
    }
}

impl<T, S, B> Device<T, S, B>
where
    T: ChannelTransport,
    S: NetStack,
    B: AsRef<[u8]> + Send,
{
    /// Bring up a device: open the channel, negotiate the protocol and
    /// register the receive and send buffers.
    ///
    /// On failure everything set up so far is torn down in reverse order
    /// and the channel is closed.
    pub fn add(transport: T, stack: S, config: NetvscConfig) -> Result<Self> {
        config.validate()?;

        let mut device = Self::new(transport, stack, config);
        device.transport.open(device.config.ring_pages).map_err(|e| {
            error!("netvsc: unable to open channel: {}", e);
            SetupError::Open(e)
        })?;

        if let Err(e) = device.connect() {
            error!("netvsc: device setup failed: {}", e);
            device.destroy_buffers();
            device.transport.close();
            return Err(e);
        }

        info!(
            "netvsc: device up, protocol {}, {} queues",
            device.version,
            device.queues.len()
        );
        Ok(device)
    }

    fn connect(&mut self) -> Result<()> {
        let version = negotiate(&*self, &self.config.protocol_versions, self.config.mtu)?;
        self.version = version;

        send_ndis_version(&*self, version)?;

        let size = self.config.recv_buffer_size_for(version);
        let recv = register_receive_buffer(&*self, &self.transport, size)?;
        self.recv_buf = Some(recv);

        let send = register_send_buffer(&*self, &self.transport, self.config.send_buffer_size)?;
        self.send_buf = Some(send);
        Ok(())
    }

    /// Stop admitting new sends. In-flight work keeps completing.
    pub fn begin_remove(&self) {
        if !self.draining.swap(true, Ordering::AcqRel) {
            info!("netvsc: device removal started");
        }
    }

    /// Tear the device down.
    ///
    /// Open sections are flushed and inbound traffic is polled until every
    /// outstanding send and receive completed (or the drain budget ran
    /// out). Then the buffers are revoked and freed and the channel is
    /// closed.
    pub fn remove(mut self) -> TeardownReport {
        self.begin_remove();

        let drained = self.wait_drain();
        let outstanding_sends = self.outstanding_sends();
        let outstanding_recvs = self.outstanding_recvs();
        if !drained {
            error!(
                "netvsc: forcing teardown with {} sends and {} receives outstanding",
                outstanding_sends, outstanding_recvs
            );
        }
        for (queue, q) in self.queues.iter().enumerate() {
            if let Some(batch) = q.pending.lock().take() {
                error!(
                    "netvsc: dropping {} unsent batched frames on queue {}",
                    batch.count, queue
                );
            }
        }

        let (send_buffer, receive_buffer) = self.destroy_buffers();
        self.inflight.lock().clear();
        self.transport.close();

        TeardownReport {
            drained,
            outstanding_sends,
            outstanding_recvs,
            send_buffer,
            receive_buffer,
        }
    }

    fn wait_drain(&self) -> bool {
        let mut polls: u64 = 0;
        loop {
            let open = self.flush_all();
            if open == 0 && self.counters.is_drained() {
                return true;
            }
            if self.config.drain_poll_limit.map_or(false, |limit| polls >= limit) {
                return false;
            }
            if self.poll_all() == 0 {
                core::hint::spin_loop();
            }
            polls += 1;
        }
    }

    /// Try to send every open section. Returns how many stay open because
    /// the ring was full.
    fn flush_all(&self) -> usize {
        (0..self.queue_count())
            .filter(|&queue| self.flush(queue) == Err(SendError::WouldBlock))
            .count()
    }

    /// Release the send buffer, then the receive buffer.
    fn destroy_buffers(&mut self) -> (Option<ReleaseOutcome>, Option<ReleaseOutcome>) {
        let send = self
            .send_buf
            .take()
            .map(|buf| buf.release(&*self, &self.transport));
        let recv = self
            .recv_buf
            .take()
            .map(|buf| buf.release(&*self, &self.transport));
        (send, recv)
    }
}
