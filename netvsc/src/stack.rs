//! Upper network layer seam.

/// Callbacks into the network stack sitting above the front-end.
///
/// Invoked from both the transmit path and the channel callback. No queue
/// lock is held during a call, so implementations may transmit or flush
/// from inside `stop_queue` and `resume_queue`.
pub trait NetStack: Send + Sync {
    /// Stop offering frames on a transmit queue.
    fn stop_queue(&self, queue: u16);

    /// Resume offering frames on a transmit queue.
    fn resume_queue(&self, queue: u16);

    /// Whether a transmit queue is currently stopped.
    fn is_queue_stopped(&self, queue: u16) -> bool;

    /// Hand one received frame (still RNDIS framed) to the stack.
    ///
    /// Returns `false` if the stack could not accept it; the peer is then
    /// told the frame failed.
    fn deliver_frame(&self, queue: u16, frame: &[u8]) -> bool;
}
