use std::time::Duration;

use quanta::Instant;

use super::{Error, Pkt};

/// A queueing discipline that [`crate::Link`] can drive.
///
/// Implementations are not reentrant: the caller serializes all calls, e.g. by owning the
/// discipline on a single thread.
pub trait Qdisc {
    /// Enqueue a packet.
    ///
    /// A rejected packet is handed back inside the error.
    fn enqueue(&mut self, p: Pkt) -> Result<(), Error>;

    /// Dequeue the next packet to transmit.
    ///
    /// `None` is a normal outcome: either nothing is queued, or everything queued is currently
    /// throttled, in which case [`Qdisc::next_wakeup`] says when to try again.
    fn dequeue(&mut self) -> Option<Pkt>;

    /// Drop every queued packet and return to the initial state.
    fn reset(&mut self);

    /// Reset, then release all internal state. The discipline rejects further packets.
    fn destroy(&mut self);

    /// The current length of the queue in packets.
    fn len_packets(&self) -> usize;

    /// The current length of the queue in bytes.
    fn len_bytes(&self) -> usize;

    /// Whether the queue is currently empty.
    ///
    /// If this returns `true`, `dequeue` *must* return `None`.
    fn is_empty(&self) -> bool {
        self.len_packets() == 0
    }

    /// When the caller should call `dequeue` again after it returned `None` with packets still
    /// queued.
    fn next_wakeup(&self) -> Option<Instant> {
        None
    }

    /// Called periodically when it is time to dump debug info logs.
    fn dbg(&mut self, _epoch_dur: Duration) {}
}

/// The per-class sub-queue holding packets assigned to one class.
pub trait InnerQueue: Send {
    /// Enqueue a packet, or hand it back if the queue is full.
    fn enqueue(&mut self, p: Pkt) -> Result<(), Pkt>;

    /// Dequeue the next packet. May return `None` while packets are queued if the queue is
    /// pacing its output.
    fn dequeue(&mut self) -> Option<Pkt>;

    fn len(&self) -> usize;

    fn len_bytes(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued packet.
    fn reset(&mut self);

    /// If the queue holds packets it currently refuses to release, how long until it will.
    fn ready_in(&self) -> Option<Duration> {
        None
    }
}

mod fifo;
pub use fifo::Fifo;

mod tbf;
pub use tbf::TokenBucket;

pub mod classify;
pub use classify::{Classifier, RuleClassifier};

pub mod cbq;
pub use cbq::CbqScheduler;
