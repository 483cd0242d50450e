//! User-space hierarchical Class-Based Queueing (CBQ).
//!
//! Traffic classes are arranged in a tree. Each class has a priority, a weighted-round-robin
//! quantum, and an EWMA idle-time estimator that decides whether it is currently over its
//! configured rate. Classes over their rate may borrow from an ancestor that is not. When every
//! backlogged class is throttled, the scheduler arms a watchdog telling its driver when to try
//! again.
//!
//! The scheduler itself is [`scheduler::CbqScheduler`]. [`Link`] drives any [`scheduler::Qdisc`]
//! from a dedicated thread, which is how the single-writer contract of the scheduler is upheld.

pub mod config;
pub mod link;
pub mod scheduler;
pub mod time;

pub use config::CbqConfig;
pub use link::Link;
pub use scheduler::cbq::ClassId;
pub use scheduler::{CbqScheduler, Qdisc};

/// A packet buffer.
///
/// Schedulers only need the parsed IPv4 header and ports (for classification) and the length
/// (for accounting). The raw fields are deliberately not exposed.
#[derive(Clone, Debug)]
pub struct Pkt {
    ip_hdr: etherparse::Ipv4Header,
    sport: u16,
    dport: u16,
    buf: Vec<u8>,
}

impl Pkt {
    pub fn new(ip_hdr: etherparse::Ipv4Header, sport: u16, dport: u16, buf: Vec<u8>) -> Self {
        Self {
            ip_hdr,
            sport,
            dport,
            buf,
        }
    }

    pub fn hdr(&self) -> &etherparse::Ipv4Header {
        &self.ip_hdr
    }

    pub fn sport(&self) -> u16 {
        self.sport
    }

    pub fn dport(&self) -> u16 {
        self.dport
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_buf(self) -> Vec<u8> {
        self.buf
    }
}

/// Errors returned by the scheduler.
///
/// Variants that reject a packet hand it back, so the caller decides whether to drop it or push
/// back on the sender.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("class queue full, dropping {} byte packet", .0.len())]
    QueueFull(Pkt),

    #[error("packet matched no class and there is no fallback class")]
    Unclassified(Pkt),

    #[error("scheduler destroyed, dropping {} byte packet", .0.len())]
    Destroyed(Pkt),

    #[error("class {0} not found")]
    NotFound(ClassId),

    #[error("class {0} still has children")]
    ClassBusy(ClassId),

    #[error("invalid class: {0}")]
    InvalidClass(String),
}

#[cfg(test)]
pub(crate) mod t {
    use crate::Pkt;

    pub(crate) fn init() {
        use std::sync::Once;
        static INIT: Once = Once::new();

        INIT.call_once(|| {
            tracing_subscriber::fmt::init();
            color_eyre::install().unwrap();
        })
    }

    pub(crate) fn pkt(dport: u16, len: usize) -> Pkt {
        pkt_to([42, 2, 0, 0], dport, len)
    }

    pub(crate) fn pkt_to(dst_ip: [u8; 4], dport: u16, len: usize) -> Pkt {
        Pkt::new(
            etherparse::Ipv4Header::new(
                len as u16,
                64,
                etherparse::IpNumber::Udp,
                [42, 1, 0, 1],
                dst_ip,
            ),
            4000,
            dport,
            vec![0u8; len],
        )
    }
}
