//! Token-bucket paced inner queue.
//!
//! Holds packets in a byte-limited FIFO and releases the head packet only once enough tokens
//! have accumulated. This is the inner queue that can refuse to dequeue while non-empty, which
//! CBQ treats as "skip this class for now". Packets larger than the burst could never collect
//! enough tokens, so they are refused at enqueue.

use std::{collections::VecDeque, time::Duration};

use quanta::Instant;
use tracing::trace;

use super::InnerQueue;
use crate::time::{tdiff, TimeSource};
use crate::Pkt;

/// Tokens granted to an idle bucket: one full-size ethernet frame.
const IDLE_TOKENS: usize = 1514;

pub struct TokenBucket<T: TimeSource> {
    clock: T,
    rate_bytes_per_sec: usize,
    burst_bytes: usize,
    accum_bytes: usize,
    last_incr: Option<Instant>,
    limit_bytes: usize,
    cur_qsize_bytes: usize,
    queue: VecDeque<Pkt>,
}

impl<T: TimeSource> std::fmt::Debug for TokenBucket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("TokenBucket")
            .field("rate_bytes_per_sec", &self.rate_bytes_per_sec)
            .field("burst_bytes", &self.burst_bytes)
            .field("accum_bytes", &self.accum_bytes)
            .field("queue_len", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl<T: TimeSource> TokenBucket<T> {
    pub fn new(
        clock: T,
        rate_bytes_per_sec: usize,
        burst_bytes: usize,
        limit_bytes: usize,
    ) -> Self {
        Self {
            clock,
            rate_bytes_per_sec: rate_bytes_per_sec.max(1),
            burst_bytes: burst_bytes.max(IDLE_TOKENS),
            accum_bytes: IDLE_TOKENS,
            last_incr: None,
            limit_bytes,
            cur_qsize_bytes: 0,
            queue: Default::default(),
        }
    }

    fn accumulate(&mut self) {
        let now = self.clock.now();
        let last_incr = match self.last_incr {
            Some(t) => t,
            None => {
                self.last_incr = Some(now);
                return;
            }
        };

        let elapsed = tdiff(now, last_incr).max(0) as u128;
        let earned = elapsed * self.rate_bytes_per_sec as u128 / 1_000_000_000;
        if earned == 0 {
            // don't move last_incr, or sub-byte progress is lost.
            return;
        }

        self.accum_bytes =
            (self.accum_bytes as u128 + earned).min(self.burst_bytes as u128) as usize;
        self.last_incr = Some(now);
    }

    fn idle(&mut self) {
        self.last_incr = None;
        self.accum_bytes = IDLE_TOKENS;
    }
}

impl<T: TimeSource> InnerQueue for TokenBucket<T> {
    fn enqueue(&mut self, p: Pkt) -> Result<(), Pkt> {
        if p.len() > self.burst_bytes {
            trace!(len = p.len(), burst = self.burst_bytes, "packet exceeds burst");
            return Err(p);
        }

        if self.cur_qsize_bytes + p.len() > self.limit_bytes {
            return Err(p);
        }

        self.cur_qsize_bytes += p.len();
        self.queue.push_back(p);
        Ok(())
    }

    fn dequeue(&mut self) -> Option<Pkt> {
        let len = match self.queue.front() {
            Some(p) => p.len(),
            None => {
                self.idle();
                return None;
            }
        };

        self.accumulate();
        if len > self.accum_bytes {
            trace!(?len, accum = self.accum_bytes, "token bucket throttled");
            return None;
        }

        self.accum_bytes -= len;
        self.cur_qsize_bytes -= len;
        self.queue.pop_front()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn len_bytes(&self) -> usize {
        self.cur_qsize_bytes
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.cur_qsize_bytes = 0;
        self.idle();
    }

    fn ready_in(&self) -> Option<Duration> {
        let len = self.queue.front()?.len();
        let missing = len.saturating_sub(self.accum_bytes);
        if missing == 0 {
            return None;
        }

        let nanos = (missing as u128 * 1_000_000_000).div_ceil(self.rate_bytes_per_sec as u128);
        Some(Duration::from_nanos(nanos as u64))
    }
}

#[cfg(test)]
mod t {
    use std::time::Duration;

    use super::TokenBucket;
    use crate::scheduler::InnerQueue;
    use crate::t::{init, pkt};

    #[test]
    fn paces_head_packet() {
        init();
        let (clk, mock) = quanta::Clock::mock();
        // 1 MB/s: 1000 bytes take 1ms.
        let mut q = TokenBucket::new(clk, 1_000_000, 3_000, 100_000);
        for i in 0..3 {
            q.enqueue(pkt(i, 1000)).unwrap();
        }

        // the idle allowance covers one packet.
        assert_eq!(q.dequeue().unwrap().dport(), 0);
        assert!(q.dequeue().is_none(), "second packet must wait for tokens");
        assert_eq!(q.len(), 2);

        let wait = q.ready_in().unwrap();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(1));

        mock.increment(Duration::from_millis(1));
        assert_eq!(q.dequeue().unwrap().dport(), 1);
        assert!(q.dequeue().is_none());
        mock.increment(Duration::from_millis(1));
        assert_eq!(q.dequeue().unwrap().dport(), 2);
        assert!(q.is_empty());
        assert_eq!(q.ready_in(), None);
    }

    #[test]
    fn oversize_packet_refused() {
        init();
        let (clk, mock) = quanta::Clock::mock();
        let mut q = TokenBucket::new(clk, 1_000_000, 1500, 100_000);
        let p = q.enqueue(pkt(1, 2000)).unwrap_err();
        assert_eq!(p.dport(), 1);
        assert!(q.is_empty());
        assert_eq!(q.len_bytes(), 0);

        q.enqueue(pkt(2, 1000)).unwrap();
        mock.increment(Duration::from_millis(100));
        assert_eq!(q.dequeue().unwrap().dport(), 2);
    }

    #[test]
    fn limit_and_reset() {
        init();
        let (clk, _mock) = quanta::Clock::mock();
        let mut q = TokenBucket::new(clk, 1_000, 0, 1_500);
        q.enqueue(pkt(1, 1000)).unwrap();
        assert!(q.enqueue(pkt(2, 1000)).is_err());
        q.reset();
        assert!(q.is_empty());
        assert_eq!(q.len_bytes(), 0);
        q.enqueue(pkt(3, 1000)).unwrap();
        assert_eq!(q.dequeue().unwrap().dport(), 3);
    }
}
