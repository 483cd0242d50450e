//! Drive a [`Qdisc`] from a dedicated thread.

use std::time::Duration;

use color_eyre::eyre::{eyre, Report, WrapErr};
use flume::{RecvTimeoutError, TryRecvError};
use quanta::Instant;
use tracing::{debug, info, trace};

use crate::{Pkt, Qdisc};

/// Longest a paced link may bank tokens for.
const MAX_BURST_BYTES: isize = 16 * 1500;

/// How long to sleep when the qdisc is throttled but gives no wakeup time.
const IDLE_POLL: Duration = Duration::from_micros(100);

struct Rate {
    epoch_start: Instant,
    bytes: usize,
}

/// Token accumulator for an output rate.
struct Pacer {
    rate_bytes_per_sec: usize,
    tokens: isize,
    last: Instant,
}

impl Pacer {
    fn new(rate_bytes_per_sec: usize, now: Instant) -> Self {
        Self {
            rate_bytes_per_sec: rate_bytes_per_sec.max(1),
            tokens: 0,
            last: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let el = now.saturating_duration_since(self.last);
        let earned = (el.as_secs_f64() * self.rate_bytes_per_sec as f64) as isize;
        if earned > 0 {
            self.tokens = (self.tokens + earned).min(MAX_BURST_BYTES);
            self.last = now;
        }
    }

    /// We're not active, so get rid of any token backlog to avoid bursting.
    fn idle(&mut self, now: Instant) {
        self.tokens = 0;
        self.last = now;
    }

    fn wait(&self) -> Option<Duration> {
        if self.tokens > 0 {
            return None;
        }

        let missing = (1 - self.tokens) as f64;
        Some(Duration::from_secs_f64(
            missing / self.rate_bytes_per_sec as f64,
        ))
    }
}

/// An output link: packets sent to the input channel are enqueued into the qdisc, and whatever
/// the qdisc releases is forwarded to `out`, optionally paced at a fixed byte rate.
///
/// `clock` must be the clock the qdisc reads, since [`Qdisc::next_wakeup`] is compared against
/// it.
pub struct Link<Q> {
    qdisc: Q,
    clock: quanta::Clock,
    tx_rate_bytes_per_sec: Option<usize>,
    out: flume::Sender<Pkt>,
}

impl<Q: Qdisc + Send + 'static> Link<Q> {
    pub fn new(qdisc: Q, clock: quanta::Clock, out: flume::Sender<Pkt>) -> Self {
        Self {
            qdisc,
            clock,
            tx_rate_bytes_per_sec: None,
            out,
        }
    }

    pub fn with_pacing(mut self, tx_rate_bytes_per_sec: usize) -> Self {
        self.tx_rate_bytes_per_sec = Some(tx_rate_bytes_per_sec);
        self
    }

    /// Spawn the link thread.
    ///
    /// Dropping every clone of the returned sender stops the link once the qdisc drains; the
    /// qdisc is then handed back through the join handle.
    pub fn start(
        self,
    ) -> (
        flume::Sender<Pkt>,
        std::thread::JoinHandle<Result<Q, Report>>,
    ) {
        let (s, r) = flume::unbounded();
        let jh = std::thread::spawn(move || self.run(r));
        (s, jh)
    }

    fn enqueue(&mut self, p: Pkt) {
        if let Err(e) = self.qdisc.enqueue(p) {
            debug!(err = %e, "enq error");
        }
    }

    #[tracing::instrument(level = "info", skip(self, r), err)]
    fn run(mut self, r: flume::Receiver<Pkt>) -> Result<Q, Report> {
        info!(tx_rate_bytes_per_sec = ?self.tx_rate_bytes_per_sec, "starting link");
        let mut pacer = self
            .tx_rate_bytes_per_sec
            .map(|rate| Pacer::new(rate, self.clock.now()));
        let mut achieved_tx_rate: Option<Rate> = None;
        let mut input_open = true;

        loop {
            while input_open {
                match r.try_recv() {
                    Ok(p) => self.enqueue(p),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => input_open = false,
                }
            }

            if self.qdisc.is_empty() {
                if let Some(p) = &mut pacer {
                    p.idle(self.clock.now());
                }
                achieved_tx_rate = None;

                if !input_open {
                    break;
                }

                match r.recv() {
                    Ok(p) => self.enqueue(p),
                    Err(_) => input_open = false,
                }

                continue;
            }

            if let Some(p) = &mut pacer {
                p.refill(self.clock.now());
                if let Some(wait) = p.wait() {
                    self.sleep(&r, &mut input_open, wait);
                    continue;
                }
            }

            let p = match self.qdisc.dequeue() {
                Some(p) => p,
                None => {
                    let wait = self
                        .qdisc
                        .next_wakeup()
                        .map(|t| t.saturating_duration_since(self.clock.now()))
                        .unwrap_or(IDLE_POLL);
                    trace!(?wait, qlen = self.qdisc.len_packets(), "qdisc throttled");
                    self.sleep(&r, &mut input_open, wait);
                    continue;
                }
            };

            let len = p.len();
            if let Some(pacer) = &mut pacer {
                pacer.tokens -= len as isize;
            }

            match &mut achieved_tx_rate {
                None => {
                    achieved_tx_rate = Some(Rate {
                        epoch_start: self.clock.now(),
                        bytes: len,
                    });
                }
                Some(Rate { bytes, epoch_start }) => {
                    *bytes += len;
                    let el = self.clock.now().saturating_duration_since(*epoch_start);
                    if el > Duration::from_millis(100) {
                        let epoch_rate_bytes_per_sec = *bytes as f64 / el.as_secs_f64();
                        let achieved_rate_mbps = epoch_rate_bytes_per_sec * 8. / 1e6;
                        info!(?achieved_rate_mbps, ?el, "achieved_tx_rate");
                        achieved_tx_rate = None;
                        self.qdisc.dbg(el);
                    }
                }
            }

            trace!(src = ?p.hdr().source, dst = ?p.hdr().destination, ?len, "forwarding packet");
            self.out
                .send(p)
                .map_err(|_| eyre!("output receiver dropped"))
                .wrap_err("forwarding packet")?;
        }

        info!("input closed and qdisc drained, stopping link");
        Ok(self.qdisc)
    }

    /// Wait up to `d`, waking early if a packet arrives.
    fn sleep(&mut self, r: &flume::Receiver<Pkt>, input_open: &mut bool, d: Duration) {
        if !*input_open {
            std::thread::sleep(d);
            return;
        }

        match r.recv_timeout(d) {
            Ok(p) => self.enqueue(p),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => *input_open = false,
        }
    }
}

#[cfg(test)]
mod t {
    use std::time::Duration;

    use super::Link;
    use crate::scheduler::cbq::{ClassSpec, RateTable};
    use crate::scheduler::classify::Match;
    use crate::scheduler::{CbqScheduler, Qdisc, RuleClassifier};
    use crate::t::{init, pkt};

    #[test]
    fn forwards_everything_then_returns_qdisc() {
        init();
        let clk = quanta::Clock::new();
        let mut sch = CbqScheduler::new(clk.clone(), 1500);
        let root = sch.attach_class(None, ClassSpec::new(7, 1)).unwrap();
        let a = sch.attach_class(Some(root), ClassSpec::new(0, 1)).unwrap();
        let b = sch.attach_class(Some(root), ClassSpec::new(1, 1)).unwrap();
        sch.set_classifier(RuleClassifier::new().with_rule(Match::Dport(1), a));
        sch.set_fallback_class(b).unwrap();

        let (out_s, out_r) = flume::unbounded();
        let (s, jh) = Link::new(sch, clk, out_s).start();
        for i in 0..20 {
            s.send(pkt(i % 2, 500)).unwrap();
        }
        drop(s);

        let sch = jh.join().unwrap().unwrap();
        let got: Vec<_> = out_r.try_iter().collect();
        assert_eq!(got.len(), 20);
        assert!(sch.is_empty());
        assert_eq!(sch.stats().dequeued, 20);
        assert_eq!(sch.class(a).unwrap().stats().packets, 10);
    }

    #[test]
    fn pacing_spreads_packets() {
        init();
        let clk = quanta::Clock::new();
        let mut sch = CbqScheduler::new(clk.clone(), 1500);
        let root = sch.attach_class(None, ClassSpec::new(7, 1)).unwrap();
        sch.set_fallback_class(root).unwrap();

        let (out_s, out_r) = flume::unbounded();
        let start = clk.now();
        let (s, jh) = Link::new(sch, clk.clone(), out_s)
            .with_pacing(1_000_000)
            .start();
        for i in 0..10 {
            s.send(pkt(i, 1000)).unwrap();
        }
        drop(s);

        jh.join().unwrap().unwrap();
        // 10 kB at 1 MB/s
        assert!(clk.now().saturating_duration_since(start) >= Duration::from_millis(5));
        assert_eq!(out_r.try_iter().count(), 10);
    }

    #[test]
    fn throttled_class_drains_via_watchdog() {
        init();
        let clk = quanta::Clock::new();
        let mut sch = CbqScheduler::new(clk.clone(), 1500);
        let root = sch.attach_class(None, ClassSpec::new(7, 1)).unwrap();
        let x = sch
            .attach_class(
                Some(root),
                ClassSpec::new(0, 1)
                    .rate(RateTable::from_rate(1_000_000, 1500).unwrap())
                    .max_idle(Duration::ZERO)
                    .bounded(),
            )
            .unwrap();
        sch.set_fallback_class(x).unwrap();
        for i in 0..5 {
            sch.enqueue(pkt(i, 1000)).unwrap();
        }

        let (out_s, out_r) = flume::unbounded();
        let (s, jh) = Link::new(sch, clk, out_s).start();
        drop(s);

        let sch = jh.join().unwrap().unwrap();
        let ports: Vec<_> = out_r.try_iter().map(|p| p.dport()).collect();
        assert_eq!(ports, vec![0, 1, 2, 3, 4]);
        assert!(sch.watchdog().arms() > 0);
    }
}
