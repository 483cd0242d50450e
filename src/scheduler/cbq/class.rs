//! A single CBQ class: WRR allotment, EWMA idle estimator, and the inner queue.

use std::time::Duration;

use quanta::Instant;

use crate::scheduler::{Fifo, InnerQueue};
use crate::time::{after, nanos, tdiff};
use crate::{Error, Pkt};

/// Number of priority bands. Band 0 is served first.
pub const MAX_PRIORITY: usize = 8;

/// Levels are strictly below this; a toplevel cutoff of `MAX_LEVEL` disables the cutoff.
pub const MAX_LEVEL: u8 = 8;

pub const DEFAULT_FILTER_LOG: u8 = 5;

/// Gaps longer than this between two sends reset the average to `max_idle`.
const IDLE_RESET_NANOS: i64 = 1 << 33;

/// Handle to a class in a [`super::ClassTree`].
///
/// Slots are reused after a class is pruned, but with a new generation, so a stale handle
/// never resolves to the new occupant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId {
    index: u32,
    generation: u32,
}

impl ClassId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for ClassId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// Length to transmit-time lookup for one rate.
///
/// Cell `i` holds the time to send `(i + 1) << cell_log` bytes. Lengths past the last cell use
/// the last cell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateTable {
    cell_log: u8,
    cells: Vec<i64>,
}

impl RateTable {
    const CELLS: usize = 256;

    /// Build a table for `rate_bytes_per_sec`, with cells fine enough that `mtu` fits.
    pub fn from_rate(rate_bytes_per_sec: u64, mtu: u32) -> Result<Self, Error> {
        if rate_bytes_per_sec == 0 {
            return Err(Error::InvalidClass("rate must be positive".to_owned()));
        }

        let mut cell_log = 0u8;
        while (mtu >> cell_log) as usize >= Self::CELLS {
            cell_log += 1;
        }

        let cells = (0..Self::CELLS)
            .map(|i| {
                let bytes = ((i + 1) as u128) << cell_log;
                (bytes * 1_000_000_000 / rate_bytes_per_sec as u128) as i64
            })
            .collect();
        Ok(Self { cell_log, cells })
    }

    /// Use a precomputed table.
    pub fn from_cells(cell_log: u8, cells: Vec<Duration>) -> Result<Self, Error> {
        if cells.is_empty() || cells.len() > Self::CELLS {
            return Err(Error::InvalidClass(format!(
                "rate table needs 1 to {} cells, got {}",
                Self::CELLS,
                cells.len()
            )));
        }

        if cell_log >= 32 {
            return Err(Error::InvalidClass(format!("cell_log {} too large", cell_log)));
        }

        Ok(Self {
            cell_log,
            cells: cells.into_iter().map(nanos).collect(),
        })
    }

    pub fn cell_log(&self) -> u8 {
        self.cell_log
    }

    /// Nanoseconds needed to send `len` bytes.
    pub fn transmit_time(&self, len: usize) -> i64 {
        let idx = (len >> self.cell_log).min(self.cells.len() - 1);
        self.cells[idx]
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub packets: u64,
    pub bytes: u64,
    pub borrows: u64,
    pub overlimits: u64,
    pub drops: u64,
}

/// Parameters for a new class.
///
/// ```
/// # use cbq::scheduler::cbq::{ClassSpec, RateTable};
/// let spec = ClassSpec::new(1, 100)
///     .rate(RateTable::from_rate(125_000, 1500).unwrap())
///     .filter_log(4)
///     .bounded();
/// ```
pub struct ClassSpec {
    pub(super) priority: u8,
    pub(super) relative_quantum: u32,
    pub(super) filter_log: u8,
    pub(super) max_idle: Option<Duration>,
    pub(super) min_idle: Duration,
    pub(super) extra_delay: Duration,
    pub(super) rate: Option<RateTable>,
    pub(super) bounded: bool,
    pub(super) inner_queue: Option<Box<dyn InnerQueue>>,
}

impl std::fmt::Debug for ClassSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("ClassSpec")
            .field("priority", &self.priority)
            .field("relative_quantum", &self.relative_quantum)
            .field("filter_log", &self.filter_log)
            .field("rate", &self.rate.is_some())
            .field("bounded", &self.bounded)
            .finish_non_exhaustive()
    }
}

impl ClassSpec {
    pub fn new(priority: u8, relative_quantum: u32) -> Self {
        Self {
            priority,
            relative_quantum,
            filter_log: DEFAULT_FILTER_LOG,
            max_idle: None,
            min_idle: Duration::from_secs(1),
            extra_delay: Duration::ZERO,
            rate: None,
            bounded: false,
            inner_queue: None,
        }
    }

    /// EWMA smoothing constant: weight `2^-filter_log`.
    pub fn filter_log(mut self, filter_log: u8) -> Self {
        self.filter_log = filter_log;
        self
    }

    /// Upper bound on the (scaled) average idle time, i.e. the burst allowance.
    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    /// How far below zero the (scaled) average idle time may go.
    pub fn min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Extra time added to `undertime` whenever the class goes over limit.
    pub fn extra_delay(mut self, extra_delay: Duration) -> Self {
        self.extra_delay = extra_delay;
        self
    }

    /// Rate limit this class. Without a rate table the class is never over limit.
    pub fn rate(mut self, rate: RateTable) -> Self {
        self.rate = Some(rate);
        self
    }

    /// Never borrow from the parent.
    pub fn bounded(mut self) -> Self {
        self.bounded = true;
        self
    }

    pub fn inner_queue(mut self, q: Box<dyn InnerQueue>) -> Self {
        self.inner_queue = Some(q);
        self
    }
}

pub struct ClassNode {
    pub(super) id: ClassId,
    pub(super) priority: u8,
    pub(super) level: u8,
    pub(super) quantum: i64,
    pub(super) relative_quantum: u32,
    pub(super) deficit: i64,

    pub(super) filter_log: u8,
    // scaled by 2^filter_log
    pub(super) avg_idle: i64,
    pub(super) min_idle: i64,
    pub(super) max_idle: i64,
    pub(super) extra_delay: i64,
    pub(super) rate: Option<RateTable>,
    // None: under limit regardless of time.
    pub(super) undertime: Option<Instant>,
    pub(super) last_update_time: Instant,

    pub(super) parent: Option<ClassId>,
    pub(super) borrow_target: Option<ClassId>,
    pub(super) children: Vec<ClassId>,

    pub(super) inner_queue: Box<dyn InnerQueue>,
    pub(super) next_alive: Option<ClassId>,
    pub(super) is_active: bool,

    pub(super) stats: ClassStats,
}

impl std::fmt::Debug for ClassNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("ClassNode")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("level", &self.level)
            .field("quantum", &self.quantum)
            .field("deficit", &self.deficit)
            .field("avg_idle", &self.avg_idle)
            .field("undertime", &self.undertime)
            .field("parent", &self.parent)
            .field("borrow_target", &self.borrow_target)
            .field("queue_len", &self.inner_queue.len())
            .field("is_active", &self.is_active)
            .finish_non_exhaustive()
    }
}

impl ClassNode {
    pub(super) fn new(
        id: ClassId,
        parent: Option<ClassId>,
        spec: ClassSpec,
        mtu: u32,
        now: Instant,
    ) -> Self {
        let ClassSpec {
            priority,
            relative_quantum,
            filter_log,
            max_idle,
            min_idle,
            extra_delay,
            rate,
            bounded,
            inner_queue,
        } = spec;

        let max_idle = match (max_idle, &rate) {
            (Some(m), _) => nanos(m),
            (None, Some(r)) => r
                .transmit_time(mtu as usize)
                .saturating_mul(1i64 << filter_log),
            (None, None) => 0,
        };

        Self {
            id,
            priority,
            level: 0,
            quantum: 0,
            relative_quantum,
            deficit: 0,
            filter_log,
            avg_idle: max_idle,
            min_idle: -nanos(min_idle),
            max_idle,
            extra_delay: nanos(extra_delay),
            rate,
            undertime: None,
            last_update_time: now,
            parent,
            borrow_target: if bounded { None } else { parent },
            children: Vec::new(),
            inner_queue: inner_queue
                .unwrap_or_else(|| Box::new(Fifo::new(100 * mtu as usize))),
            next_alive: None,
            is_active: false,
            stats: Default::default(),
        }
    }

    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn quantum(&self) -> i64 {
        self.quantum
    }

    pub fn relative_quantum(&self) -> u32 {
        self.relative_quantum
    }

    pub fn deficit(&self) -> i64 {
        self.deficit
    }

    pub fn avg_idle(&self) -> i64 {
        self.avg_idle
    }

    pub fn undertime(&self) -> Option<Instant> {
        self.undertime
    }

    pub fn parent(&self) -> Option<ClassId> {
        self.parent
    }

    pub fn borrow_target(&self) -> Option<ClassId> {
        self.borrow_target
    }

    pub fn children(&self) -> &[ClassId] {
        &self.children
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn queue_len(&self) -> usize {
        self.inner_queue.len()
    }

    pub fn queue_len_bytes(&self) -> usize {
        self.inner_queue.len_bytes()
    }

    pub fn stats(&self) -> &ClassStats {
        &self.stats
    }

    pub fn enqueue(&mut self, p: Pkt) -> Result<(), Error> {
        self.inner_queue.enqueue(p).map_err(|p| {
            self.stats.drops += 1;
            Error::QueueFull(p)
        })
    }

    pub fn dequeue_one(&mut self) -> Option<Pkt> {
        self.inner_queue.dequeue()
    }

    pub fn is_under_limit(&self, now: Instant) -> bool {
        match self.undertime {
            None => true,
            Some(t) => now >= t,
        }
    }

    /// Nanoseconds this class's rate needs to send `len` bytes; zero when unlimited.
    pub fn transmit_time(&self, len: usize) -> i64 {
        self.rate.as_ref().map_or(0, |r| r.transmit_time(len))
    }

    /// Account a `len`-byte packet sent by this class or a descendant, and run the idle
    /// estimator. `link_tx` is the time the link itself needs for the packet.
    pub fn record_send(&mut self, now: Instant, len: usize, link_tx: i64) {
        self.stats.packets += 1;
        self.stats.bytes += len as u64;

        let gap = tdiff(now, self.last_update_time);
        if gap > 0 {
            self.last_update_time = now;
        }

        if self.rate.is_none() {
            return;
        }

        let tx = self.transmit_time(len);
        let mut avg = self.avg_idle;
        if gap > IDLE_RESET_NANOS {
            avg = self.max_idle;
        } else {
            let idle = gap - tx;
            avg = avg.saturating_add(idle - (avg >> self.filter_log));
        }

        if avg <= 0 {
            avg = avg.max(self.min_idle);
            self.avg_idle = avg;

            // the class may send again once the true average climbs back to zero:
            // (1 - W) * -avg, plus the time its own rate needs for this packet beyond what the
            // link already spent on it.
            let mut delay = (-avg) - ((-avg) >> self.filter_log);
            delay += tx - link_tx;
            delay += self.extra_delay;
            self.undertime = Some(after(now, delay));
        } else {
            self.undertime = None;
            self.avg_idle = avg.min(self.max_idle);
        }
    }

    pub(super) fn reset(&mut self, now: Instant) {
        self.inner_queue.reset();
        self.next_alive = None;
        self.is_active = false;
        self.undertime = None;
        self.avg_idle = self.max_idle;
        self.deficit = self.quantum;
        self.last_update_time = now;
    }
}

#[cfg(test)]
mod t {
    use std::time::Duration;

    use super::{ClassId, ClassNode, ClassSpec, RateTable};
    use crate::t::{init, pkt};
    use crate::time::TimeSource;
    use crate::Error;

    #[test]
    fn rate_table_cells() {
        init();
        // 1 MB/s, 1500 byte mtu: 1500 >> 3 = 187 fits in 256 cells.
        let r = RateTable::from_rate(1_000_000, 1500).unwrap();
        assert_eq!(r.cell_log(), 3);
        // 1000 >> 3 = 125 -> 126 cells of 8 bytes = 1008 bytes = 1.008ms
        assert_eq!(r.transmit_time(1000), 1_008_000);
        assert_eq!(r.transmit_time(0), 8_000);
        // past the table: clamp to the last cell.
        assert_eq!(r.transmit_time(1 << 20), 256 * 8 * 1_000);

        assert!(RateTable::from_rate(0, 1500).is_err());
        assert!(RateTable::from_cells(0, vec![]).is_err());
        let c = RateTable::from_cells(0, vec![Duration::from_nanos(7); 4]).unwrap();
        assert_eq!(c.transmit_time(100), 7);
    }

    fn limited(clk: &quanta::Clock, max_idle: Duration) -> ClassNode {
        let spec = ClassSpec::new(0, 1)
            .rate(RateTable::from_rate(1_000_000, 1500).unwrap())
            .max_idle(max_idle);
        ClassNode::new(ClassId::new(0, 0), None, spec, 1500, TimeSource::now(clk))
    }

    #[test]
    fn enqueue_full() {
        init();
        let (clk, _mock) = quanta::Clock::mock();
        let spec = ClassSpec::new(0, 1).inner_queue(Box::new(crate::scheduler::Fifo::new(1500)));
        let mut c = ClassNode::new(ClassId::new(0, 0), None, spec, 1500, TimeSource::now(&clk));
        c.enqueue(pkt(1, 1000)).unwrap();
        assert!(matches!(c.enqueue(pkt(2, 1000)), Err(Error::QueueFull(p)) if p.dport() == 2));
        assert_eq!(c.stats().drops, 1);
        assert_eq!(c.dequeue_one().unwrap().dport(), 1);
        assert!(c.dequeue_one().is_none());
    }

    #[test]
    fn sending_faster_than_rate_lowers_avg_idle() {
        init();
        let (clk, mock) = quanta::Clock::mock();
        let mut c = limited(&clk, Duration::from_millis(2));
        let mut prev = c.avg_idle();

        // 1000 bytes every 0.5ms against a 1.008ms transmit time.
        for _ in 0..10 {
            mock.increment(Duration::from_micros(500));
            let now = TimeSource::now(&clk);
            c.record_send(now, 1000, 0);
            assert!(c.avg_idle() < prev, "avg_idle must drop while over rate");
            prev = c.avg_idle();
            if let Some(u) = c.undertime() {
                assert!(u >= now);
            }
        }

        assert!(c.avg_idle() < 0);
        let now = TimeSource::now(&clk);
        assert!(c.undertime().unwrap() > now);
        assert!(!c.is_under_limit(now));
        assert_eq!(c.stats().packets, 10);
        assert_eq!(c.stats().bytes, 10_000);
    }

    #[test]
    fn idle_raises_avg_idle_up_to_max() {
        init();
        let (clk, mock) = quanta::Clock::mock();
        let mut c = limited(&clk, Duration::from_millis(2));
        for _ in 0..10 {
            mock.increment(Duration::from_micros(100));
            c.record_send(TimeSource::now(&clk), 1000, 0);
        }
        assert!(c.avg_idle() < 0);

        let mut prev = c.avg_idle();
        loop {
            mock.increment(Duration::from_millis(5));
            c.record_send(TimeSource::now(&clk), 1000, 0);
            if c.avg_idle() == 2_000_000 {
                break;
            }

            assert!(c.avg_idle() > prev, "avg_idle must rise while idle");
            prev = c.avg_idle();
        }

        assert!(c.undertime().is_none());
        assert!(c.is_under_limit(TimeSource::now(&clk)));
    }

    #[test]
    fn min_idle_clamp_and_extra_delay() {
        init();
        let (clk, _mock) = quanta::Clock::mock();
        let spec = ClassSpec::new(0, 1)
            .rate(RateTable::from_rate(1_000_000, 1500).unwrap())
            .max_idle(Duration::ZERO)
            .min_idle(Duration::from_micros(100))
            .extra_delay(Duration::from_millis(1))
            .filter_log(0);
        let now = TimeSource::now(&clk);
        let mut c = ClassNode::new(ClassId::new(0, 0), None, spec, 1500, now);

        c.record_send(now, 1000, 8_000);
        // -1.008ms clamped to -100us
        assert_eq!(c.avg_idle(), -100_000);
        // filter_log 0: (1 - 1) * 100us + 1.008ms - 8us + 1ms
        assert_eq!(
            crate::time::tdiff(c.undertime().unwrap(), now),
            1_008_000 - 8_000 + 1_000_000
        );
    }

    #[test]
    fn undertime_adds_own_transmit_time() {
        init();
        let (clk, _mock) = quanta::Clock::mock();
        let now = TimeSource::now(&clk);
        let mut c = limited(&clk, Duration::ZERO);

        // unlimited link: nothing of the 1.008ms was spent on the wire yet.
        c.record_send(now, 1000, 0);
        assert_eq!(c.avg_idle(), -1_008_000);
        let wait = crate::time::tdiff(c.undertime().unwrap(), now);
        assert_eq!(wait, (1_008_000 - (1_008_000 >> 5)) + 1_008_000);
        assert!(!c.is_under_limit(now));

        // link as slow as the class: only the averaging term is left.
        let mut c = limited(&clk, Duration::ZERO);
        c.record_send(now, 1000, 1_008_000);
        let wait = crate::time::tdiff(c.undertime().unwrap(), now);
        assert_eq!(wait, 1_008_000 - (1_008_000 >> 5));
    }

    #[test]
    fn default_max_idle_saturates() {
        init();
        let (clk, mock) = quanta::Clock::mock();
        // 1 B/s: an mtu takes ~1500s, far past i64 nanos once scaled by 2^31.
        let spec = ClassSpec::new(0, 1)
            .rate(RateTable::from_rate(1, 1500).unwrap())
            .filter_log(31);
        let mut c = ClassNode::new(ClassId::new(0, 0), None, spec, 1500, TimeSource::now(&clk));
        assert_eq!(c.avg_idle(), i64::MAX);

        mock.increment(Duration::from_secs(1));
        c.record_send(TimeSource::now(&clk), 1, 0);
        assert!(c.avg_idle() > 0);
        assert!(c.undertime().is_none());
    }

    #[test]
    fn unlimited_class_never_throttles() {
        init();
        let (clk, _mock) = quanta::Clock::mock();
        let now = TimeSource::now(&clk);
        let mut c = ClassNode::new(ClassId::new(0, 0), None, ClassSpec::new(0, 1), 1500, now);
        for _ in 0..100 {
            c.record_send(now, 1500, 0);
        }

        assert!(c.undertime().is_none());
        assert!(c.is_under_limit(now));
        assert_eq!(c.stats().packets, 100);
    }

    #[test]
    fn long_idle_resets_to_max() {
        init();
        let (clk, mock) = quanta::Clock::mock();
        let mut c = limited(&clk, Duration::from_millis(2));
        for _ in 0..20 {
            c.record_send(TimeSource::now(&clk), 1000, 0);
        }
        assert!(c.avg_idle() < 0);

        mock.increment(Duration::from_secs(10));
        c.record_send(TimeSource::now(&clk), 1000, 0);
        assert_eq!(c.avg_idle(), 2_000_000);
        assert!(c.undertime().is_none());
    }
}
