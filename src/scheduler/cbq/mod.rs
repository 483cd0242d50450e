//! Class-Based Queueing.
//!
//! Each dequeue:
//! 1. Charges the packet sent by the previous dequeue to the sender and its ancestors, which
//!    runs their idle estimators.
//! 2. Serves priority bands in order. Within a band, classes are served by weighted round robin,
//!    and a class only sends if it or an ancestor it may borrow from is under limit.
//! 3. If nothing could be sent, retries with the borrow cutoff (`toplevel`) lifted. In this
//!    pass every class with a borrow target may send even if its whole borrow chain is over
//!    limit, and is charged to its parent. Classes that cannot borrow at all are skipped.
//! 4. If packets remain but nothing is eligible, arms the watchdog for the earliest time a class
//!    becomes eligible again.

use std::time::Duration;

use quanta::Instant;
use tracing::{debug, info, trace};

use super::{Classifier, Qdisc, RuleClassifier};
use crate::time::{tdiff, TimeSource};
use crate::{Error, Pkt};

mod band;
mod class;
mod tree;
mod watchdog;

pub use band::PriorityBand;
pub use class::{
    ClassId, ClassNode, ClassSpec, ClassStats, RateTable, DEFAULT_FILTER_LOG, MAX_LEVEL,
    MAX_PRIORITY,
};
pub use tree::ClassTree;
pub use watchdog::Watchdog;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Nothing queued.
    Idle,
    /// Packets queued and not throttled.
    Scheduling,
    /// Packets queued but every backlogged class is throttled until the watchdog fires.
    Overlimit,
    Destroyed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedStats {
    pub enqueued: u64,
    pub dequeued: u64,
    /// Packets refused at enqueue: full class queue or no class.
    pub rejected: u64,
    /// Packets discarded after being queued, by `prune_class` or `reset`.
    pub dropped: u64,
    /// Dequeues that found packets but could send none of them.
    pub overlimits: u64,
}

/// Last packet handed out, not yet charged to the estimators.
#[derive(Clone, Copy, Debug)]
struct PendingUpdate {
    sender: ClassId,
    lender: ClassId,
    len: usize,
}

/// Per-dequeue scratch state.
#[derive(Debug)]
struct Pass {
    now: Instant,
    toplevel: u8,
    // second pass: skip classes that can never borrow
    fallback: bool,
    // earliest eligibility seen, in ticks from now
    wd_expires: Option<i64>,
}

impl Pass {
    fn wake_in(&mut self, ticks: i64) {
        let t = ticks.max(1);
        self.wd_expires = Some(self.wd_expires.map_or(t, |w| w.min(t)));
    }

    /// The class `id` would be charged against if it sent now: itself if under limit, else the
    /// nearest ancestor on its borrow chain that is, not above `toplevel`. In the fallback pass a
    /// class whose chain is over limit all the way up is charged to its borrow target.
    fn lender(&mut self, tree: &mut ClassTree, id: ClassId) -> Option<ClassId> {
        if tree[id].is_under_limit(self.now) {
            return Some(id);
        }

        let mut cl = id;
        loop {
            let b = match tree[cl].borrow_target {
                Some(b) => b,
                None => {
                    self.overlimit(tree, id);
                    if self.fallback {
                        return tree[id].borrow_target;
                    }

                    return None;
                }
            };

            if tree[b].level > self.toplevel {
                return None;
            }

            if tree[b].is_under_limit(self.now) {
                return Some(b);
            }

            cl = b;
        }
    }

    fn overlimit(&mut self, tree: &mut ClassTree, id: ClassId) {
        let now = self.now;
        let node = &mut tree[id];
        if !self.fallback {
            node.stats.overlimits += 1;
        }

        let delay = node.undertime.map_or(1, |u| tdiff(u, now));
        self.wake_in(delay);

        if self.toplevel == MAX_LEVEL {
            // the class may also become eligible through an ancestor.
            let mut b = tree[id].borrow_target;
            while let Some(c) = b {
                if let Some(u) = tree[c].undertime {
                    self.wake_in(tdiff(u, now));
                }

                b = tree[c].borrow_target;
            }
        }
    }
}

/// A CBQ scheduler.
///
/// Not reentrant: all calls must be serialized by the owner.
pub struct CbqScheduler<T: TimeSource = quanta::Clock> {
    clock: T,
    tree: ClassTree,
    bands: [PriorityBand; MAX_PRIORITY],
    // bit p set iff bands[p] is non-empty
    active_mask: u8,
    toplevel: u8,
    pending: Option<PendingUpdate>,
    watchdog: Watchdog,
    classifier: Box<dyn Classifier>,
    qlen: usize,
    qbytes: usize,
    stats: SchedStats,
    destroyed: bool,
}

impl<T: TimeSource> std::fmt::Debug for CbqScheduler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("CbqScheduler")
            .field("classes", &self.tree.len())
            .field("active_mask", &format_args!("{:#010b}", self.active_mask))
            .field("toplevel", &self.toplevel)
            .field("qlen", &self.qlen)
            .field("qbytes", &self.qbytes)
            .field("watchdog", &self.watchdog)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl<T: TimeSource> CbqScheduler<T> {
    /// An empty scheduler for a link with the given MTU. Attach a root class before enqueueing.
    pub fn new(clock: T, mtu: u32) -> Self {
        Self {
            clock,
            tree: ClassTree::new(mtu),
            bands: Default::default(),
            active_mask: 0,
            toplevel: MAX_LEVEL,
            pending: None,
            watchdog: Default::default(),
            classifier: Box::new(RuleClassifier::new()),
            qlen: 0,
            qbytes: 0,
            stats: Default::default(),
            destroyed: false,
        }
    }

    pub fn with_classifier(mut self, c: impl Classifier + 'static) -> Self {
        self.set_classifier(c);
        self
    }

    pub fn set_classifier(&mut self, c: impl Classifier + 'static) {
        self.classifier = Box::new(c);
    }

    pub fn mtu(&self) -> u32 {
        self.tree.mtu()
    }

    pub fn attach_class(
        &mut self,
        parent: Option<ClassId>,
        spec: ClassSpec,
    ) -> Result<ClassId, Error> {
        let now = self.clock.now();
        self.tree.attach(parent, spec, now)
    }

    /// Remove a childless class, dropping anything still queued in it.
    pub fn prune_class(&mut self, id: ClassId) -> Result<(), Error> {
        let node = self.tree.get(id).ok_or(Error::NotFound(id))?;
        if !node.children.is_empty() {
            return Err(Error::ClassBusy(id));
        }

        let prio = node.priority as usize;
        if node.is_active {
            self.bands[prio].unlink(&mut self.tree, id);
            if self.bands[prio].is_empty() {
                self.active_mask &= !(1 << prio);
            }
        }

        let node = &mut self.tree[id];
        let dropped = node.inner_queue.len();
        let dropped_bytes = node.inner_queue.len_bytes();
        node.inner_queue.reset();
        node.stats.drops += dropped as u64;
        self.qlen -= dropped;
        self.qbytes -= dropped_bytes;
        self.stats.dropped += dropped as u64;

        if let Some(tx) = self.pending {
            if tx.sender == id {
                self.pending = None;
            } else if tx.lender == id {
                self.pending = Some(PendingUpdate {
                    lender: tx.sender,
                    ..tx
                });
            }
        }

        self.tree.prune(id)?;
        if dropped > 0 {
            debug!(?id, ?dropped, "dropped queued packets of pruned class");
        }

        Ok(())
    }

    /// Class for packets the classifier does not map to an existing class.
    pub fn set_fallback_class(&mut self, id: ClassId) -> Result<(), Error> {
        self.tree.set_fallback(id)
    }

    pub fn class(&self, id: ClassId) -> Option<&ClassNode> {
        self.tree.get(id)
    }

    pub fn tree(&self) -> &ClassTree {
        &self.tree
    }

    pub fn band(&self, priority: u8) -> Option<&PriorityBand> {
        self.bands.get(priority as usize)
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Highest level a class may currently borrow from.
    pub fn toplevel(&self) -> u8 {
        self.toplevel
    }

    pub fn stats(&self) -> &SchedStats {
        &self.stats
    }

    pub fn state(&self) -> State {
        if self.destroyed {
            State::Destroyed
        } else if self.qlen == 0 {
            State::Idle
        } else if self.watchdog.is_armed() {
            State::Overlimit
        } else {
            State::Scheduling
        }
    }

    /// Lower `toplevel` to the level of the first under-limit class on `id`'s borrow chain.
    fn mark_toplevel(&mut self, id: ClassId, now: Instant) {
        let toplevel = self.toplevel;
        if toplevel <= self.tree[id].level {
            return;
        }

        let mut cur = Some(id);
        while let Some(c) = cur {
            let n = &self.tree[c];
            if n.level >= toplevel {
                return;
            }

            if n.is_under_limit(now) {
                self.toplevel = n.level;
                return;
            }

            cur = n.borrow_target;
        }
    }

    /// Charge the last sent packet to the sender and all its ancestors.
    fn update(&mut self, now: Instant, tx: PendingUpdate) {
        let link_tx = self
            .tree
            .root()
            .and_then(|r| self.tree.get(r))
            .map_or(0, |r| r.transmit_time(tx.len));

        let mut cur = Some(tx.sender);
        while let Some(id) = cur {
            let node = match self.tree.get_mut(id) {
                Some(n) => n,
                None => break,
            };

            node.record_send(now, tx.len, link_tx);
            cur = node.parent;
        }

        let (sender, lender) = match (self.tree.get(tx.sender), self.tree.get(tx.lender)) {
            (Some(s), Some(l)) => (s, l),
            _ => return,
        };

        if self.toplevel < lender.level {
            return;
        }

        if !sender.inner_queue.is_empty() {
            let mut b = Some(tx.lender);
            while let Some(id) = b {
                let n = &self.tree[id];
                if n.undertime.is_none() {
                    self.toplevel = n.level;
                    return;
                }

                b = n.borrow_target;
            }
        }

        self.toplevel = MAX_LEVEL;
    }

    fn dequeue_pass(&mut self, pass: &mut Pass) -> Option<(Pkt, ClassId, ClassId)> {
        for prio in 0..MAX_PRIORITY {
            if self.active_mask & (1 << prio) == 0 {
                continue;
            }

            let sent = self.bands[prio].dequeue_round(&mut self.tree, pass);
            if self.bands[prio].is_empty() {
                self.active_mask &= !(1 << prio);
            }

            if sent.is_some() {
                return sent;
            }
        }

        None
    }
}

impl<T: TimeSource> Qdisc for CbqScheduler<T> {
    fn enqueue(&mut self, p: Pkt) -> Result<(), Error> {
        if self.destroyed {
            return Err(Error::Destroyed(p));
        }

        let id = match self
            .classifier
            .classify(&p)
            .filter(|&c| self.tree.contains(c))
            .or_else(|| self.tree.fallback())
        {
            Some(c) => c,
            None => {
                self.stats.rejected += 1;
                return Err(Error::Unclassified(p));
            }
        };

        let len = p.len();
        if let Err(e) = self.tree[id].enqueue(p) {
            self.stats.rejected += 1;
            return Err(e);
        }

        self.qlen += 1;
        self.qbytes += len;
        self.stats.enqueued += 1;

        let now = self.clock.now();
        self.mark_toplevel(id, now);
        if !self.tree[id].is_active {
            let prio = self.tree[id].priority as usize;
            self.bands[prio].wake(&mut self.tree, id);
            self.active_mask |= 1 << prio;
            trace!(?id, ?prio, "class became backlogged");
        }

        Ok(())
    }

    fn dequeue(&mut self) -> Option<Pkt> {
        if self.destroyed {
            return None;
        }

        let now = self.clock.now();
        if let Some(tx) = self.pending.take() {
            self.update(now, tx);
        }

        self.watchdog.disarm();
        if self.qlen == 0 {
            return None;
        }

        let mut pass = Pass {
            now,
            toplevel: self.toplevel,
            fallback: false,
            wd_expires: None,
        };

        for fallback in [false, true] {
            if fallback {
                pass.toplevel = MAX_LEVEL;
                pass.fallback = true;
            }

            if let Some((p, sender, lender)) = self.dequeue_pass(&mut pass) {
                self.toplevel = pass.toplevel;
                self.qlen -= 1;
                self.qbytes -= p.len();
                self.stats.dequeued += 1;
                if lender != sender {
                    self.tree[sender].stats.borrows += 1;
                    self.tree[lender].stats.borrows += 1;
                }

                trace!(?sender, ?lender, len = p.len(), "dequeue");
                self.pending = Some(PendingUpdate {
                    sender,
                    lender,
                    len: p.len(),
                });
                return Some(p);
            }
        }

        self.toplevel = pass.toplevel;
        self.stats.overlimits += 1;
        if let Some(delay) = pass.wd_expires {
            self.watchdog.arm(now, delay);
            trace!(?delay, "all backlogged classes throttled, arming watchdog");
        }

        None
    }

    fn reset(&mut self) {
        let now = self.clock.now();
        for node in self.tree.iter_mut() {
            node.reset(now);
        }

        for b in &mut self.bands {
            b.clear();
        }

        self.stats.dropped += self.qlen as u64;
        self.active_mask = 0;
        self.pending = None;
        self.watchdog.disarm();
        self.toplevel = MAX_LEVEL;
        self.qlen = 0;
        self.qbytes = 0;
    }

    fn destroy(&mut self) {
        self.reset();
        self.tree = ClassTree::new(self.tree.mtu());
        self.classifier = Box::new(RuleClassifier::new());
        self.destroyed = true;
        debug!("cbq destroyed");
    }

    fn len_packets(&self) -> usize {
        self.qlen
    }

    fn len_bytes(&self) -> usize {
        self.qbytes
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.watchdog.expires_at()
    }

    fn dbg(&mut self, epoch_dur: Duration) {
        info!(?epoch_dur, state = ?self.state(), stats = ?self.stats, "cbq");
        for node in self.tree.iter() {
            debug!(
                id = %node.id,
                level = node.level,
                qlen = node.queue_len(),
                qbytes = node.queue_len_bytes(),
                avg_idle = node.avg_idle,
                stats = ?node.stats,
                "class"
            );
        }
    }
}
