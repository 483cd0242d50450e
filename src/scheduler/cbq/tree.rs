use quanta::Instant;
use tracing::{debug, warn};

use super::class::{ClassId, ClassNode, ClassSpec, MAX_LEVEL, MAX_PRIORITY};
use crate::Error;

macro_rules! ensure_valid {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err(Error::InvalidClass(format!($($arg)+)));
        }
    };
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<ClassNode>,
}

/// Arena of classes.
///
/// Parent and child links, borrow targets, and band rings all refer to classes by [`ClassId`].
/// A class's level is one more than its highest child's, and leaves are level 0.
#[derive(Debug)]
pub struct ClassTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: Option<ClassId>,
    fallback: Option<ClassId>,
    members: [Vec<ClassId>; MAX_PRIORITY],
    // sum of relative quanta per priority
    quanta: [u64; MAX_PRIORITY],
    mtu: u32,
}

impl ClassTree {
    pub fn new(mtu: u32) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: None,
            fallback: None,
            members: Default::default(),
            quanta: [0; MAX_PRIORITY],
            mtu,
        }
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn root(&self) -> Option<ClassId> {
        self.root
    }

    pub fn fallback(&self) -> Option<ClassId> {
        self.fallback
    }

    pub fn set_fallback(&mut self, id: ClassId) -> Result<(), Error> {
        if !self.contains(id) {
            return Err(Error::NotFound(id));
        }

        self.fallback = Some(id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ClassId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: ClassId) -> Option<&ClassNode> {
        self.slots
            .get(id.index())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.node.as_ref())
    }

    pub fn get_mut(&mut self, id: ClassId) -> Option<&mut ClassNode> {
        self.slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.node.as_mut())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassNode> {
        self.slots.iter().filter_map(|s| s.node.as_ref())
    }

    pub(super) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClassNode> {
        self.slots.iter_mut().filter_map(|s| s.node.as_mut())
    }

    /// Classes at `priority`, in attach order.
    pub fn members(&self, priority: u8) -> &[ClassId] {
        self.members
            .get(priority as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of ancestors of `id`.
    pub fn depth(&self, id: ClassId) -> usize {
        let mut d = 0;
        let mut cur = self.get(id).and_then(ClassNode::parent);
        while let Some(c) = cur {
            d += 1;
            cur = self[c].parent;
        }

        d
    }

    /// Add a class under `parent`, or the root if `parent` is `None`.
    pub fn attach(
        &mut self,
        parent: Option<ClassId>,
        spec: ClassSpec,
        now: Instant,
    ) -> Result<ClassId, Error> {
        ensure_valid!(
            (spec.priority as usize) < MAX_PRIORITY,
            "priority {} out of range [0, {})",
            spec.priority,
            MAX_PRIORITY
        );
        ensure_valid!(
            spec.relative_quantum > 0,
            "relative quantum must be positive"
        );
        ensure_valid!(
            spec.filter_log < 32,
            "filter_log {} too large",
            spec.filter_log
        );

        match parent {
            None => ensure_valid!(self.root.is_none(), "tree already has a root"),
            Some(p) => {
                ensure_valid!(self.contains(p), "parent class {} not found", p);
                ensure_valid!(
                    self.depth(p) + 1 < MAX_LEVEL as usize,
                    "class tree deeper than {} levels",
                    MAX_LEVEL
                );
            }
        }

        let id = match self.free.pop() {
            Some(index) => ClassId::new(index, self.slots[index as usize].generation),
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                ClassId::new((self.slots.len() - 1) as u32, 0)
            }
        };

        let prio = spec.priority as usize;
        let rq = spec.relative_quantum;
        let node = ClassNode::new(id, parent, spec, self.mtu, now);
        self.slots[id.index()].node = Some(node);

        match parent {
            Some(p) => self[p].children.push(id),
            None => self.root = Some(id),
        }

        self.members[prio].push(id);
        self.quanta[prio] += rq as u64;
        self.normalize_quanta(prio);
        self[id].deficit = self[id].quantum;
        self.adjust_levels(id);

        debug!(?id, ?parent, priority = prio, "attached class");
        Ok(id)
    }

    /// Remove a childless class that is not linked into a band ring, and hand back its node.
    pub fn prune(&mut self, id: ClassId) -> Result<ClassNode, Error> {
        let node = self.get(id).ok_or(Error::NotFound(id))?;
        if !node.children.is_empty() {
            return Err(Error::ClassBusy(id));
        }

        ensure_valid!(!node.is_active, "class {} is still linked in its band", id);

        let prio = node.priority as usize;
        let rq = node.relative_quantum;
        let parent = node.parent;

        self.members[prio].retain(|&c| c != id);
        self.quanta[prio] -= rq as u64;
        self.normalize_quanta(prio);

        if let Some(p) = parent {
            self[p].children.retain(|&c| c != id);
            self.recompute_levels(p);
        }

        if self.root == Some(id) {
            self.root = None;
        }

        if self.fallback == Some(id) {
            self.fallback = None;
        }

        let slot = &mut self.slots[id.index()];
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        let mut node = slot.node.take().ok_or(Error::NotFound(id))?;
        node.parent = None;
        node.borrow_target = None;

        debug!(?id, "pruned class");
        Ok(node)
    }

    /// Recompute the quantum of every class at `prio` from its share of the band's relative
    /// quanta, scaled so the average quantum is one MTU.
    fn normalize_quanta(&mut self, prio: usize) {
        let total = self.quanta[prio] as u128;
        if total == 0 {
            return;
        }

        let n = self.members[prio].len() as u128;
        let mtu = self.mtu as i64;
        for i in 0..self.members[prio].len() {
            let id = self.members[prio][i];
            let node = &mut self[id];
            let q = node.relative_quantum as u128 * mtu as u128 * n / total;
            let mut q = q.min(i64::MAX as u128) as i64;
            if q <= 0 || q > 32 * mtu {
                warn!(?id, quantum = q, "bad quantum, repairing");
                q = mtu / 2 + 1;
            }

            node.quantum = q;
        }
    }

    /// Walk up from a newly attached class, raising ancestor levels until one is already high
    /// enough.
    fn adjust_levels(&mut self, id: ClassId) {
        let mut child_level = self[id].level;
        let mut cur = self[id].parent;
        while let Some(a) = cur {
            if self[a].level > child_level {
                break;
            }

            self[a].level = child_level + 1;
            child_level = self[a].level;
            cur = self[a].parent;
        }
    }

    /// After a child is removed, levels may only drop.
    fn recompute_levels(&mut self, from: ClassId) {
        let mut cur = Some(from);
        while let Some(c) = cur {
            let level = self[c]
                .children
                .iter()
                .map(|&ch| self[ch].level + 1)
                .max()
                .unwrap_or(0);
            if self[c].level == level {
                break;
            }

            self[c].level = level;
            cur = self[c].parent;
        }
    }
}

impl std::ops::Index<ClassId> for ClassTree {
    type Output = ClassNode;

    fn index(&self, id: ClassId) -> &ClassNode {
        match self.get(id) {
            Some(n) => n,
            None => panic!("stale class id {}", id),
        }
    }
}

impl std::ops::IndexMut<ClassId> for ClassTree {
    fn index_mut(&mut self, id: ClassId) -> &mut ClassNode {
        match self.get_mut(id) {
            Some(n) => n,
            None => panic!("stale class id {}", id),
        }
    }
}

#[cfg(test)]
mod t {
    use super::ClassTree;
    use crate::scheduler::cbq::{ClassSpec, MAX_LEVEL};
    use crate::t::init;
    use crate::time::TimeSource;
    use crate::Error;

    fn now() -> quanta::Instant {
        let (clk, _mock) = quanta::Clock::mock();
        TimeSource::now(&clk)
    }

    #[test]
    fn quanta_average_one_mtu() {
        init();
        let mut t = ClassTree::new(1500);
        let root = t.attach(None, ClassSpec::new(7, 1), now()).unwrap();
        let a = t.attach(Some(root), ClassSpec::new(1, 1), now()).unwrap();
        let b = t.attach(Some(root), ClassSpec::new(1, 3), now()).unwrap();

        assert_eq!(t[a].quantum(), 750);
        assert_eq!(t[b].quantum(), 2250);
        // alone in its band
        assert_eq!(t[root].quantum(), 1500);
        assert_eq!(t[a].deficit(), t[a].quantum());
    }

    #[test]
    fn attach_then_prune_restores_quanta() {
        init();
        let mut t = ClassTree::new(1500);
        let root = t.attach(None, ClassSpec::new(7, 1), now()).unwrap();
        let a = t.attach(Some(root), ClassSpec::new(1, 1), now()).unwrap();
        let b = t.attach(Some(root), ClassSpec::new(1, 3), now()).unwrap();
        let before = (t[a].quantum(), t[b].quantum());

        let c = t.attach(Some(root), ClassSpec::new(1, 4), now()).unwrap();
        assert_eq!(t[a].quantum(), 562);
        assert_eq!(t[b].quantum(), 1687);
        assert_eq!(t[c].quantum(), 2250);

        t.prune(c).unwrap();
        assert_eq!((t[a].quantum(), t[b].quantum()), before);
        assert_eq!(t.members(1), &[a, b]);
    }

    #[test]
    fn out_of_range_quantum_is_repaired() {
        init();
        let mut t = ClassTree::new(1500);
        let root = t.attach(None, ClassSpec::new(7, 1), now()).unwrap();
        let a = t.attach(Some(root), ClassSpec::new(0, 1), now()).unwrap();
        let b = t
            .attach(Some(root), ClassSpec::new(0, 1_000_000), now())
            .unwrap();

        // a rounds down to 0.
        assert_eq!(t[a].quantum(), 751);
        assert_eq!(t[b].quantum(), 2999);
    }

    #[test]
    fn levels() {
        init();
        let mut t = ClassTree::new(1500);
        let root = t.attach(None, ClassSpec::new(7, 1), now()).unwrap();
        assert_eq!(t[root].level(), 0);
        let mid = t.attach(Some(root), ClassSpec::new(1, 1), now()).unwrap();
        let leaf = t.attach(Some(mid), ClassSpec::new(1, 1), now()).unwrap();
        let leaf2 = t.attach(Some(root), ClassSpec::new(1, 1), now()).unwrap();

        assert_eq!(t[leaf].level(), 0);
        assert_eq!(t[leaf2].level(), 0);
        assert_eq!(t[mid].level(), 1);
        assert_eq!(t[root].level(), 2);
        assert_eq!(t.depth(leaf), 2);

        t.prune(leaf).unwrap();
        assert_eq!(t[mid].level(), 0);
        assert_eq!(t[root].level(), 1);
    }

    #[test]
    fn validation() {
        init();
        let mut t = ClassTree::new(1500);
        assert!(matches!(
            t.attach(None, ClassSpec::new(8, 1), now()),
            Err(Error::InvalidClass(_))
        ));
        assert!(matches!(
            t.attach(None, ClassSpec::new(0, 0), now()),
            Err(Error::InvalidClass(_))
        ));

        let root = t.attach(None, ClassSpec::new(7, 1), now()).unwrap();
        assert!(matches!(
            t.attach(None, ClassSpec::new(7, 1), now()),
            Err(Error::InvalidClass(_))
        ));

        let mut cur = root;
        for _ in 1..MAX_LEVEL {
            cur = t.attach(Some(cur), ClassSpec::new(0, 1), now()).unwrap();
        }
        assert_eq!(t[root].level(), MAX_LEVEL - 1);
        assert!(matches!(
            t.attach(Some(cur), ClassSpec::new(0, 1), now()),
            Err(Error::InvalidClass(_))
        ));
    }

    #[test]
    fn stale_ids() {
        init();
        let mut t = ClassTree::new(1500);
        let root = t.attach(None, ClassSpec::new(7, 1), now()).unwrap();
        let a = t.attach(Some(root), ClassSpec::new(0, 1), now()).unwrap();

        assert!(matches!(t.prune(root), Err(Error::ClassBusy(id)) if id == root));
        t.set_fallback(a).unwrap();
        t.prune(a).unwrap();
        assert_eq!(t.fallback(), None);
        assert!(t.get(a).is_none());
        assert!(matches!(t.prune(a), Err(Error::NotFound(id)) if id == a));

        let b = t.attach(Some(root), ClassSpec::new(0, 1), now()).unwrap();
        assert_eq!(b.index(), a.index());
        assert_ne!(b, a);
        assert!(t.get(a).is_none());
        assert!(t.contains(b));
        assert!(matches!(
            t.attach(Some(a), ClassSpec::new(0, 1), now()),
            Err(Error::InvalidClass(_))
        ));
        assert_eq!(t.len(), 2);
    }
}
