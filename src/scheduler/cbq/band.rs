//! Per-priority ring of backlogged classes, served by weighted round robin.

use super::{ClassId, ClassTree, Pass};
use crate::time::nanos;
use crate::Pkt;

/// A circular singly linked list through [`super::ClassNode::next_alive`].
///
/// Only the tail is stored. Service resumes at the tail's successor, and newly woken classes are
/// inserted as the new tail, i.e. at the end of the current round.
#[derive(Debug, Default)]
pub struct PriorityBand {
    tail: Option<ClassId>,
}

enum Visit {
    Sent(Pkt, ClassId),
    Drained,
    Skip,
    Replenished,
}

impl PriorityBand {
    pub fn is_empty(&self) -> bool {
        self.tail.is_none()
    }

    /// The ring, starting from the class that would be served next.
    pub fn members(&self, tree: &ClassTree) -> Vec<ClassId> {
        let mut v = Vec::new();
        let tail = match self.tail {
            Some(t) => t,
            None => return v,
        };

        let mut cur = tree[tail].next_alive;
        while let Some(c) = cur {
            v.push(c);
            if c == tail {
                break;
            }

            cur = tree[c].next_alive;
        }

        v
    }

    /// Link a newly backlogged class, with a full quantum.
    pub(super) fn wake(&mut self, tree: &mut ClassTree, id: ClassId) {
        match self.tail {
            None => tree[id].next_alive = Some(id),
            Some(tail) => {
                tree[id].next_alive = tree[tail].next_alive;
                tree[tail].next_alive = Some(id);
            }
        }

        self.tail = Some(id);
        let node = &mut tree[id];
        node.is_active = true;
        node.deficit = node.quantum;
    }

    /// Remove `id` from the ring. Returns whether it was linked.
    pub(super) fn unlink(&mut self, tree: &mut ClassTree, id: ClassId) -> bool {
        let tail = match self.tail {
            Some(t) => t,
            None => return false,
        };

        let mut prev = tail;
        loop {
            match tree[prev].next_alive {
                Some(c) if c == id => {
                    self.unlink_after(tree, prev, id);
                    return true;
                }
                Some(c) if c != tail => prev = c,
                _ => return false,
            }
        }
    }

    pub(super) fn clear(&mut self) {
        self.tail = None;
    }

    fn unlink_after(&mut self, tree: &mut ClassTree, prev: ClassId, cur: ClassId) {
        if prev == cur {
            self.tail = None;
        } else {
            tree[prev].next_alive = tree[cur].next_alive;
            if self.tail == Some(cur) {
                self.tail = Some(prev);
            }
        }

        let node = &mut tree[cur];
        node.next_alive = None;
        node.is_active = false;
    }

    /// One scheduling attempt on this band.
    ///
    /// Returns the packet with the class that sent it and the class it was charged to. Classes
    /// found empty are unlinked on the way.
    pub(super) fn dequeue_round(
        &mut self,
        tree: &mut ClassTree,
        pass: &mut Pass,
    ) -> Option<(Pkt, ClassId, ClassId)> {
        let mut prev = self.tail?;
        loop {
            let mut replenished = false;
            loop {
                let tail = self.tail?;
                let cur = tree[prev].next_alive?;
                let last = cur == tail;

                match visit(tree, cur, pass) {
                    Visit::Sent(p, lender) => {
                        let node = &tree[cur];
                        if node.inner_queue.is_empty() {
                            self.unlink_after(tree, prev, cur);
                            if self.tail.is_some() {
                                self.tail = Some(prev);
                            }
                        } else if node.deficit <= 0 {
                            self.tail = Some(cur);
                        } else {
                            // keep serving cur next time
                            self.tail = Some(prev);
                        }

                        return Some((p, cur, lender));
                    }
                    Visit::Drained => {
                        self.unlink_after(tree, prev, cur);
                        if self.tail.is_none() {
                            return None;
                        }
                    }
                    Visit::Replenished => {
                        replenished = true;
                        prev = cur;
                    }
                    Visit::Skip => prev = cur,
                }

                if last {
                    break;
                }
            }

            if !replenished {
                break;
            }
        }

        self.tail = Some(prev);
        None
    }
}

fn visit(tree: &mut ClassTree, id: ClassId, pass: &mut Pass) -> Visit {
    if tree[id].inner_queue.is_empty() {
        return Visit::Drained;
    }

    if pass.fallback && tree[id].borrow_target.is_none() {
        return Visit::Skip;
    }

    let lender = match pass.lender(tree, id) {
        Some(l) => l,
        None => return Visit::Skip,
    };

    let node = &mut tree[id];
    if node.deficit <= 0 {
        node.deficit += node.quantum;
        if node.deficit <= 0 {
            return Visit::Replenished;
        }
    }

    match node.inner_queue.dequeue() {
        Some(p) => {
            node.deficit -= p.len() as i64;
            Visit::Sent(p, lender)
        }
        None => {
            if let Some(d) = node.inner_queue.ready_in() {
                pass.wake_in(nanos(d));
            }

            Visit::Skip
        }
    }
}
