use super::InnerQueue;
use crate::Pkt;
use std::collections::VecDeque;
use tracing::trace;

/// Drop-tail FIFO bounded in bytes. The default inner queue of a CBQ class.
#[derive(Debug)]
pub struct Fifo {
    limit_bytes: usize,
    cur_qsize_bytes: usize,
    inner: VecDeque<Pkt>,
}

impl Fifo {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            limit_bytes,
            cur_qsize_bytes: 0,
            inner: Default::default(),
        }
    }
}

impl InnerQueue for Fifo {
    fn enqueue(&mut self, p: Pkt) -> Result<(), Pkt> {
        let new_qsize_bytes = self.cur_qsize_bytes + p.len();
        if new_qsize_bytes > self.limit_bytes {
            trace!(len = p.len(), limit = self.limit_bytes, "fifo full");
            return Err(p);
        }

        self.cur_qsize_bytes = new_qsize_bytes;
        self.inner.push_back(p);
        trace!(pkts=?self.inner.len(), "queue size");
        Ok(())
    }

    fn dequeue(&mut self) -> Option<Pkt> {
        let p = self.inner.pop_front()?;
        self.cur_qsize_bytes -= p.len();
        Some(p)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn len_bytes(&self) -> usize {
        self.cur_qsize_bytes
    }

    fn reset(&mut self) {
        self.inner.clear();
        self.cur_qsize_bytes = 0;
    }
}
