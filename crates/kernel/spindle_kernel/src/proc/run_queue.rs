use arrayvec::ArrayVec;
use spindle_kernel_params::NTHREAD;

use super::ThreadId;

/// FIFO of ready threads in one priority band.
#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    threads: ArrayVec<ThreadId, NTHREAD>,
}

impl RunQueue {
    pub(crate) fn push_back(&mut self, tid: ThreadId) {
        self.threads.push(tid);
    }

    pub(crate) fn pop_front(&mut self) -> Option<ThreadId> {
        (!self.threads.is_empty()).then(|| self.threads.remove(0))
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> ThreadId {
        self.threads.remove(index)
    }

    /// Moves all threads of `other` behind ours.
    pub(crate) fn append(&mut self, other: &mut Self) {
        for tid in other.threads.drain(..) {
            self.threads.push(tid);
        }
    }

    pub(crate) fn iter(&self) -> impl DoubleEndedIterator<Item = ThreadId> + ExactSizeIterator {
        self.threads.iter().copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(n: u32) -> ThreadId {
        ThreadId::from_raw(u64::from(n))
    }

    #[test]
    fn fifo_order() {
        let mut rq = RunQueue::default();
        rq.push_back(tid(1));
        rq.push_back(tid(2));
        rq.push_back(tid(3));
        assert_eq!(rq.pop_front(), Some(tid(1)));
        assert_eq!(rq.remove_at(1), tid(3));
        assert_eq!(rq.pop_front(), Some(tid(2)));
        assert_eq!(rq.pop_front(), None);
    }

    #[test]
    fn append_keeps_order_and_empties_source() {
        let mut a = RunQueue::default();
        let mut b = RunQueue::default();
        a.push_back(tid(1));
        b.push_back(tid(2));
        b.push_back(tid(3));
        a.append(&mut b);
        assert!(b.is_empty());
        assert_eq!(a.len(), 3);
        assert!(a.iter().eq([tid(1), tid(2), tid(3)]));
    }
}
