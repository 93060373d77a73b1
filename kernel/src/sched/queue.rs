//! Per-core run queues

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use spin::Mutex;

use crate::process::Process;

struct Inner {
    q: VecDeque<Arc<Process>>,
    nproc: usize,
}

/// FIFO queue of runnable processes. Each core owns exactly one; enqueue
/// and dequeue take the queue's own lock, which is what makes an enqueue
/// on core C observable by C's next tick.
pub struct RunQueue {
    inner: Mutex<Inner>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                q: VecDeque::new(),
                nproc: 0,
            }),
        }
    }

    /// Append a runnable process.
    pub fn enqueue(&self, proc: Arc<Process>) {
        let mut inner = self.inner.lock();
        inner.q.push_back(proc);
        inner.nproc += 1;
    }

    /// Take the next runnable process, if any.
    pub fn dequeue(&self) -> Option<Arc<Process>> {
        let mut inner = self.inner.lock();
        let proc = inner.q.pop_front()?;
        inner.nproc -= 1;
        Some(proc)
    }

    /// Number of queued processes.
    pub fn nproc(&self) -> usize {
        self.inner.lock().nproc
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::process::Process;

    #[test]
    fn enqueue_then_dequeue_is_noop_on_nproc() {
        let q = RunQueue::new();
        let before = q.nproc();

        let proc = Process::for_tests(1);
        q.enqueue(proc.clone());
        assert_eq!(q.nproc(), before + 1);

        let got = q.dequeue().expect("just-enqueued process must come back");
        assert_eq!(got.pid(), proc.pid());
        assert_eq!(q.nproc(), before, "enqueue/dequeue pair leaves nproc unchanged");
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = RunQueue::new();
        for pid in [10u64, 11, 12] {
            q.enqueue(Process::for_tests(pid));
        }
        assert_eq!(q.dequeue().unwrap().pid(), 10);
        assert_eq!(q.dequeue().unwrap().pid(), 11);
        assert_eq!(q.dequeue().unwrap().pid(), 12);
        assert!(q.dequeue().is_none());
    }
}
