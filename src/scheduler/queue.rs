//! Per-node task queue - multi-producer/multi-consumer, priority-aware.
//!
//! One queue per NUMA node, with a lock-free lane per priority; the High
//! lane is always drained before Default. Workers block on the queue's
//! semaphore when every queue in the system is empty.

use crate::scheduler::task::{NodeId, SchedulePriority, Task};
use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counting semaphore with a close signal for shutdown
struct Signal {
    inner: Mutex<SignalInner>,
    condvar: Condvar,
}

struct SignalInner {
    permits: usize,
    closed: bool,
}

impl Signal {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SignalInner { permits: 0, closed: false }),
            condvar: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut inner = self.inner.lock();
        inner.permits += 1;
        drop(inner);
        self.condvar.notify_one();
    }

    /// Wait for a permit. Returns false on timeout or when closed.
    fn wait(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return false;
            }
            if inner.permits > 0 {
                inner.permits -= 1;
                return true;
            }
            if self.condvar.wait_for(&mut inner, timeout).timed_out() {
                return false;
            }
        }
    }

    fn close(&self) {
        self.inner.lock().closed = true;
        self.condvar.notify_all();
    }
}

/// Work queue for one topology node
pub struct NodeQueue {
    node_id: NodeId,

    high: SegQueue<Arc<Task>>,
    default_lane: SegQueue<Arc<Task>>,

    /// Approximate depth, for load-based queue selection
    len: AtomicUsize,

    signal: Signal,

    pushed: AtomicUsize,
    stolen: AtomicUsize,
}

impl NodeQueue {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            high: SegQueue::new(),
            default_lane: SegQueue::new(),
            len: AtomicUsize::new(0),
            signal: Signal::new(),
            pushed: AtomicUsize::new(0),
            stolen: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn push(&self, task: Arc<Task>, priority: SchedulePriority) {
        match priority {
            SchedulePriority::High => self.high.push(task),
            SchedulePriority::Default => self.default_lane.push(task),
        }
        self.len.fetch_add(1, Ordering::Relaxed);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.signal.post();
    }

    /// Take the next task, High lane first
    pub fn try_pop(&self) -> Option<Arc<Task>> {
        let task = self.high.pop().or_else(|| self.default_lane.pop());
        if task.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        task
    }

    /// Take a task on behalf of another node's worker.
    ///
    /// Tasks flagged non-stealable go back to their lane and the attempt
    /// reports empty-handed.
    pub fn try_steal(&self) -> Option<Arc<Task>> {
        let task = self.try_pop()?;
        if task.is_stealable() {
            self.stolen.fetch_add(1, Ordering::Relaxed);
            Some(task)
        } else {
            let priority = task.priority();
            self.push(task, priority);
            None
        }
    }

    /// Block until work may be available. Returns false on timeout or
    /// shutdown.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        self.signal.wait(timeout)
    }

    /// Wake every blocked worker; used at shutdown
    pub fn close(&self) {
        self.signal.close();
    }

    /// Approximate number of queued tasks
    #[inline]
    pub fn approx_len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.default_lane.is_empty()
    }

    /// Get statistics: (pushed, stolen)
    #[cold]
    pub fn stats(&self) -> (usize, usize) {
        (
            self.pushed.load(Ordering::Relaxed),
            self.stolen.load(Ordering::Relaxed),
        )
    }
}
