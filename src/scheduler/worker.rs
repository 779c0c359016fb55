//! Worker - one OS thread bound to a node, executing and stealing tasks.
//!
//! The loop: pop from the local queue; on a miss, try stealing from peer
//! queues in a fixed rotation; on empty everywhere, block on the local
//! queue's semaphore. A finished task's newly-ready successors are chained
//! inline when priorities match (bounded, to keep the queues fair) and
//! enqueued otherwise - eager chaining keeps operator pipelines off the
//! queues entirely.
//!
//! A thread-local registers the running worker so cooperative waits
//! (`wait_for_tasks` from inside a task) keep draining queues instead of
//! deadlocking a single-worker scheduler.

use crate::scheduler::queue::NodeQueue;
use crate::scheduler::task::{run_task, NodeId, Task};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Successors executed inline per popped task before going back to the
/// queues, so one long pipeline cannot starve stealing peers
const INLINE_CHAIN_LIMIT: usize = 32;

/// How long an idle worker sleeps before re-checking for shutdown
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// State shared between the scheduler façade and its workers
pub(crate) struct SchedulerCore {
    pub(crate) queues: Vec<Arc<NodeQueue>>,
    pub(crate) shutdown: AtomicBool,

    /// Tasks scheduled but not yet Done
    pub(crate) active_tasks: AtomicUsize,

    /// Waiters parked in wait_for_tasks / wait_for_all_tasks
    completion_lock: Mutex<()>,
    completion: Condvar,

    pub(crate) worker_count: usize,
    round_robin: AtomicUsize,

    pub(crate) tasks_executed: AtomicU64,
    pub(crate) tasks_stolen: AtomicU64,
    pub(crate) tasks_chained: AtomicU64,
}

impl SchedulerCore {
    pub(crate) fn new(queues: Vec<Arc<NodeQueue>>, worker_count: usize) -> Self {
        Self {
            queues,
            shutdown: AtomicBool::new(false),
            active_tasks: AtomicUsize::new(0),
            completion_lock: Mutex::new(()),
            completion: Condvar::new(),
            worker_count,
            round_robin: AtomicUsize::new(0),
            tasks_executed: AtomicU64::new(0),
            tasks_stolen: AtomicU64::new(0),
            tasks_chained: AtomicU64::new(0),
        }
    }

    /// Pick the queue for a task: explicit assignment wins, then the
    /// calling worker's node, then the least-loaded queue.
    pub(crate) fn determine_queue_id(&self, preferred: Option<NodeId>) -> usize {
        if let Some(node) = preferred {
            return node as usize % self.queues.len();
        }
        if let Some(worker) = current_worker() {
            // Only workers of this scheduler inherit their node
            if std::ptr::eq(Arc::as_ptr(&worker.core), self) {
                return worker.node_id as usize;
            }
        }
        self.least_loaded_queue()
    }

    fn least_loaded_queue(&self) -> usize {
        let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        let mut best = start;
        let mut best_len = usize::MAX;
        for offset in 0..self.queues.len() {
            let idx = (start + offset) % self.queues.len();
            let len = self.queues[idx].approx_len();
            if len < best_len {
                best = idx;
                best_len = len;
            }
        }
        best
    }

    /// Deliver a Ready task to its queue
    pub(crate) fn enqueue(&self, task: Arc<Task>) {
        let queue_id = self.determine_queue_id(task.preferred_node());
        let priority = task.priority();
        self.queues[queue_id].push(task, priority);
    }

    /// Total queued tasks across all nodes (approximate)
    pub(crate) fn total_queue_len(&self) -> usize {
        self.queues.iter().map(|queue| queue.approx_len()).sum()
    }

    fn on_task_done(&self) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        self.active_tasks.fetch_sub(1, Ordering::AcqRel);
        let _guard = self.completion_lock.lock();
        self.completion.notify_all();
    }

    /// Park until woken by a completion or `timeout` elapses
    pub(crate) fn wait_for_completion(&self, timeout: Duration) {
        let mut guard = self.completion_lock.lock();
        self.completion.wait_for(&mut guard, timeout);
    }

    /// Run `task` and chain its ready successors
    pub(crate) fn execute(&self, task: Arc<Task>) {
        let mut current = task;
        let mut chained = 0;
        loop {
            let ready = run_task(&current);
            self.on_task_done();

            let mut next = None;
            for successor in ready {
                if next.is_none()
                    && chained < INLINE_CHAIN_LIMIT
                    && successor.priority() == current.priority()
                {
                    next = Some(successor);
                } else {
                    self.enqueue(successor);
                }
            }
            match next {
                Some(successor) => {
                    self.tasks_chained.fetch_add(1, Ordering::Relaxed);
                    current = successor;
                    chained += 1;
                }
                None => break,
            }
        }
    }
}

/// Identity of the worker running on this thread
pub(crate) struct WorkerHandle {
    pub(crate) core: Arc<SchedulerCore>,
    pub(crate) node_id: NodeId,
    #[allow(dead_code)]
    pub(crate) worker_id: usize,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<WorkerHandle>>> = const { RefCell::new(None) };
}

pub(crate) fn current_worker() -> Option<Arc<WorkerHandle>> {
    CURRENT_WORKER.with(|current| current.borrow().clone())
}

/// Pop-or-steal one task and execute it. Returns false when every queue
/// came up empty.
pub(crate) fn process_one(handle: &WorkerHandle) -> bool {
    let core = &handle.core;
    let local = &core.queues[handle.node_id as usize];

    let task = local.try_pop().or_else(|| steal(handle));
    match task {
        Some(task) => {
            core.execute(task);
            true
        }
        None => false,
    }
}

/// Fixed-rotation steal attempt over peer queues
fn steal(handle: &WorkerHandle) -> Option<Arc<Task>> {
    let core = &handle.core;
    let num_queues = core.queues.len();
    for offset in 1..num_queues {
        let victim = (handle.node_id as usize + offset) % num_queues;
        if let Some(task) = core.queues[victim].try_steal() {
            core.tasks_stolen.fetch_add(1, Ordering::Relaxed);
            return Some(task);
        }
    }
    None
}

/// Worker thread entry point
pub(crate) fn worker_main(handle: Arc<WorkerHandle>) {
    CURRENT_WORKER.with(|current| *current.borrow_mut() = Some(handle.clone()));

    let local = handle.core.queues[handle.node_id as usize].clone();
    loop {
        if process_one(&handle) {
            continue;
        }
        if handle.core.shutdown.load(Ordering::Acquire) {
            break;
        }
        local.wait_for_work(IDLE_WAIT);
    }

    CURRENT_WORKER.with(|current| *current.borrow_mut() = None);
}
