//! NodeQueue scheduler - NUMA-aware work stealing over task DAGs.
//!
//! `begin()` reads a topology and starts one worker thread per configured
//! core, each bound to its node's queue. Scheduled tasks land on the queue
//! chosen by explicit assignment, the scheduling worker's own node, or the
//! least-loaded node, in that order. `finish()` drains in-flight work and
//! joins every worker; no task is aborted.
//!
//! ## Grouping
//!
//! A large batch of independent tasks scheduled together is transformed
//! into a bounded number of linear chains (task `k` precedes task
//! `k + num_groups`), capping concurrency and queue pressure. The group
//! count shrinks under load and widens to the worker count when idle.

use crate::scheduler::queue::NodeQueue;
use crate::scheduler::task::{NodeId, SchedulePriority, Task, TaskState};
use crate::scheduler::topology::Topology;
use crate::scheduler::worker::{current_worker, process_one, worker_main, SchedulerCore, WorkerHandle};
use crate::scheduler::Scheduler;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Batches up to `worker_count * GROUP_SMALL_FACTOR` tasks skip grouping
const GROUP_SMALL_FACTOR: usize = 2;

/// Queued tasks per forfeited group under load
const GROUP_LOAD_DIVISOR: usize = 4;

/// How long external waiters park between completion checks
const WAITER_PARK: Duration = Duration::from_millis(1);

/// Point-in-time scheduler counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatsSnapshot {
    pub tasks_scheduled: u64,
    pub tasks_executed: u64,
    pub tasks_stolen: u64,
    pub tasks_chained: u64,
    pub queued: usize,
}

/// Multi-threaded, topology-aware task scheduler
pub struct NodeQueueScheduler {
    topology: Topology,
    core: Arc<SchedulerCore>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    started: AtomicBool,
    tasks_scheduled: AtomicU64,
}

impl NodeQueueScheduler {
    pub fn new(topology: Topology) -> Self {
        let queues = (0..topology.num_nodes())
            .map(|node| Arc::new(NodeQueue::new(node as NodeId)))
            .collect::<Vec<_>>();
        let core = Arc::new(SchedulerCore::new(queues, topology.total_workers()));
        Self {
            topology,
            core,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            tasks_scheduled: AtomicU64::new(0),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Number of worker threads the topology configures
    pub fn worker_count(&self) -> usize {
        self.core.worker_count
    }

    /// Load-sensitive cap on a batch's parallelism.
    ///
    /// Small batches short-circuit to the worker count; beyond that, every
    /// `GROUP_LOAD_DIVISOR` already-queued tasks forfeit one group.
    pub fn determine_group_count(&self, tasks: &[Arc<Task>]) -> usize {
        let workers = self.core.worker_count.max(1);
        if tasks.len() <= workers * GROUP_SMALL_FACTOR {
            return workers;
        }
        let load = self.core.total_queue_len();
        workers.saturating_sub(load / GROUP_LOAD_DIVISOR).clamp(1, workers)
    }

    /// Chain a large batch of independent tasks into
    /// `determine_group_count` linear pipelines.
    fn group_tasks(&self, tasks: &[Arc<Task>]) {
        let workers = self.core.worker_count.max(1);
        if tasks.len() <= workers * GROUP_SMALL_FACTOR {
            return;
        }
        // Only batches with no wiring of their own are grouped; anything
        // else already encodes the dependencies the caller wants
        let independent = tasks
            .iter()
            .all(|task| task.is_ready() && task.successors_snapshot().is_empty());
        if !independent {
            return;
        }

        let groups = self.determine_group_count(tasks);
        for index in groups..tasks.len() {
            tasks[index - groups].set_as_predecessor_of(&tasks[index]);
        }
    }

    pub fn stats(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            tasks_scheduled: self.tasks_scheduled.load(Ordering::Relaxed),
            tasks_executed: self.core.tasks_executed.load(Ordering::Relaxed),
            tasks_stolen: self.core.tasks_stolen.load(Ordering::Relaxed),
            tasks_chained: self.core.tasks_chained.load(Ordering::Relaxed),
            queued: self.core.total_queue_len(),
        }
    }

    fn cooperative_wait<F>(&self, done: F)
    where
        F: Fn() -> bool,
    {
        if let Some(worker) = current_worker() {
            if std::ptr::eq(Arc::as_ptr(&worker.core), Arc::as_ptr(&self.core)) {
                // A blocked worker keeps draining queues so dependents of
                // queued jobs can complete (single-worker liveness)
                while !done() {
                    if !process_one(&worker) {
                        std::thread::yield_now();
                    }
                }
                return;
            }
        }
        while !done() {
            self.core.wait_for_completion(WAITER_PARK);
        }
    }
}

impl Default for NodeQueueScheduler {
    fn default() -> Self {
        Self::new(Topology::detect())
    }
}

impl Scheduler for NodeQueueScheduler {
    fn begin(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock();
        for (node_id, node) in self.topology.nodes().iter().enumerate() {
            for worker_id in 0..node.num_workers {
                let handle = Arc::new(WorkerHandle {
                    core: self.core.clone(),
                    node_id: node_id as NodeId,
                    worker_id,
                });
                let join = std::thread::Builder::new()
                    .name(format!("worker-n{}-{}", node_id, worker_id))
                    .spawn(move || worker_main(handle))
                    .expect("failed to spawn scheduler worker");
                workers.push(join);
            }
        }
        tracing::info!(
            nodes = self.topology.num_nodes(),
            workers = self.core.worker_count,
            "node queue scheduler started"
        );
    }

    fn schedule(
        &self,
        task: Arc<Task>,
        preferred_node: Option<NodeId>,
        priority: SchedulePriority,
    ) {
        debug_assert!(
            self.started.load(Ordering::Acquire),
            "schedule before begin()"
        );
        task.set_priority(priority);
        if preferred_node.is_some() {
            task.set_preferred_node(preferred_node);
        }
        if !task.try_set_state(TaskState::Created, TaskState::Scheduled) {
            // Double-schedule is a no-op
            return;
        }
        self.core.active_tasks.fetch_add(1, Ordering::AcqRel);
        self.tasks_scheduled.fetch_add(1, Ordering::Relaxed);

        // Deliver now if every predecessor already finished; otherwise the
        // last completing predecessor delivers it
        if task.is_ready() && task.try_set_state(TaskState::Scheduled, TaskState::Ready) {
            self.core.enqueue(task);
        }
    }

    fn schedule_and_wait(&self, tasks: Vec<Arc<Task>>) {
        self.group_tasks(&tasks);
        self.schedule_tasks(&tasks);
        self.wait_for_tasks(&tasks);
    }

    fn wait_for_tasks(&self, tasks: &[Arc<Task>]) {
        self.cooperative_wait(|| tasks.iter().all(|task| task.is_done()));
    }

    fn wait_for_all_tasks(&self) {
        self.cooperative_wait(|| self.core.active_tasks.load(Ordering::Acquire) == 0);
    }

    fn finish(&self) {
        if !self.started.load(Ordering::Acquire) {
            return;
        }
        self.wait_for_all_tasks();

        self.core.shutdown.store(true, Ordering::Release);
        for queue in &self.core.queues {
            queue.close();
        }
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        self.started.store(false, Ordering::SeqCst);
        tracing::info!("node queue scheduler finished");
    }
}

impl Drop for NodeQueueScheduler {
    fn drop(&mut self) {
        self.finish();
    }
}
