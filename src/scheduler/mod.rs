//! # NUMA-Aware Task Scheduler
//!
//! Work-stealing execution of directed acyclic task graphs:
//!
//! - **Tasks** wrap a payload callable plus DAG wiring; a task runs once
//!   every predecessor has completed
//! - **Queues**: one multi-priority MPMC queue per NUMA node
//! - **Workers**: one OS thread per core, bound to its node; peers steal
//!   in a fixed rotation when their local queue runs dry
//! - **Eager chaining**: a finished task's ready successor runs inline on
//!   the same worker, keeping operator pipelines off the queues
//! - **Cooperative waits**: a worker blocked in `wait_for_tasks` keeps
//!   draining queues, so nested task graphs make progress even on a
//!   single-worker topology
//!
//! ## Usage
//!
//! ```rust
//! use basalt::scheduler::{NodeQueueScheduler, Scheduler, SchedulePriority, Task, Topology};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! let scheduler = NodeQueueScheduler::new(Topology::fake(1, 2));
//! scheduler.begin();
//!
//! let counter = Arc::new(AtomicU32::new(0));
//! let c = counter.clone();
//! let first = Task::new(move || { c.fetch_add(1, Ordering::SeqCst); });
//! let c = counter.clone();
//! let second = Task::new(move || { c.fetch_add(1, Ordering::SeqCst); });
//! first.set_as_predecessor_of(&second);
//!
//! scheduler.schedule(second.clone(), None, SchedulePriority::Default);
//! scheduler.schedule(first, None, SchedulePriority::Default);
//! scheduler.wait_for_tasks(&[second]);
//! assert_eq!(counter.load(Ordering::SeqCst), 2);
//!
//! scheduler.finish();
//! ```

pub mod immediate;
pub mod node_queue;
pub mod queue;
pub mod task;
pub mod topology;
mod worker;

pub use immediate::ImmediateScheduler;
pub use node_queue::{NodeQueueScheduler, SchedulerStatsSnapshot};
pub use queue::NodeQueue;
pub use task::{NodeId, SchedulePriority, Task, TaskId, TaskState};
pub use topology::{Topology, TopologyNode};

use std::sync::Arc;

/// Common interface of the immediate and node-queue schedulers
pub trait Scheduler: Send + Sync {
    /// Start workers (no-op for synchronous implementations)
    fn begin(&self) {}

    /// Hand a task to the scheduler. Runs immediately once every
    /// predecessor completed; scheduling twice is a no-op.
    fn schedule(
        &self,
        task: Arc<Task>,
        preferred_node: Option<NodeId>,
        priority: SchedulePriority,
    );

    /// Schedule a batch, keeping each task's own priority and node hints
    fn schedule_tasks(&self, tasks: &[Arc<Task>]) {
        for task in tasks {
            self.schedule(task.clone(), task.preferred_node(), task.priority());
        }
    }

    /// Schedule a batch and block until every task in it completed.
    /// Implementations may group the batch to cap its parallelism.
    fn schedule_and_wait(&self, tasks: Vec<Arc<Task>>) {
        self.schedule_tasks(&tasks);
        self.wait_for_tasks(&tasks);
    }

    /// Block until the given tasks are all Done. Safe to call from inside
    /// a task: a waiting worker keeps executing other work meanwhile.
    fn wait_for_tasks(&self, tasks: &[Arc<Task>]);

    /// Block until no scheduled task remains unfinished
    fn wait_for_all_tasks(&self);

    /// Drain in-flight work and stop workers; no task is aborted
    fn finish(&self);
}
