//! Immediate scheduler - synchronous execution on the caller's thread.
//!
//! No queues, no workers: scheduling a ready task runs it (and its
//! transitively ready successors) before returning. Used by tests and
//! tools that want deterministic, single-threaded execution behind the
//! same interface as the real scheduler.

use crate::scheduler::task::{run_task, NodeId, SchedulePriority, Task, TaskState};
use crate::scheduler::Scheduler;
use std::sync::Arc;

pub struct ImmediateScheduler;

impl ImmediateScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ImmediateScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ImmediateScheduler {
    fn schedule(
        &self,
        task: Arc<Task>,
        _preferred_node: Option<NodeId>,
        priority: SchedulePriority,
    ) {
        task.set_priority(priority);
        if !task.try_set_state(TaskState::Created, TaskState::Scheduled) {
            // Double-schedule is a no-op
            return;
        }
        if task.is_ready() && task.try_set_state(TaskState::Scheduled, TaskState::Ready) {
            // Drain the ready closure depth-first
            let mut pending = vec![task];
            while let Some(next) = pending.pop() {
                pending.extend(run_task(&next));
            }
        }
    }

    fn wait_for_tasks(&self, tasks: &[Arc<Task>]) {
        // Everything runnable ran inside schedule(); anything left is
        // waiting on a predecessor scheduled by another thread
        while !tasks.iter().all(|task| task.is_done()) {
            std::thread::yield_now();
        }
    }

    fn wait_for_all_tasks(&self) {}

    fn finish(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_ready_task_runs_synchronously() {
        let scheduler = ImmediateScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let task = Task::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.schedule(task.clone(), None, SchedulePriority::Default);
        assert!(task.is_done());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_schedule_is_noop() {
        let scheduler = ImmediateScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let task = Task::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.schedule(task.clone(), None, SchedulePriority::Default);
        scheduler.schedule(task, None, SchedulePriority::Default);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_out_of_order_chain_completes() {
        let scheduler = ImmediateScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));

        let make = |expected: u32, counter: Arc<AtomicU32>| {
            Task::new(move || {
                let swapped = counter.compare_exchange(
                    expected,
                    expected + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                assert!(swapped.is_ok());
            })
        };
        let t1 = make(0, counter.clone());
        let t2 = make(1, counter.clone());
        let t3 = make(2, counter.clone());
        t1.set_as_predecessor_of(&t2);
        t2.set_as_predecessor_of(&t3);

        // Scheduling the tail first parks it until its chain resolves
        scheduler.schedule(t3.clone(), None, SchedulePriority::Default);
        assert!(!t3.is_done());
        scheduler.schedule(t1, None, SchedulePriority::Default);
        scheduler.schedule(t2.clone(), None, SchedulePriority::Default);

        scheduler.wait_for_tasks(&[t2, t3]);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
