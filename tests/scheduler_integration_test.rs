// Scheduler Integration Tests
// End-to-end DAG execution: chains, diamonds, nested spawns, grouping,
// stealing, and cooperative single-worker progress.

use basalt::scheduler::{
    ImmediateScheduler, NodeQueueScheduler, SchedulePriority, Scheduler, Task, Topology,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn cas_task(counter: &Arc<AtomicU32>, expected: u32) -> Arc<Task> {
    let counter = counter.clone();
    Task::new(move || {
        let swapped = counter.compare_exchange(
            expected,
            expected + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        assert!(swapped.is_ok(), "chain executed out of order");
    })
}

// Three tasks t1 -> t2 -> t3, each CAS-incrementing a shared counter,
// scheduled in the order t3, t1, t2.
fn linear_chain_on(scheduler: &dyn Scheduler) {
    let counter = Arc::new(AtomicU32::new(0));
    let t1 = cas_task(&counter, 0);
    let t2 = cas_task(&counter, 1);
    let t3 = cas_task(&counter, 2);
    t1.set_as_predecessor_of(&t2);
    t2.set_as_predecessor_of(&t3);

    scheduler.schedule(t3.clone(), None, SchedulePriority::Default);
    scheduler.schedule(t1.clone(), None, SchedulePriority::Default);
    scheduler.schedule(t2.clone(), None, SchedulePriority::Default);
    scheduler.wait_for_tasks(&[t1, t2, t3]);

    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[test]
fn test_linear_chain_node_queue() {
    let scheduler = NodeQueueScheduler::new(Topology::fake(2, 2));
    scheduler.begin();
    linear_chain_on(&scheduler);
    scheduler.finish();
}

#[test]
fn test_linear_chain_immediate() {
    linear_chain_on(&ImmediateScheduler::new());
}

// Diamond t1 -> {t2, t3} -> t4 scheduled in the order t4, t3, t1, t2.
fn diamond_on(scheduler: &dyn Scheduler) {
    let counter = Arc::new(AtomicU32::new(0));

    let c = counter.clone();
    let t1 = Task::new(move || {
        assert!(c
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok());
    });
    let c = counter.clone();
    let t2 = Task::new(move || {
        c.fetch_add(2, Ordering::SeqCst);
    });
    let c = counter.clone();
    let t3 = Task::new(move || {
        c.fetch_add(3, Ordering::SeqCst);
    });
    let c = counter.clone();
    let t4 = Task::new(move || {
        assert!(c
            .compare_exchange(6, 7, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok());
    });

    t1.set_as_predecessor_of(&t2);
    t1.set_as_predecessor_of(&t3);
    t2.set_as_predecessor_of(&t4);
    t3.set_as_predecessor_of(&t4);

    scheduler.schedule(t4.clone(), None, SchedulePriority::Default);
    scheduler.schedule(t3, None, SchedulePriority::Default);
    scheduler.schedule(t1, None, SchedulePriority::Default);
    scheduler.schedule(t2, None, SchedulePriority::Default);
    scheduler.wait_for_tasks(&[t4]);

    assert_eq!(counter.load(Ordering::SeqCst), 7);
}

#[test]
fn test_diamond_node_queue() {
    let scheduler = NodeQueueScheduler::new(Topology::fake(1, 4));
    scheduler.begin();
    diamond_on(&scheduler);
    scheduler.finish();
}

#[test]
fn test_diamond_immediate() {
    diamond_on(&ImmediateScheduler::new());
}

// Ten outer tasks each spawn three inner tasks and wait for them.
#[test]
fn test_nested_spawn_and_wait() {
    let scheduler = Arc::new(NodeQueueScheduler::new(Topology::fake(1, 4)));
    scheduler.begin();

    let counter = Arc::new(AtomicU32::new(0));
    let mut outer = Vec::new();
    for _ in 0..10 {
        let scheduler_inner = scheduler.clone();
        let counter = counter.clone();
        outer.push(Task::new(move || {
            let mut inner = Vec::new();
            for _ in 0..3 {
                let counter = counter.clone();
                let task = Task::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
                scheduler_inner.schedule(task.clone(), None, SchedulePriority::Default);
                inner.push(task);
            }
            scheduler_inner.wait_for_tasks(&inner);
        }));
    }
    scheduler.schedule_tasks(&outer);
    scheduler.wait_for_tasks(&outer);

    assert_eq!(counter.load(Ordering::SeqCst), 30);
    scheduler.finish();
}

// A single worker must keep making progress on queued work while one of
// its tasks waits on dependents.
#[test]
fn test_single_worker_cooperative_progress() {
    let scheduler = Arc::new(NodeQueueScheduler::new(Topology::single_worker()));
    scheduler.begin();

    let counter = Arc::new(AtomicU32::new(0));
    let scheduler_inner = scheduler.clone();
    let c = counter.clone();
    let outer = Task::new(move || {
        let mut inner = Vec::new();
        for _ in 0..5 {
            let c = c.clone();
            let task = Task::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
            scheduler_inner.schedule(task.clone(), None, SchedulePriority::Default);
            inner.push(task);
        }
        scheduler_inner.wait_for_tasks(&inner);
        c.fetch_add(100, Ordering::SeqCst);
    });

    scheduler.schedule(outer.clone(), None, SchedulePriority::Default);
    scheduler.wait_for_tasks(&[outer]);
    assert_eq!(counter.load(Ordering::SeqCst), 105);
    scheduler.finish();
}

// Every transitive predecessor completes before its successor begins.
#[test]
fn test_task_ordering_along_long_chain() {
    let scheduler = NodeQueueScheduler::new(Topology::fake(2, 2));
    scheduler.begin();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut tasks: Vec<Arc<Task>> = Vec::new();
    for index in 0..50usize {
        let order = order.clone();
        tasks.push(Task::new(move || {
            order.lock().push(index);
        }));
    }
    for pair in tasks.windows(2) {
        pair[0].set_as_predecessor_of(&pair[1]);
    }

    // Schedule in reverse to stress out-of-order delivery
    for task in tasks.iter().rev() {
        scheduler.schedule(task.clone(), None, SchedulePriority::Default);
    }
    scheduler.wait_for_tasks(&tasks);

    let observed = order.lock().clone();
    assert_eq!(observed, (0..50).collect::<Vec<_>>());
    scheduler.finish();
}

// schedule_and_wait transforms a large batch into a bounded number of
// chains; concurrency never exceeds the group count.
#[test]
fn test_grouping_caps_concurrency() {
    let scheduler = NodeQueueScheduler::new(Topology::fake(1, 4));
    scheduler.begin();

    let group_cap = 4; // worker count, since the queues are idle
    let in_flight = Arc::new(AtomicI64::new(0));
    let high_water = Arc::new(AtomicI64::new(0));
    let executed = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..64)
        .map(|_| {
            let in_flight = in_flight.clone();
            let high_water = high_water.clone();
            let executed = executed.clone();
            Task::new(move || {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                high_water.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                executed.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    assert_eq!(scheduler.determine_group_count(&tasks), group_cap);
    scheduler.schedule_and_wait(tasks);

    assert_eq!(executed.load(Ordering::SeqCst), 64);
    assert!(
        high_water.load(Ordering::SeqCst) <= group_cap as i64,
        "grouping failed to cap concurrency: {}",
        high_water.load(Ordering::SeqCst)
    );
    scheduler.finish();
}

// Idle queues allow at least as many groups as loaded queues.
#[test]
fn test_group_count_is_load_sensitive() {
    let scheduler = Arc::new(NodeQueueScheduler::new(Topology::fake(1, 4)));
    scheduler.begin();

    let tasks: Vec<_> = (0..64).map(|_| Task::new(|| {})).collect();
    let idle_count = scheduler.determine_group_count(&tasks);

    // Saturate the queues with slow work, then re-evaluate
    let gate = Arc::new(AtomicU32::new(0));
    let blockers: Vec<_> = (0..64)
        .map(|_| {
            let gate = gate.clone();
            Task::new(move || {
                while gate.load(Ordering::SeqCst) == 0 {
                    std::thread::sleep(Duration::from_micros(100));
                }
            })
        })
        .collect();
    scheduler.schedule_tasks(&blockers);
    std::thread::sleep(Duration::from_millis(10));

    let loaded_count = scheduler.determine_group_count(&tasks);
    assert!(idle_count >= loaded_count);

    gate.store(1, Ordering::SeqCst);
    scheduler.wait_for_tasks(&blockers);
    scheduler.finish();
}

// Work scheduled exclusively onto one node spills to the other through
// stealing.
#[test]
fn test_stealing_balances_across_nodes() {
    let scheduler = NodeQueueScheduler::new(Topology::fake(2, 1));
    scheduler.begin();

    let counter = Arc::new(AtomicU32::new(0));
    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let counter = counter.clone();
            Task::new(move || {
                std::thread::sleep(Duration::from_micros(500));
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    for task in &tasks {
        scheduler.schedule(task.clone(), Some(0), SchedulePriority::Default);
    }
    scheduler.wait_for_tasks(&tasks);

    assert_eq!(counter.load(Ordering::SeqCst), 100);
    assert!(
        scheduler.stats().tasks_stolen > 0,
        "idle node never stole from the loaded one"
    );
    scheduler.finish();
}

// A non-stealable task runs on the node it was assigned to.
#[test]
fn test_non_stealable_task_stays_on_its_node() {
    let scheduler = NodeQueueScheduler::new(Topology::fake(2, 1));
    scheduler.begin();

    let executed_on = Arc::new(Mutex::new(String::new()));
    let slot = executed_on.clone();
    let task = Task::new(move || {
        *slot.lock() = std::thread::current().name().unwrap_or("").to_string();
    });
    task.set_stealable(false);

    scheduler.schedule(task.clone(), Some(1), SchedulePriority::Default);
    scheduler.wait_for_tasks(&[task]);

    assert_eq!(executed_on.lock().as_str(), "worker-n1-0");
    scheduler.finish();
}

// High priority tasks are served before default ones from the same queue.
#[test]
fn test_high_priority_served_first() {
    let scheduler = Arc::new(NodeQueueScheduler::new(Topology::single_worker()));
    scheduler.begin();

    let order = Arc::new(Mutex::new(Vec::new()));

    // Occupy the worker so both tasks are queued before either runs
    let gate = Arc::new(AtomicU32::new(0));
    let g = gate.clone();
    let blocker = Task::new(move || {
        while g.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_micros(100));
        }
    });
    scheduler.schedule(blocker.clone(), None, SchedulePriority::Default);
    std::thread::sleep(Duration::from_millis(10));

    let o = order.clone();
    let low = Task::new(move || o.lock().push("default"));
    let o = order.clone();
    let high = Task::new(move || o.lock().push("high"));
    scheduler.schedule(low.clone(), None, SchedulePriority::Default);
    scheduler.schedule(high.clone(), None, SchedulePriority::High);

    gate.store(1, Ordering::SeqCst);
    scheduler.wait_for_tasks(&[blocker, low, high]);

    assert_eq!(order.lock().as_slice(), ["high", "default"]);
    scheduler.finish();
}
