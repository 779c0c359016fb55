//! Task - a node in a directed acyclic task graph.
//!
//! A task owns a payload callable and the wiring that sequences it:
//! an atomic count of unfinished predecessors and a successor list that
//! is only written before scheduling. A task becomes Ready when its
//! pending count reaches zero *and* it has been scheduled; whichever of
//! the two happens last delivers it for execution. Completion notifies
//! successors by decrementing their counts.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Task identifier, unique across the process lifetime
pub type TaskId = u64;

/// NUMA node identifier
pub type NodeId = u32;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(0);

/// Lifecycle of a task
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created = 0,
    Scheduled = 1,
    Ready = 2,
    Running = 3,
    Done = 4,
}

impl TaskState {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => TaskState::Created,
            1 => TaskState::Scheduled,
            2 => TaskState::Ready,
            3 => TaskState::Running,
            4 => TaskState::Done,
            _ => unreachable!("corrupt task state"),
        }
    }
}

/// Queue lane a task is served from
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulePriority {
    #[default]
    Default = 0,
    High = 1,
}

/// A schedulable unit of work with DAG wiring
pub struct Task {
    id: TaskId,

    /// Invoked exactly once; taken out at execution
    payload: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,

    state: AtomicU8,

    /// Predecessors that have not completed yet
    pending_predecessors: AtomicUsize,

    /// Written only before scheduling, read-only afterwards
    successors: Mutex<Vec<Arc<Task>>>,

    priority: AtomicU8,

    /// Clear to pin the task to its assigned node's queue
    stealable: AtomicBool,

    /// Explicit node assignment; negative means none
    preferred_node: AtomicI64,
}

impl Task {
    pub fn new(payload: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            payload: Mutex::new(Some(Box::new(payload))),
            state: AtomicU8::new(TaskState::Created as u8),
            pending_predecessors: AtomicUsize::new(0),
            successors: Mutex::new(Vec::new()),
            priority: AtomicU8::new(SchedulePriority::Default as u8),
            stealable: AtomicBool::new(true),
            preferred_node: AtomicI64::new(-1),
        })
    }

    #[inline(always)]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_bits(self.state.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn is_done(&self) -> bool {
        self.state() == TaskState::Done
    }

    /// Whether every predecessor has completed
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.pending_predecessors.load(Ordering::Acquire) == 0
    }

    /// Wire `self` before `successor`: `successor` cannot start until
    /// `self` completes. Legal only before either task begins execution.
    pub fn set_as_predecessor_of(self: &Arc<Self>, successor: &Arc<Task>) {
        debug_assert!(
            matches!(self.state(), TaskState::Created | TaskState::Scheduled),
            "predecessor already executing"
        );
        debug_assert!(
            matches!(successor.state(), TaskState::Created | TaskState::Scheduled),
            "successor already executing"
        );
        successor
            .pending_predecessors
            .fetch_add(1, Ordering::AcqRel);
        self.successors.lock().push(successor.clone());
    }

    #[inline]
    pub fn priority(&self) -> SchedulePriority {
        match self.priority.load(Ordering::Relaxed) {
            0 => SchedulePriority::Default,
            _ => SchedulePriority::High,
        }
    }

    #[inline]
    pub fn set_priority(&self, priority: SchedulePriority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    /// Whether peer workers may steal this task
    #[inline]
    pub fn is_stealable(&self) -> bool {
        self.stealable.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_stealable(&self, stealable: bool) {
        self.stealable.store(stealable, Ordering::Relaxed);
    }

    /// Explicit node assignment, if any
    #[inline]
    pub fn preferred_node(&self) -> Option<NodeId> {
        let node = self.preferred_node.load(Ordering::Relaxed);
        if node < 0 {
            None
        } else {
            Some(node as NodeId)
        }
    }

    #[inline]
    pub fn set_preferred_node(&self, node: Option<NodeId>) {
        self.preferred_node
            .store(node.map_or(-1, |n| n as i64), Ordering::Relaxed);
    }

    /// CAS the lifecycle state; returns whether the transition happened
    #[inline]
    pub(crate) fn try_set_state(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn take_payload(&self) -> Option<Box<dyn FnOnce() + Send + 'static>> {
        self.payload.lock().take()
    }

    pub(crate) fn successors_snapshot(&self) -> Vec<Arc<Task>> {
        self.successors.lock().clone()
    }

    /// Record one predecessor completion; returns the previous count
    #[inline]
    pub(crate) fn predecessor_done(&self) -> usize {
        self.pending_predecessors.fetch_sub(1, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pending", &self.pending_predecessors.load(Ordering::Relaxed))
            .finish()
    }
}

/// Run `task`'s payload, mark it Done, and notify successors.
///
/// Returns the successors that became Ready through this completion; the
/// caller decides whether to execute them inline or enqueue them.
pub(crate) fn run_task(task: &Arc<Task>) -> Vec<Arc<Task>> {
    let started = task.try_set_state(TaskState::Ready, TaskState::Running);
    debug_assert!(started, "task executed from a non-ready state");

    if let Some(payload) = task.take_payload() {
        payload();
    }

    let finished = task.try_set_state(TaskState::Running, TaskState::Done);
    debug_assert!(finished, "task state changed during execution");

    let mut ready = Vec::new();
    for successor in task.successors_snapshot() {
        if successor.predecessor_done() == 1
            && successor.try_set_state(TaskState::Scheduled, TaskState::Ready)
        {
            ready.push(successor);
        }
    }
    ready
}
