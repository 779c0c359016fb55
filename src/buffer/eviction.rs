/// Eviction queue - FIFO of candidate pages with version validation.
///
/// The queue is a hint, not an authority. A frame is enqueued with the
/// version it had when its pin count reached zero; anything that happened
/// to the frame since (a re-pin, a tier migration, a completed eviction)
/// bumped the version and silently invalidates the entry. The evictor
/// validates at dequeue and skips stale entries, so no entry is ever
/// removed eagerly.

use crate::buffer::frame::{Frame, FrameState};
use crate::buffer::page_id::PageId;
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// A tentative eviction victim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub page_id: PageId,
    /// Frame version at enqueue time; must still match at dequeue
    pub version: u64,
}

/// Lock-free MPMC queue of eviction candidates
pub struct EvictionQueue {
    queue: SegQueue<EvictionCandidate>,

    enqueued: AtomicU64,
    dequeued: AtomicU64,
    stale_dropped: AtomicU64,
}

impl EvictionQueue {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            stale_dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn push(&self, candidate: EvictionCandidate) {
        self.queue.push(candidate);
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn pop(&self) -> Option<EvictionCandidate> {
        let candidate = self.queue.pop();
        if candidate.is_some() {
            self.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        candidate
    }

    /// Whether `candidate` still describes `frame`: same version, and the
    /// frame is still marked for eviction.
    #[inline]
    pub fn is_current(&self, candidate: &EvictionCandidate, frame: &Frame) -> bool {
        let snapshot = frame.snapshot();
        snapshot.state() == FrameState::MarkedForEviction && snapshot.version() == candidate.version
    }

    #[inline]
    pub fn record_stale(&self) {
        self.stale_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop stale entries by cycling the queue once, re-pushing entries that
    /// are still current according to `validate`. Bounds queue growth between
    /// sweeps; run from the background purge thread.
    pub fn purge<F>(&self, validate: F) -> usize
    where
        F: Fn(&EvictionCandidate) -> bool,
    {
        let mut dropped = 0;
        let snapshot_len = self.queue.len();
        for _ in 0..snapshot_len {
            match self.queue.pop() {
                Some(candidate) if validate(&candidate) => self.queue.push(candidate),
                Some(_) => {
                    dropped += 1;
                    self.stale_dropped.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
        dropped
    }

    /// Get statistics: (enqueued, dequeued, stale_dropped)
    #[cold]
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.enqueued.load(Ordering::Relaxed),
            self.dequeued.load(Ordering::Relaxed),
            self.stale_dropped.load(Ordering::Relaxed),
        )
    }
}

impl Default for EvictionQueue {
    fn default() -> Self {
        Self::new()
    }
}
