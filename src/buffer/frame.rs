/// Frame - per-page metadata and residency state machine.
///
/// The whole state machine lives in one atomic word packing the state into
/// the low byte and a monotonically increasing version into the high 56
/// bits. Every transition is a compare-and-swap against a previously read
/// snapshot and bumps the version, so any concurrent mutation - including a
/// pin that re-validated residency - invalidates stale snapshots. The
/// eviction queue stores the version a frame had when it became a
/// candidate; a candidate whose version no longer matches is stale.
///
/// Permitted transitions:
///
/// ```text
/// Evicted            -> Loading            (reader begins read_page)
/// Loading            -> Resident           (read_page completed)
/// Resident           -> MarkedForEviction  (unpin to zero, enqueued)
/// MarkedForEviction  -> Resident           (re-pinned before eviction)
/// MarkedForEviction  -> Evicted            (evictor confirms, slot freed)
/// Resident           -> LockedExclusive    (writer acquires for flush/move)
/// MarkedForEviction  -> LockedExclusive    (evictor acquires for write-back)
/// LockedExclusive    -> Resident           (writer releases)
/// ```

use crate::buffer::page_id::PageId;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicU8, Ordering};

const STATE_BITS: u32 = 8;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

/// Residency state of a frame
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Evicted = 0,
    Loading = 1,
    Resident = 2,
    MarkedForEviction = 3,
    LockedExclusive = 4,
}

impl FrameState {
    #[inline]
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => FrameState::Evicted,
            1 => FrameState::Loading,
            2 => FrameState::Resident,
            3 => FrameState::MarkedForEviction,
            4 => FrameState::LockedExclusive,
            _ => unreachable!("corrupt frame state bits"),
        }
    }
}

/// Memory tier a resident frame's bytes live in
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryTier {
    Dram = 0,
    Numa = 1,
}

/// Snapshot of the packed state-and-version word.
///
/// A snapshot taken before a transition must still match at CAS time;
/// otherwise the operation lost a race and retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot(u64);

impl StateSnapshot {
    #[inline(always)]
    pub fn state(self) -> FrameState {
        FrameState::from_bits(self.0 & STATE_MASK)
    }

    #[inline(always)]
    pub fn version(self) -> u64 {
        self.0 >> STATE_BITS
    }

    #[inline]
    fn pack(state: FrameState, version: u64) -> Self {
        StateSnapshot((version << STATE_BITS) | state as u64)
    }
}

/// Per-page residency metadata
pub struct Frame {
    /// Identity, immutable once assigned
    page_id: PageId,

    /// `{version:56, state:8}` - all transitions CAS this word
    state_and_version: AtomicU64,

    /// Number of concurrent users; positive forbids eviction
    pin_count: AtomicU32,

    /// Set when a pinning writer modified the bytes
    dirty: AtomicBool,

    /// Slot address in the volatile region (valid while Resident/Marked/Locked)
    data: AtomicPtr<u8>,

    /// Which tier the slot belongs to
    tier: AtomicU8,

    /// Accesses since the frame landed in the NUMA tier (Lazy promotion)
    tier_accesses: AtomicU32,
}

impl Frame {
    pub fn new(page_id: PageId, initial: FrameState) -> Self {
        Self {
            page_id,
            state_and_version: AtomicU64::new(StateSnapshot::pack(initial, 0).0),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            data: AtomicPtr::new(std::ptr::null_mut()),
            tier: AtomicU8::new(MemoryTier::Dram as u8),
            tier_accesses: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Read the current state and version
    #[inline(always)]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot(self.state_and_version.load(Ordering::Acquire))
    }

    /// Attempt the transition `expected -> next`, bumping the version.
    ///
    /// Fails (returning the current snapshot) if the word changed since
    /// `expected` was read.
    #[inline]
    pub fn try_transition(
        &self,
        expected: StateSnapshot,
        next: FrameState,
    ) -> std::result::Result<StateSnapshot, StateSnapshot> {
        let target = StateSnapshot::pack(next, expected.version() + 1);
        match self.state_and_version.compare_exchange(
            expected.0,
            target.0,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(target),
            Err(actual) => Err(StateSnapshot(actual)),
        }
    }

    /// Re-validate `expected` without changing state: CAS to the same state
    /// with a bumped version. Used by pin to fence out a concurrent
    /// mark-for-eviction.
    #[inline]
    pub fn try_revalidate(&self, expected: StateSnapshot) -> std::result::Result<StateSnapshot, StateSnapshot> {
        self.try_transition(expected, expected.state())
    }

    #[inline(always)]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Increment the pin count, returning the previous value.
    ///
    /// Callers must have fenced residency via a state CAS first.
    #[inline(always)]
    pub fn add_pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrement the pin count, returning the previous value.
    #[inline(always)]
    pub fn release_pin(&self) -> u32 {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin on unpinned frame");
        prev
    }

    #[inline(always)]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }

    #[inline(always)]
    pub fn data(&self) -> *mut u8 {
        self.data.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_data(&self, ptr: *mut u8) {
        self.data.store(ptr, Ordering::Release);
    }

    #[inline]
    pub fn tier(&self) -> MemoryTier {
        match self.tier.load(Ordering::Acquire) {
            0 => MemoryTier::Dram,
            _ => MemoryTier::Numa,
        }
    }

    #[inline]
    pub fn set_tier(&self, tier: MemoryTier) {
        self.tier.store(tier as u8, Ordering::Release);
        self.tier_accesses.store(0, Ordering::Relaxed);
    }

    /// Bump and return the access count in the current tier
    #[inline]
    pub fn record_tier_access(&self) -> u32 {
        self.tier_accesses.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::page_id::PageSizeType;

    fn frame(initial: FrameState) -> Frame {
        Frame::new(PageId::new(PageSizeType::KiB4, 0), initial)
    }

    #[test]
    fn test_transition_bumps_version() {
        let f = frame(FrameState::Evicted);
        let s0 = f.snapshot();
        assert_eq!(s0.state(), FrameState::Evicted);
        assert_eq!(s0.version(), 0);

        let s1 = f.try_transition(s0, FrameState::Loading).unwrap();
        assert_eq!(s1.state(), FrameState::Loading);
        assert_eq!(s1.version(), 1);
        assert_eq!(f.snapshot(), s1);
    }

    #[test]
    fn test_stale_snapshot_fails() {
        let f = frame(FrameState::Resident);
        let stale = f.snapshot();
        f.try_transition(stale, FrameState::MarkedForEviction).unwrap();

        // Old snapshot no longer matches
        let err = f.try_transition(stale, FrameState::Evicted).unwrap_err();
        assert_eq!(err.state(), FrameState::MarkedForEviction);
        assert_eq!(err.version(), 1);
    }

    #[test]
    fn test_revalidate_keeps_state() {
        let f = frame(FrameState::Resident);
        let s0 = f.snapshot();
        let s1 = f.try_revalidate(s0).unwrap();
        assert_eq!(s1.state(), FrameState::Resident);
        assert_eq!(s1.version(), s0.version() + 1);
    }

    #[test]
    fn test_full_lifecycle() {
        let f = frame(FrameState::Evicted);
        let mut s = f.snapshot();
        for next in [
            FrameState::Loading,
            FrameState::Resident,
            FrameState::MarkedForEviction,
            FrameState::Resident,
            FrameState::LockedExclusive,
            FrameState::Resident,
            FrameState::MarkedForEviction,
            FrameState::Evicted,
        ] {
            s = f.try_transition(s, next).unwrap();
            assert_eq!(s.state(), next);
        }
        assert_eq!(s.version(), 8);
    }

    #[test]
    fn test_pin_counting() {
        let f = frame(FrameState::Resident);
        assert_eq!(f.add_pin(), 0);
        assert_eq!(f.add_pin(), 1);
        assert_eq!(f.pin_count(), 2);
        assert_eq!(f.release_pin(), 2);
        assert_eq!(f.release_pin(), 1);
        assert_eq!(f.pin_count(), 0);
    }
}
