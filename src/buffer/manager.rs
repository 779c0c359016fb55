//! Buffer manager - allocation, pin/unpin, read-through, write-back.
//!
//! Orchestrates the SSD region, the per-class volatile regions, the page
//! table, and the eviction queue behind one façade. Column storage obtains
//! memory through [`BufferManager::allocate`] and addresses it with
//! [`BufferPtr`](crate::buffer::ptr::BufferPtr) values; dereferencing a
//! pointer pins its page, faulting it in from the SSD region on a miss.
//!
//! ## Tiers
//!
//! The DRAM tier always exists. When NUMA support is enabled a second set
//! of regions backs a remote-node tier; eviction from DRAM spills into it
//! and the configured [`MigrationPolicy`] decides when a page is promoted
//! back. Eviction from the NUMA tier writes back to the SSD region.
//!
//! ## Concurrency
//!
//! There is no manager-wide lock on the hot path. Residency is arbitrated
//! entirely through each frame's packed state-and-version word: pinners,
//! the evictor, and the flusher all CAS against a snapshot and retry on
//! loss. The byte allocator takes a short mutex; it is not on the pin path.
//!
//! ## Failures
//!
//! Resource exhaustion surfaces to allocator callers as
//! [`DbError::OutOfMemory`]. A failed SSD transfer is never surfaced: a
//! pool that continued past one could serve corrupt bytes, so every read
//! or write failure logs the page and aborts the process. This covers
//! read-through, eviction write-back, and flushing alike.

use crate::buffer::eviction::{EvictionCandidate, EvictionQueue};
use crate::buffer::frame::{Frame, FrameState, MemoryTier, StateSnapshot};
use crate::buffer::page_id::{PageId, PageSizeType, BASE_PAGE_SIZE};
use crate::buffer::page_table::PageTable;
use crate::buffer::ptr::BufferPtr;
use crate::buffer::ssd_region::SsdRegion;
use crate::buffer::volatile::VolatileRegion;
use crate::error::{DbError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Allocations up to this many bytes share pages; larger ones get a
/// dedicated page of the smallest sufficient class.
const SMALL_ALLOC_MAX: usize = BASE_PAGE_SIZE / 2;

/// Rounds of fruitless eviction before allocation gives up
const MAX_EVICTION_ROUNDS: usize = 16;

/// Accesses in the NUMA tier before Lazy promotes a page
const LAZY_PROMOTION_THRESHOLD: u32 = 2;

/// When pages are promoted from the NUMA tier to the DRAM tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPolicy {
    /// Promote on repeated access
    Lazy,
    /// Promote on first access
    Eager,
    /// Never place pages in the NUMA tier
    DramOnly,
    /// Never promote out of the NUMA tier
    NumaOnly,
}

/// Buffer manager construction options, read once at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferManagerConfig {
    /// Max bytes held simultaneously in the DRAM volatile regions
    pub dram_buffer_pool_size: usize,
    /// Second-tier capacity on a remote NUMA node; 0 disables
    pub numa_buffer_pool_size: usize,
    /// Node the primary DRAM regions belong to
    pub cpu_node: u32,
    /// Toggles the second-tier region
    pub enable_numa: bool,
    pub migration_policy: MigrationPolicy,
    /// File or block device backing the SSD region
    pub ssd_path: PathBuf,
    /// Maximum pages per size class (bounds PageId space and file size)
    pub pages_per_class: u64,
    /// PROT_NONE free slots to trap stray accesses
    pub protect_free_slots: bool,
    /// Interval of the background stale-candidate purge
    pub purge_interval: Duration,
    pub page_table_partitions: usize,
}

impl Default for BufferManagerConfig {
    fn default() -> Self {
        Self {
            dram_buffer_pool_size: 64 * 1024 * 1024,
            numa_buffer_pool_size: 0,
            cpu_node: 0,
            enable_numa: false,
            migration_policy: MigrationPolicy::Lazy,
            ssd_path: PathBuf::from("basalt_pages.db"),
            pages_per_class: 8192,
            protect_free_slots: false,
            purge_interval: Duration::from_millis(500),
            page_table_partitions: 16,
        }
    }
}

/// Builder for [`BufferManager`]
pub struct BufferManagerBuilder {
    config: BufferManagerConfig,
}

impl BufferManagerBuilder {
    pub fn new() -> Self {
        Self { config: BufferManagerConfig::default() }
    }

    pub fn dram_pool_size(mut self, bytes: usize) -> Self {
        self.config.dram_buffer_pool_size = bytes;
        self
    }

    pub fn numa_pool_size(mut self, bytes: usize) -> Self {
        self.config.numa_buffer_pool_size = bytes;
        self.config.enable_numa = bytes > 0;
        self
    }

    pub fn cpu_node(mut self, node: u32) -> Self {
        self.config.cpu_node = node;
        self
    }

    pub fn migration_policy(mut self, policy: MigrationPolicy) -> Self {
        self.config.migration_policy = policy;
        self
    }

    pub fn ssd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ssd_path = path.into();
        self
    }

    pub fn pages_per_class(mut self, pages: u64) -> Self {
        self.config.pages_per_class = pages;
        self
    }

    pub fn protect_free_slots(mut self, enable: bool) -> Self {
        self.config.protect_free_slots = enable;
        self
    }

    pub fn purge_interval(mut self, interval: Duration) -> Self {
        self.config.purge_interval = interval;
        self
    }

    pub fn page_table_partitions(mut self, partitions: usize) -> Self {
        self.config.page_table_partitions = partitions;
        self
    }

    pub fn build(self) -> Result<Arc<BufferManager>> {
        BufferManager::new(self.config)
    }
}

impl Default for BufferManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One memory tier: a volatile region per size class plus byte accounting
struct Tier {
    regions: Vec<VolatileRegion>,
    pool_size: usize,
    resident_bytes: AtomicUsize,
}

impl Tier {
    fn new(pool_size: usize, protect_free_slots: bool, numa_node: Option<u32>) -> Result<Self> {
        let mut regions = Vec::with_capacity(PageSizeType::COUNT);
        for class in PageSizeType::ALL {
            let capacity = (pool_size / class.size()) as u32;
            regions.push(VolatileRegion::new(
                class.size(),
                capacity,
                protect_free_slots,
                numa_node,
            )?);
        }
        Ok(Self {
            regions,
            pool_size,
            resident_bytes: AtomicUsize::new(0),
        })
    }

    #[inline]
    fn region(&self, class: PageSizeType) -> &VolatileRegion {
        &self.regions[class.index()]
    }
}

/// Counters for the buffer manager, updated lock-free
#[derive(Debug, Default)]
pub struct BufferManagerStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub pages_read: AtomicU64,
    pub pages_written: AtomicU64,
    pub evictions: AtomicU64,
    pub spills: AtomicU64,
    pub promotions: AtomicU64,
    pub pages_allocated: AtomicU64,
    pub pages_freed: AtomicU64,
}

/// Point-in-time view of [`BufferManagerStats`] for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferManagerStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub pages_read: u64,
    pub pages_written: u64,
    pub evictions: u64,
    pub spills: u64,
    pub promotions: u64,
    pub pages_allocated: u64,
    pub pages_freed: u64,
    pub resident_dram_bytes: usize,
    pub resident_numa_bytes: usize,
    pub hit_rate: f64,
}

/// Shared-page packing state for the byte allocator
struct OpenPage {
    page_id: PageId,
    next_offset: usize,
}

#[derive(Default)]
struct AllocatorState {
    /// Page currently accepting small allocations
    open_page: Option<OpenPage>,
    /// Live allocation count per page; a page is released at zero
    live: HashMap<PageId, u32>,
}

enum PinOutcome {
    Pinned,
    /// The frame was evicted under us; re-resolve through the page table
    Gone,
}

/// Page-granular, multi-sized, tiered buffer cache
pub struct BufferManager {
    config: BufferManagerConfig,
    ssd: SsdRegion,
    page_table: PageTable,
    eviction_queue: EvictionQueue,
    dram: Tier,
    numa: Option<Tier>,

    /// Next fresh page index per size class
    next_index: [AtomicU64; PageSizeType::COUNT],
    /// Recycled page indices per size class
    free_indices: [Mutex<Vec<u64>>; PageSizeType::COUNT],

    allocator: Mutex<AllocatorState>,
    stats: BufferManagerStats,

    purge_shutdown: AtomicBool,
    purge_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl BufferManager {
    /// Construct from explicit options; see [`BufferManagerBuilder`]
    pub fn new(config: BufferManagerConfig) -> Result<Arc<Self>> {
        let ssd = SsdRegion::open(&config.ssd_path, config.pages_per_class)?;
        let dram = Tier::new(
            config.dram_buffer_pool_size,
            config.protect_free_slots,
            Some(config.cpu_node),
        )?;
        let numa = if config.enable_numa && config.numa_buffer_pool_size > 0 {
            Some(Tier::new(
                config.numa_buffer_pool_size,
                config.protect_free_slots,
                // The second tier lives on the next node over
                Some(config.cpu_node + 1),
            )?)
        } else {
            None
        };

        tracing::info!(
            dram_bytes = config.dram_buffer_pool_size,
            numa_bytes = config.numa_buffer_pool_size,
            ssd = %config.ssd_path.display(),
            direct_io = ssd.is_direct(),
            "buffer manager initialized"
        );

        let manager = Arc::new(Self {
            page_table: PageTable::new(config.page_table_partitions.max(1), 64),
            eviction_queue: EvictionQueue::new(),
            dram,
            numa,
            next_index: std::array::from_fn(|_| AtomicU64::new(0)),
            free_indices: std::array::from_fn(|_| Mutex::new(Vec::new())),
            allocator: Mutex::new(AllocatorState::default()),
            stats: BufferManagerStats::default(),
            purge_shutdown: AtomicBool::new(false),
            purge_thread: Mutex::new(None),
            ssd,
            config,
        });

        manager.spawn_purge_thread();
        Ok(manager)
    }

    fn spawn_purge_thread(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let interval = self.config.purge_interval;
        let handle = std::thread::Builder::new()
            .name("buffer-purge".to_string())
            .spawn(move || {
                let tick = Duration::from_millis(50);
                let ticks_per_purge = (interval.as_millis() / tick.as_millis()).max(1) as u64;
                let mut elapsed_ticks = 0u64;
                loop {
                    std::thread::sleep(tick);
                    let manager = match weak.upgrade() {
                        Some(m) => m,
                        None => break,
                    };
                    if manager.purge_shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    elapsed_ticks += 1;
                    if elapsed_ticks >= ticks_per_purge {
                        elapsed_ticks = 0;
                        manager.purge_stale_candidates();
                    }
                }
            })
            .expect("failed to spawn buffer purge thread");
        *self.purge_thread.lock() = Some(handle);
    }

    /// Drop eviction-queue entries whose frames moved on
    pub fn purge_stale_candidates(&self) -> usize {
        self.eviction_queue.purge(|candidate| {
            match self.page_table.find(candidate.page_id) {
                Some(frame) => self.eviction_queue.is_current(candidate, &frame),
                None => false,
            }
        })
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Reserve `size` bytes with `align` alignment inside buffer-managed
    /// pages. Small requests pack into shared pages; larger ones get a
    /// dedicated page of the smallest sufficient class.
    pub fn allocate(&self, size: usize, align: usize) -> Result<BufferPtr<u8>> {
        if size == 0 || !align.is_power_of_two() {
            return Err(DbError::InvalidArgument(format!(
                "allocate(size={}, align={})",
                size, align
            )));
        }
        if align > PageSizeType::largest().size() {
            return Err(DbError::InvalidArgument(format!(
                "alignment {} exceeds the largest page size",
                align
            )));
        }

        if size > SMALL_ALLOC_MAX {
            let class = PageSizeType::fitting(size)?;
            let page_id = self.new_page(class)?;
            self.allocator.lock().live.insert(page_id, 1);
            return Ok(BufferPtr::new(page_id, 0));
        }

        let mut guard = self.allocator.lock();
        let state = &mut *guard;
        if let Some(open) = state.open_page.as_mut() {
            let offset = open.next_offset.next_multiple_of(align);
            if offset + size <= BASE_PAGE_SIZE {
                let page_id = open.page_id;
                open.next_offset = offset + size;
                *state.live.get_mut(&page_id).expect("open page missing live count") += 1;
                return Ok(BufferPtr::new(page_id, offset as u32));
            }
        }

        // Open page absent or exhausted; start a fresh one. new_page may
        // evict, which never touches the allocator lock.
        let page_id = self.new_page(PageSizeType::KiB4)?;
        state.live.insert(page_id, 1);
        state.open_page = Some(OpenPage { page_id, next_offset: size });
        Ok(BufferPtr::new(page_id, 0))
    }

    /// Return bytes to the allocator. The page backing a fully empty
    /// range is released and its id recycled.
    pub fn deallocate(&self, ptr: BufferPtr<u8>, size: usize, align: usize) {
        debug_assert!(!ptr.is_null(), "deallocate null pointer");
        debug_assert!(size > 0 && align.is_power_of_two());
        let page_id = ptr.page_id();

        let release = {
            let mut state = self.allocator.lock();
            let live = match state.live.get_mut(&page_id) {
                Some(live) => live,
                None => {
                    debug_assert!(false, "deallocate on untracked page {:?}", page_id);
                    return;
                }
            };
            debug_assert!(*live > 0);
            *live -= 1;
            if *live == 0 {
                state.live.remove(&page_id);
                if state
                    .open_page
                    .as_ref()
                    .is_some_and(|open| open.page_id == page_id)
                {
                    state.open_page = None;
                }
                true
            } else {
                false
            }
        };

        if release {
            self.drop_page(page_id);
        }
    }

    /// Create a fresh resident page of `class`, zeroed and dirty.
    ///
    /// The page starts unpinned and immediately becomes an eviction
    /// candidate; its first eviction persists the (zeroed or since
    /// written) contents to the SSD region.
    pub fn new_page(&self, class: PageSizeType) -> Result<PageId> {
        let size = class.size();
        self.ensure_capacity(MemoryTier::Dram, size)?;

        let index = {
            let recycled = self.free_indices[class.index()].lock().pop();
            match recycled {
                Some(index) => index,
                None => {
                    let index = self.next_index[class.index()].fetch_add(1, Ordering::Relaxed);
                    if index >= self.ssd.pages_per_class() {
                        return Err(DbError::OutOfMemory(format!(
                            "page id space exhausted for size class {:?}",
                            class
                        )));
                    }
                    index
                }
            }
        };
        let page_id = PageId::new(class, index);

        let frame = Arc::new(Frame::new(page_id, FrameState::Loading));
        let (frame, won) = self.page_table.insert_if_absent(page_id, frame);
        debug_assert!(won, "fresh page id already present in page table");

        let slot = self.claim_slot(MemoryTier::Dram, page_id)?;
        // SAFETY: the slot spans one page of this class and is exclusively ours
        unsafe { std::ptr::write_bytes(slot, 0, size) };

        frame.set_data(slot);
        frame.set_tier(MemoryTier::Dram);
        frame.set_dirty(true);
        self.dram.resident_bytes.fetch_add(size, Ordering::Relaxed);

        let loading = frame.snapshot();
        debug_assert_eq!(loading.state(), FrameState::Loading);
        frame
            .try_transition(loading, FrameState::Resident)
            .expect("exclusive loading frame changed state");

        self.mark_for_eviction_if_unpinned(&frame);
        self.stats.pages_allocated.fetch_add(1, Ordering::Relaxed);
        Ok(page_id)
    }

    /// Take a volatile slot in `tier`, evicting as needed
    fn claim_slot(&self, tier: MemoryTier, page_id: PageId) -> Result<*mut u8> {
        let class = page_id.size_type();
        let tier_ref = self.tier(tier).expect("claim_slot on disabled tier");
        let mut rounds = 0;
        loop {
            if let Some(slot) = tier_ref.region(class).allocate_slot(page_id) {
                return Ok(slot.as_ptr());
            }
            rounds += 1;
            if rounds > MAX_EVICTION_ROUNDS {
                return Err(DbError::OutOfMemory(format!(
                    "no volatile slot for {:?} after {} eviction rounds",
                    page_id, rounds
                )));
            }
            self.evict_from(tier);
        }
    }

    /// Release the physical page behind `page_id` and recycle the id.
    ///
    /// Callers promise no outstanding pins or pointers; the bytes are dead.
    fn drop_page(&self, page_id: PageId) {
        let mut spins = 0u32;
        loop {
            let frame = match self.page_table.find(page_id) {
                Some(frame) => frame,
                None => break, // already evicted; only the id remains
            };
            debug_assert_eq!(frame.pin_count(), 0, "drop_page on pinned page");
            let snapshot = frame.snapshot();
            match snapshot.state() {
                FrameState::Resident | FrameState::MarkedForEviction => {
                    let marked = if snapshot.state() == FrameState::Resident {
                        match frame.try_transition(snapshot, FrameState::MarkedForEviction) {
                            Ok(next) => next,
                            Err(_) => continue,
                        }
                    } else {
                        snapshot
                    };
                    if frame.try_transition(marked, FrameState::Evicted).is_ok() {
                        self.release_frame_slot(&frame);
                        self.page_table.erase(page_id);
                        break;
                    }
                }
                FrameState::Loading | FrameState::LockedExclusive => {
                    backoff(&mut spins);
                }
                FrameState::Evicted => break,
            }
        }

        self.free_indices[page_id.size_type().index()]
            .lock()
            .push(page_id.page_index());
        self.stats.pages_freed.fetch_add(1, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Pin / unpin / read-through
    // ------------------------------------------------------------------

    /// Pin `page_id` resident and return its slot address.
    ///
    /// The address stays valid until the matching [`unpin`](Self::unpin).
    /// Faults the page in from the SSD region on a miss.
    pub fn get_page(&self, page_id: PageId) -> Result<*mut u8> {
        debug_assert!(page_id.is_valid(), "get_page on invalid PageId");
        let mut faulted = false;
        loop {
            let frame = match self.page_table.find(page_id) {
                Some(frame) => frame,
                None => {
                    self.read_through(page_id)?;
                    faulted = true;
                    continue;
                }
            };
            match self.try_pin_frame(&frame) {
                PinOutcome::Pinned => {
                    if faulted {
                        self.stats.misses.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    }
                    self.maybe_promote(&frame);
                    return Ok(frame.data());
                }
                PinOutcome::Gone => continue,
            }
        }
    }

    /// Scoped pin; unpins (and records dirtiness) on drop
    pub fn pin(&self, page_id: PageId) -> Result<PinGuard<'_>> {
        let data = self.get_page(page_id)?;
        Ok(PinGuard {
            manager: self,
            page_id,
            data,
            len: page_id.size_bytes(),
            dirty: false,
        })
    }

    /// Balance a [`get_page`](Self::get_page); `dirty` records that the
    /// caller modified the page bytes.
    pub fn unpin(&self, page_id: PageId, dirty: bool) {
        let frame = match self.page_table.find(page_id) {
            Some(frame) => frame,
            None => {
                debug_assert!(false, "unpin on non-resident page {:?}", page_id);
                return;
            }
        };
        if dirty {
            frame.set_dirty(true);
        }
        if frame.release_pin() == 1 {
            self.mark_for_eviction_if_unpinned(&frame);
        }
    }

    fn try_pin_frame(&self, frame: &Frame) -> PinOutcome {
        let mut spins = 0u32;
        loop {
            let snapshot = frame.snapshot();
            match snapshot.state() {
                FrameState::Resident => {
                    // Raise the pin before fencing residency so a concurrent
                    // unpin-to-zero cannot mark the frame underneath us.
                    frame.add_pin();
                    if frame.try_revalidate(snapshot).is_ok() {
                        return PinOutcome::Pinned;
                    }
                    if frame.release_pin() == 1 {
                        self.mark_for_eviction_if_unpinned(frame);
                    }
                }
                FrameState::MarkedForEviction => {
                    frame.add_pin();
                    if frame.try_transition(snapshot, FrameState::Resident).is_ok() {
                        return PinOutcome::Pinned;
                    }
                    if frame.release_pin() == 1 {
                        self.mark_for_eviction_if_unpinned(frame);
                    }
                }
                FrameState::Loading | FrameState::LockedExclusive => {
                    backoff(&mut spins);
                }
                FrameState::Evicted => return PinOutcome::Gone,
            }
        }
    }

    /// Fault `page_id` in from the SSD region. Exactly one thread loads;
    /// concurrent callers observe the Loading frame and wait.
    fn read_through(&self, page_id: PageId) -> Result<()> {
        let fresh = Arc::new(Frame::new(page_id, FrameState::Loading));
        let (frame, won) = self.page_table.insert_if_absent(page_id, fresh);
        if !won {
            // Another thread is loading; our caller will pin its frame
            return Ok(());
        }

        let class = page_id.size_type();
        let size = class.size();
        let landing = if self.config.migration_policy == MigrationPolicy::NumaOnly
            && self.numa.is_some()
        {
            MemoryTier::Numa
        } else {
            MemoryTier::Dram
        };

        let slot = match self
            .ensure_capacity(landing, size)
            .and_then(|_| self.claim_slot(landing, page_id))
        {
            Ok(slot) => slot,
            Err(err) => {
                // Out of memory: unblock waiters spinning on Loading,
                // then drop the entry
                let loading = frame.snapshot();
                frame
                    .try_transition(loading, FrameState::Evicted)
                    .expect("exclusive loading frame changed state");
                self.page_table.erase(page_id);
                return Err(err);
            }
        };

        // SAFETY: the slot spans one page of this class and is ours
        let dst = unsafe { std::slice::from_raw_parts_mut(slot, size) };
        if let Err(err) = self.ssd.read_page(page_id, dst) {
            fatal_io("read-through", page_id, &err);
        }

        frame.set_data(slot);
        frame.set_tier(landing);
        self.tier(landing)
            .expect("landing tier disabled")
            .resident_bytes
            .fetch_add(size, Ordering::Relaxed);
        self.stats.pages_read.fetch_add(1, Ordering::Relaxed);

        let loading = frame.snapshot();
        frame
            .try_transition(loading, FrameState::Resident)
            .expect("exclusive loading frame changed state");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Eviction and tier migration
    // ------------------------------------------------------------------

    fn mark_for_eviction_if_unpinned(&self, frame: &Frame) {
        loop {
            let snapshot = frame.snapshot();
            if snapshot.state() != FrameState::Resident || frame.pin_count() > 0 {
                return;
            }
            match frame.try_transition(snapshot, FrameState::MarkedForEviction) {
                Ok(marked) => {
                    self.eviction_queue.push(EvictionCandidate {
                        page_id: frame.page_id(),
                        version: marked.version(),
                    });
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    #[inline]
    fn tier(&self, tier: MemoryTier) -> Option<&Tier> {
        match tier {
            MemoryTier::Dram => Some(&self.dram),
            MemoryTier::Numa => self.numa.as_ref(),
        }
    }

    /// Block until `tier` can take `need` more bytes, evicting victims.
    fn ensure_capacity(&self, tier: MemoryTier, need: usize) -> Result<()> {
        let tier_ref = self
            .tier(tier)
            .ok_or_else(|| DbError::Internal("capacity check on disabled tier".into()))?;
        if need > tier_ref.pool_size {
            return Err(DbError::OutOfMemory(format!(
                "allocation of {} bytes exceeds tier capacity {}",
                need, tier_ref.pool_size
            )));
        }

        let mut fruitless = 0;
        while tier_ref.resident_bytes.load(Ordering::Acquire) + need > tier_ref.pool_size {
            if self.evict_from(tier) {
                fruitless = 0;
            } else {
                fruitless += 1;
                if fruitless >= MAX_EVICTION_ROUNDS {
                    return Err(DbError::OutOfMemory(format!(
                        "buffer pool exhausted: {} bytes needed, {} resident of {}",
                        need,
                        tier_ref.resident_bytes.load(Ordering::Relaxed),
                        tier_ref.pool_size
                    )));
                }
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    /// Pop candidates until bytes are freed from `tier` or the queue runs
    /// out of material for this round.
    fn evict_from(&self, tier: MemoryTier) -> bool {
        let budget = self.eviction_queue.len() + 4;
        for _ in 0..budget {
            let candidate = match self.eviction_queue.pop() {
                Some(candidate) => candidate,
                None => return false,
            };
            if let Some(freed) = self.process_candidate(candidate) {
                if freed == tier {
                    return true;
                }
            }
        }
        false
    }

    /// Validate and act on one candidate. Returns the tier bytes were
    /// freed from, or None if the entry was stale or the frame escaped.
    fn process_candidate(&self, candidate: EvictionCandidate) -> Option<MemoryTier> {
        let frame = match self.page_table.find(candidate.page_id) {
            Some(frame) => frame,
            None => {
                self.eviction_queue.record_stale();
                return None;
            }
        };
        let snapshot = frame.snapshot();
        if snapshot.state() != FrameState::MarkedForEviction
            || snapshot.version() != candidate.version
        {
            self.eviction_queue.record_stale();
            return None;
        }

        let tier = frame.tier();
        if tier == MemoryTier::Dram && self.spill_allowed(&frame) {
            if self.spill_to_numa(&frame, snapshot) {
                return Some(MemoryTier::Dram);
            }
            // Spill fell through (tier full or lost the race); the frame
            // either escaped or was re-marked, so this candidate is spent.
            return None;
        }

        if self.evict_to_ssd(&frame, snapshot) {
            Some(tier)
        } else {
            None
        }
    }

    fn spill_allowed(&self, frame: &Frame) -> bool {
        if self.numa.is_none() {
            return false;
        }
        match self.config.migration_policy {
            MigrationPolicy::DramOnly => false,
            _ => {
                let numa = self.numa.as_ref().expect("numa tier checked above");
                let size = frame.page_id().size_bytes();
                numa.resident_bytes.load(Ordering::Acquire) + size <= numa.pool_size
            }
        }
    }

    /// Move a DRAM victim's bytes into the NUMA tier instead of dropping
    /// them; the page stays resident and evictable.
    fn spill_to_numa(&self, frame: &Frame, marked: StateSnapshot) -> bool {
        let page_id = frame.page_id();
        let class = page_id.size_type();
        let size = class.size();
        let numa = self.numa.as_ref().expect("spill without numa tier");

        let locked = match frame.try_transition(marked, FrameState::LockedExclusive) {
            Ok(locked) => locked,
            Err(_) => return false,
        };

        let new_slot = match numa.region(class).allocate_slot(page_id) {
            Some(slot) => slot,
            None => {
                // Restore and surrender the candidacy
                frame
                    .try_transition(locked, FrameState::Resident)
                    .expect("exclusive frame changed state");
                self.mark_for_eviction_if_unpinned(frame);
                return false;
            }
        };

        let old = frame.data();
        // SAFETY: we hold the frame exclusively; both slots span `size` bytes
        unsafe { std::ptr::copy_nonoverlapping(old, new_slot.as_ptr(), size) };
        self.dram
            .region(class)
            .free_slot(std::ptr::NonNull::new(old).expect("resident frame without slot"));
        frame.set_data(new_slot.as_ptr());
        frame.set_tier(MemoryTier::Numa);
        self.dram.resident_bytes.fetch_sub(size, Ordering::Relaxed);
        numa.resident_bytes.fetch_add(size, Ordering::Relaxed);

        frame
            .try_transition(locked, FrameState::Resident)
            .expect("exclusive frame changed state");
        self.mark_for_eviction_if_unpinned(frame);
        self.stats.spills.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Write back (if dirty) and drop a marked victim.
    fn evict_to_ssd(&self, frame: &Frame, marked: StateSnapshot) -> bool {
        let page_id = frame.page_id();
        let size = page_id.size_bytes();
        let mut marked = marked;

        if frame.is_dirty() {
            let locked = match frame.try_transition(marked, FrameState::LockedExclusive) {
                Ok(locked) => locked,
                Err(_) => return false,
            };
            // SAFETY: exclusive access; the slot spans one page
            let src = unsafe { std::slice::from_raw_parts(frame.data(), size) };
            if let Err(err) = self.ssd.write_page(page_id, src) {
                fatal_io("eviction write-back", page_id, &err);
            }
            frame.set_dirty(false);
            self.stats.pages_written.fetch_add(1, Ordering::Relaxed);

            let resident = frame
                .try_transition(locked, FrameState::Resident)
                .expect("exclusive frame changed state");
            marked = match frame.try_transition(resident, FrameState::MarkedForEviction) {
                Ok(next) => next,
                // A pin slipped in after the flush; the page stays
                Err(_) => return false,
            };
        }

        if frame.try_transition(marked, FrameState::Evicted).is_err() {
            return false;
        }
        self.release_frame_slot(frame);
        self.page_table.erase(page_id);
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Return an evicted frame's slot to its region and fix accounting
    fn release_frame_slot(&self, frame: &Frame) {
        let class = frame.page_id().size_type();
        let size = class.size();
        let tier = self.tier(frame.tier()).expect("frame on disabled tier");
        let data = frame.data();
        frame.set_data(std::ptr::null_mut());
        tier.region(class)
            .free_slot(std::ptr::NonNull::new(data).expect("evicted frame without slot"));
        tier.resident_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    /// Apply the migration policy after a pin of a NUMA-tier page
    fn maybe_promote(&self, frame: &Frame) {
        if frame.tier() != MemoryTier::Numa {
            return;
        }
        let promote = match self.config.migration_policy {
            MigrationPolicy::Eager => true,
            MigrationPolicy::Lazy => frame.record_tier_access() >= LAZY_PROMOTION_THRESHOLD,
            MigrationPolicy::DramOnly | MigrationPolicy::NumaOnly => false,
        };
        if promote {
            self.promote_to_dram(frame);
        }
    }

    /// Best-effort NUMA -> DRAM migration; only safe as the sole pinner.
    fn promote_to_dram(&self, frame: &Frame) {
        if frame.pin_count() != 1 {
            return;
        }
        let page_id = frame.page_id();
        let class = page_id.size_type();
        let size = class.size();

        if self.ensure_capacity(MemoryTier::Dram, size).is_err() {
            return;
        }

        let snapshot = frame.snapshot();
        if snapshot.state() != FrameState::Resident {
            return;
        }
        let locked = match frame.try_transition(snapshot, FrameState::LockedExclusive) {
            Ok(locked) => locked,
            Err(_) => return,
        };
        if frame.pin_count() != 1 {
            frame
                .try_transition(locked, FrameState::Resident)
                .expect("exclusive frame changed state");
            return;
        }

        let new_slot = match self.dram.region(class).allocate_slot(page_id) {
            Some(slot) => slot,
            None => {
                frame
                    .try_transition(locked, FrameState::Resident)
                    .expect("exclusive frame changed state");
                return;
            }
        };

        let numa = self.numa.as_ref().expect("promotion without numa tier");
        let old = frame.data();
        // SAFETY: we hold the frame exclusively; both slots span `size` bytes
        unsafe { std::ptr::copy_nonoverlapping(old, new_slot.as_ptr(), size) };
        numa.region(class)
            .free_slot(std::ptr::NonNull::new(old).expect("resident frame without slot"));
        frame.set_data(new_slot.as_ptr());
        frame.set_tier(MemoryTier::Dram);
        numa.resident_bytes.fetch_sub(size, Ordering::Relaxed);
        self.dram.resident_bytes.fetch_add(size, Ordering::Relaxed);

        frame
            .try_transition(locked, FrameState::Resident)
            .expect("exclusive frame changed state");
        self.stats.promotions.fetch_add(1, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Swizzling, flushing, introspection
    // ------------------------------------------------------------------

    /// Resolve a raw address inside any volatile region back to the page
    /// identity and byte offset it belongs to.
    pub fn unswizzle(&self, ptr: *const u8) -> Result<(PageId, PageSizeType, usize)> {
        for tier in [Some(&self.dram), self.numa.as_ref()].into_iter().flatten() {
            for region in &tier.regions {
                if let Some((page_id, offset)) = region.unswizzle(ptr) {
                    return Ok((page_id, page_id.size_type(), offset));
                }
            }
        }
        Err(DbError::InvalidArgument(
            "address not inside any volatile region".to_string(),
        ))
    }

    /// Write back every dirty resident page. A failed write aborts the
    /// process, so a returned flush really did land every page.
    pub fn flush_all(&self) {
        for frame in self.page_table.collect_frames() {
            self.flush_frame(&frame);
        }
    }

    fn flush_frame(&self, frame: &Frame) {
        let mut spins = 0u32;
        loop {
            if !frame.is_dirty() {
                return;
            }
            let snapshot = frame.snapshot();
            match snapshot.state() {
                FrameState::Resident | FrameState::MarkedForEviction => {
                    let was_marked = snapshot.state() == FrameState::MarkedForEviction;
                    let locked = match frame.try_transition(snapshot, FrameState::LockedExclusive) {
                        Ok(locked) => locked,
                        Err(_) => continue,
                    };
                    let size = frame.page_id().size_bytes();
                    // SAFETY: exclusive access; the slot spans one page
                    let src = unsafe { std::slice::from_raw_parts(frame.data(), size) };
                    if let Err(err) = self.ssd.write_page(frame.page_id(), src) {
                        fatal_io("flush", frame.page_id(), &err);
                    }
                    frame.set_dirty(false);
                    self.stats.pages_written.fetch_add(1, Ordering::Relaxed);
                    frame
                        .try_transition(locked, FrameState::Resident)
                        .expect("exclusive frame changed state");
                    if was_marked {
                        // Restore the candidacy the flush consumed
                        self.mark_for_eviction_if_unpinned(frame);
                    }
                    return;
                }
                FrameState::Loading | FrameState::LockedExclusive => backoff(&mut spins),
                FrameState::Evicted => return,
            }
        }
    }

    /// Construction options
    pub fn config(&self) -> &BufferManagerConfig {
        &self.config
    }

    /// Bytes currently resident in the DRAM tier
    pub fn resident_dram_bytes(&self) -> usize {
        self.dram.resident_bytes.load(Ordering::Relaxed)
    }

    /// Bytes currently resident in the NUMA tier (0 when disabled)
    pub fn resident_numa_bytes(&self) -> usize {
        self.numa
            .as_ref()
            .map(|tier| tier.resident_bytes.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// SSD transfer counters: (pages read, pages written)
    pub fn ssd_io_counts(&self) -> (u64, u64) {
        (self.ssd.read_count(), self.ssd.write_count())
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> BufferManagerStatsSnapshot {
        let hits = self.stats.hits.load(Ordering::Relaxed);
        let misses = self.stats.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        BufferManagerStatsSnapshot {
            hits,
            misses,
            pages_read: self.stats.pages_read.load(Ordering::Relaxed),
            pages_written: self.stats.pages_written.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            spills: self.stats.spills.load(Ordering::Relaxed),
            promotions: self.stats.promotions.load(Ordering::Relaxed),
            pages_allocated: self.stats.pages_allocated.load(Ordering::Relaxed),
            pages_freed: self.stats.pages_freed.load(Ordering::Relaxed),
            resident_dram_bytes: self.resident_dram_bytes(),
            resident_numa_bytes: self.resident_numa_bytes(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.purge_shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.purge_thread.lock().take() {
            let _ = handle.join();
        }
        // Aborts on a failed write; dirty pages never vanish silently
        self.flush_all();
    }
}

/// RAII pin: the page stays resident while the guard lives
pub struct PinGuard<'a> {
    manager: &'a BufferManager,
    page_id: PageId,
    data: *mut u8,
    len: usize,
    dirty: bool,
}

impl PinGuard<'_> {
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Read access to the page bytes
    #[inline]
    pub fn data(&self) -> &[u8] {
        // SAFETY: the pin keeps the slot valid for the guard's lifetime
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    /// Write access; marks the page dirty
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        // SAFETY: the pin keeps the slot valid for the guard's lifetime
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len) }
    }

    /// Raw slot address (valid while the guard lives)
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.data
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.manager.unpin(self.page_id, self.dirty);
    }
}

/// Page I/O failure policy: log a diagnostic and stop the process.
/// No caller can repair a half-transferred page, and continuing risks
/// serving corrupt data.
#[cold]
fn fatal_io(context: &str, page_id: PageId, err: &DbError) -> ! {
    tracing::error!(page = %page_id, error = %err, context, "page I/O failed, aborting");
    std::process::abort();
}

#[inline]
fn backoff(spins: &mut u32) {
    *spins += 1;
    if *spins < 64 {
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}
