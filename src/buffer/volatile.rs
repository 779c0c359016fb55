/// Volatile region - per-size-class slab of reserved virtual memory.
///
/// Each region is one `mmap` reservation divided into equal slots, one
/// resident page per slot. The reservation uses `MAP_NORESERVE` so the
/// kernel commits physical memory lazily on first touch; resident-byte
/// accounting lives in the buffer manager, not here. Slots never move,
/// which is what makes raw pointers into a pinned page stable.
///
/// A region may be tagged with a NUMA node. The tag is advisory: it marks
/// the second-tier region that eviction spills into; actual placement is
/// left to the kernel's first-touch policy.

use crate::buffer::page_id::{PageId, INVALID_PAGE_ID};
use crate::error::{DbError, Result};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Slot index within a region
pub type SlotId = u32;

/// One mmap'd slab holding pages of a single size class
pub struct VolatileRegion {
    /// Base of the reserved range
    base: NonNull<u8>,

    /// Size of each slot (the page size of this region's class)
    page_size: usize,

    /// Number of slots in the reservation
    capacity: u32,

    /// Free slot indices
    free_slots: Mutex<Vec<SlotId>>,

    /// Owning PageId per slot (raw packed form, INVALID when free).
    /// Supports unswizzling a raw address back to `{PageId, offset}`.
    slot_owner: Box<[AtomicU64]>,

    /// Free slots are PROT_NONE to trap stray accesses
    protect_free_slots: bool,

    /// Advisory NUMA node tag (second-tier regions)
    numa_node: Option<u32>,

    slots_in_use: AtomicUsize,
}

// The raw base pointer is only dereferenced through slots handed out by
// allocate_slot, each owned by exactly one frame at a time.
unsafe impl Send for VolatileRegion {}
unsafe impl Sync for VolatileRegion {}

impl VolatileRegion {
    /// Reserve a region of `capacity` slots of `page_size` bytes each.
    pub fn new(
        page_size: usize,
        capacity: u32,
        protect_free_slots: bool,
        numa_node: Option<u32>,
    ) -> Result<Self> {
        assert!(page_size > 0);
        let total = page_size * capacity as usize;

        let prot = if protect_free_slots {
            libc::PROT_NONE
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };

        // A zero-slot region is legal (tier smaller than this size class);
        // it never hands out slots and never maps memory.
        let base = if total == 0 {
            NonNull::<u8>::dangling().as_ptr() as *mut libc::c_void
        } else {
            // SAFETY: anonymous private mapping with no fixed address.
            unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    total,
                    prot,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            }
        };
        if base == libc::MAP_FAILED {
            return Err(DbError::Io(std::io::Error::last_os_error()));
        }

        let mut free_slots = Vec::with_capacity(capacity as usize);
        // Pop order matches insertion order reversed; hand out low slots first
        for slot in (0..capacity).rev() {
            free_slots.push(slot);
        }

        let slot_owner = (0..capacity)
            .map(|_| AtomicU64::new(INVALID_PAGE_ID.to_raw()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            base: NonNull::new(base as *mut u8).expect("mmap returned null"),
            page_size,
            capacity,
            free_slots: Mutex::new(free_slots),
            slot_owner,
            protect_free_slots,
            numa_node,
            slots_in_use: AtomicUsize::new(0),
        })
    }

    #[inline]
    fn slot_ptr(&self, slot: SlotId) -> *mut u8 {
        debug_assert!(slot < self.capacity);
        // SAFETY: slot < capacity, so the offset stays inside the reservation
        unsafe { self.base.as_ptr().add(slot as usize * self.page_size) }
    }

    /// Take a free slot and record `owner` as its resident page.
    ///
    /// Returns the slot's base address, or None when the region is full.
    pub fn allocate_slot(&self, owner: PageId) -> Option<NonNull<u8>> {
        let slot = self.free_slots.lock().pop()?;
        let ptr = self.slot_ptr(slot);

        if self.protect_free_slots {
            // SAFETY: ptr spans exactly one slot inside our mapping
            let rc = unsafe {
                libc::mprotect(
                    ptr as *mut libc::c_void,
                    self.page_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            debug_assert_eq!(rc, 0, "mprotect(RW) failed");
        }

        self.slot_owner[slot as usize].store(owner.to_raw(), Ordering::Release);
        self.slots_in_use.fetch_add(1, Ordering::Relaxed);
        NonNull::new(ptr)
    }

    /// Return a slot to the free list.
    pub fn free_slot(&self, ptr: NonNull<u8>) {
        let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        debug_assert_eq!(offset % self.page_size, 0, "free_slot on interior pointer");
        let slot = (offset / self.page_size) as SlotId;
        debug_assert!(slot < self.capacity);

        self.slot_owner[slot as usize].store(INVALID_PAGE_ID.to_raw(), Ordering::Release);

        if self.protect_free_slots {
            // SAFETY: the slot is no longer owned; trap stray accesses
            let rc = unsafe {
                libc::mprotect(ptr.as_ptr() as *mut libc::c_void, self.page_size, libc::PROT_NONE)
            };
            debug_assert_eq!(rc, 0, "mprotect(NONE) failed");
        }

        self.free_slots.lock().push(slot);
        self.slots_in_use.fetch_sub(1, Ordering::Relaxed);
    }

    /// Whether `ptr` points into this region's reservation
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.capacity as usize * self.page_size
    }

    /// Resolve a raw address inside this region back to its owning page and
    /// the byte offset within it. Returns None for free slots.
    pub fn unswizzle(&self, ptr: *const u8) -> Option<(PageId, usize)> {
        if !self.contains(ptr) {
            return None;
        }
        let offset = ptr as usize - self.base.as_ptr() as usize;
        let slot = offset / self.page_size;
        let owner = PageId::from_raw(self.slot_owner[slot].load(Ordering::Acquire));
        if owner.is_valid() {
            Some((owner, offset % self.page_size))
        } else {
            None
        }
    }

    /// Slot size in bytes
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total number of slots
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Currently allocated slots
    #[inline]
    pub fn slots_in_use(&self) -> usize {
        self.slots_in_use.load(Ordering::Relaxed)
    }

    /// Advisory NUMA node tag
    #[inline]
    pub fn numa_node(&self) -> Option<u32> {
        self.numa_node
    }
}

impl Drop for VolatileRegion {
    fn drop(&mut self) {
        if self.capacity == 0 {
            return;
        }
        // SAFETY: base/total match the original mmap
        unsafe {
            libc::munmap(
                self.base.as_ptr() as *mut libc::c_void,
                self.capacity as usize * self.page_size,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::page_id::{PageSizeType, BASE_PAGE_SIZE};

    fn page(index: u64) -> PageId {
        PageId::new(PageSizeType::KiB4, index)
    }

    #[test]
    fn test_allocate_and_free() {
        let region = VolatileRegion::new(BASE_PAGE_SIZE, 4, false, None).unwrap();
        assert_eq!(region.slots_in_use(), 0);

        let a = region.allocate_slot(page(0)).unwrap();
        let b = region.allocate_slot(page(1)).unwrap();
        assert_ne!(a, b);
        assert_eq!(region.slots_in_use(), 2);

        region.free_slot(a);
        assert_eq!(region.slots_in_use(), 1);

        // Freed slot is reusable
        let c = region.allocate_slot(page(2)).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_region_exhaustion() {
        let region = VolatileRegion::new(BASE_PAGE_SIZE, 2, false, None).unwrap();
        let _a = region.allocate_slot(page(0)).unwrap();
        let _b = region.allocate_slot(page(1)).unwrap();
        assert!(region.allocate_slot(page(2)).is_none());
    }

    #[test]
    fn test_slots_are_writable_and_stable() {
        let region = VolatileRegion::new(BASE_PAGE_SIZE, 2, false, None).unwrap();
        let slot = region.allocate_slot(page(0)).unwrap();

        unsafe {
            std::ptr::write_bytes(slot.as_ptr(), 0x5A, BASE_PAGE_SIZE);
            assert_eq!(*slot.as_ptr().add(100), 0x5A);
        }
    }

    #[test]
    fn test_unswizzle() {
        let region = VolatileRegion::new(BASE_PAGE_SIZE, 4, false, None).unwrap();
        let owner = page(7);
        let slot = region.allocate_slot(owner).unwrap();

        let interior = unsafe { slot.as_ptr().add(123) };
        let (resolved, offset) = region.unswizzle(interior).unwrap();
        assert_eq!(resolved, owner);
        assert_eq!(offset, 123);

        // Outside pointer resolves to nothing
        let outside = [0u8; 8];
        assert!(region.unswizzle(outside.as_ptr()).is_none());

        // Freed slot resolves to nothing
        region.free_slot(slot);
        assert!(region.unswizzle(slot.as_ptr()).is_none());
    }

    #[test]
    fn test_mprotect_hardening_allocates_rw() {
        let region = VolatileRegion::new(BASE_PAGE_SIZE, 2, true, None).unwrap();
        let slot = region.allocate_slot(page(0)).unwrap();
        unsafe {
            std::ptr::write_bytes(slot.as_ptr(), 1, BASE_PAGE_SIZE);
        }
        region.free_slot(slot);
    }
}
