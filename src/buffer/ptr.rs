//! Buffer-managed pointer - a relocatable `{PageId, offset}` reference.
//!
//! A [`BufferPtr`] is a plain value: copying, comparing, and arithmetic
//! never consult the buffer manager. Only resolution does, by pinning the
//! page (faulting it in if evicted) and adding the byte offset to the
//! frame's current slot address. Addresses may change across evictions;
//! the pair stays valid, which is what lets column storage be swizzled
//! in and out of memory.
//!
//! Because volatile slots are never shared between pages, two valid
//! pointers resolve to the same address exactly when their pairs are
//! equal, so equality and ordering derive on the pair.

use crate::buffer::manager::{BufferManager, PinGuard};
use crate::buffer::page_id::{PageId, INVALID_PAGE_ID};
use crate::error::{DbError, Result};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

/// Typed pointer into buffer-managed storage
pub struct BufferPtr<T> {
    page_id: PageId,
    offset: u32,
    _marker: PhantomData<*mut T>,
}

// Manual impls: a derive would demand T: Clone/Copy, but the pointer is a
// value regardless of the pointee.
impl<T> Clone for BufferPtr<T> {
    #[inline(always)]
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for BufferPtr<T> {}

impl<T> PartialEq for BufferPtr<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.page_id == other.page_id && self.offset == other.offset
    }
}
impl<T> Eq for BufferPtr<T> {}

impl<T> PartialOrd for BufferPtr<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl<T> Ord for BufferPtr<T> {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.page_id, self.offset).cmp(&(other.page_id, other.offset))
    }
}

impl<T> std::hash::Hash for BufferPtr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.page_id.hash(state);
        self.offset.hash(state);
    }
}

// The pair is plain data; sending it between threads is safe regardless
// of the pointee type.
unsafe impl<T> Send for BufferPtr<T> {}
unsafe impl<T> Sync for BufferPtr<T> {}

impl<T> BufferPtr<T> {
    #[inline]
    pub fn new(page_id: PageId, offset: u32) -> Self {
        // One-past-the-end is legal for iteration; dereferencing it is not
        debug_assert!(
            !page_id.is_valid() || (offset as usize) <= page_id.size_bytes(),
            "offset beyond page bounds"
        );
        Self { page_id, offset, _marker: PhantomData }
    }

    /// The null pointer: invalid page, zero offset
    #[inline]
    pub fn null() -> Self {
        Self { page_id: INVALID_PAGE_ID, offset: 0, _marker: PhantomData }
    }

    #[inline(always)]
    pub fn is_null(&self) -> bool {
        !self.page_id.is_valid()
    }

    #[inline(always)]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Byte offset within the page
    #[inline(always)]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Advance by `count` elements of `T` (no manager consultation)
    #[inline]
    pub fn add(self, count: usize) -> Self {
        self.byte_add(count * std::mem::size_of::<T>())
    }

    /// Step back by `count` elements of `T`
    #[inline]
    pub fn sub(self, count: usize) -> Self {
        self.byte_sub(count * std::mem::size_of::<T>())
    }

    /// Advance by raw bytes
    #[inline]
    pub fn byte_add(self, bytes: usize) -> Self {
        Self::new(self.page_id, self.offset + bytes as u32)
    }

    /// Step back by raw bytes
    #[inline]
    pub fn byte_sub(self, bytes: usize) -> Self {
        debug_assert!(bytes as u32 <= self.offset, "pointer underflow");
        Self::new(self.page_id, self.offset - bytes as u32)
    }

    /// Element distance to `other`, which must lie in the same page
    #[inline]
    pub fn offset_from(self, other: Self) -> isize {
        debug_assert_eq!(self.page_id, other.page_id, "offset_from across pages");
        (self.offset as isize - other.offset as isize) / std::mem::size_of::<T>() as isize
    }

    /// Reinterpret the pointee type, keeping the location
    #[inline]
    pub fn cast<U>(self) -> BufferPtr<U> {
        BufferPtr { page_id: self.page_id, offset: self.offset, _marker: PhantomData }
    }

    /// Pin the page and resolve to a raw address, valid until the
    /// matching [`BufferManager::unpin`]. Null pointers resolve to null
    /// without touching the manager.
    pub fn resolve(self, manager: &BufferManager) -> Result<*mut T> {
        if self.is_null() {
            return Ok(std::ptr::null_mut());
        }
        let base = manager.get_page(self.page_id)?;
        // SAFETY: offset is within the page per the constructor invariant
        Ok(unsafe { base.add(self.offset as usize) } as *mut T)
    }

    /// Scoped resolution: the page stays pinned while the guard lives
    pub fn pin(self, manager: &BufferManager) -> Result<PinnedRef<'_, T>> {
        if self.is_null() {
            return Err(DbError::InvalidArgument("pin of null BufferPtr".to_string()));
        }
        let guard = manager.pin(self.page_id)?;
        Ok(PinnedRef { guard, offset: self.offset as usize, _marker: PhantomData })
    }
}

impl<T> Default for BufferPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for BufferPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferPtr({:?}+{})", self.page_id, self.offset)
    }
}

/// Pinned view of a `BufferPtr<T>` target
pub struct PinnedRef<'a, T> {
    guard: PinGuard<'a>,
    offset: usize,
    _marker: PhantomData<*mut T>,
}

impl<T> PinnedRef<'_, T> {
    /// Raw address of the target (valid while the guard lives)
    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        // SAFETY: offset is within the page per the pointer invariant
        unsafe { self.guard.as_ptr().add(self.offset) as *mut T }
    }

    /// View `len` consecutive elements starting at the target
    #[inline]
    pub fn as_slice(&self, len: usize) -> &[T] {
        debug_assert!(
            self.offset + len * std::mem::size_of::<T>() <= self.guard.page_id().size_bytes(),
            "slice beyond page bounds"
        );
        // SAFETY: bounds checked above; the pin keeps the slot alive
        unsafe { std::slice::from_raw_parts(self.as_ptr(), len) }
    }

    /// Mutable view of `len` consecutive elements; marks the page dirty
    #[inline]
    pub fn as_mut_slice(&mut self, len: usize) -> &mut [T] {
        debug_assert!(
            self.offset + len * std::mem::size_of::<T>() <= self.guard.page_id().size_bytes(),
            "slice beyond page bounds"
        );
        let ptr = self.as_ptr();
        self.guard.data_mut();
        // SAFETY: bounds checked above; the pin keeps the slot alive
        unsafe { std::slice::from_raw_parts_mut(ptr, len) }
    }
}

impl<T> Deref for PinnedRef<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the pin keeps the slot alive; offset invariant holds
        unsafe { &*self.as_ptr() }
    }
}

impl<T> DerefMut for PinnedRef<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.guard.data_mut();
        // SAFETY: the pin keeps the slot alive; offset invariant holds
        unsafe { &mut *self.as_ptr() }
    }
}

/// Storage allocator handle over a shared buffer manager.
///
/// Column containers are parameterized over this and therefore live
/// inside buffer-pool pages.
#[derive(Clone)]
pub struct BufferPoolAllocator {
    manager: std::sync::Arc<BufferManager>,
}

impl BufferPoolAllocator {
    pub fn new(manager: std::sync::Arc<BufferManager>) -> Self {
        Self { manager }
    }

    pub fn allocate(&self, size: usize, align: usize) -> Result<BufferPtr<u8>> {
        self.manager.allocate(size, align)
    }

    pub fn deallocate(&self, ptr: BufferPtr<u8>, size: usize, align: usize) {
        self.manager.deallocate(ptr, size, align)
    }

    pub fn manager(&self) -> &std::sync::Arc<BufferManager> {
        &self.manager
    }
}
