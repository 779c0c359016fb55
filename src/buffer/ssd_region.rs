/// SSD region - durable backing store for buffer pool pages.
///
/// The backing file (or block device) is divided into one fixed byte range
/// per size class; a page occupies `[class_base + index * size, ... + size)`.
/// Reads and writes are size-aligned, blocking, and use positional I/O so the
/// region needs no seek state. The file is opened with `O_DIRECT` where the
/// filesystem supports it; buffers handed in must therefore be aligned to the
/// device boundary (volatile-region slots always are).

use crate::buffer::page_id::{PageId, PageSizeType};
use crate::error::{DbError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Durable block store addressed by `PageId`
pub struct SsdRegion {
    file: File,

    /// Byte offset where each size class region starts
    class_base: [u64; PageSizeType::COUNT],

    /// Maximum number of pages per size class
    pages_per_class: u64,

    /// Whether the file was opened with O_DIRECT
    direct_io: bool,

    // I/O statistics
    reads: AtomicU64,
    writes: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl SsdRegion {
    /// Open or create the backing store at `path` with room for
    /// `pages_per_class` pages in every size class.
    pub fn open(path: &Path, pages_per_class: u64) -> Result<Self> {
        let mut class_base = [0u64; PageSizeType::COUNT];
        let mut offset = 0u64;
        for class in PageSizeType::ALL {
            class_base[class.index()] = offset;
            offset += pages_per_class * class.size() as u64;
        }

        let (file, direct_io) = Self::open_file(path)?;
        file.set_len(offset)?;

        Ok(Self {
            file,
            class_base,
            pages_per_class,
            direct_io,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        })
    }

    /// Try O_DIRECT first; some filesystems (notably tmpfs) reject it, in
    /// which case we fall back to buffered I/O.
    fn open_file(path: &Path) -> Result<(File, bool)> {
        let direct = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .custom_flags(libc::O_DIRECT)
            .open(path);

        match direct {
            Ok(file) => Ok((file, true)),
            Err(_) => {
                tracing::warn!(
                    path = %path.display(),
                    "filesystem rejected O_DIRECT, falling back to buffered I/O"
                );
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .open(path)?;
                Ok((file, false))
            }
        }
    }

    #[inline]
    fn byte_offset(&self, page_id: PageId) -> u64 {
        debug_assert!(page_id.is_valid());
        debug_assert!(page_id.page_index() < self.pages_per_class, "page index beyond SSD region");
        self.class_base[page_id.size_type().index()]
            + page_id.page_index() * page_id.size_bytes() as u64
    }

    /// Copy the on-disk bytes of `page_id` into `dst`.
    ///
    /// `dst` must be exactly one page of the id's size class and aligned to
    /// the direct-I/O boundary.
    pub fn read_page(&self, page_id: PageId, dst: &mut [u8]) -> Result<()> {
        debug_assert_eq!(dst.len(), page_id.size_bytes());
        let offset = self.byte_offset(page_id);
        self.file.read_exact_at(dst, offset).map_err(DbError::Io)?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(dst.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Durably write `src` to the slot for `page_id`.
    pub fn write_page(&self, page_id: PageId, src: &[u8]) -> Result<()> {
        debug_assert_eq!(src.len(), page_id.size_bytes());
        let offset = self.byte_offset(page_id);
        self.file.write_all_at(src, offset).map_err(DbError::Io)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(src.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Maximum number of pages per size class
    #[inline]
    pub fn pages_per_class(&self) -> u64 {
        self.pages_per_class
    }

    /// Whether direct I/O is active
    #[inline]
    pub fn is_direct(&self) -> bool {
        self.direct_io
    }

    /// Total pages read since open
    #[inline]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Total pages written since open
    #[inline]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Total bytes transferred (read, written)
    pub fn bytes_transferred(&self) -> (u64, u64) {
        (
            self.bytes_read.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::page_id::BASE_PAGE_SIZE;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    // Page-aligned scratch buffer; direct I/O rejects unaligned addresses
    struct AlignedBuf {
        ptr: *mut u8,
        layout: Layout,
    }

    impl AlignedBuf {
        fn new(len: usize) -> Self {
            let layout = Layout::from_size_align(len, BASE_PAGE_SIZE).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }

        fn as_slice(&self) -> &[u8] {
            unsafe { std::slice::from_raw_parts(self.ptr, self.layout.size()) }
        }

        fn as_mut_slice(&mut self) -> &mut [u8] {
            unsafe { std::slice::from_raw_parts_mut(self.ptr, self.layout.size()) }
        }
    }

    impl Drop for AlignedBuf {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    fn temp_region(pages_per_class: u64) -> (tempfile::TempDir, SsdRegion) {
        let dir = tempfile::tempdir().unwrap();
        let region = SsdRegion::open(&dir.path().join("pages.db"), pages_per_class).unwrap();
        (dir, region)
    }

    #[test]
    fn test_roundtrip_smallest_class() {
        let (_dir, region) = temp_region(16);
        let id = PageId::new(PageSizeType::KiB4, 3);

        let mut src = AlignedBuf::new(BASE_PAGE_SIZE);
        for (i, byte) in src.as_mut_slice().iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        region.write_page(id, src.as_slice()).unwrap();

        let mut dst = AlignedBuf::new(BASE_PAGE_SIZE);
        region.read_page(id, dst.as_mut_slice()).unwrap();
        assert_eq!(src.as_slice(), dst.as_slice());
        assert_eq!(region.read_count(), 1);
        assert_eq!(region.write_count(), 1);
    }

    #[test]
    fn test_classes_do_not_overlap() {
        let (_dir, region) = temp_region(4);
        let small = PageId::new(PageSizeType::KiB4, 3);
        let large = PageId::new(PageSizeType::KiB8, 0);

        let mut a = AlignedBuf::new(small.size_bytes());
        a.as_mut_slice().fill(0xAA);
        let mut b = AlignedBuf::new(large.size_bytes());
        b.as_mut_slice().fill(0xBB);
        region.write_page(small, a.as_slice()).unwrap();
        region.write_page(large, b.as_slice()).unwrap();

        let mut buf = AlignedBuf::new(small.size_bytes());
        region.read_page(small, buf.as_mut_slice()).unwrap();
        assert!(buf.as_slice().iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_overwrite_in_place() {
        let (_dir, region) = temp_region(4);
        let id = PageId::new(PageSizeType::KiB16, 1);

        let mut buf = AlignedBuf::new(id.size_bytes());
        buf.as_mut_slice().fill(1);
        region.write_page(id, buf.as_slice()).unwrap();
        buf.as_mut_slice().fill(2);
        region.write_page(id, buf.as_slice()).unwrap();

        let mut out = AlignedBuf::new(id.size_bytes());
        region.read_page(id, out.as_mut_slice()).unwrap();
        assert!(out.as_slice().iter().all(|&b| b == 2));
    }
}
