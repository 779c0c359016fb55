//! # Tiered Buffer Pool
//!
//! Page-granular, multi-sized, tiered cache backing all column storage:
//!
//! - **Stable identity**: packed [`PageId`] values encode size class and
//!   per-class index; they survive eviction
//! - **Multi-sized pages**: nine size classes from 4KB to 1MB, each with
//!   its own volatile slab and SSD range
//! - **Lock-free residency**: one CAS word per frame arbitrates pinning,
//!   eviction, and write-back
//! - **Tiered memory**: DRAM tier, optional NUMA second tier, SSD region;
//!   a configurable migration policy moves pages between them
//! - **Relocatable pointers**: [`BufferPtr`] values address storage by
//!   `{page, offset}` and resolve through the manager on dereference
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Buffer Manager                         │
//! │                                                             │
//! │  ┌────────────┐  ┌────────────┐  ┌──────────────────┐       │
//! │  │ Page Table │  │   Frames   │  │  Eviction Queue  │       │
//! │  │(Partitioned│  │ (CAS state │  │ (FIFO, version-  │       │
//! │  │  hash map) │  │  machine)  │  │   validated)     │       │
//! │  └────────────┘  └────────────┘  └──────────────────┘       │
//! │                                                             │
//! │  ┌──────────────────────────┐  ┌──────────────────────────┐ │
//! │  │  DRAM volatile regions   │  │  NUMA volatile regions   │ │
//! │  │  (one slab per class)    │  │  (optional second tier)  │ │
//! │  └──────────────────────────┘  └──────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                       ┌────────────┐
//!                       │ SSD region │
//!                       │ (direct,   │
//!                       │  aligned)  │
//!                       └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use basalt::buffer::{BufferManagerBuilder, PageSizeType};
//!
//! # fn example() -> basalt::Result<()> {
//! let manager = BufferManagerBuilder::new()
//!     .dram_pool_size(64 * 1024 * 1024)
//!     .ssd_path("pages.db")
//!     .build()?;
//!
//! // Storage obtains memory through the allocator facade
//! let ptr = manager.allocate(1024, 8)?;
//!
//! // Dereferencing pins the page (read-through on a miss)
//! let mut pinned = ptr.pin(&manager)?;
//! pinned.as_mut_slice(1024).fill(42);
//! drop(pinned);
//!
//! manager.deallocate(ptr, 1024, 8);
//! # Ok(())
//! # }
//! ```

pub mod eviction;
pub mod frame;
pub mod manager;
pub mod page_id;
pub mod page_table;
pub mod ptr;
pub mod ssd_region;
pub mod volatile;

pub use eviction::{EvictionCandidate, EvictionQueue};
pub use frame::{Frame, FrameState, MemoryTier, StateSnapshot};
pub use manager::{
    BufferManager, BufferManagerBuilder, BufferManagerConfig, BufferManagerStats,
    BufferManagerStatsSnapshot, MigrationPolicy, PinGuard,
};
pub use page_id::{PageId, PageSizeType, BASE_PAGE_SIZE, INVALID_PAGE_ID};
pub use page_table::PageTable;
pub use ptr::{BufferPoolAllocator, BufferPtr, PinnedRef};
pub use ssd_region::SsdRegion;
pub use volatile::VolatileRegion;
