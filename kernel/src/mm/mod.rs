//! Memory Manager (mm)
//!
//! The memory manager turns physical RAM into per-team virtual address
//! spaces and keeps page tables and TLBs coherent across processors:
//!
//! - **PFN Database**: state of every physical page, page-state queues and
//!   the reservation protocol (reserve may block, allocate never fails)
//! - **Translation Maps**: architecture page tables behind the
//!   [`TranslationMap`] trait, batched TLB shootdown
//! - **Caches**: reference-counted page owners chained for copy-on-write
//! - **Areas / Address Spaces**: mapped ranges of a cache in a team
//! - **Page Faults**: resolve an access through area, cache chain,
//!   allocator and map
//! - **Working Set / Low Memory**: page aging, reclaim and pressure levels
//!
//! # Address Space Layout (x86_64)
//!
//! - User space: 0x0000_0000_0001_0000 - 0x0000_7FFF_FFFF_FFFF
//! - Kernel space: 0xFFFF_8000_0000_0000 - 0xFFFF_FFFF_FFFF_FFFF
//!
//! # Lock Order
//!
//! Address space → cache chain (child to source) → translation map →
//! PFN database. Page reservations are taken before the first of these.

pub mod address;
pub mod cache;
pub mod context;
pub mod error;
pub mod fault;
pub mod lowmem;
pub mod pfn;
pub mod physical;
pub mod pte;
pub mod store;
pub mod syscall;
pub mod tlb;
pub mod translation;
pub mod vad;
pub mod ws;
pub mod x86_paging;


pub use address::{MmAddressSpace, TeamId, KERNEL_TEAM};
pub use cache::{CacheId, MmCache};
pub use context::{MmConfig, MmContext, MmCore, MmPlatform};
pub use error::{MmError, MmResult};
pub use fault::mm_access_fault;
pub use lowmem::{LowMemoryLevel, LowMemoryMonitor};
pub use pfn::{
    MmPageState, MmReservation, MmStats, PfnDatabase, Pfn, PAGE_SHIFT, PAGE_SIZE,
};
pub use physical::{BootInfo, MmMemoryRegion, MmMemoryType, PhysicalPageMapper};
pub use store::{BackingStore, MemoryStore};
pub use translation::{MapAttributes, MapLock, PageQuery, TranslationMap};
pub use vad::{AreaId, AreaInfo, AreaRequest, Placement, Protection, Sharing, Wiring};
pub use ws::PageDaemon;
pub use x86_paging::X86TranslationMap;
