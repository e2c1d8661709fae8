//! Physical Memory Access
//!
//! The boot memory map handed over by the loader, and the kernel's window
//! onto physical frames.
//!
//! # Boot handoff
//!
//! The loader passes a table of physical regions (UEFI memory types) and the
//! ranges it preallocated for kernel arguments. [`BootInfo`] carries both;
//! the PFN database seeds itself from it.
//!
//! # Physical page mapper
//!
//! Page contents are reached through [`PhysicalPageMapper`]. On x86_64 the
//! kernel keeps all of RAM mapped at a fixed offset ([`DirectMapMapper`]);
//! the host simulation backs frames with heap memory.

use alloc::vec::Vec;
use core::ptr;

use super::pfn::{Pfn, PAGE_SIZE};

/// Physical memory region types (from UEFI memory map)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MmMemoryType {
    /// Reserved by firmware
    Reserved = 0,
    /// Loader code (can be reclaimed)
    LoaderCode = 1,
    /// Loader data (can be reclaimed)
    LoaderData = 2,
    /// Boot services code (can be reclaimed after ExitBootServices)
    BootServicesCode = 3,
    /// Boot services data (can be reclaimed after ExitBootServices)
    BootServicesData = 4,
    /// Runtime services code (must be preserved)
    RuntimeServicesCode = 5,
    /// Runtime services data (must be preserved)
    RuntimeServicesData = 6,
    /// Conventional (usable) memory
    Conventional = 7,
    /// Unusable memory
    Unusable = 8,
    /// ACPI reclaimable memory
    AcpiReclaim = 9,
    /// ACPI NVS memory
    AcpiNvs = 10,
    /// Memory-mapped I/O
    Mmio = 11,
    /// Memory-mapped I/O port space
    MmioPortSpace = 12,
    /// Processor reserved memory
    PalCode = 13,
    /// Persistent memory
    Persistent = 14,
}

impl MmMemoryType {
    /// Check if this memory type is usable for allocation
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            MmMemoryType::LoaderCode
                | MmMemoryType::LoaderData
                | MmMemoryType::BootServicesCode
                | MmMemoryType::BootServicesData
                | MmMemoryType::Conventional
        )
    }
}

/// Memory region descriptor
#[derive(Debug, Clone, Copy)]
pub struct MmMemoryRegion {
    /// Physical start address
    pub physical_start: u64,
    /// Number of pages
    pub page_count: u64,
    /// Memory type
    pub memory_type: MmMemoryType,
}

impl MmMemoryRegion {
    pub const fn new(physical_start: u64, page_count: u64, memory_type: MmMemoryType) -> Self {
        Self {
            physical_start,
            page_count,
            memory_type,
        }
    }

    /// Get the physical end address
    pub fn physical_end(&self) -> u64 {
        self.physical_start + self.page_count * PAGE_SIZE as u64
    }

    pub fn first_pfn(&self) -> Pfn {
        (self.physical_start / PAGE_SIZE as u64) as Pfn
    }

    pub fn end_pfn(&self) -> Pfn {
        self.first_pfn() + self.page_count as Pfn
    }
}

/// Physical range preallocated by the loader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelArgsRange {
    pub physical_start: u64,
    pub page_count: u64,
}

/// Boot handoff consumed by the memory manager
#[derive(Debug, Clone, Default)]
pub struct BootInfo {
    /// Physical memory map
    pub memory_map: Vec<MmMemoryRegion>,
    /// Pages in use by the kernel image, boot stacks and loader data
    pub kernel_args: Vec<KernelArgsRange>,
}

impl BootInfo {
    /// Lowest and one-past-highest frame described by the memory map
    pub fn frame_bounds(&self) -> (Pfn, Pfn) {
        let low = self.memory_map.iter().map(|r| r.first_pfn()).min().unwrap_or(0);
        let high = self.memory_map.iter().map(|r| r.end_pfn()).max().unwrap_or(0);
        (low, high.max(low))
    }

    /// Is `pfn` inside a preallocated kernel-args range?
    pub fn is_kernel_args(&self, pfn: Pfn) -> bool {
        let addr = pfn as u64 * PAGE_SIZE as u64;
        self.kernel_args.iter().any(|r| {
            addr >= r.physical_start && addr < r.physical_start + r.page_count * PAGE_SIZE as u64
        })
    }
}

/// Access to the contents of physical frames
///
/// # Safety
///
/// `page_ptr` must return a pointer to `PAGE_SIZE` bytes that stay valid and
/// exclusively describe frame `pfn` for the lifetime of the mapper.
pub unsafe trait PhysicalPageMapper: Send + Sync {
    /// Kernel-virtual pointer to the first byte of frame `pfn`
    fn page_ptr(&self, pfn: Pfn) -> *mut u8;
}

/// All of physical memory mapped linearly at `base`
pub struct DirectMapMapper {
    base: u64,
}

impl DirectMapMapper {
    /// # Safety
    ///
    /// Every frame the PFN database manages must be mapped at
    /// `base + pfn * PAGE_SIZE`.
    pub const unsafe fn new(base: u64) -> Self {
        Self { base }
    }
}

unsafe impl PhysicalPageMapper for DirectMapMapper {
    fn page_ptr(&self, pfn: Pfn) -> *mut u8 {
        (self.base + (pfn as u64) * PAGE_SIZE as u64) as *mut u8
    }
}

// ============================================================================
// Page content helpers
// ============================================================================

/// Fill a frame with zeroes
pub fn mm_zero_page(mapper: &dyn PhysicalPageMapper, pfn: Pfn) {
    // Safety: the mapper contract guarantees PAGE_SIZE valid bytes
    unsafe { ptr::write_bytes(mapper.page_ptr(pfn), 0, PAGE_SIZE) }
}

/// Copy the contents of `source` into `target`
pub fn mm_copy_page(mapper: &dyn PhysicalPageMapper, source: Pfn, target: Pfn) {
    if source == target {
        return;
    }
    // Safety: distinct frames never overlap
    unsafe {
        ptr::copy_nonoverlapping(mapper.page_ptr(source), mapper.page_ptr(target), PAGE_SIZE)
    }
}

/// Read bytes from a frame starting at `offset`
pub fn mm_read_page(mapper: &dyn PhysicalPageMapper, pfn: Pfn, offset: usize, buffer: &mut [u8]) {
    let len = buffer.len().min(PAGE_SIZE.saturating_sub(offset));
    // Safety: bounds clamped to the frame
    unsafe { ptr::copy_nonoverlapping(mapper.page_ptr(pfn).add(offset), buffer.as_mut_ptr(), len) }
}

/// Write bytes into a frame starting at `offset`
pub fn mm_write_page(mapper: &dyn PhysicalPageMapper, pfn: Pfn, offset: usize, data: &[u8]) {
    let len = data.len().min(PAGE_SIZE.saturating_sub(offset));
    // Safety: bounds clamped to the frame
    unsafe { ptr::copy_nonoverlapping(data.as_ptr(), mapper.page_ptr(pfn).add(offset), len) }
}

/// Run `f` on the whole frame as a mutable byte slice
///
/// The caller must own the frame (freshly allocated, or held under the
/// lock of the cache that owns it).
pub fn mm_with_page_mut<R>(
    mapper: &dyn PhysicalPageMapper,
    pfn: Pfn,
    f: impl FnOnce(&mut [u8]) -> R,
) -> R {
    // Safety: the mapper contract guarantees PAGE_SIZE valid bytes and the
    // caller guarantees nobody else writes the frame meanwhile
    let page = unsafe { core::slice::from_raw_parts_mut(mapper.page_ptr(pfn), PAGE_SIZE) };
    f(page)
}

/// Run `f` on the whole frame as a byte slice
pub fn mm_with_page<R>(mapper: &dyn PhysicalPageMapper, pfn: Pfn, f: impl FnOnce(&[u8]) -> R) -> R {
    // Safety: see mm_with_page_mut
    let page = unsafe { core::slice::from_raw_parts(mapper.page_ptr(pfn), PAGE_SIZE) };
    f(page)
}

/// Read one 64-bit page-table entry
pub fn mm_read_entry(mapper: &dyn PhysicalPageMapper, table: Pfn, index: usize) -> u64 {
    debug_assert!(index < PAGE_SIZE / 8);
    // Safety: index is inside the frame and entries are naturally aligned
    unsafe { ptr::read_volatile((mapper.page_ptr(table) as *const u64).add(index)) }
}

/// Write one 64-bit page-table entry
pub fn mm_write_entry(mapper: &dyn PhysicalPageMapper, table: Pfn, index: usize, value: u64) {
    debug_assert!(index < PAGE_SIZE / 8);
    // Safety: index is inside the frame and entries are naturally aligned
    unsafe { ptr::write_volatile((mapper.page_ptr(table) as *mut u64).add(index), value) }
}
