//! Translation Maps
//!
//! A translation map owns the hardware page tables of one address space.
//! The memory manager talks to it only through [`TranslationMap`]; each
//! architecture provides one implementation, chosen at build time as
//! [`ArchTranslationMap`].
//!
//! # Locking
//!
//! Every map has a recursive lock. Single operations take it internally;
//! callers that need several edits to appear together hold it across them
//! with a [`MapLock`]. TLB invalidations are batched while the lock is held
//! and delivered when the outermost hold is released, or earlier through
//! [`TranslationMap::flush`]. Only after that is an unmap guaranteed to be
//! visible on every CPU.

use bitflags::bitflags;

use super::error::MmResult;
use super::pfn::{MmReservation, Pfn, PAGE_SHIFT};
use super::tlb::ShootdownCounts;
use crate::ke::cpu::{CpuId, CpuSet};

/// Translation map of the architecture the kernel is built for
pub type ArchTranslationMap = super::x86_paging::X86TranslationMap;

bitflags! {
    /// Attributes of a single page mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapAttributes: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Reachable from user mode
        const USER = 1 << 3;
        /// Survives address-space switches
        const GLOBAL = 1 << 4;
        const UNCACHED = 1 << 5;
        /// Read-only mapping of a page a source cache owns
        const COPY_ON_WRITE = 1 << 6;
    }
}

/// State of one mapped page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    pub physical: u64,
    pub attributes: MapAttributes,
    pub accessed: bool,
    pub modified: bool,
}

impl PageQuery {
    #[inline]
    pub fn pfn(&self) -> Pfn {
        (self.physical >> PAGE_SHIFT) as Pfn
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.attributes.contains(MapAttributes::WRITE)
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        self.attributes.contains(MapAttributes::GLOBAL)
    }
}

/// Why an emulated access did not translate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationFault {
    NotPresent,
    Protection,
}

/// Architecture page tables of one address space
pub trait TranslationMap: Send + Sync {
    /// Take the map lock (recursive)
    fn lock(&self);

    /// Release the map lock; the outermost release flushes pending
    /// invalidations
    fn unlock(&self);

    /// Map `physical` at `virt_addr`, drawing page tables from
    /// `reservation`. Replaces an existing mapping.
    fn map(
        &self,
        virt_addr: u64,
        physical: u64,
        attributes: MapAttributes,
        reservation: &mut MmReservation<'_>,
    ) -> MmResult<()>;

    /// Remove every mapping in `[start, end)`. Returns the number removed.
    fn unmap(&self, start: u64, end: u64) -> MmResult<usize>;

    /// Remove one mapping, returning what it was
    fn unmap_page(&self, virt_addr: u64) -> Option<PageQuery>;

    /// Change the attributes of every mapping in `[start, end)`
    fn protect(&self, start: u64, end: u64, attributes: MapAttributes) -> MmResult<()>;

    /// Change the attributes of one mapping. Returns false if unmapped.
    fn protect_page(&self, virt_addr: u64, attributes: MapAttributes) -> bool;

    fn query(&self, virt_addr: u64) -> Option<PageQuery>;

    /// Clear the accessed and dirty bits of a mapping, returning the entry
    /// as it was before
    fn clear_accessed_and_modified(&self, virt_addr: u64) -> Option<PageQuery>;

    /// Walk the tables the way the MMU does for a data access: check
    /// permissions and set the accessed (and dirty) bits. Returns the
    /// physical address.
    fn translate_access(&self, virt_addr: u64, write: bool, user: bool)
        -> Result<u64, TranslationFault>;

    /// Deliver pending invalidations now
    fn flush(&self);

    /// Upper bound of page-table pages `map` may need for `[start, end)`
    fn max_pages_needed_to_map(&self, start: u64, end: u64) -> usize;

    fn set_active_on_cpu(&self, cpu: CpuId, active: bool);

    /// CPUs that currently have this map loaded
    fn active_cpus(&self) -> CpuSet;

    fn mapped_page_count(&self) -> usize;

    /// Physical address of the top-level table
    fn root_physical(&self) -> u64;

    fn is_kernel(&self) -> bool;

    fn shootdown_counts(&self) -> ShootdownCounts;
}

/// Scoped hold of a map lock
pub struct MapLock<'a> {
    map: &'a dyn TranslationMap,
}

impl<'a> MapLock<'a> {
    pub fn new(map: &'a dyn TranslationMap) -> Self {
        map.lock();
        Self { map }
    }
}

impl Drop for MapLock<'_> {
    fn drop(&mut self) {
        self.map.unlock();
    }
}
