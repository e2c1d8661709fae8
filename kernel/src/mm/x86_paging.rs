//! x86-64 4-Level Translation Map
//!
//! Page tables are ordinary frames from the PFN database, held Wired and
//! reached through the physical page mapper. Intermediate tables are taken
//! from the caller's reservation the first time a range needs them and are
//! freed when the map is destroyed.
//!
//! The kernel map owns the kernel half of the address space (PML4 slots
//! 256-511). Its top-level slots for the kernel range are populated at
//! creation and copied into every user map, so kernel mappings made later
//! are visible everywhere without touching user roots.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use x86_64::structures::paging::PageTableFlags;

use super::error::{MmError, MmResult};
use super::pfn::{MmPageState, MmReservation, Pfn, PfnDatabase, PAGE_SHIFT, PAGE_SIZE};
use super::physical::{mm_read_entry, mm_write_entry};
use super::pte::{
    is_kernel_address, is_user_address, pml4_index, pt_index, table_entry_flags, table_indices,
    HardwarePte, ENTRIES_PER_TABLE, KERNEL_PML4_FIRST, PTE_COPY_ON_WRITE,
};
use super::tlb::{tlb_flush_batch, InvalidationBatch, ShootdownCounts, ShootdownStats};
use super::translation::{MapAttributes, PageQuery, TranslationFault, TranslationMap};
use crate::ke::bugcheck::{codes, ke_bugcheck_ex};
use crate::ke::cpu::{CpuId, CpuServices, CpuSet, ThreadId};
use crate::ke::mutex::KMutex;

/// Bytes covered by one entry at PML4, PDPT and PD level
const LEVEL_SPAN: [u64; 3] = [1 << 39, 1 << 30, 1 << 21];

const PAGE: u64 = PAGE_SIZE as u64;

#[inline]
fn frame_address(pfn: Pfn) -> u64 {
    (pfn as u64) << PAGE_SHIFT
}

#[inline]
fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE - 1) == 0
}

struct MapState {
    batch: InvalidationBatch,
    /// Tables this map allocated (root excluded)
    tables: Vec<Pfn>,
}

/// Page tables of one address space
pub struct X86TranslationMap {
    pfn: Arc<PfnDatabase>,
    cpus: Arc<dyn CpuServices>,
    kernel: bool,
    root: Pfn,
    lock: KMutex<RefCell<MapState>>,
    active: AtomicU64,
    mapped: AtomicUsize,
    stats: ShootdownStats,
}

impl X86TranslationMap {
    /// Pages [`X86TranslationMap::new_kernel`] draws from its reservation
    pub fn kernel_map_pages(kernel_base: u64, kernel_size: u64) -> usize {
        1 + Self::kernel_pml4_slots(kernel_base, kernel_size).count()
    }

    fn kernel_pml4_slots(kernel_base: u64, kernel_size: u64) -> core::ops::RangeInclusive<usize> {
        let last = kernel_base + kernel_size.max(1) - 1;
        pml4_index(kernel_base).max(KERNEL_PML4_FIRST)..=pml4_index(last)
    }

    /// Create the kernel map
    ///
    /// Populates the top-level slots covering `[kernel_base,
    /// kernel_base + kernel_size)` so user maps can share them. The map is
    /// active on every CPU.
    pub fn new_kernel(
        pfn: Arc<PfnDatabase>,
        cpus: Arc<dyn CpuServices>,
        kernel_base: u64,
        kernel_size: u64,
        reservation: &mut MmReservation<'_>,
    ) -> Self {
        let root = reservation.allocate_page(MmPageState::Wired);
        let mut tables = Vec::new();
        for slot in Self::kernel_pml4_slots(kernel_base, kernel_size) {
            let pdpt = reservation.allocate_page(MmPageState::Wired);
            let entry = HardwarePte::new(frame_address(pdpt), table_entry_flags(false));
            mm_write_entry(pfn.mapper(), root, slot, entry.raw());
            tables.push(pdpt);
        }

        let active = CpuSet::first(cpus.cpu_count());
        log::info!(
            "[MM] kernel translation map root {:#x}, {} top-level tables",
            frame_address(root),
            tables.len()
        );

        Self {
            pfn,
            cpus,
            kernel: true,
            root,
            lock: KMutex::new(RefCell::new(MapState {
                batch: InvalidationBatch::new(),
                tables,
            })),
            active: AtomicU64::new(active.bits()),
            mapped: AtomicUsize::new(0),
            stats: ShootdownStats::new(),
        }
    }

    /// Create a user map sharing the kernel half of `kernel`
    ///
    /// Draws one page from `reservation`.
    pub fn new_user(kernel: &X86TranslationMap, reservation: &mut MmReservation<'_>) -> Self {
        let root = reservation.allocate_page(MmPageState::Wired);
        let mapper = kernel.pfn.mapper();
        for slot in KERNEL_PML4_FIRST..ENTRIES_PER_TABLE {
            let entry = mm_read_entry(mapper, kernel.root, slot);
            if entry != 0 {
                mm_write_entry(mapper, root, slot, entry);
            }
        }

        log::debug!("[MM] user translation map root {:#x}", frame_address(root));

        Self {
            pfn: kernel.pfn.clone(),
            cpus: kernel.cpus.clone(),
            kernel: false,
            root,
            lock: KMutex::new(RefCell::new(MapState {
                batch: InvalidationBatch::new(),
                tables: Vec::new(),
            })),
            active: AtomicU64::new(0),
            mapped: AtomicUsize::new(0),
            stats: ShootdownStats::new(),
        }
    }

    #[inline]
    fn thread(&self) -> ThreadId {
        self.cpus.current_thread()
    }

    /// Run `f` on the map state with the lock held
    fn locked<R>(&self, f: impl FnOnce(&mut MapState) -> R) -> R {
        self.lock();
        let result = {
            let guard = self.lock.acquire(self.thread());
            let mut state = guard.borrow_mut();
            f(&mut state)
        };
        self.unlock();
        result
    }

    fn flush_locked(&self, thread: ThreadId) {
        let guard = self.lock.acquire(thread);
        let mut state = guard.borrow_mut();
        if state.batch.is_empty() {
            return;
        }
        tlb_flush_batch(
            &*self.cpus,
            self.active_cpus(),
            self.root_physical(),
            self.kernel,
            &state.batch,
            &self.stats,
        );
        state.batch.clear();
    }

    #[inline]
    fn entry(&self, table: Pfn, index: usize) -> HardwarePte {
        HardwarePte::from_raw(mm_read_entry(self.pfn.mapper(), table, index))
    }

    #[inline]
    fn set_entry(&self, table: Pfn, index: usize, pte: HardwarePte) {
        mm_write_entry(self.pfn.mapper(), table, index, pte.raw());
    }

    /// Frame of the next-level table an entry points at
    fn next_table(&self, entry: HardwarePte, virt_addr: u64) -> Pfn {
        let next = entry.pfn();
        if entry.flags().contains(PageTableFlags::HUGE_PAGE) || !self.pfn.is_managed(next) {
            ke_bugcheck_ex(
                codes::MEMORY_MANAGEMENT,
                codes::mm_check::BAD_PAGE_TABLE_FRAME,
                virt_addr,
                entry.raw(),
                frame_address(self.root),
            );
        }
        next
    }

    /// Page table covering `virt_addr`, or the next address worth looking
    /// at if a level is missing
    fn lookup_table(&self, virt_addr: u64) -> Result<Pfn, u64> {
        let indices = table_indices(virt_addr);
        let mut table = self.root;
        for level in 0..3 {
            let entry = self.entry(table, indices[level]);
            if !entry.is_present() {
                let span = LEVEL_SPAN[level];
                return Err((virt_addr & !(span - 1)).wrapping_add(span));
            }
            table = self.next_table(entry, virt_addr);
        }
        Ok(table)
    }

    /// Page table covering `virt_addr`, creating missing levels
    fn ensure_table(
        &self,
        state: &mut MapState,
        virt_addr: u64,
        reservation: &mut MmReservation<'_>,
    ) -> Pfn {
        let indices = table_indices(virt_addr);
        let mut table = self.root;
        for &index in &indices[..3] {
            let entry = self.entry(table, index);
            table = if entry.is_present() {
                self.next_table(entry, virt_addr)
            } else {
                let new_table = reservation.allocate_page(MmPageState::Wired);
                state.tables.push(new_table);
                self.set_entry(
                    table,
                    index,
                    HardwarePte::new(frame_address(new_table), table_entry_flags(!self.kernel)),
                );
                new_table
            };
        }
        table
    }

    fn leaf_flags(&self, attributes: MapAttributes) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT;
        if attributes.contains(MapAttributes::COPY_ON_WRITE) {
            flags |= PTE_COPY_ON_WRITE;
        } else if attributes.contains(MapAttributes::WRITE) {
            flags |= PageTableFlags::WRITABLE;
        }
        if !self.kernel {
            flags |= PageTableFlags::USER_ACCESSIBLE;
        }
        if self.kernel || attributes.contains(MapAttributes::GLOBAL) {
            flags |= PageTableFlags::GLOBAL;
        }
        if !attributes.contains(MapAttributes::EXECUTE) {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        if attributes.contains(MapAttributes::UNCACHED) {
            flags |= PageTableFlags::NO_CACHE | PageTableFlags::WRITE_THROUGH;
        }
        flags
    }

    fn query_from(pte: HardwarePte) -> PageQuery {
        let mut attributes = MapAttributes::READ;
        if pte.is_writable() {
            attributes |= MapAttributes::WRITE;
        }
        if !pte.is_no_execute() {
            attributes |= MapAttributes::EXECUTE;
        }
        if pte.is_user() {
            attributes |= MapAttributes::USER;
        }
        if pte.is_global() {
            attributes |= MapAttributes::GLOBAL;
        }
        if pte.flags().contains(PageTableFlags::NO_CACHE) {
            attributes |= MapAttributes::UNCACHED;
        }
        if pte.is_copy_on_write() {
            attributes |= MapAttributes::COPY_ON_WRITE;
        }
        PageQuery {
            physical: pte.phys_addr(),
            attributes,
            accessed: pte.is_accessed(),
            modified: pte.is_dirty(),
        }
    }

    fn owns_address(&self, virt_addr: u64) -> bool {
        if self.kernel {
            is_kernel_address(virt_addr)
        } else {
            is_user_address(virt_addr)
        }
    }

    fn check_range(&self, start: u64, end: u64) -> MmResult<()> {
        if !is_page_aligned(start) || !is_page_aligned(end) || end < start {
            return Err(MmError::BadAddress);
        }
        if start != end && (!self.owns_address(start) || !self.owns_address(end - 1)) {
            return Err(MmError::BadAddress);
        }
        Ok(())
    }

    /// Clear one leaf entry and account for it
    fn clear_leaf(&self, state: &mut MapState, table: Pfn, virt_addr: u64) -> Option<PageQuery> {
        let index = pt_index(virt_addr);
        let old = self.entry(table, index);
        if !old.is_present() {
            return None;
        }
        self.set_entry(table, index, HardwarePte::empty());
        if old.is_dirty() {
            self.pfn.mark_modified(old.pfn());
        }
        self.pfn.decrement_mapping(old.pfn());
        self.mapped.fetch_sub(1, Ordering::Relaxed);
        state.batch.push(virt_addr);
        Some(Self::query_from(old))
    }

    fn protect_leaf(
        &self,
        state: &mut MapState,
        table: Pfn,
        virt_addr: u64,
        attributes: MapAttributes,
    ) -> bool {
        let index = pt_index(virt_addr);
        let old = self.entry(table, index);
        if !old.is_present() {
            return false;
        }
        let keep = old.flags() & (PageTableFlags::ACCESSED | PageTableFlags::DIRTY);
        let new = old.with_flags(self.leaf_flags(attributes) | keep);
        if new != old {
            self.set_entry(table, index, new);
            state.batch.push(virt_addr);
        }
        true
    }

    /// Visit every page table in the half this map owns
    fn for_each_leaf_table(&self, mut f: impl FnMut(Pfn)) {
        let slots = if self.kernel {
            KERNEL_PML4_FIRST..ENTRIES_PER_TABLE
        } else {
            0..KERNEL_PML4_FIRST
        };
        for slot in slots {
            let pml4e = self.entry(self.root, slot);
            if !pml4e.is_present() {
                continue;
            }
            for i in 0..ENTRIES_PER_TABLE {
                let pdpte = self.entry(pml4e.pfn(), i);
                if !pdpte.is_present() {
                    continue;
                }
                for j in 0..ENTRIES_PER_TABLE {
                    let pde = self.entry(pdpte.pfn(), j);
                    if pde.is_present() {
                        f(pde.pfn());
                    }
                }
            }
        }
    }
}

impl TranslationMap for X86TranslationMap {
    fn lock(&self) {
        self.lock.acquire_raw(self.thread());
    }

    fn unlock(&self) {
        let thread = self.thread();
        if self.lock.depth(thread) == 1 {
            self.flush_locked(thread);
        }
        self.lock.release_raw(thread);
    }

    fn map(
        &self,
        virt_addr: u64,
        physical: u64,
        attributes: MapAttributes,
        reservation: &mut MmReservation<'_>,
    ) -> MmResult<()> {
        if !is_page_aligned(physical) {
            return Err(MmError::BadAddress);
        }
        self.check_range(virt_addr, virt_addr + PAGE)?;

        self.locked(|state| {
            let table = self.ensure_table(state, virt_addr, reservation);
            let index = pt_index(virt_addr);
            let old = self.entry(table, index);
            let mut new = HardwarePte::new(physical, self.leaf_flags(attributes));

            if old.is_present() {
                state.batch.push(virt_addr);
                if old.phys_addr() == physical {
                    new.set_flags(old.flags() & (PageTableFlags::ACCESSED | PageTableFlags::DIRTY));
                    self.set_entry(table, index, new);
                    return;
                }
                if old.is_dirty() {
                    self.pfn.mark_modified(old.pfn());
                }
                self.pfn.decrement_mapping(old.pfn());
                self.mapped.fetch_sub(1, Ordering::Relaxed);
            }

            self.set_entry(table, index, new);
            self.pfn.increment_mapping(new.pfn());
            self.mapped.fetch_add(1, Ordering::Relaxed);
        });

        log::trace!("[MM] map {:#x} -> {:#x} {:?}", virt_addr, physical, attributes);
        Ok(())
    }

    fn unmap(&self, start: u64, end: u64) -> MmResult<usize> {
        self.check_range(start, end)?;
        let removed = self.locked(|state| {
            let mut removed = 0;
            let mut va = start;
            while va < end {
                match self.lookup_table(va) {
                    Ok(table) => {
                        if self.clear_leaf(state, table, va).is_some() {
                            removed += 1;
                        }
                        va += PAGE;
                    }
                    Err(next) if next > va => va = next,
                    Err(_) => break,
                }
            }
            removed
        });
        Ok(removed)
    }

    fn unmap_page(&self, virt_addr: u64) -> Option<PageQuery> {
        self.locked(|state| {
            let table = self.lookup_table(virt_addr).ok()?;
            self.clear_leaf(state, table, virt_addr)
        })
    }

    fn protect(&self, start: u64, end: u64, attributes: MapAttributes) -> MmResult<()> {
        self.check_range(start, end)?;
        self.locked(|state| {
            let mut va = start;
            while va < end {
                match self.lookup_table(va) {
                    Ok(table) => {
                        self.protect_leaf(state, table, va, attributes);
                        va += PAGE;
                    }
                    Err(next) if next > va => va = next,
                    Err(_) => break,
                }
            }
        });
        Ok(())
    }

    fn protect_page(&self, virt_addr: u64, attributes: MapAttributes) -> bool {
        self.locked(|state| match self.lookup_table(virt_addr) {
            Ok(table) => self.protect_leaf(state, table, virt_addr, attributes),
            Err(_) => false,
        })
    }

    fn query(&self, virt_addr: u64) -> Option<PageQuery> {
        self.locked(|_| {
            let table = self.lookup_table(virt_addr).ok()?;
            let pte = self.entry(table, pt_index(virt_addr));
            pte.is_present().then(|| Self::query_from(pte))
        })
    }

    fn clear_accessed_and_modified(&self, virt_addr: u64) -> Option<PageQuery> {
        self.locked(|state| {
            let table = self.lookup_table(virt_addr).ok()?;
            let index = pt_index(virt_addr);
            let mut pte = self.entry(table, index);
            if !pte.is_present() {
                return None;
            }
            let before = Self::query_from(pte);
            if before.accessed || before.modified {
                pte.clear_flags(PageTableFlags::ACCESSED | PageTableFlags::DIRTY);
                self.set_entry(table, index, pte);
                state.batch.push(virt_addr);
                if before.modified {
                    self.pfn.mark_modified(pte.pfn());
                }
            }
            Some(before)
        })
    }

    fn translate_access(
        &self,
        virt_addr: u64,
        write: bool,
        user: bool,
    ) -> Result<u64, TranslationFault> {
        self.locked(|_| {
            let indices = table_indices(virt_addr);
            let mut table = self.root;
            for (level, &index) in indices.iter().enumerate() {
                let mut entry = self.entry(table, index);
                if !entry.is_present() {
                    return Err(TranslationFault::NotPresent);
                }
                if (user && !entry.is_user()) || (write && !entry.is_writable()) {
                    return Err(TranslationFault::Protection);
                }
                if level == 3 {
                    entry.set_flags(PageTableFlags::ACCESSED);
                    if write {
                        entry.set_flags(PageTableFlags::DIRTY);
                    }
                    self.set_entry(table, index, entry);
                    return Ok(entry.phys_addr() + (virt_addr & (PAGE - 1)));
                }
                table = self.next_table(entry, virt_addr);
            }
            Err(TranslationFault::NotPresent)
        })
    }

    fn flush(&self) {
        let thread = self.thread();
        self.lock.acquire_raw(thread);
        self.flush_locked(thread);
        self.lock.release_raw(thread);
    }

    fn max_pages_needed_to_map(&self, start: u64, end: u64) -> usize {
        if end <= start {
            return 0;
        }
        let last = end - 1;
        let span = |shift: u32| ((last >> shift) - (start >> shift) + 1) as usize;
        let top = if self.kernel { 0 } else { span(39) };
        top + span(30) + span(21)
    }

    fn set_active_on_cpu(&self, cpu: CpuId, active: bool) {
        let bit = CpuSet::single(cpu).bits();
        if active {
            self.active.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.active.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    fn active_cpus(&self) -> CpuSet {
        CpuSet::from_bits(self.active.load(Ordering::Acquire))
    }

    fn mapped_page_count(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }

    fn root_physical(&self) -> u64 {
        frame_address(self.root)
    }

    fn is_kernel(&self) -> bool {
        self.kernel
    }

    fn shootdown_counts(&self) -> ShootdownCounts {
        self.stats.snapshot()
    }
}

impl Drop for X86TranslationMap {
    fn drop(&mut self) {
        let mut leaves = Vec::new();
        self.for_each_leaf_table(|table| leaves.push(table));
        for table in leaves {
            for index in 0..ENTRIES_PER_TABLE {
                let pte = self.entry(table, index);
                if pte.is_present() {
                    self.pfn.decrement_mapping(pte.pfn());
                }
            }
        }

        let state = self.lock.get_mut().get_mut();
        for &table in &state.tables {
            self.pfn.free_page(table);
        }
        self.pfn.free_page(self.root);
        log::debug!(
            "[MM] translation map {:#x} destroyed ({} tables)",
            frame_address(self.root),
            state.tables.len() + 1
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimMachine;
    use crate::mm::translation::MapLock;

    const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;
    const KERNEL_SIZE: u64 = 1 << 39;

    struct Fixture {
        machine: SimMachine,
        pfn: Arc<PfnDatabase>,
        kernel: X86TranslationMap,
    }

    fn fixture() -> Fixture {
        let machine = SimMachine::new(4, 256);
        let pfn = Arc::new(PfnDatabase::new(
            machine.boot_info(),
            machine.ram.clone(),
            machine.cpus.clone(),
            0,
        ));
        let mut res = pfn
            .reserve_pages(X86TranslationMap::kernel_map_pages(KERNEL_BASE, KERNEL_SIZE), false)
            .unwrap();
        let kernel = X86TranslationMap::new_kernel(
            pfn.clone(),
            machine.cpus.clone(),
            KERNEL_BASE,
            KERNEL_SIZE,
            &mut res,
        );
        drop(res);
        Fixture {
            machine,
            pfn,
            kernel,
        }
    }

    fn data_page(pfn: &PfnDatabase) -> Pfn {
        pfn.reserve_pages(1, false)
            .unwrap()
            .allocate_page(MmPageState::Active)
    }

    #[test]
    fn test_map_query_unmap() {
        let f = fixture();
        let mut res = f.pfn.reserve_pages(1, false).unwrap();
        let user = X86TranslationMap::new_user(&f.kernel, &mut res);
        let page = data_page(&f.pfn);
        let va = 0x40_0000;

        let need = user.max_pages_needed_to_map(va, va + PAGE);
        assert_eq!(need, 3);
        let mut res = f.pfn.reserve_pages(need, false).unwrap();
        user.map(va, frame_address(page), MapAttributes::READ | MapAttributes::WRITE, &mut res)
            .unwrap();
        assert_eq!(res.count(), 0);

        let q = user.query(va).unwrap();
        assert_eq!(q.pfn(), page);
        assert!(q.is_writable());
        assert!(q.attributes.contains(MapAttributes::USER));
        assert_eq!(f.pfn.mapping_count(page), 1);
        assert_eq!(user.mapped_page_count(), 1);

        assert_eq!(user.unmap(va, va + 4 * PAGE), Ok(1));
        assert!(user.query(va).is_none());
        assert_eq!(f.pfn.mapping_count(page), 0);
        f.pfn.free_page(page);
    }

    #[test]
    fn test_rejects_misaligned_and_wrong_half() {
        let f = fixture();
        let mut res = f.pfn.reserve_pages(4, false).unwrap();
        let user = X86TranslationMap::new_user(&f.kernel, &mut res);
        assert_eq!(
            user.map(0x1001, 0x20_0000, MapAttributes::READ, &mut res),
            Err(MmError::BadAddress)
        );
        assert_eq!(
            user.map(KERNEL_BASE, 0x20_0000, MapAttributes::READ, &mut res),
            Err(MmError::BadAddress)
        );
        assert_eq!(user.unmap(0x1000, 0x1800), Err(MmError::BadAddress));
    }

    #[test]
    fn test_kernel_half_shared_with_user_maps() {
        let f = fixture();
        let mut res = f.pfn.reserve_pages(1, false).unwrap();
        let user = X86TranslationMap::new_user(&f.kernel, &mut res);
        let page = data_page(&f.pfn);
        let va = KERNEL_BASE + 0x20_0000;

        let mut res = f.pfn.reserve_pages(3, false).unwrap();
        f.kernel
            .map(va, frame_address(page), MapAttributes::READ | MapAttributes::WRITE, &mut res)
            .unwrap();
        let q = user.query(va).unwrap();
        assert_eq!(q.pfn(), page);
        assert!(q.is_global());
        assert_eq!(
            user.translate_access(va, false, true),
            Err(TranslationFault::Protection)
        );
        assert!(user.translate_access(va, false, false).is_ok());
        f.kernel.unmap(va, va + PAGE).unwrap();
        f.pfn.free_page(page);
    }

    #[test]
    fn test_translate_access_sets_accessed_and_dirty() {
        let f = fixture();
        let mut res = f.pfn.reserve_pages(4, false).unwrap();
        let user = X86TranslationMap::new_user(&f.kernel, &mut res);
        let page = data_page(&f.pfn);
        let va = 0x1000_0000;
        user.map(va, frame_address(page), MapAttributes::READ, &mut res)
            .unwrap();

        assert_eq!(
            user.translate_access(va + 8, false, true),
            Ok(frame_address(page) + 8)
        );
        assert_eq!(
            user.translate_access(va, true, true),
            Err(TranslationFault::Protection)
        );
        assert_eq!(
            user.translate_access(va + PAGE, false, true),
            Err(TranslationFault::NotPresent)
        );

        user.protect(va, va + PAGE, MapAttributes::READ | MapAttributes::WRITE)
            .unwrap();
        user.translate_access(va, true, true).unwrap();
        let before = user.clear_accessed_and_modified(va).unwrap();
        assert!(before.accessed && before.modified);
        assert_eq!(f.pfn.page_state(page), Some(MmPageState::Modified));
        let after = user.query(va).unwrap();
        assert!(!after.accessed && !after.modified);

        user.unmap_page(va).unwrap();
        f.pfn.free_page(page);
    }

    #[test]
    fn test_flush_deferred_to_outermost_unlock() {
        let f = fixture();
        let cpus = &f.machine.cpus;
        let mut res = f.pfn.reserve_pages(4, false).unwrap();
        let user = X86TranslationMap::new_user(&f.kernel, &mut res);
        user.set_active_on_cpu(0, true);
        user.set_active_on_cpu(2, true);

        let page = data_page(&f.pfn);
        let va = 0x2000_0000;
        user.map(va, frame_address(page), MapAttributes::READ, &mut res)
            .unwrap();
        assert!(cpus.probe(2, &user, va).is_some());
        cpus.clear_shootdown_log();

        {
            let _outer = MapLock::new(&user);
            user.unmap(va, va + PAGE).unwrap();
            // stale until the outermost unlock
            assert!(cpus.probe(2, &user, va).is_some());
            assert!(cpus.shootdown_log().is_empty());
        }

        assert!(cpus.probe(2, &user, va).is_none());
        let log = cpus.shootdown_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].targets, user.active_cpus());
        assert_eq!(user.shootdown_counts().page_shootdowns, 1);
        f.pfn.free_page(page);
    }

    #[test]
    fn test_drop_returns_tables() {
        let f = fixture();
        let before = f.pfn.stats().free_total();
        {
            let mut res = f.pfn.reserve_pages(8, false).unwrap();
            let user = X86TranslationMap::new_user(&f.kernel, &mut res);
            let page = res.allocate_page(MmPageState::Active);
            user.map(0x1000, frame_address(page), MapAttributes::READ, &mut res)
                .unwrap();
            user.map(0x7F00_0000_0000, frame_address(page), MapAttributes::READ, &mut res)
                .unwrap();
            assert_eq!(f.pfn.mapping_count(page), 2);
            drop(user);
            assert_eq!(f.pfn.mapping_count(page), 0);
            f.pfn.free_page(page);
        }
        assert_eq!(f.pfn.stats().free_total(), before);
        f.pfn.validate().unwrap();
    }
}
