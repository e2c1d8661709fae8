//! Page Frame Number (PFN) Database
//!
//! The PFN database tracks the state of every physical page in the system.
//! Each entry (MMPFN) contains:
//! - Page state and the links of the state queue it sits on
//! - Number of page-table entries mapping the frame
//! - Wire count
//! - Owning cache and offset (none while free)
//!
//! # Page States
//! - Free: Available for allocation
//! - Clear: Free and zero-filled
//! - Active: Owned and recently used
//! - Inactive: Owned, aged out of the working set, reclaimable
//! - Modified: Owned and dirty, needs writeback before reclaim
//! - Wired: Pinned in memory (page tables, wired areas, boot ranges)
//! - Unused: Present in the memory map but not managed
//!
//! # Reservations
//!
//! Allocation is split in two steps. [`PfnDatabase::reserve_pages`] takes a
//! count off the unreserved pool and may block or fail; it is called before
//! any lock that must not be held while sleeping. The returned
//! [`MmReservation`] then hands out exactly that many pages and never fails.
//! Unused reservation is returned to the pool when the ticket is dropped.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, Once};

use super::cache::{CacheId, MmCache};
use super::error::{MmError, MmResult};
use super::physical::{mm_zero_page, BootInfo, PhysicalPageMapper};
use crate::ke::bugcheck::{codes, ke_bugcheck_ex};
use crate::ke::cpu::CpuServices;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Frames below 1MB are never managed (BIOS data, real-mode trampolines)
pub const LOW_MEMORY_LIMIT_PFN: Pfn = 256;

/// Physical page number
pub type Pfn = usize;

const LIST_END: u32 = u32::MAX;

/// Yields between pressure signals while a blocking reservation waits
const PRESSURE_SIGNAL_INTERVAL: usize = 64;

/// Run when a blocking reservation has to wait for pages
pub type PressureHook = Box<dyn Fn() + Send + Sync>;

/// Page states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MmPageState {
    Free = 0,
    Clear = 1,
    Active = 2,
    Inactive = 3,
    Modified = 4,
    Wired = 5,
    Unused = 6,
}

/// Number of page-state queues (every state but Unused)
const QUEUE_COUNT: usize = 6;

impl MmPageState {
    fn queue(self) -> Option<usize> {
        match self {
            MmPageState::Unused => None,
            state => Some(state as usize),
        }
    }

    /// Free or Clear
    #[inline]
    pub fn is_free(self) -> bool {
        matches!(self, MmPageState::Free | MmPageState::Clear)
    }

    /// Owned by a cache or the kernel
    #[inline]
    pub fn is_in_use(self) -> bool {
        matches!(
            self,
            MmPageState::Active | MmPageState::Inactive | MmPageState::Modified | MmPageState::Wired
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            MmPageState::Free => "Free",
            MmPageState::Clear => "Clear",
            MmPageState::Active => "Active",
            MmPageState::Inactive => "Inactive",
            MmPageState::Modified => "Modified",
            MmPageState::Wired => "Wired",
            MmPageState::Unused => "Unused",
        }
    }
}

/// Cache and offset a page belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOwner {
    pub cache: CacheId,
    pub offset: u64,
}

/// Page Frame Number database entry
#[derive(Debug, Clone, Copy)]
struct MmPfn {
    flink: u32,
    blink: u32,
    state: MmPageState,
    /// Page-table entries referencing this frame
    mapping_count: u32,
    wired_count: u32,
    owner: Option<PageOwner>,
}

impl MmPfn {
    const fn unused() -> Self {
        Self {
            flink: LIST_END,
            blink: LIST_END,
            state: MmPageState::Unused,
            mapping_count: 0,
            wired_count: 0,
            owner: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PageQueue {
    head: u32,
    tail: u32,
    count: usize,
}

impl PageQueue {
    const fn new() -> Self {
        Self {
            head: LIST_END,
            tail: LIST_END,
            count: 0,
        }
    }
}

/// Snapshot of one PFN entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfnSnapshot {
    pub pfn: Pfn,
    pub state: MmPageState,
    pub mapping_count: u32,
    pub wired_count: u32,
    pub owner: Option<PageOwner>,
}

/// Memory statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmStats {
    pub total_pages: usize,
    pub free_pages: usize,
    pub clear_pages: usize,
    pub active_pages: usize,
    pub inactive_pages: usize,
    pub modified_pages: usize,
    pub wired_pages: usize,
    /// Free pages not promised to any reservation
    pub unreserved_pages: usize,
    /// Pages only privileged allocations may take
    pub system_reserve: usize,
}

impl MmStats {
    /// Free plus Clear
    pub fn free_total(&self) -> usize {
        self.free_pages + self.clear_pages
    }

    /// Pages an ordinary reservation could still obtain
    pub fn available_pages(&self) -> usize {
        self.unreserved_pages.saturating_sub(self.system_reserve)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_pages as u64 * PAGE_SIZE as u64
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_total() as u64 * PAGE_SIZE as u64
    }

    /// free + active + inactive + modified + wired == total
    pub fn is_balanced(&self) -> bool {
        self.free_total()
            + self.active_pages
            + self.inactive_pages
            + self.modified_pages
            + self.wired_pages
            == self.total_pages
    }
}

struct PfnInner {
    entries: Vec<MmPfn>,
    queues: [PageQueue; QUEUE_COUNT],
}

// ============================================================================
// Page Queue Operations
// ============================================================================

impl PfnInner {
    /// Append a page to the tail of its state's queue
    fn enqueue(&mut self, index: u32, state: MmPageState) {
        let Some(q) = state.queue() else {
            self.entries[index as usize].state = state;
            return;
        };
        let tail = self.queues[q].tail;
        {
            let entry = &mut self.entries[index as usize];
            entry.state = state;
            entry.flink = LIST_END;
            entry.blink = tail;
        }
        if tail != LIST_END {
            self.entries[tail as usize].flink = index;
        } else {
            self.queues[q].head = index;
        }
        self.queues[q].tail = index;
        self.queues[q].count += 1;
    }

    /// Unlink a page from whatever queue it sits on
    fn dequeue(&mut self, index: u32) {
        let entry = self.entries[index as usize];
        let Some(q) = entry.state.queue() else {
            return;
        };

        if entry.blink != LIST_END {
            self.entries[entry.blink as usize].flink = entry.flink;
        } else {
            self.queues[q].head = entry.flink;
        }
        if entry.flink != LIST_END {
            self.entries[entry.flink as usize].blink = entry.blink;
        } else {
            self.queues[q].tail = entry.blink;
        }

        let entry = &mut self.entries[index as usize];
        entry.flink = LIST_END;
        entry.blink = LIST_END;
        self.queues[q].count -= 1;
    }

    fn move_to(&mut self, index: u32, state: MmPageState) {
        self.dequeue(index);
        self.enqueue(index, state);
    }

    fn pop_head(&mut self, state: MmPageState) -> Option<u32> {
        let q = state.queue()?;
        let head = self.queues[q].head;
        if head == LIST_END {
            return None;
        }
        self.dequeue(head);
        Some(head)
    }

    fn count(&self, state: MmPageState) -> usize {
        state.queue().map_or(0, |q| self.queues[q].count)
    }
}

// ============================================================================
// PFN Database
// ============================================================================

/// The physical page allocator
pub struct PfnDatabase {
    /// Frame number of entry 0
    base_pfn: Pfn,
    inner: Mutex<PfnInner>,
    total_pages: usize,
    /// Free pages not promised to a reservation
    unreserved: AtomicUsize,
    system_reserve: usize,
    /// Threads waiting in a blocking reservation
    waiters: AtomicUsize,
    mapper: Arc<dyn PhysicalPageMapper>,
    cpus: Arc<dyn CpuServices>,
    pressure_hook: Once<PressureHook>,
}

impl PfnDatabase {
    /// Build the database from the boot memory map
    ///
    /// Usable regions become Free, kernel-args ranges become Wired and
    /// everything else (or below 1MB) stays Unused. `system_reserve` pages
    /// are held back for privileged allocations.
    pub fn new(
        boot: &BootInfo,
        mapper: Arc<dyn PhysicalPageMapper>,
        cpus: Arc<dyn CpuServices>,
        system_reserve: usize,
    ) -> Self {
        let (low, high) = boot.frame_bounds();
        let mut inner = PfnInner {
            entries: alloc::vec![MmPfn::unused(); high - low],
            queues: [PageQueue::new(); QUEUE_COUNT],
        };

        let mut total = 0usize;
        let mut wired = 0usize;
        for region in boot.memory_map.iter().filter(|r| r.memory_type.is_usable()) {
            for pfn in region.first_pfn()..region.end_pfn() {
                let index = (pfn - low) as u32;
                if pfn < LOW_MEMORY_LIMIT_PFN
                    || inner.entries[index as usize].state != MmPageState::Unused
                {
                    continue;
                }
                if boot.is_kernel_args(pfn) {
                    // Held on the Wired queue; the area that adopts the
                    // frame takes the only wiring.
                    inner.enqueue(index, MmPageState::Wired);
                    wired += 1;
                } else {
                    inner.enqueue(index, MmPageState::Free);
                }
                total += 1;
            }
        }

        let free = total - wired;
        let system_reserve = system_reserve.min(free);

        log::info!("[MM] PFN database initialized");
        log::info!(
            "[MM]   {} pages ({} MB) managed, {} free, {} wired by loader, {} held for system",
            total,
            (total * PAGE_SIZE) / (1024 * 1024),
            free,
            wired,
            system_reserve
        );

        Self {
            base_pfn: low,
            inner: Mutex::new(inner),
            total_pages: total,
            unreserved: AtomicUsize::new(free),
            system_reserve,
            waiters: AtomicUsize::new(0),
            mapper,
            cpus,
            pressure_hook: Once::new(),
        }
    }

    /// Install the memory-pressure signal; only the first call takes effect
    pub fn set_pressure_hook(&self, hook: PressureHook) {
        self.pressure_hook.call_once(|| hook);
    }

    fn signal_pressure(&self) {
        if let Some(hook) = self.pressure_hook.get() {
            hook();
        }
    }

    #[inline]
    pub fn mapper(&self) -> &dyn PhysicalPageMapper {
        &*self.mapper
    }

    pub fn mapper_arc(&self) -> Arc<dyn PhysicalPageMapper> {
        self.mapper.clone()
    }

    #[inline]
    pub fn cpus(&self) -> &dyn CpuServices {
        &*self.cpus
    }

    pub fn cpus_arc(&self) -> Arc<dyn CpuServices> {
        self.cpus.clone()
    }

    /// Number of managed pages
    #[inline]
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Pages an ordinary reservation can still obtain
    pub fn available_pages(&self) -> usize {
        self.unreserved
            .load(Ordering::Acquire)
            .saturating_sub(self.system_reserve)
    }

    /// Threads currently waiting for pages
    pub fn waiting_threads(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Index of a managed frame, bug-checking otherwise
    fn managed_index(&self, inner: &PfnInner, pfn: Pfn) -> u32 {
        match pfn.checked_sub(self.base_pfn) {
            Some(i) if i < inner.entries.len() && inner.entries[i].state != MmPageState::Unused => {
                i as u32
            }
            _ => ke_bugcheck_ex(
                codes::PFN_LIST_CORRUPT,
                codes::pfn_check::BAD_FRAME,
                pfn as u64,
                0,
                0,
            ),
        }
    }

    /// Is `pfn` a frame this database manages?
    pub fn is_managed(&self, pfn: Pfn) -> bool {
        let inner = self.inner.lock();
        pfn.checked_sub(self.base_pfn)
            .and_then(|i| inner.entries.get(i))
            .is_some_and(|e| e.state != MmPageState::Unused)
    }

    // ========================================================================
    // Reservation
    // ========================================================================

    fn try_reserve(&self, count: usize, floor: usize) -> bool {
        let mut current = self.unreserved.load(Ordering::Acquire);
        loop {
            if current < count + floor {
                return false;
            }
            match self.unreserved.compare_exchange_weak(
                current,
                current - count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn unreserve(&self, count: usize) {
        if count > 0 {
            self.unreserved.fetch_add(count, Ordering::AcqRel);
        }
    }

    /// Reserve `count` pages for later allocation
    ///
    /// Fails with `NoMemory` if the request can never be satisfied (more
    /// than the managed pages outside the system reserve). Otherwise a
    /// non-blocking request fails with `WouldBlock` on a shortfall, and a
    /// blocking one signals memory pressure and waits until enough pages
    /// are freed.
    pub fn reserve_pages(&self, count: usize, blocking: bool) -> MmResult<MmReservation<'_>> {
        if count == 0 {
            return Ok(MmReservation { db: self, count: 0 });
        }
        if count > self.total_pages.saturating_sub(self.system_reserve) {
            log::warn!(
                "[PFN] reservation of {} pages exceeds {} managed pages",
                count,
                self.total_pages
            );
            return Err(MmError::NoMemory);
        }

        if self.try_reserve(count, self.system_reserve) {
            return Ok(MmReservation { db: self, count });
        }

        if !blocking {
            log::warn!(
                "[PFN] non-blocking reservation of {} pages failed ({} available)",
                count,
                self.available_pages()
            );
            return Err(MmError::WouldBlock);
        }

        log::debug!("[PFN] waiting for {} pages", count);
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let mut rounds = 0usize;
        while !self.try_reserve(count, self.system_reserve) {
            if rounds % PRESSURE_SIGNAL_INTERVAL == 0 {
                self.signal_pressure();
            }
            rounds += 1;
            self.cpus.yield_cpu();
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);

        Ok(MmReservation { db: self, count })
    }

    /// Allocate one page without a reservation, dipping into the system
    /// reserve if needed. Used by boot and kernel-internal paths.
    pub fn allocate_page_privileged(&self, state: MmPageState) -> MmResult<Pfn> {
        if !self.try_reserve(1, 0) {
            return Err(MmError::NoMemory);
        }
        Ok(self.take_page(state, true))
    }

    /// Take a reserved page off the free queues
    fn take_page(&self, state: MmPageState, zeroed: bool) -> Pfn {
        if !state.is_in_use() {
            ke_bugcheck_ex(
                codes::PFN_LIST_CORRUPT,
                codes::pfn_check::BAD_TRANSITION,
                0,
                state as u64,
                0,
            );
        }

        let (pfn, needs_zero) = {
            let mut inner = self.inner.lock();
            let (first, second) = if zeroed {
                (MmPageState::Clear, MmPageState::Free)
            } else {
                (MmPageState::Free, MmPageState::Clear)
            };
            let (index, from) = match inner.pop_head(first) {
                Some(index) => (index, first),
                None => match inner.pop_head(second) {
                    Some(index) => (index, second),
                    None => {
                        let free = inner.count(MmPageState::Free) + inner.count(MmPageState::Clear);
                        drop(inner);
                        ke_bugcheck_ex(
                            codes::NO_PAGES_AVAILABLE,
                            free as u64,
                            self.unreserved.load(Ordering::Relaxed) as u64,
                            state as u64,
                            0,
                        );
                    }
                },
            };

            let entry = &mut inner.entries[index as usize];
            entry.mapping_count = 0;
            entry.wired_count = 0;
            entry.owner = None;
            inner.enqueue(index, state);

            (
                self.base_pfn + index as Pfn,
                zeroed && from == MmPageState::Free,
            )
        };

        if needs_zero {
            mm_zero_page(&*self.mapper, pfn);
        }
        pfn
    }

    // ========================================================================
    // Page lifecycle
    // ========================================================================

    /// Return a page to the Free queue
    ///
    /// The page must be owned, unmapped and unwired.
    pub fn free_page(&self, pfn: Pfn) {
        {
            let mut inner = self.inner.lock();
            let index = self.managed_index(&inner, pfn);
            let entry = inner.entries[index as usize];

            if entry.state.is_free() {
                drop(inner);
                ke_bugcheck_ex(
                    codes::PFN_LIST_CORRUPT,
                    codes::pfn_check::DOUBLE_FREE,
                    pfn as u64,
                    entry.state as u64,
                    0,
                );
            }
            if entry.mapping_count != 0 || entry.wired_count != 0 {
                drop(inner);
                ke_bugcheck_ex(
                    codes::MEMORY_MANAGEMENT,
                    codes::mm_check::FREE_MAPPED_PAGE,
                    pfn as u64,
                    entry.mapping_count as u64,
                    entry.wired_count as u64,
                );
            }

            inner.entries[index as usize].owner = None;
            inner.move_to(index, MmPageState::Free);
        }
        self.unreserve(1);
    }

    /// Move an owned page between in-use states
    pub fn set_page_state(&self, pfn: Pfn, state: MmPageState) {
        let mut inner = self.inner.lock();
        let index = self.managed_index(&inner, pfn);
        let current = inner.entries[index as usize].state;
        if !current.is_in_use() || !state.is_in_use() {
            drop(inner);
            ke_bugcheck_ex(
                codes::PFN_LIST_CORRUPT,
                codes::pfn_check::BAD_TRANSITION,
                pfn as u64,
                current as u64,
                state as u64,
            );
        }
        if current != state {
            inner.move_to(index, state);
        }
    }

    /// Move a page from `from` to `to` if it is still in `from`
    ///
    /// For scanners that work from a snapshot of a queue and may race with
    /// frees. Returns whether the page moved.
    pub fn transition_page(&self, pfn: Pfn, from: MmPageState, to: MmPageState) -> bool {
        if !from.is_in_use() || !to.is_in_use() {
            return false;
        }
        let mut inner = self.inner.lock();
        let Some(index) = pfn
            .checked_sub(self.base_pfn)
            .filter(|&i| i < inner.entries.len())
        else {
            return false;
        };
        if inner.entries[index].state != from {
            return false;
        }
        if from != to {
            inner.move_to(index as u32, to);
        }
        true
    }

    pub fn page_state(&self, pfn: Pfn) -> Option<MmPageState> {
        let inner = self.inner.lock();
        pfn.checked_sub(self.base_pfn)
            .and_then(|i| inner.entries.get(i))
            .map(|e| e.state)
    }

    pub fn page_info(&self, pfn: Pfn) -> Option<PfnSnapshot> {
        let inner = self.inner.lock();
        let entry = pfn.checked_sub(self.base_pfn).and_then(|i| inner.entries.get(i))?;
        Some(PfnSnapshot {
            pfn,
            state: entry.state,
            mapping_count: entry.mapping_count,
            wired_count: entry.wired_count,
            owner: entry.owner,
        })
    }

    /// Touch an owned page: Inactive pages return to Active
    pub fn activate_page(&self, pfn: Pfn) {
        let mut inner = self.inner.lock();
        let index = self.managed_index(&inner, pfn);
        if inner.entries[index as usize].state == MmPageState::Inactive {
            inner.move_to(index, MmPageState::Active);
        }
    }

    /// Note that an Active or Inactive page is dirty
    pub fn mark_modified(&self, pfn: Pfn) -> bool {
        let mut inner = self.inner.lock();
        let index = self.managed_index(&inner, pfn);
        match inner.entries[index as usize].state {
            MmPageState::Active | MmPageState::Inactive => {
                inner.move_to(index, MmPageState::Modified);
                true
            }
            _ => false,
        }
    }

    /// Pin a page in memory
    pub fn wire_page(&self, pfn: Pfn) {
        let mut inner = self.inner.lock();
        let index = self.managed_index(&inner, pfn);
        let entry = &mut inner.entries[index as usize];
        entry.wired_count += 1;
        if entry.state != MmPageState::Wired {
            inner.move_to(index, MmPageState::Wired);
        }
    }

    /// Drop one wiring; the last one returns the page to Active
    pub fn unwire_page(&self, pfn: Pfn) {
        let mut inner = self.inner.lock();
        let index = self.managed_index(&inner, pfn);
        let entry = &mut inner.entries[index as usize];
        if entry.wired_count == 0 {
            ke_bugcheck_ex(
                codes::MEMORY_MANAGEMENT,
                codes::mm_check::WIRED_COUNT_UNDERFLOW,
                pfn as u64,
                0,
                0,
            );
        }
        entry.wired_count -= 1;
        if entry.wired_count == 0 {
            inner.move_to(index, MmPageState::Active);
        }
    }

    /// A page-table entry now references `pfn`
    ///
    /// Frames the database does not manage (device memory) are ignored.
    pub fn increment_mapping(&self, pfn: Pfn) {
        let mut inner = self.inner.lock();
        if let Some(entry) = pfn
            .checked_sub(self.base_pfn)
            .and_then(|i| inner.entries.get_mut(i))
            .filter(|e| e.state.is_in_use())
        {
            entry.mapping_count += 1;
        }
    }

    pub fn decrement_mapping(&self, pfn: Pfn) {
        let mut inner = self.inner.lock();
        if let Some(entry) = pfn
            .checked_sub(self.base_pfn)
            .and_then(|i| inner.entries.get_mut(i))
            .filter(|e| e.state.is_in_use())
        {
            if entry.mapping_count == 0 {
                ke_bugcheck_ex(
                    codes::MEMORY_MANAGEMENT,
                    codes::mm_check::MAPPING_COUNT_UNDERFLOW,
                    pfn as u64,
                    0,
                    0,
                );
            }
            entry.mapping_count -= 1;
        }
    }

    pub fn mapping_count(&self, pfn: Pfn) -> u32 {
        self.page_info(pfn).map_or(0, |info| info.mapping_count)
    }

    pub fn set_owner(&self, pfn: Pfn, owner: Option<PageOwner>) {
        let mut inner = self.inner.lock();
        let index = self.managed_index(&inner, pfn);
        inner.entries[index as usize].owner = owner;
    }

    pub fn owner(&self, pfn: Pfn) -> Option<PageOwner> {
        self.page_info(pfn).and_then(|info| info.owner)
    }

    /// Up to `max` pages currently in `state`, oldest first
    pub fn pages_in_state(&self, state: MmPageState, max: usize) -> Vec<Pfn> {
        let inner = self.inner.lock();
        let Some(q) = state.queue() else {
            return Vec::new();
        };
        let mut pages = Vec::with_capacity(inner.queues[q].count.min(max));
        let mut cursor = inner.queues[q].head;
        while cursor != LIST_END && pages.len() < max {
            pages.push(self.base_pfn + cursor as Pfn);
            cursor = inner.entries[cursor as usize].flink;
        }
        pages
    }

    /// Zero up to `max` Free pages and move them to the Clear queue
    pub fn zero_free_pages(&self, max: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut zeroed = 0;
        while zeroed < max {
            let Some(index) = inner.pop_head(MmPageState::Free) else {
                break;
            };
            mm_zero_page(&*self.mapper, self.base_pfn + index as Pfn);
            inner.enqueue(index, MmPageState::Clear);
            zeroed += 1;
        }
        zeroed
    }

    /// Write the Modified pages of `cache` in `[start, end)` to its store
    ///
    /// Returns the number of pages written.
    pub fn write_modified_page_range(&self, cache: &MmCache, start: u64, end: u64) -> MmResult<usize> {
        cache.write_modified_pages(start, end)
    }

    /// Get memory statistics
    pub fn stats(&self) -> MmStats {
        let inner = self.inner.lock();
        MmStats {
            total_pages: self.total_pages,
            free_pages: inner.count(MmPageState::Free),
            clear_pages: inner.count(MmPageState::Clear),
            active_pages: inner.count(MmPageState::Active),
            inactive_pages: inner.count(MmPageState::Inactive),
            modified_pages: inner.count(MmPageState::Modified),
            wired_pages: inner.count(MmPageState::Wired),
            unreserved_pages: self.unreserved.load(Ordering::Acquire),
            system_reserve: self.system_reserve,
        }
    }

    /// Walk every queue and cross-check links, states and counters
    pub fn validate(&self) -> Result<(), &'static str> {
        let inner = self.inner.lock();
        let mut seen = 0usize;

        for (q, queue) in inner.queues.iter().enumerate() {
            let mut cursor = queue.head;
            let mut prev = LIST_END;
            let mut count = 0usize;
            while cursor != LIST_END {
                let entry = &inner.entries[cursor as usize];
                if entry.state as usize != q {
                    return Err("page on the wrong state queue");
                }
                if entry.blink != prev {
                    return Err("queue back link broken");
                }
                if entry.state.is_free() && (entry.owner.is_some() || entry.mapping_count != 0) {
                    return Err("free page still owned or mapped");
                }
                prev = cursor;
                cursor = entry.flink;
                count += 1;
                if count > inner.entries.len() {
                    return Err("queue cycle");
                }
            }
            if queue.tail != prev {
                return Err("queue tail mismatch");
            }
            if count != queue.count {
                return Err("queue count mismatch");
            }
            seen += count;
        }

        if seen != self.total_pages {
            return Err("page accounting does not add up to total");
        }

        let free = inner.count(MmPageState::Free) + inner.count(MmPageState::Clear);
        if self.unreserved.load(Ordering::Acquire) > free {
            return Err("more pages unreserved than free");
        }
        Ok(())
    }
}

// ============================================================================
// Reservation Ticket
// ============================================================================

/// Pages promised to the holder
///
/// Allocation from a ticket never fails. Whatever is left when the ticket
/// is dropped goes back to the pool.
pub struct MmReservation<'a> {
    db: &'a PfnDatabase,
    count: usize,
}

impl<'a> MmReservation<'a> {
    /// Pages still available on this ticket
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn database(&self) -> &'a PfnDatabase {
        self.db
    }

    fn consume(&mut self) {
        if self.count == 0 {
            ke_bugcheck_ex(
                codes::NO_PAGES_AVAILABLE,
                0,
                self.db.unreserved.load(Ordering::Relaxed) as u64,
                0,
                1,
            );
        }
        self.count -= 1;
    }

    /// Allocate a zero-filled page
    pub fn allocate_page(&mut self, state: MmPageState) -> Pfn {
        self.consume();
        self.db.take_page(state, true)
    }

    /// Allocate a page whose contents will be overwritten by the caller
    pub fn allocate_page_unzeroed(&mut self, state: MmPageState) -> Pfn {
        self.consume();
        self.db.take_page(state, false)
    }

    /// Move `count` pages of this ticket into a new one
    pub fn split(&mut self, count: usize) -> MmResult<MmReservation<'a>> {
        if count > self.count {
            return Err(MmError::BadValue);
        }
        self.count -= count;
        Ok(MmReservation { db: self.db, count })
    }

    /// Return the unused pages now
    pub fn release(self) {}
}

impl Drop for MmReservation<'_> {
    fn drop(&mut self) {
        self.db.unreserve(self.count);
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimMachine;
    use crate::mm::physical::{mm_read_page, mm_write_page};
    use proptest::prelude::*;

    fn database(pages: u64, reserve: usize) -> (SimMachine, PfnDatabase) {
        let machine = SimMachine::new(2, pages);
        let db = PfnDatabase::new(
            machine.boot_info(),
            machine.ram.clone(),
            machine.cpus.clone(),
            reserve,
        );
        (machine, db)
    }

    #[test]
    fn test_boot_seeding() {
        let (machine, db) = database(64, 0);
        let stats = db.stats();
        assert_eq!(stats.total_pages, 64);
        assert_eq!(stats.wired_pages, machine.kernel_args_pages());
        assert_eq!(stats.free_total(), 64 - machine.kernel_args_pages());
        assert!(stats.is_balanced());
        assert!(!db.is_managed(0x10));
        db.validate().unwrap();
    }

    #[test]
    fn test_reserve_then_allocate_never_fails() {
        let (_m, db) = database(64, 0);
        let available = db.available_pages();
        let mut ticket = db.reserve_pages(available, false).unwrap();
        let pages: Vec<_> = (0..available)
            .map(|_| ticket.allocate_page(MmPageState::Active))
            .collect();
        assert!(ticket.is_empty());
        assert_eq!(db.stats().free_total(), 0);
        for pfn in pages {
            db.free_page(pfn);
        }
        db.validate().unwrap();
    }

    #[test]
    fn test_non_blocking_shortfall_would_block() {
        let (_m, db) = database(64, 0);
        let _held = db.reserve_pages(db.available_pages(), false).unwrap();
        assert_eq!(db.reserve_pages(1, false).err(), Some(MmError::WouldBlock));
    }

    #[test]
    fn test_impossible_reservation_no_memory() {
        let (_m, db) = database(64, 0);
        assert_eq!(db.reserve_pages(65, false).err(), Some(MmError::NoMemory));
        assert_eq!(db.reserve_pages(65, true).err(), Some(MmError::NoMemory));
    }

    #[test]
    fn test_unused_reservation_returned_on_drop() {
        let (_m, db) = database(64, 0);
        let before = db.available_pages();
        {
            let mut ticket = db.reserve_pages(10, false).unwrap();
            let pfn = ticket.allocate_page(MmPageState::Active);
            assert_eq!(db.available_pages(), before - 10);
            db.free_page(pfn);
        }
        assert_eq!(db.available_pages(), before);
    }

    #[test]
    fn test_system_reserve() {
        let (_m, db) = database(64, 8);
        let available = db.available_pages();
        let _all = db.reserve_pages(available, false).unwrap();
        assert_eq!(db.reserve_pages(1, false).err(), Some(MmError::WouldBlock));
        let pfn = db.allocate_page_privileged(MmPageState::Wired).unwrap();
        assert_eq!(db.page_state(pfn), Some(MmPageState::Wired));
    }

    #[test]
    fn test_allocated_page_is_zeroed() {
        let (machine, db) = database(32, 0);
        let mut ticket = db.reserve_pages(1, false).unwrap();
        let pfn = ticket.allocate_page(MmPageState::Active);
        mm_write_page(&*machine.ram, pfn, 0, &[0xAA; 16]);
        db.free_page(pfn);

        let mut ticket = db.reserve_pages(db.available_pages(), false).unwrap();
        while !ticket.is_empty() {
            let pfn = ticket.allocate_page(MmPageState::Active);
            let mut buf = [0xFFu8; 16];
            mm_read_page(&*machine.ram, pfn, 0, &mut buf);
            assert_eq!(buf, [0u8; 16]);
        }
    }

    #[test]
    fn test_zero_free_pages_moves_to_clear() {
        let (_m, db) = database(32, 0);
        let free = db.stats().free_pages;
        assert_eq!(db.zero_free_pages(4), 4);
        let stats = db.stats();
        assert_eq!(stats.clear_pages, 4);
        assert_eq!(stats.free_pages, free - 4);
        assert!(stats.is_balanced());
    }

    #[test]
    fn test_wire_and_mapping_counts() {
        let (_m, db) = database(32, 0);
        let mut ticket = db.reserve_pages(1, false).unwrap();
        let pfn = ticket.allocate_page(MmPageState::Active);
        db.wire_page(pfn);
        db.wire_page(pfn);
        assert_eq!(db.page_state(pfn), Some(MmPageState::Wired));
        db.unwire_page(pfn);
        assert_eq!(db.page_state(pfn), Some(MmPageState::Wired));
        db.unwire_page(pfn);
        assert_eq!(db.page_state(pfn), Some(MmPageState::Active));

        db.increment_mapping(pfn);
        assert_eq!(db.mapping_count(pfn), 1);
        db.decrement_mapping(pfn);
        db.free_page(pfn);
    }

    #[test]
    #[should_panic(expected = "PFN_LIST_CORRUPT")]
    fn test_double_free_bugchecks() {
        let (_m, db) = database(32, 0);
        let mut ticket = db.reserve_pages(1, false).unwrap();
        let pfn = ticket.allocate_page(MmPageState::Active);
        db.free_page(pfn);
        db.free_page(pfn);
    }

    #[test]
    #[should_panic(expected = "MEMORY_MANAGEMENT")]
    fn test_free_mapped_page_bugchecks() {
        let (_m, db) = database(32, 0);
        let mut ticket = db.reserve_pages(1, false).unwrap();
        let pfn = ticket.allocate_page(MmPageState::Active);
        db.increment_mapping(pfn);
        db.free_page(pfn);
    }

    #[test]
    fn test_blocking_reservation_waits_for_free() {
        let (_m, db) = database(32, 0);
        let db = Arc::new(db);
        let available = db.available_pages();
        let mut ticket = db.reserve_pages(available, false).unwrap();
        let pfn = ticket.allocate_page(MmPageState::Active);
        drop(ticket);
        let _rest = db.reserve_pages(db.available_pages(), false).unwrap();

        let waiter = {
            let db = db.clone();
            std::thread::spawn(move || db.reserve_pages(1, true).map(|t| t.count()))
        };
        while db.waiting_threads() == 0 {
            std::thread::yield_now();
        }
        db.free_page(pfn);
        assert_eq!(waiter.join().unwrap(), Ok(1));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(usize),
        Allocate,
        Free(usize),
        Deactivate(usize),
        Dirty(usize),
        Wire(usize),
        Unwire(usize),
        Zero(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1usize..8).prop_map(Op::Reserve),
            Just(Op::Allocate),
            any::<usize>().prop_map(Op::Free),
            any::<usize>().prop_map(Op::Deactivate),
            any::<usize>().prop_map(Op::Dirty),
            any::<usize>().prop_map(Op::Wire),
            any::<usize>().prop_map(Op::Unwire),
            (0usize..4).prop_map(Op::Zero),
        ]
    }

    proptest! {
        #[test]
        fn prop_accounting_invariant_holds(ops in proptest::collection::vec(op(), 1..120)) {
            let (_m, db) = database(48, 2);
            let mut tickets: Vec<MmReservation<'_>> = Vec::new();
            let mut owned: Vec<(Pfn, u32)> = Vec::new();

            for op in ops {
                match op {
                    Op::Reserve(n) => {
                        if let Ok(t) = db.reserve_pages(n, false) {
                            tickets.push(t);
                        }
                    }
                    Op::Allocate => {
                        if let Some(t) = tickets.iter_mut().find(|t| !t.is_empty()) {
                            owned.push((t.allocate_page(MmPageState::Active), 0));
                        }
                    }
                    Op::Free(i) if !owned.is_empty() => {
                        let (pfn, wires) = owned.swap_remove(i % owned.len());
                        for _ in 0..wires {
                            db.unwire_page(pfn);
                        }
                        db.free_page(pfn);
                    }
                    Op::Deactivate(i) if !owned.is_empty() => {
                        let (pfn, wires) = owned[i % owned.len()];
                        if wires == 0 {
                            db.set_page_state(pfn, MmPageState::Inactive);
                        }
                    }
                    Op::Dirty(i) if !owned.is_empty() => {
                        db.mark_modified(owned[i % owned.len()].0);
                    }
                    Op::Wire(i) if !owned.is_empty() => {
                        let n = i % owned.len();
                        db.wire_page(owned[n].0);
                        owned[n].1 += 1;
                    }
                    Op::Unwire(i) if !owned.is_empty() => {
                        let n = i % owned.len();
                        if owned[n].1 > 0 {
                            db.unwire_page(owned[n].0);
                            owned[n].1 -= 1;
                        }
                    }
                    Op::Zero(n) => {
                        db.zero_free_pages(n);
                    }
                    _ => {}
                }
                prop_assert!(db.stats().is_balanced());
                prop_assert_eq!(db.validate(), Ok(()));
            }

            drop(tickets);
            for (pfn, wires) in owned {
                for _ in 0..wires {
                    db.unwire_page(pfn);
                }
                db.free_page(pfn);
            }
            let stats = db.stats();
            prop_assert_eq!(stats.unreserved_pages, stats.free_total());
        }
    }
}
