//! Address Space Management
//!
//! Each team has its own address space consisting of:
//! - A translation map (PML4, PDPT, PD, PT)
//! - The areas allocated in it, ordered by base address
//! - Fault counters
//!
//! # Address Space Layout (x86_64)
//!
//! ```text
//! 0x0000_0000_0000_0000 - 0x0000_7FFF_FFFF_FFFF: User space (128TB)
//! 0x0000_8000_0000_0000 - 0xFFFF_7FFF_FFFF_FFFF: Non-canonical hole
//! 0xFFFF_8000_0000_0000 - 0xFFFF_FFFF_FFFF_FFFF: Kernel space (128TB)
//! ```
//!
//! # Locking
//!
//! The area list is guarded by a reader/writer lock. Faults take it
//! shared; anything that adds, removes or reshapes an area takes it
//! exclusive and keeps it until the translation map agrees. Page
//! reservations are taken before the lock.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::{RwLock, RwLockReadGuard};

use super::cache::{CacheAreaRef, CacheKind, FaultOutcome, MmCache};
use super::context::MmCore;
use super::error::{MmError, MmResult};
use super::fault::{mm_fault_area, mm_fault_locked, FAULT_RESERVE_PAGES};
use super::pfn::{MmPageState, MmReservation, Pfn, PAGE_SHIFT, PAGE_SIZE};
use super::physical::{mm_copy_page, mm_read_page, mm_write_page};
use super::translation::{MapLock, TranslationMap};
use super::vad::{
    AreaBacking, AreaId, AreaInfo, AreaRequest, AreaState, MmArea, Placement, Protection, Sharing,
    Wiring,
};
use crate::ke::cpu::CpuId;

/// Team (process) identifier
pub type TeamId = u32;

/// Team owning the kernel address space
pub const KERNEL_TEAM: TeamId = 0;

/// User space start address
pub const USER_SPACE_START: u64 = 0x0000_0000_0001_0000; // 64KB
/// User space end address
pub const USER_SPACE_END: u64 = 0x0000_7FFF_FFFF_FFFF; // 128TB - 1
/// Kernel space start address
pub const KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;
/// Kernel space end address
pub const KERNEL_SPACE_END: u64 = 0xFFFF_FFFF_FFFF_FFFF;

const PAGE: u64 = PAGE_SIZE as u64;

/// Areas of one space keyed by base address
pub(super) type AreaMap = BTreeMap<u64, MmArea>;

fn page_align_size(size: u64) -> MmResult<u64> {
    if size == 0 {
        return Err(MmError::BadValue);
    }
    size.checked_add(PAGE - 1)
        .map(|s| s & !(PAGE - 1))
        .ok_or(MmError::BadValue)
}

/// Page tables mapping `size` bytes can need at any alignment
fn table_pages_bound(size: u64, user: bool) -> usize {
    let span = |shift: u32| ((size >> shift) + 2) as usize;
    span(21) + span(30) + if user { span(39) } else { 0 }
}

fn area_base_of(areas: &AreaMap, id: AreaId) -> Option<u64> {
    areas.values().find(|a| a.id == id).map(|a| a.base)
}

fn area_at(areas: &AreaMap, addr: u64) -> Option<&MmArea> {
    areas
        .range(..=addr)
        .next_back()
        .map(|(_, area)| area)
        .filter(|area| area.contains(addr))
}

/// Per-team address space
pub struct MmAddressSpace {
    team: TeamId,
    base: u64,
    /// Exclusive
    end: u64,
    core: Arc<MmCore>,
    map: Arc<dyn TranslationMap>,
    areas: RwLock<AreaMap>,
    deleting: AtomicBool,
    soft_faults: AtomicU64,
    hard_faults: AtomicU64,
    cow_faults: AtomicU64,
}

impl MmAddressSpace {
    pub fn new(
        team: TeamId,
        base: u64,
        end: u64,
        core: Arc<MmCore>,
        map: Arc<dyn TranslationMap>,
    ) -> Self {
        Self {
            team,
            base,
            end,
            core,
            map,
            areas: RwLock::new(BTreeMap::new()),
            deleting: AtomicBool::new(false),
            soft_faults: AtomicU64::new(0),
            hard_faults: AtomicU64::new(0),
            cow_faults: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn team(&self) -> TeamId {
        self.team
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn map(&self) -> &Arc<dyn TranslationMap> {
        &self.map
    }

    pub fn core(&self) -> &Arc<MmCore> {
        &self.core
    }

    /// True for team address spaces, false for the kernel's
    #[inline]
    pub fn is_user(&self) -> bool {
        !self.map.is_kernel()
    }

    #[inline]
    pub fn contains_address(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end
    }

    pub(super) fn areas_read(&self) -> RwLockReadGuard<'_, AreaMap> {
        self.areas.read()
    }

    pub(super) fn record_fault(&self, outcome: FaultOutcome) {
        if outcome.hard {
            self.hard_faults.fetch_add(1, Ordering::Relaxed);
        } else {
            self.soft_faults.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.copied {
            self.cow_faults.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn soft_faults(&self) -> u64 {
        self.soft_faults.load(Ordering::Relaxed)
    }

    pub fn hard_faults(&self) -> u64 {
        self.hard_faults.load(Ordering::Relaxed)
    }

    pub fn cow_faults(&self) -> u64 {
        self.cow_faults.load(Ordering::Relaxed)
    }

    fn check_live(&self) -> MmResult<()> {
        if self.deleting.load(Ordering::Acquire) {
            Err(MmError::Busy)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Placement
    // ========================================================================

    fn find_free_range(&self, areas: &AreaMap, size: u64, placement: Placement) -> MmResult<u64> {
        match placement {
            Placement::Exact(addr) => {
                let end = addr.checked_add(size).ok_or(MmError::BadAddress)?;
                if addr & (PAGE - 1) != 0 || addr < self.base || end > self.end {
                    return Err(MmError::BadAddress);
                }
                if areas.values().any(|a| a.overlaps(addr, end)) {
                    return Err(MmError::BadAddress);
                }
                Ok(addr)
            }
            Placement::Any => self.first_fit(areas, self.base, size).ok_or(MmError::NoMemory),
            Placement::Hint(hint) => {
                let start = hint
                    .checked_add(PAGE - 1)
                    .map(|h| (h & !(PAGE - 1)).max(self.base))
                    .unwrap_or(self.end);
                self.first_fit(areas, start, size)
                    .or_else(|| self.first_fit(areas, self.base, size))
                    .ok_or(MmError::NoMemory)
            }
        }
    }

    fn first_fit(&self, areas: &AreaMap, start: u64, size: u64) -> Option<u64> {
        let mut cursor = start;
        for area in areas.values() {
            if area.end() <= cursor {
                continue;
            }
            if area.base >= cursor.checked_add(size)? {
                break;
            }
            cursor = area.end();
        }
        (cursor.checked_add(size)? <= self.end).then_some(cursor)
    }

    // ========================================================================
    // Area creation
    // ========================================================================

    /// Create an area and its cache
    ///
    /// Fully wired areas are populated and wired before this returns; if
    /// that fails nothing of the area is left behind.
    pub fn create_area(&self, request: AreaRequest) -> MmResult<(AreaId, u64)> {
        self.check_live()?;
        let size = page_align_size(request.size)?;
        let (cache, cache_offset) = match request.backing {
            AreaBacking::Anonymous => (self.core.create_anonymous_cache(size), 0),
            AreaBacking::Store { store, offset } => {
                if offset & (PAGE - 1) != 0 {
                    return Err(MmError::BadValue);
                }
                let cache = self.core.create_store_cache(store);
                if cache.virtual_end() < offset + size {
                    cache.resize(offset + size);
                }
                (cache, offset)
            }
        };
        self.insert_area(
            &request.name,
            size,
            request.placement,
            request.protection,
            request.wiring,
            cache,
            cache_offset,
        )
    }

    /// Map already-owned frames as a wired area
    pub fn adopt_frames(&self, name: &str, frames: &[Pfn]) -> MmResult<(AreaId, u64)> {
        let size = page_align_size(frames.len() as u64 * PAGE)?;
        let cache = self.core.create_anonymous_cache(size);
        for (index, &pfn) in frames.iter().enumerate() {
            cache.insert_page(index as u64 * PAGE, pfn);
        }
        self.insert_area(
            name,
            size,
            Placement::Any,
            Protection::READ | Protection::WRITE,
            Wiring::Full,
            cache,
            0,
        )
    }

    fn insert_area(
        &self,
        name: &str,
        size: u64,
        placement: Placement,
        protection: Protection,
        wiring: Wiring,
        cache: Arc<MmCache>,
        cache_offset: u64,
    ) -> MmResult<(AreaId, u64)> {
        if wiring == Wiring::Full && !protection.is_accessible() {
            return Err(MmError::BadValue);
        }
        let needed = match wiring {
            Wiring::Full => (size / PAGE) as usize + table_pages_bound(size, self.is_user()),
            _ => 0,
        };
        let mut reservation = self.core.pfn.reserve_pages(needed, false)?;

        let mut areas = self.areas.write();
        self.check_live()?;
        let base = self.find_free_range(&areas, size, placement)?;
        let id = self.core.next_area_id();
        let mut area = MmArea::new(
            id,
            String::from(name),
            self.team,
            base,
            size,
            protection,
            wiring,
            cache.clone(),
            cache_offset,
        );
        cache.add_area(CacheAreaRef {
            area: id,
            base,
            size,
            cache_offset,
            map: self.map.clone(),
        });

        if wiring == Wiring::Full {
            if let Err(err) = self.map_area_pages(&area, base..area.end(), &mut reservation) {
                log::warn!("[MM] area '{}' wiring failed: {}", name, err);
                self.unmap_area_range(&area, base, area.end());
                cache.remove_area(id);
                return Err(err);
            }
        }

        area.state = AreaState::Mapped;
        log::debug!(
            "[MM] team {} area {} '{}' {:#x}-{:#x} {:?} {:?}",
            self.team,
            id,
            name,
            base,
            base + size,
            protection,
            wiring
        );
        areas.insert(base, area);
        self.core.register_area(id, self.team);
        Ok((id, base))
    }

    /// Fault in and wire every page of `range`
    fn map_area_pages(
        &self,
        area: &MmArea,
        range: Range<u64>,
        reservation: &mut MmReservation<'_>,
    ) -> MmResult<()> {
        let write = area.protection.contains(Protection::WRITE);
        for va in range.step_by(PAGE_SIZE) {
            mm_fault_area(self, area, va, write, reservation)?;
        }
        Ok(())
    }

    fn unmap_area_range(&self, area: &MmArea, start: u64, end: u64) {
        if let Err(err) = self.map.unmap(start, end) {
            log::error!("[MM] unmap {:#x}-{:#x} failed: {}", start, end, err);
        }
        area.unwire_range(&self.core.pfn, start, end);
    }

    // ========================================================================
    // Area deletion
    // ========================================================================

    /// Delete an area
    ///
    /// An id that is not (or no longer) in this space fails with
    /// `BadValue`.
    pub fn delete_area(&self, id: AreaId) -> MmResult<()> {
        let mut areas = self.areas.write();
        let base = area_base_of(&areas, id).ok_or(MmError::BadValue)?;
        let area = areas.remove(&base).ok_or(MmError::BadValue)?;
        self.teardown(area);
        Ok(())
    }

    fn teardown(&self, mut area: MmArea) {
        self.unmap_area_range(&area, area.base, area.end());
        let cache = area.cache.clone();
        cache.remove_area(area.id);
        self.core.unregister_area(area.id);
        area.state = AreaState::Deleted;
        log::debug!(
            "[MM] team {} area {} '{}' deleted",
            self.team,
            area.id,
            area.name
        );
        drop(area);

        let source = cache.source();
        cache.try_merge_with_only_consumer();
        let weak = Arc::downgrade(&cache);
        drop(cache);
        if weak.strong_count() == 0 {
            if let Some(source) = source {
                source.try_merge_with_only_consumer();
            }
        }
    }

    /// Delete every area; the space accepts no new ones afterwards
    pub fn delete_all_areas(&self) -> usize {
        self.deleting.store(true, Ordering::Release);
        let mut areas = self.areas.write();
        let all = core::mem::take(&mut *areas);
        let count = all.len();
        for area in all.into_values() {
            self.teardown(area);
        }
        count
    }

    // ========================================================================
    // Resize and protect
    // ========================================================================

    /// Grow or shrink an area in place
    ///
    /// Growing into another area fails with `NoMemory`. Areas whose cache
    /// is shared with other areas or layers cannot be resized.
    pub fn resize_area(&self, id: AreaId, new_size: u64) -> MmResult<()> {
        self.check_live()?;
        let new_size = page_align_size(new_size)?;
        let mut areas = self.areas.write();
        let base = area_base_of(&areas, id).ok_or(MmError::BadValue)?;
        let limit = areas
            .range(base + 1..)
            .next()
            .map_or(self.end, |(&next, _)| next);
        let area = areas.get_mut(&base).ok_or(MmError::BadValue)?;
        if area.cache.area_count() > 1 || area.cache.consumer_count() > 0 {
            return Err(MmError::BadValue);
        }

        let old_size = area.size;
        let old_end = area.end();
        let cache = area.cache.clone();
        if new_size > old_size {
            let new_end = base.checked_add(new_size).ok_or(MmError::NoMemory)?;
            if new_end > limit {
                return Err(MmError::NoMemory);
            }
            let needed = match area.wiring {
                Wiring::Full => {
                    ((new_size - old_size) / PAGE) as usize
                        + table_pages_bound(new_size - old_size, self.is_user())
                }
                _ => 0,
            };
            let mut reservation = self.core.pfn.reserve_pages(needed, false)?;

            let old_cache_end = cache.virtual_end();
            if old_cache_end < area.cache_offset + new_size {
                cache.resize(area.cache_offset + new_size);
            }
            area.size = new_size;
            cache.update_area(id, base, new_size, area.cache_offset);

            if area.wiring == Wiring::Full {
                if let Err(err) = self.map_area_pages(area, old_end..new_end, &mut reservation) {
                    self.unmap_area_range(area, old_end, new_end);
                    area.size = old_size;
                    cache.update_area(id, base, old_size, area.cache_offset);
                    cache.resize(old_cache_end);
                    return Err(err);
                }
            }
        } else if new_size < old_size {
            let new_end = base + new_size;
            self.unmap_area_range(area, new_end, old_end);
            let cut = area.cache_offset + new_size;
            if cache.kind() == CacheKind::Store {
                if let Err(err) = cache.write_modified_pages(cut, area.cache_offset + old_size) {
                    log::warn!("[MM] writeback on truncate of area {} failed: {}", id, err);
                }
            }
            cache.resize(cut);
            area.size = new_size;
            cache.update_area(id, base, new_size, area.cache_offset);
        }

        log::debug!(
            "[MM] area {} resized {:#x} -> {:#x}",
            id,
            old_size,
            new_size
        );
        Ok(())
    }

    /// Change the protection of an area and of everything it has mapped
    ///
    /// Pages still owned by a source cache stay copy-on-write.
    pub fn protect_area(&self, id: AreaId, protection: Protection) -> MmResult<()> {
        self.check_live()?;
        let mut areas = self.areas.write();
        let base = area_base_of(&areas, id).ok_or(MmError::BadValue)?;
        let area = areas.get_mut(&base).ok_or(MmError::BadValue)?;
        if area.wiring.is_wired() && !protection.is_accessible() {
            return Err(MmError::BadValue);
        }
        if !protection.is_accessible() {
            self.map.unmap(area.base, area.end())?;
            area.protection = protection;
            return Ok(());
        }

        // Pages the area's own cache holds may be mapped writable again
        let own_pages = if protection.contains(Protection::WRITE) {
            let window = area.cache_offset..area.cache_offset + area.size;
            area.cache
                .pages()
                .into_iter()
                .filter(|(offset, _)| window.contains(offset))
                .collect()
        } else {
            Vec::new()
        };

        let user = self.is_user();
        let _lock = MapLock::new(&*self.map);
        self.map
            .protect(area.base, area.end(), protection.map_attributes(user, false))?;
        for (offset, pfn) in own_pages {
            let va = area.base + (offset - area.cache_offset);
            if self.map.query(va).is_some_and(|q| q.pfn() == pfn) {
                self.map
                    .protect_page(va, protection.map_attributes(user, true));
            }
        }
        area.protection = protection;
        log::trace!("[MM] area {} protection {:?}", id, protection);
        Ok(())
    }

    // ========================================================================
    // Clone
    // ========================================================================

    /// Map area `id` into `target`
    ///
    /// `Shared` clones map the same cache. `CopyOnWrite` clones put a fresh
    /// layer over the original cache on both sides, so neither sees the
    /// other's later writes; fully wired areas are copied outright.
    pub fn clone_area_into(
        &self,
        id: AreaId,
        target: &MmAddressSpace,
        name: &str,
        placement: Placement,
        sharing: Sharing,
    ) -> MmResult<(AreaId, u64)> {
        self.check_live()?;
        target.check_live()?;

        let (size, wiring) = {
            let areas = self.areas.read();
            let base = area_base_of(&areas, id).ok_or(MmError::BadValue)?;
            let area = areas.get(&base).ok_or(MmError::BadValue)?;
            (area.size, area.wiring)
        };
        let needed = match wiring {
            Wiring::Full => (size / PAGE) as usize + table_pages_bound(size, target.is_user()),
            _ => 0,
        };
        let mut reservation = self.core.pfn.reserve_pages(needed, false)?;
        let expected = (size, wiring);

        if core::ptr::eq(self, target) {
            let mut areas = self.areas.write();
            self.clone_locked(&mut areas, None, target, id, name, placement, sharing, expected, &mut reservation)
        } else {
            // Two spaces lock in team order
            let (mut source_areas, mut target_areas) = if self.team < target.team {
                let source = self.areas.write();
                (source, target.areas.write())
            } else {
                let target_guard = target.areas.write();
                (self.areas.write(), target_guard)
            };
            self.clone_locked(
                &mut source_areas,
                Some(&mut target_areas),
                target,
                id,
                name,
                placement,
                sharing,
                expected,
                &mut reservation,
            )
        }
    }

    fn clone_locked(
        &self,
        source_areas: &mut AreaMap,
        target_areas: Option<&mut AreaMap>,
        target: &MmAddressSpace,
        id: AreaId,
        name: &str,
        placement: Placement,
        sharing: Sharing,
        expected: (u64, Wiring),
        reservation: &mut MmReservation<'_>,
    ) -> MmResult<(AreaId, u64)> {
        let base = area_base_of(source_areas, id).ok_or(MmError::BadValue)?;
        let (size, wiring) = {
            let area = source_areas.get(&base).ok_or(MmError::BadValue)?;
            (area.size, area.wiring)
        };
        if (size, wiring) != expected {
            return Err(MmError::Busy);
        }

        let new_base = {
            let placed_in: &AreaMap = match &target_areas {
                Some(areas) => areas,
                None => source_areas,
            };
            target.find_free_range(placed_in, size, placement)?
        };

        let area = source_areas.get_mut(&base).ok_or(MmError::BadValue)?;
        let protection = area.protection;
        let (cache, cache_offset) = match sharing {
            Sharing::Shared => (area.cache.clone(), area.cache_offset),
            Sharing::CopyOnWrite if wiring == Wiring::Full => {
                (self.copy_area_cache(area, reservation), 0)
            }
            Sharing::CopyOnWrite => {
                if protection.contains(Protection::WRITE) {
                    self.map.protect(
                        area.base,
                        area.end(),
                        protection.map_attributes(self.is_user(), false),
                    )?;
                }
                let original = area.cache.clone();
                let parent_layer = self.core.create_layer(&original);
                let child_layer = self.core.create_layer(&original);
                original.remove_area(area.id);
                parent_layer.add_area(CacheAreaRef {
                    area: area.id,
                    base: area.base,
                    size: area.size,
                    cache_offset: area.cache_offset,
                    map: self.map.clone(),
                });
                area.cache = parent_layer;
                (child_layer, area.cache_offset)
            }
        };

        let new_id = self.core.next_area_id();
        let mut clone = MmArea::new(
            new_id,
            String::from(name),
            target.team,
            new_base,
            size,
            protection,
            wiring,
            cache.clone(),
            cache_offset,
        );
        cache.add_area(CacheAreaRef {
            area: new_id,
            base: new_base,
            size,
            cache_offset,
            map: target.map.clone(),
        });
        if wiring == Wiring::Full {
            if let Err(err) = target.map_area_pages(&clone, new_base..clone.end(), reservation) {
                target.unmap_area_range(&clone, new_base, clone.end());
                cache.remove_area(new_id);
                return Err(err);
            }
        }
        clone.state = AreaState::Mapped;

        log::debug!(
            "[MM] area {} (team {}) cloned as {} (team {}) at {:#x}, {:?}",
            id,
            self.team,
            new_id,
            target.team,
            new_base,
            sharing
        );
        target_areas
            .unwrap_or(source_areas)
            .insert(new_base, clone);
        self.core.register_area(new_id, target.team);
        Ok((new_id, new_base))
    }

    /// Private anonymous copy of everything `area` sees
    fn copy_area_cache(&self, area: &MmArea, reservation: &mut MmReservation<'_>) -> Arc<MmCache> {
        let copy = self.core.create_anonymous_cache(area.size);
        let mapper = self.core.pfn.mapper();
        for index in 0..area.page_count() {
            let offset = index * PAGE;
            if let Some((_, pfn)) = area.cache.resolve_page(area.cache_offset + offset) {
                let page = reservation.allocate_page_unzeroed(MmPageState::Active);
                mm_copy_page(mapper, pfn, page);
                copy.insert_page(offset, page);
            }
        }
        copy
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn find_area(&self, id: AreaId) -> Option<AreaInfo> {
        self.areas
            .read()
            .values()
            .find(|a| a.id == id)
            .map(MmArea::info)
    }

    pub fn query_by_address(&self, addr: u64) -> Option<AreaInfo> {
        area_at(&self.areas.read(), addr).map(MmArea::info)
    }

    pub fn area_infos(&self) -> Vec<AreaInfo> {
        self.areas.read().values().map(MmArea::info).collect()
    }

    pub fn area_count(&self) -> usize {
        self.areas.read().len()
    }

    /// Pages currently present in the translation map
    pub fn mapped_pages(&self) -> usize {
        self.map.mapped_page_count()
    }

    // ========================================================================
    // CPU attachment
    // ========================================================================

    /// This space becomes current on `cpu`
    pub fn attach(&self, cpu: CpuId) {
        if self.is_user() {
            self.map.set_active_on_cpu(cpu, true);
        }
        self.core
            .cpus
            .load_translation_root(cpu, self.map.root_physical());
    }

    /// This space stops being current on `cpu`
    pub fn detach(&self, cpu: CpuId) {
        if self.is_user() {
            self.map.set_active_on_cpu(cpu, false);
        }
    }

    // ========================================================================
    // User memory access
    // ========================================================================

    /// Copy `data` to `va` in this space, faulting pages in as needed
    pub fn copy_to_user(&self, va: u64, data: &[u8]) -> MmResult<()> {
        let mapper = self.core.pfn.mapper();
        self.access(va, data.len(), true, |pfn, offset, range| {
            mm_write_page(mapper, pfn, offset, &data[range]);
        })
    }

    /// Copy from `va` in this space into `buffer`
    pub fn copy_from_user(&self, va: u64, buffer: &mut [u8]) -> MmResult<()> {
        let mapper = self.core.pfn.mapper();
        self.access(va, buffer.len(), false, |pfn, offset, range| {
            mm_read_page(mapper, pfn, offset, &mut buffer[range]);
        })
    }

    /// Walk `[va, va + len)` page by page through the MMU
    ///
    /// `f` runs with the translation map locked, so the page cannot be
    /// unmapped and freed underneath it.
    fn access(
        &self,
        va: u64,
        len: usize,
        write: bool,
        mut f: impl FnMut(Pfn, usize, Range<usize>),
    ) -> MmResult<()> {
        let user = self.is_user();
        let mut done = 0;
        while done < len {
            let addr = va.checked_add(done as u64).ok_or(MmError::BadAddress)?;
            let offset = (addr & (PAGE - 1)) as usize;
            let chunk = (PAGE_SIZE - offset).min(len - done);
            let page = addr & !(PAGE - 1);

            let mut attempts = 0;
            loop {
                let needed = FAULT_RESERVE_PAGES + self.map.max_pages_needed_to_map(page, page + PAGE);
                let mut reservation = self.core.pfn.reserve_pages(needed, true)?;
                let areas = self.areas.read();
                {
                    let _lock = MapLock::new(&*self.map);
                    if let Ok(physical) = self.map.translate_access(addr, write, user) {
                        f((physical >> PAGE_SHIFT) as Pfn, offset, done..done + chunk);
                        break;
                    }
                }
                if attempts == 2 {
                    return Err(MmError::BadAddress);
                }
                attempts += 1;
                mm_fault_locked(self, &areas, addr, write, user, &mut reservation)?;
            }
            done += chunk;
        }
        Ok(())
    }
}

impl Drop for MmAddressSpace {
    fn drop(&mut self) {
        let areas = core::mem::take(self.areas.get_mut());
        for area in areas.into_values() {
            self.teardown(area);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimMachine;
    use crate::mm::context::{MmConfig, MmContext};
    use crate::mm::store::MemoryStore;
    use alloc::vec;

    fn context(pages: u64) -> (SimMachine, MmContext) {
        let machine = SimMachine::new(2, pages);
        let config = MmConfig {
            system_reserve: 2,
            ..MmConfig::default()
        };
        let context = MmContext::init(machine.boot_info(), machine.platform(), config).unwrap();
        (machine, context)
    }

    #[test]
    fn test_first_fit_and_exact_placement() {
        let (_m, ctx) = context(256);
        let space = ctx.create_address_space(1).unwrap();
        let (_, a) = space
            .create_area(AreaRequest::anonymous("a", 0x3000))
            .unwrap();
        assert_eq!(a, USER_SPACE_START);
        let (_, b) = space
            .create_area(AreaRequest::anonymous("b", 0x1000))
            .unwrap();
        assert_eq!(b, a + 0x3000);

        let exact = USER_SPACE_START + 0x10_0000;
        let (_, c) = space
            .create_area(AreaRequest::anonymous("c", 0x2000).at(Placement::Exact(exact)))
            .unwrap();
        assert_eq!(c, exact);
        assert_eq!(
            space.create_area(AreaRequest::anonymous("d", 0x1000).at(Placement::Exact(exact + 0x1000))),
            Err(MmError::BadAddress)
        );
        assert_eq!(
            space.create_area(AreaRequest::anonymous("e", 0x1000).at(Placement::Exact(exact + 1))),
            Err(MmError::BadAddress)
        );

        let (_, h) = space
            .create_area(AreaRequest::anonymous("h", 0x1000).at(Placement::Hint(exact)))
            .unwrap();
        assert_eq!(h, exact + 0x2000);
        assert_eq!(space.area_count(), 4);
        assert_eq!(space.create_area(AreaRequest::anonymous("z", 0)), Err(MmError::BadValue));
    }

    #[test]
    fn test_full_wiring_populates_and_unwinds() {
        let (_m, ctx) = context(128);
        let space = ctx.create_address_space(1).unwrap();
        let (id, base) = space
            .create_area(AreaRequest::anonymous("wired", 0x4000).wiring(Wiring::Full))
            .unwrap();
        let info = space.find_area(id).unwrap();
        assert_eq!(info.wired_pages, 4);
        assert_eq!(info.resident_pages, 4);
        assert_eq!(info.state, AreaState::Mapped);
        assert!(space.map().query(base + 0x3000).unwrap().is_writable());

        let free = ctx.stats().free_total();
        assert_eq!(
            space.create_area(AreaRequest::anonymous("huge", 1 << 30).wiring(Wiring::Full)),
            Err(MmError::NoMemory)
        );
        assert_eq!(ctx.stats().free_total(), free);
        assert_eq!(space.area_count(), 1);

        space.delete_area(id).unwrap();
        ctx.pfn().validate().unwrap();
    }

    #[test]
    fn test_double_delete_is_bad_value() {
        let (_m, ctx) = context(128);
        let space = ctx.create_address_space(1).unwrap();
        let (id, base) = space
            .create_area(AreaRequest::anonymous("a", 0x2000))
            .unwrap();
        space.copy_to_user(base, b"hello").unwrap();
        space.delete_area(id).unwrap();
        assert_eq!(space.delete_area(id), Err(MmError::BadValue));
        assert!(space.find_area(id).is_none());
        assert!(space.map().query(base).is_none());
    }

    #[test]
    fn test_copy_user_round_trip_across_pages() {
        let (_m, ctx) = context(128);
        let space = ctx.create_address_space(1).unwrap();
        let (_, base) = space
            .create_area(AreaRequest::anonymous("buf", 0x3000))
            .unwrap();
        let data: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        space.copy_to_user(base + 0x800, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        space.copy_from_user(base + 0x800, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(space.soft_faults(), 2);
        assert_eq!(space.mapped_pages(), 2);

        let mut byte = [0u8; 1];
        assert_eq!(space.copy_from_user(base + 0x3000, &mut byte), Err(MmError::BadAddress));
    }

    #[test]
    fn test_protect_read_only_rejects_writes() {
        let (_m, ctx) = context(128);
        let space = ctx.create_address_space(1).unwrap();
        let (id, base) = space
            .create_area(AreaRequest::anonymous("ro", 0x1000))
            .unwrap();
        space.copy_to_user(base, &[1]).unwrap();
        space.protect_area(id, Protection::READ).unwrap();
        assert!(!space.map().query(base).unwrap().is_writable());
        assert_eq!(space.copy_to_user(base, &[2]), Err(MmError::BadAddress));

        space
            .protect_area(id, Protection::READ | Protection::WRITE)
            .unwrap();
        assert!(space.map().query(base).unwrap().is_writable());
        space.copy_to_user(base, &[3]).unwrap();

        space.protect_area(id, Protection::empty()).unwrap();
        assert!(space.map().query(base).is_none());
        let mut b = [0u8; 1];
        assert_eq!(space.copy_from_user(base, &mut b), Err(MmError::BadAddress));
    }

    #[test]
    fn test_resize_grow_shrink_and_collide() {
        let (_m, ctx) = context(128);
        let space = ctx.create_address_space(1).unwrap();
        let (a, base) = space
            .create_area(AreaRequest::anonymous("a", 0x2000))
            .unwrap();
        space
            .create_area(AreaRequest::anonymous("b", 0x1000).at(Placement::Exact(base + 0x4000)))
            .unwrap();

        space.resize_area(a, 0x4000).unwrap();
        space.copy_to_user(base + 0x3000, &[9]).unwrap();
        assert_eq!(space.resize_area(a, 0x5000), Err(MmError::NoMemory));

        space.resize_area(a, 0x1000).unwrap();
        assert_eq!(space.find_area(a).unwrap().size, 0x1000);
        assert!(space.map().query(base + 0x3000).is_none());
        let mut b = [0u8; 1];
        assert_eq!(space.copy_from_user(base + 0x3000, &mut b), Err(MmError::BadAddress));
        assert_eq!(space.resize_area(999, 0x1000), Err(MmError::BadValue));
    }

    #[test]
    fn test_regrown_forked_area_reads_zero() {
        let (_m, ctx) = context(128);
        let space = ctx.create_address_space(1).unwrap();
        let (id, base) = space
            .create_area(AreaRequest::anonymous("data", 0x3000))
            .unwrap();
        space.copy_to_user(base + 0x2000, &[0xAB; 4]).unwrap();
        let child = ctx.fork_address_space(1, 2).unwrap();

        space.resize_area(id, 0x1000).unwrap();
        space.resize_area(id, 0x3000).unwrap();
        let mut b = [0xFFu8; 4];
        space.copy_from_user(base + 0x2000, &mut b).unwrap();
        assert_eq!(b, [0; 4]);
        child.copy_from_user(base + 0x2000, &mut b).unwrap();
        assert_eq!(b, [0xAB; 4]);
    }

    #[test]
    fn test_failed_map_update_leaves_area_unchanged() {
        let (_m, ctx) = context(128);
        // A user map cannot translate kernel addresses, so every range
        // operation on it fails
        let map = ctx.core().create_user_map().unwrap();
        let space = MmAddressSpace::new(
            9,
            KERNEL_SPACE_START,
            KERNEL_SPACE_START + 0x10_0000,
            ctx.core().clone(),
            map,
        );
        let (id, _) = space
            .create_area(AreaRequest::anonymous("a", 0x2000))
            .unwrap();
        let before = space.find_area(id).unwrap();

        assert_eq!(space.protect_area(id, Protection::READ), Err(MmError::BadAddress));
        assert_eq!(space.protect_area(id, Protection::empty()), Err(MmError::BadAddress));
        assert_eq!(
            space.clone_area_into(id, &space, "a'", Placement::Any, Sharing::CopyOnWrite),
            Err(MmError::BadAddress)
        );
        let after = space.find_area(id).unwrap();
        assert_eq!(after.protection, before.protection);
        assert_eq!(after.cache, before.cache);
        assert_eq!(ctx.core().cache(after.cache).unwrap().consumer_count(), 0);
        assert_eq!(space.area_count(), 1);
    }

    #[test]
    fn test_shared_clone_sees_writes() {
        let (_m, ctx) = context(128);
        let s1 = ctx.create_address_space(1).unwrap();
        let s2 = ctx.create_address_space(2).unwrap();
        let (id, base) = s1.create_area(AreaRequest::anonymous("shm", 0x1000)).unwrap();
        let (clone, cbase) = s1
            .clone_area_into(id, &s2, "shm", Placement::Any, Sharing::Shared)
            .unwrap();
        s2.copy_to_user(cbase, b"ping").unwrap();
        let mut buf = [0u8; 4];
        s1.copy_from_user(base, &mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(s1.find_area(id).unwrap().cache, s2.find_area(clone).unwrap().cache);
        assert_eq!(s1.resize_area(id, 0x2000), Err(MmError::BadValue));
    }

    #[test]
    fn test_store_backed_area() {
        let (_m, ctx) = context(128);
        let space = ctx.create_address_space(1).unwrap();
        let store = Arc::new(MemoryStore::from_bytes(b"file contents".to_vec()));
        let (id, base) = space
            .create_area(AreaRequest::anonymous("file", 0x2000).backed_by(store.clone(), 0))
            .unwrap();
        let mut buf = [0u8; 13];
        space.copy_from_user(base, &mut buf).unwrap();
        assert_eq!(&buf, b"file contents");
        assert_eq!(space.hard_faults(), 1);

        space.copy_to_user(base, b"FILE").unwrap();
        space.resize_area(id, 0x1000).unwrap();
        let info = space.find_area(id).unwrap();
        let cache = ctx.core().cache(info.cache).unwrap();
        assert_eq!(cache.write_modified_pages(0, 0x1000), Ok(1));
        let mut head = [0u8; 4];
        store.read_bytes(0, &mut head);
        assert_eq!(&head, b"FILE");
    }

    #[test]
    fn test_delete_all_areas_marks_space_busy() {
        let (_m, ctx) = context(128);
        let space = ctx.create_address_space(1).unwrap();
        space.create_area(AreaRequest::anonymous("a", 0x1000)).unwrap();
        space.create_area(AreaRequest::anonymous("b", 0x1000)).unwrap();
        assert_eq!(space.delete_all_areas(), 2);
        assert_eq!(
            space.create_area(AreaRequest::anonymous("c", 0x1000)),
            Err(MmError::Busy)
        );
    }
}
