//! Kernel Memory Context
//!
//! [`MmContext`] is the memory manager as a whole: the PFN database, the
//! kernel translation map and address space, every team's address space,
//! the low-memory monitor and the page daemon. The kernel builds exactly
//! one during phase 0 initialization and passes it by reference.
//!
//! [`MmCore`] is the part shared with address spaces and the page daemon:
//! allocator, CPU services, configuration, id generators and the cache
//! registry.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::{Mutex, RwLock};

use super::address::{
    MmAddressSpace, TeamId, KERNEL_SPACE_START, KERNEL_TEAM, USER_SPACE_END, USER_SPACE_START,
};
use super::cache::{CacheId, MmCache};
use super::error::{MmError, MmResult};
use super::fault::mm_access_fault;
use super::lowmem::{LowMemoryLevel, LowMemoryMonitor};
use super::pfn::{MmStats, PfnDatabase, PAGE_SHIFT};
use super::physical::{BootInfo, PhysicalPageMapper};
use super::store::BackingStore;
use super::translation::{ArchTranslationMap, TranslationMap};
use super::vad::{AreaId, AreaInfo, AreaRequest, Placement, Protection, Sharing};
use super::ws::PageDaemon;
use crate::ke::cpu::{CpuId, CpuServices};

/// Hardware services the memory manager runs on
#[derive(Clone)]
pub struct MmPlatform {
    pub cpus: Arc<dyn CpuServices>,
    pub mapper: Arc<dyn PhysicalPageMapper>,
}

/// Boot-time memory manager configuration
#[derive(Debug, Clone)]
pub struct MmConfig {
    /// Lowest address user areas may occupy
    pub user_base: u64,
    /// Exclusive end of user space
    pub user_end: u64,
    /// Base of the kernel area range
    pub kernel_base: u64,
    /// Size of the kernel area range
    pub kernel_size: u64,
    /// Available-page thresholds, percent of managed pages
    pub low_memory_note_percent: usize,
    pub low_memory_warning_percent: usize,
    pub low_memory_critical_percent: usize,
    /// Minimum interval between low-memory checks
    pub low_memory_poll_ms: u64,
    /// Pages the page daemon looks at per pass
    pub page_scan_batch: usize,
    /// Pages only privileged allocation may take
    pub system_reserve: usize,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            user_base: USER_SPACE_START,
            user_end: USER_SPACE_END + 1,
            kernel_base: KERNEL_SPACE_START,
            kernel_size: 1 << 39,
            low_memory_note_percent: 10,
            low_memory_warning_percent: 5,
            low_memory_critical_percent: 1,
            low_memory_poll_ms: 1000,
            page_scan_batch: 256,
            system_reserve: 16,
        }
    }
}

/// State shared by every address space
pub struct MmCore {
    pub pfn: Arc<PfnDatabase>,
    pub cpus: Arc<dyn CpuServices>,
    pub config: MmConfig,
    kernel_map: Arc<ArchTranslationMap>,
    next_cache_id: AtomicU64,
    next_area_id: AtomicU32,
    caches: Mutex<BTreeMap<CacheId, Weak<MmCache>>>,
    /// Owning team of every live area
    area_teams: Mutex<BTreeMap<AreaId, TeamId>>,
}

impl MmCore {
    pub fn kernel_map(&self) -> &Arc<ArchTranslationMap> {
        &self.kernel_map
    }

    /// Fresh user translation map sharing the kernel half
    pub fn create_user_map(&self) -> MmResult<Arc<dyn TranslationMap>> {
        let mut reservation = self.pfn.reserve_pages(1, true)?;
        Ok(Arc::new(ArchTranslationMap::new_user(
            &self.kernel_map,
            &mut reservation,
        )))
    }

    pub fn next_area_id(&self) -> AreaId {
        self.next_area_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn register_area(&self, id: AreaId, team: TeamId) {
        self.area_teams.lock().insert(id, team);
    }

    pub(super) fn unregister_area(&self, id: AreaId) {
        self.area_teams.lock().remove(&id);
    }

    /// Team whose address space holds area `id`
    pub fn area_team(&self, id: AreaId) -> Option<TeamId> {
        self.area_teams.lock().get(&id).copied()
    }

    fn next_cache_id(&self) -> CacheId {
        CacheId::new(self.next_cache_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register_cache(&self, cache: Arc<MmCache>) -> Arc<MmCache> {
        let mut caches = self.caches.lock();
        caches.retain(|_, weak| weak.strong_count() != 0);
        caches.insert(cache.id(), Arc::downgrade(&cache));
        cache
    }

    pub fn create_anonymous_cache(&self, size: u64) -> Arc<MmCache> {
        self.register_cache(MmCache::new_anonymous(
            self.next_cache_id(),
            self.pfn.clone(),
            size,
        ))
    }

    pub fn create_store_cache(&self, store: Arc<dyn BackingStore>) -> Arc<MmCache> {
        self.register_cache(MmCache::new_store(
            self.next_cache_id(),
            self.pfn.clone(),
            store,
        ))
    }

    pub fn create_layer(&self, source: &Arc<MmCache>) -> Arc<MmCache> {
        self.register_cache(MmCache::new_layer(self.next_cache_id(), source))
    }

    /// Live cache by id
    pub fn cache(&self, id: CacheId) -> Option<Arc<MmCache>> {
        self.caches.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Forget caches that have been destroyed
    pub fn prune_caches(&self) -> usize {
        let mut caches = self.caches.lock();
        let before = caches.len();
        caches.retain(|_, weak| weak.strong_count() != 0);
        before - caches.len()
    }

    /// Registry entries, live or not yet pruned
    pub fn registered_caches(&self) -> usize {
        self.caches.lock().len()
    }

    pub fn cache_count(&self) -> usize {
        self.caches
            .lock()
            .values()
            .filter(|weak| weak.strong_count() != 0)
            .count()
    }
}

/// The memory manager
pub struct MmContext {
    core: Arc<MmCore>,
    kernel_space: Arc<MmAddressSpace>,
    spaces: RwLock<BTreeMap<TeamId, Arc<MmAddressSpace>>>,
    /// Address space current on each CPU
    current: Vec<Mutex<Option<Arc<MmAddressSpace>>>>,
    monitor: Arc<LowMemoryMonitor>,
    daemon: Arc<PageDaemon>,
}

/// Priority of the page daemon among low-memory handlers
const PAGE_DAEMON_PRIORITY: i32 = 100;

impl MmContext {
    /// Phase 0 initialization
    ///
    /// Seeds the PFN database from the boot memory map, builds the kernel
    /// translation map and address space, maps the kernel argument ranges
    /// and registers the page daemon with the low-memory monitor.
    pub fn init(boot: &BootInfo, platform: MmPlatform, config: MmConfig) -> MmResult<Self> {
        if config.user_base >= config.user_end || config.kernel_size == 0 {
            return Err(MmError::BadValue);
        }

        let pfn = Arc::new(PfnDatabase::new(
            boot,
            platform.mapper.clone(),
            platform.cpus.clone(),
            config.system_reserve,
        ));

        let kernel_map = {
            let pages = ArchTranslationMap::kernel_map_pages(config.kernel_base, config.kernel_size);
            let mut reservation = pfn.reserve_pages(pages, false)?;
            Arc::new(ArchTranslationMap::new_kernel(
                pfn.clone(),
                platform.cpus.clone(),
                config.kernel_base,
                config.kernel_size,
                &mut reservation,
            ))
        };

        let core = Arc::new(MmCore {
            pfn: pfn.clone(),
            cpus: platform.cpus.clone(),
            config: config.clone(),
            kernel_map: kernel_map.clone(),
            next_cache_id: AtomicU64::new(1),
            next_area_id: AtomicU32::new(1),
            caches: Mutex::new(BTreeMap::new()),
            area_teams: Mutex::new(BTreeMap::new()),
        });

        let kernel_space = Arc::new(MmAddressSpace::new(
            KERNEL_TEAM,
            config.kernel_base,
            config.kernel_base + config.kernel_size,
            core.clone(),
            kernel_map,
        ));

        let cpu_count = platform.cpus.cpu_count();
        let current = (0..cpu_count)
            .map(|_| Mutex::new(Some(kernel_space.clone())))
            .collect();

        let monitor = Arc::new(LowMemoryMonitor::new(pfn.clone(), &config));
        let daemon = Arc::new(PageDaemon::new(core.clone(), config.page_scan_batch));
        let handler = daemon.clone();
        monitor.register(
            "page daemon",
            PAGE_DAEMON_PRIORITY,
            Box::new(move |level| {
                handler.run(level);
            }),
        );
        let waiting = Arc::downgrade(&monitor);
        pfn.set_pressure_hook(Box::new(move || {
            if let Some(monitor) = waiting.upgrade() {
                monitor.kick();
            }
        }));

        let mut spaces = BTreeMap::new();
        spaces.insert(KERNEL_TEAM, kernel_space.clone());

        let context = Self {
            core,
            kernel_space,
            spaces: RwLock::new(spaces),
            current,
            monitor,
            daemon,
        };
        context.map_kernel_args(boot)?;

        let stats = pfn.stats();
        log::info!(
            "[MM] initialized: {} pages ({} KB) managed, {} free, {} wired, {} CPUs",
            stats.total_pages,
            stats.total_bytes() / 1024,
            stats.free_total(),
            stats.wired_pages,
            cpu_count
        );
        Ok(context)
    }

    /// Give each boot-time kernel argument range a wired kernel area
    fn map_kernel_args(&self, boot: &BootInfo) -> MmResult<()> {
        for (index, range) in boot.kernel_args.iter().enumerate() {
            if range.page_count == 0 {
                continue;
            }
            let first = (range.physical_start >> PAGE_SHIFT) as usize;
            let frames: Vec<_> = (first..first + range.page_count as usize).collect();
            let (_, base) = self
                .kernel_space
                .adopt_frames(&format!("kernel args {}", index), &frames)?;
            log::debug!(
                "[MM] kernel args {:#x}+{} pages mapped at {:#x}",
                range.physical_start,
                range.page_count,
                base
            );
        }
        Ok(())
    }

    pub fn core(&self) -> &Arc<MmCore> {
        &self.core
    }

    pub fn pfn(&self) -> &Arc<PfnDatabase> {
        &self.core.pfn
    }

    pub fn config(&self) -> &MmConfig {
        &self.core.config
    }

    pub fn kernel_space(&self) -> &Arc<MmAddressSpace> {
        &self.kernel_space
    }

    pub fn monitor(&self) -> &LowMemoryMonitor {
        &self.monitor
    }

    pub fn daemon(&self) -> &Arc<PageDaemon> {
        &self.daemon
    }

    pub fn stats(&self) -> MmStats {
        self.core.pfn.stats()
    }

    // ========================================================================
    // Address spaces
    // ========================================================================

    pub fn create_address_space(&self, team: TeamId) -> MmResult<Arc<MmAddressSpace>> {
        if self.spaces.read().contains_key(&team) {
            return Err(MmError::BadValue);
        }
        let map = self.core.create_user_map()?;
        let space = Arc::new(MmAddressSpace::new(
            team,
            self.core.config.user_base,
            self.core.config.user_end,
            self.core.clone(),
            map,
        ));

        let mut spaces = self.spaces.write();
        if spaces.contains_key(&team) {
            return Err(MmError::BadValue);
        }
        spaces.insert(team, space.clone());
        log::debug!("[MM] team {} address space created", team);
        Ok(space)
    }

    pub fn address_space(&self, team: TeamId) -> Option<Arc<MmAddressSpace>> {
        self.spaces.read().get(&team).cloned()
    }

    /// Tear down a team's address space
    ///
    /// Every area is deleted now. The translation map goes away once no
    /// CPU has the space current any more.
    pub fn delete_address_space(&self, team: TeamId) -> MmResult<()> {
        if team == KERNEL_TEAM {
            return Err(MmError::BadValue);
        }
        let space = self
            .spaces
            .write()
            .remove(&team)
            .ok_or(MmError::BadValue)?;
        let deleted = space.delete_all_areas();
        log::debug!(
            "[MM] team {} address space deleted ({} areas)",
            team,
            deleted
        );
        Ok(())
    }

    /// Make `team`'s address space current on `cpu`
    pub fn switch_address_space(&self, cpu: CpuId, team: TeamId) -> MmResult<()> {
        let space = self.address_space(team).ok_or(MmError::BadValue)?;
        let slot = self.current.get(cpu).ok_or(MmError::BadValue)?;
        let mut current = slot.lock();
        if let Some(old) = current.as_ref() {
            if Arc::ptr_eq(old, &space) {
                return Ok(());
            }
            old.detach(cpu);
        }
        space.attach(cpu);
        *current = Some(space);
        Ok(())
    }

    pub fn current_address_space(&self, cpu: CpuId) -> Option<Arc<MmAddressSpace>> {
        self.current.get(cpu).and_then(|slot| slot.lock().clone())
    }

    /// Duplicate `parent`'s areas into a new address space for `child`
    ///
    /// Areas keep their addresses; private areas become copy-on-write,
    /// which is what `fork` needs.
    pub fn fork_address_space(&self, parent: TeamId, child: TeamId) -> MmResult<Arc<MmAddressSpace>> {
        let source = self.address_space(parent).ok_or(MmError::BadValue)?;
        let target = self.create_address_space(child)?;
        for info in source.area_infos() {
            let cloned = source.clone_area_into(
                info.id,
                &target,
                &info.name,
                Placement::Exact(info.base),
                Sharing::CopyOnWrite,
            );
            if let Err(err) = cloned {
                self.delete_address_space(child)?;
                return Err(err);
            }
        }
        log::debug!("[MM] team {} forked into team {}", parent, child);
        Ok(target)
    }

    // ========================================================================
    // Areas
    // ========================================================================

    fn space_of_area(&self, id: AreaId) -> MmResult<Arc<MmAddressSpace>> {
        let team = self.core.area_team(id).ok_or(MmError::BadValue)?;
        self.address_space(team).ok_or(MmError::BadValue)
    }

    pub fn create_area(&self, team: TeamId, request: AreaRequest) -> MmResult<(AreaId, u64)> {
        self.address_space(team)
            .ok_or(MmError::BadValue)?
            .create_area(request)
    }

    /// Delete an area; deleting it again fails with `BadValue`
    pub fn delete_area(&self, id: AreaId) -> MmResult<()> {
        self.space_of_area(id)?.delete_area(id)
    }

    pub fn resize_area(&self, id: AreaId, new_size: u64) -> MmResult<()> {
        self.space_of_area(id)?.resize_area(id, new_size)
    }

    pub fn protect_area(&self, id: AreaId, protection: Protection) -> MmResult<()> {
        self.space_of_area(id)?.protect_area(id, protection)
    }

    pub fn clone_area(
        &self,
        id: AreaId,
        target_team: TeamId,
        name: &str,
        placement: Placement,
        sharing: Sharing,
    ) -> MmResult<(AreaId, u64)> {
        let source = self.space_of_area(id)?;
        let target = self.address_space(target_team).ok_or(MmError::BadValue)?;
        source.clone_area_into(id, &target, name, placement, sharing)
    }

    pub fn find_area(&self, id: AreaId) -> Option<AreaInfo> {
        self.space_of_area(id).ok()?.find_area(id)
    }

    pub fn query_address(&self, team: TeamId, addr: u64) -> Option<AreaInfo> {
        self.address_space(team)?.query_by_address(addr)
    }

    /// Entry from the architecture page-fault handler
    pub fn handle_page_fault(&self, team: TeamId, addr: u64, is_write: bool, is_user: bool) -> MmResult<()> {
        let space = if is_user || addr < KERNEL_SPACE_START {
            self.address_space(team).ok_or(MmError::BadAddress)?
        } else {
            self.kernel_space.clone()
        };
        mm_access_fault(&space, addr, is_write, is_user)
    }

    // ========================================================================
    // Low memory
    // ========================================================================

    /// Sample memory pressure now
    pub fn check_low_memory(&self) -> LowMemoryLevel {
        self.monitor.check()
    }

    /// Periodic timer entry
    pub fn tick(&self, now_ms: u64) -> Option<LowMemoryLevel> {
        self.monitor.tick(now_ms)
    }
}
