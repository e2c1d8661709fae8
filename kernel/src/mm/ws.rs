//! Working Set Management (ws)
//!
//! The page daemon keeps the Active queue honest and gives pages back
//! under memory pressure:
//! - Aging: clear accessed/dirty bits through every mapping of a page;
//!   a page that was not referenced since the last pass is deactivated
//! - Reclaim: unreferenced Inactive/Modified pages of store-backed caches
//!   are written back if dirty, unmapped and freed
//!
//! Anonymous pages have nowhere to go and are never reclaimed.
//!
//! The daemon is registered as a low-memory handler and runs with the
//! monitor's lock held.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use super::cache::{CacheKind, MmCache};
use super::context::MmCore;
use super::lowmem::LowMemoryLevel;
use super::pfn::{MmPageState, Pfn};

/// Page daemon statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageDaemonStats {
    /// Aging passes over the Active queue
    pub passes: u64,
    /// Pages moved to Inactive
    pub deactivated: u64,
    /// Inactive pages found referenced again
    pub reactivated: u64,
    /// Pages freed
    pub reclaimed: u64,
}

pub struct PageDaemon {
    core: Arc<MmCore>,
    scan_batch: usize,
    passes: AtomicU64,
    deactivated: AtomicU64,
    reactivated: AtomicU64,
    reclaimed: AtomicU64,
}

impl PageDaemon {
    pub fn new(core: Arc<MmCore>, scan_batch: usize) -> Self {
        Self {
            core,
            scan_batch: scan_batch.max(1),
            passes: AtomicU64::new(0),
            deactivated: AtomicU64::new(0),
            reactivated: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> PageDaemonStats {
        PageDaemonStats {
            passes: self.passes.load(Ordering::Relaxed),
            deactivated: self.deactivated.load(Ordering::Relaxed),
            reactivated: self.reactivated.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Cache and offset currently holding `pfn`
    ///
    /// The owner record is only a hint; the cache index decides.
    fn owner_of(&self, pfn: Pfn) -> Option<(Arc<MmCache>, u64)> {
        let owner = self.core.pfn.owner(pfn)?;
        let cache = self.core.cache(owner.cache)?;
        (cache.lookup_page(owner.offset) == Some(pfn)).then_some((cache, owner.offset))
    }

    /// One aging pass over the Active queue
    ///
    /// Returns the number of pages deactivated.
    pub fn scan_active(&self) -> usize {
        let pfdb = &self.core.pfn;
        let mut deactivated = 0;
        for pfn in pfdb.pages_in_state(MmPageState::Active, self.scan_batch) {
            let Some((cache, offset)) = self.owner_of(pfn) else {
                continue;
            };
            let Some(age) = cache.age_page(offset) else {
                continue;
            };

            // Dirty bits only matter where there is a store to write to
            if cache.kind() != CacheKind::Store
                && pfdb.page_state(pfn) == Some(MmPageState::Modified)
            {
                let to = if age.accessed {
                    MmPageState::Active
                } else {
                    MmPageState::Inactive
                };
                if pfdb.transition_page(pfn, MmPageState::Modified, to) && !age.accessed {
                    deactivated += 1;
                }
                continue;
            }

            if !age.accessed && pfdb.transition_page(pfn, MmPageState::Active, MmPageState::Inactive) {
                deactivated += 1;
            }
        }

        self.passes.fetch_add(1, Ordering::Relaxed);
        self.deactivated
            .fetch_add(deactivated as u64, Ordering::Relaxed);
        log::trace!("[MM] page daemon: {} pages deactivated", deactivated);
        deactivated
    }

    /// Free up to `target` unreferenced store-backed pages
    pub fn reclaim(&self, target: usize) -> usize {
        let pfdb = &self.core.pfn;
        let mut reclaimed = 0;
        for state in [MmPageState::Inactive, MmPageState::Modified] {
            for pfn in pfdb.pages_in_state(state, self.scan_batch) {
                if reclaimed >= target {
                    break;
                }
                let Some((cache, offset)) = self.owner_of(pfn) else {
                    continue;
                };
                if cache.kind() != CacheKind::Store {
                    continue;
                }
                let Some(age) = cache.age_page(offset) else {
                    continue;
                };
                if age.accessed {
                    if pfdb.transition_page(pfn, MmPageState::Inactive, MmPageState::Active) {
                        self.reactivated.fetch_add(1, Ordering::Relaxed);
                    }
                    continue;
                }
                match cache.try_reclaim_page(offset) {
                    Ok(true) => reclaimed += 1,
                    Ok(false) => {}
                    Err(err) => {
                        log::warn!(
                            "[MM] page daemon: writeback of {} offset {:#x} failed: {}",
                            cache.id(),
                            offset,
                            err
                        );
                    }
                }
            }
        }

        self.reclaimed.fetch_add(reclaimed as u64, Ordering::Relaxed);
        reclaimed
    }

    /// Low-memory handler entry
    pub fn run(&self, level: LowMemoryLevel) {
        let target = match level {
            LowMemoryLevel::Normal => return,
            LowMemoryLevel::Note => 0,
            LowMemoryLevel::Warning => self.scan_batch / 2,
            LowMemoryLevel::Critical => self.scan_batch,
        };
        let deactivated = self.scan_active();
        let reclaimed = if target != 0 { self.reclaim(target) } else { 0 };
        let pruned = self.core.prune_caches();
        log::debug!(
            "[MM] page daemon ({}): {} deactivated, {} reclaimed, {} caches pruned",
            level,
            deactivated,
            reclaimed,
            pruned
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimMachine;
    use crate::mm::context::{MmConfig, MmContext};
    use crate::mm::store::MemoryStore;
    use crate::mm::vad::AreaRequest;
    use alloc::vec;

    fn context() -> (SimMachine, MmContext) {
        let machine = SimMachine::new(1, 128);
        let config = MmConfig {
            system_reserve: 2,
            ..MmConfig::default()
        };
        let context = MmContext::init(machine.boot_info(), machine.platform(), config).unwrap();
        (machine, context)
    }

    fn page_of(ctx: &MmContext, team: u32, va: u64) -> Pfn {
        ctx.address_space(team)
            .unwrap()
            .map()
            .query(va)
            .unwrap()
            .pfn()
    }

    #[test]
    fn test_two_passes_deactivate_idle_pages() {
        let (_m, ctx) = context();
        let space = ctx.create_address_space(1).unwrap();
        let store = Arc::new(MemoryStore::from_bytes(vec![7u8; 0x2000]));
        let (_, base) = space
            .create_area(AreaRequest::anonymous("file", 0x2000).backed_by(store.clone(), 0))
            .unwrap();
        let mut buf = [0u8; 1];
        space.copy_from_user(base, &mut buf).unwrap();
        space.copy_from_user(base + 0x1000, &mut buf).unwrap();
        let page = page_of(&ctx, 1, base);

        let daemon = ctx.daemon();
        daemon.scan_active();
        assert_eq!(ctx.pfn().page_state(page), Some(MmPageState::Active));
        assert_eq!(daemon.scan_active(), 2);
        assert_eq!(ctx.pfn().page_state(page), Some(MmPageState::Inactive));

        assert_eq!(daemon.reclaim(8), 2);
        assert!(space.map().query(base).is_none());
        assert_eq!(store.read_count(), 2);

        space.copy_from_user(base, &mut buf).unwrap();
        assert_eq!(buf[0], 7);
        assert_eq!(space.hard_faults(), 3);
        ctx.pfn().validate().unwrap();
    }

    #[test]
    fn test_dirty_page_written_back_before_free() {
        let (_m, ctx) = context();
        let space = ctx.create_address_space(1).unwrap();
        let store = Arc::new(MemoryStore::new(0x1000));
        let (_, base) = space
            .create_area(AreaRequest::anonymous("file", 0x1000).backed_by(store.clone(), 0))
            .unwrap();
        space.copy_to_user(base + 16, b"dirty").unwrap();
        let page = page_of(&ctx, 1, base);

        let daemon = ctx.daemon();
        daemon.scan_active();
        assert_eq!(ctx.pfn().page_state(page), Some(MmPageState::Modified));
        assert_eq!(daemon.reclaim(1), 1);
        assert_eq!(store.write_count(), 1);
        let mut back = [0u8; 5];
        store.read_bytes(16, &mut back);
        assert_eq!(&back, b"dirty");
    }

    #[test]
    fn test_referenced_page_is_reactivated() {
        let (_m, ctx) = context();
        let space = ctx.create_address_space(1).unwrap();
        let store = Arc::new(MemoryStore::new(0x1000));
        let (_, base) = space
            .create_area(AreaRequest::anonymous("file", 0x1000).backed_by(store, 0))
            .unwrap();
        let mut buf = [0u8; 1];
        space.copy_from_user(base, &mut buf).unwrap();
        let page = page_of(&ctx, 1, base);

        let daemon = ctx.daemon();
        daemon.scan_active();
        daemon.scan_active();
        assert_eq!(ctx.pfn().page_state(page), Some(MmPageState::Inactive));
        space.copy_from_user(base, &mut buf).unwrap();
        assert_eq!(daemon.reclaim(1), 0);
        assert_eq!(ctx.pfn().page_state(page), Some(MmPageState::Active));
        assert_eq!(daemon.stats().reactivated, 1);
    }

    #[test]
    fn test_anonymous_pages_never_reclaimed() {
        let (_m, ctx) = context();
        let space = ctx.create_address_space(1).unwrap();
        let (_, base) = space
            .create_area(AreaRequest::anonymous("heap", 0x1000))
            .unwrap();
        space.copy_to_user(base, b"keep").unwrap();
        let page = page_of(&ctx, 1, base);

        let daemon = ctx.daemon();
        daemon.scan_active();
        assert_eq!(ctx.pfn().page_state(page), Some(MmPageState::Active));
        daemon.scan_active();
        assert_eq!(ctx.pfn().page_state(page), Some(MmPageState::Inactive));
        daemon.run(LowMemoryLevel::Critical);
        assert_eq!(daemon.stats().reclaimed, 0);
        let mut back = [0u8; 4];
        space.copy_from_user(base, &mut back).unwrap();
        assert_eq!(&back, b"keep");
    }
}
