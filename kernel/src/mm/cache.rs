//! Caches and Copy-on-Write Chains
//!
//! A cache owns the physical pages backing one extent of content, indexed
//! by byte offset. Areas map a window of a cache into an address space.
//!
//! # Kinds
//!
//! - **Anonymous**: terminal cache whose missing pages read as zero
//! - **Store**: terminal cache whose missing pages are read from a
//!   [`BackingStore`]
//! - **Layer**: copy-on-write cache with a `source`; missing pages are
//!   looked up in the source chain
//!
//! # Chains
//!
//! Forking interposes a new layer over a shared cache for each side. A
//! read fault maps the nearest page in the chain read-only; a write fault
//! copies it into the faulting layer. From any layer's point of view an
//! offset resolves to exactly one page: the one in the nearest cache that
//! holds it.
//!
//! # Locking
//!
//! Chain locks are taken child to source. A fault holds every lock from the
//! faulting cache down to the cache that supplies the page until the page
//! is installed in the translation map, so merges and reclaim cannot pull
//! the page out from under it.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use alloc::collections::BTreeMap;
use core::fmt;

use spin::Mutex;

use super::error::{MmError, MmResult};
use super::pfn::{MmPageState, MmReservation, PageOwner, Pfn, PfnDatabase, PAGE_SIZE};
use super::physical::{mm_copy_page, mm_with_page, mm_with_page_mut};
use super::store::BackingStore;
use super::translation::TranslationMap;
use super::vad::AreaId;
use crate::ke::bugcheck::{codes, ke_bugcheck_ex};

const PAGE: u64 = PAGE_SIZE as u64;

/// Cache identifier, unique for the lifetime of the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheId(u64);

impl CacheId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CacheId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cache#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Anonymous,
    Store,
    Layer,
}

/// Where an area maps this cache
#[derive(Clone)]
pub struct CacheAreaRef {
    pub area: AreaId,
    pub base: u64,
    pub size: u64,
    /// Cache offset mapped at `base`
    pub cache_offset: u64,
    pub map: Arc<dyn TranslationMap>,
}

impl CacheAreaRef {
    /// Virtual address at which this area maps `offset`, if it does
    pub fn address_of(&self, offset: u64) -> Option<u64> {
        (offset >= self.cache_offset && offset - self.cache_offset < self.size)
            .then(|| self.base + (offset - self.cache_offset))
    }
}

/// Page handed to a fault's install step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultedPage {
    pub pfn: Pfn,
    /// False when the page belongs to a source cache and must be mapped
    /// copy-on-write
    pub writable: bool,
}

/// What a fault had to do to find its page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultOutcome {
    /// Content was read from a store
    pub hard: bool,
    /// A source page was copied into the faulting cache
    pub copied: bool,
}

/// Result of one aging step on a page
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageAge {
    pub accessed: bool,
    pub modified: bool,
    pub mappings: usize,
}

struct CacheInner {
    pages: BTreeMap<u64, Pfn>,
    source: Option<Arc<MmCache>>,
    consumers: Vec<(CacheId, Weak<MmCache>)>,
    areas: Vec<CacheAreaRef>,
    /// End of the extent this cache covers
    virtual_end: u64,
    /// Lowest end this cache was ever truncated to; offsets at or beyond it
    /// are never looked up in the source
    source_end: u64,
}

impl CacheInner {
    fn new(source: Option<Arc<MmCache>>, virtual_end: u64) -> Self {
        Self {
            pages: BTreeMap::new(),
            source,
            consumers: Vec::new(),
            areas: Vec::new(),
            virtual_end,
            source_end: u64::MAX,
        }
    }

    /// Source to consult for `offset`, if any
    fn source_for(&self, offset: u64) -> Option<&Arc<MmCache>> {
        self.source.as_ref().filter(|_| offset < self.source_end)
    }
}

/// Chain lookup result handed to the walker's continuation
enum ChainHit<'a> {
    Found(Pfn),
    /// A layer was truncated below `offset`; the content is zero
    Truncated,
    Missing {
        terminal: &'a MmCache,
        inner: &'a mut CacheInner,
    },
}

pub struct MmCache {
    id: CacheId,
    kind: CacheKind,
    store: Option<Arc<dyn BackingStore>>,
    pfn: Arc<PfnDatabase>,
    inner: Mutex<CacheInner>,
}

fn round_up(value: u64) -> u64 {
    (value + PAGE - 1) & !(PAGE - 1)
}

impl MmCache {
    /// Zero-fill cache covering `size` bytes
    pub fn new_anonymous(id: CacheId, pfn: Arc<PfnDatabase>, size: u64) -> Arc<Self> {
        log::trace!("[MM] {} anonymous, {:#x} bytes", id, size);
        Arc::new(Self {
            id,
            kind: CacheKind::Anonymous,
            store: None,
            pfn,
            inner: Mutex::new(CacheInner::new(None, round_up(size))),
        })
    }

    /// Cache over the content of `store`
    pub fn new_store(id: CacheId, pfn: Arc<PfnDatabase>, store: Arc<dyn BackingStore>) -> Arc<Self> {
        let end = round_up(store.size());
        log::trace!("[MM] {} store-backed, {:#x} bytes", id, end);
        Arc::new(Self {
            id,
            kind: CacheKind::Store,
            store: Some(store),
            pfn,
            inner: Mutex::new(CacheInner::new(None, end)),
        })
    }

    /// Copy-on-write layer over `source`
    pub fn new_layer(id: CacheId, source: &Arc<MmCache>) -> Arc<Self> {
        let mut source_inner = source.inner.lock();
        let cache = Arc::new(Self {
            id,
            kind: CacheKind::Layer,
            store: None,
            pfn: source.pfn.clone(),
            inner: Mutex::new(CacheInner::new(
                Some(source.clone()),
                source_inner.virtual_end,
            )),
        });
        source_inner
            .consumers
            .push((id, Arc::downgrade(&cache)));
        log::trace!("[MM] {} layered over {}", id, source.id);
        cache
    }

    #[inline]
    pub fn id(&self) -> CacheId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    pub fn store(&self) -> Option<&Arc<dyn BackingStore>> {
        self.store.as_ref()
    }

    pub fn source(&self) -> Option<Arc<MmCache>> {
        self.inner.lock().source.clone()
    }

    pub fn virtual_end(&self) -> u64 {
        self.inner.lock().virtual_end
    }

    // ========================================================================
    // Page index
    // ========================================================================

    pub fn lookup_page(&self, offset: u64) -> Option<Pfn> {
        self.inner.lock().pages.get(&offset).copied()
    }

    /// Add an owned page at `offset`
    ///
    /// The offset must be free in this cache.
    pub fn insert_page(&self, offset: u64, pfn: Pfn) {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, offset, pfn);
    }

    fn insert_locked(&self, inner: &mut CacheInner, offset: u64, pfn: Pfn) {
        if let Some(&existing) = inner.pages.get(&offset) {
            ke_bugcheck_ex(
                codes::MEMORY_MANAGEMENT,
                codes::mm_check::CACHE_OFFSET_OCCUPIED,
                self.id.as_u64(),
                offset,
                existing as u64,
            );
        }
        self.pfn.set_owner(
            pfn,
            Some(PageOwner {
                cache: self.id,
                offset,
            }),
        );
        inner.pages.insert(offset, pfn);
    }

    /// Take the page at `offset` out of the index
    ///
    /// The caller now owns the frame and must free it.
    pub fn remove_page(&self, offset: u64) -> Option<Pfn> {
        let pfn = self.inner.lock().pages.remove(&offset)?;
        self.pfn.set_owner(pfn, None);
        Some(pfn)
    }

    pub fn resident_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Resident pages and their offsets, lowest offset first
    pub fn pages(&self) -> Vec<(u64, Pfn)> {
        self.inner.lock().pages.iter().map(|(&o, &p)| (o, p)).collect()
    }

    /// Pages this cache may have to supply from RAM
    ///
    /// Anonymous caches commit their whole extent. Layers only commit the
    /// copies they already hold; store caches can always be refilled.
    pub fn committed_pages(&self) -> usize {
        let inner = self.inner.lock();
        match self.kind {
            CacheKind::Anonymous => (inner.virtual_end / PAGE) as usize,
            CacheKind::Layer => inner.pages.len(),
            CacheKind::Store => 0,
        }
    }

    /// Number of caches from this one to the end of its chain
    pub fn chain_depth(&self) -> usize {
        let mut depth = 1;
        let mut next = self.source();
        while let Some(cache) = next {
            depth += 1;
            next = cache.source();
        }
        depth
    }

    /// Page visible at `offset` from this cache and the cache holding it
    pub fn resolve_page(&self, offset: u64) -> Option<(CacheId, Pfn)> {
        let mut next = {
            let inner = self.inner.lock();
            if let Some(&pfn) = inner.pages.get(&offset) {
                return Some((self.id, pfn));
            }
            inner.source_for(offset).cloned()
        };
        while let Some(cache) = next {
            let inner = cache.inner.lock();
            if let Some(&pfn) = inner.pages.get(&offset) {
                return Some((cache.id, pfn));
            }
            next = inner.source_for(offset).cloned();
        }
        None
    }

    /// Whether `offset` is still looked up in the source
    fn sees_source(&self, offset: u64) -> bool {
        self.inner.lock().source_for(offset).is_some()
    }

    // ========================================================================
    // Areas and consumers
    // ========================================================================

    pub fn add_area(&self, area: CacheAreaRef) {
        self.inner.lock().areas.push(area);
    }

    pub fn remove_area(&self, area: AreaId) -> Option<CacheAreaRef> {
        let mut inner = self.inner.lock();
        let index = inner.areas.iter().position(|a| a.area == area)?;
        Some(inner.areas.swap_remove(index))
    }

    /// Update where `area` maps this cache
    pub fn update_area(&self, area: AreaId, base: u64, size: u64, cache_offset: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.areas.iter_mut().find(|a| a.area == area) {
            Some(entry) => {
                entry.base = base;
                entry.size = size;
                entry.cache_offset = cache_offset;
                true
            }
            None => false,
        }
    }

    pub fn area_count(&self) -> usize {
        self.inner.lock().areas.len()
    }

    pub fn areas(&self) -> Vec<CacheAreaRef> {
        self.inner.lock().areas.clone()
    }

    /// Live caches layered directly over this one
    pub fn consumers(&self) -> Vec<Arc<MmCache>> {
        self.inner
            .lock()
            .consumers
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    // ========================================================================
    // Faults
    // ========================================================================

    /// Resolve a fault at `offset` and install the page
    ///
    /// `install` runs with the chain locked and receives the page to map.
    /// Every page the fault allocates comes from `reservation`, which must
    /// hold at least two pages plus whatever `install` needs.
    pub fn fault<F>(
        self: &Arc<Self>,
        offset: u64,
        is_write: bool,
        reservation: &mut MmReservation<'_>,
        install: F,
    ) -> MmResult<FaultOutcome>
    where
        F: FnOnce(FaultedPage, &mut MmReservation<'_>) -> MmResult<()>,
    {
        let offset = offset & !(PAGE - 1);
        let mut inner = self.inner.lock();
        if offset >= inner.virtual_end {
            return Err(MmError::BadAddress);
        }

        if let Some(&pfn) = inner.pages.get(&offset) {
            self.pfn.activate_page(pfn);
            install(FaultedPage { pfn, writable: true }, reservation)?;
            return Ok(FaultOutcome::default());
        }

        if inner.source.is_some() && inner.source_for(offset).is_none() {
            let pfn = reservation.allocate_page(MmPageState::Active);
            self.insert_locked(&mut inner, offset, pfn);
            install(FaultedPage { pfn, writable: true }, reservation)?;
            return Ok(FaultOutcome::default());
        }

        let Some(source) = inner.source.clone() else {
            let (pfn, hard) = self.fill_terminal(offset, reservation)?;
            self.insert_locked(&mut inner, offset, pfn);
            install(FaultedPage { pfn, writable: true }, reservation)?;
            return Ok(FaultOutcome {
                hard,
                copied: false,
            });
        };

        Self::walk_chain(&source, offset, |hit| {
            let (pfn, hard) = match hit {
                ChainHit::Found(pfn) => (pfn, false),
                ChainHit::Missing { terminal, inner: terminal_inner }
                    if terminal.store.is_some() =>
                {
                    let (pfn, hard) = terminal.fill_terminal(offset, reservation)?;
                    terminal.insert_locked(terminal_inner, offset, pfn);
                    (pfn, hard)
                }
                ChainHit::Missing { .. } | ChainHit::Truncated => {
                    // Zero fill goes straight into the faulting layer
                    let pfn = reservation.allocate_page(MmPageState::Active);
                    self.insert_locked(&mut inner, offset, pfn);
                    install(FaultedPage { pfn, writable: true }, reservation)?;
                    return Ok(FaultOutcome::default());
                }
            };

            if is_write {
                let copy = reservation.allocate_page_unzeroed(MmPageState::Active);
                mm_copy_page(self.pfn.mapper(), pfn, copy);
                self.insert_locked(&mut inner, offset, copy);
                install(
                    FaultedPage {
                        pfn: copy,
                        writable: true,
                    },
                    reservation,
                )?;
                log::trace!("[MM] {} copied {:#x} from source", self.id, offset);
                Ok(FaultOutcome { hard, copied: true })
            } else {
                self.pfn.activate_page(pfn);
                install(
                    FaultedPage {
                        pfn,
                        writable: false,
                    },
                    reservation,
                )?;
                Ok(FaultOutcome {
                    hard,
                    copied: false,
                })
            }
        })
    }

    /// Lock the chain from `cache` toward its end until `offset` is found
    /// and run `f` with all those locks held
    fn walk_chain<R>(cache: &Arc<MmCache>, offset: u64, f: impl FnOnce(ChainHit<'_>) -> R) -> R {
        let mut inner = cache.inner.lock();
        if let Some(&pfn) = inner.pages.get(&offset) {
            return f(ChainHit::Found(pfn));
        }
        match inner.source.clone() {
            Some(_) if offset >= inner.source_end => f(ChainHit::Truncated),
            Some(source) => Self::walk_chain(&source, offset, f),
            None => f(ChainHit::Missing {
                terminal: cache,
                inner: &mut inner,
            }),
        }
    }

    /// Produce the content of a terminal cache's page
    fn fill_terminal(&self, offset: u64, reservation: &mut MmReservation<'_>) -> MmResult<(Pfn, bool)> {
        let Some(store) = &self.store else {
            return Ok((reservation.allocate_page(MmPageState::Active), false));
        };

        let pfn = reservation.allocate_page_unzeroed(MmPageState::Active);
        let read = mm_with_page_mut(self.pfn.mapper(), pfn, |page| store.read_page(offset, page));
        if let Err(err) = read {
            log::warn!("[MM] {} read at {:#x} failed: {}", self.id, offset, err);
            self.pfn.free_page(pfn);
            return Err(err);
        }
        Ok((pfn, true))
    }

    // ========================================================================
    // Writeback and reclaim
    // ========================================================================

    /// Write dirty pages in `[start, end)` back to the store
    ///
    /// Dirty bits are first collected from this cache's mappings. Pages
    /// that were written go back to Active.
    pub fn write_modified_pages(&self, start: u64, end: u64) -> MmResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let inner = self.inner.lock();
        let mut written = 0;
        for (&offset, &pfn) in inner.pages.range(start..end) {
            for area in &inner.areas {
                if let Some(va) = area.address_of(offset) {
                    area.map.clear_accessed_and_modified(va);
                }
            }
            if self.pfn.page_state(pfn) != Some(MmPageState::Modified) {
                continue;
            }
            mm_with_page(self.pfn.mapper(), pfn, |page| store.write_page(offset, page))?;
            self.pfn.set_page_state(pfn, MmPageState::Active);
            written += 1;
        }
        if written != 0 {
            log::debug!("[MM] {} wrote back {} pages", self.id, written);
        }
        Ok(written)
    }

    /// Every (map, address) through which `offset` of this cache is
    /// visible, including layers that do not shadow it
    pub fn mappings_of(&self, offset: u64) -> Vec<(Arc<dyn TranslationMap>, u64)> {
        let mut mappings = Vec::new();
        let consumers = {
            let inner = self.inner.lock();
            for area in &inner.areas {
                if let Some(va) = area.address_of(offset) {
                    mappings.push((area.map.clone(), va));
                }
            }
            inner
                .consumers
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect::<Vec<_>>()
        };
        for consumer in consumers {
            if consumer.lookup_page(offset).is_none() && consumer.sees_source(offset) {
                mappings.extend(consumer.mappings_of(offset));
            }
        }
        mappings
    }

    /// Clear the accessed and dirty bits of `offset` in every mapping
    pub fn age_page(&self, offset: u64) -> Option<PageAge> {
        self.lookup_page(offset)?;
        let mut age = PageAge::default();
        for (map, va) in self.mappings_of(offset) {
            if let Some(before) = map.clear_accessed_and_modified(va) {
                age.accessed |= before.accessed;
                age.modified |= before.modified;
                age.mappings += 1;
            }
        }
        Some(age)
    }

    /// Evict the page at `offset`, writing it back first if dirty
    ///
    /// Only store-backed caches without consumers give up pages: anything
    /// else would lose content. Returns whether the page was freed.
    pub fn try_reclaim_page(&self, offset: u64) -> MmResult<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let mut inner = self.inner.lock();
        if !inner.consumers.is_empty() {
            return Ok(false);
        }
        let Some(&pfn) = inner.pages.get(&offset) else {
            return Ok(false);
        };
        match self.pfn.page_info(pfn) {
            Some(info) if info.wired_count == 0 && info.state != MmPageState::Wired => {}
            _ => return Ok(false),
        }

        for area in &inner.areas {
            if let Some(va) = area.address_of(offset) {
                area.map.unmap_page(va);
            }
        }
        if self.pfn.page_state(pfn) == Some(MmPageState::Modified) {
            mm_with_page(self.pfn.mapper(), pfn, |page| store.write_page(offset, page))?;
        }

        inner.pages.remove(&offset);
        self.pfn.free_page(pfn);
        Ok(true)
    }

    // ========================================================================
    // Lifetime
    // ========================================================================

    /// Change the extent of this cache
    ///
    /// Pages at or beyond a shrunk end are freed; the caller has already
    /// unmapped them. A layer stops seeing its source past the lowest end
    /// it was shrunk to, so growing it again reads zeros there. Returns the
    /// number of pages freed.
    pub fn resize(&self, new_size: u64) -> usize {
        let new_end = round_up(new_size);
        let mut inner = self.inner.lock();
        let dropped = inner.pages.split_off(&new_end);
        if new_end < inner.virtual_end && inner.source.is_some() {
            inner.source_end = inner.source_end.min(new_end);
        }
        inner.virtual_end = new_end;
        drop(inner);
        for &pfn in dropped.values() {
            self.pfn.free_page(pfn);
        }
        dropped.len()
    }

    /// Fold this layer into its only consumer
    ///
    /// Applies when no area maps this cache and exactly one layer sits on
    /// top of it. Pages the consumer does not shadow move up; shadowed ones
    /// are freed. The consumer then sources this cache's source directly.
    pub fn try_merge_with_only_consumer(self: &Arc<Self>) -> bool {
        let consumer = {
            let inner = self.inner.lock();
            if !inner.areas.is_empty() || inner.consumers.len() != 1 {
                return false;
            }
            match inner.consumers[0].1.upgrade() {
                Some(consumer) => consumer,
                None => return false,
            }
        };

        let mut consumer_inner = consumer.inner.lock();
        let mut inner = self.inner.lock();
        let still_only = inner.areas.is_empty()
            && inner.consumers.len() == 1
            && inner.consumers[0].0 == consumer.id
            && consumer_inner
                .source
                .as_ref()
                .is_some_and(|s| Arc::ptr_eq(s, self));
        if !still_only {
            return false;
        }

        let mut moved = 0;
        let mut freed = 0;
        let visible_end = consumer_inner.source_end;
        for (offset, pfn) in core::mem::take(&mut inner.pages) {
            if offset >= visible_end || consumer_inner.pages.contains_key(&offset) {
                self.pfn.free_page(pfn);
                freed += 1;
            } else {
                consumer.insert_locked(&mut consumer_inner, offset, pfn);
                moved += 1;
            }
        }

        inner.consumers.clear();
        let new_source = inner.source.take();
        if let Some(source) = &new_source {
            let mut source_inner = source.inner.lock();
            for entry in source_inner.consumers.iter_mut() {
                if entry.0 == self.id {
                    *entry = (consumer.id, Arc::downgrade(&consumer));
                }
            }
        }
        let inherited_end = inner.source_end;
        drop(inner);
        consumer_inner.source = new_source;
        consumer_inner.source_end = visible_end.min(inherited_end);
        drop(consumer_inner);

        log::debug!(
            "[MM] {} merged into {} ({} moved, {} freed)",
            self.id,
            consumer.id,
            moved,
            freed
        );
        true
    }
}

impl Drop for MmCache {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let pages = core::mem::take(&mut inner.pages);
        for &pfn in pages.values() {
            self.pfn.free_page(pfn);
        }
        if let Some(source) = inner.source.take() {
            source
                .inner
                .lock()
                .consumers
                .retain(|(id, _)| *id != self.id);
        }
        log::trace!("[MM] {} destroyed, {} pages freed", self.id, pages.len());
    }
}

impl fmt::Debug for MmCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmCache")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimMachine;
    use crate::mm::physical::{mm_read_page, mm_write_page};
    use crate::mm::store::MemoryStore;
    use alloc::vec;

    fn setup(pages: u64) -> (SimMachine, Arc<PfnDatabase>) {
        let machine = SimMachine::new(2, pages);
        let pfn = Arc::new(PfnDatabase::new(
            machine.boot_info(),
            machine.ram.clone(),
            machine.cpus.clone(),
            0,
        ));
        (machine, pfn)
    }

    fn byte_at(pfn: &PfnDatabase, page: Pfn) -> u8 {
        let mut b = [0u8; 1];
        mm_read_page(pfn.mapper(), page, 0, &mut b);
        b[0]
    }

    /// Fault without a translation map; returns the page that was installed
    fn touch(cache: &Arc<MmCache>, offset: u64, write: bool) -> (FaultedPage, FaultOutcome) {
        let mut res = cache.pfn.reserve_pages(2, false).unwrap();
        let mut page = None;
        let outcome = cache
            .fault(offset, write, &mut res, |p, _| {
                page = Some(p);
                Ok(())
            })
            .unwrap();
        (page.unwrap(), outcome)
    }

    #[test]
    fn test_anonymous_zero_fill() {
        let (_m, pfn) = setup(64);
        let cache = MmCache::new_anonymous(CacheId::new(1), pfn.clone(), 4 * PAGE);
        let (page, outcome) = touch(&cache, PAGE + 12, false);
        assert!(page.writable);
        assert!(!outcome.hard);
        assert_eq!(cache.lookup_page(PAGE), Some(page.pfn));
        assert_eq!(byte_at(&pfn, page.pfn), 0);
        assert_eq!(
            pfn.owner(page.pfn),
            Some(PageOwner {
                cache: CacheId::new(1),
                offset: PAGE
            })
        );

        let mut res = pfn.reserve_pages(2, false).unwrap();
        assert_eq!(
            cache.fault(4 * PAGE, false, &mut res, |_, _| Ok(())),
            Err(MmError::BadAddress)
        );
    }

    #[test]
    fn test_store_fault_is_hard_once() {
        let (_m, pfn) = setup(64);
        let store = Arc::new(MemoryStore::from_bytes(vec![0x5A; 2 * PAGE_SIZE]));
        let cache = MmCache::new_store(CacheId::new(1), pfn.clone(), store.clone());
        let (first, outcome) = touch(&cache, 0, false);
        assert!(outcome.hard);
        assert_eq!(byte_at(&pfn, first.pfn), 0x5A);
        let (second, outcome) = touch(&cache, 0, true);
        assert!(!outcome.hard);
        assert_eq!(first, second);
        assert_eq!(store.read_count(), 1);
    }

    #[test]
    fn test_layer_read_shares_write_copies() {
        let (_m, pfn) = setup(64);
        let base = MmCache::new_anonymous(CacheId::new(1), pfn.clone(), 2 * PAGE);
        let (original, _) = touch(&base, 0, true);
        mm_write_page(pfn.mapper(), original.pfn, 0, &[0x11]);

        let layer = MmCache::new_layer(CacheId::new(2), &base);
        assert_eq!(layer.chain_depth(), 2);
        assert_eq!(base.consumer_count(), 1);

        let (shared, outcome) = touch(&layer, 0, false);
        assert_eq!(shared.pfn, original.pfn);
        assert!(!shared.writable);
        assert!(!outcome.copied);
        assert_eq!(layer.resident_pages(), 0);

        let (copy, outcome) = touch(&layer, 0, true);
        assert!(outcome.copied);
        assert!(copy.writable);
        assert_ne!(copy.pfn, original.pfn);
        assert_eq!(byte_at(&pfn, copy.pfn), 0x11);

        mm_write_page(pfn.mapper(), copy.pfn, 0, &[0x22]);
        assert_eq!(byte_at(&pfn, original.pfn), 0x11);
        assert_eq!(layer.resolve_page(0), Some((CacheId::new(2), copy.pfn)));
        assert_eq!(base.resolve_page(0), Some((CacheId::new(1), original.pfn)));
    }

    #[test]
    fn test_layer_over_store_reads_into_terminal() {
        let (_m, pfn) = setup(64);
        let store = Arc::new(MemoryStore::from_bytes(vec![7; PAGE_SIZE]));
        let base = MmCache::new_store(CacheId::new(1), pfn.clone(), store);
        let layer = MmCache::new_layer(CacheId::new(2), &base);

        let (page, outcome) = touch(&layer, 0, true);
        assert!(outcome.hard && outcome.copied);
        assert_eq!(base.resident_pages(), 1);
        assert_eq!(layer.lookup_page(0), Some(page.pfn));
        assert_eq!(byte_at(&pfn, page.pfn), 7);
    }

    #[test]
    fn test_missing_anonymous_page_lands_in_faulting_layer() {
        let (_m, pfn) = setup(64);
        let base = MmCache::new_anonymous(CacheId::new(1), pfn.clone(), PAGE);
        let layer = MmCache::new_layer(CacheId::new(2), &base);
        let (page, _) = touch(&layer, 0, false);
        assert!(page.writable);
        assert_eq!(base.resident_pages(), 0);
        assert_eq!(layer.lookup_page(0), Some(page.pfn));
    }

    #[test]
    fn test_merge_with_only_consumer() {
        let (_m, pfn) = setup(64);
        let base = MmCache::new_anonymous(CacheId::new(1), pfn.clone(), 3 * PAGE);
        touch(&base, 0, true);
        let (kept, _) = touch(&base, PAGE, true);
        let top = MmCache::new_layer(CacheId::new(2), &base);
        let (_, outcome) = touch(&top, 0, true);
        assert!(outcome.copied);

        let free_before = pfn.stats().free_total();
        assert!(base.try_merge_with_only_consumer());
        assert_eq!(top.source().map(|s| s.id()), None);
        assert_eq!(top.resident_pages(), 2);
        assert_eq!(top.lookup_page(PAGE), Some(kept.pfn));
        assert_eq!(base.resident_pages(), 0);
        assert_eq!(pfn.stats().free_total(), free_before + 1);
        assert_eq!(pfn.owner(kept.pfn).map(|o| o.cache), Some(CacheId::new(2)));
    }

    #[test]
    fn test_merge_refused_with_two_consumers() {
        let (_m, pfn) = setup(64);
        let base = MmCache::new_anonymous(CacheId::new(1), pfn.clone(), PAGE);
        let a = MmCache::new_layer(CacheId::new(2), &base);
        let b = MmCache::new_layer(CacheId::new(3), &base);
        assert!(!base.try_merge_with_only_consumer());
        drop(b);
        assert_eq!(base.consumer_count(), 1);
        assert!(base.try_merge_with_only_consumer());
        assert!(a.source().is_none());
    }

    #[test]
    fn test_drop_frees_pages() {
        let (_m, pfn) = setup(64);
        let before = pfn.stats().free_total();
        let cache = MmCache::new_anonymous(CacheId::new(1), pfn.clone(), 4 * PAGE);
        for i in 0..4 {
            touch(&cache, i * PAGE, true);
        }
        assert_eq!(pfn.stats().free_total(), before - 4);
        drop(cache);
        assert_eq!(pfn.stats().free_total(), before);
        pfn.validate().unwrap();
    }

    #[test]
    fn test_resize_truncates() {
        let (_m, pfn) = setup(64);
        let cache = MmCache::new_anonymous(CacheId::new(1), pfn.clone(), 4 * PAGE);
        for i in 0..4 {
            touch(&cache, i * PAGE, false);
        }
        assert_eq!(cache.resize(2 * PAGE), 2);
        assert_eq!(cache.resident_pages(), 2);
        assert_eq!(cache.virtual_end(), 2 * PAGE);
        assert_eq!(cache.committed_pages(), 2);
    }

    #[test]
    fn test_truncated_layer_stops_seeing_source() {
        let (_m, pfn) = setup(64);
        let base = MmCache::new_anonymous(CacheId::new(1), pfn.clone(), 2 * PAGE);
        let (old, _) = touch(&base, PAGE, true);
        mm_write_page(pfn.mapper(), old.pfn, 0, &[0xAB]);
        let top = MmCache::new_layer(CacheId::new(2), &base);

        top.resize(PAGE);
        top.resize(2 * PAGE);
        assert_eq!(top.resolve_page(PAGE), None);
        let (page, outcome) = touch(&top, PAGE, false);
        assert!(page.writable);
        assert!(!outcome.copied);
        assert_ne!(page.pfn, old.pfn);
        assert_eq!(byte_at(&pfn, page.pfn), 0);

        // The hidden source page is freed rather than moved up
        if let Some(fresh) = top.remove_page(PAGE) {
            pfn.free_page(fresh);
        }
        let free_before = pfn.stats().free_total();
        assert!(base.try_merge_with_only_consumer());
        assert_eq!(top.resident_pages(), 0);
        assert_eq!(pfn.stats().free_total(), free_before + 1);
        assert_eq!(top.resolve_page(PAGE), None);
    }

    #[test]
    fn test_write_modified_pages() {
        let (_m, pfn) = setup(64);
        let store = Arc::new(MemoryStore::new(2 * PAGE));
        let cache = MmCache::new_store(CacheId::new(1), pfn.clone(), store.clone());
        let (page, _) = touch(&cache, PAGE, true);
        mm_write_page(pfn.mapper(), page.pfn, 0, b"dirty");
        pfn.mark_modified(page.pfn);

        assert_eq!(pfn.write_modified_page_range(&cache, 0, 2 * PAGE), Ok(1));
        assert_eq!(pfn.page_state(page.pfn), Some(MmPageState::Active));
        let mut buf = [0u8; 5];
        store.read_bytes(PAGE, &mut buf);
        assert_eq!(&buf, b"dirty");
        assert_eq!(cache.write_modified_pages(0, 2 * PAGE), Ok(0));
    }

    #[test]
    fn test_reclaim_store_page() {
        let (_m, pfn) = setup(64);
        let store = Arc::new(MemoryStore::new(PAGE));
        let cache = MmCache::new_store(CacheId::new(1), pfn.clone(), store.clone());
        let (page, _) = touch(&cache, 0, true);
        mm_write_page(pfn.mapper(), page.pfn, 0, &[9]);
        pfn.mark_modified(page.pfn);

        assert_eq!(cache.try_reclaim_page(0), Ok(true));
        assert_eq!(cache.resident_pages(), 0);
        assert_eq!(store.write_count(), 1);
        let (again, outcome) = touch(&cache, 0, false);
        assert!(outcome.hard);
        assert_eq!(byte_at(&pfn, again.pfn), 9);

        let anon = MmCache::new_anonymous(CacheId::new(2), pfn.clone(), PAGE);
        touch(&anon, 0, true);
        assert_eq!(anon.try_reclaim_page(0), Ok(false));
    }

    #[test]
    #[should_panic(expected = "MEMORY_MANAGEMENT")]
    fn test_double_insert_bugchecks() {
        let (_m, pfn) = setup(64);
        let cache = MmCache::new_anonymous(CacheId::new(1), pfn.clone(), PAGE);
        let (page, _) = touch(&cache, 0, false);
        cache.insert_page(0, page.pfn);
    }
}
