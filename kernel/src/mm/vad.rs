//! Virtual Address Descriptors (Areas)
//!
//! An area describes one contiguous range of virtual addresses within an
//! address space and the window of a cache mapped there.
//!
//! # Area States
//! - Reserved: range claimed, cache attached, nothing mapped yet
//! - Mapped: pages may be present in the translation map
//! - Deleted: torn down; the descriptor is no longer reachable
//!
//! # Memory Protection
//! - PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE
//! - PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use super::cache::{CacheId, MmCache};
use super::pfn::{Pfn, PfnDatabase, PAGE_SIZE};
use super::store::BackingStore;
use super::translation::MapAttributes;

/// Area identifier, unique across all address spaces
pub type AreaId = u32;

/// Page protection constants
pub mod protection {
    pub const PAGE_NOACCESS: u32 = 0x01;
    pub const PAGE_READONLY: u32 = 0x02;
    pub const PAGE_READWRITE: u32 = 0x04;
    pub const PAGE_EXECUTE: u32 = 0x10;
    pub const PAGE_EXECUTE_READ: u32 = 0x20;
    pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
}

bitflags! {
    /// Access an area grants
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    /// Translate an NT `PAGE_*` value
    pub fn from_nt(value: u32) -> Option<Self> {
        use protection::*;
        Some(match value {
            PAGE_NOACCESS => Self::empty(),
            PAGE_READONLY => Self::READ,
            PAGE_READWRITE => Self::READ | Self::WRITE,
            PAGE_EXECUTE => Self::EXECUTE,
            PAGE_EXECUTE_READ => Self::READ | Self::EXECUTE,
            PAGE_EXECUTE_READWRITE => Self::READ | Self::WRITE | Self::EXECUTE,
            _ => return None,
        })
    }

    pub fn to_nt(self) -> u32 {
        use protection::*;
        let rw = self & (Self::READ | Self::WRITE);
        match (self.contains(Self::EXECUTE), rw.contains(Self::WRITE), rw.is_empty()) {
            (false, _, true) => PAGE_NOACCESS,
            (false, false, false) => PAGE_READONLY,
            (false, true, _) => PAGE_READWRITE,
            (true, _, true) => PAGE_EXECUTE,
            (true, false, false) => PAGE_EXECUTE_READ,
            (true, true, _) => PAGE_EXECUTE_READWRITE,
        }
    }

    /// Readable pages can be mapped at all; write or execute imply read
    pub fn is_accessible(self) -> bool {
        !self.is_empty()
    }

    /// Hardware attributes for a page of an area with this protection
    ///
    /// `writable` is false for pages owned by a source cache, which are
    /// mapped copy-on-write.
    pub fn map_attributes(self, user: bool, writable: bool) -> MapAttributes {
        let mut attrs = MapAttributes::READ;
        if self.contains(Self::WRITE) {
            attrs |= if writable {
                MapAttributes::WRITE
            } else {
                MapAttributes::COPY_ON_WRITE
            };
        }
        if self.contains(Self::EXECUTE) {
            attrs |= MapAttributes::EXECUTE;
        }
        if user {
            attrs |= MapAttributes::USER;
        }
        attrs
    }
}

/// Residency policy of an area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wiring {
    /// Pages fault in and may be reclaimed
    None,
    /// Pages fault in and stay wired once present
    Lazy,
    /// Every page is present and wired from creation
    Full,
}

impl Wiring {
    pub fn is_wired(self) -> bool {
        self != Wiring::None
    }
}

/// How a cloned area relates to its source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    /// Private copy-on-write view
    CopyOnWrite,
    /// Same cache, writes visible to both
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AreaState {
    Reserved,
    Mapped,
    Deleted,
}

/// Where an area goes in the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// First fit from the bottom of the space
    Any,
    /// Exactly this base or fail
    Exact(u64),
    /// First fit at or above this base, wrapping to the bottom
    Hint(u64),
}

/// Content source of a new area
#[derive(Clone)]
pub enum AreaBacking {
    Anonymous,
    /// Window of a store starting at `offset`
    Store {
        store: Arc<dyn BackingStore>,
        offset: u64,
    },
}

/// Parameters of [`MmAddressSpace::create_area`](super::address::MmAddressSpace::create_area)
#[derive(Clone)]
pub struct AreaRequest {
    pub name: String,
    pub size: u64,
    pub placement: Placement,
    pub protection: Protection,
    pub wiring: Wiring,
    pub backing: AreaBacking,
}

impl AreaRequest {
    /// Anonymous lazily-faulted read/write area
    pub fn anonymous(name: &str, size: u64) -> Self {
        Self {
            name: String::from(name),
            size,
            placement: Placement::Any,
            protection: Protection::READ | Protection::WRITE,
            wiring: Wiring::None,
            backing: AreaBacking::Anonymous,
        }
    }

    pub fn at(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }

    pub fn wiring(mut self, wiring: Wiring) -> Self {
        self.wiring = wiring;
        self
    }

    pub fn backed_by(mut self, store: Arc<dyn BackingStore>, offset: u64) -> Self {
        self.backing = AreaBacking::Store { store, offset };
        self
    }
}

/// Snapshot of an area for queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AreaInfo {
    pub id: AreaId,
    pub name: String,
    pub team: u32,
    pub base: u64,
    pub size: u64,
    pub protection: Protection,
    pub wiring: Wiring,
    pub state: AreaState,
    pub cache: CacheId,
    pub cache_offset: u64,
    /// Pages present in the area's own cache
    pub resident_pages: usize,
    pub wired_pages: usize,
}

/// Virtual Address Descriptor
pub struct MmArea {
    pub id: AreaId,
    pub name: String,
    pub team: u32,
    pub base: u64,
    pub size: u64,
    pub protection: Protection,
    pub wiring: Wiring,
    pub state: AreaState,
    pub cache: Arc<MmCache>,
    /// Cache offset mapped at `base`
    pub cache_offset: u64,
    /// Pages this area holds wired, by virtual address
    wired: Mutex<BTreeMap<u64, Pfn>>,
}

impl MmArea {
    pub fn new(
        id: AreaId,
        name: String,
        team: u32,
        base: u64,
        size: u64,
        protection: Protection,
        wiring: Wiring,
        cache: Arc<MmCache>,
        cache_offset: u64,
    ) -> Self {
        Self {
            id,
            name,
            team,
            base,
            size,
            protection,
            wiring,
            state: AreaState::Reserved,
            cache,
            cache_offset,
            wired: Mutex::new(BTreeMap::new()),
        }
    }

    /// Exclusive end address
    #[inline]
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    #[inline]
    pub fn page_count(&self) -> u64 {
        self.size / PAGE_SIZE as u64
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        start < self.end() && self.base < end
    }

    /// Cache offset backing `addr`
    #[inline]
    pub fn cache_offset_of(&self, addr: u64) -> u64 {
        self.cache_offset + (addr - self.base)
    }

    /// Record that `pfn` is wired at `va`, swapping out an older wiring
    ///
    /// Returns the page whose wiring was replaced, if different.
    pub fn record_wired(&self, pfdb: &PfnDatabase, va: u64, pfn: Pfn) -> Option<Pfn> {
        let mut wired = self.wired.lock();
        match wired.insert(va, pfn) {
            Some(old) if old == pfn => None,
            old => {
                pfdb.wire_page(pfn);
                if let Some(old) = old {
                    pfdb.unwire_page(old);
                }
                old
            }
        }
    }

    /// Unwire every page wired in `[start, end)`
    pub fn unwire_range(&self, pfdb: &PfnDatabase, start: u64, end: u64) -> usize {
        let mut wired = self.wired.lock();
        let doomed: Vec<u64> = wired.range(start..end).map(|(&va, _)| va).collect();
        for va in &doomed {
            if let Some(pfn) = wired.remove(va) {
                pfdb.unwire_page(pfn);
            }
        }
        doomed.len()
    }

    pub fn wired_pages(&self) -> usize {
        self.wired.lock().len()
    }

    pub fn info(&self) -> AreaInfo {
        AreaInfo {
            id: self.id,
            name: self.name.clone(),
            team: self.team,
            base: self.base,
            size: self.size,
            protection: self.protection,
            wiring: self.wiring,
            state: self.state,
            cache: self.cache.id(),
            cache_offset: self.cache_offset,
            resident_pages: self.cache.resident_pages(),
            wired_pages: self.wired_pages(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimMachine;
    use crate::mm::pfn::MmPageState;

    #[test]
    fn test_protection_nt_round_trip() {
        for value in [
            protection::PAGE_NOACCESS,
            protection::PAGE_READONLY,
            protection::PAGE_READWRITE,
            protection::PAGE_EXECUTE,
            protection::PAGE_EXECUTE_READ,
            protection::PAGE_EXECUTE_READWRITE,
        ] {
            assert_eq!(Protection::from_nt(value).unwrap().to_nt(), value);
        }
        assert_eq!(Protection::from_nt(0x08), None);
        assert_eq!(Protection::WRITE.to_nt(), protection::PAGE_READWRITE);
    }

    #[test]
    fn test_map_attributes() {
        let rw = Protection::READ | Protection::WRITE;
        let attrs = rw.map_attributes(true, true);
        assert!(attrs.contains(MapAttributes::WRITE | MapAttributes::USER));
        let cow = rw.map_attributes(true, false);
        assert!(!cow.contains(MapAttributes::WRITE));
        assert!(cow.contains(MapAttributes::COPY_ON_WRITE));
        assert!(!Protection::READ
            .map_attributes(false, true)
            .intersects(MapAttributes::WRITE | MapAttributes::USER));
    }

    #[test]
    fn test_area_geometry_and_wiring() {
        let machine = SimMachine::new(1, 32);
        let pfdb = Arc::new(PfnDatabase::new(
            machine.boot_info(),
            machine.ram.clone(),
            machine.cpus.clone(),
            0,
        ));
        let cache = MmCache::new_anonymous(CacheId::new(1), pfdb.clone(), 0x4000);
        let area = MmArea::new(
            1,
            String::from("test"),
            1,
            0x10_0000,
            0x4000,
            Protection::READ,
            Wiring::Lazy,
            cache,
            0x1000,
        );
        assert!(area.contains(0x10_3FFF));
        assert!(!area.contains(0x10_4000));
        assert!(area.overlaps(0xF_F000, 0x10_1000));
        assert!(!area.overlaps(0x10_4000, 0x10_5000));
        assert_eq!(area.cache_offset_of(0x10_2000), 0x3000);
        assert_eq!(area.page_count(), 4);

        let mut res = pfdb.reserve_pages(2, false).unwrap();
        let a = res.allocate_page(MmPageState::Active);
        let b = res.allocate_page(MmPageState::Active);
        assert_eq!(area.record_wired(&pfdb, 0x10_0000, a), None);
        assert_eq!(area.record_wired(&pfdb, 0x10_0000, a), None);
        assert_eq!(pfdb.page_state(a), Some(MmPageState::Wired));
        assert_eq!(area.record_wired(&pfdb, 0x10_0000, b), Some(a));
        assert_eq!(pfdb.page_state(a), Some(MmPageState::Active));
        assert_eq!(area.wired_pages(), 1);
        assert_eq!(area.unwire_range(&pfdb, 0x10_0000, 0x10_4000), 1);
        assert_eq!(pfdb.page_state(b), Some(MmPageState::Active));
    }
}
