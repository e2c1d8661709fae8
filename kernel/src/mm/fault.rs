//! Page Fault Handling
//!
//! A fault is resolved in this order:
//! 1. Reserve enough pages for the worst case (may block, nothing is
//!    locked yet)
//! 2. Take the address space shared and find the area
//! 3. Check the access against the area protection
//! 4. Resolve the page through the area's cache chain and map it
//!
//! Anything that does not resolve to an area that allows the access is
//! reported back as `BadAddress`; raising the exception is the caller's
//! business.

use super::address::{AreaMap, MmAddressSpace};
use super::cache::FaultOutcome;
use super::error::{MmError, MmResult};
use super::pfn::{MmReservation, PAGE_SHIFT, PAGE_SIZE};
use super::vad::{MmArea, Protection};

/// Pages a single cache fault may allocate: one for the page read or
/// zero-filled at the end of the chain, one for the private copy
pub const FAULT_RESERVE_PAGES: usize = 2;

const PAGE: u64 = PAGE_SIZE as u64;

/// Resolve an access fault at `addr`
pub fn mm_access_fault(
    space: &MmAddressSpace,
    addr: u64,
    is_write: bool,
    is_user: bool,
) -> MmResult<()> {
    if is_user && !space.is_user() {
        log::debug!("[MM] user access to kernel address {:#x}", addr);
        return Err(MmError::BadAddress);
    }
    if !space.contains_address(addr) {
        return Err(MmError::BadAddress);
    }

    let page = addr & !(PAGE - 1);
    let needed = FAULT_RESERVE_PAGES + space.map().max_pages_needed_to_map(page, page + PAGE);
    let mut reservation = space.core().pfn.reserve_pages(needed, true)?;

    let areas = space.areas_read();
    mm_fault_locked(space, &areas, addr, is_write, is_user, &mut reservation)
}

/// Fault with the area list already held
pub(super) fn mm_fault_locked(
    space: &MmAddressSpace,
    areas: &AreaMap,
    addr: u64,
    is_write: bool,
    is_user: bool,
    reservation: &mut MmReservation<'_>,
) -> MmResult<()> {
    let area = areas
        .range(..=addr)
        .next_back()
        .map(|(_, area)| area)
        .filter(|area| area.contains(addr));
    let Some(area) = area else {
        log::debug!(
            "[MM] team {} fault at {:#x}: no area",
            space.team(),
            addr
        );
        return Err(MmError::BadAddress);
    };

    if !area.protection.is_accessible() || (is_write && !area.protection.contains(Protection::WRITE)) {
        log::debug!(
            "[MM] team {} {} fault at {:#x} denied by area {} ({:?}, user={})",
            space.team(),
            if is_write { "write" } else { "read" },
            addr,
            area.id,
            area.protection,
            is_user
        );
        return Err(MmError::BadAddress);
    }

    mm_fault_area(space, area, addr & !(PAGE - 1), is_write, reservation).map(|_| ())
}

/// Bring the page at `va` of `area` in and map it
///
/// Writable wired areas always take the write path so the wired page is
/// private to the area's cache.
pub(super) fn mm_fault_area(
    space: &MmAddressSpace,
    area: &MmArea,
    va: u64,
    is_write: bool,
    reservation: &mut MmReservation<'_>,
) -> MmResult<FaultOutcome> {
    let pfdb = &space.core().pfn;
    let map = space.map();
    let user = space.is_user();
    let wired = area.wiring.is_wired();
    let write = is_write || (wired && area.protection.contains(Protection::WRITE));

    let outcome = area
        .cache
        .fault(area.cache_offset_of(va), write, reservation, |page, reservation| {
            let attributes = area.protection.map_attributes(user, page.writable);
            map.map(va, (page.pfn as u64) << PAGE_SHIFT, attributes, reservation)?;
            if wired {
                area.record_wired(pfdb, va, page.pfn);
            }
            Ok(())
        })?;

    space.record_fault(outcome);
    log::trace!(
        "[MM] team {} fault {:#x} write={} hard={} copied={}",
        space.team(),
        va,
        is_write,
        outcome.hard,
        outcome.copied
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimMachine;
    use crate::mm::context::{MmConfig, MmContext};
    use crate::mm::vad::{AreaRequest, Wiring};

    fn context() -> (SimMachine, MmContext) {
        let machine = SimMachine::new(2, 128);
        let config = MmConfig {
            system_reserve: 2,
            ..MmConfig::default()
        };
        let context = MmContext::init(machine.boot_info(), machine.platform(), config).unwrap();
        (machine, context)
    }

    #[test]
    fn test_fault_outside_any_area() {
        let (_m, ctx) = context();
        let space = ctx.create_address_space(1).unwrap();
        assert_eq!(
            mm_access_fault(&space, 0x10_0000, false, true),
            Err(MmError::BadAddress)
        );
    }

    #[test]
    fn test_user_access_to_kernel_space_rejected() {
        let (_m, ctx) = context();
        let kernel = ctx.kernel_space().clone();
        let base = kernel.area_infos()[0].base;
        assert_eq!(mm_access_fault(&kernel, base, false, true), Err(MmError::BadAddress));
        assert_eq!(mm_access_fault(&kernel, base, false, false), Ok(()));
    }

    #[test]
    fn test_read_fault_maps_zero_page() {
        let (_m, ctx) = context();
        let space = ctx.create_address_space(1).unwrap();
        let (_, base) = space.create_area(AreaRequest::anonymous("heap", 0x2000)).unwrap();
        mm_access_fault(&space, base + 0x1234, false, true).unwrap();
        let query = space.map().query(base + 0x1000).unwrap();
        assert!(query.is_writable());
        assert!(space.map().query(base).is_none());
        assert_eq!(space.soft_faults(), 1);
        assert_eq!(ctx.pfn().page_info(query.pfn()).unwrap().mapping_count, 1);
    }

    #[test]
    fn test_write_to_read_only_area_rejected() {
        let (_m, ctx) = context();
        let space = ctx.create_address_space(1).unwrap();
        let (_, base) = space
            .create_area(AreaRequest::anonymous("text", 0x1000).protection(Protection::READ))
            .unwrap();
        assert_eq!(mm_access_fault(&space, base, true, true), Err(MmError::BadAddress));
        mm_access_fault(&space, base, false, true).unwrap();
        assert!(!space.map().query(base).unwrap().is_writable());
    }

    #[test]
    fn test_no_access_area_rejects_reads() {
        let (_m, ctx) = context();
        let space = ctx.create_address_space(1).unwrap();
        let (_, base) = space
            .create_area(
                AreaRequest::anonymous("guard", 0x1000)
                    .protection(Protection::empty())
                    .wiring(Wiring::None),
            )
            .unwrap();
        assert_eq!(mm_access_fault(&space, base, false, true), Err(MmError::BadAddress));
    }
}
