//! Memory Management System Services
//!
//! The area calls a user-mode caller reaches through the system call
//! table. Every call names the calling team, returns an NTSTATUS and hands
//! results back through out-parameters, which are only written on
//! success.
//!
//! Protections are NT `PAGE_*` values; wiring is one of the `AREA_*_LOCK`
//! values.

use super::address::TeamId;
use super::context::MmContext;
use super::error::MmError;
use super::vad::{AreaId, AreaInfo, AreaRequest, Placement, Protection, Sharing, Wiring};

/// NT status code
pub type NTSTATUS = i32;

pub const STATUS_SUCCESS: NTSTATUS = 0;
pub const STATUS_DEVICE_BUSY: NTSTATUS = 0x80000011u32 as i32;
pub const STATUS_ACCESS_VIOLATION: NTSTATUS = 0xC0000005u32 as i32;
pub const STATUS_INVALID_PARAMETER: NTSTATUS = 0xC000000Du32 as i32;
pub const STATUS_NO_MEMORY: NTSTATUS = 0xC0000017u32 as i32;
pub const STATUS_CANT_WAIT: NTSTATUS = 0xC00000D8u32 as i32;

/// Wiring values
pub const AREA_NO_LOCK: u32 = 0;
pub const AREA_LAZY_LOCK: u32 = 1;
pub const AREA_FULL_LOCK: u32 = 2;

/// Placement values
pub const AREA_ANY_ADDRESS: u32 = 0;
pub const AREA_EXACT_ADDRESS: u32 = 1;
pub const AREA_BASE_ADDRESS: u32 = 2;

/// Clone sharing values
pub const AREA_CLONE_PRIVATE: u32 = 0;
pub const AREA_CLONE_SHARED: u32 = 1;

/// Area state values reported by [`nt_query_area`]
pub const MEM_RESERVE: u32 = 0x2000;
pub const MEM_COMMIT: u32 = 0x1000;

/// NTSTATUS for a memory manager failure
pub fn mm_status(error: MmError) -> NTSTATUS {
    match error {
        MmError::NoMemory => STATUS_NO_MEMORY,
        MmError::WouldBlock => STATUS_CANT_WAIT,
        MmError::BadAddress => STATUS_ACCESS_VIOLATION,
        MmError::BadValue => STATUS_INVALID_PARAMETER,
        MmError::Busy => STATUS_DEVICE_BUSY,
    }
}

/// Area description returned by [`nt_query_area`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmMemoryInfo {
    pub base_address: u64,
    pub region_size: u64,
    pub area_id: AreaId,
    pub team: TeamId,
    pub protect: u32,
    pub lock: u32,
    pub state: u32,
    pub resident_pages: usize,
    pub wired_pages: usize,
}

impl From<&AreaInfo> for MmMemoryInfo {
    fn from(info: &AreaInfo) -> Self {
        Self {
            base_address: info.base,
            region_size: info.size,
            area_id: info.id,
            team: info.team,
            protect: info.protection.to_nt(),
            lock: match info.wiring {
                Wiring::None => AREA_NO_LOCK,
                Wiring::Lazy => AREA_LAZY_LOCK,
                Wiring::Full => AREA_FULL_LOCK,
            },
            state: if info.resident_pages == 0 {
                MEM_RESERVE
            } else {
                MEM_COMMIT
            },
            resident_pages: info.resident_pages,
            wired_pages: info.wired_pages,
        }
    }
}

fn wiring_from(lock: u32) -> Option<Wiring> {
    match lock {
        AREA_NO_LOCK => Some(Wiring::None),
        AREA_LAZY_LOCK => Some(Wiring::Lazy),
        AREA_FULL_LOCK => Some(Wiring::Full),
        _ => None,
    }
}

fn placement_from(kind: u32, address: u64) -> Option<Placement> {
    match kind {
        AREA_ANY_ADDRESS => Some(Placement::Any),
        AREA_EXACT_ADDRESS => Some(Placement::Exact(address)),
        AREA_BASE_ADDRESS => Some(Placement::Hint(address)),
        _ => None,
    }
}

/// Area `id` if it belongs to `team`
fn owned_area(ctx: &MmContext, team: TeamId, id: AreaId) -> Result<AreaInfo, NTSTATUS> {
    match ctx.find_area(id) {
        Some(info) if info.team == team => Ok(info),
        _ => Err(STATUS_INVALID_PARAMETER),
    }
}

/// Create an anonymous area in `team`
///
/// `address` carries the requested address in and the chosen base out.
pub fn nt_create_area(
    ctx: &MmContext,
    team: TeamId,
    name: &str,
    address: &mut u64,
    placement: u32,
    size: u64,
    lock: u32,
    protect: u32,
    area_id: &mut AreaId,
) -> NTSTATUS {
    let (Some(placement), Some(wiring), Some(protection)) = (
        placement_from(placement, *address),
        wiring_from(lock),
        Protection::from_nt(protect),
    ) else {
        return STATUS_INVALID_PARAMETER;
    };

    let request = AreaRequest::anonymous(name, size)
        .at(placement)
        .wiring(wiring)
        .protection(protection);
    match ctx.create_area(team, request) {
        Ok((id, base)) => {
            *address = base;
            *area_id = id;
            STATUS_SUCCESS
        }
        Err(err) => mm_status(err),
    }
}

pub fn nt_resize_area(ctx: &MmContext, team: TeamId, id: AreaId, new_size: u64) -> NTSTATUS {
    if let Err(status) = owned_area(ctx, team, id) {
        return status;
    }
    match ctx.resize_area(id, new_size) {
        Ok(()) => STATUS_SUCCESS,
        Err(err) => mm_status(err),
    }
}

pub fn nt_protect_area(
    ctx: &MmContext,
    team: TeamId,
    id: AreaId,
    protect: u32,
    old_protect: &mut u32,
) -> NTSTATUS {
    let info = match owned_area(ctx, team, id) {
        Ok(info) => info,
        Err(status) => return status,
    };
    let Some(protection) = Protection::from_nt(protect) else {
        return STATUS_INVALID_PARAMETER;
    };
    match ctx.protect_area(id, protection) {
        Ok(()) => {
            *old_protect = info.protection.to_nt();
            STATUS_SUCCESS
        }
        Err(err) => mm_status(err),
    }
}

pub fn nt_delete_area(ctx: &MmContext, team: TeamId, id: AreaId) -> NTSTATUS {
    if let Err(status) = owned_area(ctx, team, id) {
        return status;
    }
    match ctx.delete_area(id) {
        Ok(()) => STATUS_SUCCESS,
        Err(err) => mm_status(err),
    }
}

/// Map `source` into `team`
///
/// The source area may belong to any team.
pub fn nt_clone_area(
    ctx: &MmContext,
    team: TeamId,
    name: &str,
    address: &mut u64,
    placement: u32,
    sharing: u32,
    source: AreaId,
    area_id: &mut AreaId,
) -> NTSTATUS {
    let Some(placement) = placement_from(placement, *address) else {
        return STATUS_INVALID_PARAMETER;
    };
    let sharing = match sharing {
        AREA_CLONE_PRIVATE => Sharing::CopyOnWrite,
        AREA_CLONE_SHARED => Sharing::Shared,
        _ => return STATUS_INVALID_PARAMETER,
    };
    match ctx.clone_area(source, team, name, placement, sharing) {
        Ok((id, base)) => {
            *address = base;
            *area_id = id;
            STATUS_SUCCESS
        }
        Err(err) => mm_status(err),
    }
}

/// Describe the area of `team` containing `address`
pub fn nt_query_area(
    ctx: &MmContext,
    team: TeamId,
    address: u64,
    info: &mut MmMemoryInfo,
) -> NTSTATUS {
    if ctx.address_space(team).is_none() {
        return STATUS_INVALID_PARAMETER;
    }
    match ctx.query_address(team, address) {
        Some(area) => {
            *info = MmMemoryInfo::from(&area);
            STATUS_SUCCESS
        }
        None => STATUS_ACCESS_VIOLATION,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimMachine;
    use crate::mm::context::MmConfig;
    use crate::mm::vad::protection::{PAGE_READONLY, PAGE_READWRITE};

    fn context() -> (SimMachine, MmContext) {
        let machine = SimMachine::new(2, 128);
        let config = MmConfig {
            system_reserve: 2,
            ..MmConfig::default()
        };
        let ctx = MmContext::init(machine.boot_info(), machine.platform(), config).unwrap();
        ctx.create_address_space(1).unwrap();
        ctx.create_address_space(2).unwrap();
        (machine, ctx)
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(mm_status(MmError::NoMemory), 0xC0000017u32 as i32);
        assert_eq!(mm_status(MmError::WouldBlock), STATUS_CANT_WAIT);
        assert_eq!(mm_status(MmError::BadAddress), STATUS_ACCESS_VIOLATION);
        assert_eq!(mm_status(MmError::BadValue), STATUS_INVALID_PARAMETER);
        assert_eq!(mm_status(MmError::Busy), STATUS_DEVICE_BUSY);
    }

    #[test]
    fn test_create_query_protect_delete() {
        let (_m, ctx) = context();
        let mut address = 0;
        let mut id = 0;
        assert_eq!(
            nt_create_area(&ctx, 1, "heap", &mut address, AREA_ANY_ADDRESS, 0x1800, AREA_NO_LOCK, PAGE_READWRITE, &mut id),
            STATUS_SUCCESS
        );
        assert_ne!(id, 0);

        let mut info = MmMemoryInfo::default();
        assert_eq!(nt_query_area(&ctx, 1, address + 0x1fff, &mut info), STATUS_SUCCESS);
        assert_eq!(info.area_id, id);
        assert_eq!(info.region_size, 0x2000);
        assert_eq!(info.protect, PAGE_READWRITE);
        assert_eq!(info.state, MEM_RESERVE);
        assert_eq!(nt_query_area(&ctx, 1, address + 0x2000, &mut info), STATUS_ACCESS_VIOLATION);

        let mut old = 0;
        assert_eq!(nt_protect_area(&ctx, 1, id, PAGE_READONLY, &mut old), STATUS_SUCCESS);
        assert_eq!(old, PAGE_READWRITE);
        assert_eq!(nt_protect_area(&ctx, 1, id, 0x1234, &mut old), STATUS_INVALID_PARAMETER);

        assert_eq!(nt_delete_area(&ctx, 2, id), STATUS_INVALID_PARAMETER);
        assert_eq!(nt_delete_area(&ctx, 1, id), STATUS_SUCCESS);
        assert_eq!(nt_delete_area(&ctx, 1, id), STATUS_INVALID_PARAMETER);
    }

    #[test]
    fn test_bad_arguments_rejected() {
        let (_m, ctx) = context();
        let mut address = 0;
        let mut id = 0;
        assert_eq!(
            nt_create_area(&ctx, 1, "x", &mut address, 7, 0x1000, AREA_NO_LOCK, PAGE_READWRITE, &mut id),
            STATUS_INVALID_PARAMETER
        );
        assert_eq!(
            nt_create_area(&ctx, 1, "x", &mut address, AREA_ANY_ADDRESS, 0x1000, 9, PAGE_READWRITE, &mut id),
            STATUS_INVALID_PARAMETER
        );
        assert_eq!(
            nt_create_area(&ctx, 1, "x", &mut address, AREA_ANY_ADDRESS, 1 << 30, AREA_FULL_LOCK, PAGE_READWRITE, &mut id),
            STATUS_NO_MEMORY
        );
        assert_eq!((address, id), (0, 0));
        assert_eq!(nt_resize_area(&ctx, 1, 42, 0x1000), STATUS_INVALID_PARAMETER);
    }

    #[test]
    fn test_clone_into_other_team() {
        let (_m, ctx) = context();
        let mut address = 0;
        let mut id = 0;
        nt_create_area(&ctx, 1, "shm", &mut address, AREA_ANY_ADDRESS, 0x1000, AREA_NO_LOCK, PAGE_READWRITE, &mut id);
        let mut clone_address = 0;
        let mut clone_id = 0;
        assert_eq!(
            nt_clone_area(&ctx, 2, "shm", &mut clone_address, AREA_ANY_ADDRESS, AREA_CLONE_SHARED, id, &mut clone_id),
            STATUS_SUCCESS
        );
        let mut info = MmMemoryInfo::default();
        assert_eq!(nt_query_area(&ctx, 2, clone_address, &mut info), STATUS_SUCCESS);
        assert_eq!(info.team, 2);
        assert_eq!(info.area_id, clone_id);
        assert_eq!(nt_query_area(&ctx, 9, clone_address, &mut info), STATUS_INVALID_PARAMETER);
    }
}
