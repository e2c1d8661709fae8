//! Kernel Bug Check (STOP errors)
//!
//! Called when the memory manager detects an unrecoverable inconsistency:
//! a corrupted PFN list, a reservation that was promised but cannot be
//! honoured, a page-table entry that points somewhere it must not. Carrying
//! on would risk corrupting memory of unrelated processes, so the system is
//! stopped instead.
//!
//! The bug check records the stop code and its four parameters, logs them
//! at error level and halts. On the host the halt is a panic, which lets
//! tests assert that a corruption is detected.
//!
//! # Bug Check Codes
//!
//! Codes follow the NT STOP code table. Only the ones the memory manager
//! raises are defined here.

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

/// Number of bug checks raised (nested ones included)
static BUGCHECK_COUNT: AtomicU32 = AtomicU32::new(0);

/// Data of the first bug check, kept for the debugger
static BUGCHECK_DATA: Mutex<Option<BugCheckData>> = Mutex::new(None);

/// Bug check information structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BugCheckData {
    /// The bug check code
    pub code: u32,
    pub parameter1: u64,
    pub parameter2: u64,
    pub parameter3: u64,
    pub parameter4: u64,
}

/// Bug check codes
pub mod codes {
    /// THREAD_NOT_MUTEX_OWNER (0x11)
    /// Parameter1: mutex address, Parameter2: releasing thread,
    /// Parameter3: actual owner
    pub const THREAD_NOT_MUTEX_OWNER: u32 = 0x0000_0011;

    /// MEMORY_MANAGEMENT (0x1A)
    /// Generic memory manager invariant violation.
    /// Parameter1 identifies the check (see `mm_check` below)
    pub const MEMORY_MANAGEMENT: u32 = 0x0000_001A;

    /// NO_PAGES_AVAILABLE (0x4D)
    /// A reserved page could not be handed out.
    /// Parameter1: pages free, Parameter2: pages unreserved
    pub const NO_PAGES_AVAILABLE: u32 = 0x0000_004D;

    /// PFN_LIST_CORRUPT (0x4E)
    /// Parameter1: subcode, Parameter2: page frame number,
    /// Parameter3: page state
    pub const PFN_LIST_CORRUPT: u32 = 0x0000_004E;

    /// PAGE_FAULT_IN_NONPAGED_AREA (0x50)
    /// Parameter1: faulting virtual address, Parameter2: read (0) or write (1)
    pub const PAGE_FAULT_IN_NONPAGED_AREA: u32 = 0x0000_0050;

    /// Parameter1 values for MEMORY_MANAGEMENT
    pub mod mm_check {
        /// Page inserted at an offset the cache already holds
        pub const CACHE_OFFSET_OCCUPIED: u64 = 0x1001;
        /// Freed page still mapped or wired
        pub const FREE_MAPPED_PAGE: u64 = 0x1002;
        /// Page-table entry references a frame outside the database
        pub const BAD_PAGE_TABLE_FRAME: u64 = 0x1003;
        /// Mapping count underflow
        pub const MAPPING_COUNT_UNDERFLOW: u64 = 0x1004;
        /// Wired count underflow
        pub const WIRED_COUNT_UNDERFLOW: u64 = 0x1005;
    }

    /// Parameter1 values for PFN_LIST_CORRUPT
    pub mod pfn_check {
        /// Page freed twice
        pub const DOUBLE_FREE: u64 = 0x01;
        /// Illegal state transition
        pub const BAD_TRANSITION: u64 = 0x02;
        /// Queue link does not point back
        pub const BROKEN_LINK: u64 = 0x03;
        /// Frame number outside the database
        pub const BAD_FRAME: u64 = 0x04;
    }
}

fn bugcheck_code_name(code: u32) -> &'static str {
    match code {
        codes::THREAD_NOT_MUTEX_OWNER => "THREAD_NOT_MUTEX_OWNER",
        codes::MEMORY_MANAGEMENT => "MEMORY_MANAGEMENT",
        codes::NO_PAGES_AVAILABLE => "NO_PAGES_AVAILABLE",
        codes::PFN_LIST_CORRUPT => "PFN_LIST_CORRUPT",
        codes::PAGE_FAULT_IN_NONPAGED_AREA => "PAGE_FAULT_IN_NONPAGED_AREA",
        _ => "UNKNOWN_BUGCHECK",
    }
}

/// Bring down the system with a stop code and no parameters
pub fn ke_bugcheck(code: u32) -> ! {
    ke_bugcheck_ex(code, 0, 0, 0, 0)
}

/// Bring down the system with a stop code and four parameters
#[cold]
pub fn ke_bugcheck_ex(code: u32, p1: u64, p2: u64, p3: u64, p4: u64) -> ! {
    let nested = BUGCHECK_COUNT.fetch_add(1, Ordering::SeqCst) > 0;
    let data = BugCheckData {
        code,
        parameter1: p1,
        parameter2: p2,
        parameter3: p3,
        parameter4: p4,
    };

    if !nested {
        if let Some(mut saved) = BUGCHECK_DATA.try_lock() {
            saved.get_or_insert(data);
        }
    }

    log::error!(
        "[BUGCHECK] *** STOP: {:#010X} ({:#018X}, {:#018X}, {:#018X}, {:#018X}) {}",
        code,
        p1,
        p2,
        p3,
        p4,
        bugcheck_code_name(code)
    );

    panic!(
        "*** STOP: {:#010X} ({:#X}, {:#X}, {:#X}, {:#X}) {}",
        code,
        p1,
        p2,
        p3,
        p4,
        bugcheck_code_name(code)
    );
}

/// Number of bug checks raised so far
pub fn bugcheck_count() -> u32 {
    BUGCHECK_COUNT.load(Ordering::SeqCst)
}

/// Data of the first bug check, if one occurred
pub fn get_bugcheck_data() -> Option<BugCheckData> {
    *BUGCHECK_DATA.lock()
}
