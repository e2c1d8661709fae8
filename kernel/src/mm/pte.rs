//! Page Table Entry (PTE) Implementation
//!
//! x86_64 uses 4-level paging:
//! - PML4 (Page Map Level 4) - 512 entries, each covers 512GB
//! - PDPT (Page Directory Pointer Table) - 512 entries, each covers 1GB
//! - PD (Page Directory) - 512 entries, each covers 2MB
//! - PT (Page Table) - 512 entries, each covers 4KB
//!
//! # Virtual Address Layout (48-bit)
//! ```text
//! 63-48: Sign extension (all 0s or 1s)
//! 47-39: PML4 index (9 bits)
//! 38-30: PDPT index (9 bits)
//! 29-21: PD index (9 bits)
//! 20-12: PT index (9 bits)
//! 11-0:  Page offset (12 bits)
//! ```
//!
//! # Page Table Entry Format
//! ```text
//! Bit 0:     Present
//! Bit 1:     Read/Write
//! Bit 2:     User/Supervisor
//! Bit 3:     Write-Through
//! Bit 4:     Cache Disable
//! Bit 5:     Accessed
//! Bit 6:     Dirty
//! Bit 7:     Page Size (1=Large page)
//! Bit 8:     Global
//! Bit 9:     Copy-on-write (software)
//! Bits 12-51: Physical address (40 bits, 4KB aligned)
//! Bit 63:    No Execute
//! ```

use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use super::pfn::{Pfn, PAGE_SHIFT};

/// Number of entries per page table (all levels)
pub const ENTRIES_PER_TABLE: usize = 512;

/// First PML4 slot of the kernel half
pub const KERNEL_PML4_FIRST: usize = 256;

/// Physical address bits of an entry
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Software bit marking a read-only mapping of a page owned by a source
/// cache; a write to it must copy
pub const PTE_COPY_ON_WRITE: PageTableFlags = PageTableFlags::BIT_9;

/// Flags of an intermediate (non-leaf) entry
pub fn table_entry_flags(user: bool) -> PageTableFlags {
    let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    if user {
        flags | PageTableFlags::USER_ACCESSIBLE
    } else {
        flags
    }
}

/// Hardware Page Table Entry
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct HardwarePte(u64);

impl HardwarePte {
    /// Create an empty (not present) PTE
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Create a PTE with the given physical address and flags
    pub fn new(phys_addr: u64, flags: PageTableFlags) -> Self {
        Self((phys_addr & ADDR_MASK) | flags.bits())
    }

    /// Get the raw value
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn flags(&self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    /// Get the physical address
    #[inline]
    pub fn phys_addr(&self) -> u64 {
        self.0 & ADDR_MASK
    }

    #[inline]
    pub fn pfn(&self) -> Pfn {
        (self.phys_addr() >> PAGE_SHIFT) as Pfn
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.flags().contains(PageTableFlags::PRESENT)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.flags().contains(PageTableFlags::WRITABLE)
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        self.flags().contains(PageTableFlags::USER_ACCESSIBLE)
    }

    #[inline]
    pub fn is_accessed(&self) -> bool {
        self.flags().contains(PageTableFlags::ACCESSED)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PageTableFlags::DIRTY)
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        self.flags().contains(PageTableFlags::GLOBAL)
    }

    #[inline]
    pub fn is_no_execute(&self) -> bool {
        self.flags().contains(PageTableFlags::NO_EXECUTE)
    }

    #[inline]
    pub fn is_copy_on_write(&self) -> bool {
        self.flags().contains(PTE_COPY_ON_WRITE)
    }

    /// Same frame, new flags
    pub fn with_flags(&self, flags: PageTableFlags) -> Self {
        Self::new(self.phys_addr(), flags)
    }

    /// Set a flag
    pub fn set_flags(&mut self, flags: PageTableFlags) {
        self.0 |= flags.bits();
    }

    /// Clear a flag
    pub fn clear_flags(&mut self, flags: PageTableFlags) {
        self.0 &= !flags.bits();
    }
}

impl core::fmt::Debug for HardwarePte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte({:#x}, {:?})", self.phys_addr(), self.flags())
    }
}

// ============================================================================
// Virtual address manipulation
// ============================================================================

#[inline]
pub fn pml4_index(virt_addr: u64) -> usize {
    usize::from(VirtAddr::new_truncate(virt_addr).p4_index())
}

#[inline]
pub fn pdpt_index(virt_addr: u64) -> usize {
    usize::from(VirtAddr::new_truncate(virt_addr).p3_index())
}

#[inline]
pub fn pd_index(virt_addr: u64) -> usize {
    usize::from(VirtAddr::new_truncate(virt_addr).p2_index())
}

#[inline]
pub fn pt_index(virt_addr: u64) -> usize {
    usize::from(VirtAddr::new_truncate(virt_addr).p1_index())
}

#[inline]
pub fn page_offset(virt_addr: u64) -> usize {
    usize::from(VirtAddr::new_truncate(virt_addr).page_offset())
}

/// Bits 48-63 are copies of bit 47
pub fn is_canonical(virt_addr: u64) -> bool {
    VirtAddr::try_new(virt_addr).is_ok()
}

pub fn is_kernel_address(virt_addr: u64) -> bool {
    is_canonical(virt_addr) && virt_addr >> 63 == 1
}

pub fn is_user_address(virt_addr: u64) -> bool {
    is_canonical(virt_addr) && virt_addr >> 63 == 0
}

/// Table indices from PML4 down to PT
pub fn table_indices(virt_addr: u64) -> [usize; 4] {
    [
        pml4_index(virt_addr),
        pdpt_index(virt_addr),
        pd_index(virt_addr),
        pt_index(virt_addr),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices() {
        let va = 0xFFFF_8000_4020_3123u64;
        assert_eq!(pml4_index(va), 256);
        assert_eq!(pdpt_index(va), 1);
        assert_eq!(pd_index(va), 1);
        assert_eq!(pt_index(va), 3);
        assert_eq!(page_offset(va), 0x123);
    }

    #[test]
    fn test_canonical() {
        assert!(is_user_address(0x0000_7FFF_FFFF_F000));
        assert!(is_kernel_address(0xFFFF_8000_0000_0000));
        assert!(!is_canonical(0x0000_8000_0000_0000));
        assert!(!is_user_address(0xFFFF_8000_0000_0000));
    }

    #[test]
    fn test_pte_fields() {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PTE_COPY_ON_WRITE;
        let mut pte = HardwarePte::new(0x12_3456_7000, flags);
        assert!(pte.is_present());
        assert!(pte.is_copy_on_write());
        assert_eq!(pte.pfn(), 0x12_3456_7);
        pte.set_flags(PageTableFlags::DIRTY);
        assert!(pte.is_dirty());
        pte.clear_flags(PageTableFlags::WRITABLE | PageTableFlags::DIRTY);
        assert!(!pte.is_writable() && !pte.is_dirty());
        assert_eq!(pte.phys_addr(), 0x12_3456_7000);
    }
}
