//! Processor Services
//!
//! The memory manager needs a handful of things from the scheduler and the
//! interrupt controller: which CPU it is running on, a way to stay there
//! while a TLB shootdown is in flight, a synchronous inter-CPU interrupt to
//! invalidate other processors' TLBs, and a way to give up the CPU while a
//! blocking page reservation waits.
//!
//! These are collected in [`CpuServices`]. The kernel implements it on top
//! of the PRCB and the local APIC; host builds use [`crate::hal::sim`].

use core::fmt;

use crate::mm::tlb::TlbShootdownRequest;

/// Maximum number of processors tracked by a [`CpuSet`]
pub const MAX_CPUS: usize = 64;

/// Processor number (0-based)
pub type CpuId = usize;

/// Kernel thread identifier
///
/// Zero is never a valid thread id; lock owners use it as "unowned".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Create a thread id. Returns `None` for zero.
    pub const fn new(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Processor affinity set (KAFFINITY)
///
/// One bit per processor, up to [`MAX_CPUS`].
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CpuSet(u64);

impl CpuSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Set containing processors `0..count`
    pub const fn first(count: usize) -> Self {
        if count >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    pub const fn single(cpu: CpuId) -> Self {
        Self(1u64 << cpu)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn contains(self, cpu: CpuId) -> bool {
        cpu < MAX_CPUS && self.0 & (1u64 << cpu) != 0
    }

    #[inline]
    pub fn insert(&mut self, cpu: CpuId) {
        if cpu < MAX_CPUS {
            self.0 |= 1u64 << cpu;
        }
    }

    #[inline]
    pub fn remove(&mut self, cpu: CpuId) {
        if cpu < MAX_CPUS {
            self.0 &= !(1u64 << cpu);
        }
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub const fn union(self, other: CpuSet) -> CpuSet {
        CpuSet(self.0 | other.0)
    }

    pub const fn intersection(self, other: CpuSet) -> CpuSet {
        CpuSet(self.0 & other.0)
    }

    /// Iterate over the processors in the set, lowest first
    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let cpu = bits.trailing_zeros() as CpuId;
            bits &= bits - 1;
            Some(cpu)
        })
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuSet({:#x})", self.0)
    }
}

/// Scheduler and interrupt services consumed by the memory manager
pub trait CpuServices: Send + Sync {
    /// Number of processors online
    fn cpu_count(&self) -> usize;

    /// Processor the calling thread is running on
    fn current_cpu(&self) -> CpuId;

    /// Identifier of the calling thread
    fn current_thread(&self) -> ThreadId;

    /// Prevent the calling thread from migrating. Nests; returns the CPU
    /// the thread is now pinned to.
    fn pin_current_thread(&self) -> CpuId;

    /// Undo one [`CpuServices::pin_current_thread`]
    fn unpin_current_thread(&self);

    /// Run `request` on every processor in `targets` (the calling processor
    /// included, if it is in the set) and return once all have applied it.
    ///
    /// The caller must be pinned.
    fn send_tlb_shootdown(&self, targets: CpuSet, request: &TlbShootdownRequest<'_>);

    /// Load a new page-table root on `cpu` (CR3 write). Non-global TLB
    /// entries of the previous root are discarded.
    fn load_translation_root(&self, cpu: CpuId, root: u64);

    /// Give up the processor while waiting for a resource
    fn yield_cpu(&self);
}

/// RAII pin of the current thread to its processor
pub struct PinGuard<'a> {
    cpus: &'a dyn CpuServices,
    cpu: CpuId,
}

impl<'a> PinGuard<'a> {
    pub fn new(cpus: &'a dyn CpuServices) -> Self {
        let cpu = cpus.pin_current_thread();
        Self { cpus, cpu }
    }

    /// Processor the thread is pinned to
    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.cpus.unpin_current_thread();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_cpu_set_basic() {
        let mut set = CpuSet::empty();
        assert!(set.is_empty());
        set.insert(0);
        set.insert(5);
        set.insert(63);
        assert!(set.contains(5));
        assert!(!set.contains(4));
        assert_eq!(set.count(), 3);
        set.remove(5);
        assert!(!set.contains(5));
        assert_eq!(set.iter().collect::<Vec<_>>(), [0, 63]);
    }

    #[test]
    fn test_cpu_set_first() {
        assert_eq!(CpuSet::first(4).bits(), 0xF);
        assert_eq!(CpuSet::first(0).bits(), 0);
        assert_eq!(CpuSet::first(64).count(), 64);
        assert_eq!(
            CpuSet::first(4).intersection(CpuSet::single(2)),
            CpuSet::single(2)
        );
    }

    #[test]
    fn test_thread_id_zero_rejected() {
        assert!(ThreadId::new(0).is_none());
        assert_eq!(ThreadId::new(7).map(ThreadId::as_u64), Some(7));
    }
}
