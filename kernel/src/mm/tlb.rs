//! TLB Shootdown
//!
//! In an SMP system, when one CPU modifies a page table entry, other CPUs
//! may have stale TLB entries. Translation maps collect the addresses they
//! touched in an [`InvalidationBatch`] and drain it with
//! [`tlb_flush_batch`] when their lock is released for the last time.
//!
//! # Protocol
//!
//! 1. Pin the calling thread so it cannot migrate mid-invalidation
//! 2. Build a request: the listed pages, or the whole TLB if the batch
//!    overflowed
//! 3. Deliver it synchronously to every CPU the map is active on (the
//!    calling CPU included)
//!
//! A map that is active nowhere has nothing cached: loading a root flushes
//! the non-global entries of the previous one.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::ke::cpu::{CpuServices, CpuSet, PinGuard};

/// Addresses a batch holds before falling back to a full flush
pub const INVALIDATE_BATCH_SIZE: usize = 64;

/// Work carried by a shootdown interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbShootdownRequest<'a> {
    /// Invalidate the listed pages of the address space rooted at `root`
    Pages {
        root: u64,
        addresses: &'a [u64],
        /// Also drop global translations of these pages
        global: bool,
    },
    /// Invalidate every translation of `root`
    Full {
        root: u64,
        /// Also drop every global translation
        global: bool,
    },
}

/// Pending invalidations of one translation map
#[derive(Clone)]
pub struct InvalidationBatch {
    addresses: [u64; INVALIDATE_BATCH_SIZE],
    /// Number of invalidations queued; may exceed the capacity
    count: usize,
}

impl InvalidationBatch {
    pub const fn new() -> Self {
        Self {
            addresses: [0; INVALIDATE_BATCH_SIZE],
            count: 0,
        }
    }

    /// Queue a page for invalidation
    pub fn push(&mut self, virt_addr: u64) {
        if self.count < INVALIDATE_BATCH_SIZE {
            self.addresses[self.count] = virt_addr;
        }
        self.count += 1;
    }

    /// Queued invalidations (overflowed ones included)
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// More pages queued than the batch can list
    #[inline]
    pub fn needs_full_flush(&self) -> bool {
        self.count > INVALIDATE_BATCH_SIZE
    }

    /// Listed addresses (meaningless once overflowed)
    pub fn addresses(&self) -> &[u64] {
        &self.addresses[..self.count.min(INVALIDATE_BATCH_SIZE)]
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }
}

impl Default for InvalidationBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// How a batch was drained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShootdownKind {
    /// Nothing to do: empty batch or map active nowhere
    None,
    Pages(usize),
    Full,
}

/// Shootdown statistics of one translation map
#[derive(Default)]
pub struct ShootdownStats {
    page_shootdowns: AtomicU64,
    full_shootdowns: AtomicU64,
    pages_invalidated: AtomicU64,
    /// Sum of target CPUs over all shootdowns
    cpus_interrupted: AtomicU64,
}

/// Snapshot of [`ShootdownStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShootdownCounts {
    pub page_shootdowns: u64,
    pub full_shootdowns: u64,
    pub pages_invalidated: u64,
    pub cpus_interrupted: u64,
}

impl ShootdownStats {
    pub const fn new() -> Self {
        Self {
            page_shootdowns: AtomicU64::new(0),
            full_shootdowns: AtomicU64::new(0),
            pages_invalidated: AtomicU64::new(0),
            cpus_interrupted: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> ShootdownCounts {
        ShootdownCounts {
            page_shootdowns: self.page_shootdowns.load(Ordering::Relaxed),
            full_shootdowns: self.full_shootdowns.load(Ordering::Relaxed),
            pages_invalidated: self.pages_invalidated.load(Ordering::Relaxed),
            cpus_interrupted: self.cpus_interrupted.load(Ordering::Relaxed),
        }
    }
}

/// Drain `batch` on every CPU in `active`
///
/// `global` is set for the kernel map, whose translations are global and
/// live in every CPU's TLB. The batch is left untouched; the caller clears
/// it.
pub fn tlb_flush_batch(
    cpus: &dyn CpuServices,
    active: CpuSet,
    root: u64,
    global: bool,
    batch: &InvalidationBatch,
    stats: &ShootdownStats,
) -> ShootdownKind {
    if batch.is_empty() || active.is_empty() {
        return ShootdownKind::None;
    }

    let pin = PinGuard::new(cpus);

    let (request, kind) = if batch.needs_full_flush() {
        stats.full_shootdowns.fetch_add(1, Ordering::Relaxed);
        (TlbShootdownRequest::Full { root, global }, ShootdownKind::Full)
    } else {
        let addresses = batch.addresses();
        stats.page_shootdowns.fetch_add(1, Ordering::Relaxed);
        stats
            .pages_invalidated
            .fetch_add(addresses.len() as u64, Ordering::Relaxed);
        (
            TlbShootdownRequest::Pages {
                root,
                addresses,
                global,
            },
            ShootdownKind::Pages(addresses.len()),
        )
    };
    stats
        .cpus_interrupted
        .fetch_add(active.count() as u64, Ordering::Relaxed);

    log::trace!(
        "[TLB] cpu {} shootdown {:?} root {:#x} targets {:?}",
        pin.cpu(),
        kind,
        root,
        active
    );
    cpus.send_tlb_shootdown(active, &request);
    kind
}
