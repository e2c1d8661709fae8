//! Simulated Machine
//!
//! A small multiprocessor for running the memory manager on the host.
//!
//! # Processors
//!
//! Each host thread is "running" on one simulated CPU (CPU 0 unless it
//! calls [`SimCpus::run_on`]). Every CPU owns a software TLB that caches
//! translations filled by [`SimCpus::probe`], exactly as a hardware TLB
//! caches page walks: once filled, an entry stays visible until a
//! shootdown or a root switch removes it, whatever the page tables say.
//!
//! Shootdown interrupts are delivered synchronously by applying the request
//! to each target's TLB before returning.
//!
//! # Memory
//!
//! [`SimRam`] backs a contiguous run of frames starting at 1MB with heap
//! memory. [`SimMachine`] bundles both with a matching boot memory map.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::ke::bugcheck::{codes, ke_bugcheck_ex};
use crate::ke::cpu::{CpuId, CpuServices, CpuSet, ThreadId, MAX_CPUS};
use crate::mm::context::MmPlatform;
use crate::mm::pfn::{Pfn, PAGE_SHIFT, PAGE_SIZE};
use crate::mm::physical::{
    BootInfo, KernelArgsRange, MmMemoryRegion, MmMemoryType, PhysicalPageMapper,
};
use crate::mm::tlb::TlbShootdownRequest;
use crate::mm::translation::TranslationMap;

/// Key used for global translations, which survive root switches
const GLOBAL_ROOT: u64 = 0;

/// First simulated RAM address
pub const SIM_RAM_BASE: u64 = 0x10_0000;

/// Pages at the start of RAM handed over as kernel arguments
pub const SIM_KERNEL_ARGS_PAGES: u64 = 4;

/// Device window placed just above RAM
pub const SIM_MMIO_PAGES: u64 = 16;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static CURRENT_CPU: Cell<CpuId> = const { Cell::new(0) };
    static PIN_DEPTH: Cell<u32> = const { Cell::new(0) };
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// One cached translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub physical: u64,
    pub writable: bool,
    pub global: bool,
}

/// Record of one delivered shootdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShootdownRecord {
    pub sender: CpuId,
    pub targets: CpuSet,
    pub root: u64,
    /// `None` for a full invalidation
    pub pages: Option<usize>,
}

#[derive(Default)]
struct SoftTlb {
    entries: BTreeMap<(u64, u64), TlbEntry>,
}

impl SoftTlb {
    fn apply(&mut self, request: &TlbShootdownRequest<'_>) {
        match *request {
            TlbShootdownRequest::Pages {
                root,
                addresses,
                global,
            } => {
                for &va in addresses {
                    let vpn = va >> PAGE_SHIFT;
                    self.entries.remove(&(root, vpn));
                    if global {
                        self.entries.remove(&(GLOBAL_ROOT, vpn));
                    }
                }
            }
            TlbShootdownRequest::Full { root, global } => {
                self.entries
                    .retain(|&(key, _), _| key != root && !(global && key == GLOBAL_ROOT));
            }
        }
    }
}

/// Simulated processors
pub struct SimCpus {
    count: usize,
    tlbs: Vec<Mutex<SoftTlb>>,
    roots: Vec<AtomicU64>,
    log: Mutex<Vec<ShootdownRecord>>,
}

impl SimCpus {
    pub fn new(count: usize) -> Self {
        assert!(count > 0 && count <= MAX_CPUS);
        Self {
            count,
            tlbs: (0..count).map(|_| Mutex::new(SoftTlb::default())).collect(),
            roots: (0..count).map(|_| AtomicU64::new(0)).collect(),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Move the calling thread to `cpu`
    ///
    /// Panics if the thread is pinned.
    pub fn run_on(&self, cpu: CpuId) {
        assert!(cpu < self.count, "no such cpu {}", cpu);
        assert_eq!(PIN_DEPTH.with(Cell::get), 0, "pinned thread cannot migrate");
        CURRENT_CPU.with(|c| c.set(cpu));
    }

    /// Is the calling thread pinned?
    pub fn is_pinned(&self) -> bool {
        PIN_DEPTH.with(Cell::get) > 0
    }

    /// Root currently loaded on `cpu`
    pub fn current_root(&self, cpu: CpuId) -> u64 {
        self.roots[cpu].load(Ordering::Acquire)
    }

    /// Translate `va` on `cpu` the way its MMU would: TLB first, then a
    /// page walk through `map` that fills the TLB.
    pub fn probe(&self, cpu: CpuId, map: &dyn TranslationMap, va: u64) -> Option<u64> {
        let root = map.root_physical();
        let vpn = va >> PAGE_SHIFT;
        let offset = va & (PAGE_SIZE as u64 - 1);
        {
            let tlb = self.tlbs[cpu].lock();
            if let Some(entry) = tlb
                .entries
                .get(&(root, vpn))
                .or_else(|| tlb.entries.get(&(GLOBAL_ROOT, vpn)))
            {
                return Some(entry.physical + offset);
            }
        }

        let query = map.query(va)?;
        let entry = TlbEntry {
            physical: query.physical,
            writable: query.is_writable(),
            global: query.is_global(),
        };
        let key = if entry.global { GLOBAL_ROOT } else { root };
        self.tlbs[cpu].lock().entries.insert((key, vpn), entry);
        Some(entry.physical + offset)
    }

    /// Cached translation on `cpu`, without walking
    pub fn tlb_lookup(&self, cpu: CpuId, root: u64, va: u64) -> Option<TlbEntry> {
        let tlb = self.tlbs[cpu].lock();
        let vpn = va >> PAGE_SHIFT;
        tlb.entries
            .get(&(root, vpn))
            .or_else(|| tlb.entries.get(&(GLOBAL_ROOT, vpn)))
            .copied()
    }

    pub fn tlb_entry_count(&self, cpu: CpuId) -> usize {
        self.tlbs[cpu].lock().entries.len()
    }

    /// Every shootdown delivered so far
    pub fn shootdown_log(&self) -> Vec<ShootdownRecord> {
        self.log.lock().clone()
    }

    pub fn clear_shootdown_log(&self) {
        self.log.lock().clear();
    }
}

impl CpuServices for SimCpus {
    fn cpu_count(&self) -> usize {
        self.count
    }

    fn current_cpu(&self) -> CpuId {
        CURRENT_CPU.with(Cell::get)
    }

    fn current_thread(&self) -> ThreadId {
        let raw = THREAD_ID.with(|id| {
            if id.get() == 0 {
                id.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
            }
            id.get()
        });
        match ThreadId::new(raw) {
            Some(thread) => thread,
            None => ke_bugcheck_ex(codes::MEMORY_MANAGEMENT, 0, 0, 0, 0),
        }
    }

    fn pin_current_thread(&self) -> CpuId {
        PIN_DEPTH.with(|d| d.set(d.get() + 1));
        self.current_cpu()
    }

    fn unpin_current_thread(&self) {
        PIN_DEPTH.with(|d| {
            assert!(d.get() > 0, "unpin without pin");
            d.set(d.get() - 1)
        });
    }

    fn send_tlb_shootdown(&self, targets: CpuSet, request: &TlbShootdownRequest<'_>) {
        assert!(self.is_pinned(), "shootdown sent from an unpinned thread");
        for cpu in targets.iter().filter(|&cpu| cpu < self.count) {
            self.tlbs[cpu].lock().apply(request);
        }

        let (root, pages) = match *request {
            TlbShootdownRequest::Pages {
                root, addresses, ..
            } => (root, Some(addresses.len())),
            TlbShootdownRequest::Full { root, .. } => (root, None),
        };
        self.log.lock().push(ShootdownRecord {
            sender: self.current_cpu(),
            targets,
            root,
            pages,
        });
    }

    fn load_translation_root(&self, cpu: CpuId, root: u64) {
        self.roots[cpu].store(root, Ordering::Release);
        self.tlbs[cpu]
            .lock()
            .entries
            .retain(|&(key, _), _| key == GLOBAL_ROOT);
    }

    fn yield_cpu(&self) {
        std::thread::yield_now();
    }
}

/// Heap-backed physical memory
pub struct SimRam {
    base_pfn: Pfn,
    pages: usize,
    memory: *mut [u8],
}

// Safety: the buffer is owned by SimRam and only reached through page_ptr;
// callers synchronize on frame ownership like they would on real RAM.
unsafe impl Send for SimRam {}
unsafe impl Sync for SimRam {}

impl SimRam {
    pub fn new(physical_start: u64, pages: usize) -> Self {
        let memory = alloc::vec![0u8; pages * PAGE_SIZE].into_boxed_slice();
        Self {
            base_pfn: (physical_start >> PAGE_SHIFT) as Pfn,
            pages,
            memory: alloc::boxed::Box::into_raw(memory),
        }
    }

    pub fn first_pfn(&self) -> Pfn {
        self.base_pfn
    }

    pub fn page_count(&self) -> usize {
        self.pages
    }
}

unsafe impl PhysicalPageMapper for SimRam {
    fn page_ptr(&self, pfn: Pfn) -> *mut u8 {
        match pfn.checked_sub(self.base_pfn).filter(|&i| i < self.pages) {
            // Safety: index checked against the buffer length
            Some(index) => unsafe { (self.memory as *mut u8).add(index * PAGE_SIZE) },
            None => ke_bugcheck_ex(
                codes::PAGE_FAULT_IN_NONPAGED_AREA,
                (pfn as u64) << PAGE_SHIFT,
                0,
                0,
                0,
            ),
        }
    }
}

impl Drop for SimRam {
    fn drop(&mut self) {
        // Safety: produced by Box::into_raw in new and never freed elsewhere
        unsafe { drop(alloc::boxed::Box::from_raw(self.memory)) }
    }
}

/// Processors, RAM and the boot handoff describing them
pub struct SimMachine {
    pub cpus: Arc<SimCpus>,
    pub ram: Arc<SimRam>,
    boot: BootInfo,
}

impl SimMachine {
    /// `cpu_count` processors and `ram_pages` frames of RAM at 1MB
    pub fn new(cpu_count: usize, ram_pages: u64) -> Self {
        let ram_end = SIM_RAM_BASE + ram_pages * PAGE_SIZE as u64;
        let boot = BootInfo {
            memory_map: alloc::vec![
                MmMemoryRegion::new(0, SIM_RAM_BASE >> PAGE_SHIFT, MmMemoryType::Reserved),
                MmMemoryRegion::new(SIM_RAM_BASE, ram_pages, MmMemoryType::Conventional),
                MmMemoryRegion::new(ram_end, SIM_MMIO_PAGES, MmMemoryType::Mmio),
            ],
            kernel_args: alloc::vec![KernelArgsRange {
                physical_start: SIM_RAM_BASE,
                page_count: SIM_KERNEL_ARGS_PAGES.min(ram_pages / 2),
            }],
        };
        Self {
            cpus: Arc::new(SimCpus::new(cpu_count)),
            ram: Arc::new(SimRam::new(SIM_RAM_BASE, ram_pages as usize)),
            boot,
        }
    }

    pub fn boot_info(&self) -> &BootInfo {
        &self.boot
    }

    pub fn kernel_args_pages(&self) -> usize {
        self.boot.kernel_args.iter().map(|r| r.page_count as usize).sum()
    }

    /// Platform services for [`crate::mm::MmContext::init`]
    pub fn platform(&self) -> MmPlatform {
        MmPlatform {
            cpus: self.cpus.clone(),
            mapper: self.ram.clone(),
        }
    }
}
