//! Backing Stores
//!
//! A store is the terminal source of a cache chain's content: the pager
//! reads pages from it on a hard fault and writes modified pages back to
//! it. Concrete stores (files, devices) live outside the memory manager;
//! [`MemoryStore`] is a RAM-backed store for ramdisks and tests.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::error::{MmError, MmResult};
use super::pfn::PAGE_SIZE;

/// Pager interface to a store
pub trait BackingStore: Send + Sync {
    /// Size of the store's content in bytes
    fn size(&self) -> u64;

    /// Read the page at byte `offset` into `buffer`
    ///
    /// Bytes past the end of the store read as zero.
    fn read_page(&self, offset: u64, buffer: &mut [u8]) -> MmResult<()>;

    /// Write `data` to the page at byte `offset`
    fn write_page(&self, offset: u64, data: &[u8]) -> MmResult<()>;
}

/// Store held in kernel heap memory
pub struct MemoryStore {
    data: Mutex<Vec<u8>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Zero-filled store of `size` bytes
    pub fn new(size: u64) -> Self {
        Self::from_bytes(vec![0; size as usize])
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Copy `buffer.len()` bytes starting at `offset`
    pub fn read_bytes(&self, offset: u64, buffer: &mut [u8]) {
        let data = self.data.lock();
        copy_clamped(&data, offset, buffer);
    }

    /// Pages read by the pager so far
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Pages written back so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

fn copy_clamped(data: &[u8], offset: u64, buffer: &mut [u8]) {
    buffer.fill(0);
    let Ok(start) = usize::try_from(offset) else {
        return;
    };
    if start >= data.len() {
        return;
    }
    let len = buffer.len().min(data.len() - start);
    buffer[..len].copy_from_slice(&data[start..start + len]);
}

impl BackingStore for MemoryStore {
    fn size(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_page(&self, offset: u64, buffer: &mut [u8]) -> MmResult<()> {
        if offset % PAGE_SIZE as u64 != 0 {
            return Err(MmError::BadAddress);
        }
        let data = self.data.lock();
        copy_clamped(&data, offset, buffer);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_page(&self, offset: u64, data: &[u8]) -> MmResult<()> {
        if offset % PAGE_SIZE as u64 != 0 {
            return Err(MmError::BadAddress);
        }
        let mut store = self.data.lock();
        let start = offset as usize;
        if start >= store.len() {
            return Err(MmError::BadAddress);
        }
        // The tail of the last page stays outside the store
        let len = data.len().min(store.len() - start);
        store[start..start + len].copy_from_slice(&data[..len]);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
