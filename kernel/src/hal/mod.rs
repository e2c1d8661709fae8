//! Hardware Abstraction Layer (hal)
//!
//! The memory manager reaches processors and physical memory only through
//! [`crate::ke::cpu::CpuServices`] and
//! [`crate::mm::physical::PhysicalPageMapper`]. On the host those are
//! provided by a simulated machine:
//!
//! - **sim**: CPUs with software TLBs, thread pinning and a synchronous
//!   shootdown interrupt; RAM backed by heap memory; a boot memory map

#[cfg(any(test, feature = "std"))]
pub mod sim;
