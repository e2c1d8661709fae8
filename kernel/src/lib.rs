//! Nostalgia OS Memory Manager
//!
//! The virtual memory manager of the kernel, split out as a library so the
//! same code runs inside the kernel image and on a simulated machine for
//! host testing.
//!
//! # Subsystems
//!
//! - **ke** - Kernel primitives consumed by the memory manager: CPU services
//!   (pinning, inter-CPU interrupts), recursive mutex, bug check
//! - **mm** - Memory Manager: PFN database and reservations, translation
//!   maps and TLB shootdown, caches with copy-on-write chains, areas and
//!   address spaces, page faults, low-memory monitoring
//! - **hal** - Simulated CPUs and RAM (host builds only)
//!
//! # Initialization
//!
//! The kernel builds one [`mm::MmContext`] during phase 0 from the boot
//! memory map and hands it by reference to every subsystem that needs it.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

extern crate alloc;

pub mod hal;
pub mod ke;
pub mod mm;
