//! Kernel Executive Primitives (ke)
//!
//! The slice of the kernel core that the memory manager consumes:
//!
//! - **cpu**: processor identifiers, affinity sets, thread pinning and the
//!   inter-CPU interrupt used for TLB shootdown
//! - **mutex**: recursive, owner-tracked kernel mutex
//! - **bugcheck**: fatal system error handling (stop codes)
//!
//! The scheduler itself lives outside this crate; it is reached through the
//! [`cpu::CpuServices`] trait so the memory manager can run on real
//! processors or on the simulated machine in [`crate::hal`].

pub mod bugcheck;
pub mod cpu;
pub mod mutex;

pub use bugcheck::{codes as bugcheck_codes, ke_bugcheck, ke_bugcheck_ex};
pub use cpu::{CpuId, CpuServices, CpuSet, PinGuard, ThreadId, MAX_CPUS};
pub use mutex::{KMutex, KMutexGuard};
