//! Memory manager status codes
//!
//! Every recoverable failure of the memory manager is one of these.
//! Invariant violations are not errors: they bug-check.

use core::fmt;

/// Recoverable memory manager failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MmError {
    /// The page pool cannot satisfy the request
    NoMemory,
    /// A non-blocking request would have had to wait
    WouldBlock,
    /// Address outside the address space, unmapped or misaligned
    BadAddress,
    /// Invalid handle, double delete or malformed size
    BadValue,
    /// The object is held by a conflicting operation
    Busy,
}

pub type MmResult<T> = Result<T, MmError>;

impl MmError {
    /// True for the exhaustion errors a caller may retry
    pub fn is_exhaustion(self) -> bool {
        matches!(self, MmError::NoMemory | MmError::WouldBlock)
    }
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MmError::NoMemory => "out of memory",
            MmError::WouldBlock => "operation would block",
            MmError::BadAddress => "bad address",
            MmError::BadValue => "bad value",
            MmError::Busy => "resource busy",
        };
        f.write_str(text)
    }
}
