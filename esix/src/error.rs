//! The crate-wide error type.
//!
//! Packet-processing failures are recovered locally (the pipeline drops and
//! logs, it never surfaces an `EsixError` for a malformed frame); this type
//! is for the handful of API-level and resource-exhaustion failures that a
//! caller of the upward API needs to distinguish.

use core::fmt;

/// Everything that can go wrong at the esix API boundary.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsixError {
    /// Heap allocation failed.
    OutOfMemory,
    /// A caller-supplied argument was invalid for the operation.
    InvalidArgument,
    /// A bounded table (addresses, routes, neighbors, sockets, queues) is full.
    TableFull,
    /// No matching entry exists.
    NotFound,
    /// Duplicate Address Detection found another host already using the address.
    DuplicateAddress,
    /// The socket is closed and cannot be operated on.
    Closed,
    /// The operation would block and the caller asked not to.
    WouldBlock,
    /// The operation's deadline elapsed before it could complete.
    Timeout,
}

impl fmt::Display for EsixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            EsixError::OutOfMemory => "out of memory",
            EsixError::InvalidArgument => "invalid argument",
            EsixError::TableFull => "table full",
            EsixError::NotFound => "not found",
            EsixError::DuplicateAddress => "duplicate address",
            EsixError::Closed => "closed",
            EsixError::WouldBlock => "would block",
            EsixError::Timeout => "timeout",
        };
        f.write_str(msg)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EsixError {}
