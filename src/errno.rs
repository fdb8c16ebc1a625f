/*
 * Kernel Error Codes
 *
 * One error enum for the whole kernel. Primitives that can fail return
 * Result<T> and propagate with `?`; invariant violations that cannot be
 * reported to a caller (frame-table corruption, double free) are logged
 * and the machine is halted instead.
 */

use core::fmt;

/// Error kinds surfaced by kernel primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// No frame or heap bytes available.
    OutOfMemory,
    /// Null or out-of-range parameter, bad attribute.
    InvalidArgument,
    /// Mutex unlock by a thread that is not the owner.
    NotOwner,
    /// Recursive lock on a deadlock-detecting mutex.
    Deadlock,
    /// Non-blocking operation would have to suspend.
    WouldBlock,
    /// Timed wait expired.
    Timeout,
    /// Wait canceled before it was satisfied.
    Interrupted,
    /// Join/cancel on an unknown handle.
    NotFound,
    /// Destroy of a live mutex or an in-use eventer.
    Busy,
    /// The device or policy cannot satisfy the request.
    Unsupported,
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::OutOfMemory => "out of memory",
            Errno::InvalidArgument => "invalid argument",
            Errno::NotOwner => "not owner",
            Errno::Deadlock => "deadlock detected",
            Errno::WouldBlock => "operation would block",
            Errno::Timeout => "timed out",
            Errno::Interrupted => "interrupted",
            Errno::NotFound => "not found",
            Errno::Busy => "busy",
            Errno::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

/// Kernel-wide result type.
pub type Result<T> = core::result::Result<T, Errno>;
