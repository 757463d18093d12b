//! This module provides an `Error` type for the crate using the [`thiserror`] crate.
use thiserror::Error;

/// The `Error` type.
///
/// Only host-facing operations (construction, snapshot restore) report
/// errors this way. Faults raised by guest code are architectural events and
/// are delivered to the guest as exceptions, never through this type.
#[derive(Debug, Error)]
pub enum Error {
    /// The requested guest RAM size is zero, not page aligned, or exceeds the
    /// 32-bit physical address space.
    #[error("invalid guest RAM size: {0:#x}")]
    InvalidRamSize(u64),
    /// The MMIO range is empty or extends beyond the 32-bit physical address
    /// space.
    #[error("invalid MMIO range")]
    InvalidMmioRange,
    /// A snapshot was produced by a core with a different configuration
    /// (e.g. it contains FPU state but this core has no FPU).
    #[error("snapshot does not match the core configuration")]
    SnapshotMismatch,
}
