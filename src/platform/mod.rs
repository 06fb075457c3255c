//! Platform abstraction over executable memory and code materialization.
//!
//! Every raw memory operation of the redirection core goes through the [`Platform`]
//! trait. This confines unsafe code to the platform implementations and lets the
//! resolver, engine and orchestrator run unchanged against a simulated host.
//!
//! # Implementations
//!
//! | Platform | Description |
//! |----------|-------------|
//! | [`EmulatedPlatform`] | Simulated host runtime with lazy compilation and an executor |
//! | [`NativePlatform`] | Code of the current process, patched in place (unix, x86-64) |
//!
//! # Contract
//!
//! - [`force_compile`](Platform::force_compile) returns the entry point of fully
//!   materialized code; it never returns a stub that will later be replaced
//! - [`check_writable`](Platform::check_writable) validates a range before anything is
//!   written, so a refused write leaves memory untouched
//! - [`write_code`](Platform::write_code) performs each [`WriteStep`] as one store and
//!   toggles page protection around the writes as needed
//! - [`host_id`](Platform::host_id) is unique among all platforms of the process, so
//!   equal tokens of two hosts never name the same method
//!
//! [`WriteStep`]: crate::patch::WriteStep

mod emulated;
mod native;

pub use emulated::{EmulatedPlatform, MethodBody, MethodBuilder, Value};
pub use native::NativePlatform;

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bitflags::bitflags;

use crate::{
    metadata::method::MethodDescriptor,
    patch::{Architecture, WritePlan},
    Result,
};

bitflags! {
    /// Memory protection flags of code and dispatch regions.
    ///
    /// # Common Combinations
    ///
    /// - [`READ_EXECUTE`](Self::READ_EXECUTE) - Compiled code
    /// - [`READ_WRITE`](Self::READ_WRITE) - Dispatch tables and data
    /// - [`READ_WRITE_EXECUTE`](Self::READ_WRITE_EXECUTE) - Code while it is being patched
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MemoryProtection: u32 {
        /// Region is readable.
        const READ = 0x01;
        /// Region is writable.
        const WRITE = 0x02;
        /// Region is executable.
        const EXECUTE = 0x04;
        /// Read and write access.
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        /// Read and execute access.
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        /// Read, write, and execute access.
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self::READ_EXECUTE
    }
}

/// Location of a method's materialized code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryPoint {
    /// Address of the first instruction
    pub address: u64,
    /// Bytes at `address` that may be overwritten without clobbering other code
    pub capacity: usize,
    /// Address of the dispatch slot through which calls reach the method, if any
    pub dispatch_slot: Option<u64>,
}

impl EntryPoint {
    /// Creates an entry point without a dispatch slot.
    #[must_use]
    pub fn new(address: u64, capacity: usize) -> Self {
        EntryPoint {
            address,
            capacity,
            dispatch_slot: None,
        }
    }

    /// Adds a dispatch slot.
    #[must_use]
    pub fn with_slot(mut self, slot: u64) -> Self {
        self.dispatch_slot = Some(slot);
        self
    }
}

/// Process-unique identity of a [`Platform`] instance.
///
/// Tokens are only unique within one host's catalog; a method is identified across the
/// process by its token together with the `HostId` of the platform that owns its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(u64);

impl HostId {
    /// Allocates an identity no other call in this process has returned.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HostId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identity value.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host#{}", self.0)
    }
}

/// Access to the executable memory and compiler of a host runtime.
pub trait Platform: Send + Sync {
    /// Identity of this platform instance; stable for its lifetime.
    fn host_id(&self) -> HostId;

    /// Instruction set of the host's code.
    fn architecture(&self) -> Architecture;

    /// Forces `method` to be compiled and returns its entry point.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotYetCompiled`](crate::Error::NotYetCompiled) if the method
    /// cannot be materialized.
    fn force_compile(&self, method: &MethodDescriptor) -> Result<EntryPoint>;

    /// Reads `len` bytes at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`](crate::Error::InvalidAddress) for ranges the
    /// platform does not manage.
    fn read_code(&self, address: u64, len: usize) -> Result<Vec<u8>>;

    /// Validates that `len` bytes at `address` may be written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WritePermissionDenied`](crate::Error::WritePermissionDenied) if
    /// the range cannot be made writable.
    fn check_writable(&self, address: u64, len: usize) -> Result<()>;

    /// Performs the stores of `plan` in order.
    ///
    /// # Errors
    ///
    /// Returns an error if protection cannot be toggled or the range is not managed.
    fn write_code(&self, plan: &WritePlan) -> Result<()>;
}
