//! Patching the code of the current process.
//!
//! [`NativePlatform`] does not discover methods on its own: the host registers the entry
//! point of every participating function with
//! [`register_function`](NativePlatform::register_function), and the platform refuses to
//! read or write anything outside the registered ranges.
//!
//! Code pages are switched to read-write-execute for the duration of a write and back to
//! read-execute afterwards. The page stays executable throughout, so threads running
//! neighbouring code are never faulted. Each [`WriteStep`] is performed as a single
//! atomic read-modify-write of its aligned 8-byte word.
//!
//! Only unix targets on x86-64 are supported; elsewhere [`NativePlatform::new`] returns
//! [`Error::NotSupported`].
//!
//! [`WriteStep`]: crate::patch::WriteStep

use std::{
    fmt,
    sync::{
        atomic::{fence, AtomicU64, Ordering},
        Mutex,
    },
};

use dashmap::DashMap;

use crate::{
    metadata::{method::MethodDescriptor, token::Token},
    patch::{Architecture, WritePlan},
    platform::{EntryPoint, HostId, MemoryProtection, Platform},
    Error, Result,
};

/// Functions of the current process, patched in place.
pub struct NativePlatform {
    id: HostId,
    arch: Architecture,
    page_size: u64,
    functions: DashMap<Token, EntryPoint>,
    /// Serializes protection changes; two writers on one page must not restore each
    /// other's protection early.
    protect: Mutex<()>,
    toggles: AtomicU64,
}

impl NativePlatform {
    /// Creates a platform for the running process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] on targets other than unix x86-64.
    pub fn new() -> Result<Self> {
        if !sys::SUPPORTED {
            return Err(Error::NotSupported(format!(
                "in-process patching on {}",
                std::env::consts::ARCH
            )));
        }

        Ok(NativePlatform {
            id: HostId::next(),
            arch: Architecture::X86_64,
            page_size: sys::page_size(),
            functions: DashMap::new(),
            protect: Mutex::new(()),
            toggles: AtomicU64::new(0),
        })
    }

    /// Registers the compiled code of `method`.
    ///
    /// # Safety
    ///
    /// `address` must point to `capacity` bytes of executable code belonging to the
    /// method, and no other code may live within that range. If given, `dispatch_slot`
    /// must be an 8-byte aligned, writable pointer through which callers reach the
    /// method. All of it must stay mapped for the lifetime of this platform.
    pub unsafe fn register_function(
        &self,
        method: Token,
        address: u64,
        capacity: usize,
        dispatch_slot: Option<u64>,
    ) {
        let mut entry = EntryPoint::new(address, capacity);
        if let Some(slot) = dispatch_slot {
            entry = entry.with_slot(slot);
        }
        self.functions.insert(method, entry);
    }

    /// System page size.
    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Number of protection changes performed so far.
    #[must_use]
    pub fn protection_toggles(&self) -> u64 {
        self.toggles.load(Ordering::Relaxed)
    }

    fn page_align(&self, address: u64) -> u64 {
        address & !(self.page_size - 1)
    }

    /// Classifies a range as registered code (`Some(false)`), a registered dispatch slot
    /// (`Some(true)`), or unmanaged (`None`).
    fn classify(&self, address: u64, len: usize) -> Option<bool> {
        let end = address.checked_add(len as u64)?;
        self.functions.iter().find_map(|entry| {
            if address >= entry.address && end <= entry.address + entry.capacity as u64 {
                return Some(false);
            }
            match entry.dispatch_slot {
                Some(slot) if address >= slot && end <= slot + 8 => Some(true),
                _ => None,
            }
        })
    }

    fn managed(&self, address: u64, len: usize) -> Result<bool> {
        self.classify(address, len).ok_or_else(|| Error::InvalidAddress {
            address,
            reason: format!("{len} bytes are not a registered function or slot"),
        })
    }

    fn set_protection(&self, address: u64, len: usize, protection: MemoryProtection) -> Result<()> {
        let start = self.page_align(address);
        let end = self.page_align(address + len as u64 + self.page_size - 1);
        self.toggles.fetch_add(1, Ordering::Relaxed);

        // SAFETY: the range covers whole pages of a registered function
        unsafe { sys::protect(start, (end - start) as usize, protection) }.map_err(|error| {
            Error::WritePermissionDenied {
                address,
                reason: error.to_string(),
            }
        })
    }
}

impl Platform for NativePlatform {
    fn host_id(&self) -> HostId {
        self.id
    }

    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn force_compile(&self, method: &MethodDescriptor) -> Result<EntryPoint> {
        self.functions
            .get(&method.token)
            .map(|entry| *entry)
            .ok_or(Error::NotYetCompiled(method.token))
    }

    fn read_code(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.managed(address, len)?;

        let mut bytes = vec![0u8; len];
        // SAFETY: registered ranges are readable for the lifetime of the platform
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, bytes.as_mut_ptr(), len);
        }
        Ok(bytes)
    }

    fn check_writable(&self, address: u64, len: usize) -> Result<()> {
        if self.managed(address, len)? {
            return Ok(());
        }

        let _guard = lock!(self.protect)?;
        self.set_protection(address, len, MemoryProtection::READ_WRITE_EXECUTE)?;
        self.set_protection(address, len, MemoryProtection::READ_EXECUTE)
    }

    fn write_code(&self, plan: &WritePlan) -> Result<()> {
        let is_slot = self.managed(plan.address, plan.len())?;
        if let Some(step) = plan.steps.iter().find(|step| !step.is_single_word()) {
            return Err(malformed_error!(
                "store at 0x{:x} spans more than one word",
                step.address
            ));
        }

        let _guard = lock!(self.protect)?;
        if !is_slot {
            self.set_protection(plan.address, plan.len(), MemoryProtection::READ_WRITE_EXECUTE)?;
        }

        for step in &plan.steps {
            log::trace!("store {} byte(s) at 0x{:x}", step.bytes.len(), step.address);
            // SAFETY: the step lies within a registered range and its word is aligned
            unsafe { sys::store_word(step.word(), step.address, &step.bytes) };
        }

        fence(Ordering::SeqCst);

        // The bytes are in place; a page left writable is reported but does not undo them
        if !is_slot {
            if let Err(error) =
                self.set_protection(plan.address, plan.len(), MemoryProtection::READ_EXECUTE)
            {
                log::warn!(
                    "code at 0x{:x} was written but stays writable: {error}",
                    plan.address
                );
            }
        }
        Ok(())
    }
}

impl fmt::Debug for NativePlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativePlatform")
            .field("id", &self.id)
            .field("arch", &self.arch)
            .field("page_size", &self.page_size)
            .field("function_count", &self.functions.len())
            .finish()
    }
}

#[cfg(all(unix, target_arch = "x86_64"))]
mod sys {
    use std::{
        io,
        sync::atomic::{AtomicU64, Ordering},
    };

    use crate::platform::MemoryProtection;

    pub const SUPPORTED: bool = true;

    pub fn page_size() -> u64 {
        // SAFETY: sysconf is safe to call with _SC_PAGESIZE
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        u64::try_from(size).unwrap_or(0x1000)
    }

    pub unsafe fn protect(address: u64, len: usize, protection: MemoryProtection) -> io::Result<()> {
        let mut flags = libc::PROT_NONE;
        if protection.contains(MemoryProtection::READ) {
            flags |= libc::PROT_READ;
        }
        if protection.contains(MemoryProtection::WRITE) {
            flags |= libc::PROT_WRITE;
        }
        if protection.contains(MemoryProtection::EXECUTE) {
            flags |= libc::PROT_EXEC;
        }

        if libc::mprotect(address as *mut libc::c_void, len, flags) == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Merges `bytes` into the aligned word at `word` with one atomic update.
    pub unsafe fn store_word(word: u64, address: u64, bytes: &[u8]) {
        let shift = (address - word) as usize;
        let mut mask = 0u64;
        let mut value = 0u64;
        for (index, byte) in bytes.iter().enumerate() {
            let bit = (shift + index) * 8;
            mask |= 0xFF << bit;
            value |= u64::from(*byte) << bit;
        }

        let cell = &*(word as *const AtomicU64);
        let mut current = cell.load(Ordering::SeqCst);
        loop {
            let merged = (current & !mask) | value;
            match cell.compare_exchange_weak(current, merged, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(not(all(unix, target_arch = "x86_64")))]
mod sys {
    use std::io;

    use crate::platform::MemoryProtection;

    pub const SUPPORTED: bool = false;

    pub fn page_size() -> u64 {
        0x1000
    }

    pub unsafe fn protect(_address: u64, _len: usize, _protection: MemoryProtection) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    pub unsafe fn store_word(_word: u64, _address: u64, _bytes: &[u8]) {}
}
