//! Applying and reverting redirections.
//!
//! [`PatchEngine`] owns the mechanics of one redirection: it materializes both methods,
//! picks between an entry jump and a slot swap, snapshots the bytes it is about to
//! overwrite, writes through a tear-free [`WritePlan`] and verifies the result.
//!
//! The engine refuses to patch a source it has already patched. The registry enforces
//! the same rule across engines; the engine's own check keeps a bare engine safe too.
//! The check follows the installed flag of the engine's last record for the source, so
//! a revert performed through another engine frees the source here as well.
//!
//! Once the first byte has been written, any later failure restores the snapshot before
//! the error is returned. A failed apply never leaves a patch behind without a record.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};

use crate::{
    config::RedirectConfig,
    metadata::token::Token,
    patch::{record::plan_for, PatchKind, PatchRecord, WritePlan},
    platform::Platform,
    resolver::ResolvedMethod,
    Error, Result,
};

/// Installs and removes redirections through a [`Platform`].
pub struct PatchEngine {
    platform: Arc<dyn Platform>,
    slot_fallback: bool,
    verify_writes: bool,
    /// Installed flags of the records this engine produced, per source
    live: DashMap<Token, Arc<AtomicBool>>,
    patches_applied: AtomicU64,
    patches_reverted: AtomicU64,
    bytes_written: AtomicU64,
}

impl PatchEngine {
    /// Creates an engine with default settings.
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self::with_config(platform, &RedirectConfig::default())
    }

    /// Creates an engine using the patch settings of `config`.
    #[must_use]
    pub fn with_config(platform: Arc<dyn Platform>, config: &RedirectConfig) -> Self {
        PatchEngine {
            platform,
            slot_fallback: config.slot_fallback,
            verify_writes: config.verify_writes,
            live: DashMap::new(),
            patches_applied: AtomicU64::new(0),
            patches_reverted: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    /// The platform patches are written through.
    #[must_use]
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Returns `true` if this engine holds an installed patch of `source`.
    #[must_use]
    pub fn is_patched(&self, source: Token) -> bool {
        self.live
            .get(&source)
            .is_some_and(|installed| installed.load(Ordering::Acquire))
    }

    /// Redirects `source` to `target`.
    ///
    /// Both methods are compiled first. The jump is written over the source entry when it
    /// fits and can be written tear-free; otherwise the source's dispatch slot is
    /// repointed if slot fallback is enabled. Write permission is checked before anything
    /// is written.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyPatched`] if this engine already redirected `source`
    /// - [`Error::NotYetCompiled`] if either method cannot be materialized
    /// - [`Error::InsufficientEntrySpace`] if the jump does not fit and no slot swap is
    ///   possible
    /// - [`Error::UnalignedEntry`] if the jump fits but would straddle words at an entry
    ///   that cannot be parked, and no slot swap is possible
    /// - [`Error::WritePermissionDenied`] if the range cannot be written; nothing is
    ///   written in that case
    /// - [`Error::VerificationFailed`] if the bytes did not read back; the original
    ///   content is restored, as it is for any failure after the write
    pub fn apply(&self, source: &ResolvedMethod, target: &ResolvedMethod) -> Result<PatchRecord> {
        let token = source.token();
        let slot = match self.live.entry(token) {
            Entry::Occupied(entry) if entry.get().load(Ordering::Acquire) => {
                return Err(Error::AlreadyPatched(token))
            }
            entry => entry,
        };

        let source_entry = self.platform.force_compile(&source.descriptor)?;
        let target_entry = self.platform.force_compile(&target.descriptor)?;

        let arch = self.platform.architecture();
        let stub = arch.encode_jump(source_entry.address, target_entry.address);

        let fits = stub.len() <= source_entry.capacity;
        let (kind, plan) = if fits
            && WritePlan::is_plannable(arch, source_entry.address, stub.len())
        {
            (
                PatchKind::EntryJump,
                WritePlan::code(arch, source_entry.address, &stub.bytes)?,
            )
        } else {
            match source_entry.dispatch_slot {
                Some(dispatch) if self.slot_fallback => (
                    PatchKind::SlotSwap,
                    WritePlan::data(dispatch, &target_entry.address.to_le_bytes()),
                ),
                _ if !fits => {
                    return Err(Error::InsufficientEntrySpace {
                        method: token,
                        needed: stub.len(),
                        available: source_entry.capacity,
                    })
                }
                _ => {
                    return Err(Error::UnalignedEntry {
                        address: source_entry.address,
                        len: stub.len(),
                    })
                }
            }
        };

        self.platform.check_writable(plan.address, plan.len())?;
        let original = self.platform.read_code(plan.address, plan.len())?;
        self.write(&plan)?;

        if self.verify_writes {
            if let Err(error) = self.verify(plan.address, &plan.bytes) {
                self.restore(kind, plan.address, &original);
                return Err(error);
            }
        }

        let record = PatchRecord::new(
            self.platform.host_id(),
            ResolvedMethod::new(source.descriptor.clone(), Some(source_entry)),
            ResolvedMethod::new(target.descriptor.clone(), Some(target_entry)),
            kind,
            plan.address,
            original,
            plan.bytes.clone(),
        );
        slot.insert(record.installed_flag());
        self.patches_applied.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "redirected {} -> {} ({kind}, {plan})",
            source.descriptor.full_name(),
            target.descriptor.full_name()
        );
        Ok(record)
    }

    /// Restores the bytes `record` overwrote.
    ///
    /// Returns `Ok(false)` without writing anything if the record was already reverted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForeignPatch`] if the record was applied on another platform.
    /// Returns an error if the range cannot be written or does not read back as the
    /// original; the record stays installed in that case.
    pub fn revert(&self, record: &PatchRecord) -> Result<bool> {
        if !record.is_installed() {
            return Ok(false);
        }
        if record.host != self.platform.host_id() {
            return Err(Error::ForeignPatch(record.source.token()));
        }

        let plan = record.plan(self.platform.architecture(), &record.original)?;
        self.platform.check_writable(plan.address, plan.len())?;
        self.write(&plan)?;
        if self.verify_writes {
            self.verify(plan.address, &record.original)?;
        }

        record.mark_reverted();
        self.live.remove_if(&record.source.token(), |_, installed| {
            !installed.load(Ordering::Acquire)
        });
        self.patches_reverted.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "restored {} ({} at 0x{:x})",
            record.source.descriptor.full_name(),
            record.kind,
            record.address
        );
        Ok(true)
    }

    /// Get patch statistics.
    #[must_use]
    pub fn stats(&self) -> PatchStats {
        PatchStats {
            patches_applied: self.patches_applied.load(Ordering::Relaxed),
            patches_reverted: self.patches_reverted.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    fn verify(&self, address: u64, expected: &[u8]) -> Result<()> {
        if self.platform.read_code(address, expected.len())? == expected {
            Ok(())
        } else {
            Err(Error::VerificationFailed { address })
        }
    }

    /// Puts `original` back after a failed apply. The caller reports the apply's own
    /// error, so a failing restore is only logged.
    fn restore(&self, kind: PatchKind, address: u64, original: &[u8]) {
        let restored = plan_for(kind, self.platform.architecture(), address, original)
            .and_then(|plan| self.write(&plan));
        if let Err(error) = restored {
            log::warn!("could not restore 0x{address:x} after a failed patch: {error}");
        }
    }

    fn write(&self, plan: &WritePlan) -> Result<()> {
        self.platform.write_code(plan)?;
        self.bytes_written
            .fetch_add(plan.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl fmt::Debug for PatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchEngine")
            .field("arch", &self.platform.architecture())
            .field("slot_fallback", &self.slot_fallback)
            .field("verify_writes", &self.verify_writes)
            .field("live", &self.live.len())
            .finish()
    }
}

/// Patch statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    /// Total patches applied.
    pub patches_applied: u64,
    /// Total patches reverted.
    pub patches_reverted: u64,
    /// Total bytes written, restores included.
    pub bytes_written: u64,
}
