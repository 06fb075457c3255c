//! Records of installed redirections.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::{
    patch::{Architecture, WritePlan},
    platform::HostId,
    registry::MethodKey,
    resolver::ResolvedMethod,
    Result,
};

/// How a redirection was installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum PatchKind {
    /// The first bytes of the source entry were replaced by a jump.
    EntryJump,
    /// The source's dispatch slot was pointed at the target.
    SlotSwap,
}

/// An installed redirection, with everything needed to undo it.
///
/// Everything but the installed flag is immutable once the record exists. Records are
/// shared between the registry and callers as `Arc<PatchRecord>`; the engine that
/// applied the record shares its installed flag, so a revert through any engine is
/// seen by all of them.
#[derive(Debug)]
pub struct PatchRecord {
    /// The platform whose memory was rewritten
    pub host: HostId,
    /// The method whose entry (or slot) was rewritten
    pub source: ResolvedMethod,
    /// The method control is transferred to
    pub target: ResolvedMethod,
    /// Entry jump or slot swap
    pub kind: PatchKind,
    /// The rewritten address
    pub address: u64,
    /// Byte-exact content of the range before patching
    pub original: Vec<u8>,
    /// Bytes written over the range
    pub patch: Vec<u8>,
    installed: Arc<AtomicBool>,
    sequence: u64,
}

impl PatchRecord {
    pub(crate) fn new(
        host: HostId,
        source: ResolvedMethod,
        target: ResolvedMethod,
        kind: PatchKind,
        address: u64,
        original: Vec<u8>,
        patch: Vec<u8>,
    ) -> Self {
        PatchRecord {
            host,
            source,
            target,
            kind,
            address,
            original,
            patch,
            installed: Arc::new(AtomicBool::new(true)),
            sequence: 0,
        }
    }

    /// Returns `true` until the redirection is reverted.
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Process-wide identity of the rewritten method.
    #[must_use]
    pub fn key(&self) -> MethodKey {
        MethodKey::new(self.host, self.source.token())
    }

    /// Process-wide identity of the method control is transferred to.
    #[must_use]
    pub fn target_key(&self) -> MethodKey {
        MethodKey::new(self.host, self.target.token())
    }

    /// Application order number, assigned when the record is registered.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    pub(crate) fn mark_reverted(&self) {
        self.installed.store(false, Ordering::Release);
    }

    pub(crate) fn installed_flag(&self) -> Arc<AtomicBool> {
        self.installed.clone()
    }

    /// Plan writing `bytes` over the patched range, the way this record's kind requires.
    pub(crate) fn plan(&self, arch: Architecture, bytes: &[u8]) -> Result<WritePlan> {
        plan_for(self.kind, arch, self.address, bytes)
    }
}

pub(crate) fn plan_for(
    kind: PatchKind,
    arch: Architecture,
    address: u64,
    bytes: &[u8],
) -> Result<WritePlan> {
    match kind {
        PatchKind::EntryJump => WritePlan::code(arch, address, bytes),
        PatchKind::SlotSwap => Ok(WritePlan::data(address, bytes)),
    }
}

impl fmt::Display for PatchRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} -> {} ({} at 0x{:x} on {}{})",
            self.sequence,
            self.source,
            self.target,
            self.kind,
            self.address,
            self.host,
            if self.is_installed() { "" } else { ", reverted" }
        )
    }
}
