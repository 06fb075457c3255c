//! Patch engine: jump encoding, write planning, and apply/revert.
//!
//! # Key Components
//!
//! - [`Architecture`] - Encodes and recognizes the engine's jump stubs
//! - [`WritePlan`] - Splits a patch into stores that never tear
//! - [`PatchEngine`] - Applies and reverts single redirections
//! - [`PatchRecord`] - What was written where, and the bytes needed to undo it
//!
//! # Patch Kinds
//!
//! | Kind | Rewritten | When |
//! |------|-----------|------|
//! | [`PatchKind::EntryJump`] | First bytes of the source entry | The jump fits the entry |
//! | [`PatchKind::SlotSwap`] | The source's dispatch slot | The entry is too small and the method has a slot |

mod arch;
mod engine;
mod plan;
mod record;

pub use arch::{
    Architecture, JumpForm, JumpStub, JMP_ABS64_SIZE, JMP_REL32_OPCODE, JMP_REL32_SIZE,
};
pub use engine::{PatchEngine, PatchStats};
pub use plan::{WritePlan, WriteStep, WORD_SIZE};
pub use record::{PatchKind, PatchRecord};
