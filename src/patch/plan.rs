//! Tear-free write planning.
//!
//! Other threads may be executing the code being rewritten. A single store that stays
//! within one naturally aligned 8-byte word is observed either completely or not at all,
//! so every [`WriteStep`] produced here is confined to one such word. Platforms must
//! perform each step as one store.
//!
//! A patch that spans several words is written in three phases:
//!
//! 1. **Park**: the first bytes of the range are replaced by a jump-to-self, so a thread
//!    entering the code spins instead of running half-written instructions
//! 2. **Tail**: everything after the spin instruction is written, word by word
//! 3. **Release**: the spin is replaced by the real leading bytes
//!
//! A multi-word patch whose spin instruction would itself straddle a word boundary
//! cannot be parked, and no store order makes it safe: a thread may enter after the
//! first half of the head is written and decode an instruction that never existed.
//! [`WritePlan::code`] refuses such ranges with [`Error::UnalignedEntry`].

use std::fmt;

use crate::{patch::arch::Architecture, Error, Result};

/// Width of the atomically writable unit.
pub const WORD_SIZE: u64 = 8;

/// A store confined to one aligned 8-byte word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteStep {
    /// First byte written
    pub address: u64,
    /// Bytes stored
    pub bytes: Vec<u8>,
}

impl WriteStep {
    /// Start of the aligned word containing this step.
    #[must_use]
    pub fn word(&self) -> u64 {
        self.address & !(WORD_SIZE - 1)
    }

    /// Returns `true` if the step lies within a single aligned word.
    #[must_use]
    pub fn is_single_word(&self) -> bool {
        let end = self.address + self.bytes.len() as u64;
        !self.bytes.is_empty() && end <= self.word() + WORD_SIZE
    }
}

/// Ordered stores that together write `bytes` at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    /// Start of the written range
    pub address: u64,
    /// Final content of the range once all steps ran
    pub bytes: Vec<u8>,
    /// The stores, in the order they must be performed
    pub steps: Vec<WriteStep>,
    /// Whether the range is parked on a spin instruction while written
    pub parked: bool,
}

impl WritePlan {
    /// Plans writing `bytes` over executable code at `address`.
    ///
    /// The result is either a single store or a parked plan, so a thread entering at
    /// `address` at any point sees the old code, the spin, or the new code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnalignedEntry`] if `bytes` span several words and the spin
    /// instruction does not fit in the word containing `address`.
    pub fn code(arch: Architecture, address: u64, bytes: &[u8]) -> Result<Self> {
        if fits_one_word(address, bytes.len()) {
            return Ok(Self::single(address, bytes));
        }

        let spin = arch.spin();
        let head_len = spin.len().min(bytes.len());
        if !fits_one_word(address, head_len) {
            return Err(Error::UnalignedEntry {
                address,
                len: bytes.len(),
            });
        }

        let mut steps = vec![WriteStep {
            address,
            bytes: spin[..head_len].to_vec(),
        }];
        steps.extend(split_words(address + head_len as u64, &bytes[head_len..]));
        steps.push(WriteStep {
            address,
            bytes: bytes[..head_len].to_vec(),
        });

        Ok(WritePlan {
            address,
            bytes: bytes.to_vec(),
            steps,
            parked: true,
        })
    }

    /// Returns `true` if `bytes` at `address` can be planned as code.
    #[must_use]
    pub fn is_plannable(arch: Architecture, address: u64, len: usize) -> bool {
        fits_one_word(address, len) || fits_one_word(address, arch.spin().len().min(len))
    }

    /// Plans writing `bytes` over data, such as a dispatch slot.
    ///
    /// Data is never executed, so no parking is needed; a naturally aligned pointer is
    /// one step.
    #[must_use]
    pub fn data(address: u64, bytes: &[u8]) -> Self {
        WritePlan {
            address,
            bytes: bytes.to_vec(),
            steps: split_words(address, bytes),
            parked: false,
        }
    }

    fn single(address: u64, bytes: &[u8]) -> Self {
        WritePlan {
            address,
            bytes: bytes.to_vec(),
            steps: vec![WriteStep {
                address,
                bytes: bytes.to_vec(),
            }],
            parked: false,
        }
    }

    /// Number of bytes covered by the plan.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` for a plan that writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Returns `true` if the whole plan is one store.
    #[must_use]
    pub fn is_atomic(&self) -> bool {
        self.steps.len() == 1
    }

    /// Address one past the written range.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.address + self.bytes.len() as u64
    }
}

impl fmt::Display for WritePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes at 0x{:x} in {} step(s){}",
            self.bytes.len(),
            self.address,
            self.steps.len(),
            if self.parked { ", parked" } else { "" }
        )
    }
}

fn fits_one_word(address: u64, len: usize) -> bool {
    len > 0 && (address % WORD_SIZE) + len as u64 <= WORD_SIZE
}

/// Splits a range into word-confined steps, in ascending address order.
fn split_words(address: u64, bytes: &[u8]) -> Vec<WriteStep> {
    let mut steps = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let at = address + offset as u64;
        let room = (WORD_SIZE - at % WORD_SIZE) as usize;
        let take = room.min(bytes.len() - offset);
        steps.push(WriteStep {
            address: at,
            bytes: bytes[offset..offset + take].to_vec(),
        });
        offset += take;
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::arch::X86_SPIN;

    /// Applies a plan to a buffer based at `base`, returning the snapshot after each step.
    fn replay(plan: &WritePlan, base: u64, memory: &mut [u8]) -> Vec<Vec<u8>> {
        let mut snapshots = Vec::new();
        for step in &plan.steps {
            let start = (step.address - base) as usize;
            memory[start..start + step.bytes.len()].copy_from_slice(&step.bytes);
            snapshots.push(memory.to_vec());
        }
        snapshots
    }

    #[test]
    fn test_small_aligned_patch_is_atomic() -> Result<()> {
        let plan = WritePlan::code(Architecture::X86_64, 0x1000, &[0xE9, 1, 2, 3, 4])?;
        assert!(plan.is_atomic());
        assert!(!plan.parked);
        assert_eq!(plan.steps[0].address, 0x1000);
        Ok(())
    }

    #[test]
    fn test_every_step_is_single_word() {
        for address in 0x1000..0x1008u64 {
            if let Ok(plan) = WritePlan::code(Architecture::X86_64, address, &[0xAB; 14]) {
                assert!(plan.steps.iter().all(WriteStep::is_single_word), "{plan}");
            }
        }
    }

    #[test]
    fn test_multi_word_patch_parks_then_releases() -> Result<()> {
        let base = 0x1000;
        let mut memory = vec![0x90u8; 32];
        let patch: Vec<u8> = (1..=14).collect();
        let plan = WritePlan::code(Architecture::X86_64, base + 3, &patch)?;

        assert!(plan.parked);
        assert_eq!(plan.steps.first().map(|s| s.bytes.clone()), Some(X86_SPIN.to_vec()));

        let snapshots = replay(&plan, base, &mut memory);

        // While intermediate steps run the entry starts with the spin
        for snapshot in &snapshots[..snapshots.len() - 1] {
            assert_eq!(&snapshot[3..5], &[0xEB, 0xFE]);
        }

        // Final state holds exactly the patch
        assert_eq!(&memory[3..17], patch.as_slice());
        assert_eq!(memory[2], 0x90);
        assert_eq!(memory[17], 0x90);
        Ok(())
    }

    #[test]
    fn test_unparkable_multi_word_patch_is_refused() {
        // A spin at offset 7 would straddle a word boundary
        assert!(matches!(
            WritePlan::code(Architecture::X86_64, 0x1007, &[0xE9, 1, 2, 3, 4]),
            Err(Error::UnalignedEntry { address: 0x1007, len: 5 })
        ));
        assert!(!WritePlan::is_plannable(Architecture::X86_64, 0x1007, 5));

        // A single byte still fits the word
        assert!(WritePlan::code(Architecture::X86_64, 0x1007, &[0xC3]).is_ok());
        assert!(WritePlan::is_plannable(Architecture::X86_64, 0x1007, 1));
    }

    #[test]
    fn test_entry_never_decodes_a_mix_at_any_alignment() {
        let base = 0x1000u64;
        for stub_len in [5usize, 14] {
            let patch: Vec<u8> = (0..stub_len as u8).map(|b| 0xA0 | b).collect();
            for offset in 0..8u64 {
                let address = base + offset;
                let Ok(plan) = WritePlan::code(Architecture::X86_64, address, &patch) else {
                    assert!(!WritePlan::is_plannable(Architecture::X86_64, address, stub_len));
                    continue;
                };

                let mut memory = vec![0x90u8; 32];
                let original = memory.clone();
                let range = offset as usize..offset as usize + stub_len;
                for snapshot in replay(&plan, base, &mut memory) {
                    let entry = &snapshot[range.clone()];
                    assert!(
                        entry == &original[range.clone()]
                            || entry.starts_with(&X86_SPIN)
                            || entry == patch.as_slice(),
                        "{plan} exposes {entry:02x?}"
                    );
                }
                assert_eq!(&memory[range], patch.as_slice());
            }
        }
    }

    #[test]
    fn test_data_plan_aligned_pointer() {
        let plan = WritePlan::data(0x2008, &0xDEAD_BEEFu64.to_le_bytes());
        assert!(plan.is_atomic());

        let misaligned = WritePlan::data(0x2004, &0xDEAD_BEEFu64.to_le_bytes());
        assert_eq!(misaligned.steps.len(), 2);
    }

    #[test]
    fn test_a64_absolute_patch() -> Result<()> {
        let plan = WritePlan::code(Architecture::AArch64, 0x4000, &[0x11; 16])?;
        assert!(plan.parked);
        assert_eq!(plan.steps[0].bytes, vec![0x00, 0x00, 0x00, 0x14]);
        assert_eq!(plan.end(), 0x4010);
        Ok(())
    }
}
