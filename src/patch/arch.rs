//! Jump encoding per target architecture.
//!
//! The engine only ever emits unconditional transfers of control, in two forms:
//!
//! | Architecture | Near form | Absolute form |
//! |--------------|-----------|---------------|
//! | x86-64 | `jmp rel32` (5 bytes) | `jmp [rip+0]` + 8-byte address (14 bytes) |
//! | AArch64 | `b imm26` (4 bytes) | `ldr x16, #8; br x16` + 8-byte address (16 bytes) |
//!
//! The near form is used whenever the displacement fits. Besides encoding, this module
//! can recognize its own stubs again ([`Architecture::decode_jump`]), which is what the
//! emulated executor uses to follow an installed redirection, and provides the spin
//! instruction used to park an entry point during multi-word writes.

use std::fmt;

/// Opcode for near jump (jmp rel32).
pub const JMP_REL32_OPCODE: u8 = 0xE9;

/// Size of a near jump instruction (jmp rel32) on x86-64.
pub const JMP_REL32_SIZE: usize = 5;

/// `jmp qword ptr [rip+0]`, followed by the 8-byte absolute target.
pub const JMP_ABS64_PREFIX: [u8; 6] = [0xFF, 0x25, 0x00, 0x00, 0x00, 0x00];

/// Size of the absolute jump sequence on x86-64.
pub const JMP_ABS64_SIZE: usize = 14;

/// `jmp $` - a two byte jump to itself.
pub const X86_SPIN: [u8; 2] = [0xEB, 0xFE];

/// `b imm26` opcode bits.
pub const A64_B_OPCODE: u32 = 0x1400_0000;

/// `ldr x16, #8`
pub const A64_LDR_X16_LIT8: u32 = 0x5800_0050;

/// `br x16`
pub const A64_BR_X16: u32 = 0xD61F_0200;

/// Size of the absolute branch sequence on AArch64.
pub const A64_ABS64_SIZE: usize = 16;

/// Reach of `b imm26` in either direction.
const A64_B_RANGE: i64 = 128 * 1024 * 1024;

/// Instruction set of the code being patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// x86-64 / AMD64
    X86_64,
    /// ARMv8 64-bit
    AArch64,
}

/// Form of an encoded jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum JumpForm {
    /// PC-relative jump with limited reach
    Near,
    /// Jump through an embedded 64-bit address
    Absolute,
}

/// An encoded jump ready to be written at `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpStub {
    /// Address the stub was encoded for
    pub from: u64,
    /// Address control is transferred to
    pub to: u64,
    /// Near or absolute
    pub form: JumpForm,
    /// Encoded instruction bytes
    pub bytes: Vec<u8>,
}

impl JumpStub {
    /// Length of the stub in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the stub has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Architecture {
    /// Architecture of the running process, if supported.
    #[must_use]
    pub fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Architecture::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Architecture::AArch64)
        } else {
            None
        }
    }

    /// Required alignment of instructions.
    #[must_use]
    pub fn instruction_alignment(self) -> u64 {
        match self {
            Architecture::X86_64 => 1,
            Architecture::AArch64 => 4,
        }
    }

    /// Length of the longest stub this architecture may emit.
    #[must_use]
    pub fn max_jump_len(self) -> usize {
        match self {
            Architecture::X86_64 => JMP_ABS64_SIZE,
            Architecture::AArch64 => A64_ABS64_SIZE,
        }
    }

    /// A jump-to-self instruction, used to park an entry point while it is rewritten.
    #[must_use]
    pub fn spin(self) -> &'static [u8] {
        match self {
            Architecture::X86_64 => &X86_SPIN,
            // b .
            Architecture::AArch64 => &[0x00, 0x00, 0x00, 0x14],
        }
    }

    /// A short function prologue; used by the emulated platform to fill fresh code.
    #[must_use]
    pub fn prologue(self) -> &'static [u8] {
        match self {
            // push rbp; mov rbp, rsp
            Architecture::X86_64 => &[0x55, 0x48, 0x89, 0xE5],
            // stp x29, x30, [sp, #-16]!
            Architecture::AArch64 => &[0xFD, 0x7B, 0xBF, 0xA9],
        }
    }

    /// Byte used to pad code after the prologue.
    #[must_use]
    pub fn padding(self) -> &'static [u8] {
        match self {
            // int3
            Architecture::X86_64 => &[0xCC],
            // brk #0
            Architecture::AArch64 => &[0x00, 0x00, 0x20, 0xD4],
        }
    }

    /// Encodes an unconditional jump placed at `from` that transfers control to `to`.
    ///
    /// Uses the near form when the displacement fits, the absolute form otherwise.
    #[must_use]
    pub fn encode_jump(self, from: u64, to: u64) -> JumpStub {
        match self.encode_near(from, to) {
            Some(bytes) => JumpStub {
                from,
                to,
                form: JumpForm::Near,
                bytes,
            },
            None => JumpStub {
                from,
                to,
                form: JumpForm::Absolute,
                bytes: self.encode_absolute(to),
            },
        }
    }

    /// Encodes the near form, or `None` if `to` is out of reach.
    #[must_use]
    pub fn encode_near(self, from: u64, to: u64) -> Option<Vec<u8>> {
        match self {
            Architecture::X86_64 => {
                let next_ip = i128::from(from) + JMP_REL32_SIZE as i128;
                let offset = i128::from(to) - next_ip;
                let offset = i32::try_from(offset).ok()?;

                let mut bytes = Vec::with_capacity(JMP_REL32_SIZE);
                bytes.push(JMP_REL32_OPCODE);
                bytes.extend_from_slice(&offset.to_le_bytes());
                Some(bytes)
            }
            Architecture::AArch64 => {
                let offset = i128::from(to) - i128::from(from);
                if offset % 4 != 0 {
                    return None;
                }
                let offset = i64::try_from(offset).ok()?;
                if !(-A64_B_RANGE..A64_B_RANGE).contains(&offset) {
                    return None;
                }

                let imm26 = ((offset >> 2) as u32) & 0x03FF_FFFF;
                Some((A64_B_OPCODE | imm26).to_le_bytes().to_vec())
            }
        }
    }

    /// Encodes the absolute form, which reaches any address.
    #[must_use]
    pub fn encode_absolute(self, to: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.max_jump_len());
        match self {
            Architecture::X86_64 => {
                bytes.extend_from_slice(&JMP_ABS64_PREFIX);
            }
            Architecture::AArch64 => {
                bytes.extend_from_slice(&A64_LDR_X16_LIT8.to_le_bytes());
                bytes.extend_from_slice(&A64_BR_X16.to_le_bytes());
            }
        }
        bytes.extend_from_slice(&to.to_le_bytes());
        bytes
    }

    /// Recognizes a jump stub produced by [`encode_jump`](Self::encode_jump) at `at`,
    /// returning its destination.
    ///
    /// `bytes` are the bytes starting at `at`; they may be longer than the stub. This is
    /// not a disassembler: anything other than the engine's own stubs yields `None`.
    #[must_use]
    pub fn decode_jump(self, at: u64, bytes: &[u8]) -> Option<u64> {
        match self {
            Architecture::X86_64 => {
                if bytes.len() >= JMP_ABS64_SIZE && bytes[..6] == JMP_ABS64_PREFIX {
                    return Some(read_u64(&bytes[6..14]));
                }
                if bytes.len() >= JMP_REL32_SIZE && bytes[0] == JMP_REL32_OPCODE {
                    let offset = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
                    let next_ip = at.wrapping_add(JMP_REL32_SIZE as u64);
                    return Some(next_ip.wrapping_add_signed(i64::from(offset)));
                }
                None
            }
            Architecture::AArch64 => {
                if bytes.len() < 4 {
                    return None;
                }
                let first = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if first == A64_LDR_X16_LIT8 && bytes.len() >= A64_ABS64_SIZE {
                    let second = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                    if second == A64_BR_X16 {
                        return Some(read_u64(&bytes[8..16]));
                    }
                    return None;
                }
                if first & 0xFC00_0000 == A64_B_OPCODE {
                    // Sign-extend the 26-bit word offset
                    let imm26 = (first & 0x03FF_FFFF) as i32;
                    let offset = i64::from((imm26 << 6) >> 6) << 2;
                    return Some(at.wrapping_add_signed(offset));
                }
                None
            }
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::AArch64 => write!(f, "aarch64"),
        }
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(raw)
}
