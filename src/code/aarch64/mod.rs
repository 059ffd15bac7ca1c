//! AArch64 encodings
//!
//! Instructions are fixed size words, so no general decoder is needed: only the handful of encodings that carry a
//! PC-relative immediate are recognized, everything else is copied verbatim.

use super::{fits_signed, Architecture, Decoded, Relative, RelativeKind, RelocateError};

/// Size of every instruction
const INSN_SIZE: usize = 4;
/// Scratch register used by trampolines (`IP0`)
const X16: u32 = 16;
/// `B` opcode
const OPCODE_B: u32 = 0x1400_0000;
/// `MOVZ Xd, #imm16, LSL #hw`
const OPCODE_MOVZ: u32 = 0xd280_0000;
/// `MOVK Xd, #imm16, LSL #hw`
const OPCODE_MOVK: u32 = 0xf280_0000;
/// `BR Xn`
const OPCODE_BR: u32 = 0xd61f_0000;
/// `BLR Xn`
const OPCODE_BLR: u32 = 0xd63f_0000;

#[allow(clippy::missing_docs_in_private_items)]
/// Encodings with a PC-relative immediate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    B,
    Bl,
    BCond,
    Cbz,
    Cbnz,
    Tbz,
    Tbnz,
    Adr,
    Adrp,
    /// `LDR`/`LDRSW` (literal), general purpose or SIMD
    LdrLiteral,
}

impl Class {
    /// Classifies one instruction word
    fn of(insn: u32) -> Option<Self> {
        match insn & 0xfc00_0000 {
            0x1400_0000 => return Some(Self::B),
            0x9400_0000 => return Some(Self::Bl),
            _ => {}
        }
        if insn & 0xff00_0010 == 0x5400_0000 {
            return Some(Self::BCond);
        }
        match insn & 0x7f00_0000 {
            0x3400_0000 => return Some(Self::Cbz),
            0x3500_0000 => return Some(Self::Cbnz),
            0x3600_0000 => return Some(Self::Tbz),
            0x3700_0000 => return Some(Self::Tbnz),
            _ => {}
        }
        match insn & 0x9f00_0000 {
            0x1000_0000 => return Some(Self::Adr),
            0x9000_0000 => return Some(Self::Adrp),
            _ => {}
        }
        match insn & 0xff00_0000 {
            0x5800_0000 | 0x1800_0000 | 0x5c00_0000 | 0x1c00_0000 | 0x9c00_0000 | 0x9800_0000 => {
                Some(Self::LdrLiteral)
            }
            _ => None,
        }
    }

    /// How the immediate is used
    fn kind(&self) -> RelativeKind {
        match self {
            Self::B => RelativeKind::Jump,
            Self::Bl => RelativeKind::Call,
            Self::BCond | Self::Cbz | Self::Cbnz | Self::Tbz | Self::Tbnz => RelativeKind::Branch,
            Self::Adr | Self::LdrLiteral => RelativeKind::Data,
            Self::Adrp => RelativeKind::Page,
        }
    }

    /// Width of the immediate in bits
    fn width(&self) -> u32 {
        match self {
            Self::B | Self::Bl => 26,
            Self::BCond | Self::Cbz | Self::Cbnz | Self::LdrLiteral => 19,
            Self::Tbz | Self::Tbnz => 14,
            Self::Adr | Self::Adrp => 21,
        }
    }

    /// Absolute address the immediate of `insn` resolves to when executed at `pc`
    fn target(&self, insn: u32, pc: u64) -> u64 {
        let offset = match self {
            Self::B | Self::Bl => sign_extend(insn & 0x03ff_ffff, 26) << 2,
            Self::BCond | Self::Cbz | Self::Cbnz | Self::LdrLiteral => sign_extend((insn >> 5) & 0x7ffff, 19) << 2,
            Self::Tbz | Self::Tbnz => sign_extend((insn >> 5) & 0x3fff, 14) << 2,
            Self::Adr => adr_immediate(insn),
            Self::Adrp => return page(pc).wrapping_add((adr_immediate(insn) << 12) as u64),
        };
        pc.wrapping_add(offset as u64)
    }

    /// Replaces the immediate of `insn`, `value` must already fit
    fn encode(&self, insn: u32, value: i64) -> u32 {
        let value = value as u32;
        match self {
            Self::B | Self::Bl => (insn & 0xfc00_0000) | (value & 0x03ff_ffff),
            Self::BCond | Self::Cbz | Self::Cbnz | Self::LdrLiteral => {
                (insn & !(0x7ffff << 5)) | ((value & 0x7ffff) << 5)
            }
            Self::Tbz | Self::Tbnz => (insn & !(0x3fff << 5)) | ((value & 0x3fff) << 5),
            Self::Adr | Self::Adrp => {
                let immlo = value & 0x3;
                let immhi = (value >> 2) & 0x7ffff;
                (insn & !((0x3 << 29) | (0x7ffff << 5))) | (immlo << 29) | (immhi << 5)
            }
        }
    }

    /// Assembler name of the instruction, including the condition of `b.cond`
    fn mnemonic(&self, insn: u32) -> &'static str {
        match self {
            Self::B => "b",
            Self::Bl => "bl",
            Self::BCond => CONDITIONS[(insn & 0xf) as usize],
            Self::Cbz => "cbz",
            Self::Cbnz => "cbnz",
            Self::Tbz => "tbz",
            Self::Tbnz => "tbnz",
            Self::Adr => "adr",
            Self::Adrp => "adrp",
            Self::LdrLiteral => "ldr",
        }
    }
}

/// `B.cond` mnemonics indexed by condition code
const CONDITIONS: [&str; 16] = [
    "b.eq", "b.ne", "b.cs", "b.cc", "b.mi", "b.pl", "b.vs", "b.vc", "b.hi", "b.ls", "b.ge", "b.lt", "b.gt", "b.le",
    "b.al", "b.nv",
];

/// Sign extends the low `bits` of `value`
fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

/// Split `immhi:immlo` immediate of `ADR` and `ADRP`
fn adr_immediate(insn: u32) -> i64 {
    let immlo = (insn >> 29) & 0x3;
    let immhi = (insn >> 5) & 0x7ffff;
    sign_extend((immhi << 2) | immlo, 21)
}

/// 4 KiB page containing `address`
fn page(address: u64) -> u64 {
    address & !0xfff
}

/// Reads the little endian instruction at the start of `code`
fn word(code: &[u8]) -> u32 {
    u32::from_le_bytes([code[0], code[1], code[2], code[3]])
}

/// AArch64 in A64 state
pub struct AArch64;

impl Architecture for AArch64 {
    const JUMP_SIZE: usize = INSN_SIZE;
    const TRAMPOLINE_SIZE: usize = 24;
    const ALIGNMENT: usize = 16;
    /// `B` reaches ±128 MiB
    const MAX_DISTANCE: usize = 1 << 27;
    /// `UDF #0`
    const TRAP: &'static [u8] = &[0, 0, 0, 0];

    fn decode(code: &[u8], pc: u64) -> Result<Vec<Decoded>, RelocateError> {
        if code.len() % INSN_SIZE != 0 {
            return Err(RelocateError::Decode {
                offset: code.len() - code.len() % INSN_SIZE,
            });
        }

        Ok(code
            .chunks_exact(INSN_SIZE)
            .enumerate()
            .map(|(i, bytes)| {
                let offset = i * INSN_SIZE;
                let insn = word(bytes);
                let relative = Class::of(insn).map(|class| Relative {
                    kind: class.kind(),
                    operand_offset: 0,
                    width: class.width(),
                    target: class.target(insn, pc + offset as u64),
                });
                Decoded {
                    offset,
                    len: INSN_SIZE,
                    relative,
                }
            })
            .collect())
    }

    fn retarget(code: &mut [u8], instruction: &Decoded, relative: &Relative, pc: u64) -> Result<(), RelocateError> {
        let insn = word(code);
        let class = Class::of(insn).ok_or(RelocateError::Decode {
            offset: instruction.offset,
        })?;

        let value = match class {
            Class::Adrp => (page(relative.target) as i64).wrapping_sub(page(pc) as i64) >> 12,
            Class::Adr => relative.target.wrapping_sub(pc) as i64,
            _ => (relative.target.wrapping_sub(pc) as i64) >> 2,
        };
        if !fits_signed(value, class.width()) {
            return Err(RelocateError::OutOfRange {
                kind: relative.kind,
                offset: instruction.offset,
                pc,
                target: relative.target,
            });
        }

        code[..INSN_SIZE].copy_from_slice(&class.encode(insn, value).to_le_bytes());
        Ok(())
    }

    fn jump(from: u64, to: u64) -> Result<Vec<u8>, RelocateError> {
        let offset = to.wrapping_sub(from) as i64;
        if offset & 0x3 != 0 || !fits_signed(offset >> 2, 26) {
            return Err(RelocateError::OutOfRange {
                kind: RelativeKind::Jump,
                offset: 0,
                pc: from,
                target: to,
            });
        }
        Ok(Class::B.encode(OPCODE_B, offset >> 2).to_le_bytes().to_vec())
    }

    /// ```text
    /// movz x16, #<target[0..16]>
    /// movk x16, #<target[16..32]>, lsl #16
    /// movk x16, #<target[32..48]>, lsl #32
    /// movk x16, #<target[48..64]>, lsl #48
    /// blr  x16            ; br x16 without `resume`
    /// b    <resume>
    /// ```
    ///
    /// `x16` is the intra-procedure-call scratch register, linkers clobber it in veneers.
    fn trampoline(target: u64, pc: u64, resume: Option<u64>) -> Result<Vec<u8>, RelocateError> {
        let mut code = Vec::with_capacity(Self::TRAMPOLINE_SIZE);

        for hw in 0..4u32 {
            let imm16 = ((target >> (hw * 16)) & 0xffff) as u32;
            let opcode = if hw == 0 { OPCODE_MOVZ } else { OPCODE_MOVK };
            code.extend_from_slice(&(opcode | (hw << 21) | (imm16 << 5) | X16).to_le_bytes());
        }

        match resume {
            Some(resume) => {
                code.extend_from_slice(&(OPCODE_BLR | (X16 << 5)).to_le_bytes());
                let jump = Self::jump(pc + code.len() as u64, resume)
                    .map_err(|_| RelocateError::Trampoline { target })?;
                code.extend_from_slice(&jump);
            }
            None => code.extend_from_slice(&(OPCODE_BR | (X16 << 5)).to_le_bytes()),
        }

        code.resize(Self::TRAMPOLINE_SIZE, 0);
        Ok(code)
    }

    fn format(code: &[u8], instruction: &Decoded, _pc: u64) -> String {
        let insn = word(&code[instruction.offset..]);
        match (Class::of(insn), instruction.relative) {
            (Some(class), Some(relative)) => format!("{} {:#x}", class.mnemonic(insn), relative.target),
            _ => format!(".inst {insn:#010x}"),
        }
    }
}
