//! x86-64 encodings

use iced_x86::{Decoder, DecoderOptions, Formatter, NasmFormatter};

use super::{fits_signed, Architecture, Decoded, Relative, RelativeKind, RelocateError};

/// `JMP rel32`
const OPCODE_JMP: u8 = 0xe9;
/// `INT3`
const OPCODE_INT3: u8 = 0xcc;
/// Size of `JMP rel32`
const JMP_SIZE: usize = 5;

/// x86-64 in 64-bit mode
pub struct X64;

impl Architecture for X64 {
    const JUMP_SIZE: usize = JMP_SIZE;
    const TRAMPOLINE_SIZE: usize = 18;
    const ALIGNMENT: usize = 16;
    /// `rel32` reaches ±2 GiB
    const MAX_DISTANCE: usize = 0x8000_0000;
    const TRAP: &'static [u8] = &[OPCODE_INT3];

    fn decode(code: &[u8], pc: u64) -> Result<Vec<Decoded>, RelocateError> {
        let mut decoder = Decoder::with_ip(64, code, pc, DecoderOptions::NONE);
        let mut instructions = Vec::new();

        while decoder.can_decode() {
            let offset = decoder.position();
            let instruction = decoder.decode();
            if instruction.is_invalid() {
                return Err(RelocateError::Decode { offset });
            }
            let len = instruction.len();

            let relative = if instruction.is_ip_rel_memory_operand() {
                let constants = decoder.get_constant_offsets(&instruction);
                if !constants.has_displacement() || constants.displacement_size() != 4 {
                    return Err(RelocateError::Decode { offset });
                }
                Some(Relative {
                    kind: RelativeKind::Data,
                    operand_offset: constants.displacement_offset(),
                    width: 32,
                    target: instruction.ip_rel_memory_address(),
                })
            } else if instruction.is_call_near() {
                Some(branch(RelativeKind::Call, 32, len, instruction.near_branch_target()))
            } else if instruction.is_jmp_near() {
                Some(branch(RelativeKind::Jump, 32, len, instruction.near_branch_target()))
            } else if instruction.is_jmp_short() {
                Some(branch(RelativeKind::Jump, 8, len, instruction.near_branch_target()))
            } else if instruction.is_jcc_near() {
                Some(branch(RelativeKind::Branch, 32, len, instruction.near_branch_target()))
            } else if instruction.is_jcc_short()
                || instruction.is_loop()
                || instruction.is_loopcc()
                || instruction.is_jcx_short()
            {
                Some(branch(RelativeKind::Branch, 8, len, instruction.near_branch_target()))
            } else {
                None
            };

            instructions.push(Decoded { offset, len, relative });
        }

        Ok(instructions)
    }

    fn retarget(code: &mut [u8], instruction: &Decoded, relative: &Relative, pc: u64) -> Result<(), RelocateError> {
        // displacements are relative to the next instruction
        let next = pc.wrapping_add(instruction.len as u64);
        let displacement = relative.target.wrapping_sub(next) as i64;
        if !fits_signed(displacement, relative.width) {
            return Err(RelocateError::OutOfRange {
                kind: relative.kind,
                offset: instruction.offset,
                pc,
                target: relative.target,
            });
        }

        let field = &mut code[relative.operand_offset..];
        match relative.width {
            8 => field[0] = displacement as i8 as u8,
            _ => field[..4].copy_from_slice(&(displacement as i32).to_le_bytes()),
        }
        Ok(())
    }

    fn jump(from: u64, to: u64) -> Result<Vec<u8>, RelocateError> {
        let next = from.wrapping_add(JMP_SIZE as u64);
        let displacement = to.wrapping_sub(next) as i64;
        if !fits_signed(displacement, 32) {
            return Err(RelocateError::OutOfRange {
                kind: RelativeKind::Jump,
                offset: 0,
                pc: from,
                target: to,
            });
        }

        let mut jump = vec![OPCODE_JMP];
        jump.extend_from_slice(&(displacement as i32).to_le_bytes());
        Ok(jump)
    }

    /// ```text
    /// movabs r11, <target>
    /// call   r11           ; jmp r11 without `resume`
    /// jmp    <resume>
    /// ```
    ///
    /// `r11` is clobbered by every call anyway and never carries arguments.
    fn trampoline(target: u64, pc: u64, resume: Option<u64>) -> Result<Vec<u8>, RelocateError> {
        let mut code = Vec::with_capacity(Self::TRAMPOLINE_SIZE);

        // movabs r11, imm64
        code.extend_from_slice(&[0x49, 0xbb]);
        code.extend_from_slice(&target.to_le_bytes());

        match resume {
            Some(resume) => {
                // call r11
                code.extend_from_slice(&[0x41, 0xff, 0xd3]);
                let jump = Self::jump(pc + code.len() as u64, resume)
                    .map_err(|_| RelocateError::Trampoline { target })?;
                code.extend_from_slice(&jump);
            }
            // jmp r11
            None => code.extend_from_slice(&[0x41, 0xff, 0xe3]),
        }

        Self::pad_to(&mut code, Self::TRAMPOLINE_SIZE);
        Ok(code)
    }

    fn format(code: &[u8], instruction: &Decoded, pc: u64) -> String {
        let bytes = &code[instruction.offset..instruction.offset + instruction.len];
        let mut decoder = Decoder::with_ip(64, bytes, pc, DecoderOptions::NONE);
        let decoded = decoder.decode();

        let mut output = String::new();
        NasmFormatter::new().format(&decoded, &mut output);
        output
    }
}

impl X64 {
    /// Pads `code` with `int3` up to `len` bytes
    fn pad_to(code: &mut Vec<u8>, len: usize) {
        code.resize(len.max(code.len()), OPCODE_INT3);
    }
}

/// Describes a branch whose displacement is the last `width` bits of the instruction
fn branch(kind: RelativeKind, width: u32, len: usize, target: u64) -> Relative {
    Relative {
        kind,
        operand_offset: len - width as usize / 8,
        width,
        target,
    }
}
