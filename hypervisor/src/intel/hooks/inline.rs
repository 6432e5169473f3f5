//! Construction of per-hook detour trampolines: a register-saving prologue,
//! a call into the supplied handler, a relocated copy of the displaced
//! original instructions, and an absolute jump back into the original code
//! stream. Instruction lengths come from the `lde` length disassembler.

use {
    crate::error::HypervisorError,
    log::*,
    static_assertions::const_assert,
};

/// A 14-byte absolute jump: `jmp [rip+0]` followed by the 8-byte target.
pub const JMP_ABS_SIZE: usize = 14;

/// Upper bound on the bytes displaced out of the hooked function.
pub const MAX_EXEC_TRAMPOLINE_SIZE: usize = 0x40;

/// Total code the trampoline page may hold.
const TRAMPOLINE_CAPACITY: usize = 0x1000;

const_assert!(MAX_EXEC_TRAMPOLINE_SIZE >= JMP_ABS_SIZE);

/// The executable body of one detour. Page-granular so its physical address
/// can be used directly.
#[repr(C, align(4096))]
pub struct Trampoline {
    pub code: [u8; TRAMPOLINE_CAPACITY],
}

/// The general-register snapshot handed to a detour handler, in the order the
/// trampoline prologue leaves it on the stack.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DetourRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

/// Signature of a detour handler: the register snapshot and the virtual
/// address the hook was installed on. Microsoft x64 calling convention.
pub type DetourHandler = unsafe extern "C" fn(registers: *mut DetourRegisters, original_va: u64);

/// Emits the 14-byte absolute jump at `at`, targeting `target`.
pub fn write_absolute_jump(at: &mut [u8], target: u64) {
    at[0] = 0xFF;
    at[1] = 0x25;
    at[2..6].copy_from_slice(&0u32.to_le_bytes());
    at[6..14].copy_from_slice(&target.to_le_bytes());
}

/// The number of bytes that must be displaced from `code` so the absolute
/// jump fits on an instruction boundary.
pub fn displaced_length(code: &[u8]) -> Result<usize, HypervisorError> {
    let mut length = 0usize;

    while length < JMP_ABS_SIZE {
        let instruction_length = lde::X64.ld(&code[length..]) as usize;
        if instruction_length == 0 {
            return Err(HypervisorError::TrampolineCapacityExceeded);
        }
        length += instruction_length;

        if length > MAX_EXEC_TRAMPOLINE_SIZE {
            return Err(HypervisorError::TrampolineCapacityExceeded);
        }
    }

    Ok(length)
}

/// One-byte opcodes that carry a ModRM byte. Index = opcode, bit set = ModRM.
const ONE_BYTE_MODRM: [u64; 4] = build_one_byte_modrm();

const fn build_one_byte_modrm() -> [u64; 4] {
    let mut table = [0u64; 4];
    let mut opcode = 0usize;
    while opcode < 256 {
        let has = matches!(
            opcode,
            // ALU r/m forms: 00-03, 08-0B, ... 38-3B.
            0x00..=0x3B if opcode & 0x04 == 0
        ) || matches!(opcode, 0x62 | 0x63 | 0x69 | 0x6B)
            || matches!(opcode, 0x80..=0x8F)
            || matches!(opcode, 0xC0 | 0xC1 | 0xC6 | 0xC7)
            || matches!(opcode, 0xD0..=0xD3)
            || matches!(opcode, 0xD8..=0xDF)
            || matches!(opcode, 0xF6 | 0xF7 | 0xFE | 0xFF);
        if has {
            table[opcode / 64] |= 1 << (opcode % 64);
        }
        opcode += 1;
    }
    table
}

fn one_byte_has_modrm(opcode: u8) -> bool {
    ONE_BYTE_MODRM[opcode as usize / 64] & (1 << (opcode as usize % 64)) != 0
}

/// Two-byte (0F xx) opcodes without a ModRM byte; everything else in the 0F
/// map takes one.
fn two_byte_has_modrm(opcode: u8) -> bool {
    !matches!(
        opcode,
        0x05..=0x09 // syscall, clts, sysret, invd, wbinvd
            | 0x0B
            | 0x30..=0x37 // wrmsr, rdtsc, rdmsr, rdpmc, sysenter, sysexit, getsec
            | 0x77 // emms
            | 0x80..=0x8F // jcc rel32
            | 0xA0..=0xA2 // push/pop fs, cpuid
            | 0xA8..=0xAA // push/pop gs, rsm
            | 0xC8..=0xCF // bswap
    )
}

fn is_legacy_prefix(byte: u8) -> bool {
    matches!(byte, 0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x66 | 0x67 | 0xF0 | 0xF2 | 0xF3)
}

/// Rewrites the PC-relative displacement of one instruction copied from
/// `src_va` to `dst_va`, in place. Instructions without PC-relative operands
/// are left untouched.
pub fn relocate_instruction(instruction: &mut [u8], src_va: u64, dst_va: u64) -> Result<(), HypervisorError> {
    let length = instruction.len();
    let delta = src_va.wrapping_sub(dst_va) as i64;

    let rewrite_rel32 = |bytes: &mut [u8], at: usize| -> Result<(), HypervisorError> {
        let old = i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
        let new = (old as i64).checked_add(delta).ok_or(HypervisorError::RipRelocationOutOfRange)?;
        let new = i32::try_from(new).map_err(|_| HypervisorError::RipRelocationOutOfRange)?;
        bytes[at..at + 4].copy_from_slice(&new.to_le_bytes());
        Ok(())
    };

    let mut offset = 0usize;
    while offset < length && is_legacy_prefix(instruction[offset]) {
        offset += 1;
    }
    if offset < length && instruction[offset] & 0xF0 == 0x40 {
        offset += 1; // REX
    }
    if offset >= length {
        return Ok(());
    }

    match instruction[offset] {
        // call/jmp rel32
        0xE8 | 0xE9 => return rewrite_rel32(instruction, offset + 1),
        // Short branches cannot span the distance to the trampoline.
        0x70..=0x7F | 0xEB | 0xE0..=0xE3 => return Err(HypervisorError::RipRelocationOutOfRange),
        // VEX-encoded instructions are copied verbatim; they do not occur in
        // the prologues this engine displaces.
        0xC4 | 0xC5 => {
            trace!("VEX-encoded instruction copied without relocation");
            return Ok(());
        }
        _ => {}
    }

    let (modrm_offset, has_modrm) = if instruction[offset] == 0x0F {
        if offset + 1 >= length {
            return Ok(());
        }
        match instruction[offset + 1] {
            // jcc rel32
            0x80..=0x8F => return rewrite_rel32(instruction, offset + 2),
            // Three-byte maps: ModRM follows the third opcode byte.
            0x38 | 0x3A => (offset + 3, true),
            opcode => (offset + 2, two_byte_has_modrm(opcode)),
        }
    } else {
        (offset + 1, one_byte_has_modrm(instruction[offset]))
    };

    if !has_modrm || modrm_offset >= length {
        return Ok(());
    }

    let modrm = instruction[modrm_offset];
    let is_rip_relative = modrm & 0xC0 == 0x00 && modrm & 0x07 == 0x05;
    if is_rip_relative {
        // disp32 immediately follows ModRM; RIP-relative encoding never
        // takes a SIB byte.
        return rewrite_rel32(instruction, modrm_offset + 1);
    }

    Ok(())
}

/// Layout of a built trampoline, reported back to the hook bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct TrampolineLayout {
    /// Bytes displaced from the original function.
    pub displaced_length: usize,
    /// Where the guest resumes after the trampoline.
    pub return_va: u64,
}

/// Builds the trampoline body in `trampoline` at `trampoline_va`:
///
/// 1. push all general-purpose registers,
/// 2. `handler(&registers, original_va)`,
/// 3. pop the registers,
/// 4. the relocated displaced instructions from `original_code`,
/// 5. an absolute jump to `original_va + displaced_length`.
pub fn build_trampoline(
    trampoline: &mut Trampoline,
    trampoline_va: u64,
    original_code: &[u8],
    original_va: u64,
    handler: DetourHandler,
) -> Result<TrampolineLayout, HypervisorError> {
    let displaced = displaced_length(original_code)?;

    let code = &mut trampoline.code;
    let mut at = 0usize;

    let mut emit = |bytes: &[u8], at: &mut usize| {
        code[*at..*at + bytes.len()].copy_from_slice(bytes);
        *at += bytes.len();
    };

    // push rax, rcx, rdx, rbx, rbp, rsi, rdi, r8..r15
    emit(&[0x50, 0x51, 0x52, 0x53, 0x55, 0x56, 0x57], &mut at);
    emit(&[0x41, 0x50, 0x41, 0x51, 0x41, 0x52, 0x41, 0x53], &mut at);
    emit(&[0x41, 0x54, 0x41, 0x55, 0x41, 0x56, 0x41, 0x57], &mut at);

    // mov rcx, rsp
    emit(&[0x48, 0x89, 0xE1], &mut at);
    // mov rdx, original_va
    emit(&[0x48, 0xBA], &mut at);
    emit(&original_va.to_le_bytes(), &mut at);
    // mov rax, handler
    emit(&[0x48, 0xB8], &mut at);
    emit(&(handler as usize as u64).to_le_bytes(), &mut at);
    // sub rsp, 0x20; call rax; add rsp, 0x20
    emit(&[0x48, 0x83, 0xEC, 0x20, 0xFF, 0xD0, 0x48, 0x83, 0xC4, 0x20], &mut at);

    // pop r15..r8, rdi, rsi, rbp, rbx, rdx, rcx, rax
    emit(&[0x41, 0x5F, 0x41, 0x5E, 0x41, 0x5D, 0x41, 0x5C], &mut at);
    emit(&[0x41, 0x5B, 0x41, 0x5A, 0x41, 0x59, 0x41, 0x58], &mut at);
    emit(&[0x5F, 0x5E, 0x5D, 0x5B, 0x5A, 0x59, 0x58], &mut at);

    // The displaced instructions, relocated one by one.
    let displaced_base = at;
    let mut copied = 0usize;
    while copied < displaced {
        let instruction_length = lde::X64.ld(&original_code[copied..]) as usize;
        let destination = &mut code[displaced_base + copied..displaced_base + copied + instruction_length];
        destination.copy_from_slice(&original_code[copied..copied + instruction_length]);
        relocate_instruction(
            destination,
            original_va + copied as u64,
            trampoline_va + (displaced_base + copied) as u64,
        )?;
        copied += instruction_length;
    }
    at += displaced;

    let return_va = original_va + displaced as u64;
    write_absolute_jump(&mut code[at..at + JMP_ABS_SIZE], return_va);
    at += JMP_ABS_SIZE;

    debug_assert!(at <= TRAMPOLINE_CAPACITY);
    trace!("Trampoline built: {} bytes, {} displaced, resumes at {:#x}", at, displaced, return_va);

    Ok(TrampolineLayout {
        displaced_length: displaced,
        return_va,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn nop_handler(_registers: *mut DetourRegisters, _original_va: u64) {}

    fn boxed_trampoline() -> alloc::boxed::Box<Trampoline> {
        unsafe { alloc::boxed::Box::new_zeroed().assume_init() }
    }

    // A typical kernel function prologue:
    //   mov [rsp+8], rbx / push rdi / sub rsp, 0x20 / mov rbx, rcx / mov rdi, rdx
    const PROLOGUE: [u8; 18] = [
        0x48, 0x89, 0x5C, 0x24, 0x08, // mov [rsp+8], rbx
        0x57, // push rdi
        0x48, 0x83, 0xEC, 0x20, // sub rsp, 0x20
        0x48, 0x8B, 0xD9, // mov rbx, rcx
        0x48, 0x8B, 0xFA, // mov rdi, rdx
        0xCC, 0xCC,
    ];

    #[test]
    fn displaced_length_lands_on_an_instruction_boundary() {
        // 5 + 1 + 4 + 3 = 13 < 14, so the next instruction (3 bytes) joins.
        assert_eq!(displaced_length(&PROLOGUE).unwrap(), 16);
    }

    #[test]
    fn displaced_length_rejects_truncated_code() {
        // A lone REX prefix cannot complete an instruction.
        let truncated = [0x48u8];
        assert!(displaced_length(&truncated).is_err());
    }

    #[test]
    fn absolute_jump_encodes_target() {
        let mut buffer = [0u8; JMP_ABS_SIZE];
        write_absolute_jump(&mut buffer, 0xFFFF_8000_1234_5678);

        assert_eq!(&buffer[..6], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(u64::from_le_bytes(buffer[6..].try_into().unwrap()), 0xFFFF_8000_1234_5678);
    }

    #[test]
    fn rel32_call_is_rebased() {
        // call +0x100 at src 0x1000 targets 0x1105; moved to 0x2000 the
        // displacement must shrink by 0x1000.
        let mut call = [0xE8, 0x00, 0x01, 0x00, 0x00];
        relocate_instruction(&mut call, 0x1000, 0x2000).unwrap();

        let rel = i32::from_le_bytes(call[1..5].try_into().unwrap());
        assert_eq!(0x2000 + 5 + rel as i64, 0x1105);
    }

    #[test]
    fn rip_relative_mov_is_rebased() {
        // mov rax, [rip + 0x10] at src 0x1000: target 0x1017.
        let mut mov = [0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00];
        relocate_instruction(&mut mov, 0x1000, 0x3000).unwrap();

        let disp = i32::from_le_bytes(mov[3..7].try_into().unwrap());
        assert_eq!(0x3000 + 7 + disp as i64, 0x1017);
    }

    #[test]
    fn non_relative_instructions_are_untouched() {
        let original = [0x48, 0x89, 0x5C, 0x24, 0x08];
        let mut copy = original;
        relocate_instruction(&mut copy, 0x1000, 0x9000_0000).unwrap();
        assert_eq!(copy, original);
    }

    #[test]
    fn short_branches_cannot_be_displaced() {
        let mut jz = [0x74, 0x05];
        assert!(relocate_instruction(&mut jz, 0x1000, 0x2000).is_err());
    }

    #[test]
    fn relocation_out_of_range_is_rejected() {
        let mut call = [0xE8, 0x00, 0x00, 0x00, 0x00];
        assert!(relocate_instruction(&mut call, 0, u64::MAX / 2).is_err());
    }

    #[test]
    fn trampoline_ends_with_a_jump_past_the_displaced_bytes() {
        let mut trampoline = boxed_trampoline();
        let layout = build_trampoline(&mut trampoline, 0x4000_0000, &PROLOGUE, 0xFFFF_F800_0000_0000, nop_handler).unwrap();

        assert_eq!(layout.displaced_length, 16);
        assert_eq!(layout.return_va, 0xFFFF_F800_0000_0010);

        // The tail is the absolute jump to return_va.
        let code = &trampoline.code;
        let tail = code.iter().rposition(|&b| b != 0).unwrap() + 1;
        let jump = &code[tail - JMP_ABS_SIZE..tail];
        assert_eq!(&jump[..2], &[0xFF, 0x25]);
        assert_eq!(u64::from_le_bytes(jump[6..].try_into().unwrap()), layout.return_va);
    }

    #[test]
    fn trampoline_prologue_saves_and_restores_registers() {
        let mut trampoline = boxed_trampoline();
        build_trampoline(&mut trampoline, 0x4000_0000, &PROLOGUE, 0x1000, nop_handler).unwrap();

        // push rax first; pop rax last before the displaced code.
        assert_eq!(trampoline.code[0], 0x50);
        let call = [0x48, 0x83, 0xEC, 0x20, 0xFF, 0xD0];
        assert!(trampoline.code.windows(call.len()).any(|w| w == call));
    }
}
