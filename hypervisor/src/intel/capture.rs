//! Capture of the full general-purpose and XMM register state of the CPU
//! about to be virtualized. The captured frame is both the guest's initial
//! register file and the layout of the context frame the VM-exit trampoline
//! builds on the VMM stack.

use static_assertions::const_assert_eq;

/// Guest general-purpose registers, RIP/RSP/RFLAGS, and XMM0-15.
///
/// The field order is hardware-facing: the assembly in `vmlaunch.rs` stores
/// and loads registers by fixed offsets into this frame.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub xmm: [u128; 16],
}

impl GuestRegisters {
    /// Reads a general-purpose register by its hardware encoding, as used in
    /// exit qualifications.
    pub fn gpr(&self, index: u64) -> u64 {
        match index & 0xF {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    /// Writes a general-purpose register by its hardware encoding. A write
    /// to RSP goes through the VMCS on the caller's side.
    pub fn set_gpr(&mut self, index: u64, value: u64) {
        match index & 0xF {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            4 => self.rsp = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            _ => self.r15 = value,
        }
    }
}

const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 0x190);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, rbp), 0x30);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, r15), 0x70);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, rip), 0x78);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, rsp), 0x80);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, rflags), 0x88);
const_assert_eq!(core::mem::offset_of!(GuestRegisters, xmm), 0x90);

extern "C" {
    /// Captures the live register state into `registers`, with RIP set to the
    /// caller's return address and RSP to the caller's stack pointer after
    /// return. Returns `false` on the capturing pass; once the core is
    /// virtualized, guest execution resumes at the same return address with
    /// RAX preloaded from the frame, making the call appear to return `true`.
    ///
    /// Follows the Microsoft x64 calling convention.
    pub fn capture_registers(registers: &mut GuestRegisters) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_encoding_matches_the_hardware_numbering() {
        let mut registers = GuestRegisters::default();
        registers.rax = 0xA;
        registers.rcx = 0xC;
        registers.rsp = 0x5;
        registers.r15 = 0xF;

        assert_eq!(registers.gpr(0), 0xA);
        assert_eq!(registers.gpr(1), 0xC);
        assert_eq!(registers.gpr(4), 0x5);
        assert_eq!(registers.gpr(15), 0xF);

        registers.set_gpr(8, 0x88);
        assert_eq!(registers.r8, 0x88);
    }
}

core::arch::global_asm!(
    r#"
.global capture_registers
capture_registers:
    mov     [rcx + 0x00], rax
    mov     [rcx + 0x08], rbx
    mov     [rcx + 0x10], rcx
    mov     [rcx + 0x18], rdx
    mov     [rcx + 0x20], rdi
    mov     [rcx + 0x28], rsi
    mov     [rcx + 0x30], rbp
    mov     [rcx + 0x38], r8
    mov     [rcx + 0x40], r9
    mov     [rcx + 0x48], r10
    mov     [rcx + 0x50], r11
    mov     [rcx + 0x58], r12
    mov     [rcx + 0x60], r13
    mov     [rcx + 0x68], r14
    mov     [rcx + 0x70], r15

    mov     rax, [rsp]
    mov     [rcx + 0x78], rax       // return address becomes the guest RIP
    lea     rax, [rsp + 8]
    mov     [rcx + 0x80], rax       // post-return stack pointer becomes the guest RSP
    pushfq
    pop     rax
    mov     [rcx + 0x88], rax

    movaps  [rcx + 0x090], xmm0
    movaps  [rcx + 0x0A0], xmm1
    movaps  [rcx + 0x0B0], xmm2
    movaps  [rcx + 0x0C0], xmm3
    movaps  [rcx + 0x0D0], xmm4
    movaps  [rcx + 0x0E0], xmm5
    movaps  [rcx + 0x0F0], xmm6
    movaps  [rcx + 0x100], xmm7
    movaps  [rcx + 0x110], xmm8
    movaps  [rcx + 0x120], xmm9
    movaps  [rcx + 0x130], xmm10
    movaps  [rcx + 0x140], xmm11
    movaps  [rcx + 0x150], xmm12
    movaps  [rcx + 0x160], xmm13
    movaps  [rcx + 0x170], xmm14
    movaps  [rcx + 0x180], xmm15

    xor     rax, rax
    ret
"#
);
