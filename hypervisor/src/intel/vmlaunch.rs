//! The assembly edges of the world switch: the first VMLAUNCH into the
//! captured guest context, and the VM-exit trampoline that materializes a
//! [`GuestRegisters`] frame on the VMM stack, calls the dispatcher, and
//! resumes or devirtualizes based on its verdict.

use crate::intel::vmexit::ExitType;

extern "C" {
    /// Loads the guest GPR/XMM state from `registers` and executes VMLAUNCH.
    /// Does not return on success; on failure returns the RFLAGS produced by
    /// VMLAUNCH so the caller can read the VM-instruction error field.
    ///
    /// Follows the Microsoft x64 calling convention.
    pub fn launch_guest(registers: &super::capture::GuestRegisters) -> u64;

    /// The VM-exit entry point written into VMCS host RIP. Never called from
    /// Rust.
    pub fn vmexit_stub();
}

/// Numeric value the trampoline compares the dispatcher's return against to
/// decide between VMRESUME and the devirtualization tail.
const EXIT_HYPERVISOR: u8 = ExitType::ExitHypervisor as u8;

core::arch::global_asm!(
    r#"
.global launch_guest
launch_guest:
    // Preserve the callee-saved registers of the caller so that a VMLAUNCH
    // failure can return like a normal function.
    push    rbx
    push    rbp
    push    rsi
    push    rdi
    push    r12
    push    r13
    push    r14
    push    r15

    movaps  xmm0,  [rcx + 0x090]
    movaps  xmm1,  [rcx + 0x0A0]
    movaps  xmm2,  [rcx + 0x0B0]
    movaps  xmm3,  [rcx + 0x0C0]
    movaps  xmm4,  [rcx + 0x0D0]
    movaps  xmm5,  [rcx + 0x0E0]
    movaps  xmm6,  [rcx + 0x0F0]
    movaps  xmm7,  [rcx + 0x100]
    movaps  xmm8,  [rcx + 0x110]
    movaps  xmm9,  [rcx + 0x120]
    movaps  xmm10, [rcx + 0x130]
    movaps  xmm11, [rcx + 0x140]
    movaps  xmm12, [rcx + 0x150]
    movaps  xmm13, [rcx + 0x160]
    movaps  xmm14, [rcx + 0x170]
    movaps  xmm15, [rcx + 0x180]

    mov     rax, [rcx + 0x00]
    mov     rbx, [rcx + 0x08]
    mov     rdx, [rcx + 0x18]
    mov     rdi, [rcx + 0x20]
    mov     rsi, [rcx + 0x28]
    mov     rbp, [rcx + 0x30]
    mov     r8,  [rcx + 0x38]
    mov     r9,  [rcx + 0x40]
    mov     r10, [rcx + 0x48]
    mov     r11, [rcx + 0x50]
    mov     r12, [rcx + 0x58]
    mov     r13, [rcx + 0x60]
    mov     r14, [rcx + 0x68]
    mov     r15, [rcx + 0x70]
    mov     rcx, [rcx + 0x10]

    vmlaunch

    // Only reached when VMLAUNCH fails; hand RFLAGS back to the caller.
    pushfq
    pop     rax
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rdi
    pop     rsi
    pop     rbp
    pop     rbx
    ret

.global vmexit_stub
vmexit_stub:
    // RSP is the VMCS host RSP: the slot at the top of this core's VMM stack
    // that holds the owning Vcpu pointer. Build a GuestRegisters frame below.
    sub     rsp, 0x190
    mov     [rsp + 0x00], rax
    mov     [rsp + 0x08], rbx
    mov     [rsp + 0x10], rcx
    mov     [rsp + 0x18], rdx
    mov     [rsp + 0x20], rdi
    mov     [rsp + 0x28], rsi
    mov     [rsp + 0x30], rbp
    mov     [rsp + 0x38], r8
    mov     [rsp + 0x40], r9
    mov     [rsp + 0x48], r10
    mov     [rsp + 0x50], r11
    mov     [rsp + 0x58], r12
    mov     [rsp + 0x60], r13
    mov     [rsp + 0x68], r14
    mov     [rsp + 0x70], r15
    movaps  [rsp + 0x090], xmm0
    movaps  [rsp + 0x0A0], xmm1
    movaps  [rsp + 0x0B0], xmm2
    movaps  [rsp + 0x0C0], xmm3
    movaps  [rsp + 0x0D0], xmm4
    movaps  [rsp + 0x0E0], xmm5
    movaps  [rsp + 0x0F0], xmm6
    movaps  [rsp + 0x100], xmm7
    movaps  [rsp + 0x110], xmm8
    movaps  [rsp + 0x120], xmm9
    movaps  [rsp + 0x130], xmm10
    movaps  [rsp + 0x140], xmm11
    movaps  [rsp + 0x150], xmm12
    movaps  [rsp + 0x160], xmm13
    movaps  [rsp + 0x170], xmm14
    movaps  [rsp + 0x180], xmm15

    mov     rcx, rsp                // &mut GuestRegisters
    mov     rdx, [rsp + 0x190]      // *mut Vcpu from the stack-top slot
    sub     rsp, 0x20               // shadow space, keeps RSP 16-aligned
    call    {dispatch}
    add     rsp, 0x20

    cmp     al, {exit_hypervisor}
    je      2f

    movaps  xmm0,  [rsp + 0x090]
    movaps  xmm1,  [rsp + 0x0A0]
    movaps  xmm2,  [rsp + 0x0B0]
    movaps  xmm3,  [rsp + 0x0C0]
    movaps  xmm4,  [rsp + 0x0D0]
    movaps  xmm5,  [rsp + 0x0E0]
    movaps  xmm6,  [rsp + 0x0F0]
    movaps  xmm7,  [rsp + 0x100]
    movaps  xmm8,  [rsp + 0x110]
    movaps  xmm9,  [rsp + 0x120]
    movaps  xmm10, [rsp + 0x130]
    movaps  xmm11, [rsp + 0x140]
    movaps  xmm12, [rsp + 0x150]
    movaps  xmm13, [rsp + 0x160]
    movaps  xmm14, [rsp + 0x170]
    movaps  xmm15, [rsp + 0x180]
    mov     rax, [rsp + 0x00]
    mov     rbx, [rsp + 0x08]
    mov     rcx, [rsp + 0x10]
    mov     rdx, [rsp + 0x18]
    mov     rdi, [rsp + 0x20]
    mov     rsi, [rsp + 0x28]
    mov     rbp, [rsp + 0x30]
    mov     r8,  [rsp + 0x38]
    mov     r9,  [rsp + 0x40]
    mov     r10, [rsp + 0x48]
    mov     r11, [rsp + 0x50]
    mov     r12, [rsp + 0x58]
    mov     r13, [rsp + 0x60]
    mov     r14, [rsp + 0x68]
    mov     r15, [rsp + 0x70]
    add     rsp, 0x190
    vmresume

    // VMRESUME must not fall through; if it does the VMCS is beyond repair.
    call    {resume_failed}
    ud2

2:
    // Devirtualized. The dispatcher has already executed VMXOFF and left the
    // resume RIP in the frame's RBX slot and the resume RSP in the RCX slot.
    movaps  xmm0,  [rsp + 0x090]
    movaps  xmm1,  [rsp + 0x0A0]
    movaps  xmm2,  [rsp + 0x0B0]
    movaps  xmm3,  [rsp + 0x0C0]
    movaps  xmm4,  [rsp + 0x0D0]
    movaps  xmm5,  [rsp + 0x0E0]
    movaps  xmm6,  [rsp + 0x0F0]
    movaps  xmm7,  [rsp + 0x100]
    movaps  xmm8,  [rsp + 0x110]
    movaps  xmm9,  [rsp + 0x120]
    movaps  xmm10, [rsp + 0x130]
    movaps  xmm11, [rsp + 0x140]
    movaps  xmm12, [rsp + 0x150]
    movaps  xmm13, [rsp + 0x160]
    movaps  xmm14, [rsp + 0x170]
    movaps  xmm15, [rsp + 0x180]
    mov     rax, [rsp + 0x00]
    mov     rdx, [rsp + 0x18]
    mov     rdi, [rsp + 0x20]
    mov     rsi, [rsp + 0x28]
    mov     rbp, [rsp + 0x30]
    mov     r8,  [rsp + 0x38]
    mov     r9,  [rsp + 0x40]
    mov     r10, [rsp + 0x48]
    mov     r11, [rsp + 0x50]
    mov     r12, [rsp + 0x58]
    mov     r13, [rsp + 0x60]
    mov     r14, [rsp + 0x68]
    mov     r15, [rsp + 0x70]
    mov     rbx, [rsp + 0x08]
    mov     rcx, [rsp + 0x10]
    mov     rsp, rcx
    jmp     rbx
"#,
    dispatch = sym crate::intel::vmexit::vmexit_handler,
    resume_failed = sym vmresume_failed,
    exit_hypervisor = const EXIT_HYPERVISOR,
);

/// Called from the trampoline when VMRESUME falls through. Unrecoverable.
#[no_mangle]
extern "C" fn vmresume_failed() -> ! {
    let error = crate::intel::support::vm_instruction_error();
    log::error!("VMRESUME failed with VM-instruction error {}", error);
    panic!("VMRESUME failed with VM-instruction error {error}");
}
