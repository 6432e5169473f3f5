//! Thin wrappers over the VMX instruction set and the control/model-specific
//! registers the rest of the crate touches. Everything here is a direct
//! instruction wrapper; policy lives in the callers.

use {
    core::arch::asm,
    x86::{
        bits64::vmx,
        controlregs,
        dtables::{self, DescriptorTablePointer},
        msr,
        vmx::vmcs,
    },
};

/// Executes VMXON against a 4-KByte naturally aligned physical region.
pub fn vmxon(vmxon_pa: u64) {
    unsafe { vmx::vmxon(vmxon_pa).unwrap() };
}

/// Executes VMXOFF, leaving VMX operation on the current core.
pub fn vmxoff() {
    unsafe { vmx::vmxoff().unwrap() };
}

/// Clears the VMCS at the given physical address and makes it inactive.
pub fn vmclear(vmcs_pa: u64) {
    unsafe { vmx::vmclear(vmcs_pa).unwrap() };
}

/// Makes the VMCS at the given physical address current and active.
pub fn vmptrld(vmcs_pa: u64) {
    unsafe { vmx::vmptrld(vmcs_pa).unwrap() };
}

/// Reads a field from the current VMCS. Unsupported fields read as zero.
pub fn vmread(field: u32) -> u64 {
    unsafe { vmx::vmread(field) }.unwrap_or(0)
}

/// Writes a field of the current VMCS.
pub fn vmwrite<T: Into<u64>>(field: u32, value: T)
where
    u64: From<T>,
{
    unsafe { vmx::vmwrite(field, u64::from(value)) }.unwrap();
}

/// Reads the VM-instruction error field (encoding 0x4400) of the current VMCS.
pub fn vm_instruction_error() -> u64 {
    vmread(vmcs::ro::VM_INSTRUCTION_ERROR)
}

/// Probes whether the caller is in VMX root operation.
///
/// VMREAD only completes on a current VMCS in VMX root, and the link pointer
/// of every VMCS this crate launches is initialized to all-ones. A non-error
/// read of a non-zero value therefore identifies root mode. Callers in
/// non-root must not use this probe; they are identified by the per-core
/// launch state instead.
pub fn is_vmx_root() -> bool {
    matches!(unsafe { vmx::vmread(vmcs::guest::LINK_PTR_FULL) }, Ok(value) if value != 0)
}

/// Issues a VMCALL with the crate's hypercall register convention:
/// RCX = hypercall number, RDX/R8/R9 = arguments, RAX = returned status.
///
/// The devirtualization hypercall resumes the caller with RBX and RCX
/// carrying the saved instruction and stack pointers, so RBX is manually
/// saved around the call (it cannot be declared as an operand) and RCX is
/// an input the compiler already treats as dead.
///
/// # Safety
///
/// Must only be executed on a virtualized core; on bare silicon VMCALL
/// raises #UD.
pub unsafe fn vmcall(number: u64, arg1: u64, arg2: u64, arg3: u64) -> u64 {
    let status: u64;
    unsafe {
        asm!(
            "mov {saved_rbx}, rbx",
            "vmcall",
            "mov rbx, {saved_rbx}",
            saved_rbx = out(reg) _,
            inlateout("rcx") number => _,
            in("rdx") arg1,
            in("r8") arg2,
            in("r9") arg3,
            lateout("rax") status,
            options(nostack),
        );
    }
    status
}

/// Issues VMFUNC with the given function number and, for EPTP switching
/// (function 0), the EPTP-list index in ECX.
pub unsafe fn vmfunc(function: u32, index: u32) {
    unsafe {
        asm!(
            "vmfunc",
            in("eax") function,
            in("ecx") index,
            options(nostack),
        );
    }
}

pub fn rdmsr(msr: u32) -> u64 {
    unsafe { msr::rdmsr(msr) }
}

pub fn wrmsr(msr: u32, value: u64) {
    unsafe { msr::wrmsr(msr, value) };
}

pub fn cr0() -> u64 {
    unsafe { controlregs::cr0() }.bits() as u64
}

pub fn cr0_write(value: u64) {
    unsafe { controlregs::cr0_write(controlregs::Cr0::from_bits_truncate(value as usize)) };
}

pub fn cr3() -> u64 {
    unsafe { controlregs::cr3() }
}

pub fn cr3_write(value: u64) {
    unsafe { controlregs::cr3_write(value) };
}

pub fn cr4() -> u64 {
    unsafe { controlregs::cr4() }.bits() as u64
}

pub fn cr4_write(value: u64) {
    unsafe { controlregs::cr4_write(controlregs::Cr4::from_bits_truncate(value as usize)) };
}

pub fn cr2() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, cr2", out(reg) value, options(nostack, nomem)) };
    value
}

pub fn cr2_write(value: u64) {
    unsafe { asm!("mov cr2, {}", in(reg) value, options(nostack, nomem)) };
}

pub fn dr7() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, dr7", out(reg) value, options(nostack, nomem)) };
    value
}

/// Captures the current GDTR.
pub fn sgdt() -> DescriptorTablePointer<u64> {
    let mut gdtr = DescriptorTablePointer::<u64>::default();
    unsafe { dtables::sgdt(&mut gdtr) };
    gdtr
}

/// Captures the current IDTR.
pub fn sidt() -> DescriptorTablePointer<u64> {
    let mut idtr = DescriptorTablePointer::<u64>::default();
    unsafe { dtables::sidt(&mut idtr) };
    idtr
}

/// Reloads the GDTR, used when restoring the pre-virtualization descriptor
/// tables at VMXOFF.
pub unsafe fn lgdt(gdtr: &DescriptorTablePointer<u64>) {
    unsafe { dtables::lgdt(gdtr) };
}

/// Reloads the IDTR, used when restoring the pre-virtualization descriptor
/// tables at VMXOFF.
pub unsafe fn lidt(idtr: &DescriptorTablePointer<u64>) {
    unsafe { dtables::lidt(idtr) };
}

/// Writes back and invalidates the caches, the emulation of a guest INVD.
pub fn wbinvd() {
    unsafe { asm!("wbinvd", options(nostack, nomem)) };
}

/// Invalidates the linear-address TLB entry for `va` on the current core.
pub fn invlpg(va: u64) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(va));
}

pub fn rdtsc() -> u64 {
    unsafe { x86::time::rdtsc() }
}
