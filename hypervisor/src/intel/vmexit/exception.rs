//! Exception and NMI exits: breakpoints surface hidden hooks to the
//! debugger, invalid opcodes back the SYSCALL-via-#UD interception mode, and
//! page faults are reported and re-injected untouched.

use {
    crate::{
        callbacks,
        intel::{
            capture::GuestRegisters,
            events::EventInjection,
            support::{cr2_write, rdmsr, vmread, vmwrite},
            vcpu::{SyscallHookType, Vcpu},
            vmerror::{ExceptionVector, VmExitInterruptionInformation},
            vmexit::ExitType,
        },
        windows::memory::read_guest_memory,
    },
    log::*,
    num_traits::FromPrimitive,
    x86::{msr, vmx::vmcs::{guest, ro}},
};

pub fn handle_exception(vcpu: &mut Vcpu, registers: &mut GuestRegisters) -> ExitType {
    let information = VmExitInterruptionInformation(vmread(ro::VMEXIT_INTERRUPTION_INFO) as u32);
    let error_code = vmread(ro::VMEXIT_INTERRUPTION_ERR_CODE) as u32;

    if !information.valid() {
        warn!("Exception exit without valid interruption information");
        return ExitType::Continue;
    }

    match ExceptionVector::from_u32(information.vector()) {
        Some(ExceptionVector::Breakpoint) => handle_breakpoint(vcpu, registers),
        Some(ExceptionVector::InvalidOpcode) => handle_invalid_opcode(vcpu, registers),
        Some(ExceptionVector::PageFault) => handle_page_fault(vcpu, error_code),
        Some(ExceptionVector::Nmi) => {
            // Keep the NMI pending for the guest; delivered on next entry.
            vcpu.queue_event(crate::intel::events::PendingEvent {
                vector: 2,
                interruption_type: crate::intel::vmerror::InterruptionType::NonMaskableInterrupt,
                error_code: None,
            });
            ExitType::Continue
        }
        _ => {
            warn!("Unhandled exception vector {} re-injected", information.vector());
            EventInjection::vmentry_inject_pending(&crate::intel::events::PendingEvent {
                vector: information.vector() as u8,
                interruption_type: crate::intel::vmerror::InterruptionType::HardwareException,
                error_code: information.error_code_valid().then_some(error_code),
            });
            ExitType::Continue
        }
    }
}

/// #BP: the execution side of a breakpoint-style hidden hook, or a guest
/// breakpoint that is none of our business.
fn handle_breakpoint(vcpu: &mut Vcpu, registers: &mut GuestRegisters) -> ExitType {
    let consumed = callbacks::with_callbacks(|callbacks| {
        callbacks.breakpoint.map(|handler| handler(vcpu.index, registers)).unwrap_or(false)
    });

    if consumed {
        // The upper layer moved RIP or fixed the site up itself.
        vmwrite(guest::RIP, registers.rip);
        vmwrite(guest::RSP, registers.rsp);
        ExitType::Continue
    } else {
        EventInjection::vmentry_inject_bp();
        ExitType::Continue
    }
}

/// #UD: when the SYSCALL hook mode is active, EFER.SCE is clear and every
/// SYSCALL/SYSRET in the guest arrives here to be emulated in software.
fn handle_invalid_opcode(vcpu: &mut Vcpu, registers: &mut GuestRegisters) -> ExitType {
    let Some(mode) = vcpu.syscall_hook else {
        EventInjection::vmentry_inject_ud();
        return ExitType::Continue;
    };

    let guest_cr3 = vmread(guest::CR3);
    let mut opcode = [0u8; 3];

    // Both modes read through the fault-free accessor; HandleAllUd also
    // treats an unreadable RIP as a plain #UD instead of bailing out.
    if read_guest_memory(registers.rip, guest_cr3, &mut opcode).is_err() {
        if mode == SyscallHookType::SafeAccessMemory {
            trace!("#UD at unreadable RIP {:#x}", registers.rip);
        }
        EventInjection::vmentry_inject_ud();
        return ExitType::Continue;
    }

    if opcode[0] == 0x0F && opcode[1] == 0x05 {
        emulate_syscall(registers);
        ExitType::Continue
    } else if opcode[0] == 0x48 && opcode[1] == 0x0F && opcode[2] == 0x07 {
        emulate_sysret(registers);
        ExitType::Continue
    } else {
        EventInjection::vmentry_inject_ud();
        ExitType::Continue
    }
}

/// Architectural SYSCALL. Intel manual, "SYSCALL - Fast System Call".
fn emulate_syscall(registers: &mut GuestRegisters) {
    let star = rdmsr(msr::IA32_STAR);
    let lstar = rdmsr(msr::IA32_LSTAR);
    let fmask = rdmsr(msr::IA32_FMASK);

    registers.rcx = registers.rip + 2;
    registers.r11 = registers.rflags;
    registers.rip = lstar;
    registers.rflags &= !(fmask | 0x10000); // also clears RF

    let kernel_cs = ((star >> 32) & 0xFFFC) as u16;

    vmwrite(guest::RIP, registers.rip);
    vmwrite(guest::RFLAGS, registers.rflags);
    vmwrite(guest::CS_SELECTOR, kernel_cs);
    vmwrite(guest::CS_BASE, 0u64);
    vmwrite(guest::CS_LIMIT, u32::MAX);
    vmwrite(guest::CS_ACCESS_RIGHTS, 0xA09Bu32); // 64-bit code, DPL0, present
    vmwrite(guest::SS_SELECTOR, kernel_cs + 8);
    vmwrite(guest::SS_BASE, 0u64);
    vmwrite(guest::SS_LIMIT, u32::MAX);
    vmwrite(guest::SS_ACCESS_RIGHTS, 0xC093u32); // data, DPL0, present
}

/// Architectural 64-bit SYSRET. Intel manual, "SYSRET - Return From Fast
/// System Call".
fn emulate_sysret(registers: &mut GuestRegisters) {
    let star = rdmsr(msr::IA32_STAR);

    registers.rip = registers.rcx;
    registers.rflags = (registers.r11 & 0x3C7FD7) | 2;

    let user_cs = (((star >> 48) + 16) | 3) as u16;

    vmwrite(guest::RIP, registers.rip);
    vmwrite(guest::RFLAGS, registers.rflags);
    vmwrite(guest::CS_SELECTOR, user_cs);
    vmwrite(guest::CS_BASE, 0u64);
    vmwrite(guest::CS_LIMIT, u32::MAX);
    vmwrite(guest::CS_ACCESS_RIGHTS, 0xA0FBu32); // 64-bit code, DPL3, present
    vmwrite(guest::SS_SELECTOR, (((star >> 48) + 8) | 3) as u16);
    vmwrite(guest::SS_BASE, 0u64);
    vmwrite(guest::SS_LIMIT, u32::MAX);
    vmwrite(guest::SS_ACCESS_RIGHTS, 0xC0F3u32); // data, DPL3, present
}

/// #PF: optionally reported to the user-mode debugger, then re-injected with
/// the original error code and faulting address.
fn handle_page_fault(vcpu: &mut Vcpu, error_code: u32) -> ExitType {
    let faulting_va = vmread(ro::EXIT_QUALIFICATION);

    let consumed = callbacks::with_callbacks(|callbacks| {
        callbacks.page_fault.map(|handler| handler(vcpu.index, faulting_va, error_code)).unwrap_or(false)
    });

    if !consumed {
        cr2_write(faulting_va);
        EventInjection::vmentry_inject_pf(error_code);
    }

    ExitType::Continue
}
