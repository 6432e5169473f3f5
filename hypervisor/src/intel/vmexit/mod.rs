//! The central VM-exit dispatcher. The assembly trampoline lands here with
//! the guest register frame and the owning Vcpu; the dispatcher decodes the
//! basic exit reason, routes to the family handler, advances RIP for
//! instruction-boundary exits, and decides between VMRESUME and teardown.

pub mod cpuid;
pub mod cr;
pub mod dr;
pub mod ept;
pub mod exception;
pub mod io;
pub mod msr;
pub mod mtf;
pub mod rdtsc;
pub mod vmcall;
pub mod xsetbv;

use {
    crate::intel::{
        capture::GuestRegisters,
        events::EventInjection,
        shared,
        support::{vmread, vmwrite, wbinvd},
        invvpid::invvpid_individual_address,
        vcpu::Vcpu,
        vmcs::VPID_TAG,
        vmerror::VmxBasicExitReason,
    },
    log::*,
    x86::vmx::vmcs::{guest, ro},
};

/// What the dispatcher tells the trampoline (and itself) to do next.
#[derive(PartialOrd, PartialEq, Clone, Copy, Debug)]
#[repr(u8)]
pub enum ExitType {
    /// Resume the guest as-is.
    Continue = 0,
    /// Execute the devirtualization tail; the frame's RBX/RCX slots carry
    /// the resume RIP/RSP.
    ExitHypervisor = 1,
    /// Advance past the exiting instruction, then resume.
    IncrementRIP = 2,
}

/// Dispatches one VM exit. Called by the trampoline with interrupts off on
/// the dedicated VMM stack.
#[no_mangle]
pub unsafe extern "C" fn vmexit_handler(registers: *mut GuestRegisters, vcpu: *mut Vcpu) -> u8 {
    let registers = unsafe { &mut *registers };
    let vcpu = unsafe { &mut *vcpu };

    // Complete the frame with the VMCS-held registers.
    registers.rip = vmread(guest::RIP);
    registers.rsp = vmread(guest::RSP);
    registers.rflags = vmread(guest::RFLAGS);

    let exit_reason = vmread(ro::EXIT_REASON) as u32;

    let Some(basic_exit_reason) = VmxBasicExitReason::from_u32(exit_reason) else {
        shared::report_fatal(vcpu.index, "unknown VM-exit reason");
        return devirtualize_core(vcpu, registers);
    };

    let exit_type = match basic_exit_reason {
        VmxBasicExitReason::ExceptionOrNmi => exception::handle_exception(vcpu, registers),
        VmxBasicExitReason::ExternalInterrupt => handle_external_interrupt(vcpu),
        VmxBasicExitReason::TripleFault => {
            shared::report_fatal(vcpu.index, "guest triple fault");
            return devirtualize_core(vcpu, registers);
        }
        VmxBasicExitReason::Cpuid => cpuid::handle_cpuid(vcpu, registers),
        VmxBasicExitReason::Invd => {
            wbinvd();
            ExitType::IncrementRIP
        }
        VmxBasicExitReason::Invlpg => {
            // Reflect the invalidation under our shared VPID tag.
            let linear_address = vmread(ro::EXIT_QUALIFICATION);
            invvpid_individual_address(VPID_TAG, linear_address);
            ExitType::IncrementRIP
        }
        VmxBasicExitReason::Rdtsc | VmxBasicExitReason::Rdtscp => rdtsc::handle_rdtsc(vcpu, registers, basic_exit_reason),
        VmxBasicExitReason::Rdpmc => rdtsc::handle_rdpmc(vcpu, registers),
        VmxBasicExitReason::Vmcall => {
            let exit = vmcall::handle_vmcall(vcpu, registers);
            if exit == ExitType::ExitHypervisor {
                return devirtualize_core(vcpu, registers);
            }
            exit
        }
        // The guest must not see the VMX instruction set. GETSEC rides along:
        // SMX is never advertised.
        VmxBasicExitReason::Getsec
        | VmxBasicExitReason::Vmclear
        | VmxBasicExitReason::Vmlaunch
        | VmxBasicExitReason::Vmptrld
        | VmxBasicExitReason::Vmptrst
        | VmxBasicExitReason::Vmread
        | VmxBasicExitReason::Vmresume
        | VmxBasicExitReason::Vmwrite
        | VmxBasicExitReason::Vmxoff
        | VmxBasicExitReason::Vmxon
        | VmxBasicExitReason::Invept
        | VmxBasicExitReason::Invvpid
        | VmxBasicExitReason::Vmfunc => {
            EventInjection::vmentry_inject_ud();
            ExitType::Continue
        }
        VmxBasicExitReason::ControlRegisterAccesses => cr::handle_cr_access(vcpu, registers),
        VmxBasicExitReason::MovDr => dr::handle_mov_dr(vcpu, registers),
        VmxBasicExitReason::IoInstruction => io::handle_io(vcpu, registers),
        VmxBasicExitReason::Rdmsr => msr::handle_msr_access(vcpu, registers, crate::intel::bitmap::MsrAccessType::Read),
        VmxBasicExitReason::Wrmsr => msr::handle_msr_access(vcpu, registers, crate::intel::bitmap::MsrAccessType::Write),
        VmxBasicExitReason::MonitorTrapFlag => mtf::handle_mtf(vcpu, registers),
        VmxBasicExitReason::AccessToGdtrOrIdtr | VmxBasicExitReason::AccessToLdtrOrTr => {
            crate::callbacks::with_callbacks(|callbacks| {
                if let Some(handler) = callbacks.descriptor_table_access {
                    handler(vcpu.index, registers);
                }
            });
            ExitType::IncrementRIP
        }
        VmxBasicExitReason::EptViolation => ept::handle_ept_violation(vcpu, registers),
        VmxBasicExitReason::EptMisconfiguration => {
            shared::report_fatal(vcpu.index, "EPT misconfiguration");
            return devirtualize_core(vcpu, registers);
        }
        VmxBasicExitReason::VmxPreemptionTimerExpired => {
            crate::callbacks::with_callbacks(|callbacks| {
                if let Some(handler) = callbacks.preemption_timer {
                    handler(vcpu.index);
                }
            });
            ExitType::Continue
        }
        VmxBasicExitReason::PageModificationLogFull => handle_pml_full(vcpu),
        VmxBasicExitReason::Xsetbv => xsetbv::handle_xsetbv(vcpu, registers),
        VmxBasicExitReason::Xsaves | VmxBasicExitReason::Xrstors => {
            // Enabled without shadowing; execution is unrestricted.
            ExitType::IncrementRIP
        }
        unexpected => {
            error!("Unhandled VM-exit reason: {:?}", unexpected);
            shared::report_fatal(vcpu.index, "unhandled VM-exit reason");
            return devirtualize_core(vcpu, registers);
        }
    };

    // Deliver at most one queued event per entry once no other injection is
    // staged.
    if !EventInjection::injection_pending() {
        if let Some(event) = vcpu.pending_nmi.take().or_else(|| vcpu.pending_external_interrupt.take()) {
            EventInjection::vmentry_inject_pending(&event);
        }
    }

    if exit_type == ExitType::IncrementRIP {
        advance_guest_rip(registers);
    }

    ExitType::Continue as u8
}

/// Adds the exiting instruction's length to the guest RIP. Fault-class exits
/// (EPT violations, #PF re-injection) and MTF re-execution never come here.
fn advance_guest_rip(registers: &mut GuestRegisters) {
    let length = vmread(ro::VMEXIT_INSTRUCTION_LEN);
    registers.rip += length;
    vmwrite(guest::RIP, registers.rip);
}

/// An external interrupt arrived while exiting was enabled: report it, then
/// queue it for re-injection on the next entry (the acknowledge-on-exit
/// control has already pulled the vector out of the APIC).
fn handle_external_interrupt(vcpu: &mut Vcpu) -> ExitType {
    let information = vmread(ro::VMEXIT_INTERRUPTION_INFO) as u32;
    let vector = (information & 0xFF) as u8;

    let consumed = crate::callbacks::with_callbacks(|callbacks| {
        callbacks.external_interrupt.map(|handler| handler(vcpu.index, vector)).unwrap_or(false)
    });

    if !consumed {
        vcpu.queue_event(crate::intel::events::PendingEvent {
            vector,
            interruption_type: crate::intel::vmerror::InterruptionType::ExternalInterrupt,
            error_code: None,
        });
    }

    ExitType::Continue
}

/// Drains the full page-modification log to the dirty-logging consumer and
/// rewinds the index.
fn handle_pml_full(vcpu: &mut Vcpu) -> ExitType {
    use crate::intel::vcpu::GUEST_PML_INDEX;

    if vcpu.pml_active {
        let core = vcpu.index;
        let entries = &vcpu.pml.entries;
        crate::callbacks::with_callbacks(|callbacks| {
            if let Some(handler) = callbacks.dirty_pages {
                handler(core, entries);
            }
        });
    }

    vmwrite(GUEST_PML_INDEX, crate::intel::vcpu::PML_INDEX_LAST);
    ExitType::Continue
}

/// Tears this core down from inside an exit: VMXOFF with state restoration,
/// then hand the resume RIP/RSP to the trampoline through the frame.
fn devirtualize_core(vcpu: &mut Vcpu, registers: &mut GuestRegisters) -> u8 {
    let state = vcpu.devirtualize();

    registers.rbx = state.guest_rip;
    registers.rcx = state.guest_rsp;

    ExitType::ExitHypervisor as u8
}
