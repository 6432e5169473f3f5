//! The VMX-root side of the hypercall protocol. Every configuration change
//! to a core's VMCS happens here, on that core, with interrupts off; the
//! non-root side only marshals requests through the broadcast layer.

use {
    crate::intel::{
        bitmap::{IoOperation, MsrAccessType, MsrOperation},
        capture::GuestRegisters,
        events::PendingEvent,
        invept::{invept_all_contexts, invept_single_context},
        invvpid::invvpid_individual_address,
        shared,
        support::{rdmsr, vmread, vmwrite},
        vcpu::{SyscallHookType, Vcpu},
        vmcall::{VmcallNumber, VMCALL_STATUS_SUCCESS, VMCALL_STATUS_UNSUCCESSFUL},
        vmcs::VPID_TAG,
        vmerror::InterruptionType,
        vmexit::ExitType,
    },
    log::*,
    num_traits::FromPrimitive,
    x86::{msr, vmx::vmcs::{control, guest}},
};

// Control bits toggled at runtime. Intel manual, Tables 25-5 through 25-7.
const PIN_EXTERNAL_INTERRUPT_EXITING: u64 = 1 << 0;
const PIN_ACTIVATE_PREEMPTION_TIMER: u64 = 1 << 6;
const PROC_RDTSC_EXITING: u64 = 1 << 12;
const PROC_CR3_LOAD_EXITING: u64 = 1 << 15;
const PROC_CR3_STORE_EXITING: u64 = 1 << 16;
const PROC_RDPMC_EXITING: u64 = 1 << 11;
const PROC_MOV_DR_EXITING: u64 = 1 << 23;
const SECONDARY_DESCRIPTOR_TABLE_EXITING: u64 = 1 << 2;
const SECONDARY_ENABLE_PML: u64 = 1 << 17;
const SECONDARY_MODE_BASED_EXECUTE: u64 = 1 << 22;
const EXIT_ACK_INTERRUPT_ON_EXIT: u64 = 1 << 15;
const EXCEPTION_BITMAP_UD: u64 = 1 << 6;
const EFER_SCE: u64 = 1 << 0;
const VMX_PREEMPTION_TIMER_VALUE: u32 = 0x482E;

fn set_control_bits(field: u32, bits: u64, enable: bool) {
    let mut value = vmread(field);
    if enable {
        value |= bits;
    } else {
        value &= !bits;
    }
    vmwrite(field, value);
}

/// Whether the secondary-control bit is supported at all on this part.
fn secondary_control_supported(bit: u64) -> bool {
    rdmsr(msr::IA32_VMX_PROCBASED_CTLS2) >> 32 & bit != 0
}

/// Dispatches a hypercall by the number in RCX. The status lands in RAX.
pub fn handle_vmcall(vcpu: &mut Vcpu, registers: &mut GuestRegisters) -> ExitType {
    let number = registers.rcx;
    let arg1 = registers.rdx;
    let arg2 = registers.r8;
    let arg3 = registers.r9;

    let Some(number) = VmcallNumber::from_u64(number) else {
        warn!("Unknown hypercall {:#x} on core {}", number, vcpu.index);
        registers.rax = VMCALL_STATUS_UNSUCCESSFUL;
        return ExitType::IncrementRIP;
    };

    trace!("Hypercall {:?} on core {}", number, vcpu.index);

    let status = match number {
        VmcallNumber::Test => {
            trace!("VMCALL test round-trip: {:#x} {:#x} {:#x}", arg1, arg2, arg3);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::Vmxoff => {
            registers.rax = VMCALL_STATUS_SUCCESS;
            return ExitType::ExitHypervisor;
        }

        VmcallNumber::ChangePageAttrib => {
            match shared::with_hook_manager(|hook_manager| hook_manager.apply_hook(arg1)) {
                Ok(()) => VMCALL_STATUS_SUCCESS,
                Err(error) => {
                    error!("Hook application failed: {:?}", error);
                    VMCALL_STATUS_UNSUCCESSFUL
                }
            }
        }

        VmcallNumber::InveptSingleContext => {
            invept_single_context(arg1);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::InveptAllContexts => {
            invept_all_contexts();
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::UnhookSinglePage => {
            match shared::with_hook_manager(|hook_manager| hook_manager.restore_page(arg1)) {
                Ok(()) => VMCALL_STATUS_SUCCESS,
                Err(error) => {
                    error!("Unhook failed: {:?}", error);
                    VMCALL_STATUS_UNSUCCESSFUL
                }
            }
        }

        VmcallNumber::UnhookAllPages => {
            let restored = shared::with_hook_manager(|hook_manager| {
                // No allocation in VMX root: collect into a fixed array.
                let mut pending = [0u64; crate::intel::hooks::hook_manager::MAX_HOOKS];
                let count = hook_manager.pending_restore_pages(&mut pending);

                for &page_pa in &pending[..count] {
                    hook_manager.restore_page(page_pa)?;
                }
                Ok(())
            });

            match restored {
                Ok(()) => VMCALL_STATUS_SUCCESS,
                Err(_) => VMCALL_STATUS_UNSUCCESSFUL,
            }
        }

        VmcallNumber::InvvpidSingleAddress => {
            invvpid_individual_address(VPID_TAG, arg1);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::SignalDebugger => {
            trace!("Debugger rendezvous signal on core {}", vcpu.index);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::ChangeMsrBitmapRead => {
            let operation = if arg2 != 0 { MsrOperation::Hook } else { MsrOperation::Unhook };
            vcpu.msr_bitmap.modify_msr_interception(arg1 as u32, MsrAccessType::Read, operation);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::ChangeMsrBitmapWrite => {
            let operation = if arg2 != 0 { MsrOperation::Hook } else { MsrOperation::Unhook };
            vcpu.msr_bitmap.modify_msr_interception(arg1 as u32, MsrAccessType::Write, operation);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::ChangeIoBitmap => {
            let operation = if arg2 != 0 { IoOperation::Hook } else { IoOperation::Unhook };
            vcpu.io_bitmaps.modify_io_interception(arg1 as u16, operation);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::SetExceptionBitmap => {
            set_control_bits(control::EXCEPTION_BITMAP, arg1, true);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::UnsetExceptionBitmap => {
            set_control_bits(control::EXCEPTION_BITMAP, arg1, false);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::EnableMovToCr3Exiting | VmcallNumber::DisableMovToCr3Exiting => {
            let enable = number == VmcallNumber::EnableMovToCr3Exiting;
            set_control_bits(control::PRIMARY_PROCBASED_EXEC_CONTROLS, PROC_CR3_LOAD_EXITING, enable);
            vcpu.mov_to_cr3_exiting = enable;
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::EnableRdtscExiting | VmcallNumber::DisableRdtscExiting => {
            let enable = number == VmcallNumber::EnableRdtscExiting;
            set_control_bits(control::PRIMARY_PROCBASED_EXEC_CONTROLS, PROC_RDTSC_EXITING, enable);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::EnableRdpmcExiting | VmcallNumber::DisableRdpmcExiting => {
            let enable = number == VmcallNumber::EnableRdpmcExiting;
            set_control_bits(control::PRIMARY_PROCBASED_EXEC_CONTROLS, PROC_RDPMC_EXITING, enable);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::EnableMovDrExiting | VmcallNumber::DisableMovDrExiting => {
            let enable = number == VmcallNumber::EnableMovDrExiting;
            set_control_bits(control::PRIMARY_PROCBASED_EXEC_CONTROLS, PROC_MOV_DR_EXITING, enable);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::EnableExternalInterruptExiting | VmcallNumber::DisableExternalInterruptExiting => {
            let enable = number == VmcallNumber::EnableExternalInterruptExiting;
            set_control_bits(control::PINBASED_EXEC_CONTROLS, PIN_EXTERNAL_INTERRUPT_EXITING, enable);
            set_control_bits(control::VMEXIT_CONTROLS, EXIT_ACK_INTERRUPT_ON_EXIT, enable);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::EnableMovToCrExiting => {
            // arg1 selects the register, arg2 the owned-bit mask.
            match arg1 {
                0 => vmwrite(control::CR0_GUEST_HOST_MASK, arg2),
                4 => vmwrite(control::CR4_GUEST_HOST_MASK, arg2),
                _ => {
                    set_control_bits(control::PRIMARY_PROCBASED_EXEC_CONTROLS, PROC_CR3_LOAD_EXITING | PROC_CR3_STORE_EXITING, true);
                }
            }
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::DisableMovToCrExiting => {
            match arg1 {
                0 => vmwrite(control::CR0_GUEST_HOST_MASK, 0u64),
                4 => vmwrite(control::CR4_GUEST_HOST_MASK, 0u64),
                _ => {
                    set_control_bits(control::PRIMARY_PROCBASED_EXEC_CONTROLS, PROC_CR3_LOAD_EXITING | PROC_CR3_STORE_EXITING, false);
                }
            }
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::EnableEferSyscallHook => {
            let mode = if arg1 == 1 { SyscallHookType::SafeAccessMemory } else { SyscallHookType::HandleAllUd };
            vcpu.syscall_hook = Some(mode);

            // With SCE clear, every SYSCALL raises #UD, which we intercept.
            let efer = vmread(guest::IA32_EFER_FULL);
            vmwrite(guest::IA32_EFER_FULL, efer & !EFER_SCE);
            set_control_bits(control::EXCEPTION_BITMAP, EXCEPTION_BITMAP_UD, true);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::DisableEferSyscallHook => {
            vcpu.syscall_hook = None;

            let efer = vmread(guest::IA32_EFER_FULL);
            vmwrite(guest::IA32_EFER_FULL, efer | EFER_SCE);
            set_control_bits(control::EXCEPTION_BITMAP, EXCEPTION_BITMAP_UD, false);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::EnableDirtyLogging => {
            if !secondary_control_supported(SECONDARY_ENABLE_PML) {
                error!("PML not supported on this CPU");
                VMCALL_STATUS_UNSUCCESSFUL
            } else {
                match vcpu.enable_pml() {
                    Ok(()) => {
                        set_control_bits(control::SECONDARY_PROCBASED_EXEC_CONTROLS, SECONDARY_ENABLE_PML, true);
                        VMCALL_STATUS_SUCCESS
                    }
                    Err(error) => {
                        error!("Dirty-logging enable failed: {:?}", error);
                        VMCALL_STATUS_UNSUCCESSFUL
                    }
                }
            }
        }

        VmcallNumber::DisableDirtyLogging => {
            set_control_bits(control::SECONDARY_PROCBASED_EXEC_CONTROLS, SECONDARY_ENABLE_PML, false);
            vcpu.disable_pml();
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::EnableModeBasedExec | VmcallNumber::DisableModeBasedExec => {
            let enable = number == VmcallNumber::EnableModeBasedExec;
            if enable && !secondary_control_supported(SECONDARY_MODE_BASED_EXECUTE) {
                error!("Mode-based execute control not supported on this CPU");
                VMCALL_STATUS_UNSUCCESSFUL
            } else {
                set_control_bits(control::SECONDARY_PROCBASED_EXEC_CONTROLS, SECONDARY_MODE_BASED_EXECUTE, enable);
                invept_all_contexts();
                VMCALL_STATUS_SUCCESS
            }
        }

        VmcallNumber::EnablePreemptionTimer => {
            set_control_bits(control::PINBASED_EXEC_CONTROLS, PIN_ACTIVATE_PREEMPTION_TIMER, true);
            vmwrite(VMX_PREEMPTION_TIMER_VALUE, arg1);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::DisablePreemptionTimer => {
            set_control_bits(control::PINBASED_EXEC_CONTROLS, PIN_ACTIVATE_PREEMPTION_TIMER, false);
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::InjectEvent => {
            let vector = (arg1 & 0xFF) as u8;
            let interruption_type =
                InterruptionType::from_u64((arg1 >> 8) & 0x7).unwrap_or(InterruptionType::ExternalInterrupt);
            let error_code = (arg2 != 0).then_some(arg3 as u32);

            vcpu.queue_event(PendingEvent {
                vector,
                interruption_type,
                error_code,
            });
            VMCALL_STATUS_SUCCESS
        }

        VmcallNumber::EnableDescriptorTableExiting | VmcallNumber::DisableDescriptorTableExiting => {
            let enable = number == VmcallNumber::EnableDescriptorTableExiting;
            if enable && !secondary_control_supported(SECONDARY_DESCRIPTOR_TABLE_EXITING) {
                VMCALL_STATUS_UNSUCCESSFUL
            } else {
                set_control_bits(control::SECONDARY_PROCBASED_EXEC_CONTROLS, SECONDARY_DESCRIPTOR_TABLE_EXITING, enable);
                VMCALL_STATUS_SUCCESS
            }
        }
    };

    registers.rax = status;
    ExitType::IncrementRIP
}
