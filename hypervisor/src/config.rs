//! The configuration surface consumed by the upper debugger layers. Every
//! routine here runs in VMX non-root: it does its bookkeeping at
//! PASSIVE_LEVEL, then marshals the actual VMCS/EPT mutation onto the right
//! core(s) through the broadcast layer, which applies it from VMX root.

use {
    crate::{
        intel::{
            ept::AccessType,
            hooks::inline::DetourHandler,
            shared,
            vcpu::SyscallHookType,
            vmcall::VmcallNumber,
        },
        windows::dpc::{self, DpcTask},
    },
    log::*,
};

/// Which cores a configuration change targets.
#[derive(Clone, Copy, Debug)]
pub enum Target {
    AllCores,
    Core(u32),
}

fn apply(target: Target, number: VmcallNumber, arg1: u64, arg2: u64, arg3: u64) -> bool {
    let task = DpcTask::Hypercall {
        number: number as u64,
        arg1,
        arg2,
        arg3,
    };

    match target {
        Target::AllCores => {
            dpc::run_on_all_cores(task);
            true
        }
        Target::Core(core) => {
            if core as usize >= shared::core_count() {
                error!("Core {} out of range", core);
                return false;
            }
            dpc::run_on_single_core(core, task)
        }
    }
}

/// Installs a breakpoint-style hidden hook (`EptHook`): execution of the
/// byte at `va` traps as #BP while guest reads of the page keep seeing the
/// original bytes.
pub fn ept_hook(va: u64, pid: u64) -> bool {
    let installed = shared::with_hook_manager(|hook_manager| hook_manager.ept_hook(va, pid));

    match installed {
        Ok(page_pa) => apply(Target::AllCores, VmcallNumber::ChangePageAttrib, page_pa, 0, 0),
        Err(error) => {
            error!("EPT hook install failed: {:?}", error);
            false
        }
    }
}

/// Installs a detour-style hook or a configurable access watch (`EptHook2`).
/// With `hidden` and `x` set, `handler` is invoked for every execution of
/// `va`; otherwise the set bits of {r, w, x} become a refcounted watch.
pub fn ept_hook2(va: u64, handler: Option<DetourHandler>, pid: u64, r: bool, w: bool, x: bool, hidden: bool) -> bool {
    let mut access = AccessType::empty();
    access.set(AccessType::READ, r);
    access.set(AccessType::WRITE, w);
    access.set(AccessType::EXECUTE, x);

    let installed = shared::with_hook_manager(|hook_manager| hook_manager.ept_hook2(va, handler, pid, access, hidden));

    match installed {
        Ok(page_pa) => apply(Target::AllCores, VmcallNumber::ChangePageAttrib, page_pa, 0, 0),
        Err(error) => {
            error!("EPT hook install failed: {:?}", error);
            false
        }
    }
}

/// Removes the hook at `va` (or, with `va == 0`, the hook covering `pa`),
/// restoring the EPT leaf to its pre-install value byte for byte.
pub fn ept_unhook(va: u64, pa: u64, pid: u64) -> bool {
    let prepared = shared::with_hook_manager(|hook_manager| hook_manager.prepare_unhook(va, pa, pid));

    match prepared {
        // Other installs still share the page; nothing to restore yet.
        Ok(None) => true,
        Ok(Some(page_pa)) => {
            apply(Target::AllCores, VmcallNumber::UnhookSinglePage, page_pa, 0, 0);
            let _ = shared::with_hook_manager(|hook_manager| {
                hook_manager.finish_unhook(page_pa);
                Ok(())
            });
            true
        }
        Err(error) => {
            error!("EPT unhook failed: {:?}", error);
            false
        }
    }
}

/// Removes every installed hook.
pub fn ept_unhook_all() {
    let pages = shared::with_hook_manager(|hook_manager| Ok(hook_manager.prepare_unhook_all())).unwrap_or_default();

    if pages.is_empty() {
        return;
    }

    apply(Target::AllCores, VmcallNumber::UnhookAllPages, 0, 0, 0);

    let _ = shared::with_hook_manager(|hook_manager| {
        for page_pa in pages {
            hook_manager.finish_unhook(page_pa);
        }
        Ok(())
    });
}

pub fn enable_mov_to_cr3_exiting(target: Target) -> bool {
    apply(target, VmcallNumber::EnableMovToCr3Exiting, 0, 0, 0)
}

pub fn disable_mov_to_cr3_exiting(target: Target) -> bool {
    apply(target, VmcallNumber::DisableMovToCr3Exiting, 0, 0, 0)
}

pub fn enable_external_interrupt_exiting(core: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::EnableExternalInterruptExiting, 0, 0, 0)
}

pub fn disable_external_interrupt_exiting(core: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::DisableExternalInterruptExiting, 0, 0, 0)
}

pub fn enable_rdtsc_exiting(core: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::EnableRdtscExiting, 0, 0, 0)
}

pub fn disable_rdtsc_exiting(core: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::DisableRdtscExiting, 0, 0, 0)
}

pub fn enable_rdpmc_exiting(core: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::EnableRdpmcExiting, 0, 0, 0)
}

pub fn disable_rdpmc_exiting(core: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::DisableRdpmcExiting, 0, 0, 0)
}

pub fn enable_mov_to_dr_exiting(core: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::EnableMovDrExiting, 0, 0, 0)
}

pub fn disable_mov_to_dr_exiting(core: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::DisableMovDrExiting, 0, 0, 0)
}

/// ORs `mask` into the core's exception bitmap.
pub fn set_exception_bitmap(core: u32, mask: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::SetExceptionBitmap, mask as u64, 0, 0)
}

/// Clears `mask` out of the core's exception bitmap.
pub fn unset_exception_bitmap(core: u32, mask: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::UnsetExceptionBitmap, mask as u64, 0, 0)
}

/// Arms a MOV-to-CR intercept: for CR0/CR4 the guest/host mask selects the
/// owned bits; any other value of `cr` arms CR3 load/store exiting.
pub fn enable_mov_to_cr_exiting(core: u32, cr: u8, owned_bits: u64) -> bool {
    apply(Target::Core(core), VmcallNumber::EnableMovToCrExiting, cr as u64, owned_bits, 0)
}

pub fn disable_mov_to_cr_exiting(core: u32, cr: u8) -> bool {
    apply(Target::Core(core), VmcallNumber::DisableMovToCrExiting, cr as u64, 0, 0)
}

pub fn change_msr_bitmap_read(core: u32, msr: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::ChangeMsrBitmapRead, msr as u64, 1, 0)
}

pub fn reset_msr_bitmap_read(core: u32, msr: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::ChangeMsrBitmapRead, msr as u64, 0, 0)
}

pub fn change_msr_bitmap_write(core: u32, msr: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::ChangeMsrBitmapWrite, msr as u64, 1, 0)
}

pub fn reset_msr_bitmap_write(core: u32, msr: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::ChangeMsrBitmapWrite, msr as u64, 0, 0)
}

pub fn change_io_bitmap(core: u32, port: u16) -> bool {
    apply(Target::Core(core), VmcallNumber::ChangeIoBitmap, port as u64, 1, 0)
}

pub fn reset_io_bitmap(core: u32, port: u16) -> bool {
    apply(Target::Core(core), VmcallNumber::ChangeIoBitmap, port as u64, 0, 0)
}

/// Clears EFER.SCE in the guest and intercepts #UD so SYSCALL/SYSRET can be
/// emulated (and observed) in software.
pub fn enable_efer_syscall_hook(target: Target, hook_type: SyscallHookType) -> bool {
    let mode = match hook_type {
        SyscallHookType::HandleAllUd => 0,
        SyscallHookType::SafeAccessMemory => 1,
    };
    apply(target, VmcallNumber::EnableEferSyscallHook, mode, 0, 0)
}

pub fn disable_efer_syscall_hook(target: Target) -> bool {
    apply(target, VmcallNumber::DisableEferSyscallHook, 0, 0, 0)
}

/// Queues an interrupt or exception for delivery on the core's next
/// VM entry. `interruption_type` uses the VM-entry encoding.
pub fn inject_interrupt_or_exception(core: u32, vector: u8, interruption_type: u8, error_code: Option<u32>) -> bool {
    let arg1 = vector as u64 | ((interruption_type as u64 & 0x7) << 8);
    let (has_error, error) = match error_code {
        Some(code) => (1, code as u64),
        None => (0, 0),
    };
    apply(Target::Core(core), VmcallNumber::InjectEvent, arg1, has_error, error)
}

/// Request block for the reversing-machine (mode-based execute) feature.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReversingMachineRequest {
    /// Also intercept descriptor-table access while the machine runs.
    pub descriptor_table_exiting: bool,
}

/// Installs mode-based execute hooks fleet-wide. Fails cleanly on CPUs
/// without MBEC; the EPT-flip hook engine keeps working regardless.
pub fn configure_initialize_reversing_machine(request: ReversingMachineRequest) -> bool {
    if !apply(Target::AllCores, VmcallNumber::EnableModeBasedExec, 0, 0, 0) {
        return false;
    }

    if request.descriptor_table_exiting {
        return apply(Target::AllCores, VmcallNumber::EnableDescriptorTableExiting, 0, 0, 0);
    }

    true
}

pub fn configure_uninitialize_reversing_machine() -> bool {
    apply(Target::AllCores, VmcallNumber::DisableDescriptorTableExiting, 0, 0, 0)
        && apply(Target::AllCores, VmcallNumber::DisableModeBasedExec, 0, 0, 0)
}

/// Starts page-modification logging on every core; dirty pages arrive
/// through the `dirty_pages` callback.
pub fn dirty_logging_initialize() -> bool {
    apply(Target::AllCores, VmcallNumber::EnableDirtyLogging, 0, 0, 0)
}

pub fn dirty_logging_uninitialize() {
    apply(Target::AllCores, VmcallNumber::DisableDirtyLogging, 0, 0, 0);
}

/// Arms the VMX preemption timer on one core, bounding the latency of
/// upper-layer operations that would otherwise block.
pub fn enable_preemption_timer(core: u32, value: u64) -> bool {
    apply(Target::Core(core), VmcallNumber::EnablePreemptionTimer, value, 0, 0)
}

pub fn disable_preemption_timer(core: u32) -> bool {
    apply(Target::Core(core), VmcallNumber::DisablePreemptionTimer, 0, 0, 0)
}
