//! Lifecycle: bring every logical processor into VMX operation beneath the
//! running OS, and take them back out with the OS none the wiser.

use {
    crate::{
        error::HypervisorError,
        intel::{
            capture::{capture_registers, GuestRegisters},
            ept::{Ept, EptCapabilities},
            hooks::hook_manager::HookManager,
            mtrr::MtrrMap,
            shared::{self, EptState},
            support,
            vcpu::Vcpu,
            vmcall::{vmcall, VmcallNumber},
            vmxon::Vmxon,
        },
        windows::{
            dpc::{self, DpcTask},
            memory::AllocatedMemory,
            nt, process,
        },
    },
    alloc::{boxed::Box, vec::Vec},
    core::ptr::NonNull,
    log::*,
};

/// Detects hardware support, builds the MTRR map and the EPT identity
/// tables, then virtualizes every logical processor. Returns `false` and
/// rolls back cleanly when anything is missing or fails.
pub fn vmx_initialize() -> bool {
    if shared::is_initialized() {
        warn!("Hypervisor already initialized");
        return false;
    }

    if let Err(error) = check_hardware_support() {
        error!("Unsupported hardware: {:?}", error);
        return false;
    }

    // Captured while DriverEntry still runs in the System process; the host
    // state of every VMCS is built from this address space.
    process::capture_system_cr3();

    if let Err(error) = build_shared_state() {
        error!("Initialization failed: {:?}", error);
        shared::drain();
        return false;
    }

    let core_count = nt::processor_count();
    shared::init_guest_state(core_count as usize);

    info!("Virtualizing {} logical processors", core_count);
    dpc::run_on_all_cores(DpcTask::VirtualizeCore);

    // Confirm every VM is live with a test hypercall round-trip before
    // declaring success.
    let mut launched = 0;
    for core in 0..core_count {
        if shared::is_core_launched(core)
            && dpc::run_on_single_core(
                core,
                DpcTask::Hypercall {
                    number: VmcallNumber::Test as u64,
                    arg1: 0x11,
                    arg2: 0x22,
                    arg3: 0x33,
                },
            )
        {
            launched += 1;
        }
    }

    if launched != core_count {
        error!("Only {}/{} cores virtualized; rolling back", launched, core_count);
        vmx_terminate();
        return false;
    }

    info!("The hypervisor has been installed on all cores");
    true
}

/// Removes all hooks, devirtualizes every core, and frees everything.
pub fn vmx_terminate() {
    if !shared::is_initialized() {
        return;
    }

    info!("Terminating the hypervisor");

    crate::config::ept_unhook_all();

    dpc::run_on_all_cores(DpcTask::TerminateCore);

    // The DPCs run at DISPATCH_LEVEL and cannot free; reclaim from here.
    for core in 0..shared::core_count() as u32 {
        if let Some(vcpu) = shared::take_vcpu(core) {
            drop(unsafe { Box::from_raw(vcpu.as_ptr()) });
        }
    }

    shared::drain();
    info!("The hypervisor has been uninstalled");
}

/// CPUID/VMX/EPT feature gates. Everything this crate depends on must be
/// present or initialization aborts without side effects.
fn check_hardware_support() -> Result<(), HypervisorError> {
    Vmxon::check_vmx_support()?;

    let capabilities = EptCapabilities::read();
    if !capabilities.page_walk_length_4 || !capabilities.large_2mb_pages {
        return Err(HypervisorError::EptUnsupported);
    }
    // The exec configuration of a hooked page is execute-only.
    if !capabilities.execute_only {
        return Err(HypervisorError::EptCapabilityMissing);
    }
    if !capabilities.write_back_structures && !capabilities.uncacheable_structures {
        return Err(HypervisorError::EptCapabilityMissing);
    }
    if !capabilities.invept_single_context || !capabilities.invept_all_contexts {
        return Err(HypervisorError::EptCapabilityMissing);
    }
    if !capabilities.invvpid {
        return Err(HypervisorError::VpidUnsupported);
    }

    Ok(())
}

fn build_shared_state() -> Result<(), HypervisorError> {
    trace!("Building MTRR map");
    let mtrr = MtrrMap::build()?;

    trace!("Building EPT identity map");
    let mut ept = AllocatedMemory::<Ept>::alloc_contiguous()?;
    let mut build_splits = Vec::new();
    ept.build_identity(&mtrr, &mut build_splits)?;
    let eptp = ept.create_eptp_with_wb_and_4lvl_walk()?;

    shared::init_ept_state(EptState {
        ept,
        eptp,
        mtrr,
        capabilities: EptCapabilities::read(),
        build_splits,
    });

    shared::init_hook_manager(HookManager::new()?);

    Ok(())
}

/// The broadcast DPC body: dispatches a task tag on whichever core it runs.
pub fn dispatch_broadcast_task(task: &DpcTask) {
    match *task {
        DpcTask::VirtualizeCore => {
            if let Err(error) = virtualize_current_core() {
                error!(
                    "Core {} failed to virtualize: {:?}",
                    nt::current_processor_index(),
                    error
                );
            }
        }
        DpcTask::TerminateCore => {
            let core = nt::current_processor_index();
            if shared::is_core_launched(core) {
                vmcall(VmcallNumber::Vmxoff, 0, 0, 0);
            }
        }
        DpcTask::Hypercall { number, arg1, arg2, arg3 } => {
            let core = nt::current_processor_index();
            if shared::is_core_launched(core) {
                unsafe { support::vmcall(number, arg1, arg2, arg3) };
            }
        }
    }
}

/// Virtualizes the core this runs on. On success the "return" happens in
/// guest mode: the captured context resumes right after `capture_registers`
/// with RAX forced to 1.
fn virtualize_current_core() -> Result<(), HypervisorError> {
    let core = nt::current_processor_index();

    if shared::is_core_virtualized(core) {
        trace!("Core {} is already virtualized", core);
        return Ok(());
    }

    let eptp = shared::eptp();
    let system_cr3 = process::system_cr3();

    let vcpu = Box::leak(Vcpu::new(core)?);
    shared::publish_vcpu(core, NonNull::from(&mut *vcpu));

    let mut registers = GuestRegisters::default();
    let is_virtualized = unsafe { capture_registers(&mut registers) };

    // The guest re-enters here after VMLAUNCH with RAX preloaded from the
    // frame; seed it so the second pass skips the launch.
    registers.rax = 1;

    if !is_virtualized {
        debug!("Launching VM on core {}", core);
        vcpu.virtualize(&registers, eptp, system_cr3)?;
    }

    Ok(())
}
