//! Broadcast layer: runs a per-core task on every logical processor in
//! parallel, or on one chosen processor, and blocks until every targeted core
//! has completed. All cross-core configuration goes through here; no code
//! path ever touches another core's VMCS directly.

use {
    crate::windows::nt::{
        self, KeGenericCallDpc, KeRevertToUserGroupAffinityThread, KeSetSystemGroupAffinityThread,
        KeSignalCallDpcDone, KeSignalCallDpcSynchronize, GROUP_AFFINITY, PROCESSOR_NUMBER, PVOID,
    },
    core::sync::atomic::{AtomicU64, Ordering},
    log::*,
};

/// A per-core unit of work dispatched under the broadcast layer. Tasks are
/// tags; the DPC body dispatches on the tag on the core it runs on.
#[derive(Clone, Copy, Debug)]
pub enum DpcTask {
    /// Bring the current core into VMX operation and launch its guest.
    VirtualizeCore,

    /// Devirtualize the current core via the VMXOFF hypercall.
    TerminateCore,

    /// Issue a hypercall on the current core so that the VMX-root side applies
    /// a configuration change to this core's VMCS or TLB state.
    Hypercall { number: u64, arg1: u64, arg2: u64, arg3: u64 },
}

struct BroadcastContext {
    task: DpcTask,
    /// One bit per core, set once the task has run there.
    applied: AtomicU64,
}

/// The DPC body run on each processor by `KeGenericCallDpc`.
unsafe extern "system" fn broadcast_routine(_dpc: PVOID, context: PVOID, system_argument1: PVOID, system_argument2: PVOID) {
    let context = unsafe { &*(context as *const BroadcastContext) };
    let core = nt::current_processor_index();

    crate::vmm::dispatch_broadcast_task(&context.task);
    if core < 64 {
        context.applied.fetch_or(1 << core, Ordering::SeqCst);
    }

    // Rendezvous with the sibling DPCs, then release the initiator.
    unsafe {
        KeSignalCallDpcSynchronize(system_argument2);
        KeSignalCallDpcDone(system_argument1);
    }
}

/// Runs `task` on every logical processor and waits for completion on all of
/// them. Returns the per-core applied mask, which callers may assert against
/// the active-processor count.
pub fn run_on_all_cores(task: DpcTask) -> u64 {
    let context = BroadcastContext {
        task,
        applied: AtomicU64::new(0),
    };

    trace!("Broadcasting {:?} to all cores", task);
    unsafe { KeGenericCallDpc(broadcast_routine, &context as *const _ as PVOID) };

    context.applied.load(Ordering::SeqCst)
}

/// Runs `task` on one chosen logical processor at DISPATCH_LEVEL and waits
/// for it to finish. The calling thread is temporarily bound to the target
/// core's affinity group.
pub fn run_on_single_core(core: u32, task: DpcTask) -> bool {
    let mut number = PROCESSOR_NUMBER::default();
    if unsafe { nt::KeGetProcessorNumberFromIndex(core, &mut number) } != nt::STATUS_SUCCESS {
        error!("Core index {} is not an active processor", core);
        return false;
    }

    let mut affinity = GROUP_AFFINITY {
        Mask: 1usize << number.Number,
        Group: number.Group,
        Reserved: [0; 3],
    };
    let mut previous = GROUP_AFFINITY::default();

    unsafe { KeSetSystemGroupAffinityThread(&mut affinity, &mut previous) };

    let old_irql = nt::raise_irql_to_dpc_level();
    crate::vmm::dispatch_broadcast_task(&task);
    nt::lower_irql(old_irql);

    unsafe { KeRevertToUserGroupAffinityThread(&mut previous) };

    true
}
