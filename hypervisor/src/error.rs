use thiserror_no_std::Error;

#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("CPU is not supported")]
    CpuUnsupported,

    #[error("VMX is not supported")]
    VmxUnsupported,

    #[error("VMX is locked off in the BIOS")]
    VmxBiosLock,

    #[error("EPT is not supported")]
    EptUnsupported,

    #[error("Required EPT capability is missing")]
    EptCapabilityMissing,

    #[error("VPID is not supported")]
    VpidUnsupported,

    #[error("Failed to convert from virtual address to physical address")]
    VirtualToPhysicalAddressFailed,

    #[error("Failed to allocate contiguous memory")]
    MemoryAllocationFailed,

    #[error("The preallocated page pool is exhausted")]
    PoolExhausted,

    #[error("VM instruction failed: {0:?}")]
    VmInstructionFailed(crate::intel::vmerror::VmInstructionError),

    #[error("Unknown VM instruction error code")]
    UnknownVmInstructionError,

    #[error("VMLAUNCH failed")]
    VmFailToLaunch,

    #[error("MTRR variable ranges overlap with undefined precedence")]
    MtrrOverlapUndefined,

    #[error("EPT walk failed: no leaf covers the guest physical address")]
    EptWalkFailed,

    #[error("Guest memory is inaccessible under the target CR3")]
    GuestMemoryInaccessible,

    #[error("The page is already hooked with an incompatible permission mask")]
    HookConflict,

    #[error("No hook is installed on the requested address")]
    HookNotFound,

    #[error("The displaced instructions exceed the trampoline capacity")]
    TrampolineCapacityExceeded,

    #[error("A RIP-relative displacement cannot reach its target from the trampoline")]
    RipRelocationOutOfRange,

    #[error("The target process could not be resolved")]
    ProcessNotFound,
}
