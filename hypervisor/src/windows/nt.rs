//! The NT kernel surface the hypervisor consumes. Only routines that are
//! callable at or above DISPATCH_LEVEL are used from virtualization paths.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(dead_code)]

use {core::ffi::c_void, widestring::U16CString};

pub type NTSTATUS = i32;
pub type PVOID = *mut c_void;
pub type KIRQL = u8;
pub type HANDLE = PVOID;

pub const STATUS_SUCCESS: NTSTATUS = 0;

/// Passive release level
pub const PASSIVE_LEVEL: KIRQL = 0;
/// Dispatcher level
pub const DISPATCH_LEVEL: KIRQL = 2;
/// Highest interrupt level
pub const HIGH_LEVEL: KIRQL = 15;

/// Queries every processor group.
pub const ALL_PROCESSOR_GROUPS: u16 = 0xFFFF;

#[repr(C)]
pub struct UNICODE_STRING {
    pub Length: u16,
    pub MaximumLength: u16,
    pub Buffer: *const u16,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct PROCESSOR_NUMBER {
    pub Group: u16,
    pub Number: u8,
    pub Reserved: u8,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct GROUP_AFFINITY {
    pub Mask: usize,
    pub Group: u16,
    pub Reserved: [u16; 3],
}

/// The deferred routine invoked by `KeGenericCallDpc` on every processor.
pub type PKDEFERRED_ROUTINE =
    unsafe extern "system" fn(Dpc: PVOID, DeferredContext: PVOID, SystemArgument1: PVOID, SystemArgument2: PVOID);

#[link(name = "ntoskrnl")]
extern "system" {
    /// https://learn.microsoft.com/en-us/windows-hardware/drivers/ddi/ntddk/nf-ntddk-mmgetphysicaladdress
    pub fn MmGetPhysicalAddress(BaseAddress: PVOID) -> i64;

    /// Undocumented inverse of `MmGetPhysicalAddress`.
    pub fn MmGetVirtualForPhysical(PhysicalAddress: i64) -> PVOID;

    /// https://learn.microsoft.com/en-us/windows-hardware/drivers/ddi/wdm/nf-wdm-mmallocatecontiguousmemory
    pub fn MmAllocateContiguousMemory(NumberOfBytes: usize, HighestAcceptableAddress: i64) -> PVOID;

    /// https://learn.microsoft.com/en-us/windows-hardware/drivers/ddi/wdm/nf-wdm-mmfreecontiguousmemory
    pub fn MmFreeContiguousMemory(BaseAddress: PVOID);

    /// https://learn.microsoft.com/en-us/windows-hardware/drivers/ddi/wdm/nf-wdm-mmgetsystemroutineaddress
    pub fn MmGetSystemRoutineAddress(SystemRoutineName: *mut UNICODE_STRING) -> PVOID;

    /// https://learn.microsoft.com/en-us/windows-hardware/drivers/ddi/wdm/nf-wdm-kequeryactiveprocessorcountex
    pub fn KeQueryActiveProcessorCountEx(GroupNumber: u16) -> u32;

    /// https://learn.microsoft.com/en-us/windows-hardware/drivers/ddi/ntddk/nf-ntddk-kegetcurrentprocessornumberex
    pub fn KeGetCurrentProcessorNumberEx(ProcNumber: *mut PROCESSOR_NUMBER) -> u32;

    /// https://learn.microsoft.com/en-us/windows-hardware/drivers/ddi/wdm/nf-wdm-kegetprocessornumberfromindex
    pub fn KeGetProcessorNumberFromIndex(ProcIndex: u32, ProcNumber: *mut PROCESSOR_NUMBER) -> NTSTATUS;

    /// https://learn.microsoft.com/en-us/windows-hardware/drivers/ddi/wdm/nf-wdm-kesetsystemgroupaffinitythread
    pub fn KeSetSystemGroupAffinityThread(Affinity: *mut GROUP_AFFINITY, PreviousAffinity: *mut GROUP_AFFINITY);

    /// https://learn.microsoft.com/en-us/windows-hardware/drivers/ddi/wdm/nf-wdm-kereverttousergroupaffinitythread
    pub fn KeRevertToUserGroupAffinityThread(PreviousAffinity: *mut GROUP_AFFINITY);

    /// Fans a DPC out to every logical processor and returns once each one has
    /// signalled completion.
    pub fn KeGenericCallDpc(Routine: PKDEFERRED_ROUTINE, Context: PVOID);

    /// Signals that the broadcast DPC on this processor has finished.
    pub fn KeSignalCallDpcDone(SystemArgument1: PVOID);

    /// Rendezvous with the other broadcast DPCs; returns non-zero on the last
    /// processor to arrive.
    pub fn KeSignalCallDpcSynchronize(SystemArgument2: PVOID) -> u32;

    pub fn KfRaiseIrql(NewIrql: KIRQL) -> KIRQL;

    pub fn KeLowerIrql(NewIrql: KIRQL);

    pub fn KeGetCurrentIrql() -> KIRQL;

    /// https://learn.microsoft.com/en-us/windows-hardware/drivers/ddi/ntddk/nf-ntddk-pslookupprocessbyprocessid
    pub fn PsLookupProcessByProcessId(ProcessId: HANDLE, Process: *mut PVOID) -> NTSTATUS;

    pub fn ObfDereferenceObject(Object: PVOID) -> isize;
}

/// Builds a counted `UNICODE_STRING` over a NUL-terminated UTF-16 buffer.
pub fn create_unicode_string(buffer: &[u16]) -> UNICODE_STRING {
    let len = buffer.len();
    let n = if len > 0 && buffer[len - 1] == 0 { len - 1 } else { len };

    UNICODE_STRING {
        Length: (n * 2) as u16,
        MaximumLength: (len * 2) as u16,
        Buffer: buffer.as_ptr(),
    }
}

/// Resolves an ntoskrnl export by name at runtime, for routines absent from
/// the import libraries.
pub fn system_routine_address(name: &str) -> PVOID {
    let wide = U16CString::from_str_truncate(name);
    let mut unicode = create_unicode_string(wide.as_slice_with_nul());
    unsafe { MmGetSystemRoutineAddress(&mut unicode) }
}

/// Raises the current processor to DISPATCH_LEVEL, returning the old IRQL.
///
/// `KeRaiseIrqlToDpcLevel` is not in the import libraries, so it is resolved
/// through `MmGetSystemRoutineAddress` the first time it is needed.
pub fn raise_irql_to_dpc_level() -> KIRQL {
    type FnKeRaiseIrqlToDpcLevel = unsafe extern "system" fn() -> KIRQL;

    let address = system_routine_address(obfstr::obfstr!("KeRaiseIrqlToDpcLevel"));
    let routine = unsafe { core::mem::transmute::<PVOID, FnKeRaiseIrqlToDpcLevel>(address) };

    unsafe { routine() }
}

pub fn lower_irql(old_irql: KIRQL) {
    unsafe { KeLowerIrql(old_irql) };
}

/// The number of active logical processors across all groups.
pub fn processor_count() -> u32 {
    unsafe { KeQueryActiveProcessorCountEx(ALL_PROCESSOR_GROUPS) }
}

/// The zero-based index of the current logical processor.
pub fn current_processor_index() -> u32 {
    unsafe { KeGetCurrentProcessorNumberEx(core::ptr::null_mut()) }
}
