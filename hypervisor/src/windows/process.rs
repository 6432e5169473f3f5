//! Resolution of a process id to the CR3 of its address space, used when a
//! hook names a virtual address in a process other than System.

use {
    crate::{
        error::HypervisorError,
        windows::nt::{ObfDereferenceObject, PsLookupProcessByProcessId, STATUS_SUCCESS},
    },
    spin::Once,
};

/// Byte offset of `DirectoryTableBase` inside `KPROCESS`, stable across the
/// x64 kernels this driver targets.
const KPROCESS_DIRECTORY_TABLE_BASE: usize = 0x28;

/// CR3 of the System address space, captured while `DriverEntry` still runs in
/// the System process context. Host state is built from this, not from
/// whichever CR3 happens to be live when a core is virtualized.
static SYSTEM_CR3: Once<u64> = Once::new();

pub fn capture_system_cr3() {
    SYSTEM_CR3.call_once(crate::intel::support::cr3);
}

pub fn system_cr3() -> u64 {
    *SYSTEM_CR3.get().unwrap_or(&0)
}

/// Returns the CR3 of the process identified by `pid`; pid 0 selects the
/// System address space.
pub fn cr3_by_pid(pid: u64) -> Result<u64, HypervisorError> {
    if pid == 0 {
        return Ok(system_cr3());
    }

    let mut process: *mut core::ffi::c_void = core::ptr::null_mut();
    let status = unsafe { PsLookupProcessByProcessId(pid as _, &mut process) };

    if status != STATUS_SUCCESS || process.is_null() {
        return Err(HypervisorError::ProcessNotFound);
    }

    let cr3 = unsafe { *(process.cast::<u8>().add(KPROCESS_DIRECTORY_TABLE_BASE).cast::<u64>()) };
    unsafe { ObfDereferenceObject(process) };

    Ok(cr3)
}
