//! The hypercall numbers shared between non-root callers and the VMX-root
//! handler. The numbers are a stable wire protocol; renumbering breaks the
//! non-root side of a live system.

use {num_derive::FromPrimitive, num_traits::FromPrimitive};

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u64)]
pub enum VmcallNumber {
    /// Round-trip test confirming the VM on this core is live.
    Test = 0x01,
    /// Devirtualize the current core.
    Vmxoff = 0x02,
    /// Flip a hooked page between its data and exec configurations, or apply
    /// a freshly installed hook's leaf state from root.
    ChangePageAttrib = 0x03,
    InveptSingleContext = 0x04,
    InveptAllContexts = 0x05,
    UnhookSinglePage = 0x06,
    UnhookAllPages = 0x07,
    InvvpidSingleAddress = 0x08,
    /// Notify the debugger side that a core reached a rendezvous point.
    SignalDebugger = 0x09,
    ChangeMsrBitmapRead = 0x0A,
    ChangeMsrBitmapWrite = 0x0B,
    ChangeIoBitmap = 0x0C,
    SetExceptionBitmap = 0x0D,
    UnsetExceptionBitmap = 0x0E,
    EnableMovToCr3Exiting = 0x0F,
    DisableMovToCr3Exiting = 0x10,
    EnableRdtscExiting = 0x11,
    DisableRdtscExiting = 0x12,
    EnableRdpmcExiting = 0x13,
    DisableRdpmcExiting = 0x14,
    EnableMovDrExiting = 0x15,
    DisableMovDrExiting = 0x16,
    EnableExternalInterruptExiting = 0x17,
    DisableExternalInterruptExiting = 0x18,
    EnableMovToCrExiting = 0x19,
    DisableMovToCrExiting = 0x1A,
    EnableEferSyscallHook = 0x1B,
    DisableEferSyscallHook = 0x1C,
    EnableDirtyLogging = 0x1D,
    DisableDirtyLogging = 0x1E,
    EnableModeBasedExec = 0x1F,
    DisableModeBasedExec = 0x20,
    EnablePreemptionTimer = 0x21,
    DisablePreemptionTimer = 0x22,
    InjectEvent = 0x23,
    EnableDescriptorTableExiting = 0x24,
    DisableDescriptorTableExiting = 0x25,
}

impl VmcallNumber {
    pub fn from_u64(value: u64) -> Option<Self> {
        <Self as FromPrimitive>::from_u64(value)
    }
}

/// Status returned in RAX by the root-side handler.
pub const VMCALL_STATUS_SUCCESS: u64 = 0;
pub const VMCALL_STATUS_UNSUCCESSFUL: u64 = 0xC000_0001;

/// Issues a hypercall from non-root and reports whether the root side
/// accepted it.
pub fn vmcall(number: VmcallNumber, arg1: u64, arg2: u64, arg3: u64) -> bool {
    unsafe { crate::intel::support::vmcall(number as u64, arg1, arg2, arg3) == VMCALL_STATUS_SUCCESS }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_numbers_are_stable() {
        assert_eq!(VmcallNumber::Test as u64, 0x01);
        assert_eq!(VmcallNumber::Vmxoff as u64, 0x02);
        assert_eq!(VmcallNumber::ChangePageAttrib as u64, 0x03);
        assert_eq!(VmcallNumber::InveptSingleContext as u64, 0x04);
        assert_eq!(VmcallNumber::InveptAllContexts as u64, 0x05);
        assert_eq!(VmcallNumber::InjectEvent as u64, 0x23);
    }

    #[test]
    fn unknown_numbers_do_not_decode() {
        assert_eq!(VmcallNumber::from_u64(0), None);
        assert_eq!(VmcallNumber::from_u64(0x99), None);
        assert_eq!(VmcallNumber::from_u64(0x09), Some(VmcallNumber::SignalDebugger));
    }
}
