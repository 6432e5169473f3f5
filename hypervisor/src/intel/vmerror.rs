//! Decodings of the read-only VMCS exit-information fields: basic exit
//! reasons, VM-instruction errors, exit qualifications, and interruption
//! information.

use {
    bitfield::bitfield,
    num_derive::FromPrimitive,
    num_traits::FromPrimitive,
};

/// Basic exit reasons. Intel manual, Appendix C, Table C-1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum VmxBasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSystemManagementInterrupt = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    VmEntryFailureInvalidGuestState = 33,
    VmEntryFailureMsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    VmEntryFailureMachineCheckEvent = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    AccessToGdtrOrIdtr = 46,
    AccessToLdtrOrTr = 47,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    VmxPreemptionTimerExpired = 52,
    Invvpid = 53,
    WbinvdOrWbnoinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PageModificationLogFull = 62,
    Xsaves = 63,
    Xrstors = 64,
}

impl VmxBasicExitReason {
    pub fn from_u32(value: u32) -> Option<Self> {
        // Bits 15:0 carry the basic reason; the upper bits flag entry
        // failures and enclave/SMM modes.
        <Self as FromPrimitive>::from_u32(value & 0xFFFF)
    }
}

/// VM-instruction error numbers. Intel manual, Section 31.4.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum VmInstructionError {
    VmcallInVmxRoot = 1,
    VmclearInvalidAddress = 2,
    VmclearWithVmxonPointer = 3,
    VmlaunchNonClearVmcs = 4,
    VmresumeNonLaunchedVmcs = 5,
    VmresumeAfterVmxoff = 6,
    VmentryInvalidControlFields = 7,
    VmentryInvalidHostState = 8,
    VmptrldInvalidAddress = 9,
    VmptrldWithVmxonPointer = 10,
    VmptrldIncorrectRevision = 11,
    UnsupportedVmcsComponent = 12,
    VmwriteReadonlyComponent = 13,
    VmxonInVmxRoot = 15,
    VmentryInvalidExecutiveVmcsPointer = 16,
    VmentryNonLaunchedExecutiveVmcs = 17,
    VmentryExecutiveVmcsPointerNotVmxonPointer = 18,
    VmcallNonClearVmcs = 19,
    VmcallInvalidVmExitControlFields = 20,
    VmcallIncorrectMsegRevision = 22,
    VmxoffUnderDualMonitor = 23,
    VmcallInvalidSmmMonitorFeatures = 24,
    VmentryInvalidVmExecutionControlFieldsInExecutiveVmcs = 25,
    VmentryEventsBlockedByMovSs = 26,
    InvalidOperandToInveptInvvpid = 28,
}

impl VmInstructionError {
    pub fn from_u32(value: u32) -> Option<Self> {
        <Self as FromPrimitive>::from_u32(value)
    }
}

/// Interruption types used by both VM-entry injection and VM-exit
/// interruption information. Intel manual, Table 25-17.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}

/// Exception vectors this hypervisor distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum ExceptionVector {
    DivideError = 0,
    Debug = 1,
    Nmi = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtectionFault = 13,
    PageFault = 14,
}

bitfield! {
    /// VM-exit interruption information. Intel manual, Table 25-19.
    #[derive(Clone, Copy)]
    pub struct VmExitInterruptionInformation(u32);
    impl Debug;

    pub vector, _: 7, 0;
    pub interruption_type, _: 10, 8;
    pub error_code_valid, _: 11;
    pub nmi_unblocking_due_to_iret, _: 12;
    pub valid, _: 31;
}

bitfield! {
    /// Exit qualification for EPT violations. Intel manual, Table 28-7.
    #[derive(Clone, Copy)]
    pub struct EptViolationQualification(u64);
    impl Debug;

    pub read_access, _: 0;
    pub write_access, _: 1;
    pub execute_access, _: 2;
    pub readable, _: 3;
    pub writable, _: 4;
    pub executable, _: 5;
    pub guest_linear_address_valid, _: 7;
    pub caused_by_translation, _: 8;
}

bitfield! {
    /// Exit qualification for control-register accesses. Intel manual,
    /// Table 28-3.
    #[derive(Clone, Copy)]
    pub struct CrAccessQualification(u64);
    impl Debug;

    pub cr_number, _: 3, 0;
    pub access_type, _: 5, 4;
    pub lmsw_operand_type, _: 6;
    pub gpr_number, _: 11, 8;
    pub lmsw_source_data, _: 31, 16;
}

/// Access types of [`CrAccessQualification`].
pub const CR_ACCESS_MOV_TO_CR: u64 = 0;
pub const CR_ACCESS_MOV_FROM_CR: u64 = 1;

bitfield! {
    /// Exit qualification for I/O instructions. Intel manual, Table 28-5.
    #[derive(Clone, Copy)]
    pub struct IoQualification(u64);
    impl Debug;

    pub size_of_access, _: 2, 0;
    pub direction_in, _: 3;
    pub string_instruction, _: 4;
    pub rep_prefixed, _: 5;
    pub operand_immediate, _: 6;
    pub port, _: 31, 16;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_exit_reason_masks_high_bits() {
        // An entry-failure flag in bit 31 must not change the basic reason.
        assert_eq!(
            VmxBasicExitReason::from_u32(0x8000_0021),
            Some(VmxBasicExitReason::VmEntryFailureInvalidGuestState)
        );
        assert_eq!(VmxBasicExitReason::from_u32(48), Some(VmxBasicExitReason::EptViolation));
        assert_eq!(VmxBasicExitReason::from_u32(0xFFFF), None);
    }

    #[test]
    fn instruction_error_decodes_known_codes() {
        assert_eq!(
            VmInstructionError::from_u32(5),
            Some(VmInstructionError::VmresumeNonLaunchedVmcs)
        );
        assert_eq!(VmInstructionError::from_u32(14), None);
    }

    #[test]
    fn ept_violation_qualification_reports_access_kind() {
        // Write access to a leaf that is readable but not writable.
        let qualification = EptViolationQualification(0b0_1010);
        assert!(!qualification.read_access());
        assert!(qualification.write_access());
        assert!(!qualification.execute_access());
        assert!(qualification.readable());
        assert!(!qualification.writable());
    }

    #[test]
    fn cr_access_qualification_unpacks_mov_to_cr3() {
        // MOV CR3, R15: CR number 3, access type 0, GPR 15.
        let qualification = CrAccessQualification(0x0000_0F03);
        assert_eq!(qualification.cr_number(), 3);
        assert_eq!(qualification.access_type(), CR_ACCESS_MOV_TO_CR);
        assert_eq!(qualification.gpr_number(), 15);
    }

    #[test]
    fn interruption_information_unpacks_hardware_exception() {
        // #PF: valid, hardware exception, vector 14, error code valid.
        let info = VmExitInterruptionInformation(0x8000_0B0E);
        assert!(info.valid());
        assert_eq!(info.vector(), 14);
        assert_eq!(info.interruption_type(), 3);
        assert!(info.error_code_valid());
    }
}
