//! Construction of the VMCS: guest state mirroring the interrupted context,
//! host state targeting the VM-exit trampoline on the dedicated VMM stack,
//! and execution controls adjusted against their capability MSRs.
//!
//! Intel manual: 25.4 Guest-State Area, 25.5 Host-State Area, 25.6-25.8
//! VM-Execution/VM-Exit/VM-Entry Control Fields.

use {
    crate::{
        error::HypervisorError,
        intel::{
            capture::GuestRegisters,
            descriptor::{current_gdt, system_segment_base, unpack_gdt_entry},
            support::{cr0, cr3, cr4, rdmsr, sgdt, sidt, vmread, vmwrite},
            vmlaunch::vmexit_stub,
        },
    },
    bit_field::BitField,
    derivative::Derivative,
    log::*,
    x86::{
        dtables, msr,
        segmentation,
        task,
        vmx::vmcs::{self, control::{EntryControls, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls}, guest, host},
    },
};

/// The shared VPID tag: every core uses 1, and every EPT mutation is chased
/// with an INVEPT, so per-core tags buy nothing.
pub const VPID_TAG: u16 = 1;

/// The 4-KByte naturally aligned VMCS region.
#[repr(C, align(4096))]
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Vmcs {
    pub revision_id: u32,
    pub abort_indicator: u32,
    #[derivative(Debug = "ignore")]
    pub data: [u8; 4088],
}

static_assertions::const_assert_eq!(core::mem::size_of::<Vmcs>(), 4096);

impl Vmcs {
    pub fn init(&mut self) {
        self.revision_id = super::vmxon::Vmxon::revision_id();
        self.revision_id.set_bit(31, false);
    }

    /// Writes the guest-state area from the captured register context, so
    /// that the first VM entry resumes exactly where `capture_registers`
    /// returned.
    #[rustfmt::skip]
    pub fn setup_guest_registers_state(registers: &GuestRegisters) {
        let gdt = current_gdt();

        let mut guest_gdtr = dtables::DescriptorTablePointer::<u64>::default();
        unsafe { dtables::sgdt(&mut guest_gdtr) };
        let mut guest_idtr = dtables::DescriptorTablePointer::<u64>::default();
        unsafe { dtables::sidt(&mut guest_idtr) };

        let ldtr = unsafe { dtables::ldtr() };
        let tr = unsafe { task::tr() };

        vmwrite(guest::CR0, cr0());
        vmwrite(guest::CR3, cr3());
        vmwrite(guest::CR4, cr4());

        vmwrite(guest::DR7, 0x400u64);

        vmwrite(guest::RSP, registers.rsp);
        vmwrite(guest::RIP, registers.rip);
        vmwrite(guest::RFLAGS, registers.rflags);

        let cs = segmentation::cs();
        let ss = segmentation::ss();
        let ds = segmentation::ds();
        let es = segmentation::es();
        let fs = segmentation::fs();
        let gs = segmentation::gs();

        vmwrite(guest::CS_SELECTOR, cs.bits());
        vmwrite(guest::SS_SELECTOR, ss.bits());
        vmwrite(guest::DS_SELECTOR, ds.bits());
        vmwrite(guest::ES_SELECTOR, es.bits());
        vmwrite(guest::FS_SELECTOR, fs.bits());
        vmwrite(guest::GS_SELECTOR, gs.bits());
        vmwrite(guest::LDTR_SELECTOR, ldtr.bits());
        vmwrite(guest::TR_SELECTOR, tr.bits());

        vmwrite(guest::CS_BASE, unpack_gdt_entry(gdt, cs.bits()).base);
        vmwrite(guest::SS_BASE, unpack_gdt_entry(gdt, ss.bits()).base);
        vmwrite(guest::DS_BASE, unpack_gdt_entry(gdt, ds.bits()).base);
        vmwrite(guest::ES_BASE, unpack_gdt_entry(gdt, es.bits()).base);
        vmwrite(guest::FS_BASE, rdmsr(msr::IA32_FS_BASE));
        vmwrite(guest::GS_BASE, rdmsr(msr::IA32_GS_BASE));
        vmwrite(guest::LDTR_BASE, unpack_gdt_entry(gdt, ldtr.bits()).base);
        vmwrite(guest::TR_BASE, system_segment_base(gdt, tr.bits()));

        vmwrite(guest::CS_LIMIT, unpack_gdt_entry(gdt, cs.bits()).scaled_limit());
        vmwrite(guest::SS_LIMIT, unpack_gdt_entry(gdt, ss.bits()).scaled_limit());
        vmwrite(guest::DS_LIMIT, unpack_gdt_entry(gdt, ds.bits()).scaled_limit());
        vmwrite(guest::ES_LIMIT, unpack_gdt_entry(gdt, es.bits()).scaled_limit());
        vmwrite(guest::FS_LIMIT, unpack_gdt_entry(gdt, fs.bits()).scaled_limit());
        vmwrite(guest::GS_LIMIT, unpack_gdt_entry(gdt, gs.bits()).scaled_limit());
        vmwrite(guest::LDTR_LIMIT, unpack_gdt_entry(gdt, ldtr.bits()).scaled_limit());
        vmwrite(guest::TR_LIMIT, unpack_gdt_entry(gdt, tr.bits()).scaled_limit());

        vmwrite(guest::CS_ACCESS_RIGHTS, unpack_gdt_entry(gdt, cs.bits()).access_rights);
        vmwrite(guest::SS_ACCESS_RIGHTS, unpack_gdt_entry(gdt, ss.bits()).access_rights);
        vmwrite(guest::DS_ACCESS_RIGHTS, unpack_gdt_entry(gdt, ds.bits()).access_rights);
        vmwrite(guest::ES_ACCESS_RIGHTS, unpack_gdt_entry(gdt, es.bits()).access_rights);
        vmwrite(guest::FS_ACCESS_RIGHTS, unpack_gdt_entry(gdt, fs.bits()).access_rights);
        vmwrite(guest::GS_ACCESS_RIGHTS, unpack_gdt_entry(gdt, gs.bits()).access_rights);
        vmwrite(guest::LDTR_ACCESS_RIGHTS, unpack_gdt_entry(gdt, ldtr.bits()).access_rights);
        vmwrite(guest::TR_ACCESS_RIGHTS, unpack_gdt_entry(gdt, tr.bits()).access_rights);

        vmwrite(guest::GDTR_BASE, guest_gdtr.base as u64);
        vmwrite(guest::IDTR_BASE, guest_idtr.base as u64);
        vmwrite(guest::GDTR_LIMIT, guest_gdtr.limit);
        vmwrite(guest::IDTR_LIMIT, guest_idtr.limit);

        vmwrite(guest::IA32_DEBUGCTL_FULL, rdmsr(msr::IA32_DEBUGCTL));
        vmwrite(guest::IA32_SYSENTER_CS, rdmsr(msr::IA32_SYSENTER_CS));
        vmwrite(guest::IA32_SYSENTER_ESP, rdmsr(msr::IA32_SYSENTER_ESP));
        vmwrite(guest::IA32_SYSENTER_EIP, rdmsr(msr::IA32_SYSENTER_EIP));
        vmwrite(guest::IA32_EFER_FULL, rdmsr(msr::IA32_EFER));
        vmwrite(guest::LINK_PTR_FULL, u64::MAX);
    }

    /// Writes the host-state area: the trampoline entry point on the VMM
    /// stack and the System address space, not whichever CR3 happens to be
    /// live while the core virtualizes itself.
    #[rustfmt::skip]
    pub fn setup_host_registers_state(host_rsp: u64, system_cr3: u64) -> Result<(), HypervisorError> {
        const SELECTOR_MASK: u16 = 0xF8;

        let gdt = current_gdt();
        let gdtr = sgdt();
        let idtr = sidt();
        let tr = unsafe { task::tr() };

        vmwrite(host::CR0, cr0());
        vmwrite(host::CR3, system_cr3);
        vmwrite(host::CR4, cr4());

        debug_assert!(host_rsp % 16 == 0);
        vmwrite(host::RSP, host_rsp);
        vmwrite(host::RIP, vmexit_stub as usize as u64);

        vmwrite(host::CS_SELECTOR, segmentation::cs().bits() & SELECTOR_MASK);
        vmwrite(host::SS_SELECTOR, segmentation::ss().bits() & SELECTOR_MASK);
        vmwrite(host::DS_SELECTOR, segmentation::ds().bits() & SELECTOR_MASK);
        vmwrite(host::ES_SELECTOR, segmentation::es().bits() & SELECTOR_MASK);
        vmwrite(host::FS_SELECTOR, segmentation::fs().bits() & SELECTOR_MASK);
        vmwrite(host::GS_SELECTOR, segmentation::gs().bits() & SELECTOR_MASK);
        vmwrite(host::TR_SELECTOR, tr.bits() & SELECTOR_MASK);

        vmwrite(host::FS_BASE, rdmsr(msr::IA32_FS_BASE));
        vmwrite(host::GS_BASE, rdmsr(msr::IA32_GS_BASE));
        vmwrite(host::TR_BASE, system_segment_base(gdt, tr.bits()));
        vmwrite(host::GDTR_BASE, gdtr.base as u64);
        vmwrite(host::IDTR_BASE, idtr.base as u64);

        vmwrite(host::IA32_SYSENTER_CS, rdmsr(msr::IA32_SYSENTER_CS));
        vmwrite(host::IA32_SYSENTER_ESP, rdmsr(msr::IA32_SYSENTER_ESP));
        vmwrite(host::IA32_SYSENTER_EIP, rdmsr(msr::IA32_SYSENTER_EIP));
        vmwrite(host::IA32_EFER_FULL, rdmsr(msr::IA32_EFER));

        Ok(())
    }

    /// Writes the execution, entry, and exit controls, the bitmap and EPTP
    /// pointers, and the VPID tag. Nothing intercepts until an upper layer
    /// asks for it.
    #[rustfmt::skip]
    pub fn setup_vmcs_control_fields(eptp: u64, msr_bitmap_pa: u64, io_bitmap_a_pa: u64, io_bitmap_b_pa: u64) -> Result<(), HypervisorError> {
        const PRIMARY_CTL: u64 = (PrimaryControls::SECONDARY_CONTROLS.bits()
            | PrimaryControls::USE_MSR_BITMAPS.bits()
            | PrimaryControls::USE_IO_BITMAPS.bits()) as u64;
        const SECONDARY_CTL: u64 = (SecondaryControls::ENABLE_EPT.bits()
            | SecondaryControls::ENABLE_VPID.bits()
            | SecondaryControls::ENABLE_RDTSCP.bits()
            | SecondaryControls::ENABLE_INVPCID.bits()
            | SecondaryControls::ENABLE_XSAVES_XRSTORS.bits()) as u64;
        const ENTRY_CTL: u64 = (EntryControls::IA32E_MODE_GUEST.bits()
            | EntryControls::LOAD_IA32_EFER.bits()) as u64;
        const EXIT_CTL: u64 = (ExitControls::HOST_ADDRESS_SPACE_SIZE.bits()
            | ExitControls::SAVE_IA32_EFER.bits()
            | ExitControls::LOAD_IA32_EFER.bits()) as u64;
        const PINBASED_CTL: u64 = PinbasedControls::empty().bits() as u64;

        vmwrite(vmcs::control::PINBASED_EXEC_CONTROLS, adjust_vmx_controls(VmxControl::PinBased, PINBASED_CTL));
        vmwrite(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, adjust_vmx_controls(VmxControl::ProcessorBased, PRIMARY_CTL));
        vmwrite(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, adjust_vmx_controls(VmxControl::ProcessorBased2, SECONDARY_CTL));
        vmwrite(vmcs::control::VMENTRY_CONTROLS, adjust_vmx_controls(VmxControl::VmEntry, ENTRY_CTL));
        vmwrite(vmcs::control::VMEXIT_CONTROLS, adjust_vmx_controls(VmxControl::VmExit, EXIT_CTL));

        // Guest/host masks stay zero until a CR intercept is installed; the
        // read shadows mirror the live values so guest reads stay unchanged.
        vmwrite(vmcs::control::CR0_GUEST_HOST_MASK, 0u64);
        vmwrite(vmcs::control::CR4_GUEST_HOST_MASK, 0u64);
        vmwrite(vmcs::control::CR0_READ_SHADOW, cr0());
        vmwrite(vmcs::control::CR4_READ_SHADOW, cr4());
        vmwrite(vmcs::control::CR3_TARGET_COUNT, 0u64);

        vmwrite(vmcs::control::MSR_BITMAPS_ADDR_FULL, msr_bitmap_pa);
        vmwrite(vmcs::control::IO_BITMAP_A_ADDR_FULL, io_bitmap_a_pa);
        vmwrite(vmcs::control::IO_BITMAP_B_ADDR_FULL, io_bitmap_b_pa);
        vmwrite(vmcs::control::EXCEPTION_BITMAP, 0u64);

        vmwrite(vmcs::control::EPTP_FULL, eptp);
        vmwrite(vmcs::control::VPID, VPID_TAG);

        trace!("VMCS control fields written; EPTP = {:#x}", eptp);

        Ok(())
    }

    /// Dumps a handful of fields when a launch fails.
    pub fn debug_dump() {
        error!("Guest RIP: {:#x}", vmread(guest::RIP));
        error!("Guest RSP: {:#x}", vmread(guest::RSP));
        error!("Guest CR3: {:#x}", vmread(guest::CR3));
        error!("Host RIP: {:#x}", vmread(host::RIP));
        error!("Host RSP: {:#x}", vmread(host::RSP));
        error!("Host CR3: {:#x}", vmread(host::CR3));
    }
}

/// The control-field families adjustable against capability MSRs.
#[derive(Clone, Copy)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

/// Adjusts requested control bits against the allowed-0/allowed-1 settings
/// the capability MSR reports, honoring the TRUE_* variants when
/// IA32_VMX_BASIC advertises them.
pub fn adjust_vmx_controls(control: VmxControl, requested_value: u64) -> u64 {
    const IA32_VMX_BASIC_TRUE_CONTROLS_FLAG: u64 = 1 << 55;

    let vmx_basic = rdmsr(msr::IA32_VMX_BASIC);
    let true_controls = (vmx_basic & IA32_VMX_BASIC_TRUE_CONTROLS_FLAG) != 0;

    let capability_msr = match (control, true_controls) {
        (VmxControl::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
        (VmxControl::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (VmxControl::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
        // There is no TRUE variant for the secondary controls.
        (VmxControl::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
    };

    adjust_value(rdmsr(capability_msr), requested_value)
}

/// Applies an allowed-0/allowed-1 capability word to a requested value.
fn adjust_value(capabilities: u64, requested_value: u64) -> u64 {
    let allowed0 = capabilities as u32;
    let allowed1 = (capabilities >> 32) as u32;

    let mut effective = requested_value as u32;
    effective |= allowed0;
    effective &= allowed1;

    u64::from(effective)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_value_forces_allowed0_and_masks_allowed1() {
        // allowed0 = bit 1 must be set; allowed1 = only bits 0..4 may be set.
        let capabilities = (0x1Fu64 << 32) | 0x2;

        assert_eq!(adjust_value(capabilities, 0), 0x2);
        assert_eq!(adjust_value(capabilities, 0x20), 0x2);
        assert_eq!(adjust_value(capabilities, 0x5), 0x7);
    }

    #[test]
    fn adjust_value_keeps_requested_bits_inside_the_window() {
        let capabilities = 0xFFFF_FFFFu64 << 32;
        assert_eq!(adjust_value(capabilities, 0x8000_0001), 0x8000_0001);
    }
}
