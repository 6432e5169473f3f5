//! The VMXON region and the steps that bring a core into VMX operation.
//! Intel manual, Section 24.11.5 and Section 24.7 "Enabling and Entering VMX
//! Operation".

use {
    crate::{error::HypervisorError, intel::support::{cr0, cr0_write, cr4, cr4_write, rdmsr, wrmsr}},
    bit_field::BitField,
    derivative::Derivative,
    x86::{controlregs, msr},
};

/// The 4-KByte naturally aligned VMXON region.
#[repr(C, align(4096))]
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Vmxon {
    pub revision_id: u32,
    #[derivative(Debug = "ignore")]
    pub data: [u8; 4092],
}

static_assertions::const_assert_eq!(core::mem::size_of::<Vmxon>(), 4096);

impl Vmxon {
    /// Stamps the region with the VMCS revision identifier from
    /// IA32_VMX_BASIC, bit 31 cleared.
    pub fn init(&mut self) {
        self.revision_id = Self::revision_id();
        self.revision_id.set_bit(31, false);
    }

    pub fn revision_id() -> u32 {
        rdmsr(msr::IA32_VMX_BASIC) as u32 & 0x7FFF_FFFF
    }

    /// Sets CR4.VMXE so VMXON is no longer #UD.
    pub fn enable_vmx_operation() {
        let mut cr4 = unsafe { controlregs::cr4() };
        cr4.set(controlregs::Cr4::CR4_ENABLE_VMX, true);
        unsafe { controlregs::cr4_write(cr4) };
    }

    /// Clears CR4.VMXE after VMXOFF during teardown.
    pub fn disable_vmx_operation() {
        let mut cr4 = unsafe { controlregs::cr4() };
        cr4.set(controlregs::Cr4::CR4_ENABLE_VMX, false);
        unsafe { controlregs::cr4_write(cr4) };
    }

    /// Validates IA32_FEATURE_CONTROL, setting the lock and
    /// VMXON-outside-SMX bits if the firmware left the MSR unlocked.
    pub fn adjust_feature_control_msr() -> Result<(), HypervisorError> {
        const VMX_LOCK_BIT: u64 = 1 << 0;
        const VMXON_OUTSIDE_SMX: u64 = 1 << 2;

        let feature_control = rdmsr(msr::IA32_FEATURE_CONTROL);

        if feature_control & VMX_LOCK_BIT == 0 {
            wrmsr(msr::IA32_FEATURE_CONTROL, feature_control | VMXON_OUTSIDE_SMX | VMX_LOCK_BIT);
        } else if feature_control & VMXON_OUTSIDE_SMX == 0 {
            return Err(HypervisorError::VmxBiosLock);
        }

        Ok(())
    }

    /// Forces the CR0 bits fixed by IA32_VMX_CR0_FIXED0/FIXED1.
    pub fn set_cr0_bits() {
        let fixed0 = rdmsr(msr::IA32_VMX_CR0_FIXED0);
        let fixed1 = rdmsr(msr::IA32_VMX_CR0_FIXED1);

        cr0_write((cr0() | fixed0) & fixed1);
    }

    /// Forces the CR4 bits fixed by IA32_VMX_CR4_FIXED0/FIXED1.
    pub fn set_cr4_bits() {
        let fixed0 = rdmsr(msr::IA32_VMX_CR4_FIXED0);
        let fixed1 = rdmsr(msr::IA32_VMX_CR4_FIXED1);

        cr4_write((cr4() | fixed0) & fixed1);
    }

    /// Checks CPUID.1:ECX[5] for VMX support on a GenuineIntel part.
    pub fn check_vmx_support() -> Result<(), HypervisorError> {
        let cpuid = x86::cpuid::CpuId::new();

        match cpuid.get_vendor_info() {
            Some(vendor) if vendor.as_str() == "GenuineIntel" => {}
            _ => return Err(HypervisorError::CpuUnsupported),
        }

        match cpuid.get_feature_info() {
            Some(features) if features.has_vmx() => Ok(()),
            _ => Err(HypervisorError::VmxUnsupported),
        }
    }
}
