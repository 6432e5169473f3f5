//! VM-entry event injection. Intel manual, Section 27.6.

use {
    crate::intel::{
        support::{vmread, vmwrite},
        vmerror::InterruptionType,
    },
    bit_field::BitField,
    x86::vmx::vmcs,
};

/// A queued event, delivered through the VM-entry interruption-information
/// field on the next entry of the owning core.
#[derive(Clone, Copy, Debug)]
pub struct PendingEvent {
    pub vector: u8,
    pub interruption_type: InterruptionType,
    pub error_code: Option<u32>,
}

pub struct EventInjection;

impl EventInjection {
    fn inject(vector: u8, interruption_type: InterruptionType, error_code: Option<u32>) {
        let mut information = 0u32;
        information.set_bits(0..8, vector as u32);
        information.set_bits(8..11, interruption_type as u32);
        information.set_bit(11, error_code.is_some());
        information.set_bit(31, true);

        if let Some(error_code) = error_code {
            vmwrite(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, error_code as u64);
        }

        vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, information as u64);
    }

    /// #GP(error_code) on the next entry.
    pub fn vmentry_inject_gp(error_code: u32) {
        Self::inject(13, InterruptionType::HardwareException, Some(error_code));
    }

    /// #PF with the faulting address already placed in guest CR2 by the
    /// caller.
    pub fn vmentry_inject_pf(error_code: u32) {
        Self::inject(14, InterruptionType::HardwareException, Some(error_code));
    }

    /// #BP, the software exception a breakpoint-style hook surfaces. The
    /// instruction length must reflect the INT3 being re-delivered.
    pub fn vmentry_inject_bp() {
        Self::inject(3, InterruptionType::SoftwareException, None);
        vmwrite(vmcs::control::VMENTRY_INSTRUCTION_LEN, 1u64);
    }

    /// #UD on the next entry.
    pub fn vmentry_inject_ud() {
        Self::inject(6, InterruptionType::HardwareException, None);
    }

    /// NMI on the next entry.
    pub fn vmentry_inject_nmi() {
        Self::inject(2, InterruptionType::NonMaskableInterrupt, None);
    }

    /// An external interrupt vector on the next entry.
    pub fn vmentry_inject_external_interrupt(vector: u8) {
        Self::inject(vector, InterruptionType::ExternalInterrupt, None);
    }

    /// Delivers an arbitrary queued event.
    pub fn vmentry_inject_pending(event: &PendingEvent) {
        Self::inject(event.vector, event.interruption_type, event.error_code);
    }

    /// Whether an injection is already staged for the next entry; at most one
    /// event can be delivered per entry.
    pub fn injection_pending() -> bool {
        vmread(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD).get_bit(31)
    }
}
