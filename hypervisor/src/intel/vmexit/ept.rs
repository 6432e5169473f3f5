//! EPT-violation exits: every legitimate one belongs to a hooked page and is
//! resolved by flipping its data/exec configuration. Anything else means the
//! identity map is wrong, which is a bug, not a guest condition.

use {
    crate::intel::{
        capture::GuestRegisters,
        events::EventInjection,
        shared,
        support::vmread,
        vcpu::Vcpu,
        vmerror::EptViolationQualification,
        vmexit::ExitType,
    },
    log::*,
    x86::vmx::vmcs::ro,
};

pub fn handle_ept_violation(vcpu: &mut Vcpu, registers: &mut GuestRegisters) -> ExitType {
    let guest_pa = vmread(ro::GUEST_PHYSICAL_ADDR_FULL);
    let qualification = EptViolationQualification(vmread(ro::EXIT_QUALIFICATION));
    let guest_va = if qualification.guest_linear_address_valid() {
        vmread(ro::GUEST_LINEAR_ADDR)
    } else {
        0
    };

    trace!(
        "EPT violation on core {}: PA {:#x}, qualification {:?}",
        vcpu.index,
        guest_pa,
        qualification
    );

    let handled = shared::with_hook_manager(|hook_manager| {
        hook_manager.handle_hooked_page(vcpu, registers, guest_pa, guest_va, qualification)
    });

    match handled {
        Ok(true) => {}
        Ok(false) => {
            // Not a hooked page: the identity map does not produce
            // violations on its own.
            error!("EPT violation outside any hooked page: PA {:#x}", guest_pa);
            EventInjection::vmentry_inject_gp(0);
        }
        Err(error) => {
            error!("EPT violation handling failed: {:?}", error);
            EventInjection::vmentry_inject_gp(0);
        }
    }

    // Fault-class exit: the guest re-executes the faulting instruction.
    ExitType::Continue
}
