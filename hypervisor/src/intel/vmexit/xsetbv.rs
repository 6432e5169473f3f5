//! XSETBV exits unconditionally; validate the requested XCR0 against the
//! machine's supported mask and reflect it, injecting #GP for values the
//! hardware would reject.

use {
    crate::intel::{capture::GuestRegisters, events::EventInjection, vcpu::Vcpu, vmexit::ExitType},
    log::*,
    x86_64::registers::xcontrol::XCr0,
};

/// XCR0 bit 0 (x87) is architecturally required to be set.
const XCR0_X87: u64 = 1 << 0;

pub fn handle_xsetbv(vcpu: &mut Vcpu, registers: &mut GuestRegisters) -> ExitType {
    let index = registers.rcx as u32;
    let value = (registers.rdx << 32) | (registers.rax & u32::MAX as u64);

    // Only XCR0 exists; anything else is #GP.
    if index != 0 {
        EventInjection::vmentry_inject_gp(0);
        return ExitType::Continue;
    }

    let supported = {
        let extended_state = x86::cpuid::cpuid!(0x0D, 0x00);
        ((extended_state.edx as u64) << 32) | extended_state.eax as u64
    };

    if value & !supported != 0 || value & XCR0_X87 == 0 {
        trace!("Rejecting XSETBV value {:#x} on core {}", value, vcpu.index);
        EventInjection::vmentry_inject_gp(0);
        return ExitType::Continue;
    }

    unsafe { XCr0::write_raw(value) };

    ExitType::IncrementRIP
}
