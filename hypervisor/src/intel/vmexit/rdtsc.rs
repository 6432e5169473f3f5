//! RDTSC/RDTSCP/RDPMC exits, used by the upper layers for timing-attack
//! instrumentation. Unconsumed exits reflect the native counter values.

use {
    crate::{
        callbacks,
        intel::{capture::GuestRegisters, support::rdtsc, vcpu::Vcpu, vmerror::VmxBasicExitReason, vmexit::ExitType},
    },
    core::arch::asm,
    x86::msr,
};

pub fn handle_rdtsc(vcpu: &mut Vcpu, registers: &mut GuestRegisters, reason: VmxBasicExitReason) -> ExitType {
    let consumed = callbacks::with_callbacks(|callbacks| {
        callbacks.rdtsc.map(|handler| handler(vcpu.index, registers)).unwrap_or(false)
    });

    if !consumed {
        let tsc = rdtsc();
        registers.rax = tsc & u32::MAX as u64;
        registers.rdx = tsc >> 32;

        if reason == VmxBasicExitReason::Rdtscp {
            registers.rcx = crate::intel::support::rdmsr(msr::IA32_TSC_AUX) & u32::MAX as u64;
        }
    }

    ExitType::IncrementRIP
}

pub fn handle_rdpmc(vcpu: &mut Vcpu, registers: &mut GuestRegisters) -> ExitType {
    let consumed = callbacks::with_callbacks(|callbacks| {
        callbacks.rdpmc.map(|handler| handler(vcpu.index, registers)).unwrap_or(false)
    });

    if !consumed {
        let counter = registers.rcx as u32;
        let low: u32;
        let high: u32;

        unsafe {
            asm!(
                "rdpmc",
                in("ecx") counter,
                out("eax") low,
                out("edx") high,
                options(nostack, nomem),
            );
        }

        registers.rax = low as u64;
        registers.rdx = high as u64;
    }

    ExitType::IncrementRIP
}
