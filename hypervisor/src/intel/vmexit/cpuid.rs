//! CPUID exits: offer the leaf to the upper layer first, else execute the
//! instruction natively in VMX root and hand the guest the real values, with
//! the hypervisor kept out of the feature bits it could leak through.

use {
    crate::{
        callbacks::{self, CpuidResult},
        intel::{capture::GuestRegisters, vcpu::Vcpu, vmexit::ExitType},
    },
    log::*,
};

/// CPUID.1:ECX bit 5, the VMX capability the guest must not lose when the
/// debugger is not masking it, and bit 31, the reserved hypervisor-present
/// bit this hypervisor never advertises.
const FEATURE_HYPERVISOR_PRESENT_BIT: u32 = 1 << 31;

pub fn handle_cpuid(_vcpu: &mut Vcpu, registers: &mut GuestRegisters) -> ExitType {
    let leaf = registers.rax as u32;
    let subleaf = registers.rcx as u32;

    let native = x86::cpuid::cpuid!(leaf, subleaf);
    let mut result = CpuidResult {
        eax: native.eax,
        ebx: native.ebx,
        ecx: native.ecx,
        edx: native.edx,
    };

    if leaf == 1 {
        // Never surface the hypervisor-present bit.
        result.ecx &= !FEATURE_HYPERVISOR_PRESENT_BIT;
    }

    let consumed = callbacks::with_callbacks(|callbacks| {
        callbacks.cpuid.map(|handler| handler(leaf, subleaf, &mut result)).unwrap_or(false)
    });

    if consumed {
        trace!("CPUID {:#x}/{:#x} rewritten by upper layer", leaf, subleaf);
    }

    registers.rax = result.eax as u64;
    registers.rbx = result.ebx as u64;
    registers.rcx = result.ecx as u64;
    registers.rdx = result.edx as u64;

    ExitType::IncrementRIP
}
