//! RDMSR/WRMSR exits. Accesses are gated by the per-core MSR bitmap; an
//! intercepted MSR is first offered to the upper layer and performed natively
//! when not consumed. Reserved and synthetic ranges draw #GP the way bare
//! hardware would, which also satisfies the integrity checks some guests run
//! against their MSR surface.

use {
    crate::{
        callbacks,
        intel::{
            bitmap::MsrAccessType,
            capture::GuestRegisters,
            events::EventInjection,
            support::{rdmsr, wrmsr},
            vcpu::Vcpu,
            vmexit::ExitType,
        },
    },
    core::ops::RangeInclusive,
    log::*,
};

/// The architectural MSR ranges; everything else is reserved, except the
/// synthetic range Hyper-V claims.
const MSR_VALID_RANGE_LOW: RangeInclusive<u32> = 0x0000_0000..=0x0000_1FFF;
const MSR_VALID_RANGE_HIGH: RangeInclusive<u32> = 0xC000_0000..=0xC000_1FFF;
const MSR_HYPERV_RANGE: RangeInclusive<u32> = 0x4000_0000..=0x4000_00FF;

const MSR_MASK_LOW: u64 = u32::MAX as u64;

pub fn handle_msr_access(vcpu: &mut Vcpu, registers: &mut GuestRegisters, access_type: MsrAccessType) -> ExitType {
    let msr_id = registers.rcx as u32;
    let msr_value = (registers.rdx << 32) | (registers.rax & MSR_MASK_LOW);

    trace!("MSR access on core {}: {:#x}", vcpu.index, msr_id);

    // On VMware-nested deployments the Hyper-V synthetic range must stay
    // accessible or the outer hypervisor's enlightenments break.
    #[cfg(feature = "vmware")]
    if !MSR_VALID_RANGE_LOW.contains(&msr_id) && !MSR_VALID_RANGE_HIGH.contains(&msr_id) && MSR_HYPERV_RANGE.contains(&msr_id) {
        trace!("Invalid MSR access attempted: {:#x}", msr_id);
        EventInjection::vmentry_inject_gp(0);
        return ExitType::Continue;
    }

    #[cfg(not(feature = "vmware"))]
    if !(MSR_VALID_RANGE_LOW.contains(&msr_id) || MSR_VALID_RANGE_HIGH.contains(&msr_id)) || MSR_HYPERV_RANGE.contains(&msr_id) {
        trace!("Invalid MSR access attempted: {:#x}", msr_id);
        EventInjection::vmentry_inject_gp(0);
        return ExitType::Continue;
    }

    match access_type {
        MsrAccessType::Read => {
            let mut value = rdmsr(msr_id);

            let consumed = callbacks::with_callbacks(|callbacks| {
                callbacks.msr_read.map(|handler| handler(msr_id, &mut value)).unwrap_or(false)
            });
            if consumed {
                trace!("MSR read {:#x} rewritten by upper layer", msr_id);
            }

            registers.rax = value & MSR_MASK_LOW;
            registers.rdx = value >> 32;
        }
        MsrAccessType::Write => {
            let consumed = callbacks::with_callbacks(|callbacks| {
                callbacks.msr_write.map(|handler| handler(msr_id, msr_value)).unwrap_or(false)
            });

            if !consumed {
                wrmsr(msr_id, msr_value);
            }
        }
    }

    ExitType::IncrementRIP
}
