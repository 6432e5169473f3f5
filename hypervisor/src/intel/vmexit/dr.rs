//! MOV-DR exits: offered to the upper layer (hardware-breakpoint tracking),
//! then emulated so the debug registers behave architecturally.

use {
    crate::{
        callbacks,
        intel::{capture::GuestRegisters, support::vmread, vcpu::Vcpu, vmexit::ExitType},
    },
    bit_field::BitField,
    core::arch::asm,
    x86::vmx::vmcs::{guest, ro},
};

fn read_dr(index: u64) -> u64 {
    let value: u64;
    unsafe {
        match index {
            0 => asm!("mov {}, dr0", out(reg) value, options(nostack, nomem)),
            1 => asm!("mov {}, dr1", out(reg) value, options(nostack, nomem)),
            2 => asm!("mov {}, dr2", out(reg) value, options(nostack, nomem)),
            3 => asm!("mov {}, dr3", out(reg) value, options(nostack, nomem)),
            6 => asm!("mov {}, dr6", out(reg) value, options(nostack, nomem)),
            _ => return vmread(guest::DR7),
        }
    }
    value
}

fn write_dr(index: u64, value: u64) {
    unsafe {
        match index {
            0 => asm!("mov dr0, {}", in(reg) value, options(nostack, nomem)),
            1 => asm!("mov dr1, {}", in(reg) value, options(nostack, nomem)),
            2 => asm!("mov dr2, {}", in(reg) value, options(nostack, nomem)),
            3 => asm!("mov dr3, {}", in(reg) value, options(nostack, nomem)),
            6 => asm!("mov dr6, {}", in(reg) value, options(nostack, nomem)),
            _ => crate::intel::support::vmwrite(guest::DR7, value),
        }
    }
}

pub fn handle_mov_dr(vcpu: &mut Vcpu, registers: &mut GuestRegisters) -> ExitType {
    let consumed = callbacks::with_callbacks(|callbacks| {
        callbacks.mov_dr.map(|handler| handler(vcpu.index, registers)).unwrap_or(false)
    });

    if consumed {
        return ExitType::IncrementRIP;
    }

    // Exit qualification for MOV DR. Intel manual, Table 28-4.
    let qualification = vmread(ro::EXIT_QUALIFICATION);
    let dr = qualification.get_bits(0..3);
    let to_dr = !qualification.get_bit(4);
    let gpr = qualification.get_bits(8..12);

    if to_dr {
        write_dr(dr, registers.gpr(gpr));
    } else {
        registers.set_gpr(gpr, read_dr(dr));
    }

    ExitType::IncrementRIP
}
