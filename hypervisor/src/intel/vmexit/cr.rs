//! Control-register access exits: decode the qualification, honor the
//! context-switch detector on CR3 writes, and reflect the access so the
//! guest observes architectural behavior.

use {
    crate::{
        callbacks,
        intel::{
            capture::GuestRegisters,
            invvpid::invvpid_single_context,
            support::{vmread, vmwrite},
            vcpu::Vcpu,
            vmcs::VPID_TAG,
            vmerror::{CrAccessQualification, CR_ACCESS_MOV_FROM_CR, CR_ACCESS_MOV_TO_CR},
            vmexit::ExitType,
        },
    },
    log::*,
    x86::vmx::vmcs::{control, guest, ro},
};

/// CR3 bit 63 requests that no TLB flush accompany the load.
const CR3_NO_FLUSH_BIT: u64 = 1 << 63;

pub fn handle_cr_access(vcpu: &mut Vcpu, registers: &mut GuestRegisters) -> ExitType {
    let qualification = CrAccessQualification(vmread(ro::EXIT_QUALIFICATION));
    let cr = qualification.cr_number() as u8;
    let gpr = qualification.gpr_number();

    match qualification.access_type() {
        CR_ACCESS_MOV_TO_CR => {
            let value = registers.gpr(gpr);

            callbacks::with_callbacks(|callbacks| {
                if let Some(handler) = callbacks.cr_access {
                    handler(vcpu.index, cr, true, value);
                }
            });

            match cr {
                0 => {
                    vmwrite(guest::CR0, value);
                    vmwrite(control::CR0_READ_SHADOW, value);
                }
                3 => {
                    if vcpu.mov_to_cr3_exiting {
                        callbacks::with_callbacks(|callbacks| {
                            if let Some(handler) = callbacks.context_switch {
                                handler(vcpu.index, value & !CR3_NO_FLUSH_BIT);
                            }
                        });
                    }

                    vmwrite(guest::CR3, value & !CR3_NO_FLUSH_BIT);
                    if value & CR3_NO_FLUSH_BIT == 0 {
                        invvpid_single_context(VPID_TAG);
                    }
                }
                4 => {
                    vmwrite(guest::CR4, value);
                    vmwrite(control::CR4_READ_SHADOW, value);
                }
                unexpected => warn!("Unexpected MOV to CR{} exit", unexpected),
            }
        }
        CR_ACCESS_MOV_FROM_CR => {
            let value = match cr {
                0 => vmread(guest::CR0),
                3 => vmread(guest::CR3),
                4 => vmread(guest::CR4),
                unexpected => {
                    warn!("Unexpected MOV from CR{} exit", unexpected);
                    0
                }
            };

            callbacks::with_callbacks(|callbacks| {
                if let Some(handler) = callbacks.cr_access {
                    handler(vcpu.index, cr, false, value);
                }
            });

            registers.set_gpr(gpr, value);
            if gpr == 4 {
                vmwrite(guest::RSP, value);
            }
        }
        unexpected => warn!("Unhandled CR access type {}", unexpected),
    }

    ExitType::IncrementRIP
}
