//! I/O-instruction exits, gated by the per-core I/O bitmaps: offered to the
//! upper layer first, executed natively otherwise. String and REP forms are
//! left to the upper layer; the core emulates the plain register forms.

use {
    crate::{
        callbacks,
        intel::{
            capture::GuestRegisters,
            support::vmread,
            vcpu::Vcpu,
            vmerror::IoQualification,
            vmexit::ExitType,
        },
    },
    log::*,
    x86::{io, vmx::vmcs::ro},
};

pub fn handle_io(vcpu: &mut Vcpu, registers: &mut GuestRegisters) -> ExitType {
    let qualification = IoQualification(vmread(ro::EXIT_QUALIFICATION));
    let port = qualification.port() as u16;
    let input = qualification.direction_in();

    let consumed = callbacks::with_callbacks(|callbacks| {
        callbacks.io_access.map(|handler| handler(port, input, registers)).unwrap_or(false)
    });

    if consumed {
        return ExitType::IncrementRIP;
    }

    if qualification.string_instruction() || qualification.rep_prefixed() {
        // The register forms below cannot express INS/OUTS semantics; the
        // upper layer is expected to consume these when it intercepts a
        // port that sees them.
        warn!("Unconsumed string I/O on port {:#x}", port);
        return ExitType::IncrementRIP;
    }

    // Access size is the encoded size plus one byte.
    let size = qualification.size_of_access() + 1;

    unsafe {
        match (input, size) {
            (true, 1) => registers.rax = (registers.rax & !0xFF) | io::inb(port) as u64,
            (true, 2) => registers.rax = (registers.rax & !0xFFFF) | io::inw(port) as u64,
            (true, _) => registers.rax = io::inl(port) as u64,
            (false, 1) => io::outb(port, registers.rax as u8),
            (false, 2) => io::outw(port, registers.rax as u16),
            (false, _) => io::outl(port, registers.rax as u32),
        }
    }

    trace!("Core {} reflected {} on port {:#x}", vcpu.index, if input { "IN" } else { "OUT" }, port);

    ExitType::IncrementRIP
}
