//! INVEPT: invalidation of EPT-derived translations. Intel manual,
//! Section 31.3.

use core::arch::asm;

#[repr(u64)]
pub enum InveptType {
    SingleContext = 1,
    AllContexts = 2,
}

#[repr(C)]
struct InveptDescriptor {
    eptp: u64,
    reserved: u64,
}

fn invept(invalidation: InveptType, eptp: u64) {
    let descriptor = InveptDescriptor { eptp, reserved: 0 };

    unsafe {
        asm!(
            "invept {0}, [{1}]",
            in(reg) invalidation as u64,
            in(reg) &descriptor,
            options(nostack),
        );
    }
}

/// Invalidates translations derived from the given EPTP on this core.
pub fn invept_single_context(eptp: u64) {
    invept(InveptType::SingleContext, eptp);
}

/// Invalidates translations derived from any EPTP on this core.
pub fn invept_all_contexts() {
    invept(InveptType::AllContexts, 0);
}
