//! INVVPID: invalidation of VPID-tagged linear translations. Intel manual,
//! Section 31.3.

use core::arch::asm;

#[repr(u64)]
pub enum InvvpidType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContexts = 2,
}

#[repr(C)]
struct InvvpidDescriptor {
    vpid: u16,
    reserved: [u16; 3],
    linear_address: u64,
}

fn invvpid(invalidation: InvvpidType, vpid: u16, linear_address: u64) {
    let descriptor = InvvpidDescriptor {
        vpid,
        reserved: [0; 3],
        linear_address,
    };

    unsafe {
        asm!(
            "invvpid {0}, [{1}]",
            in(reg) invalidation as u64,
            in(reg) &descriptor,
            options(nostack),
        );
    }
}

/// Invalidates the translation of one linear address under `vpid`.
pub fn invvpid_individual_address(vpid: u16, linear_address: u64) {
    invvpid(InvvpidType::IndividualAddress, vpid, linear_address);
}

/// Invalidates every translation tagged with `vpid`.
pub fn invvpid_single_context(vpid: u16) {
    invvpid(InvvpidType::SingleContext, vpid, 0);
}

/// Invalidates every VPID-tagged translation.
pub fn invvpid_all_contexts() {
    invvpid(InvvpidType::AllContexts, 0, 0);
}
