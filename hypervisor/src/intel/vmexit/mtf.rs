//! Monitor-trap-flag exits: one guest instruction has retired since a hook
//! exposed its transparent configuration or an access watch was lifted; put
//! the guarded configuration back. RIP is never advanced here.

use {
    crate::intel::{capture::GuestRegisters, shared, vcpu::Vcpu, vmexit::ExitType},
    log::*,
};

pub fn handle_mtf(vcpu: &mut Vcpu, _registers: &mut GuestRegisters) -> ExitType {
    let result = shared::with_hook_manager(|hook_manager| hook_manager.handle_mtf(vcpu));

    if let Err(error) = result {
        error!("MTF re-arm failed on core {}: {:?}", vcpu.index, error);
    }

    ExitType::Continue
}
