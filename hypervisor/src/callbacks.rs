//! The seam to the upper debugger layers: the core delivers typed events with
//! context and lets the registered handlers decide policy. Every callback is
//! invoked in VMX root with interrupts disabled and must not block.

use {
    crate::intel::{capture::GuestRegisters, vmerror::EptViolationQualification},
    lazy_static::lazy_static,
    spin::RwLock,
};

/// CPUID results an upper layer may rewrite before they reach the guest.
#[derive(Clone, Copy, Debug)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Context of an access-watch or unexpected EPT violation report.
#[derive(Clone, Copy, Debug)]
pub struct EptViolationReport {
    pub core: u32,
    pub guest_pa: u64,
    pub guest_va: u64,
    pub guest_rip: u64,
    pub qualification: EptViolationQualification,
}

/// Callbacks the upper layers register. `true` from a `*_hook` means the
/// event was consumed and the core must not apply its default handling.
#[derive(Default)]
pub struct EventCallbacks {
    pub cpuid: Option<fn(leaf: u32, subleaf: u32, result: &mut CpuidResult) -> bool>,
    pub breakpoint: Option<fn(core: u32, registers: &mut GuestRegisters) -> bool>,
    pub msr_read: Option<fn(msr: u32, value: &mut u64) -> bool>,
    pub msr_write: Option<fn(msr: u32, value: u64) -> bool>,
    pub io_access: Option<fn(port: u16, input: bool, registers: &mut GuestRegisters) -> bool>,
    pub cr_access: Option<fn(core: u32, cr: u8, write: bool, value: u64)>,
    /// Raised for MOV to CR3 when context-switch detection is enabled.
    pub context_switch: Option<fn(core: u32, new_cr3: u64)>,
    pub page_fault: Option<fn(core: u32, faulting_va: u64, error_code: u32) -> bool>,
    pub ept_violation: Option<fn(report: &EptViolationReport)>,
    pub external_interrupt: Option<fn(core: u32, vector: u8) -> bool>,
    pub preemption_timer: Option<fn(core: u32)>,
    pub rdtsc: Option<fn(core: u32, registers: &mut GuestRegisters) -> bool>,
    pub rdpmc: Option<fn(core: u32, registers: &mut GuestRegisters) -> bool>,
    pub mov_dr: Option<fn(core: u32, registers: &mut GuestRegisters) -> bool>,
    pub descriptor_table_access: Option<fn(core: u32, registers: &mut GuestRegisters)>,
    /// Drained page-modification-log entries when dirty logging is active.
    pub dirty_pages: Option<fn(core: u32, pages: &[u64])>,
}

lazy_static! {
    static ref CALLBACKS: RwLock<EventCallbacks> = RwLock::new(EventCallbacks::default());
}

/// Replaces the registered callback set.
pub fn register_callbacks(callbacks: EventCallbacks) {
    *CALLBACKS.write() = callbacks;
}

/// Runs `f` against the current callback set.
pub fn with_callbacks<R>(f: impl FnOnce(&EventCallbacks) -> R) -> R {
    f(&CALLBACKS.read())
}
