//! Process-wide shared state: the EPT identity tables and their EPTP, the
//! MTRR map, the hook manager, and the per-core Vcpu registry. Core `i` only
//! ever writes registry slot `i`; cross-core mutation goes through the
//! broadcast layer. Terminate drains the options so every allocation is
//! returned before the driver unloads.

use {
    crate::{
        error::HypervisorError,
        intel::{
            ept::{Ept, EptCapabilities, Pt},
            hooks::hook_manager::HookManager,
            mtrr::MtrrMap,
            vcpu::Vcpu,
        },
        windows::memory::AllocatedMemory,
    },
    alloc::vec::Vec,
    core::ptr::NonNull,
    log::*,
    spin::{Mutex, Once},
};

/// The EPT state singleton.
pub struct EptState {
    pub ept: AllocatedMemory<Ept>,
    pub eptp: u64,
    pub mtrr: MtrrMap,
    pub capabilities: EptCapabilities,
    /// Tables consumed by build-time splits of MTRR-straddling spans.
    pub build_splits: Vec<AllocatedMemory<Pt>>,
}

static SHARED_EPT_STATE: Once<Mutex<Option<EptState>>> = Once::new();
static SHARED_HOOK_MANAGER: Once<Mutex<Option<HookManager>>> = Once::new();
/// Wraps the raw per-core `Vcpu` pointer so it can live in the shared
/// registry. Sound because core `i` only ever writes registry slot `i`, per
/// the module-level invariant above.
struct VcpuPtr(NonNull<Vcpu>);

unsafe impl Send for VcpuPtr {}
unsafe impl Sync for VcpuPtr {}

static GUEST_STATE: Once<Mutex<Vec<Option<VcpuPtr>>>> = Once::new();

pub fn init_ept_state(state: EptState) {
    let slot = SHARED_EPT_STATE.call_once(|| Mutex::new(None));
    *slot.lock() = Some(state);
}

pub fn init_hook_manager(manager: HookManager) {
    let slot = SHARED_HOOK_MANAGER.call_once(|| Mutex::new(None));
    *slot.lock() = Some(manager);
}

pub fn init_guest_state(core_count: usize) {
    let slot = GUEST_STATE.call_once(|| Mutex::new(Vec::new()));
    *slot.lock() = (0..core_count).map(|_| None).collect();
}

pub fn is_initialized() -> bool {
    SHARED_EPT_STATE.get().map(|slot| slot.lock().is_some()).unwrap_or(false)
}

/// Runs `f` against the shared EPT state.
pub fn with_ept_state<R>(f: impl FnOnce(&mut EptState) -> Result<R, HypervisorError>) -> Result<R, HypervisorError> {
    let slot = SHARED_EPT_STATE.get().ok_or(HypervisorError::EptWalkFailed)?;
    let mut guard = slot.lock();
    let state = guard.as_mut().ok_or(HypervisorError::EptWalkFailed)?;
    f(state)
}

/// The default EPTP, zero before initialization.
pub fn eptp() -> u64 {
    with_ept_state(|state| Ok(state.eptp)).unwrap_or(0)
}

/// Runs `f` against the hook manager. Never call while another hook-manager
/// guard is live on this core, and never across a broadcast: the root-side
/// hypercall handlers take this lock on every core.
pub fn with_hook_manager<R>(f: impl FnOnce(&mut HookManager) -> Result<R, HypervisorError>) -> Result<R, HypervisorError> {
    let slot = SHARED_HOOK_MANAGER.get().ok_or(HypervisorError::HookNotFound)?;
    let mut guard = slot.lock();
    let manager = guard.as_mut().ok_or(HypervisorError::HookNotFound)?;
    f(manager)
}

/// Drains the shared state at terminate, dropping every allocation it owns.
pub fn drain() {
    if let Some(slot) = SHARED_HOOK_MANAGER.get() {
        *slot.lock() = None;
    }
    if let Some(slot) = SHARED_EPT_STATE.get() {
        *slot.lock() = None;
    }
    if let Some(state) = GUEST_STATE.get() {
        state.lock().clear();
    }
}

/// Publishes the Vcpu of the current core. Called on the owning core only.
pub fn publish_vcpu(core: u32, vcpu: NonNull<Vcpu>) {
    if let Some(state) = GUEST_STATE.get() {
        if let Some(slot) = state.lock().get_mut(core as usize) {
            *slot = Some(VcpuPtr(vcpu));
        }
    }
}

/// Removes and returns the Vcpu of a core after devirtualization, so the
/// terminator can free it from PASSIVE_LEVEL.
pub fn take_vcpu(core: u32) -> Option<NonNull<Vcpu>> {
    GUEST_STATE.get()?.lock().get_mut(core as usize)?.take().map(|v| v.0)
}

pub fn core_count() -> usize {
    GUEST_STATE.get().map(|state| state.lock().len()).unwrap_or(0)
}

/// Whether the given core currently has a published Vcpu.
pub fn is_core_virtualized(core: u32) -> bool {
    GUEST_STATE
        .get()
        .and_then(|state| state.lock().get(core as usize).map(|slot| slot.is_some()))
        .unwrap_or(false)
}

/// Whether the core's Vcpu exists and actually reached VMLAUNCH. Read-only
/// deref of the published pointer; the launch flag is only written by the
/// owning core.
pub fn is_core_launched(core: u32) -> bool {
    GUEST_STATE
        .get()
        .and_then(|state| state.lock().get(core as usize).and_then(|slot| slot.as_ref().map(|v| v.0)))
        .map(|vcpu| unsafe { vcpu.as_ref() }.has_launched)
        .unwrap_or(false)
}

/// Logs a fatal per-core condition; the offending core devirtualizes itself.
pub fn report_fatal(core: u32, what: &str) {
    error!("Fatal virtualization error on core {}: {}", core, what);
}
