//! The hidden-hook engine. Each hooked 4-KiB guest frame owns a shadow page
//! carrying the modified bytes; the EPT leaf for the frame is always in
//! exactly one of two configurations:
//!
//! - "data": original frame, read/write, no execute. Reads see clean bytes.
//! - "exec": shadow frame, execute-only. Execution hits the patch.
//!
//! EPT violations flip between the two and the monitor trap flag re-arms the
//! exec view after a single stepped data access. The same flip, with the
//! original frame on both sides, implements refcounted access watches.

use {
    crate::{
        callbacks::{self, EptViolationReport},
        error::HypervisorError,
        intel::{
            addresses::PhysicalAddress,
            capture::GuestRegisters,
            ept::{AccessType, Entry, Ept},
            hooks::{
                inline::{build_trampoline, write_absolute_jump, DetourHandler, Trampoline, JMP_ABS_SIZE},
                memory_manager::MemoryManager,
                set_monitor_trap_flag, MtfAction,
            },
            invept::invept_single_context,
            invvpid::invvpid_all_contexts,
            shared,
            vcpu::Vcpu,
            vmerror::EptViolationQualification,
        },
        windows::memory::AllocatedMemory,
    },
    alloc::vec::Vec,
    core::ptr::copy_nonoverlapping,
    log::*,
    x86::bits64::paging::{BASE_PAGE_SIZE, PAddr},
};

/// The maximum number of hooks supported; sizes the preallocated pools.
pub const MAX_HOOKS: usize = 64;

/// The patch applied to the shadow page of an exec-style hook.
pub enum EptHookType {
    /// A 0xCC at the hooked byte; execution surfaces as #BP to the VMM.
    Breakpoint,
    /// An absolute jump into a per-hook trampoline that calls `handler`.
    Detour(DetourHandler),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookState {
    Installed,
    PendingRestore,
    Restored,
}

/// Which of the two leaf configurations is live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageView {
    Data,
    Exec,
}

pub struct DetourRecord {
    pub hooked_va: u64,
    pub trampoline_va: u64,
    pub return_va: u64,
    _trampoline: AllocatedMemory<Trampoline>,
}

pub struct HookedPage {
    /// The hooked 4-KiB guest frame.
    pub guest_page_pa: u64,
    /// CR3 the virtual addresses of this page resolve under.
    pub install_cr3: u64,
    /// Physical address of the shadow page; zero for pure access watches.
    pub shadow_page_pa: u64,
    /// The 4-KiB leaf as it was before the hook, restored on unhook.
    pub original_entry: Entry,
    /// The permission mask the installer asked for.
    pub requested_access: AccessType,
    /// Permission bits cleared on the data leaf for an access watch.
    pub watched: Option<AccessType>,
    pub breakpoint_vas: Vec<u64>,
    pub detours: Vec<DetourRecord>,
    pub state: HookState,
    pub current_view: PageView,
    /// Shared installs on the same frame; the last uninstall restores.
    pub refcount: u32,
}

impl HookedPage {
    pub fn is_exec_style(&self) -> bool {
        self.watched.is_none()
    }
}

pub struct HookManager {
    pub memory_manager: MemoryManager,
    hooked_pages: Vec<HookedPage>,
}

impl HookManager {
    pub fn new() -> Result<Self, HypervisorError> {
        trace!("Initializing hook manager");

        Ok(Self {
            memory_manager: MemoryManager::new(MAX_HOOKS)?,
            hooked_pages: Vec::with_capacity(MAX_HOOKS),
        })
    }

    /// Copies the guest frame into its shadow page. Raw copy; both frames
    /// are mapped kernel memory.
    fn unsafe_copy_guest_to_shadow(guest_page_pa: PAddr, shadow_page_va: *mut u8) {
        let guest_va = PhysicalAddress::va_from_pa(guest_page_pa.as_u64());
        unsafe { copy_nonoverlapping(guest_va as *const u8, shadow_page_va, BASE_PAGE_SIZE) };
    }

    pub fn find_by_page_pa(&mut self, guest_page_pa: u64) -> Option<&mut HookedPage> {
        let key = guest_page_pa & !(BASE_PAGE_SIZE as u64 - 1);
        self.hooked_pages.iter_mut().find(|page| page.guest_page_pa == key)
    }

    pub fn find_by_va(&mut self, va: u64) -> Option<&mut HookedPage> {
        self.hooked_pages.iter_mut().find(|page| {
            page.breakpoint_vas.contains(&va) || page.detours.iter().any(|detour| detour.hooked_va == va)
        })
    }

    pub fn hooked_page_count(&self) -> usize {
        self.hooked_pages.len()
    }

    /// Installs a breakpoint-style hook (`EptHook`): guest execution of the
    /// byte at `guest_va` delivers #BP to the VMM while reads of the page
    /// keep seeing the original bytes.
    pub fn ept_hook(&mut self, guest_va: u64, pid: u64) -> Result<u64, HypervisorError> {
        self.install_exec_hook(guest_va, pid, EptHookType::Breakpoint)
    }

    /// Installs a detour-style or access-watch hook (`EptHook2`). With
    /// `hidden` and execute access the shadow page carries a jump into a
    /// trampoline that invokes `handler`; otherwise the requested permission
    /// bits become a refcounted access watch on the data leaf.
    pub fn ept_hook2(
        &mut self,
        guest_va: u64,
        handler: Option<DetourHandler>,
        pid: u64,
        access: AccessType,
        hidden: bool,
    ) -> Result<u64, HypervisorError> {
        if hidden && access.contains(AccessType::EXECUTE) {
            let handler = handler.ok_or(HypervisorError::HookConflict)?;
            self.install_exec_hook(guest_va, pid, EptHookType::Detour(handler))
        } else {
            self.install_access_watch(guest_va, pid, access)
        }
    }

    /// Returns the guest page PA so the caller can broadcast the root-side
    /// leaf flip after releasing the hook-manager lock.
    fn install_exec_hook(&mut self, guest_va: u64, pid: u64, hook_type: EptHookType) -> Result<u64, HypervisorError> {
        let install_cr3 = crate::windows::process::cr3_by_pid(pid)?;
        let guest_pa = PAddr::from(crate::windows::memory::guest_va_to_pa(guest_va, install_cr3)?);
        let guest_page_pa = guest_pa.align_down_to_base_page();

        trace!("Installing exec hook at VA {:#x} (PA {:#x})", guest_va, guest_pa.as_u64());

        let shares_existing = match self.find_by_page_pa(guest_page_pa.as_u64()) {
            Some(existing) if existing.is_exec_style() && existing.state == HookState::Installed => true,
            Some(_) => return Err(HypervisorError::HookConflict),
            None => false,
        };
        if !shares_existing {
            self.create_hooked_page(guest_page_pa.as_u64(), install_cr3, AccessType::EXECUTE, None)?;
        }

        // Patch the shadow copy, never the original frame.
        let shadow = self
            .memory_manager
            .get_shadow_page(guest_page_pa.as_u64())
            .ok_or(HypervisorError::HookNotFound)?;
        let offset = guest_pa.base_page_offset() as usize;
        let shadow_va = shadow.as_ptr() as u64;

        let record = match hook_type {
            EptHookType::Breakpoint => {
                unsafe { *(shadow_va as *mut u8).add(offset) = 0xCC };
                None
            }
            EptHookType::Detour(handler) => {
                if offset + JMP_ABS_SIZE > BASE_PAGE_SIZE {
                    // The jump may not spill into the next frame.
                    return Err(HypervisorError::HookConflict);
                }

                let mut trampoline = AllocatedMemory::<Trampoline>::alloc_contiguous()?;
                let trampoline_va = trampoline.as_ptr() as u64;

                // Displaced bytes come from the unmodified original frame.
                let original_va = PhysicalAddress::va_from_pa(guest_pa.as_u64());
                let original_code =
                    unsafe { core::slice::from_raw_parts(original_va as *const u8, BASE_PAGE_SIZE - offset) };

                let layout = build_trampoline(&mut trampoline, trampoline_va, original_code, guest_va, handler)?;

                let shadow_slice =
                    unsafe { core::slice::from_raw_parts_mut((shadow_va as *mut u8).add(offset), JMP_ABS_SIZE) };
                write_absolute_jump(shadow_slice, trampoline_va);

                Some(DetourRecord {
                    hooked_va: guest_va,
                    trampoline_va,
                    return_va: layout.return_va,
                    _trampoline: trampoline,
                })
            }
        };

        let page = self
            .find_by_page_pa(guest_page_pa.as_u64())
            .ok_or(HypervisorError::HookNotFound)?;
        match record {
            Some(detour) => page.detours.push(detour),
            None => page.breakpoint_vas.push(guest_va),
        }
        page.refcount += 1;

        Ok(guest_page_pa.as_u64())
    }

    fn install_access_watch(&mut self, guest_va: u64, pid: u64, access: AccessType) -> Result<u64, HypervisorError> {
        let install_cr3 = crate::windows::process::cr3_by_pid(pid)?;
        let guest_pa = PAddr::from(crate::windows::memory::guest_va_to_pa(guest_va, install_cr3)?);
        let guest_page_pa = guest_pa.align_down_to_base_page();

        trace!("Installing access watch {:?} at PA {:#x}", access, guest_page_pa.as_u64());

        if let Some(existing) = self.find_by_page_pa(guest_page_pa.as_u64()) {
            // Identical watches share; anything else is a documented
            // conflict and the second install is rejected.
            if existing.watched != Some(access) {
                return Err(HypervisorError::HookConflict);
            }
            existing.refcount += 1;
            existing.breakpoint_vas.push(guest_va);
            return Ok(guest_page_pa.as_u64());
        }

        self.create_hooked_page(guest_page_pa.as_u64(), install_cr3, access, Some(access))?;
        let page = self
            .find_by_page_pa(guest_page_pa.as_u64())
            .ok_or(HypervisorError::HookNotFound)?;
        page.refcount = 1;
        page.breakpoint_vas.push(guest_va);

        Ok(guest_page_pa.as_u64())
    }

    /// Splits the hosting 2-MiB span, snapshots the original leaf, and (for
    /// exec-style hooks) prepares the shadow copy. No EPT leaf changes yet;
    /// those happen from VMX root via the apply hypercall.
    fn create_hooked_page(
        &mut self,
        guest_page_pa: u64,
        install_cr3: u64,
        requested_access: AccessType,
        watched: Option<AccessType>,
    ) -> Result<(), HypervisorError> {
        if !self.memory_manager.is_page_split(guest_page_pa) {
            trace!("Splitting 2MiB span for {:#x}", guest_page_pa);
            let memory_manager = &mut self.memory_manager;
            shared::with_ept_state(|ept_state| {
                let pt = memory_manager.get_or_create_page_table(guest_page_pa)?;
                ept_state.ept.split_2mb_to_4kb(guest_page_pa, pt)
            })?;
        }

        let pt = self
            .memory_manager
            .get_page_table(guest_page_pa)
            .ok_or(HypervisorError::EptWalkFailed)?;
        let original_entry = *Ept::pt_entry(pt, guest_page_pa);

        let shadow_page_pa = if watched.is_none() {
            if !self.memory_manager.is_page_copied(guest_page_pa) {
                let shadow = self.memory_manager.get_or_create_shadow_page(guest_page_pa)?;
                let shadow_va = shadow.as_ptr() as *mut u8;
                Self::unsafe_copy_guest_to_shadow(PAddr::from(guest_page_pa), shadow_va);
            }
            let shadow = self
                .memory_manager
                .get_shadow_page(guest_page_pa)
                .ok_or(HypervisorError::HookNotFound)?;
            PhysicalAddress::pa_from_va(shadow.as_ptr() as u64)
        } else {
            0
        };

        self.hooked_pages.push(HookedPage {
            guest_page_pa,
            install_cr3,
            shadow_page_pa,
            original_entry,
            requested_access,
            watched,
            breakpoint_vas: Vec::new(),
            detours: Vec::new(),
            state: HookState::Installed,
            current_view: PageView::Data,
            refcount: 0,
        });

        Ok(())
    }

    /// Root-side application of a freshly installed hook, idempotent per
    /// core: puts the leaf into its armed configuration and flushes this
    /// core's TLB. Runs with interrupts disabled in VMX root.
    pub fn apply_hook(&mut self, guest_page_pa: u64) -> Result<(), HypervisorError> {
        let Self { memory_manager, hooked_pages } = self;

        let page = hooked_pages
            .iter_mut()
            .find(|page| page.guest_page_pa == guest_page_pa)
            .ok_or(HypervisorError::HookNotFound)?;

        let eptp = shared::with_ept_state(|ept_state| {
            match page.watched {
                Some(watched) => Self::apply_watch_view(memory_manager, &mut ept_state.ept, page, watched)?,
                None => Self::apply_exec_view(memory_manager, &mut ept_state.ept, page)?,
            }
            Ok(ept_state.eptp)
        })?;

        invept_single_context(eptp);
        invvpid_all_contexts();

        Ok(())
    }

    /// Shadow frame, execute-only: the guarded configuration of an
    /// exec-style hook.
    fn apply_exec_view(
        memory_manager: &mut MemoryManager,
        ept: &mut Ept,
        page: &mut HookedPage,
    ) -> Result<(), HypervisorError> {
        let pt = memory_manager
            .get_page_table(page.guest_page_pa)
            .ok_or(HypervisorError::EptWalkFailed)?;

        ept.remap_page(page.guest_page_pa, page.shadow_page_pa, pt)?;
        ept.modify_page_permissions(page.guest_page_pa, AccessType::EXECUTE, pt)?;
        page.current_view = PageView::Exec;

        Ok(())
    }

    /// Original frame, read/write only: the transparent configuration.
    fn apply_data_view(
        memory_manager: &mut MemoryManager,
        ept: &mut Ept,
        page: &mut HookedPage,
    ) -> Result<(), HypervisorError> {
        let pt = memory_manager
            .get_page_table(page.guest_page_pa)
            .ok_or(HypervisorError::EptWalkFailed)?;

        ept.remap_page(page.guest_page_pa, page.guest_page_pa, pt)?;
        ept.modify_page_permissions(page.guest_page_pa, AccessType::READ_WRITE, pt)?;
        page.current_view = PageView::Data;

        Ok(())
    }

    /// Original frame with the watched permission bits cleared. A write
    /// permission cannot outlive the read permission (the combination is an
    /// EPT misconfiguration), so watching reads also watches writes.
    fn apply_watch_view(
        memory_manager: &mut MemoryManager,
        ept: &mut Ept,
        page: &mut HookedPage,
        watched: AccessType,
    ) -> Result<(), HypervisorError> {
        let pt = memory_manager
            .get_page_table(page.guest_page_pa)
            .ok_or(HypervisorError::EptWalkFailed)?;

        let mut remaining = AccessType::READ_WRITE_EXECUTE - watched;
        if !remaining.contains(AccessType::READ) {
            remaining.remove(AccessType::WRITE);
        }

        ept.modify_page_permissions(page.guest_page_pa, remaining, pt)?;
        page.current_view = PageView::Data;

        Ok(())
    }

    /// Root-side restore of the pre-hook leaf, byte for byte.
    pub fn restore_page(&mut self, guest_page_pa: u64) -> Result<(), HypervisorError> {
        let Self { memory_manager, hooked_pages } = self;

        let page = hooked_pages
            .iter_mut()
            .find(|page| page.guest_page_pa == guest_page_pa)
            .ok_or(HypervisorError::HookNotFound)?;

        let eptp = shared::with_ept_state(|ept_state| Ok(ept_state.eptp))?;

        let pt = memory_manager
            .get_page_table(page.guest_page_pa)
            .ok_or(HypervisorError::EptWalkFailed)?;
        *Ept::pt_entry(pt, page.guest_page_pa) = page.original_entry;
        page.state = HookState::Restored;

        invept_single_context(eptp);
        invvpid_all_contexts();

        Ok(())
    }

    /// Marks a hook for teardown. Returns the page PA to broadcast when this
    /// was the last reference, `None` when other installs still share it.
    pub fn prepare_unhook(&mut self, va: u64, pa: u64, _pid: u64) -> Result<Option<u64>, HypervisorError> {
        let page = if va != 0 { self.find_by_va(va) } else { self.find_by_page_pa(pa) }
            .ok_or(HypervisorError::HookNotFound)?;

        page.breakpoint_vas.retain(|&hooked| hooked != va);
        page.detours.retain(|detour| detour.hooked_va != va);
        page.refcount = page.refcount.saturating_sub(1);

        if page.refcount > 0 {
            return Ok(None);
        }

        page.state = HookState::PendingRestore;
        Ok(Some(page.guest_page_pa))
    }

    /// Fills `out` with the pages awaiting restore, without allocating.
    /// Returns how many were written.
    pub fn pending_restore_pages(&self, out: &mut [u64]) -> usize {
        let mut count = 0;
        for page in self.hooked_pages.iter().filter(|page| page.state == HookState::PendingRestore) {
            if count == out.len() {
                break;
            }
            out[count] = page.guest_page_pa;
            count += 1;
        }
        count
    }

    /// Marks every installed page for restore, for unhook-all teardown.
    pub fn prepare_unhook_all(&mut self) -> Vec<u64> {
        self.hooked_pages
            .iter_mut()
            .filter(|page| page.state == HookState::Installed)
            .map(|page| {
                page.state = HookState::PendingRestore;
                page.refcount = 0;
                page.guest_page_pa
            })
            .collect()
    }

    /// Drops restored pages from the list and returns their shadow pages to
    /// the pool. Called after the restore broadcast completes.
    pub fn finish_unhook(&mut self, guest_page_pa: u64) {
        let Self { memory_manager, hooked_pages } = self;

        hooked_pages.retain(|page| {
            if page.guest_page_pa != guest_page_pa {
                return true;
            }
            debug_assert_eq!(page.state, HookState::Restored);
            memory_manager.release_shadow_page(guest_page_pa);
            false
        });
    }

    /// Handles an EPT violation on a hooked page; returns `false` when the
    /// address is not hooked (a genuine fault the dispatcher escalates).
    ///
    /// The flip below is the only mechanism multiplexing hidden reads and
    /// writes against hidden executes. Invariant: a hooked page's leaf is
    /// never writable and executable at once.
    pub fn handle_hooked_page(
        &mut self,
        vcpu: &mut Vcpu,
        registers: &GuestRegisters,
        guest_pa: u64,
        guest_va: u64,
        qualification: EptViolationQualification,
    ) -> Result<bool, HypervisorError> {
        let guest_page_pa = guest_pa & !(BASE_PAGE_SIZE as u64 - 1);

        let Self { memory_manager, hooked_pages } = self;
        let Some(page) = hooked_pages.iter_mut().find(|page| page.guest_page_pa == guest_page_pa) else {
            return Ok(false);
        };

        let core = vcpu.index;
        let guest_rip = registers.rip;
        let report = move |qualification: EptViolationQualification| {
            callbacks::with_callbacks(|callbacks| {
                if let Some(report) = callbacks.ept_violation {
                    report(&EptViolationReport {
                        core,
                        guest_pa,
                        guest_va,
                        guest_rip,
                        qualification,
                    });
                }
            });
        };

        let eptp = shared::with_ept_state(|ept_state| {
            if let Some(watched) = page.watched {
                // Report, then single-step the access with the watch lifted.
                report(qualification);

                let pt = memory_manager
                    .get_page_table(guest_page_pa)
                    .ok_or(HypervisorError::EptWalkFailed)?;
                ept_state
                    .ept
                    .modify_page_permissions(guest_page_pa, AccessType::READ_WRITE_EXECUTE, pt)?;

                set_monitor_trap_flag(true);
                vcpu.mtf_action = Some(MtfAction::RestoreWatch { guest_page_pa, watched });
            } else if qualification.execute_access() && page.current_view == PageView::Data {
                // Execution of a data-configured page: bring in the shadow.
                Self::apply_exec_view(memory_manager, &mut ept_state.ept, page)?;
            } else if (qualification.read_access() || qualification.write_access())
                && page.current_view == PageView::Exec
            {
                // A read or write against the exec view: expose the clean
                // frame for exactly one instruction, then re-arm.
                Self::apply_data_view(memory_manager, &mut ept_state.ept, page)?;

                set_monitor_trap_flag(true);
                vcpu.mtf_action = Some(MtfAction::RearmExec { guest_page_pa });

                report(qualification);
            }
            // Any other combination is a stale translation that faulted
            // after the view already flipped; the INVEPT below covers it.

            Ok(ept_state.eptp)
        })?;

        invept_single_context(eptp);
        invvpid_all_contexts();

        Ok(true)
    }

    /// Completes the two-configuration toggle on the monitor-trap-flag exit
    /// following a stepped access.
    pub fn handle_mtf(&mut self, vcpu: &mut Vcpu) -> Result<(), HypervisorError> {
        let Some(action) = vcpu.mtf_action.take() else {
            set_monitor_trap_flag(false);
            return Ok(());
        };

        let Self { memory_manager, hooked_pages } = self;

        let eptp = shared::with_ept_state(|ept_state| {
            match action {
                MtfAction::RearmExec { guest_page_pa } => {
                    if let Some(page) = hooked_pages.iter_mut().find(|page| page.guest_page_pa == guest_page_pa) {
                        Self::apply_exec_view(memory_manager, &mut ept_state.ept, page)?;
                    }
                }
                MtfAction::RestoreWatch { guest_page_pa, watched } => {
                    if let Some(page) = hooked_pages.iter_mut().find(|page| page.guest_page_pa == guest_page_pa) {
                        Self::apply_watch_view(memory_manager, &mut ept_state.ept, page, watched)?;
                    }
                }
            }
            Ok(ept_state.eptp)
        })?;

        set_monitor_trap_flag(false);
        invept_single_context(eptp);

        Ok(())
    }
}
