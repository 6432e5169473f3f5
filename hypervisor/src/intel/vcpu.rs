//! The per-logical-processor virtualization state: VMXON/VMCS regions, the
//! dedicated VMM stack the VM-exit trampoline runs on, the intercept bitmaps,
//! and the launch and teardown paths. A `Vcpu` is created on the core it will
//! run on and never migrates.

use {
    crate::{
        error::HypervisorError,
        intel::{
            bitmap::{IoBitmaps, MsrBitmap},
            capture::GuestRegisters,
            descriptor::DescriptorTables,
            events::PendingEvent,
            hooks::MtfAction,
            support::{self, rdmsr, vmread, vmwrite, wrmsr},
            vmcs::Vmcs,
            vmerror::VmInstructionError,
            vmlaunch::launch_guest,
            vmxon::Vmxon,
        },
        windows::memory::AllocatedMemory,
    },
    alloc::boxed::Box,
    elain::Align,
    log::*,
    x86::{bits64::rflags::RFlags, msr, vmx::vmcs::{guest, ro}},
};

/// Size of the dedicated VMM stack each core's VM-exit trampoline runs on.
pub const VMM_STACK_SIZE: usize = 0x10000;

/// Usable stack bytes: the two trailing slots hold the `Vcpu` pointer the
/// trampoline reads and a canary slot keeping the top 16-byte aligned.
pub const VMM_STACK_CONTENTS_SIZE: usize = VMM_STACK_SIZE - core::mem::size_of::<u64>() * 2;

/// The host stack. VMCS host RSP points at `vcpu_ptr`, so exits push the
/// register frame downward into `stack_contents`.
#[repr(C)]
pub struct VmmStack {
    align: Align<4096>,
    pub stack_contents: [u8; VMM_STACK_CONTENTS_SIZE],
    pub vcpu_ptr: u64,
    pub reserved: u64,
}

static_assertions::const_assert_eq!(core::mem::size_of::<VmmStack>(), VMM_STACK_SIZE);
static_assertions::const_assert_eq!(VMM_STACK_CONTENTS_SIZE % 16, 0);

/// State saved for and by the VMXOFF hypercall on each core.
#[derive(Clone, Copy, Debug, Default)]
pub struct VmxoffState {
    pub executed: bool,
    pub guest_rip: u64,
    pub guest_rsp: u64,
}

/// Which flavor of SYSCALL interception via #UD is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallHookType {
    /// Emulate every #UD-reported SYSCALL/SYSRET pattern.
    HandleAllUd,
    /// Probe guest memory safely before concluding the #UD is a SYSCALL.
    SafeAccessMemory,
}

pub struct Vcpu {
    /// Zero-based logical processor index; slot owner in the global array.
    pub index: u32,

    pub vmxon_region: AllocatedMemory<Vmxon>,
    pub vmcs_region: AllocatedMemory<Vmcs>,
    pub vmm_stack: AllocatedMemory<VmmStack>,
    pub msr_bitmap: AllocatedMemory<MsrBitmap>,
    pub io_bitmaps: AllocatedMemory<IoBitmaps>,

    /// The context captured on this core right before virtualization.
    pub guest_registers: GuestRegisters,

    pub has_launched: bool,
    pub vmxoff_state: VmxoffState,

    /// Index into the EPTP list this core currently runs under; 0 is the
    /// default identity EPT.
    pub eptp_index: u64,

    /// At most one of each may be queued per exit.
    pub pending_nmi: Option<PendingEvent>,
    pub pending_external_interrupt: Option<PendingEvent>,

    /// Descriptor tables and FS/GS bases captured at launch, restored
    /// verbatim at VMXOFF so integrity scanners see nothing moved.
    pub saved_descriptor_tables: DescriptorTables,
    pub saved_fs_base: u64,
    pub saved_gs_base: u64,

    /// Action to perform on the next monitor-trap-flag exit.
    pub mtf_action: Option<MtfAction>,

    pub syscall_hook: Option<SyscallHookType>,

    /// Report MOV-to-CR3 writes as context-switch events.
    pub mov_to_cr3_exiting: bool,

    /// The 512-entry page-modification log, preallocated so that enabling
    /// dirty logging from VMX root never allocates.
    pub pml: AllocatedMemory<PmlLog>,
    pub pml_active: bool,
}

/// A page-modification log page. Intel manual, Section 29.3.6.
#[repr(C, align(4096))]
pub struct PmlLog {
    pub entries: [u64; 512],
}

pub const PML_INDEX_LAST: u64 = 511;

// PML fields lack named constants in the vmcs module; encodings are from the
// Intel manual, Appendix B.
pub const PML_ADDRESS_FULL: u32 = 0x200E;
pub const GUEST_PML_INDEX: u32 = 0x812;

impl Vcpu {
    pub fn new(index: u32) -> Result<Box<Self>, HypervisorError> {
        trace!("Creating Vcpu for core {}", index);

        Ok(Box::new(Self {
            index,
            vmxon_region: AllocatedMemory::alloc_contiguous()?,
            vmcs_region: AllocatedMemory::alloc_contiguous()?,
            vmm_stack: AllocatedMemory::alloc_contiguous()?,
            msr_bitmap: AllocatedMemory::alloc_contiguous()?,
            io_bitmaps: AllocatedMemory::alloc_contiguous()?,
            guest_registers: GuestRegisters::default(),
            has_launched: false,
            vmxoff_state: VmxoffState::default(),
            eptp_index: 0,
            pending_nmi: None,
            pending_external_interrupt: None,
            saved_descriptor_tables: DescriptorTables::default(),
            saved_fs_base: 0,
            saved_gs_base: 0,
            mtf_action: None,
            syscall_hook: None,
            mov_to_cr3_exiting: false,
            pml: AllocatedMemory::alloc_contiguous()?,
            pml_active: false,
        }))
    }

    /// Brings this core into VMX operation, builds the VMCS around the
    /// captured `registers`, and launches. On success the function never
    /// returns: guest execution resumes at the capture point.
    pub fn virtualize(&mut self, registers: &GuestRegisters, eptp: u64, system_cr3: u64) -> Result<(), HypervisorError> {
        trace!("Virtualizing core {}", self.index);

        self.saved_descriptor_tables = DescriptorTables::capture();
        self.saved_fs_base = rdmsr(msr::IA32_FS_BASE);
        self.saved_gs_base = rdmsr(msr::IA32_GS_BASE);
        self.guest_registers = *registers;

        Vmxon::check_vmx_support()?;
        Vmxon::enable_vmx_operation();
        Vmxon::adjust_feature_control_msr()?;
        Vmxon::set_cr0_bits();
        Vmxon::set_cr4_bits();

        self.vmxon_region.init();
        support::vmxon(self.vmxon_region.pa());
        trace!("VMXON executed on core {}", self.index);

        self.vmcs_region.init();
        support::vmclear(self.vmcs_region.pa());
        support::vmptrld(self.vmcs_region.pa());
        trace!("VMCS loaded on core {}", self.index);

        // The trampoline finds its Vcpu through the slot at the stack top.
        self.vmm_stack.vcpu_ptr = self as *mut _ as u64;
        let host_rsp = core::ptr::addr_of!(self.vmm_stack.vcpu_ptr) as u64;

        Vmcs::setup_guest_registers_state(&self.guest_registers);
        Vmcs::setup_host_registers_state(host_rsp, system_cr3)?;
        Vmcs::setup_vmcs_control_fields(
            eptp,
            self.msr_bitmap.pa(),
            self.io_bitmaps.pa(),
            self.io_bitmaps.pa() + 0x1000,
        )?;

        self.has_launched = true;
        let flags = unsafe { launch_guest(&self.guest_registers) };

        // Only reached when VMLAUNCH failed.
        self.has_launched = false;
        let result = Self::vm_succeed(RFlags::from_raw(flags));
        Vmcs::debug_dump();
        support::vmxoff();
        Vmxon::disable_vmx_operation();

        result.and(Err(HypervisorError::VmFailToLaunch))
    }

    /// Interprets the RFLAGS left by a VMX instruction.
    fn vm_succeed(flags: RFlags) -> Result<(), HypervisorError> {
        if flags.contains(RFlags::FLAGS_ZF) {
            let error = support::vm_instruction_error() as u32;
            return match VmInstructionError::from_u32(error) {
                Some(error) => {
                    error!("VM instruction error: {:?}", error);
                    Err(HypervisorError::VmInstructionFailed(error))
                }
                None => {
                    error!("Unknown VM instruction error: {:#x}", error);
                    Err(HypervisorError::UnknownVmInstructionError)
                }
            };
        } else if flags.contains(RFlags::FLAGS_CF) {
            error!("VM instruction failed with carry flag set");
            return Err(HypervisorError::VmFailToLaunch);
        }

        Ok(())
    }

    /// Executed in VMX root by the VMXOFF hypercall: records where the guest
    /// resumes, restores the descriptor tables and segment bases the OS had
    /// before virtualization, leaves VMX operation, and switches back to the
    /// guest's address space.
    ///
    /// The caller places `guest_rip`/`guest_rsp` into the RBX/RCX slots of
    /// the exit frame; the trampoline's devirtualization tail consumes them.
    pub fn devirtualize(&mut self) -> VmxoffState {
        let guest_rip = vmread(guest::RIP) + vmread(ro::VMEXIT_INSTRUCTION_LEN);
        let guest_rsp = vmread(guest::RSP);
        let guest_cr3 = vmread(guest::CR3);

        self.vmxoff_state = VmxoffState {
            executed: true,
            guest_rip,
            guest_rsp,
        };

        unsafe {
            support::lgdt(&self.saved_descriptor_tables.gdtr);
            support::lidt(&self.saved_descriptor_tables.idtr);
        }
        wrmsr(msr::IA32_FS_BASE, self.saved_fs_base);
        wrmsr(msr::IA32_GS_BASE, self.saved_gs_base);

        support::vmclear(self.vmcs_region.pa());
        support::vmxoff();
        Vmxon::disable_vmx_operation();

        // Resume under the guest's CR3, not the System one the host ran with.
        support::cr3_write(guest_cr3);

        self.has_launched = false;
        trace!("Core {} devirtualized; resuming at {:#x}", self.index, guest_rip);

        self.vmxoff_state
    }

    /// Queues an event; the dispatcher delivers it on the next entry where no
    /// other injection is staged.
    pub fn queue_event(&mut self, event: PendingEvent) {
        match event.interruption_type {
            crate::intel::vmerror::InterruptionType::NonMaskableInterrupt => self.pending_nmi = Some(event),
            _ => self.pending_external_interrupt = Some(event),
        }
    }

    /// Enables dirty logging by pointing the VMCS at the preallocated PML
    /// page. Safe to run in VMX root.
    pub fn enable_pml(&mut self) -> Result<(), HypervisorError> {
        vmwrite(PML_ADDRESS_FULL, self.pml.pa());
        vmwrite(GUEST_PML_INDEX, PML_INDEX_LAST);
        self.pml_active = true;

        Ok(())
    }

    pub fn disable_pml(&mut self) {
        self.pml_active = false;
    }
}
