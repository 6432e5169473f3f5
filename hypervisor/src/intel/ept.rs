//! Extended page tables: a 512-GiB identity map backed by 2-MiB leaves with
//! MTRR-correct memory types, split to 4 KiB where hooks or straddling memory
//! types require it, plus EPTP formation from the reported capabilities.
//!
//! Reference: Intel manual, Section 29.3 "The Extended Page Table Mechanism".

use {
    crate::{
        error::HypervisorError,
        intel::{
            addresses::PhysicalAddress,
            mtrr::{MemoryType, MtrrMap},
        },
        windows::memory::AllocatedMemory,
    },
    alloc::vec::Vec,
    bit_field::BitField,
    bitfield::bitfield,
    bitflags::bitflags,
    log::*,
    x86::{
        bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE, LARGE_PAGE_SIZE},
        msr,
    },
};

bitflags! {
    /// Access permissions of one EPT leaf.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct AccessType: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

bitfield! {
    /// An EPT table entry at any level. Intel manual, Tables 29-1 through
    /// 29-7.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Entry(u64);
    impl Debug;

    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub large, set_large: 7;
    /// Execute access for user-mode linear addresses when mode-based execute
    /// control is enabled.
    pub user_executable, set_user_executable: 10;
    pub pfn, set_pfn: 51, 12;
}

impl Entry {
    pub fn set_access(&mut self, access: AccessType) {
        self.set_readable(access.contains(AccessType::READ));
        self.set_writable(access.contains(AccessType::WRITE));
        self.set_executable(access.contains(AccessType::EXECUTE));
    }

    pub fn access(&self) -> AccessType {
        let mut access = AccessType::empty();
        access.set(AccessType::READ, self.readable());
        access.set(AccessType::WRITE, self.writable());
        access.set(AccessType::EXECUTE, self.executable());
        access
    }
}

#[repr(C, align(4096))]
pub struct Table {
    pub entries: [Entry; 512],
}

#[repr(C, align(4096))]
pub struct Pml4(pub Table);

#[repr(C, align(4096))]
pub struct Pdpt(pub Table);

#[repr(C, align(4096))]
pub struct Pd(pub Table);

/// A 4-KiB-leaf page table covering one 2-MiB span after a split.
#[repr(C, align(4096))]
pub struct Pt(pub Table);

/// The identity-mapping EPT hierarchy: one PML4 entry, a full PDPT, and 512
/// page directories covering the low 512 GiB of guest physical space.
#[repr(C, align(4096))]
pub struct Ept {
    pml4: Pml4,
    pdpt: Pdpt,
    pd: [Pd; 512],
}

impl Ept {
    /// Builds the identity map: every PDE is a 2-MiB read/write/execute leaf
    /// whose memory type comes from the MTRR map. Spans the MTRRs type
    /// non-uniformly are split to 4 KiB immediately, consuming tables from
    /// `split_pool`.
    pub fn build_identity(&mut self, mtrr: &MtrrMap, split_pool: &mut Vec<AllocatedMemory<Pt>>) -> Result<(), HypervisorError> {
        trace!("Building EPT identity map");

        self.pml4.0.entries[0].set_readable(true);
        self.pml4.0.entries[0].set_writable(true);
        self.pml4.0.entries[0].set_executable(true);
        self.pml4.0.entries[0].set_user_executable(true);
        self.pml4.0.entries[0].set_pfn(PhysicalAddress::pa_from_va(core::ptr::addr_of!(self.pdpt) as u64) >> BASE_PAGE_SHIFT);

        let mut pa = 0u64;

        for (i, pdpte) in self.pdpt.0.entries.iter_mut().enumerate() {
            pdpte.set_readable(true);
            pdpte.set_writable(true);
            pdpte.set_executable(true);
            pdpte.set_user_executable(true);
            pdpte.set_pfn(PhysicalAddress::pa_from_va(core::ptr::addr_of!(self.pd[i]) as u64) >> BASE_PAGE_SHIFT);

            for pde in &mut self.pd[i].0.entries {
                pde.set_readable(true);
                pde.set_writable(true);
                pde.set_executable(true);
                // Neutral under mode-based execute control until an upper
                // layer clears it on specific pages.
                pde.set_user_executable(true);
                pde.set_large(true);
                pde.set_pfn(pa >> BASE_PAGE_SHIFT);

                match mtrr.type_for_range(pa, LARGE_PAGE_SIZE as u64) {
                    Some(memory_type) => pde.set_memory_type(memory_type as u64),
                    None => {
                        // The span straddles MTRR boundaries; split now and
                        // type each 4-KiB child individually.
                        let mut pt = AllocatedMemory::<Pt>::alloc_contiguous()?;
                        Self::fill_split(pde, pa, &mut pt, Some(mtrr));
                        split_pool.push(pt);
                    }
                }

                pa += LARGE_PAGE_SIZE as u64;
            }
        }

        Ok(())
    }

    /// Populates `pt` with 512 4-KiB leaves inheriting `pde`'s permissions,
    /// types them from `mtrr` (or inherit the parent type when `None`), and
    /// repoints the PDE at the new table.
    fn fill_split(pde: &mut Entry, large_base: u64, pt: &mut AllocatedMemory<Pt>, mtrr: Option<&MtrrMap>) {
        let parent_access = pde.access();
        let parent_type = pde.memory_type();

        for (slot, pte) in pt.0.entries.iter_mut().enumerate() {
            let page_pa = large_base + (slot as u64) * BASE_PAGE_SIZE as u64;
            pte.set_access(parent_access);
            pte.set_user_executable(pde.user_executable());
            pte.set_pfn(page_pa >> BASE_PAGE_SHIFT);
            pte.set_memory_type(match mtrr {
                Some(map) => map.type_for(page_pa) as u64,
                None => parent_type,
            });
        }

        let mut link = Entry(0);
        link.set_readable(true);
        link.set_writable(true);
        link.set_executable(true);
        link.set_user_executable(true);
        link.set_pfn(PhysicalAddress::pa_from_va(pt.as_ptr() as u64) >> BASE_PAGE_SHIFT);
        *pde = link;
    }

    /// Splits the 2-MiB leaf covering `guest_large_pa` into 4-KiB leaves held
    /// in `pt`. Idempotent: an already-split directory entry is left alone.
    pub fn split_2mb_to_4kb(&mut self, guest_large_pa: u64, pt: &mut AllocatedMemory<Pt>) -> Result<(), HypervisorError> {
        let pde = self.pde_for(guest_large_pa)?;

        if !pde.large() {
            trace!("2MiB entry already split: {:#x}", guest_large_pa);
            return Ok(());
        }

        Self::fill_split(pde, guest_large_pa & !(LARGE_PAGE_SIZE as u64 - 1), pt, None);
        Ok(())
    }

    /// Replaces the permissions of the 4-KiB leaf for `guest_pa`. The hosting
    /// 2-MiB span must already be split, with its table passed in `pt`.
    pub fn modify_page_permissions(&mut self, guest_pa: u64, access: AccessType, pt: &mut Pt) -> Result<(), HypervisorError> {
        self.assert_split(guest_pa)?;

        let pte = &mut pt.0.entries[pt_index(guest_pa)];
        pte.set_access(access);

        Ok(())
    }

    /// Repoints the 4-KiB leaf for `guest_pa` at `host_pa`, preserving the
    /// leaf's memory type and permissions.
    pub fn remap_page(&mut self, guest_pa: u64, host_pa: u64, pt: &mut Pt) -> Result<(), HypervisorError> {
        self.assert_split(guest_pa)?;

        let pte = &mut pt.0.entries[pt_index(guest_pa)];
        pte.set_pfn(host_pa >> BASE_PAGE_SHIFT);

        Ok(())
    }

    /// The raw 4-KiB leaf for `guest_pa` out of its split table, for saving
    /// and restoring around hooks.
    pub fn pt_entry(pt: &mut Pt, guest_pa: u64) -> &mut Entry {
        &mut pt.0.entries[pt_index(guest_pa)]
    }

    fn pde_for(&mut self, guest_pa: u64) -> Result<&mut Entry, HypervisorError> {
        if guest_pa.get_bits(39..) != 0 {
            return Err(HypervisorError::EptWalkFailed);
        }

        let pdpt_index = (guest_pa >> 30) as usize & 0x1FF;
        let pd_index = (guest_pa >> 21) as usize & 0x1FF;

        Ok(&mut self.pd[pdpt_index].0.entries[pd_index])
    }

    fn assert_split(&mut self, guest_pa: u64) -> Result<(), HypervisorError> {
        if self.pde_for(guest_pa)?.large() {
            return Err(HypervisorError::EptWalkFailed);
        }
        Ok(())
    }

    /// Builds the EPTP for this hierarchy: 4-level walk and write-back paging
    /// structures when IA32_VMX_EPT_VPID_CAP reports support, uncacheable
    /// otherwise.
    pub fn create_eptp_with_wb_and_4lvl_walk(&self) -> Result<u64, HypervisorError> {
        let capabilities = EptCapabilities::read();
        if !capabilities.page_walk_length_4 {
            return Err(HypervisorError::EptCapabilityMissing);
        }

        let memory_type = if capabilities.write_back_structures {
            MemoryType::WriteBack
        } else {
            MemoryType::Uncacheable
        };

        let pml4_pa = PhysicalAddress::pa_from_va(core::ptr::addr_of!(self.pml4) as u64);
        Ok(Eptp::new(pml4_pa, memory_type).0)
    }
}

/// An EPT pointer. Intel manual, Table 25-9.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Eptp(pub u64);

impl Eptp {
    pub fn new(pml4_pa: u64, memory_type: MemoryType) -> Self {
        let mut value = 0u64;
        value.set_bits(0..3, memory_type as u64);
        value.set_bits(3..6, 3); // page-walk length minus one
        value.set_bits(12..52, pml4_pa >> BASE_PAGE_SHIFT);
        Self(value)
    }
}

/// The subset of IA32_VMX_EPT_VPID_CAP this crate depends on.
#[derive(Clone, Copy, Debug)]
pub struct EptCapabilities {
    pub execute_only: bool,
    pub page_walk_length_4: bool,
    pub uncacheable_structures: bool,
    pub write_back_structures: bool,
    pub large_2mb_pages: bool,
    pub invept_single_context: bool,
    pub invept_all_contexts: bool,
    pub invvpid: bool,
}

impl EptCapabilities {
    pub fn read() -> Self {
        Self::from_msr(crate::intel::support::rdmsr(msr::IA32_VMX_EPT_VPID_CAP))
    }

    pub fn from_msr(value: u64) -> Self {
        Self {
            execute_only: value.get_bit(0),
            page_walk_length_4: value.get_bit(6),
            uncacheable_structures: value.get_bit(8),
            write_back_structures: value.get_bit(14),
            large_2mb_pages: value.get_bit(16),
            invept_single_context: value.get_bit(25),
            invept_all_contexts: value.get_bit(26),
            invvpid: value.get_bit(32),
        }
    }
}

fn pt_index(guest_pa: u64) -> usize {
    (guest_pa >> 12) as usize & 0x1FF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_access_roundtrip() {
        let mut entry = Entry(0);
        entry.set_access(AccessType::READ_WRITE);
        assert!(entry.readable());
        assert!(entry.writable());
        assert!(!entry.executable());
        assert_eq!(entry.access(), AccessType::READ_WRITE);

        entry.set_access(AccessType::EXECUTE);
        assert_eq!(entry.access(), AccessType::EXECUTE);
        assert!(!entry.writable());
    }

    #[test]
    fn entry_pfn_and_memory_type_are_independent_of_access() {
        let mut entry = Entry(0);
        entry.set_pfn(0x1234_5000 >> BASE_PAGE_SHIFT);
        entry.set_memory_type(MemoryType::WriteBack as u64);
        entry.set_access(AccessType::EXECUTE);

        assert_eq!(entry.pfn() << BASE_PAGE_SHIFT, 0x1234_5000);
        assert_eq!(entry.memory_type(), MemoryType::WriteBack as u64);
    }

    #[test]
    fn eptp_encodes_walk_length_and_type() {
        let eptp = Eptp::new(0xABC0_0000, MemoryType::WriteBack);
        assert_eq!(eptp.0 & 0x7, MemoryType::WriteBack as u64);
        assert_eq!((eptp.0 >> 3) & 0x7, 3);
        assert_eq!(eptp.0 & 0xFFFF_FFFF_F000, 0xABC0_0000);
    }

    #[test]
    fn capabilities_unpack_from_msr_value() {
        // Execute-only, 4-level walk, WB, 2MiB, both INVEPT types, INVVPID.
        let raw = 1 | (1 << 6) | (1 << 14) | (1 << 16) | (1 << 25) | (1 << 26) | (1 << 32);
        let capabilities = EptCapabilities::from_msr(raw);

        assert!(capabilities.execute_only);
        assert!(capabilities.page_walk_length_4);
        assert!(capabilities.write_back_structures);
        assert!(capabilities.large_2mb_pages);
        assert!(capabilities.invept_single_context);
        assert!(capabilities.invept_all_contexts);
        assert!(capabilities.invvpid);
        assert!(!capabilities.uncacheable_structures);
    }

    #[test]
    fn pt_index_selects_the_4k_slot() {
        assert_eq!(pt_index(0x0020_0000), 0);
        assert_eq!(pt_index(0x0020_1000), 1);
        assert_eq!(pt_index(0x003F_F000), 0x1FF);
    }
}
