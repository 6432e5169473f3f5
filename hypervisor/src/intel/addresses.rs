//! Address-space conversions between kernel virtual addresses and the
//! physical addresses handed to VMX structures and EPT entries.

use {
    crate::windows::nt::{MmGetPhysicalAddress, MmGetVirtualForPhysical},
    x86::bits64::paging::PAddr,
};

pub struct PhysicalAddress(PAddr);

impl PhysicalAddress {
    pub fn from_pa(pa: u64) -> Self {
        Self(PAddr::from(pa))
    }

    pub fn from_va(va: u64) -> Self {
        Self(PAddr::from(Self::pa_from_va(va)))
    }

    pub fn pa(&self) -> u64 {
        self.0.as_u64()
    }

    /// Translates a kernel virtual address under the current CR3.
    pub fn pa_from_va(va: u64) -> u64 {
        unsafe { MmGetPhysicalAddress(va as _) as u64 }
    }

    /// Maps a physical address back to an addressable kernel virtual address.
    pub fn va_from_pa(pa: u64) -> u64 {
        unsafe { MmGetVirtualForPhysical(pa as i64) as u64 }
    }
}
