//! Preallocated page tables and shadow pages for the hook engine. The pools
//! are filled at PASSIVE_LEVEL during initialization so that hook application
//! from VMX root never allocates.

use {
    crate::{error::HypervisorError, intel::ept::Pt, windows::memory::AllocatedMemory},
    alloc::{collections::BTreeMap, vec::Vec},
    log::*,
    x86::bits64::paging::{BASE_PAGE_SIZE, LARGE_PAGE_SIZE},
};

/// A 4-KiB buffer holding the modified view of one hooked guest frame.
#[repr(C, align(4096))]
pub struct ShadowPage {
    pub bytes: [u8; BASE_PAGE_SIZE],
}

/// Pools of split page tables (keyed by the 2-MiB span they cover) and shadow
/// pages (keyed by the 4-KiB guest frame they mirror).
pub struct MemoryManager {
    free_page_tables: Vec<AllocatedMemory<Pt>>,
    free_shadow_pages: Vec<AllocatedMemory<ShadowPage>>,
    active_page_tables: BTreeMap<u64, AllocatedMemory<Pt>>,
    active_shadow_pages: BTreeMap<u64, AllocatedMemory<ShadowPage>>,
}

impl MemoryManager {
    /// Preallocates `capacity` page tables and shadow pages.
    pub fn new(capacity: usize) -> Result<Self, HypervisorError> {
        trace!("Preallocating {} page tables and shadow pages", capacity);

        let mut free_page_tables = Vec::with_capacity(capacity);
        let mut free_shadow_pages = Vec::with_capacity(capacity);

        for _ in 0..capacity {
            free_page_tables.push(AllocatedMemory::alloc_contiguous()?);
            free_shadow_pages.push(AllocatedMemory::alloc_contiguous()?);
        }

        Ok(Self {
            free_page_tables,
            free_shadow_pages,
            active_page_tables: BTreeMap::new(),
            active_shadow_pages: BTreeMap::new(),
        })
    }

    fn large_page_key(guest_pa: u64) -> u64 {
        guest_pa & !(LARGE_PAGE_SIZE as u64 - 1)
    }

    fn base_page_key(guest_pa: u64) -> u64 {
        guest_pa & !(BASE_PAGE_SIZE as u64 - 1)
    }

    /// Whether the 2-MiB span covering `guest_pa` already has a split table.
    pub fn is_page_split(&self, guest_pa: u64) -> bool {
        self.active_page_tables.contains_key(&Self::large_page_key(guest_pa))
    }

    /// Whether the guest frame already has a shadow copy.
    pub fn is_page_copied(&self, guest_pa: u64) -> bool {
        self.active_shadow_pages.contains_key(&Self::base_page_key(guest_pa))
    }

    /// Takes a preallocated table for the 2-MiB span covering `guest_pa`, or
    /// returns the one already assigned.
    pub fn get_or_create_page_table(&mut self, guest_pa: u64) -> Result<&mut AllocatedMemory<Pt>, HypervisorError> {
        let key = Self::large_page_key(guest_pa);

        if !self.active_page_tables.contains_key(&key) {
            let pt = self.free_page_tables.pop().ok_or(HypervisorError::PoolExhausted)?;
            self.active_page_tables.insert(key, pt);
        }

        Ok(self.active_page_tables.get_mut(&key).unwrap())
    }

    pub fn get_page_table(&mut self, guest_pa: u64) -> Option<&mut AllocatedMemory<Pt>> {
        self.active_page_tables.get_mut(&Self::large_page_key(guest_pa))
    }

    /// Takes a preallocated shadow page for the guest frame, or returns the
    /// one already assigned.
    pub fn get_or_create_shadow_page(&mut self, guest_pa: u64) -> Result<&mut AllocatedMemory<ShadowPage>, HypervisorError> {
        let key = Self::base_page_key(guest_pa);

        if !self.active_shadow_pages.contains_key(&key) {
            let shadow = self.free_shadow_pages.pop().ok_or(HypervisorError::PoolExhausted)?;
            self.active_shadow_pages.insert(key, shadow);
        }

        Ok(self.active_shadow_pages.get_mut(&key).unwrap())
    }

    pub fn get_shadow_page(&mut self, guest_pa: u64) -> Option<&mut AllocatedMemory<ShadowPage>> {
        self.active_shadow_pages.get_mut(&Self::base_page_key(guest_pa))
    }

    /// Returns the shadow page of an unhooked frame to the free pool. The
    /// split table stays active: other hooks may share the 2-MiB span, and a
    /// split mapping is harmless without them.
    pub fn release_shadow_page(&mut self, guest_pa: u64) {
        if let Some(shadow) = self.active_shadow_pages.remove(&Self::base_page_key(guest_pa)) {
            self.free_shadow_pages.push(shadow);
        }
    }

    /// Remaining pool capacity, for exhaustion diagnostics.
    pub fn available(&self) -> (usize, usize) {
        (self.free_page_tables.len(), self.free_shadow_pages.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The pools call into the NT contiguous allocator, so tests cover only
    // the key arithmetic.
    #[test]
    fn keys_round_down_to_their_page_sizes() {
        assert_eq!(MemoryManager::large_page_key(0x1234_5678), 0x1220_0000);
        assert_eq!(MemoryManager::base_page_key(0x1234_5678), 0x1234_5000);
    }
}
