//! Physically contiguous allocations for the 4-KByte VMX regions and page
//! tables, and fault-free access to guest memory under an arbitrary CR3.

use {
    crate::{
        error::HypervisorError,
        intel::support,
        windows::nt::{MmAllocateContiguousMemory, MmFreeContiguousMemory, MmGetPhysicalAddress},
    },
    core::{
        mem::size_of,
        ops::{Deref, DerefMut},
        ptr::NonNull,
    },
    x86::bits64::paging::BASE_PAGE_SIZE,
};

/// A zeroed, physically contiguous, page-aligned allocation of `T`, freed on
/// drop. VMXON/VMCS regions, bitmaps, stacks and EPT tables all live in these
/// so that their physical addresses can be handed to hardware.
pub struct AllocatedMemory<T>(NonNull<T>);

impl<T> AllocatedMemory<T> {
    /// Allocates and zeroes a contiguous region large enough for `T`.
    pub fn alloc_contiguous() -> Result<Self, HypervisorError> {
        // Accept any physical address the machine can produce.
        let ptr = unsafe { MmAllocateContiguousMemory(size_of::<T>(), -1) };

        let ptr = NonNull::new(ptr.cast::<T>()).ok_or(HypervisorError::MemoryAllocationFailed)?;
        unsafe { core::ptr::write_bytes(ptr.as_ptr().cast::<u8>(), 0, size_of::<T>()) };

        Ok(Self(ptr))
    }

    pub fn as_ptr(&self) -> *mut T {
        self.0.as_ptr()
    }

    /// The physical address of the allocation.
    pub fn pa(&self) -> u64 {
        unsafe { MmGetPhysicalAddress(self.0.as_ptr().cast()) as u64 }
    }
}

impl<T> Deref for AllocatedMemory<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.0.as_ref() }
    }
}

impl<T> DerefMut for AllocatedMemory<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.0.as_mut() }
    }
}

impl<T> Drop for AllocatedMemory<T> {
    fn drop(&mut self) {
        unsafe { MmFreeContiguousMemory(self.0.as_ptr().cast()) };
    }
}

// The allocations are plain memory; ownership transfers between cores only
// through the broadcast layer.
unsafe impl<T: Send> Send for AllocatedMemory<T> {}
unsafe impl<T: Sync> Sync for AllocatedMemory<T> {}

/// Switches CR3 to a target address space and restores the original on every
/// exit path, including panics that unwind into an abort.
pub struct Cr3Guard {
    original: u64,
}

impl Cr3Guard {
    pub fn switch(target_cr3: u64) -> Self {
        let original = support::cr3();
        if target_cr3 != original {
            support::cr3_write(target_cr3);
        }
        Self { original }
    }
}

impl Drop for Cr3Guard {
    fn drop(&mut self) {
        if support::cr3() != self.original {
            support::cr3_write(self.original);
        }
    }
}

/// Reads guest memory at `guest_va` under `target_cr3` into `buffer`.
///
/// Each page is probed for a valid translation before it is touched, so the
/// helper never faults in VMX root; an unmapped page fails the whole read with
/// `GuestMemoryInaccessible` and zero bytes are reported as copied.
pub fn read_guest_memory(guest_va: u64, target_cr3: u64, buffer: &mut [u8]) -> Result<(), HypervisorError> {
    let _guard = Cr3Guard::switch(target_cr3);

    let mut va = guest_va;
    let mut copied = 0usize;

    while copied < buffer.len() {
        if unsafe { MmGetPhysicalAddress(va as _) } == 0 {
            return Err(HypervisorError::GuestMemoryInaccessible);
        }

        let page_remaining = BASE_PAGE_SIZE - (va as usize & (BASE_PAGE_SIZE - 1));
        let chunk = page_remaining.min(buffer.len() - copied);

        unsafe {
            core::ptr::copy_nonoverlapping(va as *const u8, buffer[copied..].as_mut_ptr(), chunk);
        }

        va += chunk as u64;
        copied += chunk;
    }

    Ok(())
}

/// Writes `buffer` to guest memory at `guest_va` under `target_cr3`, with the
/// same fault-free probing as [`read_guest_memory`].
pub fn write_guest_memory(guest_va: u64, target_cr3: u64, buffer: &[u8]) -> Result<(), HypervisorError> {
    let _guard = Cr3Guard::switch(target_cr3);

    let mut va = guest_va;
    let mut copied = 0usize;

    while copied < buffer.len() {
        if unsafe { MmGetPhysicalAddress(va as _) } == 0 {
            return Err(HypervisorError::GuestMemoryInaccessible);
        }

        let page_remaining = BASE_PAGE_SIZE - (va as usize & (BASE_PAGE_SIZE - 1));
        let chunk = page_remaining.min(buffer.len() - copied);

        unsafe {
            core::ptr::copy_nonoverlapping(buffer[copied..].as_ptr(), va as *mut u8, chunk);
        }

        va += chunk as u64;
        copied += chunk;
    }

    Ok(())
}

/// Resolves a guest virtual address to a guest physical address under
/// `target_cr3` without faulting.
pub fn guest_va_to_pa(guest_va: u64, target_cr3: u64) -> Result<u64, HypervisorError> {
    let _guard = Cr3Guard::switch(target_cr3);

    match unsafe { MmGetPhysicalAddress(guest_va as _) } {
        0 => Err(HypervisorError::VirtualToPhysicalAddressFailed),
        pa => Ok(pa as u64),
    }
}
