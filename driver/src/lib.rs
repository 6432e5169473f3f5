//! The kernel-driver shell around the hypervisor: `DriverEntry` installs the
//! hypervisor beneath the running system, `DriverUnload` removes it. All
//! policy lives in the `hypervisor` crate; this is only the loader.

#![no_std]
#![allow(non_snake_case)]

extern crate alloc;

use {
    core::ffi::c_void,
    kernel_alloc::KernelAlloc,
    log::{self, LevelFilter},
};

#[global_allocator]
static GLOBAL: KernelAlloc = KernelAlloc;

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("{}", info);
    loop {
        core::hint::spin_loop();
    }
}

pub type NTSTATUS = i32;
pub const STATUS_SUCCESS: NTSTATUS = 0;
pub const STATUS_UNSUCCESSFUL: NTSTATUS = 0xC000_0001u32 as i32;

#[repr(C)]
pub struct DriverObject {
    _reserved: [u8; 0x68],
    pub driver_unload: *mut c_void,
}

/// Installs the hypervisor on every logical processor.
#[no_mangle]
pub extern "system" fn DriverEntry(driver: &mut DriverObject, _registry_path: *const c_void) -> NTSTATUS {
    kernel_log::KernelLogger::init(LevelFilter::Info).expect("Failed to initialize logger");

    log::info!("Driver loaded");

    driver.driver_unload = driver_unload as *const () as *mut c_void;

    if !hypervisor::vmx_initialize() {
        log::error!("Failed to virtualize the system");
        return STATUS_UNSUCCESSFUL;
    }

    STATUS_SUCCESS
}

/// Devirtualizes every core and releases all hypervisor memory.
pub extern "system" fn driver_unload(_driver: *mut DriverObject) {
    log::info!("Driver unloading");
    hypervisor::vmx_terminate();
}
