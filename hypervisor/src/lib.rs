//! Kernel-resident Intel VT-x/EPT hypervisor that installs itself beneath the
//! running operating system and exposes physical-memory hiding primitives to a
//! kernel debugger.
//!
//! The crate virtualizes each logical processor in place, identity-maps guest
//! physical memory through EPT with MTRR-correct memory types, and multiplexes
//! hidden reads/writes against hidden executes by flipping hooked EPT leaves
//! between a data view and an executable shadow view.

#![no_std]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;

pub mod callbacks;
pub mod config;
pub mod error;
pub mod intel;
pub mod vmm;
pub mod windows;

pub use config::*;
pub use vmm::{vmx_initialize, vmx_terminate};
