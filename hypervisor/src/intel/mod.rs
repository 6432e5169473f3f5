pub mod addresses;
pub mod bitmap;
pub mod capture;
pub mod descriptor;
pub mod ept;
pub mod events;
pub mod hooks;
pub mod invept;
pub mod invvpid;
pub mod mtrr;
pub mod shared;
pub mod support;
pub mod vcpu;
pub mod vmcall;
pub mod vmcs;
pub mod vmerror;
pub mod vmexit;
pub mod vmlaunch;
pub mod vmxon;
