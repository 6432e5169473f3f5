//! The MSR and I/O permission bitmaps consulted by the processor before
//! exiting on RDMSR/WRMSR and IN/OUT. All bits start clear, so nothing exits
//! until an upper layer marks the MSRs or ports it cares about.

use {bit_field::BitArray, derivative::Derivative};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsrAccessType {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsrOperation {
    /// Start exiting on the access.
    Hook,
    /// Stop exiting on the access.
    Unhook,
}

/// The 4-KiB MSR bitmap. Intel manual, Section 25.6.9: four 1-KiB quarters
/// for {read, write} x {low MSRs 0..0x1FFF, high MSRs 0xC0000000..0xC0001FFF}.
#[repr(C, align(4096))]
#[derive(Derivative)]
#[derivative(Debug)]
pub struct MsrBitmap {
    #[derivative(Debug = "ignore")]
    pub read_low: [u8; 1024],
    #[derivative(Debug = "ignore")]
    pub read_high: [u8; 1024],
    #[derivative(Debug = "ignore")]
    pub write_low: [u8; 1024],
    #[derivative(Debug = "ignore")]
    pub write_high: [u8; 1024],
}

static_assertions::const_assert_eq!(core::mem::size_of::<MsrBitmap>(), 4096);

const MSR_RANGE_LOW_BASE: u32 = 0x0000_0000;
const MSR_RANGE_HIGH_BASE: u32 = 0xC000_0000;
const MSR_RANGE_SIZE: u32 = 0x2000;

impl MsrBitmap {
    /// Marks or clears the intercept bit for one MSR and access direction.
    /// MSRs outside the two architectural ranges are ignored: accesses to
    /// them exit unconditionally regardless of the bitmap.
    pub fn modify_msr_interception(&mut self, msr: u32, access: MsrAccessType, operation: MsrOperation) {
        let intercept = operation == MsrOperation::Hook;

        let (bank, bit) = if msr < MSR_RANGE_LOW_BASE + MSR_RANGE_SIZE {
            (false, msr as usize)
        } else if (MSR_RANGE_HIGH_BASE..MSR_RANGE_HIGH_BASE + MSR_RANGE_SIZE).contains(&msr) {
            (true, (msr - MSR_RANGE_HIGH_BASE) as usize)
        } else {
            return;
        };

        match (access, bank) {
            (MsrAccessType::Read, false) => self.read_low.set_bit(bit, intercept),
            (MsrAccessType::Read, true) => self.read_high.set_bit(bit, intercept),
            (MsrAccessType::Write, false) => self.write_low.set_bit(bit, intercept),
            (MsrAccessType::Write, true) => self.write_high.set_bit(bit, intercept),
        }
    }

    pub fn is_intercepted(&self, msr: u32, access: MsrAccessType) -> bool {
        let (bank, bit) = if msr < MSR_RANGE_LOW_BASE + MSR_RANGE_SIZE {
            (false, msr as usize)
        } else if (MSR_RANGE_HIGH_BASE..MSR_RANGE_HIGH_BASE + MSR_RANGE_SIZE).contains(&msr) {
            (true, (msr - MSR_RANGE_HIGH_BASE) as usize)
        } else {
            return true;
        };

        match (access, bank) {
            (MsrAccessType::Read, false) => self.read_low.get_bit(bit),
            (MsrAccessType::Read, true) => self.read_high.get_bit(bit),
            (MsrAccessType::Write, false) => self.write_low.get_bit(bit),
            (MsrAccessType::Write, true) => self.write_high.get_bit(bit),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOperation {
    Hook,
    Unhook,
}

/// The pair of 4-KiB I/O bitmaps: A covers ports 0x0000..0x7FFF, B covers
/// 0x8000..0xFFFF. Intel manual, Section 25.6.4.
#[repr(C, align(4096))]
#[derive(Derivative)]
#[derivative(Debug)]
pub struct IoBitmaps {
    #[derivative(Debug = "ignore")]
    pub a: [u8; 4096],
    #[derivative(Debug = "ignore")]
    pub b: [u8; 4096],
}

static_assertions::const_assert_eq!(core::mem::size_of::<IoBitmaps>(), 8192);

impl IoBitmaps {
    pub fn modify_io_interception(&mut self, port: u16, operation: IoOperation) {
        let intercept = operation == IoOperation::Hook;

        if port < 0x8000 {
            self.a.set_bit(port as usize, intercept);
        } else {
            self.b.set_bit((port - 0x8000) as usize, intercept);
        }
    }

    pub fn is_intercepted(&self, port: u16) -> bool {
        if port < 0x8000 {
            self.a.get_bit(port as usize)
        } else {
            self.b.get_bit((port - 0x8000) as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_msr_bitmap() -> alloc::boxed::Box<MsrBitmap> {
        unsafe { alloc::boxed::Box::new_zeroed().assume_init() }
    }

    #[test]
    fn msr_bit_is_set_for_exactly_one_msr_and_direction() {
        let mut bitmap = zeroed_msr_bitmap();

        bitmap.modify_msr_interception(x86::msr::IA32_LSTAR, MsrAccessType::Write, MsrOperation::Hook);

        assert!(bitmap.is_intercepted(x86::msr::IA32_LSTAR, MsrAccessType::Write));
        assert!(!bitmap.is_intercepted(x86::msr::IA32_LSTAR, MsrAccessType::Read));
        assert!(!bitmap.is_intercepted(x86::msr::IA32_LSTAR - 1, MsrAccessType::Write));
        assert!(!bitmap.is_intercepted(x86::msr::IA32_LSTAR + 1, MsrAccessType::Write));

        bitmap.modify_msr_interception(x86::msr::IA32_LSTAR, MsrAccessType::Write, MsrOperation::Unhook);
        assert!(!bitmap.is_intercepted(x86::msr::IA32_LSTAR, MsrAccessType::Write));
    }

    #[test]
    fn low_and_high_banks_do_not_alias() {
        let mut bitmap = zeroed_msr_bitmap();

        bitmap.modify_msr_interception(0x10, MsrAccessType::Read, MsrOperation::Hook);
        assert!(bitmap.is_intercepted(0x10, MsrAccessType::Read));
        assert!(!bitmap.is_intercepted(0xC000_0010, MsrAccessType::Read));
    }

    #[test]
    fn out_of_range_msrs_always_report_intercepted() {
        let bitmap = zeroed_msr_bitmap();
        assert!(bitmap.is_intercepted(0x4000_0000, MsrAccessType::Read));
    }

    #[test]
    fn io_port_bits_split_across_the_two_bitmaps() {
        let mut bitmaps: alloc::boxed::Box<IoBitmaps> = unsafe { alloc::boxed::Box::new_zeroed().assume_init() };

        bitmaps.modify_io_interception(0x60, IoOperation::Hook);
        bitmaps.modify_io_interception(0x8064, IoOperation::Hook);

        assert!(bitmaps.is_intercepted(0x60));
        assert!(bitmaps.is_intercepted(0x8064));
        assert!(!bitmaps.is_intercepted(0x61));
        assert!(bitmaps.a.get_bit(0x60));
        assert!(bitmaps.b.get_bit(0x64));

        bitmaps.modify_io_interception(0x60, IoOperation::Unhook);
        assert!(!bitmaps.is_intercepted(0x60));
    }
}
