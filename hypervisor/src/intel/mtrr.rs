//! Parsing of the fixed and variable memory-type-range registers into a
//! normalized map queried while building EPT identity mappings, so that every
//! EPT leaf carries the memory type the firmware programmed for its span.

use {
    crate::{error::HypervisorError, intel::support::rdmsr},
    alloc::vec::Vec,
    bit_field::BitField,
    log::*,
    num_derive::FromPrimitive,
    num_traits::FromPrimitive,
    x86::msr,
};

/// Memory types as encoded in MTRRs and EPT leaves. Intel manual,
/// Table 12-8.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

/// A normalized physical range with one memory type.
#[derive(Clone, Copy, Debug)]
pub struct MtrrRange {
    pub base: u64,
    pub end: u64,
    pub memory_type: MemoryType,
}

impl MtrrRange {
    fn contains(&self, pa: u64) -> bool {
        pa >= self.base && pa < self.end
    }
}

/// Raw MTRR state as read from the MSRs, separated from the normalization so
/// the latter stays pure.
#[derive(Clone, Debug, Default)]
pub struct MtrrSnapshot {
    pub default_type_msr: u64,
    pub fix64k: u64,
    pub fix16k: [u64; 2],
    pub fix4k: [u64; 8],
    /// (IA32_MTRR_PHYSBASEn, IA32_MTRR_PHYSMASKn) pairs.
    pub variable: Vec<(u64, u64)>,
    /// MAXPHYADDR from CPUID 80000008H.
    pub physical_address_bits: u8,
}

#[derive(Debug)]
pub struct MtrrMap {
    fixed: Vec<MtrrRange>,
    variable: Vec<MtrrRange>,
    fixed_enabled: bool,
    default_type: MemoryType,
}

const FIXED_64K_BASE: u64 = 0x0;
const FIXED_16K_BASE: u64 = 0x8_0000;
const FIXED_4K_BASE: u64 = 0xC_0000;
const ONE_MIB: u64 = 0x10_0000;

impl MtrrMap {
    /// Reads the live MTRR MSRs and normalizes them.
    pub fn build() -> Result<Self, HypervisorError> {
        let capabilities = rdmsr(msr::IA32_MTRRCAP);
        let variable_count = capabilities.get_bits(0..8) as usize;

        let mut snapshot = MtrrSnapshot {
            default_type_msr: rdmsr(msr::IA32_MTRR_DEF_TYPE),
            fix64k: rdmsr(msr::IA32_MTRR_FIX64K_00000),
            fix16k: [rdmsr(msr::IA32_MTRR_FIX16K_80000), rdmsr(msr::IA32_MTRR_FIX16K_A0000)],
            fix4k: [
                rdmsr(msr::IA32_MTRR_FIX4K_C0000),
                rdmsr(msr::IA32_MTRR_FIX4K_C8000),
                rdmsr(msr::IA32_MTRR_FIX4K_D0000),
                rdmsr(msr::IA32_MTRR_FIX4K_D8000),
                rdmsr(msr::IA32_MTRR_FIX4K_E0000),
                rdmsr(msr::IA32_MTRR_FIX4K_E8000),
                rdmsr(msr::IA32_MTRR_FIX4K_F0000),
                rdmsr(msr::IA32_MTRR_FIX4K_F8000),
            ],
            variable: Vec::with_capacity(variable_count),
            physical_address_bits: (x86::cpuid::cpuid!(0x8000_0008).eax & 0xFF) as u8,
        };

        for index in 0..variable_count {
            // IA32_MTRR_PHYSBASE0/PHYSMASK0 pairs are contiguous upward.
            let base = rdmsr(msr::IA32_MTRR_PHYSBASE0 + (index as u32) * 2);
            let mask = rdmsr(msr::IA32_MTRR_PHYSBASE0 + (index as u32) * 2 + 1);
            snapshot.variable.push((base, mask));
        }

        let map = Self::normalize(&snapshot)?;
        trace!("MTRR map: {} fixed ranges, {} variable ranges", map.fixed.len(), map.variable.len());

        Ok(map)
    }

    /// Normalizes a raw snapshot into queryable range lists. Fails when
    /// variable ranges overlap with a precedence the SDM leaves undefined.
    pub fn normalize(snapshot: &MtrrSnapshot) -> Result<Self, HypervisorError> {
        let mtrr_enabled = snapshot.default_type_msr.get_bit(11);
        let fixed_enabled = mtrr_enabled && snapshot.default_type_msr.get_bit(10);
        let default_type = if mtrr_enabled {
            MemoryType::from_u8(snapshot.default_type_msr.get_bits(0..8) as u8)
                .unwrap_or(MemoryType::Uncacheable)
        } else {
            MemoryType::Uncacheable
        };

        let mut fixed = Vec::new();
        Self::unpack_fixed(snapshot.fix64k, FIXED_64K_BASE, 0x1_0000, &mut fixed);
        for (i, value) in snapshot.fix16k.iter().enumerate() {
            Self::unpack_fixed(*value, FIXED_16K_BASE + (i as u64) * 8 * 0x4000, 0x4000, &mut fixed);
        }
        for (i, value) in snapshot.fix4k.iter().enumerate() {
            Self::unpack_fixed(*value, FIXED_4K_BASE + (i as u64) * 8 * 0x1000, 0x1000, &mut fixed);
        }

        let physical_mask = (1u64 << snapshot.physical_address_bits) - 1;
        let mut variable = Vec::new();

        for (base_msr, mask_msr) in &snapshot.variable {
            if !mask_msr.get_bit(11) {
                continue;
            }

            let memory_type = MemoryType::from_u8(base_msr.get_bits(0..8) as u8)
                .ok_or(HypervisorError::MtrrOverlapUndefined)?;
            let base = base_msr & physical_mask & !0xFFF;
            let mask = mask_msr & physical_mask & !0xFFF;
            let length = (!mask & physical_mask) + 1;

            variable.push(MtrrRange {
                base,
                end: base + length,
                memory_type,
            });
        }

        Self::validate_overlaps(&variable)?;

        Ok(Self {
            fixed,
            variable,
            fixed_enabled,
            default_type,
        })
    }

    fn unpack_fixed(msr_value: u64, base: u64, granule: u64, out: &mut Vec<MtrrRange>) {
        for slot in 0..8u64 {
            let raw = ((msr_value >> (slot * 8)) & 0xFF) as u8;
            let memory_type = MemoryType::from_u8(raw).unwrap_or(MemoryType::Uncacheable);
            out.push(MtrrRange {
                base: base + slot * granule,
                end: base + (slot + 1) * granule,
                memory_type,
            });
        }
    }

    /// Overlapping variable ranges are defined by the SDM only when one side
    /// is UC or the pair is {WT, WB}; anything else aborts initialization.
    fn validate_overlaps(variable: &[MtrrRange]) -> Result<(), HypervisorError> {
        for (i, a) in variable.iter().enumerate() {
            for b in &variable[i + 1..] {
                let disjoint = a.end <= b.base || b.end <= a.base;
                if disjoint || a.memory_type == b.memory_type {
                    continue;
                }

                let pair = (a.memory_type, b.memory_type);
                let defined = matches!(
                    pair,
                    (MemoryType::Uncacheable, _)
                        | (_, MemoryType::Uncacheable)
                        | (MemoryType::WriteThrough, MemoryType::WriteBack)
                        | (MemoryType::WriteBack, MemoryType::WriteThrough)
                );

                if !defined {
                    error!("Undefined MTRR overlap: {:x?} vs {:x?}", a, b);
                    return Err(HypervisorError::MtrrOverlapUndefined);
                }
            }
        }

        Ok(())
    }

    /// The effective memory type for one physical address.
    pub fn type_for(&self, pa: u64) -> MemoryType {
        if self.fixed_enabled && pa < ONE_MIB {
            if let Some(range) = self.fixed.iter().find(|r| r.contains(pa)) {
                return range.memory_type;
            }
        }

        let mut result: Option<MemoryType> = None;
        for range in self.variable.iter().filter(|r| r.contains(pa)) {
            result = Some(match (result, range.memory_type) {
                (None, t) => t,
                (Some(MemoryType::Uncacheable), _) | (Some(_), MemoryType::Uncacheable) => MemoryType::Uncacheable,
                (Some(MemoryType::WriteThrough), MemoryType::WriteBack)
                | (Some(MemoryType::WriteBack), MemoryType::WriteThrough) => MemoryType::WriteThrough,
                (Some(t), _) => t,
            });
        }

        result.unwrap_or(self.default_type)
    }

    /// The memory type for `[base, base + length)` when uniform, `None` when
    /// the span straddles differently typed ranges and must be split.
    pub fn type_for_range(&self, base: u64, length: u64) -> Option<MemoryType> {
        let first = self.type_for(base);

        // Probe every boundary a fixed or variable range can introduce
        // inside the span.
        let mut boundaries: Vec<u64> = self
            .fixed
            .iter()
            .chain(self.variable.iter())
            .flat_map(|r| [r.base, r.end])
            .filter(|&edge| edge > base && edge < base + length)
            .collect();
        boundaries.sort_unstable();
        boundaries.dedup();

        for edge in boundaries {
            if self.type_for(edge) != first {
                return None;
            }
        }

        Some(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    /// A snapshot with MTRRs enabled, fixed enabled, default UC, 36-bit
    /// physical addresses.
    fn snapshot() -> MtrrSnapshot {
        MtrrSnapshot {
            default_type_msr: (1 << 11) | (1 << 10),
            // All of the first 512 KiB write-back.
            fix64k: 0x0606_0606_0606_0606,
            fix16k: [0x0606_0606_0606_0606, 0x0000_0000_0000_0000],
            fix4k: [0; 8],
            variable: vec![],
            physical_address_bits: 36,
        }
    }

    fn variable(base: u64, length: u64, memory_type: MemoryType) -> (u64, u64) {
        let mask = !(length - 1) & ((1 << 36) - 1);
        (base | memory_type as u64, mask | (1 << 11))
    }

    #[test]
    fn fixed_ranges_win_below_one_mib() {
        let mut s = snapshot();
        // A variable UC range over the whole first 16 MiB.
        s.variable.push(variable(0, 0x100_0000, MemoryType::Uncacheable));
        let map = MtrrMap::normalize(&s).unwrap();

        // Fixed says WB at 0x1000, variable says UC: fixed wins below 1 MiB.
        assert_eq!(map.type_for(0x1000), MemoryType::WriteBack);
        // The A0000 bank is typed UC (0) by the snapshot.
        assert_eq!(map.type_for(0xA0000), MemoryType::Uncacheable);
        // Above 1 MiB the variable range applies.
        assert_eq!(map.type_for(0x20_0000), MemoryType::Uncacheable);
    }

    #[test]
    fn uncacheable_takes_precedence_over_write_back() {
        let mut s = snapshot();
        s.variable.push(variable(0x100_0000, 0x100_0000, MemoryType::WriteBack));
        s.variable.push(variable(0x180_0000, 0x80_0000, MemoryType::Uncacheable));
        let map = MtrrMap::normalize(&s).unwrap();

        assert_eq!(map.type_for(0x110_0000), MemoryType::WriteBack);
        assert_eq!(map.type_for(0x190_0000), MemoryType::Uncacheable);
    }

    #[test]
    fn write_through_takes_precedence_over_write_back() {
        let mut s = snapshot();
        s.variable.push(variable(0x100_0000, 0x100_0000, MemoryType::WriteBack));
        s.variable.push(variable(0x100_0000, 0x80_0000, MemoryType::WriteThrough));
        let map = MtrrMap::normalize(&s).unwrap();

        assert_eq!(map.type_for(0x100_0000), MemoryType::WriteThrough);
        assert_eq!(map.type_for(0x190_0000), MemoryType::WriteBack);
    }

    #[test]
    fn undefined_overlap_aborts() {
        let mut s = snapshot();
        s.variable.push(variable(0x100_0000, 0x100_0000, MemoryType::WriteCombining));
        s.variable.push(variable(0x180_0000, 0x80_0000, MemoryType::WriteBack));

        assert!(matches!(
            MtrrMap::normalize(&s),
            Err(HypervisorError::MtrrOverlapUndefined)
        ));
    }

    #[test]
    fn unmapped_addresses_take_the_default_type() {
        let map = MtrrMap::normalize(&snapshot()).unwrap();
        assert_eq!(map.type_for(0x4000_0000), MemoryType::Uncacheable);
    }

    #[test]
    fn straddling_span_reports_none() {
        let mut s = snapshot();
        s.variable.push(variable(0x100_0000, 0x100_0000, MemoryType::WriteBack));
        let map = MtrrMap::normalize(&s).unwrap();

        // A 2 MiB span half inside the WB range.
        assert_eq!(map.type_for_range(0x1F0_0000, 0x20_0000), None);
        // Fully inside.
        assert_eq!(map.type_for_range(0x110_0000, 0x20_0000), Some(MemoryType::WriteBack));
    }
}
