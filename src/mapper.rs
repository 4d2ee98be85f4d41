use tracing::warn;

use crate::architecture::{bit, Architecture, DramAddr, Level};
use crate::config::{DramConfig, FieldBit};
use crate::error::{RemuError, Result};

/// `DramAddr` fields are `u32`.
const MAX_LEVEL_BITS: u32 = 32;

/// Bit-exact decoder driven by a [`DramConfig`].
///
/// Decoding is a plain bit gather. Encoding writes every directly mapped
/// source bit first, then solves the XOR-mapped bits as a linear system
/// over GF(2): source bits that no equation pins down are left at 0.
#[derive(Clone, Debug)]
pub struct AddressMapper {
    config: DramConfig,
    direct_mask: u64,
}

impl AddressMapper {
    pub fn new(config: DramConfig) -> Result<AddressMapper> {
        if config.dq >= 64 {
            return Err(RemuError::InvalidConfig(format!(
                "DQ shift of {} leaves no address bits",
                config.dq
            )));
        }
        let mut direct_mask = 0u64;
        let mut highest = None;
        for level in Level::ALL {
            let bits = config.hierarchy.bits(level);
            if bits > MAX_LEVEL_BITS {
                return Err(RemuError::LevelTooWide {
                    level,
                    bits,
                    max: MAX_LEVEL_BITS,
                });
            }
            let fields = config.mapping(level);
            if fields.len() > MAX_LEVEL_BITS as usize {
                return Err(RemuError::LevelTooWide {
                    level,
                    bits: fields.len() as u32,
                    max: MAX_LEVEL_BITS,
                });
            }
            if fields.len() != bits as usize {
                warn!(
                    %level,
                    mapped = fields.len(),
                    bits,
                    "mapping length differs from the level width"
                );
            }
            for field in fields {
                for &src in field.sources() {
                    if src >= 64 {
                        return Err(RemuError::SourceBitTooHigh { bit: src });
                    }
                    highest = highest.max(Some(src));
                }
                if let FieldBit::Direct(src) = field {
                    if direct_mask & (1 << src) != 0 {
                        return Err(RemuError::DuplicateSource { bit: *src });
                    }
                    direct_mask |= 1 << src;
                }
            }
        }
        if let Some(src) = highest {
            if config.dq + src >= 64 {
                return Err(RemuError::InvalidConfig(format!(
                    "source bit {src} shifted by DQ {} is beyond the 64-bit address",
                    config.dq
                )));
            }
        }
        Ok(AddressMapper {
            config,
            direct_mask,
        })
    }

    pub fn config(&self) -> &DramConfig {
        &self.config
    }

    /// Source bits written verbatim by some field.
    pub fn direct_mask(&self) -> u64 {
        self.direct_mask
    }
}

// XOR of `sources`; a bit listed twice cancels out.
fn source_mask(sources: &[u32]) -> u64 {
    sources.iter().fold(0, |m, &s| m ^ (1u64 << s))
}

fn parity(x: u64) -> u64 {
    u64::from(x.count_ones() & 1)
}

struct Equation {
    mask: u64,
    rhs: u64,
    level: Level,
    bit: u32,
}

impl Architecture for AddressMapper {
    fn level_bits(&self, level: Level) -> u32 {
        self.config.hierarchy.bits(level)
    }

    fn granule_bits(&self) -> u32 {
        self.config.dq
    }

    fn decode_granule(&self, granule: u64) -> Result<DramAddr> {
        let mut addr = DramAddr::new();
        for level in Level::ALL {
            let mut value = 0u64;
            for (i, field) in self.config.mapping(level).iter().enumerate() {
                let b = match field {
                    FieldBit::Direct(src) => bit(granule, *src),
                    FieldBit::Xor(srcs) => parity(granule & source_mask(srcs)),
                };
                value |= b << i;
            }
            let limit = self.level_size(level);
            if value >= limit {
                return Err(RemuError::OutOfRange {
                    level,
                    value,
                    limit,
                });
            }
            addr.set(level, value as u32);
        }
        Ok(addr)
    }

    fn encode_granule(&self, a: &DramAddr) -> Result<u64> {
        let mut granule = 0u64;
        let mut equations = Vec::new();

        for level in Level::ALL {
            let value = u64::from(a.get(level));
            let limit = self.level_size(level);
            if value >= limit {
                return Err(RemuError::OutOfRange {
                    level,
                    value,
                    limit,
                });
            }
            for (i, field) in self.config.mapping(level).iter().enumerate() {
                let target = bit(value, i as u32);
                match field {
                    FieldBit::Direct(src) => granule |= target << src,
                    FieldBit::Xor(srcs) => equations.push(Equation {
                        mask: source_mask(srcs),
                        rhs: target,
                        level,
                        bit: i as u32,
                    }),
                }
            }
        }

        // Substitute the direct bits, then reduce to row echelon form.
        let mut pivots: Vec<(u32, Equation)> = Vec::new();
        for mut eq in equations {
            eq.rhs ^= parity(granule & eq.mask & self.direct_mask);
            eq.mask &= !self.direct_mask;
            for (p, row) in &pivots {
                if eq.mask & (1 << p) != 0 {
                    eq.mask ^= row.mask;
                    eq.rhs ^= row.rhs;
                }
            }
            if eq.mask == 0 {
                if eq.rhs != 0 {
                    return Err(RemuError::Unencodable {
                        level: eq.level,
                        bit: eq.bit,
                    });
                }
                continue;
            }
            let p = eq.mask.trailing_zeros();
            for (_, row) in pivots.iter_mut() {
                if row.mask & (1 << p) != 0 {
                    row.mask ^= eq.mask;
                    row.rhs ^= eq.rhs;
                }
            }
            pivots.push((p, eq));
        }

        // Fully reduced: every non-pivot variable is free and set to 0.
        for (p, row) in &pivots {
            granule |= row.rhs << p;
        }
        Ok(granule)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::config::Hierarchy;

    /// bankgroup 2, bank 3, column 10, row 17 bits; 32-byte granules.
    pub(crate) fn ddr4_hierarchy() -> Hierarchy {
        Hierarchy {
            bankgroup_bits: 2,
            bank_bits: 3,
            column_bits: 10,
            row_bits: 17,
            ..Hierarchy::default()
        }
    }

    pub(crate) fn direct(range: std::ops::Range<u32>) -> Vec<FieldBit> {
        range.map(FieldBit::Direct).collect()
    }

    /// Column in granule bits 0..10, bankgroup 10..12, bank 12..15,
    /// row 15..32.
    pub(crate) fn ddr4_linear() -> AddressMapper {
        let cfg = DramConfig::new(ddr4_hierarchy(), 5)
            .with_mapping(Level::Column, direct(0..10))
            .with_mapping(Level::BankGroup, direct(10..12))
            .with_mapping(Level::Bank, direct(12..15))
            .with_mapping(Level::Row, direct(15..32));
        AddressMapper::new(cfg).unwrap()
    }

    /// Same layout with bank and bankgroup bits hashed against row bits.
    pub(crate) fn ddr4_xor() -> AddressMapper {
        let cfg = DramConfig::new(ddr4_hierarchy(), 5)
            .with_mapping(Level::Column, direct(0..10))
            .with_mapping(
                Level::BankGroup,
                vec![FieldBit::Xor(vec![10, 16]), FieldBit::Xor(vec![11, 17])],
            )
            .with_mapping(
                Level::Bank,
                vec![
                    FieldBit::Xor(vec![12, 18]),
                    FieldBit::Xor(vec![13, 19, 20]),
                    FieldBit::Direct(14),
                ],
            )
            .with_mapping(Level::Row, direct(15..32));
        AddressMapper::new(cfg).unwrap()
    }
}
