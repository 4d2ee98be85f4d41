use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::architecture::{Architecture, Level};
use crate::error::{RemuError, Result};
use crate::sampler::Correlation;

/// One bit of a level's field: either copied from a single source bit of
/// the granule address or the XOR of several source bits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldBit {
    Direct(u32),
    Xor(Vec<u32>),
}

impl FieldBit {
    pub fn sources(&self) -> &[u32] {
        match self {
            FieldBit::Direct(b) => std::slice::from_ref(b),
            FieldBit::Xor(bs) => bs,
        }
    }
}

impl fmt::Display for FieldBit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldBit::Direct(b) => write!(f, "{b}"),
            FieldBit::Xor(bs) => {
                let parts: Vec<String> = bs.iter().map(|b| b.to_string()).collect();
                write!(f, "XOR({})", parts.join(","))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct Hierarchy {
    #[serde(default)]
    pub channel_bits: u32,
    #[serde(default)]
    pub rank_bits: u32,
    #[serde(default)]
    pub bankgroup_bits: u32,
    #[serde(default)]
    pub bank_bits: u32,
    #[serde(default)]
    pub row_bits: u32,
    #[serde(default)]
    pub column_bits: u32,
}

impl Hierarchy {
    pub fn bits(&self, level: Level) -> u32 {
        match level {
            Level::Channel => self.channel_bits,
            Level::Rank => self.rank_bits,
            Level::BankGroup => self.bankgroup_bits,
            Level::Bank => self.bank_bits,
            Level::Row => self.row_bits,
            Level::Column => self.column_bits,
        }
    }

    pub fn set_bits(&mut self, level: Level, bits: u32) {
        match level {
            Level::Channel => self.channel_bits = bits,
            Level::Rank => self.rank_bits = bits,
            Level::BankGroup => self.bankgroup_bits = bits,
            Level::Bank => self.bank_bits = bits,
            Level::Row => self.row_bits = bits,
            Level::Column => self.column_bits = bits,
        }
    }

    pub fn total_bits(&self) -> u32 {
        Level::ALL.iter().map(|l| self.bits(*l)).sum()
    }
}

/// Silicon-specific address mapping. Built once, immutable afterwards.
///
/// Source bit indices refer to the granule address, i.e. the device
/// address shifted right by `dq`. Entry `i` of a level's mapping is bit
/// `i` of that level's field (first entry = least significant bit).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DramConfig {
    pub hierarchy: Hierarchy,
    pub dq: u32,
    pub burst_length: Option<u32>,
    pub hardware_capacity: Option<u64>,
    mapping: [Vec<FieldBit>; Level::COUNT],
}

impl DramConfig {
    pub fn new(hierarchy: Hierarchy, dq: u32) -> DramConfig {
        DramConfig {
            hierarchy,
            dq,
            burst_length: None,
            hardware_capacity: None,
            mapping: Default::default(),
        }
    }

    pub fn with_mapping(mut self, level: Level, fields: Vec<FieldBit>) -> DramConfig {
        self.mapping[level.index()] = fields;
        self
    }

    pub fn mapping(&self, level: Level) -> &[FieldBit] {
        &self.mapping[level.index()]
    }

    pub fn load(path: impl AsRef<Path>) -> Result<DramConfig> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| RemuError::io(path, e))?;
        DramConfig::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<DramConfig> {
        let raw: RawFile = serde_yaml::from_str(text)?;
        raw.into_config()
    }

    /// Capacity implied by the hierarchy, in bytes.
    pub fn theoretical_capacity(&self) -> u64 {
        let bits = self.hierarchy.total_bits() + self.dq;
        if bits >= 64 {
            u64::MAX
        } else {
            1u64 << bits
        }
    }
}

impl fmt::Display for DramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hierarchy:")?;
        for level in Level::ALL {
            let bits = self.hierarchy.bits(level);
            writeln!(f, "  {:<10} {:>8} (bits: {})", level, 1u64 << bits, bits)?;
        }
        writeln!(f, "Interface:")?;
        writeln!(f, "  granule: {} bytes (DQ shift {})", 1u64 << self.dq, self.dq)?;
        if let Some(bl) = self.burst_length {
            writeln!(f, "  burst length: {bl}")?;
        }
        writeln!(f, "  capacity: {}", crate::iomem::human_size(self.theoretical_capacity()))?;
        writeln!(f, "Bit mapping:")?;
        for level in Level::ALL {
            let fields = self.mapping(level);
            if fields.is_empty() {
                continue;
            }
            let parts: Vec<String> = fields.iter().map(|b| b.to_string()).collect();
            writeln!(f, "  {}: {}", level, parts.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct RawFile {
    dram: Option<RawDram>,
    hierarchy: Option<Hierarchy>,
    interface: Option<RawInterface>,
    hardware_capacity: Option<u64>,
    mapping: RawMapping,
}

#[derive(Deserialize)]
struct RawDram {
    #[serde(default)]
    hierarchy: Hierarchy,
    interface: Option<RawInterface>,
    hardware_capacity: Option<u64>,
}

#[derive(Deserialize)]
struct RawInterface {
    #[serde(rename = "DQ", alias = "dq")]
    dq: Option<u32>,
    bus_width: Option<u32>,
    #[serde(alias = "burst_length")]
    prefetch_size: Option<u32>,
}

impl RawInterface {
    // Without an explicit DQ shift, the transaction size
    // (bus_width / 8 * prefetch) decides how many low bits are offset.
    fn shift(&self) -> Result<u32> {
        if let Some(dq) = self.dq {
            return Ok(dq);
        }
        match (self.bus_width, self.prefetch_size) {
            (Some(width), Some(prefetch)) => {
                let tx = u64::from(width / 8) * u64::from(prefetch);
                if tx == 0 || !tx.is_power_of_two() {
                    return Err(RemuError::InvalidConfig(format!(
                        "transaction size {tx} is not a power of two"
                    )));
                }
                Ok(tx.trailing_zeros())
            }
            _ => Err(RemuError::InvalidConfig("interface.DQ is missing".into())),
        }
    }
}

#[derive(Deserialize)]
struct RawMapping {
    bit_mapping: BTreeMap<String, Vec<RawFieldBit>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFieldBit {
    Direct(u32),
    Group(Vec<u32>),
    Xor { xor: Vec<u32> },
}

impl From<RawFieldBit> for FieldBit {
    fn from(raw: RawFieldBit) -> FieldBit {
        match raw {
            RawFieldBit::Direct(b) => FieldBit::Direct(b),
            RawFieldBit::Group(mut bs) | RawFieldBit::Xor { xor: mut bs } => {
                if bs.len() == 1 {
                    FieldBit::Direct(bs.remove(0))
                } else {
                    FieldBit::Xor(bs)
                }
            }
        }
    }
}

impl RawFile {
    fn into_config(self) -> Result<DramConfig> {
        let (hierarchy, interface, capacity) = match self.dram {
            Some(dram) => (
                dram.hierarchy,
                dram.interface.or(self.interface),
                dram.hardware_capacity.or(self.hardware_capacity),
            ),
            None => (
                self.hierarchy.unwrap_or_default(),
                self.interface,
                self.hardware_capacity,
            ),
        };
        let interface = interface
            .ok_or_else(|| RemuError::InvalidConfig("interface section is missing".into()))?;

        let mut config = DramConfig::new(hierarchy, interface.shift()?);
        config.burst_length = interface.prefetch_size;
        config.hardware_capacity = capacity;

        for (name, fields) in self.mapping.bit_mapping {
            let level = Level::from_name(&name).ok_or_else(|| {
                RemuError::InvalidConfig(format!("unknown component `{name}` in bit_mapping"))
            })?;
            config.mapping[level.index()] = fields.into_iter().map(FieldBit::from).collect();
        }
        Ok(config)
    }
}

/// Run-level settings around the DRAM organisation.
pub struct Config {
    pub arch: Box<dyn Architecture>,
    /// Bit inside the target byte that single-cell events flip.
    pub flip_bit: u8,
    pub correlation: Correlation,
    pub seed: Option<u64>,
    /// Expected installed DRAM, bytes. Only used to warn when the
    /// physical memory map covers less.
    pub dram_capacity: Option<u64>,
}

impl Config {
    pub fn new(arch: Box<dyn Architecture>) -> Config {
        Config {
            arch,
            flip_bit: 0,
            correlation: Correlation::default(),
            seed: None,
            dram_capacity: None,
        }
    }
}
