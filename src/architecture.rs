use std::fmt;

use crate::error::Result;

/// Address in the compacted, gap-free DRAM device space.
pub type DevAddr = u64;
pub type PhysAddr = u64;
pub type VirtAddr = u64;

/// One level of the DRAM hierarchy, outermost first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Channel,
    Rank,
    BankGroup,
    Bank,
    Row,
    Column,
}

impl Level {
    pub const COUNT: usize = 6;

    pub const ALL: [Level; Level::COUNT] = [
        Level::Channel,
        Level::Rank,
        Level::BankGroup,
        Level::Bank,
        Level::Row,
        Level::Column,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Level::Channel => "channel",
            Level::Rank => "rank",
            Level::BankGroup => "bankgroup",
            Level::Bank => "bank",
            Level::Row => "row",
            Level::Column => "column",
        }
    }

    /// Accepts the full level names and the short forms used by the
    /// line-oriented mapping files (`Ch`, `Ra`, `Bg`, `Ba`, `Ro`, `Co`).
    pub fn from_name(name: &str) -> Option<Level> {
        match name.to_ascii_lowercase().as_str() {
            "channel" | "ch" => Some(Level::Channel),
            "rank" | "ra" => Some(Level::Rank),
            "bankgroup" | "bank_group" | "bg" => Some(Level::BankGroup),
            "bank" | "ba" => Some(Level::Bank),
            "row" | "ro" => Some(Level::Row),
            "column" | "col" | "co" => Some(Level::Column),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DramAddr {
    pub chan: u32,
    pub rank: u32,
    pub bankgroup: u32,
    pub bank: u32,
    pub row: u32,
    pub col: u32,
}

impl DramAddr {
    pub fn new() -> DramAddr {
        DramAddr::default()
    }

    pub fn get(&self, level: Level) -> u32 {
        match level {
            Level::Channel => self.chan,
            Level::Rank => self.rank,
            Level::BankGroup => self.bankgroup,
            Level::Bank => self.bank,
            Level::Row => self.row,
            Level::Column => self.col,
        }
    }

    pub fn set(&mut self, level: Level, value: u32) {
        match level {
            Level::Channel => self.chan = value,
            Level::Rank => self.rank = value,
            Level::BankGroup => self.bankgroup = value,
            Level::Bank => self.bank = value,
            Level::Row => self.row = value,
            Level::Column => self.col = value,
        }
    }
}

impl fmt::Display for DramAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(ch {}, ra {}, bg {}, ba {}, row {}, col {})",
            self.chan, self.rank, self.bankgroup, self.bank, self.row, self.col
        )
    }
}

/// A DRAM organisation: how many bits each level has and how device
/// addresses decompose into levels.
///
/// Decoding works on *granules*: the device address shifted right by
/// [`granule_bits`](Architecture::granule_bits). The low bits are a
/// burst/byte offset and carry no topology.
pub trait Architecture {
    fn level_bits(&self, level: Level) -> u32;

    fn granule_bits(&self) -> u32;

    fn decode_granule(&self, granule: u64) -> Result<DramAddr>;

    fn encode_granule(&self, addr: &DramAddr) -> Result<u64>;

    fn level_count(&self) -> usize {
        Level::COUNT
    }

    fn level_name(&self, level: Level) -> &str {
        level.name()
    }

    fn level_size(&self, level: Level) -> u64 {
        1u64 << self.level_bits(level)
    }

    fn phys_to_dram(&self, p: DevAddr) -> Result<DramAddr> {
        self.decode_granule(p >> self.granule_bits())
    }

    /// `offset` supplies the bits below the granule.
    fn dram_to_phys(&self, a: &DramAddr, offset: u64) -> Result<DevAddr> {
        let g = self.granule_bits();
        Ok((self.encode_granule(a)? << g) | ls_bits(offset, g))
    }
}

pub(crate) fn bit(x: u64, i: u32) -> u64 {
    (x >> i) & 1
}

pub(crate) fn ls_bits(x: u64, i: u32) -> u64 {
    if i >= 64 {
        x
    } else {
        x & ((1u64 << i) - 1)
    }
}
