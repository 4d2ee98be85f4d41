use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::architecture::Level;

pub type Result<T> = std::result::Result<T, RemuError>;

#[derive(Debug, Error)]
pub enum RemuError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed mapping file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid mapping configuration: {0}")]
    InvalidConfig(String),

    #[error("mapping line {line}: {msg}")]
    LegacySyntax { line: usize, msg: String },

    #[error("{level} is {bits} bits wide, at most {max} supported")]
    LevelTooWide { level: Level, bits: u32, max: u32 },

    #[error("source bit {bit} is directly mapped more than once")]
    DuplicateSource { bit: u32 },

    #[error("source bit {bit} is beyond the 64-bit address")]
    SourceBitTooHigh { bit: u32 },

    #[error("{level} has a gap at field bit {bit}")]
    MissingFieldBit { level: Level, bit: u32 },

    #[error("{level} value {value} out of range (limit {limit})")]
    OutOfRange { level: Level, value: u64, limit: u64 },

    #[error("{level} bit {bit} cannot be encoded: XOR system is inconsistent")]
    Unencodable { level: Level, bit: u32 },

    #[error("hierarchy index needs 2^{bits} column slots, too many")]
    IndexTooLarge { bits: u32 },

    #[error("page at {vaddr:#x} is not present")]
    PageNotPresent { vaddr: u64 },

    #[error("frame of page {vaddr:#x} reads as 0, missing CAP_SYS_ADMIN?")]
    FrameHidden { vaddr: u64 },

    #[error("pagemap read for {vaddr:#x} failed: {source}")]
    PageTable {
        vaddr: u64,
        #[source]
        source: io::Error,
    },

    #[error("mapping {len} bytes failed: {source}")]
    Mmap {
        len: usize,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("no DRAM regions found in the physical memory map")]
    NoDramSegments,

    #[error("address {addr:#x} is not covered by any segment")]
    Unmapped { addr: u64 },

    #[error("fault model: {0}")]
    FaultModel(String),
}

impl RemuError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        RemuError::Io {
            path: path.into(),
            source,
        }
    }
}
