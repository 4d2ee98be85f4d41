//! Emulation of radiation-induced DRAM bit flips.
//!
//! A region of the calling process is translated virtual to physical to
//! device address, every touched DRAM cell is recorded in a
//! [`HierarchyIndex`], fault events are drawn from it according to a
//! [`FaultModel`] and the chosen cells are flipped in place.

pub mod architecture;
pub mod bits;
pub mod config;
pub mod error;
pub mod fault_model;
pub mod inject;
pub mod iomem;
pub mod legacy;
pub mod mapper;
pub mod memmap;
pub mod pagemap;
pub mod sampler;
pub mod translate;
pub mod tree;

pub use crate::architecture::{Architecture, DramAddr, Level};
pub use crate::config::{Config, DramConfig, FieldBit, Hierarchy};
pub use crate::error::{RemuError, Result};
pub use crate::fault_model::FaultModel;
pub use crate::inject::{InjectionPlan, InjectionReport, Injector};
pub use crate::iomem::SegmentTable;
pub use crate::mapper::AddressMapper;
pub use crate::memmap::{MemMap, Region};
pub use crate::pagemap::{PageTable, ProcPageMap, StaticPageTable};
pub use crate::sampler::{Correlation, ErrorSampler, FaultSpec, SampleYield};
pub use crate::translate::Translator;
pub use crate::tree::HierarchyIndex;
