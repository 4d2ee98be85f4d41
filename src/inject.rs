use std::collections::BTreeSet;
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::architecture::{DevAddr, PhysAddr, VirtAddr};
use crate::config::Config;
use crate::error::Result;
use crate::fault_model::FaultModel;
use crate::memmap::MemMap;
use crate::pagemap::BlockMap;
use crate::sampler::{ErrorSampler, EventKind, FaultSpec, SampleYield};
use crate::translate::Translator;
use crate::tree::HierarchyIndex;

/// One byte to corrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fault {
    pub da: Option<DevAddr>,
    pub pa: Option<PhysAddr>,
    pub va: VirtAddr,
    pub kind: EventKind,
    pub mask: u8,
}

impl Fault {
    /// Cells of the event, or bits actually flipped for a stack event.
    pub fn size(&self) -> u32 {
        match self.kind {
            EventKind::Stack(_) => self.mask.count_ones(),
            kind => kind.size(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct InjectionPlan {
    pub faults: Vec<Fault>,
    pub yields: Vec<(FaultSpec, SampleYield)>,
    pub blocks: BlockMap,
}

impl InjectionPlan {
    /// Whether every requested event was sampled.
    pub fn is_complete(&self) -> bool {
        self.yields.iter().all(|(_, y)| y.is_complete())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InjectionReport {
    pub fault: Fault,
    pub before: u8,
    pub after: u8,
}

struct Hex(Option<u64>);

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => write!(f, "{v:#x}"),
            None => f.write_str("-"),
        }
    }
}

impl fmt::Display for InjectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fault = &self.fault;
        write!(
            f,
            "DA: {}, PA: {}, VA: {:#x}, size: {}",
            Hex(fault.da),
            Hex(fault.pa),
            fault.va,
            fault.size()
        )
    }
}

/// Byte mask for an event. Stack events flip `n` adjacent bits ending
/// at `flip_bit`; a run that does not fit below it starts at bit 0
/// instead. Runs are capped at the 8 bits of a byte.
pub fn flip_mask(kind: EventKind, flip_bit: u8) -> u8 {
    let flip_bit = u32::from(flip_bit.min(7));
    match kind {
        EventKind::Stack(n) => {
            let width = n.clamp(1, 8);
            if width != n {
                warn!(n, width, "stack event does not fit in a byte");
            }
            let low = (flip_bit + 1).saturating_sub(width);
            (((1u32 << width) - 1) << low) as u8
        }
        _ => 1 << flip_bit,
    }
}

/// Plans and applies DRAM-aware fault injection for one region.
pub struct Injector<'c> {
    config: &'c Config,
    translator: Translator<'c>,
}

impl<'c> Injector<'c> {
    pub fn new(config: &'c Config, translator: Translator<'c>) -> Injector<'c> {
        if let Some(cap) = config.dram_capacity {
            translator.segments().check_capacity(cap);
        }
        Injector { config, translator }
    }

    /// RNG seeded from the configuration, or from entropy.
    pub fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Samples `model` over the DRAM cells backing `[vaddr, vaddr + size)`.
    pub fn plan<R: Rng + ?Sized>(
        &self,
        vaddr: VirtAddr,
        size: u64,
        model: &FaultModel,
        rng: &mut R,
    ) -> Result<InjectionPlan> {
        let arch = self.config.arch.as_ref();
        let blocks = self.translator.blocks(vaddr, size);
        let mut index = HierarchyIndex::new(arch)?;
        for b in &blocks.blocks {
            index.insert_range(b.start_da, b.end_da);
        }
        info!(cells = index.root_count(), blocks = blocks.blocks.len(), "index built");

        let sampler = ErrorSampler::new(&index);
        let mut plan = InjectionPlan::default();
        for spec in model.specs(self.config.correlation) {
            let sample = sampler.sample(&spec, rng);
            for event in &sample.events {
                let mask = flip_mask(event.kind, self.config.flip_bit);
                for cell in &event.cells {
                    match self.translator.resolve(cell.da, &blocks) {
                        Ok(r) => {
                            info!(
                                addr = %cell.addr,
                                kind = ?event.kind,
                                "DA {:#x} -> VA {:#x}",
                                r.da,
                                r.va
                            );
                            plan.faults.push(Fault {
                                da: Some(r.da),
                                pa: Some(r.pa),
                                va: r.va,
                                kind: event.kind,
                                mask,
                            });
                        }
                        Err(e) => warn!(da = format_args!("{:#x}", cell.da), "dropped: {e}"),
                    }
                }
            }
            plan.yields.push((spec, sample.yields));
        }
        plan.blocks = blocks;
        Ok(plan)
    }

    /// Uniformly random distinct bytes of the region, ignoring DRAM
    /// topology.
    pub fn random_plan<R: Rng + ?Sized>(
        &self,
        vaddr: VirtAddr,
        size: u64,
        bits: u32,
        rng: &mut R,
    ) -> InjectionPlan {
        let blocks = self.translator.blocks(vaddr, size);
        let want = u64::from(bits).min(size);
        let mut picked = BTreeSet::new();
        while (picked.len() as u64) < want {
            picked.insert(rng.gen_range(vaddr..vaddr + size));
        }

        let mask = flip_mask(EventKind::Single, self.config.flip_bit);
        let faults = picked
            .into_iter()
            .map(|va| {
                let block = blocks.block_at(va);
                let pa = block.and_then(|b| b.va_to_pa(va));
                let da = block.zip(pa).map(|(b, pa)| pa - b.base);
                Fault {
                    da,
                    pa,
                    va,
                    kind: EventKind::Single,
                    mask,
                }
            })
            .collect();
        let spec = FaultSpec::new(1, bits);
        let found = if want < u64::from(bits) {
            warn!(bits, size, "region has fewer bytes than requested flips");
            if want == 0 {
                SampleYield::Exhausted
            } else {
                SampleYield::PartialFound(want as u32)
            }
        } else {
            SampleYield::Found(want as u32)
        };
        InjectionPlan {
            faults,
            yields: vec![(spec, found)],
            blocks,
        }
    }

    /// Flips every planned fault that lies inside `mem`.
    pub fn apply(&self, plan: &InjectionPlan, mem: &mut MemMap<'_>) -> Vec<InjectionReport> {
        let mut reports = Vec::with_capacity(plan.faults.len());
        for &fault in &plan.faults {
            match mem.flip(fault.va, fault.mask) {
                Some((before, after)) => reports.push(InjectionReport {
                    fault,
                    before,
                    after,
                }),
                None => warn!(va = format_args!("{:#x}", fault.va), "fault outside the region"),
            }
        }
        reports
    }
}
