use tracing::{debug, warn};

use crate::architecture::{DevAddr, PhysAddr, VirtAddr};
use crate::error::{RemuError, Result};
use crate::iomem::SegmentTable;
use crate::pagemap::{physical_blocks, BlockMap, PageTable, Pmem};

/// One address seen in all three spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub da: DevAddr,
    pub pa: PhysAddr,
    pub va: VirtAddr,
}

/// Bridges virtual, physical and device addresses for one process.
pub struct Translator<'t> {
    pages: &'t dyn PageTable,
    segments: &'t SegmentTable,
}

impl<'t> Translator<'t> {
    pub fn new(pages: &'t dyn PageTable, segments: &'t SegmentTable) -> Translator<'t> {
        Translator { pages, segments }
    }

    pub fn segments(&self) -> &SegmentTable {
        self.segments
    }

    pub fn physical_to_device(&self, pa: PhysAddr) -> Result<(DevAddr, u64)> {
        self.segments.p2d(pa)
    }

    pub fn device_to_physical(&self, da: DevAddr) -> Result<PhysAddr> {
        self.segments.d2p(da)
    }

    /// Physical blocks behind `[vaddr, vaddr + size)` with their device
    /// ranges. Blocks crossing a segment boundary are split; parts that
    /// lie outside every segment are dropped.
    pub fn blocks(&self, vaddr: VirtAddr, size: u64) -> BlockMap {
        let raw = physical_blocks(self.pages, vaddr, size);
        let mut map = BlockMap {
            blocks: Vec::with_capacity(raw.blocks.len()),
            faults: raw.faults,
        };
        for block in raw.blocks {
            self.place(block, &mut map.blocks);
        }
        for b in &map.blocks {
            debug!(
                "PA {:#x}-{:#x} VA {:#x}-{:#x} DA {:#x}-{:#x} size {} bias {}",
                b.start_pa, b.end_pa, b.start_va, b.end_va, b.start_da, b.end_da, b.size, b.bias
            );
        }
        map
    }

    fn place(&self, mut block: Pmem, out: &mut Vec<Pmem>) {
        loop {
            let Some(seg) = self
                .segments
                .next_from(block.start_pa)
                .filter(|s| s.pa_start <= block.end_pa)
            else {
                warn!(
                    pa = format_args!("{:#x}", block.start_pa),
                    size = block.size,
                    "block outside DRAM segments dropped"
                );
                return;
            };
            if seg.pa_start > block.start_pa {
                let gap = seg.pa_start - block.start_pa;
                warn!(
                    pa = format_args!("{:#x}", block.start_pa),
                    size = gap,
                    "gap between DRAM segments dropped"
                );
                advance(&mut block, gap);
            }

            let head_end = block.end_pa.min(seg.pa_end);
            let len = head_end - block.start_pa + 1;
            let base = seg.base();
            out.push(Pmem {
                end_pa: head_end,
                end_va: block.start_va + len - 1,
                size: len,
                start_da: block.start_pa - base,
                end_da: block.start_pa - base + len - 1,
                base,
                ..block
            });

            if head_end == block.end_pa {
                return;
            }
            advance(&mut block, len);
        }
    }

    /// Maps a device address back into the region, if the region covers it.
    pub fn resolve(&self, da: DevAddr, blocks: &BlockMap) -> Result<Resolved> {
        let pa = self.segments.d2p(da)?;
        let va = blocks
            .pa_to_va(pa)
            .ok_or(RemuError::Unmapped { addr: pa })?;
        Ok(Resolved { da, pa, va })
    }

    /// Resolves each device address; unmapped ones are dropped.
    pub fn valid_virtual_addresses(&self, das: &[DevAddr], blocks: &BlockMap) -> Vec<Resolved> {
        das.iter()
            .filter_map(|&da| match self.resolve(da, blocks) {
                Ok(r) => Some(r),
                Err(e) => {
                    debug!(da = format_args!("{da:#x}"), "dropped: {e}");
                    None
                }
            })
            .collect()
    }
}

fn advance(block: &mut Pmem, len: u64) {
    block.start_pa += len;
    block.start_va += len;
    block.bias += len;
    block.size -= len;
}
