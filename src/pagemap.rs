use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;

use nix::sys::uio::pread;
use nix::unistd::{sysconf, Pid, SysconfVar};
use tracing::{debug, warn};

use crate::architecture::{DevAddr, PhysAddr, VirtAddr};
use crate::error::{RemuError, Result};

const PAGEMAP_ENTRY: u64 = 8;
const PRESENT: u64 = 1 << 63;
const PFN_MASK: u64 = (1 << 55) - 1;
const DEFAULT_PAGE_SIZE: u64 = 4096;

pub fn page_size() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) if sz > 0 => sz as u64,
        _ => DEFAULT_PAGE_SIZE,
    }
}

/// Virtual to physical lookup for one address space.
pub trait PageTable {
    fn page_size(&self) -> u64;

    /// Physical address backing `vaddr`, or `PageNotPresent`.
    fn phys_addr(&self, vaddr: VirtAddr) -> Result<PhysAddr>;
}

/// `/proc/<pid>/pagemap`. Frame numbers read as zero without
/// CAP_SYS_ADMIN.
pub struct ProcPageMap {
    file: File,
    path: PathBuf,
    page_size: u64,
}

impl ProcPageMap {
    pub fn open_self() -> Result<ProcPageMap> {
        ProcPageMap::open(Pid::this())
    }

    pub fn open(pid: Pid) -> Result<ProcPageMap> {
        let path = PathBuf::from(format!("/proc/{pid}/pagemap"));
        let file = File::open(&path).map_err(|e| RemuError::io(&path, e))?;
        Ok(ProcPageMap {
            file,
            path,
            page_size: page_size(),
        })
    }

    fn entry(&self, vaddr: VirtAddr) -> Result<u64> {
        let mut buf = [0u8; PAGEMAP_ENTRY as usize];
        let offset = (vaddr / self.page_size) * PAGEMAP_ENTRY;
        let n = pread(&self.file, &mut buf, offset as i64).map_err(|e| RemuError::PageTable {
            vaddr,
            source: e.into(),
        })?;
        if n != buf.len() {
            return Err(RemuError::PageTable {
                vaddr,
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("short read from {}", self.path.display()),
                ),
            });
        }
        Ok(u64::from_ne_bytes(buf))
    }
}

impl PageTable for ProcPageMap {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn phys_addr(&self, vaddr: VirtAddr) -> Result<PhysAddr> {
        decode_entry(vaddr, self.entry(vaddr)?, self.page_size)
    }
}

/// Physical address from a raw pagemap entry. A present page with frame
/// number 0 is what an unprivileged reader sees and counts as a failed
/// lookup.
fn decode_entry(vaddr: VirtAddr, entry: u64, page_size: u64) -> Result<PhysAddr> {
    if entry & PRESENT == 0 {
        return Err(RemuError::PageNotPresent { vaddr });
    }
    let pfn = entry & PFN_MASK;
    if pfn == 0 {
        return Err(RemuError::FrameHidden { vaddr });
    }
    Ok(pfn * page_size + vaddr % page_size)
}

/// Page table held in memory: virtual page number to frame number.
/// Pages not inserted are not present.
#[derive(Clone, Debug, Default)]
pub struct StaticPageTable {
    page_size: u64,
    frames: BTreeMap<u64, u64>,
}

impl StaticPageTable {
    pub fn new(page_size: u64) -> StaticPageTable {
        StaticPageTable {
            page_size,
            frames: BTreeMap::new(),
        }
    }

    pub fn map(&mut self, vpn: u64, pfn: u64) -> &mut StaticPageTable {
        self.frames.insert(vpn, pfn);
        self
    }

    /// Maps `pages` virtual pages from `vaddr` onto consecutive frames
    /// from `paddr`.
    pub fn map_range(&mut self, vaddr: VirtAddr, paddr: PhysAddr, pages: u64) -> &mut StaticPageTable {
        let (vpn, pfn) = (vaddr / self.page_size, paddr / self.page_size);
        for i in 0..pages {
            self.frames.insert(vpn + i, pfn + i);
        }
        self
    }
}

impl PageTable for StaticPageTable {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn phys_addr(&self, vaddr: VirtAddr) -> Result<PhysAddr> {
        let pfn = self
            .frames
            .get(&(vaddr / self.page_size))
            .ok_or(RemuError::PageNotPresent { vaddr })?;
        Ok(pfn * self.page_size + vaddr % self.page_size)
    }
}

/// One maximal physically contiguous piece of a virtual range. Ends are
/// inclusive. The device fields are filled in by the translator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pmem {
    pub start_pa: PhysAddr,
    pub end_pa: PhysAddr,
    pub start_va: VirtAddr,
    pub end_va: VirtAddr,
    pub size: u64,
    /// Offset of `start_va` from the start of the requested range.
    pub bias: u64,
    pub start_da: DevAddr,
    pub end_da: DevAddr,
    /// `start_pa - start_da`.
    pub base: u64,
}

impl Pmem {
    pub fn has_pa(&self, pa: PhysAddr) -> bool {
        (self.start_pa..=self.end_pa).contains(&pa)
    }

    pub fn has_va(&self, va: VirtAddr) -> bool {
        (self.start_va..=self.end_va).contains(&va)
    }

    pub fn pa_to_va(&self, pa: PhysAddr) -> Option<VirtAddr> {
        self.has_pa(pa).then(|| self.start_va + (pa - self.start_pa))
    }

    pub fn va_to_pa(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.has_va(va).then(|| self.start_pa + (va - self.start_va))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockMap {
    pub blocks: Vec<Pmem>,
    /// Pages that could not be translated.
    pub faults: Vec<VirtAddr>,
}

impl BlockMap {
    pub fn block_at(&self, va: VirtAddr) -> Option<&Pmem> {
        self.blocks.iter().find(|b| b.has_va(va))
    }

    pub fn pa_to_va(&self, pa: PhysAddr) -> Option<VirtAddr> {
        self.blocks.iter().find_map(|b| b.pa_to_va(pa))
    }

    pub fn total_size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size).sum()
    }
}

/// Splits `[vaddr, vaddr + size)` into physically contiguous blocks.
/// Pages that fail to translate end the current block and are recorded
/// in [`BlockMap::faults`].
pub fn physical_blocks(pt: &dyn PageTable, vaddr: VirtAddr, size: u64) -> BlockMap {
    let mut map = BlockMap::default();
    let ps = pt.page_size();
    let end = vaddr.saturating_add(size);
    let mut cur: Option<Pmem> = None;
    let mut va = vaddr;

    while va < end {
        let chunk_end = ((va / ps + 1) * ps).min(end);
        let len = chunk_end - va;
        match pt.phys_addr(va) {
            Ok(pa) => match cur.as_mut() {
                Some(b) if b.end_pa.wrapping_add(1) == pa && b.end_va + 1 == va => {
                    b.end_pa += len;
                    b.end_va += len;
                    b.size += len;
                }
                _ => {
                    map.blocks.extend(cur.take());
                    cur = Some(Pmem {
                        start_pa: pa,
                        end_pa: pa + len - 1,
                        start_va: va,
                        end_va: va + len - 1,
                        size: len,
                        bias: va - vaddr,
                        ..Pmem::default()
                    });
                }
            },
            Err(e) => {
                warn!(vaddr = format_args!("{va:#x}"), "page excluded: {e}");
                map.blocks.extend(cur.take());
                map.faults.push(va);
            }
        }
        va = chunk_end;
    }
    map.blocks.extend(cur);
    debug!(
        blocks = map.blocks.len(),
        faults = map.faults.len(),
        "translated {size:#x} bytes at {vaddr:#x}"
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS: u64 = 4096;

    #[test]
    fn one_page_yields_one_block() {
        let mut pt = StaticPageTable::new(PS);
        pt.map(0x10, 0x777);
        let va = 0x10 * PS + 0x123;
        let map = physical_blocks(&pt, va, PS - 0x123);
        assert_eq!(map.blocks.len(), 1);
        let b = map.blocks[0];
        assert_eq!(b.size, PS - 0x123);
        assert_eq!(b.start_pa, 0x777 * PS + 0x123);
        assert_eq!(b.end_pa, 0x778 * PS - 1);
        assert_eq!(b.end_va, 0x11 * PS - 1);
        assert_eq!(b.bias, 0);
    }

    #[test]
    fn contiguous_frames_merge() {
        let mut pt = StaticPageTable::new(PS);
        pt.map_range(0x1000 * PS, 0x50 * PS, 3).map(0x1003, 0x90);
        let map = physical_blocks(&pt, 0x1000 * PS + 8, 4 * PS - 16);
        assert_eq!(map.blocks.len(), 2);
        assert_eq!(map.blocks[0].size, 3 * PS - 8);
        assert_eq!(map.blocks[1].start_pa, 0x90 * PS);
        assert_eq!(map.blocks[1].size, PS - 8);
        assert_eq!(map.blocks[1].bias, 3 * PS - 8);
        assert_eq!(map.total_size(), 4 * PS - 16);
    }

    #[test]
    fn missing_pages_are_reported_not_merged() {
        let mut pt = StaticPageTable::new(PS);
        pt.map(0, 10).map(2, 12);
        let map = physical_blocks(&pt, 0, 3 * PS);
        assert_eq!(map.faults, vec![PS]);
        assert_eq!(map.blocks.len(), 2);
        assert_eq!(map.blocks[0].end_pa, 11 * PS - 1);
        assert_eq!(map.blocks[1].start_pa, 12 * PS);
    }

    #[test]
    fn block_lookup() {
        let mut pt = StaticPageTable::new(PS);
        pt.map(4, 40).map(5, 7);
        let map = physical_blocks(&pt, 4 * PS, 2 * PS);
        let b = map.block_at(5 * PS + 9).unwrap();
        assert_eq!(b.start_pa, 7 * PS);
        assert_eq!(b.va_to_pa(5 * PS + 9), Some(7 * PS + 9));
        assert_eq!(map.pa_to_va(40 * PS + 1), Some(4 * PS + 1));
        assert_eq!(map.pa_to_va(41 * PS), None);
        assert!(map.block_at(6 * PS).is_none());
    }

    #[test]
    fn empty_range_is_empty() {
        let pt = StaticPageTable::new(PS);
        assert_eq!(physical_blocks(&pt, 0x5000, 0), BlockMap::default());
    }

    /// Raw pagemap entries keyed by virtual page number.
    struct RawEntries(BTreeMap<u64, u64>);

    impl PageTable for RawEntries {
        fn page_size(&self) -> u64 {
            PS
        }

        fn phys_addr(&self, vaddr: VirtAddr) -> Result<PhysAddr> {
            let entry = self.0.get(&(vaddr / PS)).copied().unwrap_or(0);
            decode_entry(vaddr, entry, PS)
        }
    }

    #[test]
    fn pagemap_entries_decode() {
        assert_eq!(decode_entry(0x1234, PRESENT | 0x42, PS).unwrap(), 0x42 * PS + 0x234);
        assert!(matches!(
            decode_entry(0x1234, 0x42, PS),
            Err(RemuError::PageNotPresent { vaddr: 0x1234 })
        ));
        assert!(matches!(
            decode_entry(0x1234, PRESENT, PS),
            Err(RemuError::FrameHidden { vaddr: 0x1234 })
        ));
    }

    #[test]
    fn hidden_frames_are_excluded_like_missing_pages() {
        // page 1 is present but its frame number reads as 0
        let entries = RawEntries(BTreeMap::from([
            (0, PRESENT | 0x100),
            (1, PRESENT),
            (2, PRESENT | 0x102),
        ]));
        let map = physical_blocks(&entries, 0, 3 * PS);
        assert_eq!(map.faults, vec![PS]);
        assert_eq!(map.blocks.len(), 2);
        assert_eq!(map.total_size(), 2 * PS);
        assert!(map.blocks.iter().all(|b| b.start_pa >= 0x100 * PS));
    }

    #[test]
    fn host_page_size_is_a_power_of_two() {
        assert!(page_size().is_power_of_two());
    }
}
