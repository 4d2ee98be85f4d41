use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::architecture::{DevAddr, PhysAddr};
use crate::error::{RemuError, Result};

pub const IOMEM: &str = "/proc/iomem";

const KEYWORDS: [&str; 2] = ["system ram", "reserved"];

/// A merged run of DRAM-backed physical memory and where it lands in
/// the compacted device address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pseg {
    pub pa_start: PhysAddr,
    /// Inclusive.
    pub pa_end: PhysAddr,
    pub da_start: DevAddr,
}

impl Pseg {
    pub fn size(&self) -> u64 {
        self.pa_end - self.pa_start + 1
    }

    pub fn da_end(&self) -> DevAddr {
        self.da_start + self.size() - 1
    }

    /// Subtracted from a physical address to get its device address.
    pub fn base(&self) -> u64 {
        self.pa_start - self.da_start
    }

    pub fn has_pa(&self, pa: PhysAddr) -> bool {
        (self.pa_start..=self.pa_end).contains(&pa)
    }

    pub fn has_da(&self, da: DevAddr) -> bool {
        (self.da_start..=self.da_end()).contains(&da)
    }
}

/// Physical memory segments stitched into one gap-free device space.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentTable {
    segs: Vec<Pseg>,
}

impl SegmentTable {
    pub fn load() -> Result<SegmentTable> {
        SegmentTable::load_from(IOMEM)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<SegmentTable> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| RemuError::io(path, e))?;
        SegmentTable::parse(&text)
    }

    /// Keeps `start-end : desc` lines naming system RAM or reserved
    /// memory; other lines are ignored.
    pub fn parse(text: &str) -> Result<SegmentTable> {
        let ranges = text.lines().filter_map(parse_line);
        SegmentTable::from_ranges(ranges)
    }

    /// Builds the table from inclusive physical ranges. Overlapping or
    /// touching ranges merge.
    pub fn from_ranges(ranges: impl IntoIterator<Item = (PhysAddr, PhysAddr)>) -> Result<SegmentTable> {
        let mut ranges: Vec<_> = ranges.into_iter().filter(|(s, e)| s <= e).collect();
        ranges.sort_unstable();

        let mut merged: Vec<(PhysAddr, PhysAddr)> = Vec::new();
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        // an unprivileged /proc/iomem lists every range as 0-0
        if merged.first().map_or(true, |&(s, e)| e <= s) {
            return Err(RemuError::NoDramSegments);
        }

        let mut da = 0;
        let segs = merged
            .into_iter()
            .map(|(pa_start, pa_end)| {
                let seg = Pseg {
                    pa_start,
                    pa_end,
                    da_start: da,
                };
                da += seg.size();
                debug!(
                    pa_start = format_args!("{pa_start:#x}"),
                    pa_end = format_args!("{pa_end:#x}"),
                    base = format_args!("{:#x}", seg.base()),
                    "segment"
                );
                seg
            })
            .collect();
        Ok(SegmentTable { segs })
    }

    pub fn segments(&self) -> &[Pseg] {
        &self.segs
    }

    pub fn total_size(&self) -> u64 {
        self.segs.iter().map(Pseg::size).sum()
    }

    /// Warns when the segments cover less than `expected` bytes.
    pub fn check_capacity(&self, expected: u64) -> bool {
        let total = self.total_size();
        if total < expected {
            warn!(
                "merged DRAM regions ({}) are smaller than the configured capacity ({})",
                human_size(total),
                human_size(expected)
            );
            return false;
        }
        true
    }

    /// Device address of `pa` and the base of its segment.
    pub fn p2d(&self, pa: PhysAddr) -> Result<(DevAddr, u64)> {
        let i = self.segs.partition_point(|s| s.pa_end < pa);
        match self.segs.get(i) {
            Some(seg) if seg.has_pa(pa) => Ok((pa - seg.base(), seg.base())),
            _ => Err(RemuError::Unmapped { addr: pa }),
        }
    }

    pub fn d2p(&self, da: DevAddr) -> Result<PhysAddr> {
        let i = self.segs.partition_point(|s| s.da_end() < da);
        match self.segs.get(i) {
            Some(seg) if seg.has_da(da) => Ok(da + seg.base()),
            _ => Err(RemuError::Unmapped { addr: da }),
        }
    }

    pub fn segment_of(&self, pa: PhysAddr) -> Option<&Pseg> {
        self.next_from(pa).filter(|s| s.has_pa(pa))
    }

    /// First segment that contains `pa` or lies above it.
    pub fn next_from(&self, pa: PhysAddr) -> Option<&Pseg> {
        let i = self.segs.partition_point(|s| s.pa_end < pa);
        self.segs.get(i)
    }

    pub fn write_lut<W: Write>(&self, mut w: W) -> io::Result<()> {
        writeln!(w, "# pa_start pa_end da_base size")?;
        for seg in &self.segs {
            writeln!(
                w,
                "{:#x} {:#x} {:#x} {}",
                seg.pa_start,
                seg.pa_end,
                seg.base(),
                human_size(seg.size())
            )?;
        }
        Ok(())
    }

    pub fn save_lut(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| RemuError::io(path, e))?;
        let mut w = BufWriter::new(file);
        self.write_lut(&mut w)
            .and_then(|()| w.flush())
            .map_err(|e| RemuError::io(path, e))
    }
}

fn parse_line(line: &str) -> Option<(PhysAddr, PhysAddr)> {
    let (range, desc) = line.split_once(':')?;
    let desc = desc.trim().to_ascii_lowercase();
    if !KEYWORDS.iter().any(|k| desc.contains(k)) {
        return None;
    }
    let (start, end) = range.trim().split_once('-')?;
    let start = u64::from_str_radix(start.trim(), 16).ok()?;
    let end = u64::from_str_radix(end.trim(), 16).ok()?;
    Some((start, end))
}

pub fn human_size(bytes: u64) -> String {
    const K: u64 = 1 << 10;
    const M: u64 = 1 << 20;
    const G: u64 = 1 << 30;
    match bytes {
        b if b >= G => format!("{:.2}G", b as f64 / G as f64),
        b if b >= M => format!("{:.2}M", b as f64 / M as f64),
        b if b >= K => format!("{:.2}K", b as f64 / K as f64),
        b => format!("{b}B"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const IOMEM_SAMPLE: &str = "\
00000000-00000fff : Reserved
00001000-0009ffff : System RAM
000a0000-000fffff : PCI Bus 0000:00
00100000-3fffffff : System RAM
  01000000-01ffffff : Kernel code
40000000-4fffffff : PCI MMIO
100000000-17fffffff : System RAM
";

    #[test]
    fn merges_and_compacts() {
        let t = SegmentTable::parse(IOMEM_SAMPLE).unwrap();
        let segs = t.segments();
        assert_eq!(segs.len(), 3);
        assert_eq!((segs[0].pa_start, segs[0].pa_end), (0, 0x9ffff));
        assert_eq!(segs[1].da_start, 0xa0000);
        assert_eq!(segs[2].da_start, 0xa0000 + 0x3ff0_0000);
        assert_eq!(t.total_size(), 0xa0000 + 0x3ff0_0000 + 0x8000_0000);
    }

    #[test]
    fn p2d_and_d2p() {
        let t = SegmentTable::parse(IOMEM_SAMPLE).unwrap();
        let (da, base) = t.p2d(0x1_0000_0010).unwrap();
        assert_eq!(da, 0x1_0000_0010 - base);
        assert_eq!(t.d2p(da).unwrap(), 0x1_0000_0010);
        assert!(matches!(t.p2d(0x4000_0000), Err(RemuError::Unmapped { .. })));
        assert!(t.d2p(t.total_size()).is_err());
    }

    #[test]
    fn unprivileged_view_has_no_segments() {
        let text = "00000000-00000000 : System RAM\n00000000-00000000 : Reserved\n";
        assert!(matches!(
            SegmentTable::parse(text),
            Err(RemuError::NoDramSegments)
        ));
        assert!(matches!(
            SegmentTable::parse(""),
            Err(RemuError::NoDramSegments)
        ));
    }

    #[test]
    fn lut_lists_every_segment() {
        let t = SegmentTable::parse(IOMEM_SAMPLE).unwrap();
        let mut out = Vec::new();
        t.write_lut(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# pa_start pa_end da_base size");
        assert_eq!(lines[1], "0x0 0x9ffff 0x0 640.00K");
        assert_eq!(lines[3], "0x100000000 0x17fffffff 0xc0060000 2.00G");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn lut_is_written_to_disk() {
        let t = SegmentTable::parse(IOMEM_SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pd_lut");
        t.save_lut(&path).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().count(), 4);
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(1536), "1.50K");
        assert_eq!(human_size(3 << 20), "3.00M");
        assert_eq!(human_size(1 << 30), "1.00G");
    }

    #[test]
    fn capacity_check() {
        let t = SegmentTable::parse(IOMEM_SAMPLE).unwrap();
        assert!(t.check_capacity(1 << 30));
        assert!(!t.check_capacity(16 << 30));
    }

    fn ranges() -> impl Strategy<Value = Vec<(u64, u64)>> {
        prop::collection::vec((1u64..1 << 20, 1u64..1 << 20), 1..6).prop_map(|gaps| {
            let mut at = 0u64;
            gaps.into_iter()
                .map(|(gap, len)| {
                    let start = at + gap;
                    at = start + len;
                    (start, at - 1)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn pa_da_round_trip(ranges in ranges(), pick in any::<prop::sample::Index>(), frac in 0.0f64..1.0) {
            let t = SegmentTable::from_ranges(ranges.clone()).unwrap();
            let (s, e) = ranges[pick.index(ranges.len())];
            let pa = s + ((e - s) as f64 * frac) as u64;
            let (da, _) = t.p2d(pa).unwrap();
            prop_assert_eq!(t.d2p(da).unwrap(), pa);
            prop_assert_eq!(t.p2d(t.d2p(da).unwrap()).unwrap().0, da);
            prop_assert!(da < t.total_size());
        }
    }
}
