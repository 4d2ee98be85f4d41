use std::collections::HashSet;
use std::fmt;
use std::ops::RangeInclusive;

use rand::Rng;
use tracing::{debug, warn};

use crate::architecture::{DevAddr, DramAddr};
use crate::tree::{BankId, HierarchyIndex};

/// Draws allowed per requested event before giving up.
pub const ATTEMPTS_PER_EVENT: u64 = 128;

/// Bank, row, column.
type CellKey = (BankId, usize, usize);

/// Relative weights of the three adjacency axes of a multi-cell event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Correlation {
    /// Same row, adjacent columns.
    pub word_line: f64,
    /// Same column, adjacent rows.
    pub bit_line: f64,
    /// Fraction of events that stay inside one cell and flip adjacent
    /// bits of the same byte instead.
    pub stack: f64,
}

impl Default for Correlation {
    fn default() -> Correlation {
        Correlation {
            word_line: 0.8,
            bit_line: 0.2,
            stack: 0.0,
        }
    }
}

impl Correlation {
    pub fn word_line_probability(&self) -> f64 {
        let total = self.word_line + self.bit_line;
        if total <= 0.0 {
            1.0
        } else {
            self.word_line / total
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FaultSpec {
    /// Cells flipped together by one event.
    pub num: u32,
    /// Independent events.
    pub cnt: u32,
    pub correlation: Correlation,
}

impl FaultSpec {
    pub fn new(num: u32, cnt: u32) -> FaultSpec {
        FaultSpec {
            num,
            cnt,
            correlation: Correlation::default(),
        }
    }
}

/// Valid fault sites. Cells on or outside these bounds count as edges
/// and are redrawn by the single-bit sampler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellBounds {
    pub rows: RangeInclusive<usize>,
    pub columns: RangeInclusive<usize>,
}

impl CellBounds {
    pub fn full(index: &HierarchyIndex<'_>) -> CellBounds {
        CellBounds {
            rows: 0..=index.num_rows().saturating_sub(1),
            columns: 0..=index.num_columns().saturating_sub(1),
        }
    }

    pub fn is_edge(&self, row: usize, col: usize) -> bool {
        row <= *self.rows.start()
            || row >= *self.rows.end()
            || col <= *self.columns.start()
            || col >= *self.columns.end()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleYield {
    Found(u32),
    /// The attempt budget ran out after this many events.
    PartialFound(u32),
    Exhausted,
}

impl SampleYield {
    fn from_counts(found: u32, wanted: u32) -> SampleYield {
        if found >= wanted {
            SampleYield::Found(found)
        } else if found > 0 {
            SampleYield::PartialFound(found)
        } else {
            SampleYield::Exhausted
        }
    }

    pub fn count(&self) -> u32 {
        match *self {
            SampleYield::Found(n) | SampleYield::PartialFound(n) => n,
            SampleYield::Exhausted => 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, SampleYield::Found(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Single,
    /// One cell, `n` adjacent bits of the byte.
    Stack(u32),
    Multi { word_line: u32, bit_line: u32 },
}

impl EventKind {
    /// Cells (or bits, for stack events) the event flips.
    pub fn size(&self) -> u32 {
        match *self {
            EventKind::Single => 1,
            EventKind::Stack(n) => n,
            EventKind::Multi {
                word_line,
                bit_line,
            } => word_line + bit_line,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultCell {
    pub addr: DramAddr,
    pub da: DevAddr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaultEvent {
    pub kind: EventKind,
    pub cells: Vec<FaultCell>,
}

impl fmt::Display for FaultEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:", self.kind)?;
        for c in &self.cells {
            write!(f, " {} @ {:#x}", c.addr, c.da)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub events: Vec<FaultEvent>,
    pub yields: SampleYield,
}

/// Stratified sampling over a built [`HierarchyIndex`].
pub struct ErrorSampler<'i, 'a> {
    index: &'i HierarchyIndex<'a>,
    bounds: CellBounds,
}

impl<'i, 'a> ErrorSampler<'i, 'a> {
    pub fn new(index: &'i HierarchyIndex<'a>) -> ErrorSampler<'i, 'a> {
        ErrorSampler {
            index,
            bounds: CellBounds::full(index),
        }
    }

    pub fn with_bounds(mut self, bounds: CellBounds) -> ErrorSampler<'i, 'a> {
        self.bounds = bounds;
        self
    }

    /// Draws `spec.cnt` events of `spec.num` cells. With a stack weight,
    /// that share of multi-cell events becomes single-cell stack events.
    pub fn sample<R: Rng + ?Sized>(&self, spec: &FaultSpec, rng: &mut R) -> Sample {
        if spec.cnt == 0 {
            return Sample {
                events: Vec::new(),
                yields: SampleYield::Found(0),
            };
        }
        if self.index.is_empty() || spec.num == 0 {
            warn!(num = spec.num, cnt = spec.cnt, "nothing to sample from");
            return Sample {
                events: Vec::new(),
                yields: SampleYield::Exhausted,
            };
        }

        // No cell is hit by two events of one call.
        let mut seen = HashSet::new();
        let events = if spec.num == 1 {
            self.sample_single(spec.cnt, EventKind::Single, &mut seen, rng)
        } else {
            let z = spec.correlation.stack.clamp(0.0, 1.0);
            let stacked = (f64::from(spec.cnt) * z).round() as u32;
            let mut events =
                self.sample_single(stacked, EventKind::Stack(spec.num), &mut seen, rng);
            let wl = spec.correlation.word_line_probability();
            events.extend(self.sample_multi(spec.num, spec.cnt - stacked, wl, &mut seen, rng));
            events
        };

        let yields = SampleYield::from_counts(events.len() as u32, spec.cnt);
        if !yields.is_complete() {
            warn!(
                num = spec.num,
                cnt = spec.cnt,
                found = yields.count(),
                "sampling budget exhausted"
            );
        }
        Sample { events, yields }
    }

    fn random_offset<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        let g = self.index.arch().granule_bits().min(63);
        rng.gen_range(0..1u64 << g)
    }

    fn locate(&self, addr: DramAddr, offset: u64) -> Option<FaultCell> {
        match self.index.arch().dram_to_phys(&addr, offset) {
            Ok(da) => Some(FaultCell { addr, da }),
            Err(e) => {
                debug!(%addr, "cannot encode sampled cell: {e}");
                None
            }
        }
    }

    // Walks root -> group -> bank -> column by subtracting leaf counts.
    fn draw_column<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<(BankId, usize)> {
        let idx = self.index;
        let mut rem = rng.gen_range(0..idx.root_count());
        let group = (0..idx.num_groups()).find(|&g| {
            let c = idx.group_count(g);
            if rem < c {
                return true;
            }
            rem -= c;
            false
        })?;
        let bank = (0..idx.num_banks())
            .map(|bank| BankId { group, bank })
            .find(|&b| {
                let c = idx.bank_count(b);
                if rem < c {
                    return true;
                }
                rem -= c;
                false
            })?;
        let col = (0..idx.num_columns()).find(|&col| {
            let c = idx.column_count(bank, col);
            if rem < c {
                return true;
            }
            rem -= c;
            false
        })?;
        Some((bank, col))
    }

    fn sample_single<R: Rng + ?Sized>(
        &self,
        cnt: u32,
        kind: EventKind,
        seen: &mut HashSet<CellKey>,
        rng: &mut R,
    ) -> Vec<FaultEvent> {
        let mut events = Vec::with_capacity(cnt as usize);
        let budget = ATTEMPTS_PER_EVENT * u64::from(cnt);
        let mut attempts = 0;

        while (events.len() as u32) < cnt && attempts < budget {
            attempts += 1;
            let Some((bank, col)) = self.draw_column(rng) else {
                continue;
            };
            let Some(rows) = self.index.row_bitmap(bank, col) else {
                continue;
            };
            let start = rng.gen_range(0..rows.len());
            let Some(row) = rows.next_set_wrapping(start) else {
                continue;
            };
            if self.bounds.is_edge(row, col) || !seen.insert((bank, row, col)) {
                continue;
            }
            let offset = self.random_offset(rng);
            if let Some(cell) = self.locate(self.index.cell(bank, row, col), offset) {
                events.push(FaultEvent {
                    kind,
                    cells: vec![cell],
                });
            }
        }
        events
    }

    fn draw_bank<R: Rng + ?Sized>(&self, banks: &[(BankId, u64)], rng: &mut R) -> Option<BankId> {
        let mut rem = rng.gen_range(0..self.index.root_count());
        banks
            .iter()
            .find(|(_, c)| {
                if rem < *c {
                    return true;
                }
                rem -= c;
                false
            })
            .map(|(b, _)| *b)
    }

    fn sample_multi<R: Rng + ?Sized>(
        &self,
        num: u32,
        cnt: u32,
        wl_prob: f64,
        seen: &mut HashSet<CellKey>,
        rng: &mut R,
    ) -> Vec<FaultEvent> {
        let idx = self.index;
        let banks = idx.leaf_counts();
        let mut events = Vec::with_capacity(cnt as usize);
        let budget = ATTEMPTS_PER_EVENT * u64::from(cnt);
        let mut attempts = 0;

        'attempt: while (events.len() as u32) < cnt && attempts < budget {
            attempts += 1;
            let Some(bank) = self.draw_bank(&banks, rng) else {
                continue;
            };

            // Split the event into a word-line run and a bit-line tail.
            let (mut x, mut y) = (1usize, 0usize);
            while x + y < num as usize {
                if rng.gen::<f64>() < wl_prob {
                    x += 1;
                } else {
                    y += 1;
                }
            }
            let tail = rng.gen_range(0..x);

            let starts = idx.column_presence(bank).run_starts(x);
            if starts.none() {
                continue;
            }
            let first = rng.gen_range(0..starts.len());
            let Some(col) = starts.next_set_wrapping(first) else {
                continue;
            };

            let Some(mut rows) = idx.row_bitmap(bank, col).cloned() else {
                continue;
            };
            for i in 1..x {
                match idx.row_bitmap(bank, col + i) {
                    Some(b) => rows.and_assign(b),
                    None => continue 'attempt,
                }
            }
            if let Some(b) = idx.row_bitmap(bank, col + tail) {
                for j in 1..=y {
                    rows.and_assign(&b.shr(j));
                }
            }
            let start = rng.gen_range(0..rows.len());
            let Some(row) = rows.next_set_wrapping(start) else {
                continue;
            };

            let keys: Vec<CellKey> = (0..x)
                .map(|i| (bank, row, col + i))
                .chain((1..=y).map(|j| (bank, row + j, col + tail)))
                .collect();
            if keys.iter().any(|k| seen.contains(k)) {
                continue;
            }

            let offset = self.random_offset(rng);
            let cells: Vec<FaultCell> = keys
                .iter()
                .filter_map(|&(bank, row, col)| self.locate(idx.cell(bank, row, col), offset))
                .collect();
            if cells.len() != keys.len() {
                continue;
            }
            seen.extend(keys);
            events.push(FaultEvent {
                kind: EventKind::Multi {
                    word_line: x as u32,
                    bit_line: y as u32,
                },
                cells,
            });
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::Architecture;
    use crate::mapper::fixtures::{ddr4_linear, ddr4_xor};
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    // Rows 1..=8 of columns 1..=32 in bank 0 of the linear layout.
    fn fill_block(idx: &mut HierarchyIndex<'_>) {
        for row in 1..=8u32 {
            for col in 1..=32u32 {
                idx.insert(&DramAddr {
                    row,
                    col,
                    ..DramAddr::new()
                });
            }
        }
    }

    #[test]
    fn empty_index_is_exhausted() {
        let m = ddr4_linear();
        let idx = HierarchyIndex::new(&m).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let s = ErrorSampler::new(&idx).sample(&FaultSpec::new(1, 4), &mut rng);
        assert_eq!(s.yields, SampleYield::Exhausted);
        assert!(s.events.is_empty());

        let s = ErrorSampler::new(&idx).sample(&FaultSpec::new(1, 0), &mut rng);
        assert_eq!(s.yields, SampleYield::Found(0));
    }

    #[test]
    fn single_bit_hits_touched_inner_cells() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        fill_block(&mut idx);
        let mut rng = StdRng::seed_from_u64(7);
        let s = ErrorSampler::new(&idx).sample(&FaultSpec::new(1, 50), &mut rng);
        assert_eq!(s.yields, SampleYield::Found(50));
        let bounds = CellBounds::full(&idx);
        for ev in &s.events {
            assert_eq!(ev.kind, EventKind::Single);
            let cell = ev.cells[0];
            assert!(idx.contains(&cell.addr));
            assert!(!bounds.is_edge(cell.addr.row as usize, cell.addr.col as usize));
            assert_eq!(m.phys_to_dram(cell.da).unwrap(), cell.addr);
        }
    }

    #[test]
    fn edge_only_index_reports_exhaustion() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        // row 0 only
        idx.insert_range(0x1000, 0x1000);
        let mut rng = StdRng::seed_from_u64(3);
        let s = ErrorSampler::new(&idx).sample(&FaultSpec::new(1, 2), &mut rng);
        assert_eq!(s.yields, SampleYield::Exhausted);
    }

    #[test]
    fn partial_when_fewer_sites_than_events() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        for col in [5u32, 9, 40] {
            idx.insert(&DramAddr {
                row: 3,
                col,
                ..DramAddr::new()
            });
        }
        let mut rng = StdRng::seed_from_u64(11);
        let s = ErrorSampler::new(&idx).sample(&FaultSpec::new(1, 5), &mut rng);
        assert_eq!(s.yields, SampleYield::PartialFound(3));
    }

    #[test]
    fn narrower_bounds_exclude_more() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        fill_block(&mut idx);
        let bounds = CellBounds {
            rows: 2..=7,
            columns: 2..=31,
        };
        let mut rng = StdRng::seed_from_u64(5);
        let s = ErrorSampler::new(&idx)
            .with_bounds(bounds.clone())
            .sample(&FaultSpec::new(1, 20), &mut rng);
        assert_eq!(s.yields, SampleYield::Found(20));
        for ev in &s.events {
            let a = ev.cells[0].addr;
            assert!((3..=6).contains(&a.row));
            assert!((3..=30).contains(&a.col));
        }
    }

    #[test]
    fn word_line_events_share_a_row() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        fill_block(&mut idx);
        let mut spec = FaultSpec::new(4, 10);
        spec.correlation.bit_line = 0.0;
        let mut rng = StdRng::seed_from_u64(9);
        let s = ErrorSampler::new(&idx).sample(&spec, &mut rng);
        assert_eq!(s.yields, SampleYield::Found(10));
        for ev in &s.events {
            assert_eq!(
                ev.kind,
                EventKind::Multi {
                    word_line: 4,
                    bit_line: 0
                }
            );
            let row = ev.cells[0].addr.row;
            let col = ev.cells[0].addr.col;
            for (i, c) in ev.cells.iter().enumerate() {
                assert_eq!(c.addr.row, row);
                assert_eq!(c.addr.col, col + i as u32);
                assert!(idx.contains(&c.addr));
            }
        }
    }

    #[test]
    fn bit_line_events_extend_down_one_column() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        fill_block(&mut idx);
        let spec = FaultSpec {
            num: 3,
            cnt: 10,
            correlation: Correlation {
                word_line: 0.0,
                bit_line: 1.0,
                stack: 0.0,
            },
        };
        let mut rng = StdRng::seed_from_u64(13);
        let s = ErrorSampler::new(&idx).sample(&spec, &mut rng);
        assert_eq!(s.yields, SampleYield::Found(10));
        for ev in &s.events {
            let head = ev.cells[0].addr;
            for (j, c) in ev.cells.iter().enumerate() {
                assert_eq!(c.addr.col, head.col);
                assert_eq!(c.addr.row, head.row + j as u32);
                assert!(idx.contains(&c.addr));
            }
        }
    }

    #[test]
    fn stack_share_goes_to_single_cells() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        fill_block(&mut idx);
        let mut spec = FaultSpec::new(2, 10);
        spec.correlation.stack = 0.5;
        let mut rng = StdRng::seed_from_u64(17);
        let s = ErrorSampler::new(&idx).sample(&spec, &mut rng);
        assert_eq!(s.yields, SampleYield::Found(10));
        let stacked = s
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Stack(2))
            .count();
        assert_eq!(stacked, 5);
    }

    #[test]
    fn single_adjacent_pair_yields_one_multi_event() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        for col in [2u32, 3, 6] {
            idx.insert(&DramAddr {
                row: 1,
                col,
                ..DramAddr::new()
            });
        }
        let mut spec = FaultSpec::new(2, 3);
        spec.correlation.bit_line = 0.0;
        let mut rng = StdRng::seed_from_u64(23);
        let s = ErrorSampler::new(&idx).sample(&spec, &mut rng);
        assert_eq!(s.yields, SampleYield::PartialFound(1));
        assert_eq!(s.events.len(), 1);
        let cols: Vec<u32> = s.events[0].cells.iter().map(|c| c.addr.col).collect();
        assert_eq!(cols, vec![2, 3]);
    }

    #[test]
    fn events_of_one_call_never_share_cells() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        fill_block(&mut idx);
        let mut spec = FaultSpec::new(3, 20);
        spec.correlation.stack = 0.3;
        let mut rng = StdRng::seed_from_u64(29);
        let s = ErrorSampler::new(&idx).sample(&spec, &mut rng);
        let mut cells = HashSet::new();
        for ev in &s.events {
            for c in &ev.cells {
                assert!(cells.insert(c.addr), "{} hit twice", c.addr);
            }
        }
    }

    #[test]
    fn no_adjacent_columns_exhausts() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        for col in [2u32, 4, 6] {
            idx.insert(&DramAddr {
                row: 1,
                col,
                ..DramAddr::new()
            });
        }
        let mut spec = FaultSpec::new(2, 3);
        spec.correlation.bit_line = 0.0;
        let mut rng = StdRng::seed_from_u64(19);
        let s = ErrorSampler::new(&idx).sample(&spec, &mut rng);
        assert_eq!(s.yields, SampleYield::Exhausted);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn single_bit_samples_are_touched(seed in any::<u64>(), start in 0u64..1 << 24) {
            let m = ddr4_xor();
            let mut idx = HierarchyIndex::new(&m).unwrap();
            idx.insert_range(start, start + (1 << 16));
            let mut rng = StdRng::seed_from_u64(seed);
            let sampler = ErrorSampler::new(&idx);
            let s = sampler.sample(&FaultSpec::new(1, 8), &mut rng);
            let bounds = CellBounds::full(&idx);
            for ev in &s.events {
                let a = ev.cells[0].addr;
                prop_assert!(idx.contains(&a));
                prop_assert!(!bounds.is_edge(a.row as usize, a.col as usize));
                prop_assert_eq!(m.phys_to_dram(ev.cells[0].da).unwrap(), a);
            }
        }

        #[test]
        fn word_line_runs_are_present_columns(seed in any::<u64>(), num in 2u32..5) {
            let m = ddr4_xor();
            let mut idx = HierarchyIndex::new(&m).unwrap();
            idx.insert_range(0x40_0000, 0x40_0000 + (1 << 18));
            let mut spec = FaultSpec::new(num, 4);
            spec.correlation.bit_line = 0.0;
            let mut rng = StdRng::seed_from_u64(seed);
            let s = ErrorSampler::new(&idx).sample(&spec, &mut rng);
            for ev in &s.events {
                prop_assert_eq!(ev.cells.len(), num as usize);
                let head = ev.cells[0].addr;
                let presence = idx.column_presence(idx.bank_of(&head));
                for (i, c) in ev.cells.iter().enumerate() {
                    prop_assert_eq!(c.addr.row, head.row);
                    prop_assert_eq!(c.addr.col, head.col + i as u32);
                    prop_assert!(presence.test(c.addr.col as usize));
                }
            }
        }
    }
}
