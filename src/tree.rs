use std::fmt;

use tracing::{debug, warn};

use crate::architecture::{Architecture, DevAddr, DramAddr, Level};
use crate::bits::Bits;
use crate::error::{RemuError, Result};

/// Largest index the arena will allocate, as a power of two of slots
/// (column counters, or rows in one row bitmap).
const MAX_SLOT_BITS: u32 = 26;

/// A bank in the index: `group` is the flattened (channel, rank,
/// bankgroup) position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BankId {
    pub group: usize,
    pub bank: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InsertStats {
    /// Cells that were not in the index before.
    pub inserted: u64,
    pub duplicates: u64,
    /// Granules whose decode fell outside the configured hierarchy.
    pub skipped: u64,
}

/// Touched-cell index: root -> group -> bank -> column -> row bitmap,
/// stored as flat arrays keyed by integer position.
///
/// Every counter equals the number of distinct (row, column) cells set
/// beneath it. Column presence bits are kept per bank for adjacency
/// search and are not counted.
pub struct HierarchyIndex<'a> {
    arch: &'a dyn Architecture,
    rank_bits: u32,
    bankgroup_bits: u32,
    num_groups: usize,
    num_banks: usize,
    num_columns: usize,
    num_rows: usize,
    root: u64,
    group_counts: Vec<u64>,
    bank_counts: Vec<u64>,
    column_presence: Vec<Bits>,
    column_counts: Vec<u64>,
    rows: Vec<Option<Bits>>,
}

impl<'a> HierarchyIndex<'a> {
    pub fn new(arch: &'a dyn Architecture) -> Result<HierarchyIndex<'a>> {
        let group_bits = arch.level_bits(Level::Channel)
            + arch.level_bits(Level::Rank)
            + arch.level_bits(Level::BankGroup);
        let slot_bits = group_bits + arch.level_bits(Level::Bank) + arch.level_bits(Level::Column);
        if slot_bits > MAX_SLOT_BITS {
            return Err(RemuError::IndexTooLarge { bits: slot_bits });
        }
        let row_bits = arch.level_bits(Level::Row);
        if row_bits > MAX_SLOT_BITS {
            return Err(RemuError::IndexTooLarge { bits: row_bits });
        }

        let num_groups = 1usize << group_bits;
        let num_banks = arch.level_size(Level::Bank) as usize;
        let num_columns = arch.level_size(Level::Column) as usize;
        let banks = num_groups * num_banks;
        let columns = banks * num_columns;

        Ok(HierarchyIndex {
            arch,
            rank_bits: arch.level_bits(Level::Rank),
            bankgroup_bits: arch.level_bits(Level::BankGroup),
            num_groups,
            num_banks,
            num_columns,
            num_rows: arch.level_size(Level::Row) as usize,
            root: 0,
            group_counts: vec![0; num_groups],
            bank_counts: vec![0; banks],
            column_presence: vec![Bits::new(num_columns); banks],
            column_counts: vec![0; columns],
            rows: vec![None; columns],
        })
    }

    pub fn arch(&self) -> &'a dyn Architecture {
        self.arch
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn num_banks(&self) -> usize {
        self.num_banks
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn root_count(&self) -> u64 {
        self.root
    }

    pub fn is_empty(&self) -> bool {
        self.root == 0
    }

    pub fn group_count(&self, group: usize) -> u64 {
        self.group_counts[group]
    }

    pub fn bank_count(&self, bank: BankId) -> u64 {
        self.bank_counts[self.bank_key(bank)]
    }

    pub fn column_count(&self, bank: BankId, col: usize) -> u64 {
        self.column_counts[self.column_key(bank, col)]
    }

    /// Columns of `bank` with at least one touched row.
    pub fn column_presence(&self, bank: BankId) -> &Bits {
        &self.column_presence[self.bank_key(bank)]
    }

    pub fn row_bitmap(&self, bank: BankId, col: usize) -> Option<&Bits> {
        self.rows.get(self.column_key(bank, col))?.as_ref()
    }

    pub fn group_of(&self, a: &DramAddr) -> usize {
        let g = ((a.chan as usize) << self.rank_bits) | a.rank as usize;
        (g << self.bankgroup_bits) | a.bankgroup as usize
    }

    pub fn bank_of(&self, a: &DramAddr) -> BankId {
        BankId {
            group: self.group_of(a),
            bank: a.bank as usize,
        }
    }

    /// DRAM address of a cell, with channel/rank/bankgroup unflattened.
    pub fn cell(&self, bank: BankId, row: usize, col: usize) -> DramAddr {
        let g = bank.group;
        let bg_mask = (1usize << self.bankgroup_bits) - 1;
        let rank_mask = (1usize << self.rank_bits) - 1;
        DramAddr {
            chan: (g >> (self.bankgroup_bits + self.rank_bits)) as u32,
            rank: ((g >> self.bankgroup_bits) & rank_mask) as u32,
            bankgroup: (g & bg_mask) as u32,
            bank: bank.bank as u32,
            row: row as u32,
            col: col as u32,
        }
    }

    pub fn contains(&self, a: &DramAddr) -> bool {
        if !self.in_bounds(a) {
            return false;
        }
        self.row_bitmap(self.bank_of(a), a.col as usize)
            .is_some_and(|rows| rows.test(a.row as usize))
    }

    fn bank_key(&self, bank: BankId) -> usize {
        bank.group * self.num_banks + bank.bank
    }

    fn column_key(&self, bank: BankId, col: usize) -> usize {
        self.bank_key(bank) * self.num_columns + col
    }

    fn in_bounds(&self, a: &DramAddr) -> bool {
        Level::ALL
            .iter()
            .all(|&l| u64::from(a.get(l)) < self.arch.level_size(l))
    }

    /// Marks one decoded cell. Returns whether it was new; cells outside
    /// the hierarchy are never inserted.
    pub fn insert(&mut self, a: &DramAddr) -> bool {
        if !self.in_bounds(a) {
            return false;
        }
        let bank = self.bank_of(a);
        let (bk, col, row) = (self.bank_key(bank), a.col as usize, a.row as usize);
        let ck = bk * self.num_columns + col;
        self.column_presence[bk].set(col);

        let num_rows = self.num_rows;
        let rows = self.rows[ck].get_or_insert_with(|| Bits::new(num_rows));
        if !rows.set(row) {
            return false;
        }
        self.column_counts[ck] += 1;
        self.bank_counts[bk] += 1;
        self.group_counts[bank.group] += 1;
        self.root += 1;
        true
    }

    /// Inserts every granule of the inclusive device address range.
    pub fn insert_range(&mut self, start: DevAddr, end: DevAddr) -> InsertStats {
        let mut stats = InsertStats::default();
        if start > end {
            return stats;
        }
        let g = self.arch.granule_bits();
        for granule in (start >> g)..=(end >> g) {
            match self.arch.decode_granule(granule) {
                Ok(a) => {
                    if self.insert(&a) {
                        stats.inserted += 1;
                    } else {
                        stats.duplicates += 1;
                    }
                }
                Err(e) => {
                    debug!(granule = format_args!("{granule:#x}"), "skipped: {e}");
                    stats.skipped += 1;
                }
            }
        }
        if stats.skipped > 0 {
            warn!(
                start = format_args!("{start:#x}"),
                end = format_args!("{end:#x}"),
                skipped = stats.skipped,
                "addresses outside the DRAM hierarchy were skipped"
            );
        }
        stats
    }

    /// Touched-cell count of every non-empty bank.
    pub fn leaf_counts(&self) -> Vec<(BankId, u64)> {
        let mut out = Vec::new();
        for group in 0..self.num_groups {
            if self.group_counts[group] == 0 {
                continue;
            }
            for bank in 0..self.num_banks {
                let id = BankId { group, bank };
                let count = self.bank_count(id);
                if count > 0 {
                    out.push((id, count));
                }
            }
        }
        out
    }
}

impl fmt::Display for HierarchyIndex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "root: {}", self.root)?;
        let mut last_group = None;
        for (id, count) in self.leaf_counts() {
            if last_group != Some(id.group) {
                writeln!(f, "  group {}: {}", id.group, self.group_counts[id.group])?;
                last_group = Some(id.group);
            }
            writeln!(
                f,
                "    bank {}: {} columns {}",
                id.bank,
                count,
                self.column_presence(id)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::fixtures::{ddr4_linear, ddr4_xor};
    use proptest::prelude::*;

    #[test]
    fn single_address_range_counts_one_cell() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        let stats = idx.insert_range(0x1000, 0x1000);
        assert_eq!(stats.inserted, 1);
        assert_eq!(idx.root_count(), 1);

        let a = m.phys_to_dram(0x1000).unwrap();
        assert!(idx.contains(&a));
        let bank = idx.bank_of(&a);
        assert_eq!(idx.bank_count(bank), 1);
        assert_eq!(idx.column_count(bank, a.col as usize), 1);
        assert!(idx.column_presence(bank).test(a.col as usize));
    }

    #[test]
    fn reinsert_is_a_no_op() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        idx.insert_range(0x4000, 0x7fff);
        let before = idx.leaf_counts();
        let stats = idx.insert_range(0x4000, 0x7fff);
        assert_eq!(stats.inserted, 0);
        assert_eq!(stats.duplicates, 0x4000 >> 5);
        assert_eq!(idx.leaf_counts(), before);
        assert_eq!(idx.root_count(), 0x4000 >> 5);
    }

    #[test]
    fn granules_share_a_cell() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        // 0x20..=0x5f spans granules 1 and 2
        assert_eq!(idx.insert_range(0x21, 0x5f).inserted, 2);
        assert_eq!(idx.root_count(), 2);
        assert_eq!(idx.insert_range(0x10, 0x10).inserted, 1);
    }

    #[test]
    fn cell_unflattens_groups() {
        let m = ddr4_xor();
        let idx = HierarchyIndex::new(&m).unwrap();
        let a = DramAddr {
            bankgroup: 3,
            bank: 5,
            row: 77,
            col: 9,
            ..DramAddr::new()
        };
        assert_eq!(idx.cell(idx.bank_of(&a), 77, 9), a);
    }

    #[test]
    fn display_lists_touched_banks() {
        let m = ddr4_linear();
        let mut idx = HierarchyIndex::new(&m).unwrap();
        idx.insert_range(0, 0x3f);
        let text = idx.to_string();
        assert!(text.starts_with("root: 2\n"));
        assert!(text.contains("bank 0: 2 columns ...0000000000000003"));
    }

    proptest! {
        #[test]
        fn root_counts_distinct_cells(
            ranges in prop::collection::vec((0u64..1 << 22, 0u64..2048), 1..8)
        ) {
            let m = ddr4_xor();
            let mut idx = HierarchyIndex::new(&m).unwrap();
            let mut cells = std::collections::BTreeSet::new();
            for (start, len) in &ranges {
                let end = start + len;
                idx.insert_range(*start, end);
                for g in (start >> 5)..=(end >> 5) {
                    cells.insert(m.decode_granule(g).unwrap());
                }
            }
            prop_assert_eq!(idx.root_count(), cells.len() as u64);
            let banks: u64 = idx.leaf_counts().iter().map(|(_, c)| c).sum();
            prop_assert_eq!(banks, idx.root_count());

            let again = idx.insert_range(ranges[0].0, ranges[0].0 + ranges[0].1);
            prop_assert_eq!(again.inserted, 0);
            prop_assert_eq!(idx.root_count(), cells.len() as u64);
        }
    }
}
