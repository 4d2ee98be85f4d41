use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use rand::Rng;

use crate::error::{RemuError, Result};
use crate::sampler::{Correlation, FaultSpec};

/// Event size (bits flipped together) to number of events.
///
/// Written one model per line as `size:count` pairs, e.g. `1:90 2:4 3:1`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FaultModel {
    events: BTreeMap<u32, u32>,
}

impl FaultModel {
    pub fn new() -> FaultModel {
        FaultModel::default()
    }

    pub fn with(mut self, size: u32, count: u32) -> FaultModel {
        self.add(size, count);
        self
    }

    pub fn add(&mut self, size: u32, count: u32) {
        if size > 0 && count > 0 {
            *self.events.entry(size).or_default() += count;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn count(&self, size: u32) -> u32 {
        self.events.get(&size).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.events.iter().map(|(&s, &c)| (s, c))
    }

    /// Bits flipped by the whole model.
    pub fn total_bits(&self) -> u64 {
        self.iter().map(|(s, c)| u64::from(s) * u64::from(c)).sum()
    }

    pub fn specs(&self, correlation: Correlation) -> Vec<FaultSpec> {
        self.iter()
            .map(|(num, cnt)| FaultSpec {
                num,
                cnt,
                correlation,
            })
            .collect()
    }

    /// Reads model number `line` (1-based) from a file.
    pub fn load(path: impl AsRef<Path>, line: usize) -> Result<FaultModel> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| RemuError::io(path, e))?;
        let l = line
            .checked_sub(1)
            .and_then(|i| text.lines().nth(i))
            .ok_or_else(|| {
                RemuError::FaultModel(format!("{} has no line {line}", path.display()))
            })?;
        let model: FaultModel = l.parse()?;
        if model.is_empty() {
            return Err(RemuError::FaultModel(format!(
                "line {line} of {} is empty",
                path.display()
            )));
        }
        Ok(model)
    }

    /// Random model flipping `total_bits` bits: 2-bit events make up 2 to
    /// 12 % of the bits, 3-bit events up to 2 %, 5 to 7-bit events up to
    /// 1 %; the rest are single-bit.
    pub fn synthesize<R: Rng + ?Sized>(total_bits: u32, rng: &mut R) -> FaultModel {
        let t = f64::from(total_bits);
        let two = rng.gen_range((t * 0.02) as u32..=(t * 0.12) as u32);
        let three = rng.gen_range(0..=(t * 0.02) as u32);
        let wide = rng.gen_range(0..=(t * 0.01) as u32);

        let mut model = FaultModel::new().with(2, two).with(3, three);
        let mut multi = 2 * two + 3 * three;
        for _ in 0..wide {
            let size = rng.gen_range(5..=7);
            model.add(size, 1);
            multi += size;
        }
        model.add(1, total_bits.saturating_sub(multi));
        model
    }
}

impl FromStr for FaultModel {
    type Err = RemuError;

    fn from_str(s: &str) -> Result<FaultModel> {
        let mut model = FaultModel::new();
        for pair in s.split_whitespace() {
            let bad = || RemuError::FaultModel(format!("`{pair}` is not a size:count pair"));
            let (size, count) = pair.split_once(':').ok_or_else(bad)?;
            let size: u32 = size.parse().map_err(|_| bad())?;
            let count: u32 = count.parse().map_err(|_| bad())?;
            model.add(size, count);
        }
        Ok(model)
    }
}

impl fmt::Display for FaultModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.iter().map(|(s, c)| format!("{s}:{c}")).collect();
        f.write_str(&pairs.join(" "))
    }
}
