//! Line-oriented mapping files.
//!
//! ```text
//! # comment
//! Burst_length = 8
//! Co 2:0 = 2:0        range: field bits 0..=2 from source bits 0..=2
//! Ba 0   = 13 17      XOR: field bit 0 = src[13] ^ src[17]
//! Ro 0   = 18
//! ```
//!
//! A target bit that is assigned on several lines collects all of the
//! source bits into one XOR group. Level widths are inferred from the
//! highest target bit of each level.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::architecture::Level;
use crate::config::{DramConfig, FieldBit, Hierarchy};
use crate::error::{RemuError, Result};

type Targets = BTreeMap<u32, Vec<u32>>;

impl DramConfig {
    pub fn load_legacy(path: impl AsRef<Path>, dq: u32) -> Result<DramConfig> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| RemuError::io(path, e))?;
        DramConfig::from_legacy(&text, dq)
    }

    pub fn from_legacy(text: &str, dq: u32) -> Result<DramConfig> {
        let mut levels: [Targets; Level::COUNT] = Default::default();
        let mut burst_length = None;

        for (n, line) in text.lines().enumerate() {
            let line_no = n + 1;
            let line = match line.find('#') {
                Some(i) => &line[..i],
                None => line,
            };
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.is_empty() {
                continue;
            }
            if words[0].eq_ignore_ascii_case("burst_length") {
                burst_length = Some(parse_burst(&words, line_no)?);
                continue;
            }
            parse_assignment(&words, line_no, &mut levels)?;
        }

        let mut hierarchy = Hierarchy::default();
        let mut mapping: Vec<(Level, Vec<FieldBit>)> = Vec::new();
        for level in Level::ALL {
            let targets = &levels[level.index()];
            let Some((&top, _)) = targets.last_key_value() else {
                continue;
            };
            let mut fields = Vec::with_capacity(top as usize + 1);
            for bit in 0..=top {
                let sources = targets
                    .get(&bit)
                    .ok_or(RemuError::MissingFieldBit { level, bit })?;
                fields.push(match sources.as_slice() {
                    [single] => FieldBit::Direct(*single),
                    many => FieldBit::Xor(many.to_vec()),
                });
            }
            hierarchy.set_bits(level, top + 1);
            mapping.push((level, fields));
        }

        let mut config = DramConfig::new(hierarchy, dq);
        config.burst_length = burst_length;
        for (level, fields) in mapping {
            config = config.with_mapping(level, fields);
        }
        Ok(config)
    }
}

fn syntax(line: usize, msg: impl Into<String>) -> RemuError {
    RemuError::LegacySyntax {
        line,
        msg: msg.into(),
    }
}

fn number(word: &str, line: usize) -> Result<u32> {
    word.parse()
        .map_err(|_| syntax(line, format!("`{word}` is not a bit index")))
}

fn parse_burst(words: &[&str], line: usize) -> Result<u32> {
    // both `Burst_length = 8` and `Burst_length 8`
    let value = match words {
        [_, "=", v] | [_, v] => v,
        _ => return Err(syntax(line, "expected `Burst_length = n`")),
    };
    number(value, line)
}

fn level_for(word: &str) -> Option<Level> {
    if let Some(level) = Level::from_name(word) {
        return Some(level);
    }
    // `Ch0`, `Row`, `Column` ...: match on the two-letter prefix
    let prefix = word.get(..2)?;
    Level::from_name(prefix)
}

fn split_pair(word: &str, line: usize) -> Result<(u32, Option<u32>)> {
    match word.split_once(':') {
        Some((a, b)) => Ok((number(a, line)?, Some(number(b, line)?))),
        None => Ok((number(word, line)?, None)),
    }
}

fn parse_assignment(words: &[&str], line: usize, levels: &mut [Targets; Level::COUNT]) -> Result<()> {
    let [name, target, eq, sources @ ..] = words else {
        return Err(syntax(line, "expected `Component N = x`"));
    };
    if *eq != "=" {
        return Err(syntax(line, format!("expected `=`, found `{eq}`")));
    }
    if sources.is_empty() {
        return Err(syntax(line, "missing source bits"));
    }
    let level = level_for(name).ok_or_else(|| syntax(line, format!("unknown component `{name}`")))?;
    let targets = &mut levels[level.index()];

    match split_pair(target, line)? {
        (t0, Some(t1)) => {
            let [range] = sources else {
                return Err(syntax(line, "range assignment takes one `x:y` source"));
            };
            let (s0, Some(s1)) = split_pair(range, line)? else {
                return Err(syntax(line, "range assignment needs an `x:y` source"));
            };
            if t0.abs_diff(t1) != s0.abs_diff(s1) {
                return Err(syntax(line, "target and source ranges differ in length"));
            }
            let (t_lo, t_hi, s_lo) = (t0.min(t1), t0.max(t1), s0.min(s1));
            for (i, t) in (t_lo..=t_hi).enumerate() {
                targets.entry(t).or_default().push(s_lo + i as u32);
            }
        }
        (t, None) => {
            for word in sources {
                targets.entry(t).or_default().push(number(word, line)?);
            }
        }
    }
    Ok(())
}
