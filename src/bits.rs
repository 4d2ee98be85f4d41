use std::fmt;

const WORD: usize = 64;

/// Fixed-length bit vector sized at runtime.
///
/// Shifts follow bitset conventions: `shl(k)` moves bit `i` to `i + k`,
/// `shr(k)` moves bit `i` to `i - k`. Bits shifted past either end are
/// dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct Bits {
    words: Vec<u64>,
    len: usize,
}

impl Bits {
    pub fn new(len: usize) -> Bits {
        Bits {
            words: vec![0; len.div_ceil(WORD)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns whether the bit was previously clear.
    pub fn set(&mut self, i: usize) -> bool {
        debug_assert!(i < self.len);
        let (w, b) = (i / WORD, i % WORD);
        let fresh = self.words[w] & (1 << b) == 0;
        self.words[w] |= 1 << b;
        fresh
    }

    pub fn test(&self, i: usize) -> bool {
        i < self.len && self.words[i / WORD] & (1 << (i % WORD)) != 0
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    pub fn none(&self) -> bool {
        !self.any()
    }

    pub fn first_set(&self) -> Option<usize> {
        self.next_set_from(0)
    }

    /// First set bit at or after `from`.
    pub fn next_set_from(&self, from: usize) -> Option<usize> {
        if from >= self.len {
            return None;
        }
        let mut w = from / WORD;
        let mut word = self.words[w] & (u64::MAX << (from % WORD));
        loop {
            if word != 0 {
                return Some(w * WORD + word.trailing_zeros() as usize);
            }
            w += 1;
            if w == self.words.len() {
                return None;
            }
            word = self.words[w];
        }
    }

    /// First set bit at or after `from`, wrapping to the lowest set bit.
    pub fn next_set_wrapping(&self, from: usize) -> Option<usize> {
        self.next_set_from(from).or_else(|| self.first_set())
    }

    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        let mut next = self.first_set();
        std::iter::from_fn(move || {
            let cur = next?;
            next = self.next_set_from(cur + 1);
            Some(cur)
        })
    }

    pub fn and_assign(&mut self, other: &Bits) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= *b;
        }
        for a in self.words.iter_mut().skip(other.words.len()) {
            *a = 0;
        }
    }

    pub fn shl(&self, k: usize) -> Bits {
        let mut out = Bits::new(self.len);
        if k >= self.len {
            return out;
        }
        let (ws, bs) = (k / WORD, k % WORD);
        for i in (ws..self.words.len()).rev() {
            let mut w = self.words[i - ws] << bs;
            if bs != 0 && i > ws {
                w |= self.words[i - ws - 1] >> (WORD - bs);
            }
            out.words[i] = w;
        }
        out.clear_tail();
        out
    }

    pub fn shr(&self, k: usize) -> Bits {
        let mut out = Bits::new(self.len);
        if k >= self.len {
            return out;
        }
        let (ws, bs) = (k / WORD, k % WORD);
        let n = self.words.len();
        for i in 0..n - ws {
            let mut w = self.words[i + ws] >> bs;
            if bs != 0 && i + ws + 1 < n {
                w |= self.words[i + ws + 1] << (WORD - bs);
            }
            out.words[i] = w;
        }
        out
    }

    /// Positions `p` where bits `p, p+1, .., p+k-1` are all set.
    pub fn run_starts(&self, k: usize) -> Bits {
        let mut out = self.clone();
        for i in 1..k {
            out.and_assign(&self.shr(i));
        }
        out
    }

    fn clear_tail(&mut self) {
        let rem = self.len % WORD;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1 << rem) - 1;
            }
        }
    }
}

/// Hex dump, most significant nibble first; runs of zero words are
/// shortened to `...`.
impl fmt::Display for Bits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut zeros = 0;
        for w in self.words.iter().rev() {
            if *w == 0 {
                zeros += 1;
                continue;
            }
            if zeros > 1 {
                f.write_str("...")?;
            } else if zeros == 1 {
                write!(f, "{:016x}", 0)?;
            }
            zeros = 0;
            write!(f, "{w:016x}")?;
        }
        if zeros > 1 {
            f.write_str("...")?;
        } else if zeros == 1 {
            write!(f, "{:016x}", 0)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Bits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bits[{}; {}]", self.len, self)
    }
}
