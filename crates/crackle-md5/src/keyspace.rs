use crate::Charset;

/// Longest candidate the single-block kernel searches.
pub const MAX_NCHARS: u8 = 8;

/// Number of suffixes of `suffix_len` symbols over `charset`, or `None` when
/// it does not fit in a `u64`.
pub fn possibilities(charset: Charset, suffix_len: u32) -> Option<u64> {
    (charset.size() as u64).checked_pow(suffix_len)
}

/// Tasks needed to search every `nchars`-long string starting with `prefix`.
/// Zero when the prefix already fills the string.
pub fn num_tasks(charset: Charset, nchars: u8, prefix_len: usize) -> Option<u64> {
    match usize::from(nchars).checked_sub(prefix_len) {
        Some(0) | None => Some(0),
        Some(n) => possibilities(charset, n as u32),
    }
}

/// Enumerates the candidate strings `prefix || suffix(index)`. Suffix digits
/// are written most significant first, so consecutive indices differ in the
/// last character.
#[derive(Clone, Debug)]
pub struct Keyspace {
    symbols: Vec<u8>,
    prefix: Vec<u8>,
    suffix_len: usize,
}

impl Keyspace {
    pub fn new(charset: Charset, prefix: &[u8], nchars: u8) -> Self {
        Self {
            symbols: charset.symbols(),
            prefix: prefix.to_vec(),
            suffix_len: usize::from(nchars).saturating_sub(prefix.len()),
        }
    }

    pub fn len(&self) -> Option<u64> {
        (self.symbols.len() as u64).checked_pow(self.suffix_len as u32)
    }

    pub fn is_empty(&self) -> bool {
        self.suffix_len == 0
    }

    pub fn candidate_len(&self) -> usize {
        self.prefix.len() + self.suffix_len
    }

    /// Writes candidate `index` into `out[..candidate_len()]`.
    pub fn fill(&self, index: u64, out: &mut [u8]) {
        let base = self.symbols.len() as u64;
        let (head, tail) = out[..self.candidate_len()].split_at_mut(self.prefix.len());
        head.copy_from_slice(&self.prefix);
        let mut rest = index;
        for slot in tail.iter_mut().rev() {
            *slot = self.symbols[(rest % base) as usize];
            rest /= base;
        }
    }

    pub fn candidate(&self, index: u64) -> Vec<u8> {
        let mut out = vec![0u8; self.candidate_len()];
        self.fill(index, &mut out);
        out
    }

    /// Steps `digits` (symbol positions of the suffix) to the next index.
    /// Returns false once it wraps past the last suffix.
    pub fn advance(&self, digits: &mut [usize], out: &mut [u8]) -> bool {
        let start = self.prefix.len();
        for pos in (0..digits.len()).rev() {
            digits[pos] += 1;
            if digits[pos] < self.symbols.len() {
                out[start + pos] = self.symbols[digits[pos]];
                return true;
            }
            digits[pos] = 0;
            out[start + pos] = self.symbols[0];
        }
        false
    }

    /// Symbol positions for `index`, matching what `fill` writes.
    pub fn digits(&self, index: u64) -> Vec<usize> {
        let base = self.symbols.len() as u64;
        let mut digits = vec![0usize; self.suffix_len];
        let mut rest = index;
        for d in digits.iter_mut().rev() {
            *d = (rest % base) as usize;
            rest /= base;
        }
        digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn possibilities_checks_overflow() {
        assert_eq!(possibilities(Charset::Digit, 3), Some(1000));
        assert_eq!(possibilities(Charset::Alnum, 8), Some(218_340_105_584_896));
        assert_eq!(possibilities(Charset::AlnumSpecial, 10), None);
        assert_eq!(possibilities(Charset::Alpha, 0), Some(1));
    }

    #[test]
    fn prefix_as_long_as_the_string_leaves_nothing() {
        assert_eq!(num_tasks(Charset::Digit, 4, 4), Some(0));
        assert_eq!(num_tasks(Charset::Digit, 4, 6), Some(0));
        assert_eq!(num_tasks(Charset::Digit, 4, 1), Some(1000));
    }

    #[test]
    fn candidates_count_most_significant_first() {
        let ks = Keyspace::new(Charset::Digit, b"pw", 5);
        assert_eq!(ks.len(), Some(1000));
        assert_eq!(ks.candidate(0), b"pw000");
        assert_eq!(ks.candidate(7), b"pw007");
        assert_eq!(ks.candidate(421), b"pw421");
        assert_eq!(ks.candidate(999), b"pw999");
    }

    #[test]
    fn advance_walks_in_index_order() {
        let ks = Keyspace::new(Charset::Alpha, b"x", 3);
        let mut out = ks.candidate(50);
        let mut digits = ks.digits(50);
        for index in 51..ks.len().unwrap() {
            assert!(ks.advance(&mut digits, &mut out));
            assert_eq!(out, ks.candidate(index), "index {index}");
        }
        assert!(!ks.advance(&mut digits, &mut out));
    }
}
