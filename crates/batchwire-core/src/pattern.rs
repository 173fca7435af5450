//! Knuth–Morris–Pratt substring search over byte slices.
//!
//! Every decoder uses this to find boundary delimiters and header/body
//! dividers. The prefix table is computed once per pattern, so scanning a
//! chunked stream never rescans bytes already classified: the streaming
//! decoder only keeps the [`PatternSearch::residual`] tail of each chunk.

/// A precomputed KMP matcher for one fixed pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSearch {
    pattern: Vec<u8>,
    table: Vec<usize>,
}

impl PatternSearch {
    /// Precompute the longest-proper-prefix-also-suffix table in O(m).
    pub fn new(pattern: impl Into<Vec<u8>>) -> Self {
        let pattern = pattern.into();
        let table = prefix_table(&pattern);
        Self { pattern, table }
    }

    /// The pattern this matcher searches for.
    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    /// The prefix table. An empty pattern yields `[0]`.
    pub fn table(&self) -> &[usize] {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.pattern.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    /// Index of the first match in `source`, or `None`. O(n + m).
    pub fn search(&self, source: &[u8]) -> Option<usize> {
        self.search_from(source, 0)
    }

    /// Index (relative to `source`) of the first match starting at or after `from`.
    pub fn search_from(&self, source: &[u8], from: usize) -> Option<usize> {
        if self.pattern.is_empty() {
            return (from <= source.len()).then_some(from);
        }
        let m = self.pattern.len();
        let mut j = 0;
        for (i, &b) in source.iter().enumerate().skip(from) {
            j = self.step(j, b);
            if j == m {
                return Some(i + 1 - m);
            }
        }
        None
    }

    /// Start index of every match, overlapping matches included. O(n + m).
    pub fn search_all(&self, source: &[u8]) -> Vec<usize> {
        if self.pattern.is_empty() {
            return (0..=source.len()).collect();
        }
        let m = self.pattern.len();
        let mut hits = Vec::new();
        let mut j = 0;
        for (i, &b) in source.iter().enumerate() {
            j = self.step(j, b);
            if j == m {
                hits.push(i + 1 - m);
                j = self.table[m - 1];
            }
        }
        hits
    }

    /// Length of the longest suffix of `source` that is a proper prefix of
    /// the pattern.
    ///
    /// Those trailing bytes may turn into a match once more input arrives;
    /// everything before them can be released.
    pub fn residual(&self, source: &[u8]) -> usize {
        if self.pattern.is_empty() {
            return 0;
        }
        let m = self.pattern.len();
        let mut j = 0;
        for &b in source {
            j = self.step(j, b);
            if j == m {
                j = self.table[m - 1];
            }
        }
        j
    }

    #[inline]
    fn step(&self, mut j: usize, b: u8) -> usize {
        while j > 0 && b != self.pattern[j] {
            j = self.table[j - 1];
        }
        if b == self.pattern[j] {
            j += 1;
        }
        j
    }
}

fn prefix_table(pattern: &[u8]) -> Vec<usize> {
    if pattern.is_empty() {
        return vec![0];
    }
    let mut table = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = table[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        table[i] = k;
    }
    table
}
