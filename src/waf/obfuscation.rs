use std::collections::HashSet;

/// Flags long inputs made mostly of distinct characters, which is what
/// packed or encoded scripts tend to look like.
#[derive(Debug, Clone)]
pub struct ObfuscationHeuristic {
    /// Distinct-character ratio above which text is flagged.
    pub threshold: f64,
    /// Inputs shorter than this (in chars) are never flagged.
    pub min_length: usize,
}

impl ObfuscationHeuristic {
    pub fn new(threshold: f64, min_length: usize) -> Self {
        Self {
            threshold,
            min_length,
        }
    }

    /// Ratio of distinct chars to total chars; 0.0 for empty input.
    pub fn distinct_ratio(text: &str) -> f64 {
        let total = text.chars().count();
        if total == 0 {
            return 0.0;
        }
        let distinct: HashSet<char> = text.chars().collect();
        distinct.len() as f64 / total as f64
    }

    pub fn is_obfuscated(&self, text: &str) -> bool {
        if text.chars().count() < self.min_length {
            return false;
        }
        Self::distinct_ratio(text) > self.threshold
    }
}

impl Default for ObfuscationHeuristic {
    fn default() -> Self {
        Self::new(0.8, 50)
    }
}
