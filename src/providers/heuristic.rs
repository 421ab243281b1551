//! Offline trend estimate used when every live provider has failed.
//!
//! Lookup order: exact table key, then the longest table key that contains
//! or is contained in the keyword, then keyword categories, then a midpoint.
//! The estimate depends only on the keyword text.

use std::collections::BTreeMap;

pub const NAME: &str = "heuristic";

/// Returned when nothing in the table or the categories matches.
pub const DEFAULT_ESTIMATE: u8 = 50;

const BASE_SCORES: &[(&str, u8)] = &[
    ("Express Entry", 85),
    ("Express Entry draw", 90),
    ("Canada immigration", 80),
    ("Canadian immigration", 83),
    ("PR card", 65),
    ("CRS cutoff", 85),
    ("IRCC announcement", 75),
    ("PR processing time", 82),
    ("Immigration policy change", 70),
    ("Study permit", 75),
    ("Work permit", 78),
    ("Study permit Canada", 76),
    ("Visitor visa", 63),
    ("Family sponsorship", 58),
    ("Super visa", 45),
    ("PGWP", 67),
    ("Open work permit", 72),
    ("Canada PNP", 73),
    ("PNP", 70),
    ("Ontario PNP", 71),
    ("BC PNP", 69),
];

/// Category word stems, checked in order.
const CATEGORIES: &[(&[&str], u8)] = &[
    (&["express", "entry"], 85),
    (&["immigration", "immigrant", "canada"], 77),
    (&["visa", "permit", "pr"], 72),
    (&["pnp", "provincial", "ontario", "bc", "alberta"], 67),
    (&["work", "study", "student"], 67),
];

#[derive(Debug, Clone)]
pub struct HeuristicEstimator {
    table: BTreeMap<String, u8>,
}

impl Default for HeuristicEstimator {
    fn default() -> Self {
        Self {
            table: BASE_SCORES
                .iter()
                .map(|(keyword, score)| (normalize(keyword), *score))
                .collect(),
        }
    }
}

impl HeuristicEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or override table entries.
    pub fn with_scores<I, K>(mut self, scores: I) -> Self
    where
        I: IntoIterator<Item = (K, u8)>,
        K: AsRef<str>,
    {
        for (keyword, score) in scores {
            let keyword = normalize(keyword.as_ref());
            if !keyword.is_empty() {
                self.table.insert(keyword, score.min(100));
            }
        }
        self
    }

    pub fn estimate(&self, keyword: &str) -> u8 {
        let keyword = normalize(keyword);
        if keyword.is_empty() {
            return DEFAULT_ESTIMATE;
        }

        if let Some(score) = self.table.get(&keyword) {
            log::debug!("heuristic exact match for '{}': {}", keyword, score);
            return *score;
        }

        // BTreeMap order makes ties on length resolve the same way every run.
        let partial = self
            .table
            .iter()
            .filter(|(key, _)| keyword.contains(key.as_str()) || key.contains(keyword.as_str()))
            .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)));
        if let Some((key, score)) = partial {
            log::debug!("heuristic partial match '{}' for '{}': {}", key, keyword, score);
            return *score;
        }

        let words: Vec<&str> = keyword.split(' ').collect();
        for (stems, score) in CATEGORIES {
            if stems.iter().any(|stem| words.iter().any(|word| word_matches(word, stem))) {
                log::debug!("heuristic category estimate for '{}': {}", keyword, score);
                return *score;
            }
        }

        DEFAULT_ESTIMATE
    }
}

fn normalize(keyword: &str) -> String {
    keyword
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Short stems (`pr`, `bc`) must match a whole word.
fn word_matches(word: &str, stem: &str) -> bool {
    if stem.len() <= 3 {
        word == stem
    } else {
        word.starts_with(stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exact_matches_are_case_insensitive() {
        let estimator = HeuristicEstimator::new();
        assert_eq!(estimator.estimate("Express Entry"), 85);
        assert_eq!(estimator.estimate("express   entry DRAW"), 90);
        assert_eq!(estimator.estimate("pgwp"), 67);
    }

    #[test]
    fn partial_matches_prefer_longest_key() {
        let estimator = HeuristicEstimator::new();
        assert_eq!(estimator.estimate("latest Express Entry draw results"), 90);
        assert_eq!(estimator.estimate("Ontario PNP 2024"), 71);
    }

    #[test]
    fn categories_and_default() {
        let estimator = HeuristicEstimator::new();
        assert_eq!(estimator.estimate("expressway"), 85);
        assert_eq!(estimator.estimate("immigrants in Toronto"), 77);
        assert_eq!(estimator.estimate("alberta jobs"), 67);
        assert_eq!(estimator.estimate("students housing"), 67);
        assert_eq!(estimator.estimate("hockey scores"), DEFAULT_ESTIMATE);
        assert_eq!(estimator.estimate("   "), DEFAULT_ESTIMATE);
    }

    #[test]
    fn short_stems_need_whole_words() {
        let estimator = HeuristicEstimator::new();
        assert_eq!(estimator.estimate("pr renewal"), 72);
        assert_eq!(estimator.estimate("printer deals"), DEFAULT_ESTIMATE);
    }

    #[test]
    fn extra_scores_override_table() {
        let estimator = HeuristicEstimator::new().with_scores([("Express Entry", 60u8), ("LMIA", 140u8)]);
        assert_eq!(estimator.estimate("express entry"), 60);
        assert_eq!(estimator.estimate("LMIA"), 100);
    }

    proptest! {
        #[test]
        fn estimates_are_bounded_and_deterministic(keyword in "\\PC{0,40}") {
            let first = HeuristicEstimator::new().estimate(&keyword);
            let second = HeuristicEstimator::new().estimate(&keyword);
            prop_assert_eq!(first, second);
            prop_assert!(first <= 100);
        }
    }
}
