use std::collections::{BTreeMap, HashSet};

use sem_core::{ParameterCombination, RunRecord, RunState};

/// All recorded attempts, grouped by (combination, repetition).
#[derive(Debug, Default, Clone)]
pub struct RunIndex {
    pairs: BTreeMap<(ParameterCombination, u32), Vec<RunRecord>>,
}

impl RunIndex {
    pub fn from_records(records: Vec<RunRecord>) -> Self {
        let mut pairs: BTreeMap<(ParameterCombination, u32), Vec<RunRecord>> = BTreeMap::new();
        for record in records {
            pairs
                .entry((record.params.clone(), record.repetition))
                .or_default()
                .push(record);
        }
        for attempts in pairs.values_mut() {
            attempts.sort_by_key(|r| r.attempt);
        }
        Self { pairs }
    }

    pub fn attempts(&self, combination: &ParameterCombination, repetition: u32) -> &[RunRecord] {
        self.pairs
            .get(&(combination.clone(), repetition))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_complete(&self, combination: &ParameterCombination, repetition: u32) -> bool {
        self.attempts(combination, repetition)
            .iter()
            .any(|r| r.state == RunState::Complete)
    }

    /// True when the most recent attempt failed and nothing completed.
    pub fn has_failed(&self, combination: &ParameterCombination, repetition: u32) -> bool {
        !self.is_complete(combination, repetition)
            && self
                .attempts(combination, repetition)
                .last()
                .map(|r| r.state == RunState::Failed)
                .unwrap_or(false)
    }

    pub fn is_unresolved(&self, combination: &ParameterCombination, repetition: u32) -> bool {
        self.attempts(combination, repetition)
            .iter()
            .any(|r| !r.state.is_terminal())
    }

    pub fn next_attempt(&self, combination: &ParameterCombination, repetition: u32) -> u32 {
        self.attempts(combination, repetition)
            .last()
            .map(|r| r.attempt + 1)
            .unwrap_or(0)
    }

    pub fn completed_pairs(&self) -> HashSet<(ParameterCombination, u32)> {
        self.pairs
            .iter()
            .filter(|(_, attempts)| attempts.iter().any(|r| r.state == RunState::Complete))
            .map(|(pair, _)| pair.clone())
            .collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &RunRecord> {
        self.pairs.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.pairs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sem_core::Job;

    #[test]
    fn tracks_latest_attempt_per_pair() {
        let combo = ParameterCombination::new().with("a", 1);
        let first = RunRecord::running(&Job::new(combo.clone(), 0, 0)).failed(Some(1), "boom", vec![]);
        let second = RunRecord::running(&Job::new(combo.clone(), 0, 1));
        let index = RunIndex::from_records(vec![second, first]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.next_attempt(&combo, 0), 2);
        assert!(index.is_unresolved(&combo, 0));
        assert!(!index.has_failed(&combo, 0));
        assert!(!index.is_complete(&combo, 0));
        assert_eq!(index.next_attempt(&combo, 1), 0);
    }

    #[test]
    fn failed_then_complete_counts_as_complete() {
        let combo = ParameterCombination::new().with("a", 1);
        let failed = RunRecord::running(&Job::new(combo.clone(), 0, 0)).failed(Some(2), "x", vec![]);
        let done = RunRecord::running(&Job::new(combo.clone(), 0, 1)).complete(0, vec![]);
        let index = RunIndex::from_records(vec![failed, done]);
        assert!(index.is_complete(&combo, 0));
        assert!(!index.has_failed(&combo, 0));
        assert_eq!(index.completed_pairs().len(), 1);
    }
}
