use crate::seed::CoverageId;
use std::collections::{BTreeSet, HashSet};

/// The cumulative set of all coverage ids ever observed across a corpus.
///
/// An explicit, instance-owned set rather than ambient global state so that
/// multiple corpora or targets can run in isolated instances. Mutated only by
/// the quality scorer under its single-writer lock; grows monotonically
/// except during an explicit [`BranchUniverse::reset`].
#[derive(Debug, Default)]
pub struct BranchUniverse {
    ids: HashSet<CoverageId>,
}

impl BranchUniverse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a hit-set into the universe and returns the ids that were not
    /// present before, i.e. the coverage this hit-set newly discovered.
    pub fn absorb(&mut self, hit_set: &HashSet<CoverageId>) -> BTreeSet<CoverageId> {
        let mut discovered = BTreeSet::new();
        for id in hit_set {
            if self.ids.insert(*id) {
                discovered.insert(*id);
            }
        }
        discovered
    }

    pub fn contains(&self, id: CoverageId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Point-in-time copy, used by the minimizer so it never holds the
    /// scorer's lock while reducing.
    pub fn snapshot(&self) -> HashSet<CoverageId> {
        self.ids.clone()
    }

    /// Drops all recorded coverage. The only non-monotonic operation.
    pub fn reset(&mut self) {
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(ids: &[u64]) -> HashSet<CoverageId> {
        ids.iter().map(|id| CoverageId(*id)).collect()
    }

    #[test]
    fn absorb_returns_only_newly_discovered_ids() {
        let mut universe = BranchUniverse::new();
        let first = universe.absorb(&hits(&[1, 2, 3]));
        assert_eq!(first.len(), 3);
        assert_eq!(universe.len(), 3);

        let second = universe.absorb(&hits(&[2, 3, 4]));
        assert_eq!(second, [CoverageId(4)].into_iter().collect());
        assert_eq!(universe.len(), 4);
    }

    #[test]
    fn absorb_is_idempotent_for_repeated_hit_sets() {
        let mut universe = BranchUniverse::new();
        universe.absorb(&hits(&[10, 20]));
        let repeat = universe.absorb(&hits(&[10, 20]));
        assert!(repeat.is_empty());
        assert_eq!(universe.len(), 2);
    }

    #[test]
    fn universe_grows_monotonically_across_absorbs() {
        let mut universe = BranchUniverse::new();
        let mut previous = 0;
        for batch in [&[1u64, 2][..], &[2, 3], &[1], &[9, 10, 11]] {
            universe.absorb(&hits(batch));
            assert!(universe.len() >= previous);
            previous = universe.len();
        }
    }

    #[test]
    fn reset_clears_all_ids() {
        let mut universe = BranchUniverse::new();
        universe.absorb(&hits(&[5, 6]));
        universe.reset();
        assert!(universe.is_empty());
        assert!(!universe.contains(CoverageId(5)));
    }
}
