use crate::runner::ExecutionResult;
use crate::seed::{QualityMetrics, Seed};
use crate::universe::BranchUniverse;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

/// Computes per-seed quality metrics against the shared branch universe.
///
/// The universe is the one piece of shared mutable state in the scoring path,
/// so every [`QualityScorer::score`] call runs under its mutex: `new_ids` is
/// always computed against a consistent snapshot, and the absorb that follows
/// is atomic with it.
pub struct QualityScorer {
    universe: Arc<Mutex<BranchUniverse>>,
    critical: BTreeSet<String>,
}

impl QualityScorer {
    /// Creates a scorer with a fresh, empty universe.
    ///
    /// `critical` is the configurable allow-list of call names considered
    /// security- or crash-relevant; the tracker carries no built-in knowledge
    /// of any specific target library.
    pub fn new(critical: impl IntoIterator<Item = String>) -> Self {
        Self::with_universe(Arc::new(Mutex::new(BranchUniverse::new())), critical)
    }

    pub fn with_universe(
        universe: Arc<Mutex<BranchUniverse>>,
        critical: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            universe,
            critical: critical.into_iter().collect(),
        }
    }

    /// Shared handle to the universe, e.g. for the minimizer's snapshot.
    pub fn universe(&self) -> Arc<Mutex<BranchUniverse>> {
        Arc::clone(&self.universe)
    }

    pub fn universe_len(&self) -> usize {
        self.lock_universe().len()
    }

    /// Scores one executed seed, absorbing its hit-set into the universe.
    ///
    /// Non-`Ok` results are still scored; crashes are often the most valuable
    /// seeds. Routing them to the crash partition is the corpus store's job.
    pub fn score(&self, seed: &Seed, result: &ExecutionResult) -> QualityMetrics {
        let mut universe = self.lock_universe();
        let new_ids = universe.absorb(&result.hit_set);
        drop(universe);

        let unique_branches = new_ids.len() as u64;
        let density = unique_branches as f64 / seed.call_count().max(1) as f64;
        let library_calls = seed.call_histogram();
        let critical_calls = library_calls
            .keys()
            .filter(|name| self.critical.contains(*name))
            .cloned()
            .collect();

        QualityMetrics {
            density,
            unique_branches,
            new_ids,
            library_calls,
            critical_calls,
            // Pinned seeds are the explicitly re-run regression case.
            visited: unique_branches > 0 || seed.pinned,
        }
    }

    /// Re-seeds the universe from previously recorded hit-sets, so seeds
    /// re-submitted against a reopened corpus score zero new coverage.
    pub fn preload(&self, hit_sets: impl IntoIterator<Item = std::collections::HashSet<crate::seed::CoverageId>>) {
        let mut universe = self.lock_universe();
        for hit_set in hit_sets {
            universe.absorb(&hit_set);
        }
    }

    fn lock_universe(&self) -> std::sync::MutexGuard<'_, BranchUniverse> {
        self.universe.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ExitStatus;
    use crate::seed::CoverageId;
    use std::collections::HashSet;
    use std::time::Duration;

    fn result_with_hits(seed_id: u64, ids: &[u64]) -> ExecutionResult {
        ExecutionResult {
            seed_id,
            hit_set: ids.iter().map(|id| CoverageId(*id)).collect(),
            exit_status: ExitStatus::Ok,
            wall_time: Duration::from_millis(1),
            deterministic: true,
        }
    }

    fn seed_with_calls(id: u64, count: usize) -> Seed {
        let program = (0..count)
            .map(|i| format!("api_call_{i}();"))
            .collect::<Vec<_>>()
            .join("\n");
        Seed::from_program_text(id, program)
    }

    #[test]
    fn density_is_new_ids_over_sequence_length() {
        let scorer = QualityScorer::new([]);
        let seed = seed_with_calls(1, 10);
        let metrics = scorer.score(&seed, &result_with_hits(1, &[1, 2, 3, 4]));
        assert_eq!(metrics.unique_branches, 4);
        assert!((metrics.density - 0.4).abs() < f64::EPSILON);
        assert!(metrics.visited);
    }

    #[test]
    fn empty_sequence_reports_zero_density() {
        let scorer = QualityScorer::new([]);
        let seed = Seed::from_program_text(1, "");
        let metrics = scorer.score(&seed, &result_with_hits(1, &[9]));
        assert_eq!(metrics.unique_branches, 1);
        assert_eq!(metrics.density, 1.0 / 1.0);

        let metrics = scorer.score(&seed, &result_with_hits(1, &[]));
        assert_eq!(metrics.density, 0.0);
    }

    #[test]
    fn rescoring_unchanged_seed_yields_zero_unique_branches() {
        let scorer = QualityScorer::new([]);
        let seed = seed_with_calls(1, 5);
        let first = scorer.score(&seed, &result_with_hits(1, &[1, 2]));
        assert_eq!(first.unique_branches, 2);

        let second = scorer.score(&seed, &result_with_hits(1, &[1, 2]));
        assert_eq!(second.unique_branches, 0);
        assert!(second.new_ids.is_empty());
        assert!(!second.visited);
    }

    #[test]
    fn example_scenario_three_seeds_in_order() {
        let scorer = QualityScorer::new([]);
        let s1 = seed_with_calls(1, 3);
        let s2 = seed_with_calls(2, 3);
        let s3 = seed_with_calls(3, 2);

        let m1 = scorer.score(&s1, &result_with_hits(1, &[1, 2, 3]));
        let m2 = scorer.score(&s2, &result_with_hits(2, &[2, 3, 4]));
        let m3 = scorer.score(&s3, &result_with_hits(3, &[4, 5]));

        assert_eq!(m1.unique_branches, 3);
        assert_eq!(m2.unique_branches, 1);
        assert_eq!(m2.new_ids, [CoverageId(4)].into_iter().collect());
        assert_eq!(m3.unique_branches, 1);
        assert_eq!(m3.new_ids, [CoverageId(5)].into_iter().collect());
        assert_eq!(scorer.universe_len(), 5);
    }

    #[test]
    fn critical_calls_match_the_allow_list() {
        let scorer = QualityScorer::new([
            "png_create_read_struct".to_string(),
            "inflate".to_string(),
        ]);
        let seed = Seed::from_program_text(
            1,
            "png_create_read_struct(a, b, c);\npng_destroy_read_struct(d);\n",
        );
        let metrics = scorer.score(&seed, &result_with_hits(1, &[1]));
        assert_eq!(
            metrics.critical_calls,
            ["png_create_read_struct".to_string()].into_iter().collect()
        );
        assert_eq!(metrics.library_calls.len(), 2);
    }

    #[test]
    fn crashing_result_is_still_scored() {
        let scorer = QualityScorer::new([]);
        let seed = seed_with_calls(1, 2);
        let mut result = result_with_hits(1, &[42]);
        result.exit_status = ExitStatus::Crash("signal 11".to_string());
        let metrics = scorer.score(&seed, &result);
        assert_eq!(metrics.unique_branches, 1);
    }

    #[test]
    fn pinned_seed_is_visited_even_without_new_coverage() {
        let scorer = QualityScorer::new([]);
        let mut seed = seed_with_calls(1, 2);
        scorer.score(&seed, &result_with_hits(1, &[1]));

        seed.pinned = true;
        let metrics = scorer.score(&seed, &result_with_hits(1, &[1]));
        assert_eq!(metrics.unique_branches, 0);
        assert!(metrics.visited);
    }

    #[test]
    fn preload_suppresses_already_recorded_coverage() {
        let scorer = QualityScorer::new([]);
        let recorded: HashSet<_> = [1u64, 2, 3].into_iter().map(CoverageId).collect();
        scorer.preload([recorded]);

        let seed = seed_with_calls(1, 3);
        let metrics = scorer.score(&seed, &result_with_hits(1, &[1, 2, 3, 4]));
        assert_eq!(metrics.unique_branches, 1);
        assert_eq!(scorer.universe_len(), 4);
    }
}
