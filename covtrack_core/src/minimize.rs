use crate::corpus::{Corpus, CorpusError, CoverageEntry};
use crate::seed::CoverageId;
use std::collections::BTreeSet;

/// Result of one minimization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MinimizeOutcome {
    /// Seed ids kept in the cover, ascending.
    pub kept: Vec<u64>,
    /// Seed ids retired by this pass, ascending.
    pub retired: Vec<u64>,
    /// Size of the coverage union the kept seeds preserve.
    pub covered_branches: usize,
}

impl std::fmt::Display for MinimizeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "kept {} seed(s), retired {} seed(s), {} branch(es) covered",
            self.kept.len(),
            self.retired.len(),
            self.covered_branches
        )
    }
}

/// Reduces the active main partition to a coverage-preserving subset.
///
/// Works on a snapshot of the corpus in two phases. First, pinned seeds and
/// first discoverers are kept unconditionally: a seed credited with
/// `new_ids` at acceptance time is the only recorded discoverer of those
/// ids, and discovery credit is never transferred to a later seed that
/// merely re-hits them. Second, any ids still uncovered (seeds whose credit
/// predates the snapshot, e.g. loaded from an older index) are closed with
/// a greedy set cover, ties going to the lower seed id so repeated runs
/// pick the same subset. Unselected seeds are retired, never deleted;
/// crash-partition seeds are untouched by construction of the snapshot.
pub fn minimize(corpus: &mut dyn Corpus) -> Result<MinimizeOutcome, CorpusError> {
    let snapshot = corpus.coverage_snapshot();
    let plan = plan_cover(&snapshot);
    for &id in &plan.retired {
        corpus.retire(id)?;
    }
    Ok(plan)
}

fn plan_cover(snapshot: &[CoverageEntry]) -> MinimizeOutcome {
    let mut covered: BTreeSet<CoverageId> = BTreeSet::new();
    let mut kept = Vec::new();
    let mut remaining: Vec<&CoverageEntry> = Vec::new();

    for entry in snapshot {
        if entry.pinned || !entry.new_ids.is_empty() {
            covered.extend(entry.hit_set.iter().copied());
            kept.push(entry.id);
        } else {
            remaining.push(entry);
        }
    }

    loop {
        let mut best: Option<(usize, usize)> = None;
        for (position, entry) in remaining.iter().enumerate() {
            let gain = entry.hit_set.difference(&covered).count();
            if gain == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_position, best_gain)) => {
                    gain > best_gain
                        || (gain == best_gain && entry.id < remaining[best_position].id)
                }
            };
            if better {
                best = Some((position, gain));
            }
        }
        let Some((position, _)) = best else { break };
        let entry = remaining.swap_remove(position);
        covered.extend(entry.hit_set.iter().copied());
        kept.push(entry.id);
    }

    let mut retired: Vec<u64> = remaining.iter().map(|entry| entry.id).collect();
    retired.sort_unstable();
    kept.sort_unstable();

    MinimizeOutcome {
        kept,
        retired,
        covered_branches: covered.len(),
    }
}
