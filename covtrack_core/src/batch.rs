use crate::corpus::{Corpus, CorpusError};
use crate::header::SeedHeader;
use crate::runner::{ExecutionResult, Runner, RunnerError};
use crate::scorer::QualityScorer;
use crate::seed::Seed;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error("cannot read seed directory {path}: {source}")]
    SeedDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Tally of one `ingest` batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
    /// Accepted into the crash partition; also counted in `accepted`.
    pub crashed: usize,
    /// Seeds whose run failed with a non-fatal runner error; skipped.
    pub failed: usize,
    /// Branch universe size after the batch.
    pub universe_size: usize,
}

impl std::fmt::Display for IngestReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "accepted {} seed(s) ({} crash), rejected {}, failed {}, universe at {} branch(es)",
            self.accepted, self.crashed, self.rejected, self.failed, self.universe_size
        )
    }
}

/// Executes a batch of seeds and feeds the results through scoring and
/// corpus acceptance.
///
/// Execution is embarrassingly parallel and fans out across a rayon pool;
/// scoring is serial in ascending seed id, so the `new_ids` attribution for
/// a given batch does not depend on scheduling. A [`RunnerError::TargetLaunch`]
/// aborts the whole batch; per-seed I/O errors only skip that seed.
pub fn run_batch(
    seeds: Vec<Seed>,
    runner: &dyn Runner,
    scorer: &QualityScorer,
    corpus: &mut dyn Corpus,
) -> Result<IngestReport, BatchError> {
    let outcomes: Vec<(Seed, Result<ExecutionResult, RunnerError>)> = seeds
        .into_par_iter()
        .map(|seed| {
            let result = runner.run(&seed);
            (seed, result)
        })
        .collect();

    let mut ordered: BTreeMap<u64, (Seed, ExecutionResult)> = BTreeMap::new();
    let mut report = IngestReport::default();

    for (seed, outcome) in outcomes {
        match outcome {
            Ok(result) => {
                if ordered.contains_key(&seed.id) {
                    log::warn!("duplicate seed id {} within batch, skipping", seed.id);
                    report.failed += 1;
                } else {
                    ordered.insert(seed.id, (seed, result));
                }
            }
            Err(fatal @ RunnerError::TargetLaunch(_)) => return Err(fatal.into()),
            Err(e) => {
                log::warn!("seed {} failed to run, skipping: {e}", seed.id);
                report.failed += 1;
            }
        }
    }

    for (_, (seed, result)) in ordered {
        let metrics = scorer.score(&seed, &result);
        let seed_id = seed.id;
        let crashed = !result.exit_status.is_ok();
        match corpus.accept(seed, metrics, &result) {
            Ok(true) => {
                report.accepted += 1;
                if crashed {
                    report.crashed += 1;
                }
            }
            Ok(false) => {
                log::debug!("seed {seed_id} rejected (no new coverage)");
                report.rejected += 1;
            }
            // Already stored, e.g. re-ingest of an annotated artifact that
            // kept its recorded id. Per-seed, not fatal to the batch.
            Err(CorpusError::DuplicateSeed(id)) => {
                log::warn!("seed {id} is already in the corpus, skipping");
                report.failed += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    report.universe_size = scorer.universe_len();
    Ok(report)
}

const SEED_FILE_EXTENSIONS: &[&str] = &["c", "cc", "cpp", "cxx"];

/// Loads candidate seeds from a directory of program files, in lexicographic
/// filename order.
///
/// Files carrying an annotation header keep their recorded id, prompt and
/// combination tags; the body becomes the program. Unannotated files are
/// assigned fresh ids starting at `next_id` (bumped past any annotated id in
/// the directory). Unreadable or unparsable files are skipped with a warning.
pub fn load_seed_dir(dir: &Path, next_id: u64) -> Result<Vec<Seed>, BatchError> {
    let entries = fs::read_dir(dir).map_err(|source| BatchError::SeedDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| SEED_FILE_EXTENSIONS.contains(&ext))
        })
        .collect();
    paths.sort();

    let mut annotated = Vec::new();
    let mut plain = Vec::new();
    for path in paths {
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                log::warn!("cannot read seed file {path:?}, skipping: {e}");
                continue;
            }
        };
        if SeedHeader::present_in(&text) {
            match SeedHeader::parse(&text) {
                Ok((header, body)) => {
                    let mut seed = Seed::from_program_text(header.id, body)
                        .with_combination(header.combination);
                    seed.prompt = header.prompt;
                    annotated.push(seed);
                }
                Err(e) => {
                    log::warn!("malformed seed header in {path:?}, skipping: {e}");
                }
            }
        } else {
            plain.push(text);
        }
    }

    let mut next_id = annotated
        .iter()
        .map(|seed| seed.id.saturating_add(1))
        .max()
        .unwrap_or(0)
        .max(next_id);

    let mut seeds = annotated;
    for text in plain {
        seeds.push(Seed::from_program_text(next_id, text));
        next_id = next_id.saturating_add(1);
    }
    seeds.sort_by_key(|seed| seed.id);
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::InMemoryCorpus;
    use crate::runner::{ExitStatus, FnRunner};
    use crate::seed::CoverageId;
    use std::collections::HashSet;

    fn hits(ids: &[u64]) -> HashSet<CoverageId> {
        ids.iter().map(|id| CoverageId(*id)).collect()
    }

    #[test]
    fn batch_scores_in_ascending_id_order() {
        // Seed 1 and seed 2 share id 2; whoever is scored first claims it.
        let runner = FnRunner::new(|seed: &Seed| match seed.id {
            1 => (ExitStatus::Ok, hits(&[1, 2])),
            _ => (ExitStatus::Ok, hits(&[2, 3])),
        });
        let scorer = QualityScorer::new([]);
        let mut corpus = InMemoryCorpus::new();

        // Submit out of order; attribution must not depend on submit order.
        let seeds = vec![
            Seed::from_program_text(2, "b();"),
            Seed::from_program_text(1, "a();"),
        ];
        let report = run_batch(seeds, &runner, &scorer, &mut corpus).unwrap();

        assert_eq!(report.accepted, 2);
        assert_eq!(report.universe_size, 3);
        let first = corpus.get(1).unwrap();
        assert_eq!(first.metrics.new_ids, hits(&[1, 2]).into_iter().collect());
        let second = corpus.get(2).unwrap();
        assert_eq!(second.metrics.new_ids, hits(&[3]).into_iter().collect());
    }

    #[test]
    fn report_tallies_acceptance_and_crashes() {
        let runner = FnRunner::new(|seed: &Seed| {
            if seed.program.contains("boom") {
                (ExitStatus::Crash("signal 11".to_string()), hits(&[]))
            } else {
                (ExitStatus::Ok, hits(&[1]))
            }
        });
        let scorer = QualityScorer::new([]);
        let mut corpus = InMemoryCorpus::new();

        let seeds = vec![
            Seed::from_program_text(1, "a();"),
            Seed::from_program_text(2, "a();"), // same coverage, rejected
            Seed::from_program_text(3, "boom();"),
        ];
        let report = run_batch(seeds, &runner, &scorer, &mut corpus).unwrap();
        assert_eq!(report.accepted, 2);
        assert_eq!(report.crashed, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn reingesting_a_stored_seed_does_not_abort_the_batch() {
        let runner = FnRunner::new(|seed: &Seed| {
            if seed.program.contains("boom") {
                (ExitStatus::Crash("signal 11".to_string()), hits(&[7]))
            } else {
                (ExitStatus::Ok, hits(&[1]))
            }
        });
        let scorer = QualityScorer::new([]);
        let mut corpus = InMemoryCorpus::new();

        // Seed 1 is already stored from an earlier session.
        let stored = Seed::from_program_text(1, "boom();");
        let stored_result = runner.run(&stored).unwrap();
        let stored_metrics = scorer.score(&stored, &stored_result);
        assert!(corpus.accept(stored, stored_metrics, &stored_result).unwrap());

        let seeds = vec![
            Seed::from_program_text(1, "boom();"),
            Seed::from_program_text(2, "fresh();"),
        ];
        let report = run_batch(seeds, &runner, &scorer, &mut corpus).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.accepted, 1);
        assert!(corpus.get(2).is_some());
    }

    #[test]
    fn colliding_ids_within_a_batch_are_tallied() {
        let runner = FnRunner::new(|_: &Seed| (ExitStatus::Ok, hits(&[1])));
        let scorer = QualityScorer::new([]);
        let mut corpus = InMemoryCorpus::new();

        let seeds = vec![
            Seed::from_program_text(1, "a();"),
            Seed::from_program_text(1, "b();"),
        ];
        let report = run_batch(seeds, &runner, &scorer, &mut corpus).unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(corpus.len(), 1);
    }

    #[test]
    fn empty_batch_produces_an_empty_report() {
        let runner = FnRunner::new(|_: &Seed| (ExitStatus::Ok, hits(&[])));
        let scorer = QualityScorer::new([]);
        let mut corpus = InMemoryCorpus::new();
        let report = run_batch(Vec::new(), &runner, &scorer, &mut corpus).unwrap();
        assert_eq!(report, IngestReport::default());
    }

    mod seed_dir {
        use super::*;
        use crate::seed::QualityMetrics;
        use tempfile::tempdir;

        #[test]
        fn loads_plain_files_with_sequential_ids() {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join("b.cc"), "beta();\n").unwrap();
            fs::write(dir.path().join("a.c"), "alpha();\n").unwrap();
            fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

            let seeds = load_seed_dir(dir.path(), 10).unwrap();
            assert_eq!(seeds.len(), 2);
            assert_eq!(seeds[0].id, 10);
            assert_eq!(seeds[0].program, "alpha();\n");
            assert_eq!(seeds[1].id, 11);
            assert_eq!(seeds[1].program, "beta();\n");
        }

        #[test]
        fn annotated_files_keep_their_recorded_metadata() {
            let dir = tempdir().unwrap();
            let seed = Seed::from_program_text(42, "cJSON_Parse(s);\n")
                .with_prompt("parse")
                .with_combination(vec!["cJSON_Parse".to_string()]);
            let header = SeedHeader::from_seed(&seed, &QualityMetrics::default());
            fs::write(
                dir.path().join("seed_00000042.cc"),
                format!("{}{}", header.render(), seed.program),
            )
            .unwrap();
            fs::write(dir.path().join("zz_plain.cc"), "plain();\n").unwrap();

            let seeds = load_seed_dir(dir.path(), 0).unwrap();
            assert_eq!(seeds.len(), 2);
            assert_eq!(seeds[0].id, 42);
            assert_eq!(seeds[0].prompt.as_deref(), Some("parse"));
            assert_eq!(seeds[0].combination, vec!["cJSON_Parse".to_string()]);
            assert_eq!(seeds[0].program, "cJSON_Parse(s);\n");
            // Fresh id starts past the annotated one.
            assert_eq!(seeds[1].id, 43);
        }

        #[test]
        fn malformed_header_is_skipped_not_fatal() {
            let dir = tempdir().unwrap();
            fs::write(dir.path().join("bad.cc"), "//<ID> not_a_number\n").unwrap();
            fs::write(dir.path().join("good.cc"), "ok();\n").unwrap();

            let seeds = load_seed_dir(dir.path(), 0).unwrap();
            assert_eq!(seeds.len(), 1);
            assert_eq!(seeds[0].program, "ok();\n");
        }

        #[test]
        fn missing_directory_is_an_error() {
            let dir = tempdir().unwrap();
            let missing = dir.path().join("nope");
            assert!(matches!(
                load_seed_dir(&missing, 0),
                Err(BatchError::SeedDir { .. })
            ));
        }
    }
}
