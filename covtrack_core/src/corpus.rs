use crate::header::SeedHeader;
use crate::runner::{ExecutionResult, ExitStatus};
use crate::seed::{CoverageId, QualityMetrics, Seed};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors arising during corpus store operations, from I/O problems for
/// on-disk corpora to logical errors like retiring an unknown seed.
#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("seed id {0} not found in corpus")]
    SeedNotFound(u64),

    /// Seeds are immutable after acceptance; a second accept with the same
    /// id is a caller bug or an id collision in the ingest directory.
    #[error("seed id {0} already present in corpus")]
    DuplicateSeed(u64),

    #[error("corpus I/O error: {0}")]
    Io(String),

    #[error("corpus serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Serialization(err.to_string())
    }
}

/// Lifecycle state of an accepted seed. Proposed and rejected seeds never
/// materialize as records: a rejected seed is simply not inserted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SeedState {
    Active,
    Retired,
}

/// Crashing and timing-out seeds live in a separate partition so the main
/// corpus only holds cleanly replayable programs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Partition {
    Main,
    Crash,
}

/// Durable record of how the seed's run terminated.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RecordedExit {
    Ok,
    Crash { detail: String },
    Timeout,
    Error { detail: String },
}

impl From<&ExitStatus> for RecordedExit {
    fn from(status: &ExitStatus) -> Self {
        match status {
            ExitStatus::Ok => RecordedExit::Ok,
            ExitStatus::Crash(detail) => RecordedExit::Crash {
                detail: detail.clone(),
            },
            ExitStatus::Timeout => RecordedExit::Timeout,
            ExitStatus::Error(detail) => RecordedExit::Error {
                detail: detail.clone(),
            },
        }
    }
}

/// One accepted seed plus everything the tracker ever derived about it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SeedRecord {
    pub seed: Seed,
    pub metrics: QualityMetrics,
    pub state: SeedState,
    pub partition: Partition,
    /// Full hit-set of the recorded run; the minimizer's input.
    pub hit_set: BTreeSet<CoverageId>,
    pub exit: RecordedExit,
    pub deterministic: bool,
    /// md5 of the program text, used to deduplicate crash inputs.
    pub program_hash: String,
}

impl SeedRecord {
    pub fn is_active(&self) -> bool {
        self.state == SeedState::Active
    }

    pub fn is_crash(&self) -> bool {
        self.partition == Partition::Crash
    }
}

/// Read-accessor filter for [`Corpus::list`].
#[derive(Debug, Clone, Default)]
pub struct SeedFilter {
    pub combination: Option<String>,
    pub min_density: Option<f64>,
    pub crashed: Option<bool>,
    pub state: Option<SeedState>,
}

impl SeedFilter {
    pub fn matches(&self, record: &SeedRecord) -> bool {
        if let Some(tag) = &self.combination {
            if !record.seed.combination.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(min) = self.min_density {
            if record.metrics.density < min {
                return false;
            }
        }
        if let Some(crashed) = self.crashed {
            if record.is_crash() != crashed {
                return false;
            }
        }
        if let Some(state) = self.state {
            if record.state != state {
                return false;
            }
        }
        true
    }
}

/// Per-seed view handed to the minimizer: a point-in-time copy so reduction
/// never races concurrent accepts.
#[derive(Debug, Clone)]
pub struct CoverageEntry {
    pub id: u64,
    pub hit_set: BTreeSet<CoverageId>,
    /// Ids this seed was credited with discovering at acceptance time.
    pub new_ids: BTreeSet<CoverageId>,
    pub pinned: bool,
}

/// Durable collection of accepted seeds plus their metadata.
pub trait Corpus: Send + Sync {
    /// Inserts the seed iff it discovered coverage or is pinned; crashing
    /// and timing-out seeds are routed to the crash partition and kept
    /// regardless of coverage. Returns whether the seed was accepted.
    fn accept(
        &mut self,
        seed: Seed,
        metrics: QualityMetrics,
        result: &ExecutionResult,
    ) -> Result<bool, CorpusError>;

    fn get(&self, id: u64) -> Option<&SeedRecord>;

    fn list(&self, filter: &SeedFilter) -> Vec<&SeedRecord>;

    /// Marks a seed inactive without losing its historical metadata.
    fn retire(&mut self, id: u64) -> Result<(), CorpusError>;

    /// Explicit re-pin: marks the seed pinned and reactivates it. The only
    /// path by which a retired seed becomes active again.
    fn pin(&mut self, id: u64) -> Result<(), CorpusError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of active main-partition seeds for the minimizer.
    fn coverage_snapshot(&self) -> Vec<CoverageEntry>;
}

fn route(seed: &Seed, metrics: &QualityMetrics, result: &ExecutionResult) -> Option<Partition> {
    if !result.exit_status.is_ok() {
        return Some(Partition::Crash);
    }
    if metrics.unique_branches > 0 || seed.pinned {
        return Some(Partition::Main);
    }
    None
}

fn build_record(
    seed: Seed,
    metrics: QualityMetrics,
    result: &ExecutionResult,
    partition: Partition,
) -> SeedRecord {
    let program_hash = format!("{:x}", md5::compute(seed.program.as_bytes()));
    SeedRecord {
        hit_set: result.hit_set.iter().copied().collect(),
        exit: RecordedExit::from(&result.exit_status),
        deterministic: result.deterministic,
        program_hash,
        seed,
        metrics,
        state: SeedState::Active,
        partition,
    }
}

/// In-memory corpus store. Fast, not persistent; suited to single-batch
/// scoring runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryCorpus {
    records: BTreeMap<u64, SeedRecord>,
    crash_hashes: HashSet<String>,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Corpus for InMemoryCorpus {
    fn accept(
        &mut self,
        seed: Seed,
        metrics: QualityMetrics,
        result: &ExecutionResult,
    ) -> Result<bool, CorpusError> {
        let Some(partition) = route(&seed, &metrics, result) else {
            return Ok(false);
        };
        if self.records.contains_key(&seed.id) {
            return Err(CorpusError::DuplicateSeed(seed.id));
        }
        let record = build_record(seed, metrics, result, partition);
        if partition == Partition::Crash && !self.crash_hashes.insert(record.program_hash.clone())
        {
            log::debug!(
                "seed {} is a duplicate crash input ({}), rejecting",
                record.seed.id,
                record.program_hash
            );
            return Ok(false);
        }
        self.records.insert(record.seed.id, record);
        Ok(true)
    }

    fn get(&self, id: u64) -> Option<&SeedRecord> {
        self.records.get(&id)
    }

    fn list(&self, filter: &SeedFilter) -> Vec<&SeedRecord> {
        self.records
            .values()
            .filter(|record| filter.matches(record))
            .collect()
    }

    fn retire(&mut self, id: u64) -> Result<(), CorpusError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(CorpusError::SeedNotFound(id))?;
        record.state = SeedState::Retired;
        Ok(())
    }

    fn pin(&mut self, id: u64) -> Result<(), CorpusError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(CorpusError::SeedNotFound(id))?;
        record.seed.pinned = true;
        record.state = SeedState::Active;
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn coverage_snapshot(&self) -> Vec<CoverageEntry> {
        self.records
            .values()
            .filter(|record| record.is_active() && !record.is_crash())
            .map(|record| CoverageEntry {
                id: record.seed.id,
                hit_set: record.hit_set.clone(),
                new_ids: record.metrics.new_ids.clone(),
                pinned: record.seed.pinned,
            })
            .collect()
    }
}

/// On-disk corpus store: one annotated seed file per accepted seed (the
/// artifact header followed by the program text) plus a JSON index holding
/// the authoritative per-seed records.
pub struct OnDiskCorpus {
    dir: PathBuf,
    index_path: PathBuf,
    records: BTreeMap<u64, SeedRecord>,
    crash_hashes: HashSet<String>,
}

impl OnDiskCorpus {
    pub const INDEX_FILENAME: &'static str = "corpus_index.json";
    const CRASH_DIR: &'static str = "crashes";
    const SEED_EXTENSION: &'static str = "cc";

    /// Creates the corpus directory if absent, otherwise loads the existing
    /// index. Records failing schema validation are skipped with a warning;
    /// corruption is fatal for that seed only.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let dir = dir.into();
        if !dir.exists() {
            fs::create_dir_all(&dir)
                .map_err(|e| CorpusError::Io(format!("cannot create corpus dir {dir:?}: {e}")))?;
        } else if !dir.is_dir() {
            return Err(CorpusError::Io(format!(
                "corpus path {dir:?} exists but is not a directory"
            )));
        }

        let index_path = dir.join(Self::INDEX_FILENAME);
        let mut corpus = Self {
            dir,
            index_path,
            records: BTreeMap::new(),
            crash_hashes: HashSet::new(),
        };
        corpus.load_index()?;
        if !corpus.index_path.exists() {
            corpus.save_index()?;
        }
        Ok(corpus)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Next free seed id, for ingesting unannotated program files.
    pub fn next_seed_id(&self) -> u64 {
        self.records
            .keys()
            .next_back()
            .map_or(0, |max| max.saturating_add(1))
    }

    fn seed_file_path(&self, record: &SeedRecord) -> PathBuf {
        let dir = match record.partition {
            Partition::Main => self.dir.clone(),
            Partition::Crash => self.dir.join(Self::CRASH_DIR),
        };
        dir.join(format!("seed_{:08}", record.seed.id))
            .with_extension(Self::SEED_EXTENSION)
    }

    fn write_seed_file(&self, record: &SeedRecord) -> Result<(), CorpusError> {
        let path = self.seed_file_path(record);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let header = SeedHeader::from_seed(&record.seed, &record.metrics);
        let mut file = File::create(&path)
            .map_err(|e| CorpusError::Io(format!("cannot create seed file {path:?}: {e}")))?;
        file.write_all(header.render().as_bytes())?;
        file.write_all(record.seed.program.as_bytes())?;
        Ok(())
    }

    fn save_index(&self) -> Result<(), CorpusError> {
        let file = File::create(&self.index_path).map_err(|e| {
            CorpusError::Io(format!("cannot write index {:?}: {e}", self.index_path))
        })?;
        let writer = BufWriter::new(file);
        let records: Vec<&SeedRecord> = self.records.values().collect();
        serde_json::to_writer_pretty(writer, &records)?;
        Ok(())
    }

    fn load_index(&mut self) -> Result<(), CorpusError> {
        if !self.index_path.is_file() {
            return Ok(());
        }
        let file = File::open(&self.index_path).map_err(|e| {
            CorpusError::Io(format!("cannot open index {:?}: {e}", self.index_path))
        })?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }
        let reader = BufReader::new(file);
        let raw_records: Vec<serde_json::Value> = serde_json::from_reader(reader)
            .map_err(|e| CorpusError::Serialization(format!("unreadable corpus index: {e}")))?;

        for (position, raw) in raw_records.into_iter().enumerate() {
            match serde_json::from_value::<SeedRecord>(raw) {
                Ok(record) => {
                    if record.is_crash() {
                        self.crash_hashes.insert(record.program_hash.clone());
                    }
                    self.records.insert(record.seed.id, record);
                }
                Err(e) => {
                    log::warn!(
                        "skipping corrupt corpus record #{position} in {:?}: {e}",
                        self.index_path
                    );
                }
            }
        }
        Ok(())
    }
}

impl Corpus for OnDiskCorpus {
    fn accept(
        &mut self,
        seed: Seed,
        metrics: QualityMetrics,
        result: &ExecutionResult,
    ) -> Result<bool, CorpusError> {
        let Some(partition) = route(&seed, &metrics, result) else {
            return Ok(false);
        };
        if self.records.contains_key(&seed.id) {
            return Err(CorpusError::DuplicateSeed(seed.id));
        }
        let record = build_record(seed, metrics, result, partition);
        if partition == Partition::Crash && !self.crash_hashes.insert(record.program_hash.clone())
        {
            log::debug!(
                "seed {} is a duplicate crash input ({}), rejecting",
                record.seed.id,
                record.program_hash
            );
            return Ok(false);
        }
        self.write_seed_file(&record)?;
        self.records.insert(record.seed.id, record);
        self.save_index()?;
        Ok(true)
    }

    fn get(&self, id: u64) -> Option<&SeedRecord> {
        self.records.get(&id)
    }

    fn list(&self, filter: &SeedFilter) -> Vec<&SeedRecord> {
        self.records
            .values()
            .filter(|record| filter.matches(record))
            .collect()
    }

    fn retire(&mut self, id: u64) -> Result<(), CorpusError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(CorpusError::SeedNotFound(id))?;
        record.state = SeedState::Retired;
        self.save_index()
    }

    fn pin(&mut self, id: u64) -> Result<(), CorpusError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(CorpusError::SeedNotFound(id))?;
        record.seed.pinned = true;
        record.state = SeedState::Active;
        self.save_index()
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn coverage_snapshot(&self) -> Vec<CoverageEntry> {
        self.records
            .values()
            .filter(|record| record.is_active() && !record.is_crash())
            .map(|record| CoverageEntry {
                id: record.seed.id,
                hit_set: record.hit_set.clone(),
                new_ids: record.metrics.new_ids.clone(),
                pinned: record.seed.pinned,
            })
            .collect()
    }
}
