pub mod batch;
pub mod config;
pub mod corpus;
pub mod header;
pub mod minimize;
pub mod runner;
pub mod scorer;
pub mod seed;
pub mod universe;

pub use batch::{load_seed_dir, run_batch, BatchError, IngestReport};
pub use config::CovtrackConfig;
pub use corpus::{
    Corpus, CorpusError, InMemoryCorpus, OnDiskCorpus, Partition, SeedFilter, SeedRecord,
    SeedState,
};
pub use header::{HeaderError, SeedHeader};
pub use minimize::{minimize, MinimizeOutcome};
pub use runner::{
    CommandRunner, CommandRunnerConfig, ExecutionResult, ExitStatus, FnRunner, Runner, RunnerError,
};
pub use scorer::QualityScorer;
pub use seed::{CallDescriptor, CoverageId, QualityMetrics, Seed};
pub use universe::BranchUniverse;
