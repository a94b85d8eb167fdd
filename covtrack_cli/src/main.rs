use covtrack_core::batch::{load_seed_dir, run_batch};
use covtrack_core::config::CovtrackConfig;
use covtrack_core::corpus::{Corpus, OnDiskCorpus, SeedFilter};
use covtrack_core::header::SeedHeader;
use covtrack_core::minimize::minimize;
use covtrack_core::runner::{CommandRunner, Runner};
use covtrack_core::scorer::QualityScorer;
use covtrack_core::seed::Seed;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Execute, score and store every seed program found in a directory.
    Ingest {
        /// Directory of candidate seed programs (.c/.cc/.cpp/.cxx).
        dir: PathBuf,
    },
    /// Execute and score a single seed file, printing its annotation header.
    Score {
        seed_file: PathBuf,
    },
    /// Reduce a corpus to a coverage-preserving subset.
    Minimize {
        corpus_dir: PathBuf,
    },
}

fn load_config(cli_path: Option<PathBuf>) -> Result<CovtrackConfig, anyhow::Error> {
    match cli_path {
        Some(config_path) => {
            log::info!("loading configuration from {config_path:?}");
            CovtrackConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("covtrack.toml");
            if default_config_path.exists() {
                log::info!("loading default configuration {default_config_path:?}");
                CovtrackConfig::load_from_file(&default_config_path)
            } else {
                log::info!("no configuration file found, using built-in defaults");
                Ok(CovtrackConfig::default())
            }
        }
    }
}

fn build_runner(config: &CovtrackConfig) -> Result<CommandRunner, anyhow::Error> {
    if config.runner.command.is_empty() {
        anyhow::bail!(
            "no target command configured; set [runner] command in the config file"
        );
    }
    Ok(CommandRunner::new(config.runner.to_runner_config()))
}

fn open_corpus(config: &CovtrackConfig) -> Result<OnDiskCorpus, anyhow::Error> {
    OnDiskCorpus::open(&config.corpus.path)
        .with_context(|| format!("cannot open corpus at {:?}", config.corpus.path))
}

/// Re-seeds the scorer's universe from everything already stored, so a
/// resumed ingest only credits genuinely new coverage.
fn preload_universe(scorer: &QualityScorer, corpus: &OnDiskCorpus) {
    scorer.preload(
        corpus
            .list(&SeedFilter::default())
            .into_iter()
            .map(|record| record.hit_set.iter().copied().collect()),
    );
}

fn cmd_ingest(config: &CovtrackConfig, dir: &PathBuf) -> Result<(), anyhow::Error> {
    let runner = build_runner(config)?;
    let mut corpus = open_corpus(config)?;
    let scorer = QualityScorer::new(config.scorer.critical_calls.iter().cloned());
    preload_universe(&scorer, &corpus);

    let seeds = load_seed_dir(dir, corpus.next_seed_id())
        .with_context(|| format!("cannot load seeds from {dir:?}"))?;
    if seeds.is_empty() {
        log::warn!("no seed programs found in {dir:?}");
        return Ok(());
    }

    log::info!(
        "ingesting {} seed(s) from {dir:?} into {:?}",
        seeds.len(),
        corpus.dir()
    );
    let start = Instant::now();
    let report = run_batch(seeds, &runner, &scorer, &mut corpus)?;
    log::info!("ingest finished in {:.2?}", start.elapsed());
    println!("{report}");
    Ok(())
}

fn cmd_score(config: &CovtrackConfig, seed_file: &PathBuf) -> Result<(), anyhow::Error> {
    let runner = build_runner(config)?;
    let corpus = open_corpus(config)?;
    let scorer = QualityScorer::new(config.scorer.critical_calls.iter().cloned());
    preload_universe(&scorer, &corpus);

    let text = std::fs::read_to_string(seed_file)
        .with_context(|| format!("cannot read seed file {seed_file:?}"))?;
    let seed = if SeedHeader::present_in(&text) {
        let (header, body) = SeedHeader::parse(&text)?;
        let mut seed =
            Seed::from_program_text(header.id, body).with_combination(header.combination);
        seed.prompt = header.prompt;
        seed
    } else {
        Seed::from_program_text(corpus.next_seed_id(), text)
    };

    let result = runner.run(&seed)?;
    if !result.deterministic {
        log::warn!("seed {} produced an unstable hit-set", seed.id);
    }
    let metrics = scorer.score(&seed, &result);
    print!("{}", SeedHeader::from_seed(&seed, &metrics).render());
    Ok(())
}

fn cmd_minimize(corpus_dir: &PathBuf) -> Result<(), anyhow::Error> {
    let mut corpus = OnDiskCorpus::open(corpus_dir)
        .with_context(|| format!("cannot open corpus at {corpus_dir:?}"))?;
    let start = Instant::now();
    let outcome = minimize(&mut corpus)?;
    log::info!("minimization finished in {:.2?}", start.elapsed());
    println!("{outcome}");
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(cli.config_file)?;

    match &cli.command {
        CliCommand::Ingest { dir } => cmd_ingest(&config, dir),
        CliCommand::Score { seed_file } => cmd_score(&config, seed_file),
        CliCommand::Minimize { corpus_dir } => cmd_minimize(corpus_dir),
    }
}
