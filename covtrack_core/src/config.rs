use crate::runner::CommandRunnerConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunnerSettings {
    /// Target invocation; an argument containing `{}` receives the seed file
    /// path, otherwise the path is appended.
    pub command: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub memory_limit_mb: Option<u64>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub verify_determinism: bool,
}

fn default_timeout_ms() -> u64 {
    2000
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_ms: default_timeout_ms(),
            memory_limit_mb: None,
            working_dir: None,
            verify_determinism: false,
        }
    }
}

impl RunnerSettings {
    pub fn to_runner_config(&self) -> CommandRunnerConfig {
        CommandRunnerConfig {
            command: self.command.clone(),
            timeout: Duration::from_millis(self.timeout_ms),
            memory_limit_mb: self.memory_limit_mb,
            working_dir: self.working_dir.clone(),
            verify_determinism: self.verify_determinism,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ScorerSettings {
    /// Call names reported as critical when they appear in a seed's sequence.
    #[serde(default)]
    pub critical_calls: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    #[serde(default = "default_corpus_path")]
    pub path: PathBuf,
}

pub fn default_corpus_path() -> PathBuf {
    PathBuf::from("./.covtrack_corpus")
}

impl Default for CorpusSettings {
    fn default() -> Self {
        Self {
            path: default_corpus_path(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CovtrackConfig {
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub scorer: ScorerSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
}

impl CovtrackConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: CovtrackConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
