use crate::seed::{CoverageId, Seed};
use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Environment variable through which the instrumented target is told where
/// to dump its coverage edge ids (whitespace-separated u64, decimal or 0x hex).
pub const COVERAGE_FILE_ENV: &str = "COVTRACK_COVERAGE_FILE";

#[derive(Error, Debug)]
pub enum RunnerError {
    /// The instrumented binary is missing or unexecutable. Fatal: the whole
    /// batch is aborted, nothing can be scored against a target that cannot
    /// start.
    #[error("failed to launch instrumented target: {0}")]
    TargetLaunch(String),

    #[error("runner I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification of one target run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    /// Clean exit with code 0.
    Ok,
    /// Killed by a signal or exited non-zero. Crashes are first-class,
    /// desirable outcomes, not errors.
    Crash(String),
    /// Killed after exceeding the wall-clock bound.
    Timeout,
    /// The run produced no trustworthy result (instrumentation failure).
    Error(String),
}

impl ExitStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExitStatus::Ok)
    }

    pub fn is_crash(&self) -> bool {
        matches!(self, ExitStatus::Crash(_))
    }
}

/// The ephemeral outcome of executing one seed. Consumed by the quality
/// scorer; not persisted beyond the metadata it derives.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub seed_id: u64,
    pub hit_set: HashSet<CoverageId>,
    pub exit_status: ExitStatus,
    pub wall_time: Duration,
    /// False when a verification re-run produced a different hit-set.
    /// Flagged rather than silently trusted.
    pub deterministic: bool,
}

/// Executes one candidate program against the instrumented target build.
///
/// Runners never mutate the branch universe; that is the scorer's job, so
/// the update stays atomic and auditable.
pub trait Runner: Send + Sync {
    fn run(&self, seed: &Seed) -> Result<ExecutionResult, RunnerError>;
}

/// Settings for [`CommandRunner`]. Every argument containing `{}` has it
/// replaced with the path of the temp file holding the seed program; if no
/// argument carries the template, the path is appended as the last argument.
#[derive(Debug, Clone)]
pub struct CommandRunnerConfig {
    pub command: Vec<String>,
    pub timeout: Duration,
    pub memory_limit_mb: Option<u64>,
    pub working_dir: Option<PathBuf>,
    /// Execute each seed twice and flag hit-set mismatches.
    pub verify_determinism: bool,
}

/// Runs seeds by spawning the instrumented target in an isolated child
/// process with a bounded timeout and (on unix) a bounded address space.
pub struct CommandRunner {
    config: CommandRunnerConfig,
}

impl CommandRunner {
    pub fn new(config: CommandRunnerConfig) -> Self {
        Self { config }
    }

    fn wait_with_timeout(&self, mut child: Child) -> Result<ExitStatus, RunnerError> {
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(classify_exit(status)),
                Ok(None) => {
                    if start.elapsed() > self.config.timeout {
                        log::debug!("target exceeded {:?}, killing", self.config.timeout);
                        child.kill()?;
                        // Reap so the pid is not leaked.
                        let _ = child.wait();
                        return Ok(ExitStatus::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(RunnerError::Io(e)),
            }
        }
    }

    fn execute_once(
        &self,
        seed: &Seed,
    ) -> Result<(ExitStatus, HashSet<CoverageId>, Duration), RunnerError> {
        let mut seed_file = tempfile::Builder::new()
            .prefix("covtrack_seed_")
            .suffix(".cc")
            .tempfile()?;
        seed_file.write_all(seed.program.as_bytes())?;
        seed_file.flush()?;
        let seed_path = seed_file.path().to_string_lossy().into_owned();

        let coverage_file = tempfile::Builder::new()
            .prefix("covtrack_cov_")
            .tempfile()?;
        let coverage_path = coverage_file.path().to_path_buf();

        let mut cmd = Command::new(&self.config.command[0]);
        let mut template_used = false;
        for arg in &self.config.command[1..] {
            if arg.contains("{}") {
                template_used = true;
                cmd.arg(arg.replace("{}", &seed_path));
            } else {
                cmd.arg(arg);
            }
        }
        if !template_used {
            cmd.arg(&seed_path);
        }
        cmd.env(COVERAGE_FILE_ENV, &coverage_path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        if let Some(limit_mb) = self.config.memory_limit_mb {
            use std::os::unix::process::CommandExt;
            let limit_bytes = limit_mb.saturating_mul(1024 * 1024);
            // Applied in the child between fork and exec.
            unsafe {
                cmd.pre_exec(move || {
                    let rlimit = libc::rlimit {
                        rlim_cur: limit_bytes as libc::rlim_t,
                        rlim_max: limit_bytes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let start = Instant::now();
        let child = cmd.spawn().map_err(|e| {
            RunnerError::TargetLaunch(format!("{:?}: {}", self.config.command, e))
        })?;
        let exit_status = self.wait_with_timeout(child)?;
        let wall_time = start.elapsed();

        let hit_set = read_coverage_file(&coverage_path);
        Ok((exit_status, hit_set, wall_time))
    }
}

impl Runner for CommandRunner {
    fn run(&self, seed: &Seed) -> Result<ExecutionResult, RunnerError> {
        if self.config.command.is_empty() {
            return Err(RunnerError::TargetLaunch(
                "no target command configured".to_string(),
            ));
        }

        let (exit_status, hit_set, wall_time) = self.execute_once(seed)?;

        let mut deterministic = true;
        if self.config.verify_determinism && !matches!(exit_status, ExitStatus::Timeout) {
            let (_, second_hits, _) = self.execute_once(seed)?;
            if second_hits != hit_set {
                log::warn!(
                    "seed {} produced an unstable hit-set ({} vs {} ids); flagging as non-deterministic",
                    seed.id,
                    hit_set.len(),
                    second_hits.len()
                );
                deterministic = false;
            }
        }

        Ok(ExecutionResult {
            seed_id: seed.id,
            hit_set,
            exit_status,
            wall_time,
            deterministic,
        })
    }
}

/// Closure-backed runner for exercising the scorer, corpus and minimizer
/// without an instrumented target.
pub struct FnRunner<F>
where
    F: Fn(&Seed) -> (ExitStatus, HashSet<CoverageId>) + Send + Sync,
{
    harness: F,
}

impl<F> FnRunner<F>
where
    F: Fn(&Seed) -> (ExitStatus, HashSet<CoverageId>) + Send + Sync,
{
    pub fn new(harness: F) -> Self {
        Self { harness }
    }
}

impl<F> Runner for FnRunner<F>
where
    F: Fn(&Seed) -> (ExitStatus, HashSet<CoverageId>) + Send + Sync,
{
    fn run(&self, seed: &Seed) -> Result<ExecutionResult, RunnerError> {
        let start = Instant::now();
        let (exit_status, hit_set) = (self.harness)(seed);
        Ok(ExecutionResult {
            seed_id: seed.id,
            hit_set,
            exit_status,
            wall_time: start.elapsed(),
            deterministic: true,
        })
    }
}

fn classify_exit(status: std::process::ExitStatus) -> ExitStatus {
    if status.success() {
        return ExitStatus::Ok;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitStatus::Crash(format!("terminated by signal {signal}"));
        }
    }
    match status.code() {
        Some(code) => ExitStatus::Crash(format!("exited with code {code}")),
        None => ExitStatus::Crash("exited abnormally".to_string()),
    }
}

fn read_coverage_file(path: &std::path::Path) -> HashSet<CoverageId> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return HashSet::new(),
    };
    let mut hit_set = HashSet::new();
    let mut malformed = 0usize;
    for token in content.split_whitespace() {
        let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => token.parse::<u64>(),
        };
        match parsed {
            Ok(id) => {
                hit_set.insert(CoverageId(id));
            }
            Err(_) => malformed += 1,
        }
    }
    if malformed > 0 {
        log::warn!("ignored {malformed} malformed coverage tokens in {path:?}");
    }
    hit_set
}


#[cfg(all(test, unix))]
mod command_runner_tests {
    use super::*;

    fn shell_runner(script: &str, timeout_ms: u64) -> CommandRunner {
        CommandRunner::new(CommandRunnerConfig {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout: Duration::from_millis(timeout_ms),
            memory_limit_mb: None,
            working_dir: None,
            verify_determinism: false,
        })
    }

    #[test]
    fn clean_exit_with_coverage_dump() {
        let runner = shell_runner(
            r#"printf '1 2 0x10\n' > "$COVTRACK_COVERAGE_FILE"; exit 0"#,
            2000,
        );
        let result = runner.run(&Seed::from_program_text(1, "x();")).unwrap();
        assert_eq!(result.exit_status, ExitStatus::Ok);
        let expected: HashSet<CoverageId> =
            [1, 2, 16].into_iter().map(CoverageId).collect();
        assert_eq!(result.hit_set, expected);
    }

    #[test]
    fn signal_death_is_a_crash() {
        let runner = shell_runner(r#"kill -SEGV $$"#, 2000);
        let result = runner.run(&Seed::from_program_text(2, "x();")).unwrap();
        match result.exit_status {
            ExitStatus::Crash(desc) => {
                assert!(desc.contains("signal 11"), "unexpected crash desc: {desc}")
            }
            other => panic!("expected Crash, got {other:?}"),
        }
    }

    #[test]
    fn nonzero_exit_is_a_crash() {
        let runner = shell_runner("exit 3", 2000);
        let result = runner.run(&Seed::from_program_text(3, "x();")).unwrap();
        match result.exit_status {
            ExitStatus::Crash(desc) => assert!(desc.contains("code 3")),
            other => panic!("expected Crash, got {other:?}"),
        }
    }

    #[test]
    fn slow_target_times_out() {
        let runner = shell_runner("sleep 5", 100);
        let result = runner.run(&Seed::from_program_text(4, "x();")).unwrap();
        assert_eq!(result.exit_status, ExitStatus::Timeout);
    }

    #[test]
    fn missing_binary_is_a_launch_error() {
        let runner = CommandRunner::new(CommandRunnerConfig {
            command: vec!["./no_such_target_binary_12345".to_string()],
            timeout: Duration::from_secs(1),
            memory_limit_mb: None,
            working_dir: None,
            verify_determinism: false,
        });
        match runner.run(&Seed::from_program_text(5, "x();")) {
            Err(RunnerError::TargetLaunch(_)) => {}
            other => panic!("expected TargetLaunch, got {other:?}"),
        }
    }

    #[test]
    fn unstable_hit_set_is_flagged() {
        // $$ differs between the two verification runs.
        let runner = CommandRunner::new(CommandRunnerConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"echo $$ > "$COVTRACK_COVERAGE_FILE""#.to_string(),
            ],
            timeout: Duration::from_secs(2),
            memory_limit_mb: None,
            working_dir: None,
            verify_determinism: true,
        });
        let result = runner.run(&Seed::from_program_text(6, "x();")).unwrap();
        assert!(!result.deterministic);
    }

    #[test]
    fn seed_path_is_substituted_into_template() {
        let runner = CommandRunner::new(CommandRunnerConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"grep -q marker_call "$0""#.to_string(),
                "{}".to_string(),
            ],
            timeout: Duration::from_secs(2),
            memory_limit_mb: None,
            working_dir: None,
            verify_determinism: false,
        });
        let result = runner
            .run(&Seed::from_program_text(7, "marker_call();"))
            .unwrap();
        assert_eq!(result.exit_status, ExitStatus::Ok);
    }
}
