use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sem_core::{Result, RunnerKind, SemError};

/// What `run_missing` does with pairs whose last attempt FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailedRunPolicy {
    /// Leave them alone until cleared or the repetition count grows.
    #[default]
    Skip,
    /// Dispatch a new attempt.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), doubling up to the cap.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GridConfig {
    /// Prefix of the submit command; the job script path is appended.
    pub submit_command: Vec<String>,
    /// Prefix of the status command; the job id is appended.
    pub status_command: Vec<String>,
    /// Prefix of the cancel command; the job id is appended.
    pub cancel_command: Vec<String>,
    /// Status-command exit codes meaning the queue no longer knows the job.
    pub unknown_job_exit_codes: Vec<i32>,
    /// Output fragments meaning the same, matched case-insensitively.
    pub unknown_job_patterns: Vec<String>,
    pub poll_interval_ms: u64,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            submit_command: vec!["qsub".into(), "-terse".into()],
            status_command: vec!["qstat".into(), "-j".into()],
            cancel_command: vec!["qdel".into()],
            unknown_job_exit_codes: Vec::new(),
            unknown_job_patterns: vec![
                "do not exist".into(),
                "unknown job".into(),
                "invalid job id".into(),
            ],
            poll_interval_ms: 5_000,
            max_in_flight: 256,
            retry: RetryPolicy::default(),
        }
    }
}

impl GridConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Whether a failed status query says the job left the queue, as opposed
    /// to the queue itself not answering.
    pub fn reports_unknown_job(&self, exit_code: Option<i32>, output: &str) -> bool {
        if exit_code.map_or(false, |code| self.unknown_job_exit_codes.contains(&code)) {
            return true;
        }
        let output = output.to_ascii_lowercase();
        self.unknown_job_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && output.contains(&pattern.to_ascii_lowercase()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Local worker count; defaults to the number of available cores.
    pub concurrency: Option<usize>,
    pub failed_runs: FailedRunPolicy,
    /// Stop dispatching after this many FAILED runs in one invocation.
    pub max_failures: Option<usize>,
    pub abort_on_infrastructure_failure: bool,
    /// Local runs exceeding this are killed and recorded FAILED.
    pub job_timeout_secs: Option<u64>,
    pub grid: GridConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            failed_runs: FailedRunPolicy::Skip,
            max_failures: None,
            abort_on_infrastructure_failure: true,
            job_timeout_secs: None,
            grid: GridConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(raw).map_err(|e| SemError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SemError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            return Err(SemError::Config("concurrency must be at least 1".into()));
        }
        if self.grid.max_in_flight == 0 {
            return Err(SemError::Config("grid.max_in_flight must be at least 1".into()));
        }
        if self.grid.submit_command.is_empty() || self.grid.status_command.is_empty() {
            return Err(SemError::Config(
                "grid submit and status commands cannot be empty".into(),
            ));
        }
        if self.grid.retry.max_attempts == 0 {
            return Err(SemError::Config("grid.retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

pub const GRID_OVERRIDE_ENV: &str = "SEM_GRID";

/// Deployment facts probed once, then passed around as a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionEnvironment {
    pub grid_available: bool,
}

impl ExecutionEnvironment {
    /// `SEM_GRID=1|0` forces the answer; otherwise look for the submit command on `PATH`.
    pub fn detect(grid: &GridConfig) -> Self {
        let forced = std::env::var(GRID_OVERRIDE_ENV).ok().and_then(|v| match v.trim() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        });
        let grid_available = forced.unwrap_or_else(|| {
            grid.submit_command
                .first()
                .map(|program| find_on_path(program).is_some())
                .unwrap_or(false)
        });
        Self { grid_available }
    }

    pub fn preferred_runner(&self) -> RunnerKind {
        if self.grid_available {
            RunnerKind::Grid
        } else {
            RunnerKind::Local
        }
    }
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_overrides_only_named_fields() {
        let config = ManagerConfig::from_yaml_str(
            "concurrency: 3\nfailed_runs: retry\ngrid:\n  poll_interval_ms: 250\n  retry:\n    max_attempts: 2\n",
        )
        .expect("parse");
        assert_eq!(config.effective_concurrency(), 3);
        assert_eq!(config.failed_runs, FailedRunPolicy::Retry);
        assert_eq!(config.grid.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.grid.retry.max_attempts, 2);
        assert_eq!(config.grid.retry.initial_backoff_ms, 1_000);
        assert!(config.abort_on_infrastructure_failure);
        assert_eq!(config.grid.submit_command, vec!["qsub", "-terse"]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ManagerConfig::from_yaml_str("concurency: 3\n").expect_err("typo");
        assert!(matches!(err, SemError::Config(_)));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(ManagerConfig::from_yaml_str("concurrency: 0\n").is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(80), Duration::from_millis(1_000));
    }

    #[test]
    fn unknown_job_answers_are_configurable() {
        let mut grid = GridConfig::default();
        assert!(grid.reports_unknown_job(Some(1), "Following jobs do not exist: 77"));
        assert!(grid.reports_unknown_job(Some(153), "qstat: Unknown Job Id 77.head"));
        assert!(!grid.reports_unknown_job(Some(1), "error: commlib error: can't connect"));
        assert!(!grid.reports_unknown_job(Some(153), ""));

        let config = ManagerConfig::from_yaml_str(
            "grid:\n  unknown_job_exit_codes: [153]\n  unknown_job_patterns: []\n",
        )
        .expect("parse");
        grid = config.grid;
        assert!(grid.reports_unknown_job(Some(153), ""));
        assert!(!grid.reports_unknown_job(Some(1), "Following jobs do not exist"));
    }

    #[test]
    fn default_concurrency_is_positive() {
        assert!(ManagerConfig::default().effective_concurrency() >= 1);
    }

    #[test]
    fn preferred_runner_follows_grid_availability() {
        let with_grid = ExecutionEnvironment { grid_available: true };
        let without = ExecutionEnvironment { grid_available: false };
        assert_eq!(with_grid.preferred_runner(), RunnerKind::Grid);
        assert_eq!(without.preferred_runner(), RunnerKind::Local);
    }

    #[test]
    fn absolute_program_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prog = dir.path().join("qsub");
        std::fs::write(&prog, b"").expect("write");
        assert_eq!(find_on_path(prog.to_str().expect("utf8")), Some(prog));
        assert_eq!(find_on_path("/definitely/not/here/qsub"), None);
    }
}
