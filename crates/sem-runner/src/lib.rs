//! Execution backends and the campaign manager that drives them.

use std::fs;
use std::path::{Path, PathBuf};

use sem_core::{
    CancellationToken, Job, Result, RunRecord, RunnerKind, TargetSpec, STDERR_FILE, STDOUT_FILE,
};

mod config;
mod grid;
mod local;
mod manager;

pub use config::{
    ExecutionEnvironment, FailedRunPolicy, GridConfig, ManagerConfig, RetryPolicy,
    GRID_OVERRIDE_ENV,
};
pub use grid::{
    CommandGridBackend, GridBackend, GridError, GridJobOutput, GridJobStatus, GridRunner,
    GridSubmission,
};
pub use local::LocalRunner;
pub use manager::{CampaignManager, HaltReason, Progress, RunSummary};

/// Everything a runner needs besides the job itself.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub results_dir: &'a Path,
    pub target: &'a TargetSpec,
    pub repetition_argument: &'a str,
    pub cancel: &'a CancellationToken,
}

impl RunContext<'_> {
    pub fn output_dir(&self, job: &Job) -> PathBuf {
        self.results_dir.join(job.output_dir())
    }

    /// `--name=value` for every parameter, then the repetition argument.
    pub fn arguments(&self, job: &Job) -> Vec<String> {
        let mut args: Vec<String> = job
            .combination
            .iter()
            .map(|(name, value)| format!("--{}={}", name, value.to_arg()))
            .collect();
        args.push(format!("--{}={}", self.repetition_argument, job.repetition));
        args
    }
}

/// Executes one run and reports its terminal record.
///
/// `Ok` carries a COMPLETE or FAILED record: a non-zero exit is a result,
/// not an error. `Err(SemError::Cancelled)` means the job was abandoned;
/// any other error is an infrastructure failure.
pub trait Runner: Send + Sync {
    fn kind(&self) -> RunnerKind;

    /// Upper bound on jobs in flight at once.
    fn concurrency(&self) -> usize;

    fn execute(&self, job: &Job, ctx: &RunContext<'_>) -> Result<RunRecord>;
}

/// Creates a fresh, empty output directory for an attempt.
pub(crate) fn prepare_output_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        let occupied = fs::read_dir(dir)?.next().is_some();
        if occupied {
            return Err(sem_core::SemError::AlreadyExists(dir.to_path_buf()));
        }
    }
    sem_core::ensure_dir(dir)
}

/// Files the program produced, relative to its output directory.
pub(crate) fn collect_artifacts(dir: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        if rel == Path::new(STDOUT_FILE) || rel == Path::new(STDERR_FILE) {
            continue;
        }
        let name = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(name);
    }
    Ok(out)
}

/// Last non-empty line of a captured stream, for failure diagnostics.
pub(crate) fn tail_line(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    String::from_utf8_lossy(&bytes)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim().to_string())
}
