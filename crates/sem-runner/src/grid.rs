//! Batch-queue execution.
//!
//! The queue is reached through [`GridBackend`], which only has to submit,
//! report status and hand back results. An unreachable queue is retried with
//! backoff and never turns a job into a FAILED run by itself.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use sem_core::{
    atomic_write_bytes, CancellationToken, Job, Result, RunRecord, RunnerKind, SemError,
    STDERR_FILE, STDOUT_FILE,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{GridConfig, RetryPolicy};
use crate::{collect_artifacts, prepare_output_dir, tail_line, RunContext, Runner};

const EXIT_CODE_FILE: &str = ".exit_code";
const JOB_SCRIPT_FILE: &str = ".job.sh";
const CANCEL_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GridError {
    /// Transient: the queue could not be reached or did not answer.
    #[error("queue unreachable: {0}")]
    Unreachable(String),
    /// Permanent: the queue refused the request.
    #[error("queue rejected request: {0}")]
    Rejected(String),
}

/// What to run and where its output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridSubmission {
    pub job_name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridJobStatus {
    Queued,
    Running,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridJobOutput {
    /// `None` when the queue lost track of the process's exit status.
    pub exit_code: Option<i32>,
}

/// The three operations required of a batch-queue system, plus best-effort cancel.
pub trait GridBackend: Send + Sync {
    fn submit(&self, submission: &GridSubmission) -> std::result::Result<String, GridError>;

    fn status(&self, job_id: &str, submission: &GridSubmission)
        -> std::result::Result<GridJobStatus, GridError>;

    fn retrieve(
        &self,
        job_id: &str,
        submission: &GridSubmission,
    ) -> std::result::Result<GridJobOutput, GridError>;

    fn cancel(&self, _job_id: &str) -> std::result::Result<(), GridError> {
        Ok(())
    }
}

/// Runs jobs through a [`GridBackend`], one submission per job.
pub struct GridRunner {
    backend: Box<dyn GridBackend>,
    poll_interval: Duration,
    max_in_flight: usize,
    retry: RetryPolicy,
}

impl std::fmt::Debug for GridRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridRunner")
            .field("poll_interval", &self.poll_interval)
            .field("max_in_flight", &self.max_in_flight)
            .field("retry", &self.retry)
            .finish()
    }
}

impl GridRunner {
    pub fn new(backend: Box<dyn GridBackend>, config: &GridConfig) -> Self {
        Self {
            backend,
            poll_interval: config.poll_interval(),
            max_in_flight: config.max_in_flight.max(1),
            retry: config.retry.clone(),
        }
    }

    pub fn with_command_backend(config: &GridConfig) -> Self {
        Self::new(Box::new(CommandGridBackend::new(config.clone())), config)
    }

    /// Calls `op` until it succeeds, is rejected, or retries run out.
    fn with_retry<T>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: impl FnMut() -> std::result::Result<T, GridError>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(v) => return Ok(v),
                Err(GridError::Rejected(msg)) => {
                    return Err(SemError::Infrastructure(format!("{} rejected: {}", what, msg)))
                }
                Err(GridError::Unreachable(msg)) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(SemError::Infrastructure(format!(
                            "{} failed after {} attempts: {}",
                            what, attempt, msg
                        )));
                    }
                    let delay = self.retry.backoff(attempt);
                    warn!(attempt, delay = ?delay, "{} failed, retrying: {}", what, msg);
                    sleep_unless_cancelled(delay, cancel)?;
                }
            }
        }
    }

    fn submission(&self, job: &Job, ctx: &RunContext<'_>, out_dir: &Path) -> GridSubmission {
        GridSubmission {
            job_name: format!("sem-{}-{}", job.run_key, job.attempt),
            program: ctx.target.path.clone(),
            args: ctx.arguments(job),
            working_dir: out_dir.to_path_buf(),
            stdout_path: out_dir.join(STDOUT_FILE),
            stderr_path: out_dir.join(STDERR_FILE),
        }
    }

    fn wait_for_terminal(
        &self,
        job_id: &str,
        submission: &GridSubmission,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let status = self.with_retry("status poll", cancel, || {
                self.backend.status(job_id, submission)
            })?;
            debug!(job_id, status = ?status, "polled grid job");
            if status == GridJobStatus::Finished {
                return Ok(());
            }
            sleep_unless_cancelled(self.poll_interval, cancel)?;
        }
    }
}

fn sleep_unless_cancelled(total: Duration, cancel: &CancellationToken) -> Result<()> {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return Err(SemError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(CANCEL_SLICE.min(deadline - now));
    }
}

impl Runner for GridRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Grid
    }

    fn concurrency(&self) -> usize {
        self.max_in_flight
    }

    fn execute(&self, job: &Job, ctx: &RunContext<'_>) -> Result<RunRecord> {
        let out_dir = ctx.output_dir(job);
        prepare_output_dir(&out_dir)?;
        let submission = self.submission(job, ctx, &out_dir);
        let mut record = RunRecord::running(job);

        if ctx.cancel.is_cancelled() {
            return Err(SemError::Cancelled);
        }
        let job_id = self.with_retry("submit", ctx.cancel, || self.backend.submit(&submission))?;
        info!(run_key = %job.run_key, job_id = %job_id, "submitted to grid");
        record.backend_job_id = Some(job_id.clone());

        if let Err(err) = self.wait_for_terminal(&job_id, &submission, ctx.cancel) {
            if matches!(err, SemError::Cancelled) {
                if let Err(e) = self.backend.cancel(&job_id) {
                    warn!(job_id = %job_id, "could not cancel grid job: {}", e);
                }
            }
            return Err(err);
        }

        let output = self.with_retry("retrieve", ctx.cancel, || {
            self.backend.retrieve(&job_id, &submission)
        })?;
        let artifacts: Vec<String> = collect_artifacts(&out_dir)?
            .into_iter()
            .filter(|name| name != JOB_SCRIPT_FILE && !name.starts_with(EXIT_CODE_FILE))
            .collect();
        let record = match output.exit_code {
            Some(0) => record.complete(0, artifacts),
            Some(code) => {
                let reason = format!("exit status {}", code);
                let detail = tail_line(&submission.stderr_path)
                    .map(|line| format!("{}: {}", reason, line))
                    .unwrap_or(reason);
                warn!(run_key = %job.run_key, job_id = %job_id, "{}", detail);
                record.failed(Some(code), detail, artifacts)
            }
            None => record.failed(None, "grid job ended without an exit status", artifacts),
        };
        Ok(record)
    }
}

/// Drives a qsub/qstat/qdel style queue through its command-line tools.
///
/// Jobs run a small wrapper script that records the exit status next to the
/// outputs, so the results directory must be on a filesystem shared with the
/// execution hosts.
#[derive(Debug, Clone)]
pub struct CommandGridBackend {
    config: GridConfig,
}

impl CommandGridBackend {
    pub fn new(config: GridConfig) -> Self {
        Self { config }
    }

    fn run(&self, prefix: &[String], arg: &str) -> std::result::Result<std::process::Output, GridError> {
        let (program, rest) = prefix
            .split_first()
            .ok_or_else(|| GridError::Rejected("empty queue command".into()))?;
        Command::new(program)
            .args(rest)
            .arg(arg)
            .output()
            .map_err(|e| GridError::Unreachable(format!("{}: {}", program, e)))
    }
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

fn job_script(submission: &GridSubmission) -> String {
    let mut command = vec![shell_quote(&submission.program.to_string_lossy())];
    command.extend(submission.args.iter().map(|a| shell_quote(a)));
    format!(
        "#!/bin/sh\n#$ -N {name}\n#$ -o /dev/null\n#$ -e /dev/null\ncd {wd} || exit 125\n{cmd} > {out} 2> {err}\ncode=$?\necho $code > {exit}.tmp && mv {exit}.tmp {exit}\nexit $code\n",
        name = shell_quote(&submission.job_name),
        wd = shell_quote(&submission.working_dir.to_string_lossy()),
        cmd = command.join(" "),
        out = shell_quote(&submission.stdout_path.to_string_lossy()),
        err = shell_quote(&submission.stderr_path.to_string_lossy()),
        exit = EXIT_CODE_FILE,
    )
}

/// `qsub -terse` prints `12345`, `sbatch --parsable` prints `12345;cluster`.
fn parse_job_id(stdout: &str) -> Option<String> {
    let token = stdout.split_whitespace().next()?;
    let id = token.split(';').next()?.split('.').next()?;
    (!id.is_empty()).then(|| id.to_string())
}

impl GridBackend for CommandGridBackend {
    fn submit(&self, submission: &GridSubmission) -> std::result::Result<String, GridError> {
        let script = submission.working_dir.join(JOB_SCRIPT_FILE);
        atomic_write_bytes(&script, job_script(submission).as_bytes())
            .map_err(|e| GridError::Rejected(format!("cannot write job script: {}", e)))?;
        let output = self.run(&self.config.submit_command, &script.to_string_lossy())?;
        if !output.status.success() {
            return Err(GridError::Unreachable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        parse_job_id(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            GridError::Rejected("submit command printed no job id".into())
        })
    }

    fn status(
        &self,
        job_id: &str,
        submission: &GridSubmission,
    ) -> std::result::Result<GridJobStatus, GridError> {
        if submission.working_dir.join(EXIT_CODE_FILE).is_file() {
            return Ok(GridJobStatus::Finished);
        }
        let output = self.run(&self.config.status_command, job_id)?;
        if output.status.success() {
            return Ok(GridJobStatus::Running);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let answer = format!("{}{}", String::from_utf8_lossy(&output.stdout), stderr);
        if self.config.reports_unknown_job(output.status.code(), &answer) {
            // Gone from the queue without an exit file: killed by the
            // scheduler or lost with its host. Retrieval reports no status.
            if !submission.working_dir.join(EXIT_CODE_FILE).is_file() {
                warn!(job_id, "job left the queue without an exit status: {}", stderr.trim());
            }
            return Ok(GridJobStatus::Finished);
        }
        Err(GridError::Unreachable(format!(
            "status for {} unavailable: {}",
            job_id,
            stderr.trim()
        )))
    }

    fn retrieve(
        &self,
        job_id: &str,
        submission: &GridSubmission,
    ) -> std::result::Result<GridJobOutput, GridError> {
        let path = submission.working_dir.join(EXIT_CODE_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(GridJobOutput { exit_code: None })
            }
            Err(e) => {
                return Err(GridError::Unreachable(format!(
                    "exit status of {} not readable: {}",
                    job_id, e
                )))
            }
        };
        Ok(GridJobOutput {
            exit_code: raw.trim().parse().ok(),
        })
    }

    fn cancel(&self, job_id: &str) -> std::result::Result<(), GridError> {
        if self.config.cancel_command.is_empty() {
            return Ok(());
        }
        let output = self.run(&self.config.cancel_command, job_id)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(GridError::Rejected(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sem_core::{ParameterCombination, RunState, TargetSpec};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// In-memory queue: jobs "run" by writing files, status can be made flaky.
    #[derive(Default)]
    struct FakeQueue {
        submitted: Mutex<Vec<GridSubmission>>,
        polls: Mutex<HashMap<String, usize>>,
        polls_until_done: usize,
        unreachable_polls: AtomicUsize,
        exit_code: i32,
        cancelled: Mutex<Vec<String>>,
    }

    impl GridBackend for Arc<FakeQueue> {
        fn submit(&self, submission: &GridSubmission) -> std::result::Result<String, GridError> {
            let mut submitted = self.submitted.lock().expect("lock");
            submitted.push(submission.clone());
            fs::write(&submission.stdout_path, submission.args.join(" ")).expect("stdout");
            fs::write(&submission.stderr_path, "segfault in PhyLayer\n").expect("stderr");
            fs::write(submission.working_dir.join("trace.csv"), "t,v\n").expect("artifact");
            Ok(format!("{}", submitted.len()))
        }

        fn status(
            &self,
            job_id: &str,
            _submission: &GridSubmission,
        ) -> std::result::Result<GridJobStatus, GridError> {
            if self.unreachable_polls.load(Ordering::SeqCst) > 0 {
                self.unreachable_polls.fetch_sub(1, Ordering::SeqCst);
                return Err(GridError::Unreachable("connection refused".into()));
            }
            let mut polls = self.polls.lock().expect("lock");
            let n = polls.entry(job_id.to_string()).or_default();
            *n += 1;
            if *n > self.polls_until_done {
                Ok(GridJobStatus::Finished)
            } else {
                Ok(GridJobStatus::Queued)
            }
        }

        fn retrieve(
            &self,
            _job_id: &str,
            _submission: &GridSubmission,
        ) -> std::result::Result<GridJobOutput, GridError> {
            Ok(GridJobOutput {
                exit_code: Some(self.exit_code),
            })
        }

        fn cancel(&self, job_id: &str) -> std::result::Result<(), GridError> {
            self.cancelled.lock().expect("lock").push(job_id.to_string());
            Ok(())
        }
    }

    fn config(max_attempts: u32) -> GridConfig {
        GridConfig {
            poll_interval_ms: 10,
            retry: RetryPolicy {
                max_attempts,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
            },
            ..GridConfig::default()
        }
    }

    fn execute(runner: &GridRunner, dir: &Path, cancel: &CancellationToken) -> Result<RunRecord> {
        let target = TargetSpec {
            path: PathBuf::from("/opt/sim/bin/wifi-sim"),
            fingerprint: "sha256:abc".into(),
        };
        execute_target(runner, dir, &target, cancel)
    }

    fn execute_target(
        runner: &GridRunner,
        dir: &Path,
        target: &TargetSpec,
        cancel: &CancellationToken,
    ) -> Result<RunRecord> {
        let ctx = RunContext {
            results_dir: dir,
            target,
            repetition_argument: "RngRun",
            cancel,
        };
        let job = Job::new(ParameterCombination::new().with("nodes", 8), 2, 0);
        runner.execute(&job, &ctx)
    }

    #[test]
    fn completed_job_is_retrieved_with_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = Arc::new(FakeQueue {
            polls_until_done: 2,
            ..FakeQueue::default()
        });
        let runner = GridRunner::new(Box::new(Arc::clone(&queue)), &config(3));
        let record = execute(&runner, dir.path(), &CancellationToken::new()).expect("execute");
        assert_eq!(record.state, RunState::Complete);
        assert_eq!(record.backend_job_id.as_deref(), Some("1"));
        assert_eq!(record.artifacts, vec!["trace.csv"]);
        let submitted = queue.submitted.lock().expect("lock");
        assert_eq!(submitted[0].args, vec!["--nodes=8", "--RngRun=2"]);
    }

    #[test]
    fn transient_poll_failures_are_retried_not_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = Arc::new(FakeQueue {
            unreachable_polls: AtomicUsize::new(2),
            ..FakeQueue::default()
        });
        let runner = GridRunner::new(Box::new(Arc::clone(&queue)), &config(3));
        let record = execute(&runner, dir.path(), &CancellationToken::new()).expect("execute");
        assert_eq!(record.state, RunState::Complete);
    }

    #[test]
    fn exhausted_retries_are_infrastructure_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = Arc::new(FakeQueue {
            unreachable_polls: AtomicUsize::new(10),
            ..FakeQueue::default()
        });
        let runner = GridRunner::new(Box::new(Arc::clone(&queue)), &config(3));
        let err = execute(&runner, dir.path(), &CancellationToken::new()).expect_err("infra");
        assert!(err.is_retryable(), "{}", err);
        assert!(err.to_string().contains("after 3 attempts"), "{}", err);
    }

    #[test]
    fn non_zero_exit_becomes_failed_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = Arc::new(FakeQueue {
            exit_code: 139,
            ..FakeQueue::default()
        });
        let runner = GridRunner::new(Box::new(Arc::clone(&queue)), &config(3));
        let record = execute(&runner, dir.path(), &CancellationToken::new()).expect("execute");
        assert_eq!(record.state, RunState::Failed);
        assert_eq!(record.exit_code, Some(139));
        assert!(record
            .failure
            .expect("failure")
            .contains("segfault in PhyLayer"));
    }

    #[test]
    fn cancellation_cancels_the_grid_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = Arc::new(FakeQueue {
            polls_until_done: usize::MAX,
            ..FakeQueue::default()
        });
        let runner = GridRunner::new(Box::new(Arc::clone(&queue)), &config(3));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });
        let err = execute(&runner, dir.path(), &cancel).expect_err("cancelled");
        canceller.join().expect("join");
        assert!(matches!(err, SemError::Cancelled));
        assert_eq!(*queue.cancelled.lock().expect("lock"), vec!["1".to_string()]);
    }

    #[test]
    fn job_script_quotes_and_records_exit_status() {
        let submission = GridSubmission {
            job_name: "sem-abc-0".into(),
            program: PathBuf::from("/opt/my sim/run"),
            args: vec!["--mode=it's".into(), "--RngRun=1".into()],
            working_dir: PathBuf::from("/shared/results/data/abc/attempt-0"),
            stdout_path: PathBuf::from("/shared/results/data/abc/attempt-0/stdout"),
            stderr_path: PathBuf::from("/shared/results/data/abc/attempt-0/stderr"),
        };
        let script = job_script(&submission);
        assert!(script.contains("'/opt/my sim/run'"), "{}", script);
        assert!(script.contains("'--mode=it'\"'\"'s'"), "{}", script);
        assert!(script.contains("--RngRun=1 >"), "{}", script);
        assert!(script.contains("mv .exit_code.tmp .exit_code"), "{}", script);
    }

    #[test]
    fn job_ids_from_common_queue_tools() {
        assert_eq!(parse_job_id("4242\n").as_deref(), Some("4242"));
        assert_eq!(parse_job_id("4242;cluster1\n").as_deref(), Some("4242"));
        assert_eq!(parse_job_id("77.1-10:1").as_deref(), Some("77"));
        assert_eq!(parse_job_id("  \n"), None);
    }

    #[cfg(unix)]
    mod command_backend {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Runs the job script synchronously, like a queue that is never busy.
        const QSUB_RUNS: &str = "sh \"$1\" > /dev/null 2>&1\necho 77.head";
        /// Accepts the job but never runs it, like a node lost mid-job.
        const QSUB_LOSES: &str = "echo 77";
        const QSTAT_GONE: &str = "echo \"Following jobs do not exist: $1\" >&2\nexit 1";

        fn write_script(path: &Path, body: &str) -> PathBuf {
            fs::write(path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
            path.to_path_buf()
        }

        struct Queue {
            dir: tempfile::TempDir,
            target: TargetSpec,
        }

        impl Queue {
            fn new(sim_body: &str) -> Self {
                let dir = tempfile::tempdir().expect("tempdir");
                let path = write_script(&dir.path().join("wifi-sim"), sim_body);
                let target = TargetSpec {
                    path,
                    fingerprint: "sha256:abc".into(),
                };
                Self { dir, target }
            }

            fn runner(&self, qsub: &str, qstat: Option<&str>) -> GridRunner {
                let stub = |name: &str, body: &str| -> Vec<String> {
                    let path = write_script(&self.dir.path().join(name), body);
                    vec!["sh".into(), path.to_string_lossy().into_owned()]
                };
                let status_command = match qstat {
                    Some(body) => stub("qstat", body),
                    None => vec![self
                        .dir
                        .path()
                        .join("no-such-qstat")
                        .to_string_lossy()
                        .into_owned()],
                };
                let grid = GridConfig {
                    submit_command: stub("qsub", qsub),
                    status_command,
                    cancel_command: Vec::new(),
                    ..config(2)
                };
                GridRunner::with_command_backend(&grid)
            }

            fn execute(&self, runner: &GridRunner) -> Result<RunRecord> {
                execute_target(
                    runner,
                    &self.dir.path().join("results"),
                    &self.target,
                    &CancellationToken::new(),
                )
            }
        }

        #[test]
        fn wrapper_records_exit_status_for_completed_job() {
            let queue = Queue::new("echo \"$@\"\necho 1,2 > trace.csv");
            let runner = queue.runner(QSUB_RUNS, Some(QSTAT_GONE));
            let record = queue.execute(&runner).expect("execute");
            assert_eq!(record.state, RunState::Complete);
            assert_eq!(record.exit_code, Some(0));
            assert_eq!(record.backend_job_id.as_deref(), Some("77"));
            assert_eq!(record.artifacts, vec!["trace.csv"]);
            let out = queue.dir.path().join("results").join(&record.output_dir);
            assert_eq!(
                fs::read_to_string(out.join(STDOUT_FILE)).expect("stdout"),
                "--nodes=8 --RngRun=2\n"
            );
        }

        #[test]
        fn non_zero_exit_from_wrapper_is_failed() {
            let queue = Queue::new("echo 'PHY assertion' >&2\nexit 4");
            let runner = queue.runner(QSUB_RUNS, Some(QSTAT_GONE));
            let record = queue.execute(&runner).expect("execute");
            assert_eq!(record.state, RunState::Failed);
            assert_eq!(record.exit_code, Some(4));
            let failure = record.failure.expect("failure");
            assert!(failure.contains("PHY assertion"), "{}", failure);
        }

        #[test]
        fn job_gone_from_queue_without_exit_status_is_failed() {
            let queue = Queue::new("exit 0");
            let runner = queue.runner(QSUB_LOSES, Some(QSTAT_GONE));
            let record = queue.execute(&runner).expect("execute");
            assert_eq!(record.state, RunState::Failed);
            assert_eq!(record.exit_code, None);
            assert_eq!(record.backend_job_id.as_deref(), Some("77"));
            let failure = record.failure.expect("failure");
            assert!(failure.contains("without an exit status"), "{}", failure);
        }

        #[test]
        fn missing_status_tool_is_infrastructure_failure() {
            let queue = Queue::new("exit 0");
            let runner = queue.runner(QSUB_LOSES, None);
            let err = queue.execute(&runner).expect_err("queue unreachable");
            assert!(err.is_retryable(), "{}", err);
            assert!(err.to_string().contains("after 2 attempts"), "{}", err);
        }

        #[test]
        fn unrecognised_status_error_is_retried_then_infrastructure() {
            let queue = Queue::new("exit 0");
            let runner = queue.runner(QSUB_LOSES, Some("echo 'commlib error' >&2\nexit 1"));
            let err = queue.execute(&runner).expect_err("queue unreachable");
            assert!(err.is_retryable(), "{}", err);
            assert!(err.to_string().contains("commlib error"), "{}", err);
        }
    }
}
