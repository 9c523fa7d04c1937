use std::fs::File;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use sem_core::{Job, Result, RunRecord, RunnerKind, SemError, STDERR_FILE, STDOUT_FILE};
use tracing::{debug, warn};

use crate::{collect_artifacts, prepare_output_dir, tail_line, RunContext, Runner};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs jobs as child processes of this machine.
#[derive(Debug, Clone)]
pub struct LocalRunner {
    concurrency: usize,
    timeout: Option<Duration>,
}

impl LocalRunner {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

enum Waited {
    Exited(ExitStatus),
    TimedOut,
}

impl LocalRunner {
    fn wait(&self, child: &mut Child, ctx: &RunContext<'_>, started: Instant) -> Result<Waited> {
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Waited::Exited(status));
            }
            if ctx.cancel.is_cancelled() {
                kill(child);
                return Err(SemError::Cancelled);
            }
            if let Some(limit) = self.timeout {
                if started.elapsed() >= limit {
                    kill(child);
                    return Ok(Waited::TimedOut);
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

const ETXTBSY: i32 = 26;

/// A freshly written executable can be briefly busy while another thread's
/// fork still holds its write handle.
fn spawn(cmd: &mut Command) -> std::io::Result<Child> {
    let mut tries = 0;
    loop {
        match cmd.spawn() {
            Err(e) if e.raw_os_error() == Some(ETXTBSY) && tries < 5 => {
                tries += 1;
                thread::sleep(POLL_INTERVAL);
            }
            other => return other,
        }
    }
}

/// Targets run in their own process group so that anything they start
/// (a wrapper's simulator, `waf --run`) goes down with them.
#[cfg(unix)]
fn isolate(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill(child: &mut Child) {
    // The group id equals the leader's pid; the leader is not yet reaped, so
    // the id cannot have been reused.
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: killpg only sends a signal; no memory is shared.
        if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
            debug!(pgid, "killpg failed: {}", std::io::Error::last_os_error());
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl Runner for LocalRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Local
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn execute(&self, job: &Job, ctx: &RunContext<'_>) -> Result<RunRecord> {
        let out_dir = ctx.output_dir(job);
        prepare_output_dir(&out_dir)?;
        let stdout = File::create(out_dir.join(STDOUT_FILE))?;
        let stderr = File::create(out_dir.join(STDERR_FILE))?;

        let record = RunRecord::running(job);
        let started = Instant::now();
        let mut cmd = Command::new(&ctx.target.path);
        cmd.args(ctx.arguments(job))
            .current_dir(&out_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        isolate(&mut cmd);
        debug!(run_key = %job.run_key, cmd = ?cmd, "launching");
        let mut child = spawn(&mut cmd).map_err(|e| {
            SemError::Infrastructure(format!(
                "cannot launch {}: {}",
                ctx.target.path.display(),
                e
            ))
        })?;

        let waited = self.wait(&mut child, ctx, started)?;
        let artifacts = collect_artifacts(&out_dir)?;
        let record = match waited {
            Waited::Exited(status) if status.success() => record.complete(0, artifacts),
            Waited::Exited(status) => {
                let reason = describe_exit(&status);
                let detail = tail_line(&out_dir.join(STDERR_FILE))
                    .map(|line| format!("{}: {}", reason, line))
                    .unwrap_or(reason);
                warn!(run_key = %job.run_key, repetition = job.repetition, "{}", detail);
                record.failed(status.code(), detail, artifacts)
            }
            Waited::TimedOut => {
                let limit = self.timeout.unwrap_or_default();
                warn!(run_key = %job.run_key, limit = ?limit, "run timed out");
                record.failed(None, format!("timed out after {:?}", limit), artifacts)
            }
        };
        Ok(record)
    }
}

#[cfg(unix)]
fn describe_exit(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit status {}", code),
        (None, Some(sig)) => format!("terminated by signal {}", sig),
        (None, None) => "terminated abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {}", code),
        None => "terminated abnormally".to_string(),
    }
}
