//! Campaign orchestration: diff the desired runs against the store, dispatch
//! what is missing, and persist each result as soon as it arrives.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use sem_core::{
    Campaign, CampaignSpec, CancellationToken, Job, ParamFilter, ParameterCombination, Result,
    RunRecord, RunState, RunnerKind, SemError, TargetSpec,
};
use sem_store::{CompleteResult, ResultStore, RunIndex, StateCounts};
use tracing::{debug, error, info, warn};

use crate::config::{FailedRunPolicy, ManagerConfig};
use crate::grid::GridRunner;
use crate::local::LocalRunner;
use crate::{RunContext, Runner};

/// How often the dispatcher wakes to check the caller's cancellation signal.
const CANCEL_CHECK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    FailureBudget { failed: usize, limit: usize },
    Infrastructure { message: String },
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::FailureBudget { failed, limit } => {
                write!(f, "failure budget exhausted ({} of {} allowed)", failed, limit)
            }
            HaltReason::Infrastructure { message } => {
                write!(f, "infrastructure failure: {}", message)
            }
        }
    }
}

/// Snapshot handed to the progress callback after every settled job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub abandoned: usize,
    pub aborted: usize,
}

/// Outcome of one `run_missing` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Jobs in the missing set after diffing.
    pub planned: usize,
    pub dispatched: usize,
    pub completed: usize,
    /// Runs that executed and ended FAILED.
    pub failed: usize,
    /// In-flight jobs dropped on cancellation; their pairs are absent again.
    pub abandoned: usize,
    /// Jobs lost to infrastructure failures; not counted against the budget.
    pub aborted: usize,
    /// FAILED pairs left alone under the `skip` policy.
    pub skipped_failed: usize,
    /// Stale markers discarded before planning.
    pub reaped: usize,
    pub halt: Option<HaltReason>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn not_dispatched(&self) -> usize {
        self.planned - self.dispatched
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "planned {} dispatched {}: {} complete, {} failed, {} aborted, {} abandoned",
            self.planned, self.dispatched, self.completed, self.failed, self.aborted, self.abandoned
        )?;
        if self.skipped_failed > 0 {
            write!(f, ", {} failed pairs skipped", self.skipped_failed)?;
        }
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        if let Some(halt) = &self.halt {
            write!(f, " (halted: {})", halt)?;
        }
        Ok(())
    }
}

struct Plan {
    jobs: Vec<Job>,
    skipped_failed: usize,
}

pub struct CampaignManager {
    store: ResultStore,
    campaign: Campaign,
    config: ManagerConfig,
    runner: Box<dyn Runner>,
}

impl fmt::Debug for CampaignManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CampaignManager")
            .field("results_dir", &self.store.root())
            .field("campaign_id", &self.campaign.campaign_id)
            .field("runner", &self.runner.kind())
            .finish()
    }
}

impl CampaignManager {
    /// Creates a campaign in `results_dir`, or reopens the one already there
    /// when it was declared identically for the same executable.
    pub fn new(
        results_dir: impl Into<PathBuf>,
        spec: &CampaignSpec,
        overwrite: bool,
        config: ManagerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let store = ResultStore::open(results_dir);
        let campaign = match store.create_campaign(spec, overwrite) {
            Ok(campaign) => {
                info!(
                    campaign_id = %campaign.campaign_id,
                    results_dir = %store.root().display(),
                    "created campaign"
                );
                campaign
            }
            Err(SemError::AlreadyExists(_)) if store.has_campaign() => {
                let current = TargetSpec::from_executable(&spec.executable)?;
                let existing = store.load_campaign(&current)?;
                ensure_same_declaration(&existing, spec)?;
                info!(campaign_id = %existing.campaign_id, "reopened existing campaign");
                existing
            }
            Err(e) => return Err(e),
        };
        let runner = default_runner(&campaign, &config);
        Ok(Self {
            store,
            campaign,
            config,
            runner,
        })
    }

    /// Opens an existing campaign, checking the executable it was created for.
    pub fn load(results_dir: impl Into<PathBuf>, config: ManagerConfig) -> Result<Self> {
        let store = ResultStore::open(results_dir);
        let stored = store.read_campaign()?;
        let executable = stored.target.path.clone();
        Self::open(store, &executable, config)
    }

    /// Opens an existing campaign against an executable at a new location,
    /// e.g. after the build tree moved. The fingerprint must still match.
    pub fn load_with_executable(
        results_dir: impl Into<PathBuf>,
        executable: &Path,
        config: ManagerConfig,
    ) -> Result<Self> {
        Self::open(ResultStore::open(results_dir), executable, config)
    }

    fn open(store: ResultStore, executable: &Path, config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let current = TargetSpec::from_executable(executable).map_err(|e| match e {
            SemError::Validation(msg) => SemError::Incompatible(msg),
            other => other,
        })?;
        let mut campaign = store.load_campaign(&current)?;
        campaign.target.path = current.path;
        let runner = default_runner(&campaign, &config);
        debug!(campaign_id = %campaign.campaign_id, "loaded campaign");
        Ok(Self {
            store,
            campaign,
            config,
            runner,
        })
    }

    /// Replaces the runner chosen from the campaign declaration.
    pub fn with_runner(mut self, runner: Box<dyn Runner>) -> Result<Self> {
        if runner.kind() != self.campaign.runner {
            return Err(SemError::validation(format!(
                "campaign uses the {} runner, got {}",
                self.campaign.runner.as_str(),
                runner.kind().as_str()
            )));
        }
        self.runner = runner;
        Ok(self)
    }

    pub fn campaign(&self) -> &Campaign {
        &self.campaign
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn param_names(&self) -> Vec<String> {
        self.campaign.param_names().cloned().collect()
    }

    /// The jobs `run_missing` would dispatch, without dispatching them.
    pub fn missing_runs(&self, filter: &ParamFilter, repetitions: u32) -> Result<Vec<Job>> {
        Ok(self.plan(filter, repetitions)?.jobs)
    }

    /// Runs every missing (combination, repetition) pair and waits for them.
    pub fn run_missing(&self, filter: &ParamFilter, repetitions: u32) -> Result<RunSummary> {
        self.run_missing_with(filter, repetitions, &CancellationToken::new(), &mut |_| {})
    }

    /// Like [`CampaignManager::run_missing`], with a cancellation signal and a
    /// progress callback invoked on the calling thread.
    ///
    /// Cancelling stops dispatch and kills in-flight jobs; whatever finished
    /// before that is kept, and abandoned pairs are left absent.
    pub fn run_missing_with(
        &self,
        filter: &ParamFilter,
        repetitions: u32,
        cancel: &CancellationToken,
        on_progress: &mut dyn FnMut(&Progress),
    ) -> Result<RunSummary> {
        let _lease = self.store.acquire_owner_lease()?;
        let current = TargetSpec::from_executable(&self.campaign.target.path)?;
        self.campaign.check_compatible(&current)?;

        let reaped = self.store.reap_unresolved()?;
        let plan = self.plan(filter, repetitions)?;
        let mut summary = RunSummary {
            planned: plan.jobs.len(),
            skipped_failed: plan.skipped_failed,
            reaped,
            ..RunSummary::default()
        };
        info!(
            planned = summary.planned,
            skipped_failed = summary.skipped_failed,
            reaped,
            runner = self.runner.kind().as_str(),
            "planned missing runs"
        );
        if plan.jobs.is_empty() {
            return Ok(summary);
        }

        let internal = CancellationToken::new();
        let ctx = RunContext {
            results_dir: self.store.root(),
            target: &self.campaign.target,
            repetition_argument: &self.campaign.repetition_argument,
            cancel: &internal,
        };
        let width = self.runner.concurrency().max(1);
        let runner: &dyn Runner = self.runner.as_ref();
        let mut progress = Progress {
            total: summary.planned,
            ..Progress::default()
        };
        let mut fatal: Option<SemError> = None;
        let mut pending = plan.jobs.into_iter();
        let (tx, rx) = mpsc::channel::<(RunRecord, Result<RunRecord>)>();

        thread::scope(|scope| loop {
            while !summary.cancelled
                && summary.halt.is_none()
                && fatal.is_none()
                && progress.in_flight < width
            {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(job) = pending.next() else { break };
                let marker = RunRecord::running(&job);
                if let Err(e) = self.store.append_run(&marker) {
                    error!(run_key = %job.run_key, "cannot record dispatch: {}", e);
                    internal.cancel();
                    fatal = Some(e);
                    break;
                }
                info!(
                    run_key = %job.run_key,
                    repetition = job.repetition,
                    attempt = job.attempt,
                    "dispatched"
                );
                let tx = tx.clone();
                scope.spawn(move || {
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| runner.execute(&job, &ctx)))
                        .unwrap_or_else(|_| {
                            Err(SemError::Infrastructure(format!(
                                "runner panicked executing {}",
                                job.run_key
                            )))
                        });
                    let _ = tx.send((marker, outcome));
                });
                progress.in_flight += 1;
                summary.dispatched += 1;
            }
            if cancel.is_cancelled() && !summary.cancelled {
                info!(in_flight = progress.in_flight, "cancellation requested");
                summary.cancelled = true;
                internal.cancel();
            }
            if progress.in_flight == 0 {
                break;
            }
            match rx.recv_timeout(CANCEL_CHECK) {
                Ok((marker, outcome)) => {
                    progress.in_flight -= 1;
                    if let Err(e) = self.settle(&marker, outcome, &mut summary) {
                        error!(run_key = %marker.run_key, "cannot record result: {}", e);
                        if fatal.is_none() {
                            internal.cancel();
                            fatal = Some(e);
                        }
                    }
                    progress.completed = summary.completed;
                    progress.failed = summary.failed;
                    progress.abandoned = summary.abandoned;
                    progress.aborted = summary.aborted;
                    on_progress(&progress);
                }
                Err(RecvTimeoutError::Timeout) => {}
                // every worker holds a sender until it reports
                Err(RecvTimeoutError::Disconnected) => break,
            }
        });

        if let Some(e) = fatal {
            return Err(e);
        }
        info!(summary = %summary, "run_missing finished");
        Ok(summary)
    }

    /// Persists one job's outcome. Only store failures are returned.
    fn settle(
        &self,
        marker: &RunRecord,
        outcome: Result<RunRecord>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        match outcome {
            Ok(record) if record.state.is_terminal() => {
                self.store.update_run(&record)?;
                match record.state {
                    RunState::Complete => {
                        summary.completed += 1;
                        info!(
                            run_key = %record.run_key,
                            elapsed_secs = record.elapsed_secs().unwrap_or_default(),
                            "run complete"
                        );
                    }
                    _ => {
                        summary.failed += 1;
                        warn!(
                            run_key = %record.run_key,
                            repetition = record.repetition,
                            attempt = record.attempt,
                            failure = record.failure.as_deref().unwrap_or(""),
                            "run failed"
                        );
                        if let Some(limit) = self.config.max_failures {
                            if summary.failed >= limit && summary.halt.is_none() {
                                warn!(failed = summary.failed, limit, "failure budget exhausted");
                                summary.halt = Some(HaltReason::FailureBudget {
                                    failed: summary.failed,
                                    limit,
                                });
                            }
                        }
                    }
                }
                Ok(())
            }
            Ok(record) => {
                self.store.discard_run(marker)?;
                summary.aborted += 1;
                self.note_infrastructure(
                    format!("runner returned unresolved state {}", record.state),
                    summary,
                );
                Ok(())
            }
            Err(SemError::Cancelled) => {
                self.store.discard_run(marker)?;
                summary.abandoned += 1;
                debug!(run_key = %marker.run_key, "abandoned in-flight run");
                Ok(())
            }
            Err(e @ SemError::StoreCorruption { .. }) | Err(e @ SemError::AlreadyExists(_)) => {
                Err(e)
            }
            Err(e) => {
                self.store.discard_run(marker)?;
                summary.aborted += 1;
                warn!(run_key = %marker.run_key, "{}", e);
                let message = match e {
                    SemError::Infrastructure(message) => message,
                    other => other.to_string(),
                };
                self.note_infrastructure(message, summary);
                Ok(())
            }
        }
    }

    fn note_infrastructure(&self, message: String, summary: &mut RunSummary) {
        if self.config.abort_on_infrastructure_failure && summary.halt.is_none() {
            summary.halt = Some(HaltReason::Infrastructure { message });
        }
    }

    fn plan(&self, filter: &ParamFilter, repetitions: u32) -> Result<Plan> {
        let space = self.campaign.resolve_space(filter)?;
        let index = self.store.index()?;
        let mut jobs = Vec::new();
        let mut skipped_failed = 0;
        for combination in &space {
            for repetition in 0..repetitions {
                if index.is_complete(&combination, repetition) {
                    continue;
                }
                if index.has_failed(&combination, repetition)
                    && self.config.failed_runs == FailedRunPolicy::Skip
                {
                    skipped_failed += 1;
                    continue;
                }
                let attempt = next_terminal_attempt(&index, &combination, repetition);
                jobs.push(Job::new(combination.clone(), repetition, attempt));
            }
        }
        Ok(Plan {
            jobs,
            skipped_failed,
        })
    }

    /// COMPLETE runs matching `filter`; omitted parameters are wildcards.
    pub fn query(&self, filter: &ParamFilter) -> Result<Vec<RunRecord>> {
        self.campaign.validate_filter(filter)?;
        self.store.query(filter)
    }

    pub fn get_complete_results(&self, filter: &ParamFilter) -> Result<Vec<CompleteResult>> {
        self.campaign.validate_filter(filter)?;
        self.store.complete_results(filter)
    }

    /// Forgets FAILED attempts matching `filter` so they are dispatched again.
    pub fn clear_failed(&self, filter: &ParamFilter) -> Result<usize> {
        self.campaign.validate_filter(filter)?;
        let _lease = self.store.acquire_owner_lease()?;
        self.store.clear_failed(filter)
    }

    pub fn state_counts(&self) -> Result<StateCounts> {
        self.store.state_counts()
    }

    /// Campaign metadata followed by run counts per state.
    pub fn describe(&self) -> Result<String> {
        let counts = self.store.state_counts()?;
        Ok(format!(
            "{}runs: {} complete, {} failed, {} running, {} pending\n",
            self.campaign, counts.complete, counts.failed, counts.running, counts.pending
        ))
    }
}

/// Unresolved attempts are treated as absent, so numbering continues from
/// the last terminal attempt.
fn next_terminal_attempt(
    index: &RunIndex,
    combination: &ParameterCombination,
    repetition: u32,
) -> u32 {
    index
        .attempts(combination, repetition)
        .iter()
        .filter(|r| r.state.is_terminal())
        .map(|r| r.attempt + 1)
        .max()
        .unwrap_or(0)
}

fn ensure_same_declaration(existing: &Campaign, spec: &CampaignSpec) -> Result<()> {
    if existing.params != spec.params {
        return Err(SemError::Incompatible(format!(
            "stored campaign declares parameters [{}], requested [{}]",
            existing.params.keys().cloned().collect::<Vec<_>>().join(", "),
            spec.params.keys().cloned().collect::<Vec<_>>().join(", ")
        )));
    }
    if existing.repetition_argument != spec.repetition_argument {
        return Err(SemError::Incompatible(format!(
            "stored campaign passes repetitions as --{}, requested --{}",
            existing.repetition_argument, spec.repetition_argument
        )));
    }
    if existing.runner != spec.runner || existing.build_mode != spec.build_mode {
        return Err(SemError::Incompatible(format!(
            "stored campaign uses the {} runner with {:?} build",
            existing.runner.as_str(),
            existing.build_mode
        )));
    }
    Ok(())
}

fn default_runner(campaign: &Campaign, config: &ManagerConfig) -> Box<dyn Runner> {
    match campaign.runner {
        RunnerKind::Local => Box::new(
            LocalRunner::new(config.effective_concurrency()).with_timeout(config.job_timeout()),
        ),
        RunnerKind::Grid => Box::new(GridRunner::with_command_backend(&config.grid)),
    }
}
