//! Durable, queryable record of a campaign and its runs.
//!
//! Layout of a results directory:
//!
//! ```text
//! campaign.json                      campaign metadata
//! .write.lock / .owner.lock          advisory lock files
//! runs/<run_key>/attempt-<n>.json    one document per run attempt
//! data/<run_key>/attempt-<n>/        stdout, stderr and output artifacts
//! ```
//!
//! Every document is replaced atomically, so reading the directory back is
//! enough to reconstruct the store.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use sem_core::{
    atomic_write_json_pretty, ensure_dir, Campaign, CampaignSpec, ParamFilter,
    ParameterCombination, Result, RunRecord, RunState, SemError, TargetSpec, CAMPAIGN_SCHEMA,
    RUN_RECORD_SCHEMA, TEMP_PREFIX,
};
use tracing::{debug, info, warn};

mod index;
mod lock;

pub use index::RunIndex;
pub use lock::OwnerLease;
use lock::WriteGuard;

pub const CAMPAIGN_FILE: &str = "campaign.json";
pub const RUNS_DIR: &str = "runs";
pub const DATA_DIR: &str = "data";
const WRITE_LOCK_FILE: &str = ".write.lock";
const OWNER_LOCK_FILE: &str = ".owner.lock";
const DISCARDED_PREFIX: &str = ".discarded-";

/// A COMPLETE run together with its captured output.
#[derive(Debug, Clone, Serialize)]
pub struct CompleteResult {
    pub record: RunRecord,
    pub stdout: String,
    pub stderr: String,
    pub artifacts: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: usize,
    pub running: usize,
    pub complete: usize,
    pub failed: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.complete + self.failed
    }
}

#[derive(Debug)]
pub struct ResultStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl ResultStore {
    /// Binds to a results directory. Nothing is read or created yet.
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has_campaign(&self) -> bool {
        self.campaign_path().is_file()
    }

    fn campaign_path(&self) -> PathBuf {
        self.root.join(CAMPAIGN_FILE)
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join(RUNS_DIR)
    }

    fn record_path(&self, run_key: &str, attempt: u32) -> PathBuf {
        self.runs_dir()
            .join(run_key)
            .join(format!("attempt-{}.json", attempt))
    }

    /// Absolute path of a record's output directory.
    pub fn output_dir(&self, record: &RunRecord) -> PathBuf {
        self.root.join(&record.output_dir)
    }

    fn write_guard(&self) -> Result<WriteGuard<'_>> {
        ensure_dir(&self.root)?;
        let local = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        WriteGuard::acquire(local, &self.root.join(WRITE_LOCK_FILE))
    }

    pub fn acquire_owner_lease(&self) -> Result<OwnerLease> {
        ensure_dir(&self.root)?;
        OwnerLease::acquire(&self.root.join(OWNER_LOCK_FILE), &self.root)
    }

    /// Creates the campaign document. With `overwrite`, all prior campaign
    /// state in the directory is discarded first, which requires the owner
    /// lease: a campaign another manager is running is `CampaignBusy`.
    pub fn create_campaign(&self, spec: &CampaignSpec, overwrite: bool) -> Result<Campaign> {
        let campaign = Campaign::from_spec(spec)?;
        let _lease = if overwrite {
            Some(self.acquire_owner_lease()?)
        } else {
            None
        };
        let _guard = self.write_guard()?;
        self.remove_discarded()?;
        let has_state = self.has_campaign() || self.runs_dir().exists();
        if has_state {
            if !overwrite {
                if !self.has_campaign() {
                    return Err(SemError::corruption(
                        self.runs_dir(),
                        "run records present without a campaign document",
                    ));
                }
                return Err(SemError::AlreadyExists(self.root.clone()));
            }
            let trash = self.root.join(format!(
                "{}{}",
                DISCARDED_PREFIX,
                Utc::now().timestamp_micros()
            ));
            ensure_dir(&trash)?;
            for name in [CAMPAIGN_FILE, RUNS_DIR, DATA_DIR] {
                let src = self.root.join(name);
                if src.exists() {
                    fs::rename(&src, trash.join(name))?;
                }
            }
            info!(dir = %self.root.display(), "discarding previous campaign");
            atomic_write_json_pretty(&self.campaign_path(), &campaign)?;
            fs::remove_dir_all(&trash)?;
        } else {
            atomic_write_json_pretty(&self.campaign_path(), &campaign)?;
        }
        info!(
            campaign_id = %campaign.campaign_id,
            dir = %self.root.display(),
            "created campaign"
        );
        Ok(campaign)
    }

    /// Reads the campaign document without checking the executable.
    pub fn read_campaign(&self) -> Result<Campaign> {
        let path = self.campaign_path();
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SemError::NotFound(self.root.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let campaign: Campaign = serde_json::from_slice(&bytes)
            .map_err(|e| SemError::corruption(&path, e.to_string()))?;
        if campaign.schema_version != CAMPAIGN_SCHEMA {
            return Err(SemError::corruption(
                &path,
                format!("unsupported schema_version '{}'", campaign.schema_version),
            ));
        }
        Ok(campaign)
    }

    /// Reads the campaign and checks it was created for `current`.
    pub fn load_campaign(&self, current: &TargetSpec) -> Result<Campaign> {
        let campaign = self.read_campaign()?;
        campaign.check_compatible(current)?;
        Ok(campaign)
    }

    pub fn param_names(&self) -> Result<BTreeSet<String>> {
        Ok(self.read_campaign()?.params.into_keys().collect())
    }

    /// Writes a new attempt document. Refuses to start a second unresolved
    /// attempt for the same (combination, repetition).
    pub fn append_run(&self, record: &RunRecord) -> Result<()> {
        let path = self.record_path(&record.run_key, record.attempt);
        let _guard = self.write_guard()?;
        if path.exists() {
            return Err(SemError::AlreadyExists(path));
        }
        if !record.state.is_terminal() {
            let unresolved = self
                .read_key_dir(&record.run_key)?
                .into_iter()
                .find(|r| !r.state.is_terminal());
            if let Some(other) = unresolved {
                return Err(SemError::validation(format!(
                    "run {} repetition {} already has unresolved attempt {}",
                    record.run_key, record.repetition, other.attempt
                )));
            }
        }
        atomic_write_json_pretty(&path, record)?;
        debug!(
            run_key = %record.run_key,
            attempt = record.attempt,
            state = %record.state,
            "appended run record"
        );
        Ok(())
    }

    /// Replaces an existing attempt document, typically RUNNING -> terminal.
    pub fn update_run(&self, record: &RunRecord) -> Result<()> {
        let path = self.record_path(&record.run_key, record.attempt);
        let _guard = self.write_guard()?;
        if !path.is_file() {
            return Err(SemError::corruption(&path, "no record to update"));
        }
        atomic_write_json_pretty(&path, record)?;
        debug!(
            run_key = %record.run_key,
            attempt = record.attempt,
            state = %record.state,
            "updated run record"
        );
        Ok(())
    }

    /// Removes an attempt and its output directory, leaving the pair absent.
    pub fn discard_run(&self, record: &RunRecord) -> Result<()> {
        let _guard = self.write_guard()?;
        self.discard_unlocked(record)
    }

    fn discard_unlocked(&self, record: &RunRecord) -> Result<()> {
        // Outputs go first so an interrupted discard still leaves the record.
        let out = self.output_dir(record);
        if out.exists() {
            fs::remove_dir_all(&out)?;
        }
        let path = self.record_path(&record.run_key, record.attempt);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // key directories go only once empty
        for dir in [path.parent(), out.parent()].into_iter().flatten() {
            let _ = fs::remove_dir(dir);
        }
        Ok(())
    }

    /// Discards PENDING/RUNNING attempts left behind by an earlier manager.
    pub fn reap_unresolved(&self) -> Result<usize> {
        let _guard = self.write_guard()?;
        let mut reaped = 0;
        for record in self.read_all_records()? {
            if !record.state.is_terminal() {
                warn!(
                    run_key = %record.run_key,
                    attempt = record.attempt,
                    "discarding unresolved run left by a previous session"
                );
                self.discard_unlocked(&record)?;
                reaped += 1;
            }
        }
        self.remove_orphan_outputs()?;
        Ok(reaped)
    }

    /// Output directories whose record is gone would block the next attempt
    /// with the same number.
    fn remove_orphan_outputs(&self) -> Result<()> {
        let data = self.root.join(DATA_DIR);
        let keys = match fs::read_dir(&data) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for key in keys {
            let key = key?;
            if !key.file_type()?.is_dir() {
                continue;
            }
            let run_key = key.file_name().to_string_lossy().into_owned();
            for entry in fs::read_dir(key.path())? {
                let entry = entry?;
                let name = entry.file_name();
                let attempt = name
                    .to_str()
                    .and_then(|n| n.strip_prefix("attempt-"))
                    .and_then(|n| n.parse::<u32>().ok());
                let Some(attempt) = attempt else { continue };
                if !self.record_path(&run_key, attempt).exists() {
                    warn!(run_key = %run_key, attempt, "removing outputs with no run record");
                    fs::remove_dir_all(entry.path())?;
                }
            }
            let _ = fs::remove_dir(key.path());
        }
        Ok(())
    }

    /// Removes FAILED attempts matching `filter` so they become missing again.
    pub fn clear_failed(&self, filter: &ParamFilter) -> Result<usize> {
        let _guard = self.write_guard()?;
        let mut cleared = 0;
        for record in self.read_all_records()? {
            if record.state == RunState::Failed && filter.matches(&record.params) {
                self.discard_unlocked(&record)?;
                cleared += 1;
            }
        }
        info!(cleared, "cleared failed runs");
        Ok(cleared)
    }

    /// Every attempt in the store, in (params, repetition, attempt) order.
    pub fn runs(&self) -> Result<Vec<RunRecord>> {
        let mut records = self.read_all_records()?;
        records.sort_by(|a, b| {
            (&a.params, a.repetition, a.attempt).cmp(&(&b.params, b.repetition, b.attempt))
        });
        Ok(records)
    }

    pub fn index(&self) -> Result<RunIndex> {
        Ok(RunIndex::from_records(self.read_all_records()?))
    }

    /// (combination, repetition) pairs with at least one COMPLETE attempt.
    pub fn recorded_combinations(&self) -> Result<HashSet<(ParameterCombination, u32)>> {
        Ok(self.index()?.completed_pairs())
    }

    /// COMPLETE records whose parameters satisfy every constraint in `filter`.
    pub fn query(&self, filter: &ParamFilter) -> Result<Vec<RunRecord>> {
        Ok(self
            .runs()?
            .into_iter()
            .filter(|r| r.state == RunState::Complete && filter.matches(&r.params))
            .collect())
    }

    /// Like [`ResultStore::query`], with captured output loaded.
    pub fn complete_results(&self, filter: &ParamFilter) -> Result<Vec<CompleteResult>> {
        let mut out = Vec::new();
        for record in self.query(filter)? {
            let dir = self.output_dir(&record);
            let stdout = read_text_or_empty(&self.root.join(record.stdout_path()))?;
            let stderr = read_text_or_empty(&self.root.join(record.stderr_path()))?;
            let artifacts = record
                .artifacts
                .iter()
                .map(|name| (name.clone(), dir.join(name)))
                .collect();
            out.push(CompleteResult {
                record,
                stdout,
                stderr,
                artifacts,
            });
        }
        Ok(out)
    }

    pub fn state_counts(&self) -> Result<StateCounts> {
        let mut counts = StateCounts::default();
        for record in self.read_all_records()? {
            match record.state {
                RunState::Pending => counts.pending += 1,
                RunState::Running => counts.running += 1,
                RunState::Complete => counts.complete += 1,
                RunState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    fn read_all_records(&self) -> Result<Vec<RunRecord>> {
        let runs_dir = self.runs_dir();
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in walkdir::WalkDir::new(&runs_dir).min_depth(2).max_depth(2) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(io::Error::from(e).into()),
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(record) = self.read_record_file(entry.path())? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn read_key_dir(&self, run_key: &str) -> Result<Vec<RunRecord>> {
        let dir = self.runs_dir().join(run_key);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(record) = self.read_record_file(&entry.path())? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn read_record_file(&self, path: &Path) -> Result<Option<RunRecord>> {
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
        if name.starts_with(TEMP_PREFIX) || !name.ends_with(".json") {
            return Ok(None);
        }
        let bytes = match fs::read(path) {
            Ok(b) => b,
            // discarded between listing and reading
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: RunRecord = serde_json::from_slice(&bytes)
            .map_err(|e| SemError::corruption(path, e.to_string()))?;
        if record.schema_version != RUN_RECORD_SCHEMA {
            return Err(SemError::corruption(
                path,
                format!("unsupported schema_version '{}'", record.schema_version),
            ));
        }
        let expected = self.record_path(&record.run_key, record.attempt);
        if expected.file_name() != path.file_name()
            || record.run_key != record.params.run_key(record.repetition)
            || path.parent().and_then(|p| p.file_name()) != Some(OsStr::new(&record.run_key))
        {
            return Err(SemError::corruption(
                path,
                "record identity does not match its location",
            ));
        }
        Ok(Some(record))
    }

    fn remove_discarded(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry
                .file_name()
                .to_str()
                .map(|n| n.starts_with(DISCARDED_PREFIX))
                .unwrap_or(false)
            {
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }
}

fn is_not_found(err: &walkdir::Error) -> bool {
    err.io_error()
        .map(|e| e.kind() == io::ErrorKind::NotFound)
        .unwrap_or(false)
}

fn read_text_or_empty(path: &Path) -> Result<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sem_core::{Job, ParamValue};
    use std::sync::Arc;
    use std::thread;

    struct Fixture {
        _dir: tempfile::TempDir,
        exe: PathBuf,
        store: ResultStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = dir.path().join("sim");
        fs::write(&exe, b"#!/bin/sh\necho hi\n").expect("write exe");
        let store = ResultStore::open(dir.path().join("results"));
        Fixture {
            _dir: dir,
            exe,
            store,
        }
    }

    fn spec(exe: &Path) -> CampaignSpec {
        CampaignSpec::new(exe).param("a", None).param("b", None)
    }

    fn complete(store: &ResultStore, combo: ParameterCombination, rep: u32) -> RunRecord {
        let record = RunRecord::running(&Job::new(combo, rep, 0));
        store.append_run(&record).expect("append");
        let done = record.complete(0, vec![]);
        store.update_run(&done).expect("update");
        done
    }

    #[test]
    fn create_then_load_round_trip() {
        let f = fixture();
        let created = f.store.create_campaign(&spec(&f.exe), false).expect("create");
        let target = TargetSpec::from_executable(&f.exe).expect("target");
        let loaded = f.store.load_campaign(&target).expect("load");
        assert_eq!(created, loaded);
        let names: Vec<String> = f.store.param_names().expect("names").into_iter().collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn create_twice_without_overwrite_fails() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        let err = f
            .store
            .create_campaign(&spec(&f.exe), false)
            .expect_err("second create");
        assert!(matches!(err, SemError::AlreadyExists(_)));
    }

    #[test]
    fn overwrite_discards_previous_runs() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        complete(&f.store, ParameterCombination::new().with("a", 1).with("b", "x"), 0);
        assert_eq!(f.store.runs().expect("runs").len(), 1);
        f.store.create_campaign(&spec(&f.exe), true).expect("overwrite");
        assert!(f.store.runs().expect("runs").is_empty());
        let leftovers: Vec<_> = fs::read_dir(f.store.root())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(DISCARDED_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn overwrite_needs_the_owner_lease() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        complete(&f.store, ParameterCombination::new().with("a", 1).with("b", "x"), 0);
        let lease = f.store.acquire_owner_lease().expect("lease");
        let other = ResultStore::open(f.store.root());
        let err = other
            .create_campaign(&spec(&f.exe), true)
            .expect_err("campaign in use");
        assert!(matches!(err, SemError::CampaignBusy(_)));
        assert_eq!(f.store.runs().expect("runs").len(), 1);
        drop(lease);
        other.create_campaign(&spec(&f.exe), true).expect("overwrite");
        assert!(f.store.runs().expect("runs").is_empty());
    }

    #[test]
    fn load_missing_campaign_is_not_found() {
        let f = fixture();
        let target = TargetSpec::from_executable(&f.exe).expect("target");
        let err = f.store.load_campaign(&target).expect_err("missing");
        assert!(matches!(err, SemError::NotFound(_)));
    }

    #[test]
    fn load_with_changed_executable_is_incompatible() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        fs::write(&f.exe, b"#!/bin/sh\necho rebuilt\n").expect("rebuild");
        let target = TargetSpec::from_executable(&f.exe).expect("target");
        let err = f.store.load_campaign(&target).expect_err("incompatible");
        assert!(matches!(err, SemError::Incompatible(_)));
    }

    #[test]
    fn mixed_type_params_survive_round_trip() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        let combo = ParameterCombination::new()
            .with("a", 1)
            .with("b", 1.0)
            .with("c", "1")
            .with("d", true);
        complete(&f.store, combo.clone(), 0);
        let reopened = ResultStore::open(f.store.root());
        let back = reopened.runs().expect("runs");
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].params, combo);
        assert!(matches!(back[0].params.get("a"), Some(ParamValue::Int(1))));
        assert!(matches!(back[0].params.get("b"), Some(ParamValue::Float(_))));
        assert!(matches!(back[0].params.get("c"), Some(ParamValue::Str(_))));
        assert!(matches!(back[0].params.get("d"), Some(ParamValue::Bool(true))));
        let hits = reopened.query(&ParamFilter::new().with("b", 1.0)).expect("query");
        assert_eq!(hits.len(), 1);
        let misses = reopened.query(&ParamFilter::new().with("b", 1)).expect("query");
        assert!(misses.is_empty());
    }

    #[test]
    fn query_filters_by_partial_constraints() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        for a in [1, 2] {
            for b in ["x", "y"] {
                complete(&f.store, ParameterCombination::new().with("a", a).with("b", b), 0);
            }
        }
        let hits = f.store.query(&ParamFilter::new().with("a", 1)).expect("query");
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|r| r.params.get("a") == Some(&ParamValue::Int(1))));
        assert_eq!(f.store.query(&ParamFilter::new()).expect("all").len(), 4);
        let both = f
            .store
            .query(&ParamFilter::new().with_any("a", [1, 2]).with("b", "y"))
            .expect("query");
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn query_excludes_failed_and_running() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        let combo = ParameterCombination::new().with("a", 1).with("b", "x");
        let running = RunRecord::running(&Job::new(combo.clone(), 0, 0));
        f.store.append_run(&running).expect("append");
        let failed = RunRecord::running(&Job::new(combo.clone(), 1, 0)).failed(Some(3), "exit 3", vec![]);
        f.store.append_run(&failed).expect("append failed");
        assert!(f.store.query(&ParamFilter::new()).expect("query").is_empty());
        let counts = f.store.state_counts().expect("counts");
        assert_eq!(counts.running, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn second_unresolved_attempt_is_refused() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        let combo = ParameterCombination::new().with("a", 1).with("b", "x");
        f.store
            .append_run(&RunRecord::running(&Job::new(combo.clone(), 0, 0)))
            .expect("first");
        let err = f
            .store
            .append_run(&RunRecord::running(&Job::new(combo, 0, 1)))
            .expect_err("double dispatch");
        assert!(matches!(err, SemError::Validation(_)));
    }

    #[test]
    fn concurrent_appends_do_not_corrupt() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        let store = Arc::new(ResultStore::open(f.store.root()));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let combo = ParameterCombination::new().with("a", i as i64).with("b", "x");
                    let record = RunRecord::running(&Job::new(combo, 0, 0)).complete(0, vec![]);
                    store.append_run(&record).expect("append");
                })
            })
            .collect();
        for h in handles {
            h.join().expect("join");
        }
        let records = store.runs().expect("runs");
        assert_eq!(records.len(), 16);
        assert_eq!(store.recorded_combinations().expect("recorded").len(), 16);
    }

    #[test]
    fn corrupt_record_is_reported() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        let combo = ParameterCombination::new().with("a", 1).with("b", "x");
        let done = complete(&f.store, combo, 0);
        let path = f.store.record_path(&done.run_key, done.attempt);
        fs::write(&path, b"{\"schema_version\": \"run_rec").expect("truncate");
        let err = f.store.runs().expect_err("corrupt");
        assert!(matches!(err, SemError::StoreCorruption { .. }));
    }

    #[test]
    fn temp_files_are_ignored() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        let done = complete(&f.store, ParameterCombination::new().with("a", 1).with("b", "x"), 0);
        let dir = f.store.runs_dir().join(&done.run_key);
        fs::write(dir.join(format!("{}attempt-1.json.9.9", TEMP_PREFIX)), b"{").expect("tmp");
        assert_eq!(f.store.runs().expect("runs").len(), 1);
    }

    #[test]
    fn reap_and_clear_failed() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        let c1 = ParameterCombination::new().with("a", 1).with("b", "x");
        let c2 = ParameterCombination::new().with("a", 2).with("b", "x");
        f.store
            .append_run(&RunRecord::running(&Job::new(c1.clone(), 0, 0)))
            .expect("running");
        f.store
            .append_run(&RunRecord::running(&Job::new(c2.clone(), 0, 0)).failed(Some(1), "x", vec![]))
            .expect("failed");
        assert_eq!(f.store.reap_unresolved().expect("reap"), 1);
        assert_eq!(f.store.runs().expect("runs").len(), 1);
        assert_eq!(
            f.store
                .clear_failed(&ParamFilter::new().with("a", 1))
                .expect("clear none"),
            0
        );
        assert_eq!(f.store.clear_failed(&ParamFilter::new()).expect("clear"), 1);
        assert!(f.store.runs().expect("runs").is_empty());
    }

    #[test]
    fn reap_removes_outputs_left_without_a_record() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        let done = complete(&f.store, ParameterCombination::new().with("a", 1).with("b", "x"), 0);
        let kept = f.store.output_dir(&done);
        fs::create_dir_all(&kept).expect("kept dir");
        let orphan = RunRecord::running(&Job::new(
            ParameterCombination::new().with("a", 2).with("b", "x"),
            0,
            0,
        ));
        let orphan_dir = f.store.output_dir(&orphan);
        fs::create_dir_all(&orphan_dir).expect("orphan dir");
        fs::write(orphan_dir.join("stdout"), b"partial").expect("stdout");

        assert_eq!(f.store.reap_unresolved().expect("reap"), 0);
        assert!(kept.is_dir());
        assert!(!orphan_dir.exists());
        assert!(!f.store.root().join(DATA_DIR).join(&orphan.run_key).exists());
        f.store.append_run(&orphan).expect("attempt number is free again");
    }

    #[test]
    fn complete_results_include_output() {
        let f = fixture();
        f.store.create_campaign(&spec(&f.exe), false).expect("create");
        let combo = ParameterCombination::new().with("a", 1).with("b", "x");
        let done = complete(&f.store, combo, 0);
        let out = f.store.output_dir(&done);
        fs::create_dir_all(&out).expect("out dir");
        fs::write(out.join("stdout"), b"throughput 12.5\n").expect("stdout");
        let results = f.store.complete_results(&ParamFilter::new()).expect("results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].stdout, "throughput 12.5\n");
        assert_eq!(results[0].stderr, "");
    }

    #[test]
    fn owner_lease_is_exclusive() {
        let f = fixture();
        let lease = f.store.acquire_owner_lease().expect("first lease");
        let payload = fs::read_to_string(lease.path()).expect("lease payload");
        assert!(
            payload.contains(&format!("\"pid\":{}", std::process::id())),
            "{}",
            payload
        );
        let other = ResultStore::open(f.store.root());
        let err = other.acquire_owner_lease().expect_err("second lease");
        assert!(matches!(err, SemError::CampaignBusy(_)));
        drop(lease);
        other.acquire_owner_lease().expect("re-acquire after release");
    }
}
