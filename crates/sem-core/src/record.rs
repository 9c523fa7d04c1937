//! Persistent documents: the campaign and one record per run attempt.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SemError};
use crate::space::{ParamFilter, ParameterCombination, ParameterSpace};
use crate::value::ParamValue;
use crate::sha256_file;

pub const CAMPAIGN_SCHEMA: &str = "campaign_v1";
pub const RUN_RECORD_SCHEMA: &str = "run_record_v1";
pub const DEFAULT_REPETITION_ARGUMENT: &str = "RngRun";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Complete,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Complete | RunState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Complete => "complete",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work: a combination, its repetition index and the attempt number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Job {
    pub combination: ParameterCombination,
    pub repetition: u32,
    pub attempt: u32,
    pub run_key: String,
}

impl Job {
    pub fn new(combination: ParameterCombination, repetition: u32, attempt: u32) -> Self {
        let run_key = combination.run_key(repetition);
        Self {
            combination,
            repetition,
            attempt,
            run_key,
        }
    }

    /// Output directory relative to the results directory.
    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from("data")
            .join(&self.run_key)
            .join(format!("attempt-{}", self.attempt))
    }
}

/// Everything the campaign knows about a single run attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub schema_version: String,
    pub run_key: String,
    pub attempt: u32,
    pub params: ParameterCombination,
    pub repetition: u32,
    pub state: RunState,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub failure: Option<String>,
    /// Relative to the results directory.
    pub output_dir: PathBuf,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub backend_job_id: Option<String>,
}

pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";

impl RunRecord {
    pub fn pending(job: &Job) -> Self {
        Self {
            schema_version: RUN_RECORD_SCHEMA.to_string(),
            run_key: job.run_key.clone(),
            attempt: job.attempt,
            params: job.combination.clone(),
            repetition: job.repetition,
            state: RunState::Pending,
            started_at: None,
            ended_at: None,
            exit_code: None,
            failure: None,
            output_dir: job.output_dir(),
            artifacts: Vec::new(),
            backend_job_id: None,
        }
    }

    pub fn running(job: &Job) -> Self {
        let mut record = Self::pending(job);
        record.state = RunState::Running;
        record.started_at = Some(Utc::now());
        record
    }

    pub fn complete(mut self, exit_code: i32, artifacts: Vec<String>) -> Self {
        self.state = RunState::Complete;
        self.exit_code = Some(exit_code);
        self.artifacts = artifacts;
        self.failure = None;
        self.ended_at = Some(Utc::now());
        self
    }

    pub fn failed(
        mut self,
        exit_code: Option<i32>,
        reason: impl Into<String>,
        artifacts: Vec<String>,
    ) -> Self {
        self.state = RunState::Failed;
        self.exit_code = exit_code;
        self.failure = Some(reason.into());
        self.artifacts = artifacts;
        self.ended_at = Some(Utc::now());
        self
    }

    pub fn job(&self) -> Job {
        Job {
            combination: self.params.clone(),
            repetition: self.repetition,
            attempt: self.attempt,
            run_key: self.run_key.clone(),
        }
    }

    pub fn elapsed_secs(&self) -> Option<f64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.output_dir.join(STDOUT_FILE)
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.output_dir.join(STDERR_FILE)
    }
}

/// The simulation program a campaign is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub path: PathBuf,
    /// `sha256:<hex>` of the executable's bytes.
    pub fingerprint: String,
}

impl TargetSpec {
    pub fn from_executable(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(SemError::validation(format!(
                "target executable not found: {}",
                path.display()
            )));
        }
        let path = path.canonicalize()?;
        let fingerprint = format!("sha256:{}", sha256_file(&path)?);
        Ok(Self { path, fingerprint })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    #[default]
    Optimized,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    #[default]
    Local,
    Grid,
}

impl RunnerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunnerKind::Local => "local",
            RunnerKind::Grid => "grid",
        }
    }
}

/// Input to campaign creation.
#[derive(Debug, Clone)]
pub struct CampaignSpec {
    pub executable: PathBuf,
    /// Declared parameter names with optional defaults.
    pub params: BTreeMap<String, Option<ParamValue>>,
    pub build_mode: BuildMode,
    pub runner: RunnerKind,
    pub repetition_argument: String,
}

impl CampaignSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            params: BTreeMap::new(),
            build_mode: BuildMode::default(),
            runner: RunnerKind::default(),
            repetition_argument: DEFAULT_REPETITION_ARGUMENT.to_string(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, default: Option<ParamValue>) -> Self {
        self.params.insert(name.into(), default);
        self
    }

    pub fn runner(mut self, runner: RunnerKind) -> Self {
        self.runner = runner;
        self
    }

    pub fn build_mode(mut self, mode: BuildMode) -> Self {
        self.build_mode = mode;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub schema_version: String,
    pub campaign_id: String,
    pub target: TargetSpec,
    pub params: BTreeMap<String, Option<ParamValue>>,
    pub build_mode: BuildMode,
    pub runner: RunnerKind,
    pub repetition_argument: String,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn from_spec(spec: &CampaignSpec) -> Result<Self> {
        for (name, default) in &spec.params {
            validate_param_name(name)?;
            if name == &spec.repetition_argument {
                return Err(SemError::validation(format!(
                    "parameter '{}' collides with the repetition argument",
                    name
                )));
            }
            if let Some(v) = default {
                if !v.is_storable() {
                    return Err(SemError::validation(format!(
                        "default for '{}' is not a finite value",
                        name
                    )));
                }
            }
        }
        validate_param_name(&spec.repetition_argument)?;
        let target = TargetSpec::from_executable(&spec.executable)?;
        let created_at = Utc::now();
        let campaign_id = crate::sha256_bytes(
            format!("{}|{}", target.fingerprint, created_at.to_rfc3339()).as_bytes(),
        )[..12]
            .to_string();
        Ok(Self {
            schema_version: CAMPAIGN_SCHEMA.to_string(),
            campaign_id,
            target,
            params: spec.params.clone(),
            build_mode: spec.build_mode,
            runner: spec.runner,
            repetition_argument: spec.repetition_argument.clone(),
            created_at,
        })
    }

    pub fn param_names(&self) -> impl Iterator<Item = &String> {
        self.params.keys()
    }

    /// Fails unless `current` is the same binary the campaign was created with.
    pub fn check_compatible(&self, current: &TargetSpec) -> Result<()> {
        if self.target.fingerprint != current.fingerprint {
            return Err(SemError::Incompatible(format!(
                "campaign was created for {} ({}), current executable {} is {}",
                self.target.path.display(),
                self.target.fingerprint,
                current.path.display(),
                current.fingerprint
            )));
        }
        Ok(())
    }

    /// Rejects filters naming parameters the campaign does not declare.
    pub fn validate_filter(&self, filter: &ParamFilter) -> Result<()> {
        for name in filter.names() {
            if !self.params.contains_key(name) {
                return Err(SemError::validation(format!(
                    "unknown parameter '{}' (declared: {})",
                    name,
                    self.params.keys().cloned().collect::<Vec<_>>().join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Builds the space to enumerate: filter values where given, defaults otherwise.
    pub fn resolve_space(&self, filter: &ParamFilter) -> Result<ParameterSpace> {
        self.validate_filter(filter)?;
        let mut values = BTreeMap::new();
        for (name, default) in &self.params {
            let list = match (filter.get(name), default) {
                (Some(list), _) if !list.is_empty() => list.to_vec(),
                (_, Some(default)) => vec![default.clone()],
                _ => {
                    return Err(SemError::validation(format!(
                        "parameter '{}' has no values and no default",
                        name
                    )))
                }
            };
            values.insert(name.clone(), list);
        }
        ParameterSpace::new(values)
    }

    /// A combination must name exactly the declared parameters.
    pub fn validate_combination(&self, combination: &ParameterCombination) -> Result<()> {
        for name in combination.names() {
            if !self.params.contains_key(name) {
                return Err(SemError::validation(format!(
                    "combination has undeclared parameter '{}'",
                    name
                )));
            }
        }
        for name in self.params.keys() {
            if combination.get(name).is_none() {
                return Err(SemError::validation(format!(
                    "combination is missing parameter '{}'",
                    name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Campaign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Campaign {} ---", self.campaign_id)?;
        writeln!(f, "executable: {}", self.target.path.display())?;
        writeln!(f, "fingerprint: {}", self.target.fingerprint)?;
        writeln!(f, "build_mode: {:?}", self.build_mode)?;
        writeln!(f, "runner: {}", self.runner.as_str())?;
        writeln!(f, "created_at: {}", self.created_at.to_rfc3339())?;
        writeln!(f, "repetition_argument: {}", self.repetition_argument)?;
        writeln!(f, "parameters:")?;
        for (name, default) in &self.params {
            match default {
                Some(v) => writeln!(f, "  {} (default {})", name, v)?,
                None => writeln!(f, "  {}", name)?,
            }
        }
        Ok(())
    }
}

fn validate_param_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-.:".contains(c));
    if ok {
        Ok(())
    } else {
        Err(SemError::validation(format!(
            "invalid parameter name '{}'",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn campaign_with(params: &[(&str, Option<ParamValue>)]) -> Campaign {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = dir.path().join("sim");
        fs::write(&exe, b"#!/bin/sh\nexit 0\n").expect("write exe");
        let mut spec = CampaignSpec::new(&exe);
        for (name, default) in params {
            spec = spec.param(*name, default.clone());
        }
        Campaign::from_spec(&spec).expect("campaign")
    }

    #[test]
    fn resolve_space_fills_defaults() {
        let c = campaign_with(&[("nodes", None), ("seed_mode", Some("fixed".into()))]);
        let filter = ParamFilter::new().with_any("nodes", [1, 2]);
        let space = c.resolve_space(&filter).expect("space");
        assert_eq!(space.len(), 2);
        for combo in space.iter() {
            assert_eq!(combo.get("seed_mode"), Some(&ParamValue::from("fixed")));
        }
    }

    #[test]
    fn resolve_space_rejects_unknown_and_unvalued() {
        let c = campaign_with(&[("nodes", None)]);
        let err = c
            .resolve_space(&ParamFilter::new().with("bogus", 1))
            .expect_err("unknown param");
        assert!(err.to_string().contains("bogus"));
        let err = c.resolve_space(&ParamFilter::new()).expect_err("no values");
        assert!(err.to_string().contains("nodes"));
    }

    #[test]
    fn combination_must_match_declared_names() {
        let c = campaign_with(&[("a", None), ("b", None)]);
        let ok = ParameterCombination::new().with("a", 1).with("b", 2);
        c.validate_combination(&ok).expect("valid");
        let missing = ParameterCombination::new().with("a", 1);
        assert!(c.validate_combination(&missing).is_err());
        let extra = ok.clone().with("c", 3);
        assert!(c.validate_combination(&extra).is_err());
    }

    #[test]
    fn fingerprint_mismatch_is_incompatible() {
        let c = campaign_with(&[]);
        let other = TargetSpec {
            path: c.target.path.clone(),
            fingerprint: "sha256:0000".to_string(),
        };
        let err = c.check_compatible(&other).expect_err("mismatch");
        assert!(matches!(err, SemError::Incompatible(_)));
        c.check_compatible(&c.target.clone()).expect("same target");
    }

    #[test]
    fn repetition_argument_cannot_be_a_parameter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = dir.path().join("sim");
        fs::write(&exe, b"x").expect("write exe");
        let spec = CampaignSpec::new(&exe).param("RngRun", None);
        assert!(Campaign::from_spec(&spec).is_err());
    }

    #[test]
    fn record_lifecycle_sets_timestamps() {
        let job = Job::new(ParameterCombination::new().with("a", 1), 2, 0);
        let running = RunRecord::running(&job);
        assert_eq!(running.state, RunState::Running);
        assert!(running.started_at.is_some());
        assert_eq!(
            running.output_dir,
            PathBuf::from("data").join(&job.run_key).join("attempt-0")
        );
        let done = running.complete(0, vec!["out.csv".to_string()]);
        assert_eq!(done.state, RunState::Complete);
        assert!(done.elapsed_secs().expect("elapsed") >= 0.0);
        assert_eq!(done.job(), job);
    }
}
