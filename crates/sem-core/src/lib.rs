//! Shared types for simulation campaigns: parameter values and spaces,
//! run records, the error taxonomy and filesystem helpers.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

mod cancel;
mod error;
mod record;
mod space;
mod value;

pub use cancel::CancellationToken;
pub use error::{Result, SemError};
pub use record::{
    BuildMode, Campaign, CampaignSpec, Job, RunRecord, RunState, RunnerKind, TargetSpec,
    CAMPAIGN_SCHEMA, DEFAULT_REPETITION_ARGUMENT, RUN_RECORD_SCHEMA, STDERR_FILE, STDOUT_FILE,
};
pub use space::{Combinations, ParamFilter, ParameterCombination, ParameterSpace};
pub use value::ParamValue;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// serde_json maps are ordered, so serializing a `Value` is already canonical.
pub fn canonical_json_digest(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    sha256_bytes(&bytes)
}

/// Prefix shared by in-progress temp files; readers skip anything carrying it.
pub const TEMP_PREFIX: &str = ".tmp.";

/// Write via temp file + fsync + rename so readers never observe a partial file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = chrono::Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!("{}{}.{}.{}", TEMP_PREFIX, name, pid, ts));
    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}
