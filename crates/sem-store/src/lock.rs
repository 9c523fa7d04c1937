use std::fs::{File, OpenOptions};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::MutexGuard;

use chrono::Utc;
use fs2::FileExt;
use sem_core::{ensure_dir, Result, SemError};
use tracing::debug;

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    Ok(file)
}

/// Held for the duration of one store write.
///
/// Serializes writers within the process (mutex) and across processes
/// (advisory lock on the lock file).
pub(crate) struct WriteGuard<'a> {
    _local: MutexGuard<'a, ()>,
    file: File,
}

impl<'a> WriteGuard<'a> {
    pub(crate) fn acquire(local: MutexGuard<'a, ()>, path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        // fully qualified: std's File::lock_exclusive has a different signature
        FileExt::lock_exclusive(&file)?;
        debug!(lock = %path.display(), "acquired store write lock");
        Ok(Self {
            _local: local,
            file,
        })
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Exclusive ownership of a campaign by one manager.
///
/// Released when dropped or when the owning process exits.
#[derive(Debug)]
pub struct OwnerLease {
    file: File,
    path: PathBuf,
}

impl OwnerLease {
    pub(crate) fn acquire(path: &Path, results_dir: &Path) -> Result<Self> {
        let mut file = open_lock_file(path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(SemError::CampaignBusy(results_dir.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }
        let payload = format!(
            "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        file.set_len(0)?;
        file.rewind()?;
        file.write_all(payload.as_bytes())?;
        debug!(lock = %path.display(), "acquired campaign owner lease");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OwnerLease {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}
