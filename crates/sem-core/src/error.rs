use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SemError>;

/// Errors surfaced by the campaign manager, runners and result store.
///
/// A job that ran and exited non-zero is not an error: it is recorded as a
/// failed run and the campaign keeps going.
#[derive(Debug, Error)]
pub enum SemError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("a campaign already exists in {0}")]
    AlreadyExists(PathBuf),

    #[error("no campaign found in {0}")]
    NotFound(PathBuf),

    #[error("incompatible campaign: {0}")]
    Incompatible(String),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("store corruption at {}: {reason}", path.display())]
    StoreCorruption { path: PathBuf, reason: String },

    #[error("campaign in {0} is owned by another manager")]
    CampaignBusy(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SemError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SemError::Validation(msg.into())
    }

    pub fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        SemError::StoreCorruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Infrastructure failures may be retried without touching the failure budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SemError::Infrastructure(_))
    }

    /// Stable machine-readable code, used by the CLI's JSON envelope.
    pub fn code(&self) -> &'static str {
        match self {
            SemError::Validation(_) => "validation_error",
            SemError::AlreadyExists(_) => "already_exists",
            SemError::NotFound(_) => "not_found",
            SemError::Incompatible(_) => "incompatible",
            SemError::Infrastructure(_) => "infrastructure_failure",
            SemError::StoreCorruption { .. } => "store_corruption",
            SemError::CampaignBusy(_) => "campaign_busy",
            SemError::Config(_) => "config_error",
            SemError::Cancelled => "cancelled",
            SemError::Io(_) => "io_error",
            SemError::Json(_) => "json_error",
        }
    }
}
