use serde::Serialize;
use thiserror::Error;

/// A single violated constraint reported by validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Domain error taxonomy surfaced by the registry, builder and orchestrator.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("validation failed: {}", summarize(.0))]
    Validation(Vec<FieldViolation>),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// The caller's platform session is missing or invalid.
    #[error("{0}")]
    Auth(String),

    /// The GitHub credential is missing or GitHub refused it. The platform
    /// session itself is fine.
    #[error("{0}")]
    GitHubAuth(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("cluster temporarily unavailable: {0}")]
    TransientCluster(String),

    #[error("cluster error: {0}")]
    FatalCluster(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn summarize(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DeployError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        DeployError::Validation(vec![FieldViolation::new(field, message)])
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        DeployError::NotFound(format!("{} not found: {}", what, id))
    }

    pub fn code(&self) -> &'static str {
        match self {
            DeployError::Validation(_) => "VALIDATION_ERROR",
            DeployError::NotFound(_) => "NOT_FOUND",
            DeployError::Conflict(_) => "CONFLICT",
            DeployError::Auth(_) => "UNAUTHORIZED",
            DeployError::GitHubAuth(_) => "GITHUB_AUTH",
            DeployError::InvalidState(_) => "INVALID_STATE",
            DeployError::TransientCluster(_) => "CLUSTER_UNAVAILABLE",
            DeployError::FatalCluster(_) => "CLUSTER_ERROR",
            DeployError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type DeployResult<T> = std::result::Result<T, DeployError>;

impl From<rusqlite::Error> for DeployError {
    fn from(err: rusqlite::Error) -> Self {
        DeployError::Internal(err.into())
    }
}

impl From<r2d2::Error> for DeployError {
    fn from(err: r2d2::Error) -> Self {
        DeployError::Internal(err.into())
    }
}
