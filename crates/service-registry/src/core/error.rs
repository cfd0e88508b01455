//! Registry error type.

use thiserror::Error;

use crate::core::job::JobStatus;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    /// The entity was modified by someone else since it was read. Reload and retry.
    #[error("{entity} {key} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        entity: &'static str,
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("job {id} can not change status from {from} to {to}")]
    IllegalTransition { id: u64, from: JobStatus, to: JobStatus },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
