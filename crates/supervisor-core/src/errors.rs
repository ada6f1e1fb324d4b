use thiserror::Error;

/// The taxonomy of failures the coordination core can surface. Variants are
/// grouped by how a caller is expected to react, not by where they
/// originate.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("target unavailable: {0}")]
    TargetUnavailable(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl StateError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, StateError>;

/// A row that failed to deserialize during a bulk recovery load. Carried
/// alongside the rows that parsed fine rather than aborting the whole scan.
#[derive(Error, Debug)]
#[error("corrupted row in {table} (id={id}): {cause}")]
pub struct RecoveryError {
    pub table: &'static str,
    pub id: String,
    pub cause: String,
}
