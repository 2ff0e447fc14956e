//! Shared error types for the services crate.

use thiserror::Error;

use intake_core::model::ProgressStage;
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Errors raised while persisting the workflow record.
///
/// Mutating store calls log and absorb these; only `flush` returns them.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionStoreError {
    #[error("no active workflow session")]
    NoSession,
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `ProgressTracker`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProgressError {
    #[error("invalid stage transition from {from} to {to}")]
    InvalidTransition {
        from: ProgressStage,
        to: ProgressStage,
    },
}

/// Errors returned by a `SessionValidator` backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidatorError {
    #[error("session validator unreachable: {0}")]
    Unreachable(String),
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
}
