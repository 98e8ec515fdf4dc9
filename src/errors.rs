//! Typed error hierarchy for the studio orchestrator.
//!
//! Two top-level enums cover the two failure domains:
//! - `OrchestratorError`: requests rejected synchronously (unknown client or
//!   run, invalid mode, invalid status transition) and store failures that
//!   surface through a request
//! - `StoreError`: run store persistence failures
//!
//! External tool failures never appear here. Stage executors turn them into
//! stage outcomes.

use thiserror::Error;

use crate::studio::models::{RunId, RunStatus};

/// Errors from the run store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Failed to encode run {run_id}: {source}")]
    Encode {
        run_id: RunId,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to decode stored run: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Run store lock poisoned")]
    LockPoisoned,

    #[error("Run store task failed: {0}")]
    Task(String),
}

/// Errors from run lifecycle requests.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Client {id} not found")]
    ClientNotFound { id: String },

    #[error("Run {id} not found")]
    RunNotFound { id: RunId },

    #[error("Invalid mode '{0}'. Valid values: full, ingest, images, video, drift, export")]
    InvalidMode(String),

    #[error("Invalid inputs: {0}")]
    InvalidInputs(String),

    #[error("Run {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
