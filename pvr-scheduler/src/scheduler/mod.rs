//! Recording scheduling.
//!
//! This module provides:
//! - [`RecordingScheduler`]: the control loop that launches due captures
//! - [`PendingRecordResolver`]: rules and guide data to recorder assignments
//! - [`OutputPlanner`]: output directory and file naming
//! - [`reconcile`]: rule task reconciliation against the worker set
//! - [`integrity`]: output check on capture completion
//! - [`janitor`]: deferred removal of deleted recordings
//! - [`import`]: the `recorded.txt` import channel

pub mod clock;
pub mod control;
pub mod import;
pub mod integrity;
pub mod janitor;
pub mod output;
pub mod reconcile;
pub mod resolver;

pub use control::{RecordingScheduler, SchedulerConfig, SchedulerState};
pub use output::{DiskFreeSpace, OutputPlanner};

use thiserror::Error;

use crate::database::DatabaseError;
use crate::postproc::WorkerError;
use crate::recorder::RecorderError;

/// Scheduling error types.
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Invalid rule: {0}")]
    Model(#[from] pvr_protocol::ModelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScheduleError>;
