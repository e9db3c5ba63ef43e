//! Recorders and device capture.
//!
//! This module provides:
//! - [`Recorder`]: per-tuner state machine with exactly-once capture
//! - [`RecorderPool`]: the configured tuners
//! - [`CaptureJob`]: device-to-file copy with the stall watchdog
//! - [`TuneJob`]: channel tuning stage
//! - [`job`]: the job model shared with post-processing

pub mod capture;
pub mod job;
pub mod pool;
pub mod tune;
pub mod tuner;

pub use capture::{FileDeviceSource, WatchdogPolicy};
pub use job::JobError;
pub use pool::RecorderPool;
pub use tuner::{Recorder, RecorderConfig, RecorderEvent, RecordingCompletion};

use thiserror::Error;

/// Recorder error types.
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Recorder {0} is already recording")]
    AlreadyRecording(String),

    #[error("Channel {channel} is not allowed on recorder {recorder}")]
    ChannelNotAllowed { recorder: String, channel: String },

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

pub type Result<T> = std::result::Result<T, RecorderError>;
