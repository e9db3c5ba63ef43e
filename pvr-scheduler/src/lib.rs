//! pvr-scheduler library - recording scheduling and recorder orchestration
//!
//! This library decides what to record from stored rules and the guide,
//! drives tuner devices and hands finished captures to post-processing
//! workers. The `pvr-scheduler` binary runs it as a daemon and exposes
//! rule, recording and guide management as subcommands.

pub mod config;
pub mod database;
pub mod guide;
pub mod logging;
pub mod notify;
pub mod postproc;
pub mod recorder;
pub mod scheduler;

// Re-export commonly used types
pub use database::{Database, DatabaseHandle};
pub use scheduler::{RecordingScheduler, SchedulerConfig, SchedulerState};
