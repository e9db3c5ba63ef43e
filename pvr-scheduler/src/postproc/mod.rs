//! Post-capture processing.
//!
//! This module provides:
//! - [`tool`]: external tool invocation
//! - [`detection`]: silence/black parsing and break classification
//! - [`commercial`]: rating inference, selection and chapter files
//! - [`pipeline`]: the four-stage commercial detection pipeline
//! - [`indexer`]: ts to mp4 remux
//! - [`workers`]: the worker registry consumed by the scheduler

pub mod commercial;
pub mod detection;
pub mod indexer;
pub mod pipeline;
pub mod tool;
pub mod workers;

use std::path::PathBuf;
use std::time::Duration;

use crate::config::PostprocSection;
use tool::ProcessRunner;

pub use workers::{LocalWorkers, WorkerError, WorkerRegistry, COMMERCIAL_WORKER, MP4_WORKER};

/// Post-processing tool locations and parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostprocSettings {
    pub ffmpeg: String,
    pub chapter_tool: Option<String>,
    pub rating_detector: Option<String>,
    /// Seconds between frames handed to the rating detector.
    pub rating_span_secs: u64,
    pub default_indexer: String,
    pub work_dir: PathBuf,
    /// Limit on a single tool run. `None` lets tools run until they exit.
    pub tool_timeout: Option<Duration>,
}

impl Default for PostprocSettings {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            chapter_tool: Some("MP4Box".to_string()),
            rating_detector: None,
            rating_span_secs: 30,
            default_indexer: MP4_WORKER.to_string(),
            work_dir: PathBuf::from("work"),
            tool_timeout: Some(Duration::from_secs(6 * 60 * 60)),
        }
    }
}

impl PostprocSettings {
    /// Merge the `[postproc]` section over the defaults.
    pub fn from_section(section: &PostprocSection) -> Self {
        let defaults = Self::default();
        Self {
            ffmpeg: section.ffmpeg.clone().unwrap_or(defaults.ffmpeg),
            chapter_tool: section.chapter_tool.clone().or(defaults.chapter_tool),
            rating_detector: section.rating_detector.clone(),
            rating_span_secs: section.rating_span_secs.unwrap_or(defaults.rating_span_secs).max(1),
            default_indexer: section.default_indexer.clone().unwrap_or(defaults.default_indexer),
            work_dir: section.work_dir.clone().unwrap_or(defaults.work_dir),
            tool_timeout: match section.tool_timeout_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.tool_timeout,
            },
        }
    }

    /// Process runner for post-processing tools, honouring `tool_timeout`.
    pub fn runner(&self) -> ProcessRunner {
        match self.tool_timeout {
            Some(limit) => ProcessRunner::with_timeout(limit),
            None => ProcessRunner::new(),
        }
    }
}
