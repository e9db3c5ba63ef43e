//! Per-tuner recorder state machine.
//!
//! A recorder owns at most one capture pipeline (tune then capture).
//! Claiming is a single check-and-act under the state lock, so a second
//! `start_recording` while active is a no-op. Completion is delivered to
//! the one registered listener, which is removed on use.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use pvr_protocol::{Channel, Recording};
use tokio::sync::{broadcast, oneshot};

use super::capture::{CaptureJob, CaptureStats, DeviceSource, WatchdogPolicy};
use super::job::{Job, JobHandle, JobOutcome, JobResult, Sequence};
use super::tune::{TuneJob, DEFAULT_SETTLE};
use super::{RecorderError, Result};
use crate::config::RecorderSettings;
use crate::postproc::tool::ToolRunner;

const EVENT_CAPACITY: usize = 32;

/// Static description of a tuner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderConfig {
    pub title: String,
    pub device_path: PathBuf,
    pub quick_tunable: bool,
    pub tune_command: Option<Vec<String>>,
    /// Whitelist; when non-empty only these channel numbers are used.
    pub allow_channels: Vec<String>,
    /// Blacklist, consulted when no whitelist is configured.
    pub deny_channels: Vec<String>,
    pub watchdog: WatchdogPolicy,
    pub settle: Duration,
}

impl RecorderConfig {
    pub fn new(title: impl Into<String>, device_path: impl Into<PathBuf>) -> Self {
        Self {
            title: title.into(),
            device_path: device_path.into(),
            quick_tunable: false,
            tune_command: None,
            allow_channels: Vec::new(),
            deny_channels: Vec::new(),
            watchdog: WatchdogPolicy::default(),
            settle: DEFAULT_SETTLE,
        }
    }

    pub fn from_settings(settings: &RecorderSettings, watchdog: WatchdogPolicy) -> Self {
        Self {
            title: settings.title.clone(),
            device_path: settings.device_path.clone(),
            quick_tunable: settings.quick_tunable,
            tune_command: settings.tune_command.clone(),
            allow_channels: settings.allow_channels.clone(),
            deny_channels: settings.deny_channels.clone(),
            watchdog,
            settle: DEFAULT_SETTLE,
        }
    }
}

/// Typed recorder notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderEvent {
    RecordingStarted {
        recorder: String,
        channel: Channel,
        destination: PathBuf,
        live: bool,
    },
    RecordingStopped {
        recorder: String,
        destination: PathBuf,
        live: bool,
        result: JobResult,
    },
}

/// Delivered to the completion listener when a capture ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingCompletion {
    pub recorder: String,
    pub channel: Channel,
    pub destination: PathBuf,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub bytes_written: u64,
    pub result: JobResult,
}

#[derive(Default)]
struct RecorderState {
    recording: bool,
    live_tv: bool,
    channel: Option<Channel>,
    destination: Option<PathBuf>,
    started_at: Option<DateTime<Utc>>,
    generation: u64,
    job: Option<Arc<JobHandle>>,
    stats: Option<Arc<CaptureStats>>,
    completion: Option<oneshot::Sender<RecordingCompletion>>,
}

/// One tuner device.
pub struct Recorder {
    config: RecorderConfig,
    source: Arc<dyn DeviceSource>,
    runner: Arc<dyn ToolRunner>,
    state: Mutex<RecorderState>,
    events: broadcast::Sender<RecorderEvent>,
}

impl Recorder {
    pub fn new(config: RecorderConfig, source: Arc<dyn DeviceSource>, runner: Arc<dyn ToolRunner>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            source,
            runner,
            state: Mutex::new(RecorderState::default()),
            events,
        }
    }

    pub fn title(&self) -> &str {
        &self.config.title
    }

    pub fn device_path(&self) -> &Path {
        &self.config.device_path
    }

    pub fn quick_tunable(&self) -> bool {
        self.config.quick_tunable
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording
    }

    pub fn is_live_tv(&self) -> bool {
        let state = self.state.lock();
        state.recording && state.live_tv
    }

    /// True only while active and writing to the recording's path.
    pub fn is_recording_for(&self, recording: &Recording) -> bool {
        let state = self.state.lock();
        state.recording && state.destination.as_deref() == Some(recording.path.as_path())
    }

    pub fn current_channel(&self) -> Option<Channel> {
        self.state.lock().channel.clone()
    }

    pub fn destination(&self) -> Option<PathBuf> {
        self.state.lock().destination.clone()
    }

    pub fn capture_stats(&self) -> Option<Arc<CaptureStats>> {
        self.state.lock().stats.clone()
    }

    /// Whether the allow/deny lists let this recorder tune `channel`.
    pub fn accepts(&self, channel: &Channel) -> bool {
        if !self.config.allow_channels.is_empty() {
            return self.config.allow_channels.iter().any(|c| *c == channel.number);
        }
        !self.config.deny_channels.iter().any(|c| *c == channel.number)
    }

    /// Apply the allow/deny lists to a channel set.
    pub fn custom_channels(&self, channels: &[Channel]) -> Vec<Channel> {
        channels.iter().filter(|c| self.accepts(c)).cloned().collect()
    }

    /// Register the listener for the next completion, replacing any previous one.
    pub fn register_completion_listener(&self) -> oneshot::Receiver<RecordingCompletion> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().completion = Some(tx);
        rx
    }

    /// Start capturing `channel` into `destination`.
    ///
    /// Returns `Ok(false)` without side effects when already recording.
    /// `duration` of `None` records until stopped.
    pub fn start_recording(
        self: &Arc<Self>,
        channel: Channel,
        duration: Option<Duration>,
        destination: PathBuf,
        live: bool,
    ) -> Result<bool> {
        if !self.accepts(&channel) {
            return Err(RecorderError::ChannelNotAllowed {
                recorder: self.config.title.clone(),
                channel: channel.number,
            });
        }

        let capture = CaptureJob::new(
            &self.config.device_path,
            &destination,
            duration,
            Arc::clone(&self.source),
            self.config.watchdog,
        );
        let stats = capture.stats();
        let tune = TuneJob::new(
            &self.config.device_path,
            channel.clone(),
            self.config.tune_command.clone(),
            self.config.quick_tunable,
            Arc::clone(&self.runner),
        )
        .with_settle(self.config.settle);
        let stages: Vec<Arc<dyn Job>> = vec![Arc::new(tune), Arc::new(capture)];
        let pipeline = Sequence::new(format!("{} pipeline", self.config.title), stages);

        let (generation, handle) = {
            let mut state = self.state.lock();
            if state.recording {
                debug!("{} already recording, start request ignored", self.config.title);
                return Ok(false);
            }
            state.recording = true;
            state.live_tv = live;
            state.channel = Some(channel.clone());
            state.destination = Some(destination.clone());
            state.started_at = Some(Utc::now());
            state.generation += 1;
            state.stats = Some(stats);

            let handle = Arc::new(JobHandle::start(Arc::new(pipeline)));
            state.job = Some(Arc::clone(&handle));
            (state.generation, handle)
        };

        info!(
            "{}: {} channel {} -> {}",
            self.config.title,
            if live { "live TV on" } else { "recording" },
            channel,
            destination.display()
        );
        let _ = self.events.send(RecorderEvent::RecordingStarted {
            recorder: self.config.title.clone(),
            channel,
            destination,
            live,
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = handle.wait().await;
            this.finish(generation, result);
        });

        Ok(true)
    }

    /// Stop the active capture, if any, and clear the recording flags.
    pub async fn stop_recording(&self) {
        let (generation, job) = {
            let state = self.state.lock();
            if !state.recording {
                return;
            }
            (state.generation, state.job.clone())
        };

        let result = match job {
            Some(job) => job.stop().await,
            None => Ok(JobOutcome::Cancelled),
        };
        self.finish(generation, result);
    }

    /// Watch live TV; fails when the tuner is busy.
    pub fn start_live_tv(self: &Arc<Self>, channel: Channel, destination: PathBuf) -> Result<()> {
        if self.start_recording(channel, None, destination, true)? {
            Ok(())
        } else {
            Err(RecorderError::AlreadyRecording(self.config.title.clone()))
        }
    }

    /// Stop live TV; scheduled recordings are left alone.
    pub async fn stop_live_tv(&self) {
        if self.is_live_tv() {
            self.stop_recording().await;
        }
    }

    /// Transition recording -> idle once per generation.
    fn finish(&self, generation: u64, result: JobResult) {
        let (completion, event) = {
            let mut state = self.state.lock();
            if !state.recording || state.generation != generation {
                return;
            }
            let channel = state.channel.take();
            let destination = state.destination.take().unwrap_or_default();
            let started_at = state.started_at.take().unwrap_or_else(Utc::now);
            let bytes_written = state.stats.as_ref().map(|s| s.bytes_written()).unwrap_or(0);
            let live = state.live_tv;

            state.recording = false;
            state.live_tv = false;
            state.job = None;

            let completion = state.completion.take().map(|tx| {
                (
                    tx,
                    RecordingCompletion {
                        recorder: self.config.title.clone(),
                        channel: channel.unwrap_or_else(|| Channel::new("")),
                        destination: destination.clone(),
                        started_at,
                        stopped_at: Utc::now(),
                        bytes_written,
                        result: result.clone(),
                    },
                )
            });
            let event = RecorderEvent::RecordingStopped {
                recorder: self.config.title.clone(),
                destination,
                live,
                result,
            };
            (completion, event)
        };

        match &event {
            RecorderEvent::RecordingStopped { result: Err(e), .. } => {
                warn!("{}: capture failed: {}", self.config.title, e)
            }
            _ => info!("{}: capture stopped", self.config.title),
        }

        if let Some((tx, completion)) = completion {
            if tx.send(completion).is_err() {
                debug!("{}: completion listener went away", self.config.title);
            }
        }
        let _ = self.events.send(event);
    }
}
