//! Job model: independently stoppable units of concurrent work.
//!
//! A [`Job`] runs until it finishes or until its cancellation token
//! fires. Jobs are composed with [`Sequence`] (tune then capture, detect
//! then reconcile) and supervised through a [`JobHandle`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::postproc::tool::ToolError;

/// How long `stop()` waits for a job to observe cancellation.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

const EVENT_CAPACITY: usize = 64;

/// Job error types.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to open device {path}: {source}")]
    DeviceOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tune failed: {0}")]
    Tune(String),

    #[error("Device read stalled for {failures} consecutive checks")]
    WatchdogExhausted { failures: u32 },

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("{0}")]
    Failed(String),
}

/// How a job ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Cancelled,
}

/// Final result as seen by observers.
pub type JobResult = Result<JobOutcome, String>;

/// Lifecycle of a supervised job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Finished(JobResult),
}

/// Events published by a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Started { name: String },
    Updated { name: String, detail: String },
    Finished { name: String, result: JobResult },
}

/// Execution context handed to [`Job::run`].
#[derive(Debug, Clone)]
pub struct JobContext {
    name: String,
    cancel: CancellationToken,
    events: broadcast::Sender<JobEvent>,
}

impl JobContext {
    pub fn new(name: impl Into<String>, cancel: CancellationToken, events: broadcast::Sender<JobEvent>) -> Self {
        Self { name: name.into(), cancel, events }
    }

    /// Context without observers, for running a job inline.
    pub fn detached(cancel: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::new("detached", cancel, events)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Publish a progress update.
    pub fn update(&self, detail: impl Into<String>) {
        let _ = self.events.send(JobEvent::Updated {
            name: self.name.clone(),
            detail: detail.into(),
        });
    }

    /// Context for a sub-job; cancelling this context cancels the child.
    pub fn child(&self, name: impl Into<String>) -> JobContext {
        JobContext {
            name: name.into(),
            cancel: self.cancel.child_token(),
            events: self.events.clone(),
        }
    }
}

/// A unit of work that can be started and stopped.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// Run to completion. Implementations must return promptly once the
    /// context is cancelled.
    async fn run(&self, ctx: JobContext) -> Result<JobOutcome, JobError>;
}

/// Handle to a spawned job.
pub struct JobHandle {
    name: String,
    cancel: CancellationToken,
    status: watch::Receiver<JobStatus>,
    events: broadcast::Sender<JobEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl JobHandle {
    /// Spawn a job on the runtime.
    pub fn start(job: Arc<dyn Job>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::start_with(job, CancellationToken::new(), events)
    }

    /// Spawn a job with a caller-provided token and event channel.
    pub fn start_with(job: Arc<dyn Job>, cancel: CancellationToken, events: broadcast::Sender<JobEvent>) -> Self {
        let name = job.name().to_string();
        let (status_tx, status_rx) = watch::channel(JobStatus::Running);
        let ctx = JobContext::new(name.clone(), cancel.clone(), events.clone());

        let task = tokio::spawn(async move {
            let name = ctx.name().to_string();
            let events = ctx.events.clone();
            let _ = events.send(JobEvent::Started { name: name.clone() });

            let result = match job.run(ctx).await {
                Ok(outcome) => Ok(outcome),
                Err(e) => {
                    warn!("Job {} failed: {}", name, e);
                    Err(e.to_string())
                }
            };
            debug!("Job {} finished: {:?}", name, result);

            let _ = events.send(JobEvent::Finished { name, result: result.clone() });
            let _ = status_tx.send(JobStatus::Finished(result));
        });

        Self {
            name,
            cancel,
            status: status_rx,
            events,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.status.borrow(), JobStatus::Running)
    }

    /// Wait for the job to finish.
    pub async fn wait(&self) -> JobResult {
        let mut rx = self.status.clone();
        loop {
            if let JobStatus::Finished(result) = &*rx.borrow_and_update() {
                return result.clone();
            }
            if rx.changed().await.is_err() {
                // The task ended without publishing a result (panic or abort)
                return match &*rx.borrow() {
                    JobStatus::Finished(result) => result.clone(),
                    JobStatus::Running => Err(format!("job {} ended abnormally", self.name)),
                };
            }
        }
    }

    /// Request termination and wait for the job to observe it.
    pub async fn stop(&self) -> JobResult {
        self.cancel.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Job {} did not stop within {:?}, aborting", self.name, STOP_TIMEOUT);
                if let Some(task) = self.task.lock().take() {
                    task.abort();
                }
                Err(format!("job {} aborted", self.name))
            }
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs jobs one after the other.
///
/// Each stage gets a child token, so stopping the sequence stops the
/// running stage and skips the remaining ones. A failing stage ends the
/// sequence with its error.
pub struct Sequence {
    name: String,
    stages: Vec<Arc<dyn Job>>,
}

impl Sequence {
    pub fn new(name: impl Into<String>, stages: Vec<Arc<dyn Job>>) -> Self {
        Self { name: name.into(), stages }
    }
}

#[async_trait]
impl Job for Sequence {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutcome, JobError> {
        for stage in &self.stages {
            if ctx.is_cancelled() {
                return Ok(JobOutcome::Cancelled);
            }
            ctx.update(format!("stage {}", stage.name()));
            match stage.run(ctx.child(stage.name())).await? {
                JobOutcome::Completed => {}
                JobOutcome::Cancelled => return Ok(JobOutcome::Cancelled),
            }
        }
        Ok(JobOutcome::Completed)
    }
}
