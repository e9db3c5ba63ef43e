//! Post-processing worker registry.
//!
//! Work items are queued on an mpsc channel and handled one at a time by
//! a single background task, so analysis tools never compete with each
//! other for the disk.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use pvr_protocol::{Recording, Topic, WorkerInfo};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::indexer::{Mp4Indexer, MP4_EXTENSION};
use super::pipeline::commercial_pipeline;
use super::tool::ToolRunner;
use super::PostprocSettings;
use crate::database::{DatabaseError, DatabaseHandle};
use crate::notify::Notifier;
use crate::recorder::job::{Job, JobContext, JobOutcome};

/// Remux to mp4, then detect commercials and embed chapters.
pub const MP4_WORKER: &str = "mp4";
/// Detect commercials only.
pub const COMMERCIAL_WORKER: &str = "commercial";

const QUEUE_CAPACITY: usize = 64;

/// Worker error types.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Worker queue is closed")]
    QueueClosed,
}

/// Post-processing workers known to the scheduler.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Available workers, used to reconcile rule tasks.
    fn workers(&self) -> Vec<WorkerInfo>;

    /// Queue a recording for a worker.
    async fn add_processing(&self, worker: &str, recording: &Recording) -> Result<(), WorkerError>;
}

struct WorkItem {
    worker: String,
    recording: Recording,
}

/// In-process workers backed by external tools.
pub struct LocalWorkers {
    tx: mpsc::Sender<WorkItem>,
}

impl LocalWorkers {
    pub fn builtin() -> Vec<WorkerInfo> {
        vec![
            WorkerInfo::new(MP4_WORKER, "MP4 Indexer"),
            WorkerInfo::new(COMMERCIAL_WORKER, "Commercial Detector"),
        ]
    }

    /// Start the worker task.
    pub fn spawn(
        settings: PostprocSettings,
        runner: Arc<dyn ToolRunner>,
        database: DatabaseHandle,
        notifier: Notifier,
        cancel: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let processor = Processor {
            settings: Arc::new(settings),
            runner,
            database,
            notifier,
        };
        let task = tokio::spawn(processor.run(rx, cancel));
        (Arc::new(Self { tx }), task)
    }
}

#[async_trait]
impl WorkerRegistry for LocalWorkers {
    fn workers(&self) -> Vec<WorkerInfo> {
        Self::builtin()
    }

    async fn add_processing(&self, worker: &str, recording: &Recording) -> Result<(), WorkerError> {
        if !Self::builtin().iter().any(|w| w.name == worker) {
            return Err(WorkerError::UnknownWorker(worker.to_string()));
        }
        debug!("Queued {} for worker {}", recording.path.display(), worker);
        self.tx
            .send(WorkItem { worker: worker.to_string(), recording: recording.clone() })
            .await
            .map_err(|_| WorkerError::QueueClosed)
    }
}

struct Processor {
    settings: Arc<PostprocSettings>,
    runner: Arc<dyn ToolRunner>,
    database: DatabaseHandle,
    notifier: Notifier,
}

impl Processor {
    async fn run(self, mut rx: mpsc::Receiver<WorkItem>, cancel: CancellationToken) {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            info!("Worker {} processing {}", item.worker, item.recording.path.display());
            self.process(item, &cancel).await;
        }
        info!("Post-processing worker stopped");
    }

    async fn process(&self, item: WorkItem, cancel: &CancellationToken) {
        let mut recording = item.recording;
        let work_dir = recording.work_dir(&self.settings.work_dir);
        if let Err(e) = tokio::fs::create_dir_all(&work_dir).await {
            error!("Cannot create work dir {}: {}", work_dir.display(), e);
            return;
        }

        let embed_target = match item.worker.as_str() {
            MP4_WORKER => match self.index(&mut recording, cancel).await {
                Some(target) => Some(target),
                None if cancel.is_cancelled() => return,
                None => None,
            },
            _ => recording.indexed_path().filter(|p| p.exists()),
        };

        self.detect_commercials(&recording, work_dir, embed_target, cancel).await;
    }

    /// Remux and record the indexed extension. Returns the mp4 path.
    async fn index(&self, recording: &mut Recording, cancel: &CancellationToken) -> Option<PathBuf> {
        let indexer = Mp4Indexer::new(self.settings.ffmpeg.clone(), &recording.path, Arc::clone(&self.runner));
        let ctx = JobContext::detached(cancel.child_token());
        match indexer.run(ctx).await {
            Ok(JobOutcome::Completed) => {}
            Ok(JobOutcome::Cancelled) => return None,
            Err(e) => {
                warn!("Indexing {} failed: {}", recording.path.display(), e);
                return None;
            }
        }

        recording.indexed_extension = Some(MP4_EXTENSION.to_string());
        let stored = {
            let db = self.database.lock().await;
            db.update_recording(recording)
        };
        self.report_store(stored, recording);
        Some(indexer.output().clone())
    }

    async fn detect_commercials(
        &self,
        recording: &Recording,
        work_dir: PathBuf,
        embed_target: Option<PathBuf>,
        cancel: &CancellationToken,
    ) {
        let (pipeline, report) = commercial_pipeline(
            &recording.path,
            &work_dir,
            embed_target,
            Arc::clone(&self.settings),
            Arc::clone(&self.runner),
        );
        match pipeline.run(JobContext::detached(cancel.child_token())).await {
            Ok(JobOutcome::Completed) => {}
            Ok(JobOutcome::Cancelled) => return,
            Err(e) => {
                warn!("Commercial detection for {} failed: {}", recording.path.display(), e);
                return;
            }
        }

        let Some(commercials) = report.lock().commercials.clone() else {
            return;
        };
        let stored = {
            let db = self.database.lock().await;
            db.set_commercials(recording.id, &commercials)
        };
        self.report_store(stored, recording);
    }

    fn report_store(&self, stored: Result<(), DatabaseError>, recording: &Recording) {
        match stored {
            Ok(()) => self
                .notifier
                .send(Topic::RecordingUpdated, serde_json::json!({ "id": recording.id })),
            Err(DatabaseError::RecordingNotFound(id)) => {
                debug!("Recording {} was removed during processing", id)
            }
            Err(e) => error!("Failed to store processing result for {}: {}", recording.id, e),
        }
    }
}
