//! Recording scheduler control loop.
//!
//! # How It Works
//!
//! 1. Every tick the scheduler lists the rules (reconciling their tasks
//!    with the worker set) and asks the resolver for due airings
//! 2. Each pending record is launched in resolver order: the scheduler
//!    waits for the start time, claims the recorder (stopping live TV,
//!    retrying while it is busy), plans the output file and starts the
//!    capture
//! 3. When the recorder reports completion the recording is finalized,
//!    checked, entered in the ledger and handed to the workers
//!
//! Passes never overlap. Errors are logged and the loop moves on to the
//! next tick. Rule reconciliation, the janitor and the import channel run
//! on their own, slower cadences from the same loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use log::{debug, error, info, warn};
use pvr_protocol::{RecordedShow, Recording, RecordingRule, RuleKind, ShowAiring, Topic};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::clock::{Clock, SystemClock};
use super::integrity::{check_output, Integrity};
use super::janitor::{self, DeferredRemovals};
use super::output::OutputPlanner;
use super::reconcile::reconcile_tasks;
use super::resolver::{PendingRecord, PendingRecordResolver};
use super::{import, Result};
use crate::database::{DatabaseError, DatabaseHandle, SchedulerConfigRecord};
use crate::guide::GuideProvider;
use crate::notify::Notifier;
use crate::postproc::{WorkerRegistry, COMMERCIAL_WORKER, MP4_WORKER};
use crate::recorder::job::JobOutcome;
use crate::recorder::{RecorderPool, RecordingCompletion};

const GUIDE_RETENTION_DAYS: i64 = 7;

/// Recording scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between scheduling passes.
    pub tick_interval: Duration,
    /// Granularity of the wait for a pending record's start.
    pub recheck_interval: Duration,
    /// Claim attempts on a busy recorder before giving up.
    pub claim_retry_limit: u32,
    pub claim_retry_backoff: Duration,
    /// How far ahead of its start an airing becomes ready.
    pub lookahead: Duration,
    pub reconcile_interval: Duration,
    pub janitor_interval: Duration,
    pub import_interval: Duration,
    pub import_dir: Option<PathBuf>,
    /// Root of the post-processing work directories.
    pub work_dir: PathBuf,
    /// Worker used when a rule has no enabled task.
    pub default_indexer: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(15),
            recheck_interval: Duration::from_secs(5),
            claim_retry_limit: 15,
            claim_retry_backoff: Duration::from_millis(1000),
            lookahead: Duration::from_secs(15),
            reconcile_interval: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(120),
            import_interval: Duration::from_secs(60),
            import_dir: None,
            work_dir: PathBuf::from("work"),
            default_indexer: Some(MP4_WORKER.to_string()),
        }
    }
}

impl SchedulerConfig {
    /// Apply the timing stored in the database row.
    pub fn apply_record(&mut self, record: &SchedulerConfigRecord) {
        self.tick_interval = Duration::from_secs(record.tick_interval_secs.max(1));
        self.recheck_interval = Duration::from_secs(record.recheck_interval_secs.max(1));
        self.claim_retry_limit = record.claim_retry_limit;
        self.claim_retry_backoff = Duration::from_millis(record.claim_retry_backoff_ms);
    }
}

/// Recording scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is running.
    Running,
    /// Scheduler is paused; housekeeping continues.
    Paused,
    /// Scheduler is stopped.
    Stopped,
}

/// A capture that was started and awaits its completion.
struct Launched {
    rule: RecordingRule,
    airing: ShowAiring,
    recording: Recording,
    launched_at: DateTime<Utc>,
}

/// Decides what to record and drives the recorders.
pub struct RecordingScheduler {
    database: DatabaseHandle,
    recorders: RecorderPool,
    resolver: PendingRecordResolver,
    planner: Arc<OutputPlanner>,
    workers: Arc<dyn WorkerRegistry>,
    notifier: Notifier,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    /// Current state.
    state: Arc<Mutex<SchedulerState>>,
    removals: DeferredRemovals,
    /// Held for the duration of a pass.
    pass_lock: Mutex<()>,
    shutdown: CancellationToken,
    completions: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RecordingScheduler {
    /// Create a new recording scheduler.
    pub fn new(
        database: DatabaseHandle,
        guide: Arc<dyn GuideProvider>,
        recorders: RecorderPool,
        planner: Arc<OutputPlanner>,
        workers: Arc<dyn WorkerRegistry>,
        notifier: Notifier,
        config: SchedulerConfig,
    ) -> Self {
        let resolver = PendingRecordResolver::new(guide, database.clone(), recorders.clone(), Arc::clone(&planner));
        Self {
            database,
            recorders,
            resolver,
            planner,
            workers,
            notifier,
            clock: Arc::new(SystemClock),
            config,
            state: Arc::new(Mutex::new(SchedulerState::Running)),
            removals: DeferredRemovals::new(),
            pass_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            completions: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Replace the wall-clock source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Start the scheduler background task.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run the scheduler loop.
    async fn run(self: Arc<Self>) {
        info!(
            "RecordingScheduler: Starting with tick interval {} seconds",
            self.config.tick_interval.as_secs()
        );

        let mut tick = periodic(self.config.tick_interval);
        let mut reconcile = periodic(self.config.reconcile_interval);
        let mut janitor = periodic(self.config.janitor_interval);
        let mut import = periodic(self.config.import_interval);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    match *self.state.lock().await {
                        SchedulerState::Stopped => break,
                        SchedulerState::Paused => {
                            debug!("RecordingScheduler: Paused, skipping pass");
                            continue;
                        }
                        SchedulerState::Running => {}
                    }
                    if let Err(e) = self.check_and_record().await {
                        error!("RecordingScheduler: Error during scheduling pass: {}", e);
                    }
                }
                _ = reconcile.tick() => {
                    if let Err(e) = self.list_rules().await {
                        error!("RecordingScheduler: Error during rule reconciliation: {}", e);
                    }
                }
                _ = janitor.tick() => {
                    self.run_janitor(false).await;
                    match self.purge_guide().await {
                        Ok(0) => {}
                        Ok(n) => debug!("RecordingScheduler: Purged {} old airing(s)", n),
                        Err(e) => error!("RecordingScheduler: Guide purge failed: {}", e),
                    }
                }
                _ = import.tick(), if self.config.import_dir.is_some() => {
                    if let Some(dir) = &self.config.import_dir {
                        if let Err(e) = import::run_import(dir, &self.database, &self.notifier).await {
                            error!("RecordingScheduler: Import from {} failed: {}", dir.display(), e);
                        }
                    }
                }
            }
        }
        info!("RecordingScheduler: Stopped");
    }

    /// Run one scheduling pass now. Returns the number of captures launched.
    pub async fn trigger_pass(self: &Arc<Self>) -> Result<usize> {
        self.check_and_record().await
    }

    async fn check_and_record(self: &Arc<Self>) -> Result<usize> {
        let _pass = self.pass_lock.lock().await;

        let rules = self.list_rules().await?;
        if rules.is_empty() {
            debug!("RecordingScheduler: No recording rules");
            return Ok(0);
        }

        let resolution = self
            .resolver
            .resolve(&rules, self.clock.now(), self.config.lookahead)
            .await?;
        if resolution.ready.is_empty() {
            debug!("RecordingScheduler: Nothing due");
            return Ok(0);
        }

        info!("RecordingScheduler: {} recording(s) due", resolution.ready.len());
        let mut launched = 0;
        for pending in resolution.ready {
            if self.shutdown.is_cancelled() {
                break;
            }
            let show_id = pending.airing.show_id.clone();
            match self.launch(pending).await {
                Ok(true) => launched += 1,
                Ok(false) => {}
                Err(e) => warn!("RecordingScheduler: Failed to launch {}: {}", show_id, e),
            }
        }
        Ok(launched)
    }

    /// Sleep unless shutting down. Returns false on shutdown.
    async fn pause_for(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Wait for the start, claim the recorder and start the capture.
    async fn launch(self: &Arc<Self>, pending: PendingRecord) -> Result<bool> {
        loop {
            let now = self.clock.now();
            if now >= pending.start {
                break;
            }
            let wait = (pending.start - now).to_std().unwrap_or_default().min(self.config.recheck_interval);
            debug!("RecordingScheduler: {} starts in {:?}", pending.airing.show_id, pending.start - now);
            if !self.pause_for(wait).await {
                return Ok(false);
            }
        }

        let recorder = &pending.recorder;
        let mut attempts = 0;
        while recorder.is_recording() {
            if recorder.is_live_tv() {
                info!("RecordingScheduler: Stopping live TV on {} for {}", recorder.title(), pending.airing.show_id);
                recorder.stop_live_tv().await;
                continue;
            }
            attempts += 1;
            if attempts > self.config.claim_retry_limit {
                warn!(
                    "RecordingScheduler: {} still busy after {} attempts, abandoning {}",
                    recorder.title(),
                    self.config.claim_retry_limit,
                    pending.airing.show_id
                );
                self.notifier.send(
                    Topic::RecorderBusy,
                    serde_json::json!({ "recorder": recorder.title(), "show_id": pending.airing.show_id }),
                );
                return Ok(false);
            }
            debug!(
                "RecordingScheduler: {} busy, retry {}/{}",
                recorder.title(),
                attempts,
                self.config.claim_retry_limit
            );
            if !self.pause_for(self.config.claim_retry_backoff).await {
                return Ok(false);
            }
        }

        let now = self.clock.now();
        let late = (now - pending.start).to_std().unwrap_or_default();
        let remaining = pending.duration.saturating_sub(late);
        if remaining.is_zero() {
            info!("RecordingScheduler: {} is already over", pending.airing.show_id);
            return Ok(false);
        }

        // Free space may have changed since the resolver pass. Reserving
        // creates the file, so concurrent captures never share a path.
        let file = self.planner.reserve(&pending.recording.title, pending.start)?;
        let mut recording = pending.recording.clone();
        recording.path = file.clone();
        recording.real_start = now;
        recording.duration_secs = remaining.as_secs();
        recording.current_recording = true;
        let inserted = {
            let db = self.database.lock().await;
            db.insert_recording(&recording)
        };
        recording.id = match inserted {
            Ok(id) => id,
            Err(e) => {
                release_reservation(&file);
                return Err(e.into());
            }
        };

        let completion = recorder.register_completion_listener();
        let started = recorder.start_recording(pending.channel.clone(), Some(remaining), file.clone(), false);
        if !matches!(started, Ok(true)) {
            release_reservation(&file);
            {
                let db = self.database.lock().await;
                db.delete_recording(recording.id)?;
            }
            started?;
            warn!("RecordingScheduler: {} was claimed by someone else", recorder.title());
            return Ok(false);
        }

        info!(
            "RecordingScheduler: Recording {} on {} for {}s -> {}",
            recording.title,
            recorder.title(),
            remaining.as_secs(),
            file.display()
        );
        self.notifier.send(
            Topic::RecordingAdded,
            serde_json::json!({ "id": recording.id, "title": recording.title }),
        );

        let launched = Launched {
            rule: pending.rule,
            airing: pending.airing,
            recording,
            launched_at: now,
        };
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            match completion.await {
                Ok(done) => {
                    let id = launched.recording.id;
                    if let Err(e) = this.complete(launched, done).await {
                        error!("RecordingScheduler: Failed to finalize recording {}: {}", id, e);
                    }
                }
                Err(_) => this.abandon(launched.recording).await,
            }
        });
        let mut completions = self.completions.lock();
        completions.retain(|t| !t.is_finished());
        completions.push(task);

        Ok(true)
    }

    /// The recorder went away without reporting; clear the current flag.
    async fn abandon(&self, mut recording: Recording) {
        warn!("RecordingScheduler: No completion for recording {}", recording.id);
        recording.current_recording = false;
        let db = self.database.lock().await;
        if let Err(e) = db.update_recording(&recording) {
            error!("RecordingScheduler: Failed to update recording {}: {}", recording.id, e);
        }
    }

    /// Finalize a capture after the recorder stopped.
    async fn complete(&self, launched: Launched, done: RecordingCompletion) -> Result<()> {
        let Launched { rule, airing, mut recording, launched_at } = launched;
        let now = self.clock.now();
        recording.duration_secs = (now - launched_at).num_seconds().max(0) as u64;
        recording.current_recording = false;

        match &done.result {
            Ok(outcome) => info!(
                "RecordingScheduler: Capture of {} ended ({:?}, {}s, {} bytes)",
                recording.title, outcome, recording.duration_secs, done.bytes_written
            ),
            Err(e) => warn!("RecordingScheduler: Capture of {} failed: {}", recording.title, e),
        }

        let stored = {
            let db = self.database.lock().await;
            db.update_recording(&recording)
        };
        match stored {
            Ok(()) => {}
            Err(DatabaseError::RecordingNotFound(id)) => {
                debug!("RecordingScheduler: Recording {} was removed during capture", id);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if check_output(&recording) == Integrity::Bad {
            warn!(
                "RecordingScheduler: {} has no usable output, removing and rescheduling",
                recording.path.display()
            );
            janitor::remove_now(&recording, &self.config.work_dir, &self.database, &self.notifier).await?;
            self.resubmit(&rule, &airing).await?;
            return Ok(());
        }

        // The stored rule may have been edited or reconciled during the capture
        let current_rule = {
            let db = self.database.lock().await;
            db.get_recording_rule(&rule.id)?
        };
        let rule = current_rule.unwrap_or(rule);

        match rule.kind {
            RuleKind::Series if done.result == Ok(JobOutcome::Completed) => {
                let mut db = self.database.lock().await;
                db.add_recorded_show(&RecordedShow::new(
                    airing.show_id.clone(),
                    Some(recording.title.clone()),
                    now,
                ))?;
            }
            RuleKind::Series => {
                debug!("RecordingScheduler: {} ended early, not marked recorded", airing.show_id);
            }
            RuleKind::Once if now >= airing.end() => {
                let removed = {
                    let db = self.database.lock().await;
                    db.remove_recording_rule(&rule.name, &rule.id)?
                };
                if removed {
                    info!("RecordingScheduler: One-time rule {} done", rule.id);
                    self.notifier.send(Topic::RuleUpdated, serde_json::json!({ "id": rule.id }));
                }
            }
            RuleKind::Once => {}
        }

        self.load_marked_removals().await;
        if self.removals.contains(recording.id) {
            debug!("RecordingScheduler: Recording {} queued for removal, skipping processing", recording.id);
        } else {
            for worker in self.processing_for(&rule) {
                if let Err(e) = self.workers.add_processing(&worker, &recording).await {
                    warn!("RecordingScheduler: Cannot queue {} for {}: {}", recording.id, worker, e);
                }
            }
        }

        self.notifier.send(
            Topic::RecordingUpdated,
            serde_json::json!({ "id": recording.id, "duration_secs": recording.duration_secs }),
        );
        Ok(())
    }

    /// Workers to run for a finished recording of `rule`.
    fn processing_for(&self, rule: &RecordingRule) -> Vec<String> {
        let mut names: Vec<String> = rule.enabled_tasks().map(|t| t.name.clone()).collect();
        if names.is_empty() {
            names.extend(self.config.default_indexer.iter().filter(|n| !n.is_empty()).cloned());
        }
        // The mp4 worker runs commercial detection itself
        if names.iter().any(|n| n == MP4_WORKER) {
            names.retain(|n| n != COMMERCIAL_WORKER);
        }
        names
    }

    /// Put a rule back up for scheduling after a bad capture.
    async fn resubmit(&self, rule: &RecordingRule, airing: &ShowAiring) -> Result<()> {
        let mut db = self.database.lock().await;
        db.remove_recorded_show(&airing.show_id)?;
        let Some(stored) = db.get_recording_rule(&rule.id)? else {
            debug!("RecordingScheduler: Rule {} was removed, not rescheduling", rule.id);
            return Ok(());
        };
        db.add_recording_rule(&stored)?;
        drop(db);

        info!("RecordingScheduler: Rule {} resubmitted for {}", rule.id, airing.show_id);
        self.notifier.send(Topic::RuleUpdated, serde_json::json!({ "id": rule.id }));
        Ok(())
    }

    /// All rules, with their task sets reconciled against the workers.
    pub async fn list_rules(&self) -> Result<Vec<RecordingRule>> {
        let workers = self.workers.workers();
        let mut changed = Vec::new();
        let rules = {
            let db = self.database.lock().await;
            let mut rules = db.get_recording_rules()?;
            for rule in &mut rules {
                if let Some(tasks) = reconcile_tasks(rule, &workers) {
                    db.update_rule_tasks(&rule.id, &tasks)?;
                    rule.tasks = tasks;
                    changed.push(rule.id.clone());
                }
            }
            rules
        };

        for id in changed {
            info!("RecordingScheduler: Rule {} tasks reconciled with {} worker(s)", id, workers.len());
            self.notifier.send(Topic::RuleUpdated, serde_json::json!({ "id": id }));
        }
        Ok(rules)
    }

    /// Store a rule, replacing any rule with the same id.
    pub async fn add_rule(&self, mut rule: RecordingRule) -> Result<()> {
        rule.validate()?;
        if let Some(tasks) = reconcile_tasks(&rule, &self.workers.workers()) {
            rule.tasks = tasks;
        }
        {
            let mut db = self.database.lock().await;
            db.add_recording_rule(&rule)?;
        }
        info!("RecordingScheduler: Rule {} ({}) stored", rule.id, rule.name);
        self.notifier.send(Topic::RuleUpdated, serde_json::json!({ "id": rule.id }));
        Ok(())
    }

    /// Remove a rule. Returns whether it existed.
    pub async fn remove_rule(&self, name: &str, id: &str) -> Result<bool> {
        let removed = {
            let db = self.database.lock().await;
            db.remove_recording_rule(name, id)?
        };
        if removed {
            info!("RecordingScheduler: Rule {} removed", id);
            self.notifier.send(Topic::RuleUpdated, serde_json::json!({ "id": id }));
        }
        Ok(removed)
    }

    /// Queue a recording for removal by the janitor. Returns whether it exists.
    ///
    /// The request is stored with the recording, so it outlives a restart.
    pub async fn remove_recording(&self, id: i64) -> Result<bool> {
        let recording = {
            let db = self.database.lock().await;
            if !db.mark_recording_for_removal(id)? {
                return Ok(false);
            }
            db.get_recording(id)?
        };
        let Some(recording) = recording else {
            return Ok(false);
        };
        match self.recorders.all().iter().find(|r| r.is_recording_for(&recording)) {
            Some(recorder) => info!(
                "RecordingScheduler: Recording {} queued for removal once {} stops",
                id,
                recorder.title()
            ),
            None => info!("RecordingScheduler: Recording {} queued for removal", id),
        }
        self.removals.push(recording);
        Ok(true)
    }

    /// Pick up removals flagged in the database by another process.
    async fn load_marked_removals(&self) {
        let marked = {
            let db = self.database.lock().await;
            db.get_recordings_marked_for_removal()
        };
        match marked {
            Ok(marked) => {
                for recording in marked {
                    self.removals.push(recording);
                }
            }
            Err(e) => warn!("RecordingScheduler: Cannot load pending removals: {}", e),
        }
    }

    /// Drain the removal queue. `force` ignores active recorders.
    pub async fn run_janitor(&self, force: bool) -> usize {
        self.load_marked_removals().await;
        let removed = janitor::drain(
            &self.removals,
            &self.recorders,
            force,
            &self.config.work_dir,
            &self.database,
            &self.notifier,
        )
        .await;
        if removed > 0 {
            info!("RecordingScheduler: Janitor removed {} recording(s)", removed);
        }
        removed
    }

    /// Drop guide airings that ended more than a week ago.
    async fn purge_guide(&self) -> Result<usize> {
        let before = self.clock.now() - chrono::Duration::days(GUIDE_RETENTION_DAYS);
        let db = self.database.lock().await;
        Ok(db.purge_airings_before(before)?)
    }

    /// Pause scheduling passes.
    pub async fn pause(&self) {
        let mut state = self.state.lock().await;
        if *state == SchedulerState::Running {
            *state = SchedulerState::Paused;
            info!("RecordingScheduler: Paused");
        }
    }

    /// Resume scheduling passes.
    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        if *state == SchedulerState::Paused {
            *state = SchedulerState::Running;
            info!("RecordingScheduler: Resumed");
        }
    }

    /// Stop the scheduler loop and abort any wait in progress.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        *state = SchedulerState::Stopped;
        self.shutdown.cancel();
        info!("RecordingScheduler: Stop requested");
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.lock().await
    }

    /// Stop the loop, the recorders and the completion handlers, then
    /// remove every queued recording.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.recorders.stop_all().await;
        let pending = std::mem::take(&mut *self.completions.lock());
        join_all(pending).await;
        self.run_janitor(true).await;
    }
}

/// Remove a reserved output file that no capture will write.
fn release_reservation(file: &Path) {
    if let Err(e) = std::fs::remove_file(file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("RecordingScheduler: Cannot release {}: {}", file.display(), e);
        }
    }
}

fn periodic(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::guide::DatabaseGuide;
    use crate::postproc::tool::testing::FakeRunner;
    use crate::postproc::WorkerError;
    use crate::recorder::capture::testing::FakeDevice;
    use crate::recorder::capture::DeviceSource;
    use crate::recorder::{Recorder, RecorderConfig, RecorderEvent};
    use crate::scheduler::clock::testing::TokioClock;
    use crate::scheduler::output::DiskFreeSpace;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pvr_protocol::{Channel, Task, WorkerInfo};

    /// Workers that only remember what was queued.
    #[derive(Default)]
    struct FakeWorkers {
        queued: parking_lot::Mutex<Vec<(String, i64)>>,
    }

    #[async_trait]
    impl WorkerRegistry for FakeWorkers {
        fn workers(&self) -> Vec<WorkerInfo> {
            vec![WorkerInfo::new(MP4_WORKER, "MP4 Indexer"), WorkerInfo::new(COMMERCIAL_WORKER, "Commercial Detector")]
        }

        async fn add_processing(&self, worker: &str, recording: &Recording) -> std::result::Result<(), WorkerError> {
            self.queued.lock().push((worker.to_string(), recording.id));
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        db: DatabaseHandle,
        recorder: Arc<Recorder>,
        workers: Arc<FakeWorkers>,
        notifier: Notifier,
        scheduler: Arc<RecordingScheduler>,
    }

    fn airing_at(start: DateTime<Utc>) -> ShowAiring {
        ShowAiring {
            show_id: "ep-1".into(),
            series_id: Some("s1".into()),
            title: "News".into(),
            episode_title: None,
            channel: Channel::named("5", "Five"),
            start,
            duration_secs: 3600,
        }
    }

    fn eight_pm() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap()
    }

    async fn fixture(base: DateTime<Utc>, device: Arc<dyn DeviceSource>, rule: RecordingRule) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap().into_handle();
        {
            let mut guard = db.lock().await;
            guard.upsert_show_airing(&airing_at(eight_pm())).unwrap();
            guard.add_recording_rule(&rule).unwrap();
        }

        let mut config = RecorderConfig::new("tuner0", "/dev/tuner0");
        config.quick_tunable = true;
        config.allow_channels = vec!["5".into()];
        let recorder = Arc::new(Recorder::new(config, device, Arc::new(FakeRunner::default())));

        let workers = Arc::new(FakeWorkers::default());
        let notifier = Notifier::new();
        let planner = Arc::new(OutputPlanner::new(vec![dir.path().to_path_buf()], Arc::new(DiskFreeSpace)));
        let config = SchedulerConfig {
            work_dir: dir.path().join("work"),
            ..SchedulerConfig::default()
        };
        let scheduler = RecordingScheduler::new(
            db.clone(),
            Arc::new(DatabaseGuide::new(db.clone())),
            RecorderPool::new(vec![Arc::clone(&recorder)]),
            planner,
            workers.clone(),
            notifier.clone(),
            config,
        )
        .with_clock(Arc::new(TokioClock::starting_at(base)));

        Fixture {
            dir,
            db,
            recorder,
            workers,
            notifier,
            scheduler: Arc::new(scheduler),
        }
    }

    async fn wait_for(rx: &mut tokio::sync::broadcast::Receiver<crate::notify::Notification>, topic: Topic) {
        loop {
            let n = tokio::time::timeout(Duration::from_secs(7200), rx.recv())
                .await
                .expect("notification in time")
                .unwrap();
            if n.topic == topic {
                return;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_rule_end_to_end() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 19, 59, 50).unwrap();
        let rule = RecordingRule::once("r1", "News", "ep-1", Channel::new("5"));
        let f = fixture(base, Arc::new(FakeDevice::streaming()), rule).await;
        let mut events = f.recorder.subscribe();
        let mut notifications = f.notifier.subscribe();

        let task = Arc::clone(&f.scheduler).start();
        wait_for(&mut notifications, Topic::RecordingUpdated).await;

        let mut starts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RecorderEvent::RecordingStarted { channel, live, destination, .. } = event {
                starts.push((channel, live, destination));
            }
        }
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].0, Channel::new("5"));
        assert!(!starts[0].1);

        let recordings = f.db.lock().await.get_recordings().unwrap();
        assert_eq!(recordings.len(), 1);
        let rec = &recordings[0];
        assert_eq!(rec.path, starts[0].2);
        assert!(!rec.current_recording);
        assert!((3595..=3605).contains(&rec.duration_secs), "duration {}", rec.duration_secs);
        assert!(std::fs::metadata(&rec.path).unwrap().len() > 0);

        // ONCE rules leave the ledger alone and are dropped once the airing is over
        let guard = f.db.lock().await;
        assert!(guard.get_recorded_shows().unwrap().is_empty());
        assert!(guard.get_recording_rules().unwrap().is_empty());
        drop(guard);
        assert_eq!(f.workers.queued.lock().clone(), vec![(MP4_WORKER.to_string(), rec.id)]);

        f.scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_series_capture_marks_ledger() {
        let base = eight_pm();
        let mut rule = RecordingRule::series("r1", "News", "s1", Channel::new("5"));
        let mut commercial = Task::with_defaults(COMMERCIAL_WORKER, "Commercial Detector");
        commercial.enabled = true;
        rule.tasks = vec![Task::with_defaults(MP4_WORKER, "MP4 Indexer"), commercial];
        let f = fixture(base, Arc::new(FakeDevice::streaming()), rule).await;
        let mut notifications = f.notifier.subscribe();

        assert_eq!(f.scheduler.trigger_pass().await.unwrap(), 1);
        assert!(f.recorder.is_recording());
        wait_for(&mut notifications, Topic::RecordingUpdated).await;

        let guard = f.db.lock().await;
        assert!(guard.is_already_recorded("ep-1").unwrap());
        assert_eq!(guard.get_recording_rules().unwrap().len(), 1);
        drop(guard);
        let queued: Vec<String> = f.workers.queued.lock().iter().map(|(w, _)| w.clone()).collect();
        assert_eq!(queued, vec![COMMERCIAL_WORKER.to_string()]);

        // Next pass: the episode is in the ledger
        assert_eq!(f.scheduler.trigger_pass().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_output_is_removed_and_rescheduled() {
        let base = eight_pm();
        let rule = RecordingRule::series("r1", "News", "s1", Channel::new("5"));
        let f = fixture(base, Arc::new(FakeDevice::stalled()), rule).await;
        let mut notifications = f.notifier.subscribe();

        assert_eq!(f.scheduler.trigger_pass().await.unwrap(), 1);
        let first = f.recorder.destination().unwrap();

        // The watchdog gives up on the wedged device; nothing was written
        wait_for(&mut notifications, Topic::RecordingRemoved).await;
        wait_for(&mut notifications, Topic::RuleUpdated).await;
        {
            let guard = f.db.lock().await;
            assert!(guard.get_recordings().unwrap().is_empty());
            assert!(!guard.is_already_recorded("ep-1").unwrap());
            assert!(guard.get_recording_rule("r1").unwrap().is_some());
        }
        assert!(!first.exists());
        assert!(f.workers.queued.lock().is_empty());

        // Still airing, so the next pass tries again
        assert_eq!(f.scheduler.trigger_pass().await.unwrap(), 1);
        f.recorder.stop_recording().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_title_same_minute_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap().into_handle();
        {
            let mut guard = db.lock().await;
            let mut other = airing_at(eight_pm());
            other.show_id = "ep-7".into();
            other.channel = Channel::new("7");
            guard.upsert_show_airing(&airing_at(eight_pm())).unwrap();
            guard.upsert_show_airing(&other).unwrap();
            guard.add_recording_rule(&RecordingRule::once("r5", "News", "ep-1", Channel::new("5"))).unwrap();
            guard.add_recording_rule(&RecordingRule::once("r7", "News", "ep-7", Channel::new("7"))).unwrap();
        }

        let recorders: Vec<Arc<Recorder>> = ["5", "7"]
            .iter()
            .enumerate()
            .map(|(n, channel)| {
                let mut config = RecorderConfig::new(format!("tuner{}", n), format!("/dev/tuner{}", n));
                config.quick_tunable = true;
                config.allow_channels = vec![channel.to_string()];
                Arc::new(Recorder::new(config, Arc::new(FakeDevice::streaming()), Arc::new(FakeRunner::default())))
            })
            .collect();
        let scheduler = Arc::new(
            RecordingScheduler::new(
                db.clone(),
                Arc::new(DatabaseGuide::new(db.clone())),
                RecorderPool::new(recorders.clone()),
                Arc::new(OutputPlanner::new(vec![dir.path().to_path_buf()], Arc::new(DiskFreeSpace))),
                Arc::new(FakeWorkers::default()),
                Notifier::new(),
                SchedulerConfig {
                    work_dir: dir.path().join("work"),
                    ..SchedulerConfig::default()
                },
            )
            .with_clock(Arc::new(TokioClock::starting_at(eight_pm()))),
        );

        assert_eq!(scheduler.trigger_pass().await.unwrap(), 2);
        let five = recorders[0].destination().unwrap();
        let seven = recorders[1].destination().unwrap();
        assert_ne!(five, seven);

        let stored = db.lock().await.get_recordings().unwrap();
        assert_eq!(stored.len(), 2);
        for recording in &stored {
            let owners = recorders.iter().filter(|r| r.is_recording_for(recording)).count();
            assert_eq!(owners, 1, "{} written by {} recorders", recording.path.display(), owners);
        }

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_tv_is_preempted() {
        let base = eight_pm();
        let rule = RecordingRule::once("r1", "News", "ep-1", Channel::new("5"));
        let f = fixture(base, Arc::new(FakeDevice::streaming()), rule).await;

        let live = f.dir.path().join("live.ts");
        f.recorder.start_live_tv(Channel::new("5"), live.clone()).unwrap();
        assert!(f.recorder.is_live_tv());

        assert_eq!(f.scheduler.trigger_pass().await.unwrap(), 1);
        assert!(f.recorder.is_recording());
        assert!(!f.recorder.is_live_tv());
        assert_ne!(f.recorder.destination(), Some(live));

        f.recorder.stop_recording().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_recorder_abandoned_after_retries() {
        let base = eight_pm();
        let rule = RecordingRule::once("r1", "News", "ep-1", Channel::new("5"));
        let f = fixture(base, Arc::new(FakeDevice::streaming()), rule.clone()).await;
        let mut notifications = f.notifier.subscribe();

        let resolution = f
            .scheduler
            .resolver
            .resolve(&[rule], base, Duration::from_secs(15))
            .await
            .unwrap();
        let pending = resolution.ready.into_iter().next().unwrap();

        // A scheduled capture grabs the tuner after the resolver pass
        f.recorder
            .start_recording(Channel::new("5"), Some(Duration::from_secs(3600)), f.dir.path().join("other.ts"), false)
            .unwrap();

        let started = tokio::time::Instant::now();
        assert!(!f.scheduler.launch(pending).await.unwrap());
        assert!(started.elapsed() >= Duration::from_secs(15));
        wait_for(&mut notifications, Topic::RecorderBusy).await;
        assert!(f.db.lock().await.get_recordings().unwrap().is_empty());

        f.recorder.stop_recording().await;
    }

    #[tokio::test]
    async fn test_rules_reconciled_on_listing() {
        let rule = RecordingRule::once("r1", "News", "ep-1", Channel::new("5"));
        let f = fixture(eight_pm(), Arc::new(FakeDevice::streaming()), rule).await;
        let mut notifications = f.notifier.subscribe();

        let rules = f.scheduler.list_rules().await.unwrap();
        let names: Vec<&str> = rules[0].tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec![MP4_WORKER, COMMERCIAL_WORKER]);
        assert_eq!(notifications.recv().await.unwrap().topic, Topic::RuleUpdated);

        let stored = f.db.lock().await.get_recording_rule("r1").unwrap().unwrap();
        assert_eq!(stored.tasks, rules[0].tasks);

        // Second listing is a no-op
        f.scheduler.list_rules().await.unwrap();
        assert!(notifications.try_recv().is_err());

        assert!(f.scheduler.remove_rule("News", "r1").await.unwrap());
        assert!(!f.scheduler.remove_rule("News", "r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_recording_goes_through_janitor() {
        let rule = RecordingRule::once("r1", "News", "ep-1", Channel::new("5"));
        let f = fixture(eight_pm(), Arc::new(FakeDevice::streaming()), rule).await;

        let path = f.dir.path().join("old.ts");
        std::fs::write(&path, b"ts").unwrap();
        let id = f.db.lock().await.insert_recording(&Recording::new("Old", &path, eight_pm())).unwrap();

        assert!(f.scheduler.remove_recording(id).await.unwrap());
        assert!(!f.scheduler.remove_recording(id + 100).await.unwrap());
        assert!(path.exists());

        assert_eq!(f.scheduler.run_janitor(false).await, 1);
        assert!(!path.exists());
        assert!(f.db.lock().await.get_recording(id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_janitor_picks_up_removals_flagged_in_database() {
        let rule = RecordingRule::once("r1", "News", "ep-1", Channel::new("5"));
        let f = fixture(eight_pm(), Arc::new(FakeDevice::streaming()), rule).await;

        let path = f.dir.path().join("old.ts");
        std::fs::write(&path, b"ts").unwrap();
        let id = {
            let db = f.db.lock().await;
            let id = db.insert_recording(&Recording::new("Old", &path, eight_pm())).unwrap();
            // As `recording rm` does from a separate process
            assert!(db.mark_recording_for_removal(id).unwrap());
            id
        };

        assert_eq!(f.scheduler.run_janitor(false).await, 1);
        assert!(!path.exists());
        assert!(f.db.lock().await.get_recording(id).unwrap().is_none());
        assert_eq!(f.scheduler.run_janitor(false).await, 0);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let rule = RecordingRule::once("r1", "News", "ep-1", Channel::new("5"));
        let f = fixture(eight_pm(), Arc::new(FakeDevice::streaming()), rule).await;

        assert_eq!(f.scheduler.state().await, SchedulerState::Running);
        f.scheduler.pause().await;
        assert_eq!(f.scheduler.state().await, SchedulerState::Paused);
        f.scheduler.resume().await;
        assert_eq!(f.scheduler.state().await, SchedulerState::Running);

        // Paused: the loop ticks without launching anything
        f.scheduler.pause().await;
        let task = Arc::clone(&f.scheduler).start();
        tokio::task::yield_now().await;
        f.scheduler.stop().await;
        task.await.unwrap();
        assert_eq!(f.scheduler.state().await, SchedulerState::Stopped);
        // Stopped is final
        f.scheduler.resume().await;
        assert_eq!(f.scheduler.state().await, SchedulerState::Stopped);
    }

    #[test]
    fn test_config_from_record() {
        let mut config = SchedulerConfig::default();
        let record = SchedulerConfigRecord {
            tick_interval_secs: 30,
            recheck_interval_secs: 0,
            ..SchedulerConfigRecord::default()
        };
        config.apply_record(&record);
        assert_eq!(config.tick_interval, Duration::from_secs(30));
        assert_eq!(config.recheck_interval, Duration::from_secs(1));
        assert_eq!(config.claim_retry_limit, 15);
    }
}
