//! pvr-scheduler: recording scheduler daemon.
//!
//! Without a subcommand (or with `run`) the daemon decides what to record
//! from the stored rules and the guide, drives the configured tuners and
//! hands finished captures to the post-processing workers. The `rule`,
//! `recording`, `guide` and `live` subcommands manage the same database.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

mod commands;

use commands::Command;
use pvr_scheduler::config::{load_config, resolve_config_path, ConfigFile};
use pvr_scheduler::database::{Database, DatabaseHandle, SchedulerConfigRecord};
use pvr_scheduler::guide::DatabaseGuide;
use pvr_scheduler::logging;
use pvr_scheduler::notify::Notifier;
use pvr_scheduler::postproc::tool::ProcessRunner;
use pvr_scheduler::postproc::{LocalWorkers, PostprocSettings};
use pvr_scheduler::recorder::{FileDeviceSource, RecorderPool, WatchdogPolicy};
use pvr_scheduler::scheduler::{DiskFreeSpace, OutputPlanner, RecordingScheduler, SchedulerConfig};

const DEFAULT_DATABASE: &str = "pvr-scheduler.db";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_RETENTION_DAYS: u64 = 7;
/// Limit on tune commands run before a capture.
const TUNE_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// pvr-scheduler - Recording scheduler and recorder orchestration daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Path to the database file
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Directory where log files are stored
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Number of days to keep log files
    #[arg(long)]
    log_retention_days: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Scheduling pass interval in seconds
    #[arg(long)]
    tick_interval: Option<u64>,

    /// Directory watched for recorded.txt imports
    #[arg(long)]
    import_dir: Option<PathBuf>,

    /// Start with scheduling paused (housekeeping and workers still run)
    #[arg(long)]
    no_schedule: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

/// Scheduler timing seeded from the config file and the command line.
fn seed_record(args: &Args, file_config: &ConfigFile) -> SchedulerConfigRecord {
    let defaults = SchedulerConfigRecord::default();
    let section = &file_config.scheduler;
    SchedulerConfigRecord {
        tick_interval_secs: args
            .tick_interval
            .or(section.tick_interval_secs)
            .unwrap_or(defaults.tick_interval_secs),
        recheck_interval_secs: section.recheck_interval_secs.unwrap_or(defaults.recheck_interval_secs),
        claim_retry_limit: section.claim_retry_limit.unwrap_or(defaults.claim_retry_limit),
        claim_retry_backoff_ms: section.claim_retry_backoff_ms.unwrap_or(defaults.claim_retry_backoff_ms),
        watchdog_check_interval_ms: file_config
            .watchdog
            .check_interval_ms
            .unwrap_or(defaults.watchdog_check_interval_ms),
        watchdog_failure_threshold: file_config
            .watchdog
            .failure_threshold
            .unwrap_or(defaults.watchdog_failure_threshold),
    }
}

/// Recording directories from the config, the working directory when none.
fn recording_dirs(file_config: &ConfigFile) -> Vec<PathBuf> {
    if file_config.storage.recording_dirs.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        file_config.storage.recording_dirs.clone()
    }
}

/// Build the `[[recorder]]` pool with the stored watchdog policy.
fn recorder_pool(file_config: &ConfigFile, record: &SchedulerConfigRecord) -> RecorderPool {
    let watchdog = WatchdogPolicy {
        check_interval: Duration::from_millis(record.watchdog_check_interval_ms.max(1)),
        failure_threshold: record.watchdog_failure_threshold,
    };
    RecorderPool::from_settings(
        &file_config.recorders,
        watchdog,
        Arc::new(FileDeviceSource),
        Arc::new(ProcessRunner::with_timeout(TUNE_COMMAND_TIMEOUT)),
    )
}

fn init_logging(args: &Args, file_config: &ConfigFile) {
    // Merge logging configs (command line takes precedence)
    let log_dir = args
        .log_dir
        .clone()
        .or_else(|| file_config.logging.log_dir.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
    let log_retention_days = args
        .log_retention_days
        .or(file_config.logging.retention_days)
        .unwrap_or(DEFAULT_RETENTION_DAYS);
    let log_level = file_config.logging.level.as_deref();
    logging::init_logging(&log_dir, log_retention_days, args.verbose, log_level)
        .expect("Failed to initialize logging");
}

/// Wait for Ctrl-C or SIGTERM. On Unix, SIGUSR1 pauses scheduling and
/// SIGUSR2 resumes it.
async fn wait_for_shutdown(scheduler: &RecordingScheduler) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut pause = signal(SignalKind::user_defined1())?;
        let mut resume = signal(SignalKind::user_defined2())?;
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => return result,
                _ = terminate.recv() => return Ok(()),
                _ = pause.recv() => scheduler.pause().await,
                _ = resume.recv() => scheduler.resume().await,
            }
            info!("Scheduler state: {:?}", scheduler.state().await);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = scheduler;
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let mut args = Args::parse();
    let command = args.command.take().unwrap_or(Command::Run);

    // Load config file: explicit path > auto-detect > default
    let file_config = match resolve_config_path(args.config.as_deref()) {
        Some(path) => match load_config(&path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e.into());
            }
        },
        None => ConfigFile::default(),
    };

    let db_path = args
        .database
        .clone()
        .or_else(|| file_config.database.path.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE));

    match command {
        Command::Run => {
            init_logging(&args, &file_config);
            run_daemon(&args, &file_config, &db_path).await
        }
        Command::Live { recorder, channel, output } => {
            init_logging(&args, &file_config);
            let record = Database::open(&db_path)?.get_scheduler_config(&seed_record(&args, &file_config))?;
            let recorders = recorder_pool(&file_config, &record);
            commands::live(&recorders, &recorder, channel, output).await
        }
        Command::Rule { action } => {
            let (_, _, scheduler) = open_management(&args, &file_config, &db_path)?;
            commands::rule(&scheduler, action).await
        }
        Command::Recording { action } => {
            let (db, _, scheduler) = open_management(&args, &file_config, &db_path)?;
            commands::recording(&scheduler, &db, action).await
        }
        Command::Guide { action } => {
            let (db, recorders, _) = open_management(&args, &file_config, &db_path)?;
            commands::guide(&db, &recorders, action).await
        }
    }
}

/// Database, recorders and an idle scheduler for management commands.
fn open_management(
    args: &Args,
    file_config: &ConfigFile,
    db_path: &Path,
) -> Result<(DatabaseHandle, RecorderPool, RecordingScheduler), Box<dyn std::error::Error>> {
    let db = Database::open(db_path)?.into_handle();
    let recorders = recorder_pool(file_config, &seed_record(args, file_config));
    let planner = Arc::new(OutputPlanner::new(recording_dirs(file_config), Arc::new(DiskFreeSpace)));
    let scheduler = commands::idle_scheduler(db.clone(), recorders.clone(), planner);
    Ok((db, recorders, scheduler))
}

async fn run_daemon(args: &Args, file_config: &ConfigFile, db_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize database
    info!("Opening database: {:?}", db_path);
    let db = match Database::open(db_path) {
        Ok(db) => db,
        Err(e) => {
            error!("Failed to open database: {}", e);
            return Err(e.into());
        }
    };
    let stale = db.clear_stale_current_recordings()?;
    if stale > 0 {
        warn!("Cleared {} recording(s) left current by a previous run", stale);
    }

    // Stored timing wins over the seed, except for an explicit --tick-interval
    let seed = seed_record(args, file_config);
    let mut record = match db.get_scheduler_config(&seed) {
        Ok(record) => record,
        Err(e) => {
            warn!("Failed to load scheduler config from database: {}", e);
            seed.clone()
        }
    };
    if let Some(tick) = args.tick_interval {
        if record.tick_interval_secs != tick {
            record.tick_interval_secs = tick;
            db.update_scheduler_config(&record)?;
        }
    }
    info!(
        "Loaded scheduler config: tick={}s, recheck={}s, claim_retry={}x{}ms, watchdog={}ms/{}",
        record.tick_interval_secs,
        record.recheck_interval_secs,
        record.claim_retry_limit,
        record.claim_retry_backoff_ms,
        record.watchdog_check_interval_ms,
        record.watchdog_failure_threshold
    );
    let db = db.into_handle();

    let notifier = Notifier::new();
    if stale > 0 {
        notifier.send_message(pvr_protocol::Topic::RecordingUpdated);
    }
    match file_config.notify.webhook_url.clone() {
        #[cfg(feature = "webhook")]
        Some(url) => {
            info!("Forwarding notifications to {}", url);
            let forwarder = pvr_scheduler::notify::WebhookForwarder::new(url);
            tokio::spawn(forwarder.run(notifier.subscribe()));
        }
        #[cfg(not(feature = "webhook"))]
        Some(_) => warn!("webhook_url is set but the webhook feature is disabled"),
        None => {}
    }

    // Recorders
    let recorders = recorder_pool(file_config, &record);
    if recorders.is_empty() {
        warn!("No [[recorder]] configured; nothing will be captured");
    }

    // Post-processing workers
    let postproc = PostprocSettings::from_section(&file_config.postproc);
    match postproc.tool_timeout {
        Some(limit) => info!("Post-processing tools time out after {}s", limit.as_secs()),
        None => info!("Post-processing tools run without a time limit"),
    }
    let workers_cancel = CancellationToken::new();
    let (workers, workers_task) = LocalWorkers::spawn(
        postproc.clone(),
        Arc::new(postproc.runner()),
        db.clone(),
        notifier.clone(),
        workers_cancel.clone(),
    );

    // Output directories
    let recording_dirs = recording_dirs(file_config);
    for dir in &recording_dirs {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!("Cannot create recording directory {}: {}", dir.display(), e);
        }
    }
    let planner = Arc::new(OutputPlanner::new(recording_dirs, Arc::new(DiskFreeSpace)));

    // Scheduler
    let section = &file_config.scheduler;
    let mut config = SchedulerConfig {
        import_dir: args.import_dir.clone().or_else(|| file_config.storage.import_dir.clone()),
        work_dir: postproc.work_dir.clone(),
        default_indexer: Some(postproc.default_indexer.clone()).filter(|name| !name.is_empty()),
        ..SchedulerConfig::default()
    };
    config.apply_record(&record);
    config.lookahead = section
        .lookahead_secs
        .map(Duration::from_secs)
        .unwrap_or(config.tick_interval);
    if let Some(secs) = section.reconcile_interval_secs {
        config.reconcile_interval = Duration::from_secs(secs.max(1));
    }
    if let Some(secs) = section.janitor_interval_secs {
        config.janitor_interval = Duration::from_secs(secs.max(1));
    }
    if let Some(secs) = section.import_interval_secs {
        config.import_interval = Duration::from_secs(secs.max(1));
    }

    info!("pvr-scheduler starting...");
    info!("  Database: {:?}", db_path);
    info!("  Recorders: {}", recorders.len());
    info!("  Recording dirs: {:?}", planner.dirs());
    if let Some(dir) = &config.import_dir {
        info!("  Import dir: {}", dir.display());
    }

    let scheduler = Arc::new(RecordingScheduler::new(
        db.clone(),
        Arc::new(DatabaseGuide::new(db.clone())),
        recorders,
        planner,
        workers,
        notifier,
        config,
    ));
    if args.no_schedule {
        info!("Scheduling paused (--no-schedule)");
        scheduler.pause().await;
    }
    let scheduler_handle = Arc::clone(&scheduler).start();

    wait_for_shutdown(&scheduler).await?;
    info!("Shutting down...");

    scheduler.shutdown().await;
    if let Err(e) = scheduler_handle.await {
        error!("Scheduler task failed: {}", e);
    }
    workers_cancel.cancel();
    if let Err(e) = workers_task.await {
        error!("Worker task failed: {}", e);
    }

    info!("pvr-scheduler stopped");
    Ok(())
}
