//! Management subcommands.
//!
//! Each command opens the database, acts through an idle scheduler and
//! exits. A running daemon picks up rule and guide changes on its next
//! pass; recording removals are carried out by its janitor.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use clap::{Subcommand, ValueEnum};
use log::info;
use pvr_protocol::{Channel, Recording, RecordingRule, ShowAiring, Task, WorkerInfo};
use tokio::sync::broadcast::error::RecvError;

use pvr_scheduler::database::DatabaseHandle;
use pvr_scheduler::guide::DatabaseGuide;
use pvr_scheduler::notify::Notifier;
use pvr_scheduler::postproc::{LocalWorkers, WorkerError, WorkerRegistry};
use pvr_scheduler::recorder::{RecorderEvent, RecorderPool};
use pvr_scheduler::scheduler::reconcile::reconcile_tasks;
use pvr_scheduler::scheduler::{OutputPlanner, RecordingScheduler, SchedulerConfig};

pub type CommandResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler daemon (the default)
    Run,

    /// Manage recording rules
    Rule {
        #[command(subcommand)]
        action: RuleCommand,
    },

    /// Manage recordings
    Recording {
        #[command(subcommand)]
        action: RecordingCommand,
    },

    /// Manage the local guide
    Guide {
        #[command(subcommand)]
        action: GuideCommand,
    },

    /// Watch a channel on one recorder until Ctrl-C {n}
    /// The recorder must not be in use by a running daemon.
    Live {
        /// Recorder title from the config file
        #[arg(short, long)]
        recorder: String,

        /// Channel number to tune
        #[arg(short, long)]
        channel: String,

        /// File the stream is written to
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
pub enum RuleCommand {
    /// Add a rule, replacing any rule with the same id
    Add {
        #[arg(long)]
        id: String,

        #[arg(long)]
        name: String,

        /// Channel number
        #[arg(long)]
        channel: String,

        /// Channel display name
        #[arg(long)]
        channel_name: Option<String>,

        /// Record the single airing with this show id
        #[arg(long, conflicts_with = "series", required_unless_present = "series")]
        once: Option<String>,

        /// Record every new airing of this series on the channel
        #[arg(long)]
        series: Option<String>,

        /// Enable a post-processing task by worker name (repeatable)
        #[arg(long = "task")]
        tasks: Vec<String>,
    },

    /// Remove a rule
    Rm {
        #[arg(long)]
        name: String,

        #[arg(long)]
        id: String,
    },

    /// List rules
    Ls {
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

#[derive(Debug, Subcommand)]
pub enum RecordingCommand {
    /// List recordings, newest first
    Ls {
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Queue a recording and its files for removal
    Rm { id: i64 },
}

#[derive(Debug, Subcommand)]
pub enum GuideCommand {
    /// Load airings from a JSON array file into the guide
    Import { file: PathBuf },

    /// Show the guide channels each recorder accepts
    Channels {
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

/// Worker registry for a scheduler that never runs a pass.
struct DetachedWorkers;

#[async_trait]
impl WorkerRegistry for DetachedWorkers {
    fn workers(&self) -> Vec<WorkerInfo> {
        LocalWorkers::builtin()
    }

    async fn add_processing(&self, _worker: &str, _recording: &Recording) -> Result<(), WorkerError> {
        Err(WorkerError::QueueClosed)
    }
}

/// Scheduler used by management commands; it is never started.
pub fn idle_scheduler(database: DatabaseHandle, recorders: RecorderPool, planner: Arc<OutputPlanner>) -> RecordingScheduler {
    RecordingScheduler::new(
        database.clone(),
        Arc::new(DatabaseGuide::new(database)),
        recorders,
        planner,
        Arc::new(DetachedWorkers),
        Notifier::new(),
        SchedulerConfig::default(),
    )
}

/// Build the task list of a new rule with the named tasks enabled.
fn enable_tasks(rule: &RecordingRule, names: &[String]) -> Result<Vec<Task>, String> {
    let mut tasks = reconcile_tasks(rule, &LocalWorkers::builtin()).unwrap_or_else(|| rule.tasks.clone());
    for name in names {
        let task = tasks
            .iter_mut()
            .find(|task| &task.name == name)
            .ok_or_else(|| format!("Unknown task: {}", name))?;
        task.enabled = true;
    }
    Ok(tasks)
}

pub async fn rule(scheduler: &RecordingScheduler, action: RuleCommand) -> CommandResult {
    match action {
        RuleCommand::Add {
            id,
            name,
            channel,
            channel_name,
            once,
            series,
            tasks,
        } => {
            let channel = match channel_name {
                Some(display) => Channel::named(channel, display),
                None => Channel::new(channel),
            };
            let mut rule = match (once, series) {
                (Some(show_id), _) => RecordingRule::once(id, name, show_id, channel),
                (None, Some(series_id)) => RecordingRule::series(id, name, series_id, channel),
                (None, None) => return Err("either --once or --series is required".into()),
            };
            rule.tasks = enable_tasks(&rule, &tasks)?;
            let id = rule.id.clone();
            scheduler.add_rule(rule).await?;
            println!("Stored rule {}", id);
        }
        RuleCommand::Rm { name, id } => {
            if !scheduler.remove_rule(&name, &id).await? {
                return Err(format!("No rule {} named {:?}", id, name).into());
            }
            println!("Removed rule {}", id);
        }
        RuleCommand::Ls { format } => {
            let rules = scheduler.list_rules().await?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rules)?),
                OutputFormat::Table => {
                    println!("{:<16} {:<7} {:<24} {:<10} {:<16} TASKS", "ID", "KIND", "NAME", "CHANNEL", "SHOW/SERIES");
                    for rule in &rules {
                        let target = rule.show_id.as_deref().or(rule.series_id.as_deref()).unwrap_or("-");
                        let tasks: Vec<&str> = rule.enabled_tasks().map(|t| t.name.as_str()).collect();
                        println!(
                            "{:<16} {:<7} {:<24} {:<10} {:<16} {}",
                            rule.id,
                            rule.kind.as_str(),
                            rule.name,
                            rule.channel.number,
                            target,
                            tasks.join(",")
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

pub async fn recording(scheduler: &RecordingScheduler, database: &DatabaseHandle, action: RecordingCommand) -> CommandResult {
    match action {
        RecordingCommand::Ls { format } => {
            let recordings = database.lock().await.get_recordings()?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&recordings)?),
                OutputFormat::Table => {
                    println!("{:>6} {:<16} {:>8} {:<32} PATH", "ID", "START", "MINUTES", "TITLE");
                    for rec in &recordings {
                        let marker = if rec.current_recording { " (recording)" } else { "" };
                        println!(
                            "{:>6} {:<16} {:>8} {:<32} {}{}",
                            rec.id,
                            rec.real_start.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
                            rec.duration_secs / 60,
                            rec.title,
                            rec.path.display(),
                            marker
                        );
                    }
                }
            }
        }
        RecordingCommand::Rm { id } => {
            if !scheduler.remove_recording(id).await? {
                return Err(format!("No recording {}", id).into());
            }
            println!("Recording {} queued for removal", id);
        }
    }
    Ok(())
}

/// Store every airing of a JSON array. Returns the number stored.
pub async fn import_guide(database: &DatabaseHandle, json: &[u8]) -> Result<usize, Box<dyn std::error::Error>> {
    let airings: Vec<ShowAiring> = serde_json::from_slice(json)?;
    let db = database.lock().await;
    for airing in &airings {
        db.upsert_show_airing(airing)?;
    }
    Ok(airings.len())
}

pub async fn guide(database: &DatabaseHandle, recorders: &RecorderPool, action: GuideCommand) -> CommandResult {
    match action {
        GuideCommand::Import { file } => {
            let json = tokio::fs::read(&file).await?;
            let count = import_guide(database, &json).await?;
            println!("Imported {} airing(s) from {}", count, file.display());
        }
        GuideCommand::Channels { format } => {
            let channels = database.lock().await.get_guide_channels()?;
            let per_recorder: Vec<(String, Vec<Channel>)> = recorders
                .all()
                .iter()
                .map(|r| (r.title().to_string(), r.custom_channels(&channels)))
                .collect();
            match format {
                OutputFormat::Json => {
                    let value: serde_json::Map<String, serde_json::Value> = per_recorder
                        .into_iter()
                        .map(|(title, channels)| serde_json::to_value(channels).map(|value| (title, value)))
                        .collect::<Result<_, serde_json::Error>>()?;
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
                OutputFormat::Table => {
                    for (title, channels) in per_recorder {
                        let list: Vec<String> = channels.iter().map(Channel::to_string).collect();
                        println!("{}: {}", title, list.join(", "));
                    }
                }
            }
        }
    }
    Ok(())
}

pub async fn live(recorders: &RecorderPool, title: &str, channel: String, output: PathBuf) -> CommandResult {
    let recorder = recorders
        .get(title)
        .ok_or_else(|| format!("No recorder titled {:?}", title))?;
    let mut events = recorder.subscribe();
    recorder.start_live_tv(Channel::new(channel), output.clone())?;
    info!("Live TV on {} into {}, Ctrl-C to stop", recorder.title(), output.display());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                recorder.stop_live_tv().await;
                break;
            }
            event = events.recv() => match event {
                Ok(RecorderEvent::RecordingStopped { result, .. }) => {
                    info!("Live TV on {} ended: {:?}", recorder.title(), result);
                    result?;
                    break;
                }
                Ok(RecorderEvent::RecordingStarted { .. }) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}
