//! Four-stage commercial detection pipeline.
//!
//! Silence, black, rating and chapter stages run in sequence and share a
//! [`DetectionReport`]. A stage whose tool fails or prints nothing useful
//! leaves its part of the report empty; the chapter stage works with
//! whatever is there.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use pvr_protocol::Commercial;
use regex::Regex;

use super::commercial::{chapter_file, format_timestamp, infer_from_rating, select_commercials};
use super::detection::{classify, merge, parse_black, parse_silence, Detection};
use super::tool::{ToolCommand, ToolOutput, ToolRunner};
use super::PostprocSettings;
use crate::recorder::job::{Job, JobContext, JobError, JobOutcome, Sequence};

pub const CHAPTER_FILE_NAME: &str = "chapters.txt";
const FRAMES_DIR: &str = "frames";

/// Results accumulated by the stages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionReport {
    pub silence: Option<Vec<Detection>>,
    pub black: Option<Vec<Detection>>,
    /// Seconds at which the rating symbol was seen.
    pub rating_times: Option<Vec<f64>>,
    /// Selected breaks, set by the chapter stage.
    pub commercials: Option<Vec<Commercial>>,
}

pub type SharedReport = Arc<Mutex<DetectionReport>>;

/// Inputs shared by all stages.
struct StageInput {
    input: PathBuf,
    work_dir: PathBuf,
    /// mp4 file that receives the chapters, if any.
    embed_target: Option<PathBuf>,
    settings: Arc<PostprocSettings>,
    runner: Arc<dyn ToolRunner>,
    report: SharedReport,
}

enum ToolRun {
    Output(ToolOutput),
    Unavailable,
    Cancelled,
}

impl StageInput {
    async fn run_tool(&self, ctx: &JobContext, command: ToolCommand) -> ToolRun {
        match self.runner.run(&command, ctx.token()).await {
            Ok(output) => ToolRun::Output(output),
            Err(_) if ctx.is_cancelled() => ToolRun::Cancelled,
            Err(e) => {
                warn!("{}: {} failed: {}", ctx.name(), command.program, e);
                ToolRun::Unavailable
            }
        }
    }

    fn ffmpeg(&self) -> ToolCommand {
        ToolCommand::new(self.settings.ffmpeg.clone()).current_dir(self.work_dir.clone())
    }

    fn input_arg(&self) -> String {
        self.input.display().to_string()
    }
}

/// Build the pipeline for one recording.
pub fn commercial_pipeline(
    input: &Path,
    work_dir: &Path,
    embed_target: Option<PathBuf>,
    settings: Arc<PostprocSettings>,
    runner: Arc<dyn ToolRunner>,
) -> (Sequence, SharedReport) {
    let report: SharedReport = Arc::new(Mutex::new(DetectionReport::default()));
    let shared = Arc::new(StageInput {
        input: input.to_path_buf(),
        work_dir: work_dir.to_path_buf(),
        embed_target,
        settings,
        runner,
        report: Arc::clone(&report),
    });

    let stages: Vec<Arc<dyn Job>> = vec![
        Arc::new(SilenceStage(Arc::clone(&shared))),
        Arc::new(BlackStage(Arc::clone(&shared))),
        Arc::new(RatingStage(Arc::clone(&shared))),
        Arc::new(ChapterStage(shared)),
    ];
    (Sequence::new("commercial", stages), report)
}

struct SilenceStage(Arc<StageInput>);

#[async_trait]
impl Job for SilenceStage {
    fn name(&self) -> &str {
        "silence"
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutcome, JobError> {
        let input = &self.0;
        let command = input
            .ffmpeg()
            .args(["-nostats", "-i"])
            .arg(input.input_arg())
            .args(["-vn", "-af", "silencedetect=noise=-60dB:d=0.3", "-f", "null", "-"]);

        match input.run_tool(&ctx, command).await {
            ToolRun::Output(output) => {
                let detections = parse_silence(&output.text);
                ctx.update(format!("{} silences", detections.len()));
                input.report.lock().silence = Some(detections);
            }
            ToolRun::Unavailable => {}
            ToolRun::Cancelled => return Ok(JobOutcome::Cancelled),
        }
        Ok(JobOutcome::Completed)
    }
}

struct BlackStage(Arc<StageInput>);

#[async_trait]
impl Job for BlackStage {
    fn name(&self) -> &str {
        "black"
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutcome, JobError> {
        let input = &self.0;
        let command = input
            .ffmpeg()
            .args(["-nostats", "-i"])
            .arg(input.input_arg())
            .args(["-an", "-vf", "blackdetect=d=0.1:pix_th=0.10", "-f", "null", "-"]);

        match input.run_tool(&ctx, command).await {
            ToolRun::Output(output) => {
                let detections = parse_black(&output.text);
                ctx.update(format!("{} black frames", detections.len()));
                input.report.lock().black = Some(detections);
            }
            ToolRun::Unavailable => {}
            ToolRun::Cancelled => return Ok(JobOutcome::Cancelled),
        }
        Ok(JobOutcome::Completed)
    }
}

fn frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"frame-(\d+)\.(?:jpg|png)").expect("valid regex"))
}

/// Map detector output naming extracted frames to recording times.
/// Frames are numbered from 1, one every `span_secs`. Frame numbers whose
/// offset does not fit in a `u64` are dropped.
pub fn parse_rating_frames(output: &str, span_secs: u64) -> Vec<f64> {
    let mut times: Vec<f64> = output
        .lines()
        .filter_map(|line| frame_re().captures(line))
        .filter_map(|caps| caps[1].parse::<u64>().ok())
        .filter(|&n| n > 0)
        .filter_map(|n| (n - 1).checked_mul(span_secs))
        .map(|secs| secs as f64)
        .collect();
    times.sort_by(f64::total_cmp);
    times.dedup();
    times
}

struct RatingStage(Arc<StageInput>);

#[async_trait]
impl Job for RatingStage {
    fn name(&self) -> &str {
        "rating"
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutcome, JobError> {
        let input = &self.0;
        let Some(detector) = input.settings.rating_detector.clone() else {
            debug!("No rating detector configured");
            return Ok(JobOutcome::Completed);
        };

        let frames_dir = input.work_dir.join(FRAMES_DIR);
        tokio::fs::create_dir_all(&frames_dir).await?;

        let span = input.settings.rating_span_secs;
        let extract = input
            .ffmpeg()
            .args(["-nostats", "-y", "-i"])
            .arg(input.input_arg())
            .args(["-an", "-vf"])
            .arg(format!("fps=1/{}", span))
            .args(["-q:v", "5"])
            .arg(frames_dir.join("frame-%05d.jpg").display().to_string());
        match input.run_tool(&ctx, extract).await {
            ToolRun::Output(_) => {}
            ToolRun::Unavailable => return Ok(JobOutcome::Completed),
            ToolRun::Cancelled => return Ok(JobOutcome::Cancelled),
        }

        let detect = ToolCommand::new(detector)
            .arg(frames_dir.display().to_string())
            .current_dir(input.work_dir.clone());
        match input.run_tool(&ctx, detect).await {
            ToolRun::Output(output) => {
                let times = parse_rating_frames(&output.text, span);
                ctx.update(format!("{} rating frames", times.len()));
                input.report.lock().rating_times = Some(times);
            }
            ToolRun::Unavailable => {}
            ToolRun::Cancelled => return Ok(JobOutcome::Cancelled),
        }
        Ok(JobOutcome::Completed)
    }
}

struct ChapterStage(Arc<StageInput>);

impl ChapterStage {
    fn reconcile(&self) -> Option<Vec<Commercial>> {
        let mut report = self.0.report.lock();
        let detected = match (&report.silence, &report.black) {
            (Some(silence), Some(black)) => Some(classify(&merge(silence, black))),
            _ => None,
        };
        let rated = report.rating_times.as_deref().map(infer_from_rating);
        let selected = select_commercials(detected, rated);
        report.commercials = selected.clone();
        selected
    }

    /// Copy out one frame at every break boundary for verification.
    async fn extract_reference_frames(&self, ctx: &JobContext, commercials: &[Commercial]) -> bool {
        let input = &self.0;
        for (n, commercial) in commercials.iter().enumerate() {
            for (label, at) in [("start", commercial.start), ("end", commercial.end)] {
                let target = input.work_dir.join(format!("break-{:02}-{}.jpg", n + 1, label));
                let command = input
                    .ffmpeg()
                    .args(["-nostats", "-y", "-ss"])
                    .arg(format_timestamp(at))
                    .arg("-i")
                    .arg(input.input_arg())
                    .args(["-frames:v", "1"])
                    .arg(target.display().to_string());
                if let ToolRun::Cancelled = input.run_tool(ctx, command).await {
                    return false;
                }
            }
        }
        true
    }
}

#[async_trait]
impl Job for ChapterStage {
    fn name(&self) -> &str {
        "chapter"
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutcome, JobError> {
        let input = &self.0;
        let commercials = match self.reconcile() {
            Some(commercials) if !commercials.is_empty() => commercials,
            _ => {
                info!("No commercials found in {}", input.input.display());
                return Ok(JobOutcome::Completed);
            }
        };
        info!("{} commercials found in {}", commercials.len(), input.input.display());

        let chapters = input.work_dir.join(CHAPTER_FILE_NAME);
        tokio::fs::write(&chapters, chapter_file(&commercials)).await?;

        if !self.extract_reference_frames(&ctx, &commercials).await {
            return Ok(JobOutcome::Cancelled);
        }

        let (Some(tool), Some(target)) = (&input.settings.chapter_tool, &input.embed_target) else {
            return Ok(JobOutcome::Completed);
        };
        let command = ToolCommand::new(tool.clone())
            .arg("-chap")
            .arg(chapters.display().to_string())
            .arg(target.display().to_string())
            .current_dir(input.work_dir.clone());
        match input.run_tool(&ctx, command).await {
            ToolRun::Output(output) if !output.success => {
                warn!("Chapter embedding into {} failed: {}", target.display(), output.text.trim())
            }
            ToolRun::Cancelled => return Ok(JobOutcome::Cancelled),
            _ => {}
        }
        Ok(JobOutcome::Completed)
    }
}
