//! ts to mp4 remux.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use super::tool::{ToolCommand, ToolRunner};
use crate::recorder::job::{Job, JobContext, JobError, JobOutcome};

/// Extension of the indexed sibling file.
pub const MP4_EXTENSION: &str = "mp4";

/// Remuxes a capture into an mp4 sibling without re-encoding.
pub struct Mp4Indexer {
    ffmpeg: String,
    input: PathBuf,
    output: PathBuf,
    runner: Arc<dyn ToolRunner>,
}

impl Mp4Indexer {
    pub fn new(ffmpeg: impl Into<String>, input: impl Into<PathBuf>, runner: Arc<dyn ToolRunner>) -> Self {
        let input = input.into();
        let output = input.with_extension(MP4_EXTENSION);
        Self { ffmpeg: ffmpeg.into(), input, output, runner }
    }

    pub fn output(&self) -> &PathBuf {
        &self.output
    }
}

#[async_trait]
impl Job for Mp4Indexer {
    fn name(&self) -> &str {
        "mp4"
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutcome, JobError> {
        let command = ToolCommand::new(self.ffmpeg.clone())
            .args(["-nostats", "-y", "-i"])
            .arg(self.input.display().to_string())
            .args(["-map", "0:v?", "-map", "0:a?", "-c", "copy", "-movflags", "+faststart"])
            .arg(self.output.display().to_string());

        let output = match self.runner.run(&command, ctx.token()).await {
            Ok(output) => output,
            Err(_) if ctx.is_cancelled() => return Ok(JobOutcome::Cancelled),
            Err(e) => return Err(e.into()),
        };

        // ffmpeg may exit 0 with an empty file on a broken input
        let size = tokio::fs::metadata(&self.output).await.map(|m| m.len()).unwrap_or(0);
        if !output.success || size == 0 {
            return Err(JobError::Failed(format!(
                "remux of {} failed ({} bytes written)",
                self.input.display(),
                size
            )));
        }

        info!("Indexed {} -> {} ({} bytes)", self.input.display(), self.output.display(), size);
        Ok(JobOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postproc::tool::testing::FakeRunner;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_indexer_requires_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("show.ts");
        let runner = Arc::new(FakeRunner::default());
        let indexer = Mp4Indexer::new("ffmpeg", &input, runner.clone());
        assert_eq!(indexer.output(), &dir.path().join("show.mp4"));

        // Tool "succeeds" but writes nothing
        let err = indexer.run(JobContext::detached(CancellationToken::new())).await.unwrap_err();
        assert!(matches!(err, JobError::Failed(_)));

        std::fs::write(dir.path().join("show.mp4"), b"ftyp").unwrap();
        let outcome = indexer.run(JobContext::detached(CancellationToken::new())).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let calls = runner.calls.lock();
        assert!(calls[0].args.contains(&"+faststart".to_string()));
    }
}
