//! Channel tuning stage.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use pvr_protocol::Channel;

use super::job::{Job, JobContext, JobError, JobOutcome};
use crate::postproc::tool::{expand_template, ToolCommand, ToolRunner};

/// Time given to the tuner to lock onto a new channel.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(2);

/// Runs the recorder's tune command, then waits for the signal to settle.
pub struct TuneJob {
    device: PathBuf,
    channel: Channel,
    command: Option<Vec<String>>,
    quick_tunable: bool,
    settle: Duration,
    runner: Arc<dyn ToolRunner>,
}

impl TuneJob {
    pub fn new(
        device: impl Into<PathBuf>,
        channel: Channel,
        command: Option<Vec<String>>,
        quick_tunable: bool,
        runner: Arc<dyn ToolRunner>,
    ) -> Self {
        Self {
            device: device.into(),
            channel,
            command,
            quick_tunable,
            settle: DEFAULT_SETTLE,
            runner,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn tool_command(&self) -> Option<ToolCommand> {
        let template = self.command.as_ref()?;
        let device = self.device.display().to_string();
        let args = expand_template(template, &[("device", &device), ("channel", &self.channel.number)]);
        let (program, rest) = args.split_first()?;
        Some(ToolCommand::new(program.clone()).args(rest.iter().cloned()))
    }
}

#[async_trait]
impl Job for TuneJob {
    fn name(&self) -> &str {
        "tune"
    }

    async fn run(&self, ctx: JobContext) -> Result<JobOutcome, JobError> {
        let Some(command) = self.tool_command() else {
            debug!("No tune command for {}, capturing current channel", self.device.display());
            return Ok(JobOutcome::Completed);
        };

        info!("Tuning {} to channel {}", self.device.display(), self.channel);
        let output = match self.runner.run(&command, ctx.token()).await {
            Ok(output) => output,
            Err(_) if ctx.is_cancelled() => return Ok(JobOutcome::Cancelled),
            Err(e) => return Err(JobError::Tool(e)),
        };
        if !output.success {
            return Err(JobError::Tune(format!(
                "{} exited with {:?}: {}",
                command.program,
                output.exit_code,
                output.text.trim()
            )));
        }

        if self.quick_tunable {
            return Ok(JobOutcome::Completed);
        }

        tokio::select! {
            _ = ctx.cancelled() => Ok(JobOutcome::Cancelled),
            _ = tokio::time::sleep(self.settle) => Ok(JobOutcome::Completed),
        }
    }
}
