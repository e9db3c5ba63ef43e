//! External tool invocation.
//!
//! Analysis tools are run to completion and their whole output is
//! returned as text. The exit status is reported but callers decide
//! themselves whether the output is usable.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Tool error types.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} did not finish within {secs}s")]
    Timeout { program: String, secs: u64 },

    #[error("{0} was cancelled")]
    Cancelled(String),

    #[error("I/O error while waiting for tool: {0}")]
    Io(#[from] io::Error),
}

/// A command line with an optional working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new(), working_dir: None }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// stdout followed by stderr.
    pub text: String,
}

/// Runs external tools.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, command: &ToolCommand, cancel: &CancellationToken) -> Result<ToolOutput, ToolError>;
}

/// Runs tools as child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout) }
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, command: &ToolCommand, cancel: &CancellationToken) -> Result<ToolOutput, ToolError> {
        debug!("Running: {}", command);

        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| ToolError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        // Dropping the wait future kills the child
        let wait = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                    .await
                    .map_err(|_| ToolError::Timeout {
                        program: command.program.clone(),
                        secs: limit.as_secs(),
                    })?
                    .map_err(ToolError::Io),
                None => child.wait_with_output().await.map_err(ToolError::Io),
            }
        };

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(ToolError::Cancelled(command.program.clone())),
            output = wait => output?,
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            warn!("{} exited with {}", command.program, output.status);
        }

        Ok(ToolOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            text,
        })
    }
}

/// Substitute `{name}` placeholders in an argument template.
pub fn expand_template(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Runner returning canned output per program name and recording every call.
    #[derive(Default)]
    pub struct FakeRunner {
        pub outputs: Mutex<Vec<(String, ToolOutput)>>,
        pub calls: Mutex<Vec<ToolCommand>>,
    }

    impl FakeRunner {
        pub fn respond(&self, program: &str, text: &str) {
            self.outputs.lock().push((
                program.to_string(),
                ToolOutput { success: true, exit_code: Some(0), text: text.to_string() },
            ));
        }

        pub fn fail(&self, program: &str) {
            self.outputs.lock().push((
                program.to_string(),
                ToolOutput { success: false, exit_code: Some(1), text: String::new() },
            ));
        }

        pub fn programs(&self) -> Vec<String> {
            self.calls.lock().iter().map(|c| c.program.clone()).collect()
        }
    }

    #[async_trait]
    impl ToolRunner for FakeRunner {
        async fn run(&self, command: &ToolCommand, _cancel: &CancellationToken) -> Result<ToolOutput, ToolError> {
            self.calls.lock().push(command.clone());
            let outputs = self.outputs.lock();
            Ok(outputs
                .iter()
                .find(|(program, _)| program == &command.program)
                .map(|(_, output)| output.clone())
                .unwrap_or(ToolOutput { success: true, exit_code: Some(0), text: String::new() }))
        }
    }
}
