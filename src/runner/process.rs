//! Default [`CommandRunner`](super::CommandRunner): spawns the configured
//! Terraform/Terragrunt binary as a child process and captures its output.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::RunnerError;
use crate::module::Options;
use crate::runner::{CommandRunner, OutputCallback, RunnerOutput};

/// Runs a module's command by spawning `binary subcommand <extra args>`
/// in `options.working_dir`.
pub struct ProcessRunner {
    /// Path to the Terraform/Terragrunt executable.
    binary: PathBuf,
    /// Subcommand to invoke (`plan`, `apply`, `destroy`, `output`).
    subcommand: String,
}

impl ProcessRunner {
    pub fn new(binary: impl Into<PathBuf>, subcommand: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            subcommand: subcommand.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        options: &Options,
        on_line: Option<&OutputCallback>,
    ) -> Result<RunnerOutput, RunnerError> {
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .arg(&self.subcommand)
            .args(&options.extra_args)
            .current_dir(&options.working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| RunnerError {
            module_path: options.working_dir.clone(),
            message: format!("failed to spawn {}: {e}", self.binary.display()),
            exit_status: None,
            combined_output: String::new(),
        })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let stdout_lines = tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
            .map(|line| line.unwrap_or_default());
        let stderr_lines = tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
            .map(|line| line.unwrap_or_default());
        let mut combined = stream::select(stdout_lines, stderr_lines);

        let mut combined_output = String::new();
        while let Some(line) = combined.next().await {
            if let Some(cb) = on_line {
                cb(&line);
            }
            combined_output.push_str(&line);
            combined_output.push('\n');
        }

        let status = child.wait().await.map_err(|e| RunnerError {
            module_path: options.working_dir.clone(),
            message: format!("failed to wait on {}: {e}", self.binary.display()),
            exit_status: None,
            combined_output: combined_output.clone(),
        })?;

        let exit_status = status.code();

        if !status.success() {
            return Err(RunnerError {
                module_path: options.working_dir.clone(),
                message: format!(
                    "{} {} exited with status {:?}",
                    self.binary.display(),
                    self.subcommand,
                    exit_status
                ),
                exit_status,
                combined_output,
            });
        }

        Ok(RunnerOutput {
            combined_output,
            exit_status,
        })
    }
}
