//! The child-process runner boundary.
//!
//! spec.md §1 places "the child-process runner that actually executes the
//! Terraform binary" out of scope for the core, but the core still owns
//! the narrow interface that boundary must satisfy: given a module's
//! [`Options`], run its command and report back captured output plus an
//! exit status. [`CommandRunner`] is that interface; [`ProcessRunner`] is a
//! concrete default implementation, grounded in the teacher's
//! `provider::local::LocalSandbox::exec_stream` (spawn via
//! `tokio::process::Command`, stream stdout/stderr line-by-line through
//! `tokio_stream::wrappers::LinesStream`).

pub mod process;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RunnerError;
use crate::module::Options;

pub use process::ProcessRunner;

/// Output captured from a single module command invocation.
#[derive(Debug, Clone, Default)]
pub struct RunnerOutput {
    pub combined_output: String,
    pub exit_status: Option<i32>,
}

/// Invoked once per output line as a module's command runs, so the
/// executor's periodic "still running" flusher has something to show
/// before the command finishes. Modeled on the teacher's
/// `orchestrator::OutputCallback` (`Arc<dyn Fn(&str, OutputLine) + Send +
/// Sync>`), narrowed to a single combined stream since the core doesn't
/// distinguish stdout from stderr for replay purposes.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Executes a module's command body. Implementations decide what
/// "the command" means (e.g. `terragrunt plan`, `terragrunt apply
/// -auto-approve`) based on `options.extra_args` and the subcommand baked
/// into the concrete runner.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        options: &Options,
        on_line: Option<&OutputCallback>,
    ) -> Result<RunnerOutput, RunnerError>;
}
