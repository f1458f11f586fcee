//! `terrastack` CLI, wiring the Module Resolver, Graph Builder, and DAG
//! Executor together behind the `plan-all` / `apply-all` / `destroy-all` /
//! `output-all` / `run-all` subcommands (spec.md §6).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use terrastack::approval::{InteractiveApprovalHandler, NonInteractiveApprovalHandler};
use terrastack::config::TomlConfigLoader;
use terrastack::error::{DefaultAggregator, ErrorAggregator, PlanAggregator};
use terrastack::executor::DependencyOrder;
use terrastack::graph::Stack;
use terrastack::module::Options;
use terrastack::resolver;
use terrastack::runner::ProcessRunner;

#[derive(Parser)]
#[command(name = "terrastack")]
#[command(about = "Dependency-aware concurrent executor for Terraform/Terragrunt-style module stacks", long_about = None)]
#[command(version)]
struct Cli {
    /// Config-file paths to run, one per module (each module's
    /// `terragrunt.toml`), relative or absolute.
    #[arg(long = "config-paths", required = true, num_args = 1..)]
    config_paths: Vec<PathBuf>,

    /// Root used for relative-path rendering in JSON/summary output.
    /// Defaults to the current directory.
    #[arg(long = "working-dir")]
    working_dir: Option<PathBuf>,

    /// Path to the Terraform/Terragrunt executable to invoke per module.
    #[arg(long = "terragrunt-binary", default_value = "terraform")]
    binary: PathBuf,

    /// Run without prompting for external-dependency approval; always
    /// assumes "already applied".
    #[arg(long = "terragrunt-non-interactive")]
    non_interactive: bool,

    /// Run every module regardless of upstream failures.
    #[arg(long = "terragrunt-ignore-dependency-errors")]
    ignore_dependency_errors: bool,

    /// Maximum modules running concurrently. Defaults to the module count.
    #[arg(long = "terragrunt-workers")]
    workers: Option<usize>,

    /// Re-verify Terraform-source-directory presence when resolving
    /// runnability.
    #[arg(long = "terragrunt-check-source-folders")]
    check_source_folders: bool,

    /// Debug-level logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,

    /// Extra args forwarded verbatim to each module's command, e.g.
    /// `-detailed-exitcode`, `-auto-approve`, `-no-color`.
    #[arg(last = true)]
    terraform_args: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run `plan` over every module.
    PlanAll,
    /// Run `apply` over every module, dependencies before dependents.
    ApplyAll,
    /// Run `destroy` over every module, dependents before dependencies.
    DestroyAll,
    /// Run `output` over every module.
    OutputAll,
    /// Run an arbitrary Terraform subcommand over every module.
    RunAll {
        /// The Terraform subcommand, e.g. `validate`, `fmt`.
        command: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("installing tracing subscriber")?;

    let working_dir = match &cli.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("determining current directory")?,
    };

    let approval_handler: Arc<dyn terrastack::approval::ApprovalHandler> = if cli.non_interactive {
        Arc::new(NonInteractiveApprovalHandler)
    } else {
        Arc::new(InteractiveApprovalHandler::new())
    };

    let options_template = Options {
        extra_args: cli.terraform_args.clone(),
        working_dir: working_dir.clone(),
        logger: tracing::Span::none(),
        writer: Arc::new(std::sync::Mutex::new(std::io::stdout())),
        error_writer: Arc::new(std::sync::Mutex::new(std::io::stderr())),
        worker_count: cli.workers,
        ignore_dependency_errors: cli.ignore_dependency_errors,
        refresh_output_delay: Duration::from_secs(10),
        non_interactive: cli.non_interactive,
        approval_handler,
        check_source_folders: cli.check_source_folders,
    };

    let loader = TomlConfigLoader;
    let resolved = resolver::resolve(&cli.config_paths, &options_template, &loader)
        .context("resolving modules")?;

    let stack = Stack::from_resolved(resolved, working_dir)
        .context("building dependency graph")?;

    info!(modules = stack.modules.len(), "resolved module stack");

    let detailed_exitcode = cli.terraform_args.iter().any(|a| a == "-detailed-exitcode");

    let exit_code = match cli.command {
        Commands::PlanAll => {
            let runner = ProcessRunner::new(cli.binary.clone(), "plan");
            let aggregator: Box<dyn ErrorAggregator> =
                if detailed_exitcode { Box::new(PlanAggregator) } else { Box::new(DefaultAggregator) };
            let report = stack.plan(&runner, aggregator.as_ref()).await;
            print_summary(&stack, &report.execution);
            match &report.execution.error {
                Some(_) => report.execution.exit_status.unwrap_or(1),
                None if report.changes_with_no_errors() => {
                    info!("plan completed with changes in one or more modules");
                    terrastack::summary::CHANGE_EXIT_CODE
                }
                None => 0,
            }
        }
        Commands::ApplyAll => {
            run_generic(&stack, &cli.binary, "apply", DependencyOrder::Normal).await
        }
        Commands::DestroyAll => {
            run_generic(&stack, &cli.binary, "destroy", DependencyOrder::Reverse).await
        }
        Commands::OutputAll => {
            let runner = ProcessRunner::new(cli.binary.clone(), "output");
            let report = stack.output(&runner, &DefaultAggregator).await;
            print_summary(&stack, &report);
            exit_code_for(&report)
        }
        Commands::RunAll { command } => {
            run_generic(&stack, &cli.binary, &command, DependencyOrder::Normal).await
        }
    };

    std::process::exit(exit_code);
}

async fn run_generic(
    stack: &Stack,
    binary: &PathBuf,
    subcommand: &str,
    order: DependencyOrder,
) -> i32 {
    let runner = ProcessRunner::new(binary.clone(), subcommand);
    let report = stack.run_all(&runner, None, order, &DefaultAggregator).await;
    print_summary(stack, &report);
    exit_code_for(&report)
}

fn exit_code_for(report: &terrastack::executor::ExecutionReport) -> i32 {
    match &report.error {
        None => 0,
        Some(_) => report.exit_status.unwrap_or(1),
    }
}

/// Post-run summary: one line per module with its status and error, if
/// any (spec.md §7 user-visible failure behavior).
fn print_summary(stack: &Stack, report: &terrastack::executor::ExecutionReport) {
    println!();
    println!("{}", console::style("Summary").bold());
    for module in &stack.modules {
        let failed = report
            .error
            .as_ref()
            .and_then(|multi| multi.errors.iter().find(|e| e.module_path() == module.path));

        match failed {
            None => println!("  {} {}", console::style("OK").green(), module.display_name()),
            Some(err) => println!(
                "  {} {}: {}",
                console::style("FAILED").red().bold(),
                module.display_name(),
                err
            ),
        }
    }
}
