//! `terrastack`, a dependency-aware concurrent executor for
//! Terraform/Terragrunt-style module stacks.
//!
//! Three tightly coupled subsystems, in dependency order:
//!
//! - [`resolver`]: walks configuration paths, loads each module's config,
//!   and resolves intra- and extra-scope dependencies into a module set.
//! - [`graph`]: cross-links the module set into a DAG, detects cycles, and
//!   produces the [`graph::Stack`] the rest of the crate operates on.
//! - [`executor`]: runs each module's command as soon as its dependencies
//!   have completed, bounded by a configurable worker budget.
//!
//! The HCL parser, the real Terraform/Terragrunt binary, remote-state
//! provisioning, and interactive CLI plumbing are all external
//! collaborators exposing narrow interfaces to this core ([`config`],
//! [`runner`], [`approval`]).

pub mod approval;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod module;
pub mod pool;
pub mod resolver;
pub mod runner;
pub mod summary;

pub use error::{
    ConfigLoadError, DefaultAggregator, DependencyCycle, DependencyFinishedWithError,
    ErrorAggregator, GraphError, ModuleError, MultiError, PlanAggregator, PlanWithChanges,
    RunnerError, UnrecognizedDependency,
};
pub use executor::{DependencyOrder, ExecutionReport, Handler};
pub use graph::{SimpleTerraformModule, Stack};
pub use module::{Module, Options};
pub use summary::PlanReport;
