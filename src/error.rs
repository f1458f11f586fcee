//! Error taxonomy for the stack orchestrator core.
//!
//! Mirrors the shape of `provider::ProviderError` in the teacher crate:
//! one `thiserror`-derived enum per failure domain, each variant carrying
//! enough context to reconstruct a useful message without re-querying the
//! module map.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading a single module's configuration.
#[derive(Debug, Error)]
#[error("failed to load config at {path}: {source}")]
pub struct ConfigLoadError {
    pub path: PathBuf,
    #[source]
    pub source: anyhow::Error,
}

/// A module declared a dependency path that could not be resolved to any
/// known module, and was not covered by the subfolder-expansion rule or
/// assume-already-applied.
#[derive(Debug, Error)]
#[error(
    "module {module_path} declares unrecognized dependency {dependency_path}; known modules: {}",
    known_paths.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
)]
pub struct UnrecognizedDependency {
    pub module_path: PathBuf,
    pub dependency_path: PathBuf,
    pub known_paths: Vec<PathBuf>,
}

/// A cycle was detected in the dependency graph.
///
/// `cycle` lists the path from the first repeated node back to itself,
/// inclusive of both ends (so `cycle.first() == cycle.last()`).
#[derive(Debug, Error)]
#[error(
    "dependency cycle detected: {}",
    cycle.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(" -> ")
)]
pub struct DependencyCycle {
    pub cycle: Vec<PathBuf>,
}

/// Raised on a `RunningModule` when a dependency it was waiting on finished
/// with an error and `ignore_dependency_errors` is not set. Cascades
/// transitively: a module that never ran because of this still produces
/// its own `DependencyFinishedWithError` for its own dependents.
#[derive(Debug, Error)]
#[error("module {module_path} not run: dependency {failed_dependency_path} finished with an error: {source}")]
pub struct DependencyFinishedWithError {
    pub module_path: PathBuf,
    pub failed_dependency_path: PathBuf,
    #[source]
    pub source: std::sync::Arc<RunnerError>,
}

/// Whatever the external command runner returned.
///
/// `exit_status` exposes the child process exit code when the runner was
/// able to observe one; `None` covers signals/timeouts/launch failures.
/// `combined_output` carries whatever stdout/stderr was captured before the
/// failure, so a failing module's output can still be replayed in its
/// finish section (spec.md §8 invariant 9).
#[derive(Debug, Clone, Error)]
#[error("module {module_path} command failed: {message}")]
pub struct RunnerError {
    pub module_path: PathBuf,
    pub message: String,
    pub exit_status: Option<i32>,
    pub combined_output: String,
}

impl RunnerError {
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }
}

/// Errors raised while cross-linking the module set into a DAG
/// (spec.md §4.2). Both are fatal: no module runs.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    UnrecognizedDependency(#[from] UnrecognizedDependency),
    #[error(transparent)]
    Cycle(#[from] DependencyCycle),
}

/// Any of the error kinds that the executor can record against a module.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(transparent)]
    DependencyFinishedWithError(#[from] DependencyFinishedWithError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

impl ModuleError {
    /// Exit status of the underlying failure, when one can be extracted.
    /// `DependencyFinishedWithError` walks to the root runner failure.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            ModuleError::DependencyFinishedWithError(e) => e.source.exit_status(),
            ModuleError::Runner(e) => e.exit_status(),
        }
    }

    pub fn module_path(&self) -> &std::path::Path {
        match self {
            ModuleError::DependencyFinishedWithError(e) => &e.module_path,
            ModuleError::Runner(e) => &e.module_path,
        }
    }
}

/// Aggregate of all per-module errors recorded during one executor run.
#[derive(Debug, Error)]
#[error("{} module(s) failed", errors.len())]
pub struct MultiError {
    pub errors: Vec<ModuleError>,
}

impl MultiError {
    pub fn new(errors: Vec<ModuleError>) -> Option<Self> {
        if errors.is_empty() { None } else { Some(Self { errors }) }
    }
}

/// Strategy for turning a set of per-module failures into a process exit
/// status. Injected into the executor configuration instead of swapped via
/// an ad-hoc function-variable override (Design Notes §9).
pub trait ErrorAggregator: Send + Sync {
    /// Returns `None` when the status is undefined (mixed/unknown codes).
    fn exit_status(&self, error: &MultiError) -> Option<i32>;
}

/// Default aggregator: the maximum child exit code across wrapped errors;
/// undefined if any child lacks an extractable code.
pub struct DefaultAggregator;

impl ErrorAggregator for DefaultAggregator {
    fn exit_status(&self, error: &MultiError) -> Option<i32> {
        let mut max = 0i32;
        for e in &error.errors {
            match e.exit_status() {
                Some(code) => max = max.max(code),
                None => return None,
            }
        }
        Some(max)
    }
}

/// Plan aggregator: exit code 1 is dominant (error); exit code 2 (change)
/// is subordinate and never upgraded to an error when mixed with 0s.
pub struct PlanAggregator;

impl ErrorAggregator for PlanAggregator {
    fn exit_status(&self, error: &MultiError) -> Option<i32> {
        let mut saw_two = false;
        for e in &error.errors {
            match e.exit_status() {
                Some(1) => return None,
                Some(2) => saw_two = true,
                Some(0) => {}
                _ => return None,
            }
        }
        Some(if saw_two { 2 } else { 0 })
    }
}

/// Sentinel returned (not a true error) by the plan driver when
/// `-detailed-exitcode` was requested and at least one module reported
/// changes but nothing failed.
#[derive(Debug, Error)]
#[error("plan completed with changes in one or more modules")]
pub struct PlanWithChanges;
