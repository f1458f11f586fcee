//! Graph Builder (spec.md §4.2) and the `Stack` data model (spec.md §3).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{DependencyCycle, GraphError, UnrecognizedDependency};
use crate::executor::{self, DependencyOrder, ExecutionReport, Handler};
use crate::module::Module;
use crate::runner::CommandRunner;

/// Cross-links a resolved module set into a DAG, checks for cycles, and
/// returns the `Stack` the rest of the crate operates on.
///
/// `dependency_overrides` comes from [`crate::resolver::resolve`]: declared
/// dependency paths that the subfolder-expansion rule rewrites to a set of
/// concrete in-scope sub-modules.
pub fn build(
    modules: HashMap<PathBuf, Module>,
    dependency_overrides: &HashMap<PathBuf, Vec<PathBuf>>,
    root: PathBuf,
) -> Result<Stack, GraphError> {
    let cross_linked = cross_link(modules, dependency_overrides)?;
    detect_cycles(&cross_linked)?;

    let mut ordered: Vec<Module> = cross_linked.into_values().collect();
    ordered.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(Stack {
        root,
        modules: ordered,
    })
}

/// spec.md §4.2 steps 1-2: resolve each declared dependency path to a
/// concrete `Module`, deduplicated, dropping self-edges.
fn cross_link(
    modules: HashMap<PathBuf, Module>,
    dependency_overrides: &HashMap<PathBuf, Vec<PathBuf>>,
) -> Result<HashMap<PathBuf, Module>, GraphError> {
    let known_paths: Vec<PathBuf> = {
        let mut paths: Vec<PathBuf> = modules.keys().cloned().collect();
        paths.sort();
        paths
    };

    let mut linked = modules.clone();

    for (path, module) in modules.iter() {
        let mut resolved: Vec<Module> = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for dep_path in &module.config.dependencies.paths {
            let canonical = match resolve_dependency_dir(path, dep_path) {
                Some(p) => p,
                None => {
                    if module.assume_already_applied {
                        continue;
                    }
                    return Err(UnrecognizedDependency {
                        module_path: path.clone(),
                        dependency_path: dep_path.clone(),
                        known_paths: known_paths.clone(),
                    }
                    .into());
                }
            };

            if canonical == *path {
                continue; // self-edge, silently dropped
            }
            if !seen.insert(canonical.clone()) {
                continue; // duplicate, first occurrence wins
            }

            // Subfolder-expansion takes priority over a direct path match:
            // spec.md §4.1 step 6 replaces the declared dependency with its
            // in-scope sub-modules rather than falling back to the parent
            // module itself when both are available.
            if let Some(submodule_paths) = dependency_overrides.get(&canonical) {
                for sub_path in submodule_paths {
                    if let Some(sub) = modules.get(sub_path) {
                        if seen.insert(sub_path.clone()) {
                            resolved.push(sub.clone());
                        }
                    }
                }
                continue;
            }

            if let Some(target) = modules.get(&canonical) {
                resolved.push(target.clone());
                continue;
            }

            if module.assume_already_applied {
                continue;
            }

            return Err(UnrecognizedDependency {
                module_path: path.clone(),
                dependency_path: dep_path.clone(),
                known_paths: known_paths.clone(),
            }
            .into());
        }

        if let Some(entry) = linked.get_mut(path) {
            entry.dependencies = resolved;
        }
    }

    Ok(linked)
}

fn resolve_dependency_dir(module_path: &Path, dep_path: &Path) -> Option<PathBuf> {
    let joined = if dep_path.is_absolute() {
        dep_path.to_path_buf()
    } else {
        module_path.join(dep_path)
    };
    joined.canonicalize().ok()
}

/// spec.md §4.2 step 4: an independent DFS carrying a currently-visited
/// set, so the reported cycle is the path from the first repeated node
/// back to itself.
fn detect_cycles(modules: &HashMap<PathBuf, Module>) -> Result<(), DependencyCycle> {
    let mut visited: HashSet<PathBuf> = HashSet::new();
    let mut stack: Vec<PathBuf> = Vec::new();

    let mut paths: Vec<&PathBuf> = modules.keys().collect();
    paths.sort();

    for start in paths {
        if !visited.contains(start) {
            visit(start, modules, &mut visited, &mut stack)?;
        }
    }
    Ok(())
}

fn visit(
    path: &PathBuf,
    modules: &HashMap<PathBuf, Module>,
    visited: &mut HashSet<PathBuf>,
    stack: &mut Vec<PathBuf>,
) -> Result<(), DependencyCycle> {
    if let Some(pos) = stack.iter().position(|p| p == path) {
        let mut cycle: Vec<PathBuf> = stack[pos..].to_vec();
        cycle.push(path.clone());
        return Err(DependencyCycle { cycle });
    }
    if visited.contains(path) {
        return Ok(());
    }

    stack.push(path.clone());

    if let Some(module) = modules.get(path) {
        let mut dep_paths: Vec<&PathBuf> = module.dependencies.iter().map(|d| &d.path).collect();
        dep_paths.sort();
        for dep_path in dep_paths {
            visit(dep_path, modules, visited, stack)?;
        }
    }

    stack.pop();
    visited.insert(path.clone());
    Ok(())
}

/// An ordered collection of Modules plus the root working-directory path
/// (spec.md §3). `modules` is always sorted alphabetically by path, so
/// JSON renderings are byte-identical across runs with the same input
/// (invariant 11).
#[derive(Clone)]
pub struct Stack {
    pub root: PathBuf,
    pub modules: Vec<Module>,
}

/// `{path, dependencies}` view of a module, relative to the Stack's root,
/// used for JSON rendering and round-tripped by
/// [`SimpleTerraformModule`](crate::graph::SimpleTerraformModule).
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SimpleTerraformModule {
    pub path: PathBuf,
    pub dependencies: Vec<PathBuf>,
}

impl Stack {
    /// Builds a [`Stack`] from a [`crate::resolver::ResolvedModules`],
    /// cross-linking and cycle-checking the resolved module set (spec.md
    /// §4.1 step 8: "Hand off to the Graph Builder").
    pub fn from_resolved(
        resolved: crate::resolver::ResolvedModules,
        root: PathBuf,
    ) -> Result<Self, GraphError> {
        build(resolved.modules, &resolved.dependency_overrides, root)
    }

    /// Renders the stack as the `{path, dependencies}` list described in
    /// spec.md §3, with paths relative to `self.root`.
    pub fn to_simple_modules(&self) -> Vec<SimpleTerraformModule> {
        self.modules
            .iter()
            .map(|m| SimpleTerraformModule {
                path: relative_to(&self.root, &m.path),
                dependencies: m
                    .dependencies
                    .iter()
                    .map(|d| relative_to(&self.root, &d.path))
                    .collect(),
            })
            .collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_simple_modules())
    }

    /// Runs `plan` over every module, NORMAL order, with the Plan
    /// Summarizer installed as the post-command handler.
    pub async fn plan(
        &self,
        runner: &dyn CommandRunner,
        aggregator: &dyn crate::error::ErrorAggregator,
    ) -> crate::summary::PlanReport {
        let (handler, has_changes) = crate::summary::plan_handler();
        let execution = executor::run(
            &self.modules,
            runner,
            Some(&handler),
            DependencyOrder::Normal,
            aggregator,
        )
        .await;
        crate::summary::PlanReport {
            has_changes: has_changes.load(std::sync::atomic::Ordering::SeqCst),
            execution,
        }
    }

    /// Runs `output` over every module, NORMAL order, no handler.
    pub async fn output(
        &self,
        runner: &dyn CommandRunner,
        aggregator: &dyn crate::error::ErrorAggregator,
    ) -> ExecutionReport {
        executor::run(&self.modules, runner, None, DependencyOrder::Normal, aggregator).await
    }

    /// Generic entry point for `apply-all` / `destroy-all` / `run-all`.
    pub async fn run_all(
        &self,
        runner: &dyn CommandRunner,
        handler: Option<&Handler>,
        order: DependencyOrder,
        aggregator: &dyn crate::error::ErrorAggregator,
    ) -> ExecutionReport {
        executor::run(&self.modules, runner, handler, order, aggregator).await
    }
}

fn relative_to(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root).map(Path::to_path_buf).unwrap_or_else(|_| path.to_path_buf())
}
