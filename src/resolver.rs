//! Module Resolver (spec.md §4.1).
//!
//! Walks the user-supplied config paths, loads each module's configuration
//! through a [`ConfigLoader`], and recursively resolves external
//! dependencies (dependency paths that lie outside the set of configs the
//! user explicitly asked to run).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::{ConfigLoader, ModuleConfig, CONFIG_FILE_NAME};
use crate::module::{Module, Options};

/// Output of module resolution: the full module set (in-scope plus
/// resolved external dependencies) plus the subfolder-expansion overrides
/// the Graph Builder must apply when cross-linking.
///
/// `dependency_overrides` isolates the subfolder-expansion rewrite to an
/// execution-time structure rather than mutating `ModuleConfig` in place
/// (spec.md §9 Open Questions: "whether this rewrite is observable
/// downstream... is ambiguous", resolved here by keeping the rewrite out
/// of the parsed config entirely, so re-serializing a `Module`'s config
/// always reflects exactly what was on disk).
pub struct ResolvedModules {
    pub modules: HashMap<PathBuf, Module>,
    pub dependency_overrides: HashMap<PathBuf, Vec<PathBuf>>,
}

/// Resolves the module set starting from `config_paths`.
///
/// `options_template` is cloned and anchored per module (spec.md §4.1 step
/// 2); `loader` stands in for the out-of-scope HCL parser.
pub fn resolve(
    config_paths: &[PathBuf],
    options_template: &Options,
    loader: &dyn ConfigLoader,
) -> Result<ResolvedModules> {
    let cwd = std::env::current_dir().context("determining current directory")?;

    let canonical_inputs: Vec<PathBuf> = config_paths
        .iter()
        .map(|p| canonicalize_relative_to(&cwd, p))
        .collect::<Result<_>>()?;

    let mut modules: HashMap<PathBuf, Module> = HashMap::new();
    for config_path in &canonical_inputs {
        if let Some(module) = load_module(config_path, options_template, loader)? {
            modules.insert(module.path.clone(), module);
        }
    }

    let in_scope_config_paths: HashSet<PathBuf> = canonical_inputs.iter().cloned().collect();

    let mut external_modules: HashMap<PathBuf, Module> = HashMap::new();
    let mut visited_external: HashSet<PathBuf> = HashSet::new();
    // Every out-of-scope dependency directory any module points at, whether
    // or not that directory has its own config. The common subfolder-
    // expansion case is a bare parent directory with no config of its own,
    // just organizing a handful of in-scope submodules underneath it.
    let mut external_candidate_dirs: HashSet<PathBuf> = HashSet::new();
    for module in modules.values() {
        resolve_external_dependencies(
            module,
            &in_scope_config_paths,
            options_template,
            loader,
            &mut external_modules,
            &mut visited_external,
            &mut external_candidate_dirs,
        )?;
    }

    let mut dependency_overrides: HashMap<PathBuf, Vec<PathBuf>> = HashMap::new();
    let all_in_scope_paths: Vec<PathBuf> = modules.keys().cloned().collect();
    for ext_path in external_candidate_dirs.iter().chain(external_modules.keys()) {
        let matches: Vec<PathBuf> = all_in_scope_paths
            .iter()
            .filter(|p| p.starts_with(ext_path) && *p != ext_path)
            .cloned()
            .collect();
        if !matches.is_empty() {
            let mut sorted = matches;
            sorted.sort();
            dependency_overrides.insert(ext_path.clone(), sorted);
        }
    }

    // Decide fate (assume-already-applied vs. run) for external deps that
    // are NOT subfolder-expanded away.
    for (path, module) in external_modules.iter_mut() {
        if dependency_overrides.contains_key(path) {
            continue;
        }
        let assume_applied = if options_template.non_interactive {
            true
        } else {
            options_template
                .approval_handler
                .should_assume_applied(path)
        };
        module.assume_already_applied = assume_applied;
    }

    // Main map wins on conflict (spec.md §4.1 step 7).
    for (path, module) in external_modules {
        modules.entry(path).or_insert(module);
    }

    Ok(ResolvedModules {
        modules,
        dependency_overrides,
    })
}

fn canonicalize_relative_to(cwd: &Path, path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };
    joined
        .canonicalize()
        .with_context(|| format!("resolving config path {}", joined.display()))
}

/// Loads a single module at `config_path`, applying the runnability rules
/// from spec.md §4.1 step 3. Returns `Ok(None)` when the module is
/// declared non-runnable and should be dropped.
fn load_module(
    config_path: &Path,
    options_template: &Options,
    loader: &dyn ConfigLoader,
) -> Result<Option<Module>> {
    let module_path = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path {} has no parent directory", config_path.display()))?
        .canonicalize()
        .with_context(|| format!("canonicalizing module directory for {}", config_path.display()))?;

    let config = loader
        .load(config_path)
        .with_context(|| format!("loading module config at {}", config_path.display()))?;

    if !is_runnable(&module_path, &config, options_template.check_source_folders) {
        debug!(path = %module_path.display(), "module has no runnable Terraform body, dropping");
        return Ok(None);
    }

    let options = options_template.anchored_to(&module_path);
    Ok(Some(Module::new(module_path, config, options)))
}

/// spec.md §4.1 step 3: a module is runnable if its directory has local
/// Terraform sources, or declares a non-empty remote `terraform.source`.
fn is_runnable(module_path: &Path, config: &ModuleConfig, check_source_folders: bool) -> bool {
    if has_terraform_source_files(module_path) {
        return true;
    }

    match &config.terraform.source {
        Some(source) if !source.is_empty() => {
            if check_source_folders && !source.contains("::") {
                // Local relative source: re-verify the source directory
                // actually exists rather than trusting the declared string.
                module_path.join(source).exists()
            } else {
                true
            }
        }
        _ => false,
    }
}

fn has_terraform_source_files(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".tf") || name.ends_with(".tf.json") {
            return true;
        }
    }
    false
}

/// Recursively resolves the external dependencies of `module` into
/// `external_modules`, per spec.md §4.1 step 5.
#[allow(clippy::too_many_arguments)]
fn resolve_external_dependencies(
    module: &Module,
    in_scope_config_paths: &HashSet<PathBuf>,
    options_template: &Options,
    loader: &dyn ConfigLoader,
    external_modules: &mut HashMap<PathBuf, Module>,
    visited: &mut HashSet<PathBuf>,
    external_candidate_dirs: &mut HashSet<PathBuf>,
) -> Result<()> {
    let mut seen_in_this_module: HashSet<PathBuf> = HashSet::new();

    for dep_path in &module.config.dependencies.paths {
        let canonical_dep_dir = match canonicalize_dependency_dir(&module.path, dep_path) {
            Ok(p) => p,
            Err(e) => return Err(e),
        };

        // Self-edges are silently dropped (spec.md §4.1 edge cases).
        if canonical_dep_dir == module.path {
            continue;
        }

        // First occurrence wins for duplicates.
        if !seen_in_this_module.insert(canonical_dep_dir.clone()) {
            continue;
        }

        let dep_config_path = canonical_dep_dir.join(CONFIG_FILE_NAME);

        // Already in scope: nothing further to resolve here.
        if in_scope_config_paths.contains(&dep_config_path) {
            continue;
        }

        // Out of scope: a candidate for the subfolder-expansion rule
        // regardless of whether it has its own config (spec.md §4.1 step 6 /
        // §8 boundary behaviors), recorded even if already visited, since a
        // later-visited module may be the first to discover this directory.
        external_candidate_dirs.insert(canonical_dep_dir.clone());

        if visited.contains(&canonical_dep_dir) {
            continue;
        }

        if !dep_config_path.exists() {
            // Not a module itself: a bare parent directory, only resolvable
            // via the subfolder-expansion rule computed from
            // `external_candidate_dirs` above. No module is created for it.
            continue;
        }

        visited.insert(canonical_dep_dir.clone());

        if let Some(ext_module) = load_module(&dep_config_path, options_template, loader)? {
            resolve_external_dependencies(
                &ext_module,
                in_scope_config_paths,
                options_template,
                loader,
                external_modules,
                visited,
                external_candidate_dirs,
            )?;
            external_modules.insert(ext_module.path.clone(), ext_module);
        }
    }

    Ok(())
}

fn canonicalize_dependency_dir(module_path: &Path, dep_path: &Path) -> Result<PathBuf> {
    let joined = if dep_path.is_absolute() {
        dep_path.to_path_buf()
    } else {
        module_path.join(dep_path)
    };

    if joined.exists() {
        joined
            .canonicalize()
            .with_context(|| format!("resolving dependency path {}", joined.display()))
    } else {
        // spec.md S5: a missing dependency directory is a fatal resolve()
        // error whose inner cause is a file-not-exists error.
        Err(anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("dependency directory does not exist: {}", joined.display()),
        ))
        .context(format!(
            "module {} declares dependency {}",
            module_path.display(),
            dep_path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::NonInteractiveApprovalHandler;
    use crate::config::TomlConfigLoader;
    use std::sync::Arc;

    fn template_options() -> Options {
        Options {
            extra_args: Vec::new(),
            working_dir: PathBuf::new(),
            logger: tracing::Span::none(),
            writer: Arc::new(std::sync::Mutex::new(std::io::sink())),
            error_writer: Arc::new(std::sync::Mutex::new(std::io::sink())),
            worker_count: None,
            ignore_dependency_errors: false,
            refresh_output_delay: std::time::Duration::ZERO,
            non_interactive: true,
            approval_handler: Arc::new(NonInteractiveApprovalHandler),
            check_source_folders: false,
        }
    }

    fn write_module(dir: &Path, name: &str, deps: &[&str], runnable: bool) -> PathBuf {
        let module_dir = dir.join(name);
        std::fs::create_dir_all(&module_dir).unwrap();
        let deps_toml = deps
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(", ");
        std::fs::write(
            module_dir.join(CONFIG_FILE_NAME),
            format!("[dependencies]\npaths = [{deps_toml}]\n"),
        )
        .unwrap();
        if runnable {
            std::fs::write(module_dir.join("main.tf"), "").unwrap();
        }
        module_dir.join(CONFIG_FILE_NAME)
    }

    #[test]
    fn resolves_empty_input_to_empty_set() {
        let options = template_options();
        let loader = TomlConfigLoader;
        let resolved = resolve(&[], &options, &loader).unwrap();
        assert!(resolved.modules.is_empty());
    }

    #[test]
    fn resolves_single_leaf_module() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_module(dir.path(), "module-a", &[], true);

        let options = template_options();
        let loader = TomlConfigLoader;
        let resolved = resolve(&[config_path], &options, &loader).unwrap();

        assert_eq!(resolved.modules.len(), 1);
        let module = resolved.modules.values().next().unwrap();
        assert!(module.dependencies.is_empty());
        assert!(!module.assume_already_applied);
    }

    #[test]
    fn drops_non_runnable_module_with_no_source() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_module(dir.path(), "module-a", &[], false);

        let options = template_options();
        let loader = TomlConfigLoader;
        let resolved = resolve(&[config_path], &options, &loader).unwrap();
        assert!(resolved.modules.is_empty());
    }

    #[test]
    fn missing_dependency_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_module(dir.path(), "module-a", &["../does-not-exist"], true);

        let options = template_options();
        let loader = TomlConfigLoader;
        let err = resolve(&[config_path], &options, &loader).unwrap_err();

        let io_err = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<std::io::Error>());
        assert_eq!(io_err.unwrap().kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn self_dependency_is_silently_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = write_module(dir.path(), "module-a", &["."], true);

        let options = template_options();
        let loader = TomlConfigLoader;
        let resolved = resolve(&[config_path], &options, &loader).unwrap();
        assert_eq!(resolved.modules.len(), 1);
    }

    #[test]
    fn external_dependency_outside_scope_is_assumed_applied_non_interactively() {
        let dir = tempfile::tempdir().unwrap();
        write_module(dir.path(), "ext", &[], true);
        let config_path = write_module(dir.path(), "module-a", &["../ext"], true);

        let options = template_options();
        let loader = TomlConfigLoader;
        let resolved = resolve(&[config_path], &options, &loader).unwrap();

        assert_eq!(resolved.modules.len(), 2);
        let ext = resolved
            .modules
            .values()
            .find(|m| m.path.ends_with("ext"))
            .unwrap();
        assert!(ext.assume_already_applied);
    }

    #[test]
    fn bare_parent_directory_with_no_config_is_subfolder_expanded() {
        // "parent" is never itself a module (no terragrunt.toml of its own),
        // only its children are, and both children are explicitly
        // in-scope. A dependency on "../parent" must expand to those
        // in-scope children rather than fail as unrecognized.
        let dir = tempfile::tempdir().unwrap();
        let parent_dir = dir.path().join("parent");
        std::fs::create_dir_all(&parent_dir).unwrap();
        let sub_a = write_module(&parent_dir, "sub-a", &[], true);
        let sub_b = write_module(&parent_dir, "sub-b", &[], true);
        let consumer_config = write_module(dir.path(), "consumer", &["../parent"], true);

        let options = template_options();
        let loader = TomlConfigLoader;
        let resolved = resolve(&[sub_a, sub_b, consumer_config], &options, &loader).unwrap();

        // No module is ever created at "parent" itself.
        assert!(!resolved.modules.keys().any(|p| p.ends_with("parent")));
        assert!(resolved.modules.keys().any(|p| p.ends_with("sub-a")));
        assert!(resolved.modules.keys().any(|p| p.ends_with("sub-b")));

        let parent_path = parent_dir.canonicalize().unwrap();
        let overrides = resolved.dependency_overrides.get(&parent_path).unwrap();
        assert_eq!(overrides.len(), 2);
    }
}
