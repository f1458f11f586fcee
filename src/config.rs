//! Module configuration loading.
//!
//! The real HCL parser is an external collaborator (spec.md §1 Non-goals).
//! This module defines the narrow interface the core needs from it
//! ([`ConfigLoader`]) and ships a TOML-backed default implementation so the
//! rest of the crate (and its test suite) has something concrete to run
//! against, following the teacher crate's own `load_config`/`load_config_str`
//! split (`offload::config`).

pub mod schema;

pub use schema::{DependenciesBlock, ModuleConfig, RemoteStateBlock, TerraformBlock};

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

use crate::error::ConfigLoadError;

/// The name of the per-module configuration file the default loader reads.
pub const CONFIG_FILE_NAME: &str = "terragrunt.toml";

/// Narrow interface the Module Resolver needs from a config parser.
///
/// Implement this to back the core with a real HCL parser; the default
/// [`TomlConfigLoader`] is a structurally equivalent stand-in.
pub trait ConfigLoader: Send + Sync {
    /// Loads the configuration found at `config_path` (a file path, not a
    /// module directory).
    fn load(&self, config_path: &Path) -> Result<ModuleConfig, ConfigLoadError>;
}

/// Loads module configuration from `terragrunt.toml` files.
#[derive(Debug, Default, Clone, Copy)]
pub struct TomlConfigLoader;

impl ConfigLoader for TomlConfigLoader {
    fn load(&self, config_path: &Path) -> Result<ModuleConfig, ConfigLoadError> {
        let content = std::fs::read_to_string(config_path).map_err(|e| ConfigLoadError {
            path: config_path.to_path_buf(),
            source: anyhow::Error::new(e)
                .context(format!("failed to read {}", config_path.display())),
        })?;

        let mut config: ModuleConfig =
            toml::from_str(&content).map_err(|e| ConfigLoadError {
                path: config_path.to_path_buf(),
                source: anyhow::Error::new(e)
                    .context(format!("failed to parse {}", config_path.display())),
            })?;

        if let Some(remote_state) = &mut config.remote_state {
            expand_remote_state_env(remote_state).map_err(|e| ConfigLoadError {
                path: config_path.to_path_buf(),
                source: anyhow::anyhow!(e),
            })?;
        }

        Ok(config)
    }
}

/// Expands `${VAR}` / `${VAR:-default}` references in any string-valued
/// entries of a remote-state config block. Identical algorithm to the
/// teacher's `config::expand_env_value`, reused here for the same reason:
/// module options commonly interpolate environment variables (bucket
/// names, account IDs) and the core should resolve them once at load time
/// rather than let every downstream consumer re-implement it.
fn expand_remote_state_env(block: &mut RemoteStateBlock) -> Result<(), String> {
    for (key, value) in block.config.iter_mut() {
        if let toml::Value::String(s) = value {
            *s = expand_env_value(s)
                .map_err(|e| format!("failed to expand env var in remote_state.{key}: {e}"))?;
        }
    }
    Ok(())
}

/// Expands environment variable references in a string value.
///
/// Syntax:
/// - `${VAR}` - required, fails if VAR is not set
/// - `${VAR:-default}` - optional, uses "default" if VAR not set
/// - `$$` - escaped dollar sign (becomes single `$`)
pub fn expand_env_value(value: &str) -> Result<String, String> {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' {
            match chars.peek() {
                Some('$') => {
                    chars.next();
                    result.push('$');
                }
                Some('{') => {
                    chars.next(); // consume '{'

                    let mut var_content = String::new();
                    let mut found_close = false;

                    for c in chars.by_ref() {
                        if c == '}' {
                            found_close = true;
                            break;
                        }
                        var_content.push(c);
                    }

                    if !found_close {
                        return Err(format!("Unclosed variable reference: ${{{var_content}"));
                    }

                    let (var_name, default_value) = if let Some(idx) = var_content.find(":-") {
                        let (name, rest) = var_content.split_at(idx);
                        (name, Some(&rest[2..]))
                    } else {
                        (var_content.as_str(), None)
                    };

                    if var_name.is_empty() {
                        return Err("Empty variable name in ${}".to_string());
                    }

                    match std::env::var(var_name) {
                        Ok(val) => result.push_str(&val),
                        Err(_) => {
                            if let Some(default) = default_value {
                                result.push_str(default);
                            } else {
                                return Err(format!(
                                    "Required environment variable not set: {var_name}"
                                ));
                            }
                        }
                    }
                }
                _ => result.push('$'),
            }
        } else {
            result.push(ch);
        }
    }

    Ok(result)
}

/// Loads a [`ModuleConfig`] at `path`, wrapping I/O context the way the
/// teacher's `load_config` does with `anyhow::Context`.
pub fn load_module_config(loader: &dyn ConfigLoader, path: &Path) -> Result<ModuleConfig> {
    loader
        .load(path)
        .with_context(|| format!("loading module config at {}", path.display()))
}

/// Maps `path -> ModuleConfig` for a known-config index, used by the
/// resolver when looking up whether a directory already has a config in
/// scope.
pub type ConfigIndex = HashMap<std::path::PathBuf, ModuleConfig>;
