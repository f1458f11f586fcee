//! On-disk configuration schema for a single module.
//!
//! This is *not* the real Terragrunt HCL format; the HCL/config parser is
//! explicitly out of scope for the core (spec.md §1). It is a structurally
//! equivalent TOML stand-in used so the rest of the core has something
//! concrete to load, mirroring the teacher crate's own TOML+serde
//! configuration style (`offload`'s `config::schema`).
//!
//! # Schema Overview
//!
//! ```text
//! ModuleConfig (root, one per module directory)
//! ├── dependencies.paths     - list of dependency directories
//! ├── terraform.source       - optional remote module source
//! └── remote_state           - opaque passthrough block
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Parsed configuration for one module, as read from its
/// `terragrunt.toml` (the TOML stand-in for a real `terragrunt.hcl`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModuleConfig {
    /// Dependency section (`[dependencies]`).
    #[serde(default)]
    pub dependencies: DependenciesBlock,

    /// Terraform section (`[terraform]`).
    #[serde(default)]
    pub terraform: TerraformBlock,

    /// Opaque remote-state block (`[remote_state]`), never interpreted by
    /// the core, only carried through so it is available to whatever
    /// component performs remote-state initialization.
    pub remote_state: Option<RemoteStateBlock>,
}

/// `dependencies.paths`: directories (relative to the module, or
/// absolute) that this module depends on.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DependenciesBlock {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

/// `terraform.source`: when non-empty, the module is runnable even
/// without local `.tf` files (it points at a remote module source).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TerraformBlock {
    pub source: Option<String>,
}

/// Opaque remote-state configuration. The core never reads these fields;
/// they exist so `ModuleConfig` round-trips faithfully and so a remote
/// state initializer (out of scope here) has somewhere to read from.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RemoteStateBlock {
    pub backend: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, toml::Value>,
}
