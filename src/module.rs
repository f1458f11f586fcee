//! The `Module` data model (spec.md §3).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::Span;

use crate::approval::ApprovalHandler;
use crate::config::ModuleConfig;

/// Per-module runtime configuration. Cloned per module from a shared
/// template so each module has its own writable copy, per spec.md §3.
///
/// Writers are `Arc<Mutex<_>>` rather than owned `Box<dyn Write>` so that
/// cloning `Options` (required once per module) is cheap and every clone
/// still writes to the same underlying sink, mirroring how the teacher's
/// `SandboxConfig` is a plain `Clone` struct threaded per-sandbox.
#[derive(Clone)]
pub struct Options {
    /// Extra CLI args forwarded to the runner (e.g. `-auto-approve`,
    /// `-no-color`, `-detailed-exitcode`).
    pub extra_args: Vec<String>,

    /// Working directory this module's command should run in. Anchored to
    /// the module's config path at resolution time.
    pub working_dir: PathBuf,

    /// Tracing span scoping log lines emitted for this module (carries the
    /// module path as a field).
    pub logger: Span,

    /// Captured-output sink; the executor tees runner stdout into here in
    /// addition to the in-memory replay buffer.
    pub writer: Arc<std::sync::Mutex<dyn Write + Send>>,

    /// Captured-error sink, analogous to `writer`.
    pub error_writer: Arc<std::sync::Mutex<dyn Write + Send>>,

    /// Overrides the executor-wide worker pool size for this invocation.
    /// `None` means "use the module count".
    pub worker_count: Option<usize>,

    /// When true, a module still runs even if one of its dependencies
    /// failed (spec.md §4.4 dependency-done protocol).
    pub ignore_dependency_errors: bool,

    /// How often the output-flusher coroutine emits the unseen tail of a
    /// running module's captured output. Zero disables periodic flushing.
    pub refresh_output_delay: Duration,

    /// Disables interactive approval prompts; unattended runs always
    /// assume external dependencies are already applied.
    pub non_interactive: bool,

    /// Decision interface for "is this external dependency already
    /// applied?" (spec.md §4.1 step 6, Design Notes §9).
    pub approval_handler: Arc<dyn ApprovalHandler>,

    /// Re-verifies Terraform-source-directory presence against the
    /// canonical source path when resolving runnability (spec.md §4.1
    /// step 3).
    pub check_source_folders: bool,
}

impl Options {
    /// Anchors a clone of this template to a specific module's config
    /// path, mirroring spec.md §4.1 step 2 ("Clone the options object,
    /// anchoring it to `configPath`").
    pub fn anchored_to(&self, module_path: &Path) -> Self {
        let mut opts = self.clone();
        opts.working_dir = module_path.to_path_buf();
        opts.logger = tracing::info_span!("module", path = %module_path.display());
        opts
    }
}

/// A Terraform module: a directory containing one configuration and
/// (usually) Terraform sources, treated as an atomic unit of execution.
#[derive(Clone)]
pub struct Module {
    /// Canonical absolute directory path, unique identity within a graph.
    pub path: PathBuf,

    /// Parsed configuration bundle.
    pub config: ModuleConfig,

    /// Resolved pointers to the modules this one depends on. Populated by
    /// the Graph Builder; empty immediately after the Module Resolver.
    pub dependencies: Vec<Module>,

    /// Per-module runtime configuration.
    pub options: Options,

    /// When true, this module is a graph vertex (so dependents can depend
    /// on it) but its command body is skipped at execution time.
    pub assume_already_applied: bool,
}

impl Module {
    pub fn new(path: PathBuf, config: ModuleConfig, options: Options) -> Self {
        Self {
            path,
            config,
            dependencies: Vec::new(),
            options,
            assume_already_applied: false,
        }
    }

    /// Display name used in log lines and the finish-section output
    /// banner: the module's directory path.
    pub fn display_name(&self) -> String {
        self.path.display().to_string()
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("path", &self.path)
            .field("dependencies", &self.dependencies.iter().map(|m| &m.path).collect::<Vec<_>>())
            .field("assume_already_applied", &self.assume_already_applied)
            .finish()
    }
}
