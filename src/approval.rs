//! Pluggable decision interface for external-dependency approval.
//!
//! The resolver needs to ask, for every external dependency that isn't
//! covered by the subfolder-expansion rule, "should this be assumed
//! already applied?". The original tool prompts interactively; Design
//! Notes §9 calls for pushing that prompt behind a trait so the core can
//! run fully non-interactively in tests and automation. Modeled on the
//! teacher's pattern of injecting collaborators (`Reporter`, `SandboxProvider`)
//! as traits rather than reaching for global state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Decides whether an external dependency should be treated as already
/// applied (skip its command body) or actually run.
pub trait ApprovalHandler: Send + Sync {
    /// Returns `true` if `dependency_path` should be assumed already
    /// applied.
    fn should_assume_applied(&self, dependency_path: &Path) -> bool;
}

/// Always answers "yes", the documented non-interactive default
/// (spec.md §4.1 step 6: "In non-interactive mode, assume Yes.").
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractiveApprovalHandler;

impl ApprovalHandler for NonInteractiveApprovalHandler {
    fn should_assume_applied(&self, _dependency_path: &Path) -> bool {
        true
    }
}

/// Prompts on stdin for each external dependency the first time it is
/// seen. Answers are memoized in an [`ApprovalCache`] so the same
/// dependency is never asked about twice within one resolver run, and the
/// cache is constructed once per CLI invocation and threaded through
/// rather than kept as process-global state (Design Notes §9).
pub struct InteractiveApprovalHandler {
    cache: ApprovalCache,
}

impl InteractiveApprovalHandler {
    pub fn new() -> Self {
        Self {
            cache: ApprovalCache::new(),
        }
    }
}

impl Default for InteractiveApprovalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalHandler for InteractiveApprovalHandler {
    fn should_assume_applied(&self, dependency_path: &Path) -> bool {
        if let Some(answer) = self.cache.get(dependency_path) {
            return answer;
        }

        use std::io::Write;
        print!(
            "Dependency {} is outside the requested scope. Assume it is already applied? [Y/n] ",
            dependency_path.display()
        );
        std::io::stdout().flush().ok();

        let mut line = String::new();
        let answer = match std::io::stdin().read_line(&mut line) {
            Ok(_) => !line.trim().eq_ignore_ascii_case("n"),
            Err(_) => true,
        };

        self.cache.insert(dependency_path.to_path_buf(), answer);
        answer
    }
}

/// Lazily-initialized, per-dependency-path memoization of approval
/// answers. Read/write access is a single `Mutex` (answers are a handful
/// of booleans keyed by path, no contention worth a lock-free structure),
/// but importantly it is *owned* by whoever constructs the resolver, never
/// a `static`.
#[derive(Default)]
pub struct ApprovalCache {
    answers: Mutex<HashMap<PathBuf, bool>>,
}

impl ApprovalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<bool> {
        self.answers.lock().unwrap().get(path).copied()
    }

    pub fn insert(&self, path: PathBuf, answer: bool) {
        self.answers.lock().unwrap().insert(path, answer);
    }
}
