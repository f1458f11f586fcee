//! Plan Summarizer (spec.md §4.5).
//!
//! Parses a module's captured `plan` output into a `{message, count,
//! known}` triple and, for the `plan-all` / `-detailed-exitcode` path,
//! downgrades exit-code-2 ("changes present") runner errors to success so
//! dependents are never blocked by what Terraform considers a non-error
//! status. Installed as a [`Handler`](crate::executor::Handler) rather than
//! a swapped-in constructor function (Design Notes §9), mirroring how the
//! teacher's `report` module is injected into the orchestrator rather than
//! reached for as global state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::RunnerError;
use crate::executor::{ExecutionReport, Handler};
use crate::module::Module;
use crate::runner::RunnerOutput;

/// Outcome of [`crate::graph::Stack::plan`]: the underlying DAG execution
/// result plus whether any module's plan reported changes
/// (spec.md §4.5 step 3, §7 `PlanWithChanges`).
pub struct PlanReport {
    pub execution: ExecutionReport,
    pub has_changes: bool,
}

impl PlanReport {
    /// `true` only when nothing failed and at least one module reported
    /// changes (the condition under which the plan driver should surface
    /// the `PlanWithChanges` sentinel instead of a plain success).
    pub fn changes_with_no_errors(&self) -> bool {
        self.execution.success() && self.has_changes
    }
}

/// Exit code Terraform uses with `-detailed-exitcode` to mean "plan
/// succeeded and found changes" (not a failure), per spec.md §6.
pub const CHANGE_EXIT_CODE: i32 = 2;

/// Substring markers that mean "no changes", checked in order
/// (spec.md §6).
pub const NO_CHANGE_PHRASES: &[&str] = &[
    "Plan: 0 to add, 0 to change, 0 to destroy.",
    "No changes. Infrastructure is up-to-date.",
    "Your infrastructure matches the configuration.",
    "without changing any real infrastructure.",
];

fn plan_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+) to add, (\d+) to change, (\d+) to destroy\.").expect("valid regex")
    })
}

/// Parsed result of one module's captured plan output (spec.md §4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub message: String,
    /// Total of add+change+destroy counts. `-1` when the status could not
    /// be determined at all.
    pub count: i64,
    pub known: bool,
}

/// Summarizes a single module's plan output per spec.md §4.5 steps 1-2.
pub fn summarize(output: &str) -> PlanSummary {
    if NO_CHANGE_PHRASES.iter().any(|phrase| output.contains(phrase)) {
        return PlanSummary {
            message: "No change".to_string(),
            count: 0,
            known: true,
        };
    }

    let Some(captures) = plan_line_regex().captures(output) else {
        return PlanSummary {
            message: "Unable to determine the plan status".to_string(),
            count: -1,
            known: false,
        };
    };

    let to_add: i64 = captures[1].parse().unwrap_or(0);
    let to_change: i64 = captures[2].parse().unwrap_or(0);
    let to_destroy: i64 = captures[3].parse().unwrap_or(0);
    let total = to_add + to_change + to_destroy;

    if total == 0 {
        return PlanSummary {
            message: "No effective change".to_string(),
            count: 0,
            known: true,
        };
    }

    PlanSummary {
        message: captures[0].to_string(),
        count: total,
        known: true,
    }
}

/// Builds the Plan Summarizer [`Handler`] plus the shared "has changes"
/// flag it sets whenever a module's exit code is [`CHANGE_EXIT_CODE`]. The
/// flag is threaded through explicitly by the caller (the plan driver)
/// rather than kept as process-global state (Design Notes §9); it is
/// reintroduced as the `PlanWithChanges` sentinel once the whole DAG has
/// finished running.
pub fn plan_handler() -> (Handler, Arc<AtomicBool>) {
    let has_changes = Arc::new(AtomicBool::new(false));
    let flag = has_changes.clone();

    let handler: Handler = Arc::new(
        move |_module: &Module, output: RunnerOutput, err: Option<RunnerError>| {
            let summary = summarize(&output.combined_output);
            tracing::debug!(message = %summary.message, count = summary.count, "plan summary");

            match &err {
                Some(e) if e.exit_status == Some(CHANGE_EXIT_CODE) => {
                    flag.store(true, Ordering::SeqCst);
                    (output, None)
                }
                _ => (output, err),
            }
        },
    );

    (handler, has_changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_change_phrase_is_detected() {
        let summary = summarize("stuff No changes. Infrastructure is up-to-date. stuff");
        assert_eq!(summary, PlanSummary { message: "No change".into(), count: 0, known: true });
    }

    #[test]
    fn change_counts_are_summed() {
        let summary = summarize("stuff 11 to add, 10 to change, 21 to destroy. stuff");
        assert_eq!(
            summary,
            PlanSummary {
                message: "11 to add, 10 to change, 21 to destroy.".into(),
                count: 42,
                known: true,
            }
        );
    }

    #[test]
    fn zero_counts_are_no_effective_change() {
        let summary =
            summarize("stuff SomethingElse: 0 to add, 0 to change, 0 to destroy. stuff");
        assert_eq!(
            summary,
            PlanSummary { message: "No effective change".into(), count: 0, known: true }
        );
    }

    #[test]
    fn unmatched_output_is_unknown() {
        let summary = summarize("Nobody knows");
        assert_eq!(
            summary,
            PlanSummary {
                message: "Unable to determine the plan status".into(),
                count: -1,
                known: false,
            }
        );
    }
}
