//! DAG Executor (spec.md §4.4).
//!
//! Spawns one coroutine per module. Each waits for its dependencies to
//! signal completion, acquires a worker slot, invokes the runner, then
//! notifies its own dependents. Modeled on the teacher's
//! `orchestrator::run_with_tests`'s use of `tokio_scoped::scope` to spawn
//! borrowed, non-`'static` tasks against a shared, immutable module graph,
//! with the worker pool standing in for the teacher's `SandboxPool`.
//!
//! Per Design Notes §9, cross-coroutine circular references are avoided:
//! `dependencies` and `notify_when_done` are plain integer indices into a
//! `Vec<RunningModule>` owned by this module, not `Arc`-cycles.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, info, warn};

use crate::error::{DependencyFinishedWithError, ErrorAggregator, ModuleError, MultiError, RunnerError};
use crate::module::Module;
use crate::pool::WorkerPool;
use crate::runner::{CommandRunner, OutputCallback, RunnerOutput};

/// Controls whether the executor runs dependencies-before-dependents
/// (`Normal`, e.g. `apply`) or dependents-before-dependencies (`Reverse`,
/// e.g. `destroy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyOrder {
    Normal,
    Reverse,
}

/// Optional post-command callback: reinterprets a module's captured output
/// and can downgrade/upgrade the runner's error before the executor records
/// it. Used by the Plan Summarizer (spec.md §4.5). An `Arc` rather than a
/// bare `Box` so the same handler can be shared across the executor's
/// spawned tasks without cloning its captured state (e.g. the plan
/// driver's "has changes" flag).
pub type Handler = Arc<
    dyn Fn(&Module, RunnerOutput, Option<RunnerError>) -> (RunnerOutput, Option<RunnerError>)
        + Send
        + Sync,
>;

/// Result of running the full DAG: the aggregated error (if any) and the
/// exit status computed by the configured [`ErrorAggregator`].
pub struct ExecutionReport {
    pub error: Option<MultiError>,
    pub exit_status: Option<i32>,
}

impl ExecutionReport {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// The message one runner's finish sends to each of its dependents
/// (spec.md §3 `dependencyDone`).
struct DoneNotice {
    from_path: PathBuf,
    err: Option<Arc<ModuleError>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Waiting,
    Running,
    Finished,
}

/// The DAG-executor-local twin of a [`Module`] (spec.md §3 `RunningModule`).
struct RunningModule {
    module: Module,
    status: std::sync::Mutex<Status>,
    err: std::sync::Mutex<Option<Arc<ModuleError>>>,
    /// Unfinished dependency runners, keyed by path; entries removed as
    /// notifications arrive.
    dependencies: std::sync::Mutex<HashMap<PathBuf, usize>>,
    /// Indices of runners to notify when this one finishes.
    notify_when_done: Vec<usize>,
    /// Single-consumer receiver of completion notifications, owned by this
    /// runner's own task for the duration of its run.
    receiver: AsyncMutex<mpsc::Receiver<DoneNotice>>,
    /// `Arc`-wrapped so the per-line output callback (which must be
    /// `'static` to satisfy [`OutputCallback`]) can hold its own handle
    /// rather than borrowing from this runner.
    out_buffer: Arc<std::sync::Mutex<String>>,
    /// High-water mark of bytes already flushed to the periodic logger
    /// (spec.md §3 `bufferIndex`). Only the "still running" flusher reads
    /// and advances this; the finish-section writer replay always emits the
    /// full `out_buffer`, since it is a separate sink.
    buffer_index: AtomicUsize,
    worker_id: std::sync::Mutex<Option<usize>>,
}

/// Runs every module's command over the graph, honoring `order`.
///
/// `handler`, when present, gets first look at each module's captured
/// output and runner error before the executor records the final result
/// (spec.md §3 `Handler`).
pub async fn run(
    modules: &[Module],
    runner: &dyn CommandRunner,
    handler: Option<&Handler>,
    order: DependencyOrder,
    aggregator: &dyn ErrorAggregator,
) -> ExecutionReport {
    if modules.is_empty() {
        return ExecutionReport {
            error: None,
            exit_status: Some(0),
        };
    }

    let index_of: HashMap<PathBuf, usize> = modules
        .iter()
        .enumerate()
        .map(|(i, m)| (m.path.clone(), i))
        .collect();

    // Build both adjacency directions once; `order` picks which one feeds
    // `dependencies` vs `notify_when_done` (spec.md §4.4 step 2).
    let mut dependencies_of: Vec<Vec<usize>> = vec![Vec::new(); modules.len()];
    let mut notify_of: Vec<Vec<usize>> = vec![Vec::new(); modules.len()];

    for (i, module) in modules.iter().enumerate() {
        for dep in &module.dependencies {
            let Some(&j) = index_of.get(&dep.path) else {
                continue;
            };
            match order {
                DependencyOrder::Normal => {
                    dependencies_of[i].push(j);
                    notify_of[j].push(i);
                }
                DependencyOrder::Reverse => {
                    dependencies_of[j].push(i);
                    notify_of[i].push(j);
                }
            }
        }
    }

    // Each runner's channel capacity is exactly its in-degree: the number
    // of senders that will ever notify it, so a notifying dependency's
    // send is non-blocking by construction rather than by comfortable
    // margin (Design Notes §9).
    let mut senders: Vec<mpsc::Sender<DoneNotice>> = Vec::with_capacity(modules.len());
    let mut runners: Vec<RunningModule> = Vec::with_capacity(modules.len());

    for (i, module) in modules.iter().enumerate() {
        let capacity = dependencies_of[i].len().max(1);
        let (tx, rx) = mpsc::channel(capacity);
        senders.push(tx);

        let dep_map: HashMap<PathBuf, usize> = dependencies_of[i]
            .iter()
            .map(|&j| (modules[j].path.clone(), j))
            .collect();

        runners.push(RunningModule {
            module: module.clone(),
            status: std::sync::Mutex::new(Status::Waiting),
            err: std::sync::Mutex::new(None),
            dependencies: std::sync::Mutex::new(dep_map),
            notify_when_done: notify_of[i].clone(),
            receiver: AsyncMutex::new(rx),
            out_buffer: Arc::new(std::sync::Mutex::new(String::new())),
            buffer_index: AtomicUsize::new(0),
            worker_id: std::sync::Mutex::new(None),
        });
    }

    let capacity = modules[0].options.worker_count.unwrap_or(modules.len());
    let pool = WorkerPool::new(capacity);
    let finish_mutex: AsyncMutex<()> = AsyncMutex::new(());

    let runners_ref = &runners;
    let senders_ref = &senders;
    let pool_ref = &pool;
    let finish_mutex_ref = &finish_mutex;

    tokio_scoped::scope(|scope| {
        for i in 0..runners_ref.len() {
            scope.spawn(async move {
                run_one(i, runners_ref, senders_ref, runner, handler, pool_ref, finish_mutex_ref)
                    .await;
            });
        }
    });

    let errors: Vec<ModuleError> = runners
        .iter()
        .filter_map(|r| r.err.lock().unwrap().clone())
        .map(|arc_err| arc_err.clone_for_report())
        .collect();

    let error = MultiError::new(errors);
    let exit_status = match &error {
        None => Some(0),
        Some(e) => aggregator.exit_status(e),
    };

    ExecutionReport { error, exit_status }
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    i: usize,
    runners: &[RunningModule],
    senders: &[mpsc::Sender<DoneNotice>],
    runner: &dyn CommandRunner,
    handler: Option<&Handler>,
    pool: &WorkerPool,
    finish_mutex: &AsyncMutex<()>,
) {
    let this = &runners[i];

    // 4c. Block on dependency-done notifications until `dependencies` is
    // empty or a dependency failed and the ignore-flag is off.
    let mut short_circuit: Option<Arc<ModuleError>> = None;
    loop {
        let remaining = this.dependencies.lock().unwrap().len();
        if remaining == 0 {
            break;
        }

        let notice = {
            let mut rx = this.receiver.lock().await;
            rx.recv().await
        };
        let Some(notice) = notice else {
            break;
        };

        this.dependencies.lock().unwrap().remove(&notice.from_path);

        if let Some(dep_err) = notice.err {
            if this.module.options.ignore_dependency_errors {
                warn!(
                    module = %this.module.display_name(),
                    dependency = %notice.from_path.display(),
                    "dependency finished with an error, continuing (ignore-dependency-errors)"
                );
                continue;
            }

            short_circuit = Some(Arc::new(
                DependencyFinishedWithError {
                    module_path: this.module.path.clone(),
                    failed_dependency_path: notice.from_path,
                    source: runner_error_arc(&dep_err),
                }
                .into(),
            ));
            break;
        }
    }

    let final_err = if let Some(err) = short_circuit {
        // 4e short-circuit: never acquires a worker slot, never invokes
        // the runner.
        Some(err)
    } else {
        *this.status.lock().unwrap() = Status::Running;
        let slot = pool.acquire().await;
        *this.worker_id.lock().unwrap() = Some(slot.id());

        debug!(module = %this.module.display_name(), worker = slot.id(), "starting");

        let result = if this.module.assume_already_applied {
            Ok(RunnerOutput::default())
        } else {
            let on_line: OutputCallback = {
                let out_buffer = this.out_buffer.clone();
                Arc::new(move |line: &str| {
                    let mut buf = out_buffer.lock().unwrap();
                    buf.push_str(line);
                    buf.push('\n');
                })
            };
            run_with_periodic_flush(this, runner, Some(&on_line)).await
        };

        drop(slot);

        let (output, runner_err) = match result {
            Ok(output) => (output, None),
            Err(e) => (
                RunnerOutput {
                    combined_output: e.combined_output.clone(),
                    exit_status: e.exit_status,
                },
                Some(e),
            ),
        };

        let (output, runner_err) = match handler {
            Some(h) => h(&this.module, output, runner_err),
            None => (output, runner_err),
        };

        if !output.combined_output.is_empty() {
            let mut buf = this.out_buffer.lock().unwrap();
            if buf.is_empty() {
                *buf = output.combined_output;
            }
        }

        runner_err.map(|e| Arc::new(ModuleError::Runner(e)))
    };

    // 4g. Finish section: serialized globally so finish-log + output
    // replay blocks never interleave across runners.
    let guard = finish_mutex.lock().await;

    *this.status.lock().unwrap() = Status::Finished;
    *this.err.lock().unwrap() = final_err.clone();

    match &final_err {
        None => info!(module = %this.module.display_name(), "finished successfully"),
        Some(e) => warn!(module = %this.module.display_name(), error = %e, "finished with an error"),
    }

    // The full captured output, independent of `buffer_index` (which only
    // tracks how much has been flushed to the periodic logger, spec.md §3
    // `bufferIndex`). The writer replay is a separate sink and always gets
    // everything exactly once (spec.md §4.4 step 4g, invariant 9).
    let full_output = this.out_buffer.lock().unwrap().clone();
    if !full_output.is_empty() {
        let mut writer = this.module.options.writer.lock().unwrap();
        let _ = writeln!(writer, "---- {} ----", this.module.display_name());
        let _ = writeln!(writer, "{full_output}");
    }

    drop(guard);

    for &dependent in &this.notify_when_done {
        let _ = senders[dependent]
            .send(DoneNotice {
                from_path: this.module.path.clone(),
                err: final_err.clone(),
            })
            .await;
    }
}

/// Runs the command while periodically flushing the still-unseen tail of
/// the capture buffer to the logger with a "still running" banner
/// (spec.md §4.4 step 4b). A no-op cadence (`refresh_output_delay ==
/// Duration::ZERO`) just awaits the command directly.
async fn run_with_periodic_flush(
    this: &RunningModule,
    runner: &dyn CommandRunner,
    on_line: Option<&OutputCallback>,
) -> Result<RunnerOutput, RunnerError> {
    let delay = this.module.options.refresh_output_delay;
    if delay.is_zero() {
        return runner.run(&this.module.options, on_line).await;
    }

    let command = runner.run(&this.module.options, on_line);
    tokio::pin!(command);
    let mut ticker = tokio::time::interval(delay);
    ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            result = &mut command => return result,
            _ = ticker.tick() => flush_still_running(this),
        }
    }
}

fn flush_still_running(this: &RunningModule) {
    let tail = {
        let buf = this.out_buffer.lock().unwrap();
        let already = this.buffer_index.load(Ordering::SeqCst).min(buf.len());
        buf[already..].to_string()
    };
    if tail.is_empty() {
        return;
    }
    this.buffer_index
        .store(this.out_buffer.lock().unwrap().len(), Ordering::SeqCst);
    info!(module = %this.module.display_name(), "still running:\n{tail}");
}

fn runner_error_arc(err: &ModuleError) -> Arc<RunnerError> {
    match err {
        ModuleError::Runner(r) => Arc::new(r.clone()),
        ModuleError::DependencyFinishedWithError(d) => d.source.clone(),
    }
}

trait CloneForReport {
    fn clone_for_report(&self) -> ModuleError;
}

impl CloneForReport for Arc<ModuleError> {
    fn clone_for_report(&self) -> ModuleError {
        match self.as_ref() {
            ModuleError::Runner(r) => ModuleError::Runner(r.clone()),
            ModuleError::DependencyFinishedWithError(d) => {
                ModuleError::DependencyFinishedWithError(DependencyFinishedWithError {
                    module_path: d.module_path.clone(),
                    failed_dependency_path: d.failed_dependency_path.clone(),
                    source: d.source.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::NonInteractiveApprovalHandler;
    use crate::config::{DependenciesBlock, ModuleConfig, TerraformBlock};
    use crate::error::DefaultAggregator;
    use crate::module::Options;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct ScriptedRunner {
        fail: HashSet<PathBuf>,
        calls: StdMutex<Vec<PathBuf>>,
        order: StdMutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(
            &self,
            options: &Options,
            _on_line: Option<&OutputCallback>,
        ) -> Result<RunnerOutput, RunnerError> {
            self.calls.lock().unwrap().push(options.working_dir.clone());
            self.order.lock().unwrap().push(options.working_dir.clone());
            if self.fail.contains(&options.working_dir) {
                Err(RunnerError {
                    module_path: options.working_dir.clone(),
                    message: "boom".to_string(),
                    exit_status: Some(1),
                    combined_output: String::new(),
                })
            } else {
                Ok(RunnerOutput {
                    combined_output: String::new(),
                    exit_status: Some(0),
                })
            }
        }
    }

    fn options(path: &Path) -> Options {
        Options {
            extra_args: Vec::new(),
            working_dir: path.to_path_buf(),
            logger: tracing::Span::none(),
            writer: Arc::new(std::sync::Mutex::new(std::io::sink())),
            error_writer: Arc::new(std::sync::Mutex::new(std::io::sink())),
            worker_count: None,
            ignore_dependency_errors: false,
            refresh_output_delay: Duration::ZERO,
            non_interactive: true,
            approval_handler: Arc::new(NonInteractiveApprovalHandler),
            check_source_folders: false,
        }
    }

    fn module(root: &Path, name: &str, deps: &[Module]) -> Module {
        let path = root.join(name);
        std::fs::create_dir_all(&path).unwrap();
        let config = ModuleConfig {
            dependencies: DependenciesBlock { paths: Vec::new() },
            terraform: TerraformBlock { source: Some("test".to_string()) },
            remote_state: None,
        };
        let mut m = Module::new(path.clone(), config, options(&path));
        m.dependencies = deps.to_vec();
        m
    }

    use std::path::Path;

    #[tokio::test]
    async fn empty_graph_runs_nothing() {
        let runner = ScriptedRunner {
            fail: HashSet::new(),
            calls: StdMutex::new(Vec::new()),
            order: StdMutex::new(Vec::new()),
        };
        let report = run(&[], &runner, None, DependencyOrder::Normal, &DefaultAggregator).await;
        assert!(report.success());
        assert_eq!(report.exit_status, Some(0));
    }

    #[tokio::test]
    async fn chain_runs_dependency_before_dependent() {
        let dir = tempfile::tempdir().unwrap();
        let a = module(dir.path(), "a", &[]);
        let c = module(dir.path(), "c", std::slice::from_ref(&a));

        let runner = ScriptedRunner {
            fail: HashSet::new(),
            calls: StdMutex::new(Vec::new()),
            order: StdMutex::new(Vec::new()),
        };
        let modules = vec![a.clone(), c.clone()];
        let report = run(&modules, &runner, None, DependencyOrder::Normal, &DefaultAggregator).await;

        assert!(report.success());
        let order = runner.order.lock().unwrap();
        let pos_a = order.iter().position(|p| *p == a.path).unwrap();
        let pos_c = order.iter().position(|p| *p == c.path).unwrap();
        assert!(pos_a < pos_c);
    }

    #[tokio::test]
    async fn failure_does_not_block_independent_module() {
        let dir = tempfile::tempdir().unwrap();
        let a = module(dir.path(), "a", &[]);
        let b = module(dir.path(), "b", &[]);

        let mut fail = HashSet::new();
        fail.insert(a.path.clone());
        let runner = ScriptedRunner {
            fail,
            calls: StdMutex::new(Vec::new()),
            order: StdMutex::new(Vec::new()),
        };
        let modules = vec![a.clone(), b.clone()];
        let report = run(&modules, &runner, None, DependencyOrder::Normal, &DefaultAggregator).await;

        assert!(!report.success());
        let calls = runner.calls.lock().unwrap();
        assert!(calls.contains(&b.path));
    }

    #[tokio::test]
    async fn failure_cascades_to_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let a = module(dir.path(), "a", &[]);
        let b = module(dir.path(), "b", std::slice::from_ref(&a));

        let mut fail = HashSet::new();
        fail.insert(a.path.clone());
        let runner = ScriptedRunner {
            fail,
            calls: StdMutex::new(Vec::new()),
            order: StdMutex::new(Vec::new()),
        };
        let modules = vec![a.clone(), b.clone()];
        let report = run(&modules, &runner, None, DependencyOrder::Normal, &DefaultAggregator).await;

        assert!(!report.success());
        let calls = runner.calls.lock().unwrap();
        assert!(!calls.contains(&b.path), "b must not have run: its dependency failed");

        let multi = report.error.unwrap();
        assert!(multi.errors.iter().any(|e| matches!(
            e,
            ModuleError::DependencyFinishedWithError(d) if d.module_path == b.path
        )));
    }

    #[tokio::test]
    async fn ignore_dependency_errors_runs_every_module() {
        let dir = tempfile::tempdir().unwrap();
        let a = module(dir.path(), "a", &[]);
        let mut b = module(dir.path(), "b", std::slice::from_ref(&a));
        b.options.ignore_dependency_errors = true;

        let mut fail = HashSet::new();
        fail.insert(a.path.clone());
        let runner = ScriptedRunner {
            fail,
            calls: StdMutex::new(Vec::new()),
            order: StdMutex::new(Vec::new()),
        };
        let modules = vec![a.clone(), b.clone()];
        let report = run(&modules, &runner, None, DependencyOrder::Normal, &DefaultAggregator).await;

        assert!(!report.success(), "a's own failure still surfaces");
        let calls = runner.calls.lock().unwrap();
        assert!(calls.contains(&b.path), "b must run despite a's failure");
    }

    #[tokio::test]
    async fn assume_already_applied_never_invokes_runner() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = module(dir.path(), "a", &[]);
        a.assume_already_applied = true;
        let b = module(dir.path(), "b", std::slice::from_ref(&a));

        let runner = ScriptedRunner {
            fail: HashSet::new(),
            calls: StdMutex::new(Vec::new()),
            order: StdMutex::new(Vec::new()),
        };
        let modules = vec![a.clone(), b.clone()];
        let report = run(&modules, &runner, None, DependencyOrder::Normal, &DefaultAggregator).await;

        assert!(report.success());
        let calls = runner.calls.lock().unwrap();
        assert!(!calls.contains(&a.path));
        assert!(calls.contains(&b.path));
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let a = module(dir.path(), "a", &[]);
        let b = module(dir.path(), "b", &[]);
        let mut a = a;
        let mut b = b;
        a.options.worker_count = Some(1);
        b.options.worker_count = Some(1);

        struct SlowRunner {
            concurrent: std::sync::atomic::AtomicUsize,
            max_seen: std::sync::atomic::AtomicUsize,
        }

        #[async_trait]
        impl CommandRunner for SlowRunner {
            async fn run(
                &self,
                _options: &Options,
                _on_line: Option<&OutputCallback>,
            ) -> Result<RunnerOutput, RunnerError> {
                let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                self.concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(RunnerOutput::default())
            }
        }

        let runner = SlowRunner {
            concurrent: std::sync::atomic::AtomicUsize::new(0),
            max_seen: std::sync::atomic::AtomicUsize::new(0),
        };
        let modules = vec![a, b];
        let report = run(&modules, &runner, None, DependencyOrder::Normal, &DefaultAggregator).await;
        assert!(report.success());
        assert_eq!(runner.max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finish_section_replays_full_output_even_after_periodic_flush() {
        // A periodic logger flush partway through a module's run must not
        // shrink what the finish section later writes to the module's
        // writer: the writer replay and the logger's "still running" tail
        // are two independent sinks over the same buffer.
        let dir = tempfile::tempdir().unwrap();
        let mut a = module(dir.path(), "a", &[]);
        a.options.refresh_output_delay = Duration::from_millis(15);
        let written: Arc<std::sync::Mutex<Vec<u8>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        a.options.writer = written.clone();

        struct StreamingRunner;

        #[async_trait]
        impl CommandRunner for StreamingRunner {
            async fn run(
                &self,
                _options: &Options,
                on_line: Option<&OutputCallback>,
            ) -> Result<RunnerOutput, RunnerError> {
                for i in 0..6 {
                    if let Some(cb) = on_line {
                        cb(&format!("line-{i}"));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(RunnerOutput {
                    combined_output: String::new(),
                    exit_status: Some(0),
                })
            }
        }

        let modules = vec![a];
        let report = run(
            &modules,
            &StreamingRunner,
            None,
            DependencyOrder::Normal,
            &DefaultAggregator,
        )
        .await;
        assert!(report.success());

        let replayed = String::from_utf8(written.lock().unwrap().clone()).unwrap();
        for i in 0..6 {
            assert!(
                replayed.contains(&format!("line-{i}")),
                "writer replay is missing line-{i}, got: {replayed}"
            );
        }
    }
}
