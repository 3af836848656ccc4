use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::error_context::{ErrorContext, error_id};
use crate::errors::{self, TaskError, TaskErrors, TaskPanicked};
use crate::flow::Flow;
use crate::task::TaskId;
use crate::{BoxError, FlowError};

/// Receives `(completed, total)` every time a task reaches a terminal state.
pub type ProgressReporter = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Receives the error identifier of a task that failed in an earlier attempt
/// and has now succeeded.
pub type ErrorCleaner = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct RunOptions {
    context: CancellationToken,
    progress_reporter: Option<ProgressReporter>,
    error_cleaner: Option<ErrorCleaner>,
    error_context: Option<Arc<ErrorContext>>,
    max_concurrency: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("canceled", &self.context.is_cancelled())
            .field("progress_reporter", &self.progress_reporter.is_some())
            .field("error_cleaner", &self.error_cleaner.is_some())
            .field("error_context", &self.error_context)
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

impl RunOptions {
    pub fn new(context: CancellationToken) -> Self {
        Self {
            context,
            progress_reporter: None,
            error_cleaner: None,
            error_context: None,
            max_concurrency: None,
        }
    }

    pub fn with_progress_reporter(
        mut self,
        reporter: impl Fn(usize, usize) + Send + Sync + 'static,
    ) -> Self {
        self.progress_reporter = Some(Arc::new(reporter));
        self
    }

    pub fn with_error_cleaner(
        mut self,
        cleaner: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        self.error_cleaner = Some(Arc::new(cleaner));
        self
    }

    pub fn with_error_context(mut self, error_context: Arc<ErrorContext>) -> Self {
        self.error_context = Some(error_context);
        self
    }

    /// Caps the number of tasks running at once. Ready tasks beyond the cap
    /// wait in dependency-settlement order.
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    pub fn context(&self) -> &CancellationToken {
        &self.context
    }

    pub fn max_concurrency(&self) -> Option<usize> {
        self.max_concurrency
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// The task's `skip_if` condition was true.
    Condition,
    /// The task's `do_if` condition was false.
    Disabled,
    /// A task it depends on, directly or transitively, failed.
    UpstreamFailed,
    /// The run was canceled before the task could start, or the task
    /// returned a cancellation signal instead of a result.
    Canceled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::Condition => "skip condition met",
            SkipReason::Disabled => "disabled",
            SkipReason::UpstreamFailed => "upstream task failed",
            SkipReason::Canceled => "run canceled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionState {
    Pending,
    Running,
    Succeeded,
    Skipped(SkipReason),
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Succeeded | ExecutionState::Skipped(_) | ExecutionState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Final state of every task after one run.
#[derive(Debug)]
pub struct RunReport {
    flow: String,
    ids: Vec<TaskId>,
    states: Vec<ExecutionState>,
    completion_order: Vec<TaskId>,
    errors: Vec<TaskError>,
    canceled: bool,
    elapsed: Duration,
}

impl RunReport {
    pub fn flow(&self) -> &str {
        &self.flow
    }

    pub fn state(&self, id: TaskId) -> Option<ExecutionState> {
        let index = id.index();
        (self.ids.get(index) == Some(&id)).then(|| self.states[index])
    }

    pub fn states(&self) -> impl Iterator<Item = (TaskId, ExecutionState)> + '_ {
        self.ids.iter().copied().zip(self.states.iter().copied())
    }

    /// Tasks in the order they reached a terminal state.
    pub fn completion_order(&self) -> &[TaskId] {
        &self.completion_order
    }

    pub fn errors(&self) -> &[TaskError] {
        &self.errors
    }

    pub fn was_canceled(&self) -> bool {
        self.canceled
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn stats(&self) -> Stats {
        self.states.iter().fold(
            Stats {
                total: self.states.len(),
                ..Stats::default()
            },
            |mut stats, state| {
                match state {
                    ExecutionState::Succeeded => stats.succeeded += 1,
                    ExecutionState::Failed => stats.failed += 1,
                    ExecutionState::Skipped(_) => stats.skipped += 1,
                    ExecutionState::Pending | ExecutionState::Running => {}
                }
                stats
            },
        )
    }

    pub fn into_result(self) -> Result<(), FlowError> {
        let RunReport {
            flow,
            errors,
            canceled,
            ..
        } = self;

        match (canceled, errors.is_empty()) {
            (false, true) => Ok(()),
            (false, false) => Err(FlowError::Failed(TaskErrors::new(flow, errors))),
            (true, true) => Err(FlowError::Canceled { flow, errors: None }),
            (true, false) => Err(FlowError::Canceled {
                errors: Some(TaskErrors::new(flow.clone(), errors)),
                flow,
            }),
        }
    }
}

type Completion = (usize, Result<(), BoxError>);

pub(crate) async fn execute(flow: &Flow, opts: RunOptions) -> RunReport {
    let span = info_span!("flow", flow = %flow.name(), tasks = flow.len());
    Execution::new(flow, opts).drive().instrument(span).await
}

/// Bookkeeping of a single run. Only the dispatch loop touches it; spawned
/// tasks report back through the completion channel.
struct Execution<'f> {
    flow: &'f Flow,
    opts: RunOptions,
    states: Vec<ExecutionState>,
    unsettled: Vec<usize>,
    blocked: Vec<bool>,
    started: Vec<Option<Instant>>,
    ready: VecDeque<usize>,
    running: usize,
    completed: usize,
    canceled: bool,
    completion_order: Vec<TaskId>,
    errors: Vec<TaskError>,
}

impl<'f> Execution<'f> {
    fn new(flow: &'f Flow, opts: RunOptions) -> Self {
        let unsettled: Vec<usize> = flow.nodes().iter().map(|n| n.dependencies.len()).collect();
        let ready = (0..unsettled.len()).filter(|&i| unsettled[i] == 0).collect();

        Self {
            flow,
            opts,
            states: vec![ExecutionState::Pending; flow.len()],
            unsettled,
            blocked: vec![false; flow.len()],
            started: vec![None; flow.len()],
            ready,
            running: 0,
            completed: 0,
            canceled: false,
            completion_order: Vec::with_capacity(flow.len()),
            errors: Vec::new(),
        }
    }

    async fn drive(mut self) -> RunReport {
        let start = Instant::now();
        let total = self.flow.len();
        let limit = self.opts.max_concurrency.unwrap_or(usize::MAX);
        let ctx = self.opts.context.clone();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();

        info!("starting flow");

        while self.completed < total {
            if !self.canceled && ctx.is_cancelled() {
                self.mark_canceled();
            }

            self.dispatch_ready(limit, &done_tx);
            if self.completed == total {
                break;
            }

            tokio::select! {
                Some((index, result)) = done_rx.recv() => {
                    self.running -= 1;
                    self.finish(index, result);
                }
                _ = ctx.cancelled(), if !self.canceled => {
                    self.mark_canceled();
                }
            }
        }

        self.into_report(start.elapsed())
    }

    fn mark_canceled(&mut self) {
        self.canceled = true;
        warn!(
            running = self.running,
            remaining = self.flow.len() - self.completed - self.running,
            "flow canceled, no further tasks will be started"
        );
    }

    fn dispatch_ready(&mut self, limit: usize, done_tx: &mpsc::UnboundedSender<Completion>) {
        let mut deferred = VecDeque::new();

        while let Some(index) = self.ready.pop_front() {
            if let Some(reason) = self.skip_reason(index) {
                let name = self.flow.nodes()[index].task.name();
                debug!(task = %name, %reason, "skipping task");
                self.settle(index, ExecutionState::Skipped(reason));
            } else if self.running < limit {
                self.spawn_task(index, done_tx.clone());
            } else {
                deferred.push_back(index);
            }
        }

        self.ready = deferred;
    }

    fn skip_reason(&self, index: usize) -> Option<SkipReason> {
        let task = &self.flow.nodes()[index].task;

        if task.skip_if {
            Some(SkipReason::Condition)
        } else if !task.do_if {
            Some(SkipReason::Disabled)
        } else if self.blocked[index] {
            Some(SkipReason::UpstreamFailed)
        } else if self.canceled {
            Some(SkipReason::Canceled)
        } else {
            None
        }
    }

    fn spawn_task(&mut self, index: usize, done_tx: mpsc::UnboundedSender<Completion>) {
        let task = &self.flow.nodes()[index].task;
        let func = task.func.clone();
        let (retry_interval, timeout) = (task.retry_interval, task.timeout);
        let ctx = self.opts.context.child_token();
        let span = info_span!("task", task = %task.name());

        debug!(task = %task.name(), "starting task");
        self.states[index] = ExecutionState::Running;
        self.started[index] = Some(Instant::now());
        self.running += 1;

        tokio::spawn(
            async move {
                let result = AssertUnwindSafe(func.run_with_policy(ctx, retry_interval, timeout))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(Box::new(TaskPanicked {
                            message: panic_message(panic.as_ref()),
                        }) as BoxError)
                    });

                // The receiver is gone only if the run itself was dropped.
                let _ = done_tx.send((index, result));
            }
            .instrument(span),
        );
    }

    fn finish(&mut self, index: usize, result: Result<(), BoxError>) {
        let flow = self.flow;
        let node = &flow.nodes()[index];
        let name = node.task.name();
        let elapsed_ms = self.started[index]
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or_default();
        let id = error_id(name);

        match result {
            Ok(()) => {
                info!(task = %name, elapsed_ms, "task succeeded");
                if let Some(error_context) = &self.opts.error_context {
                    if error_context.resolve(&id) {
                        debug!(task = %name, error_id = %id, "cleaning error of earlier attempt");
                        if let Some(cleaner) = &self.opts.error_cleaner {
                            cleaner(&id);
                        }
                    }
                }
                self.settle(index, ExecutionState::Succeeded);
            }
            Err(err) if errors::was_canceled(&*err) => {
                warn!(task = %name, elapsed_ms, "task stopped on cancellation");
                self.settle(index, ExecutionState::Skipped(SkipReason::Canceled));
            }
            Err(err) => {
                error!(task = %name, elapsed_ms, error = %err, "task failed");
                if let Some(error_context) = &self.opts.error_context {
                    error_context.add_error_id(id);
                }
                self.errors.push(TaskError::new(node.id, name, err));
                self.settle(index, ExecutionState::Failed);
            }
        }
    }

    /// Records a terminal state and releases dependents whose dependencies
    /// have all settled. Failure blocks every dependent transitively.
    fn settle(&mut self, index: usize, state: ExecutionState) {
        let flow = self.flow;

        self.states[index] = state;
        self.completed += 1;
        self.completion_order.push(flow.nodes()[index].id);

        if let Some(report) = &self.opts.progress_reporter {
            report(self.completed, flow.len());
        }

        let block = state == ExecutionState::Failed || self.blocked[index];
        for &child in flow.dependents_of(index) {
            if block {
                self.blocked[child] = true;
            }
            self.unsettled[child] -= 1;
            if self.unsettled[child] == 0 {
                self.ready.push_back(child);
            }
        }
    }

    fn into_report(self, elapsed: Duration) -> RunReport {
        let elapsed_ms = elapsed.as_millis() as u64;

        if self.canceled {
            warn!(elapsed_ms, failed = self.errors.len(), "flow canceled");
        } else if self.errors.is_empty() {
            info!(elapsed_ms, "flow succeeded");
        } else {
            error!(elapsed_ms, failed = self.errors.len(), "flow failed");
        }

        RunReport {
            flow: self.flow.name().to_string(),
            ids: self.flow.nodes().iter().map(|n| n.id).collect(),
            states: self.states,
            completion_order: self.completion_order,
            errors: self.errors,
            canceled: self.canceled,
            elapsed,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
