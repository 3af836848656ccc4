use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clusterflow::errors;
use clusterflow::{
    BoxError, CompileError, ErrorContext, ExecutionState, FlowError, Graph, RetryError, RunOptions,
    SkipReason, Step, Task, TaskFn, run_sequential, task_ids,
};
use pretty_assertions::assert_eq;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Timeline = Arc<Mutex<HashMap<&'static str, (Instant, Instant)>>>;

fn timed(name: &'static str, timeline: Timeline, millis: u64) -> Task {
    Task::from_fn(name, move |_ctx| {
        let timeline = timeline.clone();
        async move {
            let start = Instant::now();
            tokio::time::sleep(Duration::from_millis(millis)).await;
            timeline.lock().unwrap().insert(name, (start, Instant::now()));
            Ok(())
        }
    })
}

fn counting(name: &str, calls: Arc<AtomicU32>) -> Task {
    Task::from_fn(name, move |_ctx| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

fn failing(name: &str, message: &'static str) -> Task {
    Task::from_fn(name, move |_ctx| async move { Err(errors::severe(message)) })
}

#[test]
fn cycles_never_compile() {
    let mut g = Graph::new("self loop");
    let a = g.add(Task::new("a", TaskFn::noop()));
    g.add_dependencies(a, a);
    assert!(matches!(g.compile(), Err(CompileError::CircularDependency { .. })));

    let mut g = Graph::new("triangle");
    let a = g.add(Task::new("a", TaskFn::noop()));
    let b = g.add(Task::new("b", TaskFn::noop()).depends_on(a));
    let c = g.add(Task::new("c", TaskFn::noop()).depends_on(b));
    g.add_dependencies(a, c);
    let err = g.compile().unwrap_err();
    assert_eq!(
        err.to_string(),
        "flow \"triangle\": circular dependency detected: a -> c -> b -> a"
    );
}

#[tokio::test(start_paused = true)]
async fn dependencies_finish_before_dependents_start() {
    let timeline = Timeline::default();
    let mut g = Graph::new("diamond");
    let a = g.add(timed("a", timeline.clone(), 30));
    let b = g.add(timed("b", timeline.clone(), 10).depends_on(a));
    let c = g.add(timed("c", timeline.clone(), 20).depends_on(a));
    g.add(timed("d", timeline.clone(), 5).depends_on(task_ids![b, c]));
    let flow = g.compile().unwrap();

    flow.run(RunOptions::default()).await.unwrap();

    let t = timeline.lock().unwrap();
    assert!(t["b"].0 >= t["a"].1);
    assert!(t["c"].0 >= t["a"].1);
    assert!(t["d"].0 >= t["b"].1.max(t["c"].1));
    // b and c are independent and overlap.
    assert!(t["b"].0 < t["c"].1 && t["c"].0 < t["b"].1);
}

#[tokio::test(start_paused = true)]
async fn independent_branches_progress_past_failures() {
    let timeline = Timeline::default();
    let mut g = Graph::new("partial failure");
    let a = g.add(failing("a", "bad input"));
    let b = g.add(Task::new("b", TaskFn::noop()).depends_on(a));
    let c = g.add(timed("c", timeline.clone(), 50));
    let flow = g.compile().unwrap();

    let report = flow.execute(RunOptions::default()).await;

    assert_eq!(report.state(a), Some(ExecutionState::Failed));
    assert_eq!(report.state(b), Some(ExecutionState::Skipped(SkipReason::UpstreamFailed)));
    assert_eq!(report.state(c), Some(ExecutionState::Succeeded));
    assert!(timeline.lock().unwrap().contains_key("c"));
    assert_eq!(report.errors().len(), 1);
}

#[tokio::test]
async fn failure_blocks_descendants_through_skipped_tasks() {
    let mut g = Graph::new("transitive");
    let a = g.add(failing("a", "boom"));
    let b = g.add(Task::new("b", TaskFn::noop()).depends_on(a).skip_if(true));
    let c = g.add(Task::new("c", TaskFn::noop()).depends_on(b));
    let flow = g.compile().unwrap();

    let report = flow.execute(RunOptions::default()).await;

    assert_eq!(report.state(b), Some(ExecutionState::Skipped(SkipReason::Condition)));
    assert_eq!(report.state(c), Some(ExecutionState::Skipped(SkipReason::UpstreamFailed)));
}

#[tokio::test]
async fn skipped_tasks_unblock_dependents() {
    let skipped_calls = Arc::new(AtomicU32::new(0));
    let dependent_calls = Arc::new(AtomicU32::new(0));
    let mut g = Graph::new("skips");
    let a = g.add(counting("a", skipped_calls.clone()).skip_if(true));
    let b = g.add(counting("b", dependent_calls.clone()).depends_on(a));
    let flow = g.compile().unwrap();

    let report = flow.execute(RunOptions::default()).await;

    assert_eq!(skipped_calls.load(Ordering::SeqCst), 0);
    assert_eq!(dependent_calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.state(a), Some(ExecutionState::Skipped(SkipReason::Condition)));
    assert_eq!(report.state(b), Some(ExecutionState::Succeeded));
    assert_eq!(report.completion_order(), &[a, b]);
}

#[tokio::test(start_paused = true)]
async fn minor_failures_are_retried_until_success() {
    let interval = Duration::from_millis(100);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let c = calls.clone();

    let mut g = Graph::new("retry");
    let task = g.add(
        Task::from_fn("flaky", move |_ctx| {
            let c = c.clone();
            async move {
                let mut calls = c.lock().unwrap();
                calls.push(Instant::now());
                if calls.len() <= 3 {
                    return Err(errors::minor("not ready"));
                }
                Ok(())
            }
        })
        .retry_until_timeout(interval, Duration::from_secs(1)),
    );
    let flow = g.compile().unwrap();

    let report = flow.execute(RunOptions::default()).await;

    assert_eq!(report.state(task), Some(ExecutionState::Succeeded));
    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 4);
    for pair in calls.windows(2) {
        assert!(pair[1] - pair[0] >= interval);
    }
}

#[tokio::test(start_paused = true)]
async fn zero_retry_interval_retries_back_to_back() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let mut g = Graph::new("tight retry");
    let task = g.add(
        Task::from_fn("flaky", move |_ctx| {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 3 {
                    return Err(errors::minor("not yet"));
                }
                Ok(())
            }
        })
        .retry_until_timeout(Duration::ZERO, Duration::from_millis(500)),
    );
    let flow = g.compile().unwrap();

    let report = flow.execute(RunOptions::default()).await;

    assert_eq!(report.state(task), Some(ExecutionState::Succeeded));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn minor_failures_without_retry_fail_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let mut g = Graph::new("no retry");
    let task = g.add(Task::from_fn("flaky", move |_ctx| {
        let c = c.clone();
        async move {
            c.fetch_add(1, Ordering::SeqCst);
            Err(errors::minor("not yet"))
        }
    }));
    let flow = g.compile().unwrap();

    let report = flow.execute(RunOptions::default()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.state(task), Some(ExecutionState::Failed));
    assert!(errors::is_minor(&**report.errors()[0].error()));
}

#[tokio::test(start_paused = true)]
async fn retries_give_up_at_the_deadline() {
    let timeout = Duration::from_secs(1);
    let mut g = Graph::new("timeout");
    g.add(
        Task::from_fn("never ready", |_ctx| async { Err(errors::minor("still waiting")) })
            .retry_until_timeout(Duration::from_millis(100), timeout),
    );
    let flow = g.compile().unwrap();

    let start = Instant::now();
    let report = flow.execute(RunOptions::default()).await;

    assert!(start.elapsed() >= timeout);
    let err = report.errors()[0].error();
    assert!(errors::is_timeout(&**err));
    let retry = err.downcast_ref::<RetryError>().unwrap();
    assert_eq!(retry.last_error().unwrap().to_string(), "still waiting");
    assert!(err.to_string().ends_with("last error: still waiting"));
}

#[tokio::test(start_paused = true)]
async fn timeout_without_retry_fails_the_task() {
    let mut g = Graph::new("deadline");
    let task = g.add(
        Task::from_fn("hang", |ctx: CancellationToken| async move {
            ctx.cancelled().await;
            Ok(())
        })
        .timeout(Duration::from_millis(250)),
    );
    let flow = g.compile().unwrap();

    let start = Instant::now();
    let report = flow.execute(RunOptions::default()).await;

    assert!(start.elapsed() >= Duration::from_millis(250));
    assert_eq!(report.state(task), Some(ExecutionState::Failed));
    assert!(errors::is_timeout(&**report.errors()[0].error()));
}

#[tokio::test(start_paused = true)]
async fn severe_failures_stop_retrying_immediately() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let mut g = Graph::new("severe");
    g.add(
        Task::from_fn("rejected", move |_ctx| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(errors::severe("quota exceeded"))
            }
        })
        .retry_until_timeout(Duration::from_secs(10), Duration::from_secs(60)),
    );
    let flow = g.compile().unwrap();

    let start = Instant::now();
    let err = flow.run(RunOptions::default()).await.unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let failed = err.task_errors().unwrap().iter().next().unwrap();
    assert!(errors::is_severe(&**failed.error()));
    assert!(!errors::is_timeout(&**failed.error()));
}

#[tokio::test]
async fn failures_are_aggregated_by_task_name() {
    let mut g = Graph::new("aggregate");
    g.add(failing("alpha", "disk full"));
    g.add(failing("bravo", "permission denied"));
    g.add(Task::new("charlie", TaskFn::noop()));
    let flow = g.compile().unwrap();

    let err = flow.run(RunOptions::default()).await.unwrap_err();

    assert!(!err.is_canceled());
    assert_eq!(err.task_errors().unwrap().task_names(), vec!["alpha", "bravo"]);
    assert_eq!(
        err.to_string(),
        "flow \"aggregate\": 2 task(s) failed:\n\
         * task \"alpha\" failed: disk full\n\
         * task \"bravo\" failed: permission denied"
    );
    assert!(!err.to_string().contains("charlie"));
}

#[tokio::test]
async fn error_context_resolves_once_across_calls() {
    let ctx = ErrorContext::new("reconcile");
    let mut new_ids = Vec::new();
    let mut resolved_ids = Vec::new();

    fn step_x<'a>() -> Step<'a, bool> {
        Step::new("X", |healthy: &mut bool| {
            Box::pin(async move {
                if *healthy {
                    Ok(())
                } else {
                    Err(BoxError::from("X is unhealthy"))
                }
            })
        })
    }

    for attempt in 0..3 {
        let mut healthy = attempt > 0;
        let result = run_sequential(
            &ctx,
            |id| new_ids.push(id.to_string()),
            |id| resolved_ids.push(id.to_string()),
            &mut healthy,
            [step_x()],
        )
        .await;
        assert_eq!(result.is_ok(), attempt > 0);
    }

    let id = clusterflow::error_context::error_id("X");
    assert_eq!(new_ids, vec![id.clone()]);
    assert_eq!(resolved_ids, vec![id]);
}

#[tokio::test(start_paused = true)]
async fn cancellation_skips_unstarted_tasks() {
    let (started_tx, started_rx) = oneshot::channel();
    let started_tx = Arc::new(Mutex::new(Some(started_tx)));
    let calls = Arc::new(AtomicU32::new(0));

    let mut g = Graph::new("cancel");
    let a = g.add(Task::from_fn("a", move |_ctx| {
        let started_tx = started_tx.clone();
        async move {
            if let Some(tx) = started_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }
    }));
    let b = g.add(counting("b", calls.clone()).depends_on(a));
    let c = g.add(counting("c", calls.clone()).depends_on(a));
    let d = g.add(counting("d", calls.clone()).depends_on(task_ids![b, c]));
    let flow = g.compile().unwrap();

    let ctx = CancellationToken::new();
    let canceler = ctx.clone();
    let (report, ()) = tokio::join!(flow.execute(RunOptions::new(ctx)), async move {
        started_rx.await.unwrap();
        canceler.cancel();
    });

    assert_eq!(report.state(a), Some(ExecutionState::Succeeded));
    for id in [b, c, d] {
        assert_eq!(report.state(id), Some(ExecutionState::Skipped(SkipReason::Canceled)));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(report.errors().is_empty());

    let err = report.into_result().unwrap_err();
    assert!(matches!(err, FlowError::Canceled { errors: None, .. }));
    assert!(errors::was_canceled(&err));
}

#[tokio::test]
async fn canceled_before_start_runs_nothing() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut g = Graph::new("precanceled");
    g.add(counting("a", calls.clone()));
    let flow = g.compile().unwrap();

    let ctx = CancellationToken::new();
    ctx.cancel();
    let report = flow.execute(RunOptions::new(ctx)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.stats().skipped, 1);
    assert!(report.was_canceled());
}

#[tokio::test(start_paused = true)]
async fn interrupted_tasks_are_not_remembered_as_failing() {
    let error_context = Arc::new(ErrorContext::new("reconcile"));
    let mut g = Graph::new("interrupted");
    let a = g.add(Task::from_fn("wait for nodes", |ctx: CancellationToken| async move {
        ctx.cancelled().await;
        Err(errors::cancel())
    }));
    let b = g.add(Task::new("delete nodes", TaskFn::noop()).depends_on(a));
    let flow = g.compile().unwrap();

    let ctx = CancellationToken::new();
    let canceler = ctx.clone();
    let opts = RunOptions::new(ctx).with_error_context(error_context.clone());
    let (report, ()) = tokio::join!(flow.execute(opts), async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceler.cancel();
    });

    assert_eq!(report.state(a), Some(ExecutionState::Skipped(SkipReason::Canceled)));
    assert_eq!(report.state(b), Some(ExecutionState::Skipped(SkipReason::Canceled)));
    assert!(report.errors().is_empty());
    assert!(error_context.failing_ids().is_empty());

    let err = report.into_result().unwrap_err();
    assert!(matches!(err, FlowError::Canceled { errors: None, .. }));
}
