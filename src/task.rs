use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::errors::{TaskError, TaskErrors};
use crate::retry::{self, Outcome, RetryError, RetryPolicy};
use crate::BoxError;

/// A cancellation-aware unit of work.
///
/// Implemented for every `Fn(CancellationToken) -> impl Future<Output =
/// Result<(), BoxError>>`, so closures and bound methods work as well as
/// dedicated types.
#[async_trait]
pub trait Work: Send + Sync {
    async fn run(&self, ctx: CancellationToken) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> Work for F
where
    F: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn run(&self, ctx: CancellationToken) -> Result<(), BoxError> {
        self(ctx).await
    }
}

/// Shareable handle to a task body.
#[derive(Clone)]
pub struct TaskFn(Arc<dyn Work>);

impl fmt::Debug for TaskFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskFn")
    }
}

struct Noop;

#[async_trait]
impl Work for Noop {
    async fn run(&self, _ctx: CancellationToken) -> Result<(), BoxError> {
        Ok(())
    }
}

impl TaskFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn from_work(work: impl Work + 'static) -> Self {
        Self(Arc::new(work))
    }

    pub fn noop() -> Self {
        Self(Arc::new(Noop))
    }

    pub async fn run(&self, ctx: CancellationToken) -> Result<(), BoxError> {
        self.0.run(ctx).await
    }

    /// Runs the body once, or in a retry loop when `retry_interval` is set.
    /// Minor failures are retried, anything else stops the loop. When
    /// `timeout` is set the body runs under a child token that is canceled
    /// once the deadline passes.
    pub async fn run_with_policy(
        &self,
        ctx: CancellationToken,
        retry_interval: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Result<(), BoxError> {
        match (retry_interval, timeout) {
            (Some(interval), timeout) => {
                let mut policy = RetryPolicy::new(interval);
                policy.timeout = timeout;
                let result = retry::until_with_policy(&ctx, &policy, |ctx| {
                    let body = self.clone();
                    async move { Outcome::from(body.run(ctx).await) }
                })
                .await;
                if matches!(result, Err(RetryError::TimedOut { .. })) {
                    ctx.cancel();
                }
                result.map_err(RetryError::into_error)
            }
            (None, Some(timeout)) => {
                match tokio::time::timeout(timeout, self.run(ctx.clone())).await {
                    Ok(result) => result,
                    Err(_) => {
                        ctx.cancel();
                        Err(Box::new(RetryError::TimedOut {
                            timeout,
                            attempts: 1,
                            last_error: None,
                        }))
                    }
                }
            }
            (None, None) => self.run(ctx).await,
        }
    }

    /// Retries minor failures every `interval` until success, a severe
    /// failure or cancellation.
    pub fn retry(self, interval: Duration) -> Self {
        self.with_policy(Some(interval), None)
    }

    pub fn retry_until_timeout(self, interval: Duration, timeout: Duration) -> Self {
        self.with_policy(Some(interval), Some(timeout))
    }

    pub fn timeout(self, timeout: Duration) -> Self {
        self.with_policy(None, Some(timeout))
    }

    pub fn skip_if(self, condition: bool) -> Self {
        if condition { Self::noop() } else { self }
    }

    pub fn do_if(self, condition: bool) -> Self {
        self.skip_if(!condition)
    }

    fn with_policy(self, retry_interval: Option<Duration>, timeout: Option<Duration>) -> Self {
        Self::new(move |ctx: CancellationToken| {
            let body = self.clone();
            async move {
                body.run_with_policy(ctx.child_token(), retry_interval, timeout)
                    .await
            }
        })
    }

    /// Runs all bodies concurrently and waits for every one of them. Failures
    /// are aggregated by position (`#0`, `#1`, ...).
    pub fn parallel(fns: impl IntoIterator<Item = TaskFn>) -> Self {
        let fns: Arc<[TaskFn]> = fns.into_iter().collect();
        Self::new(move |ctx: CancellationToken| {
            let fns = fns.clone();
            async move {
                let results = join_all(fns.iter().map(|f| f.run(ctx.clone()))).await;
                let errors: Vec<TaskError> = results
                    .into_iter()
                    .enumerate()
                    .filter_map(|(i, result)| {
                        result
                            .err()
                            .map(|err| TaskError::new(TaskId::detached(i), format!("#{i}"), err))
                    })
                    .collect();
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(Box::new(TaskErrors::new("parallel", errors)) as BoxError)
                }
            }
        })
    }

    /// Runs the bodies one after another, stopping at the first failure.
    pub fn sequential(fns: impl IntoIterator<Item = TaskFn>) -> Self {
        let fns: Arc<[TaskFn]> = fns.into_iter().collect();
        Self::new(move |ctx: CancellationToken| {
            let fns = fns.clone();
            async move {
                for f in fns.iter() {
                    if ctx.is_cancelled() {
                        return Err(crate::errors::cancel());
                    }
                    f.run(ctx.clone()).await?;
                }
                Ok(())
            }
        })
    }
}

/// Opaque handle issued by [`Graph::add`](crate::Graph::add).
///
/// Handles carry the identity of the graph that issued them, so a handle
/// from one graph is never mistaken for a task of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    graph: u64,
    index: usize,
}

impl TaskId {
    pub(crate) fn new(graph: u64, index: usize) -> Self {
        Self { graph, index }
    }

    /// Handle for work that does not belong to any graph.
    pub(crate) fn detached(index: usize) -> Self {
        Self { graph: 0, index }
    }

    pub(crate) fn graph(self) -> u64 {
        self.graph
    }

    pub(crate) fn index(self) -> usize {
        self.index
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}.{}", self.graph, self.index)
    }
}

/// A set of task handles, used to declare dependencies and sync points.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskIds(BTreeSet<TaskId>);

impl TaskIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: TaskId) -> bool {
        self.0.insert(id)
    }

    /// Adds a single handle or every handle of another set.
    pub fn extend_from(&mut self, ids: impl IntoTaskIds) {
        self.0.extend(ids.into_task_ids().0);
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.0.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<TaskId> for TaskIds {
    fn from_iter<I: IntoIterator<Item = TaskId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<TaskId> for TaskIds {
    fn extend<I: IntoIterator<Item = TaskId>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl IntoIterator for TaskIds {
    type Item = TaskId;
    type IntoIter = std::collections::btree_set::IntoIter<TaskId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

pub trait IntoTaskIds {
    fn into_task_ids(self) -> TaskIds;
}

impl IntoTaskIds for TaskId {
    fn into_task_ids(self) -> TaskIds {
        TaskIds(BTreeSet::from([self]))
    }
}

impl IntoTaskIds for TaskIds {
    fn into_task_ids(self) -> TaskIds {
        self
    }
}

impl IntoTaskIds for &TaskIds {
    fn into_task_ids(self) -> TaskIds {
        self.clone()
    }
}

impl<const N: usize> IntoTaskIds for [TaskId; N] {
    fn into_task_ids(self) -> TaskIds {
        self.into_iter().collect()
    }
}

impl IntoTaskIds for Vec<TaskId> {
    fn into_task_ids(self) -> TaskIds {
        self.into_iter().collect()
    }
}

/// Builds a [`TaskIds`] set from any mix of handles and sets.
///
/// ```
/// # use clusterflow::{task_ids, Graph, Task, TaskFn};
/// let mut g = Graph::new("example");
/// let a = g.add(Task::new("a", TaskFn::noop()));
/// let b = g.add(Task::new("b", TaskFn::noop()));
/// let sync_point = task_ids![a, b];
/// let c = g.add(Task::new("c", TaskFn::noop()).depends_on(task_ids![sync_point, a]));
/// # let _ = c;
/// ```
#[macro_export]
macro_rules! task_ids {
    ($($ids:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut ids = $crate::TaskIds::new();
        $( ids.extend_from($ids); )*
        ids
    }};
}

/// A named unit of work plus its scheduling policy.
#[derive(Debug, Clone)]
pub struct Task {
    pub(crate) name: String,
    pub(crate) func: TaskFn,
    pub(crate) dependencies: TaskIds,
    pub(crate) skip_if: bool,
    pub(crate) do_if: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry_interval: Option<Duration>,
}

impl Task {
    pub fn new(name: impl Into<String>, func: TaskFn) -> Self {
        Self {
            name: name.into(),
            func,
            dependencies: TaskIds::new(),
            skip_if: false,
            do_if: true,
            timeout: None,
            retry_interval: None,
        }
    }

    pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::new(name, TaskFn::new(f))
    }

    pub fn depends_on(mut self, ids: impl IntoTaskIds) -> Self {
        self.dependencies.extend_from(ids);
        self
    }

    /// When `true`, the task is never invoked and counts as done for its
    /// dependents.
    pub fn skip_if(mut self, condition: bool) -> Self {
        self.skip_if = condition;
        self
    }

    /// When `false`, the task is skipped like [`Task::skip_if`] but reported
    /// as disabled.
    pub fn do_if(mut self, condition: bool) -> Self {
        self.do_if = condition;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn retry_until_timeout(self, interval: Duration, timeout: Duration) -> Self {
        self.retry_interval(interval).timeout(timeout)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &TaskIds {
        &self.dependencies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::{Mutex, oneshot};
    use tokio::time::{Instant, sleep};

    fn counting(calls: Arc<AtomicU32>, fail_first: u32) -> TaskFn {
        TaskFn::new(move |_ctx| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < fail_first {
                    Err(errors::minor("not yet"))
                } else {
                    Ok(())
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_timeout_combinator() {
        let calls = Arc::new(AtomicU32::new(0));
        let f = counting(calls.clone(), 2)
            .retry_until_timeout(Duration::from_secs(1), Duration::from_secs(10));

        f.run(CancellationToken::new()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_child_token() {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let f = TaskFn::new(move |ctx: CancellationToken| {
            let tx = tx.clone();
            async move {
                tokio::spawn(async move {
                    ctx.cancelled().await;
                    if let Some(tx) = tx.lock().await.take() {
                        let _ = tx.send(());
                    }
                });
                sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        });

        let start = Instant::now();
        let err = f
            .timeout(Duration::from_secs(2))
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(60));
        assert!(errors::is_timeout(&*err));
        assert!(tokio::time::timeout(Duration::from_secs(1), rx).await.is_ok());
    }

    #[tokio::test]
    async fn test_skip_if_replaces_body() {
        let calls = Arc::new(AtomicU32::new(0));
        counting(calls.clone(), 0)
            .skip_if(true)
            .run(CancellationToken::new())
            .await
            .unwrap();
        counting(calls.clone(), 0)
            .do_if(true)
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_parallel_aggregates_failures() {
        let ok = TaskFn::noop();
        let failing = TaskFn::new(|_ctx| async { Err(errors::severe("broken")) });

        let err = TaskFn::parallel([ok, failing.clone(), failing])
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        let errors = err.downcast_ref::<TaskErrors>().unwrap();
        assert_eq!(errors.task_names(), vec!["#1", "#2"]);
    }

    #[tokio::test]
    async fn test_sequential_stops_at_first_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let failing = TaskFn::new(|_ctx| async { Err(BoxError::from("boom")) });

        let fns = [counting(calls.clone(), 0), failing, counting(calls.clone(), 0)];
        let err = TaskFn::sequential(fns)
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_task_ids_macro_merges_sets() {
        let a = TaskId::new(1, 0);
        let b = TaskId::new(1, 1);
        let c = TaskId::new(1, 2);
        let sync_point = task_ids![a, b];
        let ids = task_ids![&sync_point, c, a];

        assert_eq!(ids.len(), 3);
        assert!(ids.contains(a) && ids.contains(b) && ids.contains(c));
        assert!(task_ids![].is_empty());
    }
}
