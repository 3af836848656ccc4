//! Error qualifiers and aggregation.
//!
//! Task bodies return plain [`BoxError`]s. A failure can be qualified as
//! [`Minor`] (transient, worth retrying) or [`Severe`] (permanent) by wrapping
//! it; an error without a qualifier is treated as severe. [`Canceled`] marks a
//! deliberate early exit that callers must not count as a failure.
//!
//! Classification walks the `source()` chain, so qualifiers survive further
//! wrapping.

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::retry::RetryError;
use crate::{BoxError, FlowError, TaskId};

/// A transient failure; retried when the task has a retry interval.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct Minor(#[source] BoxError);

/// A failure that cannot be fixed by retrying.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct Severe(#[source] BoxError);

/// Deliberate, non-error termination of a sequential routine or a flow.
#[derive(Error, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[error("canceled")]
pub struct Canceled;

/// An error tagged with a stable identifier.
#[derive(Error, Debug)]
#[error("{source}")]
pub struct WithId {
    id: String,
    #[source]
    source: BoxError,
}

impl WithId {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// A task body panicked instead of returning.
#[derive(Error, Debug)]
#[error("task panicked: {message}")]
pub struct TaskPanicked {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Minor,
    Severe,
}

pub fn minor(err: impl Into<BoxError>) -> BoxError {
    Box::new(Minor(err.into()))
}

pub fn severe(err: impl Into<BoxError>) -> BoxError {
    Box::new(Severe(err.into()))
}

/// Returns the signal that stops a sequential routine without failing it.
pub fn cancel() -> BoxError {
    Box::new(Canceled)
}

pub fn with_id(id: impl Into<String>, err: impl Into<BoxError>) -> BoxError {
    Box::new(WithId {
        id: id.into(),
        source: err.into(),
    })
}

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> + 'a {
    std::iter::successors(Some(err), |e: &&'a (dyn StdError + 'static)| (*e).source())
}

/// The outermost qualifier in the chain wins; unqualified errors are severe.
pub fn severity(err: &(dyn StdError + 'static)) -> Severity {
    for e in chain(err) {
        if e.is::<Minor>() {
            return Severity::Minor;
        }
        if e.is::<Severe>() {
            return Severity::Severe;
        }
    }
    Severity::Severe
}

pub fn is_minor(err: &(dyn StdError + 'static)) -> bool {
    severity(err) == Severity::Minor
}

pub fn is_severe(err: &(dyn StdError + 'static)) -> bool {
    severity(err) == Severity::Severe
}

/// Reports whether `err` is, wraps or aggregates a cancellation signal.
pub fn was_canceled(err: &(dyn StdError + 'static)) -> bool {
    chain(err).any(|e| {
        if e.is::<Canceled>() {
            return true;
        }
        if let Some(retry) = e.downcast_ref::<RetryError>() {
            return matches!(retry, RetryError::Canceled { .. });
        }
        if let Some(flow) = e.downcast_ref::<FlowError>() {
            return match flow {
                FlowError::Canceled { .. } => true,
                FlowError::Failed(errors) => errors.contains_canceled(),
            };
        }
        if let Some(errors) = e.downcast_ref::<TaskErrors>() {
            return errors.contains_canceled();
        }
        false
    })
}

/// Reports whether `err` is a timeout raised by a task deadline or a retry
/// loop running out of time.
pub fn is_timeout(err: &(dyn StdError + 'static)) -> bool {
    chain(err).any(|e| {
        matches!(
            e.downcast_ref::<RetryError>(),
            Some(RetryError::TimedOut { .. })
        )
    })
}

/// Returns the identifier attached with [`with_id`], if any.
pub fn error_id<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a str> {
    chain(err).find_map(|e| e.downcast_ref::<WithId>().map(WithId::id))
}

/// The failure of a single task, attributed by name.
#[derive(Error, Debug)]
#[error("task {name:?} failed: {source}")]
pub struct TaskError {
    id: TaskId,
    name: String,
    #[source]
    source: BoxError,
}

impl TaskError {
    pub(crate) fn new(id: TaskId, name: impl Into<String>, source: BoxError) -> Self {
        Self {
            id,
            name: name.into(),
            source,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn error(&self) -> &BoxError {
        &self.source
    }

    pub fn into_error(self) -> BoxError {
        self.source
    }
}

/// All task failures of one flow run, in graph order.
#[derive(Debug)]
pub struct TaskErrors {
    flow: String,
    errors: Vec<TaskError>,
}

impl TaskErrors {
    pub(crate) fn new(flow: impl Into<String>, mut errors: Vec<TaskError>) -> Self {
        errors.sort_by_key(TaskError::id);
        Self {
            flow: flow.into(),
            errors,
        }
    }

    pub fn flow(&self) -> &str {
        &self.flow
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TaskError> {
        self.errors.iter()
    }

    pub fn task_names(&self) -> Vec<&str> {
        self.errors.iter().map(TaskError::name).collect()
    }

    pub fn contains_canceled(&self) -> bool {
        self.errors.iter().any(|e| was_canceled(e))
    }
}

impl fmt::Display for TaskErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flow {:?}: {} task(s) failed:",
            self.flow,
            self.errors.len()
        )?;
        for err in &self.errors {
            write!(f, "\n* {err}")?;
        }
        Ok(())
    }
}

impl StdError for TaskErrors {}

impl IntoIterator for TaskErrors {
    type Item = TaskError;
    type IntoIter = std::vec::IntoIter<TaskError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a TaskErrors {
    type Item = &'a TaskError;
    type IntoIter = std::slice::Iter<'a, TaskError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::task::{Task, TaskFn};

    #[derive(Error, Debug)]
    #[error("context: {0}")]
    struct Context(#[source] BoxError);

    fn ids(n: usize) -> Vec<TaskId> {
        let mut graph = Graph::new("ids");
        (0..n)
            .map(|i| graph.add(Task::new(format!("t{i}"), TaskFn::noop())))
            .collect()
    }

    #[test]
    fn unqualified_errors_are_severe() {
        let err: BoxError = "boom".into();
        assert_eq!(severity(&*err), Severity::Severe);
    }

    #[test]
    fn qualifiers_survive_wrapping() {
        let err: BoxError = Box::new(Context(minor("flaky")));
        assert!(is_minor(&*err));
        assert_eq!(err.to_string(), "context: flaky");

        let err: BoxError = Box::new(Context(severe("rejected")));
        assert!(is_severe(&*err));
    }

    #[test]
    fn outermost_qualifier_wins() {
        let err = severe(minor("flaky"));
        assert!(is_severe(&*err));
    }

    #[test]
    fn cancellation_is_detected_through_ids_and_aggregates() {
        assert!(was_canceled(&*cancel()));
        assert!(was_canceled(&*with_id("abc", cancel())));
        assert!(!was_canceled(&*severe("boom")));

        let id = ids(1)[0];
        let errors = TaskErrors::new("flow", vec![TaskError::new(id, "a", cancel())]);
        assert!(was_canceled(&errors));
        assert!(was_canceled(&FlowError::Failed(errors)));
    }

    #[test]
    fn error_ids_are_readable_through_the_chain() {
        let err: BoxError = Box::new(Context(with_id("abc", "boom")));
        assert_eq!(error_id(&*err), Some("abc"));
        assert_eq!(error_id(&*severe("boom")), None);
    }

    #[test]
    fn aggregate_summary_is_ordered_by_graph_position() {
        let ids = ids(2);
        let errors = TaskErrors::new(
            "deploy",
            vec![
                TaskError::new(ids[1], "second", "late".into()),
                TaskError::new(ids[0], "first", "early".into()),
            ],
        );

        pretty_assertions::assert_eq!(
            errors.to_string(),
            "flow \"deploy\": 2 task(s) failed:\n\
             * task \"first\" failed: early\n\
             * task \"second\" failed: late"
        );
        assert_eq!(errors.task_names(), vec!["first", "second"]);
    }
}
