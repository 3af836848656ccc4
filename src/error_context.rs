//! Attempt memory for routines that are re-run on every reconciliation.
//!
//! An [`ErrorContext`] remembers which named steps failed in earlier calls so
//! that a later success can trigger compensating cleanup exactly once. The
//! same memory is consulted by [`Flow::run`](crate::Flow::run) for graph
//! tasks when one is passed in the run options.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::BoxError;
use crate::errors;

/// Stable identifier for a named step or task.
pub fn error_id(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    hex::encode(&digest[..16])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    Failing,
    Resolved,
}

/// Cross-invocation memory of failing error identifiers.
///
/// The caller owns its lifecycle; nothing is ever expired automatically.
#[derive(Debug, Default)]
pub struct ErrorContext {
    name: String,
    ids: Mutex<BTreeMap<String, ErrorStatus>>,
}

impl ErrorContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ids: Mutex::default(),
        }
    }

    /// Seeds the context with identifiers persisted from an earlier attempt.
    pub fn with_last_error_ids<I, S>(name: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let context = Self::new(name);
        for id in ids {
            context.add_error_id(id);
        }
        context
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ids(&self) -> MutexGuard<'_, BTreeMap<String, ErrorStatus>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `id` as failing. Returns `true` if it was not failing before.
    pub fn add_error_id(&self, id: impl Into<String>) -> bool {
        self.ids().insert(id.into(), ErrorStatus::Failing) != Some(ErrorStatus::Failing)
    }

    pub fn has_error_id(&self, id: &str) -> bool {
        self.status(id) == Some(ErrorStatus::Failing)
    }

    pub fn status(&self, id: &str) -> Option<ErrorStatus> {
        self.ids().get(id).copied()
    }

    /// Marks a failing `id` as resolved. Returns `true` only on the
    /// transition, so callers notify at most once per failure.
    pub fn resolve(&self, id: &str) -> bool {
        match self.ids().get_mut(id) {
            Some(status) if *status == ErrorStatus::Failing => {
                *status = ErrorStatus::Resolved;
                true
            }
            _ => false,
        }
    }

    /// Identifiers currently failing, sorted.
    pub fn failing_ids(&self) -> Vec<String> {
        self.ids()
            .iter()
            .filter(|(_, status)| **status == ErrorStatus::Failing)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[derive(Error, Debug)]
#[error("{step}: {source}")]
pub struct StepError {
    pub step: String,
    #[source]
    pub source: BoxError,
}

type StepFn<'a, S> =
    Box<dyn for<'s> FnOnce(&'s mut S) -> BoxFuture<'s, Result<(), BoxError>> + Send + 'a>;

/// A named step of a sequential routine.
pub struct Step<'a, S> {
    name: String,
    func: StepFn<'a, S>,
}

impl<'a, S> Step<'a, S> {
    /// `f` receives the routine's shared state and returns a boxed future,
    /// typically `|state| Box::pin(async move { ... })`.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: for<'s> FnOnce(&'s mut S) -> BoxFuture<'s, Result<(), BoxError>> + Send + 'a,
    {
        Self {
            name: name.into(),
            func: Box::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

type Hook<'a> = Box<dyn FnMut(&str) + Send + 'a>;

/// Strictly ordered list of steps that stops at the first failure.
pub struct Sequence<'a, S> {
    error_context: &'a ErrorContext,
    on_new_error_id: Option<Hook<'a>>,
    on_resolved_error_id: Option<Hook<'a>>,
    steps: Vec<Step<'a, S>>,
}

impl<'a, S: Send> Sequence<'a, S> {
    pub fn new(error_context: &'a ErrorContext) -> Self {
        Self {
            error_context,
            on_new_error_id: None,
            on_resolved_error_id: None,
            steps: Vec::new(),
        }
    }

    /// Called with the identifier of a step that starts failing.
    pub fn on_new_error_id(mut self, hook: impl FnMut(&str) + Send + 'a) -> Self {
        self.on_new_error_id = Some(Box::new(hook));
        self
    }

    /// Called with the identifier of a previously failing step that
    /// succeeded again.
    pub fn on_resolved_error_id(mut self, hook: impl FnMut(&str) + Send + 'a) -> Self {
        self.on_resolved_error_id = Some(Box::new(hook));
        self
    }

    pub fn step<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: for<'s> FnOnce(&'s mut S) -> BoxFuture<'s, Result<(), BoxError>> + Send + 'a,
    {
        self.steps.push(Step::new(name, f));
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = Step<'a, S>>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Executes the steps in order against `state`.
    ///
    /// A step returning [`Canceled`](crate::Canceled) stops the routine and
    /// the signal is returned unchanged, without recording an identifier.
    /// Any other failure is recorded and returned wrapped with the step's
    /// identifier.
    pub async fn run(self, state: &mut S) -> Result<(), BoxError> {
        let Sequence {
            error_context,
            mut on_new_error_id,
            mut on_resolved_error_id,
            steps,
        } = self;

        for step in steps {
            let id = error_id(&step.name);

            match (step.func)(&mut *state).await {
                Ok(()) => {
                    if error_context.resolve(&id) {
                        debug!(
                            context = %error_context.name(),
                            step = %step.name,
                            error_id = %id,
                            "step recovered"
                        );
                        if let Some(hook) = on_resolved_error_id.as_mut() {
                            hook(&id);
                        }
                    }
                }
                Err(err) if errors::was_canceled(&*err) => {
                    debug!(context = %error_context.name(), step = %step.name, "sequence canceled");
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        context = %error_context.name(),
                        step = %step.name,
                        error_id = %id,
                        error = %err,
                        "step failed"
                    );
                    if error_context.add_error_id(id.clone()) {
                        if let Some(hook) = on_new_error_id.as_mut() {
                            hook(&id);
                        }
                    }
                    return Err(errors::with_id(
                        id,
                        StepError {
                            step: step.name,
                            source: err,
                        },
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Functional form of [`Sequence`].
pub async fn run_sequential<'a, S: Send>(
    error_context: &'a ErrorContext,
    on_new_error_id: impl FnMut(&str) + Send + 'a,
    on_resolved_error_id: impl FnMut(&str) + Send + 'a,
    state: &mut S,
    steps: impl IntoIterator<Item = Step<'a, S>>,
) -> Result<(), BoxError> {
    Sequence::new(error_context)
        .on_new_error_id(on_new_error_id)
        .on_resolved_error_id(on_resolved_error_id)
        .steps(steps)
        .run(state)
        .await
}
