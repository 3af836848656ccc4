pub mod config;
pub mod cycle_check;
pub mod error_context;
pub mod errors;
pub mod executor;
pub mod flow;
pub mod graph;
pub mod retry;
pub mod task;

pub use config::{FeatureGates, FlowConfig};
pub use error_context::{ErrorContext, ErrorStatus, Sequence, Step, run_sequential};
pub use errors::{Canceled, Minor, Severe, TaskError, TaskErrors};
pub use executor::{ExecutionState, RunOptions, RunReport, SkipReason, Stats};
pub use flow::Flow;
pub use graph::Graph;
pub use retry::{Outcome, RetryError, RetryPolicy};
pub use task::{IntoTaskIds, Task, TaskFn, TaskId, TaskIds, Work};

use thiserror::Error;

/// Error type returned by task bodies and sequential steps.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Structural defects found while compiling a [`Graph`] into a [`Flow`].
///
/// These are construction-time bugs in the code that builds the graph; they
/// are never retryable.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("flow {flow:?}: task {task:?} depends on {dependency}, which was not issued by this graph")]
    UnknownDependency {
        flow: String,
        task: String,
        dependency: TaskId,
    },
    #[error("flow {flow:?}: cannot add dependencies to {task}, which was not issued by this graph")]
    UnknownTask { flow: String, task: TaskId },
    #[error("flow {flow:?}: circular dependency detected: {}", .path.join(" -> "))]
    CircularDependency { flow: String, path: Vec<String> },
}

/// Run-level result of a failed or canceled flow execution.
#[derive(Error, Debug)]
pub enum FlowError {
    #[error(transparent)]
    Failed(#[from] TaskErrors),
    #[error("flow {flow:?} was canceled before completion{}", canceled_suffix(.errors))]
    Canceled {
        flow: String,
        errors: Option<TaskErrors>,
    },
}

impl FlowError {
    /// Task failures carried by this error, if any.
    pub fn task_errors(&self) -> Option<&TaskErrors> {
        match self {
            FlowError::Failed(errors) => Some(errors),
            FlowError::Canceled { errors, .. } => errors.as_ref(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, FlowError::Canceled { .. })
    }
}

fn canceled_suffix(errors: &Option<TaskErrors>) -> String {
    match errors {
        Some(errors) => format!(" ({} task(s) failed)", errors.len()),
        None => String::new(),
    }
}
