use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::BoxError;
use crate::errors;

/// Result of a single attempt inside a retry loop.
#[derive(Debug)]
pub enum Outcome {
    /// Stop retrying, the operation succeeded.
    Done,
    /// Not there yet, try again after the interval.
    NotDone,
    /// Transient failure, try again after the interval.
    Minor(BoxError),
    /// Permanent failure, stop immediately.
    Severe(BoxError),
}

pub fn ok() -> Outcome {
    Outcome::Done
}

pub fn not_ok() -> Outcome {
    Outcome::NotDone
}

pub fn minor_error(err: impl Into<BoxError>) -> Outcome {
    Outcome::Minor(err.into())
}

pub fn severe_error(err: impl Into<BoxError>) -> Outcome {
    Outcome::Severe(err.into())
}

/// Treats `err` as minor until `attempt` reaches `threshold`.
pub fn minor_or_severe_error(attempt: u32, threshold: u32, err: impl Into<BoxError>) -> Outcome {
    if attempt < threshold {
        minor_error(err)
    } else {
        severe_error(err)
    }
}

impl From<Result<(), BoxError>> for Outcome {
    fn from(result: Result<(), BoxError>) -> Self {
        match result {
            Ok(()) => Outcome::Done,
            Err(err) if errors::is_minor(&*err) => Outcome::Minor(err),
            Err(err) => Outcome::Severe(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: None,
            max_interval: Duration::from_secs(30),
            multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    /// Retries at a fixed cadence without a deadline. A zero interval retries
    /// right away.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Grows the wait by `multiplier` after every attempt, capped at
    /// `max_interval`.
    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.multiplier = multiplier;
        self.max_interval = max_interval;
        self
    }

    fn normalized(&self) -> Self {
        let mut policy = self.clone();

        if policy.max_interval < policy.interval {
            policy.max_interval = policy.interval;
        }
        if policy.multiplier < 1.0 {
            policy.multiplier = 1.0;
        }

        policy
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let backoff = self.interval.as_secs_f64() * self.multiplier.powi(exponent);

        if !backoff.is_finite() || backoff > self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(backoff)
        }
    }
}

#[derive(Error, Debug)]
pub enum RetryError {
    #[error("retry failed with timeout after {timeout:?} ({attempts} attempt(s)){}", last_error_suffix(.last_error))]
    TimedOut {
        timeout: Duration,
        attempts: u32,
        last_error: Option<BoxError>,
    },
    #[error("retry canceled after {attempts} attempt(s){}", last_error_suffix(.last_error))]
    Canceled {
        attempts: u32,
        last_error: Option<BoxError>,
    },
    #[error("{0}")]
    Severe(#[source] BoxError),
}

impl RetryError {
    /// The last minor error observed before giving up.
    pub fn last_error(&self) -> Option<&BoxError> {
        match self {
            RetryError::TimedOut { last_error, .. } | RetryError::Canceled { last_error, .. } => {
                last_error.as_ref()
            }
            RetryError::Severe(err) => Some(err),
        }
    }

    pub fn attempts(&self) -> Option<u32> {
        match self {
            RetryError::TimedOut { attempts, .. } | RetryError::Canceled { attempts, .. } => {
                Some(*attempts)
            }
            RetryError::Severe(_) => None,
        }
    }

    /// Unwraps severe failures so callers see the error the operation
    /// returned; timeouts and cancellations stay wrapped.
    pub fn into_error(self) -> BoxError {
        match self {
            RetryError::Severe(err) => err,
            other => Box::new(other),
        }
    }
}

fn last_error_suffix(last_error: &Option<BoxError>) -> String {
    match last_error {
        Some(err) => format!(", last error: {err}"),
        None => String::new(),
    }
}

/// Calls `f` every `interval` until it reports done, fails severely or `ctx`
/// is canceled.
pub async fn until<F, Fut>(
    ctx: &CancellationToken,
    interval: Duration,
    f: F,
) -> Result<(), RetryError>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Outcome>,
{
    until_with_policy(ctx, &RetryPolicy::new(interval), f).await
}

/// Like [`until`], but gives up with [`RetryError::TimedOut`] once `timeout`
/// has elapsed. An attempt still running at the deadline is dropped.
pub async fn until_timeout<F, Fut>(
    ctx: &CancellationToken,
    interval: Duration,
    timeout: Duration,
    f: F,
) -> Result<(), RetryError>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Outcome>,
{
    until_with_policy(ctx, &RetryPolicy::new(interval).with_timeout(timeout), f).await
}

pub async fn until_with_policy<F, Fut>(
    ctx: &CancellationToken,
    policy: &RetryPolicy,
    mut f: F,
) -> Result<(), RetryError>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Outcome>,
{
    let policy = policy.normalized();
    let deadline = policy.timeout.map(|timeout| (Instant::now() + timeout, timeout));
    let mut attempts = 0u32;
    let mut last_error: Option<BoxError> = None;

    loop {
        if ctx.is_cancelled() {
            return Err(RetryError::Canceled {
                attempts,
                last_error,
            });
        }

        attempts += 1;
        let attempt = f(ctx.clone());

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                return Err(RetryError::Canceled { attempts, last_error });
            }
            _ = expired(deadline) => {
                return Err(timed_out(deadline, attempts, last_error));
            }
            outcome = attempt => outcome,
        };

        match outcome {
            Outcome::Done => return Ok(()),
            Outcome::Severe(err) => return Err(RetryError::Severe(err)),
            Outcome::NotDone => {}
            Outcome::Minor(err) => {
                debug!(attempt = attempts, error = %err, "attempt failed, retrying");
                last_error = Some(err);
            }
        }

        let wait = policy.backoff(attempts);

        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                return Err(RetryError::Canceled { attempts, last_error });
            }
            _ = expired(deadline) => {
                return Err(timed_out(deadline, attempts, last_error));
            }
            _ = sleep(wait) => {}
        }
    }
}

async fn expired(deadline: Option<(Instant, Duration)>) {
    match deadline {
        Some((at, _)) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn timed_out(
    deadline: Option<(Instant, Duration)>,
    attempts: u32,
    last_error: Option<BoxError>,
) -> RetryError {
    RetryError::TimedOut {
        timeout: deadline.map(|(_, timeout)| timeout).unwrap_or_default(),
        attempts,
        last_error,
    }
}
