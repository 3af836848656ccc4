use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::executor::RunOptions;

/// Named feature toggles handed to the code that builds a graph.
///
/// Graph construction reads gates from here instead of process-wide state,
/// so the same inputs always produce the same flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureGates(BTreeMap<String, bool>);

impl FeatureGates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, gate: impl Into<String>, enabled: bool) -> Self {
        self.set(gate, enabled);
        self
    }

    pub fn set(&mut self, gate: impl Into<String>, enabled: bool) {
        self.0.insert(gate.into(), enabled);
    }

    /// Unknown gates are disabled.
    pub fn is_enabled(&self, gate: &str) -> bool {
        self.0.get(gate).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FlowConfig {
    /// Upper bound on tasks running at once; unbounded when unset.
    pub max_concurrency: Option<usize>,
    pub retry_interval_ms: u64,
    pub retry_timeout_ms: u64,
    pub feature_gates: FeatureGates,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            retry_interval_ms: 5_000,
            retry_timeout_ms: 30_000,
            feature_gates: FeatureGates::default(),
        }
    }
}

impl FlowConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn run_options(&self, context: CancellationToken) -> RunOptions {
        let opts = RunOptions::new(context);
        match self.max_concurrency {
            Some(limit) => opts.with_max_concurrency(limit),
            None => opts,
        }
    }
}
