//! Stage pipeline descriptors.
//!
//! A round is one pass through an ordered, immutable sequence of stages.
//! Each stage carries its own reward functions and a dataset builder; stage
//! 0 builds from a fixed initial dataset, later stages build from the merged
//! outputs of the stage before them.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::SwarmError;
use crate::node::NodeState;

/// One training example / question record. Shape is stage-specific and
/// opaque to the protocol.
pub type Sample = Value;

/// The arguments every reward function is called with.
pub struct RewardCall {
    /// Per-completion prompt message lists.
    pub prompts: Vec<Value>,
    /// Per-prompt completion message lists.
    pub completions: Vec<Value>,
    /// The sample the completions answer, merged-record fields included.
    pub context: Value,
}

/// Domain-specific scoring, supplied externally. Returns one score per
/// completion and may write the node's last-output/last-reward side channel.
pub type RewardFn = Arc<dyn Fn(&mut NodeState, &RewardCall) -> Vec<f64> + Send + Sync>;

/// Async builder for a stage's `(train, test)` datasets.
pub type DatasetsFn = Arc<
    dyn Fn(u64, u64) -> BoxFuture<'static, Result<(Vec<Sample>, Vec<Sample>), SwarmError>>
        + Send
        + Sync,
>;

pub struct Stage {
    pub name: String,
    pub reward_fns: Vec<RewardFn>,
    pub datasets_fn: DatasetsFn,
}

pub struct StagePipeline {
    pub stages: Vec<Stage>,
    pub max_rounds: u64,
    pub train_timeout: Duration,
    pub round_timeout: Duration,
}

impl StagePipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            stages,
            max_rounds: 100,
            train_timeout: Duration::from_secs(60 * 60 * 24 * 4),
            round_timeout: Duration::from_secs(60 * 60 * 4),
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
