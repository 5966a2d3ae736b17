//! Cross-peer output merging.
//!
//! Turns the scattered, partially-available outputs of the previous stage
//! into the next stage's training input. Missing peers are the expected
//! case, not an error: the only hard failures here come from the caller's
//! merge or samples functions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;

use flock_protocol::records::{get_outputs, get_rewards};
use flock_protocol::stage::Sample;
use flock_protocol::{KvStore, NodeId, NodeState, SwarmError};

/// Combines every contributor's payload for one question into a single
/// merged record.
pub type MergeFn = Arc<dyn Fn(&BTreeMap<NodeId, Value>) -> Value + Send + Sync>;

/// Builds `(train, test)` datasets from the full list of merged records.
pub type SamplesFn =
    Arc<dyn Fn(Vec<Value>) -> Result<(Vec<Sample>, Vec<Sample>), SwarmError> + Send + Sync>;

#[derive(Clone)]
pub struct MergeOptions {
    /// Soft cap on peer items. The item that crosses the cap is still
    /// included before collection stops.
    pub sample_limit: usize,
    pub check_interval: Duration,
    pub wait_timeout: Duration,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            sample_limit: 200,
            check_interval: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(10),
        }
    }
}

/// Merge the previous stage's outputs into `(train, test)` for stage `stage`.
///
/// The reward record poll is a readiness gate, not a correctness gate: on
/// timeout we proceed with whatever is visible, which may be nothing beyond
/// the local node's own outputs.
pub async fn merge_previous_stage(
    store: &Arc<dyn KvStore>,
    node: &Arc<RwLock<NodeState>>,
    round: u64,
    stage: u64,
    merge_fn: &MergeFn,
    samples_fn: &SamplesFn,
    opts: &MergeOptions,
) -> Result<(Vec<Sample>, Vec<Sample>), SwarmError> {
    let prev_stage = stage.saturating_sub(1);
    let node_key = node.read().await.key.clone();

    // Wait for the previous stage's reward record to show up.
    let mut prev_rewards = fetch_rewards(store, round, prev_stage).await;
    let deadline = Instant::now() + opts.wait_timeout;
    while prev_rewards.is_none() && Instant::now() < deadline {
        tracing::info!(
            round,
            stage = prev_stage,
            "can't retrieve rewards yet; trying again in {:?}",
            opts.check_interval
        );
        tokio::time::sleep(opts.check_interval).await;
        prev_rewards = fetch_rewards(store, round, prev_stage).await;
    }

    // The local node's samples come first, from its own cache if the store
    // has nothing. A node that joined mid-round may have neither.
    let mut prev_items: Vec<(NodeId, Vec<(String, Value)>)> = Vec::new();
    let local = node.read().await.get_stage_outputs(round, prev_stage).cloned();
    match get_outputs(store, &node_key, round, prev_stage, local.as_ref()).await {
        Ok(outputs) => {
            let items = outputs
                .into_iter()
                .map(|(q, (_ts, payload))| (q, payload))
                .collect();
            prev_items.push((node_key.clone(), items));
        }
        Err(e) if e.is_unavailable() => {
            tracing::info!(round, stage = prev_stage, "could not retrieve local outputs");
        }
        Err(e) => return Err(e),
    }

    // Peer samples count only if their rewards are visible.
    if let Some(rewards) = &prev_rewards {
        let mut sample_count = 0usize;
        'contributors: for contributor in rewards.keys() {
            if sample_count > opts.sample_limit {
                break;
            }
            if contributor == &node_key {
                continue;
            }
            match get_outputs(store, contributor, round, prev_stage, None).await {
                Ok(outputs) => {
                    let mut items = Vec::new();
                    for (q, (_ts, payload)) in outputs {
                        items.push((q, payload));
                        sample_count += 1;
                        if sample_count > opts.sample_limit {
                            prev_items.push((contributor.clone(), items));
                            break 'contributors;
                        }
                    }
                    prev_items.push((contributor.clone(), items));
                }
                Err(e) if e.is_unavailable() => {
                    tracing::debug!(
                        contributor = %contributor,
                        "found rewards published but no outputs; skipping"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    // Group by question, one merged record per question. Every collected
    // item lands in the grouping exactly once.
    let mut by_question: BTreeMap<String, BTreeMap<NodeId, Value>> = BTreeMap::new();
    for (contributor, items) in prev_items {
        for (question, payload) in items {
            by_question
                .entry(question)
                .or_default()
                .insert(contributor.clone(), payload);
        }
    }

    let merged: Vec<Value> = by_question.values().map(|keyed| merge_fn(keyed)).collect();
    samples_fn(merged)
}

async fn fetch_rewards(
    store: &Arc<dyn KvStore>,
    round: u64,
    stage: u64,
) -> Option<BTreeMap<NodeId, f64>> {
    match get_rewards(store, round, stage).await {
        Ok(rewards) => rewards,
        Err(e) => {
            tracing::debug!(round, stage, error = %e, "reward record read failed");
            None
        }
    }
}
