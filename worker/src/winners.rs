//! Round winner selection.
//!
//! Winners are recomputed from the round's terminal merged outputs, not read
//! from the live cumulative reward table: only what survived into the final
//! consensus records counts.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;

use flock_protocol::stage::{RewardCall, StagePipeline};
use flock_protocol::{KvStore, NodeId, NodeState, SwarmError};

use crate::merge::{merge_previous_stage, MergeFn, MergeOptions, SamplesFn};

/// Score every contributing node over the final stage's merged outputs and
/// return the top `limit` identities, best first.
pub async fn select_round_winners(
    store: &Arc<dyn KvStore>,
    node: &Arc<RwLock<NodeState>>,
    pipeline: &StagePipeline,
    round: u64,
    limit: usize,
    opts: &MergeOptions,
) -> Result<Vec<NodeId>, SwarmError> {
    let Some(reward_fn) = pipeline.stages.last().and_then(|s| s.reward_fns.last()).cloned()
    else {
        return Ok(Vec::new());
    };

    // Merge the final stage as-is: no further combination, no sampling.
    let identity_merge: MergeFn =
        Arc::new(|keyed| serde_json::to_value(keyed).unwrap_or(Value::Null));
    let identity_samples: SamplesFn = Arc::new(|merged| Ok((merged.clone(), merged)));
    let (records, _) = merge_previous_stage(
        store,
        node,
        round,
        pipeline.len() as u64,
        &identity_merge,
        &identity_samples,
        opts,
    )
    .await?;

    let mut totals: BTreeMap<NodeId, f64> = BTreeMap::new();
    for record in &records {
        let Some(keyed) = record.as_object() else {
            continue;
        };
        for (node_key, output) in keyed {
            // Every contributor is ranked, even those whose output cannot
            // be scored.
            let total = totals.entry(node_key.clone()).or_insert(0.0);

            let Some(final_answer) = output
                .get("final_agent_decision")
                .and_then(Value::as_object)
                .and_then(|decisions| decisions.values().next())
            else {
                continue;
            };
            let call = RewardCall {
                prompts: vec![json!([
                    {"role": "system", "content": output.get("question").cloned().unwrap_or(Value::Null)},
                    {"role": "system", "content": output.get("stage3_prompt").cloned().unwrap_or(Value::Null)},
                ])],
                completions: vec![json!([
                    {"role": "assistant", "content": final_answer.clone()},
                ])],
                context: output.clone(),
            };
            let scores = {
                let mut n = node.write().await;
                reward_fn(&mut n, &call)
            };
            *total += scores.iter().sum::<f64>();
        }
    }

    let mut ranked: Vec<(NodeId, f64)> = totals.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    Ok(ranked.into_iter().take(limit).map(|(id, _)| id).collect())
}
