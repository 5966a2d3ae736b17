use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use crate::keys::ensure_hashed;
use crate::types::{NodeId, TimedPayload};

/// Process-local state of one swarm participant.
///
/// Owned exclusively by the node's driver loop; peers only ever see what
/// this node publishes to the store. The output cache is stage-scoped and
/// cleared after each round completes or restarts.
pub struct NodeState {
    pub key: NodeId,
    pub is_coordinator: bool,

    pub round: u64,
    pub stage: u64,

    /// TTL applied to everything this node publishes.
    pub out_ttl: Duration,

    /// Side channel written by the reward functions during the last training
    /// step; the aggregator reads these immediately after each call.
    pub last_outputs: Value,
    pub last_rewards: Vec<f64>,

    // (round, stage) -> question hash -> (timestamp, payload)
    round_cache: HashMap<(u64, u64), HashMap<String, TimedPayload>>,
}

impl NodeState {
    pub fn new(key: impl Into<NodeId>) -> Self {
        Self {
            key: key.into(),
            is_coordinator: false,
            round: 0,
            stage: 0,
            out_ttl: Duration::from_secs(60 * 60 * 4),
            last_outputs: Value::Null,
            last_rewards: Vec::new(),
            round_cache: HashMap::new(),
        }
    }

    pub fn coordinator(key: impl Into<NodeId>) -> Self {
        Self {
            is_coordinator: true,
            ..Self::new(key)
        }
    }

    /// Local fallback for this node's own published outputs, keyed the same
    /// way the store record is.
    pub fn get_stage_outputs(&self, round: u64, stage: u64) -> Option<&HashMap<String, TimedPayload>> {
        self.round_cache.get(&(round, stage))
    }

    pub fn put_stage_outputs(&mut self, round: u64, stage: u64, question: &str, value: TimedPayload) {
        self.round_cache
            .entry((round, stage))
            .or_default()
            .insert(ensure_hashed(question), value);
    }

    pub fn clear_stage_cache(&mut self) {
        self.round_cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::question_hash;
    use serde_json::json;

    #[test]
    fn test_stage_cache_keys_are_hashed() {
        let mut node = NodeState::new("n1");
        node.put_stage_outputs(0, 0, "raw question", (1.0, json!({"a": 1})));

        let cached = node.get_stage_outputs(0, 0).unwrap();
        assert!(cached.contains_key(&question_hash("raw question")));
        assert!(node.get_stage_outputs(0, 1).is_none());

        node.clear_stage_cache();
        assert!(node.get_stage_outputs(0, 0).is_none());
    }
}
