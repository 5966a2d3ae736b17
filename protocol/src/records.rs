//! Typed readers for the shared record families.
//!
//! All of these treat "not written yet" as a normal outcome: they return
//! `SwarmError::Unavailable` (or `None`) rather than failing, because any
//! record may lag behind the swarm at any moment.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::Value;

use crate::error::{StoreError, SwarmError};
use crate::keys::{self, hash_question_keys};
use crate::store::{KvStore, StoreValue};
use crate::types::{Leaderboard, NodeId, RoundStage, TimedPayload};

/// Fan-out hint for the reward record: it has one subkey per participant,
/// so a routine lookup would otherwise miss most of the swarm.
const REWARDS_BEAM: usize = 500;

/// Where the swarm currently is, per the coordinator-published pointer.
pub async fn get_round_and_stage(store: &Arc<dyn KvStore>) -> Result<RoundStage, SwarmError> {
    let value = store.get(keys::ROUND_STAGE_KEY, None, true).await?;
    let scalar = value
        .as_ref()
        .and_then(StoreValue::as_scalar)
        .ok_or_else(|| SwarmError::Unavailable("round/stage pointer".into()))?;
    serde_json::from_value(scalar.clone())
        .map_err(|_| SwarmError::Unavailable("round/stage pointer".into()))
}

/// One node's outputs for `(round, stage)`: question hash -> (ts, payload).
///
/// Tries the provided local cache before the store so a node's own
/// participation never depends on store visibility. Question keys are
/// re-hashed on the way out for legacy producers.
pub async fn get_outputs(
    store: &Arc<dyn KvStore>,
    node_key: &str,
    round: u64,
    stage: u64,
    local: Option<&HashMap<String, TimedPayload>>,
) -> Result<BTreeMap<String, TimedPayload>, SwarmError> {
    if let Some(cached) = local {
        if !cached.is_empty() {
            let raw = cached
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::to_value(v).unwrap_or(Value::Null)))
                .collect();
            return decode_outputs(raw);
        }
    }

    let key = keys::outputs_key(node_key, round, stage);
    if let Some(StoreValue::Map(raw)) = store.get(&key, None, false).await? {
        return decode_outputs(raw);
    }

    Err(SwarmError::Unavailable(format!(
        "outputs for {node_key} at round {round} stage {stage}"
    )))
}

fn decode_outputs(raw: BTreeMap<String, Value>) -> Result<BTreeMap<String, TimedPayload>, SwarmError> {
    let mut out = BTreeMap::new();
    for (question, value) in hash_question_keys(raw) {
        let timed: TimedPayload = serde_json::from_value(value).map_err(StoreError::from)?;
        out.insert(question, timed);
    }
    Ok(out)
}

/// Cumulative rewards for `(round, stage)`: node id -> running total.
/// `Ok(None)` simply means nobody has published yet.
pub async fn get_rewards(
    store: &Arc<dyn KvStore>,
    round: u64,
    stage: u64,
) -> Result<Option<BTreeMap<NodeId, f64>>, StoreError> {
    let key = keys::rewards_key(round, stage);
    let Some(StoreValue::Map(raw)) = store.get(&key, Some(REWARDS_BEAM), true).await? else {
        return Ok(None);
    };
    let mut rewards = BTreeMap::new();
    for (node, value) in raw {
        let total: f64 = serde_json::from_value(value)?;
        rewards.insert(node, total);
    }
    Ok(Some(rewards))
}

/// Rank a reward snapshot: descending by reward, ties broken by descending
/// node id. Recomputing from the same snapshot is idempotent.
pub fn sorted_leaderboard(rewards: &BTreeMap<NodeId, f64>) -> Leaderboard {
    let mut board: Leaderboard = rewards.iter().map(|(k, v)| (k.clone(), *v)).collect();
    board.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    board
}

/// The published leaderboard for `(round, stage)`, if any. Derived data:
/// always recomputable from the reward record.
pub async fn get_leaderboard(
    store: &Arc<dyn KvStore>,
    round: u64,
    stage: u64,
) -> Result<Option<Leaderboard>, StoreError> {
    let key = keys::leaderboard_key(round, stage);
    let Some(value) = store.get(&key, None, true).await? else {
        return Ok(None);
    };
    let Some(scalar) = value.as_scalar() else {
        return Ok(None);
    };
    Ok(serde_json::from_value(scalar.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::question_hash;
    use crate::store::MemStore;
    use serde_json::json;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(60);

    fn store() -> Arc<dyn KvStore> {
        Arc::new(MemStore::new())
    }

    #[tokio::test]
    async fn test_pointer_unavailable_then_set() {
        let store = store();
        assert!(matches!(
            get_round_and_stage(&store).await,
            Err(SwarmError::Unavailable(_))
        ));

        store
            .put(keys::ROUND_STAGE_KEY, None, json!([2, 1]), TTL)
            .await
            .unwrap();
        assert_eq!(get_round_and_stage(&store).await.unwrap(), (2, 1));
    }

    #[tokio::test]
    async fn test_outputs_prefer_local_cache() {
        let store = store();
        store
            .put(
                &keys::outputs_key("n1", 0, 0),
                Some(&question_hash("q")),
                json!([1.0, {"source": "store"}]),
                TTL,
            )
            .await
            .unwrap();

        let mut local = HashMap::new();
        local.insert(question_hash("q"), (2.0, json!({"source": "local"})));

        let from_local = get_outputs(&store, "n1", 0, 0, Some(&local)).await.unwrap();
        assert_eq!(from_local[&question_hash("q")].1["source"], "local");

        let from_store = get_outputs(&store, "n1", 0, 0, None).await.unwrap();
        assert_eq!(from_store[&question_hash("q")].1["source"], "store");
    }

    #[tokio::test]
    async fn test_outputs_rehash_legacy_subkeys() {
        let store = store();
        // A legacy producer wrote the raw question string as the subkey.
        store
            .put(
                &keys::outputs_key("n1", 0, 0),
                Some("what is 2 + 2?"),
                json!([1.0, {"answer": "4"}]),
                TTL,
            )
            .await
            .unwrap();

        let outputs = get_outputs(&store, "n1", 0, 0, None).await.unwrap();
        assert!(outputs.contains_key(&question_hash("what is 2 + 2?")));
    }

    #[test]
    fn test_sorted_leaderboard_order_and_idempotence() {
        let mut rewards = BTreeMap::new();
        rewards.insert("a".to_string(), 4.0);
        rewards.insert("b".to_string(), 2.0);
        rewards.insert("c".to_string(), 2.0);

        let board = sorted_leaderboard(&rewards);
        assert_eq!(
            board,
            vec![
                ("a".to_string(), 4.0),
                ("c".to_string(), 2.0),
                ("b".to_string(), 2.0),
            ]
        );
        // Same snapshot, same ranking.
        assert_eq!(sorted_leaderboard(&rewards), board);
    }

    #[tokio::test]
    async fn test_rewards_none_until_published() {
        let store = store();
        assert!(get_rewards(&store, 0, 0).await.unwrap().is_none());

        store
            .put(&keys::rewards_key(0, 0), Some("n1"), json!(4.0), TTL)
            .await
            .unwrap();
        let rewards = get_rewards(&store, 0, 0).await.unwrap().unwrap();
        assert_eq!(rewards["n1"], 4.0);
    }
}
