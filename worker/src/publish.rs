//! Reward and leaderboard publication.
//!
//! After every processed example the node appends its output record,
//! overwrites its cumulative reward for the running stage, and — when it
//! holds the coordinator role — republishes the ranked leaderboard.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::RwLock;

use flock_protocol::engine::StepOutcome;
use flock_protocol::error::StoreError;
use flock_protocol::keys::{ensure_hashed, leaderboard_key, outputs_key, rewards_key};
use flock_protocol::records::{get_rewards, sorted_leaderboard};
use flock_protocol::{KvStore, NodeState, SwarmError};

/// One publisher per stage attempt: the cumulative reward counter resets at
/// stage start, so a retried stage recomputes it from zero and the
/// overwrite semantics of the store make republication harmless.
pub struct StagePublisher {
    store: Arc<dyn KvStore>,
    node: Arc<RwLock<NodeState>>,
    stage_rewards: f64,
}

impl StagePublisher {
    pub fn new(store: Arc<dyn KvStore>, node: Arc<RwLock<NodeState>>) -> Self {
        Self {
            store,
            node,
            stage_rewards: 0.0,
        }
    }

    pub async fn publish_step(&mut self, outcome: &StepOutcome) -> Result<(), SwarmError> {
        let (node_key, round, stage, ttl, is_coordinator) = {
            let n = self.node.read().await;
            (n.key.clone(), n.round, n.stage, n.out_ttl, n.is_coordinator)
        };

        let timestamp = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let value = serde_json::to_value((timestamp, &outcome.payload)).map_err(StoreError::from)?;
        self.store
            .put(
                &outputs_key(&node_key, round, stage),
                Some(&ensure_hashed(&outcome.question)),
                value,
                ttl,
            )
            .await?;
        self.node.write().await.put_stage_outputs(
            round,
            stage,
            &outcome.question,
            (timestamp, outcome.payload.clone()),
        );

        // Just the latest cumulative value, not an append.
        self.stage_rewards += outcome.rewards.iter().sum::<f64>();
        self.store
            .put(
                &rewards_key(round, stage),
                Some(&node_key),
                json!(self.stage_rewards),
                ttl,
            )
            .await?;

        if is_coordinator {
            self.publish_leaderboard().await?;
        }
        Ok(())
    }

    /// Recompute and republish the leaderboard from the live reward record.
    /// An unreadable record skips the refresh for this tick.
    pub async fn publish_leaderboard(&self) -> Result<(), SwarmError> {
        let (round, stage, ttl) = {
            let n = self.node.read().await;
            (n.round, n.stage, n.out_ttl)
        };

        let Some(rewards) = get_rewards(&self.store, round, stage).await? else {
            tracing::info!(round, stage, "can't retrieve rewards; skipping leaderboard refresh");
            return Ok(());
        };

        let board = sorted_leaderboard(&rewards);
        let value = serde_json::to_value(board).map_err(StoreError::from)?;
        self.store
            .put(&leaderboard_key(round, stage), None, value, ttl)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flock_protocol::records::get_leaderboard;
    use flock_protocol::types::Leaderboard;
    use flock_protocol::MemStore;

    fn outcome(question: &str, rewards: Vec<f64>) -> StepOutcome {
        StepOutcome {
            question: question.to_string(),
            payload: json!({"question": question}),
            rewards,
        }
    }

    #[tokio::test]
    async fn test_cumulative_reward_is_monotone_overwrite() {
        let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let node = Arc::new(RwLock::new(NodeState::new("n1")));
        let mut publisher = StagePublisher::new(store.clone(), node.clone());

        publisher.publish_step(&outcome("q1", vec![1.0, 0.5])).await.unwrap();
        let rewards = get_rewards(&store, 0, 0).await.unwrap().unwrap();
        assert_eq!(rewards["n1"], 1.5);

        publisher.publish_step(&outcome("q2", vec![2.0])).await.unwrap();
        let rewards = get_rewards(&store, 0, 0).await.unwrap().unwrap();
        assert_eq!(rewards["n1"], 3.5);
    }

    #[tokio::test]
    async fn test_outputs_mirrored_into_local_cache() {
        let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let node = Arc::new(RwLock::new(NodeState::new("n1")));
        let mut publisher = StagePublisher::new(store.clone(), node.clone());

        publisher.publish_step(&outcome("q1", vec![1.0])).await.unwrap();

        let n = node.read().await;
        let cached = n.get_stage_outputs(0, 0).unwrap();
        assert_eq!(cached.len(), 1);
    }

    #[tokio::test]
    async fn test_coordinator_publishes_sorted_leaderboard() {
        let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let node = Arc::new(RwLock::new(NodeState::coordinator("A")));

        // A peer already published a smaller cumulative reward.
        store
            .put(&rewards_key(0, 0), Some("B"), json!(2.0), std::time::Duration::from_secs(60))
            .await
            .unwrap();

        let mut publisher = StagePublisher::new(store.clone(), node.clone());
        publisher.publish_step(&outcome("q1", vec![4.0])).await.unwrap();

        let board: Leaderboard = get_leaderboard(&store, 0, 0).await.unwrap().unwrap();
        assert_eq!(board, vec![("A".to_string(), 4.0), ("B".to_string(), 2.0)]);
    }

    #[tokio::test]
    async fn test_leaderboard_skipped_when_rewards_missing() {
        let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let node = Arc::new(RwLock::new(NodeState::coordinator("A")));
        let publisher = StagePublisher::new(store.clone(), node);

        // Nothing published yet: refresh is a no-op, not an error.
        publisher.publish_leaderboard().await.unwrap();
        assert!(get_leaderboard(&store, 0, 0).await.unwrap().is_none());
    }
}
