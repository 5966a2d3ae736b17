//! The per-node round/stage state machine.
//!
//! A coordinator walks every round from stage 0 and publishes the pointer;
//! followers poll the pointer and join rounds wherever the swarm currently
//! is, replaying missed rounds first. All recovery is local: a node that
//! gives up simply stops publishing and cannot corrupt shared state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::RwLock;

use flock_protocol::keys::ROUND_STAGE_KEY;
use flock_protocol::records::get_round_and_stage;
use flock_protocol::stage::{Stage, StagePipeline};
use flock_protocol::{KvStore, NodeState, RoundStage, SwarmError, SwarmLedger, TrainingEngine};

use crate::merge::MergeOptions;
use crate::publish::StagePublisher;
use crate::winners::select_round_winners;

/// Where followers read the authoritative round/stage pointer from.
#[derive(Clone, Copy, PartialEq)]
pub enum PointerSource {
    Store,
    Ledger,
}

#[derive(Clone)]
pub struct DriverConfig {
    pub check_interval: Duration,
    /// Throttle for repeated pointer-fetch failure logs.
    pub log_interval: Duration,
    /// Upper bound for the "round already done" backoff.
    pub max_check_interval: Duration,
    pub max_train_attempts: u32,
    pub retry_cooldown: Duration,
    pub winner_limit: usize,
    pub pointer_source: PointerSource,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            log_interval: Duration::from_secs(10),
            max_check_interval: Duration::from_secs(60 * 5),
            max_train_attempts: 3,
            retry_cooldown: Duration::from_secs(5),
            winner_limit: 10,
            pointer_source: PointerSource::Store,
        }
    }
}

pub struct SwarmDriver {
    store: Arc<dyn KvStore>,
    node: Arc<RwLock<NodeState>>,
    pipeline: StagePipeline,
    engine: Arc<dyn TrainingEngine>,
    ledger: Arc<dyn SwarmLedger>,
    merge_opts: MergeOptions,
    config: DriverConfig,
}

impl SwarmDriver {
    pub fn new(
        store: Arc<dyn KvStore>,
        node: Arc<RwLock<NodeState>>,
        pipeline: StagePipeline,
        engine: Arc<dyn TrainingEngine>,
        ledger: Arc<dyn SwarmLedger>,
        merge_opts: MergeOptions,
        config: DriverConfig,
    ) -> Self {
        Self {
            store,
            node,
            pipeline,
            engine,
            ledger,
            merge_opts,
            config,
        }
    }

    /// Top-level entry point. Unclassified failures end this node's run
    /// after logging; they are never allowed to escape.
    pub async fn run(&self) {
        let is_coordinator = self.node.read().await.is_coordinator;
        let result = if is_coordinator {
            self.coordinator_train().await
        } else {
            if let Ok((current, _)) = self.current_round_and_stage().await {
                if current > 0 {
                    self.catch_up_train(0, current - 1).await;
                }
            }
            self.follower_train().await
        };

        if let Err(e) = result {
            let key = self.node.read().await.key.clone();
            tracing::error!(node = %key, error = %e, "node run terminated");
        }
    }

    async fn current_round_and_stage(&self) -> Result<RoundStage, SwarmError> {
        match self.config.pointer_source {
            PointerSource::Store => get_round_and_stage(&self.store).await,
            PointerSource::Ledger => self.ledger.round_and_stage().await,
        }
    }

    /// Run stages `start_stage..` of `round`, publishing the pointer first
    /// when acting as coordinator for the round.
    pub async fn train_stages(
        &self,
        round: u64,
        start_stage: u64,
        is_coordinator: bool,
    ) -> Result<(), SwarmError> {
        self.node.write().await.round = round;

        for stage_num in start_stage..self.pipeline.len() as u64 {
            let stage = &self.pipeline.stages[stage_num as usize];
            let ttl = {
                let mut n = self.node.write().await;
                n.stage = stage_num;
                n.out_ttl
            };

            if is_coordinator {
                self.store
                    .put(ROUND_STAGE_KEY, None, json!([round, stage_num]), ttl)
                    .await?;
            }

            tracing::info!(round, stage = stage_num, "📈 training stage");
            self.run_stage(round, stage_num, stage).await?;
            tracing::info!(round, stage = stage_num, "📉 finished stage");
        }

        self.cleanup().await;
        Ok(())
    }

    async fn run_stage(&self, round: u64, stage_num: u64, stage: &Stage) -> Result<(), SwarmError> {
        let (train, test) = (stage.datasets_fn)(round, stage_num).await?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.train_and_publish(stage, &train, &test).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.max_train_attempts => {
                    tracing::warn!(
                        round,
                        stage = stage_num,
                        attempt,
                        error = %e,
                        "transient failure; restarting stage"
                    );
                    self.cleanup().await;
                    tokio::time::sleep(self.config.retry_cooldown).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn train_and_publish(
        &self,
        stage: &Stage,
        train: &[serde_json::Value],
        test: &[serde_json::Value],
    ) -> Result<(), SwarmError> {
        let report = {
            let mut n = self.node.write().await;
            self.engine.run(&mut n, stage, train, test).await?
        };

        let mut publisher = StagePublisher::new(self.store.clone(), self.node.clone());
        for step in &report.steps {
            publisher.publish_step(step).await?;
        }

        tracing::info!(
            train_samples = report.train_samples,
            metrics = %report.metrics,
            "stage training complete"
        );
        Ok(())
    }

    /// Release engine resources and drop the stage-scoped output cache.
    async fn cleanup(&self) {
        self.engine.release().await;
        self.node.write().await.clear_stage_cache();
    }

    /// Select and submit this round's winners. Submission faults are logged,
    /// not escalated: the ledger tolerates resubmission.
    async fn finish_round(&self, round: u64) {
        let winners = match select_round_winners(
            &self.store,
            &self.node,
            &self.pipeline,
            round,
            self.config.winner_limit,
            &self.merge_opts,
        )
        .await
        {
            Ok(winners) => winners,
            Err(e) => {
                tracing::warn!(round, error = %e, "winner selection failed");
                return;
            }
        };

        tracing::info!(round, winners = ?winners, "🏆 submitting round winners");
        if let Err(e) = self.ledger.submit_winners(round, &winners).await {
            tracing::warn!(round, error = %e, "winner submission failed");
        }
    }

    /// Drive every round from stage 0, publishing the pointer as we go.
    pub async fn coordinator_train(&self) -> Result<(), SwarmError> {
        let start = Instant::now();
        for round in 0..self.pipeline.max_rounds {
            if start.elapsed() >= self.pipeline.train_timeout {
                tracing::info!("training timed out");
                return Ok(());
            }

            tracing::info!(round, "🤖 starting new round");
            self.train_stages(round, 0, true).await?;
            self.finish_round(round).await;
        }
        Ok(())
    }

    /// Follow the published pointer, joining each round wherever the swarm
    /// currently is.
    pub async fn follower_train(&self) -> Result<(), SwarmError> {
        let start = Instant::now();
        let mut done_rounds: HashSet<u64> = HashSet::new();
        let mut last_fetch_log: Option<Instant> = None;
        let mut check_backoff = self.config.check_interval;

        while start.elapsed() < self.pipeline.train_timeout {
            let (round, stage) = match self.current_round_and_stage().await {
                Ok(rs) => rs,
                Err(e) => {
                    let should_log = last_fetch_log
                        .map(|t| t.elapsed() > self.config.log_interval)
                        .unwrap_or(true);
                    if should_log {
                        tracing::debug!(
                            error = %e,
                            "could not fetch round and stage; next check in {:?}",
                            self.config.check_interval
                        );
                        last_fetch_log = Some(Instant::now());
                    }
                    tokio::time::sleep(self.config.check_interval).await;
                    continue;
                }
            };

            if !done_rounds.contains(&round) {
                tracing::info!(round, stage, "🐝 joining round");
                match self.train_stages(round, stage, false).await {
                    Ok(()) => {}
                    // A mid-round join can land on a stage whose inputs never
                    // materialize; one restart from stage 0 rebuilds them
                    // from our own outputs.
                    Err(e) if e.is_generation() && stage > 0 => {
                        tracing::info!(round, "re-attempting training from stage 0");
                        self.train_stages(round, 0, false).await?;
                    }
                    Err(e) => return Err(e),
                }
                done_rounds.insert(round);
                check_backoff = self.config.check_interval;
            } else {
                tracing::info!(round, "already finished round; next check in {:?}", check_backoff);
                tokio::time::sleep(check_backoff).await;
                check_backoff = (check_backoff * 2).min(self.config.max_check_interval);
            }

            if round + 1 == self.pipeline.max_rounds && done_rounds.contains(&round) {
                return Ok(());
            }
        }

        tracing::info!("training timed out");
        Ok(())
    }

    /// Replay rounds `start..=end` from stage 0 to rebuild local state after
    /// a late join. A round whose dataset cannot be generated is skipped;
    /// any other failure abandons the remaining sweep — the live rounds
    /// matter more than a perfect replay.
    pub async fn catch_up_train(&self, start_round: u64, end_round: u64) {
        tracing::info!(start_round, end_round, "catching up on missed rounds");
        for round in start_round..=end_round {
            tracing::info!(round, "replaying round from stage 0");
            match self.train_stages(round, 0, false).await {
                Ok(()) => self.cleanup().await,
                Err(e) if e.is_generation() => {
                    tracing::error!(round, error = %e, "dataset generation failed; skipping round");
                    continue;
                }
                Err(e) => {
                    tracing::error!(round, error = %e, "replay failed; abandoning catch-up");
                    break;
                }
            }
        }
        tracing::info!(start_round, end_round, "catch-up complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dry_run::DryRunEngine;
    use crate::stages::{build_pipeline, StageOptions};
    use flock_protocol::engine::EngineReport;
    use flock_protocol::keys::outputs_key;
    use flock_protocol::ledger::NullLedger;
    use flock_protocol::records::{get_leaderboard, get_rewards};
    use flock_protocol::stage::Sample;
    use flock_protocol::store::StoreValue;
    use flock_protocol::MemStore;
    use futures::FutureExt;
    use serde_json::Value;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TTL: Duration = Duration::from_secs(60);

    fn questions() -> Vec<Value> {
        vec![
            json!({"question": "What is 6 x 7?", "answer": "42"}),
            json!({"question": "What is 50 - 8?", "answer": "42"}),
        ]
    }

    fn fast_stage_opts() -> StageOptions {
        StageOptions {
            sample_limit: 200,
            check_interval: Duration::from_millis(5),
            wait_timeout: Duration::from_millis(20),
        }
    }

    fn fast_config() -> DriverConfig {
        DriverConfig {
            check_interval: Duration::from_millis(10),
            log_interval: Duration::from_millis(50),
            max_check_interval: Duration::from_millis(100),
            max_train_attempts: 3,
            retry_cooldown: Duration::from_millis(5),
            winner_limit: 10,
            pointer_source: PointerSource::Store,
        }
    }

    fn driver_for(
        store: &Arc<dyn KvStore>,
        node: Arc<RwLock<NodeState>>,
        max_rounds: u64,
        train_timeout: Duration,
    ) -> SwarmDriver {
        let mut pipeline = build_pipeline(
            store.clone(),
            node.clone(),
            questions(),
            questions(),
            fast_stage_opts(),
        );
        pipeline.max_rounds = max_rounds;
        pipeline.train_timeout = train_timeout;

        SwarmDriver::new(
            store.clone(),
            node,
            pipeline,
            Arc::new(DryRunEngine),
            Arc::new(NullLedger),
            MergeOptions {
                sample_limit: 200,
                check_interval: Duration::from_millis(5),
                wait_timeout: Duration::from_millis(20),
            },
            fast_config(),
        )
    }

    async fn node_has_outputs(store: &Arc<dyn KvStore>, node: &str, r: u64, s: u64) -> bool {
        matches!(
            store.get(&outputs_key(node, r, s), None, true).await.unwrap(),
            Some(StoreValue::Map(_))
        )
    }

    #[tokio::test]
    async fn test_coordinator_runs_full_round() {
        let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let node = Arc::new(RwLock::new(NodeState::coordinator("C")));
        let driver = driver_for(&store, node, 1, Duration::from_secs(30));

        driver.coordinator_train().await.unwrap();

        // Pointer rests on the final stage of the only round.
        assert_eq!(get_round_and_stage(&store).await.unwrap(), (0, 2));

        for stage in 0..3 {
            assert!(node_has_outputs(&store, "C", 0, stage).await);
            let rewards = get_rewards(&store, 0, stage).await.unwrap().unwrap();
            assert!(rewards.contains_key("C"));
            // Coordinator republished the leaderboard as it trained.
            assert!(get_leaderboard(&store, 0, stage).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_follower_joins_mid_round_without_rerunning_earlier_stages() {
        let store: Arc<dyn KvStore> = Arc::new(MemStore::new());

        // A coordinator already carried round 0 to completion.
        let coord = Arc::new(RwLock::new(NodeState::coordinator("C")));
        driver_for(&store, coord, 1, Duration::from_secs(30))
            .coordinator_train()
            .await
            .unwrap();

        // The pointer now says stage 1: the follower must start there.
        store
            .put(ROUND_STAGE_KEY, None, json!([0, 1]), TTL)
            .await
            .unwrap();

        let follower = Arc::new(RwLock::new(NodeState::new("F")));
        let driver = driver_for(&store, follower, 1, Duration::from_secs(30));
        driver.follower_train().await.unwrap();

        assert!(!node_has_outputs(&store, "F", 0, 0).await);
        assert!(node_has_outputs(&store, "F", 0, 1).await);
        assert!(node_has_outputs(&store, "F", 0, 2).await);
    }

    #[tokio::test]
    async fn test_follower_restarts_from_stage_zero_on_generation_failure() {
        let store: Arc<dyn KvStore> = Arc::new(MemStore::new());

        // Pointer says stage 1, but nobody ever published stage-0 outputs:
        // the merge comes back empty and dataset generation fails, forcing
        // one restart from stage 0.
        store
            .put(ROUND_STAGE_KEY, None, json!([0, 1]), TTL)
            .await
            .unwrap();

        let follower = Arc::new(RwLock::new(NodeState::new("F")));
        let driver = driver_for(&store, follower, 1, Duration::from_secs(30));
        driver.follower_train().await.unwrap();

        assert!(node_has_outputs(&store, "F", 0, 0).await);
        assert!(node_has_outputs(&store, "F", 0, 1).await);
        assert!(node_has_outputs(&store, "F", 0, 2).await);
    }

    struct FlakyEngine {
        attempts: AtomicU32,
        failures: u32,
    }

    #[async_trait::async_trait]
    impl TrainingEngine for FlakyEngine {
        async fn run(
            &self,
            node: &mut NodeState,
            stage: &Stage,
            train: &[Sample],
            test: &[Sample],
        ) -> Result<EngineReport, SwarmError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(SwarmError::TransientIo("ipc hiccup".into()));
            }
            DryRunEngine.run(node, stage, train, test).await
        }
    }

    fn driver_with_engine(
        store: &Arc<dyn KvStore>,
        node: Arc<RwLock<NodeState>>,
        engine: Arc<dyn TrainingEngine>,
    ) -> SwarmDriver {
        let mut pipeline = build_pipeline(
            store.clone(),
            node.clone(),
            questions(),
            questions(),
            fast_stage_opts(),
        );
        pipeline.max_rounds = 1;

        SwarmDriver::new(
            store.clone(),
            node,
            pipeline,
            engine,
            Arc::new(NullLedger),
            MergeOptions {
                sample_limit: 200,
                check_interval: Duration::from_millis(5),
                wait_timeout: Duration::from_millis(20),
            },
            fast_config(),
        )
    }

    #[tokio::test]
    async fn test_transient_engine_failures_are_retried() {
        let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let node = Arc::new(RwLock::new(NodeState::coordinator("C")));
        let engine = Arc::new(FlakyEngine {
            attempts: AtomicU32::new(0),
            failures: 1,
        });

        let driver = driver_with_engine(&store, node, engine.clone());
        driver.train_stages(0, 0, true).await.unwrap();

        // One failure per stage start would exceed this; only the first
        // stage attempt failed.
        assert!(node_has_outputs(&store, "C", 0, 0).await);
        assert!(engine.attempts.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_fatal_for_the_stage() {
        let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let node = Arc::new(RwLock::new(NodeState::coordinator("C")));
        let engine = Arc::new(FlakyEngine {
            attempts: AtomicU32::new(0),
            failures: 10,
        });

        let driver = driver_with_engine(&store, node, engine);
        let result = driver.train_stages(0, 0, true).await;
        assert!(matches!(result, Err(SwarmError::TransientIo(_))));
    }

    fn pipeline_with_failing_round(
        store: &Arc<dyn KvStore>,
        node: &Arc<RwLock<NodeState>>,
        failing_round: u64,
        error: fn() -> SwarmError,
    ) -> StagePipeline {
        let mut pipeline = build_pipeline(
            store.clone(),
            node.clone(),
            questions(),
            questions(),
            fast_stage_opts(),
        );
        let inner = pipeline.stages[0].datasets_fn.clone();
        pipeline.stages[0].datasets_fn = Arc::new(move |r, s| {
            let inner = inner.clone();
            async move {
                if r == failing_round {
                    Err(error())
                } else {
                    inner(r, s).await
                }
            }
            .boxed()
        });
        pipeline.max_rounds = 2;
        pipeline
    }

    #[tokio::test]
    async fn test_catch_up_skips_generation_failures() {
        let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let node = Arc::new(RwLock::new(NodeState::new("F")));
        let pipeline = pipeline_with_failing_round(&store, &node, 0, || {
            SwarmError::DatasetGeneration("no data".into())
        });

        let driver = SwarmDriver::new(
            store.clone(),
            node,
            pipeline,
            Arc::new(DryRunEngine),
            Arc::new(NullLedger),
            MergeOptions::default(),
            fast_config(),
        );
        driver.catch_up_train(0, 1).await;

        // Round 0 was skipped, round 1 still replayed.
        assert!(!node_has_outputs(&store, "F", 0, 0).await);
        assert!(node_has_outputs(&store, "F", 1, 0).await);
    }

    #[tokio::test]
    async fn test_catch_up_abandons_sweep_on_other_failures() {
        let store: Arc<dyn KvStore> = Arc::new(MemStore::new());
        let node = Arc::new(RwLock::new(NodeState::new("F")));
        let pipeline = pipeline_with_failing_round(&store, &node, 0, || {
            SwarmError::Fatal("disk on fire".into())
        });

        let driver = SwarmDriver::new(
            store.clone(),
            node,
            pipeline,
            Arc::new(DryRunEngine),
            Arc::new(NullLedger),
            MergeOptions::default(),
            fast_config(),
        );
        driver.catch_up_train(0, 1).await;

        assert!(!node_has_outputs(&store, "F", 1, 0).await);
    }
}
