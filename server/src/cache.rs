//! The polling cache.
//!
//! A single background loop snapshots the store on a fixed interval; API
//! handlers only ever read the latest snapshot, which is replaced atomically
//! per cycle so readers never observe a half-updated view. Staleness of the
//! snapshot doubles as the service's health signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::RwLock;

use flock_protocol::names::name_from_node_id;
use flock_protocol::records::{get_outputs, get_rewards, get_round_and_stage, sorted_leaderboard};
use flock_protocol::{KvStore, SwarmError, SwarmLedger};

use crate::gossip::render_message;

#[derive(Clone)]
pub struct CacheConfig {
    pub poll_interval: Duration,
    /// Health flips to unhealthy once the last successful pass is older
    /// than this.
    pub stale_after: Duration,
    /// Stages per round, for walking recent `(round, stage)` keys.
    pub stage_count: u64,
    pub gossip_message_target: usize,
    pub gossip_node_target: usize,
    /// How many rounds back the feed reaches.
    pub gossip_round_window: u64,
    pub gossip_time_budget: Duration,
    pub history_points: usize,
    pub cumulative_history_points: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(60 * 5),
            stage_count: 3,
            gossip_message_target: 200,
            gossip_node_target: 20,
            gossip_round_window: 3,
            gossip_time_budget: Duration::from_secs(10),
            history_points: 100,
            cumulative_history_points: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderEntry {
    pub id: String,
    pub nickname: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScorePoint {
    pub x: i64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: String,
    pub nickname: String,
    pub values: Vec<ScorePoint>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeEntry {
    pub id: String,
    pub nickname: String,
    pub recorded_round: u64,
    pub recorded_stage: u64,
    pub cumulative_score: f64,
    pub last_score: f64,
    pub score_history: Vec<ScorePoint>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipEntry {
    pub id: String,
    pub message: String,
    pub node: String,
    pub node_id: String,
    pub round: u64,
    #[serde(skip)]
    pub ts: f64,
}

/// One complete derived view of the store. Built fresh each cycle and
/// swapped in wholesale.
#[derive(Clone)]
pub struct Snapshot {
    pub round: i64,
    pub stage: i64,
    pub leaders: Vec<LeaderEntry>,
    pub rewards_history: Vec<HistoryEntry>,
    pub cumulative: Vec<CumulativeEntry>,
    pub gossip: Vec<GossipEntry>,
    pub last_polled: Option<DateTime<Utc>>,

    // Per-node score history carried across polls.
    history: HashMap<String, Vec<ScorePoint>>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            round: -1,
            stage: -1,
            leaders: Vec::new(),
            rewards_history: Vec::new(),
            cumulative: Vec::new(),
            gossip: Vec::new(),
            last_polled: None,
            history: HashMap::new(),
        }
    }
}

pub struct SwarmCache {
    store: Arc<dyn KvStore>,
    ledger: Option<Arc<dyn SwarmLedger>>,
    config: CacheConfig,
    snapshot: RwLock<Snapshot>,
}

impl SwarmCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        ledger: Option<Arc<dyn SwarmLedger>>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.snapshot.read().await.clone()
    }

    /// Age of the last successful pass, if there ever was one.
    pub async fn staleness(&self) -> Option<Duration> {
        let last = self.snapshot.read().await.last_polled?;
        Some((Utc::now() - last).to_std().unwrap_or_default())
    }

    pub async fn healthy(&self) -> bool {
        match self.staleness().await {
            Some(age) => age <= self.config.stale_after,
            None => false,
        }
    }

    /// Run one full poll cycle. Failures leave the previous snapshot (and
    /// its `last_polled`) in place.
    pub async fn poll(&self) {
        let prev = self.snapshot.read().await.clone();
        match self.build_snapshot(prev).await {
            Ok(next) => *self.snapshot.write().await = next,
            Err(e) => tracing::error!(error = %e, "cache failed to poll store"),
        }
    }

    async fn build_snapshot(&self, prev: Snapshot) -> Result<Snapshot, SwarmError> {
        let mut next = prev;
        self.refresh_round_and_stage(&mut next).await?;
        self.refresh_leaderboard(&mut next).await;
        self.refresh_cumulative(&mut next).await;
        self.refresh_gossip(&mut next).await;
        next.last_polled = Some(Utc::now());
        Ok(next)
    }

    async fn refresh_round_and_stage(&self, next: &mut Snapshot) -> Result<(), SwarmError> {
        let pointer = match &self.ledger {
            Some(ledger) => ledger.round_and_stage().await,
            None => get_round_and_stage(&self.store).await,
        };
        match pointer {
            Ok((round, stage)) => {
                tracing::info!(round, stage, "cache polled round and stage");
                next.round = round as i64;
                next.stage = stage as i64;
                Ok(())
            }
            Err(e) if e.is_unavailable() => {
                tracing::warn!(error = %e, "could not get current round or stage");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn current_rs(next: &Snapshot) -> Option<(u64, u64)> {
        if next.round < 0 || next.stage < 0 {
            return None;
        }
        Some((next.round as u64, next.stage as u64))
    }

    fn previous_rs(&self, round: u64, stage: u64) -> (u64, u64) {
        if stage == 0 {
            (round.saturating_sub(1), self.config.stage_count - 1)
        } else {
            (round, stage - 1)
        }
    }

    async fn refresh_leaderboard(&self, next: &mut Snapshot) {
        let Some((round, stage)) = Self::current_rs(next) else {
            return;
        };
        let rewards = match get_rewards(&self.store, round, stage).await {
            Ok(Some(rewards)) => rewards,
            Ok(None) => {
                next.leaders = Vec::new();
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not get leaderboard data");
                return;
            }
        };

        let now = Utc::now().timestamp();
        let board = sorted_leaderboard(&rewards);

        next.leaders = board
            .iter()
            .map(|(id, score)| LeaderEntry {
                id: id.clone(),
                nickname: name_from_node_id(id, false),
                score: *score,
            })
            .collect();

        let mut rewards_history = Vec::with_capacity(next.leaders.len());
        for leader in &next.leaders {
            let values = next.history.entry(leader.id.clone()).or_default();
            push_point(values, now, leader.score, self.config.history_points);
            rewards_history.push(HistoryEntry {
                id: leader.id.clone(),
                nickname: leader.nickname.clone(),
                values: values.clone(),
            });
        }
        next.rewards_history = rewards_history;
    }

    async fn refresh_cumulative(&self, next: &mut Snapshot) {
        let Some((round, stage)) = Self::current_rs(next) else {
            return;
        };
        let rewards = match get_rewards(&self.store, round, stage).await {
            Ok(Some(rewards)) => rewards,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "could not get cumulative leaderboard data");
                return;
            }
        };

        let now = Utc::now().timestamp();
        let mut entries: HashMap<String, CumulativeEntry> = next
            .cumulative
            .drain(..)
            .map(|e| (e.id.clone(), e))
            .collect();

        for (peer, score) in &rewards {
            match entries.get_mut(peer) {
                None => {
                    entries.insert(
                        peer.clone(),
                        CumulativeEntry {
                            id: peer.clone(),
                            nickname: name_from_node_id(peer, false),
                            recorded_round: round,
                            recorded_stage: stage,
                            cumulative_score: *score,
                            last_score: *score,
                            score_history: vec![ScorePoint { x: now, y: *score }],
                        },
                    );
                }
                Some(entry) if entry.recorded_round == round && entry.recorded_stage == stage => {
                    // Same stage: the running total replaces this stage's
                    // previous contribution.
                    entry.cumulative_score += *score - entry.last_score;
                    entry.last_score = *score;
                    push_point(&mut entry.score_history, now, entry.cumulative_score, self.config.cumulative_history_points);
                }
                Some(entry) => {
                    // New stage: the previous stage's final score is already
                    // folded in; start accumulating this one.
                    entry.cumulative_score += *score;
                    entry.last_score = *score;
                    entry.recorded_round = round;
                    entry.recorded_stage = stage;
                    push_point(&mut entry.score_history, now, entry.cumulative_score, self.config.cumulative_history_points);
                }
            }
        }

        // Entries that stopped publishing fall off once they are neither in
        // the current nor the previous stage.
        let previous = self.previous_rs(round, stage);
        let mut kept: Vec<CumulativeEntry> = entries
            .into_values()
            .filter(|e| {
                let at = (e.recorded_round, e.recorded_stage);
                at == (round, stage) || at == previous
            })
            .collect();
        kept.sort_by(|a, b| {
            b.cumulative_score
                .total_cmp(&a.cumulative_score)
                .then_with(|| b.id.cmp(&a.id))
        });
        next.cumulative = kept;
    }

    async fn refresh_gossip(&self, next: &mut Snapshot) {
        let Some((curr_round, curr_stage)) = Self::current_rs(next) else {
            next.gossip = Vec::new();
            return;
        };
        let rewards = match get_rewards(&self.store, curr_round, curr_stage).await {
            Ok(Some(rewards)) => rewards,
            _ => {
                tracing::warn!("could not get gossip: missing rewards");
                next.gossip = Vec::new();
                return;
            }
        };

        // Reward-visible peers stand in for the reachable peer group; a
        // uniform sample keeps one loud node from drowning out the feed.
        let all_nodes: Vec<String> = rewards.keys().cloned().collect();
        let nodes: Vec<String> = {
            let mut rng = rand::thread_rng();
            all_nodes
                .choose_multiple(&mut rng, self.config.gossip_node_target)
                .cloned()
                .collect()
        };
        if nodes.is_empty() {
            next.gossip = Vec::new();
            return;
        }
        let per_node_limit = (self.config.gossip_message_target / nodes.len()).max(1);

        let started = Instant::now();
        let mut counts: HashMap<&String, usize> = HashMap::new();
        let mut collected: Vec<GossipEntry> = Vec::new();
        let start_round = curr_round.saturating_sub(self.config.gossip_round_window);

        'collect: for round in (start_round..=curr_round).rev() {
            for stage in (0..self.config.stage_count).rev() {
                for node_key in &nodes {
                    if started.elapsed() > self.config.gossip_time_budget {
                        tracing::warn!("gossip collection timed out");
                        break 'collect;
                    }
                    if round == curr_round && stage > curr_stage {
                        continue;
                    }
                    if counts.get(node_key).copied().unwrap_or(0) > per_node_limit {
                        break 'collect;
                    }

                    let outputs =
                        match get_outputs(&self.store, node_key, round, stage, None).await {
                            Ok(outputs) => outputs,
                            Err(e) if e.is_unavailable() => continue,
                            Err(e) => {
                                tracing::warn!(error = %e, "could not get gossip");
                                break 'collect;
                            }
                        };

                    let mut timed: Vec<_> = outputs.into_iter().collect();
                    timed.sort_by(|a, b| a.1 .0.total_cmp(&b.1 .0));
                    for (question_hash, (ts, payload)) in timed {
                        let id = format!(
                            "{:x}",
                            md5::compute(format!("{node_key}_{round}_{stage}_{question_hash}"))
                        );
                        collected.push(GossipEntry {
                            id,
                            message: render_message(node_key, &payload),
                            node: name_from_node_id(node_key, false),
                            node_id: node_key.clone(),
                            round,
                            ts,
                        });
                        let count = counts.entry(node_key).or_insert(0);
                        *count += 1;
                        if *count > per_node_limit {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!(
            messages = collected.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "completed gossip collection"
        );
        collected.sort_by(|a, b| b.ts.total_cmp(&a.ts).then_with(|| b.id.cmp(&a.id)));
        next.gossip = collected;
    }
}

fn push_point(history: &mut Vec<ScorePoint>, x: i64, y: f64, cap: usize) {
    history.push(ScorePoint { x, y });
    let overflow = history.len().saturating_sub(cap);
    if overflow > 0 {
        history.drain(..overflow);
    }
}
