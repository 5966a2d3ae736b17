use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use flock_protocol::names::{name_from_node_id, search_node_ids_for_name};

use crate::cache::SwarmCache;

const ID_LOOKUP_LIMIT: usize = 1000;

pub fn create_router(cache: Arc<SwarmCache>) -> Router {
    Router::new()
        .route("/api/healthz", get(healthz))
        .route("/api/round_and_stage", get(round_and_stage))
        .route("/api/leaderboard", get(leaderboard))
        .route("/api/leaderboard-cumulative", get(leaderboard_cumulative))
        .route("/api/rewards-history", get(rewards_history))
        .route("/api/gossip", get(gossip))
        .route("/api/name-to-id", get(name_to_id))
        .route(
            "/api/id-to-name",
            post(id_to_name).layer(DefaultBodyLimit::max(100 * 1024)),
        )
        .with_state(cache)
}

async fn healthz(State(cache): State<Arc<SwarmCache>>) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(age) = cache.staleness().await else {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": "store never polled"})),
        ));
    };
    if !cache.healthy().await {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"detail": "last store poll exceeded staleness bound"})),
        ));
    }
    Ok(Json(json!({
        "message": "OK",
        "lastPolledSeconds": age.as_secs(),
    })))
}

async fn round_and_stage(State(cache): State<Arc<SwarmCache>>) -> Json<Value> {
    let snapshot = cache.snapshot().await;
    Json(json!({
        "round": snapshot.round,
        "stage": snapshot.stage,
    }))
}

async fn leaderboard(State(cache): State<Arc<SwarmCache>>) -> Json<Value> {
    let snapshot = cache.snapshot().await;
    Json(json!({
        "leaders": snapshot.leaders,
        "total": snapshot.leaders.len(),
    }))
}

async fn leaderboard_cumulative(State(cache): State<Arc<SwarmCache>>) -> Json<Value> {
    let snapshot = cache.snapshot().await;
    Json(json!({
        "leaders": snapshot.cumulative,
        "total": snapshot.cumulative.len(),
    }))
}

async fn rewards_history(State(cache): State<Arc<SwarmCache>>) -> Json<Value> {
    let snapshot = cache.snapshot().await;
    Json(json!({
        "leaders": snapshot.rewards_history,
    }))
}

#[derive(Deserialize)]
struct GossipParams {
    #[serde(default)]
    since_round: u64,
}

async fn gossip(
    State(cache): State<Arc<SwarmCache>>,
    Query(params): Query<GossipParams>,
) -> Json<Value> {
    let snapshot = cache.snapshot().await;
    let messages: Vec<_> = snapshot
        .gossip
        .iter()
        .filter(|entry| entry.round >= params.since_round)
        .collect();
    Json(json!({ "messages": messages }))
}

#[derive(Deserialize)]
struct NameParams {
    #[serde(default)]
    name: String,
}

async fn name_to_id(
    State(cache): State<Arc<SwarmCache>>,
    Query(params): Query<NameParams>,
) -> Json<Value> {
    let snapshot = cache.snapshot().await;
    let ids: Vec<String> = snapshot.leaders.iter().map(|l| l.id.clone()).collect();
    Json(json!({
        "id": search_node_ids_for_name(&ids, &params.name),
    }))
}

async fn id_to_name(
    Json(ids): Json<Vec<String>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if ids.len() > ID_LOOKUP_LIMIT {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"detail": format!("too many node ids; maximum is {ID_LOOKUP_LIMIT}")})),
        ));
    }
    let mut names = serde_json::Map::new();
    for id in ids {
        let name = name_from_node_id(&id, false);
        names.insert(id, json!(name));
    }
    Ok(Json(Value::Object(names)))
}
