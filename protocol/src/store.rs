//! Thin contract over the shared key-value store.
//!
//! The store itself (replication, routing, propagation) is a black box. This
//! module only fixes the semantics callers may rely on: puts are
//! fire-and-forget and last-write-wins, gets return `None` for keys this
//! node's view has never observed, and subkey maps may be partially
//! populated at any time.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// What a `get` yields once expiration wrappers are stripped: either a plain
/// value or the current subkey map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoreValue {
    Scalar(Value),
    Map(BTreeMap<String, Value>),
}

impl StoreValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            StoreValue::Scalar(v) => Some(v),
            StoreValue::Map(_) => None,
        }
    }

    pub fn into_map(self) -> Option<BTreeMap<String, Value>> {
        match self {
            StoreValue::Map(m) => Some(m),
            StoreValue::Scalar(_) => None,
        }
    }
}

/// The put/get contract every component is wired against.
///
/// A `None` from `get` means "unknown", never "absent forever": peers may
/// simply not have written yet, or propagation may not have reached us.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store `value` under `key` (or `key`/`subkey`), visible to peers after
    /// the store's own propagation latency. Idempotent per `(key, subkey)`;
    /// last write wins.
    async fn put(
        &self,
        key: &str,
        subkey: Option<&str>,
        value: Value,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Fetch the freshest value this node's view holds. `beam` widens the
    /// lookup fan-out for keys with many writers; `latest` asks the store
    /// to bypass local caching. Both are hints a store may ignore.
    async fn get(
        &self,
        key: &str,
        beam: Option<usize>,
        latest: bool,
    ) -> Result<Option<StoreValue>, StoreError>;
}

struct Entry {
    value: Value,
    expires_at: Instant,
}

impl Entry {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

enum Slot {
    Scalar(Entry),
    Map(BTreeMap<String, Entry>),
}

/// In-process store with the same observable semantics: last-write-wins,
/// TTL expiry on read, partial subkey maps. Shared across nodes via `Arc`
/// in tests and single-process swarms.
#[derive(Default)]
pub struct MemStore {
    slots: RwLock<std::collections::HashMap<String, Slot>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemStore {
    async fn put(
        &self,
        key: &str,
        subkey: Option<&str>,
        value: Value,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        let mut slots = self.slots.write().await;
        match subkey {
            None => {
                slots.insert(key.to_string(), Slot::Scalar(entry));
            }
            Some(sk) => {
                let slot = slots
                    .entry(key.to_string())
                    .or_insert_with(|| Slot::Map(BTreeMap::new()));
                match slot {
                    Slot::Map(map) => {
                        map.insert(sk.to_string(), entry);
                    }
                    // A subkeyed write to a scalar key replaces the record.
                    Slot::Scalar(_) => {
                        let mut map = BTreeMap::new();
                        map.insert(sk.to_string(), entry);
                        *slot = Slot::Map(map);
                    }
                }
            }
        }
        Ok(())
    }

    async fn get(
        &self,
        key: &str,
        _beam: Option<usize>,
        _latest: bool,
    ) -> Result<Option<StoreValue>, StoreError> {
        let slots = self.slots.read().await;
        match slots.get(key) {
            None => Ok(None),
            Some(Slot::Scalar(entry)) => {
                if entry.live() {
                    Ok(Some(StoreValue::Scalar(entry.value.clone())))
                } else {
                    Ok(None)
                }
            }
            Some(Slot::Map(map)) => {
                let live: BTreeMap<String, Value> = map
                    .iter()
                    .filter(|(_, e)| e.live())
                    .map(|(k, e)| (k.clone(), e.value.clone()))
                    .collect();
                if live.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(StoreValue::Map(live)))
                }
            }
        }
    }
}

#[derive(Serialize)]
struct PutRequest<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subkey: Option<&'a str>,
    value: &'a Value,
    ttl_secs: u64,
}

/// Client for a store gateway reachable over HTTP.
pub struct HttpStore {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpStore {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bearer {}", self.token))
    }
}

fn transport_err(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Transport(e.to_string())
    }
}

#[async_trait]
impl KvStore for HttpStore {
    async fn put(
        &self,
        key: &str,
        subkey: Option<&str>,
        value: Value,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let url = format!("{}/kv/put", self.base_url);
        let body = PutRequest {
            key,
            subkey,
            value: &value,
            ttl_secs: ttl.as_secs(),
        };
        let resp = self
            .auth(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(transport_err)?;
        if !resp.status().is_success() {
            return Err(StoreError::Transport(format!(
                "put returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn get(
        &self,
        key: &str,
        beam: Option<usize>,
        latest: bool,
    ) -> Result<Option<StoreValue>, StoreError> {
        let url = format!("{}/kv/get", self.base_url);
        let mut req = self
            .auth(self.http.get(&url))
            .query(&[("key", key), ("latest", if latest { "true" } else { "false" })]);
        if let Some(beam) = beam {
            req = req.query(&[("beam", beam.to_string())]);
        }
        let resp = req.send().await.map_err(transport_err)?;
        if resp.status() == reqwest::StatusCode::NO_CONTENT
            || resp.status() == reqwest::StatusCode::NOT_FOUND
        {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(StoreError::Transport(format!(
                "get returned HTTP {}",
                resp.status()
            )));
        }
        let value: StoreValue = resp
            .json()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Some(value))
    }
}
