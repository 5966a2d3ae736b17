//! The external ledger collaborator.
//!
//! The ledger records bootstrap peers and round winners, and on testnet
//! deployments is the authoritative source for the round/stage pointer.
//! Only the interface lives here; the contract itself is someone else's
//! problem.

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::SwarmError;
use crate::types::{NodeId, RoundStage};

#[async_trait]
pub trait SwarmLedger: Send + Sync {
    async fn bootstrap_peers(&self) -> Result<Vec<String>, SwarmError>;

    /// Authoritative pointer alternative for deployments where the ledger,
    /// not the store, decides where the swarm is.
    async fn round_and_stage(&self) -> Result<RoundStage, SwarmError>;

    async fn submit_winners(&self, round: u64, winners: &[NodeId]) -> Result<(), SwarmError>;
}

/// Ledger client speaking JSON over HTTP to a ledger proxy.
pub struct HttpLedger {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct RoundStageResponse {
    round: u64,
    stage: u64,
}

#[derive(Deserialize)]
struct BootnodesResponse {
    peers: Vec<String>,
}

impl HttpLedger {
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

fn ledger_err(e: reqwest::Error) -> SwarmError {
    SwarmError::TransientIo(format!("ledger: {e}"))
}

#[async_trait]
impl SwarmLedger for HttpLedger {
    async fn bootstrap_peers(&self) -> Result<Vec<String>, SwarmError> {
        let url = format!("{}/api/bootnodes", self.base_url);
        let resp = self.auth(self.http.get(&url)).send().await.map_err(ledger_err)?;
        if !resp.status().is_success() {
            return Err(SwarmError::TransientIo(format!(
                "bootnodes returned HTTP {}",
                resp.status()
            )));
        }
        let body: BootnodesResponse = resp.json().await.map_err(ledger_err)?;
        Ok(body.peers)
    }

    async fn round_and_stage(&self) -> Result<RoundStage, SwarmError> {
        let url = format!("{}/api/round_and_stage", self.base_url);
        let resp = self.auth(self.http.get(&url)).send().await.map_err(ledger_err)?;
        if !resp.status().is_success() {
            return Err(SwarmError::Unavailable(format!(
                "ledger pointer returned HTTP {}",
                resp.status()
            )));
        }
        let body: RoundStageResponse = resp.json().await.map_err(ledger_err)?;
        Ok((body.round, body.stage))
    }

    async fn submit_winners(&self, round: u64, winners: &[NodeId]) -> Result<(), SwarmError> {
        let url = format!("{}/api/submit-winners", self.base_url);
        let body = serde_json::json!({
            "roundNumber": round,
            "winners": winners,
        });
        let resp = self
            .auth(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(ledger_err)?;

        // The contract rejects resubmission with a 500; that is not our
        // problem to escalate.
        if resp.status().is_server_error() {
            tracing::debug!(round, status = %resp.status(), "winner submission rejected, continuing");
            return Ok(());
        }
        if !resp.status().is_success() {
            return Err(SwarmError::Fatal(format!(
                "submit-winners returned HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Ledger for local swarms: no peers, no pointer, winners only logged.
pub struct NullLedger;

#[async_trait]
impl SwarmLedger for NullLedger {
    async fn bootstrap_peers(&self) -> Result<Vec<String>, SwarmError> {
        Ok(Vec::new())
    }

    async fn round_and_stage(&self) -> Result<RoundStage, SwarmError> {
        Err(SwarmError::Unavailable("null ledger has no pointer".into()))
    }

    async fn submit_winners(&self, round: u64, winners: &[NodeId]) -> Result<(), SwarmError> {
        tracing::info!(round, winners = ?winners, "🏆 round winners (not submitted)");
        Ok(())
    }
}
