//! The training engine collaborator.
//!
//! The engine is external to the protocol: it consumes a dataset and the
//! stage's reward functions and reports per-example outputs and rewards.
//! The driver only cares about the failure class — transient I/O faults are
//! retried after releasing engine resources, anything else is fatal for the
//! stage.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SwarmError;
use crate::node::NodeState;
use crate::stage::{Sample, Stage};

/// One processed example: what gets published to the swarm.
pub struct StepOutcome {
    pub question: String,
    pub payload: Value,
    pub rewards: Vec<f64>,
}

pub struct EngineReport {
    pub steps: Vec<StepOutcome>,
    pub train_samples: usize,
    pub metrics: Value,
}

#[async_trait]
pub trait TrainingEngine: Send + Sync {
    /// Run one stage over the given datasets. Invoked once per stage.
    async fn run(
        &self,
        node: &mut NodeState,
        stage: &Stage,
        train: &[Sample],
        test: &[Sample],
    ) -> Result<EngineReport, SwarmError>;

    /// Release accelerator-class resources between retry attempts.
    async fn release(&self) {}
}
