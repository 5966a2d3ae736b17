//! A training engine with no model attached.
//!
//! Produces deterministic, well-formed completions for every sample so the
//! whole coordination protocol can be exercised end to end — in tests and
//! when shaking out a swarm deployment — without touching an accelerator.

use async_trait::async_trait;
use serde_json::{json, Value};

use flock_protocol::engine::{EngineReport, StepOutcome, TrainingEngine};
use flock_protocol::stage::{RewardCall, Sample, Stage};
use flock_protocol::{NodeState, SwarmError};

pub struct DryRunEngine;

fn completion_for(sample: &Sample) -> String {
    let answer = sample["answer"].as_str().unwrap_or("unknown");
    if sample.get("stage3_prompt").is_some() {
        format!(
            "<summarize_feedback>\nThe group favored the clearest derivation.\n</summarize_feedback>\n\
             <majority>\nStudent #0\n</majority>\n\
             <answer>\n{answer}\n</answer>"
        )
    } else if sample.get("stage2_prompt").is_some() {
        format!(
            "<compare>\nAll suggested answers were checked against each other.\n</compare>\n\
             <explain>\nThe first answer reaches {answer} with sound steps.\n</explain>\n\
             <identify>\nStudent #0\n</identify>"
        )
    } else {
        format!("<think>\nWorking through the question directly.\n</think>\n<answer>\n{answer}\n</answer>")
    }
}

#[async_trait]
impl TrainingEngine for DryRunEngine {
    async fn run(
        &self,
        node: &mut NodeState,
        stage: &Stage,
        train: &[Sample],
        _test: &[Sample],
    ) -> Result<EngineReport, SwarmError> {
        let mut steps = Vec::with_capacity(train.len());
        let mut reward_total = 0.0;

        for sample in train {
            let Some(question) = sample["question"].as_str() else {
                continue;
            };
            let completion = completion_for(sample);
            let call = RewardCall {
                prompts: vec![sample.get("prompt").cloned().unwrap_or(Value::Null)],
                completions: vec![json!([{"role": "assistant", "content": completion}])],
                context: sample.clone(),
            };
            for reward_fn in &stage.reward_fns {
                reward_fn(node, &call);
            }

            // The last reward function in the stack leaves the publishable
            // payload and totals on the node.
            let rewards = node.last_rewards.clone();
            reward_total += rewards.iter().sum::<f64>();
            steps.push(StepOutcome {
                question: question.to_string(),
                payload: node.last_outputs.clone(),
                rewards,
            });
        }

        Ok(EngineReport {
            train_samples: train.len(),
            metrics: json!({
                "train_samples": train.len(),
                "reward_total": reward_total,
            }),
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{build_pipeline, StageOptions};
    use flock_protocol::MemStore;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    #[tokio::test]
    async fn test_dry_run_produces_publishable_steps() {
        let store: Arc<dyn flock_protocol::KvStore> = Arc::new(MemStore::new());
        let node = Arc::new(RwLock::new(NodeState::new("n1")));
        let questions = vec![json!({"question": "What is 6 x 7?", "answer": "42"})];
        let pipeline = build_pipeline(
            store,
            node.clone(),
            questions.clone(),
            questions,
            StageOptions::default(),
        );

        let stage = &pipeline.stages[0];
        let (train, test) = (stage.datasets_fn)(0, 0).await.unwrap();
        let mut n = node.write().await;
        let report = DryRunEngine.run(&mut n, stage, &train, &test).await.unwrap();

        assert_eq!(report.steps.len(), 1);
        let step = &report.steps[0];
        assert_eq!(step.question, "What is 6 x 7?");
        assert!(step.payload["agent_answers"]["n1"].as_str().unwrap().contains("42"));
        // Correct answer and well-formed tags both score.
        assert!(step.rewards.iter().sum::<f64>() >= 1.5);
    }
}
