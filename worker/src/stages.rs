//! The three-stage question/feedback/decision pipeline.
//!
//! Stage 0 answers questions from a fixed dataset; stage 1 critiques the
//! swarm's merged answers; stage 2 calls the majority decision. The merge
//! functions here define what "combined cross-node view" means per stage,
//! and the sample builders turn merged records into the next stage's
//! prompts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;

use flock_protocol::stage::{DatasetsFn, RewardCall, RewardFn, Sample, Stage, StagePipeline};
use flock_protocol::{KvStore, NodeId, NodeState, SwarmError};

use crate::merge::{merge_previous_stage, MergeFn, MergeOptions, SamplesFn};

const NO_ANSWER: &str = "No answer received...";
const NO_FEEDBACK: &str = "No feedback received...";

const STAGE1_SYSTEM_PROMPT: &str = "You joined a study group. Given a question, reason \
through it in <think> </think> tags and give your final answer in <answer> </answer> tags.";

const STAGE2_SYSTEM_PROMPT: &str = "You joined a study group. Compare the answers your \
group suggested in <compare> </compare> tags, explain which is best in <explain> </explain> \
tags, and identify it in <identify> </identify> tags.";

const STAGE3_SYSTEM_PROMPT: &str = "You joined a study group. Summarize the group's \
feedback in <summarize_feedback> </summarize_feedback> tags, state the majority choice in \
<majority> </majority> tags, and give the best final answer in <answer> </answer> tags.";

/// Combine one question's stage-0 answers across contributors. Contributors
/// whose answer is missing are filled with a placeholder so downstream
/// prompts stay aligned.
pub fn merge_stage1_question(outputs: &BTreeMap<NodeId, Value>) -> Value {
    let mut merged = json!({"question": null, "answer": null, "agent_answers": {}});
    for output in outputs.values() {
        for field in ["question", "answer"] {
            if let Some(v) = output.get(field) {
                merged[field] = v.clone();
            }
        }
        if let Some(answers) = output.get("agent_answers").and_then(Value::as_object) {
            for (agent, answer) in answers {
                merged["agent_answers"][agent] = answer.clone();
            }
        }
    }
    for agent in outputs.keys() {
        if merged["agent_answers"].get(agent).is_none() {
            merged["agent_answers"][agent] = json!(NO_ANSWER);
        }
    }
    merged
}

/// Combine one question's stage-1 feedback across contributors.
pub fn merge_stage2_question(outputs: &BTreeMap<NodeId, Value>) -> Value {
    let mut merged = json!({
        "question": null,
        "answer": null,
        "stage2_prompt": null,
        "agent_opinion": {},
    });
    for output in outputs.values() {
        for field in ["question", "answer", "stage2_prompt"] {
            if let Some(v) = output.get(field) {
                merged[field] = v.clone();
            }
        }
        if let Some(opinions) = output.get("agent_opinion").and_then(Value::as_object) {
            for (agent, opinion) in opinions {
                merged["agent_opinion"][agent] = opinion.clone();
            }
        }
    }
    for agent in outputs.keys() {
        if merged["agent_opinion"].get(agent).is_none() {
            merged["agent_opinion"][agent] = json!(NO_FEEDBACK);
        }
    }
    merged
}

/// Give every record the union of agent keys so no contributor silently
/// disappears between stages.
fn fill_unknown_agents(records: &mut [Value], field: &str, filler: &str) {
    let mut agents: Vec<String> = Vec::new();
    for record in records.iter() {
        if let Some(map) = record.get(field).and_then(Value::as_object) {
            for agent in map.keys() {
                if !agents.contains(agent) {
                    agents.push(agent.clone());
                }
            }
        }
    }
    for record in records.iter_mut() {
        if record.get(field).and_then(Value::as_object).is_some() {
            for agent in &agents {
                if record[field].get(agent).is_none() {
                    record[field][agent] = json!(filler);
                }
            }
        }
    }
}

fn sorted_agent_ids(map: &Map<String, Value>) -> Vec<&String> {
    let mut ids: Vec<&String> = map.keys().collect();
    ids.sort();
    ids
}

fn stage2_user_prompt(record: &Value) -> String {
    let question = record["question"].as_str().unwrap_or_default();
    let mut prompt = format!(
        "The question we were given is: {question}  \n\n\
         The following answers to this question were suggested: \n"
    );
    if let Some(answers) = record.get("agent_answers").and_then(Value::as_object) {
        for (i, agent) in sorted_agent_ids(answers).into_iter().enumerate() {
            let answer = answers[agent].as_str().unwrap_or_default();
            prompt.push_str(&format!("<student>Student #{i}</student> said \n{answer}\n\n\n"));
        }
    }
    prompt
}

fn stage3_user_prompt(record: &Value) -> String {
    let stage2_prompt = record["stage2_prompt"].as_str().unwrap_or_default();
    let mut prompt = format!(
        "{stage2_prompt}  \n\
         After comparing these answers, the following feedback was given about which answer is best: \n"
    );
    if let Some(opinions) = record.get("agent_opinion").and_then(Value::as_object) {
        for (i, agent) in sorted_agent_ids(opinions).into_iter().enumerate() {
            let opinion = opinions[agent].as_str().unwrap_or_default();
            prompt.push_str(&format!("<criticism>Criticism #{i}</criticism> was \n{opinion}\n\n\n"));
        }
    }
    prompt
}

/// Build stage-1 samples (answer critique) from merged stage-0 records.
pub fn stage2_samples(mut merged: Vec<Value>) -> Result<(Vec<Sample>, Vec<Sample>), SwarmError> {
    if merged.is_empty() {
        return Err(SwarmError::DatasetGeneration(
            "no merged records for stage 1".into(),
        ));
    }
    fill_unknown_agents(&mut merged, "agent_answers", NO_ANSWER);

    let samples: Vec<Sample> = merged
        .into_iter()
        .map(|mut record| {
            let user_prompt = stage2_user_prompt(&record);
            record["stage2_prompt"] = json!(user_prompt.clone());
            record["prompt"] = json!([
                {"role": "system", "content": STAGE2_SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt},
            ]);
            record
        })
        .collect();
    Ok((samples.clone(), samples))
}

/// Build stage-2 samples (majority decision) from merged stage-1 records.
pub fn stage3_samples(mut merged: Vec<Value>) -> Result<(Vec<Sample>, Vec<Sample>), SwarmError> {
    if merged.is_empty() {
        return Err(SwarmError::DatasetGeneration(
            "no merged records for stage 2".into(),
        ));
    }
    fill_unknown_agents(&mut merged, "agent_opinion", NO_FEEDBACK);

    let samples: Vec<Sample> = merged
        .into_iter()
        .map(|mut record| {
            let user_prompt = stage3_user_prompt(&record);
            record["stage3_prompt"] = json!(user_prompt.clone());
            record["prompt"] = json!([
                {"role": "system", "content": STAGE3_SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt},
            ]);
            record
        })
        .collect();
    Ok((samples.clone(), samples))
}

/// Wrap raw question records into stage-0 samples.
pub fn stage1_samples(questions: &[Value]) -> Vec<Sample> {
    questions
        .iter()
        .map(|q| {
            let question = q["question"].as_str().unwrap_or_default();
            json!({
                "question": question,
                "answer": q["answer"].clone(),
                "prompt": [
                    {"role": "system", "content": STAGE1_SYSTEM_PROMPT},
                    {"role": "user", "content": question},
                ],
            })
        })
        .collect()
}

fn completion_texts(call: &RewardCall) -> Vec<String> {
    call.completions
        .iter()
        .map(|c| {
            c.as_array()
                .and_then(|msgs| msgs.first())
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}

fn has_tag(text: &str, tag: &str) -> bool {
    text.contains(&format!("<{tag}>")) && text.contains(&format!("</{tag}>"))
}

/// 1.0 per completion that states the expected answer.
pub fn correctness_reward() -> RewardFn {
    Arc::new(|_node, call| {
        let expected = call.context["answer"].as_str().unwrap_or_default().to_string();
        completion_texts(call)
            .iter()
            .map(|text| {
                if !expected.is_empty() && text.contains(&expected) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect()
    })
}

/// 0.5 per completion carrying every required tag pair.
pub fn format_reward(tags: &'static [&'static str]) -> RewardFn {
    Arc::new(move |_node, call| {
        completion_texts(call)
            .iter()
            .map(|text| {
                if tags.iter().all(|tag| has_tag(text, tag)) {
                    0.5
                } else {
                    0.0
                }
            })
            .collect()
    })
}

/// Which field of the output record this stage's completions populate.
#[derive(Clone, Copy)]
pub enum StageKind {
    Answer,
    Feedback,
    Decision,
}

impl StageKind {
    fn output_field(self) -> &'static str {
        match self {
            StageKind::Answer => "agent_answers",
            StageKind::Feedback => "agent_opinion",
            StageKind::Decision => "final_agent_decision",
        }
    }

    fn carried_fields(self) -> &'static [&'static str] {
        match self {
            StageKind::Answer => &["question", "answer"],
            StageKind::Feedback => &["question", "answer", "stage2_prompt"],
            StageKind::Decision => &["question", "answer", "stage3_prompt"],
        }
    }
}

/// The stage's final reward function: totals the other scores and writes
/// the node's last-output/last-reward side channel, which the aggregator
/// reads right after the call.
pub fn cumulative_reward(kind: StageKind, scorers: Vec<RewardFn>) -> RewardFn {
    Arc::new(move |node, call| {
        let texts = completion_texts(call);
        let mut totals = vec![0.0; texts.len()];
        for scorer in &scorers {
            for (total, score) in totals.iter_mut().zip(scorer(node, call)) {
                *total += score;
            }
        }

        let mut outputs = json!({});
        for field in kind.carried_fields() {
            if let Some(v) = call.context.get(*field) {
                outputs[*field] = v.clone();
            }
        }
        let mut per_agent = Map::new();
        per_agent.insert(
            node.key.clone(),
            json!(texts.first().cloned().unwrap_or_default()),
        );
        outputs[kind.output_field()] = Value::Object(per_agent);

        node.last_outputs = outputs;
        node.last_rewards = totals.clone();
        totals
    })
}

#[derive(Clone)]
pub struct StageOptions {
    pub sample_limit: usize,
    pub check_interval: Duration,
    pub wait_timeout: Duration,
}

impl Default for StageOptions {
    fn default() -> Self {
        let merge = MergeOptions::default();
        Self {
            sample_limit: merge.sample_limit,
            check_interval: merge.check_interval,
            wait_timeout: merge.wait_timeout,
        }
    }
}

impl StageOptions {
    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            sample_limit: self.sample_limit,
            check_interval: self.check_interval,
            wait_timeout: self.wait_timeout,
        }
    }
}

fn merged_datasets_fn(
    store: Arc<dyn KvStore>,
    node: Arc<RwLock<NodeState>>,
    merge_fn: MergeFn,
    samples_fn: SamplesFn,
    opts: MergeOptions,
) -> DatasetsFn {
    Arc::new(move |round, stage| {
        let store = store.clone();
        let node = node.clone();
        let merge_fn = merge_fn.clone();
        let samples_fn = samples_fn.clone();
        let opts = opts.clone();
        async move {
            merge_previous_stage(&store, &node, round, stage, &merge_fn, &samples_fn, &opts).await
        }
        .boxed()
    })
}

fn reward_stack(kind: StageKind, scorers: Vec<RewardFn>) -> Vec<RewardFn> {
    let mut fns = scorers.clone();
    fns.push(cumulative_reward(kind, scorers));
    fns
}

/// Assemble the full pipeline for one node.
pub fn build_pipeline(
    store: Arc<dyn KvStore>,
    node: Arc<RwLock<NodeState>>,
    initial_train: Vec<Sample>,
    initial_test: Vec<Sample>,
    opts: StageOptions,
) -> StagePipeline {
    let stage0_datasets: DatasetsFn = {
        let train = stage1_samples(&initial_train);
        let test = stage1_samples(&initial_test);
        Arc::new(move |_r, _s| {
            let sets = (train.clone(), test.clone());
            async move { Ok(sets) }.boxed()
        })
    };

    let stage1_datasets = merged_datasets_fn(
        store.clone(),
        node.clone(),
        Arc::new(merge_stage1_question),
        Arc::new(stage2_samples),
        opts.merge_options(),
    );

    let stage2_datasets = merged_datasets_fn(
        store,
        node,
        Arc::new(merge_stage2_question),
        Arc::new(stage3_samples),
        opts.merge_options(),
    );

    StagePipeline::new(vec![
        Stage {
            name: "0".into(),
            reward_fns: reward_stack(
                StageKind::Answer,
                vec![correctness_reward(), format_reward(&["think", "answer"])],
            ),
            datasets_fn: stage0_datasets,
        },
        Stage {
            name: "1".into(),
            reward_fns: reward_stack(
                StageKind::Feedback,
                vec![format_reward(&["compare", "explain", "identify"])],
            ),
            datasets_fn: stage1_datasets,
        },
        Stage {
            name: "2".into(),
            reward_fns: reward_stack(
                StageKind::Decision,
                vec![
                    correctness_reward(),
                    format_reward(&["summarize_feedback", "majority", "answer"]),
                ],
            ),
            datasets_fn: stage2_datasets,
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage0_output(agent: &str, answer: &str) -> Value {
        json!({
            "question": "Q",
            "answer": "42",
            "agent_answers": {agent: answer},
        })
    }

    #[test]
    fn test_merge_stage1_unions_answers() {
        let mut outputs = BTreeMap::new();
        outputs.insert("a".to_string(), stage0_output("a", "it is 42"));
        outputs.insert("b".to_string(), stage0_output("b", "it is 41"));

        let merged = merge_stage1_question(&outputs);
        assert_eq!(merged["question"], "Q");
        assert_eq!(merged["agent_answers"]["a"], "it is 42");
        assert_eq!(merged["agent_answers"]["b"], "it is 41");
    }

    #[test]
    fn test_merge_stage1_fills_missing_contributors() {
        let mut outputs = BTreeMap::new();
        outputs.insert("a".to_string(), stage0_output("a", "it is 42"));
        // b contributed a payload without an answer of its own.
        outputs.insert("b".to_string(), json!({"question": "Q", "answer": "42"}));

        let merged = merge_stage1_question(&outputs);
        assert_eq!(merged["agent_answers"]["b"], NO_ANSWER);
    }

    #[test]
    fn test_stage2_samples_build_prompts() {
        let merged = vec![merge_stage1_question(&BTreeMap::from([
            ("a".to_string(), stage0_output("a", "it is 42")),
        ]))];

        let (train, test) = stage2_samples(merged).unwrap();
        assert_eq!(train.len(), 1);
        assert_eq!(train.len(), test.len());

        let prompt = train[0]["stage2_prompt"].as_str().unwrap();
        assert!(prompt.contains("The question we were given is: Q"));
        assert!(prompt.contains("Student #0"));
        assert_eq!(train[0]["prompt"][1]["role"], "user");
    }

    #[test]
    fn test_stage2_samples_rejects_empty_merge() {
        assert!(matches!(
            stage2_samples(Vec::new()),
            Err(SwarmError::DatasetGeneration(_))
        ));
    }

    #[test]
    fn test_cumulative_reward_writes_side_channel() {
        let mut node = NodeState::new("n1");
        let call = RewardCall {
            prompts: vec![json!([{"role": "user", "content": "Q"}])],
            completions: vec![json!([
                {"role": "assistant", "content": "<think>x</think>\n<answer>42</answer>"},
            ])],
            context: json!({"question": "Q", "answer": "42"}),
        };

        let scorers = vec![correctness_reward(), format_reward(&["think", "answer"])];
        let total = cumulative_reward(StageKind::Answer, scorers)(&mut node, &call);

        assert_eq!(total, vec![1.5]);
        assert_eq!(node.last_rewards, vec![1.5]);
        assert_eq!(node.last_outputs["question"], "Q");
        assert!(node.last_outputs["agent_answers"]["n1"]
            .as_str()
            .unwrap()
            .contains("42"));
    }
}
