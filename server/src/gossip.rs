//! Rendering swarm outputs into a human-readable feed.
//!
//! Output payloads arrive in whatever shape the producing stage gave them;
//! the classifier here maps known shapes to a short display string and
//! falls back to the plain question/answer rendering for anything else.

use regex::Regex;
use serde_json::Value;

/// The payload shapes the feed knows how to render.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PayloadShape {
    /// Stage-0 style: a question and this node's answer.
    QuestionAnswer,
    /// Stage-1 style: feedback on the swarm's merged answers.
    PeerFeedback,
    /// Stage-2 style: the node's majority-decision call.
    MajorityDecision,
    Unknown,
}

pub fn classify(payload: &Value) -> PayloadShape {
    if payload.get("final_agent_decision").is_some() {
        PayloadShape::MajorityDecision
    } else if payload.get("agent_opinion").is_some() {
        PayloadShape::PeerFeedback
    } else if payload.get("question").is_some() || payload.get("answer").is_some() {
        PayloadShape::QuestionAnswer
    } else {
        PayloadShape::Unknown
    }
}

fn extract_tagged(text: &str, tag: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?s)<{tag}>\s*(.*?)\s*</{tag}>")).ok()?;
    re.captures(text).map(|c| c[1].to_string())
}

fn question_answer_message(payload: &Value) -> String {
    let question = payload["question"].as_str().unwrap_or_default();
    let answer = payload["answer"].as_str().unwrap_or_default();
    format!("{question}...Answer: {answer}")
}

fn peer_feedback_message(node_key: &str, payload: &Value) -> Option<String> {
    let opinion = payload["agent_opinion"][node_key].as_str()?;
    let explain = extract_tagged(opinion, "explain")?;
    let identify = extract_tagged(opinion, "identify")?;
    Some(format!("{explain}...Identify: {identify}"))
}

fn majority_decision_message(node_key: &str, payload: &Value) -> Option<String> {
    let decision = payload["final_agent_decision"][node_key].as_str()?;
    let summary = extract_tagged(decision, "summarize_feedback")?;
    let majority = extract_tagged(decision, "majority")?;
    Some(format!("{summary}...Majority: {majority}"))
}

/// Render one output payload for the feed. Malformed known shapes degrade
/// to the question/answer rendering rather than disappearing.
pub fn render_message(node_key: &str, payload: &Value) -> String {
    match classify(payload) {
        PayloadShape::PeerFeedback => {
            peer_feedback_message(node_key, payload)
                .unwrap_or_else(|| question_answer_message(payload))
        }
        PayloadShape::MajorityDecision => {
            majority_decision_message(node_key, payload)
                .unwrap_or_else(|| question_answer_message(payload))
        }
        PayloadShape::QuestionAnswer | PayloadShape::Unknown => question_answer_message(payload),
    }
}
