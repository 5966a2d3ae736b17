//! Deterministic key naming for every record type the swarm shares.
//!
//! Four record families live in the store; the formats below are the only
//! place their names are spelled out, and they are collision-free by prefix.

use std::collections::BTreeMap;

use serde_json::Value;

/// No subkeys. Coordinator publishes the `(round, stage)` pointer here.
pub const ROUND_STAGE_KEY: &str = "flock_rs";

/// Round and stage appended. Subkey = node id. Everyone publishes.
pub const REWARDS_KEY_PREFIX: &str = "flock_rewards";

/// Node id, round, and stage appended. Subkey = question hash. Everyone
/// publishes.
pub const OUTPUTS_KEY_PREFIX: &str = "flock_outputs";

/// Round and stage appended. No subkeys. Coordinator publishes.
pub const LEADERBOARD_KEY_PREFIX: &str = "flock_leaderboard";

/// Width of a hashed question identifier in hex characters (128-bit md5).
pub const QUESTION_HASH_LEN: usize = 32;

pub fn rewards_key(round: u64, stage: u64) -> String {
    format!("{REWARDS_KEY_PREFIX}_{round}_{stage}")
}

pub fn outputs_key(node_key: &str, round: u64, stage: u64) -> String {
    format!("{OUTPUTS_KEY_PREFIX}_{node_key}_{round}_{stage}")
}

pub fn leaderboard_key(round: u64, stage: u64) -> String {
    format!("{LEADERBOARD_KEY_PREFIX}_{round}_{stage}")
}

/// Stable content hash for a question identifier.
pub fn question_hash(raw: &str) -> String {
    format!("{:x}", md5::compute(raw.as_bytes()))
}

/// Hash a question identifier unless it already has the hashed width.
///
/// Width alone is not a perfect discriminator, but it matches what producers
/// write and keeps re-hashing idempotent.
pub fn ensure_hashed(key: &str) -> String {
    if key.len() == QUESTION_HASH_LEN {
        key.to_string()
    } else {
        question_hash(key)
    }
}

/// Re-key an outputs map so legacy producers that published raw question
/// strings interoperate with hashed ones. Applied on both read and write.
pub fn hash_question_keys(outputs: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    outputs
        .into_iter()
        .map(|(k, v)| (ensure_hashed(&k), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_formats() {
        assert_eq!(rewards_key(0, 2), "flock_rewards_0_2");
        assert_eq!(outputs_key("abc", 3, 1), "flock_outputs_abc_3_1");
        assert_eq!(leaderboard_key(10, 0), "flock_leaderboard_10_0");
    }

    #[test]
    fn test_question_hash_width() {
        assert_eq!(question_hash("What is the meaning of life?").len(), QUESTION_HASH_LEN);
        assert_eq!(question_hash("").len(), QUESTION_HASH_LEN);
    }

    #[test]
    fn test_ensure_hashed_idempotent() {
        let h = question_hash("a question");
        // Hashing an already-hashed key must be a no-op.
        assert_eq!(ensure_hashed(&h), h);
        assert_eq!(ensure_hashed("a question"), h);
        assert_eq!(ensure_hashed(&ensure_hashed("a question")), h);
    }

    #[test]
    fn test_hash_question_keys_mixed() {
        let mut outputs = BTreeMap::new();
        outputs.insert("legacy raw question".to_string(), json!(1));
        let hashed = question_hash("already hashed");
        outputs.insert(hashed.clone(), json!(2));

        let rekeyed = hash_question_keys(outputs);
        assert_eq!(rekeyed.len(), 2);
        assert_eq!(rekeyed[&question_hash("legacy raw question")], json!(1));
        assert_eq!(rekeyed[&hashed], json!(2));
    }
}
