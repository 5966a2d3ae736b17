use serde_json::Value;

/// Unique node identifier. Set to the node's store-level peer ID.
pub type NodeId = String;

/// The coordinator-published position of the swarm: `(round, stage)`.
pub type RoundStage = (u64, u64);

/// An output record entry: unix timestamp paired with the opaque payload the
/// training engine produced for one question.
pub type TimedPayload = (f64, Value);

/// Ordered `(node, reward)` pairs, descending by `(reward, node)`.
pub type Leaderboard = Vec<(NodeId, f64)>;
