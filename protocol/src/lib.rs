//! Flock Swarm Protocol
//!
//! Many independent worker nodes run a multi-stage, multi-round training
//! protocol, coordinated only through a shared eventually-consistent
//! key-value store. There are no direct peer-to-peer calls.
//!
//! # Architecture
//!
//! ```text
//!  ┌────────┐  put/get   ┌──────────┐  put/get   ┌────────┐
//!  │ Worker │◄──────────►│ KV store │◄──────────►│ Worker │
//!  │ (coord)│            │  (DHT)   │            │(follow)│
//!  └────────┘            └────┬─────┘            └────────┘
//!                             │ poll
//!                        ┌────▼─────┐
//!                        │  Server  │  → leaderboard / gossip API
//!                        └──────────┘
//! ```
//!
//! ## Coordination
//! - The coordinator publishes a single round/stage pointer
//! - Every node publishes per-question outputs and a cumulative reward
//! - Followers join rounds by polling the pointer, possibly mid-round
//! - Readers treat a missing key as "not yet available", never as an error:
//!   any record may be partially populated at any time

pub mod engine;
pub mod error;
pub mod keys;
pub mod ledger;
pub mod names;
pub mod node;
pub mod records;
pub mod stage;
pub mod store;
pub mod types;

pub use engine::{EngineReport, StepOutcome, TrainingEngine};
pub use error::{StoreError, SwarmError};
pub use ledger::{HttpLedger, NullLedger, SwarmLedger};
pub use node::NodeState;
pub use stage::{RewardCall, RewardFn, Stage, StagePipeline};
pub use store::{HttpStore, KvStore, MemStore, StoreValue};
pub use types::*;
