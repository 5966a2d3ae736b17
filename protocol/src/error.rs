use thiserror::Error;

/// Faults from the key-value store client itself.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request timed out")]
    Timeout,

    #[error("store transport: {0}")]
    Transport(String),

    #[error("store serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The protocol-level error taxonomy.
///
/// `Unavailable` is the normal state of an eventually-consistent record and
/// is handled by waiting or skipping, never surfaced to a caller as failure.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// Key or subkey has not been observed yet. Recoverable by definition.
    #[error("not yet available: {0}")]
    Unavailable(String),

    /// Store communication fault during training. Retried with a cooldown up
    /// to a fixed cap; exhausting the cap is fatal for the stage.
    #[error("transient i/o: {0}")]
    TransientIo(String),

    /// A stage's dataset builder could not produce samples. Followers retry
    /// once from stage 0 within the same round.
    #[error("dataset generation: {0}")]
    DatasetGeneration(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Fatal(String),
}

impl SwarmError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SwarmError::Unavailable(_))
    }

    /// True for failures worth a bounded local retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SwarmError::TransientIo(_)
                | SwarmError::Store(StoreError::Timeout | StoreError::Transport(_))
        )
    }

    pub fn is_generation(&self) -> bool {
        matches!(self, SwarmError::DatasetGeneration(_))
    }
}
