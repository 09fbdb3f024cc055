use data_model::{ContainerHandle, ContainerState};

use crate::driver;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("container {handle} already exists")]
    DuplicateHandle { handle: ContainerHandle },

    #[error("identifier {identifier_key} is reserved by container {holder}")]
    IdentifierReserved {
        identifier_key: String,
        holder: ContainerHandle,
    },

    #[error("container {handle} is {actual}, expected {expected}")]
    StateConflict {
        handle: ContainerHandle,
        expected: ContainerState,
        actual: ContainerState,
    },

    #[error("container {handle} was used at {last_used_at}, after {observed_at}")]
    UsedSince {
        handle: ContainerHandle,
        observed_at: u64,
        last_used_at: u64,
    },

    #[error("container {handle} cannot move from {from} to {to}")]
    InvalidTransition {
        handle: ContainerHandle,
        from: ContainerState,
        to: ContainerState,
    },

    #[error("container {handle} not found")]
    NotFound { handle: ContainerHandle },

    #[error(transparent)]
    Driver(#[from] driver::Error),

    #[error("store task failed to complete. error: {0}")]
    Background(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Identifies failed operations that can be retried with fresh state.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StateConflict { .. } | Self::UsedSince { .. } => true,
            Self::Driver(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Identifies failed operations that MUST not be retried.
    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }
}
