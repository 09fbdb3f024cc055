use std::time::Duration;

use data_model::{ContainerHandle, ContainerState, IdentifierError};
use state_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidScope(#[from] IdentifierError),

    #[error("container {handle} already exists")]
    DuplicateHandle { handle: ContainerHandle },

    #[error("identifier {identifier_key} is reserved by container {holder}")]
    IdentifierReserved {
        identifier_key: String,
        holder: ContainerHandle,
    },

    #[error("container {handle} state conflict: {reason}")]
    StateConflict {
        handle: ContainerHandle,
        reason: String,
    },

    #[error("container {handle} not found")]
    NotFound { handle: ContainerHandle },

    #[error("container {handle} is {state}, reserve a new one")]
    Gone {
        handle: ContainerHandle,
        state: ContainerState,
    },

    #[error(
        "container {handle} on worker {worker_name} is still alive after {attempts} destroy attempts"
    )]
    PersistentOrphan {
        handle: ContainerHandle,
        worker_name: String,
        attempts: u32,
    },

    #[error("{operation} was cancelled")]
    Cancelled { operation: &'static str },

    #[error("{operation} did not finish within {timeout:?}")]
    TimedOut {
        operation: &'static str,
        timeout: Duration,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl RegistryError {
    /// The caller may retry the operation, possibly after re-reading state.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DuplicateHandle { .. } |
            Self::IdentifierReserved { .. } |
            Self::StateConflict { .. } |
            Self::TimedOut { .. } => true,
            Self::Store(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateHandle { handle } => Self::DuplicateHandle { handle },
            StoreError::IdentifierReserved {
                identifier_key,
                holder,
            } => Self::IdentifierReserved {
                identifier_key,
                holder,
            },
            StoreError::StateConflict {
                handle,
                expected,
                actual,
            } => Self::StateConflict {
                handle,
                reason: format!("expected {}, found {}", expected, actual),
            },
            StoreError::InvalidTransition { handle, from, to } => Self::StateConflict {
                handle,
                reason: format!("cannot move from {} to {}", from, to),
            },
            StoreError::UsedSince {
                handle,
                observed_at,
                last_used_at,
            } => Self::StateConflict {
                handle,
                reason: format!("used at {} after {}", last_used_at, observed_at),
            },
            StoreError::NotFound { handle } => Self::NotFound { handle },
            other => Self::Store(other),
        }
    }
}
