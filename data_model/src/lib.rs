pub mod identifier;
pub mod test_objects;

use std::fmt::{self, Display};

use derive_builder::Builder;
pub use identifier::{derive, IdentifierError};
use serde::{Deserialize, Serialize};

/// Pipeline/build context a container belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct ContainerScope {
    pub pipeline_id: u64,
    pub resource_id: Option<u64>,
    pub build_id: Option<u64>,
    pub plan_id: Option<String>,
}

impl ContainerScope {
    pub fn for_build(pipeline_id: u64, build_id: u64, plan_id: &str) -> Self {
        Self {
            pipeline_id,
            resource_id: None,
            build_id: Some(build_id),
            plan_id: Some(plan_id.to_string()),
        }
    }

    pub fn for_check(pipeline_id: u64, resource_id: u64) -> Self {
        Self {
            pipeline_id,
            resource_id: Some(resource_id),
            build_id: None,
            plan_id: None,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::AsRefStr,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContainerPurpose {
    Check,
    Get,
    Put,
    Task,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(handle: String) -> Self {
        Self(handle)
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Default for ContainerHandle {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

impl Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ContainerHandle {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Composite reuse key. Equal identifiers describe interchangeable
/// containers; many records may share one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ContainerIdentifier {
    pub scope: ContainerScope,
    pub step_name: String,
    pub purpose: ContainerPurpose,
    pub config_hash: String,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::AsRefStr,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContainerState {
    // Reserved by a scheduler, the worker has not confirmed the container yet.
    Creating,
    // Exists on its worker and is idle in the reusable pool.
    Created,
    // In use by a running step.
    Active,
    // Hosting worker disappeared without a clean handoff.
    Orphaned,
    // TTL lapsed or owner deleted, waiting for teardown.
    Expired,
    // Teardown requested from the worker.
    Destroying,
}

impl ContainerState {
    /// States that hold the per-identifier reservation.
    pub fn holds_reservation(&self) -> bool {
        matches!(self, Self::Creating | Self::Created | Self::Active)
    }

    pub fn is_reusable(&self) -> bool {
        matches!(self, Self::Created | Self::Active)
    }

    /// The container is on its way out; callers must reserve again.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Orphaned | Self::Expired | Self::Destroying)
    }

    pub fn can_transition_to(&self, next: ContainerState) -> bool {
        use ContainerState::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Creating, Created) |
                (Creating, Expired) |
                (Creating, Orphaned) |
                (Created, Active) |
                (Created, Expired) |
                (Created, Orphaned) |
                (Active, Created) |
                (Active, Expired) |
                (Active, Orphaned) |
                (Orphaned, Expired) |
                (Expired, Destroying)
        )
    }
}

/// Collaborator-owned entity a container depends on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    Build(u64),
    Pipeline(u64),
    ResourceCheck(u64),
}

impl Owner {
    pub fn key(&self) -> String {
        match self {
            Owner::Build(id) => format!("build|{}", id),
            Owner::Pipeline(id) => format!("pipeline|{}", id),
            Owner::ResourceCheck(id) => format!("resource_check|{}", id),
        }
    }
}

impl Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Build(id) => write!(f, "build {}", id),
            Owner::Pipeline(id) => write!(f, "pipeline {}", id),
            Owner::ResourceCheck(id) => write!(f, "resource check {}", id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerTombstone {
    pub owner: Owner,
    pub retired_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
pub struct ContainerRecord {
    #[builder(default)]
    pub handle: ContainerHandle,
    pub identifier: ContainerIdentifier,
    pub worker_name: String,
    #[builder(default = "ContainerState::Creating")]
    pub state: ContainerState,
    pub created_at: u64,
    pub last_used_at: u64,
    #[builder(default)]
    pub build_id: Option<u64>,
    #[builder(default)]
    pub pipeline_id: Option<u64>,
    #[builder(default)]
    pub resource_check_id: Option<u64>,
    #[builder(default)]
    #[serde(default)]
    pub destroy_attempts: u32,
}

impl ContainerRecord {
    /// New reservation for `identifier` placed on `worker_name`, owner
    /// references copied from the identifier's scope.
    pub fn creating(
        handle: ContainerHandle,
        identifier: ContainerIdentifier,
        worker_name: &str,
        now: u64,
    ) -> Self {
        let scope = &identifier.scope;
        let resource_check_id = match identifier.purpose {
            ContainerPurpose::Check => scope.resource_id,
            _ => None,
        };
        Self {
            handle,
            worker_name: worker_name.to_string(),
            state: ContainerState::Creating,
            created_at: now,
            last_used_at: now,
            build_id: scope.build_id,
            pipeline_id: Some(scope.pipeline_id),
            resource_check_id,
            destroy_attempts: 0,
            identifier,
        }
    }

    pub fn key(&self) -> &str {
        self.handle.get()
    }

    pub fn owners(&self) -> Vec<Owner> {
        let mut owners = Vec::with_capacity(3);
        if let Some(build_id) = self.build_id {
            owners.push(Owner::Build(build_id));
        }
        if let Some(pipeline_id) = self.pipeline_id {
            owners.push(Owner::Pipeline(pipeline_id));
        }
        if let Some(resource_check_id) = self.resource_check_id {
            owners.push(Owner::ResourceCheck(resource_check_id));
        }
        owners
    }

    /// Stamps a use at `now` without ever moving `last_used_at` backwards or
    /// before `created_at`.
    pub fn touch(&mut self, now: u64) {
        self.last_used_at = self.last_used_at.max(now).max(self.created_at);
    }
}
