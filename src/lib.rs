pub mod collaborators;
pub mod config;
pub mod error;
pub mod garden;
pub mod reaper;
pub mod registry;
pub mod service;
pub mod tracing;

pub use collaborators::{OwnerCatalog, StoreOwnerCatalog, WorkerFleet};
pub use error::RegistryError;
pub use reaper::{ExpireReason, ReapReport, Reaper, ReaperConfig};
pub use registry::{CallContext, Registry, RegistryConfig, Reservation};

#[cfg(test)]
mod service_test;
#[cfg(test)]
mod testing;
