use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{test_objects::tests::TEST_WORKER, ContainerHandle, Owner};
use registry_utils::{Clock, ManualClock};
use state_store::{test_state_store::TestStateStore, ContainerStore};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    collaborators::{OwnerCatalog, StoreOwnerCatalog, WorkerFleet},
    reaper::{Reaper, ReaperConfig},
    registry::{Registry, RegistryConfig},
};

pub const START_MS: u64 = 1_000_000;

#[derive(Default)]
struct FleetState {
    live: HashSet<String>,
    unreachable: bool,
    failing: HashSet<ContainerHandle>,
    destroyed: Vec<ContainerHandle>,
    destroy_calls: usize,
}

/// In-memory worker fleet. Workers are live until removed, destroys succeed
/// unless the handle was marked as failing.
#[derive(Clone, Default)]
pub struct FakeWorkerFleet {
    state: Arc<Mutex<FleetState>>,
}

impl FakeWorkerFleet {
    pub fn with_workers(workers: &[&str]) -> Self {
        let fleet = Self::default();
        {
            let mut state = fleet.state.lock().unwrap();
            state.live = workers.iter().map(|w| w.to_string()).collect();
        }
        fleet
    }

    pub fn remove_worker(&self, worker: &str) {
        self.state.lock().unwrap().live.remove(worker);
    }

    /// Makes `live_workers` fail, as if the fleet could not be queried.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub fn fail_destroy(&self, handle: &ContainerHandle) {
        self.state.lock().unwrap().failing.insert(handle.clone());
    }

    pub fn heal_destroy(&self, handle: &ContainerHandle) {
        self.state.lock().unwrap().failing.remove(handle);
    }

    pub fn destroyed(&self) -> Vec<ContainerHandle> {
        self.state.lock().unwrap().destroyed.clone()
    }

    pub fn destroy_calls(&self) -> usize {
        self.state.lock().unwrap().destroy_calls
    }
}

#[async_trait]
impl WorkerFleet for FakeWorkerFleet {
    async fn live_workers(&self) -> Result<HashSet<String>> {
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(anyhow!("fleet is unreachable"));
        }
        Ok(state.live.clone())
    }

    async fn destroy(&self, _worker_name: &str, handle: &ContainerHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.destroy_calls += 1;
        if state.failing.contains(handle) {
            return Err(anyhow!("garden refused to destroy {}", handle));
        }
        state.destroyed.push(handle.clone());
        Ok(())
    }
}

/// Owner catalog that cannot answer for one owner. Every other owner exists.
pub struct FlakyOwnerCatalog {
    pub broken: Owner,
}

#[async_trait]
impl OwnerCatalog for FlakyOwnerCatalog {
    async fn exists(&self, owner: &Owner) -> Result<bool> {
        if *owner == self.broken {
            return Err(anyhow!("catalog unavailable for {}", owner));
        }
        Ok(true)
    }
}

pub struct TestRegistry {
    pub registry: Arc<Registry>,
    pub reaper: Reaper,
    pub store: Arc<dyn ContainerStore>,
    pub clock: ManualClock,
    pub fleet: FakeWorkerFleet,
    // Keeps the database directory alive.
    _state: TestStateStore,
}

impl TestRegistry {
    pub async fn new() -> Result<Self> {
        Self::with_config(ReaperConfig::default()).await
    }

    pub async fn with_config(reaper_config: ReaperConfig) -> Result<Self> {
        Self::build(reaper_config, None).await
    }

    pub async fn with_owner_catalog(
        reaper_config: ReaperConfig,
        owners: Arc<dyn OwnerCatalog>,
    ) -> Result<Self> {
        Self::build(reaper_config, Some(owners)).await
    }

    async fn build(
        reaper_config: ReaperConfig,
        owners: Option<Arc<dyn OwnerCatalog>>,
    ) -> Result<Self> {
        init_test_tracing();

        let state = TestStateStore::new().await?;
        let store: Arc<dyn ContainerStore> = state.registry_state.clone();
        let clock = ManualClock::new(START_MS);
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let fleet = FakeWorkerFleet::with_workers(&[TEST_WORKER]);
        let owners: Arc<dyn OwnerCatalog> = match owners {
            Some(owners) => owners,
            None => Arc::new(StoreOwnerCatalog::new(store.clone())),
        };

        let registry = Arc::new(Registry::new(
            store.clone(),
            shared_clock.clone(),
            RegistryConfig::default(),
        ));
        let reaper = Reaper::new(
            store.clone(),
            shared_clock,
            Arc::new(fleet.clone()),
            owners,
            reaper_config,
        );

        Ok(Self {
            registry,
            reaper,
            store,
            clock,
            fleet,
            _state: state,
        })
    }
}

fn init_test_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    let _ = subscriber::set_global_default(
        tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_test_writer()
                .with_filter(env_filter),
        ),
    );
}
