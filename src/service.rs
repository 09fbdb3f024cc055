use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::init_provider;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use registry_utils::{Clock, SystemClock};
use state_store::{ContainerStore, RegistryState};
use tokio::{self, signal, sync::watch};
use tracing::{error, info};

use crate::{
    collaborators::StoreOwnerCatalog,
    config::ServerConfig,
    garden::GardenWorkerFleet,
    reaper::Reaper,
    registry::Registry,
};

#[derive(Clone)]
pub struct Service {
    pub config: ServerConfig,
    pub shutdown_tx: watch::Sender<()>,
    pub shutdown_rx: watch::Receiver<()>,
    pub registry: Arc<Registry>,
    pub reaper: Arc<Reaper>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Service {
    pub async fn new(config: ServerConfig) -> Result<Self> {
        let meter_provider = init_provider(
            config.telemetry.enable_metrics,
            config.telemetry.endpoint.as_ref(),
            config.metrics_interval(),
            config.instance_id.as_ref(),
            env!("CARGO_PKG_VERSION"),
        )?;
        Self::with_meter_provider(config, meter_provider).await
    }

    /// Installs `meter_provider` as the global provider, then builds the
    /// components so their instruments report through it.
    pub async fn with_meter_provider(
        config: ServerConfig,
        meter_provider: Option<SdkMeterProvider>,
    ) -> Result<Self> {
        if let Some(provider) = &meter_provider {
            global::set_meter_provider(provider.clone());
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let state = RegistryState::new(
            config.state_store_path.parse()?,
            config.registry.store_options(),
        )
        .await
        .context("error opening the container store")?;
        let store: Arc<dyn ContainerStore> = state;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let registry = Arc::new(Registry::new(
            store.clone(),
            clock.clone(),
            config.registry.registry_config(),
        ));

        let fleet = Arc::new(
            GardenWorkerFleet::new(
                &config.workers,
                config.worker_probe_timeout(),
                config.worker_failure_threshold,
            )
            .context("error initializing the worker fleet")?,
        );
        let owners = Arc::new(StoreOwnerCatalog::new(store.clone()));
        let reaper = Arc::new(Reaper::new(
            store,
            clock,
            fleet,
            owners,
            config.reaper.reaper_config(),
        ));

        Ok(Self {
            config,
            shutdown_tx,
            shutdown_rx,
            registry,
            reaper,
            meter_provider,
        })
    }

    /// Runs the reaper until the process is told to stop.
    pub async fn start(&self) -> Result<()> {
        let reaper = self.reaper.clone();
        let shutdown_rx = self.shutdown_rx.clone();
        let reaper_handle = tokio::spawn(async move {
            reaper.start(shutdown_rx).await;
        });

        info!(
            workers = self.config.workers.len(),
            state_store_path = %self.config.state_store_path,
            "container registry started"
        );
        shutdown_signal(self.shutdown_tx.clone()).await;

        if let Err(err) = reaper_handle.await {
            error!("reaper task failed: {:?}", err);
        }
        // export metrics before shutdown
        if let Some(provider) = &self.meter_provider {
            if let Err(err) = provider.shutdown() {
                error!("Error shutting down meter provider: {:?}", err);
            }
        }
        Ok(())
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<()>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {:?}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install signal handler: {:?}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
    }
    if shutdown_tx.send(()).is_err() {
        error!("no component is listening for shutdown");
    }
    info!("signal received, shutting down gracefully");
}
