use std::{collections::HashSet, env, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use state_store::StoreOptions;
use url::Url;
use uuid::Uuid;

use crate::{reaper::ReaperConfig, registry::RegistryConfig};

const LOCAL_ENV: &str = "local";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub state_store_path: String,
    pub instance_id: Option<String>,
    /// JSON logs. Defaults to on everywhere except the local env.
    pub structured_logging: Option<bool>,
    pub registry: RegistrySettings,
    pub reaper: ReaperSettings,
    pub workers: Vec<WorkerConfig>,
    pub worker_probe_timeout_ms: u64,
    /// Consecutive failed pings before a worker counts as gone.
    pub worker_failure_threshold: u32,
    pub telemetry: TelemetryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            state_store_path: default_state_store_path(),
            instance_id: None,
            structured_logging: None,
            registry: Default::default(),
            reaper: Default::default(),
            workers: Vec::new(),
            worker_probe_timeout_ms: 2_000,
            worker_failure_threshold: 3,
            telemetry: Default::default(),
        }
    }
}

fn default_state_store_path() -> String {
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("registry_storage/state")
        .to_string_lossy()
        .to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub store_timeout_ms: u64,
    pub cas_retries: u32,
    /// fsync the store's WAL on every commit.
    pub sync_writes: bool,
    pub lock_timeout_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            store_timeout_ms: 5_000,
            cas_retries: 5,
            sync_writes: true,
            lock_timeout_ms: 1_000,
        }
    }
}

impl RegistrySettings {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            cas_retries: self.cas_retries,
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            sync_writes: self.sync_writes,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub interval_secs: u64,
    pub idle_ttl_secs: u64,
    pub creating_timeout_secs: u64,
    pub max_destroy_attempts: u32,
    pub store_timeout_ms: u64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        let defaults = ReaperConfig::default();
        Self {
            interval_secs: defaults.interval.as_secs(),
            idle_ttl_secs: defaults.idle_ttl.as_secs(),
            creating_timeout_secs: defaults.creating_timeout.as_secs(),
            max_destroy_attempts: defaults.max_destroy_attempts,
            store_timeout_ms: defaults.store_timeout.as_millis() as u64,
        }
    }
}

impl ReaperSettings {
    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.interval_secs),
            idle_ttl: Duration::from_secs(self.idle_ttl_secs),
            creating_timeout: Duration::from_secs(self.creating_timeout_secs),
            max_destroy_attempts: self.max_destroy_attempts,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfig {
    pub name: String,
    pub garden_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    // Enable metrics.
    pub enable_metrics: bool,
    // Export spans over OTLP.
    pub enable_tracing: bool,
    // OpenTelemetry collector grpc endpoint for both traces and metrics.
    // Defaults to using OTEL_EXPORTER_OTLP_ENDPOINT env var or to
    // localhost:4317 if empty.
    pub endpoint: Option<String>,
    pub metrics_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            enable_tracing: false,
            endpoint: None,
            metrics_interval_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&config_str)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<ServerConfig> {
        let config: ServerConfig = Figment::new().merge(Yaml::string(config_str)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let reaper = &self.reaper;
        if reaper.interval_secs == 0 {
            return Err(anyhow!("reaper.interval_secs must be greater than 0"));
        }
        if reaper.max_destroy_attempts == 0 {
            return Err(anyhow!("reaper.max_destroy_attempts must be greater than 0"));
        }
        if reaper.creating_timeout_secs == 0 || reaper.creating_timeout_secs >= reaper.idle_ttl_secs
        {
            return Err(anyhow!(
                "reaper.creating_timeout_secs ({}) must be between 0 and reaper.idle_ttl_secs ({})",
                reaper.creating_timeout_secs,
                reaper.idle_ttl_secs
            ));
        }
        if reaper.store_timeout_ms == 0 || self.registry.store_timeout_ms == 0 {
            return Err(anyhow!("store timeouts must be greater than 0"));
        }
        if self.worker_probe_timeout_ms == 0 {
            return Err(anyhow!("worker_probe_timeout_ms must be greater than 0"));
        }
        if self.worker_failure_threshold == 0 {
            return Err(anyhow!("worker_failure_threshold must be greater than 0"));
        }

        let mut names = HashSet::new();
        for worker in &self.workers {
            if !names.insert(worker.name.as_str()) {
                return Err(anyhow!("duplicate worker name: {}", worker.name));
            }
            Url::parse(&worker.garden_url).map_err(|e| {
                anyhow!(
                    "invalid garden url for worker {}: {}: {}",
                    worker.name,
                    worker.garden_url,
                    e
                )
            })?;
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.structured_logging.unwrap_or(self.env != LOCAL_ENV)
    }

    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, Uuid::new_v4()))
    }

    pub fn worker_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_probe_timeout_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.metrics_interval_secs)
    }
}
