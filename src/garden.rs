use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::ContainerHandle;
use futures::future::join_all;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::{collaborators::WorkerFleet, config::WorkerConfig};

struct GardenWorker {
    name: String,
    url: Url,
}

// Consecutive failed pings per worker. A worker is declared gone only after
// `threshold` failures in a row, one success resets its count.
struct LivenessTracker {
    threshold: u32,
    failures: HashMap<String, u32>,
}

impl LivenessTracker {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            failures: HashMap::new(),
        }
    }

    // Returns whether the worker still counts as live.
    fn record(&mut self, worker: &str, answered: bool) -> bool {
        if answered {
            if self.failures.remove(worker).is_some() {
                info!(worker, "worker answered a ping again");
            }
            return true;
        }
        let failures = self.failures.entry(worker.to_string()).or_default();
        *failures = failures.saturating_add(1);
        *failures < self.threshold
    }
}

/// Statically configured workers talking the Garden HTTP API.
pub struct GardenWorkerFleet {
    workers: Vec<GardenWorker>,
    client: reqwest::Client,
    liveness: Mutex<LivenessTracker>,
}

impl GardenWorkerFleet {
    pub fn new(
        workers: &[WorkerConfig],
        probe_timeout: Duration,
        failure_threshold: u32,
    ) -> Result<Self> {
        let workers = workers
            .iter()
            .map(|worker| {
                Ok(GardenWorker {
                    name: worker.name.clone(),
                    url: base_url(&worker.garden_url)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let client = reqwest::Client::builder()
            .timeout(probe_timeout)
            .build()
            .map_err(|e| anyhow!("unable to build garden client: {}", e))?;
        Ok(Self {
            workers,
            client,
            liveness: Mutex::new(LivenessTracker::new(failure_threshold.max(1))),
        })
    }

    fn worker(&self, name: &str) -> Option<&GardenWorker> {
        self.workers.iter().find(|worker| worker.name == name)
    }

    async fn ping(&self, worker: &GardenWorker) -> Result<()> {
        let resp = self
            .client
            .get(worker.url.join("ping")?)
            .send()
            .await
            .map_err(|e| anyhow!("unable to ping worker {}: {}", worker.name, e))?;
        if !resp.status().is_success() {
            return Err(anyhow!(
                "worker {} answered ping with status {}",
                worker.name,
                resp.status()
            ));
        }
        Ok(())
    }
}

// `Url::join` replaces the last path segment unless the base ends with '/'.
fn base_url(garden_url: &str) -> Result<Url> {
    let mut url =
        Url::parse(garden_url).map_err(|e| anyhow!("invalid garden url {}: {}", garden_url, e))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[async_trait]
impl WorkerFleet for GardenWorkerFleet {
    async fn live_workers(&self) -> Result<HashSet<String>> {
        let pings = join_all(self.workers.iter().map(|worker| self.ping(worker))).await;
        // Losing every worker at once is more likely our own network failing,
        // so it does not count against any of them.
        if !self.workers.is_empty() && pings.iter().all(|ping| ping.is_err()) {
            return Err(anyhow!("no worker in the fleet answered a ping"));
        }

        let mut liveness = self.liveness.lock().await;
        let mut live = HashSet::new();
        for (worker, ping) in self.workers.iter().zip(pings) {
            if let Err(err) = &ping {
                debug!(worker = %worker.name, "worker did not answer a ping: {:?}", err);
            }
            if liveness.record(&worker.name, ping.is_ok()) {
                live.insert(worker.name.clone());
            }
        }
        Ok(live)
    }

    async fn destroy(&self, worker_name: &str, handle: &ContainerHandle) -> Result<()> {
        let Some(worker) = self.worker(worker_name) else {
            warn!(
                worker = worker_name,
                handle = handle.get(),
                "worker left the fleet, treating container as destroyed"
            );
            return Ok(());
        };
        let url = worker.url.join(&format!("containers/{}", handle.get()))?;
        let resp = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| anyhow!("unable to destroy container {}: {}", handle, e))?;
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(anyhow!(
            "unable to destroy container {}: status: {}, error: {}",
            handle,
            status,
            resp.text().await.unwrap_or_default()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_keeps_path_prefix() {
        let url = base_url("http://10.0.0.1:7777/garden").unwrap();
        assert_eq!(url.join("ping").unwrap().as_str(), "http://10.0.0.1:7777/garden/ping");
        let url = base_url("http://10.0.0.1:7777").unwrap();
        assert_eq!(
            url.join("containers/abc").unwrap().as_str(),
            "http://10.0.0.1:7777/containers/abc"
        );
        assert!(base_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_destroy_on_unknown_worker_succeeds() {
        let fleet = GardenWorkerFleet::new(&[], Duration::from_millis(100), 3).unwrap();
        fleet
            .destroy("gone-worker", &ContainerHandle::from("h1"))
            .await
            .unwrap();
        assert!(fleet.live_workers().await.unwrap().is_empty());
    }

    #[test]
    fn test_worker_is_gone_after_consecutive_failures() {
        let mut liveness = LivenessTracker::new(3);
        assert!(liveness.record("worker-1", false));
        assert!(liveness.record("worker-1", false));
        assert!(!liveness.record("worker-1", false));
        assert!(!liveness.record("worker-1", false));
        // Other workers keep their own count.
        assert!(liveness.record("worker-2", false));
    }

    #[test]
    fn test_answered_ping_resets_failures() {
        let mut liveness = LivenessTracker::new(2);
        assert!(liveness.record("worker-1", false));
        assert!(liveness.record("worker-1", true));
        assert!(liveness.record("worker-1", false));
        assert!(!liveness.record("worker-1", false));
        assert!(liveness.record("worker-1", true));
    }

    #[tokio::test]
    async fn test_unreachable_fleet_does_not_count_failures() {
        let workers = vec![WorkerConfig {
            name: "worker-1".to_string(),
            // Nothing listens on the discard port.
            garden_url: "http://127.0.0.1:9".to_string(),
        }];
        let fleet = GardenWorkerFleet::new(&workers, Duration::from_millis(200), 1).unwrap();
        assert!(fleet.live_workers().await.is_err());
        assert!(fleet.live_workers().await.is_err());
        assert!(fleet.liveness.lock().await.failures.is_empty());
    }
}
