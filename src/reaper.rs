use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Result};
use data_model::{ContainerRecord, ContainerState, Owner};
use metrics::{reaper_stats, Timer};
use opentelemetry::KeyValue;
use registry_utils::{elapsed_ms, Clock};
use state_store::{ContainerStore, StoreError, Transition};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    collaborators::{OwnerCatalog, WorkerFleet},
    error::RegistryError,
};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// `created` containers unused for longer than this are expired.
    pub idle_ttl: Duration,
    /// `creating` containers never confirmed within this are expired.
    pub creating_timeout: Duration,
    /// Failed destroys tolerated before a container is reported as a
    /// persistent orphan and left alone.
    pub max_destroy_attempts: u32,
    pub store_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            idle_ttl: Duration::from_secs(300),
            creating_timeout: Duration::from_secs(60),
            max_destroy_attempts: 5,
            store_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::AsRefStr, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ExpireReason {
    WorkerGone,
    OwnerGone,
    IdleTtl,
    StaleCreation,
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub orphaned: usize,
    pub expired: HashMap<ExpireReason, usize>,
    pub destroyed: usize,
    pub destroy_failures: usize,
    pub persistent_orphans: usize,
    /// Records skipped because a scheduler changed them during the pass.
    pub conflicts: usize,
    pub errors: usize,
}

impl ReapReport {
    pub fn expired_total(&self) -> usize {
        self.expired.values().sum()
    }

    pub fn expired_for(&self, reason: ExpireReason) -> usize {
        self.expired.get(&reason).copied().unwrap_or_default()
    }
}

// A record from the pass snapshot. Once settled it is left alone for the
// rest of the pass.
struct Entry {
    record: ContainerRecord,
    settled: bool,
}

pub struct Reaper {
    store: Arc<dyn ContainerStore>,
    clock: Arc<dyn Clock>,
    fleet: Arc<dyn WorkerFleet>,
    owners: Arc<dyn OwnerCatalog>,
    config: ReaperConfig,
    metrics: reaper_stats::Metrics,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn ContainerStore>,
        clock: Arc<dyn Clock>,
        fleet: Arc<dyn WorkerFleet>,
        owners: Arc<dyn OwnerCatalog>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            store,
            clock,
            fleet,
            owners,
            config,
            metrics: reaper_stats::Metrics::new(),
        }
    }

    /// Runs a pass every `interval` until `shutdown_rx` fires. A pass in
    /// progress is abandoned on shutdown, every store write it made is
    /// already committed.
    pub async fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.config.interval, "reaper started");
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown_rx.changed() => {
                    info!("reaper shutting down");
                    return;
                }
            }
            tokio::select! {
                res = self.run_once() => match res {
                    Ok(report) => debug!(?report, "reaper pass finished"),
                    Err(err) => error!("reaper pass failed: {:?}", err),
                },
                _ = shutdown_rx.changed() => {
                    info!("reaper shutting down during a pass");
                    return;
                }
            }
        }
    }

    /// One reaping pass over a snapshot of the store.
    pub async fn run_once(&self) -> Result<ReapReport> {
        let _timer = Timer::start(&self.metrics.pass_duration);
        self.metrics.passes.add(1, &[]);
        let now = self.clock.now_ms();
        let mut report = ReapReport::default();

        let mut entries: Vec<Entry> = self
            .bounded(self.store.list_containers())
            .await?
            .into_iter()
            .map(|record| Entry {
                record,
                settled: false,
            })
            .collect();

        self.sweep_workers(&mut entries, &mut report).await;
        self.sweep_owners(&mut entries, &mut report).await;
        self.sweep_ttls(&mut entries, now, &mut report).await;
        self.teardown(&mut entries, &mut report).await;

        if report != ReapReport::default() {
            info!(
                orphaned = report.orphaned,
                expired = report.expired_total(),
                destroyed = report.destroyed,
                destroy_failures = report.destroy_failures,
                persistent_orphans = report.persistent_orphans,
                conflicts = report.conflicts,
                errors = report.errors,
                "reaper pass"
            );
        }
        Ok(report)
    }

    /// Containers stuck in `destroying` after exhausting their destroy
    /// attempts. They need an operator.
    pub async fn persistent_orphans(&self) -> Result<Vec<ContainerRecord>> {
        Ok(self
            .bounded(self.store.list_by_state(ContainerState::Destroying))
            .await?
            .into_iter()
            .filter(|record| record.destroy_attempts >= self.config.max_destroy_attempts)
            .collect())
    }

    async fn sweep_workers(&self, entries: &mut [Entry], report: &mut ReapReport) {
        match self.fleet.live_workers().await {
            Ok(live) => {
                for entry in entries.iter_mut() {
                    if entry.settled ||
                        !entry.record.state.holds_reservation() ||
                        live.contains(&entry.record.worker_name)
                    {
                        continue;
                    }
                    warn!(
                        handle = entry.record.key(),
                        worker = %entry.record.worker_name,
                        "worker is gone, orphaning container"
                    );
                    let transition = Transition::new(entry.record.state, ContainerState::Orphaned);
                    if self.apply(entry, transition, report).await {
                        report.orphaned += 1;
                    }
                }
            }
            Err(err) => {
                // Without a fleet answer every container would look orphaned.
                warn!("skipping worker sweep, unable to list live workers: {:?}", err);
                report.errors += 1;
            }
        }

        // Includes records orphaned by an earlier, interrupted pass.
        for entry in entries.iter_mut() {
            if !entry.settled && entry.record.state == ContainerState::Orphaned {
                self.expire(entry, ExpireReason::WorkerGone, report).await;
            }
        }
    }

    async fn sweep_owners(&self, entries: &mut [Entry], report: &mut ReapReport) {
        let mut cache: HashMap<Owner, bool> = HashMap::new();
        for entry in entries.iter_mut() {
            if entry.settled || !entry.record.state.holds_reservation() {
                continue;
            }
            match self.missing_owner(&entry.record, &mut cache).await {
                Ok(Some(owner)) => {
                    info!(
                        handle = entry.record.key(),
                        %owner,
                        "owner no longer exists, expiring container"
                    );
                    self.expire(entry, ExpireReason::OwnerGone, report).await;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        handle = entry.record.key(),
                        "unable to check container owners: {:?}", err
                    );
                    report.errors += 1;
                    entry.settled = true;
                }
            }
        }
    }

    async fn missing_owner(
        &self,
        record: &ContainerRecord,
        cache: &mut HashMap<Owner, bool>,
    ) -> Result<Option<Owner>> {
        for owner in record.owners() {
            let exists = match cache.get(&owner) {
                Some(exists) => *exists,
                None => {
                    let exists = self.owners.exists(&owner).await?;
                    cache.insert(owner, exists);
                    exists
                }
            };
            if !exists {
                return Ok(Some(owner));
            }
        }
        Ok(None)
    }

    async fn sweep_ttls(&self, entries: &mut [Entry], now: u64, report: &mut ReapReport) {
        let idle_ttl = self.config.idle_ttl.as_millis() as u64;
        let creating_timeout = self.config.creating_timeout.as_millis() as u64;
        for entry in entries.iter_mut() {
            if entry.settled {
                continue;
            }
            let record = &entry.record;
            let reason = match record.state {
                ContainerState::Created if elapsed_ms(now, record.last_used_at) > idle_ttl => {
                    ExpireReason::IdleTtl
                }
                ContainerState::Creating if elapsed_ms(now, record.created_at) > creating_timeout => {
                    ExpireReason::StaleCreation
                }
                _ => continue,
            };
            debug!(handle = record.key(), %reason, "container timed out");
            // A reserve may have joined the container since the snapshot.
            let transition = Transition::new(record.state, ContainerState::Expired)
                .if_unused_since(record.last_used_at);
            self.expire_with(entry, transition, reason, report).await;
        }
    }

    async fn teardown(&self, entries: &mut [Entry], report: &mut ReapReport) {
        for entry in entries.iter_mut() {
            if entry.settled {
                continue;
            }
            if entry.record.state == ContainerState::Expired {
                let transition =
                    Transition::new(ContainerState::Expired, ContainerState::Destroying);
                if !self.apply(entry, transition, report).await {
                    continue;
                }
            }
            if entry.record.state == ContainerState::Destroying &&
                entry.record.destroy_attempts < self.config.max_destroy_attempts
            {
                self.destroy(entry, report).await;
            }
        }
    }

    async fn destroy(&self, entry: &mut Entry, report: &mut ReapReport) {
        let record = &entry.record;
        match self.fleet.destroy(&record.worker_name, &record.handle).await {
            Ok(()) => match self.bounded(self.store.delete(&record.handle)).await {
                Ok(()) => {
                    report.destroyed += 1;
                    self.metrics.destroyed.add(1, &[]);
                    info!(
                        handle = record.key(),
                        worker = %record.worker_name,
                        "container destroyed"
                    );
                }
                Err(err) if is_not_found(&err) => {
                    debug!(handle = record.key(), "container already removed");
                }
                Err(err) => {
                    error!(
                        handle = record.key(),
                        "unable to delete destroyed container: {:?}", err
                    );
                    report.errors += 1;
                }
            },
            Err(err) => {
                report.destroy_failures += 1;
                self.metrics.destroy_failures.add(1, &[]);
                warn!(
                    handle = record.key(),
                    worker = %record.worker_name,
                    attempt = record.destroy_attempts + 1,
                    "unable to destroy container: {:?}",
                    err
                );
                let transition =
                    Transition::new(ContainerState::Destroying, ContainerState::Destroying)
                        .with_failed_destroy();
                if self.apply(entry, transition, report).await &&
                    entry.record.destroy_attempts >= self.config.max_destroy_attempts
                {
                    let alert = RegistryError::PersistentOrphan {
                        handle: entry.record.handle.clone(),
                        worker_name: entry.record.worker_name.clone(),
                        attempts: entry.record.destroy_attempts,
                    };
                    error!(handle = entry.record.key(), "{}", alert);
                    self.metrics.persistent_orphans.add(1, &[]);
                    report.persistent_orphans += 1;
                }
            }
        }
        entry.settled = true;
    }

    async fn expire(&self, entry: &mut Entry, reason: ExpireReason, report: &mut ReapReport) {
        let transition = Transition::new(entry.record.state, ContainerState::Expired);
        self.expire_with(entry, transition, reason, report).await
    }

    async fn expire_with(
        &self,
        entry: &mut Entry,
        transition: Transition,
        reason: ExpireReason,
        report: &mut ReapReport,
    ) {
        if self.apply(entry, transition, report).await {
            *report.expired.entry(reason).or_default() += 1;
            self.metrics
                .expired
                .add(1, &[KeyValue::new("reason", reason.as_ref().to_string())]);
        }
    }

    // Applies `transition` to the entry's record. A lost race or a failure
    // settles the record for this pass instead of failing the pass.
    async fn apply(&self, entry: &mut Entry, transition: Transition, report: &mut ReapReport) -> bool {
        match self
            .bounded(self.store.update_state(&entry.record.handle, transition))
            .await
        {
            Ok(updated) => {
                entry.record = updated;
                true
            }
            Err(err) => {
                match err.downcast_ref::<StoreError>() {
                    Some(StoreError::StateConflict { .. }) |
                    Some(StoreError::UsedSince { .. }) |
                    Some(StoreError::NotFound { .. }) => {
                        debug!(
                            handle = entry.record.key(),
                            "container changed during the pass: {}", err
                        );
                        report.conflicts += 1;
                    }
                    _ => {
                        error!(
                            handle = entry.record.key(),
                            "unable to update container: {:?}", err
                        );
                        report.errors += 1;
                    }
                }
                entry.settled = true;
                false
            }
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.config.store_timeout, fut)
            .await
            .map_err(|_| anyhow!("store call timed out after {:?}", self.config.store_timeout))?
            .map_err(anyhow::Error::from)
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::NotFound { .. })
    )
}
