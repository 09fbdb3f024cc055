use std::{future::Future, sync::Arc, time::Duration};

use data_model::{
    ContainerHandle,
    ContainerIdentifier,
    ContainerRecord,
    ContainerState,
    Owner,
};
use metrics::registry_stats;
use opentelemetry::KeyValue;
use registry_utils::Clock;
use state_store::{ContainerStore, InsertMode, StoreError, Transition};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RegistryError;

/// Per-call cancellation and deadline. Every store call an operation makes is
/// raced against both.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub cancel: CancellationToken,
    /// Overrides the configured store timeout for the whole operation.
    pub timeout: Option<Duration>,
}

impl CallContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub store_timeout: Duration,
    /// How many times a lost compare-and-swap is retried before the conflict
    /// is returned to the caller.
    pub cas_retries: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            cas_retries: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub handle: ContainerHandle,
    pub is_new: bool,
}

// One registry operation in flight.
struct Call<'a> {
    ctx: &'a CallContext,
    operation: &'static str,
    timeout: Duration,
    deadline: Instant,
}

impl Call<'_> {
    /// Outer error: the call was cancelled or ran past its deadline. Inner
    /// error: the store's answer.
    async fn run<T, F>(&self, fut: F) -> Result<Result<T, StoreError>, RegistryError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => Err(RegistryError::Cancelled {
                operation: self.operation,
            }),
            res = tokio::time::timeout_at(self.deadline, fut) => {
                res.map_err(|_| RegistryError::TimedOut {
                    operation: self.operation,
                    timeout: self.timeout,
                })
            }
        }
    }
}

pub struct Registry {
    store: Arc<dyn ContainerStore>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    metrics: registry_stats::Metrics,
}

impl Registry {
    pub fn new(store: Arc<dyn ContainerStore>, clock: Arc<dyn Clock>, config: RegistryConfig) -> Self {
        Self {
            store,
            clock,
            config,
            metrics: registry_stats::Metrics::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn ContainerStore> {
        self.store.clone()
    }

    fn call<'a>(&self, ctx: &'a CallContext, operation: &'static str) -> Call<'a> {
        let timeout = ctx.timeout.unwrap_or(self.config.store_timeout);
        Call {
            ctx,
            operation,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    /// Returns a reusable container for `identifier`, or reserves a new one
    /// to be created on `worker_name`. At most one caller per identifier
    /// gets `is_new = true`, everybody else joins the winner's handle.
    #[tracing::instrument(skip(self, ctx, identifier), fields(identifier = %identifier.key()))]
    pub async fn reserve(
        &self,
        ctx: &CallContext,
        identifier: &ContainerIdentifier,
        worker_name: &str,
    ) -> Result<Reservation, RegistryError> {
        let call = self.call(ctx, "reserve");
        let identifier_key = identifier.key();
        let mut attempt = 0;
        loop {
            let records = call
                .run(self.store.find_by_identifier(&identifier_key))
                .await??;

            let (handle, err) = match self.join_existing(&call, &records).await? {
                Some(Ok(reservation)) => {
                    self.metrics
                        .reservations
                        .add(1, &[KeyValue::new("outcome", "reused")]);
                    debug!(handle = reservation.handle.get(), "reusing container");
                    return Ok(reservation);
                }
                Some(Err(err)) => err,
                None => {
                    let record = ContainerRecord::creating(
                        ContainerHandle::default(),
                        identifier.clone(),
                        worker_name,
                        self.clock.now_ms(),
                    );
                    let handle = record.handle.clone();
                    match call
                        .run(self.store.insert(record, InsertMode::Exclusive))
                        .await?
                    {
                        Ok(()) => {
                            self.metrics
                                .reservations
                                .add(1, &[KeyValue::new("outcome", "new")]);
                            info!(handle = handle.get(), "reserved new container");
                            return Ok(Reservation {
                                handle,
                                is_new: true,
                            });
                        }
                        Err(err) => (handle, err),
                    }
                }
            };

            // Someone else won the race or moved the candidate, look again.
            let retryable = matches!(
                err,
                StoreError::IdentifierReserved { .. } |
                    StoreError::DuplicateHandle { .. } |
                    StoreError::NotFound { .. }
            ) || err.is_retryable();
            if !retryable || attempt >= self.config.cas_retries {
                return Err(lost_race(&handle, err));
            }
            attempt += 1;
            self.metrics
                .conflicts
                .add(1, &[KeyValue::new("op", "reserve")]);
            debug!(attempt, "reserve lost a race, retrying: {}", err);
        }
    }

    // Picks the freshest reusable record, else the in-flight creation, and
    // stamps the use. `None` when there is nothing to join.
    async fn join_existing(
        &self,
        call: &Call<'_>,
        records: &[ContainerRecord],
    ) -> Result<Option<Result<Reservation, (ContainerHandle, StoreError)>>, RegistryError> {
        let candidate = records
            .iter()
            .find(|r| r.state.is_reusable())
            .or_else(|| records.iter().find(|r| r.state == ContainerState::Creating));
        let Some(candidate) = candidate else {
            return Ok(None);
        };

        let transition =
            Transition::new(candidate.state, candidate.state).touched(self.clock.now_ms());
        let res = call
            .run(self.store.update_state(&candidate.handle, transition))
            .await?;
        Ok(Some(
            res.map(|record| Reservation {
                handle: record.handle,
                is_new: false,
            })
            .map_err(|err| (candidate.handle.clone(), err)),
        ))
    }

    /// The worker reported the container as running.
    #[tracing::instrument(skip(self, ctx, handle), fields(handle = handle.get()))]
    pub async fn confirm_created(
        &self,
        ctx: &CallContext,
        handle: &ContainerHandle,
    ) -> Result<(), RegistryError> {
        let now = self.clock.now_ms();
        self.transition(ctx, "confirm_created", handle, |record| match record.state {
            ContainerState::Creating => Ok(Some(
                Transition::new(ContainerState::Creating, ContainerState::Created).touched(now),
            )),
            state => Err(conflict(record, format!("cannot confirm a {} container", state))),
        })
        .await
    }

    /// Marks the container as in use by a step.
    #[tracing::instrument(skip(self, ctx, handle), fields(handle = handle.get()))]
    pub async fn acquire(
        &self,
        ctx: &CallContext,
        handle: &ContainerHandle,
    ) -> Result<(), RegistryError> {
        let now = self.clock.now_ms();
        self.transition(ctx, "acquire", handle, |record| match record.state {
            ContainerState::Created | ContainerState::Active => Ok(Some(
                Transition::new(record.state, ContainerState::Active).touched(now),
            )),
            state if state.is_gone() => Err(gone(record)),
            _ => Err(conflict(record, "container is not created yet".to_string())),
        })
        .await
    }

    /// Returns the container to the reusable pool.
    #[tracing::instrument(skip(self, ctx, handle), fields(handle = handle.get()))]
    pub async fn release(
        &self,
        ctx: &CallContext,
        handle: &ContainerHandle,
    ) -> Result<(), RegistryError> {
        let now = self.clock.now_ms();
        self.transition(ctx, "release", handle, |record| match record.state {
            ContainerState::Active => Ok(Some(
                Transition::new(ContainerState::Active, ContainerState::Created).touched(now),
            )),
            state if state.is_gone() => Err(gone(record)),
            state => Err(conflict(record, format!("cannot release a {} container", state))),
        })
        .await
    }

    /// Takes the container out of the reusable pool. The reaper destroys it
    /// on its next pass.
    #[tracing::instrument(skip(self, ctx, handle), fields(handle = handle.get()))]
    pub async fn expire(
        &self,
        ctx: &CallContext,
        handle: &ContainerHandle,
    ) -> Result<(), RegistryError> {
        self.transition(ctx, "expire", handle, |record| match record.state {
            ContainerState::Expired | ContainerState::Destroying => Ok(None),
            state => Ok(Some(Transition::new(state, ContainerState::Expired))),
        })
        .await
    }

    pub async fn lookup(
        &self,
        ctx: &CallContext,
        handle: &ContainerHandle,
    ) -> Result<Option<ContainerRecord>, RegistryError> {
        let call = self.call(ctx, "lookup");
        Ok(call.run(self.store.get_by_handle(handle)).await??)
    }

    /// Every record for the identifier, most recently used first.
    pub async fn lookup_by_identifier(
        &self,
        ctx: &CallContext,
        identifier: &ContainerIdentifier,
    ) -> Result<Vec<ContainerRecord>, RegistryError> {
        let call = self.call(ctx, "lookup_by_identifier");
        Ok(call
            .run(self.store.find_by_identifier(&identifier.key()))
            .await??)
    }

    /// Records that `owner` was deleted. Its containers are expired by the
    /// next reaper pass.
    #[tracing::instrument(skip(self, ctx))]
    pub async fn retire_owner(&self, ctx: &CallContext, owner: Owner) -> Result<(), RegistryError> {
        let call = self.call(ctx, "retire_owner");
        call.run(self.store.tombstone_owner(owner, self.clock.now_ms()))
            .await??;
        info!(%owner, "owner retired");
        Ok(())
    }

    // Reads the record, lets `decide` pick the transition for its current
    // state and applies it, retrying lost compare-and-swaps.
    async fn transition<F>(
        &self,
        ctx: &CallContext,
        operation: &'static str,
        handle: &ContainerHandle,
        decide: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&ContainerRecord) -> Result<Option<Transition>, RegistryError>,
    {
        let call = self.call(ctx, operation);
        let mut attempt = 0;
        loop {
            let Some(record) = call.run(self.store.get_by_handle(handle)).await?? else {
                return Err(RegistryError::NotFound {
                    handle: handle.clone(),
                });
            };
            let Some(transition) = decide(&record)? else {
                return Ok(());
            };
            let next = transition.next;
            match call.run(self.store.update_state(handle, transition)).await? {
                Ok(_) => {
                    self.metrics
                        .transitions
                        .add(1, &[KeyValue::new("op", operation)]);
                    debug!(from = %record.state, to = %next, "container transitioned");
                    return Ok(());
                }
                Err(err) if err.is_retryable() && attempt < self.config.cas_retries => {
                    attempt += 1;
                    self.metrics
                        .conflicts
                        .add(1, &[KeyValue::new("op", operation)]);
                    debug!(attempt, "{} lost a race, retrying: {}", operation, err);
                }
                Err(err) => return Err(lost_race(handle, err)),
            }
        }
    }
}

// A write that kept losing to other writers. Contention inside the store
// surfaces the same way as a lost compare-and-swap.
fn lost_race(handle: &ContainerHandle, err: StoreError) -> RegistryError {
    if matches!(err, StoreError::Driver(_)) && err.is_retryable() {
        return RegistryError::StateConflict {
            handle: handle.clone(),
            reason: format!("store contention: {}", err),
        };
    }
    err.into()
}

fn gone(record: &ContainerRecord) -> RegistryError {
    RegistryError::Gone {
        handle: record.handle.clone(),
        state: record.state,
    }
}

fn conflict(record: &ContainerRecord, reason: String) -> RegistryError {
    RegistryError::StateConflict {
        handle: record.handle.clone(),
        reason,
    }
}
