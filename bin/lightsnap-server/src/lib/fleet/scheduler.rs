// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet-wide snapshot batches.
//!
//! A batch visits every host in the fleet and takes a snapshot of every
//! enrolled instance on it. Hosts run concurrently, up to a limit, and the
//! instances on each host are handled by a small per-host worker pool. A slow
//! or failing host only delays its own part of the batch; a failing instance
//! is recorded and the batch moves on.

use std::sync::Arc;

use lightsnap_api_types::{BatchReport, EnabledInstance, InstanceFailure};
use slog::{debug, error, info, o, warn, Logger};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{BatchRegistry, FleetDirectory};
use crate::error::LifecycleError;
use crate::hypervisor::InstanceHandle;
use crate::lifecycle::{InstanceLifecycle, OpContext};

#[derive(Clone, Debug)]
pub struct FleetSettings {
    /// Instances snapshotted in parallel on one host.
    pub host_workers: usize,

    /// Hosts processed in parallel within one batch.
    pub max_concurrent_hosts: usize,

    /// Number of finished batch reports to keep.
    pub batch_history: usize,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self { host_workers: 4, max_concurrent_hosts: 16, batch_history: 32 }
    }
}

struct SchedulerInner {
    directory: Arc<dyn FleetDirectory>,
    lifecycle: Arc<InstanceLifecycle>,
    registry: BatchRegistry,
    settings: FleetSettings,
    log: Logger,
}

/// Dispatches fleet snapshot batches and answers questions about them.
pub struct FleetScheduler {
    inner: Arc<SchedulerInner>,

    /// Cancelled on shutdown to abandon the hypervisor calls of running
    /// batches.
    shutdown: CancellationToken,
}

impl FleetScheduler {
    pub fn new(
        directory: Arc<dyn FleetDirectory>,
        lifecycle: Arc<InstanceLifecycle>,
        settings: FleetSettings,
        log: Logger,
    ) -> Self {
        let registry = BatchRegistry::new(settings.batch_history);
        Self {
            inner: Arc::new(SchedulerInner {
                directory,
                lifecycle,
                registry,
                settings,
                log,
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Starts a batch that snapshots every enrolled instance in the fleet and
    /// returns its ID without waiting for it. With `daily`, only instances
    /// that also have the daily flag set are snapshotted.
    pub async fn snapshot_all_hosts(
        &self,
        daily: bool,
    ) -> Result<Uuid, LifecycleError> {
        let hosts = self.inner.directory.list_hosts().await?;
        let batch_id = Uuid::new_v4();
        self.inner.registry.begin(batch_id, daily, &hosts);
        info!(self.inner.log, "dispatching snapshot batch";
              "batch" => %batch_id,
              "daily" => daily,
              "hosts" => hosts.len());

        let inner = self.inner.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            inner.run_batch(batch_id, daily, hosts, cancel).await;
        });
        Ok(batch_id)
    }

    pub fn batch_report(&self, batch_id: Uuid) -> Option<BatchReport> {
        self.inner.registry.get(batch_id)
    }

    /// Reports of recent batches, newest first.
    pub fn list_batches(&self) -> Vec<BatchReport> {
        self.inner.registry.list()
    }

    /// Instances on `host` that have light snapshots enabled.
    pub async fn enabled_instances(
        &self,
        host: &str,
    ) -> Result<Vec<EnabledInstance>, LifecycleError> {
        let instances = self.inner.directory.list_instances(host).await?;
        let mut enabled = Vec::new();
        for handle in instances {
            let record = self.inner.lifecycle.record(handle.id).await?;
            if record.is_some_and(|r| r.enabled) {
                enabled.push(EnabledInstance {
                    instance_id: handle.id,
                    host: handle.host,
                });
            }
        }
        Ok(enabled)
    }

    /// Instances across the whole fleet that have light snapshots enabled.
    pub async fn enabled_instances_all(
        &self,
    ) -> Result<Vec<EnabledInstance>, LifecycleError> {
        let mut enabled = Vec::new();
        for host in self.inner.directory.list_hosts().await? {
            enabled.extend(self.enabled_instances(&host).await?);
        }
        Ok(enabled)
    }

    /// Abandons the outstanding hypervisor calls of every running batch.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

enum Outcome {
    Snapshotted,
    Skipped,
    NotEnrolled,
    Failed(InstanceFailure),
}

impl SchedulerInner {
    async fn run_batch(
        self: Arc<Self>,
        batch_id: Uuid,
        daily: bool,
        hosts: Vec<String>,
        cancel: CancellationToken,
    ) {
        let log = self.log.new(o!("batch" => batch_id.to_string()));
        let limit =
            Arc::new(Semaphore::new(self.settings.max_concurrent_hosts));
        let mut tasks = JoinSet::new();
        for host in hosts {
            let inner = self.clone();
            let limit = limit.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                // The semaphore is never closed.
                let Ok(_permit) = limit.acquire_owned().await else {
                    return;
                };
                inner.run_host(batch_id, daily, host, cancel).await;
            });
        }

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(log, "host task failed"; "error" => %e);
            }
        }

        self.registry.finish(batch_id);
        if let Some(report) = self.registry.get(batch_id) {
            let (succeeded, failed) = report.totals();
            info!(log, "snapshot batch finished";
                  "succeeded" => succeeded,
                  "failed" => failed);
        }
    }

    async fn run_host(
        self: Arc<Self>,
        batch_id: Uuid,
        daily: bool,
        host: String,
        cancel: CancellationToken,
    ) {
        let log = self.log.new(o!(
            "batch" => batch_id.to_string(),
            "host" => host.clone()
        ));

        let instances = match self.directory.list_instances(&host).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(log, "failed to list instances"; "error" => %e);
                self.registry.host_listing_failed(
                    batch_id,
                    &host,
                    e.to_string(),
                );
                return;
            }
        };
        debug!(log, "snapshotting host"; "instances" => instances.len());

        let workers = Arc::new(Semaphore::new(self.settings.host_workers));
        let mut tasks = JoinSet::new();
        for handle in instances {
            let inner = self.clone();
            let workers = workers.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let instance = handle.id;
                let Ok(_permit) = workers.acquire_owned().await else {
                    return (instance, Outcome::NotEnrolled);
                };
                (instance, inner.snapshot_one(handle, daily, &cancel).await)
            });
        }

        while let Some(res) = tasks.join_next().await {
            match res {
                Ok((_, Outcome::Snapshotted)) => {
                    self.registry.record_success(batch_id, &host);
                }
                Ok((_, Outcome::Skipped)) => {
                    self.registry.record_skipped(batch_id, &host);
                }
                Ok((_, Outcome::NotEnrolled)) => {}
                Ok((instance, Outcome::Failed(failure))) => {
                    warn!(log, "instance snapshot failed";
                          "instance" => %instance,
                          "code" => %failure.code,
                          "retryable" => failure.retryable,
                          "error" => &failure.message);
                    self.registry.record_failure(batch_id, &host, failure);
                }
                Err(e) => {
                    error!(log, "instance task failed"; "error" => %e);
                }
            }
        }

        self.registry.host_finished(batch_id, &host);
    }

    async fn snapshot_one(
        &self,
        handle: InstanceHandle,
        daily: bool,
        cancel: &CancellationToken,
    ) -> Outcome {
        let instance = handle.id;
        let failed = |e: LifecycleError| {
            let code = e.category();
            Outcome::Failed(InstanceFailure {
                instance_id: instance,
                code,
                message: e.to_string(),
                retryable: code.is_retryable(),
            })
        };

        let record = match self.lifecycle.record(instance).await {
            Ok(Some(record)) if record.enabled => record,
            Ok(_) => return Outcome::NotEnrolled,
            Err(e) => return failed(e),
        };
        if daily && !record.daily {
            return Outcome::Skipped;
        }

        let ctx = OpContext::with_cancel(cancel.child_token());
        match self.lifecycle.take_snapshot(&ctx, instance).await {
            Ok(_) => Outcome::Snapshotted,
            Err(e) => failed(e),
        }
    }
}
