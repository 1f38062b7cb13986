// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A simulated hypervisor that keeps overlay chains in memory.
//!
//! Each call sleeps for a configurable latency and then applies its effect.
//! The effect runs on a detached task, so a caller that gives up waiting (by
//! timing out or being cancelled) does not stop it from landing, just like a
//! real hypervisor job.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lightsnap_api_types::SnapshotId;
use slog::{debug, Logger};
use uuid::Uuid;

use super::{
    ChainDescription, HypervisorError, HypervisorGateway, InstanceHandle,
};

#[derive(Debug, Default)]
struct SimState {
    chains: HashMap<Uuid, Vec<SnapshotId>>,
    next_snapshot: u64,
    latency: Duration,
    host_latency: BTreeMap<String, Duration>,
    failing_hosts: BTreeSet<String>,

    /// Instances whose next mutating call fails.
    fail_next: BTreeSet<Uuid>,
    mutations: u64,

    /// Mutating calls issued but not yet applied, per instance.
    pending: HashMap<Uuid, usize>,
}

impl SimState {
    fn latency_for(&self, host: &str) -> Duration {
        self.host_latency.get(host).copied().unwrap_or(self.latency)
    }

    fn job_finished(&mut self, instance: Uuid) {
        if let Some(n) = self.pending.get_mut(&instance) {
            *n -= 1;
            if *n == 0 {
                self.pending.remove(&instance);
            }
        }
    }
}

#[derive(Clone)]
pub struct SimHypervisor {
    state: Arc<Mutex<SimState>>,
    log: Logger,
}

impl SimHypervisor {
    pub fn new(latency: Duration, log: Logger) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                latency,
                ..Default::default()
            })),
            log,
        }
    }

    /// Makes every call against instances on `host` fail.
    pub fn fail_host(&self, host: impl Into<String>) {
        self.state.lock().unwrap().failing_hosts.insert(host.into());
    }

    /// Makes the next mutating call against `instance` fail.
    pub fn fail_next(&self, instance: Uuid) {
        self.state.lock().unwrap().fail_next.insert(instance);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    /// Overrides the call latency for instances on one host.
    pub fn set_host_latency(&self, host: impl Into<String>, latency: Duration) {
        self.state.lock().unwrap().host_latency.insert(host.into(), latency);
    }

    /// The chain the simulated hypervisor holds for `instance`.
    pub fn chain(&self, instance: Uuid) -> Vec<SnapshotId> {
        self.state
            .lock()
            .unwrap()
            .chains
            .get(&instance)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of mutating calls that took effect.
    pub fn mutations(&self) -> u64 {
        self.state.lock().unwrap().mutations
    }

    /// Runs `effect` against the simulated state after the host's latency
    /// elapses. The effect is applied even if the returned future is dropped.
    async fn run<T, F>(
        &self,
        op: &'static str,
        instance: &InstanceHandle,
        mutating: bool,
        effect: F,
    ) -> Result<T, HypervisorError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SimState) -> Result<T, String> + Send + 'static,
    {
        let latency = {
            let mut state = self.state.lock().unwrap();
            if mutating {
                *state.pending.entry(instance.id).or_default() += 1;
            }
            state.latency_for(&instance.host)
        };
        let state = self.state.clone();
        let handle = instance.clone();
        let log = self.log.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let mut state = state.lock().unwrap();
            if mutating {
                state.job_finished(handle.id);
            }
            if state.failing_hosts.contains(&handle.host) {
                return Err(HypervisorError::Unreachable(handle.host));
            }
            if mutating && state.fail_next.remove(&handle.id) {
                return Err(HypervisorError::OperationFailed {
                    op,
                    instance: handle.id,
                    message: "injected failure".to_string(),
                });
            }
            let out = effect(&mut state).map_err(|message| {
                HypervisorError::OperationFailed {
                    op,
                    instance: handle.id,
                    message,
                }
            })?;
            if mutating {
                state.mutations += 1;
            }
            debug!(log, "simulated hypervisor call completed";
                   "op" => op,
                   "instance" => %handle.id);
            Ok(out)
        });

        task.await.map_err(|e| HypervisorError::OperationFailed {
            op,
            instance: instance.id,
            message: format!("simulation task failed: {e}"),
        })?
    }
}

#[async_trait]
impl HypervisorGateway for SimHypervisor {
    async fn take_snapshot(
        &self,
        instance: &InstanceHandle,
    ) -> Result<SnapshotId, HypervisorError> {
        let id = instance.id;
        self.run("take_snapshot", instance, true, move |state| {
            state.next_snapshot += 1;
            let snapshot =
                SnapshotId::new(format!("{id}-snap-{}", state.next_snapshot));
            state.chains.entry(id).or_default().push(snapshot.clone());
            Ok(snapshot)
        })
        .await
    }

    async fn commit_chain(
        &self,
        instance: &InstanceHandle,
    ) -> Result<(), HypervisorError> {
        let id = instance.id;
        self.run("commit_chain", instance, true, move |state| {
            match state.chains.get_mut(&id) {
                Some(chain) if !chain.is_empty() => {
                    chain.clear();
                    Ok(())
                }
                _ => Err("no overlays to commit".to_string()),
            }
        })
        .await
    }

    async fn revert_to(
        &self,
        instance: &InstanceHandle,
        snapshot: &SnapshotId,
        use_root: bool,
    ) -> Result<(), HypervisorError> {
        let id = instance.id;
        let snapshot = snapshot.clone();
        self.run("revert_to", instance, true, move |state| {
            let chain = state.chains.entry(id).or_default();
            let pos = chain
                .iter()
                .position(|s| *s == snapshot)
                .ok_or_else(|| format!("no overlay named {snapshot}"))?;
            if use_root {
                chain.truncate(pos);
            } else {
                chain.truncate(pos + 1);
            }
            Ok(())
        })
        .await
    }

    async fn describe_chain(
        &self,
        instance: &InstanceHandle,
    ) -> Result<ChainDescription, HypervisorError> {
        let id = instance.id;
        self.run("describe_chain", instance, false, move |state| {
            Ok(ChainDescription {
                chain: state.chains.get(&id).cloned().unwrap_or_default(),
                busy: state.pending.contains_key(&id),
            })
        })
        .await
    }
}
