// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-instance light-snapshot lifecycle.
//!
//! [`InstanceLifecycle`] runs the operations the API exposes (enable,
//! disable, snapshot, commit, recover) against one instance at a time. Each
//! operation:
//!
//! 1. Takes the instance's lock. If another operation holds it, the caller
//!    gets a conflict immediately; requests are never queued.
//! 2. Loads the instance's chain record and, if a previous operation was
//!    interrupted, reconciles it against the chain the hypervisor actually
//!    has.
//! 3. Consults the transition table to decide whether the event may run.
//! 4. Records the in-flight state, issues the hypervisor call under the
//!    caller's deadline and cancellation token, and then either commits the
//!    chain change or rolls the record back to where it started.
//!
//! The lock is held until the record has been settled, so the remote call,
//! the chain update and the state change look atomic to every other caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use lightsnap_api_types::{
    InstanceSnapshotStatus, LifecycleState, SnapshotId, ToggleOutcome,
};
use slog::{error, info, o, warn, Logger};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chain::{ChainTracker, RetryPolicy};
use crate::error::LifecycleError;
use crate::fleet::FleetDirectory;
use crate::hypervisor::{
    ChainDescription, HypervisorError, HypervisorGateway, InstanceHandle,
};
use crate::store::{ChainRecord, ChainStore};

mod locks;
pub mod transitions;

use locks::{InstanceGuard, InstanceLocks};
use transitions::{disposition, Disposition, LifecycleEvent, Transition};

/// Caller-supplied bounds on a single operation's hypervisor calls.
#[derive(Clone, Debug, Default)]
pub struct OpContext {
    /// Deadline for each hypervisor call. `None` uses the server default.
    pub timeout: Option<Duration>,

    /// Cancelling this token abandons the pending hypervisor call.
    pub cancel: CancellationToken,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout), ..Default::default() }
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self { cancel, ..Default::default() }
    }
}

#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    /// Default deadline for hypervisor calls.
    pub hypervisor_timeout: Duration,

    /// Retry policy for chain-store operations and hypervisor queries.
    pub retry: RetryPolicy,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            hypervisor_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// An instance whose lock the current operation holds.
struct Locked {
    _guard: InstanceGuard,
    handle: InstanceHandle,
    record: Option<ChainRecord>,
    log: Logger,
}

impl Locked {
    fn id(&self) -> Uuid {
        self.handle.id
    }

    fn state(&self) -> LifecycleState {
        self.record.as_ref().map_or(LifecycleState::Idle, |r| r.state)
    }

    fn status(&self) -> InstanceSnapshotStatus {
        status_of(&self.handle, self.record.as_ref())
    }
}

fn status_of(
    handle: &InstanceHandle,
    record: Option<&ChainRecord>,
) -> InstanceSnapshotStatus {
    let record = record.cloned().unwrap_or_default();
    InstanceSnapshotStatus {
        instance_id: handle.id,
        host: handle.host.clone(),
        enabled: record.enabled,
        daily: record.daily,
        state: record.state,
        chain: record.chain.as_slice().to_vec(),
        unconfirmed: record.unconfirmed,
    }
}

pub struct InstanceLifecycle {
    tracker: ChainTracker,
    gateway: Arc<dyn HypervisorGateway>,
    directory: Arc<dyn FleetDirectory>,
    locks: InstanceLocks,
    settings: LifecycleSettings,
    log: Logger,
}

impl InstanceLifecycle {
    pub fn new(
        store: Arc<dyn ChainStore>,
        gateway: Arc<dyn HypervisorGateway>,
        directory: Arc<dyn FleetDirectory>,
        settings: LifecycleSettings,
        log: Logger,
    ) -> Self {
        let tracker = ChainTracker::new(
            store,
            settings.retry.clone(),
            log.new(o!("component" => "chain_tracker")),
        );
        let locks = InstanceLocks::new(log.new(o!("component" => "locks")));
        Self { tracker, gateway, directory, locks, settings, log }
    }

    /// Opts `instance` in to light snapshots.
    pub async fn enable(
        &self,
        ctx: &OpContext,
        instance: Uuid,
    ) -> Result<(ToggleOutcome, InstanceSnapshotStatus), LifecycleError> {
        let event = LifecycleEvent::Enable;
        let mut locked = self.begin(instance).await?;
        self.reconcile_if_needed(ctx, &mut locked).await?;

        let Some(transition) = self.admit(&locked, event)? else {
            return Ok((ToggleOutcome::AlreadyEnabled, locked.status()));
        };
        self.enter(&locked, transition).await?;
        let stored = match self.tracker.set_enabled(instance, true).await {
            Ok(stored) => stored,
            Err(e) => return Err(self.abort(&locked, e).await),
        };

        info!(locked.log, "light snapshots enabled");
        Ok((
            ToggleOutcome::Enabled,
            status_of(&locked.handle, Some(&stored.record)),
        ))
    }

    /// Opts `instance` out of light snapshots. Refused while the instance
    /// still has a chain.
    pub async fn disable(
        &self,
        ctx: &OpContext,
        instance: Uuid,
    ) -> Result<(ToggleOutcome, InstanceSnapshotStatus), LifecycleError> {
        let event = LifecycleEvent::Disable;
        let mut locked = self.begin(instance).await?;
        self.reconcile_if_needed(ctx, &mut locked).await?;

        let Some(transition) = self.admit(&locked, event)? else {
            return Ok((ToggleOutcome::AlreadyDisabled, locked.status()));
        };
        self.enter(&locked, transition).await?;
        let stored = match self.tracker.set_enabled(instance, false).await {
            Ok(stored) => stored,
            Err(e) => return Err(self.abort(&locked, e).await),
        };

        info!(locked.log, "light snapshots disabled");
        Ok((
            ToggleOutcome::Disabled,
            status_of(&locked.handle, Some(&stored.record)),
        ))
    }

    /// Sets whether daily fleet batches include `instance`. The flag may be
    /// set whether or not light snapshots are enabled; it only has an effect
    /// while they are.
    pub async fn set_daily(
        &self,
        instance: Uuid,
        daily: bool,
    ) -> Result<InstanceSnapshotStatus, LifecycleError> {
        let locked = self.begin(instance).await?;
        let stored = self.tracker.set_daily(instance, daily).await?;
        info!(locked.log, "daily snapshot flag updated"; "daily" => daily);
        Ok(status_of(&locked.handle, Some(&stored.record)))
    }

    /// Takes a snapshot of `instance` and appends it to the chain.
    pub async fn take_snapshot(
        &self,
        ctx: &OpContext,
        instance: Uuid,
    ) -> Result<(SnapshotId, InstanceSnapshotStatus), LifecycleError> {
        let event = LifecycleEvent::TakeSnapshot;
        let mut locked = self.begin(instance).await?;
        self.reconcile_if_needed(ctx, &mut locked).await?;
        let transition = self.require(&locked, event)?;

        self.enter(&locked, transition).await?;
        let snapshot = match self
            .call_remote(
                ctx,
                "take_snapshot",
                self.gateway.take_snapshot(&locked.handle),
            )
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => return Err(self.abort(&locked, e).await),
        };

        // The snapshot exists now. If recording it fails the record is left
        // in flight and the next operation reconciles it.
        let stored =
            self.tracker.append(instance, snapshot.clone()).await.map_err(
                |e| {
                    error!(locked.log, "failed to record snapshot";
                           "snapshot" => %snapshot,
                           "error" => %e);
                    e
                },
            )?;

        info!(locked.log, "snapshot taken";
              "snapshot" => %snapshot,
              "chain_len" => stored.record.chain.len());
        Ok((snapshot, status_of(&locked.handle, Some(&stored.record))))
    }

    /// Collapses the chain into the base disk.
    pub async fn commit(
        &self,
        ctx: &OpContext,
        instance: Uuid,
    ) -> Result<InstanceSnapshotStatus, LifecycleError> {
        let event = LifecycleEvent::Commit;
        let mut locked = self.begin(instance).await?;
        self.reconcile_if_needed(ctx, &mut locked).await?;
        let transition = self.require(&locked, event)?;

        self.enter(&locked, transition).await?;
        if let Err(e) = self
            .call_remote(
                ctx,
                "commit_chain",
                self.gateway.commit_chain(&locked.handle),
            )
            .await
        {
            return Err(self.abort(&locked, e).await);
        }

        let stored = self.tracker.clear(instance).await.map_err(|e| {
            error!(locked.log, "failed to record commit"; "error" => %e);
            e
        })?;

        info!(locked.log, "snapshot chain committed");
        Ok(status_of(&locked.handle, Some(&stored.record)))
    }

    /// Reverts the instance's disk to snapshot `snap_index` of its chain,
    /// discarding every later snapshot. With `use_root`, reverts to the base
    /// disk underneath the whole chain instead.
    pub async fn recover(
        &self,
        ctx: &OpContext,
        instance: Uuid,
        snap_index: usize,
        use_root: bool,
    ) -> Result<InstanceSnapshotStatus, LifecycleError> {
        let event = LifecycleEvent::Recover { snap_index, use_root };
        let mut locked = self.begin(instance).await?;
        self.reconcile_if_needed(ctx, &mut locked).await?;
        let transition = self.require(&locked, event)?;

        let chain = locked
            .record
            .as_ref()
            .map(|r| r.chain.clone())
            .unwrap_or_default();
        let target = if use_root {
            chain.first()?.clone()
        } else {
            chain.get(snap_index)?.clone()
        };

        self.enter(&locked, transition).await?;
        if let Err(e) = self
            .call_remote(
                ctx,
                "revert_to",
                self.gateway.revert_to(&locked.handle, &target, use_root),
            )
            .await
        {
            return Err(self.abort(&locked, e).await);
        }

        let recorded = if use_root {
            self.tracker.clear(instance).await
        } else {
            self.tracker.truncate_to(instance, snap_index).await
        };
        let stored = recorded.map_err(|e| {
            error!(locked.log, "failed to record recovery"; "error" => %e);
            e
        })?;

        info!(locked.log, "instance recovered";
              "target" => %target,
              "use_root" => use_root,
              "chain_len" => stored.record.chain.len());
        Ok(status_of(&locked.handle, Some(&stored.record)))
    }

    /// Reports the light-snapshot status of `instance` without taking its
    /// lock. The result may be stale by the time the caller sees it.
    pub async fn describe(
        &self,
        instance: Uuid,
    ) -> Result<InstanceSnapshotStatus, LifecycleError> {
        let handle = self.find(instance).await?;
        let record = self.tracker.load(instance).await?;
        Ok(status_of(&handle, record.as_ref().map(|s| &s.record)))
    }

    /// Loads the chain record of `instance`, if it has one.
    pub async fn record(
        &self,
        instance: Uuid,
    ) -> Result<Option<ChainRecord>, LifecycleError> {
        Ok(self.tracker.load(instance).await?.map(|s| s.record))
    }

    /// Drops everything kept about `instance`. Called when the instance is
    /// destroyed, at which point it may already be gone from the fleet
    /// directory. Refused while an operation is in flight; forgetting an
    /// unknown instance succeeds.
    pub async fn forget(&self, instance: Uuid) -> Result<(), LifecycleError> {
        let _guard = self
            .locks
            .try_acquire(instance)
            .ok_or(LifecycleError::OperationInFlight(instance))?;
        self.tracker.remove(instance).await?;
        info!(self.log, "forgot instance"; "instance" => %instance);
        Ok(())
    }

    async fn find(
        &self,
        instance: Uuid,
    ) -> Result<InstanceHandle, LifecycleError> {
        self.directory
            .find_instance(instance)
            .await?
            .ok_or(LifecycleError::NotFound(instance))
    }

    /// Takes the instance's lock and loads its record.
    async fn begin(&self, instance: Uuid) -> Result<Locked, LifecycleError> {
        let guard = self
            .locks
            .try_acquire(instance)
            .ok_or(LifecycleError::OperationInFlight(instance))?;
        let handle = self.find(instance).await?;
        let log = self.log.new(o!(
            "instance" => instance.to_string(),
            "host" => handle.host.clone()
        ));
        let record = self.tracker.load(instance).await?.map(|s| s.record);
        Ok(Locked { _guard: guard, handle, record, log })
    }

    /// Brings a record left behind by an interrupted operation back in line
    /// with the hypervisor.
    ///
    /// Holding the lock means no operation is in flight, so a record that is
    /// unsettled, or flagged because a hypervisor call was abandoned, may not
    /// match the hypervisor's chain. Ask the hypervisor for its chain and
    /// adopt it. If the abandoned job is still running there, the chain is
    /// about to change: leave the record flagged and refuse the operation.
    async fn reconcile_if_needed(
        &self,
        ctx: &OpContext,
        locked: &mut Locked,
    ) -> Result<(), LifecycleError> {
        let Some(record) = &locked.record else {
            return Ok(());
        };
        if !record.needs_reconciliation() {
            return Ok(());
        }

        warn!(locked.log, "reconciling chain record with hypervisor";
              "state" => %record.state,
              "unconfirmed" => record.unconfirmed,
              "chain_len" => record.chain.len());

        let actual = self.describe_chain(ctx, locked).await?;
        if actual.busy {
            warn!(locked.log, "hypervisor job still pending, not reconciling";
                  "hypervisor_chain_len" => actual.chain.len());
            return Err(LifecycleError::HypervisorBusy(locked.id()));
        }
        let stored = self.tracker.adopt(locked.id(), actual.chain).await?;
        info!(locked.log, "chain record reconciled";
              "state" => %stored.record.state,
              "chain_len" => stored.record.chain.len());
        locked.record = Some(stored.record);
        Ok(())
    }

    /// Queries the hypervisor's chain, retrying while it is unreachable.
    async fn describe_chain(
        &self,
        ctx: &OpContext,
        locked: &Locked,
    ) -> Result<ChainDescription, LifecycleError> {
        let mut backoff = self.settings.retry.backoff();
        let mut attempt = 1;
        loop {
            match self
                .call_remote(
                    ctx,
                    "describe_chain",
                    self.gateway.describe_chain(&locked.handle),
                )
                .await
            {
                Err(LifecycleError::Hypervisor(e))
                    if attempt < self.settings.retry.attempts =>
                {
                    warn!(locked.log, "describe_chain failed, retrying";
                          "attempt" => attempt,
                          "error" => %e);
                    attempt += 1;
                    if let Some(wait) = backoff.next_backoff() {
                        tokio::time::sleep(wait).await;
                    }
                }
                res => return res,
            }
        }
    }

    fn admit(
        &self,
        locked: &Locked,
        event: LifecycleEvent,
    ) -> Result<Option<Transition>, LifecycleError> {
        match disposition(locked.record.as_ref(), &event) {
            Disposition::Proceed(transition) => Ok(Some(transition)),
            Disposition::Ignore => Ok(None),
            Disposition::Deny(reason) => {
                let err = reason.into_error(locked.id(), event);
                info!(locked.log, "request denied";
                      "event" => %event,
                      "reason" => %err);
                Err(err)
            }
        }
    }

    /// Like `admit`, for events the table never ignores.
    fn require(
        &self,
        locked: &Locked,
        event: LifecycleEvent,
    ) -> Result<Transition, LifecycleError> {
        self.admit(locked, event)?.ok_or(LifecycleError::InvalidState {
            event,
            state: locked.state(),
        })
    }

    /// Records the in-flight states of an admitted transition.
    async fn enter(
        &self,
        locked: &Locked,
        transition: Transition,
    ) -> Result<(), LifecycleError> {
        self.tracker.set_state(locked.id(), transition.starting).await?;
        if transition.in_flight != transition.starting {
            if let Err(e) =
                self.tracker.set_state(locked.id(), transition.in_flight).await
            {
                return Err(self.abort(locked, e).await);
            }
        }
        Ok(())
    }

    /// Rolls the record back to its pre-transition state after `err` and
    /// hands `err` back. If the hypervisor may have acted anyway, the record
    /// is flagged for reconciliation.
    async fn abort(
        &self,
        locked: &Locked,
        err: LifecycleError,
    ) -> LifecycleError {
        let unconfirmed = err.outcome_unknown();
        warn!(locked.log, "transition failed, rolling back";
              "error" => %err,
              "unconfirmed" => unconfirmed);
        if let Err(e) = self
            .tracker
            .roll_back(locked.id(), locked.state(), unconfirmed)
            .await
        {
            // Left unsettled; the next operation reconciles it.
            error!(locked.log, "failed to roll back chain record";
                   "error" => %e);
        }
        err
    }

    /// Runs a hypervisor call bounded by the caller's deadline and
    /// cancellation token. Abandoning the call does not stop the hypervisor.
    async fn call_remote<T, F>(
        &self,
        ctx: &OpContext,
        op: &'static str,
        call: F,
    ) -> Result<T, LifecycleError>
    where
        F: Future<Output = Result<T, HypervisorError>>,
    {
        let after = ctx.timeout.unwrap_or(self.settings.hypervisor_timeout);
        tokio::select! {
            res = call => res.map_err(LifecycleError::from),
            _ = tokio::time::sleep(after) => {
                Err(LifecycleError::TimedOut { op, after })
            }
            _ = ctx.cancel.cancelled() => Err(LifecycleError::Cancelled { op }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainError;
    use crate::fleet::StaticFleet;
    use crate::hypervisor::sim::SimHypervisor;
    use crate::hypervisor::MockHypervisorGateway;
    use crate::store::InMemoryChainStore;
    use lightsnap_api_types::ErrorCode;

    const HOST: &str = "compute-01";

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn settings() -> LifecycleSettings {
        LifecycleSettings {
            hypervisor_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                attempts: 3,
                initial_interval: Duration::from_millis(1),
            },
        }
    }

    fn lifecycle_with(
        gateway: Arc<dyn HypervisorGateway>,
        instance: Uuid,
    ) -> InstanceLifecycle {
        InstanceLifecycle::new(
            Arc::new(InMemoryChainStore::new()),
            gateway,
            Arc::new(StaticFleet::new([(HOST, vec![instance])])),
            settings(),
            test_logger(),
        )
    }

    fn simulated(
        latency: Duration,
    ) -> (InstanceLifecycle, SimHypervisor, Uuid) {
        let sim = SimHypervisor::new(latency, test_logger());
        let instance = Uuid::new_v4();
        let lifecycle = lifecycle_with(Arc::new(sim.clone()), instance);
        (lifecycle, sim, instance)
    }

    #[tokio::test]
    async fn example_scenario() {
        let (lc, _sim, i1) = simulated(Duration::ZERO);
        let ctx = OpContext::new();

        lc.enable(&ctx, i1).await.unwrap();

        let (s1, status) = lc.take_snapshot(&ctx, i1).await.unwrap();
        assert_eq!(status.chain, vec![s1.clone()]);
        assert_eq!(status.state, LifecycleState::Snapshotted);

        let (s2, status) = lc.take_snapshot(&ctx, i1).await.unwrap();
        assert_eq!(status.chain, vec![s1, s2]);

        let status = lc.commit(&ctx, i1).await.unwrap();
        assert!(status.chain.is_empty());
        assert_eq!(status.state, LifecycleState::Idle);

        let (outcome, _) = lc.disable(&ctx, i1).await.unwrap();
        assert_eq!(outcome, ToggleOutcome::Disabled);

        let err = lc.take_snapshot(&ctx, i1).await.unwrap_err();
        assert_eq!(err.category(), ErrorCode::NotEligible);
    }

    #[tokio::test]
    async fn toggles_are_idempotent() {
        let (lc, _sim, id) = simulated(Duration::ZERO);
        let ctx = OpContext::new();

        let (outcome, _) = lc.disable(&ctx, id).await.unwrap();
        assert_eq!(outcome, ToggleOutcome::AlreadyDisabled);

        let (outcome, status) = lc.enable(&ctx, id).await.unwrap();
        assert_eq!(outcome, ToggleOutcome::Enabled);
        assert!(status.enabled);
        assert_eq!(status.state, LifecycleState::Idle);

        let (outcome, _) = lc.enable(&ctx, id).await.unwrap();
        assert_eq!(outcome, ToggleOutcome::AlreadyEnabled);
    }

    #[tokio::test]
    async fn one_operation_in_flight_per_instance() {
        let (lc, sim, id) = simulated(Duration::from_millis(20));
        let ctx = OpContext::new();
        lc.enable(&ctx, id).await.unwrap();

        let attempts = (0..8).map(|_| lc.take_snapshot(&ctx, id));
        let results = futures::future::join_all(attempts).await;

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| {
                matches!(
                    r,
                    Err(LifecycleError::OperationInFlight(i)) if *i == id
                )
            })
            .count();
        assert_eq!(succeeded, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(sim.chain(id).len(), 1);
    }

    #[tokio::test]
    async fn other_instances_proceed_while_one_is_busy() {
        let sim = SimHypervisor::new(Duration::from_millis(10), test_logger());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let lc = InstanceLifecycle::new(
            Arc::new(InMemoryChainStore::new()),
            Arc::new(sim.clone()),
            Arc::new(StaticFleet::new([(HOST, vec![a, b])])),
            settings(),
            test_logger(),
        );
        let ctx = OpContext::new();
        lc.enable(&ctx, a).await.unwrap();
        lc.enable(&ctx, b).await.unwrap();

        let (ra, rb) =
            tokio::join!(lc.take_snapshot(&ctx, a), lc.take_snapshot(&ctx, b));
        assert!(ra.is_ok());
        assert!(rb.is_ok());
    }

    #[tokio::test]
    async fn failed_snapshots_leave_the_chain_alone() {
        let (lc, sim, id) = simulated(Duration::ZERO);
        let ctx = OpContext::new();
        lc.enable(&ctx, id).await.unwrap();

        let mut expected_len = 0;
        for round in 0..6 {
            if round % 2 == 1 {
                sim.fail_next(id);
                let err = lc.take_snapshot(&ctx, id).await.unwrap_err();
                assert_eq!(err.category(), ErrorCode::RemoteFailure);
            } else {
                lc.take_snapshot(&ctx, id).await.unwrap();
                expected_len += 1;
            }
            let status = lc.describe(id).await.unwrap();
            assert_eq!(status.chain.len(), expected_len);
            assert_eq!(status.state, LifecycleState::Snapshotted);
            assert!(!status.unconfirmed);
        }
    }

    #[tokio::test]
    async fn failed_commit_is_all_or_nothing() {
        let id = Uuid::new_v4();
        let mut gateway = MockHypervisorGateway::new();
        let mut taken = 0;
        gateway.expect_take_snapshot().times(2).returning(move |_| {
            taken += 1;
            Ok(SnapshotId::new(format!("s{taken}")))
        });
        gateway.expect_commit_chain().times(1).returning(|h| {
            Err(HypervisorError::OperationFailed {
                op: "commit_chain",
                instance: h.id,
                message: "disk busy".to_string(),
            })
        });
        let lc = lifecycle_with(Arc::new(gateway), id);
        let ctx = OpContext::new();

        lc.enable(&ctx, id).await.unwrap();
        lc.take_snapshot(&ctx, id).await.unwrap();
        lc.take_snapshot(&ctx, id).await.unwrap();
        let before = lc.describe(id).await.unwrap();

        let err = lc.commit(&ctx, id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Hypervisor(_)));
        assert_eq!(err.category(), ErrorCode::RemoteFailure);

        let after = lc.describe(id).await.unwrap();
        assert_eq!(after, before);
        assert_eq!(after.state, LifecycleState::Snapshotted);
    }

    #[tokio::test]
    async fn recover_truncates_to_inclusive_prefix() {
        let (lc, sim, id) = simulated(Duration::ZERO);
        let ctx = OpContext::new();
        lc.enable(&ctx, id).await.unwrap();

        let mut taken = Vec::new();
        for _ in 0..4 {
            taken.push(lc.take_snapshot(&ctx, id).await.unwrap().0);
        }

        let err = lc.recover(&ctx, id, 4, false).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Chain(ChainError::IndexOutOfRange {
                index: 4,
                len: 4
            })
        ));
        assert_eq!(err.category(), ErrorCode::Invalid);

        let status = lc.recover(&ctx, id, 1, false).await.unwrap();
        assert_eq!(status.chain, taken[..=1].to_vec());
        assert_eq!(status.state, LifecycleState::Snapshotted);
        assert_eq!(sim.chain(id), taken[..=1].to_vec());

        // A failed revert changes nothing.
        sim.fail_next(id);
        lc.recover(&ctx, id, 0, false).await.unwrap_err();
        assert_eq!(lc.describe(id).await.unwrap().chain, taken[..=1].to_vec());

        let status = lc.recover(&ctx, id, 0, true).await.unwrap();
        assert!(status.chain.is_empty());
        assert_eq!(status.state, LifecycleState::Idle);
        assert!(sim.chain(id).is_empty());
    }

    #[tokio::test]
    async fn disable_requires_a_drained_chain() {
        let (lc, _sim, id) = simulated(Duration::ZERO);
        let ctx = OpContext::new();
        lc.enable(&ctx, id).await.unwrap();
        lc.take_snapshot(&ctx, id).await.unwrap();
        let before = lc.describe(id).await.unwrap();

        let err = lc.disable(&ctx, id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::HasPendingChain(i) if i == id));
        assert_eq!(err.category(), ErrorCode::Conflict);
        assert_eq!(lc.describe(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn commit_and_recover_need_a_chain() {
        let (lc, _sim, id) = simulated(Duration::ZERO);
        let ctx = OpContext::new();
        lc.enable(&ctx, id).await.unwrap();

        let err = lc.commit(&ctx, id).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidState { state: LifecycleState::Idle, .. }
        ));
        let err = lc.recover(&ctx, id, 0, true).await.unwrap_err();
        assert_eq!(err.category(), ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn unknown_and_ineligible_instances() {
        let (lc, _sim, id) = simulated(Duration::ZERO);
        let ctx = OpContext::new();

        let stranger = Uuid::new_v4();
        let err = lc.take_snapshot(&ctx, stranger).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(i) if i == stranger));
        assert!(matches!(
            lc.describe(stranger).await,
            Err(LifecycleError::NotFound(_))
        ));

        let err = lc.take_snapshot(&ctx, id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotEligible(i) if i == id));
    }

    #[tokio::test]
    async fn timed_out_snapshot_is_reconciled_before_the_next_operation() {
        let (lc, sim, id) = simulated(Duration::from_millis(50));
        lc.enable(&OpContext::new(), id).await.unwrap();

        let short = OpContext::with_timeout(Duration::from_millis(5));
        let err = lc
            .take_snapshot(&short, id)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::TimedOut { .. }));
        assert_eq!(err.category(), ErrorCode::RemoteFailure);

        let status = lc.describe(id).await.unwrap();
        assert!(status.chain.is_empty());
        assert_eq!(status.state, LifecycleState::Idle);
        assert!(status.unconfirmed);

        // The abandoned snapshot lands on the hypervisor anyway.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sim.chain(id).len(), 1);

        let (latest, status) =
            lc.take_snapshot(&OpContext::new(), id).await.unwrap();
        assert_eq!(status.chain, sim.chain(id));
        assert_eq!(status.chain.len(), 2);
        assert_eq!(status.chain.last(), Some(&latest));
        assert!(!status.unconfirmed);
    }

    #[tokio::test]
    async fn reconciliation_waits_for_a_pending_hypervisor_job() {
        let (lc, sim, id) = simulated(Duration::from_millis(200));
        let ctx = OpContext::new();
        lc.enable(&ctx, id).await.unwrap();

        let short = OpContext::with_timeout(Duration::from_millis(5));
        let err = lc.take_snapshot(&short, id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::TimedOut { .. }));

        // The abandoned snapshot has not landed yet. Adopting the chain now
        // would record an empty chain that is about to grow.
        sim.set_latency(Duration::ZERO);
        let err = lc.take_snapshot(&ctx, id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::HypervisorBusy(i) if i == id));
        assert_eq!(err.category(), ErrorCode::Conflict);
        let err = lc.disable(&ctx, id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::HypervisorBusy(_)));

        let status = lc.describe(id).await.unwrap();
        assert!(status.enabled);
        assert!(status.unconfirmed);
        assert!(status.chain.is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sim.chain(id).len(), 1);

        let (latest, status) = lc.take_snapshot(&ctx, id).await.unwrap();
        assert_eq!(status.chain, sim.chain(id));
        assert_eq!(status.chain.len(), 2);
        assert_eq!(status.chain.last(), Some(&latest));
        assert!(!status.unconfirmed);
    }

    #[tokio::test]
    async fn cancelled_commit_is_reconciled() {
        let (lc, sim, id) = simulated(Duration::from_millis(30));
        let ctx = OpContext::new();
        lc.enable(&ctx, id).await.unwrap();
        lc.take_snapshot(&ctx, id).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });
        let err = lc
            .commit(&OpContext::with_cancel(cancel), id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Cancelled { op: "commit_chain" }
        ));

        let status = lc.describe(id).await.unwrap();
        assert_eq!(status.chain.len(), 1);
        assert_eq!(status.state, LifecycleState::Snapshotted);
        assert!(status.unconfirmed);

        // The commit went through after all, so once reconciled there is
        // nothing left to commit.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(sim.chain(id).is_empty());
        let err = lc.commit(&ctx, id).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidState { state: LifecycleState::Idle, .. }
        ));
        let status = lc.describe(id).await.unwrap();
        assert!(status.chain.is_empty());
        assert!(!status.unconfirmed);
    }

    #[tokio::test]
    async fn daily_flag_and_forget() {
        let (lc, _sim, id) = simulated(Duration::ZERO);
        let ctx = OpContext::new();
        lc.enable(&ctx, id).await.unwrap();

        let status = lc.set_daily(id, true).await.unwrap();
        assert!(status.daily);
        assert!(status.enabled);

        lc.take_snapshot(&ctx, id).await.unwrap();
        lc.forget(id).await.unwrap();
        assert!(lc.record(id).await.unwrap().is_none());

        // Forgetting twice is fine.
        lc.forget(id).await.unwrap();
        let status = lc.describe(id).await.unwrap();
        assert!(!status.enabled);
        assert!(status.chain.is_empty());
    }
}
