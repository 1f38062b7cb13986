// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bookkeeping for an instance's snapshot chain.
//!
//! [`ChainIndex`] is the ordered list of snapshot IDs that mirrors the
//! overlays layered on an instance's base disk. [`ChainTracker`] is the only
//! path by which chain records are written to the [`ChainStore`]: it applies a
//! change to the latest version of a record and commits it with
//! compare-and-swap, retrying (with backoff) when the store is briefly
//! unavailable or another writer raced it.
//!
//! Chain mutations are only applied after the hypervisor has confirmed the
//! corresponding operation. Every mutation is idempotent so that a write whose
//! outcome was lost can be replayed safely.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use lightsnap_api_types::{LifecycleState, SnapshotId};
use slog::{debug, warn, Logger};
use thiserror::Error;
use uuid::Uuid;

use crate::error::LifecycleError;
use crate::store::{ChainRecord, ChainStore, StoreError, StoredRecord};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("Snapshot index {index} is outside a chain of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("The snapshot chain is empty")]
    Empty,
}

/// An ordered, append-only (between commits and recoveries) list of snapshot
/// IDs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainIndex(Vec<SnapshotId>);

impl ChainIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&SnapshotId, ChainError> {
        self.0
            .get(index)
            .ok_or(ChainError::IndexOutOfRange { index, len: self.len() })
    }

    pub fn first(&self) -> Result<&SnapshotId, ChainError> {
        self.0.first().ok_or(ChainError::Empty)
    }

    pub fn as_slice(&self) -> &[SnapshotId] {
        &self.0
    }

    /// Pushes `id` onto the end of the chain. Appending the ID that is already
    /// at the end is a no-op, so a replayed append does not duplicate it.
    ///
    /// Returns `true` if the chain changed.
    pub fn append(&mut self, id: SnapshotId) -> bool {
        if self.0.last() == Some(&id) {
            return false;
        }
        self.0.push(id);
        true
    }

    /// Empties the chain.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Drops every entry after position `index`, keeping `0..=index`.
    pub fn truncate_to(&mut self, index: usize) -> Result<(), ChainError> {
        if index >= self.len() {
            return Err(ChainError::IndexOutOfRange { index, len: self.len() });
        }
        self.0.truncate(index + 1);
        Ok(())
    }
}

impl From<Vec<SnapshotId>> for ChainIndex {
    fn from(ids: Vec<SnapshotId>) -> Self {
        Self(ids)
    }
}

/// Retry policy for idempotent chain-store operations.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub initial_interval: Duration,
}

impl RetryPolicy {
    pub(crate) fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            multiplier: 2.0,
            max_interval: self.initial_interval.saturating_mul(32),
            max_elapsed_time: None,
            ..backoff::ExponentialBackoff::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 5, initial_interval: Duration::from_millis(20) }
    }
}

/// Commits chain and lifecycle-state changes to the chain store.
pub struct ChainTracker {
    store: Arc<dyn ChainStore>,
    retry: RetryPolicy,
    log: Logger,
}

impl ChainTracker {
    pub fn new(
        store: Arc<dyn ChainStore>,
        retry: RetryPolicy,
        log: Logger,
    ) -> Self {
        Self { store, retry, log }
    }

    /// Loads the record for `instance`, retrying while the store is
    /// unavailable.
    pub async fn load(
        &self,
        instance: Uuid,
    ) -> Result<Option<StoredRecord>, LifecycleError> {
        self.with_retries("load", || self.store.load(instance)).await
    }

    /// Deletes the record for `instance`, retrying while the store is
    /// unavailable.
    pub async fn remove(&self, instance: Uuid) -> Result<(), LifecycleError> {
        self.with_retries("remove", || self.store.remove(instance)).await
    }

    /// Applies `change` to the newest version of the record for `instance`
    /// and commits the result.
    ///
    /// `change` is handed the current record (or `None` if there is none) and
    /// may refuse the update by returning an error, which is passed through.
    /// If the write races with another writer or the store fails, the record
    /// is reloaded and `change` is applied again, up to the policy's attempt
    /// limit. A reload that shows the intended record already in place counts
    /// as success, since the earlier write evidently landed.
    pub async fn update<F>(
        &self,
        instance: Uuid,
        mut change: F,
    ) -> Result<StoredRecord, LifecycleError>
    where
        F: FnMut(Option<&ChainRecord>) -> Result<ChainRecord, LifecycleError>,
    {
        let mut backoff = self.retry.backoff();
        let mut intended: Option<ChainRecord> = None;
        let mut last_err = None;

        for attempt in 1..=self.retry.attempts {
            let current = self.load(instance).await?;
            if let (Some(want), Some(cur)) = (&intended, &current) {
                if &cur.record == want {
                    return Ok(cur.clone());
                }
            }

            let next = change(current.as_ref().map(|c| &c.record))?;
            let expected = current.as_ref().map(|c| c.generation);
            match self
                .store
                .compare_and_swap(instance, expected, next.clone())
                .await
            {
                Ok(generation) => {
                    return Ok(StoredRecord { generation, record: next });
                }
                Err(e) => {
                    debug!(self.log, "chain record write failed";
                           "instance" => %instance,
                           "attempt" => attempt,
                           "error" => %e);
                    intended = Some(next);
                    last_err = Some(e);
                    if let Some(wait) = backoff.next_backoff() {
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        // One last look in case the final write landed after all.
        if let (Some(want), Some(cur)) = (&intended, self.load(instance).await?)
        {
            if &cur.record == want {
                return Ok(cur);
            }
        }

        warn!(self.log, "giving up on chain record write";
              "instance" => %instance,
              "attempts" => self.retry.attempts);
        match last_err {
            Some(StoreError::Unavailable(msg)) => {
                Err(StoreError::Unavailable(msg).into())
            }
            _ => Err(LifecycleError::StaleRecord(instance)),
        }
    }

    /// Moves the record into `state` without touching the chain.
    pub async fn set_state(
        &self,
        instance: Uuid,
        state: LifecycleState,
    ) -> Result<StoredRecord, LifecycleError> {
        self.update(instance, |cur| {
            let mut rec = cur.cloned().unwrap_or_default();
            rec.state = state;
            Ok(rec)
        })
        .await
    }

    /// Turns light snapshots on or off and settles the record. Turning them
    /// off is refused while a chain remains.
    pub async fn set_enabled(
        &self,
        instance: Uuid,
        enabled: bool,
    ) -> Result<StoredRecord, LifecycleError> {
        self.update(instance, |cur| {
            let mut rec = cur.cloned().unwrap_or_default();
            if !enabled && !rec.chain.is_empty() {
                return Err(LifecycleError::HasPendingChain(instance));
            }
            rec.enabled = enabled;
            Ok(settle(rec))
        })
        .await
    }

    pub async fn set_daily(
        &self,
        instance: Uuid,
        daily: bool,
    ) -> Result<StoredRecord, LifecycleError> {
        self.update(instance, |cur| {
            let mut rec = cur.cloned().unwrap_or_default();
            rec.daily = daily;
            Ok(rec)
        })
        .await
    }

    /// Records a hypervisor-confirmed snapshot at the end of the chain.
    pub async fn append(
        &self,
        instance: Uuid,
        snapshot: SnapshotId,
    ) -> Result<StoredRecord, LifecycleError> {
        self.update(instance, |cur| {
            let mut rec =
                cur.cloned().ok_or(LifecycleError::NotEligible(instance))?;
            rec.chain.append(snapshot.clone());
            Ok(settle(rec))
        })
        .await
    }

    /// Records a hypervisor-confirmed commit, which empties the chain.
    pub async fn clear(
        &self,
        instance: Uuid,
    ) -> Result<StoredRecord, LifecycleError> {
        self.update(instance, |cur| {
            let mut rec =
                cur.cloned().ok_or(LifecycleError::NotEligible(instance))?;
            rec.chain.clear();
            Ok(settle(rec))
        })
        .await
    }

    /// Records a hypervisor-confirmed revert to position `index`.
    pub async fn truncate_to(
        &self,
        instance: Uuid,
        index: usize,
    ) -> Result<StoredRecord, LifecycleError> {
        self.update(instance, |cur| {
            let mut rec =
                cur.cloned().ok_or(LifecycleError::NotEligible(instance))?;
            rec.chain.truncate_to(index)?;
            Ok(settle(rec))
        })
        .await
    }

    /// Puts the record back into `state` after a failed transition, leaving
    /// the chain alone. If the hypervisor's outcome is unknown the record is
    /// flagged for reconciliation.
    pub async fn roll_back(
        &self,
        instance: Uuid,
        state: LifecycleState,
        unconfirmed: bool,
    ) -> Result<StoredRecord, LifecycleError> {
        self.update(instance, |cur| {
            let mut rec =
                cur.cloned().ok_or(LifecycleError::NotEligible(instance))?;
            rec.state = state;
            rec.unconfirmed |= unconfirmed;
            Ok(rec)
        })
        .await
    }

    /// Replaces the chain with the one the hypervisor reports and settles the
    /// record.
    pub async fn adopt(
        &self,
        instance: Uuid,
        actual: Vec<SnapshotId>,
    ) -> Result<StoredRecord, LifecycleError> {
        let log = &self.log;
        self.update(instance, |cur| {
            let mut rec =
                cur.cloned().ok_or(LifecycleError::NotEligible(instance))?;
            rec.chain = ChainIndex::from(actual.clone());
            if !rec.enabled && !rec.chain.is_empty() {
                // Only reachable if an interrupted disable raced a snapshot.
                // Keep the feature on so the chain can still be drained.
                warn!(log, "hypervisor reports a chain on a disabled instance";
                      "instance" => %instance,
                      "chain_len" => rec.chain.len());
                rec.enabled = true;
            }
            Ok(settle(rec))
        })
        .await
    }

    async fn with_retries<T, Op, Fut>(
        &self,
        what: &'static str,
        mut op: Op,
    ) -> Result<T, LifecycleError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max = self.retry.attempts;
        let mut attempt = 0;
        let log = &self.log;
        backoff::future::retry_notify(
            self.retry.backoff(),
            || {
                attempt += 1;
                let last = attempt >= max;
                let fut = op();
                async move {
                    fut.await.map_err(|e| match e {
                        StoreError::Unavailable(_) if !last => {
                            backoff::Error::transient(e)
                        }
                        e => backoff::Error::permanent(e),
                    })
                }
            },
            |err: StoreError, wait: Duration| {
                debug!(log, "chain store {} failed, retrying", what;
                       "error" => %err,
                       "wait" => ?wait);
            },
        )
        .await
        .map_err(LifecycleError::from)
    }
}

/// Clears any in-flight state: the record settles into `Snapshotted` if it
/// still has a chain and `Idle` otherwise.
fn settle(mut rec: ChainRecord) -> ChainRecord {
    rec.state = LifecycleState::settled_for_chain_len(rec.chain.len());
    rec.unconfirmed = false;
    rec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryChainStore;
    use proptest::prelude::*;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn ids(names: &[&str]) -> Vec<SnapshotId> {
        names.iter().map(|n| SnapshotId::from(*n)).collect()
    }

    fn tracker(store: Arc<InMemoryChainStore>) -> ChainTracker {
        ChainTracker::new(
            store,
            RetryPolicy {
                attempts: 3,
                initial_interval: Duration::from_millis(1),
            },
            test_logger(),
        )
    }

    async fn enabled_record(store: &InMemoryChainStore, id: Uuid) {
        store
            .compare_and_swap(
                id,
                None,
                ChainRecord { enabled: true, ..Default::default() },
            )
            .await
            .unwrap();
    }

    #[test]
    fn replayed_append_is_a_no_op() {
        let mut chain = ChainIndex::new();
        assert!(chain.append("s1".into()));
        assert!(chain.append("s2".into()));
        assert!(!chain.append("s2".into()));
        assert_eq!(chain.as_slice(), ids(&["s1", "s2"]).as_slice());
    }

    #[test]
    fn truncate_keeps_inclusive_prefix() {
        let mut chain = ChainIndex::from(ids(&["a", "b", "c", "d"]));
        chain.truncate_to(1).unwrap();
        assert_eq!(chain.as_slice(), ids(&["a", "b"]).as_slice());

        // Replaying the same truncation changes nothing.
        chain.truncate_to(1).unwrap();
        assert_eq!(chain.len(), 2);

        assert_eq!(
            chain.truncate_to(2),
            Err(ChainError::IndexOutOfRange { index: 2, len: 2 })
        );
        assert_eq!(ChainIndex::new().first(), Err(ChainError::Empty));
    }

    proptest! {
        #[test]
        fn appends_grow_by_exactly_one(n in 1usize..50) {
            let mut chain = ChainIndex::new();
            for i in 0..n {
                let before = chain.len();
                let id = SnapshotId::new(format!("s{i}"));
                prop_assert!(chain.append(id));
                prop_assert_eq!(chain.len(), before + 1);
            }
        }

        #[test]
        fn truncate_matches_slice_prefix(
            len in 1usize..40,
            pick in 0usize..40
        ) {
            let all: Vec<SnapshotId> =
                (0..len).map(|i| SnapshotId::new(format!("s{i}"))).collect();
            let mut chain = ChainIndex::from(all.clone());
            let res = chain.truncate_to(pick);
            if pick < len {
                prop_assert!(res.is_ok());
                prop_assert_eq!(chain.as_slice(), &all[..=pick]);
            } else {
                prop_assert!(res.is_err());
                prop_assert_eq!(chain.as_slice(), all.as_slice());
            }
        }
    }

    #[tokio::test]
    async fn append_settles_into_snapshotted() {
        let store = Arc::new(InMemoryChainStore::new());
        let id = Uuid::new_v4();
        enabled_record(&store, id).await;
        let tracker = tracker(store.clone());

        tracker.set_state(id, LifecycleState::SnapshotPending).await.unwrap();
        let stored = tracker.append(id, "s1".into()).await.unwrap();
        assert_eq!(stored.record.state, LifecycleState::Snapshotted);
        assert_eq!(stored.record.chain.as_slice(), ids(&["s1"]).as_slice());

        let stored = tracker.clear(id).await.unwrap();
        assert_eq!(stored.record.state, LifecycleState::Idle);
        assert!(stored.record.chain.is_empty());
    }

    #[tokio::test]
    async fn store_outages_are_retried() {
        let store = Arc::new(InMemoryChainStore::new());
        let id = Uuid::new_v4();
        enabled_record(&store, id).await;
        let tracker = tracker(store.clone());

        store.inject_failures(2);
        let stored = tracker.append(id, "s1".into()).await.unwrap();
        assert_eq!(stored.record.chain.len(), 1);
    }

    #[tokio::test]
    async fn persistent_outage_surfaces_as_store_error() {
        let store = Arc::new(InMemoryChainStore::new());
        let id = Uuid::new_v4();
        let tracker = tracker(store.clone());

        store.inject_failures(100);
        let err = tracker.load(id).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Store(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn racing_writer_is_absorbed() {
        let store = Arc::new(InMemoryChainStore::new());
        let id = Uuid::new_v4();
        enabled_record(&store, id).await;
        let tracker = tracker(store.clone());

        // Sneak a write in between the tracker's load and its CAS on the first
        // attempt; the second attempt applies the change on top of it.
        let mut raced = false;
        let racer = store.clone();
        let stored = tracker
            .update(id, |cur| {
                let mut rec = cur.cloned().unwrap();
                if !raced {
                    raced = true;
                    let racer = racer.clone();
                    let snapshot = rec.clone();
                    std::thread::spawn(move || {
                        let rt = tokio::runtime::Builder::new_current_thread()
                            .build()
                            .unwrap();
                        rt.block_on(async {
                            let gen = racer.load(id).await.unwrap().unwrap();
                            racer
                                .compare_and_swap(
                                    id,
                                    Some(gen.generation),
                                    ChainRecord { daily: true, ..snapshot },
                                )
                                .await
                                .unwrap();
                        });
                    })
                    .join()
                    .unwrap();
                }
                rec.chain.append("s1".into());
                Ok(rec)
            })
            .await
            .unwrap();

        assert!(stored.record.daily);
        assert_eq!(stored.record.chain.len(), 1);
        assert_eq!(stored.generation, 3);
    }

    /// Rewrites the record (unchanged) just before every compare-and-swap,
    /// so each write the tracker attempts loses the race.
    struct AlwaysRaced(InMemoryChainStore);

    #[async_trait::async_trait]
    impl ChainStore for AlwaysRaced {
        async fn load(
            &self,
            instance: Uuid,
        ) -> Result<Option<StoredRecord>, StoreError> {
            self.0.load(instance).await
        }

        async fn compare_and_swap(
            &self,
            instance: Uuid,
            expected: Option<u64>,
            record: ChainRecord,
        ) -> Result<u64, StoreError> {
            if let Some(cur) = self.0.load(instance).await? {
                let seen = Some(cur.generation);
                self.0.compare_and_swap(instance, seen, cur.record).await?;
            }
            self.0.compare_and_swap(instance, expected, record).await
        }

        async fn remove(&self, instance: Uuid) -> Result<(), StoreError> {
            self.0.remove(instance).await
        }
    }

    #[tokio::test]
    async fn exhausted_race_budget_is_a_conflict() {
        let inner = InMemoryChainStore::new();
        let id = Uuid::new_v4();
        enabled_record(&inner, id).await;
        let store = Arc::new(AlwaysRaced(inner));
        let tracker = ChainTracker::new(
            store.clone(),
            RetryPolicy {
                attempts: 3,
                initial_interval: Duration::from_millis(1),
            },
            test_logger(),
        );

        let err = tracker.append(id, "s1".into()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::StaleRecord(i) if i == id));
        assert_eq!(err.category(), lightsnap_api_types::ErrorCode::Conflict);

        let stored = store.load(id).await.unwrap().unwrap();
        assert_eq!(
            stored.record,
            ChainRecord { enabled: true, ..Default::default() }
        );
        // One racing write per attempt, none from the tracker.
        assert_eq!(stored.generation, 4);
    }

    #[test]
    fn huge_initial_interval_does_not_overflow() {
        let policy =
            RetryPolicy { attempts: 2, initial_interval: Duration::MAX };
        assert_eq!(policy.backoff().max_interval, Duration::MAX);
    }

    #[tokio::test]
    async fn adopt_replaces_chain_and_clears_marker() {
        let store = Arc::new(InMemoryChainStore::new());
        let id = Uuid::new_v4();
        store
            .compare_and_swap(
                id,
                None,
                ChainRecord {
                    enabled: true,
                    state: LifecycleState::Idle,
                    unconfirmed: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let tracker = tracker(store.clone());

        let stored = tracker.adopt(id, ids(&["s1", "s2"])).await.unwrap();
        assert_eq!(stored.record.state, LifecycleState::Snapshotted);
        assert!(!stored.record.unconfirmed);
        assert_eq!(stored.record.chain.len(), 2);
    }
}
