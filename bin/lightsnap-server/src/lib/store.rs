// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Durable per-instance light-snapshot records.
//!
//! The controller only needs load and compare-and-swap semantics from the
//! store. Each stored record carries a generation number; a write names the
//! generation it expects to replace and fails with [`StoreError::Stale`] if
//! some other writer got there first. The store may live in another process
//! and fail independently of the controller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use lightsnap_api_types::LifecycleState;
use thiserror::Error;
use uuid::Uuid;

use crate::chain::ChainIndex;

/// The persisted light-snapshot fields of one instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainRecord {
    /// Whether the instance has opted in to light snapshots.
    pub enabled: bool,

    /// Whether daily fleet batches should include the instance.
    pub daily: bool,

    pub state: LifecycleState,
    pub chain: ChainIndex,

    /// A hypervisor mutation timed out or was cancelled, so `chain` may not
    /// match the hypervisor's actual chain.
    pub unconfirmed: bool,
}

impl ChainRecord {
    /// Whether the record must be reconciled against the hypervisor before
    /// another transition may run.
    pub fn needs_reconciliation(&self) -> bool {
        self.unconfirmed || !self.state.is_settled()
    }
}

/// A record together with the generation that identifies this version of it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredRecord {
    pub generation: u64,
    pub record: ChainRecord,
}

#[derive(Clone, Debug, Error)]
pub enum StoreError {
    #[error(
        "Record for instance {instance} is at generation {actual:?}, \
        not {expected:?}"
    )]
    Stale { instance: Uuid, expected: Option<u64>, actual: Option<u64> },

    #[error("Chain store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Fetches the current record for `instance`, if one has ever been
    /// written.
    async fn load(
        &self,
        instance: Uuid,
    ) -> Result<Option<StoredRecord>, StoreError>;

    /// Replaces the record for `instance` if its current generation is
    /// `expected` (`None` meaning "no record exists"). Returns the new
    /// generation.
    async fn compare_and_swap(
        &self,
        instance: Uuid,
        expected: Option<u64>,
        record: ChainRecord,
    ) -> Result<u64, StoreError>;

    /// Deletes the record for `instance`. Deleting a missing record succeeds.
    async fn remove(&self, instance: Uuid) -> Result<(), StoreError>;
}

/// A chain store that keeps its records in process memory.
#[derive(Debug, Default)]
pub struct InMemoryChainStore {
    records: Mutex<HashMap<Uuid, StoredRecord>>,

    /// Number of upcoming calls that should fail as if the store were down.
    injected_failures: AtomicU32,
}

impl InMemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` store calls fail with
    /// [`StoreError::Unavailable`].
    pub fn inject_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    fn check_injected(&self) -> Result<(), StoreError> {
        let injected = self.injected_failures.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        match injected {
            Ok(_) => Err(StoreError::Unavailable(
                "injected store failure".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ChainStore for InMemoryChainStore {
    async fn load(
        &self,
        instance: Uuid,
    ) -> Result<Option<StoredRecord>, StoreError> {
        self.check_injected()?;
        Ok(self.records.lock().unwrap().get(&instance).cloned())
    }

    async fn compare_and_swap(
        &self,
        instance: Uuid,
        expected: Option<u64>,
        record: ChainRecord,
    ) -> Result<u64, StoreError> {
        self.check_injected()?;
        let mut records = self.records.lock().unwrap();
        let actual = records.get(&instance).map(|r| r.generation);
        if actual != expected {
            return Err(StoreError::Stale { instance, expected, actual });
        }

        let generation = actual.map_or(1, |g| g + 1);
        records.insert(instance, StoredRecord { generation, record });
        Ok(generation)
    }

    async fn remove(&self, instance: Uuid) -> Result<(), StoreError> {
        self.check_injected()?;
        self.records.lock().unwrap().remove(&instance);
        Ok(())
    }
}
