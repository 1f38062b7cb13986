// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fleet-wide view: which compute hosts exist and which instances run on
//! them, plus the scheduler that snapshots the whole fleet in one batch.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::hypervisor::InstanceHandle;

mod batch;
mod scheduler;

pub use batch::BatchRegistry;
pub use scheduler::{FleetScheduler, FleetSettings};

#[derive(Clone, Debug, Error)]
pub enum DirectoryError {
    #[error("Host {0} is not part of the fleet")]
    UnknownHost(String),

    #[error("Fleet directory unavailable: {0}")]
    Unavailable(String),
}

/// Enumerates the fleet's hosts and the instances placed on them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FleetDirectory: Send + Sync {
    async fn list_hosts(&self) -> Result<Vec<String>, DirectoryError>;

    async fn list_instances(
        &self,
        host: &str,
    ) -> Result<Vec<InstanceHandle>, DirectoryError>;

    /// Looks up a single instance. `Ok(None)` means the fleet has no such
    /// instance.
    async fn find_instance(
        &self,
        id: Uuid,
    ) -> Result<Option<InstanceHandle>, DirectoryError>;
}

/// A fleet directory with a fixed set of hosts, populated from configuration.
#[derive(Debug, Default)]
pub struct StaticFleet {
    hosts: BTreeMap<String, Vec<Uuid>>,
}

impl StaticFleet {
    pub fn new<I, H>(hosts: I) -> Self
    where
        I: IntoIterator<Item = (H, Vec<Uuid>)>,
        H: Into<String>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|(h, ids)| (h.into(), ids))
                .collect(),
        }
    }
}

#[async_trait]
impl FleetDirectory for StaticFleet {
    async fn list_hosts(&self) -> Result<Vec<String>, DirectoryError> {
        Ok(self.hosts.keys().cloned().collect())
    }

    async fn list_instances(
        &self,
        host: &str,
    ) -> Result<Vec<InstanceHandle>, DirectoryError> {
        let ids = self
            .hosts
            .get(host)
            .ok_or_else(|| DirectoryError::UnknownHost(host.to_string()))?;
        Ok(ids
            .iter()
            .map(|id| InstanceHandle { id: *id, host: host.to_string() })
            .collect())
    }

    async fn find_instance(
        &self,
        id: Uuid,
    ) -> Result<Option<InstanceHandle>, DirectoryError> {
        Ok(self.hosts.iter().find_map(|(host, ids)| {
            ids.contains(&id)
                .then(|| InstanceHandle { id, host: host.clone() })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_fleet_lookups() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let fleet = StaticFleet::new([("h1", vec![a]), ("h2", vec![b])]);

        assert_eq!(fleet.list_hosts().await.unwrap(), vec!["h1", "h2"]);
        assert_eq!(
            fleet.find_instance(b).await.unwrap(),
            Some(InstanceHandle { id: b, host: "h2".to_string() })
        );
        assert!(fleet.find_instance(Uuid::new_v4()).await.unwrap().is_none());
        assert!(matches!(
            fleet.list_instances("h3").await,
            Err(DirectoryError::UnknownHost(_))
        ));
        assert_eq!(
            fleet.list_instances("h1").await.unwrap(),
            vec![InstanceHandle { id: a, host: "h1".to_string() }]
        );
    }
}
