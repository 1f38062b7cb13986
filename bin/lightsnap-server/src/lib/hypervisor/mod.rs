// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary to the hypervisor that owns instances' disk chains.
//!
//! Every call here is a remote operation with unpredictable latency that can
//! fail on its own. Callers bound each call with a deadline and a cancellation
//! token; dropping a call's future abandons the wait but not necessarily the
//! work on the hypervisor side.

use async_trait::async_trait;
use lightsnap_api_types::SnapshotId;
use thiserror::Error;
use uuid::Uuid;

pub mod sim;

/// Everything the hypervisor needs to find an instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    pub id: Uuid,

    /// The compute host the instance runs on.
    pub host: String,
}

/// The hypervisor's own view of an instance's overlay chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainDescription {
    /// Overlays, oldest first.
    pub chain: Vec<SnapshotId>,

    /// A disk job (snapshot, commit or revert) is still running for the
    /// instance, so `chain` is about to change.
    pub busy: bool,
}

#[derive(Clone, Debug, Error)]
pub enum HypervisorError {
    #[error("{op} failed on instance {instance}: {message}")]
    OperationFailed { op: &'static str, instance: Uuid, message: String },

    #[error("Host {0} is unreachable")]
    Unreachable(String),
}

/// Disk-chain operations the hypervisor performs on a running instance.
///
/// These functions are abstracted into a trait so that the lifecycle can be
/// exercised against a simulated or mocked hypervisor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HypervisorGateway: Send + Sync {
    /// Takes an external (copy-on-write overlay) snapshot of the instance's
    /// disk and returns the new overlay's ID.
    async fn take_snapshot(
        &self,
        instance: &InstanceHandle,
    ) -> Result<SnapshotId, HypervisorError>;

    /// Collapses the whole overlay chain into the base disk.
    async fn commit_chain(
        &self,
        instance: &InstanceHandle,
    ) -> Result<(), HypervisorError>;

    /// Reverts the disk to `snapshot`, discarding every later overlay. With
    /// `use_root`, reverts to the base disk underneath `snapshot` instead.
    async fn revert_to(
        &self,
        instance: &InstanceHandle,
        snapshot: &SnapshotId,
        use_root: bool,
    ) -> Result<(), HypervisorError>;

    /// Reports the overlay chain the hypervisor currently has for the
    /// instance and whether a disk job is still pending. Has no side effects.
    async fn describe_chain(
        &self,
        instance: &InstanceHandle,
    ) -> Result<ChainDescription, HypervisorError>;
}
