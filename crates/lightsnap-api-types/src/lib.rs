// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for types exposed by the lightsnap-server API

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An opaque identifier the hypervisor assigns to one external snapshot
/// (overlay) in an instance's disk chain.
#[derive(
    Clone,
    Debug,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SnapshotId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SnapshotId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The light-snapshot lifecycle state of a single instance.
///
/// `Idle` and `Snapshotted` are the settled states; every other state means a
/// transition is (or was, if the controller was interrupted) in flight.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    PartialEq,
    Eq,
    Serialize,
    JsonSchema,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Idle,
    SnapshotPending,
    Snapshotted,
    CommitStarting,
    Committing,
    RecoverStarting,
    Recovering,
    Disabling,
    Enabling,
}

impl LifecycleState {
    /// Returns `true` if no transition is in flight in this state.
    pub fn is_settled(&self) -> bool {
        matches!(self, LifecycleState::Idle | LifecycleState::Snapshotted)
    }

    /// The settled state that corresponds to a chain of the given length.
    pub fn settled_for_chain_len(len: usize) -> Self {
        if len == 0 {
            LifecycleState::Idle
        } else {
            LifecycleState::Snapshotted
        }
    }
}

#[derive(Clone, Deserialize, Serialize, JsonSchema)]
pub struct InstancePathParams {
    pub instance_id: Uuid,
}

#[derive(Clone, Deserialize, Serialize, JsonSchema)]
pub struct BatchPathParams {
    pub batch_id: Uuid,
}

#[derive(Clone, Deserialize, Serialize, JsonSchema)]
pub struct HostPathParams {
    pub host: String,
}

/// Turns the daily snapshot flag on or off.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema)]
pub struct DailySnapshotRequest {
    pub enable: bool,
}

/// Reverts an instance's disk to a point in its snapshot chain.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema)]
pub struct RecoverRequest {
    /// Zero-based position in the chain to recover to. Every snapshot after
    /// this one is discarded.
    pub snap_index: usize,

    /// Revert all the way to the base disk beneath the first snapshot.
    /// `snap_index` is ignored when this is set.
    #[serde(default)]
    pub use_root: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema)]
pub struct SnapshotAllRequest {
    /// Only snapshot instances that also opted in to daily snapshots.
    pub daily: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema)]
pub struct SnapshotAllResponse {
    pub batch_id: Uuid,
}

/// The light-snapshot bookkeeping for one instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize, JsonSchema)]
pub struct InstanceSnapshotStatus {
    pub instance_id: Uuid,
    pub host: String,
    pub enabled: bool,
    pub daily: bool,
    pub state: LifecycleState,
    pub chain: Vec<SnapshotId>,

    /// A previous hypervisor call timed out or was cancelled, and its outcome
    /// will be reconciled before the next transition.
    pub unconfirmed: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct TakeSnapshotResponse {
    pub snapshot_id: SnapshotId,
    pub status: InstanceSnapshotStatus,
}

#[derive(
    Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize, JsonSchema,
)]
pub enum ToggleOutcome {
    Enabled,
    AlreadyEnabled,
    Disabled,
    AlreadyDisabled,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct FeatureToggleResponse {
    pub outcome: ToggleOutcome,
    pub status: InstanceSnapshotStatus,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize, JsonSchema)]
pub struct EnabledInstance {
    pub instance_id: Uuid,
    pub host: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct EnabledInstancesResponse {
    pub instances: Vec<EnabledInstance>,
}

/// Why a single instance in a fleet batch was not snapshotted.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize, JsonSchema)]
pub struct InstanceFailure {
    pub instance_id: Uuid,
    pub code: ErrorCode,
    pub message: String,

    /// Whether the next batch may succeed for this instance without anyone
    /// intervening.
    pub retryable: bool,
}

/// Outcome counts for one host in a fleet batch.
#[derive(
    Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize, JsonSchema,
)]
pub struct HostBatchReport {
    /// Every instance on this host has been attempted.
    pub finished: bool,
    pub succeeded: u32,
    pub failed: u32,

    /// Instances left alone because a daily batch was requested and they did
    /// not opt in to daily snapshots.
    pub skipped: u32,

    /// Set if the host's instances could not be enumerated at all.
    pub listing_error: Option<String>,
    pub failures: Vec<InstanceFailure>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct BatchReport {
    pub batch_id: Uuid,
    pub daily: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub hosts: BTreeMap<String, HostBatchReport>,
}

impl BatchReport {
    pub fn new(batch_id: Uuid, daily: bool) -> Self {
        Self {
            batch_id,
            daily,
            started_at: Utc::now(),
            finished_at: None,
            hosts: BTreeMap::new(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Returns (succeeded, failed) summed over all hosts.
    pub fn totals(&self) -> (u32, u32) {
        self.hosts.values().fold((0, 0), |(ok, err), host| {
            (ok + host.succeeded, err + host.failed)
        })
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct BatchListResponse {
    pub batches: Vec<BatchReport>,
}

/// Error codes used to populate the `error_code` field of Dropshot API
/// responses. Each one is an outcome category of a lifecycle operation.
#[derive(
    Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize, JsonSchema,
)]
pub enum ErrorCode {
    /// The instance has not opted in to light snapshots.
    NotEligible,
    /// Another operation is in flight on the instance, or its current state
    /// does not allow the requested one.
    Conflict,
    /// The hypervisor or the chain store failed. Retrying may succeed.
    RemoteFailure,
    /// The instance is not known to the fleet.
    NotFound,
    /// The request itself is malformed for this instance.
    Invalid,
}

impl ErrorCode {
    /// Whether a caller may reasonably retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::Conflict | ErrorCode::RemoteFailure)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = &'static str;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            s if s.eq_ignore_ascii_case("NotEligible") => Ok(Self::NotEligible),
            s if s.eq_ignore_ascii_case("Conflict") => Ok(Self::Conflict),
            s if s.eq_ignore_ascii_case("RemoteFailure") => {
                Ok(Self::RemoteFailure)
            }
            s if s.eq_ignore_ascii_case("NotFound") => Ok(Self::NotFound),
            s if s.eq_ignore_ascii_case("Invalid") => Ok(Self::Invalid),
            _ => Err("unknown error code, expected one of: \
                'NotEligible', 'Conflict', 'RemoteFailure', 'NotFound', \
                'Invalid'"),
        }
    }
}
