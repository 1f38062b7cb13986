// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The light-snapshot transition table.
//!
//! Given an instance's settled record and a requested event, decides whether
//! the event should proceed (and through which in-flight states), be ignored
//! for idempotency, or be denied. This module only decides; the lifecycle
//! driver performs the hypervisor calls and record writes.

use std::fmt;

use lightsnap_api_types::LifecycleState;
use uuid::Uuid;

use crate::chain::ChainError;
use crate::error::LifecycleError;
use crate::store::ChainRecord;

/// An event requested of one instance's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Enable,
    Disable,
    TakeSnapshot,
    Commit,
    Recover { snap_index: usize, use_root: bool },
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Enable => f.write_str("enable light snapshots"),
            LifecycleEvent::Disable => f.write_str("disable light snapshots"),
            LifecycleEvent::TakeSnapshot => f.write_str("take a snapshot"),
            LifecycleEvent::Commit => f.write_str("commit the snapshot chain"),
            LifecycleEvent::Recover { use_root: true, .. } => {
                f.write_str("recover to the root disk")
            }
            LifecycleEvent::Recover { snap_index, .. } => {
                write!(f, "recover to snapshot {snap_index}")
            }
        }
    }
}

/// The in-flight states an admitted transition passes through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Transition {
    /// Recorded as soon as the transition is admitted.
    pub starting: LifecycleState,

    /// Recorded immediately before the hypervisor call is issued. May be the
    /// same as `starting`.
    pub in_flight: LifecycleState,
}

impl Transition {
    const fn through(state: LifecycleState) -> Self {
        Self { starting: state, in_flight: state }
    }
}

/// A reason the table refuses an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DenyReason {
    NotEnabled,
    InvalidState(LifecycleState),
    PendingChain,
    Chain(ChainError),
}

impl DenyReason {
    pub(crate) fn into_error(
        self,
        instance: Uuid,
        event: LifecycleEvent,
    ) -> LifecycleError {
        match self {
            DenyReason::NotEnabled => LifecycleError::NotEligible(instance),
            DenyReason::InvalidState(state) => {
                LifecycleError::InvalidState { event, state }
            }
            DenyReason::PendingChain => {
                LifecycleError::HasPendingChain(instance)
            }
            DenyReason::Chain(e) => LifecycleError::Chain(e),
        }
    }
}

/// How to handle a requested event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Run the transition.
    Proceed(Transition),

    /// The instance is already where the event would put it. Report success
    /// without doing anything.
    Ignore,

    /// Refuse the event.
    Deny(DenyReason),
}

/// Decides how to handle `event` for an instance whose record is `record`
/// (`None` if the instance has never been touched). The record must be
/// settled; unsettled records are reconciled before they get here.
pub(crate) fn disposition(
    record: Option<&ChainRecord>,
    event: &LifecycleEvent,
) -> Disposition {
    use DenyReason as Deny;
    use LifecycleState as State;

    let enabled = record.is_some_and(|r| r.enabled);
    let state = record.map_or(State::Idle, |r| r.state);
    let chain_len = record.map_or(0, |r| r.chain.len());

    if !state.is_settled() {
        return Disposition::Deny(Deny::InvalidState(state));
    }

    match event {
        // Enabling an enabled instance is a no-op so that callers can enable
        // without checking first.
        LifecycleEvent::Enable if enabled => Disposition::Ignore,
        LifecycleEvent::Enable => {
            Disposition::Proceed(Transition::through(State::Enabling))
        }

        LifecycleEvent::Disable if !enabled => Disposition::Ignore,
        LifecycleEvent::Disable if chain_len > 0 => {
            Disposition::Deny(Deny::PendingChain)
        }
        LifecycleEvent::Disable => {
            Disposition::Proceed(Transition::through(State::Disabling))
        }

        _ if !enabled => Disposition::Deny(Deny::NotEnabled),

        // Snapshots may be stacked on an existing chain.
        LifecycleEvent::TakeSnapshot => {
            Disposition::Proceed(Transition::through(State::SnapshotPending))
        }

        // Commit and recover need something in the chain to act on; in the
        // settled states that is exactly `Snapshotted`.
        LifecycleEvent::Commit => match state {
            State::Snapshotted => Disposition::Proceed(Transition {
                starting: State::CommitStarting,
                in_flight: State::Committing,
            }),
            _ => Disposition::Deny(Deny::InvalidState(state)),
        },
        LifecycleEvent::Recover { snap_index, use_root } => match state {
            State::Snapshotted if !use_root && *snap_index >= chain_len => {
                Disposition::Deny(Deny::Chain(ChainError::IndexOutOfRange {
                    index: *snap_index,
                    len: chain_len,
                }))
            }
            State::Snapshotted => Disposition::Proceed(Transition {
                starting: State::RecoverStarting,
                in_flight: State::Recovering,
            }),
            _ => Disposition::Deny(Deny::InvalidState(state)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainIndex;
    use lightsnap_api_types::SnapshotId;

    fn record(enabled: bool, chain: &[&str]) -> ChainRecord {
        let chain = ChainIndex::from(
            chain.iter().map(|s| SnapshotId::from(*s)).collect::<Vec<_>>(),
        );
        ChainRecord {
            enabled,
            state: LifecycleState::settled_for_chain_len(chain.len()),
            chain,
            ..Default::default()
        }
    }

    #[test]
    fn untouched_instances_can_only_be_enabled() {
        assert!(matches!(
            disposition(None, &LifecycleEvent::Enable),
            Disposition::Proceed(Transition {
                starting: LifecycleState::Enabling,
                ..
            })
        ));
        assert_eq!(
            disposition(None, &LifecycleEvent::Disable),
            Disposition::Ignore
        );
        for event in [
            LifecycleEvent::TakeSnapshot,
            LifecycleEvent::Commit,
            LifecycleEvent::Recover { snap_index: 0, use_root: false },
        ] {
            assert_eq!(
                disposition(None, &event),
                Disposition::Deny(DenyReason::NotEnabled)
            );
        }
    }

    #[test]
    fn enable_is_idempotent() {
        let rec = record(true, &[]);
        assert_eq!(
            disposition(Some(&rec), &LifecycleEvent::Enable),
            Disposition::Ignore
        );
    }

    #[test]
    fn disable_requires_drained_chain() {
        let rec = record(true, &["s1"]);
        assert_eq!(
            disposition(Some(&rec), &LifecycleEvent::Disable),
            Disposition::Deny(DenyReason::PendingChain)
        );
        let rec = record(true, &[]);
        assert!(matches!(
            disposition(Some(&rec), &LifecycleEvent::Disable),
            Disposition::Proceed(_)
        ));
    }

    #[test]
    fn commit_and_recover_need_a_chain() {
        let idle = record(true, &[]);
        assert_eq!(
            disposition(Some(&idle), &LifecycleEvent::Commit),
            Disposition::Deny(DenyReason::InvalidState(LifecycleState::Idle))
        );
        assert_eq!(
            disposition(
                Some(&idle),
                &LifecycleEvent::Recover { snap_index: 0, use_root: true }
            ),
            Disposition::Deny(DenyReason::InvalidState(LifecycleState::Idle))
        );

        let snapped = record(true, &["s1", "s2"]);
        assert_eq!(
            disposition(Some(&snapped), &LifecycleEvent::Commit),
            Disposition::Proceed(Transition {
                starting: LifecycleState::CommitStarting,
                in_flight: LifecycleState::Committing,
            })
        );
    }

    #[test]
    fn recover_index_must_exist_unless_using_root() {
        let snapped = record(true, &["s1", "s2"]);
        assert_eq!(
            disposition(
                Some(&snapped),
                &LifecycleEvent::Recover { snap_index: 2, use_root: false }
            ),
            Disposition::Deny(DenyReason::Chain(ChainError::IndexOutOfRange {
                index: 2,
                len: 2
            }))
        );
        assert_eq!(
            disposition(
                Some(&snapped),
                &LifecycleEvent::Recover { snap_index: 9, use_root: true }
            ),
            Disposition::Proceed(Transition {
                starting: LifecycleState::RecoverStarting,
                in_flight: LifecycleState::Recovering,
            })
        );
    }

    #[test]
    fn unsettled_records_deny_everything() {
        let mut rec = record(true, &["s1"]);
        rec.state = LifecycleState::Committing;
        assert_eq!(
            disposition(Some(&rec), &LifecycleEvent::TakeSnapshot),
            Disposition::Deny(DenyReason::InvalidState(
                LifecycleState::Committing
            ))
        );
    }
}
