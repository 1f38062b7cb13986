// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outcomes of lifecycle operations and their mapping onto the coarse
//! categories (and HTTP statuses) seen by API clients.

use std::time::Duration;

use dropshot::{ClientErrorStatusCode, HttpError};
use lightsnap_api_types::{ErrorCode, LifecycleState};
use thiserror::Error;
use uuid::Uuid;

use crate::chain::ChainError;
use crate::fleet::DirectoryError;
use crate::hypervisor::HypervisorError;
use crate::lifecycle::transitions::LifecycleEvent;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Instance {0} has not enabled light snapshots")]
    NotEligible(Uuid),

    #[error("Instance {0} is not known to the fleet")]
    NotFound(Uuid),

    #[error("Another light-snapshot operation is in flight on instance {0}")]
    OperationInFlight(Uuid),

    #[error("Cannot {event} while the instance is {state}")]
    InvalidState { event: LifecycleEvent, state: LifecycleState },

    #[error(
        "Instance {0} still has a snapshot chain; commit or recover it first"
    )]
    HasPendingChain(Uuid),

    #[error("Chain record for instance {0} kept changing during the update")]
    StaleRecord(Uuid),

    #[error(
        "The hypervisor is still finishing an earlier disk job on instance {0}"
    )]
    HypervisorBusy(Uuid),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("Hypervisor call failed: {0}")]
    Hypervisor(#[from] HypervisorError),

    #[error("Hypervisor call {op} did not complete within {after:?}")]
    TimedOut { op: &'static str, after: Duration },

    #[error("Hypervisor call {op} was cancelled")]
    Cancelled { op: &'static str },

    #[error("Chain store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Fleet directory failed: {0}")]
    Directory(#[from] DirectoryError),
}

impl LifecycleError {
    /// The outcome category reported to callers.
    pub fn category(&self) -> ErrorCode {
        match self {
            LifecycleError::NotEligible(_) => ErrorCode::NotEligible,
            LifecycleError::NotFound(_)
            | LifecycleError::Directory(DirectoryError::UnknownHost(_)) => {
                ErrorCode::NotFound
            }
            LifecycleError::OperationInFlight(_)
            | LifecycleError::InvalidState { .. }
            | LifecycleError::HasPendingChain(_)
            | LifecycleError::StaleRecord(_)
            | LifecycleError::HypervisorBusy(_) => ErrorCode::Conflict,
            LifecycleError::Chain(_) => ErrorCode::Invalid,
            LifecycleError::Hypervisor(_)
            | LifecycleError::TimedOut { .. }
            | LifecycleError::Cancelled { .. }
            | LifecycleError::Store(_)
            | LifecycleError::Directory(_) => ErrorCode::RemoteFailure,
        }
    }

    /// Returns `true` if a hypervisor mutation may have taken effect even
    /// though the caller saw it fail.
    pub fn outcome_unknown(&self) -> bool {
        matches!(
            self,
            LifecycleError::TimedOut { .. } | LifecycleError::Cancelled { .. }
        )
    }
}

impl From<LifecycleError> for HttpError {
    fn from(err: LifecycleError) -> Self {
        let code = err.category();
        let message = format!("Light-snapshot operation failed: {}", err);
        let error_code = Some(code.to_string());
        match code {
            ErrorCode::NotEligible => HttpError::for_client_error(
                error_code,
                ClientErrorStatusCode::FORBIDDEN,
                message,
            ),
            ErrorCode::Conflict => HttpError::for_client_error(
                error_code,
                ClientErrorStatusCode::CONFLICT,
                message,
            ),
            ErrorCode::NotFound => {
                HttpError::for_not_found(error_code, message)
            }
            ErrorCode::Invalid => {
                HttpError::for_bad_request(error_code, message)
            }
            ErrorCode::RemoteFailure => {
                HttpError::for_unavail(error_code, message)
            }
        }
    }
}
