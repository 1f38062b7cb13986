// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod chain;
pub mod config;
pub mod error;
pub mod fleet;
pub mod hypervisor;
pub mod lifecycle;
pub mod server;
pub mod store;
