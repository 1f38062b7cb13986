// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes a server config which may be parsed from a TOML file.

use std::time::Duration;

pub use lightsnap_server_config::*;

use crate::chain::RetryPolicy;
use crate::fleet::{FleetSettings, StaticFleet};
use crate::lifecycle::LifecycleSettings;

pub fn lifecycle_settings(cfg: &Config) -> LifecycleSettings {
    LifecycleSettings {
        hypervisor_timeout: cfg.lifecycle.hypervisor_timeout(),
        retry: RetryPolicy {
            attempts: cfg.lifecycle.store_retry_attempts,
            initial_interval: cfg.lifecycle.store_retry_initial(),
        },
    }
}

pub fn fleet_settings(cfg: &Config) -> FleetSettings {
    FleetSettings {
        host_workers: cfg.fleet.host_workers,
        max_concurrent_hosts: cfg.fleet.max_concurrent_hosts,
        batch_history: cfg.fleet.batch_history,
    }
}

/// The fleet directory described by the `[[host]]` tables.
pub fn static_fleet(cfg: &Config) -> StaticFleet {
    StaticFleet::new(
        cfg.hosts.iter().map(|h| (h.name.clone(), h.instances.clone())),
    )
}

pub fn sim_latency(cfg: &Config) -> Duration {
    Duration::from_millis(cfg.sim.latency_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::FleetDirectory;
    use uuid::Uuid;

    #[tokio::test]
    async fn settings_follow_the_file() {
        let id = Uuid::new_v4();
        let cfg = parse_str(&format!(
            r#"
            [lifecycle]
            hypervisor_timeout_ms = 1500
            store_retry_attempts = 2

            [fleet]
            host_workers = 8

            [[host]]
            name = "compute-07"
            instances = ["{id}"]
            "#
        ))
        .unwrap();

        let lifecycle = lifecycle_settings(&cfg);
        assert_eq!(lifecycle.hypervisor_timeout, Duration::from_millis(1500));
        assert_eq!(lifecycle.retry.attempts, 2);
        assert_eq!(fleet_settings(&cfg).host_workers, 8);

        let fleet = static_fleet(&cfg);
        let found = fleet.find_instance(id).await.unwrap().unwrap();
        assert_eq!(found.host, "compute-07");
    }
}
