// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Progress and outcome reports for fleet snapshot batches.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use lightsnap_api_types::{BatchReport, HostBatchReport, InstanceFailure};
use uuid::Uuid;

/// Keeps the reports of recent batches. Reports of finished batches are
/// evicted oldest-first once more than `capacity` are held; running batches
/// are never evicted.
#[derive(Debug)]
pub struct BatchRegistry {
    reports: Mutex<VecDeque<BatchReport>>,
    capacity: usize,
}

impl BatchRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { reports: Mutex::new(VecDeque::new()), capacity }
    }

    /// Registers a new batch that will visit `hosts`.
    pub fn begin(&self, batch_id: Uuid, daily: bool, hosts: &[String]) {
        let mut report = BatchReport::new(batch_id, daily);
        for host in hosts {
            report.hosts.insert(host.clone(), HostBatchReport::default());
        }

        let mut reports = self.reports.lock().unwrap();
        reports.push_front(report);
        while reports.len() > self.capacity {
            let Some(pos) = reports.iter().rposition(BatchReport::is_finished)
            else {
                break;
            };
            reports.remove(pos);
        }
    }

    pub fn get(&self, batch_id: Uuid) -> Option<BatchReport> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.batch_id == batch_id)
            .cloned()
    }

    /// All retained reports, newest first.
    pub fn list(&self) -> Vec<BatchReport> {
        self.reports.lock().unwrap().iter().cloned().collect()
    }

    pub fn record_success(&self, batch_id: Uuid, host: &str) {
        self.with_host(batch_id, host, |h| h.succeeded += 1);
    }

    pub fn record_failure(
        &self,
        batch_id: Uuid,
        host: &str,
        failure: InstanceFailure,
    ) {
        self.with_host(batch_id, host, |h| {
            h.failed += 1;
            h.failures.push(failure);
        });
    }

    pub fn record_skipped(&self, batch_id: Uuid, host: &str) {
        self.with_host(batch_id, host, |h| h.skipped += 1);
    }

    pub fn host_listing_failed(&self, batch_id: Uuid, host: &str, err: String) {
        self.with_host(batch_id, host, |h| {
            h.listing_error = Some(err);
            h.finished = true;
        });
    }

    pub fn host_finished(&self, batch_id: Uuid, host: &str) {
        self.with_host(batch_id, host, |h| h.finished = true);
    }

    pub fn finish(&self, batch_id: Uuid) {
        let mut reports = self.reports.lock().unwrap();
        let report = reports.iter_mut().find(|r| r.batch_id == batch_id);
        if let Some(report) = report {
            report.finished_at = Some(Utc::now());
        }
    }

    fn with_host<F>(&self, batch_id: Uuid, host: &str, f: F)
    where
        F: FnOnce(&mut HostBatchReport),
    {
        let mut reports = self.reports.lock().unwrap();
        if let Some(host) = reports
            .iter_mut()
            .find(|r| r.batch_id == batch_id)
            .and_then(|r| r.hosts.get_mut(host))
        {
            f(host);
        }
    }
}
