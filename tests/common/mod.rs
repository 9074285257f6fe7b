#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use therapy_telemetry::export::HealthMetrics;
use therapy_telemetry::record::{ObservationRequest, RecordClient, RemoteId, ReportRequest};
use therapy_telemetry::registry::ConnectionRegistry;
use therapy_telemetry::server::Ingest;

/// In-memory record store that records every request.
#[derive(Default)]
pub struct MockRecordClient {
    pub ensured: Mutex<Vec<String>>,
    /// Every create_observation attempt, failed ones included.
    pub observations: Mutex<Vec<ObservationRequest>>,
    pub reports: Mutex<Vec<ReportRequest>>,
    failing_observations: Mutex<HashSet<usize>>,
    fail_reports: AtomicBool,
    next_id: AtomicU64,
    held_subject: Mutex<Option<String>>,
    released: AtomicBool,
    release: Notify,
}

impl MockRecordClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the n-th (zero-based) create_observation call fail.
    pub fn fail_observation(&self, index: usize) {
        self.failing_observations.lock().insert(index);
    }

    pub fn fail_reports(&self) {
        self.fail_reports.store(true, Ordering::SeqCst);
    }

    /// Make create_observation for `subject_id` wait until
    /// [`MockRecordClient::release_observations`] is called.
    pub fn hold_observations_for(&self, subject_id: &str) {
        *self.held_subject.lock() = Some(subject_id.to_string());
    }

    pub fn release_observations(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.release.notify_waiters();
    }

    async fn wait_for_release(&self) {
        loop {
            let notified = self.release.notified();
            if self.released.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    fn next_id(&self, prefix: &str) -> RemoteId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        RemoteId::new(format!("{prefix}-{n}"))
    }
}

impl RecordClient for MockRecordClient {
    async fn ensure_device_patient(&self, device_id: &str) -> Result<()> {
        self.ensured.lock().push(device_id.to_string());
        Ok(())
    }

    async fn create_observation(&self, req: &ObservationRequest) -> Result<RemoteId> {
        let index = {
            let mut observations = self.observations.lock();
            observations.push(req.clone());
            observations.len() - 1
        };

        let held = self.held_subject.lock().as_deref() == Some(req.subject_id.as_str());
        if held {
            self.wait_for_release().await;
        }

        if self.failing_observations.lock().contains(&index) {
            bail!("unexpected status 500 from POST Observation: injected failure");
        }

        Ok(self.next_id("obs"))
    }

    async fn create_report(&self, req: &ReportRequest) -> Result<RemoteId> {
        if self.fail_reports.load(Ordering::SeqCst) {
            bail!("unexpected status 503 from POST DiagnosticReport: injected failure");
        }

        self.reports.lock().push(req.clone());
        Ok(self.next_id("report"))
    }
}

pub fn health() -> Arc<HealthMetrics> {
    Arc::new(HealthMetrics::new("127.0.0.1:0").expect("metrics register"))
}

pub fn ingest(client: Arc<MockRecordClient>) -> (Ingest<MockRecordClient>, Arc<HealthMetrics>) {
    let health = health();
    let ingest = Ingest::new(
        client,
        Arc::new(ConnectionRegistry::new()),
        Arc::clone(&health),
        4,
    );
    (ingest, health)
}

/// Fixed base time plus `secs`.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_714_546_800 + secs, 0).expect("valid timestamp")
}
