use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::export::HealthMetrics;
use crate::record::RecordClient;
use crate::session::SessionSnapshot;

use super::Report;

/// Turns ended-session snapshots into reports and submits them to the
/// record store in the background.
///
/// Each submission is attempted once. At most `max_in_flight` submissions
/// run concurrently.
pub struct ReportSynthesizer<R> {
    client: Arc<R>,
    tracker: TaskTracker,
    semaphore: Arc<Semaphore>,
    health: Arc<HealthMetrics>,
}

impl<R: RecordClient + 'static> ReportSynthesizer<R> {
    pub fn new(client: Arc<R>, max_in_flight: usize, health: Arc<HealthMetrics>) -> Self {
        Self {
            client,
            tracker: TaskTracker::new(),
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
            health,
        }
    }

    /// Computes the report for `snapshot` and schedules its submission.
    /// Returns the report, or `None` when there was nothing to report.
    pub fn submit(&self, snapshot: SessionSnapshot, issued_at: DateTime<Utc>) -> Option<Report> {
        let Some(report) = Report::from_snapshot(&snapshot) else {
            info!(
                device_id = %snapshot.device_id,
                warnings = snapshot.warnings.len(),
                "session ended with no observations or errors, skipping report"
            );
            self.health.reports_skipped.inc();
            return None;
        };

        let request = report.to_request(issued_at);
        let client = Arc::clone(&self.client);
        let semaphore = Arc::clone(&self.semaphore);
        let health = Arc::clone(&self.health);

        self.tracker.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(error = %e, "report semaphore closed");
                    return;
                }
            };

            match client.create_report(&request).await {
                Ok(id) => {
                    health.reports_emitted.inc();
                    info!(
                        device_id = %request.subject_id,
                        report_id = %id,
                        references = request.references.len(),
                        "session report emitted"
                    );
                }
                Err(e) => {
                    health.reports_failed.inc();
                    health
                        .upstream_errors
                        .with_label_values(&["create_report"])
                        .inc();
                    warn!(
                        device_id = %request.subject_id,
                        error = %format!("{e:#}"),
                        payload = ?request,
                        "session report submission failed"
                    );
                }
            }
        });

        Some(report)
    }

    /// Returns the number of submissions not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits until every submission scheduled so far has finished.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Waits for in-flight submissions. Called once on shutdown.
    pub async fn shutdown(&self) {
        info!(pending = self.in_flight(), "draining session reports");
        self.tracker.close();
        self.tracker.wait().await;
        info!("report synthesizer drained");
    }
}
