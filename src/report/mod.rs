pub mod synthesizer;

use std::fmt::Write as _;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::codec::Mode;
use crate::record::{RemoteId, ReportRequest};
use crate::session::SessionSnapshot;

pub use synthesizer::ReportSynthesizer;

/// Summary statistics over observation values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Statistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Statistics {
    /// Returns `None` for an empty input.
    pub fn compute(values: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for v in values {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }

        if count == 0 {
            return None;
        }

        Some(Self {
            min,
            max,
            mean: sum / count as f64,
        })
    }
}

/// Derived metrics for one finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub device_id: String,
    pub mode: Mode,
    pub therapy_start: Option<DateTime<Utc>>,
    pub therapy_end: Option<DateTime<Utc>>,
    /// `therapy_end - therapy_start`, zero when either is unset.
    pub duration: Duration,
    pub pause_total: Duration,
    pub observation_count: usize,
    pub error_count: usize,
    pub warning_count: usize,
    /// Absent when there are no observations.
    pub statistics: Option<Statistics>,
    /// Persisted observations, errors and warnings, in that order.
    pub references: Vec<RemoteId>,
}

impl Report {
    /// Computes the report for `snapshot`. Returns `None` when the session
    /// has neither observations nor errors.
    pub fn from_snapshot(snapshot: &SessionSnapshot) -> Option<Self> {
        if snapshot.observations.is_empty() && snapshot.errors.is_empty() {
            return None;
        }

        let duration = match (snapshot.therapy_start, snapshot.therapy_end) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        };

        let pause_total = snapshot.pause_periods.iter().map(|p| p.duration()).sum();

        let references = snapshot
            .observations
            .iter()
            .filter_map(|o| o.remote_id.clone())
            .chain(snapshot.errors.iter().filter_map(|e| e.remote_id.clone()))
            .chain(snapshot.warnings.iter().filter_map(|w| w.remote_id.clone()))
            .collect();

        Some(Self {
            device_id: snapshot.device_id.clone(),
            mode: snapshot.mode,
            therapy_start: snapshot.therapy_start,
            therapy_end: snapshot.therapy_end,
            duration,
            pause_total,
            observation_count: snapshot.observations.len(),
            error_count: snapshot.errors.len(),
            warning_count: snapshot.warnings.len(),
            statistics: Statistics::compute(snapshot.observations.iter().map(|o| o.value)),
            references,
        })
    }

    /// Human-readable one-paragraph summary.
    pub fn conclusion(&self) -> String {
        let mut out = format!(
            "Therapy session for {} in {} mode. Start: {}. End: {}. \
             Duration: {}. Pause duration: {}. Readings: {}",
            self.device_id,
            self.mode.as_str(),
            format_datetime(self.therapy_start),
            format_datetime(self.therapy_end),
            format_hms(self.duration),
            format_hms(self.pause_total),
            self.observation_count,
        );

        if let Some(stats) = self.statistics {
            let _ = write!(
                out,
                " (min {:.1}, max {:.1}, mean {:.1} mmHg)",
                stats.min, stats.max, stats.mean
            );
        }

        let _ = write!(
            out,
            ". Errors: {}. Warnings: {}.",
            self.error_count, self.warning_count
        );

        out
    }

    /// Builds the record store request for this report.
    pub fn to_request(&self, issued_at: DateTime<Utc>) -> ReportRequest {
        ReportRequest {
            subject_id: self.device_id.clone(),
            references: self.references.clone(),
            conclusion: self.conclusion(),
            issued_at,
            period_start: self.therapy_start,
            period_end: self.therapy_end,
        }
    }
}

/// Formats a duration as `H:MM:SS`, truncating sub-second parts.
pub fn format_hms(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours}:{minutes:02}:{seconds:02}")
}

fn format_datetime(t: Option<DateTime<Utc>>) -> String {
    match t {
        Some(t) => t.format("%d %b %Y, %H:%M:%S").to_string(),
        None => "N/A".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{FaultEntry, PausePeriod, ReadingEntry};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_714_546_800 + secs, 0).expect("valid timestamp")
    }

    fn reading(value: f64, secs: i64, id: Option<&str>) -> ReadingEntry {
        ReadingEntry {
            value,
            timestamp: at(secs),
            remote_id: id.map(RemoteId::new),
        }
    }

    fn fault(secs: i64, id: Option<&str>) -> FaultEntry {
        FaultEntry {
            message: "Suction failure".to_string(),
            timestamp: at(secs),
            remote_id: id.map(RemoteId::new),
        }
    }

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot {
            device_id: "pump-1".to_string(),
            mode: Mode::Continuous,
            therapy_start: Some(at(0)),
            therapy_end: Some(at(3_725)),
            pause_periods: vec![
                PausePeriod {
                    start: at(100),
                    end: at(160),
                },
                PausePeriod {
                    start: at(200),
                    end: at(230),
                },
            ],
            observations: vec![
                reading(-70.0, 1, Some("o1")),
                reading(-72.0, 2, None),
                reading(-65.0, 3, Some("o3")),
            ],
            errors: Vec::new(),
            warnings: vec![fault(4, Some("w1"))],
        }
    }

    #[test]
    fn test_statistics() {
        let stats = Statistics::compute([-70.0, -72.0, -65.0]).expect("non-empty");
        assert_eq!(stats.min, -72.0);
        assert_eq!(stats.max, -65.0);
        assert!((stats.mean - -69.0).abs() < 1e-9);
        assert_eq!(Statistics::compute(std::iter::empty()), None);
    }

    #[test]
    fn test_from_snapshot() {
        let report = Report::from_snapshot(&snapshot()).expect("report");
        assert_eq!(report.duration, Duration::from_secs(3_725));
        assert_eq!(report.pause_total, Duration::from_secs(90));
        assert_eq!(report.observation_count, 3);
        assert_eq!(report.warning_count, 1);
        assert_eq!(
            report.references,
            vec![RemoteId::new("o1"), RemoteId::new("o3"), RemoteId::new("w1")]
        );
    }

    #[test]
    fn test_skip_without_observations_or_errors() {
        let mut s = snapshot();
        s.observations.clear();
        assert!(Report::from_snapshot(&s).is_none());

        s.errors.push(fault(5, None));
        let report = Report::from_snapshot(&s).expect("errors alone produce a report");
        assert_eq!(report.statistics, None);
        assert!(report.conclusion().contains("Readings: 0. Errors: 1."));
    }

    #[test]
    fn test_duration_zero_without_start() {
        let mut s = snapshot();
        s.therapy_start = None;
        let report = Report::from_snapshot(&s).expect("report");
        assert_eq!(report.duration, Duration::ZERO);
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(Duration::ZERO), "0:00:00");
        assert_eq!(format_hms(Duration::from_millis(61_900)), "0:01:01");
        assert_eq!(format_hms(Duration::from_secs(3_725)), "1:02:05");
        assert_eq!(format_hms(Duration::from_secs(36 * 3600)), "36:00:00");
    }

    #[test]
    fn test_conclusion() {
        let report = Report::from_snapshot(&snapshot()).expect("report");
        let text = report.conclusion();
        assert!(text.starts_with("Therapy session for pump-1 in continuous mode."));
        assert!(text.contains("Start: 01 May 2024, 07:00:00."));
        assert!(text.contains("Duration: 1:02:05."));
        assert!(text.contains("Pause duration: 0:01:30."));
        assert!(text.contains("Readings: 3 (min -72.0, max -65.0, mean -69.0 mmHg)"));
        assert!(text.ends_with("Errors: 0. Warnings: 1."));
    }

    #[test]
    fn test_to_request() {
        let report = Report::from_snapshot(&snapshot()).expect("report");
        let req = report.to_request(at(4_000));
        assert_eq!(req.subject_id, "pump-1");
        assert_eq!(req.references.len(), 3);
        assert_eq!(req.period_start, Some(at(0)));
        assert_eq!(req.period_end, Some(at(3_725)));
        assert_eq!(req.issued_at, at(4_000));
    }
}
