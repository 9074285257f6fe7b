pub mod fhir;

use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::codec::Severity;

pub use fhir::FhirClient;

/// Identifier assigned by the record store to a created resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an observation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservationKind {
    /// A wound pressure reading.
    Value,
    /// A critical device fault.
    Error,
    /// A non-critical device fault.
    Warning,
}

impl ObservationKind {
    pub const fn for_severity(severity: Severity) -> Self {
        match severity {
            Severity::Error => Self::Error,
            Severity::Warning => Self::Warning,
        }
    }

    /// Returns the metric label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }

    /// LOINC code of the observation.
    pub const fn loinc_code(self) -> &'static str {
        match self {
            Self::Value => "31209-0",
            Self::Error => "70325-2",
            Self::Warning => "69758-7",
        }
    }

    /// LOINC display name.
    pub const fn display(self) -> &'static str {
        match self {
            Self::Value => "Pressure in wound therapy device",
            Self::Error => "Device connectivity status",
            Self::Warning => "Device alert",
        }
    }

    /// Free-text label shown by the dashboard.
    pub const fn text(self) -> &'static str {
        match self {
            Self::Value => "Wound pressure",
            Self::Error => "Device connection issue",
            Self::Warning => "Device warning",
        }
    }

    /// Observation category code and display.
    pub const fn category(self) -> (&'static str, &'static str) {
        match self {
            Self::Value => ("vital-signs", "Vital Signs"),
            Self::Error | Self::Warning => ("device", "Device"),
        }
    }
}

/// Observed value.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationPayload {
    /// Pressure in mmHg.
    Quantity(f64),
    /// Fault text.
    Text(String),
}

/// A name/value component attached to an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentTag {
    pub name: String,
    pub value: String,
}

impl ComponentTag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Tag read by the dashboard for the session state.
    pub fn device_status(status: &str) -> Self {
        Self::new("Device status", status)
    }

    pub fn therapy_mode(mode: &str) -> Self {
        Self::new("Therapy mode", mode)
    }
}

/// Request to create one observation.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationRequest {
    pub subject_id: String,
    pub kind: ObservationKind,
    pub payload: ObservationPayload,
    pub timestamp: DateTime<Utc>,
    pub tags: Vec<ComponentTag>,
}

/// Request to create a session summary report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportRequest {
    pub subject_id: String,
    /// Observations the report covers.
    pub references: Vec<RemoteId>,
    pub conclusion: String,
    pub issued_at: DateTime<Utc>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
}

/// Clinical record store client trait.
pub trait RecordClient: Send + Sync {
    /// Make sure the patient and device entities for `device_id` exist.
    fn ensure_device_patient(
        &self,
        device_id: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Persist one observation and return its id.
    fn create_observation(
        &self,
        req: &ObservationRequest,
    ) -> impl std::future::Future<Output = Result<RemoteId>> + Send;

    /// Persist a session report and return its id.
    fn create_report(
        &self,
        req: &ReportRequest,
    ) -> impl std::future::Future<Output = Result<RemoteId>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_table() {
        assert_eq!(ObservationKind::Value.loinc_code(), "31209-0");
        assert_eq!(ObservationKind::Error.loinc_code(), "70325-2");
        assert_eq!(ObservationKind::Warning.loinc_code(), "69758-7");
        assert_eq!(ObservationKind::Value.category().0, "vital-signs");
        assert_eq!(ObservationKind::Warning.category().0, "device");
    }

    #[test]
    fn test_kind_for_severity() {
        assert_eq!(
            ObservationKind::for_severity(Severity::Error),
            ObservationKind::Error
        );
        assert_eq!(
            ObservationKind::for_severity(Severity::Warning),
            ObservationKind::Warning
        );
    }

    #[test]
    fn test_remote_id_display() {
        let id = RemoteId::new("obs-42");
        assert_eq!(id.to_string(), "obs-42");
        assert_eq!(id.as_str(), "obs-42");
    }
}
