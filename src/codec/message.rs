use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::SessionStatus;

/// Therapy delivery mode reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Continuous,
    Intermittent,
}

impl Mode {
    /// Returns the wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Continuous => "continuous",
            Self::Intermittent => "intermittent",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "continuous" => Some(Self::Continuous),
            "intermittent" => Some(Self::Intermittent),
            _ => None,
        }
    }
}

/// Status a device declares in a message. Drives the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Running,
    Paused,
    Ended,
}

impl DeviceStatus {
    /// Returns the wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Ended => "ended",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "ended" => Some(Self::Ended),
            _ => None,
        }
    }
}

/// Fault severity. Errors are critical, warnings are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    /// Returns the wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }

    /// Parses a wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            _ => None,
        }
    }
}

/// What a validated message carries besides its optional mode/status.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    /// A normal pressure reading.
    Reading { value: f64 },
    /// A device fault.
    FaultEvent { severity: Severity, message: String },
    /// Only a mode and/or status declaration.
    StatusChange,
}

/// A validated inbound telemetry message.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub device_id: String,
    /// `None` keeps the session's previous mode.
    pub mode: Option<Mode>,
    /// `None` keeps the session's previous status.
    pub status: Option<DeviceStatus>,
    pub kind: MessageKind,
}

impl TelemetryMessage {
    /// Creates a reading message with no mode or status.
    pub fn reading(device_id: impl Into<String>, value: f64) -> Self {
        Self {
            device_id: device_id.into(),
            mode: None,
            status: None,
            kind: MessageKind::Reading { value },
        }
    }

    /// Creates a status-only message.
    pub fn status(device_id: impl Into<String>, status: DeviceStatus) -> Self {
        Self {
            device_id: device_id.into(),
            mode: None,
            status: Some(status),
            kind: MessageKind::StatusChange,
        }
    }
}

/// Outbound notification pushed to subscribed connections after a message
/// has been applied. Uses the inbound field names.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub device_id: String,
    pub time: DateTime<Utc>,
    pub mode: Mode,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Notification {
    /// Builds the notification for `msg` against the session state it produced.
    pub fn for_message(
        msg: &TelemetryMessage,
        mode: Mode,
        status: SessionStatus,
        time: DateTime<Utc>,
    ) -> Self {
        let (value, error, severity, message) = match &msg.kind {
            MessageKind::Reading { value } => (Some(*value), false, None, None),
            MessageKind::FaultEvent { severity, message } => {
                (None, true, Some(*severity), Some(message.clone()))
            }
            MessageKind::StatusChange => (None, false, None, None),
        };

        Self {
            device_id: msg.device_id.clone(),
            time,
            mode,
            status,
            value,
            error,
            severity,
            message,
        }
    }
}
