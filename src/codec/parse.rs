use serde_json::{Map, Value};
use thiserror::Error;

use super::message::{DeviceStatus, MessageKind, Mode, Notification, Severity, TelemetryMessage};

/// Reasons a frame is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid JSON: {reason}")]
    InvalidJson { reason: String },

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing deviceId")]
    MissingDeviceId,

    #[error("deviceId {raw:?} is not a valid resource id")]
    InvalidDeviceId { raw: String },

    #[error("field {field} must be a {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("malformed numeric value: {raw}")]
    MalformedValue { raw: String },

    #[error("message carries no value, status or error")]
    MissingValue,

    #[error("unknown mode: {raw}")]
    UnknownMode { raw: String },

    #[error("unknown status: {raw}")]
    UnknownStatus { raw: String },

    #[error("unknown severity: {raw}")]
    UnknownSeverity { raw: String },

    #[error("error message without severity")]
    MissingSeverity,

    #[error("error message without message text")]
    MissingMessage,
}

impl ValidationError {
    /// Returns a short label for metrics.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::InvalidJson { .. } => "invalid_json",
            Self::NotAnObject => "not_an_object",
            Self::MissingDeviceId => "missing_device_id",
            Self::InvalidDeviceId { .. } => "invalid_device_id",
            Self::InvalidField { .. } => "invalid_field",
            Self::MalformedValue { .. } => "malformed_value",
            Self::MissingValue => "missing_value",
            Self::UnknownMode { .. } => "unknown_mode",
            Self::UnknownStatus { .. } => "unknown_status",
            Self::UnknownSeverity { .. } => "unknown_severity",
            Self::MissingSeverity => "missing_severity",
            Self::MissingMessage => "missing_message",
        }
    }
}

/// A rejected frame, with the device id when one could be read.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}")]
pub struct DecodeError {
    pub device_id: Option<String>,
    pub kind: ValidationError,
}

const MAX_RESOURCE_ID_LEN: usize = 64;

/// Decode one inbound frame.
pub fn decode(raw: &str) -> Result<TelemetryMessage, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| DecodeError {
        device_id: None,
        kind: ValidationError::InvalidJson {
            reason: e.to_string(),
        },
    })?;

    let Value::Object(obj) = value else {
        return Err(DecodeError {
            device_id: None,
            kind: ValidationError::NotAnObject,
        });
    };

    let device_id = match device_id(&obj) {
        Ok(id) => id,
        Err(kind) => {
            return Err(DecodeError {
                device_id: None,
                kind,
            })
        }
    };

    decode_fields(&obj)
        .map(|(mode, status, kind)| TelemetryMessage {
            device_id: device_id.clone(),
            mode,
            status,
            kind,
        })
        .map_err(|kind| DecodeError {
            device_id: Some(device_id),
            kind,
        })
}

/// Serialize an outbound notification as a single JSON text frame.
pub fn encode(notification: &Notification) -> serde_json::Result<String> {
    serde_json::to_string(notification)
}

fn decode_fields(
    obj: &Map<String, Value>,
) -> Result<(Option<Mode>, Option<DeviceStatus>, MessageKind), ValidationError> {
    let mode = match str_field(obj, "mode")? {
        Some(raw) => Some(
            Mode::from_name(raw).ok_or_else(|| ValidationError::UnknownMode {
                raw: raw.to_string(),
            })?,
        ),
        None => None,
    };

    let status = match str_field(obj, "status")? {
        Some(raw) => Some(DeviceStatus::from_name(raw).ok_or_else(|| {
            ValidationError::UnknownStatus {
                raw: raw.to_string(),
            }
        })?),
        None => None,
    };

    let is_error = match field(obj, "error") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => {
            return Err(ValidationError::InvalidField {
                field: "error",
                expected: "boolean",
            })
        }
    };

    // Fault frames carry a placeholder value that is not part of the fault.
    if is_error {
        let raw = str_field(obj, "severity")?.ok_or(ValidationError::MissingSeverity)?;
        let severity = Severity::from_name(raw).ok_or_else(|| ValidationError::UnknownSeverity {
            raw: raw.to_string(),
        })?;
        let message = str_field(obj, "message")?.ok_or(ValidationError::MissingMessage)?;

        return Ok((
            mode,
            status,
            MessageKind::FaultEvent {
                severity,
                message: message.to_string(),
            },
        ));
    }

    let kind = match field(obj, "value") {
        Some(v) => MessageKind::Reading {
            value: numeric(v)?,
        },
        None if status.is_some() => MessageKind::StatusChange,
        None => return Err(ValidationError::MissingValue),
    };

    Ok((mode, status, kind))
}

fn device_id(obj: &Map<String, Value>) -> Result<String, ValidationError> {
    let raw = match field(obj, "deviceId") {
        Some(v) => Some(v),
        None => field(obj, "device_id"),
    };

    match raw {
        None => Err(ValidationError::MissingDeviceId),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ValidationError::MissingDeviceId),
        Some(Value::String(s)) if !is_resource_id(s) => {
            Err(ValidationError::InvalidDeviceId { raw: s.clone() })
        }
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ValidationError::InvalidField {
            field: "deviceId",
            expected: "string",
        }),
    }
}

/// Device ids become record store resource ids and URL path segments, so
/// they must match the FHIR id grammar `[A-Za-z0-9\-\.]{1,64}`.
fn is_resource_id(s: &str) -> bool {
    (1..=MAX_RESOURCE_ID_LEN).contains(&s.len())
        && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.')
}

/// Returns the field, treating JSON `null` as absent.
fn field<'a>(obj: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    obj.get(name).filter(|v| !v.is_null())
}

fn str_field<'a>(
    obj: &'a Map<String, Value>,
    name: &'static str,
) -> Result<Option<&'a str>, ValidationError> {
    match field(obj, name) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ValidationError::InvalidField {
            field: name,
            expected: "string",
        }),
    }
}

fn numeric(v: &Value) -> Result<f64, ValidationError> {
    v.as_f64()
        .filter(|f| f.is_finite())
        .ok_or_else(|| ValidationError::MalformedValue { raw: v.to_string() })
}
