pub mod message;
pub mod parse;

pub use message::{DeviceStatus, MessageKind, Mode, Notification, Severity, TelemetryMessage};
pub use parse::{decode, encode, DecodeError, ValidationError};
