//! Session-tracking telemetry server for negative-pressure wound therapy
//! devices.
//!
//! Devices stream JSON frames over WebSocket. Each frame is applied to the
//! device's therapy session, persisted to a FHIR record store and pushed
//! to subscribed connections; a summary report is written when a session
//! ends.

pub mod app;
pub mod codec;
pub mod config;
pub mod export;
pub mod record;
pub mod registry;
pub mod report;
pub mod server;
pub mod session;
