use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tracing::{debug, warn};

use crate::codec::{self, MessageKind, Notification, TelemetryMessage, ValidationError};
use crate::export::HealthMetrics;
use crate::record::{
    ComponentTag, ObservationKind, ObservationPayload, ObservationRequest, RecordClient, RemoteId,
};
use crate::registry::ConnectionRegistry;
use crate::report::ReportSynthesizer;
use crate::session::{Session, SessionStore, Transition};

/// Result of handling one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The frame failed validation and was dropped.
    Rejected(ValidationError),
    /// The message was applied to the device's session.
    Applied {
        device_id: String,
        transition: Transition,
    },
}

/// Message pipeline shared by all connections: decode, apply to the
/// device session, persist, broadcast and hand ended sessions to the
/// report synthesizer.
pub struct Ingest<R> {
    client: Arc<R>,
    sessions: SessionStore,
    registry: Arc<ConnectionRegistry>,
    synthesizer: ReportSynthesizer<R>,
    health: Arc<HealthMetrics>,
    known_devices: DashSet<String>,
}

impl<R: RecordClient + 'static> Ingest<R> {
    pub fn new(
        client: Arc<R>,
        registry: Arc<ConnectionRegistry>,
        health: Arc<HealthMetrics>,
        max_in_flight: usize,
    ) -> Self {
        let synthesizer =
            ReportSynthesizer::new(Arc::clone(&client), max_in_flight, Arc::clone(&health));

        Self {
            client,
            sessions: SessionStore::new(),
            registry,
            synthesizer,
            health,
            known_devices: DashSet::new(),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn synthesizer(&self) -> &ReportSynthesizer<R> {
        &self.synthesizer
    }

    /// Decodes and processes one text frame received at `received_at`.
    pub async fn handle_frame(&self, raw: &str, received_at: DateTime<Utc>) -> Outcome {
        self.health.messages_received.inc();

        match codec::decode(raw) {
            Ok(msg) => {
                let device_id = msg.device_id.clone();
                let transition = self.process(msg, received_at).await;
                Outcome::Applied {
                    device_id,
                    transition,
                }
            }
            Err(e) => {
                self.health
                    .messages_rejected
                    .with_label_values(&[e.kind.reason()])
                    .inc();
                warn!(
                    device_id = e.device_id.as_deref().unwrap_or("-"),
                    error = %e,
                    payload = raw,
                    "rejected telemetry message"
                );
                Outcome::Rejected(e.kind)
            }
        }
    }

    /// Applies a validated message. Messages for the same device are
    /// serialized by the session lock, held across record store calls.
    /// `received_at` is clamped so a session's times never go backwards.
    pub async fn process(&self, msg: TelemetryMessage, received_at: DateTime<Utc>) -> Transition {
        let started = Instant::now();

        let (handle, created) = self.sessions.get_or_create(&msg.device_id);
        if created {
            self.health.sessions_tracked.set(self.sessions.len() as f64);
        }

        let mut session = handle.lock().await;
        let received_at = session.clock(received_at);

        self.ensure_registered(&msg.device_id).await;

        session.set_mode(msg.mode);
        let transition = session.apply_status(msg.status, received_at);

        if transition != Transition::None {
            self.health
                .session_transitions
                .with_label_values(&[transition.as_str()])
                .inc();
            debug!(
                device_id = %msg.device_id,
                transition = transition.as_str(),
                status = session.status().as_str(),
                "session transition"
            );
        }

        match &msg.kind {
            MessageKind::Reading { value } => {
                let remote_id = self
                    .persist(
                        &session,
                        ObservationKind::Value,
                        ObservationPayload::Quantity(*value),
                        received_at,
                    )
                    .await;

                if !session.record_reading(*value, received_at, remote_id) {
                    debug!(
                        device_id = %msg.device_id,
                        value,
                        "reading while paused left out of session"
                    );
                }
            }
            MessageKind::FaultEvent { severity, message } => {
                let remote_id = self
                    .persist(
                        &session,
                        ObservationKind::for_severity(*severity),
                        ObservationPayload::Text(message.clone()),
                        received_at,
                    )
                    .await;

                session.record_fault(*severity, message.as_str(), received_at, remote_id);
            }
            MessageKind::StatusChange => {}
        }

        self.notify(&msg, &session, received_at);

        let snapshot = (transition == Transition::Ended).then(|| session.finish());
        drop(session);

        if let Some(snapshot) = snapshot {
            self.synthesizer.submit(snapshot, received_at);
        }

        self.health
            .message_processing_duration
            .observe(started.elapsed().as_secs_f64());

        transition
    }

    /// Calls `ensure_device_patient` the first time a device is seen.
    /// Failures are logged and not retried.
    async fn ensure_registered(&self, device_id: &str) {
        if !self.known_devices.insert(device_id.to_string()) {
            return;
        }

        if let Err(e) = self.client.ensure_device_patient(device_id).await {
            self.health
                .upstream_errors
                .with_label_values(&["ensure_device_patient"])
                .inc();
            warn!(device_id, error = %format!("{e:#}"), "ensuring patient and device failed");
        }
    }

    /// Persists one observation and returns its id, or `None` on failure.
    async fn persist(
        &self,
        session: &Session,
        kind: ObservationKind,
        payload: ObservationPayload,
        timestamp: DateTime<Utc>,
    ) -> Option<RemoteId> {
        let req = ObservationRequest {
            subject_id: session.device_id().to_string(),
            kind,
            payload,
            timestamp,
            tags: vec![
                ComponentTag::device_status(session.status().as_str()),
                ComponentTag::therapy_mode(session.mode().as_str()),
            ],
        };

        match self.client.create_observation(&req).await {
            Ok(id) => {
                self.health
                    .observations_persisted
                    .with_label_values(&[kind.as_str()])
                    .inc();
                Some(id)
            }
            Err(e) => {
                self.health
                    .upstream_errors
                    .with_label_values(&["create_observation"])
                    .inc();
                warn!(
                    device_id = %req.subject_id,
                    kind = kind.as_str(),
                    error = %format!("{e:#}"),
                    "persisting observation failed"
                );
                None
            }
        }
    }

    fn notify(&self, msg: &TelemetryMessage, session: &Session, time: DateTime<Utc>) {
        let notification = Notification::for_message(msg, session.mode(), session.status(), time);

        let text = match codec::encode(&notification) {
            Ok(text) => text,
            Err(e) => {
                warn!(device_id = %msg.device_id, error = %e, "encoding notification");
                return;
            }
        };

        let summary = self.registry.broadcast_for(&msg.device_id, Arc::from(text));
        if summary.dropped > 0 {
            self.health.broadcast_dropped.inc_by(summary.dropped as f64);
        }
    }
}
