pub mod store;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codec::{DeviceStatus, Mode, Severity};
use crate::record::RemoteId;

pub use store::SessionStore;

/// Authoritative session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Ended,
}

impl SessionStatus {
    /// Returns the wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Ended => "ended",
        }
    }
}

/// The effect of applying a declared status to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Started,
    Paused,
    Resumed,
    Ended,
}

impl Transition {
    /// Returns the metric label for this transition.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Ended => "ended",
        }
    }
}

/// A closed pause interval. `start <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PausePeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PausePeriod {
    fn closed(start: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            start,
            end: now.max(start),
        }
    }

    /// Returns the length of the interval.
    pub fn duration(&self) -> std::time::Duration {
        (self.end - self.start).to_std().unwrap_or_default()
    }
}

/// A buffered pressure reading.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingEntry {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    /// Set when the record store accepted the observation.
    pub remote_id: Option<RemoteId>,
}

/// A buffered fault event.
#[derive(Debug, Clone, PartialEq)]
pub struct FaultEntry {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub remote_id: Option<RemoteId>,
}

/// Owned copy of a session's buffers taken at the Ended transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub device_id: String,
    pub mode: Mode,
    pub therapy_start: Option<DateTime<Utc>>,
    pub therapy_end: Option<DateTime<Utc>>,
    pub pause_periods: Vec<PausePeriod>,
    pub observations: Vec<ReadingEntry>,
    pub errors: Vec<FaultEntry>,
    pub warnings: Vec<FaultEntry>,
}

/// Therapy session of a single device.
///
/// Plain data; callers serialize access through the [`SessionStore`]
/// handle lock.
#[derive(Debug, Clone)]
pub struct Session {
    device_id: String,
    /// Latest time passed to [`Session::clock`]. Never moves backwards.
    last_event: Option<DateTime<Utc>>,
    mode: Mode,
    status: SessionStatus,
    therapy_start: Option<DateTime<Utc>>,
    therapy_end: Option<DateTime<Utc>>,
    pause_periods: Vec<PausePeriod>,
    current_pause_start: Option<DateTime<Utc>>,
    observations: Vec<ReadingEntry>,
    errors: Vec<FaultEntry>,
    warnings: Vec<FaultEntry>,
}

impl Session {
    /// Creates an idle session for `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            last_event: None,
            mode: Mode::default(),
            status: SessionStatus::Idle,
            therapy_start: None,
            therapy_end: None,
            pause_periods: Vec::new(),
            current_pause_start: None,
            observations: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn therapy_start(&self) -> Option<DateTime<Utc>> {
        self.therapy_start
    }

    pub fn therapy_end(&self) -> Option<DateTime<Utc>> {
        self.therapy_end
    }

    pub fn current_pause_start(&self) -> Option<DateTime<Utc>> {
        self.current_pause_start
    }

    pub fn pause_periods(&self) -> &[PausePeriod] {
        &self.pause_periods
    }

    pub fn observations(&self) -> &[ReadingEntry] {
        &self.observations
    }

    pub fn errors(&self) -> &[FaultEntry] {
        &self.errors
    }

    pub fn warnings(&self) -> &[FaultEntry] {
        &self.warnings
    }

    /// Returns `now` clamped to be no earlier than any time this session
    /// has already seen, and records it. Arrival times captured before the
    /// session lock was taken can be out of order across connections.
    pub fn clock(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = match self.last_event {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_event = Some(now);
        now
    }

    /// Updates the mode when the message declares one.
    pub fn set_mode(&mut self, mode: Option<Mode>) {
        if let Some(mode) = mode {
            self.mode = mode;
        }
    }

    /// Applies a declared status at server time `now`.
    ///
    /// Combinations outside the lifecycle table return
    /// [`Transition::None`] and leave the session unchanged.
    pub fn apply_status(&mut self, status: Option<DeviceStatus>, now: DateTime<Utc>) -> Transition {
        let Some(status) = status else {
            return Transition::None;
        };

        match (self.status, status) {
            (SessionStatus::Idle, DeviceStatus::Running) => {
                self.therapy_start = Some(now);
                self.status = SessionStatus::Running;
                Transition::Started
            }
            (SessionStatus::Ended, DeviceStatus::Running) => {
                self.reset();
                self.therapy_start = Some(now);
                self.status = SessionStatus::Running;
                Transition::Started
            }
            (SessionStatus::Running, DeviceStatus::Paused) => {
                self.current_pause_start = Some(now);
                self.status = SessionStatus::Paused;
                Transition::Paused
            }
            (SessionStatus::Paused, DeviceStatus::Running) => {
                self.close_pause(now);
                self.status = SessionStatus::Running;
                Transition::Resumed
            }
            // A repeated Ended after a report has empty buffers unless
            // something arrived in between; the synthesizer skips empty ones.
            (_, DeviceStatus::Ended) => {
                self.therapy_end = Some(now);
                self.close_pause(now);
                self.status = SessionStatus::Ended;
                Transition::Ended
            }
            _ => Transition::None,
        }
    }

    /// Appends a reading. Returns false when the session is paused and the
    /// reading is left out of the statistics.
    pub fn record_reading(
        &mut self,
        value: f64,
        timestamp: DateTime<Utc>,
        remote_id: Option<RemoteId>,
    ) -> bool {
        if self.status == SessionStatus::Paused {
            return false;
        }

        self.observations.push(ReadingEntry {
            value,
            timestamp,
            remote_id,
        });

        true
    }

    /// Appends a fault to the buffer matching its severity.
    pub fn record_fault(
        &mut self,
        severity: Severity,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
        remote_id: Option<RemoteId>,
    ) {
        let entry = FaultEntry {
            message: message.into(),
            timestamp,
            remote_id,
        };

        match severity {
            Severity::Error => self.errors.push(entry),
            Severity::Warning => self.warnings.push(entry),
        }
    }

    /// Takes the buffers and timing for report synthesis and resets them.
    /// The status is left unchanged.
    pub fn finish(&mut self) -> SessionSnapshot {
        let snapshot = SessionSnapshot {
            device_id: self.device_id.clone(),
            mode: self.mode,
            therapy_start: self.therapy_start,
            therapy_end: self.therapy_end,
            pause_periods: std::mem::take(&mut self.pause_periods),
            observations: std::mem::take(&mut self.observations),
            errors: std::mem::take(&mut self.errors),
            warnings: std::mem::take(&mut self.warnings),
        };

        self.reset();

        snapshot
    }

    /// Clears timing fields and buffers.
    pub fn reset(&mut self) {
        self.therapy_start = None;
        self.therapy_end = None;
        self.current_pause_start = None;
        self.pause_periods.clear();
        self.observations.clear();
        self.errors.clear();
        self.warnings.clear();
    }

    fn close_pause(&mut self, now: DateTime<Utc>) {
        if let Some(start) = self.current_pause_start.take() {
            self.pause_periods.push(PausePeriod::closed(start, now));
        }
    }
}
