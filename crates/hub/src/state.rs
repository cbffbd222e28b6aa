use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::calibration::{CalibrationOutcome, CalibrationPhase};
use crate::channel::MistingPolicy;
use crate::confirm::PendingProposal;
use crate::growth::GrowthStage;
use crate::scheduler::ChannelSnapshot;
use crate::sensor::SensorReading;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub stage: GrowthStage,
    pub last_reading: Option<SensorReading>,
    pub last_calibration: Option<CalibrationSummary>,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct CalibrationSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub converged: bool,
    pub attempts: u32,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Actuation,
    Calibration,
    Stage,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub stage: GrowthStage,
    pub pending_stage: Option<PendingProposal>,
    pub calibration_phase: Option<CalibrationPhase>,
    pub misting: Option<MistingPolicy>,
    pub last_reading: Option<SensorReading>,
    pub last_calibration: Option<CalibrationSummary>,
    pub cycles: u64,
    pub failed_cycles: u64,
    pub channels: Vec<ChannelSnapshot>,
    pub events: Vec<SystemEvent>,
}

/// Live pieces of the status that are not kept in `SystemState`.
pub struct LiveStatus {
    pub pending_stage: Option<PendingProposal>,
    pub calibration_phase: Option<CalibrationPhase>,
    pub misting: Option<MistingPolicy>,
    pub channels: Vec<ChannelSnapshot>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(stage: GrowthStage) -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            stage,
            last_reading: None,
            last_calibration: None,
            cycles: 0,
            failed_cycles: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(stage: GrowthStage) -> SharedState {
        Arc::new(RwLock::new(Self::new(stage)))
    }

    /// Record a reservoir reading.
    pub fn record_reading(&mut self, reading: &SensorReading) {
        self.last_reading = Some(*reading);
        let mut detail = format!("ph={:.2} ec={:.2}", reading.ph, reading.ec);
        if let Some(h) = reading.humidity {
            detail.push_str(&format!(" rh={h:.0}%"));
        }
        self.push_event(EventKind::Reading, detail);
    }

    /// Record the channels an execution actually held.
    pub fn record_actuation(&mut self, held: &BTreeMap<String, f64>) {
        if held.is_empty() {
            return;
        }
        let detail = held
            .iter()
            .map(|(channel, secs)| format!("{channel} {secs:.1}s"))
            .collect::<Vec<_>>()
            .join(", ");
        self.push_event(EventKind::Actuation, detail);
    }

    pub fn record_calibration(&mut self, outcome: &CalibrationOutcome) {
        let summary = CalibrationSummary {
            ts: OffsetDateTime::now_utc(),
            converged: outcome.converged(),
            attempts: outcome.attempts(),
        };
        let verdict = if summary.converged {
            "converged"
        } else {
            "exhausted"
        };
        self.push_event(
            EventKind::Calibration,
            format!("{verdict} after {} attempt(s)", summary.attempts),
        );
        self.last_calibration = Some(summary);
    }

    pub fn record_stage(&mut self, from: GrowthStage, to: GrowthStage) {
        self.stage = to;
        self.push_event(EventKind::Stage, format!("{from} -> {to}"));
    }

    /// Record the end of a control cycle.
    pub fn record_cycle(&mut self, ok: bool) {
        self.cycles += 1;
        if !ok {
            self.failed_cycles += 1;
        }
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self, live: LiveStatus) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            stage: self.stage,
            pending_stage: live.pending_stage,
            calibration_phase: live.calibration_phase,
            misting: live.misting,
            last_reading: self.last_reading,
            last_calibration: self.last_calibration.clone(),
            cycles: self.cycles,
            failed_cycles: self.failed_cycles,
            channels: live.channels,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
