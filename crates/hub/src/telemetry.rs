//! Outbound operational events. Publishing is fire-and-forget: a slow or
//! absent broker must never stall the control loop.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::growth::GrowthStage;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Reading {
        ph: f64,
        ec: f64,
        temperature: Option<f64>,
        humidity: Option<f64>,
    },
    /// Seconds each channel was actually held.
    Actuation { channels: BTreeMap<String, f64> },
    Calibration { converged: bool, attempts: u32 },
    StageProposed { stage: GrowthStage },
    StageCommitted { from: GrowthStage, to: GrowthStage },
    ReplenishRequested { stage: GrowthStage, window_sec: u64 },
    Fault { detail: String },
}

pub trait Telemetry: Send + Sync {
    fn publish(&self, event: TelemetryEvent);
}
