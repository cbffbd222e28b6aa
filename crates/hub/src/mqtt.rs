use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::db::now_unix;
use crate::sensor::{SensorError, SensorReading};
use crate::telemetry::{Telemetry, TelemetryEvent};

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// What a sensor node publishes on `tele/<node_id>/reading`.
#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    pub(crate) ts: i64,
    pub(crate) ph: f64,
    pub(crate) ec: f64,
    #[serde(default)]
    pub(crate) temperature: Option<f64>,
    #[serde(default)]
    pub(crate) humidity: Option<f64>,
}

impl ReadingMsg {
    pub(crate) fn into_reading(self) -> Result<SensorReading, SensorError> {
        let timestamp = OffsetDateTime::from_unix_timestamp(self.ts)
            .map_err(|e| SensorError::Transient(format!("bad timestamp {}: {e}", self.ts)))?;
        SensorReading::new(self.ph, self.ec, self.temperature, self.humidity, timestamp)
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    ts: i64,
    #[serde(flatten)]
    event: &'a TelemetryEvent,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract node_id from "tele/<node_id>/reading".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

pub(crate) fn event_topic(tray_id: &str) -> String {
    format!("hydro/{tray_id}/event")
}

pub(crate) fn encode_event(event: &TelemetryEvent) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&Envelope {
        ts: now_unix(),
        event,
    })
}

// ---------------------------------------------------------------------------
// Telemetry sink
// ---------------------------------------------------------------------------

/// Publishes events without waiting on the broker; a full request queue
/// drops the event.
pub struct MqttTelemetry {
    client: AsyncClient,
    topic: String,
}

impl MqttTelemetry {
    pub fn new(client: AsyncClient, tray_id: &str) -> Self {
        Self {
            client,
            topic: event_topic(tray_id),
        }
    }
}

impl Telemetry for MqttTelemetry {
    fn publish(&self, event: TelemetryEvent) {
        let payload = match encode_event(&event) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode telemetry event");
                return;
            }
        };
        if let Err(e) = self
            .client
            .try_publish(&self.topic, QoS::AtMostOnce, false, payload)
        {
            tracing::warn!(topic = %self.topic, error = %e, "telemetry dropped");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
