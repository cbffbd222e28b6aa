//! Sensor readings and the gateway that serves the freshest one to the
//! control loop.
//!
//! Readings arrive asynchronously (from MQTT in production) and are pushed
//! into a [`ReadingFeed`]. The engine pulls through [`SensorSource::read`],
//! which returns the latest reading if it is still fresh, or waits a bounded
//! time for the next one. [`SensorSource::read_after`] additionally insists
//! the reading arrived after a given instant, so a post-dose check never
//! judges the reservoir by a pre-dose sample.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SensorError {
    #[error("{field} reading {value} is out of range")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("no reading within {0:?}")]
    Timeout(Duration),
    #[error("latest reading is {0:?} old and no newer one arrived")]
    Stale(Duration),
    #[error("sensor transport failed: {0}")]
    Transient(String),
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SensorReading {
    pub ph: f64,
    /// mS/cm
    pub ec: f64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(skip)]
    received: Instant,
}

impl SensorReading {
    /// Validates chemistry and drops non-finite optional fields instead of
    /// carrying sentinels.
    pub fn new(
        ph: f64,
        ec: f64,
        temperature: Option<f64>,
        humidity: Option<f64>,
        timestamp: OffsetDateTime,
    ) -> Result<Self, SensorError> {
        if !ph.is_finite() || !(0.0..=14.0).contains(&ph) {
            return Err(SensorError::OutOfRange {
                field: "ph",
                value: ph,
            });
        }
        if !ec.is_finite() || ec < 0.0 {
            return Err(SensorError::OutOfRange {
                field: "ec",
                value: ec,
            });
        }
        Ok(Self {
            ph,
            ec,
            temperature: temperature.filter(|t| t.is_finite()),
            humidity: humidity.filter(|h| h.is_finite() && (0.0..=100.0).contains(h)),
            timestamp,
            received: Instant::now(),
        })
    }

    pub fn age(&self) -> Duration {
        self.received.elapsed()
    }
}

/// Same measurement, regardless of when it reached this process.
impl PartialEq for SensorReading {
    fn eq(&self, other: &Self) -> bool {
        self.ph == other.ph
            && self.ec == other.ec
            && self.temperature == other.temperature
            && self.humidity == other.humidity
            && self.timestamp == other.timestamp
    }
}

#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn read(&self) -> Result<SensorReading, SensorError>;

    /// Like [`read`](Self::read), but only accepts a reading received after
    /// `since`. Sources that measure on demand satisfy this trivially.
    async fn read_after(&self, _since: Instant) -> Result<SensorReading, SensorError> {
        self.read().await
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Producer half: whoever decodes incoming readings pushes them here.
#[derive(Clone)]
pub struct ReadingFeed {
    tx: Arc<watch::Sender<Option<SensorReading>>>,
}

impl ReadingFeed {
    pub fn push(&self, reading: SensorReading) {
        self.tx.send_replace(Some(reading));
    }
}

/// Consumer half handed to the engine.
pub struct ReadingGateway {
    rx: watch::Receiver<Option<SensorReading>>,
    max_age: Duration,
    read_timeout: Duration,
}

pub fn gateway(max_age: Duration, read_timeout: Duration) -> (ReadingFeed, ReadingGateway) {
    let (tx, rx) = watch::channel(None);
    (
        ReadingFeed { tx: Arc::new(tx) },
        ReadingGateway {
            rx,
            max_age,
            read_timeout,
        },
    )
}

impl ReadingGateway {
    /// Waits until the feed holds a reading that is within `max_age` and,
    /// when `since` is set, was received after it.
    async fn next_fresh(&self, since: Option<Instant>) -> Result<SensorReading, SensorError> {
        let mut rx = self.rx.clone();
        let deadline = Instant::now() + self.read_timeout;
        let mut last = None;

        loop {
            if let Some(reading) = *rx.borrow_and_update() {
                let recent = since.map_or(true, |t| reading.received > t);
                if recent && reading.age() <= self.max_age {
                    return Ok(reading);
                }
                tracing::debug!(age = ?reading.age(), recent, "latest reading is stale, waiting for a new one");
                last = Some(reading);
            }

            match timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(SensorError::Transient("reading feed closed".into())),
                Err(_) => {
                    return Err(match last {
                        Some(reading) => SensorError::Stale(reading.age()),
                        None => SensorError::Timeout(self.read_timeout),
                    })
                }
            }
        }
    }
}

#[async_trait]
impl SensorSource for ReadingGateway {
    async fn read(&self) -> Result<SensorReading, SensorError> {
        self.next_fresh(None).await
    }

    async fn read_after(&self, since: Instant) -> Result<SensorReading, SensorError> {
        self.next_fresh(Some(since)).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
