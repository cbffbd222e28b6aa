//! In-memory stand-ins for hardware and external collaborators, shared by the
//! unit tests of several modules.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::channel::ChannelGroup;
use crate::growth::{Classifier, ClassifierError, Confirmation, Confirmer, GrowthStage};
use crate::relay::{HardwareError, RelayBoard};
use crate::sensor::{SensorError, SensorReading, SensorSource};
use crate::telemetry::{Telemetry, TelemetryEvent};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn standard_channels() -> Vec<(String, ChannelGroup)> {
    [
        ("ph_up", ChannelGroup::Reservoir),
        ("ph_down", ChannelGroup::Reservoir),
        ("nutrient_a", ChannelGroup::Reservoir),
        ("nutrient_b", ChannelGroup::Reservoir),
        ("water", ChannelGroup::Reservoir),
        ("mist", ChannelGroup::Mist),
    ]
    .into_iter()
    .map(|(name, group)| (name.to_string(), group))
    .collect()
}

pub(crate) fn reading(ph: f64, ec: f64) -> SensorReading {
    SensorReading::new(ph, ec, Some(22.0), Some(50.0), OffsetDateTime::UNIX_EPOCH).unwrap()
}

// ---------------------------------------------------------------------------
// Relay board
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BoardState {
    on: HashSet<String>,
    log: Vec<(String, bool)>,
    violations: Vec<String>,
    fail_activation: HashSet<String>,
    stuck: HashSet<String>,
    panic_on: HashSet<String>,
    verify_budget: HashMap<String, usize>,
    panic_verify: HashMap<String, usize>,
}

/// Records every relay change and flags any moment where channels of
/// different groups are on together.
pub(crate) struct FakeBoard {
    groups: HashMap<String, ChannelGroup>,
    state: Mutex<BoardState>,
}

impl FakeBoard {
    pub(crate) fn new(channels: &[(String, ChannelGroup)]) -> Arc<Self> {
        Arc::new(Self {
            groups: channels.iter().cloned().collect(),
            state: Mutex::new(BoardState::default()),
        })
    }

    pub(crate) fn fail_activation(&self, channel: &str) {
        lock(&self.state).fail_activation.insert(channel.into());
    }

    /// `set(channel, false)` always fails from now on.
    pub(crate) fn stick(&self, channel: &str) {
        lock(&self.state).stuck.insert(channel.into());
    }

    pub(crate) fn panic_on(&self, channel: &str) {
        lock(&self.state).panic_on.insert(channel.into());
    }

    /// `verify` passes `n` times, then reports a fault.
    pub(crate) fn fail_verify_after(&self, channel: &str, n: usize) {
        lock(&self.state).verify_budget.insert(channel.into(), n);
    }

    /// `verify` passes `n` times, then the driver panics.
    pub(crate) fn panic_verify_after(&self, channel: &str, n: usize) {
        lock(&self.state).panic_verify.insert(channel.into(), n);
    }

    pub(crate) fn is_on(&self, channel: &str) -> bool {
        lock(&self.state).on.contains(channel)
    }

    pub(crate) fn log(&self) -> Vec<(String, bool)> {
        lock(&self.state).log.clone()
    }

    pub(crate) fn violations(&self) -> Vec<String> {
        lock(&self.state).violations.clone()
    }

    fn fault(channel: &str, reason: &str) -> HardwareError {
        HardwareError::Fault {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

impl RelayBoard for FakeBoard {
    fn set(&self, channel: &str, active: bool) -> Result<(), HardwareError> {
        let group = *self
            .groups
            .get(channel)
            .ok_or_else(|| HardwareError::NotWired(channel.into()))?;
        if lock(&self.state).panic_on.contains(channel) {
            panic!("relay driver crashed on {channel}");
        }

        let mut st = lock(&self.state);
        if active && st.fail_activation.contains(channel) {
            return Err(Self::fault(channel, "coil open"));
        }
        if !active && st.stuck.contains(channel) {
            return Err(Self::fault(channel, "contacts welded"));
        }

        st.log.push((channel.to_string(), active));
        if active {
            let clashes: Vec<String> = st
                .on
                .iter()
                .filter(|other| self.groups.get(*other) != Some(&group))
                .map(|other| format!("{channel} opened while {other} open"))
                .collect();
            st.violations.extend(clashes);
            st.on.insert(channel.to_string());
        } else {
            st.on.remove(channel);
        }
        Ok(())
    }

    fn verify(&self, channel: &str) -> Result<(), HardwareError> {
        let mut st = lock(&self.state);
        let crash = match st.panic_verify.get_mut(channel) {
            Some(0) => true,
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        };
        if crash {
            // unlocked so the unwinding hold can still switch the relay off
            drop(st);
            panic!("relay readback crashed on {channel}");
        }
        match st.verify_budget.get_mut(channel) {
            Some(0) => Err(Self::fault(channel, "readback mismatch")),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

/// Serves scripted results in order, repeating the last one forever.
pub(crate) struct FakeSensor {
    script: Mutex<VecDeque<Result<SensorReading, SensorError>>>,
    last: Mutex<Option<Result<SensorReading, SensorError>>>,
    reads: Mutex<Vec<Instant>>,
}

impl FakeSensor {
    pub(crate) fn scripted(
        script: impl IntoIterator<Item = Result<SensorReading, SensorError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(None),
            reads: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn steady(ph: f64, ec: f64) -> Arc<Self> {
        Self::scripted([Ok(reading(ph, ec))])
    }

    /// When each read happened.
    pub(crate) fn reads(&self) -> Vec<Instant> {
        lock(&self.reads).clone()
    }
}

#[async_trait]
impl SensorSource for FakeSensor {
    async fn read(&self) -> Result<SensorReading, SensorError> {
        lock(&self.reads).push(Instant::now());
        let next = lock(&self.script).pop_front();
        let mut last = lock(&self.last);
        if let Some(next) = next {
            *last = Some(next);
        }
        last.clone()
            .unwrap_or_else(|| Err(SensorError::Transient("empty script".into())))
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<TelemetryEvent> {
        lock(&self.events).clone()
    }
}

impl Telemetry for RecordingTelemetry {
    fn publish(&self, event: TelemetryEvent) {
        lock(&self.events).push(event);
    }
}

// ---------------------------------------------------------------------------
// Growth-stage collaborators
// ---------------------------------------------------------------------------

pub(crate) struct FakeClassifier {
    result: Result<GrowthStage, ClassifierError>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl FakeClassifier {
    pub(crate) fn returning(result: Result<GrowthStage, ClassifierError>) -> Arc<Self> {
        Arc::new(Self {
            result,
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *lock(&self.delay) = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn classify(&self, _image_ref: &str) -> Result<GrowthStage, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        tokio::time::sleep(delay).await;
        self.result.clone()
    }
}

pub(crate) struct FakeConfirmer {
    answer: Option<Confirmation>,
    requests: Mutex<Vec<GrowthStage>>,
}

impl FakeConfirmer {
    pub(crate) fn answering(answer: Confirmation) -> Arc<Self> {
        Arc::new(Self {
            answer: Some(answer),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Never answers.
    pub(crate) fn silent() -> Arc<Self> {
        Arc::new(Self {
            answer: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn requests(&self) -> Vec<GrowthStage> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl Confirmer for FakeConfirmer {
    async fn request_confirmation(&self, proposed: GrowthStage) -> Confirmation {
        lock(&self.requests).push(proposed);
        match self.answer {
            Some(answer) => answer,
            None => std::future::pending().await,
        }
    }
}
