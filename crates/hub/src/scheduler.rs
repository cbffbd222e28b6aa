//! Actuator scheduler: owns the channel table and turns a [`CommandSet`] into
//! timed relay holds without ever opening a reservoir pump and the mister at
//! the same time.
//!
//! ## Per-execute ordering
//!
//! ```text
//! stop mist loop ──▶ mist relay OFF ──▶ reservoir holds (concurrent) ──▶ join all
//!                                                                           │
//!            restart mist loop (fresh cycle) ◀── mist holds (serial) ◀─────┘
//! ```
//!
//! Every hold owns an [`Activation`] guard. The guard switches its relay off
//! when the hold finishes, fails, is aborted or panics, so no exit path can
//! leave a pump running. Claims and releases go through one critical section
//! over the channel table, which is also where cross-group exclusion is
//! enforced.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::channel::{ActuatorChannel, ChannelGroup, ChannelState, CommandSet, MistingPolicy};
use crate::relay::{HardwareError, RelayBoard};

/// How often a running hold re-checks its relay.
const HOLD_POLL: Duration = Duration::from_millis(250);

/// Anything longer is a unit mix-up upstream, not a dose.
const MAX_HOLD_SEC: f64 = 3600.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActuatorError {
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
    #[error("invalid duration {secs}s for channel '{channel}'")]
    InvalidDuration { channel: String, secs: f64 },
    #[error("channel '{channel}' blocked by active '{holder}'")]
    Busy { channel: String, holder: String },
    #[error("hardware fault on '{channel}': {source}")]
    HardwareFault {
        channel: String,
        source: HardwareError,
    },
    #[error("hold task for '{0}' panicked")]
    Panicked(String),
    #[error("relay '{channel}' could not be switched off: {source}")]
    StuckOn {
        channel: String,
        source: HardwareError,
    },
    #[error("scheduler is shut down")]
    ShutDown,
}

impl ActuatorError {
    /// A relay that cannot be switched off leaves no safe way to continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StuckOn { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelOutcome {
    /// Requested 0 seconds; nothing was touched.
    Skipped,
    Completed { held: Duration },
    Failed(ActuatorError),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    pub outcomes: BTreeMap<String, ChannelOutcome>,
    /// Misting was stopped for this execution.
    pub mist_suspended: bool,
}

impl ExecutionReport {
    /// Seconds actually held, per completed channel.
    pub fn held(&self) -> BTreeMap<String, f64> {
        self.outcomes
            .iter()
            .filter_map(|(name, outcome)| match outcome {
                ChannelOutcome::Completed { held } => Some((name.clone(), held.as_secs_f64())),
                _ => None,
            })
            .collect()
    }

    pub fn faults(&self) -> impl Iterator<Item = (&str, &ActuatorError)> {
        self.outcomes.iter().filter_map(|(name, outcome)| match outcome {
            ChannelOutcome::Failed(e) => Some((name.as_str(), e)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSnapshot {
    pub name: String,
    pub group: ChannelGroup,
    pub active: bool,
    pub remaining_sec: Option<f64>,
}

// ---------------------------------------------------------------------------
// Shared internals
// ---------------------------------------------------------------------------

struct MistLoop {
    task: Option<JoinHandle<()>>,
}

struct Inner {
    board: Arc<dyn RelayBoard>,
    table: Mutex<HashMap<String, ActuatorChannel>>,
    mist_channel: Option<String>,
    policy: watch::Sender<Option<MistingPolicy>>,
    /// Held for the whole of `execute`; serializes executions against each
    /// other and against misting changes.
    gate: AsyncMutex<MistLoop>,
    mist_abort: Mutex<Option<AbortHandle>>,
    mist_fault: Mutex<Option<ActuatorError>>,
    /// Reservoir holds of the execution in flight, for `shutdown`.
    holds: Mutex<Vec<AbortHandle>>,
    shutting_down: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn plan(&self, channel: &str, secs: f64) -> Result<Option<(ChannelGroup, Duration)>, ActuatorError> {
        let group = lock(&self.table)
            .get(channel)
            .map(|c| c.group)
            .ok_or_else(|| ActuatorError::UnknownChannel(channel.to_string()))?;
        if !secs.is_finite() || !(0.0..=MAX_HOLD_SEC).contains(&secs) {
            return Err(ActuatorError::InvalidDuration {
                channel: channel.to_string(),
                secs,
            });
        }
        if secs == 0.0 {
            return Ok(None);
        }
        Ok(Some((group, Duration::from_secs_f64(secs))))
    }

    /// Drives `channel` off (one retry) and marks it idle either way.
    fn deactivate(&self, channel: &str) -> Result<(), ActuatorError> {
        let mut table = lock(&self.table);
        let result = self
            .board
            .set(channel, false)
            .or_else(|_| self.board.set(channel, false));
        if let Some(entry) = table.get_mut(channel) {
            entry.state = ChannelState::Idle;
        }
        match result {
            Ok(()) => {
                debug!(channel, "channel off");
                Ok(())
            }
            Err(source) => {
                error!(channel, error = %source, "relay did not switch off");
                Err(ActuatorError::StuckOn {
                    channel: channel.to_string(),
                    source,
                })
            }
        }
    }

    fn channels_in(&self, group: ChannelGroup) -> Vec<String> {
        lock(&self.table)
            .values()
            .filter(|c| c.group == group)
            .map(|c| c.name.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Activation guard
// ---------------------------------------------------------------------------

/// A claimed, switched-on channel. Dropping it switches the relay off.
struct Activation {
    inner: Arc<Inner>,
    channel: String,
    until: Instant,
    released: bool,
}

impl Activation {
    fn claim(inner: &Arc<Inner>, channel: &str, duration: Duration) -> Result<Self, ActuatorError> {
        let mut table = lock(&inner.table);
        if inner.is_shutting_down() {
            return Err(ActuatorError::ShutDown);
        }
        let group = table
            .get(channel)
            .map(|c| c.group)
            .ok_or_else(|| ActuatorError::UnknownChannel(channel.to_string()))?;
        if let Some(holder) = table
            .values()
            .find(|c| c.is_active() && (c.name == channel || c.group.conflicts_with(group)))
        {
            return Err(ActuatorError::Busy {
                channel: channel.to_string(),
                holder: holder.name.clone(),
            });
        }

        if let Err(fault) = inner.board.set(channel, true) {
            // the relay may have half-switched
            if let Err(source) = inner.board.set(channel, false) {
                return Err(ActuatorError::StuckOn {
                    channel: channel.to_string(),
                    source,
                });
            }
            return Err(ActuatorError::HardwareFault {
                channel: channel.to_string(),
                source: fault,
            });
        }

        let until = Instant::now() + duration;
        if let Some(entry) = table.get_mut(channel) {
            entry.state = ChannelState::Active { until };
        }
        debug!(channel, ?duration, "channel on");
        Ok(Self {
            inner: Arc::clone(inner),
            channel: channel.to_string(),
            until,
            released: false,
        })
    }

    fn release(mut self) -> Result<(), ActuatorError> {
        self.released = true;
        self.inner.deactivate(&self.channel)
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.inner.deactivate(&self.channel) {
                error!(channel = %self.channel, error = %e, "abandoned hold could not release relay");
            }
        }
    }
}

/// Holds `channel` on for `duration`, polling the relay while it runs.
async fn hold(inner: Arc<Inner>, channel: String, duration: Duration) -> ChannelOutcome {
    let activation = match Activation::claim(&inner, &channel, duration) {
        Ok(a) => a,
        Err(e) => return ChannelOutcome::Failed(e),
    };

    let deadline = activation.until;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep((deadline - now).min(HOLD_POLL)).await;
        if inner.is_shutting_down() {
            info!(channel = %channel, "hold cut short by shutdown");
            return match activation.release() {
                Ok(()) => ChannelOutcome::Failed(ActuatorError::ShutDown),
                Err(stuck) => ChannelOutcome::Failed(stuck),
            };
        }
        if let Err(fault) = inner.board.verify(&channel) {
            warn!(channel = %channel, error = %fault, "relay fault during hold, forcing off");
            return match activation.release() {
                Ok(()) => ChannelOutcome::Failed(ActuatorError::HardwareFault {
                    channel,
                    source: fault,
                }),
                Err(stuck) => ChannelOutcome::Failed(stuck),
            };
        }
    }

    match activation.release() {
        Ok(()) => ChannelOutcome::Completed { held: duration },
        Err(stuck) => ChannelOutcome::Failed(stuck),
    }
}

/// Reservoir holds spawned for one execution. Dropping the batch aborts
/// whatever is still running, which in turn releases the relays. The holds
/// are also registered with the scheduler so `shutdown` can abort them.
struct HoldBatch {
    inner: Arc<Inner>,
    handles: Vec<(String, JoinHandle<ChannelOutcome>)>,
}

impl HoldBatch {
    fn new(inner: &Arc<Inner>) -> Self {
        Self {
            inner: Arc::clone(inner),
            handles: Vec::new(),
        }
    }

    fn spawn(&mut self, channel: String, duration: Duration) {
        let task = tokio::spawn(hold(Arc::clone(&self.inner), channel.clone(), duration));
        lock(&self.inner.holds).push(task.abort_handle());
        self.handles.push((channel, task));
    }

    async fn join_all(&mut self) -> Vec<(String, ChannelOutcome)> {
        let mut out = Vec::with_capacity(self.handles.len());
        for (channel, handle) in self.handles.iter_mut() {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => {
                    error!(channel = %channel, "hold task panicked");
                    ChannelOutcome::Failed(ActuatorError::Panicked(channel.clone()))
                }
                Err(_) => ChannelOutcome::Failed(ActuatorError::ShutDown),
            };
            out.push((channel.clone(), outcome));
        }
        out
    }
}

impl Drop for HoldBatch {
    fn drop(&mut self) {
        for (_, handle) in &self.handles {
            handle.abort();
        }
        // Executions are serialized by the gate, so every registered hold
        // belongs to this batch.
        lock(&self.inner.holds).clear();
    }
}

async fn mist_loop(
    inner: Arc<Inner>,
    channel: String,
    mut policy: watch::Receiver<Option<MistingPolicy>>,
) {
    loop {
        let current = *policy.borrow_and_update();
        let Some(p) = current else {
            if policy.changed().await.is_err() {
                return;
            }
            continue;
        };

        if let ChannelOutcome::Failed(e) = hold(Arc::clone(&inner), channel.clone(), p.on).await {
            warn!(channel = %channel, error = %e, "mist cycle failed");
            let fatal = e.is_fatal();
            *lock(&inner.mist_fault) = Some(e);
            if fatal {
                return;
            }
        }
        sleep(p.off).await;
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Cheap to clone; every clone drives the same channel table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(board: Arc<dyn RelayBoard>, channels: &[(String, ChannelGroup)]) -> Self {
        let table: HashMap<String, ActuatorChannel> = channels
            .iter()
            .map(|(name, group)| (name.clone(), ActuatorChannel::new(name.clone(), *group)))
            .collect();
        let mist_channel = channels
            .iter()
            .find(|(_, group)| *group == ChannelGroup::Mist)
            .map(|(name, _)| name.clone());
        let (policy, _) = watch::channel(None);

        Self {
            inner: Arc::new(Inner {
                board,
                table: Mutex::new(table),
                mist_channel,
                policy,
                gate: AsyncMutex::new(MistLoop { task: None }),
                mist_abort: Mutex::new(None),
                mist_fault: Mutex::new(None),
                holds: Mutex::new(Vec::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Runs one command set to completion.
    ///
    /// Per-channel problems (unknown name, bad duration, relay fault) are
    /// reported in the returned [`ExecutionReport`] and never abort the other
    /// channels. `Err` means a relay is stuck on or the scheduler was
    /// already shut down; misting stays stopped in that case. Holds cut
    /// short by a concurrent [`shutdown`](Self::shutdown) are reported as
    /// [`ActuatorError::ShutDown`].
    pub async fn execute(&self, commands: CommandSet) -> Result<ExecutionReport, ActuatorError> {
        if self.inner.is_shutting_down() {
            return Err(ActuatorError::ShutDown);
        }

        let mut report = ExecutionReport::default();
        let mut reservoir = Vec::new();
        let mut misting = Vec::new();
        for (channel, secs) in commands {
            match self.inner.plan(&channel, secs) {
                Ok(None) => {
                    report.outcomes.insert(channel, ChannelOutcome::Skipped);
                }
                Ok(Some((ChannelGroup::Reservoir, duration))) => reservoir.push((channel, duration)),
                Ok(Some((ChannelGroup::Mist, duration))) => misting.push((channel, duration)),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "command rejected");
                    report.outcomes.insert(channel, ChannelOutcome::Failed(e));
                }
            }
        }
        if reservoir.is_empty() && misting.is_empty() {
            return Ok(report);
        }

        let mut mist = self.inner.gate.lock().await;
        self.stop_mist_loop(&mut mist).await?;
        report.mist_suspended = true;

        let plan: Vec<(&str, f64)> = reservoir
            .iter()
            .map(|(c, d)| (c.as_str(), d.as_secs_f64()))
            .collect();
        info!(channels = ?plan, "dosing");
        let mut batch = HoldBatch::new(&self.inner);
        for (channel, duration) in reservoir {
            batch.spawn(channel, duration);
        }
        let mut fatal: Option<ActuatorError> = None;
        for (channel, outcome) in batch.join_all().await {
            if let ChannelOutcome::Failed(e) = &outcome {
                if e.is_fatal() {
                    fatal.get_or_insert_with(|| e.clone());
                }
            }
            report.outcomes.insert(channel, outcome);
        }

        if fatal.is_none() {
            for (channel, duration) in misting {
                let outcome = hold(Arc::clone(&self.inner), channel.clone(), duration).await;
                if let ChannelOutcome::Failed(e) = &outcome {
                    if e.is_fatal() {
                        fatal.get_or_insert_with(|| e.clone());
                    }
                }
                report.outcomes.insert(channel, outcome);
            }
        }

        if let Some(e) = fatal {
            error!(error = %e, "execution aborted, misting left stopped");
            return Err(e);
        }
        for (channel, e) in report.faults() {
            warn!(channel, error = %e, "channel did not complete");
        }

        self.start_mist_loop(&mut mist);
        Ok(report)
    }

    /// Installs `policy` as the misting cadence and (re)starts the misting
    /// loop. A running loop picks the new policy up at its next on/off
    /// boundary.
    pub async fn apply_misting(&self, policy: MistingPolicy) {
        let mut mist = self.inner.gate.lock().await;
        let changed = self.inner.policy.send_if_modified(|current| {
            if *current == Some(policy) {
                false
            } else {
                *current = Some(policy);
                true
            }
        });
        if changed {
            info!(
                on_sec = policy.on.as_secs(),
                off_sec = policy.off.as_secs(),
                "misting policy updated"
            );
        }
        self.start_mist_loop(&mut mist);
    }

    /// Reservoir pumps off, misting at `policy`. Used after a failed cycle.
    pub async fn safe_default(&self, policy: MistingPolicy) -> Result<(), ActuatorError> {
        let mut first = None;
        for channel in self.inner.channels_in(ChannelGroup::Reservoir) {
            if let Err(e) = self.inner.deactivate(&channel) {
                first.get_or_insert(e);
            }
        }
        if let Some(e) = first {
            return Err(e);
        }
        self.apply_misting(policy).await;
        Ok(())
    }

    /// Stops everything and refuses further work. Safe to call at any time.
    /// Running holds are aborted rather than awaited; an in-flight
    /// `execute` returns promptly with those channels failed.
    pub fn shutdown(&self) -> Result<(), ActuatorError> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        if let Some(task) = lock(&self.inner.mist_abort).take() {
            task.abort();
        }
        for task in lock(&self.inner.holds).drain(..) {
            task.abort();
        }

        let names: Vec<String> = lock(&self.inner.table).keys().cloned().collect();
        let mut first = None;
        for name in names {
            if let Err(e) = self.inner.deactivate(&name) {
                first.get_or_insert(e);
            }
        }
        info!("scheduler shut down, all channels off");
        first.map_or(Ok(()), Err)
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        let now = Instant::now();
        let mut out: Vec<ChannelSnapshot> = lock(&self.inner.table)
            .values()
            .map(|c| ChannelSnapshot {
                name: c.name.clone(),
                group: c.group,
                active: c.is_active(),
                remaining_sec: match c.state {
                    ChannelState::Active { until } => {
                        Some(until.saturating_duration_since(now).as_secs_f64())
                    }
                    ChannelState::Idle => None,
                },
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn misting_policy(&self) -> Option<MistingPolicy> {
        *self.inner.policy.borrow()
    }

    /// Last failure of the background misting loop, if any.
    pub fn take_mist_fault(&self) -> Option<ActuatorError> {
        lock(&self.inner.mist_fault).take()
    }

    // -- mist loop control (caller holds the gate) -------------------------

    async fn stop_mist_loop(&self, mist: &mut MistLoop) -> Result<(), ActuatorError> {
        if let Some(task) = mist.task.take() {
            task.abort();
            // Cancelled is the expected result
            let _ = task.await;
        }
        lock(&self.inner.mist_abort).take();
        if let Some(channel) = &self.inner.mist_channel {
            self.inner.deactivate(channel)?;
        }
        Ok(())
    }

    fn start_mist_loop(&self, mist: &mut MistLoop) {
        if self.inner.is_shutting_down() {
            return;
        }
        if mist.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let Some(channel) = self.inner.mist_channel.clone() else {
            return;
        };
        if self.inner.policy.borrow().is_none() {
            return;
        }

        let task = tokio::spawn(mist_loop(
            Arc::clone(&self.inner),
            channel,
            self.inner.policy.subscribe(),
        ));
        *lock(&self.inner.mist_abort) = Some(task.abort_handle());
        mist.task = Some(task);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
