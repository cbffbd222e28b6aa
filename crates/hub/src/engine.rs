//! The control loop. One cycle:
//!
//! ```text
//! read sensors ─▶ adopt confirmed stage ─▶ replenish | calibrate if out of band ─▶ misting policy ─▶ sleep rest of period
//! ```
//!
//! Cycle starts stay on the period grid; an overrunning cycle is followed
//! immediately by the next one. A failed cycle drives the outputs to the safe
//! default. Only a relay that cannot be switched off ends the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::calibration::{CalibrationError, CalibrationOutcome, Calibrator, TargetRange};
use crate::channel::{CommandSet, MistingPolicy, MistingTable};
use crate::db::{now_unix, Db};
use crate::fuzzy::FuzzyEvaluator;
use crate::growth::GrowthStage;
use crate::scheduler::{ActuatorError, ExecutionReport, Scheduler};
use crate::sensor::{SensorError, SensorReading, SensorSource};
use crate::state::SharedState;
use crate::telemetry::{Telemetry, TelemetryEvent};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub cycle_period: Duration,
    pub target: TargetRange,
    pub max_attempts: u32,
    pub misting: MistingTable,
    /// Floor for the humidity-adjusted off-time.
    pub min_mist_off: Duration,
    pub replenish_window: Duration,
    pub replenish_interval: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("sensor read failed: {0}")]
    Sensor(#[from] SensorError),
    #[error("calibration failed: {0}")]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Actuator(#[from] ActuatorError),
}

impl CycleError {
    /// The actuator error that makes carrying on unsafe, if any.
    pub fn fatal(&self) -> Option<&ActuatorError> {
        let e = match self {
            Self::Actuator(e) | Self::Calibration(CalibrationError::Actuator(e)) => e,
            _ => return None,
        };
        e.is_fatal().then_some(e)
    }
}

/// Everything the engine drives or reports to.
pub struct Collaborators {
    pub sensor: Arc<dyn SensorSource>,
    pub evaluator: FuzzyEvaluator,
    pub scheduler: Scheduler,
    pub calibrator: Arc<Calibrator>,
    pub telemetry: Arc<dyn Telemetry>,
    pub state: SharedState,
}

pub struct Engine {
    settings: EngineSettings,
    sensor: Arc<dyn SensorSource>,
    evaluator: FuzzyEvaluator,
    scheduler: Scheduler,
    calibrator: Arc<Calibrator>,
    telemetry: Arc<dyn Telemetry>,
    state: SharedState,
    db: Option<Db>,
    stage: GrowthStage,
    /// Committed stages from the growth coordinator.
    stage_rx: watch::Receiver<GrowthStage>,
    last_replenished: Instant,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        parts: Collaborators,
        mut stage_rx: watch::Receiver<GrowthStage>,
    ) -> Self {
        let stage = *stage_rx.borrow_and_update();
        Self {
            settings,
            sensor: parts.sensor,
            evaluator: parts.evaluator,
            scheduler: parts.scheduler,
            calibrator: parts.calibrator,
            telemetry: parts.telemetry,
            state: parts.state,
            db: None,
            stage,
            stage_rx,
            last_replenished: Instant::now(),
        }
    }

    pub fn with_db(mut self, db: Db) -> Self {
        self.db = Some(db);
        self
    }

    /// Counts the replenishment interval from `ago` in the past instead of
    /// from startup.
    pub fn replenished_ago(mut self, ago: Duration) -> Self {
        if let Some(at) = Instant::now().checked_sub(ago) {
            self.last_replenished = at;
        }
        self
    }

    pub fn stage(&self) -> GrowthStage {
        self.stage
    }

    /// Runs cycles until `shutdown` flips. In-flight work is abandoned on
    /// shutdown; forcing the relays off is the caller's job.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ActuatorError> {
        let period = self.settings.cycle_period;
        info!(period = ?period, stage = %self.stage, "engine started");
        self.apply_misting(None).await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let started = Instant::now();

            let outcome = tokio::select! {
                outcome = self.run_cycle() => outcome,
                _ = shutdown.changed() => break,
            };

            let ok = outcome.is_ok();
            if let Err(e) = outcome {
                if let Some(fatal) = e.fatal() {
                    error!(error = %fatal, "unrecoverable actuator fault, stopping engine");
                    self.report_fault(fatal.to_string()).await;
                    return Err(fatal.clone());
                }
                self.contain(e).await?;
            }
            if let Some(fault) = self.scheduler.take_mist_fault() {
                if fault.is_fatal() {
                    error!(error = %fault, "mist relay stuck on, stopping engine");
                    self.report_fault(fault.to_string()).await;
                    return Err(fault);
                }
                warn!(error = %fault, "misting cycle failed");
                self.report_fault(fault.to_string()).await;
            }
            self.state.write().await.record_cycle(ok);

            let elapsed = started.elapsed();
            if elapsed >= period {
                warn!(elapsed = ?elapsed, period = ?period, "cycle overran its period");
                continue;
            }
            debug!(elapsed = ?elapsed, "cycle done");
            tokio::select! {
                _ = sleep_until(started + period) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("engine stopped");
        Ok(())
    }

    pub async fn run_cycle(&mut self) -> Result<(), CycleError> {
        let reading = self.sensor.read().await?;
        self.record_reading(&reading).await;

        let mut replenish = None;
        if self.stage_rx.has_changed().unwrap_or(false) {
            let next = *self.stage_rx.borrow_and_update();
            if next != self.stage {
                self.commit_stage(next, reading.humidity).await;
                replenish = Some("stage change");
            }
        }
        if replenish.is_none() {
            if let Some(interval) = self.settings.replenish_interval {
                if self.last_replenished.elapsed() >= interval {
                    replenish = Some("interval");
                }
            }
        }

        if let Some(reason) = replenish {
            self.replenish(reason).await?;
        } else if !self.settings.target.contains(&reading) {
            info!(ph = reading.ph, ec = reading.ec, "reading outside target band, calibrating");
            self.calibrate().await?;
        }

        self.apply_misting(reading.humidity).await;
        Ok(())
    }

    // -- cycle steps -----------------------------------------------------------

    async fn commit_stage(&mut self, next: GrowthStage, humidity: Option<f64>) {
        let from = self.stage;
        self.stage = next;
        info!(%from, to = %next, "adopting growth stage");
        self.state.write().await.record_stage(from, next);
        if let Some(db) = &self.db {
            if let Err(e) = db.insert_stage_transition(now_unix(), from, next).await {
                warn!(error = %e, "failed to store stage transition");
            }
        }
        self.apply_misting(humidity).await;
    }

    /// Asks the operator to top up, waits out the window, then calibrates
    /// whatever the reading says.
    async fn replenish(&mut self, reason: &str) -> Result<(), CycleError> {
        let window = self.settings.replenish_window;
        info!(stage = %self.stage, reason, window = ?window, "nutrient replenishment requested");
        self.telemetry.publish(TelemetryEvent::ReplenishRequested {
            stage: self.stage,
            window_sec: window.as_secs(),
        });
        self.state
            .write()
            .await
            .record_system(format!("replenishment requested ({reason})"));
        if let Some(db) = &self.db {
            if let Err(e) = db.insert_replenishment(now_unix(), self.stage, reason).await {
                warn!(error = %e, "failed to store replenishment");
            }
        }

        sleep(window).await;
        self.last_replenished = Instant::now();
        self.calibrate().await?;
        Ok(())
    }

    async fn calibrate(&self) -> Result<CalibrationOutcome, CycleError> {
        let outcome = self
            .calibrator
            .calibrate(
                |dosed_at| match dosed_at {
                    Some(t) => self.sensor.read_after(t),
                    None => self.sensor.read(),
                },
                |ph, ec| self.evaluator.evaluate(ph, ec),
                |commands| self.execute_and_record(commands),
                self.settings.target,
                self.settings.max_attempts,
            )
            .await?;

        if !outcome.converged() {
            warn!(attempts = outcome.attempts(), "calibration exhausted, continuing with misting only");
        }
        self.state.write().await.record_calibration(&outcome);
        self.telemetry.publish(TelemetryEvent::Calibration {
            converged: outcome.converged(),
            attempts: outcome.attempts(),
        });
        if let Some(db) = &self.db {
            if let Err(e) = db.insert_calibration(now_unix(), &outcome).await {
                warn!(error = %e, "failed to store calibration");
            }
        }
        Ok(outcome)
    }

    async fn execute_and_record(&self, commands: CommandSet) -> Result<ExecutionReport, ActuatorError> {
        let report = self.scheduler.execute(commands).await?;

        let held = report.held();
        let faults: Vec<String> = report
            .faults()
            .map(|(channel, e)| format!("{channel}: {e}"))
            .collect();
        {
            let mut st = self.state.write().await;
            st.record_actuation(&held);
            for fault in &faults {
                st.record_error(fault.clone());
            }
        }
        if !held.is_empty() {
            self.telemetry
                .publish(TelemetryEvent::Actuation { channels: held });
        }
        for detail in faults {
            self.telemetry.publish(TelemetryEvent::Fault { detail });
        }
        if let Some(db) = &self.db {
            if let Err(e) = db.insert_actuations(now_unix(), &report).await {
                warn!(error = %e, "failed to store actuations");
            }
        }
        Ok(report)
    }

    /// Stage cadence with the off-time nudged by humidity.
    fn misting_policy(&self, humidity: Option<f64>) -> MistingPolicy {
        let base = self.settings.misting.for_stage(self.stage);
        let offset = self.evaluator.mist_adjustment(humidity);
        let off = (base.off.as_secs_f64() + offset)
            .round()
            .max(self.settings.min_mist_off.as_secs_f64());
        MistingPolicy {
            on: base.on,
            off: Duration::from_secs_f64(off),
        }
    }

    async fn apply_misting(&self, humidity: Option<f64>) {
        self.scheduler
            .apply_misting(self.misting_policy(humidity))
            .await;
    }

    // -- failure handling ------------------------------------------------------

    /// Logs a failed cycle and falls back to the safe default. Errors only if
    /// even that fails fatally.
    async fn contain(&self, e: CycleError) -> Result<(), ActuatorError> {
        error!(error = %e, "cycle failed, reverting to safe default");
        self.report_fault(e.to_string()).await;
        match self.scheduler.safe_default(self.settings.misting.default).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                error!(error = %e, "safe default unreachable");
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "safe default incomplete");
                Ok(())
            }
        }
    }

    async fn report_fault(&self, detail: String) {
        self.state.write().await.record_error(detail.clone());
        self.telemetry.publish(TelemetryEvent::Fault { detail });
    }

    async fn record_reading(&self, reading: &SensorReading) {
        debug!(ph = reading.ph, ec = reading.ec, humidity = ?reading.humidity, "reading");
        self.state.write().await.record_reading(reading);
        self.telemetry.publish(TelemetryEvent::Reading {
            ph: reading.ph,
            ec: reading.ec,
            temperature: reading.temperature,
            humidity: reading.humidity,
        });
        if let Some(db) = &self.db {
            if let Err(e) = db.insert_reading(reading).await {
                warn!(error = %e, "failed to store reading");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
