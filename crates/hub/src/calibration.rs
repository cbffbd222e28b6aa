//! Closed-loop calibration: sample, evaluate, dose, settle, repeat until the
//! reading is inside the target band or the attempt budget runs out.
//!
//! ```text
//! Sampling ──in band──▶ Converged
//!    │ out of band
//!    ▼
//! Evaluating ──▶ Dosing ──▶ Settling ──▶ Sampling   (attempts += 1)
//! ```
//!
//! A failed sensor read or a rejected evaluation consumes an attempt instead
//! of aborting, so the loop always terminates within `max_attempts`. Once a
//! dose has run, only readings taken after it count. Only one calibration may
//! run at a time.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::channel::CommandSet;
use crate::fuzzy::InvalidInput;
use crate::scheduler::{ActuatorError, ExecutionReport};
use crate::sensor::{SensorError, SensorReading};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetRange {
    pub ph_min: f64,
    pub ph_max: f64,
    pub ec_min: f64,
    pub ec_max: f64,
}

impl TargetRange {
    pub fn contains(&self, reading: &SensorReading) -> bool {
        (self.ph_min..=self.ph_max).contains(&reading.ph)
            && (self.ec_min..=self.ec_max).contains(&reading.ec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPhase {
    Sampling,
    Evaluating,
    Dosing,
    Settling,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationOutcome {
    Converged {
        attempts: u32,
        reading: SensorReading,
    },
    Exhausted {
        attempts: u32,
        last: Option<SensorReading>,
    },
}

impl CalibrationOutcome {
    pub fn converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Converged { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("calibration already in progress")]
    AlreadyCalibrating,
    #[error(transparent)]
    Actuator(#[from] ActuatorError),
}

/// Held for the duration of a calibration, including one that is dropped
/// half way through.
struct Running<'a>(&'a Calibrator);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.enter(None);
        self.0.running.store(false, Ordering::SeqCst);
    }
}

pub struct Calibrator {
    settle: Duration,
    running: AtomicBool,
    phase: watch::Sender<Option<CalibrationPhase>>,
}

impl Calibrator {
    pub fn new(settle: Duration) -> Self {
        let (phase, _) = watch::channel(None);
        Self {
            settle,
            running: AtomicBool::new(false),
            phase,
        }
    }

    /// Current phase, `None` while idle.
    pub fn subscribe(&self) -> watch::Receiver<Option<CalibrationPhase>> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: Option<CalibrationPhase>) {
        self.phase.send_replace(phase);
    }

    /// Drives the reservoir toward `target`.
    ///
    /// `read` samples the sensors, `evaluate` turns a reading into commands
    /// and `execute` runs them. After the first dose `read` is handed the
    /// instant the latest dose finished and must only return a reading
    /// received after it. Only a fatal actuator error (a relay stuck on) is
    /// returned as `Err`; everything else is folded into the outcome.
    pub async fn calibrate<R, RF, E, X, XF>(
        &self,
        mut read: R,
        evaluate: E,
        mut execute: X,
        target: TargetRange,
        max_attempts: u32,
    ) -> Result<CalibrationOutcome, CalibrationError>
    where
        R: FnMut(Option<Instant>) -> RF,
        RF: Future<Output = Result<SensorReading, SensorError>>,
        E: Fn(f64, f64) -> Result<CommandSet, InvalidInput>,
        X: FnMut(CommandSet) -> XF,
        XF: Future<Output = Result<ExecutionReport, ActuatorError>>,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CalibrationError::AlreadyCalibrating);
        }
        let _running = Running(self);

        self.run(&mut read, &evaluate, &mut execute, target, max_attempts)
            .await
    }

    async fn run<R, RF, E, X, XF>(
        &self,
        read: &mut R,
        evaluate: &E,
        execute: &mut X,
        target: TargetRange,
        max_attempts: u32,
    ) -> Result<CalibrationOutcome, CalibrationError>
    where
        R: FnMut(Option<Instant>) -> RF,
        RF: Future<Output = Result<SensorReading, SensorError>>,
        E: Fn(f64, f64) -> Result<CommandSet, InvalidInput>,
        X: FnMut(CommandSet) -> XF,
        XF: Future<Output = Result<ExecutionReport, ActuatorError>>,
    {
        let mut attempts = 0;
        let mut last = None;
        let mut dosed_at = None;

        loop {
            self.enter(Some(CalibrationPhase::Sampling));
            let reading = match read(dosed_at).await {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(attempt = attempts + 1, error = %e, "calibration sample failed");
                    None
                }
            };

            if let Some(r) = reading {
                last = Some(r);
                if target.contains(&r) {
                    info!(attempts, ph = r.ph, ec = r.ec, "calibration converged");
                    return Ok(CalibrationOutcome::Converged {
                        attempts,
                        reading: r,
                    });
                }
            }

            if attempts >= max_attempts {
                warn!(attempts, ?last, "calibration gave up before reaching target");
                return Ok(CalibrationOutcome::Exhausted { attempts, last });
            }
            attempts += 1;

            let Some(r) = reading else {
                continue;
            };

            self.enter(Some(CalibrationPhase::Evaluating));
            let commands = match evaluate(r.ph, r.ec) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "calibration evaluation rejected reading");
                    continue;
                }
            };

            info!(attempt = attempts, ph = r.ph, ec = r.ec, ?commands, "calibration dose");
            self.enter(Some(CalibrationPhase::Dosing));
            execute(commands).await?;
            dosed_at = Some(Instant::now());

            self.enter(Some(CalibrationPhase::Settling));
            tokio::time::sleep(self.settle).await;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::HardwareError;
    use crate::sensor::SensorSource;
    use crate::testing::{reading, FakeSensor};
    use std::future::{ready, Ready};
    use crate::sensor::{gateway, ReadingGateway};
    use std::sync::Mutex;

    const TARGET: TargetRange = TargetRange {
        ph_min: 5.8,
        ph_max: 6.2,
        ec_min: 2.0,
        ec_max: 2.3,
    };

    fn calibrator() -> Calibrator {
        Calibrator::new(Duration::from_secs(60))
    }

    fn done() -> Ready<Result<ExecutionReport, ActuatorError>> {
        ready(Ok(ExecutionReport::default()))
    }

    fn evaluate(ph: f64, _ec: f64) -> Result<CommandSet, InvalidInput> {
        Ok(CommandSet::new().with("ph_down", if ph > 6.2 { 3.0 } else { 0.0 }))
    }

    // -- TargetRange ----------------------------------------------------------

    #[test]
    fn target_bounds_are_inclusive() {
        assert!(TARGET.contains(&reading(5.8, 2.0)));
        assert!(TARGET.contains(&reading(6.2, 2.3)));
        assert!(!TARGET.contains(&reading(6.25, 2.1)));
        assert!(!TARGET.contains(&reading(6.0, 1.9)));
    }

    // -- calibrate --------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn in_range_converges_without_dosing() {
        let sensor = FakeSensor::steady(6.0, 2.1);
        let executed = Mutex::new(0);
        let outcome = calibrator()
            .calibrate(
                |_| sensor.read(),
                evaluate,
                |_| {
                    *executed.lock().unwrap() += 1;
                    done()
                },
                TARGET,
                5,
            )
            .await
            .unwrap();

        assert!(outcome.converged());
        assert_eq!(outcome.attempts(), 0);
        assert_eq!(*executed.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn doses_and_settles_until_in_range() {
        let sensor = FakeSensor::scripted([
            Ok(reading(6.8, 2.1)),
            Ok(reading(6.5, 2.1)),
            Ok(reading(6.1, 2.1)),
        ]);
        let doses = Mutex::new(Vec::new());
        let started = Instant::now();

        let outcome = calibrator()
            .calibrate(
                |_| sensor.read(),
                evaluate,
                |cmds| {
                    doses.lock().unwrap().push(cmds);
                    done()
                },
                TARGET,
                5,
            )
            .await
            .unwrap();

        assert_eq!(outcome.attempts(), 2);
        assert!(outcome.converged());
        assert_eq!(doses.lock().unwrap().len(), 2);
        assert!(started.elapsed() >= Duration::from_secs(120), "settled after each dose");
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_attempt_budget() {
        let sensor = FakeSensor::steady(7.5, 2.1);
        let doses = Mutex::new(0u32);
        let outcome = calibrator()
            .calibrate(
                |_| sensor.read(),
                evaluate,
                |_| {
                    *doses.lock().unwrap() += 1;
                    done()
                },
                TARGET,
                3,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CalibrationOutcome::Exhausted {
                attempts: 3,
                last: Some(reading(7.5, 2.1)),
            }
        );
        assert_eq!(*doses.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_failure_consumes_an_attempt() {
        let sensor = FakeSensor::scripted([
            Err(SensorError::Transient("i2c nack".into())),
            Ok(reading(6.0, 2.1)),
        ]);
        let outcome = calibrator()
            .calibrate(
                |_| sensor.read(),
                evaluate,
                |_| done(),
                TARGET,
                3,
            )
            .await
            .unwrap();
        assert_eq!(outcome.attempts(), 1);
        assert!(outcome.converged());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_sensor_still_terminates() {
        let sensor = FakeSensor::scripted([Err(SensorError::Transient("gone".into()))]);
        let outcome = calibrator()
            .calibrate(
                |_| sensor.read(),
                evaluate,
                |_| done(),
                TARGET,
                4,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CalibrationOutcome::Exhausted {
                attempts: 4,
                last: None
            }
        );
        assert_eq!(sensor.reads().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_relay_aborts() {
        let sensor = FakeSensor::steady(7.0, 2.1);
        let err = calibrator()
            .calibrate(
                |_| sensor.read(),
                evaluate,
                |_| {
                    ready(Err(ActuatorError::StuckOn {
                        channel: "ph_down".into(),
                        source: HardwareError::NotWired("ph_down".into()),
                    }))
                },
                TARGET,
                3,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CalibrationError::Actuator(ActuatorError::StuckOn { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_calibration_is_refused() {
        let cal = calibrator();
        let sensor = FakeSensor::steady(7.0, 2.1);

        let first = cal.calibrate(
            |_| sensor.read(),
            evaluate,
            |_| done(),
            TARGET,
            2,
        );
        let second = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cal.calibrate(
                |_| sensor.read(),
                evaluate,
                |_| done(),
                TARGET,
                2,
            )
            .await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_ok());
        assert_eq!(second, Err(CalibrationError::AlreadyCalibrating));
    }

    #[tokio::test(start_paused = true)]
    async fn phase_is_published_and_cleared() {
        let cal = calibrator();
        let phases = cal.subscribe();
        let sensor = FakeSensor::steady(7.0, 2.1);

        let run = cal.calibrate(
            |_| sensor.read(),
            evaluate,
            |_| done(),
            TARGET,
            1,
        );
        let peek = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            *phases.borrow()
        };
        let (outcome, mid) = tokio::join!(run, peek);

        assert!(!outcome.unwrap().converged());
        assert_eq!(mid, Some(CalibrationPhase::Settling));
        assert_eq!(*phases.borrow(), None);

        // the guard was released
        let again = cal
            .calibrate(
                |_| sensor.read(),
                evaluate,
                |_| done(),
                TARGET,
                0,
            )
            .await;
        assert!(again.is_ok());
    }

    // -- against the reading gateway -------------------------------------------

    async fn sample(
        gw: &ReadingGateway,
        dosed_at: Option<Instant>,
    ) -> Result<SensorReading, SensorError> {
        match dosed_at {
            Some(t) => gw.read_after(t).await,
            None => gw.read().await,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pre_dose_reading_is_not_dosed_again() {
        let (feed, gw) = gateway(Duration::from_secs(600), Duration::from_secs(30));
        feed.push(reading(6.8, 2.1));
        let doses = Mutex::new(0u32);

        let outcome = calibrator()
            .calibrate(
                |since| sample(&gw, since),
                evaluate,
                |_| {
                    *doses.lock().unwrap() += 1;
                    done()
                },
                TARGET,
                3,
            )
            .await
            .unwrap();

        // The node went quiet after the first dose: every later sample
        // fails rather than re-reading the pre-dose value.
        assert_eq!(*doses.lock().unwrap(), 1);
        assert_eq!(
            outcome,
            CalibrationOutcome::Exhausted {
                attempts: 3,
                last: Some(reading(6.8, 2.1)),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn post_dose_reading_converges() {
        let (feed, gw) = gateway(Duration::from_secs(600), Duration::from_secs(30));
        feed.push(reading(6.8, 2.1));
        let pusher = feed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            pusher.push(reading(6.1, 2.1));
        });

        let outcome = calibrator()
            .calibrate(
                |since| sample(&gw, since),
                evaluate,
                |_| done(),
                TARGET,
                3,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CalibrationOutcome::Converged {
                attempts: 1,
                reading: reading(6.1, 2.1),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_calibration_clears_phase() {
        let cal = calibrator();
        let phases = cal.subscribe();
        let sensor = FakeSensor::steady(7.0, 2.1);

        let cut_short = tokio::time::timeout(
            Duration::from_secs(10),
            cal.calibrate(
                |_| sensor.read(),
                evaluate,
                |_| done(),
                TARGET,
                3,
            ),
        )
        .await;
        assert!(cut_short.is_err(), "still settling when the timer fired");
        assert_eq!(*phases.borrow(), None);

        let again = cal
            .calibrate(
                |_| sensor.read(),
                evaluate,
                |_| done(),
                TARGET,
                0,
            )
            .await;
        assert!(again.is_ok());
    }
}
