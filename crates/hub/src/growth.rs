//! Growth-stage detection with operator confirmation.
//!
//! ## Transition rules
//!
//! ```text
//!   poll (rate-limited) ──▶ classify (bounded) ──▶ detected ∈ {2, 3} and ≠ current?
//!                                                     │ no ─────────────▶ keep current
//!                                                     │ yes
//!                                                     ▼
//!                                   request confirmation (bounded)
//!                       Confirmed(same stage) ─▶ commit   anything else ─▶ keep current
//! ```
//!
//! The coordinator runs in its own task so a slow classifier or an absent
//! operator never stretches a control cycle. Committed stages are published
//! on a `watch` channel the engine reads between cycles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::telemetry::{Telemetry, TelemetryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthStage {
    Stage1,
    Stage2,
    Stage3,
    Unknown,
}

impl GrowthStage {
    pub fn from_number(n: i64) -> Self {
        match n {
            1 => Self::Stage1,
            2 => Self::Stage2,
            3 => Self::Stage3,
            _ => Self::Unknown,
        }
    }

    pub fn number(self) -> Option<u8> {
        match self {
            Self::Stage1 => Some(1),
            Self::Stage2 => Some(2),
            Self::Stage3 => Some(3),
            Self::Unknown => None,
        }
    }

    /// Only later stages are ever proposed by detection; stage 1 is where
    /// every grow starts.
    pub fn is_detectable(self) -> bool {
        matches!(self, Self::Stage2 | Self::Stage3)
    }
}

impl fmt::Display for GrowthStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.number() {
            Some(n) => write!(f, "stage {n}"),
            None => write!(f, "unknown"),
        }
    }
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image_ref: &str) -> Result<GrowthStage, ClassifierError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed(GrowthStage),
    Rejected,
    TimedOut,
}

/// Asks a human to approve a proposed stage. Callers bound the wait; an
/// implementation may block until answered.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn request_confirmation(&self, proposed: GrowthStage) -> Confirmation;
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GrowthSettings {
    pub image_ref: String,
    pub poll_interval: Duration,
    pub classify_timeout: Duration,
    pub confirm_timeout: Duration,
}

pub struct GrowthCoordinator {
    classifier: Arc<dyn Classifier>,
    confirmer: Arc<dyn Confirmer>,
    telemetry: Arc<dyn Telemetry>,
    settings: GrowthSettings,
    last_poll: Option<Instant>,
}

impl GrowthCoordinator {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        confirmer: Arc<dyn Confirmer>,
        telemetry: Arc<dyn Telemetry>,
        settings: GrowthSettings,
    ) -> Self {
        Self {
            classifier,
            confirmer,
            telemetry,
            settings,
            last_poll: None,
        }
    }

    /// Returns the stage to use from now on. Any failure along the way keeps
    /// `current`.
    pub async fn poll_and_maybe_transition(&mut self, current: GrowthStage) -> GrowthStage {
        let now = Instant::now();
        if let Some(last) = self.last_poll {
            if now.duration_since(last) < self.settings.poll_interval {
                return current;
            }
        }
        self.last_poll = Some(now);

        let classified = timeout(
            self.settings.classify_timeout,
            self.classifier.classify(&self.settings.image_ref),
        )
        .await;
        let detected = match classified {
            Ok(Ok(stage)) => stage,
            Ok(Err(e)) => {
                warn!(error = %e, "stage classification failed");
                return current;
            }
            Err(_) => {
                warn!(
                    timeout = ?self.settings.classify_timeout,
                    "stage classification timed out"
                );
                return current;
            }
        };

        if detected == current || !detected.is_detectable() {
            debug!(%current, %detected, "no stage transition");
            return current;
        }

        info!(%current, proposed = %detected, "stage transition proposed, awaiting operator");
        self.telemetry
            .publish(TelemetryEvent::StageProposed { stage: detected });

        let answer = timeout(
            self.settings.confirm_timeout,
            self.confirmer.request_confirmation(detected),
        )
        .await
        .unwrap_or(Confirmation::TimedOut);

        match answer {
            Confirmation::Confirmed(stage) if stage == detected => {
                info!(from = %current, to = %stage, "stage transition confirmed");
                self.telemetry.publish(TelemetryEvent::StageCommitted {
                    from: current,
                    to: stage,
                });
                stage
            }
            Confirmation::Confirmed(other) => {
                warn!(proposed = %detected, confirmed = %other, "confirmation does not match proposal, ignoring");
                current
            }
            Confirmation::Rejected => {
                info!(proposed = %detected, "stage transition rejected by operator");
                current
            }
            Confirmation::TimedOut => {
                warn!(proposed = %detected, "stage confirmation timed out");
                current
            }
        }
    }

    /// Polls on a fixed interval until `shutdown` flips, publishing every
    /// committed stage on `stage_tx`.
    pub async fn run(
        mut self,
        mut stage: GrowthStage,
        stage_tx: watch::Sender<GrowthStage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.settings.poll_interval, %stage, "growth coordinator started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let next = tokio::select! {
                next = self.poll_and_maybe_transition(stage) => next,
                _ = shutdown.changed() => break,
            };
            if next != stage {
                stage = next;
                stage_tx.send_replace(stage);
            }
        }
        info!("growth coordinator stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeClassifier, FakeConfirmer, RecordingTelemetry};

    fn settings() -> GrowthSettings {
        GrowthSettings {
            image_ref: "/tmp/tray.jpg".into(),
            poll_interval: Duration::from_secs(3600),
            classify_timeout: Duration::from_secs(30),
            confirm_timeout: Duration::from_secs(600),
        }
    }

    fn coordinator(
        classifier: Arc<FakeClassifier>,
        confirmer: Arc<FakeConfirmer>,
        telemetry: Arc<RecordingTelemetry>,
    ) -> GrowthCoordinator {
        GrowthCoordinator::new(classifier, confirmer, telemetry, settings())
    }

    // -- GrowthStage -----------------------------------------------------------

    #[test]
    fn stage_numbers_round_trip() {
        for n in 1..=3 {
            assert_eq!(GrowthStage::from_number(n).number(), Some(n as u8));
        }
        assert_eq!(GrowthStage::from_number(7), GrowthStage::Unknown);
        assert_eq!(GrowthStage::Unknown.number(), None);
    }

    #[test]
    fn only_later_stages_are_detectable() {
        assert!(!GrowthStage::Stage1.is_detectable());
        assert!(GrowthStage::Stage2.is_detectable());
        assert!(GrowthStage::Stage3.is_detectable());
        assert!(!GrowthStage::Unknown.is_detectable());
    }

    #[test]
    fn display() {
        assert_eq!(GrowthStage::Stage2.to_string(), "stage 2");
        assert_eq!(GrowthStage::Unknown.to_string(), "unknown");
    }

    // -- poll_and_maybe_transition --------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn confirmed_detection_commits() {
        let classifier = FakeClassifier::returning(Ok(GrowthStage::Stage3));
        let confirmer = FakeConfirmer::answering(Confirmation::Confirmed(GrowthStage::Stage3));
        let telemetry = RecordingTelemetry::new();
        let mut c = coordinator(classifier, confirmer.clone(), telemetry.clone());

        let next = c.poll_and_maybe_transition(GrowthStage::Stage2).await;
        assert_eq!(next, GrowthStage::Stage3);
        assert_eq!(confirmer.requests(), vec![GrowthStage::Stage3]);
        assert!(telemetry.events().contains(&TelemetryEvent::StageCommitted {
            from: GrowthStage::Stage2,
            to: GrowthStage::Stage3,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_confirmation_keeps_current_stage() {
        let classifier = FakeClassifier::returning(Ok(GrowthStage::Stage3));
        let confirmer = FakeConfirmer::silent();
        let mut c = coordinator(classifier, confirmer, RecordingTelemetry::new());

        let started = Instant::now();
        let next = c.poll_and_maybe_transition(GrowthStage::Stage2).await;
        assert_eq!(next, GrowthStage::Stage2);
        assert!(started.elapsed() >= Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_keeps_current_stage() {
        let classifier = FakeClassifier::returning(Ok(GrowthStage::Stage2));
        let confirmer = FakeConfirmer::answering(Confirmation::Rejected);
        let mut c = coordinator(classifier, confirmer, RecordingTelemetry::new());
        assert_eq!(
            c.poll_and_maybe_transition(GrowthStage::Stage1).await,
            GrowthStage::Stage1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_confirmation_is_ignored() {
        let classifier = FakeClassifier::returning(Ok(GrowthStage::Stage3));
        let confirmer = FakeConfirmer::answering(Confirmation::Confirmed(GrowthStage::Stage2));
        let mut c = coordinator(classifier, confirmer, RecordingTelemetry::new());
        assert_eq!(
            c.poll_and_maybe_transition(GrowthStage::Stage1).await,
            GrowthStage::Stage1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn same_or_undetectable_stage_skips_confirmation() {
        for detected in [GrowthStage::Stage2, GrowthStage::Stage1, GrowthStage::Unknown] {
            let classifier = FakeClassifier::returning(Ok(detected));
            let confirmer = FakeConfirmer::answering(Confirmation::Confirmed(detected));
            let mut c = coordinator(classifier, confirmer.clone(), RecordingTelemetry::new());
            assert_eq!(
                c.poll_and_maybe_transition(GrowthStage::Stage2).await,
                GrowthStage::Stage2
            );
            assert!(confirmer.requests().is_empty(), "asked for {detected}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_failure_keeps_current_stage() {
        let classifier =
            FakeClassifier::returning(Err(ClassifierError::Unavailable("no camera".into())));
        let confirmer = FakeConfirmer::answering(Confirmation::Confirmed(GrowthStage::Stage3));
        let mut c = coordinator(classifier, confirmer.clone(), RecordingTelemetry::new());
        assert_eq!(
            c.poll_and_maybe_transition(GrowthStage::Stage2).await,
            GrowthStage::Stage2
        );
        assert!(confirmer.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_classifier_is_bounded() {
        let classifier = FakeClassifier::returning(Ok(GrowthStage::Stage3))
            .with_delay(Duration::from_secs(3600));
        let confirmer = FakeConfirmer::answering(Confirmation::Confirmed(GrowthStage::Stage3));
        let mut c = coordinator(classifier, confirmer.clone(), RecordingTelemetry::new());

        let started = Instant::now();
        assert_eq!(
            c.poll_and_maybe_transition(GrowthStage::Stage2).await,
            GrowthStage::Stage2
        );
        assert!(started.elapsed() < Duration::from_secs(60));
        assert!(confirmer.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn polls_are_rate_limited() {
        let classifier = FakeClassifier::returning(Ok(GrowthStage::Stage2));
        let mut c = coordinator(
            classifier.clone(),
            FakeConfirmer::answering(Confirmation::Rejected),
            RecordingTelemetry::new(),
        );

        c.poll_and_maybe_transition(GrowthStage::Stage1).await;
        c.poll_and_maybe_transition(GrowthStage::Stage1).await;
        assert_eq!(classifier.calls(), 1);

        tokio::time::advance(Duration::from_secs(3600)).await;
        c.poll_and_maybe_transition(GrowthStage::Stage1).await;
        assert_eq!(classifier.calls(), 2);
    }

    // -- run -------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn run_publishes_committed_stage_and_stops_on_shutdown() {
        let classifier = FakeClassifier::returning(Ok(GrowthStage::Stage2));
        let confirmer = FakeConfirmer::answering(Confirmation::Confirmed(GrowthStage::Stage2));
        let c = coordinator(classifier, confirmer, RecordingTelemetry::new());

        let (stage_tx, mut stage_rx) = watch::channel(GrowthStage::Stage1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(c.run(GrowthStage::Stage1, stage_tx, shutdown_rx));

        stage_rx.changed().await.unwrap();
        assert_eq!(*stage_rx.borrow(), GrowthStage::Stage2);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
