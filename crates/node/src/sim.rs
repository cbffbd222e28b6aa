//! Stateful reservoir simulator for local development.
//!
//! Models a small recirculating tray:
//! - pH creeps upward and EC falls as plants take up nutrients
//! - random walk with per-reading probe noise
//! - occasional spikes (probe flakiness)
//! - day/night swing in air temperature and humidity
//! - closed-loop dosing response driven by the hub's actuation events

use std::fmt;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts in band, drifts out within a few hours. Moderate noise.
    Drifting,
    /// Hovers in band with little noise. Good for exercising the UI without
    /// triggering calibration.
    Stable,
    /// High noise and frequent spikes.
    Flaky,
    /// Starts acidic and nutrient-poor, forcing an immediate calibration.
    Acidic,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "acidic" => Self::Acidic,
            _ => Self::Drifting,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drifting => write!(f, "drifting"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Acidic => write!(f, "acidic"),
        }
    }
}

struct Profile {
    start_ph: f64,
    start_ec: f64,
    /// pH rise per sample.
    ph_drift: f64,
    /// EC drop per sample.
    ec_uptake: f64,
    walk_sigma: f64,
    noise_sigma: f64,
    spike_prob: f32,
    spike_sigma: f64,
}

impl Profile {
    fn for_scenario(scenario: Scenario) -> Self {
        let (start_ph, start_ec, ph_drift, ec_uptake, walk_sigma, noise_sigma, spike_prob, spike_sigma) =
            match scenario {
                Scenario::Drifting => (6.0, 2.15, 0.004, 0.003, 0.01, 0.02, 0.03_f32, 0.6),
                Scenario::Stable => (6.0, 2.15, 0.0, 0.0, 0.003, 0.005, 0.0, 0.0),
                Scenario::Flaky => (6.0, 2.15, 0.004, 0.003, 0.03, 0.08, 0.10, 1.2),
                Scenario::Acidic => (5.0, 1.2, 0.001, 0.001, 0.01, 0.02, 0.02, 0.5),
            };
        Self {
            start_ph,
            start_ec,
            ph_drift,
            ec_uptake,
            walk_sigma,
            noise_sigma,
            spike_prob,
            spike_sigma,
        }
    }
}

// ---------------------------------------------------------------------------
// Dosing response
// ---------------------------------------------------------------------------

/// pH units per second of pH up/down pump.
const PH_PER_SEC: f64 = 0.06;
/// mS/cm per second of one nutrient component pump.
const EC_PER_SEC: f64 = 0.025;
/// Fraction of EC diluted per second of fresh water.
const DILUTION_PER_SEC: f64 = 0.01;
/// Fresh water pulls pH toward this.
const WATER_PH: f64 = 7.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub ph: f64,
    pub ec: f64,
    pub temperature: f64,
    pub humidity: f64,
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct ReservoirSim {
    /// "True" chemistry; readings add noise on top.
    ph: f64,
    ec: f64,
    profile: Profile,
    diurnal_period_s: f64,
}

impl ReservoirSim {
    /// `diurnal_period_s` controls the day/night cycle length. Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(scenario: Scenario, diurnal_period_s: f64) -> Self {
        let profile = Profile::for_scenario(scenario);
        Self {
            ph: profile.start_ph,
            ec: profile.start_ec,
            profile,
            diurnal_period_s,
        }
    }

    /// Applies `secs` of pump time on `channel`. Unknown channels (the mister
    /// included) leave the reservoir untouched; returns whether it changed.
    pub fn apply_dose(&mut self, channel: &str, secs: f64) -> bool {
        if !secs.is_finite() || secs <= 0.0 {
            return false;
        }
        match channel {
            "ph_up" => self.ph += PH_PER_SEC * secs,
            "ph_down" => self.ph -= PH_PER_SEC * secs,
            "nutrient_a" | "nutrient_b" => self.ec += EC_PER_SEC * secs,
            "water" => {
                let keep = (1.0 - DILUTION_PER_SEC * secs).max(0.0);
                self.ec *= keep;
                self.ph = WATER_PH + (self.ph - WATER_PH) * keep;
            }
            _ => return false,
        }
        self.clamp();
        true
    }

    fn clamp(&mut self) {
        self.ph = self.ph.clamp(3.0, 10.0);
        self.ec = self.ec.clamp(0.0, 5.0);
    }

    pub fn sample(&mut self) -> Sample {
        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        self.sample_at(now_s)
    }

    /// Advances the chemistry one tick and reads it at wall time `now_s`.
    pub fn sample_at(&mut self, now_s: f64) -> Sample {
        let p = &self.profile;

        // -- Evolve the reservoir -----------------------------------------
        self.ph += p.ph_drift + gaussian(0.0, p.walk_sigma);
        self.ec -= p.ec_uptake + gaussian(0.0, p.walk_sigma * 0.5);
        self.clamp();
        let p = &self.profile;

        // -- Build the instantaneous reading ------------------------------
        let spike = |sigma: f64| {
            if fastrand::f32() < p.spike_prob {
                gaussian(0.0, sigma)
            } else {
                0.0
            }
        };
        let ph = (self.ph + gaussian(0.0, p.noise_sigma) + spike(p.spike_sigma)).clamp(0.0, 14.0);
        let ec = (self.ec + gaussian(0.0, p.noise_sigma) + spike(p.spike_sigma * 0.5)).max(0.0);

        // Peaks at "afternoon": warmer and drier.
        let phase = 2.0 * std::f64::consts::PI * now_s / self.diurnal_period_s;
        let temperature = 22.0 + 3.0 * phase.sin() + gaussian(0.0, 0.2);
        let humidity = (65.0 - 15.0 * phase.sin() + gaussian(0.0, 1.5)).clamp(0.0, 100.0);

        Sample {
            ph,
            ec,
            temperature,
            humidity,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
