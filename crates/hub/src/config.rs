//! TOML config file loading and validation: control timing, target band,
//! calibration budget, growth-stage detection, misting cadence and the relay
//! channel map.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::calibration::TargetRange;
use crate::channel::{ChannelGroup, MistingPolicy, MistingTable};
use crate::engine::EngineSettings;
use crate::fuzzy::{Binding, Output};
use crate::growth::{GrowthSettings, GrowthStage};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub control: ControlSection,
    pub target: TargetRange,
    pub calibration: CalibrationSection,
    #[serde(default)]
    pub growth: GrowthSection,
    #[serde(default)]
    pub replenishment: ReplenishmentSection,
    #[serde(default)]
    pub sensor: SensorSection,
    pub misting: MistingSection,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlSection {
    pub cycle_period_sec: u64,
    #[serde(default = "default_deadband")]
    pub deadband_sec: f64,
}

fn default_deadband() -> f64 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationSection {
    pub max_attempts: u32,
    pub settle_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GrowthSection {
    /// External classifier; the image path is appended as last argument.
    /// Without one the stage stays at `initial_stage`.
    pub classifier_cmd: Option<String>,
    pub image_path: String,
    pub poll_interval_min: u64,
    pub classify_timeout_sec: u64,
    pub confirm_timeout_min: u64,
    pub initial_stage: u8,
}

impl Default for GrowthSection {
    fn default() -> Self {
        Self {
            classifier_cmd: None,
            image_path: String::new(),
            poll_interval_min: 360,
            classify_timeout_sec: 60,
            confirm_timeout_min: 30,
            initial_stage: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplenishmentSection {
    /// How long the operator has to top up after being notified.
    pub window_sec: u64,
    /// Periodic replenishment on top of the one after each stage change.
    pub interval_hours: Option<u64>,
}

impl Default for ReplenishmentSection {
    fn default() -> Self {
        Self {
            window_sec: 600,
            interval_hours: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    pub max_age_sec: u64,
    pub read_timeout_sec: u64,
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            max_age_sec: 120,
            read_timeout_sec: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MistingEntry {
    pub on_sec: u64,
    pub off_sec: u64,
}

impl From<MistingEntry> for MistingPolicy {
    fn from(e: MistingEntry) -> Self {
        MistingPolicy::from_secs(e.on_sec, e.off_sec)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MistingSection {
    pub default: MistingEntry,
    pub stage1: MistingEntry,
    pub stage2: MistingEntry,
    pub stage3: MistingEntry,
    /// Floor for the humidity-adjusted off-time.
    #[serde(default = "default_min_off")]
    pub min_off_sec: u64,
}

fn default_min_off() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelEntry {
    pub name: String,
    pub group: ChannelGroup,
    pub gpio_pin: i64,
    /// Hard ceiling on a single hold.
    pub max_sec: f64,
    /// Fuzzy output driving this channel. Mist channels have none.
    pub output: Option<Output>,
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_control(&mut errors);
        self.validate_target(&mut errors);
        self.validate_growth(&mut errors);
        self.validate_misting(&mut errors);
        self.validate_channels(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        if self.control.cycle_period_sec == 0 {
            errors.push("control: cycle_period_sec must be positive".into());
        }
        let deadband = self.control.deadband_sec;
        if !deadband.is_finite() || deadband < 0.0 {
            errors.push(format!(
                "control: deadband_sec must be a non-negative number, got {deadband}"
            ));
        }
        if self.calibration.max_attempts == 0 {
            errors.push("calibration: max_attempts must be positive".into());
        }
        if self.calibration.settle_sec == 0 {
            errors.push("calibration: settle_sec must be positive".into());
        }
        if self.sensor.max_age_sec == 0 {
            errors.push("sensor: max_age_sec must be positive".into());
        }
        if self.sensor.read_timeout_sec == 0 {
            errors.push("sensor: read_timeout_sec must be positive".into());
        }
        if self.replenishment.interval_hours == Some(0) {
            errors.push("replenishment: interval_hours must be positive when set".into());
        }
    }

    fn validate_target(&self, errors: &mut Vec<String>) {
        let t = &self.target;
        for (name, v) in [("ph_min", t.ph_min), ("ph_max", t.ph_max)] {
            if !(0.0..=14.0).contains(&v) {
                errors.push(format!("target: {name} {v} out of range [0, 14]"));
            }
        }
        for (name, v) in [("ec_min", t.ec_min), ("ec_max", t.ec_max)] {
            if !v.is_finite() || v < 0.0 {
                errors.push(format!("target: {name} {v} must be a non-negative number"));
            }
        }
        if t.ph_min >= t.ph_max {
            errors.push(format!(
                "target: ph_min ({}) must be less than ph_max ({})",
                t.ph_min, t.ph_max
            ));
        }
        if t.ec_min >= t.ec_max {
            errors.push(format!(
                "target: ec_min ({}) must be less than ec_max ({})",
                t.ec_min, t.ec_max
            ));
        }
    }

    fn validate_growth(&self, errors: &mut Vec<String>) {
        let g = &self.growth;
        if !(1..=3).contains(&g.initial_stage) {
            errors.push(format!(
                "growth: initial_stage {} must be 1, 2 or 3",
                g.initial_stage
            ));
        }
        let Some(cmd) = &g.classifier_cmd else {
            return;
        };
        if cmd.trim().is_empty() {
            errors.push("growth: classifier_cmd is empty".into());
        }
        if g.image_path.trim().is_empty() {
            errors.push("growth: image_path is required with a classifier".into());
        }
        if g.poll_interval_min == 0 {
            errors.push("growth: poll_interval_min must be positive".into());
        }
        if g.classify_timeout_sec == 0 {
            errors.push("growth: classify_timeout_sec must be positive".into());
        }
        if g.confirm_timeout_min == 0 {
            errors.push("growth: confirm_timeout_min must be positive".into());
        }
    }

    fn validate_misting(&self, errors: &mut Vec<String>) {
        let m = &self.misting;
        if m.min_off_sec == 0 {
            errors.push("misting: min_off_sec must be positive".into());
        }
        // The scheduler refuses holds past the channel ceiling, so an
        // over-long pulse would fail every cycle.
        let ceiling = self
            .channels
            .iter()
            .find(|c| c.group == ChannelGroup::Mist)
            .map(|c| c.max_sec);
        for (name, e) in [
            ("default", m.default),
            ("stage1", m.stage1),
            ("stage2", m.stage2),
            ("stage3", m.stage3),
        ] {
            if e.on_sec == 0 || e.off_sec == 0 {
                errors.push(format!(
                    "misting.{name}: on_sec and off_sec must be positive, got {}/{}",
                    e.on_sec, e.off_sec
                ));
            }
            if let Some(max) = ceiling {
                if e.on_sec as f64 > max {
                    errors.push(format!(
                        "misting.{name}: on_sec {} exceeds the mist channel's max_sec {max}",
                        e.on_sec
                    ));
                }
            }
        }
    }

    fn validate_channels(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();
        let mut mist_channels = 0;

        for (i, c) in self.channels.iter().enumerate() {
            let ctx = || {
                if c.name.is_empty() {
                    format!("channels[{i}]")
                } else {
                    format!("channel '{}'", c.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            if c.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&c.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            // ── Ceiling ─────────────────────────────────────────
            if !c.max_sec.is_finite() || c.max_sec <= 0.0 {
                errors.push(format!(
                    "{}: max_sec must be positive, got {}",
                    ctx(),
                    c.max_sec
                ));
            }

            // ── Group / output pairing ──────────────────────────
            match (c.group, c.output) {
                (ChannelGroup::Mist, None) => mist_channels += 1,
                (ChannelGroup::Mist, Some(o)) => {
                    errors.push(format!("{}: mist channel cannot be bound to {o:?}", ctx()));
                }
                (ChannelGroup::Reservoir, None) => {
                    errors.push(format!("{}: reservoir channel needs an output", ctx()));
                }
                (ChannelGroup::Reservoir, Some(o)) if !o.is_dosing() => {
                    errors.push(format!("{}: {o:?} cannot drive a pump", ctx()));
                }
                (ChannelGroup::Reservoir, Some(_)) => {}
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&c.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    c.gpio_pin
                ));
            } else if !seen_pins.insert(c.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is already used by another channel",
                    ctx(),
                    c.gpio_pin
                ));
            }
        }

        if mist_channels != 1 {
            errors.push(format!(
                "channels: exactly one mist channel is required, found {mist_channels}"
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Views for the runtime
// ---------------------------------------------------------------------------

impl Config {
    pub fn channel_table(&self) -> Vec<(String, ChannelGroup)> {
        self.channels
            .iter()
            .map(|c| (c.name.clone(), c.group))
            .collect()
    }

    /// Only call on a validated config; pins are whitelisted there.
    pub fn gpio_map(&self) -> Vec<(String, u8)> {
        self.channels
            .iter()
            .filter_map(|c| u8::try_from(c.gpio_pin).ok().map(|pin| (c.name.clone(), pin)))
            .collect()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.channels
            .iter()
            .filter_map(|c| {
                c.output.map(|output| Binding {
                    channel: c.name.clone(),
                    output,
                    max_sec: c.max_sec,
                })
            })
            .collect()
    }

    pub fn misting_table(&self) -> MistingTable {
        MistingTable {
            default: self.misting.default.into(),
            stage1: self.misting.stage1.into(),
            stage2: self.misting.stage2.into(),
            stage3: self.misting.stage3.into(),
        }
    }

    pub fn initial_stage(&self) -> GrowthStage {
        GrowthStage::from_number(i64::from(self.growth.initial_stage))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            cycle_period: Duration::from_secs(self.control.cycle_period_sec),
            target: self.target,
            max_attempts: self.calibration.max_attempts,
            misting: self.misting_table(),
            min_mist_off: Duration::from_secs(self.misting.min_off_sec),
            replenish_window: Duration::from_secs(self.replenishment.window_sec),
            replenish_interval: self
                .replenishment
                .interval_hours
                .map(|h| Duration::from_secs(h * 3600)),
        }
    }

    pub fn growth_settings(&self) -> GrowthSettings {
        GrowthSettings {
            image_ref: self.growth.image_path.clone(),
            poll_interval: Duration::from_secs(self.growth.poll_interval_min * 60),
            classify_timeout: Duration::from_secs(self.growth.classify_timeout_sec),
            confirm_timeout: Duration::from_secs(self.growth.confirm_timeout_min * 60),
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
