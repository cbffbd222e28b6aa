//! ADS1115 16-bit ADC driver over I2C for the reservoir probes.
//!
//! Reads single-ended channels at PGA ±4.096 V, 128 SPS, single-shot mode.
//! One input carries an analog pH probe board, another a TDS probe board.
//! Each probe is sampled several times per reading and the extremes are
//! dropped before averaging.

use rppal::i2c::I2c;
use std::{thread, time::Duration};

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS      : write 1 to start single-shot conversion
//   [14:12] MUX     : input multiplexer (channel selection)
//   [11:9]  PGA     : programmable gain amplifier
//   [8]     MODE    : 0 = continuous, 1 = single-shot
//   [7:5]   DR      : data rate
//   [1:0]   COMP_QUE: 11 = disable comparator (default)

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
/// DR=100 (128 SPS), COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

const MAX_CHANNEL: usize = 3;

/// Conversion time at 128 SPS is ~7.8 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

const OS_READY_BIT: u16 = 1 << 15;

/// Full scale of the ±4.096 V range.
const VOLTS_PER_COUNT: f64 = 4.096 / 32768.0;

// ── Sampling ────────────────────────────────────────────────────────────────

const SAMPLES_PER_READING: usize = 10;
/// Dropped from each end of the sorted samples.
const TRIM: usize = 2;
const SAMPLE_GAP: Duration = Duration::from_millis(30);

/// Default linear calibration of the pH probe board (pH = m·V + b).
pub const DEFAULT_PH_SLOPE: f64 = -5.339286;
pub const DEFAULT_PH_INTERCEPT: f64 = 20.294821;

/// TDS probe boards report ppm on a 0.5 conversion factor.
const TDS_FACTOR: f64 = 0.5;

fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

fn raw_to_volts(raw: i16) -> f64 {
    f64::from(raw.max(0)) * VOLTS_PER_COUNT
}

pub fn ph_from_volts(volts: f64, slope: f64, intercept: f64) -> f64 {
    (slope * volts + intercept).clamp(0.0, 14.0)
}

/// EC in mS/cm from the TDS board's output voltage.
pub fn ec_from_volts(volts: f64) -> f64 {
    let ppm = (133.42 * volts.powi(3) - 255.86 * volts.powi(2) + 857.39 * volts) * TDS_FACTOR;
    (ppm / TDS_FACTOR / 1000.0).max(0.0)
}

/// Mean of `samples` with the `trim` lowest and highest removed. `None` if
/// nothing is left after trimming.
pub fn trimmed_mean(samples: &mut [f64], trim: usize) -> Option<f64> {
    if samples.len() <= 2 * trim {
        return None;
    }
    samples.sort_by(f64::total_cmp);
    let kept = &samples[trim..samples.len() - trim];
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

// ── Driver ──────────────────────────────────────────────────────────────────

/// ADS1115 driver backed by `rppal::i2c`.
pub struct Ads1115 {
    i2c: I2c,
}

impl Ads1115 {
    /// Open I2C bus 1 and address the ADS1115 at `addr`.
    pub fn new(addr: u16) -> anyhow::Result<Self> {
        let mut i2c = I2c::new()?;
        i2c.set_slave_address(addr)?;
        tracing::info!(addr = format_args!("0x{addr:02x}"), "ads1115 initialised");
        Ok(Self { i2c })
    }

    /// Single-shot read on `channel`, raw signed counts.
    fn read_channel(&mut self, channel: usize) -> anyhow::Result<i16> {
        anyhow::ensure!(channel <= MAX_CHANNEL, "ADS1115 channel {channel} out of range");
        self.i2c
            .block_write(REG_CONFIG, &config_for_channel(channel).to_be_bytes())?;
        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        Ok(i16::from_be_bytes(buf))
    }

    /// Trimmed-mean voltage over several conversions. Failed conversions are
    /// skipped.
    fn read_volts(&mut self, channel: usize) -> anyhow::Result<f64> {
        let mut samples = Vec::with_capacity(SAMPLES_PER_READING);
        for _ in 0..SAMPLES_PER_READING {
            match self.read_channel(channel) {
                Ok(raw) => samples.push(raw_to_volts(raw)),
                Err(e) => tracing::warn!(channel, error = %e, "adc conversion failed"),
            }
            thread::sleep(SAMPLE_GAP);
        }
        trimmed_mean(&mut samples, TRIM)
            .ok_or_else(|| anyhow::anyhow!("too few good samples on channel {channel}"))
    }
}

// ── Probes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeConfig {
    pub ph_channel: usize,
    pub tds_channel: usize,
    pub ph_slope: f64,
    pub ph_intercept: f64,
}

impl ProbeConfig {
    /// `PH_CHANNEL`, `TDS_CHANNEL`, `PH_SLOPE`, `PH_INTERCEPT` as looked up
    /// by `var`; unset values take the defaults.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let channel = |name: &str, default: usize| -> anyhow::Result<usize> {
            let Some(v) = var(name) else {
                return Ok(default);
            };
            let ch: usize = v
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid {name}: {v:?}"))?;
            anyhow::ensure!(ch <= MAX_CHANNEL, "{name} {ch} exceeds maximum ({MAX_CHANNEL})");
            Ok(ch)
        };
        let number = |name: &str, default: f64| -> anyhow::Result<f64> {
            match var(name) {
                Some(v) => v
                    .trim()
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid {name}: {v:?}")),
                None => Ok(default),
            }
        };

        let cfg = Self {
            ph_channel: channel("PH_CHANNEL", 0)?,
            tds_channel: channel("TDS_CHANNEL", 1)?,
            ph_slope: number("PH_SLOPE", DEFAULT_PH_SLOPE)?,
            ph_intercept: number("PH_INTERCEPT", DEFAULT_PH_INTERCEPT)?,
        };
        anyhow::ensure!(
            cfg.ph_channel != cfg.tds_channel,
            "PH_CHANNEL and TDS_CHANNEL must differ"
        );
        Ok(cfg)
    }
}

pub struct ProbeReader {
    adc: Ads1115,
    cfg: ProbeConfig,
}

impl ProbeReader {
    pub fn new(adc: Ads1115, cfg: ProbeConfig) -> Self {
        Self { adc, cfg }
    }

    /// (pH, EC in mS/cm).
    pub fn read(&mut self) -> anyhow::Result<(f64, f64)> {
        let ph_v = self.adc.read_volts(self.cfg.ph_channel)?;
        let tds_v = self.adc.read_volts(self.cfg.tds_channel)?;
        let ph = ph_from_volts(ph_v, self.cfg.ph_slope, self.cfg.ph_intercept);
        let ec = ec_from_volts(tds_v);
        tracing::debug!(ph_v, tds_v, ph, ec, "probe read");
        Ok((ph, ec))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
