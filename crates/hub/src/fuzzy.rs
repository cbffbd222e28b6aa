//! Mamdani fuzzy inference over reservoir chemistry.
//!
//! ```text
//!  pH, EC ──clamp──▶ fuzzify ──AND=min──▶ clip consequents ──OR=max──▶ centroid
//!                                                                        │
//!                 per-channel ceiling ◀── deadband (ph_up vs ph_down) ◀──┘
//! ```
//!
//! Membership functions and rules are static tables. Each output is
//! defuzzified by centroid over a sampled universe; an output with no firing
//! rule is 0.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::channel::CommandSet;

/// Samples across each output universe during defuzzification.
const RESOLUTION: usize = 301;

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Ph,
    Ec,
    Humidity,
}

impl Input {
    pub const fn universe(self) -> (f64, f64) {
        match self {
            Self::Ph => (4.0, 8.0),
            Self::Ec => (0.0, 5.0),
            Self::Humidity => (0.0, 100.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Output {
    PhUp,
    PhDown,
    Nutrients,
    Water,
    /// Seconds added to the misting off-time.
    MistOffset,
}

impl Output {
    pub const fn universe(self) -> (f64, f64) {
        match self {
            Self::PhUp | Self::PhDown | Self::Nutrients | Self::Water => (0.0, 30.0),
            Self::MistOffset => (-60.0, 60.0),
        }
    }

    /// Outputs that drive a reservoir pump directly.
    pub fn is_dosing(self) -> bool {
        !matches!(self, Self::MistOffset)
    }
}

// ---------------------------------------------------------------------------
// Membership functions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Membership {
    pub name: &'static str,
    /// Trapezoid corners `a <= b <= c <= d`; a triangle has `b == c`.
    corners: [f64; 4],
}

impl Membership {
    pub const fn triangle(name: &'static str, a: f64, b: f64, c: f64) -> Self {
        Self {
            name,
            corners: [a, b, b, c],
        }
    }

    pub const fn trapezoid(name: &'static str, a: f64, b: f64, c: f64, d: f64) -> Self {
        Self {
            name,
            corners: [a, b, c, d],
        }
    }

    /// Degree of membership in [0, 1].
    pub fn degree(&self, x: f64) -> f64 {
        let [a, b, c, d] = self.corners;
        if x < a || x > d {
            0.0
        } else if x >= b && x <= c {
            1.0
        } else if x < b {
            (x - a) / (b - a)
        } else {
            (d - x) / (d - c)
        }
    }
}

pub const PH_ACIDIC: Membership = Membership::trapezoid("acidic", 4.0, 4.0, 5.2, 5.8);
pub const PH_NEUTRAL: Membership = Membership::triangle("neutral", 5.5, 6.0, 6.5);
pub const PH_ALKALINE: Membership = Membership::trapezoid("alkaline", 6.2, 6.8, 8.0, 8.0);

pub const EC_LOW: Membership = Membership::trapezoid("low", 0.0, 0.0, 1.2, 2.0);
pub const EC_OPTIMAL: Membership = Membership::triangle("optimal", 1.8, 2.15, 2.5);
pub const EC_HIGH: Membership = Membership::trapezoid("high", 2.3, 3.0, 5.0, 5.0);

pub const HUMIDITY_LOW: Membership = Membership::triangle("low", 0.0, 0.0, 40.0);
pub const HUMIDITY_MEDIUM: Membership = Membership::triangle("medium", 30.0, 50.0, 70.0);
pub const HUMIDITY_HIGH: Membership = Membership::triangle("high", 60.0, 100.0, 100.0);

pub const DOSE_SHORT: Membership = Membership::triangle("short", 0.0, 3.0, 6.0);
pub const DOSE_MEDIUM: Membership = Membership::triangle("medium", 4.0, 8.0, 12.0);
pub const DOSE_LONG: Membership = Membership::trapezoid("long", 10.0, 14.0, 30.0, 30.0);

pub const MIST_REDUCE: Membership = Membership::triangle("reduce", -60.0, -60.0, 0.0);
pub const MIST_HOLD: Membership = Membership::triangle("hold", -10.0, 0.0, 10.0);
pub const MIST_INCREASE: Membership = Membership::triangle("increase", 0.0, 60.0, 60.0);

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// `IF all(when) THEN each(then)`, strength = min over antecedents.
#[derive(Debug)]
pub struct Rule {
    pub when: &'static [(Input, Membership)],
    pub then: &'static [(Output, Membership)],
}

pub const DOSING_RULES: &[Rule] = &[
    Rule {
        when: &[(Input::Ph, PH_ACIDIC)],
        then: &[(Output::PhUp, DOSE_MEDIUM)],
    },
    Rule {
        when: &[(Input::Ph, PH_ALKALINE)],
        then: &[(Output::PhDown, DOSE_MEDIUM)],
    },
    Rule {
        when: &[(Input::Ec, EC_LOW), (Input::Ph, PH_NEUTRAL)],
        then: &[(Output::Nutrients, DOSE_LONG)],
    },
    Rule {
        when: &[(Input::Ec, EC_LOW), (Input::Ph, PH_ACIDIC)],
        then: &[(Output::Nutrients, DOSE_MEDIUM)],
    },
    Rule {
        when: &[(Input::Ec, EC_LOW), (Input::Ph, PH_ALKALINE)],
        then: &[(Output::Nutrients, DOSE_MEDIUM)],
    },
    Rule {
        when: &[(Input::Ec, EC_HIGH)],
        then: &[(Output::Water, DOSE_LONG)],
    },
    // fresh water pulls pH up; lean on ph_down a little more
    Rule {
        when: &[(Input::Ec, EC_HIGH), (Input::Ph, PH_ALKALINE)],
        then: &[(Output::PhDown, DOSE_SHORT)],
    },
    Rule {
        when: &[(Input::Ec, EC_OPTIMAL), (Input::Ph, PH_ACIDIC)],
        then: &[(Output::PhUp, DOSE_SHORT)],
    },
];

pub const MISTING_RULES: &[Rule] = &[
    Rule {
        when: &[(Input::Humidity, HUMIDITY_LOW)],
        then: &[(Output::MistOffset, MIST_REDUCE)],
    },
    Rule {
        when: &[(Input::Humidity, HUMIDITY_MEDIUM)],
        then: &[(Output::MistOffset, MIST_HOLD)],
    },
    Rule {
        when: &[(Input::Humidity, HUMIDITY_HIGH)],
        then: &[(Output::MistOffset, MIST_INCREASE)],
    },
];

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

/// Runs one Mamdani pass. Inputs are clamped to their universes; a rule whose
/// antecedent names an input that is not supplied does not fire.
pub fn infer(rules: &[Rule], inputs: &[(Input, f64)]) -> HashMap<Output, f64> {
    let value_of = |input: Input| {
        inputs.iter().find(|(i, _)| *i == input).map(|(i, x)| {
            let (lo, hi) = i.universe();
            x.clamp(lo, hi)
        })
    };

    let fired: Vec<(f64, &Rule)> = rules
        .iter()
        .filter_map(|rule| {
            let strength = rule.when.iter().try_fold(1.0_f64, |acc, (input, set)| {
                value_of(*input).map(|x| acc.min(set.degree(x)))
            })?;
            (strength > 0.0).then_some((strength, rule))
        })
        .collect();

    let mut crisp = HashMap::new();
    for rule in rules {
        for (output, _) in rule.then {
            crisp
                .entry(*output)
                .or_insert_with(|| centroid(*output, &fired));
        }
    }
    crisp
}

fn centroid(output: Output, fired: &[(f64, &Rule)]) -> f64 {
    let (lo, hi) = output.universe();
    let step = (hi - lo) / (RESOLUTION - 1) as f64;
    let (mut num, mut den) = (0.0, 0.0);

    for i in 0..RESOLUTION {
        let x = lo + step * i as f64;
        let mu = fired
            .iter()
            .flat_map(|(strength, rule)| {
                rule.then
                    .iter()
                    .filter(|(o, _)| *o == output)
                    .map(move |(_, set)| set.degree(x).min(*strength))
            })
            .fold(0.0, f64::max);
        num += x * mu;
        den += mu;
    }

    if den <= f64::EPSILON {
        0.0
    } else {
        num / den
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Ties a fuzzy output to a physical channel and its hard ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub channel: String,
    pub output: Output,
    pub max_sec: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("non-finite sensor input (ph={ph}, ec={ec})")]
pub struct InvalidInput {
    pub ph: f64,
    pub ec: f64,
    /// All bound channels at zero; safe to hand to the scheduler.
    pub fallback: CommandSet,
}

pub struct FuzzyEvaluator {
    bindings: Vec<Binding>,
    deadband: f64,
    dosing_rules: &'static [Rule],
    misting_rules: &'static [Rule],
}

impl FuzzyEvaluator {
    pub fn new(bindings: Vec<Binding>, deadband: f64) -> Self {
        Self {
            bindings,
            deadband,
            dosing_rules: DOSING_RULES,
            misting_rules: MISTING_RULES,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_dosing_rules(mut self, rules: &'static [Rule]) -> Self {
        self.dosing_rules = rules;
        self
    }

    /// Every bound channel at 0 seconds.
    pub fn idle(&self) -> CommandSet {
        self.bindings
            .iter()
            .map(|b| (b.channel.clone(), 0.0))
            .collect()
    }

    /// Maps one (pH, EC) reading to pump hold times.
    ///
    /// Never returns both `ph_up` and `ph_down` above the deadband, and every
    /// duration lies in `[0, max_sec]` of its channel.
    pub fn evaluate(&self, ph: f64, ec: f64) -> Result<CommandSet, InvalidInput> {
        if !ph.is_finite() || !ec.is_finite() {
            return Err(InvalidInput {
                ph,
                ec,
                fallback: self.idle(),
            });
        }

        let mut crisp = infer(self.dosing_rules, &[(Input::Ph, ph), (Input::Ec, ec)]);

        let up = crisp.get(&Output::PhUp).copied().unwrap_or(0.0);
        let down = crisp.get(&Output::PhDown).copied().unwrap_or(0.0);
        if up > self.deadband && down > self.deadband {
            tracing::warn!(ph, up, down, "contradictory pH correction, holding both");
            crisp.insert(Output::PhUp, 0.0);
            crisp.insert(Output::PhDown, 0.0);
        }

        let commands = self
            .bindings
            .iter()
            .map(|b| {
                let secs = crisp.get(&b.output).copied().unwrap_or(0.0);
                (b.channel.clone(), secs.clamp(0.0, b.max_sec))
            })
            .collect();
        tracing::debug!(ph, ec, ?commands, "fuzzy evaluation");
        Ok(commands)
    }

    /// Seconds to add to the misting off-time for the given relative
    /// humidity. Missing or non-finite humidity means no adjustment.
    pub fn mist_adjustment(&self, humidity: Option<f64>) -> f64 {
        match humidity {
            Some(h) if h.is_finite() => infer(self.misting_rules, &[(Input::Humidity, h)])
                .get(&Output::MistOffset)
                .copied()
                .unwrap_or(0.0),
            _ => 0.0,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings() -> Vec<Binding> {
        let bind = |channel: &str, output, max_sec| Binding {
            channel: channel.to_string(),
            output,
            max_sec,
        };
        vec![
            bind("ph_up", Output::PhUp, 10.0),
            bind("ph_down", Output::PhDown, 10.0),
            bind("nutrient_a", Output::Nutrients, 20.0),
            bind("nutrient_b", Output::Nutrients, 20.0),
            bind("water", Output::Water, 30.0),
        ]
    }

    fn evaluator() -> FuzzyEvaluator {
        FuzzyEvaluator::new(bindings(), 0.5)
    }

    // -- Membership ----------------------------------------------------------

    #[test]
    fn triangle_peak_and_feet() {
        let m = Membership::triangle("t", 0.0, 5.0, 10.0);
        assert_eq!(m.degree(5.0), 1.0);
        assert_eq!(m.degree(0.0), 0.0);
        assert_eq!(m.degree(10.0), 0.0);
        assert!((m.degree(2.5) - 0.5).abs() < 1e-12);
        assert!((m.degree(7.5) - 0.5).abs() < 1e-12);
        assert_eq!(m.degree(-1.0), 0.0);
    }

    #[test]
    fn shoulder_trapezoid_is_flat_to_the_edge() {
        assert_eq!(PH_ACIDIC.degree(4.0), 1.0);
        assert_eq!(PH_ACIDIC.degree(5.2), 1.0);
        assert_eq!(PH_ALKALINE.degree(8.0), 1.0);
        assert_eq!(HUMIDITY_LOW.degree(0.0), 1.0);
    }

    #[test]
    fn degrees_stay_in_unit_interval() {
        for set in [PH_ACIDIC, PH_NEUTRAL, PH_ALKALINE, EC_LOW, EC_OPTIMAL, EC_HIGH] {
            for i in 0..=100 {
                let d = set.degree(i as f64 * 0.1);
                assert!((0.0..=1.0).contains(&d), "{} gave {d}", set.name);
            }
        }
    }

    // -- Evaluation ----------------------------------------------------------

    #[test]
    fn alkaline_and_lean_reservoir_doses_down_and_nutrients() {
        let cmds = evaluator().evaluate(7.0, 1.0).unwrap();
        assert!(cmds.get("ph_down") > 0.0);
        assert_eq!(cmds.get("ph_up"), 0.0);
        assert!(cmds.get("nutrient_a") > 0.0);
        assert!(cmds.get("nutrient_b") > 0.0);
        assert_eq!(cmds.get("water"), 0.0);
    }

    #[test]
    fn in_band_reading_is_idle() {
        let cmds = evaluator().evaluate(6.0, 2.1).unwrap();
        assert!(cmds.is_idle(), "expected all zero, got {cmds:?}");
        assert_eq!(cmds.len(), 5);
    }

    #[test]
    fn acidic_reading_raises_ph() {
        let cmds = evaluator().evaluate(5.0, 2.15).unwrap();
        assert!(cmds.get("ph_up") > 0.0);
        assert_eq!(cmds.get("ph_down"), 0.0);
    }

    #[test]
    fn rich_reservoir_adds_water() {
        let cmds = evaluator().evaluate(6.0, 3.5).unwrap();
        assert!(cmds.get("water") > 0.0);
        assert_eq!(cmds.get("nutrient_a"), 0.0);
    }

    #[test]
    fn inputs_outside_universe_are_clamped() {
        let ev = evaluator();
        assert_eq!(ev.evaluate(9.5, 1.0).unwrap(), ev.evaluate(8.0, 1.0).unwrap());
        assert_eq!(ev.evaluate(6.0, -2.0).unwrap(), ev.evaluate(6.0, 0.0).unwrap());
    }

    #[test]
    fn non_finite_input_is_rejected_with_idle_fallback() {
        let ev = evaluator();
        for (ph, ec) in [(f64::NAN, 2.0), (6.0, f64::INFINITY), (f64::NEG_INFINITY, f64::NAN)] {
            let err = ev.evaluate(ph, ec).unwrap_err();
            assert!(err.fallback.is_idle());
            assert_eq!(err.fallback.len(), 5);
        }
    }

    #[test]
    fn ceiling_caps_duration() {
        let tight = vec![Binding {
            channel: "water".into(),
            output: Output::Water,
            max_sec: 2.0,
        }];
        let cmds = FuzzyEvaluator::new(tight, 0.5).evaluate(6.0, 4.5).unwrap();
        assert_eq!(cmds.get("water"), 2.0);
    }

    #[test]
    fn grid_never_doses_both_directions_or_exceeds_ceilings() {
        let ev = evaluator();
        let ceilings: HashMap<String, f64> =
            bindings().into_iter().map(|b| (b.channel, b.max_sec)).collect();
        for i in 0..=40 {
            for j in 0..=20 {
                let ph = 4.0 + i as f64 * 0.1;
                let ec = j as f64 * 0.25;
                let cmds = ev.evaluate(ph, ec).unwrap();
                assert!(
                    !(cmds.get("ph_up") > 0.5 && cmds.get("ph_down") > 0.5),
                    "both directions at ph={ph} ec={ec}: {cmds:?}"
                );
                for (channel, secs) in cmds.iter() {
                    assert!(secs >= 0.0 && secs <= ceilings[channel], "{channel}={secs}");
                }
            }
        }
    }

    // -- Deadband --------------------------------------------------------------

    const CONTRADICTORY: &[Rule] = &[Rule {
        when: &[(Input::Ph, PH_NEUTRAL)],
        then: &[(Output::PhUp, DOSE_MEDIUM), (Output::PhDown, DOSE_MEDIUM)],
    }];

    #[test]
    fn contradictory_rules_zero_both_directions() {
        let ev = evaluator().with_dosing_rules(CONTRADICTORY);
        let cmds = ev.evaluate(6.0, 2.0).unwrap();
        assert_eq!(cmds.get("ph_up"), 0.0);
        assert_eq!(cmds.get("ph_down"), 0.0);
    }

    #[test]
    fn contradiction_inside_deadband_is_left_alone() {
        let ev = FuzzyEvaluator::new(bindings(), 50.0).with_dosing_rules(CONTRADICTORY);
        let cmds = ev.evaluate(6.0, 2.0).unwrap();
        assert!(cmds.get("ph_up") > 0.0);
        assert!(cmds.get("ph_down") > 0.0);
    }

    // -- Inference -------------------------------------------------------------

    #[test]
    fn unfired_output_defuzzifies_to_zero() {
        let crisp = infer(DOSING_RULES, &[(Input::Ph, 6.0), (Input::Ec, 2.15)]);
        assert_eq!(crisp[&Output::Water], 0.0);
        assert_eq!(crisp[&Output::PhUp], 0.0);
    }

    #[test]
    fn missing_input_does_not_fire() {
        let crisp = infer(DOSING_RULES, &[(Input::Ph, 7.5)]);
        assert!(crisp[&Output::PhDown] > 0.0);
        assert_eq!(crisp[&Output::Nutrients], 0.0);
    }

    #[test]
    fn full_strength_triangle_centroid_is_its_peak() {
        let crisp = infer(DOSING_RULES, &[(Input::Ph, 7.5), (Input::Ec, 2.15)]);
        assert!((crisp[&Output::PhDown] - 8.0).abs() < 0.05, "{}", crisp[&Output::PhDown]);
    }

    // -- Misting adjustment ------------------------------------------------

    #[test]
    fn dry_air_shortens_the_off_time() {
        assert!(evaluator().mist_adjustment(Some(10.0)) < 0.0);
    }

    #[test]
    fn humid_air_lengthens_the_off_time() {
        assert!(evaluator().mist_adjustment(Some(90.0)) > 0.0);
    }

    #[test]
    fn comfortable_air_is_neutral() {
        assert!(evaluator().mist_adjustment(Some(50.0)).abs() < 1e-6);
    }

    #[test]
    fn missing_humidity_is_neutral() {
        let ev = evaluator();
        assert_eq!(ev.mist_adjustment(None), 0.0);
        assert_eq!(ev.mist_adjustment(Some(f64::NAN)), 0.0);
    }
}
