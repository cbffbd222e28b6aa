//! Actuator channel model shared by the fuzzy evaluator, the scheduler and the
//! engine: exclusivity groups, per-cycle command sets and misting cadence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::growth::GrowthStage;

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// Exclusivity group. Members of different groups are never open together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelGroup {
    /// Pumps that dose into or draw from the reservoir (pH, nutrients, water).
    Reservoir,
    /// The misting pump.
    Mist,
}

impl ChannelGroup {
    pub fn conflicts_with(self, other: ChannelGroup) -> bool {
        self != other
    }
}

impl fmt::Display for ChannelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reservoir => write!(f, "reservoir"),
            Self::Mist => write!(f, "mist"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Active { until: Instant },
}

#[derive(Debug, Clone)]
pub struct ActuatorChannel {
    pub name: String,
    pub group: ChannelGroup,
    pub state: ChannelState,
}

impl ActuatorChannel {
    pub fn new(name: impl Into<String>, group: ChannelGroup) -> Self {
        Self {
            name: name.into(),
            group,
            state: ChannelState::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ChannelState::Active { .. })
    }
}

// ---------------------------------------------------------------------------
// Command set
// ---------------------------------------------------------------------------

/// Requested hold time per channel, in seconds.
///
/// Built once per cycle by the evaluator and handed by value to
/// [`Scheduler::execute`](crate::scheduler::Scheduler::execute).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandSet(BTreeMap<String, f64>);

impl CommandSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel: impl Into<String>, secs: f64) -> Self {
        self.0.insert(channel.into(), secs);
        self
    }

    /// Requested seconds for `channel`, 0 when absent.
    pub fn get(&self, channel: &str) -> f64 {
        self.0.get(channel).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when nothing would be switched on.
    pub fn is_idle(&self) -> bool {
        self.0.values().all(|&secs| secs == 0.0)
    }
}

impl FromIterator<(String, f64)> for CommandSet {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for CommandSet {
    type Item = (String, f64);
    type IntoIter = std::collections::btree_map::IntoIter<String, f64>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ---------------------------------------------------------------------------
// Misting cadence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MistingPolicy {
    #[serde(rename = "on_sec", serialize_with = "as_secs")]
    pub on: Duration,
    #[serde(rename = "off_sec", serialize_with = "as_secs")]
    pub off: Duration,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl MistingPolicy {
    pub fn from_secs(on: u64, off: u64) -> Self {
        Self {
            on: Duration::from_secs(on),
            off: Duration::from_secs(off),
        }
    }
}

/// Static per-stage cadence table. `default` covers `GrowthStage::Unknown`
/// and the safe fallback after a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MistingTable {
    pub default: MistingPolicy,
    pub stage1: MistingPolicy,
    pub stage2: MistingPolicy,
    pub stage3: MistingPolicy,
}

impl MistingTable {
    pub fn for_stage(&self, stage: GrowthStage) -> MistingPolicy {
        match stage {
            GrowthStage::Stage1 => self.stage1,
            GrowthStage::Stage2 => self.stage2,
            GrowthStage::Stage3 => self.stage3,
            GrowthStage::Unknown => self.default,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
