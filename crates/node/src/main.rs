#[cfg(not(any(feature = "sim", feature = "adc")))]
compile_error!("hydro-node needs a probe source: enable the `sim` or `adc` feature");

#[cfg(feature = "adc")]
mod adc;
#[cfg(feature = "sim")]
#[cfg_attr(feature = "adc", allow(dead_code))]
mod sim;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// What the hub expects on `tele/<node_id>/reading`.
#[derive(Debug, Serialize)]
struct ReadingMsg {
    ts: i64,
    ph: f64,
    ec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    humidity: Option<f64>,
}

/// The slice of the hub's event stream the simulator reacts to.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum HubEvent {
    Actuation { channels: BTreeMap<String, f64> },
    #[serde(other)]
    Other,
}

type Doses = BTreeMap<String, f64>;

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

fn parse_doses(payload: &[u8]) -> Option<Doses> {
    match serde_json::from_slice::<HubEvent>(payload) {
        Ok(HubEvent::Actuation { channels }) if !channels.is_empty() => Some(channels),
        Ok(_) => None,
        Err(e) => {
            debug!(error = %e, "ignoring undecodable hub event");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Probe source
// ---------------------------------------------------------------------------

enum Probe {
    #[cfg(feature = "adc")]
    Adc(std::sync::Arc<std::sync::Mutex<adc::ProbeReader>>),
    #[cfg(feature = "sim")]
    #[cfg_attr(feature = "adc", allow(dead_code))]
    Sim(sim::ReservoirSim),
}

#[cfg(feature = "sim")]
fn apply_doses(sim: &mut sim::ReservoirSim, doses: &Doses) {
    for (channel, secs) in doses {
        if sim.apply_dose(channel, *secs) {
            debug!(channel = %channel, secs, "simulated dose applied");
        }
    }
}

impl Probe {
    #[cfg(feature = "adc")]
    fn open() -> Result<Self> {
        let cfg = adc::ProbeConfig::from_lookup(|name| env::var(name).ok())?;
        let addr = env::var("ADS1115_ADDR")
            .ok()
            .and_then(|s| u16::from_str_radix(s.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0x48);
        let reader = adc::ProbeReader::new(adc::Ads1115::new(addr)?, cfg);
        info!("probe source: ads1115");
        Ok(Self::Adc(std::sync::Arc::new(std::sync::Mutex::new(reader))))
    }

    #[cfg(not(feature = "adc"))]
    fn open() -> Result<Self> {
        let scenario = sim::Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
        let day_s: f64 = env::var("SIM_DAY_S")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|d: &f64| *d > 0.0)
            .unwrap_or(600.0);
        info!(%scenario, day_s, "probe source: simulator");
        Ok(Self::Sim(sim::ReservoirSim::new(scenario, day_s)))
    }

    /// Real probes see real chemistry; only the simulator needs to hear
    /// about doses.
    fn wants_doses(&self) -> bool {
        match self {
            #[cfg(feature = "adc")]
            Self::Adc(_) => false,
            #[cfg(feature = "sim")]
            Self::Sim(_) => true,
        }
    }

    fn dose(&mut self, doses: &Doses) {
        match self {
            #[cfg(feature = "adc")]
            Self::Adc(_) => {}
            #[cfg(feature = "sim")]
            Self::Sim(sim) => apply_doses(sim, doses),
        }
    }

    async fn read(&mut self) -> Result<ReadingMsg> {
        match self {
            #[cfg(feature = "adc")]
            Self::Adc(reader) => {
                let reader = std::sync::Arc::clone(reader);
                // The ADC driver sleeps between conversions.
                let (ph, ec) = tokio::task::spawn_blocking(move || {
                    reader
                        .lock()
                        .map_err(|_| anyhow::anyhow!("probe reader poisoned"))?
                        .read()
                })
                .await
                .context("probe read task failed")??;
                Ok(ReadingMsg {
                    ts: now_unix(),
                    ph,
                    ec,
                    temperature: None,
                    humidity: None,
                })
            }
            #[cfg(feature = "sim")]
            Self::Sim(sim) => {
                let s = sim.sample();
                Ok(ReadingMsg {
                    ts: now_unix(),
                    ph: s.ph,
                    ec: s.ec,
                    temperature: Some(s.temperature),
                    humidity: Some(s.humidity),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

/// Keeps the connection alive. When `event_topic` is set, the hub's
/// actuation events are forwarded as doses.
async fn mqtt_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    event_topic: Option<String>,
    doses: mpsc::UnboundedSender<Doses>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("node connected to mqtt");
                if let Some(topic) = &event_topic {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                        warn!(error = %e, "subscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if let Some(d) = parse_doses(&p.payload) {
                    let _ = doses.send(d);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt error, retrying");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "node-a".to_string());
    let tray_id = env::var("TRAY_ID").unwrap_or_else(|_| "tray-1".to_string());
    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(30);

    let mut probe = Probe::open()?;

    let mut mqttoptions = MqttOptions::new(format!("hydro-node-{node_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 10);

    let event_topic = probe
        .wants_doses()
        .then(|| format!("hydro/{tray_id}/event"));
    let (dose_tx, mut dose_rx) = mpsc::unbounded_channel();
    tokio::spawn(mqtt_loop(eventloop, client.clone(), event_topic, dose_tx));

    let topic = format!("tele/{node_id}/reading");
    info!(%topic, every_s = sample_every_s, "publishing readings");

    loop {
        while let Ok(doses) = dose_rx.try_recv() {
            probe.dose(&doses);
        }

        match probe.read().await {
            Ok(msg) => {
                let payload = serde_json::to_vec(&msg).context("encoding reading")?;
                match client.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                    Ok(()) => debug!(ts = msg.ts, ph = msg.ph, ec = msg.ec, "published reading"),
                    Err(e) => warn!(error = %e, "publish error"),
                }
            }
            Err(e) => warn!(error = ?e, "probe read failed"),
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
