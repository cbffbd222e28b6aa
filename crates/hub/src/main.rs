mod calibration;
mod channel;
mod classifier;
mod config;
mod confirm;
mod db;
mod engine;
mod fuzzy;
mod growth;
mod mqtt;
mod relay;
mod scheduler;
mod sensor;
mod state;
mod telemetry;
mod web;

#[cfg(test)]
mod testing;

use anyhow::{bail, Result};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use calibration::Calibrator;
use classifier::CommandClassifier;
use confirm::ConfirmationDesk;
use db::{now_unix, Db};
use engine::{Collaborators, Engine};
use fuzzy::FuzzyEvaluator;
use growth::{GrowthCoordinator, GrowthStage};
use mqtt::{extract_node_id, MqttTelemetry, ReadingMsg};
use relay::GpioBoard;
use scheduler::Scheduler;
use sensor::ReadingFeed;
use state::{SharedState, SystemState};
use telemetry::Telemetry;
use web::AppState;

const READING_TOPIC: &str = "tele/+/reading";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let tray_id = env::var("TRAY_ID").unwrap_or_else(|_| "tray-1".to_string());
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:hydro.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load(&config_path)?;
    info!(path = %config_path, channels = cfg.channels.len(), "config loaded");

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // A confirmed stage outlives restarts.
    let stage = match db.latest_stage().await? {
        Some(stage) if stage != GrowthStage::Unknown => {
            info!(%stage, "resuming last committed stage");
            stage
        }
        _ => cfg.initial_stage(),
    };
    let since_replenished = db
        .last_replenishment_ts()
        .await?
        .map(|ts| Duration::from_secs(u64::try_from(now_unix() - ts).unwrap_or(0)));

    // ── Relay board + scheduler ─────────────────────────────────────
    let board = Arc::new(GpioBoard::new(&cfg.gpio_map(), active_low)?);
    let scheduler = Scheduler::new(board, &cfg.channel_table());

    // ── Shared state (ephemeral, for the web UI) ────────────────────
    let shared = SystemState::shared(stage);
    shared
        .write()
        .await
        .record_system(format!("hub started at {stage}"));

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(format!("hydro-hub-{tray_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    let telemetry: Arc<dyn Telemetry> = Arc::new(MqttTelemetry::new(client.clone(), &tray_id));
    let (feed, gateway) = sensor::gateway(
        Duration::from_secs(cfg.sensor.max_age_sec),
        Duration::from_secs(cfg.sensor.read_timeout_sec),
    );
    tokio::spawn(mqtt_loop(eventloop, client, feed, Arc::clone(&shared)));

    // ── Growth stage ────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (stage_tx, stage_rx) = watch::channel(stage);
    let desk = ConfirmationDesk::default();

    match cfg
        .growth
        .classifier_cmd
        .as_deref()
        .and_then(CommandClassifier::from_command_line)
    {
        Some(classifier) => {
            let coordinator = GrowthCoordinator::new(
                Arc::new(classifier),
                Arc::new(desk.clone()),
                Arc::clone(&telemetry),
                cfg.growth_settings(),
            );
            tokio::spawn(coordinator.run(stage, stage_tx, shutdown_rx.clone()));
        }
        None => info!(%stage, "no classifier configured, growth stage stays fixed"),
    }

    // ── Engine ──────────────────────────────────────────────────────
    let calibrator = Arc::new(Calibrator::new(Duration::from_secs(
        cfg.calibration.settle_sec,
    )));
    let mut engine = Engine::new(
        cfg.engine_settings(),
        Collaborators {
            sensor: Arc::new(gateway),
            evaluator: FuzzyEvaluator::new(cfg.bindings(), cfg.control.deadband_sec),
            scheduler: scheduler.clone(),
            calibrator: Arc::clone(&calibrator),
            telemetry,
            state: Arc::clone(&shared),
        },
        stage_rx,
    )
    .with_db(db.clone());
    if let Some(ago) = since_replenished {
        engine = engine.replenished_ago(ago);
    }

    // ── Web server ──────────────────────────────────────────────────
    let app = AppState {
        shared,
        scheduler: scheduler.clone(),
        desk,
        calibration: calibrator.subscribe(),
        db: Some(db),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port).await {
            error!(error = ?e, "web server stopped");
        }
    });

    // ── Run until ctrl-c or a fatal fault ───────────────────────────
    let run = engine.run(shutdown_rx);
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
            run.await
        }
    };

    // Last resort as well as orderly teardown: every relay off.
    let teardown = scheduler.shutdown();
    if let Err(e) = result {
        bail!("engine stopped on unrecoverable fault: {e}");
    }
    if let Err(e) = teardown {
        bail!("could not switch every relay off: {e}");
    }
    info!("hub stopped");
    Ok(())
}

/// Keeps the broker connection alive and feeds decoded readings to the
/// engine's sensor gateway.
async fn mqtt_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    feed: ReadingFeed,
    shared: SharedState,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(node_id) = extract_node_id(&p.topic) else {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };
                let decoded = serde_json::from_slice::<ReadingMsg>(&p.payload)
                    .map_err(|e| e.to_string())
                    .and_then(|msg| msg.into_reading().map_err(|e| e.to_string()));
                match decoded {
                    Ok(reading) => {
                        debug!(node = node_id, ph = reading.ph, ec = reading.ec, "reading received");
                        feed.push(reading);
                    }
                    Err(e) => {
                        warn!(node = node_id, error = %e, "bad reading");
                        shared
                            .write()
                            .await
                            .record_error(format!("bad reading from {node_id}: {e}"));
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // subscriptions do not survive a clean-session reconnect
                if let Err(e) = client.try_subscribe(READING_TOPIC, QoS::AtLeastOnce) {
                    warn!(error = %e, "subscribe failed");
                }
                info!(topic = READING_TOPIC, "mqtt connected");
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt error, reconnecting");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
