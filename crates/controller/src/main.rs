mod actuator;
mod config;
mod controller;
mod db;
mod diagnostics;
mod modem;
mod mqtt;
mod notify;
mod relay;
mod schedule;
mod state;
mod transport;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::Actuator;
use config::Config;
use controller::{Controller, Snapshot};
use db::Db;
use mqtt::{EventMsg, ReadingMsg, TelemetryMsg};
use relay::RelayBoard;
use state::{SharedState, SystemState};

/// Everything that leaves the controller through the broker (and the local
/// history).
enum Outbound {
    Event(EventMsg),
    Telemetry(TelemetryMsg),
}

fn now_local(offset: UtcOffset) -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(offset)
}

/// Deployment knobs that may differ per host.
fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(host) = env::var("MQTT_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.mqtt.port = port;
    }
    if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
        cfg.web.port = port;
    }
    if let Ok(v) = env::var("RELAY_ACTIVE_LOW") {
        cfg.relays.active_low = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    let offset = cfg.utc_offset();
    let plant_id = cfg.plant_id.clone();

    // ── Database ────────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:plant.db?mode=rwc".to_string());
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Relays (fail-safe OFF before anything else runs) ────────────
    let mut relays = RelayBoard::new(&cfg.relays)?;
    relays.all_off();

    // ── Shared state (ephemeral, for the status API) ────────────────
    let seed = cfg.seed_schedules();
    let shared: SharedState = Arc::new(RwLock::new(SystemState::new(seed.clone())));
    shared
        .write()
        .await
        .record_system(format!("controller started for plant '{plant_id}'"));
    info!(plant = %plant_id, seed_schedules = seed.len(), "controller starting");

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        shared: Arc::clone(&shared),
        db: db.clone(),
    };
    let web_port = cfg.web.port;
    tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port).await {
            error!("web: {e:#}");
        }
    });

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new(
        format!("plant-controller-{plant_id}"),
        cfg.mqtt.host.clone(),
        cfg.mqtt.port,
    );
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    tokio::spawn(run_mqtt(
        eventloop,
        client.clone(),
        Arc::clone(&shared),
        plant_id.clone(),
    ));

    let (out_tx, out_rx) = mpsc::channel::<Outbound>(64);
    tokio::spawn(run_publisher(out_rx, client.clone(), db.clone(), plant_id.clone()));

    // ── Decision core ───────────────────────────────────────────────
    let mut transport = modem::open(&cfg.transport)?;
    let mut controller = Controller::new(cfg.controller_settings(), seed);

    let started = tokio::task::block_in_place(|| {
        controller.start(now_local(offset), transport.as_mut())
    });
    {
        let mut st = shared.write().await;
        st.transport = started;
        st.record_system(format!("sms transport {}", started.as_str()));
    }
    emit(
        &out_tx,
        now_local(offset),
        "transport",
        started.as_str(),
        format!("startup handshake: {}", started.as_str()),
    );

    run_control_loop(
        &cfg,
        &mut controller,
        transport.as_mut(),
        &mut relays,
        &shared,
        &client,
        &db,
        &out_tx,
    )
    .await;

    relays.all_off();
    if let Some(next) = controller.queue().head() {
        warn!(
            pending = controller.queue().len(),
            next = %next.text,
            "exiting with undelivered notifications"
        );
    }
    shared.write().await.record_system("controller stopped".to_string());
    info!("controller stopped, relays off");
    Ok(())
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_control_loop(
    cfg: &Config,
    controller: &mut Controller,
    transport: &mut (dyn transport::Transport + Send),
    relays: &mut RelayBoard,
    shared: &SharedState,
    client: &AsyncClient,
    db: &Db,
    out_tx: &mpsc::Sender<Outbound>,
) {
    let offset = cfg.utc_offset();
    let stale_after = cfg.stale_after();
    let ceiling = cfg.control.disconnect_ceiling;
    let dry = cfg.control.default_threshold;

    let mut tick = interval(Duration::from_millis(cfg.control.tick_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut telemetry = interval(Duration::from_secs(cfg.intervals.telemetry_sec));
    let mut poll = interval(Duration::from_secs(cfg.intervals.schedule_poll_sec));
    let mut diag = interval(Duration::from_secs(cfg.intervals.diagnostics_sec));
    let mut probe = diagnostics::Probe::new();
    let request_topic = mqtt::schedules_request_topic(&cfg.plant_id);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(tick_ms = cfg.control.tick_ms, "control loop running");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = now_local(offset);
                let (moisture, fresh) = {
                    let mut st = shared.write().await;
                    (st.effective_moisture(now, stale_after), st.take_pending_schedules())
                };
                let refreshed = fresh.is_some();

                let report = tokio::task::block_in_place(|| {
                    controller.tick(
                        Snapshot { now, moisture_percent: moisture, schedules: fresh },
                        &mut *transport,
                    )
                });
                relays.apply(report.water_on, report.fertilizer_on);

                {
                    let mut st = shared.write().await;
                    let pumps = controller.pumps();
                    st.record_outputs(
                        pumps.state(Actuator::Water).started_at(),
                        pumps.state(Actuator::Fertilizer).started_at(),
                    );
                    for ev in &report.events {
                        st.record_control(ev);
                    }
                    st.transport = controller.session_state();
                    st.pending_notifications =
                        controller.queue().iter().map(|n| n.text.clone()).collect();
                    if refreshed {
                        st.schedules = controller.schedules().to_vec();
                    }
                }
                for ev in report.events {
                    emit(out_tx, now, ev.category(), ev.action(), ev.to_string());
                }
            }
            _ = telemetry.tick() => {
                let now = now_local(offset);
                let msg = {
                    let st = shared.read().await;
                    let moisture = st.effective_moisture(now, stale_after);
                    st.telemetry(now, moisture, ceiling, dry)
                };
                debug!(moisture = msg.moisture_percent, status = msg.moisture_status, "telemetry");
                if out_tx.try_send(Outbound::Telemetry(msg)).is_err() {
                    warn!("outbound queue full, telemetry dropped");
                }
            }
            _ = poll.tick() => {
                if let Err(e) = client.try_publish(request_topic.as_str(), QoS::AtLeastOnce, false, "{}") {
                    warn!("schedule poll not sent: {e}");
                }
            }
            _ = diag.tick() => {
                let now = now_local(offset);
                let uptime = shared.read().await.started_at.elapsed().as_secs();
                let d = probe.sample(uptime);
                info!(used_kb = d.used_memory_kb, total_kb = d.total_memory_kb, "diagnostics");
                shared.write().await.record_diagnostics(d.to_string());
                emit(out_tx, now, "diagnostics", "sample", d.to_string());

                let cutoff = now - time::Duration::days(i64::from(cfg.intervals.history_days));
                match db.prune_before(cutoff).await {
                    Ok(0) => {}
                    Ok(n) => info!(rows = n, "history pruned"),
                    Err(e) => warn!("db: {e:#}"),
                }
            }
            _ = &mut shutdown => {
                info!("ctrl-c received, shutting down");
                break;
            }
        }
    }
}

fn emit(
    out_tx: &mpsc::Sender<Outbound>,
    ts: OffsetDateTime,
    category: &str,
    action: &str,
    detail: String,
) {
    let msg = EventMsg {
        ts,
        category: category.to_string(),
        action: action.to_string(),
        detail,
    };
    if out_tx.try_send(Outbound::Event(msg)).is_err() {
        warn!(category, action, "outbound queue full, event dropped");
    }
}

// ---------------------------------------------------------------------------
// MQTT inbound
// ---------------------------------------------------------------------------

async fn run_mqtt(mut eventloop: EventLoop, client: AsyncClient, shared: SharedState, plant_id: String) {
    let schedules_topic = mqtt::schedules_topic(&plant_id);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let topic = p.topic.as_str();

                if let Some(probe_id) = mqtt::extract_probe_id(topic) {
                    match serde_json::from_slice::<ReadingMsg>(&p.payload) {
                        Ok(msg) => {
                            debug!(probe = probe_id, ts = msg.ts, moisture = msg.moisture_percent, "reading");
                            shared.write().await.record_reading(
                                probe_id,
                                msg.moisture_percent,
                                msg.temperature,
                                msg.humidity,
                            );
                        }
                        Err(e) => {
                            warn!(%topic, "bad reading json: {e}");
                            shared
                                .write()
                                .await
                                .record_error(format!("bad reading json: {e}"));
                        }
                    }
                } else if topic == schedules_topic {
                    match mqtt::parse_schedule_list(&p.payload) {
                        Ok(list) => {
                            info!(count = list.len(), "schedule list received");
                            shared.write().await.offer_schedules(list);
                        }
                        Err(e) => {
                            warn!("bad schedule list: {e}");
                            shared
                                .write()
                                .await
                                .record_error(format!("bad schedule list: {e}"));
                        }
                    }
                } else {
                    debug!(%topic, "unhandled topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Subscriptions do not survive a clean-session reconnect.
                for t in ["tele/+/reading", schedules_topic.as_str()] {
                    if let Err(e) = client.try_subscribe(t, QoS::AtLeastOnce) {
                        warn!(topic = t, "subscribe failed: {e}");
                    }
                }
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
                warn!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound: broker + local history
// ---------------------------------------------------------------------------

async fn run_publisher(mut rx: mpsc::Receiver<Outbound>, client: AsyncClient, db: Db, plant_id: String) {
    let events_topic = mqtt::events_topic(&plant_id);
    let telemetry_topic = mqtt::telemetry_topic(&plant_id);

    while let Some(out) = rx.recv().await {
        let (topic, payload, stored) = match &out {
            Outbound::Event(ev) => (&events_topic, serde_json::to_vec(ev), db.insert_event(ev).await),
            Outbound::Telemetry(t) => {
                (&telemetry_topic, serde_json::to_vec(t), db.insert_telemetry(t).await)
            }
        };
        if let Err(e) = stored {
            warn!("db: {e:#}");
        }
        match payload {
            Ok(bytes) => {
                if let Err(e) = client.publish(topic.as_str(), QoS::AtLeastOnce, false, bytes).await {
                    warn!(%topic, "publish failed: {e}");
                }
            }
            Err(e) => error!("encode failed: {e}"),
        }
    }
}
