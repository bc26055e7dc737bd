use std::{
    collections::HashMap,
    future::Future,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    pin::Pin,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use climate_common::{
    command_route, forecast_topic, motion_topic, parse_humidity, parse_temperature,
    sensor_humidity_topic, sensor_temperature_topic, Action, ClimateConfig, ClimateEngine,
    ClimateStatus, EngineCtx, Room, Scene, ThresholdSettings, TimerKind, TOPIC_ANYONE_HOME,
    TOPIC_CMD_AIRCON, TOPIC_CMD_CONTROL, TOPIC_CMD_RESET, TOPIC_CMD_SETTING_PREFIX,
    TOPIC_CMD_SETTING_WILDCARD, TOPIC_CONTROLLER_STATE, TOPIC_DOOR, TOPIC_NOTIFY,
    TOPIC_OUTSIDE_TEMP, TOPIC_PETS_HOME_ALONE, TOPIC_PRE_SLEEP, TOPIC_SCENE,
};

use crate::home::{HomeConfig, HomeState};

const FORECAST_HOURS: [u8; 4] = [2, 4, 6, 8];
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<ClimateEngine>>,
    home: Arc<Mutex<HomeState>>,
    timers: Arc<Mutex<HashMap<TimerKind, JoinHandle<()>>>>,
    mqtt: AsyncClient,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RuntimeConfig {
    #[serde(default)]
    config: ClimateConfig,
    #[serde(default)]
    settings: ThresholdSettings,
    #[serde(default)]
    home: HomeConfig,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    #[serde(flatten)]
    engine: ClimateStatus,
    scene: String,
    #[serde(rename = "bedTime")]
    bed_time: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.settings.sanitize();

    let engine = ClimateEngine::new(runtime.config.clone(), runtime.settings.clone(), true, false);

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("climate-controller", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        home: Arc::new(Mutex::new(HomeState::new(&runtime.home))),
        timers: Arc::new(Mutex::new(HashMap::new())),
        mqtt,
        store,
    };

    subscribe_topics(&app_state.mqtt).await?;
    {
        let actions = {
            let mut engine = app_state.engine.lock().await;
            let home = app_state.home.lock().await;
            let (scenes, presence) = home.views(monotonic_ms());
            engine.initialize(&EngineCtx {
                scenes: &scenes,
                presence: &presence,
            })
        };
        dispatch_actions(&app_state, actions).await;
    }
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_state_publish_loop(app_state.clone());

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/control", post(handle_set_control))
        .route("/api/aircon", post(handle_set_aircon))
        .route("/api/reset", post(handle_reset))
        .route("/api/setting", put(handle_put_setting))
        .route("/api/settings", get(handle_get_settings))
        .route("/api/door-delay", put(handle_put_door_delay))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state.clone());

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(app_state))
        .await?;
    Ok(())
}

/// Cancel every engine timer and watch before the process exits, so no
/// stale timer task fires into a half-dismantled host.
async fn shutdown_signal(state: AppState) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        return;
    }
    info!("shutting down");
    let actions = {
        let mut engine = state.engine.lock().await;
        engine.shutdown()
    };
    dispatch_actions(&state, actions).await;
    let mut timers = state.timers.lock().await;
    for (_, handle) in timers.drain() {
        handle.abort();
    }
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let mut topics = vec![
        TOPIC_OUTSIDE_TEMP.to_string(),
        TOPIC_DOOR.to_string(),
        TOPIC_SCENE.to_string(),
        TOPIC_PRE_SLEEP.to_string(),
        TOPIC_ANYONE_HOME.to_string(),
        TOPIC_PETS_HOME_ALONE.to_string(),
        TOPIC_CMD_CONTROL.to_string(),
        TOPIC_CMD_AIRCON.to_string(),
        TOPIC_CMD_RESET.to_string(),
        TOPIC_CMD_SETTING_WILDCARD.to_string(),
    ];
    for room in Room::SENSOR_ROOMS {
        topics.push(sensor_temperature_topic(room));
        topics.push(sensor_humidity_topic(room));
        topics.push(motion_topic(room));
    }
    for hours in FORECAST_HOURS {
        topics.push(forecast_topic(hours));
    }

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;

            let payload = {
                let engine = app_state.engine.lock().await;
                let home = app_state.home.lock().await;
                serde_json::to_vec(&StatusBody {
                    engine: engine.status(),
                    scene: home.scene.as_str().to_string(),
                    bed_time: home.is_bed_time(),
                })
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }
        }
    });
}

/// Execute the engine's side effects in order. Boxed so that timer tasks
/// can re-enter it when they fire.
fn dispatch_actions<'a>(
    state: &'a AppState,
    actions: Vec<Action>,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        for action in actions {
            match action {
                Action::Device(command) => {
                    let (topic, payload) = command_route(&command);
                    debug!(%topic, %payload, "issuing device command");
                    if let Err(err) = state
                        .mqtt
                        .publish(topic, QoS::AtLeastOnce, false, payload)
                        .await
                    {
                        warn!("device command publish failed: {err}");
                    }
                }
                Action::Notify(notification) => {
                    info!(message = %notification.message, "notification");
                    match serde_json::to_vec(&notification) {
                        Ok(body) => {
                            if let Err(err) = state
                                .mqtt
                                .publish(TOPIC_NOTIFY, QoS::AtLeastOnce, false, body)
                                .await
                            {
                                warn!("notification publish failed: {err}");
                            }
                        }
                        Err(err) => warn!("notification serialization failed: {err}"),
                    }
                }
                Action::StartTimer { kind, delay_ms } => {
                    schedule_timer(state, kind, delay_ms).await;
                }
                Action::CancelTimer { kind } => {
                    if let Some(handle) = state.timers.lock().await.remove(&kind) {
                        handle.abort();
                    }
                }
            }
        }
    })
}

/// One live timer per kind; the previous one is aborted before the
/// replacement is scheduled.
async fn schedule_timer(state: &AppState, kind: TimerKind, delay_ms: u64) {
    let mut timers = state.timers.lock().await;
    if let Some(previous) = timers.remove(&kind) {
        previous.abort();
    }
    let task_state = state.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        let now_ms = monotonic_ms();
        let actions = {
            let mut engine = task_state.engine.lock().await;
            let home = task_state.home.lock().await;
            let (scenes, presence) = home.views(now_ms);
            engine.handle_timer(
                kind,
                &EngineCtx {
                    scenes: &scenes,
                    presence: &presence,
                },
                now_ms,
            )
        };
        task_state.timers.lock().await.remove(&kind);
        dispatch_actions(&task_state, actions).await;
    });
    timers.insert(kind, handle);
}

/// Run one engine entry point against a fresh context snapshot and execute
/// the resulting actions.
async fn with_engine<F>(state: &AppState, call: F)
where
    F: for<'a> FnOnce(&mut ClimateEngine, &EngineCtx<'a>, u64) -> Vec<Action>,
{
    let now_ms = monotonic_ms();
    let actions = {
        let mut engine = state.engine.lock().await;
        let home = state.home.lock().await;
        let (scenes, presence) = home.views(now_ms);
        call(
            &mut engine,
            &EngineCtx {
                scenes: &scenes,
                presence: &presence,
            },
            now_ms,
        )
    };
    dispatch_actions(state, actions).await;
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }
    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let now_ms = monotonic_ms();

    match topic.as_str() {
        TOPIC_OUTSIDE_TEMP => {
            let value = parse_reading(&topic, &message, parse_temperature);
            with_engine(app_state, |engine, ctx, now| {
                engine.handle_outside_temperature(value, ctx, now)
            })
            .await;
            return Ok(());
        }
        TOPIC_DOOR => {
            let open = matches!(message.to_ascii_lowercase().as_str(), "open" | "on");
            {
                let mut home = app_state.home.lock().await;
                home.presence.door_open = open;
            }
            with_engine(app_state, |engine, ctx, now| {
                engine.handle_door_changed(open, ctx, now)
            })
            .await;
            return Ok(());
        }
        TOPIC_SCENE => {
            let Some(new_scene) = Scene::parse(message.trim()) else {
                warn!(scene = %message, "ignoring unknown scene");
                return Ok(());
            };
            let old_scene = {
                let mut home = app_state.home.lock().await;
                let old = home.scene;
                home.scene = new_scene;
                old
            };
            with_engine(app_state, |engine, ctx, now| {
                engine.handle_scene_transition(new_scene, old_scene, ctx, now)
            })
            .await;
            return Ok(());
        }
        TOPIC_PRE_SLEEP => {
            let mut home = app_state.home.lock().await;
            home.pre_sleep = message.eq_ignore_ascii_case("on");
            return Ok(());
        }
        TOPIC_ANYONE_HOME => {
            let mut home = app_state.home.lock().await;
            home.presence.anyone_home = message.eq_ignore_ascii_case("on");
            return Ok(());
        }
        TOPIC_PETS_HOME_ALONE => {
            let mut home = app_state.home.lock().await;
            home.presence.pets_home_alone = message.eq_ignore_ascii_case("on");
            return Ok(());
        }
        TOPIC_CMD_CONTROL => {
            if let Some(enabled) = parse_on_off(&message) {
                with_engine(app_state, |engine, ctx, now| {
                    engine.set_control_enabled(enabled, ctx, now)
                })
                .await;
            }
            return Ok(());
        }
        TOPIC_CMD_AIRCON => {
            if let Some(on) = parse_on_off(&message) {
                with_engine(app_state, |engine, ctx, now| engine.set_aircon(on, ctx, now))
                    .await;
            }
            return Ok(());
        }
        TOPIC_CMD_RESET => {
            with_engine(app_state, |engine, ctx, now| engine.reset(ctx, now)).await;
            return Ok(());
        }
        _ => {}
    }

    if let Some(name) = topic.strip_prefix(TOPIC_CMD_SETTING_PREFIX) {
        if let Ok(value) = message.trim().parse::<f64>() {
            let name = name.to_string();
            with_engine(app_state, |engine, ctx, now| {
                engine.update_setting(&name, value, ctx, now)
            })
            .await;
            persist_runtime_from_state(app_state).await?;
        }
        return Ok(());
    }

    if let Some((room, metric)) = parse_sensor_topic(&topic) {
        match metric {
            SensorMetric::Temperature => {
                let value = parse_reading(&topic, &message, parse_temperature);
                with_engine(app_state, |engine, ctx, now| {
                    engine.handle_sensor_temperature(room, value, ctx, now)
                })
                .await;
            }
            SensorMetric::Humidity => {
                let value = parse_reading(&topic, &message, parse_humidity);
                with_engine(app_state, |engine, ctx, now| {
                    engine.handle_sensor_humidity(room, value, ctx, now)
                })
                .await;
            }
        }
        return Ok(());
    }

    if let Some(hours) = parse_forecast_topic(&topic) {
        if let Some(value) = parse_reading(&topic, &message, parse_temperature) {
            let mut engine = app_state.engine.lock().await;
            engine.record_forecast(hours, value);
        }
        return Ok(());
    }

    if let Some(room) = parse_motion_topic(&topic) {
        let occupied = message.eq_ignore_ascii_case("on");
        let changed = {
            let mut home = app_state.home.lock().await;
            home.presence.set_motion(room, occupied, now_ms)
        };
        if changed {
            with_engine(app_state, |engine, ctx, now| {
                engine.handle_room_presence(room, occupied, ctx, now)
            })
            .await;
        }
        return Ok(());
    }

    Ok(())
}

enum SensorMetric {
    Temperature,
    Humidity,
}

fn parse_sensor_topic(topic: &str) -> Option<(Room, SensorMetric)> {
    let rest = topic.strip_prefix("home/sensor/")?;
    let (room, metric) = rest.split_once('/')?;
    let room = Room::parse(room)?;
    match metric {
        "temperature" => Some((room, SensorMetric::Temperature)),
        "humidity" => Some((room, SensorMetric::Humidity)),
        _ => None,
    }
}

fn parse_forecast_topic(topic: &str) -> Option<u8> {
    let rest = topic.strip_prefix("home/weather/forecast/")?;
    rest.strip_suffix('h')?.parse().ok()
}

fn parse_motion_topic(topic: &str) -> Option<Room> {
    let rest = topic.strip_prefix("home/presence/")?;
    let (room, attribute) = rest.split_once('/')?;
    if attribute != "occupied" {
        return None;
    }
    Room::parse(room)
}

fn parse_on_off(message: &str) -> Option<bool> {
    match message.trim().to_ascii_lowercase().as_str() {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

/// Parse a raw reading; errors are logged and surfaced as absent values,
/// never defaulted.
fn parse_reading(
    topic: &str,
    message: &str,
    parser: fn(&str) -> Result<f64, climate_common::monitor::ReadingError>,
) -> Option<f64> {
    match parser(message) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(%topic, %message, %err, "dropping unparsable reading");
            None
        }
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.engine.lock().await;
    let home = state.home.lock().await;
    Json(StatusBody {
        engine: engine.status(),
        scene: home.scene.as_str().to_string(),
        bed_time: home.is_bed_time(),
    })
}

async fn handle_set_control(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(enabled) = params.get("value").and_then(|value| parse_on_off(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or invalid 'value' (on/off)");
    };
    with_engine(&state, |engine, ctx, now| {
        engine.set_control_enabled(enabled, ctx, now)
    })
    .await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_aircon(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(on) = params.get("value").and_then(|value| parse_on_off(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or invalid 'value' (on/off)");
    };
    with_engine(&state, |engine, ctx, now| engine.set_aircon(on, ctx, now)).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_reset(State(state): State<AppState>) -> impl IntoResponse {
    with_engine(&state, |engine, ctx, now| engine.reset(ctx, now)).await;
    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_settings(State(state): State<AppState>) -> impl IntoResponse {
    let settings = state.engine.lock().await.settings().clone();
    Json(settings)
}

async fn handle_put_setting(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(name) = params.get("name").cloned() else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'name' parameter");
    };
    let Some(value) = params.get("value").and_then(|value| value.parse::<f64>().ok()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or invalid 'value' parameter");
    };
    with_engine(&state, |engine, ctx, now| {
        engine.update_setting(&name, value, ctx, now)
    })
    .await;

    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist setting update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist settings",
        );
    }
    handle_get_settings(State(state)).await.into_response()
}

async fn handle_put_door_delay(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(minutes) = params
        .get("minutes")
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|minutes| *minutes >= 0.0)
    else {
        return error_response(StatusCode::BAD_REQUEST, "Missing or invalid 'minutes'");
    };
    with_engine(&state, |engine, ctx, _now| {
        engine.set_door_check_delay(minutes, ctx)
    })
    .await;

    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist door delay update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist settings",
        );
    }
    handle_get_status(State(state)).await.into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("CLIMATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.climate"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

async fn persist_runtime_from_state(state: &AppState) -> anyhow::Result<()> {
    let settings = state.engine.lock().await.settings().clone();
    let mut runtime = state.store.load_runtime_config().await?;
    runtime.settings = settings;
    state.store.save_runtime_config(&runtime).await
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_topics_route_to_rooms() {
        assert!(matches!(
            parse_sensor_topic("home/sensor/bedroom/temperature"),
            Some((Room::Bedroom, SensorMetric::Temperature))
        ));
        assert!(matches!(
            parse_sensor_topic("home/sensor/office/humidity"),
            Some((Room::Office, SensorMetric::Humidity))
        ));
        assert!(parse_sensor_topic("home/sensor/kitchen_door").is_none());
        assert!(parse_sensor_topic("home/sensor/garage/temperature").is_none());
    }

    #[test]
    fn forecast_and_motion_topics_parse() {
        assert_eq!(parse_forecast_topic("home/weather/forecast/6h"), Some(6));
        assert_eq!(parse_forecast_topic("home/weather/forecast/never"), None);
        assert_eq!(
            parse_motion_topic("home/presence/nursery/occupied"),
            Some(Room::Nursery)
        );
        assert_eq!(parse_motion_topic("home/presence/anyone_home"), None);
    }

    #[test]
    fn on_off_payloads() {
        assert_eq!(parse_on_off(" ON "), Some(true));
        assert_eq!(parse_on_off("off"), Some(false));
        assert_eq!(parse_on_off("maybe"), None);
    }
}
