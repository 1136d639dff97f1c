use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveTime, Offset, Utc};
use chrono_tz::Tz;
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{Mutex, Notify},
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use heater_common::{
    config::NetworkConfig, CommandOutcome, CommandSource, ConfigError, ControlConfig,
    ControllerAction, ControllerState, LinkStatus, Liveness, Publication, RelayCommand,
    RuntimeConfig, SuspendRequest, TemperatureSample, TickInput, WakeCause, TOPIC_RELAY_COMMAND,
    TOPIC_STATUS,
};

use crate::log_buffer::{LogBuffer, LOG_BUFFER_CAPACITY};

const MAX_MQTT_PAYLOAD_BYTES: usize = 64;

#[derive(Clone)]
struct AppState {
    controller: Arc<Mutex<ControllerState>>,
    runtime: Arc<Mutex<RuntimeConfig>>,
    probe: Arc<Mutex<SimulatedProbe>>,
    pins: Arc<Mutex<SimulatedPins>>,
    link: Arc<LinkFlags>,
    suspended: Arc<AtomicBool>,
    wake_button: Arc<Notify>,
    mqtt: AsyncClient,
    store: AppStore,
    logs: LogBuffer,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// Host stand-in for the wifi driver and MQTT session state.
#[derive(Default)]
struct LinkFlags {
    radio_enabled: AtomicBool,
    bus_up: AtomicBool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct RelayRequest {
    command: String,
}

#[derive(Debug, Serialize)]
struct RelayResponse {
    ok: bool,
    accepted: bool,
    relay: bool,
}

#[derive(Debug, Serialize)]
struct ConfigSaved {
    saved: bool,
    config: ControlConfig,
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    logs: Vec<String>,
}

#[derive(Debug, Serialize)]
struct WakeResponse {
    ok: bool,
    #[serde(rename = "wasSuspended")]
    was_suspended: bool,
}

pub async fn run() -> anyhow::Result<()> {
    let logs = LogBuffer::new(LOG_BUFFER_CAPACITY);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(logs.layer())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    if let Some(err) = runtime.sanitize() {
        warn!("persisted control config rejected, using defaults: {err}");
    }
    runtime.network = network_with_overrides(&runtime.network, |key| std::env::var(key).ok());

    let mut mqtt_options = MqttOptions::new(
        runtime.network.hostname.clone(),
        runtime.network.mqtt_host.clone(),
        runtime.network.mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(15));
    mqtt_options.set_last_will(LastWill::new(
        TOPIC_STATUS,
        Liveness::Offline.as_str(),
        QoS::AtLeastOnce,
        true,
    ));
    if !runtime.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            runtime.network.mqtt_user.clone(),
            runtime.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let controller = ControllerState::new(
        runtime.control,
        runtime.timing.clone(),
        WakeCause::PowerOn,
        runtime.hardware.wake_button().is_some(),
        monotonic_ms(),
    )?;

    let app_state = AppState {
        controller: Arc::new(Mutex::new(controller)),
        runtime: Arc::new(Mutex::new(runtime)),
        probe: Arc::new(Mutex::new(SimulatedProbe::from_env())),
        pins: Arc::new(Mutex::new(SimulatedPins::default())),
        link: Arc::new(LinkFlags::default()),
        suspended: Arc::new(AtomicBool::new(false)),
        wake_button: Arc::new(Notify::new()),
        mqtt,
        store,
        logs,
    };
    app_state.link.radio_enabled.store(true, Ordering::Relaxed);

    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_http_server(app_state.clone()).await?;

    tokio::select! {
        result = run_sessions(app_state) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}

async fn spawn_http_server(app_state: AppState) -> anyhow::Result<()> {
    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/relay", post(handle_post_relay))
        .route(
            "/api/config",
            get(handle_get_config).post(handle_post_config),
        )
        .route("/api/logs", get(handle_get_logs))
        .route("/api/wake", post(handle_post_wake))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("HEATER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind heater server at {addr}"))?;

    info!("heater controller listening on http://{addr}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("http server stopped: {err}");
        }
    });
    Ok(())
}

/// Control session, simulated deep sleep, reboot; forever.
async fn run_sessions(app_state: AppState) -> anyhow::Result<()> {
    loop {
        let request = run_control_session(&app_state).await;
        let wake = simulate_deep_sleep(&app_state, request).await;
        reboot_controller(&app_state, wake).await?;
    }
}

async fn run_control_session(app_state: &AppState) -> SuspendRequest {
    let tick_ms = app_state.runtime.lock().await.timing.tick_interval_ms.max(1);
    let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let now_ms = monotonic_ms();
        let clock = current_clock(app_state).await;

        let relay_on = app_state.pins.lock().await.relay_on();
        let sample = app_state.probe.lock().await.sample(relay_on, now_ms);

        let input = TickInput {
            sample,
            clock,
            link: app_state.link.status(),
            now_ms,
        };
        if let Some(request) = apply_tick(app_state, input).await {
            return request;
        }
    }
}

/// Ticks the controller and applies its actions without releasing the
/// controller lock, so a command or config update cannot land between
/// arbitration and the pin write.
async fn apply_tick(app_state: &AppState, input: TickInput) -> Option<SuspendRequest> {
    let mut controller = app_state.controller.lock().await;
    let outcome = controller.tick(input);
    execute_actions(app_state, outcome.actions).await;
    outcome.suspend
}

async fn apply_command(
    app_state: &AppState,
    source: CommandSource,
    command: RelayCommand,
    clock: Option<NaiveTime>,
    now_ms: u64,
) -> CommandOutcome {
    let mut controller = app_state.controller.lock().await;
    let mut outcome = controller.handle_command(source, command, clock, now_ms);
    execute_actions(app_state, std::mem::take(&mut outcome.actions)).await;
    outcome
}

async fn apply_config(
    app_state: &AppState,
    config: ControlConfig,
    clock: Option<NaiveTime>,
    now_ms: u64,
) -> Result<(), ConfigError> {
    let mut controller = app_state.controller.lock().await;
    let actions = controller.update_config(config, clock, now_ms)?;
    execute_actions(app_state, actions).await;
    Ok(())
}

async fn simulate_deep_sleep(app_state: &AppState, request: SuspendRequest) -> WakeCause {
    app_state.suspended.store(true, Ordering::Relaxed);
    info!(
        "entering simulated deep sleep for {}s (manual wake {})",
        request.duration.as_secs(),
        if request.manual_trigger {
            "armed"
        } else {
            "disabled"
        }
    );

    let wake = if request.manual_trigger {
        tokio::select! {
            _ = tokio::time::sleep(request.duration) => WakeCause::Timer,
            _ = app_state.wake_button.notified() => WakeCause::ManualTrigger,
        }
    } else {
        tokio::time::sleep(request.duration).await;
        WakeCause::Timer
    };

    info!("woke from simulated deep sleep: {wake:?}");
    wake
}

/// Rebuilds the controller from persisted config, as a real wake from deep
/// sleep would.
async fn reboot_controller(app_state: &AppState, wake: WakeCause) -> anyhow::Result<()> {
    let runtime = app_state.runtime.lock().await.clone();
    let controller = ControllerState::new(
        runtime.control,
        runtime.timing,
        wake,
        runtime.hardware.wake_button().is_some(),
        monotonic_ms(),
    )
    .context("failed to rebuild controller after wake")?;

    *app_state.controller.lock().await = controller;
    app_state.link.radio_enabled.store(true, Ordering::Relaxed);
    app_state.suspended.store(false, Ordering::Relaxed);
    Ok(())
}

async fn execute_actions(app_state: &AppState, actions: Vec<ControllerAction>) {
    for action in actions {
        match action {
            ControllerAction::SetRelay(on) => app_state.pins.lock().await.set_relay(on),
            ControllerAction::SetActiveIndicator(on) => {
                app_state.pins.lock().await.set_active_led(on)
            }
            ControllerAction::Publish(publication) => publish(app_state, publication),
            ControllerAction::PowerDownRadio => {
                if app_state.link.radio_enabled.swap(false, Ordering::Relaxed) {
                    info!("radio powered down");
                    if let Err(err) = app_state.mqtt.try_disconnect() {
                        debug!("mqtt disconnect request failed: {err}");
                    }
                }
            }
            ControllerAction::PowerUpRadio => {
                app_state.link.radio_enabled.store(true, Ordering::Relaxed);
                info!("radio powered up");
            }
        }
    }
}

fn publish(app_state: &AppState, publication: Publication) {
    if !app_state.link.radio_enabled.load(Ordering::Relaxed) {
        debug!("radio off, dropping {}", publication.topic);
        return;
    }

    info!("→ {} {}", publication.topic, publication.payload);
    if let Err(err) = app_state.mqtt.try_publish(
        publication.topic,
        QoS::AtLeastOnce,
        true,
        publication.payload,
    ) {
        warn!("mqtt publish failed: {err}");
    }
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            if !app_state.link.radio_enabled.load(Ordering::Relaxed) {
                app_state.link.bus_up.store(false, Ordering::Relaxed);
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }

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
                    app_state.link.bus_up.store(true, Ordering::Relaxed);
                    if let Err(err) = app_state
                        .mqtt
                        .try_subscribe(TOPIC_RELAY_COMMAND, QoS::AtLeastOnce)
                    {
                        warn!("mqtt subscribe failed: {err}");
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    app_state.link.bus_up.store(false, Ordering::Relaxed);
                }
                Ok(_) => {}
                Err(err) => {
                    app_state.link.bus_up.store(false, Ordering::Relaxed);
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
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
    info!("← {topic} {message}");

    if topic != TOPIC_RELAY_COMMAND {
        return Ok(());
    }

    let command = RelayCommand::parse(&message).context("rejected relay command")?;
    let clock = current_clock(app_state).await;
    apply_command(
        app_state,
        CommandSource::Telemetry,
        command,
        clock,
        monotonic_ms(),
    )
    .await;
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let clock = current_clock(&state).await;
    let status = {
        let controller = state.controller.lock().await;
        controller.status(clock, monotonic_ms())
    };
    Json(status)
}

async fn handle_post_relay(
    State(state): State<AppState>,
    payload: Result<Json<RelayRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, &rejection.body_text());
        }
    };
    let command = match RelayCommand::parse(&request.command) {
        Ok(command) => command,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    if state.suspended.load(Ordering::Relaxed) {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Device is suspended");
    }

    let clock = current_clock(&state).await;
    let outcome = apply_command(&state, CommandSource::Http, command, clock, monotonic_ms()).await;

    Json(RelayResponse {
        ok: true,
        accepted: outcome.accepted,
        relay: outcome.relay,
    })
    .into_response()
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.runtime.lock().await.control;
    Json(config)
}

async fn handle_post_config(
    State(state): State<AppState>,
    payload: Result<Json<ControlConfig>, JsonRejection>,
) -> impl IntoResponse {
    let Json(config) = match payload {
        Ok(config) => config,
        Err(rejection) => {
            return error_response(StatusCode::BAD_REQUEST, &rejection.body_text());
        }
    };
    if let Err(err) = config.validate() {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }

    let runtime = {
        let mut runtime = state.runtime.lock().await;
        runtime.control = config;
        runtime.clone()
    };
    if let Err(err) = state.store.save_runtime_config(&runtime).await {
        warn!("failed to persist config update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist configuration",
        );
    }

    if !state.suspended.load(Ordering::Relaxed) {
        let clock = current_clock(&state).await;
        if let Err(err) = apply_config(&state, config, clock, monotonic_ms()).await {
            return error_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
    }

    Json(ConfigSaved {
        saved: true,
        config,
    })
    .into_response()
}

async fn handle_get_logs(State(state): State<AppState>) -> impl IntoResponse {
    Json(LogsResponse {
        logs: state.logs.snapshot(),
    })
}

/// Simulated wake button. Only has an effect while suspended, like an ext0
/// wake source.
async fn handle_post_wake(State(state): State<AppState>) -> impl IntoResponse {
    let was_suspended = state.suspended.load(Ordering::Relaxed);
    if was_suspended {
        state.wake_button.notify_waiters();
    }
    Json(WakeResponse {
        ok: true,
        was_suspended,
    })
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("HEATER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.heater"));

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
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

impl LinkFlags {
    fn status(&self) -> LinkStatus {
        let radio = self.radio_enabled.load(Ordering::Relaxed);
        LinkStatus {
            network_up: radio,
            bus_up: radio && self.bus_up.load(Ordering::Relaxed),
        }
    }
}

/// First-order water tank model: the element adds heat at a fixed rate and
/// the tank loses heat towards ambient.
#[derive(Debug, Clone)]
struct SimulatedProbe {
    temp_c: f32,
    ambient_c: f32,
    heating_c_per_min: f32,
    loss_per_min: f32,
    disconnected: bool,
    last_ms: Option<u64>,
}

impl Default for SimulatedProbe {
    fn default() -> Self {
        Self {
            temp_c: 45.0,
            ambient_c: 18.0,
            heating_c_per_min: 0.6,
            loss_per_min: 0.002,
            disconnected: false,
            last_ms: None,
        }
    }
}

impl SimulatedProbe {
    fn from_env() -> Self {
        let mut probe = Self::default();
        if let Some(temp_c) = std::env::var("HEATER_SIM_TEMP_C")
            .ok()
            .and_then(|value| value.parse::<f32>().ok())
            .filter(|value| value.is_finite())
        {
            probe.temp_c = temp_c;
        }
        probe.disconnected = std::env::var("HEATER_SIM_PROBE_DISCONNECTED")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        probe
    }

    fn sample(&mut self, relay_on: bool, now_ms: u64) -> TemperatureSample {
        let elapsed_min = self
            .last_ms
            .map(|last| now_ms.saturating_sub(last) as f32 / 60_000.0)
            .unwrap_or(0.0);
        self.last_ms = Some(now_ms);

        if relay_on {
            self.temp_c += self.heating_c_per_min * elapsed_min;
        }
        let loss = (self.temp_c - self.ambient_c) * self.loss_per_min * elapsed_min;
        self.temp_c -= loss;

        if self.disconnected {
            TemperatureSample::Disconnected
        } else {
            TemperatureSample::from_reading(Some(self.temp_c))
        }
    }
}

/// Logs pin writes; repeated writes of the same level are skipped.
#[derive(Debug, Default)]
struct SimulatedPins {
    relay: Option<bool>,
    relay_led: Option<bool>,
    active_led: Option<bool>,
    writes: u32,
}

impl SimulatedPins {
    fn relay_on(&self) -> bool {
        self.relay.unwrap_or(false)
    }

    fn set_relay(&mut self, on: bool) {
        if Self::write(&mut self.relay, on) {
            self.writes += 1;
            info!("relay pin {}", if on { "HIGH" } else { "LOW" });
        }
        if Self::write(&mut self.relay_led, on) {
            self.writes += 1;
        }
    }

    fn set_active_led(&mut self, on: bool) {
        if Self::write(&mut self.active_led, on) {
            self.writes += 1;
            info!("active LED {}", if on { "on" } else { "off" });
        }
    }

    fn write(pin: &mut Option<bool>, level: bool) -> bool {
        if *pin == Some(level) {
            return false;
        }
        *pin = Some(level);
        true
    }
}

fn network_with_overrides(
    network: &NetworkConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> NetworkConfig {
    let mut network = network.clone();
    if let Some(host) = lookup("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        network.mqtt_port = port;
    }
    if let Some(user) = lookup("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Some(pass) = lookup("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
    network
}

async fn current_clock(app_state: &AppState) -> Option<NaiveTime> {
    let timezone = app_state.runtime.lock().await.timezone.clone();
    now_in_timezone(&timezone).map(|now| now.time())
}

fn now_in_timezone(timezone: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
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
