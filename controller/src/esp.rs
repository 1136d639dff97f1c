use core::convert::TryInto;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{Datelike, NaiveTime, Offset, Utc};
use chrono_tz::Tz;
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};
use serde::{Deserialize, Serialize};

use heater_common::{
    CommandSource, ControlConfig, ControllerAction, ControllerState, HardwareConfig, LinkStatus,
    Liveness, NetworkConfig, Publication, RelayCommand, RuntimeConfig, SuspendRequest,
    TemperatureSample, TickInput, WakeCause, TOPIC_RELAY_COMMAND, TOPIC_STATUS,
};

const NVS_NAMESPACE: &str = "heater";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 1024;
const MAX_MQTT_PAYLOAD_BYTES: usize = 64;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const BUS_LOG_CAPACITY: usize = 50;
/// Anything earlier means the RTC was never set.
const MIN_VALID_YEAR: i32 = 2024;

const INDEX_HTML: &str = include_str!("../web/index.html");
const CONFIG_HTML: &str = include_str!("../web/config.html");
const SCRIPT_JS: &str = include_str!("../web/script.js");

#[derive(Clone)]
struct SharedState {
    controller: Arc<Mutex<ControllerState>>,
    runtime: Arc<Mutex<RuntimeConfig>>,
    outputs: Arc<Mutex<Outputs>>,
    wifi: Arc<Mutex<EspWifi<'static>>>,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
    radio_on: Arc<AtomicBool>,
    mqtt_connected: Arc<AtomicBool>,
    resubscribe_pending: Arc<AtomicBool>,
    bus_log: Arc<Mutex<VecDeque<String>>>,
}

struct OutputPin {
    driver: PinDriver<'static, AnyOutputPin, Output>,
    gpio: i32,
    level: Option<bool>,
}

struct Outputs {
    relay: OutputPin,
    relay_led: Option<OutputPin>,
    active_led: Option<OutputPin>,
}

struct TemperatureProbe {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    address: Option<Address>,
    gpio: i32,
    delay: Ets,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
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

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let wake = read_wake_cause();
    info!("heater controller v{} booting, wake cause {wake:?}", env!("CARGO_PKG_VERSION"));

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    if let Some(err) = runtime.sanitize() {
        warn!("persisted control config rejected, using defaults: {err}");
    }
    ensure_wifi_defaults(&mut runtime);

    let hardware = runtime.hardware.clone();
    let outputs = Outputs::new(&hardware).context("failed to initialize relay outputs")?;
    let probe = match TemperatureProbe::new(hardware.probe_pin) {
        Ok(probe) => Some(probe),
        Err(err) => {
            warn!("temperature probe unavailable, reporting disconnected: {err:#}");
            None
        }
    };

    let controller = ControllerState::new(
        runtime.control,
        runtime.timing.clone(),
        wake,
        hardware.wake_button().is_some(),
        monotonic_ms(),
    )?;

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let (mqtt_client, mqtt_conn) = create_mqtt_client(&runtime.network)?;
    let tick_ms = runtime.timing.tick_interval_ms.max(1);

    let state = SharedState {
        controller: Arc::new(Mutex::new(controller)),
        runtime: Arc::new(Mutex::new(runtime)),
        outputs: Arc::new(Mutex::new(outputs)),
        wifi: Arc::new(Mutex::new(wifi)),
        mqtt: Arc::new(Mutex::new(mqtt_client)),
        radio_on: Arc::new(AtomicBool::new(true)),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
        resubscribe_pending: Arc::new(AtomicBool::new(false)),
        bus_log: Arc::new(Mutex::new(VecDeque::with_capacity(BUS_LOG_CAPACITY))),
    };

    spawn_mqtt_receiver(state.clone(), mqtt_conn)?;
    spawn_control_loop(state.clone(), probe, hardware.wake_button(), tick_ms)?;

    let server = create_http_server(state, nvs_store)?;

    // Keep services alive for the program lifetime.
    let _server = server;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/config.html", Method::Get, move |req| {
        req.into_ok_response()?.write_all(CONFIG_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/script.js", Method::Get, move |req| {
        req.into_response(
            200,
            Some("OK"),
            &[("Content-Type", "application/javascript")],
        )?
        .write_all(SCRIPT_JS.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let clock = current_clock(&state);
            let status = lock(&state.controller).status(clock, monotonic_ms());
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/relay", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(request) = serde_json::from_slice::<RelayRequest>(&body) else {
                return write_error(req, 400, "Invalid relay payload");
            };
            let command = match RelayCommand::parse(&request.command) {
                Ok(command) => command,
                Err(err) => return write_error(req, 400, &err.to_string()),
            };

            let clock = current_clock(&state);
            let response = {
                let mut controller = lock(&state.controller);
                let outcome =
                    controller.handle_command(CommandSource::Http, command, clock, monotonic_ms());
                execute_actions(&state, outcome.actions);
                RelayResponse {
                    ok: true,
                    accepted: outcome.accepted,
                    relay: outcome.relay,
                }
            };

            write_json(req, &response)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            let config = lock(&state.runtime).control;
            write_json(req, &config)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(config) = serde_json::from_slice::<ControlConfig>(&body) else {
                return write_error(req, 400, "Invalid config payload");
            };
            if let Err(err) = config.validate() {
                return write_error(req, 400, &err.to_string());
            }

            let runtime = {
                let mut runtime = lock(&state.runtime);
                runtime.control = config;
                runtime.clone()
            };
            if let Err(err) = nvs_store.save_runtime_config(&runtime) {
                warn!("failed to persist config update: {err:#}");
                return write_error(req, 500, "Failed to persist configuration");
            }

            let clock = current_clock(&state);
            let applied = {
                let mut controller = lock(&state.controller);
                controller
                    .update_config(config, clock, monotonic_ms())
                    .map(|actions| execute_actions(&state, actions))
            };
            if let Err(err) = applied {
                return write_error(req, 400, &err.to_string());
            }

            write_json(
                req,
                &ConfigSaved {
                    saved: true,
                    config,
                },
            )
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/logs", Method::Get, move |req| {
            let logs = lock(&state.bus_log).iter().cloned().collect();
            write_json(req, &LogsResponse { logs })
        })?;
    }

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn has_station_credentials(network: &NetworkConfig) -> bool {
    let ssid = network.wifi_ssid.trim();
    !ssid.is_empty() && ssid != "CHANGE_ME"
}

/// Brings the station up, giving up after a few attempts. The device keeps
/// controlling the heater offline; reconnects are driven by the control loop.
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !has_station_credentials(network) {
        warn!("wifi credentials missing; running offline");
        drop(wifi);
        return Ok(esp_wifi);
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                drop(wifi);
                return Ok(esp_wifi);
            }
            Err(err) => warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    warn!("wifi unavailable after {WIFI_CONNECT_ATTEMPTS} attempts; running offline");
    drop(wifi);
    Ok(esp_wifi)
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.hostname.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        keep_alive_interval: Some(Duration::from_secs(15)),
        lwt: Some(LwtConfiguration {
            topic: TOPIC_STATUS,
            payload: Liveness::Offline.as_str().as_bytes(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_commands(state: &SharedState) -> anyhow::Result<()> {
    lock(&state.mqtt)
        .subscribe(TOPIC_RELAY_COMMAND, QoS::AtLeastOnce)
        .context("failed to subscribe to relay commands")?;
    Ok(())
}

fn spawn_mqtt_receiver(state: SharedState, mut conn: EspMqttConnection) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        state.mqtt_connected.store(true, Ordering::Relaxed);
                        // Subscribing from this thread would block event delivery.
                        state.resubscribe_pending.store(true, Ordering::Relaxed);
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        state.mqtt_connected.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }
                        if let Err(err) = handle_mqtt_message(&state, topic, data) {
                            warn!("mqtt message handling failed: {err:#}");
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    state.mqtt_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn handle_mqtt_message(state: &SharedState, topic: &str, data: &[u8]) -> anyhow::Result<()> {
    let message = core::str::from_utf8(data).context("non utf8 mqtt payload")?;
    record_bus_line(state, format!("← {topic} {message}"));

    if topic != TOPIC_RELAY_COMMAND {
        return Ok(());
    }

    let command = RelayCommand::parse(message).context("rejected relay command")?;
    let clock = current_clock(state);
    let mut controller = lock(&state.controller);
    let outcome =
        controller.handle_command(CommandSource::Telemetry, command, clock, monotonic_ms());
    execute_actions(state, outcome.actions);
    Ok(())
}

fn spawn_control_loop(
    state: SharedState,
    mut probe: Option<TemperatureProbe>,
    wake_button: Option<i32>,
    tick_ms: u64,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                if state.resubscribe_pending.swap(false, Ordering::Relaxed) {
                    if let Err(err) = subscribe_commands(&state) {
                        warn!("{err:#}");
                        state.resubscribe_pending.store(true, Ordering::Relaxed);
                    }
                }

                let sample = probe
                    .as_mut()
                    .map(TemperatureProbe::sample)
                    .unwrap_or(TemperatureSample::Disconnected);
                let radio_on = state.radio_on.load(Ordering::Relaxed);
                let link = LinkStatus {
                    network_up: radio_on && is_wifi_station_connected(),
                    bus_up: radio_on && state.mqtt_connected.load(Ordering::Relaxed),
                };

                let clock = current_clock(&state);
                let suspend = {
                    let mut controller = lock(&state.controller);
                    let outcome = controller.tick(TickInput {
                        sample,
                        clock,
                        link,
                        now_ms,
                    });
                    // Pin writes happen under the guard so no command lands between
                    // arbitration and the GPIO.
                    execute_actions(&state, outcome.actions);
                    outcome.suspend
                };

                if let Some(request) = suspend {
                    enter_deep_sleep(request, wake_button);
                }

                thread::sleep(Duration::from_millis(tick_ms));
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn execute_actions(state: &SharedState, actions: Vec<ControllerAction>) {
    for action in actions {
        match action {
            ControllerAction::SetRelay(on) => lock(&state.outputs).set_relay(on),
            ControllerAction::SetActiveIndicator(on) => lock(&state.outputs).set_active_led(on),
            ControllerAction::Publish(publication) => publish(state, publication),
            ControllerAction::PowerDownRadio => power_down_radio(state),
            ControllerAction::PowerUpRadio => power_up_radio(state),
        }
    }
}

fn publish(state: &SharedState, publication: Publication) {
    if !state.radio_on.load(Ordering::Relaxed) {
        return;
    }

    record_bus_line(
        state,
        format!("→ {} {}", publication.topic, publication.payload),
    );
    let result = lock(&state.mqtt).enqueue(
        publication.topic,
        QoS::AtLeastOnce,
        true,
        publication.payload.as_bytes(),
    );
    if let Err(err) = result {
        warn!("mqtt publish to {} failed: {err:?}", publication.topic);
    }
}

fn power_down_radio(state: &SharedState) {
    if !state.radio_on.swap(false, Ordering::Relaxed) {
        return;
    }
    state.mqtt_connected.store(false, Ordering::Relaxed);
    match lock(&state.wifi).stop() {
        Ok(()) => info!("radio powered down"),
        Err(err) => warn!("failed to stop wifi: {err:?}"),
    }
}

fn power_up_radio(state: &SharedState) {
    let mut wifi = lock(&state.wifi);
    if let Err(err) = wifi.start() {
        warn!("failed to start wifi: {err:?}");
        return;
    }
    if let Err(err) = wifi.connect() {
        warn!("wifi connect request failed: {err:?}");
    }
    state.radio_on.store(true, Ordering::Relaxed);
    info!("radio powered up");
}

fn record_bus_line(state: &SharedState, line: String) {
    let mut log = lock(&state.bus_log);
    while log.len() >= BUS_LOG_CAPACITY {
        log.pop_front();
    }
    log.push_back(line);
}

fn enter_deep_sleep(request: SuspendRequest, wake_button: Option<i32>) -> ! {
    info!(
        "entering deep sleep for {}s",
        request.duration.as_secs()
    );
    // Let the last publications and log lines drain.
    thread::sleep(Duration::from_millis(200));

    let micros: u64 = request.duration.as_micros().try_into().unwrap_or(u64::MAX);
    let rc = unsafe { esp_idf_svc::sys::esp_sleep_enable_timer_wakeup(micros) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to arm timer wake: esp_err_t={rc}");
    }

    if let (true, Some(pin)) = (request.manual_trigger, wake_button) {
        let rc = unsafe {
            esp_idf_svc::sys::rtc_gpio_pullup_en(pin);
            esp_idf_svc::sys::rtc_gpio_pulldown_dis(pin);
            esp_idf_svc::sys::esp_sleep_enable_ext0_wakeup(pin, 0)
        };
        if rc == esp_idf_svc::sys::ESP_OK {
            info!("wake button armed on GPIO{pin}");
        } else {
            warn!("failed to arm wake button on GPIO{pin}: esp_err_t={rc}");
        }
    }

    unsafe { esp_idf_svc::sys::esp_deep_sleep_start() }
}

fn read_wake_cause() -> WakeCause {
    let cause = unsafe { esp_idf_svc::sys::esp_sleep_get_wakeup_cause() };
    match cause {
        esp_idf_svc::sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER => WakeCause::Timer,
        esp_idf_svc::sys::esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT0 => WakeCause::ManualTrigger,
        _ => WakeCause::PowerOn,
    }
}

impl OutputPin {
    fn new(gpio: i32) -> anyhow::Result<Self> {
        let driver = unsafe { PinDriver::output(AnyOutputPin::new(gpio)) }
            .with_context(|| format!("GPIO{gpio} unavailable as output"))?;
        let mut pin = Self {
            driver,
            gpio,
            level: None,
        };
        pin.write(false);
        Ok(pin)
    }

    /// Writes only on a level change so a repeated command never glitches
    /// the line. A failed write forgets the level so the next call retries.
    fn write(&mut self, high: bool) {
        if self.level == Some(high) {
            return;
        }

        let result = if high {
            self.driver.set_high()
        } else {
            self.driver.set_low()
        };
        match result {
            Ok(()) => self.level = Some(high),
            Err(err) => {
                self.level = None;
                warn!("failed to drive GPIO{}: {err}", self.gpio);
            }
        }
    }
}

impl Outputs {
    fn new(hardware: &HardwareConfig) -> anyhow::Result<Self> {
        let optional_led = |gpio: i32| match OutputPin::new(gpio) {
            Ok(pin) => Some(pin),
            Err(err) => {
                warn!("indicator LED disabled: {err:#}");
                None
            }
        };

        Ok(Self {
            relay: OutputPin::new(hardware.relay_pin)?,
            relay_led: optional_led(hardware.relay_led_pin),
            active_led: optional_led(hardware.active_led_pin),
        })
    }

    fn set_relay(&mut self, on: bool) {
        self.relay.write(on);
        if let Some(led) = self.relay_led.as_mut() {
            led.write(on);
        }
    }

    fn set_active_led(&mut self, on: bool) {
        if let Some(led) = self.active_led.as_mut() {
            led.write(on);
        }
    }
}

impl TemperatureProbe {
    fn new(gpio: i32) -> anyhow::Result<Self> {
        let mut pin = unsafe { PinDriver::input_output_od(AnyIOPin::new(gpio)) }?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;

        let one_wire = OneWire::new(pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut probe = Self {
            one_wire,
            address: None,
            gpio,
            delay: Ets,
        };
        probe.refresh_address();
        Ok(probe)
    }

    fn sample(&mut self) -> TemperatureSample {
        TemperatureSample::from_reading(self.read_celsius())
    }

    fn refresh_address(&mut self) {
        self.address = self
            .one_wire
            .devices(false, &mut self.delay)
            .filter_map(|device| match device {
                Ok(address) => Some(address),
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    None
                }
            })
            .find(|address| address.family_code() == ds18b20::FAMILY_CODE);

        match self.address {
            Some(address) => info!("DS18B20 ready on GPIO{} ({:?})", self.gpio, address),
            None => warn!("no DS18B20 found on GPIO{}", self.gpio),
        }
    }

    fn read_celsius(&mut self) -> Option<f32> {
        if self.address.is_none() {
            self.refresh_address();
        }

        let address = self.address?;
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {:?}: {err:?}", address);
                self.address = None;
                return None;
            }
        };

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.address = None;
            return None;
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => Some(data.temperature),
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.address = None;
                None
            }
        }
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn current_clock(state: &SharedState) -> Option<NaiveTime> {
    let timezone = lock(&state.runtime).timezone.clone();
    let now = now_in_timezone(&timezone)?;
    (now.year() >= MIN_VALID_YEAR).then(|| now.time())
}

fn now_in_timezone(timezone: &str) -> Option<chrono::DateTime<chrono::FixedOffset>> {
    let tz: Tz = timezone.parse().ok()?;
    let local = Utc::now().with_timezone(&tz);
    Some(local.with_timezone(&local.offset().fix()))
}

/// A panicked holder leaves the data consistent enough for the next tick.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
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
