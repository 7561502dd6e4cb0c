use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::dht22;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use climate_logger_common::{
    provisioning::{CAPTIVE_PROBE_PATHS, MAX_PROVISIONING_BODY, PORTAL_HTML},
    BootPlan, LinkAction, NetworkConfig, ProvisioningRequest, ProvisioningResponse,
    ProvisioningView, Reading, ReportCycle, SensorError, StoredConfig, TickAction, UploadError,
    UploadStatus, WriteRequest,
};

const NVS_NAMESPACE: &str = "climate";
const NVS_CONFIG_KEY: &str = "config_json";

const DHT22_PIN: i32 = 15;

const PROVISIONING_AP_SSID: &str = "ClimateLogger-Setup";
const PROVISIONING_AP_PASSWORD: &str = "climate-setup";
const PROVISIONING_RETRY_AFTER_SEC: u64 = 600;
const WATCHDOG_TIMEOUT_SEC: u64 = 90;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 500;
const RECONNECT_SETTLE_MS: u64 = 100;
const LOOP_TICK_MS: u64 = 100;
const RESTART_DELAY_MS: u64 = 500;

type Wifi<'a> = BlockingWifi<&'a mut EspWifi<'static>>;

struct Dht22Sensor {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl Dht22Sensor {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;

        info!("DHT22 configured on GPIO{}", DHT22_PIN);
        Ok(Self { pin, delay: Ets })
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        self.pin
            .set_high()
            .map_err(|err| SensorError::Driver(format!("failed to release data line: {err:?}")))?;

        let raw = dht22::blocking::read(&mut self.delay, &mut self.pin)
            .map_err(|err| SensorError::Driver(format!("{err:?}")))?;

        Reading::new(raw.temperature, raw.relative_humidity)
    }
}

pub fn run_firmware() -> anyhow::Result<()> {
    // Report timer counts from boot.
    monotonic_ms();
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut stored = nvs_store.load_stored_config().unwrap_or_else(|err| {
        warn!("failed to load configuration from NVS: {err:#}");
        StoredConfig::default()
    });
    stored.seed_wifi_defaults(option_env!("WIFI_SSID"), option_env!("WIFI_PASS"));

    let Peripherals { modem, pins, .. } = Peripherals::take()?;

    let mut sensor =
        Dht22Sensor::new(pins.gpio15.downgrade()).context("failed to initialize DHT22")?;

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let config = match BootPlan::from_stored(&stored) {
        BootPlan::Run(config) => config,
        BootPlan::Provision(reason) => {
            warn!("configuration incomplete ({reason}); entering provisioning mode");
            return run_provisioning(&mut wifi, nvs_store, None);
        }
    };
    info!("configuration loaded: {config}");

    if let Err(err) = connect_wifi(&mut wifi, &config.network) {
        warn!("wifi station unavailable ({err:#}); entering provisioning mode");
        let _ = wifi.disconnect();
        let _ = wifi.stop();
        return run_provisioning(
            &mut wifi,
            nvs_store,
            Some(Duration::from_secs(PROVISIONING_RETRY_AFTER_SEC)),
        );
    }
    disable_wifi_power_save();

    let watchdog = LoopWatchdog::arm(Duration::from_secs(WATCHDOG_TIMEOUT_SEC))?;

    let mut cycle = ReportCycle::new(&config);
    info!(
        "reporting every {} ms to {}",
        cycle.scheduler().interval_ms(),
        config.database.url
    );

    loop {
        watchdog.feed();
        let now_ms = monotonic_ms();

        if ensure_connected(&mut wifi, &mut cycle, now_ms) {
            if cycle.poll(now_ms) == TickAction::Report {
                report(&cycle, &mut sensor);
            }
        }

        thread::sleep(Duration::from_millis(LOOP_TICK_MS));
    }
}

fn ensure_connected(wifi: &mut Wifi<'_>, cycle: &mut ReportCycle, now_ms: u64) -> bool {
    let connected = wifi.is_up().unwrap_or(false);

    match cycle.check_link(connected, now_ms) {
        LinkAction::Online => return true,
        LinkAction::Restored { downtime_ms } => {
            info!("wifi back after {}s", downtime_ms / 1000);
            return true;
        }
        LinkAction::Reconnect { first_attempt } => {
            if first_attempt {
                warn!("wifi disconnected; attempting to reconnect");
            }
        }
        LinkAction::Offline => return false,
    }

    if let Err(err) = wifi.wifi_mut().connect() {
        debug!("wifi reconnect request failed: {err:?}");
    }
    thread::sleep(Duration::from_millis(RECONNECT_SETTLE_MS));

    let connected = wifi.is_up().unwrap_or(false);
    match cycle.after_reconnect(connected, now_ms) {
        LinkAction::Restored { downtime_ms } => {
            info!("reconnected to wifi after {}s", downtime_ms / 1000);
            true
        }
        LinkAction::Online => true,
        _ => false,
    }
}

fn report(cycle: &ReportCycle, sensor: &mut Dht22Sensor) {
    let reading = sensor.read();
    match &reading {
        Ok(reading) => info!(
            "Temperature: {:.2}°C, Humidity: {:.2}%",
            reading.temperature_c, reading.humidity
        ),
        Err(err) => warn!("failed to read DHT22 on GPIO{}: {err}", DHT22_PIN),
    }

    let Some(request) = cycle.on_reading(reading) else {
        return;
    };

    info!("writing to InfluxDB at {}", request.url);
    debug!("line protocol payload:\n{}", request.body);

    match UploadStatus::classify(post_write(&request)) {
        UploadStatus::Accepted(code) => info!("data sent to InfluxDB - HTTP {code}"),
        UploadStatus::Rejected(code) => {
            warn!("InfluxDB rejected write - HTTP {code}; check token, bucket and org")
        }
        UploadStatus::Failed(err) => {
            warn!("failed to send data to InfluxDB: {err}; check wifi and database url")
        }
    }
}

fn post_write(request: &WriteRequest) -> Result<u16, UploadError> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(request.timeout),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let connection = EspHttpConnection::new(&http_conf).map_err(transport_error)?;
    let mut client = HttpClient::wrap(connection);

    let content_length = request.body.len().to_string();
    let [authorization, content_type] = request.headers();
    let headers = [
        authorization,
        content_type,
        ("Content-Length", content_length.as_str()),
    ];

    let mut outgoing = client
        .request(Method::Post, &request.url, &headers)
        .map_err(transport_error)?;
    outgoing
        .write_all(request.body.as_bytes())
        .map_err(transport_error)?;
    outgoing.flush().map_err(transport_error)?;

    let response = outgoing.submit().map_err(transport_error)?;
    Ok(response.status())
}

fn transport_error<E: core::fmt::Debug>(err: E) -> UploadError {
    UploadError::Transport(format!("{err:?}"))
}

fn connect_wifi(wifi: &mut Wifi<'_>, network: &NetworkConfig) -> anyhow::Result<()> {
    let auth_method = if network.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow::Error::from(err).context(format!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed"
        )));
    }

    let ip_info = wifi.wifi().sta_netif().get_ip_info()?;
    info!("connected to wifi, ip address {}", ip_info.ip);
    Ok(())
}

/// Serves the setup portal until a configuration is saved (which restarts
/// the device). With `retry_after`, a device that already has a complete
/// configuration restarts to retry its station credentials.
fn run_provisioning(
    wifi: &mut Wifi<'_>,
    nvs_store: NvsStore,
    retry_after: Option<Duration>,
) -> anyhow::Result<()> {
    start_provisioning_ap(wifi)?;
    let _server = create_provisioning_http_server(nvs_store)?;

    let started = Instant::now();
    loop {
        thread::sleep(Duration::from_secs(1));

        if retry_after.is_some_and(|limit| started.elapsed() >= limit) {
            warn!("no provisioning update received; restarting to retry wifi");
            thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
    }
}

fn start_provisioning_ap(wifi: &mut Wifi<'_>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPAWPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!(
        "provisioning AP started on `{}` (password: `{}`)",
        PROVISIONING_AP_SSID, PROVISIONING_AP_PASSWORD
    );
    Ok(())
}

fn create_provisioning_http_server(nvs_store: NvsStore) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for path in CAPTIVE_PROBE_PATHS {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Get, move |req| {
            let stored = nvs_store.load_stored_config().unwrap_or_default();
            respond_json(req, 200, &ProvisioningView::from_stored(&stored))
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/config", Method::Put, move |mut req| {
        let body = read_request_body(&mut req)?;
        let update: ProvisioningRequest =
            serde_json::from_slice(&body).context("invalid provisioning payload")?;

        let mut stored = nvs_store.load_stored_config().unwrap_or_default();
        if let Err(message) = update.validate(&stored) {
            return respond_json(req, 400, &serde_json::json!({ "error": message }));
        }

        update.apply_to(&mut stored);
        nvs_store.save_stored_config(&stored)?;
        info!("provisioning saved; restarting into station mode");

        let payload = ProvisioningResponse {
            saved: true,
            restart_required: true,
            config: ProvisioningView::from_stored(&stored),
        };
        respond_json(req, 200, &payload)?;
        schedule_restart()
    })?;

    server.fn_handler::<anyhow::Error, _>("/api/restart", Method::Post, move |req| {
        respond_json(req, 200, &serde_json::json!({ "restarting": true }))?;
        schedule_restart()
    })?;

    Ok(server)
}

fn schedule_restart() -> anyhow::Result<()> {
    thread::Builder::new()
        .name("restart-request".into())
        .spawn(|| {
            thread::sleep(Duration::from_millis(RESTART_DELAY_MS));
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .context("failed to spawn restart thread")?;
    Ok(())
}

type PortalRequest<'r, 'c> =
    esp_idf_svc::http::server::Request<&'r mut esp_idf_svc::http::server::EspHttpConnection<'c>>;

fn read_request_body(req: &mut PortalRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_PROVISIONING_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn respond_json<T: Serialize>(
    req: PortalRequest<'_, '_>,
    status: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

impl NvsStore {
    fn load_stored_config(&self) -> anyhow::Result<StoredConfig> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<StoredConfig>(value)?),
            None => Ok(StoredConfig::default()),
        }
    }

    fn save_stored_config(&self, stored: &StoredConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(stored)?;
        nvs.set_str(NVS_CONFIG_KEY, &payload)?;
        Ok(())
    }
}

/// Task watchdog subscription for the report loop; panics the chip if the
/// loop stops feeding it.
struct LoopWatchdog;

impl LoopWatchdog {
    fn arm(timeout: Duration) -> anyhow::Result<Self> {
        let config = esp_idf_svc::sys::esp_task_wdt_config_t {
            timeout_ms: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
            idle_core_mask: 0,
            trigger_panic: true,
        };
        // Already initialised by the IDF startup code is fine.
        wdt_result("init", unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) })?;
        wdt_result("add", unsafe {
            esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut())
        })?;
        Ok(Self)
    }

    fn feed(&self) {
        let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
    }
}

fn wdt_result(step: &str, rc: esp_idf_svc::sys::esp_err_t) -> anyhow::Result<()> {
    match rc {
        esp_idf_svc::sys::ESP_OK | esp_idf_svc::sys::ESP_ERR_INVALID_STATE => Ok(()),
        code => Err(anyhow!("task watchdog {step} failed: esp_err_t={code}")),
    }
}

/// Modem sleep delays the first packet after an idle interval.
fn disable_wifi_power_save() {
    use esp_idf_svc::sys::{esp_wifi_set_ps, wifi_ps_type_t_WIFI_PS_NONE, ESP_OK};

    match unsafe { esp_wifi_set_ps(wifi_ps_type_t_WIFI_PS_NONE) } {
        ESP_OK => debug!("wifi modem sleep off"),
        rc => warn!("wifi modem sleep left on: esp_err_t={rc}"),
    }
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
