use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{Mutex, Notify},
};
use tracing::{debug, info, warn};

use climate_logger_common::{
    provisioning::{CAPTIVE_PROBE_PATHS, PORTAL_HTML},
    BootPlan, DeviceConfig, LinkAction, ProvisioningRequest, ProvisioningResponse,
    ProvisioningView, Reading, ReportCycle, SensorError, StoredConfig, TickAction, UploadError,
    UploadStatus, WriteRequest, UPLOAD_TIMEOUT,
};

const LOOP_TICK_MS: u64 = 100;

#[derive(Clone)]
struct ConfigStore {
    config_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Clone)]
struct PortalState {
    store: ConfigStore,
    saved: Arc<Notify>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Stand-in for the DHT22: a slow deterministic drift around room conditions.
struct SimulatedSensor {
    tick: u64,
}

impl SimulatedSensor {
    fn read(&mut self) -> Result<Reading, SensorError> {
        self.tick = self.tick.saturating_add(1);
        let temperature_c = 21.0 + ((self.tick % 8) as f32 * 0.25);
        let humidity = 45.0 + ((self.tick % 6) as f32 * 0.5);
        Reading::new(temperature_c, humidity)
    }
}

pub async fn run_simulation() -> anyhow::Result<()> {
    // Report timer counts from process start.
    monotonic_ms();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let config = loop {
        let mut stored = store.load_stored_config().await.unwrap_or_else(|err| {
            warn!("failed to load configuration from store: {err:#}");
            StoredConfig::default()
        });
        stored.seed_wifi_defaults(
            std::env::var("WIFI_SSID").ok().as_deref(),
            std::env::var("WIFI_PASS").ok().as_deref(),
        );

        match BootPlan::from_stored(&stored) {
            BootPlan::Run(config) => break config,
            BootPlan::Provision(reason) => {
                warn!("configuration incomplete ({reason}); starting provisioning portal");
                run_portal(store.clone()).await?;
            }
        }
    };
    info!("configuration loaded: {config}");

    run_reporting(config).await
}

async fn run_reporting(config: DeviceConfig) -> anyhow::Result<()> {
    let mut cycle = ReportCycle::new(&config);
    let mut sensor = SimulatedSensor { tick: 0 };
    let mut interval = tokio::time::interval(Duration::from_millis(LOOP_TICK_MS));
    let client = reqwest::Client::builder()
        .timeout(UPLOAD_TIMEOUT)
        .build()
        .context("failed to build upload client")?;

    info!(
        "reporting every {} ms to {}",
        cycle.scheduler().interval_ms(),
        config.database.url
    );

    loop {
        interval.tick().await;
        let now_ms = monotonic_ms();

        // The host has no radio; the link is always up.
        match cycle.check_link(true, now_ms) {
            LinkAction::Online | LinkAction::Restored { .. } => {}
            LinkAction::Reconnect { .. } | LinkAction::Offline => continue,
        }

        if cycle.poll(now_ms) != TickAction::Report {
            continue;
        }

        let reading = sensor.read();
        match &reading {
            Ok(reading) => info!(
                "Temperature: {:.2}°C, Humidity: {:.2}%",
                reading.temperature_c, reading.humidity
            ),
            Err(err) => warn!("failed to read simulated sensor: {err}"),
        }

        let Some(request) = cycle.on_reading(reading) else {
            continue;
        };

        info!("writing to InfluxDB at {}", request.url);
        debug!("line protocol payload:\n{}", request.body);

        match UploadStatus::classify(post_write(&client, &request).await) {
            UploadStatus::Accepted(code) => info!("data sent to InfluxDB - HTTP {code}"),
            UploadStatus::Rejected(code) => {
                warn!("InfluxDB rejected write - HTTP {code}; check token, bucket and org")
            }
            UploadStatus::Failed(err) => {
                warn!("failed to send data to InfluxDB: {err}; check database url")
            }
        }
    }
}

async fn run_portal(store: ConfigStore) -> anyhow::Result<()> {
    let state = PortalState {
        store,
        saved: Arc::new(Notify::new()),
    };
    let saved = state.saved.clone();

    let mut app = Router::new();
    for path in CAPTIVE_PROBE_PATHS {
        app = app.route(path, get(handle_portal_page));
    }
    let app = app
        .route("/api/config", get(handle_get_config).put(handle_put_config))
        .with_state(state);

    let port = std::env::var("CLIMATE_PORTAL_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind provisioning portal at {addr}"))?;

    info!("provisioning portal listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { saved.notified().await })
        .await?;
    Ok(())
}

async fn handle_portal_page() -> Html<&'static str> {
    Html(PORTAL_HTML)
}

async fn handle_get_config(State(state): State<PortalState>) -> impl IntoResponse {
    let stored = state.store.load_stored_config().await.unwrap_or_default();
    Json(ProvisioningView::from_stored(&stored))
}

async fn handle_put_config(
    State(state): State<PortalState>,
    Json(update): Json<ProvisioningRequest>,
) -> axum::response::Response {
    let mut stored = state.store.load_stored_config().await.unwrap_or_default();
    if let Err(message) = update.validate(&stored) {
        return error_response(StatusCode::BAD_REQUEST, message);
    }

    update.apply_to(&mut stored);
    if let Err(err) = state.store.save_stored_config(&stored).await {
        warn!("failed to persist provisioning update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to save configuration",
        );
    }

    info!("provisioning saved");
    state.saved.notify_one();

    Json(ProvisioningResponse {
        saved: true,
        restart_required: false,
        config: ProvisioningView::from_stored(&stored),
    })
    .into_response()
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

async fn post_write(client: &reqwest::Client, request: &WriteRequest) -> Result<u16, UploadError> {
    let mut outgoing = client
        .post(&request.url)
        .timeout(request.timeout)
        .body(request.body.clone());
    for (name, value) in request.headers() {
        outgoing = outgoing.header(name, value);
    }

    let response = outgoing.send().await.map_err(|err| {
        if err.is_timeout() {
            UploadError::Timeout(request.timeout)
        } else {
            UploadError::Transport(err.to_string())
        }
    })?;

    Ok(response.status().as_u16())
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("CLIMATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.climate-logger"));

        Self {
            config_path: Arc::new(data_dir.join("config.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_stored_config(&self) -> anyhow::Result<StoredConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.config_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<StoredConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(StoredConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_stored_config(&self, stored: &StoredConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.config_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(stored)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
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

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    /// Accepts one connection, collects the request until the line-protocol
    /// body is complete, answers with `reply` and hands back what it received.
    async fn capture_one_request(
        bind: &str,
        reply: &'static [u8],
    ) -> (SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind(bind).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0_u8; 2048];
            let mut received = Vec::new();
            loop {
                let read = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..read]);
                if read == 0 || String::from_utf8_lossy(&received).contains("value=45.00") {
                    break;
                }
            }
            socket.write_all(reply).await.unwrap();
            String::from_utf8(received).unwrap()
        });

        (addr, server)
    }

    fn write_request(url: String) -> WriteRequest {
        WriteRequest {
            url,
            authorization: "Token abc".to_string(),
            body: "temperature,device=esp32 value=21.50\nhumidity,device=esp32 value=45.00"
                .to_string(),
            timeout: Duration::from_secs(3),
        }
    }

    fn upload_client() -> reqwest::Client {
        reqwest::Client::builder().build().unwrap()
    }

    #[test]
    fn simulated_sensor_stays_valid() {
        let mut sensor = SimulatedSensor { tick: 0 };
        for _ in 0..24 {
            let reading = sensor.read().unwrap();
            assert!((21.0..23.0).contains(&reading.temperature_c));
            assert!((45.0..48.0).contains(&reading.humidity));
        }
    }

    #[test]
    fn report_clock_keeps_its_first_anchor() {
        let anchored = monotonic_ms();
        std::thread::sleep(Duration::from_millis(20));

        assert!(monotonic_ms() >= anchored + 20);
    }

    #[tokio::test]
    async fn write_against_local_listener() {
        let (addr, server) =
            capture_one_request("127.0.0.1:0", b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let request = write_request(format!(
            "http://{addr}/api/v2/write?bucket=b&org=iotlab&precision=s"
        ));

        assert_eq!(post_write(&upload_client(), &request).await, Ok(204));

        let received = server.await.unwrap();
        let lowered = received.to_ascii_lowercase();
        assert!(received.starts_with("POST /api/v2/write?bucket=b&org=iotlab&precision=s HTTP/1.1"));
        assert!(lowered.contains(&format!("host: {addr}\r\n")));
        assert!(lowered.contains("authorization: token abc\r\n"));
        assert!(lowered.contains("content-type: text/plain\r\n"));
        assert!(received.ends_with("value=45.00"));
    }

    #[tokio::test]
    async fn write_reaches_ipv6_literal_host() {
        if TcpListener::bind("[::1]:0").await.is_err() {
            eprintln!("no IPv6 loopback on this host; skipping");
            return;
        }
        let (addr, server) =
            capture_one_request("[::1]:0", b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let request = write_request(format!("http://{addr}/api/v2/write?bucket=b&org=o"));

        assert_eq!(post_write(&upload_client(), &request).await, Ok(204));
        assert!(server.await.unwrap().ends_with("value=45.00"));
    }

    #[tokio::test]
    async fn encoded_bucket_survives_the_request_line() {
        let (addr, server) =
            capture_one_request("127.0.0.1:0", b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let database = climate_logger_common::DatabaseConfig {
            url: format!("http://{addr}"),
            token: "abc".to_string(),
            bucket: "home sensors".to_string(),
            org: "iot&lab".to_string(),
        };
        let reading = Reading::new(21.5, 45.0).unwrap();
        let request = WriteRequest::new(&database, &reading);

        assert_eq!(post_write(&upload_client(), &request).await, Ok(204));
        assert!(server.await.unwrap().starts_with(
            "POST /api/v2/write?bucket=home+sensors&org=iot%26lab&precision=s HTTP/1.1"
        ));
    }

    #[tokio::test]
    async fn rejected_write_reports_status() {
        let (addr, server) = capture_one_request(
            "127.0.0.1:0",
            b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let request = write_request(format!("http://{addr}/api/v2/write"));

        assert_eq!(
            UploadStatus::classify(post_write(&upload_client(), &request).await),
            UploadStatus::Rejected(401)
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let mut request = write_request(format!("http://{addr}/api/v2/write"));
        request.timeout = Duration::from_millis(200);

        assert_eq!(
            post_write(&upload_client(), &request).await,
            Err(UploadError::Timeout(Duration::from_millis(200)))
        );
        server.abort();
    }

    #[tokio::test]
    async fn error_response_carries_json_message() {
        let response = error_response(StatusCode::BAD_REQUEST, "wifiSsid cannot be empty");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], br#"{"error":"wifiSsid cannot be empty"}"#);
    }
}
