use std::{
    io::{self, ErrorKind, Read},
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use actuator_common::{
    config::{decode_persisted, is_safe_output_pin, DecodedConfig, DeviceConfig},
    connectivity::{startup_plan, ConnectivityState, NetworkEvent, StartupPlan},
    ota::{
        self, OtaError, OtaErrorKind, FIRMWARE_FETCH_TIMEOUT, MANIFEST_FETCH_TIMEOUT,
        MANIFEST_MAX_BYTES,
    },
    outputs::{self, DriverAction, OutputState},
    types::{
        ConfigUpdate, ControlRequest, GpioTestRequest, GpioTestResponse, NetworkStatus,
        OtaApplyRequest, OtaStatus, PairRequest, PairResponse, StatusResponse,
    },
    FirmwarePartition,
};

const FW_VERSION: &str = env!("CARGO_PKG_VERSION");
const OTA_MODE: &str = "signed-hmac";

/// Everything mutable lives behind this one record so a request sees a
/// consistent config/outputs pair.
struct DeviceState {
    config: DeviceConfig,
    outputs: OutputState,
    connectivity: ConnectivityState,
    ota: OtaStatus,
}

#[derive(Clone)]
struct AppState {
    device: Arc<Mutex<DeviceState>>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    config_path: Arc<PathBuf>,
    staging_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct SavedResponse {
    saved: bool,
}

#[derive(Debug, Serialize)]
struct ControlResponse {
    ok: bool,
    outputs: OutputState,
}

#[derive(Debug, Serialize)]
struct OtaAppliedResponse {
    ok: bool,
    version: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut config = store.load_config().await.unwrap_or_else(|err| {
        warn!("failed to load device config from store: {err:#}");
        DeviceConfig::default()
    });
    config.sanitize();

    // Boot leaves every output off, then drives that state once.
    let outputs_state = OutputState::default();
    execute_actions(&outputs::refresh_actions(&config, &outputs_state));

    // No radio on the host build; the loopback address stands in for the
    // station interface so status reporting stays exercised.
    let mut connectivity = ConnectivityState::new();
    match startup_plan(&config) {
        StartupPlan::Station => info!("would join station network '{}'", config.wifi_ssid),
        StartupPlan::AccessPoint => info!("no credentials, would start provisioning AP"),
    }
    connectivity.handle(NetworkEvent::GotIp {
        ip: Ipv4Addr::LOCALHOST,
    });

    let app_state = AppState {
        device: Arc::new(Mutex::new(DeviceState {
            config,
            outputs: outputs_state,
            connectivity,
            ota: OtaStatus::default(),
        })),
        store,
    };

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/pair", post(handle_pair))
        .route("/api/config", post(handle_config))
        .route("/api/control", post(handle_control))
        .route("/api/test/gpio", post(handle_gpio_test))
        .route("/api/ota/apply", post(handle_ota_apply))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("ACTUATOR_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind actuator server at {addr}"))?;

    info!("actuator listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let device = state.device.lock().await;
    Json(build_status(&device))
}

async fn handle_pair(
    State(state): State<AppState>,
    Json(request): Json<PairRequest>,
) -> impl IntoResponse {
    let device = state.device.lock().await;
    if request.passcode != device.config.passcode {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid passcode");
    }
    Json(PairResponse {
        paired: true,
        name: device.config.name.clone(),
        device_type: device.config.device_type.clone(),
    })
    .into_response()
}

async fn handle_config(
    State(state): State<AppState>,
    Json(update): Json<ConfigUpdate>,
) -> impl IntoResponse {
    let mut device = state.device.lock().await;
    if update.passcode.as_deref() != Some(device.config.passcode.as_str()) {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid passcode");
    }

    // Soft-invalid values (bad pins, oversized strings) are coerced by
    // sanitization rather than rejected.
    device.config.apply_update(&update);
    execute_actions(&outputs::refresh_actions(&device.config, &device.outputs));

    if let Err(err) = state.store.save_config(&device.config).await {
        warn!("failed to persist config update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist configuration",
        );
    }

    Json(SavedResponse { saved: true }).into_response()
}

async fn handle_control(
    State(state): State<AppState>,
    Json(request): Json<ControlRequest>,
) -> impl IntoResponse {
    let mut device = state.device.lock().await;
    if request.passcode != device.config.passcode {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid passcode");
    }

    match outputs::apply_command(&device.config, &device.outputs, &request.command()) {
        Ok(outcome) => {
            device.outputs = outcome.state.clone();
            execute_actions(&outcome.actions);
            Json(ControlResponse {
                ok: true,
                outputs: outcome.state,
            })
            .into_response()
        }
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn handle_gpio_test(
    State(state): State<AppState>,
    Json(request): Json<GpioTestRequest>,
) -> impl IntoResponse {
    let device = state.device.lock().await;
    if request.passcode != device.config.passcode {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid passcode");
    }
    if !is_safe_output_pin(request.gpio) {
        return error_response(StatusCode::BAD_REQUEST, "GPIO is not an allowed output pin");
    }
    let level = match request.value {
        0 => 0,
        1 => 1,
        _ => return error_response(StatusCode::BAD_REQUEST, "Value must be 0 or 1"),
    };

    execute_actions(&[DriverAction::DigitalWrite {
        pin: request.gpio,
        high: level == 1,
    }]);
    Json(GpioTestResponse {
        ok: true,
        gpio: request.gpio,
        level,
    })
    .into_response()
}

async fn handle_ota_apply(
    State(state): State<AppState>,
    Json(request): Json<OtaApplyRequest>,
) -> impl IntoResponse {
    let (ota_key, device_type) = {
        let mut device = state.device.lock().await;
        if request.passcode != device.config.passcode {
            return error_response(StatusCode::UNAUTHORIZED, "Invalid passcode");
        }
        if device.ota.in_progress {
            return error_response(StatusCode::BAD_REQUEST, "Update already in progress");
        }
        device.ota.in_progress = true;
        (
            device.config.ota_key.clone(),
            device.config.device_type.clone(),
        )
    };

    // The apply call stays synchronous for the caller, but the blocking
    // download must not starve the runtime.
    let staging = state.store.staging_path();
    let pipeline_request = request.clone();
    let result = tokio::task::spawn_blocking(move || {
        run_ota_pipeline(&pipeline_request, &ota_key, &device_type, &staging)
    })
    .await;

    let mut device = state.device.lock().await;
    device.ota.in_progress = false;
    match result {
        Ok(Ok(applied)) => {
            device.ota.last_error = None;
            device.ota.last_version = Some(applied.version.clone());
            device.ota.last_sha256 = Some(applied.sha256);
            device.ota.last_completed = Some(Utc::now().to_rfc3339());
            info!(
                "ota: verified and staged {} ({} bytes); a device build would restart here",
                applied.version, applied.bytes
            );
            Json(OtaAppliedResponse {
                ok: true,
                version: applied.version,
            })
            .into_response()
        }
        Ok(Err(err)) => {
            warn!("ota: apply failed: {err}");
            device.ota.last_error = Some(err.to_string());
            let status = match err.kind() {
                OtaErrorKind::Validation => StatusCode::BAD_REQUEST,
                OtaErrorKind::Integrity => StatusCode::UNAUTHORIZED,
                OtaErrorKind::Io => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, &err.to_string())
        }
        Err(err) => {
            warn!("ota: worker task failed: {err}");
            device.ota.last_error = Some(err.to_string());
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "OTA task failed")
        }
    }
}

struct AppliedUpdate {
    version: String,
    sha256: String,
    bytes: u64,
}

/// File-backed stand-in for the device's inactive OTA slot.
struct FileFirmwarePartition {
    file: std::fs::File,
}

impl FileFirmwarePartition {
    fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            file: std::fs::File::create(path)?,
        })
    }

    fn finish(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

impl FirmwarePartition for FileFirmwarePartition {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.file.write_all(chunk)
    }
}

fn download_err(err: reqwest::Error) -> OtaError {
    OtaError::Download(io::Error::other(err))
}

fn run_ota_pipeline(
    request: &OtaApplyRequest,
    ota_key: &str,
    device_type: &str,
    staging: &Path,
) -> Result<AppliedUpdate, OtaError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(MANIFEST_FETCH_TIMEOUT)
        .build()
        .map_err(download_err)?;
    let response = client
        .get(&request.manifest_url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(download_err)?;

    // The manifest buffer is capped; a larger body is truncated and will
    // fail parsing or verification on its own.
    let mut raw = Vec::new();
    response
        .take(MANIFEST_MAX_BYTES as u64)
        .read_to_end(&mut raw)
        .map_err(OtaError::Download)?;

    let manifest = ota::parse_manifest(&raw)?;
    ota::validate_manifest(&manifest, device_type)?;
    ota::verify_signature(&manifest, ota_key)?;
    info!(
        "ota: manifest verified for version {} ({})",
        manifest.version, manifest.device_type
    );

    let client = reqwest::blocking::Client::builder()
        .timeout(FIRMWARE_FETCH_TIMEOUT)
        .build()
        .map_err(download_err)?;
    let mut response = client
        .get(&request.firmware_url)
        .send()
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(download_err)?;

    let mut partition =
        FileFirmwarePartition::create(staging).map_err(OtaError::PartitionWrite)?;
    let bytes = ota::stream_firmware(&mut response, &mut partition, &manifest.sha256)?;
    partition.finish().map_err(OtaError::PartitionWrite)?;

    Ok(AppliedUpdate {
        version: manifest.version,
        sha256: manifest.sha256,
        bytes,
    })
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("ACTUATOR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.actuator"));

        Self {
            config_path: Arc::new(data_dir.join("config.json")),
            staging_path: Arc::new(data_dir.join("firmware-staged.bin")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn staging_path(&self) -> PathBuf {
        self.staging_path.as_ref().clone()
    }

    async fn load_config(&self) -> anyhow::Result<DeviceConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.config_path.as_ref()).await {
            Ok(raw) => match decode_persisted(&raw) {
                DecodedConfig::Current(config) => Ok(config),
                DecodedConfig::Legacy(legacy) => {
                    info!("migrating legacy 4-relay config record");
                    let migrated = legacy.migrate();
                    // Rewrite in the current schema so the migration runs
                    // once, not on every boot.
                    if let Err(err) = self.write_config(&migrated).await {
                        warn!("failed to persist migrated config: {err:#}");
                    }
                    Ok(migrated)
                }
                DecodedConfig::Unreadable => {
                    warn!("stored config is unreadable, falling back to defaults");
                    Ok(DeviceConfig::default())
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(DeviceConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        self.write_config(config).await
    }

    // Callers hold `lock`.
    async fn write_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let path = self.config_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

fn build_status(device: &DeviceState) -> StatusResponse {
    StatusResponse {
        name: device.config.name.clone(),
        device_type: device.config.device_type.clone(),
        fw_version: FW_VERSION,
        ota_mode: OTA_MODE,
        relay_count: device.config.relay_count,
        relay_gpio: device.config.relay_gpio,
        use_static_ip: device.config.use_static_ip,
        outputs: device.outputs.clone(),
        network: NetworkStatus {
            mode: device.connectivity.mode.as_str(),
            ssid: device.config.wifi_ssid.clone(),
            ip: device.connectivity.ip.map(|ip| ip.to_string()),
            rssi: None,
            last_disconnect_reason: device.connectivity.last_disconnect_reason,
        },
        ota: device.ota.clone(),
    }
}

/// Host stand-in for the GPIO/LEDC driver: every hardware effect becomes a
/// log line with the same pin and duty the device would see.
fn execute_actions(actions: &[DriverAction]) {
    for action in actions {
        match action {
            DriverAction::DigitalWrite { pin, high } => {
                info!("gpio {pin} -> {}", u8::from(*high));
            }
            DriverAction::PwmWrite { channel, duty } => {
                info!("pwm {channel:?} (gpio {}) duty {duty}", channel.gpio());
            }
        }
    }
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

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use actuator_common::config::LEGACY_RECORD_LEN;

    use super::*;

    fn legacy_record() -> Vec<u8> {
        let mut raw = vec![0_u8; LEGACY_RECORD_LEN];
        raw[..10].copy_from_slice(b"old-device");
        raw[96..108].copy_from_slice(b"relay_switch");
        for (slot, pin) in [16_i32, 17, 18, 19].iter().enumerate() {
            raw[288 + slot * 4..292 + slot * 4].copy_from_slice(&pin.to_le_bytes());
        }
        raw
    }

    fn temp_store(tag: &str) -> AppStore {
        let dir = std::env::temp_dir().join(format!(
            "actuator-host-{tag}-{}",
            std::process::id()
        ));
        AppStore {
            config_path: Arc::new(dir.join("config.json")),
            staging_path: Arc::new(dir.join("firmware-staged.bin")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    #[tokio::test]
    async fn legacy_config_is_rewritten_in_current_schema_on_load() {
        let store = temp_store("migrate");
        let dir = store.config_path.parent().unwrap().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(store.config_path.as_ref(), legacy_record())
            .await
            .unwrap();

        let config = store.load_config().await.unwrap();
        assert_eq!(config.relay_count, 4);
        assert_eq!(config.relay_gpio[..4], [16, 17, 18, 19]);

        // The store now holds the current schema; the next boot decodes it
        // directly instead of migrating again.
        let raw = tokio::fs::read(store.config_path.as_ref()).await.unwrap();
        match decode_persisted(&raw) {
            DecodedConfig::Current(rewritten) => assert_eq!(rewritten, config),
            other => panic!("expected current schema after first load, got {other:?}"),
        }
    }

    #[test]
    fn ota_success_body_reports_ok() {
        let body = serde_json::to_value(OtaAppliedResponse {
            ok: true,
            version: "1.4.0".to_string(),
        })
        .unwrap();
        assert_eq!(body["ok"], serde_json::json!(true));
        assert_eq!(body["version"], serde_json::json!("1.4.0"));
    }
}
