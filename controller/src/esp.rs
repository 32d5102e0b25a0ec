use core::convert::TryInto;
use std::{
    collections::{hash_map::Entry, HashMap},
    io,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_hal::ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution};
use esp_idf_hal::units::FromValueType;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, ledc::LEDC, modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use actuator_common::{
    config::{decode_persisted, is_safe_output_pin, DecodedConfig, DeviceConfig},
    connectivity::{
        ap_security, startup_plan, ApSecurity, ConnDirective, ConnMode, ConnectivityState,
        NetworkEvent, StartupPlan, MIN_WPA2_PASS_LEN,
    },
    ota::{
        self, OtaError, OtaErrorKind, FIRMWARE_FETCH_TIMEOUT, MANIFEST_FETCH_TIMEOUT,
        MANIFEST_MAX_BYTES,
    },
    outputs::{self, DriverAction, OutputState, PwmChannel},
    types::{
        ConfigUpdate, ControlRequest, GpioTestRequest, GpioTestResponse, NetworkStatus,
        OtaApplyRequest, OtaStatus, PairRequest, PairResponse, StatusResponse,
    },
    FirmwarePartition,
};

const NVS_NAMESPACE: &str = "cfg";
const NVS_CONFIG_KEY: &str = "device";
const MAX_HTTP_BODY: usize = 4096;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const RESTART_GRACE_MS: u64 = 400;
const AP_FALLBACK_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

const FW_VERSION: &str = env!("CARGO_PKG_VERSION");
const OTA_MODE: &str = "signed-hmac";

const INDEX_HTML: &str = include_str!("../web/index.html");

struct DeviceState {
    config: DeviceConfig,
    outputs: OutputState,
    connectivity: ConnectivityState,
    ota: OtaStatus,
}

#[derive(Clone)]
struct SharedState {
    device: Arc<Mutex<DeviceState>>,
    driver: Arc<Mutex<OutputDriver>>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
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

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let (mut config, migrated) = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load device config from NVS: {err:#}");
        (DeviceConfig::default(), false)
    });
    config.sanitize();
    if migrated {
        if let Err(err) = nvs_store.save_config(&config) {
            warn!("failed to persist migrated config: {err:#}");
        }
    }

    info!(
        "NVS config loaded: name=`{}`, type=`{}`, relays={}, ssid=`{}`",
        config.name, config.device_type, config.relay_count, config.wifi_ssid
    );

    let Peripherals { modem, ledc, .. } = Peripherals::take()?;

    let mut driver = init_output_driver(ledc)?;
    let outputs_state = OutputState::default();
    driver.execute(&outputs::refresh_actions(&config, &outputs_state));

    let mut connectivity = ConnectivityState::new();
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &config, &mut connectivity)
        .context("wifi startup failed")?;

    if let Ok(mut esp_ota) = EspOta::new() {
        if let Err(err) = esp_ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let state = SharedState {
        device: Arc::new(Mutex::new(DeviceState {
            config,
            outputs: outputs_state,
            connectivity,
            ota: OtaStatus::default(),
        })),
        driver: Arc::new(Mutex::new(driver)),
    };

    let server = create_http_server(state, nvs_store)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

/// Runtime GPIO/LEDC driver. Relay and auxiliary digital pins are claimed
/// lazily because the relay map can change at runtime; the six PWM outputs
/// sit on fixed board pins and share one 5 kHz 8-bit timer.
struct OutputDriver {
    digital: HashMap<i32, PinDriver<'static, AnyOutputPin, Output>>,
    pwm: [Option<LedcDriver<'static>>; 6],
}

fn pwm_index(channel: PwmChannel) -> usize {
    match channel {
        PwmChannel::Dimmer => 0,
        PwmChannel::RgbR => 1,
        PwmChannel::RgbG => 2,
        PwmChannel::RgbB => 3,
        PwmChannel::RgbW => 4,
        PwmChannel::FanSpeed => 5,
    }
}

fn init_output_driver(ledc: LEDC) -> anyhow::Result<OutputDriver> {
    let timer = Arc::new(LedcTimerDriver::new(
        ledc.timer0,
        &TimerConfig::new()
            .frequency(5.kHz().into())
            .resolution(Resolution::Bits8),
    )?);

    let pwm = [
        Some(LedcDriver::new(ledc.channel0, timer.clone(), unsafe {
            AnyOutputPin::new(PwmChannel::Dimmer.gpio())
        })?),
        Some(LedcDriver::new(ledc.channel1, timer.clone(), unsafe {
            AnyOutputPin::new(PwmChannel::RgbR.gpio())
        })?),
        Some(LedcDriver::new(ledc.channel2, timer.clone(), unsafe {
            AnyOutputPin::new(PwmChannel::RgbG.gpio())
        })?),
        Some(LedcDriver::new(ledc.channel3, timer.clone(), unsafe {
            AnyOutputPin::new(PwmChannel::RgbB.gpio())
        })?),
        Some(LedcDriver::new(ledc.channel4, timer.clone(), unsafe {
            AnyOutputPin::new(PwmChannel::RgbW.gpio())
        })?),
        Some(LedcDriver::new(ledc.channel5, timer, unsafe {
            AnyOutputPin::new(PwmChannel::FanSpeed.gpio())
        })?),
    ];

    Ok(OutputDriver {
        digital: HashMap::new(),
        pwm,
    })
}

impl OutputDriver {
    fn execute(&mut self, actions: &[DriverAction]) {
        for action in actions {
            match *action {
                DriverAction::DigitalWrite { pin, high } => self.digital_write(pin, high),
                DriverAction::PwmWrite { channel, duty } => self.pwm_write(channel, duty),
            }
        }
    }

    fn digital_write(&mut self, pin: i32, high: bool) {
        let driver = match self.digital.entry(pin) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                match unsafe { PinDriver::output(AnyOutputPin::new(pin)) } {
                    Ok(driver) => entry.insert(driver),
                    Err(err) => {
                        warn!("GPIO{pin} unavailable for output: {err}");
                        return;
                    }
                }
            }
        };

        let result = if high {
            driver.set_high()
        } else {
            driver.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive GPIO{pin}: {err}");
        }
    }

    fn pwm_write(&mut self, channel: PwmChannel, duty: u32) {
        let Some(driver) = self.pwm[pwm_index(channel)].as_mut() else {
            return;
        };
        if let Err(err) = driver.set_duty(duty) {
            warn!(
                "failed to set duty {duty} on {channel:?} (GPIO{}): {err}",
                channel.gpio()
            );
        }
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    config: &DeviceConfig,
    conn: &mut ConnectivityState,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    if let Some(static_ip) = actuator_common::connectivity::StaticIpConfig::from_config(config) {
        match build_sta_netif(&static_ip) {
            Ok(netif) => {
                esp_wifi
                    .swap_netif_sta(netif)
                    .context("failed to apply static IP netif configuration")?;
            }
            Err(err) => warn!("static netif setup failed ({err:#}), using dhcp"),
        }
    }

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if startup_plan(config) == StartupPlan::AccessPoint {
        warn!("no station credentials; starting fallback AP `{}`", config.ap_ssid);
        start_fallback_ap(&mut wifi, config)?;
        conn.enter_ap_fallback(AP_FALLBACK_IP);
        return Ok(esp_wifi);
    }

    let auth_method = if config.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: config
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    conn.handle(NetworkEvent::StationStarted);
    info!("wifi started, connecting to `{}`", config.wifi_ssid);

    loop {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                let ip = wifi.wifi().sta_netif().get_ip_info()?.ip;
                conn.handle(NetworkEvent::GotIp { ip });
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt failed: {err:#}");
                match conn.handle(NetworkEvent::Disconnected { reason: 1 }) {
                    ConnDirective::Reconnect => {
                        let _ = wifi.disconnect();
                        thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
                    }
                    _ => {
                        let _ = wifi.disconnect();
                        let _ = wifi.stop();
                        start_fallback_ap(&mut wifi, config)?;
                        conn.enter_ap_fallback(AP_FALLBACK_IP);
                        break;
                    }
                }
            }
        }
    }

    Ok(esp_wifi)
}

fn build_sta_netif(
    static_ip: &actuator_common::connectivity::StaticIpConfig,
) -> anyhow::Result<EspNetif> {
    let mask = Mask::try_from(static_ip.subnet_mask)
        .map_err(|_| anyhow!("invalid subnet mask: {}", static_ip.subnet_mask))?;

    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip: static_ip.ip,
                subnet: Subnet {
                    gateway: static_ip.gateway,
                    mask,
                },
                dns: None,
                secondary_dns: None,
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };

    Ok(EspNetif::new_with_conf(&conf)?)
}

fn start_fallback_ap(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    config: &DeviceConfig,
) -> anyhow::Result<()> {
    let auth_method = match ap_security(&config.ap_pass) {
        ApSecurity::Open => {
            warn!(
                "AP password shorter than {MIN_WPA2_PASS_LEN} chars; starting an open network"
            );
            AuthMethod::None
        }
        ApSecurity::Wpa2 => AuthMethod::WPA2Personal,
    };

    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: config
            .ap_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("AP SSID too long"))?,
        password: config
            .ap_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("AP password too long"))?,
        auth_method,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("fallback AP `{}` started", config.ap_ssid);
    Ok(())
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    server.fn_handler::<anyhow::Error, _>("/favicon.ico", Method::Get, move |req| {
        req.into_response(204, None, &[])?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
            let status = build_status(&state);
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/pair", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(request) = serde_json::from_slice::<PairRequest>(&body) else {
                return write_error(req, 400, "Invalid JSON body");
            };

            let device = state.device.lock().unwrap();
            if request.passcode != device.config.passcode {
                return write_error(req, 401, "Invalid passcode");
            }

            let payload = PairResponse {
                paired: true,
                name: device.config.name.clone(),
                device_type: device.config.device_type.clone(),
            };
            drop(device);
            write_json(req, &payload)
        })?;
    }

    {
        let state = state.clone();
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(update) = serde_json::from_slice::<ConfigUpdate>(&body) else {
                return write_error(req, 400, "Invalid JSON body");
            };

            let mut device = state.device.lock().unwrap();
            if update.passcode.as_deref() != Some(device.config.passcode.as_str()) {
                return write_error(req, 401, "Invalid passcode");
            }

            // Soft-invalid values are coerced by sanitization, and the
            // relay map change re-drives outputs with conflicts
            // re-evaluated.
            device.config.apply_update(&update);
            let actions = outputs::refresh_actions(&device.config, &device.outputs);
            let config = device.config.clone();
            drop(device);

            state.driver.lock().unwrap().execute(&actions);

            if let Err(err) = nvs_store.save_config(&config) {
                warn!("failed to persist config update: {err:#}");
                return write_error(req, 500, "Failed to persist configuration");
            }

            write_json(req, &SavedResponse { saved: true })
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/control", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(request) = serde_json::from_slice::<ControlRequest>(&body) else {
                return write_error(req, 400, "Invalid JSON body");
            };

            let mut device = state.device.lock().unwrap();
            if request.passcode != device.config.passcode {
                return write_error(req, 401, "Invalid passcode");
            }

            match outputs::apply_command(&device.config, &device.outputs, &request.command()) {
                Ok(outcome) => {
                    device.outputs = outcome.state.clone();
                    drop(device);
                    state.driver.lock().unwrap().execute(&outcome.actions);
                    write_json(
                        req,
                        &ControlResponse {
                            ok: true,
                            outputs: outcome.state,
                        },
                    )
                }
                Err(err) => write_error(req, 400, &err.to_string()),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/test/gpio", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(request) = serde_json::from_slice::<GpioTestRequest>(&body) else {
                return write_error(req, 400, "Invalid JSON body");
            };

            {
                let device = state.device.lock().unwrap();
                if request.passcode != device.config.passcode {
                    return write_error(req, 401, "Invalid passcode");
                }
            }
            if !is_safe_output_pin(request.gpio) {
                return write_error(req, 400, "GPIO is not an allowed output pin");
            }
            let level = match request.value {
                0 => 0,
                1 => 1,
                _ => return write_error(req, 400, "Value must be 0 or 1"),
            };

            state.driver.lock().unwrap().execute(&[DriverAction::DigitalWrite {
                pin: request.gpio,
                high: level == 1,
            }]);
            write_json(
                req,
                &GpioTestResponse {
                    ok: true,
                    gpio: request.gpio,
                    level,
                },
            )
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/ota/apply", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(request) = serde_json::from_slice::<OtaApplyRequest>(&body) else {
                return write_error(req, 400, "Invalid JSON body");
            };

            let (ota_key, device_type) = {
                let mut device = state.device.lock().unwrap();
                if request.passcode != device.config.passcode {
                    return write_error(req, 401, "Invalid passcode");
                }
                if device.ota.in_progress {
                    return write_error(req, 400, "Update already in progress");
                }
                device.ota.in_progress = true;
                (
                    device.config.ota_key.clone(),
                    device.config.device_type.clone(),
                )
            };

            // The apply call blocks until the pipeline finishes; the
            // response is written before the restart fires.
            let result = run_ota_pipeline(&ota_key, &device_type, &request);

            let mut device = state.device.lock().unwrap();
            device.ota.in_progress = false;
            match result {
                Ok(applied) => {
                    device.ota.last_error = None;
                    device.ota.last_version = Some(applied.version.clone());
                    device.ota.last_sha256 = Some(applied.sha256);
                    device.ota.last_completed = Some(Utc::now().to_rfc3339());
                    drop(device);

                    info!(
                        "ota: applied {} ({} bytes), restarting shortly",
                        applied.version, applied.bytes
                    );
                    schedule_restart(RESTART_GRACE_MS);
                    write_json(
                        req,
                        &OtaAppliedResponse {
                            ok: true,
                            version: applied.version,
                        },
                    )
                }
                Err(err) => {
                    warn!("ota: apply failed: {err}");
                    device.ota.last_error = Some(err.to_string());
                    drop(device);
                    let status = match err.kind() {
                        OtaErrorKind::Validation => 400,
                        OtaErrorKind::Integrity => 401,
                        OtaErrorKind::Io => 500,
                    };
                    write_error(req, status, &err.to_string())
                }
            }
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
    mut req: esp_idf_svc::http::server::Request<
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
    mut req: esp_idf_svc::http::server::Request<
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

fn build_status(state: &SharedState) -> StatusResponse {
    let device = state.device.lock().unwrap();
    let rssi = if device.connectivity.mode == ConnMode::Connected {
        station_rssi()
    } else {
        None
    };

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
            rssi,
            last_disconnect_reason: device.connectivity.last_disconnect_reason,
        },
        ota: device.ota.clone(),
    }
}

fn station_rssi() -> Option<i32> {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    (rc == esp_idf_svc::sys::ESP_OK).then(|| i32::from(ap_info.rssi))
}

struct AppliedUpdate {
    version: String,
    sha256: String,
    bytes: u64,
}

/// Inactive app slot wrapper; only activated by `complete()` after the
/// digest gate passes.
struct OtaSlot<'a> {
    update: esp_idf_svc::ota::EspOtaUpdate<'a>,
}

impl FirmwarePartition for OtaSlot<'_> {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.update.write_all(chunk).map_err(esp_io_err)
    }
}

/// Adapts an embedded-svc reader (the HTTP response body) to `io::Read`
/// for the shared streaming pipeline.
struct IoReader<R> {
    inner: R,
}

impl<R> io::Read for IoReader<R>
where
    R: Read,
    R::Error: core::fmt::Debug,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(esp_io_err)
    }
}

fn esp_io_err(err: impl core::fmt::Debug) -> io::Error {
    io::Error::other(format!("{err:?}"))
}

fn http_client(timeout: Duration) -> io::Result<HttpClient<EspHttpConnection>> {
    let conf = HttpClientConfiguration {
        timeout: Some(timeout),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    EspHttpConnection::new(&conf)
        .map(HttpClient::wrap)
        .map_err(esp_io_err)
}

fn fetch_manifest(url: &str) -> Result<Vec<u8>, OtaError> {
    let mut client = http_client(MANIFEST_FETCH_TIMEOUT).map_err(OtaError::Download)?;
    let request = client
        .request(Method::Get, url, &[])
        .map_err(|err| OtaError::Download(esp_io_err(err)))?;
    let mut response = request
        .submit()
        .map_err(|err| OtaError::Download(esp_io_err(err)))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(OtaError::Download(io::Error::other(format!(
            "manifest fetch failed with HTTP {status}"
        ))));
    }

    // Capped read; a truncated manifest fails parsing or verification.
    let mut raw = Vec::new();
    let mut chunk = [0_u8; 512];
    while raw.len() < MANIFEST_MAX_BYTES {
        let read = response
            .read(&mut chunk)
            .map_err(|err| OtaError::Download(esp_io_err(err)))?;
        if read == 0 {
            break;
        }
        let take = read.min(MANIFEST_MAX_BYTES - raw.len());
        raw.extend_from_slice(&chunk[..take]);
    }
    Ok(raw)
}

fn run_ota_pipeline(
    ota_key: &str,
    device_type: &str,
    request: &OtaApplyRequest,
) -> Result<AppliedUpdate, OtaError> {
    let raw = fetch_manifest(&request.manifest_url)?;
    let manifest = ota::parse_manifest(&raw)?;
    ota::validate_manifest(&manifest, device_type)?;
    ota::verify_signature(&manifest, ota_key)?;
    info!(
        "ota: manifest verified for version {} ({})",
        manifest.version, manifest.device_type
    );

    let mut client = http_client(FIRMWARE_FETCH_TIMEOUT).map_err(OtaError::Download)?;
    let http_request = client
        .request(Method::Get, &request.firmware_url, &[])
        .map_err(|err| OtaError::Download(esp_io_err(err)))?;
    let response = http_request
        .submit()
        .map_err(|err| OtaError::Download(esp_io_err(err)))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(OtaError::Download(io::Error::other(format!(
            "firmware fetch failed with HTTP {status}"
        ))));
    }

    let mut esp_ota = EspOta::new().map_err(|err| OtaError::PartitionWrite(esp_io_err(err)))?;
    let update = esp_ota
        .initiate_update()
        .map_err(|err| OtaError::PartitionWrite(esp_io_err(err)))?;

    let mut source = IoReader { inner: response };
    let mut slot = OtaSlot { update };

    match ota::stream_firmware(&mut source, &mut slot, &manifest.sha256) {
        Ok(bytes) => {
            slot.update
                .complete()
                .map_err(|err| OtaError::PartitionWrite(esp_io_err(err)))?;
            Ok(AppliedUpdate {
                version: manifest.version,
                sha256: manifest.sha256,
                bytes,
            })
        }
        Err(err) => {
            let _ = slot.update.abort();
            Err(err)
        }
    }
}

fn schedule_restart(delay_ms: u64) {
    thread::Builder::new()
        .name("restart".into())
        .spawn(move || {
            thread::sleep(Duration::from_millis(delay_ms));
            unsafe { esp_idf_svc::sys::esp_restart() };
        })
        .expect("failed to spawn restart thread");
}

impl NvsStore {
    /// Probes the stored blob: current JSON first, then the fixed-size
    /// legacy record. The returned flag says a forward migration happened
    /// and the blob should be rewritten.
    fn load_config(&self) -> anyhow::Result<(DeviceConfig, bool)> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_raw(NVS_CONFIG_KEY, &mut buffer)? {
            Some(raw) => match decode_persisted(raw) {
                DecodedConfig::Current(config) => Ok((config, false)),
                DecodedConfig::Legacy(legacy) => {
                    info!("migrating legacy 4-relay config record");
                    Ok((legacy.migrate(), true))
                }
                DecodedConfig::Unreadable => {
                    warn!("stored config is unreadable, falling back to defaults");
                    Ok((DeviceConfig::default(), false))
                }
            },
            None => Ok((DeviceConfig::default(), false)),
        }
    }

    fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_vec(config)?;
        nvs.set_raw(NVS_CONFIG_KEY, &payload)?;
        Ok(())
    }
}
