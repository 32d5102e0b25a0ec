use serde::{Deserialize, Serialize};

use crate::config::MAX_RELAYS;
use crate::outputs::OutputState;

/// `GET /api/status` payload.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub fw_version: &'static str,
    pub ota_mode: &'static str,
    pub relay_count: u8,
    pub relay_gpio: [i32; MAX_RELAYS],
    pub use_static_ip: bool,
    pub outputs: OutputState,
    pub network: NetworkStatus,
    pub ota: OtaStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    pub mode: &'static str,
    pub ssid: String,
    pub ip: Option<String>,
    pub rssi: Option<i32>,
    pub last_disconnect_reason: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OtaStatus {
    pub in_progress: bool,
    pub last_error: Option<String>,
    pub last_version: Option<String>,
    pub last_sha256: Option<String>,
    pub last_completed: Option<String>,
}

/// `POST /api/pair` body. The device answers with its identity so a
/// controller app can enroll it.
#[derive(Debug, Clone, Deserialize)]
pub struct PairRequest {
    pub passcode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairResponse {
    pub paired: bool,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
}

/// `POST /api/config` body. Every field is optional; absent fields leave
/// the stored value untouched. `passcode` authenticates the request,
/// `new_passcode` rotates the stored one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub passcode: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    pub new_passcode: Option<String>,
    pub relay_count: Option<u8>,
    pub relay_gpio: Option<Vec<i32>>,
    pub wifi_ssid: Option<String>,
    pub wifi_pass: Option<String>,
    pub ap_ssid: Option<String>,
    pub ap_pass: Option<String>,
    pub use_static_ip: Option<bool>,
    pub static_ip: Option<String>,
    pub gateway: Option<String>,
    pub subnet_mask: Option<String>,
    pub ota_key: Option<String>,
}

/// `POST /api/control` body.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlRequest {
    pub passcode: String,
    pub channel: String,
    pub state: Option<String>,
    pub value: Option<i32>,
    pub r: Option<i32>,
    pub g: Option<i32>,
    pub b: Option<i32>,
    pub w: Option<i32>,
}

impl ControlRequest {
    pub fn command(&self) -> crate::outputs::Command<'_> {
        crate::outputs::Command {
            channel: &self.channel,
            state: self.state.as_deref(),
            value: self.value,
            r: self.r,
            g: self.g,
            b: self.b,
            w: self.w,
        }
    }
}

/// `POST /api/test/gpio` body: drive one safe pin directly for bring-up.
#[derive(Debug, Clone, Deserialize)]
pub struct GpioTestRequest {
    pub passcode: String,
    pub gpio: i32,
    pub value: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpioTestResponse {
    pub ok: bool,
    pub gpio: i32,
    pub level: u8,
}

/// `POST /api/ota/apply` body.
#[derive(Debug, Clone, Deserialize)]
pub struct OtaApplyRequest {
    pub passcode: String,
    pub manifest_url: String,
    pub firmware_url: String,
}
