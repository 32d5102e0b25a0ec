use std::net::Ipv4Addr;

use log::{info, warn};

use crate::config::DeviceConfig;

/// Consecutive station connect failures tolerated before falling back to
/// the provisioning access point.
pub const MAX_STA_FAILURES: u32 = 5;

/// WPA2 requires an 8-character minimum; anything shorter would brick the
/// AP, so the fallback network opens up instead.
pub const MIN_WPA2_PASS_LEN: usize = 8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnMode {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ApFallback,
}

impl ConnMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ApFallback => "ap",
        }
    }
}

/// What the radio reported. Platform event handlers translate their native
/// callbacks into these and feed them through the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    StationStarted,
    Disconnected { reason: u16 },
    GotIp { ip: Ipv4Addr },
}

/// What the platform layer should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnDirective {
    Connect,
    Reconnect,
    RaiseFailed,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectivityState {
    pub mode: ConnMode,
    pub fail_count: u32,
    pub last_disconnect_reason: Option<u16>,
    pub ip: Option<Ipv4Addr>,
}

impl ConnectivityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one radio event into the state and says what to do next.
    /// Reconnects are attempted until the failure cap, after which the
    /// caller is told to raise the failure (and typically start the AP).
    pub fn handle(&mut self, event: NetworkEvent) -> ConnDirective {
        match event {
            NetworkEvent::StationStarted => {
                self.mode = ConnMode::Connecting;
                ConnDirective::Connect
            }
            NetworkEvent::Disconnected { reason } => {
                self.last_disconnect_reason = Some(reason);
                self.ip = None;
                self.fail_count += 1;
                if self.fail_count >= MAX_STA_FAILURES {
                    warn!(
                        "wifi: giving up after {} failures (reason {reason})",
                        self.fail_count
                    );
                    self.mode = ConnMode::Disconnected;
                    ConnDirective::RaiseFailed
                } else {
                    info!(
                        "wifi: disconnected (reason {reason}), retry {}/{}",
                        self.fail_count, MAX_STA_FAILURES
                    );
                    self.mode = ConnMode::Connecting;
                    ConnDirective::Reconnect
                }
            }
            NetworkEvent::GotIp { ip } => {
                info!("wifi: got ip {ip}");
                self.mode = ConnMode::Connected;
                self.fail_count = 0;
                self.last_disconnect_reason = None;
                self.ip = Some(ip);
                ConnDirective::None
            }
        }
    }

    pub fn enter_ap_fallback(&mut self, ap_ip: Ipv4Addr) {
        self.mode = ConnMode::ApFallback;
        self.ip = Some(ap_ip);
    }
}

/// Decided once at boot from the stored credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPlan {
    Station,
    AccessPoint,
}

pub fn startup_plan(config: &DeviceConfig) -> StartupPlan {
    if config.wifi_ssid.is_empty() {
        StartupPlan::AccessPoint
    } else {
        StartupPlan::Station
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApSecurity {
    Open,
    Wpa2,
}

pub fn ap_security(password: &str) -> ApSecurity {
    if password.len() < MIN_WPA2_PASS_LEN {
        ApSecurity::Open
    } else {
        ApSecurity::Wpa2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIpConfig {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
}

impl StaticIpConfig {
    /// Returns the static assignment only when enabled and all three
    /// fields parse as dotted decimal; otherwise DHCP is used and the
    /// malformed input is merely logged.
    pub fn from_config(config: &DeviceConfig) -> Option<Self> {
        if !config.use_static_ip {
            return None;
        }
        let parsed = (
            config.static_ip.parse::<Ipv4Addr>(),
            config.gateway.parse::<Ipv4Addr>(),
            config.subnet_mask.parse::<Ipv4Addr>(),
        );
        match parsed {
            (Ok(ip), Ok(gateway), Ok(subnet_mask)) => Some(Self {
                ip,
                gateway,
                subnet_mask,
            }),
            _ => {
                warn!(
                    "static ip fields unparsable ({:?}/{:?}/{:?}), using dhcp",
                    config.static_ip, config.gateway, config.subnet_mask
                );
                None
            }
        }
    }
}
