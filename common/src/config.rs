use serde::{Deserialize, Serialize};

use crate::types::ConfigUpdate;

pub const MAX_RELAYS: usize = 8;
pub const LEGACY_RELAYS: usize = 4;
pub const UNASSIGNED_PIN: i32 = -1;

/// Longest accepted text field, matching the original 96-byte NVS record.
pub const MAX_FIELD_LEN: usize = 95;

/// GPIO map for the default reference board.
pub mod pins {
    pub const DEFAULT_RELAY_GPIOS: [i32; 4] = [16, 17, 18, 19];
    pub const LIGHT: i32 = 23;
    pub const FAN_POWER: i32 = 32;
    pub const DIMMER: i32 = 21;
    pub const RGB_R: i32 = 25;
    pub const RGB_G: i32 = 26;
    pub const RGB_B: i32 = 27;
    pub const RGB_W: i32 = 14;
    pub const FAN_SPEED: i32 = 33;
}

/// Output-capable GPIOs considered safe to expose for relay assignment and
/// diagnostic drive. Excludes strapping pins, UART0, and the flash bank.
pub const SAFE_OUTPUT_PINS: &[i32] = &[
    2, 4, 5, 12, 13, 14, 15, 16, 17, 18, 19, 21, 22, 23, 25, 26, 27, 32, 33,
];

pub fn is_safe_output_pin(pin: i32) -> bool {
    SAFE_OUTPUT_PINS.contains(&pin)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub passcode: String,
    pub relay_count: u8,
    pub relay_gpio: [i32; MAX_RELAYS],
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub ap_ssid: String,
    pub ap_pass: String,
    pub use_static_ip: bool,
    pub static_ip: String,
    pub gateway: String,
    pub subnet_mask: String,
    pub ota_key: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "actuator".to_string(),
            device_type: "relay_switch".to_string(),
            passcode: "changeme".to_string(),
            relay_count: 4,
            relay_gpio: [16, 17, 18, 19, -1, -1, -1, -1],
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            ap_ssid: "Actuator-AP".to_string(),
            ap_pass: "actuator-setup".to_string(),
            use_static_ip: false,
            static_ip: String::new(),
            gateway: String::new(),
            subnet_mask: String::new(),
            ota_key: String::new(),
        }
    }
}

/// Strips CR/LF/TAB, caps the length, and trims surrounding spaces.
/// Total and idempotent; never rejects input.
pub fn sanitize_text(value: &mut String) {
    value.retain(|c| c != '\r' && c != '\n' && c != '\t');
    if value.chars().count() > MAX_FIELD_LEN {
        *value = value.chars().take(MAX_FIELD_LEN).collect();
    }
    let trimmed = value.trim_matches(' ');
    if trimmed.len() != value.len() {
        *value = trimmed.to_string();
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        sanitize_text(&mut self.name);
        sanitize_text(&mut self.device_type);
        sanitize_text(&mut self.passcode);
        sanitize_text(&mut self.wifi_ssid);
        sanitize_text(&mut self.wifi_pass);
        sanitize_text(&mut self.ap_ssid);
        sanitize_text(&mut self.ap_pass);
        sanitize_text(&mut self.static_ip);
        sanitize_text(&mut self.gateway);
        sanitize_text(&mut self.subnet_mask);
        sanitize_text(&mut self.ota_key);
        self.sanitize_relay_map();
    }

    /// Clamps the relay count and coerces every slot to a safe, unique pin:
    /// invalid pins become the board default (slots 0-3) or unassigned
    /// (slots 4-7); a pin already claimed by an earlier slot falls back the
    /// same way, or to unassigned when its default is also taken.
    pub fn sanitize_relay_map(&mut self) {
        self.relay_count = self.relay_count.clamp(1, MAX_RELAYS as u8);

        for slot in 0..MAX_RELAYS {
            let pin = self.relay_gpio[slot];
            if slot < LEGACY_RELAYS {
                if !is_safe_output_pin(pin) {
                    self.relay_gpio[slot] = pins::DEFAULT_RELAY_GPIOS[slot];
                }
            } else if pin != UNASSIGNED_PIN && !is_safe_output_pin(pin) {
                self.relay_gpio[slot] = UNASSIGNED_PIN;
            }
        }

        for slot in 0..MAX_RELAYS {
            let pin = self.relay_gpio[slot];
            if pin == UNASSIGNED_PIN || !self.relay_gpio[..slot].contains(&pin) {
                continue;
            }
            let fallback = if slot < LEGACY_RELAYS {
                pins::DEFAULT_RELAY_GPIOS[slot]
            } else {
                UNASSIGNED_PIN
            };
            self.relay_gpio[slot] =
                if fallback != UNASSIGNED_PIN && !self.relay_gpio[..slot].contains(&fallback) {
                    fallback
                } else {
                    UNASSIGNED_PIN
                };
        }
    }

    /// True when `pin` is assigned to an active relay slot. Auxiliary and
    /// PWM outputs sharing such a pin must not be physically driven.
    pub fn pin_claimed_by_relay(&self, pin: i32) -> bool {
        if pin == UNASSIGNED_PIN {
            return false;
        }
        self.relay_gpio[..self.relay_count as usize].contains(&pin)
    }

    /// Merges the provided fields of a config update; absent fields stay
    /// unchanged. The result is re-sanitized before use.
    pub fn apply_update(&mut self, update: &ConfigUpdate) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(device_type) = &update.device_type {
            self.device_type = device_type.clone();
        }
        if let Some(passcode) = &update.new_passcode {
            self.passcode = passcode.clone();
        }
        if let Some(ssid) = &update.wifi_ssid {
            self.wifi_ssid = ssid.clone();
        }
        if let Some(pass) = &update.wifi_pass {
            self.wifi_pass = pass.clone();
        }
        if let Some(ssid) = &update.ap_ssid {
            self.ap_ssid = ssid.clone();
        }
        if let Some(pass) = &update.ap_pass {
            self.ap_pass = pass.clone();
        }
        if let Some(count) = update.relay_count {
            self.relay_count = count;
        }
        if let Some(map) = &update.relay_gpio {
            for (slot, pin) in map.iter().take(MAX_RELAYS).enumerate() {
                self.relay_gpio[slot] = *pin;
            }
        }
        if let Some(key) = &update.ota_key {
            self.ota_key = key.clone();
        }
        if let Some(enabled) = update.use_static_ip {
            self.use_static_ip = enabled;
        }
        if let Some(ip) = &update.static_ip {
            self.static_ip = ip.clone();
        }
        if let Some(gateway) = &update.gateway {
            self.gateway = gateway.clone();
        }
        if let Some(mask) = &update.subnet_mask {
            self.subnet_mask = mask.clone();
        }
        self.sanitize();
    }
}

/// A persisted record decoded by probing: current JSON schema first, then
/// the legacy fixed-size 4-relay binary record.
#[derive(Debug)]
pub enum DecodedConfig {
    Current(DeviceConfig),
    Legacy(LegacyDeviceConfig),
    Unreadable,
}

pub fn decode_persisted(raw: &[u8]) -> DecodedConfig {
    if let Ok(config) = serde_json::from_slice::<DeviceConfig>(raw) {
        return DecodedConfig::Current(config);
    }
    match LegacyDeviceConfig::decode(raw) {
        Some(legacy) => DecodedConfig::Legacy(legacy),
        None => DecodedConfig::Unreadable,
    }
}

/// The original firmware's fixed-size NVS blob: groups of 96-byte
/// NUL-terminated strings around four little-endian i32 relay pins and one
/// bool, padded to a 4-byte boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyDeviceConfig {
    pub name: String,
    pub device_type: String,
    pub passcode: String,
    pub relay_gpio: [i32; LEGACY_RELAYS],
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub ap_ssid: String,
    pub ap_pass: String,
    pub use_static_ip: bool,
    pub static_ip: String,
    pub gateway: String,
    pub subnet_mask: String,
    pub ota_key: String,
}

const LEGACY_FIELD_LEN: usize = 96;
pub const LEGACY_RECORD_LEN: usize = 1076;

impl LegacyDeviceConfig {
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != LEGACY_RECORD_LEN {
            return None;
        }

        let field = |offset: usize| -> String {
            let bytes = &raw[offset..offset + LEGACY_FIELD_LEN];
            let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        };

        let mut relay_gpio = [0_i32; LEGACY_RELAYS];
        for (slot, pin) in relay_gpio.iter_mut().enumerate() {
            let offset = 288 + slot * 4;
            *pin = i32::from_le_bytes(raw[offset..offset + 4].try_into().ok()?);
        }

        Some(Self {
            name: field(0),
            device_type: field(96),
            passcode: field(192),
            relay_gpio,
            wifi_ssid: field(304),
            wifi_pass: field(400),
            ap_ssid: field(496),
            ap_pass: field(592),
            use_static_ip: raw[688] != 0,
            static_ip: field(689),
            gateway: field(785),
            subnet_mask: field(881),
            ota_key: field(977),
        })
    }

    /// One-time forward migration into the current variable-relay schema:
    /// the four legacy slots carry over, slots 4-7 start unassigned.
    pub fn migrate(self) -> DeviceConfig {
        let mut relay_gpio = [UNASSIGNED_PIN; MAX_RELAYS];
        relay_gpio[..LEGACY_RELAYS].copy_from_slice(&self.relay_gpio);

        DeviceConfig {
            name: self.name,
            device_type: self.device_type,
            passcode: self.passcode,
            relay_count: LEGACY_RELAYS as u8,
            relay_gpio,
            wifi_ssid: self.wifi_ssid,
            wifi_pass: self.wifi_pass,
            ap_ssid: self.ap_ssid,
            ap_pass: self.ap_pass,
            use_static_ip: self.use_static_ip,
            static_ip: self.static_ip,
            gateway: self.gateway,
            subnet_mask: self.subnet_mask,
            ota_key: self.ota_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn legacy_record(ssid: &str, pins: [i32; 4]) -> Vec<u8> {
        let mut raw = vec![0_u8; LEGACY_RECORD_LEN];
        let mut put = |offset: usize, value: &str| {
            raw[offset..offset + value.len()].copy_from_slice(value.as_bytes());
        };
        put(0, "old-device");
        put(96, "relay_switch");
        put(192, "secret");
        put(304, ssid);
        put(977, "ota-key");
        for (slot, pin) in pins.iter().enumerate() {
            raw[288 + slot * 4..292 + slot * 4].copy_from_slice(&pin.to_le_bytes());
        }
        raw
    }

    #[test]
    fn sanitize_text_strips_control_chars_and_spaces() {
        let mut value = "  my\r\nnet\twork  ".to_string();
        sanitize_text(&mut value);
        assert_eq!(value, "mynetwork");
    }

    #[test]
    fn sanitize_text_is_idempotent() {
        let mut once = " ssid\nwith junk \t ".to_string();
        sanitize_text(&mut once);
        let mut twice = once.clone();
        sanitize_text(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_text_caps_field_length() {
        let mut value = "x".repeat(400);
        sanitize_text(&mut value);
        assert_eq!(value.len(), MAX_FIELD_LEN);
    }

    #[test]
    fn relay_count_is_clamped() {
        let mut config = DeviceConfig {
            relay_count: 0,
            ..DeviceConfig::default()
        };
        config.sanitize_relay_map();
        assert_eq!(config.relay_count, 1);

        config.relay_count = 200;
        config.sanitize_relay_map();
        assert_eq!(config.relay_count, 8);
    }

    #[test]
    fn disallowed_pin_coerces_to_default() {
        let mut config = DeviceConfig {
            relay_gpio: [2, 99, -1, -1, -1, -1, -1, -1],
            ..DeviceConfig::default()
        };
        config.sanitize_relay_map();
        assert_eq!(config.relay_gpio[0], 2);
        assert_eq!(config.relay_gpio[1], pins::DEFAULT_RELAY_GPIOS[1]);
    }

    #[test]
    fn disallowed_high_slot_pin_coerces_to_unassigned() {
        let mut config = DeviceConfig {
            relay_count: 8,
            relay_gpio: [16, 17, 18, 19, 6, 34, 22, 23],
            ..DeviceConfig::default()
        };
        config.sanitize_relay_map();
        assert_eq!(config.relay_gpio[4], UNASSIGNED_PIN);
        assert_eq!(config.relay_gpio[5], UNASSIGNED_PIN);
        assert_eq!(config.relay_gpio[6], 22);
        assert_eq!(config.relay_gpio[7], 23);
    }

    #[test]
    fn duplicate_pins_are_made_unique() {
        let mut config = DeviceConfig {
            relay_gpio: [16, 16, 18, 19, -1, -1, -1, -1],
            ..DeviceConfig::default()
        };
        config.sanitize_relay_map();
        assert_eq!(config.relay_gpio[0], 16);
        assert_eq!(config.relay_gpio[1], pins::DEFAULT_RELAY_GPIOS[1]);

        let active = &config.relay_gpio[..config.relay_count as usize];
        for (slot, pin) in active.iter().enumerate() {
            if *pin != UNASSIGNED_PIN {
                assert!(!active[..slot].contains(pin));
            }
        }
    }

    #[test]
    fn sanitize_relay_map_is_idempotent() {
        let mut config = DeviceConfig {
            relay_count: 8,
            relay_gpio: [17, 17, 99, -7, 33, 33, 0, 1],
            ..DeviceConfig::default()
        };
        config.sanitize_relay_map();
        let once = config.clone();
        config.sanitize_relay_map();
        assert_eq!(config, once);
    }

    #[test]
    fn current_json_blob_decodes_directly() {
        let config = DeviceConfig::default();
        let raw = serde_json::to_vec(&config).unwrap();
        match decode_persisted(&raw) {
            DecodedConfig::Current(decoded) => assert_eq!(decoded, config),
            other => panic!("expected current schema, got {other:?}"),
        }
    }

    #[test]
    fn legacy_blob_migrates_to_four_relays() {
        let raw = legacy_record("home-net", [16, 17, 18, 19]);
        let DecodedConfig::Legacy(legacy) = decode_persisted(&raw) else {
            panic!("expected legacy decode");
        };

        let migrated = legacy.migrate();
        assert_eq!(migrated.relay_count, 4);
        assert_eq!(migrated.relay_gpio[..4], [16, 17, 18, 19]);
        assert_eq!(migrated.relay_gpio[4..], [-1, -1, -1, -1]);
        assert_eq!(migrated.wifi_ssid, "home-net");
        assert_eq!(migrated.ota_key, "ota-key");
    }

    #[test]
    fn migrated_record_reloads_as_current_schema() {
        let raw = legacy_record("home-net", [16, 17, 18, 19]);
        let DecodedConfig::Legacy(legacy) = decode_persisted(&raw) else {
            panic!("expected legacy decode");
        };
        let migrated = legacy.migrate();

        let reserialized = serde_json::to_vec(&migrated).unwrap();
        match decode_persisted(&reserialized) {
            DecodedConfig::Current(decoded) => assert_eq!(decoded, migrated),
            other => panic!("expected current schema after migration, got {other:?}"),
        }
    }

    #[test]
    fn garbage_blob_is_unreadable() {
        assert!(matches!(
            decode_persisted(&[0xAB; 17]),
            DecodedConfig::Unreadable
        ));
        assert!(matches!(decode_persisted(b"{"), DecodedConfig::Unreadable));
    }

    #[test]
    fn pin_conflict_only_counts_active_slots() {
        let config = DeviceConfig {
            relay_count: 2,
            relay_gpio: [16, 17, 23, 33, -1, -1, -1, -1],
            ..DeviceConfig::default()
        };
        assert!(config.pin_claimed_by_relay(16));
        assert!(!config.pin_claimed_by_relay(23));
        assert!(!config.pin_claimed_by_relay(UNASSIGNED_PIN));
    }
}
