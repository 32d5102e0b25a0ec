use serde::Serialize;
use thiserror::Error;

use crate::config::{pins, DeviceConfig, MAX_RELAYS, UNASSIGNED_PIN};

/// LEDC duty resolution on the reference board (8-bit timer).
pub const PWM_MAX_DUTY: u32 = 255;

/// Default speed applied when a bare `fan` toggle powers the fan on while
/// the stored speed is zero.
pub const FAN_DEFAULT_SPEED_PCT: u8 = 50;

/// Volatile output state. Rebuilt all-off at boot, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputState {
    pub relay: [bool; MAX_RELAYS],
    pub light: bool,
    pub dimmer_pct: u8,
    pub rgb: [u8; 4],
    pub fan_power: bool,
    pub fan_speed_pct: u8,
}

/// The closed set of controllable channels. Wire names are parsed into this
/// once at the boundary; everything past that point dispatches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Relay(u8),
    Light,
    Dimmer,
    Rgb,
    Rgbw,
    Fan,
    FanPower,
    FanSpeed,
}

impl Channel {
    pub fn parse(name: &str) -> Option<Self> {
        if let Some(digits) = name.strip_prefix("relay") {
            let index = digits.parse::<u8>().ok()?;
            if index == 0 || index as usize > MAX_RELAYS {
                return None;
            }
            return Some(Self::Relay(index));
        }
        match name {
            "light" => Some(Self::Light),
            "dimmer" => Some(Self::Dimmer),
            "rgb" => Some(Self::Rgb),
            "rgbw" => Some(Self::Rgbw),
            "fan" => Some(Self::Fan),
            "fan_power" => Some(Self::FanPower),
            "fan_speed" => Some(Self::FanSpeed),
            _ => None,
        }
    }
}

/// PWM-driven outputs and their fixed board pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmChannel {
    Dimmer,
    RgbR,
    RgbG,
    RgbB,
    RgbW,
    FanSpeed,
}

impl PwmChannel {
    pub fn gpio(self) -> i32 {
        match self {
            Self::Dimmer => pins::DIMMER,
            Self::RgbR => pins::RGB_R,
            Self::RgbG => pins::RGB_G,
            Self::RgbB => pins::RGB_B,
            Self::RgbW => pins::RGB_W,
            Self::FanSpeed => pins::FAN_SPEED,
        }
    }
}

/// Hardware effects of a command, consumed by the platform output driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverAction {
    DigitalWrite { pin: i32, high: bool },
    PwmWrite { channel: PwmChannel, duty: u32 },
}

pub fn percent_to_duty(percent: u8) -> u32 {
    u32::from(percent.min(100)) * PWM_MAX_DUTY / 100
}

fn clamp_percent(value: i32) -> u8 {
    value.clamp(0, 100) as u8
}

/// `toggle`/`on`/`off` resolution; anything else leaves the current value.
pub fn resolve_switch(state: Option<&str>, current: bool) -> bool {
    match state {
        Some("toggle") => !current,
        Some("on") => true,
        Some("off") => false,
        _ => current,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unsupported channel `{0}`")]
    UnsupportedChannel(String),
    #[error("relay {0} is outside the configured range")]
    RelayOutOfRange(u8),
}

/// One control request after JSON extraction: channel name, optional state
/// verb, optional scalar value, optional per-component RGB(W) values.
#[derive(Debug, Clone, Copy)]
pub struct Command<'a> {
    pub channel: &'a str,
    pub state: Option<&'a str>,
    pub value: Option<i32>,
    pub r: Option<i32>,
    pub g: Option<i32>,
    pub b: Option<i32>,
    pub w: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub state: OutputState,
    pub actions: Vec<DriverAction>,
}

fn push_digital(actions: &mut Vec<DriverAction>, config: &DeviceConfig, pin: i32, high: bool) {
    if !config.pin_claimed_by_relay(pin) {
        actions.push(DriverAction::DigitalWrite { pin, high });
    }
}

fn push_pwm(actions: &mut Vec<DriverAction>, config: &DeviceConfig, channel: PwmChannel, pct: u8) {
    if !config.pin_claimed_by_relay(channel.gpio()) {
        actions.push(DriverAction::PwmWrite {
            channel,
            duty: percent_to_duty(pct),
        });
    }
}

fn push_rgb(actions: &mut Vec<DriverAction>, config: &DeviceConfig, rgb: [u8; 4]) {
    push_pwm(actions, config, PwmChannel::RgbR, rgb[0]);
    push_pwm(actions, config, PwmChannel::RgbG, rgb[1]);
    push_pwm(actions, config, PwmChannel::RgbB, rgb[2]);
    push_pwm(actions, config, PwmChannel::RgbW, rgb[3]);
}

fn push_fan(actions: &mut Vec<DriverAction>, config: &DeviceConfig, power: bool, speed: u8) {
    push_digital(actions, config, pins::FAN_POWER, power);
    push_pwm(
        actions,
        config,
        PwmChannel::FanSpeed,
        if power { speed } else { 0 },
    );
}

/// Translates one channel/state/value command into a new output state plus
/// the driver calls realizing it. Rejections leave no partial mutation: the
/// caller only adopts the returned state on success.
///
/// Outputs whose pin is claimed by an active relay slot record their logical
/// state but skip the physical driver call.
pub fn apply_command(
    config: &DeviceConfig,
    current: &OutputState,
    cmd: &Command<'_>,
) -> Result<CommandOutcome, CommandError> {
    let channel = Channel::parse(cmd.channel)
        .ok_or_else(|| CommandError::UnsupportedChannel(cmd.channel.to_string()))?;

    let mut next = current.clone();
    let mut actions = Vec::new();

    match channel {
        Channel::Relay(index) => {
            if index > config.relay_count {
                return Err(CommandError::RelayOutOfRange(index));
            }
            let slot = usize::from(index - 1);
            let target = resolve_switch(cmd.state, current.relay[slot]);
            next.relay[slot] = target;
            let pin = config.relay_gpio[slot];
            if pin != UNASSIGNED_PIN {
                actions.push(DriverAction::DigitalWrite { pin, high: target });
            }
        }
        Channel::Light => {
            next.light = resolve_switch(cmd.state, current.light);
            push_digital(&mut actions, config, pins::LIGHT, next.light);
        }
        Channel::Dimmer => {
            next.dimmer_pct = if cmd.state == Some("set") {
                clamp_percent(cmd.value.unwrap_or(0))
            } else if resolve_switch(cmd.state, current.dimmer_pct > 0) {
                100
            } else {
                0
            };
            push_pwm(&mut actions, config, PwmChannel::Dimmer, next.dimmer_pct);
        }
        Channel::Rgb | Channel::Rgbw => {
            next.rgb = match cmd.state {
                Some("off") => [0, 0, 0, 0],
                Some("on") => {
                    let white = if channel == Channel::Rgbw { 100 } else { 0 };
                    [100, 100, 100, white]
                }
                _ => [
                    cmd.r.map(clamp_percent).unwrap_or(current.rgb[0]),
                    cmd.g.map(clamp_percent).unwrap_or(current.rgb[1]),
                    cmd.b.map(clamp_percent).unwrap_or(current.rgb[2]),
                    cmd.w.map(clamp_percent).unwrap_or(current.rgb[3]),
                ],
            };
            push_rgb(&mut actions, config, next.rgb);
        }
        Channel::FanPower => {
            next.fan_power = resolve_switch(cmd.state, current.fan_power);
            push_fan(&mut actions, config, next.fan_power, next.fan_speed_pct);
        }
        Channel::FanSpeed => {
            next.fan_speed_pct = clamp_percent(cmd.value.unwrap_or(0));
            next.fan_power = next.fan_speed_pct > 0;
            push_fan(&mut actions, config, next.fan_power, next.fan_speed_pct);
        }
        Channel::Fan => {
            if cmd.state == Some("set") {
                next.fan_speed_pct = clamp_percent(cmd.value.unwrap_or(0));
                next.fan_power = next.fan_speed_pct > 0;
            } else {
                next.fan_power = resolve_switch(cmd.state, current.fan_power);
                if !next.fan_power {
                    next.fan_speed_pct = 0;
                } else if current.fan_speed_pct == 0 {
                    next.fan_speed_pct = FAN_DEFAULT_SPEED_PCT;
                }
            }
            push_fan(&mut actions, config, next.fan_power, next.fan_speed_pct);
        }
    }

    Ok(CommandOutcome {
        state: next,
        actions,
    })
}

/// Re-drives every output from its logical state. Called at boot (all-off)
/// and after config changes so relay pins and pin-conflict decisions are
/// re-evaluated against the new map.
pub fn refresh_actions(config: &DeviceConfig, state: &OutputState) -> Vec<DriverAction> {
    let mut actions = Vec::new();

    for slot in 0..usize::from(config.relay_count) {
        let pin = config.relay_gpio[slot];
        if pin != UNASSIGNED_PIN {
            actions.push(DriverAction::DigitalWrite {
                pin,
                high: state.relay[slot],
            });
        }
    }

    push_digital(&mut actions, config, pins::LIGHT, state.light);
    push_pwm(&mut actions, config, PwmChannel::Dimmer, state.dimmer_pct);
    push_rgb(&mut actions, config, state.rgb);
    push_fan(&mut actions, config, state.fan_power, state.fan_speed_pct);

    actions
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn command(channel: &str) -> Command<'_> {
        Command {
            channel,
            state: None,
            value: None,
            r: None,
            g: None,
            b: None,
            w: None,
        }
    }

    fn toggle(channel: &str) -> Command<'_> {
        Command {
            state: Some("toggle"),
            ..command(channel)
        }
    }

    fn set_value(channel: &str, value: i32) -> Command<'_> {
        Command {
            state: Some("set"),
            value: Some(value),
            ..command(channel)
        }
    }

    #[test]
    fn toggle_resolution_is_involutive() {
        for start in [false, true] {
            let once = resolve_switch(Some("toggle"), start);
            assert_eq!(resolve_switch(Some("toggle"), once), start);
        }
    }

    #[test]
    fn unknown_state_leaves_value_unchanged() {
        assert!(resolve_switch(Some("sideways"), true));
        assert!(!resolve_switch(None, false));
        assert!(resolve_switch(Some("on"), false));
        assert!(!resolve_switch(Some("off"), true));
    }

    #[test]
    fn relay_toggle_flips_and_drives_pin() {
        let config = DeviceConfig::default();
        let state = OutputState::default();

        let outcome = apply_command(&config, &state, &toggle("relay1")).unwrap();
        assert!(outcome.state.relay[0]);
        assert_eq!(
            outcome.actions,
            vec![DriverAction::DigitalWrite { pin: 16, high: true }]
        );

        let outcome = apply_command(&config, &outcome.state, &toggle("relay1")).unwrap();
        assert!(!outcome.state.relay[0]);
    }

    #[test]
    fn relay_above_configured_count_is_rejected() {
        let config = DeviceConfig::default();
        let state = OutputState::default();

        assert_eq!(
            apply_command(&config, &state, &toggle("relay5")),
            Err(CommandError::RelayOutOfRange(5))
        );
    }

    #[test]
    fn relay_zero_and_unknown_channels_are_unsupported() {
        let config = DeviceConfig::default();
        let state = OutputState::default();

        assert!(matches!(
            apply_command(&config, &state, &toggle("relay0")),
            Err(CommandError::UnsupportedChannel(_))
        ));
        assert!(matches!(
            apply_command(&config, &state, &toggle("humidifier")),
            Err(CommandError::UnsupportedChannel(_))
        ));
    }

    #[test]
    fn unassigned_relay_pin_records_state_without_driving() {
        let mut config = DeviceConfig::default();
        config.relay_count = 6;
        config.relay_gpio[4] = super::UNASSIGNED_PIN;
        let state = OutputState::default();

        let outcome = apply_command(&config, &state, &toggle("relay5")).unwrap();
        assert!(outcome.state.relay[4]);
        assert!(outcome.actions.is_empty());
    }

    #[test]
    fn dimmer_set_clamps_value() {
        let config = DeviceConfig::default();
        let state = OutputState::default();

        let outcome = apply_command(&config, &state, &set_value("dimmer", 250)).unwrap();
        assert_eq!(outcome.state.dimmer_pct, 100);
        assert_eq!(
            outcome.actions,
            vec![DriverAction::PwmWrite {
                channel: PwmChannel::Dimmer,
                duty: PWM_MAX_DUTY,
            }]
        );
    }

    #[test]
    fn dimmer_toggle_maps_to_full_or_off() {
        let config = DeviceConfig::default();
        let mut state = OutputState::default();
        state.dimmer_pct = 40;

        let outcome = apply_command(&config, &state, &toggle("dimmer")).unwrap();
        assert_eq!(outcome.state.dimmer_pct, 0);

        let outcome = apply_command(&config, &outcome.state, &toggle("dimmer")).unwrap();
        assert_eq!(outcome.state.dimmer_pct, 100);
    }

    #[test]
    fn rgbw_on_includes_white_channel() {
        let config = DeviceConfig::default();
        let state = OutputState::default();

        let rgb = apply_command(
            &config,
            &state,
            &Command {
                state: Some("on"),
                ..command("rgb")
            },
        )
        .unwrap();
        assert_eq!(rgb.state.rgb, [100, 100, 100, 0]);

        let rgbw = apply_command(
            &config,
            &state,
            &Command {
                state: Some("on"),
                ..command("rgbw")
            },
        )
        .unwrap();
        assert_eq!(rgbw.state.rgb, [100, 100, 100, 100]);
    }

    #[test]
    fn rgb_components_default_to_prior_values() {
        let config = DeviceConfig::default();
        let mut state = OutputState::default();
        state.rgb = [10, 20, 30, 40];

        let outcome = apply_command(
            &config,
            &state,
            &Command {
                r: Some(90),
                b: Some(200),
                ..command("rgb")
            },
        )
        .unwrap();
        assert_eq!(outcome.state.rgb, [90, 20, 100, 40]);
    }

    #[test]
    fn fan_speed_set_implies_power() {
        let config = DeviceConfig::default();
        let state = OutputState::default();

        let outcome = apply_command(&config, &state, &set_value("fan_speed", 70)).unwrap();
        assert!(outcome.state.fan_power);
        assert_eq!(outcome.state.fan_speed_pct, 70);

        let outcome = apply_command(&config, &outcome.state, &set_value("fan_speed", 0)).unwrap();
        assert!(!outcome.state.fan_power);
        assert_eq!(outcome.state.fan_speed_pct, 0);
    }

    #[test]
    fn fan_toggle_off_zeroes_speed() {
        let config = DeviceConfig::default();
        let mut state = OutputState::default();
        state.fan_power = true;
        state.fan_speed_pct = 80;

        let outcome = apply_command(&config, &state, &toggle("fan")).unwrap();
        assert!(!outcome.state.fan_power);
        assert_eq!(outcome.state.fan_speed_pct, 0);
    }

    #[test]
    fn fan_toggle_on_defaults_speed() {
        let config = DeviceConfig::default();
        let state = OutputState::default();

        let outcome = apply_command(&config, &state, &toggle("fan")).unwrap();
        assert!(outcome.state.fan_power);
        assert_eq!(outcome.state.fan_speed_pct, FAN_DEFAULT_SPEED_PCT);
        assert_eq!(
            outcome.actions,
            vec![
                DriverAction::DigitalWrite {
                    pin: pins::FAN_POWER,
                    high: true,
                },
                DriverAction::PwmWrite {
                    channel: PwmChannel::FanSpeed,
                    duty: percent_to_duty(FAN_DEFAULT_SPEED_PCT),
                },
            ]
        );
    }

    #[test]
    fn fan_power_toggle_leaves_speed_untouched() {
        let config = DeviceConfig::default();
        let mut state = OutputState::default();
        state.fan_power = true;
        state.fan_speed_pct = 60;

        let outcome = apply_command(&config, &state, &toggle("fan_power")).unwrap();
        assert!(!outcome.state.fan_power);
        assert_eq!(outcome.state.fan_speed_pct, 60);

        // Speed PWM still drops to zero while power is off.
        assert!(outcome.actions.contains(&DriverAction::PwmWrite {
            channel: PwmChannel::FanSpeed,
            duty: 0,
        }));
    }

    #[test]
    fn conflicting_aux_pin_skips_driver_call() {
        let mut config = DeviceConfig::default();
        config.relay_gpio[0] = pins::LIGHT;
        let state = OutputState::default();

        let outcome = apply_command(&config, &state, &toggle("light")).unwrap();
        assert!(outcome.state.light);
        assert!(outcome.actions.is_empty());
    }

    #[test]
    fn conflicting_pwm_pin_skips_only_that_channel() {
        let mut config = DeviceConfig::default();
        config.relay_gpio[0] = pins::FAN_SPEED;
        let state = OutputState::default();

        let outcome = apply_command(&config, &state, &set_value("fan", 40)).unwrap();
        assert!(outcome.state.fan_power);
        assert_eq!(outcome.state.fan_speed_pct, 40);
        assert_eq!(
            outcome.actions,
            vec![DriverAction::DigitalWrite {
                pin: pins::FAN_POWER,
                high: true,
            }]
        );
    }

    #[test]
    fn refresh_redrives_active_relays_and_aux_outputs() {
        let mut config = DeviceConfig::default();
        config.relay_count = 2;
        let mut state = OutputState::default();
        state.relay[0] = true;
        state.dimmer_pct = 25;

        let actions = refresh_actions(&config, &state);
        assert!(actions.contains(&DriverAction::DigitalWrite { pin: 16, high: true }));
        assert!(actions.contains(&DriverAction::DigitalWrite { pin: 17, high: false }));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, DriverAction::DigitalWrite { pin: 18, .. })));
        assert!(actions.contains(&DriverAction::PwmWrite {
            channel: PwmChannel::Dimmer,
            duty: percent_to_duty(25),
        }));
    }

    #[test]
    fn percent_scaling_is_linear_to_max_duty() {
        assert_eq!(percent_to_duty(0), 0);
        assert_eq!(percent_to_duty(50), 127);
        assert_eq!(percent_to_duty(100), PWM_MAX_DUTY);
    }
}
