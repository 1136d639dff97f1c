use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Owner-editable control settings: the active window and the interlock band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    pub active_start_hour: u8,
    /// `24` is accepted and means midnight.
    pub active_end_hour: u8,
    pub temp_max: f32,
    pub temp_reset: f32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            active_start_hour: 9,
            active_end_hour: 23,
            temp_max: 70.0,
            temp_reset: 65.0,
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.active_start_hour > 23 {
            return Err(ConfigError::StartHourOutOfRange(self.active_start_hour));
        }
        if self.active_end_hour > 24 {
            return Err(ConfigError::EndHourOutOfRange(self.active_end_hour));
        }
        if !self.temp_max.is_finite() {
            return Err(ConfigError::NonFiniteThreshold { name: "temp_max" });
        }
        if !self.temp_reset.is_finite() {
            return Err(ConfigError::NonFiniteThreshold { name: "temp_reset" });
        }
        if self.temp_reset >= self.temp_max {
            return Err(ConfigError::DegenerateHysteresis {
                temp_max: self.temp_max,
                temp_reset: self.temp_reset,
            });
        }
        Ok(())
    }

    pub fn start_hour(&self) -> u32 {
        u32::from(self.active_start_hour)
    }

    /// End hour with `24` folded onto midnight.
    pub fn end_hour(&self) -> u32 {
        match self.active_end_hour {
            24 => 0,
            hour => u32::from(hour),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub tick_interval_ms: u64,
    pub telemetry_interval_ms: u64,
    pub manual_override_ms: u64,
    pub offline_grace_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub sleep_grace_ms: u64,
    pub deep_sleep_enabled: bool,
    pub temperature_log_delta_c: f32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 250,
            telemetry_interval_ms: 15_000,
            manual_override_ms: 1_800_000,
            offline_grace_ms: 30_000,
            reconnect_backoff_ms: 30_000,
            reconnect_backoff_max_ms: 900_000,
            sleep_grace_ms: 60_000,
            deep_sleep_enabled: true,
            temperature_log_delta_c: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub hostname: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            hostname: "water-heater".to_string(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardwareConfig {
    pub probe_pin: i32,
    pub relay_pin: i32,
    pub active_led_pin: i32,
    pub relay_led_pin: i32,
    /// Negative disables the manual wake trigger.
    pub wake_button_pin: i32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            probe_pin: 32,
            relay_pin: 33,
            active_led_pin: 26,
            relay_led_pin: 27,
            wake_button_pin: 25,
        }
    }
}

impl HardwareConfig {
    pub fn wake_button(&self) -> Option<i32> {
        (self.wake_button_pin >= 0).then_some(self.wake_button_pin)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub control: ControlConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    pub timezone: String,
    pub network: NetworkConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            timing: TimingConfig::default(),
            timezone: "Europe/Paris".to_string(),
            network: NetworkConfig::default(),
            hardware: HardwareConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Replaces an unusable persisted control config with the defaults.
    /// Returns the rejected error, if any, so the caller can log it.
    pub fn sanitize(&mut self) -> Option<ConfigError> {
        match self.control.validate() {
            Ok(()) => None,
            Err(err) => {
                self.control = ControlConfig::default();
                Some(err)
            }
        }
    }
}
