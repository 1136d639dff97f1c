use serde::{Deserialize, Serialize};

use crate::error::CommandError;

/// Reported in place of a temperature when the probe is absent.
pub const DISCONNECTED_SENTINEL_C: f32 = -127.0;

pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayCommand {
    On,
    Off,
}

impl RelayCommand {
    /// Accepts exactly `ON` or `OFF` after trimming surrounding whitespace.
    pub fn parse(raw: &str) -> Result<Self, CommandError> {
        match raw.trim() {
            "ON" => Ok(Self::On),
            "OFF" => Ok(Self::Off),
            other => Err(CommandError::Unsupported(other.to_string())),
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Telemetry,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyState {
    Normal,
    Tripped,
}

impl SafetyState {
    pub fn is_tripped(self) -> bool {
        self == Self::Tripped
    }

    /// Payload published on the safety topic.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "OFF",
            Self::Tripped => "SAFETY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TemperatureSample {
    Celsius(f32),
    Disconnected,
}

impl TemperatureSample {
    /// Maps driver output onto a sample; non-finite values and the DS18B20
    /// disconnect code are both treated as an absent probe.
    pub fn from_reading(reading: Option<f32>) -> Self {
        match reading {
            Some(value) if value.is_finite() && value > DISCONNECTED_SENTINEL_C => {
                Self::Celsius(value)
            }
            _ => Self::Disconnected,
        }
    }

    pub fn celsius(self) -> Option<f32> {
        match self {
            Self::Celsius(value) => Some(value),
            Self::Disconnected => None,
        }
    }

    pub fn reported_celsius(self) -> f32 {
        self.celsius().unwrap_or(DISCONNECTED_SENTINEL_C)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    PowerOn,
    Timer,
    ManualTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Online,
    Offline,
}

impl Liveness {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub temperature: f32,
    pub relay: bool,
    pub status: &'static str,
    #[serde(rename = "canControl")]
    pub can_control: bool,
    pub safety: &'static str,
    pub requested: &'static str,
    #[serde(rename = "scheduleActive")]
    pub schedule_active: bool,
    #[serde(rename = "manualOverrideRemainingMin")]
    pub manual_override_remaining_min: u64,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub online: bool,
    pub version: &'static str,
}
