pub mod arbiter;
pub mod config;
pub mod connectivity;
pub mod controller;
pub mod error;
pub mod safety;
pub mod schedule;
pub mod topics;
pub mod types;

pub use arbiter::{Arbitration, ControlGate, RelayArbiter};
pub use config::{ControlConfig, HardwareConfig, NetworkConfig, RuntimeConfig, TimingConfig};
pub use connectivity::{ConnectivityEvent, ConnectivitySupervisor, LinkStatus};
pub use controller::{
    CommandOutcome, ControllerAction, ControllerState, Publication, SuspendRequest, TickInput,
    TickOutcome,
};
pub use error::{CommandError, ConfigError};
pub use safety::SafetyInterlock;
pub use schedule::{is_active_period, time_to_next_activation, ManualOverrideWindow};
pub use topics::*;
pub use types::{
    CommandSource, ControllerStatus, Liveness, RelayCommand, SafetyState, TemperatureSample,
    WakeCause, DISCONNECTED_SENTINEL_C, FIRMWARE_VERSION,
};
