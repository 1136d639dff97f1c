pub const TOPIC_TEMPERATURE: &str = "heater/temperature";
pub const TOPIC_RELAY_STATE: &str = "heater/relay/state";
pub const TOPIC_RELAY_COMMAND: &str = "heater/relay/command";
pub const TOPIC_SAFETY: &str = "heater/safety";
pub const TOPIC_STATUS: &str = "heater/status";
