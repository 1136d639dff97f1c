use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("active_start_hour must be between 0 and 23 (got {0})")]
    StartHourOutOfRange(u8),
    #[error("active_end_hour must be between 0 and 24 (got {0})")]
    EndHourOutOfRange(u8),
    #[error("{name} must be a finite temperature")]
    NonFiniteThreshold { name: &'static str },
    #[error("temp_reset ({temp_reset}) must be lower than temp_max ({temp_max})")]
    DegenerateHysteresis { temp_max: f32, temp_reset: f32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unsupported relay command `{0}` (expected `ON` or `OFF`)")]
    Unsupported(String),
}
