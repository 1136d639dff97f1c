use log::{info, warn};

use crate::{
    config::ControlConfig,
    types::{SafetyState, TemperatureSample},
};

/// Two-threshold over-temperature interlock.
///
/// Trips at or above `temp_max` and only clears at or below `temp_reset`.
/// Samples inside the band, and missing samples, never change the state.
#[derive(Debug, Clone)]
pub struct SafetyInterlock {
    state: SafetyState,
    last_logged_c: Option<f32>,
    log_delta_c: f32,
}

impl SafetyInterlock {
    pub fn new(log_delta_c: f32) -> Self {
        Self {
            state: SafetyState::Normal,
            last_logged_c: None,
            log_delta_c,
        }
    }

    pub fn state(&self) -> SafetyState {
        self.state
    }

    /// Feeds one sample. Returns the new state when a transition happened,
    /// `None` otherwise.
    pub fn update(
        &mut self,
        sample: TemperatureSample,
        config: &ControlConfig,
    ) -> Option<SafetyState> {
        let Some(temp_c) = sample.celsius() else {
            return None;
        };
        self.log_if_changed(temp_c);

        match self.state {
            SafetyState::Normal if temp_c >= config.temp_max => {
                warn!(
                    "safety interlock tripped: {temp_c:.1}°C >= {:.1}°C max",
                    config.temp_max
                );
                self.state = SafetyState::Tripped;
                Some(SafetyState::Tripped)
            }
            SafetyState::Tripped if temp_c <= config.temp_reset => {
                info!(
                    "safety interlock reset: {temp_c:.1}°C <= {:.1}°C reset",
                    config.temp_reset
                );
                self.state = SafetyState::Normal;
                Some(SafetyState::Normal)
            }
            _ => None,
        }
    }

    fn log_if_changed(&mut self, temp_c: f32) {
        let changed = self
            .last_logged_c
            .map(|last| (temp_c - last).abs() >= self.log_delta_c)
            .unwrap_or(true);
        if changed {
            info!("temperature: {temp_c:.1}°C");
            self.last_logged_c = Some(temp_c);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn run(interlock: &mut SafetyInterlock, samples: &[f32]) -> (Vec<SafetyState>, usize) {
        let config = ControlConfig::default();
        let mut states = Vec::new();
        let mut transitions = 0;
        for sample in samples {
            if interlock
                .update(TemperatureSample::Celsius(*sample), &config)
                .is_some()
            {
                transitions += 1;
            }
            states.push(interlock.state());
        }
        (states, transitions)
    }

    #[test]
    fn hysteresis_scenario() {
        let mut interlock = SafetyInterlock::new(0.5);
        let (states, transitions) = run(&mut interlock, &[69.9, 70.0, 68.0, 65.0, 64.9]);

        assert_eq!(
            states,
            vec![
                SafetyState::Normal,
                SafetyState::Tripped,
                SafetyState::Tripped,
                SafetyState::Normal,
                SafetyState::Normal,
            ]
        );
        // Reset threshold is inclusive: 65.0 clears the trip.
        assert_eq!(transitions, 2);
    }

    #[test]
    fn rising_past_max_trips_once() {
        let mut interlock = SafetyInterlock::new(0.5);
        let (_, transitions) = run(&mut interlock, &[60.0, 68.0, 70.0, 72.0, 80.0, 95.0]);
        assert_eq!(transitions, 1);
        assert_eq!(interlock.state(), SafetyState::Tripped);
    }

    #[test]
    fn dead_band_does_not_chatter() {
        let mut interlock = SafetyInterlock::new(0.5);
        let (_, transitions) = run(&mut interlock, &[66.0, 69.0, 66.5, 69.9, 65.1]);
        assert_eq!(transitions, 0);
        assert_eq!(interlock.state(), SafetyState::Normal);
    }

    #[test]
    fn disconnected_probe_keeps_trip() {
        let config = ControlConfig::default();
        let mut interlock = SafetyInterlock::new(0.5);
        interlock.update(TemperatureSample::Celsius(75.0), &config);

        for _ in 0..10 {
            assert_eq!(
                interlock.update(TemperatureSample::Disconnected, &config),
                None
            );
        }
        assert_eq!(interlock.state(), SafetyState::Tripped);
    }

    #[test]
    fn disconnected_probe_never_trips() {
        let config = ControlConfig::default();
        let mut interlock = SafetyInterlock::new(0.5);
        assert_eq!(
            interlock.update(TemperatureSample::Disconnected, &config),
            None
        );
        assert_eq!(interlock.state(), SafetyState::Normal);
    }

    #[test]
    fn fresh_interlock_trips_on_first_hot_sample() {
        let config = ControlConfig::default();
        let mut interlock = SafetyInterlock::new(0.5);
        assert_eq!(
            interlock.update(TemperatureSample::Celsius(71.0), &config),
            Some(SafetyState::Tripped)
        );
    }
}
