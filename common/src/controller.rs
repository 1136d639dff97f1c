use std::time::Duration;

use chrono::NaiveTime;
use log::{info, warn};

use crate::{
    arbiter::{Arbitration, ControlGate, RelayArbiter},
    config::{ControlConfig, TimingConfig},
    connectivity::{ConnectivityEvent, ConnectivitySupervisor, LinkStatus},
    error::ConfigError,
    safety::SafetyInterlock,
    schedule::{is_active_period, time_to_next_activation, ManualOverrideWindow},
    topics::{TOPIC_RELAY_STATE, TOPIC_SAFETY, TOPIC_STATUS, TOPIC_TEMPERATURE},
    types::{
        CommandSource, ControllerStatus, Liveness, RelayCommand, SafetyState, TemperatureSample,
        WakeCause, FIRMWARE_VERSION,
    },
};

/// A retained message for the telemetry bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: &'static str,
    pub payload: String,
}

impl Publication {
    pub fn relay(on: bool) -> Self {
        Self {
            topic: TOPIC_RELAY_STATE,
            payload: if on { "ON" } else { "OFF" }.to_string(),
        }
    }

    pub fn safety(state: SafetyState) -> Self {
        Self {
            topic: TOPIC_SAFETY,
            payload: state.as_str().to_string(),
        }
    }

    pub fn liveness(liveness: Liveness) -> Self {
        Self {
            topic: TOPIC_STATUS,
            payload: liveness.as_str().to_string(),
        }
    }

    pub fn temperature(temp_c: f32) -> Self {
        Self {
            topic: TOPIC_TEMPERATURE,
            payload: format!("{temp_c:.1}"),
        }
    }
}

/// Side effects for the platform harness, executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerAction {
    /// Emitted on every tick, not only on a change. Pin writes must be idempotent.
    SetRelay(bool),
    SetActiveIndicator(bool),
    Publish(Publication),
    PowerDownRadio,
    PowerUpRadio,
}

/// Terminal request: arm the wake sources and suspend the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuspendRequest {
    pub duration: Duration,
    pub manual_trigger: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickInput {
    pub sample: TemperatureSample,
    /// Local wall-clock time, `None` until the clock is synchronized.
    pub clock: Option<NaiveTime>,
    pub link: LinkStatus,
    pub now_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    pub actions: Vec<ControllerAction>,
    pub suspend: Option<SuspendRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    /// `false` when an `ON` request is held back by the interlock or schedule.
    pub accepted: bool,
    pub relay: bool,
    pub actions: Vec<ControllerAction>,
}

/// All device-wide control state, owned by the control loop.
#[derive(Debug, Clone)]
pub struct ControllerState {
    config: ControlConfig,
    timing: TimingConfig,
    interlock: SafetyInterlock,
    arbiter: RelayArbiter,
    connectivity: ConnectivitySupervisor,
    requested: RelayCommand,
    manual_override: Option<ManualOverrideWindow>,
    manual_trigger_available: bool,
    last_sample: TemperatureSample,
    last_temperature_publish_ms: Option<u64>,
    inactive_since_ms: Option<u64>,
    active_indicator: Option<bool>,
    state_asserted: bool,
}

impl ControllerState {
    /// Builds the boot-time state. A manual-trigger wake opens the override
    /// window immediately.
    pub fn new(
        config: ControlConfig,
        timing: TimingConfig,
        wake: WakeCause,
        manual_trigger_available: bool,
        now_ms: u64,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut state = Self {
            config,
            interlock: SafetyInterlock::new(timing.temperature_log_delta_c),
            arbiter: RelayArbiter::default(),
            connectivity: ConnectivitySupervisor::new(&timing, now_ms),
            requested: RelayCommand::Off,
            manual_override: None,
            manual_trigger_available,
            last_sample: TemperatureSample::Disconnected,
            last_temperature_publish_ms: None,
            inactive_since_ms: None,
            active_indicator: None,
            state_asserted: false,
            timing,
        };

        info!("controller starting (wake cause: {wake:?})");
        if wake == WakeCause::ManualTrigger {
            state.enter_manual_override(now_ms);
        }
        Ok(state)
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    pub fn relay(&self) -> bool {
        self.arbiter.output()
    }

    pub fn safety(&self) -> SafetyState {
        self.interlock.state()
    }

    pub fn requested(&self) -> RelayCommand {
        self.requested
    }

    pub fn liveness(&self) -> Liveness {
        self.connectivity.liveness()
    }

    pub fn last_sample(&self) -> TemperatureSample {
        self.last_sample
    }

    pub fn manual_override_active(&self, now_ms: u64) -> bool {
        self.manual_override
            .map(|window| window.is_active(now_ms))
            .unwrap_or(false)
    }

    pub fn manual_override_remaining_ms(&self, now_ms: u64) -> u64 {
        self.manual_override
            .map(|window| window.remaining_ms(now_ms))
            .unwrap_or(0)
    }

    pub fn can_control(&self, clock: Option<NaiveTime>, now_ms: u64) -> bool {
        self.gate(clock, now_ms).permits_heat()
    }

    /// Opens (or extends) the time-boxed manual override window.
    pub fn enter_manual_override(&mut self, now_ms: u64) {
        let window = ManualOverrideWindow::starting_at(now_ms, self.timing.manual_override_ms);
        info!(
            "manual override active for {} min",
            self.timing.manual_override_ms / 60_000
        );
        self.manual_override = Some(window);
        self.inactive_since_ms = None;
    }

    /// Records an inbound relay command and arbitrates immediately.
    ///
    /// A rejected `ON` stays pending and takes effect once control is
    /// permitted again.
    pub fn handle_command(
        &mut self,
        source: CommandSource,
        command: RelayCommand,
        clock: Option<NaiveTime>,
        now_ms: u64,
    ) -> CommandOutcome {
        info!("{source:?} command: {}", command.as_str());
        self.requested = command;

        // Every command re-publishes the relay state, so a held-back `ON` is
        // visible on the bus as a retained `OFF`.
        let mut actions = Vec::new();
        let result = self.arbitrate(clock, now_ms, true, &mut actions);
        if result.rejected {
            warn!(
                "{source:?} ON held: control not permitted (safety={}, schedule_active={}, manual_override={})",
                self.safety().as_str(),
                is_active_period(&self.config, clock),
                self.manual_override_active(now_ms)
            );
        }

        CommandOutcome {
            accepted: !result.rejected,
            relay: result.output,
            actions,
        }
    }

    /// Replaces the control config. Invalid configs are rejected whole.
    pub fn update_config(
        &mut self,
        config: ControlConfig,
        clock: Option<NaiveTime>,
        now_ms: u64,
    ) -> Result<Vec<ControllerAction>, ConfigError> {
        config.validate()?;
        info!(
            "control config updated: window {}h-{}h, max {:.1}°C, reset {:.1}°C",
            config.active_start_hour, config.active_end_hour, config.temp_max, config.temp_reset
        );
        self.config = config;

        let mut actions = Vec::new();
        if let Some(state) = self.interlock.update(self.last_sample, &self.config) {
            actions.push(ControllerAction::Publish(Publication::safety(state)));
        }
        self.arbitrate(clock, now_ms, false, &mut actions);
        Ok(actions)
    }

    /// One evaluation of the control loop.
    pub fn tick(&mut self, input: TickInput) -> TickOutcome {
        let TickInput {
            sample,
            clock,
            link,
            now_ms,
        } = input;
        let mut outcome = TickOutcome::default();
        let actions = &mut outcome.actions;

        self.expire_manual_override(now_ms);

        self.last_sample = sample;
        let safety_transition = self.interlock.update(sample, &self.config);
        if let Some(state) = safety_transition {
            actions.push(ControllerAction::Publish(Publication::safety(state)));
        }

        let gate = self.gate(clock, now_ms);
        self.drive_indicator(gate.effective_active(), actions);

        let event = self.connectivity.observe(link, now_ms);
        let mut force_republish = !self.state_asserted;
        if event == Some(ConnectivityEvent::CameOnline) {
            actions.push(ControllerAction::Publish(Publication::liveness(
                Liveness::Online,
            )));
            force_republish = true;
        }

        let arbitration = self.arbitrate(clock, now_ms, force_republish, actions);
        if !arbitration.changed {
            // Re-drive the pin every tick; a lost or stale write lasts one tick at most.
            actions.push(ControllerAction::SetRelay(arbitration.output));
        }
        if force_republish && safety_transition.is_none() {
            actions.push(ControllerAction::Publish(Publication::safety(
                self.interlock.state(),
            )));
        }
        self.state_asserted = true;

        match event {
            Some(ConnectivityEvent::WentOffline { bus_writable }) => {
                if bus_writable {
                    actions.push(ControllerAction::Publish(Publication::liveness(
                        Liveness::Offline,
                    )));
                }
                actions.push(ControllerAction::PowerDownRadio);
            }
            Some(ConnectivityEvent::PowerUpRadio) => actions.push(ControllerAction::PowerUpRadio),
            Some(ConnectivityEvent::PowerDownRadio) => {
                actions.push(ControllerAction::PowerDownRadio)
            }
            Some(ConnectivityEvent::CameOnline) | None => {}
        }

        self.publish_temperature_if_due(sample, now_ms, actions);

        outcome.suspend = self.plan_suspend(gate, clock, now_ms, actions);
        outcome
    }

    pub fn status(&self, clock: Option<NaiveTime>, now_ms: u64) -> ControllerStatus {
        let gate = self.gate(clock, now_ms);
        let relay = self.relay();
        let status = if self.safety().is_tripped() {
            "Safety active"
        } else if relay {
            "Relay ON"
        } else {
            "Relay OFF"
        };

        ControllerStatus {
            temperature: self.last_sample.reported_celsius(),
            relay,
            status,
            can_control: gate.permits_heat(),
            safety: self.safety().as_str(),
            requested: self.requested.as_str(),
            schedule_active: gate.schedule_active,
            manual_override_remaining_min: self.manual_override_remaining_ms(now_ms) / 60_000,
            time_synced: clock.is_some(),
            online: self.connectivity.is_online(),
            version: FIRMWARE_VERSION,
        }
    }

    fn gate(&self, clock: Option<NaiveTime>, now_ms: u64) -> ControlGate {
        ControlGate {
            safety: self.interlock.state(),
            schedule_active: is_active_period(&self.config, clock),
            manual_override_active: self.manual_override_active(now_ms),
        }
    }

    fn arbitrate(
        &mut self,
        clock: Option<NaiveTime>,
        now_ms: u64,
        force_republish: bool,
        actions: &mut Vec<ControllerAction>,
    ) -> Arbitration {
        let gate = self.gate(clock, now_ms);
        let previous = self.arbiter.output();
        let result = self.arbiter.arbitrate(self.requested, gate, force_republish);

        if result.output != previous {
            info!("relay {}", if result.output { "ON" } else { "OFF" });
        }
        if result.changed {
            actions.push(ControllerAction::SetRelay(result.output));
            actions.push(ControllerAction::Publish(Publication::relay(result.output)));
        }
        result
    }

    fn expire_manual_override(&mut self, now_ms: u64) {
        if let Some(window) = self.manual_override {
            if !window.is_active(now_ms) {
                info!("manual override expired");
                self.manual_override = None;
            }
        }
    }

    fn drive_indicator(&mut self, active: bool, actions: &mut Vec<ControllerAction>) {
        if self.active_indicator != Some(active) {
            self.active_indicator = Some(active);
            actions.push(ControllerAction::SetActiveIndicator(active));
        }
    }

    fn publish_temperature_if_due(
        &mut self,
        sample: TemperatureSample,
        now_ms: u64,
        actions: &mut Vec<ControllerAction>,
    ) {
        let Some(temp_c) = sample.celsius() else {
            return;
        };
        if !self.connectivity.is_online() {
            return;
        }

        let due = self
            .last_temperature_publish_ms
            .map(|last| now_ms.saturating_sub(last) >= self.timing.telemetry_interval_ms)
            .unwrap_or(true);
        if due {
            self.last_temperature_publish_ms = Some(now_ms);
            actions.push(ControllerAction::Publish(Publication::temperature(temp_c)));
        }
    }

    /// Suspends only when the schedule is what keeps the relay off, the clock
    /// is trusted, and the window has been closed for `sleep_grace_ms`.
    fn plan_suspend(
        &mut self,
        gate: ControlGate,
        clock: Option<NaiveTime>,
        now_ms: u64,
        actions: &mut Vec<ControllerAction>,
    ) -> Option<SuspendRequest> {
        let clock = match clock {
            Some(clock) if self.timing.deep_sleep_enabled && !gate.effective_active() => clock,
            _ => {
                self.inactive_since_ms = None;
                return None;
            }
        };

        let since = *self.inactive_since_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(since) < self.timing.sleep_grace_ms {
            return None;
        }

        let duration = time_to_next_activation(&self.config, clock);
        info!(
            "outside active window; suspending for {}s",
            duration.as_secs()
        );

        if self.arbiter.output() {
            actions.push(ControllerAction::SetRelay(false));
        }
        actions.push(ControllerAction::SetActiveIndicator(false));
        if self.connectivity.is_online() {
            actions.push(ControllerAction::Publish(Publication::liveness(
                Liveness::Offline,
            )));
        }
        actions.push(ControllerAction::PowerDownRadio);

        Some(SuspendRequest {
            duration,
            manual_trigger: self.manual_trigger_available,
        })
    }
}
