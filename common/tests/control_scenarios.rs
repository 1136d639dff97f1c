use std::time::Duration;

use chrono::NaiveTime;
use pretty_assertions::assert_eq;

use heater_common::{
    time_to_next_activation, CommandSource, ControlConfig, ControllerAction, ControllerState,
    LinkStatus, Liveness, Publication, RelayCommand, SafetyState, TemperatureSample, TickInput,
    TickOutcome, TimingConfig, WakeCause, TOPIC_RELAY_STATE, TOPIC_SAFETY, TOPIC_STATUS,
};

const UP: LinkStatus = LinkStatus {
    network_up: true,
    bus_up: true,
};
const DOWN: LinkStatus = LinkStatus {
    network_up: false,
    bus_up: false,
};

fn hms(hour: u32, minute: u32, second: u32) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(hour, minute, second)
}

fn boot(wake: WakeCause) -> ControllerState {
    ControllerState::new(
        ControlConfig::default(),
        TimingConfig::default(),
        wake,
        true,
        0,
    )
    .unwrap()
}

fn step(
    state: &mut ControllerState,
    sample: TemperatureSample,
    clock: Option<NaiveTime>,
    link: LinkStatus,
    now_ms: u64,
) -> TickOutcome {
    state.tick(TickInput {
        sample,
        clock,
        link,
        now_ms,
    })
}

fn published_on<'a>(outcome: &'a TickOutcome, topic: &str) -> Vec<&'a str> {
    published_on_actions(&outcome.actions, topic)
}

fn published_on_actions<'a>(actions: &'a [ControllerAction], topic: &str) -> Vec<&'a str> {
    actions
        .iter()
        .filter_map(|action| match action {
            ControllerAction::Publish(publication) if publication.topic == topic => {
                Some(publication.payload.as_str())
            }
            _ => None,
        })
        .collect()
}

#[test]
fn rising_temperature_trips_exactly_once() {
    let mut state = boot(WakeCause::PowerOn);
    let mut notifications = Vec::new();

    for (i, temp) in [60.0, 66.0, 69.9, 70.0, 71.5, 75.0, 90.0].iter().enumerate() {
        let outcome = step(
            &mut state,
            TemperatureSample::Celsius(*temp),
            hms(12, 0, 0),
            UP,
            i as u64 * 250,
        );
        notifications.extend(
            published_on(&outcome, TOPIC_SAFETY)
                .into_iter()
                .map(str::to_string),
        );
    }

    // First entry is the boot-time assertion of the initial state.
    assert_eq!(notifications, vec!["OFF".to_string(), "SAFETY".to_string()]);
}

#[test]
fn relay_is_never_on_while_tripped() {
    let mut state = boot(WakeCause::PowerOn);
    let temps = [
        40.0, 55.0, 69.0, 70.0, 72.0, 68.0, 66.0, 65.5, 65.0, 60.0, 71.0, 64.0, 80.0, 50.0,
    ];

    for (i, temp) in temps.iter().enumerate() {
        let now_ms = i as u64 * 250;
        let command = if i % 2 == 0 {
            RelayCommand::On
        } else {
            RelayCommand::Off
        };
        state.handle_command(CommandSource::Telemetry, RelayCommand::On, hms(12, 0, 0), now_ms);
        step(
            &mut state,
            TemperatureSample::Celsius(*temp),
            hms(12, 0, 0),
            UP,
            now_ms,
        );
        assert!(!(state.relay() && state.safety() == SafetyState::Tripped));

        let outcome = state.handle_command(CommandSource::Http, command, hms(12, 0, 0), now_ms);
        assert!(!(outcome.relay && state.safety() == SafetyState::Tripped));
    }
}

#[test]
fn disconnected_probe_while_hot_keeps_heat_off() {
    let mut state = boot(WakeCause::PowerOn);
    state.handle_command(CommandSource::Http, RelayCommand::On, hms(12, 0, 0), 0);
    step(
        &mut state,
        TemperatureSample::Celsius(72.0),
        hms(12, 0, 0),
        UP,
        0,
    );

    for i in 1..20 {
        step(
            &mut state,
            TemperatureSample::Disconnected,
            hms(12, 0, 0),
            UP,
            i * 250,
        );
        assert_eq!(state.safety(), SafetyState::Tripped);
        assert!(!state.relay());
    }
    assert_eq!(state.status(hms(12, 0, 0), 5_000).temperature, -127.0);
}

#[test]
fn reboot_while_hot_trips_on_first_tick() {
    let mut state = boot(WakeCause::Timer);
    state.handle_command(CommandSource::Telemetry, RelayCommand::On, hms(10, 0, 0), 0);
    let outcome = step(
        &mut state,
        TemperatureSample::Celsius(70.2),
        hms(10, 0, 0),
        UP,
        0,
    );

    assert_eq!(state.safety(), SafetyState::Tripped);
    assert!(!state.relay());
    assert_eq!(published_on(&outcome, TOPIC_SAFETY), vec!["SAFETY"]);
}

#[test]
fn schedule_windows_drive_control() {
    let mut state = boot(WakeCause::PowerOn);
    step(
        &mut state,
        TemperatureSample::Celsius(40.0),
        hms(10, 0, 0),
        UP,
        0,
    );
    assert!(state.can_control(hms(10, 0, 0), 0));
    assert!(!state.can_control(hms(23, 0, 0), 0));

    let wrapping = ControlConfig {
        active_start_hour: 23,
        active_end_hour: 6,
        ..ControlConfig::default()
    };
    state.update_config(wrapping, hms(2, 0, 0), 10).unwrap();
    assert!(state.can_control(hms(2, 0, 0), 10));
    assert!(!state.can_control(hms(10, 0, 0), 10));

    let until_midnight = ControlConfig {
        active_start_hour: 9,
        active_end_hour: 24,
        ..ControlConfig::default()
    };
    state.update_config(until_midnight, hms(23, 30, 0), 20).unwrap();
    assert!(state.can_control(hms(23, 30, 0), 20));
    assert!(!state.can_control(hms(0, 30, 0), 20));
}

#[test]
fn wake_delay_before_window_is_clamped() {
    let delay = time_to_next_activation(&ControlConfig::default(), hms(8, 59, 30).unwrap());
    assert_eq!(delay, Duration::from_secs(60));
}

#[test]
fn on_outside_window_is_rejected_but_recorded() {
    let mut state = boot(WakeCause::PowerOn);
    step(
        &mut state,
        TemperatureSample::Celsius(40.0),
        hms(23, 30, 0),
        UP,
        0,
    );

    let outcome =
        state.handle_command(CommandSource::Telemetry, RelayCommand::On, hms(23, 30, 0), 10);
    assert!(!outcome.accepted);
    assert!(!outcome.relay);
    assert_eq!(published_on_actions(&outcome.actions, TOPIC_RELAY_STATE), vec!["OFF"]);
    assert_eq!(state.requested(), RelayCommand::On);
}

#[test]
fn reconnect_reasserts_state_but_steady_online_is_silent() {
    let mut state = boot(WakeCause::PowerOn);
    let clock = hms(12, 0, 0);
    let warm = TemperatureSample::Celsius(40.0);
    step(&mut state, warm, clock, UP, 0);
    state.handle_command(CommandSource::Http, RelayCommand::On, clock, 10);

    let steady = step(&mut state, warm, clock, UP, 1_000);
    assert!(published_on(&steady, TOPIC_RELAY_STATE).is_empty());
    assert!(published_on(&steady, TOPIC_SAFETY).is_empty());

    // Sustained loss takes the device offline and powers the radio down.
    step(&mut state, warm, clock, DOWN, 2_000);
    let offline = step(&mut state, warm, clock, DOWN, 32_000);
    assert_eq!(state.liveness(), Liveness::Offline);
    assert!(offline
        .actions
        .contains(&ControllerAction::PowerDownRadio));
    assert!(state.relay());

    let retry = step(&mut state, warm, clock, DOWN, 62_000);
    assert_eq!(
        retry.actions,
        vec![
            ControllerAction::SetRelay(true),
            ControllerAction::PowerUpRadio,
        ]
    );

    let back = step(&mut state, warm, clock, UP, 63_000);
    assert_eq!(published_on(&back, TOPIC_STATUS), vec!["ONLINE"]);
    assert_eq!(published_on(&back, TOPIC_RELAY_STATE), vec!["ON"]);
    assert_eq!(published_on(&back, TOPIC_SAFETY), vec!["OFF"]);
}

#[test]
fn offline_notice_only_when_bus_still_writable() {
    let mut state = boot(WakeCause::PowerOn);
    let clock = hms(12, 0, 0);
    let warm = TemperatureSample::Celsius(40.0);
    step(&mut state, warm, clock, UP, 0);

    let wifi_only_down = LinkStatus {
        network_up: false,
        bus_up: true,
    };
    step(&mut state, warm, clock, wifi_only_down, 1_000);
    let outcome = step(&mut state, warm, clock, wifi_only_down, 31_000);
    assert_eq!(
        outcome.actions,
        vec![
            ControllerAction::SetRelay(false),
            ControllerAction::Publish(Publication::liveness(Liveness::Offline)),
            ControllerAction::PowerDownRadio,
        ]
    );
}

#[test]
fn hysteresis_scenario_notifications() {
    let mut state = boot(WakeCause::PowerOn);
    let clock = hms(12, 0, 0);
    // Initial assertion happens on the first tick; skip it.
    step(&mut state, TemperatureSample::Celsius(40.0), clock, UP, 0);

    let mut states = Vec::new();
    let mut notifications = 0;
    for (i, temp) in [69.9, 70.0, 68.0, 65.0, 64.9].iter().enumerate() {
        let outcome = step(
            &mut state,
            TemperatureSample::Celsius(*temp),
            clock,
            UP,
            (i as u64 + 1) * 250,
        );
        notifications += published_on(&outcome, TOPIC_SAFETY).len();
        states.push(state.safety());
    }

    // The reset threshold is inclusive, so 65.0 already clears the trip.
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
    assert_eq!(notifications, 2);
}

#[test]
fn inactive_window_suspends_after_grace() {
    let mut state = boot(WakeCause::PowerOn);
    let warm = TemperatureSample::Celsius(40.0);
    step(&mut state, warm, hms(23, 0, 0), UP, 0);

    let early = step(&mut state, warm, hms(23, 0, 59), UP, 59_999);
    assert_eq!(early.suspend, None);

    let outcome = step(&mut state, warm, hms(23, 1, 0), UP, 60_000);
    let suspend = outcome.suspend.expect("suspend requested");
    assert_eq!(suspend.duration, Duration::from_secs(10 * 3600 - 60));
    assert!(suspend.manual_trigger);
    assert!(outcome
        .actions
        .ends_with(&[
            ControllerAction::SetActiveIndicator(false),
            ControllerAction::Publish(Publication::liveness(Liveness::Offline)),
            ControllerAction::PowerDownRadio,
        ]));
}

#[test]
fn unsynchronized_clock_never_suspends() {
    let mut state = boot(WakeCause::PowerOn);
    for i in 0..10 {
        let outcome = step(
            &mut state,
            TemperatureSample::Celsius(40.0),
            None,
            UP,
            i * 60_000,
        );
        assert_eq!(outcome.suspend, None);
    }
    assert!(state.can_control(None, 600_000));
}

#[test]
fn manual_wake_holds_off_suspension_until_override_ends() {
    let mut state = boot(WakeCause::ManualTrigger);
    let warm = TemperatureSample::Celsius(40.0);
    let night = hms(3, 0, 0);

    for now_ms in (0..1_800_000).step_by(60_000) {
        assert_eq!(step(&mut state, warm, night, UP, now_ms).suspend, None);
    }

    step(&mut state, warm, night, UP, 1_800_000);
    let outcome = step(&mut state, warm, night, UP, 1_860_000);
    assert!(outcome.suspend.is_some());
}

/// Stand-in for a GPIO line that only changes on `SetRelay`.
#[derive(Default)]
struct RelayPin {
    level: bool,
}

impl RelayPin {
    fn apply(&mut self, actions: &[ControllerAction]) {
        for action in actions {
            if let ControllerAction::SetRelay(on) = action {
                self.level = *on;
            }
        }
    }
}

#[test]
fn stale_relay_write_is_repaired_on_next_tick() {
    let mut state = boot(WakeCause::PowerOn);
    let mut pin = RelayPin::default();
    let hot = TemperatureSample::Celsius(60.0);

    pin.apply(&step(&mut state, hot, hms(7, 0, 0), UP, 0).actions);
    let pending =
        state.handle_command(CommandSource::Telemetry, RelayCommand::On, hms(7, 0, 0), 10);
    pin.apply(&pending.actions);

    // Window opens; this tick's writes are applied late.
    let late = step(&mut state, hot, hms(9, 0, 0), UP, 1_000);
    assert!(late.actions.contains(&ControllerAction::SetRelay(true)));

    let stricter = ControlConfig {
        temp_max: 55.0,
        temp_reset: 50.0,
        ..ControlConfig::default()
    };
    let trip = state.update_config(stricter, hms(9, 0, 0), 1_100).unwrap();
    pin.apply(&trip);
    pin.apply(&late.actions);
    assert_eq!(state.safety(), SafetyState::Tripped);
    assert!(pin.level);

    pin.apply(&step(&mut state, hot, hms(9, 0, 0), UP, 1_250).actions);
    assert!(!pin.level);

    for i in 0..20 {
        pin.apply(&step(&mut state, hot, hms(9, 0, 1), UP, 1_500 + i * 250).actions);
        assert_eq!(pin.level, state.relay());
        assert!(!pin.level);
    }
}

#[test]
fn pin_agrees_with_arbiter_after_every_tick() {
    let mut state = boot(WakeCause::PowerOn);
    let mut pin = RelayPin::default();
    let clock = hms(12, 0, 0);
    let temps = [40.0, 68.0, 70.5, 66.0, 64.0, 71.0, 50.0];

    for (i, temp) in temps.iter().enumerate() {
        let now_ms = i as u64 * 250;
        let command = if i % 3 == 0 {
            RelayCommand::Off
        } else {
            RelayCommand::On
        };
        let tick = step(&mut state, TemperatureSample::Celsius(*temp), clock, UP, now_ms);
        let outcome = state.handle_command(CommandSource::Http, command, clock, now_ms + 1);

        // Command lands first, tick writes after it.
        pin.apply(&outcome.actions);
        pin.apply(&tick.actions);

        let settled = step(&mut state, TemperatureSample::Celsius(*temp), clock, UP, now_ms + 2);
        pin.apply(&settled.actions);
        assert_eq!(pin.level, state.relay());
        assert!(!(pin.level && state.safety() == SafetyState::Tripped));
    }
}
