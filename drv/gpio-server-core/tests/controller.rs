// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end exercises of the controller façade over the mock backend.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drv_gpio_api::{
    Direction, EdgeKind, Event, GpioError, Level, PinBackend, PinConfig,
    Pull, PwmConfig,
};
use drv_gpio_mock::MockBackend;
use drv_gpio_server_core::{
    AuditKind, AuditLog, Backend, Controller, Handler, OpClass,
    PolicyConfig,
};

const CALLER: &str = "test";

struct Rig {
    mock: Arc<MockBackend>,
    controller: Controller,
}

fn rig_with(policy: PolicyConfig) -> Rig {
    let mock = Arc::new(MockBackend::new());
    let backend = Backend::Mock(Arc::clone(&mock));
    let audit = Arc::new(AuditLog::new(128));
    Rig {
        mock,
        controller: Controller::new(backend, policy, audit, true),
    }
}

fn rig() -> Rig {
    rig_with(PolicyConfig::default())
}

fn channel_handler() -> (Handler, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let handler: Handler = Arc::new(move |event| {
        let _ = tx.lock().unwrap().send(event);
    });
    (handler, rx)
}

#[test]
fn write_read_back_through_state() {
    let rig = rig();
    let c = &rig.controller;

    c.configure(PinConfig::output(18), CALLER).unwrap();
    c.write(18, Level::High, CALLER).unwrap();
    assert_eq!(c.get_state(18).unwrap().level, Level::High);
    assert_eq!(rig.mock.read(18).unwrap(), Level::High);

    c.write(18, Level::Low, CALLER).unwrap();
    assert_eq!(c.get_state(18).unwrap().level, Level::Low);
    assert_eq!(rig.mock.read(18).unwrap(), Level::Low);
}

#[test]
fn critical_pin_is_denied_and_never_reaches_the_backend() {
    let rig = rig();
    let c = &rig.controller;

    let err = c.configure(PinConfig::output(0), CALLER).unwrap_err();
    assert_eq!(err, GpioError::CriticalPin);
    assert!(err.to_string().contains("critical system pin"));

    assert!(c.list_configured_pins().iter().all(|s| s.pin != 0));

    // Every operation class bounces the same way, with no backend call.
    assert_eq!(c.read(1, CALLER), Err(GpioError::CriticalPin));
    assert_eq!(
        c.write(14, Level::High, CALLER),
        Err(GpioError::CriticalPin)
    );
    assert_eq!(c.set_pwm(15, 1000, 50, CALLER), Err(GpioError::CriticalPin));

    let denied = rig
        .controller
        .audit_log()
        .counts()
        .get("policy_denied")
        .copied()
        .unwrap_or(0);
    assert!(denied >= 4);
}

#[test]
fn write_requires_output_direction() {
    let rig = rig();
    let c = &rig.controller;

    c.configure(PinConfig::input(18, Pull::Up), CALLER).unwrap();
    let err = c.write(18, Level::Low, CALLER).unwrap_err();
    assert_eq!(err, GpioError::NotOutput);
    assert!(err.to_string().contains("not configured as output"));

    // The input still floats at its bias; nothing was driven.
    assert_eq!(rig.mock.read(18).unwrap(), Level::High);

    // And the mirror image for reads.
    c.configure(PinConfig::output(21), CALLER).unwrap();
    assert_eq!(c.read(21, CALLER), Err(GpioError::NotInput));
}

#[test]
fn pwm_bounds_and_busy_rejection() {
    let rig = rig();
    let c = &rig.controller;

    c.configure(PinConfig::output(18), CALLER).unwrap();
    c.set_pwm(18, 1000, 50, CALLER).unwrap();

    let err = c.set_pwm(18, 0, 50, CALLER).unwrap_err();
    assert_eq!(err, GpioError::FrequencyOutOfRange);
    assert!(err.to_string().contains("frequency out of range"));

    let err = c.set_pwm(18, 1000, 101, CALLER).unwrap_err();
    assert_eq!(err, GpioError::DutyCycleOutOfRange);
    assert!(err.to_string().contains("duty cycle out of range"));

    // The engine owns the line while armed.
    assert_eq!(
        c.write(18, Level::High, CALLER),
        Err(GpioError::BusyPwm)
    );

    c.stop_pwm(18, CALLER).unwrap();
    assert_eq!(rig.mock.read(18).unwrap(), Level::Low);
    c.write(18, Level::High, CALLER).unwrap();
}

#[test]
fn pwm_needs_a_configured_capable_output() {
    let rig = rig();
    let c = &rig.controller;

    assert_eq!(
        c.set_pwm(18, 1000, 50, CALLER),
        Err(GpioError::NotConfigured)
    );

    c.configure(PinConfig::input(18, Pull::None), CALLER).unwrap();
    assert_eq!(c.set_pwm(18, 1000, 50, CALLER), Err(GpioError::NotOutput));

    // Pin 20 is an output but not in the PWM-capable subset.
    c.configure(PinConfig::output(20), CALLER).unwrap();
    assert_eq!(
        c.set_pwm(20, 1000, 50, CALLER),
        Err(GpioError::NotPwmCapable)
    );
}

#[test]
fn reconfiguration_retires_the_engine() {
    let rig = rig();
    let c = &rig.controller;

    c.configure(PinConfig::output(18), CALLER).unwrap();
    c.set_pwm(18, 1000, 100, CALLER).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(rig.mock.read(18).unwrap(), Level::High);

    // A plain reconfiguration takes the engine down with the old life.
    c.configure(PinConfig::output(18), CALLER).unwrap();
    c.write(18, Level::High, CALLER).unwrap();

    // Same when the pin flips to an input: the engine must not keep
    // driving the line the new configuration biased.
    c.configure(PinConfig::output(18), CALLER).unwrap();
    c.set_pwm(18, 1000, 100, CALLER).unwrap();
    c.configure(PinConfig::input(18, Pull::None), CALLER).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(rig.mock.read(18).unwrap(), Level::Low);
}

#[test]
fn read_refreshes_the_timestamp_only() {
    let rig = rig();
    let c = &rig.controller;

    c.configure(PinConfig::input(4, Pull::None), CALLER).unwrap();
    let before = c.get_state(4).unwrap();

    // External signal arrives behind the registry's back.
    rig.mock.write(4, Level::High).unwrap();
    std::thread::sleep(Duration::from_millis(2));

    assert_eq!(c.read(4, CALLER).unwrap(), Level::High);
    let after = c.get_state(4).unwrap();
    assert_eq!(after.level, before.level);
    assert!(after.last_update > before.last_update);
}

#[test]
fn out_of_range_rejection_rides_the_policy_pipeline() {
    // The range check is the policy's last step: an operation the
    // allow-list forbids reports that first, even on a nonexistent line.
    let restricted = rig_with(PolicyConfig {
        allowed_operations: ["configure".to_string()].into_iter().collect(),
        ..PolicyConfig::default()
    });
    assert_eq!(
        restricted.controller.write(200, Level::High, CALLER),
        Err(GpioError::OperationNotAllowed)
    );
    assert_eq!(
        restricted.controller.read(200, CALLER),
        Err(GpioError::OperationNotAllowed)
    );

    // With nothing else in the way, the range denial surfaces and is
    // audited like any other policy outcome.
    let rig = rig();
    assert_eq!(
        rig.controller.write(200, Level::High, CALLER),
        Err(GpioError::PinOutOfRange)
    );
    let denied = rig
        .controller
        .audit_log()
        .counts()
        .get("policy_denied")
        .copied()
        .unwrap_or(0);
    assert!(denied >= 1);

    // Configure keeps its pre-admission bounds check.
    assert_eq!(
        rig.controller.configure(PinConfig::output(200), CALLER),
        Err(GpioError::PinOutOfRange)
    );
}

#[test]
fn configure_with_pwm_fields_starts_the_engine() {
    let rig = rig();
    let c = &rig.controller;

    let mut config = PinConfig::output(13);
    config.pwm = Some(PwmConfig {
        frequency_hz: 1000,
        duty_cycle: 100,
    });
    c.configure(config, CALLER).unwrap();

    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(rig.mock.read(13).unwrap(), Level::High);
    assert_eq!(
        c.write(13, Level::Low, CALLER),
        Err(GpioError::BusyPwm)
    );
}

#[test]
fn interrupt_delivery_on_the_mock() {
    let rig = rig();
    let c = &rig.controller;

    c.configure(PinConfig::input(18, Pull::None), CALLER).unwrap();
    let (handler, rx) = channel_handler();
    c.enable_interrupt(18, EdgeKind::Both, handler, CALLER).unwrap();
    c.start_event_loop().unwrap();

    // External signal, injected backend-side.
    rig.mock.write(18, Level::High).unwrap();

    let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(event.pin, 18);
    assert_eq!(event.kind, EdgeKind::Both);
    assert_eq!(event.level, Level::High);
    let now = drv_gpio_server_core::now_micros();
    assert!(now - event.timestamp < 2_000_000);

    assert_eq!(c.start_event_loop(), Err(GpioError::EventLoopRunning));
    c.stop_event_loop();
}

#[test]
fn interrupts_require_an_input() {
    let rig = rig();
    let c = &rig.controller;

    let (handler, _rx) = channel_handler();
    assert_eq!(
        c.enable_interrupt(18, EdgeKind::Rising, handler.clone(), CALLER),
        Err(GpioError::NotConfigured)
    );

    c.configure(PinConfig::output(18), CALLER).unwrap();
    assert_eq!(
        c.enable_interrupt(18, EdgeKind::Rising, handler, CALLER),
        Err(GpioError::NotInput)
    );
    assert_eq!(
        c.disable_interrupt(19, CALLER),
        Err(GpioError::NotConfigured)
    );
}

#[test]
fn capacity_is_bounded_and_drains() {
    let rig = rig_with(PolicyConfig {
        max_concurrent_ops: 2,
        operation_timeout: Duration::from_millis(200),
        ..PolicyConfig::default()
    });
    let c = &rig.controller;

    // Two operations in flight, held open.
    let g1 = c
        .policy()
        .admit(OpClass::Configure, Some(18), 40, CALLER, None)
        .unwrap();
    let g2 = c
        .policy()
        .admit(OpClass::Configure, Some(19), 40, CALLER, None)
        .unwrap();

    // The third caller bounces at the cap.
    assert_eq!(
        c.configure(PinConfig::output(20), CALLER),
        Err(GpioError::CapacityExhausted)
    );

    // The timeout drains abandoned slots; a retry then succeeds.
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(c.active_ops(), 0);
    c.configure(PinConfig::output(20), CALLER).unwrap();

    drop(g1);
    drop(g2);
    assert_eq!(c.active_ops(), 0);
}

#[test]
fn configure_round_trips_direction_and_pull() {
    let rig = rig();
    let c = &rig.controller;

    c.configure(PinConfig::input(4, Pull::Down), CALLER).unwrap();
    c.configure(PinConfig::output(18), CALLER).unwrap();

    let listed = c.list_configured_pins();
    let p4 = listed.iter().find(|s| s.pin == 4).unwrap();
    assert_eq!(p4.direction, Direction::Input);
    assert_eq!(p4.pull, Pull::Down);

    let p18 = listed.iter().find(|s| s.pin == 18).unwrap();
    assert_eq!(p18.direction, Direction::Output);
    assert_eq!(p18.pull, Pull::None);

    // Reconfiguration replaces the record.
    c.configure(PinConfig::input(18, Pull::Up), CALLER).unwrap();
    assert_eq!(c.get_state(18).unwrap().direction, Direction::Input);
}

#[test]
fn close_lands_outputs_low_and_is_idempotent() {
    let rig = rig();
    let c = &rig.controller;

    c.configure(PinConfig::output(18), CALLER).unwrap();
    c.configure(PinConfig::output(21), CALLER).unwrap();
    c.configure(PinConfig::input(4, Pull::Up), CALLER).unwrap();
    c.write(18, Level::High, CALLER).unwrap();
    c.write(21, Level::High, CALLER).unwrap();
    c.set_pwm(12, 1000, 100, CALLER).unwrap_err(); // not configured
    c.configure(PinConfig::output(12), CALLER).unwrap();
    c.set_pwm(12, 1000, 100, CALLER).unwrap();

    c.close();

    assert_eq!(rig.mock.read(18).unwrap(), Level::Low);
    assert_eq!(rig.mock.read(21).unwrap(), Level::Low);
    assert_eq!(rig.mock.read(12).unwrap(), Level::Low);
    assert!(c.list_configured_pins().is_empty());

    // Closed means closed; the backend refuses further work.
    assert_eq!(
        c.configure(PinConfig::output(18), CALLER),
        Err(GpioError::DeviceAccess)
    );

    // A second close changes nothing.
    c.close();

    let shutdown_steps = c
        .audit_log()
        .counts()
        .get("shutdown")
        .copied()
        .unwrap_or(0);
    assert!(shutdown_steps >= 3);
}

#[test]
fn toggle_flips_the_driven_level() {
    let rig = rig();
    let c = &rig.controller;

    c.configure(PinConfig::output(18), CALLER).unwrap();
    assert_eq!(c.toggle(18, CALLER).unwrap(), Level::High);
    assert_eq!(c.toggle(18, CALLER).unwrap(), Level::Low);
    assert_eq!(rig.mock.read(18).unwrap(), Level::Low);
}

#[test]
fn release_tears_one_pin_down() {
    let rig = rig();
    let c = &rig.controller;

    c.configure(PinConfig::output(18), CALLER).unwrap();
    c.write(18, Level::High, CALLER).unwrap();
    c.release(18, CALLER).unwrap();

    assert_eq!(rig.mock.read(18).unwrap(), Level::Low);
    assert_eq!(c.get_state(18), Err(GpioError::NotConfigured));
    assert_eq!(c.release(18, CALLER), Err(GpioError::NotConfigured));
}

#[test]
fn bus_operations_check_bounds_before_admission() {
    let rig = rig();
    let c = &rig.controller;

    assert_eq!(
        c.spi_transfer(2, &[0x00], CALLER),
        Err(GpioError::InvalidChannel)
    );
    assert_eq!(
        c.spi_transfer(0, &[], CALLER),
        Err(GpioError::SizeExceeded)
    );
    assert_eq!(
        c.spi_transfer(0, &vec![0u8; 4097], CALLER),
        Err(GpioError::SizeExceeded)
    );

    let echoed = c.spi_transfer(0, &[0xa5, 0x5a], CALLER).unwrap();
    assert_eq!(echoed, vec![0xa5, 0x5a]);

    assert_eq!(
        c.i2c_read(0, 0x07, 4, CALLER),
        Err(GpioError::InvalidAddress)
    );
    assert_eq!(c.i2c_read(3, 0x48, 4, CALLER), Err(GpioError::InvalidBus));
    assert_eq!(
        c.i2c_read(0, 0x48, 257, CALLER),
        Err(GpioError::SizeExceeded)
    );

    c.i2c_write_register(1, 0x48, 0x10, &[0xbe, 0xef], CALLER).unwrap();
    let back = c.i2c_read_register(1, 0x48, 0x10, 2, CALLER).unwrap();
    assert_eq!(back, vec![0xbe, 0xef]);

    // Bounds failures never took a slot.
    assert_eq!(c.active_ops(), 0);
}

#[test]
fn analog_sampling_on_the_mock() {
    let rig = rig();
    let c = &rig.controller;

    let sample = c.read_analog(0, CALLER).unwrap();
    assert_eq!(sample, 512);
    assert_eq!(
        c.read_analog(8, CALLER),
        Err(GpioError::InvalidAnalogChannel)
    );
}

#[test]
fn audit_can_be_disabled() {
    let mock = Arc::new(MockBackend::new());
    let backend = Backend::Mock(Arc::clone(&mock));
    let audit = Arc::new(AuditLog::new(32));
    let c = Controller::new(
        backend,
        PolicyConfig::default(),
        Arc::clone(&audit),
        false,
    );

    c.configure(PinConfig::output(18), CALLER).unwrap();
    let _ = c.configure(PinConfig::output(0), CALLER);

    // No admission or denial records; only shutdown uses the ring.
    assert_eq!(audit.counts().get("admitted"), None);
    assert_eq!(audit.counts().get("policy_denied"), None);
}

#[test]
fn admitted_operations_are_recorded() {
    let rig = rig();
    let c = &rig.controller;

    c.configure(PinConfig::output(18), CALLER).unwrap();
    c.write(18, Level::High, CALLER).unwrap();

    let snapshot = c.audit_log().snapshot();
    let admitted: Vec<_> = snapshot
        .iter()
        .filter(|e| e.record.kind == AuditKind::Admitted)
        .collect();
    assert_eq!(admitted.len(), 2);
    assert!(admitted.iter().all(|e| e.record.caller == CALLER));
    assert_eq!(admitted[1].record.pin, Some(18));
}
