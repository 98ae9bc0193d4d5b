// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The controller façade.
//!
//! Every operation follows the same spine: operation-specific parameter
//! bounds first (these fail without touching the admission counter), then
//! policy admission, then the registry consultation, then the backend
//! call, then the registry update. Pin range is not a parameter bound
//! here: except for `configure`, it is checked by the policy's own
//! pipeline, after the operation and pin lists, so an out-of-range request
//! is admitted, audited, and rejected like any other denial. A backend
//! error leaves the registry untouched and surfaces unmodified; the façade
//! never retries.
//!
//! Per-pin operations are serialized by a per-pin mutex taken for the span
//! of the consult/backend/update sequence, so concurrent callers observe
//! each pin's operations in a single order. The registry lock itself is
//! held only for individual reads and updates, and never across a backend
//! call.

use std::sync::{Arc, Mutex};

use drv_gpio_api::{
    Direction, EdgeKind, GpioError, Level, PinConfig, PinState,
    ANALOG_CHANNEL_MAX, I2C_ADDR_MAX, I2C_ADDR_MIN, I2C_TRANSFER_MAX,
    PWM_DUTY_MAX, PWM_FREQ_MAX_HZ, PWM_FREQ_MIN_HZ, SPI_TRANSFER_MAX,
};

use crate::audit::{now_micros, AuditKind, AuditLog, AuditRecord};
use crate::interrupt::{EdgeDispatcher, Handler};
use crate::policy::{OpClass, PolicyConfig, SafetyPolicy};
use crate::pwm::PwmBank;
use crate::registry::{initial_state, Registry};
use crate::Backend;

pub struct Controller {
    backend: Backend,
    policy: SafetyPolicy,
    registry: Registry,
    pwm: PwmBank,
    dispatcher: EdgeDispatcher,
    audit: Arc<AuditLog>,
    // One lock per pin line; see the module doc.
    pin_locks: Vec<Mutex<()>>,
    closed: Mutex<bool>,
}

impl Controller {
    pub fn new(
        backend: Backend,
        policy_config: PolicyConfig,
        audit: Arc<AuditLog>,
        audit_enabled: bool,
    ) -> Self {
        let max_pin = backend.pins().max_pin();
        let policy_audit = audit_enabled.then(|| Arc::clone(&audit));
        Self {
            policy: SafetyPolicy::new(policy_config, policy_audit.clone()),
            registry: Registry::new(max_pin),
            pwm: PwmBank::new(),
            dispatcher: EdgeDispatcher::new(policy_audit),
            audit,
            pin_locks: (0..=max_pin as usize).map(|_| Mutex::new(())).collect(),
            closed: Mutex::new(false),
            backend,
        }
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// In-flight operations currently admitted by the policy.
    pub fn active_ops(&self) -> u32 {
        self.policy.active_ops()
    }

    /// The policy gate, for telemetry and capacity probes.
    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    fn max_pin(&self) -> u8 {
        self.backend.pins().max_pin()
    }

    fn check_pin_bounds(&self, pin: u8) -> Result<(), GpioError> {
        if pin > self.max_pin() {
            return Err(GpioError::PinOutOfRange);
        }
        Ok(())
    }

    fn lock_pin(&self, pin: u8) -> std::sync::MutexGuard<'_, ()> {
        self.pin_locks[pin as usize].lock().unwrap()
    }

    fn admit(
        &self,
        op: OpClass,
        pin: Option<u8>,
        caller: &str,
    ) -> Result<crate::policy::OpGuard, GpioError> {
        self.policy.admit(op, pin, self.max_pin(), caller, None)
    }

    /// Configures a pin, replacing any previous configuration. When the
    /// configuration carries PWM parameters and the pin is an output, the
    /// PWM engine starts alongside.
    pub fn configure(
        &self,
        config: PinConfig,
        caller: &str,
    ) -> Result<(), GpioError> {
        self.check_pin_bounds(config.pin)?;
        if let Some(pwm) = &config.pwm {
            check_pwm_bounds(pwm.frequency_hz, pwm.duty_cycle)?;
            if config.direction != Direction::Output {
                return Err(GpioError::NotOutput);
            }
            if !self.backend.pins().pwm_capable(config.pin) {
                return Err(GpioError::NotPwmCapable);
            }
        }

        let _op = self.admit(OpClass::Configure, Some(config.pin), caller)?;
        let _pin = self.lock_pin(config.pin);

        // A reconfiguration without PWM fields retires any engine left
        // over from the pin's previous life; otherwise the old engine
        // would keep driving the line under the new configuration.
        if config.pwm.is_none() {
            self.pwm.stop(config.pin);
        }

        self.backend
            .pins()
            .configure(config.pin, config.direction, config.pull)?;
        self.registry.insert(initial_state(
            config.pin,
            config.direction,
            config.pull,
        ));

        if let Some(pwm) = &config.pwm {
            self.pwm.set(
                &self.backend,
                config.pin,
                pwm.frequency_hz,
                pwm.duty_cycle,
            )?;
        }
        Ok(())
    }

    /// Samples an input pin. Observation only: the registry record keeps
    /// its last driven value and just gets a fresh timestamp.
    pub fn read(&self, pin: u8, caller: &str) -> Result<Level, GpioError> {
        let _op = self.admit(OpClass::Read, Some(pin), caller)?;
        let _pin = self.lock_pin(pin);

        let state = self.registry.require(pin)?;
        if state.direction != Direction::Input {
            return Err(GpioError::NotInput);
        }

        let level = self.backend.pins().read(pin)?;
        self.registry.touch(pin)?;
        Ok(level)
    }

    /// Drives an output pin.
    pub fn write(
        &self,
        pin: u8,
        level: Level,
        caller: &str,
    ) -> Result<(), GpioError> {
        let _op = self.admit(OpClass::Write, Some(pin), caller)?;
        let _pin = self.lock_pin(pin);

        let state = self.registry.require(pin)?;
        if state.direction != Direction::Output {
            return Err(GpioError::NotOutput);
        }
        // The engine owns the line while armed.
        if self.pwm.active(pin) {
            return Err(GpioError::BusyPwm);
        }

        self.backend.pins().write(pin, level)?;
        self.registry.update(pin, |s| s.level = level)?;
        Ok(())
    }

    /// Flips an output pin, returning the level it now drives.
    pub fn toggle(&self, pin: u8, caller: &str) -> Result<Level, GpioError> {
        let _op = self.admit(OpClass::Toggle, Some(pin), caller)?;
        let _pin = self.lock_pin(pin);

        let state = self.registry.require(pin)?;
        if state.direction != Direction::Output {
            return Err(GpioError::NotOutput);
        }
        if self.pwm.active(pin) {
            return Err(GpioError::BusyPwm);
        }

        let level = !state.level;
        self.backend.pins().write(pin, level)?;
        self.registry.update(pin, |s| s.level = level)?;
        Ok(level)
    }

    /// Starts or retunes the software PWM engine on a capable output.
    pub fn set_pwm(
        &self,
        pin: u8,
        frequency_hz: u32,
        duty_cycle: u8,
        caller: &str,
    ) -> Result<(), GpioError> {
        check_pwm_bounds(frequency_hz, duty_cycle)?;
        let _op = self.admit(OpClass::Pwm, Some(pin), caller)?;
        let _pin = self.lock_pin(pin);

        let state = self.registry.require(pin)?;
        if state.direction != Direction::Output {
            return Err(GpioError::NotOutput);
        }
        if !self.backend.pins().pwm_capable(pin) {
            return Err(GpioError::NotPwmCapable);
        }

        self.pwm.set(&self.backend, pin, frequency_hz, duty_cycle)?;
        self.registry.touch(pin)?;
        Ok(())
    }

    /// Stops the PWM engine on `pin`, leaving the line Low. Quietly does
    /// nothing if no engine is running.
    pub fn stop_pwm(&self, pin: u8, caller: &str) -> Result<(), GpioError> {
        let _op = self.admit(OpClass::Pwm, Some(pin), caller)?;
        let _pin = self.lock_pin(pin);

        if self.pwm.stop(pin) {
            self.registry.update(pin, |s| s.level = Level::Low)?;
        }
        Ok(())
    }

    /// Arms edge interrupts on an input pin. Handlers run on dispatcher
    /// threads with no controller lock held and may observe state that has
    /// moved since the edge fired.
    pub fn enable_interrupt(
        &self,
        pin: u8,
        kind: EdgeKind,
        handler: Handler,
        caller: &str,
    ) -> Result<(), GpioError> {
        let _op = self.admit(OpClass::Interrupt, Some(pin), caller)?;
        {
            let _pin = self.lock_pin(pin);
            let state = self.registry.require(pin)?;
            if state.direction != Direction::Input {
                return Err(GpioError::NotInput);
            }
        }

        // Arming joins any replaced waiter; the pin lock stays out of it
        // so an in-flight handler can call back into the controller.
        self.dispatcher.arm(&self.backend, pin, kind, handler)
    }

    pub fn disable_interrupt(
        &self,
        pin: u8,
        caller: &str,
    ) -> Result<(), GpioError> {
        let _op = self.admit(OpClass::Interrupt, Some(pin), caller)?;
        {
            let _pin = self.lock_pin(pin);
            self.registry.require(pin)?;
        }

        self.dispatcher.disarm(&self.backend, pin)?;
        Ok(())
    }

    pub fn start_event_loop(&self) -> Result<(), GpioError> {
        self.dispatcher.start_event_loop(&self.backend)
    }

    pub fn stop_event_loop(&self) {
        self.dispatcher.stop_event_loop();
    }

    /// Registry snapshot for one pin.
    pub fn get_state(&self, pin: u8) -> Result<PinState, GpioError> {
        self.check_pin_bounds(pin)?;
        self.registry.require(pin)
    }

    /// Registry snapshot of every configured pin.
    pub fn list_configured_pins(&self) -> Vec<PinState> {
        self.registry.list()
    }

    /// Deconfigures one pin: stops its engine, disarms its interrupt,
    /// drives an output Low, and drops the registry record.
    pub fn release(&self, pin: u8, caller: &str) -> Result<(), GpioError> {
        let _op = self.admit(OpClass::Release, Some(pin), caller)?;
        let state = {
            let _pin = self.lock_pin(pin);
            self.registry.require(pin)?
        };

        // Engine and waiter joins run without the pin lock; see
        // `enable_interrupt`.
        self.pwm.stop(pin);
        let _ = self.dispatcher.disarm(&self.backend, pin);

        let _pin = self.lock_pin(pin);
        if state.direction == Direction::Output {
            self.backend.pins().write(pin, Level::Low)?;
        }
        self.registry.remove(pin);
        Ok(())
    }

    /// Samples an analog channel, on backends with a converter.
    pub fn read_analog(
        &self,
        channel: u8,
        caller: &str,
    ) -> Result<u16, GpioError> {
        if channel > ANALOG_CHANNEL_MAX {
            return Err(GpioError::InvalidAnalogChannel);
        }
        let _op = self.admit(OpClass::Analog, None, caller)?;
        self.backend.pins().read_analog(channel)
    }

    /// Full-duplex SPI transfer on channel 0 or 1.
    pub fn spi_transfer(
        &self,
        channel: u8,
        tx: &[u8],
        caller: &str,
    ) -> Result<Vec<u8>, GpioError> {
        check_spi_bounds(channel, tx.len())?;
        let _op = self.admit(OpClass::Spi, None, caller)?;

        let mut rx = vec![0u8; tx.len()];
        self.backend.pins().spi_transfer(channel, tx, &mut rx)?;
        Ok(rx)
    }

    pub fn spi_write(
        &self,
        channel: u8,
        tx: &[u8],
        caller: &str,
    ) -> Result<(), GpioError> {
        self.spi_transfer(channel, tx, caller).map(|_| ())
    }

    pub fn spi_read(
        &self,
        channel: u8,
        len: usize,
        caller: &str,
    ) -> Result<Vec<u8>, GpioError> {
        // Clocking out idle bytes is how a read looks on this bus.
        self.spi_transfer(channel, &vec![0u8; len], caller)
    }

    pub fn i2c_write(
        &self,
        bus: u8,
        address: u8,
        data: &[u8],
        caller: &str,
    ) -> Result<(), GpioError> {
        check_i2c_bounds(bus, address, data.len())?;
        let _op = self.admit(OpClass::I2c, None, caller)?;
        self.backend.pins().i2c_write(bus, address, data)
    }

    pub fn i2c_read(
        &self,
        bus: u8,
        address: u8,
        len: usize,
        caller: &str,
    ) -> Result<Vec<u8>, GpioError> {
        check_i2c_bounds(bus, address, len)?;
        let _op = self.admit(OpClass::I2c, None, caller)?;

        let mut dest = vec![0u8; len];
        self.backend.pins().i2c_read(bus, address, &mut dest)?;
        Ok(dest)
    }

    /// Register write: the register index goes first on the wire, then the
    /// payload.
    pub fn i2c_write_register(
        &self,
        bus: u8,
        address: u8,
        register: u8,
        data: &[u8],
        caller: &str,
    ) -> Result<(), GpioError> {
        check_i2c_bounds(bus, address, data.len().max(1))?;
        let _op = self.admit(OpClass::I2c, None, caller)?;

        let mut framed = Vec::with_capacity(data.len() + 1);
        framed.push(register);
        framed.extend_from_slice(data);
        self.backend.pins().i2c_write(bus, address, &framed)
    }

    /// Register read: select the register with a one-byte write, then read.
    pub fn i2c_read_register(
        &self,
        bus: u8,
        address: u8,
        register: u8,
        len: usize,
        caller: &str,
    ) -> Result<Vec<u8>, GpioError> {
        check_i2c_bounds(bus, address, len)?;
        let _op = self.admit(OpClass::I2c, None, caller)?;

        self.backend.pins().i2c_write(bus, address, &[register])?;
        let mut dest = vec![0u8; len];
        self.backend.pins().i2c_read(bus, address, &mut dest)?;
        Ok(dest)
    }

    /// Shuts the controller down: event loop stopped, engines joined,
    /// outputs driven Low, backend closed, registry cleared. Idempotent;
    /// per-pin failures on the way down are logged and do not stop the
    /// sequence.
    pub fn close(&self) {
        let mut closed = self.closed.lock().unwrap();
        if *closed {
            return;
        }
        *closed = true;

        self.dispatcher.stop_event_loop();
        self.shutdown_step("event loop stopped", None);

        for pin in self.pwm.stop_all() {
            self.shutdown_step("pwm engine stopped", Some(pin));
        }

        for pin in self.registry.outputs() {
            match self.backend.pins().write(pin, Level::Low) {
                Ok(()) => self.shutdown_step("output driven low", Some(pin)),
                Err(_) => self.audit.push(AuditRecord {
                    kind: AuditKind::HardwareFault,
                    message: "failed to drive output low at shutdown",
                    caller: String::new(),
                    pin: Some(pin),
                    timestamp: now_micros(),
                    request_id: None,
                }),
            }
        }

        if self.backend.pins().close().is_err() {
            self.audit.push(AuditRecord {
                kind: AuditKind::HardwareFault,
                message: "backend close failed",
                caller: String::new(),
                pin: None,
                timestamp: now_micros(),
                request_id: None,
            });
        }
        self.registry.clear();
        self.shutdown_step("registry cleared", None);
    }

    fn shutdown_step(&self, message: &'static str, pin: Option<u8>) {
        self.audit.push(AuditRecord {
            kind: AuditKind::Shutdown,
            message,
            caller: String::new(),
            pin,
            timestamp: now_micros(),
            request_id: None,
        });
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.close();
    }
}

fn check_pwm_bounds(frequency_hz: u32, duty_cycle: u8) -> Result<(), GpioError> {
    if !(PWM_FREQ_MIN_HZ..=PWM_FREQ_MAX_HZ).contains(&frequency_hz) {
        return Err(GpioError::FrequencyOutOfRange);
    }
    if duty_cycle > PWM_DUTY_MAX {
        return Err(GpioError::DutyCycleOutOfRange);
    }
    Ok(())
}

fn check_spi_bounds(channel: u8, len: usize) -> Result<(), GpioError> {
    if channel > 1 {
        return Err(GpioError::InvalidChannel);
    }
    if len == 0 || len > SPI_TRANSFER_MAX {
        return Err(GpioError::SizeExceeded);
    }
    Ok(())
}

fn check_i2c_bounds(bus: u8, address: u8, len: usize) -> Result<(), GpioError> {
    if bus > 1 {
        return Err(GpioError::InvalidBus);
    }
    if !(I2C_ADDR_MIN..=I2C_ADDR_MAX).contains(&address) {
        return Err(GpioError::InvalidAddress);
    }
    if len == 0 || len > I2C_TRANSFER_MAX {
        return Err(GpioError::SizeExceeded);
    }
    Ok(())
}
