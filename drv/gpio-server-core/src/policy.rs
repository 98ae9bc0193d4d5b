// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The safety policy: the gate every pin operation passes through.
//!
//! Admission runs a fixed pipeline. First a concurrency slot is taken (or
//! the operation bounces with a capacity error), then the operation
//! allow-list, the critical-pin protection, the restricted list, the allow
//! list, and the line range are checked in that order. Critical-pin
//! protection runs before the general lists so a misconfigured allow list
//! cannot expose a bus pin.
//!
//! The concurrency slot is released when the returned [`OpGuard`] drops or
//! when the operation timeout elapses, whichever happens first, exactly
//! once. The timeout countdown runs on the policy's [`Multitimer`], never
//! on the admitting caller.
//!
//! Every outcome emits one audit record when auditing is on.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use drv_gpio_api::{GpioError, PinSet, SecurityLevel, CRITICAL_PINS};
use multitimer::Multitimer;

use crate::audit::{now_micros, AuditKind, AuditLog, AuditRecord};

/// Lines with no boot, console, or bus role on the target; the set the
/// paranoid level narrows to.
const GENERAL_PURPOSE_PINS: PinSet = PinSet::of(&[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 16, 17, 18, 19, 20, 21, 22, 23,
    24, 25, 26, 27,
]);

/// The operation classes the policy distinguishes. The allow-list in the
/// configuration names these by their string form.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpClass {
    Configure,
    Read,
    Write,
    Toggle,
    Pwm,
    Interrupt,
    Release,
    Spi,
    I2c,
    Analog,
}

impl OpClass {
    pub fn as_str(self) -> &'static str {
        match self {
            OpClass::Configure => "configure",
            OpClass::Read => "read",
            OpClass::Write => "write",
            OpClass::Toggle => "toggle",
            OpClass::Pwm => "pwm",
            OpClass::Interrupt => "interrupt",
            OpClass::Release => "release",
            OpClass::Spi => "spi",
            OpClass::I2c => "i2c",
            OpClass::Analog => "analog",
        }
    }
}

#[derive(Clone, Debug)]
pub struct PolicyConfig {
    pub security_level: SecurityLevel,
    pub allow_critical_pins: bool,
    pub max_concurrent_ops: u32,
    pub operation_timeout: Duration,
    /// Empty means every operation class is allowed.
    pub allowed_operations: BTreeSet<String>,
    pub restricted_pins: PinSet,
    /// Empty means no allow-list restriction.
    pub allowed_pins: PinSet,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::Strict,
            allow_critical_pins: false,
            max_concurrent_ops: 16,
            operation_timeout: Duration::from_secs(1),
            allowed_operations: BTreeSet::new(),
            restricted_pins: PinSet::EMPTY,
            allowed_pins: PinSet::EMPTY,
        }
    }
}

impl PolicyConfig {
    /// Applies the security level's construction-time adjustment of the
    /// allowed-pin set. The level has no other runtime effect.
    pub fn normalized(mut self) -> Self {
        match self.security_level {
            SecurityLevel::Permissive => {
                self.allowed_pins = PinSet::EMPTY;
            }
            SecurityLevel::Strict => {}
            SecurityLevel::Paranoid => {
                self.allow_critical_pins = false;
                self.allowed_pins = if self.allowed_pins.is_empty() {
                    GENERAL_PURPOSE_PINS
                } else {
                    self.allowed_pins.intersection(GENERAL_PURPOSE_PINS)
                };
            }
        }
        self
    }
}

/// Holds one admitted operation's concurrency slot. Dropping it releases
/// the slot if the timeout has not already done so.
pub struct OpGuard {
    token: Arc<AtomicBool>,
    active: Arc<AtomicU32>,
}

fn release_slot(token: &AtomicBool, active: &AtomicU32) {
    // Whoever swaps first does the decrement; the other side is a no-op.
    if !token.swap(true, Ordering::AcqRel) {
        active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        release_slot(&self.token, &self.active);
    }
}

pub struct SafetyPolicy {
    config: PolicyConfig,
    active: Arc<AtomicU32>,
    timeouts: Multitimer,
    audit: Option<Arc<AuditLog>>,
}

impl SafetyPolicy {
    pub fn new(config: PolicyConfig, audit: Option<Arc<AuditLog>>) -> Self {
        Self {
            config: config.normalized(),
            active: Arc::new(AtomicU32::new(0)),
            timeouts: Multitimer::new(),
            audit,
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        self.config.operation_timeout
    }

    /// Operations currently holding a slot; test and telemetry surface.
    pub fn active_ops(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    /// Runs the admission pipeline for `(op, pin, caller)`. `pin` is
    /// `None` for bus operations, which have no line to check.
    pub fn admit(
        &self,
        op: OpClass,
        pin: Option<u8>,
        max_pin: u8,
        caller: &str,
        request_id: Option<u32>,
    ) -> Result<OpGuard, GpioError> {
        // Concurrency admission. Taking the slot first means a burst of
        // doomed requests still counts against the cap, which is the
        // conservative direction.
        let admitted = self.active.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| {
                if n < self.config.max_concurrent_ops {
                    Some(n + 1)
                } else {
                    None
                }
            },
        );
        if admitted.is_err() {
            self.emit(
                AuditKind::CapacityDenied,
                "concurrent operation limit reached",
                caller,
                pin,
                request_id,
            );
            return Err(GpioError::CapacityExhausted);
        }

        let token = Arc::new(AtomicBool::new(false));
        let guard = OpGuard {
            token: Arc::clone(&token),
            active: Arc::clone(&self.active),
        };

        // Backstop release. Fires even if the caller never completes; the
        // token keeps the pair of releases exactly-once.
        let timer_active = Arc::clone(&self.active);
        self.timeouts.set(
            Instant::now() + self.config.operation_timeout,
            Box::new(move || release_slot(&token, &timer_active)),
        );

        if let Err(e) = self.check(op, pin, max_pin) {
            let kind = match e {
                GpioError::OperationNotAllowed => AuditKind::OperationDenied,
                _ => AuditKind::PolicyDenied,
            };
            self.emit(kind, denial_message(e), caller, pin, request_id);
            // Dropping the guard here releases the slot immediately.
            drop(guard);
            return Err(e);
        }

        self.emit(
            AuditKind::Admitted,
            op.as_str(),
            caller,
            pin,
            request_id,
        );
        Ok(guard)
    }

    fn check(
        &self,
        op: OpClass,
        pin: Option<u8>,
        max_pin: u8,
    ) -> Result<(), GpioError> {
        if !self.config.allowed_operations.is_empty()
            && !self.config.allowed_operations.contains(op.as_str())
        {
            return Err(GpioError::OperationNotAllowed);
        }

        let Some(pin) = pin else {
            return Ok(());
        };

        if CRITICAL_PINS.contains(pin) && !self.config.allow_critical_pins {
            return Err(GpioError::CriticalPin);
        }
        if self.config.restricted_pins.contains(pin) {
            return Err(GpioError::RestrictedPin);
        }
        if !self.config.allowed_pins.is_empty()
            && !self.config.allowed_pins.contains(pin)
        {
            return Err(GpioError::PinNotAllowed);
        }
        if pin > max_pin {
            return Err(GpioError::PinOutOfRange);
        }
        Ok(())
    }

    fn emit(
        &self,
        kind: AuditKind,
        message: &'static str,
        caller: &str,
        pin: Option<u8>,
        request_id: Option<u32>,
    ) {
        if let Some(audit) = &self.audit {
            audit.push(AuditRecord {
                kind,
                message,
                caller: caller.to_string(),
                pin,
                timestamp: now_micros(),
                request_id,
            });
        }
    }
}

fn denial_message(e: GpioError) -> &'static str {
    match e {
        GpioError::CriticalPin => "operation denied: critical system pin",
        GpioError::RestrictedPin => "operation denied: restricted pin",
        GpioError::PinNotAllowed => "operation denied: pin not in allow list",
        GpioError::OperationNotAllowed => {
            "operation denied: operation not allowed"
        }
        GpioError::PinOutOfRange => "pin number out of range",
        _ => "operation denied",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(config: PolicyConfig) -> SafetyPolicy {
        SafetyPolicy::new(config, None)
    }

    #[test]
    fn critical_pins_denied_by_default() {
        let uut = policy(PolicyConfig::default());
        for pin in [0u8, 1, 14, 15] {
            assert_eq!(
                uut.admit(OpClass::Configure, Some(pin), 27, "t", None)
                    .err(),
                Some(GpioError::CriticalPin)
            );
        }
        // Denied operations hold no slot.
        assert_eq!(uut.active_ops(), 0);
    }

    #[test]
    fn critical_override_requires_the_flag() {
        let uut = policy(PolicyConfig {
            allow_critical_pins: true,
            ..PolicyConfig::default()
        });
        assert!(uut.admit(OpClass::Write, Some(14), 27, "t", None).is_ok());
    }

    #[test]
    fn critical_check_precedes_the_allow_list() {
        // Even an allow list naming a critical pin must not expose it.
        let uut = policy(PolicyConfig {
            allowed_pins: PinSet::of(&[14]),
            ..PolicyConfig::default()
        });
        assert_eq!(
            uut.admit(OpClass::Write, Some(14), 27, "t", None).err(),
            Some(GpioError::CriticalPin)
        );
    }

    #[test]
    fn restricted_and_allow_lists_apply_in_order() {
        let uut = policy(PolicyConfig {
            restricted_pins: PinSet::of(&[5]),
            allowed_pins: PinSet::of(&[5, 6]),
            ..PolicyConfig::default()
        });
        assert_eq!(
            uut.admit(OpClass::Read, Some(5), 27, "t", None).err(),
            Some(GpioError::RestrictedPin)
        );
        assert!(uut.admit(OpClass::Read, Some(6), 27, "t", None).is_ok());
        assert_eq!(
            uut.admit(OpClass::Read, Some(7), 27, "t", None).err(),
            Some(GpioError::PinNotAllowed)
        );
    }

    #[test]
    fn operation_allow_list() {
        let uut = policy(PolicyConfig {
            allowed_operations: ["read".to_string()].into_iter().collect(),
            ..PolicyConfig::default()
        });
        assert!(uut.admit(OpClass::Read, Some(6), 27, "t", None).is_ok());
        assert_eq!(
            uut.admit(OpClass::Write, Some(6), 27, "t", None).err(),
            Some(GpioError::OperationNotAllowed)
        );
    }

    #[test]
    fn range_is_checked_last() {
        let uut = policy(PolicyConfig::default());
        assert_eq!(
            uut.admit(OpClass::Read, Some(28), 27, "t", None).err(),
            Some(GpioError::PinOutOfRange)
        );
    }

    #[test]
    fn capacity_is_enforced_and_released_on_drop() {
        let uut = policy(PolicyConfig {
            max_concurrent_ops: 2,
            ..PolicyConfig::default()
        });
        let a = uut.admit(OpClass::Read, Some(6), 27, "t", None).unwrap();
        let _b = uut.admit(OpClass::Read, Some(7), 27, "t", None).unwrap();
        assert_eq!(
            uut.admit(OpClass::Read, Some(8), 27, "t", None).err(),
            Some(GpioError::CapacityExhausted)
        );

        drop(a);
        assert!(uut.admit(OpClass::Read, Some(8), 27, "t", None).is_ok());
    }

    #[test]
    fn timeout_releases_an_abandoned_slot_exactly_once() {
        let uut = policy(PolicyConfig {
            max_concurrent_ops: 1,
            operation_timeout: Duration::from_millis(30),
            ..PolicyConfig::default()
        });
        let guard = uut.admit(OpClass::Read, Some(6), 27, "t", None).unwrap();
        std::mem::forget(guard);
        assert_eq!(uut.active_ops(), 1);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(uut.active_ops(), 0);

        // The counter stays exact when completion and timeout both run.
        let guard = uut.admit(OpClass::Read, Some(6), 27, "t", None).unwrap();
        drop(guard);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(uut.active_ops(), 0);
    }

    #[test]
    fn paranoid_narrows_to_general_purpose_pins() {
        let uut = policy(
            PolicyConfig {
                security_level: SecurityLevel::Paranoid,
                allow_critical_pins: true,
                ..PolicyConfig::default()
            },
        );
        // The paranoid level drops the critical override at construction.
        assert_eq!(
            uut.admit(OpClass::Write, Some(14), 27, "t", None).err(),
            Some(GpioError::CriticalPin)
        );
        assert!(uut.admit(OpClass::Write, Some(18), 27, "t", None).is_ok());
    }

    #[test]
    fn permissive_clears_the_allow_list() {
        let uut = policy(PolicyConfig {
            security_level: SecurityLevel::Permissive,
            allowed_pins: PinSet::of(&[4]),
            ..PolicyConfig::default()
        });
        assert!(uut.admit(OpClass::Read, Some(9), 27, "t", None).is_ok());
    }

    #[test]
    fn bus_operations_skip_pin_checks() {
        let uut = policy(PolicyConfig {
            allowed_pins: PinSet::of(&[4]),
            ..PolicyConfig::default()
        });
        assert!(uut.admit(OpClass::Spi, None, 27, "t", None).is_ok());
        assert!(uut.admit(OpClass::I2c, None, 27, "t", None).is_ok());
    }
}
