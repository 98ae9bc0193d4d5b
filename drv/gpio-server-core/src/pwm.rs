// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Software PWM engines.
//!
//! Each armed pin gets one drive loop on its own thread: high for
//! `period * duty / 100`, low for the rest, against a monotonic clock. The
//! degenerate duties hold the line instead of cycling, parked on a condvar
//! so nothing spins. Updates replace both parameters; the cycle in flight
//! may finish with the old values and the next one picks up the new.
//!
//! This is software timing on a preemptive kernel. Jitter under load is
//! expected and accepted; the engine promises monotonic progress, not
//! period accuracy.
//!
//! An engine owns its pin while armed. The controller rejects plain writes
//! to a pin with a live engine, and stopping the engine leaves the pin Low.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

use drv_gpio_api::{GpioError, Level};

use crate::Backend;

#[derive(Copy, Clone)]
struct PwmParams {
    frequency_hz: u32,
    duty_cycle: u8,
    stop: bool,
    // Bumped on every set() so the drive loop can tell an update happened
    // while it slept.
    generation: u64,
}

struct PwmShared {
    params: Mutex<PwmParams>,
    changed: Condvar,
}

struct Engine {
    shared: Arc<PwmShared>,
    join: std::thread::JoinHandle<()>,
}

pub struct PwmBank {
    engines: Mutex<HashMap<u8, Engine>>,
}

impl PwmBank {
    pub fn new() -> Self {
        Self {
            engines: Mutex::new(HashMap::new()),
        }
    }

    pub fn active(&self, pin: u8) -> bool {
        self.engines.lock().unwrap().contains_key(&pin)
    }

    pub fn active_pins(&self) -> Vec<u8> {
        self.engines.lock().unwrap().keys().copied().collect()
    }

    /// Starts an engine for `pin`, or atomically updates the running one.
    pub fn set(
        &self,
        backend: &Backend,
        pin: u8,
        frequency_hz: u32,
        duty_cycle: u8,
    ) -> Result<(), GpioError> {
        let mut engines = self.engines.lock().unwrap();
        if let Some(engine) = engines.get(&pin) {
            let mut params = engine.shared.params.lock().unwrap();
            params.frequency_hz = frequency_hz;
            params.duty_cycle = duty_cycle;
            params.generation += 1;
            engine.shared.changed.notify_all();
            return Ok(());
        }

        let shared = Arc::new(PwmShared {
            params: Mutex::new(PwmParams {
                frequency_hz,
                duty_cycle,
                stop: false,
                generation: 0,
            }),
            changed: Condvar::new(),
        });

        let drive_shared = Arc::clone(&shared);
        let drive_backend = backend.clone();
        let join = std::thread::Builder::new()
            .name(format!("pwm-{pin}"))
            .spawn(move || drive(&drive_backend, pin, &drive_shared))
            .map_err(|_| GpioError::HardwareFault)?;

        engines.insert(pin, Engine { shared, join });
        Ok(())
    }

    /// Stops the engine on `pin` and joins its thread. Returns whether an
    /// engine was running. The drive loop leaves the pin Low on exit.
    pub fn stop(&self, pin: u8) -> bool {
        let engine = self.engines.lock().unwrap().remove(&pin);
        match engine {
            Some(engine) => {
                {
                    let mut params = engine.shared.params.lock().unwrap();
                    params.stop = true;
                    params.generation += 1;
                    engine.shared.changed.notify_all();
                }
                let _ = engine.join.join();
                true
            }
            None => false,
        }
    }

    /// Stops every engine; the shutdown path. Returns the pins that had
    /// one.
    pub fn stop_all(&self) -> Vec<u8> {
        let pins = self.active_pins();
        for pin in &pins {
            self.stop(*pin);
        }
        pins
    }
}

impl Default for PwmBank {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeps on the engine's condvar for `span`, returning early if the
/// parameters changed underneath us.
fn interruptible_sleep(shared: &PwmShared, span: Duration, generation: u64) {
    let mut params = shared.params.lock().unwrap();
    let deadline = std::time::Instant::now() + span;
    while params.generation == generation && !params.stop {
        let now = std::time::Instant::now();
        if now >= deadline {
            return;
        }
        params = shared
            .changed
            .wait_timeout(params, deadline - now)
            .unwrap()
            .0;
    }
}

fn drive(backend: &Backend, pin: u8, shared: &PwmShared) {
    loop {
        let snapshot = *shared.params.lock().unwrap();
        if snapshot.stop {
            break;
        }

        // Degenerate duties hold the line; wait for a parameter change
        // rather than cycling.
        if snapshot.duty_cycle == 0 || snapshot.duty_cycle >= 100 {
            let level = if snapshot.duty_cycle == 0 {
                Level::Low
            } else {
                Level::High
            };
            if backend.pins().write(pin, level).is_err() {
                break;
            }
            let mut params = shared.params.lock().unwrap();
            while params.generation == snapshot.generation && !params.stop {
                params = shared.changed.wait(params).unwrap();
            }
            continue;
        }

        let period = Duration::from_secs(1) / snapshot.frequency_hz;
        let on = period * u32::from(snapshot.duty_cycle) / 100;
        let off = period - on;

        // Per-cycle write failures terminate the engine; the handle is
        // gone or the pin was torn down underneath us.
        if backend.pins().write(pin, Level::High).is_err() {
            break;
        }
        interruptible_sleep(shared, on, snapshot.generation);
        if backend.pins().write(pin, Level::Low).is_err() {
            break;
        }
        interruptible_sleep(shared, off, snapshot.generation);
    }

    // Stopped engines leave the line Low.
    let _ = backend.pins().write(pin, Level::Low);
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_gpio_api::{Direction, PinBackend, Pull};
    use drv_gpio_mock::MockBackend;

    fn mock_backend() -> (Arc<MockBackend>, Backend) {
        let mock = Arc::new(MockBackend::new());
        let backend = Backend::Mock(Arc::clone(&mock));
        (mock, backend)
    }

    #[test]
    fn duty_zero_holds_low_and_full_holds_high() {
        let (mock, backend) = mock_backend();
        mock.configure(18, Direction::Output, Pull::None).unwrap();

        let bank = PwmBank::new();
        bank.set(&backend, 18, 1000, 0).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(mock.read(18).unwrap(), Level::Low);

        bank.set(&backend, 18, 1000, 100).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(mock.read(18).unwrap(), Level::High);

        assert!(bank.stop(18));
        assert_eq!(mock.read(18).unwrap(), Level::Low);
    }

    #[test]
    fn cycling_engine_toggles_the_line() {
        let (mock, backend) = mock_backend();
        mock.configure(18, Direction::Output, Pull::None).unwrap();

        let bank = PwmBank::new();
        bank.set(&backend, 18, 200, 50).unwrap();

        // At 200 Hz both phases are 2.5 ms; sampling over 50 ms must
        // observe both levels.
        let mut seen_high = false;
        let mut seen_low = false;
        for _ in 0..100 {
            match mock.read(18).unwrap() {
                Level::High => seen_high = true,
                Level::Low => seen_low = true,
            }
            std::thread::sleep(Duration::from_micros(500));
        }
        assert!(seen_high && seen_low);

        bank.stop(18);
        assert_eq!(mock.read(18).unwrap(), Level::Low);
        assert!(!bank.active(18));
    }

    #[test]
    fn update_wakes_a_held_engine() {
        let (mock, backend) = mock_backend();
        mock.configure(18, Direction::Output, Pull::None).unwrap();

        let bank = PwmBank::new();
        bank.set(&backend, 18, 1000, 0).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(mock.read(18).unwrap(), Level::Low);

        // The engine is parked on the condvar; the update must wake it.
        bank.set(&backend, 18, 1000, 100).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(mock.read(18).unwrap(), Level::High);

        bank.stop_all();
        assert!(bank.active_pins().is_empty());
    }

    #[test]
    fn stop_is_idempotent() {
        let (_, backend) = mock_backend();
        let bank = PwmBank::new();
        bank.set(&backend, 18, 100, 50).unwrap();
        assert!(bank.stop(18));
        assert!(!bank.stop(18));
    }
}
