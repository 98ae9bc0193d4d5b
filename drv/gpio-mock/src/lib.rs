// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory pin backend.
//!
//! Simulates the full capability set against a pin table held in memory, so
//! the safety layer and its callers can run on any development machine. The
//! simulation is deliberately permissive in one respect: [`MockBackend::write`]
//! works on input pins too, which is how test rigs inject the level an
//! "external" signal would drive. A write that crosses an armed edge queues
//! a synthesized event for the waiting dispatcher, exactly as the hardware
//! edge-detect unit would latch one.
//!
//! SPI channels are wired for loopback (the response mirrors the outgoing
//! bytes) and I2C devices are simulated as 256-byte register files with a
//! write-sets-the-cursor addressing model, which is enough to exercise the
//! transfer paths end to end.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use drv_gpio_api::{
    Direction, EdgeKind, GpioError, Level, PinBackend, Pull, MOCK_MAX_PIN,
};

const PIN_COUNT: usize = MOCK_MAX_PIN as usize + 1;

/// Output lines the software PWM engine may drive; mirrors the hardware
/// adapter's documented subset so tests cover the rejection path.
const PWM_PINS: [u8; 4] = [12, 13, 18, 19];

#[derive(Copy, Clone)]
struct MockPin {
    configured: bool,
    direction: Direction,
    pull: Pull,
    level: Level,
    edge: Option<EdgeKind>,
}

impl Default for MockPin {
    fn default() -> Self {
        Self {
            configured: false,
            direction: Direction::Input,
            pull: Pull::None,
            level: Level::Low,
            edge: None,
        }
    }
}

struct MockState {
    pins: [MockPin; PIN_COUNT],
    // Latched edge deliveries per pin, oldest first.
    pending: Vec<VecDeque<Level>>,
    // (bus, address) -> register file plus cursor.
    i2c_devices: HashMap<(u8, u8), ([u8; 256], u8)>,
    closed: bool,
}

pub struct MockBackend {
    state: Mutex<MockState>,
    edge_wakeup: Condvar,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                pins: [MockPin::default(); PIN_COUNT],
                pending: (0..PIN_COUNT).map(|_| VecDeque::new()).collect(),
                i2c_devices: HashMap::new(),
                closed: false,
            }),
            edge_wakeup: Condvar::new(),
        }
    }

    fn check_pin(&self, pin: u8) -> Result<(), GpioError> {
        if pin > MOCK_MAX_PIN {
            return Err(GpioError::PinOutOfRange);
        }
        Ok(())
    }

    fn lock_open(&self) -> Result<std::sync::MutexGuard<'_, MockState>, GpioError> {
        let state = self.state.lock().unwrap();
        if state.closed {
            return Err(GpioError::DeviceAccess);
        }
        Ok(state)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PinBackend for MockBackend {
    fn max_pin(&self) -> u8 {
        MOCK_MAX_PIN
    }

    fn pwm_capable(&self, pin: u8) -> bool {
        PWM_PINS.contains(&pin)
    }

    fn configure(
        &self,
        pin: u8,
        direction: Direction,
        pull: Pull,
    ) -> Result<(), GpioError> {
        self.check_pin(pin)?;
        let mut state = self.lock_open()?;
        let entry = &mut state.pins[pin as usize];
        entry.configured = true;
        entry.direction = direction;
        entry.pull = pull;
        entry.level = match direction {
            // Outputs start Low, as the hardware adapter initializes them.
            Direction::Output => Level::Low,
            // An undriven input floats to its bias.
            Direction::Input => match pull {
                Pull::Up => Level::High,
                Pull::Down | Pull::None => Level::Low,
            },
        };
        Ok(())
    }

    fn read(&self, pin: u8) -> Result<Level, GpioError> {
        self.check_pin(pin)?;
        let state = self.lock_open()?;
        Ok(state.pins[pin as usize].level)
    }

    fn write(&self, pin: u8, level: Level) -> Result<(), GpioError> {
        self.check_pin(pin)?;
        let mut state = self.lock_open()?;
        let previous = state.pins[pin as usize].level;
        state.pins[pin as usize].level = level;

        // Level crossings on an armed pin latch an event, whatever the
        // pin's direction: writes to inputs are how tests model external
        // signals.
        if previous != level {
            if let Some(edge) = state.pins[pin as usize].edge {
                if edge.matches(level) {
                    state.pending[pin as usize].push_back(level);
                    self.edge_wakeup.notify_all();
                }
            }
        }
        Ok(())
    }

    fn read_analog(&self, channel: u8) -> Result<u16, GpioError> {
        if channel > drv_gpio_api::ANALOG_CHANNEL_MAX {
            return Err(GpioError::InvalidAnalogChannel);
        }
        let _guard = self.lock_open()?;
        // Deterministic per-channel sample in the converter's 10-bit range.
        Ok(512 + u16::from(channel) * 31)
    }

    fn set_edge_detect(
        &self,
        pin: u8,
        kind: Option<EdgeKind>,
    ) -> Result<(), GpioError> {
        self.check_pin(pin)?;
        let mut state = self.lock_open()?;
        state.pins[pin as usize].edge = kind;
        if kind.is_none() {
            state.pending[pin as usize].clear();
            // Disarming unblocks any waiter so it can observe the change.
            self.edge_wakeup.notify_all();
        }
        Ok(())
    }

    fn wait_for_edge(
        &self,
        pin: u8,
        timeout: Duration,
    ) -> Result<Option<Level>, GpioError> {
        self.check_pin(pin)?;
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(GpioError::DeviceAccess);
            }
            if let Some(level) = state.pending[pin as usize].pop_front() {
                return Ok(Some(level));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (next, result) = self
                .edge_wakeup
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
            if result.timed_out()
                && state.pending[pin as usize].is_empty()
                && !state.closed
            {
                return Ok(None);
            }
        }
    }

    fn spi_transfer(
        &self,
        channel: u8,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<(), GpioError> {
        if channel > 1 {
            return Err(GpioError::InvalidChannel);
        }
        let _guard = self.lock_open()?;
        // Loopback wiring.
        rx.copy_from_slice(tx);
        Ok(())
    }

    fn i2c_write(
        &self,
        bus: u8,
        address: u8,
        data: &[u8],
    ) -> Result<(), GpioError> {
        if bus > 1 {
            return Err(GpioError::InvalidBus);
        }
        let mut state = self.lock_open()?;
        let (regs, cursor) = state
            .i2c_devices
            .entry((bus, address))
            .or_insert(([0u8; 256], 0));
        // Register-file model: the first byte selects the register, the
        // rest lands there.
        if let Some((first, rest)) = data.split_first() {
            *cursor = *first;
            for (i, byte) in rest.iter().enumerate() {
                let slot = cursor.wrapping_add(i as u8);
                regs[slot as usize] = *byte;
            }
        }
        Ok(())
    }

    fn i2c_read(
        &self,
        bus: u8,
        address: u8,
        dest: &mut [u8],
    ) -> Result<(), GpioError> {
        if bus > 1 {
            return Err(GpioError::InvalidBus);
        }
        let state = self.lock_open()?;
        let (regs, cursor) = state
            .i2c_devices
            .get(&(bus, address))
            .copied()
            .unwrap_or(([0u8; 256], 0));
        for (i, slot) in dest.iter_mut().enumerate() {
            *slot = regs[cursor.wrapping_add(i as u8) as usize];
        }
        Ok(())
    }

    fn close(&self) -> Result<(), GpioError> {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        // Waiters parked on the edge condvar must observe the close.
        self.edge_wakeup.notify_all();
        Ok(())
    }
}

#[cfg(feature = "event-injection")]
mod injection {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Drives random level flips into armed pins until dropped. Test rigs
    /// use this to exercise dispatcher paths under unpredictable timing.
    pub struct EventInjector {
        stop: Arc<AtomicBool>,
        join: Option<std::thread::JoinHandle<()>>,
    }

    impl EventInjector {
        pub fn start(
            backend: Arc<MockBackend>,
            period: Duration,
            seed: u64,
        ) -> Self {
            let stop = Arc::new(AtomicBool::new(false));
            let thread_stop = Arc::clone(&stop);
            let join = std::thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(seed);
                while !thread_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(period);
                    let armed: Vec<u8> = {
                        let state = backend.state.lock().unwrap();
                        if state.closed {
                            break;
                        }
                        state
                            .pins
                            .iter()
                            .enumerate()
                            .filter(|(_, p)| p.edge.is_some())
                            .map(|(i, _)| i as u8)
                            .collect()
                    };
                    if armed.is_empty() {
                        continue;
                    }
                    let pin = armed[rng.random_range(0..armed.len())];
                    let level =
                        Level::from(rng.random_bool(0.5));
                    let _ = backend.write(pin, level);
                }
            });
            Self {
                stop,
                join: Some(join),
            }
        }
    }

    impl Drop for EventInjector {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(join) = self.join.take() {
                let _ = join.join();
            }
        }
    }
}

#[cfg(feature = "event-injection")]
pub use injection::EventInjector;
