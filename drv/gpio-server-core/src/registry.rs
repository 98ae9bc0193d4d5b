// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The canonical record of configured pins.
//!
//! One slot per pin line behind a reader/writer lock. A populated slot
//! means "this pin is configured"; everything else the controller believes
//! about a pin derives from here. The registry records what the controller
//! has made true, and nothing else: it never calls into a backend.
//!
//! Lock spans are minimal. Callers read or update one record and get out;
//! backend calls and handler invocations never happen under this lock.

use std::sync::RwLock;

use drv_gpio_api::{Direction, GpioError, Level, PinState};

use crate::audit::now_micros;

pub struct Registry {
    slots: RwLock<Vec<Option<PinState>>>,
}

impl Registry {
    pub fn new(max_pin: u8) -> Self {
        Self {
            slots: RwLock::new(vec![None; max_pin as usize + 1]),
        }
    }

    pub fn get(&self, pin: u8) -> Option<PinState> {
        let slots = self.slots.read().unwrap();
        slots.get(pin as usize).copied().flatten()
    }

    /// Requires a record; the usual first step of a stateful operation.
    pub fn require(&self, pin: u8) -> Result<PinState, GpioError> {
        self.get(pin).ok_or(GpioError::NotConfigured)
    }

    pub fn insert(&self, state: PinState) {
        let mut slots = self.slots.write().unwrap();
        let idx = state.pin as usize;
        if idx < slots.len() {
            slots[idx] = Some(state);
        }
    }

    /// Applies `f` to the pin's record and refreshes its timestamp.
    pub fn update(
        &self,
        pin: u8,
        f: impl FnOnce(&mut PinState),
    ) -> Result<(), GpioError> {
        let mut slots = self.slots.write().unwrap();
        match slots.get_mut(pin as usize).and_then(|s| s.as_mut()) {
            Some(state) => {
                f(state);
                state.last_update = now_micros();
                Ok(())
            }
            None => Err(GpioError::NotConfigured),
        }
    }

    /// Refreshes the timestamp only, for operations that observe a pin
    /// without changing it.
    pub fn touch(&self, pin: u8) -> Result<(), GpioError> {
        self.update(pin, |_| ())
    }

    pub fn remove(&self, pin: u8) -> Option<PinState> {
        let mut slots = self.slots.write().unwrap();
        slots.get_mut(pin as usize).and_then(|s| s.take())
    }

    /// Snapshot of every configured pin, in line order.
    pub fn list(&self) -> Vec<PinState> {
        let slots = self.slots.read().unwrap();
        slots.iter().flatten().copied().collect()
    }

    /// Pins currently configured as outputs; the shutdown path drives
    /// these Low.
    pub fn outputs(&self) -> Vec<u8> {
        let slots = self.slots.read().unwrap();
        slots
            .iter()
            .flatten()
            .filter(|s| s.direction == Direction::Output)
            .map(|s| s.pin)
            .collect()
    }

    pub fn clear(&self) {
        let mut slots = self.slots.write().unwrap();
        slots.iter_mut().for_each(|s| *s = None);
    }

    pub fn len(&self) -> usize {
        let slots = self.slots.read().unwrap();
        slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds the record a fresh configuration establishes: outputs start Low,
/// inputs start at their bias.
pub fn initial_state(pin: u8, direction: Direction, pull: drv_gpio_api::Pull) -> PinState {
    let level = match direction {
        Direction::Output => Level::Low,
        Direction::Input => match pull {
            drv_gpio_api::Pull::Up => Level::High,
            _ => Level::Low,
        },
    };
    PinState {
        pin,
        direction,
        level,
        pull,
        last_update: now_micros(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drv_gpio_api::Pull;

    #[test]
    fn insert_get_round_trip() {
        let registry = Registry::new(27);
        registry.insert(initial_state(18, Direction::Output, Pull::None));

        let state = registry.get(18).unwrap();
        assert_eq!(state.direction, Direction::Output);
        assert_eq!(state.level, Level::Low);
        assert!(registry.get(19).is_none());
        assert_eq!(registry.require(19), Err(GpioError::NotConfigured));
    }

    #[test]
    fn update_advances_the_timestamp() {
        let registry = Registry::new(27);
        registry.insert(initial_state(18, Direction::Output, Pull::None));
        let before = registry.get(18).unwrap().last_update;

        std::thread::sleep(std::time::Duration::from_millis(2));
        registry.update(18, |s| s.level = Level::High).unwrap();

        let after = registry.get(18).unwrap();
        assert_eq!(after.level, Level::High);
        assert!(after.last_update > before);
    }

    #[test]
    fn list_and_outputs_reflect_contents() {
        let registry = Registry::new(27);
        registry.insert(initial_state(4, Direction::Input, Pull::Up));
        registry.insert(initial_state(18, Direction::Output, Pull::None));
        registry.insert(initial_state(21, Direction::Output, Pull::None));

        assert_eq!(registry.list().len(), 3);
        assert_eq!(registry.outputs(), vec![18, 21]);

        registry.remove(18);
        assert_eq!(registry.outputs(), vec![21]);

        registry.clear();
        assert!(registry.is_empty());
    }
}
