// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware pin backend for BCM2711-based boards.
//!
//! Talks to the SoC's GPIO block through `/dev/gpiomem` and, when the
//! process has the capability for `/dev/mem`, to the SPI and BSC controller
//! blocks as well. Only the 28 lines routed to the board's header are
//! exposed; the SoC has more, but driving them from here would fight the
//! firmware.
//!
//! Edge detection uses the block's event-detect unit: arming a line sets
//! its rising/falling enable bits and the event status register latches
//! transitions until cleared. The wait primitive polls that latch at a
//! millisecond cadence, which bounds detection latency well inside the
//! best-effort promise this service makes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use drv_gpio_api::{
    Direction, EdgeKind, GpioError, Level, PinBackend, Pull,
    HARDWARE_MAX_PIN,
};

mod i2c;
mod mem;
mod spi;

use i2c::I2cBlock;
use mem::MmioBlock;
use spi::SpiBlock;

// Peripheral block bases in the SoC's low-peripheral-mode address map.
const SPI0_BASE: i64 = 0xFE20_4000;
const BSC0_BASE: i64 = 0xFE20_5000;
const BSC1_BASE: i64 = 0xFE80_4000;
const BLOCK_LEN: usize = 4096;

// GPIO register indices, in 32-bit units.
const GPFSEL0: usize = 0;
const GPSET0: usize = 7;
const GPCLR0: usize = 10;
const GPLEV0: usize = 13;
const GPEDS0: usize = 16;
const GPREN0: usize = 19;
const GPFEN0: usize = 22;
const GPIO_PUP_PDN_CNTRL0: usize = 57;

// Function-select values.
const FSEL_INPUT: u32 = 0b000;
const FSEL_OUTPUT: u32 = 0b001;

/// Lines with a hardware PWM alternate function; the software PWM engine
/// restricts itself to these so a later move to hardware PWM does not
/// change the surface.
const PWM_PINS: [u8; 4] = [12, 13, 18, 19];

const EDGE_POLL: Duration = Duration::from_millis(1);

/// `(register index, bit shift)` for a pin's 3-bit function-select field.
fn fsel_field(pin: u8) -> (usize, u32) {
    (GPFSEL0 + pin as usize / 10, (u32::from(pin) % 10) * 3)
}

/// `(register index, bit shift)` for a pin's 2-bit pull-control field.
fn pull_field(pin: u8) -> (usize, u32) {
    (
        GPIO_PUP_PDN_CNTRL0 + pin as usize / 16,
        (u32::from(pin) % 16) * 2,
    )
}

fn pull_bits(pull: Pull) -> u32 {
    match pull {
        Pull::None => 0b00,
        Pull::Up => 0b01,
        Pull::Down => 0b10,
    }
}

pub struct Bcm2711Backend {
    gpio: MmioBlock,
    // Serializes read-modify-write register updates (FSEL, pull, edge
    // enables). The set/clear/level/event registers are single-write and
    // need no lock.
    rmw: Mutex<()>,
    spi: Option<SpiBlock>,
    i2c: [Option<I2cBlock>; 2],
    closed: AtomicBool,
}

impl Bcm2711Backend {
    /// Maps the GPIO block, and the bus controller blocks when `/dev/mem`
    /// is accessible. GPIO access alone needs only gpio-group membership.
    pub fn open() -> Result<Self, GpioError> {
        let gpio = MmioBlock::map("/dev/gpiomem", 0, BLOCK_LEN)?;

        let spi = MmioBlock::map("/dev/mem", SPI0_BASE, BLOCK_LEN)
            .ok()
            .map(SpiBlock::new);
        let i2c0 = MmioBlock::map("/dev/mem", BSC0_BASE, BLOCK_LEN)
            .ok()
            .map(I2cBlock::new);
        let i2c1 = MmioBlock::map("/dev/mem", BSC1_BASE, BLOCK_LEN)
            .ok()
            .map(I2cBlock::new);

        Ok(Self {
            gpio,
            rmw: Mutex::new(()),
            spi,
            i2c: [i2c0, i2c1],
            closed: AtomicBool::new(false),
        })
    }

    fn check(&self, pin: u8) -> Result<(), GpioError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GpioError::DeviceAccess);
        }
        if pin > HARDWARE_MAX_PIN {
            return Err(GpioError::PinOutOfRange);
        }
        Ok(())
    }

    fn update(&self, idx: usize, mask: u32, value: u32) {
        let _guard = self.rmw.lock().unwrap();
        let current = self.gpio.read(idx);
        self.gpio.write(idx, (current & !mask) | value);
    }
}

impl PinBackend for Bcm2711Backend {
    fn max_pin(&self) -> u8 {
        HARDWARE_MAX_PIN
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
        self.check(pin)?;

        let (fsel_idx, fsel_shift) = fsel_field(pin);
        let fsel = match direction {
            Direction::Input => FSEL_INPUT,
            Direction::Output => FSEL_OUTPUT,
        };
        self.update(fsel_idx, 0b111 << fsel_shift, fsel << fsel_shift);

        // Bias only matters for inputs; an output's driver overrides it.
        if direction == Direction::Input {
            let (pull_idx, pull_shift) = pull_field(pin);
            self.update(
                pull_idx,
                0b11 << pull_shift,
                pull_bits(pull) << pull_shift,
            );
        }

        if direction == Direction::Output {
            // Outputs start Low.
            self.gpio.write(GPCLR0, 1 << pin);
        }
        Ok(())
    }

    fn read(&self, pin: u8) -> Result<Level, GpioError> {
        self.check(pin)?;
        let level = self.gpio.read(GPLEV0) & (1 << pin) != 0;
        Ok(Level::from(level))
    }

    fn write(&self, pin: u8, level: Level) -> Result<(), GpioError> {
        self.check(pin)?;
        match level {
            Level::High => self.gpio.write(GPSET0, 1 << pin),
            Level::Low => self.gpio.write(GPCLR0, 1 << pin),
        }
        Ok(())
    }

    fn read_analog(&self, _channel: u8) -> Result<u16, GpioError> {
        // The SoC has no analog converter; sampling needs an expansion
        // part behind SPI, which deployments wire themselves.
        Err(GpioError::OperationNotSupported)
    }

    fn set_edge_detect(
        &self,
        pin: u8,
        kind: Option<EdgeKind>,
    ) -> Result<(), GpioError> {
        self.check(pin)?;
        let bit = 1u32 << pin;
        let (rising, falling) = match kind {
            None => (0, 0),
            Some(EdgeKind::Rising) => (bit, 0),
            Some(EdgeKind::Falling) => (0, bit),
            Some(EdgeKind::Both) => (bit, bit),
        };
        self.update(GPREN0, bit, rising);
        self.update(GPFEN0, bit, falling);
        // Drop any event latched under the previous arming.
        self.gpio.write(GPEDS0, bit);
        Ok(())
    }

    fn wait_for_edge(
        &self,
        pin: u8,
        timeout: Duration,
    ) -> Result<Option<Level>, GpioError> {
        self.check(pin)?;
        let bit = 1u32 << pin;
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(GpioError::DeviceAccess);
            }
            if self.gpio.read(GPEDS0) & bit != 0 {
                // Write-one-to-clear, then sample the settled level.
                self.gpio.write(GPEDS0, bit);
                let level = self.gpio.read(GPLEV0) & bit != 0;
                return Ok(Some(Level::from(level)));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(EDGE_POLL);
        }
    }

    fn spi_transfer(
        &self,
        channel: u8,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<(), GpioError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GpioError::DeviceAccess);
        }
        if channel > 1 {
            return Err(GpioError::InvalidChannel);
        }
        match &self.spi {
            Some(block) => block.transfer(channel, tx, rx),
            None => Err(GpioError::DeviceAccess),
        }
    }

    fn i2c_write(
        &self,
        bus: u8,
        address: u8,
        data: &[u8],
    ) -> Result<(), GpioError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GpioError::DeviceAccess);
        }
        match self.i2c.get(bus as usize) {
            Some(Some(block)) => block.write(address, data),
            Some(None) => Err(GpioError::DeviceAccess),
            None => Err(GpioError::InvalidBus),
        }
    }

    fn i2c_read(
        &self,
        bus: u8,
        address: u8,
        dest: &mut [u8],
    ) -> Result<(), GpioError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GpioError::DeviceAccess);
        }
        match self.i2c.get(bus as usize) {
            Some(Some(block)) => block.read(address, dest),
            Some(None) => Err(GpioError::DeviceAccess),
            None => Err(GpioError::InvalidBus),
        }
    }

    fn close(&self) -> Result<(), GpioError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fsel_fields_pack_ten_pins_per_register() {
        assert_eq!(fsel_field(0), (0, 0));
        assert_eq!(fsel_field(9), (0, 27));
        assert_eq!(fsel_field(10), (1, 0));
        assert_eq!(fsel_field(27), (2, 21));
    }

    #[test]
    fn pull_fields_pack_sixteen_pins_per_register() {
        assert_eq!(pull_field(0), (57, 0));
        assert_eq!(pull_field(15), (57, 30));
        assert_eq!(pull_field(16), (58, 0));
        assert_eq!(pull_field(27), (58, 22));
    }

    #[test]
    fn pull_encoding_matches_the_control_field() {
        assert_eq!(pull_bits(Pull::None), 0b00);
        assert_eq!(pull_bits(Pull::Up), 0b01);
        assert_eq!(pull_bits(Pull::Down), 0b10);
    }
}
