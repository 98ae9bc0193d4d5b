// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared API for the GPIO safety agent.
//!
//! This crate defines the types that cross the agent's boundaries: pin
//! attributes and state records, edge events, the error/response-code
//! vocabulary, the policy pin-set type, the backend capability trait that
//! both the hardware adapter and the mock implement, and the wire request
//! structs for the agent's framed protocol (see [`wire`]).
//!
//! Pins are addressed by their SoC line number, not their header position.
//! The range a given backend accepts is reported by
//! [`PinBackend::max_pin`]; line numbers are dense from zero.

use hubpack::SerializedSize;
use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

pub mod wire;

pub use num_traits::FromPrimitive;

/// Highest pin line exposed through the common target's header.
pub const HARDWARE_MAX_PIN: u8 = 27;

/// Highest pin line the mock backend simulates.
pub const MOCK_MAX_PIN: u8 = 40;

/// Software PWM frequency bounds, in Hz.
pub const PWM_FREQ_MIN_HZ: u32 = 1;
pub const PWM_FREQ_MAX_HZ: u32 = 40_000;

/// Duty cycle is a percentage.
pub const PWM_DUTY_MAX: u8 = 100;

/// Largest single SPI transfer, in bytes.
pub const SPI_TRANSFER_MAX: usize = 4096;

/// Largest single I2C transfer, in bytes.
pub const I2C_TRANSFER_MAX: usize = 256;

/// 7-bit I2C address window; addresses outside it are reserved by the bus
/// specification.
pub const I2C_ADDR_MIN: u8 = 0x08;
pub const I2C_ADDR_MAX: u8 = 0x77;

/// Analog sampling channels on the supported expansion converters.
pub const ANALOG_CHANNEL_MAX: u8 = 7;

/// Pins whose misuse disrupts host boot or console/bus operation: the two
/// ID-EEPROM bus lines and the console UART pair on the target SoC.
pub const CRITICAL_PINS: PinSet = PinSet::of(&[0, 1, 14, 15]);

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromPrimitive,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(u8)]
pub enum Direction {
    Input = 0,
    Output = 1,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromPrimitive,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(u8)]
pub enum Pull {
    None = 0,
    Up = 1,
    Down = 2,
}

#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromPrimitive,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(u8)]
pub enum Level {
    Low = 0,
    High = 1,
}

impl From<bool> for Level {
    fn from(v: bool) -> Self {
        if v {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl core::ops::Not for Level {
    type Output = Level;
    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// Edge selection for interrupt arming, and the kind recorded on delivered
/// events. An event delivered for a pin armed with `Both` reports `Both`;
/// the sampled [`Level`] distinguishes the actual transition.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromPrimitive,
    Serialize,
    Deserialize,
    SerializedSize,
)]
#[repr(u8)]
pub enum EdgeKind {
    Rising = 1,
    Falling = 2,
    Both = 3,
}

impl EdgeKind {
    /// Whether a transition to `level` satisfies this edge selection.
    pub fn matches(self, level: Level) -> bool {
        match self {
            EdgeKind::Rising => level == Level::High,
            EdgeKind::Falling => level == Level::Low,
            EdgeKind::Both => true,
        }
    }
}

/// Policy strictness, ordered. `Strict` is the default; the other two only
/// widen or narrow the allowed-pin set when the policy is constructed.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    FromPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
pub enum SecurityLevel {
    Permissive = 0,
    Strict = 1,
    Paranoid = 2,
}

/// Software PWM parameters.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct PwmConfig {
    pub frequency_hz: u32,
    /// Percentage, 0..=100.
    pub duty_cycle: u8,
}

/// SPI bus parameters for a pin configured into an SPI role. Consulted only
/// when the pin drives that role.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct SpiParams {
    pub channel: u8,
    pub clock_hz: u32,
}

/// I2C bus parameters for a pin configured into an I2C role.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct I2cParams {
    pub bus: u8,
    pub address: u8,
}

/// A requested pin configuration. Only the fields matching the configured
/// mode are consulted; `pull` is accepted but ignored for outputs.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct PinConfig {
    pub pin: u8,
    pub direction: Direction,
    pub pull: Pull,
    pub pwm: Option<PwmConfig>,
    pub spi: Option<SpiParams>,
    pub i2c: Option<I2cParams>,
}

impl PinConfig {
    pub fn input(pin: u8, pull: Pull) -> Self {
        Self {
            pin,
            direction: Direction::Input,
            pull,
            pwm: None,
            spi: None,
            i2c: None,
        }
    }

    pub fn output(pin: u8) -> Self {
        Self {
            pin,
            direction: Direction::Output,
            pull: Pull::None,
            pwm: None,
            spi: None,
            i2c: None,
        }
    }
}

/// The registry's record of one configured pin. `last_update` is UTC
/// microseconds since the epoch.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct PinState {
    pub pin: u8,
    pub direction: Direction,
    pub level: Level,
    pub pull: Pull,
    pub last_update: u64,
}

/// One delivered edge event. `kind` is the armed selection, `level` the
/// sampled line state after the edge, `timestamp` UTC microseconds.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, SerializedSize,
)]
pub struct Event {
    pub pin: u8,
    pub kind: EdgeKind,
    pub level: Level,
    pub timestamp: u64,
}

/// The agent's error vocabulary. These are deliberately specific, not
/// because callers handle each differently, but to give upstack software
/// some context surrounding the failure.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum GpioError {
    /// Malformed or truncated message
    BadMessage = 1,
    /// Pin number is outside the backend's line range
    PinOutOfRange = 2,
    /// PWM frequency outside the supported window
    FrequencyOutOfRange = 3,
    /// PWM duty cycle above 100 percent
    DutyCycleOutOfRange = 4,
    /// Transfer length is zero or exceeds the bus maximum
    SizeExceeded = 5,
    /// SPI channel other than 0 or 1
    InvalidChannel = 6,
    /// I2C bus other than 0 or 1
    InvalidBus = 7,
    /// I2C address outside the 7-bit device window
    InvalidAddress = 8,
    /// Analog channel beyond the converter's inputs
    InvalidAnalogChannel = 9,
    /// Pin has no registry record
    NotConfigured = 10,
    /// Pin is not configured as output
    NotOutput = 11,
    /// Pin is not configured as input
    NotInput = 12,
    /// Software PWM is active on this pin; disarm it first
    BusyPwm = 13,
    /// Pin is not PWM capable
    NotPwmCapable = 14,
    /// Event loop is already running
    EventLoopRunning = 15,
    /// Operation denied: critical system pin
    CriticalPin = 16,
    /// Operation denied: pin is restricted
    RestrictedPin = 17,
    /// Operation denied: pin is not in the allow list
    PinNotAllowed = 18,
    /// Operation denied: operation is not in the allow list
    OperationNotAllowed = 19,
    /// Concurrent-operation cap reached; retry after the operation timeout
    CapacityExhausted = 20,
    /// Backend does not implement the operation
    OperationNotSupported = 21,
    /// Hardware fault reported by the backend
    HardwareFault = 22,
    /// Device node unavailable or insufficient permission
    DeviceAccess = 23,
}

impl From<GpioError> for u32 {
    fn from(e: GpioError) -> Self {
        e as u32
    }
}

/// The failure taxonomy. Kinds, not types: retry policy and RPC status are
/// decided per kind.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Malformed parameters; never retried.
    Input,
    /// Operation incompatible with current pin state; reconfigure first.
    State,
    /// Safety policy rejection.
    Policy,
    /// Admission cap reached; transient.
    Capacity,
    /// Backend fault; surfaced with its cause, not retried here.
    Hardware,
}

impl GpioError {
    pub fn kind(self) -> ErrorKind {
        use GpioError::*;
        match self {
            BadMessage | PinOutOfRange | FrequencyOutOfRange
            | DutyCycleOutOfRange | SizeExceeded | InvalidChannel
            | InvalidBus | InvalidAddress | InvalidAnalogChannel
            | OperationNotSupported => ErrorKind::Input,
            NotConfigured | NotOutput | NotInput | BusyPwm | NotPwmCapable
            | EventLoopRunning => ErrorKind::State,
            CriticalPin | RestrictedPin | PinNotAllowed
            | OperationNotAllowed => ErrorKind::Policy,
            CapacityExhausted => ErrorKind::Capacity,
            HardwareFault | DeviceAccess => ErrorKind::Hardware,
        }
    }
}

impl core::fmt::Display for GpioError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            GpioError::BadMessage => "malformed or truncated message",
            GpioError::PinOutOfRange => "pin number out of range",
            GpioError::FrequencyOutOfRange => "pwm frequency out of range",
            GpioError::DutyCycleOutOfRange => "pwm duty cycle out of range",
            GpioError::SizeExceeded => "transfer size exceeds bus maximum",
            GpioError::InvalidChannel => "invalid spi channel",
            GpioError::InvalidBus => "invalid i2c bus",
            GpioError::InvalidAddress => "invalid i2c address",
            GpioError::InvalidAnalogChannel => "invalid analog channel",
            GpioError::NotConfigured => "pin is not configured",
            GpioError::NotOutput => "pin is not configured as output",
            GpioError::NotInput => "pin is not configured as input",
            GpioError::BusyPwm => "software pwm is active on this pin",
            GpioError::NotPwmCapable => "pin is not pwm capable",
            GpioError::EventLoopRunning => "event loop is already running",
            GpioError::CriticalPin => {
                "operation denied: critical system pin"
            }
            GpioError::RestrictedPin => "operation denied: restricted pin",
            GpioError::PinNotAllowed => {
                "operation denied: pin not in allow list"
            }
            GpioError::OperationNotAllowed => {
                "operation denied: operation not allowed"
            }
            GpioError::CapacityExhausted => {
                "concurrent operation limit reached"
            }
            GpioError::OperationNotSupported => {
                "operation not supported by this backend"
            }
            GpioError::HardwareFault => "hardware fault",
            GpioError::DeviceAccess => "device node access failed",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for GpioError {}

/// RPC status categories for errors crossing the agent boundary.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u8)]
pub enum RpcCode {
    Ok = 0,
    InvalidArgument = 1,
    FailedPrecondition = 2,
    PermissionDenied = 3,
    ResourceExhausted = 4,
    Internal = 5,
}

impl From<GpioError> for RpcCode {
    fn from(e: GpioError) -> Self {
        match e.kind() {
            ErrorKind::Input => RpcCode::InvalidArgument,
            ErrorKind::State => RpcCode::FailedPrecondition,
            ErrorKind::Policy => RpcCode::PermissionDenied,
            ErrorKind::Capacity => RpcCode::ResourceExhausted,
            ErrorKind::Hardware => RpcCode::Internal,
        }
    }
}

/// A set of pin lines as a bitmask. Lines above 63 do not exist on any
/// supported target.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PinSet(u64);

impl PinSet {
    pub const EMPTY: PinSet = PinSet(0);

    pub const fn of(pins: &[u8]) -> Self {
        let mut mask = 0u64;
        let mut i = 0;
        while i < pins.len() {
            mask |= 1 << pins[i];
            i += 1;
        }
        PinSet(mask)
    }

    pub const fn contains(self, pin: u8) -> bool {
        pin < 64 && self.0 & (1 << pin) != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn with(self, pin: u8) -> Self {
        if pin >= 64 {
            return self;
        }
        PinSet(self.0 | (1 << pin))
    }

    pub const fn without(self, pin: u8) -> Self {
        if pin >= 64 {
            return self;
        }
        PinSet(self.0 & !(1 << pin))
    }

    pub const fn union(self, other: PinSet) -> Self {
        PinSet(self.0 | other.0)
    }

    pub const fn intersection(self, other: PinSet) -> Self {
        PinSet(self.0 & other.0)
    }

    pub fn len(self) -> u32 {
        self.0.count_ones()
    }

    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0..64u8).filter(move |p| self.contains(*p))
    }
}

impl FromIterator<u8> for PinSet {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        let mut set = PinSet::EMPTY;
        for pin in iter {
            set = set.with(pin);
        }
        set
    }
}

/// The capability set both backends provide. The safety layer above this
/// trait serializes callers per pin; implementations only need to be safe
/// against concurrent access to *different* pins, plus the edge-wait calls
/// noted below.
///
/// Direction and pull translation, output-Low initialization, and the
/// edge-detect machinery are the implementation's concern; policy is not.
/// Backends never see an operation the safety layer rejected.
pub trait PinBackend: Send + Sync {
    /// Highest valid pin line.
    fn max_pin(&self) -> u8;

    /// Whether the line can be driven by the software PWM engine. Only a
    /// documented subset of output-capable lines qualifies.
    fn pwm_capable(&self, pin: u8) -> bool;

    /// Applies direction and pull. Output lines start Low.
    fn configure(
        &self,
        pin: u8,
        direction: Direction,
        pull: Pull,
    ) -> Result<(), GpioError>;

    /// Samples the line level.
    fn read(&self, pin: u8) -> Result<Level, GpioError>;

    /// Drives the line level.
    fn write(&self, pin: u8, level: Level) -> Result<(), GpioError>;

    /// Samples an analog channel, if the target has a converter.
    fn read_analog(&self, channel: u8) -> Result<u16, GpioError>;

    /// Arms (`Some`) or disarms (`None`) edge detection on the line.
    fn set_edge_detect(
        &self,
        pin: u8,
        kind: Option<EdgeKind>,
    ) -> Result<(), GpioError>;

    /// Blocks until an armed edge fires on `pin` or `timeout` elapses.
    /// Returns the sampled level after the edge. May be called from a
    /// waiter thread concurrently with any other backend call.
    fn wait_for_edge(
        &self,
        pin: u8,
        timeout: core::time::Duration,
    ) -> Result<Option<Level>, GpioError>;

    /// Full-duplex SPI transfer. `tx` and `rx` are the same length.
    fn spi_transfer(
        &self,
        channel: u8,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<(), GpioError>;

    fn i2c_write(
        &self,
        bus: u8,
        address: u8,
        data: &[u8],
    ) -> Result<(), GpioError>;

    fn i2c_read(
        &self,
        bus: u8,
        address: u8,
        dest: &mut [u8],
    ) -> Result<(), GpioError>;

    /// Releases the backend's handles. Further calls fail with
    /// [`GpioError::DeviceAccess`].
    fn close(&self) -> Result<(), GpioError>;
}
