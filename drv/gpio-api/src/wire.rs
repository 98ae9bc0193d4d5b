// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Framed request/response protocol for the agent socket.
//!
//! Every frame on the wire is a little-endian `u32` byte length followed by
//! that many bytes. A request is a [`RequestHeader`] followed by the
//! operation's fixed request struct and, for bus writes, the transfer bytes.
//! A response is a [`ResponseHeader`] followed by `payload_len` bytes of
//! hubpack-encoded payload.
//!
//! Fixed request structs are plain-old-data with explicit little-endian
//! fields; enum-valued fields travel as their `u8` discriminants and are
//! validated on receipt. The response `code` is an [`RpcCode`] discriminant
//! and `detail` is the [`GpioError`] discriminant (zero on success).
//!
//! | op | request struct | response payload |
//! |----|----------------|------------------|
//! | `configure` (1) | [`ConfigureRequest`] | none |
//! | `read` (2) | [`PinRequest`] | `Level` |
//! | `write` (3) | [`WriteRequest`] | none |
//! | `toggle` (4) | [`PinRequest`] | `Level` |
//! | `set_pwm` (5) | [`SetPwmRequest`] | none |
//! | `enable_interrupt` (6) | [`EnableInterruptRequest`] | none |
//! | `disable_interrupt` (7) | [`PinRequest`] | none |
//! | `get_state` (8) | [`PinRequest`] | `PinState` |
//! | `list_pins` (9) | none | `u16` count, then `PinState` records |
//! | `release` (10) | [`PinRequest`] | none |
//! | `read_analog` (11) | [`ReadAnalogRequest`] | `u16` sample |
//! | `spi_transfer` (12) | [`SpiTransferRequest`] + bytes | raw bytes |
//! | `spi_write` (13) | [`SpiTransferRequest`] + bytes | none |
//! | `spi_read` (14) | [`SpiTransferRequest`] | raw bytes |
//! | `i2c_write` (15) | [`I2cTransferRequest`] + bytes | none |
//! | `i2c_read` (16) | [`I2cTransferRequest`] | raw bytes |
//! | `i2c_write_reg` (17) | [`I2cRegRequest`] + bytes | none |
//! | `i2c_read_reg` (18) | [`I2cRegRequest`] | raw bytes |
//! | `drain_events` (19) | none | `u16` count, then `Event` records |

use num_derive::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const WIRE_VERSION: u8 = 1;

/// Upper bound on a frame; anything larger is a protocol violation.
pub const MAX_FRAME: usize = 8192;

/// Caller labels are NUL-padded UTF-8, truncated to this many bytes. They
/// identify callers for audit only; they carry no authority.
pub const CALLER_LEN: usize = 16;

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u16)]
pub enum Op {
    Configure = 1,
    Read = 2,
    Write = 3,
    Toggle = 4,
    SetPwm = 5,
    EnableInterrupt = 6,
    DisableInterrupt = 7,
    GetState = 8,
    ListPins = 9,
    Release = 10,
    ReadAnalog = 11,
    SpiTransfer = 12,
    SpiWrite = 13,
    SpiRead = 14,
    I2cWrite = 15,
    I2cRead = 16,
    I2cWriteReg = 17,
    I2cReadReg = 18,
    DrainEvents = 19,
}

#[derive(
    Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct RequestHeader {
    pub version: u8,
    pub op: U16,
    pub request_id: U32,
    pub caller: [u8; CALLER_LEN],
}

const_assert_eq!(core::mem::size_of::<RequestHeader>(), 23);

#[derive(
    Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct ResponseHeader {
    pub version: u8,
    pub code: u8,
    pub detail: U32,
    pub request_id: U32,
    pub payload_len: U16,
}

const_assert_eq!(core::mem::size_of::<ResponseHeader>(), 12);

#[derive(
    Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct ConfigureRequest {
    pub pin: u8,
    pub direction: u8,
    pub pull: u8,
    /// Nonzero when the PWM fields are meaningful.
    pub pwm_enable: u8,
    pub pwm_frequency_hz: U32,
    pub pwm_duty_cycle: u8,
}

const_assert_eq!(core::mem::size_of::<ConfigureRequest>(), 9);

/// Shared by every single-pin operation without extra parameters.
#[derive(
    Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct PinRequest {
    pub pin: u8,
}

#[derive(
    Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct WriteRequest {
    pub pin: u8,
    pub level: u8,
}

#[derive(
    Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct SetPwmRequest {
    pub pin: u8,
    pub frequency_hz: U32,
    pub duty_cycle: u8,
}

const_assert_eq!(core::mem::size_of::<SetPwmRequest>(), 6);

#[derive(
    Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct EnableInterruptRequest {
    pub pin: u8,
    pub kind: u8,
}

#[derive(
    Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct ReadAnalogRequest {
    pub channel: u8,
}

/// For `spi_transfer` and `spi_write`, `len` transfer bytes follow the
/// struct; for `spi_read` it is the requested read length.
#[derive(
    Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct SpiTransferRequest {
    pub channel: u8,
    pub len: U16,
}

#[derive(
    Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct I2cTransferRequest {
    pub bus: u8,
    pub address: u8,
    pub len: U16,
}

#[derive(
    Copy, Clone, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct I2cRegRequest {
    pub bus: u8,
    pub address: u8,
    pub register: u8,
    pub len: U16,
}

const_assert_eq!(core::mem::size_of::<I2cRegRequest>(), 5);

/// Encodes a caller label, truncating at the field width.
pub fn encode_caller(label: &str) -> [u8; CALLER_LEN] {
    let mut out = [0u8; CALLER_LEN];
    let bytes = label.as_bytes();
    let n = bytes.len().min(CALLER_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

/// Decodes a caller label, dropping the NUL padding. Invalid UTF-8 decodes
/// as the empty label rather than failing the request.
pub fn decode_caller(raw: &[u8; CALLER_LEN]) -> &str {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(CALLER_LEN);
    core::str::from_utf8(&raw[..end]).unwrap_or("")
}
