// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! GPIO safety agent.
//!
//! Fields framed pin-operation requests on a Unix-domain socket and runs
//! them through the safety controller. One thread per connection; the
//! controller serializes per-pin work internally.
//!
//! The frame format and the operation table live in `drv_gpio_api::wire`.
//! Edge events are not pushed: arming a pin through this surface parks the
//! events in a bounded in-process queue, and the `drain_events` operation
//! hands back everything queued since the last drain, oldest first.
//!
//! Audit records stream to stderr as single-line structured text and stay
//! inspectable in the in-process ring. SIGINT/SIGTERM runs the controller's
//! shutdown sequence (event loop stopped, PWM engines joined, outputs
//! driven Low) before the process exits.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::Parser;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, IntoBytes};

use drv_bcm2711_gpio::Bcm2711Backend;
use drv_gpio_api::wire::{
    self, decode_caller, Op, RequestHeader, ResponseHeader, MAX_FRAME,
    WIRE_VERSION,
};
use drv_gpio_api::{
    Direction, EdgeKind, Event, FromPrimitive, GpioError, Level, PinConfig,
    Pull, PwmConfig, RpcCode,
};
use drv_gpio_mock::MockBackend;
use drv_gpio_server_core::{
    AgentConfig, AuditLog, AuditRecord, Backend, Controller,
};
use hubpack::SerializedSize;
use ringlog::Sink;

/// Events held for `drain_events` before the oldest get dropped.
const EVENT_QUEUE_DEPTH: usize = 256;

#[derive(Parser)]
#[clap(name = "gpio-safety-server")]
struct Args {
    /// Path to the agent's TOML configuration.
    #[clap(long, short)]
    config: Option<PathBuf>,

    /// Listen on this socket path instead of the configured one.
    #[clap(long)]
    listen: Option<PathBuf>,

    /// Force the in-memory mock backend regardless of configuration.
    #[clap(long)]
    mock: bool,
}

struct StderrSink;

impl Sink<AuditRecord> for StderrSink {
    fn record(&self, entry: &AuditRecord) {
        eprintln!("{entry}");
    }
}

struct Agent {
    controller: Controller,
    default_pull: Pull,
    // Shared with the handlers the agent installs; they outlive any one
    // connection.
    events: Arc<Mutex<VecDeque<Event>>>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AgentConfig::default(),
    };
    if args.mock {
        config.mock_mode = true;
    }
    if let Some(listen) = &args.listen {
        config.listen_path = listen.display().to_string();
    }

    let backend = if config.mock_mode {
        Backend::Mock(Arc::new(MockBackend::new()))
    } else {
        Backend::Bcm2711(Arc::new(
            Bcm2711Backend::open()
                .context("opening the GPIO device nodes")?,
        ))
    };

    let audit = Arc::new(AuditLog::with_sink(
        config.audit_ring_entries,
        Box::new(StderrSink),
    ));
    let agent = Arc::new(Agent {
        controller: Controller::new(
            backend,
            config.policy_config(),
            audit,
            config.audit_enabled,
        ),
        default_pull: config.default_pull_mode,
        events: Arc::new(Mutex::new(VecDeque::new())),
    });

    agent
        .controller
        .start_event_loop()
        .map_err(|e| anyhow::anyhow!("starting the event loop: {e}"))?;

    // Shutdown must land every output Low even on an interrupt.
    let signal_agent = Arc::clone(&agent);
    ctrlc::set_handler(move || {
        signal_agent.controller.close();
        std::process::exit(0);
    })
    .context("installing the shutdown handler")?;

    let _ = std::fs::remove_file(&config.listen_path);
    let listener = UnixListener::bind(&config.listen_path)
        .with_context(|| format!("binding {}", config.listen_path))?;

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let agent = Arc::clone(&agent);
                std::thread::spawn(move || {
                    let _ = serve_connection(&agent, stream);
                });
            }
            Err(e) => {
                eprintln!("accept failed: {e}");
            }
        }
    }
    Ok(())
}

fn serve_connection(agent: &Agent, mut stream: UnixStream) -> Result<()> {
    loop {
        let mut len_bytes = [0u8; 4];
        if stream.read_exact(&mut len_bytes).is_err() {
            // Peer hung up between frames; a normal end of session.
            return Ok(());
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len < core::mem::size_of::<RequestHeader>() || len > MAX_FRAME {
            bail!("bad frame length {len}");
        }

        let mut frame = vec![0u8; len];
        stream.read_exact(&mut frame)?;

        let (header, body) = RequestHeader::read_from_prefix(&frame)
            .map_err(|_| anyhow::anyhow!("truncated request header"))?;

        let (code, detail, payload) = if header.version != WIRE_VERSION {
            (RpcCode::InvalidArgument, GpioError::BadMessage as u32, Vec::new())
        } else {
            match dispatch(agent, &header, body) {
                Ok(payload) => (RpcCode::Ok, 0, payload),
                Err(e) => (RpcCode::from(e), u32::from(e), Vec::new()),
            }
        };

        let response = ResponseHeader {
            version: WIRE_VERSION,
            code: code as u8,
            detail: U32::new(detail),
            request_id: header.request_id,
            payload_len: U16::new(payload.len() as u16),
        };
        let total =
            (core::mem::size_of::<ResponseHeader>() + payload.len()) as u32;
        stream.write_all(&total.to_le_bytes())?;
        stream.write_all(response.as_bytes())?;
        stream.write_all(&payload)?;
    }
}

/// Parses the operation's fixed request struct off the front of `body`.
fn parse<T: FromBytes + zerocopy::KnownLayout + zerocopy::Immutable>(
    body: &[u8],
) -> Result<(T, &[u8]), GpioError> {
    T::read_from_prefix(body).map_err(|_| GpioError::BadMessage)
}

fn encode<T: serde::Serialize + SerializedSize>(
    value: &T,
) -> Result<Vec<u8>, GpioError> {
    let mut buf = vec![0u8; T::MAX_SIZE];
    let n = hubpack::serialize(&mut buf, value)
        .map_err(|_| GpioError::BadMessage)?;
    buf.truncate(n);
    Ok(buf)
}

fn dispatch(
    agent: &Agent,
    header: &RequestHeader,
    body: &[u8],
) -> Result<Vec<u8>, GpioError> {
    let op = Op::from_u16(header.op.get()).ok_or(GpioError::BadMessage)?;
    let caller_raw = header.caller;
    let caller = decode_caller(&caller_raw);
    let c = &agent.controller;

    match op {
        Op::Configure => {
            let (req, _) = parse::<wire::ConfigureRequest>(body)?;
            let direction = Direction::from_u8(req.direction)
                .ok_or(GpioError::BadMessage)?;
            // A request may leave the bias to the agent's configured
            // default.
            let pull = match req.pull {
                0xff => agent.default_pull,
                raw => Pull::from_u8(raw).ok_or(GpioError::BadMessage)?,
            };
            let pwm = (req.pwm_enable != 0).then_some(PwmConfig {
                frequency_hz: req.pwm_frequency_hz.get(),
                duty_cycle: req.pwm_duty_cycle,
            });
            c.configure(
                PinConfig {
                    pin: req.pin,
                    direction,
                    pull,
                    pwm,
                    spi: None,
                    i2c: None,
                },
                caller,
            )?;
            Ok(Vec::new())
        }
        Op::Read => {
            let (req, _) = parse::<wire::PinRequest>(body)?;
            let level = c.read(req.pin, caller)?;
            encode(&level)
        }
        Op::Write => {
            let (req, _) = parse::<wire::WriteRequest>(body)?;
            let level =
                Level::from_u8(req.level).ok_or(GpioError::BadMessage)?;
            c.write(req.pin, level, caller)?;
            Ok(Vec::new())
        }
        Op::Toggle => {
            let (req, _) = parse::<wire::PinRequest>(body)?;
            let level = c.toggle(req.pin, caller)?;
            encode(&level)
        }
        Op::SetPwm => {
            let (req, _) = parse::<wire::SetPwmRequest>(body)?;
            c.set_pwm(
                req.pin,
                req.frequency_hz.get(),
                req.duty_cycle,
                caller,
            )?;
            Ok(Vec::new())
        }
        Op::EnableInterrupt => {
            let (req, _) = parse::<wire::EnableInterruptRequest>(body)?;
            let kind =
                EdgeKind::from_u8(req.kind).ok_or(GpioError::BadMessage)?;
            let queue = queue_handler(agent);
            c.enable_interrupt(req.pin, kind, queue, caller)?;
            Ok(Vec::new())
        }
        Op::DisableInterrupt => {
            let (req, _) = parse::<wire::PinRequest>(body)?;
            c.disable_interrupt(req.pin, caller)?;
            Ok(Vec::new())
        }
        Op::GetState => {
            let (req, _) = parse::<wire::PinRequest>(body)?;
            let state = c.get_state(req.pin)?;
            encode(&state)
        }
        Op::ListPins => {
            let states = c.list_configured_pins();
            encode_counted(&states)
        }
        Op::Release => {
            let (req, _) = parse::<wire::PinRequest>(body)?;
            c.release(req.pin, caller)?;
            Ok(Vec::new())
        }
        Op::ReadAnalog => {
            let (req, _) = parse::<wire::ReadAnalogRequest>(body)?;
            let sample = c.read_analog(req.channel, caller)?;
            encode(&sample)
        }
        Op::SpiTransfer => {
            let (req, rest) = parse::<wire::SpiTransferRequest>(body)?;
            let tx = transfer_bytes(rest, req.len.get())?;
            c.spi_transfer(req.channel, tx, caller)
        }
        Op::SpiWrite => {
            let (req, rest) = parse::<wire::SpiTransferRequest>(body)?;
            let tx = transfer_bytes(rest, req.len.get())?;
            c.spi_write(req.channel, tx, caller)?;
            Ok(Vec::new())
        }
        Op::SpiRead => {
            let (req, _) = parse::<wire::SpiTransferRequest>(body)?;
            c.spi_read(req.channel, req.len.get() as usize, caller)
        }
        Op::I2cWrite => {
            let (req, rest) = parse::<wire::I2cTransferRequest>(body)?;
            let data = transfer_bytes(rest, req.len.get())?;
            c.i2c_write(req.bus, req.address, data, caller)?;
            Ok(Vec::new())
        }
        Op::I2cRead => {
            let (req, _) = parse::<wire::I2cTransferRequest>(body)?;
            c.i2c_read(req.bus, req.address, req.len.get() as usize, caller)
        }
        Op::I2cWriteReg => {
            let (req, rest) = parse::<wire::I2cRegRequest>(body)?;
            let data = transfer_bytes(rest, req.len.get())?;
            c.i2c_write_register(
                req.bus,
                req.address,
                req.register,
                data,
                caller,
            )?;
            Ok(Vec::new())
        }
        Op::I2cReadReg => {
            let (req, _) = parse::<wire::I2cRegRequest>(body)?;
            c.i2c_read_register(
                req.bus,
                req.address,
                req.register,
                req.len.get() as usize,
                caller,
            )
        }
        Op::DrainEvents => {
            let drained: Vec<Event> = {
                let mut events = agent.events.lock().unwrap();
                events.drain(..).collect()
            };
            encode_counted(&drained)
        }
    }
}

/// The declared length must match the bytes actually present.
fn transfer_bytes(rest: &[u8], declared: u16) -> Result<&[u8], GpioError> {
    if rest.len() != declared as usize {
        return Err(GpioError::BadMessage);
    }
    Ok(rest)
}

/// `u16` record count, then each record hubpack-encoded.
fn encode_counted<T: serde::Serialize + SerializedSize>(
    records: &[T],
) -> Result<Vec<u8>, GpioError> {
    let mut out = Vec::with_capacity(2 + records.len() * T::MAX_SIZE);
    out.extend_from_slice(&(records.len() as u16).to_le_bytes());
    for record in records {
        out.extend_from_slice(&encode(record)?);
    }
    Ok(out)
}

/// Handler that parks events for `drain_events`, dropping the oldest past
/// the queue depth.
fn queue_handler(agent: &Agent) -> drv_gpio_server_core::Handler {
    let events = Arc::clone(&agent.events);
    Arc::new(move |event| {
        let mut queue = events.lock().unwrap();
        if queue.len() >= EVENT_QUEUE_DEPTH {
            queue.pop_front();
        }
        queue.push_back(event);
    })
}
