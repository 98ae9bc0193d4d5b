// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Edge event dispatch.
//!
//! Arming a pin records its edge selection and handler and reconfigures the
//! backend's detect unit. While the event loop runs, each armed pin has one
//! waiter thread parked on the backend's edge-wait primitive; on wake it
//! samples the delivered level, builds an [`Event`], and invokes the
//! handler right there on the waiter thread. No registry or dispatcher lock
//! is held during handler invocation, so handlers may call back into the
//! controller; they may also observe state that moved since the edge.
//!
//! The event loop is a cancellable scope owning every waiter. Stopping it
//! cancels and joins them all; handlers already dispatched run to
//! completion. Starting it while it runs is an error.
//!
//! Waiters poll with a short timeout so cancellation and disarm are
//! observed within [`WAIT_SLICE`] even when no edges arrive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use drv_gpio_api::{EdgeKind, Event, GpioError};

use crate::audit::{now_micros, AuditKind, AuditLog, AuditRecord};
use crate::Backend;

const WAIT_SLICE: Duration = Duration::from_millis(100);

pub type Handler = Arc<dyn Fn(Event) + Send + Sync>;

struct Armed {
    kind: EdgeKind,
    handler: Handler,
    // Set on disarm; the waiter exits on its next wake.
    retired: Arc<AtomicBool>,
    waiter: Option<JoinHandle<()>>,
}

struct DispatchState {
    // Cancellation flag of the running scope, if any.
    scope: Option<Arc<AtomicBool>>,
    armed: HashMap<u8, Armed>,
}

pub struct EdgeDispatcher {
    state: Mutex<DispatchState>,
    audit: Option<Arc<AuditLog>>,
}

impl EdgeDispatcher {
    pub fn new(audit: Option<Arc<AuditLog>>) -> Self {
        Self {
            state: Mutex::new(DispatchState {
                scope: None,
                armed: HashMap::new(),
            }),
            audit,
        }
    }

    /// Arms `pin` for `kind`, replacing any previous arming. The waiter
    /// spawns immediately if the event loop is running, otherwise when it
    /// starts.
    pub fn arm(
        &self,
        backend: &Backend,
        pin: u8,
        kind: EdgeKind,
        handler: Handler,
    ) -> Result<(), GpioError> {
        backend.pins().set_edge_detect(pin, Some(kind))?;

        let mut retired_waiter = None;
        {
            let mut state = self.state.lock().unwrap();
            if let Some(mut old) = state.armed.remove(&pin) {
                old.retired.store(true, Ordering::Release);
                retired_waiter = old.waiter.take();
            }

            let mut armed = Armed {
                kind,
                handler,
                retired: Arc::new(AtomicBool::new(false)),
                waiter: None,
            };
            if let Some(scope) = &state.scope {
                armed.waiter = Some(self.spawn_waiter(
                    backend,
                    pin,
                    &armed,
                    Arc::clone(scope),
                ));
            }
            state.armed.insert(pin, armed);
        }

        if let Some(join) = retired_waiter {
            let _ = join.join();
        }
        Ok(())
    }

    /// Disarms `pin`: the detect unit is returned to no-edge and the
    /// waiter, if running, is joined. Returns whether the pin was armed.
    pub fn disarm(
        &self,
        backend: &Backend,
        pin: u8,
    ) -> Result<bool, GpioError> {
        backend.pins().set_edge_detect(pin, None)?;

        let removed = {
            let mut state = self.state.lock().unwrap();
            state.armed.remove(&pin)
        };
        match removed {
            Some(mut armed) => {
                armed.retired.store(true, Ordering::Release);
                if let Some(join) = armed.waiter.take() {
                    let _ = join.join();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_armed(&self, pin: u8) -> bool {
        self.state.lock().unwrap().armed.contains_key(&pin)
    }

    /// Starts the event loop: one waiter per armed pin under a fresh
    /// cancellable scope.
    pub fn start_event_loop(
        &self,
        backend: &Backend,
    ) -> Result<(), GpioError> {
        let mut state = self.state.lock().unwrap();
        if state.scope.is_some() {
            return Err(GpioError::EventLoopRunning);
        }
        let scope = Arc::new(AtomicBool::new(false));

        let pins: Vec<u8> = state.armed.keys().copied().collect();
        for pin in pins {
            let armed = state.armed.get(&pin).unwrap();
            let waiter =
                self.spawn_waiter(backend, pin, armed, Arc::clone(&scope));
            state.armed.get_mut(&pin).unwrap().waiter = Some(waiter);
        }
        state.scope = Some(scope);
        Ok(())
    }

    /// Cancels the running scope and joins every waiter. A loop that is
    /// not running is a quiet no-op, which is what shutdown wants.
    pub fn stop_event_loop(&self) {
        let joins: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock().unwrap();
            let Some(scope) = state.scope.take() else {
                return;
            };
            scope.store(true, Ordering::Release);
            state
                .armed
                .values_mut()
                .filter_map(|armed| armed.waiter.take())
                .collect()
        };
        for join in joins {
            let _ = join.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().scope.is_some()
    }

    fn spawn_waiter(
        &self,
        backend: &Backend,
        pin: u8,
        armed: &Armed,
        scope: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let backend = backend.clone();
        let kind = armed.kind;
        let handler = Arc::clone(&armed.handler);
        let retired = Arc::clone(&armed.retired);
        let audit = self.audit.clone();

        std::thread::Builder::new()
            .name(format!("edge-{pin}"))
            .spawn(move || {
                while !scope.load(Ordering::Acquire)
                    && !retired.load(Ordering::Acquire)
                {
                    match backend.pins().wait_for_edge(pin, WAIT_SLICE) {
                        Ok(Some(level)) => {
                            if !kind.matches(level) {
                                continue;
                            }
                            let event = Event {
                                pin,
                                kind,
                                level,
                                timestamp: now_micros(),
                            };
                            if let Some(audit) = &audit {
                                audit.push(AuditRecord {
                                    kind: AuditKind::EventDelivered,
                                    message: "edge event",
                                    caller: String::new(),
                                    pin: Some(pin),
                                    timestamp: event.timestamp,
                                    request_id: None,
                                });
                            }
                            handler(event);
                        }
                        Ok(None) => continue,
                        Err(_) => {
                            // Closed handle or torn-down pin; this waiter
                            // is done.
                            if let Some(audit) = &audit {
                                audit.push(AuditRecord {
                                    kind: AuditKind::HardwareFault,
                                    message: "edge wait failed",
                                    caller: String::new(),
                                    pin: Some(pin),
                                    timestamp: now_micros(),
                                    request_id: None,
                                });
                            }
                            break;
                        }
                    }
                }
            })
            .expect("spawning an edge waiter")
    }
}
