// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core of the per-node GPIO safety service.
//!
//! Everything hardware-facing goes through one [`Controller`], which
//! composes the safety policy, the state registry, the PWM engines, and
//! the edge dispatcher over a [`Backend`]. The agent binary wraps this
//! library with a wire protocol; embedding it directly works too and is
//! how the tests drive it.
//!
//! The backend binding is fixed at startup, so it is a sealed variant
//! rather than a trait object: call sites stay monomorphic and the match
//! in [`Backend::pins`] is the only dispatch point.

mod audit;
mod config;
mod controller;
mod interrupt;
mod policy;
mod pwm;
mod registry;

use std::sync::Arc;

use drv_bcm2711_gpio::Bcm2711Backend;
use drv_gpio_api::PinBackend;
use drv_gpio_mock::MockBackend;

pub use audit::{now_micros, AuditKind, AuditLog, AuditRecord};
pub use config::{AgentConfig, ConfigError, PolicySection};
pub use controller::Controller;
pub use interrupt::Handler;
pub use policy::{OpClass, OpGuard, PolicyConfig, SafetyPolicy};
pub use registry::Registry;

/// The two backend bindings. Cloning shares the underlying adapter; the
/// PWM engines and edge waiters each hold a clone.
#[derive(Clone)]
pub enum Backend {
    Bcm2711(Arc<Bcm2711Backend>),
    Mock(Arc<MockBackend>),
}

impl Backend {
    pub fn pins(&self) -> &dyn PinBackend {
        match self {
            Backend::Bcm2711(b) => b.as_ref(),
            Backend::Mock(b) => b.as_ref(),
        }
    }
}
