// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Audit record vocabulary.
//!
//! Every policy decision and notable controller action is pushed into a
//! [`ringlog::RingLog`] of these records. The ring is the in-process record
//! of recent history; an external log stream gets the same records through
//! the ring's sink. Nothing here persists anything.

use ringlog::{Label, RingLog};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AuditKind {
    /// Operation passed every policy check.
    Admitted,
    /// Rejected by the critical/restricted/allow-list checks.
    PolicyDenied,
    /// Rejected at the concurrency cap.
    CapacityDenied,
    /// Rejected by the operation allow-list.
    OperationDenied,
    /// Backend reported a fault.
    HardwareFault,
    /// Edge event delivered to a handler.
    EventDelivered,
    /// Shutdown progress, one record per step.
    Shutdown,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::Admitted => "admitted",
            AuditKind::PolicyDenied => "policy_denied",
            AuditKind::CapacityDenied => "capacity_denied",
            AuditKind::OperationDenied => "operation_denied",
            AuditKind::HardwareFault => "hardware_fault",
            AuditKind::EventDelivered => "event_delivered",
            AuditKind::Shutdown => "shutdown",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuditRecord {
    pub kind: AuditKind,
    pub message: &'static str,
    /// Caller label from the request; audit only, carries no authority.
    pub caller: String,
    pub pin: Option<u8>,
    /// UTC microseconds since the epoch.
    pub timestamp: u64,
    pub request_id: Option<u32>,
}

impl Label for AuditRecord {
    fn label(&self) -> &'static str {
        self.kind.as_str()
    }
}

impl core::fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "ts={} event={} caller={:?} msg={:?}",
            self.timestamp,
            self.kind.as_str(),
            self.caller,
            self.message
        )?;
        if let Some(pin) = self.pin {
            write!(f, " pin={pin}")?;
        }
        if let Some(id) = self.request_id {
            write!(f, " request_id={id}")?;
        }
        Ok(())
    }
}

pub type AuditLog = RingLog<AuditRecord>;

/// UTC wall-clock in microseconds, the resolution all boundary timestamps
/// use.
pub fn now_micros() -> u64 {
    chrono::Utc::now().timestamp_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_formats_optional_fields() {
        let record = AuditRecord {
            kind: AuditKind::PolicyDenied,
            message: "operation denied: critical system pin",
            caller: "tester".into(),
            pin: Some(14),
            timestamp: 1,
            request_id: None,
        };
        let text = record.to_string();
        assert!(text.contains("event=policy_denied"));
        assert!(text.contains("pin=14"));
        assert!(!text.contains("request_id"));
    }
}
