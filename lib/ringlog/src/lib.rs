// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for structured driver event records.
//!
//! This is the diagnostic backbone for long-running driver services: a
//! bounded, in-memory ring of recent structured records, with a running
//! per-variant count so that information about overwritten records is not
//! lost entirely. The ring can be inspected at any time via [`RingLog::snapshot`]
//! and [`RingLog::counts`], and an optional [`Sink`] receives every record as
//! it is pushed for forwarding to an external log stream.
//!
//! ## Constraints
//!
//! Records must be `Clone` and `PartialEq`. Consecutive pushes of equal
//! records are collapsed into one entry with an incremented repeat count, so
//! a wedged component that logs the same record in a tight loop cannot erase
//! the history around it.
//!
//! Per-variant counting uses the [`Label`] trait: each record names its
//! variant with a static string, and the ring keeps a total per label even
//! after the record itself has fallen off the end.
//!
//! Records may be pushed from any thread. The ring takes an internal lock on
//! push; sinks are invoked with no lock held.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Names the variant of a record for per-variant counting.
pub trait Label {
    fn label(&self) -> &'static str;
}

/// Receives every record pushed to the ring, after it has been recorded.
/// Implementations must tolerate calls from multiple threads.
pub trait Sink<T>: Send + Sync {
    fn record(&self, entry: &T);
}

/// One stored entry: a record and the number of consecutive times it was
/// pushed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry<T> {
    pub count: u32,
    pub record: T,
}

pub struct RingLog<T> {
    inner: Mutex<Inner<T>>,
    sink: Option<Box<dyn Sink<T>>>,
}

struct Inner<T> {
    entries: Vec<Option<Entry<T>>>,
    // Index of the most recently written slot; next write goes to next+1.
    last: Option<usize>,
    counts: BTreeMap<&'static str, u64>,
    total: u64,
}

impl<T: Clone + PartialEq + Label> RingLog<T> {
    /// Creates a ring holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Mutex::new(Inner {
                entries: vec![None; capacity],
                last: None,
                counts: BTreeMap::new(),
                total: 0,
            }),
            sink: None,
        }
    }

    /// As [`RingLog::new`], forwarding every record to `sink` after it is
    /// stored.
    pub fn with_sink(capacity: usize, sink: Box<dyn Sink<T>>) -> Self {
        let mut ring = Self::new(capacity);
        ring.sink = Some(sink);
        ring
    }

    pub fn push(&self, record: T) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.total += 1;
            *inner.counts.entry(record.label()).or_insert(0) += 1;

            // Collapse a repeat of the most recent record into its count.
            if let Some(last) = inner.last {
                if let Some(entry) = inner.entries[last].as_mut() {
                    if entry.record == record {
                        entry.count = entry.count.saturating_add(1);
                        drop(inner);
                        self.forward(&record);
                        return;
                    }
                }
            }

            let cap = inner.entries.len();
            let slot = match inner.last {
                Some(last) => (last + 1) % cap,
                None => 0,
            };
            inner.entries[slot] = Some(Entry { count: 1, record: record.clone() });
            inner.last = Some(slot);
        }
        self.forward(&record);
    }

    fn forward(&self, record: &T) {
        if let Some(sink) = &self.sink {
            sink.record(record);
        }
    }

    /// Returns the stored entries, oldest first.
    pub fn snapshot(&self) -> Vec<Entry<T>> {
        let inner = self.inner.lock().unwrap();
        let cap = inner.entries.len();
        let mut out = Vec::new();
        if let Some(last) = inner.last {
            // Oldest entry is the slot after the most recent one, wrapping.
            for i in 0..cap {
                let slot = (last + 1 + i) % cap;
                if let Some(entry) = &inner.entries[slot] {
                    out.push(entry.clone());
                }
            }
        }
        out
    }

    /// Total pushes per variant label, including records no longer stored.
    pub fn counts(&self) -> BTreeMap<&'static str, u64> {
        self.inner.lock().unwrap().counts.clone()
    }

    /// Total number of records ever pushed.
    pub fn total(&self) -> u64 {
        self.inner.lock().unwrap().total
    }
}
