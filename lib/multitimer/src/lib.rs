// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A timer multiplexer.
//!
//! `Multitimer` wraps a single timing resource (here, one parked background
//! thread) and treats it as an arbitrary number of independent one-shot
//! timers. Deadlines are set with an action to run when they elapse; actions
//! fire on the timer thread, in deadline order, with no lock held.
//!
//! The expected usage model is:
//!
//! - Create one `Multitimer` per subsystem that needs out-of-band deadlines.
//!
//! - Call [`Multitimer::set`] to schedule an action, keeping the returned
//!   [`TimerId`] if you may want to cancel it.
//!
//! - Call [`Multitimer::clear`] to cancel a pending timer. Clearing a timer
//!   that already fired returns `false` and does nothing.
//!
//! Actions must be quick and must not block: every pending deadline shares
//! the one thread, and a slow action delays all later ones. Anything heavier
//! than flipping an atomic or pushing to a channel belongs elsewhere.
//!
//! Dropping the `Multitimer` stops the thread. Pending actions that have not
//! reached their deadline by then are discarded, not fired.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Instant;

/// Identifies one pending timer for cancellation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct TimerId(u64);

type Action = Box<dyn FnOnce() + Send>;

pub struct Multitimer {
    shared: Arc<Shared>,
    join: Option<thread::JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

struct State {
    pending: BinaryHeap<Pending>,
    next_id: u64,
    shutdown: bool,
}

struct Pending {
    deadline: Instant,
    id: u64,
    action: Option<Action>,
}

// BinaryHeap is a max-heap; invert the ordering so the earliest deadline is
// at the top. Ties break toward the earlier id, preserving set order.
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.id.cmp(&self.id))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for Pending {}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Multitimer {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                pending: BinaryHeap::new(),
                next_id: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name("multitimer".to_string())
            .spawn(move || run(&thread_shared))
            .expect("spawning the multitimer thread");

        Self {
            shared,
            join: Some(join),
        }
    }

    /// Schedules `action` to run at `deadline`. A deadline in the past fires
    /// on the timer thread's next pass, which is immediate in practice.
    pub fn set(
        &self,
        deadline: Instant,
        action: Box<dyn FnOnce() + Send>,
    ) -> TimerId {
        let mut state = self.shared.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.pending.push(Pending {
            deadline,
            id,
            action: Some(action),
        });
        // The new deadline may now be the earliest; reprice the thread's wait.
        self.shared.wakeup.notify_one();
        TimerId(id)
    }

    /// Cancels a pending timer. Returns `true` if the timer had not yet
    /// fired; its action is dropped without running.
    pub fn clear(&self, id: TimerId) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let mut found = false;
        for entry in state.pending.iter() {
            if entry.id == id.0 && entry.action.is_some() {
                found = true;
                break;
            }
        }
        if found {
            // BinaryHeap has no removal; tombstone the entry and let the
            // timer thread discard it when it surfaces.
            let drained: Vec<Pending> = state.pending.drain().collect();
            state.pending.extend(drained.into_iter().map(|mut p| {
                if p.id == id.0 {
                    p.action = None;
                }
                p
            }));
        }
        found
    }

    /// Number of deadlines that have not yet fired or been cancelled.
    pub fn pending(&self) -> usize {
        let state = self.shared.state.lock().unwrap();
        state.pending.iter().filter(|p| p.action.is_some()).count()
    }
}

impl Default for Multitimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Multitimer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.wakeup.notify_one();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }

        // Fire everything that is due, collecting actions so they run after
        // the lock is released.
        let now = Instant::now();
        let mut due: Vec<Action> = Vec::new();
        while let Some(head) = state.pending.peek() {
            if head.deadline > now {
                break;
            }
            let mut entry = state.pending.pop().unwrap();
            if let Some(action) = entry.action.take() {
                due.push(action);
            }
        }

        if !due.is_empty() {
            drop(state);
            for action in due {
                action();
            }
            state = shared.state.lock().unwrap();
            continue;
        }

        state = match state.pending.peek().map(|p| p.deadline) {
            Some(next) => {
                let timeout = next.saturating_duration_since(now);
                shared.wakeup.wait_timeout(state, timeout).unwrap().0
            }
            None => shared.wakeup.wait(state).unwrap(),
        };
    }
}
