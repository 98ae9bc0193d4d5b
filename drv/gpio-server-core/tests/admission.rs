// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Admission-counter properties under fuzzed concurrent arrival patterns.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::collection::vec;
use proptest::prelude::*;

use drv_gpio_server_core::{OpClass, PolicyConfig, SafetyPolicy};

#[derive(Debug, Clone, Copy)]
struct Arrival {
    delay_ms: u64,
    hold_ms: u64,
}

fn arrival() -> impl Strategy<Value = Arrival> {
    (0u64..15, 0u64..25).prop_map(|(delay_ms, hold_ms)| Arrival {
        delay_ms,
        hold_ms,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// However callers arrive, the number of concurrently admitted
    /// operations never exceeds the cap, and the counter drains to zero
    /// once everyone is done.
    #[test]
    fn admitted_count_never_exceeds_the_cap(
        cap in 1u32..4,
        arrivals in vec(arrival(), 4..24),
    ) {
        let policy = Arc::new(SafetyPolicy::new(
            PolicyConfig {
                max_concurrent_ops: cap,
                operation_timeout: Duration::from_millis(500),
                ..PolicyConfig::default()
            },
            None,
        ));

        let violated = Arc::new(AtomicBool::new(false));
        let rejected = Arc::new(AtomicU32::new(0));

        // A sampler races the workers, watching the counter.
        let sampler_policy = Arc::clone(&policy);
        let sampler_violated = Arc::clone(&violated);
        let sampling = Arc::new(AtomicBool::new(true));
        let sampler_running = Arc::clone(&sampling);
        let sampler = std::thread::spawn(move || {
            while sampler_running.load(Ordering::Acquire) {
                if sampler_policy.active_ops() > cap {
                    sampler_violated.store(true, Ordering::Release);
                }
                std::thread::yield_now();
            }
        });

        let workers: Vec<_> = arrivals
            .iter()
            .copied()
            .map(|a| {
                let policy = Arc::clone(&policy);
                let violated = Arc::clone(&violated);
                let rejected = Arc::clone(&rejected);
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(a.delay_ms));
                    match policy.admit(
                        OpClass::Write,
                        Some(18),
                        27,
                        "fuzz",
                        None,
                    ) {
                        Ok(guard) => {
                            if policy.active_ops() > cap {
                                violated.store(true, Ordering::Release);
                            }
                            std::thread::sleep(Duration::from_millis(
                                a.hold_ms,
                            ));
                            drop(guard);
                        }
                        Err(_) => {
                            rejected.fetch_add(1, Ordering::AcqRel);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        sampling.store(false, Ordering::Release);
        sampler.join().unwrap();

        prop_assert!(!violated.load(Ordering::Acquire));
        prop_assert_eq!(policy.active_ops(), 0);

        // Rejections are bounce-and-done: nothing leaks into the counter.
        prop_assert!(
            rejected.load(Ordering::Acquire) <= arrivals.len() as u32
        );
    }

    /// Abandoned admissions drain at the operation timeout and a retry
    /// then succeeds.
    #[test]
    fn abandoned_slots_drain(cap in 1u32..3) {
        let policy = SafetyPolicy::new(
            PolicyConfig {
                max_concurrent_ops: cap,
                operation_timeout: Duration::from_millis(50),
                ..PolicyConfig::default()
            },
            None,
        );

        for _ in 0..cap {
            let guard = policy
                .admit(OpClass::Configure, Some(18), 27, "fuzz", None)
                .unwrap();
            std::mem::forget(guard);
        }
        prop_assert!(policy
            .admit(OpClass::Configure, Some(18), 27, "fuzz", None)
            .is_err());

        std::thread::sleep(Duration::from_millis(150));
        prop_assert_eq!(policy.active_ops(), 0);
        prop_assert!(policy
            .admit(OpClass::Configure, Some(18), 27, "fuzz", None)
            .is_ok());
    }
}
