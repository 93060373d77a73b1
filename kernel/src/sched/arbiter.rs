//! Core arbiter
//!
//! Picks the target core for newly enqueued processes. The stock policy is
//! round-robin over the cores that completed bring-up; the policy knob
//! exists so a least-loaded arbiter can slot in without touching callers.

use core::sync::atomic::Ordering;

use spin::Mutex;

use crate::arch::x86_64::percpu::{cpu_get, PerCore, CORES_UP};

/// Arbitration policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterPolicy {
    RoundRobin,
}

/// Core selection state.
pub struct CoreArbiter {
    policy: ArbiterPolicy,
    rr_id: usize,
}

impl CoreArbiter {
    pub const fn new(policy: ArbiterPolicy) -> Self {
        Self { policy, rr_id: 0 }
    }

    /// Pick the next core index out of `ncores`, advancing the sliding
    /// index and wrapping at the end.
    pub fn pick_index(&mut self, ncores: usize) -> usize {
        match self.policy {
            ArbiterPolicy::RoundRobin => {
                if ncores == 0 {
                    return 0;
                }
                if self.rr_id >= ncores {
                    // Wrapped: hand out core 0 and make the next pick 1.
                    self.rr_id = 1;
                    0
                } else {
                    let picked = self.rr_id;
                    self.rr_id += 1;
                    picked
                }
            }
        }
    }
}

static ARBITER: Mutex<CoreArbiter> = Mutex::new(CoreArbiter::new(ArbiterPolicy::RoundRobin));

/// Select the core the next enqueue should target.
pub fn pick() -> Option<&'static PerCore> {
    let ncores = CORES_UP.load(Ordering::Acquire);
    let idx = ARBITER.lock().pick_index(ncores);
    cpu_get(idx).or_else(|| cpu_get(0))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn round_robin_rotates_and_wraps() {
        let mut arb = CoreArbiter::new(ArbiterPolicy::RoundRobin);
        let picks: alloc::vec::Vec<usize> = (0..7).map(|_| arb.pick_index(3)).collect();
        assert_eq!(picks, [0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn single_core_always_picks_zero() {
        let mut arb = CoreArbiter::new(ArbiterPolicy::RoundRobin);
        for _ in 0..4 {
            assert_eq!(arb.pick_index(1), 0);
        }
    }
}
