//! Budget and rate-limit counters.
//!
//! Counters are per-scope and never shared across scopes. Mutation happens
//! under a narrowly scoped per-counter lock, so a reserve-then-commit
//! sequence is observable atomically and no two commits cross-interleave
//! on the same counter. Reset periods elapse lazily: every operation
//! checks the period before evaluating.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::config::ResetDuration;

#[derive(Debug)]
struct BudgetState {
    current: f64,
    reserved: f64,
    period_start: DateTime<Utc>,
}

/// USD budget counter for one scope.
#[derive(Debug)]
pub struct BudgetCounter {
    max_limit: f64,
    reset: ResetDuration,
    state: Mutex<BudgetState>,
}

impl BudgetCounter {
    pub fn new(max_limit: f64, reset: ResetDuration, seed_usage: f64) -> Self {
        Self {
            max_limit,
            reset,
            state: Mutex::new(BudgetState {
                current: seed_usage,
                reserved: 0.0,
                period_start: Utc::now(),
            }),
        }
    }

    fn maybe_reset(&self, state: &mut BudgetState) {
        let now = Utc::now();
        if self.reset.has_elapsed(state.period_start, now) {
            state.current = 0.0;
            state.period_start = now;
        }
    }

    /// Reserve `amount` USD. Fails when the reservation would push the
    /// counter past its limit within the current period.
    pub fn reserve(&self, amount: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        self.maybe_reset(&mut state);
        if state.current + state.reserved + amount > self.max_limit {
            return false;
        }
        state.reserved += amount;
        true
    }

    /// Convert a reservation into an actual charge.
    pub fn commit(&self, reserved: f64, actual: f64) {
        let mut state = self.state.lock().unwrap();
        state.reserved = (state.reserved - reserved).max(0.0);
        state.current += actual;
    }

    /// Release a reservation without charging.
    pub fn release(&self, reserved: f64) {
        let mut state = self.state.lock().unwrap();
        state.reserved = (state.reserved - reserved).max(0.0);
    }

    /// Committed usage in the current period.
    pub fn current_usage(&self) -> f64 {
        self.state.lock().unwrap().current
    }
}

#[derive(Debug)]
struct RateState {
    current: u64,
    reserved: u64,
    period_start: DateTime<Utc>,
}

/// Token or request rate counter for one scope.
#[derive(Debug)]
pub struct RateCounter {
    max_limit: u64,
    reset: ResetDuration,
    state: Mutex<RateState>,
}

impl RateCounter {
    pub fn new(max_limit: u64, reset: ResetDuration) -> Self {
        Self {
            max_limit,
            reset,
            state: Mutex::new(RateState {
                current: 0,
                reserved: 0,
                period_start: Utc::now(),
            }),
        }
    }

    fn maybe_reset(&self, state: &mut RateState) {
        let now = Utc::now();
        if self.reset.has_elapsed(state.period_start, now) {
            state.current = 0;
            state.period_start = now;
        }
    }

    /// Reserve `n` units. `n = 0` still checks that the counter has not
    /// already exhausted its period (the token-limit admission case, where
    /// the eventual charge is unknown).
    pub fn reserve(&self, n: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        self.maybe_reset(&mut state);
        if n == 0 {
            return state.current + state.reserved < self.max_limit;
        }
        if state.current + state.reserved + n > self.max_limit {
            return false;
        }
        state.reserved += n;
        true
    }

    /// Make a reservation permanent.
    pub fn commit(&self, reserved: u64) {
        let mut state = self.state.lock().unwrap();
        state.reserved = state.reserved.saturating_sub(reserved);
        state.current += reserved;
    }

    /// Charge units that were never reserved (post-response token
    /// reconciliation). May overshoot the limit; the next reserve rejects.
    pub fn add(&self, n: u64) {
        let mut state = self.state.lock().unwrap();
        self.maybe_reset(&mut state);
        state.current += n;
    }

    /// Release a reservation without charging.
    pub fn release(&self, reserved: u64) {
        let mut state = self.state.lock().unwrap();
        state.reserved = state.reserved.saturating_sub(reserved);
    }

    pub fn current_usage(&self) -> u64 {
        self.state.lock().unwrap().current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_budget_reserve_commit() {
        let budget = BudgetCounter::new(1.0, ResetDuration::Hour, 0.0);
        assert!(budget.reserve(0.4));
        budget.commit(0.4, 0.25);
        assert!((budget.current_usage() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_budget_rejects_over_limit() {
        let budget = BudgetCounter::new(0.01, ResetDuration::Hour, 0.009);
        assert!(!budget.reserve(0.005));
        // Nothing was reserved; usage unchanged.
        assert!((budget.current_usage() - 0.009).abs() < f64::EPSILON);
    }

    #[test]
    fn test_budget_release_restores_headroom() {
        let budget = BudgetCounter::new(1.0, ResetDuration::Hour, 0.0);
        assert!(budget.reserve(0.9));
        assert!(!budget.reserve(0.2));
        budget.release(0.9);
        assert!(budget.reserve(0.2));
    }

    #[test]
    fn test_rate_counter_request_flow() {
        let counter = RateCounter::new(2, ResetDuration::Hour);
        assert!(counter.reserve(1));
        assert!(counter.reserve(1));
        assert!(!counter.reserve(1));
        counter.commit(1);
        counter.release(1);
        assert_eq!(counter.current_usage(), 1);
        assert!(counter.reserve(1));
    }

    #[test]
    fn test_token_counter_zero_reserve_checks_exhaustion() {
        let counter = RateCounter::new(100, ResetDuration::Hour);
        assert!(counter.reserve(0));
        counter.add(100);
        assert!(!counter.reserve(0));
    }

    #[test]
    fn test_concurrent_commits_sum_exactly() {
        // Across N concurrent reserve/commit pairs the counter equals the
        // sum of committed usages: no double-count, no leak.
        let counter = Arc::new(RateCounter::new(10_000, ResetDuration::Hour));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    assert!(counter.reserve(1));
                    counter.commit(1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.current_usage(), 800);
    }
}
