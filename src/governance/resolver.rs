//! Scope resolution and the reservation lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{GatewayConfig, ScopeLimits};
use crate::error::{GatewayError, GatewayResult};
use crate::types::RequestContext;

use super::counters::{BudgetCounter, RateCounter};

/// The counters attached to one scope.
#[derive(Debug, Clone, Default)]
struct ScopeCounters {
    label: String,
    budget: Option<Arc<BudgetCounter>>,
    tokens: Option<Arc<RateCounter>>,
    requests: Option<Arc<RateCounter>>,
}

impl ScopeCounters {
    fn from_limits(label: impl Into<String>, limits: &ScopeLimits) -> Self {
        let budget = limits.budget.as_ref().map(|b| {
            Arc::new(BudgetCounter::new(
                b.max_limit,
                b.reset_duration,
                b.current_usage,
            ))
        });
        let (tokens, requests) = match &limits.rate_limit {
            Some(rl) => (
                rl.token_max_limit
                    .map(|max| Arc::new(RateCounter::new(max, rl.token_reset_duration))),
                rl.request_max_limit
                    .map(|max| Arc::new(RateCounter::new(max, rl.request_reset_duration))),
            ),
            None => (None, None),
        };
        Self {
            label: label.into(),
            budget,
            tokens,
            requests,
        }
    }

    fn is_empty(&self) -> bool {
        self.budget.is_none() && self.tokens.is_none() && self.requests.is_none()
    }
}

#[derive(Debug)]
struct VirtualKeyEntry {
    id: String,
    team_id: Option<String>,
    customer_id: Option<String>,
    counters: ScopeCounters,
}

/// Process-wide governance state, rebuilt per config snapshot. Counters
/// are `Arc`-shared so an in-flight reservation survives a snapshot swap.
#[derive(Debug, Default)]
pub struct GovernanceStore {
    /// Keyed by the opaque virtual-key value callers present.
    virtual_keys: HashMap<String, VirtualKeyEntry>,
    teams: HashMap<String, (Option<String>, ScopeCounters)>,
    customers: HashMap<String, ScopeCounters>,
    global: Option<ScopeCounters>,
    providers: HashMap<String, ScopeCounters>,
    count_failed_requests: bool,
    reservation_usd: f64,
}

impl GovernanceStore {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut store = Self::default();
        for provider in &config.providers {
            if let Some(limits) = &provider.governance {
                let counters =
                    ScopeCounters::from_limits(format!("provider:{}", provider.name), limits);
                if !counters.is_empty() {
                    store.providers.insert(provider.name.clone(), counters);
                }
            }
        }
        let Some(governance) = &config.governance else {
            return store;
        };
        store.count_failed_requests = governance.count_failed_requests;
        store.reservation_usd = governance.budget_reservation_usd;

        for vk in &governance.virtual_keys {
            let Some(key) = &vk.key else {
                tracing::warn!(
                    target: "bifrost::governance",
                    "virtual key '{}' has no key value, skipping",
                    vk.id
                );
                continue;
            };
            store.virtual_keys.insert(
                key.clone(),
                VirtualKeyEntry {
                    id: vk.id.clone(),
                    team_id: vk.parent_team.clone(),
                    customer_id: vk.parent_customer.clone(),
                    counters: ScopeCounters::from_limits(format!("vk:{}", vk.id), &vk.limits),
                },
            );
        }
        for team in &governance.teams {
            store.teams.insert(
                team.id.clone(),
                (
                    team.parent_customer.clone(),
                    ScopeCounters::from_limits(format!("team:{}", team.id), &team.limits),
                ),
            );
        }
        for customer in &governance.customers {
            store.customers.insert(
                customer.id.clone(),
                ScopeCounters::from_limits(format!("customer:{}", customer.id), &customer.limits),
            );
        }
        if let Some(limits) = &governance.global {
            store.global = Some(ScopeCounters::from_limits("global", limits));
        }
        store
    }

    /// Resolve the scope chain and reserve against every applicable scope
    /// in order. On rejection, already-reserved scopes release in reverse
    /// and the request fails with `budget_exceeded` or `rate_limited`.
    pub fn admit(
        &self,
        ctx: &mut RequestContext,
        virtual_key: Option<&str>,
        provider: &str,
    ) -> GatewayResult<Reservation> {
        let mut chain: Vec<ScopeCounters> = Vec::new();

        if let Some(key) = virtual_key {
            let entry = self.virtual_keys.get(key).ok_or_else(|| {
                GatewayError::validation("unknown virtual key")
            })?;
            ctx.virtual_key_id = Some(entry.id.clone());
            chain.push(entry.counters.clone());

            let mut team_id = entry.team_id.clone();
            let mut customer_id = entry.customer_id.clone();
            if let Some(tid) = &team_id {
                if let Some((parent_customer, counters)) = self.teams.get(tid) {
                    chain.push(counters.clone());
                    if customer_id.is_none() {
                        customer_id = parent_customer.clone();
                    }
                } else {
                    team_id = None;
                }
            }
            if let Some(cid) = &customer_id {
                if let Some(counters) = self.customers.get(cid) {
                    chain.push(counters.clone());
                }
            }
            ctx.team_id = team_id;
            ctx.customer_id = customer_id;
        }
        if let Some(global) = &self.global {
            chain.push(global.clone());
        }
        if let Some(provider_scope) = self.providers.get(provider) {
            chain.push(provider_scope.clone());
        }

        let mut reservation = Reservation {
            scopes: Vec::with_capacity(chain.len()),
            budget_amount: self.reservation_usd,
            count_failed_requests: self.count_failed_requests,
            settled: false,
        };

        for counters in chain {
            if let Some(budget) = &counters.budget {
                if !budget.reserve(self.reservation_usd) {
                    reservation.release_reserved();
                    return Err(GatewayError::budget_exceeded(format!(
                        "budget exhausted for scope {}",
                        counters.label
                    )));
                }
            }
            if let Some(tokens) = &counters.tokens {
                // Tokens are unknown at admission; a zero reserve still
                // rejects an exhausted counter.
                if !tokens.reserve(0) {
                    if let Some(budget) = &counters.budget {
                        budget.release(self.reservation_usd);
                    }
                    reservation.release_reserved();
                    return Err(GatewayError::rate_limited(format!(
                        "token rate limit exhausted for scope {}",
                        counters.label
                    )));
                }
            }
            if let Some(requests) = &counters.requests {
                if !requests.reserve(1) {
                    if let Some(budget) = &counters.budget {
                        budget.release(self.reservation_usd);
                    }
                    reservation.release_reserved();
                    return Err(GatewayError::rate_limited(format!(
                        "request rate limit exhausted for scope {}",
                        counters.label
                    )));
                }
            }
            reservation.scopes.push(counters);
        }
        Ok(reservation)
    }

    /// Committed budget usage for a virtual key, for tests and the config
    /// API.
    pub fn virtual_key_usage(&self, key: &str) -> Option<f64> {
        self.virtual_keys
            .get(key)
            .and_then(|entry| entry.counters.budget.as_ref())
            .map(|budget| budget.current_usage())
    }
}

/// A set of per-scope reservations held by one in-flight request.
/// Settled exactly once, by `commit` or `release`.
#[derive(Debug)]
pub struct Reservation {
    scopes: Vec<ScopeCounters>,
    budget_amount: f64,
    count_failed_requests: bool,
    settled: bool,
}

impl Reservation {
    fn release_reserved(&mut self) {
        // Reverse order: the scope reserved last releases first.
        for counters in self.scopes.iter().rev() {
            if let Some(budget) = &counters.budget {
                budget.release(self.budget_amount);
            }
            if let Some(requests) = &counters.requests {
                requests.release(1);
            }
        }
        self.scopes.clear();
    }

    /// Convert reservations into actual charges: budget becomes `cost`,
    /// token counters take `total_tokens`, request reservations become
    /// permanent.
    pub fn commit(mut self, cost: f64, total_tokens: u64) {
        if self.settled {
            return;
        }
        self.settled = true;
        for counters in &self.scopes {
            if let Some(budget) = &counters.budget {
                budget.commit(self.budget_amount, cost);
            }
            if let Some(tokens) = &counters.tokens {
                tokens.add(total_tokens);
            }
            if let Some(requests) = &counters.requests {
                requests.commit(1);
            }
        }
    }

    /// Release on terminal error or cancellation. The request counter
    /// follows the operator's failed-request policy.
    pub fn release(mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        for counters in self.scopes.iter().rev() {
            if let Some(budget) = &counters.budget {
                budget.release(self.budget_amount);
            }
            if let Some(requests) = &counters.requests {
                if self.count_failed_requests {
                    requests.commit(1);
                } else {
                    requests.release(1);
                }
            }
        }
        self.scopes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BudgetConfig, GovernanceConfig, RateLimitConfig, ResetDuration, TenantConfig,
    };
    use std::time::Duration;
    use tokio::time::Instant;

    fn ctx() -> RequestContext {
        RequestContext::new(Instant::now() + Duration::from_secs(30))
    }

    fn config_with_vk(budget: Option<BudgetConfig>, rate: Option<RateLimitConfig>) -> GatewayConfig {
        GatewayConfig {
            governance: Some(GovernanceConfig {
                virtual_keys: vec![TenantConfig {
                    id: "vk1".to_string(),
                    key: Some("bf-vk-secret".to_string()),
                    parent_team: None,
                    parent_customer: None,
                    limits: ScopeLimits {
                        budget,
                        rate_limit: rate,
                    },
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_budget_exceeded_rejects_before_dispatch() {
        let store = GovernanceStore::from_config(&config_with_vk(
            Some(BudgetConfig {
                max_limit: 0.01,
                reset_duration: ResetDuration::Month,
                current_usage: 0.009,
            }),
            None,
        ));
        let mut ctx = ctx();
        let err = store
            .admit(&mut ctx, Some("bf-vk-secret"), "openai")
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::BudgetExceeded);
        assert_eq!(err.status(), 402);
        // No counter moved.
        assert!((store.virtual_key_usage("bf-vk-secret").unwrap() - 0.009).abs() < 1e-12);
    }

    #[test]
    fn test_commit_charges_actual_cost() {
        let store = GovernanceStore::from_config(&config_with_vk(
            Some(BudgetConfig {
                max_limit: 1.0,
                reset_duration: ResetDuration::Day,
                current_usage: 0.0,
            }),
            None,
        ));
        let mut ctx = ctx();
        let reservation = store.admit(&mut ctx, Some("bf-vk-secret"), "openai").unwrap();
        assert_eq!(ctx.virtual_key_id.as_deref(), Some("vk1"));
        reservation.commit(0.002, 150);
        assert!((store.virtual_key_usage("bf-vk-secret").unwrap() - 0.002).abs() < 1e-12);
    }

    #[test]
    fn test_release_leaves_no_charge() {
        let store = GovernanceStore::from_config(&config_with_vk(
            Some(BudgetConfig {
                max_limit: 1.0,
                reset_duration: ResetDuration::Day,
                current_usage: 0.0,
            }),
            Some(RateLimitConfig {
                request_max_limit: Some(1),
                ..Default::default()
            }),
        ));
        let mut ctx = ctx();
        let reservation = store.admit(&mut ctx, Some("bf-vk-secret"), "openai").unwrap();
        reservation.release();
        assert_eq!(store.virtual_key_usage("bf-vk-secret"), Some(0.0));

        // The released request slot is available again.
        let mut ctx2 = ctx;
        let again = store.admit(&mut ctx2, Some("bf-vk-secret"), "openai");
        assert!(again.is_ok());
    }

    #[test]
    fn test_request_rate_limit() {
        let store = GovernanceStore::from_config(&config_with_vk(
            None,
            Some(RateLimitConfig {
                request_max_limit: Some(2),
                ..Default::default()
            }),
        ));
        let mut ctx1 = ctx();
        let r1 = store.admit(&mut ctx1, Some("bf-vk-secret"), "openai").unwrap();
        let mut ctx2 = ctx();
        let r2 = store.admit(&mut ctx2, Some("bf-vk-secret"), "openai").unwrap();
        let mut ctx3 = ctx();
        let err = store
            .admit(&mut ctx3, Some("bf-vk-secret"), "openai")
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::RateLimited);
        r1.commit(0.0, 10);
        r2.release();
    }

    #[test]
    fn test_unknown_virtual_key_is_validation_error() {
        let store = GovernanceStore::from_config(&config_with_vk(None, None));
        let mut ctx = ctx();
        let err = store.admit(&mut ctx, Some("wrong"), "openai").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_requests_without_virtual_key_hit_global_scope() {
        let mut config = GatewayConfig::default();
        config.governance = Some(GovernanceConfig {
            global: Some(ScopeLimits {
                rate_limit: Some(RateLimitConfig {
                    request_max_limit: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        let store = GovernanceStore::from_config(&config);
        let mut ctx1 = ctx();
        let r1 = store.admit(&mut ctx1, None, "openai").unwrap();
        let mut ctx2 = ctx();
        assert!(store.admit(&mut ctx2, None, "openai").is_err());
        r1.release();
    }
}
