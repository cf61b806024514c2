//! Weighted API-key pool with health tracking.
//!
//! Selection is weighted random without replacement per attempt: the pool
//! returns an ordered candidate list, healthy keys first, then degraded
//! keys in the same weighted order. Weights are sampled only within the
//! eligible subset; they are never renormalized across providers.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::KeyConfig;

/// Health state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyHealth {
    Healthy,
    /// Auth/quota failure observed; used only after healthy keys are
    /// exhausted, until the background sweep restores it.
    Degraded,
    /// `list_models` failed on this key. Still usable for inference.
    ListingFailed,
    /// Operator-disabled. Never selected.
    Disabled,
}

/// A selected key handed to an adapter.
#[derive(Debug, Clone)]
pub struct ProviderKey {
    pub id: String,
    pub secret: String,
}

#[derive(Debug)]
struct KeyState {
    config: KeyConfig,
    health: KeyHealth,
    #[allow(dead_code)]
    last_error: Option<DateTime<Utc>>,
}

impl KeyState {
    fn eligible_for(&self, model: &str) -> bool {
        self.config.enabled
            && self.health != KeyHealth::Disabled
            && (self.config.models.is_empty()
                || self.config.models.iter().any(|m| m == model))
    }
}

/// Per-provider key pool.
#[derive(Debug, Clone, Default)]
pub struct KeyPool {
    inner: Arc<RwLock<Vec<KeyState>>>,
}

impl KeyPool {
    pub fn new(keys: Vec<KeyConfig>) -> Self {
        let states = keys
            .into_iter()
            .map(|config| {
                let health = if config.enabled {
                    KeyHealth::Healthy
                } else {
                    KeyHealth::Disabled
                };
                KeyState {
                    config,
                    health,
                    last_error: None,
                }
            })
            .collect();
        Self {
            inner: Arc::new(RwLock::new(states)),
        }
    }

    /// Whether any keys are configured at all. Providers without keys
    /// (local upstreams like Ollama) dispatch keyless.
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }

    /// Ordered candidate list for one attempt: healthy keys in weighted
    /// random order, then degraded/listing-failed keys in weighted random
    /// order.
    pub fn candidates(&self, model: &str) -> Vec<ProviderKey> {
        let inner = self.inner.read().unwrap();
        let healthy: Vec<_> = inner
            .iter()
            .filter(|k| k.eligible_for(model) && k.health == KeyHealth::Healthy)
            .collect();
        let fallback: Vec<_> = inner
            .iter()
            .filter(|k| {
                k.eligible_for(model)
                    && matches!(k.health, KeyHealth::Degraded | KeyHealth::ListingFailed)
            })
            .collect();

        let mut out = weighted_order(&healthy);
        out.extend(weighted_order(&fallback));
        out
    }

    /// Mark a key degraded after an upstream auth/quota failure.
    pub fn mark_degraded(&self, key_id: &str) {
        self.set_health(key_id, KeyHealth::Degraded);
    }

    /// Mark a key after a model-listing failure. It stays usable for
    /// inference.
    pub fn mark_listing_failed(&self, key_id: &str) {
        self.set_health(key_id, KeyHealth::ListingFailed);
    }

    fn set_health(&self, key_id: &str, health: KeyHealth) {
        let mut inner = self.inner.write().unwrap();
        if let Some(state) = inner.iter_mut().find(|k| k.config.id == key_id) {
            if state.health != KeyHealth::Disabled {
                tracing::warn!(
                    target: "bifrost::keys",
                    "key '{}' marked {:?}",
                    key_id,
                    health
                );
                state.health = health;
                state.last_error = Some(Utc::now());
            }
        }
    }

    /// Background health sweep: restore degraded and listing-failed keys
    /// to healthy. Called on the configured interval.
    pub fn restore_degraded(&self) {
        let mut inner = self.inner.write().unwrap();
        for state in inner.iter_mut() {
            if matches!(state.health, KeyHealth::Degraded | KeyHealth::ListingFailed) {
                state.health = KeyHealth::Healthy;
            }
        }
    }

    /// Current health of a key, for tests and introspection.
    pub fn health_of(&self, key_id: &str) -> Option<KeyHealth> {
        self.inner
            .read()
            .unwrap()
            .iter()
            .find(|k| k.config.id == key_id)
            .map(|k| k.health)
    }
}

/// Weighted random order without replacement (Efraimidis-Spirakis: sort by
/// `u^(1/w)` descending).
fn weighted_order(states: &[&KeyState]) -> Vec<ProviderKey> {
    let mut rng = rand::thread_rng();
    let mut keyed: Vec<(f64, ProviderKey)> = states
        .iter()
        .map(|s| {
            let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
            let sort_key = u.powf(1.0 / s.config.weight);
            (
                sort_key,
                ProviderKey {
                    id: s.config.id.clone(),
                    secret: s.config.value.clone(),
                },
            )
        })
        .collect();
    keyed.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    keyed.into_iter().map(|(_, k)| k).collect()
}
