//! Governance accounting through the full request path.

mod common;

use std::sync::Arc;

use bifrost::config::{
    BudgetConfig, GatewayConfig, GovernanceConfig, KeyConfig, ModelPricing, ProviderConfig,
    RateLimitConfig, ResetDuration, ScopeLimits, TenantConfig,
};
use bifrost::coordinator::{GatewayBuilder, IngressContext};
use bifrost::error::ErrorKind;
use bifrost::types::{GatewayRequest, Message};

use common::MockAdapter;

fn config_with_vk(limits: ScopeLimits) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config
        .providers
        .push(ProviderConfig::named("openai").with_key(KeyConfig::new("primary", "sk-test")));
    config.pricing.insert(
        "openai/gpt-4o-mini".to_string(),
        ModelPricing {
            input_cost_per_token: 1.0e-6,
            output_cost_per_token: 2.0e-6,
        },
    );
    config.governance = Some(GovernanceConfig {
        virtual_keys: vec![TenantConfig {
            id: "vk1".to_string(),
            key: Some("bf-vk-1".to_string()),
            parent_team: None,
            parent_customer: None,
            limits,
        }],
        ..Default::default()
    });
    config
}

fn ingress() -> IngressContext {
    IngressContext {
        virtual_key: Some("bf-vk-1".to_string()),
        ..Default::default()
    }
}

fn chat_request() -> GatewayRequest {
    GatewayRequest::chat("openai", "gpt-4o-mini", vec![Message::user("Hello")])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_commits_sum_exactly() {
    let limits = ScopeLimits {
        budget: Some(BudgetConfig {
            max_limit: 10.0,
            reset_duration: ResetDuration::Day,
            current_usage: 0.0,
        }),
        rate_limit: None,
    };
    let adapter = Arc::new(MockAdapter::new("openai"));
    let gateway = Arc::new(
        GatewayBuilder::new(config_with_vk(limits))
            .with_adapter("openai", adapter.clone())
            .build()
            .await
            .unwrap(),
    );

    let n = 12;
    let mut tasks = Vec::new();
    for _ in 0..n {
        let gateway = gateway.clone();
        tasks.push(tokio::spawn(async move {
            gateway.execute(chat_request(), ingress()).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // The mock reports usage (7 prompt, 5 completion); with the test
    // pricing every request costs 7e-6 + 10e-6 USD. N concurrent commits
    // against one counter must sum exactly: no double-count, no leak.
    let per_request = 7.0 * 1.0e-6 + 5.0 * 2.0e-6;
    assert_eq!(adapter.calls(), n);
    let usage = gateway.virtual_key_usage("bf-vk-1").unwrap();
    assert!((usage - per_request * n as f64).abs() < 1e-12);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_failed_requests_release_reservations() {
    let limits = ScopeLimits {
        budget: Some(BudgetConfig {
            // Headroom for exactly one reservation at a time.
            max_limit: 0.006,
            reset_duration: ResetDuration::Day,
            current_usage: 0.0,
        }),
        rate_limit: None,
    };
    let adapter = Arc::new(MockAdapter::new("openai"));
    let gateway = GatewayBuilder::new(config_with_vk(limits))
        .with_adapter("openai", adapter.clone())
        .build()
        .await
        .unwrap();

    // Every attempt fails permanently; the reservation must be released
    // each time, so repeated requests keep being admitted.
    for _ in 0..5 {
        adapter.push(Err(bifrost::GatewayError::permanent("down")));
        let err = gateway.execute(chat_request(), ingress()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderPermanent);
    }
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_request_rate_limit_enforced_across_requests() {
    let limits = ScopeLimits {
        budget: None,
        rate_limit: Some(RateLimitConfig {
            request_max_limit: Some(2),
            request_reset_duration: ResetDuration::Hour,
            ..Default::default()
        }),
    };
    let adapter = Arc::new(MockAdapter::new("openai"));
    let gateway = GatewayBuilder::new(config_with_vk(limits))
        .with_adapter("openai", adapter.clone())
        .build()
        .await
        .unwrap();

    gateway.execute(chat_request(), ingress()).await.unwrap();
    gateway.execute(chat_request(), ingress()).await.unwrap();
    let err = gateway.execute(chat_request(), ingress()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RateLimited);
    assert_eq!(err.status(), 429);
    assert_eq!(adapter.calls(), 2);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_token_usage_reconciles_into_token_counter() {
    let limits = ScopeLimits {
        budget: None,
        rate_limit: Some(RateLimitConfig {
            // The mock reports 12 total tokens per request; two requests
            // exhaust a 20-token budget.
            token_max_limit: Some(20),
            token_reset_duration: ResetDuration::Hour,
            ..Default::default()
        }),
    };
    let adapter = Arc::new(MockAdapter::new("openai"));
    let gateway = GatewayBuilder::new(config_with_vk(limits))
        .with_adapter("openai", adapter.clone())
        .build()
        .await
        .unwrap();

    gateway.execute(chat_request(), ingress()).await.unwrap();
    gateway.execute(chat_request(), ingress()).await.unwrap();
    let err = gateway.execute(chat_request(), ingress()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::RateLimited);
    gateway.shutdown().await;
}
