//! End-to-end coordinator scenarios against mock adapters.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bifrost::config::{
    BudgetConfig, GatewayConfig, GovernanceConfig, KeyConfig, PluginDescriptor, ProviderConfig,
    ResetDuration, RoutingRuleConfig, RuleScope, ScopeLimits, TenantConfig,
};
use bifrost::coordinator::{GatewayBuilder, IngressContext};
use bifrost::error::ErrorKind;
use bifrost::types::{GatewayRequest, Message, Target};

use common::{HookEvent, MockAdapter, RecorderPlugin};

fn provider_with_key(name: &str) -> ProviderConfig {
    ProviderConfig::named(name).with_key(KeyConfig::new("primary", format!("sk-{}", name)))
}

fn chat_request() -> GatewayRequest {
    GatewayRequest::chat("openai", "gpt-4o-mini", vec![Message::user("Hello")])
}

#[tokio::test]
async fn test_simple_chat() {
    let mut config = GatewayConfig::default();
    config.providers.push(provider_with_key("openai"));

    let adapter = Arc::new(MockAdapter::new("openai"));
    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", adapter.clone())
        .build()
        .await
        .unwrap();

    let response = gateway
        .execute(chat_request(), IngressContext::default())
        .await
        .unwrap();

    assert_eq!(response.choices.len(), 1);
    assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
    assert!(response.usage.unwrap().total_tokens > 0);
    assert_eq!(response.provider, "openai");
    assert_eq!(adapter.calls(), 1);
    assert_eq!(adapter.seen_keys(), vec![Some("primary".to_string())]);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_fallback_to_second_provider() {
    let mut config = GatewayConfig::default();
    let mut openai = provider_with_key("openai");
    openai.keys[0].enabled = false;
    config.providers.push(openai);
    config.providers.push(provider_with_key("anthropic"));

    let openai_adapter = Arc::new(MockAdapter::new("openai"));
    let anthropic_adapter = Arc::new(MockAdapter::new("anthropic"));
    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", openai_adapter.clone())
        .with_adapter("anthropic", anthropic_adapter.clone())
        .build()
        .await
        .unwrap();

    let request = chat_request().with_fallbacks(vec![Target::new(
        "anthropic",
        "claude-3-7-sonnet-20250219",
    )]);
    let response = gateway
        .execute(request, IngressContext::default())
        .await
        .unwrap();

    // The only openai key is disabled, so the attempt never reaches the
    // adapter and the fallback serves the request.
    assert_eq!(openai_adapter.calls(), 0);
    assert_eq!(anthropic_adapter.calls(), 1);
    assert_eq!(response.provider, "anthropic");
    assert_eq!(response.model, "claude-3-7-sonnet-20250219");
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_fallbacks_attempted_in_declared_order() {
    let mut config = GatewayConfig::default();
    config.providers.push(provider_with_key("openai"));
    config.providers.push(provider_with_key("groq"));
    config.providers.push(provider_with_key("anthropic"));

    let openai = Arc::new(MockAdapter::new("openai"));
    openai.push(Err(bifrost::GatewayError::permanent("model gone")));
    let groq = Arc::new(MockAdapter::new("groq"));
    groq.push(Err(bifrost::GatewayError::permanent("also gone")));
    let anthropic = Arc::new(MockAdapter::new("anthropic"));

    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", openai.clone())
        .with_adapter("groq", groq.clone())
        .with_adapter("anthropic", anthropic.clone())
        .build()
        .await
        .unwrap();

    let request = chat_request().with_fallbacks(vec![
        Target::new("groq", "llama-3"),
        Target::new("anthropic", "claude-3-7-sonnet-20250219"),
    ]);
    let response = gateway
        .execute(request, IngressContext::default())
        .await
        .unwrap();

    assert_eq!(openai.calls(), 1);
    assert_eq!(groq.calls(), 1);
    assert_eq!(anthropic.calls(), 1);
    assert_eq!(response.provider, "anthropic");
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_plugin_short_circuit_skips_adapter() {
    let mut config = GatewayConfig::default();
    config.providers.push(provider_with_key("openai"));

    let adapter = Arc::new(MockAdapter::new("openai"));
    let plugin = RecorderPlugin::new("mocker").short_circuiting("mocked");
    let events = plugin.events.clone();

    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", adapter.clone())
        .with_plugin(
            Arc::new(plugin),
            PluginDescriptor::native("mocker", "mocker", 0),
        )
        .build()
        .await
        .unwrap();

    let response = gateway
        .execute(chat_request(), IngressContext::default())
        .await
        .unwrap();

    assert_eq!(response.first_content(), Some("mocked"));
    assert_eq!(adapter.calls(), 0);
    // The short-circuiting plugin's own post-hook ran with the mocked
    // response.
    let events = events.lock().unwrap().clone();
    assert!(matches!(events[0], HookEvent::Pre));
    assert!(matches!(&events[1], HookEvent::PostResponse(c) if c == "mocked"));
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_budget_exceeded_rejects_without_dispatch() {
    let mut config = GatewayConfig::default();
    config.providers.push(provider_with_key("openai"));
    config.governance = Some(GovernanceConfig {
        virtual_keys: vec![TenantConfig {
            id: "vk1".to_string(),
            key: Some("bf-vk-1".to_string()),
            parent_team: None,
            parent_customer: None,
            limits: ScopeLimits {
                budget: Some(BudgetConfig {
                    max_limit: 0.01,
                    reset_duration: ResetDuration::Month,
                    current_usage: 0.009,
                }),
                rate_limit: None,
            },
        }],
        ..Default::default()
    });

    let adapter = Arc::new(MockAdapter::new("openai"));
    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", adapter.clone())
        .build()
        .await
        .unwrap();

    let ingress = IngressContext {
        virtual_key: Some("bf-vk-1".to_string()),
        ..Default::default()
    };
    let err = gateway.execute(chat_request(), ingress).await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::BudgetExceeded);
    assert_eq!(err.status(), 402);
    assert_eq!(adapter.calls(), 0);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_routing_rule_overrides_target() {
    let mut config = GatewayConfig::default();
    config.providers.push(provider_with_key("openai"));
    config.providers.push(provider_with_key("anthropic"));
    config.routing_rules.push(RoutingRuleConfig {
        id: "r1".to_string(),
        name: "pin mini to anthropic".to_string(),
        description: String::new(),
        cel_expression: "model == 'gpt-4o-mini'".to_string(),
        provider: "anthropic".to_string(),
        model: "claude-3-7-sonnet-20250219".to_string(),
        fallbacks: Vec::new(),
        scope: RuleScope::Global,
        scope_id: None,
        priority: 0,
        enabled: true,
    });

    let openai = Arc::new(MockAdapter::new("openai"));
    let anthropic = Arc::new(MockAdapter::new("anthropic"));
    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", openai.clone())
        .with_adapter("anthropic", anthropic.clone())
        .build()
        .await
        .unwrap();

    let response = gateway
        .execute(chat_request(), IngressContext::default())
        .await
        .unwrap();

    assert_eq!(openai.calls(), 0);
    assert_eq!(anthropic.calls(), 1);
    assert_eq!(response.provider, "anthropic");
    assert_eq!(response.model, "claude-3-7-sonnet-20250219");
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_zero_deadline_fails_without_dispatch() {
    let mut config = GatewayConfig::default();
    config.providers.push(provider_with_key("openai"));

    let adapter = Arc::new(MockAdapter::new("openai"));
    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", adapter.clone())
        .build()
        .await
        .unwrap();

    let ingress = IngressContext {
        timeout_override: Some(Duration::ZERO),
        ..Default::default()
    };
    let err = gateway.execute(chat_request(), ingress).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(adapter.calls(), 0);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_transient_errors_retry_within_target() {
    let mut config = GatewayConfig::default();
    let mut provider = provider_with_key("openai");
    provider.network.max_retries = 2;
    provider.network.retry_backoff_initial_ms = 5;
    provider.network.retry_backoff_max_ms = 10;
    config.providers.push(provider);

    let adapter = Arc::new(MockAdapter::new("openai"));
    adapter.push(Err(bifrost::GatewayError::transient("blip")));
    adapter.push(Err(bifrost::GatewayError::transient("blip again")));
    // Third call succeeds via the default response.

    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", adapter.clone())
        .build()
        .await
        .unwrap();

    let response = gateway
        .execute(chat_request(), IngressContext::default())
        .await
        .unwrap();
    assert_eq!(adapter.calls(), 3);
    assert_eq!(response.provider, "openai");
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_auth_error_rotates_key_without_consuming_retries() {
    let mut config = GatewayConfig::default();
    let mut provider = ProviderConfig::named("openai");
    provider.keys = vec![
        KeyConfig::new("k1", "sk-1"),
        KeyConfig::new("k2", "sk-2"),
    ];
    provider.network.max_retries = 0;
    config.providers.push(provider);

    let adapter = Arc::new(MockAdapter::new("openai"));
    // Whichever key goes first gets an auth failure; the rotated key
    // succeeds even with max_retries = 0.
    adapter.push(Err(bifrost::GatewayError::auth("bad key")));

    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", adapter.clone())
        .build()
        .await
        .unwrap();

    let response = gateway
        .execute(chat_request(), IngressContext::default())
        .await
        .unwrap();
    assert_eq!(adapter.calls(), 2);
    assert_eq!(response.provider, "openai");
    let keys = adapter.seen_keys();
    assert_ne!(keys[0], keys[1]);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_plugin_symmetry_on_provider_error() {
    let mut config = GatewayConfig::default();
    let mut provider = provider_with_key("openai");
    provider.network.max_retries = 0;
    config.providers.push(provider);

    let adapter = Arc::new(MockAdapter::new("openai"));
    adapter.push(Err(bifrost::GatewayError::permanent("model_not_found")));

    let first = RecorderPlugin::new("first");
    let second = RecorderPlugin::new("second");
    let first_events = first.events.clone();
    let second_events = second.events.clone();

    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", adapter.clone())
        .with_plugin(Arc::new(first), PluginDescriptor::native("first", "first", 0))
        .with_plugin(
            Arc::new(second),
            PluginDescriptor::native("second", "second", 1),
        )
        .build()
        .await
        .unwrap();

    let err = gateway
        .execute(chat_request(), IngressContext::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProviderPermanent);

    // Both pre-hooks ran, so both post-hooks ran, with the error.
    for events in [first_events, second_events] {
        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], HookEvent::Pre));
        assert!(matches!(
            events[1],
            HookEvent::PostError(ErrorKind::ProviderPermanent)
        ));
    }
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unknown_provider_is_validation_like_failure() {
    let config = GatewayConfig::default();
    let gateway = GatewayBuilder::new(config).build().await.unwrap();
    let err = gateway
        .execute(chat_request(), IngressContext::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProviderPermanent);
    assert!(err.message.contains("not configured"));
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_ingress_headers_reach_routing_rules() {
    let mut config = GatewayConfig::default();
    config.providers.push(provider_with_key("openai"));
    config.providers.push(provider_with_key("anthropic"));
    config.routing_rules.push(RoutingRuleConfig {
        id: "r1".to_string(),
        name: "staging to anthropic".to_string(),
        description: String::new(),
        cel_expression: "headers['x-env'] == 'staging'".to_string(),
        provider: "anthropic".to_string(),
        model: String::new(),
        fallbacks: Vec::new(),
        scope: RuleScope::Global,
        scope_id: None,
        priority: 0,
        enabled: true,
    });

    let openai = Arc::new(MockAdapter::new("openai"));
    let anthropic = Arc::new(MockAdapter::new("anthropic"));
    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", openai.clone())
        .with_adapter("anthropic", anthropic.clone())
        .build()
        .await
        .unwrap();

    let mut headers = HashMap::new();
    headers.insert("x-env".to_string(), "staging".to_string());
    let ingress = IngressContext {
        headers,
        ..Default::default()
    };
    let response = gateway.execute(chat_request(), ingress).await.unwrap();
    assert_eq!(response.provider, "anthropic");
    assert_eq!(openai.calls(), 0);

    // Without the header the rule does not match.
    let response = gateway
        .execute(chat_request(), IngressContext::default())
        .await
        .unwrap();
    assert_eq!(response.provider, "openai");
    gateway.shutdown().await;
}
