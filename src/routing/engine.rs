//! CEL rule compilation and per-request evaluation.

use cel_interpreter::{Context, Program, Value};

use crate::config::{RoutingRuleConfig, RuleScope};
use crate::types::{GatewayRequest, RequestContext, Target};

/// What a matching rule changes on the request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteOverride {
    pub rule_id: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub fallbacks: Vec<Target>,
}

struct CompiledRule {
    config: RoutingRuleConfig,
    /// `None` for unconditional rules (empty expression).
    program: Option<Program>,
}

/// Compiled, priority-sorted rule set. Immutable after build; config
/// changes swap the whole engine via snapshot.
#[derive(Default)]
pub struct RoutingEngine {
    rules: Vec<CompiledRule>,
}

impl RoutingEngine {
    /// Compile the rule set. Rules whose CEL fails to compile are dropped
    /// with a warning rather than taking the config down.
    pub fn from_rules(rules: &[RoutingRuleConfig]) -> Self {
        let mut compiled: Vec<CompiledRule> = rules
            .iter()
            .filter(|rule| rule.enabled)
            .filter_map(|rule| {
                let expression = rule.cel_expression.trim();
                let program = if expression.is_empty() {
                    None
                } else {
                    match Program::compile(expression) {
                        Ok(program) => Some(program),
                        Err(e) => {
                            tracing::warn!(
                                target: "bifrost::routing",
                                "rule '{}' has an invalid CEL expression, dropping: {}",
                                rule.name,
                                e
                            );
                            return None;
                        }
                    }
                };
                Some(CompiledRule {
                    config: rule.clone(),
                    program,
                })
            })
            .collect();
        compiled.sort_by_key(|r| r.config.priority);
        Self { rules: compiled }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate the rule set for one request. Scope levels are consulted
    /// virtual-key → team → customer → global; within a level rules run
    /// in ascending priority; the first match anywhere in the chain wins
    /// outright.
    pub fn evaluate(&self, request: &GatewayRequest, ctx: &RequestContext) -> Option<RouteOverride> {
        let levels: [(RuleScope, Option<&str>); 4] = [
            (RuleScope::VirtualKey, ctx.virtual_key_id.as_deref()),
            (RuleScope::Team, ctx.team_id.as_deref()),
            (RuleScope::Customer, ctx.customer_id.as_deref()),
            (RuleScope::Global, None),
        ];
        for (scope, scope_id) in levels {
            if scope != RuleScope::Global && scope_id.is_none() {
                continue;
            }
            for rule in self.rules.iter().filter(|r| r.config.scope == scope) {
                if scope != RuleScope::Global
                    && rule.config.scope_id.as_deref() != scope_id
                {
                    continue;
                }
                if self.matches(rule, request, ctx) {
                    return Some(self.materialize(rule));
                }
            }
        }
        None
    }

    fn matches(&self, rule: &CompiledRule, request: &GatewayRequest, ctx: &RequestContext) -> bool {
        let Some(program) = &rule.program else {
            return true;
        };
        let mut context = Context::default();
        context.add_variable_from_value("model", request.model.clone());
        context.add_variable_from_value("provider", request.provider.clone());
        context.add_variable_from_value("headers", json_to_cel(&serde_json::json!(request.headers)));
        context.add_variable_from_value(
            "params",
            request
                .params
                .as_ref()
                .and_then(|p| serde_json::to_value(p).ok())
                .map(|v| json_to_cel(&v))
                .unwrap_or(Value::Null),
        );
        context.add_variable_from_value(
            "virtual_key_id",
            ctx.virtual_key_id.clone().unwrap_or_default(),
        );
        context.add_variable_from_value("team_id", ctx.team_id.clone().unwrap_or_default());
        context.add_variable_from_value(
            "customer_id",
            ctx.customer_id.clone().unwrap_or_default(),
        );

        match program.execute(&context) {
            Ok(Value::Bool(matched)) => matched,
            Ok(other) => {
                tracing::warn!(
                    target: "bifrost::routing",
                    "rule '{}' evaluated to non-boolean {:?}, treating as no match",
                    rule.config.name,
                    other
                );
                false
            }
            Err(e) => {
                // An evaluation error disables the rule for this request,
                // never fails the request.
                tracing::warn!(
                    target: "bifrost::routing",
                    "rule '{}' evaluation failed, skipping: {}",
                    rule.config.name,
                    e
                );
                false
            }
        }
    }

    fn materialize(&self, rule: &CompiledRule) -> RouteOverride {
        let fallbacks = rule
            .config
            .fallbacks
            .iter()
            .filter_map(|s| match Target::parse(s) {
                Ok(target) => Some(target),
                Err(_) => {
                    tracing::warn!(
                        target: "bifrost::routing",
                        "rule '{}' fallback '{}' is not provider/model, skipping",
                        rule.config.name,
                        s
                    );
                    None
                }
            })
            .collect();
        RouteOverride {
            rule_id: rule.config.id.clone(),
            provider: (!rule.config.provider.is_empty()).then(|| rule.config.provider.clone()),
            model: (!rule.config.model.is_empty()).then(|| rule.config.model.clone()),
            fallbacks,
        }
    }
}

/// Convert a JSON value into a CEL value for the evaluation context.
fn json_to_cel(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(std::sync::Arc::new(s.clone())),
        serde_json::Value::Array(items) => {
            Value::List(std::sync::Arc::new(items.iter().map(json_to_cel).collect()))
        }
        serde_json::Value::Object(map) => {
            let converted: std::collections::HashMap<cel_interpreter::objects::Key, Value> = map
                .iter()
                .map(|(k, v)| {
                    (
                        cel_interpreter::objects::Key::String(std::sync::Arc::new(k.clone())),
                        json_to_cel(v),
                    )
                })
                .collect();
            Value::Map(cel_interpreter::objects::Map {
                map: std::sync::Arc::new(converted),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use std::time::Duration;
    use tokio::time::Instant;

    fn ctx() -> RequestContext {
        RequestContext::new(Instant::now() + Duration::from_secs(30))
    }

    fn request() -> GatewayRequest {
        GatewayRequest::chat("openai", "gpt-4o-mini", vec![Message::user("hi")])
    }

    fn rule(id: &str, scope: RuleScope, priority: u16, cel: &str) -> RoutingRuleConfig {
        RoutingRuleConfig {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            cel_expression: cel.to_string(),
            provider: "anthropic".to_string(),
            model: "claude-3-7-sonnet-20250219".to_string(),
            fallbacks: Vec::new(),
            scope,
            scope_id: None,
            priority,
            enabled: true,
        }
    }

    #[test]
    fn test_cel_match_overrides_target() {
        let engine =
            RoutingEngine::from_rules(&[rule("r1", RuleScope::Global, 0, "model == 'gpt-4o-mini'")]);
        let matched = engine.evaluate(&request(), &ctx()).unwrap();
        assert_eq!(matched.provider.as_deref(), Some("anthropic"));
        assert_eq!(matched.model.as_deref(), Some("claude-3-7-sonnet-20250219"));
    }

    #[test]
    fn test_non_matching_cel_is_skipped() {
        let engine =
            RoutingEngine::from_rules(&[rule("r1", RuleScope::Global, 0, "model == 'other'")]);
        assert!(engine.evaluate(&request(), &ctx()).is_none());
    }

    #[test]
    fn test_empty_expression_matches_unconditionally() {
        let engine = RoutingEngine::from_rules(&[rule("r1", RuleScope::Global, 0, "  ")]);
        assert!(engine.evaluate(&request(), &ctx()).is_some());
    }

    #[test]
    fn test_priority_orders_within_scope() {
        let mut low = rule("low", RuleScope::Global, 100, "");
        low.provider = "cohere".to_string();
        let high = rule("high", RuleScope::Global, 5, "");
        let engine = RoutingEngine::from_rules(&[low, high]);
        let matched = engine.evaluate(&request(), &ctx()).unwrap();
        assert_eq!(matched.rule_id, "high");
    }

    #[test]
    fn test_scoped_rule_wins_over_global() {
        let mut vk_rule = rule("vk", RuleScope::VirtualKey, 500, "");
        vk_rule.scope_id = Some("vk1".to_string());
        let global_rule = rule("global", RuleScope::Global, 0, "");
        let engine = RoutingEngine::from_rules(&[global_rule, vk_rule]);

        let mut context = ctx();
        context.virtual_key_id = Some("vk1".to_string());
        let matched = engine.evaluate(&request(), &context).unwrap();
        // Scope precedence beats priority: virtual-key level is consulted
        // before global.
        assert_eq!(matched.rule_id, "vk");
    }

    #[test]
    fn test_scope_id_mismatch_is_skipped() {
        let mut vk_rule = rule("vk", RuleScope::VirtualKey, 0, "");
        vk_rule.scope_id = Some("someone-else".to_string());
        let engine = RoutingEngine::from_rules(&[vk_rule]);

        let mut context = ctx();
        context.virtual_key_id = Some("vk1".to_string());
        assert!(engine.evaluate(&request(), &context).is_none());
    }

    #[test]
    fn test_disabled_rules_are_dropped() {
        let mut disabled = rule("r1", RuleScope::Global, 0, "");
        disabled.enabled = false;
        let engine = RoutingEngine::from_rules(&[disabled]);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_invalid_cel_is_dropped_not_fatal() {
        let engine =
            RoutingEngine::from_rules(&[rule("r1", RuleScope::Global, 0, "model ==== broken (")]);
        assert!(engine.is_empty());
    }

    #[test]
    fn test_headers_visible_to_expressions() {
        let engine = RoutingEngine::from_rules(&[rule(
            "r1",
            RuleScope::Global,
            0,
            "headers['x-env'] == 'staging'",
        )]);
        let mut req = request();
        req.headers.insert("x-env".to_string(), "staging".to_string());
        assert!(engine.evaluate(&req, &ctx()).is_some());
        assert!(engine.evaluate(&request(), &ctx()).is_none());
    }

    #[test]
    fn test_fallbacks_parsed_from_strings() {
        let mut with_fallbacks = rule("r1", RuleScope::Global, 0, "");
        with_fallbacks.fallbacks =
            vec!["groq/llama-3".to_string(), "bad-string".to_string()];
        let engine = RoutingEngine::from_rules(&[with_fallbacks]);
        let matched = engine.evaluate(&request(), &ctx()).unwrap();
        assert_eq!(matched.fallbacks, vec![Target::new("groq", "llama-3")]);
    }
}
