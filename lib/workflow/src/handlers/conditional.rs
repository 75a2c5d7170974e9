//! Rule-based routing.
//!
//! Conditions are checked in order; the first match names the output port.
//! Fields are dot paths into the node scope (`input.amount`,
//! `trigger.customer.tier`, `nodes.lookup.found`, `variables.region`).

use super::{lookup, parse_config};
use crate::context::ExecutionContext;
use crate::error::NodeExecutionError;
use crate::node::NodeType;
use crate::registry::{ActionResult, NodeHandler, NodeRegistry};
use crate::routing::DEFAULT_ROUTE_PORT;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Operator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    Exists,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Condition {
    port: String,
    field: String,
    operator: Operator,
    #[serde(default)]
    value: JsonValue,
}

impl Condition {
    fn matches(&self, scope: &JsonValue) -> bool {
        let actual = lookup(scope, &self.field);
        match self.operator {
            Operator::Exists => actual.is_some_and(|v| !v.is_null()),
            Operator::Equals => actual.is_some_and(|v| loosely_equal(v, &self.value)),
            Operator::NotEquals => !actual.is_some_and(|v| loosely_equal(v, &self.value)),
            Operator::Contains => actual.is_some_and(|v| contains(v, &self.value)),
            Operator::GreaterThan => compare(actual, &self.value).is_some_and(|(a, b)| a > b),
            Operator::LessThan => compare(actual, &self.value).is_some_and(|(a, b)| a < b),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConditionalConfig {
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default = "default_port")]
    default_port: String,
}

fn default_port() -> String {
    DEFAULT_ROUTE_PORT.to_string()
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn compare(actual: Option<&JsonValue>, expected: &JsonValue) -> Option<(f64, f64)> {
    Some((as_number(actual?)?, as_number(expected)?))
}

fn loosely_equal(actual: &JsonValue, expected: &JsonValue) -> bool {
    if actual == expected {
        return true;
    }
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
        _ => false,
    }
}

fn contains(actual: &JsonValue, expected: &JsonValue) -> bool {
    match (actual, expected) {
        (JsonValue::String(haystack), JsonValue::String(needle)) => haystack.contains(needle.as_str()),
        (JsonValue::Array(items), needle) => items.iter().any(|item| item == needle),
        (JsonValue::Object(map), JsonValue::String(key)) => map.contains_key(key),
        _ => false,
    }
}

/// Selects one output port from ordered conditions.
///
/// The output is `{"selectedPort", "matched", "data"}`; `data` is the node
/// input, forwarded to whichever branch runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionalRouterHandler;

#[async_trait]
impl NodeHandler for ConditionalRouterHandler {
    fn node_type(&self) -> NodeType {
        NodeType::ConditionalRouter
    }

    fn validate_config(&self, config: &JsonValue, _registry: &NodeRegistry) -> Result<(), String> {
        let config: ConditionalConfig = parse_config(config)?;
        if let Some(condition) = config.conditions.iter().find(|c| c.port.is_empty()) {
            return Err(format!("condition on {:?} has no port", condition.field));
        }
        Ok(())
    }

    async fn execute(
        &self,
        config: &JsonValue,
        context: &ExecutionContext,
    ) -> Result<ActionResult, NodeExecutionError> {
        let config: ConditionalConfig =
            parse_config(config).map_err(|reason| NodeExecutionError::InvalidConfig { reason })?;
        let scope = context.scope();

        let (port, matched) = match config.conditions.iter().find(|c| c.matches(&scope)) {
            Some(condition) => (condition.port.clone(), true),
            None => (config.default_port, false),
        };
        Ok(ActionResult::ok(json!({
            "selectedPort": port,
            "matched": matched,
            "data": context.input(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use chainweave_core::{ExecutionId, UserId, WorkflowId};

    fn context(input: JsonValue) -> ExecutionContext {
        ExecutionContext::new(
            ExecutionId::new(),
            WorkflowId::new(),
            UserId::new(),
            json!({"customer": {"tier": "gold"}}),
        )
        .for_node(NodeId::new("route"), input)
    }

    async fn selected(config: JsonValue, input: JsonValue) -> String {
        let result = ConditionalRouterHandler
            .execute(&config, &context(input))
            .await
            .expect("execute");
        result.output.expect("output")["selectedPort"]
            .as_str()
            .expect("port")
            .to_string()
    }

    #[tokio::test]
    async fn first_matching_condition_wins() {
        let config = json!({
            "conditions": [
                {"port": "large", "field": "input.amount", "operator": "greater_than", "value": 1000},
                {"port": "gold", "field": "trigger.customer.tier", "operator": "equals", "value": "gold"}
            ]
        });
        assert_eq!(selected(config.clone(), json!({"amount": 5000})).await, "large");
        assert_eq!(selected(config, json!({"amount": 10})).await, "gold");
    }

    #[tokio::test]
    async fn falls_back_to_default_port() {
        let config = json!({
            "conditions": [{"port": "small", "field": "input.amount", "operator": "less_than", "value": 5}],
            "defaultPort": "other"
        });
        assert_eq!(selected(config, json!({"amount": 50})).await, "other");
        assert_eq!(selected(json!({}), json!({})).await, DEFAULT_ROUTE_PORT);
    }

    #[tokio::test]
    async fn operators() {
        let input = json!({"tags": ["vip", "eu"], "note": "urgent refund", "count": "3"});
        let check = |operator: &str, field: &str, value: JsonValue| {
            json!({"conditions": [{"port": "hit", "field": field, "operator": operator, "value": value}]})
        };

        assert_eq!(selected(check("contains", "input.tags", json!("vip")), input.clone()).await, "hit");
        assert_eq!(selected(check("contains", "input.note", json!("refund")), input.clone()).await, "hit");
        assert_eq!(selected(check("equals", "input.count", json!(3)), input.clone()).await, "hit");
        assert_eq!(selected(check("not_equals", "input.missing", json!(1)), input.clone()).await, "hit");
        assert_eq!(selected(check("exists", "input.note", JsonValue::Null), input.clone()).await, "hit");
        assert_eq!(selected(check("exists", "input.nope", JsonValue::Null), input.clone()).await, "default");
        assert_eq!(selected(check("greater_than", "input.note", json!(1)), input).await, "default");
    }

    #[tokio::test]
    async fn output_forwards_input() {
        let result = ConditionalRouterHandler
            .execute(&json!({}), &context(json!({"id": 4})))
            .await
            .expect("execute");
        assert_eq!(
            result.output,
            Some(json!({"selectedPort": "default", "matched": false, "data": {"id": 4}}))
        );
    }

    #[test]
    fn rejects_unknown_operator() {
        let registry = NodeRegistry::new();
        let config = json!({"conditions": [{"port": "a", "field": "input.x", "operator": "like"}]});
        assert!(ConditionalRouterHandler.validate_config(&config, &registry).is_err());
    }
}
