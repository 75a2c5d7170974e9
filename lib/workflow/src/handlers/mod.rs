//! Built-in node handlers.
//!
//! - `trigger`: manual, webhook and schedule triggers (payload passthrough)
//! - `data`: field assignment, delays and log lines
//! - `http`: outbound HTTP requests
//! - `conditional`: rule-based routing to an output port
//! - `ai_router`: model-driven path selection and chain execution

pub mod ai_router;
pub mod conditional;
pub mod data;
pub mod http;
pub mod trigger;

pub use ai_router::{AiRouterConfig, AiRouterHandler, OutputPath};
pub use conditional::ConditionalRouterHandler;
pub use data::{DelayHandler, LogHandler, SetFieldsHandler};
pub use http::HttpRequestHandler;
pub use trigger::TriggerHandler;

use crate::node::NodeType;
use crate::registry::NodeHandler;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Handlers that need nothing beyond their node config.
#[must_use]
pub fn builtin_handlers() -> Vec<Arc<dyn NodeHandler>> {
    vec![
        Arc::new(TriggerHandler::new(NodeType::ManualTrigger)),
        Arc::new(TriggerHandler::new(NodeType::WebhookTrigger)),
        Arc::new(TriggerHandler::new(NodeType::ScheduleTrigger)),
        Arc::new(HttpRequestHandler::new()),
        Arc::new(SetFieldsHandler),
        Arc::new(DelayHandler),
        Arc::new(LogHandler),
        Arc::new(ConditionalRouterHandler),
    ]
}

/// Decodes a node config into its typed form.
///
/// A missing config (`null`) decodes like an empty object so that handlers
/// whose fields all have defaults accept it.
pub(crate) fn parse_config<T: DeserializeOwned>(config: &JsonValue) -> Result<T, String> {
    let config = if config.is_null() {
        JsonValue::Object(serde_json::Map::new())
    } else {
        config.clone()
    };
    serde_json::from_value(config).map_err(|e| e.to_string())
}

/// Looks up a dot-separated path (`trigger.order.id`, `items.0`) in a JSON value.
pub(crate) fn lookup<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}
