//! Edge activation.
//!
//! A node's output decides which of its outgoing edges fire:
//! - `selectedPaths: [..]` fires the edges leaving those ports
//! - `selectedPort: ".."` fires the edges leaving that port
//! - anything else fires every outgoing edge
//!
//! When the selected ports match none of the node's outgoing edges, the
//! edges leaving the `default` port fire instead. With no default edge
//! nothing fires.

use serde_json::Value as JsonValue;
use std::collections::BTreeSet;

/// The port routers fall back to.
pub const DEFAULT_ROUTE_PORT: &str = "default";

/// Which outgoing ports of a finished node fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// Every outgoing edge fires.
    All,
    /// Only edges leaving these ports fire.
    Ports(BTreeSet<String>),
}

impl Activation {
    /// Nothing fires.
    #[must_use]
    pub fn none() -> Self {
        Self::Ports(BTreeSet::new())
    }

    /// Reads the routing selection out of a node output.
    #[must_use]
    pub fn from_output(output: &JsonValue) -> Self {
        if let Some(paths) = output.get("selectedPaths").and_then(JsonValue::as_array) {
            return Self::Ports(
                paths
                    .iter()
                    .filter_map(JsonValue::as_str)
                    .map(str::to_string)
                    .collect(),
            );
        }
        if let Some(port) = output.get("selectedPort").and_then(JsonValue::as_str) {
            return Self::Ports(BTreeSet::from([port.to_string()]));
        }
        Self::All
    }

    /// Applies the fallback rule against the ports the node actually has edges on.
    #[must_use]
    pub fn resolve(self, outgoing_ports: &BTreeSet<String>) -> Self {
        match self {
            Self::All => Self::All,
            Self::Ports(selected) => {
                if selected.iter().any(|port| outgoing_ports.contains(port)) {
                    Self::Ports(selected)
                } else if outgoing_ports.contains(DEFAULT_ROUTE_PORT) {
                    Self::Ports(BTreeSet::from([DEFAULT_ROUTE_PORT.to_string()]))
                } else {
                    Self::none()
                }
            }
        }
    }

    /// Returns true if an edge leaving `port` fires.
    #[must_use]
    pub fn activates(&self, port: &str) -> bool {
        match self {
            Self::All => true,
            Self::Ports(ports) => ports.contains(port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ports(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn plain_output_fires_everything() {
        let activation = Activation::from_output(&json!({"status": 200}));
        assert_eq!(activation, Activation::All);
        assert!(activation.activates("anything"));
    }

    #[test]
    fn selected_paths_fire_only_those_ports() {
        let activation = Activation::from_output(&json!({"selectedPaths": ["billing", "refund"]}))
            .resolve(&ports(&["billing", "refund", "tech", "default"]));
        assert!(activation.activates("billing"));
        assert!(activation.activates("refund"));
        assert!(!activation.activates("tech"));
        assert!(!activation.activates("default"));
    }

    #[test]
    fn selected_port_is_single_choice() {
        let activation = Activation::from_output(&json!({"selectedPort": "true"}))
            .resolve(&ports(&["true", "false"]));
        assert!(activation.activates("true"));
        assert!(!activation.activates("false"));
    }

    #[test]
    fn unmatched_selection_falls_back_to_default() {
        let activation = Activation::from_output(&json!({"selectedPort": "unknown"}))
            .resolve(&ports(&["a", "default"]));
        assert!(activation.activates("default"));
        assert!(!activation.activates("a"));
    }

    #[test]
    fn unmatched_selection_without_default_fires_nothing() {
        let activation = Activation::from_output(&json!({"selectedPaths": []}))
            .resolve(&ports(&["a", "b"]));
        assert_eq!(activation, Activation::none());
    }
}
