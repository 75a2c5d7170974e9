//! Centralized engine configuration.
//!
//! This module provides strongly-typed configuration for the engine,
//! loaded via the `config` crate from environment variables. Nested keys use
//! `__` as the separator, e.g. `SCHEDULER__MAX_CONCURRENCY=4` or
//! `MODEL__API_KEY=...`.

use chainweave_ai::ModelSettings;
use chainweave_usage::GovernorSettings;
use chainweave_workflow::SchedulerSettings;
use serde::Deserialize;
use std::path::PathBuf;

/// Engine configuration composed from library configs.
#[derive(Debug, Default, Deserialize)]
pub struct EngineConfig {
    /// PostgreSQL connection URL. Without one, runs and usage live in memory.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Scheduler defaults.
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Plan overrides for the usage governor.
    #[serde(default)]
    pub governor: GovernorSettings,

    /// Model provider settings for AI routers.
    #[serde(default)]
    pub model: ModelSettings,

    /// What to run.
    #[serde(default)]
    pub run: RunConfig,
}

/// A single invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Path to a workflow definition JSON file.
    #[serde(default)]
    pub workflow_path: Option<PathBuf>,

    /// Path to a JSON trigger payload.
    #[serde(default)]
    pub payload_path: Option<PathBuf>,

    /// User the run is billed to. Defaults to the workflow owner.
    #[serde(default)]
    pub user_id: Option<String>,

    /// Simulate side effects.
    #[serde(default)]
    pub test_mode: bool,

    /// Start from the trigger's successors instead of the trigger.
    #[serde(default)]
    pub skip_triggers: bool,

    /// Trigger to start from when a workflow has several.
    #[serde(default)]
    pub trigger_node: Option<String>,

    /// Database pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workflow_path: None,
            payload_path: None,
            user_id: None,
            test_mode: false,
            skip_triggers: false,
            trigger_node: None,
            max_connections: default_max_connections(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is present but invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
