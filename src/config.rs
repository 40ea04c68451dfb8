//! Conductor-wide tunables: defaults overlaid by an optional config file, overlaid by
//! environment variables.

use serde::{Deserialize, Serialize};

/// Tunables that affect conductor behavior but aren't part of any one workflow spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// With-items concurrency used when a task doesn't declare its own. Defaults to
    /// unbounded: a with-items task with no explicit `concurrency` dispatches its
    /// full item list immediately.
    #[serde(default = "default_with_items_concurrency")]
    pub default_with_items_concurrency: u32,
    /// Upper bound on how many task instances may sit in `staged` at once; exceeding
    /// it is a caller error (the external executor is falling behind), not silently
    /// dropped work.
    #[serde(default = "default_max_staged_backlog")]
    pub max_staged_backlog: usize,
}

fn default_with_items_concurrency() -> u32 {
    u32::MAX
}

fn default_max_staged_backlog() -> usize {
    10_000
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            default_with_items_concurrency: default_with_items_concurrency(),
            max_staged_backlog: default_max_staged_backlog(),
        }
    }
}

impl ConductorConfig {
    /// Load configuration with precedence, highest first:
    /// 1. Environment variables (`BATON__*`)
    /// 2. `baton.yaml` in the current directory
    /// 3. Defaults
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&ConductorConfig::default())?)
            .add_source(
                config::File::with_name("baton")
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("BATON")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}
