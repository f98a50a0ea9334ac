//! Application configuration.
//!
//! Templates are declared inline in the main file or discovered through a
//! glob pattern, one template per file. The executor section is shared by
//! every template unless a template overrides its transport or retry budget.

use eventnative_core::retry::RetryConfig;
use eventnative_core::{ExecutorConfig, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, `EVENTNATIVE__EXECUTOR__TRANSPORT=shm`.
pub const ENV_PREFIX: &str = "EVENTNATIVE";

/// Main application configuration.
#[derive(PartialEq, Clone, Debug, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Settings applied to every template executor.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Templates declared inline.
    #[serde(default)]
    pub templates: Vec<TemplateOptions>,
    /// Glob pattern for template files, e.g. `/etc/eventnative/templates/*.toml`.
    pub templates_dir: Option<PathBuf>,
}

/// One template registration.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct TemplateOptions {
    /// Name used in output lines and logs.
    pub name: String,
    /// Transformation expression.
    pub expression: String,
    /// Transport override for this template.
    pub transport: Option<TransportKind>,
    /// Spawn retry override for this template.
    pub retry: Option<RetryConfig>,
}

impl AppConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize::<AppConfig>()
    }
}

impl TemplateOptions {
    /// Executor settings for this template, with its overrides applied.
    pub fn executor_config(&self, base: &ExecutorConfig) -> ExecutorConfig {
        let mut config = match self.transport {
            Some(transport) => base.clone().with_transport(transport),
            None => base.clone(),
        };
        if self.retry.is_some() {
            config.retry = Some(RetryConfig::merge(&base.retry, &self.retry));
        }
        config
    }
}
