//! Name to executor map owned by the host.

use crate::config::ExecutorConfig;
use crate::error::Error;
use crate::event::Event;
use crate::executor::{ExecutorBuilder, TemplateExecutor};
use crate::metrics::{default_reporter, SharedReporter};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Templates registered by name. Executors are shared, so a lookup can be
/// held across `await` without blocking registration.
#[derive(Debug)]
pub struct TemplateRegistry {
    executors: RwLock<HashMap<String, Arc<TemplateExecutor>>>,
    config: Arc<ExecutorConfig>,
    reporter: SharedReporter,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::new(Arc::new(ExecutorConfig::default()), default_reporter())
    }
}

impl TemplateRegistry {
    pub fn new(config: Arc<ExecutorConfig>, reporter: SharedReporter) -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
            config,
            reporter,
        }
    }

    /// Registers `expression` under `name` with the registry configuration.
    pub async fn register(&self, name: &str, expression: &str) -> Result<Arc<TemplateExecutor>, Error> {
        self.register_with(name, expression, Arc::clone(&self.config))
            .await
    }

    /// Registers with a template-specific configuration. A template already
    /// registered under `name` is replaced and closed.
    pub async fn register_with(
        &self,
        name: &str,
        expression: &str,
        config: Arc<ExecutorConfig>,
    ) -> Result<Arc<TemplateExecutor>, Error> {
        let executor = ExecutorBuilder::new()
            .name(name)
            .expression(expression)
            .config(config)
            .reporter(Arc::clone(&self.reporter))
            .build()
            .await?;
        let executor = Arc::new(executor);
        info!(template = %name, kind = %executor.kind(), "template registered");

        let replaced = self
            .executors
            .write()
            .insert(name.to_string(), Arc::clone(&executor));
        if let Some(replaced) = replaced {
            if let Err(err) = replaced.close().await {
                warn!(template = %name, %err, "failed to close replaced template");
            }
        }
        Ok(executor)
    }

    pub fn get(&self, name: &str) -> Option<Arc<TemplateExecutor>> {
        self.executors.read().get(name).cloned()
    }

    /// Runs the template registered under `name` against `event`.
    pub async fn process(&self, name: &str, event: &Event) -> Result<Value, Error> {
        let Some(executor) = self.get(name) else {
            let err = Error::UnknownTemplate {
                name: name.to_string(),
            };
            self.reporter.report(err.kind());
            return Err(err);
        };
        executor.process_event(event).await
    }

    /// Unregisters and closes `name`. Returns `false` when nothing was registered.
    pub async fn remove(&self, name: &str) -> Result<bool, Error> {
        let removed = self.executors.write().remove(name);
        match removed {
            Some(executor) => {
                executor.close().await?;
                info!(template = %name, "template removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.executors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.read().is_empty()
    }

    /// Closes and unregisters every template. Returns the first close error.
    pub async fn close_all(&self) -> Result<(), Error> {
        let executors: Vec<(String, Arc<TemplateExecutor>)> =
            self.executors.write().drain().collect();
        let results = futures_util::future::join_all(
            executors.iter().map(|(_, executor)| executor.close()),
        )
        .await;
        let mut first = None;
        for ((name, _), result) in executors.iter().zip(results) {
            if let Err(err) = result {
                warn!(template = %name, %err, "failed to close template");
                first.get_or_insert(err);
            }
        }
        info!(templates = executors.len(), "template registry closed");
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorKind;
    use crate::metrics::CounterReporter;
    use serde_json::json;

    fn registry() -> (TemplateRegistry, Arc<CounterReporter>) {
        let counter = Arc::new(CounterReporter::new());
        let registry = TemplateRegistry::new(Arc::new(ExecutorConfig::default()), counter.clone());
        (registry, counter)
    }

    fn event(value: Value) -> Event {
        crate::event::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_process() {
        let (registry, _) = registry();
        let executor = registry.register("hello", "{...$, hello: $.id}").await.unwrap();
        assert_eq!(executor.kind(), ExecutorKind::Native);
        assert_eq!(
            registry.process("hello", &event(json!({"id": 2}))).await.unwrap(),
            json!({"id": 2, "hello": 2})
        );
    }

    #[tokio::test]
    async fn test_unknown_template_is_reported() {
        let (registry, counter) = registry();
        let result = registry.process("missing", &event(json!({}))).await;
        assert!(matches!(result, Err(Error::UnknownTemplate { .. })));
        assert_eq!(counter.count("unknown_template"), 1);
    }

    #[tokio::test]
    async fn test_replace_closes_previous() {
        let (registry, _) = registry();
        let first = registry.register("t", "$.a").await.unwrap();
        registry.register("t", "$.b").await.unwrap();
        assert!(matches!(
            first.process_event(&event(json!({}))).await,
            Err(Error::Closed)
        ));
        assert_eq!(registry.get("t").unwrap().expression(), "$.b");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_close_all() {
        let (registry, _) = registry();
        registry.register("b", "$.b").await.unwrap();
        registry.register("a", "$.a").await.unwrap();
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);

        assert!(registry.remove("a").await.unwrap());
        assert!(!registry.remove("a").await.unwrap());

        let b = registry.get("b").unwrap();
        registry.close_all().await.unwrap();
        assert!(registry.is_empty());
        assert!(matches!(
            b.process_event(&event(json!({}))).await,
            Err(Error::Closed)
        ));
        registry.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_registration_keeps_previous() {
        let (registry, counter) = registry();
        registry.register("t", "$.a").await.unwrap();
        assert!(registry.register("t", "   ").await.is_err());
        assert_eq!(registry.get("t").unwrap().expression(), "$.a");
        assert_eq!(counter.count("compilation"), 1);
    }
}
