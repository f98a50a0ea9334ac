//! Executor façade.
//!
//! [`smart_parse`] is the entry point used once per distinct expression: the
//! expression runs natively when the compiler can plan it and in a worker
//! process otherwise. Callers hold a [`TemplateExecutor`] and never need to
//! know which variant they got.

use crate::compiler::NativePlan;
use crate::config::{ExecutorConfig, TransportKind};
use crate::error::Error;
use crate::event::Event;
use crate::evaluator;
use crate::metrics::{default_reporter, SharedReporter};
use crate::supervisor::{Health, WorkerExecutor};
use crate::template::Template;
use crate::transport::{PipeTransport, SharedMemoryTransport};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Which backend executes a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorKind {
    Native,
    Pipe,
    SharedMemory,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Native => "native",
            ExecutorKind::Pipe => "pipe",
            ExecutorKind::SharedMemory => "shared_memory",
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs a compiled plan in-process.
#[derive(Debug)]
pub struct NativeExecutor {
    template: Arc<Template>,
    plan: NativePlan,
    reporter: SharedReporter,
    closed: AtomicBool,
}

impl NativeExecutor {
    pub fn new(template: Arc<Template>, reporter: SharedReporter) -> Result<Self, Error> {
        let plan = template.compiled.clone().ok_or_else(|| Error::Compilation {
            message: format!("template {} has no native plan", template.name),
        })?;
        Ok(Self {
            template,
            plan,
            reporter,
            closed: AtomicBool::new(false),
        })
    }

    pub fn process_event(&self, event: &Event) -> Result<Value, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        evaluator::evaluate(&self.plan, event)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn template(&self) -> &Template {
        &self.template
    }
}

/// A registered template ready to process events.
pub enum TemplateExecutor {
    Native(NativeExecutor),
    Pipe(WorkerExecutor<PipeTransport>),
    SharedMemory(WorkerExecutor<SharedMemoryTransport>),
}

impl std::fmt::Debug for TemplateExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateExecutor")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}

impl TemplateExecutor {
    /// Evaluates the template against one event. Every failure is reported
    /// to the executor's error reporter before it is returned.
    pub async fn process_event(&self, event: &Event) -> Result<Value, Error> {
        let result = match self {
            TemplateExecutor::Native(executor) => executor.process_event(event),
            TemplateExecutor::Pipe(executor) => executor.process_event(event).await,
            TemplateExecutor::SharedMemory(executor) => executor.process_event(event).await,
        };
        if let Err(err) = &result {
            self.reporter().report(err.kind());
        }
        result
    }

    /// Releases workers and shared segments. Safe to call more than once.
    pub async fn close(&self) -> Result<(), Error> {
        match self {
            TemplateExecutor::Native(executor) => {
                executor.close();
                Ok(())
            }
            TemplateExecutor::Pipe(executor) => executor.close().await,
            TemplateExecutor::SharedMemory(executor) => executor.close().await,
        }
    }

    pub fn template(&self) -> &Template {
        match self {
            TemplateExecutor::Native(executor) => executor.template(),
            TemplateExecutor::Pipe(executor) => executor.template(),
            TemplateExecutor::SharedMemory(executor) => executor.template(),
        }
    }

    pub fn name(&self) -> &str {
        &self.template().name
    }

    pub fn expression(&self) -> &str {
        &self.template().source
    }

    pub fn kind(&self) -> ExecutorKind {
        match self {
            TemplateExecutor::Native(_) => ExecutorKind::Native,
            TemplateExecutor::Pipe(_) => ExecutorKind::Pipe,
            TemplateExecutor::SharedMemory(_) => ExecutorKind::SharedMemory,
        }
    }

    pub fn is_native(&self) -> bool {
        self.kind() == ExecutorKind::Native
    }

    pub fn health(&self) -> Health {
        match self {
            TemplateExecutor::Native(executor) => {
                if executor.closed.load(Ordering::Acquire) {
                    Health::Dead
                } else {
                    Health::Ready
                }
            }
            TemplateExecutor::Pipe(executor) => executor.health(),
            TemplateExecutor::SharedMemory(executor) => executor.health(),
        }
    }

    /// Process ids of live workers; empty for native executors.
    pub fn worker_pids(&self) -> Vec<u32> {
        match self {
            TemplateExecutor::Native(_) => Vec::new(),
            TemplateExecutor::Pipe(executor) => executor.worker_pids(),
            TemplateExecutor::SharedMemory(executor) => executor.worker_pids(),
        }
    }

    fn reporter(&self) -> &SharedReporter {
        match self {
            TemplateExecutor::Native(executor) => &executor.reporter,
            TemplateExecutor::Pipe(executor) => executor.reporter(),
            TemplateExecutor::SharedMemory(executor) => executor.reporter(),
        }
    }
}

/// Builds a [`TemplateExecutor`] for one expression.
#[derive(Debug)]
pub struct ExecutorBuilder {
    /// Template name used in logs and reports (required).
    name: Option<String>,
    /// Expression text (required).
    expression: Option<String>,
    /// Executor settings; defaults apply when unset.
    config: Option<Arc<ExecutorConfig>>,
    /// Error reporter; logs through `tracing` when unset.
    reporter: Option<SharedReporter>,
    /// Whether a natively compilable expression may skip the worker.
    prefer_native: bool,
}

impl Default for ExecutorBuilder {
    fn default() -> Self {
        Self {
            name: None,
            expression: None,
            config: None,
            reporter: None,
            prefer_native: true,
        }
    }
}

impl ExecutorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn config(mut self, config: Arc<ExecutorConfig>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn reporter(mut self, reporter: SharedReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// `false` always runs the expression in a worker process.
    pub fn prefer_native(mut self, prefer_native: bool) -> Self {
        self.prefer_native = prefer_native;
        self
    }

    pub async fn build(self) -> Result<TemplateExecutor, Error> {
        let reporter = self.reporter.clone().unwrap_or_else(default_reporter);
        let result = self.build_with(Arc::clone(&reporter)).await;
        if let Err(err) = &result {
            reporter.report(err.kind());
        }
        result
    }

    async fn build_with(self, reporter: SharedReporter) -> Result<TemplateExecutor, Error> {
        let name = self
            .name
            .ok_or_else(|| Error::MissingRequiredAttribute("name".to_string()))?;
        let expression = self
            .expression
            .ok_or_else(|| Error::MissingRequiredAttribute("expression".to_string()))?;
        let config = self.config.unwrap_or_default();

        let template = if self.prefer_native {
            Template::new(name, expression)?
        } else {
            Template::raw(name, expression)?
        };
        let template = Arc::new(template);

        if template.is_native() {
            info!(template = %template.name, "template compiled natively");
            return Ok(TemplateExecutor::Native(NativeExecutor::new(template, reporter)?));
        }

        match config.transport {
            TransportKind::Pipe => WorkerExecutor::<PipeTransport>::start(template, config, reporter)
                .await
                .map(TemplateExecutor::Pipe),
            TransportKind::SharedMemory => {
                WorkerExecutor::<SharedMemoryTransport>::start(template, config, reporter)
                    .await
                    .map(TemplateExecutor::SharedMemory)
            }
        }
    }
}

/// Picks the cheapest executor able to run `expression`.
///
/// Blank expressions fail with [`Error::Compilation`]; expressions outside
/// the native grammar go to a worker on the configured transport (pipe when
/// no configuration is given).
pub async fn smart_parse(
    name: &str,
    expression: &str,
    config: Option<&ExecutorConfig>,
) -> Result<TemplateExecutor, Error> {
    ExecutorBuilder::new()
        .name(name)
        .expression(expression)
        .config(Arc::new(config.cloned().unwrap_or_default()))
        .build()
        .await
}
