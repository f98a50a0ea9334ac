pub mod compiler;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod executor;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod supervisor;
pub mod template;
pub mod transport;

pub use config::{ExecutorConfig, TransportKind, WorkerOptions};
pub use error::Error;
pub use event::Event;
pub use executor::{smart_parse, ExecutorBuilder, ExecutorKind, TemplateExecutor};
pub use metrics::{CounterReporter, ErrorReporter, LogReporter, NoopReporter, SharedReporter};
pub use registry::TemplateRegistry;
pub use supervisor::{Health, WorkerExecutor};
pub use template::Template;
