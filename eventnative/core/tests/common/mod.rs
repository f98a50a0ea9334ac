use eventnative_core::retry::RetryConfig;
use eventnative_core::{Event, ExecutorConfig, TransportKind};
use serde_json::Value;
use std::path::PathBuf;

/// Configuration pointing at the worker binary built with this crate.
pub fn worker_config(transport: TransportKind) -> ExecutorConfig {
    let mut config = ExecutorConfig::default().with_transport(transport);
    config.worker.command = Some(PathBuf::from(env!("CARGO_BIN_EXE_template-worker")));
    config.request_timeout_ms = 10_000;
    config.shutdown_grace_ms = 500;
    config.retry = Some(RetryConfig {
        max_attempts: 3,
        initial_backoff_ms: 10,
        max_backoff_ms: 50,
    });
    config
}

pub fn event(value: Value) -> Event {
    eventnative_core::event::from_value(value).unwrap()
}
