//! Executor configuration.
//!
//! Every field has a default so an empty document (or `None` passed to
//! `smart_parse`) yields a working pipe-backed setup. Files are read with the
//! `config` crate and may be overridden with `EVENTNATIVE__*` environment
//! variables (`EVENTNATIVE__TRANSPORT=shared_memory`).

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the worker binary when none is configured.
pub const WORKER_COMMAND_ENV: &str = "EVENTNATIVE_TEMPLATE_WORKER";

/// File name of the worker binary looked up next to the current executable.
pub const DEFAULT_WORKER_BINARY: &str = "template-worker";

/// Prefix for environment overrides of configuration files.
pub const ENV_PREFIX: &str = "EVENTNATIVE";

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;
pub const DEFAULT_SEGMENT_CAPACITY: usize = 1024 * 1024;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_DEGRADED_AFTER_TIMEOUTS: u32 = 3;
pub const DEFAULT_RECYCLE_AFTER_TIMEOUTS: u32 = 10;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Inter-process transport used by worker-backed executors.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default, Deserialize, Serialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Newline-delimited JSON over the worker's stdin/stdout.
    #[default]
    #[serde(alias = "stdio")]
    Pipe,
    /// Ring buffers in a shared segment, stdin/stdout used as doorbells.
    #[serde(alias = "shm", alias = "sysv")]
    SharedMemory,
}

impl TransportKind {
    /// Value understood by the worker's transport environment variable.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Pipe => "pipe",
            TransportKind::SharedMemory => "shared_memory",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pipe" | "stdio" => Ok(TransportKind::Pipe),
            "shared_memory" | "shm" | "sysv" => Ok(TransportKind::SharedMemory),
            other => Err(format!("unknown transport: {other}")),
        }
    }
}

/// How worker processes are launched and how many back one template.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct WorkerOptions {
    /// Worker binary. Falls back to `EVENTNATIVE_TEMPLATE_WORKER`, then to
    /// `template-worker` next to the running executable.
    #[serde(default)]
    pub command: Option<PathBuf>,
    /// Extra command line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Worker processes per template (default: 1).
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Frames buffered for a worker's writer task before callers wait.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            pool_size: default_pool_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl WorkerOptions {
    /// Resolves the worker binary path.
    pub fn resolve_command(&self) -> PathBuf {
        if let Some(command) = &self.command {
            return command.clone();
        }
        if let Some(command) = std::env::var_os(WORKER_COMMAND_ENV) {
            return PathBuf::from(command);
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_WORKER_BINARY)))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_BINARY))
    }
}

/// Settings shared by all executors created from one configuration.
#[derive(PartialEq, Clone, Debug, Deserialize, Serialize)]
pub struct ExecutorConfig {
    /// Transport for worker-backed executors (defaults to pipe).
    #[serde(default)]
    pub transport: TransportKind,
    /// Per-request deadline in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Deadline for spawning a worker and receiving its ready acknowledgment.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Deadline for writing one frame into the transport.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Time a worker gets to exit on close before it is killed.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Bytes available to each direction of a shared segment.
    #[serde(default = "default_segment_capacity")]
    pub segment_capacity: usize,
    /// Largest accepted pipe frame.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Consecutive timeouts after which a worker reports degraded health.
    #[serde(default = "default_degraded_after_timeouts")]
    pub degraded_after_timeouts: u32,
    /// Consecutive timeouts after which a worker is killed and respawned.
    #[serde(default = "default_recycle_after_timeouts")]
    pub recycle_after_timeouts: u32,
    /// Worker process options.
    #[serde(default)]
    pub worker: WorkerOptions,
    /// Spawn retry budget.
    #[serde(default)]
    pub retry: Option<crate::retry::RetryConfig>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            request_timeout_ms: default_request_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            segment_capacity: default_segment_capacity(),
            max_frame_bytes: default_max_frame_bytes(),
            degraded_after_timeouts: default_degraded_after_timeouts(),
            recycle_after_timeouts: default_recycle_after_timeouts(),
            worker: WorkerOptions::default(),
            retry: None,
        }
    }
}

impl ExecutorConfig {
    /// Loads a configuration file (format picked from its extension) with
    /// environment overrides applied on top.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize::<ExecutorConfig>())
            .map_err(|source| Error::Config { source })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Effective spawn retry budget, the defaults when none is configured.
    pub fn retry(&self) -> crate::retry::RetryConfig {
        self.retry.clone().unwrap_or_default()
    }

    /// Builder-style transport override.
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_write_timeout_ms() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

fn default_segment_capacity() -> usize {
    DEFAULT_SEGMENT_CAPACITY
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_degraded_after_timeouts() -> u32 {
    DEFAULT_DEGRADED_AFTER_TIMEOUTS
}

fn default_recycle_after_timeouts() -> u32 {
    DEFAULT_RECYCLE_AFTER_TIMEOUTS
}

fn default_pool_size() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: ExecutorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ExecutorConfig::default());
        assert_eq!(config.transport, TransportKind::Pipe);
        assert_eq!(config.worker.pool_size, 1);
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_transport_aliases() {
        let config: ExecutorConfig = serde_json::from_str(r#"{"transport": "sysv"}"#).unwrap();
        assert_eq!(config.transport, TransportKind::SharedMemory);
        let config: ExecutorConfig = serde_json::from_str(r#"{"transport": "stdio"}"#).unwrap();
        assert_eq!(config.transport, TransportKind::Pipe);
        assert_eq!("shm".parse::<TransportKind>(), Ok(TransportKind::SharedMemory));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_transport_round_trips_through_display() {
        for kind in [TransportKind::Pipe, TransportKind::SharedMemory] {
            assert_eq!(kind.to_string().parse::<TransportKind>(), Ok(kind));
        }
    }

    #[test]
    fn test_explicit_command_wins() {
        let options = WorkerOptions {
            command: Some(PathBuf::from("/opt/worker")),
            ..WorkerOptions::default()
        };
        assert_eq!(options.resolve_command(), PathBuf::from("/opt/worker"));
    }

    #[test]
    fn test_from_path_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
transport = "shared_memory"
request_timeout_ms = 250

[worker]
pool_size = 2
"#
        )
        .unwrap();

        let config = ExecutorConfig::from_path(file.path()).unwrap();
        assert_eq!(config.transport, TransportKind::SharedMemory);
        assert_eq!(config.request_timeout_ms, 250);
        assert_eq!(config.worker.pool_size, 2);
        assert_eq!(config.segment_capacity, DEFAULT_SEGMENT_CAPACITY);
    }

    #[test]
    fn test_from_path_missing_file() {
        let result = ExecutorConfig::from_path("/definitely/not/here.toml");
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
