//! Duplex frame transports between the host and template workers.
//!
//! Both transports move opaque frames (JSON-encoded [`crate::protocol`]
//! messages). The host side is async and owned by exactly one writer task and
//! one reader task per worker; the worker side is blocking.

pub mod pipe;
pub mod shm;

pub use pipe::PipeTransport;
pub use shm::SharedMemoryTransport;

use crate::config::{ExecutorConfig, TransportKind};
use crate::error::Error;
use async_trait::async_trait;
use tokio::process::{ChildStdin, ChildStdout, Command};

/// Environment variable selecting the worker-side transport.
pub const TRANSPORT_ENV: &str = "EVENTNATIVE_TEMPLATE_TRANSPORT";

/// Environment variable holding the shared segment path.
pub const SEGMENT_ENV: &str = "EVENTNATIVE_TEMPLATE_SEGMENT";

/// Environment variable holding the per-direction ring capacity.
pub const SEGMENT_CAPACITY_ENV: &str = "EVENTNATIVE_TEMPLATE_SEGMENT_CAPACITY";

/// Environment variable holding the largest frame a pipe worker may send.
pub const MAX_FRAME_ENV: &str = "EVENTNATIVE_TEMPLATE_MAX_FRAME";

/// Sending half of a host-side transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Writes one complete frame. The caller bounds the call with a deadline.
    async fn send(&mut self, frame: &[u8]) -> Result<(), Error>;
}

/// Receiving half of a host-side transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next complete frame, `None` once the worker closed its side.
    async fn receive(&mut self) -> Result<Option<Vec<u8>>, Error>;
}

/// Per-worker transport resources.
pub trait Transport: Send + Sync + Sized + 'static {
    type Sink: FrameSink + 'static;
    type Source: FrameSource + 'static;

    const KIND: TransportKind;

    /// Allocates resources for one worker and configures its command.
    fn prepare(config: &ExecutorConfig, command: &mut Command) -> Result<Self, Error>;

    /// Binds the spawned worker's standard streams.
    fn attach(
        &mut self,
        stdin: ChildStdin,
        stdout: ChildStdout,
    ) -> Result<(Self::Sink, Self::Source), Error>;

    /// Largest frame the transport can carry.
    fn max_frame_bytes(&self) -> usize;
}

/// Blocking worker-side channel.
pub trait WorkerChannel {
    /// Next request frame, `None` when the host went away.
    fn recv(&mut self) -> Result<Option<Vec<u8>>, Error>;

    fn send(&mut self, frame: &[u8]) -> Result<(), Error>;

    /// Largest frame `send` accepts.
    fn max_frame_bytes(&self) -> usize;
}

/// Opens the worker-side channel described by the environment.
pub fn worker_channel_from_env() -> Result<Box<dyn WorkerChannel>, Error> {
    let kind = match std::env::var(TRANSPORT_ENV) {
        Ok(value) => value
            .parse::<TransportKind>()
            .map_err(Error::transport)?,
        Err(_) => TransportKind::Pipe,
    };
    match kind {
        TransportKind::Pipe => {
            let mut pipe = pipe::WorkerPipe::stdio();
            if let Some(limit) = std::env::var(MAX_FRAME_ENV)
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
            {
                pipe = pipe.with_max_frame_bytes(limit);
            }
            Ok(Box::new(pipe))
        }
        TransportKind::SharedMemory => {
            let path = std::env::var_os(SEGMENT_ENV)
                .ok_or_else(|| Error::MissingRequiredAttribute(SEGMENT_ENV.to_string()))?;
            let capacity = std::env::var(SEGMENT_CAPACITY_ENV)
                .ok()
                .and_then(|value| value.parse::<usize>().ok())
                .ok_or_else(|| Error::MissingRequiredAttribute(SEGMENT_CAPACITY_ENV.to_string()))?;
            Ok(Box::new(shm::WorkerSegment::open(path.as_ref(), capacity)?))
        }
    }
}
