//! Shared-memory transport.
//!
//! Each worker gets one segment file holding two rings: requests (host to
//! worker) and responses (worker to host). Frames travel through the rings;
//! the worker's stdin and stdout only carry one-byte doorbells telling the
//! other side that frames were published. A closed doorbell stream means the
//! peer is gone.

pub mod ring;

use super::{FrameSink, FrameSource, Transport, WorkerChannel, SEGMENT_CAPACITY_ENV, SEGMENT_ENV, TRANSPORT_ENV};
use crate::config::{ExecutorConfig, TransportKind};
use crate::error::Error;
use async_trait::async_trait;
use ring::{region_len, Ring};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::Notify;
use tracing::debug;

const DOORBELL: [u8; 1] = [1];

/// Interval at which a writer re-checks a full ring.
const SPACE_POLL: Duration = Duration::from_millis(1);

static SEGMENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Segment file on disk. The file is removed when the last holder drops.
#[derive(Debug)]
pub struct SharedSegment {
    path: PathBuf,
    file: File,
    capacity: usize,
}

impl SharedSegment {
    /// Creates a segment sized for two rings of `capacity` bytes each.
    pub fn create(capacity: usize) -> Result<Self, Error> {
        let dir = segment_dir();
        let path = dir.join(format!(
            "eventnative-template-{}-{}.seg",
            std::process::id(),
            SEGMENT_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| Error::IO { source })?;
        let segment = Self {
            path,
            file,
            capacity,
        };
        segment
            .file
            .set_len(2 * region_len(capacity) as u64)
            .map_err(|source| Error::IO { source })?;
        debug!(path = %segment.path.display(), capacity, "created shared segment");
        Ok(segment)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn requests_offset(&self) -> usize {
        0
    }

    fn responses_offset(&self) -> usize {
        region_len(self.capacity)
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), %err, "failed to remove shared segment");
        }
    }
}

fn segment_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Host side of the shared-memory transport.
///
/// Rings are initialised before the worker is spawned so the worker can
/// validate the headers as soon as it starts.
pub struct SharedMemoryTransport {
    segment: Arc<SharedSegment>,
    rings: Option<(Ring, Ring)>,
}

impl SharedMemoryTransport {
    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }
}

impl Transport for SharedMemoryTransport {
    type Sink = SharedMemorySink;
    type Source = SharedMemorySource;

    const KIND: TransportKind = TransportKind::SharedMemory;

    fn prepare(config: &ExecutorConfig, command: &mut Command) -> Result<Self, Error> {
        let segment = SharedSegment::create(config.segment_capacity)?;
        let requests = Ring::create(&segment.file, segment.requests_offset(), segment.capacity)?;
        let responses = Ring::create(&segment.file, segment.responses_offset(), segment.capacity)?;
        command
            .env(TRANSPORT_ENV, TransportKind::SharedMemory.as_str())
            .env(SEGMENT_ENV, segment.path())
            .env(SEGMENT_CAPACITY_ENV, segment.capacity().to_string());
        Ok(Self {
            segment: Arc::new(segment),
            rings: Some((requests, responses)),
        })
    }

    fn attach(
        &mut self,
        stdin: ChildStdin,
        stdout: ChildStdout,
    ) -> Result<(Self::Sink, Self::Source), Error> {
        let (requests, responses) = self
            .rings
            .take()
            .ok_or_else(|| Error::transport("shared segment already attached"))?;
        let space = Arc::new(Notify::new());
        Ok((
            SharedMemorySink {
                ring: requests,
                doorbell: stdin,
                space: Arc::clone(&space),
                _segment: Arc::clone(&self.segment),
            },
            SharedMemorySource {
                ring: responses,
                doorbell: stdout,
                space,
                _segment: Arc::clone(&self.segment),
            },
        ))
    }

    fn max_frame_bytes(&self) -> usize {
        self.segment.capacity.saturating_sub(4)
    }
}

pub struct SharedMemorySink {
    ring: Ring,
    doorbell: ChildStdin,
    space: Arc<Notify>,
    _segment: Arc<SharedSegment>,
}

#[async_trait]
impl FrameSink for SharedMemorySink {
    async fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        loop {
            let notified = self.space.notified();
            if self.ring.try_write(frame)? {
                break;
            }
            // The worker frees space as it consumes; responses wake us early.
            let _ = tokio::time::timeout(SPACE_POLL, notified).await;
        }
        self.doorbell
            .write_all(&DOORBELL)
            .await
            .map_err(|source| Error::IO { source })?;
        self.doorbell
            .flush()
            .await
            .map_err(|source| Error::IO { source })
    }
}

pub struct SharedMemorySource {
    ring: Ring,
    doorbell: ChildStdout,
    space: Arc<Notify>,
    _segment: Arc<SharedSegment>,
}

#[async_trait]
impl FrameSource for SharedMemorySource {
    async fn receive(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let mut bells = [0u8; 64];
        loop {
            if let Some(frame) = self.ring.try_read()? {
                self.space.notify_waiters();
                return Ok(Some(frame));
            }
            let read = self
                .doorbell
                .read(&mut bells)
                .await
                .map_err(|source| Error::IO { source })?;
            if read == 0 {
                return Ok(None);
            }
            self.space.notify_waiters();
        }
    }
}

/// Worker side of the shared-memory transport.
pub struct WorkerSegment<R, W> {
    requests: Ring,
    responses: Ring,
    doorbell_in: R,
    doorbell_out: W,
}

impl WorkerSegment<std::io::Stdin, std::io::Stdout> {
    /// Maps a segment created by the host.
    pub fn open(path: &Path, capacity: usize) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| Error::IO { source })?;
        Self::with_streams(&file, capacity, std::io::stdin(), std::io::stdout())
    }
}

impl<R: Read, W: Write> WorkerSegment<R, W> {
    pub fn with_streams(file: &File, capacity: usize, doorbell_in: R, doorbell_out: W) -> Result<Self, Error> {
        Ok(Self {
            requests: Ring::open(file, 0, capacity)?,
            responses: Ring::open(file, region_len(capacity), capacity)?,
            doorbell_in,
            doorbell_out,
        })
    }
}

impl<R: Read, W: Write> WorkerChannel for WorkerSegment<R, W> {
    fn recv(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let mut bells = [0u8; 64];
        loop {
            if let Some(frame) = self.requests.try_read()? {
                return Ok(Some(frame));
            }
            let read = self
                .doorbell_in
                .read(&mut bells)
                .map_err(|source| Error::IO { source })?;
            if read == 0 {
                return Ok(None);
            }
        }
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        while !self.responses.try_write(frame)? {
            std::thread::sleep(SPACE_POLL);
        }
        self.doorbell_out
            .write_all(&DOORBELL)
            .and_then(|_| self.doorbell_out.flush())
            .map_err(|source| Error::IO { source })
    }

    fn max_frame_bytes(&self) -> usize {
        self.responses.max_payload()
    }
}
