//! Worker process supervision.
//!
//! A [`WorkerExecutor`] owns a fixed number of slots, each running at most one
//! `template-worker` process for a single template. Per worker there is one
//! writer task owning the transport sink and one reader task owning the
//! source; callers only enqueue encoded frames and wait on a oneshot receiver
//! registered under the request id. A worker that crashes, stops responding,
//! or breaks the transport is terminated and every request it still owes is
//! failed. Its slot is respawned lazily by the next caller.

use crate::config::ExecutorConfig;
use crate::error::Error;
use crate::event::Event;
use crate::metrics::SharedReporter;
use crate::protocol::{RequestFrame, Response, ResponseFrame};
use crate::template::Template;
use crate::transport::{FrameSink, FrameSource, Transport};
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_retry::RetryIf;
use tracing::{debug, error, info, warn};

/// Liveness of a single worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Health {
    /// Spawned or being spawned, handshake not yet complete.
    Starting,
    /// Answering requests.
    Ready,
    /// Several consecutive requests timed out.
    Degraded,
    /// Terminated; the slot is respawned on demand.
    Dead,
}

impl Health {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Health::Starting,
            1 => Health::Ready,
            2 => Health::Degraded,
            _ => Health::Dead,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Health::Starting => 0,
            Health::Ready => 1,
            Health::Degraded => 2,
            Health::Dead => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Starting => "starting",
            Health::Ready => "ready",
            Health::Degraded => "degraded",
            Health::Dead => "dead",
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a worker stopped accepting requests.
#[derive(Debug, Clone)]
enum Termination {
    Lost(String),
    Closed,
}

impl Termination {
    fn error(&self) -> Error {
        match self {
            Termination::Lost(reason) => Error::WorkerLost {
                reason: reason.clone(),
            },
            Termination::Closed => Error::Closed,
        }
    }
}

type Responder = oneshot::Sender<Result<Value, Error>>;

#[derive(Default)]
struct Pending {
    /// Requests awaiting a response, keyed by frame id.
    waiting: HashMap<u64, Responder>,
    /// Set exactly once; no request is registered afterwards.
    terminated: Option<Termination>,
}

/// One live worker process and its bookkeeping.
pub(crate) struct WorkerHandle<T: Transport> {
    /// Process id reported in the ready acknowledgment.
    pid: u32,
    /// Template name, for logs.
    template: String,
    /// Queue feeding the writer task; taken on termination.
    frames: parking_lot::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pending: parking_lot::Mutex<Pending>,
    health: AtomicU8,
    in_flight: AtomicUsize,
    consecutive_timeouts: AtomicU32,
    child: parking_lot::Mutex<Option<Child>>,
    reporter: SharedReporter,
    max_frame_bytes: usize,
    /// Keeps per-worker transport resources alive.
    _transport: T,
}

impl<T: Transport> WorkerHandle<T> {
    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn health(&self) -> Health {
        Health::from_u8(self.health.load(Ordering::Acquire))
    }

    fn is_alive(&self) -> bool {
        self.health() != Health::Dead
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn register(&self, id: u64) -> Result<oneshot::Receiver<Result<Value, Error>>, Error> {
        let mut pending = self.pending.lock();
        if let Some(termination) = &pending.terminated {
            return Err(termination.error());
        }
        let (tx, rx) = oneshot::channel();
        pending.waiting.insert(id, tx);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(rx)
    }

    fn deregister(&self, id: u64) {
        self.pending.lock().waiting.remove(&id);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    async fn enqueue(&self, frame: Vec<u8>) -> Result<(), Error> {
        let sender = self.frames.lock().clone();
        let Some(sender) = sender else {
            return Err(self.termination_error());
        };
        sender
            .send(frame)
            .await
            .map_err(|_| self.termination_error())
    }

    fn termination_error(&self) -> Error {
        self.pending
            .lock()
            .terminated
            .as_ref()
            .map(Termination::error)
            .unwrap_or_else(|| Error::WorkerLost {
                reason: "worker queue closed".to_string(),
            })
    }

    fn dispatch(&self, response: ResponseFrame) {
        let result = match response.body {
            Response::Result(value) => Ok(value),
            Response::Error(message) => Err(Error::Evaluation { message }),
            Response::Ready { .. } => {
                warn!(template = %self.template, pid = self.pid, "unexpected ready frame");
                return;
            }
        };
        let responder = self.pending.lock().waiting.remove(&response.id);
        match responder {
            Some(responder) => {
                let _ = responder.send(result);
            }
            None => {
                warn!(
                    template = %self.template,
                    pid = self.pid,
                    id = response.id,
                    "response for unknown request"
                );
            }
        }
    }

    /// Fails every waiting request. Returns `false` if already terminated.
    fn terminate(&self, termination: Termination) -> bool {
        let waiting = {
            let mut pending = self.pending.lock();
            if pending.terminated.is_some() {
                return false;
            }
            pending.terminated = Some(termination.clone());
            std::mem::take(&mut pending.waiting)
        };
        self.health.store(Health::Dead.as_u8(), Ordering::Release);
        for (_, responder) in waiting {
            let _ = responder.send(Err(termination.error()));
        }
        true
    }

    /// Terminates the worker after a failure and kills the process.
    fn crash(&self, cause: Error) {
        if !self.terminate(Termination::Lost(cause.to_string())) {
            return;
        }
        warn!(template = %self.template, pid = self.pid, %cause, "template worker lost");
        self.reporter.report(cause.kind());
        self.frames.lock().take();
        if let Some(child) = self.child.lock().as_mut() {
            let _ = child.start_kill();
        }
    }

    fn record_response(&self) {
        self.consecutive_timeouts.store(0, Ordering::Release);
        let _ = self.health.compare_exchange(
            Health::Degraded.as_u8(),
            Health::Ready.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn record_timeout(&self, config: &ExecutorConfig) {
        let timeouts = self.consecutive_timeouts.fetch_add(1, Ordering::AcqRel) + 1;
        if timeouts >= config.recycle_after_timeouts {
            self.crash(Error::WorkerLost {
                reason: format!("recycled after {} consecutive timeouts", timeouts),
            });
        } else if timeouts >= config.degraded_after_timeouts
            && self
                .health
                .compare_exchange(
                    Health::Ready.as_u8(),
                    Health::Degraded.as_u8(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            warn!(template = %self.template, pid = self.pid, timeouts, "template worker degraded");
        }
    }

    /// Graceful stop: fail waiters with `Closed`, ask the worker to exit and
    /// kill it if it is still around after `grace`.
    async fn shutdown(&self, grace: Duration) {
        self.terminate(Termination::Closed);
        let sender = self.frames.lock().take();
        if let Some(sender) = sender {
            if let Ok(frame) = RequestFrame::shutdown().encode() {
                let _ = sender.try_send(frame);
            }
        }
        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return;
        };
        match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!(template = %self.template, pid = self.pid, %status, "template worker exited"),
            Ok(Err(err)) => warn!(template = %self.template, pid = self.pid, %err, "waiting for template worker failed"),
            Err(_) => {
                warn!(template = %self.template, pid = self.pid, ?grace, "template worker ignored shutdown, killing");
                if let Err(err) = child.kill().await {
                    warn!(template = %self.template, pid = self.pid, %err, "failed to kill template worker");
                }
            }
        }
    }
}

/// Removes a registered request when the caller stops waiting, whatever the reason.
struct PendingGuard<'a, T: Transport> {
    worker: &'a WorkerHandle<T>,
    id: u64,
}

impl<T: Transport> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        self.worker.deregister(self.id);
    }
}

enum Slot<T: Transport> {
    Empty,
    Running(Arc<WorkerHandle<T>>),
    Failed(String),
    Closed,
}

/// Executes one template in worker processes reached over transport `T`.
pub struct WorkerExecutor<T: Transport> {
    /// Template served by every worker of this executor.
    template: Arc<Template>,
    /// Timeouts, pool size, transport settings.
    config: Arc<ExecutorConfig>,
    /// Receives worker-level failures.
    reporter: SharedReporter,
    slots: Vec<tokio::sync::Mutex<Slot<T>>>,
    /// Next request id; `0` is reserved for control frames.
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl<T: Transport> WorkerExecutor<T> {
    /// Spawns the worker pool. Fails with the last spawn or handshake error
    /// once the retry budget is spent.
    #[tracing::instrument(skip_all, fields(template = %template.name, transport = %T::KIND))]
    pub async fn start(
        template: Arc<Template>,
        config: Arc<ExecutorConfig>,
        reporter: SharedReporter,
    ) -> Result<Self, Error> {
        let pool_size = config.worker.pool_size.max(1);
        let executor = Self {
            template,
            config,
            reporter,
            slots: (0..pool_size)
                .map(|_| tokio::sync::Mutex::new(Slot::Empty))
                .collect(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        };
        for slot in &executor.slots {
            match executor.spawn_with_retry().await {
                Ok(handle) => *slot.lock().await = Slot::Running(handle),
                Err(err) => {
                    let _ = executor.close().await;
                    return Err(err);
                }
            }
        }
        info!(pool_size, "template executor started");
        Ok(executor)
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub(crate) fn reporter(&self) -> &SharedReporter {
        &self.reporter
    }

    /// Sends one event to the least-loaded worker and waits for its answer.
    pub async fn process_event(&self, event: &Event) -> Result<Value, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let worker = self.acquire().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = RequestFrame::event(id, event).encode()?;
        if frame.len() > worker.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                size: frame.len(),
                capacity: worker.max_frame_bytes,
            });
        }

        let rx = worker.register(id)?;
        let _guard = PendingGuard {
            worker: &worker,
            id,
        };
        worker.enqueue(frame).await?;

        let request_timeout = self.config.request_timeout();
        match timeout(request_timeout, rx).await {
            Ok(Ok(result)) => {
                worker.record_response();
                result
            }
            Ok(Err(_)) => Err(worker.termination_error()),
            Err(_) => {
                worker.record_timeout(&self.config);
                Err(Error::Timeout {
                    timeout: request_timeout,
                })
            }
        }
    }

    /// Stops every worker. Outstanding requests fail with [`Error::Closed`].
    /// Calling it again is a no-op.
    #[tracing::instrument(skip(self), fields(template = %self.template.name))]
    pub async fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut handles = Vec::new();
        for slot in &self.slots {
            let mut slot = slot.lock().await;
            if let Slot::Running(handle) = std::mem::replace(&mut *slot, Slot::Closed) {
                handles.push(handle);
            }
        }
        let grace = self.config.shutdown_grace();
        futures_util::future::join_all(handles.iter().map(|handle| handle.shutdown(grace))).await;
        info!(workers = handles.len(), "template executor closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Best health across slots; `Dead` once closed or when every slot failed.
    pub fn health(&self) -> Health {
        if self.is_closed() {
            return Health::Dead;
        }
        self.slots
            .iter()
            .map(|slot| match slot.try_lock() {
                Ok(slot) => match &*slot {
                    Slot::Running(handle) => handle.health(),
                    Slot::Empty => Health::Starting,
                    Slot::Failed(_) | Slot::Closed => Health::Dead,
                },
                Err(_) => Health::Starting,
            })
            .min_by_key(|health| match health {
                Health::Ready => 0,
                Health::Degraded => 1,
                Health::Starting => 2,
                Health::Dead => 3,
            })
            .unwrap_or(Health::Dead)
    }

    /// Process ids of the live workers.
    pub fn worker_pids(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.try_lock() {
                Ok(slot) => match &*slot {
                    Slot::Running(handle) if handle.is_alive() => Some(handle.pid()),
                    _ => None,
                },
                Err(_) => None,
            })
            .collect()
    }

    /// Least-loaded live worker, respawning a dead slot when it is picked.
    async fn acquire(&self) -> Result<Arc<WorkerHandle<T>>, Error> {
        let mut chosen = 0;
        let mut lowest = usize::MAX;
        for (index, slot) in self.slots.iter().enumerate() {
            let load = match slot.try_lock() {
                Ok(slot) => match &*slot {
                    Slot::Running(handle) if handle.is_alive() => handle.in_flight(),
                    Slot::Failed(_) | Slot::Closed => continue,
                    _ => 0,
                },
                // Someone else is respawning this slot.
                Err(_) => usize::MAX - 1,
            };
            if load < lowest {
                lowest = load;
                chosen = index;
            }
        }

        let mut slot = self.slots[chosen].lock().await;
        if self.is_closed() {
            return Err(Error::Closed);
        }
        match &*slot {
            Slot::Running(handle) if handle.is_alive() => return Ok(Arc::clone(handle)),
            Slot::Failed(message) => return Err(self.exhausted(message.clone())),
            Slot::Closed => return Err(Error::Closed),
            _ => {}
        }

        info!(template = %self.template.name, "respawning template worker");
        match self.spawn_with_retry().await {
            Ok(handle) => {
                *slot = Slot::Running(Arc::clone(&handle));
                Ok(handle)
            }
            Err(err) => {
                error!(template = %self.template.name, %err, "template worker respawn exhausted");
                *slot = Slot::Failed(err.to_string());
                Err(Error::RespawnExhausted {
                    attempts: self.config.retry().attempts(),
                    source: Box::new(err),
                })
            }
        }
    }

    fn exhausted(&self, message: String) -> Error {
        Error::RespawnExhausted {
            attempts: self.config.retry().attempts(),
            source: Box::new(Error::WorkerLost { reason: message }),
        }
    }

    async fn spawn_with_retry(&self) -> Result<Arc<WorkerHandle<T>>, Error> {
        let retry = self.config.retry();
        RetryIf::start(
            retry.strategy(),
            || async {
                match spawn_worker::<T>(&self.template, &self.config, &self.reporter).await {
                    Ok(handle) => Ok(handle),
                    Err(err) => {
                        warn!(template = %self.template.name, %err, "template worker spawn attempt failed");
                        self.reporter.report(err.kind());
                        Err(err)
                    }
                }
            },
            |err: &Error| err.is_retryable(),
        )
        .await
    }
}

/// Spawns one worker and completes the handshake.
#[tracing::instrument(skip_all, fields(template = %template.name, transport = %T::KIND))]
async fn spawn_worker<T: Transport>(
    template: &Template,
    config: &ExecutorConfig,
    reporter: &SharedReporter,
) -> Result<Arc<WorkerHandle<T>>, Error> {
    let program = config.worker.resolve_command();
    let mut command = Command::new(&program);
    command
        .args(&config.worker.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut transport = T::prepare(config, &mut command)?;

    let mut child = command.spawn().map_err(|source| Error::Spawn {
        command: program.display().to_string(),
        source,
    })?;
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        return Err(Error::Handshake {
            message: "worker standard streams unavailable".to_string(),
        });
    };
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_stderr(template.name.clone(), child.id().unwrap_or_default(), stderr));
    }

    let (mut sink, mut source) = transport.attach(stdin, stdout)?;
    let pid = handshake(&mut sink, &mut source, template, config.handshake_timeout()).await?;

    let (frames_tx, frames_rx) = mpsc::channel(config.worker.queue_capacity.max(1));
    let handle = Arc::new(WorkerHandle {
        pid,
        template: template.name.clone(),
        frames: parking_lot::Mutex::new(Some(frames_tx)),
        pending: parking_lot::Mutex::new(Pending::default()),
        health: AtomicU8::new(Health::Ready.as_u8()),
        in_flight: AtomicUsize::new(0),
        consecutive_timeouts: AtomicU32::new(0),
        child: parking_lot::Mutex::new(Some(child)),
        reporter: Arc::clone(reporter),
        max_frame_bytes: transport.max_frame_bytes(),
        _transport: transport,
    });
    tokio::spawn(write_loop(
        Arc::downgrade(&handle),
        sink,
        frames_rx,
        config.write_timeout(),
    ));
    tokio::spawn(read_loop(Arc::downgrade(&handle), source));

    info!(pid, "template worker started");
    Ok(handle)
}

async fn handshake<S: FrameSink, R: FrameSource>(
    sink: &mut S,
    source: &mut R,
    template: &Template,
    deadline: Duration,
) -> Result<u32, Error> {
    let init = RequestFrame::init(&template.name, &template.source).encode()?;
    let exchange = async {
        sink.send(&init).await?;
        match source.receive().await? {
            Some(frame) => {
                let response = ResponseFrame::decode(&frame)?;
                match response.body {
                    Response::Ready { pid } => Ok(pid),
                    Response::Error(message) => Err(Error::Compilation { message }),
                    Response::Result(_) => Err(Error::Handshake {
                        message: "unexpected result during handshake".to_string(),
                    }),
                }
            }
            None => Err(Error::Handshake {
                message: "worker exited during handshake".to_string(),
            }),
        }
    };
    match timeout(deadline, exchange).await {
        Ok(Ok(pid)) => Ok(pid),
        Ok(Err(err @ Error::Compilation { .. })) => Err(err),
        Ok(Err(err)) => Err(Error::Handshake {
            message: err.to_string(),
        }),
        Err(_) => Err(Error::Handshake {
            message: format!("no ready acknowledgment within {:?}", deadline),
        }),
    }
}

/// Sole owner of the sink. Exits when the queue closes or a write fails.
async fn write_loop<T: Transport>(
    worker: Weak<WorkerHandle<T>>,
    mut sink: T::Sink,
    mut frames: mpsc::Receiver<Vec<u8>>,
    write_timeout: Duration,
) {
    while let Some(frame) = frames.recv().await {
        let failure = match timeout(write_timeout, sink.send(&frame)).await {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => Error::transport(format!("write failed: {}", err)),
            Err(_) => Error::transport(format!("write exceeded {:?}", write_timeout)),
        };
        if let Some(worker) = worker.upgrade() {
            worker.crash(failure);
        }
        return;
    }
}

/// Sole owner of the source. Routes responses to their waiting callers.
async fn read_loop<T: Transport>(worker: Weak<WorkerHandle<T>>, mut source: T::Source) {
    loop {
        let received = source.receive().await;
        let Some(worker) = worker.upgrade() else {
            return;
        };
        match received {
            Ok(Some(frame)) => match ResponseFrame::decode(&frame) {
                Ok(response) => worker.dispatch(response),
                Err(err) => {
                    worker.crash(Error::transport(format!("malformed frame: {}", err)));
                    return;
                }
            },
            Ok(None) => {
                worker.crash(Error::WorkerLost {
                    reason: "worker closed its output".to_string(),
                });
                return;
            }
            Err(err) => {
                worker.crash(err);
                return;
            }
        }
    }
}

async fn forward_stderr(template: String, pid: u32, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(template = %template, pid, "worker: {}", line);
    }
}
