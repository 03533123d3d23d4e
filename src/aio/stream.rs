//! Windowed, demand-driven reader and ack-ordered writer built on [`super::AioContext`].
//! Each stream owns a dedicated OS thread, since `io_getevents` blocks and a
//! tight reap loop has no business sharing a tokio worker thread with other tasks;
//! the public API is `async` and talks to that thread over channels.

use super::{AioContext, BufferPool, CompletedOperation};
use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// What a stream does when a single in-flight operation completes with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log and keep going; the failed buffer's data is dropped.
    Ignore,
    /// Stop accepting new work but let already-acked operations stand.
    Stop,
    /// Surface the error to the consumer and stop.
    Propagate,
}

/// Lifecycle shared by both stream kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Ready,
    Running,
    Stopping,
    Stopped,
}

fn next_user_data() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Data delivered to an [`AioReader`] consumer, or the terminal condition that ends
/// the stream.
#[derive(Debug)]
pub enum ReaderEvent {
    Data(Vec<u8>),
    Eof,
    Error(Error),
}

enum ReaderCommand {
    Demand,
    Stop,
}

/// A demand-driven reader over a FunctionFS OUT endpoint. The consumer calls
/// [`AioReader::demand`] once per buffer it is ready to receive; the worker thread
/// only keeps that many reads in flight, so a slow consumer naturally backpressures
/// the kernel side instead of the worker buffering unboundedly.
pub struct AioReader {
    state: Arc<std::sync::Mutex<StreamState>>,
    command_tx: mpsc::UnboundedSender<ReaderCommand>,
    event_rx: mpsc::UnboundedReceiver<ReaderEvent>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl AioReader {
    pub fn spawn(fd: RawFd, buffer_size: usize, window_size: usize, error_policy: ErrorPolicy) -> Result<Self> {
        let state = Arc::new(std::sync::Mutex::new(StreamState::Ready));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let worker_state = state.clone();
        let join = std::thread::Builder::new()
            .name("aio-reader".into())
            .spawn(move || reader_loop(fd, buffer_size, window_size, error_policy, worker_state, command_rx, event_tx))
            .map_err(|e| Error::StateError(format!("failed to spawn reader thread: {e}")))?;

        Ok(Self { state, command_tx, event_rx, join: Some(join) })
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap()
    }

    /// Signals readiness for one more buffer. Calling this `window_size` times up
    /// front reproduces always-on streaming; calling it once per consumed event
    /// reproduces strict backpressure.
    pub fn demand(&self) {
        let _ = self.command_tx.send(ReaderCommand::Demand);
    }

    /// Awaits the next event. Returns `None` once the stream has fully stopped and
    /// drained.
    pub async fn next_event(&mut self) -> Option<ReaderEvent> {
        self.event_rx.recv().await
    }

    /// Requests a graceful stop: in-flight reads are cancelled and the worker thread
    /// exits after reaping them.
    pub async fn stop(mut self) {
        let _ = self.command_tx.send(ReaderCommand::Stop);
        if let Some(join) = self.join.take() {
            let _ = tokio::task::spawn_blocking(move || join.join()).await;
        }
    }
}

fn reader_loop(
    fd: RawFd,
    buffer_size: usize,
    window_size: usize,
    error_policy: ErrorPolicy,
    state: Arc<std::sync::Mutex<StreamState>>,
    mut command_rx: mpsc::UnboundedReceiver<ReaderCommand>,
    event_tx: mpsc::UnboundedSender<ReaderEvent>,
) {
    *state.lock().unwrap() = StreamState::Running;

    let mut ctx = match AioContext::new(window_size as u32) {
        Ok(ctx) => ctx,
        Err(err) => {
            let _ = event_tx.send(ReaderEvent::Error(err));
            *state.lock().unwrap() = StreamState::Stopped;
            return;
        }
    };
    let mut pool = BufferPool::new(window_size, buffer_size);
    let mut outstanding: HashMap<u64, Vec<u8>> = HashMap::new();
    let mut credits: usize = 0;
    let mut stopping = false;

    'outer: loop {
        while let Ok(cmd) = command_rx.try_recv() {
            match cmd {
                ReaderCommand::Demand => credits += 1,
                ReaderCommand::Stop => stopping = true,
            }
        }
        if stopping {
            *state.lock().unwrap() = StreamState::Stopping;
            break;
        }

        while credits > 0 {
            let Some(buf) = pool.acquire() else { break };
            let user_data = next_user_data();
            let ptr = buf.as_ptr() as *mut u8;
            let len = buf.len();
            outstanding.insert(user_data, buf);
            if let Err(err) = ctx.submit_read(fd, ptr, len, user_data) {
                outstanding.remove(&user_data);
                if handle_error(&error_policy, err, &event_tx) {
                    break 'outer;
                }
                continue;
            }
            credits -= 1;
        }

        if ctx.in_flight_count() == 0 {
            // Nothing outstanding and no credit to submit more: block briefly on the
            // command channel instead of busy-looping.
            match command_rx.blocking_recv() {
                Some(ReaderCommand::Demand) => credits += 1,
                Some(ReaderCommand::Stop) | None => break,
            }
            continue;
        }

        let events = match ctx.get_events(1, window_size as u32, Some(Duration::from_millis(200))) {
            Ok(events) => events,
            Err(err) => {
                if handle_error(&error_policy, err, &event_tx) {
                    break;
                }
                continue;
            }
        };

        for ev in events {
            let mut buf = outstanding.remove(&ev.user_data).unwrap_or_default();
            match classify_read(&ev) {
                Ok(0) => {
                    let _ = event_tx.send(ReaderEvent::Eof);
                    pool.release(buf);
                    break 'outer;
                }
                Ok(n) => {
                    buf.truncate(n);
                    let _ = event_tx.send(ReaderEvent::Data(buf));
                }
                Err(err) => {
                    pool.release(std::mem::take(&mut buf));
                    if handle_error(&error_policy, err, &event_tx) {
                        break 'outer;
                    }
                }
            }
        }
    }

    ctx.cancel_all();
    let _ = ctx.get_events(0, window_size as u32, Some(Duration::from_millis(50)));
    ctx.dispose();
    *state.lock().unwrap() = StreamState::Stopped;
}

fn classify_read(ev: &CompletedOperation) -> Result<usize> {
    ev.as_result()
}

fn handle_error(policy: &ErrorPolicy, err: Error, event_tx: &mpsc::UnboundedSender<ReaderEvent>) -> bool {
    match policy {
        ErrorPolicy::Ignore => {
            log::debug!("aio reader ignoring error: {err}");
            false
        }
        ErrorPolicy::Stop => {
            log::warn!("aio reader stopping after error: {err}");
            true
        }
        ErrorPolicy::Propagate => {
            let _ = event_tx.send(ReaderEvent::Error(err));
            true
        }
    }
}

struct WriteRequest {
    data: Vec<u8>,
    ack: oneshot::Sender<Result<usize>>,
}

/// Bookkeeping for one caller-visible [`AioWriter::write`] call, which may be
/// split across several pooled-buffer-sized AIO operations.
struct PendingRequest {
    remaining_chunks: usize,
    total_bytes: usize,
    failed: Option<Error>,
    ack: oneshot::Sender<Result<usize>>,
}

/// Metadata recovered when a chunk's AIO operation completes: which request it
/// belongs to, how many bytes it was submitted with, and the pooled buffer to
/// hand back.
struct InFlightChunk {
    request_id: u64,
    expected_len: usize,
    buf: Vec<u8>,
}

enum WriterCommand {
    Write(WriteRequest),
    Flush(oneshot::Sender<Result<()>>),
    Stop,
}

/// An ack-on-completion writer over a FunctionFS IN endpoint. [`AioWriter::write`]
/// resolves only once the kernel has actually transferred the bytes (never ack
/// before completion), and resolves in submission order even though the kernel
/// may complete operations out of order.
pub struct AioWriter {
    state: Arc<std::sync::Mutex<StreamState>>,
    command_tx: mpsc::UnboundedSender<WriterCommand>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl AioWriter {
    pub fn spawn(fd: RawFd, buffer_size: usize, window_size: usize) -> Result<Self> {
        let state = Arc::new(std::sync::Mutex::new(StreamState::Ready));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let worker_state = state.clone();
        let join = std::thread::Builder::new()
            .name("aio-writer".into())
            .spawn(move || writer_loop(fd, buffer_size, window_size, worker_state, command_rx))
            .map_err(|e| Error::StateError(format!("failed to spawn writer thread: {e}")))?;

        Ok(Self { state, command_tx, join: Some(join) })
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap()
    }

    /// Queues `data` for transmission. The returned future resolves to the number of
    /// bytes transferred once the kernel reports completion, not when the write is
    /// merely accepted into the window.
    pub async fn write(&self, data: Vec<u8>) -> Result<usize> {
        let (ack, rx) = oneshot::channel();
        self.command_tx
            .send(WriterCommand::Write(WriteRequest { data, ack }))
            .map_err(|_| Error::StateError("writer thread has exited".into()))?;
        rx.await.map_err(|_| Error::StateError("writer thread dropped the ack channel".into()))?
    }

    /// Waits until every write queued before this call has been acked. A barrier,
    /// not a kernel fsync (FunctionFS endpoints have no durability concept).
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(WriterCommand::Flush(tx))
            .map_err(|_| Error::StateError("writer thread has exited".into()))?;
        rx.await.map_err(|_| Error::StateError("writer thread dropped the flush channel".into()))?
    }

    pub async fn stop(mut self) {
        let _ = self.command_tx.send(WriterCommand::Stop);
        if let Some(join) = self.join.take() {
            let _ = tokio::task::spawn_blocking(move || join.join()).await;
        }
    }
}

fn writer_loop(
    fd: RawFd,
    buffer_size: usize,
    window_size: usize,
    state: Arc<std::sync::Mutex<StreamState>>,
    mut command_rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    *state.lock().unwrap() = StreamState::Running;

    let mut ctx = match AioContext::new(window_size as u32) {
        Ok(ctx) => ctx,
        Err(err) => {
            log::error!("aio writer failed to create context: {err}");
            *state.lock().unwrap() = StreamState::Stopped;
            return;
        }
    };
    let mut pool = BufferPool::new(window_size, buffer_size);

    // Request ids in issue order; acks only release from the front, even though
    // a request's chunks may finish out of order relative to other requests'.
    let mut order: VecDeque<u64> = VecDeque::new();
    let mut requests: HashMap<u64, PendingRequest> = HashMap::new();
    // Chunks split out of a request's data but not yet handed to the kernel,
    // because every pooled buffer is currently in flight.
    let mut chunk_queue: VecDeque<(u64, Vec<u8>)> = VecDeque::new();
    let mut in_flight_chunks: HashMap<u64, InFlightChunk> = HashMap::new();
    let mut flush_waiters: Vec<oneshot::Sender<Result<()>>> = Vec::new();
    let mut stopping = false;

    loop {
        let have_room = chunk_queue.len() < window_size;
        let cmd = if have_room {
            match command_rx.try_recv() {
                Ok(cmd) => Some(cmd),
                Err(mpsc::error::TryRecvError::Empty) if order.is_empty() && chunk_queue.is_empty() && !stopping => {
                    command_rx.blocking_recv()
                }
                Err(_) => None,
            }
        } else {
            None
        };

        if let Some(cmd) = cmd {
            match cmd {
                WriterCommand::Write(req) => {
                    let request_id = next_user_data();
                    let chunks: Vec<Vec<u8>> = if req.data.is_empty() {
                        vec![Vec::new()]
                    } else {
                        req.data.chunks(buffer_size).map(|c| c.to_vec()).collect()
                    };
                    requests.insert(
                        request_id,
                        PendingRequest { remaining_chunks: chunks.len(), total_bytes: 0, failed: None, ack: req.ack },
                    );
                    order.push_back(request_id);
                    for chunk in chunks {
                        chunk_queue.push_back((request_id, chunk));
                    }
                }
                WriterCommand::Flush(tx) => {
                    if order.is_empty() {
                        let _ = tx.send(Ok(()));
                    } else {
                        flush_waiters.push(tx);
                    }
                }
                WriterCommand::Stop => stopping = true,
            }
        }

        while let Some(mut buf) = pool.acquire() {
            let Some((request_id, chunk)) = chunk_queue.pop_front() else {
                pool.release(buf);
                break;
            };
            buf[..chunk.len()].copy_from_slice(&chunk);
            let user_data = next_user_data();
            let ptr = buf.as_ptr();
            let len = chunk.len();
            in_flight_chunks.insert(user_data, InFlightChunk { request_id, expected_len: len, buf });
            if let Err(err) = ctx.submit_write(fd, ptr, len, user_data) {
                let InFlightChunk { buf, .. } = in_flight_chunks.remove(&user_data).expect("just inserted");
                pool.release(buf);
                fail_request(&mut requests, request_id, err);
            }
        }

        if stopping && order.is_empty() {
            break;
        }

        if ctx.in_flight_count() > 0 {
            match ctx.get_events(1, window_size as u32, Some(Duration::from_millis(200))) {
                Ok(events) => {
                    for ev in events {
                        let Some(InFlightChunk { request_id, expected_len, buf }) = in_flight_chunks.remove(&ev.user_data) else {
                            continue;
                        };
                        pool.release(buf);
                        match ev.as_result() {
                            Ok(n) if n == expected_len => {
                                if let Some(req) = requests.get_mut(&request_id) {
                                    req.total_bytes += n;
                                    req.remaining_chunks = req.remaining_chunks.saturating_sub(1);
                                }
                            }
                            Ok(n) => {
                                fail_request(
                                    &mut requests,
                                    request_id,
                                    Error::StateError(format!("partial write: {n} of {expected_len} bytes")),
                                );
                            }
                            Err(err) => fail_request(&mut requests, request_id, err),
                        }
                    }
                }
                Err(err) => log::warn!("aio writer get_events failed: {err}"),
            }
        }

        while let Some(&front) = order.front() {
            let done = requests.get(&front).map(|r| r.remaining_chunks == 0).unwrap_or(true);
            if !done {
                break;
            }
            order.pop_front();
            if let Some(req) = requests.remove(&front) {
                let result = match req.failed {
                    Some(err) => Err(err),
                    None => Ok(req.total_bytes),
                };
                let _ = req.ack.send(result);
            }
            if order.is_empty() {
                for waiter in flush_waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
    }

    ctx.cancel_all();
    for waiter in flush_waiters.drain(..) {
        let _ = waiter.send(Err(Error::Cancelled));
    }
    for (_, req) in requests.drain() {
        let _ = req.ack.send(Err(Error::Cancelled));
    }
    ctx.dispose();
    *state.lock().unwrap() = StreamState::Stopped;
}

/// Marks a request as failed without releasing chunks already queued or in
/// flight for it; those still complete normally and are simply ignored once
/// `remaining_chunks` drops to zero, at which point the stored error wins.
fn fail_request(requests: &mut HashMap<u64, PendingRequest>, request_id: u64, err: Error) {
    if let Some(req) = requests.get_mut(&request_id) {
        req.remaining_chunks = req.remaining_chunks.saturating_sub(1);
        if req.failed.is_none() {
            req.failed = Some(err);
        }
    }
}
