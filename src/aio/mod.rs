//! Linux kernel AIO (`io_setup`/`io_submit`/`io_getevents`/`io_cancel`/`io_destroy`),
//! the async engine underneath the windowed endpoint streams.
//!
//! Glibc does not wrap these five syscalls (that is `libaio.so`'s job), and this crate
//! does not link `libaio.so`: the syscalls themselves are stable kernel ABI, so they
//! are issued directly through `libc::syscall`. This also sidesteps `libaio`'s odd
//! calling convention around `io_context_t` being an opaque pointer-sized handle.

pub mod stream;

use crate::error::{Context, Error, Result};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::time::Duration;

/// Opaque AIO context handle (`aio_context_t` in `<linux/aio_abi.h>`).
pub type AioContextId = u64;

const IOCB_CMD_PREAD: u16 = 0;
const IOCB_CMD_PWRITE: u16 = 1;

/// Smallest and largest ring size this crate will ask `io_setup` for. The kernel
/// has no hard lower bound and an essentially arbitrary upper one (bounded by
/// `/proc/sys/fs/aio-max-nr`), so this is an application-level sanity cap, not
/// a kernel limit.
const MIN_MAX_EVENTS: u32 = 1;
const MAX_MAX_EVENTS: u32 = 65536;

/// Mirrors `struct iocb` from `<linux/aio_abi.h>`. Field order after `aio_lio_opcode`
/// matches the little-endian `PADDED` expansion; this crate only targets LE
/// architectures (x86_64/aarch64), consistent with every other Linux-only assumption
/// already baked into this module.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawIocb {
    aio_data: u64,
    aio_key: u32,
    aio_rw_flags: u32,
    aio_lio_opcode: u16,
    aio_reqprio: i16,
    aio_fildes: u32,
    aio_buf: u64,
    aio_nbytes: u64,
    aio_offset: i64,
    aio_reserved2: u64,
    aio_flags: u32,
    aio_resfd: u32,
}

/// Mirrors `struct io_event`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RawIoEvent {
    data: u64,
    obj: u64,
    res: i64,
    res2: i64,
}

/// A completed AIO operation, as reaped from `io_getevents`.
#[derive(Debug, Clone, Copy)]
pub struct CompletedOperation {
    /// The `user_data` token the caller supplied when submitting.
    pub user_data: u64,
    /// Bytes transferred on success; a negative `-errno` on failure.
    pub result: i64,
}

impl CompletedOperation {
    pub fn is_error(&self) -> bool {
        self.result < 0
    }

    pub fn as_result(&self) -> Result<usize> {
        if self.result < 0 {
            let errno = nix::errno::Errno::from_i32(-self.result as i32);
            Err(Error::from_errno(errno, "io_getevents", Context::Description(format!("user_data={}", self.user_data))))
        } else {
            Ok(self.result as usize)
        }
    }
}

/// A submitted-but-not-yet-reaped operation, tracked so `cancel_all` and disposal
/// logic know what is outstanding.
#[derive(Debug, Clone, Copy)]
pub struct TrackedOperation {
    pub user_data: u64,
    pub fd: RawFd,
    pub is_write: bool,
}

/// One operation to hand to [`AioContext::submit`]. The pointer fields carry the
/// same ownership contract as `submit_read`/`submit_write`: the buffer must stay
/// valid and uniquely owned by the kernel until the matching completion is reaped.
#[derive(Debug, Clone, Copy)]
pub enum SubmitOp {
    Read { fd: RawFd, buf: *mut u8, len: usize, user_data: u64 },
    Write { fd: RawFd, buf: *const u8, len: usize, user_data: u64 },
}

impl SubmitOp {
    fn fd(&self) -> RawFd {
        match *self {
            SubmitOp::Read { fd, .. } | SubmitOp::Write { fd, .. } => fd,
        }
    }

    fn user_data(&self) -> u64 {
        match *self {
            SubmitOp::Read { user_data, .. } | SubmitOp::Write { user_data, .. } => user_data,
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, SubmitOp::Write { .. })
    }

    fn to_iocb(&self) -> RawIocb {
        match *self {
            SubmitOp::Read { fd, buf, len, user_data } => RawIocb {
                aio_data: user_data,
                aio_fildes: fd as u32,
                aio_lio_opcode: IOCB_CMD_PREAD,
                aio_buf: buf as u64,
                aio_nbytes: len as u64,
                ..Default::default()
            },
            SubmitOp::Write { fd, buf, len, user_data } => RawIocb {
                aio_data: user_data,
                aio_fildes: fd as u32,
                aio_lio_opcode: IOCB_CMD_PWRITE,
                aio_buf: buf as u64,
                aio_nbytes: len as u64,
                ..Default::default()
            },
        }
    }
}

/// A thin wrapper around a kernel AIO ring, plus the bookkeeping needed to cancel
/// everything in flight before tearing the ring down (`io_destroy` fails/hangs if
/// operations are still outstanding on some kernels, so this crate always drains
/// first).
pub struct AioContext {
    ctx: AioContextId,
    max_events: u32,
    in_flight: VecDeque<TrackedOperation>,
}

impl AioContext {
    /// Creates a new AIO ring able to hold `max_events` concurrent operations.
    ///
    /// Rejects `max_events` outside `[1, 65536]` before ever calling `io_setup`:
    /// the kernel would happily accept 0 (and then reject every submission one
    /// at a time), which is a worse failure mode than refusing it up front.
    pub fn new(max_events: u32) -> Result<Self> {
        if !(MIN_MAX_EVENTS..=MAX_MAX_EVENTS).contains(&max_events) {
            return Err(Error::InvalidArgument {
                syscall: "io_setup",
                context: Context::Description(format!(
                    "max_events={max_events} outside [{MIN_MAX_EVENTS}, {MAX_MAX_EVENTS}]"
                )),
                source: nix::errno::Errno::EINVAL,
            });
        }
        let mut ctx: AioContextId = 0;
        let rc = unsafe { libc::syscall(libc::SYS_io_setup, max_events, &mut ctx as *mut AioContextId) };
        if rc < 0 {
            return Err(Error::from_last_errno("io_setup", Context::Description(format!("max_events={max_events}"))));
        }
        Ok(Self { ctx, max_events, in_flight: VecDeque::new() })
    }

    pub fn max_events(&self) -> u32 {
        self.max_events
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Submits a batch of operations in one `io_submit` call.
    ///
    /// Fails with [`Error::Exhausted`] without touching the kernel at all if
    /// `ops` would push `in_flight` past `max_events`. Otherwise submits the
    /// whole batch; `io_submit` may accept only a prefix of it (a short count,
    /// not an error), in which case only the accepted prefix is recorded as
    /// in-flight and the accepted count is returned so the caller can requeue
    /// the remainder. A negative return leaves nothing tracked.
    pub fn submit(&mut self, ops: Vec<SubmitOp>) -> Result<usize> {
        if ops.is_empty() {
            return Ok(0);
        }
        if self.in_flight.len() + ops.len() > self.max_events as usize {
            return Err(Error::Exhausted(format!(
                "submitting {} operations would exceed the cap of {} (currently {} in flight)",
                ops.len(),
                self.max_events,
                self.in_flight.len()
            )));
        }

        let mut iocbs: Vec<RawIocb> = ops.iter().map(SubmitOp::to_iocb).collect();
        let mut iocb_ptrs: Vec<*mut RawIocb> = iocbs.iter_mut().map(|iocb| iocb as *mut RawIocb).collect();
        let rc = unsafe {
            libc::syscall(libc::SYS_io_submit, self.ctx, iocb_ptrs.len() as i64, iocb_ptrs.as_mut_ptr())
        };
        if rc < 0 {
            let fd = ops.first().map(SubmitOp::fd).unwrap_or(-1);
            return Err(Error::from_last_errno("io_submit", Context::Fd(fd)));
        }

        let accepted = rc as usize;
        for op in &ops[..accepted] {
            self.in_flight.push_back(TrackedOperation { user_data: op.user_data(), fd: op.fd(), is_write: op.is_write() });
        }
        Ok(accepted)
    }

    /// Submits a single `IOCB_CMD_PREAD` into `buf`. `buf` must stay valid and
    /// exclusively owned by the kernel until the matching completion is reaped:
    /// the buffer pool never hands out a buffer twice while it is in flight.
    pub fn submit_read(&mut self, fd: RawFd, buf: *mut u8, len: usize, user_data: u64) -> Result<()> {
        self.submit_one(SubmitOp::Read { fd, buf, len, user_data })
    }

    /// Submits a single `IOCB_CMD_PWRITE` from `buf`.
    pub fn submit_write(&mut self, fd: RawFd, buf: *const u8, len: usize, user_data: u64) -> Result<()> {
        self.submit_one(SubmitOp::Write { fd, buf, len, user_data })
    }

    fn submit_one(&mut self, op: SubmitOp) -> Result<()> {
        match self.submit(vec![op])? {
            1 => Ok(()),
            _ => Err(Error::Exhausted("single-operation submit was not accepted".into())),
        }
    }

    /// Reaps between `min_nr` and `max_nr` completions, waiting up to `timeout`
    /// (`None` blocks indefinitely; `Some(Duration::ZERO)` polls without blocking).
    pub fn get_events(&mut self, min_nr: u32, max_nr: u32, timeout: Option<Duration>) -> Result<Vec<CompletedOperation>> {
        let mut events = vec![RawIoEvent::default(); max_nr as usize];
        let timespec = timeout.map(|t| libc::timespec {
            tv_sec: t.as_secs() as i64,
            tv_nsec: t.subsec_nanos() as i64,
        });
        let ts_ptr = timespec.as_ref().map(|t| t as *const libc::timespec).unwrap_or(std::ptr::null());

        let rc = unsafe {
            libc::syscall(
                libc::SYS_io_getevents,
                self.ctx,
                min_nr as i64,
                max_nr as i64,
                events.as_mut_ptr(),
                ts_ptr,
            )
        };
        if rc < 0 {
            return Err(Error::from_last_errno("io_getevents", Context::Description(String::new())));
        }

        let n = rc as usize;
        let mut out = Vec::with_capacity(n);
        for ev in events.into_iter().take(n) {
            self.in_flight.retain(|op| op.user_data != ev.data);
            out.push(CompletedOperation { user_data: ev.data, result: ev.res });
        }
        Ok(out)
    }

    /// Cancels every tracked in-flight operation, swallowing per-operation failures
    /// (an operation may complete concurrently with the cancel attempt, which
    /// `io_cancel` reports as `EINVAL`/`EAGAIN` — not an error worth surfacing during
    /// teardown).
    pub fn cancel_all(&mut self) {
        let ops: Vec<_> = self.in_flight.drain(..).collect();
        for op in ops {
            let mut iocb = RawIocb { aio_fildes: op.fd as u32, aio_data: op.user_data, ..Default::default() };
            let mut event = RawIoEvent::default();
            let rc = unsafe {
                libc::syscall(libc::SYS_io_cancel, self.ctx, &mut iocb as *mut RawIocb, &mut event as *mut RawIoEvent)
            };
            if rc < 0 {
                log::debug!("io_cancel for user_data={} ignored: {}", op.user_data, std::io::Error::last_os_error());
            }
        }
    }

    /// Tears the ring down. Callers should `cancel_all()` and reap the resulting
    /// completions first; `dispose` itself does not wait for in-flight operations.
    pub fn dispose(mut self) {
        self.destroy();
    }

    fn destroy(&mut self) {
        if self.ctx != 0 {
            let rc = unsafe { libc::syscall(libc::SYS_io_destroy, self.ctx) };
            if rc < 0 {
                log::warn!("io_destroy failed: {}", std::io::Error::last_os_error());
            }
            self.ctx = 0;
        }
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        if self.ctx != 0 {
            self.cancel_all();
            self.destroy();
        }
    }
}

/// A fixed-size pool of same-length buffers handed out to in-flight AIO operations.
///
/// Invariant: `available.len() + in_use == capacity` at all times.
pub struct BufferPool {
    buffer_len: usize,
    available: Vec<Vec<u8>>,
    in_use: usize,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_len: usize) -> Self {
        let available = (0..capacity).map(|_| vec![0u8; buffer_len]).collect();
        Self { buffer_len, available, in_use: 0, capacity }
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use
    }

    /// Takes a buffer out of the pool, or `None` if every buffer is currently
    /// in flight (the caller should apply backpressure rather than allocate more).
    pub fn acquire(&mut self) -> Option<Vec<u8>> {
        let buf = self.available.pop();
        if buf.is_some() {
            self.in_use += 1;
        }
        buf
    }

    /// Returns a buffer to the pool. Truncates/extends back to `buffer_len` so a
    /// caller that shrank the `Vec` while reading it does not shrink the pool's
    /// buffers over time.
    pub fn release(&mut self, mut buf: Vec<u8>) {
        buf.resize(self.buffer_len, 0);
        self.available.push(buf);
        self.in_use -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_pool_maintains_in_use_plus_available_invariant() {
        let mut pool = BufferPool::new(4, 16);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.available_count() + pool.in_use_count(), 4);
        pool.release(a);
        assert_eq!(pool.available_count() + pool.in_use_count(), 4);
        pool.release(b);
        assert_eq!(pool.available_count(), 4);
        assert_eq!(pool.in_use_count(), 0);
    }

    #[test]
    fn buffer_pool_exhausts_when_capacity_taken() {
        let mut pool = BufferPool::new(2, 8);
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn completed_operation_classifies_negative_result_as_error() {
        let op = CompletedOperation { user_data: 1, result: -(nix::errno::Errno::EPIPE as i64) };
        assert!(op.is_error());
        assert!(op.as_result().is_err());
    }

    #[test]
    fn completed_operation_positive_result_is_byte_count() {
        let op = CompletedOperation { user_data: 1, result: 42 };
        assert_eq!(op.as_result().unwrap(), 42);
    }

    #[test]
    fn new_rejects_zero_max_events() {
        assert!(AioContext::new(0).is_err());
    }

    #[test]
    fn new_rejects_max_events_past_the_ceiling() {
        assert!(AioContext::new(MAX_MAX_EVENTS + 1).is_err());
    }

    #[test]
    fn submit_of_empty_batch_is_a_noop() {
        let mut ctx = AioContext::new(4).expect("io_setup should succeed unprivileged");
        assert_eq!(ctx.submit(Vec::new()).unwrap(), 0);
        assert_eq!(ctx.in_flight_count(), 0);
    }

    #[test]
    fn submit_rejects_a_batch_larger_than_the_cap_without_calling_the_kernel() {
        let mut ctx = AioContext::new(1).expect("io_setup should succeed unprivileged");
        let mut a = vec![0u8; 8];
        let mut b = vec![0u8; 8];
        let ops = vec![
            SubmitOp::Read { fd: -1, buf: a.as_mut_ptr(), len: a.len(), user_data: 1 },
            SubmitOp::Read { fd: -1, buf: b.as_mut_ptr(), len: b.len(), user_data: 2 },
        ];
        assert!(matches!(ctx.submit(ops), Err(Error::Exhausted(_))));
        assert_eq!(ctx.in_flight_count(), 0);
    }
}
