//! The FunctionFS runtime: mounting an instance, writing its descriptor/strings
//! blobs to `ep0`, driving the `ep0` event loop, and opening data endpoints as
//! AIO-backed streams.

pub mod hid;

use crate::aio::stream::{AioReader, AioWriter, ErrorPolicy};
use crate::descriptor::{Descriptors, Strings};
use crate::error::{Context, Error, Result};
use crate::ioctl;
use async_trait::async_trait;
use byteorder::{ReadBytesExt, LE};
use nix::mount::{MntFlags, MsFlags};
use std::ffi::OsStr;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;

pub const FS_TYPE: &str = "functionfs";

/// Lifecycle of a `FunctionFs` instance. `ep0`'s event stream drives every
/// transition except the first (`mount`) and last (`dispose`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfsState {
    Mounted,
    Bound,
    Enabled,
    Disabled,
    Unbound,
    Closed,
}

/// Options passed through to the `functionfs` mount call.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub no_disconnect: bool,
    pub rmode: Option<u32>,
    pub fmode: Option<u32>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl MountOptions {
    fn to_mount_data(&self) -> String {
        let mut opts = Vec::new();
        if self.no_disconnect {
            opts.push("no_disconnect=1".to_string());
        }
        if let Some(v) = self.rmode {
            opts.push(format!("rmode={v}"));
        }
        if let Some(v) = self.fmode {
            opts.push(format!("fmode={v}"));
        }
        if let Some(v) = self.mode {
            opts.push(format!("mode={v}"));
        }
        if let Some(v) = self.uid {
            opts.push(format!("uid={v}"));
        }
        if let Some(v) = self.gid {
            opts.push(format!("gid={v}"));
        }
        opts.join(",")
    }
}

/// A USB control request read off `ep0`'s event stream.
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    fn parse(mut buf: &[u8]) -> Result<Self> {
        let request_type = ReadBytesExt::read_u8(&mut buf).map_err(|_| Error::ProtocolError {
            syscall: "setup parse",
            context: Context::Description("short buffer".into()),
            source: nix::errno::Errno::EBADMSG,
        })?;
        let request = ReadBytesExt::read_u8(&mut buf).unwrap_or(0);
        let value = ReadBytesExt::read_u16::<LE>(&mut buf).unwrap_or(0);
        let index = ReadBytesExt::read_u16::<LE>(&mut buf).unwrap_or(0);
        let length = ReadBytesExt::read_u16::<LE>(&mut buf).unwrap_or(0);
        Ok(Self { request_type, request, value, index, length })
    }

    /// `true` if this request expects device-to-host data (bit 7 of `bmRequestType`).
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    /// Recipient encoded in the low 5 bits of `bmRequestType`: 0=device, 1=interface,
    /// 2=endpoint, 3=other.
    pub fn recipient(&self) -> u8 {
        self.request_type & 0x1f
    }

    /// Request type class encoded in bits 5-6: 0=standard, 1=class, 2=vendor.
    pub fn request_class(&self) -> u8 {
        (self.request_type >> 5) & 0x03
    }
}

/// A decoded `ep0` event.
#[derive(Debug, Clone, Copy)]
pub enum Event {
    Bind,
    Unbind,
    Enable,
    Disable,
    Setup(SetupPacket),
    Suspend,
    Resume,
}

const EVENT_SIZE: usize = 12;
const EVENT_BIND: u8 = 0;
const EVENT_UNBIND: u8 = 1;
const EVENT_ENABLE: u8 = 2;
const EVENT_DISABLE: u8 = 3;
const EVENT_SETUP: u8 = 4;
const EVENT_SUSPEND: u8 = 5;
const EVENT_RESUME: u8 = 6;

fn parse_event(buf: &[u8]) -> Result<Event> {
    if buf.len() < EVENT_SIZE {
        return Err(Error::ProtocolError {
            syscall: "ep0 event read",
            context: Context::Description(format!("short event record ({} bytes)", buf.len())),
            source: nix::errno::Errno::EBADMSG,
        });
    }
    let data = &buf[0..8];
    let event_type = buf[8];
    match event_type {
        EVENT_BIND => Ok(Event::Bind),
        EVENT_UNBIND => Ok(Event::Unbind),
        EVENT_ENABLE => Ok(Event::Enable),
        EVENT_DISABLE => Ok(Event::Disable),
        EVENT_SUSPEND => Ok(Event::Suspend),
        EVENT_RESUME => Ok(Event::Resume),
        EVENT_SETUP => Ok(Event::Setup(SetupPacket::parse(data)?)),
        other => Err(Error::ProtocolError {
            syscall: "ep0 event read",
            context: Context::Description(format!("unknown event type {other}")),
            source: nix::errno::Errno::EPROTO,
        }),
    }
}

/// How a SETUP request with a data stage is answered.
pub enum SetupResponse {
    /// Acknowledge a zero-length or OUT data-stage request.
    Ack,
    /// Stall the control pipe, the standard "not supported" answer.
    Stall,
    /// Device-to-host data stage payload.
    Data(Vec<u8>),
}

/// A pluggable SETUP dispatch policy for a function layered over [`FunctionFs`]'s
/// `ep0` event loop. HID is the only class this crate ships a dispatcher
/// for, but the split keeps `FunctionFs` itself ignorant of any particular
/// class's control requests: a future class support module only needs to
/// implement this trait to plug into the same `next_event` pattern.
#[async_trait]
pub trait SetupHandler: Send {
    /// Answers one `SETUP` request, including calling [`FunctionFs::respond_setup`]
    /// on whatever connection the implementor owns.
    async fn handle_setup(&mut self, setup: &SetupPacket) -> Result<()>;
}

/// Number of times `mount` retries on `EBUSY` (a just-unmounted instance's gadget
/// directory can briefly still be tearing down) before giving up.
const MOUNT_RETRIES: u32 = 3;
const MOUNT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

/// A mounted FunctionFS instance, described and ready to drive its `ep0` event loop.
pub struct FunctionFs {
    mountpoint: PathBuf,
    ep0: File,
    state: FfsState,
    next_endpoint: u8,
}

impl FunctionFs {
    /// Mounts `instance` at `mountpoint`, then writes the descriptor and strings
    /// blobs to `ep0`. Retries the mount call up to [`MOUNT_RETRIES`] times on
    /// `EBUSY`.
    pub async fn mount(
        instance: &OsStr,
        mountpoint: &Path,
        descriptors: &Descriptors,
        strings: &Strings,
        opts: &MountOptions,
    ) -> Result<Self> {
        if descriptors.is_empty() {
            return Err(Error::DescriptorError("FunctionFs requires at least one endpoint descriptor".into()));
        }

        let mut attempt = 0;
        loop {
            let result = nix::mount::mount(
                Some(instance),
                mountpoint,
                Some(FS_TYPE),
                MsFlags::empty(),
                Some(opts.to_mount_data().as_str()),
            );
            match result {
                Ok(()) => break,
                Err(nix::errno::Errno::EBUSY) if attempt < MOUNT_RETRIES => {
                    attempt += 1;
                    log::debug!("functionfs mount busy, retry {attempt}/{MOUNT_RETRIES}");
                    sleep(MOUNT_RETRY_DELAY).await;
                }
                Err(errno) => {
                    return Err(Error::from_errno(errno, "mount", Context::Path(mountpoint.to_path_buf())))
                }
            }
        }

        let ep0_path = mountpoint.join("ep0");
        let mut ep0 = File::options()
            .read(true)
            .write(true)
            .open(&ep0_path)
            .await
            .map_err(|_| Error::from_last_errno("open ep0", Context::Path(ep0_path.clone())))?;

        let desc_bytes = descriptors.encode()?;
        ep0.write_all(&desc_bytes)
            .await
            .map_err(|_| Error::from_last_errno("write descriptors", Context::Path(ep0_path.clone())))?;

        let strings_bytes = strings.encode()?;
        ep0.write_all(&strings_bytes)
            .await
            .map_err(|_| Error::from_last_errno("write strings", Context::Path(ep0_path.clone())))?;

        Ok(Self { mountpoint: mountpoint.to_path_buf(), ep0, state: FfsState::Mounted, next_endpoint: 1 })
    }

    pub fn state(&self) -> FfsState {
        self.state
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Blocks for the next `ep0` event, updating internal lifecycle state.
    /// `SETUP` events are returned to the caller for dispatch; every other event
    /// only needs bookkeeping.
    pub async fn next_event(&mut self) -> Result<Event> {
        let mut buf = [0u8; EVENT_SIZE];
        self.ep0
            .read_exact(&mut buf)
            .await
            .map_err(|_| Error::from_last_errno("read ep0 event", Context::Path(self.mountpoint.join("ep0"))))?;
        let event = parse_event(&buf)?;
        self.state = match event {
            Event::Bind => FfsState::Bound,
            Event::Unbind => FfsState::Unbound,
            Event::Enable => FfsState::Enabled,
            Event::Disable => FfsState::Disabled,
            Event::Suspend | Event::Resume | Event::Setup(_) => self.state,
        };
        Ok(event)
    }

    /// Answers a pending `SETUP` request. Callers must call this exactly once per
    /// `Event::Setup` they receive, even when stalling.
    pub async fn respond_setup(&mut self, setup: &SetupPacket, response: SetupResponse) -> Result<()> {
        let ep0_path = self.mountpoint.join("ep0");
        match response {
            SetupResponse::Stall => {
                // Neither a read nor a write of the expected length: the kernel
                // interprets the short/absent transfer as a stall.
                if setup.length == 0 {
                    let _ = self.ep0.write(&[]).await;
                } else {
                    let _ = self.ep0.read(&mut [0u8; 0]).await;
                }
                Ok(())
            }
            SetupResponse::Ack => {
                if setup.is_device_to_host() {
                    self.ep0
                        .write_all(&[])
                        .await
                        .map_err(|_| Error::from_last_errno("setup ack", Context::Path(ep0_path)))
                } else if setup.length > 0 {
                    let mut discard = vec![0u8; setup.length as usize];
                    self.ep0
                        .read_exact(&mut discard)
                        .await
                        .map(|_| ())
                        .map_err(|_| Error::from_last_errno("setup data stage", Context::Path(ep0_path)))
                } else {
                    Ok(())
                }
            }
            SetupResponse::Data(payload) => {
                let n = payload.len().min(setup.length as usize);
                self.ep0
                    .write_all(&payload[..n])
                    .await
                    .map_err(|_| Error::from_last_errno("setup data stage", Context::Path(ep0_path)))
            }
        }
    }

    /// Reads an OUT data stage and acknowledges it, returning the bytes instead of
    /// discarding them. For SETUP requests whose payload the caller actually needs
    /// (e.g. HID `SET_REPORT`), use this instead of `respond_setup(Ack)`, which
    /// throws the data stage away.
    pub async fn read_setup_data(&mut self, setup: &SetupPacket) -> Result<Vec<u8>> {
        let ep0_path = self.mountpoint.join("ep0");
        let mut data = vec![0u8; setup.length as usize];
        if !data.is_empty() {
            self.ep0
                .read_exact(&mut data)
                .await
                .map_err(|_| Error::from_last_errno("setup data stage", Context::Path(ep0_path)))?;
        }
        Ok(data)
    }

    /// Opens the next sequentially numbered data endpoint file (`ep1`, `ep2`, ...),
    /// matching the order endpoints were listed in the descriptor table: the
    /// kernel assigns endpoint files in descriptor order, not by address.
    pub async fn open_endpoint(&mut self) -> Result<EndpointHandle> {
        let n = self.next_endpoint;
        self.next_endpoint += 1;
        let path = self.mountpoint.join(format!("ep{n}"));
        let file = File::options()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|_| Error::from_last_errno("open endpoint", Context::Path(path.clone())))?;
        Ok(EndpointHandle { file, path })
    }

    /// Unmounts the instance. Individual failures while tearing down are logged and
    /// swallowed, matching the gadget assembler's best-effort cleanup posture.
    pub async fn dispose(self) {
        drop(self.ep0);
        match nix::mount::umount2(&self.mountpoint, MntFlags::empty()) {
            Ok(()) => {}
            Err(errno) => log::warn!("unmount of {} failed: {errno}", self.mountpoint.display()),
        }
    }
}

/// A single opened `ep<N>` data endpoint file, not yet committed to reader or
/// writer mode: a FunctionFS endpoint file supports either direction depending
/// on the descriptor it was declared with, but only one AIO role at a time per
/// this crate's stream API.
pub struct EndpointHandle {
    file: File,
    path: PathBuf,
}

impl EndpointHandle {
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wraps this endpoint as a windowed AIO reader (OUT endpoint).
    pub async fn into_reader(self, buffer_size: usize, window_size: usize, error_policy: ErrorPolicy) -> Result<AioReader> {
        let fd = self.file.into_std().await.into_raw_fd();
        AioReader::spawn(fd, buffer_size, window_size, error_policy)
    }

    /// Wraps this endpoint as an ack-on-completion AIO writer (IN endpoint).
    pub async fn into_writer(self, buffer_size: usize, window_size: usize) -> Result<AioWriter> {
        let fd = self.file.into_std().await.into_raw_fd();
        AioWriter::spawn(fd, buffer_size, window_size)
    }

    /// Best-effort recovery from a halted endpoint: `CLEAR_HALT` then `FIFO_FLUSH`.
    pub fn reset(&self) {
        ioctl::reset_endpoint(self.file.as_raw_fd());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bind_event() {
        let mut buf = [0u8; EVENT_SIZE];
        buf[8] = EVENT_BIND;
        assert!(matches!(parse_event(&buf).unwrap(), Event::Bind));
    }

    #[test]
    fn parses_setup_event_fields() {
        let mut buf = [0u8; EVENT_SIZE];
        buf[0] = 0x80; // bmRequestType: device-to-host, standard, device
        buf[1] = 0x06; // GET_DESCRIPTOR
        buf[2] = 0x00;
        buf[3] = 0x01; // wValue = 0x0100
        buf[8] = EVENT_SETUP;
        let event = parse_event(&buf).unwrap();
        match event {
            Event::Setup(setup) => {
                assert!(setup.is_device_to_host());
                assert_eq!(setup.request, 0x06);
                assert_eq!(setup.value, 0x0100);
                assert_eq!(setup.recipient(), 0);
            }
            _ => panic!("expected Setup event"),
        }
    }

    #[test]
    fn rejects_unknown_event_type() {
        let mut buf = [0u8; EVENT_SIZE];
        buf[8] = 99;
        assert!(parse_event(&buf).is_err());
    }

    #[test]
    fn rejects_short_event_buffer() {
        assert!(parse_event(&[0u8; 4]).is_err());
    }
}
