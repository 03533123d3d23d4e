//! Typed ioctl wrappers for the FunctionFS per-endpoint file descriptors.
//!
//! Mirrors the Linux uapi `<linux/usb/functionfs.h>` request numbers. Most of these
//! ioctls are rarely needed (the streaming path goes through AIO), but they are
//! exposed because a caller may need `FIFO_STATUS`/`FIFO_FLUSH` for diagnostics or
//! `CLEAR_HALT` to recover a stalled endpoint.

use crate::error::{Context, Error, Result};
use nix::{ioctl_none, ioctl_read, ioctl_write_int_bad, ioctl_write_ptr_bad, request_code_none};
use std::os::fd::RawFd;

ioctl_none!(ffs_fifo_status, b'g', 1);
ioctl_none!(ffs_fifo_flush, b'g', 2);
ioctl_none!(ffs_clear_halt, b'g', 3);

ioctl_write_int_bad!(ffs_interface_revmap, request_code_none!(b'g', 128));
ioctl_none!(ffs_endpoint_revmap, b'g', 129);

/// `struct usb_endpoint_descriptor` as returned by `ENDPOINT_DESC`; big enough to hold
/// the SuperSpeed companion-extended form.
pub const ENDPOINT_DESC_SIZE: usize = 9;
ioctl_read!(ffs_endpoint_desc, b'g', 130, [u8; ENDPOINT_DESC_SIZE]);

/// `struct usb_ffs_dmabuf_transfer_req`, minimal fields needed to drive the ioctl; the
/// DMA-buffer fast path itself is a non-goal, only the ioctl surface is exposed.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct DmabufTransferReq {
    pub flags: u32,
    pub sg_count: u32,
}

ioctl_write_int_bad!(ffs_dmabuf_attach, request_code_none!(b'g', 131));
ioctl_write_int_bad!(ffs_dmabuf_detach, request_code_none!(b'g', 132));
ioctl_write_ptr_bad!(ffs_dmabuf_transfer, request_code_none!(b'g', 133), DmabufTransferReq);

fn wrap(fd: RawFd, name: &'static str, res: nix::Result<libc::c_int>) -> Result<libc::c_int> {
    res.map_err(|errno| Error::from_errno(errno, name, Context::Fd(fd)))
}

pub fn fifo_status(fd: RawFd) -> Result<i32> {
    wrap(fd, "FIFO_STATUS", unsafe { ffs_fifo_status(fd) })
}

pub fn fifo_flush(fd: RawFd) -> Result<()> {
    wrap(fd, "FIFO_FLUSH", unsafe { ffs_fifo_flush(fd) }).map(drop)
}

pub fn clear_halt(fd: RawFd) -> Result<()> {
    wrap(fd, "CLEAR_HALT", unsafe { ffs_clear_halt(fd) }).map(drop)
}

pub fn interface_revmap(fd: RawFd, interface: i32) -> Result<i32> {
    wrap(fd, "INTERFACE_REVMAP", unsafe { ffs_interface_revmap(fd, interface) })
}

pub fn endpoint_revmap(fd: RawFd) -> Result<i32> {
    wrap(fd, "ENDPOINT_REVMAP", unsafe { ffs_endpoint_revmap(fd) })
}

pub fn endpoint_desc(fd: RawFd) -> Result<[u8; ENDPOINT_DESC_SIZE]> {
    let mut buf = [0u8; ENDPOINT_DESC_SIZE];
    wrap(fd, "ENDPOINT_DESC", unsafe { ffs_endpoint_desc(fd, &mut buf) })?;
    Ok(buf)
}

/// Best-effort endpoint recovery: `CLEAR_HALT` then `FIFO_FLUSH`, each failure
/// swallowed individually (the endpoint may already be clear, or flushing may not be
/// supported by every transfer type).
pub fn reset_endpoint(fd: RawFd) {
    if let Err(err) = clear_halt(fd) {
        log::debug!("CLEAR_HALT on fd {fd} ignored: {err}");
    }
    if let Err(err) = fifo_flush(fd) {
        log::debug!("FIFO_FLUSH on fd {fd} ignored: {err}");
    }
}
