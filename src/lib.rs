//! Expose a Linux USB Device Controller as a configurable composite USB gadget
//! from userspace.
//!
//! # Layers
//! * [`gadget`] assembles and tears down the ConfigFS tree that defines a
//!   composite gadget and binds it to a UDC.
//! * [`functionfs`] mounts a FunctionFS instance, drives its `ep0` event loop,
//!   and opens data endpoints.
//! * [`aio`] is the windowed/ack-on-completion async engine underneath every
//!   FunctionFS data endpoint, built directly on the kernel AIO syscalls.
//! * [`descriptor`] encodes the USB/FunctionFS descriptor and strings blobs.
//!
//! # Requirements
//! This crate only works on Linux with `CONFIGFS_FS` and `USB_CONFIGFS_F_FS`
//! (or the relevant in-kernel function drivers) enabled, and generally needs
//! root or `CAP_SYS_ADMIN` to mount ConfigFS/FunctionFS and bind a UDC. None of
//! that is required to build or unit-test this crate: [`config`] lets every
//! filesystem root used be overridden for tests.
//!
//! # Example
//!
//! ```no_run
//! use gadgetfs::descriptor::{Descriptor, Descriptors, Endpoint, Interface, TransferType};
//! use gadgetfs::functionfs::{FunctionFs, MountOptions};
//! use gadgetfs::language::LanguageId;
//! use gadgetfs::descriptor::Strings;
//! use std::collections::HashMap;
//! use std::ffi::OsStr;
//! use std::path::Path;
//!
//! # async fn run() -> gadgetfs::error::Result<()> {
//! let descriptors = Descriptors {
//!     full_speed: vec![
//!         Descriptor::Interface(Interface {
//!             interface_number: 0,
//!             alternate_setting: 0,
//!             num_endpoints: 1,
//!             class: 0xff,
//!             sub_class: 0,
//!             protocol: 0,
//!             string_index: 0,
//!         }),
//!         Descriptor::Endpoint(Endpoint {
//!             address: 0x81,
//!             transfer_type: TransferType::Bulk,
//!             max_packet_size: 64,
//!             interval: 0,
//!             audio: None,
//!             super_speed_companion: None,
//!         }),
//!     ],
//!     high_speed: vec![],
//!     super_speed: vec![],
//! };
//! let strings = Strings(HashMap::from([(LanguageId::ENGLISH_UNITED_STATES, vec!["My Function".to_string()])]));
//! let _ffs = FunctionFs::mount(
//!     OsStr::new("example"),
//!     Path::new("/dev/ffs-example"),
//!     &descriptors,
//!     &strings,
//!     &MountOptions::default(),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod aio;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod functionfs;
pub mod gadget;
pub mod ioctl;
pub mod language;
pub mod power;

pub use error::{Error, Result};
