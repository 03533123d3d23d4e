//! Injectable runtime paths: the minimum seam needed to exercise the ConfigFS
//! assembler and UDC enumeration in tests without root or a real gadget-capable
//! kernel. This is not a general configuration-file layer — there is nothing else
//! here to configure.

use std::path::PathBuf;

const CONFIGFS_ENV: &str = "USB_GADGET_CONFIGFS";
const UDC_CLASS_ENV: &str = "USB_GADGET_UDC_CLASS";

/// Root of the mounted configfs filesystem. Defaults to `/sys/kernel/config`;
/// overridable via `USB_GADGET_CONFIGFS` so tests can point it at a `tempdir`.
pub fn configfs_root() -> PathBuf {
    std::env::var_os(CONFIGFS_ENV).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/sys/kernel/config"))
}

/// `true` if the configfs root was overridden for testing. When set, the
/// `/proc/mounts` check that confirms configfs is actually mounted is skipped,
/// since a tempdir is never listed there.
pub fn is_configfs_overridden() -> bool {
    std::env::var_os(CONFIGFS_ENV).is_some()
}

/// `{configfs_root}/usb_gadget`, the directory `Gadget::bind` creates entries
/// under.
pub fn usb_gadget_dir() -> PathBuf {
    configfs_root().join("usb_gadget")
}

/// Directory enumerated for available UDCs. Defaults to `/sys/class/udc`;
/// overridable via `USB_GADGET_UDC_CLASS`.
pub fn udc_class_dir() -> PathBuf {
    std::env::var_os(UDC_CLASS_ENV).map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/sys/class/udc"))
}
