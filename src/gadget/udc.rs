//! USB Device Controller (UDC) enumeration and state, read from
//! `/sys/class/udc/<name>/*`.

use crate::config;
use crate::error::{Context, Error, Result};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

/// A USB Device Controller available on this system.
#[derive(Clone)]
pub struct Udc {
    dir: PathBuf,
}

impl fmt::Debug for Udc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Udc").field("name", &self.name()).finish()
    }
}

/// Connection state of a UDC, as reported in its `state` sysfs attribute.
#[derive(Default, Debug, strum::Display, strum::EnumString, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum UdcState {
    #[strum(serialize = "not attached")]
    NotAttached,
    #[strum(serialize = "attached")]
    Attached,
    #[strum(serialize = "powered")]
    Powered,
    #[strum(serialize = "reconnecting")]
    Reconnecting,
    #[strum(serialize = "unauthenticated")]
    Unauthenticated,
    #[strum(serialize = "default")]
    Default,
    #[strum(serialize = "addressed")]
    Addressed,
    #[strum(serialize = "configured")]
    Configured,
    #[strum(serialize = "suspended")]
    Suspended,
    #[default]
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

impl Udc {
    fn from_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn name(&self) -> &OsStr {
        self.dir.file_name().unwrap()
    }

    pub fn sysfs_path(&self) -> &Path {
        &self.dir
    }

    async fn read_attr(&self, attr: &str) -> Result<String> {
        let path = self.dir.join(attr);
        tokio::fs::read_to_string(&path)
            .await
            .map(|s| s.trim().to_string())
            .map_err(|_| Error::from_last_errno("read", Context::Path(path)))
    }

    /// Current negotiated link state. Not every UDC driver populates this file, so
    /// a missing attribute is reported as `UdcState::Unknown` rather than an error.
    pub async fn state(&self) -> UdcState {
        match self.read_attr("state").await {
            Ok(s) => s.parse().unwrap_or_default(),
            Err(_) => UdcState::Unknown,
        }
    }

    /// Name of the gadget driver currently bound to this UDC, if any.
    pub async fn function(&self) -> Result<Option<String>> {
        let s = self.read_attr("function").await?;
        Ok(if s.is_empty() { None } else { Some(s) })
    }

    /// Connects or disconnects the pull-up resistor, forcing a logical
    /// connect/disconnect without unbinding the gadget driver.
    pub async fn set_soft_connect(&self, connect: bool) -> Result<()> {
        let path = self.dir.join("soft_connect");
        tokio::fs::write(&path, if connect { "connect" } else { "disconnect" })
            .await
            .map_err(|_| Error::from_last_errno("write", Context::Path(path)))
    }
}

/// Lists the UDCs available on this system, reading `{udc_class_dir}/*`
/// (normally `/sys/class/udc`, overridable for tests).
pub async fn udcs() -> Result<Vec<Udc>> {
    let udc_dir = config::udc_class_dir();
    if !udc_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    let mut entries = tokio::fs::read_dir(&udc_dir)
        .await
        .map_err(|_| Error::from_last_errno("readdir", Context::Path(udc_dir.clone())))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|_| Error::from_last_errno("readdir", Context::Path(udc_dir.clone())))?
    {
        out.push(Udc::from_dir(entry.path()));
    }
    out.sort_by_key(|u| u.name().to_os_string());
    Ok(out)
}

/// The first UDC by alphabetical name, the same tie-break a typical single-UDC
/// embedded board relies on implicitly.
pub async fn default_udc() -> Result<Udc> {
    udcs()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound { syscall: "default_udc", context: Context::Description("no UDC present".into()), source: nix::errno::Errno::ENODEV })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[tokio::test]
    #[serial]
    async fn udcs_lists_directories_under_override_path() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("b-udc")).unwrap();
        fs::create_dir(tmp.path().join("a-udc")).unwrap();
        std::env::set_var("USB_GADGET_UDC_CLASS", tmp.path());

        let found = udcs().await.unwrap();
        std::env::remove_var("USB_GADGET_UDC_CLASS");

        let names: Vec<_> = found.iter().map(|u| u.name().to_string_lossy().to_string()).collect();
        assert_eq!(names, vec!["a-udc", "b-udc"]);
    }

    #[tokio::test]
    #[serial]
    async fn udcs_empty_when_override_path_absent() {
        std::env::set_var("USB_GADGET_UDC_CLASS", "/nonexistent/path/for/test");
        let found = udcs().await.unwrap();
        std::env::remove_var("USB_GADGET_UDC_CLASS");
        assert!(found.is_empty());
    }
}
