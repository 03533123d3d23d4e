//! ConfigFS gadget assembly and teardown.
//!
//! `Gadget::bind` builds the whole ConfigFS tree for a composite gadget and binds
//! it to a UDC. Every directory/symlink/write it performs is pushed onto a
//! compensation log first; if any step fails, the log unwinds LIFO so a partially
//! assembled gadget never lingers in ConfigFS.

pub mod udc;

use crate::config;
use crate::descriptor::Speed;
use crate::error::{Context, Error, Result};
use crate::language::LanguageId;
use crate::power::MaxPower;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use udc::{Udc, UdcState};

fn hex_u8(v: u8) -> String {
    format!("0x{v:02x}")
}

fn hex_u16(v: u16) -> String {
    format!("0x{v:04x}")
}

async fn write_attr(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    fs::write(path, contents).await.map_err(|_| Error::from_last_errno("write", Context::Path(path.to_path_buf())))
}

async fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir(path).await.map_err(|_| Error::from_last_errno("mkdir", Context::Path(path.to_path_buf())))
}

async fn read_attr(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path).await.map_err(|_| Error::from_last_errno("read", Context::Path(path.to_path_buf())))?;
    Ok(raw.trim().to_string())
}

/// Number of times the `UDC` bind write retries on `EBUSY` (the UDC driver can
/// briefly hold its own lock right after a previous gadget's unbind) before
/// giving up. Mirrors [`crate::functionfs::FunctionFs::mount`]'s retry loop.
const UDC_BIND_RETRIES: u32 = 3;
const UDC_BIND_RETRY_DELAY: Duration = Duration::from_millis(50);

/// How long `bind_inner` waits for the `UDC` attribute to read back the name it
/// just wrote before giving up and failing the whole bind.
const UDC_READBACK_TIMEOUT: Duration = Duration::from_millis(500);
const UDC_READBACK_POLL: Duration = Duration::from_millis(20);

async fn write_udc_with_retry(udc_attr: &Path, name: &std::ffi::OsStr) -> Result<()> {
    let mut attempt = 0;
    loop {
        match write_attr(udc_attr, name.as_encoded_bytes()).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_busy() && attempt < UDC_BIND_RETRIES => {
                attempt += 1;
                log::debug!("UDC bind busy, retry {attempt}/{UDC_BIND_RETRIES}");
                tokio::time::sleep(UDC_BIND_RETRY_DELAY).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Polls `UDC` until it reads back the name just written, so `bind()` never
/// returns `Ok` for a gadget the kernel has not actually picked up yet.
async fn wait_for_udc_readback(udc_attr: &Path, name: &str) -> Result<()> {
    let deadline = tokio::time::Instant::now() + UDC_READBACK_TIMEOUT;
    loop {
        if read_attr(udc_attr).await? == name {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!("UDC readback of {name}")));
        }
        tokio::time::sleep(UDC_READBACK_POLL).await;
    }
}

/// Device or interface class triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Class {
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
}

impl Class {
    pub const fn new(class: u8, sub_class: u8, protocol: u8) -> Self {
        Self { class, sub_class, protocol }
    }
}

/// USB vendor/product id pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Id {
    pub vendor: u16,
    pub product: u16,
}

/// Per-language device strings (manufacturer/product/serial).
#[derive(Debug, Clone)]
pub struct DeviceStrings {
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
}

/// A function to attach to one or more configurations.
///
/// [`Function::FunctionFs`] only registers the ConfigFS placeholder (`functions/
/// ffs.<instance>`); the caller is responsible for mounting the matching
/// FunctionFS instance and completing the descriptor handshake before the gadget
/// is bound to a UDC; the kernel will not enable a composite gadget until every
/// `ffs.*` function's userspace side has connected.
#[derive(Debug, Clone)]
pub enum Function {
    /// An in-kernel configfs function (e.g. `acm`, `ecm`, `hid`), identified by
    /// its driver name and a unique instance name, with arbitrary attribute
    /// writes applied after creation.
    Kernel { driver: String, instance: String, attributes: Vec<(String, String)> },
    /// A userspace FunctionFS function, identified by its instance name.
    FunctionFs { instance: String },
}

impl Function {
    fn dir_name(&self) -> String {
        match self {
            Function::Kernel { driver, instance, .. } => format!("{driver}.{instance}"),
            Function::FunctionFs { instance } => format!("ffs.{instance}"),
        }
    }
}

/// A USB configuration: a bundle of functions presented together, selectable by
/// `bConfigurationValue`.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub description: HashMap<LanguageId, String>,
    pub max_power: MaxPower,
    pub self_powered: bool,
    pub remote_wakeup: bool,
    pub functions: Vec<usize>,
}

impl Configuration {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: [(LanguageId::ENGLISH_UNITED_STATES, description.into())].into(),
            max_power: MaxPower::default(),
            self_powered: false,
            remote_wakeup: false,
            functions: Vec::new(),
        }
    }

    pub fn with_function(mut self, function_index: usize) -> Self {
        self.functions.push(function_index);
        self
    }
}

/// A complete USB gadget definition, ready for [`Gadget::bind`].
#[derive(Debug, Clone)]
pub struct Gadget {
    pub device_class: Class,
    pub id: Id,
    pub strings: HashMap<LanguageId, DeviceStrings>,
    pub max_packet_size0: u8,
    pub device_release: u16,
    pub usb_version: u16,
    pub max_speed: Option<Speed>,
    pub functions: Vec<Function>,
    pub configs: Vec<Configuration>,
}

impl Gadget {
    pub fn new(device_class: Class, id: Id, strings: DeviceStrings) -> Self {
        Self {
            device_class,
            id,
            strings: [(LanguageId::ENGLISH_UNITED_STATES, strings)].into(),
            max_packet_size0: 64,
            device_release: 0x0000,
            usb_version: 0x0200,
            max_speed: None,
            functions: Vec::new(),
            configs: Vec::new(),
        }
    }

    pub fn with_function(&mut self, function: Function) -> usize {
        self.functions.push(function);
        self.functions.len() - 1
    }

    pub fn add_config(&mut self, config: Configuration) {
        self.configs.push(config);
    }

    /// Assembles the ConfigFS tree and binds it to `udc`. All-or-nothing: any
    /// failure triggers best-effort LIFO rollback of everything already created,
    /// and the original error is returned.
    pub async fn bind(&self, udc: &Udc) -> Result<BoundGadget> {
        if self.configs.is_empty() {
            return Err(Error::StateError("gadget must have at least one configuration".into()));
        }
        if self.configs.iter().any(|c| c.functions.is_empty()) {
            return Err(Error::StateError("every configuration must reference at least one function".into()));
        }

        let mut undo: Vec<Undo> = Vec::new();
        match self.bind_inner(udc, &mut undo).await {
            Ok(gadget) => Ok(gadget),
            Err(err) => {
                rollback(undo).await;
                Err(err)
            }
        }
    }

    async fn bind_inner(&self, udc: &Udc, undo: &mut Vec<Undo>) -> Result<BoundGadget> {
        ensure_configfs_mounted()?;

        let usb_gadget_dir = config::usb_gadget_dir();
        if !usb_gadget_dir.is_dir() {
            return Err(Error::NotFound {
                syscall: "bind",
                context: Context::Path(usb_gadget_dir),
                source: nix::errno::Errno::ENOENT,
            });
        }

        let mut idx = 0u32;
        let dir = loop {
            let dir = usb_gadget_dir.join(format!("g{idx}"));
            match fs::create_dir(&dir).await {
                Ok(()) => break dir,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => idx += 1,
                Err(_) => return Err(Error::from_last_errno("mkdir", Context::Path(dir))),
            }
        };
        undo.push(Undo::RemoveDir(dir.clone()));

        write_attr(&dir.join("bDeviceClass"), hex_u8(self.device_class.class)).await?;
        write_attr(&dir.join("bDeviceSubClass"), hex_u8(self.device_class.sub_class)).await?;
        write_attr(&dir.join("bDeviceProtocol"), hex_u8(self.device_class.protocol)).await?;
        write_attr(&dir.join("idVendor"), hex_u16(self.id.vendor)).await?;
        write_attr(&dir.join("idProduct"), hex_u16(self.id.product)).await?;
        write_attr(&dir.join("bMaxPacketSize0"), hex_u8(self.max_packet_size0)).await?;
        write_attr(&dir.join("bcdDevice"), hex_u16(self.device_release)).await?;
        write_attr(&dir.join("bcdUSB"), hex_u16(self.usb_version)).await?;
        if let Some(speed) = self.max_speed {
            write_attr(&dir.join("max_speed"), speed.to_string()).await?;
        }

        for (&lang, strs) in &self.strings {
            let lang_dir = dir.join("strings").join(hex_u16(lang.0));
            create_dir(&lang_dir).await?;
            undo.push(Undo::RemoveDir(lang_dir.clone()));
            write_attr(&lang_dir.join("manufacturer"), &strs.manufacturer).await?;
            write_attr(&lang_dir.join("product"), &strs.product).await?;
            write_attr(&lang_dir.join("serialnumber"), &strs.serial_number).await?;
        }

        let mut function_dirs = Vec::with_capacity(self.functions.len());
        for function in &self.functions {
            let func_dir = dir.join("functions").join(function.dir_name());
            create_dir(&func_dir).await?;
            undo.push(Undo::RemoveDir(func_dir.clone()));
            if let Function::Kernel { attributes, .. } = function {
                for (name, value) in attributes {
                    write_attr(&func_dir.join(name), value).await?;
                }
            }
            function_dirs.push(func_dir);
        }

        for (cfg_idx, cfg) in self.configs.iter().enumerate() {
            let cfg_dir = dir.join("configs").join(format!("c.{}", cfg_idx + 1));
            create_dir(&cfg_dir).await?;
            undo.push(Undo::RemoveDir(cfg_dir.clone()));

            let mut attributes: u8 = 1 << 7;
            if cfg.self_powered {
                attributes |= 1 << 6;
            }
            if cfg.remote_wakeup {
                attributes |= 1 << 5;
            }
            write_attr(&cfg_dir.join("bmAttributes"), hex_u8(attributes)).await?;
            write_attr(&cfg_dir.join("MaxPower"), cfg.max_power.units().to_string()).await?;

            for (&lang, desc) in &cfg.description {
                let lang_dir = cfg_dir.join("strings").join(hex_u16(lang.0));
                create_dir(&lang_dir).await?;
                undo.push(Undo::RemoveDir(lang_dir.clone()));
                write_attr(&lang_dir.join("configuration"), desc).await?;
            }

            for &func_idx in &cfg.functions {
                let func_dir = &function_dirs[func_idx];
                let link = cfg_dir.join(func_dir.file_name().unwrap());
                fs::symlink(func_dir, &link)
                    .await
                    .map_err(|_| Error::from_last_errno("symlink", Context::Path(link.clone())))?;
                undo.push(Undo::RemoveFile(link));
            }
        }

        let udc_attr = dir.join("UDC");
        write_udc_with_retry(&udc_attr, udc.name()).await?;
        undo.push(Undo::UnbindUdc(dir.clone()));

        let udc_name = udc.name().to_string_lossy().into_owned();
        wait_for_udc_readback(&udc_attr, &udc_name).await?;

        Ok(BoundGadget { dir, function_dirs })
    }
}

/// Confirms configfs is actually mounted before touching it, by scanning
/// `/proc/mounts`. Skipped entirely when the configfs root was overridden for
/// testing: a tempdir is never listed there.
fn ensure_configfs_mounted() -> Result<()> {
    if config::is_configfs_overridden() {
        return Ok(());
    }
    let root = config::configfs_root();
    let mounted = proc_mounts::MountIter::new()
        .map_err(|_| Error::from_last_errno("read /proc/mounts", Context::Path(PathBuf::from("/proc/mounts"))))?
        .filter_map(std::result::Result::ok)
        .any(|m| m.fstype == "configfs" && m.dest == root);
    if mounted {
        Ok(())
    } else {
        Err(Error::NotFound { syscall: "bind", context: Context::Path(root), source: nix::errno::Errno::ENOENT })
    }
}

enum Undo {
    RemoveDir(PathBuf),
    RemoveFile(PathBuf),
    UnbindUdc(PathBuf),
}

/// Unwinds `undo` LIFO, logging and continuing past individual failures (a
/// directory may already be gone if an earlier step in the same unwind removed
/// its parent).
async fn rollback(mut undo: Vec<Undo>) {
    while let Some(step) = undo.pop() {
        let result = match &step {
            Undo::UnbindUdc(dir) => fs::write(dir.join("UDC"), "\n").await,
            Undo::RemoveFile(path) => fs::remove_file(path).await,
            Undo::RemoveDir(path) => fs::remove_dir(path).await,
        };
        if let Err(err) = result {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("rollback step failed: {err}");
            }
        }
    }
}

/// A gadget bound to a UDC and present in ConfigFS. Call [`BoundGadget::unbind`]
/// to tear it down; dropping it without unbinding leaves the gadget live in
/// ConfigFS, matching the kernel's own ownership model (ConfigFS entries are not
/// process-scoped).
pub struct BoundGadget {
    dir: PathBuf,
    function_dirs: Vec<PathBuf>,
}

impl BoundGadget {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn function_path(&self, index: usize) -> Option<&Path> {
        self.function_dirs.get(index).map(PathBuf::as_path)
    }

    /// Polls the bound UDC's state until it matches `want` or `timeout` elapses.
    pub async fn wait_for_state(&self, udc: &Udc, want: UdcState, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if udc.state().await == want {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!("UDC state {want}")));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Unbinds from the UDC and removes the whole ConfigFS tree, tolerating
    /// already-missing entries (ENOENT) as success.
    pub async fn unbind(self) -> Result<()> {
        let _ = fs::write(self.dir.join("UDC"), "\n").await;

        let configs_dir = self.dir.join("configs");
        if let Ok(mut configs) = fs::read_dir(&configs_dir).await {
            while let Ok(Some(cfg)) = configs.next_entry().await {
                if !matches!(cfg.file_type().await, Ok(t) if t.is_dir()) {
                    continue;
                }
                if let Ok(mut links) = fs::read_dir(cfg.path()).await {
                    while let Ok(Some(entry)) = links.next_entry().await {
                        if matches!(entry.file_type().await, Ok(t) if t.is_symlink()) {
                            let _ = fs::remove_file(entry.path()).await;
                        }
                    }
                }
                let strings_dir = cfg.path().join("strings");
                if let Ok(mut langs) = fs::read_dir(&strings_dir).await {
                    while let Ok(Some(lang)) = langs.next_entry().await {
                        let _ = fs::remove_dir(lang.path()).await;
                    }
                }
                let _ = fs::remove_dir(cfg.path()).await;
            }
        }

        let functions_dir = self.dir.join("functions");
        if let Ok(mut funcs) = fs::read_dir(&functions_dir).await {
            while let Ok(Some(func)) = funcs.next_entry().await {
                let _ = fs::remove_dir(func.path()).await;
            }
        }

        let strings_dir = self.dir.join("strings");
        if let Ok(mut langs) = fs::read_dir(&strings_dir).await {
            while let Ok(Some(lang)) = langs.next_entry().await {
                let _ = fs::remove_dir(lang.path()).await;
            }
        }

        match fs::remove_dir(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(_) => Err(Error::from_last_errno("rmdir", Context::Path(self.dir.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn sample_gadget() -> Gadget {
        let mut g = Gadget::new(
            Class::new(0, 0, 0),
            Id { vendor: 0x1d6b, product: 0x0104 },
            DeviceStrings { manufacturer: "Test".into(), product: "Gadget".into(), serial_number: "0001".into() },
        );
        let f = g.with_function(Function::FunctionFs { instance: "test".into() });
        g.add_config(Configuration::new("Default").with_function(f));
        g
    }

    #[tokio::test]
    #[serial]
    async fn bind_creates_full_tree_and_unbind_removes_it() {
        let tmp = tempfile::tempdir().unwrap();
        let gadget_dir = tmp.path().join("usb_gadget");
        std::fs::create_dir(&gadget_dir).unwrap();
        std::env::set_var("USB_GADGET_CONFIGFS", tmp.path());

        let udc_dir = tmp.path().join("udc0");
        std::fs::create_dir(&udc_dir).unwrap();
        std::env::set_var("USB_GADGET_UDC_CLASS", tmp.path());
        let udc = udc::udcs().await.unwrap().into_iter().next().unwrap();

        let gadget = sample_gadget();
        let bound = gadget.bind(&udc).await.unwrap();
        assert!(bound.path().join("UDC").exists());
        assert!(bound.path().join("functions/ffs.test").exists());
        assert!(bound.path().join("configs/c.1/ffs.test").exists());

        bound.unbind().await.unwrap();
        assert!(!gadget_dir.join("g0").exists());

        std::env::remove_var("USB_GADGET_CONFIGFS");
        std::env::remove_var("USB_GADGET_UDC_CLASS");
    }

    #[tokio::test]
    #[serial]
    async fn bind_rejects_gadget_with_no_configs() {
        std::env::set_var("USB_GADGET_CONFIGFS", "/tmp/irrelevant-for-this-test");
        let g = Gadget::new(
            Class::new(0, 0, 0),
            Id { vendor: 1, product: 1 },
            DeviceStrings { manufacturer: "a".into(), product: "b".into(), serial_number: "c".into() },
        );
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("udc0")).unwrap();
        std::env::set_var("USB_GADGET_UDC_CLASS", tmp.path());
        let udc = udc::udcs().await.unwrap().into_iter().next().unwrap();
        assert!(g.bind(&udc).await.is_err());
        std::env::remove_var("USB_GADGET_CONFIGFS");
        std::env::remove_var("USB_GADGET_UDC_CLASS");
    }

    #[tokio::test]
    #[serial]
    async fn bind_rolls_back_on_missing_configfs_root() {
        std::env::set_var("USB_GADGET_CONFIGFS", "/nonexistent/configfs/root/for/test");
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("udc0")).unwrap();
        std::env::set_var("USB_GADGET_UDC_CLASS", tmp.path());
        let udc = udc::udcs().await.unwrap().into_iter().next().unwrap();

        let gadget = sample_gadget();
        assert!(gadget.bind(&udc).await.is_err());

        std::env::remove_var("USB_GADGET_CONFIGFS");
        std::env::remove_var("USB_GADGET_UDC_CLASS");
    }

    #[test]
    fn max_speed_is_not_set_when_none() {
        let g = sample_gadget();
        assert!(g.max_speed.is_none());
        let _ = Speed::Full;
    }
}
