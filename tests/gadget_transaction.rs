//! Gadget ConfigFS transaction behaviour against the injectable root: a full
//! bind/unbind round trip, and rollback when a later step fails mid-bind.

use gadgetfs::gadget::udc::udcs;
use gadgetfs::gadget::{Class, Configuration, DeviceStrings, Function, Gadget, Id};
use serial_test::serial;
use std::fs;

fn fake_configfs() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("usb_gadget")).unwrap();
    tmp
}

fn fake_udc_class() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("udc0")).unwrap();
    tmp
}

fn sample_gadget() -> Gadget {
    let mut gadget = Gadget::new(
        Class::new(0, 0, 0),
        Id { vendor: 0x1d6b, product: 0x0104 },
        DeviceStrings { manufacturer: "ACME Corp".into(), product: "Test Gadget".into(), serial_number: "0001".into() },
    );
    let func = gadget.with_function(Function::FunctionFs { instance: "echo".into() });
    gadget.add_config(Configuration::new("Default").with_function(func));
    gadget
}

#[tokio::test]
#[serial]
async fn bind_then_unbind_leaves_no_configfs_residue() {
    let configfs = fake_configfs();
    let udc_class = fake_udc_class();
    std::env::set_var("USB_GADGET_CONFIGFS", configfs.path());
    std::env::set_var("USB_GADGET_UDC_CLASS", udc_class.path());

    let udc = udcs().await.unwrap().into_iter().next().unwrap();
    let gadget = sample_gadget();
    let bound = gadget.bind(&udc).await.unwrap();
    let gadget_dir = bound.path().to_path_buf();
    assert!(gadget_dir.exists());

    bound.unbind().await.unwrap();
    assert!(!gadget_dir.exists());

    std::env::remove_var("USB_GADGET_CONFIGFS");
    std::env::remove_var("USB_GADGET_UDC_CLASS");
}

#[tokio::test]
#[serial]
async fn failed_bind_leaves_no_partial_gadget_directory() {
    // No usb_gadget subdirectory exists under this root, so bind fails immediately
    // after creating nothing beyond what it can clean up.
    let configfs = tempfile::tempdir().unwrap();
    let udc_class = fake_udc_class();
    std::env::set_var("USB_GADGET_CONFIGFS", configfs.path());
    std::env::set_var("USB_GADGET_UDC_CLASS", udc_class.path());

    let udc = udcs().await.unwrap().into_iter().next().unwrap();
    let gadget = sample_gadget();
    let result = gadget.bind(&udc).await;
    assert!(result.is_err());

    let entries: Vec<_> = fs::read_dir(configfs.path()).unwrap().collect();
    assert!(entries.is_empty(), "bind must not leave artifacts behind when it cannot even start");

    std::env::remove_var("USB_GADGET_CONFIGFS");
    std::env::remove_var("USB_GADGET_UDC_CLASS");
}

#[tokio::test]
#[serial]
async fn bind_rolls_back_everything_when_a_later_step_fails() {
    let configfs = fake_configfs();
    let udc_class = fake_udc_class();
    std::env::set_var("USB_GADGET_CONFIGFS", configfs.path());
    std::env::set_var("USB_GADGET_UDC_CLASS", udc_class.path());

    // Two functions that collide on their ConfigFS directory name: the gadget
    // directory, strings, and the first function directory are already on disk
    // by the time the second function's mkdir fails with EEXIST, and all of it
    // must be rolled back.
    let mut gadget = Gadget::new(
        Class::new(0, 0, 0),
        Id { vendor: 1, product: 1 },
        DeviceStrings { manufacturer: "a".into(), product: "b".into(), serial_number: "c".into() },
    );
    let f0 = gadget.with_function(Function::FunctionFs { instance: "dup".into() });
    let f1 = gadget.with_function(Function::FunctionFs { instance: "dup".into() });
    gadget.add_config(Configuration::new("Bad").with_function(f0).with_function(f1));

    let udc = udcs().await.unwrap().into_iter().next().unwrap();
    let result = gadget.bind(&udc).await;
    assert!(result.is_err());

    let gadget_dir = configfs.path().join("usb_gadget").join("g0");
    assert!(!gadget_dir.exists());

    std::env::remove_var("USB_GADGET_CONFIGFS");
    std::env::remove_var("USB_GADGET_UDC_CLASS");
}
