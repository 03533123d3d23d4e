//! HID descriptor synthesis: byte-level checks on the descriptor set a
//! HID-over-FunctionFS function presents, beyond the inline length-byte checks
//! already covered next to the encoder.

use gadgetfs::descriptor::hid::{HidFunctionDescriptors, HidProtocol, HidSubclass};
use gadgetfs::descriptor::{Endpoint, TransferType};

fn interrupt_endpoint(address: u8) -> Endpoint {
    Endpoint { address, transfer_type: TransferType::Interrupt, max_packet_size: 8, interval: 10, audio: None, super_speed_companion: None }
}

#[test]
fn keyboard_descriptor_set_is_interface_then_hid_then_one_endpoint() {
    let hid_fn = HidFunctionDescriptors::new(
        0,
        HidSubclass::Boot,
        HidProtocol::Keyboard,
        /* report_descriptor_len */ 63,
        interrupt_endpoint(0x81),
        None,
    );
    assert_eq!(hid_fn.interface.class, 0x03);
    assert_eq!(hid_fn.interface.sub_class, 1); // Boot
    assert_eq!(hid_fn.interface.protocol, 1); // Keyboard
    assert_eq!(hid_fn.interface.num_endpoints, 1);

    let mut out = Vec::new();
    hid_fn.encode(&mut out).unwrap();

    // Interface descriptor: length byte, then bDescriptorType == 0x04.
    assert_eq!(out[0] as usize, 9);
    assert_eq!(out[1], 0x04);

    // HID descriptor follows immediately: length 9, bDescriptorType == 0x21,
    // bcdHID == 0x0111, one subordinate report descriptor of the given length.
    let hid_off = out[0] as usize;
    assert_eq!(out[hid_off], 9);
    assert_eq!(out[hid_off + 1], 0x21);
    let bcd_hid = u16::from_le_bytes([out[hid_off + 2], out[hid_off + 3]]);
    assert_eq!(bcd_hid, 0x0111);
    assert_eq!(out[hid_off + 5], 1); // one subordinate descriptor
    assert_eq!(out[hid_off + 6], 0x22); // REPORT
    let report_len = u16::from_le_bytes([out[hid_off + 7], out[hid_off + 8]]);
    assert_eq!(report_len, 63);

    // Single interrupt-IN endpoint descriptor follows: 7 bytes, type 0x05.
    let ep_off = hid_off + 9;
    assert_eq!(out.len() - ep_off, Endpoint::SIZE);
    assert_eq!(out[ep_off], Endpoint::SIZE as u8);
    assert_eq!(out[ep_off + 1], 0x05);
    assert_eq!(out[ep_off + 2], 0x81);
}

#[test]
fn mouse_descriptor_with_out_endpoint_appends_a_second_endpoint() {
    let hid_fn = HidFunctionDescriptors::new(
        1,
        HidSubclass::Boot,
        HidProtocol::Mouse,
        50,
        interrupt_endpoint(0x82),
        Some(interrupt_endpoint(0x02)),
    );
    assert_eq!(hid_fn.interface.num_endpoints, 2);

    let mut out = Vec::new();
    hid_fn.encode(&mut out).unwrap();
    assert_eq!(out.len(), 9 + 9 + Endpoint::SIZE + Endpoint::SIZE);

    let second_ep_off = 9 + 9 + Endpoint::SIZE;
    assert_eq!(out[second_ep_off + 2], 0x02);
}

#[test]
fn generic_device_descriptor_carries_no_boot_protocol() {
    let hid_fn =
        HidFunctionDescriptors::new(0, HidSubclass::None, HidProtocol::None, 200, interrupt_endpoint(0x83), None);
    assert_eq!(hid_fn.interface.sub_class, 0);
    assert_eq!(hid_fn.interface.protocol, 0);
}
