//! HID class descriptor encoding (USB HID 1.11), used by the
//! HID-over-FunctionFS convenience layer.

use super::{Endpoint, Interface};
use crate::error::Result;
use byteorder::{WriteBytesExt, LE};

/// `bInterfaceSubClass` values defined by the HID class spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidSubclass {
    None,
    Boot,
}

impl HidSubclass {
    fn as_u8(self) -> u8 {
        match self {
            HidSubclass::None => 0,
            HidSubclass::Boot => 1,
        }
    }
}

/// `bInterfaceProtocol` values, meaningful only under the boot subclass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidProtocol {
    None,
    Keyboard,
    Mouse,
}

impl HidProtocol {
    fn as_u8(self) -> u8 {
        match self {
            HidProtocol::None => 0,
            HidProtocol::Keyboard => 1,
            HidProtocol::Mouse => 2,
        }
    }
}

/// A single subordinate descriptor entry (almost always exactly one: the report
/// descriptor itself).
#[derive(Debug, Clone, Copy)]
pub struct SubordinateDescriptor {
    pub descriptor_type: u8,
    pub length: u16,
}

impl SubordinateDescriptor {
    pub const REPORT: u8 = 0x22;
    pub const PHYSICAL: u8 = 0x23;

    pub fn report(length: u16) -> Self {
        Self { descriptor_type: Self::REPORT, length }
    }
}

/// HID descriptor (`bDescriptorType=0x21`), embedded inline in the interface's
/// descriptor set, immediately after the interface descriptor.
#[derive(Debug, Clone)]
pub struct Hid {
    pub bcd_hid: u16,
    pub country_code: u8,
    pub subordinate: Vec<SubordinateDescriptor>,
}

impl Hid {
    pub const TYPE: u8 = 0x21;

    /// A HID descriptor for a single report descriptor of `report_descriptor_len`
    /// bytes, HID 1.11, no country code.
    pub fn new(report_descriptor_len: u16) -> Self {
        Self {
            bcd_hid: 0x0111,
            country_code: 0,
            subordinate: vec![SubordinateDescriptor::report(report_descriptor_len)],
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let length = 9 + 3 * self.subordinate.len();
        out.write_u8(length as u8)?;
        out.write_u8(Self::TYPE)?;
        out.write_u16::<LE>(self.bcd_hid)?;
        out.write_u8(self.country_code)?;
        out.write_u8(self.subordinate.len() as u8)?;
        for sub in &self.subordinate {
            out.write_u8(sub.descriptor_type)?;
            out.write_u16::<LE>(sub.length)?;
        }
        Ok(())
    }
}

/// Convenience bundle describing a HID function's interface, class descriptor and
/// single interrupt-IN endpoint. Report-only devices with no SET_REPORT
/// channel simply omit an OUT endpoint; that case is `out_endpoint: None`.
#[derive(Debug, Clone)]
pub struct HidFunctionDescriptors {
    pub interface: Interface,
    pub hid: Hid,
    pub in_endpoint: Endpoint,
    pub out_endpoint: Option<Endpoint>,
}

impl HidFunctionDescriptors {
    pub fn new(
        interface_number: u8,
        subclass: HidSubclass,
        protocol: HidProtocol,
        report_descriptor_len: u16,
        in_endpoint: Endpoint,
        out_endpoint: Option<Endpoint>,
    ) -> Self {
        let num_endpoints = 1 + out_endpoint.is_some() as u8;
        Self {
            interface: Interface {
                interface_number,
                alternate_setting: 0,
                num_endpoints,
                class: 0x03, // HID
                sub_class: subclass.as_u8(),
                protocol: protocol.as_u8(),
                string_index: 0,
            },
            hid: Hid::new(report_descriptor_len),
            in_endpoint,
            out_endpoint,
        }
    }

    /// Encodes interface descriptor, HID descriptor, then endpoint descriptor(s), in
    /// the order a host expects to find them while walking the configuration.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        self.interface.encode(out)?;
        self.hid.encode(out)?;
        self.in_endpoint.encode(out)?;
        if let Some(ep) = &self.out_endpoint {
            ep.encode(out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TransferType;

    #[test]
    fn hid_descriptor_length_byte_accounts_for_subordinate_count() {
        let hid = Hid::new(63);
        let mut out = Vec::new();
        hid.encode(&mut out).unwrap();
        assert_eq!(out[0], 9);
        assert_eq!(out.len(), 9);
        assert_eq!(out[1], Hid::TYPE);
    }

    #[test]
    fn hid_function_with_out_endpoint_counts_two_endpoints() {
        let in_ep = Endpoint {
            address: 0x81,
            transfer_type: TransferType::Interrupt,
            max_packet_size: 8,
            interval: 10,
            audio: None,
            super_speed_companion: None,
        };
        let out_ep = Endpoint {
            address: 0x01,
            transfer_type: TransferType::Interrupt,
            max_packet_size: 8,
            interval: 10,
            audio: None,
            super_speed_companion: None,
        };
        let hid_fn = HidFunctionDescriptors::new(0, HidSubclass::Boot, HidProtocol::Keyboard, 63, in_ep, Some(out_ep));
        assert_eq!(hid_fn.interface.num_endpoints, 2);
        let mut out = Vec::new();
        hid_fn.encode(&mut out).unwrap();
        assert!(out.len() > 9 + 9 + 7 + 7);
    }
}
