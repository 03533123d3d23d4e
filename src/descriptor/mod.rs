//! Bit-exact encoders for USB standard descriptors and the FunctionFS
//! descriptor-table/strings blobs.
//!
//! None of these types round-trip except [`Endpoint::parse`], which exists only
//! because `ENDPOINT_DESC` hands one back; everything else is write-only by
//! design.

pub mod hid;

use crate::error::{Error, Result};
use crate::language::LanguageId;
use byteorder::{WriteBytesExt, LE};
use std::collections::HashMap;

/// USB transfer type, the low two bits of an endpoint's `bmAttributes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous { synchronization: IsoSync, usage: IsoUsage },
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoSync {
    NoSync,
    Asynchronous,
    Adaptive,
    Synchronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoUsage {
    Data,
    Feedback,
    ImplicitFeedback,
}

impl TransferType {
    fn bm_attributes(&self) -> u8 {
        match self {
            TransferType::Control => 0,
            TransferType::Bulk => 2,
            TransferType::Interrupt => 3,
            TransferType::Isochronous { synchronization, usage } => {
                let sync = match synchronization {
                    IsoSync::NoSync => 0,
                    IsoSync::Asynchronous => 1,
                    IsoSync::Adaptive => 2,
                    IsoSync::Synchronous => 3,
                };
                let use_ = match usage {
                    IsoUsage::Data => 0,
                    IsoUsage::Feedback => 1,
                    IsoUsage::ImplicitFeedback => 2,
                };
                1 | (sync << 2) | (use_ << 4)
            }
        }
    }
}

/// USB transfer speed. SuperSpeedPlus is not modelled: USB 3 power units are a
/// non-goal and this crate only emits the companion descriptor SuperSpeed needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Speed {
    #[strum(serialize = "full")]
    Full,
    #[strum(serialize = "high")]
    High,
    #[strum(serialize = "super")]
    Super,
}

impl Speed {
    /// Maximum `wMaxPacketSize` a bulk/interrupt endpoint may declare at this speed.
    pub fn max_packet_size_limit(&self, transfer_type: &TransferType) -> u16 {
        match (self, transfer_type) {
            (Speed::Full, TransferType::Bulk) => 64,
            (Speed::Full, TransferType::Interrupt) => 64,
            (Speed::Full, TransferType::Isochronous { .. }) => 1023,
            (Speed::High, TransferType::Bulk) => 512,
            (Speed::High, TransferType::Interrupt) => 1024,
            (Speed::High, TransferType::Isochronous { .. }) => 1024,
            (Speed::Super, _) => 1024,
            (Speed::Full, TransferType::Control) => 64,
            (Speed::High, TransferType::Control) => 64,
            (Speed::Super, TransferType::Control) => 512,
        }
    }
}

/// A USB interface descriptor (`bLength=9`, `bDescriptorType=0x04`).
#[derive(Debug, Clone)]
pub struct Interface {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub string_index: u8,
}

impl Interface {
    pub const TYPE: u8 = 0x04;

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        out.write_u8(9)?;
        out.write_u8(Self::TYPE)?;
        out.write_u8(self.interface_number)?;
        out.write_u8(self.alternate_setting)?;
        out.write_u8(self.num_endpoints)?;
        out.write_u8(self.class)?;
        out.write_u8(self.sub_class)?;
        out.write_u8(self.protocol)?;
        out.write_u8(self.string_index)?;
        debug_assert_eq!(out.len() - start, 9);
        Ok(())
    }
}

/// Interface association descriptor (`bLength=8`, `bDescriptorType=0x0b`), used to
/// group several interfaces of a composite function.
#[derive(Debug, Clone)]
pub struct InterfaceAssociation {
    pub first_interface: u8,
    pub interface_count: u8,
    pub function_class: u8,
    pub function_sub_class: u8,
    pub function_protocol: u8,
    pub string_index: u8,
}

impl InterfaceAssociation {
    pub const TYPE: u8 = 0x0b;

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u8(8)?;
        out.write_u8(Self::TYPE)?;
        out.write_u8(self.first_interface)?;
        out.write_u8(self.interface_count)?;
        out.write_u8(self.function_class)?;
        out.write_u8(self.function_sub_class)?;
        out.write_u8(self.function_protocol)?;
        out.write_u8(self.string_index)?;
        Ok(())
    }
}

/// SuperSpeed Endpoint Companion descriptor (`bLength=6`, `bDescriptorType=0x30`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SuperSpeedCompanion {
    pub max_burst: u8,
    pub attributes: u8,
    pub bytes_per_interval: u16,
}

impl SuperSpeedCompanion {
    pub const TYPE: u8 = 0x30;

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u8(6)?;
        out.write_u8(Self::TYPE)?;
        out.write_u8(self.max_burst)?;
        out.write_u8(self.attributes)?;
        out.write_u16::<LE>(self.bytes_per_interval)?;
        Ok(())
    }
}

/// USB endpoint descriptor (`bLength=7` or `9` with audio fields, `bDescriptorType=0x05`).
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Direction × endpoint number: bit 7 set means IN (device-to-host).
    pub address: u8,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    pub interval: u8,
    /// Present only for isochronous endpoints with the `Sync`/`Async` refinements
    /// that need a refresh rate and synch address (audio class usage).
    pub audio: Option<AudioEndpointFields>,
    /// Present when the owning `FunctionFs` declares SuperSpeed support.
    pub super_speed_companion: Option<SuperSpeedCompanion>,
}

#[derive(Debug, Clone, Copy)]
pub struct AudioEndpointFields {
    pub refresh: u8,
    pub synch_address: u8,
}

impl Endpoint {
    pub const TYPE: u8 = 0x05;
    pub const SIZE: usize = 7;
    pub const AUDIO_SIZE: usize = 9;

    /// `true` if `address` carries the direction-IN bit (host reads from this endpoint).
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let has_audio = self.audio.is_some();
        out.write_u8(if has_audio { Self::AUDIO_SIZE as u8 } else { Self::SIZE as u8 })?;
        out.write_u8(Self::TYPE)?;
        out.write_u8(self.address)?;
        out.write_u8(self.transfer_type.bm_attributes())?;
        out.write_u16::<LE>(self.max_packet_size)?;
        out.write_u8(self.interval)?;
        if let Some(audio) = &self.audio {
            out.write_u8(audio.refresh)?;
            out.write_u8(audio.synch_address)?;
        }
        if let Some(comp) = &self.super_speed_companion {
            comp.encode(out)?;
        }
        Ok(())
    }

    /// Parses the fixed 9-byte buffer `ENDPOINT_DESC` returns. Audio/companion
    /// extensions are never returned by that ioctl, so they are not reconstructed.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::DescriptorError("endpoint descriptor buffer too short".into()));
        }
        let length = data[0] as usize;
        if length != Self::SIZE && length != Self::AUDIO_SIZE {
            return Err(Error::DescriptorError(format!("unexpected endpoint descriptor length {length}")));
        }
        if data[1] != Self::TYPE {
            return Err(Error::DescriptorError(format!("unexpected endpoint descriptor type {:#x}", data[1])));
        }
        let address = data[2];
        let bm_attributes = data[3];
        let max_packet_size = u16::from_le_bytes([data[4], data[5]]);
        let interval = data[6];
        let transfer_type = match bm_attributes & 0x03 {
            0 => TransferType::Control,
            2 => TransferType::Bulk,
            3 => TransferType::Interrupt,
            _ => TransferType::Isochronous {
                synchronization: match (bm_attributes >> 2) & 0x03 {
                    1 => IsoSync::Asynchronous,
                    2 => IsoSync::Adaptive,
                    3 => IsoSync::Synchronous,
                    _ => IsoSync::NoSync,
                },
                usage: match (bm_attributes >> 4) & 0x03 {
                    1 => IsoUsage::Feedback,
                    2 => IsoUsage::ImplicitFeedback,
                    _ => IsoUsage::Data,
                },
            },
        };
        Ok(Self { address, transfer_type, max_packet_size, interval, audio: None, super_speed_companion: None })
    }
}

/// An item of a [`Descriptors`] list realised for one speed.
#[derive(Debug, Clone)]
pub enum Descriptor {
    Interface(Interface),
    InterfaceAssociation(InterfaceAssociation),
    Endpoint(Endpoint),
}

impl Descriptor {
    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Descriptor::Interface(d) => d.encode(out),
            Descriptor::InterfaceAssociation(d) => d.encode(out),
            Descriptor::Endpoint(d) => d.encode(out),
        }
    }
}

bitflags::bitflags! {
    /// Flags field of the FunctionFS descriptor-table blob header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DescsFlags: u32 {
        const HAS_FS_DESC = 1;
        const HAS_HS_DESC = 2;
        const HAS_SS_DESC = 4;
        const HAS_MS_OS_DESC = 8;
        const VIRTUAL_ADDR = 16;
        const EVENTFD = 32;
        const ALL_CTRL_RECIP = 64;
        const CONFIG0_SETUP = 128;
    }
}

/// The FunctionFS descriptor-table blob written to `ep0`. `MAGIC_V2`
/// matches `FUNCTIONFS_DESCRIPTORS_MAGIC_V2` from `<linux/usb/functionfs.h>`.
#[derive(Debug, Clone, Default)]
pub struct Descriptors {
    pub full_speed: Vec<Descriptor>,
    pub high_speed: Vec<Descriptor>,
    pub super_speed: Vec<Descriptor>,
}

impl Descriptors {
    pub const MAGIC_V2: u32 = 3;

    /// Encodes the blob. The header's `length` field is back-patched once the
    /// total size is known.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.write_u32::<LE>(Self::MAGIC_V2)?;
        data.write_u32::<LE>(0)?; // length, patched below

        let mut flags = DescsFlags::empty();
        flags.set(DescsFlags::HAS_FS_DESC, !self.full_speed.is_empty());
        flags.set(DescsFlags::HAS_HS_DESC, !self.high_speed.is_empty());
        flags.set(DescsFlags::HAS_SS_DESC, !self.super_speed.is_empty());
        data.write_u32::<LE>(flags.bits())?;

        if !self.full_speed.is_empty() {
            data.write_u32::<LE>(self.full_speed.len() as u32)?;
        }
        if !self.high_speed.is_empty() {
            data.write_u32::<LE>(self.high_speed.len() as u32)?;
        }
        if !self.super_speed.is_empty() {
            data.write_u32::<LE>(self.super_speed.len() as u32)?;
        }

        for d in &self.full_speed {
            d.encode(&mut data)?;
        }
        for d in &self.high_speed {
            d.encode(&mut data)?;
        }
        for d in &self.super_speed {
            d.encode(&mut data)?;
        }

        let len = data.len() as u32;
        data[4..8].copy_from_slice(&len.to_le_bytes());
        Ok(data)
    }

    /// `true` if no speed has a descriptor list, meaning the function declares no
    /// endpoints at all — rejected by the gadget assembler.
    pub fn is_empty(&self) -> bool {
        self.full_speed.is_empty() && self.high_speed.is_empty() && self.super_speed.is_empty()
    }
}

/// The FunctionFS strings blob written to `ep0` after the descriptors blob.
#[derive(Debug, Clone, Default)]
pub struct Strings(pub HashMap<LanguageId, Vec<String>>);

impl Strings {
    pub const MAGIC: u32 = 2;

    /// Encodes the blob. Every language must list the same number of strings, in the
    /// exact order referenced by `iInterface`/`iString` fields — enforced here
    /// rather than left to the caller to get subtly wrong per language.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let str_count = self.0.values().next().map(Vec::len).unwrap_or(0);
        if !self.0.values().all(|v| v.len() == str_count) {
            return Err(Error::DescriptorError("string count differs across languages".into()));
        }

        let mut data = Vec::new();
        data.write_u32::<LE>(Self::MAGIC)?;
        data.write_u32::<LE>(0)?; // length, patched below
        data.write_u32::<LE>(str_count as u32)?;
        data.write_u32::<LE>(self.0.len() as u32)?;

        let mut langs: Vec<_> = self.0.iter().collect();
        langs.sort_by_key(|(lang, _)| lang.0);
        for (lang, strings) in langs {
            data.write_u16::<LE>(lang.0)?;
            for s in strings {
                data.extend_from_slice(s.as_bytes());
                data.write_u8(0)?;
            }
        }

        let len = data.len() as u32;
        data[4..8].copy_from_slice(&len.to_le_bytes());
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_descriptor_length_byte_matches_actual_length() {
        let iface = Interface {
            interface_number: 0,
            alternate_setting: 0,
            num_endpoints: 2,
            class: 0xff,
            sub_class: 0,
            protocol: 0,
            string_index: 0,
        };
        let mut out = Vec::new();
        iface.encode(&mut out).unwrap();
        assert_eq!(out[0] as usize, out.len());
        assert_eq!(out.len(), 9);
    }

    #[test]
    fn endpoint_descriptor_length_byte_matches_actual_length() {
        let ep = Endpoint {
            address: 0x81,
            transfer_type: TransferType::Bulk,
            max_packet_size: 512,
            interval: 0,
            audio: None,
            super_speed_companion: None,
        };
        let mut out = Vec::new();
        ep.encode(&mut out).unwrap();
        assert_eq!(out[0] as usize, out.len());
        assert_eq!(out.len(), 7);
    }

    #[test]
    fn descriptors_blob_length_header_matches_actual_length() {
        let descs = Descriptors {
            full_speed: vec![
                Descriptor::Interface(Interface {
                    interface_number: 0,
                    alternate_setting: 0,
                    num_endpoints: 2,
                    class: 0xff,
                    sub_class: 0,
                    protocol: 0,
                    string_index: 1,
                }),
                Descriptor::Endpoint(Endpoint {
                    address: 0x81,
                    transfer_type: TransferType::Bulk,
                    max_packet_size: 64,
                    interval: 0,
                    audio: None,
                    super_speed_companion: None,
                }),
                Descriptor::Endpoint(Endpoint {
                    address: 0x02,
                    transfer_type: TransferType::Bulk,
                    max_packet_size: 64,
                    interval: 0,
                    audio: None,
                    super_speed_companion: None,
                }),
            ],
            high_speed: vec![],
            super_speed: vec![],
        };
        let bytes = descs.encode().unwrap();
        let declared_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(declared_len as usize, bytes.len());
        assert_eq!(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), Descriptors::MAGIC_V2);
    }

    #[test]
    fn strings_blob_length_header_matches_actual_length() {
        let mut map = HashMap::new();
        map.insert(LanguageId::ENGLISH_UNITED_STATES, vec!["ACME Corp".to_string(), "USB Keyboard".to_string()]);
        let strings = Strings(map);
        let bytes = strings.encode().unwrap();
        let declared_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        assert_eq!(declared_len as usize, bytes.len());
    }

    #[test]
    fn strings_blob_rejects_mismatched_counts_across_languages() {
        let mut map = HashMap::new();
        map.insert(LanguageId::ENGLISH_UNITED_STATES, vec!["a".to_string()]);
        map.insert(LanguageId::GERMAN, vec!["a".to_string(), "b".to_string()]);
        assert!(Strings(map).encode().is_err());
    }

    #[test]
    fn endpoint_round_trips_address_and_type_through_parse() {
        let ep = Endpoint {
            address: 0x83,
            transfer_type: TransferType::Interrupt,
            max_packet_size: 8,
            interval: 4,
            audio: None,
            super_speed_companion: None,
        };
        let mut out = Vec::new();
        ep.encode(&mut out).unwrap();
        let parsed = Endpoint::parse(&out).unwrap();
        assert_eq!(parsed.address, 0x83);
        assert_eq!(parsed.max_packet_size, 8);
        assert!(matches!(parsed.transfer_type, TransferType::Interrupt));
    }
}
