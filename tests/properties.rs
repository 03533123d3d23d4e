//! Property-based invariants from the design's testable-properties section: these
//! are universally-quantified statements over an input range, not hand-picked
//! example tables.

use gadgetfs::aio::BufferPool;
use gadgetfs::descriptor::{Descriptor, Descriptors, Endpoint, Interface, TransferType};
use gadgetfs::power::MaxPower;
use proptest::prelude::*;

proptest! {
    /// Invariant 1: for every encoded descriptor, the first byte equals the total
    /// byte length.
    #[test]
    fn interface_descriptor_length_byte_matches_actual_length(
        interface_number in 0u8..16,
        num_endpoints in 0u8..8,
        class in any::<u8>(),
        sub_class in any::<u8>(),
        protocol in any::<u8>(),
    ) {
        let iface = Interface {
            interface_number,
            alternate_setting: 0,
            num_endpoints,
            class,
            sub_class,
            protocol,
            string_index: 0,
        };
        let mut out = Vec::new();
        iface.encode(&mut out).unwrap();
        prop_assert_eq!(out[0] as usize, out.len());
    }

    #[test]
    fn endpoint_descriptor_length_byte_matches_actual_length(
        address in any::<u8>(),
        max_packet_size in 0u16..1024,
        interval in any::<u8>(),
    ) {
        let ep = Endpoint {
            address,
            transfer_type: TransferType::Bulk,
            max_packet_size,
            interval,
            audio: None,
            super_speed_companion: None,
        };
        let mut out = Vec::new();
        ep.encode(&mut out).unwrap();
        prop_assert_eq!(out[0] as usize, out.len());
        prop_assert_eq!(out.len(), Endpoint::SIZE);
    }

    /// Invariant 2: the encoded FunctionFs blob length equals the header's
    /// declared length field, for any combination of full/high-speed descriptor
    /// lists.
    #[test]
    fn descriptors_blob_declared_length_matches_actual(
        num_fs_endpoints in 0usize..4,
        num_hs_endpoints in 0usize..4,
    ) {
        let make_endpoints = |n: usize| -> Vec<Descriptor> {
            (0..n)
                .map(|i| {
                    Descriptor::Endpoint(Endpoint {
                        address: 0x80 | (i as u8 + 1),
                        transfer_type: TransferType::Bulk,
                        max_packet_size: 64,
                        interval: 0,
                        audio: None,
                        super_speed_companion: None,
                    })
                })
                .collect()
        };

        let mut full_speed = vec![Descriptor::Interface(Interface {
            interface_number: 0,
            alternate_setting: 0,
            num_endpoints: num_fs_endpoints as u8,
            class: 0xff,
            sub_class: 0,
            protocol: 0,
            string_index: 0,
        })];
        full_speed.extend(make_endpoints(num_fs_endpoints));

        let mut high_speed = vec![Descriptor::Interface(Interface {
            interface_number: 0,
            alternate_setting: 0,
            num_endpoints: num_hs_endpoints as u8,
            class: 0xff,
            sub_class: 0,
            protocol: 0,
            string_index: 0,
        })];
        high_speed.extend(make_endpoints(num_hs_endpoints));

        let descs = Descriptors { full_speed, high_speed, super_speed: vec![] };
        let bytes = descs.encode().unwrap();
        let declared_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        prop_assert_eq!(declared_len as usize, bytes.len());
    }

    /// Invariant 3: `MaxPower::from_milliamps(n).to_milliamps() == (n / 2) * 2` for
    /// `0 <= n <= 510`; values above 510 are rejected.
    #[test]
    fn power_conversion_rounds_down_within_range(ma in 0u16..=510) {
        let power = MaxPower::from_milliamps(ma).unwrap();
        prop_assert_eq!(power.to_milliamps(), (ma / 2) * 2);
    }

    #[test]
    fn power_conversion_rejects_above_range(ma in 511u32..=u16::MAX as u32) {
        prop_assert!(MaxPower::from_milliamps(ma as u16).is_err());
    }

    /// Invariant 5 (restricted to the buffer-pool half of AIO accounting, the part
    /// exercisable without a kernel AIO context): after any sequence of
    /// acquire/release calls, `available + in_use` stays equal to the pool's
    /// capacity.
    #[test]
    fn buffer_pool_accounting_holds_across_random_acquire_release_sequences(
        ops in prop::collection::vec(any::<bool>(), 0..200),
    ) {
        let capacity = 8;
        let mut pool = BufferPool::new(capacity, 16);
        let mut held = Vec::new();

        for acquire in ops {
            if acquire {
                if let Some(buf) = pool.acquire() {
                    held.push(buf);
                }
            } else if let Some(buf) = held.pop() {
                pool.release(buf);
            }
            prop_assert_eq!(pool.available_count() + pool.in_use_count(), capacity);
        }
    }
}
