//! Integration tests for list encoding and CAMAC address translation
//!
//! Covers the properties every consumer relies on: encode/decode symmetry,
//! header differences between dispatch modes, and bit-exact CAMAC packing.

use protocol::camac::{
    self, CamacAddress, CamacWidth, FUNCTION_MASK, SPLIT_DELAY_CLOCKS, WIDTH_MASK, convert, decode,
};
use protocol::codec::{TA_IMMED, TA_SEL};
use protocol::{
    AddressModifier, DataWidth, Dispatch, Operation, OperationList, ProtocolError, StackSlot,
    decode_packet, decode_reply, encode_immediate, encode_stack,
};

fn write32_list(n: u32) -> OperationList {
    let mut list = OperationList::new();
    for i in 0..n {
        list.add_write32(0x0100_0000 + i * 4, AddressModifier::A32UserData, i * 0x1111)
            .expect("valid write");
    }
    list
}

mod list_roundtrip {
    use super::*;

    #[test]
    fn test_write32_roundtrip_preserves_order() {
        for n in [0, 1, 7, 100] {
            let list = write32_list(n);
            let packet = encode_immediate(&list).expect("Failed to encode");
            let (header, decoded) = decode_packet(&packet).expect("Failed to decode");

            assert_eq!(header.dispatch, Dispatch::Immediate);
            assert_eq!(decoded.len(), n as usize);
            assert_eq!(decoded, list);
        }
    }

    #[test]
    fn test_stack_roundtrip() {
        let list = write32_list(12);
        let slot = StackSlot::new(3).unwrap();
        let packet = encode_stack(&list, slot, 0x100).expect("Failed to encode");
        let (header, decoded) = decode_packet(&packet).expect("Failed to decode");

        assert_eq!(decoded, list);
        assert_eq!(
            header.dispatch,
            Dispatch::Stack {
                slot,
                offset: 0x100
            }
        );
        assert_eq!(header.length as usize, list.size() * 2 + 1);
    }

    #[test]
    fn test_mixed_list_roundtrip() {
        let mut list = OperationList::new();
        list.add_marker(0xabcd);
        list.add_read16(0x00ee_0002, AddressModifier::A24UserData)
            .unwrap();
        list.add_delay(5);
        list.add_fifo_read32(0x0400_0000, AddressModifier::A32UserBlock, 256)
            .unwrap();
        list.add_register_read(0x08);

        let packet = encode_immediate(&list).unwrap();
        let (_, decoded) = decode_packet(&packet).unwrap();
        assert_eq!(decoded, list);
    }
}

mod dispatch_modes {
    use super::*;

    #[test]
    fn test_headers_differ_bodies_identical() {
        let list = write32_list(5);
        let immediate = encode_immediate(&list).unwrap();
        let stack = encode_stack(&list, StackSlot::new(0).unwrap(), 0).unwrap();

        assert_ne!(immediate[..6], stack[..6]);
        assert_eq!(immediate[6..], stack[6..]);

        let ta_immediate = u16::from_le_bytes([immediate[0], immediate[1]]);
        let ta_stack = u16::from_le_bytes([stack[0], stack[1]]);
        assert_ne!(ta_immediate & TA_IMMED, 0);
        assert_eq!(ta_immediate & TA_SEL, 0);
        assert_eq!(ta_stack & TA_IMMED, 0);
        assert_ne!(ta_stack & TA_SEL, 0);
    }

    #[test]
    fn test_immediate_length_is_32_bits() {
        // 300 writes = 900 32-bit words = 1800 16-bit words
        let list = write32_list(300);
        let packet = encode_immediate(&list).unwrap();
        let length = u32::from_le_bytes([packet[2], packet[3], packet[4], packet[5]]);
        assert_eq!(length, 1800);
    }

    #[test]
    fn test_stack_overflow_rejected() {
        // 0x800 stack words hold at most 341 three-word writes
        let list = write32_list(342);
        let result = encode_stack(&list, StackSlot::new(1).unwrap(), 0);
        assert!(matches!(result, Err(ProtocolError::PacketTooLarge { .. })));
    }
}

mod construction_errors {
    use super::*;

    #[test]
    fn test_invalid_width() {
        assert!(matches!(
            DataWidth::from_bits(12),
            Err(ProtocolError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn test_invalid_modifier() {
        for raw in [0x00u8, 0x08, 0x2a, 0x3c, 0xff] {
            assert!(matches!(
                AddressModifier::from_raw(raw),
                Err(ProtocolError::InvalidOperation { .. })
            ));
        }
    }

    #[test]
    fn test_zero_count_block() {
        let mut list = OperationList::new();
        assert!(matches!(
            list.add_block_read32(0x1000, AddressModifier::A32UserBlock, 0),
            Err(ProtocolError::InvalidOperation { .. })
        ));
    }
}

mod camac_translation {
    use super::*;

    #[test]
    fn test_roundtrip_every_valid_tuple() {
        for b in 0..8u8 {
            for c in 0..8u8 {
                for n in 0..32u8 {
                    for a in 0..16u8 {
                        for f in 0..32u8 {
                            for width in [CamacWidth::Bits16, CamacWidth::Bits24] {
                                let packed = convert(b, c, n, a, f, width).unwrap();
                                let decoded = decode(packed.word());
                                assert_eq!(
                                    decoded.address,
                                    CamacAddress::new(b, c, n, a, f).unwrap()
                                );
                                assert_eq!(decoded.width, width);
                                assert_eq!(decoded.extra_bits, 0);
                                assert!(decoded.marker);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_any_field_out_of_range_rejected() {
        let cases = [
            (8, 0, 0, 0, 0),
            (255, 0, 0, 0, 0),
            (0, 8, 0, 0, 0),
            (0, 0, 32, 0, 0),
            (0, 0, 0, 16, 0),
            (0, 0, 0, 0, 32),
            (7, 7, 31, 15, 255),
        ];
        for (b, c, n, a, f) in cases {
            let result = convert(b, c, n, a, f, CamacWidth::Bits16);
            assert!(
                matches!(result, Err(ProtocolError::InvalidAddress { .. })),
                "({}, {}, {}, {}, {}) accepted",
                b,
                c,
                n,
                a,
                f
            );
        }
    }

    #[test]
    fn test_function_only_difference() {
        let f0 = convert(2, 1, 5, 3, 0, CamacWidth::Bits16).unwrap().word();
        let f9 = convert(2, 1, 5, 3, 9, CamacWidth::Bits16).unwrap().word();
        assert_ne!(f0, f9);
        assert_eq!(f0 & !FUNCTION_MASK, f9 & !FUNCTION_MASK);
    }

    #[test]
    fn test_write24_decomposition() {
        let addr = CamacAddress::new(0, 1, 10, 0, 16).unwrap();
        let mut list = OperationList::new();
        camac::add_camac_write24(&mut list, &addr, 0x00ab_cdef).unwrap();

        let ops = list.operations();
        let (first, second) = match (&ops[0], &ops[2]) {
            (
                Operation::Write {
                    width: DataWidth::D16,
                    address: a1,
                    datum: d1,
                    ..
                },
                Operation::Write {
                    width: DataWidth::D16,
                    address: a2,
                    datum: d2,
                    ..
                },
            ) => ((*a1, *d1), (*a2, *d2)),
            other => panic!("Expected two D16 writes, got {:?}", other),
        };
        assert_eq!(ops[1], Operation::Delay { clocks: SPLIT_DELAY_CLOCKS });

        // same base, only the width selector differs
        assert_eq!(first.0 ^ second.0, WIDTH_MASK);
        assert_eq!(decode(first.0).width, CamacWidth::Bits24);
        assert_eq!(decode(second.0).width, CamacWidth::Bits16);
        assert_eq!(first.1, 0x00ab);
        assert_eq!(second.1, 0xcdef);
    }

    #[test]
    fn test_read24_reply_words() {
        let addr = CamacAddress::new(1, 2, 3, 4, 0).unwrap();
        let mut list = OperationList::new();
        camac::add_camac_read24(&mut list, &addr).unwrap();
        assert_eq!(list.len(), 3);

        // reply: high byte item then low word item, D16 each
        let words = decode_reply(&[0x12, 0x00, 0x78, 0x56], DataWidth::D16).unwrap();
        assert_eq!(((words[0] & 0xff) << 16) | words[1], 0x0012_5678);
    }
}
