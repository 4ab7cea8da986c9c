use gramlink::buffer::{copy_bits, var_u64_size, MsgBuffer};
use gramlink::fragment::{best_chunk_size, FragmentAssembler, FragmentHeader};
use gramlink::protocol::BASE_HEADER_BYTES;
use gramlink::sequence::{advance, relative, SEQUENCE_SPACE};
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_unsigned_varint_roundtrip(value in any::<u64>()) {
        let mut buf = MsgBuffer::new();
        buf.write_var_u64(value);
        prop_assert_eq!(buf.len_bytes(), var_u64_size(value));
        prop_assert_eq!(buf.read_var_u64().unwrap(), value);
        prop_assert_eq!(buf.remaining_bits(), 0);
    }

    #[test]
    fn prop_signed_varint_roundtrip(value in any::<i64>()) {
        let mut buf = MsgBuffer::new();
        buf.write_var_i64(value);
        prop_assert_eq!(buf.read_var_i64().unwrap(), value);
    }

    #[test]
    fn prop_u64_bit_width_roundtrip(value in any::<u64>(), bits in 1usize..=64) {
        let masked = if bits == 64 { value } else { value & ((1u64 << bits) - 1) };
        let mut buf = MsgBuffer::new();
        buf.write_u64_bits(masked, bits);
        prop_assert_eq!(buf.len_bits(), bits);
        prop_assert_eq!(buf.read_u64_bits(bits).unwrap(), masked);
    }

    #[test]
    fn prop_signed_bit_width_roundtrip(value in any::<i32>(), bits in 1usize..=32) {
        let min = if bits == 32 { i32::MIN as i64 } else { -(1i64 << (bits - 1)) };
        let max = if bits == 32 { i32::MAX as i64 } else { (1i64 << (bits - 1)) - 1 };
        let clamped = (value as i64).clamp(min, max) as i32;
        let mut buf = MsgBuffer::new();
        buf.write_i32_bits(clamped, bits);
        prop_assert_eq!(buf.read_i32_bits(bits).unwrap(), clamped);
    }

    #[test]
    fn prop_string_roundtrip(s in "\\PC*") {
        let mut buf = MsgBuffer::new();
        buf.write_str(&s);
        prop_assert_eq!(buf.read_str().unwrap(), s);
    }

    #[test]
    fn prop_string_roundtrip_at_bit_offset(s in "\\PC{0,64}", shift in 1usize..8) {
        let mut buf = MsgBuffer::new();
        buf.write_u8_bits(0, shift);
        buf.write_str(&s);
        buf.read_u8_bits(shift).unwrap();
        prop_assert_eq!(buf.read_str().unwrap(), s);
    }

    /// Copied bits land at the right offsets and neighbors stay untouched.
    #[test]
    fn prop_bit_slice_copy(
        src in prop::collection::vec(any::<u8>(), 1..32),
        src_offset in 0usize..64,
        dst_offset in 0usize..64,
        bit_count in 0usize..128,
    ) {
        let src_bits = src.len() * 8;
        prop_assume!(src_offset < src_bits);
        let bit_count = bit_count.min(src_bits - src_offset);

        let mut dst = vec![0xA5u8; (dst_offset + bit_count).div_ceil(8) + 2];
        let before = dst.clone();
        copy_bits(&src, src_offset, bit_count, &mut dst, dst_offset);

        for i in 0..dst.len() * 8 {
            let got = dst[i / 8] >> (i % 8) & 1;
            if i >= dst_offset && i < dst_offset + bit_count {
                let j = src_offset + (i - dst_offset);
                let want = src[j / 8] >> (j % 8) & 1;
                prop_assert_eq!(got, want, "copied bit {} wrong", i);
            } else {
                let want = before[i / 8] >> (i % 8) & 1;
                prop_assert_eq!(got, want, "neighbor bit {} disturbed", i);
            }
        }
    }

    #[test]
    fn prop_sequence_relative(x in 0u16..SEQUENCE_SPACE, delta in 0u16..SEQUENCE_SPACE) {
        let y = advance(x, delta);
        let rel = relative(y, x);
        // The distance maps into (-S/2, S/2] and inverts cleanly.
        prop_assert!(rel > -(SEQUENCE_SPACE as i32) / 2 && rel <= SEQUENCE_SPACE as i32 / 2);
        let roundtrip = advance(x, rel.rem_euclid(SEQUENCE_SPACE as i32) as u16);
        prop_assert_eq!(roundtrip, y);
    }

    #[test]
    fn prop_chunk_size_always_fits(
        mtu in 512usize..=8190,
        total_bytes in 1usize..200_000,
        group in any::<u32>(),
    ) {
        let total_bits = total_bytes * 8;
        let chunk = best_chunk_size(mtu, total_bits, group);
        let count = total_bytes.div_ceil(chunk);
        let header = FragmentHeader {
            group,
            total_bits: total_bits as u32,
            chunk_byte_size: chunk as u32,
            chunk_index: count as u32,
        };
        prop_assert!(chunk + header.encoded_len() + BASE_HEADER_BYTES <= mtu);
    }

    #[test]
    fn prop_reassembly_from_shuffled_chunks(
        payload in prop::collection::vec(any::<u8>(), 1..5000),
        chunk_size in 64usize..1400,
        order in any::<u64>(),
    ) {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let total_bits = payload.len() * 8;
        let count = payload.len().div_ceil(chunk_size);
        let mut chunks: Vec<(FragmentHeader, Vec<u8>)> = (0..count)
            .map(|i| {
                let start = i * chunk_size;
                let end = (start + chunk_size).min(payload.len());
                (
                    FragmentHeader {
                        group: 1,
                        total_bits: total_bits as u32,
                        chunk_byte_size: chunk_size as u32,
                        chunk_index: i as u32,
                    },
                    payload[start..end].to_vec(),
                )
            })
            .collect();
        chunks.shuffle(&mut rand::rngs::StdRng::seed_from_u64(order));

        let mut assembler = FragmentAssembler::new();
        let mut result = None;
        for (header, data) in &chunks {
            if let Some(msg) = assembler.insert(header, data).unwrap() {
                result = Some(msg);
            }
        }
        let msg = result.expect("all chunks delivered");
        prop_assert_eq!(msg.as_bytes(), payload.as_slice());
    }
}
