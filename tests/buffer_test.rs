use gramlink::buffer::{copy_bits, var_u32_size, var_u64_size, MsgBuffer};
use gramlink::TransportError;

#[test]
fn test_primitive_roundtrip() {
    let mut buf = MsgBuffer::new();
    buf.write_bool(true);
    buf.write_u8(0xAB);
    buf.write_u16(0xCDEF);
    buf.write_u32(0xDEADBEEF);
    buf.write_u64(0x0123_4567_89AB_CDEF);
    buf.write_i32(-123_456);
    buf.write_i64(-9_876_543_210);
    buf.write_f32(3.5);
    buf.write_f64(-0.125);

    assert!(buf.read_bool().unwrap());
    assert_eq!(buf.read_u8().unwrap(), 0xAB);
    assert_eq!(buf.read_u16().unwrap(), 0xCDEF);
    assert_eq!(buf.read_u32().unwrap(), 0xDEADBEEF);
    assert_eq!(buf.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
    assert_eq!(buf.read_i32().unwrap(), -123_456);
    assert_eq!(buf.read_i64_bits(64).unwrap(), -9_876_543_210);
    assert_eq!(buf.read_f32().unwrap(), 3.5);
    assert_eq!(buf.read_f64().unwrap(), -0.125);
    assert_eq!(buf.remaining_bits(), 0);
}

/// Mixed-width write-then-read sequence with padding, matching the values of
/// the classic smoke scenario. The string forms concatenate to the expected
/// blob exactly.
#[test]
fn test_mixed_sequence_scenario() {
    let mut buf = MsgBuffer::new();
    buf.write_bool(false);
    buf.write_i32_bits(-3, 6);
    buf.write_i32(42);
    buf.write_str("duke of earl");
    buf.write_u8(43);
    buf.write_u16(44);
    buf.write_u64_bits(u64::MAX, 64);
    buf.write_bool(true);
    buf.write_padding();

    let b0 = buf.read_bool().unwrap();
    let i6 = buf.read_i32_bits(6).unwrap();
    let i32v = buf.read_i32().unwrap();
    let s = buf.read_str().unwrap();
    let u8v = buf.read_u8().unwrap();
    let u16v = buf.read_u16().unwrap();
    let u64v = buf.read_u64_bits(64).unwrap();
    let b1 = buf.read_bool().unwrap();

    assert!(!b0);
    assert_eq!(i6, -3);
    assert_eq!(i32v, 42);
    assert_eq!(s, "duke of earl");
    assert_eq!(u8v, 43);
    assert_eq!(u16v, 44);
    assert_eq!(u64v, u64::MAX);
    assert!(b1);

    let mut concat = String::new();
    concat.push_str(if b0 { "True" } else { "False" });
    concat.push_str(&i6.to_string());
    concat.push_str(&i32v.to_string());
    concat.push_str(&s);
    concat.push_str(&u8v.to_string());
    concat.push_str(&u16v.to_string());
    concat.push_str(&u64v.to_string());
    concat.push_str(if b1 { "True" } else { "False" });
    assert_eq!(concat, "False-342duke of earl434418446744073709551615True");
}

#[test]
fn test_signed_bit_widths() {
    for bits in 1..=32usize {
        let min = if bits == 32 {
            i32::MIN as i64
        } else {
            -(1i64 << (bits - 1))
        };
        let max = if bits == 32 {
            i32::MAX as i64
        } else {
            (1i64 << (bits - 1)) - 1
        };
        for value in [min, min + 1, -1, 0, 1, max - 1, max] {
            if value < min || value > max {
                continue;
            }
            let mut buf = MsgBuffer::new();
            buf.write_i32_bits(value as i32, bits);
            assert_eq!(
                buf.read_i32_bits(bits).unwrap(),
                value as i32,
                "width {bits} value {value}"
            );
        }
    }
}

#[test]
fn test_sign_magnitude_encoding() {
    // Negative v encodes as ((-v) - 1) | sign_bit with the sign at bit N-1.
    let mut buf = MsgBuffer::new();
    buf.write_i32_bits(-3, 6);
    assert_eq!(buf.read_u8_bits(6).unwrap(), 0b100010);
}

#[test]
fn test_varint_known_sizes() {
    for (value, size) in [
        (0u64, 1usize),
        (0x7F, 1),
        (0x80, 2),
        (0x3FFF, 2),
        (0x4000, 3),
        (u32::MAX as u64, 5),
        (u64::MAX, 10),
    ] {
        assert_eq!(var_u64_size(value), size, "value {value:#x}");
        let mut buf = MsgBuffer::new();
        buf.write_var_u64(value);
        assert_eq!(buf.len_bytes(), size);
        assert_eq!(buf.read_var_u64().unwrap(), value);
        assert_eq!(buf.remaining_bits(), 0);
    }
    assert_eq!(var_u32_size(u32::MAX), 5);
}

/// Two small negative varints cost one byte each.
#[test]
fn test_signed_varint_sizes() {
    let mut buf = MsgBuffer::new();
    buf.write_var_i32(-47);
    assert_eq!(buf.len_bytes(), 1);
    buf.write_var_i32(-49);
    assert_eq!(buf.len_bytes(), 2);
    assert_eq!(buf.read_var_i32().unwrap(), -47);
    assert_eq!(buf.read_var_i32().unwrap(), -49);
}

#[test]
fn test_varint_signed_roundtrip() {
    for value in [0i64, -1, 1, i64::MIN, i64::MAX, -300, 300, 1 << 40] {
        let mut buf = MsgBuffer::new();
        buf.write_var_i64(value);
        assert_eq!(buf.read_var_i64().unwrap(), value);
    }
}

#[test]
fn test_varint_overlong_rejected() {
    let mut buf = MsgBuffer::from_bytes(vec![0xFF; 10]);
    assert_eq!(buf.read_var_u32(), Err(TransportError::MalformedVarint));
    let mut buf = MsgBuffer::from_bytes(vec![0xFF; 10]);
    assert_eq!(buf.read_var_u64(), Err(TransportError::MalformedVarint));
}

#[test]
fn test_string_roundtrip() {
    for s in [
        "",
        "a",
        "duke of earl",
        "héllo wörld",
        "日本語のテキスト",
        "🦀 non-BMP 🦀",
        "mixed 🦀 ascii ünd ümlauts",
    ] {
        let mut buf = MsgBuffer::new();
        buf.write_str(s);
        assert_eq!(buf.read_str().unwrap(), s, "string {s:?}");
    }
}

#[test]
fn test_string_roundtrip_unaligned() {
    let mut buf = MsgBuffer::new();
    buf.write_bool(true);
    buf.write_str("offset by one bit 🦀");
    assert!(buf.read_bool().unwrap());
    assert_eq!(buf.read_str().unwrap(), "offset by one bit 🦀");
}

/// The byte-count field is padded to the varint size of the maximum possible
/// byte count. 32 ASCII chars: max 128 bytes (2-byte varint) but actual 32
/// (1 byte), so the field is the actual value with its high bit forced plus a
/// zero terminator.
#[test]
fn test_string_header_padding() {
    let s = "a".repeat(32);
    let mut buf = MsgBuffer::new();
    buf.write_str(&s);
    let bytes = buf.as_bytes();
    assert_eq!(bytes[0], 32); // char count
    assert_eq!(bytes[1], 0x20 | 0x80); // byte count with forced continuation
    assert_eq!(bytes[2], 0x00); // padding terminator
    assert_eq!(&bytes[3..35], s.as_bytes());
    assert_eq!(buf.read_str().unwrap(), s);
}

#[test]
fn test_string_declared_length_beyond_buffer() {
    let mut buf = MsgBuffer::new();
    buf.write_var_u32(4); // 4 chars
    buf.write_var_u32(12); // claims 12 bytes
    buf.write_u8(b'x'); // only one present
    let err = buf.read_str().unwrap_err();
    assert_eq!(err, TransportError::EndOfMessage);
}

#[test]
fn test_bit_slice_copy() {
    let src = [0b1011_0010u8, 0b0110_1101, 0b1111_0000];
    for src_offset in 0..16 {
        for bit_count in 1..=(24 - src_offset) {
            for dst_offset in 0..16 {
                let mut dst = [0u8; 6];
                copy_bits(&src, src_offset, bit_count, &mut dst, dst_offset);
                for i in 0..bit_count {
                    let want = src[(src_offset + i) / 8] >> ((src_offset + i) % 8) & 1;
                    let got = dst[(dst_offset + i) / 8] >> ((dst_offset + i) % 8) & 1;
                    assert_eq!(got, want, "src_off {src_offset} count {bit_count} dst_off {dst_offset} bit {i}");
                }
            }
        }
    }
}

#[test]
fn test_bit_slice_copy_preserves_neighbors() {
    let src = [0u8; 4];
    let mut dst = [0xFFu8; 4];
    copy_bits(&src, 3, 10, &mut dst, 5);
    for i in 0..32 {
        let bit = dst[i / 8] >> (i % 8) & 1;
        if (5..15).contains(&i) {
            assert_eq!(bit, 0, "bit {i} should be copied");
        } else {
            assert_eq!(bit, 1, "bit {i} should be untouched");
        }
    }
}

#[test]
fn test_write_bits_unaligned_lengths() {
    let mut buf = MsgBuffer::new();
    buf.write_u8_bits(0b101, 3);
    buf.write_u16_bits(0x1FF, 9);
    buf.write_u32_bits(0xABCDE, 20);
    buf.write_u64_bits(0x3_FFFF_FFFF, 34);
    assert_eq!(buf.read_u8_bits(3).unwrap(), 0b101);
    assert_eq!(buf.read_u16_bits(9).unwrap(), 0x1FF);
    assert_eq!(buf.read_u32_bits(20).unwrap(), 0xABCDE);
    assert_eq!(buf.read_u64_bits(34).unwrap(), 0x3_FFFF_FFFF);
}

#[test]
fn test_end_of_message() {
    let mut buf = MsgBuffer::new();
    buf.write_u8(7);
    assert_eq!(buf.read_u8().unwrap(), 7);
    assert_eq!(buf.read_u8(), Err(TransportError::EndOfMessage));
    assert_eq!(buf.read_bool(), Err(TransportError::EndOfMessage));

    let mut buf = MsgBuffer::new();
    buf.write_u8_bits(3, 4);
    assert_eq!(buf.read_u8(), Err(TransportError::EndOfMessage));
    assert_eq!(buf.read_u8_bits(4).unwrap(), 3);
}

#[test]
fn test_padding_aligns_cursors() {
    let mut buf = MsgBuffer::new();
    buf.write_bool(true);
    buf.write_padding();
    assert_eq!(buf.len_bits(), 8);
    buf.write_u8(0x55);

    assert!(buf.read_bool().unwrap());
    buf.align_read().unwrap();
    assert_eq!(buf.read_u8().unwrap(), 0x55);
}

#[test]
fn test_peek_and_try_variants() {
    let mut buf = MsgBuffer::new();
    buf.write_u8(42);
    assert_eq!(buf.peek_u8().unwrap(), 42);
    assert_eq!(buf.position_bits(), 0);
    assert_eq!(buf.try_read_u8(), Some(42));
    assert_eq!(buf.try_read_u8(), None);
    assert_eq!(buf.try_read_bool(), None);
    assert_eq!(buf.peek_u8(), Err(TransportError::EndOfMessage));
}

#[test]
fn test_bytes_roundtrip() {
    let payload: Vec<u8> = (0..=255).collect();
    let mut buf = MsgBuffer::new();
    buf.write_bool(true); // force unaligned byte copies
    buf.write_bytes(&payload);
    assert!(buf.read_bool().unwrap());
    assert_eq!(buf.read_bytes(payload.len()).unwrap(), payload);
}

#[test]
fn test_read_position_control() {
    let mut buf = MsgBuffer::new();
    buf.write_u16(0xBEEF);
    assert_eq!(buf.read_u16().unwrap(), 0xBEEF);
    buf.set_position_bits(0);
    assert_eq!(buf.read_u16().unwrap(), 0xBEEF);
}
