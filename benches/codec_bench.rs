use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gramlink::buffer::MsgBuffer;

fn bench_primitive_writes(c: &mut Criterion) {
    c.bench_function("write_mixed_primitives", |b| {
        b.iter(|| {
            let mut buf = MsgBuffer::with_capacity(256);
            for i in 0..32u32 {
                buf.write_bool(i % 2 == 0);
                buf.write_u32_bits(black_box(i), 20);
                buf.write_var_u64(black_box(i as u64 * 7919));
            }
            black_box(buf.len_bits())
        })
    });
}

fn bench_varint_roundtrip(c: &mut Criterion) {
    c.bench_function("varint_roundtrip", |b| {
        b.iter(|| {
            let mut buf = MsgBuffer::with_capacity(1024);
            for i in 0..100u64 {
                buf.write_var_u64(black_box(i * i * 31));
            }
            let mut total = 0u64;
            for _ in 0..100 {
                total = total.wrapping_add(buf.read_var_u64().unwrap());
            }
            black_box(total)
        })
    });
}

fn bench_unaligned_bit_copy(c: &mut Criterion) {
    let payload = vec![0xC3u8; 1400];
    c.bench_function("unaligned_payload_write", |b| {
        b.iter(|| {
            let mut buf = MsgBuffer::with_capacity(1500);
            buf.write_u8_bits(1, 3);
            buf.write_bytes(black_box(&payload));
            black_box(buf.len_bits())
        })
    });
}

criterion_group!(
    benches,
    bench_primitive_writes,
    bench_varint_roundtrip,
    bench_unaligned_bit_copy
);
criterion_main!(benches);
