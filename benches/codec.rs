use criterion::{criterion_group, criterion_main, Criterion};
use dtee_core::codec::{ByteOrder, Codec, FieldType, Schema, Value};
use dtee_core::network::{Operation, Reassembly};
use uuid::Uuid;

fn call_schema() -> Schema {
    Schema::new(vec![FieldType::Str, FieldType::U32, FieldType::Bytes, FieldType::Bytes])
}

fn call_args(size: usize) -> Vec<Value> {
    vec![
        Value::Str("face_recognition".to_string()),
        Value::U32(7),
        Value::Bytes(vec![0xAB; size]),
        Value::Bytes(vec![0; size]),
    ]
}

fn bench_codec(c: &mut Criterion) {
    let schema = call_schema();
    let args = call_args(4096);

    for order in [ByteOrder::Little, ByteOrder::Big] {
        c.bench_function(&format!("encode_call_4k_{:?}", order), |b| {
            b.iter(|| {
                let mut codec = Codec::with_order(order);
                schema.encode(&args, &mut codec).unwrap();
                codec.into_bytes()
            })
        });

        let mut codec = Codec::with_order(order);
        schema.encode(&args, &mut codec).unwrap();
        let encoded = codec.into_bytes();
        c.bench_function(&format!("decode_call_4k_{:?}", order), |b| {
            b.iter(|| {
                let mut codec = Codec::from_bytes(encoded.clone(), order);
                schema.decode(&mut codec).unwrap()
            })
        });
    }
}

fn bench_fragments(c: &mut Criterion) {
    let payload = vec![0x5A; 1 << 20];

    c.bench_function("fragment_1m_200k", |b| {
        b.iter(|| Operation::fragments(Uuid::new_v4(), -1, &payload, 200_000))
    });

    let fragments = Operation::fragments(Uuid::new_v4(), -1, &payload, 200_000);
    c.bench_function("reassemble_1m_200k", |b| {
        b.iter(|| {
            let mut reassembly = Reassembly::new();
            let mut last = None;
            for op in &fragments {
                last = Some(reassembly.push(op));
            }
            last
        })
    });
}

criterion_group!(benches, bench_codec, bench_fragments);
criterion_main!(benches);
