//! Throughput of the hot paths: CRC, value conversion and range building.

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use voltage_serial::pdu::read_request;
use voltage_serial::rtu::{compose_adu, crc16, parse_response};
use voltage_serial::{
    decode, encode, split_register_list, DeviceId, DeviceLimits, ModbusFunction, ModbusKind,
    RangeCandidate, RegisterId, RegisterKind, Scaling, ValueFormat,
};

fn bench_crc(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc16");
    for len in [8usize, 64, 256] {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &data, |b, data| {
            b.iter(|| crc16(black_box(data)))
        });
    }
    group.finish();
}

fn bench_frames(c: &mut Criterion) {
    let response = [0x01, 0x03, 0x02, 0x00, 0x2A, 0x39, 0x9B];

    c.bench_function("compose_read_adu", |b| {
        b.iter(|| {
            let pdu = read_request(ModbusKind::Holding, black_box(100), black_box(10));
            pdu.map(|pdu| compose_adu(1, &pdu))
        })
    });
    c.bench_function("parse_read_response", |b| {
        b.iter(|| {
            parse_response(
                1,
                ModbusFunction::ReadHoldingRegisters,
                1,
                black_box(&response),
            )
            .is_ok()
        })
    });
}

fn bench_values(c: &mut Criterion) {
    let scaled = Scaling::new(0.1);
    let identity = Scaling::default();

    c.bench_function("encode_s16_scaled", |b| {
        b.iter(|| encode(black_box(0xFF38), ValueFormat::S16, &scaled))
    });
    c.bench_function("encode_float", |b| {
        b.iter(|| encode(black_box(0x4248_0000), ValueFormat::Float, &identity))
    });
    c.bench_function("decode_u32", |b| {
        b.iter(|| decode(black_box("305419896"), ValueFormat::U32, &identity))
    });
}

fn bench_ranges(c: &mut Criterion) {
    let candidates: Vec<RangeCandidate> = (0..500u32)
        .map(|i| RangeCandidate {
            register: RegisterId(i),
            kind: if i % 5 == 0 {
                RegisterKind::COIL
            } else {
                RegisterKind::HOLDING
            },
            address: i * 3,
            poll_interval: Duration::from_millis(if i % 7 == 0 { 1000 } else { 100 }),
        })
        .collect();
    let limits = DeviceLimits::new().with_max_reg_hole(4).with_max_bit_hole(16);

    c.bench_function("split_register_list_500", |b| {
        b.iter(|| split_register_list(DeviceId(0), black_box(candidates.clone()), &limits))
    });
}

criterion_group!(benches, bench_crc, bench_frames, bench_values, bench_ranges);
criterion_main!(benches);
