use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, Criterion};

use adalight::{
    color::{ColorHsv, ColorRgb},
    device::{protocol, MAX_LEDS},
};

fn rainbow(leds: usize) -> Vec<ColorRgb> {
    (0..leds)
        .map(|i| ColorHsv::new(360. * i as f64 / leds as f64, 1., 1.).into())
        .collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let frame = rainbow(MAX_LEDS);

    c.bench_function(&format!("encode {} leds", frame.len()), |b| {
        let mut dst = BytesMut::with_capacity(protocol::encoded_len(frame.len()));

        b.iter(|| {
            dst.clear();
            protocol::encode(&frame, &mut dst);
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
