use std::hint::black_box;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use proxy_harvest::codec::{parse_configs_from_text, Codec};
use proxy_harvest::fetcher::decode_subscription_body;

const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

fn subscription(lines: usize) -> String {
    let mut body = String::with_capacity(lines * 96);
    for i in 0..lines {
        match i % 4 {
            0 => body.push_str(&format!("trojan://pw{i}@t{i}.example.com:443?sni=cdn.example.com#t{i}\n")),
            1 => body.push_str(&format!(
                "vless://{UUID}@v{i}.example.com:443?security=tls&type=ws&path=%2Fws#v{i}\n"
            )),
            2 => body.push_str(&format!("ss://YWVzLTI1Ni1nY206cGFzc3dvcmQ@s{i}.example.com:8388#s{i}\n")),
            _ => body.push_str("<p>not a config line at all</p>\n"),
        }
    }
    body
}

fn bench_scan(c: &mut Criterion) {
    let plain = subscription(2_000);
    let encoded = STANDARD.encode(&plain);

    let mut group = c.benchmark_group("scan");
    group.throughput(Throughput::Bytes(plain.len() as u64));
    group.bench_function("plain_2000", |b| b.iter(|| parse_configs_from_text(black_box(&plain))));
    group.bench_function("base64_2000", |b| {
        b.iter(|| parse_configs_from_text(&decode_subscription_body(black_box(&encoded))))
    });
    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let codec = Codec::new();
    let lines = parse_configs_from_text(&subscription(1_000));

    c.bench_function("parse_and_key_1000", |b| {
        b.iter(|| {
            lines
                .iter()
                .filter_map(|l| codec.parse(black_box(l), "https://bench.example/"))
                .count()
        })
    });
    c.bench_function("history_key_1000", |b| {
        b.iter(|| lines.iter().map(|l| codec.history_key(black_box(l))).count())
    });
}

criterion_group!(benches, bench_scan, bench_parse);
criterion_main!(benches);
