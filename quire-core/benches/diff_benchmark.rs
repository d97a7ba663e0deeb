use criterion::{criterion_group, criterion_main, Criterion};
use quire_core::{diff, Content, MemoryBackend, VersionControl};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn text_of(lines: usize, salt: &str) -> Content {
    let body: Vec<String> = (0..lines).map(|i| format!("line {i} {salt}")).collect();
    Content::text(body.join("\n"))
}

fn bench_diff_text_1000_lines(c: &mut Criterion) {
    let previous = text_of(1000, "a");
    let mut lines: Vec<String> = (0..1000).map(|i| format!("line {i} a")).collect();
    for line in lines.iter_mut().step_by(10) {
        line.push_str(" edited");
    }
    let current = Content::text(lines.join("\n"));

    c.bench_function("diff_text_1000_lines", |b| {
        b.iter(|| black_box(diff(black_box(&previous), black_box(&current))))
    });
}

fn bench_diff_identical_text(c: &mut Criterion) {
    let content = text_of(1000, "same");

    c.bench_function("diff_identical_text_1000_lines", |b| {
        b.iter(|| black_box(diff(black_box(&content), black_box(&content))))
    });
}

fn bench_diff_list_500_objects(c: &mut Criterion) {
    let previous = Content::from(Value::Array(
        (0..500).map(|i| json!({"id": i, "done": false})).collect(),
    ));
    let current = Content::from(Value::Array(
        (0..500)
            .rev()
            .map(|i| json!({"done": i % 7 == 0, "id": i}))
            .collect(),
    ));

    c.bench_function("diff_list_500_objects", |b| {
        b.iter(|| black_box(diff(black_box(&previous), black_box(&current))))
    });
}

fn bench_diff_map_500_keys(c: &mut Criterion) {
    let mut previous = Map::new();
    let mut current = Map::new();
    for i in 0..500 {
        previous.insert(format!("k{i}"), json!({"value": i, "meta": [i, i + 1]}));
        if i % 50 != 0 {
            let value = if i % 5 == 0 { i * 2 } else { i };
            current.insert(format!("k{i}"), json!({"meta": [i, i + 1], "value": value}));
        }
    }
    current.insert("extra".into(), json!("added"));
    let previous = Content::Map(previous);
    let current = Content::Map(current);

    c.bench_function("diff_map_500_keys", |b| {
        b.iter(|| black_box(diff(black_box(&previous), black_box(&current))))
    });
}

fn bench_create_version_memory(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let vc = VersionControl::with_defaults(Arc::new(MemoryBackend::new()));
    let resource = Uuid::new_v4();
    let content = text_of(50, "v");

    c.bench_function("create_version_memory", |b| {
        b.iter(|| {
            let version = rt
                .block_on(vc.create_version(
                    resource,
                    content.clone(),
                    "bench",
                    None,
                    BTreeSet::new(),
                ))
                .unwrap();
            black_box(version);
        })
    });
}

criterion_group!(
    benches,
    bench_diff_text_1000_lines,
    bench_diff_identical_text,
    bench_diff_list_500_objects,
    bench_diff_map_500_keys,
    bench_create_version_memory,
);
criterion_main!(benches);
