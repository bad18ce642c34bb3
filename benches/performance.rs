//! Performance benchmarks for the record store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::executor::block_on;
use serde_json::{json, Value};
use tessera::{
    AttrKind, FixtureAdapter, ModelSchema, RecordData, RecordRef, Store, TypeRegistry,
};

fn registry() -> TypeRegistry {
    TypeRegistry::builder()
        .model(
            ModelSchema::new("person")
                .attr("name", AttrKind::String)
                .attr("age", AttrKind::Number)
                .has_many("posts", "post"),
        )
        .model(
            ModelSchema::new("post")
                .attr("title", AttrKind::String)
                .belongs_to("author", "person"),
        )
        .build()
        .unwrap()
}

fn create_store() -> Store {
    Store::new(registry(), FixtureAdapter::new())
}

fn people(count: usize) -> Vec<RecordData> {
    (0..count)
        .map(|i| {
            RecordData::new(i as u64)
                .attr("name", format!("person {}", i))
                .attr("age", (i % 90) as u64)
        })
        .collect()
}

/// Benchmark pushing batches of new records
fn bench_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("push");

    for batch in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("batch", batch), &batch, |b, &batch| {
            b.iter(|| {
                let store = create_store();
                black_box(store.push_many("person", people(batch)).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark updating a loaded record that many filtered arrays watch
fn bench_filter_reevaluation(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_reevaluation");

    for arrays in [1, 10, 100] {
        group.bench_with_input(BenchmarkId::new("arrays", arrays), &arrays, |b, &arrays| {
            let store = create_store();
            store.push_many("person", people(1000)).unwrap();
            let filtered = (0..arrays)
                .map(|n| {
                    let threshold = n as f64;
                    store
                        .filter("person", move |person| {
                            person
                                .get("age")
                                .and_then(Value::as_f64)
                                .map_or(false, |age| age > threshold)
                        })
                        .unwrap()
                })
                .collect::<Vec<_>>();
            let record = store.peek("person", "500").unwrap();

            let mut age = 0u64;
            b.iter(|| {
                age = (age + 1) % 90;
                store.set_attr(&record, "age", age).unwrap();
            });
            black_box(filtered);
        });
    }

    group.finish();
}

/// Benchmark linking members into a has-many with a resolved inverse
fn bench_inverse_linking(c: &mut Criterion) {
    let mut group = c.benchmark_group("inverse_linking");

    for members in [10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("members", members),
            &members,
            |b, &members| {
                b.iter(|| {
                    let store = create_store();
                    let author = store.push("person", RecordData::new("1")).unwrap();
                    let posts = store
                        .push_many(
                            "post",
                            (0..members)
                                .map(|i| RecordData::new(i as u64).attr("title", "t"))
                                .collect(),
                        )
                        .unwrap();
                    for post in &posts {
                        store.add_to_has_many(&author, "posts", post).unwrap();
                    }
                    black_box(store.has_many(&author, "posts").unwrap().len());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark identity-map lookups against a populated store
fn bench_find_loaded(c: &mut Criterion) {
    let store = create_store();
    store.push_many("person", people(10000)).unwrap();
    let ids: Vec<String> = (0..10000).step_by(97).map(|i| i.to_string()).collect();

    c.bench_function("find_loaded", |b| {
        b.iter(|| {
            for id in &ids {
                let record: RecordRef = block_on(store.find("person", id.as_str())).unwrap();
                black_box(record);
            }
        });
    });
}

/// Benchmark normalizing and loading a raw payload with fixtures
fn bench_fixture_find_all(c: &mut Criterion) {
    let fixtures: Vec<Value> = (0..1000)
        .map(|i| json!({ "id": i, "name": format!("person {}", i), "age": i % 90 }))
        .collect();

    c.bench_function("fixture_find_all_1000", |b| {
        b.iter(|| {
            let store = Store::new(
                registry(),
                FixtureAdapter::new().with_fixtures("person", fixtures.clone()),
            );
            black_box(block_on(store.find_all("person")).unwrap().len());
        });
    });
}

criterion_group!(
    benches,
    bench_push,
    bench_filter_reevaluation,
    bench_inverse_linking,
    bench_find_loaded,
    bench_fixture_find_all,
);

criterion_main!(benches);
