use cascade_store::context::{is_matching, ContextDef, DimensionDef, MatchKind, ScalarKind};
use cascade_store::overrides::{self, Override};
use cascade_store::{Context, Value};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

fn context_def() -> Arc<ContextDef> {
    let tenant = Arc::new(
        DimensionDef::builder("tenant", MatchKind::Exact(ScalarKind::Long))
            .match_any(true)
            .build()
            .unwrap(),
    );
    let region = Arc::new(
        DimensionDef::builder("region", MatchKind::Hierarchy { max_depth: 4 })
            .build()
            .unwrap(),
    );
    let amount = Arc::new(
        DimensionDef::builder(
            "amount",
            MatchKind::Range {
                boundaries: vec![0, 10, 100, 1_000, 10_000],
            },
        )
        .build()
        .unwrap(),
    );
    ContextDef::new("bench", vec![tenant, region, amount]).unwrap()
}

fn stored_contexts(def: &Arc<ContextDef>, count: usize) -> Vec<Context> {
    let regions = ["eu", "eu/de", "eu/de/berlin", "us", "us/ca"];
    let amounts = ["0", "10", "100", "1000", "10000"];
    (0..count)
        .map(|i| {
            let tenant = (i % 50).to_string();
            def.parse([
                ("tenant", tenant.as_str()),
                ("region", regions[i % regions.len()]),
                ("amount", amounts[(i / 7) % amounts.len()]),
            ])
            .unwrap()
        })
        .collect()
}

fn bench_build_context(c: &mut Criterion) {
    let def = context_def();
    c.bench_function("context_parse", |b| {
        b.iter(|| {
            black_box(
                def.parse([("tenant", "42"), ("region", "eu/de/berlin"), ("amount", "250")])
                    .unwrap(),
            )
        })
    });
}

fn bench_matching(c: &mut Criterion) {
    let def = context_def();
    let query = def
        .parse([("tenant", "7"), ("region", "eu/de/berlin"), ("amount", "5000")])
        .unwrap();

    let mut group = c.benchmark_group("is_matching");
    for size in [100, 1_000, 10_000].iter() {
        let stored = stored_contexts(&def, *size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(stored.iter().filter(|s| is_matching(s, &query)).count()))
        });
    }
    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let def = context_def();
    let query = def
        .parse([("tenant", "7"), ("region", "eu/de/berlin"), ("amount", "5000")])
        .unwrap();

    let mut group = c.benchmark_group("resolve");
    for size in [100, 1_000, 10_000].iter() {
        let stored: Vec<Override<Value>> = stored_contexts(&def, *size)
            .into_iter()
            .enumerate()
            .map(|(i, context)| Override {
                context,
                value: Value::Long(i as i64),
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(overrides::resolve(&stored, &query)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build_context, bench_matching, bench_resolve);
criterion_main!(benches);
