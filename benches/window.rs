use cascade_store::counter::Counter;
use cascade_store::context::ContextDef;
use cascade_store::types::now_millis;
use cascade_store::{CounterWindow, WindowTimeUnit, WindowWidth};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const DAY_MS: i64 = 86_400_000;

fn timestamps(count: usize) -> Vec<i64> {
    (0..count as i64)
        .map(|i| 1_600_000_000_000 + i * (DAY_MS / 3 + 17))
        .collect()
}

fn bench_window_number(c: &mut Criterion) {
    let units = [
        WindowTimeUnit::Minute,
        WindowTimeUnit::Hour,
        WindowTimeUnit::Day,
        WindowTimeUnit::Week,
        WindowTimeUnit::Month,
        WindowTimeUnit::Year,
    ];
    let points = timestamps(1_000);

    let mut group = c.benchmark_group("window_number");
    for unit in units.iter() {
        let width = WindowWidth::new(1, *unit).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(unit), unit, |b, _| {
            b.iter(|| {
                for ts in &points {
                    let n = width.window_number(*ts);
                    black_box(width.start_timestamp(n));
                }
            })
        });
    }
    group.finish();
}

fn bench_counter_increment(c: &mut Criterion) {
    let def = ContextDef::new("bench", vec![]).unwrap();
    let window = CounterWindow::new(WindowWidth::new(1, WindowTimeUnit::Hour).unwrap(), 24).unwrap();

    let mut group = c.benchmark_group("counter_increment");
    for size in [100, 1_000, 10_000].iter() {
        let points = timestamps(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let now = now_millis();
                let mut counter = Counter::new(def.root(), window, now);
                for ts in &points {
                    counter.increment(*ts, 1, now);
                }
                black_box(counter.value(now))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_window_number, bench_counter_increment);
criterion_main!(benches);
