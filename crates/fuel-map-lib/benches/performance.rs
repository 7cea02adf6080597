//! Performance benchmarks for fuel-map-lib
//!
//! Run with: cargo bench --package fuel-map-lib

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use fuel_map_lib::{
    Bounds, ChangeEvent, Config, Coordinates, Prices, Reconciler, Snapshot, SpatialIndex, Station,
    StationFields, StationId,
};
use std::hint::black_box;

/// Generate stations scattered around a handful of European cities
fn generate_stations(count: usize) -> Vec<Station> {
    let cities = [
        (48.14, 11.58),
        (52.52, 13.40),
        (40.42, -3.70),
        (45.46, 9.19),
        (48.86, 2.35),
    ];
    let mut state = 0x2545_f491_4f6c_dd1du64;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state >> 11) as f64 / (1u64 << 53) as f64
    };

    (0..count)
        .map(|i| {
            let (lat, lon) = cities[i % cities.len()];
            Station::new(
                StationId::new(format!("st-{i}")).unwrap(),
                StationFields {
                    lat: Some(lat + (next() - 0.5) * 3.0),
                    lon: Some(lon + (next() - 0.5) * 3.0),
                    brand: Some("Generic".to_string()),
                    prices: None,
                },
                1,
            )
        })
        .collect()
}

fn positions(stations: &[Station]) -> Vec<(StationId, Coordinates)> {
    stations
        .iter()
        .filter_map(|s| Some((s.id.clone(), s.position()?)))
        .collect()
}

// ============================================================================
// Core Benchmarks - Key performance indicators
// ============================================================================

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group.sample_size(10);

    for count in [10_000, 100_000] {
        let stations = positions(&generate_stations(count));
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &stations, |b, s| {
            b.iter(|| SpatialIndex::build(&Config::default(), black_box(s.clone())).unwrap())
        });
    }
    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");
    let index =
        SpatialIndex::build(&Config::default(), positions(&generate_stations(100_000))).unwrap();

    let viewports = [
        ("world_z3", Bounds::world(), 3.0),
        ("country_z7", Bounds::new(5.0, 45.0, 15.0, 55.0), 7.0),
        ("city_z13", Bounds::new(11.4, 48.0, 11.8, 48.3), 13.0),
        ("street_z18", Bounds::new(11.57, 48.13, 11.59, 48.15), 18.0),
    ];
    for (name, bounds, zoom) in viewports {
        group.bench_function(name, |b| b.iter(|| index.query(black_box(&bounds), zoom)));
    }
    group.finish();
}

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile");
    let stations = generate_stations(100_000);
    let snapshot = Snapshot::build(&Config::default(), stations).unwrap();

    let mut prices = Prices::new();
    prices.insert("e5".to_string(), Some(1.799));
    let price_batch: Vec<ChangeEvent> = (0..1_000)
        .map(|i| ChangeEvent::Updated {
            id: StationId::new(format!("st-{i}")).unwrap(),
            version: None,
            fields: StationFields {
                prices: Some(prices.clone()),
                ..Default::default()
            },
        })
        .collect();
    let move_batch: Vec<ChangeEvent> = (0..1_000)
        .map(|i| ChangeEvent::Updated {
            id: StationId::new(format!("st-{i}")).unwrap(),
            version: None,
            fields: StationFields {
                lat: Some(50.0 + i as f64 * 0.001),
                lon: Some(8.0),
                ..Default::default()
            },
        })
        .collect();

    group.throughput(Throughput::Elements(1_000));
    group.bench_function("attribute_only_batch", |b| {
        b.iter_batched(
            || (Reconciler::new(snapshot.clone()), price_batch.clone()),
            |(mut reconciler, batch)| reconciler.apply_batch(batch),
            criterion::BatchSize::LargeInput,
        )
    });
    group.bench_function("structural_batch", |b| {
        b.iter_batched(
            || (Reconciler::new(snapshot.clone()), move_batch.clone()),
            |(mut reconciler, batch)| reconciler.apply_batch(batch),
            criterion::BatchSize::LargeInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_build, bench_query, bench_reconcile);
criterion_main!(benches);
