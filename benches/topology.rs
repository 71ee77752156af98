use clusterguard::cache::{ExpiringCache, SlidingExpirationCache};
use clusterguard::connection::Row;
use clusterguard::host::HostInfo;
use clusterguard::topology::{parse_topology, HostFilter, WRITER_SESSION_ID};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

/// Discovery rows for a cluster with one writer and `readers` readers
fn discovery_rows(readers: usize) -> Vec<Row> {
    let mut rows = vec![vec![
        Some("writer".to_string()),
        Some(WRITER_SESSION_ID.to_string()),
        Some("2024-01-01 00:00:00".to_string()),
        Some("0".to_string()),
    ]];
    for i in 0..readers {
        rows.push(vec![
            Some(format!("reader-{}", i)),
            Some(format!("session-{}", i)),
            Some("2024-01-01 00:00:00".to_string()),
            Some("12.5".to_string()),
        ]);
    }
    rows
}

fn bench_parse_topology(c: &mut Criterion) {
    let template = HostInfo::new("?.xyz.us-east-2.rds.amazonaws.com", 3306);
    let mut group = c.benchmark_group("parse_topology");

    for readers in [1, 15, 100].iter() {
        let rows = discovery_rows(*readers);
        group.bench_with_input(BenchmarkId::new("rows", readers), &rows, |b, rows| {
            b.iter(|| black_box(parse_topology(black_box(rows), &template)));
        });
    }

    group.finish();
}

fn bench_host_filter(c: &mut Criterion) {
    let template = HostInfo::new("?.xyz.us-east-2.rds.amazonaws.com", 3306);
    let topology = parse_topology(&discovery_rows(100), &template);
    let allow = HostFilter::allow((0..50).map(|i| format!("reader-{}", i)));
    let block = HostFilter::block((0..10).map(|i| format!("reader-{}", i)));

    let mut group = c.benchmark_group("host_filter");
    group.bench_function("allow_list", |b| {
        b.iter(|| black_box(topology.filtered(|h| allow.accepts(h))));
    });
    group.bench_function("block_list", |b| {
        b.iter(|| black_box(topology.filtered(|h| block.accepts(h))));
    });
    group.finish();
}

fn bench_caches(c: &mut Criterion) {
    let ttl = Duration::from_secs(300);
    let mut group = c.benchmark_group("cache");

    let expiring: ExpiringCache<String, u64> = ExpiringCache::new();
    for i in 0..1000u64 {
        expiring.put(format!("cluster-{}", i), i, ttl);
    }
    group.bench_function("expiring_get", |b| {
        let key = "cluster-500".to_string();
        b.iter(|| black_box(expiring.get(&key)));
    });
    group.bench_function("expiring_put", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 1000;
            black_box(expiring.put(format!("cluster-{}", i), i, ttl))
        });
    });

    let sliding: SlidingExpirationCache<String, u64> = SlidingExpirationCache::new();
    for i in 0..1000u64 {
        sliding.get_or_compute(format!("monitor-{}", i), |_| i, ttl);
    }
    group.bench_function("sliding_renew", |b| {
        let key = "monitor-500".to_string();
        b.iter(|| black_box(sliding.get(&key, ttl)));
    });

    group.finish();
}

criterion_group!(benches, bench_parse_topology, bench_host_filter, bench_caches);
criterion_main!(benches);
