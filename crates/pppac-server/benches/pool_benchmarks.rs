use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pppac_server::pool::{AddressRange, PoolSet};
use pppac_server::radix::{Ipv4RouteTable, Prefix, RouteRecord};
use pppac_server::registry::SessionRegistry;
use pppac_server::session::{AuthMethod, SessionId, TunnelMeta};
use std::net::Ipv4Addr;

fn meta() -> TunnelMeta {
    TunnelMeta {
        protocol: "pppoe".to_string(),
        peer: "02:00:00:00:00:01".to_string(),
        requested_ip: None,
        auth: AuthMethod::None,
    }
}

fn populated_table(prefixes: usize) -> Ipv4RouteTable {
    let mut table = Ipv4RouteTable::new();
    for i in 0..prefixes {
        let base = Ipv4Addr::new(10, (i >> 8) as u8, (i & 0xff) as u8, 0);
        table
            .insert_pool(
                Prefix::new(u32::from(base), 24),
                RouteRecord::Pool {
                    pool: "bench".to_string(),
                },
            )
            .expect("non-overlapping /24s");
    }
    table
}

fn bench_radix_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("radix_lookup_longest");
    for prefixes in [16, 256, 4096].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(prefixes),
            prefixes,
            |b, &prefixes| {
                let table = populated_table(prefixes);
                let addr = Ipv4Addr::new(10, 0, (prefixes / 2 & 0xff) as u8, 7);
                b.iter(|| table.lookup_longest(black_box(addr)));
            },
        );
    }
    group.finish();
}

fn bench_shadow_restore(c: &mut Criterion) {
    c.bench_function("radix_shadow_restore", |b| {
        let mut table = populated_table(256);
        let key = Prefix::host(Ipv4Addr::new(10, 0, 8, 9));
        b.iter(|| {
            table.shadow_session(key, SessionId(1)).expect("free key");
            table.unshadow_session(key, SessionId(1)).expect("present");
        });
    });
}

fn bench_allocate_release_cycle(c: &mut Criterion) {
    c.bench_function("pool_allocate_release_cycle", |b| {
        let mut set = PoolSet::new();
        set.add_pool(
            "bench",
            vec![],
            AddressRange::parse_list("10.64.0.0/20").expect("valid range"),
        )
        .expect("pool builds");
        let mut registry = SessionRegistry::new();
        let id = registry.create("bench", meta());

        b.iter(|| {
            let addr = set
                .allocate_dynamic("bench", &mut registry)
                .expect("pool has room");
            set.assign(id, addr, 32).expect("address free");
            let session = registry.get_mut(id).expect("session exists");
            session.framed_ip = Some(addr);
            session.framed_prefix = 32;
            session.pool = Some("bench".to_string());
            session.dynamic_lease = true;
            set.release(registry.get_mut(id).expect("session exists"));
        });
    });
}

fn bench_classify(c: &mut Criterion) {
    c.bench_function("pool_classify", |b| {
        let mut set = PoolSet::new();
        set.add_pool(
            "a",
            AddressRange::parse_list("10.0.0.0/24").expect("valid"),
            AddressRange::parse_list("10.0.1.0/24").expect("valid"),
        )
        .expect("pool builds");
        set.add_pool(
            "b",
            AddressRange::parse_list("172.16.0.0/16").expect("valid"),
            vec![],
        )
        .expect("pool builds");
        b.iter(|| {
            black_box(set.classify("a", black_box(Ipv4Addr::new(10, 0, 1, 100)), 32));
            black_box(set.classify("a", black_box(Ipv4Addr::new(172, 16, 5, 5)), 32));
            black_box(set.classify("a", black_box(Ipv4Addr::new(192, 0, 2, 1)), 32));
        });
    });
}

criterion_group!(
    benches,
    bench_radix_lookup,
    bench_shadow_restore,
    bench_allocate_release_cycle,
    bench_classify
);
criterion_main!(benches);
