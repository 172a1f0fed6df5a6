//! Credential lookup benchmarks
//!
//! Measures the paths taken on every outgoing connection:
//! - client alias resolution, cold scan and cached hit
//! - certificate thumbprints used by the diagnostics
//! - store parsing for the keytool fixtures
//!
//! Run with: cargo bench --bench resolver

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use credstore::security::{
    Certificate, ClientAliasResolver, CredentialStore, Destination, StoreKind,
};

const EXAMPLE_CERT: &str = include_str!("../tests/fixtures/example.pem");
const TRUST_JKS: &[u8] = include_bytes!("../tests/fixtures/trust.jks");
const TRUST_P12: &[u8] = include_bytes!("../tests/fixtures/trust.p12");

fn aliases(count: usize) -> Vec<String> {
    let mut aliases = vec!["authz_rpc".to_string()];
    aliases.extend((0..count).map(|i| format!("authz_rpc_host{}", i)));
    aliases
}

// ========== Alias Resolution ==========

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");

    for count in [4usize, 64, 512] {
        let aliases = aliases(count);
        let destination = Destination::new(format!("host{}.internal", count - 1), 443);
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("scan", count), &aliases, |b, aliases| {
            let resolver = ClientAliasResolver::new("authz_rpc");
            b.iter(|| {
                resolver.invalidate_all();
                black_box(resolver.resolve(black_box(&destination), aliases));
            });
        });

        group.bench_with_input(BenchmarkId::new("cached", count), &aliases, |b, aliases| {
            let resolver = ClientAliasResolver::new("authz_rpc");
            resolver.resolve(&destination, aliases);
            b.iter(|| {
                black_box(resolver.resolve(black_box(&destination), aliases));
            });
        });
    }

    group.finish();
}

// ========== Certificates ==========

fn bench_thumbprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("thumbprint");
    let cert = Certificate::from_pem(EXAMPLE_CERT).unwrap();

    for algorithm in ["SHA-1", "SHA-256"] {
        group.bench_function(algorithm, |b| {
            b.iter(|| black_box(cert.thumbprint(black_box(algorithm)).unwrap()));
        });
    }

    group.finish();
}

// ========== Store Parsing ==========

fn bench_store_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_parse");

    for (name, bytes) in [("jks", TRUST_JKS), ("pkcs12", TRUST_P12)] {
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| {
                let store =
                    CredentialStore::parse(StoreKind::Trust, black_box(bytes), "trustpass", None)
                        .unwrap();
                black_box(store.len());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_resolve, bench_thumbprint, bench_store_parse);
criterion_main!(benches);
