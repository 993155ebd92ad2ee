//! Ring-log write throughput.

use criterion::{Criterion, criterion_group, criterion_main};
use palisade::params::Params;
use palisade_shm::{Arena, MainStats, StatRef, Vsl, VslTag};
use std::hint::black_box;

fn bench_vsl(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let arena = Arena::create(dir.path(), 16 * 1024 * 1024, 60.0).unwrap();
    let stats: StatRef<MainStats> = StatRef::new_in(&arena, "main", "").unwrap();
    let vsl = Vsl::new(&arena, stats, &Params::default()).unwrap();

    let payload = [b'x'; 64];

    c.bench_function("vsl_unbuffered_64b", |b| {
        let mut xid = 0u64;
        b.iter(|| {
            xid += 1;
            vsl.log(VslTag::Debug, black_box(xid), black_box(&payload));
        })
    });

    c.bench_function("vsl_buffered_64b", |b| {
        let mut buf = vsl.buffer();
        buf.begin(1);
        let mut i = 0u32;
        b.iter(|| {
            buf.log(VslTag::Debug, black_box(&payload));
            i += 1;
            if i % 32 == 0 {
                buf.flush();
            }
        })
    });
}

criterion_group!(benches, bench_vsl);
criterion_main!(benches);
