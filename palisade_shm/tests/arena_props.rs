//! Property tests for the arena allocator.

use palisade_shm::{Arena, VsmReader};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize), // index into live allocations, modulo len
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (16usize..4096).prop_map(Op::Alloc),
        (0usize..16).prop_map(Op::Free),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn arena_stays_consistent(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let dir = tempfile::tempdir().unwrap();
        // Zero cooling so freed space becomes reusable within the test.
        let arena = Arena::create(dir.path(), 256 * 1024, 0.0).unwrap();
        let reader = VsmReader::attach(dir.path()).unwrap();

        let mut live = Vec::new();
        let mut n = 0u32;
        for op in ops {
            match op {
                Op::Alloc(size) => {
                    let ident = format!("a{n}");
                    n += 1;
                    let a = arena.alloc(size, "Test", "prop", &ident).unwrap();
                    // Payload is zeroed and writable.
                    let bytes = unsafe { a.bytes_mut() };
                    prop_assert!(bytes.iter().all(|&b| b == 0));
                    bytes[0] = 0xEE;
                    live.push(a);
                }
                Op::Free(i) => {
                    if !live.is_empty() {
                        let a = live.remove(i % live.len());
                        arena.free(&a);
                    }
                }
            }

            // The chunk walk terminates and visits exactly the live
            // arena-backed allocations.
            let chunks = reader.chunks().unwrap();
            let arena_live = live.iter().filter(|a| !a.is_bogus()).count();
            prop_assert_eq!(chunks.len(), arena_live);

            // No two live payloads overlap.
            let mut ranges: Vec<(usize, usize)> = live
                .iter()
                .filter(|a| !a.is_bogus())
                .map(|a| (a.offset(), a.offset() + a.len()))
                .collect();
            ranges.sort();
            for w in ranges.windows(2) {
                prop_assert!(w[0].1 <= w[1].0, "overlap: {:?}", w);
            }
        }
    }
}
