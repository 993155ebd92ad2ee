//! Write a stream of records into an arena until interrupted.
//!
//! Run together with `log_reader`:
//! ```bash
//! cargo run --example log_writer -- /tmp/palisade-demo
//! cargo run --example log_reader -- /tmp/palisade-demo
//! ```

use palisade::params::Params;
use palisade_shm::{Arena, MainStats, StatRef, Vsl, VslTag};
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir: PathBuf = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/palisade-demo".to_string())
        .into();

    let arena = Arena::create(&dir, 4 * 1024 * 1024, 60.0)?;
    let stats: StatRef<MainStats> = StatRef::new_in(&arena, "main", "")?;
    let vsl = Vsl::new(&arena, stats.clone(), &Params::default())?;
    println!("writing to {}", arena.path().display());

    let mut buf = vsl.buffer();
    for xid in 1000u64.. {
        buf.begin(xid);
        buf.log(VslTag::Begin, b"req demo");
        buf.log(VslTag::Url, format!("/object/{xid}").as_bytes());
        buf.log(VslTag::Timestamp, format!("{}", palisade::vtim::real_now()).as_bytes());
        buf.log(VslTag::End, b"");
        buf.end();
        arena.bump_age();
        std::thread::sleep(std::time::Duration::from_millis(100));
        if xid % 50 == 0 {
            println!(
                "{} writes, {} records",
                stats.shm_writes.load(std::sync::atomic::Ordering::Relaxed),
                stats.shm_records.load(std::sync::atomic::Ordering::Relaxed),
            );
        }
    }
    Ok(())
}
