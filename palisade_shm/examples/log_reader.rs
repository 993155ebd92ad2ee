//! Follow the ring log of a running writer, out-of-process.

use palisade_shm::{CursorStep, VslCursor, VsmReader};
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir: PathBuf = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/palisade-demo".to_string())
        .into();

    let reader = VsmReader::attach(&dir)?;
    println!("attached, generation {}", reader.alloc_seq());
    for chunk in reader.chunks()? {
        println!("chunk {}/{}/{} ({} bytes)", chunk.class, chunk.typ, chunk.ident, chunk.len);
    }

    let mut cursor = VslCursor::attach(&reader)?;
    loop {
        match cursor.next() {
            Some(CursorStep::Record(rec)) => {
                println!(
                    "{:>10} {:<12} {}",
                    rec.xid,
                    rec.vsl_tag().map(|t| t.name()).unwrap_or("?"),
                    rec.text()
                );
            }
            Some(CursorStep::Overrun) => {
                eprintln!("(overrun: writer lapped this reader)");
            }
            None => {
                if reader.alloc_seq() == 0 {
                    println!("writer abandoned the arena, done");
                    return Ok(());
                }
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
        }
    }
}
