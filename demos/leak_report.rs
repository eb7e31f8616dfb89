//! Allocates a handful of objects, forgets to free one of them, and prints
//! what the allocator has to say about it.
//!
//! ```sh
//! RUST_LOG=pagetrace=trace cargo run --example leak_report -- /tmp/leaks.json
//! ```

use std::{env, ptr::NonNull};

use pagetrace::{Config, PageAlloc};

#[inline(never)]
fn make_record(alloc: &mut PageAlloc, len: usize) -> NonNull<u8> {
    let ptr = alloc.allocate(len).expect("fits in a page");
    unsafe { ptr.as_ptr().write_bytes(0x5a, len) };
    ptr
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut alloc = PageAlloc::initialize(Config::from_env())?;

    let records: Vec<_> = (1..=8).map(|i| make_record(&mut alloc, i * 40)).collect();
    let big = make_record(&mut alloc, 4000);

    if let Err(e) = alloc.allocate(5000) {
        println!("expected failure: {e}");
    }

    for (i, ptr) in records.into_iter().enumerate() {
        // record 3 is "forgotten"
        if i != 3 {
            alloc.deallocate(ptr)?;
        }
    }
    alloc.deallocate(big)?;

    alloc.print_report()?;
    alloc.print_mem_leak()?;

    if let Some(path) = env::args().nth(1) {
        alloc.dump_mem_leak().write_to_file(&path)?;
        println!("leak dump written to {path}");
    }

    let leaked = alloc.release();
    println!("{leaked} allocation(s) leaked");
    Ok(())
}
