//! A small-object allocator that carves fixed 4 KiB pages into 32-byte
//! blocks, tracks them with a per-page bitmap, and remembers the call site of
//! every live allocation so leaks can be reported at shutdown.
//!
//! ```no_run
//! use pagetrace::{Config, PageAlloc};
//!
//! let mut alloc = PageAlloc::initialize(Config::default()).unwrap();
//! let ptr = alloc.allocate(24).unwrap();
//! alloc.deallocate(ptr).unwrap();
//! print!("{}", alloc.report());
//! print!("{}", alloc.dump_mem_leak());
//! ```

pub mod alloc;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub mod arch;
pub mod config;
pub mod os;
pub mod report;
pub mod serialize;
pub mod stack;
pub mod util;

pub use alloc::{shared::SharedPageAlloc, tracing::PageAlloc, Error};
pub use config::Config;
