//! The allocator proper: pages of fixed-size blocks, a size header in front
//! of every allocation, and a registry remembering who asked for what.
//!
//! An allocation of `size` bytes takes `ceil((size + HEADER_SIZE) /
//! BLOCK_SIZE)` consecutive blocks from the first page (oldest first) that
//! has a long enough free run. If none does, a new page is reserved and the
//! run starts at its first block. Pages are never given back before the
//! allocator is dropped.
//!
//! [`PageAlloc`] is single-threaded (`&mut self` everywhere). Use
//! [`SharedPageAlloc`](super::shared::SharedPageAlloc) to share one between
//! threads.

use std::{
    io::{self, Write},
    ptr::NonNull,
};

use log::{debug, error, trace, warn};

use crate::{
    config::Config,
    os::mem::{Mmap, VirtualMemory},
    report::{LeakDump, MemoryReport},
    stack::{
        symbol::{DefaultResolver, SymbolResolver},
        CallFrames, StackCapture,
    },
    util::hint::cold,
};

use super::{
    block::{blocks_for, BlockHandle, HEADER_SIZE},
    chain::PageChain,
    meta::{Chunk, ChunkRegistry},
    page::PAGE_SIZE,
    Error,
};

/// Largest request that fits in one page next to its header
pub const MAX_ALLOC_SIZE: usize = PAGE_SIZE - HEADER_SIZE;

pub struct PageAlloc<V = Mmap>
where
    V: VirtualMemory,
{
    chain: PageChain<V>,
    registry: ChunkRegistry,
    capture: Box<dyn StackCapture + Send>,
    config: Config,
}

impl PageAlloc<Mmap> {
    /// Build an allocator on `mmap()` pages, reserving the first page(s)
    /// right away.
    pub fn initialize(config: Config) -> Result<Self, Error> {
        let capture = config.stack_capture();
        Self::with_parts(Mmap, capture, config)
    }
}

impl<V> PageAlloc<V>
where
    V: VirtualMemory,
{
    /// Build an allocator from explicit collaborators.
    pub fn with_parts(
        vm: V,
        capture: Box<dyn StackCapture + Send>,
        config: Config,
    ) -> Result<Self, Error> {
        let mut chain = PageChain::new(vm);
        for _ in 0..config.initial_pages.max(1) {
            chain.allocate_new_page().map_err(|e| {
                error!("initialize(): {e}");
                e
            })?;
        }
        debug!("initialized with {} page(s), {:?}", chain.len(), config);
        Ok(Self {
            chain,
            registry: ChunkRegistry::new(),
            capture,
            config,
        })
    }

    /// Allocate `size` bytes. The result is 4-byte aligned and stays valid
    /// until it is passed to [`PageAlloc::deallocate()`] or the allocator is
    /// dropped.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        if size > MAX_ALLOC_SIZE {
            return cold(|| {
                error!("allocate({size}): size is larger than one page");
                Err(Error::Oversize {
                    size,
                    capacity: MAX_ALLOC_SIZE,
                })
            });
        }
        let needed = blocks_for(size);

        let base = match self.chain.claim_run(needed) {
            Some((page, start)) => page.block_address(start),
            None => {
                let page = self.chain.allocate_new_page().map_err(|e| {
                    error!("allocate({size}): {e}");
                    e
                })?;
                page.mark_run(0, needed);
                page.block_address(0)
            }
        };

        // SAFETY: `base` starts a run of `needed` blocks we claimed just now.
        // `size` fits in a page, so it fits in a `u32`.
        let handle = unsafe { BlockHandle::init(base, size as u32) };

        let mut frames = CallFrames::new();
        self.capture.capture(&mut frames);
        frames.truncate_innermost(self.config.stack_depth);

        let ptr = handle.user_ptr();
        self.registry
            .insert(Chunk::new(ptr.as_ptr() as usize, size, frames));
        trace!("allocate({size}) -> {ptr:p} [{needed} blocks]");
        Ok(ptr)
    }

    /// Give back an allocation. Pointers that are not live allocations of
    /// this allocator are refused without touching anything.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) -> Result<(), Error> {
        let address = ptr.as_ptr() as usize;
        let Some(recorded) = self.registry.get(address).map(|chunk| chunk.size) else {
            return cold(|| {
                warn!("deallocate({ptr:p}): not a live allocation");
                Err(Error::InvalidFree { address })
            });
        };
        let Some(page) = self.chain.owning_page_mut(address - HEADER_SIZE) else {
            return cold(|| {
                error!("deallocate({ptr:p}): registered, but outside every page");
                Err(Error::InvalidFree { address })
            });
        };

        // SAFETY: the registry only holds pointers made by
        // `BlockHandle::user_ptr()`, and this one's run is still claimed
        let handle = unsafe { BlockHandle::from_user_ptr(ptr) };
        if handle.size() != recorded {
            return cold(|| {
                error!(
                    "deallocate({ptr:p}): header says {}, registry says {recorded}",
                    handle.size()
                );
                Err(Error::CorruptHeader {
                    address,
                    recorded,
                    header: handle.size(),
                })
            });
        }

        let start = page.block_index(handle.base().as_ptr() as usize);
        page.release_run(start, handle.blocks());
        self.registry.remove(address);
        trace!("deallocate({ptr:p}) [{} blocks]", handle.blocks());
        Ok(())
    }

    /// Free-block count of every page, oldest page first
    pub fn report(&self) -> MemoryReport {
        MemoryReport::from_pages(self.chain.iter())
    }

    /// Everything still allocated, with call sites resolved from debug info
    /// (falling back to `dladdr()` for stripped binaries)
    pub fn dump_mem_leak(&self) -> LeakDump {
        self.dump_mem_leak_with(DefaultResolver::default())
    }

    /// Everything still allocated, with call sites resolved by `resolver`
    pub fn dump_mem_leak_with<R>(&self, resolver: R) -> LeakDump
    where
        R: SymbolResolver,
    {
        LeakDump::collect(self.registry.sorted(), resolver)
    }

    /// Write [`PageAlloc::report()`] to stdout
    pub fn print_report(&self) -> io::Result<()> {
        write!(io::stdout().lock(), "{}", self.report())
    }

    /// Write [`PageAlloc::dump_mem_leak()`] to stdout
    pub fn print_mem_leak(&self) -> io::Result<()> {
        write!(io::stdout().lock(), "{}", self.dump_mem_leak())
    }

    /// Tear down, returning every page to the OS. Returns the number of
    /// allocations that were never freed.
    pub fn release(mut self) -> usize {
        let leaked = self.registry.len();
        if leaked > 0 {
            warn!("releasing with {leaked} live allocation(s)");
        }
        self.chain.release_all();
        leaked
    }

    pub fn chain(&self) -> &PageChain<V> {
        &self.chain
    }

    pub fn registry(&self) -> &ChunkRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn page_count(&self) -> usize {
        self.chain.len()
    }
}
