use std::{
    ptr::NonNull,
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    config::Config,
    os::mem::{Mmap, VirtualMemory},
    report::{LeakDump, MemoryReport},
    stack::symbol::SymbolResolver,
};

use super::{tracing::PageAlloc, Error};

/// A [`PageAlloc`] behind one lock. The lock covers the page chain and the
/// registry together and is held for the whole of every call, so the two
/// never disagree as seen from another thread.
pub struct SharedPageAlloc<V = Mmap>
where
    V: VirtualMemory,
{
    inner: Mutex<PageAlloc<V>>,
}

impl SharedPageAlloc<Mmap> {
    pub fn initialize(config: Config) -> Result<Self, Error> {
        PageAlloc::initialize(config).map(Self::new)
    }
}

impl<V> SharedPageAlloc<V>
where
    V: VirtualMemory,
{
    pub fn new(alloc: PageAlloc<V>) -> Self {
        Self {
            inner: Mutex::new(alloc),
        }
    }

    /// Lock for a batch of operations. A panic while the lock was held
    /// leaves the bookkeeping as it was at the last completed call, so a
    /// poisoned lock is still usable.
    pub fn lock(&self) -> MutexGuard<'_, PageAlloc<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, Error> {
        self.lock().allocate(size)
    }

    pub fn deallocate(&self, ptr: NonNull<u8>) -> Result<(), Error> {
        self.lock().deallocate(ptr)
    }

    pub fn report(&self) -> MemoryReport {
        self.lock().report()
    }

    pub fn dump_mem_leak(&self) -> LeakDump {
        self.lock().dump_mem_leak()
    }

    pub fn dump_mem_leak_with<R>(&self, resolver: R) -> LeakDump
    where
        R: SymbolResolver,
    {
        self.lock().dump_mem_leak_with(resolver)
    }

    pub fn into_inner(self) -> PageAlloc<V> {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn threads_share_one_allocator() {
        let alloc = Arc::new(SharedPageAlloc::initialize(Config::default()).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    for i in 0..200 {
                        let size = (t * 13 + i) % 200;
                        let ptr = alloc.allocate(size).unwrap();
                        unsafe { ptr.as_ptr().write_bytes(t as u8, size) };
                        mine.push((ptr.as_ptr() as usize, size));
                    }
                    for (addr, size) in mine {
                        let ptr = NonNull::new(addr as *mut u8).unwrap();
                        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
                        assert!(bytes.iter().all(|&b| b == t as u8));
                        alloc.deallocate(ptr).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let alloc = Arc::try_unwrap(alloc).ok().unwrap();
        assert!(alloc.dump_mem_leak().is_empty());
        let alloc = alloc.into_inner();
        assert!(alloc.chain().iter().all(|page| page.is_consistent()));
        assert_eq!(alloc.release(), 0);
    }
}
