use std::{marker::PhantomData, ptr::NonNull};

use log::debug;

use crate::os::mem::{VirtualMemory, VmError};

use super::page::{Page, PageTail, PAGE_RESERVATION};

/// Owns every [`Page`]. The head is the newest page; `next_page` links walk
/// towards older pages and `prev_page` links walk back towards the head.
pub struct PageChain<V>
where
    V: VirtualMemory,
{
    vm: V,
    head: Option<NonNull<Page>>,
    oldest: Option<NonNull<Page>>,
    len: usize,
}

// SAFETY: The chain exclusively owns its pages; nothing else holds a pointer
// into them that could be used from another thread.
unsafe impl<V> Send for PageChain<V> where V: VirtualMemory + Send {}

impl<V> PageChain<V>
where
    V: VirtualMemory,
{
    pub const fn new(vm: V) -> Self {
        Self {
            vm,
            head: None,
            oldest: None,
            len: 0,
        }
    }

    /// Number of pages
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn vm(&self) -> &V {
        &self.vm
    }

    /// Reserve a fresh page and make it the new head.
    pub fn allocate_new_page(&mut self) -> Result<&mut Page, VmError> {
        let page = self.vm.reserve(PAGE_RESERVATION)?.cast::<Page>();
        // SAFETY:
        // - The reservation is at least `PAGE_RESERVATION` bytes, read/write
        //   and OS-page aligned, so it is valid for a `PageTail` write at the
        //   tail offset
        // - The arena bytes need no initialization beyond what the OS gives
        unsafe {
            std::ptr::addr_of_mut!((*page.as_ptr()).tail).write(PageTail {
                next_page: self.head,
                ..PageTail::empty()
            });
        }
        match self.head {
            // SAFETY: `head` is a live page owned by us
            Some(head) => unsafe { (*head.as_ptr()).tail.prev_page = Some(page) },
            None => self.oldest = Some(page),
        }
        self.head = Some(page);
        self.len += 1;
        debug!("page #{} reserved at {:p}", self.len, page);
        // SAFETY: the page is initialized and uniquely borrowed through
        // `&mut self`
        Ok(unsafe { &mut *page.as_ptr() })
    }

    /// Pages from oldest to newest
    pub fn iter(&self) -> Pages<'_> {
        Pages {
            cursor: self.oldest,
            _chain: PhantomData,
        }
    }

    /// Pages from newest to oldest
    pub fn iter_newest_first(&self) -> PagesNewestFirst<'_> {
        PagesNewestFirst {
            cursor: self.head,
            _chain: PhantomData,
        }
    }

    /// First-fit over the whole chain, oldest page first. Returns the page
    /// and the index of the first claimed block.
    pub fn claim_run(&mut self, needed: usize) -> Option<(&mut Page, usize)> {
        let mut cursor = self.oldest;
        while let Some(page) = cursor {
            // SAFETY: every linked page is live and owned by us, and we hold
            // `&mut self` so nobody else is looking at it
            let page = unsafe { &mut *page.as_ptr() };
            cursor = page.tail.prev_page;
            if let Some(start) = page.claim_run(needed) {
                return Some((page, start));
            }
        }
        None
    }

    /// Find the page whose arena contains `addr`
    pub fn owning_page_mut(&mut self, addr: usize) -> Option<&mut Page> {
        let mut cursor = self.head;
        while let Some(page) = cursor {
            // SAFETY: as in `claim_run()`
            let page = unsafe { &mut *page.as_ptr() };
            if page.contains(addr) {
                return Some(page);
            }
            cursor = page.tail.next_page;
        }
        None
    }

    /// Give every page back to the OS. Safe to call more than once; the
    /// second call finds an empty chain.
    pub fn release_all(&mut self) {
        let mut cursor = self.head.take();
        while let Some(page) = cursor {
            // SAFETY: live page, read the link before it goes away
            cursor = unsafe { (*page.as_ptr()).tail.next_page };
            // SAFETY: reserved by `allocate_new_page()` with exactly this
            // size, and unlinked above so nothing refers to it any more
            unsafe { self.vm.release(page.cast(), PAGE_RESERVATION) };
        }
        debug!("released {} pages", self.len);
        self.oldest = None;
        self.len = 0;
    }
}

impl<V> Drop for PageChain<V>
where
    V: VirtualMemory,
{
    fn drop(&mut self) {
        self.release_all();
    }
}

pub struct Pages<'a> {
    cursor: Option<NonNull<Page>>,
    _chain: PhantomData<&'a Page>,
}

impl<'a> Iterator for Pages<'a> {
    type Item = &'a Page;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: the chain outlives `'a` and cannot be mutated while we
        // borrow it
        let page = unsafe { &*self.cursor?.as_ptr() };
        self.cursor = page.tail.prev_page;
        Some(page)
    }
}

pub struct PagesNewestFirst<'a> {
    cursor: Option<NonNull<Page>>,
    _chain: PhantomData<&'a Page>,
}

impl<'a> Iterator for PagesNewestFirst<'a> {
    type Item = &'a Page;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: as for `Pages`
        let page = unsafe { &*self.cursor?.as_ptr() };
        self.cursor = page.tail.next_page;
        Some(page)
    }
}
