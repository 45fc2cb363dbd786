//! Slab allocator context
//!
//! This module ties the pieces together: the bootstrap that lets the
//! allocator host its own metadata in its own caches, cache creation, the
//! grow/alloc/free/reap paths, and a process-global instance backed by the
//! heap page store.
//!
//! The allocator is single-threaded by design; the global instance is
//! guarded by a spinlock only so the static is sound to share.

use core::mem;
use core::ptr::null_mut;

use bitflags::bitflags;

use crate::backing::PagePool;
use crate::cache::ObjectCache;
use crate::hash::{BufHash, HashNode, HASH_BUCKETS};
use crate::slab::{
    large_alloc, large_capacity, large_free, small_alloc, small_free, small_record_offset,
    small_slab_init, Slab, SlabBufctl, SlabLayout,
};

bitflags! {
    /// Allocation behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Growth must not block: a page store refusal surfaces immediately
        /// as a null return from `alloc` instead of being retried.
        const NOSLEEP = 1 << 0;
    }
}

impl AllocFlags {
    /// Blocking allocation: growth retries the page store until it
    /// delivers.
    pub const SLEEP: AllocFlags = AllocFlags::empty();
}

/// Rounds a requested object size up so consecutive buffers respect
/// `align`, clamping to one machine word first so a free buffer can hold
/// its freelist link.
pub(crate) fn padded_object_size(size: usize, align: usize) -> usize {
    let size = size.max(mem::size_of::<usize>());
    if align > 1 {
        (size + align - 1) & !(align - 1)
    } else {
        size
    }
}

/// An object-caching slab allocator over a backing page store.
///
/// All five internal metadata caches (cache records, slab records, bufctls,
/// hash tables, hash nodes) live in the allocator itself; the first `create`
/// bootstraps them out of a single page. Dropping the allocator returns
/// every internal page to the store; the caller must have destroyed its own
/// caches first.
pub struct SlabAllocator<P: PagePool> {
    backing: P,
    page_size: usize,
    page_shift: u32,
    /// Cache of `ObjectCache` records; the bootstrap slab holds this cache's
    /// own record in its first buffer slot.
    cache_cache: *mut ObjectCache,
    /// Cache of off-page `Slab` records (large layout).
    slab_cache: *mut ObjectCache,
    /// Cache of `SlabBufctl` records (large layout).
    bufctl_cache: *mut ObjectCache,
    /// Cache of `BufHash` tables.
    hash_cache: *mut ObjectCache,
    /// Cache of hash chain nodes.
    node_cache: *mut ObjectCache,
    bootstrapped: bool,
    /// Cleared while the internal caches are being created, so `create`
    /// does not reach for a hash cache that does not exist yet.
    hash_ready: bool,
}

unsafe impl<P: PagePool + Send> Send for SlabAllocator<P> {}

impl<P: PagePool> SlabAllocator<P> {
    /// Creates an allocator over a page store. No memory is touched until
    /// the first `create` call bootstraps the internal caches.
    pub const fn new(backing: P) -> Self {
        Self {
            backing,
            page_size: 0,
            page_shift: 0,
            cache_cache: null_mut(),
            slab_cache: null_mut(),
            bufctl_cache: null_mut(),
            hash_cache: null_mut(),
            node_cache: null_mut(),
            bootstrapped: false,
            hash_ready: false,
        }
    }

    /// The backing store's page size, cached at bootstrap (0 before the
    /// first `create`).
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Creates a cache for objects of `size` bytes aligned to `align`
    /// (0 means no alignment requirement; otherwise a power of two no
    /// larger than the page size). The cache eagerly grows its first slab
    /// so the first allocation needs no page traffic.
    pub fn create(&mut self, name: &'static str, size: usize, align: usize) -> *mut ObjectCache {
        assert!(size > 0, "object size must be positive");
        assert!(
            align == 0 || align.is_power_of_two(),
            "alignment must be zero or a power of two"
        );
        if !self.bootstrapped {
            self.bootstrap();
        }
        assert!(align <= self.page_size, "alignment exceeds the page size");

        let object_size = padded_object_size(size, align);
        assert!(
            object_size <= self.page_size,
            "object does not fit in one page"
        );
        let layout = if object_size < self.page_size / 8 {
            SlabLayout::Small
        } else {
            SlabLayout::Large
        };

        unsafe {
            let cache = self.alloc(self.cache_cache, AllocFlags::SLEEP) as *mut ObjectCache;
            if cache.is_null() {
                return null_mut();
            }
            cache.write(ObjectCache {
                name,
                object_size,
                align,
                layout,
                slab_count: 0,
                slabs: null_mut(),
                freelist_head: null_mut(),
                hash: null_mut(),
            });
            if layout == SlabLayout::Large && self.hash_ready {
                let hash = self.alloc(self.hash_cache, AllocFlags::SLEEP) as *mut BufHash;
                if hash.is_null() {
                    self.free(self.cache_cache, cache as *mut u8);
                    return null_mut();
                }
                hash.write(BufHash::new());
                (*cache).hash = hash;
            }
            if !self.grow(cache, AllocFlags::SLEEP) {
                self.release_cache_record(cache);
                return null_mut();
            }
            #[cfg(feature = "log")]
            log::debug!(
                "created cache {} (object size {}, {:?} layout)",
                name,
                object_size,
                layout
            );
            cache
        }
    }

    /// Allocates one buffer from a cache. Returns null only when `NOSLEEP`
    /// is set and the page store refuses to grow the cache; the returned
    /// region's contents are indeterminate.
    ///
    /// # Safety
    /// - `cache` must have come from `create` on this allocator and not yet
    ///   been destroyed
    pub unsafe fn alloc(&mut self, cache: *mut ObjectCache, flags: AllocFlags) -> *mut u8 {
        unsafe {
            loop {
                let head = (*cache).freelist_head;
                if head.is_null() || (*head).is_complete() {
                    if !self.grow(cache, flags) {
                        return null_mut();
                    }
                    continue;
                }
                let buf = match (*cache).layout {
                    SlabLayout::Small => small_alloc(head),
                    SlabLayout::Large => large_alloc(head),
                };
                if (*head).is_complete() {
                    (*cache).mark_complete(head);
                }
                return buf;
            }
        }
    }

    /// Returns a buffer to its cache. On a large-layout cache a buffer the
    /// cache does not know is logged and ignored; on a small-layout cache
    /// that protocol violation is undetectable and undefined.
    ///
    /// # Safety
    /// - `cache` must have come from `create` on this allocator and not yet
    ///   been destroyed
    /// - `buf` must have been returned by `alloc` on the same cache
    /// - `buf` must not be freed twice
    pub unsafe fn free(&mut self, cache: *mut ObjectCache, buf: *mut u8) {
        unsafe {
            let slab = match (*cache).layout {
                SlabLayout::Small => {
                    let page = self.page_base(buf);
                    let slab = page.add(small_record_offset(self.page_size)) as *mut Slab;
                    small_free(slab, buf);
                    slab
                }
                SlabLayout::Large => {
                    let ctl = (*(*cache).hash).get(buf);
                    if ctl.is_null() {
                        #[cfg(feature = "log")]
                        log::warn!("cache {}: free of unknown buffer {:p}", (*cache).name, buf);
                        return;
                    }
                    let slab = (*ctl).slab;
                    large_free(slab, ctl);
                    slab
                }
            };
            if (*slab).refcount + 1 == (*slab).size {
                // the slab was complete until this free
                (*cache).mark_partial(slab);
            }
            if (*slab).is_empty() && (*cache).slab_count > 1 {
                (*cache).mark_empty(slab);
                self.reap(cache, false);
            }
        }
    }

    /// Destroys a cache: tears down its hash, force-reaps every slab, and
    /// releases the cache record.
    ///
    /// # Safety
    /// - `cache` must have come from `create` on this allocator and not yet
    ///   been destroyed
    /// - Every buffer allocated from the cache must have been freed
    pub unsafe fn destroy(&mut self, cache: *mut ObjectCache) {
        unsafe {
            #[cfg(feature = "log")]
            log::debug!("destroying cache {}", (*cache).name);
            self.release_hash(cache);
            self.reap(cache, true);
            self.free(self.cache_cache, cache as *mut u8);
        }
    }

    /// One-time self-hosting: one page becomes a small-layout slab whose
    /// first buffer slot holds the cache-of-caches record, after which the
    /// remaining internal caches are created through the normal path.
    fn bootstrap(&mut self) {
        let page_size = self.backing.page_size();
        assert!(
            page_size.is_power_of_two(),
            "page size must be a power of two"
        );
        assert!(
            mem::size_of::<ObjectCache>() < page_size / 8,
            "page size too small to self-host cache records"
        );
        self.page_size = page_size;
        self.page_shift = page_size.trailing_zeros();

        let object_size =
            padded_object_size(mem::size_of::<ObjectCache>(), mem::align_of::<ObjectCache>());
        let page = self.page_alloc(AllocFlags::SLEEP);
        unsafe {
            // buffer 0 is reserved for the cache-of-caches record itself
            let slab = small_slab_init(page, page_size, object_size, 1);
            let cache_cache = page as *mut ObjectCache;
            cache_cache.write(ObjectCache {
                name: "object-cache-cache",
                object_size,
                align: mem::align_of::<ObjectCache>(),
                layout: SlabLayout::Small,
                slab_count: 0,
                slabs: null_mut(),
                freelist_head: null_mut(),
                hash: null_mut(),
            });
            (*cache_cache).append_slab(slab);
            self.cache_cache = cache_cache;
        }
        self.bootstrapped = true;
        self.hash_ready = false;

        self.node_cache = self.create(
            "buf-hash-node-cache",
            mem::size_of::<HashNode>(),
            mem::align_of::<HashNode>(),
        );
        self.hash_cache = self.create(
            "buf-hash-cache",
            mem::size_of::<BufHash>(),
            mem::align_of::<BufHash>(),
        );
        self.slab_cache = self.create(
            "slab-cache",
            mem::size_of::<Slab>(),
            mem::align_of::<Slab>(),
        );
        self.bufctl_cache = self.create(
            "bufctl-cache",
            mem::size_of::<SlabBufctl>(),
            mem::align_of::<SlabBufctl>(),
        );
        self.hash_ready = true;
        // Retrofit pass: attach hashes to internal caches whose layout
        // demands one. Every internal object is far below page/8, so all
        // five are small-layout and keep a null hash.
        #[cfg(feature = "log")]
        log::debug!("slab allocator bootstrapped, page size {}", page_size);
    }

    /// Adds one slab to a cache. False only when the page store refuses
    /// under `NOSLEEP`.
    fn grow(&mut self, cache: *mut ObjectCache, flags: AllocFlags) -> bool {
        let page = self.page_alloc(flags);
        if page.is_null() {
            return false;
        }
        unsafe {
            let grown = match (*cache).layout {
                SlabLayout::Small => {
                    let slab =
                        small_slab_init(page, self.page_size, (*cache).object_size, 0);
                    (*cache).append_slab(slab);
                    true
                }
                SlabLayout::Large => self.grow_large(cache, page, flags),
            };
            if grown {
                #[cfg(feature = "log")]
                log::trace!(
                    "cache {}: grew to {} slabs",
                    (*cache).name,
                    (*cache).slab_count
                );
            }
            grown
        }
    }

    /// Large-layout growth: the slab record, one bufctl per buffer, and one
    /// hash entry per buffer all come from the internal caches. A metadata
    /// refusal under `NOSLEEP` unwinds everything built so far.
    unsafe fn grow_large(&mut self, cache: *mut ObjectCache, page: *mut u8, flags: AllocFlags) -> bool {
        unsafe {
            debug_assert!(!(*cache).hash.is_null());
            let slab = self.alloc(self.slab_cache, flags) as *mut Slab;
            if slab.is_null() {
                self.backing.free_page(page);
                return false;
            }
            let count = large_capacity(self.page_size, (*cache).object_size);
            slab.write(Slab {
                start: page,
                size: count,
                refcount: 0,
                first: null_mut(),
                last: null_mut(),
                prev: null_mut(),
                next: null_mut(),
            });

            let mut tail: *mut SlabBufctl = null_mut();
            for index in 0..count {
                let ctl = self.alloc(self.bufctl_cache, flags) as *mut SlabBufctl;
                if ctl.is_null() {
                    self.unwind_large(cache, slab);
                    return false;
                }
                let node = self.alloc(self.node_cache, flags) as *mut HashNode;
                if node.is_null() {
                    self.free(self.bufctl_cache, ctl as *mut u8);
                    self.unwind_large(cache, slab);
                    return false;
                }
                let buf = page.add(index * (*cache).object_size);
                ctl.write(SlabBufctl {
                    next: null_mut(),
                    buf,
                    slab,
                });
                node.write(HashNode {
                    key: buf,
                    value: ctl,
                    next: null_mut(),
                });
                (*(*cache).hash).insert(node);
                if tail.is_null() {
                    (*slab).first = ctl as *mut u8;
                } else {
                    (*tail).next = ctl;
                }
                tail = ctl;
            }
            (*slab).last = tail as *mut u8;
            (*cache).append_slab(slab);
            true
        }
    }

    /// Releases a partially built large-layout slab: chained bufctls, their
    /// hash entries, the slab record, and the page.
    unsafe fn unwind_large(&mut self, cache: *mut ObjectCache, slab: *mut Slab) {
        unsafe {
            let page = (*slab).start;
            let mut ctl = (*slab).first as *mut SlabBufctl;
            while !ctl.is_null() {
                let next = (*ctl).next;
                let node = (*(*cache).hash).remove((*ctl).buf);
                if !node.is_null() {
                    self.free(self.node_cache, node as *mut u8);
                }
                self.free(self.bufctl_cache, ctl as *mut u8);
                ctl = next;
            }
            self.free(self.slab_cache, slab as *mut u8);
            self.backing.free_page(page);
        }
    }

    /// Reclaims the run of empty slabs at the list tail, always leaving one
    /// slab resident. Under `force` every slab goes regardless of refcount
    /// (destroy calls this after the caller promised no outstanding
    /// buffers).
    fn reap(&mut self, cache: *mut ObjectCache, force: bool) {
        unsafe {
            loop {
                let head = (*cache).slabs;
                if head.is_null() {
                    break;
                }
                let tail = (*head).prev;
                if !force && !((*tail).is_empty() && (*cache).slab_count > 1) {
                    break;
                }
                (*cache).remove_slab(tail);
                self.destroy_slab(cache, tail);
                #[cfg(feature = "log")]
                log::trace!(
                    "cache {}: reaped slab, {} remaining",
                    (*cache).name,
                    (*cache).slab_count
                );
            }
        }
    }

    /// Returns one removed slab's resources. Large layout hands bufctls and
    /// hash entries back to the internal caches first (hash maintenance is
    /// skipped once destroy has already torn the hash down); small layout
    /// discards its in-page record with the page.
    unsafe fn destroy_slab(&mut self, cache: *mut ObjectCache, slab: *mut Slab) {
        unsafe {
            let page = (*slab).start;
            if (*cache).layout == SlabLayout::Large {
                let mut ctl = (*slab).first as *mut SlabBufctl;
                while !ctl.is_null() {
                    let next = (*ctl).next;
                    if !(*cache).hash.is_null() {
                        let node = (*(*cache).hash).remove((*ctl).buf);
                        if !node.is_null() {
                            self.free(self.node_cache, node as *mut u8);
                        }
                    }
                    self.free(self.bufctl_cache, ctl as *mut u8);
                    ctl = next;
                }
                self.free(self.slab_cache, slab as *mut u8);
            }
            self.backing.free_page(page);
        }
    }

    /// Tears down a cache's hash, returning every surviving node to the
    /// node cache. Runs before the force-reap so reap must not consult the
    /// hash afterwards.
    unsafe fn release_hash(&mut self, cache: *mut ObjectCache) {
        unsafe {
            let hash = (*cache).hash;
            if hash.is_null() {
                return;
            }
            (*cache).hash = null_mut();
            for bucket in 0..HASH_BUCKETS {
                let mut node = (*hash).take_bucket(bucket);
                while !node.is_null() {
                    let next = (*node).next;
                    self.free(self.node_cache, node as *mut u8);
                    node = next;
                }
            }
            self.free(self.hash_cache, hash as *mut u8);
        }
    }

    /// Create-failure unwind: the cache record and its hash go back, any
    /// grown slab does not exist by construction.
    unsafe fn release_cache_record(&mut self, cache: *mut ObjectCache) {
        unsafe {
            self.release_hash(cache);
            self.free(self.cache_cache, cache as *mut u8);
        }
    }

    /// One page from the backing store. Sleeping requests retry until the
    /// store delivers; `NOSLEEP` makes exactly one attempt.
    fn page_alloc(&mut self, flags: AllocFlags) -> *mut u8 {
        loop {
            let page = self.backing.alloc_page();
            if !page.is_null() {
                debug_assert_eq!(page as usize & (self.page_size - 1), 0);
                return page;
            }
            if flags.contains(AllocFlags::NOSLEEP) {
                return null_mut();
            }
        }
    }

    #[inline]
    fn page_base(&self, buf: *mut u8) -> *mut u8 {
        (((buf as usize) >> self.page_shift) << self.page_shift) as *mut u8
    }
}

impl<P: PagePool> Drop for SlabAllocator<P> {
    /// Returns every internal-cache page to the backing store. Internal
    /// caches are all small-layout, so their slab records vanish with their
    /// pages; the cache-of-caches goes last because the other caches'
    /// records live inside its pages.
    fn drop(&mut self) {
        if !self.bootstrapped {
            return;
        }
        let internal = [
            self.bufctl_cache,
            self.slab_cache,
            self.hash_cache,
            self.node_cache,
            self.cache_cache,
        ];
        for cache in internal {
            if cache.is_null() {
                continue;
            }
            unsafe {
                let head = (*cache).slabs;
                if head.is_null() {
                    continue;
                }
                let mut cursor = head;
                loop {
                    // the record lives in the page: read the link first
                    let next = (*cursor).next;
                    self.backing.free_page((*cursor).start);
                    if next == head {
                        break;
                    }
                    cursor = next;
                }
            }
        }
    }
}

/// Process-global allocator over the heap page store.
#[cfg(feature = "alloc")]
static SLAB_ALLOCATOR: spin::Mutex<SlabAllocator<crate::backing::HeapPages>> =
    spin::Mutex::new(SlabAllocator::new(crate::backing::HeapPages::new()));

/// Creates a cache in the process-global allocator.
#[cfg(feature = "alloc")]
pub fn cache_create(name: &'static str, size: usize, align: usize) -> *mut ObjectCache {
    SLAB_ALLOCATOR.lock().create(name, size, align)
}

/// Allocates from a cache created by [`cache_create`].
///
/// # Safety
/// - `cache` must have come from `cache_create` and not yet been destroyed
#[cfg(feature = "alloc")]
pub unsafe fn cache_alloc(cache: *mut ObjectCache, flags: AllocFlags) -> *mut u8 {
    unsafe { SLAB_ALLOCATOR.lock().alloc(cache, flags) }
}

/// Returns a buffer to a cache created by [`cache_create`].
///
/// # Safety
/// - `cache` must have come from `cache_create` and not yet been destroyed
/// - `buf` must have been returned by `cache_alloc` on the same cache and
///   not freed twice
#[cfg(feature = "alloc")]
pub unsafe fn cache_free(cache: *mut ObjectCache, buf: *mut u8) {
    unsafe { SLAB_ALLOCATOR.lock().free(cache, buf) }
}

/// Destroys a cache created by [`cache_create`]. The caller promises no
/// outstanding buffers.
///
/// # Safety
/// - `cache` must have come from `cache_create` and not yet been destroyed
/// - Every buffer allocated from the cache must have been freed
#[cfg(feature = "alloc")]
pub unsafe fn cache_destroy(cache: *mut ObjectCache) {
    unsafe { SLAB_ALLOCATOR.lock().destroy(cache) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{HeapPages, DEFAULT_PAGE_SIZE};

    #[test]
    fn test_padded_object_size() {
        // corrected rounding: an already aligned size stays put
        assert_eq!(padded_object_size(16, 8), 16);
        assert_eq!(padded_object_size(10, 8), 16);
        assert_eq!(padded_object_size(12, 0), 12);
        // sub-word sizes grow to hold the freelist link
        assert_eq!(padded_object_size(3, 0), mem::size_of::<usize>());
        assert_eq!(padded_object_size(1, 2), mem::size_of::<usize>());
    }

    #[test]
    fn test_bootstrap_self_hosts() {
        let mut allocator = SlabAllocator::new(HeapPages::new());
        let cache = allocator.create("test-objects", 24, 0);
        assert!(!cache.is_null());

        assert!(!allocator.cache_cache.is_null());
        assert!(!allocator.slab_cache.is_null());
        assert!(!allocator.bufctl_cache.is_null());
        assert!(!allocator.hash_cache.is_null());
        assert!(!allocator.node_cache.is_null());
        unsafe {
            for internal in [
                allocator.cache_cache,
                allocator.slab_cache,
                allocator.bufctl_cache,
                allocator.hash_cache,
                allocator.node_cache,
            ] {
                assert_eq!((*internal).layout, SlabLayout::Small);
                assert!((*internal).hash.is_null());
                assert!((*internal).stats().slab_count >= 1);
            }
            // the cache-of-caches record sits in its own first slab
            let slab = (*allocator.cache_cache).slabs;
            assert_eq!((*slab).start, allocator.cache_cache as *mut u8);
            allocator.destroy(cache);
        }
    }

    #[test]
    fn test_layout_selection_boundary() {
        let mut allocator = SlabAllocator::new(HeapPages::new());
        let small = allocator.create("just-small", DEFAULT_PAGE_SIZE / 8 - 1, 0);
        let large = allocator.create("just-large", DEFAULT_PAGE_SIZE / 8, 0);
        unsafe {
            assert_eq!((*small).layout(), SlabLayout::Small);
            assert_eq!((*large).layout(), SlabLayout::Large);
            assert!((*small).hash.is_null());
            assert!(!(*large).hash.is_null());
            allocator.destroy(small);
            allocator.destroy(large);
        }
    }

    #[test]
    fn test_alignment_rounds_object_size() {
        let mut allocator = SlabAllocator::new(HeapPages::new());
        let cache = allocator.create("aligned", 20, 16);
        unsafe {
            assert_eq!((*cache).object_size(), 32);
            let a = allocator.alloc(cache, AllocFlags::SLEEP);
            let b = allocator.alloc(cache, AllocFlags::SLEEP);
            assert_eq!(a as usize % 16, 0);
            assert_eq!(b as usize % 16, 0);
            allocator.free(cache, a);
            allocator.free(cache, b);
            allocator.destroy(cache);
        }
    }

    #[test]
    fn test_hash_holds_every_live_buffer() {
        let mut allocator = SlabAllocator::new(HeapPages::new());
        let cache = allocator.create("big-objects", 512, 0);
        unsafe {
            let mut buffers = [null_mut::<u8>(); 100];
            for slot in buffers.iter_mut() {
                *slot = allocator.alloc(cache, AllocFlags::SLEEP);
                assert!(!slot.is_null());
            }
            for &buf in buffers.iter() {
                let ctl = (*(*cache).hash).get(buf);
                assert!(!ctl.is_null());
                assert_eq!((*ctl).buf, buf);
                assert!((*(*ctl).slab).refcount > 0);
            }
            for &buf in buffers.iter() {
                allocator.free(cache, buf);
            }
            assert_eq!((*cache).stats().slab_count, 1);
            allocator.destroy(cache);
        }
    }

    #[test]
    fn test_free_of_unknown_large_buffer_ignored() {
        let mut allocator = SlabAllocator::new(HeapPages::new());
        let cache = allocator.create("strict", 1024, 0);
        unsafe {
            let buf = allocator.alloc(cache, AllocFlags::SLEEP);
            let before = (*cache).stats();
            let mut bogus = 0u8;
            allocator.free(cache, &mut bogus);
            assert_eq!((*cache).stats(), before);
            allocator.free(cache, buf);
            allocator.destroy(cache);
        }
    }
}
