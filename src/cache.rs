//! Object caches
//!
//! A cache owns every slab holding objects of one fixed size. Its slabs form
//! a circular doubly linked list kept in a strict order: complete slabs
//! first, then partial, then empty. `freelist_head` points at the first slab
//! with free capacity, which is what makes allocation O(1), and reap scans
//! consume the run of empty slabs at the tail.

use core::ptr::null_mut;

use crate::hash::BufHash;
use crate::slab::{Slab, SlabLayout};

/// A collection of slabs holding objects of one fixed size.
///
/// Created through [`SlabAllocator::create`](crate::SlabAllocator::create);
/// the record itself lives in the allocator's cache-of-caches.
#[repr(C)]
pub struct ObjectCache {
    /// Cache name, for diagnostics.
    pub(crate) name: &'static str,
    /// Effective object size: the requested size rounded up for alignment.
    pub(crate) object_size: usize,
    /// Requested alignment (0 or a power of two).
    pub(crate) align: usize,
    /// Layout strategy, fixed at creation.
    pub(crate) layout: SlabLayout,
    /// Number of slabs on the circular list.
    pub(crate) slab_count: usize,
    /// Head of the circular slab list (a complete slab whenever one exists).
    pub(crate) slabs: *mut Slab,
    /// First slab with free capacity; null when all slabs are complete or
    /// no slab exists.
    pub(crate) freelist_head: *mut Slab,
    /// Buffer-to-bufctl index; null for small-layout caches.
    pub(crate) hash: *mut BufHash,
}

/// Point-in-time usage counters for one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of slabs currently owned by the cache.
    pub slab_count: usize,
    /// Total buffer capacity across all slabs.
    pub total_buffers: usize,
    /// Buffers currently allocated.
    pub live_buffers: usize,
}

/// Links `slab` into the cycle directly before `pos`.
///
/// # Safety
/// - `pos` must be on a well-formed cycle and `slab` must be detached
unsafe fn list_insert_before(pos: *mut Slab, slab: *mut Slab) {
    unsafe {
        (*slab).next = pos;
        (*slab).prev = (*pos).prev;
        (*(*pos).prev).next = slab;
        (*pos).prev = slab;
    }
}

/// Unlinks `slab` from its cycle. The slab's own links are left dangling;
/// callers relink or discard it.
///
/// # Safety
/// - `slab` must be on a well-formed cycle with at least two members
unsafe fn list_unlink(slab: *mut Slab) {
    unsafe {
        (*(*slab).prev).next = (*slab).next;
        (*(*slab).next).prev = (*slab).prev;
    }
}

impl ObjectCache {
    /// Cache name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Effective object size in bytes (requested size rounded for
    /// alignment).
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Requested alignment (0 when none was requested).
    pub fn align(&self) -> usize {
        self.align
    }

    /// Layout strategy selected for this cache.
    pub fn layout(&self) -> SlabLayout {
        self.layout
    }

    /// Usage counters.
    ///
    /// Walking the slab list here also re-checks the list discipline under
    /// `debug_assertions`, which is what the test suite leans on.
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            slab_count: 0,
            total_buffers: 0,
            live_buffers: 0,
        };
        let mut first_nonfull: *mut Slab = null_mut();
        let mut phase = 0u8; // 0 complete, 1 partial, 2 empty
        if !self.slabs.is_null() {
            let mut cursor = self.slabs;
            loop {
                unsafe {
                    stats.slab_count += 1;
                    stats.total_buffers += (*cursor).size;
                    stats.live_buffers += (*cursor).refcount;
                    debug_assert!((*cursor).refcount <= (*cursor).size);
                    let here = if (*cursor).is_complete() {
                        0
                    } else if (*cursor).is_empty() {
                        2
                    } else {
                        1
                    };
                    debug_assert!(here >= phase, "slab list out of order");
                    phase = here;
                    if first_nonfull.is_null() && !(*cursor).is_complete() {
                        first_nonfull = cursor;
                    }
                    cursor = (*cursor).next;
                }
                if cursor == self.slabs {
                    break;
                }
            }
        }
        debug_assert_eq!(stats.slab_count, self.slab_count);
        debug_assert_eq!(first_nonfull, self.freelist_head);
        stats
    }

    /// Appends a freshly grown slab at the tail (the empty region). The
    /// first slab becomes the whole cycle; otherwise `freelist_head`
    /// advances here when it was null or stuck on a complete slab.
    pub(crate) unsafe fn append_slab(&mut self, slab: *mut Slab) {
        unsafe {
            if self.slabs.is_null() {
                (*slab).prev = slab;
                (*slab).next = slab;
                self.slabs = slab;
                self.freelist_head = slab;
            } else {
                list_insert_before(self.slabs, slab);
                if self.freelist_head.is_null() || (*self.freelist_head).is_complete() {
                    self.freelist_head = slab;
                }
            }
            self.slab_count += 1;
        }
    }

    /// Moves a slab that just became complete to the front of the list and
    /// advances `freelist_head` past it.
    pub(crate) unsafe fn mark_complete(&mut self, slab: *mut Slab) {
        unsafe {
            if self.freelist_head == slab {
                let succ = (*slab).next;
                self.freelist_head =
                    if succ == slab || succ == self.slabs || (*succ).is_complete() {
                        null_mut()
                    } else {
                        succ
                    };
            }
            if (*slab).next != slab && self.slabs != slab {
                list_unlink(slab);
                list_insert_before(self.slabs, slab);
            }
            self.slabs = slab;
        }
    }

    /// Moves a formerly complete slab back to the front of the partial
    /// region and makes it the new `freelist_head`.
    pub(crate) unsafe fn mark_partial(&mut self, slab: *mut Slab) {
        unsafe {
            if (*slab).next != slab {
                if self.slabs == slab {
                    self.slabs = (*slab).next;
                }
                list_unlink(slab);
                if self.freelist_head.is_null() {
                    // every other slab is complete: the partial region is
                    // the tail
                    list_insert_before(self.slabs, slab);
                } else {
                    let at_head = self.freelist_head == self.slabs;
                    list_insert_before(self.freelist_head, slab);
                    if at_head {
                        self.slabs = slab;
                    }
                }
            }
            self.freelist_head = slab;
        }
    }

    /// Moves a slab that just became empty into the empty region at the
    /// tail, making it a reap candidate.
    pub(crate) unsafe fn mark_empty(&mut self, slab: *mut Slab) {
        unsafe {
            if (*slab).next == slab {
                // sole slab: nowhere to move
                return;
            }
            if self.freelist_head == slab {
                let succ = (*slab).next;
                self.freelist_head = if succ == self.slabs || (*succ).is_complete() {
                    null_mut()
                } else {
                    succ
                };
            }
            if self.slabs == slab {
                self.slabs = (*slab).next;
            }
            list_unlink(slab);
            list_insert_before(self.slabs, slab);
        }
    }

    /// Unlinks a slab entirely, repointing `slabs` and `freelist_head` when
    /// they referenced it.
    pub(crate) unsafe fn remove_slab(&mut self, victim: *mut Slab) {
        unsafe {
            let succ = (*victim).next;
            if succ == victim {
                self.slabs = null_mut();
                self.freelist_head = null_mut();
            } else {
                if self.slabs == victim {
                    self.slabs = succ;
                }
                if self.freelist_head == victim {
                    self.freelist_head = if (*succ).is_complete() { null_mut() } else { succ };
                }
                list_unlink(victim);
            }
            (*victim).prev = null_mut();
            (*victim).next = null_mut();
            self.slab_count -= 1;
        }
    }
}
