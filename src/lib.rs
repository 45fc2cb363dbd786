//! Object-caching slab allocator
//!
//! This crate provides a slab allocator in the object-cache style: client
//! code creates a cache for objects of one size and alignment, then
//! allocates and frees individual buffers in O(1) average time. Each cache
//! owns a circular list of slabs, a slab being one page carved into
//! fixed-size buffers with a freelist and a reference count.
//!
//! Two slab layouts cover the size spectrum. Objects below one-eighth of a
//! page keep their freelist links inside the free buffers and the slab
//! record at the page tail; larger objects give the whole page to buffers
//! and keep their metadata off-page behind a buffer-to-bufctl hash. The
//! allocator hosts all of its own metadata in its own caches, bootstrapped
//! from a single page on first use.
//!
//! Memory comes from a host-supplied [`PagePool`]; the crate ships a
//! heap-backed default ([`HeapPages`]) behind the `alloc` feature. The
//! allocator is single-threaded; callers sharing one across threads must
//! serialize externally.
//!
//! # Usage
//!
//! ```rust
//! use slab_cache::{AllocFlags, HeapPages, SlabAllocator};
//!
//! let mut allocator = SlabAllocator::new(HeapPages::new());
//! let cache = allocator.create("my-objects", 24, 8);
//! unsafe {
//!     let buf = allocator.alloc(cache, AllocFlags::SLEEP);
//!     allocator.free(cache, buf);
//!     allocator.destroy(cache);
//! }
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "std")]
extern crate std;

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod allocator;
pub mod backing;
pub mod cache;
pub mod hash;
pub mod slab;

// Re-export the API surface
pub use allocator::{AllocFlags, SlabAllocator};
#[cfg(feature = "alloc")]
pub use allocator::{cache_alloc, cache_create, cache_destroy, cache_free};
#[cfg(feature = "alloc")]
pub use backing::HeapPages;
pub use backing::{PagePool, DEFAULT_PAGE_SIZE};
pub use cache::{CacheStats, ObjectCache};
pub use hash::{BufHash, HashNode, HASH_BUCKETS};
pub use slab::{Slab, SlabBufctl, SlabLayout};
