//! xetree - Incremental XML parsing into a lightweight element tree
//!
//! Layers:
//! scan: incremental tokenizer (positions, namespaces, entities)
//! tree: element nodes, attribute maps, tree builder with event queues
//! parser: feed/close driver wiring the scanner to a build target
//! path: find family over compiled, LRU-cached path expressions
//!
//! The everyday entry points are [`parse_str`], [`parse_reader`] and
//! [`iterparse`]; incremental callers drive an [`XmlParser`] directly
//! with [`XmlParser::feed`] and [`XmlParser::close`]. Trees can also be
//! built by hand through [`TreeBuilder`] or [`Element`].

mod error;
mod parser;
mod path;
mod scan;
mod tree;

pub use error::XmlError;
pub use parser::events::{new_queue, EventKind, EventQueue, ParseEvent};
pub use parser::{iterparse, parse_reader, parse_str, BuildTarget, IterParse, XmlParser};
pub use path::{Engine, PathError, PathEvaluator, PathIter};
pub use scan::{ErrorCode, ParseError, Position};
pub use tree::{
    AttrMap, CopyMemo, Element, ElementFactory, ElementState, TreeBuilder, TreeError, TreeIter,
};

// ============================================================================
// Allocator Configuration
// ============================================================================

/// Allocation counters for profiling builds.
///
/// With the `memory_tracking` feature on, the crate installs a global
/// allocator shim that counts live bytes and the high-water mark. The
/// underlying allocator is mimalloc when that feature is also enabled,
/// the system allocator otherwise.
#[cfg(feature = "memory_tracking")]
pub mod memory {
    use std::alloc::{GlobalAlloc, Layout};
    use std::sync::atomic::{AtomicUsize, Ordering};

    static ALLOCATED: AtomicUsize = AtomicUsize::new(0);
    static PEAK_ALLOCATED: AtomicUsize = AtomicUsize::new(0);

    pub(crate) struct TrackingAllocator;

    #[cfg(feature = "mimalloc")]
    static UNDERLYING: mimalloc::MiMalloc = mimalloc::MiMalloc;

    #[cfg(not(feature = "mimalloc"))]
    static UNDERLYING: std::alloc::System = std::alloc::System;

    unsafe impl GlobalAlloc for TrackingAllocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let ptr = UNDERLYING.alloc(layout);
            if !ptr.is_null() {
                let current = ALLOCATED.fetch_add(layout.size(), Ordering::Relaxed) + layout.size();
                PEAK_ALLOCATED.fetch_max(current, Ordering::Relaxed);
            }
            ptr
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            ALLOCATED.fetch_sub(layout.size(), Ordering::Relaxed);
            UNDERLYING.dealloc(ptr, layout)
        }
    }

    /// Bytes currently allocated.
    pub fn allocated() -> usize {
        ALLOCATED.load(Ordering::SeqCst)
    }

    /// High-water mark since startup or the last reset.
    pub fn peak_allocated() -> usize {
        PEAK_ALLOCATED.load(Ordering::SeqCst)
    }

    /// Resets the peak to the current level. Returns the current level
    /// and the peak it replaced.
    pub fn reset_stats() -> (usize, usize) {
        let current = ALLOCATED.load(Ordering::SeqCst);
        let peak = PEAK_ALLOCATED.swap(current, Ordering::SeqCst);
        (current, peak)
    }
}

#[cfg(feature = "memory_tracking")]
#[global_allocator]
static GLOBAL: memory::TrackingAllocator = memory::TrackingAllocator;

#[cfg(all(feature = "mimalloc", not(feature = "memory_tracking")))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;
