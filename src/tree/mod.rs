//! Element nodes and incremental tree construction.
//!
//! An [`Element`] is a cheap shared handle to one node: tag, attributes,
//! text, tail, child list, and optional source positions. [`TreeBuilder`]
//! assembles nodes from a flat stream of start/data/end callbacks.

mod builder;
mod children;
mod element;
mod snapshot;

pub use builder::{ElementFactory, TreeBuilder};
pub use element::{AttrMap, CopyMemo, Element, TreeIter};
pub use snapshot::ElementState;

use std::fmt;

/// A rejected tree operation.
///
/// These are programmer or input errors surfaced immediately to the caller;
/// the tree is left in its pre-operation state except where noted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// Child read at an index outside the list.
    IndexOutOfRange,
    /// Child write or delete at an index outside the list.
    AssignIndexOutOfRange,
    /// Extended-slice assignment where the sequence length does not match
    /// the slice length.
    SliceSizeMismatch { size: usize, slice: usize },
    /// Slice with a zero step.
    ZeroStep,
    /// `remove` target not present by identity or value.
    ChildNotFound,
    /// Attaching a node to itself or to one of its own descendants.
    CycleDetected,
    /// A second element started at the top level of a document.
    MultipleRoots,
    /// `end` with no matching `start`.
    EmptyStack,
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexOutOfRange => f.write_str("child index out of range"),
            Self::AssignIndexOutOfRange => f.write_str("child assignment index out of range"),
            Self::SliceSizeMismatch { size, slice } => write!(
                f,
                "attempt to assign sequence of size {} to extended slice of size {}",
                size, slice
            ),
            Self::ZeroStep => f.write_str("slice step cannot be zero"),
            Self::ChildNotFound => f.write_str("list.remove(x): x not in list"),
            Self::CycleDetected => {
                f.write_str("cannot add an element as a descendant of itself")
            }
            Self::MultipleRoots => f.write_str("multiple elements on top level"),
            Self::EmptyStack => f.write_str("pop from empty stack"),
        }
    }
}

impl std::error::Error for TreeError {}
