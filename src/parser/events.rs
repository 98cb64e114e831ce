//! Event plumbing for incremental parse consumers.
//!
//! The builder and parser push into a shared [`EventQueue`]; whoever
//! drives the parse drains it between feeds. Start events fire as soon
//! as an element opens, so its attributes are complete but its children
//! are not yet attached.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::tree::Element;

/// Event categories a consumer can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    End,
    StartNs,
    EndNs,
}

/// A single queued parse event. Element handles alias the tree under
/// construction, so a consumer sees children accumulate on a `Start`
/// handle it kept around.
#[derive(Debug, Clone)]
pub enum ParseEvent {
    Start(Element),
    End(Element),
    /// A namespace declaration came into scope. The default namespace
    /// is reported with an empty prefix.
    StartNs { prefix: Rc<str>, uri: Rc<str> },
    /// The innermost declaration went out of scope.
    EndNs,
}

/// Shared FIFO between producers and the consumer.
pub type EventQueue = Rc<RefCell<VecDeque<ParseEvent>>>;

pub fn new_queue() -> EventQueue {
    Rc::new(RefCell::new(VecDeque::new()))
}
