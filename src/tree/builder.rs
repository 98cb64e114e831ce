//! Incremental tree construction from start/data/end callbacks.
//!
//! [`TreeBuilder`] keeps the open-element chain in a stack whose slots
//! are reused across sibling subtrees, so a long flat document touches
//! the allocator only while the stack deepens. Character data is held
//! as fragments and attached to the preceding element's text or tail
//! when the next structural callback arrives.

use std::mem;
use std::rc::Rc;

use super::element::{AttrMap, Element};
use super::TreeError;
use crate::parser::events::{EventKind, EventQueue, ParseEvent};
use crate::scan::Position;

/// Creates element nodes for the builder. The default implementation is
/// plain [`Element`] construction; a custom factory can substitute
/// subclass-like nodes or intern by tag.
pub trait ElementFactory {
    fn create(&mut self, tag: Rc<str>, attrs: Option<AttrMap>) -> Element;
}

impl<F: FnMut(Rc<str>, Option<AttrMap>) -> Element> ElementFactory for F {
    fn create(&mut self, tag: Rc<str>, attrs: Option<AttrMap>) -> Element {
        self(tag, attrs)
    }
}

/// Character data accumulated since the last structural callback.
enum PendingData {
    None,
    One(Rc<str>),
    Many(Vec<Rc<str>>),
}

pub struct TreeBuilder {
    root: Option<Element>,
    /// Innermost open element, `None` at top level.
    this: Option<Element>,
    /// Most recently started or closed element; pending data binds to it.
    last: Option<Element>,
    data: PendingData,
    stack: Vec<Option<Element>>,
    index: usize,
    factory: Option<Box<dyn ElementFactory>>,
    events: Option<EventQueue>,
    emit_start: bool,
    emit_end: bool,
}

impl TreeBuilder {
    pub fn new() -> TreeBuilder {
        TreeBuilder {
            root: None,
            this: None,
            last: None,
            data: PendingData::None,
            stack: Vec::new(),
            index: 0,
            factory: None,
            events: None,
            emit_start: false,
            emit_end: false,
        }
    }

    pub fn with_factory(factory: impl ElementFactory + 'static) -> TreeBuilder {
        TreeBuilder {
            factory: Some(Box::new(factory)),
            ..TreeBuilder::new()
        }
    }

    /// Route start and end events into `queue`. Namespace kinds are not
    /// the builder's to emit and are ignored here.
    pub fn set_events(&mut self, queue: EventQueue, kinds: &[EventKind]) {
        self.emit_start = kinds.contains(&EventKind::Start);
        self.emit_end = kinds.contains(&EventKind::End);
        self.events = Some(queue);
    }

    /// Bind accumulated data to `last` as text when it just opened, as
    /// tail when it already closed.
    fn flush_data(&mut self) {
        let data = mem::replace(&mut self.data, PendingData::None);
        let last = match &self.last {
            Some(last) => last,
            None => return,
        };
        let open = match (&self.this, &self.last) {
            (None, None) => true,
            (Some(a), Some(b)) => Element::ptr_eq(a, b),
            _ => false,
        };
        match (open, data) {
            (_, PendingData::None) => {}
            (true, PendingData::One(s)) => last.set_text_raw(s),
            (true, PendingData::Many(parts)) => last.set_text_parts(parts),
            (false, PendingData::One(s)) => last.set_tail_raw(s),
            (false, PendingData::Many(parts)) => last.set_tail_parts(parts),
        }
    }

    /// Open an element and return its handle. Fails with
    /// [`TreeError::MultipleRoots`] on a second top-level element.
    pub fn start(
        &mut self,
        tag: impl Into<Rc<str>>,
        attrs: Option<AttrMap>,
        pos: Option<Position>,
    ) -> Result<Element, TreeError> {
        self.flush_data();

        let tag = tag.into();
        let node = match &mut self.factory {
            Some(factory) => factory.create(tag, attrs),
            None => Element::with_attr_map(tag, attrs),
        };
        node.set_start_position(pos);

        match &self.this {
            Some(parent) => {
                if self.factory.is_some() {
                    // A factory may hand back a live node, so the cycle
                    // guard stays on this path.
                    parent.append(&node)?;
                } else {
                    parent.append_unchecked(node.clone());
                }
            }
            None => {
                if self.root.is_some() {
                    return Err(TreeError::MultipleRoots);
                }
                self.root = Some(node.clone());
            }
        }

        let parent = self.this.take();
        if self.index < self.stack.len() {
            self.stack[self.index] = parent;
        } else {
            self.stack.push(parent);
        }
        self.index += 1;

        self.this = Some(node.clone());
        self.last = Some(node.clone());

        if self.emit_start {
            if let Some(queue) = &self.events {
                queue.borrow_mut().push_back(ParseEvent::Start(node.clone()));
            }
        }
        Ok(node)
    }

    /// Accumulate character data. Data arriving before the first element
    /// is dropped.
    pub fn data(&mut self, text: impl Into<Rc<str>>) {
        if self.last.is_none() {
            return;
        }
        let text = text.into();
        self.data = match mem::replace(&mut self.data, PendingData::None) {
            PendingData::None => PendingData::One(text),
            PendingData::One(first) => PendingData::Many(vec![first, text]),
            PendingData::Many(mut parts) => {
                parts.push(text);
                PendingData::Many(parts)
            }
        };
    }

    /// Close the innermost open element and return it. The closed
    /// element is chosen by nesting alone.
    pub fn end(&mut self, pos: Option<Position>) -> Result<Element, TreeError> {
        self.flush_data();

        if self.index == 0 {
            return Err(TreeError::EmptyStack);
        }
        self.index -= 1;

        let closed = match self.this.take() {
            Some(el) => el,
            None => unreachable!("an open element exists for every stack level"),
        };
        self.this = self.stack[self.index].clone();
        self.last = Some(closed.clone());
        closed.set_end_position(pos);

        if self.emit_end {
            if let Some(queue) = &self.events {
                queue.borrow_mut().push_back(ParseEvent::End(closed.clone()));
            }
        }
        Ok(closed)
    }

    /// The root element, or `None` when no element was started.
    /// Idempotent; open elements are left as they are.
    pub fn close(&mut self) -> Option<Element> {
        self.root.clone()
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        TreeBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::events::new_queue;

    #[test]
    fn test_basic_shape() {
        let mut b = TreeBuilder::new();
        b.start("root", None, None).unwrap();
        b.data("head");
        b.start("child", None, None).unwrap();
        b.data("inner");
        b.end(None).unwrap();
        b.data("tail-text");
        b.end(None).unwrap();
        let root = b.close().unwrap();

        assert_eq!(&*root.tag(), "root");
        assert_eq!(root.text().as_deref(), Some("head"));
        assert_eq!(root.len(), 1);
        let child = root.get_item(0).unwrap();
        assert_eq!(child.text().as_deref(), Some("inner"));
        assert_eq!(child.tail().as_deref(), Some("tail-text"));
        assert!(root.tail().is_none());
    }

    #[test]
    fn test_fragmented_data_joins() {
        let mut b = TreeBuilder::new();
        b.start("a", None, None).unwrap();
        b.data("one ");
        b.data("two ");
        b.data("three");
        b.end(None).unwrap();
        let root = b.close().unwrap();
        assert_eq!(root.text().as_deref(), Some("one two three"));
    }

    #[test]
    fn test_data_before_first_start_is_dropped() {
        let mut b = TreeBuilder::new();
        b.data("noise");
        b.start("a", None, None).unwrap();
        b.end(None).unwrap();
        let root = b.close().unwrap();
        assert!(root.text().is_none());
    }

    #[test]
    fn test_second_root_rejected() {
        let mut b = TreeBuilder::new();
        b.start("a", None, None).unwrap();
        b.end(None).unwrap();
        let err = b.start("b", None, None).unwrap_err();
        assert_eq!(err.to_string(), "multiple elements on top level");
    }

    #[test]
    fn test_end_on_empty_stack() {
        let mut b = TreeBuilder::new();
        let err = b.end(None).unwrap_err();
        assert_eq!(err.to_string(), "pop from empty stack");

        b.start("a", None, None).unwrap();
        b.end(None).unwrap();
        assert_eq!(b.end(None).unwrap_err(), TreeError::EmptyStack);
    }

    #[test]
    fn test_close_before_any_start() {
        let mut b = TreeBuilder::new();
        assert!(b.close().is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut b = TreeBuilder::new();
        b.start("a", None, None).unwrap();
        b.end(None).unwrap();
        let first = b.close().unwrap();
        let second = b.close().unwrap();
        assert!(Element::ptr_eq(&first, &second));
    }

    #[test]
    fn test_sibling_subtrees() {
        let mut b = TreeBuilder::new();
        b.start("r", None, None).unwrap();
        for tag in ["a", "b", "c"] {
            b.start(tag, None, None).unwrap();
            b.end(None).unwrap();
        }
        b.end(None).unwrap();
        let root = b.close().unwrap();
        let tags: Vec<_> = root
            .children()
            .iter()
            .map(|c| c.tag().to_string())
            .collect();
        assert_eq!(tags, ["a", "b", "c"]);
    }

    #[test]
    fn test_factory_is_used() {
        let mut b = TreeBuilder::with_factory(|tag: Rc<str>, attrs: Option<AttrMap>| {
            let el = Element::with_attr_map(tag, attrs);
            el.set_attr("made", "yes");
            el
        });
        let attrs: AttrMap = [("k", "v")].into_iter().collect();
        b.start("a", Some(attrs), None).unwrap();
        b.end(None).unwrap();
        let root = b.close().unwrap();
        assert_eq!(root.get_attr("made").as_deref(), Some("yes"));
        assert_eq!(root.get_attr("k").as_deref(), Some("v"));
    }

    #[test]
    fn test_factory_cannot_create_cycles() {
        // A factory that returns the currently open element would make a
        // node its own child.
        let trap: std::cell::RefCell<Option<Element>> = std::cell::RefCell::new(None);
        let trap = Rc::new(trap);
        let trap2 = trap.clone();
        let mut b = TreeBuilder::with_factory(move |tag: Rc<str>, attrs: Option<AttrMap>| {
            match trap2.borrow_mut().take() {
                Some(existing) => existing,
                None => Element::with_attr_map(tag, attrs),
            }
        });
        let root = b.start("r", None, None).unwrap();
        *trap.borrow_mut() = Some(root);
        let err = b.start("evil", None, None).unwrap_err();
        assert_eq!(err, TreeError::CycleDetected);
    }

    #[test]
    fn test_positions_flow_through() {
        let mut b = TreeBuilder::new();
        let start = Position {
            line: 1,
            column: 0,
            byte: 0,
        };
        let end = Position {
            line: 3,
            column: 2,
            byte: 40,
        };
        b.start("a", None, Some(start)).unwrap();
        b.end(Some(end)).unwrap();
        let root = b.close().unwrap();
        assert_eq!(root.start_position(), Some(start));
        assert_eq!(root.end_position(), Some(end));

        let mut manual = TreeBuilder::new();
        manual.start("a", None, None).unwrap();
        manual.end(None).unwrap();
        let root = manual.close().unwrap();
        assert!(root.start_position().is_none());
        assert!(root.end_position().is_none());
    }

    #[test]
    fn test_events_emitted_in_order() {
        let queue = new_queue();
        let mut b = TreeBuilder::new();
        b.set_events(queue.clone(), &[EventKind::Start, EventKind::End]);

        b.start("r", None, None).unwrap();
        b.start("c", None, None).unwrap();
        b.end(None).unwrap();
        b.end(None).unwrap();

        let events: Vec<String> = queue
            .borrow_mut()
            .drain(..)
            .map(|ev| match ev {
                ParseEvent::Start(el) => format!("start {}", el.tag()),
                ParseEvent::End(el) => format!("end {}", el.tag()),
                _ => "ns".to_string(),
            })
            .collect();
        assert_eq!(events, ["start r", "start c", "end c", "end r"]);
    }

    #[test]
    fn test_start_event_sees_growing_subtree() {
        let queue = new_queue();
        let mut b = TreeBuilder::new();
        b.set_events(queue.clone(), &[EventKind::Start]);

        b.start("r", None, None).unwrap();
        let handle = match queue.borrow_mut().pop_front() {
            Some(ParseEvent::Start(el)) => el,
            other => panic!("expected start event, got {other:?}"),
        };
        assert!(handle.is_empty());
        b.start("c", None, None).unwrap();
        b.end(None).unwrap();
        b.end(None).unwrap();
        // The handle aliases the live tree.
        assert_eq!(handle.len(), 1);
    }
}
