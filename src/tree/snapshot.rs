//! Plain-data snapshots of element trees.
//!
//! [`ElementState`] is a detached, owned copy of a subtree with no
//! interior mutability, suitable for storage or transfer. Capturing
//! records the derived name split and source positions verbatim;
//! restoring trusts them rather than recomputing, so a state edited in
//! flight round-trips unchanged.

use std::rc::Rc;

use super::element::Element;
use crate::scan::Position;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ElementState {
    pub tag: String,
    /// Attribute pairs in insertion order; empty when the element never
    /// materialized attribute storage.
    pub attrib: Vec<(String, String)>,
    pub text: Option<String>,
    pub tail: Option<String>,
    pub local_name: String,
    pub ns: Option<String>,
    pub start: Option<Position>,
    pub end: Option<Position>,
    pub children: Vec<ElementState>,
}

impl ElementState {
    /// Record `el` and its subtree. Shared child handles are captured
    /// once per occurrence; identity is not part of the state.
    pub fn capture(el: &Element) -> ElementState {
        ElementState {
            tag: el.tag().to_string(),
            attrib: el
                .attr_items()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            text: el.text().map(|s| s.to_string()),
            tail: el.tail().map(|s| s.to_string()),
            local_name: el.local_name().to_string(),
            ns: el.namespace_uri().map(|s| s.to_string()),
            start: el.start_position(),
            end: el.end_position(),
            children: el.children().iter().map(ElementState::capture).collect(),
        }
    }

    /// Build a fresh subtree from the state. Attribute storage stays
    /// absent when the captured map was empty.
    pub fn restore(&self) -> Element {
        let el = Element::new(self.tag.as_str());
        el.restore_names(
            Rc::from(self.local_name.as_str()),
            self.ns.as_deref().map(Rc::from),
        );
        if let Some(text) = &self.text {
            el.set_text(text.as_str());
        }
        if let Some(tail) = &self.tail {
            el.set_tail(tail.as_str());
        }
        if !self.attrib.is_empty() {
            let map = el.attr_map();
            for (k, v) in &self.attrib {
                map.set(k.as_str(), v.as_str());
            }
        }
        el.set_start_position(self.start);
        el.set_end_position(self.end);
        for child in &self.children {
            el.append_unchecked(child.restore());
        }
        el
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::AttrMap;

    fn sample() -> Element {
        let root = Element::new("{http://x}root");
        root.set_attr("a", "1");
        root.set_text("head");
        root.set_start_position(Some(Position {
            line: 1,
            column: 0,
            byte: 0,
        }));
        root.set_end_position(Some(Position {
            line: 4,
            column: 2,
            byte: 99,
        }));
        let child = root.subelement("leaf", &AttrMap::new());
        child.set_text("body");
        child.set_tail("after");
        root
    }

    #[test]
    fn test_roundtrip_preserves_value() {
        let root = sample();
        let state = ElementState::capture(&root);
        let restored = state.restore();

        assert_eq!(restored, root);
        assert!(!Element::ptr_eq(&restored, &root));
        assert_eq!(&*restored.local_name(), "root");
        assert_eq!(restored.namespace_uri().as_deref(), Some("http://x"));
        assert_eq!(restored.start_position(), root.start_position());
        assert_eq!(restored.end_position(), root.end_position());
        let leaf = restored.get_item(0).unwrap();
        assert_eq!(leaf.tail().as_deref(), Some("after"));
    }

    #[test]
    fn test_absent_attrs_stay_absent() {
        let el = Element::new("bare");
        let state = ElementState::capture(&el);
        assert!(state.attrib.is_empty());
        let restored = state.restore();
        assert!(!restored.has_attr_storage());
    }

    #[test]
    fn test_restore_trusts_stored_names() {
        let mut state = ElementState::capture(&Element::new("{u}x"));
        state.local_name = "other".to_string();
        state.ns = None;
        let restored = state.restore();
        assert_eq!(&*restored.tag(), "{u}x");
        assert_eq!(&*restored.local_name(), "other");
        assert!(restored.namespace_uri().is_none());
    }

    #[test]
    fn test_shared_child_captured_per_occurrence() {
        let shared = Element::new("s");
        let root = Element::new("r");
        root.append(&shared).unwrap();
        root.append(&shared).unwrap();

        let restored = ElementState::capture(&root).restore();
        assert_eq!(restored.len(), 2);
        let a = restored.get_item(0).unwrap();
        let b = restored.get_item(1).unwrap();
        assert_eq!(a, b);
        assert!(!Element::ptr_eq(&a, &b));
    }
}
