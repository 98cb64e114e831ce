//! The element node type.
//!
//! An [`Element`] is a cheap reference handle: cloning it aliases the same
//! node, and every accessor goes through interior mutability so a tree can
//! be read and edited through any handle that reaches it. Deep value
//! equality, shallow and memoized deep copies, and list-style child
//! indexing all live here; the raw child storage is in
//! [`super::children`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use memchr::memchr;

use super::children::ChildList;
use super::TreeError;
use crate::scan::Position;

/// Attribute storage: insertion-ordered pairs behind a shared handle.
///
/// Cloning aliases the same map, matching the node model where a shallow
/// node copy shares its source's attributes. Setting an existing key
/// overwrites in place, so insertion order is stable under updates.
#[derive(Clone)]
pub struct AttrMap {
    inner: Rc<RefCell<Vec<(Rc<str>, Rc<str>)>>>,
}

impl AttrMap {
    pub fn new() -> Self {
        AttrMap {
            inner: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Rc<str>> {
        self.inner
            .borrow()
            .iter()
            .find(|(k, _)| &**k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn set(&self, key: impl Into<Rc<str>>, value: impl Into<Rc<str>>) {
        let key = key.into();
        let value = value.into();
        let mut pairs = self.inner.borrow_mut();
        match pairs.iter_mut().find(|(k, _)| *k == key) {
            Some(pair) => pair.1 = value,
            None => pairs.push((key, value)),
        }
    }

    pub fn remove(&self, key: &str) -> Option<Rc<str>> {
        let mut pairs = self.inner.borrow_mut();
        let i = pairs.iter().position(|(k, _)| &**k == key)?;
        Some(pairs.remove(i).1)
    }

    pub fn keys(&self) -> Vec<Rc<str>> {
        self.inner.borrow().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn items(&self) -> Vec<(Rc<str>, Rc<str>)> {
        self.inner.borrow().clone()
    }

    /// Whether two handles alias the same storage.
    pub fn ptr_eq(a: &AttrMap, b: &AttrMap) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// New storage with the same pairs. String handles are shared; the
    /// strings themselves are immutable.
    pub fn deep_clone(&self) -> AttrMap {
        AttrMap {
            inner: Rc::new(RefCell::new(self.inner.borrow().clone())),
        }
    }

    fn key(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }

    /// Order-insensitive pair equality.
    fn value_eq(a: &AttrMap, b: &AttrMap) -> bool {
        if AttrMap::ptr_eq(a, b) {
            return true;
        }
        let a = a.inner.borrow();
        let b = b.inner.borrow();
        a.len() == b.len()
            && a.iter()
                .all(|(k, v)| b.iter().any(|(bk, bv)| bk == k && bv == v))
    }
}

impl Default for AttrMap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AttrMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.inner.borrow().iter().map(|(k, v)| (k.clone(), v.clone())))
            .finish()
    }
}

impl<K: Into<Rc<str>>, V: Into<Rc<str>>> FromIterator<(K, V)> for AttrMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = AttrMap::new();
        for (k, v) in iter {
            map.set(k, v);
        }
        map
    }
}

/// Text or tail content. The builder may attach several fragments; they
/// are joined on first read and the joined form is kept.
#[derive(Clone)]
enum TextSlot {
    Absent,
    Raw(Rc<str>),
    Pending(Vec<Rc<str>>),
}

impl TextSlot {
    fn read(&mut self) -> Option<Rc<str>> {
        match self {
            TextSlot::Absent => None,
            TextSlot::Raw(s) => Some(s.clone()),
            TextSlot::Pending(parts) => {
                let joined: Rc<str> = parts.concat().into();
                *self = TextSlot::Raw(joined.clone());
                Some(joined)
            }
        }
    }
}

struct ElementData {
    tag: Rc<str>,
    local_name: Rc<str>,
    namespace_uri: Option<Rc<str>>,
    attrs: Option<AttrMap>,
    text: TextSlot,
    tail: TextSlot,
    children: ChildList,
    start_pos: Option<Position>,
    end_pos: Option<Position>,
}

/// A tree node handle.
///
/// `Clone` aliases the node; use [`Element::shallow_copy`] or
/// [`Element::deep_copy`] for new nodes. `==` is deep value equality over
/// tag, attributes, text, tail, and children; source positions are
/// deliberately excluded so a parsed tree compares equal to a built one.
#[derive(Clone)]
pub struct Element(Rc<RefCell<ElementData>>);

/// Split a universal `{uri}local` tag. A plain tag is its own local name
/// with no namespace.
fn split_tag(tag: &Rc<str>) -> (Rc<str>, Option<Rc<str>>) {
    match memchr(b'}', tag.as_bytes()) {
        Some(i) => {
            let ns: Rc<str> = if i >= 1 { Rc::from(&tag[1..i]) } else { Rc::from("") };
            let local: Rc<str> = Rc::from(&tag[i + 1..]);
            (local, Some(ns))
        }
        None => (tag.clone(), None),
    }
}

impl Element {
    /// New node with no attribute storage.
    pub fn new(tag: impl Into<Rc<str>>) -> Element {
        Element::build(tag.into(), None)
    }

    /// New node with the given attributes copied (not aliased) into owned
    /// storage. An empty map allocates nothing.
    pub fn with_attrs(tag: impl Into<Rc<str>>, attrs: &AttrMap) -> Element {
        let attrs = if attrs.is_empty() {
            None
        } else {
            Some(attrs.deep_clone())
        };
        Element::build(tag.into(), attrs)
    }

    /// New node aliasing `attrs` directly. The builder hands freshly
    /// decoded maps through here without the defensive copy.
    pub(crate) fn with_attr_map(tag: Rc<str>, attrs: Option<AttrMap>) -> Element {
        Element::build(tag, attrs)
    }

    fn build(tag: Rc<str>, attrs: Option<AttrMap>) -> Element {
        let (local_name, namespace_uri) = split_tag(&tag);
        Element(Rc::new(RefCell::new(ElementData {
            tag,
            local_name,
            namespace_uri,
            attrs,
            text: TextSlot::Absent,
            tail: TextSlot::Absent,
            children: ChildList::new(),
            start_pos: None,
            end_pos: None,
        })))
    }

    /// Same as [`Element::with_attrs`]; mirrors the factory method on
    /// nodes so builders can be handed any element as a prototype.
    pub fn makeelement(&self, tag: impl Into<Rc<str>>, attrs: &AttrMap) -> Element {
        Element::with_attrs(tag, attrs)
    }

    /// Create a child, append it, and return its handle.
    pub fn subelement(&self, tag: impl Into<Rc<str>>, attrs: &AttrMap) -> Element {
        let child = Element::with_attrs(tag, attrs);
        self.0.borrow_mut().children.push(child.clone());
        child
    }

    /// Whether two handles alias the same node.
    pub fn ptr_eq(a: &Element, b: &Element) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// Stable per-node key for memo tables.
    fn key(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    // ================================================================
    // Tag and names
    // ================================================================

    pub fn tag(&self) -> Rc<str> {
        self.0.borrow().tag.clone()
    }

    /// Replace the tag. The local-name/namespace split is recomputed so
    /// the derived views never go stale.
    pub fn set_tag(&self, tag: impl Into<Rc<str>>) {
        let tag = tag.into();
        let (local_name, namespace_uri) = split_tag(&tag);
        let mut data = self.0.borrow_mut();
        data.tag = tag;
        data.local_name = local_name;
        data.namespace_uri = namespace_uri;
    }

    /// Local part of a universal tag, or the whole tag when plain.
    pub fn local_name(&self) -> Rc<str> {
        self.0.borrow().local_name.clone()
    }

    pub fn namespace_uri(&self) -> Option<Rc<str>> {
        self.0.borrow().namespace_uri.clone()
    }

    // ================================================================
    // Text and tail
    // ================================================================

    /// Text before the first child. Fragmented content is joined on first
    /// read.
    pub fn text(&self) -> Option<Rc<str>> {
        self.0.borrow_mut().text.read()
    }

    pub fn set_text(&self, text: impl Into<Rc<str>>) {
        self.0.borrow_mut().text = TextSlot::Raw(text.into());
    }

    /// Clear the text to absent, returning what was there.
    pub fn take_text(&self) -> Option<Rc<str>> {
        let mut data = self.0.borrow_mut();
        let prev = data.text.read();
        data.text = TextSlot::Absent;
        prev
    }

    /// Text after this node's end tag, owned by this node.
    pub fn tail(&self) -> Option<Rc<str>> {
        self.0.borrow_mut().tail.read()
    }

    pub fn set_tail(&self, tail: impl Into<Rc<str>>) {
        self.0.borrow_mut().tail = TextSlot::Raw(tail.into());
    }

    pub fn take_tail(&self) -> Option<Rc<str>> {
        let mut data = self.0.borrow_mut();
        let prev = data.tail.read();
        data.tail = TextSlot::Absent;
        prev
    }

    pub(crate) fn set_text_raw(&self, text: Rc<str>) {
        self.0.borrow_mut().text = TextSlot::Raw(text);
    }

    pub(crate) fn set_text_parts(&self, parts: Vec<Rc<str>>) {
        self.0.borrow_mut().text = TextSlot::Pending(parts);
    }

    pub(crate) fn set_tail_raw(&self, tail: Rc<str>) {
        self.0.borrow_mut().tail = TextSlot::Raw(tail);
    }

    pub(crate) fn set_tail_parts(&self, parts: Vec<Rc<str>>) {
        self.0.borrow_mut().tail = TextSlot::Pending(parts);
    }

    // ================================================================
    // Attributes
    // ================================================================

    /// The attribute map handle, materializing empty storage on first use.
    pub fn attr_map(&self) -> AttrMap {
        let mut data = self.0.borrow_mut();
        match &data.attrs {
            Some(map) => map.clone(),
            None => {
                let map = AttrMap::new();
                data.attrs = Some(map.clone());
                map
            }
        }
    }

    /// Attribute lookup without materializing storage.
    pub fn get_attr(&self, key: &str) -> Option<Rc<str>> {
        self.0.borrow().attrs.as_ref().and_then(|m| m.get(key))
    }

    pub fn set_attr(&self, key: impl Into<Rc<str>>, value: impl Into<Rc<str>>) {
        self.attr_map().set(key, value);
    }

    pub fn attr_keys(&self) -> Vec<Rc<str>> {
        match &self.0.borrow().attrs {
            Some(m) => m.keys(),
            None => Vec::new(),
        }
    }

    pub fn attr_items(&self) -> Vec<(Rc<str>, Rc<str>)> {
        match &self.0.borrow().attrs {
            Some(m) => m.items(),
            None => Vec::new(),
        }
    }

    pub fn attr_len(&self) -> usize {
        self.0.borrow().attrs.as_ref().map_or(0, AttrMap::len)
    }

    #[cfg(test)]
    pub(crate) fn has_attr_storage(&self) -> bool {
        self.0.borrow().attrs.is_some()
    }

    // ================================================================
    // Positions
    // ================================================================

    /// Source position of the start tag, when built by a parser.
    pub fn start_position(&self) -> Option<Position> {
        self.0.borrow().start_pos
    }

    /// Source position of the end tag, when built by a parser.
    pub fn end_position(&self) -> Option<Position> {
        self.0.borrow().end_pos
    }

    pub(crate) fn set_start_position(&self, pos: Option<Position>) {
        self.0.borrow_mut().start_pos = pos;
    }

    /// Overwrite the derived name split with stored values. Snapshot
    /// restore trusts its input rather than recomputing.
    pub(crate) fn restore_names(&self, local_name: Rc<str>, namespace_uri: Option<Rc<str>>) {
        let mut data = self.0.borrow_mut();
        data.local_name = local_name;
        data.namespace_uri = namespace_uri;
    }

    pub(crate) fn set_end_position(&self, pos: Option<Position>) {
        self.0.borrow_mut().end_pos = pos;
    }

    // ================================================================
    // Children
    // ================================================================

    pub fn len(&self) -> usize {
        self.0.borrow().children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().children.is_empty()
    }

    /// Handles to every child, in order.
    pub fn children(&self) -> Vec<Element> {
        self.0.borrow().children.to_vec()
    }

    /// Fail when attaching `child` here would make a node its own
    /// ancestor.
    fn check_cycle(&self, child: &Element) -> Result<(), TreeError> {
        if child.subtree_contains(self) {
            return Err(TreeError::CycleDetected);
        }
        Ok(())
    }

    fn subtree_contains(&self, target: &Element) -> bool {
        if Element::ptr_eq(self, target) {
            return true;
        }
        let data = self.0.borrow();
        data.children.iter().any(|c| c.subtree_contains(target))
    }

    pub fn append(&self, child: &Element) -> Result<(), TreeError> {
        self.check_cycle(child)?;
        self.0.borrow_mut().children.push(child.clone());
        Ok(())
    }

    pub(crate) fn append_unchecked(&self, child: Element) {
        self.0.borrow_mut().children.push(child);
    }

    /// Insert at `index` with negative-index wraparound; out-of-bounds
    /// indices clamp to the nearest end instead of failing.
    pub fn insert(&self, index: isize, child: &Element) -> Result<(), TreeError> {
        self.check_cycle(child)?;
        self.0
            .borrow_mut()
            .children
            .insert_clamped(index, child.clone());
        Ok(())
    }

    /// Remove the first child equal to `child`, first by identity, then by
    /// value. The list is untouched when nothing matches.
    pub fn remove(&self, child: &Element) -> Result<(), TreeError> {
        // Equality checks borrow the candidates, so collect handles first.
        let candidates = self.children();
        let found = candidates
            .iter()
            .position(|c| Element::ptr_eq(c, child) || c == child);
        match found {
            Some(i) => {
                self.0.borrow_mut().children.delete_item(i as isize)?;
                Ok(())
            }
            None => Err(TreeError::ChildNotFound),
        }
    }

    pub fn extend(&self, children: &[Element]) -> Result<(), TreeError> {
        for child in children {
            self.append(child)?;
        }
        Ok(())
    }

    /// Child at `index`, supporting negative wraparound.
    pub fn get_item(&self, index: isize) -> Result<Element, TreeError> {
        self.0.borrow().children.get_item(index)
    }

    pub fn set_item(&self, index: isize, child: &Element) -> Result<(), TreeError> {
        self.check_cycle(child)?;
        self.0
            .borrow_mut()
            .children
            .set_item(index, child.clone())?;
        Ok(())
    }

    /// Remove and return the child at `index`.
    pub fn delete_item(&self, index: isize) -> Result<Element, TreeError> {
        self.0.borrow_mut().children.delete_item(index)
    }

    pub fn get_slice(
        &self,
        start: Option<isize>,
        stop: Option<isize>,
        step: isize,
    ) -> Result<Vec<Element>, TreeError> {
        self.0.borrow().children.get_slice(start, stop, step)
    }

    /// Replace the selected children. A unit-step slice may grow or shrink
    /// the list; an extended slice requires an exact length match.
    pub fn set_slice(
        &self,
        start: Option<isize>,
        stop: Option<isize>,
        step: isize,
        new: &[Element],
    ) -> Result<(), TreeError> {
        for child in new {
            self.check_cycle(child)?;
        }
        self.0.borrow_mut().children.set_slice(start, stop, step, new)
    }

    pub fn delete_slice(
        &self,
        start: Option<isize>,
        stop: Option<isize>,
        step: isize,
    ) -> Result<(), TreeError> {
        self.0.borrow_mut().children.delete_slice(start, stop, step)
    }

    /// Drop children, attributes, text, and tail. Tag and positions stay.
    pub fn clear(&self) {
        let mut data = self.0.borrow_mut();
        data.children.clear();
        data.attrs = None;
        data.text = TextSlot::Absent;
        data.tail = TextSlot::Absent;
    }

    // ================================================================
    // Traversal
    // ================================================================

    /// Depth-first walk over this node and every descendant, optionally
    /// filtered by tag (`"*"` matches everything).
    pub fn iter(&self, tag: Option<&str>) -> TreeIter {
        TreeIter {
            stack: vec![self.clone()],
            tag: match tag {
                Some("*") | None => None,
                Some(t) => Some(Rc::from(t)),
            },
        }
    }

    /// Text content of the subtree in document order: each node's text,
    /// then recursively its children with their tails.
    pub fn itertext(&self) -> Vec<Rc<str>> {
        let mut out = Vec::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut Vec<Rc<str>>) {
        if let Some(text) = self.text() {
            out.push(text);
        }
        for child in self.children() {
            child.collect_text(out);
            if let Some(tail) = child.tail() {
                out.push(tail);
            }
        }
    }

    // ================================================================
    // Copies
    // ================================================================

    /// New node sharing this node's attribute map handle and child
    /// handles. The child list itself is new; text, tail, and positions
    /// are carried over.
    pub fn shallow_copy(&self) -> Element {
        let data = self.0.borrow();
        Element(Rc::new(RefCell::new(ElementData {
            tag: data.tag.clone(),
            local_name: data.local_name.clone(),
            namespace_uri: data.namespace_uri.clone(),
            attrs: data.attrs.clone(),
            text: data.text.clone(),
            tail: data.tail.clone(),
            children: {
                let mut list = ChildList::new();
                for child in data.children.iter() {
                    list.push(child.clone());
                }
                list
            },
            start_pos: data.start_pos,
            end_pos: data.end_pos,
        })))
    }

    /// Recursive copy with no node or attribute-storage identity shared
    /// with the source. `memo` deduplicates nodes and attribute maps that
    /// are reachable more than once, so shared substructure stays shared
    /// in the copy.
    pub fn deep_copy(&self, memo: &mut CopyMemo) -> Element {
        if let Some(done) = memo.nodes.get(&self.key()) {
            return done.clone();
        }

        let (tag, attrs, text, tail, start_pos, end_pos, children) = {
            let data = self.0.borrow();
            let attrs = data.attrs.as_ref().map(|map| {
                memo.attrs
                    .entry(map.key())
                    .or_insert_with(|| map.deep_clone())
                    .clone()
            });
            (
                data.tag.clone(),
                attrs,
                data.text.clone(),
                data.tail.clone(),
                data.start_pos,
                data.end_pos,
                data.children.to_vec(),
            )
        };

        let copy = Element::build(tag, attrs);
        {
            let mut data = copy.0.borrow_mut();
            data.text = text;
            data.tail = tail;
            data.start_pos = start_pos;
            data.end_pos = end_pos;
        }

        // Register before recursing so repeated references resolve to the
        // same copy.
        memo.nodes.insert(self.key(), copy.clone());
        for child in children {
            copy.append_unchecked(child.deep_copy(memo));
        }
        copy
    }

    /// [`Element::deep_copy`] with a fresh memo.
    pub fn deep_clone(&self) -> Element {
        self.deep_copy(&mut CopyMemo::default())
    }
}

impl PartialEq for Element {
    /// Deep value equality; positions are ignored. Identity short-circuits.
    fn eq(&self, other: &Element) -> bool {
        if Element::ptr_eq(self, other) {
            return true;
        }
        if self.tag() != other.tag()
            || self.text() != other.text()
            || self.tail() != other.tail()
        {
            return false;
        }
        {
            let a = self.0.borrow();
            let b = other.0.borrow();
            let attrs_eq = match (&a.attrs, &b.attrs) {
                (None, None) => true,
                (Some(m), None) | (None, Some(m)) => m.is_empty(),
                (Some(ma), Some(mb)) => AttrMap::value_eq(ma, mb),
            };
            if !attrs_eq || a.children.len() != b.children.len() {
                return false;
            }
        }
        let (ours, theirs) = (self.children(), other.children());
        ours.iter().zip(theirs.iter()).all(|(a, b)| a == b)
    }
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Element '{}' at {:p}>",
            self.0.borrow().tag,
            Rc::as_ptr(&self.0)
        )
    }
}

/// Depth-first pre-order iterator over a subtree.
pub struct TreeIter {
    /// Nodes not yet yielded, most recent subtree first.
    stack: Vec<Element>,
    tag: Option<Rc<str>>,
}

impl Iterator for TreeIter {
    type Item = Element;

    fn next(&mut self) -> Option<Element> {
        while let Some(node) = self.stack.pop() {
            let mut kids = node.children();
            kids.reverse();
            self.stack.extend(kids);
            let hit = match &self.tag {
                Some(tag) => node.tag() == *tag,
                None => true,
            };
            if hit {
                return Some(node);
            }
        }
        None
    }
}

/// Deduplication table for [`Element::deep_copy`], keyed by source
/// identity.
#[derive(Default)]
pub struct CopyMemo {
    nodes: HashMap<usize, Element>,
    attrs: HashMap<usize, AttrMap>,
}

impl CopyMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of source nodes copied so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(tags: &[&str]) -> Vec<Element> {
        tags.iter().map(|t| Element::new(*t)).collect()
    }

    fn tags_of(el: &Element) -> Vec<String> {
        el.children().iter().map(|c| c.tag().to_string()).collect()
    }

    #[test]
    fn test_tag_split() {
        let plain = Element::new("a");
        assert_eq!(&*plain.local_name(), "a");
        assert!(plain.namespace_uri().is_none());

        let ns = Element::new("{http://x}leaf");
        assert_eq!(&*ns.local_name(), "leaf");
        assert_eq!(ns.namespace_uri().as_deref(), Some("http://x"));

        // Degenerate universal names keep the split rather than failing.
        let empty_local = Element::new("{u}");
        assert_eq!(&*empty_local.local_name(), "");
        assert_eq!(empty_local.namespace_uri().as_deref(), Some("u"));
    }

    #[test]
    fn test_set_tag_recomputes_split() {
        let el = Element::new("a");
        el.set_tag("{ns}b");
        assert_eq!(&*el.local_name(), "b");
        assert_eq!(el.namespace_uri().as_deref(), Some("ns"));
        el.set_tag("c");
        assert_eq!(&*el.local_name(), "c");
        assert!(el.namespace_uri().is_none());
    }

    #[test]
    fn test_text_absent_vs_empty() {
        let el = Element::new("a");
        assert!(el.text().is_none());
        el.set_text("");
        assert_eq!(el.text().as_deref(), Some(""));
        assert_eq!(el.take_text().as_deref(), Some(""));
        assert!(el.text().is_none());
    }

    #[test]
    fn test_attrs_lazy_storage() {
        let el = Element::new("a");
        assert!(!el.has_attr_storage());
        assert!(el.get_attr("x").is_none());
        assert!(el.attr_keys().is_empty());
        assert!(!el.has_attr_storage());

        el.set_attr("x", "1");
        assert!(el.has_attr_storage());
        assert_eq!(el.get_attr("x").as_deref(), Some("1"));
    }

    #[test]
    fn test_attr_order_and_overwrite() {
        let el = Element::new("a");
        el.set_attr("b", "1");
        el.set_attr("a", "2");
        el.set_attr("b", "3");
        let keys: Vec<_> = el.attr_keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, ["b", "a"]);
        assert_eq!(el.get_attr("b").as_deref(), Some("3"));
    }

    #[test]
    fn test_append_and_negative_index() {
        let root = Element::new("r");
        for c in named(&["a", "b", "c"]) {
            root.append(&c).unwrap();
        }
        assert_eq!(root.len(), 3);
        assert_eq!(&*root.get_item(-1).unwrap().tag(), "c");
        assert_eq!(&*root.get_item(0).unwrap().tag(), "a");
        assert!(matches!(
            root.get_item(3),
            Err(TreeError::IndexOutOfRange)
        ));
        assert!(matches!(
            root.get_item(-4),
            Err(TreeError::IndexOutOfRange)
        ));
    }

    #[test]
    fn test_insert_clamps() {
        let root = Element::new("r");
        for c in named(&["a", "b", "c"]) {
            root.append(&c).unwrap();
        }
        // Negative index is end-relative.
        root.insert(-1, &Element::new("x")).unwrap();
        assert_eq!(tags_of(&root), ["a", "b", "x", "c"]);
        // Far out-of-bounds snaps to the ends.
        root.insert(100, &Element::new("hi")).unwrap();
        root.insert(-100, &Element::new("lo")).unwrap();
        assert_eq!(tags_of(&root), ["lo", "a", "b", "x", "c", "hi"]);
    }

    #[test]
    fn test_set_and_delete_errors() {
        let root = Element::new("r");
        root.append(&Element::new("a")).unwrap();
        let err = root.set_item(5, &Element::new("x")).unwrap_err();
        assert_eq!(err.to_string(), "child assignment index out of range");
        let err = root.delete_item(-2).unwrap_err();
        assert_eq!(err.to_string(), "child assignment index out of range");
        let err = root.get_item(1).unwrap_err();
        assert_eq!(err.to_string(), "child index out of range");
    }

    #[test]
    fn test_remove_by_identity_then_value() {
        let root = Element::new("r");
        let a = Element::new("a");
        let twin = Element::new("a");
        root.append(&a).unwrap();
        root.append(&twin).unwrap();

        // Identity match removes the exact node even when an equal one
        // comes first.
        root.remove(&twin).unwrap();
        assert_eq!(root.len(), 1);
        assert!(Element::ptr_eq(&root.get_item(0).unwrap(), &a));

        // Value match removes an equal node.
        root.remove(&Element::new("a")).unwrap();
        assert!(root.is_empty());
    }

    #[test]
    fn test_remove_missing_leaves_list_intact() {
        let root = Element::new("r");
        for c in named(&["a", "b"]) {
            root.append(&c).unwrap();
        }
        let before = tags_of(&root);
        let err = root.remove(&Element::new("zzz")).unwrap_err();
        assert_eq!(err.to_string(), "list.remove(x): x not in list");
        assert_eq!(tags_of(&root), before);
    }

    #[test]
    fn test_slice_get() {
        let root = Element::new("r");
        for c in named(&["c0", "c1", "c2", "c3", "c4"]) {
            root.append(&c).unwrap();
        }
        let picked = root.get_slice(None, None, 2).unwrap();
        let tags: Vec<_> = picked.iter().map(|c| c.tag().to_string()).collect();
        assert_eq!(tags, ["c0", "c2", "c4"]);

        let rev = root.get_slice(None, None, -1).unwrap();
        let tags: Vec<_> = rev.iter().map(|c| c.tag().to_string()).collect();
        assert_eq!(tags, ["c4", "c3", "c2", "c1", "c0"]);
    }

    #[test]
    fn test_slice_assign_unit_step() {
        let root = Element::new("r");
        for c in named(&["c0", "c1", "c2", "c3", "c4"]) {
            root.append(&c).unwrap();
        }
        root.set_slice(Some(1), Some(3), 1, &named(&["a", "b", "c"]))
            .unwrap();
        assert_eq!(tags_of(&root), ["c0", "a", "b", "c", "c3", "c4"]);
    }

    #[test]
    fn test_slice_assign_reversed_bounds_inserts() {
        let root = Element::new("r");
        for c in named(&["c0", "c1", "c2", "c3", "c4", "c5"]) {
            root.append(&c).unwrap();
        }
        // stop < start selects nothing; assignment inserts at start and
        // keeps every existing child.
        root.set_slice(Some(5), Some(2), 1, &named(&["x"])).unwrap();
        assert_eq!(tags_of(&root), ["c0", "c1", "c2", "c3", "c4", "x", "c5"]);
    }

    #[test]
    fn test_slice_assign_extended() {
        let root = Element::new("r");
        for c in named(&["c0", "c1", "c2", "c3"]) {
            root.append(&c).unwrap();
        }
        let err = root
            .set_slice(None, None, 2, &named(&["y"]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "attempt to assign sequence of size 1 to extended slice of size 2"
        );

        root.set_slice(None, None, -2, &named(&["n1", "n2"])).unwrap();
        assert_eq!(tags_of(&root), ["c0", "n2", "c2", "n1"]);
    }

    #[test]
    fn test_slice_delete() {
        let root = Element::new("r");
        for c in named(&["c0", "c1", "c2", "c3", "c4", "c5"]) {
            root.append(&c).unwrap();
        }
        root.delete_slice(Some(4), Some(1), -2).unwrap();
        assert_eq!(tags_of(&root), ["c0", "c1", "c3", "c5"]);

        root.delete_slice(None, None, 1).unwrap();
        assert!(root.is_empty());
    }

    #[test]
    fn test_slice_roundtrip_identity() {
        let root = Element::new("r");
        for c in named(&["a", "b", "c"]) {
            root.append(&c).unwrap();
        }
        let all = root.get_slice(None, None, 1).unwrap();
        root.set_slice(None, None, 1, &all).unwrap();
        assert_eq!(tags_of(&root), ["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let root = Element::new("r");
        let child = Element::new("c");
        root.append(&child).unwrap();

        assert!(matches!(
            root.append(&root),
            Err(TreeError::CycleDetected)
        ));
        // Attaching an ancestor below a descendant is also a cycle.
        assert!(matches!(
            child.append(&root),
            Err(TreeError::CycleDetected)
        ));
        assert!(matches!(
            child.insert(0, &root),
            Err(TreeError::CycleDetected)
        ));
        assert_eq!(root.len(), 1);
    }

    #[test]
    fn test_extend_checks_each_child() {
        let root = Element::new("r");
        let ok = Element::new("x");
        let err = root.extend(&[ok.clone(), root.clone()]).unwrap_err();
        assert_eq!(err, TreeError::CycleDetected);
        // The valid prefix was appended before the failure surfaced.
        assert_eq!(root.len(), 1);
    }

    #[test]
    fn test_shallow_copy_shares_attrs_and_children() {
        let root = Element::new("r");
        root.set_attr("k", "v");
        let child = Element::new("c");
        root.append(&child).unwrap();
        root.set_text("t");

        let copy = root.shallow_copy();
        assert!(!Element::ptr_eq(&copy, &root));
        assert!(AttrMap::ptr_eq(&copy.attr_map(), &root.attr_map()));
        assert!(Element::ptr_eq(
            &copy.get_item(0).unwrap(),
            &root.get_item(0).unwrap()
        ));

        // The child lists are distinct even though the children are shared.
        copy.append(&Element::new("extra")).unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(copy.len(), 2);

        // A write through the shared attribute map is visible on both.
        copy.set_attr("k", "w");
        assert_eq!(root.get_attr("k").as_deref(), Some("w"));
    }

    #[test]
    fn test_deep_copy_breaks_identity() {
        let root = Element::new("r");
        root.set_attr("k", "v");
        let child = Element::new("c");
        child.set_text("hi");
        root.append(&child).unwrap();

        let copy = root.deep_clone();
        assert_eq!(copy, root);
        assert!(!Element::ptr_eq(&copy, &root));
        assert!(!Element::ptr_eq(
            &copy.get_item(0).unwrap(),
            &root.get_item(0).unwrap()
        ));
        assert!(!AttrMap::ptr_eq(&copy.attr_map(), &root.attr_map()));

        copy.get_item(0).unwrap().set_text("changed");
        assert_eq!(child.text().as_deref(), Some("hi"));
    }

    #[test]
    fn test_deep_copy_preserves_shared_structure() {
        // A child reachable from two parents copies once when the memo is
        // shared across both calls.
        let shared = Element::new("shared");
        let left = Element::new("left");
        let right = Element::new("right");
        left.append(&shared).unwrap();
        right.append(&shared).unwrap();

        let mut memo = CopyMemo::new();
        let left_copy = left.deep_copy(&mut memo);
        let right_copy = right.deep_copy(&mut memo);
        assert!(Element::ptr_eq(
            &left_copy.get_item(0).unwrap(),
            &right_copy.get_item(0).unwrap()
        ));
        assert_eq!(memo.len(), 3);
    }

    #[test]
    fn test_equality_semantics() {
        let a = Element::new("t");
        a.set_attr("x", "1");
        a.set_attr("y", "2");
        let b = Element::new("t");
        b.set_attr("y", "2");
        b.set_attr("x", "1");
        // Attribute order does not matter.
        assert_eq!(a, b);

        // Absent and empty attribute storage compare equal.
        let bare = Element::new("t");
        let materialized = Element::new("t");
        materialized.attr_map();
        assert_eq!(bare, materialized);

        b.set_text("");
        assert_ne!(a, b);
    }

    #[test]
    fn test_iter_and_itertext() {
        let root = Element::new("r");
        root.set_text("A");
        let b = Element::new("b");
        b.set_text("B");
        b.set_tail("after-b");
        root.append(&b).unwrap();
        let c = root.subelement("c", &AttrMap::new());
        c.set_text("C");
        let d = c.subelement("b", &AttrMap::new());
        d.set_text("D");

        let all: Vec<_> = root
            .iter(None)
            .map(|el| el.tag().to_string())
            .collect();
        assert_eq!(all, ["r", "b", "c", "b"]);

        let bs: Vec<_> = root
            .iter(Some("b"))
            .map(|el| el.tag().to_string())
            .collect();
        assert_eq!(bs, ["b", "b"]);

        let text: Vec<_> = root.itertext().iter().map(|t| t.to_string()).collect();
        assert_eq!(text, ["A", "B", "after-b", "C", "D"]);
    }

    #[test]
    fn test_clear() {
        let root = Element::new("r");
        root.set_attr("x", "1");
        root.set_text("t");
        root.set_tail("tl");
        root.append(&Element::new("c")).unwrap();

        root.clear();
        assert!(root.is_empty());
        assert!(root.text().is_none());
        assert!(root.tail().is_none());
        assert!(!root.has_attr_storage());
        assert_eq!(&*root.tag(), "r");
    }

    #[test]
    fn test_many_children_growth() {
        let root = Element::new("r");
        let kids: Vec<Element> = (0..40).map(|i| Element::new(format!("c{i}"))).collect();
        for c in &kids {
            root.append(c).unwrap();
        }
        assert_eq!(root.len(), 40);
        for (i, c) in kids.iter().enumerate() {
            assert!(Element::ptr_eq(&root.get_item(i as isize).unwrap(), c));
        }
    }
}
