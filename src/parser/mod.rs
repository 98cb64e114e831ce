//! Push parser wiring the tokenizer to a build target.
//!
//! [`XmlParser`] owns a [`Tokenizer`] and adapts its callbacks onto a
//! [`BuildTarget`], interning resolved names into `{uri}local` tag
//! strings along the way. The default target is [`TreeBuilder`], giving
//! whole-document parsing via [`parse_str`] and [`parse_reader`] and
//! incremental consumption via [`iterparse`]; custom targets receive the
//! raw callback stream instead.

pub mod events;

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Read;
use std::rc::Rc;

use log::debug;
use memchr::memchr;

use crate::error::XmlError;
use crate::scan::{ErrorCode, ParseError, Position, ScanAttr, TokenSink, Tokenizer};
use crate::tree::{AttrMap, Element, TreeBuilder};
use events::{new_queue, EventKind, EventQueue, ParseEvent};

/// Feed size used by [`iterparse`].
const ITER_CHUNK: usize = 16 * 1024;
/// Feed size used by [`parse_reader`].
const READ_CHUNK: usize = 64 * 1024;

/// Consumer of structural parse callbacks.
///
/// `start` receives the interned universal tag and the decoded
/// attributes; `attrs` is `None` when the tag carried none. Positions
/// are present when a parser drives the target and absent for manual
/// use. The non-structural callbacks default to ignoring the event.
pub trait BuildTarget {
    type Output;

    /// Whether `end` wants the resolved tag name. The standard tree
    /// builder closes by nesting alone, so the parser skips resolving
    /// end-tag names for it.
    const NEEDS_END_TAG: bool = true;

    fn start(
        &mut self,
        tag: Rc<str>,
        attrs: Option<AttrMap>,
        at: Option<Position>,
    ) -> Result<(), XmlError>;

    fn data(&mut self, text: Rc<str>) -> Result<(), XmlError>;

    fn end(&mut self, tag: &str, at: Option<Position>) -> Result<(), XmlError>;

    fn comment(&mut self, _text: &str) -> Result<(), XmlError> {
        Ok(())
    }

    fn pi(&mut self, _target: &str, _data: Option<&str>) -> Result<(), XmlError> {
        Ok(())
    }

    fn doctype(
        &mut self,
        _name: &str,
        _public_id: Option<&str>,
        _system_id: Option<&str>,
    ) -> Result<(), XmlError> {
        Ok(())
    }

    /// End of input. Returns whatever the target was building.
    fn close(&mut self) -> Result<Self::Output, XmlError>;
}

impl BuildTarget for TreeBuilder {
    type Output = Option<Element>;

    const NEEDS_END_TAG: bool = false;

    fn start(
        &mut self,
        tag: Rc<str>,
        attrs: Option<AttrMap>,
        at: Option<Position>,
    ) -> Result<(), XmlError> {
        TreeBuilder::start(self, tag, attrs, at)?;
        Ok(())
    }

    fn data(&mut self, text: Rc<str>) -> Result<(), XmlError> {
        TreeBuilder::data(self, text);
        Ok(())
    }

    fn end(&mut self, _tag: &str, at: Option<Position>) -> Result<(), XmlError> {
        TreeBuilder::end(self, at)?;
        Ok(())
    }

    fn close(&mut self) -> Result<Self::Output, XmlError> {
        Ok(TreeBuilder::close(self))
    }
}

/// Adapts tokenizer callbacks onto a build target: name interning,
/// entity substitution, and namespace event emission.
struct ParserSink<T: BuildTarget> {
    target: T,
    /// Interned tag strings keyed by the resolved name bytes.
    names: HashMap<Vec<u8>, Rc<str>>,
    /// Substitutions for named entities beyond the predefined five.
    entities: HashMap<String, String>,
    queue: Option<EventQueue>,
    emit_start_ns: bool,
    emit_end_ns: bool,
}

impl<T: BuildTarget> ParserSink<T> {
    fn new(target: T) -> Self {
        ParserSink {
            target,
            names: HashMap::new(),
            entities: HashMap::new(),
            queue: None,
            emit_start_ns: false,
            emit_end_ns: false,
        }
    }

    /// Tag string for resolved name bytes: `uri}local` becomes
    /// `{uri}local`, plain names pass through. Interned per parser.
    fn intern(&mut self, raw: &[u8], at: Position) -> Result<Rc<str>, XmlError> {
        if let Some(name) = self.names.get(raw) {
            return Ok(name.clone());
        }
        let text = std::str::from_utf8(raw)
            .map_err(|_| ParseError::new(ErrorCode::InvalidToken, at))?;
        let name: Rc<str> = if memchr(b'}', raw).is_some() {
            let mut tag = String::with_capacity(text.len() + 1);
            tag.push('{');
            tag.push_str(text);
            tag.into()
        } else {
            Rc::from(text)
        };
        self.names.insert(raw.to_vec(), name.clone());
        Ok(name)
    }
}

impl<T: BuildTarget> TokenSink for ParserSink<T> {
    fn start_element(
        &mut self,
        name: Cow<'_, [u8]>,
        attrs: &[ScanAttr<'_>],
        at: Position,
    ) -> Result<(), XmlError> {
        let tag = self.intern(&name, at)?;
        let attr_map = if attrs.is_empty() {
            None
        } else {
            let map = AttrMap::new();
            for attr in attrs {
                let key = self.intern(&attr.name, at)?;
                map.set(key, attr.value.as_ref());
            }
            Some(map)
        };
        self.target.start(tag, attr_map, Some(at))
    }

    fn end_element(&mut self, name: Cow<'_, [u8]>, at: Position) -> Result<(), XmlError> {
        if T::NEEDS_END_TAG {
            let tag = self.intern(&name, at)?;
            self.target.end(&tag, Some(at))
        } else {
            self.target.end("", Some(at))
        }
    }

    fn characters(&mut self, text: Cow<'_, str>, _at: Position) -> Result<(), XmlError> {
        self.target.data(Rc::from(text.as_ref()))
    }

    fn entity_ref(&mut self, name: &str, at: Position) -> Result<(), XmlError> {
        match self.entities.get(name) {
            Some(value) => {
                let text: Rc<str> = Rc::from(value.as_str());
                self.target.data(text)
            }
            None => Err(ParseError::undefined_entity(name, at).into()),
        }
    }

    fn namespace_start(&mut self, prefix: Option<&str>, uri: &str) -> Result<(), XmlError> {
        if self.emit_start_ns {
            if let Some(queue) = &self.queue {
                queue.borrow_mut().push_back(ParseEvent::StartNs {
                    prefix: Rc::from(prefix.unwrap_or("")),
                    uri: Rc::from(uri),
                });
            }
        }
        Ok(())
    }

    fn namespace_end(&mut self, _prefix: Option<&str>) -> Result<(), XmlError> {
        if self.emit_end_ns {
            if let Some(queue) = &self.queue {
                queue.borrow_mut().push_back(ParseEvent::EndNs);
            }
        }
        Ok(())
    }

    fn comment(&mut self, text: Cow<'_, str>, _at: Position) -> Result<(), XmlError> {
        self.target.comment(&text)
    }

    fn processing_instruction(
        &mut self,
        target: &str,
        data: Option<&str>,
        _at: Position,
    ) -> Result<(), XmlError> {
        self.target.pi(target, data)
    }

    fn doctype(
        &mut self,
        name: &str,
        public_id: Option<&str>,
        system_id: Option<&str>,
        _at: Position,
    ) -> Result<(), XmlError> {
        self.target.doctype(name, public_id, system_id)
    }
}

/// Incremental push parser.
///
/// Feed byte chunks with [`XmlParser::feed`] and finish with
/// [`XmlParser::close`]. After an error the parser is poisoned: every
/// further call returns the same error.
pub struct XmlParser<T: BuildTarget = TreeBuilder> {
    scan: Tokenizer,
    sink: ParserSink<T>,
    err: Option<XmlError>,
}

impl XmlParser<TreeBuilder> {
    pub fn new() -> XmlParser<TreeBuilder> {
        XmlParser::with_target(TreeBuilder::new())
    }

    /// Route parse events into `queue`. `kinds` selects which of the
    /// start/end/namespace events are produced.
    pub fn set_events(&mut self, queue: EventQueue, kinds: &[EventKind]) {
        self.sink.emit_start_ns = kinds.contains(&EventKind::StartNs);
        self.sink.emit_end_ns = kinds.contains(&EventKind::EndNs);
        self.sink.queue = Some(queue.clone());
        self.sink.target.set_events(queue, kinds);
    }
}

impl<T: BuildTarget> XmlParser<T> {
    pub fn with_target(target: T) -> XmlParser<T> {
        XmlParser {
            scan: Tokenizer::new(),
            sink: ParserSink::new(target),
            err: None,
        }
    }

    pub fn target(&self) -> &T {
        &self.sink.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.sink.target
    }

    /// Substitution table for named entities beyond the predefined five,
    /// keyed without the `&`/`;` delimiters.
    pub fn entities(&self) -> &HashMap<String, String> {
        &self.sink.entities
    }

    pub fn entities_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.sink.entities
    }

    /// Line of the first unconsumed byte (1-based).
    pub fn line(&self) -> u64 {
        self.scan.line()
    }

    /// Column of the first unconsumed byte (0-based, in characters).
    pub fn column(&self) -> u64 {
        self.scan.column()
    }

    /// Absolute byte offset of the first unconsumed byte.
    pub fn byte_index(&self) -> u64 {
        self.scan.byte_index()
    }

    pub fn feed(&mut self, chunk: impl AsRef<[u8]>) -> Result<(), XmlError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        match self.scan.feed(&mut self.sink, chunk.as_ref()) {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!("parse aborted: {err}");
                self.err = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Finish the document and return the target's output. Callable more
    /// than once; later calls hand back the same output or error.
    pub fn close(&mut self) -> Result<T::Output, XmlError> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        match self.scan.close(&mut self.sink) {
            Ok(()) => self.sink.target.close(),
            Err(err) => {
                debug!("document incomplete: {err}");
                self.err = Some(err.clone());
                Err(err)
            }
        }
    }
}

impl Default for XmlParser<TreeBuilder> {
    fn default() -> Self {
        XmlParser::new()
    }
}

/// Parse a complete document from a string.
pub fn parse_str(text: &str) -> Result<Element, XmlError> {
    let mut parser = XmlParser::new();
    parser.feed(text)?;
    match parser.close()? {
        Some(root) => Ok(root),
        None => unreachable!("a closed document always has a root"),
    }
}

/// Parse a complete document from a reader, feeding in large chunks.
pub fn parse_reader(mut source: impl Read) -> Result<Element, XmlError> {
    let mut parser = XmlParser::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        parser.feed(&buf[..n])?;
    }
    match parser.close()? {
        Some(root) => Ok(root),
        None => unreachable!("a closed document always has a root"),
    }
}

/// Incrementally parse `source`, yielding the selected event kinds as
/// they become available. With an empty `kinds` only end events are
/// produced.
pub fn iterparse<R: Read>(source: R, kinds: &[EventKind]) -> IterParse<R> {
    IterParse::new(source, kinds)
}

/// Iterator over parse events; see [`iterparse`].
///
/// Events already produced are yielded before any error. After the
/// iterator is exhausted the completed tree is available from
/// [`IterParse::root`].
pub struct IterParse<R: Read> {
    parser: XmlParser<TreeBuilder>,
    source: R,
    queue: EventQueue,
    buf: Vec<u8>,
    root: Option<Element>,
    pending_err: Option<XmlError>,
    finished: bool,
}

impl<R: Read> IterParse<R> {
    pub fn new(source: R, kinds: &[EventKind]) -> IterParse<R> {
        let mut parser = XmlParser::new();
        let queue = new_queue();
        if kinds.is_empty() {
            parser.set_events(queue.clone(), &[EventKind::End]);
        } else {
            parser.set_events(queue.clone(), kinds);
        }
        IterParse {
            parser,
            source,
            queue,
            buf: vec![0u8; ITER_CHUNK],
            root: None,
            pending_err: None,
            finished: false,
        }
    }

    /// The completed tree, once the document has been fully consumed.
    pub fn root(&self) -> Option<Element> {
        self.root.clone()
    }
}

impl<R: Read> Iterator for IterParse<R> {
    type Item = Result<ParseEvent, XmlError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.queue.borrow_mut().pop_front() {
                return Some(Ok(event));
            }
            if let Some(err) = self.pending_err.take() {
                return Some(Err(err));
            }
            if self.finished {
                return None;
            }
            match self.source.read(&mut self.buf) {
                Ok(0) => {
                    self.finished = true;
                    match self.parser.close() {
                        Ok(root) => self.root = root,
                        Err(err) => self.pending_err = Some(err),
                    }
                }
                Ok(n) => {
                    if let Err(err) = self.parser.feed(&self.buf[..n]) {
                        self.finished = true;
                        self.pending_err = Some(err);
                    }
                }
                Err(err) => {
                    self.finished = true;
                    self.pending_err = Some(err.into());
                }
            }
        }
    }
}
