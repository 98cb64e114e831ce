//! Incremental tokenizer state machine
//!
//! Consumes byte chunks in arbitrary splits and dispatches complete lexical
//! constructs to a [`TokenSink`]. Incomplete constructs stay buffered until
//! more input arrives; text runs are flushed eagerly up to the last safely
//! decodable byte so huge runs do not pin the whole document in memory.
//!
//! Namespace declarations are resolved here. In-scope bindings live on a
//! flat stack with a per-element declaration count, pushed before the
//! element's start callback and popped after its end callback.

use std::borrow::Cow;
use std::str;

use log::trace;
use memchr::{memchr, memrchr};

use super::cursor::{is_name_start_char, is_whitespace, Cursor, PosTracker};
use super::entities::{self, Resolved};
use super::{ErrorCode, ParseError, Position, ScanAttr, TokenSink};
use crate::error::XmlError;

const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// Result of attempting one construct at the head of the buffer.
enum Step {
    /// Not enough input yet; retain from the construct start.
    Incomplete(Unclosed),
    /// Construct handled; continue at this offset.
    Consumed(usize),
}

#[derive(Clone, Copy)]
enum Unclosed {
    Token,
    Cdata,
}

/// One in-scope namespace binding. An empty uri undeclares the default
/// namespace for the subtree.
struct NsDecl {
    prefix: Option<String>,
    uri: String,
}

/// Feed-driven XML tokenizer.
///
/// After any returned error the tokenizer must not be fed again; the parser
/// adapter layer enforces that.
pub struct Tokenizer {
    /// Unconsumed input.
    buf: Vec<u8>,
    /// Source position of `buf[0]`.
    base: PosTracker,
    /// Raw names of currently open elements.
    open: Vec<Vec<u8>>,
    /// Flat stack of in-scope namespace declarations.
    ns_stack: Vec<NsDecl>,
    /// Declarations contributed by each open element.
    ns_counts: Vec<usize>,
    saw_root: bool,
    root_closed: bool,
    finished: bool,
    /// 3 when the input began with a UTF-8 byte order mark, else 0. An XML
    /// declaration is only legal immediately after it.
    bom_len: u64,
}

impl Tokenizer {
    pub fn new() -> Self {
        Tokenizer {
            buf: Vec::with_capacity(8192),
            base: PosTracker::new(),
            open: Vec::new(),
            ns_stack: Vec::new(),
            ns_counts: Vec::new(),
            saw_root: false,
            root_closed: false,
            finished: false,
            bom_len: 0,
        }
    }

    /// Line of the first unconsumed byte (1-based).
    pub fn line(&self) -> u64 {
        self.base.position().line
    }

    /// Column of the first unconsumed byte (0-based, in characters).
    pub fn column(&self) -> u64 {
        self.base.position().column
    }

    /// Absolute byte offset of the first unconsumed byte.
    pub fn byte_index(&self) -> u64 {
        self.base.position().byte
    }

    /// Feed one chunk. Dispatches every construct that is complete after
    /// appending the chunk.
    pub fn feed<S: TokenSink>(&mut self, sink: &mut S, chunk: &[u8]) -> Result<(), XmlError> {
        self.buf.extend_from_slice(chunk);
        self.process(sink, false)
    }

    /// Signal end of input. Flushes the remainder of the buffer and checks
    /// that a complete document was seen. Idempotent.
    pub fn close<S: TokenSink>(&mut self, sink: &mut S) -> Result<(), XmlError> {
        if self.finished {
            return Ok(());
        }
        let res = self.process(sink, true);
        self.finished = true;
        res
    }

    fn process<S: TokenSink>(&mut self, sink: &mut S, final_: bool) -> Result<(), XmlError> {
        // Take the buffer so construct parsers can borrow it while the
        // namespace and element stacks are mutated.
        let buf = std::mem::take(&mut self.buf);
        match self.run_pass(sink, &buf, final_) {
            Ok(consumed) => {
                trace!("pass consumed {consumed} of {} buffered bytes", buf.len());
                self.buf = buf;
                self.buf.drain(..consumed);
                Ok(())
            }
            Err(e) => {
                self.buf = buf;
                Err(e)
            }
        }
    }

    /// One dispatch pass over `buf`. Returns how many bytes were consumed.
    fn run_pass<S: TokenSink>(
        &mut self,
        sink: &mut S,
        buf: &[u8],
        final_: bool,
    ) -> Result<usize, XmlError> {
        let mut at = 0usize;
        let mut run = self.base.clone();

        // A UTF-8 byte order mark may precede the first construct.
        const BOM: &[u8] = b"\xEF\xBB\xBF";
        if run.position().byte == 0 && !buf.is_empty() && buf.starts_with(&BOM[..buf.len().min(3)])
        {
            if buf.len() >= 3 {
                run.advance(&buf[..3]);
                at = 3;
                self.bom_len = 3;
            } else if !final_ {
                return Ok(0);
            }
        }

        while at < buf.len() {
            let step = if buf[at] == b'<' {
                self.markup(sink, buf, at, &run)?
            } else {
                self.text(sink, buf, at, &run, final_)?
            };
            match step {
                Step::Consumed(end) => {
                    run.advance(&buf[at..end]);
                    at = end;
                }
                Step::Incomplete(kind) => {
                    if final_ {
                        let code = match kind {
                            Unclosed::Token => ErrorCode::UnclosedToken,
                            Unclosed::Cdata => ErrorCode::UnclosedCdata,
                        };
                        return Err(ParseError::new(code, run.position()).into());
                    }
                    break;
                }
            }
        }

        if final_ && (!self.saw_root || !self.open.is_empty()) {
            return Err(ParseError::new(ErrorCode::NoElements, run.position()).into());
        }

        self.base = run;
        Ok(at)
    }

    // ================================================================
    // Markup constructs
    // ================================================================

    fn markup<S: TokenSink>(
        &mut self,
        sink: &mut S,
        buf: &[u8],
        at: usize,
        run: &PosTracker,
    ) -> Result<Step, XmlError> {
        let Some(&next) = buf.get(at + 1) else {
            return Ok(Step::Incomplete(Unclosed::Token));
        };
        match next {
            b'/' => self.end_tag(sink, buf, at, run),
            b'?' => self.instruction(sink, buf, at, run),
            b'!' => self.bang(sink, buf, at, run),
            c if is_name_start_char(c) => self.start_tag(sink, buf, at, run),
            _ => Err(err_at(ErrorCode::InvalidToken, run, buf, at, at + 1)),
        }
    }

    fn start_tag<S: TokenSink>(
        &mut self,
        sink: &mut S,
        buf: &[u8],
        at: usize,
        run: &PosTracker,
    ) -> Result<Step, XmlError> {
        let gt = {
            let mut probe = Cursor::new(buf);
            probe.set_position(at);
            match probe.find_tag_end_quoted() {
                Some(p) => p,
                None => return Ok(Step::Incomplete(Unclosed::Token)),
            }
        };

        let raw = parse_start_tag(buf, at, gt)
            .map_err(|(code, off)| err_at(code, run, buf, at, off))?;

        // Partition attributes into namespace declarations and the rest,
        // pushing declarations into scope before any name is resolved.
        let mut decl_count = 0usize;
        let mut plain: Vec<&RawAttr<'_>> = Vec::with_capacity(raw.attrs.len());
        for attr in &raw.attrs {
            if let Some(prefix) = xmlns_prefix(attr.name) {
                let prefix = match prefix {
                    Some(p) => {
                        let p = str::from_utf8(p).map_err(|_| {
                            err_at(ErrorCode::InvalidToken, run, buf, at, attr.name_off)
                        })?;
                        if p.is_empty() || p == "xmlns" {
                            return Err(err_at(
                                ErrorCode::InvalidToken,
                                run,
                                buf,
                                at,
                                attr.name_off,
                            ));
                        }
                        Some(p.to_string())
                    }
                    None => None,
                };
                let uri = decode_attr_value(buf, run, at, attr.value_off, attr.value)?
                    .into_owned();
                self.ns_stack.push(NsDecl { prefix, uri });
                decl_count += 1;
            } else {
                plain.push(attr);
            }
        }

        for d in &self.ns_stack[self.ns_stack.len() - decl_count..] {
            sink.namespace_start(d.prefix.as_deref(), &d.uri)?;
        }

        let name = self
            .resolve_name(raw.name, true)
            .map_err(|code| err_at(code, run, buf, at, raw.name_off))?;

        let mut attrs: Vec<ScanAttr<'_>> = Vec::with_capacity(plain.len());
        for attr in plain {
            let resolved = self
                .resolve_name(attr.name, false)
                .map_err(|code| err_at(code, run, buf, at, attr.name_off))?;
            let value = decode_attr_value(buf, run, at, attr.value_off, attr.value)?;
            attrs.push(ScanAttr {
                name: resolved,
                value,
            });
        }

        if self.open.is_empty() && !self.saw_root {
            self.saw_root = true;
        }

        let pos = run.position();
        sink.start_element(name.clone(), &attrs, pos)?;

        if raw.self_closing {
            sink.end_element(name, pos)?;
            self.pop_declarations(sink, decl_count)?;
            if self.open.is_empty() {
                self.root_closed = true;
            }
        } else {
            self.open.push(raw.name.to_vec());
            self.ns_counts.push(decl_count);
        }

        Ok(Step::Consumed(gt + 1))
    }

    fn end_tag<S: TokenSink>(
        &mut self,
        sink: &mut S,
        buf: &[u8],
        at: usize,
        run: &PosTracker,
    ) -> Result<Step, XmlError> {
        if self.root_closed {
            return Err(err_at(ErrorCode::JunkAfterDocElement, run, buf, at, at));
        }
        let mut cur = Cursor::new(buf);
        cur.set_position(at + 2);
        let Some(gt) = cur.find_byte(b'>') else {
            return Ok(Step::Incomplete(Unclosed::Token));
        };

        let name_off = at + 2;
        let name = cur
            .read_name()
            .ok_or_else(|| err_at(ErrorCode::InvalidToken, run, buf, at, name_off))?;
        cur.skip_whitespace();
        if cur.position() != gt {
            return Err(err_at(ErrorCode::InvalidToken, run, buf, at, cur.position()));
        }

        match self.open.last() {
            Some(open) if open.as_slice() == name => {}
            _ => return Err(err_at(ErrorCode::MismatchedTag, run, buf, at, name_off)),
        }

        // Resolve while this element's declarations are still in scope.
        let resolved = self
            .resolve_name(name, true)
            .map_err(|code| err_at(code, run, buf, at, name_off))?;
        sink.end_element(resolved, run.position())?;

        let count = self.ns_counts.pop().unwrap_or(0);
        self.pop_declarations(sink, count)?;
        self.open.pop();
        if self.open.is_empty() {
            self.root_closed = true;
        }

        Ok(Step::Consumed(gt + 1))
    }

    /// Emit end callbacks for the `count` innermost declarations and drop
    /// them from scope, innermost first.
    fn pop_declarations<S: TokenSink>(
        &mut self,
        sink: &mut S,
        count: usize,
    ) -> Result<(), XmlError> {
        for _ in 0..count {
            if let Some(d) = self.ns_stack.pop() {
                sink.namespace_end(d.prefix.as_deref())?;
            }
        }
        Ok(())
    }

    fn bang<S: TokenSink>(
        &mut self,
        sink: &mut S,
        buf: &[u8],
        at: usize,
        run: &PosTracker,
    ) -> Result<Step, XmlError> {
        let rest = &buf[at..];
        match opener(rest, b"<!--") {
            Opener::Yes => return self.comment(sink, buf, at, run),
            Opener::Partial => return Ok(Step::Incomplete(Unclosed::Token)),
            Opener::No => {}
        }
        match opener(rest, b"<![CDATA[") {
            Opener::Yes => return self.cdata(sink, buf, at, run),
            Opener::Partial => return Ok(Step::Incomplete(Unclosed::Token)),
            Opener::No => {}
        }
        match opener(rest, b"<!DOCTYPE") {
            Opener::Yes => return self.doctype(sink, buf, at, run),
            Opener::Partial => return Ok(Step::Incomplete(Unclosed::Token)),
            Opener::No => {}
        }
        Err(err_at(ErrorCode::InvalidToken, run, buf, at, at + 1))
    }

    fn comment<S: TokenSink>(
        &mut self,
        sink: &mut S,
        buf: &[u8],
        at: usize,
        run: &PosTracker,
    ) -> Result<Step, XmlError> {
        let mut cur = Cursor::new(buf);
        cur.set_position(at + 4);
        let Some(close) = cur.find_subslice(b"-->") else {
            return Ok(Step::Incomplete(Unclosed::Token));
        };
        // "--" must not appear inside the comment body.
        cur.set_position(at + 4);
        if let Some(dd) = cur.find_subslice(b"--") {
            if dd < close {
                return Err(err_at(ErrorCode::InvalidToken, run, buf, at, dd));
            }
        }
        let text = normalize_plain(buf, run, at, at + 4..close)?;
        sink.comment(text, run.position())?;
        Ok(Step::Consumed(close + 3))
    }

    fn cdata<S: TokenSink>(
        &mut self,
        sink: &mut S,
        buf: &[u8],
        at: usize,
        run: &PosTracker,
    ) -> Result<Step, XmlError> {
        if self.open.is_empty() {
            let code = if self.root_closed {
                ErrorCode::JunkAfterDocElement
            } else {
                ErrorCode::Syntax
            };
            return Err(err_at(code, run, buf, at, at));
        }
        let mut cur = Cursor::new(buf);
        cur.set_position(at + 9);
        let Some(close) = cur.find_subslice(b"]]>") else {
            return Ok(Step::Incomplete(Unclosed::Cdata));
        };
        deliver_text(sink, buf, run, at, at + 9..close, false)?;
        Ok(Step::Consumed(close + 3))
    }

    fn doctype<S: TokenSink>(
        &mut self,
        sink: &mut S,
        buf: &[u8],
        at: usize,
        run: &PosTracker,
    ) -> Result<Step, XmlError> {
        let Some(gt) = doctype_end(buf, at + 9) else {
            return Ok(Step::Incomplete(Unclosed::Token));
        };
        if self.saw_root {
            let code = if self.root_closed {
                ErrorCode::JunkAfterDocElement
            } else {
                ErrorCode::Syntax
            };
            return Err(err_at(code, run, buf, at, at));
        }

        let mut cur = Cursor::new(&buf[..gt]);
        cur.set_position(at + 9);
        cur.skip_whitespace();
        let name_off = cur.position();
        let name = cur
            .read_name()
            .ok_or_else(|| err_at(ErrorCode::InvalidToken, run, buf, at, name_off))?;
        let name = utf8_span(buf, run, at, name_off, name)?;

        let mut public_id = None;
        let mut system_id = None;
        cur.skip_whitespace();
        if cur.starts_with(b"SYSTEM") {
            cur.advance(6);
            cur.skip_whitespace();
            system_id = Some(read_quoted(&mut cur, buf, run, at)?);
        } else if cur.starts_with(b"PUBLIC") {
            cur.advance(6);
            cur.skip_whitespace();
            public_id = Some(read_quoted(&mut cur, buf, run, at)?);
            cur.skip_whitespace();
            if matches!(cur.peek(), Some(b'"') | Some(b'\'')) {
                system_id = Some(read_quoted(&mut cur, buf, run, at)?);
            }
        }
        // The internal subset, if any, is skipped without being reported.

        sink.doctype(name, public_id.as_deref(), system_id.as_deref(), run.position())?;
        Ok(Step::Consumed(gt + 1))
    }

    fn instruction<S: TokenSink>(
        &mut self,
        sink: &mut S,
        buf: &[u8],
        at: usize,
        run: &PosTracker,
    ) -> Result<Step, XmlError> {
        let mut cur = Cursor::new(buf);
        cur.set_position(at + 2);
        let Some(close) = cur.find_subslice(b"?>") else {
            return Ok(Step::Incomplete(Unclosed::Token));
        };

        let target_off = at + 2;
        let target = {
            let mut tc = Cursor::new(&buf[..close]);
            tc.set_position(target_off);
            let t = tc
                .read_name()
                .ok_or_else(|| err_at(ErrorCode::InvalidToken, run, buf, at, target_off))?;
            (t, tc.position())
        };
        let (target_bytes, after_target) = target;

        if target_bytes.eq_ignore_ascii_case(b"xml") {
            if run.position().byte != self.bom_len {
                return Err(err_at(ErrorCode::MisplacedXmlDecl, run, buf, at, at));
            }
            check_xml_declaration(buf, run, at, after_target..close)?;
            return Ok(Step::Consumed(close + 2));
        }

        let target_str = utf8_span(buf, run, at, target_off, target_bytes)?;
        let mut data_start = after_target;
        while data_start < close && is_whitespace(buf[data_start]) {
            data_start += 1;
        }
        let data = if data_start < close {
            Some(normalize_plain(buf, run, at, data_start..close)?)
        } else {
            None
        };
        sink.processing_instruction(target_str, data.as_deref(), run.position())?;
        Ok(Step::Consumed(close + 2))
    }

    // ================================================================
    // Character data
    // ================================================================

    fn text<S: TokenSink>(
        &mut self,
        sink: &mut S,
        buf: &[u8],
        at: usize,
        run: &PosTracker,
        final_: bool,
    ) -> Result<Step, XmlError> {
        let end = match memchr(b'<', &buf[at..]) {
            Some(i) => at + i,
            None => buf.len(),
        };
        let complete = end < buf.len() || final_;

        if self.open.is_empty() {
            // Outside the document element only whitespace is allowed, and
            // nothing is reported.
            if let Some(bad) = buf[at..end].iter().position(|&b| !is_whitespace(b)) {
                let code = if self.root_closed {
                    ErrorCode::JunkAfterDocElement
                } else {
                    ErrorCode::Syntax
                };
                return Err(err_at(code, run, buf, at, at + bad));
            }
            return Ok(Step::Consumed(end));
        }

        if complete {
            deliver_text(sink, buf, run, at, at..end, true)?;
            return Ok(Step::Consumed(end));
        }

        // Partial run: flush the prefix that cannot be altered by future
        // input (no split entity reference, UTF-8 sequence, CR pair, or
        // "]]>" check).
        let safe = safe_text_len(&buf[at..end]);
        if safe == 0 {
            return Ok(Step::Incomplete(Unclosed::Token));
        }
        deliver_text(sink, buf, run, at, at..at + safe, true)?;
        Ok(Step::Consumed(at + safe))
    }

    // ================================================================
    // Namespace resolution
    // ================================================================

    /// Resolve a raw name against in-scope declarations, producing
    /// `uri}local` bytes (or the raw name when no namespace applies).
    /// The default namespace applies to elements only.
    fn resolve_name<'b>(
        &self,
        raw: &'b [u8],
        use_default: bool,
    ) -> Result<Cow<'b, [u8]>, ErrorCode> {
        match memchr(b':', raw) {
            Some(colon) => {
                let prefix = &raw[..colon];
                let local = &raw[colon + 1..];
                if prefix == b"xml" {
                    return Ok(universal(XML_NAMESPACE, local));
                }
                for d in self.ns_stack.iter().rev() {
                    if d.prefix.as_deref().map(str::as_bytes) == Some(prefix) {
                        if d.uri.is_empty() {
                            return Err(ErrorCode::UnboundPrefix);
                        }
                        return Ok(universal(&d.uri, local));
                    }
                }
                Err(ErrorCode::UnboundPrefix)
            }
            None => {
                if use_default {
                    for d in self.ns_stack.iter().rev() {
                        if d.prefix.is_none() {
                            if d.uri.is_empty() {
                                break;
                            }
                            return Ok(universal(&d.uri, raw));
                        }
                    }
                }
                Ok(Cow::Borrowed(raw))
            }
        }
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

fn universal(uri: &str, local: &[u8]) -> Cow<'static, [u8]> {
    let mut name = Vec::with_capacity(uri.len() + 1 + local.len());
    name.extend_from_slice(uri.as_bytes());
    name.push(b'}');
    name.extend_from_slice(local);
    Cow::Owned(name)
}

/// Whether `name` declares a namespace: `xmlns` (default, returns
/// `Some(None)`) or `xmlns:prefix` (returns `Some(Some(prefix))`).
fn xmlns_prefix(name: &[u8]) -> Option<Option<&[u8]>> {
    if name == b"xmlns" {
        Some(None)
    } else if let Some(rest) = name.strip_prefix(b"xmlns:") {
        Some(Some(rest))
    } else {
        None
    }
}

enum Opener {
    Yes,
    /// The buffer ends inside the opener; more input decides.
    Partial,
    No,
}

fn opener(rest: &[u8], full: &[u8]) -> Opener {
    if rest.len() >= full.len() {
        if &rest[..full.len()] == full {
            Opener::Yes
        } else {
            Opener::No
        }
    } else if full.starts_with(rest) {
        Opener::Partial
    } else {
        Opener::No
    }
}

struct RawTag<'b> {
    name: &'b [u8],
    name_off: usize,
    attrs: Vec<RawAttr<'b>>,
    self_closing: bool,
}

struct RawAttr<'b> {
    name: &'b [u8],
    name_off: usize,
    value: &'b [u8],
    value_off: usize,
}

/// Pure parse of a start tag between `<` at `at` and the unquoted `>` at
/// `gt`. Errors carry the code and the offending offset.
fn parse_start_tag(buf: &[u8], at: usize, gt: usize) -> Result<RawTag<'_>, (ErrorCode, usize)> {
    let mut cur = Cursor::new(&buf[..gt]);
    cur.set_position(at + 1);

    let name_off = cur.position();
    let name = cur
        .read_name()
        .ok_or((ErrorCode::InvalidToken, name_off))?;

    let mut attrs: Vec<RawAttr<'_>> = Vec::new();
    let mut self_closing = false;

    loop {
        cur.skip_whitespace();
        let Some(b) = cur.peek() else {
            break;
        };
        if b == b'/' {
            if cur.position() + 1 != gt {
                return Err((ErrorCode::InvalidToken, cur.position()));
            }
            self_closing = true;
            break;
        }

        let attr_off = cur.position();
        let attr_name = cur
            .read_name()
            .ok_or((ErrorCode::InvalidToken, attr_off))?;
        cur.skip_whitespace();
        if cur.peek() != Some(b'=') {
            return Err((ErrorCode::InvalidToken, cur.position()));
        }
        cur.advance(1);
        cur.skip_whitespace();
        let quote = match cur.peek() {
            Some(q @ (b'"' | b'\'')) => q,
            _ => return Err((ErrorCode::InvalidToken, cur.position())),
        };
        cur.advance(1);
        let value_off = cur.position();
        let close = cur
            .find_byte(quote)
            .ok_or((ErrorCode::UnclosedToken, value_off))?;
        let value = cur.slice(value_off, close);
        if let Some(lt) = memchr(b'<', value) {
            return Err((ErrorCode::InvalidToken, value_off + lt));
        }
        if attrs.iter().any(|a| a.name == attr_name) {
            return Err((ErrorCode::DuplicateAttribute, attr_off));
        }
        attrs.push(RawAttr {
            name: attr_name,
            name_off: attr_off,
            value,
            value_off,
        });
        cur.set_position(close + 1);
    }

    Ok(RawTag {
        name,
        name_off,
        attrs,
        self_closing,
    })
}

/// Find the `>` closing a DOCTYPE, skipping quoted literals and the
/// bracketed internal subset. None while incomplete.
fn doctype_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_single = false;
    let mut in_double = false;
    for (i, &b) in buf.iter().enumerate().skip(from) {
        match b {
            b'"' if !in_single => in_double = !in_double,
            b'\'' if !in_double => in_single = !in_single,
            b'[' if !in_single && !in_double => depth += 1,
            b']' if !in_single && !in_double => depth -= 1,
            b'>' if !in_single && !in_double && depth <= 0 => return Some(i),
            _ => {}
        }
    }
    None
}

fn read_quoted<'b>(
    cur: &mut Cursor<'b>,
    buf: &[u8],
    run: &PosTracker,
    cstart: usize,
) -> Result<String, XmlError> {
    let quote = match cur.peek() {
        Some(q @ (b'"' | b'\'')) => q,
        _ => return Err(err_at(ErrorCode::InvalidToken, run, buf, cstart, cur.position())),
    };
    cur.advance(1);
    let start = cur.position();
    let close = cur
        .find_byte(quote)
        .ok_or_else(|| err_at(ErrorCode::InvalidToken, run, buf, cstart, start))?;
    let lit = utf8_span(buf, run, cstart, start, cur.slice(start, close))?;
    cur.set_position(close + 1);
    Ok(lit.to_string())
}

/// Validate the pseudo-attributes of an XML declaration. Only the encoding
/// is checked: anything outside the UTF-8 family is rejected.
fn check_xml_declaration(
    buf: &[u8],
    run: &PosTracker,
    cstart: usize,
    body: std::ops::Range<usize>,
) -> Result<(), XmlError> {
    let mut cur = Cursor::new(&buf[..body.end]);
    cur.set_position(body.start);
    loop {
        cur.skip_whitespace();
        if cur.is_eof() {
            return Ok(());
        }
        let Some(key) = cur.read_name() else {
            return Ok(());
        };
        cur.skip_whitespace();
        if cur.peek() != Some(b'=') {
            return Ok(());
        }
        cur.advance(1);
        cur.skip_whitespace();
        let quote = match cur.peek() {
            Some(q @ (b'"' | b'\'')) => q,
            _ => return Ok(()),
        };
        cur.advance(1);
        let vstart = cur.position();
        let Some(close) = cur.find_byte(quote) else {
            return Ok(());
        };
        let value = cur.slice(vstart, close);
        cur.set_position(close + 1);

        if key == b"encoding" {
            let known = [b"utf-8" as &[u8], b"utf8", b"us-ascii", b"ascii"];
            if !known.iter().any(|k| value.eq_ignore_ascii_case(k)) {
                return Err(err_at(ErrorCode::UnknownEncoding, run, buf, cstart, vstart));
            }
        }
    }
}

// ====================================================================
// Text decoding
// ====================================================================

/// How many leading bytes of a partial text run are safe to flush now:
/// stop before an unterminated entity reference, a split UTF-8 sequence, a
/// trailing CR (may pair with an LF), or a trailing "]]" (may become "]]>").
fn safe_text_len(run: &[u8]) -> usize {
    let mut safe = run.len();
    if let Some(amp) = memrchr(b'&', run) {
        if memchr(b';', &run[amp..]).is_none() {
            safe = amp;
        }
    }
    // Walk back over a possibly split multi-byte sequence.
    let mut first = safe;
    let mut steps = 0;
    while first > 0 && steps < 3 && run[first - 1] & 0xC0 == 0x80 {
        first -= 1;
        steps += 1;
    }
    if first > 0 && run[first - 1] >= 0xC0 {
        let lead = run[first - 1];
        let need = if lead >= 0xF0 {
            4
        } else if lead >= 0xE0 {
            3
        } else {
            2
        };
        if first - 1 + need > safe {
            safe = first - 1;
        }
    }
    if safe > 0 && run[safe - 1] == b'\r' {
        safe -= 1;
    }
    let mut brackets = 0;
    while safe > 0 && run[safe - 1] == b']' && brackets < 2 {
        safe -= 1;
        brackets += 1;
    }
    safe
}

/// Decode and dispatch one complete region of character data.
///
/// `decode` selects entity processing and the "]]>" check (true for text,
/// false for CDATA content). Newlines are normalized either way. Named
/// non-predefined entities flush pending output and go through the sink's
/// entity hook.
fn deliver_text<S: TokenSink>(
    sink: &mut S,
    buf: &[u8],
    run: &PosTracker,
    cstart: usize,
    range: std::ops::Range<usize>,
    decode: bool,
) -> Result<(), XmlError> {
    use memchr::memchr3;

    let (start, end) = (range.start, range.end);
    if start >= end {
        return Ok(());
    }

    let has_special = if decode {
        memchr3(b'&', b'\r', b']', &buf[start..end]).is_some()
    } else {
        memchr(b'\r', &buf[start..end]).is_some()
    };
    if !has_special {
        let text = utf8_span(buf, run, cstart, start, &buf[start..end])?;
        return sink.characters(Cow::Borrowed(text), text_pos(run, buf, cstart, start));
    }

    let mut out = String::with_capacity(end - start);
    let mut flush_from = start;
    let mut cur = start;
    while cur < end {
        let special = if decode {
            memchr3(b'&', b'\r', b']', &buf[cur..end])
        } else {
            memchr(b'\r', &buf[cur..end])
        };
        let Some(rel) = special else {
            out.push_str(utf8_span(buf, run, cstart, cur, &buf[cur..end])?);
            break;
        };
        let sp = cur + rel;
        out.push_str(utf8_span(buf, run, cstart, cur, &buf[cur..sp])?);
        match buf[sp] {
            b'\r' => {
                out.push('\n');
                cur = sp + 1;
                if cur < end && buf[cur] == b'\n' {
                    cur += 1;
                }
            }
            b']' => {
                if buf[sp..end].starts_with(b"]]>") {
                    return Err(err_at(ErrorCode::InvalidToken, run, buf, cstart, sp));
                }
                out.push(']');
                cur = sp + 1;
            }
            _ => {
                // '&'
                let Some(semi_rel) = memchr(b';', &buf[sp..end]) else {
                    return Err(err_at(ErrorCode::InvalidToken, run, buf, cstart, sp));
                };
                let semi = sp + semi_rel;
                match entities::resolve(&buf[sp + 1..semi]) {
                    Resolved::Text(t) => out.push_str(t),
                    Resolved::Char(c) => out.push(c),
                    Resolved::BadCharRef => {
                        return Err(err_at(ErrorCode::BadCharRef, run, buf, cstart, sp));
                    }
                    Resolved::Malformed => {
                        return Err(err_at(ErrorCode::InvalidToken, run, buf, cstart, sp));
                    }
                    Resolved::Named => {
                        let name = utf8_span(buf, run, cstart, sp + 1, &buf[sp + 1..semi])?;
                        if !out.is_empty() {
                            let text = std::mem::take(&mut out);
                            sink.characters(
                                Cow::Owned(text),
                                text_pos(run, buf, cstart, flush_from),
                            )?;
                        }
                        sink.entity_ref(name, text_pos(run, buf, cstart, sp))?;
                        flush_from = semi + 1;
                    }
                }
                cur = semi + 1;
            }
        }
    }

    if !out.is_empty() {
        sink.characters(Cow::Owned(out), text_pos(run, buf, cstart, flush_from))?;
    }
    Ok(())
}

/// Decode an attribute value: entity references resolve (unknown named ones
/// are fatal here), and literal whitespace normalizes to spaces. Characters
/// introduced by references are kept verbatim.
fn decode_attr_value<'b>(
    buf: &[u8],
    run: &PosTracker,
    cstart: usize,
    value_off: usize,
    value: &'b [u8],
) -> Result<Cow<'b, str>, XmlError> {
    if !value
        .iter()
        .any(|&b| matches!(b, b'&' | b'\r' | b'\n' | b'\t'))
    {
        return Ok(Cow::Borrowed(utf8_span(buf, run, cstart, value_off, value)?));
    }

    let mut out = String::with_capacity(value.len());
    let mut cur = 0usize;
    while cur < value.len() {
        let Some(rel) = value[cur..]
            .iter()
            .position(|&b| matches!(b, b'&' | b'\r' | b'\n' | b'\t'))
        else {
            out.push_str(utf8_span(buf, run, cstart, value_off + cur, &value[cur..])?);
            break;
        };
        let sp = cur + rel;
        out.push_str(utf8_span(
            buf,
            run,
            cstart,
            value_off + cur,
            &value[cur..sp],
        )?);
        match value[sp] {
            b'\r' => {
                out.push(' ');
                cur = sp + 1;
                if cur < value.len() && value[cur] == b'\n' {
                    cur += 1;
                }
            }
            b'\n' | b'\t' => {
                out.push(' ');
                cur = sp + 1;
            }
            _ => {
                let abs = value_off + sp;
                let Some(semi_rel) = memchr(b';', &value[sp..]) else {
                    return Err(err_at(ErrorCode::InvalidToken, run, buf, cstart, abs));
                };
                let semi = sp + semi_rel;
                match entities::resolve(&value[sp + 1..semi]) {
                    Resolved::Text(t) => out.push_str(t),
                    Resolved::Char(c) => out.push(c),
                    Resolved::BadCharRef => {
                        return Err(err_at(ErrorCode::BadCharRef, run, buf, cstart, abs));
                    }
                    Resolved::Malformed => {
                        return Err(err_at(ErrorCode::InvalidToken, run, buf, cstart, abs));
                    }
                    Resolved::Named => {
                        let name =
                            utf8_span(buf, run, cstart, abs + 1, &value[sp + 1..semi])?;
                        return Err(ParseError::undefined_entity(
                            name,
                            text_pos(run, buf, cstart, abs),
                        )
                        .into());
                    }
                }
                cur = semi + 1;
            }
        }
    }
    Ok(Cow::Owned(out))
}

/// Validate a raw span as UTF-8 and normalize newlines, without entity
/// processing. Comment and processing-instruction bodies take this path.
/// Borrows from the input when no carriage return occurs.
fn normalize_plain<'b>(
    buf: &'b [u8],
    run: &PosTracker,
    cstart: usize,
    range: std::ops::Range<usize>,
) -> Result<Cow<'b, str>, XmlError> {
    let (start, end) = (range.start, range.end);
    let bytes = &buf[start..end];
    if memchr(b'\r', bytes).is_none() {
        return Ok(Cow::Borrowed(utf8_span(buf, run, cstart, start, bytes)?));
    }

    let mut out = String::with_capacity(bytes.len());
    let mut cur = 0usize;
    while cur < bytes.len() {
        let Some(rel) = memchr(b'\r', &bytes[cur..]) else {
            out.push_str(utf8_span(buf, run, cstart, start + cur, &bytes[cur..])?);
            break;
        };
        out.push_str(utf8_span(buf, run, cstart, start + cur, &bytes[cur..cur + rel])?);
        out.push('\n');
        cur += rel + 1;
        if cur < bytes.len() && bytes[cur] == b'\n' {
            cur += 1;
        }
    }
    Ok(Cow::Owned(out))
}

// ====================================================================
// Position helpers
// ====================================================================

fn text_pos(run: &PosTracker, buf: &[u8], cstart: usize, off: usize) -> Position {
    run.peek_advance(&buf[cstart..off])
}

fn err_at(code: ErrorCode, run: &PosTracker, buf: &[u8], cstart: usize, off: usize) -> XmlError {
    ParseError::new(code, text_pos(run, buf, cstart, off)).into()
}

fn utf8_span<'b>(
    buf: &[u8],
    run: &PosTracker,
    cstart: usize,
    abs: usize,
    bytes: &'b [u8],
) -> Result<&'b str, XmlError> {
    str::from_utf8(bytes).map_err(|e| {
        err_at(
            ErrorCode::InvalidToken,
            run,
            buf,
            cstart,
            abs + e.valid_up_to(),
        )
    })
}
