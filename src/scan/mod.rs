//! Incremental XML tokenizer
//!
//! Feed-driven lexical layer. Byte chunks go in through
//! [`Tokenizer::feed`]; complete lexical constructs come out as calls on a
//! [`TokenSink`] implementation, each carrying a source [`Position`].
//! Namespace prefixes are resolved here: element and attribute names are
//! delivered in `uri}local` form (or plain when unprefixed), `xmlns`
//! attributes never reach the attribute list and are surfaced as paired
//! namespace-declaration callbacks instead.
//!
//! The sink decides what to build; see the parser module for the adapter
//! that drives a tree builder from these callbacks.

mod cursor;
mod entities;
mod tokenizer;

pub use tokenizer::Tokenizer;

use std::borrow::Cow;
use std::fmt;

use crate::error::XmlError;

/// A source location: 1-based line, 0-based column (in characters), and
/// absolute byte offset from the start of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Position {
    pub line: u64,
    pub column: u64,
    pub byte: u64,
}

/// Classification of a lexical failure. The numeric value is stable and can
/// be matched on by callers instead of comparing message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Syntax = 2,
    NoElements = 3,
    InvalidToken = 4,
    UnclosedToken = 5,
    MismatchedTag = 7,
    DuplicateAttribute = 8,
    JunkAfterDocElement = 9,
    UndefinedEntity = 11,
    BadCharRef = 14,
    MisplacedXmlDecl = 17,
    UnknownEncoding = 18,
    UnclosedCdata = 20,
    UnboundPrefix = 27,
}

impl ErrorCode {
    /// Stable numeric form of the code.
    pub fn value(self) -> u32 {
        self as u32
    }

    /// Human-readable description, used as the default error message.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Syntax => "syntax error",
            ErrorCode::NoElements => "no element found",
            ErrorCode::InvalidToken => "not well-formed (invalid token)",
            ErrorCode::UnclosedToken => "unclosed token",
            ErrorCode::MismatchedTag => "mismatched tag",
            ErrorCode::DuplicateAttribute => "duplicate attribute",
            ErrorCode::JunkAfterDocElement => "junk after document element",
            ErrorCode::UndefinedEntity => "undefined entity",
            ErrorCode::BadCharRef => "reference to invalid character number",
            ErrorCode::MisplacedXmlDecl => {
                "XML or text declaration not at start of entity"
            }
            ErrorCode::UnknownEncoding => "unknown encoding",
            ErrorCode::UnclosedCdata => "unclosed CDATA section",
            ErrorCode::UnboundPrefix => "unbound prefix",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A lexical error with a structured code and the position it was detected
/// at, so callers can branch programmatically rather than string-match.
#[derive(Debug, Clone)]
pub struct ParseError {
    code: ErrorCode,
    message: String,
    position: (u64, u64),
}

impl ParseError {
    /// Error with the code's standard message.
    pub fn new(code: ErrorCode, at: Position) -> Self {
        ParseError {
            code,
            message: code.message().to_string(),
            position: (at.line, at.column),
        }
    }

    /// Undefined-entity error naming the offending reference.
    pub fn undefined_entity(name: &str, at: Position) -> Self {
        ParseError {
            code: ErrorCode::UndefinedEntity,
            message: format!("undefined entity &{};", name),
            position: (at.line, at.column),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// `(line, column)` where the error was detected.
    pub fn position(&self) -> (u64, u64) {
        self.position
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: line {}, column {}",
            self.message, self.position.0, self.position.1
        )
    }
}

impl std::error::Error for ParseError {}

/// An attribute as delivered by the tokenizer: prefix-resolved name bytes
/// (`uri}local` or plain) and the fully decoded, normalized value.
#[derive(Debug)]
pub struct ScanAttr<'a> {
    pub name: Cow<'a, [u8]>,
    pub value: Cow<'a, str>,
}

/// Receiver for lexical events.
///
/// Structural callbacks are required; the rest default to ignoring the
/// event. Every callback can fail, which aborts the current feed and
/// surfaces the error to the caller of `feed`/`close`.
pub trait TokenSink {
    /// An element start tag. `name` is prefix-resolved; `attrs` excludes
    /// namespace declarations.
    fn start_element(
        &mut self,
        name: Cow<'_, [u8]>,
        attrs: &[ScanAttr<'_>],
        at: Position,
    ) -> Result<(), XmlError>;

    /// An element end tag (also emitted for self-closing tags).
    fn end_element(&mut self, name: Cow<'_, [u8]>, at: Position) -> Result<(), XmlError>;

    /// A run of character data, entity-decoded and newline-normalized.
    /// Long runs may arrive in several pieces.
    fn characters(&mut self, text: Cow<'_, str>, at: Position) -> Result<(), XmlError>;

    /// A named entity reference that is not predefined. The default
    /// treats it as fatal; an implementation with a substitution table
    /// overrides this and re-emits the replacement as character data.
    fn entity_ref(&mut self, name: &str, at: Position) -> Result<(), XmlError> {
        Err(ParseError::undefined_entity(name, at).into())
    }

    /// A namespace declaration coming into scope; emitted before the
    /// owning element's start callback. `prefix` is None for the default
    /// namespace.
    fn namespace_start(&mut self, _prefix: Option<&str>, _uri: &str) -> Result<(), XmlError> {
        Ok(())
    }

    /// A namespace declaration leaving scope; emitted after the owning
    /// element's end callback, innermost first.
    fn namespace_end(&mut self, _prefix: Option<&str>) -> Result<(), XmlError> {
        Ok(())
    }

    fn comment(&mut self, _text: Cow<'_, str>, _at: Position) -> Result<(), XmlError> {
        Ok(())
    }

    fn processing_instruction(
        &mut self,
        _target: &str,
        _data: Option<&str>,
        _at: Position,
    ) -> Result<(), XmlError> {
        Ok(())
    }

    /// A DOCTYPE declaration: name plus optional public/system identifiers.
    /// The internal subset is skipped, not reported.
    fn doctype(
        &mut self,
        _name: &str,
        _public_id: Option<&str>,
        _system_id: Option<&str>,
        _at: Position,
    ) -> Result<(), XmlError> {
        Ok(())
    }
}
