//! Crate-wide error type.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::scan::ParseError;
use crate::tree::TreeError;

/// Any failure a parse or tree operation can produce.
///
/// Lexical failures keep their code and source position; structural
/// failures carry the operation-specific variant. I/O errors are
/// `Arc`-wrapped so the whole type stays cloneable.
#[derive(Debug, Clone)]
pub enum XmlError {
    /// The input is not well-formed XML.
    Parse(ParseError),
    /// A tree operation was rejected.
    Tree(TreeError),
    /// Reading from the input source failed.
    Io(Arc<io::Error>),
}

impl fmt::Display for XmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => e.fmt(f),
            Self::Tree(e) => e.fmt(f),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for XmlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            Self::Tree(e) => Some(e),
            Self::Io(e) => Some(&**e),
        }
    }
}

impl From<ParseError> for XmlError {
    #[inline]
    fn from(err: ParseError) -> Self {
        Self::Parse(err)
    }
}

impl From<TreeError> for XmlError {
    #[inline]
    fn from(err: TreeError) -> Self {
        Self::Tree(err)
    }
}

impl From<io::Error> for XmlError {
    #[inline]
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}
