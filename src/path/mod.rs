//! Path queries over element trees.
//!
//! The find family on [`Element`] handles plain tags with a direct
//! child scan and hands anything containing path syntax to a
//! [`PathEvaluator`]. The [`Engine`] shipped here supports relative
//! child and descendant steps, `*` and `.`, and attribute, child and
//! positional predicates, caching compiled expressions in an LRU.
//!
//! Engines are plain values. The convenience methods on `Element` use a
//! per-thread default engine; code that wants its own cache lifetime
//! can hold an `Engine` and call the trait methods on it directly.

mod compiler;
mod eval;

use std::cell::RefCell;
use std::fmt;
use std::num::NonZeroUsize;
use std::rc::Rc;

use log::debug;
use lru::LruCache;

use crate::tree::Element;

use compiler::CompiledPath;

/// Compiled expressions kept per engine before eviction.
const DEFAULT_CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(100) {
    Some(n) => n,
    None => unreachable!(),
};

/// An error in a path expression.
///
/// All variants are reported at compile time; evaluating a compiled
/// path cannot fail, it can only select nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    /// The expression starts with `/` or `//`.
    Absolute,
    /// Malformed step structure, such as trailing separators or an
    /// unterminated predicate.
    InvalidPath,
    /// A predicate whose body is not a supported form.
    InvalidPredicate,
    /// A positional predicate below 1.
    PositionRequired,
    /// A `..` step; the tree keeps no parent links.
    ParentStep,
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absolute => f.write_str("cannot use absolute path on element"),
            Self::InvalidPath => f.write_str("invalid path"),
            Self::InvalidPredicate => f.write_str("invalid predicate"),
            Self::PositionRequired => f.write_str("XPath position >= 1 expected"),
            Self::ParentStep => f.write_str("parent steps are not supported"),
        }
    }
}

impl std::error::Error for PathError {}

/// Evaluates path expressions against a context element.
///
/// `iterfind` is the primitive; the rest of the find family is derived
/// from it.
pub trait PathEvaluator {
    fn iterfind(&self, context: &Element, path: &str) -> Result<PathIter, PathError>;

    fn find(&self, context: &Element, path: &str) -> Result<Option<Element>, PathError> {
        Ok(self.iterfind(context, path)?.next())
    }

    fn findall(&self, context: &Element, path: &str) -> Result<Vec<Element>, PathError> {
        Ok(self.iterfind(context, path)?.collect())
    }

    /// Text of the first match. A match without text reads as the empty
    /// string; no match at all yields `default`.
    fn findtext(
        &self,
        context: &Element,
        path: &str,
        default: Option<&str>,
    ) -> Result<Option<Rc<str>>, PathError> {
        match self.find(context, path)? {
            Some(el) => Ok(Some(el.text().unwrap_or_else(|| Rc::from("")))),
            None => Ok(default.map(Rc::from)),
        }
    }
}

/// The built-in evaluator: compiles expressions on demand and keeps
/// them in a per-engine LRU cache.
pub struct Engine {
    cache: RefCell<LruCache<String, Rc<CompiledPath>>>,
}

impl Engine {
    pub fn new() -> Engine {
        Engine::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Engine {
        Engine {
            cache: RefCell::new(LruCache::new(capacity)),
        }
    }

    fn compile(&self, path: &str) -> Result<Rc<CompiledPath>, PathError> {
        if let Some(hit) = self.cache.borrow_mut().get(path) {
            return Ok(hit.clone());
        }
        debug!("compiling path {path:?}");
        let compiled = Rc::new(compiler::parse(path)?);
        self.cache
            .borrow_mut()
            .put(path.to_owned(), compiled.clone());
        Ok(compiled)
    }
}

impl PathEvaluator for Engine {
    fn iterfind(&self, context: &Element, path: &str) -> Result<PathIter, PathError> {
        let compiled = self.compile(path)?;
        Ok(PathIter {
            inner: eval::eval(&compiled, context).into_iter(),
        })
    }
}

impl Default for Engine {
    fn default() -> Engine {
        Engine::new()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Engine(cached: {})", self.cache.borrow().len())
    }
}

thread_local! {
    static DEFAULT_ENGINE: Engine = Engine::new();
}

/// Iterator over path matches, in document order per step.
#[derive(Debug)]
pub struct PathIter {
    inner: std::vec::IntoIter<Element>,
}

impl Iterator for PathIter {
    type Item = Element;

    fn next(&mut self) -> Option<Element> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Whether `path` contains syntax beyond a literal tag. Characters
/// inside a `{uri}` region are not path syntax.
fn has_path_chars(path: &str) -> bool {
    let mut in_braces = false;
    for ch in path.bytes() {
        match ch {
            b'{' => in_braces = true,
            b'}' => in_braces = false,
            b'/' | b'*' | b'[' | b'@' | b'.' if !in_braces => return true,
            _ => {}
        }
    }
    false
}

impl Element {
    /// First direct child with the given tag, or the first match of a
    /// path expression.
    pub fn find(&self, path: &str) -> Result<Option<Element>, PathError> {
        if has_path_chars(path) {
            DEFAULT_ENGINE.with(|engine| engine.find(self, path))
        } else {
            Ok(self.children().into_iter().find(|c| *c.tag() == *path))
        }
    }

    /// All direct children with the given tag, or all matches of a path
    /// expression, in document order.
    pub fn findall(&self, path: &str) -> Result<Vec<Element>, PathError> {
        if has_path_chars(path) {
            DEFAULT_ENGINE.with(|engine| engine.findall(self, path))
        } else {
            Ok(self
                .children()
                .into_iter()
                .filter(|c| *c.tag() == *path)
                .collect())
        }
    }

    /// Text of the first match; `""` for a match without text,
    /// `default` when nothing matches.
    pub fn findtext(&self, path: &str, default: Option<&str>) -> Result<Option<Rc<str>>, PathError> {
        if has_path_chars(path) {
            DEFAULT_ENGINE.with(|engine| engine.findtext(self, path, default))
        } else {
            match self.children().into_iter().find(|c| *c.tag() == *path) {
                Some(el) => Ok(Some(el.text().unwrap_or_else(|| Rc::from("")))),
                None => Ok(default.map(Rc::from)),
            }
        }
    }

    /// Iterator over all matches. Always compiles, even for plain tags.
    pub fn iterfind(&self, path: &str) -> Result<PathIter, PathError> {
        DEFAULT_ENGINE.with(|engine| PathEvaluator::iterfind(engine, self, path))
    }
}
