//! Byte cursor and source-position bookkeeping
//!
//! Uses the memchr crate for delimiter searches so scanning large text
//! runs and attribute lists stays SIMD-accelerated where available.

use memchr::{memchr, memchr2};

use super::Position;

/// Tracks line/column/byte-offset while bytes are consumed.
///
/// Lines are 1-based, columns 0-based and counted in characters (UTF-8
/// continuation bytes do not advance the column). `\r\n`, `\r` and `\n`
/// each count as a single line break.
#[derive(Debug, Clone)]
pub(crate) struct PosTracker {
    line: u64,
    column: u64,
    byte: u64,
    after_cr: bool,
}

impl PosTracker {
    pub(crate) fn new() -> Self {
        PosTracker {
            line: 1,
            column: 0,
            byte: 0,
            after_cr: false,
        }
    }

    /// Current position as an immutable snapshot.
    pub(crate) fn position(&self) -> Position {
        Position {
            line: self.line,
            column: self.column,
            byte: self.byte,
        }
    }

    /// Consume `bytes`, advancing the tracked position over them.
    pub(crate) fn advance(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.byte += 1;
            match b {
                b'\r' => {
                    self.line += 1;
                    self.column = 0;
                    self.after_cr = true;
                }
                b'\n' => {
                    if !self.after_cr {
                        self.line += 1;
                        self.column = 0;
                    }
                    self.after_cr = false;
                }
                _ => {
                    // Continuation bytes belong to an already-counted char.
                    if b & 0xC0 != 0x80 {
                        self.column += 1;
                    }
                    self.after_cr = false;
                }
            }
        }
    }

    /// Position after consuming `bytes`, without mutating the tracker.
    pub(crate) fn peek_advance(&self, bytes: &[u8]) -> Position {
        let mut probe = self.clone();
        probe.advance(bytes);
        probe.position()
    }
}

/// Cursor over one contiguous byte buffer (a single processing pass).
pub(crate) struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    #[inline]
    pub(crate) fn new(input: &'a [u8]) -> Self {
        Cursor { input, pos: 0 }
    }

    #[inline]
    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub(crate) fn set_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    #[inline]
    pub(crate) fn is_eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    #[inline]
    pub(crate) fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    #[inline]
    pub(crate) fn peek_at(&self, offset: usize) -> Option<u8> {
        self.input.get(self.pos + offset).copied()
    }

    #[inline]
    pub(crate) fn advance(&mut self, n: usize) {
        self.pos += n;
    }

    #[inline]
    pub(crate) fn slice(&self, start: usize, end: usize) -> &'a [u8] {
        &self.input[start..end]
    }

    #[inline]
    pub(crate) fn starts_with(&self, needle: &[u8]) -> bool {
        self.input[self.pos..].starts_with(needle)
    }

    #[inline]
    pub(crate) fn skip_whitespace(&mut self) {
        while self.pos < self.input.len() {
            match self.input[self.pos] {
                b' ' | b'\t' | b'\n' | b'\r' => self.pos += 1,
                _ => break,
            }
        }
    }

    /// Find the next occurrence of `byte` at or after the cursor.
    #[inline]
    pub(crate) fn find_byte(&self, byte: u8) -> Option<usize> {
        memchr(byte, &self.input[self.pos..]).map(|i| self.pos + i)
    }

    /// Find the next `<` or `&` (text content boundaries).
    #[inline]
    pub(crate) fn find_text_boundary(&self) -> Option<usize> {
        memchr2(b'<', b'&', &self.input[self.pos..]).map(|i| self.pos + i)
    }

    /// Find the position of `needle` at or after the cursor.
    pub(crate) fn find_subslice(&self, needle: &[u8]) -> Option<usize> {
        let first = *needle.first()?;
        let mut at = self.pos;
        while let Some(i) = memchr(first, &self.input[at..]) {
            let cand = at + i;
            if self.input[cand..].len() < needle.len() {
                return None;
            }
            if &self.input[cand..cand + needle.len()] == needle {
                return Some(cand);
            }
            at = cand + 1;
        }
        None
    }

    /// Find the `>` that terminates a tag, skipping quoted attribute values.
    /// Returns None if the tag is still incomplete.
    pub(crate) fn find_tag_end_quoted(&self) -> Option<usize> {
        let mut pos = self.pos;
        let mut in_single = false;
        let mut in_double = false;
        while pos < self.input.len() {
            match self.input[pos] {
                b'"' if !in_single => in_double = !in_double,
                b'\'' if !in_double => in_single = !in_single,
                b'>' if !in_single && !in_double => return Some(pos),
                _ => {}
            }
            pos += 1;
        }
        None
    }

    /// Read an XML name at the cursor, or None when the first byte is not a
    /// valid name start.
    pub(crate) fn read_name(&mut self) -> Option<&'a [u8]> {
        let start = self.pos;
        let first = self.input.get(start).copied()?;
        if !is_name_start_char(first) {
            return None;
        }
        self.pos += 1;
        while self.pos < self.input.len() && is_name_char(self.input[self.pos]) {
            self.pos += 1;
        }
        Some(&self.input[start..self.pos])
    }
}

/// Valid XML name start byte. Non-ASCII bytes are accepted and validated as
/// UTF-8 when the name is decoded.
#[inline]
pub(crate) fn is_name_start_char(b: u8) -> bool {
    matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'_' | b':') || b >= 0x80
}

/// Valid XML name continuation byte.
#[inline]
pub(crate) fn is_name_char(b: u8) -> bool {
    matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'.' | b':') || b >= 0x80
}

#[inline]
pub(crate) fn is_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_lines_and_columns() {
        let mut t = PosTracker::new();
        t.advance(b"ab\ncd");
        let p = t.position();
        assert_eq!(p.line, 2);
        assert_eq!(p.column, 2);
        assert_eq!(p.byte, 5);
    }

    #[test]
    fn test_tracker_crlf_is_one_break() {
        let mut t = PosTracker::new();
        t.advance(b"a\r\nb");
        assert_eq!(t.position().line, 2);
        assert_eq!(t.position().column, 1);

        let mut t = PosTracker::new();
        t.advance(b"a\r\rb");
        assert_eq!(t.position().line, 3);
    }

    #[test]
    fn test_tracker_multibyte_column() {
        let mut t = PosTracker::new();
        t.advance("aé€".as_bytes());
        assert_eq!(t.position().column, 3);
        assert_eq!(t.position().byte, 6);
    }

    #[test]
    fn test_read_name() {
        let mut c = Cursor::new(b"elem-name>");
        assert_eq!(c.read_name(), Some(b"elem-name" as &[u8]));
        assert_eq!(c.position(), 9);
    }

    #[test]
    fn test_read_name_rejects_digit_start() {
        let mut c = Cursor::new(b"1bad");
        assert_eq!(c.read_name(), None);
        assert_eq!(c.position(), 0);
    }

    #[test]
    fn test_find_tag_end_quoted() {
        let c = Cursor::new(b"<a attr=\">quoted\">text");
        assert_eq!(c.find_tag_end_quoted(), Some(17));
    }

    #[test]
    fn test_find_subslice() {
        let c = Cursor::new(b"abc]]x]]>rest");
        assert_eq!(c.find_subslice(b"]]>"), Some(6));
        let c = Cursor::new(b"abc]]");
        assert_eq!(c.find_subslice(b"]]>"), None);
    }
}
