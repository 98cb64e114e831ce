//! Entity and character-reference resolution
//!
//! Handles the five predefined XML entities and numeric character
//! references. Any other named entity is reported to the caller, which
//! decides between an external substitution table and a fatal error.

/// Outcome of resolving the body of an `&...;` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolved {
    /// One of the five predefined entities.
    Text(&'static str),
    /// A numeric character reference with a valid XML code point.
    Char(char),
    /// A well-formed named reference that is not predefined.
    Named,
    /// A numeric reference to an invalid or out-of-range code point.
    BadCharRef,
    /// Not a well-formed reference body at all.
    Malformed,
}

/// Resolve the text between `&` and `;`.
pub(crate) fn resolve(body: &[u8]) -> Resolved {
    if body.is_empty() {
        return Resolved::Malformed;
    }
    if body[0] == b'#' {
        return match parse_char_ref(&body[1..]) {
            Some(c) => Resolved::Char(c),
            None => Resolved::BadCharRef,
        };
    }
    match body {
        b"lt" => Resolved::Text("<"),
        b"gt" => Resolved::Text(">"),
        b"amp" => Resolved::Text("&"),
        b"quot" => Resolved::Text("\""),
        b"apos" => Resolved::Text("'"),
        _ => {
            if is_valid_name(body) {
                Resolved::Named
            } else {
                Resolved::Malformed
            }
        }
    }
}

/// Parse the digits of a character reference (after `#`), decimal or
/// `x`/`X`-prefixed hexadecimal, validating against the XML Char production.
fn parse_char_ref(digits: &[u8]) -> Option<char> {
    if digits.is_empty() {
        return None;
    }
    let codepoint = if digits[0] == b'x' || digits[0] == b'X' {
        let hex = std::str::from_utf8(&digits[1..]).ok()?;
        if hex.is_empty() {
            return None;
        }
        u32::from_str_radix(hex, 16).ok()?
    } else {
        let dec = std::str::from_utf8(digits).ok()?;
        dec.parse::<u32>().ok()?
    };
    if !is_valid_xml_char(codepoint) {
        return None;
    }
    char::from_u32(codepoint)
}

/// XML 1.0 Char production:
/// `#x9 | #xA | #xD | [#x20-#xD7FF] | [#xE000-#xFFFD] | [#x10000-#x10FFFF]`
#[inline]
pub(crate) fn is_valid_xml_char(codepoint: u32) -> bool {
    matches!(codepoint,
        0x9 | 0xA | 0xD |
        0x20..=0xD7FF |
        0xE000..=0xFFFD |
        0x10000..=0x10FFFF
    )
}

fn is_valid_name(body: &[u8]) -> bool {
    let Some(&first) = body.first() else {
        return false;
    };
    if !super::cursor::is_name_start_char(first) {
        return false;
    }
    body[1..].iter().all(|&b| super::cursor::is_name_char(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined() {
        assert_eq!(resolve(b"lt"), Resolved::Text("<"));
        assert_eq!(resolve(b"amp"), Resolved::Text("&"));
        assert_eq!(resolve(b"apos"), Resolved::Text("'"));
    }

    #[test]
    fn test_decimal_char_ref() {
        assert_eq!(resolve(b"#65"), Resolved::Char('A'));
    }

    #[test]
    fn test_hex_char_ref() {
        assert_eq!(resolve(b"#x1F600"), Resolved::Char('\u{1F600}'));
        assert_eq!(resolve(b"#X41"), Resolved::Char('A'));
    }

    #[test]
    fn test_invalid_char_ref() {
        // NUL and lone surrogates are not XML chars.
        assert_eq!(resolve(b"#0"), Resolved::BadCharRef);
        assert_eq!(resolve(b"#xD800"), Resolved::BadCharRef);
        assert_eq!(resolve(b"#x110000"), Resolved::BadCharRef);
        assert_eq!(resolve(b"#"), Resolved::BadCharRef);
        assert_eq!(resolve(b"#x"), Resolved::BadCharRef);
    }

    #[test]
    fn test_named_passthrough() {
        assert_eq!(resolve(b"nbsp"), Resolved::Named);
        assert_eq!(resolve(b"copyright"), Resolved::Named);
    }

    #[test]
    fn test_malformed() {
        assert_eq!(resolve(b""), Resolved::Malformed);
        assert_eq!(resolve(b"1abc"), Resolved::Malformed);
        assert_eq!(resolve(b"a b"), Resolved::Malformed);
    }
}
