//! Path expression compiler.
//!
//! Grammar: steps separated by `/`, with `//` marking a descendant step.
//! A step is `.`, `*`, or a tag (universal `{uri}local` names allowed;
//! everything inside braces is literal), optionally followed by
//! predicates. Supported predicates are `[@attr]`, `[@attr='value']`,
//! `[tag]`, and 1-based `[position]`. Paths are relative; absolute and
//! parent steps are rejected.

use std::rc::Rc;

use memchr::memchr;

use super::PathError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeTest {
    Tag(Rc<str>),
    Any,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Predicate {
    /// `[@attr]`
    HasAttr(Rc<str>),
    /// `[@attr='value']`
    AttrEq(Rc<str>, Rc<str>),
    /// `[tag]`: a direct child with this tag exists.
    HasChild(Rc<str>),
    /// `[n]`: position among the step's tag matches, 1-based,
    /// independent of the other predicates.
    Position(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    SelfNode,
    Child {
        test: NodeTest,
        preds: Vec<Predicate>,
    },
    Descendant {
        test: NodeTest,
        preds: Vec<Predicate>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompiledPath {
    pub(crate) steps: Vec<Step>,
}

pub(crate) fn parse(path: &str) -> Result<CompiledPath, PathError> {
    let bytes = path.as_bytes();
    if bytes.first() == Some(&b'/') {
        return Err(PathError::Absolute);
    }
    if bytes.is_empty() {
        return Err(PathError::InvalidPath);
    }

    let mut steps = Vec::new();
    let mut i = 0;
    let mut descendant = false;
    loop {
        if bytes[i..].starts_with(b"..") {
            return Err(PathError::ParentStep);
        }
        if bytes[i] == b'.' {
            i += 1;
            if i < bytes.len() && bytes[i] != b'/' {
                return Err(PathError::InvalidPath);
            }
            if descendant {
                // `//` must select something below the context.
                return Err(PathError::InvalidPath);
            }
            steps.push(Step::SelfNode);
        } else {
            let test = parse_nodetest(path, bytes, &mut i)?;
            let mut preds = Vec::new();
            while i < bytes.len() && bytes[i] == b'[' {
                preds.push(parse_predicate(path, bytes, &mut i)?);
            }
            steps.push(if descendant {
                Step::Descendant { test, preds }
            } else {
                Step::Child { test, preds }
            });
        }
        descendant = false;

        if i == bytes.len() {
            break;
        }
        if bytes[i] != b'/' {
            return Err(PathError::InvalidPath);
        }
        i += 1;
        if i < bytes.len() && bytes[i] == b'/' {
            descendant = true;
            i += 1;
        }
        if i == bytes.len() {
            // Trailing separators select nothing meaningful.
            return Err(PathError::InvalidPath);
        }
    }
    Ok(CompiledPath { steps })
}

fn parse_nodetest(path: &str, bytes: &[u8], i: &mut usize) -> Result<NodeTest, PathError> {
    if bytes[*i] == b'*' {
        *i += 1;
        return Ok(NodeTest::Any);
    }
    let start = *i;
    while *i < bytes.len() {
        match bytes[*i] {
            b'{' => match memchr(b'}', &bytes[*i..]) {
                Some(off) => *i += off + 1,
                None => return Err(PathError::InvalidPath),
            },
            b'/' | b'[' => break,
            b'*' | b'@' | b']' | b'=' | b'\'' | b'"' => return Err(PathError::InvalidPath),
            _ => *i += 1,
        }
    }
    if *i == start {
        return Err(PathError::InvalidPath);
    }
    // Delimiters are ASCII, so the boundaries are character boundaries.
    Ok(NodeTest::Tag(Rc::from(&path[start..*i])))
}

fn parse_predicate(path: &str, bytes: &[u8], i: &mut usize) -> Result<Predicate, PathError> {
    *i += 1;
    let body_start = *i;
    loop {
        if *i >= bytes.len() {
            return Err(PathError::InvalidPath);
        }
        match bytes[*i] {
            b'\'' | b'"' => {
                let quote = bytes[*i];
                *i += 1;
                match memchr(quote, &bytes[*i..]) {
                    Some(off) => *i += off + 1,
                    None => return Err(PathError::InvalidPath),
                }
            }
            b']' => break,
            _ => *i += 1,
        }
    }
    let body = &path[body_start..*i];
    *i += 1;
    parse_predicate_body(body)
}

fn parse_predicate_body(body: &str) -> Result<Predicate, PathError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(PathError::InvalidPredicate);
    }

    if let Some(rest) = body.strip_prefix('@') {
        return match rest.split_once('=') {
            Some((name, value)) => {
                let name = name.trim_end();
                let value = unquote(value.trim()).ok_or(PathError::InvalidPredicate)?;
                if !is_plain_name(name) {
                    return Err(PathError::InvalidPredicate);
                }
                Ok(Predicate::AttrEq(Rc::from(name), Rc::from(value)))
            }
            None => {
                if !is_plain_name(rest) {
                    return Err(PathError::InvalidPredicate);
                }
                Ok(Predicate::HasAttr(Rc::from(rest)))
            }
        };
    }

    // Only a fully numeric token (optionally negative) is positional;
    // anything else that looks like a name is a child-tag test.
    let digits = body.strip_prefix('-').unwrap_or(body);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        return match body.parse::<i64>() {
            Ok(n) if n >= 1 => Ok(Predicate::Position(n as usize)),
            Ok(_) => Err(PathError::PositionRequired),
            Err(_) => Err(PathError::InvalidPredicate),
        };
    }

    if is_plain_name(body) {
        Ok(Predicate::HasChild(Rc::from(body)))
    } else {
        Err(PathError::InvalidPredicate)
    }
}

/// A literal tag usable inside a predicate: non-empty, no operators or
/// whitespace outside braces.
fn is_plain_name(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let mut in_braces = false;
    for ch in s.chars() {
        match ch {
            '{' => in_braces = true,
            '}' => in_braces = false,
            _ if in_braces => {}
            '/' | '*' | '[' | ']' | '@' | '=' | '\'' | '"' => return false,
            _ if ch.is_whitespace() => return false,
            _ => {}
        }
    }
    true
}

fn unquote(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 && (bytes[0] == b'\'' || bytes[0] == b'"') && bytes[bytes.len() - 1] == bytes[0]
    {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_step(path: &str) -> Step {
        parse(path).unwrap().steps.remove(0)
    }

    #[test]
    fn test_simple_steps() {
        let p = parse("a/b/c").unwrap();
        assert_eq!(p.steps.len(), 3);
        assert!(matches!(
            &p.steps[1],
            Step::Child { test: NodeTest::Tag(t), preds } if &**t == "b" && preds.is_empty()
        ));

        assert!(matches!(tag_step("*"), Step::Child { test: NodeTest::Any, .. }));
        assert!(matches!(tag_step("."), Step::SelfNode));
    }

    #[test]
    fn test_descendant_marker() {
        let p = parse(".//b").unwrap();
        assert!(matches!(&p.steps[0], Step::SelfNode));
        assert!(matches!(
            &p.steps[1],
            Step::Descendant { test: NodeTest::Tag(t), .. } if &**t == "b"
        ));

        let p = parse("a//b").unwrap();
        assert!(matches!(&p.steps[1], Step::Descendant { .. }));
    }

    #[test]
    fn test_universal_tags_are_literal() {
        let p = parse("{http://x.com/ns}a/{u}b").unwrap();
        assert!(matches!(
            &p.steps[0],
            Step::Child { test: NodeTest::Tag(t), .. } if &**t == "{http://x.com/ns}a"
        ));
        assert!(matches!(
            &p.steps[1],
            Step::Child { test: NodeTest::Tag(t), .. } if &**t == "{u}b"
        ));
    }

    #[test]
    fn test_predicates() {
        let p = parse("a[@k][@k='v'][t][2]").unwrap();
        match &p.steps[0] {
            Step::Child { preds, .. } => {
                assert_eq!(preds.len(), 4);
                assert_eq!(preds[0], Predicate::HasAttr(Rc::from("k")));
                assert_eq!(preds[1], Predicate::AttrEq(Rc::from("k"), Rc::from("v")));
                assert_eq!(preds[2], Predicate::HasChild(Rc::from("t")));
                assert_eq!(preds[3], Predicate::Position(2));
            }
            other => panic!("unexpected step {other:?}"),
        }

        // Trailing non-digits make the token a tag test, not a position.
        let p = parse("a[2x]").unwrap();
        match &p.steps[0] {
            Step::Child { preds, .. } => {
                assert_eq!(preds[0], Predicate::HasChild(Rc::from("2x")));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_predicate_quoting_and_spacing() {
        let p = parse(r#"b[@i = "2"]"#).unwrap();
        match &p.steps[0] {
            Step::Child { preds, .. } => {
                assert_eq!(preds[0], Predicate::AttrEq(Rc::from("i"), Rc::from("2")));
            }
            other => panic!("unexpected step {other:?}"),
        }
        // A quoted value may contain a closing bracket.
        let p = parse("b[@i='x]y']").unwrap();
        match &p.steps[0] {
            Step::Child { preds, .. } => {
                assert_eq!(preds[0], Predicate::AttrEq(Rc::from("i"), Rc::from("x]y")));
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn test_absolute_rejected() {
        assert_eq!(parse("/a").unwrap_err(), PathError::Absolute);
        assert_eq!(parse("//a").unwrap_err(), PathError::Absolute);
    }

    #[test]
    fn test_parent_step_rejected() {
        assert_eq!(parse("..").unwrap_err(), PathError::ParentStep);
        assert_eq!(parse("a/../b").unwrap_err(), PathError::ParentStep);
    }

    #[test]
    fn test_position_bounds() {
        assert_eq!(parse("a[0]").unwrap_err(), PathError::PositionRequired);
        assert_eq!(parse("a[-1]").unwrap_err(), PathError::PositionRequired);
        assert!(parse("a[1]").is_ok());
    }

    #[test]
    fn test_malformed_paths() {
        for path in ["", "a/", "a//", "a[", "a[@k='v'", "a]b", ".b", ".//."] {
            assert_eq!(parse(path).unwrap_err(), PathError::InvalidPath, "{path:?}");
        }
        for path in ["a[]", "a[*]", "a[@]", "a[@k=v]", "a[t u]", "a[.='x']"] {
            assert_eq!(
                parse(path).unwrap_err(),
                PathError::InvalidPredicate,
                "{path:?}"
            );
        }
    }
}
