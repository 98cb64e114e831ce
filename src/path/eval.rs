//! Path evaluation over element trees.
//!
//! Steps narrow a node set, starting from the context element. Matches
//! are emitted in document order and never deduplicated. A positional
//! predicate tests the node's position among the step's tag matches
//! under its own parent, counted before any other predicate is applied,
//! so `a[2][@k]` and `a[@k][2]` test the same position.

use crate::tree::Element;

use super::compiler::{CompiledPath, NodeTest, Predicate, Step};

pub(crate) fn eval(path: &CompiledPath, context: &Element) -> Vec<Element> {
    let mut current = vec![context.clone()];
    for step in &path.steps {
        match step {
            Step::SelfNode => {}
            Step::Child { test, preds } => {
                let mut next = Vec::new();
                for node in &current {
                    select_children(node, test, preds, &mut next);
                }
                current = next;
            }
            Step::Descendant { test, preds } => {
                let mut next = Vec::new();
                for node in &current {
                    walk(node, test, preds, &mut next);
                }
                current = next;
            }
        }
    }
    current
}

fn select_children(parent: &Element, test: &NodeTest, preds: &[Predicate], out: &mut Vec<Element>) {
    let mut match_idx = 0;
    for child in parent.children() {
        if test_matches(&child, test) {
            if preds.iter().all(|p| predicate_passes(&child, p, match_idx)) {
                out.push(child);
            }
            match_idx += 1;
        }
    }
}

/// Emits each matching node before descending into it, keeping document
/// order. The positional index restarts for every parent on the way
/// down.
fn walk(parent: &Element, test: &NodeTest, preds: &[Predicate], out: &mut Vec<Element>) {
    let mut match_idx = 0;
    for child in parent.children() {
        if test_matches(&child, test) {
            if preds.iter().all(|p| predicate_passes(&child, p, match_idx)) {
                out.push(child.clone());
            }
            match_idx += 1;
        }
        walk(&child, test, preds, out);
    }
}

fn test_matches(el: &Element, test: &NodeTest) -> bool {
    match test {
        NodeTest::Any => true,
        NodeTest::Tag(tag) => *el.tag() == **tag,
    }
}

fn predicate_passes(el: &Element, pred: &Predicate, match_idx: usize) -> bool {
    match pred {
        Predicate::HasAttr(name) => el.get_attr(name).is_some(),
        Predicate::AttrEq(name, value) => el.get_attr(name).is_some_and(|v| *v == **value),
        Predicate::HasChild(tag) => el.children().into_iter().any(|c| *c.tag() == **tag),
        Predicate::Position(n) => match_idx + 1 == *n,
    }
}

#[cfg(test)]
mod tests {
    use super::super::compiler::parse;
    use super::*;
    use crate::parser::parse_str;

    fn select(root: &Element, path: &str) -> Vec<Element> {
        eval(&parse(path).unwrap(), root)
    }

    fn texts(root: &Element, path: &str) -> Vec<String> {
        select(root, path)
            .iter()
            .map(|e| e.text().map(|t| t.to_string()).unwrap_or_default())
            .collect()
    }

    fn ids(root: &Element, path: &str) -> Vec<String> {
        select(root, path)
            .iter()
            .map(|e| e.get_attr("id").map(|v| v.to_string()).unwrap_or_default())
            .collect()
    }

    fn nested() -> Element {
        parse_str("<d><x><b>1</b><b>2</b></x><b>3</b></d>").unwrap()
    }

    #[test]
    fn test_child_and_self_steps() {
        let d = nested();
        assert_eq!(texts(&d, "b"), ["3"]);
        assert_eq!(texts(&d, "b[1]"), ["3"]);
        assert_eq!(texts(&d, "x/b"), ["1", "2"]);
        assert_eq!(texts(&d, "x/b[2]"), ["2"]);
        assert_eq!(texts(&d, "./x/b[1]"), ["1"]);
        assert!(select(&d, "x/b[3]").is_empty());
        assert!(select(&d, "y/b").is_empty());

        let selves = select(&d, ".");
        assert_eq!(selves.len(), 1);
        assert!(Element::ptr_eq(&selves[0], &d));
    }

    #[test]
    fn test_wildcards() {
        let d = nested();
        let top: Vec<String> = select(&d, "*").iter().map(|e| e.tag().to_string()).collect();
        assert_eq!(top, ["x", "b"]);
        assert_eq!(texts(&d, "*/*"), ["1", "2"]);
    }

    #[test]
    fn test_descendant_document_order() {
        let d = nested();
        assert_eq!(texts(&d, ".//b"), ["1", "2", "3"]);

        let all: Vec<String> = select(&d, ".//*")
            .iter()
            .map(|e| e.tag().to_string())
            .collect();
        assert_eq!(all, ["x", "b", "b", "b"]);
    }

    #[test]
    fn test_descendant_position_is_per_parent() {
        let d = nested();
        assert_eq!(texts(&d, ".//b[1]"), ["1", "3"]);
        assert_eq!(texts(&d, ".//b[2]"), ["2"]);

        // The context element itself is never a descendant match.
        let r = parse_str("<b><b>in</b></b>").unwrap();
        assert_eq!(texts(&r, ".//b"), ["in"]);
    }

    #[test]
    fn test_attribute_predicates() {
        let r = parse_str(r#"<r><a>0</a><a k="1">x</a><a k="2">y</a></r>"#).unwrap();
        assert_eq!(texts(&r, "a[@k]"), ["x", "y"]);
        assert_eq!(texts(&r, "a[@k='2']"), ["y"]);
        assert_eq!(texts(&r, r#"a[@k = "2"]"#), ["y"]);
        assert!(select(&r, "a[@k='9']").is_empty());
        assert!(select(&r, "a[@missing]").is_empty());
    }

    #[test]
    fn test_position_ignores_other_predicates() {
        let r = parse_str(r#"<r><a>0</a><a k="1">x</a><a k="2">y</a></r>"#).unwrap();
        assert_eq!(texts(&r, "a[1]"), ["0"]);
        // The first `a` has no `k`, so both orderings agree on empty.
        assert!(select(&r, "a[1][@k]").is_empty());
        assert!(select(&r, "a[@k][1]").is_empty());
        // Position still counts all `a` children, not just `@k` holders.
        assert_eq!(texts(&r, "a[2][@k]"), ["x"]);
        assert_eq!(texts(&r, "a[@k][2]"), ["x"]);
    }

    #[test]
    fn test_child_existence_predicate() {
        let r =
            parse_str(r#"<r><a id="1"><t/></a><a id="2"/><a id="3" k="z"><t/></a></r>"#).unwrap();
        assert_eq!(ids(&r, "a[t]"), ["1", "3"]);
        assert_eq!(ids(&r, "a[t][@k]"), ["3"]);
        assert!(select(&r, "a[u]").is_empty());
    }

    #[test]
    fn test_universal_tag_steps() {
        let r = parse_str(r#"<r xmlns:p="http://x/"><p:a>in</p:a><a>out</a></r>"#).unwrap();
        assert_eq!(texts(&r, "{http://x/}a"), ["in"]);
        assert_eq!(texts(&r, "a"), ["out"]);
    }

    #[test]
    fn test_duplicate_matches_are_kept() {
        // Two descendant steps can reach the same node through both the
        // outer and the inner `x`; no deduplication.
        let r = parse_str("<r><x><x><b>inner</b></x></x></r>").unwrap();
        assert_eq!(texts(&r, ".//x/b"), ["inner"]);
        assert_eq!(texts(&r, ".//x//b"), ["inner", "inner"]);
    }
}
