//! A single simplification pass over the AST.
//!
//! The rewrites keep evaluation cheap: lists are flattened and
//! byte-only lists become strings, trivially-constant nested
//! expressions are unwrapped, and repeats collapse into larger
//! repeats, fills or unrolled strings.  The pass is idempotent.

use crate::ast::{Ast, NULL_ID, Node, NodeId};

/// Optimizes the subtree at `root`, returning the (possibly new) root.
pub fn optimize(ast: &mut Ast, root: NodeId) -> NodeId {
    match ast.get(root).clone() {
        Node::List(ids) => {
            let mut list: Vec<NodeId> = Vec::new();
            for id in ids {
                let id = optimize(ast, id);
                match ast.get(id) {
                    // Null elements of a list can be dropped.
                    Node::Null => {}
                    // A list within a list is flattened.
                    Node::List(inner) => list.extend(inner.iter().copied()),
                    _ => list.push(id),
                }
            }
            // Zero elements: the list is null.
            if list.is_empty() {
                return NULL_ID;
            }
            // One element: the list is that element.
            if list.len() == 1 {
                return list[0];
            }
            // Only bytes: the list is a string.
            if list.iter().all(|&id| matches!(ast.get(id), Node::Byte(_))) {
                let s = list
                    .iter()
                    .map(|&id| match ast.get(id) {
                        Node::Byte(b) => *b,
                        _ => unreachable!("checked above"),
                    })
                    .collect();
                return ast.push(Node::Str(s));
            }
            ast.push(Node::List(list))
        }

        Node::Nested(id) => {
            let id = optimize(ast, id);
            match ast.get(id) {
                // A nested constant is just the constant.
                Node::Null
                | Node::Byte(_)
                | Node::File(_)
                | Node::Script(_)
                | Node::Str(_)
                | Node::Name(_) => id,
                // ((expr)) is (expr).
                Node::Nested(inner) => {
                    let inner = *inner;
                    ast.push(Node::Nested(inner))
                }
                _ => {
                    ast.set(root, Node::Nested(id));
                    root
                }
            }
        }

        Node::Assign { name, id } => {
            let id = optimize(ast, id);
            ast.set(root, Node::Assign { name, id });
            root
        }

        Node::Repeat { id, count } => {
            // Zero repetitions produce nothing.
            if count == 0 {
                return NULL_ID;
            }
            let id = optimize(ast, id);
            // expr*1 is expr; null*N is null.
            if count == 1 || matches!(ast.get(id), Node::Null) {
                return id;
            }
            match ast.get(id).clone() {
                // expr*X*Y is expr*(X*Y).
                Node::Repeat { id: inner, count: inner_count } => {
                    ast.push(Node::Repeat { id: inner, count: count.saturating_mul(inner_count) })
                }
                // fill(b,X)*Y is fill(b,X*Y).
                Node::Fill { byte, count: n } => {
                    ast.push(Node::Fill { byte, count: count.saturating_mul(n) })
                }
                // Unroll short strings repeated a few times.
                Node::Str(s) if count <= 4 && s.len() <= 512 => {
                    let mut unrolled = Vec::with_capacity(s.len() * count as usize);
                    for _ in 0..count {
                        unrolled.extend_from_slice(&s);
                    }
                    ast.push(Node::Str(unrolled))
                }
                _ => match single_byte(ast, id) {
                    // A single-byte expression repeated is a fill.
                    Some(byte) => ast.push(Node::Fill { byte, count }),
                    None => {
                        ast.set(root, Node::Repeat { id, count });
                        root
                    }
                },
            }
        }

        Node::Slice { id, start, end } => {
            // A zero-length slice is null.
            if end == Some(start) {
                return NULL_ID;
            }
            let id = optimize(ast, id);
            ast.set(root, Node::Slice { id, start, end });
            root
        }

        // Zero-length strings and fills are null.
        Node::Str(s) if s.is_empty() => NULL_ID,
        Node::Fill { count: 0, .. } => NULL_ID,

        Node::Null
        | Node::Byte(_)
        | Node::AbsOffset(_)
        | Node::RelOffset(_)
        | Node::AlignOffset(_)
        | Node::File(_)
        | Node::Script(_)
        | Node::Str(_)
        | Node::Fill { .. }
        | Node::Name(_) => root,
    }
}

/// If the expression always produces exactly one byte, returns it.
fn single_byte(ast: &Ast, id: NodeId) -> Option<u8> {
    match ast.get(id) {
        Node::Byte(b) => Some(*b),
        Node::List(ids) if ids.len() == 1 => single_byte(ast, ids[0]),
        Node::Str(s) if s.len() == 1 => Some(s[0]),
        Node::Fill { byte, count: 1 } => Some(*byte),
        Node::Repeat { id, count: 1 } => single_byte(ast, *id),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Variables;
    use crate::parse::parse_into;

    fn optimized(src: &str) -> String {
        let mut ast = Ast::new();
        let root = parse_into(&mut ast, &Variables::new(), src).unwrap();
        let root = optimize(&mut ast, root);
        ast.display(root).to_string()
    }

    #[test]
    fn lists_flatten() {
        // List [a, List [b, c], d] is List [a, b, c, d].
        let mut ast = Ast::new();
        let a = ast.push(Node::AbsOffset(1));
        let b = ast.push(Node::AbsOffset(2));
        let c = ast.push(Node::AbsOffset(3));
        let d = ast.push(Node::AbsOffset(4));
        let inner = ast.push(Node::List(vec![b, c]));
        let outer = ast.push(Node::List(vec![a, inner, d]));
        let root = optimize(&mut ast, outer);
        assert_eq!(ast.display(root).to_string(), "[@1 @2 @3 @4]");
    }

    #[test]
    fn singleton_and_empty_lists_collapse() {
        assert_eq!(optimized(""), "null");
        assert_eq!(optimized("@8"), "@8");
        assert_eq!(optimized("()"), "null");
    }

    #[test]
    fn byte_lists_become_strings() {
        assert_eq!(optimized("65 66 67"), "\"ABC\"");
    }

    #[test]
    fn nested_constants_unwrap() {
        assert_eq!(optimized("(65)"), "65");
        assert_eq!(optimized("(\"x\")"), "\"x\"");
        assert_eq!(optimized("((\"x\"))"), "\"x\"");
    }

    #[test]
    fn repeats_fold() {
        // Repeat(Repeat(x, a), b) == Repeat(x, a * b).
        assert_eq!(optimized("\"xy\"*5*3"), "(\"xy\")*15");
        // Single byte * N is a fill.
        assert_eq!(optimized("65*5"), "fill(65*5)");
        // The fill then folds again under a further repeat.
        assert_eq!(optimized("65*5*3"), "fill(65*15)");
        // x*0 is null, x*1 is x.
        assert_eq!(optimized("65*0"), "null");
        assert_eq!(optimized("\"ab\"*1"), "\"ab\"");
        // Short strings unroll.
        assert_eq!(optimized("\"ab\"*2"), "\"abab\"");
    }

    #[test]
    fn zero_length_slices_and_strings_drop() {
        assert_eq!(optimized("\"abc\"[1:1]"), "null");
        assert_eq!(optimized("\"\""), "null");
    }

    #[test]
    fn optimize_is_idempotent() {
        for src in [
            "@1 (@2 @3) @4",
            "65 66 67",
            "(\"xy\"*3)*5",
            "65*5",
            "\"abc\"[1:2]",
            "1 -> \\a \\a*2",
            "@0x1b8 0xf8 0x21 @0x1fe 0x55 0xaa",
        ] {
            let mut ast = Ast::new();
            let root = parse_into(&mut ast, &Variables::new(), src).unwrap();
            let once = optimize(&mut ast, root);
            let rendered_once = ast.display(once).to_string();
            let twice = optimize(&mut ast, once);
            assert_eq!(ast.display(twice).to_string(), rendered_once, "source {src:?}");
        }
    }
}
