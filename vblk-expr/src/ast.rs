//! The expression arena.
//!
//! Nodes live in one flat table and refer to each other by index,
//! never by pointer: sub-trees can be shared or dropped freely, cycles
//! cannot be expressed, and the whole arena is freed at once when the
//! [`Ast`] is dropped.  Index 0 is a shared `Null` node.

use std::fmt;

/// Index of a node in the arena.
pub type NodeId = u32;

/// The shared null node.
pub const NULL_ID: NodeId = 0;

/// One expression node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// No effect.
    Null,
    /// An ordered sequence of nodes.
    List(Vec<NodeId>),
    /// A single literal byte.
    Byte(u8),
    /// `@N` — set the cursor.
    AbsOffset(u64),
    /// `@+N` / `@-N` — move the cursor.
    RelOffset(i64),
    /// `@^N` — round the cursor up to a multiple of N (a power of two).
    AlignOffset(u64),
    /// `( expr )` — a nested expression, evaluated in a fresh scope.
    Nested(NodeId),
    /// `<FILE` — splice in a file's contents.
    File(String),
    /// `<(SCRIPT)` — splice in a shell pipeline's standard output.
    Script(String),
    /// A byte string.
    Str(Vec<u8>),
    /// A repeated single byte.
    Fill {
        /// The byte to repeat.
        byte: u8,
        /// Number of repetitions.
        count: u64,
    },
    /// `\name` — reference to an assigned expression.
    Name(String),
    /// `expr -> \name` — bind `name` to `id` in the current scope.
    Assign {
        /// The bound name (without the backslash).
        name: String,
        /// The bound expression.
        id: NodeId,
    },
    /// `expr*N`.
    Repeat {
        /// The repeated expression.
        id: NodeId,
        /// Number of copies.
        count: u64,
    },
    /// `expr[N:M]` — `end` of `None` means "to the end".
    Slice {
        /// The sliced expression.
        id: NodeId,
        /// First byte of the slice.
        start: u64,
        /// One past the last byte, or `None` for the whole tail.
        end: Option<u64>,
    },
}

impl Node {
    /// Whether this node produces data, as opposed to moving the
    /// cursor.  Offset nodes may only appear directly in a list; they
    /// make no sense as operands of `*N`, `[N:M]` or `->`.
    pub const fn is_data(&self) -> bool {
        !matches!(self, Self::AbsOffset(_) | Self::RelOffset(_) | Self::AlignOffset(_))
    }
}

/// The node arena.
#[derive(Debug, Clone)]
pub struct Ast {
    /// All nodes; index 0 is the shared null.
    nodes: Vec<Node>,
}

impl Ast {
    /// Creates an arena containing only the shared null node.
    pub fn new() -> Self {
        Self { nodes: vec![Node::Null] }
    }

    /// Adds a node, returning its id.  Null collapses to [`NULL_ID`].
    pub fn push(&mut self, node: Node) -> NodeId {
        if matches!(node, Node::Null) {
            return NULL_ID;
        }
        self.nodes.push(node);
        (self.nodes.len() - 1) as NodeId
    }

    /// The node with the given id.
    ///
    /// # Panics
    ///
    /// If `id` was not returned by [`Ast::push`].
    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    /// Replaces the node with the given id.
    pub(crate) fn set(&mut self, id: NodeId, node: Node) {
        self.nodes[id as usize] = node;
    }

    /// A compact single-line rendering of the tree at `root`, for
    /// diagnostics.
    pub fn display(&self, root: NodeId) -> AstDisplay<'_> {
        AstDisplay { ast: self, root }
    }
}

impl Default for Ast {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrapper rendering a subtree via [`fmt::Display`].
#[derive(Debug)]
pub struct AstDisplay<'a> {
    /// The arena.
    ast: &'a Ast,
    /// Subtree to render.
    root: NodeId,
}

impl fmt::Display for AstDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_node(self.ast, self.root, f)
    }
}

/// Recursively renders one node.
fn write_node(ast: &Ast, id: NodeId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match ast.get(id) {
        Node::Null => write!(f, "null"),
        Node::List(ids) => {
            write!(f, "[")?;
            for (i, &id) in ids.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write_node(ast, id, f)?;
            }
            write!(f, "]")
        }
        Node::Byte(b) => write!(f, "{b}"),
        Node::AbsOffset(n) => write!(f, "@{n}"),
        Node::RelOffset(n) if *n >= 0 => write!(f, "@+{n}"),
        Node::RelOffset(n) => write!(f, "@{n}"),
        Node::AlignOffset(n) => write!(f, "@^{n}"),
        Node::Nested(id) => {
            write!(f, "(")?;
            write_node(ast, *id, f)?;
            write!(f, ")")
        }
        Node::File(path) => write!(f, "<{path}"),
        Node::Script(s) => write!(f, "<({s})"),
        Node::Str(s) => {
            write!(f, "\"")?;
            for &b in s {
                if b.is_ascii_graphic() || b == b' ' {
                    write!(f, "{}", b as char)?;
                } else {
                    write!(f, "\\x{b:02x}")?;
                }
            }
            write!(f, "\"")
        }
        Node::Fill { byte, count } => write!(f, "fill({byte}*{count})"),
        Node::Name(name) => write!(f, "\\{name}"),
        Node::Assign { name, id } => {
            write!(f, "(")?;
            write_node(ast, *id, f)?;
            write!(f, ") -> \\{name}")
        }
        Node::Repeat { id, count } => {
            write!(f, "(")?;
            write_node(ast, *id, f)?;
            write!(f, ")*{count}")
        }
        Node::Slice { id, start, end } => {
            write!(f, "(")?;
            write_node(ast, *id, f)?;
            match end {
                Some(end) => write!(f, ")[{start}:{end}]"),
                None => write!(f, ")[{start}:]"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_collapses_to_node_zero() {
        let mut ast = Ast::new();
        assert_eq!(ast.push(Node::Null), NULL_ID);
        assert_eq!(ast.push(Node::Null), NULL_ID);
        let b = ast.push(Node::Byte(7));
        assert_ne!(b, NULL_ID);
        assert_eq!(ast.get(b), &Node::Byte(7));
    }

    #[test]
    fn data_classification() {
        assert!(Node::Byte(0).is_data());
        assert!(Node::Str(vec![]).is_data());
        assert!(!Node::AbsOffset(0).is_data());
        assert!(!Node::RelOffset(-1).is_data());
        assert!(!Node::AlignOffset(8).is_data());
    }

    #[test]
    fn display_round_trip_shape() {
        let mut ast = Ast::new();
        let b = ast.push(Node::Byte(65));
        let r = ast.push(Node::Repeat { id: b, count: 3 });
        let list = ast.push(Node::List(vec![r]));
        assert_eq!(ast.display(list).to_string(), "[(65)*3]");
    }
}
