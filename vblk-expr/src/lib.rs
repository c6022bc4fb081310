//! A small declarative language describing the contents of a virtual
//! disk, compiled into an allocator.
//!
//! An expression such as
//!
//! ```text
//! @0x1b8 0xf8 0x21 0xdc 0xeb  # partition table id
//! @0x1fe le16:0xAA55          # boot signature
//! ```
//!
//! positions a cursor with `@`-directives and emits bytes, strings,
//! integer words, file contents, script output, fills and repetitions.
//! Sub-expressions can be named (`expr -> \name`), referenced
//! (`\name`), repeated (`expr*N`) and sliced (`expr[N:M]`);
//! `$VAR` expands caller parameters or environment variables.
//!
//! Compilation is three phases over one node arena: [`parse`],
//! [`optimize`], [`evaluate`].  [`compile`] runs all three.

pub mod ast;
mod eval;
mod optimize;
mod parse;

use std::collections::BTreeMap;

pub use ast::{Ast, Node, NodeId};
pub use eval::evaluate;
pub use optimize::optimize;
pub use parse::parse_into;
use vblk_alloc::Allocator;

/// Named parameters made available to `$VAR` references, consulted
/// before the environment.
pub type Variables = BTreeMap<String, String>;

/// Alias for `Result<T, vblk_expr::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from parsing or evaluating a data expression.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The expression text could not be parsed.
    #[error("data parameter: {msg} at offset {offset}")]
    Parse {
        /// Byte offset into the expression text.
        offset: usize,
        /// What went wrong.
        msg: String,
    },

    /// A `$VAR` reference named neither a parameter nor an
    /// environment variable.
    #[error("${0}: variable not found")]
    UndefinedVariable(String),

    /// A `\name` reference was never assigned in scope.
    #[error("\\{0} not defined")]
    UndefinedName(String),

    /// `[N:M]` did not describe a valid slice of the sub-expression.
    #[error("[N:M] does not describe a valid slice")]
    InvalidSlice,

    /// `@-N` tried to move the cursor before the start of the disk.
    #[error("@-{n} must not be larger than the current offset {offset}")]
    NegativeOffset {
        /// How far back the expression asked to move.
        n: u64,
        /// The cursor position it asked to move from.
        offset: u64,
    },

    /// A `<FILE` reference could not be read.
    #[error("{path}: {source}")]
    File {
        /// The file that failed.
        path: String,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A `<(SCRIPT)` pipeline could not be run or exited non-zero.
    #[error("script: {0}")]
    Script(String),

    /// The target allocator failed.
    #[error(transparent)]
    Alloc(#[from] vblk_alloc::Error),
}

impl Error {
    /// Builds a parse error at `offset`.
    pub(crate) fn parse_at(offset: usize, msg: impl Into<String>) -> Self {
        Self::Parse { offset, msg: msg.into() }
    }
}

/// Compiles `source` and evaluates it into `a`, returning the virtual
/// size implied by the expression (the maximum cursor reached).
pub fn compile(source: &str, vars: &Variables, a: &dyn Allocator) -> Result<u64> {
    let mut ast = Ast::new();
    let root = parse::parse_into(&mut ast, vars, source)?;
    let root = optimize::optimize(&mut ast, root);
    tracing::trace!(ast = %ast.display(root), "compiled data expression");
    eval::evaluate(&ast, root, a)
}
