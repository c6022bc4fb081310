//! The expression evaluator.
//!
//! Walks a (normally optimized) tree, writing bytes into an allocator
//! while tracking a cursor and the maximum offset reached, which
//! becomes the implied disk size.  Nested expressions, repeats,
//! slices and name references evaluate into a fresh sparse
//! sub-allocator that is then blitted into the parent at the cursor,
//! except for the file and script slices that can stream just the
//! requested window.

use std::io::{BufReader, Read, Seek, SeekFrom};
use std::process::{Command, Stdio};

use vblk_alloc::allocator::SparseArray;
use vblk_alloc::{Allocator, util};

use crate::ast::{Ast, Node, NodeId};
use crate::{Error, Result};

/// Copy chunk size for files and scripts.
const COPY_CHUNK: usize = 65536;

/// Evaluates the tree at `root` into `a`, returning the implied size
/// (the maximum cursor position reached).
pub fn evaluate(ast: &Ast, root: NodeId, a: &dyn Allocator) -> Result<u64> {
    let mut scopes = Scopes::default();
    let mut offset = 0;
    let mut size = 0;
    eval_list(ast, &mut scopes, None, root, a, &mut offset, &mut size)?;
    Ok(size)
}

/// One name binding, linked to the scope it was made in.
struct Binding {
    /// The bound name.
    name: String,
    /// The bound expression.
    id: NodeId,
    /// The scope visible at the time of the assignment.  Name
    /// references replay their expression in *this* environment, not
    /// the caller's.
    parent: Option<usize>,
}

/// Arena of bindings; a scope is an index chain through it.
#[derive(Default)]
struct Scopes {
    /// All bindings made during this evaluation.
    bindings: Vec<Binding>,
}

impl Scopes {
    /// Resolves `name` starting from `scope`, returning the binding
    /// index.
    fn resolve(&self, mut scope: Option<usize>, name: &str) -> Option<usize> {
        while let Some(i) = scope {
            if self.bindings[i].name == name {
                return Some(i);
            }
            scope = self.bindings[i].parent;
        }
        None
    }
}

/// Evaluates `root` (a list, or any single node) under `scope`.
fn eval_list(
    ast: &Ast,
    scopes: &mut Scopes,
    scope: Option<usize>,
    root: NodeId,
    a: &dyn Allocator,
    offset: &mut u64,
    size: &mut u64,
) -> Result<()> {
    let ids: Vec<NodeId> = match ast.get(root) {
        Node::List(ids) => ids.clone(),
        _ => vec![root],
    };
    // Assignments extend the scope for the remainder of this list.
    let mut scope = scope;

    for id in ids {
        match ast.get(id) {
            Node::Null => {}

            // Lists only nest before optimization; evaluate in place.
            Node::List(_) => {
                eval_list(ast, scopes, scope, id, a, offset, size)?;
            }

            Node::Byte(b) => {
                a.write(&[*b], *offset)?;
                *offset += 1;
            }

            Node::AbsOffset(n) => *offset = *n,

            Node::RelOffset(n) => {
                if *n < 0 && n.unsigned_abs() > *offset {
                    return Err(Error::NegativeOffset { n: n.unsigned_abs(), offset: *offset });
                }
                *offset = offset.wrapping_add_signed(*n);
            }

            Node::AlignOffset(n) => *offset = util::round_up(*offset, *n),

            Node::File(path) => store_file(a, path, offset)?,

            Node::Script(script) => store_script(a, script, None, offset)?,

            Node::Str(s) => {
                a.write(s, *offset)?;
                *offset += s.len() as u64;
            }

            Node::Fill { byte, count } => {
                a.fill(*byte, *count, *offset)?;
                *offset += count;
            }

            Node::Assign { name, id } => {
                scopes.bindings.push(Binding { name: name.clone(), id: *id, parent: scope });
                scope = Some(scopes.bindings.len() - 1);
            }

            Node::Name(name) => {
                let Some(binding) = scopes.resolve(scope, name) else {
                    return Err(Error::UndefinedName(name.clone()));
                };
                let (bound_id, captured) =
                    (scopes.bindings[binding].id, scopes.bindings[binding].parent);
                // Replay the expression in the environment captured at
                // assignment time, into a fresh sub-allocator.
                let sub = SparseArray::new();
                let mut sub_offset = 0;
                let mut sub_size = 0;
                eval_list(ast, scopes, captured, bound_id, &sub, &mut sub_offset, &mut sub_size)?;
                a.blit(&sub, sub_size, 0, *offset)?;
                *offset += sub_size;
            }

            Node::Slice { id: inner, start, end }
                if matches!(ast.get(*inner), Node::File(_)) =>
            {
                // <FILE[N:M] reads only the requested window, so
                // unbounded files are safe to slice.
                let Node::File(path) = ast.get(*inner) else { unreachable!() };
                store_file_slice(a, path, *start, *end, offset)?;
            }

            Node::Slice { id: inner, start: 0, end: Some(end) }
                if matches!(ast.get(*inner), Node::Script(_)) =>
            {
                // <(SCRIPT)[:M] stops reading the pipeline after M
                // bytes.
                let Node::Script(script) = ast.get(*inner) else { unreachable!() };
                store_script(a, script, Some(*end), offset)?;
            }

            Node::Nested(_) | Node::Repeat { .. } | Node::Slice { .. } => {
                let inner = match ast.get(id) {
                    Node::Nested(inner) | Node::Repeat { id: inner, .. }
                    | Node::Slice { id: inner, .. } => *inner,
                    _ => unreachable!("matched above"),
                };
                // Evaluate into a fresh context: new allocator, cursor
                // reset to zero.
                let sub = SparseArray::new();
                let mut sub_offset = 0;
                let mut sub_size = 0;
                eval_list(ast, scopes, scope, inner, &sub, &mut sub_offset, &mut sub_size)?;

                match ast.get(id) {
                    Node::Nested(_) => {
                        a.blit(&sub, sub_size, 0, *offset)?;
                        *offset += sub_size;
                    }
                    Node::Repeat { count, .. } => {
                        for _ in 0..*count {
                            a.blit(&sub, sub_size, 0, *offset)?;
                            *offset += sub_size;
                        }
                    }
                    Node::Slice { start, end, .. } => {
                        let end = end.unwrap_or(sub_size);
                        if *start > end || end > sub_size {
                            return Err(Error::InvalidSlice);
                        }
                        a.blit(&sub, end - start, *start, *offset)?;
                        *offset += end - start;
                    }
                    _ => unreachable!("matched above"),
                }
            }
        }

        // The implied size is the high-water mark of the cursor.
        if *size < *offset {
            *size = *offset;
        }
    }
    Ok(())
}

/// Streams a whole file into the allocator at the cursor.
fn store_file(a: &dyn Allocator, path: &str, offset: &mut u64) -> Result<()> {
    let file = std::fs::File::open(path)
        .map_err(|source| Error::File { path: path.to_owned(), source })?;
    copy_stream(a, BufReader::new(file), None, offset)
        .map_err(|source| Error::File { path: path.to_owned(), source })
}

/// Streams `<FILE[N:M]` by seeking to N and reading only the window.
fn store_file_slice(
    a: &dyn Allocator,
    path: &str,
    start: u64,
    end: Option<u64>,
    offset: &mut u64,
) -> Result<()> {
    if let Some(end) = end
        && start > end
    {
        return Err(Error::InvalidSlice);
    }
    let mut file = std::fs::File::open(path)
        .map_err(|source| Error::File { path: path.to_owned(), source })?;
    file.seek(SeekFrom::Start(start))
        .map_err(|source| Error::File { path: path.to_owned(), source })?;
    let limit = end.map(|end| end - start);
    copy_stream(a, BufReader::new(file), limit, offset)
        .map_err(|source| Error::File { path: path.to_owned(), source })
}

/// Runs a shell pipeline and streams its standard output into the
/// allocator, optionally stopping after `limit` bytes.
fn store_script(
    a: &dyn Allocator,
    script: &str,
    limit: Option<u64>,
    offset: &mut u64,
) -> Result<()> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Script(format!("sh: {e}")))?;
    let Some(stdout) = child.stdout.take() else {
        return Err(Error::Script("no pipe from child".to_owned()));
    };
    let copied = copy_stream(a, stdout, limit, offset);
    if limit.is_some() {
        // The pipeline may still be producing; closing the pipe above
        // ends it, and its exit status is not meaningful then.
        let _ = child.kill();
        let _ = child.wait();
        copied.map_err(|e| Error::Script(e.to_string()))?;
        return Ok(());
    }
    let status = child.wait().map_err(|e| Error::Script(format!("wait: {e}")))?;
    copied.map_err(|e| Error::Script(e.to_string()))?;
    if !status.success() {
        return Err(Error::Script(format!("{script:?} failed: {status}")));
    }
    Ok(())
}

/// Copies from a reader into the allocator at the cursor, stopping at
/// EOF or after `limit` bytes.
fn copy_stream(
    a: &dyn Allocator,
    mut reader: impl Read,
    limit: Option<u64>,
    offset: &mut u64,
) -> std::io::Result<()> {
    let mut remaining = limit;
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let want = match remaining {
            Some(0) => break,
            Some(r) => buf.len().min(usize::try_from(r).unwrap_or(usize::MAX)),
            None => buf.len(),
        };
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        a.write(&buf[..n], *offset).map_err(std::io::Error::other)?;
        *offset += n as u64;
        if let Some(r) = &mut remaining {
            *r -= n as u64;
        }
    }
    Ok(())
}
