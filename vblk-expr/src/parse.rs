//! The expression parser.
//!
//! A hand-written byte-wise parser.  `(` recurses with `level + 1`
//! and returns on the matching `)`; unbalanced parentheses are
//! errors.  Whitespace only separates tokens, `#` starts a comment
//! running to the end of the line.

use crate::ast::{Ast, Node, NodeId};
use crate::{Error, Result, Variables};

/// Parses `source` into `ast`, returning the root node id.
pub fn parse_into(ast: &mut Ast, vars: &Variables, source: &str) -> Result<NodeId> {
    let mut parser = Parser { bytes: source.as_bytes(), pos: 0, ast, vars };
    parser.list(0)
}

/// Parser state over one source string.
struct Parser<'a> {
    /// The expression text.
    bytes: &'a [u8],
    /// Current position.
    pos: usize,
    /// The shared node arena.
    ast: &'a mut Ast,
    /// `$VAR` definitions.
    vars: &'a Variables,
}

impl Parser<'_> {
    /// Parses a list of expressions until end of input (level 0) or
    /// the matching `)`.
    fn list(&mut self, level: u32) -> Result<NodeId> {
        let mut list: Vec<NodeId> = Vec::new();
        while let Some(&c) = self.bytes.get(self.pos) {
            match c {
                b'#' => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }

                b'@' => {
                    self.pos += 1;
                    let node = self.offset_directive()?;
                    let id = self.ast.push(node);
                    list.push(id);
                }

                b'(' => {
                    self.pos += 1;
                    let id = self.list(level + 1)?;
                    let id = self.ast.push(Node::Nested(id));
                    list.push(id);
                }

                b')' => {
                    if level < 1 {
                        return Err(self.error("unmatched ')' in data string"));
                    }
                    self.pos += 1;
                    return Ok(self.ast.push(Node::List(list)));
                }

                b'*' => {
                    self.pos += 1;
                    let id = self.pop_data_operand(&mut list, "*N")?;
                    let count =
                        self.integer().ok_or_else(|| self.error("*N not numeric"))?;
                    let id = self.ast.push(Node::Repeat { id, count });
                    list.push(id);
                }

                b'[' => {
                    self.pos += 1;
                    let id = self.pop_data_operand(&mut list, "[N:M]")?;
                    let start = self.integer().unwrap_or(0);
                    if self.bytes.get(self.pos) != Some(&b':') {
                        return Err(self.error("enclosed pattern (...)[N:M] not numeric"));
                    }
                    self.pos += 1;
                    let end = self.integer();
                    if self.bytes.get(self.pos) != Some(&b']') {
                        return Err(self.error("enclosed pattern (...)[N:M] not numeric"));
                    }
                    self.pos += 1;
                    let id = self.ast.push(Node::Slice { id, start, end });
                    list.push(id);
                }

                b'<' => {
                    let node = if self.bytes.get(self.pos + 1) == Some(&b'(') {
                        self.pos += 2;
                        Node::Script(self.script()?)
                    } else {
                        self.pos += 1;
                        Node::File(self.filename()?)
                    };
                    let id = self.ast.push(node);
                    list.push(id);
                }

                b'"' => {
                    self.pos += 1;
                    let s = self.string()?;
                    let id = self.ast.push(Node::Str(s));
                    list.push(id);
                }

                b'\\' => {
                    let name = self.name()?;
                    let id = self.ast.push(Node::Name(name));
                    list.push(id);
                }

                b'-' => {
                    if self.bytes.get(self.pos + 1) != Some(&b'>') {
                        return Err(self.error("parsing error"));
                    }
                    self.pos += 2;
                    let id = self.pop_data_operand(&mut list, "->")?;
                    self.skip_whitespace();
                    let name = self.name()?;
                    let id = self.ast.push(Node::Assign { name, id });
                    list.push(id);
                }

                b'$' => {
                    let name = self.variable()?;
                    let content = match self.vars.get(&name) {
                        Some(v) => v.clone(),
                        None => std::env::var(&name)
                            .map_err(|_| Error::UndefinedVariable(name.clone()))?,
                    };
                    // Parse the expansion recursively at level 0.
                    let mut sub = Parser {
                        bytes: content.as_bytes(),
                        pos: 0,
                        ast: &mut *self.ast,
                        vars: self.vars,
                    };
                    let id = sub.list(0)?;
                    let id = self.ast.push(Node::Nested(id));
                    list.push(id);
                }

                b'0'..=b'9' => {
                    let pos = self.pos;
                    let b = self
                        .integer()
                        .filter(|&b| b <= 255)
                        .ok_or_else(|| Error::parse_at(pos, "BYTE must be in the range 0..255"))?;
                    let id = self.ast.push(Node::Byte(b as u8));
                    list.push(id);
                }

                b'l' | b'b' => {
                    let s = self.word()?;
                    let id = self.ast.push(Node::Str(s));
                    list.push(id);
                }

                b' ' | b'\t' | b'\n' | b'\x0c' | b'\r' | b'\x0b' => self.pos += 1,

                _ => return Err(self.error("parsing error")),
            }
        }

        // End of input with an open paren means an unmatched '('.
        if level > 0 {
            return Err(self.error("unmatched '(' in data string"));
        }
        Ok(self.ast.push(Node::List(list)))
    }

    /// Parses the directive after `@`: `N`, `+N`, `-N` or `^N`.
    fn offset_directive(&mut self) -> Result<Node> {
        match self.bytes.get(self.pos) {
            Some(b'+') => {
                self.pos += 1;
                let n = self.signless_integer("@+")?;
                let n = i64::try_from(n)
                    .map_err(|_| self.error("@+N out of range"))?;
                Ok(Node::RelOffset(n))
            }
            Some(b'-') => {
                self.pos += 1;
                let n = self.signless_integer("@-")?;
                let n = i64::try_from(n)
                    .map_err(|_| self.error("@-N out of range"))?;
                Ok(Node::RelOffset(-n))
            }
            Some(b'^') => {
                self.pos += 1;
                let n = self.signless_integer("@^")?;
                if !n.is_power_of_two() {
                    return Err(self.error(format!("@^{n} must be a power of 2")));
                }
                Ok(Node::AlignOffset(n))
            }
            Some(b'0'..=b'9') => {
                let n = self.integer().ok_or_else(|| self.error("parsing error"))?;
                Ok(Node::AbsOffset(n))
            }
            _ => Err(self.error("parsing error")),
        }
    }

    /// Parses an integer after an offset sigil, rejecting a sign.
    fn signless_integer(&mut self, what: &str) -> Result<u64> {
        if matches!(self.bytes.get(self.pos), Some(b'-' | b'+')) {
            return Err(self.error(format!("data parameter after {what} must not be negative")));
        }
        self.integer().ok_or_else(|| self.error("parsing error"))
    }

    /// Pops the preceding expression as the operand of `*N`, `[N:M]`
    /// or `->`, rejecting offset directives.
    fn pop_data_operand(&mut self, list: &mut Vec<NodeId>, op: &str) -> Result<NodeId> {
        let Some(&last) = list.last() else {
            return Err(self.error(format!("{op} must follow an expression")));
        };
        if !self.ast.get(last).is_data() {
            return Err(self.error(format!("{op} cannot be applied to this type of expression")));
        }
        list.pop();
        Ok(last)
    }

    /// Scans an unsigned integer with C `%i` syntax: `0x` hex, leading
    /// `0` octal, else decimal.  Returns `None` without consuming
    /// anything if no integer starts here.
    fn integer(&mut self) -> Option<u64> {
        let rest = &self.bytes[self.pos.min(self.bytes.len())..];
        let mut len = 0;
        if rest.starts_with(b"0x") || rest.starts_with(b"0X") {
            len = 2;
            while len < rest.len() && rest[len].is_ascii_hexdigit() {
                len += 1;
            }
            if len == 2 {
                return None;
            }
        } else {
            while len < rest.len() && rest[len].is_ascii_digit() {
                len += 1;
            }
            if len == 0 {
                return None;
            }
        }
        let text = std::str::from_utf8(&rest[..len]).ok()?;
        let value = vblk_alloc::util::parse_u64(text)?;
        self.pos += len;
        Some(value)
    }

    /// Parses the body of a `"string"` with C-style escapes.  The
    /// opening quote has been consumed.
    fn string(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(&c) = self.bytes.get(self.pos) {
            match c {
                b'"' => {
                    self.pos += 1;
                    return Ok(out);
                }
                b'\\' => {
                    self.pos += 1;
                    let &e = self
                        .bytes
                        .get(self.pos)
                        .ok_or_else(|| self.error("unterminated string"))?;
                    self.pos += 1;
                    let b = match e {
                        b'a' => 0x07,
                        b'b' => 0x08,
                        b'f' => 0x0c,
                        b'n' => 0x0a,
                        b'r' => 0x0d,
                        b't' => 0x09,
                        b'v' => 0x0b,
                        b'\\' | b'"' => e,
                        b'x' => {
                            let hi = self.hex_digit()?;
                            let lo = self.hex_digit()?;
                            hi * 16 + lo
                        }
                        b'0'..=b'9' | b'u' => {
                            return Err(self.error(
                                "string numeric and unicode sequences are not yet implemented",
                            ));
                        }
                        other => other,
                    };
                    out.push(b);
                }
                _ => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
        Err(self.error("unterminated string"))
    }

    /// One hexadecimal digit of a `\xNN` escape.
    fn hex_digit(&mut self) -> Result<u8> {
        let err = || self.error("\\xNN must be followed by exactly two hexadecimal characters");
        let &c = self.bytes.get(self.pos).ok_or_else(err)?;
        let v = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => return Err(err()),
        };
        self.pos += 1;
        Ok(v)
    }

    /// Parses a `le16:`/`be64:`-style integer word into its raw bytes.
    fn word(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        while self.pos < self.bytes.len() && !self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        let token = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| Error::parse_at(start, "invalid token"))?;
        let (width, little_endian, digits) = match token.split_once(':') {
            Some(("le16", d)) => (2, true, d),
            Some(("le32", d)) => (4, true, d),
            Some(("le64", d)) => (8, true, d),
            Some(("be16", d)) => (2, false, d),
            Some(("be32", d)) => (4, false, d),
            Some(("be64", d)) => (8, false, d),
            _ => {
                return Err(Error::parse_at(
                    start,
                    "expected \"le16/32/64:\" or \"be16/32/64:\"",
                ));
            }
        };
        let value = vblk_alloc::util::parse_u64(digits)
            .ok_or_else(|| Error::parse_at(start, format!("{token}: not numeric")))?;
        let max = match width {
            2 => u64::from(u16::MAX),
            4 => u64::from(u32::MAX),
            _ => u64::MAX,
        };
        if value > max {
            return Err(Error::parse_at(start, format!("{token}: value out of range")));
        }
        let bytes =
            if little_endian { value.to_le_bytes() } else { value.to_be_bytes() };
        Ok(if little_endian {
            bytes[..width].to_vec()
        } else {
            bytes[8 - width..].to_vec()
        })
    }

    /// Parses the filename after `<`, running to the first `*`, `[`,
    /// `)` or whitespace.
    fn filename(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(&c) = self.bytes.get(self.pos) {
            if matches!(c, b'*' | b'[' | b')' | b' ' | b'\t' | b'\n') {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.error("<FILE not a filename"));
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .map(str::to_owned)
            .map_err(|_| Error::parse_at(start, "filename is not valid UTF-8"))
    }

    /// Parses the pipeline of `<(SCRIPT)`, honouring nested
    /// parentheses.  The `<(` has been consumed.
    fn script(&mut self) -> Result<String> {
        let start = self.pos;
        let mut depth = 0u32;
        while let Some(&c) = self.bytes.get(self.pos) {
            match c {
                b'(' => depth += 1,
                b')' => {
                    if depth == 0 {
                        let script = std::str::from_utf8(&self.bytes[start..self.pos])
                            .map_err(|_| Error::parse_at(start, "script is not valid UTF-8"))?
                            .to_owned();
                        if script.is_empty() {
                            return Err(self.error("parsing error"));
                        }
                        self.pos += 1; // the closing paren
                        return Ok(script);
                    }
                    depth -= 1;
                }
                _ => {}
            }
            self.pos += 1;
        }
        Err(self.error("unterminated <(SCRIPT)"))
    }

    /// Parses a `\name` (leading whitespace allowed, backslash
    /// required); returns the name without the backslash.
    fn name(&mut self) -> Result<String> {
        self.skip_whitespace();
        if self.bytes.get(self.pos) != Some(&b'\\') {
            return Err(self.error("expected \\NAME"));
        }
        self.pos += 1;
        let start = self.pos;
        while let Some(&c) = self.bytes.get(self.pos) {
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'-' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("expected \\NAME"));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    /// Parses a `$VAR` name: `[A-Za-z_][A-Za-z0-9_]*`.
    fn variable(&mut self) -> Result<String> {
        debug_assert_eq!(self.bytes.get(self.pos), Some(&b'$'));
        self.pos += 1;
        let start = self.pos;
        match self.bytes.get(self.pos) {
            Some(&c) if c.is_ascii_alphabetic() || c == b'_' => self.pos += 1,
            _ => return Err(self.error("expected $VAR")),
        }
        while let Some(&c) = self.bytes.get(self.pos) {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    /// Skips insignificant whitespace.
    fn skip_whitespace(&mut self) {
        while let Some(&c) = self.bytes.get(self.pos) {
            if c.is_ascii_whitespace() || c == b'\x0b' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    /// A parse error at the current position.
    fn error(&self, msg: impl Into<String>) -> Error {
        Error::parse_at(self.pos, msg)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Result<(Ast, NodeId)> {
        let mut ast = Ast::new();
        let vars = Variables::new();
        let root = parse_into(&mut ast, &vars, src)?;
        Ok((ast, root))
    }

    fn parse_display(src: &str) -> String {
        let (ast, root) = parse(src).unwrap();
        ast.display(root).to_string()
    }

    #[test]
    fn bytes_and_offsets() {
        assert_eq!(parse_display("0 1 0xff @0x200 @+8 @-2 @^512"), "[0 1 255 @512 @+8 @-2 @^512]");
    }

    #[test]
    fn comments_and_whitespace() {
        assert_eq!(parse_display("1 # trailing comment\n 2"), "[1 2]");
        assert_eq!(parse_display(""), "[]");
        assert_eq!(parse_display("# only a comment"), "[]");
    }

    #[test]
    fn nested_expressions() {
        assert_eq!(parse_display("(1 2)*3"), "[(([1 2]))*3]");
        assert!(parse("(1").is_err()); // unmatched (
        assert!(parse("1)").is_err()); // unmatched )
    }

    #[test]
    fn repeat_and_slice_need_data_operands() {
        assert!(parse("*3").is_err());
        assert!(parse("@0*3").is_err());
        assert!(parse("@4[0:1]").is_err());
        assert!(parse("-> \\x").is_err());
        assert!(parse("@1 -> \\x").is_err());
    }

    #[test]
    fn slice_forms() {
        assert_eq!(parse_display("\"ab\"[1:2]"), "[(\"ab\")[1:2]]");
        assert_eq!(parse_display("\"ab\"[:2]"), "[(\"ab\")[0:2]]");
        assert_eq!(parse_display("\"ab\"[1:]"), "[(\"ab\")[1:]]");
        assert_eq!(parse_display("\"ab\"[:]"), "[(\"ab\")[0:]]");
        assert!(parse("\"ab\"[1-2]").is_err());
    }

    #[test]
    fn strings_with_escapes() {
        assert_eq!(parse_display(r#""a\tb""#), "[\"a\\x09b\"]");
        assert_eq!(parse_display(r#""\x41\x42""#), "[\"AB\"]");
        assert!(parse(r#""\q""#).is_ok()); // unknown escapes pass through
        assert!(parse(r#""\0""#).is_err()); // octal unimplemented
        assert!(parse(r#""\u1234""#).is_err()); // unicode unimplemented
        assert!(parse(r#""unterminated"#).is_err());
        assert!(parse(r#""bad\x4""#).is_err());
    }

    #[test]
    fn endian_words() {
        assert_eq!(parse_display("le16:0xAA55"), "[\"U\\xaa\"]");
        assert_eq!(parse_display("be16:0xAA55"), "[\"\\xaaU\"]");
        assert_eq!(parse_display("le32:1"), "[\"\\x01\\x00\\x00\\x00\"]");
        assert_eq!(parse_display("be64:1"), "[\"\\x00\\x00\\x00\\x00\\x00\\x00\\x00\\x01\"]");
        assert!(parse("le16:0x10000").is_err()); // out of range
        assert!(parse("le24:1").is_err());
        assert!(parse("lemon").is_err());
    }

    #[test]
    fn files_and_scripts() {
        assert_eq!(parse_display("</dev/null"), "[</dev/null]");
        assert_eq!(parse_display("</some/file[0:2]"), "[(</some/file)[0:2]]");
        assert_eq!(parse_display("<(echo (x))"), "[<(echo (x))]");
        assert!(parse("<").is_err());
        assert!(parse("<(echo x").is_err());
    }

    #[test]
    fn names_and_assignments() {
        assert_eq!(parse_display("1 -> \\a \\a"), "[(1) -> \\a \\a]");
        assert_eq!(parse_display("(1 2) -> \\a-b_2 \\a-b_2"), "[(([1 2])) -> \\a-b_2 \\a-b_2]");
        assert!(parse("\\").is_err());
    }

    #[test]
    fn negative_offsets_rejected() {
        assert!(parse("@+-3").is_err());
        assert!(parse("@--3").is_err());
        assert!(parse("@^3").is_err()); // not a power of two
    }

    #[test]
    fn byte_range_enforced() {
        assert!(parse("256").is_err());
        assert!(parse("0x100").is_err());
        assert!(parse("255").is_ok());
    }
}
