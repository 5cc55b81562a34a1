use compact_str::CompactString;
use smallvec::SmallVec;

pub(crate) const LINE_COMMENT: &str = "//";
pub(crate) const BLOCK_COMMENT_OPEN: &str = "/*";
pub(crate) const BLOCK_COMMENT_CLOSE: &str = "*/";

/// Stands in for a newline inside a block comment so the whole comment stays
/// a single statement. Use [comment_lines] to get the display lines back.
pub const COMMENT_NEWLINE: &str = ":~:";

/// A whitespace-normalized statement: a `;`, `{` or `}` terminated piece of
/// syntax, or one complete comment.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Statement {
    /// One-based line of the input on which the statement starts.
    pub line: usize,
    pub text: CompactString,
}

/// Splits a document into statements.
///
/// Newlines only separate words; statements end at `;`, `{` and `}`. A `//`
/// comment trailing a statement on the same line, or a `/* */` comment inside
/// a statement, is placed *before* that statement so it is picked up as the
/// statement's documentation. A statement still open at the end of input is
/// dropped.
pub fn lex_statements(inp: &str) -> Vec<Statement> {
    let mut lexer = StatementLexer::default();
    for c in inp.chars() {
        lexer.munch(c);
    }
    lexer.finish()
}

#[derive(Debug)]
struct StatementLexer {
    statements: Vec<Statement>,
    buf: String,
    buf_line: usize,
    // `//` comment that started after some syntax on the same line
    trailing: Option<(usize, String)>,
    // `/* */` comment that started after some syntax
    inline_block: Option<(usize, String)>,
    line: usize,
    // a terminator was emitted on the current physical line
    token_reached: bool,
    quote: Option<char>,
    escaping: bool,
}

impl Default for StatementLexer {
    fn default() -> Self {
        StatementLexer {
            statements: vec![],
            buf: String::new(),
            buf_line: 1,
            trailing: None,
            inline_block: None,
            line: 1,
            token_reached: false,
            quote: None,
            escaping: false,
        }
    }
}

impl StatementLexer {
    fn munch(&mut self, c: char) {
        if self.buf.starts_with(BLOCK_COMMENT_OPEN) {
            self.munch_block_comment(c);
            return;
        }
        if self.buf.starts_with(LINE_COMMENT) {
            if c == '\n' {
                let comment = std::mem::take(&mut self.buf);
                self.emit_line_comment(self.buf_line, &comment);
                self.end_line();
            } else {
                self.buf.push(c);
            }
            return;
        }
        if self.inline_block.is_some() {
            self.munch_inline_block(c);
            return;
        }
        if let Some((_, ref mut comment)) = self.trailing {
            if c == '\n' {
                // the statement it trails is still open, so it already comes first
                if let Some((line, comment)) = self.trailing.take() {
                    self.emit(line, &comment);
                }
                self.end_line();
                if !self.buf.is_empty() {
                    self.buf.push(' ');
                }
            } else {
                comment.push(c);
            }
            return;
        }
        if c == '\n' {
            self.end_line();
            if !self.buf.is_empty() {
                self.buf.push(' ');
            }
            return;
        }
        if let Some(q) = self.quote {
            self.buf.push(c);
            if self.escaping {
                self.escaping = false;
            } else if c == '\\' {
                self.escaping = true;
            } else if c == q {
                self.quote = None;
            }
            return;
        }
        match c {
            ';' | '{' | '}' => {
                self.buf.push(c);
                let text = std::mem::take(&mut self.buf);
                self.emit(self.buf_line, &text);
                self.token_reached = true;
            }
            '"' | '\'' => {
                self.quote = Some(c);
                self.push_syntax(c);
            }
            '/' if self.buf.len() > 1 && self.buf.ends_with('/') => {
                // `//` after some syntax: the rest of the line is a comment
                self.buf.pop();
                self.trailing = Some((self.line, LINE_COMMENT.to_string()));
            }
            '*' if self.buf.len() > 1 && self.buf.ends_with('/') => {
                self.buf.pop();
                self.inline_block = Some((self.line, BLOCK_COMMENT_OPEN.to_string()));
            }
            c if c.is_whitespace() && self.buf.is_empty() => {}
            c => self.push_syntax(c),
        }
    }

    fn munch_block_comment(&mut self, c: char) {
        if c == '\n' {
            self.buf.push_str(COMMENT_NEWLINE);
            self.line += 1;
            self.token_reached = false;
            return;
        }
        self.buf.push(c);
        // `/*/` is not a closed comment
        if self.buf.len() >= 4 && self.buf.ends_with(BLOCK_COMMENT_CLOSE) {
            let text = std::mem::take(&mut self.buf);
            self.emit(self.buf_line, &text);
            self.token_reached = false;
        }
    }

    fn munch_inline_block(&mut self, c: char) {
        let Some((_, ref mut comment)) = self.inline_block else {
            return;
        };
        if c == '\n' {
            comment.push_str(COMMENT_NEWLINE);
            self.line += 1;
            self.token_reached = false;
            return;
        }
        comment.push(c);
        if comment.len() >= 4 && comment.ends_with(BLOCK_COMMENT_CLOSE) {
            // the statement it interrupts is still open, so it already comes first
            if let Some((line, comment)) = self.inline_block.take() {
                self.emit(line, &comment);
            }
            self.buf.push(' ');
        }
    }

    fn push_syntax(&mut self, c: char) {
        if self.buf.is_empty() {
            self.buf_line = self.line;
        }
        self.buf.push(c);
    }

    fn end_line(&mut self) {
        self.line += 1;
        self.token_reached = false;
        self.quote = None;
        self.escaping = false;
    }

    fn emit(&mut self, line: usize, text: &str) {
        let text = normalize_space(text);
        if !text.is_empty() {
            self.statements.push(Statement { line, text });
        }
    }

    fn emit_line_comment(&mut self, line: usize, comment: &str) {
        let text = normalize_space(comment);
        let stmt = Statement { line, text };
        if self.token_reached && !self.statements.is_empty() {
            // `message Foo { // about Foo` documents `message Foo {`
            let at = self.statements.len() - 1;
            self.statements.insert(at, stmt);
        } else {
            self.statements.push(stmt);
        }
    }

    fn finish(mut self) -> Vec<Statement> {
        if let Some((line, comment)) = self.trailing.take() {
            self.emit(line, &comment);
        }
        if let Some((line, comment)) = self.inline_block.take() {
            tracing::warn!(
                line,
                comment = %normalize_space(&comment),
                "dropping unterminated block comment at end of input"
            );
        }
        if self.buf.starts_with(LINE_COMMENT) {
            let comment = std::mem::take(&mut self.buf);
            self.emit_line_comment(self.buf_line, &comment);
        } else if !self.buf.trim().is_empty() {
            tracing::warn!(
                line = self.buf_line,
                statement = %self.buf.trim(),
                "dropping unterminated statement at end of input"
            );
        }
        self.statements
    }
}

/// Collapses every run of whitespace to one space and trims both ends.
pub fn normalize_space(inp: &str) -> CompactString {
    let mut out = CompactString::default();
    for word in inp.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Splits a stored comment back into display lines, dropping the decorative
/// `*` that commonly starts block comment lines.
pub fn comment_lines(comment: &str) -> impl Iterator<Item = &str> + '_ {
    comment
        .split(COMMENT_NEWLINE)
        .map(|line| line.trim().trim_start_matches('*').trim())
        .filter(|line| !line.is_empty())
}

/// Byte offset of the first `needle` outside single or double quotes.
pub(crate) fn find_unquoted(inp: &str, needle: char) -> Option<usize> {
    let mut quote = None;
    let mut escaping = false;
    for (at, c) in inp.char_indices() {
        match quote {
            Some(q) => {
                if escaping {
                    escaping = false;
                } else if c == '\\' {
                    escaping = true;
                } else if c == q {
                    quote = None;
                }
            }
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == needle => return Some(at),
            None => {}
        }
    }
    None
}

/// How a statement ends.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum LineToken {
    InlineComment,
    BlockComment,
    Semicolon,
    OpenBrace,
    CloseBrace,
    #[default]
    None,
}

/// A classified statement.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Line {
    /// One-based source line, zero when classified from a bare string.
    pub number: usize,
    /// The significant text before the terminator.
    pub syntax: CompactString,
    pub token: LineToken,
    pub comment: CompactString,
}

impl Line {
    pub fn new(inp: &str) -> Line {
        let mut line = Line::default();
        if let Some(rest) = inp.strip_prefix(LINE_COMMENT) {
            line.token = LineToken::InlineComment;
            line.comment = normalize_space(rest);
            return line;
        }
        if let Some(interior) = inp
            .strip_prefix(BLOCK_COMMENT_OPEN)
            .and_then(|rest| rest.strip_suffix(BLOCK_COMMENT_CLOSE))
        {
            line.token = LineToken::BlockComment;
            line.comment = normalize_space(interior);
            return line;
        }
        let terminator = [
            (';', LineToken::Semicolon),
            ('{', LineToken::OpenBrace),
            ('}', LineToken::CloseBrace),
        ]
        .into_iter()
        .find_map(|(c, tok)| find_unquoted(inp, c).map(|at| (at, tok)));
        if let Some((at, tok)) = terminator {
            line.syntax = normalize_space(&inp[..at]);
            line.token = tok;
            // a same-line comment the tokenizer did not split out
            if let Some(marker) = inp[at + 1..].find(LINE_COMMENT) {
                let start = at + 1 + marker + LINE_COMMENT.len();
                line.comment = normalize_space(&inp[start..]);
            }
        } else {
            line.syntax = normalize_space(inp);
        }
        line
    }

    pub fn from_statement(stmt: &Statement) -> Line {
        Line {
            number: stmt.line,
            ..Line::new(stmt.text.as_str())
        }
    }

    pub fn is_comment(&self) -> bool {
        matches!(
            self.token,
            LineToken::InlineComment | LineToken::BlockComment
        )
    }

    /// Space separated words of the syntax.
    pub fn fields(&self) -> SmallVec<[&str; 8]> {
        if self.syntax.is_empty() {
            return SmallVec::new();
        }
        self.syntax.split(' ').collect()
    }
}

/// The shared cursor every visitor pulls lines from.
#[derive(Debug, Clone)]
pub struct LineIter {
    statements: std::vec::IntoIter<Statement>,
    pub(crate) line: usize,
}

impl LineIter {
    pub fn new(inp: &str) -> LineIter {
        LineIter::from_statements(lex_statements(inp))
    }

    pub fn from_statements(statements: Vec<Statement>) -> LineIter {
        LineIter {
            statements: statements.into_iter(),
            line: 0,
        }
    }
}

impl Iterator for LineIter {
    type Item = Line;
    fn next(&mut self) -> Option<Line> {
        let stmt = self.statements.next()?;
        self.line = stmt.line;
        Some(Line::from_statement(&stmt))
    }
}
