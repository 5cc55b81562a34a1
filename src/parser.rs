//! Line-oriented grammar engine.
//!
//! Every scope (file, message body, enum body, service body, rpc body) owns an
//! ordered list of [Visitor]s. Each classified line goes to the first visitor
//! that accepts it; block visitors pull their body from the same [LineIter]
//! and hand it to the registry of the nested scope.

use std::fmt;
use std::sync::LazyLock;

use compact_str::{format_compact, CompactString};
use regex::Regex;
use smallvec::SmallVec;

use crate::lexer::{find_unquoted, normalize_space, Line, LineIter, LineToken};
use crate::{
    Attribute, Enum, EnumValue, FieldKind, Import, ImportModifier, Message, Package, ProtoOption,
    Qualified, Reserved, Rpc, RpcOption, RpcParameter, Service,
};

static RPC_SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^rpc\s+(\w+)\s*\(([^)]*)\)\s*returns\s*\(([^)]*)\)").unwrap()
});

static DEFAULT_GRAMMAR: LazyLock<Grammar> = LazyLock::new(Grammar::default);

/// The shared grammar used by [crate::parse_str] and [crate::parse_file].
pub fn default_grammar() -> &'static Grammar {
    &DEFAULT_GRAMMAR
}

/// One grammar production.
pub trait Visitor: Send + Sync {
    /// Short name used in log events.
    fn name(&self) -> &'static str;

    fn can_visit(&self, line: &Line) -> bool;

    /// Builds a node from `line`. Block productions keep pulling lines from
    /// `iter` up to and including the `}` that closes their own block.
    /// `Ok(None)` means the line was consumed without producing anything.
    fn visit(
        &self,
        grammar: &Grammar,
        iter: &mut LineIter,
        line: &Line,
        namespace: &str,
    ) -> Result<Option<Node>, ParseError>;
}

/// Everything a visitor can produce.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Comment(CompactString),
    Package {
        name: CompactString,
        comment: CompactString,
    },
    Import(Import),
    Option(ProtoOption),
    Message(Message),
    Enum(Enum),
    EnumValue(EnumValue),
    Reserved(Vec<Reserved>),
    Attribute(Attribute),
    Service(Service),
    Rpc(Rpc),
    RpcOption(RpcOption),
}

impl Node {
    pub fn kind_str(&self) -> &'static str {
        match *self {
            Node::Comment(_) => "comment",
            Node::Package { .. } => "package",
            Node::Import(_) => "import",
            Node::Option(_) => "option",
            Node::Message(_) => "message",
            Node::Enum(_) => "enum",
            Node::EnumValue(_) => "enum value",
            Node::Reserved(_) => "reserved",
            Node::Attribute(_) => "attribute",
            Node::Service(_) => "service",
            Node::Rpc(_) => "rpc",
            Node::RpcOption(_) => "rpc option",
        }
    }

    /// The documentation slot of the node, if it takes documentation.
    fn comment_mut(&mut self) -> Option<&mut CompactString> {
        match *self {
            Node::Comment(_) | Node::Reserved(_) => None,
            Node::Package {
                ref mut comment, ..
            } => Some(comment),
            Node::Import(ref mut i) => Some(&mut i.comment),
            Node::Option(ref mut o) => Some(&mut o.comment),
            Node::Message(ref mut m) => Some(&mut m.qualified.comment),
            Node::Enum(ref mut e) => Some(&mut e.qualified.comment),
            Node::EnumValue(ref mut v) => Some(&mut v.qualified.comment),
            Node::Attribute(ref mut a) => Some(&mut a.qualified.comment),
            Node::Service(ref mut s) => Some(&mut s.qualified.comment),
            Node::Rpc(ref mut r) => Some(&mut r.qualified.comment),
            Node::RpcOption(ref mut o) => Some(&mut o.qualified.comment),
        }
    }

    fn is_valid(&self) -> bool {
        match *self {
            Node::Attribute(ref a) => a.is_valid(),
            _ => true,
        }
    }
}

/// Comments seen in a scope that no declaration has claimed yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingComment(CompactString);

impl PendingComment {
    pub fn push(&mut self, comment: &str) {
        if comment.is_empty() {
            return;
        }
        if !self.0.is_empty() {
            self.0.push(' ');
        }
        self.0.push_str(comment);
    }

    /// The pending text followed by a declaration's own trailing comment.
    pub fn attach(&self, own: &str) -> CompactString {
        normalize_space(&format_compact!("{} {}", self.0, own))
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    File,
    Message,
    Enum,
    Service,
    Rpc,
}

/// Ordered visitor registries, one per scope.
pub struct Grammar {
    file: Vec<Box<dyn Visitor>>,
    message: Vec<Box<dyn Visitor>>,
    enumeration: Vec<Box<dyn Visitor>>,
    service: Vec<Box<dyn Visitor>>,
    rpc: Vec<Box<dyn Visitor>>,
}

impl fmt::Debug for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |v: &[Box<dyn Visitor>]| v.iter().map(|v| v.name()).collect::<Vec<_>>();
        f.debug_struct("Grammar")
            .field("file", &names(&self.file))
            .field("message", &names(&self.message))
            .field("enum", &names(&self.enumeration))
            .field("service", &names(&self.service))
            .field("rpc", &names(&self.rpc))
            .finish()
    }
}

impl Default for Grammar {
    fn default() -> Self {
        Grammar::empty()
            .with_visitor(Scope::File, CommentVisitor)
            .with_visitor(Scope::File, PackageVisitor)
            .with_visitor(Scope::File, ImportVisitor)
            .with_visitor(Scope::File, OptionVisitor)
            .with_visitor(Scope::File, MessageVisitor)
            .with_visitor(Scope::File, ReservedVisitor)
            .with_visitor(Scope::File, EnumVisitor)
            .with_visitor(Scope::File, AttributeVisitor)
            .with_visitor(Scope::File, ServiceVisitor)
            .with_visitor(Scope::File, SkipBlockVisitor)
            .with_visitor(Scope::Message, CommentVisitor)
            .with_visitor(Scope::Message, MessageVisitor)
            .with_visitor(Scope::Message, EnumVisitor)
            .with_visitor(Scope::Message, ReservedVisitor)
            // attribute lines never open a block, so it goes after every opener
            .with_visitor(Scope::Message, AttributeVisitor)
            .with_visitor(Scope::Message, SkipBlockVisitor)
            .with_visitor(Scope::Enum, CommentVisitor)
            .with_visitor(Scope::Enum, EnumValueVisitor)
            .with_visitor(Scope::Enum, SkipBlockVisitor)
            .with_visitor(Scope::Service, CommentVisitor)
            .with_visitor(Scope::Service, RpcVisitor)
            .with_visitor(Scope::Service, SkipBlockVisitor)
            .with_visitor(Scope::Rpc, CommentVisitor)
            .with_visitor(Scope::Rpc, RpcOptionVisitor)
            .with_visitor(Scope::Rpc, SkipBlockVisitor)
    }
}

impl Grammar {
    /// A grammar with no visitors at all; every line is skipped.
    pub fn empty() -> Grammar {
        Grammar {
            file: vec![],
            message: vec![],
            enumeration: vec![],
            service: vec![],
            rpc: vec![],
        }
    }

    /// Appends `visitor` to the end of the registry for `scope`.
    pub fn with_visitor(mut self, scope: Scope, visitor: impl Visitor + 'static) -> Grammar {
        self.registry_mut(scope).push(Box::new(visitor));
        self
    }

    pub fn visitors(&self, scope: Scope) -> &[Box<dyn Visitor>] {
        match scope {
            Scope::File => &self.file,
            Scope::Message => &self.message,
            Scope::Enum => &self.enumeration,
            Scope::Service => &self.service,
            Scope::Rpc => &self.rpc,
        }
    }

    fn registry_mut(&mut self, scope: Scope) -> &mut Vec<Box<dyn Visitor>> {
        match scope {
            Scope::File => &mut self.file,
            Scope::Message => &mut self.message,
            Scope::Enum => &mut self.enumeration,
            Scope::Service => &mut self.service,
            Scope::Rpc => &mut self.rpc,
        }
    }

    /// Parses a whole document. Malformed declarations are logged and
    /// skipped, so this never fails.
    pub fn parse(&self, inp: &str, path: impl Into<camino::Utf8PathBuf>) -> Package {
        let mut package = Package::new(path);
        let mut iter = LineIter::new(inp);
        self.walk(Scope::File, &mut iter, "", |node| match node {
            Node::Package { name, comment } => {
                package.name = name;
                package.comment = comment;
                true
            }
            Node::Import(i) => {
                package.imports.push(i);
                true
            }
            Node::Option(o) => {
                package.options.push(o);
                true
            }
            Node::Message(m) => {
                package.messages.push(m);
                true
            }
            Node::Enum(e) => {
                package.enums.push(e);
                true
            }
            Node::Service(s) => {
                package.services.push(s);
                true
            }
            _ => false,
        });
        package.graph = crate::graph::build(&package);
        package
    }

    /// Runs the visit loop of one scope. Nested scopes stop at the first `}`
    /// line, which is consumed here and nowhere else. `accept` decides whether
    /// a node belongs in this scope; refused nodes leave pending comments for
    /// the next declaration.
    pub fn walk(
        &self,
        scope: Scope,
        iter: &mut LineIter,
        namespace: &str,
        mut accept: impl FnMut(Node) -> bool,
    ) {
        let mut namespace = CompactString::from(namespace);
        let mut pending = PendingComment::default();
        while let Some(line) = iter.next() {
            if scope != Scope::File && line.token == LineToken::CloseBrace {
                return;
            }
            let Some(visitor) = self.visitors(scope).iter().find(|v| v.can_visit(&line)) else {
                tracing::trace!(line = line.number, syntax = %line.syntax, ?scope, "no visitor");
                continue;
            };
            let mut node = match visitor.visit(self, iter, &line, &namespace) {
                Ok(Some(node)) => node,
                Ok(None) => {
                    // comments above a skipped block belong to it
                    if line.token == LineToken::OpenBrace {
                        pending.clear();
                    }
                    continue;
                }
                Err(err) => {
                    tracing::warn!(
                        line = err.line,
                        visitor = visitor.name(),
                        error = %err,
                        "skipping malformed declaration"
                    );
                    if line.token == LineToken::OpenBrace {
                        skip_block(iter);
                    }
                    continue;
                }
            };
            if let Node::Comment(ref comment) = node {
                pending.push(comment);
                continue;
            }
            if !node.is_valid() {
                tracing::debug!(line = line.number, syntax = %line.syntax, "rejected invalid {}", node.kind_str());
                continue;
            }
            let documented = match node.comment_mut() {
                Some(comment) => {
                    *comment = pending.attach(comment);
                    true
                }
                None => false,
            };
            let package_name = match node {
                Node::Package { ref name, .. } => Some(name.clone()),
                _ => None,
            };
            let kind = node.kind_str();
            if accept(node) {
                if documented {
                    pending.clear();
                }
                if let Some(name) = package_name {
                    namespace = name;
                }
            } else {
                tracing::debug!(line = line.number, ?scope, "{kind} is not allowed here");
            }
        }
    }
}

/// Consumes lines up to the `}` balancing a block whose opening line was
/// already read.
fn skip_block(iter: &mut LineIter) {
    let mut depth = 1usize;
    for line in iter.by_ref() {
        match line.token {
            LineToken::OpenBrace => depth += 1,
            LineToken::CloseBrace => {
                depth -= 1;
                if depth == 0 {
                    return;
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub line: usize,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("expected {0}")]
    MissingField(&'static str),
    #[error("expected `{0}`")]
    ExpectedToken(&'static str),
    #[error("malformed field declaration `{0}`")]
    MalformedField(CompactString),
    #[error("malformed map type `{0}`")]
    MalformedMap(CompactString),
    #[error("malformed rpc signature `{0}`")]
    MalformedRpc(CompactString),
    #[error("invalid number `{0}`")]
    InvalidNumber(CompactString),
}

fn parse_error(line: &Line, kind: ParseErrorKind) -> ParseError {
    ParseError {
        line: line.number,
        kind,
    }
}

fn first_field_is(line: &Line, keyword: &str) -> bool {
    line.syntax.split(' ').next() == Some(keyword)
}

fn field<'l>(line: &'l Line, at: usize, what: &'static str) -> Result<&'l str, ParseError> {
    line.syntax
        .split(' ')
        .nth(at)
        .filter(|f| !f.is_empty())
        .ok_or_else(|| parse_error(line, ParseErrorKind::MissingField(what)))
}

fn strip_quotes(inp: &str) -> &str {
    inp.trim_matches(|c| c == '"' || c == '\'')
}

/// Decimal (optionally signed) or `0x` hex.
pub(crate) fn parse_number(inp: &str) -> Option<i32> {
    let inp = inp.trim();
    let (negative, digits) = match inp.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, inp),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    let value = if negative { -value } else { value };
    i32::try_from(value).ok()
}

/// Field and enum ordinals: anything that is not a number counts as 0.
fn parse_ordinal(inp: &str) -> i32 {
    parse_number(inp).unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
pub struct CommentVisitor;

impl Visitor for CommentVisitor {
    fn name(&self) -> &'static str {
        "comment"
    }

    fn can_visit(&self, line: &Line) -> bool {
        line.is_comment()
    }

    fn visit(
        &self,
        _: &Grammar,
        _: &mut LineIter,
        line: &Line,
        _: &str,
    ) -> Result<Option<Node>, ParseError> {
        Ok(Some(Node::Comment(line.comment.clone())))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PackageVisitor;

impl Visitor for PackageVisitor {
    fn name(&self) -> &'static str {
        "package"
    }

    fn can_visit(&self, line: &Line) -> bool {
        line.token == LineToken::Semicolon && first_field_is(line, "package")
    }

    fn visit(
        &self,
        _: &Grammar,
        _: &mut LineIter,
        line: &Line,
        _: &str,
    ) -> Result<Option<Node>, ParseError> {
        let name = field(line, 1, "package name")?;
        Ok(Some(Node::Package {
            name: name.into(),
            comment: line.comment.clone(),
        }))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImportVisitor;

impl Visitor for ImportVisitor {
    fn name(&self) -> &'static str {
        "import"
    }

    fn can_visit(&self, line: &Line) -> bool {
        line.token == LineToken::Semicolon && first_field_is(line, "import")
    }

    fn visit(
        &self,
        _: &Grammar,
        _: &mut LineIter,
        line: &Line,
        _: &str,
    ) -> Result<Option<Node>, ParseError> {
        let modifier = match field(line, 1, "import path")? {
            "public" => ImportModifier::Public,
            "weak" => ImportModifier::Weak,
            _ => ImportModifier::None,
        };
        let path = line
            .fields()
            .last()
            .map(|path| strip_quotes(path))
            .filter(|path| !path.is_empty())
            .ok_or_else(|| parse_error(line, ParseErrorKind::MissingField("import path")))?;
        Ok(Some(Node::Import(Import {
            path: path.into(),
            modifier,
            comment: line.comment.clone(),
        })))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OptionVisitor;

impl Visitor for OptionVisitor {
    fn name(&self) -> &'static str {
        "option"
    }

    fn can_visit(&self, line: &Line) -> bool {
        line.token == LineToken::Semicolon && first_field_is(line, "option")
    }

    fn visit(
        &self,
        _: &Grammar,
        _: &mut LineIter,
        line: &Line,
        _: &str,
    ) -> Result<Option<Node>, ParseError> {
        let (name, value) = split_option(line)?;
        Ok(Some(Node::Option(ProtoOption {
            name: name.into(),
            value: value.trim_matches('"').into(),
            comment: line.comment.clone(),
        })))
    }
}

/// `option <name> = <value>` into its trimmed halves.
fn split_option(line: &Line) -> Result<(&str, &str), ParseError> {
    let rest = line.syntax.strip_prefix("option").unwrap_or(&line.syntax).trim();
    let (name, value) = rest
        .split_once('=')
        .ok_or_else(|| parse_error(line, ParseErrorKind::ExpectedToken("=")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(parse_error(line, ParseErrorKind::MissingField("option name")));
    }
    Ok((name, value.trim()))
}

#[derive(Debug, Clone, Copy)]
pub struct MessageVisitor;

impl Visitor for MessageVisitor {
    fn name(&self) -> &'static str {
        "message"
    }

    fn can_visit(&self, line: &Line) -> bool {
        line.token == LineToken::OpenBrace && first_field_is(line, "message")
    }

    fn visit(
        &self,
        grammar: &Grammar,
        iter: &mut LineIter,
        line: &Line,
        namespace: &str,
    ) -> Result<Option<Node>, ParseError> {
        let name = field(line, 1, "message name")?;
        let mut message = Message::new(Qualified::new(namespace, name, line.comment.as_str()));
        let fqn = message.qualified.fqn();
        grammar.walk(Scope::Message, iter, &fqn, |node| match node {
            Node::Message(m) => {
                message.messages.push(m);
                true
            }
            Node::Enum(e) => {
                message.enums.push(e);
                true
            }
            Node::Reserved(r) => {
                message.reserved.extend(r);
                true
            }
            Node::Attribute(a) => {
                message.attributes.push(a);
                true
            }
            _ => false,
        });
        Ok(Some(Node::Message(message)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnumVisitor;

impl Visitor for EnumVisitor {
    fn name(&self) -> &'static str {
        "enum"
    }

    fn can_visit(&self, line: &Line) -> bool {
        line.token == LineToken::OpenBrace && first_field_is(line, "enum")
    }

    fn visit(
        &self,
        grammar: &Grammar,
        iter: &mut LineIter,
        line: &Line,
        namespace: &str,
    ) -> Result<Option<Node>, ParseError> {
        let name = field(line, 1, "enum name")?;
        let mut en = Enum::new(Qualified::new(namespace, name, line.comment.as_str()));
        let fqn = en.qualified.fqn();
        grammar.walk(Scope::Enum, iter, &fqn, |node| match node {
            Node::EnumValue(v) => {
                en.values.push(v);
                true
            }
            _ => false,
        });
        Ok(Some(Node::Enum(en)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnumValueVisitor;

impl Visitor for EnumValueVisitor {
    fn name(&self) -> &'static str {
        "enum value"
    }

    fn can_visit(&self, line: &Line) -> bool {
        line.token == LineToken::Semicolon
            && line.syntax.contains('=')
            && !first_field_is(line, "option")
            && !first_field_is(line, "reserved")
    }

    fn visit(
        &self,
        _: &Grammar,
        _: &mut LineIter,
        line: &Line,
        namespace: &str,
    ) -> Result<Option<Node>, ParseError> {
        let (name, rest) = line
            .syntax
            .split_once('=')
            .ok_or_else(|| parse_error(line, ParseErrorKind::ExpectedToken("=")))?;
        let name = name.trim();
        if name.is_empty() || name.contains(' ') {
            return Err(parse_error(
                line,
                ParseErrorKind::MalformedField(line.syntax.clone()),
            ));
        }
        let ordinal = rest.split('[').next().unwrap_or_default();
        Ok(Some(Node::EnumValue(EnumValue {
            qualified: Qualified::new(namespace, name, line.comment.as_str()),
            ordinal: parse_ordinal(ordinal),
        })))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReservedVisitor;

impl Visitor for ReservedVisitor {
    fn name(&self) -> &'static str {
        "reserved"
    }

    fn can_visit(&self, line: &Line) -> bool {
        line.token == LineToken::Semicolon && first_field_is(line, "reserved")
    }

    fn visit(
        &self,
        _: &Grammar,
        _: &mut LineIter,
        line: &Line,
        _: &str,
    ) -> Result<Option<Node>, ParseError> {
        let ranges = parse_reserved(line)?;
        if ranges.is_empty() {
            // only reserved names
            return Ok(None);
        }
        Ok(Some(Node::Reserved(ranges)))
    }
}

/// `reserved 2, 9 to 11, 40 to max, "name";` with names left out.
fn parse_reserved(line: &Line) -> Result<Vec<Reserved>, ParseError> {
    let rest = line.syntax.strip_prefix("reserved").unwrap_or(&line.syntax).trim();
    let mut ranges = vec![];
    for part in rest.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if part.starts_with('"') || part.starts_with('\'') {
            continue;
        }
        let number = |inp: &str| {
            parse_number(inp)
                .ok_or_else(|| parse_error(line, ParseErrorKind::InvalidNumber(inp.into())))
        };
        let range = match part.split_once(" to ") {
            Some((start, end)) => {
                let end = match end.trim() {
                    "max" => i32::MAX,
                    end => number(end)?,
                };
                Reserved::new(number(start)?, end)
            }
            None => {
                let n = number(part)?;
                Reserved::new(n, n)
            }
        };
        ranges.push(range);
    }
    Ok(ranges)
}

#[derive(Debug, Clone, Copy)]
pub struct AttributeVisitor;

impl Visitor for AttributeVisitor {
    fn name(&self) -> &'static str {
        "attribute"
    }

    fn can_visit(&self, line: &Line) -> bool {
        // `syntax = "proto3"` has a single word before `=`
        line.token == LineToken::Semicolon
            && !first_field_is(line, "option")
            && (first_field_is(line, "reserved")
                || line
                    .syntax
                    .split_once('=')
                    .is_some_and(|(decl, _)| decl.trim().contains(' ')))
    }

    fn visit(
        &self,
        grammar: &Grammar,
        iter: &mut LineIter,
        line: &Line,
        namespace: &str,
    ) -> Result<Option<Node>, ParseError> {
        if first_field_is(line, "reserved") {
            return ReservedVisitor.visit(grammar, iter, line, namespace);
        }
        parse_attribute(line, namespace).map(|a| Some(Node::Attribute(a)))
    }
}

fn parse_attribute(line: &Line, namespace: &str) -> Result<Attribute, ParseError> {
    let (decl, rest) = line
        .syntax
        .split_once('=')
        .ok_or_else(|| parse_error(line, ParseErrorKind::ExpectedToken("=")))?;
    let (ordinal, annotation) = match find_unquoted(rest, '[') {
        Some(at) => (&rest[..at], Some(&rest[at + 1..])),
        None => (rest, None),
    };
    let decl = decl.trim();
    let (kind, name) = match decl
        .strip_prefix("map")
        .map(str::trim_start)
        .filter(|r| r.starts_with('<'))
    {
        Some(map) => parse_map(line, map)?,
        None => {
            let words: SmallVec<[&str; 4]> = decl.split(' ').collect();
            match words[..] {
                ["repeated", ty, name] => (FieldKind::Repeated(ty.into()), name),
                ["optional", ty, name] => (FieldKind::Optional(ty.into()), name),
                ["required", ty, name] | [ty, name] => (FieldKind::Plain(ty.into()), name),
                _ => {
                    return Err(parse_error(
                        line,
                        ParseErrorKind::MalformedField(decl.into()),
                    ))
                }
            }
        }
    };
    Ok(Attribute {
        qualified: Qualified::new(namespace, name, line.comment.as_str()),
        kind,
        ordinal: parse_ordinal(ordinal),
        annotations: annotation.and_then(parse_annotation).into_iter().collect(),
    })
}

/// `<K, V> name` after the `map` keyword.
fn parse_map<'l>(line: &Line, map: &'l str) -> Result<(FieldKind, &'l str), ParseError> {
    let malformed = || parse_error(line, ParseErrorKind::MalformedMap(map.into()));
    let close = map.rfind('>').ok_or_else(malformed)?;
    let (key, value) = map[1..close].split_once(',').ok_or_else(malformed)?;
    let name = map[close + 1..].trim();
    if name.contains(' ') {
        return Err(malformed());
    }
    let kind = FieldKind::Map {
        key: key.trim().into(),
        value: value.trim().into(),
    };
    Ok((kind, name))
}

/// The first `name = value` of a bracketed option list.
fn parse_annotation(inp: &str) -> Option<crate::Annotation> {
    let inner = match inp.rfind(']') {
        Some(at) => &inp[..at],
        None => inp,
    };
    let first = match find_unquoted(inner, ',') {
        Some(at) => &inner[..at],
        None => inner,
    };
    let eq = find_unquoted(first, '=')?;
    let (name, value) = (first[..eq].trim(), &first[eq + 1..]);
    if name.is_empty() {
        return None;
    }
    Some(crate::Annotation {
        name: name.into(),
        value: value.trim().trim_matches('\'').into(),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceVisitor;

impl Visitor for ServiceVisitor {
    fn name(&self) -> &'static str {
        "service"
    }

    fn can_visit(&self, line: &Line) -> bool {
        line.token == LineToken::OpenBrace && first_field_is(line, "service")
    }

    fn visit(
        &self,
        grammar: &Grammar,
        iter: &mut LineIter,
        line: &Line,
        namespace: &str,
    ) -> Result<Option<Node>, ParseError> {
        let name = field(line, 1, "service name")?;
        let mut service = Service::new(Qualified::new(namespace, name, line.comment.as_str()));
        let fqn = service.qualified.fqn();
        grammar.walk(Scope::Service, iter, &fqn, |node| match node {
            Node::Rpc(r) => {
                service.rpcs.push(r);
                true
            }
            _ => false,
        });
        Ok(Some(Node::Service(service)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RpcVisitor;

impl Visitor for RpcVisitor {
    fn name(&self) -> &'static str {
        "rpc"
    }

    fn can_visit(&self, line: &Line) -> bool {
        matches!(line.token, LineToken::Semicolon | LineToken::OpenBrace)
            && first_field_is(line, "rpc")
    }

    fn visit(
        &self,
        grammar: &Grammar,
        iter: &mut LineIter,
        line: &Line,
        namespace: &str,
    ) -> Result<Option<Node>, ParseError> {
        let caps = RPC_SIGNATURE
            .captures(&line.syntax)
            .ok_or_else(|| parse_error(line, ParseErrorKind::MalformedRpc(line.syntax.clone())))?;
        let mut rpc = Rpc::new(Qualified::new(namespace, &caps[1], line.comment.as_str()));
        rpc.input_parameters = parse_parameters(&caps[2]);
        rpc.return_parameters = parse_parameters(&caps[3]);
        if line.token == LineToken::OpenBrace {
            let fqn = rpc.qualified.fqn();
            grammar.walk(Scope::Rpc, iter, &fqn, |node| match node {
                Node::RpcOption(o) => {
                    rpc.options.push(o);
                    true
                }
                _ => false,
            });
        }
        Ok(Some(Node::Rpc(rpc)))
    }
}

fn parse_parameters(inp: &str) -> Vec<RpcParameter> {
    inp.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.strip_prefix("stream ") {
            Some(kind) => RpcParameter {
                stream: true,
                kind: kind.trim().into(),
            },
            None => RpcParameter {
                stream: false,
                kind: p.into(),
            },
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct RpcOptionVisitor;

impl Visitor for RpcOptionVisitor {
    fn name(&self) -> &'static str {
        "rpc option"
    }

    fn can_visit(&self, line: &Line) -> bool {
        matches!(line.token, LineToken::Semicolon | LineToken::OpenBrace)
            && first_field_is(line, "option")
    }

    fn visit(
        &self,
        _: &Grammar,
        iter: &mut LineIter,
        line: &Line,
        namespace: &str,
    ) -> Result<Option<Node>, ParseError> {
        let (name, value) = split_option(line)?;
        let name = name.trim_start_matches('(').trim_end_matches(')');
        let body = match line.token {
            LineToken::OpenBrace => read_block_body(iter),
            _ => value.trim_matches('"').into(),
        };
        Ok(Some(Node::RpcOption(RpcOption {
            qualified: Qualified::new(namespace, name, line.comment.as_str()),
            body,
        })))
    }
}

/// Reassembles the statements of a block, nested braces included, up to the
/// `}` that closes it.
fn read_block_body(iter: &mut LineIter) -> CompactString {
    let mut body = CompactString::default();
    let mut depth = 1usize;
    let mut push = |text: &str| {
        if text.is_empty() {
            return;
        }
        if !body.is_empty() {
            body.push(' ');
        }
        body.push_str(text);
    };
    for line in iter.by_ref() {
        match line.token {
            LineToken::OpenBrace => {
                depth += 1;
                push(format_compact!("{} {{", line.syntax).as_str());
            }
            LineToken::CloseBrace => {
                depth -= 1;
                push(line.syntax.as_str());
                if depth == 0 {
                    break;
                }
                push("}");
            }
            LineToken::Semicolon => push(format_compact!("{};", line.syntax).as_str()),
            LineToken::None => push(line.syntax.as_str()),
            LineToken::InlineComment | LineToken::BlockComment => {}
        }
    }
    body
}

/// Consumes any block no other visitor recognized (`oneof`, `extend`,
/// aggregate options) so its body cannot leak into the enclosing scope.
#[derive(Debug, Clone, Copy)]
pub struct SkipBlockVisitor;

impl Visitor for SkipBlockVisitor {
    fn name(&self) -> &'static str {
        "skip block"
    }

    fn can_visit(&self, line: &Line) -> bool {
        line.token == LineToken::OpenBrace
    }

    fn visit(
        &self,
        _: &Grammar,
        iter: &mut LineIter,
        line: &Line,
        _: &str,
    ) -> Result<Option<Node>, ParseError> {
        tracing::debug!(line = line.number, syntax = %line.syntax, "skipping block");
        skip_block(iter);
        Ok(None)
    }
}
