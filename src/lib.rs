use camino::{Utf8Path, Utf8PathBuf};
use compact_str::{format_compact, CompactString};
use serde::Serialize;
use smallvec::{smallvec, SmallVec};

pub mod graph;
pub mod lexer;
pub mod parser;

pub use graph::{Graph, GraphError, Vertex, VertexKind};
pub use lexer::comment_lines;
pub use parser::{Grammar, ParseError, ParseErrorKind};

const SCALARS: [&str; 15] = [
    "double", "float", "int32", "int64", "uint32", "uint64", "sint32", "sint64", "fixed32",
    "fixed64", "sfixed32", "sfixed64", "bool", "string", "bytes",
];

/// Whether `type_name` is a built-in scalar rather than a reference to a
/// message or enum.
pub fn is_scalar(type_name: &str) -> bool {
    SCALARS.contains(&type_name)
}

/// Parses a document with the default grammar. Malformed declarations are
/// logged and skipped.
pub fn parse_str(inp: &str, path: impl Into<Utf8PathBuf>) -> Package {
    parser::default_grammar().parse(inp, path)
}

pub fn parse_str_with(grammar: &Grammar, inp: &str, path: impl Into<Utf8PathBuf>) -> Package {
    grammar.parse(inp, path)
}

/// Reads and parses one file.
pub fn parse_file(path: impl AsRef<Utf8Path>) -> Result<Package, Error> {
    let path = path.as_ref();
    let inp = std::fs::read_to_string(path).map_err(|e| Error {
        path: path.to_owned(),
        kind: ErrorKind::Io(e),
    })?;
    tracing::debug!(path = %path, bytes = inp.len(), "parsing");
    Ok(parse_str(&inp, path))
}

#[derive(Debug, thiserror::Error)]
#[error("failed to read `{path}`: {kind}")]
pub struct Error {
    pub path: Utf8PathBuf,
    pub kind: ErrorKind,
}

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Name, enclosing scope and documentation shared by every named entity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Qualified {
    /// Dotted path of the enclosing scope; empty at the top level of a file
    /// without a `package` statement.
    pub qualifier: CompactString,
    pub name: CompactString,
    pub comment: CompactString,
}

impl Qualified {
    pub fn new(qualifier: &str, name: &str, comment: &str) -> Qualified {
        Qualified {
            qualifier: qualifier.into(),
            name: name.into(),
            comment: comment.into(),
        }
    }

    pub fn fqn(&self) -> CompactString {
        if self.qualifier.is_empty() {
            self.name.clone()
        } else {
            format_compact!("{}.{}", self.qualifier, self.name)
        }
    }
}

/// Everything parsed from one file.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Package {
    pub path: Utf8PathBuf,
    pub name: CompactString,
    pub comment: CompactString,
    pub options: Vec<ProtoOption>,
    pub imports: Vec<Import>,
    pub messages: Vec<Message>,
    pub enums: Vec<Enum>,
    pub services: Vec<Service>,
    pub graph: Graph,
}

impl Package {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Package {
        Package {
            path: path.into(),
            ..Package::default()
        }
    }

    /// Looks up a top-level or nested message by its dotted name.
    pub fn message(&self, fqn: &str) -> Option<&Message> {
        fn find<'m>(messages: &'m [Message], fqn: &str) -> Option<&'m Message> {
            messages.iter().find_map(|m| {
                if m.qualified.fqn() == fqn {
                    Some(m)
                } else {
                    find(&m.messages, fqn)
                }
            })
        }
        find(&self.messages, fqn)
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|o| o.name == name)
            .map(|o| o.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Import {
    pub path: CompactString,
    pub modifier: ImportModifier,
    pub comment: CompactString,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportModifier {
    #[default]
    None,
    Public,
    Weak,
}

/// A file level `option name = value;`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtoOption {
    pub name: CompactString,
    pub value: CompactString,
    pub comment: CompactString,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    #[serde(flatten)]
    pub qualified: Qualified,
    pub attributes: Vec<Attribute>,
    pub messages: Vec<Message>,
    pub enums: Vec<Enum>,
    pub reserved: Vec<Reserved>,
}

impl Message {
    pub fn new(qualified: Qualified) -> Message {
        Message {
            qualified,
            attributes: vec![],
            messages: vec![],
            enums: vec![],
            reserved: vec![],
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.qualified.name == name)
    }

    /// Attributes ordered by field number.
    pub fn attributes_by_ordinal(&self) -> Vec<&Attribute> {
        let mut attributes: Vec<&Attribute> = self.attributes.iter().collect();
        attributes.sort_by_key(|a| a.ordinal);
        attributes
    }

    pub fn is_reserved(&self, ordinal: i32) -> bool {
        self.reserved.iter().any(|r| r.contains(ordinal))
    }
}

/// A message field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attribute {
    #[serde(flatten)]
    pub qualified: Qualified,
    pub kind: FieldKind,
    pub ordinal: i32,
    pub annotations: Vec<Annotation>,
}

impl Attribute {
    /// Fields with an empty name or type, or without a positive field number,
    /// are never attached to a message.
    pub fn is_valid(&self) -> bool {
        !self.qualified.name.is_empty()
            && self.kind.kinds().iter().all(|k| !k.is_empty())
            && self.ordinal >= 1
    }
}

/// Label and type(s) of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "label", content = "type", rename_all = "lowercase")]
pub enum FieldKind {
    Plain(CompactString),
    Optional(CompactString),
    Repeated(CompactString),
    Map {
        key: CompactString,
        value: CompactString,
    },
}

impl FieldKind {
    /// The declared type, or key and value types for a map.
    pub fn kinds(&self) -> SmallVec<[&str; 2]> {
        match *self {
            FieldKind::Plain(ref ty) | FieldKind::Optional(ref ty) | FieldKind::Repeated(ref ty) => {
                smallvec![ty.as_str()]
            }
            FieldKind::Map { ref key, ref value } => smallvec![key.as_str(), value.as_str()],
        }
    }

    pub fn is_repeated(&self) -> bool {
        matches!(*self, FieldKind::Repeated(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(*self, FieldKind::Map { .. })
    }

    pub fn is_optional(&self) -> bool {
        matches!(*self, FieldKind::Optional(_))
    }
}

/// A bracketed field option such as `[json_name = 'lng']`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub name: CompactString,
    pub value: CompactString,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enum {
    #[serde(flatten)]
    pub qualified: Qualified,
    pub values: Vec<EnumValue>,
}

impl Enum {
    pub fn new(qualified: Qualified) -> Enum {
        Enum {
            qualified,
            values: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumValue {
    #[serde(flatten)]
    pub qualified: Qualified,
    pub ordinal: i32,
}

/// Inclusive range of reserved field numbers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Reserved {
    pub start: i32,
    pub end: i32,
}

impl Reserved {
    pub fn new(start: i32, end: i32) -> Reserved {
        Reserved { start, end }
    }

    pub fn contains(&self, ordinal: i32) -> bool {
        (self.start..=self.end).contains(&ordinal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Service {
    #[serde(flatten)]
    pub qualified: Qualified,
    pub rpcs: Vec<Rpc>,
}

impl Service {
    pub fn new(qualified: Qualified) -> Service {
        Service {
            qualified,
            rpcs: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rpc {
    #[serde(flatten)]
    pub qualified: Qualified,
    pub input_parameters: Vec<RpcParameter>,
    pub return_parameters: Vec<RpcParameter>,
    pub options: Vec<RpcOption>,
}

impl Rpc {
    pub fn new(qualified: Qualified) -> Rpc {
        Rpc {
            qualified,
            input_parameters: vec![],
            return_parameters: vec![],
            options: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcParameter {
    pub stream: bool,
    pub kind: CompactString,
}

/// An option inside an rpc body. `body` is the option value as written,
/// without the outer braces of an aggregate value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcOption {
    #[serde(flatten)]
    pub qualified: Qualified,
    pub body: CompactString,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_single_message() {
        let package = parse_str(
            "package shop;\n\nmessage Item {\n  string name = 1;\n  int32 id = 2;\n}\n",
            "shop.proto",
        );
        assert_eq!(package.name, "shop");
        assert_eq!(package.messages.len(), 1);
        let item = &package.messages[0];
        assert_eq!(item.qualified.fqn(), "shop.Item");
        let ordinals: Vec<i32> = item.attributes.iter().map(|a| a.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2]);
        assert_eq!(item.attributes[0].qualified.name, "name");
        assert_eq!(item.attributes[1].kind, FieldKind::Plain("int32".into()));
    }

    #[test]
    fn scenario_streaming_rpc() {
        let package = parse_str("service S { rpc List(Req) returns (stream Resp); }", "s.proto");
        assert_eq!(package.services.len(), 1);
        let rpcs = &package.services[0].rpcs;
        assert_eq!(rpcs.len(), 1);
        assert_eq!(
            rpcs[0].input_parameters,
            vec![RpcParameter {
                stream: false,
                kind: "Req".into()
            }]
        );
        assert_eq!(
            rpcs[0].return_parameters,
            vec![RpcParameter {
                stream: true,
                kind: "Resp".into()
            }]
        );
    }

    #[test]
    fn scenario_enum_values() {
        let package = parse_str("enum E { A = 0; B = 1; }", "e.proto");
        let values: Vec<(&str, i32)> = package.enums[0]
            .values
            .iter()
            .map(|v| (v.qualified.name.as_str(), v.ordinal))
            .collect();
        assert_eq!(values, vec![("A", 0), ("B", 1)]);
    }

    #[test]
    fn scenario_annotation() {
        let package = parse_str("message P { int32 lon = 3 [json_name = 'lng']; }", "p.proto");
        let lon = package.messages[0].attribute("lon").unwrap();
        assert_eq!(
            lon.annotations,
            vec![Annotation {
                name: "json_name".into(),
                value: "lng".into()
            }]
        );
    }

    #[test]
    fn comments_accumulate_onto_the_next_declaration() {
        let package = parse_str(
            "message M {\n  // first\n  /* second */\n  // third\n  int32 a = 1; // own\n  int32 b = 2;\n}\n",
            "m.proto",
        );
        let m = &package.messages[0];
        assert_eq!(m.attributes[0].qualified.comment, "first second third own");
        assert!(m.attributes[1].qualified.comment.is_empty());
    }

    #[test]
    fn rejected_attribute_keeps_pending_comment() {
        let package = parse_str(
            "message M {\n  // about b\n  int32 a = 0;\n  int32 b = 2;\n}\n",
            "m.proto",
        );
        let m = &package.messages[0];
        assert_eq!(m.attributes.len(), 1);
        assert_eq!(m.attributes[0].qualified.name, "b");
        assert_eq!(m.attributes[0].qualified.comment, "about b");
    }

    #[test]
    fn reserved_does_not_take_the_comment() {
        let package = parse_str(
            "message M {\n  // about a\n  reserved 2, 4 to 6;\n  int32 a = 1;\n}\n",
            "m.proto",
        );
        let m = &package.messages[0];
        assert_eq!(m.reserved, vec![Reserved::new(2, 2), Reserved::new(4, 6)]);
        assert!(m.is_reserved(5));
        assert!(!m.is_reserved(3));
        assert_eq!(m.attributes[0].qualified.comment, "about a");
    }

    #[test]
    fn comment_is_not_carried_across_scopes() {
        let package = parse_str(
            "message M {\n  int32 a = 1;\n  // dangling\n}\nmessage N {}\n",
            "m.proto",
        );
        assert!(package.messages[1].qualified.comment.is_empty());
    }

    #[test]
    fn package_takes_leading_comment() {
        let package = parse_str("// Shop API.\npackage shop; // v1\n", "shop.proto");
        assert_eq!(package.comment, "Shop API. v1");
    }

    #[test]
    fn nested_entities_are_qualified_by_their_parent() {
        let package = parse_str(
            "package a.b;\nmessage Outer {\n  message Inner {\n    enum Kind { K = 0; }\n    Kind kind = 1;\n  }\n  Inner inner = 1;\n}\n",
            "n.proto",
        );
        let outer = &package.messages[0];
        assert_eq!(outer.qualified.qualifier, "a.b");
        let inner = package.message("a.b.Outer.Inner").unwrap();
        assert_eq!(inner.qualified.qualifier, "a.b.Outer");
        assert_eq!(inner.enums[0].qualified.fqn(), "a.b.Outer.Inner.Kind");
        assert_eq!(inner.enums[0].values[0].qualified.qualifier, "a.b.Outer.Inner.Kind");
        assert_eq!(inner.attributes[0].qualified.qualifier, "a.b.Outer.Inner");
    }

    #[test]
    fn entities_before_package_have_no_qualifier() {
        let package = parse_str("message A {}\npackage p;\nmessage B {}\n", "q.proto");
        assert_eq!(package.messages[0].qualified.fqn(), "A");
        assert_eq!(package.messages[1].qualified.fqn(), "p.B");
    }

    #[test]
    fn unknown_blocks_are_skipped_whole() {
        let package = parse_str(
            "message M {\n  oneof choice {\n    string a = 1;\n    int32 b = 2;\n  }\n  bool c = 3;\n}\nmessage N {}\n",
            "o.proto",
        );
        assert_eq!(package.messages.len(), 2);
        let names: Vec<&str> = package.messages[0]
            .attributes
            .iter()
            .map(|a| a.qualified.name.as_str())
            .collect();
        assert_eq!(names, vec!["c"]);
    }

    #[test]
    fn comment_above_a_skipped_block_stays_with_it() {
        let package = parse_str(
            "message M {\n  // about the choice\n  oneof choice {\n    string s = 2;\n  }\n  int32 a = 1;\n}\n",
            "o.proto",
        );
        let a = &package.messages[0].attributes[0];
        assert_eq!(a.qualified.name, "a");
        assert!(a.qualified.comment.is_empty());
    }

    #[test]
    fn message_options_are_skipped() {
        let package = parse_str(
            "package p;\nmessage M {\n  option (my.opt) = 5;\n  option deprecated = true;\n  int32 a = 1;\n}\n",
            "p.proto",
        );
        let m = &package.messages[0];
        let names: Vec<&str> = m.attributes.iter().map(|a| a.qualified.name.as_str()).collect();
        assert_eq!(names, vec!["a"]);
        let vertex = package.graph.vertex(VertexKind::Message, "p.M").unwrap();
        assert_eq!(vertex.edge_count(), 0);
        assert_eq!(package.graph.vertex_count(), 1);
    }

    #[test]
    fn block_comments_inside_fields() {
        let package = parse_str(
            "message M {\n  int32 a = 1 /* note */;\n  int32 b = 2 /* x; y */;\n}\n",
            "m.proto",
        );
        let m = &package.messages[0];
        let fields: Vec<(&str, i32, &str)> = m
            .attributes
            .iter()
            .map(|a| (a.qualified.name.as_str(), a.ordinal, a.qualified.comment.as_str()))
            .collect();
        assert_eq!(fields, vec![("a", 1, "note"), ("b", 2, "x; y")]);
    }

    #[test]
    fn malformed_declaration_does_not_stop_parsing() {
        let package = parse_str(
            "service S {\n  rpc Broken returns;\n  rpc Ok(A) returns (B);\n}\nmessage {\n  int32 x = 1;\n}\nmessage After {}\n",
            "bad.proto",
        );
        assert_eq!(package.services[0].rpcs.len(), 1);
        assert_eq!(package.services[0].rpcs[0].qualified.name, "Ok");
        assert_eq!(package.messages.len(), 1);
        assert_eq!(package.messages[0].qualified.name, "After");
    }

    #[test]
    fn unclosed_block_ends_at_end_of_input() {
        let package = parse_str("message M {\n  int32 a = 1;\n", "open.proto");
        assert_eq!(package.messages.len(), 1);
        assert_eq!(package.messages[0].attributes.len(), 1);
    }

    #[test]
    fn rpc_with_options() {
        let package = parse_str(
            "service S {\n  rpc Get(GetReq) returns (Thing) {\n    option (google.api.http) = {\n      get: \"/v1/things/{id}\"\n    };\n    option deprecated = true;\n  }\n}\n",
            "o.proto",
        );
        let rpc = &package.services[0].rpcs[0];
        assert_eq!(rpc.qualified.fqn(), "S.Get");
        assert_eq!(rpc.options.len(), 2);
        assert_eq!(rpc.options[0].qualified.name, "google.api.http");
        assert_eq!(rpc.options[0].body, "get: \"/v1/things/{id}\"");
        assert_eq!(rpc.options[1].qualified.name, "deprecated");
        assert_eq!(rpc.options[1].body, "true");
    }

    #[test]
    fn file_level_declarations() {
        let package = parse_str(
            "syntax = \"proto3\";\nimport \"a.proto\";\nimport public \"b.proto\";\noption java_package = \"com.example\";\n",
            "f.proto",
        );
        assert_eq!(package.imports.len(), 2);
        assert_eq!(package.imports[1].modifier, ImportModifier::Public);
        assert_eq!(package.option("java_package"), Some("com.example"));
        assert!(package.messages.is_empty());
    }

    #[test]
    fn graph_links_references() {
        let package = parse_str(
            "package p;\nmessage A { B b = 1; repeated B bs = 2; string s = 3; map<string, State> m = 4; }\nmessage B {}\nenum State { ON = 0; }\nservice S { rpc Do(A) returns (google.protobuf.Empty); }\n",
            "g.proto",
        );
        let graph = &package.graph;
        assert_eq!(graph.vertex_count(), 4);
        let a = graph.vertex(VertexKind::Message, "p.A").unwrap();
        assert_eq!(a.edges(), &["MESSAGE:p.B", "ENUM:p.State"]);
        let s = graph.vertex(VertexKind::Service, "p.S").unwrap();
        assert_eq!(s.edges(), &["MESSAGE:p.A", "MESSAGE:google.protobuf.Empty"]);
        assert_eq!(a.properties().get("qualifier").map(|q| q.as_str()), Some("p"));
    }

    #[test]
    fn scalar_set() {
        assert!(is_scalar("sfixed64"));
        assert!(is_scalar("bytes"));
        assert!(!is_scalar("Timestamp"));
        assert!(!is_scalar("String"));
    }

    #[test]
    fn fqn_without_qualifier() {
        assert_eq!(Qualified::new("", "A", "").fqn(), "A");
        assert_eq!(Qualified::new("x.y", "A", "").fqn(), "x.y.A");
    }

    mod field_lines {
        use super::*;
        use proptest::prelude::*;

        fn ident() -> impl Strategy<Value = String> {
            "[a-z][a-z0-9_]{0,8}".prop_filter("keyword", |s| {
                !matches!(
                    s.as_str(),
                    "repeated" | "optional" | "required" | "reserved" | "map" | "message"
                        | "enum" | "option" | "oneof" | "service"
                )
            })
        }

        fn first_attribute(body: &str) -> Attribute {
            let package = parse_str(&format!("message M {{ {body} }}"), "prop.proto");
            package.messages[0].attributes[0].clone()
        }

        proptest! {
            #[test]
            fn plain_field(ty in ident(), name in ident(), n in 1..100_000i32) {
                let a = first_attribute(&format!("{ty} {name} = {n};"));
                prop_assert_eq!(a.qualified.name.as_str(), name.as_str());
                prop_assert_eq!(a.kind.kinds().to_vec(), vec![ty.as_str()]);
                prop_assert_eq!(a.ordinal, n);
                prop_assert!(!a.kind.is_repeated());
                prop_assert!(!a.kind.is_map());
            }

            #[test]
            fn repeated_field(ty in ident(), name in ident(), n in 1..100_000i32) {
                let a = first_attribute(&format!("repeated {ty} {name} = {n};"));
                prop_assert!(a.kind.is_repeated());
                prop_assert_eq!(a.kind.kinds().to_vec(), vec![ty.as_str()]);
            }

            #[test]
            fn map_field(
                k in ident(),
                v in ident(),
                name in ident(),
                n in 1..100_000i32,
                pad in " {0,2}",
            ) {
                let a = first_attribute(&format!("map<{pad}{k}{pad},{pad}{v}{pad}> {name} = {n};"));
                prop_assert!(a.kind.is_map());
                prop_assert_eq!(a.kind.kinds().to_vec(), vec![k.as_str(), v.as_str()]);
            }

            #[test]
            fn reserved_range(start in 1..1000i32, len in 0..1000i32) {
                let end = start + len;
                let package = parse_str(&format!("message M {{ reserved {start} to {end}; }}"), "r.proto");
                prop_assert_eq!(&package.messages[0].reserved, &vec![Reserved::new(start, end)]);
            }

            #[test]
            fn comments_join_in_order(comments in prop::collection::vec("[a-z]{1,6}( [a-z]{1,6}){0,2}", 0..5)) {
                let mut doc = String::from("message M {\n");
                for c in &comments {
                    doc.push_str(&format!("// {c}\n"));
                }
                doc.push_str("int32 a = 1; // own\n}\n");
                let package = parse_str(&doc, "c.proto");
                let mut expected = comments.join(" ");
                if !expected.is_empty() {
                    expected.push(' ');
                }
                expected.push_str("own");
                prop_assert_eq!(package.messages[0].attributes[0].qualified.comment.as_str(), expected.as_str());
            }
        }
    }
}
