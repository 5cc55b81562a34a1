//! Reference graph between the messages, enums and services of a package.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use compact_str::{format_compact, CompactString};

use crate::{is_scalar, Message, Package, Qualified};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VertexKind {
    Message,
    Enum,
    Service,
}

impl VertexKind {
    pub fn as_str(&self) -> &'static str {
        match *self {
            VertexKind::Message => "MESSAGE",
            VertexKind::Enum => "ENUM",
            VertexKind::Service => "SERVICE",
        }
    }
}

impl fmt::Display for VertexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("vertex `{0}` already exists")]
    VertexExists(CompactString),
    #[error("`{from}` already has an edge to `{to}`")]
    EdgeExists {
        from: CompactString,
        to: CompactString,
    },
    #[error("vertex `{0}` not found")]
    VertexNotFound(CompactString),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Vertex {
    name: CompactString,
    kind: VertexKind,
    edges: Vec<CompactString>,
    properties: BTreeMap<CompactString, CompactString>,
}

impl Vertex {
    pub fn new(kind: VertexKind, name: impl Into<CompactString>) -> Vertex {
        Vertex {
            name: name.into(),
            kind,
            edges: vec![],
            properties: BTreeMap::new(),
        }
    }

    /// The graph key of a vertex: `KIND:dotted.name`.
    pub fn key(kind: VertexKind, name: &str) -> CompactString {
        format_compact!("{kind}:{name}")
    }

    pub fn fqn(&self) -> CompactString {
        Vertex::key(self.kind, &self.name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> VertexKind {
        self.kind
    }

    /// Keys of the referenced vertices, in the order they were added.
    pub fn edges(&self) -> &[CompactString] {
        &self.edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_related(&self, key: &str) -> bool {
        self.edges.iter().any(|e| e == key)
    }

    pub fn add_edge(&mut self, key: impl Into<CompactString>) -> Result<(), GraphError> {
        let key = key.into();
        if self.is_related(&key) {
            return Err(GraphError::EdgeExists {
                from: self.fqn(),
                to: key,
            });
        }
        self.edges.push(key);
        Ok(())
    }

    pub fn properties(&self) -> &BTreeMap<CompactString, CompactString> {
        &self.properties
    }

    pub fn set_property(&mut self, name: impl Into<CompactString>, value: impl Into<CompactString>) {
        self.properties.insert(name.into(), value.into());
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct Graph {
    vertices: Vec<Vertex>,
    #[serde(skip)]
    index: HashMap<CompactString, usize>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    pub fn add_vertex(&mut self, vertex: Vertex) -> Result<(), GraphError> {
        let key = vertex.fqn();
        if self.index.contains_key(&key) {
            return Err(GraphError::VertexExists(key));
        }
        self.index.insert(key, self.vertices.len());
        self.vertices.push(vertex);
        Ok(())
    }

    pub fn vertex_by_fqn(&self, key: &str) -> Result<&Vertex, GraphError> {
        self.index
            .get(key)
            .map(|&at| &self.vertices[at])
            .ok_or_else(|| GraphError::VertexNotFound(key.into()))
    }

    pub fn vertex(&self, kind: VertexKind, name: &str) -> Result<&Vertex, GraphError> {
        self.vertex_by_fqn(&Vertex::key(kind, name))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Vertices in insertion order.
    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    /// Adds an edge from the vertex keyed `from` to `to`. The target does not
    /// have to be a vertex of this graph.
    pub fn add_edge(&mut self, from: &str, to: impl Into<CompactString>) -> Result<(), GraphError> {
        let at = *self
            .index
            .get(from)
            .ok_or_else(|| GraphError::VertexNotFound(from.into()))?;
        self.vertices[at].add_edge(to)
    }
}

/// Builds the reference graph of `package`.
///
/// All vertices go in before any edge so a reference resolves no matter where
/// its target is declared.
pub fn build(package: &Package) -> Graph {
    let mut graph = Graph::new();
    for message in &package.messages {
        add_message_vertices(&mut graph, message);
    }
    for en in &package.enums {
        add_vertex(&mut graph, VertexKind::Enum, &en.qualified);
    }
    for service in &package.services {
        add_vertex(&mut graph, VertexKind::Service, &service.qualified);
    }

    for message in &package.messages {
        add_message_edges(&mut graph, message);
    }
    for service in &package.services {
        let scope = service.qualified.fqn();
        let from = Vertex::key(VertexKind::Service, &scope);
        for rpc in &service.rpcs {
            let params = rpc.input_parameters.iter().chain(&rpc.return_parameters);
            for param in params {
                add_reference(&mut graph, &from, &scope, &param.kind);
            }
        }
    }
    graph
}

fn add_vertex(graph: &mut Graph, kind: VertexKind, qualified: &Qualified) {
    let mut vertex = Vertex::new(kind, qualified.fqn());
    vertex.set_property("qualifier", qualified.qualifier.as_str());
    if !qualified.comment.is_empty() {
        vertex.set_property("comment", qualified.comment.as_str());
    }
    if let Err(err) = graph.add_vertex(vertex) {
        tracing::warn!(error = %err, "duplicate declaration left out of the graph");
    }
}

fn add_message_vertices(graph: &mut Graph, message: &Message) {
    add_vertex(graph, VertexKind::Message, &message.qualified);
    for en in &message.enums {
        add_vertex(graph, VertexKind::Enum, &en.qualified);
    }
    for nested in &message.messages {
        add_message_vertices(graph, nested);
    }
}

fn add_message_edges(graph: &mut Graph, message: &Message) {
    let scope = message.qualified.fqn();
    let from = Vertex::key(VertexKind::Message, &scope);
    for attribute in &message.attributes {
        for kind in attribute.kind.kinds() {
            add_reference(graph, &from, &scope, kind);
        }
    }
    for nested in &message.messages {
        add_message_edges(graph, nested);
    }
}

fn add_reference(graph: &mut Graph, from: &str, scope: &str, type_name: &str) {
    if is_scalar(type_name) {
        return;
    }
    let to = resolve(graph, scope, type_name);
    match graph.add_edge(from, to) {
        Ok(()) => {}
        Err(err @ GraphError::EdgeExists { .. }) => {
            tracing::debug!(error = %err, "repeated reference");
        }
        Err(err) => tracing::warn!(error = %err, "could not add reference"),
    }
}

/// Finds the vertex a type name refers to, searching from the innermost
/// enclosing scope outwards. A leading `.` makes the name absolute. Names that
/// match nothing become message references.
pub fn resolve(graph: &Graph, scope: &str, type_name: &str) -> CompactString {
    if let Some(absolute) = type_name.strip_prefix('.') {
        return lookup(graph, absolute)
            .unwrap_or_else(|| Vertex::key(VertexKind::Message, absolute));
    }
    let mut scope = scope;
    loop {
        let candidate = if scope.is_empty() {
            CompactString::from(type_name)
        } else {
            format_compact!("{scope}.{type_name}")
        };
        if let Some(key) = lookup(graph, &candidate) {
            return key;
        }
        if scope.is_empty() {
            break;
        }
        scope = match scope.rfind('.') {
            Some(at) => &scope[..at],
            None => "",
        };
    }
    Vertex::key(VertexKind::Message, type_name)
}

fn lookup(graph: &Graph, name: &str) -> Option<CompactString> {
    [VertexKind::Message, VertexKind::Enum]
        .into_iter()
        .map(|kind| Vertex::key(kind, name))
        .find(|key| graph.contains(key))
}
