//! The node graph handed to the engine.
//!
//! A [`Graph`] maps node names to [`Node`]s. Each node names an operator and
//! carries an ordered list of [`Argument`]s, which are either literal strings
//! or references to other nodes by name. Graphs are built once, usually by
//! [`crate::parse`], and are read-only while an execution runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use petgraph::Graph as DiGraph;
use petgraph::algo::toposort;

use crate::error::GraphError;

/// A single node argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Argument {
    /// A literal string passed to the operator as is.
    Literal(String),
    /// The name of another node; the operator receives that node's output
    /// directory.
    Node(String),
}

impl Argument {
    pub fn literal(value: impl Into<String>) -> Self {
        Argument::Literal(value.into())
    }

    pub fn node(name: impl Into<String>) -> Self {
        Argument::Node(name.into())
    }

    /// Returns the referenced node name for node arguments.
    pub fn as_node(&self) -> Option<&str> {
        match self {
            Argument::Node(name) => Some(name),
            Argument::Literal(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: String,
    operator: String,
    arguments: Vec<Argument>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        operator: impl Into<String>,
        arguments: impl IntoIterator<Item = Argument>,
    ) -> Self {
        Self {
            name: name.into(),
            operator: operator.into(),
            arguments: arguments.into_iter().collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    /// Names of the referenced nodes, in argument order. A node referenced
    /// twice is yielded twice.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.arguments.iter().filter_map(Argument::as_node)
    }

    fn check(&self) -> Result<(), GraphError> {
        let malformed = |reason| GraphError::Malformed {
            node: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(malformed("node name is empty"));
        }

        if !is_valid_operator_name(&self.operator) {
            return Err(malformed(
                "operator name must be a non-empty single path component",
            ));
        }

        Ok(())
    }
}

/// Operator names end up in cache directory names, so they have to be a
/// single, plain path component.
pub(crate) fn is_valid_operator_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}(", self.name, self.operator)?;

        for (i, argument) in self.arguments.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            match argument {
                Argument::Node(name) => f.write_str(name)?,
                Argument::Literal(value) => {
                    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
                    write!(f, "\"{escaped}\"")?;
                }
            }
        }

        f.write_str(")")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Graph {
    nodes: BTreeMap<String, Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, requiring every node it references to be defined already.
    ///
    /// Graphs built only through `define` are acyclic by construction.
    pub fn define(&mut self, node: Node) -> Result<&Node, GraphError> {
        node.check()?;

        if self.nodes.contains_key(node.name()) {
            return Err(GraphError::Duplicate(node.name.clone()));
        }

        if let Some(reference) = node.dependencies().find(|dep| !self.nodes.contains_key(*dep)) {
            return Err(GraphError::Dangling {
                node: node.name.clone(),
                reference: reference.to_string(),
            });
        }

        let name = node.name.clone();
        let node: &Node = self.nodes.entry(name).or_insert(node);
        Ok(node)
    }

    /// Adds or replaces a node without any checks. The engine still validates
    /// the graph before running it.
    pub fn insert(&mut self, node: Node) -> Option<Node> {
        self.nodes.insert(node.name.clone(), node)
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in name order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Checks every node and every reference, then returns the nodes in a
    /// dependency respecting order. The order is deterministic for a given
    /// graph.
    pub fn toposort(&self) -> Result<Vec<&Node>, GraphError> {
        for node in self.nodes.values() {
            node.check()?;

            if let Some(reference) = node.dependencies().find(|dep| !self.nodes.contains_key(*dep)) {
                return Err(GraphError::Dangling {
                    node: node.name.clone(),
                    reference: reference.to_string(),
                });
            }
        }

        let mut graph = DiGraph::<&Node, ()>::with_capacity(self.nodes.len(), 0);
        let indices: HashMap<&str, _> = self
            .nodes
            .values()
            .map(|node| (node.name(), graph.add_node(node)))
            .collect();

        for node in self.nodes.values() {
            let target = indices[node.name()];
            let unique: HashSet<&str> = node.dependencies().collect();
            let mut sources: Vec<_> = unique.into_iter().collect();
            sources.sort_unstable();

            for source in sources {
                graph.add_edge(indices[source], target, ());
            }
        }

        let order = toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle(graph[cycle.node_id()].name.clone()))?;

        Ok(order.into_iter().map(|index| graph[index]).collect())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for node in self.nodes.values() {
            let operator = node.operator.replace('"', "\\\"");
            writeln!(f, "    {}[\"{}: {}\"]", node.name, node.name, operator)?;
        }

        for node in self.nodes.values() {
            for dependency in node.dependencies() {
                writeln!(f, "    {} --> {}", dependency, node.name)?;
            }
        }

        Ok(())
    }
}

impl FromIterator<Node> for Graph {
    fn from_iter<T: IntoIterator<Item = Node>>(iter: T) -> Self {
        let mut graph = Graph::new();
        for node in iter {
            graph.insert(node);
        }
        graph
    }
}
