use std::collections::BTreeMap;
use std::ops::Index;

use crate::core::{Fingerprint, FingerprintHasher};
use crate::error::GraphError;
use crate::graph::{Argument, Graph, Node};

/// Fingerprints of every node in a graph, keyed by node name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprints(BTreeMap<String, Fingerprint>);

impl Fingerprints {
    /// Fingerprints a graph, hashing only operator names.
    pub fn compute(graph: &Graph) -> Result<Self, GraphError> {
        Self::compute_with(graph, |_| None)
    }

    /// Fingerprints a graph, additionally hashing the version returned by
    /// `version` for each operator name that has one.
    pub fn compute_with<V>(graph: &Graph, version: V) -> Result<Self, GraphError>
    where
        V: Fn(&str) -> Option<String>,
    {
        let order = graph.toposort()?;
        Ok(Self::from_order(&order, version))
    }

    /// `order` must list every node after all of its dependencies.
    pub(crate) fn from_order<V>(order: &[&Node], version: V) -> Self
    where
        V: Fn(&str) -> Option<String>,
    {
        let mut done = BTreeMap::new();

        for node in order {
            let mut hasher = FingerprintHasher::default();

            for argument in node.arguments() {
                match argument {
                    Argument::Literal(value) => hasher.literal(value),
                    Argument::Node(name) => hasher.node(&done[name]),
                };
            }

            hasher.operator(node.operator());

            if let Some(version) = version(node.operator()) {
                hasher.version(&version);
            }

            done.insert(node.name().to_string(), hasher.finish());
        }

        Fingerprints(done)
    }

    pub fn get(&self, name: &str) -> Option<Fingerprint> {
        self.0.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Fingerprint)> {
        self.0.iter().map(|(name, fp)| (name.as_str(), *fp))
    }
}

impl Index<&str> for Fingerprints {
    type Output = Fingerprint;

    /// Panics if the graph had no node called `name`.
    fn index(&self, name: &str) -> &Fingerprint {
        &self.0[name]
    }
}
