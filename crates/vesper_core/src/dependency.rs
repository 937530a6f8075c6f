//! Static analysis of what a live query can observe.
//!
//! A [`DependencyTree`] mirrors the paths a filter, ordering or selection
//! walks; [`FlattenedDependencyGraph`] is its closure keyed by node, used as a
//! cheap admissibility test against a [`MutationSummary`] or a single change.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{ChangeAggregation, ComponentDef, NodeChange, Schema, VesperError, VesperResult};

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dependency {
    Component(String),
    ReverseEdge(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DependencyTree {
    pub node: String,
    pub children: BTreeMap<Dependency, Option<DependencyTree>>,
}

impl DependencyTree {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            children: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Adds one dependency, merging with whatever is already recorded for it.
    pub fn add(&mut self, dependency: Dependency, nested: Option<DependencyTree>) -> VesperResult<()> {
        match self.children.remove(&dependency) {
            Some(Some(mut existing)) => {
                if let Some(nested) = nested {
                    existing.merge(nested)?;
                }
                self.children.insert(dependency, Some(existing));
            }
            Some(None) | None => {
                self.children.insert(dependency, nested);
            }
        }
        Ok(())
    }

    pub fn merge(&mut self, other: DependencyTree) -> VesperResult<()> {
        if other.node != self.node {
            return Err(VesperError::definition(format!(
                "cannot merge dependencies of \"{}\" into \"{}\"",
                other.node, self.node
            )));
        }
        for (dependency, nested) in other.children {
            self.add(dependency, nested)?;
        }
        Ok(())
    }

    pub fn merged(node: &str, trees: impl IntoIterator<Item = DependencyTree>) -> VesperResult<Self> {
        let mut merged = DependencyTree::new(node);
        for tree in trees {
            merged.merge(tree)?;
        }
        Ok(merged)
    }

    /// Names of the components (leaves and edges) this level observes.
    pub fn components(&self) -> BTreeSet<String> {
        self.children
            .keys()
            .filter_map(|dependency| match dependency {
                Dependency::Component(name) => Some(name.clone()),
                Dependency::ReverseEdge(_) => None,
            })
            .collect()
    }

    pub fn validate(&self, schema: &Schema) -> VesperResult<()> {
        let node = schema.node(&self.node)?;
        for (dependency, nested) in &self.children {
            let expected_head = match dependency {
                Dependency::Component(name) => match node.component_or_err(name)? {
                    ComponentDef::Leaf(_) if nested.is_some() => {
                        return Err(VesperError::definition(format!(
                            "leaf \"{}.{name}\" cannot have nested dependencies",
                            self.node
                        )));
                    }
                    ComponentDef::Leaf(_) => None,
                    ComponentDef::Edge(edge) => Some(edge.head.as_str()),
                },
                Dependency::ReverseEdge(name) => {
                    let reverse = node.reverse_edge_or_err(name)?;
                    if nested.is_none() {
                        return Err(VesperError::definition(format!(
                            "reverse edge \"{}.{name}\" needs a nested tree",
                            self.node
                        )));
                    }
                    Some(reverse.head.as_str())
                }
            };
            if let (Some(head), Some(nested)) = (expected_head, nested) {
                if nested.node != head {
                    return Err(VesperError::definition(format!(
                        "dependency on \"{}\" nests \"{}\" instead of \"{head}\"",
                        self.node, nested.node
                    )));
                }
                nested.validate(schema)?;
            }
        }
        Ok(())
    }

    /// Collapses the tree into node -> {creation, deletion, components}.
    ///
    /// The root reacts to creations and deletions; nodes reached through an
    /// edge only to updates; nodes reached through a reverse edge to every
    /// kind, including re-pointing of the original edge.
    pub fn flatten(&self, schema: &Schema) -> VesperResult<FlattenedDependencyGraph> {
        self.validate(schema)?;
        let mut graph = FlattenedDependencyGraph::default();
        let root = graph.entry(&self.node);
        root.creation = true;
        root.deletion = true;
        self.flatten_into(schema, &mut graph)?;
        Ok(graph)
    }

    fn flatten_into(&self, schema: &Schema, graph: &mut FlattenedDependencyGraph) -> VesperResult<()> {
        let node = schema.node(&self.node)?;
        graph.entry(&self.node).components.extend(self.components());
        for (dependency, nested) in &self.children {
            let Some(nested) = nested else {
                continue;
            };
            if let Dependency::ReverseEdge(name) = dependency {
                let reverse = node.reverse_edge_or_err(name)?;
                let head = graph.entry(&reverse.head);
                head.creation = true;
                head.deletion = true;
                head.components.insert(reverse.original_edge.clone());
            }
            nested.flatten_into(schema, graph)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeDependency {
    pub creation: bool,
    pub deletion: bool,
    pub components: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FlattenedDependencyGraph {
    pub nodes: BTreeMap<String, NodeDependency>,
}

impl FlattenedDependencyGraph {
    fn entry(&mut self, node: &str) -> &mut NodeDependency {
        self.nodes.entry(node.to_string()).or_default()
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn is_affected_by_summary(&self, summary: &MutationSummary) -> bool {
        summary.nodes.iter().any(|(node, footprint)| {
            self.nodes.get(node).is_some_and(|dependency| {
                (footprint.creation && dependency.creation)
                    || (footprint.deletion && dependency.deletion)
                    || !footprint.updates.is_disjoint(&dependency.components)
            })
        })
    }

    pub fn is_affected_by(&self, change: &NodeChange) -> bool {
        let Some(dependency) = self.nodes.get(change.node()) else {
            return false;
        };
        match change {
            NodeChange::Creation(_) => dependency.creation,
            NodeChange::Deletion(_) => dependency.deletion,
            NodeChange::Update(update) => update
                .updates_by_component
                .keys()
                .any(|component| dependency.components.contains(component)),
        }
    }

    /// Keeps only the changes this graph can observe.
    pub fn restrict(&self, aggregation: &ChangeAggregation) -> ChangeAggregation {
        aggregation.retain(|change| self.is_affected_by(change))
    }
}

/// Per-node footprint of one committed mutation, persisted with it.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeFootprint {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub creation: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deletion: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub updates: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationSummary {
    pub nodes: BTreeMap<String, NodeFootprint>,
}

impl MutationSummary {
    pub fn record(&mut self, change: &NodeChange) {
        let footprint = self.nodes.entry(change.node().to_string()).or_default();
        match change {
            NodeChange::Creation(_) => footprint.creation = true,
            NodeChange::Deletion(_) => footprint.deletion = true,
            NodeChange::Update(update) => footprint
                .updates
                .extend(update.updates_by_component.keys().cloned()),
        }
    }
}
