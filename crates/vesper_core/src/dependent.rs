//! Translating a batch of changes into filters over the subscribed node.
//!
//! A [`DependentGraph`] is an arena laid out deterministically from a
//! [`DependencyTree`] (pre-order, children in tree order), so two graphs built
//! from the same tree line up index by index and merge by re-folding the hits
//! of each slot.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::aggregation::fold;
use crate::{
    ChangeAggregation, Dependency, DependencyTree, Filter, NodeChange, Record, Schema, Value,
    VesperError, VesperResult,
};

#[derive(Clone, Debug)]
pub struct DependentNode {
    pub node: String,
    /// How the parent reaches this node; `None` at the root.
    pub via: Option<Dependency>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    watched: BTreeSet<String>,
    hits: BTreeMap<String, NodeChange>,
}

impl DependentNode {
    pub fn hits(&self) -> impl Iterator<Item = &NodeChange> {
        self.hits.values()
    }

    fn is_hit_by(&self, change: &NodeChange) -> bool {
        if change.node() != self.node {
            return false;
        }
        let touches_watched = |change: &NodeChange| match change {
            NodeChange::Update(update) => update
                .updates_by_component
                .keys()
                .any(|component| self.watched.contains(component)),
            NodeChange::Creation(_) | NodeChange::Deletion(_) => false,
        };
        match (&self.via, change) {
            (None | Some(Dependency::ReverseEdge(_)), NodeChange::Creation(_))
            | (None | Some(Dependency::ReverseEdge(_)), NodeChange::Deletion(_)) => true,
            (Some(Dependency::Component(_)), NodeChange::Creation(_))
            | (Some(Dependency::Component(_)), NodeChange::Deletion(_)) => false,
            (_, NodeChange::Update(_)) => touches_watched(change),
        }
    }

    fn absorb(&mut self, schema: &Schema, change: NodeChange) -> VesperResult<()> {
        let key = change.stringified_id().to_string();
        match self.hits.remove(&key) {
            None => {
                self.hits.insert(key, change);
            }
            Some(previous) => {
                if let Some(folded) = fold(schema, previous, change)? {
                    self.hits.insert(key, folded);
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct DependentGraph {
    schema: Arc<Schema>,
    nodes: Vec<DependentNode>,
}

impl DependentGraph {
    /// An empty graph shaped after `tree`.
    pub fn new(schema: Arc<Schema>, tree: &DependencyTree) -> VesperResult<Self> {
        tree.validate(&schema)?;
        let mut graph = Self {
            schema,
            nodes: Vec::new(),
        };
        graph.lay_out(tree, None, None)?;
        Ok(graph)
    }

    pub fn build(
        schema: Arc<Schema>,
        tree: &DependencyTree,
        aggregation: &ChangeAggregation,
    ) -> VesperResult<Self> {
        let mut graph = Self::new(schema, tree)?;
        graph.record(aggregation)?;
        Ok(graph)
    }

    fn lay_out(
        &mut self,
        tree: &DependencyTree,
        parent: Option<usize>,
        via: Option<Dependency>,
    ) -> VesperResult<usize> {
        let index = self.nodes.len();
        let mut watched = tree.components();
        if let (Some(parent), Some(Dependency::ReverseEdge(name))) = (parent, &via) {
            let parent_node = self.schema.node(&self.nodes[parent].node)?;
            watched.insert(parent_node.reverse_edge_or_err(name)?.original_edge.clone());
        }
        self.nodes.push(DependentNode {
            node: tree.node.clone(),
            via,
            parent,
            children: Vec::new(),
            watched,
            hits: BTreeMap::new(),
        });
        for (dependency, nested) in &tree.children {
            if let Some(nested) = nested {
                let child = self.lay_out(nested, Some(index), Some(dependency.clone()))?;
                self.nodes[index].children.push(child);
            }
        }
        Ok(index)
    }

    /// Distributes every change of `aggregation` to the slots it hits.
    pub fn record(&mut self, aggregation: &ChangeAggregation) -> VesperResult<()> {
        for change in aggregation.changes() {
            for index in 0..self.nodes.len() {
                if self.nodes[index].is_hit_by(change) {
                    self.nodes[index].absorb(&self.schema, change.clone())?;
                }
            }
        }
        Ok(())
    }

    /// Folds the hits of a later graph over the same tree into this one.
    pub fn merge(&mut self, other: DependentGraph) -> VesperResult<()> {
        let same_shape = self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(&other.nodes)
                .all(|(left, right)| left.node == right.node && left.via == right.via);
        if !same_shape {
            return Err(VesperError::definition(
                "dependent graphs built from different trees cannot merge",
            ));
        }
        for (index, node) in other.nodes.into_iter().enumerate() {
            for change in node.hits.into_values() {
                self.nodes[index].absorb(&self.schema, change)?;
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.iter().all(|node| node.hits.is_empty())
    }

    pub fn root(&self) -> &DependentNode {
        &self.nodes[0]
    }

    pub fn node(&self, index: usize) -> Option<&DependentNode> {
        self.nodes.get(index)
    }

    /// Changes to instances of the subscribed node itself.
    pub fn root_changes(&self) -> impl Iterator<Item = &NodeChange> {
        self.root().hits()
    }

    /// Root instances reached only through edges and reverse edges.
    pub fn graph_filter(&self) -> VesperResult<Filter> {
        self.children_filter(0)
    }

    /// Edge-reached instances that match `filter` now. Root changes carry
    /// their own values and are classified from them instead.
    pub fn upsert_filter(&self, filter: &Filter) -> VesperResult<Filter> {
        Ok(Filter::and([filter.clone(), self.graph_filter()?]))
    }

    /// Edge-reached instances that no longer match `filter`. Build the graph
    /// from the filter's own tree, or selection-only paths turn up instances
    /// that never matched.
    pub fn deletion_filter(&self, filter: &Filter) -> VesperResult<Filter> {
        Ok(Filter::and([
            Filter::not(filter.clone()),
            self.graph_filter()?,
        ]))
    }

    fn children_filter(&self, index: usize) -> VesperResult<Filter> {
        let mut operands = Vec::new();
        for &child in &self.nodes[index].children {
            operands.push(self.contribution(child)?);
        }
        Ok(Filter::or(operands))
    }

    /// Instances of an edge-reached slot that were hit directly or through
    /// their own children.
    fn affected(&self, index: usize) -> VesperResult<Filter> {
        let node = &self.nodes[index];
        let own = Filter::identities(&self.schema, &node.node, node.hits().map(NodeChange::id))?;
        Ok(Filter::or([own, self.children_filter(index)?]))
    }

    /// What slot `child` contributes, expressed over its parent's node.
    fn contribution(&self, child: usize) -> VesperResult<Filter> {
        let node = &self.nodes[child];
        let parent = node.parent.ok_or_else(|| {
            VesperError::definition(format!("slot {child} of \"{}\" has no parent", node.node))
        })?;
        let parent_node = &self.nodes[parent].node;
        match &node.via {
            Some(Dependency::Component(edge)) => Ok(Filter::edge(edge.clone(), self.affected(child)?)),
            Some(Dependency::ReverseEdge(name)) => {
                let reverse = self.schema.node(parent_node)?.reverse_edge_or_err(name)?;
                let referenced: Vec<Record> = node
                    .hits()
                    .flat_map(|hit| [hit.old_value(), hit.new_value()])
                    .flatten()
                    .filter_map(|value| match value.get(&reverse.original_edge) {
                        Some(Value::Record(parent_id)) => Some(parent_id.clone()),
                        _ => None,
                    })
                    .collect();
                let direct = Filter::identities(&self.schema, parent_node, referenced.iter())?;
                let nested = Filter::reverse_edge(name.clone(), self.children_filter(child)?);
                Ok(Filter::or([direct, nested]))
            }
            None => Err(VesperError::definition(format!(
                "slot {child} of \"{}\" is not reachable",
                node.node
            ))),
        }
    }
}
