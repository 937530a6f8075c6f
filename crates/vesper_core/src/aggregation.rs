//! Folding bursts of changes into the smallest equivalent set.
//!
//! Each identity appears at most once per node. Consecutive changes of one
//! identity collapse through the kind-by-kind matrix in [`fold`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::{
    MutationSummary, NodeChange, NodeCreation, NodeDeletion, Schema, Timestamp, VesperError,
    VesperResult,
};

#[derive(Clone, Debug, Default)]
struct NodeChanges {
    order: BTreeMap<u64, NodeChange>,
    positions: HashMap<String, u64>,
}

#[derive(Clone, Debug)]
pub struct ChangeAggregation {
    schema: Arc<Schema>,
    nodes: BTreeMap<String, NodeChanges>,
    next_position: u64,
}

impl ChangeAggregation {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            nodes: BTreeMap::new(),
            next_position: 0,
        }
    }

    pub fn create_from_iter(
        schema: Arc<Schema>,
        changes: impl IntoIterator<Item = NodeChange>,
    ) -> VesperResult<Self> {
        let mut aggregation = Self::new(schema);
        for change in changes {
            aggregation.append(change)?;
        }
        Ok(aggregation)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Folds one more change in; non-actual updates are dropped.
    pub fn append(&mut self, change: NodeChange) -> VesperResult<()> {
        if !change.is_actual() {
            return Ok(());
        }
        let node = change.node().to_string();
        let key = change.stringified_id().to_string();
        let entries = self.nodes.entry(node.clone()).or_default();
        match entries.positions.get(&key).copied() {
            None => {
                let position = self.next_position;
                self.next_position += 1;
                entries.positions.insert(key, position);
                entries.order.insert(position, change);
            }
            Some(position) => {
                let previous = entries.order.remove(&position).ok_or_else(|| {
                    VesperError::aggregation(format!("lost position of \"{node}\" {key}"))
                })?;
                match fold(&self.schema, previous, change)? {
                    Some(folded) => {
                        entries.order.insert(position, folded);
                    }
                    None => {
                        entries.positions.remove(&key);
                    }
                }
                if entries.order.is_empty() {
                    self.nodes.remove(&node);
                }
            }
        }
        Ok(())
    }

    /// Re-folds both aggregations ordered by commit time, ties keeping
    /// insertion order (`self` before `other`).
    pub fn merge(self, other: ChangeAggregation) -> VesperResult<Self> {
        let schema = self.schema.clone();
        let mut changes = self.into_changes();
        changes.extend(other.into_changes());
        changes.sort_by_key(NodeChange::committed_at);
        Self::create_from_iter(schema, changes)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.values().map(|entries| entries.order.len()).sum()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn node_changes<'a>(&'a self, node: &str) -> impl Iterator<Item = &'a NodeChange> + 'a {
        self.nodes
            .get(node)
            .into_iter()
            .flat_map(|entries| entries.order.values())
    }

    pub fn changes(&self) -> impl Iterator<Item = &NodeChange> {
        self.nodes.values().flat_map(|entries| entries.order.values())
    }

    pub fn into_changes(self) -> Vec<NodeChange> {
        self.nodes
            .into_values()
            .flat_map(|entries| entries.order.into_values())
            .collect()
    }

    /// A copy holding only the changes `keep` accepts.
    pub fn retain(&self, keep: impl Fn(&NodeChange) -> bool) -> ChangeAggregation {
        let mut retained = ChangeAggregation::new(self.schema.clone());
        for (node, entries) in &self.nodes {
            let mut kept = NodeChanges::default();
            for (position, change) in &entries.order {
                if keep(change) {
                    kept.positions
                        .insert(change.stringified_id().to_string(), *position);
                    kept.order.insert(*position, change.clone());
                }
            }
            if !kept.order.is_empty() {
                retained.nodes.insert(node.clone(), kept);
            }
        }
        retained.next_position = self.next_position;
        retained
    }

    pub fn summary(&self) -> MutationSummary {
        let mut summary = MutationSummary::default();
        for change in self.changes() {
            summary.record(change);
        }
        summary
    }

    pub fn set_committed_at(&mut self, committed_at: Timestamp) -> VesperResult<()> {
        for entries in self.nodes.values_mut() {
            for change in entries.order.values_mut() {
                change.set_committed_at(committed_at)?;
            }
        }
        Ok(())
    }

    /// Latest commit stamp among the changes.
    pub fn committed_at(&self) -> Option<Timestamp> {
        self.changes().filter_map(NodeChange::committed_at).max()
    }

    pub fn request_context(&self) -> serde_json::Value {
        self.changes()
            .next()
            .map(|change| change.request_context().clone())
            .unwrap_or(serde_json::Value::Null)
    }
}

/// The kind-by-kind reduction of two consecutive changes of one identity.
/// `None` means the pair cancels out.
pub(crate) fn fold(
    schema: &Schema,
    previous: NodeChange,
    next: NodeChange,
) -> VesperResult<Option<NodeChange>> {
    let folded = match (previous, next) {
        (NodeChange::Creation(_), NodeChange::Update(update)) => {
            Some(NodeChange::Creation(NodeCreation {
                header: update.header,
                new_value: update.new_value,
            }))
        }
        (NodeChange::Creation(_), NodeChange::Deletion(_)) => None,
        (NodeChange::Update(first), NodeChange::Update(second)) => {
            let committed_at = second.header.committed_at();
            let header = second.header;
            let folded = NodeChange::update(
                schema,
                &header.node,
                first.old_value,
                second.new_value,
                header.request_context,
                header.executed_at,
            )?
            .with_committed_at(committed_at);
            folded.is_actual().then_some(folded)
        }
        (NodeChange::Update(update), NodeChange::Deletion(deletion)) => {
            Some(NodeChange::Deletion(NodeDeletion {
                header: deletion.header,
                old_value: update.old_value,
            }))
        }
        (NodeChange::Deletion(deletion), NodeChange::Creation(creation)) => {
            let committed_at = creation.header.committed_at();
            let header = creation.header;
            let folded = NodeChange::update(
                schema,
                &header.node,
                deletion.old_value,
                creation.new_value,
                header.request_context,
                header.executed_at,
            )?
            .with_committed_at(committed_at);
            folded.is_actual().then_some(folded)
        }
        (previous, next) => {
            return Err(VesperError::aggregation(format!(
                "{:?} then {:?} of \"{}\" {}",
                previous.kind(),
                next.kind(),
                next.node(),
                next.stringified_id()
            )));
        }
    };
    Ok(folded)
}
