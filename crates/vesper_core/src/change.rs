//! Creation, update and deletion of one node instance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Record, Schema, Timestamp, Value, VesperError, VesperResult, canonical_record_key};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Creation,
    Update,
    Deletion,
}

impl ChangeKind {
    pub fn as_i16(self) -> i16 {
        match self {
            ChangeKind::Creation => 1,
            ChangeKind::Update => 2,
            ChangeKind::Deletion => 3,
        }
    }

    pub fn from_i16(value: i16) -> VesperResult<Self> {
        match value {
            1 => Ok(ChangeKind::Creation),
            2 => Ok(ChangeKind::Update),
            3 => Ok(ChangeKind::Deletion),
            other => Err(VesperError::invalid(format!("unknown change kind {other}"))),
        }
    }
}

/// Fields shared by every kind of change.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeHeader {
    pub node: String,
    pub request_context: serde_json::Value,
    pub executed_at: Timestamp,
    committed_at: Option<Timestamp>,
    id: Record,
    stringified_id: String,
}

impl ChangeHeader {
    pub fn committed_at(&self) -> Option<Timestamp> {
        self.committed_at
    }

    pub fn id(&self) -> &Record {
        &self.id
    }

    pub fn stringified_id(&self) -> &str {
        &self.stringified_id
    }

    fn new(
        schema: &Schema,
        node: &str,
        identified_by: &Record,
        request_context: serde_json::Value,
        executed_at: Timestamp,
    ) -> VesperResult<Self> {
        let id = schema.node(node)?.identifier_of(schema, identified_by)?;
        let stringified_id = canonical_record_key(&id);
        Ok(Self {
            node: node.to_string(),
            request_context,
            executed_at,
            committed_at: None,
            id,
            stringified_id,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeCreation {
    pub header: ChangeHeader,
    pub new_value: Record,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeUpdate {
    pub header: ChangeHeader,
    pub old_value: Record,
    pub new_value: Record,
    /// Components whose value differs, with their new value.
    pub updates_by_component: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeDeletion {
    pub header: ChangeHeader,
    pub old_value: Record,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeChange {
    Creation(NodeCreation),
    Update(NodeUpdate),
    Deletion(NodeDeletion),
}

impl NodeChange {
    pub fn creation(
        schema: &Schema,
        node: &str,
        new_value: Record,
        request_context: serde_json::Value,
        executed_at: Timestamp,
    ) -> VesperResult<Self> {
        let header = ChangeHeader::new(schema, node, &new_value, request_context, executed_at)?;
        Ok(NodeChange::Creation(NodeCreation { header, new_value }))
    }

    /// Builds an update; identifier components are immutable.
    pub fn update(
        schema: &Schema,
        node: &str,
        old_value: Record,
        new_value: Record,
        request_context: serde_json::Value,
        executed_at: Timestamp,
    ) -> VesperResult<Self> {
        let header = ChangeHeader::new(schema, node, &old_value, request_context, executed_at)?;
        let def = schema.node(node)?;
        if def.identifier_of(schema, &new_value)? != header.id {
            return Err(VesperError::invalid(format!(
                "update of \"{node}\" {} changes its identifier",
                header.stringified_id
            )));
        }
        let updates_by_component = diff(schema, node, &old_value, &new_value)?;
        Ok(NodeChange::Update(NodeUpdate {
            header,
            old_value,
            new_value,
            updates_by_component,
        }))
    }

    pub fn deletion(
        schema: &Schema,
        node: &str,
        old_value: Record,
        request_context: serde_json::Value,
        executed_at: Timestamp,
    ) -> VesperResult<Self> {
        let header = ChangeHeader::new(schema, node, &old_value, request_context, executed_at)?;
        Ok(NodeChange::Deletion(NodeDeletion { header, old_value }))
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            NodeChange::Creation(_) => ChangeKind::Creation,
            NodeChange::Update(_) => ChangeKind::Update,
            NodeChange::Deletion(_) => ChangeKind::Deletion,
        }
    }

    pub fn header(&self) -> &ChangeHeader {
        match self {
            NodeChange::Creation(change) => &change.header,
            NodeChange::Update(change) => &change.header,
            NodeChange::Deletion(change) => &change.header,
        }
    }

    fn header_mut(&mut self) -> &mut ChangeHeader {
        match self {
            NodeChange::Creation(change) => &mut change.header,
            NodeChange::Update(change) => &mut change.header,
            NodeChange::Deletion(change) => &mut change.header,
        }
    }

    pub fn node(&self) -> &str {
        &self.header().node
    }

    pub fn id(&self) -> &Record {
        &self.header().id
    }

    pub fn stringified_id(&self) -> &str {
        &self.header().stringified_id
    }

    pub fn request_context(&self) -> &serde_json::Value {
        &self.header().request_context
    }

    pub fn executed_at(&self) -> Timestamp {
        self.header().executed_at
    }

    pub fn committed_at(&self) -> Option<Timestamp> {
        self.header().committed_at
    }

    /// Stamps the commit time; a change is committed exactly once.
    pub fn set_committed_at(&mut self, committed_at: Timestamp) -> VesperResult<()> {
        let header = self.header_mut();
        if let Some(existing) = header.committed_at {
            return Err(VesperError::conflict(format!(
                "\"{}\" {} already committed at {existing}",
                header.node, header.stringified_id
            )));
        }
        header.committed_at = Some(committed_at);
        Ok(())
    }

    pub(crate) fn with_committed_at(mut self, committed_at: Option<Timestamp>) -> Self {
        self.header_mut().committed_at = committed_at;
        self
    }

    pub fn old_value(&self) -> Option<&Record> {
        match self {
            NodeChange::Creation(_) => None,
            NodeChange::Update(change) => Some(&change.old_value),
            NodeChange::Deletion(change) => Some(&change.old_value),
        }
    }

    pub fn new_value(&self) -> Option<&Record> {
        match self {
            NodeChange::Creation(change) => Some(&change.new_value),
            NodeChange::Update(change) => Some(&change.new_value),
            NodeChange::Deletion(_) => None,
        }
    }

    /// An update that changes nothing is not a change at all.
    pub fn is_actual(&self) -> bool {
        match self {
            NodeChange::Update(update) => !update.updates_by_component.is_empty(),
            NodeChange::Creation(_) | NodeChange::Deletion(_) => true,
        }
    }
}

fn diff(
    schema: &Schema,
    node: &str,
    old_value: &Record,
    new_value: &Record,
) -> VesperResult<BTreeMap<String, Value>> {
    let def = schema.node(node)?;
    let mut updates = BTreeMap::new();
    for component in def.components() {
        let name = component.name();
        let before = old_value.get(name).unwrap_or(&Value::Null);
        let after = new_value.get(name).unwrap_or(&Value::Null);
        if !def.component_equals(schema, name, before, after) {
            updates.insert(name.to_string(), after.clone());
        }
    }
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::{ChangeKind, NodeChange};
    use crate::schema::fixtures::blog_schema;
    use crate::{Timestamp, Value, record};

    #[test]
    fn update_tracks_only_differing_components() {
        let schema = blog_schema();
        let old = record([
            ("id", Value::Int(1)),
            ("title", "A".into()),
            ("status", "DRAFT".into()),
            ("category", record([("id", Value::Int(3))]).into()),
        ]);
        let mut new = old.clone();
        new.insert("status".into(), "PUBLISHED".into());
        new.insert(
            "category".into(),
            record([("id", Value::Int(3)), ("slug", "x".into())]).into(),
        );
        let change = NodeChange::update(
            &schema,
            "Article",
            old,
            new,
            serde_json::Value::Null,
            Timestamp::now(),
        )
        .expect("update");
        let NodeChange::Update(update) = &change else {
            panic!("expected update");
        };
        assert_eq!(update.updates_by_component.len(), 1);
        assert!(update.updates_by_component.contains_key("status"));
        assert!(change.is_actual());
    }

    #[test]
    fn identical_update_is_not_actual() {
        let schema = blog_schema();
        let value = record([("id", Value::Int(1)), ("title", "A".into())]);
        let change = NodeChange::update(
            &schema,
            "Article",
            value.clone(),
            value,
            serde_json::Value::Null,
            Timestamp::now(),
        )
        .expect("update");
        assert!(!change.is_actual());
    }

    #[test]
    fn identifier_must_resolve() {
        let schema = blog_schema();
        let result = NodeChange::creation(
            &schema,
            "Article",
            record([("title", "A".into())]),
            serde_json::Value::Null,
            Timestamp::now(),
        );
        assert!(result.is_err());
        let moved = NodeChange::update(
            &schema,
            "Article",
            record([("id", Value::Int(1))]),
            record([("id", Value::Int(2))]),
            serde_json::Value::Null,
            Timestamp::now(),
        );
        assert!(moved.is_err());
    }

    #[test]
    fn committed_at_is_set_once() {
        let schema = blog_schema();
        let mut change = NodeChange::deletion(
            &schema,
            "Article",
            record([("id", Value::Int(1))]),
            serde_json::Value::Null,
            Timestamp::now(),
        )
        .expect("deletion");
        assert_eq!(change.stringified_id(), r#"{"id":1}"#);
        change.set_committed_at(Timestamp::now()).expect("first");
        assert!(change.set_committed_at(Timestamp::now()).is_err());
        assert_eq!(ChangeKind::from_i16(change.kind().as_i16()).expect("kind"), ChangeKind::Deletion);
    }
}
