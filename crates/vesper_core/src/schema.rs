//! The entity-type graph the change subsystem reasons about.
//!
//! A [`Schema`] is built once and shared behind an `Arc`. Nodes own their
//! components (leaves and edges), unique constraints (the first one is the
//! identifier) and the reverse edges derived from edges on other nodes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{Record, Value, VesperError, VesperResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeafKind {
    String,
    Int,
    Float,
    Boolean,
    Timestamp,
    Json,
}

impl LeafKind {
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (LeafKind::String, Value::Str(_)) => true,
            (LeafKind::Int, Value::Int(_)) => true,
            (LeafKind::Float, Value::Float(_) | Value::Int(_)) => true,
            (LeafKind::Boolean, Value::Bool(_)) => true,
            (LeafKind::Timestamp, Value::Int(_) | Value::Str(_)) => true,
            (LeafKind::Json, _) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LeafDef {
    pub name: String,
    pub kind: LeafKind,
    pub nullable: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EdgeDef {
    pub name: String,
    pub head: String,
    pub nullable: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ComponentDef {
    Leaf(LeafDef),
    Edge(EdgeDef),
}

impl ComponentDef {
    pub fn name(&self) -> &str {
        match self {
            ComponentDef::Leaf(leaf) => &leaf.name,
            ComponentDef::Edge(edge) => &edge.name,
        }
    }

    pub fn nullable(&self) -> bool {
        match self {
            ComponentDef::Leaf(leaf) => leaf.nullable,
            ComponentDef::Edge(edge) => edge.nullable,
        }
    }

    pub fn as_edge(&self) -> Option<&EdgeDef> {
        match self {
            ComponentDef::Edge(edge) => Some(edge),
            ComponentDef::Leaf(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UniqueConstraint {
    pub name: String,
    pub components: Vec<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReverseEdgeKind {
    OneToMany,
    OneToOne,
}

/// The inverse of `head.original_edge`, seen from the node it points to.
#[derive(Clone, Debug, PartialEq)]
pub struct ReverseEdgeDef {
    pub name: String,
    pub head: String,
    pub original_edge: String,
    pub kind: ReverseEdgeKind,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeDef {
    pub name: String,
    components: Vec<ComponentDef>,
    unique_constraints: Vec<UniqueConstraint>,
    reverse_edges: Vec<ReverseEdgeDef>,
}

impl NodeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: Vec::new(),
            unique_constraints: Vec::new(),
            reverse_edges: Vec::new(),
        }
    }

    pub fn leaf(mut self, name: impl Into<String>, kind: LeafKind) -> Self {
        self.components.push(ComponentDef::Leaf(LeafDef {
            name: name.into(),
            kind,
            nullable: false,
        }));
        self
    }

    pub fn optional_leaf(mut self, name: impl Into<String>, kind: LeafKind) -> Self {
        self.components.push(ComponentDef::Leaf(LeafDef {
            name: name.into(),
            kind,
            nullable: true,
        }));
        self
    }

    pub fn edge(mut self, name: impl Into<String>, head: impl Into<String>) -> Self {
        self.components.push(ComponentDef::Edge(EdgeDef {
            name: name.into(),
            head: head.into(),
            nullable: false,
        }));
        self
    }

    pub fn optional_edge(mut self, name: impl Into<String>, head: impl Into<String>) -> Self {
        self.components.push(ComponentDef::Edge(EdgeDef {
            name: name.into(),
            head: head.into(),
            nullable: true,
        }));
        self
    }

    pub fn unique<const N: usize>(mut self, components: [&str; N]) -> Self {
        let components: Vec<String> = components.iter().map(|name| name.to_string()).collect();
        self.unique_constraints.push(UniqueConstraint {
            name: components.join("_"),
            components,
        });
        self
    }

    pub fn components(&self) -> &[ComponentDef] {
        &self.components
    }

    pub fn component(&self, name: &str) -> Option<&ComponentDef> {
        self.components
            .iter()
            .find(|component| component.name() == name)
    }

    pub fn component_or_err(&self, name: &str) -> VesperResult<&ComponentDef> {
        self.component(name).ok_or_else(|| {
            VesperError::definition(format!("\"{}\" has no component \"{name}\"", self.name))
        })
    }

    pub fn edge_def(&self, name: &str) -> VesperResult<&EdgeDef> {
        self.component_or_err(name)?.as_edge().ok_or_else(|| {
            VesperError::definition(format!("\"{}.{name}\" is not an edge", self.name))
        })
    }

    pub fn unique_constraints(&self) -> &[UniqueConstraint] {
        &self.unique_constraints
    }

    /// The first unique constraint; `SchemaBuilder::build` guarantees it exists.
    pub fn identifier(&self) -> &UniqueConstraint {
        &self.unique_constraints[0]
    }

    pub fn reverse_edges(&self) -> &[ReverseEdgeDef] {
        &self.reverse_edges
    }

    pub fn reverse_edge(&self, name: &str) -> Option<&ReverseEdgeDef> {
        self.reverse_edges.iter().find(|reverse| reverse.name == name)
    }

    pub fn reverse_edge_or_err(&self, name: &str) -> VesperResult<&ReverseEdgeDef> {
        self.reverse_edge(name).ok_or_else(|| {
            VesperError::definition(format!("\"{}\" has no reverse edge \"{name}\"", self.name))
        })
    }

    /// Extracts the identifier of `value`, reducing edge components to the
    /// identifier of their head. Every identifier component must be non-null.
    pub fn identifier_of(&self, schema: &Schema, value: &Record) -> VesperResult<Record> {
        let mut id = Record::new();
        for name in &self.identifier().components {
            let component_value = value.get(name).filter(|value| !value.is_null());
            let Some(component_value) = component_value else {
                return Err(VesperError::invalid(format!(
                    "\"{}\" identifier component \"{name}\" is missing or null",
                    self.name
                )));
            };
            let reduced = match self.component_or_err(name)? {
                ComponentDef::Leaf(_) => component_value.clone(),
                ComponentDef::Edge(edge) => {
                    let head = schema.node(&edge.head)?;
                    let reference = component_value.as_record().ok_or_else(|| {
                        VesperError::invalid(format!(
                            "\"{}.{name}\" must reference a record",
                            self.name
                        ))
                    })?;
                    Value::Record(head.identifier_of(schema, reference)?)
                }
            };
            id.insert(name.clone(), reduced);
        }
        Ok(id)
    }

    /// Scalars compare by value, edges by the identifier of their head.
    pub fn component_equals(&self, schema: &Schema, name: &str, a: &Value, b: &Value) -> bool {
        let Some(ComponentDef::Edge(edge)) = self.component(name) else {
            return a.same(b);
        };
        match (a.as_record(), b.as_record()) {
            (Some(left), Some(right)) => match schema.node(&edge.head) {
                Ok(head) => match (
                    head.identifier_of(schema, left),
                    head.identifier_of(schema, right),
                ) {
                    (Ok(left), Ok(right)) => left == right,
                    _ => left == right,
                },
                Err(_) => left == right,
            },
            _ => a == b,
        }
    }

    /// Checks a full (`partial == false`) or partial value against the
    /// component definitions.
    pub fn check_value(&self, value: &Record, partial: bool) -> VesperResult<()> {
        for (name, component_value) in value {
            let component = self.component(name).ok_or_else(|| {
                VesperError::invalid(format!("\"{}\" has no component \"{name}\"", self.name))
            })?;
            if component_value.is_null() && !component.nullable() {
                return Err(VesperError::invalid(format!(
                    "\"{}.{name}\" is not nullable",
                    self.name
                )));
            }
            match component {
                ComponentDef::Leaf(leaf) if !leaf.kind.accepts(component_value) => {
                    return Err(VesperError::invalid(format!(
                        "\"{}.{name}\" does not accept {component_value:?}",
                        self.name
                    )));
                }
                ComponentDef::Edge(_)
                    if !component_value.is_null() && component_value.as_record().is_none() =>
                {
                    return Err(VesperError::invalid(format!(
                        "\"{}.{name}\" must reference a record",
                        self.name
                    )));
                }
                _ => {}
            }
        }
        if !partial {
            for component in &self.components {
                if !component.nullable() && !value.contains_key(component.name()) {
                    return Err(VesperError::invalid(format!(
                        "\"{}.{}\" is required",
                        self.name,
                        component.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Schema {
    nodes: BTreeMap<String, NodeDef>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn node(&self, name: &str) -> VesperResult<&NodeDef> {
        self.nodes
            .get(name)
            .ok_or_else(|| VesperError::definition(format!("unknown node \"{name}\"")))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDef> {
        self.nodes.values()
    }

    pub fn edge_head(&self, node: &str, edge: &str) -> VesperResult<&NodeDef> {
        let edge = self.node(node)?.edge_def(edge)?;
        self.node(&edge.head)
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    nodes: Vec<NodeDef>,
    reverse_edges: Vec<(String, String, String, String)>,
}

impl SchemaBuilder {
    pub fn node(mut self, node: NodeDef) -> Self {
        self.nodes.push(node);
        self
    }

    /// Declares `node.name` as the inverse of the edge `head.original_edge`.
    pub fn reverse_edge(
        mut self,
        node: impl Into<String>,
        name: impl Into<String>,
        head: impl Into<String>,
        original_edge: impl Into<String>,
    ) -> Self {
        self.reverse_edges
            .push((node.into(), name.into(), head.into(), original_edge.into()));
        self
    }

    pub fn build(self) -> VesperResult<Schema> {
        let mut nodes = BTreeMap::new();
        for node in self.nodes {
            let mut names = BTreeSet::new();
            for component in &node.components {
                if !names.insert(component.name().to_string()) {
                    return Err(VesperError::definition(format!(
                        "\"{}\" declares \"{}\" twice",
                        node.name,
                        component.name()
                    )));
                }
            }
            if node.unique_constraints.is_empty() {
                return Err(VesperError::definition(format!(
                    "\"{}\" has no unique constraint",
                    node.name
                )));
            }
            for constraint in &node.unique_constraints {
                if constraint.components.is_empty() {
                    return Err(VesperError::definition(format!(
                        "\"{}\" has an empty unique constraint",
                        node.name
                    )));
                }
                for name in &constraint.components {
                    node.component_or_err(name)?;
                }
            }
            for name in &node.identifier().components {
                if node.component_or_err(name)?.nullable() {
                    return Err(VesperError::definition(format!(
                        "\"{}\" identifier component \"{name}\" is nullable",
                        node.name
                    )));
                }
            }
            let name = node.name.clone();
            if nodes.insert(name.clone(), node).is_some() {
                return Err(VesperError::definition(format!(
                    "node \"{name}\" declared twice"
                )));
            }
        }

        for node in nodes.values() {
            for component in &node.components {
                if let ComponentDef::Edge(edge) = component {
                    if !nodes.contains_key(&edge.head) {
                        return Err(VesperError::definition(format!(
                            "\"{}.{}\" references unknown node \"{}\"",
                            node.name, edge.name, edge.head
                        )));
                    }
                }
            }
        }

        for (node_name, name, head_name, original_edge) in self.reverse_edges {
            let head = nodes.get(&head_name).ok_or_else(|| {
                VesperError::definition(format!("unknown node \"{head_name}\""))
            })?;
            let edge = head.edge_def(&original_edge)?;
            if edge.head != node_name {
                return Err(VesperError::definition(format!(
                    "\"{head_name}.{original_edge}\" does not reference \"{node_name}\""
                )));
            }
            let kind = if head
                .unique_constraints
                .iter()
                .any(|constraint| constraint.components == [original_edge.clone()])
            {
                ReverseEdgeKind::OneToOne
            } else {
                ReverseEdgeKind::OneToMany
            };
            let node = nodes.get_mut(&node_name).ok_or_else(|| {
                VesperError::definition(format!("unknown node \"{node_name}\""))
            })?;
            if node.component(&name).is_some() || node.reverse_edge(&name).is_some() {
                return Err(VesperError::definition(format!(
                    "\"{node_name}\" declares \"{name}\" twice"
                )));
            }
            node.reverse_edges.push(ReverseEdgeDef {
                name,
                head: head_name,
                original_edge,
                kind,
            });
        }

        Ok(Schema { nodes })
    }
}
