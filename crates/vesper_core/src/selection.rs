use std::collections::BTreeMap;

use crate::{
    ComponentDef, Dependency, DependencyTree, Filter, Record, Schema, Value, VesperError,
    VesperResult,
};

#[derive(Clone, Debug, PartialEq)]
pub enum Selected {
    Component,
    Edge(Selection),
    ReverseEdge {
        selection: Selection,
        filter: Option<Filter>,
    },
}

/// The shape of a delivered value: which components, edges and reverse edges
/// to project out of a record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Selection {
    pub fields: BTreeMap<String, Selected>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn component(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), Selected::Component);
        self
    }

    pub fn components<const N: usize>(mut self, names: [&str; N]) -> Self {
        for name in names {
            self.fields.insert(name.to_string(), Selected::Component);
        }
        self
    }

    pub fn edge(mut self, name: impl Into<String>, selection: Selection) -> Self {
        self.fields.insert(name.into(), Selected::Edge(selection));
        self
    }

    pub fn reverse_edge(
        mut self,
        name: impl Into<String>,
        selection: Selection,
        filter: Option<Filter>,
    ) -> Self {
        self.fields
            .insert(name.into(), Selected::ReverseEdge { selection, filter });
        self
    }

    /// Selects the identifier of `node`, descending into edge components.
    pub fn identifier(schema: &Schema, node: &str) -> VesperResult<Selection> {
        let def = schema.node(node)?;
        let mut selection = Selection::new();
        for name in &def.identifier().components {
            selection = match def.component_or_err(name)? {
                ComponentDef::Leaf(_) => selection.component(name.clone()),
                ComponentDef::Edge(edge) => {
                    selection.edge(name.clone(), Selection::identifier(schema, &edge.head)?)
                }
            };
        }
        Ok(selection)
    }

    pub fn is_subset_of(&self, other: &Selection) -> bool {
        self.fields.iter().all(|(name, selected)| {
            match (selected, other.fields.get(name)) {
                (_, None) => false,
                (Selected::Component, Some(_)) => true,
                (Selected::Edge(nested), Some(Selected::Edge(other_nested))) => {
                    nested.is_subset_of(other_nested)
                }
                (
                    Selected::ReverseEdge { selection, filter },
                    Some(Selected::ReverseEdge {
                        selection: other_selection,
                        filter: other_filter,
                    }),
                ) => filter == other_filter && selection.is_subset_of(other_selection),
                _ => false,
            }
        })
    }

    /// Projects `record`; `None` when something selected was not loaded or a
    /// reverse-edge filter cannot be decided.
    pub fn pick(&self, record: &Record) -> Option<Record> {
        let mut picked = Record::new();
        for (name, selected) in &self.fields {
            let value = record.get(name)?;
            let projected = match (selected, value) {
                (Selected::Component, value) => value.clone(),
                (_, Value::Null) => Value::Null,
                (Selected::Edge(nested), Value::Record(head)) => Value::Record(nested.pick(head)?),
                (Selected::ReverseEdge { selection, filter }, Value::List(heads)) => {
                    let mut kept = Vec::with_capacity(heads.len());
                    for head in heads {
                        let head = head.as_record()?;
                        let matches = match filter {
                            Some(filter) => filter.execute(head)?,
                            None => true,
                        };
                        if matches {
                            kept.push(Value::Record(selection.pick(head)?));
                        }
                    }
                    Value::List(kept)
                }
                (Selected::ReverseEdge { selection, filter }, Value::Record(head)) => {
                    let matches = match filter {
                        Some(filter) => filter.execute(head)?,
                        None => true,
                    };
                    if matches {
                        Value::Record(selection.pick(head)?)
                    } else {
                        Value::Null
                    }
                }
                _ => return None,
            };
            picked.insert(name.clone(), projected);
        }
        Some(picked)
    }

    pub fn dependencies(&self, schema: &Schema, node: &str) -> VesperResult<DependencyTree> {
        let def = schema.node(node)?;
        let mut tree = DependencyTree::new(node);
        for (name, selected) in &self.fields {
            match selected {
                Selected::Component => {
                    def.component_or_err(name)?;
                    tree.add(Dependency::Component(name.clone()), None)?;
                }
                Selected::Edge(nested) => {
                    let head = &def.edge_def(name)?.head;
                    let nested = nested.dependencies(schema, head)?;
                    tree.add(
                        Dependency::Component(name.clone()),
                        (!nested.is_empty()).then_some(nested),
                    )?;
                }
                Selected::ReverseEdge { selection, filter } => {
                    let head = &def.reverse_edge_or_err(name)?.head;
                    let mut nested = selection.dependencies(schema, head)?;
                    if let Some(filter) = filter {
                        nested.merge(filter.dependencies(schema, head)?)?;
                    }
                    tree.add(Dependency::ReverseEdge(name.clone()), Some(nested))?;
                }
            }
        }
        Ok(tree)
    }

    /// Checks every selected path against the schema.
    pub fn validate(&self, schema: &Schema, node: &str) -> VesperResult<()> {
        if self.fields.is_empty() {
            return Err(VesperError::definition(format!(
                "selection on \"{node}\" is empty"
            )));
        }
        self.dependencies(schema, node)?.validate(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::Selection;
    use crate::schema::fixtures::blog_schema;
    use crate::{Filter, Value, record};

    #[test]
    fn identifier_selection_is_a_subset() {
        let schema = blog_schema();
        let identifier = Selection::identifier(&schema, "Article").expect("identifier");
        let upsert = Selection::new().components(["id", "title"]);
        assert!(identifier.is_subset_of(&upsert));
        assert!(!upsert.is_subset_of(&identifier));
    }

    #[test]
    fn pick_requires_loaded_fields() {
        let selection = Selection::new().components(["id", "title"]);
        let full = record([
            ("id", Value::Int(1)),
            ("title", "Hello".into()),
            ("status", "DRAFT".into()),
        ]);
        assert_eq!(
            selection.pick(&full),
            Some(record([("id", Value::Int(1)), ("title", "Hello".into())]))
        );
        assert_eq!(selection.pick(&record([("id", Value::Int(1))])), None);
    }

    #[test]
    fn pick_descends_into_edges_and_filters_reverse_edges() {
        let selection = Selection::new()
            .component("id")
            .edge("category", Selection::new().component("slug"))
            .reverse_edge(
                "comments",
                Selection::new().component("text"),
                Some(Filter::ne("text", "spam")),
            );
        let article = record([
            ("id", Value::Int(1)),
            (
                "category",
                record([("id", Value::Int(4)), ("slug", "news".into())]).into(),
            ),
            (
                "comments",
                Value::List(vec![
                    record([("id", Value::Int(1)), ("text", "spam".into())]).into(),
                    record([("id", Value::Int(2)), ("text", "nice".into())]).into(),
                ]),
            ),
        ]);
        let picked = selection.pick(&article).expect("pick");
        assert_eq!(
            picked["category"],
            Value::Record(record([("slug", "news".into())]))
        );
        assert_eq!(
            picked["comments"],
            Value::List(vec![record([("text", "nice".into())]).into()])
        );
    }

    #[test]
    fn validate_rejects_unknown_components() {
        let schema = blog_schema();
        assert!(
            Selection::new()
                .component("nope")
                .validate(&schema, "Article")
                .is_err()
        );
        assert!(Selection::new().validate(&schema, "Article").is_err());
    }
}
