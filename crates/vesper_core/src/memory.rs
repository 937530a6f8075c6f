//! An in-process [`Connector`] over plain maps.
//!
//! Rows store edges as the identifier of their head. Reads hydrate edges and
//! reverse edges as deep as the filter, ordering and selection require.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use log::debug;

use crate::{
    ComponentDef, Connector, Dependency, DependencyTree, Filter, FindInput, MutationContext,
    NodeChange, NodeDef, Record, ReverseEdgeKind, Schema, Timestamp, Value, VesperError,
    VesperResult, canonical_record_key,
};

type Table = BTreeMap<String, Record>;

#[derive(Debug)]
pub struct MemoryConnector {
    schema: Arc<Schema>,
    tables: Mutex<BTreeMap<String, Table>>,
}

impl MemoryConnector {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Table>> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn count(&self, node: &str) -> usize {
        self.lock().get(node).map(BTreeMap::len).unwrap_or(0)
    }
}

/// Reduces every edge of `value` to its head's identifier.
fn normalize_edges(schema: &Schema, def: &NodeDef, value: &mut Record) -> VesperResult<()> {
    for component in def.components() {
        let ComponentDef::Edge(edge) = component else {
            continue;
        };
        if let Some(Value::Record(reference)) = value.get(&edge.name) {
            let head = schema.node(&edge.head)?;
            let id = head.identifier_of(schema, reference)?;
            value.insert(edge.name.clone(), Value::Record(id));
        }
    }
    Ok(())
}

fn check_references(
    tables: &BTreeMap<String, Table>,
    def: &NodeDef,
    value: &Record,
) -> VesperResult<()> {
    for component in def.components() {
        let ComponentDef::Edge(edge) = component else {
            continue;
        };
        if let Some(Value::Record(reference)) = value.get(&edge.name) {
            let key = canonical_record_key(reference);
            let exists = tables
                .get(&edge.head)
                .is_some_and(|table| table.contains_key(&key));
            if !exists {
                return Err(VesperError::invalid(format!(
                    "\"{}.{}\" references missing \"{}\" {key}",
                    def.name, edge.name, edge.head
                )));
            }
        }
    }
    Ok(())
}

fn check_unique(
    def: &NodeDef,
    table: Option<&Table>,
    value: &Record,
    own_key: &str,
) -> VesperResult<()> {
    let Some(table) = table else {
        return Ok(());
    };
    for constraint in def.unique_constraints() {
        let clashes = table.iter().any(|(key, row)| {
            key != own_key
                && constraint.components.iter().all(|name| {
                    let candidate = value.get(name).unwrap_or(&Value::Null);
                    !candidate.is_null() && row.get(name) == Some(candidate)
                })
        });
        if clashes {
            return Err(VesperError::conflict(format!(
                "\"{}\" violates unique constraint \"{}\"",
                def.name, constraint.name
            )));
        }
    }
    Ok(())
}

/// Loads what `tree` observes beyond the stored row.
fn hydrate(
    schema: &Schema,
    tables: &BTreeMap<String, Table>,
    tree: &DependencyTree,
    row: &Record,
) -> VesperResult<Record> {
    let def = schema.node(&tree.node)?;
    let mut hydrated = row.clone();
    for (dependency, nested) in &tree.children {
        let Some(nested) = nested else {
            continue;
        };
        match dependency {
            Dependency::Component(name) => {
                if let Some(Value::Record(reference)) = row.get(name) {
                    let head = tables
                        .get(&nested.node)
                        .and_then(|table| table.get(&canonical_record_key(reference)));
                    if let Some(head) = head {
                        hydrated.insert(
                            name.clone(),
                            Value::Record(hydrate(schema, tables, nested, head)?),
                        );
                    }
                }
            }
            Dependency::ReverseEdge(name) => {
                let reverse = def.reverse_edge_or_err(name)?;
                let id = def.identifier_of(schema, row)?;
                let mut heads = Vec::new();
                if let Some(table) = tables.get(&reverse.head) {
                    for candidate in table.values() {
                        if candidate.get(&reverse.original_edge) == Some(&Value::Record(id.clone())) {
                            heads.push(Value::Record(hydrate(schema, tables, nested, candidate)?));
                        }
                    }
                }
                let value = match reverse.kind {
                    ReverseEdgeKind::OneToMany => Value::List(heads),
                    ReverseEdgeKind::OneToOne => heads.into_iter().next().unwrap_or(Value::Null),
                };
                hydrated.insert(name.clone(), value);
            }
        }
    }
    Ok(hydrated)
}

/// Keys and hydrated rows of `node` matching `filter`, in key order.
fn matching(
    schema: &Schema,
    tables: &BTreeMap<String, Table>,
    node: &str,
    filter: &Filter,
    tree: &DependencyTree,
) -> VesperResult<Vec<(String, Record)>> {
    let mut rows = Vec::new();
    let Some(table) = tables.get(node) else {
        return Ok(rows);
    };
    for (key, row) in table {
        let hydrated = hydrate(schema, tables, tree, row)?;
        if filter.execute(&hydrated) == Some(true) {
            rows.push((key.clone(), hydrated));
        }
    }
    Ok(rows)
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn find(&self, input: FindInput) -> VesperResult<Vec<Record>> {
        let schema = &self.schema;
        let mut tree = input.filter.dependencies(schema, &input.node)?;
        tree.merge(input.selection.dependencies(schema, &input.node)?)?;
        if let Some(order_by) = &input.order_by {
            tree.merge(order_by.dependencies(schema, &input.node)?)?;
        }
        let tables = self.lock();
        let mut rows: Vec<Record> = matching(schema, &tables, &input.node, &input.filter, &tree)?
            .into_iter()
            .map(|(_, row)| row)
            .collect();
        if let Some(order_by) = &input.order_by {
            rows.sort_by(|left, right| order_by.compare(left, right));
        }
        if let Some(limit) = input.limit {
            rows.truncate(limit);
        }
        rows.iter()
            .map(|row| {
                input.selection.pick(row).ok_or_else(|| {
                    VesperError::invalid(format!(
                        "selection on \"{}\" reads something that was not loaded",
                        input.node
                    ))
                })
            })
            .collect()
    }

    async fn create(
        &self,
        tracker: &MutationContext,
        node: &str,
        value: Record,
    ) -> VesperResult<Record> {
        let schema = &self.schema;
        let def = schema.node(node)?;
        def.check_value(&value, false)?;
        let mut row = value;
        for component in def.components() {
            row.entry(component.name().to_string()).or_insert(Value::Null);
        }
        normalize_edges(schema, def, &mut row)?;

        let mut tables = self.lock();
        check_references(&tables, def, &row)?;
        let key = canonical_record_key(&def.identifier_of(schema, &row)?);
        check_unique(def, tables.get(node), &row, &key)?;
        if tables.get(node).is_some_and(|table| table.contains_key(&key)) {
            return Err(VesperError::conflict(format!("\"{node}\" {key} already exists")));
        }
        tracker.track_change(NodeChange::creation(
            schema,
            node,
            row.clone(),
            tracker.request_context().clone(),
            Timestamp::now(),
        )?)?;
        tables.entry(node.to_string()).or_default().insert(key.clone(), row.clone());
        debug!("memory: created \"{node}\" {key}");
        Ok(row)
    }

    async fn update(
        &self,
        tracker: &MutationContext,
        node: &str,
        filter: Filter,
        patch: Record,
    ) -> VesperResult<Vec<Record>> {
        let schema = &self.schema;
        let def = schema.node(node)?;
        def.check_value(&patch, true)?;
        let mut patch = patch;
        normalize_edges(schema, def, &mut patch)?;
        let tree = filter.dependencies(schema, node)?;

        let mut tables = self.lock();
        check_references(&tables, def, &patch)?;
        let targets = matching(schema, &tables, node, &filter, &tree)?;
        // Every row is checked against the staged table before anything is
        // tracked or stored, so a failing row leaves the others untouched.
        let mut staged = tables.get(node).cloned().unwrap_or_default();
        let mut changes = Vec::with_capacity(targets.len());
        let mut updated = Vec::with_capacity(targets.len());
        for (key, _) in targets {
            let Some(old) = staged.get(&key).cloned() else {
                continue;
            };
            let mut new = old.clone();
            new.extend(patch.clone());
            check_unique(def, Some(&staged), &new, &key)?;
            changes.push(NodeChange::update(
                schema,
                node,
                old,
                new.clone(),
                tracker.request_context().clone(),
                Timestamp::now(),
            )?);
            staged.insert(key, new.clone());
            updated.push(new);
        }
        for change in changes {
            tracker.track_change(change)?;
        }
        tables.insert(node.to_string(), staged);
        debug!("memory: updated {} \"{node}\" rows", updated.len());
        Ok(updated)
    }

    async fn delete(
        &self,
        tracker: &MutationContext,
        node: &str,
        filter: Filter,
    ) -> VesperResult<Vec<Record>> {
        let schema = &self.schema;
        let tree = filter.dependencies(schema, node)?;

        let mut tables = self.lock();
        let targets = matching(schema, &tables, node, &filter, &tree)?;
        let mut deleted = Vec::with_capacity(targets.len());
        for (key, _) in targets {
            let Some(old) = tables.get(node).and_then(|table| table.get(&key)).cloned() else {
                continue;
            };
            let id = Value::Record(schema.node(node)?.identifier_of(schema, &old)?);
            for referencing in schema.nodes() {
                for component in referencing.components() {
                    let Some(edge) = component.as_edge() else {
                        continue;
                    };
                    if edge.head != node {
                        continue;
                    }
                    let referenced = tables.get(&referencing.name).is_some_and(|table| {
                        table.values().any(|row| row.get(&edge.name) == Some(&id))
                    });
                    if referenced {
                        return Err(VesperError::conflict(format!(
                            "\"{node}\" {key} is still referenced by \"{}.{}\"",
                            referencing.name, edge.name
                        )));
                    }
                }
            }
            tracker.track_change(NodeChange::deletion(
                schema,
                node,
                old.clone(),
                tracker.request_context().clone(),
                Timestamp::now(),
            )?)?;
            if let Some(table) = tables.get_mut(node) {
                table.remove(&key);
            }
            deleted.push(old);
        }
        debug!("memory: deleted {} \"{node}\" rows", deleted.len());
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::MemoryConnector;
    use crate::schema::fixtures::blog_schema;
    use crate::{
        Connector, Filter, FindInput, MutationContext, OrderBy, Record, Selection, Value, record,
    };

    async fn seeded() -> (MemoryConnector, MutationContext) {
        let schema = Arc::new(blog_schema());
        let connector = MemoryConnector::new(schema.clone());
        let context = MutationContext::new(schema, serde_json::Value::Null);
        connector
            .create(
                &context,
                "Category",
                record([("id", Value::Int(1)), ("slug", "news".into()), ("title", "News".into())]),
            )
            .await
            .expect("category");
        for (id, status) in [(1, "PUBLISHED"), (2, "DRAFT"), (3, "PUBLISHED")] {
            connector
                .create(
                    &context,
                    "Article",
                    record([
                        ("id", Value::Int(id)),
                        ("title", format!("Article {id}").into()),
                        ("status", status.into()),
                        ("category", record([("id", Value::Int(1))]).into()),
                    ]),
                )
                .await
                .expect("article");
        }
        (connector, context)
    }

    #[tokio::test]
    async fn find_filters_orders_and_picks() {
        let (connector, _) = seeded().await;
        let rows = connector
            .find(FindInput {
                node: "Article".into(),
                filter: Filter::eq("status", "PUBLISHED"),
                order_by: Some(OrderBy::new().desc("id")),
                limit: Some(1),
                selection: Selection::new().components(["id", "title"]),
            })
            .await
            .expect("find");
        assert_eq!(
            rows,
            vec![record([("id", Value::Int(3)), ("title", "Article 3".into())])]
        );
    }

    #[tokio::test]
    async fn find_hydrates_edges_and_reverse_edges() {
        let (connector, _) = seeded().await;
        let articles = connector
            .find(FindInput {
                node: "Article".into(),
                filter: Filter::edge("category", Filter::eq("slug", "news")),
                order_by: None,
                limit: None,
                selection: Selection::new().component("id"),
            })
            .await
            .expect("articles");
        assert_eq!(articles.len(), 3);

        let categories = connector
            .find(FindInput {
                node: "Category".into(),
                filter: Filter::reverse_edge_count(
                    "articles",
                    Filter::eq("status", "PUBLISHED"),
                    crate::CompareOp::Eq,
                    2,
                ),
                order_by: None,
                limit: None,
                selection: Selection::new().component("slug"),
            })
            .await
            .expect("categories");
        assert_eq!(categories, vec![record([("slug", "news".into())])]);
    }

    #[tokio::test]
    async fn mutations_are_tracked() {
        let (connector, context) = seeded().await;
        assert_eq!(context.pending(), 4);
        let updated = connector
            .update(
                &context,
                "Article",
                Filter::eq("id", 2),
                record([("status", "PUBLISHED".into())]),
            )
            .await
            .expect("update");
        assert_eq!(updated.len(), 1);
        assert_eq!(context.pending(), 4);

        assert!(
            connector
                .delete(&context, "Category", Filter::True)
                .await
                .is_err()
        );
        let deleted: Vec<Record> = connector
            .delete(&context, "Article", Filter::eq("status", "DRAFT"))
            .await
            .expect("delete");
        assert!(deleted.is_empty());
        assert_eq!(connector.count("Article"), 3);
    }

    #[tokio::test]
    async fn unique_constraints_and_references_are_enforced() {
        let (connector, context) = seeded().await;
        let duplicate_slug = connector
            .create(
                &context,
                "Category",
                record([("id", Value::Int(2)), ("slug", "news".into()), ("title", "Again".into())]),
            )
            .await;
        assert!(duplicate_slug.is_err());
        let dangling = connector
            .create(
                &context,
                "Comment",
                record([
                    ("id", Value::Int(1)),
                    ("text", "hi".into()),
                    ("article", record([("id", Value::Int(99))]).into()),
                ]),
            )
            .await;
        assert!(dangling.is_err());
    }

    #[tokio::test]
    async fn failed_multi_row_update_changes_nothing() {
        let (connector, context) = seeded().await;
        connector
            .create(
                &context,
                "Category",
                record([("id", Value::Int(2)), ("slug", "misc".into()), ("title", "Misc".into())]),
            )
            .await
            .expect("category");
        let pending = context.pending();

        let clash = connector
            .update(&context, "Category", Filter::True, record([("slug", "shared".into())]))
            .await;
        assert!(clash.is_err());
        assert_eq!(context.pending(), pending);

        let slugs = connector
            .find(FindInput {
                node: "Category".into(),
                filter: Filter::True,
                order_by: Some(OrderBy::new().asc("id")),
                limit: None,
                selection: Selection::new().component("slug"),
            })
            .await
            .expect("categories");
        assert_eq!(
            slugs,
            vec![record([("slug", "news".into())]), record([("slug", "misc".into())])]
        );
    }
}
