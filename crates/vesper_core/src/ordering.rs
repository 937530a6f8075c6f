use std::cmp::Ordering;

use crate::{Dependency, DependencyTree, Filter, Record, Schema, Value, VesperResult};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OrderingExpression {
    Leaf(String),
    /// Orders by an expression evaluated on the head of `edge`.
    Edge {
        edge: String,
        expression: Box<OrderingExpression>,
    },
    /// Orders by the number of heads reached through `reverse_edge`.
    ReverseEdgeCount {
        reverse_edge: String,
        filter: Option<Filter>,
    },
}

impl OrderingExpression {
    /// `None` when the record lacks what the expression reads.
    pub fn value_of(&self, record: &Record) -> Option<Value> {
        match self {
            OrderingExpression::Leaf(component) => record.get(component).cloned(),
            OrderingExpression::Edge { edge, expression } => match record.get(edge)? {
                Value::Null => Some(Value::Null),
                Value::Record(head) => expression.value_of(head),
                _ => None,
            },
            OrderingExpression::ReverseEdgeCount {
                reverse_edge,
                filter,
            } => {
                let heads: Vec<&Record> = match record.get(reverse_edge)? {
                    Value::Null => Vec::new(),
                    Value::Record(head) => vec![head],
                    Value::List(items) => items
                        .iter()
                        .map(Value::as_record)
                        .collect::<Option<Vec<_>>>()?,
                    _ => return None,
                };
                let mut count = 0i64;
                for head in heads {
                    let matches = match filter {
                        Some(filter) => filter.execute(head)?,
                        None => true,
                    };
                    if matches {
                        count += 1;
                    }
                }
                Some(Value::Int(count))
            }
        }
    }

    pub fn dependencies(&self, schema: &Schema, node: &str) -> VesperResult<DependencyTree> {
        let def = schema.node(node)?;
        let mut tree = DependencyTree::new(node);
        match self {
            OrderingExpression::Leaf(component) => {
                def.component_or_err(component)?;
                tree.add(Dependency::Component(component.clone()), None)?;
            }
            OrderingExpression::Edge { edge, expression } => {
                let head = &def.edge_def(edge)?.head;
                let nested = expression.dependencies(schema, head)?;
                tree.add(Dependency::Component(edge.clone()), Some(nested))?;
            }
            OrderingExpression::ReverseEdgeCount {
                reverse_edge,
                filter,
            } => {
                let head = &def.reverse_edge_or_err(reverse_edge)?.head;
                let nested = match filter {
                    Some(filter) => filter.dependencies(schema, head)?,
                    None => DependencyTree::new(head.clone()),
                };
                tree.add(Dependency::ReverseEdge(reverse_edge.clone()), Some(nested))?;
            }
        }
        Ok(tree)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderingTerm {
    pub expression: OrderingExpression,
    pub direction: Direction,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OrderBy {
    pub terms: Vec<OrderingTerm>,
}

impl OrderBy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, expression: OrderingExpression, direction: Direction) -> Self {
        self.terms.push(OrderingTerm {
            expression,
            direction,
        });
        self
    }

    pub fn asc(self, component: impl Into<String>) -> Self {
        self.then(OrderingExpression::Leaf(component.into()), Direction::Ascending)
    }

    pub fn desc(self, component: impl Into<String>) -> Self {
        self.then(OrderingExpression::Leaf(component.into()), Direction::Descending)
    }

    /// Compares two records term by term; unreadable values sort first.
    pub fn compare(&self, left: &Record, right: &Record) -> Ordering {
        for term in &self.terms {
            let left_value = term.expression.value_of(left).unwrap_or_default();
            let right_value = term.expression.value_of(right).unwrap_or_default();
            let ordering = left_value.sort_cmp(&right_value);
            let ordering = match term.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub fn dependencies(&self, schema: &Schema, node: &str) -> VesperResult<DependencyTree> {
        DependencyTree::merged(
            node,
            self.terms
                .iter()
                .map(|term| term.expression.dependencies(schema, node))
                .collect::<VesperResult<Vec<_>>>()?,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::{Direction, OrderBy, OrderingExpression};
    use crate::schema::fixtures::blog_schema;
    use crate::{Dependency, Value, record};

    #[test]
    fn compares_term_by_term() {
        let order = OrderBy::new().desc("score").asc("title");
        let a = record([("score", Value::Int(3)), ("title", "b".into())]);
        let b = record([("score", Value::Int(3)), ("title", "a".into())]);
        let c = record([("score", Value::Int(9)), ("title", "z".into())]);
        assert_eq!(order.compare(&a, &b), Ordering::Greater);
        assert_eq!(order.compare(&c, &a), Ordering::Less);
    }

    #[test]
    fn counts_reverse_edges() {
        let expression = OrderingExpression::ReverseEdgeCount {
            reverse_edge: "comments".into(),
            filter: None,
        };
        let article = record([(
            "comments",
            Value::List(vec![record([]).into(), record([]).into()]),
        )]);
        assert_eq!(expression.value_of(&article), Some(Value::Int(2)));
        assert_eq!(expression.value_of(&record([])), None);
    }

    #[test]
    fn edge_terms_depend_on_the_head() {
        let schema = blog_schema();
        let order = OrderBy::new().then(
            OrderingExpression::Edge {
                edge: "category".into(),
                expression: Box::new(OrderingExpression::Leaf("title".into())),
            },
            Direction::Ascending,
        );
        let tree = order.dependencies(&schema, "Article").expect("deps");
        let nested = tree.children[&Dependency::Component("category".into())]
            .as_ref()
            .expect("nested");
        assert!(nested.children.contains_key(&Dependency::Component("title".into())));
    }
}
