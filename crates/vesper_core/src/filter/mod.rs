//! Boolean filter algebra over node records.
//!
//! Filters are built through [`Filter::and`], [`Filter::or`] and
//! [`Filter::not`], which always run the reduction pipeline in [`reduce`].
//! Execution is three-valued: `None` means the record does not carry enough
//! information to decide (a component was not loaded).

mod reduce;

use crate::{
    ComponentDef, Dependency, DependencyTree, Record, Schema, Value, VesperError, VesperResult,
};

/// Recursion depth granted to pairwise reducers.
pub const REDUCTION_BUDGET: usize = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CompareOp {
    Eq,
    Not,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    /// `actual <op> expected`; ordered comparisons of null or mismatched
    /// kinds never hold.
    pub fn holds(self, actual: &Value, expected: &Value) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            CompareOp::Eq => actual.same(expected),
            CompareOp::Not => !actual.same(expected),
            CompareOp::Gt => actual.compare(expected) == Some(Greater),
            CompareOp::Gte => matches!(actual.compare(expected), Some(Greater | Equal)),
            CompareOp::Lt => actual.compare(expected) == Some(Less),
            CompareOp::Lte => matches!(actual.compare(expected), Some(Less | Equal)),
        }
    }

    pub(crate) fn is_lower_bound(self) -> bool {
        matches!(self, CompareOp::Gt | CompareOp::Gte)
    }

    pub(crate) fn is_upper_bound(self) -> bool {
        matches!(self, CompareOp::Lt | CompareOp::Lte)
    }

    pub(crate) fn is_strict(self) -> bool {
        matches!(self, CompareOp::Gt | CompareOp::Lt)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    True,
    False,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Compare {
        component: String,
        op: CompareOp,
        value: Value,
    },
    In {
        component: String,
        values: Vec<Value>,
    },
    /// The edge is set and its head matches `filter`.
    Edge {
        edge: String,
        filter: Box<Filter>,
    },
    /// At least one head reached through the reverse edge matches `filter`.
    ReverseEdge {
        reverse_edge: String,
        filter: Box<Filter>,
    },
    ReverseEdgeCount {
        reverse_edge: String,
        filter: Box<Filter>,
        op: CompareOp,
        count: i64,
    },
}

impl Filter {
    pub fn and(operands: impl IntoIterator<Item = Filter>) -> Filter {
        reduce::conjunction(operands.into_iter().collect(), REDUCTION_BUDGET)
    }

    pub fn or(operands: impl IntoIterator<Item = Filter>) -> Filter {
        reduce::disjunction(operands.into_iter().collect(), REDUCTION_BUDGET)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(operand: Filter) -> Filter {
        reduce::negation(operand, REDUCTION_BUDGET)
    }

    pub fn compare(component: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Filter {
        Filter::Compare {
            component: component.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(component: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::compare(component, CompareOp::Eq, value)
    }

    pub fn ne(component: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::compare(component, CompareOp::Not, value)
    }

    pub fn gt(component: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::compare(component, CompareOp::Gt, value)
    }

    pub fn gte(component: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::compare(component, CompareOp::Gte, value)
    }

    pub fn lt(component: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::compare(component, CompareOp::Lt, value)
    }

    pub fn lte(component: impl Into<String>, value: impl Into<Value>) -> Filter {
        Filter::compare(component, CompareOp::Lte, value)
    }

    /// Set membership; an empty set is `False`, a singleton an equality.
    pub fn is_in(component: impl Into<String>, values: impl IntoIterator<Item = Value>) -> Filter {
        let mut unique: Vec<Value> = Vec::new();
        for value in values {
            if !unique.iter().any(|known| known.same(&value)) {
                unique.push(value);
            }
        }
        let component = component.into();
        match unique.len() {
            0 => Filter::False,
            1 => Filter::eq(component, unique.remove(0)),
            _ => Filter::In {
                component,
                values: unique,
            },
        }
    }

    pub fn edge(edge: impl Into<String>, filter: Filter) -> Filter {
        match filter {
            Filter::False => Filter::False,
            filter => Filter::Edge {
                edge: edge.into(),
                filter: Box::new(filter),
            },
        }
    }

    pub fn edge_exists(edge: impl Into<String>) -> Filter {
        Filter::edge(edge, Filter::True)
    }

    pub fn reverse_edge(reverse_edge: impl Into<String>, filter: Filter) -> Filter {
        match filter {
            Filter::False => Filter::False,
            filter => Filter::ReverseEdge {
                reverse_edge: reverse_edge.into(),
                filter: Box::new(filter),
            },
        }
    }

    pub fn reverse_edge_count(
        reverse_edge: impl Into<String>,
        filter: Filter,
        op: CompareOp,
        count: i64,
    ) -> Filter {
        Filter::ReverseEdgeCount {
            reverse_edge: reverse_edge.into(),
            filter: Box::new(filter),
            op,
            count,
        }
    }

    /// Selects the one instance of `node` whose identifier is `id`.
    pub fn identity(schema: &Schema, node: &str, id: &Record) -> VesperResult<Filter> {
        let def = schema.node(node)?;
        let mut operands = Vec::new();
        for name in &def.identifier().components {
            let value = id.get(name).ok_or_else(|| {
                VesperError::invalid(format!("identifier of \"{node}\" lacks \"{name}\""))
            })?;
            match def.component_or_err(name)? {
                ComponentDef::Leaf(_) => operands.push(Filter::eq(name.clone(), value.clone())),
                ComponentDef::Edge(edge) => {
                    let head_id = value.as_record().ok_or_else(|| {
                        VesperError::invalid(format!("\"{node}.{name}\" must reference a record"))
                    })?;
                    operands.push(Filter::edge(
                        name.clone(),
                        Filter::identity(schema, &edge.head, head_id)?,
                    ));
                }
            }
        }
        Ok(Filter::and(operands))
    }

    /// Selects every instance whose identifier is among `ids`.
    pub fn identities<'a>(
        schema: &Schema,
        node: &str,
        ids: impl IntoIterator<Item = &'a Record>,
    ) -> VesperResult<Filter> {
        let def = schema.node(node)?;
        let identifier = &def.identifier().components;
        if let [single] = identifier.as_slice() {
            if let ComponentDef::Leaf(_) = def.component_or_err(single)? {
                let mut values = Vec::new();
                for id in ids {
                    let value = id.get(single).ok_or_else(|| {
                        VesperError::invalid(format!("identifier of \"{node}\" lacks \"{single}\""))
                    })?;
                    values.push(value.clone());
                }
                return Ok(Filter::is_in(single.clone(), values));
            }
        }
        let mut operands = Vec::new();
        for id in ids {
            operands.push(Filter::identity(schema, node, id)?);
        }
        Ok(Filter::or(operands))
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Filter::True)
    }

    pub fn is_false(&self) -> bool {
        matches!(self, Filter::False)
    }

    /// The exact negation when it is itself a single node.
    pub fn complement(&self) -> Option<Filter> {
        match self {
            Filter::True => Some(Filter::False),
            Filter::False => Some(Filter::True),
            Filter::Not(inner) => Some((**inner).clone()),
            Filter::Compare {
                component,
                op: CompareOp::Eq,
                value,
            } => Some(Filter::ne(component.clone(), value.clone())),
            Filter::Compare {
                component,
                op: CompareOp::Not,
                value,
            } => Some(Filter::eq(component.clone(), value.clone())),
            _ => None,
        }
    }

    /// Structural size; reductions never increase it.
    pub fn score(&self) -> usize {
        match self {
            Filter::True | Filter::False => 0,
            Filter::Compare { .. } | Filter::In { .. } => 1,
            Filter::And(operands) | Filter::Or(operands) => {
                1 + operands.iter().map(Filter::score).sum::<usize>()
            }
            Filter::Not(inner) => 1 + inner.score(),
            Filter::Edge { filter, .. }
            | Filter::ReverseEdge { filter, .. }
            | Filter::ReverseEdgeCount { filter, .. } => 1 + filter.score(),
        }
    }

    pub fn execute(&self, value: &Record) -> Option<bool> {
        match self {
            Filter::True => Some(true),
            Filter::False => Some(false),
            Filter::And(operands) => {
                let mut unknown = false;
                for operand in operands {
                    match operand.execute(value) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                (!unknown).then_some(true)
            }
            Filter::Or(operands) => {
                let mut unknown = false;
                for operand in operands {
                    match operand.execute(value) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                (!unknown).then_some(false)
            }
            Filter::Not(inner) => inner.execute(value).map(|result| !result),
            Filter::Compare {
                component,
                op,
                value: expected,
            } => value
                .get(component)
                .map(|actual| op.holds(actual, expected)),
            Filter::In { component, values } => value
                .get(component)
                .map(|actual| values.iter().any(|candidate| actual.same(candidate))),
            Filter::Edge { edge, filter } => match value.get(edge)? {
                Value::Null => Some(false),
                Value::Record(head) => filter.execute(head),
                _ => None,
            },
            Filter::ReverseEdge {
                reverse_edge,
                filter,
            } => {
                let heads = reverse_heads(value.get(reverse_edge)?)?;
                let mut unknown = false;
                for head in heads {
                    match filter.execute(head) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                (!unknown).then_some(false)
            }
            Filter::ReverseEdgeCount {
                reverse_edge,
                filter,
                op,
                count,
            } => {
                let heads = reverse_heads(value.get(reverse_edge)?)?;
                let mut matched = 0i64;
                for head in heads {
                    if filter.execute(head)? {
                        matched += 1;
                    }
                }
                Some(op.holds(&Value::Int(matched), &Value::Int(*count)))
            }
        }
    }

    pub fn dependencies(&self, schema: &Schema, node: &str) -> VesperResult<DependencyTree> {
        let def = schema.node(node)?;
        let mut tree = DependencyTree::new(node);
        match self {
            Filter::True | Filter::False => {}
            Filter::And(operands) | Filter::Or(operands) => {
                for operand in operands {
                    tree.merge(operand.dependencies(schema, node)?)?;
                }
            }
            Filter::Not(inner) => tree.merge(inner.dependencies(schema, node)?)?,
            Filter::Compare { component, .. } | Filter::In { component, .. } => {
                def.component_or_err(component)?;
                tree.add(Dependency::Component(component.clone()), None)?;
            }
            Filter::Edge { edge, filter } => {
                let head = &def.edge_def(edge)?.head;
                let nested = filter.dependencies(schema, head)?;
                tree.add(
                    Dependency::Component(edge.clone()),
                    (!nested.is_empty()).then_some(nested),
                )?;
            }
            Filter::ReverseEdge {
                reverse_edge,
                filter,
            }
            | Filter::ReverseEdgeCount {
                reverse_edge,
                filter,
                ..
            } => {
                let head = &def.reverse_edge_or_err(reverse_edge)?.head;
                let nested = filter.dependencies(schema, head)?;
                tree.add(Dependency::ReverseEdge(reverse_edge.clone()), Some(nested))?;
            }
        }
        Ok(tree)
    }

    /// Rebuilds the expression bottom-up through the reducing constructors.
    pub fn simplify(&self) -> Filter {
        match self {
            Filter::And(operands) => Filter::and(operands.iter().map(Filter::simplify)),
            Filter::Or(operands) => Filter::or(operands.iter().map(Filter::simplify)),
            Filter::Not(inner) => Filter::not(inner.simplify()),
            Filter::In { component, values } => Filter::is_in(component.clone(), values.clone()),
            Filter::Edge { edge, filter } => Filter::edge(edge.clone(), filter.simplify()),
            Filter::ReverseEdge {
                reverse_edge,
                filter,
            } => Filter::reverse_edge(reverse_edge.clone(), filter.simplify()),
            Filter::ReverseEdgeCount {
                reverse_edge,
                filter,
                op,
                count,
            } => Filter::reverse_edge_count(reverse_edge.clone(), filter.simplify(), *op, *count),
            other => other.clone(),
        }
    }
}

fn reverse_heads(value: &Value) -> Option<Vec<&Record>> {
    match value {
        Value::Null => Some(Vec::new()),
        Value::Record(head) => Some(vec![head]),
        Value::List(items) => items.iter().map(Value::as_record).collect(),
        _ => None,
    }
}
