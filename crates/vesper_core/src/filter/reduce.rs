//! Reduction pipeline behind `Filter::and`, `Filter::or` and `Filter::not`.
//!
//! Normalisation flattens nested connectives, drops the identity element,
//! short-circuits on the absorbing element and removes duplicates. Pairwise
//! reducers then run while `budget` allows; a pairwise result replaces its two
//! operands only when its score is not larger than theirs combined.

use std::cmp::Ordering;

use super::{CompareOp, Filter};
use crate::Value;

#[derive(Clone, Copy, PartialEq)]
enum Connective {
    And,
    Or,
}

impl Connective {
    fn identity(self) -> Filter {
        match self {
            Connective::And => Filter::True,
            Connective::Or => Filter::False,
        }
    }

    fn absorbing(self) -> Filter {
        match self {
            Connective::And => Filter::False,
            Connective::Or => Filter::True,
        }
    }

    fn unwrap_nested(self, filter: Filter) -> Result<Vec<Filter>, Filter> {
        match (self, filter) {
            (Connective::And, Filter::And(operands)) | (Connective::Or, Filter::Or(operands)) => {
                Ok(operands)
            }
            (_, other) => Err(other),
        }
    }

    fn wrap(self, operands: Vec<Filter>) -> Filter {
        match self {
            Connective::And => Filter::And(operands),
            Connective::Or => Filter::Or(operands),
        }
    }
}

type PairReducer = fn(&Filter, &Filter, usize) -> Option<Filter>;

pub(crate) fn conjunction(operands: Vec<Filter>, budget: usize) -> Filter {
    combine(Connective::And, operands, budget, and_pair)
}

pub(crate) fn disjunction(operands: Vec<Filter>, budget: usize) -> Filter {
    combine(Connective::Or, operands, budget, or_pair)
}

pub(crate) fn negation(operand: Filter, budget: usize) -> Filter {
    if let Some(complement) = operand.complement() {
        return complement;
    }
    match operand {
        Filter::And(operands) if budget > 0 => match complements(&operands) {
            Some(negated) => disjunction(negated, budget - 1),
            None => Filter::Not(Box::new(Filter::And(operands))),
        },
        Filter::Or(operands) if budget > 0 => match complements(&operands) {
            Some(negated) => conjunction(negated, budget - 1),
            None => Filter::Not(Box::new(Filter::Or(operands))),
        },
        other => Filter::Not(Box::new(other)),
    }
}

/// De Morgan applies only when every operand negates to a single node.
fn complements(operands: &[Filter]) -> Option<Vec<Filter>> {
    operands.iter().map(Filter::complement).collect()
}

fn combine(
    connective: Connective,
    operands: Vec<Filter>,
    budget: usize,
    reducer: PairReducer,
) -> Filter {
    let Some(mut operands) = normalize(connective, operands) else {
        return connective.absorbing();
    };
    if budget > 0 {
        let mut remaining = operands.len();
        while remaining > 0 && pairwise_pass(&mut operands, budget, reducer) {
            remaining -= 1;
            match normalize(connective, operands) {
                Some(normalized) => operands = normalized,
                None => return connective.absorbing(),
            }
        }
    }
    match operands.len() {
        0 => connective.identity(),
        1 => operands.remove(0),
        _ => connective.wrap(operands),
    }
}

/// `None` when an absorbing element was found.
fn normalize(connective: Connective, operands: Vec<Filter>) -> Option<Vec<Filter>> {
    let identity = connective.identity();
    let absorbing = connective.absorbing();
    let mut flat: Vec<Filter> = Vec::with_capacity(operands.len());
    let mut pending = operands;
    pending.reverse();
    while let Some(operand) = pending.pop() {
        match connective.unwrap_nested(operand) {
            Ok(nested) => pending.extend(nested.into_iter().rev()),
            Err(operand) => {
                if operand == absorbing {
                    return None;
                }
                if operand != identity && !flat.contains(&operand) {
                    flat.push(operand);
                }
            }
        }
    }
    Some(flat)
}

fn pairwise_pass(operands: &mut Vec<Filter>, budget: usize, reducer: PairReducer) -> bool {
    for i in 0..operands.len() {
        for j in (i + 1)..operands.len() {
            let (left, right) = (&operands[i], &operands[j]);
            let candidate = reducer(left, right, budget).or_else(|| reducer(right, left, budget));
            let Some(reduced) = candidate else {
                continue;
            };
            if reduced.score() <= left.score() + right.score() {
                operands.remove(j);
                operands[i] = reduced;
                return true;
            }
        }
    }
    false
}

fn and_pair(left: &Filter, right: &Filter, budget: usize) -> Option<Filter> {
    if left.complement().as_ref() == Some(right) {
        return Some(Filter::False);
    }
    if let Filter::Or(operands) = right {
        if operands.contains(left) {
            return Some(left.clone());
        }
    }
    match (left, right) {
        (
            Filter::Compare {
                component,
                op: left_op,
                value: left_value,
            },
            Filter::Compare {
                component: other,
                op: right_op,
                value: right_value,
            },
        ) if component == other => {
            and_compare(component, *left_op, left_value, *right_op, right_value)
        }
        (
            Filter::In { component, values },
            Filter::In {
                component: other,
                values: others,
            },
        ) if component == other => Some(Filter::is_in(
            component.clone(),
            values
                .iter()
                .filter(|value| others.iter().any(|candidate| value.same(candidate)))
                .cloned(),
        )),
        (
            Filter::In { component, values },
            Filter::Compare {
                component: other,
                op,
                value,
            },
        ) if component == other => Some(Filter::is_in(
            component.clone(),
            values
                .iter()
                .filter(|candidate| op.holds(candidate, value))
                .cloned(),
        )),
        (
            Filter::Edge { edge, filter },
            Filter::Edge {
                edge: other,
                filter: other_filter,
            },
        ) if edge == other => Some(Filter::edge(
            edge.clone(),
            conjunction(
                vec![(**filter).clone(), (**other_filter).clone()],
                budget - 1,
            ),
        )),
        _ => None,
    }
}

fn and_compare(
    component: &str,
    left_op: CompareOp,
    left: &Value,
    right_op: CompareOp,
    right: &Value,
) -> Option<Filter> {
    if left_op == CompareOp::Eq {
        return Some(if right_op.holds(left, right) {
            Filter::eq(component, left.clone())
        } else {
            Filter::False
        });
    }
    if left_op == CompareOp::Not {
        return match right_op {
            CompareOp::Not if left.same(right) => Some(Filter::ne(component, left.clone())),
            CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte
                if !right_op.holds(left, right) =>
            {
                Some(Filter::compare(component, right_op, right.clone()))
            }
            _ => None,
        };
    }
    let ordering = left.compare(right)?;
    if left_op.is_lower_bound() && right_op.is_lower_bound() {
        return Some(pick_bound(
            component,
            left_op,
            left,
            right_op,
            right,
            ordering,
            Ordering::Greater,
            true,
        ));
    }
    if left_op.is_upper_bound() && right_op.is_upper_bound() {
        return Some(pick_bound(
            component,
            left_op,
            left,
            right_op,
            right,
            ordering,
            Ordering::Less,
            true,
        ));
    }
    if left_op.is_lower_bound() && right_op.is_upper_bound() {
        return match ordering {
            Ordering::Greater => Some(Filter::False),
            Ordering::Equal if left_op.is_strict() || right_op.is_strict() => Some(Filter::False),
            Ordering::Equal => Some(Filter::eq(component, left.clone())),
            Ordering::Less => None,
        };
    }
    None
}

/// Picks one of two bounds in the same direction: the one lying further
/// towards `winner`, or on a tie the strict one when `prefer_strict`.
#[allow(clippy::too_many_arguments)]
fn pick_bound(
    component: &str,
    left_op: CompareOp,
    left: &Value,
    right_op: CompareOp,
    right: &Value,
    ordering: Ordering,
    winner: Ordering,
    prefer_strict: bool,
) -> Filter {
    let keep_left = if ordering == Ordering::Equal {
        if prefer_strict {
            left_op.is_strict() || !right_op.is_strict()
        } else {
            !left_op.is_strict() || right_op.is_strict()
        }
    } else {
        ordering == winner
    };
    if keep_left {
        Filter::compare(component, left_op, left.clone())
    } else {
        Filter::compare(component, right_op, right.clone())
    }
}

fn or_pair(left: &Filter, right: &Filter, budget: usize) -> Option<Filter> {
    if left.complement().as_ref() == Some(right) {
        return Some(Filter::True);
    }
    if let Filter::And(operands) = right {
        if operands.contains(left) {
            return Some(left.clone());
        }
    }
    match (left, right) {
        (
            Filter::Compare {
                component,
                op: left_op,
                value: left_value,
            },
            Filter::Compare {
                component: other,
                op: right_op,
                value: right_value,
            },
        ) if component == other => {
            or_compare(component, *left_op, left_value, *right_op, right_value)
        }
        (
            Filter::In { component, values },
            Filter::In {
                component: other,
                values: others,
            },
        ) if component == other => Some(Filter::is_in(
            component.clone(),
            values.iter().chain(others.iter()).cloned(),
        )),
        (
            Filter::In { component, values },
            Filter::Compare {
                component: other,
                op,
                value,
            },
        ) if component == other => {
            if *op == CompareOp::Eq {
                let mut merged = values.clone();
                merged.push(value.clone());
                Some(Filter::is_in(component.clone(), merged))
            } else if values.iter().all(|candidate| op.holds(candidate, value)) {
                Some(right.clone())
            } else {
                None
            }
        }
        (
            Filter::Edge { edge, filter },
            Filter::Edge {
                edge: other,
                filter: other_filter,
            },
        ) if edge == other => Some(Filter::edge(
            edge.clone(),
            disjunction(
                vec![(**filter).clone(), (**other_filter).clone()],
                budget - 1,
            ),
        )),
        (
            Filter::ReverseEdge {
                reverse_edge,
                filter,
            },
            Filter::ReverseEdge {
                reverse_edge: other,
                filter: other_filter,
            },
        ) if reverse_edge == other => Some(Filter::reverse_edge(
            reverse_edge.clone(),
            disjunction(
                vec![(**filter).clone(), (**other_filter).clone()],
                budget - 1,
            ),
        )),
        _ => None,
    }
}

fn or_compare(
    component: &str,
    left_op: CompareOp,
    left: &Value,
    right_op: CompareOp,
    right: &Value,
) -> Option<Filter> {
    if left_op == CompareOp::Eq {
        if right_op == CompareOp::Eq {
            return Some(Filter::is_in(component, [left.clone(), right.clone()]));
        }
        return right_op
            .holds(left, right)
            .then(|| Filter::compare(component, right_op, right.clone()));
    }
    if left_op == CompareOp::Not {
        return match right_op {
            CompareOp::Not if left.same(right) => Some(Filter::ne(component, left.clone())),
            CompareOp::Not => Some(Filter::True),
            CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte
                if right_op.holds(left, right) =>
            {
                Some(Filter::True)
            }
            _ => None,
        };
    }
    let ordering = left.compare(right)?;
    if left_op.is_lower_bound() && right_op.is_lower_bound() {
        return Some(pick_bound(
            component,
            left_op,
            left,
            right_op,
            right,
            ordering,
            Ordering::Less,
            false,
        ));
    }
    if left_op.is_upper_bound() && right_op.is_upper_bound() {
        return Some(pick_bound(
            component,
            left_op,
            left,
            right_op,
            right,
            ordering,
            Ordering::Greater,
            false,
        ));
    }
    None
}
