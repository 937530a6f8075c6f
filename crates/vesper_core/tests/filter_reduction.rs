//! Property tests: reduction never changes what a filter decides.

use proptest::prelude::*;
use vesper_core::{CompareOp, Filter, Record, Value, record};

fn small_value() -> impl Strategy<Value = Value> {
    prop_oneof![4 => (0i64..4).prop_map(Value::Int), 1 => Just(Value::Null)]
}

fn compare_op() -> impl Strategy<Value = CompareOp> {
    prop_oneof![
        Just(CompareOp::Eq),
        Just(CompareOp::Not),
        Just(CompareOp::Gt),
        Just(CompareOp::Gte),
        Just(CompareOp::Lt),
        Just(CompareOp::Lte),
    ]
}

fn leaf() -> impl Strategy<Value = Filter> {
    let component = prop_oneof![Just("a"), Just("b")];
    prop_oneof![
        (component.clone(), compare_op(), small_value()).prop_map(|(component, op, value)| {
            Filter::Compare {
                component: component.to_string(),
                op,
                value,
            }
        }),
        (component, prop::collection::vec(small_value(), 0..4)).prop_map(|(component, values)| {
            Filter::In {
                component: component.to_string(),
                values,
            }
        }),
        (compare_op(), small_value()).prop_map(|(op, value)| Filter::Edge {
            edge: "e".into(),
            filter: Box::new(Filter::Compare {
                component: "x".into(),
                op,
                value,
            }),
        }),
        Just(Filter::True),
        Just(Filter::False),
    ]
}

fn filter() -> impl Strategy<Value = Filter> {
    leaf().prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Filter::And),
            prop::collection::vec(inner.clone(), 0..4).prop_map(Filter::Or),
            inner.prop_map(|operand| Filter::Not(Box::new(operand))),
        ]
    })
}

fn full_record() -> impl Strategy<Value = Record> {
    (
        small_value(),
        small_value(),
        prop::option::of(small_value()),
    )
        .prop_map(|(a, b, head)| {
            let edge = match head {
                Some(x) => Value::Record(record([("x", x)])),
                None => Value::Null,
            };
            record([("a", a), ("b", b), ("e", edge)])
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Simplifying a filter keeps its verdict on every complete record.
    #[test]
    fn simplify_preserves_execute(
        raw in filter(),
        values in prop::collection::vec(full_record(), 1..8),
    ) {
        let simplified = raw.simplify();
        for value in &values {
            prop_assert_eq!(
                raw.execute(value),
                simplified.execute(value),
                "raw {:?} simplified {:?} on {:?}",
                raw,
                simplified,
                value
            );
        }
    }

    /// Reduction never grows the structural score.
    #[test]
    fn simplify_never_grows_score(raw in filter()) {
        prop_assert!(raw.simplify().score() <= raw.score());
    }

    /// Conjunctions and disjunctions built through the reducing constructors
    /// agree with their raw counterparts.
    #[test]
    fn constructors_agree_with_raw_connectives(
        operands in prop::collection::vec(leaf(), 0..6),
        values in prop::collection::vec(full_record(), 1..8),
    ) {
        let raw_and = Filter::And(operands.clone());
        let raw_or = Filter::Or(operands.clone());
        let and = Filter::and(operands.clone());
        let or = Filter::or(operands);
        for value in &values {
            prop_assert_eq!(raw_and.execute(value), and.execute(value));
            prop_assert_eq!(raw_or.execute(value), or.execute(value));
        }
    }
}

#[test]
fn simplify_is_idempotent_on_reduced_forms() {
    let filter = Filter::Or(vec![
        Filter::And(vec![Filter::eq("a", 1), Filter::gt("b", 0)]),
        Filter::eq("a", 1),
        Filter::Not(Box::new(Filter::Not(Box::new(Filter::eq("b", 2))))),
    ]);
    let once = filter.simplify();
    assert_eq!(once, Filter::Or(vec![Filter::eq("a", 1), Filter::eq("b", 2)]));
    assert_eq!(once.simplify(), once);
}
