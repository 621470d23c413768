//! Pure traversal over a definition tree and its persisted step map.
//!
//! Given the tree, the per-instance step statuses and the blackboard, the
//! interpreter deterministically names the next leaf to run. Loop iterations
//! are scoped through effective ids (`<loop_id>[<index>].<node_id>`), which
//! keeps the definition tree immutable while the step table carries all
//! per-iteration durability.

use std::collections::HashMap;

use serde_json::Value;
use tracing::warn;

use crate::blackboard::{self, as_object_mut_forced};
use crate::definition::{ForEachProps, Node, PropValue};
use crate::store::StepStatus;

/// The next leaf to execute, as chosen by [`find_next`].
#[derive(Clone, Debug)]
pub struct NextStep<'a> {
    pub node: &'a Node,
    pub effective_id: String,
    /// The blackboard the executor sees: the instance blackboard plus any
    /// enclosing loop bindings (`__item`, `__index`, and author-named vars).
    pub scoped_blackboard: Value,
}

fn join_id(prefix: &str, id: &str) -> String {
    if prefix.is_empty() {
        id.to_string()
    } else {
        format!("{prefix}.{id}")
    }
}

fn resolve_items(props: &ForEachProps, blackboard: &Value) -> Option<Vec<Value>> {
    let resolved = match &props.items {
        PropValue::Reference(reference) => blackboard::resolve(blackboard, &reference.path)?.clone(),
        PropValue::Literal(Value::String(path)) => blackboard::resolve(blackboard, path)?.clone(),
        PropValue::Literal(other) => blackboard::resolve_value(other, blackboard),
    };
    match resolved {
        Value::Array(items) => Some(items),
        _ => None,
    }
}

fn scope_blackboard(blackboard: &Value, props: &ForEachProps, item: &Value, index: usize) -> Value {
    let mut scoped = blackboard.clone();
    let map = as_object_mut_forced(&mut scoped);
    map.insert("__item".to_string(), item.clone());
    map.insert("__index".to_string(), Value::from(index as u64));
    if let Some(item_var) = &props.item_var {
        map.insert(item_var.clone(), item.clone());
    }
    if let Some(index_var) = &props.index_var {
        map.insert(index_var.clone(), Value::from(index as u64));
    }
    scoped
}

/// Find the first leaf that has not yet succeeded, in traversal order.
///
/// Purely functional: neither persists nor resolves leaf props; the scoped
/// blackboard it hands back is what the executor resolves against.
pub fn find_next<'a>(
    node: &'a Node,
    steps: &HashMap<String, StepStatus>,
    blackboard: &Value,
    id_prefix: &str,
) -> Option<NextStep<'a>> {
    match node {
        Node::Sequence { children, .. } => children
            .iter()
            .find_map(|child| find_next(child, steps, blackboard, id_prefix)),
        Node::ForEach {
            id,
            props,
            children,
            ..
        } => {
            let effective_id = join_id(id_prefix, id);
            let Some(items) = resolve_items(props, blackboard) else {
                warn!(
                    node_id = %effective_id,
                    "loop items did not resolve to an array; treating loop as complete"
                );
                return None;
            };
            for (index, item) in items.iter().enumerate() {
                let iteration_prefix = format!("{effective_id}[{index}]");
                let scoped = scope_blackboard(blackboard, props, item, index);
                if children
                    .iter()
                    .all(|child| is_complete(child, steps, &scoped, &iteration_prefix))
                {
                    continue;
                }
                if let Some(next) = children
                    .iter()
                    .find_map(|child| find_next(child, steps, &scoped, &iteration_prefix))
                {
                    return Some(next);
                }
            }
            None
        }
        leaf => {
            let effective_id = join_id(id_prefix, leaf.id());
            match steps.get(&effective_id) {
                Some(StepStatus::Succeeded) => None,
                _ => Some(NextStep {
                    node: leaf,
                    effective_id,
                    scoped_blackboard: blackboard.clone(),
                }),
            }
        }
    }
}

/// Whether every leaf reachable under `node` has succeeded.
///
/// A loop over a zero-length array (or over anything that is not an array)
/// is complete: it contributed no steps.
pub fn is_complete(
    node: &Node,
    steps: &HashMap<String, StepStatus>,
    blackboard: &Value,
    id_prefix: &str,
) -> bool {
    match node {
        Node::Sequence { children, .. } => children
            .iter()
            .all(|child| is_complete(child, steps, blackboard, id_prefix)),
        Node::ForEach {
            id,
            props,
            children,
            ..
        } => {
            let effective_id = join_id(id_prefix, id);
            let Some(items) = resolve_items(props, blackboard) else {
                return true;
            };
            items.iter().enumerate().all(|(index, item)| {
                let iteration_prefix = format!("{effective_id}[{index}]");
                let scoped = scope_blackboard(blackboard, props, item, index);
                children
                    .iter()
                    .all(|child| is_complete(child, steps, &scoped, &iteration_prefix))
            })
        }
        leaf => {
            let effective_id = join_id(id_prefix, leaf.id());
            steps.get(&effective_id) == Some(&StepStatus::Succeeded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(tree: Value) -> Node {
        serde_json::from_value(tree).expect("parse definition")
    }

    fn sequence_of_sleeps() -> Node {
        parse(json!({
            "type": "Sequence",
            "id": "root",
            "props": {},
            "children": [
                { "type": "Sleep", "id": "a", "props": { "seconds": 0.0 } },
                { "type": "Sleep", "id": "b", "props": { "seconds": 0.0 } },
                { "type": "Sleep", "id": "c", "props": { "seconds": 0.0 } }
            ]
        }))
    }

    fn loop_tree() -> Node {
        parse(json!({
            "type": "Sequence",
            "id": "root",
            "props": {},
            "children": [
                {
                    "type": "ForEach",
                    "id": "loop",
                    "props": {
                        "items": { "__ref": true, "path": "$.slides" },
                        "itemVar": "slide"
                    },
                    "children": [
                        {
                            "type": "SendEmail",
                            "id": "mail",
                            "props": {
                                "to": "u@x",
                                "subject": { "__ref": true, "path": "$.__item.title" },
                                "body": { "__ref": true, "path": "$.slide.type" }
                            }
                        }
                    ]
                }
            ]
        }))
    }

    #[test]
    fn sequence_yields_children_in_order() {
        let tree = sequence_of_sleeps();
        let mut steps = HashMap::new();
        let blackboard = json!({});

        let next = find_next(&tree, &steps, &blackboard, "").expect("first leaf");
        assert_eq!(next.effective_id, "a");

        steps.insert("a".to_string(), StepStatus::Succeeded);
        let next = find_next(&tree, &steps, &blackboard, "").expect("second leaf");
        assert_eq!(next.effective_id, "b");

        steps.insert("b".to_string(), StepStatus::Succeeded);
        steps.insert("c".to_string(), StepStatus::Succeeded);
        assert!(find_next(&tree, &steps, &blackboard, "").is_none());
        assert!(is_complete(&tree, &steps, &blackboard, ""));
    }

    #[test]
    fn pending_and_failed_steps_are_rediscovered() {
        let tree = sequence_of_sleeps();
        let mut steps = HashMap::new();
        steps.insert("a".to_string(), StepStatus::Pending);
        let blackboard = json!({});
        let next = find_next(&tree, &steps, &blackboard, "").expect("pending leaf");
        assert_eq!(next.effective_id, "a");

        steps.insert("a".to_string(), StepStatus::Failed);
        let next = find_next(&tree, &steps, &blackboard, "").expect("failed leaf");
        assert_eq!(next.effective_id, "a");
    }

    #[test]
    fn find_next_is_idempotent_without_step_mutations() {
        let tree = loop_tree();
        let steps = HashMap::new();
        let blackboard = json!({ "slides": [ { "title": "one" }, { "title": "two" } ] });
        let first = find_next(&tree, &steps, &blackboard, "").expect("leaf");
        let second = find_next(&tree, &steps, &blackboard, "").expect("leaf");
        assert_eq!(first.effective_id, second.effective_id);
    }

    #[test]
    fn loop_iterations_get_suffixed_effective_ids() {
        let tree = loop_tree();
        let mut steps = HashMap::new();
        let blackboard = json!({
            "slides": [ { "title": "one", "type": "a" }, { "title": "two", "type": "b" } ]
        });

        let next = find_next(&tree, &steps, &blackboard, "").expect("first iteration");
        assert_eq!(next.effective_id, "loop[0].mail");
        assert_eq!(
            next.scoped_blackboard.get("__item"),
            Some(&json!({ "title": "one", "type": "a" }))
        );
        assert_eq!(next.scoped_blackboard.get("__index"), Some(&json!(0)));
        assert_eq!(
            next.scoped_blackboard.get("slide"),
            Some(&json!({ "title": "one", "type": "a" }))
        );

        steps.insert("loop[0].mail".to_string(), StepStatus::Succeeded);
        let next = find_next(&tree, &steps, &blackboard, "").expect("second iteration");
        assert_eq!(next.effective_id, "loop[1].mail");
        assert_eq!(next.scoped_blackboard.get("__index"), Some(&json!(1)));

        steps.insert("loop[1].mail".to_string(), StepStatus::Succeeded);
        assert!(find_next(&tree, &steps, &blackboard, "").is_none());
        assert!(is_complete(&tree, &steps, &blackboard, ""));
    }

    #[test]
    fn nested_loops_nest_effective_ids() {
        let tree = parse(json!({
            "type": "ForEach",
            "id": "outer",
            "props": { "items": "$.rows" },
            "children": [
                {
                    "type": "ForEach",
                    "id": "inner",
                    "props": { "items": { "__ref": true, "path": "$.__item.cells" } },
                    "children": [
                        {
                            "type": "KVSet",
                            "id": "save",
                            "props": {
                                "store": "s",
                                "key": { "__ref": true, "path": "$.__item" },
                                "value": 1
                            }
                        }
                    ]
                }
            ]
        }));
        let mut steps = HashMap::new();
        let blackboard = json!({ "rows": [ { "cells": ["x", "y"] }, { "cells": ["z"] } ] });

        let next = find_next(&tree, &steps, &blackboard, "").expect("leaf");
        assert_eq!(next.effective_id, "outer[0].inner[0].save");
        // Inner loop rebinds __item to the cell.
        assert_eq!(next.scoped_blackboard.get("__item"), Some(&json!("x")));

        steps.insert("outer[0].inner[0].save".to_string(), StepStatus::Succeeded);
        let next = find_next(&tree, &steps, &blackboard, "").expect("leaf");
        assert_eq!(next.effective_id, "outer[0].inner[1].save");

        steps.insert("outer[0].inner[1].save".to_string(), StepStatus::Succeeded);
        let next = find_next(&tree, &steps, &blackboard, "").expect("leaf");
        assert_eq!(next.effective_id, "outer[1].inner[0].save");
    }

    #[test]
    fn empty_loop_is_complete_with_zero_steps() {
        let tree = loop_tree();
        let steps = HashMap::new();
        let blackboard = json!({ "slides": [] });
        assert!(find_next(&tree, &steps, &blackboard, "").is_none());
        assert!(is_complete(&tree, &steps, &blackboard, ""));
    }

    #[test]
    fn non_array_items_complete_the_loop() {
        let tree = loop_tree();
        let steps = HashMap::new();
        for blackboard in [json!({}), json!({ "slides": "oops" }), json!({ "slides": 3 })] {
            assert!(find_next(&tree, &steps, &blackboard, "").is_none());
            assert!(is_complete(&tree, &steps, &blackboard, ""));
        }
    }
}
