//! Structural merge of two table trees.
//!
//! Two trees over the same data source are folded into one node whose
//! condition is the OR (or AND) of both sides. When the trees differ in
//! more than one place the merge gives up and wraps both originals under a
//! synthesized parent instead.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::condition::{ConditionNode, Relation};
use crate::table::{ParentRelation, TableNode};

impl TableNode {
    /// Appends `other` to this tree. `or_relation` selects OR semantics,
    /// otherwise both trees must hold.
    pub fn merge_append(self: &Arc<Self>, other: &Arc<TableNode>, or_relation: bool) -> Arc<TableNode> {
        if let Some(merged) = deep_merge(self, other, or_relation) {
            return merged;
        }

        let branch = if or_relation {
            ParentRelation::HavingOptional
        } else {
            ParentRelation::Having
        };
        warn!(
            "cannot merge {} with {}, falling back to {} branches",
            self.key(),
            other.key(),
            branch
        );
        TableNode::synthesized(
            self,
            None,
            vec![
                self.with_parent_relation(branch),
                other.with_parent_relation(branch),
            ],
        )
    }
}

fn same_condition(left: Option<&Arc<ConditionNode>>, right: Option<&Arc<ConditionNode>>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(l), Some(r)) => Arc::ptr_eq(l, r) || l == r,
        _ => false,
    }
}

fn same_table(left: &Arc<TableNode>, right: &Arc<TableNode>) -> bool {
    Arc::ptr_eq(left, right) || left == right
}

/// Children by key, `None` when a key occurs twice.
fn children_by_key(table: &TableNode) -> Option<HashMap<String, &Arc<TableNode>>> {
    let mut children = HashMap::with_capacity(table.sub_tables().len());
    for sub in table.sub_tables() {
        if children.insert(sub.key(), sub).is_some() {
            return None;
        }
    }
    Some(children)
}

fn combine_conditions(
    left: Option<&Arc<ConditionNode>>,
    right: Option<&Arc<ConditionNode>>,
    or_relation: bool,
) -> Option<Arc<ConditionNode>> {
    match (left, right, or_relation) {
        (Some(l), Some(r), true) => Some(ConditionNode::combine(Relation::Or, l, r)),
        (Some(l), Some(r), false) => Some(ConditionNode::combine(Relation::And, l, r)),
        // an unconstrained side satisfies any OR
        (_, _, true) => None,
        (Some(only), None, false) | (None, Some(only), false) => Some(Arc::clone(only)),
        (None, None, false) => None,
    }
}

fn deep_merge(left: &Arc<TableNode>, right: &Arc<TableNode>, or_relation: bool) -> Option<Arc<TableNode>> {
    if Arc::ptr_eq(left, right) {
        return Some(Arc::clone(left));
    }
    if left.key() != right.key() || left.parent_relation() != right.parent_relation() {
        return None;
    }
    if left.sub_tables().len() != right.sub_tables().len() {
        return None;
    }
    // node metadata cannot be combined, only shared
    if left.alias() != right.alias() || left.property_conditions() != right.property_conditions() {
        return None;
    }

    let right_children = children_by_key(right)?;
    children_by_key(left)?;

    let mut differing = Vec::new();
    for (index, sub) in left.sub_tables().iter().enumerate() {
        let counterpart = right_children.get(&sub.key())?;
        if !same_table(sub, counterpart) {
            differing.push((index, *counterpart));
        }
    }

    let conditions_equal = same_condition(left.condition(), right.condition());
    match (conditions_equal, differing.as_slice()) {
        (true, []) => Some(Arc::clone(left)),
        (false, []) => {
            debug!("merging conditions of {}", left.key());
            let condition = combine_conditions(left.condition(), right.condition(), or_relation);
            Some(left.with_parts(condition, left.sub_tables().to_vec()))
        }
        (true, [(index, counterpart)]) => {
            let sub = &left.sub_tables()[*index];
            // exclusion flips the algebra
            let polarity = if sub.parent_relation().is_exclusion() {
                !or_relation
            } else {
                or_relation
            };
            let merged = deep_merge(sub, counterpart, polarity)?;
            let mut sub_tables = left.sub_tables().to_vec();
            sub_tables[*index] = merged;
            Some(left.with_parts(left.condition().cloned(), sub_tables))
        }
        _ => None,
    }
}
