//! Evaluation of condition trees against concrete values.
//!
//! A check returns `None` when the value satisfies the condition and a
//! [`FilterCheckResult`] naming the violated node otherwise. AND nodes stop at
//! the first violation; OR nodes stop at the first branch that holds and only
//! fail once every branch failed.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use log::trace;

use crate::condition::{
    is_placeholder, ConditionKind, ConditionNode, Leaf, Relation, COMPARE_NUMBER_MARKER,
};
use crate::metadata::{normalize_boolean, FieldMetadataProvider, FieldType};

/// Field values keyed by `infoAreaId[:linkId].fieldId`.
pub type FieldValueMap = HashMap<String, String>;

/// Key of a field inside a [`FieldValueMap`].
pub fn value_key(info_area_id: &str, link_id: i32, field_id: i32) -> String {
    if link_id > 0 {
        format!("{}:{}.{}", info_area_id, link_id, field_id)
    } else {
        format!("{}.{}", info_area_id, field_id)
    }
}

/// Outcome of a failed check.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCheckResult {
    failing_condition: Arc<ConditionNode>,
    error_key: Option<String>,
    child_results: Vec<FilterCheckResult>,
}

impl FilterCheckResult {
    pub fn new(failing_condition: Arc<ConditionNode>, error_key: Option<&str>) -> Self {
        Self {
            failing_condition,
            error_key: error_key.map(str::to_string),
            child_results: Vec::new(),
        }
    }

    pub fn with_children(
        failing_condition: Arc<ConditionNode>,
        error_key: Option<&str>,
        child_results: Vec<FilterCheckResult>,
    ) -> Self {
        Self {
            failing_condition,
            error_key: error_key.map(str::to_string),
            child_results,
        }
    }

    /// Appends further simultaneous failures after the existing children.
    pub(crate) fn with_additional_children(mut self, more: Vec<FilterCheckResult>) -> Self {
        self.child_results.extend(more);
        self
    }

    pub fn failing_condition(&self) -> &Arc<ConditionNode> {
        &self.failing_condition
    }

    pub fn error_key(&self) -> Option<&str> {
        self.error_key.as_deref()
    }

    pub fn child_results(&self) -> &[FilterCheckResult] {
        &self.child_results
    }
}

impl ConditionNode {
    /// Checks a single scalar value against every leaf of this condition.
    pub fn check_value(self: &Arc<Self>, value: &str) -> Option<FilterCheckResult> {
        self.check_scalar(value, None, None)
    }

    /// Like [`check_value`](Self::check_value), but lets the field type of
    /// each leaf decide between numeric and string comparison.
    pub fn check_value_for_field(
        self: &Arc<Self>,
        value: &str,
        metadata: &dyn FieldMetadataProvider,
    ) -> Option<FilterCheckResult> {
        self.check_scalar(value, None, Some(metadata))
    }

    /// Checks a whole field/value set. Leaves look up their value under
    /// `infoAreaId[:linkId].fieldId`; missing fields count as empty.
    pub fn check_with_values(
        self: &Arc<Self>,
        values: &FieldValueMap,
        info_area_id: &str,
        link_id: i32,
    ) -> Option<FilterCheckResult> {
        self.check_map(values, info_area_id, link_id, None)
    }

    fn check_scalar(
        self: &Arc<Self>,
        value: &str,
        inherited_error: Option<&str>,
        metadata: Option<&dyn FieldMetadataProvider>,
    ) -> Option<FilterCheckResult> {
        let error_key = self.error_key().or(inherited_error);

        match &self.kind {
            ConditionKind::Fixed(true) => None,
            ConditionKind::Fixed(false) => Some(FilterCheckResult::new(Arc::clone(self), error_key)),
            ConditionKind::Leaf(leaf) => {
                let field_type = metadata
                    .and_then(|m| m.field_metadata(leaf.info_area_id(), leaf.field_id()))
                    .map(|m| m.field_type);
                if leaf_accepts(leaf, value, field_type) {
                    None
                } else {
                    Some(FilterCheckResult::new(Arc::clone(self), error_key))
                }
            }
            ConditionKind::Tree {
                relation: Relation::Or,
                sub_conditions,
            } => {
                let mut first_failure = None;
                for child in sub_conditions {
                    match child.check_scalar(value, error_key, metadata) {
                        None => return None,
                        Some(failure) => {
                            first_failure.get_or_insert(failure);
                        }
                    }
                }
                first_failure
            }
            ConditionKind::Tree { sub_conditions, .. } => sub_conditions
                .iter()
                .find_map(|child| child.check_scalar(value, error_key, metadata)),
        }
    }

    fn check_map(
        self: &Arc<Self>,
        values: &FieldValueMap,
        info_area_id: &str,
        link_id: i32,
        inherited_error: Option<&str>,
    ) -> Option<FilterCheckResult> {
        let error_key = self.error_key().or(inherited_error);

        match &self.kind {
            ConditionKind::Fixed(true) => None,
            ConditionKind::Fixed(false) => Some(FilterCheckResult::new(Arc::clone(self), error_key)),
            ConditionKind::Leaf(leaf) => {
                let key = value_key(info_area_id, link_id, leaf.field_id());
                let value = values.get(&key).map(String::as_str).unwrap_or("");
                if leaf_accepts(leaf, value, None) {
                    None
                } else {
                    trace!("field {} with value '{}' violates {}", key, value, self);
                    Some(FilterCheckResult::new(Arc::clone(self), error_key))
                }
            }
            ConditionKind::Tree {
                relation: Relation::Or,
                sub_conditions,
            } => {
                let mut failures = Vec::new();
                for child in sub_conditions {
                    match child.check_map(values, info_area_id, link_id, error_key) {
                        None => return None,
                        Some(failure) => failures.push(failure),
                    }
                }
                if failures.len() == 1 {
                    failures.pop()
                } else {
                    Some(FilterCheckResult::with_children(
                        Arc::clone(self),
                        error_key,
                        failures,
                    ))
                }
            }
            ConditionKind::Tree { sub_conditions, .. } => sub_conditions
                .iter()
                .find_map(|child| child.check_map(values, info_area_id, link_id, error_key)),
        }
    }
}

/// True when one listed value satisfies the operator. Placeholders are
/// skipped; `$compareNumber` switches the rest of the list to numbers.
fn leaf_accepts(leaf: &Leaf, value: &str, field_type: Option<FieldType>) -> bool {
    let mut numeric = matches!(field_type, Some(FieldType::Numeric | FieldType::Catalog));
    let boolean = field_type == Some(FieldType::Boolean);
    let value = if boolean { normalize_boolean(value) } else { value };

    for candidate in leaf.field_values() {
        if candidate == COMPARE_NUMBER_MARKER {
            numeric = true;
            continue;
        }
        if is_placeholder(candidate) {
            continue;
        }

        let candidate = if boolean {
            normalize_boolean(candidate)
        } else {
            candidate.as_str()
        };
        let ordering = if numeric {
            compare_numbers(value, candidate)
        } else {
            value.cmp(candidate)
        };
        if leaf.compare_operator().holds(ordering) {
            return true;
        }
    }
    false
}

/// Unparsable numbers count as zero.
pub(crate) fn parse_number(value: &str) -> f64 {
    value.trim().parse().unwrap_or(0.0)
}

pub(crate) fn compare_numbers(left: &str, right: &str) -> Ordering {
    parse_number(left)
        .partial_cmp(&parse_number(right))
        .unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::CompareOperator;
    use crate::definition::DefinitionPath;
    use crate::metadata::FieldMetadata;
    use serde_json::{json, Value};

    fn parse(value: Value) -> Arc<ConditionNode> {
        ConditionNode::from_definition(&value, "KD", &DefinitionPath::new("test")).unwrap()
    }

    #[test]
    fn test_and_reports_first_failing_child() {
        let node = parse(json!([
            "AND",
            ["LEAF", 2, "=", null, ["A"]],
            ["LEAF", 3, "=", null, ["B"]]
        ]));

        let result = node.check_value("B").unwrap();
        assert!(Arc::ptr_eq(result.failing_condition(), &node.sub_conditions()[0]));
        assert!(result.child_results().is_empty());
    }

    #[test]
    fn test_or_succeeds_when_one_branch_holds() {
        let node = parse(json!([
            "OR",
            ["LEAF", 2, "=", null, ["A"]],
            ["LEAF", 3, "=", null, ["B"]]
        ]));

        assert!(node.check_value("B").is_none());

        let result = node.check_value("C").unwrap();
        assert!(Arc::ptr_eq(result.failing_condition(), &node.sub_conditions()[0]));
    }

    #[test]
    fn test_error_key_resolves_through_ancestors() {
        let node = parse(json!([
            "AND",
            ["LEAF", -1, "", "Error", ["msgWrongStatus"]],
            ["OR", ["LEAF", 2, "=", null, ["A"]], ["LEAF", 2, "=", null, ["B"]]]
        ]));

        let result = node.check_value("C").unwrap();
        assert_eq!(result.error_key(), Some("msgWrongStatus"));
        assert_eq!(result.failing_condition().field_values(), &["A".to_string()]);
    }

    #[test]
    fn test_leaf_comparisons() {
        let leaf = ConditionNode::leaf("KD", 4, CompareOperator::Greater, vec!["5".into()], None)
            .unwrap();
        // string mode: "10" < "5"
        assert!(leaf.check_value("10").is_some());
        assert!(leaf.check_value("6").is_none());

        let numeric = ConditionNode::leaf(
            "KD",
            4,
            CompareOperator::Greater,
            vec![COMPARE_NUMBER_MARKER.into(), "5".into()],
            None,
        )
        .unwrap();
        assert!(numeric.check_value("10").is_none());
        assert!(numeric.check_value("4.5").is_some());
    }

    #[test]
    fn test_placeholders_are_skipped() {
        let leaf = parse(json!(["LEAF", 2, "=", null, ["$parStatus", "A"]]));
        assert!(leaf.check_value("A").is_none());
        assert!(leaf.check_value("$parStatus").is_some());

        let unbound = parse(json!(["LEAF", 2, "=", null, ["$parStatus"]]));
        assert!(unbound.check_value("").is_some());
    }

    #[test]
    fn test_fixed_conditions() {
        assert!(ConditionNode::true_condition().check_value("x").is_none());
        let result = ConditionNode::false_condition().check_value("x").unwrap();
        assert_eq!(result.failing_condition().fixed_value(), Some(false));
    }

    #[test]
    fn test_check_with_values_aggregates_or_failures() {
        let node = parse(json!([
            "OR",
            ["LEAF", 2, "=", null, ["A"]],
            ["LEAF", 3, ">=", null, ["$compareNumber", "10"]]
        ]));

        let mut values = FieldValueMap::new();
        values.insert(value_key("KD", 0, 2), "B".to_string());
        values.insert(value_key("KD", 0, 3), "9".to_string());

        let result = node.check_with_values(&values, "KD", 0).unwrap();
        assert!(Arc::ptr_eq(result.failing_condition(), &node));
        assert_eq!(result.child_results().len(), 2);

        values.insert(value_key("KD", 0, 3), "12".to_string());
        assert!(node.check_with_values(&values, "KD", 0).is_none());
    }

    #[test]
    fn test_check_with_values_uses_link_in_key() {
        let node = parse(json!(["LEAF", 2, "=", null, ["A"]]));
        let mut values = FieldValueMap::new();
        values.insert("KD:2.2".to_string(), "A".to_string());

        assert_eq!(value_key("KD", 2, 2), "KD:2.2");
        assert!(node.check_with_values(&values, "KD", 2).is_none());
        assert!(node.check_with_values(&values, "KD", -1).is_some());
    }

    #[test]
    fn test_check_value_for_field_uses_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert(("KD".to_string(), 4), FieldMetadata::new(FieldType::Numeric));
        metadata.insert(("KD".to_string(), 5), FieldMetadata::new(FieldType::Boolean));

        let amount = parse(json!(["LEAF", 4, ">", null, ["5"]]));
        assert!(amount.check_value_for_field("10", &metadata).is_none());

        let flag = parse(json!(["LEAF", 5, "=", null, ["true"]]));
        assert!(flag.check_value_for_field("1", &metadata).is_none());
        assert!(flag.check_value_for_field("false", &metadata).is_some());
    }
}
