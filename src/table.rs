//! Table Node tree.
//!
//! Each node is one info area (optionally reached through a link) with a
//! root condition and child tables tagged with their parent relation.
//! Transformations return new nodes, or the same `Arc` when nothing changed.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use log::debug;
use serde_json::Value;

use crate::check::{FieldValueMap, FilterCheckResult};
use crate::condition::{
    is_parameter, is_placeholder, ConditionNode, Leaf, PropertyConditions, UNNAMED_PARAMETER,
};
use crate::definition::{Definition, DefinitionPath};
use crate::error::{FilterError, Result};
use crate::replacement::ReplacementProvider;

/// Relation of a sub-table to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParentRelation {
    Having,
    HavingOptional,
    /// Query mode
    With,
    WithOptional,
    /// Exclusion
    Without,
}

impl ParentRelation {
    /// An empty string means `HAVING`
    pub fn parse(s: &str) -> Option<Self> {
        let upper = s.trim().to_ascii_uppercase();
        match upper.as_str() {
            "" | "HAVING" => Some(ParentRelation::Having),
            "HAVINGOPTIONAL" => Some(ParentRelation::HavingOptional),
            "WITH" => Some(ParentRelation::With),
            "WITHOPTIONAL" => Some(ParentRelation::WithOptional),
            other if other.starts_with("WITHOUT") => Some(ParentRelation::Without),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParentRelation::Having => "HAVING",
            ParentRelation::HavingOptional => "HAVINGOPTIONAL",
            ParentRelation::With => "WITH",
            ParentRelation::WithOptional => "WITHOPTIONAL",
            ParentRelation::Without => "WITHOUT",
        }
    }

    pub fn is_mandatory(&self) -> bool {
        matches!(self, ParentRelation::Having | ParentRelation::With)
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, ParentRelation::HavingOptional | ParentRelation::WithOptional)
    }

    /// Exclusion scopes flip the AND/OR algebra when merging.
    pub fn is_exclusion(&self) -> bool {
        *self == ParentRelation::Without
    }
}

impl fmt::Display for ParentRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Table node
#[derive(Debug, Clone, PartialEq)]
pub struct TableNode {
    info_area_id: String,
    link_id: i32,
    parent_relation: ParentRelation,
    condition: Option<Arc<ConditionNode>>,
    sub_tables: Vec<Arc<TableNode>>,
    property_conditions: PropertyConditions,
    alias: Option<String>,
}

/// `infoAreaId` or `infoAreaId#linkId`
pub fn table_key(info_area_id: &str, link_id: i32) -> String {
    if link_id > 0 {
        format!("{}#{}", info_area_id, link_id)
    } else {
        info_area_id.to_string()
    }
}

impl TableNode {
    pub fn new(info_area_id: impl Into<String>, link_id: i32, parent_relation: ParentRelation) -> Self {
        Self {
            info_area_id: info_area_id.into(),
            link_id,
            parent_relation,
            condition: None,
            sub_tables: Vec::new(),
            property_conditions: PropertyConditions::new(),
            alias: None,
        }
    }

    pub fn with_condition(mut self, condition: Arc<ConditionNode>) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Sibling keys must be unique.
    pub fn with_sub_tables(mut self, sub_tables: Vec<Arc<TableNode>>) -> Result<Self> {
        ensure_unique_keys(&sub_tables, &self.key())?;
        self.sub_tables = sub_tables;
        Ok(self)
    }

    /// `[infoAreaId, linkId, parentRelation, conditionDef?, subTableDefs?, alias?]`
    pub fn from_definition(value: &Value, path: &DefinitionPath) -> Result<Arc<TableNode>> {
        let def = Definition::new(value, path)?;
        def.require_arity(1)?;

        let info_area_id = def.string(0)?;
        if info_area_id.trim().is_empty() {
            return Err(def.error("table definition has an empty info area id"));
        }
        let link_id = def.optional_integer(1, -1)?;
        let link_id = i32::try_from(link_id)
            .map_err(|_| def.error(format!("link id {} out of range", link_id)))?;
        let relation_name = def.optional_string(2)?.unwrap_or("");
        let parent_relation = ParentRelation::parse(relation_name)
            .ok_or_else(|| def.error(format!("unknown parent relation '{}'", relation_name)))?;

        let mut table = TableNode::new(info_area_id, link_id, parent_relation);

        match def.get(3) {
            Some(Value::Array(items)) if items.is_empty() => {}
            Some(condition) => {
                let condition =
                    ConditionNode::from_definition(condition, info_area_id, &path.index(3))?;
                match condition.property_name().map(str::to_string) {
                    Some(name) => {
                        table.property_conditions.insert(name, condition);
                    }
                    None => table.condition = Some(condition),
                }
            }
            None => {}
        }

        if let Some(sub_definitions) = def.get(4) {
            let sub_path = path.index(4);
            let sub_def = Definition::new(sub_definitions, &sub_path)?;
            let mut sub_tables = Vec::with_capacity(sub_def.len());
            for (index, sub) in sub_def.items().iter().enumerate() {
                sub_tables.push(TableNode::from_definition(sub, &sub_path.index(index))?);
            }
            ensure_unique_keys(&sub_tables, path.as_str())?;
            table.sub_tables = sub_tables;
        }

        table.alias = def.optional_string(5)?.map(str::to_string);

        debug!(
            "table {} converted with {} sub tables",
            table.key(),
            table.sub_tables.len()
        );
        Ok(Arc::new(table))
    }

    pub fn info_area_id(&self) -> &str {
        &self.info_area_id
    }

    pub fn link_id(&self) -> i32 {
        self.link_id
    }

    pub fn parent_relation(&self) -> ParentRelation {
        self.parent_relation
    }

    pub fn condition(&self) -> Option<&Arc<ConditionNode>> {
        self.condition.as_ref()
    }

    pub fn sub_tables(&self) -> &[Arc<TableNode>] {
        &self.sub_tables
    }

    pub fn property_conditions(&self) -> &PropertyConditions {
        &self.property_conditions
    }

    pub fn property_condition(&self, name: &str) -> Option<&Arc<ConditionNode>> {
        self.property_conditions.get(name)
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Merge-matching key, unique among siblings.
    pub fn key(&self) -> String {
        table_key(&self.info_area_id, self.link_id)
    }

    pub fn node_count(&self) -> usize {
        1 + self.sub_tables.iter().map(|t| t.node_count()).sum::<usize>()
    }

    pub fn table_with_alias(self: &Arc<Self>, alias: &str) -> Option<Arc<TableNode>> {
        if self.alias.as_deref() == Some(alias) {
            return Some(Arc::clone(self));
        }
        self.sub_tables
            .iter()
            .find_map(|sub| sub.table_with_alias(alias))
    }

    /// First table (depth first) for the info area; a negative `link_id`
    /// matches any link.
    pub fn table_with_info_area_id(self: &Arc<Self>, info_area_id: &str, link_id: i32) -> Option<Arc<TableNode>> {
        if self.matches(info_area_id, link_id) {
            return Some(Arc::clone(self));
        }
        self.sub_tables
            .iter()
            .find_map(|sub| sub.table_with_info_area_id(info_area_id, link_id))
    }

    fn matches(&self, info_area_id: &str, link_id: i32) -> bool {
        self.info_area_id == info_area_id
            && (link_id < 0 || link_id == self.link_id || (link_id == 0 && self.link_id <= 0))
    }

    pub(crate) fn with_parent_relation(&self, parent_relation: ParentRelation) -> Arc<TableNode> {
        let mut table = self.clone();
        table.parent_relation = parent_relation;
        Arc::new(table)
    }

    pub(crate) fn with_parts(
        &self,
        condition: Option<Arc<ConditionNode>>,
        sub_tables: Vec<Arc<TableNode>>,
    ) -> Arc<TableNode> {
        Arc::new(TableNode {
            condition,
            sub_tables,
            ..self.clone()
        })
    }

    /// Synthesized node that skips the sibling-key check.
    pub(crate) fn synthesized(
        template: &TableNode,
        condition: Option<Arc<ConditionNode>>,
        sub_tables: Vec<Arc<TableNode>>,
    ) -> Arc<TableNode> {
        Arc::new(TableNode {
            info_area_id: template.info_area_id.clone(),
            link_id: template.link_id,
            parent_relation: template.parent_relation,
            condition,
            sub_tables,
            property_conditions: PropertyConditions::new(),
            alias: None,
        })
    }

    /// Checks a single value against the root condition.
    pub fn check_value(&self, value: &str) -> Option<FilterCheckResult> {
        self.condition.as_ref().and_then(|c| c.check_value(value))
    }

    /// Checks the own condition, then every mandatory sub-table. Optional
    /// and excluded sub-tables cannot be decided from a flat value map.
    pub fn check_with_values(&self, values: &FieldValueMap) -> Option<FilterCheckResult> {
        if let Some(failure) = self
            .condition
            .as_ref()
            .and_then(|c| c.check_with_values(values, &self.info_area_id, self.link_id))
        {
            return Some(failure);
        }

        let mut failures: Vec<FilterCheckResult> = self
            .sub_tables
            .iter()
            .filter(|sub| sub.parent_relation.is_mandatory())
            .filter_map(|sub| sub.check_with_values(values))
            .collect();

        if failures.is_empty() {
            return None;
        }
        // the first failure leads, the others follow as its children
        let rest = failures.split_off(1);
        failures
            .pop()
            .map(|first| first.with_additional_children(rest))
    }

    /// Rewrites the condition and every sub-table. `None` means the table
    /// itself was dropped by a `RemoveInfoAreaIf*` leaf.
    pub fn apply_replacements(self: &Arc<Self>, provider: &dyn ReplacementProvider) -> Option<Arc<TableNode>> {
        let mut changed = false;
        let mut absorbed = PropertyConditions::new();

        let condition = match &self.condition {
            Some(condition) => {
                let rewrite = condition.apply_replacements(provider);
                if rewrite.remove_table {
                    debug!("table {} removed by its condition", self.key());
                    return None;
                }
                if !rewrite.is_unchanged(condition) {
                    changed = true;
                    absorbed = rewrite.properties;
                }
                rewrite.condition
            }
            None => None,
        };

        let mut sub_tables = Vec::with_capacity(self.sub_tables.len());
        for sub in &self.sub_tables {
            match sub.apply_replacements(provider) {
                Some(rewritten) => {
                    changed |= !Arc::ptr_eq(&rewritten, sub);
                    sub_tables.push(rewritten);
                }
                None => changed = true,
            }
        }

        if !changed {
            return Some(Arc::clone(self));
        }

        let mut table = TableNode {
            condition,
            sub_tables,
            ..(**self).clone()
        };
        table.property_conditions.extend(absorbed);
        Some(Arc::new(table))
    }

    /// Drops `HAVING`/`WITH` sub-tables at every level.
    pub fn remove_mandatory_sub_tables(self: &Arc<Self>) -> Arc<TableNode> {
        self.retain_sub_tables(&|sub| !sub.parent_relation.is_mandatory())
    }

    /// Drops every sub-table (at any depth) for the info area and link.
    pub fn remove_sub_tables_with(self: &Arc<Self>, info_area_id: &str, link_id: i32) -> Arc<TableNode> {
        self.retain_sub_tables(&|sub| !sub.matches(info_area_id, link_id))
    }

    /// Removes the condition of this (root) table; sub-tables keep theirs.
    pub fn remove_root_condition(self: &Arc<Self>) -> Arc<TableNode> {
        if self.condition.is_none() {
            return Arc::clone(self);
        }
        self.with_parts(None, self.sub_tables.clone())
    }

    /// Removes every leaf still referring to a `$par...` placeholder.
    pub fn remove_unbound_parameters(self: &Arc<Self>) -> Arc<TableNode> {
        self.map_conditions(&|condition: &Arc<ConditionNode>| {
            condition.without_leaves(&|leaf: &Leaf| leaf.field_values().iter().any(|v| is_parameter(v)))
        })
    }

    /// In conditions that ask for an unnamed parameter (`$parValue`),
    /// removes the leaves with literal values only, leaving the parameter
    /// leaves.
    pub fn remove_fixed_conditions_for_unnamed_parameters(self: &Arc<Self>) -> Arc<TableNode> {
        self.map_conditions(&|condition: &Arc<ConditionNode>| {
            if !condition.contains_value(&|v: &str| v == UNNAMED_PARAMETER) {
                return Some(Arc::clone(condition));
            }
            condition.without_leaves(&|leaf: &Leaf| !leaf.field_values().iter().any(|v| is_placeholder(v)))
        })
    }

    fn retain_sub_tables(self: &Arc<Self>, keep: &dyn Fn(&TableNode) -> bool) -> Arc<TableNode> {
        let mut changed = false;
        let mut sub_tables = Vec::with_capacity(self.sub_tables.len());
        for sub in &self.sub_tables {
            if !keep(sub) {
                changed = true;
                continue;
            }
            let pruned = sub.retain_sub_tables(keep);
            changed |= !Arc::ptr_eq(&pruned, sub);
            sub_tables.push(pruned);
        }

        if !changed {
            return Arc::clone(self);
        }
        self.with_parts(self.condition.clone(), sub_tables)
    }

    /// Applies `rewrite` to the condition of every table in the tree.
    fn map_conditions(
        self: &Arc<Self>,
        rewrite: &dyn Fn(&Arc<ConditionNode>) -> Option<Arc<ConditionNode>>,
    ) -> Arc<TableNode> {
        let mut changed = false;
        let condition = match &self.condition {
            Some(condition) => {
                let rewritten = rewrite(condition);
                changed |= !matches!(&rewritten, Some(c) if Arc::ptr_eq(c, condition));
                rewritten
            }
            None => None,
        };

        let sub_tables: Vec<_> = self
            .sub_tables
            .iter()
            .map(|sub| {
                let mapped = sub.map_conditions(rewrite);
                changed |= !Arc::ptr_eq(&mapped, sub);
                mapped
            })
            .collect();

        if !changed {
            return Arc::clone(self);
        }
        self.with_parts(condition, sub_tables)
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        write!(f, "{:indent$}{} [{}]", "", self.key(), self.parent_relation, indent = depth * 2)?;
        if let Some(alias) = &self.alias {
            write!(f, " as {}", alias)?;
        }
        if let Some(condition) = &self.condition {
            write!(f, " {}", condition)?;
        }
        writeln!(f)?;
        for sub in &self.sub_tables {
            sub.fmt_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for TableNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

fn ensure_unique_keys(sub_tables: &[Arc<TableNode>], path: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for sub in sub_tables {
        let key = sub.key();
        if !seen.insert(key.clone()) {
            return Err(FilterError::malformed(
                path,
                format!("duplicate sub table '{}'", key),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::value_key;
    use crate::replacement::ValueDictionary;
    use serde_json::json;

    fn parse(value: Value) -> Arc<TableNode> {
        TableNode::from_definition(&value, &DefinitionPath::new("test")).unwrap()
    }

    fn sample() -> Arc<TableNode> {
        parse(json!([
            "FI", -1, "",
            ["LEAF", 2, "=", null, ["A"]],
            [
                ["KP", 0, "HAVING", ["LEAF", 3, "=", null, ["$parValue"]]],
                ["KP", 2, "HAVINGOPTIONAL", ["LEAF", 4, "=", null, ["$parCountry"]], [], "contact"],
                ["MA", -1, "WITHOUT", ["AND", ["LEAF", 1, ">", null, ["5"]], ["LEAF", 2, "=", null, ["$parValue"]]]]
            ]
        ]))
    }

    #[test]
    fn test_table_from_definition() {
        let table = sample();
        assert_eq!(table.info_area_id(), "FI");
        assert_eq!(table.link_id(), -1);
        assert_eq!(table.parent_relation(), ParentRelation::Having);
        assert_eq!(table.sub_tables().len(), 3);
        assert_eq!(table.sub_tables()[1].key(), "KP#2");
        assert_eq!(table.sub_tables()[2].parent_relation(), ParentRelation::Without);
        assert_eq!(table.node_count(), 4);

        let contact = table.table_with_alias("contact").unwrap();
        assert_eq!(contact.link_id(), 2);
        let kp = table.table_with_info_area_id("KP", 0).unwrap();
        assert_eq!(kp.parent_relation(), ParentRelation::Having);
    }

    #[test]
    fn test_duplicate_sibling_keys_are_rejected() {
        let result = TableNode::from_definition(
            &json!(["FI", -1, "", [], [["KP", 0, "HAVING"], ["KP", -1, "HAVINGOPTIONAL"]]]),
            &DefinitionPath::new("test"),
        );
        assert!(matches!(result, Err(FilterError::Malformed { .. })));
        assert!(TableNode::from_definition(&json!(["FI", -1, "SOMETIMES"]), &DefinitionPath::new("t")).is_err());
        assert!(TableNode::from_definition(&json!(["", -1]), &DefinitionPath::new("t")).is_err());
    }

    #[test]
    fn test_root_property_leaf_moves_to_table() {
        let table = parse(json!(["FI", -1, "", ["LEAF", -1, "", "Arguments", ["a", "b"]]]));
        assert!(table.condition().is_none());
        assert!(table.property_condition("Arguments").is_some());
    }

    #[test]
    fn test_pruning_passes_keep_identity_when_nothing_changes() {
        let table = parse(json!(["FI", -1, "", ["LEAF", 2, "=", null, ["A"]], [["KP", 0, "HAVINGOPTIONAL"]]]));

        assert!(Arc::ptr_eq(&table.remove_mandatory_sub_tables(), &table));
        assert!(Arc::ptr_eq(&table.remove_sub_tables_with("MA", -1), &table));
        assert!(Arc::ptr_eq(&table.remove_unbound_parameters(), &table));
        assert!(Arc::ptr_eq(&table.remove_fixed_conditions_for_unnamed_parameters(), &table));

        let bare = parse(json!(["FI", -1, ""]));
        assert!(Arc::ptr_eq(&bare.remove_root_condition(), &bare));
    }

    #[test]
    fn test_pruning_passes_rebuild_only_changed_branches() {
        let table = sample();

        let pruned = table.remove_mandatory_sub_tables();
        assert_eq!(pruned.sub_tables().len(), 2);
        assert!(Arc::ptr_eq(&pruned.sub_tables()[0], &table.sub_tables()[1]));
        assert!(Arc::ptr_eq(pruned.condition().unwrap(), table.condition().unwrap()));

        let pruned = table.remove_sub_tables_with("KP", -1);
        assert_eq!(pruned.sub_tables().len(), 1);

        let pruned = table.remove_root_condition();
        assert!(pruned.condition().is_none());
        assert!(Arc::ptr_eq(&pruned.sub_tables()[0], &table.sub_tables()[0]));
    }

    #[test]
    fn test_remove_unbound_parameters() {
        let table = sample();
        let pruned = table.remove_unbound_parameters();

        assert!(pruned.sub_tables()[0].condition().is_none());
        assert!(pruned.sub_tables()[1].condition().is_none());
        // the AND flattens to its literal leaf
        let excluded = pruned.sub_tables()[2].condition().unwrap();
        assert!(excluded.is_leaf());
        assert_eq!(excluded.field_id(), 1);
        assert!(Arc::ptr_eq(pruned.condition().unwrap(), table.condition().unwrap()));
    }

    #[test]
    fn test_remove_fixed_conditions_for_unnamed_parameters() {
        let table = sample();
        let pruned = table.remove_fixed_conditions_for_unnamed_parameters();

        // root and named-parameter tables are untouched
        assert!(Arc::ptr_eq(pruned.condition().unwrap(), table.condition().unwrap()));
        assert!(Arc::ptr_eq(&pruned.sub_tables()[1], &table.sub_tables()[1]));
        let excluded = pruned.sub_tables()[2].condition().unwrap();
        assert_eq!(excluded.field_values(), &["$parValue".to_string()]);
    }

    #[test]
    fn test_apply_replacements_drops_removed_table() {
        let table = parse(json!([
            "FI", -1, "",
            ["LEAF", 2, "=", null, ["$parStatus"]],
            [["KP", 0, "HAVING", ["LEAF", 3, "=", "RemoveInfoAreaIfEmpty", ["$parPerson"]]]]
        ]));
        let provider = ValueDictionary::new().with("parStatus", ["A"]);

        // the guard of the sub-table is still unbound
        let rewritten = table.apply_replacements(&provider).unwrap();
        assert_eq!(rewritten.condition().unwrap().field_values(), &["A".to_string()]);
        assert_eq!(rewritten.sub_tables().len(), 1);
        assert!(Arc::ptr_eq(&rewritten.sub_tables()[0], &table.sub_tables()[0]));

        let blank = provider.clone().with("parPerson", [""]);
        let rewritten = table.apply_replacements(&blank).unwrap();
        assert!(rewritten.sub_tables().is_empty());

        let provider = provider.with("parPerson", ["17"]);
        let rewritten = table.apply_replacements(&provider).unwrap();
        assert_eq!(rewritten.sub_tables().len(), 1);
        assert!(rewritten.sub_tables()[0].condition().is_none());
    }

    #[test]
    fn test_apply_replacements_absorbs_property_conditions() {
        let table = parse(json!(["FI", -1, "", ["LEAF", 2, "=", "Parameter:Company", ["$parCompany"]]]));
        let provider = ValueDictionary::new().with("parCompany", ["4711"]);

        let rewritten = table.apply_replacements(&provider).unwrap();
        assert!(rewritten.condition().is_none());
        assert_eq!(
            rewritten.property_condition("Company").unwrap().field_values(),
            &["4711".to_string()]
        );

        let unchanged = parse(json!(["FI", -1, "", ["LEAF", 2, "=", null, ["A"]]]));
        assert!(Arc::ptr_eq(&unchanged.apply_replacements(&provider).unwrap(), &unchanged));
    }

    #[test]
    fn test_check_with_values_covers_mandatory_sub_tables() {
        let table = parse(json!([
            "FI", -1, "",
            ["LEAF", 2, "=", null, ["A"]],
            [
                ["KP", 3, "HAVING", ["LEAF", 5, "=", null, ["X"]]],
                ["PE", -1, "WITH", ["LEAF", 1, "=", null, ["Y"]]],
                ["MA", -1, "HAVINGOPTIONAL", ["LEAF", 1, "=", null, ["Z"]]]
            ]
        ]));

        let mut values = FieldValueMap::new();
        values.insert(value_key("FI", -1, 2), "A".to_string());
        values.insert(value_key("KP", 3, 5), "X".to_string());
        values.insert(value_key("PE", -1, 1), "Y".to_string());
        assert!(table.check_with_values(&values).is_none());

        values.insert(value_key("KP", 3, 5), "nope".to_string());
        values.insert(value_key("PE", -1, 1), "nope".to_string());
        let result = table.check_with_values(&values).unwrap();
        let kp_leaf = table.sub_tables()[0].condition().unwrap();
        let pe_leaf = table.sub_tables()[1].condition().unwrap();
        assert!(Arc::ptr_eq(result.failing_condition(), kp_leaf));
        assert_eq!(result.child_results().len(), 1);
        assert!(Arc::ptr_eq(result.child_results()[0].failing_condition(), pe_leaf));

        values.insert(value_key("FI", -1, 2), "B".to_string());
        let result = table.check_with_values(&values).unwrap();
        assert!(Arc::ptr_eq(result.failing_condition(), table.condition().unwrap()));
    }
}
