//! Placeholder substitution.
//!
//! A [`ReplacementProvider`] resolves placeholder tokens (`$par...`,
//! `$cur...`) to literal values. [`ConditionNode::apply_replacements`] uses it
//! to rewrite a condition tree: values are substituted, function leaves are
//! collapsed, constants are propagated upward and sub-trees that did not
//! change are returned as the very same `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use serde_json::Value;

use crate::check::compare_numbers;
use crate::condition::{
    is_placeholder, ConditionKind, ConditionNode, FunctionKind, Leaf, PropertyConditions,
    Relation, COMPARE_NUMBER_MARKER,
};
use crate::definition::scalar_to_string;

/// Answer of a provider for one placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum Replacement {
    /// Zero or more literal values.
    Values(Vec<String>),
    /// No value known yet; the placeholder stays in place.
    Unbound,
    /// Drop the value from the leaf.
    Remove,
}

/// Position of a value inside a leaf, for providers that bind by slot
/// rather than by token.
#[derive(Debug, Clone, Copy)]
pub struct ValueSite<'a> {
    pub leaf: &'a Arc<ConditionNode>,
    pub index: usize,
}

pub trait ReplacementProvider {
    fn replacement(&self, placeholder: &str) -> Replacement;

    fn replacement_at(&self, placeholder: &str, _site: ValueSite<'_>) -> Replacement {
        self.replacement(placeholder)
    }
}

/// Token → values table. Keys are stored with their leading `$`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueDictionary {
    entries: HashMap<String, Option<Vec<String>>>,
}

impl ValueDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<I, S>(&mut self, token: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries.insert(
            normalize_token(token),
            Some(values.into_iter().map(Into::into).collect()),
        );
    }

    /// Marks `token` as removed: leaves drop the value entirely.
    pub fn insert_removal(&mut self, token: &str) {
        self.entries.insert(normalize_token(token), None);
    }

    pub fn with<I, S>(mut self, token: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert(token, values);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds a dictionary from a JSON object. Scalars become one value,
    /// arrays several, `null` marks a removal.
    pub fn from_json(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let mut dictionary = Self::new();
        for (token, entry) in object {
            match entry {
                Value::Null => dictionary.insert_removal(token),
                Value::Array(items) => {
                    dictionary.insert(token, items.iter().filter_map(scalar_to_string))
                }
                scalar => dictionary.insert(token, scalar_to_string(scalar)),
            }
        }
        Some(dictionary)
    }
}

impl From<HashMap<String, Vec<String>>> for ValueDictionary {
    fn from(map: HashMap<String, Vec<String>>) -> Self {
        let mut dictionary = Self::new();
        for (token, values) in map {
            dictionary.insert(&token, values);
        }
        dictionary
    }
}

impl ReplacementProvider for ValueDictionary {
    fn replacement(&self, placeholder: &str) -> Replacement {
        match self.entries.get(placeholder) {
            Some(Some(values)) => Replacement::Values(values.clone()),
            Some(None) => Replacement::Remove,
            None => Replacement::Unbound,
        }
    }
}

fn normalize_token(token: &str) -> String {
    if is_placeholder(token) {
        token.to_string()
    } else {
        format!("${}", token)
    }
}

/// Asks each provider in turn; the first one that binds the placeholder wins.
pub struct ChainedReplacements<'a> {
    providers: Vec<&'a dyn ReplacementProvider>,
}

impl<'a> ChainedReplacements<'a> {
    pub fn new(providers: Vec<&'a dyn ReplacementProvider>) -> Self {
        Self { providers }
    }
}

impl ReplacementProvider for ChainedReplacements<'_> {
    fn replacement(&self, placeholder: &str) -> Replacement {
        self.providers
            .iter()
            .map(|provider| provider.replacement(placeholder))
            .find(|r| *r != Replacement::Unbound)
            .unwrap_or(Replacement::Unbound)
    }

    fn replacement_at(&self, placeholder: &str, site: ValueSite<'_>) -> Replacement {
        self.providers
            .iter()
            .map(|provider| provider.replacement_at(placeholder, site))
            .find(|r| *r != Replacement::Unbound)
            .unwrap_or(Replacement::Unbound)
    }
}

/// Result of rewriting one condition.
#[derive(Debug, Clone)]
pub struct ConditionRewrite {
    /// `None` when the condition was removed.
    pub condition: Option<Arc<ConditionNode>>,
    /// The enclosing table must be dropped.
    pub remove_table: bool,
    /// Property conditions bubbling up to the owner.
    pub properties: PropertyConditions,
}

impl ConditionRewrite {
    fn keep(condition: &Arc<ConditionNode>) -> Self {
        Self::replaced(Arc::clone(condition))
    }

    fn replaced(condition: Arc<ConditionNode>) -> Self {
        Self {
            condition: Some(condition),
            remove_table: false,
            properties: PropertyConditions::new(),
        }
    }

    fn removed() -> Self {
        Self {
            condition: None,
            remove_table: false,
            properties: PropertyConditions::new(),
        }
    }

    /// True when the rewrite returned `original` itself and nothing else.
    pub fn is_unchanged(&self, original: &Arc<ConditionNode>) -> bool {
        !self.remove_table
            && self.properties.is_empty()
            && self
                .condition
                .as_ref()
                .map_or(false, |c| Arc::ptr_eq(c, original))
    }
}

struct ResolvedValues {
    values: Vec<String>,
    changed: bool,
    unbound: bool,
}

impl ResolvedValues {
    /// Values that are neither placeholders nor the numeric marker.
    fn concrete(&self) -> Vec<&str> {
        self.values
            .iter()
            .map(String::as_str)
            .filter(|v| !is_placeholder(v))
            .collect()
    }

    fn has_meaningful_values(&self) -> bool {
        self.values.iter().any(|v| v != COMPARE_NUMBER_MARKER)
    }
}

impl ConditionNode {
    pub fn apply_replacements(
        self: &Arc<Self>,
        provider: &dyn ReplacementProvider,
    ) -> ConditionRewrite {
        match &self.kind {
            ConditionKind::Fixed(_) => ConditionRewrite::keep(self),
            ConditionKind::Leaf(leaf) => match leaf.function() {
                FunctionKind::None | FunctionKind::Other(_) => self.rewrite_values(leaf, provider),
                FunctionKind::RemoveInfoAreaIf {
                    negate,
                    zero_is_empty,
                    has_value,
                } => self.remove_info_area_if(leaf, provider, *negate, *zero_is_empty, *has_value),
                FunctionKind::Compare { numeric } => self.compare_values(leaf, provider, *numeric),
                FunctionKind::Parameter { name } => self.parameter_property(leaf, provider, name),
            },
            ConditionKind::Tree {
                relation,
                sub_conditions,
            } => self.rewrite_tree(*relation, sub_conditions, provider),
        }
    }

    fn resolve_values(
        self: &Arc<Self>,
        leaf: &Leaf,
        provider: &dyn ReplacementProvider,
    ) -> ResolvedValues {
        let mut resolved = ResolvedValues {
            values: Vec::with_capacity(leaf.field_values().len()),
            changed: false,
            unbound: false,
        };

        for (index, value) in leaf.field_values().iter().enumerate() {
            if !is_placeholder(value) || value == COMPARE_NUMBER_MARKER {
                resolved.values.push(value.clone());
                continue;
            }

            match provider.replacement_at(value, ValueSite { leaf: self, index }) {
                Replacement::Values(values) => {
                    if values.len() != 1 || values[0] != *value {
                        resolved.changed = true;
                    }
                    resolved.values.extend(values);
                }
                Replacement::Unbound => {
                    resolved.unbound = true;
                    resolved.values.push(value.clone());
                }
                Replacement::Remove => resolved.changed = true,
            }
        }
        resolved
    }

    fn rewrite_values(
        self: &Arc<Self>,
        leaf: &Leaf,
        provider: &dyn ReplacementProvider,
    ) -> ConditionRewrite {
        let resolved = self.resolve_values(leaf, provider);
        if !resolved.changed {
            return ConditionRewrite::keep(self);
        }
        if !resolved.has_meaningful_values() {
            debug!("leaf {} lost all values and is removed", self);
            return ConditionRewrite::removed();
        }
        ConditionRewrite::replaced(self.with_field_values(resolved.values))
    }

    fn remove_info_area_if(
        self: &Arc<Self>,
        leaf: &Leaf,
        provider: &dyn ReplacementProvider,
        negate: bool,
        zero_is_empty: bool,
        has_value: bool,
    ) -> ConditionRewrite {
        let resolved = self.resolve_values(leaf, provider);
        // an unbound value is not an empty value; decide once everything is known
        if resolved.unbound {
            return ConditionRewrite::keep(self);
        }
        let concrete = resolved.concrete();

        let condition_met = if has_value {
            match concrete.split_first() {
                Some((first, allowed)) => allowed.contains(first),
                None => false,
            }
        } else {
            concrete
                .iter()
                .all(|v| v.trim().is_empty() || (zero_is_empty && v.trim() == "0"))
        };

        if condition_met != negate {
            debug!("{:?} drops info area {}", leaf.function_name(), leaf.info_area_id());
            ConditionRewrite {
                condition: None,
                remove_table: true,
                properties: PropertyConditions::new(),
            }
        } else {
            ConditionRewrite::removed()
        }
    }

    fn compare_values(
        self: &Arc<Self>,
        leaf: &Leaf,
        provider: &dyn ReplacementProvider,
        numeric: bool,
    ) -> ConditionRewrite {
        let resolved = self.resolve_values(leaf, provider);
        // wait for the missing values instead of comparing placeholders
        if resolved.unbound {
            return ConditionRewrite::keep(self);
        }

        let values: Vec<&str> = resolved
            .values
            .iter()
            .map(String::as_str)
            .filter(|v| *v != COMPARE_NUMBER_MARKER)
            .collect();
        let equal = values.windows(2).all(|pair| {
            if numeric {
                compare_numbers(pair[0], pair[1]).is_eq()
            } else {
                pair[0] == pair[1]
            }
        });

        debug!("{} collapses to {}", self, equal);
        ConditionRewrite::replaced(ConditionNode::fixed(equal))
    }

    fn parameter_property(
        self: &Arc<Self>,
        leaf: &Leaf,
        provider: &dyn ReplacementProvider,
        name: &str,
    ) -> ConditionRewrite {
        let resolved = self.resolve_values(leaf, provider);
        let mut rewrite = ConditionRewrite::removed();
        if !resolved.has_meaningful_values() {
            return rewrite;
        }

        let property = if resolved.changed {
            self.with_field_values(resolved.values)
        } else {
            Arc::clone(self)
        };
        rewrite.properties.insert(name.to_string(), property);
        rewrite
    }

    fn rewrite_tree(
        self: &Arc<Self>,
        relation: Relation,
        sub_conditions: &[Arc<ConditionNode>],
        provider: &dyn ReplacementProvider,
    ) -> ConditionRewrite {
        let mut children = Vec::with_capacity(sub_conditions.len());
        let mut harvested = PropertyConditions::new();
        let mut changed = false;
        let mut remove_table = false;
        let mut fixed_dropped = false;
        let mut collapsed = None;

        for child in sub_conditions {
            let rewrite = child.apply_replacements(provider);
            remove_table |= rewrite.remove_table;
            if !rewrite.properties.is_empty() {
                changed = true;
                harvested.extend(rewrite.properties);
            }

            match rewrite.condition {
                None => changed = true,
                Some(condition) if Arc::ptr_eq(&condition, child) => children.push(condition),
                Some(condition) => {
                    changed = true;
                    match condition.fixed_value() {
                        // AND with false, OR with true
                        Some(value) if value == (relation == Relation::Or) => {
                            collapsed.get_or_insert(value);
                        }
                        Some(_) => fixed_dropped = true,
                        None => children.push(condition),
                    }
                }
            }
        }

        if !changed && !remove_table {
            return ConditionRewrite::keep(self);
        }

        // the node disappears: its own metadata travels up with the harvest
        let mut bubbling = self.property_conditions().clone();
        bubbling.extend(harvested.iter().map(|(k, v)| (k.clone(), Arc::clone(v))));

        if remove_table {
            return ConditionRewrite {
                condition: None,
                remove_table: true,
                properties: bubbling,
            };
        }
        if let Some(value) = collapsed {
            debug!("{} {} collapses to {}", relation, self, value);
            return ConditionRewrite {
                condition: Some(ConditionNode::fixed(value)),
                remove_table: false,
                properties: bubbling,
            };
        }
        if children.is_empty() {
            let condition = fixed_dropped.then(|| ConditionNode::fixed(relation == Relation::And));
            return ConditionRewrite {
                condition,
                remove_table: false,
                properties: bubbling,
            };
        }

        let condition = self
            .with_sub_conditions(children)
            .map(|node| node.with_properties(&harvested));
        ConditionRewrite {
            condition,
            remove_table: false,
            properties: harvested,
        }
    }
}
