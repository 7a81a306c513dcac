//! Parameter Index.
//!
//! Collects every `$par...` reference of a table tree, grouped by name. The tree
//! stays immutable; values set by the caller live in the index's own binding table.

use std::sync::Arc;

use indexmap::IndexMap;
use log::debug;

use crate::condition::{is_parameter, ConditionNode, PLACEHOLDER_PREFIX, UNNAMED_PARAMETER};
use crate::error::{FilterError, Result};
use crate::replacement::{Replacement, ReplacementProvider, ValueSite};
use crate::table::TableNode;

/// One placeholder reference: owning table, leaf and position in its value list
#[derive(Debug, Clone)]
pub struct FilterParameter {
    name: String,
    table: Arc<TableNode>,
    condition: Arc<ConditionNode>,
    value_index: usize,
}

impl FilterParameter {
    fn new(token: &str, table: Arc<TableNode>, condition: Arc<ConditionNode>, value_index: usize) -> Self {
        Self {
            name: token
                .strip_prefix(PLACEHOLDER_PREFIX)
                .unwrap_or(token)
                .to_string(),
            table,
            condition,
            value_index,
        }
    }

    /// Token without the leading `$`, e.g. `parStatus`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> String {
        format!("{}{}", PLACEHOLDER_PREFIX, self.name)
    }

    pub fn table(&self) -> &Arc<TableNode> {
        &self.table
    }

    pub fn condition(&self) -> &Arc<ConditionNode> {
        &self.condition
    }

    pub fn value_index(&self) -> usize {
        self.value_index
    }

    pub fn is_unnamed(&self) -> bool {
        self.token() == UNNAMED_PARAMETER
    }

    fn occupies(&self, site: &ValueSite<'_>) -> bool {
        Arc::ptr_eq(&self.condition, site.leaf) && self.value_index == site.index
    }
}

/// Values supplied by the caller
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterBinding {
    pub values: Vec<String>,
    pub value_was_set: bool,
}

/// Placeholder references of one table tree, grouped by name in first-seen
/// order, together with their bindings.
#[derive(Debug, Clone, Default)]
pub struct FilterParameters {
    parameters: Vec<FilterParameter>,
    bindings: Vec<ParameterBinding>,
    named: IndexMap<String, Vec<usize>>,
    unnamed: Vec<usize>,
}

impl FilterParameters {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, parameter: FilterParameter) {
        let position = self.parameters.len();
        if parameter.is_unnamed() {
            self.unnamed.push(position);
        } else {
            self.named
                .entry(parameter.name.clone())
                .or_default()
                .push(position);
        }
        self.parameters.push(parameter);
        self.bindings.push(ParameterBinding::default());
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Names of the named groups, first seen first.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.named.contains_key(normalize_name(name))
    }

    /// Every reference of the named group.
    pub fn named(&self, name: &str) -> Vec<&FilterParameter> {
        self.named
            .get(normalize_name(name))
            .map(|positions| positions.iter().map(|&p| &self.parameters[p]).collect())
            .unwrap_or_default()
    }

    /// Unnamed (`$parValue`) references in tree order.
    pub fn unnamed(&self) -> Vec<&FilterParameter> {
        self.unnamed.iter().map(|&p| &self.parameters[p]).collect()
    }

    /// Binds every reference of the named group.
    pub fn set_values<I, S>(&mut self, name: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let positions = self
            .named
            .get(normalize_name(name))
            .ok_or_else(|| FilterError::UnknownParameter(name.to_string()))?;
        let values: Vec<String> = values.into_iter().map(Into::into).collect();

        debug!("parameter {} set to {:?}", name, values);
        for &position in positions {
            self.bindings[position] = ParameterBinding {
                values: values.clone(),
                value_was_set: true,
            };
        }
        Ok(())
    }

    /// Binds the `position`-th unnamed parameter.
    pub fn set_unnamed_values<I, S>(&mut self, position: usize, values: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let index = *self.unnamed.get(position).ok_or_else(|| {
            FilterError::UnknownParameter(format!("{}[{}]", UNNAMED_PARAMETER, position))
        })?;
        self.bindings[index] = ParameterBinding {
            values: values.into_iter().map(Into::into).collect(),
            value_was_set: true,
        };
        Ok(())
    }

    pub fn clear_values(&mut self, name: &str) {
        if let Some(positions) = self.named.get(normalize_name(name)) {
            for &position in positions {
                self.bindings[position] = ParameterBinding::default();
            }
        }
    }

    /// First set binding of the named group.
    pub fn binding(&self, name: &str) -> Option<&ParameterBinding> {
        self.named
            .get(normalize_name(name))?
            .iter()
            .map(|&p| &self.bindings[p])
            .find(|b| b.value_was_set)
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.binding(name).is_some()
    }

    pub fn unbound_names(&self) -> Vec<&str> {
        self.names().filter(|name| !self.is_bound(name)).collect()
    }

    /// Provider for every bound parameter.
    pub fn replacement(&self) -> ParameterReplacement<'_> {
        ParameterReplacement {
            parameters: self,
            only: None,
        }
    }

    /// Provider restricted to one named group; other placeholders stay unbound.
    pub fn replacement_for<'a>(&'a self, name: &'a str) -> ParameterReplacement<'a> {
        ParameterReplacement {
            parameters: self,
            only: Some(normalize_name(name)),
        }
    }

    fn binding_at(&self, position: usize) -> Option<&ParameterBinding> {
        Some(&self.bindings[position]).filter(|b| b.value_was_set)
    }
}

fn normalize_name(name: &str) -> &str {
    name.strip_prefix(PLACEHOLDER_PREFIX).unwrap_or(name)
}

/// Resolves placeholders from the bindings of a [`FilterParameters`].
/// Named references are looked up by token, unnamed ones by their slot.
pub struct ParameterReplacement<'a> {
    parameters: &'a FilterParameters,
    only: Option<&'a str>,
}

impl ParameterReplacement<'_> {
    fn allows(&self, name: &str) -> bool {
        self.only.map_or(true, |only| only == name)
    }

    fn bound(binding: Option<&ParameterBinding>) -> Replacement {
        match binding {
            Some(binding) => Replacement::Values(binding.values.clone()),
            None => Replacement::Unbound,
        }
    }
}

impl ReplacementProvider for ParameterReplacement<'_> {
    fn replacement(&self, placeholder: &str) -> Replacement {
        let name = normalize_name(placeholder);
        if placeholder == UNNAMED_PARAMETER || !self.allows(name) {
            return Replacement::Unbound;
        }
        Self::bound(self.parameters.binding(name))
    }

    fn replacement_at(&self, placeholder: &str, site: ValueSite<'_>) -> Replacement {
        let params = self.parameters;
        if placeholder == UNNAMED_PARAMETER {
            if self.only.is_some() {
                return Replacement::Unbound;
            }
            let slot = params
                .unnamed
                .iter()
                .copied()
                .find(|&p| params.parameters[p].occupies(&site));
            return Self::bound(slot.and_then(|p| params.binding_at(p)));
        }

        let name = normalize_name(placeholder);
        if !self.allows(name) {
            return Replacement::Unbound;
        }
        // a slot-specific binding wins over the group's first binding
        let slot = params.named.get(name).and_then(|positions| {
            positions
                .iter()
                .copied()
                .find(|&p| params.parameters[p].occupies(&site))
        });
        match slot.and_then(|p| params.binding_at(p)) {
            Some(binding) => Self::bound(Some(binding)),
            None => Self::bound(params.binding(name)),
        }
    }
}

impl TableNode {
    /// Collects every `$par...` value of this tree into `parameters`.
    pub fn add_parameters(self: &Arc<Self>, parameters: &mut FilterParameters) {
        if let Some(condition) = self.condition() {
            condition.for_each_leaf(&mut |leaf: &Arc<ConditionNode>| {
                for (index, value) in leaf.field_values().iter().enumerate() {
                    if is_parameter(value) {
                        parameters.add(FilterParameter::new(
                            value,
                            Arc::clone(self),
                            Arc::clone(leaf),
                            index,
                        ));
                    }
                }
            });
        }
        for sub in self.sub_tables() {
            sub.add_parameters(parameters);
        }
    }
}
